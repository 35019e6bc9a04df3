//! Submission of remote firmware builds.
//!
//! A build is one execution of a job on the job-execution platform, with the
//! build parameters passed as environment variable overrides and optional
//! positional arguments. Submission is fire-and-forget: a successful dispatch
//! only means the request was accepted. The outcome of the build is reported
//! through the build log (see [`change_stream`](crate::change_stream)).
//!
//! Two equivalent strategies are provided:
//!
//! * [`CloudRunApi`] calls the platform REST API with a bearer token,
//! * [`GcloudCli`] drives the `gcloud` tool after activating the service
//!   account.
//!
//! Neither retries.

use std::{collections::BTreeMap, path::PathBuf, process::Command};

use log::{debug, info};
use serde::Serialize;

use crate::{
    auth::{self, TokenSource},
    error::DispatchError,
    settings::ServiceIdentity,
};

// =============================================================================
// Public Interface
// =============================================================================

/// One remote build request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildRequest {
    pub service: ServiceIdentity,
    /// Environment variable overrides for the build.
    pub parameters: BTreeMap<String, String>,
    /// Positional arguments, in order.
    pub args: Vec<String>,
}
impl BuildRequest {
    /// `KEY=VALUE` pairs joined with commas, as expected by `--update-env-vars`.
    pub fn env_vars(&self) -> String {
        self.parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Submits build requests to the job-execution service.
pub trait JobDispatcher: Send + Sync {
    /// Returns once the service accepted (or refused) the request.
    fn dispatch(&self, request: &BuildRequest) -> Result<(), DispatchError>;
}

// GcloudCli ===================================================================

/// Dispatches builds with `gcloud run jobs execute`.
pub struct GcloudCli {
    credentials: PathBuf,
}
impl GcloudCli {
    pub fn new(credentials: impl Into<PathBuf>) -> Self {
        GcloudCli {
            credentials: credentials.into(),
        }
    }

    /// The arguments of the `gcloud` invocation submitting `request`.
    pub fn execute_args(request: &BuildRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "jobs".into(),
            "execute".into(),
            request.service.job_name.clone(),
            format!("--project={}", request.service.project),
            format!("--region={}", request.service.region),
            format!("--update-env-vars={}", request.env_vars()),
        ];
        if !request.args.is_empty() {
            args.push(format!("--args={}", request.args.join(",")));
        }
        args
    }
}
impl JobDispatcher for GcloudCli {
    fn dispatch(&self, request: &BuildRequest) -> Result<(), DispatchError> {
        auth::activate_service_account(&self.credentials)?;

        let args = Self::execute_args(request);
        info!("Running gcloud {}", args.join(" "));
        let output = Command::new("gcloud")
            .args(&args)
            .output()
            .map_err(|source| crate::error::AuthError::Spawn {
                command: "gcloud run jobs execute".into(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            return Err(DispatchError::Rejected(stderr));
        }
        debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}

// CloudRunApi =================================================================

/// Dispatches builds through the Cloud Run Admin API (`jobs.run`).
pub struct CloudRunApi<T: TokenSource> {
    client: reqwest::blocking::Client,
    tokens: T,
    endpoint: String,
}
impl<T: TokenSource> CloudRunApi<T> {
    pub fn new(tokens: T) -> Self {
        Self::with_endpoint(tokens, "https://run.googleapis.com")
    }

    /// Use another API root, e.g. a regional endpoint or a local emulator.
    pub fn with_endpoint(tokens: T, endpoint: impl Into<String>) -> Self {
        CloudRunApi {
            client: reqwest::blocking::Client::new(),
            tokens,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
        }
    }

    fn run_url(&self, service: &ServiceIdentity) -> String {
        format!(
            "{}/v2/projects/{}/locations/{}/jobs/{}:run",
            self.endpoint, service.project, service.region, service.job_name
        )
    }
}
impl<T: TokenSource> JobDispatcher for CloudRunApi<T> {
    fn dispatch(&self, request: &BuildRequest) -> Result<(), DispatchError> {
        let token = self.tokens.token()?;
        let url = self.run_url(&request.service);
        info!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&RunJobBody::from(request))
            .send()
            .map_err(DispatchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DispatchError::Rejected(format!("HTTP {}: {}", status, body.trim())));
        }
        Ok(())
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Serialize)]
struct RunJobBody {
    overrides: Overrides,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Overrides {
    container_overrides: Vec<ContainerOverride>,
}

#[derive(Debug, Serialize)]
struct ContainerOverride {
    env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

impl From<&BuildRequest> for RunJobBody {
    fn from(request: &BuildRequest) -> Self {
        RunJobBody {
            overrides: Overrides {
                container_overrides: vec![ContainerOverride {
                    env: request
                        .parameters
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                    args: request.args.clone(),
                }],
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

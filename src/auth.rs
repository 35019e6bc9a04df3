//! Bearer tokens for the cloud services, minted from the service account
//! credential.

use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::error::AuthError;

/// Source of OAuth2 bearer tokens.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Result<String, AuthError>;
}

impl<T: TokenSource + ?Sized> TokenSource for Arc<T> {
    fn token(&self) -> Result<String, AuthError> {
        (**self).token()
    }
}

/// A token obtained out of band, e.g. from `GOOGLE_OAUTH_ACCESS_TOKEN`.
#[derive(Clone)]
pub struct StaticToken(String);
impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken(token.into())
    }
}
impl TokenSource for StaticToken {
    fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Mints tokens with the `gcloud` tool after activating the service account
/// key file (once per process, retried until it succeeds).
pub struct GcloudToken {
    credentials: PathBuf,
    activated: Mutex<bool>,
}
impl GcloudToken {
    pub fn new(credentials: impl Into<PathBuf>) -> Self {
        GcloudToken {
            credentials: credentials.into(),
            activated: Mutex::new(false),
        }
    }
}
impl TokenSource for GcloudToken {
    fn token(&self) -> Result<String, AuthError> {
        {
            let mut activated = self.activated.lock().unwrap_or_else(|e| e.into_inner());
            if !*activated {
                activate_service_account(&self.credentials)?;
                *activated = true;
            }
        }
        let token = gcloud(&["auth", "print-access-token"])?;
        Ok(token.trim().to_owned())
    }
}

/// `gcloud auth activate-service-account --key-file=<credentials>`
pub fn activate_service_account(credentials: &Path) -> Result<(), AuthError> {
    if !credentials.is_file() {
        return Err(AuthError::MissingCredentials(credentials.to_path_buf()));
    }
    let key_file = format!("--key-file={}", credentials.display());
    gcloud(&["auth", "activate-service-account", &key_file]).map(|_| ())
}

/// Run `gcloud` with `args`, returning its standard output.
pub(crate) fn gcloud(args: &[&str]) -> Result<String, AuthError> {
    let command = format!("gcloud {}", args.join(" "));
    debug!("running {}", command);
    let output = Command::new("gcloud")
        .args(args)
        .output()
        .map_err(|source| AuthError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(AuthError::Command {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[test]
fn missing_key_file_is_reported() {
    let result = activate_service_account(Path::new("/nonexistent/credentials.json"));
    assert!(matches!(result, Err(AuthError::MissingCredentials(_))));
}

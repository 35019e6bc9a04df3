//! The provisioning data model: jobs, their identities and the status events
//! reported by the remote build.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Public Interface
// =============================================================================

// JobKind =====================================================================

/// The type of a provisioning job. At most one job of each kind may be in
/// flight at any time.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Builds the firmware with the operator's parameters and writes the
    /// application image only.
    Params,
    /// Builds the serial number firmware and rewrites the full flash layout
    /// (bootloader, partition table, application).
    SetSerial,
}
impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Params, JobKind::SetSerial];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Params => "params",
            JobKind::SetSerial => "set_serial",
        }
    }
}
impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "params" => Ok(JobKind::Params),
            "set_serial" | "set-serial" => Ok(JobKind::SetSerial),
            other => Err(format!("unknown job kind `{}`", other)),
        }
    }
}

// JobId =======================================================================

/// The run identifier of a job. Every artifact and remote log location of a
/// run is namespaced by it.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(String);
impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    /// A fresh random run identifier.
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// DeviceIdentity ==============================================================

/// The identity read from a device during the serial handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub read_at: DateTime<Utc>,
}
impl DeviceIdentity {
    pub fn new(serial_number: impl Into<String>) -> Self {
        DeviceIdentity {
            serial_number: serial_number.into(),
            read_at: Utc::now(),
        }
    }
}

// Job =========================================================================

/// One provisioning attempt of a given kind for a given device and run.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub owner: String,
    pub target_serial: String,
    /// The serial port the device is attached to.
    pub port: String,
    pub created_at: DateTime<Utc>,
}
impl Job {
    pub fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey {
            kind: self.kind,
            target_serial: self.target_serial.clone(),
            owner: self.owner.clone(),
            run_id: self.id.clone(),
        }
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            kind: self.kind,
            job_id: self.id.clone(),
            port: self.port.clone(),
        }
    }
}

// SubscriptionKey =============================================================

/// At most one listener may be active per key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionKey {
    pub kind: JobKind,
    pub target_serial: String,
    pub owner: String,
    pub run_id: JobId,
}
impl SubscriptionKey {
    /// The remote document holding the build log of this run.
    pub fn log_location(&self) -> String {
        format!("logs/{}/{}/{}", self.target_serial, self.owner, self.run_id)
    }
}

// JobContext ==================================================================

/// Context handed to the change stream when subscribing and handed back
/// unchanged with every delivery.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobContext {
    pub kind: JobKind,
    pub job_id: JobId,
    pub port: String,
}

/// One change delivered by a change stream listener.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub context: JobContext,
    pub event: JobStatusEvent,
}

// JobStatusEvent ==============================================================

/// A status change of the remote build log document.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusEvent {
    pub status: String,
    pub message: Option<String>,
    pub artifact_locator: Option<String>,
    pub raw_payload: Value,
    pub observed_at: DateTime<Utc>,
}

/// How the job state machine reacts to a remote status.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BuildOutcome {
    Completed,
    Failed,
    Progress,
}

impl JobStatusEvent {
    /// Parse a log document of the form `{status, message?, path|binary_path?,
    /// timestamp}`. A missing status is reported as `unknown`.
    pub fn from_payload(payload: Value) -> Self {
        let text = |field: &str| {
            payload
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        JobStatusEvent {
            status: text("status").unwrap_or_else(|| "unknown".into()),
            message: text("message"),
            artifact_locator: text("path").or_else(|| text("binary_path")),
            observed_at: Utc::now(),
            raw_payload: payload,
        }
    }

    pub fn outcome(&self) -> BuildOutcome {
        match self.status.as_str() {
            "completed" => BuildOutcome::Completed,
            "failed" | "auth_failed" | "blocked" | "error" => BuildOutcome::Failed,
            _ => BuildOutcome::Progress,
        }
    }
}

// JobPhase / StatusUpdate =====================================================

/// The externally visible phase of the job state machine of one job kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobPhase {
    Idle,
    Dispatching,
    RemoteBuilding,
    Provisioning,
    Finalized,
    Error,
}
impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Finalized | JobPhase::Error)
    }
}

/// Pushed to observers on every status assignment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatusUpdate {
    pub kind: JobKind,
    pub phase: JobPhase,
    pub status: String,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_completed_document() {
        let event = JobStatusEvent::from_payload(json!({
            "status": "completed",
            "path": "gs://bkt/obj.bin",
            "timestamp": "2024-11-02T10:00:00Z",
        }));
        assert_eq!(event.status, "completed");
        assert_eq!(event.artifact_locator.as_deref(), Some("gs://bkt/obj.bin"));
        assert_eq!(event.message, None);
        assert_eq!(event.outcome(), BuildOutcome::Completed);
    }

    #[test]
    fn binary_path_is_an_artifact_locator() {
        let event = JobStatusEvent::from_payload(json!({
            "status": "completed",
            "binary_path": "bkt/fw.bin",
        }));
        assert_eq!(event.artifact_locator.as_deref(), Some("bkt/fw.bin"));
    }

    #[test]
    fn classifies_failures() {
        for status in &["failed", "auth_failed", "blocked", "error"] {
            let event = JobStatusEvent::from_payload(json!({ "status": status }));
            assert_eq!(event.outcome(), BuildOutcome::Failed, "{}", status);
        }
    }

    #[test]
    fn anything_else_is_progress() {
        let event = JobStatusEvent::from_payload(json!({ "status": "compiling" }));
        assert_eq!(event.outcome(), BuildOutcome::Progress);
        let event = JobStatusEvent::from_payload(json!({ "message": "no status" }));
        assert_eq!(event.status, "unknown");
        assert_eq!(event.outcome(), BuildOutcome::Progress);
    }

    #[test]
    fn log_location_is_namespaced_by_run() {
        let key = SubscriptionKey {
            kind: JobKind::Params,
            target_serial: "000006".into(),
            owner: "uid-1".into(),
            run_id: JobId::new("run-9"),
        };
        assert_eq!(key.log_location(), "logs/000006/uid-1/run-9");
    }

    #[test]
    fn job_kind_round_trips_through_str() {
        for kind in JobKind::ALL.iter() {
            assert_eq!(kind.as_str().parse::<JobKind>(), Ok(*kind));
        }
        assert!("reset".parse::<JobKind>().is_err());
    }
}

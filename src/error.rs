//! Typed errors for the provisioning pipeline.
//!
//! Each collaborator has its own error enum. [`ProvisionError`] is what a
//! caller of [`Provisioner::execute`](crate::Provisioner::execute) gets back
//! for failures discovered synchronously. Failures discovered later (remote
//! build, download, flash) only travel through the status broadcast.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::job::JobKind;

/// Errors raised while reading the serial number from a device.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to reset the device: {0}")]
    Reset(#[source] io::Error),

    #[error("failed to read from the device: {0}")]
    Read(#[source] io::Error),
}

/// Errors from obtaining a bearer token for the cloud services.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential file not found: {0}")]
    MissingCredentials(PathBuf),

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Errors from submitting a remote build request.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("build service unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("build request rejected: {0}")]
    Rejected(String),
}

/// Errors from attaching a listener to a remote build log.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to start listener for {location}: {source}")]
    Listener {
        location: String,
        #[source]
        source: io::Error,
    },
}

/// Errors from retrieving a firmware artifact.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("completed build did not report an artifact location")]
    MissingLocator,

    #[error("invalid artifact location `{0}`")]
    InvalidLocator(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("artifact download failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("artifact {object} not available: HTTP {status}")]
    Status { object: String, status: u16 },

    #[error("failed to write artifact to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from writing images to the device.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("failed to run the flashing tool: {0}")]
    Spawn(#[source] io::Error),

    #[error("flashing failed with code {code}")]
    Failed { code: i32 },
}

/// Errors from one attempt of the artifact and flash pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Flash(#[from] FlashError),
}

/// Failures reported synchronously to the initiator of a provisioning job.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("a {0} job is already in progress")]
    ConcurrencyConflict(JobKind),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("failed to start job worker: {0}")]
    Worker(#[source] io::Error),
}

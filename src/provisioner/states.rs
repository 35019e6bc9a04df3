//! States for the job state machine.
//!
//! This modules is private and restricted to the
//! [`provisioner`](crate::provisioner) scope. The public interface of the state
//! machine is provided by [`provisioner`](crate::provisioner).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::{
    collections::BTreeMap,
    fmt,
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Instant,
};

use log::{debug, info, warn};

use super::{events::*, state_machine::Machinery};
use crate::{
    artifact::{ArtifactLocator, FlashMode, PipelineStep},
    dispatch::BuildRequest,
    error::{DownloadError, ProvisionError},
    job::{BuildOutcome, Delivery, Job, JobKind, JobPhase, JobStatusEvent},
};

pub(crate) const COMPILING: &str = "Compiling firmware...";
pub(crate) const COMPLETED: &str = "completed";
pub(crate) const DOWNLOADING: &str = "Downloading binary...";
pub(crate) const PROGRAMMING: &str = "Programming device...";
pub(crate) const FINALIZED: &str = "Finalized";

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state does its work for `job` and when finished,
    /// requests a transition to a `new state` by returning the appropriate
    /// `event`. The `event` is then consumed to create the `new state` using
    /// the corresponding [`From`] trait implementation.
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event;
}

/// The flash layout written for each job kind.
pub(crate) fn flash_mode(kind: JobKind) -> FlashMode {
    match kind {
        JobKind::Params => FlashMode::Application,
        JobKind::SetSerial => FlashMode::Full,
    }
}

// Dispatching State ===========================================================

/// The initial state of a job, entered once the guard of its kind has been
/// taken.
///
/// From the `DispatchingState`, the state machine can evolve via the following
/// transitions:
///
///  * **[`BuildAcceptedEvent`] => [`RemoteBuildingState`]** when the build
///    request was accepted and the build log is being listened to,
///  * **[`RejectedEvent`] => [`ErrorState`]** when the build service refused
///    the request or the listener could not be attached.
#[derive(Debug)]
pub(crate) struct DispatchingState {
    pub parameters: BTreeMap<String, String>,
}
impl Runnable for DispatchingState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!("=> Dispatching");
        machinery
            .board
            .set(job.kind, JobPhase::Dispatching, COMPILING);

        let request = BuildRequest {
            service: machinery.settings.service.clone(),
            parameters: build_parameters(job, &self.parameters),
            args: machinery.settings.build_args.clone(),
        };
        if let Err(e) = machinery.dispatcher.dispatch(&request) {
            return Event::Rejected(RejectedEvent {
                job: job.clone(),
                error: e.into(),
            });
        }

        let (sink, inbox) = mpsc::channel();
        let key = job.subscription_key();
        if let Err(e) = machinery.subscriber.attach(&key, job.context(), sink) {
            return Event::Rejected(RejectedEvent {
                job: job.clone(),
                error: e.into(),
            });
        }
        machinery.board.set_subscription(job.kind, Some(key));

        Event::BuildAccepted(BuildAcceptedEvent {
            job: job.clone(),
            inbox,
        })
    }
}

// RemoteBuilding State ========================================================

/// A `state` where the job waits for the build log to report the outcome of
/// the remote build. Intermediate statuses are only displayed.
///
///  * **[`BuildCompletedEvent`] => [`ProvisioningState`]** when the build log
///    reports `completed`,
///  * **[`FailedEvent`] => [`ErrorState`]** when the build log reports a
///    failure, the listener goes away, or the optional build timeout expires.
pub(crate) struct RemoteBuildingState {
    /// Consumed when the state runs.
    pub inbox: Option<Receiver<Delivery>>,
}
impl Runnable for RemoteBuildingState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!("=> RemoteBuilding");
        let failed = |cause: String| {
            Event::Failed(FailedEvent {
                job: job.clone(),
                cause,
            })
        };

        let inbox = match self.inbox.take() {
            Some(inbox) => inbox,
            None => return failed("build log listener missing".into()),
        };
        machinery
            .board
            .set(job.kind, JobPhase::RemoteBuilding, COMPILING);
        let deadline = machinery.settings.build_timeout.map(|t| Instant::now() + t);

        loop {
            let received = match deadline {
                Some(deadline) => {
                    inbox.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let delivery = match received {
                Ok(delivery) => delivery,
                Err(RecvTimeoutError::Timeout) => {
                    return failed(format!(
                        "no build result within {:?}",
                        machinery.settings.build_timeout.unwrap_or_default()
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return failed("build log listener closed".into())
                }
            };
            if delivery.context.job_id != job.id {
                warn!("ignoring delivery for job {}", delivery.context.job_id);
                continue;
            }

            let event = delivery.event;
            debug!("build status {} ({:?})", event.status, event.message);
            match event.outcome() {
                BuildOutcome::Progress => {
                    machinery
                        .board
                        .set(job.kind, JobPhase::RemoteBuilding, display(&event));
                }
                BuildOutcome::Failed => return failed(failure_cause(&event)),
                BuildOutcome::Completed => {
                    machinery
                        .board
                        .set(job.kind, JobPhase::RemoteBuilding, COMPLETED);
                    let locator = match event.artifact_locator.as_deref() {
                        Some(locator) => locator.parse::<ArtifactLocator>(),
                        None => Err(DownloadError::MissingLocator),
                    };
                    return match locator {
                        Ok(locator) => Event::BuildCompleted(BuildCompletedEvent {
                            job: job.clone(),
                            locator,
                        }),
                        Err(e) => failed(e.to_string()),
                    };
                }
            }
        }
    }
}
impl fmt::Debug for RemoteBuildingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBuildingState")
            .field("listening", &self.inbox.is_some())
            .finish()
    }
}

// Provisioning State ==========================================================

/// A `state` where the artifact of the build is downloaded and flashed onto
/// the device.
///
///  * **[`FlashedEvent`] => [`FinalizedState`]** when the device was flashed,
///  * **[`FailedEvent`] => [`ErrorState`]** when downloading or flashing
///    failed.
#[derive(Debug)]
pub(crate) struct ProvisioningState {
    pub locator: ArtifactLocator,
}
impl Runnable for ProvisioningState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!("=> Provisioning");
        let board = &machinery.board;
        let mut progress = |step: PipelineStep| {
            let status = match step {
                PipelineStep::Downloading => DOWNLOADING,
                PipelineStep::Flashing => PROGRAMMING,
            };
            board.set(job.kind, JobPhase::Provisioning, status);
        };

        match machinery.pipeline.run(
            &self.locator,
            job.kind,
            &job.id,
            &job.port,
            flash_mode(job.kind),
            &mut progress,
        ) {
            Ok(()) => Event::Flashed(FlashedEvent { job: job.clone() }),
            Err(e) => Event::Failed(FailedEvent {
                job: job.clone(),
                cause: e.to_string(),
            }),
        }
    }
}

// Finalized State =============================================================

/// Reached when the device has been provisioned. Stops listening to the build
/// log and releases the guard through [`ReleaseEvent`].
#[derive(Debug)]
pub(crate) struct FinalizedState {}
impl Runnable for FinalizedState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!("=> Finalized");
        machinery
            .board
            .set(job.kind, JobPhase::Finalized, FINALIZED);
        machinery.subscriber.cancel(&job.subscription_key());
        Event::Release(ReleaseEvent {
            job: job.clone(),
            with_error: false,
        })
    }
}

// Error State =================================================================

/// Reached when the job failed at any step. Publishes the cause, stops
/// listening to the build log and releases the guard through
/// [`ReleaseEvent`].
#[derive(Debug)]
pub(crate) struct ErrorState {
    pub cause: String,
    /// Set when the failure happened while dispatching, for the caller.
    pub rejection: Option<ProvisionError>,
}
impl Runnable for ErrorState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!("=> Error: {}", self.cause);
        machinery
            .board
            .set(job.kind, JobPhase::Error, format!("Error: {}", self.cause));
        machinery.subscriber.cancel(&job.subscription_key());
        Event::Release(ReleaseEvent {
            job: job.clone(),
            with_error: true,
        })
    }
}

// Idle State ==================================================================

/// Reached after a terminal state. This state goes into a 2-phase execution:
/// it first releases the guard of the job kind, then triggers the
/// [`ExitEvent`] so that the job driver stops.
#[derive(Debug, Copy, Clone)]
pub(crate) struct IdleState {
    pub with_error: bool,
    pub should_exit: bool,
}
impl Runnable for IdleState {
    fn run(&mut self, job: &Job, machinery: &Machinery) -> Event {
        info!(
            "=> Idle after job {} with{}errors",
            job.id,
            if self.with_error { " " } else { " no " }
        );
        machinery.board.release(job.kind);
        Event::Exit(ExitEvent {
            job: job.clone(),
            with_error: self.with_error,
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The build parameters: the caller's, plus the job identity the build uses to
/// name its log and artifact.
fn build_parameters(job: &Job, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut parameters = extra.clone();
    parameters.insert("USER".into(), job.owner.clone());
    parameters.insert("UUID".into(), job.id.to_string());
    parameters.insert("SERIAL".into(), job.target_serial.clone());
    parameters.insert("JOB_TYPE".into(), job.kind.to_string());
    parameters
}

fn display(event: &JobStatusEvent) -> String {
    match event.status.as_str() {
        "success" => "Success".into(),
        _ => event.status.clone(),
    }
}

fn failure_cause(event: &JobStatusEvent) -> String {
    match &event.message {
        Some(message) => format!("build {}: {}", event.status, message),
        None => format!("build {}", event.status),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

//! Events for the job state machine.
//!
//! This modules is private and restricted to the
//! [`provisioner`](crate::provisioner) scope. The public interface of the state
//! machine is provided by [`provisioner`](crate::provisioner).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::{fmt, sync::mpsc::Receiver};

use crate::{
    artifact::ArtifactLocator,
    error::ProvisionError,
    job::{Delivery, Job},
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// BuildAcceptedEvent ==========================================================

/// Event fired to trigger a transition to the `RemoteBuilding` state, once the
/// build service accepted the request and a listener is attached to the build
/// log.
pub(crate) struct BuildAcceptedEvent {
    pub job: Job,
    /// Deliveries of the build log listener. Consumed and moved to the next
    /// state.
    pub inbox: Receiver<Delivery>,
}
impl fmt::Debug for BuildAcceptedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildAcceptedEvent")
            .field("job", &self.job.id)
            .finish()
    }
}

// RejectedEvent ===============================================================

/// Event fired while `Dispatching` when the build could not be submitted or
/// its log could not be listened to. Triggers a transition to the `Error`
/// state. The error is handed back to the caller of the dispatch.
#[derive(Debug)]
pub(crate) struct RejectedEvent {
    pub job: Job,
    pub error: ProvisionError,
}

// BuildCompletedEvent =========================================================

/// Event fired when the build log reports `completed`. Triggers a transition
/// to the `Provisioning` state.
#[derive(Debug)]
pub(crate) struct BuildCompletedEvent {
    pub job: Job,
    pub locator: ArtifactLocator,
}

// FailedEvent =================================================================

/// Event fired when the job cannot succeed any more:
///
///  1. The build log reports a failure status.
///  2. The build log listener went away or the build timed out.
///  3. Downloading or flashing the artifact failed.
#[derive(Debug)]
pub(crate) struct FailedEvent {
    pub job: Job,
    pub cause: String,
}

// FlashedEvent ================================================================

/// Event fired when the device has been flashed. Triggers a transition to the
/// `Finalized` state.
#[derive(Debug)]
pub(crate) struct FlashedEvent {
    pub job: Job,
}

// ReleaseEvent ================================================================

/// Event fired by the terminal states once they are done, transitioning to
/// `Idle` which releases the guard.
#[derive(Debug)]
pub(crate) struct ReleaseEvent {
    pub job: Job,
    pub with_error: bool,
}

// ExitEvent ===================================================================

/// The last event of a job. The job driver stops once the guard has been
/// released.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub job: Job,
    pub with_error: bool,
}

// Events enum ==================================================================

/// Events that can be triggered within the job state machine.
///
/// Each possible value holds an `event`, which in turn may hold additional data
/// for the state transition. Such data is passed by the origin state for
/// potential use by the target state.
#[derive(Debug)]
pub(crate) enum Event {
    BuildAccepted(BuildAcceptedEvent),
    Rejected(RejectedEvent),
    BuildCompleted(BuildCompletedEvent),
    Failed(FailedEvent),
    Flashed(FlashedEvent),
    Release(ReleaseEvent),
    Exit(ExitEvent),
}

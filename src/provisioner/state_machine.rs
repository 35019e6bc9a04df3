//! The job state machine driving one provisioning job from the build request
//! to the flashed device.
//!
//! One state machine instance runs per admitted job. The guard of its job kind
//! is taken before it starts and released when it reaches `Idle` again, so at
//! most one job of each kind is in flight. Jobs of different kinds run side by
//! side.
//!
//! The following state diagram summarizes the different states and transitions
//! a job goes through:
//!
//! ```text
//!                              request
//!                                 |
//!                          guard taken?--- no ---> ConcurrencyConflict
//!                                 |
//!                                 v
//!                         .-------------.  rejected
//!                         | Dispatching |-----------------------.
//!                         '-------------'                       |
//!                                 | accepted                    |
//!    - - - - - - - - - - - - - - -|- - - - - - - - - - - - - -  |  worker
//!                                 v                             |  thread
//!         progress        .----------------.   failed           v
//!        .--------------->| RemoteBuilding |-------------->.-------.
//!        '----------------'----------------'               | Error |
//!                                 | completed              '-------'
//!                                 v                            ^   |
//!                         .--------------.  download/flash     |   |
//!                         | Provisioning |---------------------'   |
//!                         '--------------'       failure           |
//!                                 | flashed                        |
//!                                 v                                |
//!                          .-----------.                           |
//!                          | Finalized |                           |
//!                          '-----------'                           |
//!                                 |        guard released          |
//!                                 '-------------> Idle <-----------'
//! ```
//!
//! `Dispatching` runs on the caller's thread so that a rejected build request
//! is reported to the caller. Everything after it runs on a dedicated worker
//! thread which reacts to the build log deliveries one at a time.

use std::{collections::BTreeMap, sync::mpsc::Receiver, sync::Arc, thread};

use chrono::Utc;
use log::{error, info};

use super::{
    board::{Refusal, StatusBoard},
    events::*,
    states::*,
};
use crate::{
    artifact::{ArtifactStore, FlashPipeline, Flasher},
    change_stream::{ChangeStream, Subscriber},
    dispatch::JobDispatcher,
    error::ProvisionError,
    job::{Job, JobId, JobKind, JobPhase, StatusUpdate},
    settings::Settings,
};

// =============================================================================
// Public Interface
// =============================================================================

/// A request to provision one device.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    /// The operator starting the job.
    pub owner: String,
    /// The serial number read from the device.
    pub target_serial: String,
    /// The serial port the device is attached to.
    pub port: String,
    /// A run identifier chosen by the caller. Generated when absent.
    pub run_id: Option<JobId>,
    /// Extra build parameters, passed to the build as environment variables.
    pub parameters: BTreeMap<String, String>,
}

/// Front of the provisioning pipeline. Admits jobs, runs them, and exposes the
/// latest status of each job kind.
///
/// Cloning gives another handle on the same pipeline.
#[derive(Clone)]
pub struct Provisioner {
    machinery: Arc<Machinery>,
}
impl Provisioner {
    pub fn new(
        settings: Settings,
        dispatcher: Arc<dyn JobDispatcher>,
        stream: Arc<dyn ChangeStream>,
        store: Arc<dyn ArtifactStore>,
        flasher: Arc<dyn Flasher>,
    ) -> Self {
        let pipeline = FlashPipeline::new(store, flasher, settings.staging_root.clone());
        Provisioner {
            machinery: Arc::new(Machinery {
                settings,
                board: StatusBoard::default(),
                subscriber: Subscriber::new(stream),
                dispatcher,
                pipeline,
            }),
        }
    }

    /// Submit the build for `request` and start following it.
    ///
    /// Returns the run identifier once the build service accepted the request.
    /// The outcome of the job is only reported through [`status`](Self::status)
    /// and [`watch`](Self::watch).
    pub fn execute(&self, request: JobRequest) -> Result<JobId, ProvisionError> {
        for (name, value) in &[
            ("port", &request.port),
            ("owner", &request.owner),
            ("target serial", &request.target_serial),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::InvalidRequest(format!("missing {}", name)));
            }
        }
        if let Some(run_id) = &request.run_id {
            if run_id.as_str().trim().is_empty() {
                return Err(ProvisionError::InvalidRequest("blank run id".into()));
            }
        }

        let job = Job {
            id: request.run_id.unwrap_or_else(JobId::generate),
            kind: request.kind,
            owner: request.owner,
            target_serial: request.target_serial,
            port: request.port,
            created_at: Utc::now(),
        };
        let machinery = &self.machinery;
        match machinery.board.try_admit(job.kind, &job.id) {
            Ok(()) => {}
            Err(Refusal::Busy) => return Err(ProvisionError::ConcurrencyConflict(job.kind)),
            Err(Refusal::RunInUse(other)) => {
                return Err(ProvisionError::InvalidRequest(format!(
                    "run id {} already used by the {} job in progress",
                    job.id, other
                )))
            }
        }

        let id = job.id.clone();
        let unwind = ReleaseOnUnwind {
            kind: job.kind,
            machinery: machinery.as_ref(),
        };
        let mut sm = JobStates::Dispatching(JobSM {
            job,
            state: DispatchingState {
                parameters: request.parameters,
            },
        });
        sm = sm.step(machinery);
        drop(unwind);

        match sm {
            JobStates::RemoteBuilding(building) => {
                let kind = building.job.kind;
                let worker = Arc::clone(machinery);
                let spawned = thread::Builder::new()
                    .name(format!("job-{}", id))
                    .spawn(move || drive(JobStates::RemoteBuilding(building), &worker));
                if let Err(e) = spawned {
                    error!("failed to start worker for job {}: {}", id, e);
                    if let Some(key) = machinery.board.subscription(kind) {
                        machinery.subscriber.cancel(&key);
                    }
                    machinery
                        .board
                        .set(kind, JobPhase::Error, format!("Error: {}", e));
                    machinery.board.release(kind);
                    return Err(ProvisionError::Worker(e));
                }
                Ok(id)
            }
            JobStates::Error(mut failed) => {
                let rejection = failed.state.rejection.take();
                drive(JobStates::Error(failed), machinery);
                Err(rejection.unwrap_or_else(|| {
                    ProvisionError::InvalidRequest("job rejected while dispatching".into())
                }))
            }
            other => unreachable!("illegal state {:#?} after dispatching", other),
        }
    }

    /// The latest status string of `kind`.
    pub fn status(&self, kind: JobKind) -> String {
        self.machinery.board.status(kind)
    }

    pub fn phase(&self, kind: JobKind) -> JobPhase {
        self.machinery.board.phase(kind)
    }

    /// Whether a job of `kind` currently holds the guard.
    pub fn is_in_progress(&self, kind: JobKind) -> bool {
        self.machinery.board.is_in_progress(kind)
    }

    /// The run identifier of the job of `kind` in flight, if any.
    pub fn current_job(&self, kind: JobKind) -> Option<JobId> {
        self.machinery.board.current_job(kind)
    }

    /// Receive every status assignment from now on.
    pub fn watch(&self) -> Receiver<StatusUpdate> {
        self.machinery.board.watch()
    }

    pub fn settings(&self) -> &Settings {
        &self.machinery.settings
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// What the job states work with, shared by all jobs.
pub(crate) struct Machinery {
    pub settings: Settings,
    pub board: StatusBoard,
    pub subscriber: Subscriber,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub pipeline: FlashPipeline,
}

// =============================================================================
// Private stuff
// =============================================================================

/// Run the state machine until the job is back to `Idle`.
fn drive(mut sm: JobStates, machinery: &Machinery) {
    let _unwind = ReleaseOnUnwind {
        kind: sm.job().kind,
        machinery,
    };
    loop {
        sm = sm.step(machinery);
        if let JobStates::Idle(idle) = &sm {
            if idle.state.should_exit {
                info!(
                    "job {} done with{}errors",
                    idle.job.id,
                    if idle.state.with_error { " " } else { " no " }
                );
                return;
            }
        }
    }
}

/// Keeps a panicking job from holding its guard forever.
struct ReleaseOnUnwind<'a> {
    kind: JobKind,
    machinery: &'a Machinery,
}
impl Drop for ReleaseOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("{} job panicked", self.kind);
            if let Some(key) = self.machinery.board.subscription(self.kind) {
                self.machinery.subscriber.cancel(&key);
            }
            self.machinery
                .board
                .set(self.kind, JobPhase::Error, "Error: internal failure");
            self.machinery.board.release(self.kind);
        }
    }
}

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// The state machine of one job.
///
/// Note that using a generic type that holds the current state serves two
/// purposes. It allows for also having shared data by all states that is not
/// really part of state data (here the job itself). Additionally, it's nicer
/// when debugging to see the state machine and the current state it is
/// holding at any time.
#[derive(Debug)]
struct JobSM<S: Runnable> {
    job: Job,
    state: S,
}
impl<S: Runnable> JobSM<S> {
    fn run(&mut self, machinery: &Machinery) -> Event {
        self.state.run(&self.job, machinery)
    }
}

/// Wraps the state machine and its various states into a simple enum, which can
/// also be used for pattern matching during state transitions.
#[derive(Debug)]
enum JobStates {
    Dispatching(JobSM<DispatchingState>),
    RemoteBuilding(JobSM<RemoteBuildingState>),
    Provisioning(JobSM<ProvisioningState>),
    Finalized(JobSM<FinalizedState>),
    Error(JobSM<ErrorState>),
    Idle(JobSM<IdleState>),
}
impl JobStates {
    fn job(&self) -> &Job {
        match self {
            JobStates::Dispatching(sm) => &sm.job,
            JobStates::RemoteBuilding(sm) => &sm.job,
            JobStates::Provisioning(sm) => &sm.job,
            JobStates::Finalized(sm) => &sm.job,
            JobStates::Error(sm) => &sm.job,
            JobStates::Idle(sm) => &sm.job,
        }
    }

    /// The unit of work of the job driver. Runs the current state and
    /// decides the next transition from the event it returns. State
    /// transitions from events are implemented using the `From`/`Into`
    /// pattern, so that state/event mismatches are caught at compile time.
    fn step(&mut self, machinery: &Machinery) -> Self {
        match self {
            JobStates::Dispatching(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::BuildAccepted(ev) => JobStates::RemoteBuilding(ev.into()),
                    Event::Rejected(ev) => JobStates::Error(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            JobStates::RemoteBuilding(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::BuildCompleted(ev) => JobStates::Provisioning(ev.into()),
                    Event::Failed(ev) => JobStates::Error(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            JobStates::Provisioning(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::Flashed(ev) => JobStates::Finalized(ev.into()),
                    Event::Failed(ev) => JobStates::Error(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            JobStates::Finalized(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::Release(ev) => JobStates::Idle(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            JobStates::Error(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::Release(ev) => JobStates::Idle(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            JobStates::Idle(sm) => {
                let event = sm.run(machinery);
                match event {
                    Event::Exit(ev) => JobStates::Idle(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<BuildAcceptedEvent> for JobSM<RemoteBuildingState> {
    fn from(event: BuildAcceptedEvent) -> JobSM<RemoteBuildingState> {
        JobSM {
            job: event.job,
            state: RemoteBuildingState {
                inbox: Some(event.inbox),
            },
        }
    }
}

impl From<BuildCompletedEvent> for JobSM<ProvisioningState> {
    fn from(event: BuildCompletedEvent) -> JobSM<ProvisioningState> {
        JobSM {
            job: event.job,
            state: ProvisioningState {
                locator: event.locator,
            },
        }
    }
}

impl From<FlashedEvent> for JobSM<FinalizedState> {
    fn from(event: FlashedEvent) -> JobSM<FinalizedState> {
        JobSM {
            job: event.job,
            state: FinalizedState {},
        }
    }
}

impl From<RejectedEvent> for JobSM<ErrorState> {
    fn from(event: RejectedEvent) -> JobSM<ErrorState> {
        JobSM {
            job: event.job,
            state: ErrorState {
                cause: event.error.to_string(),
                rejection: Some(event.error),
            },
        }
    }
}
impl From<FailedEvent> for JobSM<ErrorState> {
    fn from(event: FailedEvent) -> JobSM<ErrorState> {
        JobSM {
            job: event.job,
            state: ErrorState {
                cause: event.cause,
                rejection: None,
            },
        }
    }
}

impl From<ReleaseEvent> for JobSM<IdleState> {
    fn from(event: ReleaseEvent) -> JobSM<IdleState> {
        JobSM {
            job: event.job,
            state: IdleState {
                with_error: event.with_error,
                should_exit: false,
            },
        }
    }
}
impl From<ExitEvent> for JobSM<IdleState> {
    fn from(event: ExitEvent) -> JobSM<IdleState> {
        JobSM {
            job: event.job,
            state: IdleState {
                with_error: event.with_error,
                should_exit: true,
            },
        }
    }
}

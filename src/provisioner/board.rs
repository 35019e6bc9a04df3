//! Per job kind state record: the in-progress guard, the latest status and
//! the active subscription key.
//!
//! The board is the only state shared between the request path and the job
//! workers. Only the job state machine writes to it; everybody else reads
//! through the accessors or watches the broadcast of status updates.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Mutex, MutexGuard,
    },
};

use log::{debug, info};

use crate::job::{JobId, JobKind, JobPhase, StatusUpdate, SubscriptionKey};

pub(crate) const READY: &str = "Ready";

/// Why a job was not admitted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Refusal {
    /// A job of the same kind is in progress.
    Busy,
    /// A job of this other kind is in progress with the same run identifier.
    RunInUse(JobKind),
}

#[derive(Debug)]
struct KindRecord {
    phase: JobPhase,
    status: String,
    in_progress: bool,
    job: Option<JobId>,
    subscription: Option<SubscriptionKey>,
}
impl Default for KindRecord {
    fn default() -> Self {
        KindRecord {
            phase: JobPhase::Idle,
            status: READY.into(),
            in_progress: false,
            job: None,
            subscription: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct StatusBoard {
    records: Mutex<HashMap<JobKind, KindRecord>>,
    observers: Mutex<Vec<Sender<StatusUpdate>>>,
}
impl StatusBoard {
    /// Take the guard of `kind` for `job`. Nothing changes when a job of that
    /// kind is already in progress, or when another kind runs under the same
    /// run identifier.
    pub(crate) fn try_admit(&self, kind: JobKind, job: &JobId) -> Result<(), Refusal> {
        let mut records = self.records();
        if let Some((&other, _)) = records
            .iter()
            .find(|(k, r)| **k != kind && r.job.as_ref() == Some(job))
        {
            return Err(Refusal::RunInUse(other));
        }
        let record = records.entry(kind).or_default();
        if record.in_progress {
            return Err(Refusal::Busy);
        }
        record.in_progress = true;
        record.job = Some(job.clone());
        info!("{} job {} admitted", kind, job);
        Ok(())
    }

    /// Assign the phase and status of `kind` and push them to the observers.
    pub(crate) fn set(&self, kind: JobKind, phase: JobPhase, status: impl Into<String>) {
        let status = status.into();
        {
            let mut records = self.records();
            let record = records.entry(kind).or_default();
            record.phase = phase;
            record.status = status.clone();
        }
        info!("[{}] {}", kind, status);
        self.broadcast(StatusUpdate {
            kind,
            phase,
            status,
        });
    }

    pub(crate) fn set_subscription(&self, kind: JobKind, key: Option<SubscriptionKey>) {
        self.records().entry(kind).or_default().subscription = key;
    }

    pub(crate) fn subscription(&self, kind: JobKind) -> Option<SubscriptionKey> {
        self.records().get(&kind).and_then(|r| r.subscription.clone())
    }

    /// Release the guard of `kind`. The latest status string is kept so that
    /// the outcome of the job stays readable until the next one starts.
    pub(crate) fn release(&self, kind: JobKind) {
        let status = {
            let mut records = self.records();
            let record = records.entry(kind).or_default();
            record.in_progress = false;
            record.job = None;
            record.subscription = None;
            record.phase = JobPhase::Idle;
            record.status.clone()
        };
        debug!("{} guard released", kind);
        self.broadcast(StatusUpdate {
            kind,
            phase: JobPhase::Idle,
            status,
        });
    }

    pub(crate) fn status(&self, kind: JobKind) -> String {
        self.records()
            .get(&kind)
            .map_or_else(|| READY.to_owned(), |r| r.status.clone())
    }

    pub(crate) fn phase(&self, kind: JobKind) -> JobPhase {
        self.records().get(&kind).map_or(JobPhase::Idle, |r| r.phase)
    }

    pub(crate) fn current_job(&self, kind: JobKind) -> Option<JobId> {
        self.records().get(&kind).and_then(|r| r.job.clone())
    }

    pub(crate) fn is_in_progress(&self, kind: JobKind) -> bool {
        self.records().get(&kind).map_or(false, |r| r.in_progress)
    }

    pub(crate) fn watch(&self) -> Receiver<StatusUpdate> {
        let (tx, rx) = mpsc::channel();
        self.observers().push(tx);
        rx
    }

    fn broadcast(&self, update: StatusUpdate) {
        // Observers that went away are forgotten.
        self.observers().retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn records(&self) -> MutexGuard<'_, HashMap<JobKind, KindRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observers(&self) -> MutexGuard<'_, Vec<Sender<StatusUpdate>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_admission_of_same_kind_is_refused() {
        let board = StatusBoard::default();
        assert!(board.try_admit(JobKind::Params, &JobId::new("a")).is_ok());
        assert_eq!(
            board.try_admit(JobKind::Params, &JobId::new("b")),
            Err(Refusal::Busy)
        );
        assert_eq!(board.current_job(JobKind::Params), Some(JobId::new("a")));
    }

    #[test]
    fn kinds_are_guarded_independently() {
        let board = StatusBoard::default();
        assert!(board.try_admit(JobKind::Params, &JobId::new("a")).is_ok());
        assert!(board.try_admit(JobKind::SetSerial, &JobId::new("b")).is_ok());
    }

    #[test]
    fn run_id_is_not_shared_between_kinds() {
        let board = StatusBoard::default();
        assert!(board.try_admit(JobKind::Params, &JobId::new("a")).is_ok());
        assert_eq!(
            board.try_admit(JobKind::SetSerial, &JobId::new("a")),
            Err(Refusal::RunInUse(JobKind::Params))
        );
        assert!(!board.is_in_progress(JobKind::SetSerial));

        board.release(JobKind::Params);
        assert!(board.try_admit(JobKind::SetSerial, &JobId::new("a")).is_ok());
    }

    #[test]
    fn release_reopens_the_guard_and_keeps_status() {
        let board = StatusBoard::default();
        assert!(board.try_admit(JobKind::Params, &JobId::new("a")).is_ok());
        board.set(JobKind::Params, JobPhase::Finalized, "Finalized");
        board.release(JobKind::Params);

        assert!(!board.is_in_progress(JobKind::Params));
        assert_eq!(board.phase(JobKind::Params), JobPhase::Idle);
        assert_eq!(board.status(JobKind::Params), "Finalized");
        assert!(board.try_admit(JobKind::Params, &JobId::new("b")).is_ok());
    }

    #[test]
    fn observers_receive_every_assignment() {
        let board = StatusBoard::default();
        let rx = board.watch();
        board.set(JobKind::SetSerial, JobPhase::Dispatching, "Compiling firmware...");
        board.release(JobKind::SetSerial);

        let updates: Vec<StatusUpdate> = rx.try_iter().collect();
        assert_eq!(
            updates,
            vec![
                StatusUpdate {
                    kind: JobKind::SetSerial,
                    phase: JobPhase::Dispatching,
                    status: "Compiling firmware...".into(),
                },
                StatusUpdate {
                    kind: JobKind::SetSerial,
                    phase: JobPhase::Idle,
                    status: "Compiling firmware...".into(),
                },
            ]
        );
    }

    #[test]
    fn dropped_observers_are_forgotten() {
        let board = StatusBoard::default();
        drop(board.watch());
        board.set(JobKind::Params, JobPhase::Dispatching, "x");
        assert!(board.observers().is_empty());
    }

    #[test]
    fn unknown_kind_reads_as_ready() {
        let board = StatusBoard::default();
        assert_eq!(board.status(JobKind::Params), READY);
        assert_eq!(board.phase(JobKind::Params), JobPhase::Idle);
    }
}

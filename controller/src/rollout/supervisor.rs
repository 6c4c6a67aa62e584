use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Pause between steps while a job waits on something external (an agent
/// callback, a lock lease held elsewhere). Every wait in the engines is a
/// database poll, so stepping faster than this only burns queries.
pub const IDLE_RECHECK: Duration = Duration::from_millis(500);

/// Wall-clock ceiling on a single engine job. The per-stage timeouts fire
/// long before this; a job that somehow outlives it is abandoned and left
/// for the resume sweep, which re-enters it from its persisted state.
pub const JOB_DEADLINE: Duration = Duration::from_secs(45 * 60);

const LANE_BACKLOG: usize = 64;

/// A resumable engine job (a rollout or a migration) scoped to one service.
///
/// Jobs make progress in discrete steps; every step commits at most one
/// state transition to the store, so a job killed between steps loses
/// nothing — the next controller re-creates it from the row it left behind.
/// Failure handling is the job's own concern: a step never returns an error,
/// it decides internally whether to retry, compensate or park the work.
#[async_trait]
pub trait EngineJob: Send {
    /// Short label for progress logs, e.g. `rollout <id>`.
    fn describe(&self) -> String;

    /// Make at most one persisted transition.
    async fn step(&mut self) -> Step;
}

/// What one [`EngineJob::step`] call achieved.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A transition was committed; keep stepping.
    Advanced,
    /// Blocked on something external; step again after [`IDLE_RECHECK`].
    Idle,
    /// The job reached a terminal state and the lane can move on.
    Finished,
}

/// Resolves once the submitted job finishes (or is abandoned at the
/// deadline). Dropping it detaches from the job without affecting it.
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl Completion {
    pub async fn done(self) {
        // The lane firing the sender (or dropping it) both mean the job is
        // no longer running.
        let _ = self.rx.await;
    }
}

struct Submission {
    job: Box<dyn EngineJob>,
    notify: oneshot::Sender<()>,
}

/// Serialises engine jobs per service inside this process. Each service gets
/// a lane — a spawned loop stepping one job at a time in submission order —
/// which, together with the store's advisory lock for the cross-replica
/// case, guarantees rollouts and migrations of a service never interleave.
#[derive(Clone)]
pub struct ServiceSupervisor {
    lanes: Arc<Mutex<HashMap<Uuid, Sender<Submission>>>>,
    deadline: Duration,
}

impl Default for ServiceSupervisor {
    fn default() -> Self {
        Self::with_deadline(JOB_DEADLINE)
    }
}

impl ServiceSupervisor {
    /// A supervisor with a custom job deadline; tests shorten it.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            deadline,
        }
    }

    /// Queue a job on its service's lane, spawning the lane on first use.
    pub async fn submit(&self, service_id: Uuid, job: Box<dyn EngineJob>) -> Completion {
        let (notify, rx) = oneshot::channel();
        let mut submission = Submission { job, notify };

        let mut lanes = self.lanes.lock().await;

        if let Some(sender) = lanes.get(&service_id) {
            match sender.send(submission).await {
                Ok(()) => return Completion { rx },
                // The lane loop is gone (shutdown mid-flight); fall through
                // and start a fresh one with the recovered submission.
                Err(returned) => submission = returned.0,
            }
        }

        let (sender, receiver) = mpsc::channel(LANE_BACKLOG);
        tokio::spawn(run_lane(service_id, receiver, self.deadline));
        let _ = sender.send(submission).await;
        lanes.insert(service_id, sender);

        Completion { rx }
    }
}

/// One service's job loop. Lives until the supervisor (holding the sender)
/// goes away.
async fn run_lane(service_id: Uuid, mut submissions: Receiver<Submission>, deadline: Duration) {
    while let Some(Submission { mut job, notify }) = submissions.recv().await {
        let label = job.describe();
        let abandon_after = Instant::now() + deadline;
        debug!(service_id = %service_id, job = %label, "engine job started");

        loop {
            if Instant::now() > abandon_after {
                warn!(
                    service_id = %service_id,
                    job = %label,
                    "engine job exceeded its deadline; abandoning"
                );
                break;
            }

            match job.step().await {
                Step::Advanced => continue,
                Step::Idle => sleep(IDLE_RECHECK).await,
                Step::Finished => break,
            }
        }

        debug!(service_id = %service_id, job = %label, "engine job finished");
        let _ = notify.send(());
    }
}

//! In-process task queue with a fixed worker pool.
//!
//! Workers share one receiver and take one task at a time. Each task runs in
//! its own spawned tokio task under a hard time limit, so a panic or a hang
//! is contained to that unit. Failures are logged and audited as
//! `task_failed`; the worker carries on with the next task.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEvent, ActivityType, AuditSink, record_best_effort};
use crate::error::{QueueError, TaskError};
use crate::pipeline::types::Task;

/// Executes one task and optionally hands back the next one.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Task) -> Result<Option<Task>, TaskError>;
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

/// Consumer side, shared by all workers.
pub struct TaskReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
}

impl TaskQueue {
    pub fn channel() -> (TaskQueue, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskQueue { tx },
            TaskReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Enqueue without waiting for execution.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        debug!(task = task.name(), subject = task.subject(), "Task enqueued");
        self.tx.send(task).map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
impl TaskReceiver {
    /// Take the raw receiver back when no worker holds it.
    pub(crate) fn into_inner(self) -> mpsc::UnboundedReceiver<Task> {
        match Arc::try_unwrap(self.rx) {
            Ok(rx) => rx.into_inner(),
            Err(_) => panic!("receiver still shared"),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub workers: usize,
    pub time_limit: Duration,
}

/// Start `settings.workers` workers pulling from `receiver`.
///
/// Follow-up tasks returned by the runner are pushed back through `queue`.
pub fn spawn_workers(
    receiver: TaskReceiver,
    queue: TaskQueue,
    runner: Arc<dyn TaskRunner>,
    audit: Arc<dyn AuditSink>,
    settings: WorkerSettings,
) -> Vec<JoinHandle<()>> {
    info!(
        workers = settings.workers,
        time_limit_secs = settings.time_limit.as_secs(),
        "Starting pipeline workers"
    );

    (0..settings.workers.max(1))
        .map(|worker| {
            let rx = Arc::clone(&receiver.rx);
            let queue = queue.clone();
            let runner = Arc::clone(&runner);
            let audit = Arc::clone(&audit);

            tokio::spawn(async move {
                loop {
                    // The lock is released before the task runs.
                    let next = rx.lock().await.recv().await;
                    let Some(task) = next else {
                        info!(worker, "Task queue closed, worker exiting");
                        return;
                    };
                    execute(worker, task, &queue, &runner, audit.as_ref(), settings.time_limit)
                        .await;
                }
            })
        })
        .collect()
}

async fn execute(
    worker: usize,
    task: Task,
    queue: &TaskQueue,
    runner: &Arc<dyn TaskRunner>,
    audit: &dyn AuditSink,
    time_limit: Duration,
) {
    let name = task.name();
    let subject = task.subject().to_string();
    debug!(worker, task = name, %subject, "Task started");

    let result = run_contained(task, runner, time_limit).await;

    match result {
        Ok(None) => debug!(worker, task = name, %subject, "Task completed"),
        Ok(Some(next)) => {
            debug!(worker, task = name, next = next.name(), "Task completed with follow-on");
            if let Err(e) = queue.enqueue(next) {
                warn!(task = name, %subject, error = %e, "Could not enqueue follow-on task");
            }
        }
        Err(e) => {
            error!(worker, task = name, %subject, error = %e, "Task failed");
            record_best_effort(
                audit,
                ActivityEvent::new(
                    ActivityType::TaskFailed,
                    "failed",
                    format!("{name} ({subject}): {e}"),
                ),
            )
            .await;
        }
    }
}

/// Run one task in its own tokio task, bounded by `time_limit`.
async fn run_contained(
    task: Task,
    runner: &Arc<dyn TaskRunner>,
    time_limit: Duration,
) -> Result<Option<Task>, TaskError> {
    let name = task.name().to_string();
    let runner = Arc::clone(runner);
    let mut handle = tokio::spawn(async move { runner.run(task).await });

    match tokio::time::timeout(time_limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(TaskError::Panicked {
            task: name,
            reason: panic_message(join_err.into_panic()),
        }),
        Ok(Err(join_err)) => Err(TaskError::Panicked {
            task: name,
            reason: join_err.to_string(),
        }),
        Err(_) => {
            handle.abort();
            Err(TaskError::Timeout {
                task: name,
                timeout: time_limit,
            })
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::FollowUp;
    use crate::store::MemoryActivityLog;

    fn follow_up(phone: &str) -> Task {
        Task::SendFollowUp(FollowUp {
            phone: phone.into(),
            name: "Dana".into(),
            qualified: true,
            record_id: None,
        })
    }

    fn finalize(call_id: &str) -> Task {
        Task::FinalizeCall {
            call_id: call_id.into(),
            call_status: "completed".into(),
            duration_secs: 10,
        }
    }

    /// Records every task it sees; behaviour keyed by call id / phone.
    struct ScriptedRunner {
        seen: Mutex<Vec<String>>,
        done: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, task: Task) -> Result<Option<Task>, TaskError> {
            let subject = task.subject().to_string();
            self.seen.lock().await.push(subject.clone());
            let outcome = match subject.as_str() {
                "panic" => panic!("boom"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(None)
                }
                "missing" => Err(TaskError::CallStateMissing {
                    call_id: subject.clone(),
                }),
                "CA1" => Ok(Some(follow_up("+15550001111"))),
                _ => Ok(None),
            };
            let _ = self.done.send(subject);
            outcome
        }
    }

    fn start(
        time_limit: Duration,
    ) -> (
        TaskQueue,
        Arc<ScriptedRunner>,
        Arc<MemoryActivityLog>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (queue, receiver) = TaskQueue::channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(ScriptedRunner {
            seen: Mutex::new(Vec::new()),
            done: done_tx,
        });
        let audit = Arc::new(MemoryActivityLog::new());
        spawn_workers(
            receiver,
            queue.clone(),
            runner.clone(),
            audit.clone(),
            WorkerSettings {
                workers: 2,
                time_limit,
            },
        );
        (queue, runner, audit, done_rx)
    }

    #[tokio::test]
    async fn follow_on_task_is_dispatched() {
        let (queue, runner, _, mut done) = start(Duration::from_secs(5));
        queue.enqueue(finalize("CA1")).unwrap();

        assert_eq!(done.recv().await.unwrap(), "CA1");
        assert_eq!(done.recv().await.unwrap(), "+15550001111");
        assert_eq!(runner.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn failure_is_audited_and_worker_survives() {
        let (queue, _, audit, mut done) = start(Duration::from_secs(5));
        queue.enqueue(finalize("missing")).unwrap();
        queue.enqueue(finalize("other")).unwrap();

        let mut finished = vec![done.recv().await.unwrap(), done.recv().await.unwrap()];
        finished.sort();
        assert_eq!(finished, ["missing", "other"]);

        // Audit happens just after the runner returns.
        for _ in 0..50 {
            if !audit.events().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let events = audit.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].activity_type, ActivityType::TaskFailed);
        assert!(events[0].details.contains("missing"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (queue, runner, audit, mut done) = start(Duration::from_secs(5));
        queue.enqueue(finalize("panic")).unwrap();
        queue.enqueue(finalize("after")).unwrap();
        queue.enqueue(finalize("after2")).unwrap();

        // Two workers, one panicked task: both later tasks still complete.
        let mut finished = vec![done.recv().await.unwrap(), done.recv().await.unwrap()];
        finished.sort();
        assert_eq!(finished, ["after", "after2"]);
        assert!(runner.seen.lock().await.contains(&"panic".to_string()));

        for _ in 0..50 {
            if !audit.events().await.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(audit.events().await[0].details.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_times_out() {
        let (queue, _, audit, mut done) = start(Duration::from_secs(300));
        queue.enqueue(finalize("slow")).unwrap();
        queue.enqueue(finalize("quick")).unwrap();
        assert_eq!(done.recv().await.unwrap(), "quick");

        tokio::time::sleep(Duration::from_secs(301)).await;
        let events = audit.events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].details.contains("timed out"));
    }

    #[test]
    fn closed_queue_rejects() {
        let (queue, receiver) = TaskQueue::channel();
        drop(receiver);
        assert!(matches!(
            queue.enqueue(follow_up("+1")),
            Err(QueueError::Closed)
        ));
    }
}

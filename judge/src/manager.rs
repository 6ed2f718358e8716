//! Judge manager - fixed-size worker pool
//!
//! Submissions go through one bounded FIFO queue. Each worker takes the next
//! task, judges it on the blocking thread pool and hands the outcome to the
//! callback. Every submitted task gets exactly one callback.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::JudgeError;
use crate::judger::{JudgeContext, JudgeTask, Judger};
use crate::model::JudgeResult;

/// Receives `(submission_id, outcome)` once per submitted task
pub type JudgeCallback = Arc<dyn Fn(i64, Result<JudgeResult, JudgeError>) + Send + Sync>;

type TaskQueue = Arc<Mutex<mpsc::Receiver<JudgeTask>>>;

pub struct JudgeManager {
    sender: Option<mpsc::Sender<JudgeTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl JudgeManager {
    /// Spawn `workers` workers (at least one) sharing a queue of
    /// `queue_capacity` tasks. Must be called inside a tokio runtime.
    pub fn start(
        context: JudgeContext,
        workers: usize,
        queue_capacity: usize,
        callback: JudgeCallback,
    ) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let queue: TaskQueue = Arc::new(Mutex::new(receiver));
        let context = Arc::new(context);

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&context),
                    Arc::clone(&callback),
                ))
            })
            .collect();

        info!(
            "Judge manager started: {} workers, queue capacity {}",
            workers, queue_capacity
        );
        Self {
            sender: Some(sender),
            workers: handles,
        }
    }

    /// Queue a task, waiting while the queue is full
    pub async fn submit(&self, task: JudgeTask) -> Result<(), JudgeError> {
        let sender = self.sender.as_ref().ok_or(JudgeError::QueueClosed)?;
        let submission_id = task.submission.submission_id;
        sender
            .send(task)
            .await
            .map_err(|_| JudgeError::QueueClosed)?;
        debug!("Queued submission {}", submission_id);
        Ok(())
    }

    /// Stop accepting tasks and wait until every queued task is judged
    pub async fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Judge worker ended abnormally: {}", e);
            }
        }
        info!("Judge manager stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: TaskQueue,
    context: Arc<JudgeContext>,
    callback: JudgeCallback,
) {
    debug!("Worker {} started", worker_id);
    loop {
        // the lock is held only while waiting for the next task
        let task = queue.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        let submission_id = task.submission.submission_id;
        info!(
            "Worker {} judging submission {} ({})",
            worker_id, submission_id, task.submission.language_id
        );

        let ctx = Arc::clone(&context);
        let outcome = match tokio::task::spawn_blocking(move || judge(task, &ctx)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(JudgeError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(JudgeError::Panicked(e.to_string())),
        };

        match &outcome {
            Ok(result) => info!(
                "Submission {} finished: {} (max time {}us, max memory {}KB)",
                submission_id,
                result.status(),
                result.max_duration_us(),
                result.max_memory_kb()
            ),
            Err(e) => error!("Submission {} failed: {}", submission_id, e),
        }

        let callback = Arc::clone(&callback);
        if let Err(panic) =
            panic::catch_unwind(AssertUnwindSafe(move || callback(submission_id, outcome)))
        {
            error!(
                "Result callback panicked for submission {}: {}",
                submission_id,
                panic_message(panic)
            );
        }
    }
    debug!("Worker {} stopped", worker_id);
}

fn judge(task: JudgeTask, ctx: &JudgeContext) -> Result<JudgeResult, JudgeError> {
    Ok(Judger::new(task, ctx)?.run())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::languages::LanguageRegistry;
    use crate::model::{
        ExecutionResult, ResourceLimits, Submission, SubmissionStatus, TestCase,
    };
    use crate::runner::{CommandSpec, Runner};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Echo runner that records how many runs overlap
    #[derive(Default)]
    struct CountingRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Runner for CountingRunner {
        fn run(
            &self,
            _cmd: &CommandSpec,
            _limits: &ResourceLimits,
            stdin: &[u8],
        ) -> Result<ExecutionResult, SandboxError> {
            if stdin == b"panic" {
                panic!("runner exploded");
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecutionResult {
                stdout: stdin.to_vec(),
                ..Default::default()
            })
        }
    }

    fn context(runner: Arc<CountingRunner>, root: &Path) -> JudgeContext {
        JudgeContext {
            runner,
            languages: Arc::new(LanguageRegistry::load(None).unwrap()),
            work_root: root.to_path_buf(),
            compile_timeout: Duration::from_secs(10),
            compile_user: None,
        }
    }

    fn task(submission_id: i64, language_id: &str, stdin: &str) -> JudgeTask {
        JudgeTask {
            submission: Submission {
                submission_id,
                problem_title: "echo".to_string(),
                language_id: language_id.to_string(),
                source_code: "print(input())".to_string(),
                compile_options: vec![],
            },
            limits: ResourceLimits::default(),
            test_cases: vec![TestCase {
                stdin: stdin.to_string(),
                expected_output: stdin.to_string(),
                sequence: 1,
                is_hidden: false,
            }],
            ignore_time_limit_bonus: false,
            ignore_memory_limit_bonus: false,
        }
    }

    type Outcomes = Arc<StdMutex<HashMap<i64, Vec<Result<SubmissionStatus, String>>>>>;

    fn recording_callback(outcomes: Outcomes) -> JudgeCallback {
        Arc::new(move |id, outcome| {
            let entry = outcome.map(|r| r.status()).map_err(|e| e.to_string());
            outcomes.lock().unwrap().entry(id).or_default().push(entry);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_submission_gets_one_callback() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(CountingRunner::default());
        let outcomes: Outcomes = Arc::default();

        let manager = JudgeManager::start(
            context(runner.clone(), root.path()),
            4,
            8,
            recording_callback(outcomes.clone()),
        );
        for id in 0..100 {
            manager.submit(task(id, "python", "hello")).await.unwrap();
        }
        manager.shutdown().await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 100);
        for (id, results) in outcomes.iter() {
            assert_eq!(results.len(), 1, "submission {}", id);
            assert_eq!(results[0], Ok(SubmissionStatus::Ac));
        }
        assert!(runner.peak.load(Ordering::SeqCst) <= 4);
        assert!(runner.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errors_and_panics_reach_the_callback() {
        let root = tempfile::tempdir().unwrap();
        let outcomes: Outcomes = Arc::default();

        let manager = JudgeManager::start(
            context(Arc::new(CountingRunner::default()), root.path()),
            2,
            4,
            recording_callback(outcomes.clone()),
        );
        manager.submit(task(1, "cobol", "x")).await.unwrap();
        manager.submit(task(2, "python", "panic")).await.unwrap();
        manager.submit(task(3, "python", "ok")).await.unwrap();
        manager.shutdown().await;

        let outcomes = outcomes.lock().unwrap();
        assert!(outcomes[&1][0].as_ref().unwrap_err().contains("cobol"));
        assert!(outcomes[&2][0].as_ref().unwrap_err().contains("runner exploded"));
        assert_eq!(outcomes[&3][0], Ok(SubmissionStatus::Ac));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_callback_does_not_stop_workers() {
        let root = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let callback: JudgeCallback = Arc::new(move |id, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            if id % 2 == 0 {
                panic!("callback failed for {}", id);
            }
        });

        let manager = JudgeManager::start(
            context(Arc::new(CountingRunner::default()), root.path()),
            1,
            2,
            callback,
        );
        for id in 0..6 {
            manager.submit(task(id, "python", "a")).await.unwrap();
        }
        manager.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let root = tempfile::tempdir().unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let callback: JudgeCallback = Arc::new(move |id, _| seen.lock().unwrap().push(id));

        tokio_test::block_on(async {
            let manager = JudgeManager::start(
                context(Arc::new(CountingRunner::default()), root.path()),
                1,
                16,
                callback,
            );
            for id in 0..10 {
                manager.submit(task(id, "python", "x")).await.unwrap();
            }
            manager.shutdown().await;
        });

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    }
}

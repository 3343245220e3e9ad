use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    queue::{ClaimedWork, SqliteWorkQueue},
    work::{WorkOutcome, Worker, WorkerFactory},
};

/// How long shutdown waits for stopped workers to report back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why the runner asked a worker to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Superseded,
    Shutdown,
}

struct RunningJob {
    name: String,
    worker: Arc<dyn Worker>,
    started: Instant,
    stop: Option<StopReason>,
}

struct Finished {
    id: String,
    outcome: WorkOutcome,
}

/// Drives the SQLite queue: claims due work, runs it, and settles each
/// execution as finished or retried.
pub struct QueueRunner {
    queue: SqliteWorkQueue,
    factory: Arc<dyn WorkerFactory>,
    poll_interval: Duration,
    job_timeout: Duration,
    /// Keyed by generation id, so a replaced job and its successor can both be
    /// in flight under the same name.
    running: HashMap<String, RunningJob>,
}

impl QueueRunner {
    pub fn new(
        queue: SqliteWorkQueue,
        factory: Arc<dyn WorkerFactory>,
        poll_interval: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            factory,
            poll_interval,
            job_timeout,
            running: HashMap::new(),
        }
    }

    /// Main event loop. Polls every `poll_interval` until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("queue runner started");
        self.requeue_on_startup();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Finished>();
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&done_tx) {
                        error!("queue tick error: {e}");
                    }
                }
                Some(done) = done_rx.recv() => self.settle(done),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("queue runner shutting down");
                        break;
                    }
                }
            }
        }

        self.drain(&mut done_rx).await;
    }

    // --- private helpers ---------------------------------------------------

    /// At-least-once: anything a dead process left running is due again.
    fn requeue_on_startup(&self) {
        match self.queue.requeue_running(Utc::now()) {
            Ok(n) if n > 0 => warn!(count = n, "interrupted work requeued on startup"),
            Err(e) => error!("requeue-on-startup failed: {e}"),
            _ => {}
        }
    }

    /// One execution at a time: every worker provisions into the same engine
    /// slot, so nothing new is claimed until the previous run has settled.
    fn tick(&mut self, done_tx: &mpsc::UnboundedSender<Finished>) -> Result<()> {
        self.supervise();
        if !self.running.is_empty() {
            return Ok(());
        }
        for work in self.queue.claim_due(Utc::now(), 1)? {
            self.launch(work, done_tx.clone());
        }
        Ok(())
    }

    /// Stop workers that overran the timeout or whose row was replaced.
    fn supervise(&mut self) {
        for (id, job) in self.running.iter_mut() {
            if job.stop.is_some() {
                continue;
            }
            if job.started.elapsed() >= self.job_timeout {
                warn!(name = %job.name, work_id = %id, "work timed out; stopping worker");
                job.stop = Some(StopReason::Timeout);
                job.worker.on_stopped();
                continue;
            }
            match self.queue.is_current(&job.name, id) {
                Ok(true) => {}
                Ok(false) => {
                    info!(name = %job.name, work_id = %id, "work superseded; stopping worker");
                    job.stop = Some(StopReason::Superseded);
                    job.worker.on_stopped();
                }
                Err(e) => warn!(name = %job.name, "supersession check failed: {e}"),
            }
        }
    }

    fn launch(&mut self, work: ClaimedWork, done_tx: mpsc::UnboundedSender<Finished>) {
        info!(name = %work.name, work_id = %work.id, attempt = work.attempt, "starting work");
        let worker = self.factory.create(&work.name);
        let handle = Arc::clone(&worker).start_work();

        let id = work.id.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            // The receiver only disappears once the runner has exited.
            let _ = done_tx.send(Finished { id, outcome });
        });

        self.running.insert(
            work.id,
            RunningJob {
                name: work.name,
                worker,
                started: Instant::now(),
                stop: None,
            },
        );
    }

    fn settle(&mut self, done: Finished) {
        let Some(job) = self.running.remove(&done.id) else {
            warn!(work_id = %done.id, "completion for unknown work ignored");
            return;
        };

        // A timed-out run is retried whatever the worker reported.
        let outcome = match job.stop {
            Some(StopReason::Timeout) => WorkOutcome::Retry {
                reason: "timed out".to_string(),
            },
            _ => done.outcome,
        };

        let result = match &outcome {
            WorkOutcome::Success => self.queue.finish(&job.name, &done.id).map(|removed| {
                if removed {
                    info!(name = %job.name, work_id = %done.id, "work succeeded");
                } else {
                    debug!(name = %job.name, work_id = %done.id, "work finished after being replaced");
                }
            }),
            WorkOutcome::Retry { reason } => self
                .queue
                .retry(Utc::now(), &job.name, &done.id)
                .map(|next| match next {
                    Some(at) => warn!(name = %job.name, %reason, retry_at = %at, "work failed; retrying"),
                    None => debug!(name = %job.name, %reason, "failed work was replaced; no retry"),
                }),
        };
        if let Err(e) = result {
            error!(name = %job.name, work_id = %done.id, "failed to settle work: {e}");
        }
    }

    async fn drain(&mut self, done_rx: &mut mpsc::UnboundedReceiver<Finished>) {
        if self.running.is_empty() {
            return;
        }
        for job in self.running.values_mut() {
            if job.stop.is_none() {
                job.stop = Some(StopReason::Shutdown);
                job.worker.on_stopped();
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some(done)) => self.settle(done),
                Ok(None) | Err(_) => break,
            }
        }
        if !self.running.is_empty() {
            warn!(
                count = self.running.len(),
                "workers still running at shutdown; they will be requeued on next start"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{BackoffPolicy, ExistingWorkPolicy, WorkRequest, WorkStatus},
        work::{completion_pair, WorkCompleter, WorkHandle},
    };
    use rusqlite::Connection;
    use std::sync::Mutex;

    /// Worker whose completion is driven from the test.
    struct ManualWorker {
        completer: WorkCompleter,
        handle: Mutex<Option<WorkHandle>>,
        stops: Mutex<u32>,
        complete_on_stop: bool,
    }

    impl Worker for ManualWorker {
        fn start_work(self: Arc<Self>) -> WorkHandle {
            self.handle.lock().unwrap().take().unwrap()
        }

        fn on_stopped(&self) {
            *self.stops.lock().unwrap() += 1;
            if self.complete_on_stop {
                self.completer.complete(WorkOutcome::Success);
            }
        }
    }

    #[derive(Default)]
    struct ManualFactory {
        created: Mutex<Vec<(String, Arc<ManualWorker>)>>,
        complete_on_stop: bool,
    }

    impl WorkerFactory for ManualFactory {
        fn create(&self, name: &str) -> Arc<dyn Worker> {
            let (completer, handle) = completion_pair();
            let worker = Arc::new(ManualWorker {
                completer,
                handle: Mutex::new(Some(handle)),
                stops: Mutex::new(0),
                complete_on_stop: self.complete_on_stop,
            });
            self.created
                .lock()
                .unwrap()
                .push((name.to_string(), Arc::clone(&worker)));
            worker
        }
    }

    fn request(delay: Duration) -> WorkRequest {
        WorkRequest::new(delay, BackoffPolicy::exponential(Duration::from_secs(900)))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn spawn_runner(
        queue: &SqliteWorkQueue,
        factory: Arc<ManualFactory>,
        job_timeout: Duration,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let runner = QueueRunner::new(
            queue.clone(),
            factory,
            Duration::from_millis(10),
            job_timeout,
        );
        let (tx, rx) = watch::channel(false);
        (tx, tokio::spawn(runner.run(rx)))
    }

    #[tokio::test]
    async fn due_work_runs_and_is_removed_on_success() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        queue
            .enqueue_at(Utc::now(), "job", ExistingWorkPolicy::Replace, &request(Duration::ZERO))
            .unwrap();
        let factory = Arc::new(ManualFactory::default());
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_secs(60));

        wait_for(|| factory.created.lock().unwrap().len() == 1).await;
        let worker = Arc::clone(&factory.created.lock().unwrap()[0].1);
        worker.completer.complete(WorkOutcome::Success);

        wait_for(|| queue.get_work("job").unwrap().is_none()).await;
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retry_outcome_reschedules_with_backoff() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        queue
            .enqueue_at(Utc::now(), "job", ExistingWorkPolicy::Replace, &request(Duration::ZERO))
            .unwrap();
        let factory = Arc::new(ManualFactory::default());
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_secs(60));

        wait_for(|| factory.created.lock().unwrap().len() == 1).await;
        let worker = Arc::clone(&factory.created.lock().unwrap()[0].1);
        worker.completer.complete(WorkOutcome::Retry {
            reason: "engine failed to load".into(),
        });

        wait_for(|| queue.get_work("job").unwrap().is_some_and(|w| w.attempt == 1)).await;
        let info = queue.get_work("job").unwrap().unwrap();
        assert!(info.run_at > Utc::now() + chrono::Duration::minutes(14));
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_work_is_stopped_and_retried() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        queue
            .enqueue_at(Utc::now(), "job", ExistingWorkPolicy::Replace, &request(Duration::ZERO))
            .unwrap();
        let factory = Arc::new(ManualFactory {
            complete_on_stop: true,
            ..Default::default()
        });
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_millis(30));

        wait_for(|| queue.get_work("job").unwrap().is_some_and(|w| w.attempt == 1)).await;
        let worker = Arc::clone(&factory.created.lock().unwrap()[0].1);
        assert_eq!(*worker.stops.lock().unwrap(), 1);
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn replacing_running_work_stops_the_old_worker() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        queue
            .enqueue_at(Utc::now(), "job", ExistingWorkPolicy::Replace, &request(Duration::ZERO))
            .unwrap();
        let factory = Arc::new(ManualFactory {
            complete_on_stop: true,
            ..Default::default()
        });
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_secs(60));

        wait_for(|| factory.created.lock().unwrap().len() == 1).await;
        queue
            .enqueue_at(
                Utc::now(),
                "job",
                ExistingWorkPolicy::Replace,
                &request(Duration::from_secs(3600)),
            )
            .unwrap();
        let replacement = queue.get_work("job").unwrap().unwrap().id;

        let old = Arc::clone(&factory.created.lock().unwrap()[0].1);
        wait_for(|| *old.stops.lock().unwrap() == 1).await;
        // The replacement row survives the old worker's success.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get_work("job").unwrap().unwrap().id, replacement);
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn due_rows_run_one_at_a_time() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        let past = Utc::now() - chrono::Duration::hours(1);
        for name in ["slot_1", "slot_2"] {
            queue
                .enqueue_at(past, name, ExistingWorkPolicy::Replace, &request(Duration::ZERO))
                .unwrap();
        }
        let factory = Arc::new(ManualFactory::default());
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_secs(60));

        wait_for(|| factory.created.lock().unwrap().len() == 1).await;
        // Several poll intervals pass with the first run still in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.created.lock().unwrap().len(), 1);
        let pending = queue
            .list_work()
            .unwrap()
            .into_iter()
            .filter(|w| w.status == WorkStatus::Pending)
            .count();
        assert_eq!(pending, 1);

        let (first_name, first) = factory.created.lock().unwrap()[0].clone();
        first.completer.complete(WorkOutcome::Success);
        wait_for(|| factory.created.lock().unwrap().len() == 2).await;
        let (second_name, second) = factory.created.lock().unwrap()[1].clone();
        assert_ne!(first_name, second_name);
        assert!(queue.get_work(&first_name).unwrap().is_none());

        second.completer.complete(WorkOutcome::Success);
        wait_for(|| queue.list_work().unwrap().is_empty()).await;
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_in_flight_workers() {
        let queue = SqliteWorkQueue::new(Connection::open_in_memory().unwrap()).unwrap();
        queue
            .enqueue_at(Utc::now(), "job", ExistingWorkPolicy::Replace, &request(Duration::ZERO))
            .unwrap();
        let factory = Arc::new(ManualFactory {
            complete_on_stop: true,
            ..Default::default()
        });
        let (stop, task) = spawn_runner(&queue, Arc::clone(&factory), Duration::from_secs(60));

        wait_for(|| factory.created.lock().unwrap().len() == 1).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        let worker = Arc::clone(&factory.created.lock().unwrap()[0].1);
        assert_eq!(*worker.stops.lock().unwrap(), 1);
    }
}

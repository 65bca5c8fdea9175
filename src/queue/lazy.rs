use crate::cancel::{CancellationToken, WorkerContext};
use super::panic_message;
use crate::error::{Error, Result};
use dashmap::DashSet;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub type Job = Box<dyn FnOnce(&WorkerContext) -> Result<()> + Send>;

/// Box a closure as a [`Job`].
pub fn job<F>(f: F) -> Job
where
    F: FnOnce(&WorkerContext) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

struct Pending {
    key: Option<i64>,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    per_root: HashMap<i64, VecDeque<Pending>>,
    /// Roots with pending work and no worker on them.
    ready: VecDeque<i64>,
    busy: Vec<i64>,
    /// Pending plus running jobs.
    outstanding: usize,
    workers: usize,
    closed: bool,
}

impl QueueState {
    fn has_pending(&self, root: i64) -> bool {
        self.per_root.get(&root).map_or(false, |q| !q.is_empty())
    }
}

/// Per-root FIFO work queues drained by a lazily grown worker pool.
///
/// Jobs of one root run one at a time and in order; different roots run
/// concurrently up to `max_workers`. Workers are spawned only when a root
/// has work and nobody serving it, and exit once nothing is ready.
pub struct LazyQueue {
    name: String,
    max_workers: usize,
    token: CancellationToken,
    state: Mutex<QueueState>,
    idle: Condvar,
    in_flight: DashSet<i64>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LazyQueue {
    pub fn new(name: &str, max_workers: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            max_workers: max_workers.max(1),
            token,
            state: Mutex::new(QueueState::default()),
            idle: Condvar::new(),
            in_flight: DashSet::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Queue a job under `root`. With a `key`, the job is dropped (returning
    /// `false`) while another job with the same key is pending or running.
    pub fn enqueue(self: &Arc<Self>, root: i64, key: Option<i64>, job: Job) -> Result<bool> {
        let spawn = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::QueueClosed);
            }
            if let Some(key) = key {
                if !self.in_flight.insert(key) {
                    return Ok(false);
                }
            }
            let was_idle = !state.has_pending(root) && !state.busy.contains(&root);
            state
                .per_root
                .entry(root)
                .or_default()
                .push_back(Pending { key, job });
            state.outstanding += 1;
            if was_idle {
                state.ready.push_back(root);
            }
            if state.workers < self.max_workers && !state.ready.is_empty() {
                state.workers += 1;
                true
            } else {
                false
            }
        };
        if spawn {
            self.spawn_worker()?;
        }
        Ok(true)
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || queue.work());
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.state.lock().workers -= 1;
                Err(Error::Io(e))
            }
        }
    }

    fn work(&self) {
        let ctx = WorkerContext::background(self.token.clone());
        loop {
            let (root, pending) = {
                let mut state = self.state.lock();
                let next = loop {
                    let root = match state.ready.pop_front() {
                        Some(root) => root,
                        None => break None,
                    };
                    if let Some(pending) = state.per_root.get_mut(&root).and_then(|q| q.pop_front())
                    {
                        break Some((root, pending));
                    }
                };
                match next {
                    Some((root, pending)) => {
                        state.busy.push(root);
                        (root, pending)
                    }
                    None => {
                        state.workers -= 1;
                        return;
                    }
                }
            };

            let job = pending.job;
            match panic::catch_unwind(AssertUnwindSafe(|| job(&ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(Error::Cancelled)) => {
                    debug!("{}: job for root {} cancelled", self.name, root)
                }
                Ok(Err(e)) => error!("{}: job for root {} failed: {}", self.name, root, e),
                Err(payload) => error!(
                    "{}: job for root {} panicked: {}",
                    self.name,
                    root,
                    panic_message(payload.as_ref())
                ),
            }
            if let Some(key) = pending.key {
                self.in_flight.remove(&key);
            }

            let mut state = self.state.lock();
            state.busy.retain(|r| *r != root);
            state.outstanding -= 1;
            if state.has_pending(root) {
                state.ready.push_back(root);
            } else {
                state.per_root.remove(&root);
            }
            if state.outstanding == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Pending plus running jobs.
    pub fn len(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Block until every queued job has finished.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.idle.wait(&mut state);
        }
    }

    /// Drop pending jobs without running them. Running jobs finish.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        for (_, pending) in state.per_root.drain() {
            for p in pending {
                if let Some(key) = p.key {
                    self.in_flight.remove(&key);
                }
                dropped += 1;
            }
        }
        state.ready.clear();
        state.outstanding -= dropped;
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
        dropped
    }

    /// Reject further jobs, drop pending ones, interrupt and join workers.
    pub fn close(&self) -> usize {
        self.state.lock().closed = true;
        self.token.cancel();
        let dropped = self.clear();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("{}: worker panicked", self.name);
            }
        }
        debug!("{} closed, {} jobs dropped", self.name, dropped);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_of_one_root_run_in_order() {
        let queue = LazyQueue::new("test", 4, CancellationToken::new());
        let seen = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            queue
                .enqueue(
                    1,
                    None,
                    job(move |_| {
                        seen.lock().push(i);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        queue.wait_idle();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_keys_are_dropped_while_in_flight() {
        let queue = LazyQueue::new("test", 1, CancellationToken::new());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let runs = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&runs);
        assert!(queue
            .enqueue(
                1,
                Some(42),
                job(move |_| {
                    release_rx.recv_timeout(Duration::from_secs(5)).ok();
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap());
        let r = Arc::clone(&runs);
        assert!(!queue
            .enqueue(
                1,
                Some(42),
                job(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap());

        release_tx.send(()).unwrap();
        queue.wait_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_drops_pending_and_rejects() {
        let queue = LazyQueue::new("test", 1, CancellationToken::new());
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let runs = Arc::new(AtomicUsize::new(0));

        queue
            .enqueue(
                1,
                None,
                job(move |ctx| {
                    started_tx.send(()).ok();
                    while !ctx.token().is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    ctx.checkpoint()
                }),
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..3 {
            let r = Arc::clone(&runs);
            queue
                .enqueue(
                    1,
                    None,
                    job(move |_| {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        assert_eq!(queue.close(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(matches!(
            queue.enqueue(1, None, job(|_| Ok(()))),
            Err(Error::QueueClosed)
        ));
    }

    #[test]
    fn test_roots_run_concurrently() {
        let queue = LazyQueue::new("test", 2, CancellationToken::new());
        let (tx, rx) = mpsc::channel::<i64>();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = Arc::new(PlMutex::new(go_rx));

        for root in [1, 2] {
            let tx = tx.clone();
            let go_rx = Arc::clone(&go_rx);
            queue
                .enqueue(
                    root,
                    None,
                    job(move |_| {
                        tx.send(root).ok();
                        go_rx.lock().recv_timeout(Duration::from_secs(5)).ok();
                        Ok(())
                    }),
                )
                .unwrap();
        }
        let mut started = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        started.sort();
        assert_eq!(started, vec![1, 2]);
        go_tx.send(()).unwrap();
        go_tx.send(()).unwrap();
        queue.wait_idle();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_panicking_job_is_retired() {
        let queue = LazyQueue::new("test", 1, CancellationToken::new());
        queue
            .enqueue(1, Some(7), job(|_| panic!("listing blew up")))
            .unwrap();
        queue.wait_idle();
        assert_eq!(queue.len(), 0);

        // The root and the key are free again.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        assert!(queue
            .enqueue(
                1,
                Some(7),
                job(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap());
        queue.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.close();
    }
}

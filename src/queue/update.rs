use super::panic_message;
use crate::error::{Error, Result};
use crate::storage::{apply_batch, Database, Mutation, SharedDb, StorageWriter};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

pub type UpdateJob = Box<dyn FnOnce(&Database) -> Result<()> + Send>;

/// Box a closure as an [`UpdateJob`].
pub fn update_job<F>(f: F) -> UpdateJob
where
    F: FnOnce(&Database) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePriority {
    Normal,
    Low,
}

struct Item {
    job: UpdateJob,
    done: Option<mpsc::Sender<Result<()>>>,
}

#[derive(Default)]
struct UpdateState {
    normal: VecDeque<Item>,
    low: VecDeque<Item>,
    running: bool,
    closed: bool,
}

impl UpdateState {
    fn pending(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    /// Normal first; low drains whenever normal is empty.
    fn next(&mut self) -> Option<Item> {
        self.normal.pop_front().or_else(|| self.low.pop_front())
    }
}

/// The single writer. Every storage mutation runs on one consumer thread, in
/// submission order within a priority.
pub struct UpdateQueue {
    db: SharedDb,
    state: Mutex<UpdateState>,
    available: Condvar,
    drained: Condvar,
    failures: AtomicUsize,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateQueue {
    pub fn start(db: SharedDb) -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            db,
            state: Mutex::new(UpdateState::default()),
            available: Condvar::new(),
            drained: Condvar::new(),
            failures: AtomicUsize::new(0),
            consumer: Mutex::new(None),
        });
        let worker = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name("update-queue".to_string())
            .spawn(move || worker.consume())?;
        *queue.consumer.lock() = Some(handle);
        Ok(queue)
    }

    fn consume(&self) {
        loop {
            let item = {
                let mut state = self.state.lock();
                loop {
                    if state.closed {
                        return;
                    }
                    if let Some(item) = state.next() {
                        state.running = true;
                        break item;
                    }
                    self.drained.notify_all();
                    self.available.wait(&mut state);
                }
            };

            let job = item.job;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let db = self.db.lock_low();
                job(&*db)
            }))
            .unwrap_or_else(|payload| {
                Err(Error::Other(format!(
                    "update panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
            match item.done {
                Some(done) => {
                    let _ = done.send(result);
                }
                None => {
                    if let Err(e) = result {
                        self.failures.fetch_add(1, Ordering::SeqCst);
                        error!("Update failed: {}", e);
                    }
                }
            }

            let mut state = self.state.lock();
            state.running = false;
            if state.pending() == 0 {
                self.drained.notify_all();
            }
        }
    }

    fn push(&self, item: Item, priority: UpdatePriority) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::QueueClosed);
        }
        match priority {
            UpdatePriority::Normal => state.normal.push_back(item),
            UpdatePriority::Low => state.low.push_back(item),
        }
        self.available.notify_one();
        Ok(())
    }

    pub fn submit(&self, job: UpdateJob, priority: UpdatePriority) -> Result<()> {
        self.push(Item { job, done: None }, priority)
    }

    /// Run a job on the writer thread and wait for its result. Must not be
    /// called while holding the database lock.
    pub fn submit_and_wait(&self, job: UpdateJob, priority: UpdatePriority) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.push(Item { job, done: Some(tx) }, priority)?;
        rx.recv().map_err(|_| Error::QueueClosed)?
    }

    /// Queued jobs, not counting the one running.
    pub fn len(&self) -> usize {
        self.state.lock().pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, priority: UpdatePriority) -> usize {
        let state = self.state.lock();
        match priority {
            UpdatePriority::Normal => state.normal.len(),
            UpdatePriority::Low => state.low.len(),
        }
    }

    /// Failed fire-and-forget jobs since the last call.
    pub fn take_failures(&self) -> usize {
        self.failures.swap(0, Ordering::SeqCst)
    }

    /// Block until nothing is queued or running.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while !state.closed && (state.running || state.pending() > 0) {
            self.drained.wait(&mut state);
        }
    }

    /// Drop queued jobs without running them.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending();
        state.normal.clear();
        state.low.clear();
        if !state.running {
            self.drained.notify_all();
        }
        dropped
    }

    /// Stop the consumer after its current job; queued jobs are dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            let dropped = state.pending();
            state.normal.clear();
            state.low.clear();
            self.available.notify_all();
            self.drained.notify_all();
            dropped
        };
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                error!("update consumer panicked");
            }
        }
        debug!("Update queue closed, {} jobs dropped", dropped);
        dropped
    }
}

/// Forwards batches to the update queue. Each batch is one job, applied in
/// one transaction.
pub struct QueuedWriter {
    queue: Arc<UpdateQueue>,
    priority: UpdatePriority,
    wait: bool,
}

impl QueuedWriter {
    pub fn new(queue: Arc<UpdateQueue>, priority: UpdatePriority) -> Self {
        Self {
            queue,
            priority,
            wait: false,
        }
    }

    /// Waits for each batch to be applied and surfaces its error.
    pub fn synchronous(queue: Arc<UpdateQueue>, priority: UpdatePriority) -> Self {
        Self {
            queue,
            priority,
            wait: true,
        }
    }
}

impl StorageWriter for QueuedWriter {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let job = update_job(move |db| apply_batch(db, &batch));
        if self.wait {
            self.queue.submit_and_wait(job, self.priority)
        } else {
            self.queue.submit(job, self.priority)
        }
    }
}

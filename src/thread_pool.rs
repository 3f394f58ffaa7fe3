use std::fmt::Debug;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::latch::CounterLatch;

/// A unit of work dispatched to the pool. Boxed so the scheduler can mix
/// outer-system dispatch and inner-subtask dispatch on the same queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Action {
    Run(Job, Arc<CounterLatch>),
    Stop,
}

impl Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Run(..) => write!(f, "Action::Run"),
            Action::Stop => write!(f, "Action::Stop"),
        }
    }
}

struct Worker {
    thread: JoinHandle<()>,
}

impl Worker {
    fn new(actions: Arc<Mutex<Receiver<Action>>>, id: u64) -> Self {
        Self {
            thread: thread::spawn(move || {
                log::trace!("worker {id}: started");
                while let Ok(action) = actions.lock().recv() {
                    log::trace!("worker {id}: received {action:?}");
                    match action {
                        Action::Run(job, latch) => {
                            job();
                            latch.notify();
                        }
                        Action::Stop => break,
                    }
                }
                log::trace!("worker {id}: stopping");
            }),
        }
    }
}

/// A fixed set of worker threads pulling jobs from a shared queue (C6).
/// Shutdown is signaled with a `Stop` sentinel per worker rather than
/// closing the channel, so outstanding jobs already queued still run.
pub struct ThreadPool {
    workers: Vec<Worker>,
    actions: Sender<Action>,
    receiver: Arc<Mutex<Receiver<Action>>>,
}

impl ThreadPool {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            workers: Vec::new(),
            actions: sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn with_workers(count: usize) -> Self {
        let mut pool = Self::new();
        pool.add_workers(count);
        pool
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn add_workers(&mut self, count: usize) {
        let mut ids = (self.worker_count() as u64)..;
        self.workers.extend(
            std::iter::repeat_with(|| Worker::new(self.receiver.clone(), ids.next().unwrap()))
                .take(count),
        );
    }

    pub fn ensure_workers(&mut self, count: usize) {
        let current = self.worker_count();
        if current < count {
            self.add_workers(count - current);
        }
    }

    /// Submit a job against a latch the caller owns, for callers that need
    /// to size and share one latch across jobs dispatched from more than
    /// one call site (e.g. the inner executor running `k - 1` subtasks on
    /// the pool and the last one locally, all against the same latch).
    pub fn submit(&self, job: Job, latch: Arc<CounterLatch>) {
        self.actions
            .send(Action::Run(job, latch))
            .expect("worker pool receiver dropped while a job was submitted");
    }

    /// Submit a single job, returning a latch that releases once it's done.
    pub fn run(&self, job: Job) -> Arc<CounterLatch> {
        let latch = Arc::new(CounterLatch::new(1));
        self.actions
            .send(Action::Run(job, latch.clone()))
            .expect("worker pool receiver dropped while a job was submitted");
        latch
    }

    /// Submit a batch of jobs, returning one latch that releases once every
    /// job in the batch has completed.
    pub fn run_many(&self, jobs: Vec<Job>) -> Arc<CounterLatch> {
        let latch = Arc::new(CounterLatch::new(jobs.len() as u32));
        for job in jobs {
            self.actions
                .send(Action::Run(job, latch.clone()))
                .expect("worker pool receiver dropped while a job was submitted");
        }
        latch
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in 0..self.worker_count() {
            let _ = self.actions.send(Action::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.thread.join();
        }
    }
}

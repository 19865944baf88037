//! Per-device I/O thread pools
//!
//! Blocking filesystem calls for one device run on that device's pool, so a
//! slow disk only stalls requests for itself. A pool with zero workers runs
//! jobs on the calling thread, and so does a job submitted from one of the
//! pool's own workers.

use crossbeam_channel::{Receiver, Sender};
use objectio_common::{Error, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads fed by a channel
pub struct ThreadPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    worker_ids: Vec<ThreadId>,
}

impl ThreadPool {
    /// Start `workers` threads named after `name`
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Ok(Self {
                name: name.to_string(),
                sender: None,
                workers: Vec::new(),
                worker_ids: Vec::new(),
            });
        }

        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("io-{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            handles.push(handle);
        }
        debug!("Started {} I/O threads for {}", workers, name);

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            worker_ids: handles.iter().map(|h| h.thread().id()).collect(),
            workers: handles,
        })
    }

    /// Number of worker threads (0 means inline)
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `f` on a worker and wait for its result.
    ///
    /// A panicking job is reported as [`Error::Internal`]; the worker
    /// survives.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let on_worker = self.worker_ids.contains(&std::thread::current().id());
        let sender = match &self.sender {
            Some(sender) if !on_worker => sender,
            _ => {
                return catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| Err(self.panicked()));
            }
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });
        sender
            .send(job)
            .map_err(|_| Error::internal(format!("I/O pool {} is shut down", self.name)))?;

        match rx.recv() {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.panicked()),
            Err(_) => Err(Error::internal(format!(
                "I/O pool {} dropped a job",
                self.name
            ))),
        }
    }

    fn panicked(&self) -> Error {
        error!("Job panicked on I/O pool {}", self.name);
        Error::internal(format!("job panicked on I/O pool {}", self.name))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        self.sender.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner may be one of our own jobs
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

//! Fixed worker pool for block I/O.
//!
//! Accesses submit closures and get back channel-backed [`Handle`]s; the
//! box query engine awaits handles in the order it issued them, which is
//! what gives a query its deterministic block order no matter how the
//! workers interleave.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One-shot future resolved by a pool worker.
#[derive(Debug)]
pub struct Handle<T> {
    rx: Receiver<T>,
}

impl<T: Send + 'static> Handle<T> {
    /// Block until the job finishes. `None` only if the worker died
    /// without delivering (a panic inside the job).
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// An already-resolved handle; lets synchronous paths share the
    /// submit/await calling convention.
    pub fn ready(value: T) -> Handle<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(value);
        Handle { rx }
    }
}

pub struct IoPool {
    tx:      Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for IoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPool").field("workers", &self.workers.len()).finish()
    }
}

impl IoPool {
    /// `nthreads = 0` picks the machine's logical core count.
    pub fn new(nthreads: usize) -> Arc<IoPool> {
        let nthreads = if nthreads == 0 { num_cpus::get() } else { nthreads };
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..nthreads)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("hzidx-io-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                        }
                    })
                    .expect("spawning an I/O worker")
            })
            .collect();
        Arc::new(IoPool { tx: Some(tx), workers })
    }

    /// Queue `job`; its return value resolves the handle.
    pub fn submit<T, F>(&self, job: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(job());
        });
        self.tx
            .as_ref()
            .expect("pool is shutting down")
            .send(job)
            .expect("pool workers are gone");
        Handle { rx }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        // Closing the channel drains queued jobs, then workers exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

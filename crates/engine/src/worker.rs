//! Background repository workers
//!
//! A `RepositoryWorker` is a dedicated thread that owns a private view and
//! runs requests from a bounded mailbox, one at a time, in FIFO order.
//! Producers block in [`enqueue`](RepositoryWorker::enqueue) while the
//! mailbox is full.

use crate::repository::Repository;
use crate::view::RepositoryView;
use cairn_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Work run on the worker thread against its view
pub type Request = Box<dyn FnOnce(&mut RepositoryView) + Send>;

struct MailboxState {
    queue: VecDeque<Request>,
    active: bool,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    capacity: usize,
    terminating: AtomicBool,
    processed: AtomicU64,
    panicked: AtomicU64,
}

/// A thread owning a private view and draining a request mailbox
pub struct RepositoryWorker {
    name: String,
    mailbox: Arc<Mailbox>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RepositoryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryWorker")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("processed", &self.processed())
            .finish()
    }
}

impl RepositoryWorker {
    /// Start a worker with a view named `name` at the latest version
    ///
    /// # Errors
    ///
    /// `Error::Config` for a zero capacity; `Error::Io` if the thread cannot
    /// be spawned.
    pub fn spawn(repo: &Repository, name: &str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "worker mailbox capacity must be at least 1".to_string(),
            ));
        }
        let view = repo.create_view(Some(name), None)?;
        let mailbox = Arc::new(Mailbox {
            state: Mutex::new(MailboxState {
                queue: VecDeque::with_capacity(capacity),
                active: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            capacity,
            terminating: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let thread_mailbox = Arc::clone(&mailbox);
        let handle = std::thread::Builder::new()
            .name(format!("cairn-worker-{}", name))
            .spawn(move || worker_loop(&thread_mailbox, view))?;
        info!(worker = name, capacity, "Started repository worker");

        Ok(Self {
            name: name.to_string(),
            mailbox,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Worker name, also the name of its view
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `request`, blocking while the mailbox is full
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` once the worker is terminating.
    pub fn enqueue(&self, request: impl FnOnce(&mut RepositoryView) + Send + 'static) -> Result<()> {
        let mut state = self.mailbox.state.lock();
        while state.queue.len() >= self.mailbox.capacity && !self.is_terminating() {
            self.mailbox.not_full.wait(&mut state);
        }
        if self.is_terminating() {
            return Err(self.terminated());
        }
        state.queue.push_back(Box::new(request));
        self.mailbox.not_empty.notify_one();
        Ok(())
    }

    /// Queue `request` without blocking
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if the mailbox is full or the worker is
    /// terminating.
    pub fn try_enqueue(
        &self,
        request: impl FnOnce(&mut RepositoryView) + Send + 'static,
    ) -> Result<()> {
        if self.is_terminating() {
            return Err(self.terminated());
        }
        let mut state = self.mailbox.state.lock();
        if state.queue.len() >= self.mailbox.capacity {
            return Err(Error::invalid_state(format!(
                "mailbox of worker '{}' is full ({} requests)",
                self.name, self.mailbox.capacity
            )));
        }
        state.queue.push_back(Box::new(request));
        self.mailbox.not_empty.notify_one();
        Ok(())
    }

    /// Block until the mailbox is empty and no request is running
    pub fn drain(&self) {
        let mut state = self.mailbox.state.lock();
        while (!state.queue.is_empty() || state.active) && !self.is_terminating() {
            self.mailbox.idle.wait(&mut state);
        }
    }

    /// Requests waiting in the mailbox
    pub fn pending(&self) -> usize {
        self.mailbox.state.lock().queue.len()
    }

    /// Requests completed, including ones that panicked
    pub fn processed(&self) -> u64 {
        self.mailbox.processed.load(Ordering::Relaxed)
    }

    /// Requests that panicked
    pub fn panicked(&self) -> u64 {
        self.mailbox.panicked.load(Ordering::Relaxed)
    }

    /// True once `terminate` has been called
    pub fn is_terminating(&self) -> bool {
        self.mailbox.terminating.load(Ordering::Acquire)
    }

    fn terminated(&self) -> Error {
        Error::invalid_state(format!("worker '{}' is terminating", self.name))
    }

    /// Stop the worker: the running request finishes, queued ones are
    /// dropped, and the thread is joined
    pub fn terminate(&self) {
        self.mailbox.terminating.store(true, Ordering::Release);
        {
            // Hold the lock so a worker between its check and wait sees the flag
            let _state = self.mailbox.state.lock();
            self.mailbox.not_empty.notify_all();
            self.mailbox.not_full.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for RepositoryWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(mailbox: &Mailbox, mut view: RepositoryView) {
    loop {
        let request = {
            let mut state = mailbox.state.lock();
            loop {
                if mailbox.terminating.load(Ordering::Acquire) {
                    let dropped = state.queue.len();
                    state.queue.clear();
                    mailbox.idle.notify_all();
                    drop(state);
                    view.close_view();
                    info!(worker = view.name(), dropped, "Repository worker stopped");
                    return;
                }
                if let Some(request) = state.queue.pop_front() {
                    state.active = true;
                    mailbox.not_full.notify_one();
                    break request;
                }
                mailbox.not_empty.wait(&mut state);
            }
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| request(&mut view)));
        if let Err(e) = outcome {
            mailbox.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                worker = view.name(),
                "Worker request panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
            if let Err(e) = view.cancel() {
                warn!(worker = view.name(), error = %e, "Failed to discard changes of a panicked request");
            }
        }
        mailbox.processed.fetch_add(1, Ordering::Relaxed);
        debug!(worker = view.name(), "Finished worker request");

        let mut state = mailbox.state.lock();
        state.active = false;
        if state.queue.is_empty() {
            mailbox.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{Attribute, ItemId, Schema, SchemaBuilder, ValueType};
    use std::sync::mpsc;

    fn schema() -> Schema {
        SchemaBuilder::new()
            .kind("Job", &[], vec![Attribute::new("label").with_type(ValueType::Text)])
            .build()
            .unwrap()
    }

    #[test]
    fn test_requests_run_in_order_and_commit() {
        let repo = Repository::ephemeral(schema()).unwrap();
        let worker = RepositoryWorker::spawn(&repo, "indexer", 8).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            worker
                .enqueue(move |view| {
                    let job = view.create_item("Job", None, None).unwrap();
                    view.set_value(job, "label", format!("job {}", i)).unwrap();
                    tx.send((i, view.commit().unwrap())).unwrap();
                })
                .unwrap();
        }
        worker.drain();
        let results: Vec<(i32, u64)> = rx.try_iter().collect();
        assert_eq!(results, (0..5).map(|i| (i, i as u64 + 1)).collect::<Vec<_>>());
        assert_eq!(worker.processed(), 5);
        assert_eq!(repo.latest_version(), 5);
        assert_eq!(repo.open_views(), vec!["indexer"]);
        worker.terminate();
        assert!(repo.open_views().is_empty());
    }

    #[test]
    fn test_try_enqueue_fails_fast_when_full() {
        let repo = Repository::ephemeral(schema()).unwrap();
        let worker = RepositoryWorker::spawn(&repo, "busy", 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        worker
            .enqueue(move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv().unwrap();

        worker.try_enqueue(|_| {}).unwrap();
        assert_eq!(worker.pending(), 1);
        assert!(matches!(worker.try_enqueue(|_| {}), Err(Error::InvalidState(_))));

        release_tx.send(()).unwrap();
        worker.drain();
        assert_eq!(worker.processed(), 2);
    }

    #[test]
    fn test_panicking_request_discards_changes() {
        let repo = Repository::ephemeral(schema()).unwrap();
        let worker = RepositoryWorker::spawn(&repo, "fragile", 4).unwrap();
        let (tx, rx) = mpsc::channel();
        worker
            .enqueue(|view| {
                view.create_item("Job", None, None).unwrap();
                panic!("request failed");
            })
            .unwrap();
        worker
            .enqueue(move |view| {
                tx.send((view.is_dirty(), view.roots().unwrap())).unwrap();
            })
            .unwrap();
        worker.drain();
        assert_eq!(rx.recv().unwrap(), (false, Vec::<ItemId>::new()));
        assert_eq!(worker.panicked(), 1);
        assert_eq!(worker.processed(), 2);
    }

    #[test]
    fn test_terminate_finishes_in_flight_request() {
        let repo = Repository::ephemeral(schema()).unwrap();
        let worker = RepositoryWorker::spawn(&repo, "stopping", 4).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        worker
            .enqueue(move |view| {
                started_tx.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(50));
                view.create_item("Job", None, None).unwrap();
                view.commit().unwrap();
            })
            .unwrap();
        started_rx.recv().unwrap();
        worker.enqueue(|_| panic!("never runs")).unwrap();

        worker.terminate();
        assert_eq!(repo.latest_version(), 1);
        assert_eq!(worker.processed(), 1);
        assert_eq!(worker.panicked(), 0);
        assert!(matches!(worker.enqueue(|_| {}), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let repo = Repository::ephemeral(schema()).unwrap();
        assert!(matches!(
            RepositoryWorker::spawn(&repo, "none", 0),
            Err(Error::Config(_))
        ));
    }
}

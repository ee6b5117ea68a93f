//! Fault-injecting container

use cairn_core::{Container, Error, Result, WriteBatch};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Container wrapper that fails batches with `Error::Deadlock`
///
/// Reads always pass through. A failed batch applies nothing.
pub struct FlakyContainer {
    inner: Arc<dyn Container>,
    pending_failures: AtomicUsize,
    always_fail: AtomicBool,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl std::fmt::Debug for FlakyContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyContainer")
            .field("attempts", &self.attempts())
            .field("failures", &self.failures())
            .finish()
    }
}

impl FlakyContainer {
    /// Wrap `inner` with no failures scheduled
    pub fn new(inner: Arc<dyn Container>) -> Self {
        Self {
            inner,
            pending_failures: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` batches
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every batch until switched off
    pub fn fail_always(&self, on: bool) {
        self.always_fail.store(on, Ordering::SeqCst);
    }

    /// Batches attempted so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Batches rejected so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Container for FlakyContainer {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Deadlock {
                context: "injected".to_string(),
                attempts: 1,
            });
        }
        self.inner.apply_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::KvContainer;
    use crate::retry::{retry_on_deadlock, RetryConfig};

    #[test]
    fn test_failed_batch_applies_nothing() {
        let flaky = FlakyContainer::new(Arc::new(KvContainer::in_memory()));
        flaky.fail_next(1);
        assert!(flaky.put(b"k", b"v").unwrap_err().is_transient());
        assert!(flaky.get(b"k").unwrap().is_none());
        assert_eq!(flaky.failures(), 1);
    }

    #[test]
    fn test_retry_recovers() {
        let flaky = FlakyContainer::new(Arc::new(KvContainer::in_memory()));
        flaky.fail_next(2);
        let config = RetryConfig::new().with_base_delay_ms(0);
        retry_on_deadlock(&config, "put", || flaky.put(b"k", b"v")).unwrap();
        assert_eq!(flaky.attempts(), 3);
        assert_eq!(flaky.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_always_fail_exhausts_retries() {
        let flaky = FlakyContainer::new(Arc::new(KvContainer::in_memory()));
        flaky.fail_always(true);
        let config = RetryConfig::new().with_max_retries(3).with_base_delay_ms(0);
        let err = retry_on_deadlock(&config, "put", || flaky.put(b"k", b"v")).unwrap_err();
        assert!(matches!(err, Error::Deadlock { attempts: 4, .. }));

        flaky.fail_always(false);
        assert!(flaky.put(b"k", b"v").is_ok());
    }
}

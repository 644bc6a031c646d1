//! Kernel client lifecycle controller.
//!
//! A [`Lifecycle`] owns a slot holding at most one live kernel client. The
//! client is constructed lazily by the first [`acquire`](Lifecycle::acquire),
//! shared by every later caller, and torn down by
//! [`release`](Lifecycle::release). Using the controller again after a
//! release transparently constructs a new client (the next *generation*).
//!
//! # State machine
//!
//! ```text
//! Empty --acquire--> Initializing --ok--> Ready --release--> Closing --> Empty
//!                          |
//!                          +--error--> Empty
//! ```
//!
//! `Initializing` and `Closing` are transient. Collaborator code runs outside
//! the lock while the phase is transient, and every other caller waits on a
//! condition variable until the phase is stable again. This gives the
//! exactly-once guarantee per generation and keeps a release from ever
//! interleaving with a construction.

use crate::error::{Error, LifecycleError};
use crate::handle::KernelHandle;
use crate::kernel::{CloseToken, KernelClient, KernelFactory};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Phase state machine for the client slot.
enum Phase<C> {
    /// No client; the next acquire constructs one.
    Empty,
    /// A caller is running the factory.
    Initializing,
    /// The client is live and shared.
    Ready(KernelHandle<C>),
    /// A caller is closing the client.
    Closing,
}

struct Slot<C> {
    phase: Phase<C>,
    /// Initialization attempts started so far.
    attempts: u64,
    /// Clients successfully constructed so far.
    generation: u64,
    /// Failure of the most recent attempt, shared with its waiters.
    last_failure: Option<(u64, Arc<Error>)>,
}

impl<C> Slot<C> {
    fn is_transient(&self) -> bool {
        matches!(self.phase, Phase::Initializing | Phase::Closing)
    }
}

/// Concurrency-safe owner of a single kernel client.
///
/// # Example
///
/// ```ignore
/// let lifecycle = Lifecycle::new(ProcessKernel::new(KernelConfig::load_or_default()));
/// let kernel = lifecycle.acquire()?;
/// println!("connected to {}", kernel.kernel_version());
/// lifecycle.release()?;
/// ```
pub struct Lifecycle<F: KernelFactory> {
    factory: F,
    slot: Mutex<Slot<F::Client>>,
    settled: Condvar,
}

impl<F: KernelFactory> Lifecycle<F> {
    /// Create a controller with an empty slot. Nothing is started until the
    /// first [`acquire`](Self::acquire).
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slot: Mutex::new(Slot {
                phase: Phase::Empty,
                attempts: 0,
                generation: 0,
                last_failure: None,
            }),
            settled: Condvar::new(),
        }
    }

    /// The factory used to construct clients.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get the live client, constructing one if the slot is empty.
    ///
    /// Among any number of concurrent callers hitting an empty slot exactly
    /// one runs the factory; the rest block until it finishes and then
    /// observe the same client, or the same [`LifecycleError::Construction`].
    /// A failed attempt leaves the slot empty so a later call retries.
    pub fn acquire(&self) -> Result<KernelHandle<F::Client>, LifecycleError> {
        let mut slot = self.lock();
        // Earliest attempt we blocked on, if any.
        let mut awaited: Option<u64> = None;

        loop {
            match &slot.phase {
                Phase::Ready(handle) => return Ok(handle.clone()),
                Phase::Initializing => {
                    awaited.get_or_insert(slot.attempts);
                    slot = self.wait(slot);
                }
                Phase::Closing => slot = self.wait(slot),
                Phase::Empty => {
                    // Later attempts may have failed too before we woke up;
                    // report the newest failure instead of trying again.
                    if let (Some(attempt), Some((failed, err))) = (awaited, &slot.last_failure) {
                        if *failed >= attempt {
                            return Err(LifecycleError::Construction(Arc::clone(err)));
                        }
                    }
                    break;
                }
            }
        }

        slot.phase = Phase::Initializing;
        slot.attempts += 1;
        let attempt = slot.attempts;
        drop(slot);

        log::debug!("Constructing kernel client (attempt {})", attempt);
        let mut transition = Transition::new(self);
        let result = self.factory.construct();

        let mut slot = self.lock();
        let outcome = match result {
            Ok(client) => {
                slot.generation += 1;
                let handle = KernelHandle::new(Arc::new(client), slot.generation);
                slot.phase = Phase::Ready(handle.clone());
                slot.last_failure = None;
                log::debug!("Kernel client ready (generation {})", handle.generation());
                Ok(handle)
            }
            Err(err) => {
                let err = Arc::new(err);
                slot.phase = Phase::Empty;
                slot.last_failure = Some((attempt, Arc::clone(&err)));
                Err(LifecycleError::Construction(err))
            }
        };
        transition.commit(slot);
        outcome
    }

    /// Close the live client, if any, and re-arm the controller.
    ///
    /// Waits for an in-flight construction or close to finish first. When the
    /// slot is empty this is a no-op and the collaborator is not called. The
    /// slot is emptied even when closing fails; the failure is returned as
    /// [`LifecycleError::Closure`] and the next acquire starts a new client.
    pub fn release(&self) -> Result<(), LifecycleError> {
        let mut slot = self.lock();
        while slot.is_transient() {
            slot = self.wait(slot);
        }

        let handle = match std::mem::replace(&mut slot.phase, Phase::Closing) {
            Phase::Ready(handle) => handle,
            other => {
                slot.phase = other;
                return Ok(());
            }
        };
        drop(slot);

        log::debug!("Closing kernel client (generation {})", handle.generation());
        let mut transition = Transition::new(self);
        let result = handle.client().close(CloseToken::new());

        let mut slot = self.lock();
        slot.phase = Phase::Empty;
        transition.commit(slot);

        result.map_err(LifecycleError::Closure)
    }

    /// Returns a guard that releases the client when dropped.
    ///
    /// A close failure during drop is logged rather than propagated.
    pub fn release_on_drop(&self) -> ReleaseGuard<'_, F> {
        ReleaseGuard { lifecycle: self }
    }

    /// The live client, without constructing one.
    ///
    /// Returns `None` while the slot is empty or in transition.
    pub fn current(&self) -> Option<KernelHandle<F::Client>> {
        match &self.lock().phase {
            Phase::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// True if a client is live.
    pub fn is_ready(&self) -> bool {
        matches!(self.lock().phase, Phase::Ready(_))
    }

    /// Number of clients constructed so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    // The guarded section never runs collaborator code, so a poisoned lock
    // still holds a consistent slot.
    fn lock(&self) -> MutexGuard<'_, Slot<F::Client>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Slot<F::Client>>) -> MutexGuard<'a, Slot<F::Client>> {
        self.settled
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Restores the slot to `Empty` if collaborator code unwinds mid-transition.
struct Transition<'a, F: KernelFactory> {
    lifecycle: &'a Lifecycle<F>,
    committed: bool,
}

impl<'a, F: KernelFactory> Transition<'a, F> {
    fn new(lifecycle: &'a Lifecycle<F>) -> Self {
        Self {
            lifecycle,
            committed: false,
        }
    }

    fn commit(&mut self, slot: MutexGuard<'_, Slot<F::Client>>) {
        self.committed = true;
        drop(slot);
        self.lifecycle.settled.notify_all();
    }
}

impl<F: KernelFactory> Drop for Transition<'_, F> {
    fn drop(&mut self) {
        if !self.committed {
            log::warn!("Kernel client transition aborted, resetting slot");
            self.lifecycle.lock().phase = Phase::Empty;
            self.lifecycle.settled.notify_all();
        }
    }
}

/// Releases the kernel client of a [`Lifecycle`] when dropped.
///
/// Created by [`Lifecycle::release_on_drop`]. Typically held at the top of
/// `main` so the kernel is shut down on every exit path.
#[must_use = "the client is released as soon as the guard is dropped"]
pub struct ReleaseGuard<'a, F: KernelFactory> {
    lifecycle: &'a Lifecycle<F>,
}

impl<F: KernelFactory> Drop for ReleaseGuard<'_, F> {
    fn drop(&mut self) {
        if let Err(e) = self.lifecycle.release() {
            log::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        constructed: AtomicUsize,
        closed: AtomicUsize,
        fail_construct: AtomicBool,
        fail_close: AtomicBool,
        panic_close: AtomicBool,
    }

    struct TestClient {
        id: usize,
        counters: Arc<Counters>,
    }

    impl KernelClient for TestClient {
        fn close(&self, _: CloseToken) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            if self.counters.panic_close.load(Ordering::SeqCst) {
                panic!("kernel refused to die");
            }
            if self.counters.fail_close.load(Ordering::SeqCst) {
                return Err(Error::Kernel("close refused".into()));
            }
            Ok(())
        }
    }

    fn lifecycle() -> (Lifecycle<impl KernelFactory<Client = TestClient>>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        let factory = move || -> Result<TestClient> {
            let id = shared.constructed.fetch_add(1, Ordering::SeqCst) + 1;
            if shared.fail_construct.load(Ordering::SeqCst) {
                return Err(Error::Handshake("no greeting".into()));
            }
            Ok(TestClient {
                id,
                counters: Arc::clone(&shared),
            })
        };
        (Lifecycle::new(factory), counters)
    }

    #[test]
    fn test_starts_empty() {
        let (lc, counters) = lifecycle();
        assert!(!lc.is_ready());
        assert!(lc.current().is_none());
        assert_eq!(lc.generation(), 0);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_acquire_reuses_client() {
        let (lc, counters) = lifecycle();
        let a = lc.acquire().unwrap();
        let b = lc.acquire().unwrap();
        assert!(a.same_client(&b));
        assert_eq!(a.generation(), 1);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1);
        assert!(lc.current().unwrap().same_client(&a));
    }

    #[test]
    fn test_release_then_acquire_builds_new_generation() {
        let (lc, counters) = lifecycle();
        let first = lc.acquire().unwrap();
        lc.release().unwrap();
        assert!(!lc.is_ready());
        let second = lc.acquire().unwrap();

        assert!(!first.same_client(&second));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.generation(), 2);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_when_empty_is_noop() {
        let (lc, counters) = lifecycle();
        lc.release().unwrap();
        lc.release().unwrap();
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_release_closes_once() {
        let (lc, counters) = lifecycle();
        lc.acquire().unwrap();
        lc.release().unwrap();
        lc.release().unwrap();
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_construction_failure_is_retried() {
        let (lc, counters) = lifecycle();
        counters.fail_construct.store(true, Ordering::SeqCst);

        let err = lc.acquire().unwrap_err();
        assert!(matches!(err, LifecycleError::Construction(_)));
        assert!(matches!(err.kernel_error(), Error::Handshake(_)));
        assert!(!lc.is_ready());
        assert_eq!(lc.generation(), 0);

        counters.fail_construct.store(false, Ordering::SeqCst);
        let handle = lc.acquire().unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_failure_still_resets() {
        let (lc, counters) = lifecycle();
        lc.acquire().unwrap();
        counters.fail_close.store(true, Ordering::SeqCst);

        let err = lc.release().unwrap_err();
        assert!(matches!(err, LifecycleError::Closure(Error::Kernel(_))));
        assert!(!lc.is_ready());

        counters.fail_close.store(false, Ordering::SeqCst);
        let handle = lc.acquire().unwrap();
        assert_eq!(handle.generation(), 2);
    }

    #[test]
    fn test_release_guard_releases_on_drop() {
        let (lc, counters) = lifecycle();
        {
            let _guard = lc.release_on_drop();
            lc.acquire().unwrap();
        }
        assert!(!lc.is_ready());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_factory_does_not_wedge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let counters = Arc::new(Counters::default());
        let lc = Lifecycle::new(move || -> Result<TestClient> {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("kernel exploded");
            }
            Ok(TestClient {
                id: 1,
                counters: Arc::clone(&counters),
            })
        });

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lc.acquire()));
        assert!(outcome.is_err());
        assert!(!lc.is_ready());

        let handle = lc.acquire().unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_close_does_not_wedge() {
        let (lc, counters) = lifecycle();
        lc.acquire().unwrap();
        counters.panic_close.store(true, Ordering::SeqCst);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lc.release()));
        assert!(outcome.is_err());
        assert!(!lc.is_ready());

        counters.panic_close.store(false, Ordering::SeqCst);
        let handle = lc.acquire().unwrap();
        assert_eq!(handle.generation(), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_guard_with_panicking_close() {
        let (lc, counters) = lifecycle();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lc.release_on_drop();
            lc.acquire().unwrap();
            counters.panic_close.store(true, Ordering::SeqCst);
        }));
        assert!(outcome.is_err());
        assert!(!lc.is_ready());

        counters.panic_close.store(false, Ordering::SeqCst);
        assert_eq!(lc.acquire().unwrap().generation(), 2);
    }

    #[test]
    fn test_release_guard_logs_close_failure() {
        let (lc, counters) = lifecycle();
        {
            let _guard = lc.release_on_drop();
            lc.acquire().unwrap();
            counters.fail_close.store(true, Ordering::SeqCst);
        }
        assert!(!lc.is_ready());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiter_reports_newer_failure() {
        let (lc, counters) = lifecycle();
        let lc = Arc::new(lc);
        {
            let mut slot = lc.lock();
            slot.phase = Phase::Initializing;
            slot.attempts = 1;
        }

        let waiter = {
            let lc = Arc::clone(&lc);
            std::thread::spawn(move || lc.acquire().map(|h| h.generation()))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));

        // Attempt 1 failed and attempt 2 failed too before the waiter woke.
        {
            let mut slot = lc.lock();
            slot.phase = Phase::Empty;
            slot.attempts = 2;
            slot.last_failure = Some((2, Arc::new(Error::Handshake("second".into()))));
        }
        lc.settled.notify_all();

        match waiter.join().unwrap() {
            Err(LifecycleError::Construction(err)) => {
                assert!(matches!(&*err, Error::Handshake(msg) if msg == "second"))
            }
            other => panic!("expected shared failure, got {:?}", other),
        }
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);
    }
}

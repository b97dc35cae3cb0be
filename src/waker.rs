//! Wake signals that drive log stream read cycles.
//!
//! Streams call [`Waker::wait`] between reads. In production this is a timer.
//! Tests use a [`TestWaker`] instead: every stream parks until the test calls
//! [`TestWaker::wake`], so a test can say exactly how many read cycles
//! happened before it inspects the results.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone)]
pub enum Waker {
    /// Wake after a fixed interval.
    Timed(Duration),
    /// Wake when a test says so.
    Test(Arc<TestWaker>),
}

impl Waker {
    pub fn timed(interval: Duration) -> Self {
        Waker::Timed(interval)
    }

    /// A manually driven waker plus the handle that drives it.
    pub fn test() -> (Self, Arc<TestWaker>) {
        let handle = Arc::new(TestWaker::default());
        (Waker::Test(handle.clone()), handle)
    }

    pub async fn wait(&self) {
        match self {
            Waker::Timed(interval) => tokio::time::sleep(*interval).await,
            Waker::Test(w) => w.wait().await,
        }
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Waker::Timed(d) => write!(f, "Waker::Timed({:?})", d),
            Waker::Test(w) => write!(f, "Waker::Test(generation {})", w.generation()),
        }
    }
}

#[derive(Debug, Default)]
struct WakeState {
    generation: u64,
    waiting: usize,
}

/// A deterministic wake source with a generation counter.
#[derive(Debug, Default)]
pub struct TestWaker {
    state: Mutex<WakeState>,
    /// Signalled whenever a waiter parks.
    parked: Notify,
    /// Signalled when the generation advances.
    woken: Notify,
}

/// Un-counts a waiter whose wait was cancelled before it was woken.
struct ParkGuard<'a> {
    waker: &'a TestWaker,
    generation: u64,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.waker.lock();
        if state.generation == self.generation {
            state.waiting = state.waiting.saturating_sub(1);
        }
    }
}

impl TestWaker {
    fn lock(&self) -> std::sync::MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of completed wake calls.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of callers currently parked in [`wait`](Self::wait).
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    async fn wait(&self) {
        let generation = {
            let mut state = self.lock();
            state.waiting += 1;
            state.generation
        };
        let _guard = ParkGuard {
            waker: self,
            generation,
        };
        self.parked.notify_waiters();

        loop {
            let woken = self.woken.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            let current = self.lock().generation;
            if current != generation {
                return;
            }
            woken.await;
        }
    }

    /// Waits until at least `n` callers are parked, without waking them.
    pub async fn parked(&self, n: usize) {
        loop {
            let parked = self.parked.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            let waiting = self.lock().waiting;
            if waiting >= n {
                return;
            }
            parked.await;
        }
    }

    fn try_advance(&self, n: usize) -> bool {
        let mut state = self.lock();
        if state.waiting < n {
            return false;
        }
        state.generation += 1;
        state.waiting = 0;
        true
    }

    /// Waits until at least `n` callers are parked, then releases all of them
    /// and advances the generation.
    pub async fn wake(&self, n: usize) {
        loop {
            let parked = self.parked.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            if self.try_advance(n) {
                break;
            }
            parked.await;
        }
        self.woken.notify_waiters();
    }
}

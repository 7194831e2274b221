//! Delivery cadence: the adaptive interval, the delivery timer and the
//! coalescer that debounces interval updates.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// Interval used while deliveries succeed, in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 10;

/// Below this the interval moves by a factor of ten.
const DECADE_LIMIT_MS: u64 = 10_000;

const BACKOFF_PLATEAU_MS: u64 = 30_000;

/// Longest interval ever used.
pub const MAX_INTERVAL_MS: u64 = 960_000;

/// Time until the next delivery attempt.
///
/// Updated once per completed attempt:
///
/// | current            | success        | failure   |
/// |--------------------|----------------|-----------|
/// | 10                 | 10             | ×10       |
/// | 10 < i < 10000     | ÷10 (floor 10) | ×10       |
/// | 10000              | 1000           | 30000     |
/// | 30000              | 10000          | 30000     |
/// | other, < 960000    | ÷2             | ×2        |
/// | ≥ 960000           | ÷2             | unchanged |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInterval {
    millis: u64,
}

impl Default for DeliveryInterval {
    fn default() -> Self {
        Self { millis: DEFAULT_INTERVAL_MS }
    }
}

impl DeliveryInterval {
    /// Clamped to `DEFAULT_INTERVAL_MS..=MAX_INTERVAL_MS`.
    pub fn from_millis(millis: u64) -> Self {
        Self { millis: millis.clamp(DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS) }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }

    /// `false` once deliveries have started failing.
    pub fn is_default(&self) -> bool {
        self.millis == DEFAULT_INTERVAL_MS
    }

    pub fn next(self, failed: bool) -> Self {
        let millis = match (self.millis, failed) {
            (DEFAULT_INTERVAL_MS, false) => DEFAULT_INTERVAL_MS,
            (i, true) if i < DECADE_LIMIT_MS => i * 10,
            (i, false) if i < DECADE_LIMIT_MS => (i / 10).max(DEFAULT_INTERVAL_MS),
            // TODO: confirm with the collector team; every other success step
            // divides by ten or two, this one by ten twice over the 30000 plateau.
            (DECADE_LIMIT_MS, false) => 1_000,
            (DECADE_LIMIT_MS, true) => BACKOFF_PLATEAU_MS,
            (BACKOFF_PLATEAU_MS, false) => DECADE_LIMIT_MS,
            (BACKOFF_PLATEAU_MS, true) => BACKOFF_PLATEAU_MS,
            (i, true) if i >= MAX_INTERVAL_MS => i,
            (i, true) => (i * 2).min(MAX_INTERVAL_MS),
            (i, false) => (i / 2).max(DEFAULT_INTERVAL_MS),
        };
        Self { millis }
    }

    /// Lower the interval to `requested` (never below the default). Never raises it.
    pub fn lowered_to(self, requested: u64) -> Self {
        let requested = requested.max(DEFAULT_INTERVAL_MS);
        Self { millis: self.millis.min(requested) }
    }
}

/// Delivery interval shared between the agent and its coalescer task.
#[derive(Debug, Clone, Default)]
pub struct SharedInterval(Arc<AtomicU64>);

impl SharedInterval {
    pub fn new(interval: DeliveryInterval) -> Self {
        Self(Arc::new(AtomicU64::new(interval.millis())))
    }

    pub fn get(&self) -> DeliveryInterval {
        DeliveryInterval::from_millis(self.0.load(Ordering::SeqCst))
    }

    pub fn record(&self, failed: bool) -> DeliveryInterval {
        self.update(|interval| interval.next(failed))
    }

    pub fn lower_to(&self, requested: u64) -> DeliveryInterval {
        self.update(|interval| interval.lowered_to(requested))
    }

    fn update(&self, f: impl Fn(DeliveryInterval) -> DeliveryInterval) -> DeliveryInterval {
        let previous = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |millis| {
                Some(f(DeliveryInterval::from_millis(millis)).millis())
            })
            .unwrap_or_else(|millis| millis);
        f(DeliveryInterval::from_millis(previous))
    }
}

struct ArmedTimer {
    deadline: Instant,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// The single live delivery timer of an agent.
///
/// Arming while a timer is already waiting keeps whichever deadline comes
/// first, so a stream of writes cannot postpone delivery indefinitely.
/// A timer that has fired is never aborted; its attempt runs to completion.
#[derive(Default)]
pub struct DeliveryTimer {
    armed: Option<ArmedTimer>,
}

impl DeliveryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an earlier pending timer was kept instead.
    pub fn arm<F>(&mut self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;

        if let Some(armed) = &self.armed {
            if self.is_armed() && armed.deadline <= deadline {
                return false;
            }
            if !armed.fired.load(Ordering::SeqCst) {
                armed.handle.abort();
            }
        }

        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            fired_flag.store(true, Ordering::SeqCst);
            task.await;
        });

        self.armed = Some(ArmedTimer { deadline, fired, handle });
        true
    }

    /// Whether a timer is still waiting to fire.
    pub fn is_armed(&self) -> bool {
        self.armed.as_ref().is_some_and(|armed| {
            !armed.fired.load(Ordering::SeqCst) && !armed.handle.is_finished()
        })
    }

    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            if !armed.fired.load(Ordering::SeqCst) {
                armed.handle.abort();
            }
        }
    }
}

/// Debounces an action: each submission replaces the pending value and
/// restarts the delay, and only the last value is applied.
///
/// [`Coalescer::flush`] applies a pending value immediately and must be
/// called on teardown, otherwise the last submission is lost.
pub struct Coalescer<T: Send + 'static> {
    delay: Duration,
    apply: Arc<dyn Fn(T) + Send + Sync>,
    pending: Arc<Mutex<Option<T>>>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Coalescer<T> {
    pub fn new(delay: Duration, apply: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            delay,
            apply: Arc::new(apply),
            pending: Arc::new(Mutex::new(None)),
            timer: None,
        }
    }

    pub fn submit(&mut self, value: T) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let delay = self.delay;
        let pending = self.pending.clone();
        let apply = self.apply.clone();
        self.timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let value = pending.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(value) = value {
                apply(value);
            }
        }));
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn flush(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let value = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(value) = value {
            (self.apply)(value);
        }
    }
}

impl<T: Send + 'static> Drop for Coalescer<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

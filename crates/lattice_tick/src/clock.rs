//! Tick clock.
//!
//! A process-wide monotonic tick counter advanced at a fixed wall-clock
//! cadence. The pacing loop wakes `PARTS` times per tick; [`Clock::adjust_once`]
//! stretches or shrinks a single cycle by one sub-tick, drifting the phase
//! toward a target tick without ever reordering, skipping, or decreasing
//! the counter.
//!
//! Each tick fans out to subscribers in parallel. Every subscriber runs
//! under its own deadline of `now + delay`, so an overrunning subscriber
//! is cancelled at the next tick boundary and never delays it: a tick's
//! work either completes or is cut off before the next tick's begins.
//! A panicking subscriber is caught and logged; it never kills the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Sub-ticks per tick. The pacing loop wakes this many times per cycle.
const PARTS: i64 = 4;

/// A tick subscriber: invoked once per tick with the tick number and the
/// deadline its work is cancelled at.
pub type Subscriber = Arc<dyn Fn(i64, Instant) -> BoxFuture<'static, ()> + Send + Sync>;

/// The shared discrete clock.
pub struct Clock {
    current: AtomicI64,
    delay: Duration,
    /// Sub-tick delta applied to the next cycle: -1 hurries the next
    /// tick, +1 delays it. Consumed once.
    adjust: AtomicI8,
    stopped: AtomicBool,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Clock {
    /// Create a clock ticking every `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            current: AtomicI64::new(0),
            delay,
            adjust: AtomicI8::new(0),
            stopped: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The current tick. Lock-free; safe to call from any task.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    /// The wall-clock duration of one tick.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Register a subscriber. Subscribers are fanned out to in parallel on
    /// every tick; the list is append-only.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(i64, Instant) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        debug!("registered tick subscriber");
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(subscriber));
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Nudge the next cycle one sub-tick toward `target`: ahead-of-us
    /// targets hurry the next tick, behind-us targets delay it. The
    /// counter itself stays monotonic and gapless.
    pub fn adjust_once(&self, target: i64) {
        let current = self.current();
        let delta = match target.cmp(&current) {
            std::cmp::Ordering::Greater => -1,
            std::cmp::Ordering::Less => 1,
            std::cmp::Ordering::Equal => 0,
        };
        debug!(current, target, delta, "adjusting next cycle");
        self.adjust.store(delta, Ordering::Release);
    }

    /// Advance one tick immediately and fan out to subscribers. Returns
    /// the new tick number.
    ///
    /// Each subscriber is spawned on its own task with a deadline of
    /// `now + delay`; overruns are cancelled and logged, panics are
    /// caught and logged.
    pub fn tick_once(&self) -> i64 {
        let tick = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        let deadline = Instant::now() + self.delay;
        let subscribers = self.subscribers();
        debug!(tick, subscribers = subscribers.len(), "tick");
        for subscriber in subscribers {
            let fut = subscriber(tick, deadline);
            tokio::spawn(async move {
                match tokio::time::timeout_at(
                    deadline,
                    std::panic::AssertUnwindSafe(fut).catch_unwind(),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => error!(tick, "tick subscriber panicked"),
                    Err(_) => warn!(tick, "tick subscriber exceeded deadline; cancelled"),
                }
            });
        }
        tick
    }

    /// Run the pacing loop until [`Clock::stop`] is called.
    pub async fn run(&self) {
        info!(
            delay_ms = self.delay.as_millis() as u64,
            "tick clock running"
        );
        let sub_tick = self.delay / PARTS as u32;
        loop {
            let parts = PARTS + i64::from(self.adjust.swap(0, Ordering::AcqRel));
            for _ in 0..parts {
                tokio::time::sleep(sub_tick).await;
                if self.stopped.load(Ordering::Acquire) {
                    info!("tick clock stopped");
                    return;
                }
            }
            self.tick_once();
        }
    }

    /// Stop the pacing loop after the current sub-tick.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

//! Tick-Driven Timer Service
//!
//! Protocol timers (t-PollRetransmit, t-Reassembly, t-StatusProhibit, ...)
//! are driven by a millisecond tick rather than wall-clock callbacks. The
//! owning entity polls expiry from its own serialization point, which keeps
//! the state machines testable without a real clock and makes the
//! cancel-versus-fire race a non-issue: a stopped timer never reports
//! expiry.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct TimerSlot {
    /// Configured duration in ticks (milliseconds)
    duration_ms: u64,
    /// Absolute tick at which the timer fires, `None` when idle
    deadline: Option<u64>,
    /// Pending expiry, cleared when observed
    expired: bool,
}

#[derive(Debug, Default)]
struct TimerWheel {
    now_ms: u64,
    slots: Vec<TimerSlot>,
}

/// Shared timer service handing out [`UniqueTimer`] handles.
///
/// One `tick()` equals one millisecond of protocol time. In deployments a
/// [`run_ticker`] task drives it; tests call `tick()` directly.
#[derive(Debug, Clone, Default)]
pub struct TimerManager {
    wheel: Arc<Mutex<TimerWheel>>,
}

impl TimerManager {
    /// Create a new timer service
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a timer handle
    pub fn unique_timer(&self) -> UniqueTimer {
        let mut wheel = self.wheel.lock().unwrap();
        wheel.slots.push(TimerSlot::default());
        UniqueTimer {
            wheel: Arc::clone(&self.wheel),
            id: wheel.slots.len() - 1,
        }
    }

    /// Advance protocol time by one millisecond
    pub fn tick(&self) {
        let mut wheel = self.wheel.lock().unwrap();
        wheel.now_ms += 1;
        let now = wheel.now_ms;
        for (id, slot) in wheel.slots.iter_mut().enumerate() {
            if slot.deadline.is_some_and(|d| d <= now) {
                slot.deadline = None;
                slot.expired = true;
                trace!("timer {} expired at t={}ms", id, now);
            }
        }
    }

    /// Current protocol time in milliseconds
    pub fn now(&self) -> u64 {
        self.wheel.lock().unwrap().now_ms
    }
}

/// Handle to one timer slot of a [`TimerManager`].
#[derive(Debug)]
pub struct UniqueTimer {
    wheel: Arc<Mutex<TimerWheel>>,
    id: usize,
}

impl UniqueTimer {
    /// Configure the duration without starting the timer
    pub fn set(&self, duration_ms: u64) {
        let mut wheel = self.wheel.lock().unwrap();
        wheel.slots[self.id].duration_ms = duration_ms;
    }

    /// Start (or restart) the timer with the configured duration
    pub fn run(&self) {
        let mut wheel = self.wheel.lock().unwrap();
        let now = wheel.now_ms;
        let slot = &mut wheel.slots[self.id];
        slot.deadline = Some(now + slot.duration_ms);
        slot.expired = false;
    }

    /// Stop the timer and discard any pending expiry
    pub fn stop(&self) {
        let mut wheel = self.wheel.lock().unwrap();
        let slot = &mut wheel.slots[self.id];
        slot.deadline = None;
        slot.expired = false;
    }

    /// True while the timer is armed and not yet expired
    pub fn is_running(&self) -> bool {
        self.wheel.lock().unwrap().slots[self.id].deadline.is_some()
    }

    /// Consume a pending expiry.
    ///
    /// Edge-triggered: reports `true` exactly once per expiry.
    pub fn has_expired(&self) -> bool {
        let mut wheel = self.wheel.lock().unwrap();
        let slot = &mut wheel.slots[self.id];
        std::mem::take(&mut slot.expired)
    }
}

/// Drive `manager.tick()` at a fixed period until the task is aborted.
pub async fn run_ticker(manager: TimerManager, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    loop {
        interval.tick().await;
        manager.tick();
    }
}

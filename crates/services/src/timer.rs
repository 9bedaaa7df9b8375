//! Countdown with one-second ticks and a single expiry event.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Stopped,
    Running,
    Expired,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerState::Stopped => "stopped",
            TimerState::Running => "running",
            TimerState::Expired => "expired",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Tick { remaining_secs: u64 },
    Expired,
}

struct TimerInner {
    state: TimerState,
    run: u64,
    deadline: Option<Instant>,
    cancel: Option<watch::Sender<bool>>,
}

/// Drives one countdown at a time.
///
/// Starting again replaces the previous countdown. `Expired` is delivered at
/// most once per countdown and never after `cancel`.
#[derive(Clone)]
pub struct TimerController {
    inner: Arc<Mutex<TimerInner>>,
}

impl Default for TimerController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                state: TimerState::Stopped,
                run: 0,
                deadline: None,
                cancel: None,
            })),
        }
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        self.inner
            .lock()
            .map_or(TimerState::Stopped, |inner| inner.state)
    }

    /// Whole seconds left, rounded up; zero unless running.
    #[must_use]
    pub fn remaining_secs(&self) -> u64 {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        match (inner.state, inner.deadline) {
            (TimerState::Running, Some(deadline)) => {
                ceil_secs(deadline.saturating_duration_since(Instant::now()))
            }
            _ => 0,
        }
    }

    /// Start counting down from `duration_secs` and return the event stream.
    ///
    /// Must be called from within a tokio runtime. A zero duration expires
    /// immediately.
    pub fn start(&self, duration_secs: u64) -> mpsc::UnboundedReceiver<TimerEvent> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let started = Instant::now();
        let deadline = started + Duration::from_secs(duration_secs);

        let run = {
            let Ok(mut inner) = self.inner.lock() else {
                return events_rx;
            };
            if let Some(previous) = inner.cancel.take() {
                let _ = previous.send(true);
            }
            inner.run += 1;
            inner.state = TimerState::Running;
            inner.deadline = Some(deadline);
            inner.cancel = Some(cancel_tx);
            inner.run
        };
        debug!(run, duration_secs, "timer started");

        tokio::spawn(countdown(
            Arc::clone(&self.inner),
            run,
            started,
            deadline,
            cancel_rx,
            events_tx,
        ));
        events_rx
    }

    /// Stop a running countdown. Returns `false` if nothing was running.
    pub fn cancel(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
        }
        if inner.state == TimerState::Running {
            inner.state = TimerState::Stopped;
            inner.deadline = None;
            debug!(run = inner.run, "timer cancelled");
            true
        } else {
            false
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Flip `Running → Expired` for `run`; only the winner may emit `Expired`.
fn try_expire(inner: &Mutex<TimerInner>, run: u64) -> bool {
    let Ok(mut inner) = inner.lock() else {
        return false;
    };
    if inner.run != run || inner.state != TimerState::Running {
        return false;
    }
    inner.state = TimerState::Expired;
    inner.deadline = None;
    inner.cancel = None;
    true
}

async fn countdown(
    inner: Arc<Mutex<TimerInner>>,
    run: u64,
    started: Instant,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<TimerEvent>,
) {
    if deadline <= started {
        if try_expire(&inner, run) {
            info!(run, "timer expired");
            let _ = events.send(TimerEvent::Expired);
        }
        return;
    }

    let mut tick = interval_at(started + TICK, TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => return,
            now = tick.tick() => {
                let remaining_secs = ceil_secs(deadline.saturating_duration_since(now));
                if remaining_secs == 0 {
                    if try_expire(&inner, run) {
                        info!(run, "timer expired");
                        let _ = events.send(TimerEvent::Expired);
                    }
                    return;
                }
                if events.send(TimerEvent::Tick { remaining_secs }).is_err() {
                    debug!(run, "timer listener dropped");
                }
            }
        }
    }
}

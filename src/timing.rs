//! Timers that may be absent: optional intervals and pollable absolute
//! deadlines.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::future::{pending, Future};
use std::pin::Pin;
use std::task::Context;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior, Sleep};

/// A `Duration` that may be absent. Timers made from an absent duration
/// never fire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalDuration(Option<Duration>);

impl OptionalDuration {
    /// No duration: derived timers never fire.
    pub const NONE: Self = Self(None);

    /// A concrete duration.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self(Some(duration))
    }

    pub(crate) const fn get(self) -> Option<Duration> {
        self.0
    }
}

impl From<Duration> for OptionalDuration {
    fn from(duration: Duration) -> Self {
        Self(Some(duration))
    }
}

impl From<Option<Duration>> for OptionalDuration {
    fn from(duration: Option<Duration>) -> Self {
        Self(duration)
    }
}

/// An interval timer that may never tick.
#[derive(Debug)]
pub(crate) enum OptionalInterval {
    Some(Interval),
    None,
}

impl From<OptionalDuration> for OptionalInterval {
    fn from(duration: OptionalDuration) -> Self {
        match duration.get() {
            Some(d) => Self::Some(tokio::time::interval(d)),
            None => Self::None,
        }
    }
}

impl OptionalInterval {
    pub(crate) fn set_missed_tick_behavior(&mut self, behavior: MissedTickBehavior) {
        if let Self::Some(interval) = self {
            interval.set_missed_tick_behavior(behavior);
        }
    }

    /// Completes at the next tick, or never if there is no interval.
    pub(crate) async fn tick(&mut self) -> Instant {
        match self {
            Self::Some(interval) => interval.tick().await,
            Self::None => pending().await,
        }
    }
}

/// Poll-side view of a mutable absolute deadline. Re-arms its sleep
/// whenever the deadline changes; an absent deadline never expires and a
/// past one expires immediately.
#[derive(Debug, Default)]
pub(crate) struct DeadlineTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    armed_for: Option<Instant>,
}

impl DeadlineTimer {
    /// Whether `deadline` has passed, registering the task for a wakeup at
    /// that instant otherwise.
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>, deadline: Option<Instant>) -> bool {
        let Some(deadline) = deadline else {
            self.sleep = None;
            self.armed_for = None;
            return false;
        };
        // The direct check also keeps an already-fired sleep from being
        // polled again.
        if Instant::now() >= deadline {
            return true;
        }
        if self.armed_for != Some(deadline) {
            self.sleep = Some(Box::pin(sleep_until(deadline)));
            self.armed_for = Some(deadline);
        }
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

// Copyright 2020 Joyent, Inc.

//! Reconnection policies
//!
//! A [`ReconnectionPolicy`](trait.ReconnectionPolicy.html) is a stateless
//! factory for [`ReconnectionSchedule`](trait.ReconnectionSchedule.html)s. A
//! fresh schedule is created each time a host goes down (and each time the
//! control connection starts looking for a new host) and is asked for the
//! next delay after every failed attempt. A policy only governs how long to
//! wait between attempts: reconnection continues until it succeeds or the
//! host is removed from the topology.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use crate::error::Error;
use crate::sync::{lock_or_recover, wait_timeout_or_recover};

// Base delay of the default policy in milliseconds
pub const DEFAULT_BASE_DELAY: u64 = 1000;
// Maximum delay of the default policy in milliseconds
pub const DEFAULT_MAX_DELAY: u64 = 600_000;

pub trait ReconnectionPolicy: Debug + Send + Sync {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

pub trait ReconnectionSchedule: Send {
    /// The delay to wait before the next attempt. Called once per attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same amount of time between every attempt.
#[derive(Clone, Copy, Debug)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    /// Create a policy with a fixed delay given in milliseconds.
    pub fn new(delay: u64) -> Result<Self, Error> {
        if delay == 0 {
            return Err(Error::InvalidConfiguration {
                field: "delay",
                reason: String::from("must be > 0"),
            });
        }
        Ok(ConstantReconnectionPolicy {
            delay: Duration::from_millis(delay),
        })
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule(self.delay))
    }
}

struct ConstantSchedule(Duration);

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

/// Doubles the delay after every attempt, starting at `base_delay` and
/// never exceeding `max_delay`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    /// Create a policy from a base and a maximum delay given in milliseconds.
    pub fn new(base_delay: u64, max_delay: u64) -> Result<Self, Error> {
        if base_delay == 0 {
            return Err(Error::InvalidConfiguration {
                field: "base_delay",
                reason: String::from("must be > 0"),
            });
        }
        if max_delay < base_delay {
            return Err(Error::InvalidConfiguration {
                field: "max_delay",
                reason: String::from("must be >= base_delay"),
            });
        }
        Ok(ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(base_delay),
            max_delay: Duration::from_millis(max_delay),
        })
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        ExponentialReconnectionPolicy {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY),
        }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        // No jitter and no elapsed time limit: the schedule never gives up.
        let backoff = ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        Box::new(ExponentialSchedule {
            backoff,
            max_delay: self.max_delay,
        })
    }
}

struct ExponentialSchedule {
    backoff: ExponentialBackoff,
    max_delay: Duration,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Why a wait on a [`ReconnectSignal`] ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Wakeup {
    Elapsed,
    Kicked,
    Cancelled,
}

#[derive(Debug, Default)]
struct SignalState {
    kicked: bool,
    cancelled: bool,
}

// Used by the background reconnection loops to sleep between attempts while
// remaining responsive to cancellation and to requests for an early attempt.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReconnectSignal(Arc<(Mutex<SignalState>, Condvar)>);

impl ReconnectSignal {
    pub(crate) fn new() -> Self {
        ReconnectSignal::default()
    }

    pub(crate) fn wait(&self, delay: Duration) -> Wakeup {
        let deadline = Instant::now() + delay;
        let mut state = lock_or_recover(&(self.0).0);
        loop {
            if state.cancelled {
                return Wakeup::Cancelled;
            }
            if state.kicked {
                state.kicked = false;
                return Wakeup::Kicked;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wakeup::Elapsed;
            }
            state =
                wait_timeout_or_recover(&(self.0).1, state, deadline - now).0;
        }
    }

    pub(crate) fn kick(&self) {
        let mut state = lock_or_recover(&(self.0).0);
        state.kicked = true;
        (self.0).1.notify_all();
    }

    pub(crate) fn cancel(&self) {
        let mut state = lock_or_recover(&(self.0).0);
        state.cancelled = true;
        (self.0).1.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        lock_or_recover(&(self.0).0).cancelled
    }
}

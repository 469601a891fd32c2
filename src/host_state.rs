// Copyright 2020 Joyent, Inc.

//! The liveness state machine of a single host.
//!
//! A host is either `UP` or `DOWN`. While `DOWN` the state owns exactly one
//! background reconnection loop that waits out the delays of a
//! [`ReconnectionSchedule`](../reconnection/trait.ReconnectionSchedule.html)
//! and attempts a single connection after each delay. Transitions are
//! serialized by a per-host lock so unrelated hosts never contend.
//!
//! Each loop is tagged with an id. A success reported by a loop whose id is
//! no longer current (the host was removed, or has since gone through another
//! transition) is rejected, so a late success can never resurrect a removed
//! host.

use std::sync::Mutex;
use std::thread;

use chrono::{DateTime, Utc};
use derive_more::Display;
use slog::{debug, info, Logger};

use crate::host::HostStatus;
use crate::reconnection::{ReconnectSignal, ReconnectionSchedule, Wakeup};
use crate::sync::lock_or_recover;

/// The reason a host was marked down.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DownReason {
    /// The pool lost its last live connection.
    #[display(fmt = "all connections lost")]
    ConnectionsExhausted,
    /// None of the attempts to open the pool's connections succeeded.
    #[display(fmt = "initial connection attempts failed")]
    InitialConnectFailed,
    /// The host was reported down by a collaborator such as the topology
    /// source or the application.
    #[display(fmt = "signaled down")]
    Signaled,
}

/// The result of a single reconnection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttemptOutcome {
    /// A connection was established and the host is up again.
    Reconnected,
    /// The attempt failed; wait for the next delay and try again.
    Failed,
    /// The attempt is no longer wanted, e.g. the session is shutting down.
    Abandoned,
}

#[derive(Debug)]
struct Reconnection {
    id: u64,
    signal: ReconnectSignal,
}

#[derive(Debug)]
struct StateData {
    status: HostStatus,
    removed: bool,
    reconnection: Option<Reconnection>,
    next_reconnection_id: u64,
    changed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HostState {
    data: Mutex<StateData>,
}

impl HostState {
    pub(crate) fn new() -> Self {
        HostState {
            data: Mutex::new(StateData {
                status: HostStatus::Up,
                removed: false,
                reconnection: None,
                next_reconnection_id: 0,
                changed_at: Utc::now(),
            }),
        }
    }

    pub fn status(&self) -> HostStatus {
        lock_or_recover(&self.data).status
    }

    pub fn is_up(&self) -> bool {
        self.status() == HostStatus::Up
    }

    /// The time of the last transition, or of creation if there was none.
    pub fn changed_at(&self) -> DateTime<Utc> {
        lock_or_recover(&self.data).changed_at
    }

    pub fn is_reconnecting(&self) -> bool {
        lock_or_recover(&self.data).reconnection.is_some()
    }

    pub fn is_removed(&self) -> bool {
        lock_or_recover(&self.data).removed
    }

    /// Transition `UP -> DOWN`.
    ///
    /// Returns the reconnection loop owned by the new `DOWN` state, or `None`
    /// if the host was already down or has been removed. The loop does not
    /// run until [`PendingReconnection::start`] is called, which lets the
    /// caller finish its own down handling first.
    pub(crate) fn mark_down<F>(
        &self,
        schedule: Box<dyn ReconnectionSchedule>,
        attempt: F,
        log: Logger,
    ) -> Option<PendingReconnection>
    where
        F: FnMut(u64) -> AttemptOutcome + Send + 'static,
    {
        let mut data = lock_or_recover(&self.data);
        if data.removed || data.status == HostStatus::Down {
            return None;
        }

        let id = data.next_reconnection_id;
        data.next_reconnection_id += 1;
        let signal = ReconnectSignal::new();

        data.status = HostStatus::Down;
        data.changed_at = Utc::now();
        data.reconnection = Some(Reconnection {
            id,
            signal: signal.clone(),
        });

        Some(PendingReconnection {
            id,
            signal,
            schedule,
            attempt: Box::new(attempt),
            log,
        })
    }

    /// Transition `DOWN -> UP` on behalf of the reconnection loop `id`.
    ///
    /// Returns false, leaving the state untouched, if the host is already up,
    /// has been removed, or `id` does not name the current loop.
    pub(crate) fn mark_up(&self, id: u64) -> bool {
        let mut data = lock_or_recover(&self.data);
        if data.removed || data.status == HostStatus::Up {
            return false;
        }
        match data.reconnection.take() {
            Some(reconnection) if reconnection.id == id => {
                reconnection.signal.cancel();
                data.status = HostStatus::Up;
                data.changed_at = Utc::now();
                true
            }
            other => {
                data.reconnection = other;
                false
            }
        }
    }

    /// Whether `id` names the reconnection loop owned by the current `DOWN`
    /// state.
    pub(crate) fn is_current_reconnection(&self, id: u64) -> bool {
        let data = lock_or_recover(&self.data);
        !data.removed
            && data
                .reconnection
                .as_ref()
                .map(|r| r.id == id)
                .unwrap_or(false)
    }

    /// Wake the reconnection loop for an immediate attempt. Has no effect
    /// unless the host is down.
    pub(crate) fn reconnect_now(&self) -> bool {
        let data = lock_or_recover(&self.data);
        match &data.reconnection {
            Some(reconnection) => {
                reconnection.signal.kick();
                true
            }
            None => false,
        }
    }

    /// The host has left the topology. Any reconnection loop is cancelled
    /// and no later transition is accepted.
    pub(crate) fn remove(&self) {
        let mut data = lock_or_recover(&self.data);
        data.removed = true;
        if let Some(reconnection) = data.reconnection.take() {
            reconnection.signal.cancel();
        }
    }
}

/// A reconnection loop created by a `DOWN` transition that has not been
/// started yet.
pub(crate) struct PendingReconnection {
    id: u64,
    signal: ReconnectSignal,
    schedule: Box<dyn ReconnectionSchedule>,
    attempt: Box<dyn FnMut(u64) -> AttemptOutcome + Send>,
    log: Logger,
}

impl PendingReconnection {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn start(self) {
        let _reconnect_thread = thread::spawn(move || reconnection_loop(self));
    }
}

fn reconnection_loop(pending: PendingReconnection) {
    let PendingReconnection {
        id,
        signal,
        mut schedule,
        mut attempt,
        log,
    } = pending;

    loop {
        let delay = schedule.next_delay();
        debug!(
            log,
            "reconnection {}: next attempt in {} ms",
            id,
            delay.as_millis()
        );

        match signal.wait(delay) {
            Wakeup::Cancelled => {
                debug!(log, "reconnection {} cancelled", id);
                return;
            }
            Wakeup::Kicked => {
                debug!(log, "reconnection {}: attempting early", id);
            }
            Wakeup::Elapsed => (),
        }

        match attempt(id) {
            AttemptOutcome::Reconnected => {
                info!(log, "reconnection {} succeeded", id);
                return;
            }
            AttemptOutcome::Abandoned => {
                debug!(log, "reconnection {} abandoned", id);
                return;
            }
            AttemptOutcome::Failed => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::time::Duration;

    use slog::{o, Discard};

    use crate::reconnection::{ConstantReconnectionPolicy, ReconnectionPolicy};

    fn schedule() -> Box<dyn ReconnectionSchedule> {
        ConstantReconnectionPolicy::new(10).unwrap().new_schedule()
    }

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn down_only_once() {
        let state = HostState::new();
        assert!(state.is_up());

        let first =
            state.mark_down(schedule(), |_| AttemptOutcome::Failed, log());
        assert!(first.is_some());
        assert_eq!(state.status(), HostStatus::Down);
        assert!(state.is_reconnecting());

        let second =
            state.mark_down(schedule(), |_| AttemptOutcome::Failed, log());
        assert!(second.is_none());
    }

    #[test]
    fn up_requires_current_reconnection() {
        let state = HostState::new();
        let pending = state
            .mark_down(schedule(), |_| AttemptOutcome::Failed, log())
            .unwrap();
        let id = pending.id();

        assert!(!state.mark_up(id + 1));
        assert!(state.is_current_reconnection(id));
        assert!(state.mark_up(id));
        assert!(state.is_up());
        assert!(!state.is_reconnecting());
        // A duplicate success is ignored.
        assert!(!state.mark_up(id));
    }

    #[test]
    fn removed_host_is_never_resurrected() {
        let state = HostState::new();
        let pending = state
            .mark_down(schedule(), |_| AttemptOutcome::Failed, log())
            .unwrap();
        let id = pending.id();

        state.remove();

        assert!(!state.is_current_reconnection(id));
        assert!(!state.mark_up(id));
        assert_eq!(state.status(), HostStatus::Down);
        assert!(state
            .mark_down(schedule(), |_| AttemptOutcome::Failed, log())
            .is_none());
    }

    #[test]
    fn loop_retries_until_reconnected() {
        let state = Arc::new(HostState::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();

        let state_clone = state.clone();
        let attempts_clone = attempts.clone();
        let pending = state
            .mark_down(
                schedule(),
                move |id| {
                    let n = attempts_clone.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        return AttemptOutcome::Failed;
                    }
                    assert!(state_clone.mark_up(id));
                    let _ = tx.send(n);
                    AttemptOutcome::Reconnected
                },
                log(),
            )
            .unwrap();
        pending.start();

        let n = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, 3);
        assert!(state.is_up());
    }

    #[test]
    fn removal_cancels_loop() {
        let state = HostState::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let pending = state
            .mark_down(
                ConstantReconnectionPolicy::new(60_000)
                    .unwrap()
                    .new_schedule(),
                move |_| {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    AttemptOutcome::Failed
                },
                log(),
            )
            .unwrap();
        pending.start();
        state.remove();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(!state.reconnect_now());
    }

    #[test]
    fn reconnect_now_skips_remaining_delay() {
        let state = HostState::new();
        let (tx, rx) = channel();

        let pending = state
            .mark_down(
                ConstantReconnectionPolicy::new(60_000)
                    .unwrap()
                    .new_schedule(),
                move |_| {
                    let _ = tx.send(());
                    AttemptOutcome::Abandoned
                },
                log(),
            )
            .unwrap();
        pending.start();

        assert!(state.reconnect_now());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}

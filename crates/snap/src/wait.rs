//! Blocking helpers for client calls on gateway and factory builds.
//!
//! The caller thread blocks on a condition variable; the receive path wakes
//! it from `response_process`. Locks are never held across the wait.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Response delivered to a waiting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ack(Vec<u8>),
    Nack,
}

#[derive(Debug, Default)]
struct WaitState {
    awaited: Option<(Tag, u16)>,
    outcome: Option<WaitOutcome>,
}

/// One outstanding client transaction at a time.
#[derive(Debug, Default)]
pub struct ClientWait {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl ClientWait {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> SnapResult<MutexGuard<'_, WaitState>> {
        self.state
            .lock()
            .map_err(|_| SnapError::LockPoisoned("client wait"))
    }

    /// Start awaiting `element` with `transaction_id`; fails while another
    /// call is in flight
    pub fn arm(&self, element: Tag, transaction_id: u16) -> SnapResult<()> {
        let mut state = self.lock()?;
        if state.awaited.is_some() {
            return Err(SnapError::Busy);
        }
        state.awaited = Some((element, transaction_id));
        state.outcome = None;
        Ok(())
    }

    pub fn disarm(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.awaited = None;
            state.outcome = None;
        }
    }

    /// Deliver a response; returns false when nobody awaits it
    pub fn stop_wait(&self, element: Tag, transaction_id: u16, outcome: WaitOutcome) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.awaited != Some((element, transaction_id)) || state.outcome.is_some() {
            debug!(element = %tag_str(&element), tid = transaction_id, "response not awaited");
            return false;
        }
        state.outcome = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// Block until the armed response arrives or `timeout_ms` passes.
    /// The wait is disarmed either way.
    pub fn wait(&self, timeout_ms: u64) -> SnapResult<WaitOutcome> {
        let state = self.lock()?;
        let element = state.awaited.map(|(e, _)| tag_str(&e)).unwrap_or_default();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, Duration::from_millis(timeout_ms), |s| {
                s.outcome.is_none()
            })
            .map_err(|_| SnapError::LockPoisoned("client wait"))?;
        state.awaited = None;
        state.outcome.take().ok_or(SnapError::Timeout {
            element,
            waited_ms: timeout_ms,
        })
    }
}

#[derive(Debug)]
struct CollectState<T> {
    active: bool,
    items: Vec<T>,
    max: usize,
}

/// Gathers responses to a broadcast request until a deadline or a limit.
#[derive(Debug)]
pub struct Collector<T> {
    state: Mutex<CollectState<T>>,
    cond: Condvar,
}

impl<T: PartialEq> Collector<T> {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(CollectState {
                active: false,
                items: Vec::new(),
                max,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn start(&self) -> SnapResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SnapError::LockPoisoned("collector"))?;
        if state.active {
            return Err(SnapError::Busy);
        }
        state.active = true;
        state.items.clear();
        Ok(())
    }

    /// Add a response; duplicates and responses outside a collection are
    /// ignored
    pub fn push(&self, item: T) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.active || state.items.len() >= state.max || state.items.contains(&item) {
            return;
        }
        state.items.push(item);
        if state.items.len() >= state.max {
            self.cond.notify_all();
        }
    }

    /// Wait out `timeout_ms` (or until full) and return what arrived
    pub fn finish(&self, timeout_ms: u64) -> SnapResult<Vec<T>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut state = self
            .state
            .lock()
            .map_err(|_| SnapError::LockPoisoned("collector"))?;
        loop {
            let now = Instant::now();
            if now >= deadline || state.items.len() >= state.max {
                break;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .map_err(|_| SnapError::LockPoisoned("collector"))?;
            state = next;
        }
        state.active = false;
        Ok(std::mem::take(&mut state.items))
    }

    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.active = false;
            state.items.clear();
        }
    }
}

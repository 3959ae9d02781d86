use super::descriptor::FilterId;
use crate::error::{Result, TsError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One readiness notification drained by [`Poller::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: FilterId,
    pub readable: bool,
    pub error: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ready {
    readable: bool,
    error: bool,
}

#[derive(Default)]
struct PollState {
    registered: HashSet<FilterId>,
    /// Tokens in arrival order, at most once each while pending
    pending: VecDeque<FilterId>,
    ready: HashMap<FilterId, Ready>,
    woken: bool,
    poisoned: Option<String>,
}

/// Readiness multiplexer for the filters of one stream source.
///
/// Providers signal through the [`Readiness`] handle returned by
/// [`register`](Poller::register); the reactor thread blocks in
/// [`poll`](Poller::poll) with a bounded timeout. Repeated signals for a token that
/// is still pending merge into one event.
pub struct Poller {
    state: Mutex<PollState>,
    cond: Condvar,
}

impl Poller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PollState::default()),
            cond: Condvar::new(),
        })
    }

    /// Starts watching `token` and hands out the handle a provider signals through.
    pub fn register(self: &Arc<Self>, token: FilterId) -> Result<Readiness> {
        let mut state = self.state.lock();
        if !state.registered.insert(token) {
            return Err(TsError::InvalidArgument(format!(
                "{} is already registered with the poller",
                token
            )));
        }
        Ok(Readiness {
            poller: Arc::clone(self),
            token,
        })
    }

    /// Stops watching `token` and drops its pending readiness.
    pub fn deregister(&self, token: FilterId) -> bool {
        let mut state = self.state.lock();
        state.ready.remove(&token);
        state.registered.remove(&token)
    }

    /// Makes a blocked or the next `poll` return immediately.
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.cond.notify_all();
    }

    /// Breaks the multiplexer: every later `poll` fails with `ReactorFatal`.
    pub fn poison(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.poisoned.is_none() {
            state.poisoned = Some(reason.into());
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    /// Waits up to `timeout` for readiness and appends at most `max_events` events.
    ///
    /// Returns the number of events appended; 0 on timeout or after [`wake`](Self::wake).
    pub fn poll(&self, events: &mut Vec<Event>, max_events: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(reason) = &state.poisoned {
                return Err(TsError::ReactorFatal(reason.clone()));
            }
            if !state.pending.is_empty() || state.woken {
                break;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.woken = false;

        let mut count = 0;
        while count < max_events {
            let Some(token) = state.pending.pop_front() else {
                break;
            };
            // Deregistered while pending
            let Some(ready) = state.ready.remove(&token) else {
                continue;
            };
            events.push(Event {
                token,
                readable: ready.readable,
                error: ready.error,
            });
            count += 1;
        }
        Ok(count)
    }

    /// Puts back an event drained by `poll` but not handled, merging it with any
    /// readiness raised since.
    pub fn requeue(&self, event: Event) {
        self.notify(event.token, event.readable, event.error);
    }

    fn notify(&self, token: FilterId, readable: bool, error: bool) {
        let mut state = self.state.lock();
        if !state.registered.contains(&token) {
            return;
        }
        let entry = state.ready.entry(token).or_default();
        let newly_pending = !entry.readable && !entry.error;
        entry.readable |= readable;
        entry.error |= error;
        if newly_pending {
            state.pending.push_back(token);
        }
        drop(state);
        self.cond.notify_one();
    }
}

/// A provider's handle for signalling one filter's readiness.
#[derive(Clone)]
pub struct Readiness {
    poller: Arc<Poller>,
    token: FilterId,
}

impl Readiness {
    pub fn token(&self) -> FilterId {
        self.token
    }

    /// The filter has data to read.
    pub fn notify_readable(&self) {
        self.poller.notify(self.token, true, false);
    }

    /// The filter hit an error the next read reports.
    pub fn notify_error(&self) {
        self.poller.notify(self.token, false, true);
    }

    /// The underlying multiplexer is gone; ends the reactor.
    pub fn fail(&self, reason: impl Into<String>) {
        self.poller.poison(reason);
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readiness").field("token", &self.token).finish()
    }
}

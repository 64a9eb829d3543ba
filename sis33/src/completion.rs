//! A single-slot, resettable notification used to hand the end of an acquisition from the deferred
//! completion worker to whoever is waiting on the card.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// How a [`CompletionSignal::wait`] ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
struct State {
    /// Generation of the latest arm, bumped by every [`CompletionSignal::reset`]
    armed: u64,
    /// Latest generation that was signaled
    completed: u64,
    /// Bumped by every [`CompletionSignal::interrupt`], waiters compare against what they saw on
    /// entry
    interrupts: u64,
}

/// Once signaled, every current and future waiter sees [`WaitOutcome::Completed`] until the next
/// [`CompletionSignal::reset`].
///
/// Each reset starts a new generation. A waiter that holds on to the generation it is interested
/// in still sees it completed after a later reset, so a quick re-arm can't swallow the wakeup.
#[derive(Debug)]
pub struct CompletionSignal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                armed: 1,
                completed: 0,
                interrupts: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears a previous signal, done right before a new arm. Returns the new generation.
    pub fn reset(&self) -> u64 {
        let mut state = self.state();
        state.armed += 1;
        state.armed
    }

    /// The generation the next [`CompletionSignal::signal`] completes
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state().armed
    }

    /// Completes the current generation and wakes every waiter with [`WaitOutcome::Completed`]
    pub fn signal(&self) {
        let mut state = self.state();
        state.completed = state.armed;
        drop(state);
        self.cond.notify_all();
    }

    /// Wakes the threads currently blocked in [`CompletionSignal::wait`] with
    /// [`WaitOutcome::Interrupted`]. Later waiters are not affected.
    pub fn interrupt(&self) {
        self.state().interrupts += 1;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        let state = self.state();
        state.completed == state.armed
    }

    /// Blocks until the current generation is signaled, `timeout` elapses (if given) or the wait
    /// is interrupted. A zero timeout only reports whether the signal is already set.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let generation = self.generation();
        self.wait_for(generation, timeout)
    }

    /// Like [`CompletionSignal::wait`], for a given `generation` rather than the current one
    pub fn wait_for(&self, generation: u64, timeout: Option<Duration>) -> WaitOutcome {
        // A timeout too large to represent is the same as none
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state();
        let entered_at = state.interrupts;
        loop {
            if state.completed >= generation {
                return WaitOutcome::Completed;
            }
            if state.interrupts != entered_at {
                return WaitOutcome::Interrupted;
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

use crate::error::WaitError;
use crate::state::{State, StateMachine};
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 64;

/// Scoped registration of a state observer: subscribing on construction,
/// unsubscribing on drop, so an observer can never outlive its queue.
pub struct StateSubscription {
    machine: StateMachine,
    id: String,
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        self.machine.unsubscribe_from_state_change(&self.id);
    }
}

/// Bounded queue of observed states, fed from the machine's worker thread.
///
/// The worker never blocks on observers: when the queue is full the state
/// is dropped with a warning, which only happens when the observer has
/// stopped draining.
pub struct StateQueue {
    rx: cbchan::Receiver<State>,
}

impl StateQueue {
    /// Subscribe to `machine` under `id` with the default capacity.
    pub fn subscribe(machine: &StateMachine, id: impl Into<String>) -> (StateSubscription, Self) {
        Self::subscribe_with_capacity(machine, id, DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        machine: &StateMachine,
        id: impl Into<String>,
        capacity: usize,
    ) -> (StateSubscription, Self) {
        let id = id.into();
        let (tx, rx) = cbchan::bounded::<State>(capacity);

        {
            let id = id.clone();
            machine.subscribe_to_state_change(id.clone(), move |state| {
                if tx.try_send(state).is_err() {
                    tracing::warn!("state queue '{id}' is full, dropping {state}");
                }
            });
        }

        (
            StateSubscription {
                machine: machine.clone(),
                id,
            },
            Self { rx },
        )
    }

    /// Next observed state, waiting up to `timeout`.
    pub fn next(&self, timeout: Duration) -> Result<State, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(state) => Ok(state),
            Err(cbchan::RecvTimeoutError::Timeout) => Err(WaitError::Timeout(timeout)),
            Err(cbchan::RecvTimeoutError::Disconnected) => Err(WaitError::Closed),
        }
    }

    /// Drain states until `expected` is observed or `timeout` elapses.
    /// Observing `Error` while waiting for anything else fails fast.
    pub fn wait_for(&self, expected: State, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(WaitError::Timeout(timeout))?;

            match self.next(remaining)? {
                state if state == expected => return Ok(()),
                State::Error => return Err(WaitError::ErrorState),
                _ => {}
            }
        }
    }
}

use crate::error::{StateError, WaitError};
use crate::state::{State, StateMachine, StateQueue, StateSubscription, Transition};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug)]
pub enum ControlError {
    State(StateError),
    Wait(WaitError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(e) => write!(f, "{e}"),
            Self::Wait(e) => write!(f, "{e}"),
        }
    }
}

impl Error for ControlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::State(e) => Some(e),
            Self::Wait(e) => Some(e),
        }
    }
}

impl From<StateError> for ControlError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<WaitError> for ControlError {
    fn from(e: WaitError) -> Self {
        Self::Wait(e)
    }
}

/// External supervisor of one device's state machine.
///
/// Attaches its own scoped state subscription and drives the standard
/// lifecycle path, one observed state at a time, without racing the
/// device worker.
pub struct Controller {
    machine: StateMachine,
    queue: StateQueue,
    _sub: StateSubscription,
}

impl Controller {
    pub fn attach(machine: StateMachine) -> Self {
        let id = format!("controller-{}", Uuid::new_v4().simple());
        let (sub, queue) = StateQueue::subscribe(&machine, id);
        Self {
            machine,
            queue,
            _sub: sub,
        }
    }

    pub fn change_state(&self, transition: Transition) -> Result<State, StateError> {
        self.machine.change_state(transition)
    }

    /// Drain observed states until `expected` shows up.
    pub fn wait_for(&self, expected: State, timeout: Duration) -> Result<(), WaitError> {
        self.queue.wait_for(expected, timeout)
    }

    pub fn next_state(&self, timeout: Duration) -> Result<State, WaitError> {
        self.queue.next(timeout)
    }

    /// Drive Idle through initialization, binding, connecting, and task
    /// setup, landing in `Ready`. `step_timeout` bounds each observed
    /// step; connecting is the step the device may spend `init-timeout`
    /// seconds in.
    pub fn to_ready(&self, step_timeout: Duration) -> ControlResult<()> {
        let steps = [
            (Transition::InitDevice, State::InitializingDevice),
            (Transition::CompleteInit, State::Initialized),
            (Transition::Bind, State::Bound),
            (Transition::Connect, State::DeviceReady),
            (Transition::InitTask, State::Ready),
        ];

        for (transition, expected) in steps {
            self.change_state(transition)?;
            self.wait_for(expected, step_timeout)?;
        }
        Ok(())
    }

    /// [`to_ready`](Self::to_ready), then enter `Running`.
    pub fn to_running(&self, step_timeout: Duration) -> ControlResult<()> {
        self.to_ready(step_timeout)?;
        self.change_state(Transition::Run)?;
        self.wait_for(State::Running, step_timeout)?;
        Ok(())
    }

    /// Drive whatever state the device is in down to `Exiting`.
    pub fn shutdown(&self, step_timeout: Duration) -> ControlResult<()> {
        loop {
            let step = match self.machine.state() {
                State::Exiting => return Ok(()),
                State::Running => Some((Transition::Stop, State::Ready)),
                State::Ready => Some((Transition::ResetTask, State::DeviceReady)),
                State::DeviceReady => Some((Transition::ResetDevice, State::Idle)),
                State::Idle => Some((Transition::End, State::Exiting)),
                State::Error => Some((Transition::End, State::Exiting)),
                // walk a half-initialized device forward to a resettable state
                State::InitializingDevice => Some((Transition::CompleteInit, State::Initialized)),
                State::Initialized => Some((Transition::Bind, State::Bound)),
                State::Bound => Some((Transition::Connect, State::DeviceReady)),
                // transitional states advance on their own
                _ => None,
            };

            let waited = match step {
                Some((transition, expected)) => {
                    match self.change_state(transition) {
                        Ok(_) => {}
                        Err(StateError::InvalidTransition { .. }) => {
                            // the worker advanced underneath us; let it
                            // settle and re-inspect
                            let _ = self.next_state(Duration::from_millis(100));
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.wait_for(expected, step_timeout)
                }
                None => self.next_state(step_timeout).map(|_| ()),
            };

            match waited {
                Ok(()) => {}
                // landing in Error mid-shutdown reroutes through End
                Err(WaitError::ErrorState) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fully static supervision: bring the device to `Running`, then wait
    /// for it to finish on its own or for a termination signal, and shut
    /// it down. This is the whole lifetime of a non-interactive process.
    pub fn run_static(&self, step_timeout: Duration) -> anyhow::Result<()> {
        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, term.clone())?;
        }

        self.to_running(step_timeout)?;

        loop {
            if term.load(Ordering::Relaxed) {
                tracing::warn!("termination signal received");
                break;
            }
            match self.next_state(Duration::from_millis(100)) {
                // the device left Running on its own
                Ok(State::Ready) | Ok(State::Error) => break,
                Ok(State::Exiting) => return Ok(()),
                Ok(_) => {}
                Err(WaitError::Timeout(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.shutdown(step_timeout)?;
        Ok(())
    }
}

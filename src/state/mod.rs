pub use machine::StateMachine;
pub use queue::{StateQueue, StateSubscription};

pub mod machine;
pub mod queue;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a device.
///
/// `Ok` is not a node in the lifecycle graph; it is the neutral status
/// value controllers may report for a device they are not driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Ok,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    InitializingTask,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Idle => "IDLE",
            Self::InitializingDevice => "INITIALIZING DEVICE",
            Self::Initialized => "INITIALIZED",
            Self::Binding => "BINDING",
            Self::Bound => "BOUND",
            Self::Connecting => "CONNECTING",
            Self::DeviceReady => "DEVICE READY",
            Self::InitializingTask => "INITIALIZING TASK",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::ResettingTask => "RESETTING TASK",
            Self::ResettingDevice => "RESETTING DEVICE",
            Self::Exiting => "EXITING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested lifecycle transitions.
///
/// `Auto` is the driver's self-advance request: it moves a transitional
/// state to its linear successor without outside intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Auto,
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    Run,
    Stop,
    ResetTask,
    ResetDevice,
    End,
    ErrorFound,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::InitDevice => "INIT DEVICE",
            Self::CompleteInit => "COMPLETE INIT",
            Self::Bind => "BIND",
            Self::Connect => "CONNECT",
            Self::InitTask => "INIT TASK",
            Self::Run => "RUN",
            Self::Stop => "STOP",
            Self::ResetTask => "RESET TASK",
            Self::ResetDevice => "RESET DEVICE",
            Self::End => "END",
            Self::ErrorFound => "ERROR FOUND",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle graph: `None` means the transition is invalid from the
/// given state. `ErrorFound` is accepted from every state except the
/// terminal `Exiting` and `Error` itself; `Error` additionally admits
/// `ResetDevice` and `End` so a supervisor can recover or shut down.
pub fn next_state(from: State, transition: Transition) -> Option<State> {
    use State::*;
    use Transition::*;

    Some(match (from, transition) {
        (Idle, InitDevice) => InitializingDevice,
        (InitializingDevice, CompleteInit) => Initialized,
        (Initialized, Bind) => Binding,
        (Binding, Auto) => Bound,
        (Bound, Connect) => Connecting,
        (Connecting, Auto) => DeviceReady,
        (DeviceReady, InitTask) => InitializingTask,
        (InitializingTask, Auto) => Ready,
        (Ready, Run) => Running,
        (Running, Stop) => Ready,
        (Ready, ResetTask) => ResettingTask,
        (ResettingTask, Auto) => DeviceReady,
        (DeviceReady, ResetDevice) => ResettingDevice,
        (Error, ResetDevice) => ResettingDevice,
        (ResettingDevice, Auto) => Idle,
        (Idle, End) => Exiting,
        (Error, End) => Exiting,
        (Exiting | Error | Ok, ErrorFound) => return None,
        (_, ErrorFound) => Error,
        _ => return None,
    })
}

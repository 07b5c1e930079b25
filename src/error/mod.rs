use crate::state::{State, Transition};
use std::error::Error;
use std::fmt;
use std::time::Duration;

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type TransferResult<T> = Result<T, TransferError>;

/// Configuration-level failures: missing or malformed keys, unknown
/// transport names, channels without a socket method.
#[derive(Debug, Clone)]
pub enum ConfigError {
    MissingKey(String),
    TypeMismatch {
        key: String,
        expected: &'static str,
    },
    UnknownTransport(String),
    /// Channel without a `bind`/`connect` method and no endpoint modifier.
    MissingMethod(String),
    /// Sub-channel indices for a name are not contiguous from zero.
    BadChannelIndex(String),
    InvalidValue {
        key: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "property '{key}' not found"),
            Self::TypeMismatch { key, expected } => {
                write!(f, "property '{key}' is not of the expected type {expected}")
            }
            Self::UnknownTransport(name) => write!(f, "unknown transport: '{name}'"),
            Self::MissingMethod(chan) => {
                write!(f, "socket method (bind/connect) for channel '{chan}' not specified")
            }
            Self::BadChannelIndex(name) => {
                write!(f, "sub-channel indices for '{name}' are not contiguous from 0")
            }
            Self::InvalidValue { key, reason } => {
                write!(f, "invalid value for property '{key}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Transport/socket-level failures outside the send/receive hot path.
#[derive(Debug)]
pub enum TransportError {
    EndpointInUse(String),
    NoPeer(String),
    SocketClosed,
    Fault(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointInUse(ep) => write!(f, "endpoint already bound: {ep}"),
            Self::NoPeer(ep) => write!(f, "no peer bound at {ep}"),
            Self::SocketClosed => write!(f, "socket is closed"),
            Self::Fault(s) => write!(f, "transport fault: {s}"),
        }
    }
}

impl Error for TransportError {}

/// Outcome of a blocking send/receive that did not transfer data.
///
/// `Interrupted` is the cooperative-cancellation path: the transport was
/// interrupted while the call was in flight and the operation should not
/// be retried until the transport is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    Interrupted,
    Closed,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "transfer interrupted"),
            Self::Closed => write!(f, "transfer endpoint closed"),
        }
    }
}

impl Error for TransferError {}

/// State machine request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    InvalidTransition { transition: Transition, state: State },
    Terminated,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { transition, state } => {
                write!(f, "transition {transition} is not valid from state {state}")
            }
            Self::Terminated => write!(f, "state machine is no longer handling states"),
        }
    }
}

impl Error for StateError {}

/// Failure while waiting on a state observation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout(Duration),
    /// The machine entered `Error` while a different state was awaited.
    ErrorState,
    Closed,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "no state observed within {d:?}"),
            Self::ErrorState => write!(f, "device entered the Error state"),
            Self::Closed => write!(f, "state queue is closed"),
        }
    }
}

impl Error for WaitError {}

/// Fatal lifecycle-driver failures, logged and converted into an
/// `ErrorFound` transition by the worker.
#[derive(Debug)]
pub enum DeviceError {
    Config(ConfigError),
    State(StateError),
    /// Binding channels left unattached after the single binding pass.
    BindingIncomplete(usize),
    /// Connecting phase exceeded `init-timeout` seconds.
    InitTimeout { seconds: u64, unresolved: Vec<String> },
    Transport(TransportError),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "{e}"),
            Self::BindingIncomplete(n) => {
                write!(f, "{n} of the binding channels could not initialize")
            }
            Self::InitTimeout { seconds, unresolved } => write!(
                f,
                "could not connect all channels within {seconds} s, still invalid: {}",
                unresolved.join(", ")
            ),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for DeviceError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StateError> for DeviceError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<TransportError> for DeviceError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

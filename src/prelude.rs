pub use crate::channel::{Channel, ChannelMap, ChannelMethod};
pub use crate::config::{Properties, Value};
pub use crate::control::Controller;
pub use crate::device::{BaseDevice, Device, DeviceCtx, DeviceHandle};
pub use crate::error::{
    ConfigError, DeviceError, StateError, TransferError, TransportError, WaitError,
};
pub use crate::state::{State, StateMachine, StateQueue, StateSubscription, Transition};
pub use crate::transport::{
    Message, Parts, Poller, Socket, SocketRole, Transport, TransportKind, TransportPool,
};
pub use crate::utils::logger::LoggerConfig;

pub use pool::TransportPool;

pub mod memory;
pub mod pool;

use crate::channel::ChannelMap;
use crate::config::Properties;
use crate::error::{ConfigError, ConfigResult, TransferResult, TransportResult};
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Messaging backend selector. `Default` defers to the device-wide
/// default configured under the `transport` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Default,
    Memory,
    Shmem,
}

impl TransportKind {
    pub fn parse(name: &str) -> ConfigResult<Self> {
        match name {
            "default" => Ok(Self::Default),
            "memory" => Ok(Self::Memory),
            "shmem" => Ok(Self::Shmem),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Memory => "memory",
            Self::Shmem => "shmem",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level socket role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    Pub,
    Sub,
    Push,
    Pull,
    Req,
    Rep,
    Pair,
}

impl SocketRole {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pub" => Some(Self::Pub),
            "sub" => Some(Self::Sub),
            "push" => Some(Self::Push),
            "pull" => Some(Self::Pull),
            "req" => Some(Self::Req),
            "rep" => Some(Self::Rep),
            "pair" => Some(Self::Pair),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Req => "req",
            Self::Rep => "rep",
            Self::Pair => "pair",
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    data: Bytes,
}

impl Message {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

/// A multipart message: an ordered sequence of payloads transferred as one
/// unit.
pub type Parts = Vec<Message>;

/// One messaging backend instance.
///
/// A transport hands out sockets and pollers for its own kind and owns the
/// interrupt/resume pair that aborts and re-arms every blocking operation
/// on its sockets.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn create_socket(&self, role: SocketRole, channel: &str) -> TransportResult<Box<dyn Socket>>;

    /// A readiness multiplexer over the listed channels' sub-channels.
    /// Every listed channel must live on this transport.
    fn create_poller(
        &self,
        channels: &ChannelMap,
        keys: &[String],
    ) -> TransportResult<Box<dyn Poller>>;

    /// Abort all in-flight blocking operations on this transport's sockets.
    fn interrupt(&self);

    /// Re-arm blocking operations after an interrupt.
    fn resume(&self);

    /// Tear down transport resources; the transport is unusable afterwards.
    fn reset(&self);
}

/// Creates transport instances for the pool: `(kind, device id, config)`.
pub type TransportCreator =
    dyn Fn(TransportKind, &str, &Properties) -> TransportResult<Arc<dyn Transport>> + Send + Sync;

/// The built-in creator; `Memory` and `Shmem` map to independent
/// in-process hubs.
pub fn default_creator() -> Arc<TransportCreator> {
    Arc::new(|kind, device_id, _config| {
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Memory => Arc::new(memory::MemoryTransport::attach(kind, device_id)),
            TransportKind::Shmem => Arc::new(memory::MemoryTransport::attach(kind, device_id)),
            TransportKind::Default => {
                return Err(crate::error::TransportError::Fault(
                    "default transport kind must be resolved before creation".into(),
                ));
            }
        };
        Ok(transport)
    })
}

/// One communication endpoint of a transport.
///
/// All operations take `&self`; implementations synchronize internally so
/// that pollers and dispatch threads can share sockets without exclusive
/// borrows.
pub trait Socket: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Attach as the binding side. The returned endpoint is the actual
    /// address, which may differ from the requested one (e.g. an assigned
    /// port on a wildcard bind).
    fn bind(&self, endpoint: &str) -> TransportResult<String>;

    fn connect(&self, endpoint: &str) -> TransportResult<()>;

    /// Blocking send; returns the number of payload bytes transferred.
    fn send(&self, parts: Parts) -> TransferResult<usize>;

    /// Blocking receive of one transfer unit.
    fn recv(&self) -> TransferResult<Parts>;
}

/// Readiness multiplexer over a fixed set of sub-channels.
pub trait Poller: Send {
    /// Wait until at least one sub-channel is readable or `timeout`
    /// elapses.
    fn poll(&mut self, timeout: Duration) -> TransportResult<()>;

    /// Whether `(channel, index)` was readable at the last poll.
    fn check_input(&self, channel: &str, index: usize) -> bool;
}

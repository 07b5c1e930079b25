use crate::config::Properties;
use crate::error::{ConfigError, ConfigResult, TransferError, TransferResult, TransportResult};
use crate::transport::{Message, Parts, Socket, SocketRole, Transport, TransportKind};
use ahash::AHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Channel name -> ordered sub-channels (by index). Sub-channel order is
/// part of the observable contract.
pub type ChannelMap = AHashMap<String, Vec<Channel>>;

/// How a channel attaches its endpoints by default. Individual endpoints
/// may override this with an `@` (bind) or `+`/`>` (connect) prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMethod {
    Bind,
    Connect,
    Unspecified,
}

impl ChannelMethod {
    pub fn parse(name: &str) -> Self {
        match name {
            "bind" => Self::Bind,
            "connect" => Self::Connect,
            _ => Self::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Connect => "connect",
            Self::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for ChannelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Counters {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    messages_tx: AtomicU64,
    messages_rx: AtomicU64,
}

/// One named, indexed communication endpoint of a device.
///
/// A channel is built from `chans.<name>.<index>.*` properties, gets its
/// transport and socket assigned during device initialization, and is
/// attached (bound/connected) by the lifecycle driver. Counters are
/// updated inside transfer calls only; concurrent readers such as the
/// rate logger may observe slightly stale values.
pub struct Channel {
    prefix: String,
    index: usize,
    method: ChannelMethod,
    address: String,
    role_name: String,
    transport_kind: TransportKind,
    rate_logging: u32,
    multipart: bool,
    transport: Option<Arc<dyn Transport>>,
    socket: Option<Box<dyn Socket>>,
    counters: Counters,
}

impl Channel {
    /// Read one sub-channel's configuration. Missing fields default the
    /// way deployed configurations expect: `unspecified` strings, default
    /// transport, rate logging enabled at every interval tick.
    pub fn from_properties(prefix: &str, index: usize, config: &Properties) -> ConfigResult<Self> {
        let base = format!("chans.{prefix}.{index}.");

        let address: String = config.get_or(&format!("{base}address"), "unspecified".into())?;
        let method: String = config.get_or(&format!("{base}method"), "unspecified".into())?;
        let role_name: String = config.get_or(&format!("{base}type"), "unspecified".into())?;
        let transport_name: String = config.get_or(&format!("{base}transport"), "default".into())?;
        let rate_logging: u32 = config.get_or(&format!("{base}rateLogging"), 1)?;

        Ok(Self {
            prefix: prefix.to_string(),
            index,
            method: ChannelMethod::parse(&method),
            address,
            role_name,
            transport_kind: TransportKind::parse(&transport_name)?,
            rate_logging,
            multipart: false,
            transport: None,
            socket: None,
            counters: Counters::default(),
        })
    }

    /// `name[index]`, the form used in logs.
    pub fn name(&self) -> String {
        format!("{}[{}]", self.prefix, self.index)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn method(&self) -> ChannelMethod {
        self.method
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn update_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn rate_logging(&self) -> u32 {
        self.rate_logging
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    pub(crate) fn set_multipart(&mut self, multipart: bool) {
        self.multipart = multipart;
    }

    pub fn role(&self) -> Option<SocketRole> {
        SocketRole::parse(&self.role_name)
    }

    /// Assign the pooled transport; resolves a `default` transport kind to
    /// the concrete pooled kind.
    pub(crate) fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport_kind = transport.kind();
        self.transport = Some(transport);
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    pub fn socket(&self) -> Option<&dyn Socket> {
        self.socket.as_deref()
    }

    /// True once the configuration is complete enough to attach: a parsed
    /// socket role and a syntactically resolvable address.
    pub fn validate(&self) -> bool {
        if self.role().is_none() {
            tracing::trace!("channel {}: socket type '{}' not valid yet", self.name(), self.role_name);
            return false;
        }
        if self.address.is_empty() || self.address == "unspecified" {
            tracing::trace!("channel {}: address not specified yet", self.name());
            return false;
        }

        self.address.split(',').all(|endpoint| {
            let valid = valid_endpoint(endpoint);
            if !valid {
                tracing::trace!("channel {}: invalid endpoint '{endpoint}'", self.name());
            }
            valid
        })
    }

    /// Allocate the transport socket. The transport must have been
    /// assigned and the channel must validate.
    pub fn init(&mut self) -> TransportResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            crate::error::TransportError::Fault(format!(
                "channel {} has no transport assigned",
                self.name()
            ))
        })?;
        let role = self.role().ok_or_else(|| {
            crate::error::TransportError::Fault(format!(
                "channel {} has no valid socket type",
                self.name()
            ))
        })?;

        self.socket = Some(transport.create_socket(role, &self.prefix)?);
        Ok(())
    }

    /// Bind one endpoint, returning the actual attached address.
    pub fn bind_endpoint(&self, endpoint: &str) -> TransportResult<String> {
        self.socket_ref()?.bind(endpoint)
    }

    /// Connect one endpoint.
    pub fn connect_endpoint(&self, endpoint: &str) -> TransportResult<()> {
        self.socket_ref()?.connect(endpoint)
    }

    fn socket_ref(&self) -> TransportResult<&dyn Socket> {
        self.socket
            .as_deref()
            .ok_or_else(|| crate::error::TransportError::SocketClosed)
    }

    /// Blocking send of a single message; returns bytes transferred.
    pub fn send(&self, msg: Message) -> TransferResult<usize> {
        self.send_parts(vec![msg])
    }

    /// Blocking send of a multipart message; returns bytes transferred.
    pub fn send_parts(&self, parts: Parts) -> TransferResult<usize> {
        let socket = self.socket.as_deref().ok_or(TransferError::Closed)?;
        let bytes = socket.send(parts)?;
        self.counters.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.messages_tx.fetch_add(1, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Blocking receive of a single message.
    pub fn recv(&self) -> TransferResult<Message> {
        let mut parts = self.recv_parts()?;
        if parts.is_empty() {
            return Ok(Message::default());
        }
        Ok(parts.swap_remove(0))
    }

    /// Blocking receive of one multipart transfer unit.
    pub fn recv_parts(&self) -> TransferResult<Parts> {
        let socket = self.socket.as_deref().ok_or(TransferError::Closed)?;
        let parts = socket.recv()?;
        let bytes: usize = parts.iter().map(|m| m.len()).sum();
        self.counters.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.messages_rx.fetch_add(1, Ordering::Relaxed);
        Ok(parts)
    }

    pub fn bytes_tx(&self) -> u64 {
        self.counters.bytes_tx.load(Ordering::Relaxed)
    }

    pub fn bytes_rx(&self) -> u64 {
        self.counters.bytes_rx.load(Ordering::Relaxed)
    }

    pub fn messages_tx(&self) -> u64 {
        self.counters.messages_tx.load(Ordering::Relaxed)
    }

    pub fn messages_rx(&self) -> u64 {
        self.counters.messages_rx.load(Ordering::Relaxed)
    }

    /// Drop the socket and transport reference; the channel goes back to
    /// its pre-init configured shape.
    pub(crate) fn teardown(&mut self) {
        self.socket = None;
        self.transport = None;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("method", &self.method)
            .field("address", &self.address)
            .field("transport", &self.transport_kind)
            .field("type", &self.role_name)
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {} @ {})",
            self.name(),
            self.role_name,
            self.method,
            self.address
        )
    }
}

fn valid_endpoint(endpoint: &str) -> bool {
    let stripped = endpoint
        .strip_prefix(['@', '+', '>'])
        .unwrap_or(endpoint);

    let Some((scheme, rest)) = stripped.split_once("://") else {
        return false;
    };
    if scheme.is_empty() || rest.is_empty() {
        return false;
    }

    if scheme == "tcp" {
        let Some((host, port)) = rest.rsplit_once(':') else {
            return false;
        };
        return !host.is_empty() && port.parse::<u32>().is_ok();
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Properties;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        Properties::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn reads_configuration_with_defaults() {
        let config = props(&[
            ("chans.data.0.address", "tcp://*:5555"),
            ("chans.data.0.method", "bind"),
            ("chans.data.0.type", "pull"),
        ]);

        let chan = Channel::from_properties("data", 0, &config).unwrap();
        assert_eq!(chan.name(), "data[0]");
        assert_eq!(chan.method(), ChannelMethod::Bind);
        assert_eq!(chan.address(), "tcp://*:5555");
        assert_eq!(chan.role(), Some(SocketRole::Pull));
        assert_eq!(chan.transport_kind(), TransportKind::Default);
        assert_eq!(chan.rate_logging(), 1);
    }

    #[test]
    fn unknown_transport_is_a_config_error() {
        let config = props(&[("chans.data.0.transport", "carrier-pigeon")]);
        assert!(matches!(
            Channel::from_properties("data", 0, &config),
            Err(ConfigError::UnknownTransport(_))
        ));
    }

    #[test]
    fn validation_requires_role_and_address() {
        let config = props(&[("chans.data.0.method", "bind")]);
        let mut chan = Channel::from_properties("data", 0, &config).unwrap();
        assert!(!chan.validate());

        chan.update_address("tcp://*:5555");
        assert!(!chan.validate(), "still no socket type");

        let config = props(&[
            ("chans.data.0.method", "bind"),
            ("chans.data.0.type", "pull"),
            ("chans.data.0.address", "tcp://*:5555"),
        ]);
        let chan = Channel::from_properties("data", 0, &config).unwrap();
        assert!(chan.validate());
    }

    #[test]
    fn validation_accepts_modifiers_and_multiple_endpoints() {
        let config = props(&[
            ("chans.data.0.type", "pub"),
            ("chans.data.0.method", "bind"),
            ("chans.data.0.address", "@tcp://*:5555,+ipc://extra,>tcp://host:7"),
        ]);
        let chan = Channel::from_properties("data", 0, &config).unwrap();
        assert!(chan.validate());
    }

    #[test]
    fn validation_rejects_malformed_endpoints() {
        for bad in ["tcp://noport", "://x", "plain-string", "tcp://:5"] {
            let config = props(&[
                ("chans.data.0.type", "pull"),
                ("chans.data.0.method", "bind"),
                ("chans.data.0.address", bad),
            ]);
            let chan = Channel::from_properties("data", 0, &config).unwrap();
            assert!(!chan.validate(), "{bad} should not validate");
        }
    }
}

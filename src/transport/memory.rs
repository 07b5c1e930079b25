use crate::channel::ChannelMap;
use crate::error::{TransferError, TransferResult, TransportError, TransportResult};
use crate::transport::{Parts, Poller, Socket, SocketRole, Transport, TransportKind};
use crate::utils::SharedFlag;
use ahash::AHashMap;
use crossbeam::channel as cbchan;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const PIPE_CAPACITY: usize = 1024;
const EPHEMERAL_PORT_BASE: u32 = 49152;

/// Two directed queues between the binding side and the connecting side
/// of one endpoint.
struct Pipe {
    to_bound: (cbchan::Sender<Parts>, cbchan::Receiver<Parts>),
    to_connected: (cbchan::Sender<Parts>, cbchan::Receiver<Parts>),
    bound: bool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            to_bound: cbchan::bounded(PIPE_CAPACITY),
            to_connected: cbchan::bounded(PIPE_CAPACITY),
            bound: false,
        }
    }
}

/// Endpoint namespace shared by every transport instance of one kind in
/// this process, so that devices can talk to each other in-process the
/// way they would across a network.
struct Hub {
    pipes: Mutex<AHashMap<String, Pipe>>,
    next_port: AtomicU32,
}

impl Hub {
    fn new() -> Self {
        Self {
            pipes: Mutex::new(AHashMap::new()),
            next_port: AtomicU32::new(EPHEMERAL_PORT_BASE),
        }
    }

    fn for_kind(kind: TransportKind) -> Arc<Hub> {
        static HUBS: OnceLock<Mutex<AHashMap<TransportKind, Arc<Hub>>>> = OnceLock::new();

        HUBS.get_or_init(|| Mutex::new(AHashMap::new()))
            .lock()
            .entry(kind)
            .or_insert_with(|| Arc::new(Hub::new()))
            .clone()
    }
}

/// In-process reference transport.
///
/// Endpoints are plain strings; `tcp://host:0` binds get an ephemeral port
/// assigned and reported back. Connects require a bound peer, mirroring
/// TCP, which is what makes the connect-retry machinery observable in
/// tests. Interrupt/resume act on all sockets created by this instance.
pub struct MemoryTransport {
    kind: TransportKind,
    hub: Arc<Hub>,
    interrupted: SharedFlag,
}

impl MemoryTransport {
    pub fn attach(kind: TransportKind, device_id: &str) -> Self {
        tracing::debug!("attaching '{kind}' transport for device '{device_id}'");
        Self {
            kind,
            hub: Hub::for_kind(kind),
            interrupted: SharedFlag::new(false),
        }
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn create_socket(&self, role: SocketRole, channel: &str) -> TransportResult<Box<dyn Socket>> {
        Ok(Box::new(MemorySocket {
            hub: self.hub.clone(),
            interrupted: self.interrupted.clone(),
            role,
            channel: channel.to_string(),
            attachments: Mutex::new(Vec::new()),
            bound_endpoints: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
        }))
    }

    fn create_poller(
        &self,
        channels: &ChannelMap,
        keys: &[String],
    ) -> TransportResult<Box<dyn Poller>> {
        let mut probes = Vec::new();

        for key in keys {
            let subs = channels.get(key).ok_or_else(|| {
                TransportError::Fault(format!("cannot poll unknown channel '{key}'"))
            })?;

            for (index, sub) in subs.iter().enumerate() {
                let socket = sub.socket().ok_or_else(|| {
                    TransportError::Fault(format!("channel '{key}'[{index}] has no socket"))
                })?;
                let socket = socket
                    .as_any()
                    .downcast_ref::<MemorySocket>()
                    .ok_or_else(|| {
                        TransportError::Fault(format!(
                            "channel '{key}'[{index}] does not live on the {} transport",
                            self.kind
                        ))
                    })?;

                probes.push(Probe {
                    channel: key.clone(),
                    index,
                    receivers: socket.probe_receivers(),
                });
            }
        }

        Ok(Box::new(MemoryPoller { probes }))
    }

    fn interrupt(&self) {
        self.interrupted.set_release(true);
    }

    fn resume(&self) {
        self.interrupted.set_release(false);
    }

    fn reset(&self) {
        // sockets unbind themselves on drop; breaking blocked callers is
        // all that is left to do here
        self.interrupted.set_release(true);
    }
}

struct Attachment {
    tx: cbchan::Sender<Parts>,
    rx: cbchan::Receiver<Parts>,
}

pub struct MemorySocket {
    hub: Arc<Hub>,
    interrupted: SharedFlag,
    role: SocketRole,
    channel: String,
    attachments: Mutex<Vec<Attachment>>,
    bound_endpoints: Mutex<Vec<String>>,
    rr: AtomicUsize,
}

impl MemorySocket {
    fn probe_receivers(&self) -> Vec<cbchan::Receiver<Parts>> {
        self.attachments.lock().iter().map(|a| a.rx.clone()).collect()
    }

    fn resolve_wildcard_port(&self, endpoint: &str) -> String {
        match endpoint.strip_suffix(":0") {
            Some(head) if endpoint.starts_with("tcp://") => {
                let port = self.hub.next_port.fetch_add(1, Ordering::Relaxed);
                format!("{head}:{port}")
            }
            _ => endpoint.to_string(),
        }
    }
}

impl Socket for MemorySocket {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, endpoint: &str) -> TransportResult<String> {
        let actual = self.resolve_wildcard_port(endpoint);

        {
            let mut pipes = self.hub.pipes.lock();
            let pipe = pipes.entry(actual.clone()).or_insert_with(Pipe::new);
            if pipe.bound {
                return Err(TransportError::EndpointInUse(actual));
            }
            pipe.bound = true;

            self.attachments.lock().push(Attachment {
                tx: pipe.to_connected.0.clone(),
                rx: pipe.to_bound.1.clone(),
            });
        }

        self.bound_endpoints.lock().push(actual.clone());
        tracing::trace!("socket for '{}' bound at {actual}", self.channel);
        Ok(actual)
    }

    fn connect(&self, endpoint: &str) -> TransportResult<()> {
        let mut pipes = self.hub.pipes.lock();
        let pipe = pipes
            .get(endpoint)
            .filter(|p| p.bound)
            .ok_or_else(|| TransportError::NoPeer(endpoint.to_string()))?;

        self.attachments.lock().push(Attachment {
            tx: pipe.to_bound.0.clone(),
            rx: pipe.to_connected.1.clone(),
        });

        tracing::trace!("socket for '{}' connected to {endpoint}", self.channel);
        Ok(())
    }

    fn send(&self, parts: Parts) -> TransferResult<usize> {
        let attachments = self.attachments.lock();
        if attachments.is_empty() {
            return Err(TransferError::Closed);
        }

        let bytes: usize = parts.iter().map(|m| m.len()).sum();

        if self.role == SocketRole::Pub {
            for attachment in attachments.iter() {
                blocking_send(&attachment.tx, parts.clone(), &self.interrupted)?;
            }
        } else {
            let slot = self.rr.fetch_add(1, Ordering::Relaxed) % attachments.len();
            blocking_send(&attachments[slot].tx, parts, &self.interrupted)?;
        }

        Ok(bytes)
    }

    fn recv(&self) -> TransferResult<Parts> {
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if self.interrupted.get_acquire() {
                return Err(TransferError::Interrupted);
            }

            {
                let attachments = self.attachments.lock();
                let len = attachments.len();
                if len == 0 {
                    return Err(TransferError::Closed);
                }
                let start = self.rr.fetch_add(1, Ordering::Relaxed);
                for i in 0..len {
                    if let Ok(parts) = attachments[(start + i) % len].rx.try_recv() {
                        return Ok(parts);
                    }
                }
            }

            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        let bound = self.bound_endpoints.lock();
        if bound.is_empty() {
            return;
        }
        let mut pipes = self.hub.pipes.lock();
        for endpoint in bound.iter() {
            if let Some(pipe) = pipes.get_mut(endpoint) {
                pipe.bound = false;
            }
        }
    }
}

fn blocking_send(
    tx: &cbchan::Sender<Parts>,
    mut parts: Parts,
    interrupted: &SharedFlag,
) -> TransferResult<()> {
    let backoff = Backoff::new();
    let mut spins: u32 = 0;

    loop {
        if interrupted.get_acquire() {
            return Err(TransferError::Interrupted);
        }

        match tx.try_send(parts) {
            Ok(()) => return Ok(()),
            Err(cbchan::TrySendError::Full(v)) => {
                parts = v;
                spins = spins.saturating_add(1);
                if spins < 64 {
                    backoff.spin();
                } else if spins < 256 {
                    backoff.snooze();
                } else {
                    thread::sleep(Duration::from_micros(50));
                }
            }
            Err(cbchan::TrySendError::Disconnected(_)) => return Err(TransferError::Closed),
        }
    }
}

struct Probe {
    channel: String,
    index: usize,
    receivers: Vec<cbchan::Receiver<Parts>>,
}

impl Probe {
    fn ready(&self) -> bool {
        self.receivers.iter().any(|rx| !rx.is_empty())
    }
}

struct MemoryPoller {
    probes: Vec<Probe>,
}

impl Poller for MemoryPoller {
    fn poll(&mut self, timeout: Duration) -> TransportResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.probes.iter().any(Probe::ready) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            thread::sleep(Duration::from_micros(200));
        }
    }

    fn check_input(&self, channel: &str, index: usize) -> bool {
        self.probes
            .iter()
            .any(|p| p.channel == channel && p.index == index && p.ready())
    }
}

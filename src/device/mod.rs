mod rates;
mod run;

use crate::channel::{Channel, ChannelMap, ChannelMethod};
use crate::config::Properties;
use crate::error::{ConfigError, DeviceError, StateError, WaitError};
use crate::state::{State, StateMachine, StateQueue, StateSubscription, Transition};
use crate::transport::{
    Message, Parts, TransportCreator, TransportKind, TransportPool, default_creator,
};
use crate::utils::net;
use ahash::AHashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_ID: &str = "device";
pub const DEFAULT_RATE: f64 = 0.0;
pub const DEFAULT_INIT_TIMEOUT_S: u64 = 120;
pub const DEFAULT_TRANSPORT: &str = "memory";

const CONNECT_RETRY_INTERVAL_MS: u64 = 50;

/// Read access handed to user hooks and data callbacks: the property
/// store, the channel map, and the pending-state hint.
#[derive(Clone, Copy)]
pub struct DeviceCtx<'a> {
    config: &'a Properties,
    channels: &'a ChannelMap,
    machine: &'a StateMachine,
}

impl<'a> DeviceCtx<'a> {
    pub fn config(&self) -> &'a Properties {
        self.config
    }

    pub fn channels(&self) -> &'a ChannelMap {
        self.channels
    }

    pub fn channel(&self, name: &str, index: usize) -> Option<&'a Channel> {
        self.channels.get(name).and_then(|subs| subs.get(index))
    }

    /// True iff a transition is queued; long hooks poll this to yield.
    pub fn new_state_pending(&self) -> bool {
        self.machine.new_state_pending()
    }

    /// Sleep up to `duration`, waking early when a transition arrives.
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.machine.wait_for(duration)
    }
}

/// User hooks invoked by the lifecycle driver. Every hook has a no-op
/// default; a device implements only what it needs.
///
/// Hooks run on the device worker thread. An error return is logged and
/// drives the machine to the `Error` state.
#[allow(unused_variables)]
pub trait BaseDevice: Send + 'static {
    /// Called in `InitializingDevice`, before channels are built.
    fn init(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in `Binding`, after all binding channels attached.
    fn bind(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in `Connecting`, after all connecting channels attached.
    fn connect(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn init_task(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_run(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Polled in `Running` when no data callbacks are registered; the
    /// loop continues while it returns true. Paced by the `rate` property.
    fn conditional_run(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Called once in `Running` after the conditional-run loop ends (only
    /// when no data callbacks are registered).
    fn run(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_run(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset_task(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn exit(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

type MessageCallback<H> =
    Box<dyn for<'a> FnMut(&mut H, &DeviceCtx<'a>, Message, usize) -> bool + Send>;
type MultipartCallback<H> =
    Box<dyn for<'a> FnMut(&mut H, &DeviceCtx<'a>, Parts, usize) -> bool + Send>;

pub(crate) enum InputHandler<H> {
    Message(MessageCallback<H>),
    Multipart(MultipartCallback<H>),
}

/// A device under construction: configuration, user hooks, and data
/// callbacks. [`spawn`](Self::spawn) starts the lifecycle worker and
/// turns it into a [`DeviceHandle`].
pub struct Device<H: BaseDevice> {
    config: Properties,
    hooks: H,
    handlers: AHashMap<String, InputHandler<H>>,
    creator: Arc<TransportCreator>,
}

impl<H: BaseDevice> Device<H> {
    pub fn new(config: Properties, hooks: H) -> Self {
        Self {
            config,
            hooks,
            handlers: AHashMap::new(),
            creator: default_creator(),
        }
    }

    /// Replace the transport factory capability; mainly for tests and
    /// embedders bringing their own backend.
    pub fn with_transport_creator(mut self, creator: Arc<TransportCreator>) -> Self {
        self.creator = creator;
        self
    }

    /// Register a per-message callback for an input channel. Returning
    /// false leaves the `Running` state (the driver issues `Stop`).
    ///
    /// There is no back-pressure contract: a slow callback blocks the
    /// poller thread that invoked it.
    pub fn on_data<F>(&mut self, channel: impl Into<String>, cb: F)
    where
        F: for<'a> FnMut(&mut H, &DeviceCtx<'a>, Message, usize) -> bool + Send + 'static,
    {
        self.handlers
            .insert(channel.into(), InputHandler::Message(Box::new(cb)));
    }

    /// Multipart variant of [`on_data`](Self::on_data): the callback
    /// receives whole transfer units.
    pub fn on_multipart<F>(&mut self, channel: impl Into<String>, cb: F)
    where
        F: for<'a> FnMut(&mut H, &DeviceCtx<'a>, Parts, usize) -> bool + Send + 'static,
    {
        self.handlers
            .insert(channel.into(), InputHandler::Multipart(Box::new(cb)));
    }

    /// Wire the state machine and start the lifecycle worker.
    ///
    /// Registered on the machine, in order: a transition subscriber that
    /// interrupts all pooled transports on every request (releasing
    /// in-flight transfers), a prepare hook that resumes them before each
    /// state's handler, and the main state handler.
    pub fn spawn(self) -> DeviceHandle {
        let machine = StateMachine::new();
        let pool = Arc::new(TransportPool::new(self.creator.clone()));

        {
            let pool = pool.clone();
            machine.subscribe_to_new_transition("device", move |transition| {
                tracing::trace!("device notified on new transition: {transition}");
                pool.interrupt_all();
            });
        }
        {
            let pool = pool.clone();
            machine.prepare_state(move |state| {
                tracing::trace!("resuming transports for {state} state");
                pool.resume_all();
            });
        }

        let (sub, queue) = StateQueue::subscribe(
            &machine,
            format!("device-{}", Uuid::new_v4().simple()),
        );

        let mut driver = Driver {
            machine: machine.clone(),
            config: self.config,
            pool: pool.clone(),
            hooks: self.hooks,
            handlers: self.handlers,
            channels: AHashMap::new(),
            binding: Vec::new(),
            connecting: Vec::new(),
            device_id: DEFAULT_ID.to_string(),
            rate: DEFAULT_RATE,
            init_timeout_s: DEFAULT_INIT_TIMEOUT_S,
        };

        let worker = {
            let machine = machine.clone();
            thread::spawn(move || {
                machine.process_states(move |state| {
                    tracing::trace!("device notified on new state: {state}");
                    if let Err(e) = driver.handle_state(state) {
                        tracing::error!("error in {state} state handler: {e:#}");
                        if let Err(se) = driver.machine.change_state(Transition::ErrorFound) {
                            tracing::debug!("cannot enter error state: {se}");
                        }
                    }
                });
            })
        };

        DeviceHandle {
            machine,
            pool,
            queue,
            _sub: sub,
            worker: Some(worker),
        }
    }
}

/// Control surface of a spawned device: issue transitions, observe
/// states, join the worker. Dropping the handle stops the worker,
/// interrupting any in-flight transfer.
pub struct DeviceHandle {
    machine: StateMachine,
    pool: Arc<TransportPool>,
    queue: StateQueue,
    _sub: StateSubscription,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn change_state(&self, transition: Transition) -> Result<State, StateError> {
        self.machine.change_state(transition)
    }

    /// Next state observed by this handle's own subscription.
    pub fn next_state(&self, timeout: Duration) -> Result<State, WaitError> {
        self.queue.next(timeout)
    }

    pub fn wait_for_state(&self, state: State, timeout: Duration) -> Result<(), WaitError> {
        self.queue.wait_for(state, timeout)
    }

    /// Stop handling states and join the worker thread.
    pub fn join(mut self) {
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.machine.stop_handling_states();
        // release any transfer the worker may be blocked in
        self.pool.interrupt_all();
        if worker.join().is_err() {
            tracing::error!("device worker thread panicked");
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

pub(crate) struct Driver<H: BaseDevice> {
    pub(crate) machine: StateMachine,
    pub(crate) config: Properties,
    pub(crate) pool: Arc<TransportPool>,
    pub(crate) hooks: H,
    pub(crate) handlers: AHashMap<String, InputHandler<H>>,
    pub(crate) channels: ChannelMap,
    binding: Vec<(String, usize)>,
    connecting: Vec<(String, usize)>,
    pub(crate) device_id: String,
    pub(crate) rate: f64,
    init_timeout_s: u64,
}

impl<H: BaseDevice> Driver<H> {
    fn handle_state(&mut self, state: State) -> anyhow::Result<()> {
        match state {
            State::InitializingDevice => self.init_wrapper(),
            State::Binding => self.bind_wrapper(),
            State::Connecting => self.connect_wrapper(),
            State::InitializingTask => self.init_task_wrapper(),
            State::Running => self.run_wrapper(),
            State::ResettingTask => self.reset_task_wrapper(),
            State::ResettingDevice => self.reset_wrapper(),
            State::Exiting => self.exit_wrapper(),
            _ => {
                tracing::trace!("no handler for state {state}");
                Ok(())
            }
        }
    }

    /// Issue `Auto` to advance the linear lifecycle, unless an external
    /// transition is already queued.
    fn auto_if_idle(&self) -> Result<(), StateError> {
        if self.machine.new_state_pending() {
            return Ok(());
        }
        match self.machine.change_state(Transition::Auto) {
            Ok(_) | Err(StateError::Terminated) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn init_wrapper(&mut self) -> anyhow::Result<()> {
        // initialization proceeds once CompleteInit is requested
        self.machine.wait_for_pending_state();

        self.device_id = self.config.get_or("id", DEFAULT_ID.to_string())?;

        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.init(&ctx)?;

        self.rate = self.config.get_or("rate", DEFAULT_RATE)?;
        self.init_timeout_s = self.config.get_or("init-timeout", DEFAULT_INIT_TIMEOUT_S)?;

        let transport_name: String =
            self.config.get_or("transport", DEFAULT_TRANSPORT.to_string())?;
        let default_kind = match TransportKind::parse(&transport_name) {
            Ok(TransportKind::Default) => TransportKind::Memory,
            Ok(kind) => kind,
            Err(e) => {
                tracing::error!("invalid transport type provided: '{transport_name}'");
                return Err(e.into());
            }
        };

        for (name, count) in self.config.channel_info()? {
            let mut subs = Vec::with_capacity(count);
            for index in 0..count {
                subs.push(Channel::from_properties(&name, index, &self.config)?);
            }
            self.channels.insert(name, subs);
        }

        tracing::debug!("setting '{default_kind}' as default transport for the device");
        self.pool.set_default_kind(default_kind);
        self.pool
            .add(default_kind, &self.device_id, &self.config)
            .map_err(DeviceError::from)?;

        let network_interface: String =
            self.config.get_or("network-interface", "default".to_string())?;

        for (name, subs) in self.channels.iter_mut() {
            for (index, sub) in subs.iter_mut().enumerate() {
                tracing::debug!(
                    "initializing transport for channel {}: {}",
                    sub.name(),
                    sub.transport_kind()
                );
                let transport = self
                    .pool
                    .add(sub.transport_kind(), &self.device_id, &self.config)
                    .map_err(DeviceError::from)?;
                sub.set_transport(transport);

                match sub.method() {
                    ChannelMethod::Bind => {
                        // derive a bind address from the configured network
                        // interface when none is given
                        if sub.address().is_empty() || sub.address() == "unspecified" {
                            match net::local_address(&network_interface) {
                                Ok(ip) => sub.update_address(format!("tcp://{ip}:1")),
                                Err(e) => {
                                    tracing::debug!("binding on tcp://*:1 ({e})");
                                    sub.update_address("tcp://*:1");
                                }
                            }
                        }
                        self.binding.push((name.clone(), index));
                    }
                    ChannelMethod::Connect => {
                        self.connecting.push((name.clone(), index));
                    }
                    ChannelMethod::Unspecified => {
                        if sub.address().contains(['@', '+', '>']) {
                            self.connecting.push((name.clone(), index));
                        } else {
                            tracing::error!(
                                "cannot update configuration, socket method for channel '{}' not specified",
                                sub.name()
                            );
                            return Err(ConfigError::MissingMethod(sub.name()).into());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn bind_wrapper(&mut self) -> anyhow::Result<()> {
        // bind settings are local, so a single pass must succeed
        Self::attach_channels(&self.config, &mut self.channels, &mut self.binding)?;

        if !self.binding.is_empty() {
            tracing::error!(
                "{} of the binding channels could not initialize, initial configuration incomplete",
                self.binding.len()
            );
            return Err(DeviceError::BindingIncomplete(self.binding.len()).into());
        }

        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.bind(&ctx)?;

        self.auto_if_idle()?;
        Ok(())
    }

    fn connect_wrapper(&mut self) -> anyhow::Result<()> {
        let max_attempts = self.init_timeout_s * 1000 / CONNECT_RETRY_INTERVAL_MS;
        let mut attempts: u64 = 1;

        Self::attach_channels(&self.config, &mut self.channels, &mut self.connecting)?;

        // remaining channels may become connectable once a peer appears or
        // the configured address is updated externally
        while !self.connecting.is_empty() && !self.machine.new_state_pending() {
            thread::sleep(Duration::from_millis(CONNECT_RETRY_INTERVAL_MS));

            for (name, index) in &self.connecting {
                let key = format!("chans.{name}.{index}.address");
                let Ok(new_address) = self.config.get::<String>(&key) else {
                    continue;
                };
                if let Some(sub) = self
                    .channels
                    .get_mut(name)
                    .and_then(|subs| subs.get_mut(*index))
                {
                    if new_address != sub.address() {
                        sub.update_address(new_address);
                    }
                }
            }

            attempts += 1;
            if attempts > max_attempts {
                let unresolved: Vec<String> = self
                    .connecting
                    .iter()
                    .filter_map(|(name, index)| {
                        self.channels
                            .get(name)
                            .and_then(|subs| subs.get(*index))
                            .map(Channel::to_string)
                    })
                    .collect();
                tracing::error!(
                    "could not connect all channels after {} s, still invalid: {}",
                    self.init_timeout_s,
                    unresolved.join(", ")
                );
                return Err(DeviceError::InitTimeout {
                    seconds: self.init_timeout_s,
                    unresolved,
                }
                .into());
            }

            Self::attach_channels(&self.config, &mut self.channels, &mut self.connecting)?;
        }

        if self.channels.is_empty() {
            tracing::warn!("no channels created after finishing initialization");
        }

        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.connect(&ctx)?;

        self.auto_if_idle()?;
        Ok(())
    }

    /// Try to attach every listed channel; successfully attached channels
    /// leave the list, channels that are not yet valid or whose endpoints
    /// are not reachable stay for the next attempt.
    fn attach_channels(
        config: &Properties,
        channels: &mut ChannelMap,
        list: &mut Vec<(String, usize)>,
    ) -> anyhow::Result<()> {
        let mut i = 0;
        while i < list.len() {
            let (name, index) = list[i].clone();
            let Some(subs) = channels.get_mut(&name) else {
                i += 1;
                continue;
            };
            let sub = &mut subs[index];

            if !sub.validate() {
                i += 1;
                continue;
            }

            sub.init().map_err(DeviceError::from)?;

            if Self::attach_channel(config, sub) {
                list.remove(i);
            } else {
                tracing::error!("failed to attach channel {} ({})", sub.name(), sub.method());
                i += 1;
            }
        }
        Ok(())
    }

    /// Attach all endpoints of one channel, honoring per-endpoint
    /// modifiers, resolving tcp hostnames, and writing the actual
    /// attached composite address back into the channel and the config.
    fn attach_channel(config: &Properties, chan: &mut Channel) -> bool {
        let chan_address = chan.address().to_string();
        let mut endpoints: Vec<String> = chan_address.split(',').map(String::from).collect();

        for endpoint in endpoints.iter_mut() {
            let mut bind = chan.method() == ChannelMethod::Bind;
            let mut modifier = false;
            let mut address = endpoint.clone();

            if endpoint.starts_with(['+', '>']) {
                modifier = true;
                bind = false;
                address = endpoint[1..].to_string();
            } else if endpoint.starts_with('@') {
                modifier = true;
                bind = true;
                address = endpoint[1..].to_string();
            }

            if address.starts_with("tcp://") {
                let rest = address["tcp://".len()..].to_string();
                if let Some((host, port)) = rest.split_once(':') {
                    if !(bind && host == "*") {
                        match net::resolve_host(host) {
                            Some(ip) => address = format!("tcp://{ip}:{port}"),
                            None => return false,
                        }
                    }
                }
            }

            let attached = if bind {
                match chan.bind_endpoint(&address) {
                    Ok(actual) => {
                        // the transport may have picked a port; keep the
                        // actual address for the write-back below
                        address = actual;
                        true
                    }
                    Err(e) => {
                        tracing::debug!("failed to bind {}: {e}", chan.name());
                        false
                    }
                }
            } else {
                match chan.connect_endpoint(&address) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("failed to connect {}: {e}", chan.name());
                        false
                    }
                }
            };

            endpoint.clear();
            if modifier {
                endpoint.push(if bind { '@' } else { '+' });
            }
            endpoint.push_str(&address);

            if !attached {
                return false;
            }

            tracing::debug!(
                "attached channel {} to {endpoint} ({}) ({})",
                chan.name(),
                if bind { "bind" } else { "connect" },
                chan.role().map(|r| r.as_str()).unwrap_or("unspecified"),
            );
        }

        let new_address = endpoints.join(",");
        if new_address != chan_address {
            chan.update_address(new_address.clone());
            config.set(
                format!("chans.{}.{}.address", chan.prefix(), chan.index()),
                new_address,
            );
        }

        true
    }

    fn init_task_wrapper(&mut self) -> anyhow::Result<()> {
        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.init_task(&ctx)?;
        self.auto_if_idle()?;
        Ok(())
    }

    fn reset_task_wrapper(&mut self) -> anyhow::Result<()> {
        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.reset_task(&ctx)?;
        self.auto_if_idle()?;
        Ok(())
    }

    fn reset_wrapper(&mut self) -> anyhow::Result<()> {
        self.pool.reset();

        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.reset(&ctx)?;

        for subs in self.channels.values_mut() {
            for sub in subs.iter_mut() {
                sub.teardown();
            }
        }
        self.channels.clear();

        self.auto_if_idle()?;
        Ok(())
    }

    fn exit_wrapper(&mut self) -> anyhow::Result<()> {
        let ctx = DeviceCtx {
            config: &self.config,
            channels: &self.channels,
            machine: &self.machine,
        };
        self.hooks.exit(&ctx)?;
        tracing::debug!("shutting down device {}", self.device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SocketRole, Transport};

    struct NoHooks;
    impl BaseDevice for NoHooks {}

    fn memory_channel(address: &str, method: &str) -> Channel {
        let config = Properties::from_pairs([
            ("chans.data.0.address", address),
            ("chans.data.0.method", method),
            ("chans.data.0.type", "pull"),
            ("chans.data.0.transport", "memory"),
        ]);
        let mut chan = Channel::from_properties("data", 0, &config).unwrap();
        let pool = TransportPool::new(default_creator());
        let transport = pool
            .add(TransportKind::Memory, "test", &config)
            .unwrap();
        chan.set_transport(transport);
        chan.init().unwrap();
        chan
    }

    #[test]
    fn bound_wildcard_address_is_written_back_with_real_port() {
        let config = Properties::new();
        let mut chan = memory_channel("tcp://*:0", "bind");

        assert!(Driver::<NoHooks>::attach_channel(&config, &mut chan));
        assert!(chan.address().starts_with("tcp://*:"));
        assert!(!chan.address().ends_with(":0"));
        assert_eq!(
            config.get::<String>("chans.data.0.address").unwrap(),
            chan.address()
        );
    }

    #[test]
    fn bind_modifier_is_preserved_and_host_resolved() {
        let config = Properties::new();
        let mut chan = memory_channel("@tcp://localhost:0", "connect");

        assert!(Driver::<NoHooks>::attach_channel(&config, &mut chan));
        let address = chan.address().to_string();
        assert!(address.starts_with('@'), "{address}");

        let rest = address.strip_prefix("@tcp://").unwrap();
        let (host, port) = rest.split_once(':').unwrap();
        assert!(host.parse::<std::net::IpAddr>().is_ok(), "host not an ip: {host}");
        assert_ne!(port, "0");
    }

    #[test]
    fn connect_modifier_overrides_bind_method() {
        let config = Properties::new();

        // a peer must be bound first, connects are strict
        let pool = TransportPool::new(default_creator());
        let transport = pool.add(TransportKind::Memory, "peer", &config).unwrap();
        let peer = transport.create_socket(SocketRole::Push, "feed").unwrap();
        let actual = peer.bind("tcp://127.0.0.1:0").unwrap();

        let mut chan = memory_channel(&format!(">{actual}"), "bind");
        assert!(Driver::<NoHooks>::attach_channel(&config, &mut chan));
        // '>' is normalized to '+' on write-back
        assert!(chan.address().starts_with('+'), "{}", chan.address());
    }

    #[test]
    fn failed_connect_leaves_channel_unattached() {
        let config = Properties::new();
        let mut chan = memory_channel("tcp://127.0.0.1:59999", "connect");
        assert!(!Driver::<NoHooks>::attach_channel(&config, &mut chan));
    }
}

use super::rates;
use super::{BaseDevice, DeviceCtx, Driver, InputHandler};
use crate::error::StateError;
use crate::state::{StateMachine, Transition};
use crate::transport::TransportKind;
use crate::utils::RateLimiter;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const SINGLE_POLL_TIMEOUT: Duration = Duration::from_millis(200);
const MULTI_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Issues `ErrorFound` when the running scope unwinds without being
/// disarmed, releasing the rate logger and any poller thread.
struct ErrorGuard<'a> {
    machine: &'a StateMachine,
    armed: bool,
}

impl<'a> ErrorGuard<'a> {
    fn new(machine: &'a StateMachine) -> Self {
        Self {
            machine,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ErrorGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.machine.change_state(Transition::ErrorFound) {
            tracing::debug!("cannot enter error state: {e}");
        }
    }
}

/// Mutable dispatch context shared by the per-transport poller threads;
/// one mutex serializes every callback invocation.
struct DispatchShared<'a, H: BaseDevice> {
    hooks: &'a mut H,
    handlers: &'a mut AHashMap<String, InputHandler<H>>,
}

impl<H: BaseDevice> Driver<H> {
    pub(super) fn run_wrapper(&mut self) -> anyhow::Result<()> {
        tracing::info!("device {} running", self.device_id);

        // record the dispatch mode on the channels before any thread
        // observes them
        for (key, handler) in self.handlers.iter() {
            let Some(subs) = self.channels.get_mut(key) else {
                anyhow::bail!("data callback registered for unknown channel '{key}'");
            };
            let multipart = matches!(handler, InputHandler::Multipart(_));
            for sub in subs.iter_mut() {
                sub.set_multipart(multipart);
            }
        }

        let machine = &self.machine;
        let config = &self.config;
        let channels = &self.channels;
        let hooks = &mut self.hooks;
        let handlers = &mut self.handlers;
        let rate = self.rate;

        let rate_logging = channels
            .values()
            .flatten()
            .any(|sub| sub.rate_logging() > 0);

        thread::scope(|scope| -> anyhow::Result<()> {
            if rate_logging {
                scope.spawn(|| rates::log_channel_rates(machine, channels));
            }

            let mut guard = ErrorGuard::new(machine);
            let ctx = DeviceCtx {
                config,
                channels,
                machine,
            };

            hooks.pre_run(&ctx)?;

            if handlers.is_empty() {
                let mut limiter = RateLimiter::new(rate);
                while !machine.new_state_pending() && hooks.conditional_run(&ctx)? {
                    limiter.maybe_sleep();
                }
                hooks.run(&ctx)?;
            } else {
                let mut input_keys: Vec<String> = handlers.keys().cloned().collect();
                input_keys.sort_unstable();

                if input_keys.len() == 1 && channels[&input_keys[0]].len() == 1 {
                    run_single_channel(&ctx, hooks, handlers, &input_keys[0]);
                } else {
                    run_multi_channel(&ctx, hooks, handlers, &input_keys)?;
                }
            }

            // leaving Running without an external transition means the
            // device finished on its own
            if !machine.new_state_pending() {
                match machine.change_state(Transition::Stop) {
                    Ok(_) | Err(StateError::Terminated) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            hooks.post_run(&ctx)?;

            guard.disarm();
            Ok(())
        })
    }
}

/// Fast path: one input channel with one sub-channel, no poller.
fn run_single_channel<H: BaseDevice>(
    ctx: &DeviceCtx<'_>,
    hooks: &mut H,
    handlers: &mut AHashMap<String, InputHandler<H>>,
    key: &str,
) {
    let machine_pending = || ctx.new_state_pending();
    let chan = &ctx.channels()[key][0];
    let mut proceed = true;

    match handlers.get_mut(key) {
        Some(InputHandler::Message(cb)) => {
            while !machine_pending() && proceed {
                proceed = match chan.recv() {
                    Ok(msg) => cb(hooks, ctx, msg, 0),
                    Err(_) => false,
                };
            }
        }
        Some(InputHandler::Multipart(cb)) => {
            while !machine_pending() && proceed {
                proceed = match chan.recv_parts() {
                    Ok(parts) => cb(hooks, ctx, parts, 0),
                    Err(_) => false,
                };
            }
        }
        None => {}
    }
}

fn run_multi_channel<H: BaseDevice>(
    ctx: &DeviceCtx<'_>,
    hooks: &mut H,
    handlers: &mut AHashMap<String, InputHandler<H>>,
    input_keys: &[String],
) -> anyhow::Result<()> {
    let channels = ctx.channels();

    let mut by_transport: AHashMap<TransportKind, Vec<String>> = AHashMap::new();
    for key in input_keys {
        let kind = channels[key][0].transport_kind();
        by_transport.entry(kind).or_default().push(key.clone());
    }

    if by_transport.len() > 1 {
        return run_multi_transport(ctx, hooks, handlers, by_transport);
    }

    let transport = channels[&input_keys[0]][0]
        .transport()
        .ok_or_else(|| anyhow::anyhow!("channel '{}' has no transport", input_keys[0]))?;
    let mut poller = transport.create_poller(channels, input_keys)?;

    let mut proceed = true;
    while !ctx.new_state_pending() && proceed {
        poller.poll(SINGLE_POLL_TIMEOUT)?;

        'inputs: for key in input_keys {
            for index in 0..channels[key].len() {
                if poller.check_input(key, index) {
                    proceed = dispatch_input(ctx, hooks, handlers, key, index);
                    if !proceed {
                        break 'inputs;
                    }
                }
            }
        }
    }

    Ok(())
}

/// One poller thread per transport kind; a shared atomic `proceed` flag
/// plus one dispatch mutex serialize the callbacks.
fn run_multi_transport<H: BaseDevice>(
    ctx: &DeviceCtx<'_>,
    hooks: &mut H,
    handlers: &mut AHashMap<String, InputHandler<H>>,
    by_transport: AHashMap<TransportKind, Vec<String>>,
) -> anyhow::Result<()> {
    let proceed = AtomicBool::new(true);
    let dispatch = Mutex::new(DispatchShared { hooks, handlers });

    thread::scope(|scope| {
        let mut workers = Vec::with_capacity(by_transport.len());

        for (kind, keys) in by_transport {
            let transport = ctx.channels()[&keys[0]][0]
                .transport()
                .ok_or_else(|| anyhow::anyhow!("no pooled '{kind}' transport"))?;

            let proceed = &proceed;
            let dispatch = &dispatch;
            workers.push(scope.spawn(move || {
                poll_transport_inputs(ctx, transport.as_ref(), &keys, dispatch, proceed)
            }));
        }

        let mut result = Ok(());
        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(_) => result = Err(anyhow::anyhow!("transport poll thread panicked")),
            }
        }
        result
    })
}

fn poll_transport_inputs<H: BaseDevice>(
    ctx: &DeviceCtx<'_>,
    transport: &dyn crate::transport::Transport,
    keys: &[String],
    dispatch: &Mutex<DispatchShared<'_, H>>,
    proceed: &AtomicBool,
) -> anyhow::Result<()> {
    let channels = ctx.channels();

    let result = (|| -> anyhow::Result<()> {
        let mut poller = transport.create_poller(channels, keys)?;

        while !ctx.new_state_pending() && proceed.load(Ordering::Acquire) {
            poller.poll(MULTI_POLL_TIMEOUT)?;

            'inputs: for key in keys {
                for index in 0..channels[key].len() {
                    if poller.check_input(key, index) {
                        let mut shared = dispatch.lock();

                        if !proceed.load(Ordering::Acquire) {
                            break 'inputs;
                        }

                        let DispatchShared { hooks, handlers } = &mut *shared;
                        let more = dispatch_input(ctx, &mut **hooks, &mut **handlers, key, index);
                        proceed.store(more, Ordering::Release);
                        if !more {
                            break 'inputs;
                        }
                    }
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = &result {
        tracing::error!("transport input polling failed: {e}, going to error state");
    }
    result
}

/// Receive from `(key, index)` and invoke its callback; any transfer
/// failure (interrupt, closed peer) ends the dispatch loop.
fn dispatch_input<H: BaseDevice>(
    ctx: &DeviceCtx<'_>,
    hooks: &mut H,
    handlers: &mut AHashMap<String, InputHandler<H>>,
    key: &str,
    index: usize,
) -> bool {
    let chan = &ctx.channels()[key][index];

    match handlers.get_mut(key) {
        Some(InputHandler::Message(cb)) => match chan.recv() {
            Ok(msg) => cb(hooks, ctx, msg, index),
            Err(_) => false,
        },
        Some(InputHandler::Multipart(cb)) => match chan.recv_parts() {
            Ok(parts) => cb(hooks, ctx, parts, index),
            Err(_) => false,
        },
        None => false,
    }
}

use crate::channel::{Channel, ChannelMap};
use crate::state::StateMachine;
use std::time::{Duration, Instant};

struct Tracked<'a> {
    chan: &'a Channel,
    name: String,
    interval: u32,
    counter: u32,
    bytes_rx: u64,
    bytes_tx: u64,
    messages_rx: u64,
    messages_tx: u64,
}

/// Per-channel throughput: `(MB/s, msgs/s)` over `elapsed_ms`.
pub(crate) fn throughput(bytes_delta: u64, messages_delta: u64, elapsed_ms: u64) -> (f64, f64) {
    let mb = (bytes_delta as f64 / 1_000_000.0) / elapsed_ms as f64 * 1000.0;
    let msgs = messages_delta as f64 / elapsed_ms as f64 * 1000.0;
    (mb, msgs)
}

/// Body of the rate-logger thread: once per second (waking early when a
/// transition is pending), roll per-channel interval counters and log one
/// line per channel whose interval elapsed.
///
/// Counter reads are relaxed and may trail in-flight transfers slightly;
/// deltas are taken against the previously logged snapshot, so logged
/// values are nondecreasing.
pub(super) fn log_channel_rates(machine: &StateMachine, channels: &ChannelMap) {
    let mut tracked: Vec<Tracked<'_>> = channels
        .values()
        .flatten()
        .filter(|sub| sub.rate_logging() > 0)
        .map(|chan| Tracked {
            name: chan.name(),
            interval: chan.rate_logging(),
            counter: 0,
            bytes_rx: chan.bytes_rx(),
            bytes_tx: chan.bytes_tx(),
            messages_rx: chan.messages_rx(),
            messages_tx: chan.messages_tx(),
            chan,
        })
        .collect();

    if tracked.is_empty() {
        return;
    }

    let name_width = tracked.iter().map(|t| t.name.len()).max().unwrap_or(0);
    let mut t0 = Instant::now();

    while !machine.new_state_pending() {
        machine.wait_for(Duration::from_secs(1));

        let t1 = Instant::now();
        let elapsed_ms = t1.duration_since(t0).as_millis() as u64;

        for t in tracked.iter_mut() {
            t.counter += 1;
            if t.counter != t.interval {
                continue;
            }
            t.counter = 0;

            if elapsed_ms == 0 {
                continue;
            }

            let bytes_rx = t.chan.bytes_rx();
            let bytes_tx = t.chan.bytes_tx();
            let messages_rx = t.chan.messages_rx();
            let messages_tx = t.chan.messages_tx();

            let (mb_in, msg_in) =
                throughput(bytes_rx - t.bytes_rx, messages_rx - t.messages_rx, elapsed_ms);
            let (mb_out, msg_out) =
                throughput(bytes_tx - t.bytes_tx, messages_tx - t.messages_tx, elapsed_ms);

            t.bytes_rx = bytes_rx;
            t.bytes_tx = bytes_tx;
            t.messages_rx = messages_rx;
            t.messages_tx = messages_tx;

            tracing::info!(
                "{:>width$}: in: {:.2} msg/s ({:.4} MB/s) out: {:.2} msg/s ({:.4} MB/s)",
                t.name,
                msg_in,
                mb_in,
                msg_out,
                mb_out,
                width = name_width,
            );
        }

        t0 = t1;
    }
}

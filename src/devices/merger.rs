use crate::device::{BaseDevice, DeviceCtx};
use crate::error::TransferError;
use crate::transport::Message;
use std::time::Duration;

/// Accumulates deserialized inputs and decides when a merged output is
/// complete.
pub trait MergerPolicy: Send + 'static {
    type In: Send;
    type Out: Send;

    fn merge(&mut self, input: Self::In);

    /// True once a merged output can be taken.
    fn ready(&self) -> bool;

    /// Hand out the merged output and reset for the next round.
    fn take(&mut self) -> Self::Out;
}

/// Decodes raw channel messages into the merger's input type.
pub trait InputPolicy<In>: Send + 'static {
    fn deserialize(&mut self, msg: Message) -> anyhow::Result<In>;
}

/// Encodes merged outputs into channel messages.
pub trait OutputPolicy<Out>: Send + 'static {
    fn serialize(&mut self, out: Out) -> anyhow::Result<Message>;
}

const INPUT_CHANNEL: &str = "data-in";
const OUTPUT_CHANNEL: &str = "data-out";
const DEFAULT_BLOCKING_INTERVAL: Duration = Duration::from_millis(100);

/// Device merging every `data-in` sub-channel into one `data-out` stream.
///
/// Composed from three owned collaborators behind narrow contracts
/// instead of any inheritance-style entanglement: the merge policy keeps
/// the accumulation state, the input and output policies own the codec
/// ends.
pub struct Merger<M, I, O> {
    merger: M,
    input: I,
    output: O,
    blocking_interval: Duration,
}

impl<M, I, O> Merger<M, I, O>
where
    M: MergerPolicy,
    I: InputPolicy<M::In>,
    O: OutputPolicy<M::Out>,
{
    pub fn new(merger: M, input: I, output: O) -> Self {
        Self {
            merger,
            input,
            output,
            blocking_interval: DEFAULT_BLOCKING_INTERVAL,
        }
    }

    /// Poll timeout for the input channels.
    pub fn with_blocking_interval(mut self, interval: Duration) -> Self {
        self.blocking_interval = interval;
        self
    }
}

impl<M, I, O> BaseDevice for Merger<M, I, O>
where
    M: MergerPolicy,
    I: InputPolicy<M::In>,
    O: OutputPolicy<M::Out>,
{
    fn run(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
        let inputs = ctx
            .channels()
            .get(INPUT_CHANNEL)
            .ok_or_else(|| anyhow::anyhow!("merger needs a '{INPUT_CHANNEL}' channel"))?;
        let output = ctx
            .channel(OUTPUT_CHANNEL, 0)
            .ok_or_else(|| anyhow::anyhow!("merger needs a '{OUTPUT_CHANNEL}' channel"))?;

        let transport = inputs[0]
            .transport()
            .ok_or_else(|| anyhow::anyhow!("'{INPUT_CHANNEL}' has no transport"))?;
        let mut poller = transport.create_poller(ctx.channels(), &[INPUT_CHANNEL.to_string()])?;

        while !ctx.new_state_pending() {
            poller.poll(self.blocking_interval)?;

            for index in 0..inputs.len() {
                if !poller.check_input(INPUT_CHANNEL, index) {
                    continue;
                }

                match inputs[index].recv() {
                    Ok(msg) => {
                        let item = self.input.deserialize(msg)?;
                        self.merger.merge(item);
                    }
                    Err(TransferError::Interrupted) => return Ok(()),
                    Err(e) => return Err(anyhow::Error::from(e)),
                }

                if self.merger.ready() {
                    let msg = self.output.serialize(self.merger.take())?;
                    match output.send(msg) {
                        Ok(_) => {}
                        Err(TransferError::Interrupted) => return Ok(()),
                        Err(e) => return Err(anyhow::Error::from(e)),
                    }
                }
            }
        }

        Ok(())
    }
}

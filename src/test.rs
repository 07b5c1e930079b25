#[cfg(test)]
mod tests {
    use crate::config::{Properties, Value};
    use crate::control::Controller;
    use crate::device::{BaseDevice, Device, DeviceCtx, DeviceHandle};
    use crate::state::{State, StateMachine, StateQueue, Transition};
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{Message, SocketRole, Transport, TransportKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const STEP: Duration = Duration::from_secs(5);

    fn sink_config(id: &str, port: &str) -> Properties {
        Properties::from_pairs([
            ("id", Value::from(id)),
            ("transport", Value::from("memory")),
            ("chans.data.0.address", Value::from(format!("tcp://*:{port}"))),
            ("chans.data.0.method", Value::from("bind")),
            ("chans.data.0.type", Value::from("pull")),
            ("chans.data.0.rateLogging", Value::Uint(0)),
        ])
    }

    fn feed(kind: TransportKind, endpoint: &str, payloads: &[u64]) {
        let transport = MemoryTransport::attach(kind, "feeder");
        let push = transport.create_socket(SocketRole::Push, "feed").expect("feeder socket");
        push.connect(endpoint).expect("feeder connect");
        for v in payloads {
            push.send(vec![Message::from_slice(&v.to_le_bytes())])
                .expect("feeder send");
        }
    }

    // ---- sink fixture: counts messages, leaves Running at max-iterations

    #[derive(Default)]
    struct Sink {
        max_iterations: u64,
        iterations: u64,
    }

    impl BaseDevice for Sink {
        fn init_task(&mut self, ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
            self.max_iterations = ctx.config().get_or("max-iterations", 0)?;
            Ok(())
        }
    }

    fn spawn_sink(config: Properties) -> DeviceHandle {
        let mut device = Device::new(config, Sink::default());
        device.on_data("data", |sink: &mut Sink, _ctx: &DeviceCtx<'_>, msg: Message, _index| {
            let value = u64::from_le_bytes(msg.data().try_into().expect("u64 payload"));
            tracing::info!("Received message: \"{value}\"");

            sink.iterations += 1;
            if sink.max_iterations > 0 && sink.iterations >= sink.max_iterations {
                tracing::info!("configured maximum number of iterations reached");
                return false;
            }
            true
        });
        device.spawn()
    }

    #[test]
    fn sink_leaves_running_after_max_iterations() {
        let config = sink_config("sink-e2e", "0");
        config.set("max-iterations", Value::Uint(3));

        let handle = spawn_sink(config.clone());
        let controller = Controller::attach(handle.machine().clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");

        // the bound address was written back with the assigned port
        let endpoint = config.get::<String>("chans.data.0.address").unwrap();
        assert!(!endpoint.ends_with(":0"), "{endpoint}");
        feed(TransportKind::Memory, &endpoint, &[1, 2, 3]);

        // third callback returns false -> driver issues Stop -> Ready
        controller
            .wait_for(State::Ready, STEP)
            .expect("device did not stop after max iterations");

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    #[test]
    fn connect_channel_retries_until_config_address_is_updated() {
        let config = Properties::from_pairs([
            ("id", Value::from("retrier")),
            ("transport", Value::from("memory")),
            ("init-timeout", Value::Uint(5)),
            ("chans.data.0.address", Value::from("tcp://127.0.0.1:55555")),
            ("chans.data.0.method", Value::from("connect")),
            ("chans.data.0.type", Value::from("pull")),
            ("chans.data.0.rateLogging", Value::Uint(0)),
        ]);

        // live peer at a different endpoint
        let peer_transport = MemoryTransport::attach(TransportKind::Memory, "peer");
        let peer = peer_transport
            .create_socket(SocketRole::Push, "feed")
            .unwrap();
        peer.bind("tcp://127.0.0.1:55556").unwrap();

        let handle = Device::new(config.clone(), Sink::default()).spawn();
        let controller = Controller::attach(handle.machine().clone());

        controller.change_state(Transition::InitDevice).unwrap();
        controller.wait_for(State::InitializingDevice, STEP).unwrap();
        controller.change_state(Transition::CompleteInit).unwrap();
        controller.wait_for(State::Initialized, STEP).unwrap();
        controller.change_state(Transition::Bind).unwrap();
        controller.wait_for(State::Bound, STEP).unwrap();
        controller.change_state(Transition::Connect).unwrap();

        // point the channel at the live peer while Connecting retries
        thread::sleep(Duration::from_millis(100));
        config.set("chans.data.0.address", "tcp://127.0.0.1:55556");

        controller
            .wait_for(State::DeviceReady, STEP)
            .expect("Connecting did not pick up the updated address");
        assert!(!handle.machine().new_state_pending());

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    #[test]
    fn connect_timeout_drives_the_device_to_error() {
        let config = Properties::from_pairs([
            ("id", Value::from("timeouter")),
            ("transport", Value::from("memory")),
            ("init-timeout", Value::Uint(1)),
            ("chans.data.0.address", Value::from("tcp://127.0.0.1:55557")),
            ("chans.data.0.method", Value::from("connect")),
            ("chans.data.0.type", Value::from("pull")),
            ("chans.data.0.rateLogging", Value::Uint(0)),
        ]);

        let handle = Device::new(config, Sink::default()).spawn();
        let controller = Controller::attach(handle.machine().clone());

        let result = controller.to_ready(STEP);
        assert!(result.is_err(), "lifecycle must fail, no peer ever appears");
        assert_eq!(handle.state(), State::Error);

        // Error remains recoverable by an external controller
        controller.shutdown(STEP).expect("shutdown from Error failed");
        assert_eq!(handle.state(), State::Exiting);
        handle.join();
    }

    // ---- conditional-run fixture

    struct Spinner {
        post_run_ran: Arc<AtomicBool>,
    }

    impl BaseDevice for Spinner {
        fn conditional_run(&mut self, _ctx: &DeviceCtx<'_>) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn post_run(&mut self, _ctx: &DeviceCtx<'_>) -> anyhow::Result<()> {
            self.post_run_ran.store(true, Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn external_stop_interrupts_a_conditional_run_loop() {
        let config = Properties::from_pairs([
            ("id", Value::from("spinner")),
            ("transport", Value::from("memory")),
            ("rate", Value::Float(200.0)),
        ]);

        let post_run_ran = Arc::new(AtomicBool::new(false));
        let hooks = Spinner {
            post_run_ran: post_run_ran.clone(),
        };

        let handle = Device::new(config, hooks).spawn();
        let controller = Controller::attach(handle.machine().clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");

        thread::sleep(Duration::from_millis(50));
        let requested = Instant::now();
        controller.change_state(Transition::Stop).unwrap();
        controller
            .wait_for(State::Ready, Duration::from_secs(1))
            .expect("Stop was not observed by the loop");

        assert!(requested.elapsed() < Duration::from_millis(500));
        assert!(post_run_ran.load(Ordering::Acquire), "PostRun did not run");

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    // ---- multi-transport fixture

    #[derive(Default)]
    struct TwoInputs {
        first: u32,
        second: u32,
    }

    impl BaseDevice for TwoInputs {}

    #[test]
    fn multi_transport_inputs_fan_out_and_stop_together() {
        let config = Properties::from_pairs([
            ("id", Value::from("fanout")),
            ("transport", Value::from("memory")),
            ("chans.in1.0.address", Value::from("tcp://*:0")),
            ("chans.in1.0.method", Value::from("bind")),
            ("chans.in1.0.type", Value::from("pull")),
            ("chans.in1.0.transport", Value::from("memory")),
            ("chans.in1.0.rateLogging", Value::Uint(0)),
            ("chans.in2.0.address", Value::from("tcp://*:0")),
            ("chans.in2.0.method", Value::from("bind")),
            ("chans.in2.0.type", Value::from("pull")),
            ("chans.in2.0.transport", Value::from("shmem")),
            ("chans.in2.0.rateLogging", Value::Uint(0)),
        ]);

        let mut device = Device::new(config.clone(), TwoInputs::default());
        device.on_data("in1", |h: &mut TwoInputs, _ctx: &DeviceCtx<'_>, _msg, _index| {
            h.first += 1;
            h.first < 10
        });
        device.on_data("in2", |h: &mut TwoInputs, _ctx: &DeviceCtx<'_>, _msg, _index| {
            h.second += 1;
            h.second < 10
        });

        let handle = device.spawn();
        let controller = Controller::attach(handle.machine().clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");

        let payloads: Vec<u64> = (1..=10).collect();
        let ep1 = config.get::<String>("chans.in1.0.address").unwrap();
        let ep2 = config.get::<String>("chans.in2.0.address").unwrap();
        feed(TransportKind::Memory, &ep1, &payloads);
        feed(TransportKind::Shmem, &ep2, &payloads);

        // one callback returning false stops both poller threads
        controller
            .wait_for(State::Ready, STEP)
            .expect("fan-out did not stop");

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    #[test]
    fn rate_logged_channel_runs_and_stops_cleanly() {
        let config = sink_config("rated", "0");
        config.set("chans.data.0.rateLogging", Value::Uint(1));

        let handle = spawn_sink(config.clone());
        let controller = Controller::attach(handle.machine().clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");

        let endpoint = config.get::<String>("chans.data.0.address").unwrap();
        feed(
            TransportKind::Memory,
            &endpoint,
            &(1..=100).collect::<Vec<u64>>(),
        );

        // let the rate logger take at least one snapshot
        thread::sleep(Duration::from_millis(1200));

        controller.change_state(Transition::Stop).unwrap();
        controller
            .wait_for(State::Ready, STEP)
            .expect("device did not stop");

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    // ---- merger policies

    struct SumBatches {
        batch: u32,
        count: u32,
        acc: u64,
    }

    impl crate::devices::MergerPolicy for SumBatches {
        type In = u64;
        type Out = u64;

        fn merge(&mut self, input: u64) {
            self.acc += input;
            self.count += 1;
        }

        fn ready(&self) -> bool {
            self.count >= self.batch
        }

        fn take(&mut self) -> u64 {
            let out = self.acc;
            self.acc = 0;
            self.count = 0;
            out
        }
    }

    struct U64Codec;

    impl crate::devices::InputPolicy<u64> for U64Codec {
        fn deserialize(&mut self, msg: Message) -> anyhow::Result<u64> {
            let bytes: [u8; 8] = msg
                .data()
                .try_into()
                .map_err(|_| anyhow::anyhow!("payload must be 8 bytes"))?;
            Ok(u64::from_le_bytes(bytes))
        }
    }

    impl crate::devices::OutputPolicy<u64> for U64Codec {
        fn serialize(&mut self, out: u64) -> anyhow::Result<Message> {
            Ok(Message::from_slice(&out.to_le_bytes()))
        }
    }

    #[test]
    fn merger_batches_inputs_into_single_outputs() {
        let config = Properties::from_pairs([
            ("id", Value::from("merger")),
            ("transport", Value::from("memory")),
            ("chans.data-in.0.address", Value::from("tcp://*:0")),
            ("chans.data-in.0.method", Value::from("bind")),
            ("chans.data-in.0.type", Value::from("pull")),
            ("chans.data-in.0.rateLogging", Value::Uint(0)),
            ("chans.data-out.0.address", Value::from("tcp://*:0")),
            ("chans.data-out.0.method", Value::from("bind")),
            ("chans.data-out.0.type", Value::from("push")),
            ("chans.data-out.0.rateLogging", Value::Uint(0)),
        ]);

        let merger = crate::devices::Merger::new(
            SumBatches {
                batch: 2,
                count: 0,
                acc: 0,
            },
            U64Codec,
            U64Codec,
        );

        let handle = Device::new(config.clone(), merger).spawn();
        let controller = Controller::attach(handle.machine().clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");

        let in_ep = config.get::<String>("chans.data-in.0.address").unwrap();
        let out_ep = config.get::<String>("chans.data-out.0.address").unwrap();

        let consumer_transport = MemoryTransport::attach(TransportKind::Memory, "consumer");
        let consumer = consumer_transport
            .create_socket(SocketRole::Pull, "merged")
            .unwrap();
        consumer.connect(&out_ep).unwrap();

        feed(TransportKind::Memory, &in_ep, &[1, 2, 3, 4]);

        let mut sums = Vec::new();
        for _ in 0..2 {
            let parts = consumer.recv().expect("merged output");
            let bytes: [u8; 8] = parts[0].data().try_into().unwrap();
            sums.push(u64::from_le_bytes(bytes));
        }
        assert_eq!(sums, vec![3, 7]);

        controller.shutdown(STEP).expect("shutdown failed");
        handle.join();
    }

    #[test]
    fn observed_states_follow_the_lifecycle_graph() {
        let config = Properties::from_pairs([
            ("id", Value::from("walker")),
            ("transport", Value::from("memory")),
        ]);

        struct NoTask;
        impl BaseDevice for NoTask {}

        let handle = Device::new(config, NoTask).spawn();

        let machine: StateMachine = handle.machine().clone();
        let (_sub, observer) = StateQueue::subscribe(&machine, "walk-observer");

        let controller = Controller::attach(machine.clone());
        controller.to_running(STEP).expect("lifecycle to Running failed");
        controller
            .wait_for(State::Ready, STEP)
            .expect("device did not finish Run");
        controller.shutdown(STEP).expect("shutdown failed");

        let mut observed = Vec::new();
        while let Ok(state) = observer.next(Duration::from_millis(200)) {
            observed.push(state);
            if state == State::Exiting {
                break;
            }
        }

        assert_eq!(
            observed,
            vec![
                State::InitializingDevice,
                State::Initialized,
                State::Binding,
                State::Bound,
                State::Connecting,
                State::DeviceReady,
                State::InitializingTask,
                State::Ready,
                State::Running,
                State::Ready,
                State::ResettingTask,
                State::DeviceReady,
                State::ResettingDevice,
                State::Idle,
                State::Exiting,
            ]
        );

        handle.join();
    }
}

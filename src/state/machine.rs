use crate::error::StateError;
use crate::state::{State, Transition, next_state};
use crate::utils::SharedFlag;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

type TransitionCallback = Box<dyn FnMut(Transition) + Send>;
type StateCallback = Box<dyn FnMut(State) + Send>;

struct Work {
    /// Validated transitions with their precomputed target states.
    queue: VecDeque<(Transition, State)>,
    /// State the machine will be in once the queue drains; new requests
    /// are validated against this, not against the possibly lagging
    /// current state.
    tail: State,
    current: State,
    stopped: bool,
}

struct Shared {
    work: Mutex<Work>,
    cv: Condvar,
    pending: SharedFlag,
    transition_subs: Mutex<Vec<(String, TransitionCallback)>>,
    state_subs: Mutex<Vec<(String, StateCallback)>>,
    prepare: Mutex<Option<StateCallback>>,
}

/// Finite state machine driving the device lifecycle.
///
/// The handle is cheap to clone and share. Exactly one thread runs
/// [`process_states`](Self::process_states); every other thread interacts
/// through transition requests, subscriptions, and the pending-state hint.
///
/// Ordering contract: transition subscribers run on the *requesting*
/// thread, synchronously inside [`change_state`](Self::change_state).
/// The prepare hook, state subscribers (in registration order) and the
/// main handler run on the worker thread, in that order, for every state.
#[derive(Clone)]
pub struct StateMachine {
    shared: Arc<Shared>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                work: Mutex::new(Work {
                    queue: VecDeque::new(),
                    tail: State::Idle,
                    current: State::Idle,
                    stopped: false,
                }),
                cv: Condvar::new(),
                pending: SharedFlag::new(false),
                transition_subs: Mutex::new(Vec::new()),
                state_subs: Mutex::new(Vec::new()),
                prepare: Mutex::new(None),
            }),
        }
    }

    /// Current state as last entered by the worker.
    pub fn state(&self) -> State {
        self.shared.work.lock().current
    }

    /// Queue a transition. Validation happens here, against the state the
    /// machine will have reached once already-queued work is consumed.
    /// Transition subscribers fire before this returns.
    pub fn change_state(&self, transition: Transition) -> Result<State, StateError> {
        let target = {
            let mut work = self.shared.work.lock();
            if work.stopped {
                return Err(StateError::Terminated);
            }

            let target = next_state(work.tail, transition).ok_or(StateError::InvalidTransition {
                transition,
                state: work.tail,
            })?;

            work.queue.push_back((transition, target));
            work.tail = target;
            self.shared.pending.set_release(true);
            self.shared.cv.notify_all();
            target
        };

        for (_, cb) in self.shared.transition_subs.lock().iter_mut() {
            cb(transition);
        }

        Ok(target)
    }

    /// True iff a transition is queued but not yet consumed. Long-running
    /// handlers poll this to yield cooperatively; it is a relaxed-cost
    /// read with no locking.
    #[inline]
    pub fn new_state_pending(&self) -> bool {
        self.shared.pending.get_acquire()
    }

    /// Block the calling handler until a transition is queued (or the
    /// machine is told to stop handling states).
    pub fn wait_for_pending_state(&self) {
        let mut work = self.shared.work.lock();
        while work.queue.is_empty() && !work.stopped {
            self.shared.cv.wait(&mut work);
        }
    }

    /// Sleep up to `duration`, waking early when a transition arrives.
    /// Returns true iff the full duration elapsed undisturbed.
    pub fn wait_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut work = self.shared.work.lock();
        while work.queue.is_empty() && !work.stopped {
            if self.shared.cv.wait_until(&mut work, deadline).timed_out() {
                return true;
            }
        }
        false
    }

    pub fn subscribe_to_new_transition(
        &self,
        id: impl Into<String>,
        cb: impl FnMut(Transition) + Send + 'static,
    ) {
        self.shared
            .transition_subs
            .lock()
            .push((id.into(), Box::new(cb)));
    }

    pub fn unsubscribe_from_new_transition(&self, id: &str) {
        self.shared.transition_subs.lock().retain(|(i, _)| i != id);
    }

    pub fn subscribe_to_state_change(
        &self,
        id: impl Into<String>,
        cb: impl FnMut(State) + Send + 'static,
    ) {
        self.shared.state_subs.lock().push((id.into(), Box::new(cb)));
    }

    pub fn unsubscribe_from_state_change(&self, id: &str) {
        self.shared.state_subs.lock().retain(|(i, _)| i != id);
    }

    /// Install the hook invoked on the worker just before each state's
    /// subscribers and main handler.
    pub fn prepare_state(&self, cb: impl FnMut(State) + Send + 'static) {
        *self.shared.prepare.lock() = Some(Box::new(cb));
    }

    /// Consume queued transitions and invoke `handler` for every entered
    /// state, on the calling thread, until the machine reaches `Exiting`
    /// or [`stop_handling_states`](Self::stop_handling_states) drains the
    /// queue. This is the single worker loop.
    pub fn process_states(&self, mut handler: impl FnMut(State)) {
        loop {
            let (transition, target) = {
                let mut work = self.shared.work.lock();
                loop {
                    if let Some(item) = work.queue.pop_front() {
                        // stopping raises the hint permanently, so only an
                        // emptied queue of a live machine clears it
                        if work.queue.is_empty() && !work.stopped {
                            self.shared.pending.set_release(false);
                        }
                        break item;
                    }
                    if work.stopped {
                        return;
                    }
                    self.shared.cv.wait(&mut work);
                }
            };

            tracing::trace!("processing transition {transition} -> state {target}");

            if let Some(prepare) = self.shared.prepare.lock().as_mut() {
                prepare(target);
            }

            self.shared.work.lock().current = target;

            for (_, cb) in self.shared.state_subs.lock().iter_mut() {
                cb(target);
            }

            handler(target);

            if target == State::Exiting {
                self.shared.work.lock().stopped = true;
                self.shared.cv.notify_all();
                return;
            }
        }
    }

    /// Ask the worker to exit once queued work is consumed, and release
    /// every cooperative wait. The pending hint is raised permanently so
    /// in-flight handlers observe a reason to yield.
    pub fn stop_handling_states(&self) {
        let mut work = self.shared.work.lock();
        work.stopped = true;
        self.shared.pending.set_release(true);
        self.shared.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    #[test]
    fn rejects_invalid_transitions() {
        let machine = StateMachine::new();
        assert!(matches!(
            machine.change_state(Transition::Run),
            Err(StateError::InvalidTransition { .. })
        ));
        assert_eq!(machine.change_state(Transition::InitDevice).unwrap(), State::InitializingDevice);
    }

    #[test]
    fn validates_against_queued_tail_state() {
        let machine = StateMachine::new();
        // nothing is consumed yet, so these must chain off each other
        machine.change_state(Transition::InitDevice).unwrap();
        machine.change_state(Transition::CompleteInit).unwrap();
        assert!(machine.change_state(Transition::Run).is_err());
        machine.change_state(Transition::Bind).unwrap();
        assert!(machine.new_state_pending());
    }

    #[test]
    fn worker_sees_states_in_request_order() {
        let machine = StateMachine::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        machine.change_state(Transition::InitDevice).unwrap();
        machine.change_state(Transition::CompleteInit).unwrap();
        machine.change_state(Transition::Bind).unwrap();
        machine.change_state(Transition::Auto).unwrap();

        let worker = {
            let machine = machine.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                machine.process_states(move |state| {
                    seen.lock().unwrap().push(state);
                })
            })
        };

        thread::sleep(Duration::from_millis(50));
        machine.stop_handling_states();
        worker.join().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                State::InitializingDevice,
                State::Initialized,
                State::Binding,
                State::Bound,
            ]
        );
        assert_eq!(machine.state(), State::Bound);
    }

    #[test]
    fn subscribers_run_in_registration_order_before_handler() {
        let machine = StateMachine::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            machine.subscribe_to_state_change(tag, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        machine.change_state(Transition::InitDevice).unwrap();

        let worker = {
            let machine = machine.clone();
            let order = order.clone();
            thread::spawn(move || {
                machine.process_states(move |_| {
                    order.lock().unwrap().push("handler");
                })
            })
        };

        thread::sleep(Duration::from_millis(50));
        machine.stop_handling_states();
        worker.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "handler"]);
    }

    #[test]
    fn transition_subscribers_fire_on_requesting_thread() {
        let machine = StateMachine::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            machine.subscribe_to_new_transition("probe", move |t| {
                seen.lock().unwrap().push(t);
            });
        }

        machine.change_state(Transition::InitDevice).unwrap();
        // no worker is running, yet the subscriber already fired
        assert_eq!(*seen.lock().unwrap(), vec![Transition::InitDevice]);

        machine.unsubscribe_from_new_transition("probe");
        machine.change_state(Transition::CompleteInit).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn wait_for_wakes_early_on_pending_state() {
        let machine = StateMachine::new();

        let waiter = {
            let machine = machine.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let undisturbed = machine.wait_for(Duration::from_secs(5));
                (undisturbed, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        machine.change_state(Transition::InitDevice).unwrap();

        let (undisturbed, elapsed) = waiter.join().unwrap();
        assert!(!undisturbed);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn pending_clears_once_queue_is_consumed() {
        let machine = StateMachine::new();
        machine.change_state(Transition::InitDevice).unwrap();
        assert!(machine.new_state_pending());

        let worker = {
            let machine = machine.clone();
            thread::spawn(move || machine.process_states(|_| {}))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!machine.new_state_pending());

        machine.stop_handling_states();
        worker.join().unwrap();
    }
}

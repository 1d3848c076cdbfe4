use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::event::{AppCallbacks, Event};
use crate::mac::{EventStatus, McpsType, MlmeConfirm};
use crate::test_util::{MockMac, MockTimer, StepRng, TimerLog};
use crate::{Config, ConnectStatus, Stack};

pub(crate) struct Recording {
    pub events: Rc<RefCell<Vec<Event>>>,
    pub link_checks: Rc<RefCell<Vec<(u8, u8)>>>,
    pub link_check_enabled: bool,
}

impl AppCallbacks for Recording {
    fn on_event(&mut self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn on_link_check_response(&mut self, demod_margin: u8, gateway_count: u8) {
        self.link_checks.borrow_mut().push((demod_margin, gateway_count));
    }

    fn handles_link_check(&self) -> bool {
        self.link_check_enabled
    }

    fn battery_level(&self) -> u8 {
        128
    }
}

pub(crate) type TestStack = Stack<MockMac, MockTimer, StepRng, Recording>;

pub(crate) struct Harness {
    pub events: Rc<RefCell<Vec<Event>>>,
    pub link_checks: Rc<RefCell<Vec<(u8, u8)>>>,
    pub clock: Rc<Cell<u32>>,
    pub timers: Rc<RefCell<TimerLog>>,
}

impl Harness {
    pub fn take_events(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn advance_clock(&self, ms: u32) {
        self.clock.set(self.clock.get() + ms);
    }
}

fn setup_inner(config: Config, link_check_enabled: bool) -> (TestStack, Harness) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let link_checks = Rc::new(RefCell::new(Vec::new()));
    let clock = Rc::new(Cell::new(1_000));
    let timers = Rc::new(RefCell::new(TimerLog::default()));

    let mut stack = Stack::new(
        MockMac::default(),
        MockTimer::new(clock.clone(), timers.clone()),
        StepRng(7),
        config,
    );
    stack.initialize().unwrap();
    stack
        .add_app_callbacks(Recording {
            events: events.clone(),
            link_checks: link_checks.clone(),
            link_check_enabled,
        })
        .unwrap();

    (stack, Harness { events, link_checks, clock, timers })
}

pub(crate) fn setup_with_config(config: Config) -> (TestStack, Harness) {
    setup_inner(config, true)
}

pub(crate) fn setup() -> (TestStack, Harness) {
    setup_with_config(Config::default())
}

pub(crate) fn setup_without_link_check() -> (TestStack, Harness) {
    setup_inner(Config::default(), false)
}

/// Uninitialized stack without callbacks, for precondition tests.
pub(crate) fn setup_uninitialized() -> TestStack {
    let clock = Rc::new(Cell::new(0));
    let timers = Rc::new(RefCell::new(TimerLog::default()));
    Stack::new(MockMac::default(), MockTimer::new(clock, timers), StepRng(7), Config::default())
}

/// Drive the OTAA exchange to a connected session.
pub(crate) fn join_otaa(stack: &mut TestStack, harness: &Harness) {
    assert_eq!(stack.connect().unwrap(), ConnectStatus::ConnectInProgress);
    stack.on_tx_done(harness.clock.get());
    stack
        .mac_mut()
        .pending_confirms
        .push(MlmeConfirm::JoinAccept { status: EventStatus::Ok });
    stack.on_rx_done(&[0x20, 0x01, 0x02], -50, 8, harness.clock.get());
    assert_eq!(harness.take_events(), vec![Event::Connected]);
}

/// Connect by personalization, which completes synchronously.
pub(crate) fn join_abp(stack: &mut TestStack, harness: &Harness) {
    assert_eq!(stack.connect().unwrap(), ConnectStatus::Connected);
    assert_eq!(harness.take_events(), vec![Event::Connected]);
}

pub(crate) fn abp_config() -> Config {
    Config { over_the_air_activation: false, ..Config::default() }
}

/// Stage a downlink indication on the mock MAC.
pub(crate) fn stage_downlink(stack: &mut TestStack, port: u8, payload: &[u8], msg_type: McpsType) {
    let indication = &mut stack.mac_mut().indication;
    indication.pending = true;
    indication.is_data_recvd = true;
    indication.port = port;
    indication.msg_type = msg_type;
    indication.buffer.clear();
    indication.buffer.extend_from_slice(payload).unwrap();
}

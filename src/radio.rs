//! Radio-interrupt to event-queue handoff.
//!
//! Interrupt handlers call into [`RadioIrq`], which captures a copy of the
//! event (including the PHY payload) and enqueues it on a lock-free
//! single-producer single-consumer channel. The worker side drains the
//! channel from event-queue context and feeds the stack, so every state
//! transition happens on one thread.
//!
//! A single atomic flag guards the payload slot: it is taken before the
//! payload is copied and released only after reception processing finished.
//! A second frame arriving in between is dropped to protect the payload in
//! flight.

use core::sync::atomic::{AtomicBool, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};
use heapless::Vec;

use crate::event::AppCallbacks;
use crate::mac::{MacLayer, MAX_PHY_PAYLOAD};
use crate::stack::Stack;
use crate::timer::TimerContext;
use rand_core::RngCore;

const QUEUE_DEPTH: usize = 4;

/// A radio event captured at interrupt time.
#[derive(Debug)]
pub enum RadioEvent {
    TxDone { timestamp_ms: u32 },
    TxTimeout,
    RxDone { payload: Vec<u8, MAX_PHY_PAYLOAD>, rssi: i16, snr: i8, timestamp_ms: u32 },
    RxError,
    RxTimeout,
}

/// Backing storage for the interrupt channel. Create one per stack and
/// [`split`](RadioEventQueue::split) it into the two endpoints.
pub struct RadioEventQueue {
    queue: Queue<RadioEvent, QUEUE_DEPTH>,
    rx_payload_in_use: AtomicBool,
}

impl RadioEventQueue {
    pub const fn new() -> RadioEventQueue {
        RadioEventQueue { queue: Queue::new(), rx_payload_in_use: AtomicBool::new(false) }
    }

    pub fn split(&mut self) -> (RadioIrq<'_>, RadioEvents<'_>) {
        let (producer, consumer) = self.queue.split();
        (
            RadioIrq { producer, rx_payload_in_use: &self.rx_payload_in_use },
            RadioEvents { consumer, rx_payload_in_use: &self.rx_payload_in_use },
        )
    }
}

impl Default for RadioEventQueue {
    fn default() -> RadioEventQueue {
        RadioEventQueue::new()
    }
}

/// Producer endpoint, safe to drive from interrupt context.
pub struct RadioIrq<'a> {
    producer: Producer<'a, RadioEvent, QUEUE_DEPTH>,
    rx_payload_in_use: &'a AtomicBool,
}

impl RadioIrq<'_> {
    pub fn tx_done(&mut self, timestamp_ms: u32) {
        let _ = self.producer.enqueue(RadioEvent::TxDone { timestamp_ms });
    }

    pub fn tx_timeout(&mut self) {
        let _ = self.producer.enqueue(RadioEvent::TxTimeout);
    }

    /// Capture a received frame. The frame is dropped when it exceeds the
    /// PHY maximum or when the previous payload is still being processed.
    pub fn rx_done(&mut self, payload: &[u8], rssi: i16, snr: i8, timestamp_ms: u32) {
        if payload.len() > MAX_PHY_PAYLOAD || self.rx_payload_in_use.swap(true, Ordering::Acquire) {
            return;
        }
        // cannot overflow, checked above
        let payload = Vec::from_slice(payload).unwrap();
        if self.producer.enqueue(RadioEvent::RxDone { payload, rssi, snr, timestamp_ms }).is_err() {
            self.rx_payload_in_use.store(false, Ordering::Release);
        }
    }

    pub fn rx_error(&mut self) {
        let _ = self.producer.enqueue(RadioEvent::RxError);
    }

    pub fn rx_timeout(&mut self) {
        let _ = self.producer.enqueue(RadioEvent::RxTimeout);
    }
}

/// Consumer endpoint, drained by the event-queue worker.
pub struct RadioEvents<'a> {
    consumer: Consumer<'a, RadioEvent, QUEUE_DEPTH>,
    rx_payload_in_use: &'a AtomicBool,
}

impl RadioEvents<'_> {
    /// Feed all pending radio events to the stack, in arrival order.
    pub fn dispatch<M, T, G, A>(&mut self, stack: &mut Stack<M, T, G, A>)
    where
        M: MacLayer,
        T: TimerContext,
        G: RngCore,
        A: AppCallbacks,
    {
        while let Some(event) = self.consumer.dequeue() {
            match event {
                RadioEvent::TxDone { timestamp_ms } => stack.on_tx_done(timestamp_ms),
                RadioEvent::TxTimeout => stack.on_tx_timeout(),
                RadioEvent::RxDone { payload, rssi, snr, timestamp_ms } => {
                    stack.on_rx_done(&payload, rssi, snr, timestamp_ms);
                    self.rx_payload_in_use.store(false, Ordering::Release);
                }
                RadioEvent::RxError => stack.on_rx_error(),
                RadioEvent::RxTimeout => stack.on_rx_timeout(),
            }
        }
    }
}

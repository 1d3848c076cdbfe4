//! Thread-safe application façade.
//!
//! Wraps the [`Stack`] in a blocking mutex so application threads can call
//! into it concurrently with event-queue work. Every operation takes the
//! scoped lock, delegates, and releases on all exit paths. The raw mutex is
//! pluggable: `CriticalSectionRawMutex` for multi-context targets,
//! `NoopRawMutex` where the caller already serializes.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::blocking_mutex::Mutex;
use rand_core::RngCore;

use crate::event::AppCallbacks;
use crate::mac::{ChannelPlan, DeviceClass, MacLayer};
#[cfg(feature = "class-b")]
use crate::mac::Beacon;
use crate::session::JoinMode;
use crate::stack::{RxMetadata, Stack, TxMetadata};
use crate::timer::TimerContext;
use crate::{ConnectStatus, MsgFlags, Result};

pub struct Interface<M, T, G, A = (), RM = CriticalSectionRawMutex>
where
    M: MacLayer,
    T: TimerContext,
    G: RngCore,
    A: AppCallbacks,
    RM: RawMutex,
{
    stack: Mutex<RM, RefCell<Stack<M, T, G, A>>>,
}

impl<M, T, G, A, RM> Interface<M, T, G, A, RM>
where
    M: MacLayer,
    T: TimerContext,
    G: RngCore,
    A: AppCallbacks,
    RM: RawMutex,
{
    pub fn new(stack: Stack<M, T, G, A>) -> Interface<M, T, G, A, RM> {
        Interface { stack: Mutex::new(RefCell::new(stack)) }
    }

    /// Run `f` with the stack lock held. This is the primitive every other
    /// method uses; it is public so integrations can dispatch radio and
    /// timer events under the same lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut Stack<M, T, G, A>) -> R) -> R {
        self.stack.lock(|stack| f(&mut stack.borrow_mut()))
    }

    pub fn initialize(&self) -> Result {
        self.with_lock(|stack| stack.initialize())
    }

    pub fn add_app_callbacks(&self, callbacks: A) -> Result {
        self.with_lock(|stack| stack.add_app_callbacks(callbacks))
    }

    pub fn connect(&self) -> Result<ConnectStatus> {
        self.with_lock(|stack| stack.connect())
    }

    pub fn connect_with(&self, join: &JoinMode) -> Result<ConnectStatus> {
        self.with_lock(|stack| stack.connect_with(join))
    }

    pub fn disconnect(&self) -> Result {
        self.with_lock(|stack| stack.disconnect())
    }

    pub fn send(&self, port: u8, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.with_lock(|stack| stack.send(port, data, flags))
    }

    pub fn receive(&self, port: u8, data: &mut [u8], flags: MsgFlags) -> Result<usize> {
        self.with_lock(|stack| stack.receive(port, data, flags))
    }

    pub fn receive_any(&self, data: &mut [u8]) -> Result<(usize, u8, MsgFlags)> {
        self.with_lock(|stack| stack.receive_any(data))
    }

    pub fn cancel_sending(&self) -> Result {
        self.with_lock(|stack| stack.cancel_sending())
    }

    pub fn set_datarate(&self, data_rate: u8) -> Result {
        self.with_lock(|stack| stack.set_datarate(data_rate))
    }

    pub fn set_confirmed_msg_retries(&self, count: u8) -> Result {
        self.with_lock(|stack| stack.set_confirmed_msg_retries(count))
    }

    pub fn enable_adaptive_datarate(&self) -> Result {
        self.with_lock(|stack| stack.enable_adaptive_datarate(true))
    }

    pub fn disable_adaptive_datarate(&self) -> Result {
        self.with_lock(|stack| stack.enable_adaptive_datarate(false))
    }

    pub fn set_channel_plan(&self, plan: &ChannelPlan) -> Result {
        self.with_lock(|stack| stack.set_channel_plan(plan))
    }

    pub fn get_channel_plan(&self, plan: &mut ChannelPlan) -> Result {
        self.with_lock(|stack| stack.get_channel_plan(plan))
    }

    pub fn remove_channel(&self, id: u8) -> Result {
        self.with_lock(|stack| stack.remove_channel(id))
    }

    pub fn remove_channel_plan(&self) -> Result {
        self.with_lock(|stack| stack.remove_channel_plan())
    }

    pub fn add_link_check_request(&self) -> Result {
        self.with_lock(|stack| stack.add_link_check_request())
    }

    pub fn remove_link_check_request(&self) {
        self.with_lock(|stack| stack.remove_link_check_request())
    }

    pub fn add_device_time_request(&self) -> Result {
        self.with_lock(|stack| stack.add_device_time_request())
    }

    pub fn remove_device_time_request(&self) {
        self.with_lock(|stack| stack.remove_device_time_request())
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn add_ping_slot_info_request(&self, periodicity: u8) -> Result {
        self.with_lock(|stack| stack.add_ping_slot_info_request(periodicity))
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn remove_ping_slot_info_request(&self) {
        self.with_lock(|stack| stack.remove_ping_slot_info_request())
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn enable_beacon_acquisition(&self) -> Result {
        self.with_lock(|stack| stack.enable_beacon_acquisition())
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn get_last_rx_beacon(&self) -> Result<Beacon> {
        self.with_lock(|stack| stack.get_last_rx_beacon())
    }

    pub fn set_device_class(&self, class: DeviceClass) -> Result {
        self.with_lock(|stack| stack.set_device_class(class))
    }

    pub fn get_tx_metadata(&self) -> Result<TxMetadata> {
        self.with_lock(|stack| stack.get_tx_metadata())
    }

    pub fn get_rx_metadata(&self) -> Result<RxMetadata> {
        self.with_lock(|stack| stack.get_rx_metadata())
    }

    pub fn get_backoff_metadata(&self) -> Result<u32> {
        self.with_lock(|stack| stack.get_backoff_metadata())
    }

    pub fn get_current_gps_time(&self) -> u64 {
        self.with_lock(|stack| stack.get_current_gps_time())
    }

    pub fn set_current_gps_time(&self, gps_time_ms: u64) {
        self.with_lock(|stack| stack.set_current_gps_time(gps_time_ms))
    }

    pub fn set_system_time_utc(&self, tai_utc_diff: u32) -> Result {
        self.with_lock(|stack| stack.set_system_time_utc(tai_utc_diff))
    }
}

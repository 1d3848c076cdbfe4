//! Clock and one-shot timer facade.

/// One-shot timers the controller arms. Each may be pending at most once;
/// re-arming replaces the previous deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackTimer {
    /// Retry cadence of a network-forced rejoin.
    ForcedRejoin,
    /// Periodic Type-0 rejoin per the network-provided max time.
    RejoinType0,
}

/// Platform time services.
///
/// Expiry of an armed timer must be delivered back as
/// [`Stack::on_timer`](crate::stack::Stack::on_timer) from event-queue
/// context. Stopping a pending timer cancels its delivery.
pub trait TimerContext {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u32;

    fn start(&mut self, timer: StackTimer, period_ms: u32);
    fn stop(&mut self, timer: StackTimer);

    /// Install the given UTC timestamp as the system wall clock. Hosts
    /// without a settable clock can leave the default no-op.
    fn set_wall_clock(&mut self, unix_seconds: u64) {
        let _ = unix_seconds;
    }
}

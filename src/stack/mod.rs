//! The stack controller state machine.
//!
//! Radio events, timer expiries and application requests are serialized into
//! one run-to-completion dispatcher. A transition names the target state and
//! runs that state's handler; handlers may transition further, always on the
//! event-queue thread.
//!
//! ```text
//! O
//! │ initialize
//! ▼            connect                   join(otaa)
//! Idle ───────────────────► Connecting ─────────────► Joining
//!  ▲                           │ join(abp)               │ TX done
//!  │                           ▼                         ▼
//!  │◄──────[Connected]◄── (synchronous)        AwaitingJoinAccept
//!  │                                             │ JoinAccept OK: [Connected]
//!  │ send                                        │ RX2 timeout: retry / JoinFailure
//!  ├─────► [Scheduling] ──► Sending ──────────┐
//!  │                          │ TX done        │ TX done (confirmed)
//!  │                          ▼                ▼
//!  │                       Receiving ◄──── AwaitingAck
//!  │                          │ window closed / data handled
//!  │                          ▼
//!  └────────────────── [StatusCheck] ──► Idle (Class C: Receiving)
//! ```
//!
//! Bracketed names are transition targets that never rest as the stored
//! state.

use heapless::Deque;
use rand_core::RngCore;

use crate::event::{AppCallbacks, Event};
#[cfg(feature = "class-b")]
use crate::mac::{Beacon, BeaconStatus};
use crate::mac::{
    ChannelPlan, DeviceClass, EventStatus, MacLayer, MacNotifier, McpsType, MlmeConfirm,
    MlmeIndicationKind, RejoinType, RxSlot, ServerType,
};
use crate::session::{JoinMode, Session};
use crate::timer::{StackTimer, TimerContext};
use crate::{Config, ConnectStatus, Error, MsgFlags, Result};

mod flags;
mod metadata;
mod rx;
mod sticky;


pub use metadata::{RxMetadata, TxMetadata};

use flags::ControlFlags;
use metadata::MetadataSlot;
use rx::RxMessage;
use sticky::{StickyCommand, StickyCommands};

const COMPLIANCE_TESTING_PORT: u8 = 224;
const MAX_CONFIRMED_MSG_RETRIES: u8 = 255;
const INVALID_PORT: u8 = 0xff;
const DEFAULT_QOS: u8 = 1;
/// Seconds between the Unix epoch and the GPS epoch (1980-01-06).
const UNIX_GPS_EPOCH_DIFF: u64 = 315_964_800;
/// TAI has led GPS time by a constant 19 s since the GPS epoch.
const TAI_GPS_OFFSET: i64 = 19;

/// Device protocol state. Exactly one is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    NotInitialized,
    Idle,
    Connecting,
    Joining,
    AwaitingJoinAccept,
    Sending,
    AwaitingAck,
    Receiving,
    StatusCheck,
    Shutdown,
}

/// Targets accepted by the transition dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Idle,
    Connecting,
    Joining,
    Connected,
    Scheduling,
    StatusCheck,
    Shutdown,
}

/// Work an event handler defers to the next queue turn instead of recursing.
#[derive(Debug, Clone, Copy)]
enum Work {
    Schedule,
    AutomaticUplink { port: u8 },
    Rejoin { rejoin_type: RejoinType, forced: bool },
    RejoinType0,
}

/// Control-plane results collected while the MAC parses a downlink.
#[derive(Default)]
struct Signals {
    confirms: heapless::Vec<MlmeConfirm, 4>,
    device_time_ms: Option<u64>,
}

impl MacNotifier for Signals {
    fn mlme_confirm(&mut self, confirm: MlmeConfirm) {
        if self.confirms.push(confirm).is_err() {
            error!("MLME confirm dropped");
        }
    }

    fn device_time_answer(&mut self, gps_time_ms: u64) {
        self.device_time_ms = Some(gps_time_ms);
    }
}

#[derive(Debug)]
struct ForcedRejoin {
    datarate: u8,
    period_ms: u32,
    retry_count: u8,
    rejoin_type: RejoinType,
    counter: u8,
}

impl ForcedRejoin {
    fn new() -> ForcedRejoin {
        ForcedRejoin {
            datarate: 0,
            period_ms: 0,
            retry_count: 0,
            rejoin_type: RejoinType::Type0,
            counter: 0,
        }
    }
}

/// The LoRaWAN end-device stack controller.
///
/// Owns the lower MAC (`M`), the platform time services (`T`), an entropy
/// source (`G`) and the application callbacks (`A`). One instance per
/// device; construction is the only way to obtain it.
///
/// The `on_*` methods are event-queue entry points: the radio dispatch
/// ([`crate::radio::RadioEvents::dispatch`]), timer expiries and the MAC
/// integration feed them from the single worker context. Everything else is
/// application API, normally reached through [`crate::Interface`].
pub struct Stack<M, T, G, A = ()>
where
    M: MacLayer,
    T: TimerContext,
    G: RngCore,
    A: AppCallbacks,
{
    mac: M,
    timer: T,
    rng: G,
    callbacks: Option<A>,
    config: Config,

    state: DeviceState,
    flags: ControlFlags,
    session: Session,
    sticky: StickyCommands,
    rx_msg: RxMessage,
    tx_metadata: MetadataSlot<TxMetadata>,
    rx_metadata: MetadataSlot<RxMetadata>,
    work: Deque<Work, 8>,
    signals: Signals,

    app_port: u8,
    num_retry: u8,
    qos_cnt: u8,
    automatic_uplink_ongoing: bool,
    tx_timestamp: u32,

    gps_time_base_ms: u64,
    gps_time_stamp: u32,

    rejoin_type1_stamp_s: u32,
    rejoin_type0_counter: u32,
    forced: ForcedRejoin,

    #[cfg(feature = "class-b")]
    last_beacon_rx_ms: u32,
}

impl<M, T, G, A> Stack<M, T, G, A>
where
    M: MacLayer,
    T: TimerContext,
    G: RngCore,
    A: AppCallbacks,
{
    pub fn new(mac: M, timer: T, rng: G, config: Config) -> Stack<M, T, G, A> {
        let app_port = if is_port_valid(config.default_app_port, false) {
            config.default_app_port
        } else {
            error!("configured default port is illegal");
            INVALID_PORT
        };
        let num_retry = config.confirmed_msg_retries;
        Stack {
            mac,
            timer,
            rng,
            callbacks: None,
            config,
            state: DeviceState::NotInitialized,
            flags: ControlFlags::none(),
            session: Session::default(),
            sticky: StickyCommands::new(),
            rx_msg: RxMessage::new(),
            tx_metadata: MetadataSlot::new(),
            rx_metadata: MetadataSlot::new(),
            work: Deque::new(),
            signals: Signals::default(),
            app_port,
            num_retry,
            qos_cnt: 1,
            automatic_uplink_ongoing: false,
            tx_timestamp: 0,
            gps_time_base_ms: 0,
            gps_time_stamp: 0,
            rejoin_type1_stamp_s: 0,
            rejoin_type0_counter: 0,
            forced: ForcedRejoin::new(),
            #[cfg(feature = "class-b")]
            last_beacon_rx_ms: 0,
        }
    }

    /// Bring up the lower MAC and move to `Idle`.
    pub fn initialize(&mut self) -> Result {
        debug!("initializing MAC layer");
        self.state_controller(Transition::Idle)
    }

    /// Register the application callback sinks.
    pub fn add_app_callbacks(&mut self, callbacks: A) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.callbacks = Some(callbacks);
        Ok(())
    }

    /// Connect using the activation mode and credentials provisioned at
    /// build time.
    pub fn connect(&mut self) -> Result<ConnectStatus> {
        self.check_can_connect()?;
        let is_otaa = self.config.over_the_air_activation;
        self.mac.prepare_join(None, is_otaa)?;
        self.handle_connect(is_otaa)
    }

    /// Connect using caller-supplied activation parameters.
    pub fn connect_with(&mut self, join: &JoinMode) -> Result<ConnectStatus> {
        self.check_can_connect()?;
        let is_otaa = join.is_otaa();
        self.mac.prepare_join(Some(join), is_otaa)?;
        self.handle_connect(is_otaa)
    }

    /// Shut the protocol down. Emits [`Event::Disconnected`]; in-memory ABP
    /// frame counters survive for a later reconnect.
    pub fn disconnect(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.state_controller(Transition::Shutdown)
    }

    /// Schedule an uplink. Returns the number of payload bytes accepted;
    /// the application re-sends any surplus.
    pub fn send(&mut self, port: u8, data: &[u8], flags: MsgFlags) -> Result<usize> {
        self.handle_tx(port, data, flags, false, false)
    }

    /// Read the pending downlink, verifying it was received on `port` with a
    /// delivery type in `flags`.
    pub fn receive(&mut self, port: u8, data: &mut [u8], flags: MsgFlags) -> Result<usize> {
        self.check_can_receive()?;
        self.rx_msg.read(data, Some((port, flags))).map(|(n, _, _)| n)
    }

    /// Read the pending downlink regardless of port, returning
    /// `(bytes, port, flags)`.
    pub fn receive_any(&mut self, data: &mut [u8]) -> Result<(usize, u8, MsgFlags)> {
        self.check_can_receive()?;
        self.rx_msg.read(data, None)
    }

    /// Abort an uplink whose duty-cycle backoff has not elapsed yet.
    /// A cancelled confirmed uplink is not retried.
    pub fn cancel_sending(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.clear_tx_pipe()?;
        self.flags.clear(flags::TX_DONE);
        self.mac.set_tx_ongoing(false);
        self.state = DeviceState::Idle;
        Ok(())
    }

    pub fn set_datarate(&mut self, data_rate: u8) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.set_channel_data_rate(data_rate)
    }

    pub fn set_confirmed_msg_retries(&mut self, count: u8) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if count >= MAX_CONFIRMED_MSG_RETRIES {
            return Err(Error::ParameterInvalid);
        }
        self.num_retry = count;
        Ok(())
    }

    pub fn enable_adaptive_datarate(&mut self, enable: bool) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.enable_adaptive_datarate(enable);
        Ok(())
    }

    pub fn set_channel_plan(&mut self, plan: &ChannelPlan) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.add_channel_plan(plan)
    }

    pub fn get_channel_plan(&self, plan: &mut ChannelPlan) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.get_channel_plan(plan)
    }

    pub fn remove_channel(&mut self, id: u8) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.remove_single_channel(id)
    }

    pub fn remove_channel_plan(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.remove_channel_plan()
    }

    /// Piggyback a `LinkCheckReq` on every uplink until removed. Requires a
    /// registered link-check response sink.
    pub fn add_link_check_request(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if !self.callbacks.as_ref().is_some_and(|c| c.handles_link_check()) {
            error!("link check requires a response callback");
            return Err(Error::ParameterInvalid);
        }
        self.sticky.insert(StickyCommand::LinkCheck);
        Ok(())
    }

    pub fn remove_link_check_request(&mut self) {
        self.sticky.remove(StickyCommand::LinkCheck);
    }

    /// Piggyback a `DeviceTimeReq` on every uplink until removed or
    /// answered.
    pub fn add_device_time_request(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if !self.mac.nwk_joined() {
            return Err(Error::NoNetworkJoined);
        }
        self.sticky.insert(StickyCommand::DeviceTime);
        Ok(())
    }

    pub fn remove_device_time_request(&mut self) {
        self.sticky.remove(StickyCommand::DeviceTime);
    }

    /// Piggyback a `PingSlotInfoReq` announcing `periodicity` until the
    /// network confirms. Only meaningful while the device is in Class A.
    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn add_ping_slot_info_request(&mut self, periodicity: u8) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if periodicity > 7 {
            return Err(Error::ParameterInvalid);
        }
        if self.mac.get_device_class() != DeviceClass::A {
            return Err(Error::NoOp);
        }
        self.mac.set_ping_slot_info(periodicity)?;
        self.sticky.insert(StickyCommand::PingSlot);
        Ok(())
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn remove_ping_slot_info_request(&mut self) {
        self.sticky.remove(StickyCommand::PingSlot);
    }

    /// Switch the device class.
    ///
    /// Towards a LoRaWAN 1.1 server the switch is announced with a
    /// `DeviceModeInd` and becomes effective once the carrying uplink went
    /// out; the server's verdict arrives as
    /// [`Event::ServerAcceptedClassInUse`] or
    /// [`Event::ServerDoesNotSupportClassInUse`]. Class B additionally needs
    /// a prior beacon lock.
    pub fn set_device_class(&mut self, class: DeviceClass) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if class == DeviceClass::B && !cfg!(feature = "class-b") {
            return Err(Error::Unsupported);
        }
        if self.mac.get_device_class() == class {
            return Ok(());
        }
        if self.mac.get_server_type() == ServerType::Lorawan1_1 && class != DeviceClass::B {
            self.sticky.pending_class = class;
            self.sticky.insert(StickyCommand::DeviceMode);
            self.sticky.device_mode_tx_pending = true;
            Ok(())
        } else {
            self.mac.set_device_class(class)
        }
    }

    /// Snapshot of the last transmission. Read-once.
    pub fn get_tx_metadata(&mut self) -> Result<TxMetadata> {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.tx_metadata.acquire().ok_or(Error::MetadataNotAvailable)
    }

    /// Snapshot of the last reception. Read-once.
    pub fn get_rx_metadata(&mut self) -> Result<RxMetadata> {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.rx_metadata.acquire().ok_or(Error::MetadataNotAvailable)
    }

    /// Remaining duty-cycle backoff before the pending transmission.
    pub fn get_backoff_metadata(&mut self) -> Result<u32> {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.backoff_time_left_ms().ok_or(Error::MetadataNotAvailable)
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn enable_beacon_acquisition(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.enable_beacon_acquisition()
    }

    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn get_last_rx_beacon(&self) -> Result<Beacon> {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        self.mac.get_last_rx_beacon().copied()
    }

    /// Device-to-network time base: stored GPS time advanced by the ticks
    /// elapsed since it was stored. Zero while unset.
    pub fn get_current_gps_time(&self) -> u64 {
        if self.gps_time_base_ms == 0 {
            0
        } else {
            self.gps_time_base_ms + self.timer.now_ms().wrapping_sub(self.gps_time_stamp) as u64
        }
    }

    /// Store the network-provided GPS time (milliseconds), unadjusted for
    /// leap seconds, together with the current tick.
    pub fn set_current_gps_time(&mut self, gps_time_ms: u64) {
        self.gps_time_base_ms = gps_time_ms;
        self.gps_time_stamp = self.timer.now_ms();
    }

    /// Derive UTC from the GPS time base and hand it to the platform wall
    /// clock. `tai_utc_diff` is the current TAI−UTC offset in seconds.
    pub fn set_system_time_utc(&mut self, tai_utc_diff: u32) -> Result {
        let gps_ms = self.get_current_gps_time();
        if gps_ms == 0 {
            // GPS time unknown; the application needs to request a clock sync
            return Err(Error::ServiceUnknown);
        }
        let mut gps_seconds = gps_ms / 1000;
        if gps_ms % 1000 >= 500 {
            gps_seconds += 1;
        }
        let unix_seconds =
            gps_seconds as i64 + UNIX_GPS_EPOCH_DIFF as i64 + (tai_utc_diff as i64 - TAI_GPS_OFFSET);
        self.timer.set_wall_clock(unix_seconds as u64);
        info!("system clock set from GPS time");
        Ok(())
    }

    pub fn device_state(&self) -> DeviceState {
        self.state
    }

    /// Application port of the last validated uplink.
    pub fn app_port(&self) -> u8 {
        self.app_port
    }

    pub fn device_class(&self) -> DeviceClass {
        self.mac.get_device_class()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Battery level for `DevStatusAns`, as reported by the application.
    pub fn battery_level(&self) -> u8 {
        self.callbacks.as_ref().map_or(255, |c| c.battery_level())
    }

    pub fn mac(&self) -> &M {
        &self.mac
    }

    pub fn mac_mut(&mut self) -> &mut M {
        &mut self.mac
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    // ----- event-queue entry points --------------------------------------

    /// The radio finished transmitting.
    pub fn on_tx_done(&mut self, timestamp_ms: u32) {
        debug!("transmission completed");
        self.tx_timestamp = timestamp_ms;
        self.make_tx_metadata_available();

        if self.state == DeviceState::Joining {
            self.state = DeviceState::AwaitingJoinAccept;
        }
        if self.state == DeviceState::Sending
            && self.mac.get_mcps_confirmation().req_type == McpsType::Confirmed
        {
            debug!("awaiting ACK");
            self.state = DeviceState::AwaitingAck;
        }

        self.mac.on_radio_tx_done(timestamp_ms);

        if self.mac.get_server_type() == ServerType::Lorawan1_1
            && self.sticky.device_mode_tx_pending
        {
            self.sticky.device_mode_tx_pending = false;
            let _ = self.mac.set_device_class(self.sticky.pending_class);
            self.send_event(Event::ClassChanged);
        }
        self.drain_deferred_work();
    }

    /// The radio failed to transmit.
    pub fn on_tx_timeout(&mut self) {
        self.mac.on_radio_tx_timeout();
        self.flags.clear(flags::TX_DONE);
        if self.state == DeviceState::Joining {
            self.state = DeviceState::Idle;
            error!("joining abandoned: radio failed to transmit");
            self.send_event(Event::TxTimeout);
        } else {
            self.enter_status_check();
        }
        self.run_to_completion();
        self.drain_deferred_work();
    }

    /// A PHY payload was received. `payload` is the interrupt-captured copy.
    pub fn on_rx_done(&mut self, payload: &[u8], rssi: i16, snr: i8, timestamp_ms: u32) {
        self.state = DeviceState::Receiving;
        self.flags.clear(flags::MSG_RECEIVED);
        self.flags.clear(flags::TX_DONE);
        self.flags.clear(flags::RETRY_EXHAUSTED);
        self.rejoin_type0_counter += 1;

        let joined = self.mac.nwk_joined();
        let rx_slot = self.mac.get_current_slot();

        self.mac.on_radio_rx_done(payload, rssi, snr, timestamp_ms, &mut self.signals);
        self.drain_mac_signals();

        if !joined {
            self.drain_deferred_work();
            return;
        }
        if self.flags.contains(flags::REJOIN_IN_PROGRESS) {
            self.flags.clear(flags::REJOIN_IN_PROGRESS);
            self.run_to_completion();
            self.drain_deferred_work();
            return;
        }

        self.make_rx_metadata_available();

        match rx_slot {
            // the Class C continuous slot completes a pending uplink cycle
            // the same way the two Class A windows do
            RxSlot::Window1 | RxSlot::Window2 | RxSlot::ClassC => {
                let cycle_complete = self.post_process_tx_with_reception();

                if self.mac.get_mcps_indication().pending {
                    self.mac.post_process_mcps_ind();
                    self.flags.set(flags::MSG_RECEIVED);
                    self.enter_status_check();
                }

                if cycle_complete {
                    self.run_to_completion();
                }

                // suppress a new automatic uplink while one awaits its ACK
                if self.mac.get_mlme_indication().pending && !self.automatic_uplink_ongoing {
                    debug!("MLME indication pending");
                    self.mac.post_process_mlme_ind();
                    self.handle_mlme_indication();
                }

                if self.config.version.is_v1_1() {
                    self.poll_rejoin();
                }
            }
            RxSlot::Beacon => {}
            RxSlot::UnicastPingSlot | RxSlot::MulticastPingSlot => {
                self.flags.set(flags::MSG_RECEIVED);
                self.enter_status_check();
                self.run_to_completion();
            }
        }
        self.drain_deferred_work();
    }

    /// A receive window elapsed without a frame.
    pub fn on_rx_timeout(&mut self) {
        self.process_reception_timeout(true);
    }

    /// A frame was received but dropped for a CRC error. Handled exactly
    /// like an empty window.
    pub fn on_rx_error(&mut self) {
        self.process_reception_timeout(false);
    }

    /// An armed one-shot timer fired.
    pub fn on_timer(&mut self, timer: StackTimer) {
        match timer {
            StackTimer::ForcedRejoin => self.forced_timer_expiry(),
            StackTimer::RejoinType0 => self.process_rejoin_type0(),
        }
        self.drain_deferred_work();
    }

    /// The MAC could not place a deferred transmission on any channel.
    pub fn on_scheduling_failure(&mut self) {
        error!("failed to schedule transmission");
        let _ = self.state_controller(Transition::StatusCheck);
        self.run_to_completion();
        self.drain_deferred_work();
    }

    /// Beacon tracking update from the MAC.
    #[cfg(feature = "class-b")]
    #[cfg_attr(docsrs, doc(cfg(feature = "class-b")))]
    pub fn on_beacon_event(&mut self, status: BeaconStatus, beacon: Option<&Beacon>) {
        // frame contents stay queryable through get_last_rx_beacon
        let _ = beacon;
        match status {
            BeaconStatus::AcquisitionFailed => {
                self.handle_mlme_confirm(MlmeConfirm::BeaconAcquisition {
                    status: EventStatus::BeaconNotFound,
                });
            }
            BeaconStatus::AcquisitionSuccess => {
                self.last_beacon_rx_ms = self.timer.now_ms();
                self.handle_mlme_confirm(MlmeConfirm::BeaconAcquisition {
                    status: EventStatus::Ok,
                });
            }
            BeaconStatus::Lock => {
                self.last_beacon_rx_ms = self.timer.now_ms();
                self.send_event(Event::BeaconLock);
            }
            BeaconStatus::Miss => {
                self.send_event(Event::BeaconMiss);
                // beacon-less operation window elapsed: back to Class A
                if self.mac.get_device_class() == DeviceClass::B {
                    let beaconless = self.timer.now_ms().wrapping_sub(self.last_beacon_rx_ms);
                    if beaconless >= self.config.beaconless_period_ms {
                        let _ = self.mac.set_device_class(DeviceClass::A);
                        self.send_event(Event::SwitchClassBToA);
                    }
                }
            }
        }
        self.drain_deferred_work();
    }

    // ----- transition dispatcher -----------------------------------------

    fn state_controller(&mut self, target: Transition) -> Result {
        match target {
            Transition::Idle => self.enter_idle(),
            Transition::Connecting => self.enter_connecting(),
            Transition::Joining => self.enter_joining(),
            Transition::Connected => {
                self.enter_connected();
                Ok(())
            }
            Transition::Scheduling => self.enter_scheduling(),
            Transition::StatusCheck => {
                self.enter_status_check();
                Ok(())
            }
            Transition::Shutdown => self.enter_shutdown(),
        }
    }

    fn enter_idle(&mut self) -> Result {
        if self.state == DeviceState::NotInitialized {
            self.mac.initialize()?;
            if self.config.version.is_v1_1() {
                self.rejoin_type1_stamp_s = self.timer.now_ms() / 1000;
            }
        }
        self.state = DeviceState::Idle;
        Ok(())
    }

    fn enter_connecting(&mut self) -> Result {
        debug_assert!(matches!(
            self.state,
            DeviceState::Idle | DeviceState::Shutdown
        ));
        self.state = DeviceState::Connecting;

        if self.flags.contains(flags::USING_OTAA) {
            return self.enter_joining();
        }
        self.mac.join(false)?;
        debug!("ABP connection OK");
        self.enter_connected();
        Ok(())
    }

    fn enter_joining(&mut self) -> Result {
        if self.state == DeviceState::Connecting {
            self.state = DeviceState::Joining;
            debug!("sending join request");
            return self.mac.join(true);
        }

        if self.state == DeviceState::AwaitingJoinAccept
            && self.mac.get_current_slot() != RxSlot::Window1
        {
            self.state = DeviceState::Joining;
            if !self.mac.continue_joining_process() {
                self.flags.clear(flags::CONNECT_IN_PROGRESS);
                self.send_event(Event::JoinFailure);
                self.state = DeviceState::Idle;
            }
        }
        Ok(())
    }

    fn enter_connected(&mut self) {
        self.flags.set(flags::CONNECTED);
        self.flags.clear(flags::CONNECT_IN_PROGRESS);
        if self.flags.contains(flags::USING_OTAA) {
            debug!("OTAA connection OK");
        }
        self.session.active = true;
        self.send_event(Event::Connected);
        self.state = DeviceState::Idle;
    }

    fn enter_scheduling(&mut self) -> Result {
        let class_c_receiving = self.state == DeviceState::Receiving
            && self.mac.get_device_class() == DeviceClass::C;
        if self.state != DeviceState::Idle && !class_c_receiving {
            return Err(Error::Busy);
        }

        self.mac.send_ongoing_tx()?;
        self.flags.clear(flags::TX_DONE);
        self.mac.set_tx_ongoing(true);
        self.state = DeviceState::Sending;
        Ok(())
    }

    fn enter_status_check(&mut self) {
        if self.state == DeviceState::Sending || self.state == DeviceState::AwaitingAck {
            // reached after the RX windows are exhausted, after a confirmed
            // uplink ran out of retries, or on a scheduling failure
            self.flags.clear(flags::TX_DONE);
            self.mac.set_tx_ongoing(false);
            self.mac.reset_ongoing_tx();
            self.handle_mcps_confirm();
        } else if self.state == DeviceState::Receiving {
            if self.flags.contains(flags::TX_DONE) || self.flags.contains(flags::RETRY_EXHAUSTED) {
                self.flags.clear(flags::TX_DONE);
                self.flags.clear(flags::RETRY_EXHAUSTED);
                self.mac.set_tx_ongoing(false);
                self.mac.reset_ongoing_tx();
                // a completed automatic uplink is invisible to the application
                if self.automatic_uplink_ongoing {
                    self.automatic_uplink_ongoing = false;
                } else {
                    self.handle_mcps_confirm();
                }
            }
            if self.flags.contains(flags::MSG_RECEIVED) {
                self.flags.clear(flags::MSG_RECEIVED);
                self.handle_mcps_indication();
            }
        }
    }

    fn enter_shutdown(&mut self) -> Result {
        let _ = self.mac.remove_channel_plan();
        self.mac.disconnect();
        self.session.active = false;
        self.state = DeviceState::Shutdown;
        self.flags.clear_all();
        self.send_event(Event::Disconnected);
        Ok(())
    }

    // ----- uplink path ----------------------------------------------------

    fn check_can_connect(&self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if self.flags.contains(flags::CONNECT_IN_PROGRESS) {
            return Err(Error::Busy);
        }
        if self.flags.contains(flags::CONNECTED) {
            return Err(Error::AlreadyConnected);
        }
        Ok(())
    }

    fn handle_connect(&mut self, is_otaa: bool) -> Result<ConnectStatus> {
        self.flags.set(flags::CONNECT_IN_PROGRESS);

        if is_otaa {
            debug!("initiating OTAA");
            // fresh counters for every new over-the-air session
            self.session.reset_counters();
            self.flags.set(flags::USING_OTAA);
        } else {
            if self.config.version.is_v1_1() {
                // ABP devices must repeat ResetInd until ResetConf arrives
                self.sticky.insert(StickyCommand::Reset);
            }
            debug!(
                "initiating ABP, FCntUp={}, FCntDown={}",
                self.session.uplink_counter,
                self.session.downlink_counter
            );
            self.flags.clear(flags::USING_OTAA);
        }

        self.state_controller(Transition::Connecting)?;
        if is_otaa {
            Ok(ConnectStatus::ConnectInProgress)
        } else {
            Ok(ConnectStatus::Connected)
        }
    }

    fn check_can_receive(&self) -> Result {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if !self.session.active {
            return Err(Error::NoActiveSessions);
        }
        Ok(())
    }

    fn handle_tx(
        &mut self,
        port: u8,
        data: &[u8],
        flags_word: MsgFlags,
        null_allowed: bool,
        allow_port_0: bool,
    ) -> Result<usize> {
        if self.state == DeviceState::NotInitialized {
            return Err(Error::NotInitialized);
        }
        if !null_allowed && data.is_empty() {
            return Err(Error::ParameterInvalid);
        }
        if self.flags.contains(flags::REJOIN_IN_PROGRESS) {
            return Err(Error::Busy);
        }

        if self.sticky.contains(StickyCommand::Reset) {
            self.mac.setup_reset_indication();
        } else if self.sticky.contains(StickyCommand::Rekey) {
            if self.sticky.rekey_counter < self.mac.get_current_adr_ack_limit() {
                self.mac.setup_rekey_indication();
                self.sticky.rekey_counter += 1;
            } else {
                self.sticky.remove(StickyCommand::Rekey);
                self.send_event(Event::JoinFailure);
                self.state = DeviceState::Idle;
            }
        }
        if self.sticky.contains(StickyCommand::DeviceMode) {
            self.mac.setup_device_mode_indication(self.sticky.pending_class);
        }

        if !self.session.active {
            return Err(Error::NoActiveSessions);
        }
        if self.mac.tx_ongoing() {
            return Err(Error::WouldBlock);
        }

        if self.sticky.contains(StickyCommand::LinkCheck) {
            self.mac.setup_link_check_request();
        }
        if self.sticky.contains(StickyCommand::DeviceTime) {
            let _ = self.mac.setup_device_time_request();
        }
        #[cfg(feature = "class-b")]
        if self.sticky.contains(StickyCommand::PingSlot) {
            self.mac.add_ping_slot_info_req();
        }

        self.qos_cnt = 1;

        if !self.mac.nwk_joined() {
            return Err(Error::NoNetworkJoined);
        }

        self.set_application_port(port, allow_port_0)?;

        if !flags_word.is_valid_for_uplink() {
            error!("invalid send flags");
            return Err(Error::ParameterInvalid);
        }

        let len = self.mac.prepare_ongoing_tx(port, data, flags_word, self.num_retry);
        self.state_controller(Transition::Scheduling)?;
        Ok(len)
    }

    fn set_application_port(&mut self, port: u8, allow_port_0: bool) -> Result {
        if is_port_valid(port, allow_port_0) {
            self.app_port = port;
            Ok(())
        } else {
            error!("illegal application port");
            Err(Error::PortInvalid)
        }
    }

    fn send_automatic_uplink(&mut self, port: u8) {
        // confirmed so that a lost acknowledgement uplink gets retried
        match self.handle_tx(port, &[], MsgFlags::CONFIRMED, true, true) {
            Err(Error::WouldBlock) => self.automatic_uplink_ongoing = false,
            Err(_) => {
                debug!("failed to generate automatic uplink");
                self.send_event(Event::AutomaticUplinkError);
            }
            Ok(_) => {}
        }
    }

    // ----- downlink path --------------------------------------------------

    fn process_reception_timeout(&mut self, is_timeout: bool) {
        self.rejoin_type0_counter += 1;

        let rx_slot = self.mac.get_current_slot();
        self.mac.on_radio_rx_timeout(is_timeout);

        if rx_slot == RxSlot::Window2 && !self.mac.nwk_joined() {
            let _ = self.state_controller(Transition::Joining);
            self.drain_deferred_work();
            return;
        }

        // An empty RX2 terminates the uplink cycle: an unconfirmed uplink is
        // complete, a confirmed one retries or exhausts. Class C never gets
        // here since its RX2 window does not time out.
        if rx_slot == RxSlot::Window2 {
            self.post_process_tx_no_reception();

            if self.config.version.is_v1_1() {
                self.poll_rejoin();
            }
        }
        self.drain_deferred_work();
    }

    /// Class C only: the ACK wait for a confirmed uplink elapsed with no
    /// reception. Drives retry or exhaustion the way an empty RX2 does for
    /// Class A.
    pub fn on_ack_timeout(&mut self) {
        self.post_process_tx_no_reception();
        self.drain_deferred_work();
    }

    /// Returns true when the uplink cycle is over and the machine may run to
    /// completion.
    fn post_process_tx_with_reception(&mut self) -> bool {
        if self.mac.get_mcps_confirmation().req_type == McpsType::Confirmed {
            if self.mac.get_mcps_indication().is_ack_recvd {
                debug!("ACK received, NbTrials={}", self.mac.get_mcps_confirmation().nb_retries);
                self.flags.set(flags::TX_DONE);
                self.flags.clear(flags::RETRY_EXHAUSTED);
                self.mac.post_process_mcps_req();
                self.make_tx_metadata_available();
                self.enter_status_check();
                true
            } else if self.mac.continue_sending_process() {
                // unacknowledged; the MAC arranged a retransmission
                self.state = DeviceState::Sending;
                false
            } else if self.mac.get_current_slot() != RxSlot::Window1 {
                error!("confirmed uplink retries exhausted");
                self.flags.clear(flags::TX_DONE);
                self.flags.set(flags::RETRY_EXHAUSTED);
                self.mac.post_process_mcps_req();
                self.make_tx_metadata_available();
                self.enter_status_check();
                true
            } else {
                // still ahead of RX2; the exhaustion verdict falls there
                false
            }
        } else {
            // unconfirmed: the RX windows were cut short by a valid frame;
            // apply QoS repetitions requested for this uplink, not the
            // instruction that just arrived in response to it
            let qos = self.mac.get_qos_level();
            if qos > DEFAULT_QOS && self.qos_cnt < qos && self.mac.get_prev_qos_level() == qos {
                self.flags.clear(flags::TX_DONE);
                self.defer(Work::Schedule);
                self.qos_cnt += 1;
                info!("QoS repetition {} queued", self.qos_cnt);
                // rest before the deferred repetition is scheduled
                self.run_to_completion();
                false
            } else {
                self.mac.post_process_mcps_req();
                self.flags.set(flags::TX_DONE);
                self.make_tx_metadata_available();
                self.enter_status_check();
                true
            }
        }
    }

    fn post_process_tx_no_reception(&mut self) {
        if self.flags.contains(flags::REJOIN_IN_PROGRESS) {
            self.flags.clear(flags::REJOIN_IN_PROGRESS);
            self.run_to_completion();
            return;
        }

        if self.mac.get_mcps_confirmation().req_type == McpsType::Confirmed {
            if self.mac.continue_sending_process() {
                // the MAC arranges the next retry after its backoff
                self.flags.clear(flags::TX_DONE);
                self.flags.clear(flags::RETRY_EXHAUSTED);
                self.state = DeviceState::Sending;
                return;
            }
            error!("confirmed uplink retries exhausted");
            self.flags.clear(flags::TX_DONE);
            self.flags.set(flags::RETRY_EXHAUSTED);
        } else {
            self.flags.set(flags::TX_DONE);

            let qos = self.mac.get_qos_level();
            if qos > DEFAULT_QOS && self.mac.get_prev_qos_level() == qos && self.qos_cnt < qos {
                self.defer(Work::Schedule);
                self.qos_cnt += 1;
                info!("QoS repetition {} queued", self.qos_cnt);
                self.run_to_completion();
                return;
            }
        }

        self.mac.post_process_mcps_req();
        self.make_tx_metadata_available();
        self.enter_status_check();
        self.run_to_completion();
    }

    fn handle_mcps_confirm(&mut self) {
        match self.mac.get_mcps_confirmation().status {
            EventStatus::Ok => {
                self.session.uplink_counter = self.mac.get_mcps_confirmation().ul_frame_counter;
                self.send_event(Event::TxDone);
            }
            EventStatus::TxTimeout => {
                error!("radio failed to transmit");
                self.send_event(Event::TxTimeout);
            }
            EventStatus::PayloadSizeError => self.send_event(Event::TxSchedulingError),
            EventStatus::CryptoFail => self.send_event(Event::TxCryptoError),
            _ => self.send_event(Event::TxError),
        }
    }

    fn handle_mcps_indication(&mut self) {
        if self.mac.get_mcps_indication().status != EventStatus::Ok {
            error!("reception failed");
            self.send_event(Event::RxError);
            return;
        }

        self.session.downlink_counter = self.mac.get_mcps_indication().dl_frame_counter;

        let port = self.mac.get_mcps_indication().port;
        if port == COMPLIANCE_TESTING_PORT && !cfg!(feature = "compliance-test") {
            return;
        }

        if self.mac.get_mcps_indication().is_data_recvd {
            self.rx_msg.load(self.mac.get_mcps_indication());
            debug!("packet received on port {}", port);
            self.send_event(Event::RxDone);
        }

        // The network either flagged more pending data (Class A/B) or sent a
        // confirmed Class C downlink that must be acknowledged before new
        // confirmed traffic. Both want an uplink now.
        let class_c = self.mac.get_device_class() == DeviceClass::C;
        let wants_uplink = (!class_c && self.mac.get_mcps_indication().fpending)
            || (class_c && self.mac.get_mcps_indication().msg_type == McpsType::Confirmed);
        if wants_uplink {
            #[cfg(feature = "automatic-uplink")]
            if !self.automatic_uplink_ongoing {
                debug!("queueing empty uplink");
                self.automatic_uplink_ongoing = true;
                self.defer(Work::AutomaticUplink { port });
            }
            #[cfg(not(feature = "automatic-uplink"))]
            self.send_event(Event::UplinkRequired);
        }
    }

    fn handle_mlme_indication(&mut self) {
        if self.mac.get_mlme_indication().kind == MlmeIndicationKind::ScheduleUplink {
            debug!("immediate uplink requested");
            #[cfg(feature = "automatic-uplink")]
            {
                self.automatic_uplink_ongoing = true;
                self.defer(Work::AutomaticUplink { port: 0 });
            }
            #[cfg(not(feature = "automatic-uplink"))]
            self.send_event(Event::UplinkRequired);
            return;
        }
        error!("unknown MLME indication");
    }

    fn drain_mac_signals(&mut self) {
        let signals = core::mem::take(&mut self.signals);
        for confirm in signals.confirms {
            self.handle_mlme_confirm(confirm);
        }
        if let Some(gps_time_ms) = signals.device_time_ms {
            self.handle_device_time_answer(gps_time_ms);
        }
    }

    fn handle_mlme_confirm(&mut self, confirm: MlmeConfirm) {
        match confirm {
            MlmeConfirm::LinkCheck { status, demod_margin, gateway_count } => {
                if status == EventStatus::Ok {
                    if let Some(callbacks) = self.callbacks.as_mut() {
                        if callbacks.handles_link_check() {
                            callbacks.on_link_check_response(demod_margin, gateway_count);
                        }
                    }
                }
            }
            MlmeConfirm::Reset => self.sticky.remove(StickyCommand::Reset),
            MlmeConfirm::Rekey => self.sticky.remove(StickyCommand::Rekey),
            MlmeConfirm::DeviceMode { class } => {
                self.sticky.remove(StickyCommand::DeviceMode);
                if self.mac.get_device_class() == class {
                    self.send_event(Event::ServerAcceptedClassInUse);
                } else {
                    self.send_event(Event::ServerDoesNotSupportClassInUse);
                }
            }
            MlmeConfirm::JoinAccept { status } => self.handle_join_accept(status),
            MlmeConfirm::ForceRejoin { rejoin_type, datarate, period, max_retries } => {
                self.handle_forced_rejoin(rejoin_type, datarate, period, max_retries);
            }
            MlmeConfirm::PingSlotInfo => {
                #[cfg(feature = "class-b")]
                if self.sticky.contains(StickyCommand::PingSlot) {
                    self.sticky.remove(StickyCommand::PingSlot);
                    self.send_event(Event::PingSlotInfoSynched);
                }
            }
            MlmeConfirm::BeaconAcquisition { status } => {
                if status == EventStatus::Ok {
                    self.send_event(Event::BeaconFound);
                } else {
                    self.send_event(Event::BeaconNotFound);
                }
            }
        }
    }

    fn handle_join_accept(&mut self, status: EventStatus) {
        match status {
            EventStatus::Ok => {
                if self.mac.get_server_type() == ServerType::Lorawan1_1 {
                    // RekeyInd until RekeyConf; a Type-1 rejoin accept may
                    // come from a different server, so the rejoin timers
                    // must not be reset here
                    self.sticky.insert(StickyCommand::Rekey);
                } else {
                    self.timer.stop(StackTimer::ForcedRejoin);
                    self.timer.stop(StackTimer::RejoinType0);
                }
                let _ = self.state_controller(Transition::Connected);
            }
            EventStatus::CryptoFail => {
                self.state = DeviceState::Idle;
                error!("joining abandoned: crypto failure");
                self.send_event(Event::CryptoError);
            }
            _ => {
                if self.mac.get_server_type() == ServerType::Lorawan1_1
                    && self.flags.contains(flags::REJOIN_IN_PROGRESS)
                {
                    // a failed rejoin neither retries nor notifies
                    return;
                }
                self.state = DeviceState::AwaitingJoinAccept;
                let _ = self.state_controller(Transition::Joining);
            }
        }
    }

    fn handle_device_time_answer(&mut self, gps_time_ms: u64) {
        self.sticky.remove(StickyCommand::DeviceTime);
        // the answer carries the time captured at the end of our uplink
        let uplink_elapsed = self.timer.now_ms().wrapping_sub(self.tx_timestamp);
        self.set_current_gps_time(gps_time_ms + uplink_elapsed as u64);
        self.send_event(Event::DeviceTimeSynched);
    }

    // ----- rejoin (LoRaWAN 1.1) -------------------------------------------

    fn poll_rejoin(&mut self) {
        if self.flags.contains(flags::REJOIN_IN_PROGRESS) {
            return;
        }

        // a due Type-1 request takes precedence over Type 0
        let now_s = self.timer.now_ms() / 1000;
        if now_s.wrapping_sub(self.rejoin_type1_stamp_s) > self.config.rejoin_type1_send_period_s {
            self.flags.set(flags::REJOIN_IN_PROGRESS);
            self.rejoin_type1_stamp_s = now_s;
            self.defer(Work::Rejoin { rejoin_type: RejoinType::Type1, forced: false });
            return;
        }

        let (_, max_count) = self.mac.get_rejoin_parameters();
        if self.rejoin_type0_counter >= max_count {
            self.rejoin_type0_counter = 0;
            self.flags.set(flags::REJOIN_IN_PROGRESS);
            self.defer(Work::RejoinType0);
        }
    }

    fn handle_forced_rejoin(
        &mut self,
        rejoin_type: RejoinType,
        datarate: u8,
        period: u8,
        max_retries: u8,
    ) {
        if self.mac.get_server_type() != ServerType::Lorawan1_1 {
            return;
        }
        self.forced.datarate = datarate;
        let jitter = self.rng.next_u32() % 33;
        self.forced.period_ms = ((1u32 << period) * 32 + jitter) * 1000;
        self.forced.retry_count = max_retries;
        if self.forced.retry_count != 0 {
            self.forced.retry_count += 1;
        }
        // a forced Type 1 selects a Type-0 request (LoRaWAN 1.1, 5.13)
        self.forced.rejoin_type =
            if rejoin_type == RejoinType::Type1 { RejoinType::Type0 } else { rejoin_type };
        self.reset_forced_rejoin();
        self.process_rejoin(self.forced.rejoin_type, true);
        if self.forced.retry_count != 0 {
            self.timer.start(StackTimer::ForcedRejoin, self.forced.period_ms);
        }
    }

    fn forced_timer_expiry(&mut self) {
        if self.mac.get_server_type() != ServerType::Lorawan1_1 {
            return;
        }
        if self.forced.counter < self.forced.retry_count {
            self.forced.counter += 1;
            self.process_rejoin(self.forced.rejoin_type, true);
            self.timer.start(StackTimer::ForcedRejoin, self.forced.period_ms);
        } else {
            self.reset_forced_rejoin();
        }
    }

    fn reset_forced_rejoin(&mut self) {
        self.forced.counter = 0;
        self.timer.stop(StackTimer::ForcedRejoin);
    }

    fn process_rejoin_type0(&mut self) {
        if self.mac.get_server_type() == ServerType::Lorawan1_1 {
            self.process_rejoin(RejoinType::Type0, false);
        }
    }

    fn process_rejoin(&mut self, rejoin_type: RejoinType, is_forced: bool) {
        if self.mac.get_server_type() != ServerType::Lorawan1_1 {
            return;
        }
        self.mac.rejoin(rejoin_type, is_forced, self.forced.datarate);
        if rejoin_type == RejoinType::Type0 {
            self.timer.stop(StackTimer::RejoinType0);
            self.rejoin_type0_counter = 0;
            let (max_time_s, _) = self.mac.get_rejoin_parameters();
            self.timer.start(StackTimer::RejoinType0, max_time_s.saturating_mul(1000));
        }
    }

    // ----- helpers --------------------------------------------------------

    fn run_to_completion(&mut self) {
        if self.mac.get_device_class() == DeviceClass::C {
            self.state = DeviceState::Receiving;
        } else {
            self.state = DeviceState::Idle;
        }
    }

    fn make_tx_metadata_available(&mut self) {
        let confirm = self.mac.get_mcps_confirmation();
        self.tx_metadata.make_available(TxMetadata {
            channel: confirm.channel,
            data_rate: confirm.data_rate,
            tx_power: confirm.tx_power,
            tx_toa_ms: confirm.tx_toa_ms,
            nb_retries: confirm.nb_retries,
        });
    }

    fn make_rx_metadata_available(&mut self) {
        let indication = self.mac.get_mcps_indication();
        self.rx_metadata.make_available(RxMetadata {
            rx_datarate: indication.rx_datarate,
            rssi: indication.rssi,
            snr: indication.snr,
            channel: indication.channel,
            rx_toa_ms: indication.rx_toa_ms,
        });
    }

    fn send_event(&mut self, event: Event) {
        if let Some(callbacks) = self.callbacks.as_mut() {
            callbacks.on_event(event);
        }
    }

    fn defer(&mut self, work: Work) {
        if self.work.push_back(work).is_err() {
            error!("deferred work dropped");
        }
    }

    fn drain_deferred_work(&mut self) {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Schedule => {
                    let _ = self.state_controller(Transition::Scheduling);
                }
                Work::AutomaticUplink { port } => self.send_automatic_uplink(port),
                Work::Rejoin { rejoin_type, forced } => self.process_rejoin(rejoin_type, forced),
                Work::RejoinType0 => self.process_rejoin_type0(),
            }
        }
    }
}

fn is_port_valid(port: u8, allow_port_0: bool) -> bool {
    match port {
        0 => allow_port_0,
        // compliance runs own the test port when compiled in
        COMPLIANCE_TESTING_PORT => cfg!(feature = "compliance-test"),
        225..=255 => false,
        _ => true,
    }
}

//! Contract consumed from the lower MAC sublayer.
//!
//! The controller owns the MAC and drives it exclusively from event-queue
//! context. The MAC in turn owns the radio and the regional duty-cycle
//! accounting; the controller never touches the radio directly. Signals the
//! MAC produces while parsing a downlink travel back through the narrow
//! [`MacNotifier`] trait instead of stored callbacks, so ownership stays
//! one-way.

use heapless::Vec;

use crate::session::JoinMode;
use crate::{MsgFlags, Result};

/// Largest PHY payload a LoRa frame can carry.
pub const MAX_PHY_PAYLOAD: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// Protocol revision the network server committed to during activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServerType {
    Lorawan1_0,
    Lorawan1_1,
}

/// Receive window the radio was listening on when an RX event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxSlot {
    Window1,
    Window2,
    ClassC,
    Beacon,
    UnicastPingSlot,
    MulticastPingSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RejoinType {
    Type0,
    Type1,
    Type2,
}

/// Delivery type of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum McpsType {
    Unconfirmed,
    Confirmed,
    Multicast,
    Proprietary,
}

impl McpsType {
    pub(crate) fn as_msg_flags(self) -> MsgFlags {
        match self {
            McpsType::Unconfirmed => MsgFlags::UNCONFIRMED,
            McpsType::Confirmed => MsgFlags::CONFIRMED,
            McpsType::Multicast => MsgFlags::MULTICAST,
            McpsType::Proprietary => MsgFlags::PROPRIETARY,
        }
    }
}

/// Outcome attached to MAC confirmations and indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventStatus {
    Ok,
    Error,
    TxTimeout,
    CryptoFail,
    PayloadSizeError,
    BeaconNotFound,
}

/// Data-plane confirmation for the most recent uplink request.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct McpsConfirm {
    pub req_type: McpsType,
    pub status: EventStatus,
    pub nb_retries: u8,
    pub tx_toa_ms: u32,
    pub ul_frame_counter: u32,
    pub channel: u8,
    pub data_rate: u8,
    pub tx_power: i8,
}

impl Default for McpsConfirm {
    fn default() -> McpsConfirm {
        McpsConfirm {
            req_type: McpsType::Unconfirmed,
            status: EventStatus::Ok,
            nb_retries: 0,
            tx_toa_ms: 0,
            ul_frame_counter: 0,
            channel: 0,
            data_rate: 0,
            tx_power: 0,
        }
    }
}

/// Data-plane indication for a decrypted downlink.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct McpsIndication {
    pub pending: bool,
    pub status: EventStatus,
    pub msg_type: McpsType,
    pub port: u8,
    pub buffer: Vec<u8, MAX_PHY_PAYLOAD>,
    pub is_data_recvd: bool,
    pub is_ack_recvd: bool,
    pub fpending: bool,
    pub dl_frame_counter: u32,
    pub rx_datarate: u8,
    pub rssi: i16,
    pub snr: i8,
    pub channel: u8,
    pub rx_toa_ms: u32,
}

impl Default for McpsIndication {
    fn default() -> McpsIndication {
        McpsIndication {
            pending: false,
            status: EventStatus::Ok,
            msg_type: McpsType::Unconfirmed,
            port: 0,
            buffer: Vec::new(),
            is_data_recvd: false,
            is_ack_recvd: false,
            fpending: false,
            dl_frame_counter: 0,
            rx_datarate: 0,
            rssi: 0,
            snr: 0,
            channel: 0,
            rx_toa_ms: 0,
        }
    }
}

/// Control-plane indication raised while parsing a downlink.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MlmeIndication {
    pub pending: bool,
    pub kind: MlmeIndicationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MlmeIndicationKind {
    #[default]
    Other,
    /// The network asked for an uplink as soon as possible.
    ScheduleUplink,
}

/// Control-plane confirmation delivered through [`MacNotifier`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MlmeConfirm {
    LinkCheck { status: EventStatus, demod_margin: u8, gateway_count: u8 },
    Reset,
    Rekey,
    DeviceMode { class: DeviceClass },
    JoinAccept { status: EventStatus },
    ForceRejoin { rejoin_type: RejoinType, datarate: u8, period: u8, max_retries: u8 },
    PingSlotInfo,
    BeaconAcquisition { status: EventStatus },
}

/// Upward signal path from the MAC. Implemented by the controller and handed
/// to [`MacLayer::on_radio_rx_done`] for the duration of downlink parsing.
pub trait MacNotifier {
    fn mlme_confirm(&mut self, confirm: MlmeConfirm);

    /// GPS time (milliseconds) carried by a `DeviceTimeAns`, captured by the
    /// network at the end of the uplink transmission.
    fn device_time_answer(&mut self, gps_time_ms: u64);
}

/// Beacon tracking status reported by the MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconStatus {
    AcquisitionSuccess,
    AcquisitionFailed,
    Lock,
    Miss,
}

/// Contents of the last received beacon frame.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Beacon {
    pub time_seconds: u32,
    pub info_desc: u8,
    pub gw_specific: [u8; 6],
    pub rssi: i16,
    pub snr: i8,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    pub id: u8,
    pub frequency_hz: u32,
    pub dr_min: u8,
    pub dr_max: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelPlan {
    pub channels: Vec<Channel, 16>,
}

/// The lower MAC sublayer.
///
/// All methods are invoked from event-queue context only. Deferred work the
/// MAC schedules internally (duty-cycle backoff, ACK timeouts) must also run
/// on that queue; when a deferred transmission cannot be placed on any
/// channel, the integration reports it through
/// [`Stack::on_scheduling_failure`](crate::stack::Stack::on_scheduling_failure).
pub trait MacLayer {
    /// One-time bring-up. Called while the controller leaves its
    /// not-initialized state.
    fn initialize(&mut self) -> Result;

    /// Validate activation parameters and stage them for [`Self::join`].
    /// `None` selects the credentials provisioned at build time.
    fn prepare_join(&mut self, join: Option<&JoinMode>, is_otaa: bool) -> Result;

    /// Start the staged activation. For OTAA this emits the first
    /// Join-Request; for ABP it installs the session keys.
    fn join(&mut self, is_otaa: bool) -> Result;

    /// Retry the join exchange after a missed Join-Accept. Returns false
    /// once the attempt budget is exhausted.
    fn continue_joining_process(&mut self) -> bool;

    /// Emit a Rejoin-Request (LoRaWAN 1.1).
    fn rejoin(&mut self, rejoin_type: RejoinType, is_forced: bool, datarate: u8);

    /// `(max_time_s, max_count)` thresholds for periodic Type-0 rejoin.
    fn get_rejoin_parameters(&self) -> (u32, u32);

    /// Copy an application payload into the TX pipe. Returns the number of
    /// bytes accepted; surplus is up to the application to re-send.
    fn prepare_ongoing_tx(
        &mut self,
        port: u8,
        data: &[u8],
        flags: MsgFlags,
        num_retries: u8,
    ) -> usize;

    /// Schedule the prepared frame for transmission, honoring duty cycle.
    fn send_ongoing_tx(&mut self) -> Result;

    /// Ask for one more retransmission of a confirmed uplink. Returns false
    /// when the retry budget is spent.
    fn continue_sending_process(&mut self) -> bool;

    /// Abort a transmission that is still waiting on the backoff timer.
    /// `Error::Busy` once the frame reached the radio, `Error::NoOp` when
    /// nothing is pending.
    fn clear_tx_pipe(&mut self) -> Result;

    fn tx_ongoing(&self) -> bool;
    fn set_tx_ongoing(&mut self, ongoing: bool);
    fn reset_ongoing_tx(&mut self);

    /// Remaining backoff before a deferred transmission, if one is pending.
    fn backoff_time_left_ms(&self) -> Option<u32>;

    fn on_radio_tx_done(&mut self, timestamp_ms: u32);
    fn on_radio_tx_timeout(&mut self);

    /// Parse a received PHY payload. Control-plane results are pushed into
    /// `notifier` while parsing runs.
    fn on_radio_rx_done(
        &mut self,
        payload: &[u8],
        rssi: i16,
        snr: i8,
        timestamp_ms: u32,
        notifier: &mut dyn MacNotifier,
    );

    /// A receive window closed empty. `is_timeout` is false when the frame
    /// was dropped for a CRC error rather than a timeout.
    fn on_radio_rx_timeout(&mut self, is_timeout: bool);

    fn setup_link_check_request(&mut self);
    fn setup_device_time_request(&mut self) -> Result;
    fn setup_reset_indication(&mut self);
    fn setup_rekey_indication(&mut self);
    fn setup_device_mode_indication(&mut self, class: DeviceClass);

    #[cfg(feature = "class-b")]
    fn set_ping_slot_info(&mut self, periodicity: u8) -> Result;
    #[cfg(feature = "class-b")]
    fn add_ping_slot_info_req(&mut self);
    #[cfg(feature = "class-b")]
    fn enable_beacon_acquisition(&mut self) -> Result;
    #[cfg(feature = "class-b")]
    fn get_last_rx_beacon(&self) -> Result<&Beacon>;

    fn post_process_mcps_req(&mut self);
    fn post_process_mcps_ind(&mut self);
    fn post_process_mlme_ind(&mut self);

    fn get_mcps_confirmation(&self) -> &McpsConfirm;
    fn get_mcps_indication(&self) -> &McpsIndication;
    fn get_mlme_indication(&self) -> &MlmeIndication;

    fn add_channel_plan(&mut self, plan: &ChannelPlan) -> Result;
    fn remove_channel_plan(&mut self) -> Result;
    fn remove_single_channel(&mut self, id: u8) -> Result;
    fn get_channel_plan(&self, plan: &mut ChannelPlan) -> Result;
    fn set_channel_data_rate(&mut self, data_rate: u8) -> Result;
    fn enable_adaptive_datarate(&mut self, enable: bool);

    fn set_device_class(&mut self, class: DeviceClass) -> Result;
    fn get_device_class(&self) -> DeviceClass;

    fn nwk_joined(&self) -> bool;
    fn get_current_slot(&self) -> RxSlot;
    fn get_server_type(&self) -> ServerType;

    /// ADR_ACK_LIMIT currently in force; bounds RekeyInd retries.
    fn get_current_adr_ack_limit(&self) -> u8;

    /// NbTrans currently requested by the network.
    fn get_qos_level(&self) -> u8;
    /// NbTrans in force while the previous uplink went out.
    fn get_prev_qos_level(&self) -> u8;

    /// Tear down the session and put the radio to sleep.
    fn disconnect(&mut self);
}

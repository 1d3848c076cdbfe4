#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Protocol controller for a LoRaWAN Class A/B/C end device.
//!
//! This crate sits between a lower MAC sublayer (frame building, channel
//! selection, duty cycle — consumed through the [`mac::MacLayer`] trait) and
//! an application. It linearizes radio interrupts, timer expiries and
//! application requests into a single run-to-completion state machine,
//! tracks the activation session, retransmissions and sticky MAC-command
//! requests, and reports progress through [`event::Event`].
//!
//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

mod fmt;

pub mod event;
pub mod mac;
pub mod radio;
pub mod session;
pub mod stack;
pub mod timer;

mod interface;
pub use interface::Interface;


pub use event::{AppCallbacks, Event};
pub use lorawan::{
    keys::{AppEui, AppKey, AppSKey, DevEui, NewSKey},
    parser::DevAddr,
};
pub use rand_core::RngCore;
pub use session::{JoinMode, Session};
pub use stack::Stack;

/// Status codes returned by the controller. Never raised by unwinding; every
/// fallible operation reports through `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // configuration
    NotInitialized,
    ParameterInvalid,
    PortInvalid,
    ServiceUnknown,
    Unsupported,
    // liveness
    Busy,
    WouldBlock,
    NoOp,
    AlreadyConnected,
    NoActiveSessions,
    NoNetworkJoined,
    // physical
    FrequencyInvalid,
    DatarateInvalid,
    FrequencyAndDatarateInvalid,
    LengthError,
    NoBeaconFound,
    // lifecycle
    DeviceOff,
    // metadata
    MetadataNotAvailable,
}

pub type Result<T = ()> = core::result::Result<T, Error>;

/// Outcome of a successful `connect` call.
///
/// Over-the-air activation completes asynchronously: the call returns
/// [`ConnectStatus::ConnectInProgress`] and [`Event::Connected`] follows once
/// the Join-Accept has been processed. Activation by personalization
/// completes within the call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectStatus {
    ConnectInProgress,
    Connected,
}

/// Message flags shared by `send` and `receive`.
///
/// For `send` exactly one of `UNCONFIRMED`, `CONFIRMED` or `PROPRIETARY`
/// must be set and `MULTICAST` is illegal. For `receive` the flags may be
/// or-ed to subscribe to several delivery types at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const UNCONFIRMED: MsgFlags = MsgFlags(0x01);
    pub const CONFIRMED: MsgFlags = MsgFlags(0x02);
    pub const MULTICAST: MsgFlags = MsgFlags(0x04);
    pub const PROPRIETARY: MsgFlags = MsgFlags(0x08);

    const MASK: u8 = 0x0f;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> MsgFlags {
        MsgFlags(bits & Self::MASK)
    }

    pub const fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// True when the flag word selects exactly one uplink delivery type.
    pub(crate) const fn is_valid_for_uplink(self) -> bool {
        matches!(self.0 & Self::MASK, 0x01 | 0x02 | 0x08)
    }
}

impl core::ops::BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// Protocol revision spoken towards the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LorawanVersion {
    #[default]
    V1_0_2,
    V1_0_3,
    V1_1,
}

impl LorawanVersion {
    pub(crate) fn is_v1_1(self) -> bool {
        matches!(self, LorawanVersion::V1_1)
    }
}

/// Build-time defaults of the stack, overridable per instance.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Protocol revision the device is provisioned for.
    pub version: LorawanVersion,
    /// Activation mode used by a parameterless `connect`.
    pub over_the_air_activation: bool,
    /// Application port seeded before the first `send`.
    pub default_app_port: u8,
    /// Retries for a confirmed message before it is reported failed.
    pub confirmed_msg_retries: u8,
    /// Ping-slot periodicity (0..=7) announced by `PingSlotInfoReq`.
    pub ping_slot_periodicity: u8,
    /// Beacon search attempts before acquisition is reported failed.
    pub beacon_acquisition_nb_trials: u8,
    /// Beacon-less operation window after which Class B falls back to
    /// Class A (LoRaWAN 1.0.3 section 12.1).
    pub beaconless_period_ms: u32,
    /// Interval between periodic Type-1 rejoin requests (seconds).
    pub rejoin_type1_send_period_s: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            version: LorawanVersion::default(),
            over_the_air_activation: true,
            default_app_port: 15,
            confirmed_msg_retries: 1,
            ping_slot_periodicity: 7,
            beacon_acquisition_nb_trials: 8,
            beaconless_period_ms: 120 * 60 * 1000,
            rejoin_type1_send_period_s: 86_400,
        }
    }
}

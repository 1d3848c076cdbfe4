//! In-memory activation state.

use lorawan::keys::{AppEui, AppKey, AppSKey, DevEui, NewSKey};
use lorawan::parser::DevAddr;

/// Activation parameters supplied by the application.
///
/// For LoRaWAN 1.1 OTAA the distinct network root key travels in `nwkkey`;
/// 1.0.x deployments leave it `None` and the MAC derives both session keys
/// from `appkey`.
///
/// A 1.1 ABP session is provisioned with four keys: the network session key
/// splits into forwarding/serving integrity keys and an encryption key.
/// Under 1.0.x the split keys stay `None` and `nwkskey` serves all three
/// network roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JoinMode {
    OTAA {
        deveui: DevEui,
        appeui: AppEui,
        appkey: AppKey,
        nwkkey: Option<AppKey>,
    },
    ABP {
        devaddr: DevAddr<[u8; 4]>,
        nwkskey: NewSKey,
        appskey: AppSKey,
        fnwk_sint_key: Option<NewSKey>,
        snwk_sint_key: Option<NewSKey>,
        nwk_senc_key: Option<NewSKey>,
    },
}

impl JoinMode {
    pub fn is_otaa(&self) -> bool {
        matches!(self, JoinMode::OTAA { .. })
    }
}

/// Frame-counter state of the active (or last) session.
///
/// Counters are zeroed when an OTAA connect starts; an ABP reconnect within
/// the same process reuses them. Nothing survives a power cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Session {
    pub active: bool,
    pub uplink_counter: u32,
    pub downlink_counter: u32,
}

impl Session {
    pub(crate) fn reset_counters(&mut self) {
        self.uplink_counter = 0;
        self.downlink_counter = 0;
    }
}

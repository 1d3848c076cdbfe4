//! Sticky MAC-command requests.
//!
//! Each member is re-evaluated on every outgoing uplink until it is
//! explicitly removed or confirmed by the network:
//!
//! * `LinkCheck`, `DeviceTime`, `PingSlot` stay until the application
//!   removes them.
//! * `Reset` stays until a `ResetConf` arrives (ABP, LoRaWAN 1.1).
//! * `Rekey` stays until a `RekeyConf` arrives, bounded by ADR_ACK_LIMIT
//!   attempts (OTAA, LoRaWAN 1.1).
//! * `DeviceMode` stays until the matching MLME confirm; the class switch
//!   itself only happens after the carrying uplink went out.

use crate::mac::DeviceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StickyCommand {
    LinkCheck,
    DeviceTime,
    #[cfg(feature = "class-b")]
    PingSlot,
    Reset,
    Rekey,
    DeviceMode,
}

#[derive(Debug, Default)]
pub(crate) struct StickyCommands {
    link_check: bool,
    device_time: bool,
    #[cfg(feature = "class-b")]
    ping_slot: bool,
    reset: bool,
    rekey: bool,
    device_mode: bool,
    /// RekeyInd attempts since the sticky was armed.
    pub(crate) rekey_counter: u8,
    /// Class announced by the pending DeviceModeInd.
    pub(crate) pending_class: DeviceClass,
    /// Set between arming DeviceModeInd and the TX that carries it.
    pub(crate) device_mode_tx_pending: bool,
}

impl StickyCommands {
    pub(crate) fn new() -> StickyCommands {
        StickyCommands { pending_class: DeviceClass::A, ..Default::default() }
    }

    fn slot(&mut self, command: StickyCommand) -> &mut bool {
        match command {
            StickyCommand::LinkCheck => &mut self.link_check,
            StickyCommand::DeviceTime => &mut self.device_time,
            #[cfg(feature = "class-b")]
            StickyCommand::PingSlot => &mut self.ping_slot,
            StickyCommand::Reset => &mut self.reset,
            StickyCommand::Rekey => &mut self.rekey,
            StickyCommand::DeviceMode => &mut self.device_mode,
        }
    }

    pub(crate) fn insert(&mut self, command: StickyCommand) {
        if command == StickyCommand::Rekey {
            self.rekey_counter = 0;
        }
        *self.slot(command) = true;
    }

    pub(crate) fn remove(&mut self, command: StickyCommand) {
        if command == StickyCommand::Rekey {
            self.rekey_counter = 0;
        }
        *self.slot(command) = false;
    }

    pub(crate) fn contains(&self, command: StickyCommand) -> bool {
        match command {
            StickyCommand::LinkCheck => self.link_check,
            StickyCommand::DeviceTime => self.device_time,
            #[cfg(feature = "class-b")]
            StickyCommand::PingSlot => self.ping_slot,
            StickyCommand::Reset => self.reset,
            StickyCommand::Rekey => self.rekey,
            StickyCommand::DeviceMode => self.device_mode,
        }
    }
}

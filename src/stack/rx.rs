//! Pending downlink bookkeeping and chunked application reads.

use heapless::Vec;

use crate::mac::{McpsIndication, McpsType, MAX_PHY_PAYLOAD};
use crate::{Error, MsgFlags, Result};

/// The last application downlink, held until the application drained it.
/// Reads smaller than the payload are chunked across calls.
#[derive(Debug)]
pub(crate) struct RxMessage {
    buffer: Vec<u8, MAX_PHY_PAYLOAD>,
    port: u8,
    msg_type: McpsType,
    pending: usize,
    prev_read: usize,
    receive_ready: bool,
}

impl RxMessage {
    pub(crate) fn new() -> RxMessage {
        RxMessage {
            buffer: Vec::new(),
            port: 0,
            msg_type: McpsType::Unconfirmed,
            pending: 0,
            prev_read: 0,
            receive_ready: false,
        }
    }

    /// Stage a freshly indicated downlink for application reads.
    pub(crate) fn load(&mut self, indication: &McpsIndication) {
        self.buffer.clear();
        // both buffers are MAX_PHY_PAYLOAD wide
        self.buffer.extend_from_slice(&indication.buffer).unwrap();
        self.port = indication.port;
        self.msg_type = indication.msg_type;
        self.pending = 0;
        self.prev_read = 0;
        self.receive_ready = true;
    }

    pub(crate) fn receive_ready(&self) -> bool {
        self.receive_ready
    }

    /// Copy pending bytes into `data`.
    ///
    /// With `filter` set, the staged port and delivery type must match the
    /// caller's expectation or the message is withheld (`WouldBlock`).
    /// Returns the bytes copied together with the port and delivery flags.
    pub(crate) fn read(
        &mut self,
        data: &mut [u8],
        filter: Option<(u8, MsgFlags)>,
    ) -> Result<(usize, u8, MsgFlags)> {
        if !self.receive_ready {
            return Err(Error::WouldBlock);
        }
        if data.is_empty() {
            return Err(Error::ParameterInvalid);
        }

        let received_flags = self.msg_type.as_msg_flags();
        if let Some((port, flags)) = filter {
            if self.port != port || !flags.contains(received_flags) {
                return Err(Error::WouldBlock);
            }
        }

        if self.pending == 0 {
            self.pending = self.buffer.len();
            self.prev_read = 0;
        }

        let copied;
        let mut read_complete = false;
        if self.prev_read == 0 && self.buffer.len() <= data.len() {
            copied = self.buffer.len();
            data[..copied].copy_from_slice(&self.buffer);
            read_complete = true;
        } else if self.pending > data.len() {
            copied = data.len();
            data.copy_from_slice(&self.buffer[self.prev_read..self.prev_read + copied]);
            self.pending -= copied;
            self.prev_read += copied;
        } else {
            copied = self.pending;
            data[..copied].copy_from_slice(&self.buffer[self.prev_read..self.prev_read + copied]);
            read_complete = true;
        }

        let port = self.port;
        if read_complete {
            self.buffer.clear();
            self.pending = 0;
            self.receive_ready = false;
        }

        Ok((copied, port, received_flags))
    }
}

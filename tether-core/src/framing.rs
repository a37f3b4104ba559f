//! Validator-driven message framing.
//!
//! Bytes read from a socket are appended to a [`MessageAssembler`]; the
//! application's [`PacketValidator`] then decides where each complete message
//! ends. Whatever the validator does not claim stays buffered for the next
//! read.

use bytes::BytesMut;
use std::sync::Arc;
use tracing::{trace, warn};

/// Reports how many leading bytes of `buf` form one complete message.
///
/// Returning 0 means more data is needed.
pub type PacketValidator = Arc<dyn Fn(&[u8]) -> usize + Send + Sync>;

/// Completion callback fired once a queued buffer has been handed to the OS.
pub type SendCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: BytesMut,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and hand every complete message to `on_message`.
    ///
    /// Without a validator the entire buffer is one message. Returns the
    /// number of messages delivered.
    pub fn feed<F>(&mut self, data: &[u8], validator: Option<&PacketValidator>, mut on_message: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        self.partial.extend_from_slice(data);

        let mut delivered = 0;
        while !self.partial.is_empty() {
            let available = self.partial.len();
            let consumed = match validator {
                Some(validate) => validate(&self.partial[..]),
                None => available,
            };

            if consumed == 0 {
                trace!("packet incomplete with {} bytes buffered, waiting for more", available);
                break;
            }
            if consumed > available {
                warn!(
                    "validator claimed {} bytes but only {} are buffered, waiting for more",
                    consumed, available
                );
                break;
            }

            trace!("complete packet of {} bytes, calling receive callback", consumed);
            let message = self.partial.split_to(consumed);
            on_message(&message[..]);
            delivered += 1;
        }
        delivered
    }

    /// Bytes buffered but not yet claimed by the validator.
    pub fn residual(&self) -> &[u8] {
        &self.partial
    }
}

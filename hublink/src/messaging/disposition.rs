//! The cloud-to-device disposition pipeline: packaging received messages with
//! the token needed to settle them, and forwarding the client's verdict back
//! to the device session.

use std::collections::HashMap;
use std::rc::Rc;

use crate::device::session::DeviceSession;
use crate::transport::TransportError;

/// A cloud-to-device message delivered by a device session.
#[derive(Debug, Clone, Default)]
pub struct CloudMessage {
    pub content: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl CloudMessage {
    pub fn new(content: Vec<u8>) -> Self {
        CloudMessage {
            content,
            properties: HashMap::new(),
        }
    }
}

/// Where a message arrived: the receiving link and the delivery number the
/// broker assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub source: String,
    pub delivery_number: u32,
}

/// Link name and delivery number handed to the session together with a
/// verdict; a fresh copy is made for every disposition call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionInfo {
    pub source: String,
    pub delivery_number: u32,
}

/// The client's verdict on a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    Abandoned,
    Rejected,
}

/// The verdict encoding understood by device sessions. An abandoned message
/// is released so the broker redelivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDisposition {
    Accepted,
    Released,
    Rejected,
}

pub(crate) fn session_disposition_from(disposition: MessageDisposition) -> SessionDisposition {
    match disposition {
        MessageDisposition::Accepted => SessionDisposition::Accepted,
        MessageDisposition::Abandoned => SessionDisposition::Released,
        MessageDisposition::Rejected => SessionDisposition::Rejected,
    }
}

/// Handler a device session invokes for every received message. Returns the
/// immediate verdict, or `None` when the client keeps the message for a later
/// explicit disposition.
pub type MessageReceivedHandler =
    Box<dyn FnMut(CloudMessage, DeliveryInfo) -> Option<SessionDisposition>>;

/// The upper client receiving cloud-to-device messages.
pub trait CloudMessageHandler {
    /// Take ownership of the message and settle it later through
    /// [`InboundMessage::send_disposition`]. Return `false` if the message
    /// cannot be processed; it is then released back to the broker for
    /// redelivery.
    fn on_message(&self, message: InboundMessage) -> bool;
}

/// A received message together with the token needed to settle it.
///
/// The message stays unsettled at the broker until the client calls
/// [`InboundMessage::send_disposition`]; dropping it without a disposition
/// leaves redelivery to the broker's link policy.
pub struct InboundMessage {
    message: CloudMessage,
    source: String,
    delivery_number: u32,
    device_id: Rc<str>,
    session: Rc<dyn DeviceSession>,
}

impl InboundMessage {
    pub fn message(&self) -> &CloudMessage {
        &self.message
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn delivery(&self) -> DeliveryInfo {
        DeliveryInfo {
            source: self.source.clone(),
            delivery_number: self.delivery_number,
        }
    }

    /// Forward the client's verdict to the device session. The message is
    /// consumed whether or not forwarding succeeds.
    pub fn send_disposition(self, disposition: MessageDisposition) -> Result<(), TransportError> {
        let verdict = session_disposition_from(disposition);
        let info = DispositionInfo {
            source: self.source.clone(),
            delivery_number: self.delivery_number,
        };

        if let Err(e) = self.session.send_message_disposition(&info, verdict) {
            log::error!(
                "Device '{}' failed sending the disposition for delivery {} on link '{}': {e:#}",
                self.device_id,
                self.delivery_number,
                self.source
            );
            return Err(TransportError::Other(e));
        }

        log::trace!(
            "Device '{}' settled delivery {} on link '{}' as {verdict:?}",
            self.device_id,
            self.delivery_number,
            self.source
        );
        Ok(())
    }
}

/// Build the handler installed on a device session by `subscribe`.
pub(crate) fn make_message_received_handler(
    device_id: Rc<str>,
    session: Rc<dyn DeviceSession>,
    client: Rc<dyn CloudMessageHandler>,
) -> MessageReceivedHandler {
    Box::new(move |message, delivery| {
        log::debug!(
            "Device '{device_id}' received a cloud-to-device message on link '{}' (delivery {})",
            delivery.source,
            delivery.delivery_number
        );

        let inbound = InboundMessage {
            message,
            source: delivery.source,
            delivery_number: delivery.delivery_number,
            device_id: Rc::clone(&device_id),
            session: Rc::clone(&session),
        };

        if client.on_message(inbound) {
            // The client holds the message; its verdict arrives through
            // send_disposition.
            None
        } else {
            log::error!(
                "Device '{device_id}' could not hand a cloud-to-device message to the client; releasing it for redelivery"
            );
            Some(SessionDisposition::Released)
        }
    })
}

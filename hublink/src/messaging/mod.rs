//! The device-to-cloud event pipeline: the user-facing queue entries and the
//! in-flight event handed to a device session, including the completion
//! accounting that feeds the send-failure budget.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::device::session::D2cSendResult;
use crate::device::DeviceShared;

pub mod disposition;

/// A device-to-cloud event payload.
#[derive(Debug, Clone, Default)]
pub struct EventMessage {
    pub content: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl EventMessage {
    pub fn new(content: Vec<u8>) -> Self {
        EventMessage {
            content,
            properties: HashMap::new(),
        }
    }
}

/// User-visible confirmation for one submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    Ok,
    Error,
    MessageTimeout,
    /// The device registration went away before the event could be sent.
    BecauseDestroy,
}

pub type ConfirmationCallback = Box<dyn FnOnce(ConfirmationResult)>;

/// One entry of a device's waiting-to-send queue. Owned by the caller until
/// the transport dequeues it on a work tick.
pub struct OutboundEvent {
    message: EventMessage,
    callback: Option<ConfirmationCallback>,
}

impl OutboundEvent {
    pub fn new(message: EventMessage) -> Self {
        OutboundEvent {
            message,
            callback: None,
        }
    }

    /// Attach a callback fired exactly once when the event send completes.
    pub fn with_confirmation(mut self, callback: ConfirmationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn message(&self) -> &EventMessage {
        &self.message
    }

    pub(crate) fn confirm(mut self, result: ConfirmationResult) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

/// The waiting-to-send queue, shared between the caller (producer) and the
/// transport (consumer). The transport pops from the head but never destroys
/// the queue itself.
pub type EventQueue = Rc<RefCell<VecDeque<OutboundEvent>>>;

fn confirmation_result_from(result: D2cSendResult) -> ConfirmationResult {
    match result {
        D2cSendResult::Ok => ConfirmationResult::Ok,
        D2cSendResult::CannotParse | D2cSendResult::FailSending | D2cSendResult::Unknown => {
            ConfirmationResult::Error
        }
        D2cSendResult::Timeout => ConfirmationResult::MessageTimeout,
        D2cSendResult::DeviceDestroyed => ConfirmationResult::BecauseDestroy,
    }
}

/// An event in flight at a device session, paired with its completion token.
///
/// The session owns the event from submission until it calls
/// [`PendingEvent::complete`]; completing consumes the payload and fires the
/// user confirmation.
pub struct PendingEvent {
    message: EventMessage,
    callback: Option<ConfirmationCallback>,
    device: Rc<DeviceShared>,
    completed: bool,
}

impl PendingEvent {
    pub(crate) fn new(event: OutboundEvent, device: Rc<DeviceShared>) -> Self {
        PendingEvent {
            message: event.message,
            callback: event.callback,
            device,
            completed: false,
        }
    }

    pub fn message(&self) -> &EventMessage {
        &self.message
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    /// Record the send outcome and fire the user confirmation.
    ///
    /// A successful or destroy-time completion clears the consecutive
    /// send-failure count; anything else increments it.
    pub fn complete(mut self, result: D2cSendResult) {
        self.completed = true;

        match result {
            D2cSendResult::Ok | D2cSendResult::DeviceDestroyed => {
                self.device.send_complete_failures.set(0);
            }
            _ => {
                let failures = self.device.send_complete_failures.get() + 1;
                self.device.send_complete_failures.set(failures);
                log::debug!(
                    "Device '{}' completed an event send with {result:?} ({failures} consecutive failures)",
                    self.device.device_id
                );
            }
        }

        if let Some(callback) = self.callback.take() {
            callback(confirmation_result_from(result));
        }
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        if !self.completed {
            log::warn!(
                "Device '{}' dropped an in-flight event without completing it; its confirmation callback will never fire",
                self.device.device_id
            );
        }
    }
}

//! The device-session collaborator: per-device authentication, link
//! management, D2C sends and C2D delivery live behind this trait.

use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;

use crate::connection::{CbsHandle, SessionHandle};
use crate::device::DeviceState;
use crate::messaging::disposition::{DispositionInfo, MessageReceivedHandler, SessionDisposition};
use crate::messaging::PendingEvent;

/// Callback invoked with `(previous, new)` whenever the session changes its
/// lifecycle state. May fire synchronously from within [`DeviceSession::do_work`].
pub type DeviceStateHandler = Box<dyn FnMut(DeviceState, DeviceState)>;

/// Credentials the device session authenticates with.
#[derive(Debug, Clone)]
pub enum DeviceAuth {
    /// Claims-based security, with either a shared-access key or a pre-built
    /// SAS token.
    Cbs {
        primary_key: Option<String>,
        sas_token: Option<String>,
    },
    /// Client-certificate authentication carried by the underlying stream.
    X509,
}

/// Everything a session implementation needs to serve one device.
pub struct DeviceSessionConfig {
    pub device_id: String,
    pub host_fqdn: String,
    pub auth: DeviceAuth,
    pub on_state_changed: DeviceStateHandler,
}

/// Per-device tunables replicated from the transport defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSessionOption {
    SasTokenLifetime(Duration),
    SasTokenRefreshTime(Duration),
    CbsRequestTimeout(Duration),
    EventSendTimeout(Duration),
}

/// Outcome the session reports for a single device-to-cloud event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D2cSendResult {
    Ok,
    CannotParse,
    FailSending,
    Timeout,
    DeviceDestroyed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// One device's authentication and messaging unit.
///
/// Implementations keep their own interior mutability; the transport holds a
/// shared handle and never blocks on any of these calls. Progress happens
/// inside [`DeviceSession::do_work`], which the transport invokes once per
/// tick.
pub trait DeviceSession {
    fn set_option(&self, option: DeviceSessionOption) -> Result<()>;

    /// Begin moving towards `Started` on the given AMQP session. `cbs` is
    /// present exactly when the transport authenticates via CBS.
    fn start(&self, session: SessionHandle, cbs: Option<CbsHandle>) -> Result<()>;

    /// Begin moving back to `Stopped`.
    fn stop(&self) -> Result<()>;

    /// Submit one event. On acceptance the session must eventually complete
    /// the event exactly once, and completions must fire in submission order.
    /// On refusal the event is handed back untouched.
    fn send_event_async(&self, event: PendingEvent) -> std::result::Result<(), PendingEvent>;

    /// Install the handler receiving cloud-to-device messages.
    fn subscribe_message(&self, handler: MessageReceivedHandler) -> Result<()>;

    fn unsubscribe_message(&self) -> Result<()>;

    /// Forward the client's verdict for a previously delivered message.
    fn send_message_disposition(
        &self,
        info: &DispositionInfo,
        verdict: SessionDisposition,
    ) -> Result<()>;

    fn send_status(&self) -> Result<SendStatus>;

    /// Advance authentication and messaging. Harmless when not started.
    fn do_work(&self);
}

pub trait DeviceSessionFactory {
    fn create(&self, config: DeviceSessionConfig) -> Result<Rc<dyn DeviceSession>>;
}

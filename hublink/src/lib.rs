//! Multi-device AMQP transport core for IoT hub connectivity.
//!
//! The transport multiplexes any number of logical device sessions over one
//! secure byte stream and one AMQP connection. Each registered device
//! authenticates on its own, sends device-to-cloud events from a
//! caller-owned queue, and receives cloud-to-device messages that the client
//! settles with an explicit disposition.
//!
//! The crate performs no I/O itself: the byte stream, the AMQP connection and
//! the per-device sessions are collaborators injected as trait objects at
//! construction. Scheduling is single-threaded and cooperative. The host
//! calls [`AmqpTransport::do_work`] repeatedly, and all progress (connection
//! establishment, device lifecycle changes, event drains, retry after a
//! connection fault) happens inside those ticks.

mod connection;
mod device;
mod io;
mod messaging;
mod transport;
mod utils;

pub use connection::{
    AmqpConnection, CbsHandle, ConnectionConfig, ConnectionFactory, ConnectionState,
    ConnectionStateHandler, SessionHandle,
};
pub use device::session::{
    D2cSendResult, DeviceAuth, DeviceSession, DeviceSessionConfig, DeviceSessionFactory,
    DeviceSessionOption, DeviceStateHandler, SendStatus,
};
pub use device::{AuthenticationMode, DeviceState, MAX_CONSECUTIVE_DEVICE_FAILURES};
pub use io::{ByteStream, StreamOptionSet, StreamProvider};
pub use messaging::disposition::{
    CloudMessage, CloudMessageHandler, DeliveryInfo, DispositionInfo, InboundMessage,
    MessageDisposition, MessageReceivedHandler, SessionDisposition,
};
pub use messaging::{
    ConfirmationCallback, ConfirmationResult, EventMessage, EventQueue, OutboundEvent,
    PendingEvent,
};
pub use transport::options::{
    OptionValue, TransportOptions, OPTION_CBS_REQUEST_TIMEOUT, OPTION_EVENT_SEND_TIMEOUT,
    OPTION_LOG_TRACE, OPTION_SAS_TOKEN_LIFETIME, OPTION_SAS_TOKEN_REFRESH_TIME, OPTION_X509_CERT,
    OPTION_X509_PRIVATE_KEY,
};
pub use transport::{
    AmqpTransport, DeviceConfig, DeviceHandle, HostName, Protocol, RetryPolicy, TransportConfig,
    TransportError,
};
pub use utils::clock::{Clock, MonotonicClock};

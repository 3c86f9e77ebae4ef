//! The string-keyed option surface and the typed transport defaults behind
//! it.

use std::time::Duration;

/// Lifetime of generated SAS tokens, in seconds. Device-scoped.
pub const OPTION_SAS_TOKEN_LIFETIME: &str = "sas_token_lifetime";
/// How long before expiry a SAS token is refreshed, in seconds. Device-scoped.
pub const OPTION_SAS_TOKEN_REFRESH_TIME: &str = "sas_token_refresh_time";
/// Timeout for a single CBS token exchange, in seconds. Device-scoped.
pub const OPTION_CBS_REQUEST_TIMEOUT: &str = "cbs_request_timeout";
/// Timeout for a single event send, in seconds. Device-scoped.
pub const OPTION_EVENT_SEND_TIMEOUT: &str = "event_send_timeout";
/// Toggles protocol-level tracing on the AMQP connection.
pub const OPTION_LOG_TRACE: &str = "log_trace";
/// Client certificate for X509 authentication; locks the transport to X509.
pub const OPTION_X509_CERT: &str = "x509_cert";
/// Private key for X509 authentication; locks the transport to X509.
pub const OPTION_X509_PRIVATE_KEY: &str = "x509_private_key";

/// A value passed through the string-keyed option surface. Options the
/// transport does not recognize are forwarded verbatim to the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Seconds(u64),
    Bool(bool),
    Text(String),
}

/// Defaults applied to every device session registered on the transport.
/// Changing one through `set_option` also updates all currently registered
/// sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub sas_token_lifetime: Duration,
    pub sas_token_refresh_time: Duration,
    pub cbs_request_timeout: Duration,
    pub event_send_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            sas_token_lifetime: Duration::from_secs(3600),
            sas_token_refresh_time: Duration::from_secs(1800),
            cbs_request_timeout: Duration::from_secs(30),
            event_send_timeout: Duration::from_secs(300),
        }
    }
}

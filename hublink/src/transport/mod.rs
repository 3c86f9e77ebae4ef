//! The transport root: construction, device registration, the option
//! surface and the work tick that drives everything forward.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

use crate::connection::{ConnectionFactory, ConnectionState, ConnectionSupervisor};
use crate::device::session::{
    DeviceAuth, DeviceSession, DeviceSessionConfig, DeviceSessionFactory, DeviceSessionOption,
    SendStatus,
};
use crate::device::{
    is_credential_acceptable, AuthenticationMode, DeviceRecord, DeviceRegistry, DeviceShared,
    DeviceState, DEFAULT_STATE_CHANGE_TIMEOUT, MAX_CONSECUTIVE_DEVICE_FAILURES,
};
use crate::io::StreamProvider;
use crate::messaging::disposition::{make_message_received_handler, CloudMessageHandler};
use crate::messaging::EventQueue;
use crate::utils::clock::{Clock, MonotonicClock};
use options::{
    OptionValue, TransportOptions, OPTION_CBS_REQUEST_TIMEOUT, OPTION_EVENT_SEND_TIMEOUT,
    OPTION_LOG_TRACE, OPTION_SAS_TOKEN_LIFETIME, OPTION_SAS_TOKEN_REFRESH_TIME, OPTION_X509_CERT,
    OPTION_X509_PRIVATE_KEY,
};

pub mod options;

/// Errors surfaced by the public transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("device '{0}' is already registered on this transport")]
    DeviceAlreadyRegistered(String),
    #[error("device '{0}' is not registered on this transport")]
    DeviceNotRegistered(String),
    #[error("credentials of device '{0}' are not compatible with the transport authentication mode")]
    CredentialNotAcceptable(String),
    #[error("the operation is not supported")]
    NotSupported,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Upper-layer protocol variant the transport was selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Amqp,
    AmqpOverWebSockets,
}

/// Target host: either the hub name plus domain suffix, or a protocol gateway
/// used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostName {
    HubDomain {
        iothub_name: String,
        iothub_suffix: String,
    },
    Gateway(String),
}

impl HostName {
    fn fqdn(&self) -> Result<String, TransportError> {
        match self {
            HostName::Gateway(host) => {
                if host.is_empty() {
                    return Err(TransportError::InvalidArgument(
                        "the gateway host name must not be empty",
                    ));
                }
                Ok(host.clone())
            }
            HostName::HubDomain {
                iothub_name,
                iothub_suffix,
            } => {
                if iothub_name.is_empty() || iothub_suffix.is_empty() {
                    return Err(TransportError::InvalidArgument(
                        "the hub name and suffix must both be non-empty",
                    ));
                }
                Ok(format!("{iothub_name}.{iothub_suffix}"))
            }
        }
    }
}

/// Retry behavior selector. Accepted for interface parity with other
/// transports but not interpreted yet; the fixed failure threshold applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    ExponentialBackoffWithJitter,
    Immediate,
    Interval,
    None,
}

pub struct TransportConfig {
    pub host: HostName,
    pub protocol: Protocol,
    /// Override the timeout clock; defaults to the monotonic system clock.
    pub clock: Option<Rc<dyn Clock>>,
}

/// Identity and credentials of one device to register.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub primary_key: Option<String>,
    pub sas_token: Option<String>,
}

/// Stable reference to a registered device, keyed by its id rather than by a
/// pointer into the registry.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device_id: Rc<str>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// A multi-device AMQP transport.
///
/// All device sessions share one byte stream and one AMQP connection. The
/// transport owns no threads and never blocks; the host drives it by calling
/// [`AmqpTransport::do_work`] repeatedly. Handles are deliberately not `Send`:
/// a transport belongs to the single thread that drives it.
pub struct AmqpTransport {
    host_fqdn: Rc<str>,
    protocol: Protocol,
    preferred_mode: AuthenticationMode,
    supervisor: ConnectionSupervisor,
    registry: DeviceRegistry,
    options: TransportOptions,
    sessions: Box<dyn DeviceSessionFactory>,
    clock: Rc<dyn Clock>,
}

impl AmqpTransport {
    pub fn new(
        config: TransportConfig,
        streams: Box<dyn StreamProvider>,
        connections: Box<dyn ConnectionFactory>,
        sessions: Box<dyn DeviceSessionFactory>,
    ) -> Result<Self, TransportError> {
        let host_fqdn: Rc<str> = config.host.fqdn()?.into();
        let clock = config
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock) as Rc<dyn Clock>);

        log::debug!(
            "Creating AMQP transport for host '{host_fqdn}' ({:?})",
            config.protocol
        );

        Ok(AmqpTransport {
            host_fqdn,
            protocol: config.protocol,
            preferred_mode: AuthenticationMode::Unset,
            supervisor: ConnectionSupervisor::new(streams, connections),
            registry: DeviceRegistry::new(),
            options: TransportOptions::default(),
            sessions,
            clock,
        })
    }

    /// The fully qualified host name the transport connects to.
    pub fn hostname(&self) -> &str {
        &self.host_fqdn
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn preferred_authentication_mode(&self) -> AuthenticationMode {
        self.preferred_mode
    }

    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// Register a device on this transport. The first registration fixes the
    /// transport's authentication mode if no X509 option fixed it earlier.
    ///
    /// `queue` is the caller-owned waiting-to-send queue; the transport
    /// consumes entries from its head on every tick while the device is
    /// started.
    pub fn register(
        &mut self,
        device: DeviceConfig,
        client: Rc<dyn CloudMessageHandler>,
        queue: EventQueue,
    ) -> Result<DeviceHandle, TransportError> {
        if device.device_id.is_empty() {
            log::error!("Transport failed to register a device (the device id is empty)");
            return Err(TransportError::InvalidArgument(
                "the device id must not be empty",
            ));
        }

        if self.registry.contains(&device.device_id) {
            log::error!(
                "Transport failed to register device '{}' (a device with this id is already registered)",
                device.device_id
            );
            return Err(TransportError::DeviceAlreadyRegistered(device.device_id));
        }

        if !is_credential_acceptable(
            &device.device_id,
            device.primary_key.as_deref(),
            device.sas_token.as_deref(),
            self.preferred_mode,
        ) {
            return Err(TransportError::CredentialNotAcceptable(device.device_id));
        }

        let device_mode = if device.primary_key.is_some() || device.sas_token.is_some() {
            AuthenticationMode::Cbs
        } else {
            AuthenticationMode::X509
        };

        let device_id: Rc<str> = device.device_id.clone().into();
        let shared = Rc::new(DeviceShared {
            device_id: Rc::clone(&device_id),
            state: Cell::new(DeviceState::Stopped),
            state_changed_at: Cell::new(None),
            send_complete_failures: Cell::new(0),
        });

        let on_state_changed = {
            let shared = Rc::clone(&shared);
            let clock = Rc::clone(&self.clock);
            Box::new(move |previous: DeviceState, new: DeviceState| {
                if new == previous {
                    return;
                }
                log::debug!(
                    "Device '{}' changed state {previous:?} -> {new:?}",
                    shared.device_id
                );
                shared.state.set(new);
                shared.state_changed_at.set(clock.now());
            })
        };

        let auth = match device_mode {
            AuthenticationMode::Cbs => DeviceAuth::Cbs {
                primary_key: device.primary_key.clone(),
                sas_token: device.sas_token.clone(),
            },
            _ => DeviceAuth::X509,
        };

        let session = self
            .sessions
            .create(DeviceSessionConfig {
                device_id: device.device_id.clone(),
                host_fqdn: self.host_fqdn.to_string(),
                auth,
                on_state_changed,
            })
            .map_err(|e| {
                log::error!(
                    "Transport failed to register device '{}' (failed to create the device session): {e:#}",
                    device.device_id
                );
                TransportError::Other(e)
            })?;

        self.replicate_device_options(session.as_ref(), device_mode)
            .map_err(|e| {
                log::error!(
                    "Transport failed to register device '{}' (failed to replicate options): {e:#}",
                    device.device_id
                );
                TransportError::Other(e)
            })?;

        let first_device = self.registry.is_empty();
        self.registry.insert(DeviceRecord {
            shared,
            session,
            client,
            queue,
            failures: 0,
            max_state_change_timeout: DEFAULT_STATE_CHANGE_TIMEOUT,
        });

        if self.preferred_mode == AuthenticationMode::Unset && first_device {
            self.preferred_mode = device_mode;
            log::debug!("Transport authentication mode is now fixed to {device_mode:?}");
        }

        log::debug!("Device '{device_id}' was registered");
        Ok(DeviceHandle { device_id })
    }

    fn replicate_device_options(
        &self,
        session: &dyn DeviceSession,
        device_mode: AuthenticationMode,
    ) -> anyhow::Result<()> {
        session.set_option(DeviceSessionOption::EventSendTimeout(
            self.options.event_send_timeout,
        ))?;

        if device_mode == AuthenticationMode::Cbs {
            session.set_option(DeviceSessionOption::CbsRequestTimeout(
                self.options.cbs_request_timeout,
            ))?;
            session.set_option(DeviceSessionOption::SasTokenLifetime(
                self.options.sas_token_lifetime,
            ))?;
            session.set_option(DeviceSessionOption::SasTokenRefreshTime(
                self.options.sas_token_refresh_time,
            ))?;
        }

        Ok(())
    }

    /// Remove the device from the registry and destroy its session. Events
    /// still waiting in the queue are confirmed with `BecauseDestroy`. A
    /// device that is not registered is a no-op with a diagnostic.
    pub fn unregister(&mut self, device: &DeviceHandle) {
        match self.registry.remove(device.device_id()) {
            None => log::error!(
                "Failed to unregister device '{}' (the device is not registered on this transport)",
                device.device_id()
            ),
            Some(record) => {
                record.drain_queue_on_destroy();
                log::debug!("Device '{}' was unregistered", device.device_id());
            }
        }
    }

    /// Start receiving cloud-to-device messages on the device.
    pub fn subscribe(&mut self, device: &DeviceHandle) -> Result<(), TransportError> {
        let record = self
            .registry
            .find(device.device_id())
            .ok_or_else(|| not_registered(device))?;

        let handler = make_message_received_handler(
            Rc::clone(&record.shared.device_id),
            Rc::clone(&record.session),
            Rc::clone(&record.client),
        );

        record.session.subscribe_message(handler).map_err(|e| {
            log::error!(
                "Device '{}' failed subscribing to cloud-to-device messages: {e:#}",
                device.device_id()
            );
            TransportError::Other(e)
        })
    }

    /// Stop receiving cloud-to-device messages. Best-effort.
    pub fn unsubscribe(&mut self, device: &DeviceHandle) {
        match self.registry.find(device.device_id()) {
            None => log::error!(
                "Device '{}' failed unsubscribing from cloud-to-device messages (the device is not registered)",
                device.device_id()
            ),
            Some(record) => {
                if let Err(e) = record.session.unsubscribe_message() {
                    log::error!(
                        "Device '{}' failed unsubscribing from cloud-to-device messages: {e:#}",
                        device.device_id()
                    );
                }
            }
        }
    }

    pub fn send_status(&self, device: &DeviceHandle) -> Result<SendStatus, TransportError> {
        let record = self
            .registry
            .find(device.device_id())
            .ok_or_else(|| not_registered(device))?;

        record.session.send_status().map_err(|e| {
            log::error!(
                "Failed retrieving the send status of device '{}': {e:#}",
                device.device_id()
            );
            TransportError::Other(e)
        })
    }

    /// One cooperative work tick: run the pending connection retry, or
    /// establish the connection and advance every registered device, then let
    /// the connection make progress.
    pub fn do_work(&mut self) {
        if self.supervisor.status().retry_required.get() {
            log::error!("An error occurred on the AMQP connection; it will be re-established");
            self.prepare_for_connection_retry();
            self.supervisor.status().retry_required.set(false);
        } else if !self.registry.is_empty() {
            // Without devices there is no preferred authentication mode yet,
            // so the connection could not be created anyway.
            if !self.supervisor.has_connection() {
                if let Err(e) = self.supervisor.establish(&self.host_fqdn, self.preferred_mode) {
                    log::error!("Transport failed to establish a connection with the service: {e:#}");
                }
            } else if self.supervisor.state() == ConnectionState::Opened {
                let status = Rc::clone(self.supervisor.status());
                if let Some(connection) = self.supervisor.connection() {
                    for record in self.registry.iter_mut() {
                        if record.shared.send_complete_failures.get()
                            >= MAX_CONSECUTIVE_DEVICE_FAILURES
                        {
                            log::error!(
                                "Device '{}' reported a critical failure (event sends keep completing with errors); a connection retry will be triggered",
                                record.device_id()
                            );
                            status.retry_required.set(true);
                        } else if let Err(e) =
                            record.tick(connection, self.preferred_mode, &*self.clock)
                        {
                            log::error!(
                                "Transport work failed for device '{}': {e:#}",
                                record.device_id()
                            );
                            if record.failures >= MAX_CONSECUTIVE_DEVICE_FAILURES {
                                log::error!(
                                    "Device '{}' exhausted its failure budget; a connection retry will be triggered",
                                    record.device_id()
                                );
                                status.retry_required.set(true);
                            }
                        }
                    }
                }
            }
        }

        self.supervisor.do_work();
    }

    fn prepare_for_connection_retry(&mut self) {
        if let Err(e) = self.supervisor.cache_stream_options() {
            log::error!(
                "Failed saving stream options while preparing for connection retry; the failure will be ignored: {e:#}"
            );
        }

        for record in self.registry.iter_mut() {
            record.prepare_for_connection_retry();
        }

        self.supervisor.teardown();
    }

    /// Apply a named option. Device-scoped options become the new defaults and
    /// are pushed to every registered session; `log_trace` goes to the
    /// connection; everything else (including the X509 pair) goes to the byte
    /// stream, creating one if needed.
    pub fn set_option(&mut self, name: &str, value: OptionValue) -> Result<(), TransportError> {
        match name {
            OPTION_SAS_TOKEN_LIFETIME
            | OPTION_SAS_TOKEN_REFRESH_TIME
            | OPTION_CBS_REQUEST_TIMEOUT
            | OPTION_EVENT_SEND_TIMEOUT => self.set_device_option(name, &value),
            OPTION_LOG_TRACE => {
                let OptionValue::Bool(enabled) = value else {
                    return Err(TransportError::InvalidArgument(
                        "the log_trace option takes a boolean value",
                    ));
                };
                self.supervisor.set_trace(enabled).map_err(|e| {
                    log::error!("Transport failed setting option '{name}': {e:#}");
                    TransportError::Other(e)
                })
            }
            _ => {
                if name == OPTION_X509_CERT || name == OPTION_X509_PRIVATE_KEY {
                    match self.preferred_mode {
                        AuthenticationMode::Unset => {
                            self.preferred_mode = AuthenticationMode::X509;
                            log::debug!("Transport authentication mode is now fixed to X509");
                        }
                        AuthenticationMode::X509 => {}
                        AuthenticationMode::Cbs => {
                            log::error!(
                                "Transport failed setting option '{name}' (the preferred authentication mode is not X509)"
                            );
                            return Err(TransportError::InvalidArgument(
                                "X509 options require an unset or X509 authentication mode",
                            ));
                        }
                    }
                }

                self.supervisor
                    .set_stream_option(&self.host_fqdn, name, &value)
                    .map_err(|e| {
                        log::error!(
                            "Transport failed setting option '{name}' on the byte stream: {e:#}"
                        );
                        TransportError::Other(e)
                    })
            }
        }
    }

    fn set_device_option(
        &mut self,
        name: &str,
        value: &OptionValue,
    ) -> Result<(), TransportError> {
        let OptionValue::Seconds(secs) = value else {
            return Err(TransportError::InvalidArgument(
                "device-scoped options take a value in seconds",
            ));
        };
        let duration = Duration::from_secs(*secs);

        let session_option = match name {
            OPTION_SAS_TOKEN_LIFETIME => {
                self.options.sas_token_lifetime = duration;
                DeviceSessionOption::SasTokenLifetime(duration)
            }
            OPTION_SAS_TOKEN_REFRESH_TIME => {
                self.options.sas_token_refresh_time = duration;
                DeviceSessionOption::SasTokenRefreshTime(duration)
            }
            OPTION_CBS_REQUEST_TIMEOUT => {
                self.options.cbs_request_timeout = duration;
                DeviceSessionOption::CbsRequestTimeout(duration)
            }
            _ => {
                self.options.event_send_timeout = duration;
                DeviceSessionOption::EventSendTimeout(duration)
            }
        };

        for record in self.registry.iter() {
            if let Err(e) = record.session.set_option(session_option) {
                log::error!(
                    "Failed setting option '{name}' on registered device '{}': {e:#}",
                    record.device_id()
                );
                return Err(TransportError::Other(e));
            }
        }
        Ok(())
    }

    /// Accepted and ignored; retry behavior is not configurable yet and the
    /// fixed failure threshold applies.
    pub fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        retry_timeout_limit: Duration,
    ) -> Result<(), TransportError> {
        log::debug!(
            "Retry policy {policy:?} (limit {retry_timeout_limit:?}) was accepted but is not interpreted by the AMQP transport"
        );
        Ok(())
    }

    /// Reserved; kept for interface parity with other transports.
    pub fn process_item(&mut self) -> Result<(), TransportError> {
        log::error!("process_item is not supported by the AMQP transport");
        Err(TransportError::NotSupported)
    }

    /// Reserved; twin synchronization is not available over this transport.
    pub fn subscribe_twin(&mut self, _device: &DeviceHandle) -> Result<(), TransportError> {
        log::error!("Twin subscription is not supported by the AMQP transport");
        Err(TransportError::NotSupported)
    }

    /// Reserved; twin synchronization is not available over this transport.
    pub fn unsubscribe_twin(&mut self, _device: &DeviceHandle) {
        log::error!("Twin subscription is not supported by the AMQP transport");
    }

    /// Reserved; direct methods are not implemented yet.
    pub fn subscribe_methods(&mut self, _device: &DeviceHandle) -> Result<(), TransportError> {
        log::error!("Direct method subscription is not implemented");
        Err(TransportError::NotSupported)
    }

    /// Reserved; direct methods are not implemented yet.
    pub fn unsubscribe_methods(&mut self, _device: &DeviceHandle) {
        log::error!("Direct method subscription is not implemented");
    }

    /// Reserved; direct methods are not implemented yet.
    pub fn respond_to_method(
        &mut self,
        _device: &DeviceHandle,
        _status: i32,
        _payload: &[u8],
    ) -> Result<(), TransportError> {
        log::error!("Direct method responses are not implemented");
        Err(TransportError::NotSupported)
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        // Devices go first so their queued events are confirmed; the
        // supervisor then drops the connection before the stream it is built
        // on.
        for record in self.registry.drain() {
            record.drain_queue_on_destroy();
        }
    }
}

fn not_registered(device: &DeviceHandle) -> TransportError {
    log::error!(
        "Device '{}' is not registered on this transport",
        device.device_id()
    );
    TransportError::DeviceNotRegistered(device.device_id().to_owned())
}

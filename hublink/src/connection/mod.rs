//! The shared AMQP connection: the collaborator contract and the supervisor
//! that owns the connection, the byte stream it runs on, and the cached stream
//! options that survive a reconnect.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use crate::device::AuthenticationMode;
use crate::io::{ByteStream, StreamOptionSet, StreamProvider};
use crate::transport::options::OptionValue;

/// Opaque AMQP session handle, passed from the connection to device sessions.
///
/// The transport never looks inside; the connection and session collaborators
/// agree on the concrete type between themselves.
pub type SessionHandle = Rc<dyn Any>;

/// Opaque CBS handle, passed from the connection to device sessions.
pub type CbsHandle = Rc<dyn Any>;

/// State of the shared AMQP connection, as reported through its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Opened,
    Error,
}

/// Callback invoked by the connection with `(previous, new)` whenever its
/// state changes. May fire synchronously from within [`AmqpConnection::do_work`].
pub type ConnectionStateHandler = Box<dyn FnMut(ConnectionState, ConnectionState)>;

/// Everything a connection implementation needs to come up.
pub struct ConnectionConfig {
    pub host_fqdn: String,
    pub stream: Rc<dyn ByteStream>,
    pub trace_enabled: bool,
    /// CBS authentication needs a SASL layer; X509 runs straight on the
    /// stream.
    pub create_sasl_io: bool,
    pub create_cbs_connection: bool,
    pub on_state_changed: ConnectionStateHandler,
}

/// The AMQP connection collaborator.
///
/// Handles are only valid while the connection reports [`ConnectionState::Opened`];
/// [`AmqpConnection::cbs_handle`] fails when the connection was created without
/// `create_cbs_connection`.
pub trait AmqpConnection {
    fn session_handle(&self) -> Result<SessionHandle>;
    fn cbs_handle(&self) -> Result<CbsHandle>;
    fn set_trace(&self, enabled: bool) -> Result<()>;
    /// Advance I/O. Non-blocking; may synchronously fire the state callback.
    fn do_work(&self);
}

pub trait ConnectionFactory {
    fn create(&self, config: ConnectionConfig) -> Result<Box<dyn AmqpConnection>>;
}

/// Connection state shared between the transport and the state-change
/// callback handed to the connection.
pub(crate) struct ConnectionStatus {
    pub(crate) state: Cell<ConnectionState>,
    pub(crate) retry_required: Cell<bool>,
}

/// Owns the byte stream and the AMQP connection and drives their lifecycles:
/// establish, option replay, teardown for retry.
pub(crate) struct ConnectionSupervisor {
    provider: Box<dyn StreamProvider>,
    factory: Box<dyn ConnectionFactory>,
    // The connection is declared before the stream so it drops first; it is
    // built on top of the stream.
    connection: Option<Box<dyn AmqpConnection>>,
    stream: Option<Rc<dyn ByteStream>>,
    cached_options: Option<Box<dyn StreamOptionSet>>,
    status: Rc<ConnectionStatus>,
    trace_enabled: bool,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        provider: Box<dyn StreamProvider>,
        factory: Box<dyn ConnectionFactory>,
    ) -> Self {
        ConnectionSupervisor {
            provider,
            factory,
            connection: None,
            stream: None,
            cached_options: None,
            status: Rc::new(ConnectionStatus {
                state: Cell::new(ConnectionState::Closed),
                retry_required: Cell::new(false),
            }),
            trace_enabled: false,
        }
    }

    pub(crate) fn status(&self) -> &Rc<ConnectionStatus> {
        &self.status
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.status.state.get()
    }

    pub(crate) fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn connection(&self) -> Option<&dyn AmqpConnection> {
        self.connection.as_deref()
    }

    fn obtain_stream(&mut self, host_fqdn: &str) -> Result<Rc<dyn ByteStream>> {
        if let Some(stream) = &self.stream {
            return Ok(Rc::clone(stream));
        }

        let stream = self
            .provider
            .create(host_fqdn)
            .context("failed to obtain a byte stream from the provider")?;

        if let Some(options) = &self.cached_options {
            // Ignored on failure; worst case the stream comes up with default
            // options and fails later, recreating it through retry.
            if let Err(e) = options.feed(stream.as_ref()) {
                log::error!("Failed to replay cached I/O options onto the new stream: {e:#}");
            }
        }

        self.stream = Some(Rc::clone(&stream));
        Ok(stream)
    }

    pub(crate) fn establish(
        &mut self,
        host_fqdn: &str,
        auth_mode: AuthenticationMode,
    ) -> Result<()> {
        let (create_sasl_io, create_cbs_connection) = match auth_mode {
            AuthenticationMode::Cbs => (true, true),
            AuthenticationMode::X509 => (false, false),
            AuthenticationMode::Unset => {
                bail!("the transport has no preferred authentication mode set")
            }
        };

        let stream = self.obtain_stream(host_fqdn)?;

        let status = Rc::clone(&self.status);
        let on_state_changed: ConnectionStateHandler = Box::new(move |previous, new| {
            if new == previous {
                return;
            }
            status.state.set(new);
            if new == ConnectionState::Error {
                log::error!(
                    "The AMQP connection reported an error (state changed {previous:?} -> {new:?}); a connection retry will be triggered"
                );
                status.retry_required.set(true);
            } else {
                log::debug!("The AMQP connection changed state {previous:?} -> {new:?}");
            }
        });

        self.status.state.set(ConnectionState::Closed);

        let connection = self
            .factory
            .create(ConnectionConfig {
                host_fqdn: host_fqdn.to_owned(),
                stream,
                trace_enabled: self.trace_enabled,
                create_sasl_io,
                create_cbs_connection,
                on_state_changed,
            })
            .context("failed to create the AMQP connection")?;

        self.connection = Some(connection);
        Ok(())
    }

    /// Snapshot the current stream options into the cache, replacing any
    /// previously cached set.
    pub(crate) fn cache_stream_options(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .context("there is no byte stream to retrieve options from")?;
        let fresh = stream
            .retrieve_options()
            .context("failed to retrieve the stream options")?;
        self.cached_options = Some(fresh);
        Ok(())
    }

    /// Drop the connection and the stream. Cached options are kept so the
    /// replacement stream can be configured like the old one.
    pub(crate) fn teardown(&mut self) {
        self.connection = None;
        self.status.state.set(ConnectionState::Closed);
        self.stream = None;
    }

    pub(crate) fn set_stream_option(
        &mut self,
        host_fqdn: &str,
        name: &str,
        value: &OptionValue,
    ) -> Result<()> {
        let stream = self.obtain_stream(host_fqdn)?;
        stream
            .set_option(name, value)
            .with_context(|| format!("the byte stream rejected option '{name}'"))?;

        if let Err(e) = self.cache_stream_options() {
            log::error!("Failed to re-cache stream options after setting '{name}'; the failure will be ignored: {e:#}");
        }
        Ok(())
    }

    pub(crate) fn set_trace(&mut self, enabled: bool) -> Result<()> {
        self.trace_enabled = enabled;
        match &self.connection {
            Some(connection) => connection
                .set_trace(enabled)
                .context("the connection rejected the trace toggle"),
            None => Ok(()),
        }
    }

    pub(crate) fn do_work(&self) {
        if let Some(connection) = &self.connection {
            connection.do_work();
        }
    }
}

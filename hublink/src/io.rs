//! The underlying secure byte stream and its option plumbing.
//!
//! The transport never performs I/O itself. It obtains streams from a
//! [`StreamProvider`], hands them to the AMQP connection, and keeps a snapshot
//! of their options so that a replacement stream created during a connection
//! retry behaves like the one it replaces.

use std::rc::Rc;

use anyhow::Result;

use crate::transport::options::OptionValue;

/// The secure byte stream underneath the AMQP connection (TLS, WebSockets or
/// whatever else the provider produces).
///
/// Implementations keep their own interior mutability; the transport only
/// holds shared handles and controls the stream's lifetime by dropping them.
pub trait ByteStream {
    /// Apply a single named option to the stream.
    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()>;

    /// Snapshot the options currently configured on the stream so they can be
    /// replayed onto a replacement stream after a reconnect.
    fn retrieve_options(&self) -> Result<Box<dyn StreamOptionSet>>;
}

/// A saved set of stream options that can be fed back into a fresh stream.
pub trait StreamOptionSet {
    fn feed(&self, target: &dyn ByteStream) -> Result<()>;
}

/// Factory producing a fresh byte stream connected to the given host.
pub trait StreamProvider {
    fn create(&self, host_fqdn: &str) -> Result<Rc<dyn ByteStream>>;
}

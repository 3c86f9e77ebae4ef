//! The device registry and the per-device lifecycle state machine driven by
//! the transport's work tick.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use crate::connection::AmqpConnection;
use crate::messaging::disposition::CloudMessageHandler;
use crate::messaging::{ConfirmationResult, EventQueue, PendingEvent};
use crate::utils::clock::Clock;
use session::{D2cSendResult, DeviceSession};

pub mod session;

/// Consecutive failures a single device may accumulate before the whole
/// transport is flagged for a connection retry. The same budget applies
/// independently to event-send completions.
pub const MAX_CONSECUTIVE_DEVICE_FAILURES: u32 = 5;

pub(crate) const DEFAULT_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Authentication scheme shared by every device on one transport. Fixed by
/// the first registration, or by an X509 option, and never changed afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMode {
    Unset,
    Cbs,
    X509,
}

/// Lifecycle state of a device session, reported through its state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Starting,
    Started,
    Stopping,
    ErrorAuth,
    ErrorAuthTimeout,
    ErrorMsg,
}

impl DeviceState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            DeviceState::ErrorAuth | DeviceState::ErrorAuthTimeout | DeviceState::ErrorMsg
        )
    }
}

/// Per-device state written by synchronous session callbacks and read by the
/// driver within the same tick.
pub(crate) struct DeviceShared {
    pub(crate) device_id: Rc<str>,
    pub(crate) state: Cell<DeviceState>,
    pub(crate) state_changed_at: Cell<Option<Instant>>,
    pub(crate) send_complete_failures: Cell<u32>,
}

/// One registered device: its session, client, queue and failure accounting.
pub(crate) struct DeviceRecord {
    pub(crate) shared: Rc<DeviceShared>,
    pub(crate) session: Rc<dyn DeviceSession>,
    pub(crate) client: Rc<dyn CloudMessageHandler>,
    pub(crate) queue: EventQueue,
    pub(crate) failures: u32,
    pub(crate) max_state_change_timeout: Duration,
}

impl DeviceRecord {
    pub(crate) fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub(crate) fn state(&self) -> DeviceState {
        self.shared.state.get()
    }

    /// One work tick for this device: start it when stopped, watch
    /// transitional states for timeouts, recover from errors within the
    /// failure budget, and drain outbound events when started.
    ///
    /// Requires an established connection; the caller only invokes this while
    /// the connection reports `Opened`.
    pub(crate) fn tick(
        &mut self,
        connection: &dyn AmqpConnection,
        preferred_mode: AuthenticationMode,
        clock: &dyn Clock,
    ) -> Result<()> {
        let result = match self.state() {
            DeviceState::Started => match self.drain_pending_events() {
                Ok(()) => {
                    self.failures = 0;
                    Ok(())
                }
                Err(e) => {
                    self.failures += 1;
                    Err(e)
                }
            },
            DeviceState::Stopped => self.begin_start(connection, preferred_mode),
            DeviceState::Starting | DeviceState::Stopping => {
                self.check_state_change_timeout(clock)
            }
            state => self.recover_from_error(state),
        };

        // Harmless when the session is not started.
        self.session.do_work();

        result
    }

    fn begin_start(
        &self,
        connection: &dyn AmqpConnection,
        preferred_mode: AuthenticationMode,
    ) -> Result<()> {
        let session_handle = connection.session_handle().with_context(|| {
            format!(
                "device '{}': failed to get the session handle from the connection",
                self.device_id()
            )
        })?;

        let cbs_handle = if preferred_mode == AuthenticationMode::Cbs {
            Some(connection.cbs_handle().with_context(|| {
                format!(
                    "device '{}': failed to get the CBS handle from the connection",
                    self.device_id()
                )
            })?)
        } else {
            None
        };

        self.session
            .start(session_handle, cbs_handle)
            .with_context(|| format!("device '{}': failed to start the session", self.device_id()))
    }

    fn check_state_change_timeout(&self, clock: &dyn Clock) -> Result<()> {
        match is_timeout_reached(
            self.shared.state_changed_at.get(),
            self.max_state_change_timeout,
            clock,
        ) {
            Err(e) => {
                // If time cannot be read, the worst must be assumed.
                log::error!(
                    "Device '{}' failed tracking the timeout of state {:?}: {e:#}",
                    self.device_id(),
                    self.state()
                );
                self.shared.state.set(DeviceState::ErrorAuth);
                Err(e)
            }
            Ok(true) => {
                log::error!(
                    "Device '{}' did not complete its {:?} state change within {:?}",
                    self.device_id(),
                    self.state(),
                    self.max_state_change_timeout
                );
                self.shared.state.set(DeviceState::ErrorAuth);
                bail!("device '{}' timed out changing state", self.device_id())
            }
            Ok(false) => Ok(()),
        }
    }

    fn recover_from_error(&mut self, state: DeviceState) -> Result<()> {
        self.failures += 1;
        log::error!(
            "Device '{}' reported state {state:?} ({} consecutive failures)",
            self.device_id(),
            self.failures
        );

        if self.failures >= MAX_CONSECUTIVE_DEVICE_FAILURES {
            bail!("device '{}' exhausted its failure budget", self.device_id());
        }

        self.session.stop().with_context(|| {
            format!(
                "device '{}': failed to stop the session for recovery",
                self.device_id()
            )
        })
    }

    /// Hand every waiting event to the session, oldest first. A refused
    /// submission completes synthetically with `FailSending` and aborts the
    /// drain for this tick.
    fn drain_pending_events(&mut self) -> Result<()> {
        loop {
            // The queue borrow must end before the session is invoked; a
            // synchronous completion may enqueue follow-up events.
            let next = self.queue.borrow_mut().pop_front();
            let Some(event) = next else { break };

            let pending = PendingEvent::new(event, Rc::clone(&self.shared));
            if let Err(rejected) = self.session.send_event_async(pending) {
                rejected.complete(D2cSendResult::FailSending);
                bail!(
                    "device '{}': the session refused an event submission",
                    self.device_id()
                );
            }
        }
        Ok(())
    }

    /// Stop a non-stopped session and forget past failures before the shared
    /// connection is re-established.
    pub(crate) fn prepare_for_connection_retry(&mut self) {
        if self.state() != DeviceState::Stopped {
            if let Err(e) = self.session.stop() {
                log::error!(
                    "Failed preparing device '{}' for connection retry (stop failed): {e:#}",
                    self.device_id()
                );
            }
        }

        self.failures = 0;
        self.shared.send_complete_failures.set(0);
    }

    /// Confirm every event still waiting in the queue with `BecauseDestroy`;
    /// the registration is going away and the caller must be able to free its
    /// resources. The queue itself belongs to the caller and stays intact.
    pub(crate) fn drain_queue_on_destroy(&self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(event) = next else { break };
            event.confirm(ConfirmationResult::BecauseDestroy);
        }
    }
}

/// Whether a device's credentials can coexist with the transport's preferred
/// authentication mode.
pub(crate) fn is_credential_acceptable(
    device_id: &str,
    primary_key: Option<&str>,
    sas_token: Option<&str>,
    preferred_mode: AuthenticationMode,
) -> bool {
    if primary_key.is_some() && sas_token.is_some() {
        log::error!(
            "Credential of device '{device_id}' is not acceptable (provide either a primary key or a SAS token, not both)"
        );
        return false;
    }

    match preferred_mode {
        AuthenticationMode::Unset => true,
        AuthenticationMode::X509 if primary_key.is_some() || sas_token.is_some() => {
            log::error!(
                "Credential of device '{device_id}' is not acceptable (the transport uses X509 authentication, but the device carries a key or SAS token)"
            );
            false
        }
        AuthenticationMode::Cbs if primary_key.is_none() && sas_token.is_none() => {
            log::error!(
                "Credential of device '{device_id}' is not acceptable (the transport uses CBS authentication, but the device carries neither a key nor a SAS token)"
            );
            false
        }
        _ => true,
    }
}

/// Whether timeout_in has elapsed since `start`. Fails when either the start
/// stamp or the current time is indefinite.
fn is_timeout_reached(start: Option<Instant>, timeout: Duration, clock: &dyn Clock) -> Result<bool> {
    let start = start.ok_or_else(|| anyhow!("the last state-change time is indefinite"))?;
    let now = clock
        .now()
        .ok_or_else(|| anyhow!("the clock returned an indefinite time"))?;
    Ok(now.saturating_duration_since(start) >= timeout)
}

/// The set of devices registered on one transport, in registration order.
pub(crate) struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        DeviceRegistry {
            devices: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.devices.len()
    }

    pub(crate) fn contains(&self, device_id: &str) -> bool {
        self.find(device_id).is_some()
    }

    pub(crate) fn find(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|r| r.device_id() == device_id)
    }

    pub(crate) fn insert(&mut self, record: DeviceRecord) {
        self.devices.push(record);
    }

    pub(crate) fn remove(&mut self, device_id: &str) -> Option<DeviceRecord> {
        let index = self
            .devices
            .iter()
            .position(|r| r.device_id() == device_id)?;
        Some(self.devices.remove(index))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.iter_mut()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = DeviceRecord> + '_ {
        self.devices.drain(..)
    }
}

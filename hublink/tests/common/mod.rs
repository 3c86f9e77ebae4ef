//! Scripted collaborators for driving a transport end to end: a manual
//! clock, a recording byte stream and provider, a controllable AMQP
//! connection and a controllable device session.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use hublink::{
    AmqpConnection, AmqpTransport, ByteStream, CbsHandle, Clock, CloudMessage,
    CloudMessageHandler, ConnectionConfig, ConnectionFactory, ConnectionState,
    ConnectionStateHandler, D2cSendResult, DeliveryInfo, DeviceAuth, DeviceConfig, DeviceHandle,
    DeviceSession, DeviceSessionConfig, DeviceSessionFactory, DeviceSessionOption, DeviceState,
    DeviceStateHandler, DispositionInfo, EventQueue, HostName, InboundMessage,
    MessageReceivedHandler, OptionValue, PendingEvent, Protocol, SendStatus, SessionDisposition,
    SessionHandle, StreamOptionSet, StreamProvider, TransportConfig,
};

pub struct ManualClock {
    now: Cell<Option<Instant>>,
}

impl ManualClock {
    pub fn new() -> Rc<Self> {
        Rc::new(ManualClock {
            now: Cell::new(Some(Instant::now())),
        })
    }

    pub fn advance(&self, by: Duration) {
        if let Some(now) = self.now.get() {
            self.now.set(Some(now + by));
        }
    }

    /// Make every subsequent reading indefinite.
    pub fn break_clock(&self) {
        self.now.set(None);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Option<Instant> {
        self.now.get()
    }
}

#[derive(Default)]
pub struct FakeStream {
    pub options_set: RefCell<Vec<(String, OptionValue)>>,
    pub fail_set_option: Cell<bool>,
    pub fail_retrieve: Cell<bool>,
}

impl ByteStream for FakeStream {
    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        if self.fail_set_option.get() {
            bail!("the stream rejected option '{name}'");
        }
        self.options_set
            .borrow_mut()
            .push((name.to_owned(), value.clone()));
        Ok(())
    }

    fn retrieve_options(&self) -> Result<Box<dyn StreamOptionSet>> {
        if self.fail_retrieve.get() {
            bail!("the stream failed to snapshot its options");
        }
        Ok(Box::new(FakeOptionSet {
            options: self.options_set.borrow().clone(),
        }))
    }
}

pub struct FakeOptionSet {
    options: Vec<(String, OptionValue)>,
}

impl StreamOptionSet for FakeOptionSet {
    fn feed(&self, target: &dyn ByteStream) -> Result<()> {
        for (name, value) in &self.options {
            target.set_option(name, value)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StreamProviderState {
    pub streams: RefCell<Vec<Rc<FakeStream>>>,
    pub fail: Cell<bool>,
}

pub struct FakeStreamProvider(pub Rc<StreamProviderState>);

impl StreamProvider for FakeStreamProvider {
    fn create(&self, host_fqdn: &str) -> Result<Rc<dyn ByteStream>> {
        if self.0.fail.get() {
            bail!("no stream available for '{host_fqdn}'");
        }
        let stream = Rc::new(FakeStream::default());
        self.0.streams.borrow_mut().push(Rc::clone(&stream));
        Ok(stream)
    }
}

/// Handle the factory keeps for every connection it produced; tests use it to
/// fire state transitions and observe the connection's fate.
pub struct ConnectionControl {
    state_handler: RefCell<Option<ConnectionStateHandler>>,
    last_state: Cell<ConnectionState>,
    pub create_sasl_io: Cell<bool>,
    pub create_cbs_connection: Cell<bool>,
    pub trace: Cell<bool>,
    pub alive: Cell<bool>,
    pub do_work_calls: Cell<usize>,
}

impl ConnectionControl {
    pub fn set_state(&self, new: ConnectionState) {
        let previous = self.last_state.replace(new);
        if let Some(handler) = self.state_handler.borrow_mut().as_mut() {
            handler(previous, new);
        }
    }

    /// Walk the connection through Opening into Opened.
    pub fn open(&self) {
        self.set_state(ConnectionState::Opening);
        self.set_state(ConnectionState::Opened);
    }

    pub fn fail(&self) {
        self.set_state(ConnectionState::Error);
    }
}

pub struct FakeConnection {
    control: Rc<ConnectionControl>,
}

impl AmqpConnection for FakeConnection {
    fn session_handle(&self) -> Result<SessionHandle> {
        Ok(Rc::new("amqp-session"))
    }

    fn cbs_handle(&self) -> Result<CbsHandle> {
        if !self.control.create_cbs_connection.get() {
            bail!("the connection was created without a CBS link");
        }
        Ok(Rc::new("cbs"))
    }

    fn set_trace(&self, enabled: bool) -> Result<()> {
        self.control.trace.set(enabled);
        Ok(())
    }

    fn do_work(&self) {
        self.control
            .do_work_calls
            .set(self.control.do_work_calls.get() + 1);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.control.alive.set(false);
    }
}

#[derive(Default)]
pub struct ConnectionFactoryState {
    pub connections: RefCell<Vec<Rc<ConnectionControl>>>,
    pub fail: Cell<bool>,
}

pub struct FakeConnectionFactory(pub Rc<ConnectionFactoryState>);

impl ConnectionFactory for FakeConnectionFactory {
    fn create(&self, config: ConnectionConfig) -> Result<Box<dyn AmqpConnection>> {
        if self.0.fail.get() {
            bail!("connection refused");
        }
        let control = Rc::new(ConnectionControl {
            state_handler: RefCell::new(Some(config.on_state_changed)),
            last_state: Cell::new(ConnectionState::Closed),
            create_sasl_io: Cell::new(config.create_sasl_io),
            create_cbs_connection: Cell::new(config.create_cbs_connection),
            trace: Cell::new(config.trace_enabled),
            alive: Cell::new(true),
            do_work_calls: Cell::new(0),
        });
        self.0.connections.borrow_mut().push(Rc::clone(&control));
        Ok(Box::new(FakeConnection { control }))
    }
}

/// A device session whose lifecycle the test scripts: what state to report on
/// start and stop, whether to accept submissions, and what it recorded.
pub struct FakeSession {
    pub device_id: String,
    pub auth: DeviceAuth,
    state_handler: RefCell<Option<DeviceStateHandler>>,
    current_state: Cell<DeviceState>,
    pub options: RefCell<Vec<DeviceSessionOption>>,
    pub start_calls: Cell<usize>,
    pub stop_calls: Cell<usize>,
    pub do_work_calls: Cell<usize>,
    pub last_start_had_cbs: Cell<Option<bool>>,
    pub fail_start: Cell<bool>,
    pub fail_stop: Cell<bool>,
    /// State reported synchronously when `start` succeeds.
    pub state_on_start: Cell<Option<DeviceState>>,
    /// State reported synchronously when `stop` succeeds.
    pub state_on_stop: Cell<Option<DeviceState>>,
    pub accepted: RefCell<VecDeque<PendingEvent>>,
    pub reject_sends: Cell<bool>,
    message_handler: RefCell<Option<MessageReceivedHandler>>,
    pub subscribed: Cell<bool>,
    pub dispositions: RefCell<Vec<(DispositionInfo, SessionDisposition)>>,
    pub fail_disposition: Cell<bool>,
    pub send_status_value: Cell<SendStatus>,
}

impl FakeSession {
    fn new(config: DeviceSessionConfig) -> Self {
        FakeSession {
            device_id: config.device_id,
            auth: config.auth,
            state_handler: RefCell::new(Some(config.on_state_changed)),
            current_state: Cell::new(DeviceState::Stopped),
            options: RefCell::new(Vec::new()),
            start_calls: Cell::new(0),
            stop_calls: Cell::new(0),
            do_work_calls: Cell::new(0),
            last_start_had_cbs: Cell::new(None),
            fail_start: Cell::new(false),
            fail_stop: Cell::new(false),
            state_on_start: Cell::new(Some(DeviceState::Starting)),
            state_on_stop: Cell::new(Some(DeviceState::Stopped)),
            accepted: RefCell::new(VecDeque::new()),
            reject_sends: Cell::new(false),
            message_handler: RefCell::new(None),
            subscribed: Cell::new(false),
            dispositions: RefCell::new(Vec::new()),
            fail_disposition: Cell::new(false),
            send_status_value: Cell::new(SendStatus::Idle),
        }
    }

    /// Report a state change to the transport, as the real session would from
    /// within its own work cycle.
    pub fn transition(&self, new: DeviceState) {
        let previous = self.current_state.replace(new);
        if let Some(handler) = self.state_handler.borrow_mut().as_mut() {
            handler(previous, new);
        }
    }

    /// Deliver a cloud-to-device message through the subscribed handler.
    pub fn deliver(
        &self,
        message: CloudMessage,
        delivery: DeliveryInfo,
    ) -> Option<SessionDisposition> {
        let mut handler = self.message_handler.borrow_mut();
        let handler = handler.as_mut().expect("no message handler subscribed");
        handler(message, delivery)
    }

    /// Complete the oldest accepted event with the given result.
    pub fn complete_next(&self, result: D2cSendResult) {
        let event = self
            .accepted
            .borrow_mut()
            .pop_front()
            .expect("no pending event to complete");
        event.complete(result);
    }
}

impl DeviceSession for FakeSession {
    fn set_option(&self, option: DeviceSessionOption) -> Result<()> {
        self.options.borrow_mut().push(option);
        Ok(())
    }

    fn start(&self, _session: SessionHandle, cbs: Option<CbsHandle>) -> Result<()> {
        self.start_calls.set(self.start_calls.get() + 1);
        self.last_start_had_cbs.set(Some(cbs.is_some()));
        if self.fail_start.get() {
            bail!("start refused");
        }
        if let Some(state) = self.state_on_start.get() {
            self.transition(state);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_calls.set(self.stop_calls.get() + 1);
        if self.fail_stop.get() {
            bail!("stop refused");
        }
        if let Some(state) = self.state_on_stop.get() {
            self.transition(state);
        }
        Ok(())
    }

    fn send_event_async(&self, event: PendingEvent) -> std::result::Result<(), PendingEvent> {
        if self.reject_sends.get() {
            return Err(event);
        }
        self.accepted.borrow_mut().push_back(event);
        Ok(())
    }

    fn subscribe_message(&self, handler: MessageReceivedHandler) -> Result<()> {
        *self.message_handler.borrow_mut() = Some(handler);
        self.subscribed.set(true);
        Ok(())
    }

    fn unsubscribe_message(&self) -> Result<()> {
        *self.message_handler.borrow_mut() = None;
        self.subscribed.set(false);
        Ok(())
    }

    fn send_message_disposition(
        &self,
        info: &DispositionInfo,
        verdict: SessionDisposition,
    ) -> Result<()> {
        if self.fail_disposition.get() {
            bail!("disposition refused");
        }
        self.dispositions.borrow_mut().push((info.clone(), verdict));
        Ok(())
    }

    fn send_status(&self) -> Result<SendStatus> {
        Ok(self.send_status_value.get())
    }

    fn do_work(&self) {
        self.do_work_calls.set(self.do_work_calls.get() + 1);
    }
}

#[derive(Default)]
pub struct SessionFactoryState {
    pub sessions: RefCell<Vec<Rc<FakeSession>>>,
    pub fail: Cell<bool>,
}

pub struct FakeSessionFactory(pub Rc<SessionFactoryState>);

impl DeviceSessionFactory for FakeSessionFactory {
    fn create(&self, config: DeviceSessionConfig) -> Result<Rc<dyn DeviceSession>> {
        if self.0.fail.get() {
            bail!("session creation refused");
        }
        let session = Rc::new(FakeSession::new(config));
        self.0.sessions.borrow_mut().push(Rc::clone(&session));
        Ok(session)
    }
}

/// Client that records delivered messages, or refuses them on demand.
#[derive(Default)]
pub struct RecordingClient {
    pub messages: RefCell<Vec<InboundMessage>>,
    pub refuse: Cell<bool>,
}

impl CloudMessageHandler for RecordingClient {
    fn on_message(&self, message: InboundMessage) -> bool {
        if self.refuse.get() {
            return false;
        }
        self.messages.borrow_mut().push(message);
        true
    }
}

pub fn new_queue() -> EventQueue {
    Rc::new(RefCell::new(VecDeque::new()))
}

/// A transport wired to scripted collaborators, with handles to all of them.
pub struct Harness {
    pub transport: AmqpTransport,
    pub streams: Rc<StreamProviderState>,
    pub connections: Rc<ConnectionFactoryState>,
    pub sessions: Rc<SessionFactoryState>,
    pub clock: Rc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let streams = Rc::new(StreamProviderState::default());
        let connections = Rc::new(ConnectionFactoryState::default());
        let sessions = Rc::new(SessionFactoryState::default());
        let clock = ManualClock::new();

        let transport = AmqpTransport::new(
            TransportConfig {
                host: HostName::HubDomain {
                    iothub_name: "contoso".to_owned(),
                    iothub_suffix: "example-hub.net".to_owned(),
                },
                protocol: Protocol::Amqp,
                clock: Some(Rc::clone(&clock) as Rc<dyn Clock>),
            },
            Box::new(FakeStreamProvider(Rc::clone(&streams))),
            Box::new(FakeConnectionFactory(Rc::clone(&connections))),
            Box::new(FakeSessionFactory(Rc::clone(&sessions))),
        )
        .expect("failed to create the transport");

        Harness {
            transport,
            streams,
            connections,
            sessions,
            clock,
        }
    }

    pub fn register_device(
        &mut self,
        device_id: &str,
        client: Rc<RecordingClient>,
    ) -> (DeviceHandle, EventQueue) {
        let queue = new_queue();
        let handle = self
            .transport
            .register(
                DeviceConfig {
                    device_id: device_id.to_owned(),
                    primary_key: Some("device-key".to_owned()),
                    sas_token: None,
                },
                client,
                Rc::clone(&queue),
            )
            .expect("registration failed");
        (handle, queue)
    }

    pub fn register_cbs_device(
        &mut self,
        device_id: &str,
    ) -> (DeviceHandle, EventQueue, Rc<RecordingClient>) {
        let client = Rc::new(RecordingClient::default());
        let (handle, queue) = self.register_device(device_id, Rc::clone(&client));
        (handle, queue, client)
    }

    pub fn session(&self, index: usize) -> Rc<FakeSession> {
        Rc::clone(&self.sessions.sessions.borrow()[index])
    }

    pub fn connection(&self) -> Rc<ConnectionControl> {
        Rc::clone(
            self.connections
                .connections
                .borrow()
                .last()
                .expect("no connection was created"),
        )
    }

    pub fn stream(&self) -> Rc<FakeStream> {
        Rc::clone(
            self.streams
                .streams
                .borrow()
                .last()
                .expect("no stream was created"),
        )
    }

    /// Tick once to establish the connection, then walk it into Opened.
    pub fn open_connection(&mut self) {
        self.transport.do_work();
        self.connection().open();
    }
}

//! Periodic polling of a device cluster and publication of the decoded values.
//!
//! A [`Coordinator`] owns the Modbus session with one controller. Every poll cycle reads all
//! configured, compatible and enabled registers one after another and publishes the assembled
//! [`PollResult`] as a single [`Snapshot`] through a watch channel, so subscribers observe
//! either the previous or the new result, never a mix. Writes share the session with the poll
//! cycle and are followed by an out-of-band refresh.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, EncodeError, Value};
use crate::compatibility;
use crate::config::{self, ClusterConfig, PollSettings};
use crate::connection::{self, Connection};
use crate::disabled::DisabledRegisters;
use crate::modbus::Exception;
use crate::registers::{self, DeviceKind, RegisterTemplate, RegisterType};
use crate::transport::{self, RawClient, Transport};

/// Establishes new client sessions whenever the coordinator is disconnected.
pub trait Connector: Send + Sync + 'static {
    type Client: RawClient + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Client, connection::Error>> + Send;
}

pub struct TcpConnector {
    args: connection::Args,
}

impl TcpConnector {
    pub fn new(args: connection::Args) -> Self {
        Self { args }
    }
}

impl Connector for TcpConnector {
    type Client = Connection;

    async fn connect(&self) -> Result<Connection, connection::Error> {
        Connection::connect(&self.args).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// A session is established and being polled.
    Polling,
    /// Terminal.
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum WriteRejected {
    #[error("{kind} has no register named `{key}`")]
    UnknownTemplate { kind: DeviceKind, key: String },
    #[error("`{key}` of {kind} is read-only")]
    NotWriteable { kind: DeviceKind, key: &'static str },
    #[error("{kind} {index} is not configured, there are {configured} instances")]
    IndexOutOfRange { kind: DeviceKind, index: u8, configured: u8 },
    #[error("the value cannot be encoded")]
    Encode(#[from] EncodeError),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not connect to the controller")]
    Connect(#[source] connection::Error),
    #[error("lost the connection to the controller while accessing register {address}")]
    ConnectionLost {
        address: u16,
        #[source]
        source: transport::Error,
    },
    #[error("could not read `{sensor}` at register {address}")]
    RegisterRead {
        address: u16,
        sensor: String,
        #[source]
        source: transport::Error,
    },
    #[error("the controller rejected the read of register {address} with {exception}")]
    FatalProtocol { address: u16, exception: Exception },
    #[error("the Modbus client can not be used with the controller")]
    UnsupportedClient(#[source] transport::Error),
    #[error("the coordinator has been shut down")]
    Shutdown,
    #[error("write rejected")]
    WriteRejected(#[from] WriteRejected),
    #[error("could not write register {address}")]
    Write {
        address: u16,
        #[source]
        source: transport::Error,
    },
}

/// Values decoded by one poll cycle, keyed by sensor id.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct PollResult {
    pub values: BTreeMap<String, Value>,
    pub polled_at: Option<jiff::Timestamp>,
}

impl PollResult {
    pub fn get(&self, sensor: &str) -> Option<&Value> {
        self.values.get(sensor)
    }
}

#[derive(Clone, Debug)]
pub enum UpdateStatus {
    /// No cycle has completed yet.
    Pending,
    Updated,
    /// The latest cycle failed, [`Snapshot::result`] is from an earlier one.
    Failed(Arc<Error>),
}

#[derive(Clone, Debug)]
pub struct Snapshot {
    pub result: Arc<PollResult>,
    pub status: UpdateStatus,
}

/// A register scheduled for reading in a cycle.
#[derive(Debug)]
struct Planned {
    sensor: String,
    address: u16,
    template: &'static RegisterTemplate,
}

fn plan(settings: &PollSettings, disabled: &DisabledRegisters) -> Vec<Planned> {
    let mut planned = Vec::new();
    let instances = std::iter::once((DeviceKind::General, 1)).chain(
        DeviceKind::INDEXED
            .into_iter()
            .flat_map(|kind| (1..=settings.devices.count(kind)).map(move |index| (kind, index))),
    );
    for (kind, index) in instances {
        let templates = compatibility::compatible(kind.templates(), settings.firmware_tier);
        for template in templates.into_values() {
            let address = registers::absolute(kind, index, template.offset);
            if disabled.is_disabled(address) {
                continue;
            }
            let sensor = registers::sensor_id(kind, index, template, settings.legacy_names);
            planned.push(Planned { sensor, address, template });
        }
    }
    planned.sort_by_key(|p| p.address);
    planned
}

async fn read<C: RawClient>(
    transport: &mut Transport<C>,
    register: &Planned,
    slave_id: u8,
) -> Result<Value, transport::Error> {
    let count = register.template.data_type.words() as u16;
    let raw = match register.template.register_type {
        RegisterType::Holding => {
            transport.read_holding_registers(register.address, count, slave_id).await?
        }
        RegisterType::Input => {
            transport.read_input_registers(register.address, count, slave_id).await?
        }
    };
    Ok(codec::decode_template(&raw, register.template))
}

struct Session<C> {
    transport: Option<Transport<C>>,
    settings: PollSettings,
}

/// Whether the session has to be re-established after `error`.
fn ends_session(error: &transport::Error) -> bool {
    error.is_connection_lost()
        || error.is_unsupported_client()
        || error.exception().is_some_and(|e| e.is_illegal_function())
}

/// A transport taken out of the session.
///
/// Dropping this before the transport is handed back, as happens when a cycle or write future
/// is cancelled, leaves the session without a transport and marks the coordinator disconnected.
struct Checkout<'a, C> {
    state: &'a watch::Sender<ConnectionState>,
    transport: Option<Transport<C>>,
}

impl<C> Checkout<'_, C> {
    fn transport(&mut self) -> Result<&mut Transport<C>, Error> {
        self.transport.as_mut().ok_or(Error::Shutdown)
    }
}

impl<C> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            self.state.send_if_modified(|state| {
                let connected = *state == ConnectionState::Polling;
                if connected {
                    *state = ConnectionState::Disconnected;
                }
                connected
            });
        }
    }
}

pub struct Coordinator<C: Connector> {
    connector: C,
    /// Held for the duration of a whole cycle or a whole write.
    session: Mutex<Session<C::Client>>,
    disabled: DisabledRegisters,
    snapshot: watch::Sender<Snapshot>,
    state: watch::Sender<ConnectionState>,
    refresh_requested: Notify,
}

impl Coordinator<TcpConnector> {
    /// Build a coordinator talking Modbus TCP, loading the disabled register list on the way.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, config::Error> {
        config.validate()?;
        let disabled = DisabledRegisters::load(&config.disabled_registers)?;
        info!(
            message = "loaded the disabled register list",
            path = ?config.disabled_registers,
            count = disabled.len()
        );
        let connector = TcpConnector::new(config.connection.clone());
        Self::new(connector, config.settings.clone(), disabled)
    }
}

impl<C: Connector> Coordinator<C> {
    pub fn new(
        connector: C,
        settings: PollSettings,
        disabled: DisabledRegisters,
    ) -> Result<Self, config::Error> {
        settings.validate()?;
        let (snapshot, _) = watch::channel(Snapshot {
            result: Arc::new(PollResult::default()),
            status: UpdateStatus::Pending,
        });
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            connector,
            session: Mutex::new(Session { transport: None, settings }),
            disabled,
            snapshot,
            state,
            refresh_requested: Notify::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Every published snapshot, starting with the current one.
    pub fn updates(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.snapshot.subscribe())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_register_disabled(&self, address: u16) -> bool {
        self.disabled.is_disabled(address)
    }

    pub async fn settings(&self) -> PollSettings {
        self.session.lock().await.settings.clone()
    }

    /// Takes effect with the next cycle.
    pub async fn set_firmware_tier(&self, firmware_tier: f64) {
        let mut session = self.session.lock().await;
        info!(
            message = "changing firmware tier",
            from = session.settings.firmware_tier,
            to = firmware_tier
        );
        session.settings.firmware_tier = firmware_tier;
    }

    /// Ask the [`Coordinator::run`] loop to poll now rather than at the next tick.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(message = "connection state changed", %previous, %state);
        }
    }

    async fn take_transport(
        &self,
        session: &mut Session<C::Client>,
    ) -> Result<Checkout<'_, C::Client>, Error> {
        if self.state() == ConnectionState::Shutdown {
            return Err(Error::Shutdown);
        }
        let transport = match session.transport.take() {
            Some(transport) => transport,
            None => {
                self.set_state(ConnectionState::Connecting);
                match self.connector.connect().await {
                    Ok(client) => {
                        self.set_state(ConnectionState::Polling);
                        Transport::new(client)
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(Error::Connect(e));
                    }
                }
            }
        };
        Ok(Checkout { state: &self.state, transport: Some(transport) })
    }

    /// Return the transport to the session unless `error` means it can no longer be used.
    fn restore_transport(
        &self,
        session: &mut Session<C::Client>,
        mut checkout: Checkout<'_, C::Client>,
        error: Option<&transport::Error>,
    ) {
        let transport = checkout.transport.take();
        match error {
            Some(e) if ends_session(e) => {
                drop(transport);
                self.set_state(ConnectionState::Disconnected);
            }
            _ => session.transport = transport,
        }
    }

    /// Run a poll cycle and publish its outcome.
    pub async fn poll(&self) -> Result<Arc<PollResult>, Arc<Error>> {
        // The outcome is published before the next cycle or write can take the session.
        let mut session = self.session.lock().await;
        let outcome = self.cycle(&mut session).await;
        match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                self.snapshot.send_replace(Snapshot {
                    result: Arc::clone(&result),
                    status: UpdateStatus::Updated,
                });
                Ok(result)
            }
            Err(e) => {
                warn!(message = "poll cycle failed", error = &e as &dyn std::error::Error);
                let e = Arc::new(e);
                self.snapshot.send_modify(|s| s.status = UpdateStatus::Failed(Arc::clone(&e)));
                Err(e)
            }
        }
    }

    async fn cycle(&self, session: &mut Session<C::Client>) -> Result<PollResult, Error> {
        let mut checkout = self.take_transport(session).await?;
        let planned = plan(&session.settings, &self.disabled);
        let PollSettings { slave_id, retain_last_values, .. } = session.settings;
        let previous = Arc::clone(&self.snapshot.borrow().result);
        debug!(message = "starting poll cycle", registers = planned.len());
        let mut values = BTreeMap::new();
        let mut failed = 0usize;
        for register in &planned {
            let error = match read(checkout.transport()?, register, slave_id).await {
                Ok(value) => {
                    values.insert(register.sensor.clone(), value);
                    continue;
                }
                Err(e) => e,
            };
            let address = register.address;
            if ends_session(&error) {
                self.restore_transport(session, checkout, Some(&error));
                return Err(match error.exception() {
                    Some(exception) => Error::FatalProtocol { address, exception },
                    None if error.is_unsupported_client() => Error::UnsupportedClient(error),
                    None => Error::ConnectionLost { address, source: error },
                });
            }
            failed += 1;
            let sensor = register.sensor.clone();
            let error = Error::RegisterRead { address, sensor, source: error };
            warn!(message = "skipping register", error = &error as &dyn std::error::Error);
            if retain_last_values {
                if let Some(value) = previous.get(&register.sensor) {
                    values.insert(register.sensor.clone(), *value);
                }
            }
        }
        self.restore_transport(session, checkout, None);
        info!(message = "poll cycle complete", values = values.len(), failed);
        Ok(PollResult { values, polled_at: Some(jiff::Timestamp::now()) })
    }

    /// Write `value` to the register `key` of the `index`th instance of `kind`.
    ///
    /// The value is in engineering units and is scaled and encoded according to the register
    /// template. A successful write requests an immediate refresh.
    pub async fn write(
        &self,
        kind: DeviceKind,
        index: u8,
        key: &str,
        value: f64,
    ) -> Result<(), Error> {
        let template = kind
            .template(key)
            .ok_or_else(|| WriteRejected::UnknownTemplate { kind, key: key.to_string() })?;
        if !template.mode.is_writeable() {
            return Err(WriteRejected::NotWriteable { kind, key: template.key }.into());
        }
        let words = codec::encode(value, template.data_type, template.scale)
            .map_err(WriteRejected::from)?;
        let mut session = self.session.lock().await;
        let configured = session.settings.devices.count(kind);
        if index == 0 || index > configured {
            return Err(WriteRejected::IndexOutOfRange { kind, index, configured }.into());
        }
        let address = registers::absolute(kind, index, template.offset);
        let slave_id = session.settings.slave_id;
        let mut checkout = self.take_transport(&mut session).await?;
        let transport = checkout.transport()?;
        let result = match words.as_slice() {
            [word] => transport.write_register(address, *word, slave_id).await,
            words => transport.write_registers(address, words, slave_id).await,
        };
        self.restore_transport(&mut session, checkout, result.as_ref().err());
        drop(session);
        result.map_err(|source| Error::Write { address, source })?;
        info!(message = "register written", address, %kind, index, key, value);
        self.request_refresh();
        Ok(())
    }

    /// Poll at the configured interval and on refresh requests until `shutdown` is cancelled.
    ///
    /// The session is closed before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        let period = self.session.lock().await.settings.poll_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                () = self.refresh_requested.notified() => {
                    debug!(message = "refresh requested");
                    interval.reset();
                }
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                // Failures are published with the snapshot.
                _ = self.poll() => {}
            }
        }
        self.shutdown().await;
    }

    /// Close the session. No further cycles or writes are possible afterwards.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        self.set_state(ConnectionState::Shutdown);
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                let error = &e as &dyn std::error::Error;
                warn!(message = "could not close the session", error);
            }
        }
        info!(message = "coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::DeviceCounts;
    use crate::modbus::{ExceptionCode, Operation};
    use crate::transport::mock::{Client, Failure};

    #[derive(Clone, Default)]
    struct MockConnector {
        client: Client,
        refuse: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    impl Connector for MockConnector {
        type Client = Client;

        async fn connect(&self) -> Result<Client, connection::Error> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(connection::Error::ConnectTimeout("mock:502".into()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    fn settings(devices: DeviceCounts) -> PollSettings {
        PollSettings { devices, ..PollSettings::default() }
    }

    fn one_of_each() -> DeviceCounts {
        DeviceCounts { heat_pumps: 1, boilers: 1, buffers: 0, solar: 0, heating_circuits: 1 }
    }

    fn coordinator(
        settings: PollSettings,
        disabled: DisabledRegisters,
    ) -> (Coordinator<MockConnector>, MockConnector) {
        let connector = MockConnector::default();
        {
            let mut device = connector.client.device();
            device.holdings.extend((0..6200).map(|address| (address, 0)));
            device.holdings.insert(1000, 3);
            device.holdings.insert(2002, 600);
        }
        let coordinator = Coordinator::new(connector.clone(), settings, disabled).unwrap();
        (coordinator, connector)
    }

    fn expected_len(settings: &PollSettings) -> usize {
        std::iter::once(DeviceKind::General)
            .chain(DeviceKind::INDEXED)
            .map(|kind| {
                let templates = compatibility::compatible(kind.templates(), settings.firmware_tier);
                templates.len() * usize::from(settings.devices.count(kind))
            })
            .sum()
    }

    #[tokio::test]
    async fn full_cycle_publishes_all_registers() {
        let settings = settings(one_of_each());
        let (coordinator, connector) = coordinator(settings.clone(), DisabledRegisters::default());
        let mut updates = coordinator.subscribe();
        assert!(matches!(coordinator.snapshot().status, UpdateStatus::Pending));
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.values.len(), expected_len(&settings));
        assert_eq!(
            result.get("hp1_error_state"),
            Some(&Value::State { code: 3, label: "ALARM" })
        );
        assert_eq!(result.get("boil1_actual_high_temperature"), Some(&Value::Float(60.0)));
        assert_eq!(result.get("ambient_temperature"), Some(&Value::Float(0.0)));
        assert!(result.get("boil1_actual_circulation_temperature").is_none());
        assert!(result.get("hp2_error_state").is_none());
        assert!(result.polled_at.is_some());
        assert!(updates.has_changed().unwrap());
        let snapshot = updates.borrow_and_update().clone();
        assert!(matches!(snapshot.status, UpdateStatus::Updated));
        assert!(Arc::ptr_eq(&snapshot.result, &result));
        assert_eq!(coordinator.state(), ConnectionState::Polling);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let reads = connector.client.device().calls.len();
        assert_eq!(reads, result.values.len());
    }

    #[tokio::test]
    async fn register_errors_are_isolated() {
        let settings = settings(one_of_each());
        let (coordinator, connector) = coordinator(settings.clone(), DisabledRegisters::default());
        {
            let mut device = connector.client.device();
            device.failures.insert(2002, Failure::Exception(ExceptionCode::IllegalDataAddress));
            device.failures.insert(1004, Failure::Timeout);
        }
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.values.len(), expected_len(&settings) - 2);
        assert!(result.get("boil1_actual_high_temperature").is_none());
        assert!(result.get("hp1_flow_line_temperature").is_none());
        assert!(result.get("boil1_actual_low_temperature").is_some());
        assert_eq!(coordinator.state(), ConnectionState::Polling);
    }

    #[tokio::test]
    async fn illegal_function_aborts_the_cycle() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        let first = coordinator.poll().await.unwrap();
        connector
            .client
            .device()
            .failures
            .insert(2003, Failure::Exception(ExceptionCode::IllegalFunction));
        connector.client.device().holdings.insert(2002, 610);
        let error = coordinator.poll().await.unwrap_err();
        assert!(matches!(*error, Error::FatalProtocol { address: 2003, .. }));
        let snapshot = coordinator.snapshot();
        assert!(Arc::ptr_eq(&snapshot.result, &first));
        assert!(matches!(snapshot.status, UpdateStatus::Failed(_)));
        assert_eq!(
            snapshot.result.get("boil1_actual_high_temperature"),
            Some(&Value::Float(60.0))
        );
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);

        connector.client.device().failures.clear();
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.get("boil1_actual_high_temperature"), Some(&Value::Float(61.0)));
        assert_eq!(coordinator.state(), ConnectionState::Polling);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_cycles_drop_the_session() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        coordinator.poll().await.unwrap();
        connector.client.device().failures.insert(2002, Failure::Hang);
        let cancelled = tokio::time::timeout(Duration::from_millis(20), coordinator.poll()).await;
        assert!(cancelled.is_err());
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(matches!(coordinator.snapshot().status, UpdateStatus::Updated));

        connector.client.device().failures.clear();
        coordinator.poll().await.unwrap();
        assert_eq!(coordinator.state(), ConnectionState::Polling);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn input_registers_are_read_with_function_code_4() {
        static OUTSIDE_TEMPERATURE: RegisterTemplate = RegisterTemplate {
            key: "outside_temperature",
            name: "Outside temperature",
            offset: 10,
            data_type: registers::DataType::I16,
            register_type: RegisterType::Input,
            mode: registers::Mode::R,
            unit: Some("°C"),
            scale: 0.1,
            precision: 1,
            min_firmware: 1,
            states: None,
            legacy_key: None,
        };
        let client = Client::default();
        client.device().inputs.insert(10, 0xFFF6);
        let mut transport = Transport::new(client.clone());
        let register = Planned {
            sensor: "outside_temperature".into(),
            address: 10,
            template: &OUTSIDE_TEMPERATURE,
        };
        let value = read(&mut transport, &register, 1).await.unwrap();
        assert_eq!(value, Value::Float(-1.0));
        let device = client.device();
        assert!(matches!(device.calls[..], [(_, Operation::GetInputs { address: 10, count: 1 })]));
    }

    #[tokio::test]
    async fn connect_failures_are_retried_on_the_next_cycle() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        connector.refuse.store(true, Ordering::SeqCst);
        let error = coordinator.poll().await.unwrap_err();
        assert!(matches!(*error, Error::Connect(_)));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(matches!(coordinator.snapshot().status, UpdateStatus::Failed(_)));
        connector.refuse.store(false, Ordering::SeqCst);
        coordinator.poll().await.unwrap();
        assert_eq!(coordinator.state(), ConnectionState::Polling);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_connection_disconnects() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        connector.client.device().failures.insert(2002, Failure::Disconnect);
        let error = coordinator.poll().await.unwrap_err();
        assert!(matches!(*error, Error::ConnectionLost { address: 2002, .. }));
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(coordinator.snapshot().result.values.is_empty());
        connector.client.device().failures.clear();
        coordinator.poll().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_registers_are_not_read() {
        let disabled = DisabledRegisters::new([1000, 2002]);
        let settings = settings(one_of_each());
        let (coordinator, connector) = coordinator(settings.clone(), disabled);
        assert!(coordinator.is_register_disabled(2002));
        assert!(!coordinator.is_register_disabled(2003));
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.values.len(), expected_len(&settings) - 2);
        assert!(result.get("hp1_error_state").is_none());
        assert!(result.get("boil1_actual_high_temperature").is_none());
        let device = connector.client.device();
        assert!(device.calls.iter().all(|(_, op)| ![1000, 2002].contains(&op.address())));
    }

    #[tokio::test]
    async fn retained_values_come_from_the_latest_cycle() {
        let settings = PollSettings { retain_last_values: true, ..settings(one_of_each()) };
        let (coordinator, connector) = coordinator(settings, DisabledRegisters::default());
        coordinator.poll().await.unwrap();
        connector.client.device().holdings.insert(2002, 610);
        coordinator.poll().await.unwrap();
        connector.client.device().failures.insert(2002, Failure::Timeout);
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.get("boil1_actual_high_temperature"), Some(&Value::Float(61.0)));
        assert!(Arc::ptr_eq(&coordinator.snapshot().result, &result));
    }

    #[tokio::test]
    async fn failed_reads_keep_the_last_value_when_retaining() {
        for retain_last_values in [false, true] {
            let settings = PollSettings { retain_last_values, ..settings(one_of_each()) };
            let (coordinator, connector) = coordinator(settings, DisabledRegisters::default());
            coordinator.poll().await.unwrap();
            connector.client.device().failures.insert(2002, Failure::Timeout);
            let result = coordinator.poll().await.unwrap();
            let retained = result.get("boil1_actual_high_temperature");
            if retain_last_values {
                assert_eq!(retained, Some(&Value::Float(60.0)));
            } else {
                assert_eq!(retained, None);
            }
        }
    }

    #[tokio::test]
    async fn legacy_sensor_names() {
        let settings = PollSettings { legacy_names: true, ..settings(one_of_each()) };
        let (coordinator, _) = coordinator(settings, DisabledRegisters::default());
        let result = coordinator.poll().await.unwrap();
        assert!(result.get("hp1_compressor_rating").is_some());
        assert!(result.get("hp1_compressor_unit_rating").is_none());
        assert!(result.get("pv_surplus_power").is_some());
        assert!(result.get("hp1_error_state").is_some());
    }

    #[tokio::test]
    async fn firmware_changes_apply_to_the_next_cycle() {
        let (coordinator, _) = coordinator(settings(one_of_each()), DisabledRegisters::default());
        let result = coordinator.poll().await.unwrap();
        assert!(result.get("boil1_actual_circulation_temperature").is_none());
        coordinator.set_firmware_tier(2.0).await;
        let result = coordinator.poll().await.unwrap();
        assert!(result.get("boil1_actual_circulation_temperature").is_some());
        assert!(result.get("hp1_request_type").is_some());
        assert!(result.get("hp1_hot_gas_temperature").is_none());
    }

    #[tokio::test]
    async fn writes_are_scaled_and_request_a_refresh() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        coordinator
            .write(DeviceKind::HeatingCircuit, 1, "target_room_temperature", 22.5)
            .await
            .unwrap();
        assert_eq!(connector.client.device().holdings[&5051], 225);
        tokio::time::timeout(Duration::from_secs(1), coordinator.refresh_requested.notified())
            .await
            .unwrap();
        let result = coordinator.poll().await.unwrap();
        assert_eq!(result.get("hc1_target_room_temperature"), Some(&Value::Float(22.5)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_writes_are_rejected_before_the_device() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        let rejected = |result: Result<(), Error>| match result {
            Err(Error::WriteRejected(rejection)) => rejection,
            other => panic!("expected a rejection, got {other:?}"),
        };
        let unknown = rejected(coordinator.write(DeviceKind::Boiler, 1, "flux", 1.0).await);
        assert!(matches!(unknown, WriteRejected::UnknownTemplate { .. }));
        let read_only =
            rejected(coordinator.write(DeviceKind::HeatPump, 1, "error_state", 1.0).await);
        assert!(matches!(read_only, WriteRejected::NotWriteable { key: "error_state", .. }));
        let index = rejected(
            coordinator.write(DeviceKind::HeatingCircuit, 2, "target_room_temperature", 20.0).await,
        );
        assert!(matches!(index, WriteRejected::IndexOutOfRange { index: 2, configured: 1, .. }));
        let range = rejected(
            coordinator.write(DeviceKind::HeatingCircuit, 1, "target_room_temperature", 1e6).await,
        );
        assert!(matches!(range, WriteRejected::Encode(EncodeError::OutOfRange { .. })));
        assert!(connector.client.device().calls.is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_writes_surface_device_errors() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        connector
            .client
            .device()
            .failures
            .insert(2050, Failure::Exception(ExceptionCode::IllegalDataValue));
        let error = coordinator
            .write(DeviceKind::Boiler, 1, "target_high_temperature", 55.0)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Write { address: 2050, .. }));
        assert_eq!(coordinator.state(), ConnectionState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_polls_on_ticks_and_refreshes() {
        let (coordinator, connector) =
            coordinator(settings(one_of_each()), DisabledRegisters::default());
        let coordinator = Arc::new(coordinator);
        let shutdown = CancellationToken::new();
        let mut updates = coordinator.subscribe();
        let task = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let shutdown = shutdown.clone();
            async move { coordinator.run(shutdown).await }
        });

        // The first tick completes immediately.
        let started = tokio::time::Instant::now();
        updates.changed().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        coordinator
            .write(DeviceKind::Boiler, 1, "target_high_temperature", 55.0)
            .await
            .unwrap();
        updates.changed().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        let snapshot = updates.borrow_and_update().clone();
        assert_eq!(
            snapshot.result.get("boil1_target_high_temperature"),
            Some(&Value::Float(55.0))
        );

        updates.changed().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(coordinator.state(), ConnectionState::Shutdown);
        assert_eq!(connector.client.device().closed, 1);
        let error = coordinator.poll().await.unwrap_err();
        assert!(matches!(*error, Error::Shutdown));
    }
}

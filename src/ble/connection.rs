//! BLE connection management.
//!
//! [`ConnectionManager`] sequences the scan, connect, service discovery,
//! characteristic discovery and read/write/subscribe protocol for the sensor.
//! It never blocks and never spawns: it issues requests through a
//! [`BleAdapter`] and advances only when the matching [`Event`] is fed back
//! into [`ConnectionManager::handle_event`].

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterState, BleAdapter, Event, PeripheralHandle};
use crate::ble::timer::{ScanTimer, TimerToken};
use crate::config::{CharacteristicRole, ManagerConfig, UpdateTrigger};
use crate::error::{AdapterError, Error, Result};
use crate::observer::Observer;
use crate::utils::{decode_text, encode_text};

/// Connection state reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the sensor.
    #[default]
    Disconnected,
    /// Scanning for, or connecting to, the sensor.
    Searching,
    /// Connected and characteristics discovered.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Searching => write!(f, "searching"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Where the manager is in the connect protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    /// The adapter has not reported a usable power state yet.
    Uninitialized,
    /// Not scanning and no link.
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
}

/// Characteristics bound to roles during discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundCharacteristics {
    /// Bound writable-interval characteristic.
    pub writable_interval: Option<Uuid>,
    /// Bound readable-data characteristic.
    pub readable_data: Option<Uuid>,
    /// Bound notifiable-data characteristic.
    pub notifiable_data: Option<Uuid>,
}

impl BoundCharacteristics {
    /// Get the characteristic bound to a role.
    pub fn get(&self, role: CharacteristicRole) -> Option<Uuid> {
        match role {
            CharacteristicRole::WritableInterval => self.writable_interval,
            CharacteristicRole::ReadableData => self.readable_data,
            CharacteristicRole::NotifiableData => self.notifiable_data,
        }
    }

    /// Bind `uuid` to `role`. A role keeps its first binding.
    ///
    /// Returns true if the role was newly bound.
    fn bind(&mut self, role: CharacteristicRole, uuid: Uuid) -> bool {
        let slot = match role {
            CharacteristicRole::WritableInterval => &mut self.writable_interval,
            CharacteristicRole::ReadableData => &mut self.readable_data,
            CharacteristicRole::NotifiableData => &mut self.notifiable_data,
        };

        if slot.is_some() {
            return false;
        }

        *slot = Some(uuid);
        true
    }
}

/// Drives a [`BleAdapter`] through the sensor connect protocol.
///
/// All state is owned exclusively and mutated only from
/// [`handle_event`](Self::handle_event) and
/// [`request_update_now`](Self::request_update_now), so the manager needs no
/// locking. Run it from a single task.
pub struct ConnectionManager<A, T, O> {
    /// Which service and characteristics to use.
    config: ManagerConfig,
    /// Platform BLE primitives.
    adapter: A,
    /// Scan timeout.
    timer: T,
    /// Receiver of status and data updates.
    observer: O,
    /// Last power state reported by the adapter.
    adapter_state: AdapterState,
    /// Last state reported to the observer.
    state: ConnectionState,
    /// Finer progress through the protocol.
    phase: LinkPhase,
    /// The one peripheral being connected to, if any.
    peripheral: Option<PeripheralHandle>,
    /// Characteristics bound for the current link.
    bound: BoundCharacteristics,
    /// Token of the armed scan timer.
    armed_timer: Option<TimerToken>,
    /// Last token handed out.
    last_token: TimerToken,
}

impl<A, T, O> ConnectionManager<A, T, O>
where
    A: BleAdapter,
    T: ScanTimer,
    O: Observer,
{
    /// Create a manager. Nothing happens until the adapter reports power-on.
    pub fn new(config: ManagerConfig, adapter: A, timer: T, observer: O) -> Self {
        Self {
            config,
            adapter,
            timer,
            observer,
            adapter_state: AdapterState::Unknown,
            state: ConnectionState::Disconnected,
            phase: LinkPhase::Uninitialized,
            peripheral: None,
            bound: BoundCharacteristics::default(),
            armed_timer: None,
            last_token: TimerToken::default(),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Get the last reported adapter power state.
    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    /// Get the peripheral being connected to.
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    /// Get the characteristics bound so far.
    pub fn bound(&self) -> &BoundCharacteristics {
        &self.bound
    }

    /// Get the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Get the observer.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Take the manager apart.
    pub fn into_parts(self) -> (A, T, O) {
        (self.adapter, self.timer, self.observer)
    }

    /// Check if a scan timer is armed.
    pub fn is_timer_armed(&self) -> bool {
        self.armed_timer.is_some()
    }

    /// Process one adapter or timer event.
    pub fn handle_event(&mut self, event: Event) {
        trace!("Handling event {:?}", event);

        match event {
            Event::AdapterStateChanged(state) => self.on_adapter_state(state),
            Event::PeripheralDiscovered(peripheral) => self.on_peripheral_discovered(peripheral),
            Event::LinkEstablished(peripheral) => self.on_link_established(peripheral),
            Event::LinkFailed { peripheral, error } => self.on_link_failed(peripheral, error),
            Event::ServicesDiscovered(result) => self.on_services_discovered(result),
            Event::CharacteristicsDiscovered { service, result } => {
                self.on_characteristics_discovered(service, result)
            }
            Event::ServicesInvalidated(services) => self.on_services_invalidated(services),
            Event::WriteComplete {
                characteristic,
                result,
            } => self.on_write_complete(characteristic, result),
            Event::ValueUpdated {
                characteristic,
                result,
            } => self.on_value_updated(characteristic, result),
            Event::NotifyStateUpdated {
                characteristic,
                result,
            } => self.on_notify_state(characteristic, result),
            Event::ScanTimeout(token) => self.on_timeout(token),
        }
    }

    /// The radio changed power state.
    ///
    /// Power-on (re)starts scanning from scratch, releasing any peripheral
    /// still linked. Any other state drops the
    /// current link and scan until power returns.
    pub fn on_adapter_state(&mut self, state: AdapterState) {
        debug!("Adapter state: {}", state);
        self.adapter_state = state;

        if state.is_powered_on() {
            self.start_scan();
            return;
        }

        warn!(
            "{}",
            Error::AdapterUnavailable {
                state: state.to_string()
            }
        );

        self.cancel_timer();
        self.reset_link();

        if self.phase != LinkPhase::Uninitialized {
            self.phase = LinkPhase::Idle;
        }

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// A peripheral advertising the target service was seen.
    pub fn on_peripheral_discovered(&mut self, peripheral: PeripheralHandle) {
        if self.phase != LinkPhase::Scanning {
            debug!(
                "Ignoring discovery of {} while {:?}",
                peripheral, self.phase
            );
            return;
        }

        info!("Discovered sensor {}", peripheral);

        self.cancel_timer();
        self.adapter.stop_scan();
        self.adapter.connect(&peripheral);
        self.peripheral = Some(peripheral);
        self.phase = LinkPhase::Connecting;
    }

    /// The connect request completed.
    pub fn on_link_established(&mut self, peripheral: PeripheralHandle) {
        if self.peripheral.as_ref() != Some(&peripheral) {
            warn!("Ignoring link to unexpected peripheral {}", peripheral);
            return;
        }

        info!("Connected to sensor {}", peripheral);

        self.phase = LinkPhase::DiscoveringServices;
        self.adapter
            .discover_services(&peripheral, &[self.config.service_uuid]);
    }

    /// The connect request failed. No retry.
    pub fn on_link_failed(&mut self, peripheral: PeripheralHandle, error: AdapterError) {
        warn!("Connecting to {}: {}", peripheral, Error::IoFailed(error));
    }

    /// Service discovery completed.
    pub fn on_services_discovered(&mut self, result: std::result::Result<Vec<Uuid>, AdapterError>) {
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("{}", Error::DiscoveryFailed(e));
                return;
            }
        };

        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral.clone(),
            None => {
                debug!("Services discovered without a peripheral, ignoring");
                return;
            }
        };

        debug!("Discovered {} services", services.len());

        self.phase = LinkPhase::DiscoveringCharacteristics;
        for service in services {
            debug!("Service {}", service);
            self.adapter.discover_characteristics(&peripheral, service);
        }
    }

    /// Characteristic discovery for one service completed.
    ///
    /// Reports `connected` whenever this succeeds, even if some configured
    /// roles were not found among the characteristics.
    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        result: std::result::Result<Vec<Uuid>, AdapterError>,
    ) {
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!("Service {}: {}", service, Error::DiscoveryFailed(e));
                return;
            }
        };

        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral.clone(),
            None => {
                debug!("Characteristics discovered without a peripheral, ignoring");
                return;
            }
        };

        debug!(
            "Service {}: {} characteristics",
            service,
            characteristics.len()
        );

        let mut subscribe_to = None;
        for uuid in characteristics {
            let roles = self.config.roles.roles_for(&uuid);
            if roles.is_empty() {
                trace!("Ignoring characteristic {}", uuid);
                continue;
            }

            for role in roles {
                if self.bound.bind(role, uuid) {
                    debug!("Characteristic {} bound as {}", uuid, role);
                    if role == CharacteristicRole::NotifiableData {
                        subscribe_to = Some(uuid);
                    }
                }
            }
        }

        for role in [
            CharacteristicRole::WritableInterval,
            CharacteristicRole::ReadableData,
            CharacteristicRole::NotifiableData,
        ] {
            if self.config.roles.get(role).is_some() && self.bound.get(role).is_none() {
                debug!("No {} characteristic found yet", role);
            }
        }

        if let Some(uuid) = subscribe_to {
            self.adapter.set_notify(&peripheral, uuid, true);
        }

        self.phase = LinkPhase::Ready;
        self.set_state(ConnectionState::Connected);
    }

    /// The peripheral invalidated services. A non-empty set drops the link.
    ///
    /// Scanning is not restarted.
    pub fn on_services_invalidated(&mut self, services: Vec<Uuid>) {
        debug!("{} services invalidated: {:?}", services.len(), services);

        if services.is_empty() {
            return;
        }

        info!("Sensor services invalidated, connection lost");

        self.reset_link();
        self.phase = LinkPhase::Idle;
        self.set_state(ConnectionState::Disconnected);
    }

    /// A write was acknowledged. A successful interval write is followed by a
    /// read of the readable-data characteristic.
    pub fn on_write_complete(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<(), AdapterError>,
    ) {
        if let Err(e) = result {
            warn!("Write to {}: {}", characteristic, Error::IoFailed(e));
            return;
        }

        debug!("Write to {} acknowledged", characteristic);

        if self.bound.writable_interval != Some(characteristic) {
            return;
        }

        match (&self.peripheral, self.bound.readable_data) {
            (Some(peripheral), Some(readable)) => {
                let peripheral = peripheral.clone();
                self.adapter.read(&peripheral, readable);
            }
            _ => trace!("No readable-data characteristic bound, not reading back"),
        }
    }

    /// A value arrived as a read response or notification.
    pub fn on_value_updated(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, AdapterError>,
    ) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!("Value from {}: {}", characteristic, Error::IoFailed(e));
                return;
            }
        };

        let text = match decode_text(&characteristic, &value) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping update: {}", e);
                return;
            }
        };

        let is_requested = self.bound.readable_data == Some(characteristic);
        debug!(
            "Value from {} (requested: {}): {}",
            characteristic, is_requested, text
        );

        self.observer.update_data(text, is_requested);
    }

    /// A subscribe or unsubscribe request completed.
    pub fn on_notify_state(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<(), AdapterError>,
    ) {
        match result {
            Ok(()) => debug!("Notification state updated for {}", characteristic),
            Err(e) => warn!(
                "Subscribing to {}: {}",
                characteristic,
                Error::IoFailed(e)
            ),
        }
    }

    /// The scan timer fired.
    ///
    /// Only the currently armed token counts; anything else was cancelled or
    /// already handled.
    pub fn on_timeout(&mut self, token: TimerToken) {
        if self.armed_timer != Some(token) {
            trace!("Ignoring stale scan timeout {:?}", token);
            return;
        }

        self.armed_timer = None;

        info!(
            "{}",
            Error::ScanTimeout {
                secs: self.config.scan_timeout.as_secs_f64()
            }
        );

        self.adapter.stop_scan();
        if self.phase == LinkPhase::Scanning {
            self.phase = LinkPhase::Idle;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Ask the sensor for a fresh reading.
    ///
    /// Depending on [`ManagerConfig::update_trigger`] this either writes the
    /// sampling interval (the acknowledgement chains a read) or reads the
    /// readable-data characteristic. The result arrives later through
    /// [`Observer::update_data`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no connection, or
    /// [`Error::CharacteristicNotFound`] if the characteristic the trigger
    /// needs was not discovered.
    pub fn request_update_now(&mut self) -> Result<()> {
        let peripheral = match &self.peripheral {
            Some(peripheral) if self.state.is_connected() => peripheral.clone(),
            _ => return Err(Error::NotConnected),
        };

        let role = self.config.update_trigger.role();
        let uuid = self.bound.get(role).ok_or_else(|| Error::CharacteristicNotFound {
            uuid: self
                .config
                .roles
                .get(role)
                .map(|uuid| uuid.to_string())
                .unwrap_or_else(|| role.to_string()),
        })?;

        match &self.config.update_trigger {
            UpdateTrigger::WriteInterval { value } => {
                debug!("Writing interval {:?} to {}", value, uuid);
                self.adapter.write(&peripheral, uuid, encode_text(value));
            }
            UpdateTrigger::ReadData => {
                debug!("Reading {}", uuid);
                self.adapter.read(&peripheral, uuid);
            }
        }

        Ok(())
    }

    /// Stop scanning, drop the link and report `disconnected` if needed.
    pub fn shutdown(&mut self) {
        info!("Shutting down connection manager");

        self.cancel_timer();

        if self.phase == LinkPhase::Scanning {
            self.adapter.stop_scan();
        }

        if let Some(peripheral) = self.peripheral.clone() {
            self.adapter.disconnect(&peripheral);
        }

        self.reset_link();
        self.phase = LinkPhase::Idle;

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Stop any previous scan and timer, drop any retained peripheral, then
    /// scan for the service.
    fn start_scan(&mut self) {
        info!("Scanning for service {}", self.config.service_uuid);

        self.adapter.stop_scan();
        self.cancel_timer();

        if let Some(peripheral) = self.peripheral.clone() {
            debug!("Releasing {} before rescanning", peripheral);
            self.adapter.disconnect(&peripheral);
        }
        self.reset_link();

        let token = self.last_token.next();
        self.last_token = token;
        self.timer.arm(token, self.config.scan_timeout);
        self.armed_timer = Some(token);

        self.adapter.start_scan(self.config.service_uuid);
        self.phase = LinkPhase::Scanning;
        self.set_state(ConnectionState::Searching);
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.armed_timer.take() {
            self.timer.cancel(token);
        }
    }

    fn reset_link(&mut self) {
        self.peripheral = None;
        self.bound = BoundCharacteristics::default();
    }

    /// Update the connection state and notify the observer.
    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        debug!("Connection state changed: {} -> {}", old_state, new_state);
        self.observer.update_connection(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::timer::MockScanTimer;
    use crate::ble::uuids::*;
    use crate::observer::MockObserver;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan(Uuid),
        StopScan,
        Connect(PeripheralHandle),
        DiscoverServices(PeripheralHandle, Vec<Uuid>),
        DiscoverCharacteristics(Uuid),
        Write(Uuid, Vec<u8>),
        Read(Uuid),
        SetNotify(Uuid, bool),
        Disconnect(PeripheralHandle),
    }

    #[derive(Default)]
    struct RecordingAdapter {
        calls: Vec<Call>,
    }

    impl RecordingAdapter {
        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl BleAdapter for RecordingAdapter {
        fn start_scan(&mut self, service: Uuid) {
            self.calls.push(Call::StartScan(service));
        }

        fn stop_scan(&mut self) {
            self.calls.push(Call::StopScan);
        }

        fn connect(&mut self, peripheral: &PeripheralHandle) {
            self.calls.push(Call::Connect(peripheral.clone()));
        }

        fn disconnect(&mut self, peripheral: &PeripheralHandle) {
            self.calls.push(Call::Disconnect(peripheral.clone()));
        }

        fn discover_services(&mut self, peripheral: &PeripheralHandle, filter: &[Uuid]) {
            self.calls
                .push(Call::DiscoverServices(peripheral.clone(), filter.to_vec()));
        }

        fn discover_characteristics(&mut self, _peripheral: &PeripheralHandle, service: Uuid) {
            self.calls.push(Call::DiscoverCharacteristics(service));
        }

        fn write(&mut self, _peripheral: &PeripheralHandle, characteristic: Uuid, value: Vec<u8>) {
            self.calls.push(Call::Write(characteristic, value));
        }

        fn read(&mut self, _peripheral: &PeripheralHandle, characteristic: Uuid) {
            self.calls.push(Call::Read(characteristic));
        }

        fn set_notify(&mut self, _peripheral: &PeripheralHandle, characteristic: Uuid, enabled: bool) {
            self.calls.push(Call::SetNotify(characteristic, enabled));
        }
    }

    #[derive(Default)]
    struct ManualTimer {
        armed: Vec<(TimerToken, Duration)>,
        cancelled: Vec<TimerToken>,
    }

    impl ScanTimer for ManualTimer {
        fn arm(&mut self, token: TimerToken, after: Duration) {
            self.armed.push((token, after));
        }

        fn cancel(&mut self, token: TimerToken) {
            self.cancelled.push(token);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Update {
        Connection(ConnectionState),
        Data(String, bool),
    }

    #[derive(Default)]
    struct RecordingObserver {
        updates: Vec<Update>,
    }

    impl RecordingObserver {
        fn connection_updates(&self) -> Vec<ConnectionState> {
            self.updates
                .iter()
                .filter_map(|u| match u {
                    Update::Connection(state) => Some(*state),
                    _ => None,
                })
                .collect()
        }

        fn data_updates(&self) -> Vec<(String, bool)> {
            self.updates
                .iter()
                .filter_map(|u| match u {
                    Update::Data(text, requested) => Some((text.clone(), *requested)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Observer for RecordingObserver {
        fn update_connection(&mut self, state: ConnectionState) {
            self.updates.push(Update::Connection(state));
        }

        fn update_data(&mut self, text: String, is_requested: bool) {
            self.updates.push(Update::Data(text, is_requested));
        }
    }

    type TestManager = ConnectionManager<RecordingAdapter, ManualTimer, RecordingObserver>;

    fn sensor() -> PeripheralHandle {
        PeripheralHandle::new("sensor-1")
    }

    fn manager(config: ManagerConfig) -> TestManager {
        ConnectionManager::new(
            config,
            RecordingAdapter::default(),
            ManualTimer::default(),
            RecordingObserver::default(),
        )
    }

    fn all_characteristics() -> Vec<Uuid> {
        vec![
            SET_INTERVAL_CHARACTERISTIC_UUID,
            MOTION_DATA_CHARACTERISTIC_UUID,
        ]
    }

    fn connect(m: &mut TestManager, characteristics: Vec<Uuid>) {
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        m.handle_event(Event::LinkEstablished(sensor()));
        m.handle_event(Event::ServicesDiscovered(Ok(vec![ACCEL_GYRO_SERVICE_UUID])));
        m.handle_event(Event::CharacteristicsDiscovered {
            service: ACCEL_GYRO_SERVICE_UUID,
            result: Ok(characteristics),
        });
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Searching.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "connected");
        assert_eq!(format!("{}", ConnectionState::Searching), "searching");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "disconnected");
    }

    #[test]
    fn test_power_on_emits_single_searching_and_arms_timer() {
        let mut timer = MockScanTimer::new();
        timer
            .expect_arm()
            .with(eq(TimerToken(1)), eq(Duration::from_secs(5)))
            .times(1)
            .return_const(());

        let mut observer = MockObserver::new();
        observer
            .expect_update_connection()
            .with(eq(ConnectionState::Searching))
            .times(1)
            .return_const(());

        let mut m = ConnectionManager::new(
            ManagerConfig::default(),
            RecordingAdapter::default(),
            timer,
            observer,
        );
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));

        assert_eq!(m.state(), ConnectionState::Searching);
        assert!(m.is_timer_armed());
        assert_eq!(
            m.adapter().calls,
            vec![Call::StopScan, Call::StartScan(ACCEL_GYRO_SERVICE_UUID)]
        );
    }

    #[test]
    fn test_nothing_happens_before_power_on() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::Unknown));
        m.handle_event(Event::PeripheralDiscovered(sensor()));

        assert!(m.observer().updates.is_empty());
        assert!(m.adapter().calls.is_empty());
        assert!(m.timer.armed.is_empty());
    }

    #[test]
    fn test_timeout_without_discovery_disconnects_once() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));

        let (token, _) = m.timer.armed[0];
        m.handle_event(Event::ScanTimeout(token));
        m.handle_event(Event::ScanTimeout(token));

        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching, ConnectionState::Disconnected]
        );
        assert_eq!(m.adapter().calls.last(), Some(&Call::StopScan));
        assert!(!m.is_timer_armed());

        // A late discovery after the timeout does not connect.
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        assert_eq!(m.adapter().count(&Call::Connect(sensor())), 0);
    }

    #[test]
    fn test_discovery_cancels_timer_and_connects_once() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        let (token, _) = m.timer.armed[0];

        m.handle_event(Event::PeripheralDiscovered(sensor()));
        m.handle_event(Event::PeripheralDiscovered(PeripheralHandle::new("sensor-2")));

        assert_eq!(m.timer.cancelled, vec![token]);
        assert_eq!(m.adapter().count(&Call::Connect(sensor())), 1);
        assert_eq!(
            m.adapter().count(&Call::Connect(PeripheralHandle::new("sensor-2"))),
            0
        );
        assert_eq!(m.peripheral(), Some(&sensor()));
        assert_eq!(m.state(), ConnectionState::Searching);

        // A fire that raced the cancel is stale.
        m.handle_event(Event::ScanTimeout(token));
        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching]
        );
    }

    #[test]
    fn test_full_connect_emits_single_connected() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, all_characteristics());

        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching, ConnectionState::Connected]
        );
        assert_eq!(
            m.adapter().calls,
            vec![
                Call::StopScan,
                Call::StartScan(ACCEL_GYRO_SERVICE_UUID),
                Call::StopScan,
                Call::Connect(sensor()),
                Call::DiscoverServices(sensor(), vec![ACCEL_GYRO_SERVICE_UUID]),
                Call::DiscoverCharacteristics(ACCEL_GYRO_SERVICE_UUID),
            ]
        );
        assert_eq!(
            m.bound(),
            &BoundCharacteristics {
                writable_interval: Some(SET_INTERVAL_CHARACTERISTIC_UUID),
                readable_data: Some(MOTION_DATA_CHARACTERISTIC_UUID),
                notifiable_data: None,
            }
        );
    }

    #[test]
    fn test_connected_even_without_matching_characteristics() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, vec![Uuid::from_u128(0x2a19)]);

        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching, ConnectionState::Connected]
        );
        assert_eq!(m.bound(), &BoundCharacteristics::default());
        assert!(matches!(
            m.request_update_now(),
            Err(Error::CharacteristicNotFound { .. })
        ));
    }

    #[test]
    fn test_connect_sequence_with_mock_observer() {
        let mut seq = Sequence::new();
        let mut observer = MockObserver::new();
        observer
            .expect_update_connection()
            .with(eq(ConnectionState::Searching))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        observer
            .expect_update_connection()
            .with(eq(ConnectionState::Connected))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut m = ConnectionManager::new(
            ManagerConfig::default(),
            RecordingAdapter::default(),
            ManualTimer::default(),
            observer,
        );
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        m.handle_event(Event::LinkEstablished(sensor()));
        m.handle_event(Event::ServicesDiscovered(Ok(vec![ACCEL_GYRO_SERVICE_UUID])));
        m.handle_event(Event::CharacteristicsDiscovered {
            service: ACCEL_GYRO_SERVICE_UUID,
            result: Ok(all_characteristics()),
        });

        assert!(m.is_connected());
    }

    #[test]
    fn test_discovery_errors_halt_silently() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        m.handle_event(Event::LinkEstablished(sensor()));
        m.handle_event(Event::ServicesDiscovered(Err(AdapterError::new("gatt error"))));

        assert!(!m
            .adapter()
            .calls
            .iter()
            .any(|c| matches!(c, Call::DiscoverCharacteristics(_))));

        m.handle_event(Event::CharacteristicsDiscovered {
            service: ACCEL_GYRO_SERVICE_UUID,
            result: Err(AdapterError::new("gatt error")),
        });

        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching]
        );
    }

    #[test]
    fn test_link_to_other_peripheral_is_ignored() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        m.handle_event(Event::LinkEstablished(PeripheralHandle::new("imposter")));
        m.handle_event(Event::LinkFailed {
            peripheral: sensor(),
            error: AdapterError::new("connection refused"),
        });

        assert!(!m
            .adapter()
            .calls
            .iter()
            .any(|c| matches!(c, Call::DiscoverServices(..))));
        assert_eq!(m.state(), ConnectionState::Searching);
    }

    #[test]
    fn test_invalidation_disconnects_once() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, all_characteristics());

        m.handle_event(Event::ServicesInvalidated(vec![]));
        assert!(m.is_connected());

        m.handle_event(Event::ServicesInvalidated(vec![ACCEL_GYRO_SERVICE_UUID]));
        assert_eq!(
            m.observer().connection_updates(),
            vec![
                ConnectionState::Searching,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(m.peripheral(), None);
        assert_eq!(m.bound(), &BoundCharacteristics::default());

        // No automatic rescan.
        assert_eq!(
            m.adapter().count(&Call::StartScan(ACCEL_GYRO_SERVICE_UUID)),
            1
        );
        assert!(matches!(m.request_update_now(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_write_then_read_chain() {
        let mut m = manager(ManagerConfig::interval_request());
        connect(&mut m, all_characteristics());

        m.request_update_now().unwrap();
        assert_eq!(
            m.adapter().calls.last(),
            Some(&Call::Write(SET_INTERVAL_CHARACTERISTIC_UUID, b"7.5".to_vec()))
        );
        assert_eq!(m.adapter().count(&Call::Read(MOTION_DATA_CHARACTERISTIC_UUID)), 0);

        m.handle_event(Event::WriteComplete {
            characteristic: SET_INTERVAL_CHARACTERISTIC_UUID,
            result: Ok(()),
        });
        assert_eq!(
            m.adapter().calls.last(),
            Some(&Call::Read(MOTION_DATA_CHARACTERISTIC_UUID))
        );
        assert_eq!(m.adapter().count(&Call::Read(MOTION_DATA_CHARACTERISTIC_UUID)), 1);
        assert!(m.observer().data_updates().is_empty());

        m.handle_event(Event::ValueUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Ok(b"0.02,-0.98,0.11".to_vec()),
        });
        assert_eq!(
            m.observer().data_updates(),
            vec![("0.02,-0.98,0.11".to_string(), true)]
        );
    }

    #[test]
    fn test_failed_write_issues_no_read() {
        let mut m = manager(ManagerConfig::interval_request());
        connect(&mut m, all_characteristics());

        m.request_update_now().unwrap();
        m.handle_event(Event::WriteComplete {
            characteristic: SET_INTERVAL_CHARACTERISTIC_UUID,
            result: Err(AdapterError::new("write not permitted")),
        });

        assert_eq!(m.adapter().count(&Call::Read(MOTION_DATA_CHARACTERISTIC_UUID)), 0);
        assert!(m.observer().data_updates().is_empty());
    }

    #[test]
    fn test_direct_read_trigger() {
        let mut m = manager(ManagerConfig::direct_read());
        connect(&mut m, all_characteristics());

        m.request_update_now().unwrap();
        assert_eq!(
            m.adapter().calls.last(),
            Some(&Call::Read(MOTION_DATA_CHARACTERISTIC_UUID))
        );
        assert!(!m
            .adapter()
            .calls
            .iter()
            .any(|c| matches!(c, Call::Write(..))));
    }

    #[test]
    fn test_notify_variant_subscribes_and_tags_unsolicited() {
        let mut m = manager(ManagerConfig::motion_notify());
        connect(&mut m, all_characteristics());

        assert_eq!(
            m.adapter().count(&Call::SetNotify(MOTION_DATA_CHARACTERISTIC_UUID, true)),
            1
        );

        m.handle_event(Event::NotifyStateUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Ok(()),
        });

        // Interval write does not chain a read without a readable-data role.
        m.request_update_now().unwrap();
        m.handle_event(Event::WriteComplete {
            characteristic: SET_INTERVAL_CHARACTERISTIC_UUID,
            result: Ok(()),
        });
        assert!(!m.adapter().calls.iter().any(|c| matches!(c, Call::Read(_))));

        m.handle_event(Event::ValueUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Ok(b"1,2,3".to_vec()),
        });
        assert_eq!(
            m.observer().data_updates(),
            vec![("1,2,3".to_string(), false)]
        );
    }

    #[test]
    fn test_value_tags_by_characteristic() {
        let mut m = manager(ManagerConfig::interval_request());
        connect(&mut m, all_characteristics());

        m.handle_event(Event::ValueUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Ok(b"a".to_vec()),
        });
        m.handle_event(Event::ValueUpdated {
            characteristic: SET_INTERVAL_CHARACTERISTIC_UUID,
            result: Ok(b"b".to_vec()),
        });

        assert_eq!(
            m.observer().data_updates(),
            vec![("a".to_string(), true), ("b".to_string(), false)]
        );
    }

    #[test]
    fn test_invalid_utf8_is_dropped() {
        let mut m = manager(ManagerConfig::interval_request());
        connect(&mut m, all_characteristics());

        m.handle_event(Event::ValueUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Ok(vec![0xC3, 0x28]),
        });
        m.handle_event(Event::ValueUpdated {
            characteristic: MOTION_DATA_CHARACTERISTIC_UUID,
            result: Err(AdapterError::new("read not permitted")),
        });

        assert!(m.observer().data_updates().is_empty());
        assert!(m.is_connected());
    }

    #[test]
    fn test_request_update_requires_connection() {
        let mut m = manager(ManagerConfig::default());
        assert!(matches!(m.request_update_now(), Err(Error::NotConnected)));

        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        assert!(matches!(m.request_update_now(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_power_loss_disconnects_and_power_on_rescans() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, all_characteristics());

        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.peripheral(), None);
        assert_eq!(m.adapter_state(), AdapterState::PoweredOff);

        // Repeated unavailability does not repeat the status.
        m.handle_event(Event::AdapterStateChanged(AdapterState::Resetting));

        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(
            m.observer().connection_updates(),
            vec![
                ConnectionState::Searching,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Searching
            ]
        );
        assert_eq!(m.timer.armed.len(), 2);
        assert_eq!(m.timer.armed[1].0, TimerToken(2));
        assert_eq!(
            m.adapter().count(&Call::StartScan(ACCEL_GYRO_SERVICE_UUID)),
            2
        );
    }

    #[test]
    fn test_repeated_power_on_while_connected_releases_link() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, all_characteristics());

        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));

        assert_eq!(m.adapter().count(&Call::Disconnect(sensor())), 1);
        assert_eq!(
            &m.adapter().calls[6..],
            &[
                Call::StopScan,
                Call::Disconnect(sensor()),
                Call::StartScan(ACCEL_GYRO_SERVICE_UUID),
            ]
        );
        assert_eq!(m.peripheral(), None);
        assert_eq!(m.bound(), &BoundCharacteristics::default());
        assert_eq!(m.state(), ConnectionState::Searching);

        // The fresh scan can retain a peripheral again.
        m.handle_event(Event::PeripheralDiscovered(sensor()));
        assert_eq!(m.adapter().count(&Call::Connect(sensor())), 2);
        assert_eq!(m.peripheral(), Some(&sensor()));
    }

    #[test]
    fn test_rescan_cancels_previous_timer_and_scan() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));

        assert_eq!(m.timer.cancelled, vec![TimerToken(1)]);
        assert_eq!(
            m.timer.armed,
            vec![
                (TimerToken(1), Duration::from_secs(5)),
                (TimerToken(2), Duration::from_secs(5)),
            ]
        );
        assert_eq!(
            m.adapter().calls,
            vec![
                Call::StopScan,
                Call::StartScan(ACCEL_GYRO_SERVICE_UUID),
                Call::StopScan,
                Call::StartScan(ACCEL_GYRO_SERVICE_UUID),
            ]
        );

        // The first timer is stale; only the second one ends the scan.
        m.handle_event(Event::ScanTimeout(TimerToken(1)));
        assert_eq!(m.state(), ConnectionState::Searching);
        assert!(m.is_timer_armed());

        m.handle_event(Event::ScanTimeout(TimerToken(2)));
        assert_eq!(
            m.observer().connection_updates(),
            vec![
                ConnectionState::Searching,
                ConnectionState::Searching,
                ConnectionState::Disconnected
            ]
        );
    }

    #[test]
    fn test_power_off_while_searching_cancels_timer() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        let (token, _) = m.timer.armed[0];

        m.handle_event(Event::AdapterStateChanged(AdapterState::Unauthorized));
        assert_eq!(m.timer.cancelled, vec![token]);

        m.handle_event(Event::ScanTimeout(token));
        assert_eq!(
            m.observer().connection_updates(),
            vec![ConnectionState::Searching, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_shutdown_disconnects_peripheral() {
        let mut m = manager(ManagerConfig::default());
        connect(&mut m, all_characteristics());

        m.shutdown();
        assert_eq!(m.adapter().calls.last(), Some(&Call::Disconnect(sensor())));
        assert_eq!(m.state(), ConnectionState::Disconnected);

        m.shutdown();
        assert_eq!(
            m.observer().connection_updates(),
            vec![
                ConnectionState::Searching,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[test]
    fn test_shutdown_while_scanning_stops_scan() {
        let mut m = manager(ManagerConfig::default());
        m.handle_event(Event::AdapterStateChanged(AdapterState::PoweredOn));
        let (token, _) = m.timer.armed[0];

        m.shutdown();
        assert_eq!(m.timer.cancelled, vec![token]);
        assert_eq!(m.adapter().calls.last(), Some(&Call::StopScan));
    }
}

use futures::stream::StreamExt;
use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::SystemTime,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    control::{self, ControlChannel},
    error::{FtmsError, Result},
    gatt::{self, DeviceProfile, GattTransport, LinkEvent, LinkEventStream},
    machine::{ConnectionMachine, Retry, SpeedChange},
    protocol::{
        decode_machine_features, decode_machine_status, decode_training_status,
        decode_treadmill_data, MachineFeatures,
    },
    session::{self, SessionWindow},
    store::{MemoryStore, SampleStore},
    types::{
        ConnectionState, TrainingStatus, TrainingStatusKind, TreadmillConfig, TreadmillEvent,
        TreadmillSample,
    },
    CONTROL_POINT_CHAR_UUID, MACHINE_STATUS_CHAR_UUID, TRAINING_STATUS_CHAR_UUID,
    TREADMILL_DATA_CHAR_UUID,
};

/// A connected (or connectable) FTMS treadmill
///
/// `Treadmill` owns the transport, the connection state machine and the
/// sample store. Notifications are decoded on a background task and
/// published as [`TreadmillEvent`]s; an unexpected link drop is recovered
/// with exponential backoff.
///
/// All state changes go through one lock around the state machine, so
/// notification handling, reconnection and caller commands never interleave
/// mid-transition.
///
/// # Examples
///
/// ```no_run
/// use ftms_treadmill::{ble::BtleplugTransport, ConnectionParams, Treadmill, TreadmillConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = BtleplugTransport::discover_first(&ConnectionParams::default()).await?;
///     let treadmill = Treadmill::new(transport, TreadmillConfig::default());
///     let mut events = treadmill.subscribe();
///
///     treadmill.connect().await?;
///     while let Ok(event) = events.recv().await {
///         println!("{event:?}");
///     }
///     Ok(())
/// }
/// ```
pub struct Treadmill<T: GattTransport, S: SampleStore = MemoryStore> {
    inner: Arc<Inner<T, S>>,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner<T: GattTransport, S: SampleStore> {
    transport: Arc<T>,
    store: Arc<S>,
    machine: Mutex<ConnectionMachine>,
    control: ControlChannel<T>,
    events: broadcast::Sender<TreadmillEvent>,
    profile: RwLock<Option<DeviceProfile>>,
    device_name: RwLock<Option<String>>,
    features: RwLock<Option<MachineFeatures>>,
    tasks: StdMutex<Tasks>,
}

impl<T: GattTransport> Treadmill<T, MemoryStore> {
    /// Create a driver that keeps history in memory
    #[must_use]
    pub fn new(transport: T, config: TreadmillConfig) -> Self {
        Self::with_store(transport, Arc::new(MemoryStore::new()), config)
    }
}

impl<T: GattTransport, S: SampleStore + 'static> Treadmill<T, S> {
    /// Create a driver persisting into `store`
    #[must_use]
    pub fn with_store(transport: T, store: Arc<S>, config: TreadmillConfig) -> Self {
        let transport = Arc::new(transport);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Inner {
            control: ControlChannel::new(Arc::clone(&transport), config.control),
            machine: Mutex::new(ConnectionMachine::new(config.reconnect, config.speed)),
            transport,
            store,
            events,
            profile: RwLock::new(None),
            device_name: RwLock::new(None),
            features: RwLock::new(None),
            tasks: StdMutex::new(Tasks::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TreadmillEvent> {
        self.inner.events.subscribe()
    }

    /// Sample store this driver writes to
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.inner.machine.lock().await.state()
    }

    /// Current training status
    pub async fn training_status(&self) -> TrainingStatusKind {
        self.inner.machine.lock().await.status()
    }

    /// Stored target speed in mph
    pub async fn target_speed(&self) -> f64 {
        self.inner.machine.lock().await.target_speed_mph()
    }

    /// Last sample taken while the belt was running
    pub async fn last_sample(&self) -> Option<TreadmillSample> {
        self.inner.machine.lock().await.last_sample().cloned()
    }

    /// Device name read on connect, if the peripheral exposes one
    pub async fn device_name(&self) -> Option<String> {
        self.inner.device_name.read().await.clone()
    }

    /// Feature bits read on connect
    pub async fn features(&self) -> Option<MachineFeatures> {
        *self.inner.features.read().await
    }

    /// The peripheral has a control point, so commands can be sent
    pub async fn is_control_available(&self) -> bool {
        self.inner.control.is_available().await
    }

    /// Connect, discover the profile and start receiving notifications
    ///
    /// A failure here is not retried; only drops after a successful
    /// connect are recovered automatically.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless disconnected, a link error
    /// if the peripheral cannot be reached and [`FtmsError::DiscoveryFailed`]
    /// if the treadmill characteristics are missing.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let events = inner.machine.lock().await.begin_connect()?;
        inner.publish(events);
        info!("Connecting to treadmill");

        let stream = match inner.establish().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Connection failed: {}", e);
                inner.close_link().await;
                let events = inner.machine.lock().await.connect_failed();
                inner.publish(events);
                return Err(e);
            }
        };

        let connected = inner.machine.lock().await.connect_succeeded();
        let events = match connected {
            Ok(events) => events,
            Err(e) => {
                // disconnect() ran while the link was coming up
                inner.close_link().await;
                return Err(e);
            }
        };
        inner.publish(events);
        info!("Connected");

        inner.read_initial_status().await;
        inner.spawn_pump(stream);
        Ok(())
    }

    /// Stop reconnecting, unsubscribe and close the link
    ///
    /// # Errors
    ///
    /// Returns the transport error if closing the link fails; the driver is
    /// disconnected either way.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        info!("Disconnecting from treadmill");
        inner.abort_reconnect();
        let events = inner.machine.lock().await.disconnect();

        let profile = inner.profile.write().await.take();
        inner.control.attach(None).await;
        let result = release_link(inner.transport.as_ref(), profile).await;
        inner.abort_pump();

        inner.publish(events);
        result
    }

    /// Abandon a pending reconnection; no-op unless reconnecting
    pub async fn cancel_reconnect(&self) {
        let inner = &self.inner;
        inner.abort_reconnect();
        let events = inner.machine.lock().await.cancel_reconnect();
        if !events.is_empty() {
            inner.close_link().await;
        }
        inner.publish(events);
    }

    /// Wake the machine, take control and start the belt at the target speed
    pub async fn start(&self) -> bool {
        let target = self.target_speed().await;
        self.inner.control.start(target).await
    }

    /// Stop the belt
    pub async fn stop(&self) -> bool {
        self.inner.control.stop().await
    }

    /// Pause the belt
    pub async fn pause(&self) -> bool {
        self.inner.control.pause().await
    }

    /// Reset the machine
    pub async fn reset(&self) -> bool {
        self.inner.control.reset().await
    }

    /// Request control of the machine
    pub async fn request_control(&self) -> bool {
        self.inner.control.request_control().await
    }

    /// Write a target speed in mph to the machine, leaving the stored target alone
    pub async fn set_speed(&self, speed_mph: f64) -> bool {
        self.inner.control.set_speed(speed_mph).await
    }

    /// Raise the target by `delta_mph`; returns the new target
    pub async fn increase_speed(&self, delta_mph: f64) -> f64 {
        let change = self.inner.machine.lock().await.adjust_speed(delta_mph.abs());
        self.apply_speed_change(change).await
    }

    /// Lower the target by `delta_mph`; returns the new target
    pub async fn decrease_speed(&self, delta_mph: f64) -> f64 {
        let change = self
            .inner
            .machine
            .lock()
            .await
            .adjust_speed(-delta_mph.abs());
        self.apply_speed_change(change).await
    }

    /// Set the target explicitly; returns the clamped target
    pub async fn set_target_speed(&self, speed_mph: f64) -> f64 {
        let change = self.inner.machine.lock().await.set_target_speed(speed_mph);
        self.apply_speed_change(change).await
    }

    async fn apply_speed_change(&self, change: SpeedChange) -> f64 {
        let SpeedChange {
            target_mph,
            send,
            events,
        } = change;
        self.inner.publish(events);
        if send && !self.inner.control.set_speed(target_mph).await {
            warn!("Target {:.1} mph stored but not written", target_mph);
        }
        target_mph
    }
}

impl<T: GattTransport, S: SampleStore> Drop for Treadmill<T, S> {
    fn drop(&mut self) {
        self.inner.abort_reconnect();
        self.inner.abort_pump();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.inner.transport);
        let profile = self
            .inner
            .profile
            .try_write()
            .ok()
            .and_then(|mut profile| profile.take());
        runtime.spawn(async move {
            if let Err(e) = release_link(transport.as_ref(), profile).await {
                debug!("Closing link on drop failed: {}", e);
            }
        });
    }
}

/// Unsubscribe everything `profile` subscribed to, then close the link
async fn release_link<T: GattTransport>(
    transport: &T,
    profile: Option<DeviceProfile>,
) -> Result<()> {
    if let Some(profile) = profile {
        for handle in profile.subscriptions() {
            if let Err(e) = transport.unsubscribe(handle).await {
                debug!("Unsubscribe from {} failed: {}", handle.uuid, e);
            }
        }
    }
    transport.disconnect().await
}

impl<T: GattTransport, S: SampleStore> Inner<T, S> {
    fn publish(&self, events: Vec<TreadmillEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_reconnect(&self) {
        if let Some(handle) = self.tasks().reconnect.take() {
            handle.abort();
        }
    }

    fn abort_pump(&self) {
        if let Some(handle) = self.tasks().pump.take() {
            handle.abort();
        }
    }

    async fn close_link(&self) {
        self.control.attach(None).await;
        self.profile.write().await.take();
        if let Err(e) = self.transport.disconnect().await {
            debug!("Closing link failed: {}", e);
        }
    }

    /// Link up, profile discovered, notifications subscribed
    async fn establish(&self) -> Result<LinkEventStream> {
        self.transport.connect().await?;
        let profile = gatt::discover_profile(self.transport.as_ref()).await?;
        let stream = self.transport.events().await?;

        self.transport.subscribe(&profile.treadmill_data).await?;
        self.transport.subscribe(&profile.training_status).await?;
        for handle in [&profile.machine_status, &profile.control_point]
            .into_iter()
            .flatten()
            .filter(|handle| handle.can_subscribe())
        {
            if let Err(e) = self.transport.subscribe(handle).await {
                warn!("Subscribing to {} failed: {}", handle.uuid, e);
            }
        }

        self.control.attach(profile.control_point.clone()).await;
        if profile.control_point.is_none() {
            info!("No control point, treadmill is read-only");
        }
        self.read_features(&profile).await;
        self.read_device_name(&profile).await;

        *self.profile.write().await = Some(profile);
        Ok(stream)
    }

    async fn read_features(&self, profile: &DeviceProfile) {
        let Some(handle) = profile.feature.as_ref().filter(|h| h.can_read()) else {
            return;
        };
        let features = match self.transport.read(handle).await {
            Ok(value) => decode_machine_features(&value),
            Err(e) => Err(e),
        };
        match features {
            Ok(features) => {
                info!(
                    "Machine features {:#010X}, target settings {:#010X}, speed target: {}",
                    features.machine,
                    features.target_settings,
                    features.supports_speed_target()
                );
                *self.features.write().await = Some(features);
            }
            Err(e) => debug!("Feature read failed: {}", e),
        }
    }

    async fn read_device_name(&self, profile: &DeviceProfile) {
        let Some(handle) = profile.device_name.as_ref() else {
            return;
        };
        match self.transport.read(handle).await {
            Ok(value) => {
                let name = String::from_utf8_lossy(&value).trim_end_matches('\0').to_string();
                info!("Device name: {}", name);
                *self.device_name.write().await = Some(name);
            }
            Err(e) => debug!("Device name read failed: {}", e),
        }
    }

    async fn read_initial_status(&self) {
        let handle = self
            .profile
            .read()
            .await
            .as_ref()
            .map(|profile| profile.training_status.clone());
        let Some(handle) = handle.filter(|h| h.can_read()) else {
            return;
        };

        let status = match self.transport.read(&handle).await {
            Ok(value) => decode_training_status(&value)
                .and_then(|data| TrainingStatus::from_data(&data, SystemTime::now())),
            Err(e) => Err(e),
        };
        match status {
            Ok(status) => {
                debug!("Initial training status: {}", status.kind);
                self.persist_status(&status).await;
                let events = self.machine.lock().await.apply_initial_status(status);
                self.publish(events);
            }
            Err(e) => debug!("Initial training status unavailable: {}", e),
        }
    }

    async fn persist_status(&self, status: &TrainingStatus) {
        if let Err(e) = self.store.append_status(status).await {
            warn!("Failed to store training status: {}", e);
        }
    }

    async fn handle_notification(&self, characteristic: Uuid, value: &[u8]) {
        if characteristic == TREADMILL_DATA_CHAR_UUID {
            self.handle_treadmill_data(value).await;
        } else if characteristic == TRAINING_STATUS_CHAR_UUID {
            self.handle_training_status(value).await;
        } else if characteristic == CONTROL_POINT_CHAR_UUID {
            control::log_response(value);
        } else if characteristic == MACHINE_STATUS_CHAR_UUID {
            match decode_machine_status(value) {
                Ok(status) => info!(
                    "Machine status {:?} {:02X?}",
                    status.op_code, status.parameters
                ),
                Err(e) => warn!("Dropping machine status {:02X?}: {}", value, e),
            }
        } else {
            debug!("Notification from unexpected characteristic {}", characteristic);
        }
    }

    async fn handle_treadmill_data(&self, value: &[u8]) {
        let data = match decode_treadmill_data(value) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping treadmill data {:02X?}: {}", value, e);
                return;
            }
        };
        let sample = TreadmillSample::from_data(&data, SystemTime::now());
        let events = self.machine.lock().await.on_treadmill_data(sample);

        for event in &events {
            if let TreadmillEvent::TelemetrySample(sample) = event {
                if let Err(e) = self.store.append_sample(sample).await {
                    warn!("Failed to store sample: {}", e);
                }
            }
        }
        self.publish(events);
    }

    async fn handle_training_status(&self, value: &[u8]) {
        let status = decode_training_status(value)
            .and_then(|data| TrainingStatus::from_data(&data, SystemTime::now()));
        let status = match status {
            Ok(status) => status,
            Err(FtmsError::UnrecognizedStatus(label)) => {
                debug!("Ignoring training status {}", label);
                return;
            }
            Err(e) => {
                warn!("Dropping training status {:02X?}: {}", value, e);
                return;
            }
        };

        info!("Training status: {}", status.kind);
        self.persist_status(&status).await;
        let transition = self.machine.lock().await.on_training_status(status);
        self.publish(transition.events);

        match transition.session {
            Ok(Some(window)) => self.finish_session(window).await,
            Ok(None) => {}
            Err(e) => warn!("Session not recorded: {}", e),
        }
    }

    async fn finish_session(&self, window: SessionWindow) {
        let average = match self
            .store
            .samples_between(window.started_at, window.last_sample_at)
            .await
        {
            Ok(samples) => session::average_speed(&samples),
            Err(e) => {
                warn!("Sample query failed, average speed unknown: {}", e);
                0.0
            }
        };

        let mut session = window.into_session(average);
        match self.store.append_session(&session).await {
            Ok(id) => session.id = Some(id),
            Err(e) => warn!("Failed to store session: {}", e),
        }
        info!(
            "Session ended: {}s, {:.2} mi, {:.1} mph average, {} kcal",
            session.duration_seconds,
            session.distance_miles,
            session.average_speed_mph,
            session.energy_kcal
        );
        self.publish(vec![TreadmillEvent::SessionEnded(session)]);
    }
}

impl<T: GattTransport, S: SampleStore + 'static> Inner<T, S> {
    fn spawn_pump(self: &Arc<Self>, stream: LinkEventStream) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.pump(stream).await });
        if let Some(previous) = self.tasks().pump.replace(handle) {
            previous.abort();
        }
    }

    async fn pump(self: Arc<Self>, mut stream: LinkEventStream) {
        while let Some(event) = stream.next().await {
            match event {
                LinkEvent::Notification {
                    characteristic,
                    value,
                } => self.handle_notification(characteristic, &value).await,
                LinkEvent::Disconnected => {
                    self.handle_link_lost().await;
                    return;
                }
            }
        }
        debug!("Notification stream closed");
    }

    async fn handle_link_lost(self: &Arc<Self>) {
        warn!("Link to treadmill lost");
        let (retry, events) = self.machine.lock().await.link_lost();
        self.publish(events);
        if let Some(retry) = retry {
            self.schedule_reconnect(retry);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, retry: Retry) {
        info!(
            "Reconnection attempt {} in {}ms",
            retry.attempt,
            retry.delay.as_millis()
        );
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(retry.delay).await;
            inner.attempt_reconnect(retry).await;
        });
        // the previous handle may be the task calling us; let it finish
        self.tasks().reconnect = Some(handle);
    }

    async fn attempt_reconnect(self: Arc<Self>, retry: Retry) {
        if !self.machine.lock().await.is_current(retry.epoch) {
            return;
        }
        self.control.attach(None).await;
        let result = self.establish().await;

        let mut machine = self.machine.lock().await;
        if !machine.is_current(retry.epoch) {
            drop(machine);
            debug!("Reconnection attempt {} outlived its cancel", retry.attempt);
            if result.is_ok() {
                self.close_link().await;
            }
            return;
        }

        match result {
            Ok(stream) => match machine.reconnect_succeeded() {
                Ok(events) => {
                    drop(machine);
                    self.publish(events);
                    self.spawn_pump(stream);
                }
                Err(e) => {
                    drop(machine);
                    debug!("Dropping recovered link: {}", e);
                    self.close_link().await;
                }
            },
            Err(e) => {
                warn!("Reconnection attempt {} failed: {}", retry.attempt, e);
                let (next, events) = machine.reconnect_failed();
                drop(machine);
                self.close_link().await;
                self.publish(events);
                if let Some(next) = next {
                    self.schedule_reconnect(next);
                }
            }
        }
    }
}

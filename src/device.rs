use crate::{
    ble::BleTransport,
    error::{DeskError, Result},
    protocol::{self, Command},
    supervisor::Supervisor,
    transport::{FrameHandler, Session, Transport},
    types::{
        CloudFeature, DeskConfig, DeskSnapshot, Direction, HeightReading, LinkState, MotionState,
    },
    NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, sync::Mutex as AsyncMutex, time};
use tracing::{debug, error, info, warn};

/// Error a subscriber may return; it is logged and otherwise ignored
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Handler invoked with every notification frame received from the desk
pub type Subscriber = Arc<dyn Fn(&[u8]) -> std::result::Result<(), SubscriberError> + Send + Sync>;

/// Handle identifying a registered subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct DeskState {
    link: LinkState,
    motion: MotionState,
    height: Option<HeightReading>,
    generation: u64,
    notifications_wanted: bool,
    notifications_armed: bool,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl DeskState {
    fn wants_notifications(&self) -> bool {
        self.notifications_wanted || !self.subscribers.is_empty()
    }
}

/// State shared between the controller, its supervisor and transport callbacks
pub(crate) struct DeskShared {
    config: DeskConfig,
    transport: Arc<dyn Transport>,
    session: AsyncMutex<Option<Arc<dyn Session>>>,
    state: Mutex<DeskState>,
}

/// Resets `Connecting` to `Disconnected` unless the attempt completed.
///
/// Covers both failed attempts and attempts dropped mid-flight by
/// supervisor cancellation. A session opened by an abandoned attempt is
/// closed in the background.
struct ConnectingGuard<'a> {
    shared: &'a DeskShared,
    generation: u64,
    session: Option<Arc<dyn Session>>,
    active: bool,
}

impl ConnectingGuard<'_> {
    fn complete(mut self) {
        self.active = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        {
            let mut state = self.shared.state();
            if state.generation == self.generation && state.link == LinkState::Connecting {
                state.link = LinkState::Disconnected;
            }
        }

        if let Some(session) = self.session.take() {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = session.close().await {
                            debug!("Failed to close abandoned session: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime to close abandoned session on"),
            }
        }
    }
}

impl DeskShared {
    fn state(&self) -> MutexGuard<'_, DeskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn address(&self) -> &str {
        &self.config.address
    }

    pub(crate) const fn config(&self) -> &DeskConfig {
        &self.config
    }

    fn link_state(&self) -> LinkState {
        self.state().link
    }

    fn set_motion(&self, motion: MotionState) {
        self.state().motion = motion;
    }

    /// The current session, if the link is up.
    ///
    /// A session that reports itself dead while the state still says
    /// `Connected` is treated as a lost link.
    pub(crate) async fn healthy_session(&self) -> Option<Arc<dyn Session>> {
        let session = self.session.lock().await.clone()?;
        let generation = {
            let state = self.state();
            if state.link != LinkState::Connected {
                return None;
            }
            state.generation
        };

        if session.is_connected().await {
            Some(session)
        } else {
            self.on_link_lost(generation);
            None
        }
    }

    /// Make one connection attempt unless the link is already up.
    ///
    /// Re-arms height notifications on the new session when anyone wants them.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<Arc<dyn Session>> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_ref() {
            if self.link_state() == LinkState::Connected && session.is_connected().await {
                return Ok(Arc::clone(session));
            }
        }

        if let Some(stale) = slot.take() {
            if let Err(e) = stale.close().await {
                debug!("Failed to close stale session: {}", e);
            }
        }

        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.link = LinkState::Connecting;
            state.notifications_armed = false;
            state.generation
        };
        let mut guard = ConnectingGuard {
            shared: self,
            generation,
            session: None,
            active: true,
        };

        debug!("Connecting to desk at {}", self.config.address);
        let session: Arc<dyn Session> = Arc::from(self.transport.open(&self.config.address).await?);
        guard.session = Some(Arc::clone(&session));

        let weak = Arc::downgrade(self);
        session.on_disconnected(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_link_lost(generation);
            }
        }));

        let arm = self.state().wants_notifications();
        if arm {
            session
                .subscribe(NOTIFY_CHARACTERISTIC_UUID, self.frame_handler())
                .await?;
        }

        let dropped = {
            let mut state = self.state();
            let dropped = state.generation != generation || state.link != LinkState::Connecting;
            if !dropped {
                state.link = LinkState::Connected;
                state.notifications_armed = arm;
            }
            dropped
        };
        if dropped {
            return Err(DeskError::Transport(
                "link dropped during connection setup".to_string(),
            ));
        }
        guard.complete();

        *slot = Some(Arc::clone(&session));
        info!("Connected to desk at {}", self.config.address);
        Ok(session)
    }

    /// Subscribe to height notifications on the live session if not yet armed.
    async fn arm_notifications(self: &Arc<Self>) -> Result<()> {
        let slot = self.session.lock().await;
        let session = match slot.as_ref() {
            Some(session) if self.link_state() == LinkState::Connected => Arc::clone(session),
            _ => {
                return Err(DeskError::NotConnected(
                    "Not connected to desk".to_string(),
                ))
            }
        };

        if self.state().notifications_armed {
            return Ok(());
        }

        session
            .subscribe(NOTIFY_CHARACTERISTIC_UUID, self.frame_handler())
            .await?;
        self.state().notifications_armed = true;
        debug!("Subscribed to height notifications");
        Ok(())
    }

    fn frame_handler(self: &Arc<Self>) -> FrameHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |frame: &[u8]| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_notification(frame);
            }
        })
    }

    fn handle_notification(&self, frame: &[u8]) {
        debug!("Received notification: {:02X?}", frame);

        let subscribers = {
            let mut state = self.state();
            match protocol::parse_height(frame) {
                Ok(height_mm) => {
                    let reading =
                        HeightReading::new(protocol::mm_to_cm(height_mm), self.config.height_offset_cm);
                    debug!("Height: {:.1} cm", reading.corrected);
                    state.height = Some(reading);
                }
                Err(e) => debug!("Ignoring non-height notification: {}", e),
            }
            state.subscribers.clone()
        };

        for (id, subscriber) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error in notification subscriber {:?}: {}", id, e),
                Err(_) => error!("Notification subscriber {:?} panicked", id),
            }
        }
    }

    fn on_link_lost(&self, generation: u64) {
        let mut state = self.state();
        if state.generation != generation {
            debug!("Ignoring disconnect from a replaced session");
            return;
        }
        let was = state.link;
        state.link = LinkState::Disconnected;
        state.motion = MotionState::stopped();
        state.notifications_armed = false;
        drop(state);

        if was != LinkState::Disconnected {
            info!("Disconnected from desk at {}", self.config.address);
        }
    }
}

/// Controller for one ErgoMate desk
///
/// `DeskController` owns the desk's logical session: link state, last known
/// height, commanded motion and the list of notification subscribers. It
/// drives the [`protocol`] codec over a [`Transport`].
///
/// # Connection Management
///
/// - [`connect`](Self::connect) makes a first attempt and starts a background
///   supervisor that polls the link and reconnects whenever it is down
/// - Every command reconnects once on its own if the link is down, and fails
///   with [`DeskError::NotConnected`] if that attempt fails
/// - Height notifications are re-armed on every new session once anyone has
///   subscribed, so subscribers never re-register after a drop
/// - [`disconnect`](Self::disconnect) cancels the supervisor, stops a moving
///   desk, and closes the session
///
/// # Examples
///
/// ```no_run
/// use ergodesk::{DeskConfig, DeskController};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = DeskConfig::new("AA:BB:CC:DD:EE:FF").with_height_offset(-0.5);
///     let desk = DeskController::with_ble(config).await?;
///     desk.connect().await?;
///
///     desk.subscribe(|frame: &[u8]| {
///         println!("notification: {frame:02X?}");
///         Ok(())
///     })
///     .await;
///
///     desk.move_up_for(Duration::from_secs(2)).await?;
///     println!("height: {:?}", desk.current_height());
///
///     desk.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct DeskController {
    shared: Arc<DeskShared>,
    supervisor: AsyncMutex<Option<Supervisor>>,
}

impl DeskController {
    /// Create a controller for the desk described by `config`
    ///
    /// No connection is made until [`connect`](Self::connect) or the first command.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::InvalidParameters`] if the configuration is invalid.
    pub fn new(config: DeskConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(DeskShared {
                config,
                transport,
                session: AsyncMutex::new(None),
                state: Mutex::new(DeskState::default()),
            }),
            supervisor: AsyncMutex::new(None),
        })
    }

    /// Create a controller using the system Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::InvalidParameters`] for an invalid configuration, or
    /// a BLE error if no adapter can be opened.
    pub async fn with_ble(config: DeskConfig) -> Result<Self> {
        let transport =
            BleTransport::with_scan_timeout(Duration::from_millis(config.scan_timeout_ms)).await?;
        Self::new(config, Arc::new(transport))
    }

    /// Transport address of the desk
    #[must_use]
    pub fn address(&self) -> &str {
        self.shared.address()
    }

    /// Calibration offset added to raw readings, in centimeters
    #[must_use]
    pub fn height_offset(&self) -> f32 {
        self.shared.config.height_offset_cm
    }

    /// Controller configuration
    #[must_use]
    pub fn config(&self) -> &DeskConfig {
        self.shared.config()
    }

    /// Current link state
    #[must_use]
    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    /// Whether the link is currently up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Last known height, `None` until the desk has reported one
    ///
    /// The value is kept while disconnected as the best available estimate.
    #[must_use]
    pub fn height(&self) -> Option<HeightReading> {
        self.shared.state().height
    }

    /// Last known corrected height in centimeters
    #[must_use]
    pub fn current_height(&self) -> Option<f32> {
        self.height().map(|h| h.corrected)
    }

    /// Last known raw height in centimeters
    #[must_use]
    pub fn raw_height(&self) -> Option<f32> {
        self.height().map(|h| h.raw)
    }

    /// Commanded motion state
    #[must_use]
    pub fn motion(&self) -> MotionState {
        self.shared.state().motion
    }

    /// Last known position within the configured range, 0 (lowest) to 100 (highest)
    #[must_use]
    pub fn position(&self) -> Option<u8> {
        let range = self.shared.config.height_range;
        self.current_height().map(|h| range.position_of(h))
    }

    /// Whether the desk is fully lowered, `None` if the height is unknown
    #[must_use]
    pub fn is_at_minimum(&self) -> Option<bool> {
        let range = self.shared.config.height_range;
        self.current_height().map(|h| range.is_at_minimum(h))
    }

    /// One consistent read of all observable state
    #[must_use]
    pub fn snapshot(&self) -> DeskSnapshot {
        let (link, motion, height) = {
            let state = self.shared.state();
            (state.link, state.motion, state.height)
        };
        let range = self.shared.config.height_range;

        DeskSnapshot {
            address: self.address().to_string(),
            link,
            motion,
            height,
            position: height.map(|h| range.position_of(h.corrected)),
        }
    }

    /// Connect to the desk and start the connection supervisor
    ///
    /// The supervisor is started even when this first attempt fails, so the
    /// desk is picked up once it comes into range. Its first retry then
    /// waits for the retry backoff.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the first connection attempt.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to desk at {}", self.address());
        let result = self.shared.establish().await.map(|_| ());

        // A failed attempt counts as the first try; the supervisor backs off before retrying
        let first_tick = if result.is_ok() {
            self.shared.config.poll_interval()
        } else {
            self.shared.config.retry_backoff()
        };

        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_none_or(Supervisor::is_finished) {
            *supervisor = Some(Supervisor::spawn(Arc::clone(&self.shared), first_tick));
        }

        result
    }

    /// Disconnect from the desk
    ///
    /// Cancels the supervisor first, then stops the desk if it is moving, then
    /// closes the session. Failures along the way are logged, never returned,
    /// so an unreachable desk cannot block shutdown.
    pub async fn disconnect(&self) {
        info!("Disconnecting from desk at {}", self.address());

        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }

        if self.motion().is_moving {
            if let Some(session) = self.shared.healthy_session().await {
                match Self::send(&session, &protocol::encode_command(Command::Stop)).await {
                    Ok(()) => self.shared.set_motion(MotionState::stopped()),
                    Err(e) => warn!("Failed to stop desk before disconnect: {}", e),
                }
            }
        }

        let session = self.shared.session.lock().await.take();
        if let Some(session) = session {
            match time::timeout(self.shared.config.disconnect_timeout(), session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error during disconnect: {}", e),
                Err(_) => warn!(
                    "Timed out closing session after {:?}",
                    self.shared.config.disconnect_timeout()
                ),
            }
        }

        {
            let mut state = self.shared.state();
            state.generation += 1;
            state.link = LinkState::Disconnected;
            state.motion = MotionState::stopped();
            state.notifications_armed = false;
        }
        info!("Disconnected from desk at {}", self.address());
    }

    /// Start moving the desk up until [`stop`](Self::stop) or the top limit
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NotConnected`] if the desk cannot be reached, or
    /// [`DeskError::Transport`] if the write fails.
    pub async fn move_up(&self) -> Result<()> {
        debug!("Moving desk up");
        self.start_moving(Command::Up, Direction::Up).await
    }

    /// Start moving the desk down until [`stop`](Self::stop) or the bottom limit
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NotConnected`] if the desk cannot be reached, or
    /// [`DeskError::Transport`] if the write fails.
    pub async fn move_down(&self) -> Result<()> {
        debug!("Moving desk down");
        self.start_moving(Command::Down, Direction::Down).await
    }

    /// Stop desk movement
    ///
    /// The motion state is cleared only once the stop frame was written.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NotConnected`] if the desk cannot be reached, or
    /// [`DeskError::Transport`] if the write fails.
    pub async fn stop(&self) -> Result<()> {
        debug!("Stopping desk");
        let session = self.ensure_session().await?;
        Self::send(&session, &protocol::encode_command(Command::Stop)).await?;
        self.shared.set_motion(MotionState::stopped());
        Ok(())
    }

    /// Move the desk to an absolute height in centimeters
    ///
    /// The target is clamped to the configured height range, converted from
    /// corrected to raw units using the height offset, and saturated again
    /// by the codec to the controller board's 65.0-130.0 cm window. The
    /// direction of travel is reported as [`Direction::None`] because the
    /// desk gives no feedback about which side of the target it started on.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::InvalidParameters`] for a non-finite target,
    /// [`DeskError::NotConnected`] if the desk cannot be reached, or
    /// [`DeskError::Transport`] if the write fails.
    pub async fn move_to_height(&self, height_cm: f32) -> Result<()> {
        if !height_cm.is_finite() {
            return Err(DeskError::InvalidParameters(format!(
                "target height {height_cm} is not a number"
            )));
        }

        let session = self.ensure_session().await?;

        let config = &self.shared.config;
        let target = config.height_range.clamp(height_cm);
        let frame = protocol::encode_height(protocol::cm_to_mm(target - config.height_offset_cm));
        debug!("Moving to height {:.1} cm (frame: {:02X?})", target, &frame[..]);

        self.shared.set_motion(MotionState::moving(Direction::None));
        Self::send(&session, &frame).await
    }

    /// Move the desk to a 0..=100 position within the configured range
    ///
    /// # Errors
    ///
    /// Same as [`move_to_height`](Self::move_to_height).
    pub async fn move_to_position(&self, position: u8) -> Result<()> {
        let height = self.shared.config.height_range.height_for_position(position);
        debug!("Moving to position {} ({:.1} cm)", position, height);
        self.move_to_height(height).await
    }

    /// Move up for `duration`, then stop
    ///
    /// There is no limit-switch telemetry, so the stop is sent at expiry even
    /// if the desk reached its top limit earlier.
    ///
    /// # Errors
    ///
    /// Returns the error of the move or of the final stop.
    pub async fn move_up_for(&self, duration: Duration) -> Result<()> {
        self.move_up().await?;
        time::sleep(duration).await;
        self.stop().await
    }

    /// Move down for `duration`, then stop
    ///
    /// # Errors
    ///
    /// Returns the error of the move or of the final stop.
    pub async fn move_down_for(&self, duration: Duration) -> Result<()> {
        self.move_down().await?;
        time::sleep(duration).await;
        self.stop().await
    }

    /// Register a handler for every notification frame
    ///
    /// Handlers run in registration order with the raw frame, after the
    /// height has been updated. A handler that errors or panics is logged
    /// and does not affect other handlers. If the link is up, height
    /// notifications are armed right away; otherwise on the next connect.
    pub async fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&[u8]) -> std::result::Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.shared.state();
            state.next_subscription += 1;
            let id = SubscriptionId(state.next_subscription);
            let subscriber: Subscriber = Arc::new(handler);
            state.subscribers.push((id, subscriber));
            id
        };

        if self.is_connected() {
            if let Err(e) = self.shared.arm_notifications().await {
                warn!("Failed to arm height notifications: {}", e);
            }
        }

        id
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.shared.state();
        let before = state.subscribers.len();
        state.subscribers.retain(|(registered, _)| *registered != id);
        before != state.subscribers.len()
    }

    /// Start height notifications on the live session and keep them armed across reconnects
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NotConnected`] if the link is down; the request is
    /// still remembered and honored on the next connect.
    pub async fn subscribe_notifications(&self) -> Result<()> {
        self.shared.state().notifications_wanted = true;
        self.shared.arm_notifications().await
    }

    /// Stop height notifications on the live session
    ///
    /// Registered subscribers keep notifications armed on later reconnects.
    pub async fn unsubscribe_notifications(&self) {
        self.shared.state().notifications_wanted = false;

        let session = self.shared.healthy_session().await;
        if let Some(session) = session {
            if let Err(e) = session.unsubscribe(NOTIFY_CHARACTERISTIC_UUID).await {
                warn!("Error unsubscribing: {}", e);
            }
        }
        self.shared.state().notifications_armed = false;
        debug!("Unsubscribed from height notifications");
    }

    /// Sound the desk buzzer
    ///
    /// # Errors
    ///
    /// Always returns [`DeskError::Unsupported`]: the vendor app relays this
    /// through its cloud service, not over Bluetooth.
    pub async fn beep(&self, duration_ms: u32) -> Result<()> {
        debug!("Beep of {} ms requested", duration_ms);
        Err(DeskError::Unsupported {
            feature: CloudFeature::Beep,
        })
    }

    /// Engage the child lock
    ///
    /// # Errors
    ///
    /// Always returns [`DeskError::Unsupported`].
    pub async fn lock(&self) -> Result<()> {
        Err(DeskError::Unsupported {
            feature: CloudFeature::Lock,
        })
    }

    /// Release the child lock
    ///
    /// # Errors
    ///
    /// Always returns [`DeskError::Unsupported`].
    pub async fn unlock(&self) -> Result<()> {
        Err(DeskError::Unsupported {
            feature: CloudFeature::Unlock,
        })
    }

    /// Reset the desk controller to factory settings
    ///
    /// # Errors
    ///
    /// Always returns [`DeskError::Unsupported`].
    pub async fn factory_reset(&self) -> Result<()> {
        Err(DeskError::Unsupported {
            feature: CloudFeature::FactoryReset,
        })
    }

    async fn start_moving(&self, command: Command, direction: Direction) -> Result<()> {
        let session = self.ensure_session().await?;
        self.shared.set_motion(MotionState::moving(direction));
        Self::send(&session, &protocol::encode_command(command)).await
    }

    /// The live session, reconnecting once if the link is down.
    async fn ensure_session(&self) -> Result<Arc<dyn Session>> {
        if let Some(session) = self.shared.healthy_session().await {
            return Ok(session);
        }

        debug!("Not connected, attempting to reconnect...");
        self.shared
            .establish()
            .await
            .map_err(|e| DeskError::NotConnected(format!("Failed to reconnect: {e}")))
    }

    async fn send(session: &Arc<dyn Session>, frame: &[u8]) -> Result<()> {
        debug!("Sending frame to desk: {:02X?}", frame);
        session.write(WRITE_CHARACTERISTIC_UUID, frame, true).await
    }
}

impl Drop for DeskController {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }

        let session = self
            .shared
            .session
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let (Some(session), Ok(handle)) = (session, Handle::try_current()) {
            handle.spawn(async move {
                let _ = session.close().await;
            });
        }
    }
}

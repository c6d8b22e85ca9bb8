//! Link-layer capability the desk controller is written against.
//!
//! A [`Transport`] opens sessions to a device address. A [`Session`] writes
//! frames to characteristics, delivers notification frames to a handler and
//! reports link loss through a callback. [`crate::ble::BleTransport`] is the
//! btleplug-backed implementation.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Callback receiving raw notification frames
pub type FrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked when the transport loses the link
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Opens sessions to devices
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session with the device at `address`
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be reached or does not expose
    /// the expected characteristics.
    async fn open(&self, address: &str) -> Result<Box<dyn Session>>;
}

/// One established link to a device
#[async_trait]
pub trait Session: Send + Sync {
    /// Write a frame to a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the write fails.
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Start delivering notifications of a characteristic to `on_frame`
    ///
    /// # Errors
    ///
    /// Returns an error if the characteristic is unknown or the subscription fails.
    async fn subscribe(&self, characteristic: Uuid, on_frame: FrameHandler) -> Result<()>;

    /// Stop delivering notifications of a characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the request.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Register the callback fired when this session's link drops
    fn on_disconnected(&self, handler: DisconnectHandler);

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;

    /// Tear the link down
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to disconnect cleanly.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for controller tests.

    use super::{DisconnectHandler, FrameHandler, Session, Transport};
    use crate::error::{DeskError, Result};
    use async_trait::async_trait;
    use std::{
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    };
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Open(String),
        Write(Vec<u8>),
        Subscribe(Uuid),
        Unsubscribe(Uuid),
        Close,
    }

    #[derive(Default)]
    struct State {
        reachable: bool,
        fail_writes: bool,
        open_delay: Option<Duration>,
        subscribe_delay: Option<Duration>,
        checks_before_drop: Option<usize>,
        open_attempts: usize,
        events: Vec<Event>,
        current_session: u64,
        connected: bool,
        frame_handler: Option<FrameHandler>,
        disconnect_handlers: Vec<(u64, DisconnectHandler)>,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<State>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            let transport = Self::default();
            transport.set_reachable(true);
            transport
        }

        pub fn unreachable() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.lock().reachable = reachable;
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.lock().fail_writes = fail;
        }

        pub fn set_open_delay(&self, delay: Option<Duration>) {
            self.lock().open_delay = delay;
        }

        pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
            self.lock().subscribe_delay = delay;
        }

        /// Let the link drop silently right after `checks` more liveness checks.
        pub fn drop_after_checks(&self, checks: usize) {
            self.lock().checks_before_drop = Some(checks);
        }

        pub fn open_attempts(&self) -> usize {
            self.lock().open_attempts
        }

        pub fn events(&self) -> Vec<Event> {
            self.lock().events.clone()
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.lock()
                .events
                .iter()
                .filter_map(|event| match event {
                    Event::Write(data) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn subscribe_count(&self) -> usize {
            self.lock()
                .events
                .iter()
                .filter(|event| matches!(event, Event::Subscribe(_)))
                .count()
        }

        pub fn is_armed(&self) -> bool {
            self.lock().frame_handler.is_some()
        }

        /// Deliver a notification frame the way a real link would.
        pub fn push_frame(&self, frame: &[u8]) {
            let handler = self.lock().frame_handler.clone();
            if let Some(handler) = handler {
                handler(frame);
            }
        }

        /// Drop the current link and fire its disconnect callback.
        pub fn drop_link(&self) {
            let handler = {
                let mut state = self.lock();
                state.connected = false;
                state.frame_handler = None;
                let current = state.current_session;
                Self::handler_for(&state, current)
            };
            if let Some(handler) = handler {
                handler();
            }
        }

        /// Fire the disconnect callback registered by the `session`-th opened session.
        pub fn fire_disconnect_of(&self, session: u64) {
            let handler = Self::handler_for(&self.lock(), session);
            if let Some(handler) = handler {
                handler();
            }
        }

        fn handler_for(state: &State, session: u64) -> Option<DisconnectHandler> {
            state
                .disconnect_handlers
                .iter()
                .find(|(id, _)| *id == session)
                .map(|(_, handler)| Arc::clone(handler))
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self, address: &str) -> Result<Box<dyn Session>> {
            let delay = self.lock().open_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            state.open_attempts += 1;
            state.events.push(Event::Open(address.to_string()));
            if !state.reachable {
                return Err(DeskError::Transport("desk out of range".to_string()));
            }

            state.current_session += 1;
            state.connected = true;
            state.frame_handler = None;
            Ok(Box::new(MockSession {
                state: Arc::clone(&self.state),
                id: state.current_session,
            }))
        }
    }

    struct MockSession {
        state: Arc<Mutex<State>>,
        id: u64,
    }

    impl MockSession {
        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        fn is_live(&self, state: &State) -> bool {
            state.connected && state.current_session == self.id
        }
    }

    #[async_trait]
    impl Session for MockSession {
        async fn write(&self, _characteristic: Uuid, data: &[u8], _with_response: bool) -> Result<()> {
            let mut state = self.lock();
            if !self.is_live(&state) {
                return Err(DeskError::Transport("link is down".to_string()));
            }
            if state.fail_writes {
                return Err(DeskError::Transport("write rejected".to_string()));
            }
            state.events.push(Event::Write(data.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, characteristic: Uuid, on_frame: FrameHandler) -> Result<()> {
            let delay = self.lock().subscribe_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.lock();
            if !self.is_live(&state) {
                return Err(DeskError::Transport("link is down".to_string()));
            }
            state.events.push(Event::Subscribe(characteristic));
            state.frame_handler = Some(on_frame);
            Ok(())
        }

        async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
            let mut state = self.lock();
            state.events.push(Event::Unsubscribe(characteristic));
            if self.is_live(&state) {
                state.frame_handler = None;
            }
            Ok(())
        }

        fn on_disconnected(&self, handler: DisconnectHandler) {
            self.lock().disconnect_handlers.push((self.id, handler));
        }

        async fn is_connected(&self) -> bool {
            let mut state = self.lock();
            if !self.is_live(&state) {
                return false;
            }
            if let Some(checks) = state.checks_before_drop {
                if checks <= 1 {
                    state.checks_before_drop = None;
                    state.connected = false;
                    state.frame_handler = None;
                } else {
                    state.checks_before_drop = Some(checks - 1);
                }
            }
            true
        }

        async fn close(&self) -> Result<()> {
            let handler = {
                let mut state = self.lock();
                state.events.push(Event::Close);
                if !self.is_live(&state) {
                    return Ok(());
                }
                state.connected = false;
                state.frame_handler = None;
                MockTransport::handler_for(&state, self.id)
            };
            if let Some(handler) = handler {
                handler();
            }
            Ok(())
        }
    }
}

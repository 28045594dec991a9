use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::gpio::{NotificationHandler, PinBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_ascii(self) -> u8 {
        match self {
            Level::Low => b'0',
            Level::High => b'1',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
}

/// Identifier of the notification line a pin raises its edges on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineId(pub u32);

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof that a session took part in a pin's notification registration.
///
/// Carries the subscription epoch it was taken in, so a session whose
/// registration was force-released by `disable-irq` cannot decrement the
/// count of a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinSnapshot {
    pub pin_id: u32,
    pub direction: Direction,
    pub level: Level,
    pub notifications_enabled: bool,
    pub trigger_edge: Option<Edge>,
    pub subscriber_count: usize,
}

struct PinState {
    direction: Direction,
    level: Level,
    notifications_enabled: bool,
    trigger_edge: Edge,
    subscriber_count: usize,
    registered: Option<LineId>,
    epoch: u64,
}

impl PinState {
    fn reserved() -> Self {
        Self {
            direction: Direction::Output,
            level: Level::Low,
            notifications_enabled: false,
            trigger_edge: Edge::Rising,
            subscriber_count: 0,
            registered: None,
            epoch: 0,
        }
    }
}

/// Per-pin control block.
///
/// Every field is guarded by one mutex, which is also held across the backend
/// calls that change registration or direction. Backend calls are leaves and
/// never re-enter a control block.
pub struct PinControl<B: PinBackend> {
    pin_id: u32,
    backend: Arc<B>,
    handler: NotificationHandler,
    state: Mutex<PinState>,
}

impl<B: PinBackend> PinControl<B> {
    /// Control block for a pin the backend has just reserved as a low output.
    pub fn new(pin_id: u32, backend: Arc<B>, handler: NotificationHandler) -> Self {
        Self {
            pin_id,
            backend,
            handler,
            state: Mutex::new(PinState::reserved()),
        }
    }

    pub fn pin_id(&self) -> u32 {
        self.pin_id
    }

    pub fn snapshot(&self) -> PinSnapshot {
        let state = self.state.lock();
        PinSnapshot {
            pin_id: self.pin_id,
            direction: state.direction,
            level: state.level,
            notifications_enabled: state.notifications_enabled,
            trigger_edge: state.notifications_enabled.then_some(state.trigger_edge),
            subscriber_count: state.subscriber_count,
        }
    }

    /// Instantaneous physical level, read without taking the guard.
    pub fn physical_level(&self) -> Result<Level, AppError> {
        self.backend.get_level(self.pin_id)
    }

    pub fn open_session(&self) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state.lock();
        if !state.notifications_enabled || state.direction != Direction::Input {
            return Ok(None);
        }

        if state.subscriber_count == 0 {
            let line = self.backend.notification_line_for(self.pin_id)?;
            self.backend
                .register_notification(line, state.trigger_edge, self.handler.clone())
                .inspect_err(|e| {
                    warn!("unable to claim line {line} for pin {}: {e}", self.pin_id)
                })?;
            info!(
                "pin {} notification requested on line {line} ({:?})",
                self.pin_id, state.trigger_edge
            );
            state.registered = Some(line);
        }
        state.subscriber_count += 1;

        Ok(Some(Subscription { epoch: state.epoch }))
    }

    pub fn close_session(&self, subscription: Option<Subscription>) {
        let mut state = self.state.lock();

        if let Some(sub) = subscription
            && sub.epoch == state.epoch
            && state.subscriber_count > 0
        {
            state.subscriber_count -= 1;
            if state.subscriber_count == 0 {
                self.release_registration(&mut state);
                info!("pin {} notification released", self.pin_id);
            }
        }

        if !state.notifications_enabled && state.subscriber_count > 0 {
            self.force_release(&mut state);
            info!("pin {} notification disabled", self.pin_id);
        }
    }

    pub fn set_direction(&self, direction: Direction) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.direction == direction {
            return Ok(());
        }

        self.backend.set_direction(self.pin_id, direction)?;
        state.direction = direction;
        if direction == Direction::Output {
            state.level = Level::Low;
        }
        info!("pin {} direction set to {direction:?}", self.pin_id);
        Ok(())
    }

    pub fn set_level(&self, level: Level) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.direction == Direction::Input {
            return Err(AppError::PermissionDenied(format!(
                "cannot set pin {}, direction: input",
                self.pin_id
            )));
        }

        self.backend.set_level(self.pin_id, level)?;
        state.level = level;
        Ok(())
    }

    /// Arms edge notification. Registration happens on the next open, not
    /// here, so sessions that are already open do not subscribe.
    pub fn arm_notification(&self, edge: Edge) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.direction != Direction::Input {
            self.backend.set_direction(self.pin_id, Direction::Input)?;
            state.direction = Direction::Input;
        }
        state.trigger_edge = edge;
        state.notifications_enabled = true;
        info!("pin {} armed for {edge:?} edge", self.pin_id);
        Ok(())
    }

    pub fn disarm_notification(&self) {
        let mut state = self.state.lock();
        state.notifications_enabled = false;
        if state.subscriber_count > 0 {
            self.force_release(&mut state);
        }
        info!("pin {} notification disarmed", self.pin_id);
    }

    /// Returns the pin to a low output and hands it back to the backend.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.notifications_enabled = false;
        if state.subscriber_count > 0 {
            self.force_release(&mut state);
        }
        if let Err(e) = self.backend.set_direction(self.pin_id, Direction::Output) {
            warn!("pin {} could not be driven low on shutdown: {e}", self.pin_id);
        }
        state.direction = Direction::Output;
        state.level = Level::Low;
        self.backend.release(self.pin_id);
    }

    fn force_release(&self, state: &mut PinState) {
        self.release_registration(state);
        state.subscriber_count = 0;
        state.epoch += 1;
    }

    fn release_registration(&self, state: &mut PinState) {
        if let Some(line) = state.registered.take() {
            self.backend.unregister_notification(line);
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

use log::warn;

use crate::config::PinConfig;
use crate::error::AppError;
use crate::gpio::{Delivery, NotificationHandler, PinBackend};
use crate::pin::{Direction, Edge, Level, LineId};

/// Offset between a pin number and its mock notification line.
pub const MOCK_LINE_BASE: u32 = 160;

/// In-memory backend. Lines can be driven from outside to simulate
/// edges, and reservation or registration failures can be injected.
#[derive(Default)]
pub struct MockPinBackend {
    pins: RwLock<HashMap<u32, Mutex<MockPinState>>>, // keyed by pin id
    lines: RwLock<HashMap<LineId, MockRegistration>>,
    faults: Mutex<MockFaults>,
    stats: Mutex<MockStats>,
}

struct MockPinState {
    direction: Direction,
    level: Level,
}

#[derive(Clone)]
struct MockRegistration {
    edge: Edge,
    handler: NotificationHandler,
}

#[derive(Default)]
struct MockFaults {
    reserve: HashSet<u32>,
    next_registration: bool,
}

#[derive(Default)]
struct MockStats {
    registrations: usize,
    unregistrations: usize,
    released: Vec<u32>,
}

fn poisoned<T>(e: PoisonError<T>) -> AppError {
    AppError::BackendUnavailable(format!("lock poisoned: {e}"))
}

fn line_for(pin_id: u32) -> LineId {
    LineId(pin_id + MOCK_LINE_BASE)
}

impl MockPinBackend {
    fn with_pin<T>(
        &self,
        pin_id: u32,
        f: impl FnOnce(&mut MockPinState) -> T,
    ) -> Result<T, AppError> {
        let pins = self.pins.read().map_err(poisoned)?;
        let entry = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::BackendUnavailable(format!("pin {pin_id} not reserved")))?;
        let mut pin = entry.lock().map_err(poisoned)?;
        Ok(f(&mut pin))
    }

    /// Makes every later reservation of `pin_id` fail.
    pub fn fail_reservation(&self, pin_id: u32) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve
            .insert(pin_id);
    }

    /// Makes the next notification registration fail.
    pub fn fail_next_registration(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_registration = true;
    }

    /// Drives the pin from outside, as wiring would. Fires the registered
    /// handler when the transition matches its edge.
    pub fn drive(&self, pin_id: u32, level: Level) -> Result<Option<Delivery>, AppError> {
        let old = self.with_pin(pin_id, |pin| std::mem::replace(&mut pin.level, level))?;
        let observed = match (old, level) {
            (Level::Low, Level::High) => Edge::Rising,
            (Level::High, Level::Low) => Edge::Falling,
            _ => return Ok(None),
        };

        let line = line_for(pin_id);
        let registration = self.lines.read().map_err(poisoned)?.get(&line).cloned();
        // handler runs with no backend lock held
        Ok(registration
            .filter(|r| r.edge == observed)
            .map(|r| r.handler.notify(line, observed)))
    }

    /// Raises the registered edge on the pin's line, if one is registered.
    pub fn fire(&self, pin_id: u32) -> Option<Delivery> {
        let line = line_for(pin_id);
        let registration = self.lines.read().ok()?.get(&line).cloned()?;
        Some(registration.handler.notify(line, registration.edge))
    }

    pub fn is_reserved(&self, pin_id: u32) -> bool {
        self.pins
            .read()
            .map(|pins| pins.contains_key(&pin_id))
            .unwrap_or(false)
    }

    pub fn level(&self, pin_id: u32) -> Option<Level> {
        self.with_pin(pin_id, |pin| pin.level).ok()
    }

    pub fn direction(&self, pin_id: u32) -> Option<Direction> {
        self.with_pin(pin_id, |pin| pin.direction).ok()
    }

    pub fn registered_edge(&self, pin_id: u32) -> Option<Edge> {
        self.lines
            .read()
            .ok()?
            .get(&line_for(pin_id))
            .map(|r| r.edge)
    }

    pub fn is_registered(&self, pin_id: u32) -> bool {
        self.registered_edge(pin_id).is_some()
    }

    /// Total registrations made since creation.
    pub fn registrations(&self) -> usize {
        self.stats.lock().map(|s| s.registrations).unwrap_or(0)
    }

    /// Total registrations released since creation.
    pub fn unregistrations(&self) -> usize {
        self.stats.lock().map(|s| s.unregistrations).unwrap_or(0)
    }

    /// Pins released, in release order.
    pub fn released(&self) -> Vec<u32> {
        self.stats
            .lock()
            .map(|s| s.released.clone())
            .unwrap_or_default()
    }
}

impl PinBackend for MockPinBackend {
    fn reserve(&self, pin_id: u32, _pin: &PinConfig) -> Result<(), AppError> {
        if self.faults.lock().map_err(poisoned)?.reserve.contains(&pin_id) {
            return Err(AppError::BackendUnavailable(format!(
                "pin {pin_id} could not be reserved"
            )));
        }

        let mut pins = self.pins.write().map_err(poisoned)?;
        if pins.contains_key(&pin_id) {
            return Err(AppError::BackendUnavailable(format!("pin {pin_id} busy")));
        }
        pins.insert(
            pin_id,
            Mutex::new(MockPinState {
                direction: Direction::Output,
                level: Level::Low,
            }),
        );
        Ok(())
    }

    fn release(&self, pin_id: u32) {
        let removed = self
            .pins
            .write()
            .map(|mut pins| pins.remove(&pin_id).is_some())
            .unwrap_or(false);
        if !removed {
            warn!("release of unreserved pin {pin_id}");
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.released.push(pin_id);
        }
    }

    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), AppError> {
        self.with_pin(pin_id, |pin| {
            pin.direction = direction;
            if direction == Direction::Output {
                pin.level = Level::Low;
            }
        })
    }

    fn set_level(&self, pin_id: u32, level: Level) -> Result<(), AppError> {
        self.with_pin(pin_id, |pin| {
            if pin.direction == Direction::Output {
                pin.level = level;
                Ok(())
            } else {
                Err(AppError::BackendUnavailable(format!(
                    "pin {pin_id} is not an output"
                )))
            }
        })?
    }

    fn get_level(&self, pin_id: u32) -> Result<Level, AppError> {
        self.with_pin(pin_id, |pin| pin.level)
    }

    fn notification_line_for(&self, pin_id: u32) -> Result<LineId, AppError> {
        self.with_pin(pin_id, |_| line_for(pin_id))
    }

    fn register_notification(
        &self,
        line: LineId,
        edge: Edge,
        handler: NotificationHandler,
    ) -> Result<(), AppError> {
        {
            let mut faults = self.faults.lock().map_err(poisoned)?;
            if std::mem::take(&mut faults.next_registration) {
                return Err(AppError::BackendUnavailable(format!(
                    "unable to claim line {line}"
                )));
            }
        }

        let mut lines = self.lines.write().map_err(poisoned)?;
        if lines.contains_key(&line) {
            return Err(AppError::BackendUnavailable(format!("line {line} busy")));
        }
        lines.insert(line, MockRegistration { edge, handler });
        self.stats.lock().map_err(poisoned)?.registrations += 1;
        Ok(())
    }

    fn unregister_notification(&self, line: LineId) {
        let removed = self
            .lines
            .write()
            .map(|mut lines| lines.remove(&line).is_some())
            .unwrap_or(false);
        if !removed {
            warn!("release of unregistered line {line}");
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.unregistrations += 1;
        }
    }
}

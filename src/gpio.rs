use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::TimeSource;
use crate::config::{AppConfig, PinConfig};
use crate::debounce::DebounceWindow;
use crate::error::AppError;
use crate::pin::{Direction, Edge, Level, LineId, PinControl, PinSnapshot};
use crate::session::Session;

/// Physical side of the pins: reservation, electrical level and edge
/// notification lines.
///
/// None of these calls may invoke a [`NotificationHandler`] synchronously.
pub trait PinBackend: Send + Sync {
    /// Claims the pin as an output driven low.
    fn reserve(&self, pin_id: u32, pin: &PinConfig) -> Result<(), AppError>;
    fn release(&self, pin_id: u32);
    /// Becoming an output also drives the pin low.
    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), AppError>;
    fn set_level(&self, pin_id: u32, level: Level) -> Result<(), AppError>;
    fn get_level(&self, pin_id: u32) -> Result<Level, AppError>;
    fn notification_line_for(&self, pin_id: u32) -> Result<LineId, AppError>;
    fn register_notification(
        &self,
        line: LineId,
        edge: Edge,
        handler: NotificationHandler,
    ) -> Result<(), AppError>;
    fn unregister_notification(&self, line: LineId);
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub line: LineId,
    pub edge: Edge,
    pub timestamp_ms: u64,
}

/// What became of one notification. Either way the line is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Debounced,
}

impl Delivery {
    pub fn is_handled(&self) -> bool {
        matches!(self, Delivery::Accepted | Delivery::Debounced)
    }
}

pub struct EdgeDispatcher {
    clock: Arc<dyn TimeSource>,
    window: DebounceWindow,
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EdgeDispatcher {
    pub fn new(config: &AppConfig, clock: Arc<dyn TimeSource>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);

        let mut event_history = FxHashMap::default();
        for id in config.pins.keys() {
            event_history.insert(*id, RwLock::new(VecDeque::new()));
        }

        Self {
            clock,
            window: DebounceWindow::new(&config.debounce),
            event_tx,
            event_history,
            event_history_capacity: config.event_history_capacity,
        }
    }

    pub fn window(&self) -> &DebounceWindow {
        &self.window
    }

    pub fn dispatch(&self, pin_id: u32, line: LineId, edge: Edge) -> Delivery {
        let now = self.clock.now_ms();
        if !self.window.try_accept(line, now) {
            debug!("ignored interrupt [{line}] on pin {pin_id}");
            return Delivery::Debounced;
        }
        info!("interrupt [{line}] was triggered on pin {pin_id}");

        let event = EdgeEvent {
            pin_id,
            line,
            edge,
            timestamp_ms: now,
        };
        if let Some(history_lock) = self.event_history.get(&pin_id) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);

        Delivery::Accepted
    }
}

/// Callback a backend invokes when a registered line sees its edge.
#[derive(Clone)]
pub struct NotificationHandler {
    pin_id: u32,
    dispatcher: Arc<EdgeDispatcher>,
}

impl NotificationHandler {
    pub fn new(pin_id: u32, dispatcher: Arc<EdgeDispatcher>) -> Self {
        Self { pin_id, dispatcher }
    }

    pub fn pin_id(&self) -> u32 {
        self.pin_id
    }

    pub fn notify(&self, line: LineId, edge: Edge) -> Delivery {
        self.dispatcher.dispatch(self.pin_id, line, edge)
    }
}

/// The fixed set of managed pins, brought up once and torn down once.
pub struct PinManager<B: PinBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    pins: FxHashMap<u32, Arc<PinControl<B>>>,
    dispatcher: Arc<EdgeDispatcher>,
    shut_down: AtomicBool,
}

impl<B: PinBackend> PinManager<B> {
    /// Reserves every configured pin. If any reservation fails, the pins
    /// reserved so far are released in reverse order and the failure returned.
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<B>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, AppError> {
        let dispatcher = Arc::new(EdgeDispatcher::new(&config, clock));

        let mut pins: FxHashMap<u32, Arc<PinControl<B>>> = FxHashMap::default();
        pins.try_reserve(config.pins.len())
            .map_err(|e| AppError::ResourceExhausted(format!("pin table: {e}")))?;

        let mut reserved: Vec<u32> = Vec::with_capacity(config.pins.len());
        for id in config.pin_ids() {
            let pin_cfg = &config.pins[&id];
            if let Err(e) = backend.reserve(id, pin_cfg) {
                error!("error requesting pin {id} ({}): {e}", pin_cfg.name);
                for rid in reserved.iter().rev() {
                    backend.release(*rid);
                }
                return Err(e);
            }
            reserved.push(id);

            let handler = NotificationHandler::new(id, dispatcher.clone());
            pins.insert(id, Arc::new(PinControl::new(id, backend.clone(), handler)));
        }

        info!("{} pins initialized", pins.len());

        Ok(Self {
            config,
            backend,
            pins,
            dispatcher,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn dispatcher(&self) -> &Arc<EdgeDispatcher> {
        &self.dispatcher
    }

    pub fn pin(&self, pin_id: u32) -> Result<&Arc<PinControl<B>>, AppError> {
        self.pins
            .get(&pin_id)
            .ok_or_else(|| AppError::NotFound(format!("pin {pin_id}")))
    }

    pub fn open(&self, pin_id: u32) -> Result<Session<B>, AppError> {
        let pin = self.pin(pin_id)?;
        Session::open(pin.clone())
    }

    pub fn list_pins(&self) -> Vec<PinSnapshot> {
        let mut pins: Vec<PinSnapshot> = self.pins.values().map(|p| p.snapshot()).collect();
        pins.sort_unstable_by_key(|p| p.pin_id);
        pins
    }

    pub fn pin_snapshot(&self, pin_id: u32) -> Result<PinSnapshot, AppError> {
        Ok(self.pin(pin_id)?.snapshot())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.dispatcher.event_tx.subscribe()
    }

    pub fn get_events(&self, pin_id: u32, limit: Option<usize>) -> Result<Vec<EdgeEvent>, AppError> {
        self.pin(pin_id)?;

        Ok(self
            .dispatcher
            .event_history
            .get(&pin_id)
            .map(|d| {
                let history = d.read();
                let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    /// Drives every pin low as an output, drops live registrations and
    /// releases the reservations. Runs at most once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for id in self.config.pin_ids().into_iter().rev() {
            if let Some(pin) = self.pins.get(&id) {
                pin.shutdown();
            }
        }
        info!("pin manager shut down");
    }
}

impl<B: PinBackend> Drop for PinManager<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock as PLRwLock};
use rustc_hash::FxHashMap;

use crate::config::PinConfig;
use crate::error::AppError;
use crate::gpio::{NotificationHandler, PinBackend};
use crate::pin::{Direction, Edge, Level, LineId};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Hardware backend over the GPIO character device. The notification line
/// of a pin is the pin id itself; each live registration owns one listener
/// thread that feeds the handler.
pub struct LibgpiodBackend {
    pins: PLRwLock<FxHashMap<u32, RwLock<PinHandle>>>, // keyed by pin id
}

struct PinHandle {
    offset: u32,
    direction: Direction,
    edge: Option<Edge>,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| gpio_err(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| gpio_err(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| gpio_err(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| gpio_err(format!("request lines: {e}")))
    }

    fn reconfigure(&self, line_cfg: &line::Config) -> Result<(), AppError> {
        self.request
            .reconfigure_lines(line_cfg)
            .map_err(|e| gpio_err(format!("reconfigure lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        line_id: LineId,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: NotificationHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| gpio_err(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error on line {line_id}: {e}");
                            drop(hdl);
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        warn!("read edge events error on line {line_id}: {e}");
                        drop(hdl);
                        yield_now();
                        continue;
                    }
                };
                for evt in events {
                    let Ok(evt) = evt else { continue };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => Edge::Rising,
                        Ok(line::EdgeKind::Falling) => Edge::Falling,
                        Err(_) => continue,
                    };
                    handler.notify(line_id, edge);
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn gpio_err(msg: String) -> AppError {
    AppError::BackendUnavailable(msg)
}

fn poisoned<T>(e: PoisonError<T>) -> AppError {
    gpio_err(format!("lock poisoned: {e}"))
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            pins: PLRwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(
        direction: Direction,
        edge: Option<Edge>,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| gpio_err(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| gpio_err(format!("set direction: {e}")))?;
                ls.set_output_value(line::Value::InActive)
                    .map_err(|e| gpio_err(format!("set output value: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| gpio_err(format!("set direction: {e}")))?;
                if let Some(edge) = edge {
                    ls.set_edge_detection(Some(match edge {
                        Edge::Rising => line::Edge::Rising,
                        Edge::Falling => line::Edge::Falling,
                    }))
                    .map_err(|e| gpio_err(format!("set edge detection: {e}")))?;
                    ls.set_event_clock(EventClock::Monotonic)
                        .map_err(|e| gpio_err(format!("set event clock: {e}")))?;
                }
            }
        }

        Ok(ls)
    }

    fn make_line_config(
        offset: u32,
        direction: Direction,
        edge: Option<Edge>,
    ) -> Result<line::Config, AppError> {
        let settings = Self::make_line_settings(direction, edge)?;
        let mut cfg = line::Config::new().map_err(|e| gpio_err(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| gpio_err(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn with_handle<T>(
        &self,
        pin_id: u32,
        f: impl FnOnce(&mut PinHandle) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(&pin_id)
            .ok_or_else(|| gpio_err(format!("pin {pin_id} not reserved")))?;
        let mut handle = handle_lock.write().map_err(poisoned)?;
        f(&mut handle)
    }
}

impl PinBackend for LibgpiodBackend {
    fn reserve(&self, pin_id: u32, pin: &PinConfig) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        if pins.contains_key(&pin_id) {
            return Err(gpio_err(format!("pin {pin_id} busy")));
        }

        let line_cfg = Self::make_line_config(pin.line, Direction::Output, None)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&pin.chip, &line_cfg)?));
        pins.insert(
            pin_id,
            RwLock::new(PinHandle {
                offset: pin.line,
                direction: Direction::Output,
                edge: None,
                gpiod_handle,
                listener: None,
            }),
        );
        info!("pin {pin_id} reserved on {}:{}", pin.chip, pin.line);
        Ok(())
    }

    fn release(&self, pin_id: u32) {
        // dropping the handle stops its listener, then frees the line request
        if self.pins.write().remove(&pin_id).is_none() {
            warn!("release of unreserved pin {pin_id}");
        }
    }

    fn set_direction(&self, pin_id: u32, direction: Direction) -> Result<(), AppError> {
        self.with_handle(pin_id, |handle| {
            let line_cfg = Self::make_line_config(handle.offset, direction, handle.edge)?;
            handle.gpiod_handle.lock().reconfigure(&line_cfg)?;
            handle.direction = direction;
            Ok(())
        })
    }

    fn set_level(&self, pin_id: u32, level: Level) -> Result<(), AppError> {
        self.with_handle(pin_id, |handle| {
            if handle.direction != Direction::Output {
                return Err(gpio_err(format!("pin {pin_id} is not an output")));
            }
            let value = match level {
                Level::Low => line::Value::InActive,
                Level::High => line::Value::Active,
            };
            handle
                .gpiod_handle
                .lock()
                .request
                .set_value(handle.offset, value)
                .map_err(|e| gpio_err(format!("set value: {e}")))?;
            Ok(())
        })
    }

    fn get_level(&self, pin_id: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let handle_lock = pins
            .get(&pin_id)
            .ok_or_else(|| gpio_err(format!("pin {pin_id} not reserved")))?;
        let handle = handle_lock.read().map_err(poisoned)?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.offset)
            .map_err(|e| gpio_err(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn notification_line_for(&self, pin_id: u32) -> Result<LineId, AppError> {
        if !self.pins.read().contains_key(&pin_id) {
            return Err(gpio_err(format!("pin {pin_id} not reserved")));
        }
        Ok(LineId(pin_id))
    }

    fn register_notification(
        &self,
        line: LineId,
        edge: Edge,
        handler: NotificationHandler,
    ) -> Result<(), AppError> {
        self.with_handle(line.0, |handle| {
            if handle.listener.is_some() {
                return Err(gpio_err(format!("line {line} busy")));
            }
            let line_cfg = Self::make_line_config(handle.offset, Direction::Input, Some(edge))?;
            handle.gpiod_handle.lock().reconfigure(&line_cfg)?;
            handle.direction = Direction::Input;
            handle.edge = Some(edge);
            handle.listener = Some(EdgeListener::new(line, handle.gpiod_handle.clone(), handler)?);
            Ok(())
        })
    }

    fn unregister_notification(&self, line: LineId) {
        let result = self.with_handle(line.0, |handle| {
            let Some(listener) = handle.listener.take() else {
                return Err(gpio_err(format!("line {line} not registered")));
            };
            drop(listener);
            handle.edge = None;
            let line_cfg = Self::make_line_config(handle.offset, handle.direction, None)?;
            handle.gpiod_handle.lock().reconfigure(&line_cfg)
        });
        if let Err(e) = result {
            warn!("unregister line {line}: {e}");
        }
    }
}

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::command::Command;
use crate::error::AppError;
use crate::gpio::{PinBackend, PinManager};
use crate::pin::{PinControl, Subscription};

/// One open-to-close interaction with a pin.
///
/// Dropping a session closes it.
pub struct Session<B: PinBackend> {
    pin: Arc<PinControl<B>>,
    subscription: Option<Subscription>,
    closed: bool,
}

impl<B: PinBackend> Session<B> {
    pub(crate) fn open(pin: Arc<PinControl<B>>) -> Result<Self, AppError> {
        info!("pin {} opened", pin.pin_id());
        let subscription = pin.open_session()?;
        Ok(Self {
            pin,
            subscription,
            closed: false,
        })
    }

    pub fn pin_id(&self) -> u32 {
        self.pin.pin_id()
    }

    /// Whether this session holds a share of the pin's notification line.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Writes up to `max_bytes` ASCII digits of the live pin level to `out`.
    ///
    /// Stops short, without error, once `out` refuses a byte.
    pub fn read<W: Write>(&self, max_bytes: usize, out: &mut W) -> Result<usize, AppError> {
        let mut count = 0;
        while count < max_bytes {
            let level = match self.pin.physical_level() {
                Ok(level) => level,
                Err(e) if count == 0 => return Err(e),
                Err(_) => break,
            };
            if out.write_all(&[level.as_ascii()]).is_err() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Applies one command and returns the number of bytes consumed.
    pub fn write(&self, raw: &[u8]) -> Result<usize, AppError> {
        let command = Command::parse(raw)
            .inspect_err(|e| warn!("pin {}: {e}", self.pin.pin_id()))?;
        command.apply(&self.pin)?;
        Ok(raw.len())
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing pin {}", self.pin.pin_id());
        self.pin.close_session(self.subscription.take());
    }
}

impl<B: PinBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sessions kept open across requests, addressed by id.
pub struct SessionTable<B: PinBackend> {
    next_id: AtomicU64,
    sessions: Mutex<FxHashMap<u64, Arc<Session<B>>>>,
}

impl<B: PinBackend> Default for SessionTable<B> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<B: PinBackend> SessionTable<B> {
    pub fn open(&self, manager: &PinManager<B>, pin_id: u32) -> Result<u64, AppError> {
        let session = manager.open(pin_id)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(id, Arc::new(session));
        Ok(id)
    }

    pub fn get(&self, session_id: u64) -> Result<Arc<Session<B>>, AppError> {
        self.sessions
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
    }

    /// Forgets the session; it closes once no request is still using it.
    pub fn close(&self, session_id: u64) -> Result<(), AppError> {
        let session = self
            .sessions
            .lock()
            .remove(&session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        drop(session);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        drop(sessions);
    }
}

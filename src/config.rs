use std::{fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

const DEFAULT_MAX_PIN_NUMBER: u32 = 117;
const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 200;
const DEFAULT_BROADCAST_CAPACITY: usize = 64;
const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 32;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

/// Where a managed pin lives on the board.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
}

/// Whether the debounce timestamp is shared by every pin or kept per
/// notification line.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DebounceScope {
    #[default]
    Global,
    PerLine,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DebounceConfig {
    #[serde(default = "default_debounce_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub scope: DebounceScope,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            scope: DebounceScope::Global,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub pins: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_max_pin_number")]
    pub max_pin_number: u32,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.pins.is_empty() {
            return Err(AppError::Config("no pins configured".into()));
        }
        if let Some(id) = self.pins.keys().find(|id| **id > self.max_pin_number) {
            return Err(AppError::Config(format!(
                "pin {id} is outside 0..={}",
                self.max_pin_number
            )));
        }
        if self.broadcast_capacity == 0 {
            return Err(AppError::Config("broadcast_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Managed pin ids in ascending order, the order pins are brought up in.
    pub fn pin_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.pins.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn default_max_pin_number() -> u32 {
    DEFAULT_MAX_PIN_NUMBER
}

fn default_debounce_window_ms() -> u64 {
    DEFAULT_DEBOUNCE_WINDOW_MS
}

fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}

fn default_event_history_capacity() -> usize {
    DEFAULT_EVENT_HISTORY_CAPACITY
}

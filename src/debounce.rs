use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{DebounceConfig, DebounceScope};
use crate::pin::LineId;

/// Returns true when a notification at `now_ms` falls outside the window
/// opened by the last accepted one.
pub fn accept(now_ms: u64, last_ms: u64, window_ms: u64) -> bool {
    now_ms.saturating_sub(last_ms) >= window_ms
}

enum LastAccepted {
    Global(AtomicU64),
    PerLine(Mutex<FxHashMap<LineId, u64>>),
}

/// Last-accepted timestamp(s) gated by [`accept`].
pub struct DebounceWindow {
    window_ms: u64,
    last: LastAccepted,
}

impl DebounceWindow {
    pub fn new(config: &DebounceConfig) -> Self {
        let last = match config.scope {
            DebounceScope::Global => LastAccepted::Global(AtomicU64::new(0)),
            DebounceScope::PerLine => LastAccepted::PerLine(Mutex::new(FxHashMap::default())),
        };
        Self {
            window_ms: config.window_ms,
            last,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Accepts or rejects a notification on `line` at `now_ms`, moving the
    /// window forward on acceptance.
    pub fn try_accept(&self, line: LineId, now_ms: u64) -> bool {
        match &self.last {
            LastAccepted::Global(last) => last
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                    accept(now_ms, prev, self.window_ms).then_some(now_ms)
                })
                .is_ok(),
            LastAccepted::PerLine(lines) => {
                let mut lines = lines.lock();
                let prev = lines.get(&line).copied().unwrap_or(0);
                if !accept(now_ms, prev, self.window_ms) {
                    return false;
                }
                lines.insert(line, now_ms);
                true
            }
        }
    }

    /// Timestamp of the last notification accepted on `line`.
    pub fn last_accepted(&self, line: LineId) -> u64 {
        match &self.last {
            LastAccepted::Global(last) => last.load(Ordering::Acquire),
            LastAccepted::PerLine(lines) => lines.lock().get(&line).copied().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_is_inclusive_at_window_edge() {
        assert!(accept(1200, 1000, 200));
        assert!(!accept(1199, 1000, 200));
        assert!(!accept(900, 1000, 200));
    }

    #[test]
    fn global_window_couples_lines() {
        let window = DebounceWindow::new(&DebounceConfig::default());

        assert!(window.try_accept(LineId(1), 1000));
        assert!(!window.try_accept(LineId(2), 1100));
        assert_eq!(window.last_accepted(LineId(2)), 1000);
    }

    #[test]
    fn per_line_window_keeps_lines_apart() {
        let window = DebounceWindow::new(&DebounceConfig {
            window_ms: 200,
            scope: DebounceScope::PerLine,
        });

        assert!(window.try_accept(LineId(1), 1000));
        assert!(window.try_accept(LineId(2), 1100));
        assert!(!window.try_accept(LineId(1), 1150));
        assert_eq!(window.last_accepted(LineId(1)), 1000);
    }
}

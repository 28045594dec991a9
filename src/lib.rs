pub mod backend;
pub mod clock;
pub mod command;
pub mod config;
pub mod debounce;
pub mod error;
pub mod gpio;
pub mod pin;
pub mod routes;
pub mod session;

pub use clock::{ManualClock, MonotonicClock, TimeSource};
pub use command::Command;
pub use config::{AppConfig, DebounceConfig, DebounceScope, HttpConfig, PinConfig};
pub use error::AppError;
pub use gpio::{Delivery, EdgeDispatcher, EdgeEvent, NotificationHandler, PinBackend, PinManager};
pub use pin::{Direction, Edge, Level, LineId, PinControl, PinSnapshot};
pub use routes::AppState;
pub use session::{Session, SessionTable};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockPinBackend;

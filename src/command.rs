use std::str::FromStr;

use log::debug;

use crate::error::AppError;
use crate::gpio::PinBackend;
use crate::pin::{Direction, Edge, Level, PinControl};

/// Longest command text considered; anything past it is ignored.
pub const MAX_COMMAND_LEN: usize = 511;

/// The write-side vocabulary of a pin.
///
/// | Token         | Effect                                   |
/// |---------------|------------------------------------------|
/// | `out`         | direction output, driven low             |
/// | `in`          | direction input                          |
/// | `1` / `0`     | drive high / low (output only)           |
/// | `rising`      | arm rising-edge notification, input      |
/// | `falling`     | arm falling-edge notification, input     |
/// | `disable-irq` | disarm notification, release line        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Direction(Direction),
    Level(Level),
    Arm(Edge),
    Disarm,
}

impl FromStr for Command {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out" => Ok(Command::Direction(Direction::Output)),
            "in" => Ok(Command::Direction(Direction::Input)),
            "1" => Ok(Command::Level(Level::High)),
            "0" => Ok(Command::Level(Level::Low)),
            "rising" => Ok(Command::Arm(Edge::Rising)),
            "falling" => Ok(Command::Arm(Edge::Falling)),
            "disable-irq" => Ok(Command::Disarm),
            other => Err(AppError::InvalidArgument(format!(
                "unrecognized command {other:?}"
            ))),
        }
    }
}

impl Command {
    /// Parses raw bytes written by a caller: at most [`MAX_COMMAND_LEN`]
    /// bytes, cut at the first NUL, surrounding whitespace ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, AppError> {
        let raw = &raw[..raw.len().min(MAX_COMMAND_LEN)];
        let raw = raw
            .iter()
            .position(|b| *b == 0)
            .map_or(raw, |nul| &raw[..nul]);
        let text = std::str::from_utf8(raw)
            .map_err(|_| AppError::InvalidArgument("command must be valid UTF-8".into()))?;
        debug!("request from user: {text:?}");

        text.trim().parse()
    }

    pub fn apply<B: PinBackend>(self, pin: &PinControl<B>) -> Result<(), AppError> {
        match self {
            Command::Direction(direction) => pin.set_direction(direction),
            Command::Level(level) => pin.set_level(level),
            Command::Arm(edge) => pin.arm_notification(edge),
            Command::Disarm => {
                pin.disarm_notification();
                Ok(())
            }
        }
    }
}

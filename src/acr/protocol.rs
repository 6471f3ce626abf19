//! ASCII command set of the ACR motion controller
//!
//! Commands are single lines terminated by a carriage return. Queries echo
//! the numeric answer on its own line followed by the next prompt, so the
//! value sits on the second-to-last line of whatever the controller sent.

use crate::axis::AxisId;
use std::fmt;
use std::time::Duration;

/// Time the controller needs to echo a reply before the socket is drained.
/// Shorter delays cut the response and break position and bit readback.
pub const RESPONSE_SETTLE: Duration = Duration::from_millis(70);

/// Line terminator expected by the controller
pub const TERMINATOR: &[u8] = b"\r";

/// Master 0 "in motion" flag, shared by all four axes
pub const IN_MOTION_BIT: u32 = 516;

/// Offset between the bit blocks of consecutive axes
pub const AXIS_BIT_STRIDE: u32 = 32;

/// Drive enabled state
pub const DRIVE_ENABLED_BASE: u32 = 8465;
/// Per-axis "kill all moves" request, the individual emergency stop latch
pub const KILL_MOVES_BASE: u32 = 8467;
/// Drive fault state
pub const DRIVE_FAULT_BASE: u32 = 8477;
/// Positive end-of-travel limit, current state
pub const POSITIVE_LIMIT_BASE: u32 = 16128;
/// Negative end-of-travel limit, current state
pub const NEGATIVE_LIMIT_BASE: u32 = 16129;

/// Motor steps per millimetre after the gearbox
pub const STEPS_PER_MM: f64 = 19685.0;

/// Enters the program 0 prompt. The controller is master 0, so every
/// motion command has to be issued from there.
pub const PROGRAM_PROMPT: &str = "PROG0";

/// Address of `base` within the bit block of `axis`
pub fn axis_bit(base: u32, axis: AxisId) -> u32 {
    base + axis.index() as u32 * AXIS_BIT_STRIDE
}

/// One line of the controller command set
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `?BIT(n)`
    QueryBit(u32),
    /// `?P(12288 + axis * 256)`, raw position in steps
    QueryPosition(AxisId),
    /// `X10`
    MoveAbsolute(AxisId, f64),
    /// `X/10`
    MoveRelative(AxisId, f64),
    /// `DRIVE ON X`
    DriveOn(AxisId),
    /// `DRIVE OFF X`
    DriveOff(AxisId),
    /// `SET BIT(n)`
    SetBit(u32),
    /// `CLR BIT(n)`
    ClearBit(u32),
    /// `SET BIT8467 : SET BIT8499 : ...` over every axis latch
    KillAll,
    /// `CLR BIT8467 : CLR BIT8499 : ...` over every axis latch
    ReleaseAll,
    /// `RES AXISn`, redefine the current position as zero
    ResetAxis(AxisId),
    /// Anything else, sent verbatim
    Raw(String),
}

fn write_latch_set(f: &mut fmt::Formatter<'_>, verb: &str) -> fmt::Result {
    let commands: Vec<String> = AxisId::ALL
        .iter()
        .map(|&axis| format!("{verb} BIT{}", axis_bit(KILL_MOVES_BASE, axis)))
        .collect();
    write!(f, "{}", commands.join(" : "))
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::QueryBit(bit) => write!(f, "?BIT({bit})"),
            Command::QueryPosition(axis) => write!(f, "?P(12288 + {} * 256)", axis.index()),
            Command::MoveAbsolute(axis, target) => write!(f, "{}{target}", axis.letter()),
            Command::MoveRelative(axis, delta) => write!(f, "{}/{delta}", axis.letter()),
            Command::DriveOn(axis) => write!(f, "DRIVE ON {}", axis.letter()),
            Command::DriveOff(axis) => write!(f, "DRIVE OFF {}", axis.letter()),
            Command::SetBit(bit) => write!(f, "SET BIT({bit})"),
            Command::ClearBit(bit) => write!(f, "CLR BIT({bit})"),
            Command::KillAll => write_latch_set(f, "SET"),
            Command::ReleaseAll => write_latch_set(f, "CLR"),
            Command::ResetAxis(axis) => write!(f, "RES AXIS{}", axis.index()),
            Command::Raw(text) => f.write_str(text),
        }
    }
}

/// Motion profile sent once per session
pub fn motion_profile(acceleration: f64, deceleration: f64, velocity: f64, stop_ramp: f64) -> Command {
    Command::Raw(format!(
        "ACC {acceleration} DEC {deceleration} VEL {velocity} STP {stop_ramp}"
    ))
}

/// Encode a command as it goes on the wire
pub fn encode(command: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.len() + TERMINATOR.len());
    bytes.extend(command.bytes().filter(u8::is_ascii));
    bytes.extend_from_slice(TERMINATOR);
    bytes
}

/// Extract the numeric answer from a raw reply
///
/// The drained buffer always ends with the next prompt, so a value is only
/// present when at least two lines came back. Anything unparsable is `None`:
/// most commands are fire-and-forget and reply with the prompt alone.
pub fn parse_reply(reply: &str) -> Option<f64> {
    let lines: Vec<&str> = reply.trim().lines().collect();
    if lines.len() < 2 {
        return None;
    }
    lines[lines.len() - 2].trim().parse::<f64>().ok()
}

/// Interpret a bit query answer. The controller reports set bits as `1`
/// or `-1` depending on the firmware revision.
pub fn bit_is_set(value: Option<f64>) -> bool {
    value.is_some_and(|v| v != 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_text() {
        assert_eq!(Command::QueryBit(IN_MOTION_BIT).to_string(), "?BIT(516)");
        assert_eq!(
            Command::QueryPosition(AxisId::AecrX).to_string(),
            "?P(12288 + 2 * 256)"
        );
        assert_eq!(Command::MoveAbsolute(AxisId::VenusX, 200.0).to_string(), "X200");
        assert_eq!(Command::MoveAbsolute(AxisId::AecrY, -7.5).to_string(), "A-7.5");
        assert_eq!(Command::MoveRelative(AxisId::VenusY, 36.5).to_string(), "Y/36.5");
        assert_eq!(Command::DriveOn(AxisId::AecrX).to_string(), "DRIVE ON Z");
        assert_eq!(Command::DriveOff(AxisId::AecrY).to_string(), "DRIVE OFF A");
        assert_eq!(Command::ResetAxis(AxisId::VenusY).to_string(), "RES AXIS1");
        assert_eq!(
            Command::SetBit(axis_bit(KILL_MOVES_BASE, AxisId::VenusY)).to_string(),
            "SET BIT(8499)"
        );
    }

    #[test]
    fn test_global_latch_commands() {
        assert_eq!(
            Command::KillAll.to_string(),
            "SET BIT8467 : SET BIT8499 : SET BIT8531 : SET BIT8563"
        );
        assert_eq!(
            Command::ReleaseAll.to_string(),
            "CLR BIT8467 : CLR BIT8499 : CLR BIT8531 : CLR BIT8563"
        );
    }

    #[test]
    fn test_bit_addresses() {
        assert_eq!(axis_bit(POSITIVE_LIMIT_BASE, AxisId::VenusX), 16128);
        assert_eq!(axis_bit(POSITIVE_LIMIT_BASE, AxisId::AecrY), 16224);
        assert_eq!(axis_bit(NEGATIVE_LIMIT_BASE, AxisId::VenusY), 16161);
        assert_eq!(axis_bit(DRIVE_FAULT_BASE, AxisId::AecrX), 8541);
    }

    #[test]
    fn test_encode_appends_terminator() {
        assert_eq!(encode("DRIVE ON X"), b"DRIVE ON X\r".to_vec());
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("?BIT(516)\r\n1\r\nP00>"), Some(1.0));
        assert_eq!(parse_reply("-39370\r\nP00>"), Some(-39370.0));
        assert_eq!(parse_reply("P00>"), None);
        assert_eq!(parse_reply(""), None);
        assert_eq!(parse_reply("DRIVE ON X\r\nP00>"), None);
    }

    #[test]
    fn test_bit_is_set() {
        assert!(bit_is_set(Some(1.0)));
        assert!(bit_is_set(Some(-1.0)));
        assert!(!bit_is_set(Some(0.0)));
        assert!(!bit_is_set(None));
    }
}

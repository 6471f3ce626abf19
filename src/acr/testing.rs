//! Simulated ACR controller used by the unit tests.
//!
//! Stages travel instantly but report "in motion" for a few polls. Each
//! stage has hard limits at +-`TRAVEL` mm around its mechanical centre;
//! a move issued while the paired stage is off its positive limit is
//! recorded as a collision.

use super::client::CommandChannel;
use super::protocol::{
    AXIS_BIT_STRIDE, DRIVE_ENABLED_BASE, DRIVE_FAULT_BASE, IN_MOTION_BIT, KILL_MOVES_BASE,
    NEGATIVE_LIMIT_BASE, POSITIVE_LIMIT_BASE, STEPS_PER_MM,
};
use crate::axis::AxisId;
use crate::error::ScannerError;
use crate::utils::StopFlag;

pub const TRAVEL: f64 = 80.0;

#[derive(Debug, Clone)]
pub struct SimAxis {
    /// Absolute position relative to the lower hard limit, mm
    pub absolute: f64,
    /// Absolute position the controller treats as zero
    pub zero: f64,
    pub drive_on: bool,
    pub killed: bool,
    /// A seized stage ignores move commands
    pub stuck: bool,
}

impl SimAxis {
    fn at_positive_limit(&self) -> bool {
        self.absolute >= 2.0 * TRAVEL
    }

    fn at_negative_limit(&self) -> bool {
        self.absolute <= 0.0
    }
}

pub struct SimulatedController {
    pub axes: [SimAxis; 4],
    pub log: Vec<String>,
    pub collisions: Vec<AxisId>,
    pub rejected_moves: Vec<String>,
    motion_polls: usize,
    /// Polls a move reports as in progress
    pub polls_per_move: usize,
    /// Raise this flag on the n-th in-motion poll
    pub trip: Option<(StopFlag, usize)>,
    polls_seen: usize,
}

impl SimulatedController {
    /// All stages parked at the positive limit, drives off, nothing latched.
    pub fn retracted() -> Self {
        let axis = SimAxis {
            absolute: 2.0 * TRAVEL,
            zero: TRAVEL,
            drive_on: false,
            killed: false,
            stuck: false,
        };
        Self {
            axes: [axis.clone(), axis.clone(), axis.clone(), axis],
            log: Vec::new(),
            collisions: Vec::new(),
            rejected_moves: Vec::new(),
            motion_polls: 0,
            polls_per_move: 2,
            trip: None,
            polls_seen: 0,
        }
    }

    pub fn axis(&self, axis: AxisId) -> &SimAxis {
        &self.axes[axis.index()]
    }

    pub fn axis_mut(&mut self, axis: AxisId) -> &mut SimAxis {
        &mut self.axes[axis.index()]
    }

    /// Controller-frame position of an axis, mm
    pub fn position(&self, axis: AxisId) -> f64 {
        let a = self.axis(axis);
        a.absolute - a.zero
    }

    pub fn sent(&self, command: &str) -> bool {
        self.log.iter().any(|c| c == command)
    }

    pub fn count(&self, command: &str) -> usize {
        self.log.iter().filter(|c| *c == command).count()
    }

    pub fn index_of(&self, command: &str) -> Option<usize> {
        self.log.iter().position(|c| c == command)
    }

    fn axis_from_letter(letter: char) -> Option<AxisId> {
        AxisId::ALL.into_iter().find(|a| a.letter() == letter)
    }

    fn bit(&mut self, address: u32) -> f64 {
        if address == IN_MOTION_BIT {
            self.polls_seen += 1;
            if let Some((flag, n)) = &self.trip {
                if self.polls_seen >= *n {
                    flag.request();
                }
            }
            if self.motion_polls > 0 {
                self.motion_polls -= 1;
                return 1.0;
            }
            return 0.0;
        }

        for axis in AxisId::ALL {
            let offset = axis.index() as u32 * AXIS_BIT_STRIDE;
            let state = &self.axes[axis.index()];
            let set = match address.checked_sub(offset) {
                Some(POSITIVE_LIMIT_BASE) => state.at_positive_limit(),
                Some(NEGATIVE_LIMIT_BASE) => state.at_negative_limit(),
                Some(KILL_MOVES_BASE) => state.killed,
                Some(DRIVE_ENABLED_BASE) => state.drive_on,
                Some(DRIVE_FAULT_BASE) => false,
                _ => continue,
            };
            return if set { 1.0 } else { 0.0 };
        }
        0.0
    }

    fn set_latch(&mut self, address: u32, value: bool) {
        for axis in AxisId::ALL {
            if address == KILL_MOVES_BASE + axis.index() as u32 * AXIS_BIT_STRIDE {
                self.axes[axis.index()].killed = value;
                if value {
                    self.motion_polls = 0;
                }
            }
        }
    }

    fn start_move(&mut self, command: &str, axis: AxisId, target: f64, relative: bool) {
        let paired_parked = self.axis(axis.paired()).at_positive_limit();
        let state = &mut self.axes[axis.index()];
        if !state.drive_on || state.killed || state.stuck {
            self.rejected_moves.push(command.to_string());
            return;
        }
        if !paired_parked {
            self.collisions.push(axis);
        }
        let destination = if relative {
            state.absolute + target
        } else {
            state.zero + target
        };
        state.absolute = destination.clamp(0.0, 2.0 * TRAVEL);
        self.motion_polls = self.polls_per_move;
    }

    fn execute(&mut self, command: &str) -> Option<f64> {
        let command = command.trim();

        if let Some(inner) = command.strip_prefix("?BIT(").and_then(|c| c.strip_suffix(')')) {
            let address: u32 = inner.parse().ok()?;
            return Some(self.bit(address));
        }
        if let Some(inner) = command.strip_prefix("?P(12288 + ") {
            let index: usize = inner.split_whitespace().next()?.parse().ok()?;
            let axis = AxisId::from_index(index)?;
            return Some((self.position(axis) * STEPS_PER_MM).round());
        }
        if command.contains(" : ") {
            for part in command.split(" : ") {
                self.execute(part);
            }
            return None;
        }
        for (prefix, value) in [("SET BIT", true), ("CLR BIT", false)] {
            if let Some(rest) = command.strip_prefix(prefix) {
                let address: u32 = rest.trim_matches(|c| c == '(' || c == ')').parse().ok()?;
                self.set_latch(address, value);
                return None;
            }
        }
        for (prefix, value) in [("DRIVE ON ", true), ("DRIVE OFF ", false)] {
            if let Some(rest) = command.strip_prefix(prefix) {
                let axis = Self::axis_from_letter(rest.chars().next()?)?;
                self.axis_mut(axis).drive_on = value;
                return None;
            }
        }
        if let Some(rest) = command.strip_prefix("RES AXIS") {
            let axis = AxisId::from_index(rest.parse().ok()?)?;
            let state = self.axis_mut(axis);
            state.zero = state.absolute;
            return None;
        }
        if command == "PROG0" || command.starts_with("ACC ") {
            return None;
        }

        let mut chars = command.chars();
        let axis = Self::axis_from_letter(chars.next()?)?;
        let rest = chars.as_str();
        if let Some(delta) = rest.strip_prefix('/') {
            self.start_move(command, axis, delta.parse().ok()?, true);
        } else {
            self.start_move(command, axis, rest.parse().ok()?, false);
        }
        None
    }
}

impl CommandChannel for SimulatedController {
    fn send(&mut self, command: &str) -> Result<Option<f64>, ScannerError> {
        self.log.push(command.to_string());
        Ok(self.execute(command))
    }
}

use crate::acr::CommandChannel;
use crate::acr::protocol::{
    self, Command, DRIVE_ENABLED_BASE, DRIVE_FAULT_BASE, IN_MOTION_BIT, KILL_MOVES_BASE,
    NEGATIVE_LIMIT_BASE, POSITIVE_LIMIT_BASE, STEPS_PER_MM, axis_bit,
};
use crate::error::ScannerError;
use crate::utils::{StopFlag, WaitOutcome, wait_until};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Target far beyond the positive end of travel; the stage stops on the
/// limit switch.
pub const RETRACT_POSITION: f64 = 200.0;

/// Target far beyond the negative end of travel
pub const EXTREME_NEGATIVE_POSITION: f64 = -200.0;

/// Beam line served by a pair of axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeamLine {
    Venus,
    Aecr,
}

impl BeamLine {
    /// Name used in scan records
    pub fn label(self) -> &'static str {
        match self {
            BeamLine::Venus => "VENUS",
            BeamLine::Aecr => "AECR",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "VENUS" => Some(BeamLine::Venus),
            "AECR" => Some(BeamLine::Aecr),
            _ => None,
        }
    }

    pub fn axes(self) -> [AxisId; 2] {
        [AxisId::new(self, Plane::Horizontal), AxisId::new(self, Plane::Vertical)]
    }
}

/// Transverse plane scanned by an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plane {
    Horizontal,
    Vertical,
}

impl Plane {
    pub fn label(self) -> &'static str {
        match self {
            Plane::Horizontal => "X",
            Plane::Vertical => "Y",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "X" => Some(Plane::Horizontal),
            "Y" => Some(Plane::Vertical),
            _ => None,
        }
    }
}

/// One of the four scanner stages.
///
/// Each beam line has a horizontal and a vertical stage sharing one linear
/// guide and one pair of limit switches, so a stage may only move while its
/// partner is parked at the positive limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisId {
    VenusX = 0,
    VenusY = 1,
    AecrX = 2,
    AecrY = 3,
}

impl AxisId {
    pub const ALL: [AxisId; 4] = [AxisId::VenusX, AxisId::VenusY, AxisId::AecrX, AxisId::AecrY];

    pub fn new(beam: BeamLine, plane: Plane) -> Self {
        match (beam, plane) {
            (BeamLine::Venus, Plane::Horizontal) => AxisId::VenusX,
            (BeamLine::Venus, Plane::Vertical) => AxisId::VenusY,
            (BeamLine::Aecr, Plane::Horizontal) => AxisId::AecrX,
            (BeamLine::Aecr, Plane::Vertical) => AxisId::AecrY,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Controller axis letter
    pub fn letter(self) -> char {
        ['X', 'Y', 'Z', 'A'][self.index()]
    }

    pub fn beam_line(self) -> BeamLine {
        match self {
            AxisId::VenusX | AxisId::VenusY => BeamLine::Venus,
            AxisId::AecrX | AxisId::AecrY => BeamLine::Aecr,
        }
    }

    pub fn plane(self) -> Plane {
        match self {
            AxisId::VenusX | AxisId::AecrX => Plane::Horizontal,
            AxisId::VenusY | AxisId::AecrY => Plane::Vertical,
        }
    }

    /// The stage sharing this axis' guide and limit switches
    pub fn paired(self) -> Self {
        match self {
            AxisId::VenusX => AxisId::VenusY,
            AxisId::VenusY => AxisId::VenusX,
            AxisId::AecrX => AxisId::AecrY,
            AxisId::AecrY => AxisId::AecrX,
        }
    }

    /// Distance from the negative hard limit to the beam axis, mm
    pub fn midpoint_offset(self) -> f64 {
        [30.18, 36.50, 31.75, 31.75][self.index()]
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.beam_line().label(), self.plane().label())
    }
}

impl FromStr for AxisId {
    type Err = ScannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "venus-x" | "0" => Ok(AxisId::VenusX),
            "venus-y" | "1" => Ok(AxisId::VenusY),
            "aecr-x" | "2" => Ok(AxisId::AecrX),
            "aecr-y" | "3" => Ok(AxisId::AecrY),
            _ => Err(ScannerError::InvalidAxis(s.to_string())),
        }
    }
}

/// Session bookkeeping for one stage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisState {
    /// Last position read back, controller steps
    pub raw_position: f64,
    /// A software zero has been defined at the beam axis this session
    pub centered: bool,
    pub moving: bool,
}

impl AxisState {
    pub fn position_mm(&self) -> f64 {
        self.raw_position / STEPS_PER_MM
    }
}

/// Result of a motion primitive. Cancellation is an outcome, not an error.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    Completed,
    Cancelled,
}

impl Motion {
    pub fn is_cancelled(self) -> bool {
        self == Motion::Cancelled
    }
}

/// Upstream device that must be out of the beam before a stage moves
/// (the beam-line Faraday cup).
pub trait SafetySensor {
    fn probe_retracted(&mut self) -> Result<bool, ScannerError>;
}

/// Sensor for installations without a Faraday cup readback
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpstreamProbe;

impl SafetySensor for NoUpstreamProbe {
    fn probe_retracted(&mut self) -> Result<bool, ScannerError> {
        Ok(true)
    }
}

impl<F> SafetySensor for F
where
    F: FnMut() -> bool,
{
    fn probe_retracted(&mut self) -> Result<bool, ScannerError> {
        Ok(self())
    }
}

/// Polling behaviour of motion waits
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Pause between "in motion" status queries, on top of the reply settle
    pub poll_interval: Duration,
    /// Longest a single move may take, `None` waits indefinitely
    pub move_timeout: Option<Duration>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            move_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Limit switch snapshot of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitStatus {
    pub positive: bool,
    pub negative: bool,
}

/// Drive LED snapshot of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveStatus {
    pub enabled: bool,
    pub faulted: bool,
    pub kill_latched: bool,
}

/// Owner of the controller connection and of every stage's state.
///
/// All motion goes through here. Every move follows the same discipline:
/// establish clearance, check the upstream sensor, energise, move, poll the
/// in-motion bit, de-energise.
pub struct AxisController<C: CommandChannel> {
    channel: C,
    axes: [AxisState; 4],
    stop: StopFlag,
    safety: Box<dyn SafetySensor>,
    config: MotionConfig,
}

impl<C: CommandChannel> AxisController<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            axes: [AxisState::default(); 4],
            stop: StopFlag::new(),
            safety: Box::new(NoUpstreamProbe),
            config: MotionConfig::default(),
        }
    }

    pub fn with_safety_sensor(mut self, sensor: impl SafetySensor + 'static) -> Self {
        self.safety = Box::new(sensor);
        self
    }

    pub fn with_motion_config(mut self, config: MotionConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an externally owned stop flag (Ctrl+C handler, UI thread)
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn state(&self, axis: AxisId) -> AxisState {
        self.axes[axis.index()]
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn send(&mut self, command: Command) -> Result<Option<f64>, ScannerError> {
        self.channel.send_command(&command)
    }

    fn query_bit(&mut self, address: u32) -> Result<bool, ScannerError> {
        let value = self.send(Command::QueryBit(address))?;
        Ok(protocol::bit_is_set(value))
    }

    // ==================== Queries ====================

    /// An axis is cleared when its paired stage sits on the positive limit.
    pub fn is_cleared(&mut self, axis: AxisId) -> Result<bool, ScannerError> {
        self.query_bit(axis_bit(POSITIVE_LIMIT_BASE, axis.paired()))
    }

    pub fn limit_status(&mut self, axis: AxisId) -> Result<LimitStatus, ScannerError> {
        Ok(LimitStatus {
            positive: self.query_bit(axis_bit(POSITIVE_LIMIT_BASE, axis))?,
            negative: self.query_bit(axis_bit(NEGATIVE_LIMIT_BASE, axis))?,
        })
    }

    pub fn drive_status(&mut self, axis: AxisId) -> Result<DriveStatus, ScannerError> {
        Ok(DriveStatus {
            enabled: self.query_bit(axis_bit(DRIVE_ENABLED_BASE, axis))?,
            faulted: self.query_bit(axis_bit(DRIVE_FAULT_BASE, axis))?,
            kill_latched: self.query_bit(axis_bit(KILL_MOVES_BASE, axis))?,
        })
    }

    /// Read back the position in mm and cache the raw step count
    pub fn position(&mut self, axis: AxisId) -> Result<Option<f64>, ScannerError> {
        let raw = self.send(Command::QueryPosition(axis))?;
        if let Some(steps) = raw {
            self.axes[axis.index()].raw_position = steps;
        }
        Ok(raw.map(|steps| steps / STEPS_PER_MM))
    }

    pub fn in_motion(&mut self) -> Result<bool, ScannerError> {
        self.query_bit(IN_MOTION_BIT)
    }

    // ==================== Drive and latch primitives ====================

    pub fn deenergize(&mut self, axis: AxisId) -> Result<(), ScannerError> {
        self.send(Command::DriveOff(axis))?;
        Ok(())
    }

    /// Clear the axis' kill latch; required after a limit hit or a stop
    pub fn release_latch(&mut self, axis: AxisId) -> Result<(), ScannerError> {
        self.send(Command::ClearBit(axis_bit(KILL_MOVES_BASE, axis)))?;
        Ok(())
    }

    /// Halt one axis in place. The controller resumes only after an edge on
    /// the latch, so it is set and cleared immediately.
    fn abort_axis(&mut self, axis: AxisId) -> Result<(), ScannerError> {
        let latch = axis_bit(KILL_MOVES_BASE, axis);
        self.send(Command::SetBit(latch))?;
        self.send(Command::ClearBit(latch))?;
        self.send(Command::DriveOff(axis))?;
        self.axes[axis.index()].moving = false;
        Ok(())
    }

    /// Set every axis' kill latch, halting all motion at once.
    ///
    /// Nothing moves again until [`clear_emergency_stop`](Self::clear_emergency_stop).
    pub fn emergency_stop(&mut self) -> Result<(), ScannerError> {
        warn!("Emergency stop: killing motion on all axes");
        self.stop.request();
        self.send(Command::KillAll)?;
        for state in self.axes.iter_mut() {
            state.moving = false;
        }
        Ok(())
    }

    pub fn clear_emergency_stop(&mut self) -> Result<(), ScannerError> {
        info!("Clearing emergency stop latches");
        self.send(Command::ReleaseAll)?;
        self.stop.reset();
        Ok(())
    }

    // ==================== Motion ====================

    /// Block until the in-motion bit drops, honouring the stop flag
    fn wait_for_motion(&mut self, axis: AxisId) -> Result<Motion, ScannerError> {
        let stop = self.stop.clone();
        let channel = &mut self.channel;
        let outcome = wait_until(
            || {
                channel
                    .send_command(&Command::QueryBit(IN_MOTION_BIT))
                    .map(|value| !protocol::bit_is_set(value))
            },
            self.config.poll_interval,
            self.config.move_timeout,
            &stop,
        )?;

        match outcome {
            WaitOutcome::Completed => {
                self.axes[axis.index()].moving = false;
                Ok(Motion::Completed)
            }
            WaitOutcome::Cancelled => {
                warn!("Stop requested while {axis} was moving");
                self.abort_axis(axis)?;
                Ok(Motion::Cancelled)
            }
            WaitOutcome::TimedOut => {
                self.abort_axis(axis)?;
                Err(ScannerError::MotionTimeout {
                    axis,
                    timeout: self.config.move_timeout.unwrap_or_default(),
                })
            }
        }
    }

    /// Energise, issue a move, wait for it. Leaves the drive energised.
    fn drive(&mut self, axis: AxisId, command: Command) -> Result<Motion, ScannerError> {
        if !self.safety.probe_retracted()? {
            self.deenergize(axis)?;
            return Err(ScannerError::SafetyInterlock(axis));
        }

        debug!("{axis}: {command}");
        self.send(Command::DriveOn(axis))?;
        self.send(command)?;
        self.axes[axis.index()].moving = true;
        self.wait_for_motion(axis)
    }

    /// Move and de-energise on normal completion
    fn travel(&mut self, axis: AxisId, command: Command) -> Result<Motion, ScannerError> {
        let motion = self.drive(axis, command)?;
        if motion == Motion::Completed {
            self.deenergize(axis)?;
            self.position(axis)?;
        }
        Ok(motion)
    }

    /// Park the paired stage on its positive limit if it is in the way.
    ///
    /// At most one retract of the partner is attempted; if the partner still
    /// does not report its positive limit afterwards the interlock cannot be
    /// satisfied and the caller must stop.
    pub fn ensure_clearance(&mut self, axis: AxisId) -> Result<Motion, ScannerError> {
        if self.is_cleared(axis)? {
            return Ok(Motion::Completed);
        }

        let paired = axis.paired();
        warn!("{axis} obstructed, retracting {paired}");
        if self
            .travel(paired, Command::MoveAbsolute(paired, RETRACT_POSITION))?
            .is_cancelled()
        {
            return Ok(Motion::Cancelled);
        }
        // The limit hit latches a kill request on the stages of the guide.
        self.release_latch(paired)?;
        self.deenergize(paired)?;
        self.release_latch(axis)?;
        self.deenergize(axis)?;

        if !self.is_cleared(axis)? {
            self.deenergize(axis)?;
            return Err(ScannerError::AxisNotCleared { axis, paired });
        }
        Ok(Motion::Completed)
    }

    pub fn move_absolute(&mut self, axis: AxisId, target: f64) -> Result<Motion, ScannerError> {
        if self.ensure_clearance(axis)?.is_cancelled() {
            return Ok(Motion::Cancelled);
        }
        self.travel(axis, Command::MoveAbsolute(axis, target))
    }

    pub fn move_relative(&mut self, axis: AxisId, delta: f64) -> Result<Motion, ScannerError> {
        if self.ensure_clearance(axis)?.is_cancelled() {
            return Ok(Motion::Cancelled);
        }
        self.travel(axis, Command::MoveRelative(axis, delta))
    }

    /// Drive an axis out to its positive limit and leave it released
    pub fn retract(&mut self, axis: AxisId) -> Result<Motion, ScannerError> {
        info!("Retracting {axis}");
        let motion = self.move_absolute(axis, RETRACT_POSITION)?;
        self.release_latch(axis)?;
        self.deenergize(axis)?;
        Ok(motion)
    }

    /// Define the beam axis as zero.
    ///
    /// The first call in a session runs to the negative hard limit, backs off
    /// by the axis' midpoint offset and redefines zero there. Later calls only
    /// return to zero.
    pub fn center_axis(&mut self, axis: AxisId) -> Result<Motion, ScannerError> {
        if self.ensure_clearance(axis)?.is_cancelled() {
            return Ok(Motion::Cancelled);
        }

        if self.axes[axis.index()].centered {
            info!("{axis} already centered, returning to zero");
            return self.travel(axis, Command::MoveAbsolute(axis, 0.0));
        }

        info!("Centering {axis}");
        if self
            .drive(axis, Command::MoveAbsolute(axis, EXTREME_NEGATIVE_POSITION))?
            .is_cancelled()
        {
            return Ok(Motion::Cancelled);
        }
        if self
            .drive(axis, Command::MoveRelative(axis, axis.midpoint_offset()))?
            .is_cancelled()
        {
            return Ok(Motion::Cancelled);
        }

        self.send(Command::ResetAxis(axis))?;
        self.deenergize(axis)?;
        let state = &mut self.axes[axis.index()];
        state.centered = true;
        state.raw_position = 0.0;
        info!("{axis} centered");
        Ok(Motion::Completed)
    }

    /// Halt everything and retract the axis that was in use, keeping the
    /// session's centering so the next scan does not recalibrate.
    pub fn soft_reset(&mut self, active: Option<AxisId>) -> Result<(), ScannerError> {
        self.send(Command::KillAll)?;
        self.send(Command::ReleaseAll)?;
        self.stop.reset();
        if let Some(axis) = active {
            if self.retract(axis)?.is_cancelled() {
                warn!("Reset: retract of {axis} was stopped");
            }
        }
        Ok(())
    }

    /// Stop all motion and park the stages of a beam line (all four when
    /// none is selected) before the program exits.
    pub fn shutdown(&mut self, beam: Option<BeamLine>) -> Result<(), ScannerError> {
        self.send(Command::KillAll)?;
        self.send(Command::ReleaseAll)?;
        self.stop.reset();
        let axes: Vec<AxisId> = match beam {
            Some(beam) => beam.axes().to_vec(),
            None => AxisId::ALL.to_vec(),
        };
        for axis in axes {
            if self.retract(axis)?.is_cancelled() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acr::testing::SimulatedController;

    fn controller(sim: SimulatedController) -> AxisController<SimulatedController> {
        AxisController::new(sim).with_motion_config(MotionConfig {
            poll_interval: Duration::ZERO,
            move_timeout: Some(Duration::from_secs(5)),
        })
    }

    fn assert_safe(sim: &SimulatedController) {
        for axis in AxisId::ALL {
            assert!(!sim.axis(axis).drive_on, "{axis} left energised");
        }
    }

    #[test]
    fn test_axis_identity() {
        for axis in AxisId::ALL {
            assert_eq!(axis.paired().paired(), axis);
            assert_eq!(axis.paired().beam_line(), axis.beam_line());
            assert_ne!(axis.paired().plane(), axis.plane());
            assert_eq!(AxisId::new(axis.beam_line(), axis.plane()), axis);
            assert_eq!(AxisId::from_index(axis.index()), Some(axis));
        }
        assert_eq!("aecr-y".parse::<AxisId>().unwrap(), AxisId::AecrY);
        assert_eq!("VENUS_X".parse::<AxisId>().unwrap(), AxisId::VenusX);
        assert!("venus-z".parse::<AxisId>().is_err());
    }

    #[test]
    fn test_is_cleared_reads_partner_positive_limit() {
        let mut ctl = controller(SimulatedController::retracted());
        assert!(ctl.is_cleared(AxisId::VenusX).unwrap());
        assert!(ctl.channel().sent("?BIT(16160)"));

        ctl.channel_mut().axis_mut(AxisId::VenusY).absolute = 40.0;
        assert!(!ctl.is_cleared(AxisId::VenusX).unwrap());
        assert!(ctl.is_cleared(AxisId::VenusY).unwrap());
    }

    #[test]
    fn test_move_absolute_sequence() {
        let mut ctl = controller(SimulatedController::retracted());
        let motion = ctl.move_absolute(AxisId::AecrX, 5.0).unwrap();
        assert_eq!(motion, Motion::Completed);

        let sim = ctl.channel();
        let on = sim.index_of("DRIVE ON Z").unwrap();
        let mv = sim.index_of("Z5").unwrap();
        let off = sim.index_of("DRIVE OFF Z").unwrap();
        assert!(on < mv && mv < off);
        assert_eq!(sim.position(AxisId::AecrX), 5.0);
        assert_safe(sim);
        assert!((ctl.state(AxisId::AecrX).position_mm() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_paired_moves_always_clear_first() {
        let mut ctl = controller(SimulatedController::retracted());

        // Alternate between the two stages of each guide.
        for (a, b) in [(AxisId::VenusX, AxisId::VenusY), (AxisId::AecrY, AxisId::AecrX)] {
            assert_eq!(ctl.move_absolute(a, -3.0).unwrap(), Motion::Completed);
            assert_eq!(ctl.move_absolute(b, 4.0).unwrap(), Motion::Completed);
            assert_eq!(ctl.move_relative(a, 1.0).unwrap(), Motion::Completed);
        }

        let sim = ctl.channel();
        assert!(sim.collisions.is_empty(), "collisions: {:?}", sim.collisions);
        assert!(sim.rejected_moves.is_empty());
        assert_safe(sim);
    }

    #[test]
    fn test_clearance_failure_is_fatal() {
        let mut sim = SimulatedController::retracted();
        sim.axis_mut(AxisId::VenusY).absolute = 60.0;
        sim.axis_mut(AxisId::VenusY).stuck = true;
        let mut ctl = controller(sim);

        let err = ctl.move_absolute(AxisId::VenusX, 0.0).unwrap_err();
        assert!(matches!(
            err,
            ScannerError::AxisNotCleared {
                axis: AxisId::VenusX,
                paired: AxisId::VenusY
            }
        ));
        assert!(err.is_fatal());

        let sim = ctl.channel();
        // Exactly one retract attempt on the partner, and X never moved.
        assert_eq!(sim.count("Y200"), 1);
        assert!(!sim.sent("X0"));
        assert_safe(sim);
    }

    #[test]
    fn test_safety_sensor_blocks_motion() {
        let mut ctl = controller(SimulatedController::retracted()).with_safety_sensor(|| false);

        let err = ctl.move_absolute(AxisId::AecrY, 1.0).unwrap_err();
        assert!(matches!(err, ScannerError::SafetyInterlock(AxisId::AecrY)));
        assert!(!ctl.channel().sent("DRIVE ON A"));
        assert!(!ctl.channel().sent("A1"));
    }

    #[test]
    fn test_cancel_during_poll_aborts_axis() {
        let stop = StopFlag::new();
        let mut sim = SimulatedController::retracted();
        sim.polls_per_move = 50;
        sim.trip = Some((stop.clone(), 1));
        let mut ctl = controller(sim).with_stop_flag(stop.clone());

        let motion = ctl.move_absolute(AxisId::VenusX, 10.0).unwrap();
        assert_eq!(motion, Motion::Cancelled);

        let sim = ctl.channel();
        let set = sim.index_of("SET BIT(8467)").unwrap();
        let clr = sim.index_of("CLR BIT(8467)").unwrap();
        let off = sim.log.iter().rposition(|c| c == "DRIVE OFF X").unwrap();
        assert!(set < clr && clr < off);
        assert!(!sim.axis(AxisId::VenusX).killed);
        assert_safe(sim);
        assert!(!ctl.state(AxisId::VenusX).moving);
    }

    #[test]
    fn test_motion_timeout_aborts_axis() {
        let mut sim = SimulatedController::retracted();
        sim.polls_per_move = usize::MAX;
        let mut ctl = AxisController::new(sim).with_motion_config(MotionConfig {
            poll_interval: Duration::from_millis(1),
            move_timeout: Some(Duration::from_millis(20)),
        });

        let err = ctl.move_absolute(AxisId::AecrX, 3.0).unwrap_err();
        assert!(matches!(err, ScannerError::MotionTimeout { axis: AxisId::AecrX, .. }));
        assert!(ctl.channel().sent("SET BIT(8531)"));
        assert_safe(ctl.channel());
    }

    #[test]
    fn test_centering_redefines_zero() {
        let mut ctl = controller(SimulatedController::retracted());
        let motion = ctl.center_axis(AxisId::VenusY).unwrap();
        assert_eq!(motion, Motion::Completed);

        let sim = ctl.channel();
        let to_limit = sim.index_of("Y-200").unwrap();
        let back_off = sim.index_of("Y/36.5").unwrap();
        let reset = sim.index_of("RES AXIS1").unwrap();
        assert!(to_limit < back_off && back_off < reset);
        assert_eq!(sim.position(AxisId::VenusY), 0.0);
        assert!((sim.axis(AxisId::VenusY).absolute - 36.5).abs() < 1e-9);
        assert!(ctl.state(AxisId::VenusY).centered);
        assert_safe(sim);
    }

    #[test]
    fn test_centering_is_idempotent() {
        let mut ctl = controller(SimulatedController::retracted());
        ctl.center_axis(AxisId::AecrX).unwrap();
        let zero_after_first = ctl.channel().axis(AxisId::AecrX).zero;

        ctl.move_absolute(AxisId::AecrX, 7.0).unwrap();
        let log_len = ctl.channel().log.len();
        assert_eq!(ctl.center_axis(AxisId::AecrX).unwrap(), Motion::Completed);

        let sim = ctl.channel();
        let second: &[String] = &sim.log[log_len..];
        assert!(second.iter().any(|c| c == "Z0"));
        assert!(!second.iter().any(|c| c == "Z-200" || c.starts_with("RES")));
        assert_eq!(sim.axis(AxisId::AecrX).zero, zero_after_first);
        assert_eq!(sim.position(AxisId::AecrX), 0.0);
    }

    #[test]
    fn test_centering_cancelled_leaves_axis_uncentered() {
        let stop = StopFlag::new();
        let mut sim = SimulatedController::retracted();
        sim.trip = Some((stop.clone(), 1));
        let mut ctl = controller(sim).with_stop_flag(stop);

        assert_eq!(ctl.center_axis(AxisId::VenusX).unwrap(), Motion::Cancelled);
        assert!(!ctl.state(AxisId::VenusX).centered);
        assert!(!ctl.channel().sent("RES AXIS0"));
        assert_safe(ctl.channel());
    }

    #[test]
    fn test_retract_reaches_positive_limit() {
        let mut ctl = controller(SimulatedController::retracted());
        ctl.move_absolute(AxisId::VenusX, 0.0).unwrap();
        assert_eq!(ctl.retract(AxisId::VenusX).unwrap(), Motion::Completed);

        assert!(ctl.limit_status(AxisId::VenusX).unwrap().positive);
        assert!(ctl.channel().sent("X200"));
        assert!(ctl.channel().sent("CLR BIT(8467)"));
        assert_safe(ctl.channel());
    }

    #[test]
    fn test_emergency_stop_blocks_until_cleared() {
        let mut ctl = controller(SimulatedController::retracted());
        ctl.emergency_stop().unwrap();
        assert!(ctl.drive_status(AxisId::AecrY).unwrap().kill_latched);
        assert!(ctl.stop_flag().is_requested());

        // A pending stop cancels the next wait.
        assert_eq!(ctl.move_absolute(AxisId::AecrY, 2.0).unwrap(), Motion::Cancelled);

        ctl.clear_emergency_stop().unwrap();
        assert!(!ctl.drive_status(AxisId::AecrY).unwrap().kill_latched);
        assert_eq!(ctl.move_absolute(AxisId::AecrY, 2.0).unwrap(), Motion::Completed);
        assert_eq!(ctl.channel().position(AxisId::AecrY), 2.0);
    }

    #[test]
    fn test_soft_reset_keeps_centering() {
        let mut ctl = controller(SimulatedController::retracted());
        ctl.center_axis(AxisId::VenusX).unwrap();
        ctl.soft_reset(Some(AxisId::VenusX)).unwrap();

        assert!(ctl.state(AxisId::VenusX).centered);
        assert!(ctl.limit_status(AxisId::VenusX).unwrap().positive);
        assert!(ctl.channel().sent(&Command::ReleaseAll.to_string()));
    }

    #[test]
    fn test_shutdown_parks_beam_line() {
        let mut sim = SimulatedController::retracted();
        sim.axis_mut(AxisId::AecrX).absolute = 40.0;
        let mut ctl = controller(sim);
        ctl.shutdown(Some(BeamLine::Aecr)).unwrap();

        let sim = ctl.channel();
        assert!(sim.axis(AxisId::AecrX).absolute >= 160.0);
        assert!(sim.axis(AxisId::AecrY).absolute >= 160.0);
        assert!(!sim.sent("X200"));
        assert_safe(sim);
    }
}

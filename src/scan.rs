//! Position × momentum scan acquisition.

use crate::acr::CommandChannel;
use crate::analysis;
use crate::axis::{AxisController, AxisId, Motion};
use crate::error::ScannerError;
use crate::record::ScanRecord;
use crate::signal::SignalSource;
use crate::variables::{ScanConfiguration, plate_voltage};
use log::{debug, info, warn};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transimpedance gains selectable on the scan cup amplifier, V/A
pub const GAINS: [f64; 9] = [1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9, 1e10, 1e11];

/// Closed grid from `min` to `max` stepped by `step`.
///
/// Points are `min + i·step` for as long as they stay below `max + step`,
/// so the last point may overshoot `max` by less than one step.
///
/// ```
/// use emittance_scanner::scan::closed_grid;
///
/// assert_eq!(closed_grid(-10.0, 10.0, 5.0).unwrap(), vec![-10.0, -5.0, 0.0, 5.0, 10.0]);
/// assert_eq!(closed_grid(0.0, 10.0, 3.0).unwrap(), vec![0.0, 3.0, 6.0, 9.0, 12.0]);
/// ```
pub fn closed_grid(min: f64, max: f64, step: f64) -> Result<Vec<f64>, ScannerError> {
    if !(step.is_finite() && step > 0.0) {
        return Err(ScannerError::invalid_value("step", format!("{step} is not a positive number")));
    }
    if !(min.is_finite() && max.is_finite()) || max < min {
        return Err(ScannerError::invalid_value(
            "range",
            format!("[{min}, {max}] is not a valid interval"),
        ));
    }

    let count = ((max + step - min) / step).ceil() as usize;
    Ok((0..count).map(|i| min + i as f64 * step).collect())
}

/// How each grid point is measured
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Samples averaged per point
    pub samples: usize,
    pub sample_interval: Duration,
    /// Wait after changing the plate voltage
    pub settle_delay: Duration,
    /// Scan cup amplifier gain, V/A
    pub gain: f64,
    /// Plate amplifier gain; the DAQ outputs plate volts divided by this
    pub output_divisor: f64,
    /// DAQ output corresponding to 0 V on the plates
    pub output_offset: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            samples: 2000,
            sample_interval: Duration::from_millis(20),
            settle_delay: Duration::from_millis(10),
            gain: 1e8,
            output_divisor: 100.0,
            output_offset: 3.188,
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.samples == 0 {
            return Err(ScannerError::invalid_value("samples", "at least one sample per point"));
        }
        if !GAINS.contains(&self.gain) {
            return Err(ScannerError::invalid_value(
                "gain",
                format!("{:e} V/A is not an amplifier setting", self.gain),
            ));
        }
        if !(self.output_divisor.is_finite() && self.output_divisor > 0.0) {
            return Err(ScannerError::invalid_value("output divisor", "must be positive"));
        }
        Ok(())
    }
}

/// A scan that ran to the end and was saved
#[derive(Debug, Clone)]
pub struct CompletedScan {
    pub record: ScanRecord,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(CompletedScan),
    Cancelled,
}

/// Result of a series of scans on one axis
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub scans: Vec<CompletedScan>,
    pub cancelled: bool,
}

/// Runs scans: moves the probe through the position grid and, at each
/// position, sweeps the plate voltage through the momentum grid.
pub struct ScanEngine<C: CommandChannel, S: SignalSource> {
    controller: AxisController<C>,
    signal: S,
    variables: ScanConfiguration,
    settings: AcquisitionSettings,
    output_dir: PathBuf,
}

impl<C: CommandChannel, S: SignalSource> ScanEngine<C, S> {
    pub fn new(
        controller: AxisController<C>,
        signal: S,
        variables: ScanConfiguration,
        settings: AcquisitionSettings,
        output_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            controller,
            signal,
            variables,
            settings,
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn controller(&self) -> &AxisController<C> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut AxisController<C> {
        &mut self.controller
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    /// One scan followed by retracting the axis
    pub fn run_scan(&mut self, axis: AxisId) -> Result<ScanOutcome, ScannerError> {
        let outcome = self.guarded(axis, |engine| engine.scan_pass(axis))?;
        if let ScanOutcome::Completed(_) = outcome {
            if self.controller.retract(axis)?.is_cancelled() {
                warn!("{axis}: stopped while retracting after the scan, axis left in the beam");
            }
        }
        Ok(outcome)
    }

    /// Center the axis, run `count` scans and retract once at the end
    pub fn run_session(&mut self, axis: AxisId, count: usize) -> Result<SessionReport, ScannerError> {
        let mut report = SessionReport::default();

        if self.guarded(axis, |engine| engine.controller.center_axis(axis))? == Motion::Cancelled {
            report.cancelled = true;
            return Ok(report);
        }

        for n in 1..=count {
            info!("{axis}: scan {n} of {count}");
            match self.guarded(axis, |engine| engine.scan_pass(axis))? {
                ScanOutcome::Completed(scan) => report.scans.push(scan),
                ScanOutcome::Cancelled => {
                    report.cancelled = true;
                    return Ok(report);
                }
            }
        }

        if self.controller.retract(axis)?.is_cancelled() {
            warn!("{axis}: stopped during the final retract, axis left in the beam");
            report.cancelled = true;
        }
        Ok(report)
    }

    /// Run `step`, and on anything but normal completion return the plates to
    /// zero and de-energise before reporting.
    fn guarded<T: Cancellable>(
        &mut self,
        axis: AxisId,
        step: impl FnOnce(&mut Self) -> Result<T, ScannerError>,
    ) -> Result<T, ScannerError> {
        match step(self) {
            Ok(value) if value.is_cancelled() => {
                warn!("{axis}: cancelled, leaving the axis de-energised in place");
                self.make_safe(axis);
                Ok(value)
            }
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("{axis}: aborting after error: {e}");
                self.make_safe(axis);
                Err(e)
            }
        }
    }

    fn make_safe(&mut self, axis: AxisId) {
        if let Err(e) = self.signal.set_output(self.settings.output_offset) {
            warn!("Could not return the plates to 0 V: {e}");
        }
        if let Err(e) = self.controller.deenergize(axis) {
            warn!("Could not de-energise {axis}: {e}");
        }
    }

    /// Average the scan cup over the configured samples, in amperes, with the
    /// amplifier inversion undone and negative noise floored to zero
    fn measure_current(&mut self) -> Result<f64, ScannerError> {
        let mut sum = 0.0;
        for k in 0..self.settings.samples {
            if k > 0 && !self.settings.sample_interval.is_zero() {
                std::thread::sleep(self.settings.sample_interval);
            }
            sum += self.signal.read_sample()? / self.settings.gain;
        }
        let current = -sum / self.settings.samples as f64;
        Ok(current.max(0.0))
    }

    fn scan_pass(&mut self, axis: AxisId) -> Result<ScanOutcome, ScannerError> {
        let limits = self.variables.limits(axis.plane())?;
        let positions = closed_grid(limits.position.min, limits.position.max, limits.position.step)?;
        let momenta = closed_grid(limits.momentum.min, limits.momentum.max, limits.momentum.step)?;
        let voltages: Vec<f64> = momenta
            .iter()
            .map(|p| plate_voltage(p * 1e-3, limits.extraction_voltage) / self.settings.output_divisor)
            .collect();

        info!(
            "{axis}: scanning {} positions x {} momenta",
            positions.len(),
            momenta.len()
        );

        let stop = self.controller.stop_flag();
        let mut current = Array2::<f64>::zeros((momenta.len(), positions.len()));

        for (j, &position) in positions.iter().enumerate() {
            if self.controller.move_absolute(axis, position)? == Motion::Cancelled {
                return Ok(ScanOutcome::Cancelled);
            }
            debug!("{axis}: at {position} mm ({}/{})", j + 1, positions.len());

            for (i, &volts) in voltages.iter().enumerate() {
                if stop.is_requested() {
                    return Ok(ScanOutcome::Cancelled);
                }
                self.signal.set_output(volts + self.settings.output_offset)?;
                if !self.settings.settle_delay.is_zero() {
                    std::thread::sleep(self.settings.settle_delay);
                }
                current[[i, j]] = self.measure_current()?;
            }
        }
        self.signal.set_output(self.settings.output_offset)?;

        let positions_m: Vec<f64> = positions.iter().map(|x| x * 1e-3).collect();
        let momenta_rad: Vec<f64> = momenta.iter().map(|p| p * 1e-3).collect();
        let twiss = analysis::analyze(&current, &positions_m, &momenta_rad)?;
        info!(
            "{axis}: emittance {:.4} mm mrad, alpha {:.4}, beta {:.4}, gamma {:.4}",
            twiss.emittance_mm_mrad(),
            twiss.alpha,
            twiss.beta,
            twiss.gamma
        );

        let record = ScanRecord {
            variables: self.variables.clone(),
            axis,
            positions,
            momenta,
            voltages,
            current,
            twiss,
        };
        let path = record.write(&self.output_dir)?;
        Ok(ScanOutcome::Completed(CompletedScan { record, path }))
    }
}

/// Results that may report a cancellation instead of an error
trait Cancellable {
    fn is_cancelled(&self) -> bool;
}

impl Cancellable for Motion {
    fn is_cancelled(&self) -> bool {
        *self == Motion::Cancelled
    }
}

impl Cancellable for ScanOutcome {
    fn is_cancelled(&self) -> bool {
        matches!(self, ScanOutcome::Cancelled)
    }
}

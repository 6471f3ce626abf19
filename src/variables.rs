//! Scan physics parameters and their on-disk JSON form.
//!
//! Files are written as `Emittance_Scanner_Variables_<timestamp>.txt` holding a
//! single JSON object keyed by human-readable labels. Only files whose name
//! follows that pattern are accepted for loading.

use crate::axis::{AxisId, BeamLine, Plane};
use crate::error::ScannerError;
use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Deflection plate gap d, m
pub const PLATE_GAP: f64 = 0.0189992;
/// Deflection plate length L, m
pub const PLATE_LENGTH: f64 = 0.1199896;
/// Largest plate voltage magnitude the amplifier can deliver
pub const MAX_PLATE_VOLTAGE: f64 = 200.0;
/// Largest scan half-width accepted for a position maximum, mm
pub const MAX_POSITION: f64 = 50.0;

/// `strftime` pattern shared by variables and scan data file names
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %Hh%Mm%Ss";
pub const FILE_PREFIX: &str = "Emittance_Scanner_Variables_";

/// Plate voltage selecting paraxial momentum `momentum` (rad) for a beam
/// extracted at `extraction_voltage`.
pub fn plate_voltage(momentum: f64, extraction_voltage: f64) -> f64 {
    2.0 * momentum * PLATE_GAP * extraction_voltage / PLATE_LENGTH
}

/// Momentum in mrad selected by `voltage` on the plates, rounded to 3 decimals
pub fn momentum_for_voltage(voltage: f64, extraction_voltage: f64) -> f64 {
    let mrad = voltage / PLATE_GAP / extraction_voltage * PLATE_LENGTH / 2.0 * 1e3;
    (mrad * 1e3).round() / 1e3
}

/// Whether `s` is a timestamp in [`TIMESTAMP_FORMAT`], zero padded
pub(crate) fn is_timestamp(s: &str) -> bool {
    s.len() == "YYYY-MM-DD HHhMMmSSs".len()
        && NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).is_ok()
}

pub(crate) fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Every user-settable parameter, in file order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    MomentumXMax,
    MomentumXMin,
    MomentumYMax,
    MomentumYMin,
    PositionXMax,
    PositionXMin,
    PositionYMax,
    PositionYMin,
    ChargeNumber,
    MassNumber,
    ExtractionVoltage,
    MomentumXStep,
    MomentumYStep,
    PositionXStep,
    PositionYStep,
}

/// Which bound of a scanned quantity a field sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Max,
    Min,
    Step,
}

/// The three fields describing one scanned quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub max: Field,
    pub min: Field,
    pub step: Field,
}

impl Field {
    pub const ALL: [Field; 15] = [
        Field::MomentumXMax,
        Field::MomentumXMin,
        Field::MomentumYMax,
        Field::MomentumYMin,
        Field::PositionXMax,
        Field::PositionXMin,
        Field::PositionYMax,
        Field::PositionYMin,
        Field::ChargeNumber,
        Field::MassNumber,
        Field::ExtractionVoltage,
        Field::MomentumXStep,
        Field::MomentumYStep,
        Field::PositionXStep,
        Field::PositionYStep,
    ];

    /// Key used in the variables file
    pub fn label(self) -> &'static str {
        match self {
            Field::MomentumXMax => "Maximal x' [mrad]",
            Field::MomentumXMin => "Minimal x' [mrad]",
            Field::MomentumYMax => "Maximal y' [mrad]",
            Field::MomentumYMin => "Minimal y' [mrad]",
            Field::PositionXMax => "Maximal x [mm]",
            Field::PositionXMin => "Minimal x [mm]",
            Field::PositionYMax => "Maximal y [mm]",
            Field::PositionYMin => "Minimal y [mm]",
            Field::ChargeNumber => "Charge Number Q",
            Field::MassNumber => "Mass Number M",
            Field::ExtractionVoltage => "Extraction Voltage U [V]",
            Field::MomentumXStep => "x' Step Size [mrad]",
            Field::MomentumYStep => "y' Step Size [mrad]",
            Field::PositionXStep => "x Step Size [mm]",
            Field::PositionYStep => "y Step Size [mm]",
        }
    }

    /// Short name accepted on the command line (`xp_max`, `V_extr`, ...)
    pub fn key(self) -> &'static str {
        match self {
            Field::MomentumXMax => "xp_max",
            Field::MomentumXMin => "xp_min",
            Field::MomentumYMax => "yp_max",
            Field::MomentumYMin => "yp_min",
            Field::PositionXMax => "x_max",
            Field::PositionXMin => "x_min",
            Field::PositionYMax => "y_max",
            Field::PositionYMin => "y_min",
            Field::ChargeNumber => "Q",
            Field::MassNumber => "M",
            Field::ExtractionVoltage => "V_extr",
            Field::MomentumXStep => "xp_step",
            Field::MomentumYStep => "yp_step",
            Field::PositionXStep => "x_step",
            Field::PositionYStep => "y_step",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Self::ALL
            .into_iter()
            .find(|f| f.key().eq_ignore_ascii_case(key) || f.label() == key)
    }

    /// The max/min/step group this field belongs to, if any
    pub fn bounds(self) -> Option<(Bounds, Role)> {
        use Field::*;
        let (group, role) = match self {
            MomentumXMax => (Bounds::momentum(Plane::Horizontal), Role::Max),
            MomentumXMin => (Bounds::momentum(Plane::Horizontal), Role::Min),
            MomentumXStep => (Bounds::momentum(Plane::Horizontal), Role::Step),
            MomentumYMax => (Bounds::momentum(Plane::Vertical), Role::Max),
            MomentumYMin => (Bounds::momentum(Plane::Vertical), Role::Min),
            MomentumYStep => (Bounds::momentum(Plane::Vertical), Role::Step),
            PositionXMax => (Bounds::position(Plane::Horizontal), Role::Max),
            PositionXMin => (Bounds::position(Plane::Horizontal), Role::Min),
            PositionXStep => (Bounds::position(Plane::Horizontal), Role::Step),
            PositionYMax => (Bounds::position(Plane::Vertical), Role::Max),
            PositionYMin => (Bounds::position(Plane::Vertical), Role::Min),
            PositionYStep => (Bounds::position(Plane::Vertical), Role::Step),
            ChargeNumber | MassNumber | ExtractionVoltage => return None,
        };
        Some((group, role))
    }

    fn is_momentum(self) -> bool {
        matches!(
            self,
            Field::MomentumXMax
                | Field::MomentumXMin
                | Field::MomentumXStep
                | Field::MomentumYMax
                | Field::MomentumYMin
                | Field::MomentumYStep
        )
    }

    fn plane(self) -> Option<Plane> {
        let (bounds, _) = self.bounds()?;
        Some(if bounds.max == Field::MomentumXMax || bounds.max == Field::PositionXMax {
            Plane::Horizontal
        } else {
            Plane::Vertical
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Bounds {
    pub fn momentum(plane: Plane) -> Self {
        match plane {
            Plane::Horizontal => Bounds {
                max: Field::MomentumXMax,
                min: Field::MomentumXMin,
                step: Field::MomentumXStep,
            },
            Plane::Vertical => Bounds {
                max: Field::MomentumYMax,
                min: Field::MomentumYMin,
                step: Field::MomentumYStep,
            },
        }
    }

    pub fn position(plane: Plane) -> Self {
        match plane {
            Plane::Horizontal => Bounds {
                max: Field::PositionXMax,
                min: Field::PositionXMin,
                step: Field::PositionXStep,
            },
            Plane::Vertical => Bounds {
                max: Field::PositionYMax,
                min: Field::PositionYMin,
                step: Field::PositionYStep,
            },
        }
    }
}

/// Closed grid bounds, in mm or mrad
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Everything a scan of one plane needs from the configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneLimits {
    pub position: GridSpec,
    pub momentum: GridSpec,
    pub extraction_voltage: f64,
}

/// Operator-declared scan parameters.
///
/// Unset values are `None` until entered; [`ScanConfiguration::limits`]
/// refuses to produce scan grids while anything a plane needs is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfiguration {
    #[serde(rename = "Maximal x' [mrad]")]
    pub xp_max: Option<f64>,
    #[serde(rename = "Minimal x' [mrad]")]
    pub xp_min: Option<f64>,
    #[serde(rename = "Maximal y' [mrad]")]
    pub yp_max: Option<f64>,
    #[serde(rename = "Minimal y' [mrad]")]
    pub yp_min: Option<f64>,
    #[serde(rename = "Maximal x [mm]")]
    pub x_max: Option<f64>,
    #[serde(rename = "Minimal x [mm]")]
    pub x_min: Option<f64>,
    #[serde(rename = "Maximal y [mm]")]
    pub y_max: Option<f64>,
    #[serde(rename = "Minimal y [mm]")]
    pub y_min: Option<f64>,
    #[serde(rename = "Charge Number Q")]
    pub charge: Option<i64>,
    #[serde(rename = "Mass Number M")]
    pub mass: Option<i64>,
    #[serde(rename = "Extraction Voltage U [V]")]
    pub extraction_voltage: Option<f64>,
    #[serde(rename = "x' Step Size [mrad]")]
    pub xp_step: Option<f64>,
    #[serde(rename = "y' Step Size [mrad]")]
    pub yp_step: Option<f64>,
    #[serde(rename = "x Step Size [mm]")]
    pub x_step: Option<f64>,
    #[serde(rename = "y Step Size [mm]")]
    pub y_step: Option<f64>,
}

impl ScanConfiguration {
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::ChargeNumber => self.charge.map(|q| q as f64),
            Field::MassNumber => self.mass.map(|m| m as f64),
            _ => self.slot(field).copied().flatten(),
        }
    }

    fn slot(&self, field: Field) -> Option<&Option<f64>> {
        Some(match field {
            Field::MomentumXMax => &self.xp_max,
            Field::MomentumXMin => &self.xp_min,
            Field::MomentumYMax => &self.yp_max,
            Field::MomentumYMin => &self.yp_min,
            Field::PositionXMax => &self.x_max,
            Field::PositionXMin => &self.x_min,
            Field::PositionYMax => &self.y_max,
            Field::PositionYMin => &self.y_min,
            Field::ExtractionVoltage => &self.extraction_voltage,
            Field::MomentumXStep => &self.xp_step,
            Field::MomentumYStep => &self.yp_step,
            Field::PositionXStep => &self.x_step,
            Field::PositionYStep => &self.y_step,
            Field::ChargeNumber | Field::MassNumber => return None,
        })
    }

    fn slot_mut(&mut self, field: Field) -> Option<&mut Option<f64>> {
        Some(match field {
            Field::MomentumXMax => &mut self.xp_max,
            Field::MomentumXMin => &mut self.xp_min,
            Field::MomentumYMax => &mut self.yp_max,
            Field::MomentumYMin => &mut self.yp_min,
            Field::PositionXMax => &mut self.x_max,
            Field::PositionXMin => &mut self.x_min,
            Field::PositionYMax => &mut self.y_max,
            Field::PositionYMin => &mut self.y_min,
            Field::ExtractionVoltage => &mut self.extraction_voltage,
            Field::MomentumXStep => &mut self.xp_step,
            Field::MomentumYStep => &mut self.yp_step,
            Field::PositionXStep => &mut self.x_step,
            Field::PositionYStep => &mut self.y_step,
            Field::ChargeNumber | Field::MassNumber => return None,
        })
    }

    fn require(&self, field: Field) -> Result<f64, ScannerError> {
        self.get(field)
            .ok_or_else(|| ScannerError::MissingField(field.label().to_string()))
    }

    /// Plate voltage for momentum `momentum_mrad` at the configured
    /// extraction voltage
    pub fn plate_voltage(&self, momentum_mrad: f64) -> Result<f64, ScannerError> {
        let extraction = self.require(Field::ExtractionVoltage)?;
        Ok(plate_voltage(momentum_mrad * 1e-3, extraction))
    }

    /// Largest momentum reachable with +200 V on the plates, mrad
    pub fn max_momentum(&self) -> Result<f64, ScannerError> {
        let extraction = self.require(Field::ExtractionVoltage)?;
        Ok(momentum_for_voltage(MAX_PLATE_VOLTAGE, extraction))
    }

    /// Apply one operator entry following the per-field entry rules.
    ///
    /// Out-of-range numbers are clamped to the nearest allowed value, while
    /// unparsable input or a step wider than its range is rejected with the
    /// previous value kept. Returns the value actually stored.
    pub fn set(
        &mut self,
        field: Field,
        input: &str,
        beam: Option<BeamLine>,
    ) -> Result<f64, ScannerError> {
        let input = input.trim();
        let reject = |reason: &str| ScannerError::invalid_value(field.label(), reason);
        let parse = || {
            input
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| reject("not a number"))
        };

        let stored = match (field, field.bounds()) {
            (Field::ChargeNumber | Field::MassNumber, _) => {
                let value: i64 = input.parse().map_err(|_| reject("must be an integer"))?;
                if field == Field::ChargeNumber {
                    self.charge = Some(value);
                } else {
                    self.mass = Some(value);
                }
                return Ok(value as f64);
            }
            (Field::ExtractionVoltage, _) => parse()?.max(0.0),
            (_, Some((bounds, Role::Step))) => {
                let step = parse()?.abs();
                let max = self
                    .get(bounds.max)
                    .ok_or_else(|| reject(&format!("set {} first", bounds.max)))?;
                if step > 2.0 * max {
                    return Err(reject(&format!("step exceeds the range 2 x {max}")));
                }
                step
            }
            (_, Some((bounds, role))) if field.is_momentum() => {
                let extraction = self
                    .get(Field::ExtractionVoltage)
                    .ok_or_else(|| reject("set Extraction Voltage first"))?;
                let sign = if role == Role::Max { 1.0 } else { -1.0 };
                let value = if role == Role::Min && input.is_empty() {
                    -self
                        .get(bounds.max)
                        .ok_or_else(|| reject(&format!("set {} first", bounds.max)))?
                } else {
                    parse()?
                };
                if sign * plate_voltage(value * 1e-3, extraction) > MAX_PLATE_VOLTAGE {
                    let limit = momentum_for_voltage(sign * MAX_PLATE_VOLTAGE, extraction);
                    warn!("{field} {value} needs more than {MAX_PLATE_VOLTAGE} V, using {limit}");
                    limit
                } else if role == Role::Max {
                    value.max(0.0)
                } else {
                    value.min(0.0)
                }
            }
            (_, Some((_, Role::Max))) => parse()?.clamp(0.0, MAX_POSITION),
            (_, Some((bounds, _))) => {
                if input.is_empty() {
                    -self
                        .get(bounds.max)
                        .ok_or_else(|| reject(&format!("set {} first", bounds.max)))?
                } else {
                    let value = parse()?;
                    match (beam, field.plane()) {
                        (Some(beam), Some(plane)) => {
                            let offset = AxisId::new(beam, plane).midpoint_offset();
                            value.clamp(-offset, 0.0)
                        }
                        _ => value.min(0.0),
                    }
                }
            }
            (_, None) => return Err(reject("not an editable field")),
        };

        if let Some(slot) = self.slot_mut(field) {
            *slot = Some(stored);
        }
        Ok(stored)
    }

    /// Grid bounds and extraction voltage for scanning `plane`.
    ///
    /// Checks min ≤ 0 ≤ max, 0 < step ≤ 2·max and that the momentum range
    /// stays within the plate amplifier's ±200 V.
    pub fn limits(&self, plane: Plane) -> Result<PlaneLimits, ScannerError> {
        let extraction_voltage = self.require(Field::ExtractionVoltage)?;
        if extraction_voltage <= 0.0 {
            return Err(ScannerError::invalid_value(
                Field::ExtractionVoltage.label(),
                "must be positive",
            ));
        }

        let grid = |bounds: Bounds| -> Result<GridSpec, ScannerError> {
            let spec = GridSpec {
                min: self.require(bounds.min)?,
                max: self.require(bounds.max)?,
                step: self.require(bounds.step)?,
            };
            if spec.min > 0.0 || spec.max < 0.0 {
                return Err(ScannerError::invalid_value(
                    bounds.max.label(),
                    format!("range [{}, {}] must contain 0", spec.min, spec.max),
                ));
            }
            if !(spec.step > 0.0 && spec.step <= 2.0 * spec.max) {
                return Err(ScannerError::invalid_value(
                    bounds.step.label(),
                    format!("must be positive and at most {}", 2.0 * spec.max),
                ));
            }
            Ok(spec)
        };

        let position = grid(Bounds::position(plane))?;
        let momentum = grid(Bounds::momentum(plane))?;

        // Bounds rounded to 3 decimals may overshoot 200 V by a hair
        let tolerance = MAX_PLATE_VOLTAGE * 1e-5;
        for (field, value) in [
            (Bounds::momentum(plane).max, momentum.max),
            (Bounds::momentum(plane).min, momentum.min),
        ] {
            let volts = plate_voltage(value * 1e-3, extraction_voltage);
            if volts.abs() > MAX_PLATE_VOLTAGE + tolerance {
                return Err(ScannerError::invalid_value(
                    field.label(),
                    format!("needs {volts:.1} V on the plates"),
                ));
            }
        }

        Ok(PlaneLimits {
            position,
            momentum,
            extraction_voltage,
        })
    }

    /// Parse the JSON object of a variables file.
    ///
    /// Every label must be present (`null` is allowed for values never
    /// entered); a missing key is reported by name.
    pub fn from_json(text: &str) -> Result<Self, ScannerError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or_else(|| ScannerError::MalformedRecord("variables are not a JSON object".to_string()))?;
        if let Some(missing) = Field::ALL.iter().find(|f| !object.contains_key(f.label())) {
            return Err(ScannerError::MissingField(missing.label().to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, ScannerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write to a new timestamped file in `dir` and return its path
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ScannerError> {
        let path = dir.join(format!("{FILE_PREFIX}{}.txt", timestamp_now()));
        fs::write(&path, self.to_json()?)
            .map_err(|e| ScannerError::io(e, format!("writing {}", path.display())))?;
        info!("Variables saved to {}", path.display());
        Ok(path)
    }

    /// Load a variables file, refusing files whose name does not match
    /// `Emittance_Scanner_Variables_YYYY-MM-DD HHhMMmSSs.txt`.
    pub fn load(path: &Path) -> Result<Self, ScannerError> {
        check_file_name(path)?;
        let text = fs::read_to_string(path)
            .map_err(|e| ScannerError::io(e, format!("reading {}", path.display())))?;
        Self::from_json(&text)
    }
}

fn check_file_name(path: &Path) -> Result<(), ScannerError> {
    let valid = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(FILE_PREFIX))
        .and_then(|rest| rest.strip_suffix(".txt"))
        .is_some_and(is_timestamp);
    if valid {
        Ok(())
    } else {
        Err(ScannerError::InvalidFileName(path.display().to_string()))
    }
}

/// Parameters of the reference scan: ±10 mm in 5 mm steps, ±50 mrad in
/// 25 mrad steps at 10 kV
#[cfg(test)]
pub(crate) fn reference() -> ScanConfiguration {
    ScanConfiguration {
        xp_max: Some(50.0),
        xp_min: Some(-50.0),
        yp_max: Some(50.0),
        yp_min: Some(-50.0),
        x_max: Some(10.0),
        x_min: Some(-10.0),
        y_max: Some(12.0),
        y_min: Some(0.0),
        charge: Some(1),
        mass: Some(1),
        extraction_voltage: Some(10000.0),
        xp_step: Some(25.0),
        yp_step: Some(25.0),
        x_step: Some(5.0),
        y_step: Some(3.0),
    }
}

//! Persisted scan file.
//!
//! A record is plain text made of alternating label and payload lines in a
//! fixed order. Payloads are JSON except for the beam line and axis names.
//! Readers locate fields by line position alone, so the order must not
//! change.

use crate::analysis::{self, TwissResult};
use crate::axis::{AxisId, BeamLine, Plane};
use crate::error::ScannerError;
use crate::variables::{ScanConfiguration, is_timestamp, timestamp_now};
use log::info;
use ndarray::Array2;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

pub const FILE_PREFIX: &str = "Emittance_Scanner_Data_";

/// Label lines in file order. The trailing spaces are part of the format.
pub const LABELS: [&str; 11] = [
    "Variables",
    "Beam Line:",
    "Axis:",
    "Position Array:",
    "Momentum Array: ",
    "Voltage Array: ",
    "Current Matrix: ",
    "RMS Emittance: ",
    "Twiss Parameter Alpha: ",
    "Twiss Parameter Beta: ",
    "Twiss Parameter Gamma: ",
];

/// One completed scan: inputs, raw matrix and derived Twiss parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub variables: ScanConfiguration,
    pub axis: AxisId,
    /// Probe positions, mm
    pub positions: Vec<f64>,
    /// Selected momenta, mrad
    pub momenta: Vec<f64>,
    /// Plate amplifier input for each momentum, volts before the DAQ offset
    pub voltages: Vec<f64>,
    /// Beam current in amperes, rows follow `momenta`, columns `positions`
    pub current: Array2<f64>,
    pub twiss: TwissResult,
}

fn file_tag(axis: AxisId) -> &'static str {
    match axis {
        AxisId::VenusX => "Venus_x_",
        AxisId::VenusY => "Venus_y_",
        AxisId::AecrX => "AECR_x_",
        AxisId::AecrY => "AECR_y_",
    }
}

fn payload<T: DeserializeOwned>(label: &str, text: &str) -> Result<T, ScannerError> {
    serde_json::from_str(text.trim())
        .map_err(|e| ScannerError::MalformedRecord(format!("{}: {e}", label.trim())))
}

impl ScanRecord {
    pub fn beam_line(&self) -> BeamLine {
        self.axis.beam_line()
    }

    pub fn plane(&self) -> Plane {
        self.axis.plane()
    }

    pub fn positions_m(&self) -> Vec<f64> {
        self.positions.iter().map(|x| x * 1e-3).collect()
    }

    pub fn momenta_rad(&self) -> Vec<f64> {
        self.momenta.iter().map(|p| p * 1e-3).collect()
    }

    /// Twiss parameters recomputed from the stored matrix
    pub fn reanalyze(&self) -> Result<TwissResult, ScannerError> {
        analysis::analyze(&self.current, &self.positions_m(), &self.momenta_rad())
    }

    /// `Emittance_Scanner_Data_<timestamp> <Beam>_<axis>_.txt`
    pub fn file_name(&self, timestamp: &str) -> String {
        format!("{FILE_PREFIX}{timestamp} {}.txt", file_tag(self.axis))
    }

    pub fn encode(&self) -> Result<String, ScannerError> {
        let matrix: Vec<Vec<f64>> = self.current.rows().into_iter().map(|r| r.to_vec()).collect();
        let payloads = [
            self.variables.to_json()?,
            self.beam_line().label().to_string(),
            self.plane().label().to_string(),
            serde_json::to_string(&self.positions)?,
            serde_json::to_string(&self.momenta)?,
            serde_json::to_string(&self.voltages)?,
            serde_json::to_string(&matrix)?,
            serde_json::to_string(&self.twiss.rms_emittance)?,
            serde_json::to_string(&self.twiss.alpha)?,
            serde_json::to_string(&self.twiss.beta)?,
            serde_json::to_string(&self.twiss.gamma)?,
        ];

        let lines: Vec<&str> = LABELS
            .iter()
            .zip(payloads.iter())
            .flat_map(|(label, payload)| [*label, payload.as_str()])
            .collect();
        Ok(lines.join("\n"))
    }

    pub fn decode(text: &str) -> Result<Self, ScannerError> {
        let lines: Vec<&str> = text.lines().collect();

        let mut fields = Vec::with_capacity(LABELS.len());
        for (n, label) in LABELS.iter().enumerate() {
            let found = lines
                .get(2 * n)
                .ok_or_else(|| ScannerError::MissingField(label.trim().to_string()))?;
            if found.trim() != label.trim() {
                return Err(ScannerError::MalformedRecord(format!(
                    "line {}: expected `{}`, found `{}`",
                    2 * n + 1,
                    label.trim(),
                    found.trim()
                )));
            }
            let value = lines
                .get(2 * n + 1)
                .ok_or_else(|| ScannerError::MissingField(label.trim().to_string()))?;
            fields.push(*value);
        }

        let variables = ScanConfiguration::from_json(fields[0])?;
        let beam = BeamLine::from_label(fields[1]).ok_or_else(|| {
            ScannerError::MalformedRecord(format!("unknown beam line `{}`", fields[1].trim()))
        })?;
        let plane = Plane::from_label(fields[2]).ok_or_else(|| {
            ScannerError::MalformedRecord(format!("unknown axis `{}`", fields[2].trim()))
        })?;

        let positions: Vec<f64> = payload(LABELS[3], fields[3])?;
        let momenta: Vec<f64> = payload(LABELS[4], fields[4])?;
        let voltages: Vec<f64> = payload(LABELS[5], fields[5])?;
        let rows: Vec<Vec<f64>> = payload(LABELS[6], fields[6])?;

        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(ScannerError::MalformedRecord("current matrix rows differ in length".to_string()));
        }
        let current = Array2::from_shape_vec((rows.len(), cols), rows.concat())
            .map_err(|e| ScannerError::MalformedRecord(format!("current matrix: {e}")))?;

        let twiss = TwissResult {
            rms_emittance: payload(LABELS[7], fields[7])?,
            alpha: payload(LABELS[8], fields[8])?,
            beta: payload(LABELS[9], fields[9])?,
            gamma: payload(LABELS[10], fields[10])?,
        };

        Ok(Self {
            variables,
            axis: AxisId::new(beam, plane),
            positions,
            momenta,
            voltages,
            current,
            twiss,
        })
    }

    /// Write into `dir` under a fresh timestamped name
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ScannerError> {
        let path = dir.join(self.file_name(&timestamp_now()));
        fs::write(&path, self.encode()?)
            .map_err(|e| ScannerError::io(e, format!("writing {}", path.display())))?;
        info!("Scan of {} saved to {}", self.axis, path.display());
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, ScannerError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ScannerError::io(e, format!("reading {}", path.display())))?;
        Self::decode(&text)
    }
}

/// Whether `name` looks like a scan data file name
pub fn is_record_file_name(name: &str) -> bool {
    name.strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(".txt"))
        .and_then(|rest| rest.split_once(' '))
        .and_then(|(date, rest)| rest.split_once(' ').map(|(time, tag)| (date, time, tag)))
        .is_some_and(|(date, time, tag)| {
            is_timestamp(&format!("{date} {time}"))
                && AxisId::ALL.iter().any(|&axis| file_tag(axis) == tag)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::reference;

    fn sample() -> ScanRecord {
        let positions = vec![-10.0, -5.0, 0.0, 5.0, 10.0];
        let momenta = vec![-50.0, -25.0, 0.0, 25.0, 50.0];
        let voltages = vec![-1.5834, -0.7917, 0.0, 0.7917, 1.5834];
        let current = Array2::from_shape_fn((5, 5), |(i, j)| {
            1e-9 * (1.0 + i as f64) * (5.0 - j as f64) + 3.7e-13
        });
        ScanRecord {
            variables: reference(),
            axis: AxisId::AecrY,
            positions,
            momenta,
            voltages,
            current,
            twiss: TwissResult {
                rms_emittance: 1.234_567_890_123e-5,
                alpha: -0.25,
                beta: 0.8,
                gamma: 1.328125,
            },
        }
    }

    #[test]
    fn test_encode_layout() {
        let text = sample().encode().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 22);
        for (n, label) in LABELS.iter().enumerate() {
            assert_eq!(lines[2 * n], *label);
        }
        assert_eq!(lines[3], "AECR");
        assert_eq!(lines[5], "Y");
        assert_eq!(lines[7], "[-10.0,-5.0,0.0,5.0,10.0]");
        assert!(lines[13].starts_with("[[") && lines[13].ends_with("]]"));
    }

    #[test]
    fn test_roundtrip() {
        let record = sample();
        let decoded = ScanRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_accepts_spaced_json_and_trailing_newline() {
        let record = sample();
        let mut text = record.encode().unwrap();
        text = text.replace("[-10.0,-5.0,0.0,5.0,10.0]", "[-10.0, -5.0, 0.0, 5.0, 10.0]");
        text.push('\n');
        let decoded = ScanRecord::decode(&text).unwrap();
        assert_eq!(decoded.positions, record.positions);
    }

    #[test]
    fn test_truncated_record() {
        let text = sample().encode().unwrap();
        let truncated: Vec<&str> = text.lines().take(15).collect();
        match ScanRecord::decode(&truncated.join("\n")) {
            Err(ScannerError::MissingField(label)) => assert_eq!(label, "RMS Emittance:"),
            other => panic!("expected missing field, got {other:?}"),
        }
    }

    #[test]
    fn test_misplaced_label() {
        let text = sample().encode().unwrap().replace("Axis:", "Plane:");
        assert!(matches!(
            ScanRecord::decode(&text),
            Err(ScannerError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_ragged_matrix() {
        let record = sample();
        let text = record.encode().unwrap();
        let lines: Vec<String> = text
            .lines()
            .enumerate()
            .map(|(i, l)| if i == 13 { "[[1.0,2.0],[3.0]]".to_string() } else { l.to_string() })
            .collect();
        assert!(matches!(
            ScanRecord::decode(&lines.join("\n")),
            Err(ScannerError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_unknown_beam_line() {
        let text = sample().encode().unwrap().replace("\nAECR\n", "\nLINAC\n");
        assert!(matches!(
            ScanRecord::decode(&text),
            Err(ScannerError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_file_names() {
        let mut record = sample();
        assert_eq!(
            record.file_name("2024-05-17 14h03m59s"),
            "Emittance_Scanner_Data_2024-05-17 14h03m59s AECR_y_.txt"
        );
        record.axis = AxisId::VenusX;
        let name = record.file_name("2024-05-17 14h03m59s");
        assert_eq!(name, "Emittance_Scanner_Data_2024-05-17 14h03m59s Venus_x_.txt");
        assert!(is_record_file_name(&name));
        assert!(!is_record_file_name("Emittance_Scanner_Data_2024-05-17 Venus_x_.txt"));
        assert!(!is_record_file_name("Emittance_Scanner_Data_2024-05-17 14h03m59s VENUS_x_.txt"));
    }

    #[test]
    fn test_write_and_read() {
        let dir = std::env::temp_dir().join(format!("emittance-record-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let record = sample();
        let path = record.write(&dir).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(is_record_file_name(name));
        assert_eq!(ScanRecord::read(&path).unwrap(), record);

        fs::remove_dir_all(&dir).unwrap();
    }
}

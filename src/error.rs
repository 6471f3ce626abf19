use crate::axis::AxisId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Cannot open communication with motion controller at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Axis {axis} can not be cleared: {paired} is not at its positive limit")]
    AxisNotCleared { axis: AxisId, paired: AxisId },
    #[error("Upstream safety sensor not satisfied, refusing to move {0}")]
    SafetyInterlock(AxisId),
    #[error("Axis {axis} still in motion after {timeout:?}")]
    MotionTimeout { axis: AxisId, timeout: Duration },
    #[error("Wrong file format: {0}")]
    InvalidFileName(String),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Malformed scan record: {0}")]
    MalformedRecord(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("Degenerate current distribution: emittance radicand is {0:e}")]
    DegenerateDistribution(f64),
    #[error("Current matrix is {rows}x{cols}, expected {expected_rows}x{expected_cols}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("Current matrix carries no signal")]
    EmptyMatrix,
    #[error("Signal source error: {0}")]
    Signal(String),
    #[error("Unknown axis: {0}")]
    InvalidAxis(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScannerError {
    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        ScannerError::Io {
            source,
            context: context.into(),
        }
    }

    pub(crate) fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ScannerError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Conditions that need operator intervention before the hardware may
    /// be driven again. A scan in progress is aborted on any of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScannerError::AxisNotCleared { .. }
                | ScannerError::SafetyInterlock(_)
                | ScannerError::MotionTimeout { .. }
                | ScannerError::Connection { .. }
                | ScannerError::InvalidFileName(_)
                | ScannerError::DegenerateDistribution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let not_cleared = ScannerError::AxisNotCleared {
            axis: AxisId::VenusX,
            paired: AxisId::VenusY,
        };
        assert!(not_cleared.is_fatal());
        assert!(ScannerError::SafetyInterlock(AxisId::AecrY).is_fatal());
        assert!(ScannerError::DegenerateDistribution(-1e-12).is_fatal());

        assert!(!ScannerError::invalid_value("Mass Number M", "must be an integer").is_fatal());
        assert!(!ScannerError::MissingField("Charge Number Q".to_string()).is_fatal());
    }

    #[test]
    fn test_messages_name_the_axes() {
        let err = ScannerError::AxisNotCleared {
            axis: AxisId::AecrX,
            paired: AxisId::AecrY,
        };
        let msg = err.to_string();
        assert!(msg.contains("AECR-X"));
        assert!(msg.contains("AECR-Y"));
    }
}

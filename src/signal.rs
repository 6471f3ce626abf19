//! Analog side of the scanner: the deflection plate output and the
//! transimpedance amplifier input.

use crate::error::ScannerError;

/// Narrow view of the data acquisition hardware.
///
/// `set_output` drives the plate amplifier input, `read_sample` returns one
/// reading of the current amplifier output. Both are in volts at the DAQ.
pub trait SignalSource {
    fn set_output(&mut self, volts: f64) -> Result<(), ScannerError>;

    fn read_sample(&mut self) -> Result<f64, ScannerError>;
}

impl<S: SignalSource + ?Sized> SignalSource for Box<S> {
    fn set_output(&mut self, volts: f64) -> Result<(), ScannerError> {
        (**self).set_output(volts)
    }

    fn read_sample(&mut self) -> Result<f64, ScannerError> {
        (**self).read_sample()
    }
}

/// Deterministic stand-in for the DAQ, used for dry runs.
///
/// The beam is a Gaussian in plate output voltage centred on `center`. The
/// amplifier inverts, so readings are negative on the beam and hover around
/// zero (with either sign) off the beam.
#[derive(Debug, Clone)]
pub struct SimulatedSignal {
    /// Peak amplifier output, volts
    pub peak: f64,
    /// Output voltage at the beam centre
    pub center: f64,
    /// Gaussian width in output volts
    pub width: f64,
    /// Peak-to-peak baseline noise, volts
    pub noise: f64,
    output: f64,
    samples: u64,
}

impl SimulatedSignal {
    pub fn new(peak: f64, center: f64, width: f64) -> Self {
        Self {
            peak,
            center,
            width,
            noise: 0.0,
            output: center,
            samples: 0,
        }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    fn jitter(&self) -> f64 {
        // Deterministic pseudo-noise in [-0.5, 0.5)
        let phase = (self.samples as f64 * 0.618_033_988_75).fract();
        (phase - 0.5) * self.noise
    }
}

impl Default for SimulatedSignal {
    fn default() -> Self {
        Self::new(1.0, 3.188, 0.05).with_noise(1e-3)
    }
}

impl SignalSource for SimulatedSignal {
    fn set_output(&mut self, volts: f64) -> Result<(), ScannerError> {
        if !volts.is_finite() {
            return Err(ScannerError::Signal(format!("output voltage {volts} is not finite")));
        }
        self.output = volts;
        Ok(())
    }

    fn read_sample(&mut self) -> Result<f64, ScannerError> {
        self.samples += 1;
        let offset = (self.output - self.center) / self.width;
        let beam = self.peak * (-0.5 * offset * offset).exp();
        Ok(-beam + self.jitter())
    }
}

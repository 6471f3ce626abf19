pub mod acr;
pub mod analysis;
pub mod axis;
pub mod error;
pub mod plotting;
pub mod record;
pub mod scan;
pub mod signal;
pub mod utils;
pub mod variables;

pub use acr::{AcrClient, AcrClientBuilder, Command, CommandChannel, ConnectionConfig};
pub use analysis::{TwissResult, analyze, matched_ellipse};
pub use axis::{
    AxisController, AxisId, AxisState, BeamLine, Motion, MotionConfig, NoUpstreamProbe, Plane,
    SafetySensor,
};
pub use error::ScannerError;
pub use plotting::{plot_phase_space, plot_profile, twiss_summary};
pub use record::ScanRecord;
pub use scan::{
    AcquisitionSettings, CompletedScan, ScanEngine, ScanOutcome, SessionReport, closed_grid,
};
pub use signal::{SignalSource, SimulatedSignal};
pub use utils::{StopFlag, WaitOutcome, wait_until};
pub use variables::{Field, ScanConfiguration, plate_voltage};

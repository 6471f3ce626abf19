use crate::analysis::{TwissResult, matched_ellipse};
use crate::record::ScanRecord;
use ndarray::{Array2, Axis};
use textplots::{Chart, Plot, Shape};

/// Determine the best scale and unit prefix for a given maximum value
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else if max_value >= 1e-6 {
        (1e6, "μ")
    } else if max_value >= 1e-9 {
        (1e9, "n")
    } else {
        (1e12, "p")
    }
}

fn span(values: &[f64]) -> (f32, f32) {
    let min = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    (min as f32, max as f32)
}

/// Matched ellipse in mm / mrad for a Twiss set in SI units
pub fn ellipse_mm_mrad(twiss: &TwissResult, points: usize) -> Vec<(f32, f32)> {
    matched_ellipse(twiss, points)
        .into_iter()
        .map(|(x, p)| ((x * 1e3) as f32, (p * 1e3) as f32))
        .collect()
}

/// Grid points whose current is at least `fraction` of the peak
pub fn intensity_cloud(
    current: &Array2<f64>,
    positions: &[f64],
    momenta: &[f64],
    fraction: f64,
) -> Vec<(f32, f32)> {
    let peak = current.iter().fold(0.0_f64, |a, &b| a.max(b));
    if peak <= 0.0 {
        return Vec::new();
    }
    current
        .indexed_iter()
        .filter(|(_, c)| **c >= fraction * peak)
        .filter_map(|((i, j), _)| Some((*positions.get(j)? as f32, *momenta.get(i)? as f32)))
        .collect()
}

/// Current summed over momentum for each position, and over position for
/// each momentum
pub fn projections(current: &Array2<f64>) -> (Vec<f64>, Vec<f64>) {
    (
        current.sum_axis(Axis(0)).to_vec(),
        current.sum_axis(Axis(1)).to_vec(),
    )
}

/// Plot a profile against its grid with automatic unit scaling
///
/// # Examples
/// ```
/// use emittance_scanner::plotting::plot_profile;
///
/// let grid = vec![-2.0, -1.0, 0.0, 1.0, 2.0];
/// let current = vec![1e-10, 4e-10, 9e-10, 4e-10, 1e-10];
/// plot_profile(&grid, &current, "x profile", "x [mm]", None, None).unwrap();
/// ```
pub fn plot_profile(
    grid: &[f64],
    values: &[f64],
    title: &str,
    grid_label: &str,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if values.is_empty() || grid.len() != values.len() {
        return Err("Profile needs one value per grid point".into());
    }

    let width = width.unwrap_or(120);
    let height = height.unwrap_or(40);

    let max_abs = values.iter().fold(0.0_f64, |a, &b| a.max(b.abs()));
    let (scale, unit) = determine_scale(max_abs);
    let frame: Vec<(f32, f32)> = grid
        .iter()
        .zip(values)
        .map(|(&x, &v)| (x as f32, (v * scale) as f32))
        .collect();

    let (x_min, x_max) = span(grid);
    println!("{title}");
    println!("X-axis: {grid_label} | Y-axis: {unit}A");
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min, x_max.max(x_min + f32::EPSILON))
        .lineplot(&Shape::Steps(&frame))
        .nice();

    Ok(())
}

/// Phase-space view of a record: grid points above 10 % of the peak with
/// the matched 4·ε_rms ellipse overlaid
pub fn plot_phase_space(
    record: &ScanRecord,
    twiss: &TwissResult,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let width = width.unwrap_or(120);
    let height = height.unwrap_or(60);

    let cloud = intensity_cloud(&record.current, &record.positions, &record.momenta, 0.1);
    let ellipse = ellipse_mm_mrad(twiss, 100);
    if cloud.is_empty() && ellipse.is_empty() {
        return Err("Nothing to plot".into());
    }

    let plane = record.plane().label().to_lowercase();
    let (grid_min, grid_max) = span(&record.positions);
    let ellipse_min = ellipse.iter().fold(f32::INFINITY, |a, p| a.min(p.0));
    let ellipse_max = ellipse.iter().fold(f32::NEG_INFINITY, |a, p| a.max(p.0));
    let x_min = grid_min.min(ellipse_min);
    let x_max = grid_max.max(ellipse_max);

    println!(
        "{} {}-Axis Emittance Scan",
        record.beam_line().label(),
        record.plane().label()
    );
    println!("X-axis: {plane} [mm] | Y-axis: {plane}' [mrad]");
    println!(
        "ε = 4·ε_rms = {:.4} mm mrad",
        twiss.emittance_mm_mrad()
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min, x_max.max(x_min + f32::EPSILON))
        .lineplot(&Shape::Points(&cloud))
        .lineplot(&Shape::Lines(&ellipse))
        .nice();

    Ok(())
}

/// Operator summary of a Twiss set: β in mm/mrad, γ in mrad/mm
pub fn twiss_summary(twiss: &TwissResult) -> String {
    format!(
        "RMS emittance (4·ε_rms): {:.4} mm mrad\nTwiss α: {:.4}\nTwiss β: {:.4} mm/mrad\nTwiss γ: {:.4} mrad/mm",
        twiss.emittance_mm_mrad(),
        twiss.alpha,
        twiss.beta,
        twiss.gamma
    )
}

//! Diagnostic plots for trained networks
//!
//! Simulated data is drawn in blue and network output in red.

use std::{error::Error, path::Path};

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    element::{Circle, PathElement, Rectangle},
    prelude::{BitMapBackend, IntoDrawingArea},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, WHITE},
};

use crate::{infer::LikelihoodCurve, simulator::SimulationOutput, trainer::TrainingHistory};

const N_BINS: usize = 100;

/// One histogram bar over `[left, right)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBin {
    pub left: f32,
    pub right: f32,
    pub density: f32,
}

/// Histogram normalized so that bar areas sum to the share of `values` inside `range`
pub fn density_histogram(values: &[f32], range: (f32, f32), n_bins: usize) -> Vec<HistogramBin> {
    let (low, high) = range;
    if n_bins == 0 || high <= low {
        return Vec::new();
    }
    let width = (high - low) / n_bins as f32;
    let mut counts = vec![0usize; n_bins];
    for v in values {
        if *v >= low && *v <= high {
            let idx = (((v - low) / width) as usize).min(n_bins - 1);
            counts[idx] += 1;
        }
    }
    let norm = values.len().max(1) as f32 * width;
    counts
        .iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            left: low + i as f32 * width,
            right: low + (i + 1) as f32 * width,
            density: *count as f32 / norm,
        })
        .collect()
}

/// Overlays the network likelihood on a density histogram of choice-signed simulated
/// reaction times. The likelihood of choice `-1` is mirrored onto negative rts.
pub fn plot_likelihood_comparison(
    simulations: &SimulationOutput,
    curve: &LikelihoodCurve,
    file_name: &Path,
    title: &str,
) -> Result<(), Box<dyn Error>> {
    let signed_rts = simulations.signed_rts();
    let x_max = signed_rts
        .iter()
        .map(|rt| rt.abs())
        .chain(curve.rts.iter().copied())
        .filter(|rt| rt.is_finite())
        .fold(0.0f32, f32::max)
        .max(f32::EPSILON);
    let bins = density_histogram(&signed_rts, (-x_max, x_max), N_BINS);

    let upper: Vec<(f32, f32)> = curve
        .rts
        .iter()
        .zip(curve.upper.iter())
        .filter(|(_, l)| l.is_finite())
        .map(|(rt, l)| (*rt, *l))
        .collect();
    let lower: Vec<(f32, f32)> = curve
        .rts
        .iter()
        .zip(curve.lower.iter())
        .filter(|(_, l)| l.is_finite())
        .map(|(rt, l)| (-rt, *l))
        .collect();
    let y_max = bins
        .iter()
        .map(|b| b.density)
        .chain(upper.iter().chain(lower.iter()).map(|(_, l)| *l))
        .fold(0.0f32, f32::max)
        .max(f32::EPSILON)
        * 1.1;

    let root_area = BitMapBackend::new(file_name, (800, 600)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption(title, ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-x_max..x_max, 0.0f32..y_max)?;

    chart
        .configure_mesh()
        .x_desc("rt * choice")
        .y_desc("likelihood")
        .draw()?;

    chart
        .draw_series(bins.iter().map(|b| {
            Rectangle::new([(b.left, 0.0), (b.right, b.density)], BLUE.mix(0.3).filled())
        }))?
        .label("simulations")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 20, y + 5)], BLUE.mix(0.3).filled()));

    chart
        .draw_series(LineSeries::new(upper, RED.stroke_width(2)))?
        .label("network")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED.stroke_width(2)));
    chart.draw_series(LineSeries::new(lower, RED.stroke_width(2)))?;

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Likelihood comparison plot saved to '{}'.", file_name.display());
    Ok(())
}

/// Validation loss per epoch
pub fn plot_training_history(
    history: &TrainingHistory,
    file_name: &Path,
) -> Result<(), Box<dyn Error>> {
    let losses: Vec<(f32, f32)> = history
        .val_loss
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(epoch, l)| (epoch as f32, *l))
        .collect();
    let (y_min, y_max) = losses
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (_, l)| {
            (lo.min(*l), hi.max(*l))
        });
    let (y_min, y_max) = if losses.is_empty() {
        (0.0, 1.0)
    } else {
        let pad = ((y_max - y_min) * 0.1).max(1e-6);
        (y_min - pad, y_max + pad)
    };
    let x_max = (history.val_loss.len().max(2) - 1) as f32;

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Validation loss", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0f32..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("loss")
        .draw()?;

    chart.draw_series(LineSeries::new(losses.iter().copied(), &RED))?;
    chart.draw_series(
        losses
            .iter()
            .map(|(x, y)| Circle::new((*x, *y), 3, RED.filled())),
    )?;

    root_area.present()?;
    log::info!("Training history plot saved to '{}'.", file_name.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_integrates_to_one() {
        let values: Vec<f32> = (0..1000).map(|i| (i as f32 / 999.0) * 4.0 - 2.0).collect();
        let bins = density_histogram(&values, (-2.0, 2.0), 40);
        assert_eq!(bins.len(), 40);
        let area: f32 = bins.iter().map(|b| b.density * (b.right - b.left)).sum();
        assert!((area - 1.0).abs() < 1e-4, "area = {}", area);
        // the upper edge falls into the last bin
        assert!(bins[39].density > 0.0);
    }

    #[test]
    fn test_histogram_outside_range() {
        let bins = density_histogram(&[0.5, 0.5, 10.0, -10.0], (0.0, 1.0), 2);
        // half of the values are outside, so half of the mass is missing
        assert_eq!(bins[0].density, 0.0);
        assert_eq!(bins[1].density, 2.0 / (4.0 * 0.5));
        assert!(density_histogram(&[1.0], (1.0, 1.0), 10).is_empty());
    }
}

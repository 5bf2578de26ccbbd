use crate::aggregate::AnnualSummary;
use crate::error::{AppError, Result};
use plotters::prelude::*;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const CHART_SIZE: (u32, u32) = (1000, 500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartStatus {
    Written,
    AlreadyExists,
    NoData,
}

fn chart_err<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Chart(e.to_string())
}

fn prepare(path: &Path) -> Result<Option<ChartStatus>> {
    if path.exists() {
        info!("Chart {} already exists, skipping", path.display());
        return Ok(Some(ChartStatus::AlreadyExists));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(None)
}

fn year_bounds(points: &[(i32, f64)]) -> (i32, i32) {
    let min = points.iter().map(|(y, _)| *y).min().unwrap_or(0);
    let max = points.iter().map(|(y, _)| *y).max().unwrap_or(0);
    (min, max + 1)
}

/// Pad a value range so flat or single-point series still get an axis
fn padded(lo: f64, hi: f64) -> (f64, f64) {
    let pad = ((hi - lo) * 0.1).max(0.5);
    (lo - pad, hi + pad)
}

/// Line chart of annual average temperature
pub fn render_temperature_chart(path: &Path, annual: &[AnnualSummary]) -> Result<ChartStatus> {
    if let Some(status) = prepare(path)? {
        return Ok(status);
    }

    let points: Vec<(i32, f64)> = annual
        .iter()
        .filter_map(|a| a.avg_temp.map(|t| (a.year, t)))
        .collect();

    if points.is_empty() {
        warn!("No annual temperatures to plot");
        return Ok(ChartStatus::NoData);
    }

    let (x_min, x_max) = year_bounds(&points);
    let lo = points.iter().map(|(_, t)| *t).fold(f64::INFINITY, f64::min);
    let hi = points.iter().map(|(_, t)| *t).fold(f64::NEG_INFINITY, f64::max);
    let (y_min, y_max) = padded(lo, hi);

    let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Average Annual Temperature in New York ({}-{})", x_min, x_max - 1),
            ("sans-serif", 22),
        )
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(chart_err)?;

    chart
        .configure_mesh()
        .x_desc("Year")
        .y_desc("Temperature (°C)")
        .draw()
        .map_err(chart_err)?;

    chart
        .draw_series(LineSeries::new(points.iter().copied(), &RED))
        .map_err(chart_err)?
        .label("Avg Temp (°C)")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(chart_err)?;

    root.present().map_err(chart_err)?;
    info!("Wrote temperature chart to {}", path.display());
    Ok(ChartStatus::Written)
}

/// Bar chart of annual total precipitation
pub fn render_precipitation_chart(path: &Path, annual: &[AnnualSummary]) -> Result<ChartStatus> {
    if let Some(status) = prepare(path)? {
        return Ok(status);
    }

    let points: Vec<(i32, f64)> = annual.iter().map(|a| (a.year, a.total_precip)).collect();

    if points.is_empty() {
        warn!("No annual precipitation to plot");
        return Ok(ChartStatus::NoData);
    }

    let (x_min, x_max) = year_bounds(&points);
    let hi = points.iter().map(|(_, p)| *p).fold(0.0, f64::max);
    let y_max = if hi > 0.0 { hi * 1.1 } else { 1.0 };

    let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(chart_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Total Annual Precipitation in New York (mm)", ("sans-serif", 22))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, 0.0..y_max)
        .map_err(chart_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("Year")
        .y_desc("Total Precipitation (mm)")
        .draw()
        .map_err(chart_err)?;

    chart
        .draw_series(points.iter().map(|(year, precip)| {
            let mut bar = Rectangle::new([(*year, 0.0), (*year + 1, *precip)], BLUE.filled());
            bar.set_margin(0, 0, 2, 2);
            bar
        }))
        .map_err(chart_err)?;

    root.present().map_err(chart_err)?;
    info!("Wrote precipitation chart to {}", path.display());
    Ok(ChartStatus::Written)
}

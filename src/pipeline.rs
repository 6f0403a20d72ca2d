use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use tracing::info;

use crate::aggregate::{aggregate_monthly, Reducer};
use crate::config::Config;
use crate::correlate::{pixel_correlation, series_correlation};
use crate::drought::{class_histogram, compute_seti, DroughtClass};
use crate::models::{AnnualStat, Diagnostics, MonthlyPoint, ZonalStat};
use crate::raster::{Grid, Raster, NO_DATA};
use crate::region::Region;
use crate::source::RasterSource;
use crate::stats::{annual_stats, mean_surface, monthly_timeseries, zonal_stats};
use crate::trend::{mann_kendall, mann_kendall_z, TrendVariant};

pub struct Inputs {
    pub national: Region,
    pub admin: Vec<Region>,
    pub et: Box<dyn RasterSource>,
    pub precipitation: Option<Box<dyn RasterSource>>,
}

/// Everything the exports need. The monthly rasters themselves are dropped
/// once reduced.
#[derive(Debug, Clone)]
pub struct Products {
    pub country: String,
    pub grid: Grid,
    pub first_month: NaiveDate,
    pub last_month: NaiveDate,
    pub month_count: usize,
    pub mean_et: Raster,
    pub trend: Raster,
    pub seti: Raster,
    pub drought_class: Raster,
    pub class_histogram: Vec<(DroughtClass, usize)>,
    pub correlation: Option<Raster>,
    pub national_correlation: Option<f64>,
    pub national_trend_z: Option<f64>,
    pub zonal: Vec<ZonalStat>,
    pub annual: Vec<AnnualStat>,
    pub monthly: Vec<MonthlyPoint>,
    pub diagnostics: Diagnostics,
}

pub fn run(config: &Config, inputs: &Inputs) -> anyhow::Result<Products> {
    let bounds = inputs
        .national
        .bounds()
        .ok_or_else(|| anyhow!("national boundary is empty"))?;
    let grid = Grid::covering(bounds, config.grid.resolution)
        .context("failed to derive analysis grid")?;
    info!(
        rows = grid.rows,
        cols = grid.cols,
        resolution = config.grid.resolution,
        "analysis grid ready"
    );

    let national_mask = inputs.national.mask(&grid);

    let et = aggregate_monthly(
        &*inputs.et,
        &grid,
        &national_mask,
        Reducer::Mean,
        config.sources.et.scale_factor,
    )
    .context("ET aggregation failed")?;
    let series = et.series;
    let mut diagnostics = Diagnostics {
        missing_months: et.missing,
        ..Diagnostics::default()
    };

    let seti = compute_seti(&series, &grid, &config.drought);
    diagnostics.degenerate_seti_pixels = seti.degenerate_pixels;
    let histogram = class_histogram(&seti.class);

    let variant = TrendVariant::from_symmetric(config.trend.symmetric);
    let rasters: Vec<&Raster> = series.iter().map(|f| &f.raster).collect();
    let trend = mann_kendall(&rasters, &grid, variant);
    diagnostics.trend_degenerate = series.len() < 2;

    let mean_et = mean_surface(&series, &grid);
    info!(valid_pixels = mean_et.valid_count(), "mean ET surface ready");
    let zonal = zonal_stats(&mean_et, &inputs.admin);
    diagnostics.empty_regions = zonal
        .iter()
        .filter(|stat| stat.mean.is_none())
        .map(|stat| stat.region.clone())
        .collect();

    let (annual, missing_years) = annual_stats(
        &series,
        &grid,
        &national_mask,
        config.period.start_year,
        config.period.end_year,
    );
    diagnostics.missing_years = missing_years;

    let monthly = monthly_timeseries(&series, &national_mask);
    let national_values: Vec<f32> = monthly
        .iter()
        .map(|point| point.mean_et.map_or(NO_DATA, |v| v as f32))
        .collect();
    let national_trend_z = mann_kendall_z(&national_values, variant);

    let (correlation, national_correlation) = match inputs.precipitation.as_deref() {
        Some(source) => {
            let precipitation = aggregate_monthly(
                source,
                &grid,
                &national_mask,
                Reducer::Sum,
                config
                    .sources
                    .precipitation
                    .as_ref()
                    .map_or(1.0, |p| p.scale_factor),
            )
            .context("precipitation aggregation failed")?;

            let surface = pixel_correlation(&series, &precipitation.series, &grid);
            let rain: BTreeMap<NaiveDate, Option<f64>> =
                monthly_timeseries(&precipitation.series, &national_mask)
                    .into_iter()
                    .map(|point| (point.date, point.mean_et))
                    .collect();
            let et_values: Vec<Option<f64>> = monthly.iter().map(|p| p.mean_et).collect();
            let rain_values: Vec<Option<f64>> = monthly
                .iter()
                .map(|p| rain.get(&p.date).copied().flatten())
                .collect();
            (Some(surface), series_correlation(&et_values, &rain_values))
        }
        None => {
            info!("no precipitation source configured, skipping correlation");
            (None, None)
        }
    };

    let (first_month, last_month) = match (series.first(), series.last()) {
        (Some(first), Some(last)) => (first.meta.time_start, last.meta.time_start),
        _ => return Err(anyhow!("ET aggregation produced no months")),
    };

    Ok(Products {
        country: inputs.national.name.clone(),
        grid,
        first_month,
        last_month,
        month_count: series.len(),
        mean_et,
        trend,
        seti: seti.anomaly,
        drought_class: seti.class,
        class_histogram: histogram,
        correlation,
        national_correlation,
        national_trend_z,
        zonal,
        annual,
        monthly,
        diagnostics,
    })
}

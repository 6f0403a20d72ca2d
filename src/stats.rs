use ndarray::{Array2, Zip};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::models::{AnnualStat, MonthlyFrame, MonthlyPoint, ZonalStat};
use crate::raster::{is_valid, Grid, PixelMoments, Raster};
use crate::region::Region;

/// Reduction of the valid pixels under a mask. Population standard
/// deviation; every field is `None` when no pixel contributes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn summarize(data: &Array2<f32>, mask: &Array2<bool>) -> Summary {
    let mut count = 0usize;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    Zip::from(data).and(mask).for_each(|&value, &inside| {
        if !inside || !is_valid(value) {
            return;
        }
        let value = value as f64;
        count += 1;
        let delta = value - mean;
        mean += delta / count as f64;
        m2 += delta * (value - mean);
        min = min.min(value);
        max = max.max(value);
    });

    if count == 0 {
        return Summary::default();
    }

    Summary {
        count,
        mean: Some(mean),
        std_dev: Some((m2 / count as f64).sqrt()),
        min: Some(min),
        max: Some(max),
    }
}

/// Per-pixel mean of every month in the series.
pub fn mean_surface(series: &[MonthlyFrame], grid: &Grid) -> Raster {
    PixelMoments::from_rasters(grid, series.iter().map(|f| &f.raster)).mean_raster(grid)
}

/// Mean and standard deviation of `surface` within each region. Regions
/// that cover no valid pixel are reported with empty statistics.
pub fn zonal_stats(surface: &Raster, regions: &[Region]) -> Vec<ZonalStat> {
    regions
        .par_iter()
        .map(|region| {
            let summary = summarize(&surface.data, &region.mask(&surface.grid));
            if summary.count == 0 {
                warn!(region = %region.name, "region covers no valid pixels");
            } else {
                debug!(region = %region.name, pixels = summary.count, "zonal statistics reduced");
            }
            ZonalStat {
                region: region.name.clone(),
                mean: summary.mean,
                std_dev: summary.std_dev,
            }
        })
        .collect()
}

/// For each year in `[start_year, end_year]`, averages that year's monthly
/// frames and reduces the average over `mask`. Returns the table and the
/// years with no valid pixel inside `mask`.
pub fn annual_stats(
    series: &[MonthlyFrame],
    grid: &Grid,
    mask: &Array2<bool>,
    start_year: i32,
    end_year: i32,
) -> (Vec<AnnualStat>, Vec<i32>) {
    let mut table = Vec::new();
    let mut missing = Vec::new();

    for year in start_year..=end_year {
        let frames: Vec<&Raster> = series
            .iter()
            .filter(|f| f.meta.year == year)
            .map(|f| &f.raster)
            .collect();

        let summary = if frames.is_empty() {
            Summary::default()
        } else {
            let average = PixelMoments::from_rasters(grid, frames).mean_raster(grid);
            summarize(&average.data, mask)
        };
        if summary.count == 0 {
            warn!(year, "no ET data for year, statistics are no-data");
            missing.push(year);
        }

        table.push(AnnualStat {
            year,
            mean: summary.mean,
            std_dev: summary.std_dev,
            min: summary.min,
            max: summary.max,
        });
    }

    (table, missing)
}

/// National mean of each monthly frame.
pub fn monthly_timeseries(series: &[MonthlyFrame], mask: &Array2<bool>) -> Vec<MonthlyPoint> {
    series
        .iter()
        .map(|frame| MonthlyPoint {
            date: frame.meta.time_start,
            mean_et: summarize(&frame.raster.data, mask).mean,
            month: frame.meta.month,
            year: frame.meta.year,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FrameMeta;
    use crate::region::tests::square;
    use chrono::NaiveDate;
    use ndarray::array;

    fn grid() -> Grid {
        Grid::new(0.0, 20.0, 10.0, 10.0, 4, 2).unwrap()
    }

    fn monthly(year: i32, month: u32, raster: Raster) -> MonthlyFrame {
        MonthlyFrame {
            meta: FrameMeta::from_month_start(NaiveDate::from_ymd_opt(year, month, 1).unwrap()),
            raster,
            contributing: 1,
        }
    }

    #[test]
    fn summary_uses_population_std_dev() {
        let data = array![[2.0, 4.0], [4.0, 4.0]];
        let mask = array![[true, true], [true, true]];
        let summary = summarize(&data, &mask);
        assert_eq!(summary.count, 4);
        assert!((summary.mean.unwrap() - 3.5).abs() < 1e-12);
        assert!((summary.std_dev.unwrap() - 0.75f64.sqrt()).abs() < 1e-12);
        assert_eq!(summary.min, Some(2.0));
        assert_eq!(summary.max, Some(4.0));
    }

    #[test]
    fn empty_mask_gives_empty_summary() {
        let data = array![[1.0, 2.0]];
        let mask = array![[false, false]];
        assert_eq!(summarize(&data, &mask), Summary::default());
    }

    #[test]
    fn constant_series_gives_constant_zonal_stats() {
        let g = grid();
        let series: Vec<MonthlyFrame> = (0..24)
            .map(|i| monthly(2001 + i / 12, (i % 12) as u32 + 1, Raster::filled(g, 5.0)))
            .collect();
        let regions = vec![square("North", 0.0, 0.0, 20.0), square("South", 20.0, 0.0, 20.0)];

        let surface = mean_surface(&series, &g);
        let stats = zonal_stats(&surface, &regions);
        assert_eq!(stats.len(), 2);
        for stat in stats {
            assert_eq!(stat.mean, Some(5.0));
            assert_eq!(stat.std_dev, Some(0.0));
        }
    }

    #[test]
    fn region_outside_grid_has_empty_stats() {
        let surface = Raster::filled(grid(), 1.0);
        let stats = zonal_stats(&surface, &[square("Offshore", 500.0, 500.0, 10.0)]);
        assert_eq!(stats[0].mean, None);
        assert_eq!(stats[0].std_dev, None);
    }

    #[test]
    fn annual_stats_average_months_then_reduce() {
        let g = grid();
        let mask = Array2::from_elem(g.shape(), true);
        let series = vec![
            monthly(2001, 1, Raster::filled(g, 2.0)),
            monthly(2001, 2, Raster::filled(g, 4.0)),
            monthly(2003, 1, Raster::filled(g, 1.0)),
        ];

        let (table, missing) = annual_stats(&series, &g, &mask, 2001, 2003);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].year, 2001);
        assert_eq!(table[0].mean, Some(3.0));
        assert_eq!(table[0].min, Some(3.0));
        assert_eq!(table[0].max, Some(3.0));
        assert_eq!(table[1].mean, None);
        assert_eq!(table[1].std_dev, None);
        assert_eq!(missing, vec![2002]);
        assert_eq!(table[2].mean, Some(1.0));
    }

    #[test]
    fn year_with_only_empty_frames_is_missing() {
        let g = grid();
        let mask = Array2::from_elem(g.shape(), true);
        let series = vec![
            monthly(2001, 1, Raster::filled(g, 2.0)),
            monthly(2002, 1, Raster::empty(g)),
            monthly(2002, 2, Raster::empty(g)),
        ];

        let (table, missing) = annual_stats(&series, &g, &mask, 2001, 2002);
        assert_eq!(table[1].mean, None);
        assert_eq!(table[1].max, None);
        assert_eq!(missing, vec![2002]);
    }

    #[test]
    fn timeseries_reports_national_mean_per_month() {
        let g = grid();
        let mask = Array2::from_elem(g.shape(), true);
        let series = vec![
            monthly(2010, 6, Raster::filled(g, 1.5)),
            monthly(2010, 7, Raster::empty(g)),
        ];

        let points = monthly_timeseries(&series, &mask);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2010, 6, 1).unwrap());
        assert_eq!(points[0].mean_et, Some(1.5));
        assert_eq!(points[0].month, 6);
        assert_eq!(points[0].year, 2010);
        assert_eq!(points[1].mean_et, None);
    }
}

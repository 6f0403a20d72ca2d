use std::collections::BTreeMap;

use anyhow::bail;
use chrono::{Datelike, Months, NaiveDate};
use ndarray::{Array2, Zip};
use tracing::{debug, info, warn};

use crate::models::{FrameMeta, MonthlyFrame};
use crate::raster::{is_valid, Grid, Raster, NO_DATA};
use crate::source::{RasterSource, SourceEntry};

/// How raw frames within a month are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    Mean,
    Sum,
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First-of-month bounds of the observed dates.
pub fn month_range(dates: impl IntoIterator<Item = NaiveDate>) -> Option<(NaiveDate, NaiveDate)> {
    let mut dates = dates.into_iter();
    let first = dates.next()?;
    let (min, max) = dates.fold((first, first), |(min, max), d| (min.min(d), max.max(d)));
    Some((month_start(min), month_start(max)))
}

/// Every month start in `[start, end]`.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let mut current = month_start(start);
    while current <= end {
        months.push(current);
        match current.checked_add_months(Months::new(1)) {
            Some(next) => current = next,
            None => break,
        }
    }
    months
}

/// Monthly series plus the months that had no raw frames.
#[derive(Debug, Clone)]
pub struct MonthlyAggregation {
    pub series: Vec<MonthlyFrame>,
    pub missing: Vec<NaiveDate>,
}

/// Streams raw frames month by month into one frame per calendar month
/// between the first and last observation. Months without raw frames are
/// kept as all-no-data frames.
pub fn aggregate_monthly(
    source: &dyn RasterSource,
    grid: &Grid,
    clip: &Array2<bool>,
    reducer: Reducer,
    scale: f32,
) -> anyhow::Result<MonthlyAggregation> {
    let Some((start, end)) = month_range(source.entries().iter().map(|e| e.date)) else {
        bail!("source '{}' has no rasters", source.name());
    };

    let mut by_month: BTreeMap<NaiveDate, Vec<&SourceEntry>> = BTreeMap::new();
    for entry in source.entries() {
        by_month.entry(month_start(entry.date)).or_default().push(entry);
    }

    let months = months_between(start, end);
    info!(
        source = source.name(),
        from = %start,
        to = %end,
        months = months.len(),
        rasters = source.entries().len(),
        "aggregating monthly frames"
    );

    let mut series = Vec::with_capacity(months.len());
    let mut missing = Vec::new();

    for month in months {
        let entries = by_month.remove(&month).unwrap_or_default();
        if entries.is_empty() {
            warn!(source = source.name(), month = %month, "no rasters for month, frame is no-data");
            missing.push(month);
        }

        let mut sum = Array2::<f64>::zeros(grid.shape());
        let mut count = Array2::<u32>::zeros(grid.shape());
        for entry in &entries {
            let raster = source.load(entry, grid)?;
            accumulate(&mut sum, &mut count, &raster);
        }
        debug!(source = source.name(), month = %month, rasters = entries.len(), "month reduced");

        let raster = Raster {
            grid: *grid,
            data: finish(&sum, &count, reducer, scale),
        }
        .clip(clip)?;
        series.push(MonthlyFrame {
            meta: FrameMeta::from_month_start(month),
            raster,
            contributing: entries.len(),
        });
    }

    Ok(MonthlyAggregation { series, missing })
}

fn accumulate(sum: &mut Array2<f64>, count: &mut Array2<u32>, raster: &Raster) {
    Zip::from(sum)
        .and(count)
        .and(&raster.data)
        .par_for_each(|sum, count, &value| {
            if is_valid(value) {
                *sum += value as f64;
                *count += 1;
            }
        });
}

fn finish(
    sum: &Array2<f64>,
    count: &Array2<u32>,
    reducer: Reducer,
    scale: f32,
) -> Array2<f32> {
    let mut data = Array2::from_elem(sum.dim(), NO_DATA);
    Zip::from(&mut data)
        .and(sum)
        .and(count)
        .par_for_each(|out, &sum, &count| {
            if count == 0 {
                return;
            }
            let reduced = match reducer {
                Reducer::Mean => sum / count as f64,
                Reducer::Sum => sum,
            };
            *out = (reduced * scale as f64) as f32;
        });
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::MemorySource;
    use ndarray::array;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn grid() -> Grid {
        Grid::new(0.0, 10.0, 10.0, 10.0, 2, 1).unwrap()
    }

    fn all_inside() -> Array2<bool> {
        Array2::from_elem((1, 2), true)
    }

    #[test]
    fn range_spans_first_to_last_observed_month() {
        let range = month_range([date(2003, 5, 17), date(2001, 2, 9), date(2002, 12, 31)]);
        assert_eq!(range, Some((date(2001, 2, 1), date(2003, 5, 1))));
        assert_eq!(month_range(std::iter::empty()), None);
    }

    #[test]
    fn months_between_crosses_year_boundary() {
        let months = months_between(date(2000, 11, 1), date(2001, 2, 1));
        assert_eq!(
            months,
            vec![date(2000, 11, 1), date(2000, 12, 1), date(2001, 1, 1), date(2001, 2, 1)]
        );
    }

    #[test]
    fn identical_frames_average_to_scaled_value() {
        let g = grid();
        let frames = [1, 9, 17, 25]
            .into_iter()
            .map(|d| (date(2001, 1, d), Raster::filled(g, 400.0)))
            .collect();
        let source = MemorySource::new(frames);

        let result = aggregate_monthly(&source, &g, &all_inside(), Reducer::Mean, 0.0125).unwrap();
        assert_eq!(result.series.len(), 1);
        let frame = &result.series[0];
        assert_eq!(frame.contributing, 4);
        assert_eq!(frame.meta.year, 2001);
        assert_eq!(frame.meta.month, 1);
        assert!(frame.raster.data.iter().all(|v| (*v - 5.0).abs() < 1e-6));
    }

    #[test]
    fn sum_reducer_totals_daily_values() {
        let g = grid();
        let frames = (1..=31)
            .map(|d| (date(2001, 3, d), Raster::filled(g, 2.0)))
            .collect();
        let source = MemorySource::new(frames);

        let result = aggregate_monthly(&source, &g, &all_inside(), Reducer::Sum, 1.0).unwrap();
        assert_eq!(result.series[0].raster.data[[0, 0]], 62.0);
    }

    #[test]
    fn empty_month_is_kept_as_no_data() {
        let g = grid();
        let source = MemorySource::new(vec![
            (date(2001, 1, 1), Raster::filled(g, 1.0)),
            (date(2001, 3, 1), Raster::filled(g, 3.0)),
        ]);

        let result = aggregate_monthly(&source, &g, &all_inside(), Reducer::Mean, 1.0).unwrap();
        assert_eq!(result.series.len(), 3);
        assert_eq!(result.missing, vec![date(2001, 2, 1)]);
        let february = &result.series[1];
        assert_eq!(february.contributing, 0);
        assert!(february.raster.data.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn no_data_pixels_do_not_dilute_the_mean() {
        let g = grid();
        let source = MemorySource::new(vec![
            (date(2001, 1, 1), Raster::new(g, array![[2.0, NO_DATA]]).unwrap()),
            (date(2001, 1, 9), Raster::new(g, array![[4.0, 6.0]]).unwrap()),
        ]);
        let clip = array![[true, true]];

        let result = aggregate_monthly(&source, &g, &clip, Reducer::Mean, 1.0).unwrap();
        assert_eq!(result.series[0].raster.data, array![[3.0, 6.0]]);
    }

    #[test]
    fn pixels_outside_clip_are_no_data() {
        let g = grid();
        let source = MemorySource::new(vec![(date(2001, 1, 1), Raster::filled(g, 2.0))]);
        let clip = array![[true, false]];

        let result = aggregate_monthly(&source, &g, &clip, Reducer::Mean, 1.0).unwrap();
        assert_eq!(result.series[0].raster.data[[0, 0]], 2.0);
        assert!(result.series[0].raster.data[[0, 1]].is_nan());
    }
}

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ndarray::{Array2, Zip};
use tracing::info;

use crate::models::MonthlyFrame;
use crate::raster::{is_valid, Grid, Raster, NO_DATA};

const MIN_PAIRS: u32 = 3;

/// Running centred moments for a Pearson coefficient. A constant side keeps
/// its second moment at exactly zero.
#[derive(Debug, Clone, Copy, Default)]
struct PairSums {
    n: u32,
    mean_x: f64,
    mean_y: f64,
    m2_x: f64,
    m2_y: f64,
    co_moment: f64,
}

impl PairSums {
    fn push(&mut self, x: f64, y: f64) {
        self.n += 1;
        let n = self.n as f64;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / n;
        self.mean_y += dy / n;
        self.m2_x += dx * (x - self.mean_x);
        self.m2_y += dy * (y - self.mean_y);
        self.co_moment += dx * (y - self.mean_y);
    }

    fn pearson(&self) -> Option<f64> {
        if self.n < MIN_PAIRS || self.m2_x <= 0.0 || self.m2_y <= 0.0 {
            return None;
        }
        Some((self.co_moment / (self.m2_x * self.m2_y).sqrt()).clamp(-1.0, 1.0))
    }
}

/// Per-pixel Pearson r between two monthly series, over the months both
/// contain. Fewer than three valid pairs or zero variance give no-data.
pub fn pixel_correlation(et: &[MonthlyFrame], precipitation: &[MonthlyFrame], grid: &Grid) -> Raster {
    let by_month: BTreeMap<NaiveDate, &Raster> = precipitation
        .iter()
        .map(|frame| (frame.meta.time_start, &frame.raster))
        .collect();

    let mut sums = Array2::from_elem(grid.shape(), PairSums::default());
    let mut paired_months = 0usize;
    for frame in et {
        let Some(other) = by_month.get(&frame.meta.time_start) else {
            continue;
        };
        paired_months += 1;
        Zip::from(&mut sums)
            .and(&frame.raster.data)
            .and(&other.data)
            .par_for_each(|sums, &x, &y| {
                if is_valid(x) && is_valid(y) {
                    sums.push(x as f64, y as f64);
                }
            });
    }

    let data = sums.mapv(|sums| sums.pearson().map_or(NO_DATA, |r| r as f32));
    info!(months = paired_months, "ET/precipitation correlation computed");
    Raster { grid: *grid, data }
}

/// Pearson r of two equally long series, skipping pairs with a missing side.
pub fn series_correlation(a: &[Option<f64>], b: &[Option<f64>]) -> Option<f64> {
    let mut sums = PairSums::default();
    for (x, y) in a.iter().zip(b) {
        if let (Some(x), Some(y)) = (x, y) {
            sums.push(*x, *y);
        }
    }
    sums.pearson()
}

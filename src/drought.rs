use ndarray::{Array2, Zip};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DroughtThresholds;
use crate::models::MonthlyFrame;
use crate::raster::{is_valid, Grid, PixelMoments, Raster, NO_DATA};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DroughtClass {
    Extreme = 1,
    Severe = 2,
    Moderate = 3,
    NoDrought = 4,
}

impl DroughtClass {
    pub const ALL: [DroughtClass; 4] = [
        DroughtClass::Extreme,
        DroughtClass::Severe,
        DroughtClass::Moderate,
        DroughtClass::NoDrought,
    ];

    /// First class whose threshold the anomaly is at or below; `None` for
    /// a no-data anomaly.
    pub fn classify(anomaly: f32, thresholds: &DroughtThresholds) -> Option<DroughtClass> {
        if !is_valid(anomaly) {
            return None;
        }
        Some(if anomaly <= thresholds.extreme {
            DroughtClass::Extreme
        } else if anomaly <= thresholds.severe {
            DroughtClass::Severe
        } else if anomaly <= thresholds.moderate {
            DroughtClass::Moderate
        } else {
            DroughtClass::NoDrought
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: f32) -> Option<DroughtClass> {
        DroughtClass::ALL
            .into_iter()
            .find(|class| class.code() as f32 == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            DroughtClass::Extreme => "extreme",
            DroughtClass::Severe => "severe",
            DroughtClass::Moderate => "moderate",
            DroughtClass::NoDrought => "none",
        }
    }
}

/// Standardized anomaly and drought class for one month. The class band
/// holds the numeric class code.
#[derive(Debug, Clone)]
pub struct SetiFrame {
    pub anomaly: Raster,
    pub class: Raster,
}

#[derive(Debug, Clone)]
pub struct SetiResult {
    /// Latest valid anomaly per pixel.
    pub anomaly: Raster,
    /// Drought class code of that anomaly.
    pub class: Raster,
    /// Pixels with data but zero variance over the period.
    pub degenerate_pixels: usize,
}

/// Standardizes every frame against the per-pixel mean and standard
/// deviation of the whole series and folds it into the mosaic, so only one
/// standardized frame exists at a time.
pub fn compute_seti(
    series: &[MonthlyFrame],
    grid: &Grid,
    thresholds: &DroughtThresholds,
) -> SetiResult {
    let (mean, std_dev) = seti_moments(series, grid);

    let degenerate_pixels = std_dev.data.iter().filter(|s| **s == 0.0).count();
    if degenerate_pixels > 0 {
        warn!(
            pixels = degenerate_pixels,
            "zero ET variance over the period, SETI is no-data for these pixels"
        );
    }

    let mut mosaic = Mosaic::new(grid);
    for frame in series {
        mosaic.add(&standardize(frame, &mean, &std_dev, thresholds));
    }
    let (anomaly, class) = mosaic.finish();

    info!(months = series.len(), "SETI computed");

    SetiResult {
        anomaly,
        class,
        degenerate_pixels,
    }
}

/// Per-pixel `(mean, population std)` over the whole series.
pub fn seti_moments(series: &[MonthlyFrame], grid: &Grid) -> (Raster, Raster) {
    let moments = PixelMoments::from_rasters(grid, series.iter().map(|f| &f.raster));
    (moments.mean_raster(grid), moments.std_dev_raster(grid))
}

pub fn standardize(
    frame: &MonthlyFrame,
    mean: &Raster,
    std_dev: &Raster,
    thresholds: &DroughtThresholds,
) -> SetiFrame {
    let grid = frame.raster.grid;
    let mut anomaly = Array2::from_elem(grid.shape(), NO_DATA);
    let mut class = Array2::from_elem(grid.shape(), NO_DATA);

    Zip::from(&mut anomaly)
        .and(&mut class)
        .and(&frame.raster.data)
        .and(&mean.data)
        .and(&std_dev.data)
        .par_for_each(|anomaly, class, &value, &mean, &std_dev| {
            if !is_valid(value) || !is_valid(std_dev) || std_dev == 0.0 {
                return;
            }
            let z = (value - mean) / std_dev;
            *anomaly = z;
            if let Some(c) = DroughtClass::classify(z, thresholds) {
                *class = c.code() as f32;
            }
        });

    SetiFrame {
        anomaly: Raster { grid, data: anomaly },
        class: Raster { grid, data: class },
    }
}

/// Composite of frames added in time order; for each pixel the last frame
/// with a valid anomaly wins.
#[derive(Debug, Clone)]
pub struct Mosaic {
    anomaly: Raster,
    class: Raster,
}

impl Mosaic {
    pub fn new(grid: &Grid) -> Self {
        Self {
            anomaly: Raster::empty(*grid),
            class: Raster::empty(*grid),
        }
    }

    pub fn add(&mut self, frame: &SetiFrame) {
        Zip::from(&mut self.anomaly.data)
            .and(&mut self.class.data)
            .and(&frame.anomaly.data)
            .and(&frame.class.data)
            .par_for_each(|out_anomaly, out_class, &a, &c| {
                if is_valid(a) {
                    *out_anomaly = a;
                    *out_class = c;
                }
            });
    }

    /// Returns `(anomaly, class)`.
    pub fn finish(self) -> (Raster, Raster) {
        (self.anomaly, self.class)
    }
}

/// Pixel count per drought class, in class order.
pub fn class_histogram(class: &Raster) -> Vec<(DroughtClass, usize)> {
    let mut counts = [0usize; 4];
    for code in class.data.iter() {
        if let Some(class) = DroughtClass::from_code(*code) {
            counts[class.code() as usize - 1] += 1;
        }
    }
    DroughtClass::ALL.into_iter().zip(counts).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FrameMeta;
    use chrono::NaiveDate;
    use ndarray::array;

    fn grid() -> Grid {
        Grid::new(0.0, 10.0, 10.0, 10.0, 2, 1).unwrap()
    }

    fn series(values: &[[f32; 2]]) -> Vec<MonthlyFrame> {
        let g = grid();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MonthlyFrame {
                meta: FrameMeta::from_month_start(
                    NaiveDate::from_ymd_opt(2001 + (i / 12) as i32, (i % 12) as u32 + 1, 1)
                        .unwrap(),
                ),
                raster: Raster::new(g, array![[v[0], v[1]]]).unwrap(),
                contributing: 1,
            })
            .collect()
    }

    #[test]
    fn classification_boundaries_are_inclusive() {
        let t = DroughtThresholds::default();
        assert_eq!(DroughtClass::classify(-2.0, &t), Some(DroughtClass::Extreme));
        assert_eq!(DroughtClass::classify(-1.999, &t), Some(DroughtClass::Severe));
        assert_eq!(DroughtClass::classify(-1.5, &t), Some(DroughtClass::Severe));
        assert_eq!(DroughtClass::classify(-1.0, &t), Some(DroughtClass::Moderate));
        assert_eq!(DroughtClass::classify(-0.999, &t), Some(DroughtClass::NoDrought));
        assert_eq!(DroughtClass::classify(NO_DATA, &t), None);
    }

    #[test]
    fn custom_thresholds_change_classes() {
        let t = DroughtThresholds {
            extreme: -1.0,
            severe: -0.5,
            moderate: -0.25,
        };
        assert_eq!(DroughtClass::classify(-1.2, &t), Some(DroughtClass::Extreme));
        assert_eq!(DroughtClass::classify(-0.3, &t), Some(DroughtClass::Moderate));
    }

    #[test]
    fn anomalies_reconstruct_original_values() {
        let frames = series(&[[1.0, 10.0], [2.0, 14.0], [4.0, 9.0], [7.0, 11.5]]);
        let t = DroughtThresholds::default();
        let (mean, std_dev) = seti_moments(&frames, &grid());

        for frame in &frames {
            let seti = standardize(frame, &mean, &std_dev, &t);
            for col in 0..2 {
                let rebuilt =
                    seti.anomaly.data[[0, col]] * std_dev.data[[0, col]] + mean.data[[0, col]];
                assert!((rebuilt - frame.raster.data[[0, col]]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn constant_pixel_yields_no_data() {
        let frames = series(&[[5.0, 1.0], [5.0, 3.0]]);
        let result = compute_seti(&frames, &grid(), &DroughtThresholds::default());

        assert_eq!(result.degenerate_pixels, 1);
        assert!(result.anomaly.data[[0, 0]].is_nan());
        assert!(result.class.data[[0, 0]].is_nan());
        assert!(result.anomaly.data[[0, 1]].is_finite());
    }

    #[test]
    fn class_band_matches_anomaly() {
        // mean 0, population std 1 for the first pixel
        let frames = series(&[[-1.0, 0.0], [1.0, 0.0]]);
        let t = DroughtThresholds::default();
        let result = compute_seti(&frames, &grid(), &t);
        let (mean, std_dev) = seti_moments(&frames, &grid());
        let first = standardize(&frames[0], &mean, &std_dev, &t);
        assert_eq!(first.anomaly.data[[0, 0]], -1.0);
        assert_eq!(first.class.data[[0, 0]], DroughtClass::Moderate.code() as f32);
        // the mosaic holds the last month
        assert_eq!(result.anomaly.data[[0, 0]], 1.0);
        assert_eq!(result.class.data[[0, 0]], DroughtClass::NoDrought.code() as f32);
    }

    #[test]
    fn seti_mosaic_skips_trailing_gaps() {
        // a late month with no data leaves the earlier anomaly in place
        let frames = series(&[[1.0, 1.0], [3.0, 3.0], [NO_DATA, 2.0]]);
        let result = compute_seti(&frames, &grid(), &DroughtThresholds::default());
        assert_eq!(result.anomaly.data[[0, 0]], 1.0);
        assert_eq!(result.anomaly.data[[0, 1]], 0.0);
        assert_eq!(result.class.data[[0, 1]], DroughtClass::NoDrought.code() as f32);
    }

    #[test]
    fn mosaic_keeps_last_valid_pixel() {
        let g = grid();
        let frame = |a: [f32; 2], c: [f32; 2]| SetiFrame {
            anomaly: Raster::new(g, array![[a[0], a[1]]]).unwrap(),
            class: Raster::new(g, array![[c[0], c[1]]]).unwrap(),
        };
        let mut mosaic = Mosaic::new(&g);
        mosaic.add(&frame([-2.5, 0.5], [1.0, 4.0]));
        mosaic.add(&frame([-1.2, NO_DATA], [3.0, NO_DATA]));

        let (anomaly, class) = mosaic.finish();
        assert_eq!(anomaly.data, array![[-1.2, 0.5]]);
        assert_eq!(class.data, array![[3.0, 4.0]]);
        assert_eq!(
            class_histogram(&class),
            vec![
                (DroughtClass::Extreme, 0),
                (DroughtClass::Severe, 0),
                (DroughtClass::Moderate, 1),
                (DroughtClass::NoDrought, 1),
            ]
        );
    }
}

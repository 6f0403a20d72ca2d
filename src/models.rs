use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::raster::Raster;

/// Typed replacement for the `year`/`month`/`time_start` properties carried
/// by each monthly frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FrameMeta {
    pub year: i32,
    pub month: u32,
    pub time_start: NaiveDate,
}

impl FrameMeta {
    pub fn from_month_start(time_start: NaiveDate) -> Self {
        Self {
            year: time_start.year(),
            month: time_start.month(),
            time_start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonthlyFrame {
    pub meta: FrameMeta,
    pub raster: Raster,
    /// Raw frames averaged (or summed) into this one.
    pub contributing: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZonalStat {
    pub region: String,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnualStat {
    pub year: i32,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyPoint {
    pub date: NaiveDate,
    pub mean_et: Option<f64>,
    pub month: u32,
    pub year: i32,
}

/// Conditions that produce no-data instead of failing the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub missing_months: Vec<NaiveDate>,
    pub missing_years: Vec<i32>,
    pub degenerate_seti_pixels: usize,
    pub empty_regions: Vec<String>,
    pub trend_degenerate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub first_month: NaiveDate,
    pub last_month: NaiveDate,
    pub month_count: i32,
    pub region_count: i64,
}

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Run configuration, loaded from TOML. Every field has a default so an
/// empty file is a valid (if not very useful) configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub period: PeriodConfig,
    pub grid: GridConfig,
    pub drought: DroughtThresholds,
    pub trend: TrendConfig,
    pub sources: SourcesConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub start_year: i32,
    pub end_year: i32,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            start_year: 2001,
            end_year: 2023,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GridConfig {
    /// Pixel size in CRS units.
    pub resolution: f64,
    pub epsg: u16,
    /// Value written to exported rasters where a pixel has no data.
    pub nodata: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution: 500.0,
            epsg: 32636,
            nodata: -9999.0,
        }
    }
}

/// Upper bounds (inclusive) of the standardized anomaly for each drought
/// class, checked in extreme -> severe -> moderate order.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DroughtThresholds {
    pub extreme: f32,
    pub severe: f32,
    pub moderate: f32,
}

impl Default for DroughtThresholds {
    fn default() -> Self {
        Self {
            extreme: -2.0,
            severe: -1.5,
            moderate: -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Count discordant pairs and use the textbook variance instead of the
    /// concordant-only statistic.
    pub symmetric: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub country: String,
    pub national_boundary: PathBuf,
    pub admin_boundaries: PathBuf,
    pub region_name_property: String,
    pub et: RasterSourceConfig,
    pub precipitation: Option<RasterSourceConfig>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            country: "Sudan".to_string(),
            national_boundary: PathBuf::from("data/sudan.geojson"),
            admin_boundaries: PathBuf::from("data/sudan_admin1.geojson"),
            region_name_property: "ADM1_NAME".to_string(),
            et: RasterSourceConfig::default(),
            precipitation: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RasterSourceConfig {
    /// CSV manifest with `date,path` rows.
    pub manifest: PathBuf,
    pub scale_factor: f32,
    /// Raw values outside this inclusive range are treated as no-data.
    pub valid_range: Option<[f64; 2]>,
}

impl Default for RasterSourceConfig {
    fn default() -> Self {
        // 8-day MODIS ET composites: 0.1 mm per 8 days -> mm/day, fill values above 32700.
        Self {
            manifest: PathBuf::from("data/et_8day.csv"),
            scale_factor: 0.0125,
            valid_range: Some([-32767.0, 32700.0]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportConfig {
    pub out_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub resolution: Option<f64>,
    pub out_dir: Option<PathBuf>,
}

impl Config {
    /// Reads a TOML file; relative source paths are resolved against the
    /// file's directory. `None` yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Config::from_toml(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        Ok(config)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(year) = overrides.start_year {
            self.period.start_year = year;
        }
        if let Some(year) = overrides.end_year {
            self.period.end_year = year;
        }
        if let Some(resolution) = overrides.resolution {
            self.grid.resolution = resolution;
        }
        if let Some(out_dir) = overrides.out_dir {
            self.export.out_dir = out_dir;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.period.start_year > self.period.end_year {
            bail!(
                "start_year {} is after end_year {}",
                self.period.start_year,
                self.period.end_year
            );
        }

        if !(self.grid.resolution.is_finite() && self.grid.resolution > 0.0) {
            bail!("resolution must be positive, got {}", self.grid.resolution);
        }

        if !self.grid.nodata.is_finite() {
            bail!("nodata must be a finite number");
        }

        let t = &self.drought;
        if !(t.extreme < t.severe && t.severe < t.moderate) {
            bail!(
                "drought thresholds must satisfy extreme < severe < moderate, got {} / {} / {}",
                t.extreme,
                t.severe,
                t.moderate
            );
        }

        let mut sources = vec![("et", &self.sources.et)];
        if let Some(precipitation) = &self.sources.precipitation {
            sources.push(("precipitation", precipitation));
        }
        for (name, source) in sources {
            if !source.scale_factor.is_finite() || source.scale_factor == 0.0 {
                bail!("{name} scale_factor must be finite and non-zero");
            }
            if let Some([low, high]) = source.valid_range {
                if low > high {
                    bail!("{name} valid_range is inverted: [{low}, {high}]");
                }
            }
        }

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        resolve(&mut self.sources.national_boundary);
        resolve(&mut self.sources.admin_boundaries);
        resolve(&mut self.sources.et.manifest);
        if let Some(precipitation) = self.sources.precipitation.as_mut() {
            resolve(&mut precipitation.manifest);
        }
        resolve(&mut self.export.out_dir);
    }
}

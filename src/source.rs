use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::geotiff;
use crate::raster::{Grid, Raster};

/// One raw, time-stamped raster in a collection.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// A time-stamped raster collection that can deliver each frame on the
/// analysis grid.
pub trait RasterSource: Send + Sync {
    fn name(&self) -> &str;

    fn entries(&self) -> &[SourceEntry];

    fn load(&self, entry: &SourceEntry, grid: &Grid) -> anyhow::Result<Raster>;
}

/// GeoTIFF files listed in a `date,path` CSV manifest.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    name: String,
    entries: Vec<SourceEntry>,
    valid_range: Option<[f64; 2]>,
}

impl ManifestSource {
    pub fn from_manifest(
        name: &str,
        manifest: &Path,
        valid_range: Option<[f64; 2]>,
    ) -> anyhow::Result<Self> {
        let base = manifest.parent().unwrap_or_else(|| Path::new("."));
        let mut reader = csv::Reader::from_path(manifest)
            .with_context(|| format!("failed to open manifest {}", manifest.display()))?;

        let mut entries = Vec::new();
        for (line, result) in reader.deserialize::<SourceEntry>().enumerate() {
            let mut entry = result.with_context(|| {
                format!("{}: invalid row {}", manifest.display(), line + 2)
            })?;
            if entry.path.is_relative() {
                entry.path = base.join(&entry.path);
            }
            entries.push(entry);
        }

        if entries.is_empty() {
            bail!("manifest {} lists no rasters", manifest.display());
        }

        entries.sort_by_key(|entry| entry.date);

        Ok(Self {
            name: name.to_string(),
            entries,
            valid_range,
        })
    }
}

impl RasterSource for ManifestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    fn load(&self, entry: &SourceEntry, grid: &Grid) -> anyhow::Result<Raster> {
        let raw = geotiff::read_geotiff(&entry.path)
            .with_context(|| format!("failed to read {}", entry.path.display()))?;
        let raw = match self.valid_range {
            Some([low, high]) => raw.retain(|v| (low..=high).contains(&(v as f64))),
            None => raw,
        };
        Ok(raw.resample_nearest(grid))
    }
}

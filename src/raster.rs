use geo::Rect;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis, Zip};
use thiserror::Error;

/// In-memory marker for a pixel without data.
pub const NO_DATA: f32 = f32::NAN;

pub fn is_valid(value: f32) -> bool {
    value.is_finite()
}

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("{path}: missing georeferencing tag {tag}")]
    MissingGeoreference { path: String, tag: &'static str },
    #[error("{path}: unsupported sample layout {layout}")]
    UnsupportedLayout { path: String, layout: String },
    #[error("grid mismatch: expected {expected:?}, found {found:?}")]
    GridMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("invalid grid: {0}")]
    InvalidGrid(String),
}

/// North-up raster grid. The origin is the outer corner of the top-left
/// pixel; rows grow southward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub cols: usize,
    pub rows: usize,
}

impl Grid {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        pixel_width: f64,
        pixel_height: f64,
        cols: usize,
        rows: usize,
    ) -> Result<Self, RasterError> {
        if !(pixel_width > 0.0 && pixel_height > 0.0) {
            return Err(RasterError::InvalidGrid(format!(
                "pixel size must be positive, got {pixel_width} x {pixel_height}"
            )));
        }
        if cols == 0 || rows == 0 {
            return Err(RasterError::InvalidGrid(format!(
                "grid is empty ({rows} rows x {cols} cols)"
            )));
        }
        Ok(Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            cols,
            rows,
        })
    }

    /// Smallest grid of square `resolution` pixels, aligned to multiples of
    /// the resolution, that covers `bounds`.
    pub fn covering(bounds: Rect<f64>, resolution: f64) -> Result<Self, RasterError> {
        let min_x = (bounds.min().x / resolution).floor() * resolution;
        let min_y = (bounds.min().y / resolution).floor() * resolution;
        let max_x = (bounds.max().x / resolution).ceil() * resolution;
        let max_y = (bounds.max().y / resolution).ceil() * resolution;

        let cols = (((max_x - min_x) / resolution).round() as usize).max(1);
        let rows = (((max_y - min_y) / resolution).round() as usize).max(1);

        Grid::new(min_x, max_y, resolution, resolution, cols, rows)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Pixel containing `(x, y)`, if inside the grid.
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.pixel_width).floor();
        let row = ((self.origin_y - y) / self.pixel_height).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        (row < self.rows && col < self.cols).then_some((row, col))
    }

    pub fn bounds(&self) -> Rect<f64> {
        Rect::new(
            (self.origin_x, self.origin_y - self.rows as f64 * self.pixel_height),
            (self.origin_x + self.cols as f64 * self.pixel_width, self.origin_y),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Raster {
    pub grid: Grid,
    pub data: Array2<f32>,
}

impl Raster {
    pub fn new(grid: Grid, data: Array2<f32>) -> Result<Self, RasterError> {
        if data.dim() != grid.shape() {
            return Err(RasterError::GridMismatch {
                expected: grid.shape(),
                found: data.dim(),
            });
        }
        Ok(Self { grid, data })
    }

    pub fn filled(grid: Grid, value: f32) -> Self {
        Self {
            data: Array2::from_elem(grid.shape(), value),
            grid,
        }
    }

    pub fn empty(grid: Grid) -> Self {
        Self::filled(grid, NO_DATA)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| is_valid(**v)).count()
    }

    /// Samples this raster at every pixel centre of `target`.
    pub fn resample_nearest(&self, target: &Grid) -> Raster {
        if self.grid == *target {
            return self.clone();
        }

        let mut data = Array2::from_elem(target.shape(), NO_DATA);
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut line)| {
                for (col, out) in line.iter_mut().enumerate() {
                    let (x, y) = target.cell_center(row, col);
                    if let Some(index) = self.grid.locate(x, y) {
                        *out = self.data[index];
                    }
                }
            });

        Raster {
            grid: *target,
            data,
        }
    }

    /// Sets every pixel outside `mask` to no-data.
    pub fn clip(mut self, mask: &Array2<bool>) -> Result<Raster, RasterError> {
        if mask.dim() != self.grid.shape() {
            return Err(RasterError::GridMismatch {
                expected: self.grid.shape(),
                found: mask.dim(),
            });
        }
        Zip::from(&mut self.data).and(mask).par_for_each(|value, &inside| {
            if !inside {
                *value = NO_DATA;
            }
        });
        Ok(self)
    }

    /// Copy with no-data wherever `keep` rejects the value.
    pub fn retain(&self, keep: impl Fn(f32) -> bool) -> Raster {
        let data = self
            .data
            .mapv(|value| if is_valid(value) && keep(value) { value } else { NO_DATA });
        Raster {
            grid: self.grid,
            data,
        }
    }
}

/// Per-pixel mean and population standard deviation over a stack of
/// rasters, skipping no-data.
#[derive(Debug, Clone)]
pub struct PixelMoments {
    pub count: Array2<u32>,
    pub mean: Array2<f64>,
    m2: Array2<f64>,
}

impl PixelMoments {
    pub fn new(grid: &Grid) -> Self {
        Self {
            count: Array2::zeros(grid.shape()),
            mean: Array2::zeros(grid.shape()),
            m2: Array2::zeros(grid.shape()),
        }
    }

    pub fn from_rasters<'a>(grid: &Grid, rasters: impl IntoIterator<Item = &'a Raster>) -> Self {
        let mut moments = Self::new(grid);
        for raster in rasters {
            moments.push(raster);
        }
        moments
    }

    pub fn push(&mut self, raster: &Raster) {
        Zip::from(&mut self.count)
            .and(&mut self.mean)
            .and(&mut self.m2)
            .and(&raster.data)
            .par_for_each(|count, mean, m2, &value| {
                if !is_valid(value) {
                    return;
                }
                let value = value as f64;
                *count += 1;
                let delta = value - *mean;
                *mean += delta / *count as f64;
                *m2 += delta * (value - *mean);
            });
    }

    pub fn mean_raster(&self, grid: &Grid) -> Raster {
        let mut data = Array2::from_elem(grid.shape(), NO_DATA);
        Zip::from(&mut data)
            .and(&self.count)
            .and(&self.mean)
            .par_for_each(|out, &count, &mean| {
                if count > 0 {
                    *out = mean as f32;
                }
            });
        Raster { grid: *grid, data }
    }

    pub fn std_dev_raster(&self, grid: &Grid) -> Raster {
        let mut data = Array2::from_elem(grid.shape(), NO_DATA);
        Zip::from(&mut data)
            .and(&self.count)
            .and(&self.m2)
            .par_for_each(|out, &count, &m2| {
                if count > 0 {
                    *out = (m2 / count as f64).sqrt() as f32;
                }
            });
        Raster { grid: *grid, data }
    }
}

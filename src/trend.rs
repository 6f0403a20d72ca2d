use ndarray::{Array2, Zip};
use tracing::{info, warn};

use crate::raster::{is_valid, Grid, Raster, NO_DATA};

/// Which Mann-Kendall statistic to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrendVariant {
    /// Counts only later-greater pairs: `S = C - n(n-1)/4`, variance
    /// `n(n-1)(2n+5)/72`.
    #[default]
    ConcordantOnly,
    /// Textbook Kendall: `S = C - D`, variance `n(n-1)(2n+5)/18`.
    Symmetric,
}

impl TrendVariant {
    pub fn from_symmetric(symmetric: bool) -> Self {
        if symmetric {
            TrendVariant::Symmetric
        } else {
            TrendVariant::ConcordantOnly
        }
    }

    fn statistic(self, concordant: u32, discordant: u32, n: usize) -> f64 {
        let n = n as f64;
        match self {
            TrendVariant::ConcordantOnly => concordant as f64 - n * (n - 1.0) / 4.0,
            TrendVariant::Symmetric => concordant as f64 - discordant as f64,
        }
    }

    fn variance(self, n: usize) -> f64 {
        let n = n as f64;
        let base = n * (n - 1.0) * (2.0 * n + 5.0);
        match self {
            TrendVariant::ConcordantOnly => base / 72.0,
            TrendVariant::Symmetric => base / 18.0,
        }
    }
}

/// `S` for a single series. No-data members are skipped pairwise; `n` is
/// the full series length.
pub fn mann_kendall_s(values: &[f32], variant: TrendVariant) -> f64 {
    let (mut concordant, mut discordant) = (0u32, 0u32);
    for (i, &earlier) in values.iter().enumerate() {
        for &later in &values[i + 1..] {
            if !is_valid(earlier) || !is_valid(later) {
                continue;
            }
            if later > earlier {
                concordant += 1;
            } else if later < earlier {
                discordant += 1;
            }
        }
    }
    variant.statistic(concordant, discordant, values.len())
}

/// `Z` for a single series, `None` when fewer than two values or none of
/// them holds data.
pub fn mann_kendall_z(values: &[f32], variant: TrendVariant) -> Option<f64> {
    if values.len() < 2 || !values.iter().any(|v| is_valid(*v)) {
        return None;
    }
    Some(mann_kendall_s(values, variant) / variant.variance(values.len()).sqrt())
}

/// Per-pixel Z surface over a time-ordered stack. Each frame pair is
/// compared as whole arrays; pixels that never hold data stay no-data.
pub fn mann_kendall(series: &[&Raster], grid: &Grid, variant: TrendVariant) -> Raster {
    let n = series.len();
    if n < 2 {
        warn!(frames = n, "too few frames for a trend, surface is no-data");
        return Raster::empty(*grid);
    }

    let mut concordant = Array2::<u32>::zeros(grid.shape());
    let mut discordant = Array2::<u32>::zeros(grid.shape());
    let mut observed = Array2::from_elem(grid.shape(), false);

    for (i, earlier) in series.iter().enumerate() {
        Zip::from(&mut observed)
            .and(&earlier.data)
            .par_for_each(|seen, &v| *seen |= is_valid(v));

        for later in &series[i + 1..] {
            Zip::from(&mut concordant)
                .and(&mut discordant)
                .and(&earlier.data)
                .and(&later.data)
                .par_for_each(|c, d, &a, &b| {
                    if !is_valid(a) || !is_valid(b) {
                        return;
                    }
                    if b > a {
                        *c += 1;
                    } else if b < a {
                        *d += 1;
                    }
                });
        }
    }

    let sd = variant.variance(n).sqrt();
    let mut z = Array2::from_elem(grid.shape(), NO_DATA);
    Zip::from(&mut z)
        .and(&concordant)
        .and(&discordant)
        .and(&observed)
        .par_for_each(|z, &c, &d, &seen| {
            if seen {
                *z = (variant.statistic(c, d, n) / sd) as f32;
            }
        });

    info!(frames = n, ?variant, "Mann-Kendall surface computed");
    Raster { grid: *grid, data: z }
}

use std::fmt::Write;

use crate::pipeline::Products;
use crate::raster::is_valid;

/// Counts of trend surface pixels by sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrendDirections {
    pub increasing: usize,
    pub decreasing: usize,
    pub flat: usize,
}

pub fn trend_directions(products: &Products) -> TrendDirections {
    let mut directions = TrendDirections::default();
    for &z in products.trend.data.iter().filter(|z| is_valid(**z)) {
        if z > 0.0 {
            directions.increasing += 1;
        } else if z < 0.0 {
            directions.decreasing += 1;
        } else {
            directions.flat += 1;
        }
    }
    directions
}

fn fmt_value(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{v:.precision$}"),
        None => "no data".to_string(),
    }
}

pub fn build_report(products: &Products, start_year: i32, end_year: i32) -> String {
    let mut output = String::new();
    let diagnostics = &products.diagnostics;

    let _ = writeln!(output, "# {} Evapotranspiration & Drought Report", products.country);
    let _ = writeln!(
        output,
        "Monthly ET from {} to {} ({} months), annual statistics for {}-{}",
        products.first_month.format("%Y-%m"),
        products.last_month.format("%Y-%m"),
        products.month_count,
        start_year,
        end_year
    );
    let _ = writeln!(
        output,
        "Analysis grid: {} x {} pixels at {} units",
        products.grid.cols, products.grid.rows, products.grid.pixel_width
    );

    if !diagnostics.missing_months.is_empty() {
        let months: Vec<String> = diagnostics
            .missing_months
            .iter()
            .map(|m| m.format("%Y-%m").to_string())
            .collect();
        let _ = writeln!(output);
        let _ = writeln!(output, "Months without source rasters: {}", months.join(", "));
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Drought Classes (latest valid SETI per pixel)");

    let classified: usize = products.class_histogram.iter().map(|(_, n)| n).sum();
    if classified == 0 {
        let _ = writeln!(output, "No pixels could be classified.");
    } else {
        for (class, count) in &products.class_histogram {
            let _ = writeln!(
                output,
                "- {} ({}): {} pixels ({:.1}%)",
                class.label(),
                class.code(),
                count,
                *count as f64 * 100.0 / classified as f64
            );
        }
    }
    if diagnostics.degenerate_seti_pixels > 0 {
        let _ = writeln!(
            output,
            "{} pixels have constant ET and no SETI value.",
            diagnostics.degenerate_seti_pixels
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Regions by Mean ET");

    let mut regions: Vec<_> = products.zonal.iter().collect();
    regions.sort_by(|a, b| {
        b.mean
            .unwrap_or(f64::NEG_INFINITY)
            .partial_cmp(&a.mean.unwrap_or(f64::NEG_INFINITY))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if regions.is_empty() {
        let _ = writeln!(output, "No regions loaded.");
    } else {
        for stat in regions {
            let _ = writeln!(
                output,
                "- {}: {} mm/day (std dev {})",
                stat.region,
                fmt_value(stat.mean, 3),
                fmt_value(stat.std_dev, 3)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Annual ET");
    let _ = writeln!(output, "| Year | Mean | Std Dev | Min | Max |");
    let _ = writeln!(output, "|------|------|---------|-----|-----|");
    for year in &products.annual {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} |",
            year.year,
            fmt_value(year.mean, 3),
            fmt_value(year.std_dev, 3),
            fmt_value(year.min, 3),
            fmt_value(year.max, 3)
        );
    }

    let directions = trend_directions(products);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Trend");
    let _ = writeln!(
        output,
        "- Pixels with increasing ET: {}",
        directions.increasing
    );
    let _ = writeln!(
        output,
        "- Pixels with decreasing ET: {}",
        directions.decreasing
    );
    let _ = writeln!(output, "- Pixels without trend: {}", directions.flat);
    let _ = writeln!(
        output,
        "- National monthly series Z: {}",
        fmt_value(products.national_trend_z, 3)
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Precipitation");
    if products.correlation.is_some() {
        let _ = writeln!(
            output,
            "National ET vs precipitation correlation: {}",
            fmt_value(products.national_correlation, 3)
        );
    } else {
        let _ = writeln!(output, "No precipitation source configured.");
    }

    output
}

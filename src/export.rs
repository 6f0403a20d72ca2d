use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::geotiff::{write_geotiff, GeoTiffOptions};
use crate::models::{Diagnostics, RunInfo};
use crate::pipeline::Products;
use crate::report;

/// Output products. Each is written independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    ZonalStats,
    MonthlyTimeseries,
    Trend,
    SetiDrought,
    AnnualStats,
    MeanEt,
    Correlation,
    Report,
}

impl Product {
    pub const ALL: [Product; 8] = [
        Product::ZonalStats,
        Product::MonthlyTimeseries,
        Product::Trend,
        Product::SetiDrought,
        Product::AnnualStats,
        Product::MeanEt,
        Product::Correlation,
        Product::Report,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Product::ZonalStats => "zonal_stats.csv",
            Product::MonthlyTimeseries => "monthly_timeseries.csv",
            Product::Trend => "et_trend_mann_kendall.tif",
            Product::SetiDrought => "seti_drought.tif",
            Product::AnnualStats => "annual_stats.csv",
            Product::MeanEt => "mean_et.tif",
            Product::Correlation => "et_precip_correlation.tif",
            Product::Report => "report.md",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Product::ZonalStats => "zonal-stats",
            Product::MonthlyTimeseries => "monthly-timeseries",
            Product::Trend => "trend",
            Product::SetiDrought => "seti-drought",
            Product::AnnualStats => "annual-stats",
            Product::MeanEt => "mean-et",
            Product::Correlation => "correlation",
            Product::Report => "report",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct ExportContext {
    pub out_dir: PathBuf,
    pub geotiff: GeoTiffOptions,
    pub start_year: i32,
    pub end_year: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Written,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub product: String,
    pub status: ExportStatus,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl ExportOutcome {
    pub fn written(product: impl ToString, path: Option<PathBuf>) -> Self {
        Self {
            product: product.to_string(),
            status: ExportStatus::Written,
            path,
            error: None,
        }
    }

    pub fn skipped(product: impl ToString) -> Self {
        Self {
            product: product.to_string(),
            status: ExportStatus::Skipped,
            path: None,
            error: None,
        }
    }

    pub fn failed(product: impl ToString, err: &anyhow::Error) -> Self {
        Self {
            product: product.to_string(),
            status: ExportStatus::Failed,
            path: None,
            error: Some(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub outcomes: Vec<ExportOutcome>,
}

impl ExportReport {
    pub fn record(&mut self, outcome: ExportOutcome) {
        let product = &outcome.product;
        match outcome.status {
            ExportStatus::Written => match &outcome.path {
                Some(path) => info!(%product, path = %path.display(), "export written"),
                None => info!(%product, "export written"),
            },
            ExportStatus::Skipped => info!(%product, "export skipped"),
            ExportStatus::Failed => error!(
                %product,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "export failed"
            ),
        }
        self.outcomes.push(outcome);
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status == ExportStatus::Failed).count()
    }
}

/// Writes one product. `Ok(None)` means the product does not apply to this
/// run (no precipitation source for the correlation raster).
pub fn write_product(
    product: Product,
    products: &Products,
    context: &ExportContext,
) -> anyhow::Result<Option<PathBuf>> {
    let path = context.out_dir.join(product.file_name());
    let options = &context.geotiff;

    match product {
        Product::ZonalStats => write_csv(&path, &products.zonal)?,
        Product::MonthlyTimeseries => write_csv(&path, &products.monthly)?,
        Product::AnnualStats => write_csv(&path, &products.annual)?,
        Product::Trend => write_geotiff(&path, &[("mk_z", &products.trend)], options)?,
        Product::SetiDrought => write_geotiff(
            &path,
            &[("seti", &products.seti), ("drought_class", &products.drought_class)],
            options,
        )?,
        Product::MeanEt => {
            let positive = products.mean_et.retain(|v| v > 0.0);
            write_geotiff(&path, &[("mean_et", &positive)], options)?
        }
        Product::Correlation => match &products.correlation {
            Some(correlation) => {
                write_geotiff(&path, &[("et_precip_r", correlation)], options)?
            }
            None => return Ok(None),
        },
        Product::Report => std::fs::write(
            &path,
            report::build_report(products, context.start_year, context.end_year),
        )?,
    }

    Ok(Some(path))
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes every product on the blocking pool. A failed product is logged
/// and recorded; it never stops the others.
pub async fn export_all(products: Arc<Products>, context: Arc<ExportContext>) -> ExportReport {
    let mut report = ExportReport::default();

    if let Err(err) = std::fs::create_dir_all(&context.out_dir) {
        let err = anyhow!(err).context(format!(
            "failed to create output directory {}",
            context.out_dir.display()
        ));
        for product in Product::ALL {
            report.record(ExportOutcome::failed(product, &err));
        }
        return report;
    }

    let handles: Vec<_> = Product::ALL
        .into_iter()
        .map(|product| {
            let products = Arc::clone(&products);
            let context = Arc::clone(&context);
            let handle = tokio::task::spawn_blocking(move || {
                write_product(product, &products, &context)
                    .with_context(|| format!("failed to write {}", product.file_name()))
            });
            (product, handle)
        })
        .collect();

    for (product, handle) in handles {
        let outcome = match handle.await {
            Ok(Ok(Some(path))) => ExportOutcome::written(product, Some(path)),
            Ok(Ok(None)) => ExportOutcome::skipped(product),
            Ok(Err(err)) => ExportOutcome::failed(product, &err),
            Err(join) => ExportOutcome::failed(product, &anyhow!("export task aborted: {join}")),
        };
        report.record(outcome);
    }

    report
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    run: &'a RunInfo,
    finished_at: chrono::DateTime<Utc>,
    country: &'a str,
    first_month: chrono::NaiveDate,
    last_month: chrono::NaiveDate,
    month_count: usize,
    national_trend_z: Option<f64>,
    national_correlation: Option<f64>,
    diagnostics: &'a Diagnostics,
    exports: &'a [ExportOutcome],
}

pub fn write_summary(
    path: &Path,
    run: &RunInfo,
    products: &Products,
    report: &ExportReport,
) -> anyhow::Result<()> {
    let summary = RunSummary {
        run,
        finished_at: Utc::now(),
        country: &products.country,
        first_month: products.first_month,
        last_month: products.last_month,
        month_count: products.month_count,
        national_trend_z: products.national_trend_z,
        national_correlation: products.national_correlation,
        diagnostics: &products.diagnostics,
        exports: &report.outcomes,
    };
    let json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write run summary {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{run, tests::constant_run};
    use crate::geotiff::read_geotiff;
    use uuid::Uuid;

    fn context(out_dir: PathBuf) -> ExportContext {
        ExportContext {
            out_dir,
            geotiff: GeoTiffOptions {
                epsg: 32636,
                nodata: -9999.0,
            },
            start_year: 2001,
            end_year: 2003,
        }
    }

    fn products() -> Products {
        let (config, inputs) = constant_run();
        run(&config, &inputs).unwrap()
    }

    #[tokio::test]
    async fn all_products_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let report = export_all(
            Arc::new(products()),
            Arc::new(context(dir.path().join("out"))),
        )
        .await;

        assert_eq!(report.failed_count(), 0);
        assert_eq!(report.outcomes.len(), Product::ALL.len());
        let correlation = report
            .outcomes
            .iter()
            .find(|o| o.product == "correlation")
            .unwrap();
        assert_eq!(correlation.status, ExportStatus::Skipped);
        for product in Product::ALL {
            let exists = dir.path().join("out").join(product.file_name()).exists();
            assert_eq!(exists, product != Product::Correlation, "{product}");
        }

        let zonal = std::fs::read_to_string(dir.path().join("out/zonal_stats.csv")).unwrap();
        let mut lines = zonal.lines();
        assert_eq!(lines.next(), Some("region,mean,std_dev"));
        assert!(lines.next().unwrap().starts_with("West,5"));

        let annual = std::fs::read_to_string(dir.path().join("out/annual_stats.csv")).unwrap();
        assert!(annual.starts_with("year,mean,std_dev,min,max\n"));
        assert!(annual.contains("\n2003,,,,\n"));

        let monthly =
            std::fs::read_to_string(dir.path().join("out/monthly_timeseries.csv")).unwrap();
        assert!(monthly.starts_with("date,mean_et,month,year\n2001-01-01,5"));
    }

    #[test]
    fn mean_et_export_keeps_positive_values_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut products = products();
        products.mean_et.data[[0, 0]] = -0.5;
        products.mean_et.data[[0, 1]] = 0.0;

        let path = write_product(Product::MeanEt, &products, &context(dir.path().to_path_buf()))
            .unwrap()
            .unwrap();
        let written = read_geotiff(&path).unwrap();
        assert!(written.data[[0, 0]].is_nan());
        assert!(written.data[[0, 1]].is_nan());
        assert!((written.data[[0, 2]] - 5.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        // a directory squatting on one product's file name makes that write fail
        std::fs::create_dir(dir.path().join(Product::Trend.file_name())).unwrap();

        let report = export_all(
            Arc::new(products()),
            Arc::new(context(dir.path().to_path_buf())),
        )
        .await;

        assert_eq!(report.failed_count(), 1);
        let failed: Vec<&str> = report
            .outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.product.as_str())
            .collect();
        assert_eq!(failed, vec!["trend"]);
        assert!(dir.path().join(Product::SetiDrought.file_name()).exists());
        assert!(dir.path().join(Product::Report.file_name()).exists());
    }

    #[test]
    fn summary_records_run_and_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_summary.json");
        let run_info = RunInfo {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        };
        let mut report = ExportReport::default();
        report.record(ExportOutcome::failed(Product::Trend, &anyhow!("disk full")));

        write_summary(&path, &run_info, &products(), &report).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["run"]["id"], run_info.id.to_string());
        assert_eq!(json["month_count"], 24);
        assert_eq!(json["diagnostics"]["missing_years"][0], 2003);
        assert_eq!(json["exports"][0]["error"], "disk full");
    }
}

use sqlx::{PgPool, Row};

use crate::config::Config;
use crate::models::{RunInfo, RunRecord};
use crate::pipeline::Products;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Stores the run and its tables in one transaction.
pub async fn publish_run(
    pool: &PgPool,
    run: &RunInfo,
    config: &Config,
    products: &Products,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO sudan_et.runs
        (id, started_at, country, first_month, last_month, month_count,
         national_trend_z, national_correlation, config)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(run.id)
    .bind(run.started_at)
    .bind(&products.country)
    .bind(products.first_month)
    .bind(products.last_month)
    .bind(products.month_count as i32)
    .bind(products.national_trend_z)
    .bind(products.national_correlation)
    .bind(serde_json::to_value(config)?)
    .execute(&mut *tx)
    .await?;

    for stat in &products.zonal {
        sqlx::query(
            r#"
            INSERT INTO sudan_et.zonal_stats (run_id, region, mean, std_dev)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run.id)
        .bind(&stat.region)
        .bind(stat.mean)
        .bind(stat.std_dev)
        .execute(&mut *tx)
        .await?;
    }

    for stat in &products.annual {
        sqlx::query(
            r#"
            INSERT INTO sudan_et.annual_stats (run_id, year, mean, std_dev, min, max)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(stat.year)
        .bind(stat.mean)
        .bind(stat.std_dev)
        .bind(stat.min)
        .bind(stat.max)
        .execute(&mut *tx)
        .await?;
    }

    for point in &products.monthly {
        sqlx::query(
            r#"
            INSERT INTO sudan_et.monthly_series (run_id, month_start, mean_et)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(run.id)
        .bind(point.date)
        .bind(point.mean_et)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn fetch_runs(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
    let rows = sqlx::query(
        "SELECT r.id, r.started_at, r.first_month, r.last_month, r.month_count, \
         (SELECT COUNT(*) FROM sudan_et.zonal_stats z WHERE z.run_id = r.id) AS region_count \
         FROM sudan_et.runs r \
         ORDER BY r.started_at DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut runs = Vec::new();
    for row in rows {
        runs.push(RunRecord {
            id: row.get("id"),
            started_at: row.get("started_at"),
            first_month: row.get("first_month"),
            last_month: row.get("last_month"),
            month_count: row.get("month_count"),
            region_count: row.get("region_count"),
        });
    }

    Ok(runs)
}

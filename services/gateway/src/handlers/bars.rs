use axum::{
    extract::{Query, State},
    Json,
};
use chrono::NaiveDate;
use market_bars::service::BarsParams;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub ticker: String,
    pub timespan: Option<String>,
    pub multiplier: Option<u32>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// `GET /v1/market/bars`
pub async fn get_bars(
    State(state): State<AppState>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<Value>, AppError> {
    let timespan = query.timespan.unwrap_or_else(|| "day".to_string());
    let multiplier = query.multiplier.unwrap_or(1);
    let result = state
        .bars
        .list_bars_with_meta(BarsParams {
            ticker: query.ticker,
            timespan: timespan.clone(),
            multiplier,
            start_date: query.from,
            end_date: query.to,
            limit: query.limit,
        })
        .await?;

    Ok(Json(json!({
        "timespan": timespan,
        "multiplier": multiplier,
        "data_source": result.data_source,
        "count": result.bars.len(),
        "bars": result.bars,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    /// Comma-separated ticker list.
    pub tickers: String,
}

/// `GET /v1/market/snapshots`
pub async fn get_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotsQuery>,
) -> Result<Json<Value>, AppError> {
    let tickers: Vec<String> = query
        .tickers
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let snapshots = state.bars.list_snapshots(&tickers).await?;

    Ok(Json(json!({
        "count": snapshots.len(),
        "snapshots": snapshots,
    })))
}

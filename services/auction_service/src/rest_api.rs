//! REST façade for the auction coordination service.
//!
//! A small, stateless HTTP surface for UI and CLI clients. Reads are served
//! straight from store snapshots; the only write path is bid submission,
//! which goes through the [`BidCoordinator`] and returns *accepted*, never
//! *settled*; clients watch the auction record for the confirming event.
//!
//! Conventions:
//! * `snake_case` query parameters, `camelCase` JSON bodies
//! * errors conform to RFC 7807 (`application/problem+json`)

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use sg_common::{Address, Amount, ListingKey, TokenId};
use tracing::instrument;

use crate::coordinator::{BidCoordinator, BidError};
use crate::query::{AuctionFilter, QueryFacade};
use crate::store::{MarketStore, UserBalance};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MarketStore>,
    pub query: Arc<QueryFacade>,
    pub coordinator: Arc<BidCoordinator>,
}

/// Build the fully-wired router. The caller owns binding and serving.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auctions", get(list_auctions))
        .route("/auctions/:event/:token", get(get_auction))
        .route("/auctions/:event/:token/bids", post(place_bid))
        .route("/balances/:event/:account", get(get_balance))
        .route("/accounts/:account/holdings", get(get_holdings))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Bid(BidError),
}

impl From<BidError> for ApiError {
    fn from(err: BidError) -> Self {
        ApiError::Bid(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, title, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "Bad Request", detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "Not Found", detail),
            ApiError::Bid(err) => {
                let status = match &err {
                    BidError::AuctionNotFound => StatusCode::NOT_FOUND,
                    BidError::BidInFlight => StatusCode::CONFLICT,
                    BidError::Submit(_) => StatusCode::BAD_GATEWAY,
                    BidError::AuctionNotActive
                    | BidError::AuctionExpired
                    | BidError::BidTooLow { .. }
                    | BidError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, "Bid Rejected", err.to_string())
            }
        };

        let problem = serde_json::json!({
            "type": "about:blank",
            "title": title,
            "status": status.as_u16(),
            "detail": detail,
        });
        (status, Json(problem)).into_response()
    }
}

fn parse_key(event: &str, token: u64) -> Result<ListingKey, ApiError> {
    let event: Address = event
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid event address: {e}")))?;
    Ok(ListingKey::new(event, TokenId(token)))
}

fn parse_address(raw: &str, what: &str) -> Result<Address, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid {what}: {e}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.store.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "cursor": snapshot.cursor().to_string(),
    }))
}

#[instrument(skip_all)]
async fn list_auctions(
    State(state): State<AppState>,
    Query(filter): Query<AuctionFilter>,
) -> Json<serde_json::Value> {
    let auctions = state.query.list_active(&filter, Utc::now());
    Json(serde_json::json!({ "data": auctions }))
}

#[instrument(skip_all)]
async fn get_auction(
    State(state): State<AppState>,
    Path((event, token)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = parse_key(&event, token)?;
    let view = state
        .query
        .get_auction(&key, Utc::now())
        .ok_or_else(|| ApiError::NotFound(format!("no auction for {key}")))?;
    Ok(Json(serde_json::json!({ "data": view })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BidRequest {
    bidder: Address,
    amount: Amount,
}

#[instrument(skip_all)]
async fn place_bid(
    State(state): State<AppState>,
    Path((event, token)): Path<(String, u64)>,
    Json(payload): Json<BidRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&event, token)?;
    let ticket = state
        .coordinator
        .submit_bid(key, payload.bidder, payload.amount)
        .await?;

    // 202: the bid was handed to the wallet layer, not yet confirmed.
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "data": ticket }))))
}

#[instrument(skip_all)]
async fn get_balance(
    State(state): State<AppState>,
    Path((event, account)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event = parse_address(&event, "event address")?;
    let account = parse_address(&account, "account address")?;

    // Accounts with no escrow history read as all-zero, like the contract.
    let balance = state
        .query
        .user_balance(account, event)
        .unwrap_or(UserBalance::default());
    Ok(Json(serde_json::json!({ "data": balance })))
}

#[instrument(skip_all)]
async fn get_holdings(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = parse_address(&account, "account address")?;
    let holdings = state.query.holdings(account);
    Ok(Json(serde_json::json!({ "data": holdings })))
}

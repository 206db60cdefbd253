use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::engine::{DistributionReceipt, PredictionMarket};
use crate::error::{EngineError, ErrorKind};
use crate::models::{
    from_amount, to_amount, Amount, Category, PoolSummary, Round, RoundRef, SettlementResult,
    Stake,
};

/// Header carrying the caller's already-verified user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub market: Arc<PredictionMarket>,
}

/// Create the API router
pub fn create_router(market: Arc<PredictionMarket>) -> Router {
    let state = AppState { market };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/pools", get(list_pools))
        .route("/api/rounds/:category", get(round_history))
        .route("/api/rounds/:category/:number", get(get_round))
        .route("/api/rounds/:category/:number/stakes", post(place_stake))
        .route("/api/rounds/:category/:number/settlement", get(get_settlement))
        .route("/api/admin/rounds/:category/:number/void", post(void_round))
        .route("/api/balances/:user_id", get(get_balance))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Pool overview for every open or closing round
async fn list_pools(State(state): State<AppState>) -> Json<PoolsResponse> {
    let pools = state.market.active_pools(Utc::now());
    Json(PoolsResponse {
        count: pools.len(),
        pools,
    })
}

async fn round_history(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<Vec<Round>>, ApiError> {
    let category = parse_category(&category)?;
    Ok(Json(state.market.rounds().history(category)))
}

async fn get_round(
    State(state): State<AppState>,
    Path((category, number)): Path<(String, u64)>,
) -> Result<Json<RoundResponse>, ApiError> {
    let round_ref = RoundRef::new(parse_category(&category)?, number);
    let round = state.market.rounds().get(&round_ref)?;
    let pool = state.market.pool_summary(&round_ref, Utc::now())?;
    Ok(Json(RoundResponse { round, pool }))
}

async fn place_stake(
    State(state): State<AppState>,
    Path((category, number)): Path<(String, u64)>,
    headers: HeaderMap,
    Json(body): Json<StakeRequest>,
) -> Result<(StatusCode, Json<Stake>), ApiError> {
    let round_ref = RoundRef::new(parse_category(&category)?, number);
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", USER_ID_HEADER)))?;
    let amount = body.amount_units()?;

    let stake = state
        .market
        .place_stake(&round_ref, user_id, &body.clip_id, amount)?;
    Ok((StatusCode::CREATED, Json(stake)))
}

async fn get_settlement(
    State(state): State<AppState>,
    Path((category, number)): Path<(String, u64)>,
) -> Result<Json<SettlementResult>, ApiError> {
    let round_ref = RoundRef::new(parse_category(&category)?, number);
    state.market.rounds().get(&round_ref)?;
    state
        .market
        .settlement_result(&round_ref)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Round {} is not settled", round_ref)))
}

async fn void_round(
    State(state): State<AppState>,
    Path((category, number)): Path<(String, u64)>,
) -> Result<Json<DistributionReceipt>, ApiError> {
    let round_ref = RoundRef::new(parse_category(&category)?, number);
    warn!(round = %round_ref, "Administrative void requested");
    Ok(Json(state.market.void_round(&round_ref)?))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.market.balance_of(&user_id)?;
    Ok(Json(BalanceResponse {
        user_id,
        balance,
        balance_tokens: from_amount(balance),
    }))
}

fn parse_category(raw: &str) -> Result<Category, ApiError> {
    Category::from_str(raw).ok_or_else(|| ApiError::NotFound(format!("Unknown category {}", raw)))
}

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
pub struct StakeRequest {
    pub clip_id: String,
    /// Token amount, e.g. 0.5
    #[serde(default)]
    pub amount: Option<f64>,
    /// Exact amount in settlement units; wins over `amount` when both are set
    #[serde(default)]
    pub amount_units: Option<Amount>,
}

impl StakeRequest {
    fn amount_units(&self) -> Result<Amount, ApiError> {
        match (self.amount_units, self.amount) {
            (Some(units), _) => Ok(units),
            (None, Some(tokens)) => to_amount(tokens).ok_or_else(|| {
                ApiError::Unprocessable(format!("invalid stake amount {}", tokens))
            }),
            (None, None) => Err(ApiError::Unprocessable(
                "one of amount or amount_units is required".to_string(),
            )),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct PoolsResponse {
    count: usize,
    pools: Vec<PoolSummary>,
}

#[derive(Serialize)]
struct RoundResponse {
    round: Round,
    pool: PoolSummary,
}

#[derive(Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: Amount,
    balance_tokens: f64,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Engine(err) => engine_error_response(err),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": msg }))
            }
        };

        (status, Json(body)).into_response()
    }
}

fn engine_error_response(err: &EngineError) -> (StatusCode, serde_json::Value) {
    if let EngineError::Rejected(rejection) = err {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": err.to_string(), "rejection": rejection }),
        );
    }
    if let EngineError::NotFound(_) = err {
        return (StatusCode::NOT_FOUND, json!({ "error": err.to_string() }));
    }

    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::StateConflict => StatusCode::CONFLICT,
        ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InvariantViolation => {
            error!("Invariant violation surfaced to API: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, json!({ "error": err.to_string(), "kind": err.kind() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_market() -> Arc<PredictionMarket> {
        let market = PredictionMarket::new_in_memory(EngineConfig::default());
        market
            .open_round(
                Category::Gaming,
                vec!["c1".into(), "c2".into()],
                Utc::now(),
            )
            .unwrap();
        Arc::new(market)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn stake_request(user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/rounds/gaming/1/stakes")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_place_stake_and_read_pool() {
        let market = test_market();
        let router = create_router(market.clone());

        let (status, body) = send(
            router.clone(),
            stake_request(Some("alice"), json!({ "clip_id": "c1", "amount": 0.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["amount"], 500_000_000u64);
        assert_eq!(body["user_id"], "alice");

        let (status, body) = send(
            router,
            Request::get("/api/pools").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["pools"][0]["pool_id"], "game_round1");
        assert_eq!(body["pools"][0]["participants"], 1);
    }

    #[tokio::test]
    async fn test_stake_rejections_map_to_422() {
        let router = create_router(test_market());

        let (status, body) = send(
            router.clone(),
            stake_request(Some("bob"), json!({ "clip_id": "c1", "amount": 0.01 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["rejection"]["reason"], "below_minimum");

        let (status, body) = send(
            router.clone(),
            stake_request(Some("bob"), json!({ "clip_id": "zzz", "amount": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["rejection"]["reason"], "invalid_clip");

        let (status, _) = send(
            router,
            stake_request(None, json!({ "clip_id": "c1", "amount": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_mapping_for_state_errors() {
        let market = test_market();
        let router = create_router(market.clone());

        let (status, _) = send(
            router.clone(),
            Request::get("/api/rounds/gaming/7").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            router.clone(),
            Request::get("/api/rounds/sports").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let void = || {
            Request::post("/api/admin/rounds/gaming/1/void")
                .body(Body::empty())
                .unwrap()
        };
        let (status, body) = send(router.clone(), void()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "refund");

        let (status, body) = send(router.clone(), void()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "state_conflict");

        let (status, body) = send(
            router,
            stake_request(Some("carol"), json!({ "clip_id": "c1", "amount": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["rejection"]["reason"], "round_closed");
    }

    #[tokio::test]
    async fn test_balance_endpoint() {
        let router = create_router(test_market());
        let (status, body) = send(
            router,
            Request::get("/api/balances/alice").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 0);
    }
}

//! HTTP request handlers for the oracle API

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common::{Methodology, SourceHealth};
use observability::{ApiMetrics, RequestTimer};
use std::sync::Arc;

use crate::api::models::{ErrorResponse, PremiumParams, VolatilityParams};
use crate::error::{ErrorKind, OracleError};
use crate::oracle::PriceOracle;
use crate::types::{ConsensusPrice, OptionType, PremiumQuote, VolatilityEstimate};

/// Shared state for oracle API handlers
pub struct OracleApiState {
    pub oracle: Arc<PriceOracle>,
    price_metrics: ApiMetrics,
    volatility_metrics: ApiMetrics,
    premium_metrics: ApiMetrics,
    sources_metrics: ApiMetrics,
}

impl OracleApiState {
    pub fn new(oracle: Arc<PriceOracle>) -> Self {
        Self {
            oracle,
            price_metrics: ApiMetrics::new("price"),
            volatility_metrics: ApiMetrics::new("volatility"),
            premium_metrics: ApiMetrics::new("premium"),
            sources_metrics: ApiMetrics::new("sources"),
        }
    }
}

/// [`OracleError`] as an HTTP response
///
/// Retryable errors are 503, input errors 400, integrity and storage
/// failures 500.
#[derive(Debug)]
pub struct ApiError(pub OracleError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match (&self.0, self.0.kind()) {
            (OracleError::Storage(_), _) | (OracleError::DataIntegrity(_), _) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            (_, ErrorKind::Retryable) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::Rejected) => StatusCode::BAD_REQUEST,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        ApiError(OracleError::InvalidInput(message.into()))
    }
}

impl From<OracleError> for ApiError {
    fn from(e: OracleError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Map a handler result to a response, recording the status on `timer`
fn respond<T>(timer: &mut RequestTimer<'_>, result: Result<T, ApiError>) -> Result<Json<T>, ApiError> {
    match result {
        Ok(value) => Ok(Json(value)),
        Err(e) => {
            timer.set_status(e.status().as_u16());
            Err(e)
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::invalid(format!("missing query parameter {}", name)))
}

/// GET /api/v1/oracle/price
pub async fn get_price(State(state): State<Arc<OracleApiState>>) -> Result<Json<ConsensusPrice>, ApiError> {
    let mut timer = RequestTimer::new(&state.price_metrics);
    let result = state.oracle.get_consensus_price().await.map_err(ApiError::from);
    respond(&mut timer, result)
}

/// GET /api/v1/oracle/volatility
pub async fn get_volatility(
    State(state): State<Arc<OracleApiState>>,
    Query(params): Query<VolatilityParams>,
) -> Result<Json<VolatilityEstimate>, ApiError> {
    let mut timer = RequestTimer::new(&state.volatility_metrics);
    let result = async {
        let window = required(&params.window_days, "window_days")?;
        let window_days: u32 = window
            .parse()
            .map_err(|_| ApiError::invalid(format!("window_days must be a positive integer, got {}", window)))?;
        let methodology = match params.methodology.as_deref() {
            None => Methodology::LogReturn,
            Some(m) => Methodology::parse(m).ok_or_else(|| ApiError::invalid(format!("unknown methodology {}", m)))?,
        };
        Ok::<_, ApiError>(state.oracle.get_volatility(window_days, methodology).await?)
    }
    .await;
    respond(&mut timer, result)
}

/// GET /api/v1/oracle/premium
pub async fn get_premium(
    State(state): State<Arc<OracleApiState>>,
    Query(params): Query<PremiumParams>,
) -> Result<Json<PremiumQuote>, ApiError> {
    let mut timer = RequestTimer::new(&state.premium_metrics);
    let result = async {
        let option_type = required(&params.option_type, "option_type")?;
        let option_type = OptionType::parse(option_type)
            .ok_or_else(|| ApiError::invalid(format!("option_type must be call or put, got {}", option_type)))?;
        let strike = required(&params.strike, "strike")?;
        let strike: f64 = strike
            .parse()
            .map_err(|_| ApiError::invalid(format!("strike must be a number, got {}", strike)))?;
        let expiry = required(&params.expiry, "expiry")?;
        let expiry = DateTime::parse_from_rfc3339(expiry)
            .map_err(|e| ApiError::invalid(format!("expiry must be RFC 3339: {}", e)))?
            .with_timezone(&Utc);
        Ok::<_, ApiError>(state.oracle.get_premium(option_type, strike, expiry).await?)
    }
    .await;
    respond(&mut timer, result)
}

/// GET /api/v1/oracle/sources
pub async fn get_sources(State(state): State<Arc<OracleApiState>>) -> Json<Vec<SourceHealth>> {
    let _timer = RequestTimer::new(&state.sources_metrics);
    Json(state.oracle.source_health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::oracle_routes;
    use crate::sources::{SharedAdapter, StaticSourceAdapter};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use chrono::{Duration, TimeZone};
    use common::{Clock, HistoricalClose, ManualClock};
    use storage::{HistoricalStore, InMemoryHistoricalStore, RetentionPolicy};
    use tower::ServiceExt;

    fn setup() -> (Router, Arc<PriceOracle>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap());
        let mut config = config::generate_default_config();
        config.sources.truncate(3);
        config.volatility.windows = vec![5];
        config.premium.volatility_window_days = 5;

        let adapters: Vec<SharedAdapter> = config
            .sources
            .iter()
            .map(|s| {
                Arc::new(StaticSourceAdapter::new(s.provider_id.as_str().into(), 60_000.0, clock.shared()))
                    as SharedAdapter
            })
            .collect();
        let store: Arc<dyn HistoricalStore> =
            Arc::new(InMemoryHistoricalStore::new(Vec::new(), RetentionPolicy::default()));
        let oracle = Arc::new(PriceOracle::new(&config, adapters, store, clock.shared()));
        let router = oracle_routes(Arc::new(OracleApiState::new(oracle.clone())));
        (router, oracle, clock)
    }

    async fn seed_history(oracle: &PriceOracle, clock: &ManualClock) {
        let today = clock.now().date_naive();
        for (i, price) in [58_000.0, 59_000.0, 58_500.0, 60_000.0, 59_500.0].into_iter().enumerate() {
            let date = today - Duration::days(5 - i as i64);
            let close = HistoricalClose::new(date, "BTC", price, "coingecko".into(), clock.now());
            oracle.store().append_close(close).await.unwrap();
        }
        oracle.recompute_volatility().await.unwrap();
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_price_unavailable_then_served() {
        let (router, oracle, _clock) = setup();

        let (status, body) = get(&router, "/api/v1/oracle/price").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "insufficient_consensus");
        assert_eq!(body["retryable"], true);

        oracle.run_spot_cycle().await.unwrap();
        let (status, body) = get(&router, "/api/v1/oracle/price").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["price"], 60_000.0);
        assert_eq!(body["confidence"], 1.0);
    }

    #[tokio::test]
    async fn test_volatility_errors_and_value() {
        let (router, oracle, clock) = setup();

        let (status, body) = get(&router, "/api/v1/oracle/volatility?window_days=5").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "insufficient_data");

        let (status, body) = get(&router, "/api/v1/oracle/volatility?window_days=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
        assert_eq!(body["retryable"], false);

        let (status, _) = get(&router, "/api/v1/oracle/volatility?window_days=5&methodology=garch").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        seed_history(&oracle, &clock).await;
        let (status, body) = get(&router, "/api/v1/oracle/volatility?window_days=5&methodology=ewma").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["methodology"], "ewma");
        assert!(body["value"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_premium_quote() {
        let (router, oracle, clock) = setup();
        seed_history(&oracle, &clock).await;
        oracle.run_spot_cycle().await.unwrap();

        let expiry = (clock.now() + Duration::days(30)).to_rfc3339();
        let uri = format!(
            "/api/v1/oracle/premium?option_type=put&strike=55000&expiry={}",
            expiry.replace('+', "%2B")
        );
        let (status, body) = get(&router, &uri).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["option_type"], "put");
        assert_eq!(body["underlying_price"], 60_000.0);
        let premium = body["premium"].as_f64().unwrap();
        assert!(premium > 0.0 && premium < 55_000.0);

        let (status, body) = get(&router, "/api/v1/oracle/premium?option_type=straddle&strike=1&expiry=x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_sources_listed() {
        let (router, _oracle, _clock) = setup();
        let (status, body) = get(&router, "/api/v1/oracle/sources").await;

        assert_eq!(status, StatusCode::OK);
        let sources = body.as_array().unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0]["circuit_state"], "closed");
    }
}

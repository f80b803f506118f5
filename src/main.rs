//! Engine service binary.
//!
//! Serves the read-only pricing surface and the realtime event streams.
//! Trade, liquidity, resolution and comment operations are library calls
//! made by the platform's HTTP layer, which lives outside this crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use exchange_engine::config::EngineConfig;
use exchange_engine::database;
use exchange_engine::error::EngineError;
use exchange_engine::fanout::{Fanout, SubscriptionFilter};
use exchange_engine::pricing::{self, TimeRange};

#[derive(Clone)]
struct AppState {
    db: PgPool,
    fanout: Arc<Fanout>,
}

type ApiResult<T> = Result<Json<T>, (axum::http::StatusCode, Json<Value>)>;

fn api_error(error: EngineError) -> (axum::http::StatusCode, Json<Value>) {
    let status = axum::http::StatusCode::from_u16(error.status_code())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %error, "request failed");
        (status, Json(json!({ "error": "internal server error" })))
    } else {
        (status, Json(json!({ "error": error.to_string() })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = EngineConfig::from_env();
    let pool = database::create_pool(&config.database_url, config.pool_max_connections).await?;
    database::run_migrations(&pool).await?;
    info!("database ready");

    let state = AppState {
        db: pool,
        fanout: Arc::new(Fanout::new(config.fanout_capacity)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/options/:option_id/price", get(get_price))
        .route("/options/:option_id/history", get(get_price_history))
        .route("/markets/:market_id/audit", get(get_market_audit))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    info!(%addr, "engine listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "exchange-engine" }))
}

async fn get_price(
    State(state): State<AppState>,
    Path(option_id): Path<Uuid>,
) -> ApiResult<Value> {
    match pricing::price_at(&state.db, option_id).await {
        Ok(quote) => Ok(Json(json!(quote))),
        Err(e) => Err(api_error(e)),
    }
}

async fn get_market_audit(
    State(state): State<AppState>,
    Path(market_id): Path<Uuid>,
) -> ApiResult<Value> {
    match exchange_engine::audit::verify_market_invariants(&state.db, market_id).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(api_error(e)),
    }
}

async fn get_price_history(
    State(state): State<AppState>,
    Path(option_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let range: TimeRange = params
        .get("range")
        .map(String::as_str)
        .unwrap_or("ALL")
        .parse()
        .map_err(api_error)?;

    match pricing::price_history(&state.db, option_id, range).await {
        Ok(points) => Ok(Json(json!({ "option_id": option_id, "points": points }))),
        Err(e) => Err(api_error(e)),
    }
}

fn parse_filter(params: &HashMap<String, String>) -> Result<SubscriptionFilter, EngineError> {
    let market_id = params
        .get("market_id")
        .map(|s| s.parse::<Uuid>())
        .transpose()
        .map_err(|_| EngineError::Validation("invalid market_id".into()))?;
    let user_id = params
        .get("user_id")
        .map(|s| s.parse::<Uuid>())
        .transpose()
        .map_err(|_| EngineError::Validation("invalid user_id".into()))?;
    let option_ids = match params.get("option_ids") {
        Some(raw) => raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Uuid>()
                    .map_err(|_| EngineError::Validation("invalid option id".into()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let filter = SubscriptionFilter {
        market_id,
        option_ids,
        user_id,
    };
    if filter.is_empty() {
        return Err(EngineError::Validation(
            "subscription needs market_id, option_ids or user_id".into(),
        ));
    }
    Ok(filter)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Response, (axum::http::StatusCode, Json<Value>)> {
    let filter = parse_filter(&params).map_err(api_error)?;
    Ok(ws.on_upgrade(move |socket| websocket_connection(socket, state, filter)))
}

/// Forward matching envelopes until the client goes away. A subscriber
/// that lags behind the broadcast buffer is told to resynchronize from
/// snapshots and dropped, so slow readers never hold up commits.
async fn websocket_connection(socket: WebSocket, state: AppState, filter: SubscriptionFilter) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.fanout.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if !filter.matches(&envelope) {
                        continue;
                    }
                    let Ok(payload) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, requesting resync");
                    let notice = json!({ "type": "resync_required", "skipped": skipped });
                    let _ = sender.send(Message::Text(notice.to_string())).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        // Drain client frames; subscriptions are fixed at connect time.
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

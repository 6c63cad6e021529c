use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::chain::{Block, Ledger};
use crate::config::Cfg;
use crate::gate::{RegisterError, RegistrationGate};
use crate::store::ImageStore;

/// Shared state for the handlers. The ledger sits behind one mutex; the
/// whole check-then-append of a registration runs under it, which is the
/// external serialization the gate requires. Reads clone a snapshot and
/// release the lock before scanning.
#[derive(Clone)]
pub struct AppState {
    gate: Arc<RegistrationGate>,
    ledger: Arc<Mutex<Ledger>>,
}

pub async fn serve(cfg: Cfg) -> Result<()> {
    let ledger = Ledger::load(&cfg.ledger_path)?;
    tracing::info!(
        blocks = ledger.len(),
        path = %cfg.ledger_path.display(),
        "ledger loaded"
    );

    let gate = RegistrationGate::new(
        ImageStore::new(&cfg.image_dir),
        cfg.similarity_threshold,
    );
    let state = AppState {
        gate: Arc::new(gate),
        ledger: Arc::new(Mutex::new(ledger)),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    tracing::info!("imgchain API listening on http://{}", cfg.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/verify", post(verify))
        .route("/api/validate", get(validate))
        .route("/api/chain", get(chain))
        .route("/images/{name}", get(get_image))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterReq {
    owner: String,
    image_b64: String,
}

#[derive(Deserialize)]
struct VerifyReq {
    image_b64: String,
}

#[derive(Serialize)]
struct VerifyResp {
    duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exact: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched: Option<Block>,
}

enum ApiErr {
    BadRequest(String),
    Duplicate { exact: bool, matched: Block },
    Internal(anyhow::Error),
}

impl ApiErr {
    fn internal(e: impl Into<anyhow::Error>) -> Self {
        ApiErr::Internal(e.into())
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        match self {
            ApiErr::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiErr::Duplicate { exact, matched } => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "duplicate",
                    "exact": exact,
                    "matched": matched,
                })),
            )
                .into_response(),
            ApiErr::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

fn decode_image_b64(b64: &str) -> Result<Vec<u8>, ApiErr> {
    BASE64
        .decode(b64.trim())
        .map_err(|_| ApiErr::BadRequest("image_b64 is not valid base64".to_string()))
}

/// POST /api/register — gate an upload and append it to the chain.
async fn register(
    State(st): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<impl IntoResponse, ApiErr> {
    let owner = req.owner.trim().to_string();
    if owner.is_empty() {
        return Err(ApiErr::BadRequest("owner must not be empty".to_string()));
    }
    let raw = decode_image_b64(&req.image_b64)?;

    // Normalization, hashing and the similarity scan are CPU-bound; keep
    // them off the async workers.
    let st2 = st.clone();
    let res = tokio::task::spawn_blocking(move || {
        let mut ledger = st2.ledger.lock().unwrap();
        st2.gate.register(&raw, &owner, &mut ledger)
    })
    .await
    .map_err(|e| ApiErr::internal(anyhow::anyhow!("task join error: {e}")))?;

    match res {
        Ok(block) => {
            tracing::info!(index = block.index, owner = %block.data.owner, "image registered");
            Ok((StatusCode::CREATED, Json(block)))
        }
        Err(RegisterError::Duplicate(dup)) => Err(ApiErr::Duplicate {
            exact: dup.is_exact(),
            matched: dup.block().clone(),
        }),
        Err(RegisterError::Decode(e)) => Err(ApiErr::BadRequest(e.to_string())),
        Err(RegisterError::Other(e)) => Err(ApiErr::Internal(e)),
    }
}

/// POST /api/verify — run the duplicate checks without appending.
async fn verify(
    State(st): State<AppState>,
    Json(req): Json<VerifyReq>,
) -> Result<Json<VerifyResp>, ApiErr> {
    let raw = decode_image_b64(&req.image_b64)?;

    let snapshot = st.ledger.lock().unwrap().clone();
    let gate = st.gate.clone();
    let res = tokio::task::spawn_blocking(move || gate.check_duplicate(&raw, &snapshot))
        .await
        .map_err(|e| ApiErr::internal(anyhow::anyhow!("task join error: {e}")))?;

    match res {
        Ok(Some(dup)) => Ok(Json(VerifyResp {
            duplicate: true,
            exact: Some(dup.is_exact()),
            matched: Some(dup.block().clone()),
        })),
        Ok(None) => Ok(Json(VerifyResp {
            duplicate: false,
            exact: None,
            matched: None,
        })),
        Err(e) => Err(ApiErr::BadRequest(e.to_string())),
    }
}

/// GET /api/validate — whole-chain integrity check.
async fn validate(State(st): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = st.ledger.lock().unwrap().clone();
    let length = snapshot.len();
    let valid = tokio::task::spawn_blocking(move || snapshot.validate())
        .await
        .unwrap_or(false);
    Json(json!({ "valid": valid, "length": length }))
}

/// GET /api/chain — full block list for provenance display.
async fn chain(State(st): State<AppState>) -> Json<Vec<Block>> {
    let snapshot = st.ledger.lock().unwrap().clone();
    Json(snapshot.blocks().to_vec())
}

/// GET /images/{name} — serve a stored normalized artifact. The store
/// rejects anything that is not a plain file name.
async fn get_image(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.gate.store().retrieve(&name) {
        Some(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "image not found").into_response(),
    }
}

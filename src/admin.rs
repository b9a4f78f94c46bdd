//! Admin routes. Grounded on `fritztv/src/lib.rs`'s flat route-table style
//! for the handlers themselves, and on `zijiren233-synctv`'s
//! `synctv-api/src/http/middleware.rs` `AuthUser` extractor for the
//! bearer-token guard — here verifying a real HS256 signature via
//! `jsonwebtoken` rather than hand-decoding the payload.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::metadata::MediaKind;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Authorizes a request against `AdminConfig`'s `jwt_secret`/`admin_user`.
/// Rejects with [`AppError::PermissionDenied`] on any missing header,
/// malformed token, bad signature, or `sub` mismatch, and with
/// [`AppError::Unavailable`] if admin auth isn't configured at all.
pub struct AdminAuth;

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let admin = &state.config.admin;
        let (Some(secret), Some(admin_user)) = (&admin.jwt_secret, &admin.admin_user) else {
            return Err(AppError::Unavailable);
        };

        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::PermissionDenied)?;
        let token = header_value.strip_prefix("Bearer ").ok_or(AppError::PermissionDenied)?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::PermissionDenied)?;

        if &data.claims.sub != admin_user {
            return Err(AppError::PermissionDenied);
        }
        Ok(AdminAuth)
    }
}

#[derive(Debug, Deserialize)]
struct FixRequest {
    tmdb_id: u64,
    #[serde(rename = "type")]
    kind: Option<MediaKind>,
}

/// `POST /admin/metadata/{id}/fix` — force-assigns a tmdb id and triggers an
/// immediate refetch, bypassing the usual filename-driven search.
async fn fix_metadata(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
    _auth: AdminAuth,
    Json(body): Json<FixRequest>,
) -> AppResult<StatusCode> {
    let mut record = app
        .metadata_store
        .load(file_id)
        .await?
        .ok_or(AppError::NotFound)?;
    record.manual_tmdb_id = Some(body.tmdb_id);
    if let Some(kind) = body.kind {
        record.kind = kind;
    }
    record.needs_refetch = true;
    let file_name = record.file_name.clone();
    app.metadata_store.save(&record).await?;

    info!(file_id, tmdb_id = body.tmdb_id, "admin fix: forcing refetch");
    let worker = app.worker.clone();
    tokio::spawn(async move { worker.process_batch(vec![(file_id, file_name)]).await });
    Ok(StatusCode::ACCEPTED)
}

/// `POST /admin/metadata/{id}/refetch` — refetches using whatever `tmdb_id`
/// the record already carries (movies only; a TV episode's id is derived
/// from its show group, so this just re-runs the usual lookup).
async fn refetch_metadata(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
    _auth: AdminAuth,
) -> AppResult<StatusCode> {
    let mut record = app
        .metadata_store
        .load(file_id)
        .await?
        .ok_or(AppError::NotFound)?;
    record.needs_refetch = true;
    let file_name = record.file_name.clone();
    app.metadata_store.save(&record).await?;

    info!(file_id, "admin refetch requested");
    let worker = app.worker.clone();
    tokio::spawn(async move { worker.process_batch(vec![(file_id, file_name)]).await });
    Ok(StatusCode::ACCEPTED)
}

/// `POST /admin/sync-telegram` — forces one full channel scan outside the
/// regular interval.
async fn sync_now(State(app): State<Arc<AppState>>, _auth: AdminAuth) -> AppResult<Json<serde_json::Value>> {
    let changed = app.sync_loop.force_full_scan().await?;
    Ok(Json(serde_json::json!({ "changed": changed })))
}

/// `POST /admin/rebuild-tv-caches` — forces a show-aggregate cache rebuild.
async fn rebuild_tv_caches(State(app): State<Arc<AppState>>, _auth: AdminAuth) -> AppResult<StatusCode> {
    app.metadata_store.rebuild_show_cache().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct WorkerStatus {
    paused: bool,
    active_sessions: usize,
    active_transcodes: usize,
}

/// `GET /admin/worker-status`.
async fn worker_status(State(app): State<Arc<AppState>>, _auth: AdminAuth) -> Json<WorkerStatus> {
    Json(WorkerStatus {
        paused: app.activity.is_paused().await,
        active_sessions: app.activity.session_count().await,
        active_transcodes: app.transcode.active_count().await,
    })
}

/// `POST /admin/worker/pause` and `POST /admin/worker/resume`.
async fn worker_control(
    State(app): State<Arc<AppState>>,
    Path(action): Path<String>,
    _auth: AdminAuth,
) -> AppResult<StatusCode> {
    match action.as_str() {
        "pause" => {
            app.activity.force_pause().await;
            Ok(StatusCode::NO_CONTENT)
        }
        "resume" => {
            app.activity.force_resume().await;
            Ok(StatusCode::NO_CONTENT)
        }
        other => {
            warn!(action = other, "unknown worker control action");
            Err(AppError::BadRequest(format!("unknown action: {other}")))
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/metadata/{id}/fix", post(fix_metadata))
        .route("/admin/metadata/{id}/refetch", post(refetch_metadata))
        .route("/admin/sync-telegram", post(sync_now))
        .route("/admin/rebuild-tv-caches", post(rebuild_tv_caches))
        .route("/admin/worker-status", get(worker_status))
        .route("/admin/worker/{action}", post(worker_control))
}

//! HTTP + JSON surface. Every route is scoped to the organization named by the
//! `x-organization-id` header, which maps onto one tenant engine.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequestParts, MatchedPath, Path, Query, Request};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower::limit::GlobalConcurrencyLimitLayer;
use tracing::Instrument;
use ulid::Ulid;

use crate::engine::{
    ConflictView, CreateScheduleEntry, Engine, EntryFilter, ResolvedFilter, ScheduleError,
};
use crate::index::Scope;
use crate::model::*;
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::tenant::{TenantError, TenantManager};

pub const ORG_HEADER: &str = "x-organization-id";

pub struct AppState {
    pub tenants: Arc<TenantManager>,
}

pub fn router(tenants: Arc<TenantManager>, max_connections: usize) -> Router {
    let state = Arc::new(AppState { tenants });
    Router::new()
        .route("/schedule-entries", post(create_entries).get(list_entries))
        .route("/schedule-entries/{id}", get(get_entry).delete(archive_entry))
        .route("/schedule-entries/{id}/conflicts", get(entry_conflicts))
        .route("/schedule-series/{id}", get(series_entries).delete(archive_series))
        .route("/schedule-conflicts", get(list_conflicts))
        .route("/schedule-conflicts/{id}", get(get_conflict).patch(patch_conflict))
        .route("/catalog/{kind}/{id}", put(put_catalog))
        .route_layer(middleware::from_fn(track_metrics))
        .route("/health", get(health))
        .layer(GlobalConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub ScheduleError);

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
struct ConflictBody {
    message: String,
    conflict_tags: Vec<ConflictTag>,
    conflicting_schedule_entry_id: Ulid,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        match self.0 {
            ScheduleError::Conflict {
                message,
                tags,
                conflicting_entry_id,
            } => (
                StatusCode::CONFLICT,
                Json(ConflictBody {
                    message,
                    conflict_tags: tags.into_iter().collect(),
                    conflicting_schedule_entry_id: conflicting_entry_id,
                }),
            )
                .into_response(),
            ScheduleError::Validation(_) => (StatusCode::BAD_REQUEST, Json(ErrorBody { message })).into_response(),
            ScheduleError::NotFound { .. } => (StatusCode::NOT_FOUND, Json(ErrorBody { message })).into_response(),
            ScheduleError::LimitExceeded(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorBody { message })).into_response()
            }
            ScheduleError::Storage(_) => {
                tracing::error!("{message}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { message })).into_response()
            }
        }
    }
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError(ScheduleError::validation(rejection.body_text()))
}

fn bad_path(rejection: PathRejection) -> ApiError {
    ApiError(ScheduleError::validation(rejection.body_text()))
}

fn bad_query(rejection: QueryRejection) -> ApiError {
    ApiError(ScheduleError::validation(rejection.body_text()))
}

// ── Organization scope ───────────────────────────────────

/// The caller's organization and its engine.
pub struct Org {
    pub name: String,
    pub engine: Arc<Engine>,
}

impl FromRequestParts<Arc<AppState>> for Org {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let name = parts
            .headers
            .get(ORG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScheduleError::validation(format!("missing {ORG_HEADER} header")))?
            .to_string();

        let engine = state.tenants.get_or_create(&name).map_err(|e| match e {
            TenantError::InvalidName(_) => ScheduleError::validation(e.to_string()),
            TenantError::TooMany => ScheduleError::limit(e.to_string()),
            TenantError::Io(_) => ScheduleError::Storage(e.to_string()),
        })?;
        Ok(Org { name, engine })
    }
}

// ── Metrics ──────────────────────────────────────────────

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route).record(start.elapsed().as_secs_f64());
    response
}

// ── Schedule entries ─────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub entry: ScheduleEntry,
    pub series_entry_ids: Vec<Ulid>,
    pub conflicts: Vec<ScheduleConflict>,
}

async fn create_entries(
    org: Org,
    body: Result<Json<CreateScheduleEntry>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let Json(req) = body.map_err(bad_json)?;
    let span = tracing::debug_span!("create_schedule_entries", org = %org.name);
    let created = org.engine.create_schedule_entries(req).instrument(span).await?;

    let series_entry_ids = created.series_entry_ids();
    let entry = created
        .entries
        .into_iter()
        .next()
        .ok_or_else(|| ScheduleError::Storage("creation produced no entries".into()))?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            entry,
            series_entry_ids,
            conflicts: created.conflicts,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListEntriesQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub tutor_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
    #[serde(default)]
    pub include_archived: bool,
}

async fn list_entries(
    org: Org,
    query: Result<Query<ListEntriesQuery>, QueryRejection>,
) -> Result<Json<Vec<ScheduleEntry>>, ApiError> {
    let Query(q) = query.map_err(bad_query)?;
    if q.from >= q.to {
        return Err(ScheduleError::validation("from must be before to").into());
    }
    let filter = EntryFilter {
        window: Span::new(q.from.timestamp_millis(), q.to.timestamp_millis()),
        scope: Scope {
            tutor_id: q.tutor_id,
            room_ids: q.room_id.into_iter().collect(),
            location_id: q.location_id,
        },
        include_archived: q.include_archived,
    };
    Ok(Json(org.engine.list_entries(&filter).await?))
}

async fn get_entry(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    Ok(Json(org.engine.get_entry(id).await?))
}

async fn archive_entry(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    Ok(Json(org.engine.archive_entry(id).await?))
}

async fn entry_conflicts(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<Vec<ScheduleConflict>>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    Ok(Json(org.engine.conflicts_for_entry(id).await?))
}

async fn series_entries(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<Vec<ScheduleEntry>>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    Ok(Json(org.engine.series_entries(id).await?))
}

#[derive(Debug, Serialize)]
pub struct ArchivedResponse {
    pub archived: usize,
}

async fn archive_series(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<ArchivedResponse>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    let archived = org.engine.archive_series(id).await?;
    Ok(Json(ArchivedResponse { archived }))
}

// ── Conflicts ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListConflictsQuery {
    pub resolved: Option<String>,
    #[serde(default)]
    pub hydrate: bool,
}

async fn list_conflicts(
    org: Org,
    query: Result<Query<ListConflictsQuery>, QueryRejection>,
) -> Result<Json<Vec<ConflictView>>, ApiError> {
    let Query(q) = query.map_err(bad_query)?;
    let filter = match q.resolved.as_deref() {
        Some(s) => ResolvedFilter::parse(s)?,
        None => ResolvedFilter::default(),
    };
    Ok(Json(org.engine.list_conflicts(filter, q.hydrate).await))
}

async fn get_conflict(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<ScheduleConflict>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    Ok(Json(org.engine.get_conflict(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchConflict {
    pub resolved: bool,
}

async fn patch_conflict(
    org: Org,
    id: Result<Path<Ulid>, PathRejection>,
    body: Result<Json<PatchConflict>, JsonRejection>,
) -> Result<Json<ScheduleConflict>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    let Json(patch) = body.map_err(bad_json)?;
    Ok(Json(org.engine.set_conflict_resolved(id, patch.resolved).await?))
}

// ── Catalog feed ─────────────────────────────────────────

/// Catalog record as pushed by the entity store. Which fields apply depends on the kind.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogBody {
    pub name: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Locations only; defaults to in-person.
    pub kind: Option<LocationKind>,
    /// Rooms only.
    pub location_id: Option<Ulid>,
    /// Services only; defaults to 1.
    pub capacity: Option<u32>,
    /// Services only; defaults to 0.
    pub buffer_minutes: Option<u32>,
    /// Topics only.
    pub subject_id: Option<Ulid>,
}

impl CatalogBody {
    fn into_record(self, kind: CatalogKind, id: Ulid) -> Result<CatalogEntry, ScheduleError> {
        let detail = match kind {
            CatalogKind::Location => CatalogDetail::Location {
                kind: self.kind.unwrap_or(LocationKind::InPerson),
            },
            CatalogKind::Room => CatalogDetail::Room {
                location_id: self
                    .location_id
                    .ok_or_else(|| ScheduleError::validation("rooms need a location_id"))?,
            },
            CatalogKind::Tutor => CatalogDetail::Tutor,
            CatalogKind::Service => CatalogDetail::Service {
                capacity: self.capacity.unwrap_or(1),
                buffer_minutes: self.buffer_minutes.unwrap_or(0),
            },
            CatalogKind::Subject => CatalogDetail::Subject,
            CatalogKind::Topic => CatalogDetail::Topic {
                subject_id: self.subject_id,
            },
            CatalogKind::Student => CatalogDetail::Student,
        };
        Ok(CatalogEntry {
            id,
            name: self.name,
            archived_at: self.archived_at,
            detail,
        })
    }
}

async fn put_catalog(
    org: Org,
    path: Result<Path<(String, Ulid)>, PathRejection>,
    body: Result<Json<CatalogBody>, JsonRejection>,
) -> Result<Json<CatalogEntry>, ApiError> {
    let Path((kind, id)) = path.map_err(bad_path)?;
    let kind = CatalogKind::parse(&kind)
        .ok_or_else(|| ScheduleError::validation(format!("unknown catalog kind: {kind}")))?;
    let Json(body) = body.map_err(bad_json)?;
    let record = body.into_record(kind, id)?;
    Ok(Json(org.engine.upsert_catalog(record).await?))
}

// ── Health ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}

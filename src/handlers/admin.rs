//! Admin API: manual blocking, audit log queries, failed-login ingestion.
//!
//! Mounted under `/admin` only when `ADMIN_API_KEY` is set, behind
//! [`AdminAuth`](crate::middleware::AdminAuth).

use axum::Json;
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::StatusCode;
use chrono::Duration as ChronoDuration;
use tracing::{info, instrument};

use crate::access::{BlockRequest, FailedLoginAttempt};
use crate::error::{AppError, AppResult};
use crate::models::{
    BlockAddressRequest, BlockAddressResponse, BlockedBy, BlockedListQuery, BlockedListResponse,
    EventsQuery, EventsResponse, FailedLoginReport, FailedLoginResponse, UnblockResponse,
};
use crate::persistence::{EventQuery, with_timeout};
use crate::state::AppState;
use crate::validation::{
    validate_address, validate_block_minutes, validate_context, validate_event_type,
    validate_limit, validate_reason,
};

/// JSON body whose rejections use the API's `{error, message}` shape.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct AdminJson<T>(pub T);

/// List stored block entries, newest first.
#[instrument(skip(state))]
pub async fn list_blocked(
    State(state): State<AppState>,
    Query(query): Query<BlockedListQuery>,
) -> AppResult<Json<BlockedListResponse>> {
    let limit = validate_limit(query.limit)?;
    let entries = state.registry.list(Some(limit)).await?;

    Ok(Json(BlockedListResponse {
        count: entries.len(),
        entries,
    }))
}

/// Block an address by hand.
///
/// Returns 201 when a new entry was created, 200 when the address was
/// already blocked (the existing entry is returned unchanged).
#[instrument(skip(state, request), fields(address = %request.address))]
pub async fn block_address(
    State(state): State<AppState>,
    AdminJson(request): AdminJson<BlockAddressRequest>,
) -> AppResult<(StatusCode, Json<BlockAddressResponse>)> {
    let address = validate_address(&request.address)?;
    validate_reason(&request.reason)?;
    validate_block_minutes(request.duration_minutes)?;

    let mut block = BlockRequest::new(address, request.reason.trim(), BlockedBy::ManualAdmin);
    if let Some(minutes) = request.duration_minutes {
        block = block.for_duration(ChronoDuration::minutes(i64::from(minutes)));
    }

    let outcome = state.registry.block(block).await;
    if let Some(e) = outcome.error {
        return Err(AppError::Persistence(e));
    }

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(BlockAddressResponse {
            entry: outcome.entry,
            created: outcome.created,
            audit_recorded: outcome.audit.is_written(),
        }),
    ))
}

/// Lift the block on an address.
#[instrument(skip(state))]
pub async fn unblock_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> AppResult<Json<UnblockResponse>> {
    let address = validate_address(&address)?;

    let (removed, _audit) = state.registry.unblock(&address).await?;
    if !removed {
        return Err(AppError::NotFound(format!("No block found for {address}")));
    }

    Ok(Json(UnblockResponse {
        address,
        unblocked: true,
        timestamp: state.clock.now(),
    }))
}

/// Query the audit log.
#[instrument(skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<EventsResponse>> {
    let mut filter = EventQuery::default().limit(validate_limit(query.limit)?);
    if let Some(address) = query.address.as_deref() {
        filter.address = Some(validate_address(address)?);
    }
    if let Some(event_type) = query.event_type.as_deref() {
        filter = filter.of_type(validate_event_type(event_type)?);
    }

    let events = with_timeout(
        state.config.persistence_timeout,
        state.gateway.list_events(&filter),
    )
    .await?;

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// Ingest a failed login observed by one of the products.
#[instrument(skip(state, report), fields(address = %report.address))]
pub async fn report_failed_login(
    State(state): State<AppState>,
    AdminJson(report): AdminJson<FailedLoginReport>,
) -> AppResult<Json<FailedLoginResponse>> {
    let address = validate_address(&report.address)?;
    validate_context("user_agent", report.user_agent.as_deref())?;
    validate_context("endpoint", report.endpoint.as_deref())?;
    validate_context("username", report.username.as_deref())?;
    validate_context("source", report.source.as_deref())?;

    let verdict = state
        .failed_logins
        .report(FailedLoginAttempt {
            address: address.clone(),
            user_agent: report.user_agent,
            endpoint: report.endpoint,
            username: report.username,
            source: report.source,
        })
        .await?;

    if verdict.blocked {
        info!(address = %address, attempts = verdict.recent_attempts, "Failed-login report triggered a block");
    }

    Ok(Json(FailedLoginResponse {
        address,
        recent_attempts: verdict.recent_attempts,
        threshold: state.failed_logins.policy().threshold,
        blocked: verdict.blocked,
    }))
}

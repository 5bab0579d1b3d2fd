//! Security overview for the dashboard, and the `/api` status probe.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::access::SIGNATURE_SET_VERSION;
use crate::error::AppResult;
use crate::models::{ApiStatusResponse, SecurityOverview};
use crate::persistence::{EventQuery, with_timeout};
use crate::state::AppState;

/// Block rows considered when counting active blocks.
const OVERVIEW_BLOCK_SCAN: u32 = 500;

const OVERVIEW_RECENT_EVENTS: u32 = 20;

/// Active block counts and the most recent audit events.
///
/// Expired rows that have not been lazily removed yet are not counted.
#[instrument(skip(state))]
pub async fn dashboard_overview(State(state): State<AppState>) -> AppResult<Json<SecurityOverview>> {
    let now = state.clock.now();
    let entries = state.registry.list(Some(OVERVIEW_BLOCK_SCAN)).await?;
    let (permanent_blocks, temporary_blocks) = entries
        .iter()
        .filter(|entry| !entry.is_expired(now))
        .fold((0, 0), |(permanent, temporary), entry| {
            if entry.is_permanent {
                (permanent + 1, temporary)
            } else {
                (permanent, temporary + 1)
            }
        });

    let recent_events = with_timeout(
        state.config.persistence_timeout,
        state
            .gateway
            .list_events(&EventQuery::default().limit(OVERVIEW_RECENT_EVENTS)),
    )
    .await?;

    Ok(Json(SecurityOverview {
        active_blocks: permanent_blocks + temporary_blocks,
        permanent_blocks,
        temporary_blocks,
        recent_events,
        signature_set_version: SIGNATURE_SET_VERSION,
        generated_at: now,
    }))
}

#[instrument]
pub async fn api_status() -> Json<ApiStatusResponse> {
    Json(ApiStatusResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

mod api;
mod security;

pub use api::{
    ApiStatusResponse, BlockAddressRequest, BlockAddressResponse, BlockedListQuery, BlockedListResponse,
    EventsQuery, EventsResponse, FailedLoginReport, FailedLoginResponse, HealthResponse,
    SecurityOverview, UnblockResponse,
};
pub use security::{BlockedBy, BlockedEntry, EventType, SecurityEvent, Severity};

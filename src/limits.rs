use crate::model::Ms;

/// Hard cap on occurrences produced by one recurring request.
pub const MAX_OCCURRENCES_PER_SERIES: usize = 500;

pub const MAX_RECURRENCE_INTERVAL: u32 = 365;
pub const MAX_SESSION_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
pub const MAX_ROOMS_PER_ENTRY: usize = 32;
pub const MAX_ATTENDEES_PER_ENTRY: usize = 1_000;
pub const MAX_LOCATION_DETAIL_LEN: usize = 2_048;
pub const MAX_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest window accepted by entry listing.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Largest encoded WAL record; longer length prefixes are treated as damage.
pub const MAX_WAL_RECORD_BYTES: usize = 16 * 1024 * 1024;

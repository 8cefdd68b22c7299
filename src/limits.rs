use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_PROFESSIONALS_PER_TENANT: usize = 100_000;
pub const MAX_SERVICES_PER_TENANT: usize = 1_000_000;
pub const MAX_BLOCKS_PER_PROFESSIONAL: usize = 10_000;
pub const MAX_RESERVATIONS_PER_PROFESSIONAL: usize = 1_000_000;
pub const MAX_WINDOWS_PER_DAY: usize = 48;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_SEARCH_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SERVICE_DURATION_MS: Ms = DAY_MS;

pub const MAX_LIST_ROWS: usize = 100;
pub const MAX_SUGGESTIONS: usize = 20;

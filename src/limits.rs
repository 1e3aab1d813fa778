//! Hard per-tenant limits. Requests exceeding them fail with `LimitExceeded`.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 50_000;
pub const MAX_CAPACITY: u32 = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SUBJECT_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

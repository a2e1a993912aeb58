/// Application name
pub const APP_NAME: &str = "G-Node";

/// API version reported in every JSON response header
pub const API_VERSION: &str = "1.0";

/// Default page size for list queries
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Database file name inside the data directory
pub const DATABASE_FILE_NAME: &str = "gnode.db";

/// Nesting limit for cascade expansion, on top of per-type exclusions
pub const MAX_CASCADE_DEPTH: usize = 8;

//! Default constants for devgraph configuration.

// =============================================================================
// Storage Defaults
// =============================================================================

/// Directory holding the file store when none is configured.
pub const DEFAULT_DATA_DIR: &str = "./devgraph-data";

// =============================================================================
// Discovery Defaults
// =============================================================================

/// Redfish service root. Member links under it are stored relative to it.
pub const DEFAULT_SERVICE_ROOT: &str = "/redfish/v1";

// =============================================================================
// Logging Defaults
// =============================================================================

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Prefix of environment variables read by the config loader.
pub const ENV_PREFIX: &str = "DEVGRAPH_";

/// Minimum number of settings that a config file must have.
pub const MIN_SETTINGS: usize = 16;

pub const TCP_PORT: &str = "TCP_PORT";
pub const DOWNLOAD_DIRECTORY: &str = "DOWNLOAD_DIRECTORY";
pub const SESSION_DIRECTORY: &str = "SESSION_DIRECTORY";
pub const MAX_CONNECTIONS: &str = "MAX_CONNECTIONS";
pub const MAX_PEERS_PER_TORRENT: &str = "MAX_PEERS_PER_TORRENT";
pub const PIPELINING_SIZE: &str = "PIPELINING_SIZE";
pub const REQUEST_TIMEOUT_SECONDS: &str = "REQUEST_TIMEOUT_SECONDS";
pub const READ_WRITE_SECONDS_TIMEOUT: &str = "READ_WRITE_SECONDS_TIMEOUT";
pub const MAINTENANCE_MIN_SECONDS: &str = "MAINTENANCE_MIN_SECONDS";
pub const MAINTENANCE_BASE_SECONDS: &str = "MAINTENANCE_BASE_SECONDS";
pub const MAINTENANCE_MAX_SECONDS: &str = "MAINTENANCE_MAX_SECONDS";
pub const DHT_ENABLED: &str = "DHT_ENABLED";
pub const DHT_PORT: &str = "DHT_PORT";
pub const ENCRYPTION_POLICY: &str = "ENCRYPTION_POLICY";
pub const UPLOAD_RATE_KBPS: &str = "UPLOAD_RATE_KBPS";
pub const DOWNLOAD_RATE_KBPS: &str = "DOWNLOAD_RATE_KBPS";

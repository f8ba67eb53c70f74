use std::time::Duration;

pub(crate) const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
pub(crate) const PEER_QUEUE_DEPTH: usize = 64;
pub(crate) const MAX_STALE_TIP_RETRIES: usize = 3;

pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_P2P_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_DISCOVERY_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

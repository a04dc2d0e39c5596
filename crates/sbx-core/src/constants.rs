//! Protocol and configuration constants for sbx.

use std::time::Duration;

// =============================================================================
// Packet Geometry
// =============================================================================

/// Length of a packet's message identifier, in bytes.
pub const PACKET_ID_SIZE: usize = 16;

/// Length of each of the two address fields (total, sequence), in bytes.
pub const PACKET_ADDR_SIZE: usize = 8;

/// Length of a packet's payload, in bytes.
pub const PACKET_DATA_SIZE: usize = 1024;

/// Total on-wire size of one packet frame.
pub const PACKET_TOTAL_SIZE: usize = PACKET_ID_SIZE + 2 * PACKET_ADDR_SIZE + PACKET_DATA_SIZE;

// =============================================================================
// Message Framing
// =============================================================================

/// Prefix byte marking a reassembled message as a request.
pub const REQUEST_PREFIX: u8 = b'q';

/// Prefix byte marking a reassembled message as a response.
pub const RESPONSE_PREFIX: u8 = b's';

/// Trailing delimiter byte on every message; stripped on receive.
pub const BYTE_DELIM: u8 = 0x04;

// =============================================================================
// Envelope Literals
// =============================================================================

pub const TYPE_IDENTITY: &str = "IDENTITY";
pub const TYPE_DIGEST: &str = "DIGEST";
pub const TYPE_SYNC_REQUEST: &str = "SYNC-REQUEST";
pub const TYPE_FILE: &str = "FILE";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD: u16 = 400;

pub const MESSAGE_ACCEPT: &str = "ACCEPT";
pub const MESSAGE_DENY: &str = "DENY";

/// Identity triple presented on server-initiated requests.
pub const SERVER_USERNAME: &str = "SB-SERVER";
pub const SERVER_PASSWORD: &str = "SB-SERVER-PWD";
pub const SERVER_DEVICE: &str = "SB-SERVER-DEVICE";

// =============================================================================
// Digest Persistence
// =============================================================================

/// File name of the persisted tree snapshot, both in the watched root on the
/// client and as the per-user object key on the server. Excluded from tree
/// traversal so the digest never checksums itself.
pub const DIGEST_FILE_NAME: &str = ".sb-digest.json";

// =============================================================================
// Network
// =============================================================================

pub const DEFAULT_SERVER_PORT: u16 = 8000;
pub const ANY_ADDR: &str = "0.0.0.0";

pub const ENV_SERVER_HOST: &str = "SB_SERVER_HOST";
pub const ENV_DB_USER: &str = "SB_DB_USER";
pub const ENV_DB_PWD: &str = "SB_DB_PWD";
pub const ENV_DB_HOST: &str = "SB_DB_HOST";
pub const ENV_DB_PORT: &str = "SB_DB_PORT";
pub const ENV_DB_DATABASE: &str = "SB_DB_DATABASE";
pub const ENV_STORAGE_BUCKET_PREFIX: &str = "SB_STORAGE_BUCHET";

// =============================================================================
// Timing
// =============================================================================

/// How long `send_request_for_response` waits before giving up.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between client directory scans.
pub const SCAN_PERIOD: Duration = Duration::from_secs(2);

/// Default attempt budget for outgoing sends.
pub const RETRY_ATTEMPTS: u32 = 10;

/// Pause between retry attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Reassembly Progress
// =============================================================================

/// Messages spanning more than this many packets get progress logging.
pub const PROGRESS_PACKET_THRESHOLD: usize = 10_000;

/// Progress is reported every this many percent.
pub const PROGRESS_STEP_PERCENT: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_frame_is_1056_bytes() {
        assert_eq!(PACKET_TOTAL_SIZE, 1056);
    }

    #[test]
    fn prefixes_are_ascii_q_and_s() {
        assert_eq!(REQUEST_PREFIX, 0x71);
        assert_eq!(RESPONSE_PREFIX, 0x73);
        assert_eq!(BYTE_DELIM, 4);
    }

    #[test]
    fn retry_budget_outlasts_one_response_timeout() {
        assert!(RETRY_ATTEMPTS as u64 * RETRY_DELAY.as_secs() >= RESPONSE_TIMEOUT.as_secs());
    }
}

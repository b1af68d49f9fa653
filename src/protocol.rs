//! Shared protocol constants for the Syncbox framed transport

use chrono::{DateTime, TimeZone, Utc};

// Maximum frame body size. The reference sizing is one MTU-ish buffer;
// it bounds memory per connection, nothing else depends on it.
pub const MAX_FRAME_SIZE: usize = 1500;

// Payload bytes per DataChunk frame, leaving room for the kind tag.
pub const DATA_CHUNK_SIZE: usize = 1024;

// A local filesystem event observed within this many seconds of a completed
// download is treated as the engine's own write and ignored.
pub const ECHO_GRACE_SECS: i64 = 3;

// Message kind tags (keep numeric values stable on the wire)
pub mod kind {
    pub const INVALID: u8 = 1;
    pub const LOGIN: u8 = 2;
    pub const UPLOAD: u8 = 3;
    pub const FILE_UPDATE: u8 = 4;
    pub const DOWNLOAD: u8 = 5;
    pub const DELETE: u8 = 6;
    pub const END: u8 = 7;
    pub const LIST: u8 = 8;
    pub const SUBSCRIBE: u8 = 9;
    pub const FILE_INFO: u8 = 10;
    pub const DATA: u8 = 11;
    pub const RESPONSE: u8 = 12;
    pub const START: u8 = 13;
    pub const FILE_DELETE: u8 = 14;
}

// Wire timestamps are fixed-width so payloads can embed them ahead of a
// filename even though the rendering itself contains ':'.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const TIMESTAMP_LEN: usize = 19;

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Current time truncated to the wire precision (whole seconds), so
/// timestamps survive an encode/decode round trip unchanged.
pub fn now() -> DateTime<Utc> {
    match Utc.timestamp_opt(Utc::now().timestamp(), 0) {
        chrono::LocalResult::Single(ts) => ts,
        _ => Utc::now(),
    }
}

/// Filenames travel inside frames and land directly under a per-user
/// directory; reject anything empty or that could escape it.
pub fn is_filename_valid(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.contains('\0')
        && filename != "."
        && filename != ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip_is_lossless() {
        let ts = now();
        let rendered = format_timestamp(ts);
        assert_eq!(rendered.len(), TIMESTAMP_LEN);
        assert_eq!(parse_timestamp(&rendered), Some(ts));
    }

    #[test]
    fn rejects_unsafe_filenames() {
        assert!(is_filename_valid("report.txt"));
        assert!(is_filename_valid("weird name.tar.gz"));
        assert!(!is_filename_valid(""));
        assert!(!is_filename_valid("a/b.txt"));
        assert!(!is_filename_valid(".."));
        assert!(!is_filename_valid("nul\0byte"));
    }
}

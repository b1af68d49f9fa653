//! Typed protocol messages and the `"<kindTag>:<payload>"` frame-body codec.
//!
//! Decoding is total: an empty body is `Empty`, anything unrecognized or
//! malformed is `Invalid`. A bad frame must never take the connection down;
//! the phase logic decides what to do with it.

use chrono::{DateTime, Utc};

use crate::protocol::{
    format_timestamp, is_filename_valid, kind, parse_timestamp, TIMESTAMP_LEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Invalid = 0,
    Ok = 1,
    FileNotFound = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame; also what a peer observes at end-of-stream.
    Empty,
    Invalid,
    Login { username: String },
    Upload { filename: String },
    Download { filename: String },
    Delete { filename: String },
    End,
    List,
    Subscribe,
    FileInfo {
        filename: String,
        mtime: DateTime<Utc>,
        atime: DateTime<Utc>,
        ctime: DateTime<Utc>,
    },
    FileUpdate { filename: String, timestamp: DateTime<Utc> },
    FileDelete { filename: String, timestamp: DateTime<Utc> },
    Data(Vec<u8>),
    Response(ResponseCode),
    Start,
}

impl Message {
    pub fn ok() -> Message {
        Message::Response(ResponseCode::Ok)
    }

    pub fn not_found() -> Message {
        Message::Response(ResponseCode::FileNotFound)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Message::Response(ResponseCode::Ok))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Empty => "Empty",
            Message::Invalid => "Invalid",
            Message::Login { .. } => "Login",
            Message::Upload { .. } => "Upload",
            Message::Download { .. } => "Download",
            Message::Delete { .. } => "Delete",
            Message::End => "End",
            Message::List => "List",
            Message::Subscribe => "Subscribe",
            Message::FileInfo { .. } => "FileInfo",
            Message::FileUpdate { .. } => "FileUpdate",
            Message::FileDelete { .. } => "FileDelete",
            Message::Data(_) => "Data",
            Message::Response(_) => "Response",
            Message::Start => "Start",
        }
    }

    /// Render the frame body. `Empty` encodes to a zero-length body.
    pub fn encode(&self) -> Vec<u8> {
        fn tagged(tag: u8, payload: &str) -> Vec<u8> {
            format!("{tag}:{payload}").into_bytes()
        }

        match self {
            Message::Empty => Vec::new(),
            Message::Invalid => tagged(kind::INVALID, ""),
            Message::Login { username } => tagged(kind::LOGIN, username),
            Message::Upload { filename } => tagged(kind::UPLOAD, filename),
            Message::Download { filename } => tagged(kind::DOWNLOAD, filename),
            Message::Delete { filename } => tagged(kind::DELETE, filename),
            Message::End => tagged(kind::END, ""),
            Message::List => tagged(kind::LIST, ""),
            Message::Subscribe => tagged(kind::SUBSCRIBE, ""),
            Message::Start => tagged(kind::START, ""),
            Message::Response(code) => tagged(kind::RESPONSE, &format!("{}", *code as u8)),
            Message::FileUpdate { filename, timestamp } => tagged(
                kind::FILE_UPDATE,
                &format!("{}:{}", format_timestamp(*timestamp), filename),
            ),
            Message::FileDelete { filename, timestamp } => tagged(
                kind::FILE_DELETE,
                &format!("{}:{}", format_timestamp(*timestamp), filename),
            ),
            Message::FileInfo { filename, mtime, atime, ctime } => tagged(
                kind::FILE_INFO,
                &format!(
                    "{}:{}:{}:{}",
                    format_timestamp(*mtime),
                    format_timestamp(*atime),
                    format_timestamp(*ctime),
                    filename
                ),
            ),
            Message::Data(bytes) => {
                let mut body = format!("{}:", kind::DATA).into_bytes();
                body.extend_from_slice(bytes);
                body
            }
        }
    }

    /// Parse a frame body. Data payloads are raw bytes; everything else is
    /// UTF-8 text.
    pub fn decode(body: &[u8]) -> Message {
        if body.is_empty() {
            return Message::Empty;
        }

        let sep = match body.iter().position(|b| *b == b':') {
            Some(sep) => sep,
            None => return Message::Invalid,
        };
        let tag = match std::str::from_utf8(&body[..sep]).ok().and_then(|s| s.parse::<u8>().ok()) {
            Some(tag) => tag,
            None => return Message::Invalid,
        };
        let payload = &body[sep + 1..];

        if tag == kind::DATA {
            return Message::Data(payload.to_vec());
        }

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => return Message::Invalid,
        };

        match tag {
            kind::INVALID => Message::Invalid,
            kind::END => Message::End,
            kind::LIST => Message::List,
            kind::SUBSCRIBE => Message::Subscribe,
            kind::START => Message::Start,
            kind::LOGIN => {
                if is_filename_valid(text) {
                    Message::Login { username: text.to_string() }
                } else {
                    Message::Invalid
                }
            }
            kind::UPLOAD | kind::DOWNLOAD | kind::DELETE => {
                if !is_filename_valid(text) {
                    return Message::Invalid;
                }
                let filename = text.to_string();
                match tag {
                    kind::UPLOAD => Message::Upload { filename },
                    kind::DOWNLOAD => Message::Download { filename },
                    _ => Message::Delete { filename },
                }
            }
            kind::RESPONSE => match text.parse::<u8>() {
                Ok(1) => Message::Response(ResponseCode::Ok),
                Ok(2) => Message::Response(ResponseCode::FileNotFound),
                _ => Message::Response(ResponseCode::Invalid),
            },
            kind::FILE_UPDATE | kind::FILE_DELETE => {
                let (timestamp, filename) = match split_timestamped(text) {
                    Some(parts) => parts,
                    None => return Message::Invalid,
                };
                if tag == kind::FILE_UPDATE {
                    Message::FileUpdate { filename, timestamp }
                } else {
                    Message::FileDelete { filename, timestamp }
                }
            }
            kind::FILE_INFO => decode_file_info(text),
            _ => Message::Invalid,
        }
    }
}

/// Split `"<19-char timestamp>:<filename>"`. Timestamps contain ':' so the
/// layout is fixed-width rather than delimiter-based.
fn split_timestamped(text: &str) -> Option<(DateTime<Utc>, String)> {
    if text.len() <= TIMESTAMP_LEN + 1 {
        return None;
    }
    let timestamp = parse_timestamp(text.get(..TIMESTAMP_LEN)?)?;
    let filename = text.get(TIMESTAMP_LEN + 1..)?;
    if !is_filename_valid(filename) {
        return None;
    }
    Some((timestamp, filename.to_string()))
}

fn decode_file_info(text: &str) -> Message {
    let field = TIMESTAMP_LEN + 1;
    if text.len() <= 3 * field {
        return Message::Invalid;
    }
    let stamp = |slot: usize| {
        text.get(slot * field..slot * field + TIMESTAMP_LEN)
            .and_then(parse_timestamp)
    };
    let (mtime, atime, ctime) = match (stamp(0), stamp(1), stamp(2)) {
        (Some(m), Some(a), Some(c)) => (m, a, c),
        _ => return Message::Invalid,
    };
    // The separator slot may hold arbitrary bytes; a checked slice keeps a
    // char-boundary mismatch from panicking the decode.
    let filename = match text.get(3 * field..) {
        Some(name) => name,
        None => return Message::Invalid,
    };
    if !is_filename_valid(filename) {
        return Message::Invalid;
    }
    Message::FileInfo {
        filename: filename.to_string(),
        mtime,
        atime,
        ctime,
    }
}

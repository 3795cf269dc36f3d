//! Shared protocol constants for the pairsync framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"PSNC";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB) - a snapshot of a very large tree still fits
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the binary chunks a server streams for one regular file
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Separator of relative paths inside a path-list message
pub const PATH_DELIMITER: char = ';';

/// Request that tells a server task to stop serving
pub const SENTINEL: &[u8] = b":OK";

/// Reserved name of the per-root history file
pub const HISTORY_FILE: &str = ".pairsync";

/// Name prefix of the staging file a history save writes before renaming
pub const HISTORY_TEMP_PREFIX: &str = ".pairsync.tmp";

// Frame type IDs. Each lane of a connection has its own type so the reader
// can demultiplex without inspecting payloads.
pub mod frame {
    pub const CONTROL: u8 = 1;
    pub const LANE_1: u8 = 2;
    pub const LANE_2: u8 = 3;
    pub const CLOSE: u8 = 4;
}

/// Encode a path list as one delimiter-joined message. The empty list is the
/// empty payload.
pub fn encode_paths<S: AsRef<str>>(paths: &[S]) -> Vec<u8> {
    paths
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(&PATH_DELIMITER.to_string())
        .into_bytes()
}

pub fn decode_paths(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    String::from_utf8_lossy(data)
        .split(PATH_DELIMITER)
        .map(str::to_string)
        .collect()
}

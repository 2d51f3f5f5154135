use std::time::Duration;

/// Files above this size go to the temporary area.
pub const LARGE_FILE_THRESHOLD_BYTES: u64 = 30 * 1024 * 1024;
/// How long a temporary upload is kept before it is deleted.
pub const TEMPORARY_RETENTION: Duration = Duration::from_secs(10 * 24 * 60 * 60);
pub const DURABLE_PREFIX: &str = "files";
pub const TEMPORARY_PREFIX: &str = "temp-files";
const MAX_KEY_FILE_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePlacement {
    Durable,
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoute {
    pub path: String,
    pub placement: StoragePlacement,
}

impl StorageRoute {
    /// Retention after a successful upload, if the object is temporary.
    pub fn retention(&self) -> Option<Duration> {
        match self.placement {
            StoragePlacement::Durable => None,
            StoragePlacement::Temporary => Some(TEMPORARY_RETENTION),
        }
    }
}

pub fn placement_for_size(size_bytes: u64) -> StoragePlacement {
    if size_bytes > LARGE_FILE_THRESHOLD_BYTES {
        StoragePlacement::Temporary
    } else {
        StoragePlacement::Durable
    }
}

/// Pick the blob path for an upload: `{prefix}/{sender}/{epoch_ms}-{file_name}`.
pub fn route_upload(
    sender_id: &str,
    epoch_ms: u64,
    file_name: &str,
    size_bytes: u64,
) -> StorageRoute {
    let placement = placement_for_size(size_bytes);
    let prefix = match placement {
        StoragePlacement::Durable => DURABLE_PREFIX,
        StoragePlacement::Temporary => TEMPORARY_PREFIX,
    };
    StorageRoute {
        path: format!(
            "{prefix}/{}/{epoch_ms}-{}",
            sanitize_key_segment(sender_id),
            sanitize_key_segment(file_name)
        ),
        placement,
    }
}

/// Make a string safe to use as one segment of a blob path.
pub fn sanitize_key_segment(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "file.bin".to_owned();
    }
    let mut out: String = trimmed
        .chars()
        .map(|ch| {
            if matches!(ch, '/' | '\\' | '?' | '#') || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();
    if out.len() > MAX_KEY_FILE_NAME_LEN {
        let mut cut = MAX_KEY_FILE_NAME_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

//! File naming helpers: stem/extension split and collision-free names

use crate::engine::LEDGER_EXTENSION;
use crate::error::EngineError;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use tokio::fs;

/// Split a file name into (stem, extension) at the last interior dot.
///
/// A dot at the very start or end of the name is not a separator.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot < name.len() - 1 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    }
}

/// Candidate name number `index` for `stem`/`extension`
fn candidate(stem: &str, extension: &str, index: u32) -> String {
    if extension.is_empty() {
        format!("{} ({})", stem, index)
    } else {
        format!("{} ({}).{}", stem, index, extension)
    }
}

/// Generate a name like `"name (2).txt"` that no file or ledger in
/// `location` uses and that is not in `reserved`.
///
/// Probes `k = 0, 1, 2, ...` and gives up after `max_attempts` candidates.
pub async fn generate_unique_name(
    location: &Path,
    name: &str,
    reserved: &HashSet<String>,
    max_attempts: u32,
) -> Result<String, EngineError> {
    let metadata = match fs::metadata(location).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(EngineError::PermissionDenied(location.to_path_buf()))
        }
        Err(_) => return Err(EngineError::InvalidLocation(location.to_path_buf())),
    };
    if !metadata.is_dir() {
        return Err(EngineError::InvalidLocation(location.to_path_buf()));
    }

    let (stem, extension) = split_name(name);

    let mut existing = HashSet::new();
    let mut entries = fs::read_dir(location)
        .await
        .map_err(|e| EngineError::io_at(e, location))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::io_at(e, location))?
    {
        if let Some(file_name) = entry.file_name().to_str() {
            if file_name.starts_with(stem) {
                let output_name = file_name
                    .strip_suffix(LEDGER_EXTENSION)
                    .and_then(|rest| rest.strip_suffix('.'))
                    .unwrap_or(file_name);
                existing.insert(output_name.to_string());
            }
        }
    }

    (0..max_attempts)
        .map(|index| candidate(stem, extension, index))
        .find(|name| !existing.contains(name) && !reserved.contains(name))
        .ok_or_else(|| EngineError::TooManyCollisions {
            name: name.to_string(),
            attempts: max_attempts,
        })
}

/// Default file name for a URL: its last path segment, percent-decoded
pub fn filename_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .map(|name| name.replace(['/', '\\'], "_"))
        .unwrap_or_else(|| "download".to_string())
}

use std::path::{Component, Path};

use crate::TransferError;

/// Validates an upload path and returns it in wire form (`/a/b/c`).
///
/// The path is interpreted relative to the transfer's target folder; one
/// leading `/` is accepted. Rejects:
/// - Empty paths
/// - Absolute paths beyond the single leading `/`
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn normalize_upload_path(upload_path: &str) -> Result<String, TransferError> {
    let relative = upload_path.strip_prefix('/').unwrap_or(upload_path);
    let path = Path::new(relative);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {upload_path}"
        )));
    }

    let mut normalized = String::with_capacity(upload_path.len() + 1);
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {upload_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {upload_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {upload_path}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => {
                normalized.push('/');
                normalized.push_str(&part.to_string_lossy());
            }
        }
    }

    if normalized.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    Ok(normalized)
}

/// Normalizes a repository target folder: leading `/`, no trailing `/`.
///
/// The repository root is the empty string.
pub fn normalize_target_path(target_path: &str) -> String {
    let trimmed = target_path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

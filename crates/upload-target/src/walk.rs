//! Tree walking for upload.
//!
//! Flattens dropped items into a pre-order stream of entries. Directories
//! come before their contents and every child records the index of its
//! directory, so the enqueue step can wire up prerequisites without
//! holding the tree.

use std::path::{Path, PathBuf};

use bucketload_transfer::{Entry, TransferError, normalize_upload_path};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream;
use tracing::debug;

use crate::error::UploadError;

/// One top-level item handed to the uploader.
#[derive(Debug, Clone)]
pub enum DropItem {
    /// A file or directory on disk.
    Path(PathBuf),
    /// Named in-memory content.
    Bytes { name: String, data: Bytes },
}

/// A flattened entry of the dropped tree.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Normalized path inside the tree, `/dir/file.txt`.
    pub upload_path: String,
    pub entry: Entry,
    /// Index of the containing directory in the walk output.
    pub parent: Option<usize>,
}

struct Pending {
    item: DropItem,
    upload_path: String,
    parent: Option<usize>,
}

struct WalkState {
    stack: Vec<Pending>,
    emitted: usize,
}

/// Walks `items` in pre-order.
///
/// Directory children are visited in name order. Symlinks and special
/// files are skipped. Upload paths are validated as they are produced.
pub fn walk(items: Vec<DropItem>) -> impl Stream<Item = Result<TreeEntry, UploadError>> {
    let state = WalkState {
        stack: Vec::new(),
        emitted: 0,
    };

    stream::try_unfold(
        (state, Some(items)),
        |(mut state, roots)| async move {
            if let Some(items) = roots {
                for item in items.into_iter().rev() {
                    let name = match &item {
                        DropItem::Path(path) => file_name(path)?,
                        DropItem::Bytes { name, .. } => name.clone(),
                    };
                    state.stack.push(Pending {
                        item,
                        upload_path: format!("/{name}"),
                        parent: None,
                    });
                }
            }

            let next = next_entry(&mut state).await?;
            Ok(next.map(|entry| (entry, (state, None))))
        },
    )
}

async fn next_entry(state: &mut WalkState) -> Result<Option<TreeEntry>, UploadError> {
    while let Some(pending) = state.stack.pop() {
        let upload_path = normalize_upload_path(&pending.upload_path)?;

        let entry = match pending.item {
            DropItem::Bytes { name, data } => Entry::InMemory { name, data },
            DropItem::Path(path) => {
                let meta = tokio::fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    push_children(state, &path, &upload_path).await?;
                    Entry::Directory {
                        name: file_name(&path)?,
                    }
                } else if meta.is_file() {
                    Entry::File {
                        size: meta.len(),
                        path,
                    }
                } else {
                    debug!(path = %path.display(), "skipping non-regular file");
                    continue;
                }
            }
        };

        state.emitted += 1;
        return Ok(Some(TreeEntry {
            upload_path,
            entry,
            parent: pending.parent,
        }));
    }
    Ok(None)
}

/// Queues the children of `dir` so they are popped in name order, right
/// after the directory itself.
async fn push_children(state: &mut WalkState, dir: &Path, upload_path: &str) -> Result<(), UploadError> {
    let mut children = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    children.sort();

    let index = state.emitted;
    for child in children.into_iter().rev() {
        let name = file_name(&child)?;
        state.stack.push(Pending {
            item: DropItem::Path(child),
            upload_path: format!("{upload_path}/{name}"),
            parent: Some(index),
        });
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String, UploadError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()).into())
}

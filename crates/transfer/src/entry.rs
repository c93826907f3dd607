use std::path::PathBuf;

use bytes::Bytes;

use crate::service::TransferBody;

/// The content behind a [`FileTransfer`](crate::FileTransfer).
#[derive(Debug, Clone)]
pub enum Entry {
    /// Bytes already held in memory (picked or pasted content).
    InMemory { name: String, data: Bytes },
    /// A regular file on disk, read when the transfer starts.
    File { path: PathBuf, size: u64 },
    /// A directory placeholder. Transferred with an empty body.
    Directory { name: String },
}

impl Entry {
    /// Returns the last path component (or the in-memory name).
    pub fn name(&self) -> String {
        match self {
            Self::InMemory { name, .. } | Self::Directory { name } => name.clone(),
            Self::File { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// Returns `true` for directory placeholders.
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    /// Expected body size in bytes (0 for directories).
    pub fn size_hint(&self) -> u64 {
        match self {
            Self::InMemory { data, .. } => data.len() as u64,
            Self::File { size, .. } => *size,
            Self::Directory { .. } => 0,
        }
    }

    /// The body to send.
    ///
    /// File entries are described by path only; the transport opens and
    /// streams them when the request goes out.
    pub fn body(&self) -> TransferBody {
        match self {
            Self::InMemory { data, .. } => TransferBody::Bytes(data.clone()),
            Self::File { path, size } => TransferBody::File {
                path: path.clone(),
                size: *size,
            },
            Self::Directory { .. } => TransferBody::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_returns_data() {
        let entry = Entry::InMemory {
            name: "notes.txt".into(),
            data: Bytes::from_static(b"hello"),
        };
        assert_eq!(entry.size_hint(), 5);
        assert!(!entry.is_directory());
        match entry.body() {
            TransferBody::Bytes(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn file_entry_is_not_read_up_front() {
        // Nothing exists at this path; describing the body must not touch disk.
        let path = PathBuf::from("/nonexistent/scans/plate-01.tif");
        let entry = Entry::File {
            path: path.clone(),
            size: 3 << 30,
        };
        assert_eq!(entry.name(), "plate-01.tif");

        let body = entry.body();
        assert_eq!(body.len(), 3 << 30);
        assert!(matches!(body, TransferBody::File { path: p, .. } if p == path));
    }

    #[test]
    fn directory_has_empty_body() {
        let entry = Entry::Directory {
            name: "photos".into(),
        };
        assert!(entry.is_directory());
        assert_eq!(entry.size_hint(), 0);
        assert!(matches!(entry.body(), TransferBody::Empty));
        assert!(entry.body().is_empty());
    }
}

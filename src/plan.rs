use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Fallback outbound chunk size when the send-buffer probe fails.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Size marker for directory records on the wire.
pub const DIR_SIZE: i64 = -1;

static CHUNK_SIZE: OnceLock<usize> = OnceLock::new();

/// Outbound chunk size: the socket send-buffer size, probed once at
/// startup. Codec instances copy this at construction and may be
/// overridden individually.
pub fn chunk_size() -> usize {
    *CHUNK_SIZE.get_or_init(detect_chunk_size)
}

fn detect_chunk_size() -> usize {
    let probe = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .and_then(|sock| sock.send_buffer_size());
    match probe {
        Ok(size) if size >= 1024 => size,
        _ => DEFAULT_CHUNK_SIZE,
    }
}

/// One record of a transfer: a file with its size, or a directory
/// marker with size `-1`.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Path sent on the wire, relative to the root's parent, always
    /// `/`-separated.
    pub rel_path: String,
    /// Where the bytes come from locally. Unset for directories.
    pub abs_path: Option<PathBuf>,
    pub size: i64,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.size == DIR_SIZE
    }
}

/// Ordered list of records for one outbound transfer, with totals
/// precomputed. Directories always precede their contents so the
/// receiver can materialize the tree in arrival order.
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    pub entries: Vec<Entry>,
    /// Entry count, directories included.
    pub total_records: i64,
    /// Sum of file sizes; directory markers contribute nothing.
    pub total_bytes: i64,
}

impl TransferPlan {
    /// Walk the given roots depth-first and build the wire plan. Each
    /// root contributes its own name as the top path component, so
    /// sending `/home/a/photos` yields `photos`, `photos/x.jpg`, ...
    pub fn from_roots(roots: &[PathBuf]) -> Result<Self> {
        let mut plan = TransferPlan::default();
        for root in roots {
            let root = root
                .canonicalize()
                .map_err(|e| Error::Config(format!("{}: {e}", root.display())))?;
            let base = root.parent().unwrap_or(Path::new("/")).to_path_buf();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
                let rel = entry
                    .path()
                    .strip_prefix(&base)
                    .map_err(|e| Error::Config(e.to_string()))?;
                let rel_path = wire_path(rel);
                if entry.file_type().is_dir() {
                    plan.push(Entry {
                        rel_path,
                        abs_path: None,
                        size: DIR_SIZE,
                    });
                } else if entry.file_type().is_file() {
                    let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
                    plan.push(Entry {
                        rel_path,
                        abs_path: Some(entry.path().to_path_buf()),
                        size,
                    });
                }
                // Sockets, fifos and dangling symlinks are skipped.
            }
        }
        Ok(plan)
    }

    fn push(&mut self, entry: Entry) {
        self.total_records += 1;
        if entry.size > 0 {
            self.total_bytes += entry.size;
        }
        self.entries.push(entry);
    }
}

/// Relative path in wire form: forward slashes on every platform.
fn wire_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_over_tree_counts_records_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("inner")).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::write(root.join("inner/b.bin"), vec![0u8; 300]).unwrap();

        let plan = TransferPlan::from_roots(&[root]).unwrap();

        // album, a.txt, inner, inner/b.bin
        assert_eq!(plan.total_records, 4);
        assert_eq!(plan.total_bytes, 305);

        let dirs: Vec<&str> = plan
            .entries
            .iter()
            .filter(|e| e.is_dir())
            .map(|e| e.rel_path.as_str())
            .collect();
        assert_eq!(dirs, vec!["album", "album/inner"]);

        // Directory marker precedes its contents.
        let pos = |needle: &str| {
            plan.entries
                .iter()
                .position(|e| e.rel_path == needle)
                .unwrap()
        };
        assert!(pos("album/inner") < pos("album/inner/b.bin"));
    }

    #[test]
    fn single_file_root_has_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("note.md");
        std::fs::write(&file, b"abc").unwrap();

        let plan = TransferPlan::from_roots(&[file]).unwrap();
        assert_eq!(plan.total_records, 1);
        assert_eq!(plan.total_bytes, 3);
        assert_eq!(plan.entries[0].rel_path, "note.md");
        assert!(!plan.entries[0].is_dir());
    }

    #[test]
    fn empty_directory_contributes_marker_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("empty");
        std::fs::create_dir(&root).unwrap();

        let plan = TransferPlan::from_roots(&[root]).unwrap();
        assert_eq!(plan.total_records, 1);
        assert_eq!(plan.total_bytes, 0);
        assert_eq!(plan.entries[0].size, DIR_SIZE);
    }

    #[test]
    fn missing_root_is_an_error() {
        assert!(TransferPlan::from_roots(&[PathBuf::from("/no/such/path/x")]).is_err());
    }
}

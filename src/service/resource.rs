//! Static resources served when no processor claims a `GET` request.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Source of static resources, addressed by `/`-separated relative paths.
///
/// Paths handed to a provider are already normalised: no `.` or `..`
/// segments and no leading `/`.
pub trait ResourceProvider: Send + Sync {
    /// Returns `true` if `path` names a servable resource (not a directory).
    fn exists(&self, path: &str) -> bool;

    /// Size of the resource in bytes.
    fn size(&self, path: &str) -> Option<u64>;

    /// Reads the whole resource into memory. An empty result is a valid,
    /// empty resource and is served as an empty `200`, not as missing.
    fn read_all(&self, path: &str) -> io::Result<Bytes>;

    /// Opens the resource for streaming. Providers that are not backed by
    /// files return `None` and are always read with [`read_all`](Self::read_all).
    fn open(&self, _path: &str) -> Option<File> {
        None
    }
}

/// Serves resources from a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsResourceProvider {
    root: PathBuf,
}

impl FsResourceProvider {
    /// Serves files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory resources are resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl ResourceProvider for FsResourceProvider {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn size(&self, path: &str) -> Option<u64> {
        std::fs::metadata(self.resolve(path))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    fn read_all(&self, path: &str) -> io::Result<Bytes> {
        std::fs::read(self.resolve(path)).map(Bytes::from)
    }

    fn open(&self, path: &str) -> Option<File> {
        File::open(self.resolve(path)).ok()
    }
}

/// Normalises a resource path, resolving `.` and `..` segments.
///
/// Returns `None` when the path climbs above its root.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_segments() {
        assert_eq!(normalize_path("www//a/./b.html").as_deref(), Some("www/a/b.html"));
        assert_eq!(normalize_path("www/a/../b.html").as_deref(), Some("www/b.html"));
        assert_eq!(normalize_path("").as_deref(), Some(""));
    }

    #[test]
    fn refuses_escaping_the_root() {
        assert_eq!(normalize_path("../etc/passwd"), None);
        assert_eq!(normalize_path("www/../../secret"), None);
    }

    #[test]
    fn fs_provider_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"abc").unwrap();

        let provider = FsResourceProvider::new(dir.path());
        assert!(provider.exists("sub/a.txt"));
        assert!(!provider.exists("sub"));
        assert!(!provider.exists("missing.txt"));
        assert_eq!(provider.size("sub/a.txt"), Some(3));
        assert_eq!(provider.size("sub"), None);
        assert_eq!(&provider.read_all("sub/a.txt").unwrap()[..], b"abc");
        assert!(provider.open("sub/a.txt").is_some());
    }
}

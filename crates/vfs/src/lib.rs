//! Perch Virtual Filesystem
//!
//! Confines every script-visible path under one configured data root.
//! Path legality is decided by pure normalization (`VirtualRoot::jail`)
//! before any real filesystem access, so traversal behavior can be tested
//! without I/O. All file operations offered here take virtual paths and
//! resolve them through the jail first.

use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

/// Errors from virtual filesystem resolution and I/O.
///
/// Messages are written to be surfaced to script space verbatim as the
/// second value of a `nil, message` pair.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("path escapes the data root: {path}")]
    Escape { path: String },

    #[error("no such file: {path}")]
    NotFound { path: String },

    #[error("{path} is a directory")]
    IsDirectory { path: String },

    #[error("{path} is not a directory")]
    NotDirectory { path: String },

    #[error("io error on {path}: {error}")]
    Io { path: String, error: String },
}

impl VfsError {
    fn io(path: &str, error: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            error: error.to_string(),
        }
    }
}

/// One data root on the host filesystem; everything script space can reach.
#[derive(Debug, Clone)]
pub struct VirtualRoot {
    root: PathBuf,
}

impl VirtualRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The host directory backing this root.
    #[must_use]
    pub fn host_root(&self) -> &Path {
        &self.root
    }

    /// Normalize a virtual path without touching the filesystem.
    ///
    /// Both separators are accepted, `.` components are dropped, and `..`
    /// pops the previous component. Absolute virtual paths are interpreted
    /// relative to the root (script space addresses one volume). Popping
    /// past the root is an error, never a silent clamp.
    pub fn jail(&self, user_path: &str) -> Result<PathBuf, VfsError> {
        let mut parts: Vec<&str> = Vec::new();
        for raw in user_path.split(['/', '\\']) {
            match raw {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(VfsError::Escape {
                            path: user_path.to_string(),
                        });
                    }
                }
                component => parts.push(component),
            }
        }
        let mut relative = PathBuf::new();
        for part in &parts {
            // Windows-style prefixes ("C:") and rooted components would
            // re-anchor the joined path outside the jail.
            let as_path = Path::new(part);
            if as_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(VfsError::Escape {
                    path: user_path.to_string(),
                });
            }
            relative.push(part);
        }
        Ok(relative)
    }

    /// Resolve a virtual path to its host path.
    pub fn resolve(&self, user_path: &str) -> Result<PathBuf, VfsError> {
        Ok(self.root.join(self.jail(user_path)?))
    }

    pub fn exists(&self, user_path: &str) -> bool {
        self.resolve(user_path).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn is_dir(&self, user_path: &str) -> bool {
        self.resolve(user_path).map(|p| p.is_dir()).unwrap_or(false)
    }

    pub fn read(&self, user_path: &str) -> Result<Vec<u8>, VfsError> {
        let host = self.reject_dir(user_path)?;
        fs::read(&host).map_err(|e| Self::map_read_err(user_path, e))
    }

    pub fn read_to_string(&self, user_path: &str) -> Result<String, VfsError> {
        let host = self.reject_dir(user_path)?;
        fs::read_to_string(&host).map_err(|e| Self::map_read_err(user_path, e))
    }

    pub fn write(&self, user_path: &str, contents: &[u8]) -> Result<(), VfsError> {
        let host = self.resolve(user_path)?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).map_err(|e| VfsError::io(user_path, e))?;
        }
        fs::write(&host, contents).map_err(|e| VfsError::io(user_path, e))
    }

    pub fn open_read(&self, user_path: &str) -> Result<File, VfsError> {
        let host = self.reject_dir(user_path)?;
        File::open(&host).map_err(|e| Self::map_read_err(user_path, e))
    }

    pub fn open_write(&self, user_path: &str) -> Result<File, VfsError> {
        self.open_with(user_path, OpenOptions::new().write(true).create(true).truncate(true))
    }

    pub fn open_append(&self, user_path: &str) -> Result<File, VfsError> {
        self.open_with(user_path, OpenOptions::new().append(true).create(true))
    }

    pub fn create_dir_all(&self, user_path: &str) -> Result<(), VfsError> {
        let host = self.resolve(user_path)?;
        fs::create_dir_all(&host).map_err(|e| VfsError::io(user_path, e))
    }

    /// Directory entry names (not full paths), sorted for determinism.
    pub fn list(&self, user_path: &str) -> Result<Vec<String>, VfsError> {
        let host = self.resolve(user_path)?;
        if !host.exists() {
            return Err(VfsError::NotFound {
                path: user_path.to_string(),
            });
        }
        if !host.is_dir() {
            return Err(VfsError::NotDirectory {
                path: user_path.to_string(),
            });
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(&host).map_err(|e| VfsError::io(user_path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| VfsError::io(user_path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Remove a file or an entire directory tree under the root.
    pub fn remove(&self, user_path: &str) -> Result<(), VfsError> {
        let host = self.resolve(user_path)?;
        if !host.exists() {
            return Err(VfsError::NotFound {
                path: user_path.to_string(),
            });
        }
        let result = if host.is_dir() {
            fs::remove_dir_all(&host)
        } else {
            fs::remove_file(&host)
        };
        result.map_err(|e| VfsError::io(user_path, e))
    }

    fn open_with(&self, user_path: &str, options: &OpenOptions) -> Result<File, VfsError> {
        let host = self.resolve(user_path)?;
        if host.is_dir() {
            return Err(VfsError::IsDirectory {
                path: user_path.to_string(),
            });
        }
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).map_err(|e| VfsError::io(user_path, e))?;
        }
        options
            .open(&host)
            .map_err(|e| VfsError::io(user_path, e))
    }

    fn reject_dir(&self, user_path: &str) -> Result<PathBuf, VfsError> {
        let host = self.resolve(user_path)?;
        if host.is_dir() {
            return Err(VfsError::IsDirectory {
                path: user_path.to_string(),
            });
        }
        Ok(host)
    }

    fn map_read_err(user_path: &str, error: std::io::Error) -> VfsError {
        if error.kind() == std::io::ErrorKind::NotFound {
            VfsError::NotFound {
                path: user_path.to_string(),
            }
        } else {
            VfsError::io(user_path, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, VirtualRoot) {
        let dir = TempDir::new().unwrap();
        let vfs = VirtualRoot::new(dir.path());
        (dir, vfs)
    }

    #[test]
    fn jail_normalizes_separators_and_dots() {
        let vfs = VirtualRoot::new("/data");
        assert_eq!(vfs.jail("a/b/c.lua").unwrap(), PathBuf::from("a/b/c.lua"));
        assert_eq!(vfs.jail("a\\b\\c.lua").unwrap(), PathBuf::from("a/b/c.lua"));
        assert_eq!(vfs.jail("./a/./b").unwrap(), PathBuf::from("a/b"));
        assert_eq!(vfs.jail("/init.lua").unwrap(), PathBuf::from("init.lua"));
        assert_eq!(vfs.jail("a/b/../c").unwrap(), PathBuf::from("a/c"));
        assert_eq!(vfs.jail("").unwrap(), PathBuf::new());
    }

    #[test]
    fn jail_rejects_escapes() {
        let vfs = VirtualRoot::new("/data");
        let hostile = [
            "..",
            "../etc/passwd",
            "a/../../etc",
            "a/b/../../../x",
            "..\\..\\windows",
            "/../root",
        ];
        for input in hostile {
            assert!(
                matches!(vfs.jail(input), Err(VfsError::Escape { .. })),
                "expected escape error for {input:?}"
            );
        }
    }

    #[test]
    fn jail_never_leaves_root() {
        let vfs = VirtualRoot::new("/data");
        let inputs = [
            "x", "x/y", "../x", "a/..", "a/../..", "/", "//x", ".", "a/./../b",
            "deep/../../shallow", "a\\..\\b", "....", "..a/b", "a..b/c",
        ];
        for input in inputs {
            if let Ok(resolved) = vfs.resolve(input) {
                assert!(
                    resolved.starts_with("/data"),
                    "{input:?} resolved outside the root: {resolved:?}"
                );
            }
        }
    }

    #[test]
    fn read_write_roundtrip() {
        let (_dir, vfs) = root();
        vfs.write("notes/hello.txt", b"hi").unwrap();
        assert_eq!(vfs.read_to_string("notes/hello.txt").unwrap(), "hi");
        assert!(vfs.exists("notes/hello.txt"));
        assert!(vfs.is_dir("notes"));
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let (_dir, vfs) = root();
        assert!(matches!(
            vfs.read("nope.txt"),
            Err(VfsError::NotFound { .. })
        ));
    }

    #[test]
    fn read_directory_is_rejected() {
        let (_dir, vfs) = root();
        vfs.create_dir_all("lib").unwrap();
        assert!(matches!(
            vfs.read_to_string("lib"),
            Err(VfsError::IsDirectory { .. })
        ));
    }

    #[test]
    fn list_is_sorted() {
        let (_dir, vfs) = root();
        vfs.write("b.txt", b"").unwrap();
        vfs.write("a.txt", b"").unwrap();
        vfs.write("c.txt", b"").unwrap();
        assert_eq!(vfs.list("").unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn remove_file_and_tree() {
        let (_dir, vfs) = root();
        vfs.write("tmp/a.txt", b"x").unwrap();
        vfs.remove("tmp/a.txt").unwrap();
        assert!(!vfs.exists("tmp/a.txt"));
        vfs.write("tree/inner/b.txt", b"y").unwrap();
        vfs.remove("tree").unwrap();
        assert!(!vfs.exists("tree"));
    }
}

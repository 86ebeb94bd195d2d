//! Default user volume installer
//!
//! The bootstrap stage calls this (via `system.install`) to populate or
//! repair the persisted user files inside the virtual root.

use perch_vfs::{VfsError, VirtualRoot};

/// Files written into a fresh user volume.
pub const DEFAULT_FILES: &[(&str, &str)] = &[
    ("init.lua", include_str!("boot/init.lua")),
    ("lib/log.lua", include_str!("boot/log.lua")),
];

/// Write the default files. Without `force`, files the user already has are
/// left alone; with it, everything is restored to the shipped contents.
pub fn install_default_files(root: &VirtualRoot, force: bool) -> Result<(), VfsError> {
    let mut written = 0usize;
    for (path, contents) in DEFAULT_FILES {
        if !force && root.exists(path) {
            continue;
        }
        root.write(path, contents.as_bytes())?;
        written += 1;
    }
    tracing::info!(written, force, "default user volume installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_install_writes_every_file() {
        let dir = TempDir::new().unwrap();
        let root = VirtualRoot::new(dir.path());
        install_default_files(&root, false).unwrap();
        for (path, contents) in DEFAULT_FILES {
            assert_eq!(root.read_to_string(path).unwrap(), *contents);
        }
    }

    #[test]
    fn plain_install_preserves_user_edits() {
        let dir = TempDir::new().unwrap();
        let root = VirtualRoot::new(dir.path());
        root.write("init.lua", b"-- my machine").unwrap();
        install_default_files(&root, false).unwrap();
        assert_eq!(root.read_to_string("init.lua").unwrap(), "-- my machine");
        assert!(root.exists("lib/log.lua"));
    }

    #[test]
    fn forced_install_restores_shipped_contents() {
        let dir = TempDir::new().unwrap();
        let root = VirtualRoot::new(dir.path());
        root.write("init.lua", b"-- broken beyond repair").unwrap();
        install_default_files(&root, true).unwrap();
        assert_eq!(
            root.read_to_string("init.lua").unwrap(),
            DEFAULT_FILES[0].1
        );
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for local files that need to be read,
//! and for the release layout that every deploy host shares.
//!
//! # Release Layout
//!
//! Each deploy host keeps one directory per fetched release, plus a symlink
//! named `current` that designates the live release:
//!
//! ```text
//! <project_root>/
//! ├── current -> <project_root>/releases/<version>
//! └── releases/
//!     ├── <version>/
//!     │   └── .fixjam-prepared
//!     └── <version>/
//! ```
//!
//! The marker file `.fixjam-prepared` is written once a release is fully
//! prepared. A release without it must never become current.

use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "fixjam-deploy.toml";

/// Name of marker file flagging a release as prepared.
pub const PREPARED_MARKER: &str = ".fixjam-prepared";

/// Determine path to configuration file.
///
/// Prefers `fixjam-deploy.toml` in the working directory. Otherwise uses XDG
/// Base Directory path `$XDG_CONFIG_HOME/fixjam-deploy/config.toml`. Returns
/// [`None`] if neither file exists, in which case built-in defaults apply.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|path| path.join("fixjam-deploy").join("config.toml"))
        .filter(|path| path.is_file())
}

/// Release directory layout on a deploy host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLayout {
    root: PathBuf,
}

impl ReleaseLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory containing every release.
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// Directory of one release.
    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir().join(version)
    }

    /// Location of the current pointer.
    pub fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Location of prepared marker of a release.
    pub fn prepared_marker(&self, version: &str) -> PathBuf {
        self.release_dir(version).join(PREPARED_MARKER)
    }

    /// Check that path names a release directory, and nothing above it.
    pub fn is_release_dir(&self, path: &Path) -> bool {
        path.parent() == Some(self.releases_dir().as_path())
            && path
                .file_name()
                .is_some_and(|name| name != "." && name != "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn release_layout_paths() {
        let layout = ReleaseLayout::new("/project/fixjam");
        assert_eq!(
            layout.release_dir("abc123"),
            PathBuf::from("/project/fixjam/releases/abc123")
        );
        assert_eq!(layout.current_link(), PathBuf::from("/project/fixjam/current"));
        assert_eq!(
            layout.prepared_marker("abc123"),
            PathBuf::from("/project/fixjam/releases/abc123/.fixjam-prepared")
        );
    }

    #[test]
    fn only_direct_children_are_release_dirs() {
        let layout = ReleaseLayout::new("/project/fixjam");
        assert!(layout.is_release_dir(&layout.release_dir("abc123")));
        assert!(!layout.is_release_dir(&layout.releases_dir()));
        assert!(!layout.is_release_dir(Path::new("/project/fixjam/releases/a/b")));
        assert!(!layout.is_release_dir(Path::new("/project/fixjam/releases/..")));
    }
}

//! On-disk layout of a Tabulite deployment.
//!
//! Everything hangs off one data root:
//!
//! ```text
//! <data_dir>/servers/<location>/log/<group>/<fragment-id>   commit logs
//! <data_dir>/log/mml                                        master meta-log
//! <data_dir>/log/rsml_<location>                            per-server meta-log
//! <data_dir>/phantom/<location>                             phantom transfer logs
//! ```
//!
//! The coordination-service lock file for a server lives in the lock
//! service's own namespace as `/servers/<location>`; it is a path string,
//! not a filesystem path.

use std::path::{Path, PathBuf};

/// Path helpers rooted at a deployment's data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit-log directory for one group of one server.
    pub fn commit_log_dir(&self, location: &str, group: &str) -> PathBuf {
        self.root.join("servers").join(location).join("log").join(group)
    }

    /// The master meta-log.
    pub fn master_meta_log(&self) -> PathBuf {
        self.root.join("log").join("mml")
    }

    /// A range server's meta-log.
    pub fn server_meta_log(&self, location: &str) -> PathBuf {
        self.root.join("log").join(format!("rsml_{location}"))
    }

    /// Root of phantom transfer logs written on this destination.
    pub fn phantom_log_dir(&self, location: &str) -> PathBuf {
        self.root.join("phantom").join(location)
    }

    /// Name of the coordination-service lock file for a server.
    pub fn server_lock_file(location: &str) -> String {
        format!("/servers/{location}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.commit_log_dir("rs1", "user"),
            PathBuf::from("/data/servers/rs1/log/user")
        );
        assert_eq!(layout.master_meta_log(), PathBuf::from("/data/log/mml"));
        assert_eq!(
            layout.server_meta_log("rs1"),
            PathBuf::from("/data/log/rsml_rs1")
        );
        assert_eq!(DataLayout::server_lock_file("rs1"), "/servers/rs1");
    }
}

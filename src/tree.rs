//! The source-path index — a symlink shadow of the source tree.
//!
//! Under `<repo>/tree`, every backed-up source file has a symlink at
//! its source-relative path whose target is the current version
//! record's `<xx>/<b64hi>.<b64lo>` form.  The link tree is the sole
//! durable mapping from source paths to version UUIDs: looking a path
//! up means reading its link, and finishing a new version means
//! re-pointing it.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::id::{uuid_from_rel_path, uuid_rel_path};

/// Link directory name, directly under the repository root.
pub const TREE_DIR: &str = "tree";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path exists but is not a version link: {0}")]
    NotALink(PathBuf),
    #[error("malformed link target: {0}")]
    BadTarget(String),
}

/// What the index knows about one source-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Never backed up: the normal signal for a first version.
    Missing,
    /// Current version of this path.
    Current(Uuid),
}

/// The link tree rooted at `<repo>/tree`.
pub struct LinkTree {
    root: PathBuf,
}

impl LinkTree {
    pub fn open(repo_root: impl AsRef<Path>) -> Result<Self, LinkError> {
        let root = repo_root.as_ref().join(TREE_DIR);
        fs::create_dir_all(&root)?;
        Ok(LinkTree { root })
    }

    fn link_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Look up the current version UUID for a source-relative path.
    ///
    /// A present-but-foreign entry (a regular file, say) is an error:
    /// the driver must not silently shadow it.
    pub fn read_link(&self, rel: &Path) -> Result<LinkState, LinkError> {
        let path = self.link_path(rel);
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LinkState::Missing),
            Err(e) => return Err(e.into()),
        };
        if !meta.file_type().is_symlink() {
            return Err(LinkError::NotALink(path));
        }
        let target = fs::read_link(&path)?;
        let target_str = target.to_string_lossy();
        let uuid = uuid_from_rel_path(&target_str)
            .ok_or_else(|| LinkError::BadTarget(target_str.into_owned()))?;
        Ok(LinkState::Current(uuid))
    }

    /// Point a source-relative path at a version record, replacing any
    /// previous link.
    pub fn make_link(&self, rel: &Path, uuid: &Uuid) -> Result<(), LinkError> {
        let path = self.link_path(rel);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&path)?,
            Ok(_) => return Err(LinkError::NotALink(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = uuid_rel_path(uuid);
        trace!(link = %rel.display(), %target, "linking");
        symlink(&target, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn missing_then_linked_then_replaced() {
        let dir = TempDir::new().unwrap();
        let tree = LinkTree::open(dir.path()).unwrap();
        let rel = Path::new("docs/notes.txt");

        assert_eq!(tree.read_link(rel).unwrap(), LinkState::Missing);

        let first = Uuid::new_v4();
        tree.make_link(rel, &first).unwrap();
        assert_eq!(tree.read_link(rel).unwrap(), LinkState::Current(first));

        let second = Uuid::new_v4();
        tree.make_link(rel, &second).unwrap();
        assert_eq!(tree.read_link(rel).unwrap(), LinkState::Current(second));
    }

    #[test]
    fn foreign_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let tree = LinkTree::open(dir.path()).unwrap();
        let rel = Path::new("plain");
        std::fs::write(dir.path().join(TREE_DIR).join(rel), b"not a link").unwrap();

        assert!(matches!(tree.read_link(rel), Err(LinkError::NotALink(_))));
        assert!(matches!(
            tree.make_link(rel, &Uuid::new_v4()),
            Err(LinkError::NotALink(_))
        ));
    }

    #[test]
    fn target_is_the_record_rel_path() {
        let dir = TempDir::new().unwrap();
        let tree = LinkTree::open(dir.path()).unwrap();
        let rel = Path::new("a/b/c");
        let uuid = Uuid::new_v4();
        tree.make_link(rel, &uuid).unwrap();

        let target = std::fs::read_link(dir.path().join(TREE_DIR).join(rel)).unwrap();
        assert_eq!(target.to_str().unwrap(), uuid_rel_path(&uuid));
    }
}

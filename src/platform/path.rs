//! Absolute-path resolution and mapping/management file name derivation.
//!
//! The engine above identifies a database by whatever path it was opened
//! with (possibly relative, possibly a symlink). Every process sharing a
//! database must derive the same mapping names, so the path is
//! canonicalized first. A not-yet-existing database file canonicalizes
//! its parent directory instead and re-appends the file name, since
//! `fs::canonicalize` requires the target to exist.
use std::io;
use std::path::{Path, PathBuf};

pub const ROW_SUFFIX: &str = ".rowlock";
pub const TABLE_SUFFIX: &str = ".tablelock";
pub const MNG_SUFFIX: &str = ".mng";

/// Resolve `name` (the database path as given to the engine) to an
/// absolute path suitable for deriving stable mapping file names.
pub fn resolve_absolute(name: &str) -> io::Result<PathBuf> {
    let path = Path::new(name);

    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }

    // The db file may not exist yet (first open creates it); canonicalize
    // the parent and re-append the file name so two processes racing to
    // create it still agree on the mapping path.
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty database name"))?;
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let parent = match parent {
        Some(p) => p.canonicalize()?,
        None => std::env::current_dir()?,
    };
    Ok(parent.join(file_name))
}

/// Derive the row-class mapping path from a resolved absolute database path.
pub fn row_map_path(absolute: &Path) -> PathBuf {
    with_suffix(absolute, ROW_SUFFIX)
}

/// Derive the table-class mapping path from a resolved absolute database path.
pub fn table_map_path(absolute: &Path) -> PathBuf {
    with_suffix(absolute, TABLE_SUFFIX)
}

/// Derive the presence-management file path for a given mapping path.
pub fn management_path(mapping_path: &Path) -> PathBuf {
    let mut s = mapping_path.as_os_str().to_os_string();
    s.push(MNG_SUFFIX);
    PathBuf::from(s)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

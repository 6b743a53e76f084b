//! Filesystem helpers shared by the storage backend and the coordinator.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Split a path into its components as plain strings, including a leading
/// root component for absolute paths.
pub fn split_path(path: &Path) -> Vec<String> {
    path.components()
        .map(|component| match component {
            Component::RootDir => std::path::MAIN_SEPARATOR.to_string(),
            other => other.as_os_str().to_string_lossy().into_owned(),
        })
        .collect()
}

/// Determine whether `sub_path` is contained in `path`.
///
/// Paths are compared segment by segment, so `/a/bb/c` is not considered a
/// sub path of `/a/b` the way a plain prefix comparison would conclude.
pub fn is_sub_path(sub_path: &Path, path: &Path, allow_equal: bool) -> bool {
    let sub_segments = split_path(sub_path);
    let segments = split_path(path);

    if allow_equal {
        if sub_segments.len() < segments.len() {
            return false;
        }
    } else if sub_segments.len() <= segments.len() {
        return false;
    }

    sub_segments
        .iter()
        .zip(segments.iter())
        .all(|(sub, seg)| sub == seg)
}

/// Create a directory path, creating parents where needed. An existing
/// directory is not an error.
pub fn make_path(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Remove a file, symbolic link, or directory tree.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Recursively copy `source` to `target`.
///
/// Directories are recreated, file contents are copied. When the target is an
/// existing directory the source is copied into it under its own basename.
/// With `resolve_root` a top-level symbolic link is followed; `resolve_links`
/// follows links everywhere (which can recurse forever on link cycles).
/// Unresolved links are recreated verbatim in the target tree.
pub fn copy_path(source: &Path, target: &Path, resolve_root: bool, resolve_links: bool) -> Result<()> {
    let target = if target.is_dir() {
        target.join(source.file_name().ok_or_else(|| {
            Error::User(format!("cannot copy path without basename: {}", source.display()))
        })?)
    } else {
        target.to_path_buf()
    };

    copy_path_rec(source, &target, resolve_root, resolve_links)
}

fn copy_path_rec(source: &Path, target: &Path, resolve_root: bool, resolve_links: bool) -> Result<()> {
    if target.is_symlink() && !target.exists() {
        return Err(Error::User(format!(
            "target is a dangling symlink: {}",
            target.display()
        )));
    }

    if source.is_symlink() && !(resolve_links || resolve_root) {
        if target.exists() {
            fs::remove_file(target)?;
        }
        let link_target = fs::read_link(source)?;
        symlink(&link_target, target)?;
    } else if source.is_dir() {
        if !target.exists() {
            fs::create_dir(target)?;
        }
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            // resolve_root only applies to the initial call
            copy_path_rec(&entry.path(), &target.join(entry.file_name()), false, resolve_links)?;
        }
    } else {
        fs::copy(source, target)?;
    }

    Ok(())
}

#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(Error::User(
        "symbolic links are not supported on this platform".to_string(),
    ))
}

/// Total size in bytes of the files and directory trees at `roots`.
///
/// Unresolved symbolic links contribute the size of the link itself, matching
/// the corresponding rule in product hashing.
pub fn product_size(roots: &[PathBuf], resolve_root: bool, resolve_links: bool) -> Result<u64> {
    let mut total = 0;
    for root in roots {
        total += product_size_rec(root, resolve_root, resolve_links)?;
    }
    Ok(total)
}

fn product_size_rec(root: &Path, resolve_root: bool, resolve_links: bool) -> Result<u64> {
    if root.is_symlink() && !(resolve_root || resolve_links) {
        Ok(fs::symlink_metadata(root)?.len())
    } else if root.is_file() {
        Ok(fs::metadata(root)?.len())
    } else if root.is_dir() {
        let mut total = 0;
        for entry in fs::read_dir(root)? {
            total += product_size_rec(&entry?.path(), false, resolve_links)?;
        }
        Ok(total)
    } else {
        Err(Error::User(format!(
            "path does not refer to a regular file or directory: {}",
            root.display()
        )))
    }
}

/// Surround every item with quotes and join with ", ".
pub fn quoted_list<I, T>(items: I) -> String
where
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    items
        .into_iter()
        .map(|item| format!("\"{}\"", item))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_path_compares_whole_segments() {
        assert!(is_sub_path(Path::new("/a/b/c"), Path::new("/a/b"), false));
        assert!(!is_sub_path(Path::new("/a/bb/c"), Path::new("/a/b"), false));
        assert!(!is_sub_path(Path::new("/a/b"), Path::new("/a/b"), false));
        assert!(is_sub_path(Path::new("/a/b"), Path::new("/a/b"), true));
    }

    #[test]
    fn size_of_tree_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one"), b"12345").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/two"), b"123").unwrap();

        let size = product_size(&[dir.path().to_path_buf()], true, false).unwrap();
        assert_eq!(size, 8);
    }

    #[test]
    fn copy_path_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        fs::write(&source, b"data").unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();

        copy_path(&source, &target, true, false).unwrap();
        assert_eq!(fs::read(target.join("source.txt")).unwrap(), b"data");
    }

    #[test]
    fn quoted_list_formats_items() {
        assert_eq!(quoted_list(["a", "b"]), "\"a\", \"b\"");
    }
}

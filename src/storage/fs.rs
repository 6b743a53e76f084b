//! Filesystem storage backend.
//!
//! Products live under `<root>/<archive_path>/`. Staging directories are
//! created next to the final destination so the final move is an atomic
//! rename on the underlying filesystem. Intra-archive symbolic links are
//! written relative, so the archive root can be relocated safely.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::records::Properties;
use crate::util;

use super::{ProductCallback, RetrieveFiles, Storage};

/// Configuration of the filesystem backend (`[fs]` section).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FsConfig {
    pub root: String,
    #[serde(default)]
    pub use_symlinks: Option<bool>,
}

pub struct FilesystemStorage {
    root: PathBuf,
    use_symlinks: bool,
}

impl FilesystemStorage {
    pub fn new(config: &FsConfig) -> Self {
        let root = Path::new(&config.root);
        FilesystemStorage {
            root: root.canonicalize().unwrap_or_else(|_| root.to_path_buf()),
            use_symlinks: config.use_symlinks.unwrap_or(false),
        }
    }

    /// Staging area for a product; must live on the same filesystem as the
    /// final destination so renames are atomic.
    fn tmp_root(&self, product: &Properties) -> Result<PathBuf> {
        let archive_path = product.archive_path().unwrap_or("");
        let tmp_root = self.root.join(archive_path);
        util::make_path(&tmp_root)?;
        Ok(tmp_root)
    }

    fn product_paths(&self, product: &Properties, use_enclosing_directory: bool) -> Result<Vec<PathBuf>> {
        let product_path = self.product_path(product)?;
        if use_enclosing_directory {
            let mut paths = Vec::new();
            for entry in fs::read_dir(&product_path)? {
                paths.push(entry?.path());
            }
            Ok(paths)
        } else {
            Ok(vec![product_path])
        }
    }
}

impl Storage for FilesystemStorage {
    fn prepare(&self) -> Result<()> {
        util::make_path(&self.root).map_err(|error| {
            Error::User(format!(
                "unable to create archive root path '{}' [{}]",
                self.root.display(),
                error
            ))
        })
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.root.is_dir())
    }

    fn destroy(&self) -> Result<()> {
        if self.root.is_dir() {
            util::remove_path(&self.root).map_err(|error| {
                Error::User(format!(
                    "unable to remove archive root path '{}' [{}]",
                    self.root.display(),
                    error
                ))
            })?;
        }
        Ok(())
    }

    fn supports_symlinks(&self) -> bool {
        true
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn product_path(&self, product: &Properties) -> Result<PathBuf> {
        let archive_path = product.archive_path().ok_or_else(|| {
            Error::Internal("product without archive_path has no storage path".to_string())
        })?;
        Ok(self
            .root
            .join(archive_path)
            .join(product.physical_name()?))
    }

    fn current_archive_path(&self, paths: &[PathBuf], product: &Properties) -> Result<String> {
        for path in paths {
            let real = path.canonicalize()?;
            if !util::is_sub_path(&real, &self.root, true) {
                return Err(Error::User(
                    "cannot ingest a file in-place if it is not inside the archive root"
                        .to_string(),
                ));
            }
        }

        let first = paths
            .first()
            .ok_or_else(|| Error::User("nothing to ingest".to_string()))?
            .canonicalize()?;
        let mut abs_archive_path = first
            .parent()
            .ok_or_else(|| Error::User("cannot determine containing directory".to_string()))?
            .to_path_buf();

        if paths.len() > 1 {
            // all parts must sit in an enclosing directory named after the product
            let physical_name = product.physical_name()?;
            for path in paths {
                let real = path.canonicalize()?;
                let enclosing = real.parent().and_then(Path::file_name);
                if enclosing != Some(std::ffi::OsStr::new(physical_name)) {
                    return Err(Error::User(
                        "multi-part product has invalid enclosing directory for in-place \
                         ingestion"
                            .to_string(),
                    ));
                }
            }
            abs_archive_path = abs_archive_path
                .parent()
                .ok_or_else(|| {
                    Error::User("cannot determine containing directory".to_string())
                })?
                .to_path_buf();
        }

        let relative = abs_archive_path
            .strip_prefix(&self.root)
            .map_err(|_| {
                Error::User(
                    "cannot ingest a file in-place if it is not inside the archive root"
                        .to_string(),
                )
            })?;
        Ok(relative.to_string_lossy().into_owned())
    }

    fn put(
        &self,
        paths: Option<&[PathBuf]>,
        properties: &Properties,
        use_enclosing_directory: bool,
        use_symlinks: Option<bool>,
        retrieve_files: Option<RetrieveFiles<'_>>,
        run_for_product: Option<ProductCallback<'_>>,
    ) -> Result<()> {
        let use_symlinks = use_symlinks.unwrap_or(self.use_symlinks);
        let physical_name = properties.physical_name()?.to_string();
        let archive_path = properties
            .archive_path()
            .ok_or_else(|| Error::Internal("put without archive_path".to_string()))?
            .to_string();
        let uuid = properties.uuid()?;

        let abs_archive_path = self.root.join(&archive_path);
        let abs_product_path = abs_archive_path.join(&physical_name);

        // Product files already at the destination are left in place.
        if let Some(paths) = paths {
            let already_there = paths
                .first()
                .and_then(|path| path.canonicalize().ok())
                .map(|real| util::is_sub_path(&real, &abs_product_path, true))
                .unwrap_or(false);
            if already_there {
                for path in paths {
                    if !path.exists() {
                        return Err(Error::User(format!(
                            "product source path does not exist '{}'",
                            path.display()
                        )));
                    }
                    let real = path.canonicalize()?;
                    if !util::is_sub_path(&real, &abs_product_path, true) {
                        return Err(Error::User(
                            "cannot ingest product where only part of the files are already \
                             at the destination location"
                                .to_string(),
                        ));
                    }
                }
                return Ok(());
            }
        }

        util::make_path(&abs_archive_path).map_err(|error| {
            Error::User(format!(
                "cannot create parent destination path '{}' [{}]",
                abs_archive_path.display(),
                error
            ))
        })?;

        let mut anything_stored = false;
        let result = (|| -> Result<()> {
            let staging = tempfile::Builder::new()
                .prefix(".put-")
                .suffix(&format!("-{}", uuid.simple()))
                .tempdir_in(self.tmp_root(properties)?)?;

            let mut tmp_path = staging.path().to_path_buf();
            if use_enclosing_directory {
                tmp_path = tmp_path.join(&physical_name);
                util::make_path(&tmp_path)?;
            }

            if let Some(retrieve_files) = retrieve_files {
                retrieve_files(&tmp_path)?;
            } else if let Some(paths) = paths {
                if use_symlinks {
                    let abs_path = if use_enclosing_directory {
                        &abs_product_path
                    } else {
                        &abs_archive_path
                    };
                    for path in paths {
                        let basename = path.file_name().ok_or_else(|| {
                            Error::User(format!(
                                "cannot ingest path without basename: {}",
                                path.display()
                            ))
                        })?;
                        // relative links inside the archive survive a
                        // relocation of the archive root
                        let target = if util::is_sub_path(path, &self.root, false) {
                            relative_to(path, abs_path)
                        } else {
                            path.clone()
                        };
                        util::symlink(&target, &tmp_path.join(basename))?;
                    }
                } else {
                    for path in paths {
                        util::copy_path(path, &tmp_path, true, false)?;
                    }
                }
            }

            if use_enclosing_directory {
                fs::rename(&tmp_path, &abs_product_path)?;
            } else {
                let tmp_product_path = tmp_path.join(&physical_name);
                fs::rename(&tmp_product_path, &abs_product_path)?;
            }
            anything_stored = true;

            if let Some(run_for_product) = run_for_product {
                self.run_for_product(properties, use_enclosing_directory, run_for_product)?;
            }
            Ok(())
        })();

        result.map_err(|error| Error::storage(error, anything_stored))
    }

    fn get(
        &self,
        product: &Properties,
        product_path: &Path,
        target_path: &Path,
        use_enclosing_directory: bool,
        use_symlinks: Option<bool>,
    ) -> Result<()> {
        let use_symlinks = use_symlinks.unwrap_or(self.use_symlinks);

        let result = (|| -> Result<()> {
            if use_symlinks {
                if use_enclosing_directory {
                    for entry in fs::read_dir(product_path)? {
                        let entry = entry?;
                        util::symlink(&entry.path(), &target_path.join(entry.file_name()))?;
                    }
                } else {
                    let basename = product_path.file_name().ok_or_else(|| {
                        Error::Internal("product path without basename".to_string())
                    })?;
                    util::symlink(product_path, &target_path.join(basename))?;
                }
            } else if use_enclosing_directory {
                for entry in fs::read_dir(product_path)? {
                    util::copy_path(&entry?.path(), target_path, true, false)?;
                }
            } else {
                util::copy_path(product_path, target_path, true, false)?;
            }
            Ok(())
        })();

        result.map_err(|error| {
            Error::User(format!(
                "unable to retrieve product {} [{}]",
                product.display_name(),
                error
            ))
        })
    }

    fn size(&self, product_path: &Path) -> Result<u64> {
        util::product_size(&[product_path.to_path_buf()], true, false)
    }

    fn delete(&self, product_path: &Path, properties: &Properties) -> Result<()> {
        if product_path.symlink_metadata().is_err() {
            // already absent, not an error
            return Ok(());
        }

        let result = (|| -> Result<()> {
            // move the product into a scratch directory; dropping the
            // directory removes the product with it
            let scratch = tempfile::Builder::new()
                .prefix(".remove-")
                .suffix(&format!("-{}", properties.uuid()?.simple()))
                .tempdir_in(self.tmp_root(properties)?)?;
            let basename = product_path.file_name().ok_or_else(|| {
                Error::Internal("product path without basename".to_string())
            })?;
            fs::rename(product_path, scratch.path().join(basename))?;
            Ok(())
        })();

        result.map_err(|error| {
            Error::User(format!(
                "unable to remove product {} [{}]",
                properties.display_name(),
                error
            ))
        })
    }

    fn move_product(
        &self,
        product: &Properties,
        archive_path: &str,
        paths: Option<Vec<PathBuf>>,
    ) -> Result<Option<Vec<PathBuf>>> {
        let current_archive_path = product.archive_path().unwrap_or("");
        if current_archive_path == archive_path {
            return Ok(paths);
        }

        let abs_archive_path = self.root.join(archive_path);
        util::make_path(&abs_archive_path)?;

        let product_path = self.product_path(product)?;
        fs::rename(
            &product_path,
            abs_archive_path.join(product.physical_name()?),
        )?;

        let paths = match paths {
            None => None,
            Some(paths) => {
                let old_base = self.root.join(current_archive_path);
                let new_base = self.root.join(archive_path);
                let mut rewritten = Vec::with_capacity(paths.len());
                for path in paths {
                    let relative = path.strip_prefix(&old_base).map_err(|_| {
                        Error::Internal(format!(
                            "product path {} outside its archive path",
                            path.display()
                        ))
                    })?;
                    rewritten.push(new_base.join(relative));
                }
                Some(rewritten)
            }
        };
        Ok(paths)
    }

    fn run_for_product(
        &self,
        product: &Properties,
        use_enclosing_directory: bool,
        callback: ProductCallback<'_>,
    ) -> Result<()> {
        let paths = self.product_paths(product, use_enclosing_directory)?;
        callback(&paths)
    }
}

/// Express `path` relative to the directory `base` (both absolute).
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_components: Vec<Component> = path.components().collect();
    let base_components: Vec<Component> = base.components().collect();

    let mut common = 0;
    while common < path_components.len()
        && common < base_components.len()
        && path_components[common] == base_components[common]
    {
        common += 1;
    }

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &path_components[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Record, Value};
    use uuid::Uuid;

    fn product(archive_path: &str, physical_name: &str) -> Properties {
        let mut properties = Properties::with_core();
        let core = properties.core_mut();
        core.set("uuid", Uuid::new_v4());
        core.set("archive_path", archive_path);
        core.set("physical_name", physical_name);
        core.set("product_name", physical_name);
        properties
    }

    fn storage(root: &Path) -> FilesystemStorage {
        let storage = FilesystemStorage::new(&FsConfig {
            root: root.to_string_lossy().into_owned(),
            use_symlinks: None,
        });
        storage.prepare().unwrap();
        storage
    }

    #[test]
    fn put_single_file_without_enclosing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("archive"));
        let source = dir.path().join("pi.txt");
        fs::write(&source, b"3.14159").unwrap();

        let properties = product("a/b", "pi.txt");
        storage
            .put(Some(&[source]), &properties, false, None, None, None)
            .unwrap();

        let stored = storage.product_path(&properties).unwrap();
        assert_eq!(fs::read(&stored).unwrap(), b"3.14159");
        assert_eq!(storage.size(&stored).unwrap(), 7);
        // no staging remnants
        let entries: Vec<_> = fs::read_dir(stored.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn put_with_enclosing_directory_wraps_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("archive"));
        let one = dir.path().join("1.txt");
        let two = dir.path().join("2.txt");
        fs::write(&one, b"one").unwrap();
        fs::write(&two, b"two").unwrap();

        let properties = product("multi", "product");
        storage
            .put(Some(&[one, two]), &properties, true, None, None, None)
            .unwrap();

        let stored = storage.product_path(&properties).unwrap();
        assert!(stored.is_dir());
        assert!(stored.join("1.txt").is_file());
        assert!(stored.join("2.txt").is_file());
        assert_eq!(storage.size(&stored).unwrap(), 6);
    }

    #[test]
    fn failed_retrieve_reports_nothing_stored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("archive"));
        let properties = product("a", "data.txt");

        let retrieve: &dyn Fn(&Path) -> crate::error::Result<Vec<PathBuf>> =
            &|_| Err(Error::Download("connection reset".to_string()));
        let error = storage
            .put(None, &properties, false, None, Some(retrieve), None)
            .unwrap_err();
        match error {
            Error::Storage {
                anything_stored, ..
            } => assert!(!anything_stored),
            other => panic!("expected storage error, got {}", other),
        }
    }

    #[test]
    fn delete_removes_product_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("archive"));
        let source = dir.path().join("pi.txt");
        fs::write(&source, b"3.14").unwrap();

        let properties = product("a", "pi.txt");
        storage
            .put(Some(&[source]), &properties, false, None, None, None)
            .unwrap();
        let stored = storage.product_path(&properties).unwrap();
        storage.delete(&stored, &properties).unwrap();
        assert!(!stored.exists());
        // deleting again is not an error
        storage.delete(&stored, &properties).unwrap();
    }

    #[test]
    fn move_product_rewrites_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir.path().join("archive"));
        let source = dir.path().join("pi.txt");
        fs::write(&source, b"3.14").unwrap();

        let properties = product("old", "pi.txt");
        storage
            .put(Some(&[source]), &properties, false, None, None, None)
            .unwrap();
        let old_path = storage.product_path(&properties).unwrap();

        let rewritten = storage
            .move_product(&properties, "new/location", Some(vec![old_path.clone()]))
            .unwrap()
            .unwrap();
        assert!(!old_path.exists());
        assert!(rewritten[0].ends_with("new/location/pi.txt"));
        assert!(rewritten[0].is_file());
    }

    #[cfg(unix)]
    #[test]
    fn intra_archive_symlinks_are_relative() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let storage = storage(&root);

        // first ingest a product normally
        let source = dir.path().join("base.txt");
        fs::write(&source, b"data").unwrap();
        let original = product("plain", "base.txt");
        storage
            .put(Some(&[source]), &original, false, None, None, None)
            .unwrap();
        let original_path = storage.product_path(&original).unwrap();

        // then ingest a symlinked copy pointing inside the archive
        let linked = product("linked", "base.txt");
        storage
            .put(
                Some(&[original_path]),
                &linked,
                false,
                Some(true),
                None,
                None,
            )
            .unwrap();

        let link_path = storage.product_path(&linked).unwrap();
        assert!(link_path.is_symlink());
        let target = fs::read_link(&link_path).unwrap();
        assert!(target.is_relative());
        assert_eq!(fs::read(&link_path).unwrap(), b"data");
    }

    #[test]
    fn current_archive_path_requires_root_containment() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let storage = storage(&root);

        let inside_dir = root.join("already/here");
        fs::create_dir_all(&inside_dir).unwrap();
        let inside = inside_dir.join("pi.txt");
        fs::write(&inside, b"3.14").unwrap();

        let properties = product("already/here", "pi.txt");
        let archive_path = storage
            .current_archive_path(&[inside], &properties)
            .unwrap();
        assert_eq!(archive_path, "already/here");

        let outside = dir.path().join("outside.txt");
        fs::write(&outside, b"x").unwrap();
        assert!(storage
            .current_archive_path(&[outside], &properties)
            .is_err());
    }

    #[test]
    fn relative_link_paths() {
        assert_eq!(
            relative_to(Path::new("/a/b/c/file"), Path::new("/a/b/d")),
            Path::new("../c/file")
        );
        assert_eq!(
            relative_to(Path::new("/a/file"), Path::new("/a")),
            Path::new("file")
        );
    }
}

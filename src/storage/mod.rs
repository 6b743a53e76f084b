//! Product data storage.

pub mod fs;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::records::Properties;

pub use fs::FilesystemStorage;

/// Populates a staging directory with product files during a put (used by
/// pull to stream remote data straight into storage). Returns the paths of
/// the files it created.
pub type RetrieveFiles<'a> = &'a dyn Fn(&Path) -> Result<Vec<PathBuf>>;

/// Callback run against the stored product files while the catalogue entry
/// is still inactive.
pub type ProductCallback<'a> = &'a mut dyn FnMut(&[PathBuf]) -> Result<()>;

/// Storage backend interface.
///
/// The put protocol is the atomicity contract: stage into a temporary
/// location on the same storage, then atomically move into the final archive
/// path. A failure that may have left files behind is reported as
/// [`Error::Storage`] with `anything_stored` set.
///
/// [`Error::Storage`]: crate::error::Error::Storage
pub trait Storage {
    /// Prepare the storage for first use.
    fn prepare(&self) -> Result<()>;

    fn exists(&self) -> Result<bool>;

    fn destroy(&self) -> Result<()>;

    /// Whether this storage can hold symbolic links (only a filesystem
    /// store can).
    fn supports_symlinks(&self) -> bool {
        false
    }

    /// Prefix to turn storage-relative product paths into global ones.
    fn global_prefix(&self) -> &str {
        ""
    }

    /// Local root directory, when the storage has one.
    fn root(&self) -> Option<&Path> {
        None
    }

    /// Absolute path of a product's data inside the storage.
    fn product_path(&self, product: &Properties) -> Result<PathBuf>;

    /// Derive the archive path from product files already located inside the
    /// storage root (in-place ingest).
    fn current_archive_path(&self, paths: &[PathBuf], product: &Properties) -> Result<String>;

    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        paths: Option<&[PathBuf]>,
        properties: &Properties,
        use_enclosing_directory: bool,
        use_symlinks: Option<bool>,
        retrieve_files: Option<RetrieveFiles<'_>>,
        run_for_product: Option<ProductCallback<'_>>,
    ) -> Result<()>;

    fn get(
        &self,
        product: &Properties,
        product_path: &Path,
        target_path: &Path,
        use_enclosing_directory: bool,
        use_symlinks: Option<bool>,
    ) -> Result<()>;

    fn size(&self, product_path: &Path) -> Result<u64>;

    fn delete(&self, product_path: &Path, properties: &Properties) -> Result<()>;

    /// Move a product to a new archive path; optionally rewrites a list of
    /// local paths to the new location.
    fn move_product(
        &self,
        product: &Properties,
        archive_path: &str,
        paths: Option<Vec<PathBuf>>,
    ) -> Result<Option<Vec<PathBuf>>>;

    /// Run a callback against the product files as stored.
    fn run_for_product(
        &self,
        product: &Properties,
        use_enclosing_directory: bool,
        callback: ProductCallback<'_>,
    ) -> Result<()>;
}

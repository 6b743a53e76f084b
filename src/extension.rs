//! Plugin interfaces.
//!
//! Product-type plugins teach the archive how to identify, analyze, and
//! place products of a given type; namespace schemas, remote backends, and
//! hook sets come in through the same extension registry. Extensions are
//! compiled in and registered by name; the archive configuration selects
//! which registered extensions an archive uses.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::records::Properties;
use crate::remote::RemoteBackend;
use crate::schema::Schema;
use crate::util;

/// Per-product-type policy controlling how dependent products react when a
/// source product disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeRule {
    Ignore,
    CascadePurgeAsStrip,
    CascadePurge,
    Strip,
    Cascade,
    Purge,
}

/// Metadata extracted from product files by a product-type plugin.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeResult {
    pub properties: Properties,
    pub tags: Vec<String>,
}

impl AnalyzeResult {
    pub fn new(properties: Properties) -> Self {
        AnalyzeResult {
            properties,
            tags: Vec::new(),
        }
    }
}

/// Product type plugin interface.
///
/// The hook methods receive the product file paths when the coordinator has
/// them at hand, and `None` otherwise.
pub trait ProductType: Send + Sync {
    /// Whether products of this type live inside a directory named after
    /// `physical_name`. Mandatory for multi-file products.
    fn use_enclosing_directory(&self) -> bool;

    /// Digest algorithm for the `core.hash` field; `None` disables hashing.
    fn hash_type(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::Md5)
    }

    /// Extension namespaces this plugin fills in during analysis.
    fn namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn cascade_rule(&self) -> CascadeRule {
        CascadeRule::Ignore
    }

    /// Whether the files at `paths` form a product of this type.
    fn identify(&self, paths: &[PathBuf]) -> bool;

    /// Extract product properties (and optionally tags) from the files.
    fn analyze(&self, paths: &[PathBuf]) -> Result<AnalyzeResult>;

    /// Archive path for a product, derived from its properties.
    fn archive_path(&self, properties: &Properties) -> Result<String>;

    /// Name of the enclosing directory; only consulted when
    /// `use_enclosing_directory` is set.
    fn enclosing_directory(&self, properties: &Properties) -> Result<String> {
        let _ = properties;
        Err(Error::Internal(
            "product type plugin does not define an enclosing directory".to_string(),
        ))
    }

    /// Alternative export formats implemented by [`ProductType::export`].
    fn export_formats(&self) -> Vec<String> {
        Vec::new()
    }

    /// Export a product. Returning `Ok(None)` falls back to plain
    /// retrieval (only allowed when no explicit format was requested).
    fn export(
        &self,
        archive: &Archive,
        product: &Properties,
        target_path: &Path,
        paths: Option<&[PathBuf]>,
        format: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let _ = (archive, product, target_path, paths, format);
        Ok(None)
    }

    fn post_create_hook(&self, archive: &Archive, product: &Properties) -> Result<()> {
        let _ = (archive, product);
        Ok(())
    }

    fn post_ingest_hook(
        &self,
        archive: &Archive,
        product: &Properties,
        paths: Option<&[PathBuf]>,
    ) -> Result<()> {
        let _ = (archive, product, paths);
        Ok(())
    }

    fn post_pull_hook(
        &self,
        archive: &Archive,
        product: &Properties,
        paths: Option<&[PathBuf]>,
    ) -> Result<()> {
        let _ = (archive, product, paths);
        Ok(())
    }

    fn post_remove_hook(&self, archive: &Archive, product: &Properties) -> Result<()> {
        let _ = (archive, product);
        Ok(())
    }
}

/// Hook extension plugin interface: the four lifecycle hooks, independent of
/// any product type.
pub trait HookExtension: Send + Sync {
    fn post_create_hook(&self, archive: &Archive, product: &Properties) -> Result<()> {
        let _ = (archive, product);
        Ok(())
    }

    fn post_ingest_hook(
        &self,
        archive: &Archive,
        product: &Properties,
        paths: Option<&[PathBuf]>,
    ) -> Result<()> {
        let _ = (archive, product, paths);
        Ok(())
    }

    fn post_pull_hook(
        &self,
        archive: &Archive,
        product: &Properties,
        paths: Option<&[PathBuf]>,
    ) -> Result<()> {
        let _ = (archive, product, paths);
        Ok(())
    }

    fn post_remove_hook(&self, archive: &Archive, product: &Properties) -> Result<()> {
        let _ = (archive, product);
        Ok(())
    }
}

/// One compiled-in extension module. An extension can contribute any mix of
/// namespaces, product types, remote backends, and hook sets.
pub trait Extension: Send + Sync {
    fn namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    fn namespace(&self, name: &str) -> Result<Schema> {
        Err(Error::NotFound(format!("undefined namespace: \"{}\"", name)))
    }

    fn product_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn product_type_plugin(&self, name: &str) -> Result<Arc<dyn ProductType>> {
        Err(Error::NotFound(format!(
            "undefined product type: \"{}\"",
            name
        )))
    }

    fn remote_backends(&self) -> Vec<String> {
        Vec::new()
    }

    fn remote_backend(&self, name: &str) -> Result<Arc<dyn RemoteBackend>> {
        Err(Error::NotFound(format!(
            "unregistered remote backend: \"{}\"",
            name
        )))
    }

    fn hook_extensions(&self) -> Vec<String> {
        Vec::new()
    }

    fn hook_extension(&self, name: &str) -> Result<Arc<dyn HookExtension>> {
        Err(Error::NotFound(format!(
            "unregistered hook extension: \"{}\"",
            name
        )))
    }
}

/// Named extensions available to archives opened by this process.
///
/// The embedding application registers its extensions here; configuration
/// files reference them by name. An extension name the registry does not
/// know fails archive open, like a failing module import would.
#[derive(Default, Clone)]
pub struct Registry {
    extensions: BTreeMap<String, Arc<dyn Extension>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, name: &str, extension: Arc<dyn Extension>) {
        self.extensions.insert(name.to_string(), extension);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Extension>> {
        self.extensions.get(name).ok_or_else(|| {
            Error::User(format!(
                "extension \"{}\" is not registered; registered extensions: {}",
                name,
                util::quoted_list(self.extensions.keys())
            ))
        })
    }
}

//! The archive engine: lifecycle coordination over catalogue and storage.
//!
//! An `Archive` binds a catalogue backend, an optional storage backend, the
//! registered plugins, and the cascade engine into one transactional whole.
//! Within one operation the observable order is: catalogue insert, bytes
//! stored, catalogue activate. Readers that see `active = true` can rely on
//! the bytes being in place.
//!
//! A single archive handle is not safe for concurrent mutation from multiple
//! threads; tooling runs one handle per worker.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalogue::{Catalogue, SqliteCatalogue};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extension::{AnalyzeResult, CascadeRule, HookExtension, ProductType, Registry};
use crate::hash::{extract_hash_type, product_hash, HashAlgorithm};
use crate::records::{Properties, Value};
use crate::remote::{self, FileBackend, HttpBackend, RemoteBackend};
use crate::schema::{core_schema, Schema};
use crate::storage::{FilesystemStorage, Storage};
use crate::util;

/// Core properties selected when an operation only needs to locate and
/// manipulate a product, not read its full metadata.
const CORE_PROPERTY_NAMES: &[&str] = &[
    "uuid",
    "active",
    "product_name",
    "archive_path",
    "physical_name",
    "product_type",
];

/// Properties the rebuild operation never lets a plugin overwrite.
const RESTRICTED_PROPERTIES: &[&str] = &[
    "uuid",
    "active",
    "hash",
    "size",
    "metadata_date",
    "archive_date",
    "archive_path",
    "product_type",
    "physical_name",
];

/// Product selection accepted by bulk operations: a search expression, one
/// UUID, or a list of UUIDs.
#[derive(Debug, Clone)]
pub enum Selection {
    Expression(String),
    Uuid(Uuid),
    Uuids(Vec<Uuid>),
}

impl From<&str> for Selection {
    fn from(expression: &str) -> Self {
        Selection::Expression(expression.to_string())
    }
}

impl From<String> for Selection {
    fn from(expression: String) -> Self {
        Selection::Expression(expression)
    }
}

impl From<Uuid> for Selection {
    fn from(uuid: Uuid) -> Self {
        Selection::Uuid(uuid)
    }
}

impl From<Vec<Uuid>> for Selection {
    fn from(uuids: Vec<Uuid>) -> Self {
        Selection::Uuids(uuids)
    }
}

/// Options for [`Archive::ingest`].
#[derive(Default)]
pub struct IngestOptions {
    /// Product type; determined automatically when absent.
    pub product_type: Option<String>,
    /// Pre-built properties; skips plugin analysis when present.
    pub properties: Option<Properties>,
    /// When false, only catalogue the product properties.
    pub catalogue_only: bool,
    /// Store symbolic links instead of copies; `None` uses the storage
    /// configuration.
    pub use_symlinks: Option<bool>,
    /// Verify the archived data against the computed hash afterwards.
    pub verify_hash: bool,
    /// Keep the files at their current path inside the archive root.
    pub use_current_path: bool,
    /// Remove an existing product with the same type and name first.
    pub force: bool,
}

/// Options for [`Archive::attach`].
#[derive(Default)]
pub struct AttachOptions {
    pub product_type: Option<String>,
    pub use_symlinks: Option<bool>,
    pub verify_hash: bool,
    /// Check the files against the catalogued hash before attaching.
    pub verify_hash_before: bool,
    pub use_current_path: bool,
    /// Skip the size check against the catalogued size.
    pub force: bool,
}

#[derive(Clone, Copy)]
enum Hook {
    PostCreate,
    PostIngest,
    PostPull,
    PostRemove,
}

pub struct Archive {
    id: Option<String>,
    catalogue: Box<dyn Catalogue>,
    storage: Option<Box<dyn Storage>>,
    namespace_schemas: BTreeMap<String, Schema>,
    product_type_plugins: Vec<(String, Arc<dyn ProductType>)>,
    remote_backend_plugins: Vec<(String, Arc<dyn RemoteBackend>)>,
    hook_extensions: Vec<(String, Arc<dyn HookExtension>)>,
    export_formats: BTreeSet<String>,
    cascade_grace_period: Duration,
    max_cascade_cycles: u32,
    auth_file: Option<PathBuf>,
    tempdir: Option<PathBuf>,
}

impl Archive {
    /// Build an archive from its configuration, resolving extension names
    /// against the registry.
    pub fn create(config: &Config, id: Option<String>, registry: &Registry) -> Result<Archive> {
        let catalogue: Box<dyn Catalogue> = match config.archive.database.as_str() {
            "sqlite" => {
                let sqlite = config.sqlite.as_ref().ok_or_else(|| {
                    Error::User("missing [sqlite] section in configuration".to_string())
                })?;
                Box::new(SqliteCatalogue::new(sqlite)?)
            }
            other => {
                return Err(Error::User(format!(
                    "unsupported database backend: \"{}\"",
                    other
                )))
            }
        };

        let storage: Option<Box<dyn Storage>> = match config.archive.storage.as_str() {
            "none" => None,
            "fs" => {
                let fs = config.fs.as_ref().ok_or_else(|| {
                    Error::User("missing [fs] section in configuration".to_string())
                })?;
                Some(Box::new(FilesystemStorage::new(fs)))
            }
            other => {
                return Err(Error::User(format!(
                    "unsupported storage backend: \"{}\"",
                    other
                )))
            }
        };

        let mut archive = Archive {
            id,
            catalogue,
            storage,
            namespace_schemas: BTreeMap::new(),
            product_type_plugins: Vec::new(),
            remote_backend_plugins: Vec::new(),
            hook_extensions: Vec::new(),
            export_formats: BTreeSet::new(),
            cascade_grace_period: Duration::minutes(config.archive.cascade_grace_period),
            max_cascade_cycles: config.archive.max_cascade_cycles,
            auth_file: config.archive.auth_file.as_ref().map(PathBuf::from),
            tempdir: config.archive.tempdir.as_ref().map(PathBuf::from),
        };

        archive.register_namespace("core", core_schema())?;

        archive.register_remote_backend("file", Arc::new(FileBackend))?;
        archive.register_remote_backend(
            "http",
            Arc::new(HttpBackend::new(
                "http://",
                config.remote.timeout,
                config.remote.retries,
            )),
        )?;
        archive.register_remote_backend(
            "https",
            Arc::new(HttpBackend::new(
                "https://",
                config.remote.timeout,
                config.remote.retries,
            )),
        )?;

        for name in &config.archive.namespace_extensions {
            let extension = registry.get(name)?;
            for namespace in extension.namespaces() {
                archive.register_namespace(&namespace, extension.namespace(&namespace)?)?;
            }
        }
        for name in &config.archive.product_type_extensions {
            let extension = registry.get(name)?;
            for product_type in extension.product_types() {
                archive.register_product_type(
                    &product_type,
                    extension.product_type_plugin(&product_type)?,
                )?;
            }
        }
        for name in &config.archive.remote_backend_extensions {
            let extension = registry.get(name)?;
            for backend in extension.remote_backends() {
                archive
                    .register_remote_backend(&backend, extension.remote_backend(&backend)?)?;
            }
        }
        for name in &config.archive.hook_extensions {
            let extension = registry.get(name)?;
            for hook in extension.hook_extensions() {
                archive.register_hook_extension(&hook, extension.hook_extension(&hook)?)?;
            }
        }

        Ok(archive)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Close the archive immediately instead of when the handle is dropped.
    pub fn close(&self) -> Result<()> {
        self.catalogue.disconnect()
    }

    pub fn generate_uuid() -> Uuid {
        Uuid::new_v4()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a namespace. A valid namespace identifier starts with a
    /// lowercase character followed by lowercase characters, underscores, or
    /// digits.
    pub fn register_namespace(&mut self, namespace: &str, schema: Schema) -> Result<()> {
        let mut chars = namespace.chars();
        let valid = matches!(chars.next(), Some('a'..='z'))
            && chars.all(|c| c == '_' || c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid {
            return Err(Error::User(format!(
                "invalid namespace identifier {}",
                namespace
            )));
        }
        if self.namespace_schemas.contains_key(namespace) {
            return Err(Error::User(format!(
                "redefinition of namespace: \"{}\"",
                namespace
            )));
        }

        self.namespace_schemas.insert(namespace.to_string(), schema);
        self.catalogue.initialize(self.namespace_schemas.clone());
        Ok(())
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespace_schemas.keys().cloned().collect()
    }

    pub fn namespace_schema(&self, namespace: &str) -> Result<&Schema> {
        self.namespace_schemas.get(namespace).ok_or_else(|| {
            Error::NotFound(format!(
                "unregistered namespace: \"{}\"; registered namespaces: {}",
                namespace,
                util::quoted_list(self.namespace_schemas.keys())
            ))
        })
    }

    pub fn register_product_type(
        &mut self,
        product_type: &str,
        plugin: Arc<dyn ProductType>,
    ) -> Result<()> {
        if self
            .product_type_plugins
            .iter()
            .any(|(name, _)| name == product_type)
        {
            return Err(Error::User(format!(
                "redefinition of product type: \"{}\"",
                product_type
            )));
        }
        self.export_formats.extend(plugin.export_formats());
        self.product_type_plugins
            .push((product_type.to_string(), plugin));
        Ok(())
    }

    pub fn product_types(&self) -> Vec<String> {
        self.product_type_plugins
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn product_type_plugin(&self, product_type: &str) -> Result<&Arc<dyn ProductType>> {
        self.product_type_plugins
            .iter()
            .find(|(name, _)| name == product_type)
            .map(|(_, plugin)| plugin)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "undefined product type: \"{}\"; defined product types: {}",
                    product_type,
                    util::quoted_list(self.product_type_plugins.iter().map(|(name, _)| name))
                ))
            })
    }

    pub fn register_remote_backend(
        &mut self,
        name: &str,
        plugin: Arc<dyn RemoteBackend>,
    ) -> Result<()> {
        if self
            .remote_backend_plugins
            .iter()
            .any(|(existing, _)| existing == name)
        {
            return Err(Error::User(format!(
                "redefinition of remote backend: \"{}\"",
                name
            )));
        }
        self.remote_backend_plugins.push((name.to_string(), plugin));
        Ok(())
    }

    pub fn remote_backends(&self) -> Vec<String> {
        self.remote_backend_plugins
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn remote_backend(&self, name: &str) -> Result<&Arc<dyn RemoteBackend>> {
        self.remote_backend_plugins
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, plugin)| plugin)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "unregistered remote backend: \"{}\"; registered remote backends: {}",
                    name,
                    util::quoted_list(self.remote_backend_plugins.iter().map(|(n, _)| n))
                ))
            })
    }

    pub(crate) fn remote_backend_plugins(&self) -> impl Iterator<Item = &dyn RemoteBackend> {
        self.remote_backend_plugins
            .iter()
            .map(|(_, plugin)| plugin.as_ref())
    }

    pub fn register_hook_extension(
        &mut self,
        name: &str,
        plugin: Arc<dyn HookExtension>,
    ) -> Result<()> {
        if self
            .hook_extensions
            .iter()
            .any(|(existing, _)| existing == name)
        {
            return Err(Error::User(format!(
                "redefinition of hook extension: \"{}\"",
                name
            )));
        }
        self.hook_extensions.push((name.to_string(), plugin));
        Ok(())
    }

    pub fn hook_extension_names(&self) -> Vec<String> {
        self.hook_extensions
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn export_formats(&self) -> Vec<String> {
        self.export_formats.iter().cloned().collect()
    }

    pub fn auth_file(&self) -> Option<&Path> {
        self.auth_file.as_deref()
    }

    /// The archive root path, when the storage has one.
    pub fn root(&self) -> Option<&Path> {
        self.storage.as_ref().and_then(|storage| storage.root())
    }

    fn storage(&self) -> Result<&dyn Storage> {
        self.storage
            .as_deref()
            .ok_or_else(|| Error::User("operation not available for storage=none".to_string()))
    }

    // ------------------------------------------------------------------
    // Catalogue-only operations
    // ------------------------------------------------------------------

    pub fn search(
        &self,
        where_: &str,
        order_by: &[String],
        limit: Option<u64>,
        parameters: &BTreeMap<String, Value>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>> {
        self.catalogue
            .search(where_, order_by, limit, parameters, namespaces, property_names)
    }

    pub fn count(&self, where_: &str, parameters: &BTreeMap<String, Value>) -> Result<i64> {
        self.catalogue.count(where_, parameters)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn summary(
        &self,
        where_: &str,
        parameters: &BTreeMap<String, Value>,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        having: Option<&str>,
        order_by: &[String],
    ) -> Result<(Vec<Vec<Value>>, Vec<String>)> {
        self.catalogue.summary(
            where_,
            parameters,
            aggregates,
            group_by,
            group_by_tag,
            having,
            order_by,
        )
    }

    pub fn retrieve_properties(
        &self,
        uuid: Uuid,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Properties> {
        self.get_product_by(
            &[("uuid", Value::Uuid(uuid))],
            Some(namespaces),
            property_names,
        )?
        .ok_or_else(|| Error::NotFound(format!("No product found: uuid={}", uuid)))
    }

    /// Create a catalogue record for a product. Fails when `core.uuid`,
    /// `(archive_path, physical_name)`, or `(product_type, product_name)`
    /// collide with an existing record.
    pub fn create_properties(&self, properties: &Properties, disable_hooks: bool) -> Result<()> {
        let mut properties = properties.clone();
        self.refresh_metadata_date(&mut properties)?;
        self.catalogue.insert_product_properties(&properties)?;

        if !disable_hooks {
            self.run_hooks(Hook::PostCreate, &properties, None, false)?;
        }
        Ok(())
    }

    /// Update product properties. Any property except the UUID can be
    /// changed, so use with care; `create_namespaces` inserts namespace
    /// records the product does not have yet.
    pub fn update_properties(
        &self,
        properties: &Properties,
        uuid: Option<Uuid>,
        create_namespaces: bool,
    ) -> Result<()> {
        let new_namespaces = if create_namespaces {
            let mut uuid = uuid;
            if let Some(core_uuid) = properties
                .namespace("core")
                .and_then(|core| core.get_uuid("uuid"))
            {
                match uuid {
                    None => uuid = Some(core_uuid),
                    Some(existing) if existing != core_uuid => {
                        return Err(Error::User(
                            "specified uuid does not match uuid included in the specified \
                             product properties"
                                .to_string(),
                        ))
                    }
                    _ => {}
                }
            }
            let uuid = uuid.ok_or_else(|| {
                Error::User("no uuid specified for update".to_string())
            })?;
            let existing = self.retrieve_properties(uuid, &self.namespaces(), &[])?;
            properties
                .namespace_names()
                .into_iter()
                .filter(|namespace| !existing.has_namespace(namespace))
                .collect()
        } else {
            Vec::new()
        };

        let mut properties = properties.clone();
        self.refresh_metadata_date(&mut properties)?;
        self.catalogue
            .update_product_properties(&properties, uuid, &new_namespaces)
    }

    /// Remove catalogue records without touching storage and without
    /// triggering cascade rules. Returns the number of removed products.
    pub fn delete_properties(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<usize> {
        let products = self.get_products(
            &selection.into(),
            parameters,
            None,
            &["uuid".to_string()],
        )?;
        for product in &products {
            self.catalogue.delete_product_properties(product.uuid()?)?;
        }
        Ok(products.len())
    }

    pub fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        self.catalogue.link(uuid, source_uuids)
    }

    pub fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        self.catalogue.unlink(uuid, source_uuids)
    }

    pub fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.catalogue.source_products(uuid)
    }

    pub fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        self.catalogue.derived_products(uuid)
    }

    pub fn tag(
        &self,
        selection: impl Into<Selection>,
        tags: &[String],
        parameters: &BTreeMap<String, Value>,
    ) -> Result<()> {
        match selection.into() {
            Selection::Uuid(uuid) => self.catalogue.tag(uuid, tags),
            selection => {
                let products = self.get_products(
                    &selection,
                    parameters,
                    None,
                    &["uuid".to_string()],
                )?;
                for product in &products {
                    self.catalogue.tag(product.uuid()?, tags)?;
                }
                Ok(())
            }
        }
    }

    pub fn untag(
        &self,
        selection: impl Into<Selection>,
        tags: Option<&[String]>,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<()> {
        match selection.into() {
            Selection::Uuid(uuid) => self.catalogue.untag(uuid, tags),
            selection => {
                let products = self.get_products(
                    &selection,
                    parameters,
                    None,
                    &["uuid".to_string()],
                )?;
                for product in &products {
                    self.catalogue.untag(product.uuid()?, tags)?;
                }
                Ok(())
            }
        }
    }

    pub fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        self.catalogue.tags(uuid)
    }

    // ------------------------------------------------------------------
    // Preparation and teardown
    // ------------------------------------------------------------------

    /// Prepare the archive for first use. With `force`, any existing
    /// products and catalogue are removed first.
    pub fn prepare(&self, force: bool) -> Result<()> {
        if !force {
            if let Some(storage) = &self.storage {
                if storage.exists()? {
                    return Err(Error::User("storage already exists".to_string()));
                }
            }
            if self.catalogue.exists()? {
                return Err(Error::User("database already exists".to_string()));
            }
        }

        self.destroy()?;

        self.catalogue.prepare(false)?;
        if let Some(storage) = &self.storage {
            storage.prepare()?;
        }
        Ok(())
    }

    pub fn prepare_catalogue(&self, dry_run: bool) -> Result<Vec<String>> {
        self.catalogue.prepare(dry_run)
    }

    /// Completely remove the archive: catalogue and stored products.
    pub fn destroy(&self) -> Result<()> {
        self.destroy_catalogue()?;
        if let Some(storage) = &self.storage {
            storage.destroy()?;
        }
        Ok(())
    }

    /// Remove the catalogue but leave the data store untouched.
    pub fn destroy_catalogue(&self) -> Result<()> {
        if self.catalogue.exists()? {
            self.catalogue.destroy()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ingest and attach
    // ------------------------------------------------------------------

    /// Determine the product type of a product; the first plugin that
    /// identifies the paths wins, in registration order.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<String> {
        for (product_type, plugin) in &self.product_type_plugins {
            if plugin.identify(paths) {
                return Ok(product_type.clone());
            }
        }
        Err(Error::User(format!(
            "unable to identify product: {}",
            util::quoted_list(paths.iter().map(|path| path.display()))
        )))
    }

    /// Ingest a product into the archive. Multiple paths are ingested as one
    /// logical product. Returns the product properties.
    pub fn ingest(&self, paths: &[PathBuf], options: IngestOptions) -> Result<Properties> {
        let paths = check_paths(paths, "ingest")?;

        let product_type = match options.product_type {
            Some(product_type) => product_type,
            None => self.identify(&paths)?,
        };
        let plugin = Arc::clone(self.product_type_plugin(&product_type)?);

        let (mut properties, tags) = match options.properties {
            Some(properties) => (properties, Vec::new()),
            None => self.analyze_paths(plugin.as_ref(), &paths)?,
        };

        if properties
            .namespace("core")
            .and_then(|core| core.get_text("product_name"))
            .is_none()
        {
            return Err(Error::User(
                "product_name is required in core properties".to_string(),
            ));
        }

        let uuid = Archive::generate_uuid();
        let size = util::product_size(&paths, true, false)? as i64;
        {
            let core = properties.core_mut();
            core.set("uuid", uuid);
            core.set("active", false);
            core.set("hash", Value::Null);
            core.set("size", size);
            core.set("product_type", product_type.as_str());
        }

        // Physical product name: the enclosing directory for multi-file
        // products, else the single file's basename.
        let physical_name = if plugin.use_enclosing_directory() {
            plugin.enclosing_directory(&properties)?
        } else if paths.len() == 1 {
            basename(&paths[0])?
        } else {
            return Err(Error::User(
                "cannot ingest multi-file product without enclosing directory".to_string(),
            ));
        };
        properties
            .core_mut()
            .set("physical_name", physical_name.as_str());

        let ingest_product = !options.catalogue_only && self.storage.is_some();
        if ingest_product {
            let archive_path = if options.use_current_path {
                self.storage()?.current_archive_path(&paths, &properties)?
            } else {
                plugin.archive_path(&properties)?
            };
            properties
                .core_mut()
                .set("archive_path", archive_path.as_str());
        }

        if options.force {
            self.force_remove_existing(&properties, &paths, plugin.as_ref())?;
        }

        self.create_properties(&properties, true)?;

        // Ingest the product data; roll the catalogue entry back when the
        // failure cannot have left anything in storage.
        let result = (|| -> Result<()> {
            // The hash is computed only after the catalogue insert
            // succeeded, so failed inserts don't incur the cost.
            if let Some(algorithm) = plugin.hash_type() {
                let digest = product_hash(&paths, algorithm).map_err(|error| {
                    Error::User(format!("cannot determine product hash [{}]", error))
                })?;
                properties.core_mut().set("hash", digest.as_str());
                let mut update = Properties::with_core();
                update.core_mut().set("hash", digest.as_str());
                self.update_properties(&update, Some(uuid), false)?;
            }

            if ingest_product {
                self.storage()?.put(
                    Some(&paths),
                    &properties,
                    plugin.use_enclosing_directory(),
                    if options.use_current_path {
                        Some(false)
                    } else {
                        options.use_symlinks
                    },
                    None,
                    None,
                )?;
                properties
                    .core_mut()
                    .set("archive_date", self.catalogue.server_time_utc()?);
            } else if self.storage.is_none() {
                let remote_url = if paths.len() == 1 {
                    format!("file://{}", paths[0].display())
                } else {
                    let parent = paths[0].parent().unwrap_or(Path::new("/"));
                    format!("file://{}", parent.display())
                };
                properties.core_mut().set("remote_url", remote_url.as_str());
                let mut update = Properties::with_core();
                update.core_mut().set("remote_url", remote_url.as_str());
                self.update_properties(&update, Some(uuid), false)?;
            }
            Ok(())
        })();

        if let Err(error) = result {
            let anything_stored =
                matches!(error, Error::Storage { anything_stored: true, .. });
            if !anything_stored {
                self.catalogue.delete_product_properties(uuid)?;
            }
            return Err(error.into_storage_source());
        }

        // activate
        properties.core_mut().set("active", true);
        let mut update = Properties::with_core();
        update.core_mut().set("active", true);
        update.core_mut().set(
            "archive_date",
            properties
                .namespace("core")
                .and_then(|core| core.get_timestamp("archive_date"))
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        self.update_properties(&update, Some(uuid), false)?;

        self.catalogue.tag(uuid, &tags)?;

        if ingest_product && options.verify_hash {
            if !self.verify_hash(Selection::Uuid(uuid), &BTreeMap::new())?.is_empty() {
                return Err(Error::HashMismatch(
                    "ingested product has incorrect hash".to_string(),
                ));
            }
        }

        if ingest_product {
            self.run_hooks(Hook::PostIngest, &properties, Some(&paths), false)?;
        } else {
            self.run_hooks(Hook::PostCreate, &properties, None, false)?;
        }

        debug!("ingested product {}", properties.display_name());
        Ok(properties)
    }

    /// Force-mode ingest: remove an existing product with the same type and
    /// name. When the existing row points at the files being ingested
    /// in-place, only the catalogue entry is removed so the bytes survive.
    fn force_remove_existing(
        &self,
        properties: &Properties,
        paths: &[PathBuf],
        plugin: &dyn ProductType,
    ) -> Result<()> {
        let existing = self.get_product_by(
            &[
                (
                    "product_type",
                    Value::Text(properties.product_type()?.to_string()),
                ),
                (
                    "product_name",
                    Value::Text(properties.product_name()?.to_string()),
                ),
            ],
            None,
            &[],
        )?;

        let existing = match existing {
            Some(existing) => existing,
            None => return Ok(()),
        };

        match existing.archive_path() {
            Some(existing_archive_path) => {
                let mut ingest_path = paths[0].parent().map(Path::to_path_buf);
                if plugin.use_enclosing_directory() {
                    ingest_path = ingest_path.as_deref().and_then(Path::parent).map(Path::to_path_buf);
                }
                let root = self
                    .root()
                    .ok_or_else(|| {
                        Error::User("operation not available for storage=none".to_string())
                    })?
                    .to_path_buf();
                let current_path = root.join(existing_archive_path);

                if properties.archive_path() != Some(existing_archive_path) {
                    return Err(Error::User(
                        "cannot force ingest because of archive_path mismatch".to_string(),
                    ));
                }
                if ingest_path.as_deref() == Some(current_path.as_path()) {
                    // the bytes being ingested are the stored bytes
                    self.delete_properties(Selection::Uuid(existing.uuid()?), &BTreeMap::new())?;
                } else {
                    self.remove(Selection::Uuid(existing.uuid()?), &BTreeMap::new(), true, true)?;
                }
            }
            None => {
                self.delete_properties(Selection::Uuid(existing.uuid()?), &BTreeMap::new())?;
            }
        }
        Ok(())
    }

    /// Add product data to the archive for an existing metadata record (the
    /// inverse of a strip). The record is found by product type and physical
    /// name and must not have data in the archive yet.
    pub fn attach(&self, paths: &[PathBuf], options: AttachOptions) -> Result<Properties> {
        self.storage()?;
        let paths = check_paths(paths, "attach")?;

        let product_type = match options.product_type {
            Some(product_type) => product_type,
            None => self.identify(&paths)?,
        };
        let plugin = Arc::clone(self.product_type_plugin(&product_type)?);

        let (analyzed, _tags) = self.analyze_paths(plugin.as_ref(), &paths)?;

        let physical_name = if plugin.use_enclosing_directory() {
            plugin.enclosing_directory(&analyzed)?
        } else if paths.len() == 1 {
            basename(&paths[0])?
        } else {
            return Err(Error::User(
                "cannot attach multi-file product without enclosing directory".to_string(),
            ));
        };

        let mut product = self
            .get_product_by(
                &[
                    ("product_type", Value::Text(product_type.clone())),
                    ("physical_name", Value::Text(physical_name.clone())),
                ],
                Some(&plugin.namespaces()),
                &[],
            )?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No product found: product_type={} physical_name={}",
                    product_type, physical_name
                ))
            })?;
        let uuid = product.uuid()?;

        if product.archive_path().is_some() {
            return Err(Error::User(format!(
                "product with physical_name '{}' is already in the archive",
                physical_name
            )));
        }
        let archive_path = if options.use_current_path {
            self.storage()?.current_archive_path(&paths, &product)?
        } else {
            plugin.archive_path(&product)?
        };

        let size = util::product_size(&paths, true, false)? as i64;
        if !options.force && Some(size) != product.size() {
            return Err(Error::User(
                "size mismatch between product and existing metadata".to_string(),
            ));
        }

        if options.verify_hash_before {
            if let Some(stored_hash) = product.hash() {
                let (algorithm, stored_hash) = normalize_hash(stored_hash);
                if product_hash(&paths, algorithm)? != stored_hash {
                    return Err(Error::HashMismatch(
                        "hash mismatch between product and existing metadata".to_string(),
                    ));
                }
            }
        }

        let digest = match plugin.hash_type() {
            Some(algorithm) => Some(product_hash(&paths, algorithm)?),
            None => None,
        };

        // deactivate while the data is being attached
        {
            let core = product.core_mut();
            core.set("active", false);
            core.set("size", size);
            core.set("archive_path", archive_path.as_str());
        }
        let mut update = Properties::with_core();
        update.core_mut().set("active", false);
        update.core_mut().set("size", size);
        update.core_mut().set("archive_path", archive_path.as_str());
        if let Some(digest) = &digest {
            update.core_mut().set("hash", digest.as_str());
        }
        self.update_properties(&update, Some(uuid), false)?;

        let result = self.storage()?.put(
            Some(&paths),
            &product,
            plugin.use_enclosing_directory(),
            if options.use_current_path {
                Some(false)
            } else {
                options.use_symlinks
            },
            None,
            None,
        );
        if let Err(error) = result {
            let anything_stored =
                matches!(error, Error::Storage { anything_stored: true, .. });
            if !anything_stored {
                let mut reset = Properties::with_core();
                reset.core_mut().set("active", true);
                reset.core_mut().set("archive_path", Value::Null);
                self.update_properties(&reset, Some(uuid), false)?;
            }
            return Err(error.into_storage_source());
        }

        if options.verify_hash {
            if !self.verify_hash(Selection::Uuid(uuid), &BTreeMap::new())?.is_empty() {
                return Err(Error::HashMismatch(
                    "ingested product has incorrect hash".to_string(),
                ));
            }
        }

        // activate
        let archive_date = self.catalogue.server_time_utc()?;
        {
            let core = product.core_mut();
            core.set("active", true);
            core.set("archive_date", archive_date);
        }
        let mut update = Properties::with_core();
        update.core_mut().set("active", true);
        update.core_mut().set("archive_date", archive_date);
        self.update_properties(&update, Some(uuid), false)?;

        Ok(product)
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    /// Pull remote products into the archive. Candidates must be active,
    /// carry a `remote_url`, and have no data in the archive yet. Returns
    /// the number of pulled products.
    pub fn pull(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
        verify_hash: bool,
        verify_hash_download: bool,
    ) -> Result<usize> {
        self.storage()?;
        let namespaces = self.namespaces();
        let products =
            self.get_products(&selection.into(), parameters, Some(&namespaces), &[])?;

        for mut product in products.iter().cloned() {
            if !product.active() {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
            if product.archive_path().is_some() {
                return Err(Error::User(format!(
                    "product {} is already in the local archive",
                    product.display_name()
                )));
            }
            if product.remote_url().is_none() {
                return Err(Error::User(format!(
                    "product {} does not have a remote_url",
                    product.display_name()
                )));
            }

            let plugin = Arc::clone(self.product_type_plugin(product.product_type()?)?);
            let use_enclosing_directory = plugin.use_enclosing_directory();
            let archive_path = plugin.archive_path(&product)?;
            product
                .core_mut()
                .set("archive_path", archive_path.as_str());
            let uuid = product.uuid()?;

            // stage in the catalogue: deactivate with the target path set
            let mut update = Properties::with_core();
            update.core_mut().set("active", false);
            update.core_mut().set("archive_path", archive_path.as_str());
            self.update_properties(&update, Some(uuid), false)?;

            let product_ref = &product;
            let retrieve = |target_dir: &Path| -> Result<Vec<PathBuf>> {
                let paths =
                    remote::pull_files(self, product_ref, verify_hash_download, target_dir)?;
                if paths.len() > 1 && !use_enclosing_directory {
                    return Err(Error::User(
                        "cannot pull multi-file product without enclosing directory"
                            .to_string(),
                    ));
                }
                Ok(paths)
            };

            let mut activate = |paths: &[PathBuf]| -> Result<()> {
                let product_path = self.storage()?.product_path(product_ref)?;
                let size = self.storage()?.size(&product_path)? as i64;
                let mut update = Properties::with_core();
                update.core_mut().set("active", true);
                update
                    .core_mut()
                    .set("archive_date", self.catalogue.server_time_utc()?);
                update.core_mut().set("size", size);
                self.update_properties(&update, Some(uuid), false)?;

                if verify_hash && product_ref.hash().is_some() {
                    if !self
                        .verify_hash(Selection::Uuid(uuid), &BTreeMap::new())?
                        .is_empty()
                    {
                        return Err(Error::HashMismatch(format!(
                            "pulled product {} has incorrect hash",
                            product_ref.display_name()
                        )));
                    }
                }

                self.run_hooks(Hook::PostPull, product_ref, Some(paths), false)
            };

            let result = self.storage()?.put(
                None,
                &product,
                use_enclosing_directory,
                Some(false),
                Some(&retrieve),
                Some(&mut activate),
            );
            if let Err(error) = result {
                let anything_stored =
                    matches!(error, Error::Storage { anything_stored: true, .. });
                if !anything_stored {
                    let mut reset = Properties::with_core();
                    reset.core_mut().set("active", true);
                    reset.core_mut().set("archive_path", Value::Null);
                    reset.core_mut().set("archive_date", Value::Null);
                    self.update_properties(&reset, Some(uuid), false)?;
                }
                return Err(error.into_storage_source());
            }
        }

        Ok(products.len())
    }

    // ------------------------------------------------------------------
    // Retrieve and export
    // ------------------------------------------------------------------

    /// Copy (or symlink) products into a target directory. Returns the
    /// retrieved paths.
    pub fn retrieve(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut property_names: Vec<String> =
            CORE_PROPERTY_NAMES.iter().map(|s| s.to_string()).collect();
        property_names.push("remote_url".to_string());
        let products =
            self.get_products(&selection.into(), parameters, None, &property_names)?;

        let mut result = Vec::new();
        for product in &products {
            if product.active()
                && (product.archive_path().is_some() || product.remote_url().is_some())
            {
                result.push(self.retrieve_product(product, target_path, use_symlinks)?);
            } else {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
        }
        Ok(result)
    }

    fn retrieve_product(
        &self,
        product: &Properties,
        target_path: &Path,
        use_symlinks: bool,
    ) -> Result<PathBuf> {
        if product.archive_path().is_some() {
            let storage = self.storage()?;
            let product_path = storage.product_path(product)?;
            let plugin = self.product_type_plugin(product.product_type()?)?;
            storage.get(
                product,
                &product_path,
                target_path,
                plugin.use_enclosing_directory(),
                Some(use_symlinks),
            )?;
            Ok(target_path.join(product_path.file_name().unwrap_or_default()))
        } else if product.remote_url().is_some() {
            let paths = remote::pull_files(self, product, true, target_path)?;
            match paths.as_slice() {
                [single] => Ok(single.clone()),
                _ => Ok(target_path.to_path_buf()),
            }
        } else {
            Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )))
        }
    }

    /// Export products, consulting the product type plugin for alternative
    /// formats; falls back to plain retrieval.
    pub fn export(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
        target_path: &Path,
        format: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        if let Some(format) = format {
            let valid = !format.is_empty()
                && format
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
                && format.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(Error::User(format!("invalid export format '{}'", format)));
            }
        }

        let namespaces = self.namespaces();
        let products =
            self.get_products(&selection.into(), parameters, Some(&namespaces), &[])?;

        let mut result = Vec::new();
        for product in &products {
            if !product.active() {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }

            let plugin = self.product_type_plugin(product.product_type()?)?;
            if let Some(format) = format {
                if !plugin.export_formats().iter().any(|f| f == format) {
                    return Err(Error::NotFound(format!(
                        "export format '{}' not supported for product {}",
                        format,
                        product.display_name()
                    )));
                }
            }

            match plugin.export(self, product, target_path, None, format)? {
                Some(path) => result.push(path),
                None => {
                    if format.is_some() {
                        return Err(Error::NotFound(format!(
                            "export format not supported for product {}",
                            product.display_name()
                        )));
                    }
                    result.push(self.retrieve_product(product, target_path, false)?);
                }
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Strip, remove, cascade
    // ------------------------------------------------------------------

    /// Remove product data from storage while keeping the catalogue record.
    /// Returns the number of stripped products.
    pub fn strip(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
        force: bool,
        cascade: bool,
    ) -> Result<usize> {
        self.storage()?;
        let property_names: Vec<String> = CORE_PROPERTY_NAMES
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once("archive_date".to_string()))
            .collect();
        let products =
            self.get_products(&selection.into(), parameters, None, &property_names)?;

        for product in &products {
            if force {
                // guard against double-strip: an active product without data
                // and without an archive date has nothing to strip
                let archive_date_present = product
                    .namespace("core")
                    .map(|core| core.is_defined("archive_date"))
                    .unwrap_or(false);
                if product.active() && product.archive_path().is_none() && !archive_date_present
                {
                    continue;
                }
            } else {
                if product.archive_path().is_none() {
                    continue;
                }
                if !product.active() {
                    return Err(Error::User(format!(
                        "product {} not available",
                        product.display_name()
                    )));
                }
            }
            self.strip_product(product)?;
        }

        if cascade && !products.is_empty() {
            self.cleanup_derived_products()?;
        }
        Ok(products.len())
    }

    fn strip_product(&self, product: &Properties) -> Result<()> {
        // clear the archive path first; the in-memory record still points at
        // the stored data for the storage removal below
        let mut update = Properties::with_core();
        update.core_mut().set("active", true);
        update.core_mut().set("archive_path", Value::Null);
        update.core_mut().set("archive_date", Value::Null);
        self.update_properties(&update, Some(product.uuid()?), false)?;

        self.remove_storage(product)
    }

    /// Remove products from the archive, both storage and catalogue.
    /// Returns the number of removed products (cascaded removals excluded).
    pub fn remove(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
        force: bool,
        cascade: bool,
    ) -> Result<usize> {
        let property_names: Vec<String> =
            CORE_PROPERTY_NAMES.iter().map(|s| s.to_string()).collect();
        let products =
            self.get_products(&selection.into(), parameters, None, &property_names)?;

        for product in &products {
            if !product.active() && !force {
                return Err(Error::User(format!(
                    "product {} not available",
                    product.display_name()
                )));
            }
            self.purge_product(product)?;
        }

        if cascade && !products.is_empty() {
            self.cleanup_derived_products()?;
        }
        Ok(products.len())
    }

    fn purge_product(&self, product: &Properties) -> Result<()> {
        let product = self.retrieve_properties(product.uuid()?, &self.namespaces(), &[])?;
        self.catalogue.delete_product_properties(product.uuid()?)?;
        self.remove_storage(&product)?;
        self.run_hooks(Hook::PostRemove, &product, None, true)
    }

    fn remove_storage(&self, product: &Properties) -> Result<()> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(()),
        };
        if product.archive_path().is_none() {
            return Ok(());
        }
        let product_path = storage.product_path(product)?;
        storage.delete(&product_path, product)
    }

    /// Clean up derived products whose sources no longer exist, as specified
    /// by the cascade rules of the product type plugins. Runs fixed-point
    /// iteration bounded by `max_cascade_cycles`.
    pub fn cleanup_derived_products(&self) -> Result<()> {
        let mut repeat = true;
        let mut cycle = 0;
        while repeat && cycle < self.max_cascade_cycles {
            repeat = false;
            cycle += 1;
            for (product_type, plugin) in &self.product_type_plugins {
                let rule = plugin.cascade_rule();
                if rule == CascadeRule::Ignore {
                    continue;
                }
                debug!("cascade cycle {} for product type {}", cycle, product_type);

                let strip = matches!(rule, CascadeRule::CascadePurgeAsStrip | CascadeRule::Strip);
                let products = self.catalogue.find_products_without_source(
                    Some(product_type),
                    self.cascade_grace_period,
                    strip,
                )?;
                if !products.is_empty() {
                    repeat = true;
                }
                for product in &products {
                    if strip {
                        self.strip_product(product)?;
                    } else {
                        self.purge_product(product)?;
                    }
                }

                if matches!(
                    rule,
                    CascadeRule::CascadePurgeAsStrip | CascadeRule::CascadePurge
                ) {
                    continue;
                }

                let products = self.catalogue.find_products_without_available_source(
                    Some(product_type),
                    Duration::zero(),
                )?;
                if !products.is_empty() {
                    repeat = true;
                }
                for product in &products {
                    if matches!(rule, CascadeRule::Strip | CascadeRule::Cascade) {
                        self.strip_product(product)?;
                    } else {
                        self.purge_product(product)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebuild
    // ------------------------------------------------------------------

    /// Re-extract product properties from the stored data. Only properties
    /// and tags reported by the plugin are updated; the identifying core
    /// fields are preserved, the digest is reconciled when the plugin's hash
    /// algorithm changed, and the product is relocated when the plugin now
    /// reports a different archive path.
    pub fn rebuild_properties(
        &self,
        uuid: Uuid,
        disable_hooks: bool,
        use_current_path: bool,
    ) -> Result<()> {
        let product = self.retrieve_properties(uuid, &self.namespaces(), &[])?;
        if !(product.active()
            && (product.archive_path().is_some() || product.remote_url().is_some()))
        {
            return Err(Error::User(format!(
                "product {} not available",
                product.display_name()
            )));
        }

        let plugin = Arc::clone(self.product_type_plugin(product.product_type()?)?);
        let use_enclosing_directory = plugin.use_enclosing_directory();

        let mut rebuild = |paths: &[PathBuf]| -> Result<()> {
            let (mut properties, tags) = self.analyze_paths(plugin.as_ref(), paths)?;

            if let Some(core) = properties.namespace_mut("core") {
                for name in RESTRICTED_PROPERTIES {
                    core.remove(name);
                }
            }

            let size = if product.archive_path().is_some() {
                let storage = self.storage()?;
                let product_path = storage.product_path(&product)?;
                storage.size(&product_path)? as i64
            } else {
                util::product_size(paths, true, false)? as i64
            };
            properties.core_mut().set("size", size);

            let mut paths: Vec<PathBuf> = paths.to_vec();
            if !use_current_path && product.archive_path().is_some() {
                let (new_archive_path, moved) =
                    self.relocate(&product, Some(&properties), Some(paths.clone()))?;
                if let Some(new_archive_path) = new_archive_path {
                    properties
                        .core_mut()
                        .set("archive_path", new_archive_path.as_str());
                }
                if let Some(moved) = moved {
                    paths = moved;
                }
            }

            // reconcile the digest with the plugin's hash algorithm
            let stored_hash = product.hash();
            match plugin.hash_type() {
                None => {
                    if stored_hash.is_some() {
                        properties.core_mut().set("hash", Value::Null);
                    }
                }
                Some(algorithm) => match stored_hash {
                    None => {
                        properties
                            .core_mut()
                            .set("hash", product_hash(&paths, algorithm)?.as_str());
                    }
                    Some(stored_hash) => match extract_hash_type(stored_hash) {
                        None if algorithm == HashAlgorithm::Sha1 => {
                            properties
                                .core_mut()
                                .set("hash", format!("sha1:{}", stored_hash).as_str());
                        }
                        Some(stored_algorithm) if stored_algorithm == algorithm => {}
                        _ => {
                            properties
                                .core_mut()
                                .set("hash", product_hash(&paths, algorithm)?.as_str());
                        }
                    },
                },
            }

            self.update_properties(&properties, Some(uuid), true)?;
            self.tag(Selection::Uuid(uuid), &tags, &BTreeMap::new())?;

            if !disable_hooks {
                let mut updated = product.clone();
                updated.update(&properties);
                self.run_hooks(Hook::PostIngest, &updated, Some(&paths), false)?;
            }
            Ok(())
        };

        self.run_for_product(&product, use_enclosing_directory, &mut rebuild)
    }

    /// Refresh a pulled product: re-verify and re-run the post pull hook
    /// against the data already in the archive.
    pub fn rebuild_pull_properties(
        &self,
        uuid: Uuid,
        verify_hash: bool,
        disable_hooks: bool,
        use_current_path: bool,
    ) -> Result<()> {
        self.storage()?;
        let mut product = self.retrieve_properties(uuid, &self.namespaces(), &[])?;
        if product.archive_path().is_none() {
            return Err(Error::User("cannot update missing product".to_string()));
        }
        if product.remote_url().is_none() {
            return Err(Error::User(
                "cannot pull products that have no remote_url".to_string(),
            ));
        }

        let plugin = Arc::clone(self.product_type_plugin(product.product_type()?)?);
        let use_enclosing_directory = plugin.use_enclosing_directory();

        if !use_current_path {
            let (new_archive_path, _) = self.relocate(&product, None, None)?;
            if let Some(new_archive_path) = new_archive_path {
                let mut update = Properties::with_core();
                update
                    .core_mut()
                    .set("archive_path", new_archive_path.as_str());
                self.update_properties(&update, Some(uuid), false)?;
                product
                    .core_mut()
                    .set("archive_path", new_archive_path.as_str());
            }
        }

        let storage = self.storage()?;
        let product_path = storage.product_path(&product)?;
        let size = storage.size(&product_path)? as i64;
        product.core_mut().set("size", size);

        let product_ref = &product;
        let mut refresh = |paths: &[PathBuf]| -> Result<()> {
            if verify_hash && product_ref.hash().is_some() {
                if !self.verify_product_hash(product_ref, Some(paths))? {
                    return Err(Error::HashMismatch(format!(
                        "pulled product {} has incorrect hash",
                        product_ref.display_name()
                    )));
                }
            }
            if !disable_hooks {
                self.run_hooks(Hook::PostPull, product_ref, Some(paths), false)?;
            }
            Ok(())
        };

        self.run_for_product(&product, use_enclosing_directory, &mut refresh)
    }

    /// Relocate a product to the archive path reported by its plugin.
    /// Returns the new archive path (when the product moved) and the
    /// possibly rewritten local paths.
    fn relocate(
        &self,
        product: &Properties,
        updates: Option<&Properties>,
        paths: Option<Vec<PathBuf>>,
    ) -> Result<(Option<String>, Option<Vec<PathBuf>>)> {
        let merged = match updates {
            Some(updates) => {
                let mut merged = product.clone();
                merged.update(updates);
                merged
            }
            None => product.clone(),
        };
        let plugin = self.product_type_plugin(merged.product_type()?)?;
        let plugin_archive_path = plugin.archive_path(&merged)?;

        if product.archive_path() != Some(plugin_archive_path.as_str()) {
            let paths = self
                .storage()?
                .move_product(product, &plugin_archive_path, paths)?;
            Ok((Some(plugin_archive_path), paths))
        } else {
            Ok((None, paths))
        }
    }

    // ------------------------------------------------------------------
    // Hash verification
    // ------------------------------------------------------------------

    /// Verify the digest of the selected products against their stored
    /// data. Returns the UUIDs for which verification failed; products
    /// without stored data are skipped, a missing digest is an error.
    pub fn verify_hash(
        &self,
        selection: impl Into<Selection>,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<Vec<Uuid>> {
        let mut property_names: Vec<String> =
            CORE_PROPERTY_NAMES.iter().map(|s| s.to_string()).collect();
        property_names.push("hash".to_string());
        property_names.push("remote_url".to_string());
        let products =
            self.get_products(&selection.into(), parameters, None, &property_names)?;

        let mut failed = Vec::new();
        for product in &products {
            if !self.verify_product_hash(product, None)? {
                failed.push(product.uuid()?);
            }
        }
        Ok(failed)
    }

    fn verify_product_hash(
        &self,
        product: &Properties,
        paths: Option<&[PathBuf]>,
    ) -> Result<bool> {
        if product.archive_path().is_none() && product.remote_url().is_none() {
            return Ok(true);
        }

        let stored_hash = product.hash().ok_or_else(|| {
            Error::User(format!(
                "no hash available for product {}",
                product.display_name()
            ))
        })?;
        let (algorithm, stored_hash) = normalize_hash(stored_hash);

        let current_hash = match paths {
            Some(paths) => product_hash(paths, algorithm)?,
            None => {
                let plugin = self.product_type_plugin(product.product_type()?)?;
                let mut digest = None;
                self.run_for_product(
                    product,
                    plugin.use_enclosing_directory(),
                    &mut |paths| {
                        digest = Some(product_hash(paths, algorithm)?);
                        Ok(())
                    },
                )?;
                digest.ok_or_else(|| {
                    Error::Internal("hash computation yielded no result".to_string())
                })?
            }
        };

        Ok(current_hash == stored_hash)
    }

    // ------------------------------------------------------------------
    // Paths and helpers
    // ------------------------------------------------------------------

    /// Global path of a product's data: its location in storage, or its
    /// remote URL when only catalogued remotely, or None for a
    /// properties-only product.
    pub fn product_path(&self, product: &Properties) -> Result<Option<String>> {
        if product.archive_path().is_some() {
            if let Some(storage) = &self.storage {
                let path = storage.product_path(product)?;
                return Ok(Some(format!(
                    "{}{}",
                    storage.global_prefix(),
                    path.display()
                )));
            }
            return Ok(None);
        }
        Ok(product.remote_url().map(String::from))
    }

    /// Run a callback against a product's files: directly in storage, or
    /// against a local copy pulled into a scratch directory for
    /// catalogue-only archives.
    pub fn run_for_product(
        &self,
        product: &Properties,
        use_enclosing_directory: bool,
        callback: &mut dyn FnMut(&[PathBuf]) -> Result<()>,
    ) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.run_for_product(product, use_enclosing_directory, callback),
            None => {
                let remote_url = product.remote_url().ok_or_else(|| {
                    Error::User(format!(
                        "product {} not available",
                        product.display_name()
                    ))
                })?;
                if let Some(product_path) = remote_url.strip_prefix("file://") {
                    let product_path = Path::new(product_path);
                    let paths = if product_path.is_dir() {
                        let mut paths = Vec::new();
                        for entry in std::fs::read_dir(product_path)? {
                            paths.push(entry?.path());
                        }
                        paths
                    } else {
                        vec![product_path.to_path_buf()]
                    };
                    callback(&paths)
                } else {
                    let mut builder = tempfile::Builder::new();
                    let suffix = format!("-{}", product.uuid()?.simple());
                    builder.prefix(".run_for_product-").suffix(&suffix);
                    let scratch = match &self.tempdir {
                        Some(tempdir) => builder.tempdir_in(tempdir)?,
                        None => builder.tempdir()?,
                    };
                    let paths = remote::pull_files(self, product, true, scratch.path())?;
                    callback(&paths)
                }
            }
        }
    }

    fn refresh_metadata_date(&self, properties: &mut Properties) -> Result<()> {
        let now = self.catalogue.server_time_utc()?;
        properties.core_mut().set("metadata_date", now);
        Ok(())
    }

    fn analyze_paths(
        &self,
        plugin: &dyn ProductType,
        paths: &[PathBuf],
    ) -> Result<(Properties, Vec<String>)> {
        let AnalyzeResult { properties, tags } = plugin.analyze(paths)?;

        let declared = plugin.namespaces();
        for (namespace, _) in properties.defined() {
            if namespace != "core" && !declared.contains(namespace) {
                warn!(
                    "plugin namespaces does not contain \"{}\"",
                    namespace
                );
            }
        }

        Ok((properties, tags))
    }

    fn run_hooks(
        &self,
        hook: Hook,
        properties: &Properties,
        paths: Option<&[PathBuf]>,
        reverse: bool,
    ) -> Result<()> {
        let plugin = properties
            .product_type()
            .ok()
            .and_then(|product_type| {
                self.product_type_plugins
                    .iter()
                    .find(|(name, _)| name == product_type)
                    .map(|(_, plugin)| plugin)
            });

        let run_plugin = |plugin: &Arc<dyn ProductType>| -> Result<()> {
            match hook {
                Hook::PostCreate => plugin.post_create_hook(self, properties),
                Hook::PostIngest => plugin.post_ingest_hook(self, properties, paths),
                Hook::PostPull => plugin.post_pull_hook(self, properties, paths),
                Hook::PostRemove => plugin.post_remove_hook(self, properties),
            }
        };
        let run_extension = |extension: &Arc<dyn HookExtension>| -> Result<()> {
            match hook {
                Hook::PostCreate => extension.post_create_hook(self, properties),
                Hook::PostIngest => extension.post_ingest_hook(self, properties, paths),
                Hook::PostPull => extension.post_pull_hook(self, properties, paths),
                Hook::PostRemove => extension.post_remove_hook(self, properties),
            }
        };

        if reverse {
            for (_, extension) in self.hook_extensions.iter().rev() {
                run_extension(extension)?;
            }
            if let Some(plugin) = plugin {
                run_plugin(plugin)?;
            }
        } else {
            if let Some(plugin) = plugin {
                run_plugin(plugin)?;
            }
            for (_, extension) in &self.hook_extensions {
                run_extension(extension)?;
            }
        }
        Ok(())
    }

    /// Locate a single product by exact property values.
    fn get_product_by(
        &self,
        filters: &[(&str, Value)],
        namespaces: Option<&[String]>,
        property_names: &[String],
    ) -> Result<Option<Properties>> {
        let condition: Vec<String> = filters
            .iter()
            .map(|(name, _)| format!("{} == @{}", name, name))
            .collect();
        let condition = condition.join(" and ");
        let parameters: BTreeMap<String, Value> = filters
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();

        let all_namespaces = self.namespaces();
        let namespaces = namespaces.unwrap_or(&all_namespaces);

        let mut products = self.search(
            &condition,
            &[],
            None,
            &parameters,
            namespaces,
            property_names,
        )?;

        match products.len() {
            0 => Ok(None),
            1 => Ok(Some(products.remove(0))),
            _ => Err(Error::Integrity(format!(
                "multiple products found for: {}",
                condition
            ))),
        }
    }

    fn get_products(
        &self,
        selection: &Selection,
        parameters: &BTreeMap<String, Value>,
        namespaces: Option<&[String]>,
        property_names: &[String],
    ) -> Result<Vec<Properties>> {
        match selection {
            Selection::Expression(where_) => {
                let all_namespaces = self.namespaces();
                let namespaces = namespaces.unwrap_or(&all_namespaces);
                self.search(where_, &[], None, parameters, namespaces, property_names)
            }
            Selection::Uuid(uuid) => Ok(vec![self.get_uuid_product(
                *uuid,
                namespaces,
                property_names,
            )?]),
            Selection::Uuids(uuids) => uuids
                .iter()
                .map(|uuid| self.get_uuid_product(*uuid, namespaces, property_names))
                .collect(),
        }
    }

    fn get_uuid_product(
        &self,
        uuid: Uuid,
        namespaces: Option<&[String]>,
        property_names: &[String],
    ) -> Result<Properties> {
        self.get_product_by(&[("uuid", Value::Uuid(uuid))], namespaces, property_names)?
            .ok_or_else(|| Error::NotFound(format!("No product found: uuid={}", uuid)))
    }
}

fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::User(format!(
                "cannot determine basename of \"{}\"",
                path.display()
            ))
        })
}

/// Resolve real paths and reject duplicate basenames across product parts.
fn check_paths(paths: &[PathBuf], action: &str) -> Result<Vec<PathBuf>> {
    if paths.is_empty() {
        return Err(Error::User(format!("nothing to {}", action)));
    }

    let mut resolved = Vec::with_capacity(paths.len());
    for path in paths {
        resolved.push(path.canonicalize().map_err(|error| {
            Error::User(format!("invalid path \"{}\" [{}]", path.display(), error))
        })?);
    }

    let mut basenames = BTreeSet::new();
    for path in &resolved {
        if !basenames.insert(path.file_name().map(|name| name.to_os_string())) {
            return Err(Error::User(
                "basename of each part should be unique for multi-part products".to_string(),
            ));
        }
    }

    Ok(resolved)
}

/// Split a stored digest into algorithm and canonical `algo:hex` form; a
/// bare legacy digest implies sha1.
fn normalize_hash(stored: &str) -> (HashAlgorithm, String) {
    match extract_hash_type(stored) {
        Some(algorithm) => (algorithm, stored.to_string()),
        None => (HashAlgorithm::Sha1, format!("sha1:{}", stored)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selections_from_common_inputs() {
        assert!(matches!(
            Selection::from("product_name == \"x\""),
            Selection::Expression(_)
        ));
        assert!(matches!(Selection::from(Uuid::new_v4()), Selection::Uuid(_)));
        assert!(matches!(
            Selection::from(vec![Uuid::new_v4()]),
            Selection::Uuids(_)
        ));
    }

    #[test]
    fn duplicate_basenames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("same.txt"), b"a").unwrap();
        std::fs::write(sub.join("same.txt"), b"b").unwrap();

        let error = check_paths(
            &[dir.path().join("same.txt"), sub.join("same.txt")],
            "ingest",
        )
        .unwrap_err();
        assert!(error.to_string().contains("unique"));
    }

    #[test]
    fn legacy_hashes_imply_sha1() {
        let (algorithm, canonical) = normalize_hash("0123abcd");
        assert_eq!(algorithm, HashAlgorithm::Sha1);
        assert_eq!(canonical, "sha1:0123abcd");

        let (algorithm, canonical) = normalize_hash("md5:abcd");
        assert_eq!(algorithm, HashAlgorithm::Md5);
        assert_eq!(canonical, "md5:abcd");
    }
}

//! The product catalogue: namespace records, links, and tags in a relational
//! database.

pub mod sqlite;

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use uuid::Uuid;

use crate::error::Result;
use crate::records::{Properties, Value};
use crate::schema::Schema;

pub use sqlite::SqliteCatalogue;

/// Catalogue backend interface.
///
/// Every mutator runs in its own transaction; nested transactions are a
/// programming error and fail fast. Mutators are retry-free; transient errors
/// propagate to the caller.
pub trait Catalogue {
    /// Register the namespace schemas the catalogue maps onto tables. Called
    /// once all namespaces are known, before any other operation.
    fn initialize(&mut self, namespace_schemas: BTreeMap<String, Schema>);

    /// Create the catalogue tables. Returns the DDL statements that were (or
    /// with `dry_run` would have been) executed.
    fn prepare(&self, dry_run: bool) -> Result<Vec<String>>;

    /// Drop all catalogue tables.
    fn destroy(&self) -> Result<()>;

    fn exists(&self) -> Result<bool>;

    /// Drop the database connection to free resources; it is re-established
    /// automatically when required.
    fn disconnect(&self) -> Result<()>;

    fn server_time_utc(&self) -> Result<NaiveDateTime>;

    fn insert_product_properties(&self, properties: &Properties) -> Result<()>;

    /// Update namespace records for a product. Namespaces listed in
    /// `new_namespaces` are inserted; namespaces carried as cleared entries
    /// are deleted; the rest are updated in place.
    fn update_product_properties(
        &self,
        properties: &Properties,
        uuid: Option<Uuid>,
        new_namespaces: &[String],
    ) -> Result<()>;

    /// Delete a product's records, including link rows in both directions.
    fn delete_product_properties(&self, uuid: Uuid) -> Result<()>;

    fn search(
        &self,
        where_: &str,
        order_by: &[String],
        limit: Option<u64>,
        parameters: &BTreeMap<String, Value>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>>;

    fn count(&self, where_: &str, parameters: &BTreeMap<String, Value>) -> Result<i64>;

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        where_: &str,
        parameters: &BTreeMap<String, Value>,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        having: Option<&str>,
        order_by: &[String],
    ) -> Result<(Vec<Vec<Value>>, Vec<String>)>;

    fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()>;

    /// Remove outbound links; with no explicit sources, all of them.
    fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()>;

    fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>>;

    fn tag(&self, uuid: Uuid, tags: &[String]) -> Result<()>;

    fn untag(&self, uuid: Uuid, tags: Option<&[String]>) -> Result<()>;

    fn tags(&self, uuid: Uuid) -> Result<Vec<String>>;

    /// Core properties of active products older than the grace period that
    /// have no linked source products at all.
    fn find_products_without_source(
        &self,
        product_type: Option<&str>,
        grace_period: Duration,
        archived_only: bool,
    ) -> Result<Vec<Properties>>;

    /// Core properties of active products older than the grace period whose
    /// every linked source is known but has no data in storage. Products
    /// with links to products outside the catalogue are excluded, because
    /// their availability cannot be determined.
    fn find_products_without_available_source(
        &self,
        product_type: Option<&str>,
        grace_period: Duration,
    ) -> Result<Vec<Properties>>;
}

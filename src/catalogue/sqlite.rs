//! SQLite catalogue backend (rusqlite, bundled).
//!
//! One table per namespace plus `link` and `tag` tables. Geometry values are
//! stored as EWKB blobs and the `covers`/`intersects` predicates are provided
//! as Rust scalar functions registered on every connection, so no loadable
//! spatial extension is required.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, NaiveDateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ToSql};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geometry;
use crate::language::ExprType;
use crate::records::{Properties, Record, Value};
use crate::schema::{DataType, Schema};
use crate::sql::{
    default_rewriter_table, rewriter_key, Rewriter, RewriterTable, SearchDescription,
    SqlBuilder, SqlDialect,
};

use super::Catalogue;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Configuration of the sqlite backend (`[sqlite]` section).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SqliteConfig {
    pub connection_string: String,
    #[serde(default)]
    pub table_prefix: String,
}

pub struct SqliteCatalogue {
    connection_string: String,
    table_prefix: String,
    namespace_schemas: BTreeMap<String, Schema>,
    rewriters: RewriterTable,
    connection: RefCell<Option<Connection>>,
    in_transaction: Cell<bool>,
}

impl SqliteCatalogue {
    pub fn new(config: &SqliteConfig) -> Result<Self> {
        if !config.table_prefix.is_empty() && !valid_table_prefix(&config.table_prefix) {
            return Err(Error::User(format!(
                "invalid table_prefix {}",
                config.table_prefix
            )));
        }

        let rewriters = sqlite_rewriter_table(config.table_prefix.clone());

        Ok(SqliteCatalogue {
            connection_string: config.connection_string.clone(),
            table_prefix: config.table_prefix.clone(),
            namespace_schemas: BTreeMap::new(),
            rewriters,
            connection: RefCell::new(None),
            in_transaction: Cell::new(false),
        })
    }

    fn core_table(&self) -> String {
        self.table_name("core")
    }

    fn link_table(&self) -> String {
        self.table_name("link")
    }

    fn tag_table(&self) -> String {
        self.table_name("tag")
    }

    fn schema(&self, namespace: &str) -> Result<&Schema> {
        self.namespace_schemas
            .get(namespace)
            .ok_or_else(|| Error::User(format!("undefined namespace: \"{}\"", namespace)))
    }

    fn builder(&self) -> SqlBuilder<'_, SqliteCatalogue> {
        SqlBuilder::new(&self.namespace_schemas, self)
    }

    fn connect(&self) -> Result<Connection> {
        let need_prepare = !Path::new(&self.connection_string).exists();
        let connection = Connection::open(&self.connection_string)?;
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        register_geometry_functions(&connection)?;

        if need_prepare {
            connection.execute_batch("BEGIN")?;
            let result: Result<()> = self
                .create_tables_sql()
                .iter()
                .try_for_each(|statement| {
                    connection.execute_batch(statement)?;
                    Ok(())
                });
            match result {
                Ok(()) => connection.execute_batch("COMMIT")?,
                Err(error) => {
                    let _ = connection.execute_batch("ROLLBACK");
                    return Err(error);
                }
            }
        }

        Ok(connection)
    }

    /// Run a closure inside a transaction. Nested transactions are a
    /// programming error; the connection is (re-)established on demand.
    fn transaction<T>(&self, operation: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.in_transaction.get() {
            return Err(Error::Internal(
                "nested transactions are not supported".to_string(),
            ));
        }

        if self.connection.borrow().is_none() {
            let connection = self.connect()?;
            *self.connection.borrow_mut() = Some(connection);
        }

        let borrowed = self.connection.borrow();
        let connection = borrowed
            .as_ref()
            .ok_or_else(|| Error::Internal("catalogue connection lost".to_string()))?;

        self.in_transaction.set(true);
        let result = (|| -> Result<T> {
            connection.execute_batch("BEGIN")?;
            match operation(connection) {
                Ok(value) => {
                    connection.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(error) => {
                    let _ = connection.execute_batch("ROLLBACK");
                    Err(error)
                }
            }
        })();
        self.in_transaction.set(false);
        result
    }

    fn create_tables_sql(&self) -> Vec<String> {
        let mut statements = Vec::new();
        let core_table = self.core_table();

        if let Some(schema) = self.namespace_schemas.get("core") {
            let mut columns: Vec<String> = schema
                .iter()
                .map(|field| {
                    let mut sql = format!("{} {}", field.name, column_type(field.data_type));
                    if !field.optional {
                        sql.push_str(" NOT NULL");
                    }
                    sql
                })
                .collect();
            columns.push("PRIMARY KEY (uuid)".to_string());
            columns.push("UNIQUE (archive_path, physical_name)".to_string());
            columns.push("UNIQUE (product_type, product_name)".to_string());
            statements.push(format!(
                "CREATE TABLE {} ({})",
                core_table,
                columns.join(", ")
            ));
            for field in schema.iter() {
                if field.index {
                    statements.push(format!(
                        "CREATE INDEX idx_{}_{} ON {} ({})",
                        core_table, field.name, core_table, field.name
                    ));
                }
            }
        }

        for (namespace, schema) in &self.namespace_schemas {
            if namespace == "core" {
                continue;
            }
            let table = self.table_name(namespace);
            let mut columns: Vec<String> = schema
                .iter()
                .map(|field| {
                    let mut sql = format!("{} {}", field.name, column_type(field.data_type));
                    if !field.optional {
                        sql.push_str(" NOT NULL");
                    }
                    sql
                })
                .collect();
            columns.push(format!(
                "uuid UUID PRIMARY KEY REFERENCES {}(uuid) ON DELETE CASCADE",
                core_table
            ));
            statements.push(format!("CREATE TABLE {} ({})", table, columns.join(", ")));
            for field in schema.iter() {
                if field.index {
                    statements.push(format!(
                        "CREATE INDEX idx_{}_{} ON {} ({})",
                        table, field.name, table, field.name
                    ));
                }
            }
        }

        // Explicit id primary keys so link and tag rows can be managed by
        // front-ends that cannot handle tuple keys.
        let link_table = self.link_table();
        statements.push(format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, \
             uuid UUID REFERENCES {}(uuid) ON DELETE CASCADE, \
             source_uuid UUID NOT NULL, UNIQUE (uuid, source_uuid))",
            link_table, core_table
        ));
        statements.push(format!(
            "CREATE INDEX idx_{}_uuid ON {} (uuid)",
            link_table, link_table
        ));
        statements.push(format!(
            "CREATE INDEX idx_{}_source_uuid ON {} (source_uuid)",
            link_table, link_table
        ));

        let tag_table = self.tag_table();
        statements.push(format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, \
             uuid UUID REFERENCES {}(uuid) ON DELETE CASCADE, \
             tag TEXT NOT NULL, UNIQUE (uuid, tag))",
            tag_table, core_table
        ));
        statements.push(format!(
            "CREATE INDEX idx_{}_uuid ON {} (uuid)",
            tag_table, tag_table
        ));
        statements.push(format!(
            "CREATE INDEX idx_{}_tag ON {} (tag)",
            tag_table, tag_table
        ));

        statements
    }

    fn insert_namespace(
        &self,
        connection: &Connection,
        uuid: Uuid,
        namespace: &str,
        record: &Record,
    ) -> Result<()> {
        let schema = self.schema(namespace)?;
        schema.validate(namespace, record, false)?;

        let mut fields: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (name, value) in record.iter() {
            fields.push(name);
            values.push(to_sql(value)?);
        }
        if !record.contains("uuid") {
            // foreign key for non-core namespaces
            fields.push("uuid");
            values.push(to_sql(&Value::Uuid(uuid))?);
        }

        let placeholders: Vec<&str> = fields.iter().map(|_| "?").collect();
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_name(namespace),
            fields.join(", "),
            placeholders.join(", ")
        );

        let mut statement = connection.prepare(&query)?;
        statement
            .execute(rusqlite::params_from_iter(values))
            .map_err(translate_constraint)?;
        Ok(())
    }

    fn update_namespace(
        &self,
        connection: &Connection,
        uuid: Uuid,
        namespace: &str,
        record: &Record,
    ) -> Result<()> {
        let schema = self.schema(namespace)?;
        schema.validate(namespace, record, true)?;

        if let Some(record_uuid) = record.get_uuid("uuid") {
            if record_uuid != uuid {
                return Err(Error::User(
                    "specified uuid does not match uuid included in the specified product \
                     properties"
                        .to_string(),
                ));
            }
        }

        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (name, value) in record.iter() {
            if name == "uuid" {
                continue;
            }
            assignments.push(format!("{} = ?", name));
            values.push(to_sql(value)?);
        }
        if assignments.is_empty() {
            return Ok(());
        }
        values.push(to_sql(&Value::Uuid(uuid))?);

        let query = format!(
            "UPDATE {} SET {} WHERE uuid = ?",
            self.table_name(namespace),
            assignments.join(", ")
        );
        let mut statement = connection.prepare(&query)?;
        let count = statement
            .execute(rusqlite::params_from_iter(values))
            .map_err(translate_constraint)?;
        if count != 1 {
            return Err(Error::NotFound(format!(
                "could not update properties for namespace: {} for product: {}",
                namespace, uuid
            )));
        }
        Ok(())
    }

    fn delete_namespace(
        &self,
        connection: &Connection,
        uuid: Uuid,
        namespace: &str,
    ) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE uuid = ?", self.table_name(namespace));
        connection.execute(&query, [to_sql(&Value::Uuid(uuid))?])?;
        Ok(())
    }

    fn unpack_product(
        &self,
        description: &SearchDescription,
        row: &rusqlite::Row<'_>,
    ) -> Result<Properties> {
        let mut properties = Properties::new();
        let mut index = 0;

        for (namespace, columns) in description {
            let end = index + columns.len();
            let mut columns: &[String] = columns;

            // A NULL uuid probe means the namespace is not defined for this
            // product; the probe itself is not part of the namespace.
            if namespace != "core" {
                if matches!(row.get_ref(index)?, ValueRef::Null) {
                    index = end;
                    continue;
                }
                index += 1;
                columns = &columns[1..];
            }

            let schema = self.schema(namespace)?;
            let mut record = Record::new();
            for name in columns {
                let field = schema.get(name).ok_or_else(|| {
                    Error::Internal(format!(
                        "selected column {}.{} missing from schema",
                        namespace, name
                    ))
                })?;
                let value = from_sql(row.get_ref(index)?, field.data_type)?;
                index += 1;
                if !value.is_null() || !field.optional {
                    record.set(name, value);
                }
            }
            schema.validate(namespace, &record, true)?;
            properties.set_namespace(namespace, record);
        }

        Ok(properties)
    }

    fn query_products(
        &self,
        connection: &Connection,
        query: &str,
        parameters: &[rusqlite::types::Value],
        description: &SearchDescription,
    ) -> Result<Vec<Properties>> {
        let mut statement = connection.prepare(query)?;
        let mut rows = statement.query(rusqlite::params_from_iter(parameters.iter()))?;
        let mut products = Vec::new();
        while let Some(row) = rows.next()? {
            products.push(self.unpack_product(description, row)?);
        }
        Ok(products)
    }

    fn uuid_column_query(
        &self,
        connection: &Connection,
        query: &str,
        uuid: Uuid,
    ) -> Result<Vec<Uuid>> {
        let mut statement = connection.prepare(query)?;
        let mut rows = statement.query([to_sql(&Value::Uuid(uuid))?])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            match from_sql(row.get_ref(0)?, DataType::Uuid)? {
                Value::Uuid(uuid) => result.push(uuid),
                _ => {
                    return Err(Error::Internal(
                        "link table contains a non-uuid value".to_string(),
                    ))
                }
            }
        }
        Ok(result)
    }

    fn core_description(&self) -> Result<SearchDescription> {
        Ok(vec![("core".to_string(), self.schema("core")?.field_names())])
    }
}

impl SqlDialect for SqliteCatalogue {
    fn table_name(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    fn placeholder(&self, name: &str) -> String {
        format!(":{}", name)
    }

    fn rewriters(&self) -> &RewriterTable {
        &self.rewriters
    }

    fn rewrite_subscript(&self, column: &str, subscript: &str) -> Result<String> {
        let sql = match subscript {
            "year" => format!("STRFTIME('%Y', {})", column),
            "month" => format!("STRFTIME('%m', {})", column),
            "yearmonth" => format!("STRFTIME('%Y-%m', {})", column),
            "day" => format!("STRFTIME('%d', {})", column),
            "date" => format!("STRFTIME('%Y-%m-%d', {})", column),
            "hour" => format!("STRFTIME('%H', {})", column),
            "minute" => format!("STRFTIME('%M', {})", column),
            "second" => format!("STRFTIME('%S', {})", column),
            "time" => format!("STRFTIME('%H:%M:%S', {})", column),
            "length" => format!("LENGTH({})", column),
            other => {
                return Err(Error::User(format!("unsupported subscript: {}", other)))
            }
        };
        Ok(sql)
    }
}

impl Catalogue for SqliteCatalogue {
    fn initialize(&mut self, namespace_schemas: BTreeMap<String, Schema>) {
        self.namespace_schemas = namespace_schemas;
    }

    fn prepare(&self, dry_run: bool) -> Result<Vec<String>> {
        let statements = self.create_tables_sql();
        if dry_run {
            return Ok(statements);
        }

        if Path::new(&self.connection_string).is_file() {
            self.transaction(|connection| {
                for statement in &statements {
                    connection.execute_batch(statement)?;
                }
                Ok(())
            })?;
        } else {
            // connecting to a missing database file creates the tables
            self.transaction(|_| Ok(()))?;
        }
        Ok(statements)
    }

    fn destroy(&self) -> Result<()> {
        self.transaction(|connection| {
            connection.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.tag_table()))?;
            connection.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.link_table()))?;
            for namespace in self.namespace_schemas.keys() {
                if namespace != "core" {
                    connection.execute_batch(&format!(
                        "DROP TABLE IF EXISTS {}",
                        self.table_name(namespace)
                    ))?;
                }
            }
            connection.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.core_table()))?;
            Ok(())
        })
    }

    fn exists(&self) -> Result<bool> {
        if !Path::new(&self.connection_string).is_file() {
            return Ok(false);
        }
        self.transaction(|connection| {
            let mut statement = connection
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")?;
            let found = statement.exists([self.core_table()])?;
            Ok(found)
        })
    }

    fn disconnect(&self) -> Result<()> {
        if self.in_transaction.get() {
            return Err(Error::Internal(
                "unable to close the connection with the database while a transaction is in \
                 progress"
                    .to_string(),
            ));
        }
        self.connection.borrow_mut().take();
        Ok(())
    }

    fn server_time_utc(&self) -> Result<NaiveDateTime> {
        Ok(Utc::now().naive_utc())
    }

    fn insert_product_properties(&self, properties: &Properties) -> Result<()> {
        let uuid = properties.uuid()?;
        self.transaction(|connection| {
            let core = properties.core()?;
            self.insert_namespace(connection, uuid, "core", core)?;
            for (namespace, record) in properties.defined() {
                if namespace != "core" {
                    self.insert_namespace(connection, uuid, namespace, record)?;
                }
            }
            Ok(())
        })
    }

    fn update_product_properties(
        &self,
        properties: &Properties,
        uuid: Option<Uuid>,
        new_namespaces: &[String],
    ) -> Result<()> {
        let mut uuid = uuid;
        if let Some(core) = properties.namespace("core") {
            self.schema("core")?.validate("core", core, true)?;
            if let Some(core_uuid) = core.get_uuid("uuid") {
                match uuid {
                    None => uuid = Some(core_uuid),
                    Some(uuid) if uuid != core_uuid => {
                        return Err(Error::User(
                            "specified uuid does not match uuid included in the specified \
                             product properties"
                                .to_string(),
                        ))
                    }
                    _ => {}
                }
            }
        }
        let uuid = uuid.ok_or_else(|| {
            Error::User(
                "no uuid specified and no uuid included in the specified product properties"
                    .to_string(),
            )
        })?;

        self.transaction(|connection| {
            if let Some(core) = properties.namespace("core") {
                self.update_namespace(connection, uuid, "core", core)?;
            }
            for (namespace, record) in properties.entries() {
                if namespace == "core" {
                    continue;
                }
                if new_namespaces.contains(namespace) {
                    if let Some(record) = record {
                        self.insert_namespace(connection, uuid, namespace, record)?;
                    }
                } else {
                    match record {
                        Some(record) => {
                            self.update_namespace(connection, uuid, namespace, record)?
                        }
                        None => self.delete_namespace(connection, uuid, namespace)?,
                    }
                }
            }
            Ok(())
        })
    }

    fn delete_product_properties(&self, uuid: Uuid) -> Result<()> {
        self.transaction(|connection| {
            connection.execute(
                &format!("DELETE FROM {} WHERE source_uuid = ?", self.link_table()),
                [to_sql(&Value::Uuid(uuid))?],
            )?;
            let count = connection.execute(
                &format!("DELETE FROM {} WHERE uuid = ?", self.core_table()),
                [to_sql(&Value::Uuid(uuid))?],
            )?;
            if count != 1 {
                return Err(Error::NotFound(format!(
                    "could not delete properties for product: {}",
                    uuid
                )));
            }
            Ok(())
        })
    }

    fn search(
        &self,
        where_: &str,
        order_by: &[String],
        limit: Option<u64>,
        parameters: &BTreeMap<String, Value>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<Vec<Properties>> {
        let (query, query_parameters, description) = self.builder().build_search_query(
            where_,
            order_by,
            limit,
            parameters,
            namespaces,
            property_names,
        )?;

        self.transaction(|connection| {
            let mut statement = connection.prepare(&query)?;
            let named = named_parameters(&query_parameters)?;
            let bound: Vec<(&str, &dyn ToSql)> = named
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            let mut rows = statement.query(bound.as_slice())?;
            let mut products = Vec::new();
            while let Some(row) = rows.next()? {
                products.push(self.unpack_product(&description, row)?);
            }
            Ok(products)
        })
    }

    fn count(&self, where_: &str, parameters: &BTreeMap<String, Value>) -> Result<i64> {
        let (query, query_parameters) = self.builder().build_count_query(where_, parameters)?;
        self.transaction(|connection| {
            let mut statement = connection.prepare(&query)?;
            let named = named_parameters(&query_parameters)?;
            let bound: Vec<(&str, &dyn ToSql)> = named
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            let count =
                statement.query_row(bound.as_slice(), |row| row.get::<_, i64>(0))?;
            Ok(count)
        })
    }

    fn summary(
        &self,
        where_: &str,
        parameters: &BTreeMap<String, Value>,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        having: Option<&str>,
        order_by: &[String],
    ) -> Result<(Vec<Vec<Value>>, Vec<String>)> {
        let (query, query_parameters, result_fields) = self.builder().build_summary_query(
            where_,
            parameters,
            aggregates,
            group_by,
            group_by_tag,
            having,
            order_by,
        )?;

        let rows = self.transaction(|connection| {
            let mut statement = connection.prepare(&query)?;
            let named = named_parameters(&query_parameters)?;
            let bound: Vec<(&str, &dyn ToSql)> = named
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            let column_count = statement.column_count();
            let mut rows = statement.query(bound.as_slice())?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    values.push(generic_value(row.get_ref(index)?));
                }
                result.push(values);
            }
            Ok(result)
        })?;

        Ok((rows, result_fields))
    }

    fn link(&self, uuid: Uuid, source_uuids: &[Uuid]) -> Result<()> {
        // concurrent duplicate inserts are swallowed by the upsert form
        let query = format!(
            "INSERT OR IGNORE INTO {} (uuid, source_uuid) VALUES (?, ?)",
            self.link_table()
        );
        for source_uuid in source_uuids {
            self.transaction(|connection| {
                connection.execute(
                    &query,
                    [to_sql(&Value::Uuid(uuid))?, to_sql(&Value::Uuid(*source_uuid))?],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn unlink(&self, uuid: Uuid, source_uuids: Option<&[Uuid]>) -> Result<()> {
        self.transaction(|connection| {
            match source_uuids {
                None => {
                    connection.execute(
                        &format!("DELETE FROM {} WHERE uuid = ?", self.link_table()),
                        [to_sql(&Value::Uuid(uuid))?],
                    )?;
                }
                Some(source_uuids) => {
                    let placeholders: Vec<&str> =
                        source_uuids.iter().map(|_| "?").collect();
                    let query = format!(
                        "DELETE FROM {} WHERE uuid = ? AND source_uuid IN ({})",
                        self.link_table(),
                        placeholders.join(",")
                    );
                    let mut values = vec![to_sql(&Value::Uuid(uuid))?];
                    for source_uuid in source_uuids {
                        values.push(to_sql(&Value::Uuid(*source_uuid))?);
                    }
                    connection.execute(&query, rusqlite::params_from_iter(values))?;
                }
            }
            Ok(())
        })
    }

    fn source_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let query = format!(
            "SELECT source_uuid FROM {} WHERE uuid = ?",
            self.link_table()
        );
        self.transaction(|connection| self.uuid_column_query(connection, &query, uuid))
    }

    fn derived_products(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let query = format!(
            "SELECT uuid FROM {} WHERE source_uuid = ?",
            self.link_table()
        );
        self.transaction(|connection| self.uuid_column_query(connection, &query, uuid))
    }

    fn tag(&self, uuid: Uuid, tags: &[String]) -> Result<()> {
        let query = format!(
            "INSERT OR IGNORE INTO {} (uuid, tag) VALUES (?, ?)",
            self.tag_table()
        );
        for tag in tags {
            self.transaction(|connection| {
                connection.execute(
                    &query,
                    rusqlite::params![to_sql(&Value::Uuid(uuid))?, tag],
                )?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn untag(&self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        self.transaction(|connection| {
            match tags {
                None => {
                    connection.execute(
                        &format!("DELETE FROM {} WHERE uuid = ?", self.tag_table()),
                        [to_sql(&Value::Uuid(uuid))?],
                    )?;
                }
                Some(tags) => {
                    let placeholders: Vec<&str> = tags.iter().map(|_| "?").collect();
                    let query = format!(
                        "DELETE FROM {} WHERE uuid = ? AND tag IN ({})",
                        self.tag_table(),
                        placeholders.join(",")
                    );
                    let mut values = vec![to_sql(&Value::Uuid(uuid))?];
                    for tag in tags {
                        values.push(rusqlite::types::Value::Text(tag.clone()));
                    }
                    connection.execute(&query, rusqlite::params_from_iter(values))?;
                }
            }
            Ok(())
        })
    }

    fn tags(&self, uuid: Uuid) -> Result<Vec<String>> {
        let query = format!(
            "SELECT tag FROM {} WHERE uuid = ? ORDER BY tag",
            self.tag_table()
        );
        self.transaction(|connection| {
            let mut statement = connection.prepare(&query)?;
            let mut rows = statement.query([to_sql(&Value::Uuid(uuid))?])?;
            let mut tags = Vec::new();
            while let Some(row) = rows.next()? {
                tags.push(row.get::<_, String>(0)?);
            }
            Ok(tags)
        })
    }

    fn find_products_without_source(
        &self,
        product_type: Option<&str>,
        grace_period: Duration,
        archived_only: bool,
    ) -> Result<Vec<Properties>> {
        let description = self.core_description()?;
        let core = self.core_table();
        let link = self.link_table();
        let select_list: Vec<String> = description[0]
            .1
            .iter()
            .map(|name| format!("{}.{}", core, name))
            .collect();

        let mut query = format!(
            "SELECT {} FROM {} WHERE {}.active AND \
             strftime('%s', 'now') - strftime('%s', {}.archive_date) > ? AND \
             NOT EXISTS (SELECT 1 FROM {} WHERE {}.uuid = {}.uuid)",
            select_list.join(", "),
            core,
            core,
            core,
            link,
            link,
            core
        );
        let mut parameters: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Integer(grace_period.num_seconds()),
        ];
        if let Some(product_type) = product_type {
            query = format!("{} AND product_type = ?", query);
            parameters.push(rusqlite::types::Value::Text(product_type.to_string()));
        }
        if archived_only {
            query = format!("{} AND archive_path IS NOT NULL", query);
        }

        self.transaction(|connection| {
            self.query_products(connection, &query, &parameters, &description)
        })
    }

    fn find_products_without_available_source(
        &self,
        product_type: Option<&str>,
        grace_period: Duration,
    ) -> Result<Vec<Properties>> {
        let description = self.core_description()?;
        let core = self.core_table();
        let link = self.link_table();
        let select_list: Vec<String> = description[0]
            .1
            .iter()
            .map(|name| format!("{}.{}", core, name))
            .collect();

        let mut query = format!(
            "SELECT {} FROM {} WHERE active AND \
             strftime('%s', 'now') - strftime('%s', archive_date) > ? AND \
             uuid IN (SELECT uuid FROM {} EXCEPT SELECT DISTINCT link.uuid FROM {} AS link \
             LEFT JOIN {} AS source ON (link.source_uuid = source.uuid) \
             WHERE source.uuid IS NULL OR source.archive_path IS NOT NULL)",
            select_list.join(", "),
            core,
            link,
            link,
            core
        );
        let mut parameters: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Integer(grace_period.num_seconds()),
        ];
        if let Some(product_type) = product_type {
            query = format!("{} AND product_type = ?", query);
            parameters.push(rusqlite::types::Value::Text(product_type.to_string()));
        }

        self.transaction(|connection| {
            self.query_products(connection, &query, &parameters, &description)
        })
    }
}

fn valid_table_prefix(prefix: &str) -> bool {
    prefix.split('.').all(|segment| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some('a'..='z'))
            && chars.all(|c| c == '_' || c.is_ascii_lowercase())
    })
}

fn column_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Long | DataType::Integer => "INTEGER",
        DataType::Real => "REAL",
        DataType::Boolean => "BOOLEAN",
        DataType::Text => "TEXT",
        DataType::Timestamp => "TIMESTAMP",
        DataType::Uuid => "UUID",
        DataType::Geometry => "GEOMETRY",
        DataType::Json => "TEXT",
    }
}

fn to_sql(value: &Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Ok(Sql::Null),
        Value::Long(value) => Ok(Sql::Integer(*value)),
        Value::Integer(value) => Ok(Sql::Integer(*value as i64)),
        Value::Real(value) => Ok(Sql::Real(*value)),
        Value::Boolean(value) => Ok(Sql::Integer(i64::from(*value))),
        Value::Text(value) => Ok(Sql::Text(value.clone())),
        Value::Timestamp(value) => {
            Ok(Sql::Text(value.format(TIMESTAMP_FORMAT).to_string()))
        }
        Value::Uuid(value) => Ok(Sql::Blob(value.as_bytes().to_vec())),
        Value::Geometry(value) => Ok(Sql::Blob(geometry::encode_ewkb(value))),
        Value::Json(value) => Ok(Sql::Text(value.to_string())),
        Value::Sequence(_) => Err(Error::Internal(
            "sequence values cannot be bound as a single parameter".to_string(),
        )),
    }
}

fn parse_timestamp_column(text: &str) -> Result<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(timestamp);
        }
    }
    Err(Error::Internal(format!(
        "catalogue contains unparseable timestamp: \"{}\"",
        text
    )))
}

fn from_sql(value: ValueRef<'_>, data_type: DataType) -> Result<Value> {
    if matches!(value, ValueRef::Null) {
        return Ok(Value::Null);
    }

    let mismatch = |expected: &str| {
        Error::Internal(format!(
            "catalogue column of type {} holds unexpected storage class",
            expected
        ))
    };

    match data_type {
        DataType::Long => match value {
            ValueRef::Integer(value) => Ok(Value::Long(value)),
            _ => Err(mismatch("long")),
        },
        DataType::Integer => match value {
            ValueRef::Integer(value) => Ok(Value::Integer(value as i32)),
            _ => Err(mismatch("integer")),
        },
        DataType::Real => match value {
            ValueRef::Real(value) => Ok(Value::Real(value)),
            ValueRef::Integer(value) => Ok(Value::Real(value as f64)),
            _ => Err(mismatch("real")),
        },
        DataType::Boolean => match value {
            ValueRef::Integer(value) => Ok(Value::Boolean(value != 0)),
            _ => Err(mismatch("boolean")),
        },
        DataType::Text => match value {
            ValueRef::Text(value) => Ok(Value::Text(
                String::from_utf8_lossy(value).into_owned(),
            )),
            _ => Err(mismatch("text")),
        },
        DataType::Timestamp => match value {
            ValueRef::Text(value) => Ok(Value::Timestamp(parse_timestamp_column(
                &String::from_utf8_lossy(value),
            )?)),
            _ => Err(mismatch("timestamp")),
        },
        DataType::Uuid => match value {
            ValueRef::Blob(value) => Uuid::from_slice(value)
                .map(Value::Uuid)
                .map_err(|_| mismatch("uuid")),
            ValueRef::Text(value) => Uuid::parse_str(&String::from_utf8_lossy(value))
                .map(Value::Uuid)
                .map_err(|_| mismatch("uuid")),
            _ => Err(mismatch("uuid")),
        },
        DataType::Geometry => match value {
            ValueRef::Blob(value) => Ok(Value::Geometry(geometry::decode_ewkb(value)?)),
            _ => Err(mismatch("geometry")),
        },
        DataType::Json => match value {
            ValueRef::Text(value) => {
                let json = serde_json::from_slice(value)
                    .map_err(|error| Error::Internal(format!("invalid stored json: {}", error)))?;
                Ok(Value::Json(json))
            }
            _ => Err(mismatch("json")),
        },
    }
}

/// Schema-free decode used for summary result rows.
fn generic_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Long(value),
        ValueRef::Real(value) => Value::Real(value),
        ValueRef::Text(value) => Value::Text(String::from_utf8_lossy(value).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn named_parameters(
    parameters: &BTreeMap<String, Value>,
) -> Result<Vec<(String, rusqlite::types::Value)>> {
    parameters
        .iter()
        .map(|(name, value)| Ok((format!(":{}", name), to_sql(value)?)))
        .collect()
}

fn translate_constraint(error: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, ref message) = error {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Integrity(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            );
        }
    }
    Error::Database(error)
}

fn decode_function_geometry(
    context: &rusqlite::functions::Context<'_>,
    index: usize,
) -> rusqlite::Result<Option<crate::geometry::Geometry>> {
    match context.get_raw(index) {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => geometry::decode_ewkb(blob)
            .map(Some)
            .map_err(|error| rusqlite::Error::UserFunctionError(Box::new(error))),
        _ => Err(rusqlite::Error::UserFunctionError(
            "geometry argument must be an EWKB blob".into(),
        )),
    }
}

fn register_geometry_functions(connection: &Connection) -> Result<()> {
    connection.create_scalar_function(
        "st_covers",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |context| {
        let left = decode_function_geometry(context, 0)?;
        let right = decode_function_geometry(context, 1)?;
        Ok(match (left, right) {
            (Some(left), Some(right)) => Some(geometry::covers(&left, &right)),
            _ => None,
        })
    })?;

    connection.create_scalar_function(
        "st_intersects",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |context| {
        let left = decode_function_geometry(context, 0)?;
        let right = decode_function_geometry(context, 1)?;
        Ok(match (left, right) {
            (Some(left), Some(right)) => Some(geometry::intersects(&left, &right)),
            _ => None,
        })
    })?;

    Ok(())
}

fn sqlite_rewriter_table(prefix: String) -> RewriterTable {
    use ExprType::*;

    let core = format!("{}core", prefix);
    let link = format!("{}link", prefix);
    let tag = format!("{}tag", prefix);

    let mut table = default_rewriter_table();

    table.insert(
        rewriter_key("-", &[Timestamp, Timestamp]),
        Rewriter::Template(Box::new(|args| {
            format!("(julianday({}) - julianday({})) * 86400.0", args[0], args[1])
        })),
    );

    // escape sequences with the LIKE operator
    table.insert(
        rewriter_key("~=", &[Text, Text]),
        Rewriter::Template(Box::new(|args| {
            format!("({}) LIKE ({}) ESCAPE '\\'", args[0], args[1])
        })),
    );

    table.insert(
        rewriter_key("covers", &[Geometry, Geometry]),
        Rewriter::Template(Box::new(|args| {
            format!("(st_covers({}, {}) = 1)", args[0], args[1])
        })),
    );
    table.insert(
        rewriter_key("intersects", &[Geometry, Geometry]),
        Rewriter::Template(Box::new(|args| {
            format!("(st_intersects({}, {}) = 1)", args[0], args[1])
        })),
    );

    {
        let link = link.clone();
        let core = core.clone();
        table.insert(
            rewriter_key("is_source_of", &[Uuid]),
            Rewriter::Template(Box::new(move |args| {
                format!(
                    "EXISTS (SELECT 1 FROM {} WHERE source_uuid = {}.uuid AND uuid = ({}))",
                    link, core, args[0]
                )
            })),
        );
    }
    {
        let link = link.clone();
        let core = core.clone();
        let prefix = prefix.clone();
        table.insert(
            rewriter_key("is_source_of", &[Boolean]),
            Rewriter::SubQuery(Box::new(move |where_expr, namespaces| {
                let mut joins = String::new();
                for namespace in namespaces {
                    joins =
                        format!("{} INNER JOIN {}{} USING (uuid)", joins, prefix, namespace);
                }
                format!(
                    "{core}.uuid in (SELECT {link}.source_uuid FROM {core}{joins} \
                     INNER JOIN {link} on {link}.uuid = {core}.uuid WHERE {where_expr})",
                    core = core,
                    link = link,
                    joins = joins,
                    where_expr = where_expr
                )
            })),
        );
    }
    {
        let link = link.clone();
        let core = core.clone();
        table.insert(
            rewriter_key("is_derived_from", &[Uuid]),
            Rewriter::Template(Box::new(move |args| {
                format!(
                    "EXISTS (SELECT 1 FROM {} WHERE uuid = {}.uuid AND source_uuid = ({}))",
                    link, core, args[0]
                )
            })),
        );
    }
    {
        let link = link.clone();
        let core = core.clone();
        let prefix = prefix.clone();
        table.insert(
            rewriter_key("is_derived_from", &[Boolean]),
            Rewriter::SubQuery(Box::new(move |where_expr, namespaces| {
                let mut joins = String::new();
                for namespace in namespaces {
                    joins =
                        format!("{} INNER JOIN {}{} USING (uuid)", joins, prefix, namespace);
                }
                format!(
                    "{core}.uuid in (SELECT {link}.uuid FROM {core}{joins} \
                     INNER JOIN {link} on {link}.source_uuid = {core}.uuid WHERE {where_expr})",
                    core = core,
                    link = link,
                    joins = joins,
                    where_expr = where_expr
                )
            })),
        );
    }
    {
        let core = core.clone();
        table.insert(
            rewriter_key("has_tag", &[Text]),
            Rewriter::Template(Box::new(move |args| {
                format!(
                    "EXISTS (SELECT 1 FROM {} WHERE uuid = {}.uuid AND tag = ({}))",
                    tag, core, args[0]
                )
            })),
        );
    }

    table.insert(
        rewriter_key("now", &[]),
        Rewriter::Template(Box::new(|_| "datetime('now')".to_string())),
    );

    {
        let is_defined = move |args: &[String]| {
            // a property argument is table-qualified; a bare namespace
            // argument is just the namespace table
            if args[0].contains('.') {
                format!("({}) IS NOT NULL", args[0])
            } else {
                format!(
                    "EXISTS (SELECT 1 FROM {} WHERE uuid = {}.uuid)",
                    args[0], core
                )
            }
        };
        for ty in [Long, Integer, Real, Boolean, Text, Namespace, Timestamp, Uuid, Geometry] {
            let is_defined = is_defined.clone();
            table.insert(
                rewriter_key("is_defined", &[ty]),
                Rewriter::Template(Box::new(move |args| is_defined(args))),
            );
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_prefix_validation() {
        assert!(valid_table_prefix("my_prefix"));
        assert!(valid_table_prefix("schema.my_prefix"));
        assert!(!valid_table_prefix("1bad"));
        assert!(!valid_table_prefix("Bad"));
        assert!(!valid_table_prefix(""));
    }

    #[test]
    fn value_round_trip_through_sql_types() {
        let uuid = Uuid::new_v4();
        let sql = to_sql(&Value::Uuid(uuid)).unwrap();
        match &sql {
            rusqlite::types::Value::Blob(bytes) => {
                let decoded = from_sql(ValueRef::Blob(bytes), DataType::Uuid).unwrap();
                assert_eq!(decoded, Value::Uuid(uuid));
            }
            other => panic!("unexpected storage class {:?}", other),
        }

        // stored precision is microseconds
        let now = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(10, 30, 0, 123_456)
            .unwrap();
        let sql = to_sql(&Value::Timestamp(now)).unwrap();
        match &sql {
            rusqlite::types::Value::Text(text) => {
                let decoded =
                    from_sql(ValueRef::Text(text.as_bytes()), DataType::Timestamp).unwrap();
                assert_eq!(decoded, Value::Timestamp(now));
            }
            other => panic!("unexpected storage class {:?}", other),
        }
    }
}

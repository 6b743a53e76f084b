//! Translation of analyzed query expressions into backend SQL.
//!
//! The builder is backend-agnostic: table naming, parameter placeholders,
//! subscript spellings, and the rewriters for backend-specific functions come
//! in through [`SqlDialect`]. Queries come out as SQL text plus a named
//! parameter map.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::language::{parse_and_analyze, ExprType, Identifier, NameKind, TypedExpr};
use crate::records::Value;
use crate::schema::Schema;

/// Rewriters are keyed by function name and argument types; overload
/// resolution guarantees that pair is unique.
pub type RewriterKey = (String, Vec<ExprType>);

pub fn rewriter_key(name: &str, argument_types: &[ExprType]) -> RewriterKey {
    (name.to_string(), argument_types.to_vec())
}

/// Emit SQL for one resolved function call.
pub enum Rewriter {
    /// Plain textual rewrite over the already-rewritten argument SQL.
    Template(Box<dyn Fn(&[String]) -> String + Send + Sync>),
    /// Correlated sub-query rewrite for the lineage functions taking a
    /// boolean sub-expression; receives the inner WHERE SQL and the
    /// non-core namespaces it references.
    SubQuery(Box<dyn Fn(&str, &BTreeSet<String>) -> String + Send + Sync>),
}

pub type RewriterTable = HashMap<RewriterKey, Rewriter>;

pub fn unary_operator_rewriter(operator: &'static str) -> Rewriter {
    Rewriter::Template(Box::new(move |args| format!("{} ({})", operator, args[0])))
}

pub fn binary_operator_rewriter(operator: &'static str) -> Rewriter {
    Rewriter::Template(Box::new(move |args| {
        format!("({}) {} ({})", args[0], operator, args[1])
    }))
}

fn membership_operator_rewriter(operator: &'static str) -> Rewriter {
    Rewriter::Template(Box::new(move |args| {
        format!("({}) {} {}", args[0], operator, args[1])
    }))
}

pub fn as_is(sql: &'static str) -> Rewriter {
    Rewriter::Template(Box::new(move |_| sql.to_string()))
}

/// Rewriters for everything expressible in portable SQL. Backends add the
/// remaining functions (geometry predicates, lineage, tags, `now`,
/// timestamp subtraction) and may override entries such as `~=`.
pub fn default_rewriter_table() -> RewriterTable {
    use ExprType::*;

    let mut table = RewriterTable::new();
    let numeric = [Long, Integer, Real];

    table.insert(rewriter_key("not", &[Boolean]), unary_operator_rewriter("NOT"));
    table.insert(
        rewriter_key("and", &[Boolean, Boolean]),
        binary_operator_rewriter("AND"),
    );
    table.insert(
        rewriter_key("or", &[Boolean, Boolean]),
        binary_operator_rewriter("OR"),
    );

    for ty in [Integer, Long, Real, Text] {
        table.insert(
            rewriter_key("in", &[ty, Sequence]),
            membership_operator_rewriter("in"),
        );
        table.insert(
            rewriter_key("not in", &[ty, Sequence]),
            membership_operator_rewriter("not in"),
        );
    }

    for (name, sql) in [("==", "="), ("!=", "!=")] {
        for left in numeric {
            for right in numeric {
                table.insert(rewriter_key(name, &[left, right]), binary_operator_rewriter(sql));
            }
        }
        for ty in [Boolean, Text, Timestamp, Uuid] {
            table.insert(rewriter_key(name, &[ty, ty]), binary_operator_rewriter(sql));
        }
    }

    for op in ["<", ">", "<=", ">="] {
        for left in numeric {
            for right in numeric {
                table.insert(rewriter_key(op, &[left, right]), binary_operator_rewriter(op));
            }
        }
        for ty in [Text, Timestamp] {
            table.insert(rewriter_key(op, &[ty, ty]), binary_operator_rewriter(op));
        }
    }

    table.insert(rewriter_key("~=", &[Text, Text]), binary_operator_rewriter("LIKE"));

    for ty in numeric {
        table.insert(rewriter_key("+", &[ty]), unary_operator_rewriter("+"));
        table.insert(rewriter_key("-", &[ty]), unary_operator_rewriter("-"));
    }
    for (op, sql) in [("+", "+"), ("-", "-"), ("*", "*"), ("/", "/")] {
        for left in numeric {
            for right in numeric {
                table.insert(rewriter_key(op, &[left, right]), binary_operator_rewriter(sql));
            }
        }
    }

    let timestamps = [Timestamp, Timestamp, Timestamp, Timestamp];
    table.insert(
        rewriter_key("covers", &timestamps),
        Rewriter::Template(Box::new(|args| {
            format!(
                "({r0}) >= ({l0}) AND ({r1}) >= ({l1}) AND ({l1}) >= ({l0}) AND ({r1}) <= ({r0})",
                l0 = args[0],
                r0 = args[1],
                l1 = args[2],
                r1 = args[3],
            )
        })),
    );
    table.insert(
        rewriter_key("intersects", &timestamps),
        Rewriter::Template(Box::new(|args| {
            format!(
                "({r0}) >= ({l0}) AND ({r1}) >= ({l1}) AND ({r0}) >= ({l1}) AND ({l0}) <= ({r1})",
                l0 = args[0],
                r0 = args[1],
                l1 = args[2],
                r1 = args[3],
            )
        })),
    );

    table
}

/// Backend-specific SQL spelling.
pub trait SqlDialect {
    fn table_name(&self, name: &str) -> String;
    /// Named parameter placeholder for a parameter called `name`.
    fn placeholder(&self, name: &str) -> String;
    fn rewriters(&self) -> &RewriterTable;
    /// Spell a summary subscript (`year`, `length`, ...) over a column.
    fn rewrite_subscript(&self, column: &str, subscript: &str) -> Result<String>;
}

/// Aggregate subscripts allowed per property type; `None` covers the
/// synthetic `validity_duration` property.
fn aggregate_functions(data_type: Option<ExprType>) -> &'static [&'static str] {
    match data_type {
        Some(ExprType::Long) | Some(ExprType::Integer) | Some(ExprType::Real) | None => {
            &["min", "max", "sum", "avg"]
        }
        Some(ExprType::Text) | Some(ExprType::Timestamp) => &["min", "max"],
        _ => &[],
    }
}

/// Group-by subscripts allowed per property type; an empty-string entry
/// means grouping on the bare value.
fn group_by_functions(data_type: Option<ExprType>) -> &'static [&'static str] {
    match data_type {
        Some(ExprType::Long) | Some(ExprType::Integer) | Some(ExprType::Boolean) => &[""],
        Some(ExprType::Text) => &["", "length"],
        Some(ExprType::Timestamp) => &[
            "year", "month", "yearmonth", "date", "day", "hour", "minute", "second", "time",
        ],
        _ => &[],
    }
}

fn sql_literal(value: &Value) -> Result<String> {
    match value {
        Value::Long(value) => Ok(value.to_string()),
        Value::Integer(value) => Ok(value.to_string()),
        Value::Real(value) => Ok(value.to_string()),
        Value::Boolean(value) => Ok(if *value { "TRUE" } else { "FALSE" }.to_string()),
        Value::Text(value) => Ok(format!("'{}'", value.replace('\'', "''"))),
        Value::Timestamp(value) => {
            Ok(format!("'{}'", value.format("%Y-%m-%dT%H:%M:%S%.6f")))
        }
        Value::Uuid(value) => Ok(format!("'{}'", value)),
        other => Err(Error::User(format!(
            "cannot embed value of type \"{}\" in a list",
            other.type_name()
        ))),
    }
}

struct WhereVisitor<'a, D: SqlDialect> {
    dialect: &'a D,
    count: usize,
    parameters: BTreeMap<String, Value>,
    namespaces: BTreeSet<String>,
}

impl<'a, D: SqlDialect> WhereVisitor<'a, D> {
    fn new(dialect: &'a D) -> Self {
        WhereVisitor {
            dialect,
            count: 0,
            parameters: BTreeMap::new(),
            namespaces: BTreeSet::new(),
        }
    }

    fn column_name(&self, namespace: &str, field: &str) -> String {
        format!("{}.{}", self.dialect.table_name(namespace), field)
    }

    fn bind(&mut self, value: &Value) -> String {
        let name = self.count.to_string();
        self.parameters.insert(name.clone(), value.clone());
        self.count += 1;
        self.dialect.placeholder(&name)
    }

    /// Entry point: a bare top-level UUID literal is shorthand for a `uuid`
    /// equality probe.
    fn do_visit(&mut self, expr: &TypedExpr) -> Result<String> {
        let sql = self.visit(expr)?;
        if matches!(expr, TypedExpr::Literal { ty: ExprType::Uuid, .. }) {
            return Ok(format!("(uuid = {})", sql));
        }
        Ok(sql)
    }

    fn visit(&mut self, expr: &TypedExpr) -> Result<String> {
        match expr {
            TypedExpr::Literal { value, .. } => Ok(self.bind(value)),
            TypedExpr::Name { kind, .. } => self.visit_name(kind),
            TypedExpr::List { values } => {
                let items: Vec<String> = values.iter().map(sql_literal).collect::<Result<_>>()?;
                Ok(format!("({})", items.join(",")))
            }
            TypedExpr::Parameter { value, ty, .. } => {
                if *ty == ExprType::Sequence {
                    let items = match value {
                        Value::Sequence(items) => items.clone(),
                        other => vec![other.clone()],
                    };
                    let placeholders: Vec<String> =
                        items.iter().map(|item| self.bind(item)).collect();
                    Ok(format!("({})", placeholders.join(",")))
                } else {
                    Ok(self.bind(value))
                }
            }
            TypedExpr::Call { .. } => self.visit_call(expr),
        }
    }

    fn visit_name(&mut self, kind: &NameKind) -> Result<String> {
        match kind {
            NameKind::Property { namespace, field } => {
                self.namespaces.insert(namespace.clone());
                Ok(self.column_name(namespace, field))
            }
            NameKind::Namespace(namespace) => {
                self.namespaces.insert(namespace.clone());
                Ok(self.dialect.table_name(namespace))
            }
            NameKind::Aggregate(identifier) => {
                if identifier.canonical == "count" {
                    return Ok("COUNT(*)".to_string());
                }
                let namespace = identifier.namespace.as_deref().unwrap_or("core");
                let subscript = identifier.subscript.as_deref().ok_or_else(|| {
                    Error::User(format!(
                        "cannot resolve identifier: \"{}\"",
                        identifier.canonical
                    ))
                })?;
                Ok(format!(
                    "{}({})",
                    subscript.to_uppercase(),
                    self.column_name(namespace, &identifier.identifier)
                ))
            }
        }
    }

    fn visit_call(&mut self, expr: &TypedExpr) -> Result<String> {
        let (prototype, arguments) = match expr {
            TypedExpr::Call { prototype, arguments } => (prototype, arguments),
            _ => return Err(Error::Internal("visit_call on non-call node".to_string())),
        };

        let rewriter = self
            .dialect
            .rewriters()
            .get(&rewriter_key(&prototype.name, &prototype.argument_types))
            .ok_or_else(|| {
                Error::User(format!("function not supported by backend: {}", prototype))
            })?;

        let is_lineage_subquery = matches!(
            prototype.name.as_str(),
            "is_source_of" | "is_derived_from"
        ) && prototype.argument_types.first() == Some(&ExprType::Boolean);

        if is_lineage_subquery {
            // The joins of the inner expression become INNER JOINs of the
            // sub-query; they must not leak into the outer FROM clause.
            let saved = std::mem::take(&mut self.namespaces);
            let where_expr = self.visit(&arguments[0])?;
            let mut sub_namespaces = std::mem::replace(&mut self.namespaces, saved);
            sub_namespaces.remove("core");

            return match rewriter {
                Rewriter::SubQuery(rewrite) => Ok(rewrite(&where_expr, &sub_namespaces)),
                Rewriter::Template(_) => Err(Error::Internal(format!(
                    "sub-query rewriter expected for: {}",
                    prototype
                ))),
            };
        }

        let mut argument_sql = Vec::with_capacity(arguments.len());
        for (expected, argument) in prototype.argument_types.iter().zip(arguments) {
            let mut sql = self.visit(argument)?;
            if matches!(argument, TypedExpr::Literal { ty: ExprType::Uuid, .. })
                && *expected == ExprType::Boolean
            {
                sql = format!("(uuid = {})", sql);
            }
            argument_sql.push(sql);
        }

        let sql = match rewriter {
            Rewriter::Template(rewrite) => rewrite(&argument_sql),
            Rewriter::SubQuery(_) => {
                return Err(Error::Internal(format!(
                    "unexpected sub-query rewriter for: {}",
                    prototype
                )))
            }
        };

        // NULL-safe equality: a property compared against a literal also
        // matches (for `!=`) or excludes (for `==`, `~=`) NULL values.
        if matches!(prototype.name.as_str(), "==" | "!=" | "~=") && arguments.len() == 2 {
            let name_sql = if matches!(arguments[0], TypedExpr::Name { .. })
                && matches!(arguments[1], TypedExpr::Literal { .. })
            {
                Some(&argument_sql[0])
            } else if matches!(arguments[0], TypedExpr::Literal { .. })
                && matches!(arguments[1], TypedExpr::Name { .. })
            {
                Some(&argument_sql[1])
            } else {
                None
            };

            if let Some(name) = name_sql {
                return Ok(if prototype.name == "!=" {
                    format!("({} OR {} IS NULL)", sql, name)
                } else {
                    format!("({} AND {} IS NOT NULL)", sql, name)
                });
            }
        }

        Ok(sql)
    }
}

/// Result-set layout of a search query: per selected namespace, the columns
/// in selection order.
pub type SearchDescription = Vec<(String, Vec<String>)>;

pub struct SqlBuilder<'a, D: SqlDialect> {
    namespace_schemas: &'a BTreeMap<String, Schema>,
    dialect: &'a D,
}

impl<'a, D: SqlDialect> SqlBuilder<'a, D> {
    pub fn new(namespace_schemas: &'a BTreeMap<String, Schema>, dialect: &'a D) -> Self {
        SqlBuilder {
            namespace_schemas,
            dialect,
        }
    }

    fn schema(&self, namespace: &str) -> Result<&Schema> {
        self.namespace_schemas
            .get(namespace)
            .ok_or_else(|| Error::User(format!("undefined namespace: \"{}\"", namespace)))
    }

    fn column_name(&self, namespace: &str, field: &str) -> String {
        format!("{}.{}", self.dialect.table_name(namespace), field)
    }

    fn joins(&self, join_set: &BTreeSet<String>) -> String {
        let mut from = format!("FROM {}", self.dialect.table_name("core"));
        for namespace in join_set {
            if namespace != "core" {
                from = format!(
                    "{} LEFT JOIN {} USING (uuid)",
                    from,
                    self.dialect.table_name(namespace)
                );
            }
        }
        from
    }

    fn order_by_list(
        &self,
        order_by: &[String],
    ) -> Result<(Vec<String>, BTreeSet<String>)> {
        let mut list = Vec::new();
        let mut namespaces = BTreeSet::new();
        for item in order_by {
            let direction = if item.starts_with('-') { "DESC" } else { "ASC" };
            let name = item.trim_start_matches(['+', '-']);

            let segments: Vec<&str> = name.split('.').collect();
            let (namespace, field) = match segments.as_slice() {
                [field] => ("core", *field),
                [namespace, field] => (*namespace, *field),
                _ => {
                    return Err(Error::User(format!(
                        "invalid property name: \"{}\"",
                        name
                    )))
                }
            };

            if !self.schema(namespace)?.contains(field) {
                return Err(Error::User(format!(
                    "no property: \"{}\" defined within namespace: \"{}\"",
                    field, namespace
                )));
            }

            namespaces.insert(namespace.to_string());
            list.push(format!("{} {}", self.column_name(namespace, field), direction));
        }
        Ok((list, namespaces))
    }

    pub fn build_count_query(
        &self,
        where_: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<(String, BTreeMap<String, Value>)> {
        let mut join_set = BTreeSet::new();
        let mut visitor = WhereVisitor::new(self.dialect);

        let mut where_clause = String::new();
        if !where_.is_empty() {
            let ast = parse_and_analyze(where_, self.namespace_schemas, parameters, false)?;
            let where_expr = visitor.do_visit(&ast)?;
            if !where_expr.is_empty() {
                join_set.extend(visitor.namespaces.iter().cloned());
                where_clause = format!("WHERE {}", where_expr);
            }
        }

        let mut query = format!("SELECT COUNT(*) AS count {}", self.joins(&join_set));
        if !where_clause.is_empty() {
            query = format!("{} {}", query, where_clause);
        }
        Ok((query, visitor.parameters))
    }

    pub fn build_search_query(
        &self,
        where_: &str,
        order_by: &[String],
        limit: Option<u64>,
        parameters: &BTreeMap<String, Value>,
        namespaces: &[String],
        property_names: &[String],
    ) -> Result<(String, BTreeMap<String, Value>, SearchDescription)> {
        let mut join_set: BTreeSet<String>;
        let description: SearchDescription;

        if !property_names.is_empty() {
            let mut selected: Vec<String> = Vec::new();
            let mut namespace_properties: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for item in property_names {
                let item = if item.contains('.') {
                    item.clone()
                } else {
                    format!("core.{}", item)
                };
                Identifier::resolve(&item, self.namespace_schemas)?;
                let (namespace, identifier) = item.split_once('.').ok_or_else(|| {
                    Error::User(format!("invalid property name: \"{}\"", item))
                })?;
                if !selected.contains(&namespace.to_string()) {
                    selected.push(namespace.to_string());
                    // uuid is always selected to tell an absent namespace apart
                    namespace_properties
                        .insert(namespace.to_string(), vec!["uuid".to_string()]);
                }
                if identifier != "uuid" {
                    if let Some(columns) = namespace_properties.get_mut(namespace) {
                        columns.push(identifier.to_string());
                    }
                }
            }
            join_set = selected.iter().cloned().collect();
            description = selected
                .into_iter()
                .map(|namespace| {
                    let columns = namespace_properties
                        .remove(&namespace)
                        .unwrap_or_default();
                    (namespace, columns)
                })
                .collect();
        } else {
            join_set = namespaces.iter().cloned().collect();
            let mut full = vec![("core".to_string(), self.schema("core")?.field_names())];
            for namespace in &join_set {
                let mut columns = vec!["uuid".to_string()];
                columns.extend(self.schema(namespace)?.field_names());
                full.push((namespace.clone(), columns));
            }
            description = full;
        }

        let mut visitor = WhereVisitor::new(self.dialect);
        let mut where_clause = String::new();
        if !where_.is_empty() {
            let ast = parse_and_analyze(where_, self.namespace_schemas, parameters, false)?;
            let where_expr = visitor.do_visit(&ast)?;
            if !where_expr.is_empty() {
                join_set.extend(visitor.namespaces.iter().cloned());
                where_clause = format!("WHERE {}", where_expr);
            }
        }

        let mut order_by_clause = String::new();
        if !order_by.is_empty() {
            let (list, order_namespaces) = self.order_by_list(order_by)?;
            if !list.is_empty() {
                join_set.extend(order_namespaces);
                order_by_clause = format!("ORDER BY {}", list.join(", "));
            }
        }

        let mut select_list = Vec::new();
        for (namespace, identifiers) in &description {
            for identifier in identifiers {
                select_list.push(self.column_name(namespace, identifier));
            }
        }

        let mut query = format!("SELECT {} {}", select_list.join(", "), self.joins(&join_set));
        if !where_clause.is_empty() {
            query = format!("{} {}", query, where_clause);
        }
        if !order_by_clause.is_empty() {
            query = format!("{} {}", query, order_by_clause);
        }
        if let Some(limit) = limit {
            query = format!("{} LIMIT {}", query, limit);
        }

        Ok((query, visitor.parameters, description))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_summary_query(
        &self,
        where_: &str,
        parameters: &BTreeMap<String, Value>,
        aggregates: &[String],
        group_by: &[String],
        group_by_tag: bool,
        having: Option<&str>,
        order_by: &[String],
    ) -> Result<(String, BTreeMap<String, Value>, Vec<String>)> {
        let mut group_by: Vec<String> = group_by.to_vec();
        if group_by_tag {
            group_by.push("tag".to_string());
        }

        let mut join_set = BTreeSet::new();
        let mut result_fields = Vec::new();
        for field in group_by
            .iter()
            .chain(std::iter::once(&"count".to_string()))
            .chain(aggregates.iter())
        {
            let identifier = Identifier::resolve(field, self.namespace_schemas)?;
            result_fields.push(identifier.resolved());
            if let Some(namespace) = &identifier.namespace {
                join_set.insert(namespace.clone());
            }
        }

        let mut visitor = WhereVisitor::new(self.dialect);
        let mut where_clause = String::new();
        if !where_.is_empty() {
            let ast = parse_and_analyze(where_, self.namespace_schemas, parameters, false)?;
            let where_expr = visitor.do_visit(&ast)?;
            if !where_expr.is_empty() {
                join_set.extend(visitor.namespaces.iter().cloned());
                where_clause = format!("WHERE {}", where_expr);
            }
        }

        let group_by_positions: Vec<String> =
            (1..=group_by.len()).map(|i| i.to_string()).collect();
        let group_by_clause = if group_by_positions.is_empty() {
            String::new()
        } else {
            format!("GROUP BY {}", group_by_positions.join(", "))
        };

        // HAVING re-uses the same visitor so parameter numbering stays unique.
        let mut having_clause = String::new();
        if let Some(having) = having {
            let ast = parse_and_analyze(having, self.namespace_schemas, parameters, true)?;
            let saved_namespaces = std::mem::take(&mut visitor.namespaces);
            let having_expr = visitor.do_visit(&ast)?;
            visitor.namespaces = saved_namespaces;
            having_clause = format!("HAVING {}", having_expr);
        }

        let mut order_by_list = Vec::new();
        for item in order_by {
            let direction = if item.starts_with('-') { "DESC" } else { "ASC" };
            let name = item.trim_start_matches(['+', '-']);
            let resolved = Identifier::resolve(name, self.namespace_schemas)?.resolved();
            if !result_fields.contains(&resolved) {
                return Err(Error::User(format!(
                    "cannot order result by \"{}\"; field is not present in result",
                    resolved
                )));
            }
            order_by_list.push(format!("\"{}\" {}", resolved, direction));
        }
        order_by_list.extend(group_by_positions.iter().cloned());
        let order_by_clause = if order_by_list.is_empty() {
            String::new()
        } else {
            format!("ORDER BY {}", order_by_list.join(", "))
        };

        let mut select_list = Vec::new();
        for item in &group_by {
            let identifier = Identifier::resolve(item, self.namespace_schemas)?;
            let namespace = identifier.namespace.as_deref().unwrap_or("core");
            let mut column = self.column_name(namespace, &identifier.identifier);

            let allowed = group_by_functions(identifier.data_type);
            if allowed.is_empty() {
                return Err(Error::User(format!(
                    "property \"{}\" cannot be part of the group_by field specification",
                    identifier.property_name()
                )));
            }
            match identifier.subscript.as_deref() {
                None => {
                    if !allowed.contains(&"") {
                        return Err(Error::User(format!(
                            "property \"{}\" must specify a subscript (one of {}) to be part \
                             of the group_by field specification",
                            identifier.property_name(),
                            allowed.join(", ")
                        )));
                    }
                }
                Some(subscript) => {
                    if !allowed.contains(&subscript) {
                        return Err(Error::User(format!(
                            "group field specification subscript \"{}\" of \"{}\" is not allowed",
                            subscript, identifier.canonical
                        )));
                    }
                    column = self.dialect.rewrite_subscript(&column, subscript)?;
                }
            }
            select_list.push(format!("{} AS \"{}\"", column, identifier.resolved()));
        }

        select_list.push("COUNT(*) AS count".to_string());

        for item in aggregates {
            let identifier = Identifier::resolve(item, self.namespace_schemas)?;
            if let Some(namespace) = &identifier.namespace {
                join_set.insert(namespace.clone());
            }

            let allowed = aggregate_functions(identifier.data_type);
            if allowed.is_empty() {
                return Err(Error::User(format!(
                    "property \"{}\" cannot be part of the summary field specification",
                    identifier.property_name()
                )));
            }
            let subscript = match identifier.subscript.as_deref() {
                Some(subscript) if allowed.contains(&subscript) => subscript,
                Some(subscript) => {
                    return Err(Error::User(format!(
                        "summary field specification subscript \"{}\" of \"{}\" should be one \
                         of {}",
                        subscript,
                        identifier.canonical,
                        allowed.join(", ")
                    )))
                }
                None => {
                    return Err(Error::User(format!(
                        "summary field specification \"{}\" must specify a subscript (one of {})",
                        identifier.canonical,
                        allowed.join(", ")
                    )))
                }
            };

            let namespace = identifier.namespace.as_deref().unwrap_or("core");
            let column = if identifier.property_name() == "core.validity_duration" {
                let stop = self.column_name(namespace, "validity_stop");
                let start = self.column_name(namespace, "validity_start");
                match self.dialect.rewriters().get(&rewriter_key(
                    "-",
                    &[ExprType::Timestamp, ExprType::Timestamp],
                )) {
                    Some(Rewriter::Template(rewrite)) => rewrite(&[stop, start]),
                    _ => {
                        return Err(Error::User(
                            "function not supported by backend: -(timestamp,timestamp)"
                                .to_string(),
                        ))
                    }
                }
            } else {
                self.column_name(namespace, &identifier.identifier)
            };
            select_list.push(format!(
                "{}({}) AS \"{}\"",
                subscript.to_uppercase(),
                column,
                identifier.canonical
            ));
        }

        let mut query = format!("SELECT {}\n{}", select_list.join(", "), self.joins(&join_set));
        for clause in [&where_clause, &group_by_clause, &having_clause, &order_by_clause] {
            if !clause.is_empty() {
                query = format!("{}\n{}", query, clause);
            }
        }

        Ok((query, visitor.parameters, result_fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{core_schema, Field};
    use once_cell::sync::Lazy;

    struct TestDialect {
        rewriters: RewriterTable,
    }

    impl TestDialect {
        fn new() -> Self {
            let mut rewriters = default_rewriter_table();
            rewriters.insert(
                rewriter_key("has_tag", &[ExprType::Text]),
                Rewriter::Template(Box::new(|args| {
                    format!(
                        "EXISTS (SELECT 1 FROM tag WHERE uuid = core.uuid AND tag = ({}))",
                        args[0]
                    )
                })),
            );
            rewriters.insert(
                rewriter_key("is_source_of", &[ExprType::Boolean]),
                Rewriter::SubQuery(Box::new(|where_expr, namespaces| {
                    let mut joins = String::new();
                    for namespace in namespaces {
                        joins = format!("{} INNER JOIN {} USING (uuid)", joins, namespace);
                    }
                    format!(
                        "core.uuid in (SELECT link.source_uuid FROM core{} INNER JOIN link \
                         on link.uuid = core.uuid WHERE {})",
                        joins, where_expr
                    )
                })),
            );
            rewriters.insert(
                rewriter_key("-", &[ExprType::Timestamp, ExprType::Timestamp]),
                Rewriter::Template(Box::new(|args| {
                    format!("(julianday({}) - julianday({})) * 86400.0", args[0], args[1])
                })),
            );
            TestDialect { rewriters }
        }
    }

    impl SqlDialect for TestDialect {
        fn table_name(&self, name: &str) -> String {
            name.to_string()
        }

        fn placeholder(&self, name: &str) -> String {
            format!(":{}", name)
        }

        fn rewriters(&self) -> &RewriterTable {
            &self.rewriters
        }

        fn rewrite_subscript(&self, column: &str, subscript: &str) -> Result<String> {
            match subscript {
                "yearmonth" => Ok(format!("STRFTIME('%Y-%m', {})", column)),
                "length" => Ok(format!("LENGTH({})", column)),
                other => Err(Error::User(format!("unsupported subscript: {}", other))),
            }
        }
    }

    static SCHEMAS: Lazy<BTreeMap<String, Schema>> = Lazy::new(|| {
        let mut schemas = BTreeMap::new();
        schemas.insert("core".to_string(), core_schema());
        schemas.insert(
            "mynamespace".to_string(),
            Schema::new().with_field(
                Field::new("hello", crate::schema::DataType::Text).optional(),
            ),
        );
        schemas
    });

    fn builder(dialect: &TestDialect) -> SqlBuilder<'_, TestDialect> {
        SqlBuilder::new(&SCHEMAS, dialect)
    }

    #[test]
    fn equality_gets_null_guard() {
        let dialect = TestDialect::new();
        let (query, parameters) = builder(&dialect)
            .build_count_query("product_name == \"pi.txt\"", &BTreeMap::new())
            .unwrap();
        assert_eq!(
            query,
            "SELECT COUNT(*) AS count FROM core WHERE ((core.product_name) = (:0) \
             AND core.product_name IS NOT NULL)"
        );
        assert_eq!(
            parameters.get("0"),
            Some(&Value::Text("pi.txt".to_string()))
        );
    }

    #[test]
    fn inequality_also_matches_null() {
        let dialect = TestDialect::new();
        let (query, _) = builder(&dialect)
            .build_count_query("product_name != \"x\"", &BTreeMap::new())
            .unwrap();
        assert!(query.contains("OR core.product_name IS NULL"));
    }

    #[test]
    fn name_to_name_comparison_has_no_guard() {
        let dialect = TestDialect::new();
        let (query, _) = builder(&dialect)
            .build_count_query("validity_start == validity_stop", &BTreeMap::new())
            .unwrap();
        assert!(!query.contains("IS NOT NULL"));
    }

    #[test]
    fn extension_namespace_adds_left_join() {
        let dialect = TestDialect::new();
        let (query, _, description) = builder(&dialect)
            .build_search_query(
                "mynamespace.hello == \"x\"",
                &[],
                None,
                &BTreeMap::new(),
                &[],
                &[],
            )
            .unwrap();
        assert!(query.contains("FROM core LEFT JOIN mynamespace USING (uuid)"));
        assert_eq!(description[0].0, "core");
    }

    #[test]
    fn search_with_property_names_selects_uuid_probe() {
        let dialect = TestDialect::new();
        let (query, _, description) = builder(&dialect)
            .build_search_query(
                "",
                &[],
                None,
                &BTreeMap::new(),
                &[],
                &["uuid".to_string(), "mynamespace.hello".to_string()],
            )
            .unwrap();
        assert_eq!(description[0], ("core".to_string(), vec!["uuid".to_string()]));
        assert_eq!(
            description[1],
            (
                "mynamespace".to_string(),
                vec!["uuid".to_string(), "hello".to_string()]
            )
        );
        assert!(query.starts_with("SELECT core.uuid, mynamespace.uuid, mynamespace.hello "));
    }

    #[test]
    fn order_by_and_limit() {
        let dialect = TestDialect::new();
        let (query, _, _) = builder(&dialect)
            .build_search_query(
                "",
                &["-archive_date".to_string(), "+product_name".to_string()],
                Some(5),
                &BTreeMap::new(),
                &[],
                &[],
            )
            .unwrap();
        assert!(query.contains(
            "ORDER BY core.archive_date DESC, core.product_name ASC LIMIT 5"
        ));
    }

    #[test]
    fn lineage_subquery_keeps_joins_inside() {
        let dialect = TestDialect::new();
        let (query, _) = builder(&dialect)
            .build_count_query(
                "is_source_of(mynamespace.hello == \"x\")",
                &BTreeMap::new(),
            )
            .unwrap();
        assert!(query.contains("INNER JOIN mynamespace USING (uuid)"));
        // the outer query joins nothing
        assert!(query.contains("count FROM core WHERE core.uuid in"));
    }

    #[test]
    fn parameter_lists_expand() {
        let dialect = TestDialect::new();
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "names".to_string(),
            Value::Sequence(vec![Value::Text("a".to_string()), Value::Text("b".to_string())]),
        );
        let (query, bound) = builder(&dialect)
            .build_count_query("product_name in @names", &parameters)
            .unwrap();
        assert!(query.contains("(core.product_name) in (:0,:1)"));
        assert_eq!(bound.len(), 2);
    }

    #[test]
    fn literal_lists_are_inlined() {
        let dialect = TestDialect::new();
        let (query, bound) = builder(&dialect)
            .build_count_query("product_type in [\"a\", \"o'b\"]", &BTreeMap::new())
            .unwrap();
        assert!(query.contains("('a','o''b')"));
        assert!(bound.is_empty());
    }

    #[test]
    fn summary_query_shape() {
        let dialect = TestDialect::new();
        let (query, _, result_fields) = builder(&dialect)
            .build_summary_query(
                "",
                &BTreeMap::new(),
                &["core.size.sum".to_string(), "validity_duration.avg".to_string()],
                &["product_type".to_string(), "validity_start.yearmonth".to_string()],
                false,
                Some("count > 1"),
                &["-count".to_string()],
            )
            .unwrap();
        assert!(query.contains("core.product_type AS \"core.product_type\""));
        assert!(query.contains(
            "STRFTIME('%Y-%m', core.validity_start) AS \"core.validity_start.yearmonth\""
        ));
        assert!(query.contains("COUNT(*) AS count"));
        assert!(query.contains("SUM(core.size) AS \"core.size.sum\""));
        assert!(query.contains(
            "AVG((julianday(core.validity_stop) - julianday(core.validity_start)) * 86400.0) \
             AS \"validity_duration.avg\""
        ));
        assert!(query.contains("GROUP BY 1, 2"));
        assert!(query.contains("HAVING (COUNT(*)) > (:0)"));
        assert!(query.contains("ORDER BY \"count\" DESC, 1, 2"));
        assert_eq!(
            result_fields,
            vec![
                "core.product_type".to_string(),
                "core.validity_start.yearmonth".to_string(),
                "count".to_string(),
                "core.size.sum".to_string(),
                "core.validity_duration.avg".to_string(),
            ]
        );
    }

    #[test]
    fn summary_group_by_tag_joins_tag_table() {
        let dialect = TestDialect::new();
        let (query, _, result_fields) = builder(&dialect)
            .build_summary_query("", &BTreeMap::new(), &[], &[], true, None, &[])
            .unwrap();
        assert!(query.contains("LEFT JOIN tag USING (uuid)"));
        assert!(query.contains("tag.tag AS \"tag\""));
        assert_eq!(result_fields, vec!["tag".to_string(), "count".to_string()]);
    }

    #[test]
    fn summary_rejects_bad_subscripts() {
        let dialect = TestDialect::new();
        assert!(builder(&dialect)
            .build_summary_query(
                "",
                &BTreeMap::new(),
                &["core.size".to_string()],
                &[],
                false,
                None,
                &[],
            )
            .is_err());
        assert!(builder(&dialect)
            .build_summary_query(
                "",
                &BTreeMap::new(),
                &[],
                &["footprint".to_string()],
                false,
                None,
                &[],
            )
            .is_err());
    }

    #[test]
    fn has_tag_rewrites_to_exists() {
        let dialect = TestDialect::new();
        let (query, _) = builder(&dialect)
            .build_count_query("has_tag(\"mytag\")", &BTreeMap::new())
            .unwrap();
        assert!(query.contains("EXISTS (SELECT 1 FROM tag WHERE uuid = core.uuid"));
    }
}

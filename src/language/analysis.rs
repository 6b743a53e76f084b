//! Semantic analysis: bind names to namespace schemas, substitute parameter
//! values, and resolve every function call to a unique prototype.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::records::Value;
use crate::schema::Schema;

use super::ast::{Expr, ExprType, NameKind, TypedExpr};
use super::functions::FUNCTION_TABLE;

/// Determine the expression type of a literal or parameter value.
pub fn literal_type(value: &Value) -> Result<ExprType> {
    match value {
        Value::Text(_) => Ok(ExprType::Text),
        Value::Timestamp(_) => Ok(ExprType::Timestamp),
        Value::Uuid(_) => Ok(ExprType::Uuid),
        Value::Boolean(_) => Ok(ExprType::Boolean),
        Value::Integer(_) => Ok(ExprType::Integer),
        Value::Long(value) => {
            // a literal that fits a 32-bit integer compares against both
            // integer and long properties
            if *value >= i32::MIN as i64 && *value <= i32::MAX as i64 {
                Ok(ExprType::Integer)
            } else {
                Ok(ExprType::Long)
            }
        }
        Value::Real(_) => Ok(ExprType::Real),
        Value::Geometry(_) => Ok(ExprType::Geometry),
        Value::Sequence(_) => Ok(ExprType::Sequence),
        Value::Null | Value::Json(_) => Err(Error::User(format!(
            "unable to determine type of literal value of type \"{}\"",
            value.type_name()
        ))),
    }
}

/// A summary/HAVING identifier: `count`, `tag`, or a property with an
/// optional subscript (`validity_start.yearmonth`, `size.sum`).
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub canonical: String,
    /// None for the synthetic `count` column.
    pub namespace: Option<String>,
    pub identifier: String,
    pub subscript: Option<String>,
    /// None for `core.validity_duration`, which has no stored type.
    pub data_type: Option<ExprType>,
}

impl Identifier {
    pub fn resolve(
        canonical: &str,
        namespace_schemas: &BTreeMap<String, Schema>,
    ) -> Result<Identifier> {
        if canonical == "tag" {
            // the rules for namespace table names also apply to the tag table
            return Ok(Identifier {
                canonical: canonical.to_string(),
                namespace: Some("tag".to_string()),
                identifier: canonical.to_string(),
                subscript: None,
                data_type: Some(ExprType::Text),
            });
        }

        if canonical == "count" {
            return Ok(Identifier {
                canonical: canonical.to_string(),
                namespace: None,
                identifier: canonical.to_string(),
                subscript: None,
                data_type: Some(ExprType::Long),
            });
        }

        let segments: Vec<&str> = canonical.split('.').collect();
        let (namespace, identifier, subscript) = match segments.as_slice() {
            [identifier] => ("core".to_string(), identifier.to_string(), None),
            [first, second] => {
                if namespace_schemas.contains_key(*first) {
                    (first.to_string(), second.to_string(), None)
                } else {
                    ("core".to_string(), first.to_string(), Some(second.to_string()))
                }
            }
            [namespace, identifier, subscript] => (
                namespace.to_string(),
                identifier.to_string(),
                Some(subscript.to_string()),
            ),
            _ => {
                return Err(Error::User(format!(
                    "cannot resolve identifier: \"{}\"",
                    canonical
                )))
            }
        };

        let schema = namespace_schemas
            .get(&namespace)
            .ok_or_else(|| Error::User(format!("undefined namespace: \"{}\"", namespace)))?;

        let data_type = match schema.get(&identifier) {
            Some(field) => Some(ExprType::from(field.data_type)),
            None if namespace == "core" && identifier == "validity_duration" => None,
            None => {
                return Err(Error::User(format!(
                    "no property: \"{}\" defined within namespace: \"{}\"",
                    identifier, namespace
                )))
            }
        };

        // the set of valid subscripts depends on context; checked there
        Ok(Identifier {
            canonical: canonical.to_string(),
            namespace: Some(namespace),
            identifier,
            subscript,
            data_type,
        })
    }

    pub fn property_name(&self) -> String {
        format!(
            "{}.{}",
            self.namespace.as_deref().unwrap_or(""),
            self.identifier
        )
    }

    /// Fully-qualified result column name.
    pub fn resolved(&self) -> String {
        if self.canonical == "count" || self.canonical == "tag" {
            return self.canonical.clone();
        }
        match (&self.namespace, &self.subscript) {
            (Some(namespace), Some(subscript)) => {
                format!("{}.{}.{}", namespace, self.identifier, subscript)
            }
            (Some(namespace), None) => format!("{}.{}", namespace, self.identifier),
            _ => self.canonical.clone(),
        }
    }
}

struct SemanticAnalysis<'a> {
    namespace_schemas: &'a BTreeMap<String, Schema>,
    parameters: &'a BTreeMap<String, Value>,
    having: bool,
}

impl<'a> SemanticAnalysis<'a> {
    fn visit(&self, expr: &Expr) -> Result<TypedExpr> {
        match expr {
            Expr::Literal(value) => Ok(TypedExpr::Literal {
                ty: literal_type(value)?,
                value: value.clone(),
            }),
            Expr::Name(name) => self.visit_name(name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Literal(value) => values.push(value.clone()),
                        _ => return Err(Error::User("list contains non-literal".to_string())),
                    }
                }
                Ok(TypedExpr::List { values })
            }
            Expr::Parameter(name) => {
                let value = self.parameters.get(name).ok_or_else(|| {
                    Error::User(format!("no value for parameter: \"{}\"", name))
                })?;
                Ok(TypedExpr::Parameter {
                    name: name.clone(),
                    ty: literal_type(value)?,
                    value: value.clone(),
                })
            }
            Expr::Call { name, arguments } => {
                let arguments: Vec<TypedExpr> = arguments
                    .iter()
                    .map(|argument| self.visit(argument))
                    .collect::<Result<_>>()?;
                let argument_types: Vec<ExprType> =
                    arguments.iter().map(TypedExpr::ty).collect();
                let prototype = FUNCTION_TABLE.resolve(name, &argument_types)?.clone();
                Ok(TypedExpr::Call {
                    prototype,
                    arguments,
                })
            }
        }
    }

    fn visit_name(&self, name: &str) -> Result<TypedExpr> {
        if self.having {
            let identifier = Identifier::resolve(name, self.namespace_schemas)?;
            let ty = identifier.data_type.ok_or_else(|| {
                Error::User(format!(
                    "cannot resolve type of identifier: \"{}\"",
                    identifier.canonical
                ))
            })?;
            return Ok(TypedExpr::Name {
                kind: NameKind::Aggregate(identifier),
                ty,
            });
        }

        let segments: Vec<&str> = name.split('.').collect();
        let (namespace, field) = match segments.as_slice() {
            [single] => {
                if self.namespace_schemas.contains_key(*single) {
                    // bare extension namespace reference
                    return Ok(TypedExpr::Name {
                        kind: NameKind::Namespace(single.to_string()),
                        ty: ExprType::Namespace,
                    });
                }
                ("core".to_string(), single.to_string())
            }
            [namespace, field] => (namespace.to_string(), field.to_string()),
            _ => {
                return Err(Error::User(format!(
                    "invalid property name: \"{}\"",
                    name
                )))
            }
        };

        let schema = self
            .namespace_schemas
            .get(&namespace)
            .ok_or_else(|| Error::User(format!("undefined namespace: \"{}\"", namespace)))?;

        let field_def = schema.get(&field).ok_or_else(|| {
            if segments.len() == 2 {
                Error::User(format!("undefined property: \"{}\"", name))
            } else {
                Error::User(format!("undefined name: \"{}\"", field))
            }
        })?;

        Ok(TypedExpr::Name {
            kind: NameKind::Property {
                namespace,
                field,
            },
            ty: ExprType::from(field_def.data_type),
        })
    }
}

/// Annotate a parsed expression tree with resolved types.
pub fn analyze(
    expr: &Expr,
    namespace_schemas: &BTreeMap<String, Schema>,
    parameters: &BTreeMap<String, Value>,
    having: bool,
) -> Result<TypedExpr> {
    SemanticAnalysis {
        namespace_schemas,
        parameters,
        having,
    }
    .visit(expr)
}

/// Parse and analyze an expression in one step.
pub fn parse_and_analyze(
    text: &str,
    namespace_schemas: &BTreeMap<String, Schema>,
    parameters: &BTreeMap<String, Value>,
    having: bool,
) -> Result<TypedExpr> {
    analyze(&super::parser::parse(text)?, namespace_schemas, parameters, having)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{core_schema, DataType, Field};

    fn schemas() -> BTreeMap<String, Schema> {
        let mut schemas = BTreeMap::new();
        schemas.insert("core".to_string(), core_schema());
        schemas.insert(
            "mynamespace".to_string(),
            Schema::new().with_field(Field::new("hello", DataType::Text).optional()),
        );
        schemas
    }

    fn analyze_text(text: &str) -> Result<TypedExpr> {
        parse_and_analyze(text, &schemas(), &BTreeMap::new(), false)
    }

    #[test]
    fn bare_names_resolve_to_core() {
        match analyze_text("product_name == \"pi.txt\"").unwrap() {
            TypedExpr::Call { prototype, arguments } => {
                assert_eq!(prototype.name, "==");
                match &arguments[0] {
                    TypedExpr::Name { kind: NameKind::Property { namespace, field }, ty } => {
                        assert_eq!(namespace, "core");
                        assert_eq!(field, "product_name");
                        assert_eq!(*ty, ExprType::Text);
                    }
                    other => panic!("expected property name, got {:?}", other),
                }
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn namespace_reference_types_as_namespace() {
        match analyze_text("is_defined(mynamespace)").unwrap() {
            TypedExpr::Call { prototype, .. } => {
                assert_eq!(prototype.argument_types, vec![ExprType::Namespace]);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn analysis_is_idempotent_on_types() {
        let expr = super::super::parser::parse("size + 1 > 4").unwrap();
        let first = analyze(&expr, &schemas(), &BTreeMap::new(), false).unwrap();
        let second = analyze(&expr, &schemas(), &BTreeMap::new(), false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ty(), ExprType::Boolean);
    }

    #[test]
    fn unknown_names_fail() {
        assert!(analyze_text("bogus == 1").is_err());
        assert!(analyze_text("bogus.size == 1").is_err());
        assert!(analyze_text("core.bogus == 1").is_err());
    }

    #[test]
    fn parameters_are_substituted() {
        let mut parameters = BTreeMap::new();
        parameters.insert("name".to_string(), Value::Text("pi.txt".to_string()));
        let typed =
            parse_and_analyze("product_name == @name", &schemas(), &parameters, false).unwrap();
        match typed {
            TypedExpr::Call { arguments, .. } => match &arguments[1] {
                TypedExpr::Parameter { value, ty, .. } => {
                    assert_eq!(value, &Value::Text("pi.txt".to_string()));
                    assert_eq!(*ty, ExprType::Text);
                }
                other => panic!("expected parameter, got {:?}", other),
            },
            other => panic!("expected call, got {:?}", other),
        }
        assert!(analyze_text("product_name == @name").is_err());
    }

    #[test]
    fn uuid_literal_in_lineage_function() {
        let typed = analyze_text("is_derived_from(32a61528-a712-427a-b28f-8ebd28cc1d44)").unwrap();
        match typed {
            TypedExpr::Call { prototype, .. } => {
                assert_eq!(prototype.argument_types, vec![ExprType::Uuid]);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn having_names_resolve_to_identifiers() {
        let typed = parse_and_analyze("count > 10", &schemas(), &BTreeMap::new(), true).unwrap();
        match typed {
            TypedExpr::Call { arguments, .. } => match &arguments[0] {
                TypedExpr::Name { kind: NameKind::Aggregate(identifier), ty } => {
                    assert_eq!(identifier.canonical, "count");
                    assert_eq!(*ty, ExprType::Long);
                }
                other => panic!("expected aggregate name, got {:?}", other),
            },
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn identifier_resolution() {
        let identifier = Identifier::resolve("validity_start.yearmonth", &schemas()).unwrap();
        assert_eq!(identifier.namespace.as_deref(), Some("core"));
        assert_eq!(identifier.identifier, "validity_start");
        assert_eq!(identifier.subscript.as_deref(), Some("yearmonth"));
        assert_eq!(identifier.resolved(), "core.validity_start.yearmonth");

        let identifier = Identifier::resolve("mynamespace.hello", &schemas()).unwrap();
        assert_eq!(identifier.namespace.as_deref(), Some("mynamespace"));
        assert!(identifier.subscript.is_none());

        let duration = Identifier::resolve("core.validity_duration", &schemas()).unwrap();
        assert!(duration.data_type.is_none());

        assert!(Identifier::resolve("core.bogus", &schemas()).is_err());
        assert!(Identifier::resolve("a.b.c.d", &schemas()).is_err());
    }
}

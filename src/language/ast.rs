//! Abstract syntax trees for the expression language.
//!
//! [`Expr`] is the parse result; [`TypedExpr`] is the analyzed tree with
//! every node annotated by its resolved type and function calls bound to a
//! unique prototype.

use crate::records::Value;
use crate::schema::DataType;

use super::analysis::Identifier;
use super::functions::Prototype;

/// Types a sub-expression can resolve to. A superset of the schema field
/// types: a bare namespace reference and a literal list have no field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprType {
    Long,
    Integer,
    Real,
    Boolean,
    Text,
    Timestamp,
    Uuid,
    Geometry,
    Json,
    Namespace,
    Sequence,
}

impl ExprType {
    pub fn name(&self) -> &'static str {
        match self {
            ExprType::Long => "long",
            ExprType::Integer => "integer",
            ExprType::Real => "real",
            ExprType::Boolean => "boolean",
            ExprType::Text => "text",
            ExprType::Timestamp => "timestamp",
            ExprType::Uuid => "uuid",
            ExprType::Geometry => "geometry",
            ExprType::Json => "json",
            ExprType::Namespace => "namespace",
            ExprType::Sequence => "sequence",
        }
    }
}

impl From<DataType> for ExprType {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::Long => ExprType::Long,
            DataType::Integer => ExprType::Integer,
            DataType::Real => ExprType::Real,
            DataType::Boolean => ExprType::Boolean,
            DataType::Text => ExprType::Text,
            DataType::Timestamp => ExprType::Timestamp,
            DataType::Uuid => ExprType::Uuid,
            DataType::Geometry => ExprType::Geometry,
            DataType::Json => ExprType::Json,
        }
    }
}

impl std::fmt::Display for ExprType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Untyped syntax tree produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Parameter(String),
    Call { name: String, arguments: Vec<Expr> },
}

/// A resolved name.
#[derive(Debug, Clone, PartialEq)]
pub enum NameKind {
    /// `namespace.field`
    Property { namespace: String, field: String },
    /// A bare extension namespace reference.
    Namespace(String),
    /// HAVING-clause identifier: `count`, `tag`, or an aggregate subscript.
    Aggregate(Identifier),
}

/// Analyzed syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedExpr {
    Literal {
        value: Value,
        ty: ExprType,
    },
    Name {
        kind: NameKind,
        ty: ExprType,
    },
    List {
        values: Vec<Value>,
    },
    /// A `@name` reference with its caller-supplied value substituted.
    Parameter {
        name: String,
        value: Value,
        ty: ExprType,
    },
    Call {
        prototype: Prototype,
        arguments: Vec<TypedExpr>,
    },
}

impl TypedExpr {
    pub fn ty(&self) -> ExprType {
        match self {
            TypedExpr::Literal { ty, .. } => *ty,
            TypedExpr::Name { ty, .. } => *ty,
            TypedExpr::List { .. } => ExprType::Sequence,
            TypedExpr::Parameter { ty, .. } => *ty,
            TypedExpr::Call { prototype, .. } => prototype.return_type,
        }
    }
}

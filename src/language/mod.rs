//! The query expression language: tokenizer, parser, and semantic analyzer.
//!
//! Expressions reference product properties as `namespace.field` (bare names
//! resolve to `core`), combine them with boolean/comparison/arithmetic
//! operators, and call the built-in functions (`covers`, `intersects`,
//! `is_defined`, `is_source_of`, `is_derived_from`, `has_tag`, `now`). An
//! analyzed tree is consumed by the SQL builder.

mod analysis;
mod ast;
mod functions;
mod lexer;
mod parser;

pub use analysis::{analyze, literal_type, parse_and_analyze, Identifier};
pub use ast::{Expr, ExprType, NameKind, TypedExpr};
pub use functions::{FunctionTable, Prototype, FUNCTION_TABLE};
pub use lexer::{string_unescape, Token, TokenKind, TokenStream};
pub use parser::parse;

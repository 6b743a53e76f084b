//! Operator and function prototypes, with overload resolution.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

use super::ast::ExprType;

/// A function signature: name, argument types, return type. Operators are
/// functions named after their symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prototype {
    pub name: String,
    pub argument_types: Vec<ExprType>,
    pub return_type: ExprType,
}

impl Prototype {
    pub fn new(name: &str, argument_types: &[ExprType], return_type: ExprType) -> Self {
        Prototype {
            name: name.to_string(),
            argument_types: argument_types.to_vec(),
            return_type,
        }
    }

    pub fn arity(&self) -> usize {
        self.argument_types.len()
    }

    /// `name(arg,...)` form used in error messages.
    pub fn signature(name: &str, argument_types: &[ExprType]) -> String {
        let arguments: Vec<&str> = argument_types.iter().map(ExprType::name).collect();
        format!("{}({})", name, arguments.join(","))
    }
}

impl std::fmt::Display for Prototype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            Prototype::signature(&self.name, &self.argument_types),
            self.return_type
        )
    }
}

/// All registered prototypes, indexed by function name.
pub struct FunctionTable {
    prototypes: HashMap<String, Vec<Prototype>>,
}

impl FunctionTable {
    fn new() -> Self {
        FunctionTable {
            prototypes: HashMap::new(),
        }
    }

    fn add(&mut self, name: &str, argument_types: &[ExprType], return_type: ExprType) {
        self.prototypes
            .entry(name.to_string())
            .or_default()
            .push(Prototype::new(name, argument_types, return_type));
    }

    /// A UUID literal may stand in where a boolean sub-expression is
    /// expected; the SQL builder turns it into a `uuid` equality probe.
    fn compatible(argument: ExprType, candidate: ExprType) -> bool {
        argument == ExprType::Uuid && candidate == ExprType::Boolean
    }

    /// Resolve the unique overload for a call.
    ///
    /// Candidates must match the arity, with every argument type equal or
    /// compatible; among matches, those with the most equal argument types
    /// win. No match is a user error; more than one winner is ambiguity in
    /// the table itself.
    pub fn resolve(&self, name: &str, argument_types: &[ExprType]) -> Result<&Prototype> {
        let undefined = || {
            Error::User(format!(
                "undefined function: \"{}\"",
                Prototype::signature(name, argument_types)
            ))
        };

        let candidates = self.prototypes.get(name).ok_or_else(undefined)?;

        let mut top: Vec<&Prototype> = Vec::new();
        let mut top_equal = 0;
        for candidate in candidates {
            if candidate.arity() != argument_types.len() {
                continue;
            }

            let mut equal = 0;
            let mut matches = true;
            for (argument, expected) in argument_types.iter().zip(&candidate.argument_types) {
                if argument == expected {
                    equal += 1;
                } else if !Self::compatible(*argument, *expected) {
                    matches = false;
                    break;
                }
            }
            if !matches {
                continue;
            }

            if equal > top_equal || top.is_empty() {
                top = vec![candidate];
                top_equal = equal;
            } else if equal == top_equal {
                top.push(candidate);
            }
        }

        match top.len() {
            0 => Err(undefined()),
            1 => Ok(top[0]),
            _ => Err(Error::Internal(format!(
                "cannot uniquely resolve function: \"{}\"",
                Prototype::signature(name, argument_types)
            ))),
        }
    }
}

/// The table of all supported operators and functions.
pub static FUNCTION_TABLE: Lazy<FunctionTable> = Lazy::new(|| {
    use ExprType::*;

    let mut table = FunctionTable::new();
    let numeric = [Long, Integer, Real];

    // logical operators
    table.add("not", &[Boolean], Boolean);
    table.add("and", &[Boolean, Boolean], Boolean);
    table.add("or", &[Boolean, Boolean], Boolean);

    // membership operators
    for ty in [Integer, Long, Real, Text] {
        table.add("in", &[ty, Sequence], Boolean);
        table.add("not in", &[ty, Sequence], Boolean);
    }

    // comparison operators
    for op in ["==", "!="] {
        for left in numeric {
            for right in numeric {
                table.add(op, &[left, right], Boolean);
            }
        }
        table.add(op, &[Boolean, Boolean], Boolean);
        table.add(op, &[Text, Text], Boolean);
        table.add(op, &[Timestamp, Timestamp], Boolean);
        table.add(op, &[Uuid, Uuid], Boolean);
    }
    for op in ["<", ">", "<=", ">="] {
        for left in numeric {
            for right in numeric {
                table.add(op, &[left, right], Boolean);
            }
        }
        table.add(op, &[Text, Text], Boolean);
        table.add(op, &[Timestamp, Timestamp], Boolean);
    }
    table.add("~=", &[Text, Text], Boolean);

    // arithmetic operators
    for ty in numeric {
        table.add("+", &[ty], ty);
        table.add("-", &[ty], ty);
    }
    for op in ["+", "-", "*", "/"] {
        for left in numeric {
            for right in numeric {
                let result = if left == Real || right == Real {
                    Real
                } else if left == Integer && right == Integer {
                    Integer
                } else {
                    Long
                };
                table.add(op, &[left, right], result);
            }
        }
    }
    table.add("-", &[Timestamp, Timestamp], Real);

    // functions
    table.add("covers", &[Geometry, Geometry], Boolean);
    table.add("covers", &[Timestamp, Timestamp, Timestamp, Timestamp], Boolean);
    table.add("intersects", &[Geometry, Geometry], Boolean);
    table.add("intersects", &[Timestamp, Timestamp, Timestamp, Timestamp], Boolean);
    for ty in [Long, Integer, Real, Boolean, Text, Namespace, Timestamp, Uuid, Geometry] {
        table.add("is_defined", &[ty], Boolean);
    }
    table.add("is_source_of", &[Uuid], Boolean);
    table.add("is_source_of", &[Boolean], Boolean);
    table.add("is_derived_from", &[Uuid], Boolean);
    table.add("is_derived_from", &[Boolean], Boolean);
    table.add("has_tag", &[Text], Boolean);
    table.add("now", &[], Timestamp);

    table
});

#[cfg(test)]
mod tests {
    use super::*;
    use ExprType::*;

    #[test]
    fn exact_match_wins_over_compatible() {
        let exact = FUNCTION_TABLE.resolve("is_source_of", &[Uuid]).unwrap();
        assert_eq!(exact.argument_types, vec![Uuid]);

        let boolean = FUNCTION_TABLE.resolve("is_source_of", &[Boolean]).unwrap();
        assert_eq!(boolean.argument_types, vec![Boolean]);
    }

    #[test]
    fn mixed_arithmetic_widens() {
        let proto = FUNCTION_TABLE.resolve("+", &[Integer, Real]).unwrap();
        assert_eq!(proto.return_type, Real);
        let proto = FUNCTION_TABLE.resolve("+", &[Long, Integer]).unwrap();
        assert_eq!(proto.return_type, Long);
    }

    #[test]
    fn unknown_or_misapplied_functions_fail() {
        assert!(FUNCTION_TABLE.resolve("bogus", &[Long]).is_err());
        assert!(FUNCTION_TABLE.resolve("has_tag", &[Long]).is_err());
        assert!(FUNCTION_TABLE.resolve("covers", &[Geometry]).is_err());
    }

    #[test]
    fn uuid_stands_for_boolean_argument() {
        // "and" has no UUID overload, so a UUID argument resolves through
        // the boolean compatibility rule.
        let proto = FUNCTION_TABLE.resolve("and", &[Uuid, Boolean]).unwrap();
        assert_eq!(proto.argument_types, vec![Boolean, Boolean]);
    }
}

//! Recursive-descent parser for the query expression language.
//!
//! Precedence, low to high: `or`, `and`, `not`, comparison, additive,
//! multiplicative, unary sign, atom. Comparison and arithmetic operators
//! chain to the right.

use crate::error::{Error, Result};
use crate::geometry::{
    Geometry, LineString, LinearRing, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon,
};
use crate::records::Value;

use super::ast::Expr;
use super::lexer::{TokenKind, TokenStream};

/// Parse an expression string into an untyped syntax tree.
pub fn parse(text: &str) -> Result<Expr> {
    let mut stream = TokenStream::new(text)?;
    let expression = parse_expression(&mut stream)?;
    if !stream.at_end() {
        return Err(Error::User(format!(
            "char {}: extra characters after expression: \"{}\"",
            stream.position() + 1,
            stream.rest()
        )));
    }
    Ok(expression)
}

fn parse_expression(stream: &mut TokenStream) -> Result<Expr> {
    parse_or_expression(stream)
}

fn parse_or_expression(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_and_expression(stream)?;
    if stream.accept_name("or")? {
        return Ok(Expr::Call {
            name: "or".to_string(),
            arguments: vec![lhs, parse_or_expression(stream)?],
        });
    }
    Ok(lhs)
}

fn parse_and_expression(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_not_expression(stream)?;
    if stream.accept_name("and")? {
        return Ok(Expr::Call {
            name: "and".to_string(),
            arguments: vec![lhs, parse_and_expression(stream)?],
        });
    }
    Ok(lhs)
}

fn parse_not_expression(stream: &mut TokenStream) -> Result<Expr> {
    if stream.accept_name("not")? {
        return Ok(Expr::Call {
            name: "not".to_string(),
            arguments: vec![parse_not_expression(stream)?],
        });
    }
    parse_comparison(stream)
}

const COMPARISON_OPERATORS: &[&str] = &["<", ">", "==", ">=", "<=", "!=", "~=", "in", "not in"];

fn parse_comparison(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_arithmetic_expression(stream)?;
    if stream.test_operator(COMPARISON_OPERATORS) {
        let operator = stream.expect_operator(COMPARISON_OPERATORS)?;
        return Ok(Expr::Call {
            name: operator,
            arguments: vec![lhs, parse_comparison(stream)?],
        });
    }
    Ok(lhs)
}

fn parse_arithmetic_expression(stream: &mut TokenStream) -> Result<Expr> {
    let lhs = parse_term(stream)?;
    if stream.test_operator(&["+", "-", "*", "/"]) {
        let operator = stream.expect_operator(&["+", "-", "*", "/"])?;
        return Ok(Expr::Call {
            name: operator,
            arguments: vec![lhs, parse_arithmetic_expression(stream)?],
        });
    }
    Ok(lhs)
}

fn parse_term(stream: &mut TokenStream) -> Result<Expr> {
    if stream.test_operator(&["+", "-"]) {
        let operator = stream.expect_operator(&["+", "-"])?;
        return Ok(Expr::Call {
            name: operator,
            arguments: vec![parse_term(stream)?],
        });
    }
    parse_atom(stream)
}

fn parse_atom(stream: &mut TokenStream) -> Result<Expr> {
    // sub-expression
    if stream.accept_operator("(")? {
        let sub_expression = parse_expression(stream)?;
        stream.expect_operator(&[")"])?;
        return Ok(sub_expression);
    }

    // parameter reference
    if stream.accept_operator("@")? {
        return Ok(Expr::Parameter(stream.expect_name()?));
    }

    // geometry literal, function call, or (qualified) name
    if matches!(stream.current().kind, TokenKind::Name(_)) {
        let name = stream.expect_name()?;

        match name.as_str() {
            "POINT" => return Ok(Expr::Literal(Value::Geometry(Geometry::Point(parse_point(stream)?)))),
            "LINESTRING" => {
                return Ok(Expr::Literal(Value::Geometry(Geometry::LineString(
                    parse_line_string(stream)?,
                ))))
            }
            "POLYGON" => {
                return Ok(Expr::Literal(Value::Geometry(Geometry::Polygon(
                    parse_polygon(stream)?,
                ))))
            }
            "MULTIPOINT" => {
                return Ok(Expr::Literal(Value::Geometry(Geometry::MultiPoint(
                    MultiPoint(parse_geometry_sequence(stream, parse_point)?),
                ))))
            }
            "MULTILINESTRING" => {
                return Ok(Expr::Literal(Value::Geometry(Geometry::MultiLineString(
                    MultiLineString(parse_geometry_sequence(stream, parse_line_string)?),
                ))))
            }
            "MULTIPOLYGON" => {
                return Ok(Expr::Literal(Value::Geometry(Geometry::MultiPolygon(
                    MultiPolygon(parse_geometry_sequence(stream, parse_polygon)?),
                ))))
            }
            _ => {}
        }

        // function call
        if stream.test_operator(&["("]) {
            return Ok(Expr::Call {
                name,
                arguments: parse_sequence(stream, parse_expression, "(", ")")?,
            });
        }

        // qualified name
        let mut parts = vec![name];
        while stream.accept_operator(".")? {
            parts.push(stream.expect_name()?);
        }
        return Ok(Expr::Name(parts.join(".")));
    }

    if stream.test_operator(&["["]) {
        return Ok(Expr::List(parse_sequence(stream, parse_expression, "[", "]")?));
    }

    // literal
    let token = stream.current().clone();
    let value = match token.kind {
        TokenKind::Text(text) => Value::Text(text),
        TokenKind::Timestamp(timestamp) => Value::Timestamp(timestamp),
        TokenKind::Uuid(uuid) => Value::Uuid(uuid),
        TokenKind::Real(real) => Value::Real(real),
        TokenKind::Integer(integer) => Value::Long(integer),
        TokenKind::Boolean(boolean) => Value::Boolean(boolean),
        _ => {
            return Err(stream.error_at(&format!(
                "expected one of: TEXT, TIMESTAMP, UUID, REAL, INTEGER, BOOLEAN, got {}",
                match &token.kind {
                    TokenKind::Operator(op) => format!("\"{}\"", op),
                    TokenKind::End => "end of input".to_string(),
                    other => format!("{:?}", other),
                }
            )))
        }
    };
    stream.advance()?;
    Ok(Expr::Literal(value))
}

fn parse_sequence<T>(
    stream: &mut TokenStream,
    parse_item: impl Fn(&mut TokenStream) -> Result<T>,
    start: &str,
    end: &str,
) -> Result<Vec<T>> {
    stream.expect_operator(&[start])?;
    if stream.accept_operator(end)? {
        return Ok(Vec::new());
    }

    let mut sequence = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        sequence.push(parse_item(stream)?);
    }
    stream.expect_operator(&[end])?;
    Ok(sequence)
}

fn parse_geometry_sequence<T>(
    stream: &mut TokenStream,
    parse_item: impl Fn(&mut TokenStream) -> Result<T>,
) -> Result<Vec<T>> {
    if stream.accept_name("EMPTY")? {
        return Ok(Vec::new());
    }

    stream.expect_operator(&["("])?;
    let mut sequence = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        sequence.push(parse_item(stream)?);
    }
    stream.expect_operator(&[")"])?;
    Ok(sequence)
}

fn parse_signed_coordinate(stream: &mut TokenStream) -> Result<f64> {
    if stream.accept_operator("-")? {
        return Ok(-stream.expect_number()?);
    }
    stream.accept_operator("+")?;
    stream.expect_number()
}

fn parse_point_raw(stream: &mut TokenStream) -> Result<Point> {
    Ok(Point::new(
        parse_signed_coordinate(stream)?,
        parse_signed_coordinate(stream)?,
    ))
}

fn parse_point(stream: &mut TokenStream) -> Result<Point> {
    stream.expect_operator(&["("])?;
    let point = parse_point_raw(stream)?;
    stream.expect_operator(&[")"])?;
    Ok(point)
}

fn parse_line_string(stream: &mut TokenStream) -> Result<LineString> {
    LineString::new(parse_geometry_sequence(stream, parse_point_raw)?)
}

fn parse_linear_ring(stream: &mut TokenStream) -> Result<LinearRing> {
    let points = parse_geometry_sequence(stream, parse_point_raw)?;
    if points.is_empty() {
        return LinearRing::new(points);
    }

    if points.len() < 4 {
        return Err(Error::User(format!(
            "char {}: linear ring should be empty or should contain >= 4 points",
            stream.position()
        )));
    }
    if points.last() != points.first() {
        return Err(Error::User(format!(
            "char {}: linear ring should be closed",
            stream.position()
        )));
    }

    let mut points = points;
    points.pop();
    LinearRing::new(points)
}

fn parse_polygon(stream: &mut TokenStream) -> Result<Polygon> {
    Ok(Polygon(parse_geometry_sequence(stream, parse_linear_ring)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(expr: &Expr) -> (&str, &[Expr]) {
        match expr {
            Expr::Call { name, arguments } => (name.as_str(), arguments.as_slice()),
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn precedence_or_binds_loosest() {
        let expr = parse("not a and b or c").unwrap();
        let (name, args) = call(&expr);
        assert_eq!(name, "or");
        let (name, args) = call(&args[0]);
        assert_eq!(name, "and");
        let (name, _) = call(&args[0]);
        assert_eq!(name, "not");
    }

    #[test]
    fn comparison_chains_right() {
        let expr = parse("1 + 2 == size").unwrap();
        let (name, args) = call(&expr);
        assert_eq!(name, "==");
        let (name, _) = call(&args[0]);
        assert_eq!(name, "+");
        assert_eq!(args[1], Expr::Name("size".to_string()));
    }

    #[test]
    fn membership_and_lists() {
        let expr = parse("product_type in [\"a\", \"b\"]").unwrap();
        let (name, args) = call(&expr);
        assert_eq!(name, "in");
        match &args[1] {
            Expr::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {:?}", other),
        }

        let expr = parse("size not in [1, 2]").unwrap();
        let (name, _) = call(&expr);
        assert_eq!(name, "not in");
    }

    #[test]
    fn qualified_names_and_parameters() {
        assert_eq!(
            parse("mynamespace.hello").unwrap(),
            Expr::Name("mynamespace.hello".to_string())
        );
        assert_eq!(parse("@foo").unwrap(), Expr::Parameter("foo".to_string()));
    }

    #[test]
    fn function_calls() {
        let expr = parse("is_defined(core.validity_start)").unwrap();
        let (name, args) = call(&expr);
        assert_eq!(name, "is_defined");
        assert_eq!(args.len(), 1);

        let expr = parse("now()").unwrap();
        let (name, args) = call(&expr);
        assert_eq!(name, "now");
        assert!(args.is_empty());
    }

    #[test]
    fn geometry_literals() {
        match parse("POINT (1.5 -2)").unwrap() {
            Expr::Literal(Value::Geometry(Geometry::Point(point))) => {
                assert_eq!(point, Point::new(1.5, -2.0));
            }
            other => panic!("expected point literal, got {:?}", other),
        }

        match parse("POLYGON ((0 0, 4 0, 4 4, 0 0))").unwrap() {
            Expr::Literal(Value::Geometry(Geometry::Polygon(polygon))) => {
                // the closing point is stripped
                assert_eq!(polygon.0[0].0.len(), 3);
            }
            other => panic!("expected polygon literal, got {:?}", other),
        }

        assert!(parse("POLYGON ((0 0, 4 0, 4 4, 1 1))").is_err());
        assert!(parse("LINESTRING EMPTY").is_ok());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse("true extra").is_err());
        assert!(parse("").is_err());
    }
}

//! Boolean query expressions for chunk `query=` selections, e.g.
//! `x1 == "hi" AND y2 > 42`. Variables name fields of a rank-1
//! compound element; evaluation is per record against the decoded
//! JSON field values.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, multispace0};
use nom::combinator::{opt, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp { var: String, op: CmpOp, lit: Literal },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

fn identifier(input: &str) -> IResult<&str, &str> {
    let (rest, ident) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)?;
    if ident.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_') != Some(true) {
        return Err(nom::Err::Error((input, nom::error::ErrorKind::Alpha)));
    }
    Ok((rest, ident))
}

fn number(input: &str) -> IResult<&str, Literal> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        take_while1(|c: char| c.is_ascii_digit()),
        opt(pair(char('.'), take_while(|c: char| c.is_ascii_digit()))),
    )))(input)?;
    let lit = if text.contains('.') {
        match text.parse::<f64>() {
            Ok(v) => Literal::Float(v),
            Err(_) => return Err(nom::Err::Error((input, nom::error::ErrorKind::Digit))),
        }
    } else {
        match text.parse::<i64>() {
            Ok(v) => Literal::Int(v),
            Err(_) => return Err(nom::Err::Error((input, nom::error::ErrorKind::Digit))),
        }
    };
    Ok((rest, lit))
}

fn string_literal(input: &str) -> IResult<&str, Literal> {
    let double = delimited(char('"'), take_while(|c| c != '"'), char('"'));
    let single = delimited(char('\''), take_while(|c| c != '\''), char('\''));
    let (rest, text) = alt((double, single))(input)?;
    Ok((rest, Literal::Str(text.to_string())))
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((string_literal, number))(input)
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    let (rest, op) = alt((tag("=="), tag("!="), tag("<="), tag(">="), tag("<"), tag(">")))(input)?;
    let op = match op {
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        "<=" => CmpOp::Le,
        ">=" => CmpOp::Ge,
        "<" => CmpOp::Lt,
        _ => CmpOp::Gt,
    };
    Ok((rest, op))
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (rest, (_, var, _, op, _, lit)) = tuple((
        multispace0,
        identifier,
        multispace0,
        cmp_op,
        multispace0,
        literal,
    ))(input)?;
    Ok((rest, Expr::Cmp { var: var.to_string(), op, lit }))
}

fn atom(input: &str) -> IResult<&str, Expr> {
    let parens = delimited(
        preceded(multispace0, char('(')),
        or_expr,
        preceded(multispace0, char(')')),
    );
    alt((parens, comparison))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = atom(input)?;
    let (rest, others) = many0(preceded(preceded(multispace0, tag("AND")), atom))(rest)?;
    let expr = others
        .into_iter()
        .fold(first, |acc, next| Expr::And(Box::new(acc), Box::new(next)));
    Ok((rest, expr))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = and_expr(input)?;
    let (rest, others) = many0(preceded(preceded(multispace0, tag("OR")), and_expr))(rest)?;
    let expr = others
        .into_iter()
        .fold(first, |acc, next| Expr::Or(Box::new(acc), Box::new(next)));
    Ok((rest, expr))
}

impl Expr {
    pub fn parse(input: &str) -> ServiceResult<Expr> {
        match or_expr(input) {
            Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
            Ok((rest, _)) => Err(ServiceError::BadRequest(format!(
                "trailing input in query expression: '{}'",
                rest
            ))),
            Err(_) => Err(ServiceError::BadRequest(format!("invalid query expression: {}", input))),
        }
    }

    /// Names of the variables the expression references.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Cmp { var, .. } => {
                if !out.contains(var) {
                    out.push(var.clone());
                }
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
        }
    }

    /// Evaluate against one record's field values.
    pub fn evaluate<F>(&self, fields: &F) -> ServiceResult<bool>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Expr::And(a, b) => Ok(a.evaluate(fields)? && b.evaluate(fields)?),
            Expr::Or(a, b) => Ok(a.evaluate(fields)? || b.evaluate(fields)?),
            Expr::Cmp { var, op, lit } => {
                let value = fields(var).ok_or_else(|| {
                    ServiceError::BadRequest(format!("unknown field in query: {}", var))
                })?;
                compare(&value, *op, lit)
            }
        }
    }
}

fn compare(value: &Value, op: CmpOp, lit: &Literal) -> ServiceResult<bool> {
    let ord = match (value, lit) {
        (Value::String(v), Literal::Str(l)) => v.as_str().cmp(l.as_str()),
        (Value::Number(v), Literal::Int(l)) => {
            let v = v
                .as_f64()
                .ok_or_else(|| ServiceError::BadRequest("non-finite field value".to_string()))?;
            v.partial_cmp(&(*l as f64))
                .ok_or_else(|| ServiceError::BadRequest("unordered comparison".to_string()))?
        }
        (Value::Number(v), Literal::Float(l)) => {
            let v = v
                .as_f64()
                .ok_or_else(|| ServiceError::BadRequest("non-finite field value".to_string()))?;
            v.partial_cmp(l)
                .ok_or_else(|| ServiceError::BadRequest("unordered comparison".to_string()))?
        }
        _ => {
            return Err(ServiceError::BadRequest(format!(
                "query type mismatch for value {}",
                value
            )))
        }
    };
    Ok(match op {
        CmpOp::Eq => ord == std::cmp::Ordering::Equal,
        CmpOp::Ne => ord != std::cmp::Ordering::Equal,
        CmpOp::Lt => ord == std::cmp::Ordering::Less,
        CmpOp::Le => ord != std::cmp::Ordering::Greater,
        CmpOp::Gt => ord == std::cmp::Ordering::Greater,
        CmpOp::Ge => ord != std::cmp::Ordering::Less,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> impl Fn(&str) -> Option<Value> {
        let map: std::collections::HashMap<String, Value> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_string_and_number() {
        let expr = Expr::parse(r#"x1 == "hi" AND y2 > 42"#).unwrap();
        let vars = expr.variables();
        assert_eq!(vars.len(), 2);
        assert!(vars.contains(&"x1".to_string()));
        assert!(vars.contains(&"y2".to_string()));
        assert!(expr.evaluate(&fields(&[("x1", json!("hi")), ("y2", json!(43))])).unwrap());
        assert!(!expr.evaluate(&fields(&[("x1", json!("hi")), ("y2", json!(41))])).unwrap());
    }

    #[test]
    fn test_single_quotes() {
        let expr = Expr::parse("x1 == 'hi' AND y2 > 42").unwrap();
        assert!(expr.evaluate(&fields(&[("x1", json!("hi")), ("y2", json!(43))])).unwrap());
    }

    #[test]
    fn test_comparisons() {
        let expr = Expr::parse("x > 2 AND y < 3").unwrap();
        assert!(expr.evaluate(&fields(&[("x", json!(3)), ("y", json!(1))])).unwrap());
        assert!(!expr.evaluate(&fields(&[("x", json!(1)), ("y", json!(1))])).unwrap());
    }

    #[test]
    fn test_or_and_parens() {
        let expr = Expr::parse("(x > 5 OR y <= 1) AND z != 0").unwrap();
        assert!(expr.evaluate(&fields(&[("x", json!(9)), ("y", json!(4)), ("z", json!(1))])).unwrap());
        assert!(!expr.evaluate(&fields(&[("x", json!(1)), ("y", json!(4)), ("z", json!(1))])).unwrap());
        assert!(!expr.evaluate(&fields(&[("x", json!(9)), ("y", json!(0)), ("z", json!(0))])).unwrap());
    }

    #[test]
    fn test_type_mismatch() {
        let expr = Expr::parse("x > 2").unwrap();
        assert!(expr.evaluate(&fields(&[("x", json!("3"))])).is_err());
        assert!(expr.evaluate(&fields(&[("y", json!(1))])).is_err());
    }

    #[test]
    fn test_malformed() {
        assert!(Expr::parse("x > 2 AND").is_err());
        assert!(Expr::parse("1 + 1 = 2").is_err());
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("x ~ 2").is_err());
    }

    #[test]
    fn test_float_literal() {
        let expr = Expr::parse("temp >= 36.5").unwrap();
        assert!(expr.evaluate(&fields(&[("temp", json!(37.0))])).unwrap());
        assert!(!expr.evaluate(&fields(&[("temp", json!(36.0))])).unwrap());
    }
}

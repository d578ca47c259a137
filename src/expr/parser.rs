//! Condition language parser using nom.

use super::ast::{CompareOp, Condition, Literal, LogicalOp, Pattern};
use crate::core::{GuardError, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{map, not, opt, peek, recognize, value as nom_value},
    error::{Error as NomError, ErrorKind},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

/// Parse a condition string into an AST. An empty string matches everything.
pub fn parse_condition(input: &str) -> Result<Condition> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Condition::Always);
    }

    match condition(trimmed) {
        Ok((remaining, cond)) => {
            let rest = remaining.trim();
            if rest.is_empty() {
                Ok(cond)
            } else {
                Err(GuardError::expression(
                    trimmed,
                    trimmed.len() - remaining.len(),
                    format!("unexpected input '{rest}'"),
                ))
            }
        },
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(GuardError::expression(
            trimmed,
            trimmed.len() - e.input.len(),
            describe(e.code),
        )),
        Err(nom::Err::Incomplete(_)) => Err(GuardError::expression(
            trimmed,
            trimmed.len(),
            "incomplete expression",
        )),
    }
}

fn describe(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::MapRes => "invalid literal or pattern",
        ErrorKind::Char => "expected delimiter",
        ErrorKind::TakeWhile1 => "expected attribute name or value",
        _ => "expected comparison",
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Keyword that is not the prefix of a longer identifier
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(kw), not(peek(take_while1(is_ident_char))))
}

fn condition(input: &str) -> IResult<&str, Condition> {
    logical_or(input)
}

/// Parse logical OR expressions
fn logical_or(input: &str) -> IResult<&str, Condition> {
    let (input, first) = logical_and(input)?;

    let (input, rest) = many0(preceded(
        preceded(multispace0, alt((tag("||"), keyword("or")))),
        preceded(multispace0, logical_and),
    ))(input)?;

    Ok((
        input,
        rest.into_iter().fold(first, |acc, right| Condition::Logical {
            op: LogicalOp::Or,
            left: Box::new(acc),
            right: Box::new(right),
        }),
    ))
}

/// Parse logical AND expressions
fn logical_and(input: &str) -> IResult<&str, Condition> {
    let (input, first) = unary(input)?;

    let (input, rest) = many0(preceded(
        preceded(multispace0, alt((tag("&&"), keyword("and")))),
        preceded(multispace0, unary),
    ))(input)?;

    Ok((
        input,
        rest.into_iter().fold(first, |acc, right| Condition::Logical {
            op: LogicalOp::And,
            left: Box::new(acc),
            right: Box::new(right),
        }),
    ))
}

/// Parse negations
fn unary(input: &str) -> IResult<&str, Condition> {
    preceded(
        multispace0,
        alt((
            map(
                preceded(
                    alt((terminated(tag("!"), not(peek(char('=')))), keyword("not"))),
                    preceded(multispace0, unary),
                ),
                |inner| Condition::Not(Box::new(inner)),
            ),
            primary,
        )),
    )(input)
}

/// Parse primary expressions
fn primary(input: &str) -> IResult<&str, Condition> {
    alt((grouped, exists, comparison))(input)
}

/// Parse grouped (parenthesized) conditions
fn grouped(input: &str) -> IResult<&str, Condition> {
    delimited(
        char('('),
        preceded(multispace0, condition),
        preceded(multispace0, char(')')),
    )(input)
}

/// Parse `exists(attr)`
fn exists(input: &str) -> IResult<&str, Condition> {
    map(
        preceded(
            tag_no_case("exists"),
            delimited(
                preceded(multispace0, char('(')),
                delimited(multispace0, attribute_name, multispace0),
                char(')'),
            ),
        ),
        Condition::Exists,
    )(input)
}

/// Parse comparisons; regex operands are compiled here
fn comparison(input: &str) -> IResult<&str, Condition> {
    let (rest, (attribute, op, raw)) = tuple((
        attribute_name,
        preceded(multispace0, operator),
        preceded(multispace0, literal),
    ))(input)?;

    let value = if op == CompareOp::Regex {
        let source = match raw {
            Literal::Str(s) => s,
            other => other.to_string(),
        };
        match regex::Regex::new(&source) {
            Ok(re) => Literal::Pattern(Pattern(re)),
            Err(_) => {
                return Err(nom::Err::Failure(NomError::new(input, ErrorKind::MapRes)));
            },
        }
    } else {
        raw
    };

    Ok((
        rest,
        Condition::Compare {
            attribute,
            op,
            value,
        },
    ))
}

/// Parse attribute names (e.g., duration_ms, db.query.id)
fn attribute_name(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            take_while1(is_ident_char),
            many0(pair(char('.'), take_while1(is_ident_char))),
        )),
        |s: &str| s.to_string(),
    )(input)
}

/// Parse operators
fn operator(input: &str) -> IResult<&str, CompareOp> {
    alt((
        nom_value(CompareOp::Regex, tag("=~")),
        nom_value(CompareOp::NotEq, tag("!=")),
        nom_value(CompareOp::Gte, tag(">=")),
        nom_value(CompareOp::Lte, tag("<=")),
        nom_value(CompareOp::Eq, tag("==")),
        nom_value(CompareOp::Eq, tag("=")),
        nom_value(CompareOp::Gt, tag(">")),
        nom_value(CompareOp::Lt, tag("<")),
        nom_value(CompareOp::Contains, keyword("contains")),
    ))(input)
}

/// Parse literal values
fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(quoted_string, Literal::Str),
        map(boolean, Literal::Bool),
        number,
        map(bare_word, Literal::Str),
    ))(input)
}

/// Parse double- or single-quoted strings. A backslash escapes the delimiter
/// and itself; other escapes are kept verbatim so regex classes survive.
fn quoted_string(input: &str) -> IResult<&str, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(delim: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    move |input: &'a str| {
        let (body, _) = char(delim)(input)?;
        let mut out = String::new();
        let mut chars = body.char_indices();
        while let Some((idx, c)) = chars.next() {
            if c == delim {
                return Ok((&body[idx + c.len_utf8()..], out));
            }
            if c == '\\' {
                match chars.next() {
                    Some((_, next)) if next == delim || next == '\\' => out.push(next),
                    Some((_, next)) => {
                        out.push('\\');
                        out.push(next);
                    },
                    None => break,
                }
            } else {
                out.push(c);
            }
        }
        Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
    }
}

/// Parse boolean values
fn boolean(input: &str) -> IResult<&str, bool> {
    alt((nom_value(true, keyword("true")), nom_value(false, keyword("false"))))(input)
}

/// Parse integer or float values
fn number(input: &str) -> IResult<&str, Literal> {
    let (rest, text) = terminated(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        not(peek(take_while1(|c: char| is_ident_char(c) || c == '.'))),
    )(input)?;

    let parsed = if text.contains('.') {
        text.parse::<f64>().ok().map(Literal::Float)
    } else {
        text.parse::<i64>().ok().map(Literal::Int)
    };
    parsed
        .map(|lit| (rest, lit))
        .ok_or_else(|| nom::Err::Error(NomError::new(input, ErrorKind::MapRes)))
}

/// Parse unquoted words such as `orders` or `public.users`
fn bare_word(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| is_ident_char(c) || matches!(c, '-' | '/' | '.' | ':')),
        |s: &str| s.to_string(),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cmp(attribute: &str, op: CompareOp, value: Literal) -> Condition {
        Condition::Compare {
            attribute: attribute.to_string(),
            op,
            value,
        }
    }

    #[test]
    fn test_parse_simple_comparison() {
        assert_eq!(
            parse_condition("duration_ms > 1000").unwrap(),
            cmp("duration_ms", CompareOp::Gt, Literal::Int(1000))
        );
        assert_eq!(
            parse_condition("db.name = orders").unwrap(),
            cmp("db.name", CompareOp::Eq, Literal::Str("orders".to_string()))
        );
        assert_eq!(
            parse_condition("ratio >= 0.75").unwrap(),
            cmp("ratio", CompareOp::Gte, Literal::Float(0.75))
        );
    }

    #[test]
    fn test_parse_quoted_values() {
        assert_eq!(
            parse_condition(r#"db.statement contains "SELECT \"x\"""#).unwrap(),
            cmp(
                "db.statement",
                CompareOp::Contains,
                Literal::Str("SELECT \"x\"".to_string())
            )
        );
        assert_eq!(
            parse_condition("db.user == 'app'").unwrap(),
            cmp("db.user", CompareOp::Eq, Literal::Str("app".to_string()))
        );
    }

    #[test]
    fn test_parse_logical_precedence() {
        let cond = parse_condition("a = 1 || b = 2 && c = 3").unwrap();
        match cond {
            Condition::Logical { op, right, .. } => {
                assert_eq!(op, LogicalOp::Or);
                assert!(matches!(*right, Condition::Logical { op: LogicalOp::And, .. }));
            },
            other => panic!("Expected logical condition, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_keywords_and_negation() {
        let cond = parse_condition("not exists(error) and (x < 5 or y != true)").unwrap();
        match cond {
            Condition::Logical { op, left, .. } => {
                assert_eq!(op, LogicalOp::And);
                assert_eq!(
                    *left,
                    Condition::Not(Box::new(Condition::Exists("error".to_string())))
                );
            },
            other => panic!("Expected logical condition, got {other:?}"),
        }
        assert!(parse_condition("!error == true").is_ok());
    }

    #[test]
    fn test_attribute_starting_with_keyword() {
        assert_eq!(
            parse_condition("order_count > 3").unwrap(),
            cmp("order_count", CompareOp::Gt, Literal::Int(3))
        );
        assert_eq!(
            parse_condition("android = yes").unwrap(),
            cmp("android", CompareOp::Eq, Literal::Str("yes".to_string()))
        );
    }

    #[test]
    fn test_regex_compiled_once() {
        match parse_condition(r#"db.statement =~ "^(VACUUM|ANALYZE)""#).unwrap() {
            Condition::Compare {
                value: Literal::Pattern(p),
                ..
            } => assert!(p.0.is_match("VACUUM users")),
            other => panic!("Expected regex comparison, got {other:?}"),
        }
        assert!(parse_condition(r#"x =~ "(unclosed""#).is_err());
    }

    #[test]
    fn test_parse_errors_report_offset() {
        match parse_condition("duration_ms >") {
            Err(GuardError::Expression { offset, .. }) => assert_eq!(offset, 13),
            other => panic!("Expected expression error, got {other:?}"),
        }
        assert!(parse_condition("a = 1 b").is_err());
        assert!(parse_condition("(a = 1").is_err());
    }

    #[test]
    fn test_empty_condition_matches_all() {
        assert_eq!(parse_condition("   ").unwrap(), Condition::Always);
    }
}

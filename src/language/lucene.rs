//! Lucene sub-query parser
//!
//! Parses the subset of Lucene syntax accepted inside `lucene("...")`.
//!
//! # Supported Syntax
//!
//! ```text
//! query   := and (("OR" | <juxtaposition>) and)*
//! and     := unary ("AND" unary)*
//! unary   := ("NOT" | "-") unary | "(" query ")" | clause
//! clause  := field ":" (term | "quoted term" | "[" lo " TO " hi ("]" | "}"))
//! ```
//!
//! # Examples
//!
//! ```text
//! country:us
//! country:us AND NOT q:"software engineer"
//! clicks:[1 TO 10} OR (country:gb country:ie)
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{map, value},
    multi::many0,
    sequence::{delimited, preceded, tuple},
    IResult,
};

use super::actions::{BooleanOp, DocQuery, QueryTerm};
use super::error::{CompileError, CompileResult};

/// Unresolved Lucene query; field names are still logical
#[derive(Debug, Clone, PartialEq)]
pub enum LuceneQuery {
    Term {
        field: String,
        value: String,
    },
    Range {
        field: String,
        lower: String,
        upper: String,
        is_upper_inclusive: bool,
    },
    And(Vec<LuceneQuery>),
    Or(Vec<LuceneQuery>),
    Not(Box<LuceneQuery>),
}

/// Parse a Lucene query string
pub fn parse_lucene(input: &str) -> CompileResult<LuceneQuery> {
    let input = input.trim();

    match parse_or(input) {
        Ok((remaining, query)) => {
            if remaining.trim().is_empty() {
                Ok(query)
            } else {
                Err(CompileError::Parse(format!(
                    "Unexpected input after lucene query: '{}'",
                    remaining.trim()
                )))
            }
        }
        Err(e) => Err(CompileError::Parse(format!(
            "Invalid lucene query '{}': {:?}",
            input, e
        ))),
    }
}

impl LuceneQuery {
    /// Logical field names referenced
    pub fn fields(&self) -> Vec<&str> {
        match self {
            LuceneQuery::Term { field, .. } | LuceneQuery::Range { field, .. } => vec![field.as_str()],
            LuceneQuery::And(qs) | LuceneQuery::Or(qs) => qs.iter().flat_map(|q| q.fields()).collect(),
            LuceneQuery::Not(q) => q.fields(),
        }
    }

    /// Resolve against one dataset. `resolve` maps a logical field to its
    /// physical name and whether it is an integer field.
    pub fn to_doc_query(
        &self,
        resolve: &dyn Fn(&str) -> CompileResult<(String, bool)>,
    ) -> CompileResult<DocQuery> {
        match self {
            LuceneQuery::Term { field, value } => {
                let (name, is_int) = resolve(field)?;
                let term = if is_int {
                    QueryTerm::int(&name, parse_int(value, &name)?)
                } else {
                    QueryTerm::string(&name, value)
                };
                Ok(DocQuery::term(term))
            }
            LuceneQuery::Range {
                field,
                lower,
                upper,
                is_upper_inclusive,
            } => {
                let (name, is_int) = resolve(field)?;
                if is_int {
                    Ok(DocQuery::int_range(
                        &name,
                        parse_int(lower, &name)?,
                        parse_int(upper, &name)?,
                        *is_upper_inclusive,
                    ))
                } else {
                    Ok(DocQuery::Range {
                        start_term: QueryTerm::string(&name, lower),
                        end_term: QueryTerm::string(&name, upper),
                        is_max_inclusive: *is_upper_inclusive,
                    })
                }
            }
            LuceneQuery::And(qs) => Ok(DocQuery::boolean(
                BooleanOp::And,
                qs.iter()
                    .map(|q| q.to_doc_query(resolve))
                    .collect::<CompileResult<_>>()?,
            )),
            LuceneQuery::Or(qs) => Ok(DocQuery::boolean(
                BooleanOp::Or,
                qs.iter()
                    .map(|q| q.to_doc_query(resolve))
                    .collect::<CompileResult<_>>()?,
            )),
            LuceneQuery::Not(q) => Ok(DocQuery::boolean(
                BooleanOp::Not,
                vec![q.to_doc_query(resolve)?],
            )),
        }
    }
}

fn parse_int(value: &str, field: &str) -> CompileResult<i64> {
    value.parse().map_err(|_| {
        CompileError::Invalid(format!(
            "A non integer value '{}' specified for an integer field: {}",
            value, field
        ))
    })
}

fn parse_or(input: &str) -> IResult<&str, LuceneQuery> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(
        alt((
            value((), delimited(multispace1, tag_no_case("OR"), multispace1)),
            value((), multispace1),
        )),
        parse_and,
    ))(input)?;
    Ok((input, combine(first, rest, LuceneQuery::Or)))
}

fn parse_and(input: &str) -> IResult<&str, LuceneQuery> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(preceded(
        delimited(multispace1, tag_no_case("AND"), multispace1),
        parse_unary,
    ))(input)?;
    Ok((input, combine(first, rest, LuceneQuery::And)))
}

fn combine(
    first: LuceneQuery,
    rest: Vec<LuceneQuery>,
    make: fn(Vec<LuceneQuery>) -> LuceneQuery,
) -> LuceneQuery {
    if rest.is_empty() {
        first
    } else {
        let mut all = vec![first];
        all.extend(rest);
        make(all)
    }
}

fn parse_unary(input: &str) -> IResult<&str, LuceneQuery> {
    alt((
        map(
            preceded(tuple((tag_no_case("NOT"), multispace1)), parse_unary),
            |q| LuceneQuery::Not(Box::new(q)),
        ),
        map(preceded(char('-'), parse_unary), |q| {
            LuceneQuery::Not(Box::new(q))
        }),
        delimited(
            tuple((char('('), multispace0)),
            parse_or,
            tuple((multispace0, char(')'))),
        ),
        parse_clause,
    ))(input)
}

fn parse_clause(input: &str) -> IResult<&str, LuceneQuery> {
    let (input, field) = parse_field(input)?;
    let (input, _) = char(':')(input)?;
    alt((
        map(parse_range, |(lower, upper, is_upper_inclusive)| {
            LuceneQuery::Range {
                field: field.to_string(),
                lower,
                upper,
                is_upper_inclusive,
            }
        }),
        map(alt((parse_quoted, parse_bare)), |value| LuceneQuery::Term {
            field: field.to_string(),
            value,
        }),
    ))(input)
}

fn parse_field(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.')(input)
}

fn parse_quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_bare(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| !c.is_whitespace() && c != '(' && c != ')' && c != '"'),
        |s: &str| s.to_string(),
    )(input)
}

fn parse_range(input: &str) -> IResult<&str, (String, String, bool)> {
    let (input, _) = char('[')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, lower) = parse_bound(input)?;
    let (input, _) = delimited(multispace1, tag("TO"), multispace1)(input)?;
    let (input, upper) = parse_bound(input)?;
    let (input, _) = multispace0(input)?;
    let (input, inclusive) = alt((value(true, char(']')), value(false, char('}'))))(input)?;
    Ok((input, (lower, upper, inclusive)))
}

fn parse_bound(input: &str) -> IResult<&str, String> {
    alt((
        parse_quoted,
        map(
            take_while1(|c: char| !c.is_whitespace() && c != ']' && c != '}'),
            |s: &str| s.to_string(),
        ),
    ))(input)
}

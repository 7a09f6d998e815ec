//! Query Parser
//!
//! Parses JQL text into a [`QueryAst`].
//!
//! # Supported Syntax
//!
//! ```text
//! FROM ds [start end] [AS alias] [ALIASING (actual AS virtual, ...)] (, ds ...)*
//! [WHERE docfilter]
//! [GROUP BY groupby [HAVING aggfilter] (, groupby ...)*]
//! [SELECT aggmetric [AS name] (, aggmetric ...)*]
//! [LIMIT n]
//! ```
//!
//! # Examples
//!
//! ```text
//! FROM jobsearch 2024-01-01 2024-01-02 SELECT count()
//! FROM jobsearch 7d today WHERE country IN (us, gb) GROUP BY q[10 BY clicks]
//! FROM a, b WHERE a.(clicks > 5) SELECT distinct(country), clicks / count()
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1, take_while_m_n},
    character::complete::{alpha1, char, digit1, multispace0, one_of, satisfy},
    combinator::{map, map_res, not, opt, peek, recognize, value, verify},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::language::{CompareOp, MathOp};
use crate::query::ast::*;
use crate::query::error::{QueryError, QueryResult};
use crate::term::Term;

type PResult<'a, T> = IResult<&'a str, T>;

const KEYWORDS: &[&str] = &[
    "FROM", "WHERE", "GROUP", "BY", "SELECT", "LIMIT", "AND", "OR", "NOT", "IN", "AS", "HAVING",
    "WITH", "DEFAULT", "IF", "THEN", "ELSE", "ALIASING", "TOP", "BOTTOM",
];

/// Parse a query string into a Query AST
pub fn parse_query(input: &str) -> QueryResult<QueryAst> {
    complete(input, parse_full_query)
}

/// Parse a standalone doc metric, as used by dimension definitions
pub fn parse_doc_metric(input: &str) -> QueryResult<DocMetricAst> {
    complete(input, doc_metric)
}

/// Parse a standalone doc filter
pub fn parse_doc_filter(input: &str) -> QueryResult<DocFilterAst> {
    complete(input, doc_filter)
}

fn complete<'a, T>(
    source: &'a str,
    mut parser: impl FnMut(&'a str) -> PResult<'a, T>,
) -> QueryResult<T> {
    match parser(source) {
        Ok((remaining, parsed)) => {
            let rest = remaining.trim_start();
            if rest.is_empty() {
                Ok(parsed)
            } else {
                Err(QueryError::at(
                    source,
                    source.len() - rest.len(),
                    format!("Unexpected input: '{}'", snippet(rest)),
                ))
            }
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let rest = e.input.trim_start();
            let message = if rest.is_empty() {
                "Unexpected end of query".to_string()
            } else {
                format!("Unexpected input: '{}'", snippet(rest))
            };
            Err(QueryError::at(source, source.len() - rest.len(), message))
        }
        Err(nom::Err::Incomplete(_)) => Err(QueryError::at(
            source,
            source.len(),
            "Unexpected end of query",
        )),
    }
}

fn snippet(rest: &str) -> String {
    rest.lines().next().unwrap_or("").chars().take(30).collect()
}

/// Parse the full query
fn parse_full_query(input: &str) -> PResult<'_, QueryAst> {
    let (input, _) = keyword("FROM")(input)?;
    let (input, datasets) = separated_list1(symbol(","), parse_dataset)(input)?;
    let (input, filter) = opt(preceded(keyword("WHERE"), doc_filter))(input)?;
    let (input, group_bys) = opt(preceded(
        pair(keyword("GROUP"), keyword("BY")),
        separated_list1(symbol(","), parse_group_by_entry),
    ))(input)?;
    let (input, selects) = opt(preceded(
        keyword("SELECT"),
        separated_list1(symbol(","), parse_select_item),
    ))(input)?;
    let (input, limit) = opt(preceded(keyword("LIMIT"), unsigned))(input)?;
    let (input, _) = multispace0(input)?;

    Ok((
        input,
        QueryAst {
            datasets,
            filter,
            group_bys: group_bys.unwrap_or_default(),
            selects: selects.unwrap_or_default(),
            limit,
        },
    ))
}

/// Parse one `FROM` entry
fn parse_dataset(input: &str) -> PResult<'_, DatasetAst> {
    let (input, name) = identifier(input)?;
    let (input, range) = opt(pair(time_point, time_point))(input)?;
    let (input, alias) = opt(preceded(keyword("AS"), identifier))(input)?;
    let (input, field_aliases) = opt(preceded(
        keyword("ALIASING"),
        delimited(
            symbol("("),
            separated_list1(symbol(","), pair(identifier, preceded(keyword("AS"), identifier))),
            symbol(")"),
        ),
    ))(input)?;

    let (start, end) = match range {
        Some((start, end)) => (Some(start), Some(end)),
        None => (None, None),
    };
    Ok((
        input,
        DatasetAst {
            name,
            start,
            end,
            alias,
            field_aliases: field_aliases.unwrap_or_default(),
        },
    ))
}

/// Parse a time bound like `2024-01-01`, `7d`, `today` or a quoted timestamp
fn time_point(input: &str) -> PResult<'_, TimeAst> {
    preceded(
        multispace0,
        alt((
            map(
                recognize(tuple((
                    take_while_m_n(4, 4, |c: char| c.is_ascii_digit()),
                    char('-'),
                    take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
                    char('-'),
                    take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
                    opt(pair(char('T'), take_while1(|c: char| c.is_ascii_digit() || c == ':'))),
                ))),
                |s: &str| TimeAst::Absolute(s.to_string()),
            ),
            map(string_literal, TimeAst::Absolute),
            map(
                terminated(
                    pair(map_res(digit1, |s: &str| s.parse::<i64>()), one_of("smhdwMy")),
                    pair(not(satisfy(is_ident_char)), opt(keyword("ago"))),
                ),
                |(amount, unit)| TimeAst::Ago { amount, unit },
            ),
            value(TimeAst::Now, keyword("now")),
            value(TimeAst::Today, keyword("today")),
            value(TimeAst::Yesterday, keyword("yesterday")),
        )),
    )(input)
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Case-insensitive word that is not the prefix of a longer identifier
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, ()> {
    move |input| {
        let (input, _) = multispace0(input)?;
        let (input, _) = tag_no_case(word)(input)?;
        let (input, _) = not(satisfy(is_ident_char))(input)?;
        Ok((input, ()))
    }
}

fn symbol<'a>(text: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(multispace0, tag(text))
}

/// `name(`
fn call<'a>(name: &'static str) -> impl FnMut(&'a str) -> PResult<'a, ()> {
    move |input| {
        let (input, _) = multispace0(input)?;
        let (input, _) = tag_no_case(name)(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = char('(')(input)?;
        Ok((input, ()))
    }
}

fn raw_identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

/// Plain or back-quoted identifier
fn identifier(input: &str) -> PResult<'_, String> {
    preceded(
        multispace0,
        alt((
            map(
                delimited(char('`'), take_while1(|c: char| c != '`'), char('`')),
                |s: &str| s.to_string(),
            ),
            map(verify(raw_identifier, |s: &str| !is_keyword(s)), |s: &str| {
                s.to_string()
            }),
        )),
    )(input)
}

/// `field` or `dataset.field`
fn scoped_name(input: &str) -> PResult<'_, ScopedName> {
    let (input, first) = identifier(input)?;
    let (input, second) = opt(preceded(char('.'), identifier))(input)?;
    Ok((
        input,
        match second {
            Some(field) => ScopedName::scoped(first, field),
            None => ScopedName::plain(first),
        },
    ))
}

fn integer(input: &str) -> PResult<'_, i64> {
    preceded(
        multispace0,
        map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
            s.parse::<i64>()
        }),
    )(input)
}

fn unsigned(input: &str) -> PResult<'_, u64> {
    preceded(multispace0, map_res(digit1, |s: &str| s.parse::<u64>()))(input)
}

fn small(input: &str) -> PResult<'_, u32> {
    preceded(multispace0, map_res(digit1, |s: &str| s.parse::<u32>()))(input)
}

fn count_arg(input: &str) -> PResult<'_, usize> {
    preceded(multispace0, map_res(digit1, |s: &str| s.parse::<usize>()))(input)
}

fn decimal(input: &str) -> PResult<'_, f64> {
    preceded(
        multispace0,
        map_res(
            terminated(
                recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
                not(satisfy(is_ident_char)),
            ),
            |s: &str| s.parse::<f64>(),
        ),
    )(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> PResult<'a, String> {
    move |input| {
        let (body, _) = char(quote)(input)?;
        let mut out = String::new();
        let mut chars = body.char_indices();
        while let Some((i, c)) = chars.next() {
            if c == quote {
                return Ok((&body[i + c.len_utf8()..], out));
            }
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                }
            } else {
                out.push(c);
            }
        }
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        )))
    }
}

/// Double- or single-quoted string with backslash escapes
fn string_literal(input: &str) -> PResult<'_, String> {
    preceded(multispace0, alt((quoted('"'), quoted('\''))))(input)
}

/// A term: quoted strings stay strings, bare words and numbers may be ints
fn term_literal(input: &str) -> PResult<'_, Term> {
    preceded(
        multispace0,
        alt((
            map(string_literal, Term::string),
            map(
                verify(
                    take_while1(|c: char| is_ident_char(c) || c == '.' || c == '-'),
                    |s: &str| !is_keyword(s),
                ),
                Term::term,
            ),
        )),
    )(input)
}

fn term_list(input: &str) -> PResult<'_, Vec<Term>> {
    delimited(
        symbol("("),
        separated_list0(symbol(","), term_literal),
        symbol(")"),
    )(input)
}

fn compare_op(input: &str) -> PResult<'_, CompareOp> {
    preceded(
        multispace0,
        alt((
            value(CompareOp::Lte, tag("<=")),
            value(CompareOp::Ne, tag("<>")),
            value(CompareOp::Gte, tag(">=")),
            value(CompareOp::Ne, tag("!=")),
            value(CompareOp::Eq, tag("==")),
            value(CompareOp::Eq, tag("=")),
            value(CompareOp::Lt, tag("<")),
            value(CompareOp::Gt, tag(">")),
        )),
    )(input)
}

fn combine<T>(first: T, rest: Vec<T>, make: fn(Vec<T>) -> T) -> T {
    if rest.is_empty() {
        first
    } else {
        let mut all = vec![first];
        all.extend(rest);
        make(all)
    }
}

fn with_default(input: &str) -> PResult<'_, bool> {
    map(opt(pair(keyword("WITH"), keyword("DEFAULT"))), |d| {
        d.is_some()
    })(input)
}

// ---------------------------------------------------------------------------
// Doc filters
// ---------------------------------------------------------------------------

fn doc_filter(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, first) = filter_and(input)?;
    let (input, rest) = many0(preceded(keyword("OR"), filter_and))(input)?;
    Ok((input, combine(first, rest, DocFilterAst::Or)))
}

fn filter_and(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, first) = filter_unary(input)?;
    let (input, rest) = many0(preceded(keyword("AND"), filter_unary))(input)?;
    Ok((input, combine(first, rest, DocFilterAst::And)))
}

fn filter_unary(input: &str) -> PResult<'_, DocFilterAst> {
    alt((
        map(
            preceded(alt((keyword("NOT"), value((), symbol("!")))), filter_unary),
            |f| DocFilterAst::Not(Box::new(f)),
        ),
        filter_primary,
    ))(input)
}

fn filter_primary(input: &str) -> PResult<'_, DocFilterAst> {
    alt((
        delimited(symbol("("), doc_filter, symbol(")")),
        value(DocFilterAst::Bool(true), keyword("true")),
        value(DocFilterAst::Bool(false), keyword("false")),
        map(
            delimited(call("lucene"), string_literal, symbol(")")),
            DocFilterAst::Lucene,
        ),
        sample_filter,
        between_filter,
        qualified_filter,
        field_filter,
        metric_comparison,
    ))(input)
}

fn sample_filter(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, _) = call("sample")(input)?;
    let (input, field) = scoped_name(input)?;
    let (input, numerator) = preceded(symbol(","), unsigned)(input)?;
    let (input, denominator) = opt(preceded(symbol(","), unsigned))(input)?;
    let (input, seed) = opt(preceded(symbol(","), string_literal))(input)?;
    let (input, _) = symbol(")")(input)?;
    Ok((
        input,
        DocFilterAst::Sample {
            field,
            numerator,
            denominator,
            seed,
        },
    ))
}

fn between_filter(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, (_, field, _, lower, _, upper, _)) = tuple((
        call("between"),
        scoped_name,
        symbol(","),
        integer,
        symbol(","),
        integer,
        symbol(")"),
    ))(input)?;
    Ok((input, DocFilterAst::Between { field, lower, upper }))
}

/// `ds.(filter)`
fn qualified_filter(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, dataset) = identifier(input)?;
    let (input, _) = char('.')(input)?;
    let (input, filter) = delimited(symbol("("), doc_filter, symbol(")"))(input)?;
    Ok((
        input,
        DocFilterAst::Qualified {
            datasets: vec![dataset],
            filter: Box::new(filter),
        },
    ))
}

#[derive(Clone, Copy)]
enum FieldOp {
    Regex(bool),
    In(bool),
    Is(bool),
}

/// `f = term`, `f != term`, `f =~ "re"`, `f !=~ "re"`, `f [NOT] IN (...)`
fn field_filter(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, field) = scoped_name(input)?;
    let (input, op) = alt((
        value(FieldOp::Regex(true), symbol("!=~")),
        value(FieldOp::Regex(false), symbol("=~")),
        value(FieldOp::In(true), pair(keyword("NOT"), keyword("IN"))),
        value(FieldOp::In(false), keyword("IN")),
        value(FieldOp::Is(true), symbol("!=")),
        value(FieldOp::Is(false), alt((symbol("=="), symbol("="), symbol(":")))),
    ))(input)?;
    match op {
        FieldOp::Regex(negated) => {
            let (input, pattern) = string_literal(input)?;
            Ok((
                input,
                DocFilterAst::Regex {
                    field,
                    pattern,
                    negated,
                },
            ))
        }
        FieldOp::In(negated) => {
            let (input, terms) = term_list(input)?;
            Ok((
                input,
                DocFilterAst::FieldIn {
                    field,
                    terms,
                    negated,
                },
            ))
        }
        FieldOp::Is(negated) => {
            // `clicks = 5 + 1` is a metric comparison
            let (input, term) = terminated(
                term_literal,
                not(peek(preceded(multispace0, one_of("+-*/%<>=")))),
            )(input)?;
            Ok((
                input,
                DocFilterAst::FieldIs {
                    field,
                    term,
                    negated,
                },
            ))
        }
    }
}

fn metric_comparison(input: &str) -> PResult<'_, DocFilterAst> {
    let (input, (left, op, right)) = tuple((doc_metric, compare_op, doc_metric))(input)?;
    Ok((input, DocFilterAst::Compare { op, left, right }))
}

// ---------------------------------------------------------------------------
// Doc metrics
// ---------------------------------------------------------------------------

fn doc_metric(input: &str) -> PResult<'_, DocMetricAst> {
    let (input, first) = doc_multiplicative(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, one_of("+-")), doc_multiplicative))(input)?;
    Ok((input, fold_doc(first, rest)))
}

fn doc_multiplicative(input: &str) -> PResult<'_, DocMetricAst> {
    let (input, first) = doc_unary(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, one_of("*/%")), doc_unary))(input)?;
    Ok((input, fold_doc(first, rest)))
}

fn fold_doc(first: DocMetricAst, rest: Vec<(char, DocMetricAst)>) -> DocMetricAst {
    rest.into_iter().fold(first, |left, (op, right)| {
        let op = match op {
            '+' => ArithAst::Add,
            '-' => ArithAst::Subtract,
            '*' => ArithAst::Multiply,
            '/' => ArithAst::Divide,
            _ => ArithAst::Modulus,
        };
        DocMetricAst::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    })
}

fn doc_unary(input: &str) -> PResult<'_, DocMetricAst> {
    alt((
        map(preceded(symbol("-"), doc_unary), |m| match m {
            DocMetricAst::Int(n) => DocMetricAst::Int(-n),
            other => DocMetricAst::Negate(Box::new(other)),
        }),
        doc_atom,
    ))(input)
}

fn doc_atom(input: &str) -> PResult<'_, DocMetricAst> {
    alt((
        delimited(symbol("("), doc_metric, symbol(")")),
        map(
            preceded(
                multispace0,
                terminated(
                    map_res(digit1, |s: &str| s.parse::<i64>()),
                    not(satisfy(is_ident_char)),
                ),
            ),
            DocMetricAst::Int,
        ),
        doc_function,
        doc_if_then_else,
        map(scoped_name, DocMetricAst::Name),
    ))(input)
}

fn doc_if_then_else(input: &str) -> PResult<'_, DocMetricAst> {
    let (input, (_, condition, _, then, _, otherwise)) = tuple((
        keyword("IF"),
        doc_filter,
        keyword("THEN"),
        doc_metric,
        keyword("ELSE"),
        doc_metric,
    ))(input)?;
    Ok((
        input,
        DocMetricAst::IfThenElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        },
    ))
}

/// `name(field)`
fn field_call<'a>(name: &'static str) -> impl FnMut(&'a str) -> PResult<'a, ScopedName> {
    delimited(call(name), scoped_name, symbol(")"))
}

fn doc_function(input: &str) -> PResult<'_, DocMetricAst> {
    alt((
        value(DocMetricAst::Count, pair(call("count"), symbol(")"))),
        value(DocMetricAst::DocId, pair(call("docid"), symbol(")"))),
        map(delimited(call("abs"), doc_metric, symbol(")")), |m| {
            DocMetricAst::Abs(Box::new(m))
        }),
        map(delimited(call("signum"), doc_metric, symbol(")")), |m| {
            DocMetricAst::Signum(Box::new(m))
        }),
        map(
            tuple((call("log"), doc_metric, opt(preceded(symbol(","), integer)), symbol(")"))),
            |(_, m, scale, _)| DocMetricAst::Log {
                metric: Box::new(m),
                scale_factor: scale.unwrap_or(1) as i32,
            },
        ),
        map(
            tuple((call("exp"), doc_metric, opt(preceded(symbol(","), integer)), symbol(")"))),
            |(_, m, scale, _)| DocMetricAst::Exp {
                metric: Box::new(m),
                scale_factor: scale.unwrap_or(1) as i32,
            },
        ),
        map(
            delimited(call("min"), separated_list1(symbol(","), doc_metric), symbol(")")),
            DocMetricAst::Min,
        ),
        map(
            delimited(call("max"), separated_list1(symbol(","), doc_metric), symbol(")")),
            DocMetricAst::Max,
        ),
        map(
            tuple((call("hasint"), scoped_name, symbol(","), integer, symbol(")"))),
            |(_, field, _, term, _)| DocMetricAst::HasInt { field, term },
        ),
        map(
            tuple((call("hasstr"), scoped_name, symbol(","), term_literal, symbol(")"))),
            |(_, field, _, term, _)| DocMetricAst::HasStr {
                field,
                term: term.as_string(),
            },
        ),
        map(field_call("hasintfield"), DocMetricAst::HasIntField),
        map(field_call("hasstrfield"), DocMetricAst::HasStrField),
        map(field_call("len"), DocMetricAst::Len),
        map(field_call("inttermcount"), DocMetricAst::IntTermCount),
        map(field_call("strtermcount"), DocMetricAst::StrTermCount),
        map(
            tuple((
                call("floatscale"),
                scoped_name,
                opt(preceded(symbol(","), decimal)),
                opt(preceded(symbol(","), decimal)),
                symbol(")"),
            )),
            |(_, field, mult, add, _)| DocMetricAst::FloatScale {
                field,
                mult: mult.unwrap_or(1.0),
                add: add.unwrap_or(0.0),
            },
        ),
        map(
            tuple((
                call("extract"),
                scoped_name,
                symbol(","),
                string_literal,
                opt(preceded(symbol(","), small)),
                symbol(")"),
            )),
            |(_, field, _, pattern, group, _)| DocMetricAst::Extract {
                field,
                pattern,
                group_number: group.unwrap_or(1),
            },
        ),
    ))(input)
}

// ---------------------------------------------------------------------------
// Aggregate metrics and filters
// ---------------------------------------------------------------------------

fn agg_metric(input: &str) -> PResult<'_, AggMetricAst> {
    let (input, first) = agg_multiplicative(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, one_of("+-")), agg_multiplicative))(input)?;
    Ok((input, fold_agg(first, rest)))
}

fn agg_multiplicative(input: &str) -> PResult<'_, AggMetricAst> {
    let (input, first) = agg_power(input)?;
    let (input, rest) = many0(pair(preceded(multispace0, one_of("*/%")), agg_power))(input)?;
    Ok((input, fold_agg(first, rest)))
}

fn agg_power(input: &str) -> PResult<'_, AggMetricAst> {
    let (input, base) = agg_unary(input)?;
    let (input, exponent) = opt(preceded(symbol("^"), agg_power))(input)?;
    Ok((
        input,
        match exponent {
            Some(exponent) => AggMetricAst::Binary {
                op: MathOp::Power,
                left: Box::new(base),
                right: Box::new(exponent),
            },
            None => base,
        },
    ))
}

fn fold_agg(first: AggMetricAst, rest: Vec<(char, AggMetricAst)>) -> AggMetricAst {
    rest.into_iter().fold(first, |left, (op, right)| {
        let op = match op {
            '+' => MathOp::Add,
            '-' => MathOp::Subtract,
            '*' => MathOp::Multiply,
            '/' => MathOp::Divide,
            _ => MathOp::Modulus,
        };
        AggMetricAst::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    })
}

fn agg_unary(input: &str) -> PResult<'_, AggMetricAst> {
    alt((
        map(preceded(symbol("-"), agg_unary), |m| match m {
            AggMetricAst::Number(n) => AggMetricAst::Number(-n),
            other => AggMetricAst::Negate(Box::new(other)),
        }),
        agg_atom,
    ))(input)
}

fn agg_atom(input: &str) -> PResult<'_, AggMetricAst> {
    alt((
        delimited(symbol("("), agg_metric, symbol(")")),
        map(decimal, AggMetricAst::Number),
        map(delimited(symbol("["), doc_metric, symbol("]")), AggMetricAst::DocSum),
        agg_function,
        agg_window_function,
        agg_if_then_else,
        agg_qualified,
        map(doc_function, AggMetricAst::DocSum),
        map(scoped_name, AggMetricAst::Name),
    ))(input)
}

fn boxed_call<'a>(name: &'static str) -> impl FnMut(&'a str) -> PResult<'a, Box<AggMetricAst>> {
    map(delimited(call(name), agg_metric, symbol(")")), Box::new)
}

fn agg_function(input: &str) -> PResult<'_, AggMetricAst> {
    alt((
        map(
            tuple((
                call("distinct"),
                scoped_name,
                opt(preceded(keyword("HAVING"), agg_filter)),
                symbol(")"),
            )),
            |(_, field, having, _)| AggMetricAst::Distinct {
                field,
                having: having.map(Box::new),
                window: None,
            },
        ),
        map(
            tuple((
                call("distinct_window"),
                count_arg,
                symbol(","),
                scoped_name,
                opt(preceded(keyword("HAVING"), agg_filter)),
                symbol(")"),
            )),
            |(_, window, _, field, having, _)| AggMetricAst::Distinct {
                field,
                having: having.map(Box::new),
                window: Some(window),
            },
        ),
        map(
            tuple((call("percentile"), scoped_name, symbol(","), decimal, symbol(")"))),
            |(_, field, _, percentile, _)| AggMetricAst::Percentile { field, percentile },
        ),
        map(
            tuple((
                call("field_min"),
                scoped_name,
                opt(preceded(symbol(","), agg_metric)),
                symbol(")"),
            )),
            |(_, field, metric, _)| AggMetricAst::FieldMin {
                field,
                metric: metric.map(Box::new),
            },
        ),
        map(
            tuple((
                call("field_max"),
                scoped_name,
                opt(preceded(symbol(","), agg_metric)),
                symbol(")"),
            )),
            |(_, field, metric, _)| AggMetricAst::FieldMax {
                field,
                metric: metric.map(Box::new),
            },
        ),
        map(boxed_call("parent"), AggMetricAst::Parent),
        map(boxed_call("running"), AggMetricAst::Running),
        map(boxed_call("avg"), AggMetricAst::Avg),
        map(boxed_call("abs"), AggMetricAst::Abs),
        map(boxed_call("log"), AggMetricAst::Log),
        map(boxed_call("floor"), AggMetricAst::Floor),
        map(boxed_call("ceil"), AggMetricAst::Ceil),
        map(boxed_call("round"), AggMetricAst::Round),
        map(
            delimited(call("min"), separated_list1(symbol(","), agg_metric), symbol(")")),
            AggMetricAst::Min,
        ),
        map(
            delimited(call("max"), separated_list1(symbol(","), agg_metric), symbol(")")),
            AggMetricAst::Max,
        ),
    ))(input)
}

fn agg_window_function(input: &str) -> PResult<'_, AggMetricAst> {
    alt((
        map(
            tuple((call("lag"), count_arg, symbol(","), agg_metric, symbol(")"))),
            |(_, lag, _, metric, _)| AggMetricAst::Lag {
                lag,
                metric: Box::new(metric),
            },
        ),
        map(
            tuple((call("window"), count_arg, symbol(","), agg_metric, symbol(")"))),
            |(_, window, _, metric, _)| AggMetricAst::Window {
                window,
                metric: Box::new(metric),
            },
        ),
        map(
            tuple((call("sum_across"), parse_group_by, symbol(","), agg_metric, symbol(")"))),
            |(_, group_by, _, metric, _)| AggMetricAst::SumAcross {
                group_by: Box::new(group_by),
                metric: Box::new(metric),
            },
        ),
    ))(input)
}

fn agg_if_then_else(input: &str) -> PResult<'_, AggMetricAst> {
    let (input, (_, condition, _, then, _, otherwise)) = tuple((
        keyword("IF"),
        agg_filter,
        keyword("THEN"),
        agg_metric,
        keyword("ELSE"),
        agg_metric,
    ))(input)?;
    Ok((
        input,
        AggMetricAst::IfThenElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        },
    ))
}

/// `ds.(metric)`
fn agg_qualified(input: &str) -> PResult<'_, AggMetricAst> {
    let (input, dataset) = identifier(input)?;
    let (input, _) = char('.')(input)?;
    let (input, metric) = delimited(symbol("("), agg_metric, symbol(")"))(input)?;
    Ok((
        input,
        AggMetricAst::Qualified {
            datasets: vec![dataset],
            metric: Box::new(metric),
        },
    ))
}

fn agg_filter(input: &str) -> PResult<'_, AggFilterAst> {
    let (input, first) = agg_filter_and(input)?;
    let (input, rest) = many0(preceded(keyword("OR"), agg_filter_and))(input)?;
    Ok((input, combine(first, rest, AggFilterAst::Or)))
}

fn agg_filter_and(input: &str) -> PResult<'_, AggFilterAst> {
    let (input, first) = agg_filter_unary(input)?;
    let (input, rest) = many0(preceded(keyword("AND"), agg_filter_unary))(input)?;
    Ok((input, combine(first, rest, AggFilterAst::And)))
}

fn agg_filter_unary(input: &str) -> PResult<'_, AggFilterAst> {
    alt((
        map(
            preceded(alt((keyword("NOT"), value((), symbol("!")))), agg_filter_unary),
            |f| AggFilterAst::Not(Box::new(f)),
        ),
        agg_filter_primary,
    ))(input)
}

fn agg_filter_primary(input: &str) -> PResult<'_, AggFilterAst> {
    alt((
        delimited(symbol("("), agg_filter, symbol(")")),
        value(AggFilterAst::Bool(true), keyword("true")),
        value(AggFilterAst::Bool(false), keyword("false")),
        preceded(
            pair(call("term"), symbol(")")),
            alt((
                map(preceded(symbol("=~"), string_literal), AggFilterAst::TermRegex),
                map(
                    preceded(alt((symbol("=="), symbol("="))), term_literal),
                    AggFilterAst::TermIs,
                ),
            )),
        ),
        map(
            tuple((agg_metric, compare_op, agg_metric)),
            |(left, op, right)| AggFilterAst::Compare { op, left, right },
        ),
    ))(input)
}

// ---------------------------------------------------------------------------
// Group bys and selects
// ---------------------------------------------------------------------------

fn parse_group_by_entry(input: &str) -> PResult<'_, GroupByEntryAst> {
    let (input, group_by) = parse_group_by(input)?;
    let (input, having) = opt(preceded(keyword("HAVING"), agg_filter))(input)?;
    let (input, alias) = opt(preceded(keyword("AS"), identifier))(input)?;
    Ok((
        input,
        GroupByEntryAst {
            group_by,
            having,
            alias,
        },
    ))
}

fn empty_call<'a>(name: &'static str) -> impl FnMut(&'a str) -> PResult<'a, ()> {
    move |input| {
        let (input, _) = keyword(name)(input)?;
        let (input, _) = opt(pair(symbol("("), symbol(")")))(input)?;
        Ok((input, ()))
    }
}

fn parse_group_by(input: &str) -> PResult<'_, GroupByAst> {
    alt((
        bucket_group_by,
        time_group_by,
        map(
            tuple((call("quantiles"), scoped_name, symbol(","), small, symbol(")"))),
            |(_, field, _, num_buckets, _)| GroupByAst::Quantiles { field, num_buckets },
        ),
        map(
            delimited(call("predicate"), doc_filter, symbol(")")),
            GroupByAst::Predicate,
        ),
        map(
            tuple((
                call("random"),
                scoped_name,
                symbol(","),
                small,
                opt(preceded(symbol(","), string_literal)),
                symbol(")"),
            )),
            |(_, field, _, k, salt, _)| GroupByAst::Random { field, k, salt },
        ),
        value(GroupByAst::DayOfWeek, empty_call("dayofweek")),
        value(GroupByAst::Month, empty_call("month")),
        value(GroupByAst::Dataset, empty_call("dataset")),
        field_in_group_by,
        field_group_by,
    ))(input)
}

fn bucket_group_by(input: &str) -> PResult<'_, GroupByAst> {
    let (input, (_, metric, _, min, _, max, _, interval)) = tuple((
        call("bucket"),
        doc_metric,
        symbol(","),
        integer,
        symbol(","),
        integer,
        symbol(","),
        integer,
    ))(input)?;
    let (input, exclude_gutters) =
        map(opt(preceded(symbol(","), keyword("exclude_gutters"))), |g| g.is_some())(input)?;
    let (input, _) = symbol(")")(input)?;
    let (input, with_default) = with_default(input)?;
    Ok((
        input,
        GroupByAst::Bucket {
            metric,
            min,
            max,
            interval,
            exclude_gutters,
            with_default,
        },
    ))
}

fn time_group_by(input: &str) -> PResult<'_, GroupByAst> {
    let (input, _) = call("time")(input)?;
    let (input, period) = preceded(multispace0, recognize(pair(digit1, alpha1)))(input)?;
    let (input, format) = opt(preceded(symbol(","), string_literal))(input)?;
    let (input, field) = opt(preceded(symbol(","), scoped_name))(input)?;
    let (input, _) = symbol(")")(input)?;
    Ok((
        input,
        GroupByAst::Time {
            period: period.to_string(),
            field,
            format,
        },
    ))
}

fn field_in_group_by(input: &str) -> PResult<'_, GroupByAst> {
    let (input, (field, _, terms, with_default)) =
        tuple((scoped_name, keyword("IN"), term_list, with_default))(input)?;
    Ok((
        input,
        GroupByAst::FieldIn {
            field,
            terms,
            with_default,
        },
    ))
}

/// `f`, `f[k]`, `f[TOP k BY m]`, `f[BOTTOM k BY m]`
fn field_group_by(input: &str) -> PResult<'_, GroupByAst> {
    let (input, field) = scoped_name(input)?;
    let (input, top_k) = opt(delimited(
        symbol("["),
        tuple((
            opt(alt((value(false, keyword("TOP")), value(true, keyword("BOTTOM"))))),
            opt(unsigned),
            opt(preceded(keyword("BY"), agg_metric)),
        )),
        symbol("]"),
    ))(input)?;
    let (input, with_default) = with_default(input)?;
    let (limit, metric) = match top_k {
        Some((Some(true), limit, metric)) => {
            let ordering = metric.unwrap_or(AggMetricAst::DocSum(DocMetricAst::Count));
            (limit, Some(AggMetricAst::Negate(Box::new(ordering))))
        }
        Some((_, limit, metric)) => (limit, metric),
        None => (None, None),
    };
    Ok((
        input,
        GroupByAst::Field {
            field,
            limit,
            metric,
            with_default,
        },
    ))
}

fn parse_select_item(input: &str) -> PResult<'_, SelectAst> {
    let (input, (metric, format)) = alt((
        map(
            tuple((call("printf"), agg_metric, symbol(","), string_literal, symbol(")"))),
            |(_, metric, _, format, _)| (metric, Some(format)),
        ),
        map(agg_metric, |metric| (metric, None)),
    ))(input)?;
    let (input, alias) = opt(preceded(keyword("AS"), identifier))(input)?;
    Ok((
        input,
        SelectAst {
            metric,
            alias,
            format,
        },
    ))
}

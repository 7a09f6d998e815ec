//! Query compiler
//!
//! Drives a parsed query through name resolution, the rewrite passes and
//! lowering, ending with a validated command list.
//!
//! ```text
//! text ─parse─▶ QueryAst ─resolve─▶ Query ─passes─▶ ExecutionStep* ─lower─▶ Command*
//!                             │                                          │
//!                        ErrorCollector ◀──────────── validate ──────────┘
//! ```

use chrono::{DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::catalog::DatasetCatalog;
use crate::config::CompileConfig;
use crate::execution::CacheKey;
use crate::fields::{FieldResolver, FieldSet, ScopedFieldResolver};
use crate::language::passes::{
    extract_precomputed, fix_top_k_having, optimize_last, query_steps, simplify, substitute_named,
};
use crate::language::validation::validate_regex;
use crate::language::{
    optimize_consecutive_query_actions, parse_lucene, AggregateFilter, AggregateMetric, ArithOp,
    Command, CompareOp, CompileError, CompileResult, Dataset, DocFilter, DocMetric, ErrorCollector,
    ExecutionStep, GroupBy, GroupByEntry, GroupSupplier, MathOp, Query,
};
use crate::query::ast::*;
use crate::query::error::QueryResult;
use crate::query::parser::{parse_doc_metric, parse_query};

/// Output of a successful compile
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub commands: Vec<Command>,
    pub warnings: Vec<String>,
    pub datasets: Vec<Dataset>,
    pub row_limit: Option<u64>,
    pub cache_key: CacheKey,
}

impl CompiledQuery {
    pub fn commands_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.commands)
    }
}

/// A query resolved against the catalog, before any pass ran
#[derive(Debug, Clone)]
pub struct Planned {
    pub query: Query,
    pub resolver: FieldResolver,
    pub errors: ErrorCollector,
}

/// Compiles query text against one catalog
#[derive(Debug, Clone)]
pub struct Compiler {
    catalog: DatasetCatalog,
    config: CompileConfig,
}

impl Compiler {
    pub fn new(catalog: DatasetCatalog, config: CompileConfig) -> Self {
        Self { catalog, config }
    }

    pub fn catalog(&self) -> &DatasetCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Compile relative to the current time
    pub fn compile(&self, text: &str) -> QueryResult<CompiledQuery> {
        self.compile_at(text, Utc::now())
    }

    pub fn compile_at(&self, text: &str, now: DateTime<Utc>) -> QueryResult<CompiledQuery> {
        let ast = parse_query(text)?;
        Ok(self.compile_ast(&ast, now)?)
    }

    /// Resolve names and build the logical plan. Resolution problems are
    /// collected, not returned.
    pub fn plan(&self, ast: &QueryAst, now: DateTime<Utc>) -> CompileResult<Planned> {
        let mut errors = ErrorCollector::new();
        let offset = FixedOffset::east_opt(self.config.timezone_offset_hours * 3600).ok_or_else(|| {
            CompileError::Invalid(format!(
                "Invalid timezone offset: {}",
                self.config.timezone_offset_hours
            ))
        })?;
        let now = now.with_timezone(&offset);

        let mut datasets = ast
            .datasets
            .iter()
            .map(|d| dataset(d, now, &mut errors))
            .collect::<Vec<_>>();
        let metric_aliases = ast.selects.iter().filter_map(|s| s.alias.clone()).collect();
        let resolver = FieldResolver::build(&self.catalog, &mut datasets, metric_aliases, &mut errors);

        let mut lowering = Lowering {
            config: &self.config,
            errors,
            dimensions: Vec::new(),
        };
        let scope = resolver.universal_scope();

        let mut query = Query::new(datasets);
        query.filter = ast.filter.as_ref().map(|f| lowering.doc_filter(f, &scope));
        for entry in &ast.group_bys {
            query.group_bys.push(GroupByEntry {
                group_by: lowering.group_by(&entry.group_by, &scope),
                filter: entry.having.as_ref().map(|h| lowering.aggregate_filter(h, &scope)),
                alias: entry.alias.clone(),
            });
        }
        for select in &ast.selects {
            let metric = lowering.aggregate_metric(&select.metric, &scope);
            query.selects.push(match &select.alias {
                Some(name) => AggregateMetric::Named {
                    metric: Box::new(metric),
                    name: name.clone(),
                },
                None => metric,
            });
            query.format_strings.push(select.format.clone());
        }
        query.row_limit = ast.limit.or(self.config.row_limit);
        if self.config.legacy_mode {
            query.options.push("legacy".to_string());
        }

        let errors = lowering.errors;
        Ok(Planned {
            query,
            resolver,
            errors,
        })
    }

    pub fn compile_ast(&self, ast: &QueryAst, now: DateTime<Utc>) -> CompileResult<CompiledQuery> {
        let Planned {
            query,
            resolver,
            mut errors,
        } = self.plan(ast, now)?;
        if errors.has_errors() {
            return Err(CompileError::Validation(errors.errors().to_vec()));
        }

        let datasets = query.datasets.clone();
        let options = query.options.clone();
        let row_limit = query.row_limit;
        let scope = query.scope();

        let steps = execution_steps(query)?;
        let mut commands = Vec::new();
        for step in &steps {
            commands.extend(step.commands()?);
        }
        debug!(steps = steps.len(), commands = commands.len(), "lowered query");

        let helper = resolver.validation_helper();
        for command in &commands {
            command.validate(&scope, &helper, &mut errors)?;
        }
        let warnings = errors.into_result()?;

        let commands_json =
            serde_json::to_string(&commands).map_err(|e| CompileError::Internal(e.to_string()))?;
        let ranges: Vec<_> = datasets.iter().map(Dataset::range).collect();
        let cache_key = CacheKey::compute(
            &commands_json,
            &ranges,
            &options,
            row_limit,
            self.config.legacy_mode,
            &self.config.result_format,
        );
        info!(
            datasets = datasets.len(),
            commands = commands.len(),
            warnings = warnings.len(),
            cache_file = %cache_key.file_name,
            "compiled query"
        );

        Ok(CompiledQuery {
            commands,
            warnings,
            datasets,
            row_limit,
            cache_key,
        })
    }
}

/// Run the rewrite passes and schedule the query as execution steps
pub fn execution_steps(query: Query) -> CompileResult<Vec<ExecutionStep>> {
    let query = substitute_named(query)?;
    let query = simplify(query);
    let query = fix_top_k_having(query);
    let extracted = extract_precomputed(query)?;
    let scope = extracted.query.scope();

    let mut steps = Vec::new();
    match &extracted.query.filter {
        None | Some(DocFilter::Always) => {}
        Some(filter) => {
            let mut groups = GroupSupplier::new(2);
            let actions = filter.get_execution_actions(&scope, 1, 1, 0, &mut groups)?;
            debug!(actions = actions.len(), "lowered WHERE filter");
            steps.push(ExecutionStep::FilterActions(optimize_consecutive_query_actions(actions)));
        }
    }
    steps.extend(query_steps(&extracted)?);
    Ok(optimize_last(steps, extracted.query.row_limit))
}

fn dataset(ast: &DatasetAst, now: DateTime<FixedOffset>, errors: &mut ErrorCollector) -> Dataset {
    let mut dataset = Dataset::new(ast.name.clone());
    dataset.alias = ast.alias.clone();
    dataset.field_aliases = ast
        .field_aliases
        .iter()
        .map(|(actual, virtual_name)| (virtual_name.clone(), actual.clone()))
        .collect();
    let mut point = |time: &Option<TimeAst>| {
        time.as_ref().and_then(|t| match resolve_time(t, now) {
            Ok(resolved) => Some(resolved),
            Err(message) => {
                errors.error(message);
                None
            }
        })
    };
    dataset.start = point(&ast.start);
    dataset.end = point(&ast.end);
    if let (Some(start), Some(end)) = (dataset.start, dataset.end) {
        if start >= end {
            errors.error(format!(
                "Start time must be before end time for dataset \"{}\": {} >= {}",
                ast.name,
                start.to_rfc3339(),
                end.to_rfc3339()
            ));
        }
    }
    dataset
}

fn start_of_day(now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0)?;
    now.offset().from_local_datetime(&midnight).single()
}

/// Absolute times are read in the configured zone; relative ones count back
/// from now (`s`, `m`, `h`) or from the start of today
pub fn resolve_time(time: &TimeAst, now: DateTime<FixedOffset>) -> Result<DateTime<FixedOffset>, String> {
    let invalid = || format!("Invalid time: {:?}", time);
    match time {
        TimeAst::Now => Ok(now),
        TimeAst::Today => start_of_day(now).ok_or_else(invalid),
        TimeAst::Yesterday => start_of_day(now)
            .map(|today| today - Duration::days(1))
            .ok_or_else(invalid),
        TimeAst::Ago { amount, unit } => {
            let today = start_of_day(now).ok_or_else(invalid)?;
            let months = |n: i64| u32::try_from(n).ok().map(Months::new);
            let resolved = match unit {
                's' => now.checked_sub_signed(Duration::seconds(*amount)),
                'm' => now.checked_sub_signed(Duration::minutes(*amount)),
                'h' => now.checked_sub_signed(Duration::hours(*amount)),
                'd' => today.checked_sub_signed(Duration::days(*amount)),
                'w' => today.checked_sub_signed(Duration::weeks(*amount)),
                'M' => months(*amount).and_then(|m| today.checked_sub_months(m)),
                'y' => amount
                    .checked_mul(12)
                    .and_then(months)
                    .and_then(|m| today.checked_sub_months(m)),
                _ => None,
            };
            resolved.ok_or_else(invalid)
        }
        TimeAst::Absolute(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(parsed);
            }
            let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
                .ok_or_else(|| format!("Invalid time: \"{}\"", text))?;
            now.offset()
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| format!("Invalid time: \"{}\"", text))
        }
    }
}

/// AST to plan conversion for one query
struct Lowering<'c> {
    config: &'c CompileConfig,
    errors: ErrorCollector,
    /// Dimensions being expanded, innermost last
    dimensions: Vec<String>,
}

fn single(dataset: &str) -> BTreeSet<String> {
    std::iter::once(dataset.to_string()).collect()
}

fn dimension_error(name: &ScopedName) -> String {
    format!("Operation cannot be applied to dimension metric '{}'", name)
}

impl<'c> Lowering<'c> {
    fn narrow<'r>(&mut self, typed: &str, resolver: &ScopedFieldResolver<'r>) -> ScopedFieldResolver<'r> {
        let dataset = resolver.resolve_dataset(typed, &mut self.errors);
        resolver.for_scope(single(&dataset))
    }

    /// Resolver the name's own qualification points at
    fn scoped<'r>(&mut self, name: &ScopedName, resolver: &ScopedFieldResolver<'r>) -> ScopedFieldResolver<'r> {
        match &name.scope {
            Some(dataset) => self.narrow(dataset, resolver),
            None => resolver.clone(),
        }
    }

    fn is_dimension(&mut self, name: &ScopedName, resolver: &ScopedFieldResolver<'_>) -> bool {
        self.scoped(name, resolver).has_dimension(&name.name)
    }

    /// A plain field; dimensions are rejected
    fn field(&mut self, name: &ScopedName, resolver: &ScopedFieldResolver<'_>) -> FieldSet {
        let scoped = self.scoped(name, resolver);
        if scoped.has_dimension(&name.name) {
            self.errors.error(dimension_error(name));
        }
        scoped.resolve(&name.name, &mut self.errors)
    }

    fn qualify_filter(&self, name: &ScopedName, field: &FieldSet, filter: DocFilter) -> DocFilter {
        match name.scope {
            Some(_) => field.wrap_doc_filter(filter),
            None => filter,
        }
    }

    fn qualify_metric(&mut self, name: &ScopedName, field: &FieldSet, metric: DocMetric) -> DocMetric {
        if name.scope.is_none() {
            return metric;
        }
        match field.wrap_doc_metric(metric) {
            Ok(metric) => metric,
            Err(e) => {
                self.errors.error(e.to_string());
                DocMetric::Constant(0)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Doc metrics
    // -----------------------------------------------------------------------

    fn name_metric(&mut self, name: &ScopedName, resolver: &ScopedFieldResolver<'_>) -> DocMetric {
        let scoped = self.scoped(name, resolver);
        let metric = if scoped.has_dimension(&name.name) {
            self.dimension_metric(&name.name, &scoped)
        } else {
            DocMetric::Field(scoped.resolve(&name.name, &mut self.errors))
        };
        match (&name.scope, scoped.scope().iter().next()) {
            (Some(_), Some(dataset)) if scoped.is_restricted() => DocMetric::Qualified {
                dataset: dataset.clone(),
                metric: Box::new(metric),
            },
            _ => metric,
        }
    }

    /// Expand a dimension in every dataset of the scope; datasets without it
    /// read the plain field
    fn dimension_metric(&mut self, name: &str, resolver: &ScopedFieldResolver<'_>) -> DocMetric {
        if self.dimensions.iter().any(|d| d.eq_ignore_ascii_case(name)) {
            self.errors.error(format!(
                "Dimension defined in terms of itself: {} -> {}",
                self.dimensions.join(" -> "),
                name
            ));
            return DocMetric::Constant(0);
        }
        self.dimensions.push(name.to_string());

        let mut per_dataset = BTreeMap::new();
        for dataset in resolver.scope().clone() {
            let inner = resolver.for_scope(single(&dataset));
            let metric = match inner.dimension(&dataset, name) {
                Some(expression) => match parse_doc_metric(expression) {
                    Ok(ast) => self.doc_metric(&ast, &inner),
                    Err(e) => {
                        self.errors
                            .error(format!("Invalid dimension '{}' in \"{}\": {}", name, dataset, e));
                        DocMetric::Constant(0)
                    }
                },
                None => DocMetric::Field(inner.resolve(name, &mut self.errors)),
            };
            per_dataset.insert(dataset, metric);
        }
        self.dimensions.pop();

        if per_dataset.len() == 1 {
            per_dataset
                .into_values()
                .next()
                .unwrap_or(DocMetric::Constant(0))
        } else {
            DocMetric::PerDataset(per_dataset)
        }
    }

    /// Single-field doc metric, qualified like the name
    fn probe(
        &mut self,
        name: &ScopedName,
        resolver: &ScopedFieldResolver<'_>,
        make: fn(FieldSet) -> DocMetric,
    ) -> DocMetric {
        let field = self.field(name, resolver);
        let metric = make(field.clone());
        self.qualify_metric(name, &field, metric)
    }

    fn doc_metric(&mut self, ast: &DocMetricAst, resolver: &ScopedFieldResolver<'_>) -> DocMetric {
        match ast {
            DocMetricAst::Name(name) => self.name_metric(name, resolver),
            DocMetricAst::Int(value) => DocMetric::Constant(*value),
            DocMetricAst::Count => DocMetric::Count,
            DocMetricAst::DocId => DocMetric::DocId,
            DocMetricAst::Negate(m) => DocMetric::Negate(Box::new(self.doc_metric(m, resolver))),
            DocMetricAst::Abs(m) => DocMetric::Abs(Box::new(self.doc_metric(m, resolver))),
            DocMetricAst::Signum(m) => DocMetric::Signum(Box::new(self.doc_metric(m, resolver))),
            DocMetricAst::Binary { op, left, right } => {
                let left = self.doc_metric(left, resolver);
                let right = self.doc_metric(right, resolver);
                match op {
                    ArithAst::Add => DocMetric::add(vec![left, right]),
                    ArithAst::Subtract => DocMetric::binary(ArithOp::Subtract, left, right),
                    ArithAst::Multiply => DocMetric::binary(ArithOp::Multiply, left, right),
                    ArithAst::Divide => DocMetric::binary(ArithOp::Divide, left, right),
                    ArithAst::Modulus => DocMetric::binary(ArithOp::Modulus, left, right),
                }
            }
            DocMetricAst::Log { metric, scale_factor } => DocMetric::Log {
                metric: Box::new(self.doc_metric(metric, resolver)),
                scale_factor: *scale_factor,
            },
            DocMetricAst::Exp { metric, scale_factor } => DocMetric::Exponentiate {
                metric: Box::new(self.doc_metric(metric, resolver)),
                scale_factor: *scale_factor,
            },
            DocMetricAst::Min(metrics) => {
                DocMetric::min(metrics.iter().map(|m| self.doc_metric(m, resolver)).collect())
            }
            DocMetricAst::Max(metrics) => {
                DocMetric::max(metrics.iter().map(|m| self.doc_metric(m, resolver)).collect())
            }
            DocMetricAst::HasInt { field, term } => {
                let term = *term;
                let fs = self.field(field, resolver);
                let metric = DocMetric::HasInt {
                    field: fs.clone(),
                    term,
                };
                self.qualify_metric(field, &fs, metric)
            }
            DocMetricAst::HasStr { field, term } => {
                let fs = self.field(field, resolver);
                let metric = DocMetric::HasString {
                    field: fs.clone(),
                    term: term.clone(),
                };
                self.qualify_metric(field, &fs, metric)
            }
            DocMetricAst::HasIntField(name) => self.probe(name, resolver, DocMetric::HasIntField),
            DocMetricAst::HasStrField(name) => self.probe(name, resolver, DocMetric::HasStringField),
            DocMetricAst::Len(name) => self.probe(name, resolver, DocMetric::StringLen),
            DocMetricAst::IntTermCount(name) => self.probe(name, resolver, DocMetric::IntTermCount),
            DocMetricAst::StrTermCount(name) => self.probe(name, resolver, DocMetric::StrTermCount),
            DocMetricAst::FloatScale { field, mult, add } => {
                let fs = self.field(field, resolver);
                let metric = DocMetric::FloatScale {
                    field: fs.clone(),
                    mult: *mult,
                    add: *add,
                };
                self.qualify_metric(field, &fs, metric)
            }
            DocMetricAst::Extract {
                field,
                pattern,
                group_number,
            } => {
                validate_regex(pattern, &mut self.errors);
                let fs = self.field(field, resolver);
                let metric = DocMetric::Extract {
                    field: fs.clone(),
                    pattern: pattern.clone(),
                    group_number: *group_number,
                };
                self.qualify_metric(field, &fs, metric)
            }
            DocMetricAst::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.doc_filter(condition, resolver);
                DocMetric::if_then_else(
                    condition,
                    self.doc_metric(then, resolver),
                    self.doc_metric(otherwise, resolver),
                )
            }
        }
    }

    // -----------------------------------------------------------------------
    // Doc filters
    // -----------------------------------------------------------------------

    fn doc_filter(&mut self, ast: &DocFilterAst, resolver: &ScopedFieldResolver<'_>) -> DocFilter {
        match ast {
            DocFilterAst::FieldIs { field, term, negated } => {
                self.field_is(field, term, *negated, resolver)
            }
            DocFilterAst::Regex {
                field,
                pattern,
                negated,
            } => {
                if self.is_dimension(field, resolver) {
                    self.errors.error(dimension_error(field));
                    return DocFilter::Always;
                }
                validate_regex(pattern, &mut self.errors);
                let fs = self.field(field, resolver);
                let filter = if *negated {
                    DocFilter::NotRegex {
                        field: fs.clone(),
                        pattern: pattern.clone(),
                    }
                } else {
                    DocFilter::Regex {
                        field: fs.clone(),
                        pattern: pattern.clone(),
                    }
                };
                self.qualify_filter(field, &fs, filter)
            }
            DocFilterAst::FieldIn { field, terms, negated } => {
                let filter = self.field_in(field, terms, resolver);
                if *negated {
                    DocFilter::not(filter)
                } else {
                    filter
                }
            }
            DocFilterAst::Between { field, lower, upper } => {
                if self.is_dimension(field, resolver) {
                    self.errors.error(dimension_error(field));
                    return DocFilter::Always;
                }
                let fs = self.field(field, resolver);
                let filter = DocFilter::Between {
                    field: fs.clone(),
                    lower: *lower,
                    upper: *upper,
                    is_upper_inclusive: false,
                };
                self.qualify_filter(field, &fs, filter)
            }
            DocFilterAst::Compare { op, left, right } => {
                let left = self.doc_metric(left, resolver);
                let right = self.doc_metric(right, resolver);
                DocFilter::compare(*op, left, right)
            }
            DocFilterAst::Lucene(text) => self.lucene(text, resolver),
            DocFilterAst::Sample {
                field,
                numerator,
                denominator,
                seed,
            } => {
                let denominator = denominator.unwrap_or(self.config.default_sample_denominator);
                if denominator == 0 || *numerator > denominator {
                    self.errors.error(format!(
                        "Invalid sample fraction {}/{} for field {}",
                        numerator, denominator, field
                    ));
                }
                let fs = self.field(field, resolver);
                let filter = DocFilter::Sample {
                    field: fs.clone(),
                    is_int_field: resolver.is_int_field(&fs),
                    numerator: *numerator,
                    denominator,
                    seed: seed.clone().unwrap_or_default(),
                };
                self.qualify_filter(field, &fs, filter)
            }
            DocFilterAst::Bool(true) => DocFilter::Always,
            DocFilterAst::Bool(false) => DocFilter::Never,
            DocFilterAst::And(filters) => {
                DocFilter::and(filters.iter().map(|f| self.doc_filter(f, resolver)).collect())
            }
            DocFilterAst::Or(filters) => {
                DocFilter::or(filters.iter().map(|f| self.doc_filter(f, resolver)).collect())
            }
            DocFilterAst::Not(filter) => DocFilter::not(self.doc_filter(filter, resolver)),
            DocFilterAst::Qualified { datasets, filter } => {
                let scope: BTreeSet<String> = datasets
                    .iter()
                    .map(|d| resolver.resolve_dataset(d, &mut self.errors))
                    .collect();
                let narrowed = resolver.for_scope(scope.clone());
                let inner = self.doc_filter(filter, &narrowed);
                if narrowed.is_restricted() {
                    DocFilter::Qualified {
                        datasets: scope,
                        filter: Box::new(inner),
                    }
                } else {
                    inner
                }
            }
        }
    }

    fn field_is(
        &mut self,
        field: &ScopedName,
        term: &crate::term::Term,
        negated: bool,
        resolver: &ScopedFieldResolver<'_>,
    ) -> DocFilter {
        if self.is_dimension(field, resolver) {
            let value = match term.is_int_term() {
                true => term.int_value(),
                false => None,
            };
            return match value {
                Some(value) => {
                    let metric = self.name_metric(field, resolver);
                    let op = if negated { CompareOp::Ne } else { CompareOp::Eq };
                    DocFilter::compare(op, metric, DocMetric::Constant(value))
                }
                None => {
                    self.errors.error(dimension_error(field));
                    DocFilter::Always
                }
            };
        }

        let fs = self.field(field, resolver);
        let is_int = resolver.is_int_field(&fs);
        if is_int && !term.is_representable_as_int() {
            self.errors.warn(format!(
                "A non integer value '{}' specified for an integer field: {}",
                term.as_string(),
                field
            ));
        }
        let filter = if negated {
            DocFilter::field_isnt(fs.clone(), term.clone(), is_int)
        } else {
            DocFilter::field_is(fs.clone(), term.clone(), is_int)
        };
        self.qualify_filter(field, &fs, filter)
    }

    fn field_in(
        &mut self,
        field: &ScopedName,
        terms: &[crate::term::Term],
        resolver: &ScopedFieldResolver<'_>,
    ) -> DocFilter {
        if self.is_dimension(field, resolver) {
            self.errors.error(dimension_error(field));
            return DocFilter::Always;
        }
        let fs = self.field(field, resolver);
        let filter = if resolver.is_int_field(&fs) {
            let mut ints = BTreeSet::new();
            for term in terms {
                match term.int_value() {
                    Some(value) => {
                        ints.insert(value);
                    }
                    None => self.errors.warn(format!(
                        "A non integer value '{}' specified for an integer field: {}",
                        term.as_string(),
                        field
                    )),
                }
            }
            if ints.is_empty() {
                DocFilter::Never
            } else {
                DocFilter::IntFieldIn {
                    field: fs.clone(),
                    terms: ints,
                }
            }
        } else if terms.is_empty() {
            DocFilter::Never
        } else {
            DocFilter::StringFieldIn {
                field: fs.clone(),
                terms: terms.iter().map(|t| t.as_string()).collect(),
            }
        };
        self.qualify_filter(field, &fs, filter)
    }

    fn lucene(&mut self, text: &str, resolver: &ScopedFieldResolver<'_>) -> DocFilter {
        let query = match parse_lucene(text) {
            Ok(query) => query,
            Err(e) => {
                self.errors.error(e.to_string());
                return DocFilter::Always;
            }
        };
        let mut per_dataset = BTreeMap::new();
        for dataset in resolver.scope() {
            let inner = resolver.for_scope(single(dataset));
            let resolve = |typed: &str| -> CompileResult<(String, bool)> {
                let mut scratch = ErrorCollector::new();
                let field = inner.resolve(typed, &mut scratch);
                if let Some(message) = scratch.errors().first() {
                    return Err(CompileError::UnknownField(message.clone()));
                }
                let name = field.dataset_field_name(dataset)?.to_string();
                Ok((name, inner.is_int_field(&field)))
            };
            match query.to_doc_query(&resolve) {
                Ok(doc_query) => {
                    per_dataset.insert(dataset.clone(), doc_query);
                }
                Err(CompileError::UnknownField(message)) => self.errors.error(message),
                Err(e) => self.errors.error(e.to_string()),
            }
        }
        DocFilter::Lucene {
            query: text.to_string(),
            per_dataset,
        }
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    fn aggregate_metric(&mut self, ast: &AggMetricAst, resolver: &ScopedFieldResolver<'_>) -> AggregateMetric {
        match ast {
            AggMetricAst::Number(value) => AggregateMetric::Constant(*value),
            AggMetricAst::Name(name) => {
                let alias = match name.scope {
                    None => resolver.resolver().metric_alias(&name.name),
                    Some(_) => None,
                };
                match alias {
                    Some(alias) => AggregateMetric::NeedsSubstitution(alias.to_string()),
                    None => AggregateMetric::DocStats(self.name_metric(name, resolver)),
                }
            }
            AggMetricAst::DocSum(metric) => AggregateMetric::DocStats(self.doc_metric(metric, resolver)),
            AggMetricAst::Negate(m) => AggregateMetric::Negate(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Binary { op, left, right } => {
                let left = self.aggregate_metric(left, resolver);
                let right = self.aggregate_metric(right, resolver);
                match op {
                    MathOp::Add => AggregateMetric::add(vec![left, right]),
                    op => AggregateMetric::binary(*op, left, right),
                }
            }
            AggMetricAst::Abs(m) => AggregateMetric::Abs(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Log(m) => AggregateMetric::Log(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Floor(m) => AggregateMetric::Floor(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Ceil(m) => AggregateMetric::Ceil(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Round(m) => AggregateMetric::Round(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Min(metrics) => {
                AggregateMetric::Min(metrics.iter().map(|m| self.aggregate_metric(m, resolver)).collect())
            }
            AggMetricAst::Max(metrics) => {
                AggregateMetric::Max(metrics.iter().map(|m| self.aggregate_metric(m, resolver)).collect())
            }
            AggMetricAst::Avg(m) => AggregateMetric::DivideByCount(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Distinct { field, having, window } => {
                let fs = self.field(field, resolver);
                let filter = having
                    .as_ref()
                    .map(|h| Box::new(self.aggregate_filter(h, resolver)));
                let metric = AggregateMetric::Distinct {
                    field: fs.clone(),
                    filter,
                    window: *window,
                };
                self.qualify_aggregate(field, &fs, metric)
            }
            AggMetricAst::Percentile { field, percentile } => {
                if !(0.0..=100.0).contains(percentile) {
                    self.errors
                        .error(format!("Percentile must be between 0 and 100: {}", percentile));
                }
                let fs = self.field(field, resolver);
                let metric = AggregateMetric::Percentile {
                    field: fs.clone(),
                    percentile: *percentile,
                };
                self.qualify_aggregate(field, &fs, metric)
            }
            AggMetricAst::FieldMin { field, metric } | AggMetricAst::FieldMax { field, metric } => {
                let fs = self.field(field, resolver);
                let metric = metric.as_ref().map(|m| Box::new(self.aggregate_metric(m, resolver)));
                let extreme = match ast {
                    AggMetricAst::FieldMin { .. } => AggregateMetric::FieldMin {
                        field: fs.clone(),
                        metric,
                        filter: None,
                    },
                    _ => AggregateMetric::FieldMax {
                        field: fs.clone(),
                        metric,
                        filter: None,
                    },
                };
                self.qualify_aggregate(field, &fs, extreme)
            }
            AggMetricAst::Parent(m) => AggregateMetric::Parent(Box::new(self.aggregate_metric(m, resolver))),
            AggMetricAst::Lag { lag, metric } => AggregateMetric::Lag {
                lag: *lag,
                metric: Box::new(self.aggregate_metric(metric, resolver)),
            },
            AggMetricAst::Running(m) => AggregateMetric::Running {
                offset: 1,
                metric: Box::new(self.aggregate_metric(m, resolver)),
            },
            AggMetricAst::Window { window, metric } => {
                if *window == 0 {
                    self.errors.error("Window size must be positive");
                }
                AggregateMetric::Window {
                    window: *window,
                    metric: Box::new(self.aggregate_metric(metric, resolver)),
                }
            }
            AggMetricAst::SumAcross { group_by, metric } => AggregateMetric::SumAcross {
                group_by: Box::new(self.group_by(group_by, resolver)),
                metric: Box::new(self.aggregate_metric(metric, resolver)),
            },
            AggMetricAst::IfThenElse {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.aggregate_filter(condition, resolver);
                AggregateMetric::if_then_else(
                    condition,
                    self.aggregate_metric(then, resolver),
                    self.aggregate_metric(otherwise, resolver),
                )
            }
            AggMetricAst::Qualified { datasets, metric } => {
                let scope: BTreeSet<String> = datasets
                    .iter()
                    .map(|d| resolver.resolve_dataset(d, &mut self.errors))
                    .collect();
                let narrowed = resolver.for_scope(scope.clone());
                let inner = self.aggregate_metric(metric, &narrowed);
                if narrowed.is_restricted() {
                    AggregateMetric::Qualified {
                        datasets: scope,
                        metric: Box::new(inner),
                    }
                } else {
                    inner
                }
            }
        }
    }

    fn qualify_aggregate(&self, name: &ScopedName, field: &FieldSet, metric: AggregateMetric) -> AggregateMetric {
        match name.scope {
            Some(_) => field.wrap_aggregate_metric(metric),
            None => metric,
        }
    }

    fn aggregate_filter(&mut self, ast: &AggFilterAst, resolver: &ScopedFieldResolver<'_>) -> AggregateFilter {
        match ast {
            AggFilterAst::Compare { op, left, right } => {
                let left = self.aggregate_metric(left, resolver);
                let right = self.aggregate_metric(right, resolver);
                AggregateFilter::compare(*op, left, right)
            }
            AggFilterAst::TermIs(term) => AggregateFilter::TermIs(term.clone()),
            AggFilterAst::TermRegex(pattern) => {
                validate_regex(pattern, &mut self.errors);
                AggregateFilter::TermRegex(pattern.clone())
            }
            AggFilterAst::Bool(true) => AggregateFilter::Always,
            AggFilterAst::Bool(false) => AggregateFilter::Never,
            AggFilterAst::And(filters) => AggregateFilter::and(
                filters.iter().map(|f| self.aggregate_filter(f, resolver)).collect(),
            ),
            AggFilterAst::Or(filters) => AggregateFilter::or(
                filters.iter().map(|f| self.aggregate_filter(f, resolver)).collect(),
            ),
            AggFilterAst::Not(filter) => AggregateFilter::not(self.aggregate_filter(filter, resolver)),
        }
    }

    // -----------------------------------------------------------------------
    // Group bys
    // -----------------------------------------------------------------------

    fn check_group_count(&mut self, groups: u64, what: &str) {
        if groups > self.config.group_limit {
            self.errors.error(format!(
                "{} would create {} groups, more than the limit of {}",
                what, groups, self.config.group_limit
            ));
        }
    }

    fn group_by(&mut self, ast: &GroupByAst, resolver: &ScopedFieldResolver<'_>) -> GroupBy {
        match ast {
            GroupByAst::Field {
                field,
                limit,
                metric,
                with_default,
            } => {
                if let Some(limit) = limit {
                    self.check_group_count(*limit, &format!("Grouping by {}", field));
                }
                let fs = self.field(field, resolver);
                let metric = metric.as_ref().map(|m| self.aggregate_metric(m, resolver));
                GroupBy::field(fs, None, *limit, metric, *with_default)
            }
            GroupByAst::FieldIn {
                field,
                terms,
                with_default,
            } => {
                let fs = self.field(field, resolver);
                let is_int = resolver.is_int_field(&fs);
                let (int_terms, string_terms) = if is_int {
                    let mut ints = Vec::with_capacity(terms.len());
                    for term in terms {
                        match term.int_value() {
                            Some(value) => ints.push(value),
                            None => self.errors.error(format!(
                                "A non integer value '{}' specified for an integer field: {}",
                                term.as_string(),
                                field
                            )),
                        }
                    }
                    (ints, Vec::new())
                } else {
                    (Vec::new(), terms.iter().map(|t| t.as_string()).collect())
                };
                GroupBy::FieldIn {
                    field: fs,
                    int_terms,
                    string_terms,
                    with_default: *with_default,
                }
            }
            GroupByAst::Bucket {
                metric,
                min,
                max,
                interval,
                exclude_gutters,
                with_default,
            } => {
                if *interval <= 0 || max <= min {
                    self.errors.error(format!(
                        "Invalid bucket range: [{}, {}) by {}",
                        min, max, interval
                    ));
                } else {
                    let span = i128::from(*max) - i128::from(*min);
                    let buckets = (span + i128::from(*interval) - 1) / i128::from(*interval);
                    self.check_group_count(u64::try_from(buckets).unwrap_or(u64::MAX), "Bucketing");
                }
                GroupBy::Metric {
                    metric: self.doc_metric(metric, resolver),
                    min: *min,
                    max: *max,
                    interval: *interval,
                    exclude_gutters: *exclude_gutters,
                    with_default: *with_default,
                }
            }
            GroupByAst::Time { period, field, format } => {
                let field = field.as_ref().map(|f| self.field(f, resolver));
                self.time_group_by(period, field, format.clone())
            }
            GroupByAst::DayOfWeek => GroupBy::DayOfWeek,
            GroupByAst::Month => GroupBy::Month {
                field: None,
                format: None,
            },
            GroupByAst::Dataset => GroupBy::SessionName,
            GroupByAst::Quantiles { field, num_buckets } => GroupBy::Quantiles {
                field: self.field(field, resolver),
                num_buckets: *num_buckets,
            },
            GroupByAst::Predicate(filter) => GroupBy::Predicate {
                filter: self.doc_filter(filter, resolver),
            },
            GroupByAst::Random { field, k, salt } => {
                if *k == 0 {
                    self.errors.error("Random grouping needs at least one bucket");
                }
                let fs = self.field(field, resolver);
                GroupBy::Random {
                    is_int_field: resolver.is_int_field(&fs),
                    field: fs,
                    k: *k,
                    salt: salt.clone().unwrap_or_default(),
                }
            }
        }
    }

    /// `1d`, `12h`, `30m`, `1M` (calendar months), `10b` (buckets)
    fn time_group_by(&mut self, period: &str, field: Option<FieldSet>, format: Option<String>) -> GroupBy {
        let split = period
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(period.len());
        let (amount, unit) = period.split_at(split);
        let amount: i64 = amount.parse().unwrap_or(0);
        if amount <= 0 {
            self.errors.error(format!("Invalid time period: {}", period));
        }

        let unit_millis = match unit {
            "b" | "B" => {
                return GroupBy::TimeBuckets {
                    num_buckets: u32::try_from(amount).unwrap_or(0),
                    field,
                    format,
                }
            }
            "M" if amount == 1 => return GroupBy::Month { field, format },
            "s" | "S" => 1_000,
            "m" => 60_000,
            "h" | "H" => 3_600_000,
            "d" | "D" => 86_400_000,
            "w" | "W" => 7 * 86_400_000,
            _ => {
                self.errors.error(format!("Invalid time period: {}", period));
                86_400_000
            }
        };
        GroupBy::Time {
            period_millis: amount.max(1) * unit_millis,
            field,
            format,
            relative: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetMetadata;
    use crate::language::{Action, DocQuery};
    use crate::query::QueryError;

    fn catalog() -> DatasetCatalog {
        DatasetCatalog::new(vec![
            DatasetMetadata::new("jobsearch")
                .with_int_fields(&["clicks", "unixtime", "oji"])
                .with_string_fields(&["country", "q"])
                .with_alias("geo", "country")
                .with_dimension("double_clicks", "clicks * 2"),
            DatasetMetadata::new("mobsearch")
                .with_int_fields(&["clicks", "unixtime"])
                .with_string_fields(&["country", "geo"]),
        ])
    }

    fn compiler() -> Compiler {
        Compiler::new(catalog(), CompileConfig::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 18, 30, 0).unwrap()
    }

    fn compile(text: &str) -> QueryResult<CompiledQuery> {
        compiler().compile_at(text, now())
    }

    fn plan(text: &str) -> Planned {
        compiler().plan(&parse_query(text).unwrap(), now()).unwrap()
    }

    #[test]
    fn test_compile_simple_filter() {
        let compiled = compile(
            "FROM jobsearch 2024-01-01 2024-01-02 WHERE country = \"x\" AND count() > 5 SELECT count()",
        )
        .unwrap();
        match &compiled.commands[0] {
            Command::ApplyFilterActions { actions } => {
                assert_eq!(actions.len(), 2);
                assert!(matches!(
                    &actions[0],
                    Action::QueryAction {
                        target: 1,
                        positive: 1,
                        negative: 0,
                        ..
                    }
                ));
                assert!(matches!(
                    &actions[1],
                    Action::MetricAction {
                        target: 1,
                        positive: 1,
                        negative: 0,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(compiled.commands.last(), Some(Command::GetGroupStats { .. })));
        assert!(compiled.warnings.is_empty());
    }

    #[test]
    fn test_aliased_field_across_datasets_warns() {
        // geo is an alias of country in jobsearch and a real field in mobsearch
        let compiled = compile("FROM jobsearch, mobsearch SELECT inttermcount(geo)").unwrap();
        assert!(compiled.warnings.iter().any(|w| w.contains("INTTERMCOUNT")));
        assert!(matches!(compiled.commands.last(), Some(Command::GetGroupStats { .. })));
    }

    #[test]
    fn test_unknown_field_and_dataset_are_collected() {
        match compile("FROM jobsearch, nope WHERE jobsearch.missing = 1 SELECT count()") {
            Err(QueryError::Compile(CompileError::Validation(errors))) => {
                assert!(errors.iter().any(|e| e.contains("\"nope\"")));
                assert!(errors.iter().any(|e| e.contains("\"missing\"")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_distinct_is_precomputed_first() {
        let compiled = compile("FROM jobsearch GROUP BY country SELECT distinct(q) + 1").unwrap();
        let lookup = compiled
            .commands
            .iter()
            .position(|c| {
                matches!(
                    c,
                    Command::ComputeAndCreateGroupStatsLookup { .. }
                        | Command::ComputeAndCreateGroupStatsLookups { .. }
                )
            })
            .expect("lookup command");
        let stats = compiled
            .commands
            .iter()
            .position(|c| matches!(c, Command::GetGroupStats { .. } | Command::SimpleIterate { .. }))
            .expect("stats command");
        assert!(lookup < stats);
    }

    #[test]
    fn test_named_metrics_are_substituted() {
        let compiled = compile("FROM jobsearch SELECT count() AS c, c / 2").unwrap();
        match compiled.commands.last() {
            Some(Command::GetGroupStats { metrics, .. }) => {
                assert_eq!(metrics.len(), 2);
                let count = AggregateMetric::DocStatsPushes {
                    dataset: "jobsearch".into(),
                    metric: DocMetric::Count,
                };
                assert_eq!(metrics[0], count);
                assert_eq!(metrics[1], AggregateMetric::divide(count, AggregateMetric::Constant(2.0)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(compile("FROM jobsearch SELECT c / 2").is_err());
    }

    #[test]
    fn test_parse_errors_keep_position() {
        assert!(matches!(
            compile("FROM jobsearch\nSELECT count("),
            Err(QueryError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_times_use_configured_offset() {
        let planned = plan("FROM jobsearch 1d today");
        let dataset = &planned.query.datasets[0];
        // 18:30 UTC is 12:30 at -6
        assert_eq!(dataset.start.unwrap().to_rfc3339(), "2024-03-09T00:00:00-06:00");
        assert_eq!(dataset.end.unwrap().to_rfc3339(), "2024-03-10T00:00:00-06:00");

        let planned = plan("FROM jobsearch 2024-01-02 2024-01-01");
        assert!(planned.errors.has_errors());
    }

    #[test]
    fn test_dimension_expands_per_dataset() {
        let planned = plan("FROM jobsearch, mobsearch SELECT double_clicks");
        match &planned.query.selects[0] {
            AggregateMetric::DocStats(DocMetric::PerDataset(per_dataset)) => {
                assert!(matches!(
                    per_dataset["jobsearch"],
                    DocMetric::Binary {
                        op: ArithOp::Multiply,
                        ..
                    }
                ));
                // mobsearch has no such dimension or field
                assert!(matches!(per_dataset["mobsearch"], DocMetric::Field(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(planned.errors.has_errors());

        let planned = plan("FROM jobsearch WHERE double_clicks = 4 AND double_clicks =~ \"a\"");
        assert!(planned
            .errors
            .errors()
            .iter()
            .any(|e| e.contains("Operation cannot be applied to dimension metric 'double_clicks'")));
    }

    #[test]
    fn test_field_types_drive_in_lists() {
        let planned = plan("FROM jobsearch WHERE oji IN (1, 2, x) AND geo IN (us, 5)");
        match planned.query.filter {
            Some(DocFilter::And(filters)) => {
                assert!(matches!(&filters[0], DocFilter::IntFieldIn { terms, .. } if terms.len() == 2));
                match &filters[1] {
                    DocFilter::StringFieldIn { field, terms } => {
                        assert_eq!(field.only_field().unwrap(), "country");
                        assert!(terms.contains("5"));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(planned.errors.warnings()[0].starts_with("A non integer value 'x'"));
        assert!(!planned.errors.has_errors());
    }

    #[test]
    fn test_qualified_filter_and_lucene() {
        let planned = plan("FROM jobsearch, mobsearch WHERE jobsearch.(q = java) OR lucene(\"country:us\")");
        match planned.query.filter {
            Some(DocFilter::Or(filters)) => {
                assert!(matches!(&filters[0], DocFilter::Qualified { datasets, .. } if datasets.len() == 1));
                match &filters[1] {
                    DocFilter::Lucene { per_dataset, .. } => {
                        assert_eq!(per_dataset.len(), 2);
                        assert!(matches!(per_dataset["mobsearch"], DocQuery::Term { .. }));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!planned.errors.has_errors());
    }

    #[test]
    fn test_group_limit_and_time_periods() {
        let mut config = CompileConfig::default();
        config.group_limit = 5;
        let compiler = Compiler::new(catalog(), config);
        let err = compiler.compile_at("FROM jobsearch GROUP BY q[10]", now()).unwrap_err();
        assert!(err.to_string().contains("more than the limit of 5"));

        let planned = plan("FROM jobsearch GROUP BY time(1h), time(10b), time(1M)");
        let kinds: Vec<_> = planned.query.group_bys.iter().map(|g| &g.group_by).collect();
        assert!(matches!(kinds[0], GroupBy::Time { period_millis: 3_600_000, .. }));
        assert!(matches!(kinds[1], GroupBy::TimeBuckets { num_buckets: 10, .. }));
        assert!(matches!(kinds[2], GroupBy::Month { .. }));
    }

    #[test]
    fn test_cache_key_tracks_limit() {
        let a = compile("FROM jobsearch 2024-01-01 2024-01-02 SELECT count()").unwrap();
        let b = compile("FROM jobsearch 2024-01-01 2024-01-02 SELECT count()").unwrap();
        let c = compile("FROM jobsearch 2024-01-01 2024-01-02 SELECT count() LIMIT 10").unwrap();
        assert_eq!(a.cache_key, b.cache_key);
        assert_ne!(a.cache_key, c.cache_key);
        assert!(a.cache_key.file_name.starts_with("JQL-"));
    }
}

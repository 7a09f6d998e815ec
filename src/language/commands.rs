//! Command IR
//!
//! The compiled query is an ordered list of [`Command`]s run against the
//! grouping engine. Each command may change the group count and key lineage
//! seen by the next one, so the order is part of the contract.
//!
//! # Wire format
//!
//! ```text
//! {"command":"metricRegroup","perDatasetPushes":{"js":["clicks"]},"min":0,"max":10,...}
//! {"command":"getGroupStats","metrics":["js.[count()]"],"formatStrings":[null],"returnGroupKeys":true}
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::actions::Action;
use super::aggregate_filter::AggregateFilter;
use super::aggregate_metric::AggregateMetric;
use super::error::CompileResult;
use super::validation::{ErrorCollector, ValidationHelper};
use crate::fields::FieldSet;

/// Keep the top `limit` terms ordered by `metric`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopK {
    pub limit: Option<u64>,
    pub metric: Option<AggregateMetric>,
}

/// Options of a term iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIterateOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<TopK>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<AggregateFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_term_subset: Option<BTreeSet<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_term_subset: Option<BTreeSet<String>>,
}

impl FieldIterateOpts {
    pub fn new(filter: Option<AggregateFilter>, limit: Option<u64>, metric: Option<AggregateMetric>) -> Self {
        let top_k = if limit.is_some() || metric.is_some() {
            Some(TopK { limit, metric })
        } else {
            None
        };
        Self {
            top_k,
            filter,
            ..Self::default()
        }
    }
}

/// How child groups fold into their parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupLookupMergeType {
    SumAll,
    TakeTheOneUniqueValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedComputation {
    pub computation: Command,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    ApplyFilterActions { actions: Vec<Action> },
    #[serde(rename_all = "camelCase")]
    ApplyGroupFilter { filter: AggregateFilter },
    #[serde(rename_all = "camelCase")]
    IterateAndExplode {
        field: FieldSet,
        opts: FieldIterateOpts,
        default_name: Option<String>,
    },
    /// Split every group by a fixed list of terms
    #[serde(rename_all = "camelCase")]
    ExplodeGroups {
        field: FieldSet,
        #[serde(skip_serializing_if = "Option::is_none")]
        int_terms: Option<Vec<i64>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        string_terms: Option<Vec<String>>,
        default_group_term: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MetricRegroup {
        per_dataset_pushes: BTreeMap<String, Vec<String>>,
        min: i64,
        max: i64,
        interval: i64,
        exclude_gutters: bool,
        with_default: bool,
        from_predicate: bool,
    },
    #[serde(rename_all = "camelCase")]
    TimeRegroup {
        period_millis: i64,
        time_field: Option<FieldSet>,
        time_format: Option<String>,
        is_relative: bool,
    },
    #[serde(rename_all = "camelCase")]
    ExplodeTimeBuckets {
        num_buckets: u32,
        time_field: Option<FieldSet>,
        time_format: Option<String>,
    },
    ExplodeDayOfWeek,
    #[serde(rename_all = "camelCase")]
    ExplodeMonthOfYear {
        time_field: Option<FieldSet>,
        time_format: Option<String>,
    },
    ExplodeSessionNames,
    #[serde(rename_all = "camelCase")]
    ExplodePerDocPercentile { field: FieldSet, num_buckets: u32 },
    #[serde(rename_all = "camelCase")]
    ExplodeRandom { field: FieldSet, k: u32, salt: String },
    #[serde(rename_all = "camelCase")]
    RandomMetricRegroup {
        per_dataset_pushes: BTreeMap<String, Vec<String>>,
        k: u32,
        salt: String,
    },
    /// Iterate terms and emit stats without regrouping
    #[serde(rename_all = "camelCase")]
    SimpleIterate {
        field: FieldSet,
        opts: FieldIterateOpts,
        selecting: Vec<AggregateMetric>,
        format_strings: Vec<Option<String>>,
    },
    #[serde(rename_all = "camelCase")]
    GetGroupStats {
        metrics: Vec<AggregateMetric>,
        format_strings: Vec<Option<String>>,
        return_group_keys: bool,
    },
    #[serde(rename_all = "camelCase")]
    GetGroupDistincts {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        window_size: usize,
    },
    #[serde(rename_all = "camelCase")]
    GetGroupPercentiles { field: FieldSet, percentiles: Vec<f64> },
    #[serde(rename_all = "camelCase")]
    ComputeFieldExtremeValue {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    #[serde(rename_all = "camelCase")]
    SumAcross {
        field: FieldSet,
        metric: AggregateMetric,
        filter: Option<AggregateFilter>,
    },
    #[serde(rename_all = "camelCase")]
    ComputeBootstrap {
        field: FieldSet,
        filter: Option<AggregateFilter>,
        seed: String,
        metric: AggregateMetric,
        num_bootstraps: u32,
        varargs: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    RegroupIntoParent { merge_type: GroupLookupMergeType },
    #[serde(rename_all = "camelCase")]
    ComputeAndCreateGroupStatsLookup { computation: Box<Command>, name: String },
    #[serde(rename_all = "camelCase")]
    ComputeAndCreateGroupStatsLookups { computations: Vec<NamedComputation> },
}

impl Command {
    /// Check every field and nested metric against the datasets in `scope`
    pub fn validate(
        &self,
        scope: &BTreeSet<String>,
        helper: &ValidationHelper,
        errors: &mut ErrorCollector,
    ) -> CompileResult<()> {
        let context = self.name();
        let check_field = |field: &FieldSet, errors: &mut ErrorCollector| -> CompileResult<()> {
            for dataset in field.datasets() {
                helper.validate_field(&dataset, field.dataset_field_name(&dataset)?, context, errors);
            }
            Ok(())
        };
        let check_filter = |filter: &Option<AggregateFilter>, datasets: &BTreeSet<String>, errors: &mut ErrorCollector| {
            match filter {
                Some(filter) => filter.validate(datasets, helper, errors),
                None => Ok(()),
            }
        };
        match self {
            Command::ApplyFilterActions { actions } => {
                for action in actions {
                    action.validate(helper, errors)?;
                }
                Ok(())
            }
            Command::ApplyGroupFilter { filter } => filter.validate(scope, helper, errors),
            Command::IterateAndExplode { field, opts, .. } => {
                check_field(field, errors)?;
                opts.validate(&field.datasets(), helper, errors)
            }
            Command::SimpleIterate {
                field,
                opts,
                selecting,
                ..
            } => {
                check_field(field, errors)?;
                opts.validate(&field.datasets(), helper, errors)?;
                for metric in selecting {
                    metric.validate(scope, helper, errors)?;
                }
                Ok(())
            }
            Command::ExplodeGroups { field, .. } | Command::ExplodeRandom { field, .. } => check_field(field, errors),
            Command::ExplodePerDocPercentile { field, num_buckets } => {
                if *num_buckets == 0 {
                    errors.error("Quantiles must have at least one bucket");
                }
                for dataset in field.datasets() {
                    helper.validate_int_field(&dataset, field.dataset_field_name(&dataset)?, context, errors);
                }
                Ok(())
            }
            Command::MetricRegroup {
                min, max, interval, ..
            } => {
                if *interval <= 0 {
                    errors.error(format!("Bucket interval must be positive, got {}", interval));
                }
                if min >= max {
                    errors.error(format!("Bucket min must be less than max, got [{}, {})", min, max));
                }
                Ok(())
            }
            Command::TimeRegroup { time_field, .. }
            | Command::ExplodeTimeBuckets { time_field, .. }
            | Command::ExplodeMonthOfYear { time_field, .. } => match time_field {
                Some(field) => check_field(field, errors),
                None => Ok(()),
            },
            Command::GetGroupStats { metrics, .. } => {
                for metric in metrics {
                    metric.validate(scope, helper, errors)?;
                }
                Ok(())
            }
            Command::GetGroupDistincts { field, filter, .. } => {
                check_field(field, errors)?;
                check_filter(filter, &field.datasets(), errors)
            }
            Command::GetGroupPercentiles { field, percentiles } => {
                for p in percentiles {
                    if !(0.0..=100.0).contains(p) {
                        errors.error(format!("Percentile must be between 0 and 100, got {}", p));
                    }
                }
                for dataset in field.datasets() {
                    helper.validate_int_field(&dataset, field.dataset_field_name(&dataset)?, context, errors);
                }
                Ok(())
            }
            Command::ComputeFieldExtremeValue { field, metric, filter }
            | Command::SumAcross { field, metric, filter }
            | Command::ComputeBootstrap {
                field, metric, filter, ..
            } => {
                check_field(field, errors)?;
                metric.validate(&field.datasets(), helper, errors)?;
                check_filter(filter, &field.datasets(), errors)
            }
            Command::ComputeAndCreateGroupStatsLookup { computation, .. } => {
                computation.validate(scope, helper, errors)
            }
            Command::ComputeAndCreateGroupStatsLookups { computations } => {
                for named in computations {
                    named.computation.validate(scope, helper, errors)?;
                }
                Ok(())
            }
            Command::RandomMetricRegroup { k, .. } => {
                if *k == 0 {
                    errors.error("Random group by needs at least one bucket");
                }
                Ok(())
            }
            Command::ExplodeDayOfWeek | Command::ExplodeSessionNames | Command::RegroupIntoParent { .. } => Ok(()),
        }
    }

    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Command::ApplyFilterActions { .. } => "applyFilterActions",
            Command::ApplyGroupFilter { .. } => "applyGroupFilter",
            Command::IterateAndExplode { .. } => "iterateAndExplode",
            Command::ExplodeGroups { .. } => "explodeGroups",
            Command::MetricRegroup { .. } => "metricRegroup",
            Command::TimeRegroup { .. } => "timeRegroup",
            Command::ExplodeTimeBuckets { .. } => "explodeTimeBuckets",
            Command::ExplodeDayOfWeek => "explodeDayOfWeek",
            Command::ExplodeMonthOfYear { .. } => "explodeMonthOfYear",
            Command::ExplodeSessionNames => "explodeSessionNames",
            Command::ExplodePerDocPercentile { .. } => "explodePerDocPercentile",
            Command::ExplodeRandom { .. } => "explodeRandom",
            Command::RandomMetricRegroup { .. } => "randomMetricRegroup",
            Command::SimpleIterate { .. } => "simpleIterate",
            Command::GetGroupStats { .. } => "getGroupStats",
            Command::GetGroupDistincts { .. } => "getGroupDistincts",
            Command::GetGroupPercentiles { .. } => "getGroupPercentiles",
            Command::ComputeFieldExtremeValue { .. } => "computeFieldExtremeValue",
            Command::SumAcross { .. } => "sumAcross",
            Command::ComputeBootstrap { .. } => "computeBootstrap",
            Command::RegroupIntoParent { .. } => "regroupIntoParent",
            Command::ComputeAndCreateGroupStatsLookup { .. } => "computeAndCreateGroupStatsLookup",
            Command::ComputeAndCreateGroupStatsLookups { .. } => "computeAndCreateGroupStatsLookups",
        }
    }
}

impl FieldIterateOpts {
    fn validate(
        &self,
        datasets: &BTreeSet<String>,
        helper: &ValidationHelper,
        errors: &mut ErrorCollector,
    ) -> CompileResult<()> {
        if let Some(filter) = &self.filter {
            filter.validate(datasets, helper, errors)?;
        }
        if let Some(TopK {
            metric: Some(metric), ..
        }) = &self.top_k
        {
            metric.validate(datasets, helper, errors)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetMetadata;
    use crate::language::DocMetric;

    fn helper() -> ValidationHelper {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "js".to_string(),
            DatasetMetadata::new("js")
                .with_int_fields(&["clicks"])
                .with_string_fields(&["country"]),
        );
        ValidationHelper::new(datasets)
    }

    fn scope() -> BTreeSet<String> {
        ["js".to_string()].into_iter().collect()
    }

    #[test]
    fn test_serialization_is_tagged() {
        let command = Command::GetGroupStats {
            metrics: vec![AggregateMetric::DocStatsPushes {
                dataset: "js".into(),
                metric: DocMetric::Count,
            }],
            format_strings: vec![None],
            return_group_keys: true,
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "getGroupStats");
        assert_eq!(json["returnGroupKeys"], true);
        assert_eq!(json["metrics"][0], "js.[count()]");

        let json = serde_json::to_value(Command::ExplodeDayOfWeek).unwrap();
        assert_eq!(json, serde_json::json!({"command": "explodeDayOfWeek"}));
    }

    #[test]
    fn test_nested_lookup_serializes_inner_command() {
        let command = Command::ComputeAndCreateGroupStatsLookup {
            computation: Box::new(Command::GetGroupDistincts {
                field: FieldSet::single("js", "country"),
                filter: None,
                window_size: 1,
            }),
            name: "v0".into(),
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["computation"]["command"], "getGroupDistincts");
        assert_eq!(json["computation"]["field"]["js"], "country");
        assert_eq!(json["name"], "v0");
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let command = Command::GetGroupPercentiles {
            field: FieldSet::single("js", "country"),
            percentiles: vec![150.0],
        };
        let mut errors = ErrorCollector::new();
        command.validate(&scope(), &helper(), &mut errors).unwrap();
        assert_eq!(errors.errors().len(), 2);

        let command = Command::IterateAndExplode {
            field: FieldSet::single("js", "country"),
            opts: FieldIterateOpts::new(None, Some(5), None),
            default_name: None,
        };
        let mut errors = ErrorCollector::new();
        command.validate(&scope(), &helper(), &mut errors).unwrap();
        assert!(!errors.has_errors());
    }

    #[test]
    fn test_bucket_bounds() {
        let command = Command::MetricRegroup {
            per_dataset_pushes: BTreeMap::new(),
            min: 10,
            max: 0,
            interval: 0,
            exclude_gutters: false,
            with_default: false,
            from_predicate: false,
        };
        let mut errors = ErrorCollector::new();
        command.validate(&scope(), &helper(), &mut errors).unwrap();
        assert_eq!(errors.errors().len(), 2);
    }
}

//! `GROUP BY f[10] HAVING ...` keeps the top terms among those passing the
//! `HAVING` filter, so the filter moves into the term group-by.

use crate::language::plan::{GroupByEntry, Query};
use crate::language::GroupBy;

pub fn fix_top_k_having(query: Query) -> Query {
    let group_bys = query
        .group_bys
        .into_iter()
        .map(|entry| match entry {
            GroupByEntry {
                group_by:
                    GroupBy::Field {
                        field,
                        filter: None,
                        limit: Some(limit),
                        metric,
                        with_default,
                    },
                filter: Some(having),
                alias,
            } => GroupByEntry {
                group_by: GroupBy::Field {
                    field,
                    filter: Some(having),
                    limit: Some(limit),
                    metric,
                    with_default,
                },
                filter: None,
                alias,
            },
            other => other,
        })
        .collect();
    Query { group_bys, ..query }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldSet;
    use crate::language::plan::Dataset;
    use crate::language::AggregateFilter;

    fn entry(limit: Option<u64>) -> GroupByEntry {
        GroupByEntry {
            group_by: GroupBy::field(FieldSet::single("a", "country"), None, limit, None, false),
            filter: Some(AggregateFilter::IsDefaultGroup),
            alias: None,
        }
    }

    #[test]
    fn test_having_moves_into_top_k() {
        let mut query = Query::new(vec![Dataset::new("a")]);
        query.group_bys = vec![entry(Some(5)), entry(None)];
        let query = fix_top_k_having(query);
        assert_eq!(query.group_bys[0].filter, None);
        assert!(matches!(
            &query.group_bys[0].group_by,
            GroupBy::Field {
                filter: Some(AggregateFilter::IsDefaultGroup),
                ..
            }
        ));
        assert_eq!(query.group_bys[1], entry(None));
    }
}

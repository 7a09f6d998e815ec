//! Result cache key
//!
//! Two compilations that would produce the same output share a key: the hash
//! covers the compiler version, output settings, the serialized commands and
//! the dataset time ranges.

use crc32fast::Hasher;
use std::collections::BTreeMap;

/// Dataset reference as written in the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRange {
    pub name: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub field_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub hash: u32,
    pub file_name: String,
}

impl CacheKey {
    pub fn compute(
        commands_json: &str,
        datasets: &[DatasetRange],
        options: &[String],
        row_limit: Option<u64>,
        legacy: bool,
        result_format: &str,
    ) -> CacheKey {
        let mut hasher = Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(bytes);
            hasher.update(&[0]);
        };

        field(env!("CARGO_PKG_VERSION").as_bytes());
        field(if legacy { "legacy" } else { "jql" }.as_bytes());
        field(result_format.as_bytes());
        field(commands_json.as_bytes());
        for dataset in datasets {
            field(dataset.name.as_bytes());
            field(dataset.start.as_deref().unwrap_or("").as_bytes());
            field(dataset.end.as_deref().unwrap_or("").as_bytes());
            for (alias, target) in &dataset.field_aliases {
                field(alias.as_bytes());
                field(target.as_bytes());
            }
        }
        let mut sorted = options.to_vec();
        sorted.sort();
        for option in &sorted {
            field(option.as_bytes());
        }
        field(row_limit.map(|l| l.to_string()).unwrap_or_default().as_bytes());

        let hash = hasher.finalize();
        CacheKey {
            hash,
            file_name: format!("JQL-{:08x}.{}", hash, result_format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(end: &str) -> DatasetRange {
        DatasetRange {
            name: "jobsearch".into(),
            start: Some("2024-01-01".into()),
            end: Some(end.into()),
            field_aliases: BTreeMap::new(),
        }
    }

    #[test]
    fn test_stable_and_order_insensitive_options() {
        let a = CacheKey::compute("[]", &[dataset("2024-01-02")], &["x".into(), "y".into()], None, false, "tsv");
        let b = CacheKey::compute("[]", &[dataset("2024-01-02")], &["y".into(), "x".into()], None, false, "tsv");
        assert_eq!(a, b);
        assert!(a.file_name.starts_with("JQL-"));
        assert!(a.file_name.ends_with(".tsv"));
    }

    #[test]
    fn test_inputs_change_hash() {
        let base = CacheKey::compute("[]", &[dataset("2024-01-02")], &[], None, false, "tsv");
        assert_ne!(base, CacheKey::compute("[]", &[dataset("2024-01-03")], &[], None, false, "tsv"));
        assert_ne!(base, CacheKey::compute("[]", &[dataset("2024-01-02")], &[], Some(10), false, "tsv"));
        assert_ne!(base, CacheKey::compute("[]", &[dataset("2024-01-02")], &[], None, true, "tsv"));
    }
}

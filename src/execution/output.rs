//! Result rendering
//!
//! Group stats come back as one row per group: the group's key path followed
//! by its stat columns. Rows render as TSV or JSON.
//!
//! ```text
//! abc\t3\t2.5
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::io::Write;

use super::group_keys::GroupKeySet;
use super::ExecutionResult;

const REPLACEMENT: char = '\u{FFFD}';

/// One output row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    #[serde(default)]
    pub keys: Vec<String>,
    /// JSON has no NaN; it is written and read back as `null`
    #[serde(default, deserialize_with = "stats_with_nan")]
    pub stats: Vec<f64>,
}

fn stats_with_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    let stats: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
    Ok(stats.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

impl ResultRow {
    pub fn new(keys: Vec<String>, stats: Vec<f64>) -> Self {
        Self { keys, stats }
    }
}

/// Build rows from per-group stat columns (each indexed by group, 0 unused)
pub fn rows_from_group_stats(keys: &GroupKeySet, columns: &[Vec<f64>]) -> Vec<ResultRow> {
    (1..=keys.num_groups())
        .map(|group| {
            let path = keys.key_path(group).iter().map(|k| k.to_string()).collect();
            let stats = columns
                .iter()
                .map(|c| c.get(group).copied().unwrap_or(0.0))
                .collect();
            ResultRow::new(path, stats)
        })
        .collect()
}

/// Render a stat the way downstream consumers expect
pub fn format_stat(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    if value == value.trunc() {
        return format!("{:.0}", value);
    }
    let text = format!("{:.7}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '\t' | '\r' | '\n' => REPLACEMENT,
            other => other,
        })
        .collect()
}

/// Write rows as tab separated values
pub fn write_tsv<W: Write>(rows: &[ResultRow], writer: W) -> ExecutionResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .terminator(csv::Terminator::Any(b'\n'))
        .has_headers(false)
        .flexible(true)
        .from_writer(writer);

    for row in rows {
        let mut record: Vec<String> = if row.keys.is_empty() {
            vec![String::new()]
        } else {
            row.keys.iter().map(|k| sanitize_key(k)).collect()
        };
        record.extend(row.stats.iter().map(|v| format_stat(*v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn render_tsv(rows: &[ResultRow]) -> ExecutionResult<String> {
    let mut buffer = Vec::new();
    write_tsv(rows, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn render_json(rows: &[ResultRow]) -> ExecutionResult<String> {
    Ok(serde_json::to_string(rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::group_keys::GroupKey;
    use crate::term::Term;

    #[test]
    fn test_format_stat() {
        assert_eq!(format_stat(3.0), "3");
        assert_eq!(format_stat(2.5), "2.5");
        assert_eq!(format_stat(-0.0), "0");
        assert_eq!(format_stat(1.0 / 3.0), "0.3333333");
        assert_eq!(format_stat(f64::NAN), "NaN");
        assert_eq!(format_stat(1e10), "10000000000");
    }

    #[test]
    fn test_tsv_row() {
        let rows = vec![ResultRow::new(vec!["abc".into()], vec![3.0, 2.5])];
        assert_eq!(render_tsv(&rows).unwrap(), "abc\t3\t2.5\n");
    }

    #[test]
    fn test_tsv_escapes_keys_and_handles_no_keys() {
        let rows = vec![
            ResultRow::new(vec!["a\tb".into(), "c".into()], vec![1.0]),
            ResultRow::new(vec![], vec![4.0]),
        ];
        assert_eq!(render_tsv(&rows).unwrap(), "a\u{FFFD}b\tc\t1\n\t4\n");
    }

    #[test]
    fn test_rows_from_group_stats() {
        let keys = GroupKeySet::explode(
            &GroupKeySet::root(),
            vec![
                (1, GroupKey::Term(Term::string("us"))),
                (1, GroupKey::Term(Term::string("gb"))),
            ],
        )
        .unwrap();
        let rows = rows_from_group_stats(&keys, &[vec![0.0, 3.0, 4.0]]);
        assert_eq!(rows[1], ResultRow::new(vec!["gb".into()], vec![4.0]));
        let json = render_json(&rows).unwrap();
        assert!(json.starts_with("[{\"keys\":[\"us\"],\"stats\":[3.0]}"));
    }

    #[test]
    fn test_json_rows_read_back_with_nan() {
        let rows: Vec<ResultRow> =
            serde_json::from_str(r#"[{"keys":["us"],"stats":[1.5,null]},{"stats":[2]}]"#).unwrap();
        assert_eq!(rows[0].keys, vec!["us".to_string()]);
        assert!(rows[0].stats[1].is_nan());
        assert_eq!(render_tsv(&rows[1..]).unwrap(), "\t2\n");
    }
}

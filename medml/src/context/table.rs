//! In-memory tabular dataset.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::toolkit::Record;

/// Rows of JSON records with a known column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Table {
    /// Builds a table from records; columns follow first appearance.
    #[must_use]
    pub fn from_records(rows: Vec<Record>) -> Self {
        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        for row in &rows {
            for key in row.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows.
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when `name` is a column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Values of one column, `Null` where a row lacks it.
    pub fn column(&self, name: &str) -> Vec<&Value> {
        self.rows
            .iter()
            .map(|row| row.get(name).unwrap_or(&Value::Null))
            .collect()
    }

    /// Full outer join on `keys`. Rows of `self` come first, then unmatched
    /// rows of `other`.
    #[must_use]
    pub fn outer_merge(&self, other: &Self, keys: &[String]) -> Self {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, row) in other.rows.iter().enumerate() {
            index.entry(join_key(row, keys)).or_default().push(i);
        }

        let mut matched = vec![false; other.rows.len()];
        let mut rows = Vec::with_capacity(self.rows.len().max(other.rows.len()));
        for row in &self.rows {
            match index.get(&join_key(row, keys)) {
                Some(hits) => {
                    for &i in hits {
                        matched[i] = true;
                        let mut merged = row.clone();
                        for (k, v) in &other.rows[i] {
                            merged.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                        rows.push(merged);
                    }
                }
                None => rows.push(row.clone()),
            }
        }
        rows.extend(
            other
                .rows
                .iter()
                .zip(&matched)
                .filter(|(_, hit)| !**hit)
                .map(|(row, _)| row.clone()),
        );

        let mut columns = self.columns.clone();
        for column in &other.columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        Self { columns, rows }
    }

    /// Keeps only the columns accepted by `keep`, preserving order.
    #[must_use]
    pub fn select(&self, keep: impl Fn(&str) -> bool) -> Self {
        let columns: Vec<String> = self.columns.iter().filter(|c| keep(c)).cloned().collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }
}

fn join_key(row: &Record, keys: &[String]) -> String {
    keys.iter()
        .map(|k| row.get(k).unwrap_or(&Value::Null).to_string())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_columns_follow_first_appearance() {
        let table = Table::from_records(records(json!([{"id": 1, "age": 3}, {"id": 2, "sex": "f"}])));
        assert_eq!(table.columns(), &["id", "age", "sex"]);
        assert_eq!(table.column("sex"), vec![&Value::Null, &json!("f")]);
    }

    #[test]
    fn test_outer_merge_keeps_unmatched_rows() {
        let left = Table::from_records(records(json!([
            {"id": 1, "y": 0, "a_|_age": 30},
            {"id": 2, "y": 1, "a_|_age": 40}
        ])));
        let right = Table::from_records(records(json!([
            {"id": 2, "y": 1, "b_|_bmi": 22},
            {"id": 3, "y": 0, "b_|_bmi": 25}
        ])));
        let merged = left.outer_merge(&right, &["id".to_string(), "y".to_string()]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.columns(), &["id", "y", "a_|_age", "b_|_bmi"]);
        assert_eq!(merged.rows()[1]["b_|_bmi"], json!(22));
        assert_eq!(merged.rows()[2]["id"], json!(3));
    }

    #[test]
    fn test_select_keeps_order() {
        let table = Table::from_records(records(json!([{"a": 1, "b": 2, "c": 3}])));
        let picked = table.select(|c| c != "b");
        assert_eq!(picked.columns(), &["a", "c"]);
        assert!(!picked.rows()[0].contains_key("b"));
    }
}

// src/stats/aggregate.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exec::Row;

/// Summary statistics for a single date bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatedStat {
    pub date: String,
    pub mean: f64,
    pub stddev: f64,
    pub count: u64,
}

/// Overall and per-date mean / standard deviation of a metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricAnalysis {
    pub count: u64,
    pub mean: f64,
    pub stddev: f64,
    #[serde(default)]
    pub dates: Vec<DatedStat>,
}

/// Running sums for one bucket.
#[derive(Debug, Clone, Copy, Default)]
struct Sums {
    count: f64,
    sum: f64,
    sum_squares: f64,
}

impl Sums {
    fn add_row(&mut self, row: &Row) {
        self.count += number_field(row, "count");
        self.sum += number_field(row, "main_sum");
        self.sum_squares += number_field(row, "main_sum_squares");
    }

    fn mean(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    fn stddev(&self) -> f64 {
        variance_from_sums(self.sum, self.sum_squares, self.count).sqrt()
    }

    fn count(&self) -> u64 {
        if self.count.is_finite() && self.count > 0.0 {
            self.count.round() as u64
        } else {
            0
        }
    }
}

/// Sample variance from a sum, a sum of squares and a count.
///
/// Returns 0 for fewer than two observations and never a negative value.
pub fn variance_from_sums(sum: f64, sum_squares: f64, count: f64) -> f64 {
    if count <= 1.0 {
        return 0.0;
    }
    let variance = (sum_squares - sum * sum / count) / (count - 1.0);
    if variance.is_finite() && variance > 0.0 {
        variance
    } else {
        0.0
    }
}

/// Aggregate metric rows (`count`, `main_sum`, `main_sum_squares`, optional
/// `date`) into a [`MetricAnalysis`].
///
/// Rows carrying a non-empty `date` are bucketed per date (ascending);
/// undated rows are combined into the overall summary. An empty input yields
/// `MetricAnalysis::default()`.
pub fn aggregate_metric_rows(rows: &[Row]) -> MetricAnalysis {
    let mut overall = Sums::default();
    let mut by_date: BTreeMap<String, Sums> = BTreeMap::new();

    for row in rows {
        match date_field(row) {
            Some(date) => by_date.entry(date).or_default().add_row(row),
            None => overall.add_row(row),
        }
    }

    let dates = by_date
        .into_iter()
        .map(|(date, sums)| DatedStat {
            date,
            mean: sums.mean(),
            stddev: sums.stddev(),
            count: sums.count(),
        })
        .collect();

    MetricAnalysis {
        count: overall.count(),
        mean: overall.mean(),
        stddev: overall.stddev(),
        dates,
    }
}

fn date_field(row: &Row) -> Option<String> {
    match row.get("date") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Warehouses return numerics either as JSON numbers or as decimal strings.
fn number_field(row: &Row, key: &str) -> f64 {
    let value = match row.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if value.is_finite() { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("test rows must be objects"),
        }
    }

    #[test]
    fn overall_row_yields_mean_and_stddev() {
        let rows = vec![row(json!({"count": 10, "main_sum": 50, "main_sum_squares": 300}))];
        let result = aggregate_metric_rows(&rows);

        assert_eq!(result.count, 10);
        assert_eq!(result.mean, 5.0);
        let expected = variance_from_sums(50.0, 300.0, 10.0).sqrt();
        assert!((result.stddev - expected).abs() < 1e-12);
        assert!((expected - (50.0f64 / 9.0).sqrt()).abs() < 1e-12);
        assert!(result.dates.is_empty());
    }

    #[test]
    fn empty_rows_are_zeroed() {
        assert_eq!(aggregate_metric_rows(&[]), MetricAnalysis::default());
        let result = aggregate_metric_rows(&[]);
        assert_eq!(result.count, 0);
        assert_eq!(result.mean, 0.0);
        assert_eq!(result.stddev, 0.0);
    }

    #[test]
    fn dated_rows_are_bucketed_and_sorted() {
        let rows = vec![
            row(json!({"date": "2024-01-02", "count": 2, "main_sum": 6, "main_sum_squares": 20})),
            row(json!({"date": "2024-01-01", "count": "4", "main_sum": "8", "main_sum_squares": "18"})),
            row(json!({"date": "2024-01-02", "count": 2, "main_sum": 2, "main_sum_squares": 2})),
        ];
        let result = aggregate_metric_rows(&rows);

        assert_eq!(result.count, 0);
        assert_eq!(result.dates.len(), 2);
        assert_eq!(result.dates[0].date, "2024-01-01");
        assert_eq!(result.dates[0].count, 4);
        assert_eq!(result.dates[0].mean, 2.0);
        assert_eq!(result.dates[1].date, "2024-01-02");
        assert_eq!(result.dates[1].count, 4);
        assert_eq!(result.dates[1].mean, 2.0);
    }

    #[test]
    fn single_observation_has_zero_variance() {
        assert_eq!(variance_from_sums(3.0, 9.0, 1.0), 0.0);
        assert_eq!(variance_from_sums(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn malformed_fields_default_to_zero() {
        let rows = vec![row(json!({"count": null, "main_sum": "abc"}))];
        assert_eq!(aggregate_metric_rows(&rows), MetricAnalysis::default());
    }
}

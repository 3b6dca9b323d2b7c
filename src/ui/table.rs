//! Two-column metric tables for `stats` style output.

use tabled::{Table, Tabled, settings::Style};

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

pub fn stats_table(rows: &[(String, String)]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let rows: Vec<MetricRow> = rows
        .iter()
        .map(|(metric, value)| MetricRow {
            metric: metric.clone(),
            value: value.clone(),
        })
        .collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}

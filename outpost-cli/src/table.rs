/// Table formatting for records and status reports using comfy-table

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use outpost_core::{Record, ID};
use serde_json::Value;
use std::collections::BTreeSet;

/// Format a list of records as a table
///
/// Columns are the union of all field names, with `id` first and the rest
/// sorted. Missing fields show as "-".
pub fn format_records_table(records: &[Record]) -> String {
    if records.is_empty() {
        return "No records found".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let fields: BTreeSet<&String> = records.iter().flat_map(|r| r.keys()).collect();
    let mut columns: Vec<&str> = Vec::with_capacity(fields.len());
    if fields.iter().any(|f| f.as_str() == ID) {
        columns.push(ID);
    }
    columns.extend(fields.iter().map(|f| f.as_str()).filter(|f| *f != ID));

    table.set_header(columns.iter().map(|col| Cell::new(col)).collect::<Vec<_>>());

    for record in records {
        let row = columns
            .iter()
            .map(|col| match record.get(*col) {
                Some(value) => Cell::new(format_value(value)),
                None => Cell::new("-"),
            })
            .collect::<Vec<_>>();
        table.add_row(row);
    }

    table.to_string()
}

/// Format key/value pairs as a two-column table
pub fn format_pairs_table(pairs: &[(&str, String)]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    for (key, value) in pairs {
        table.add_row(vec![Cell::new(key), Cell::new(value)]);
    }
    table.to_string()
}

/// Format a JSON value for display in a table cell
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

//! Output formatting

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn print<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        match self {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(data)?),
            OutputFormat::Table => println!("{}", render_table(&serde_json::to_value(data)?)),
        }
        Ok(())
    }
}

/// Objects become field/value tables, arrays of objects become one row each
fn render_table(value: &Value) -> String {
    let mut builder = Builder::default();

    match value {
        Value::Array(items) if items.is_empty() => return "(none)".to_string(),
        Value::Array(items) => {
            let columns: Vec<String> = match &items[0] {
                Value::Object(first) => first.keys().cloned().collect(),
                _ => vec!["value".to_string()],
            };
            builder.push_record(columns.clone());
            for item in items {
                let row: Vec<String> = match item {
                    Value::Object(map) => columns
                        .iter()
                        .map(|c| map.get(c).map(cell).unwrap_or_default())
                        .collect(),
                    other => vec![cell(other)],
                };
                builder.push_record(row);
            }
        }
        Value::Object(map) => {
            builder.push_record(["field".to_string(), "value".to_string()]);
            for (key, v) in map {
                builder.push_record([key.clone(), cell(v)]);
            }
        }
        other => return cell(other),
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.to_string()
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

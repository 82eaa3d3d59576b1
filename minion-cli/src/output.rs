//! CLI output - JSON by default, an optional pretty formatter.
//!
//! The JSON shape is the contract; the pretty formatter is a convenience
//! and deliberately not.

use serde_json::Value;

pub fn print(value: &Value, pretty: bool) {
    if pretty {
        println!("{}", render_pretty(value, 0));
    } else {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
    }
}

fn render_pretty(value: &Value, indent: usize) -> String {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::Object(_) | Value::Array(_) => {
                    format!("{}{}:\n{}", pad, k, render_pretty(v, indent + 1))
                }
                _ => format!("{}{}: {}", pad, k, scalar(v)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::Object(_) | Value::Array(_) => {
                    format!("{}-\n{}", pad, render_pretty(v, indent + 1))
                }
                _ => format!("{}- {}", pad, scalar(v)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => format!("{}{}", pad, scalar(value)),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

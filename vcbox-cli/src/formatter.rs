// Output formatting utilities for CLI commands.

use anyhow::{Result, anyhow};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => Err(anyhow!(
                "Unknown format: '{}'. Valid formats: table, json",
                s
            )),
        }
    }
}

/// Format data as JSON string.
pub fn format_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string_pretty(data).map_err(|e| anyhow!("JSON serialization failed: {}", e))
}

/// Print `data` as JSON, or hand it to `table_printer` for table output.
pub fn print_output<T, W, F>(
    writer: &mut W,
    data: &T,
    format: OutputFormat,
    table_printer: F,
) -> Result<()>
where
    T: Serialize,
    W: std::io::Write,
    F: FnOnce(&mut W, &T) -> Result<()>,
{
    match format {
        OutputFormat::Table => table_printer(writer, data),
        OutputFormat::Json => {
            let json = format_json(data)?;
            writeln!(writer, "{}", json)?;
            Ok(())
        }
    }
}

/// Format time consistently, e.g. `2026-01-22 15:04:05 UTC`.
pub fn format_time<T: chrono::TimeZone>(t: &chrono::DateTime<T>) -> String
where
    T::Offset: std::fmt::Display,
{
    t.format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);

        let err = "yaml".parse::<OutputFormat>().unwrap_err();
        assert!(err.to_string().contains("Unknown format"));
    }

    #[test]
    fn test_print_output_json() {
        let data = TestData {
            name: "sb".into(),
            value: 2,
        };
        let mut buffer = Vec::new();
        print_output(&mut buffer, &data, OutputFormat::Json, |_, _| {
            panic!("table printer called for JSON output")
        })
        .unwrap();

        let parsed: TestData = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_print_output_table_uses_printer() {
        let mut buffer = Vec::new();
        print_output(&mut buffer, &vec![1, 2], OutputFormat::Table, |w, d| {
            writeln!(w, "rows={}", d.len())?;
            Ok(())
        })
        .unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "rows=2\n");
    }

    #[test]
    fn test_format_time() {
        let t = chrono::DateTime::parse_from_rfc3339("2026-01-22T15:04:05Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(format_time(&t), "2026-01-22 15:04:05 UTC");
    }
}

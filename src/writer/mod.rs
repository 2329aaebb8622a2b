//! File writers: delimited text and JSON-array output.
//!
//! Both writers are deliberately dumb sinks. Partition slicing, part
//! numbering and missing-field defaulting happen in the tasks; a partially
//! written file is left in place when an I/O error propagates.

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::Path;

use csv::{QuoteStyle, WriterBuilder};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::errors::Result;

/// Quoting behavior of the delimited writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum QuoteMode {
    #[serde(rename = "QUOTE_ALL")]
    All,
    #[serde(rename = "QUOTE_MINIMAL")]
    Minimal,
    #[serde(rename = "QUOTE_NONE")]
    None,
}

/// How records are rendered into a delimited file.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    pub include_header: bool,
    pub delimiter: u8,
    pub quote: u8,
    pub quoting: QuoteMode,
    pub escape: Option<u8>,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            include_header: true,
            delimiter: b',',
            quote: b'"',
            quoting: QuoteMode::Minimal,
            escape: None,
        }
    }
}

/// How the output file is opened.
#[derive(Debug, Clone, Copy)]
pub struct OpenPolicy {
    pub append: bool,
}

impl Default for OpenPolicy {
    fn default() -> Self {
        Self { append: true }
    }
}

/// Render one record value as a delimited-file cell.
///
/// Nulls become the empty string; nested values fall back to their JSON
/// rendering so nothing ever panics on an unexpected shape.
pub fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Write `rows` to `path` as delimited text.
///
/// The header row is written only when the policy asks for it *and* the file
/// did not already exist, so appending later partitions to the same file
/// never duplicates it.
pub fn write_delimited<I>(
    path: &Path,
    header: &[String],
    rows: I,
    write_policy: &WritePolicy,
    open_policy: &OpenPolicy,
) -> Result<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let file_exists = path.exists();

    let file = if open_policy.append {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?
    };

    let mut builder = WriterBuilder::new();
    builder
        .delimiter(write_policy.delimiter)
        .quote(write_policy.quote)
        .quote_style(match write_policy.quoting {
            QuoteMode::All => QuoteStyle::Always,
            QuoteMode::Minimal => QuoteStyle::Necessary,
            QuoteMode::None => QuoteStyle::Never,
        });
    if let Some(escape) = write_policy.escape {
        builder.double_quote(false).escape(escape);
    }
    let mut writer = builder.from_writer(BufWriter::new(file));

    if write_policy.include_header && !file_exists {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Serialize the whole batch as one UTF-8 JSON array with 4-space indent.
pub fn write_json_array(path: &Path, docs: &[Value]) -> Result<()> {
    let file = File::create(path)?;
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(BufWriter::new(file), formatter);
    docs.serialize(&mut serializer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_to_string_shapes() {
        assert_eq!(cell_to_string(&Value::Null), "");
        assert_eq!(cell_to_string(&json!("x")), "x");
        assert_eq!(cell_to_string(&json!(12)), "12");
        assert_eq!(cell_to_string(&json!(true)), "true");
        assert_eq!(cell_to_string(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_default_policies() {
        let write = WritePolicy::default();
        assert!(write.include_header);
        assert_eq!(write.delimiter, b',');
        assert_eq!(write.quoting, QuoteMode::Minimal);
        assert!(OpenPolicy::default().append);
    }
}

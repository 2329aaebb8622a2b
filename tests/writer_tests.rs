use std::fs;

use serde_json::json;
use tempfile::TempDir;

use dbtap::writer::{write_delimited, write_json_array, OpenPolicy, QuoteMode, WritePolicy};

fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
    data.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

fn header(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn test_header_written_only_when_file_is_new() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("part-0.csv");
    let policy = WritePolicy::default();
    let open = OpenPolicy::default();

    write_delimited(&path, &header(&["id", "name"]), rows(&[&["1", "a"]]), &policy, &open).unwrap();
    write_delimited(&path, &header(&["id", "name"]), rows(&[&["2", "b"]]), &policy, &open).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines, vec!["id,name", "1,a", "2,b"]);
}

#[test]
fn test_header_suppressed_by_policy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("part-0.csv");
    let policy = WritePolicy {
        include_header: false,
        ..WritePolicy::default()
    };

    write_delimited(&path, &header(&["id"]), rows(&[&["1"]]), &policy, &OpenPolicy::default())
        .unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
}

#[test]
fn test_truncate_mode_replaces_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("part-0.csv");
    let policy = WritePolicy::default();

    write_delimited(
        &path,
        &header(&["id"]),
        rows(&[&["1"], &["2"]]),
        &policy,
        &OpenPolicy { append: true },
    )
    .unwrap();
    write_delimited(
        &path,
        &header(&["id"]),
        rows(&[&["9"]]),
        &policy,
        &OpenPolicy { append: false },
    )
    .unwrap();

    let content = fs::read_to_string(&path).unwrap();
    // File already existed, so no second header even after truncation
    assert_eq!(content.lines().collect::<Vec<_>>(), vec!["9"]);
}

#[test]
fn test_quote_all_with_pipe_delimiter() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.ctl");
    let policy = WritePolicy {
        delimiter: b'|',
        quoting: QuoteMode::All,
        ..WritePolicy::default()
    };

    write_delimited(
        &path,
        &header(&["record_count", "pos_date"]),
        rows(&[&["2500", "2024-02-28"]]),
        &policy,
        &OpenPolicy::default(),
    )
    .unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(
        content.lines().collect::<Vec<_>>(),
        vec!["\"record_count\"|\"pos_date\"", "\"2500\"|\"2024-02-28\""]
    );
}

#[test]
fn test_quote_minimal_only_quotes_when_needed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.csv");

    write_delimited(
        &path,
        &header(&["a", "b"]),
        rows(&[&["plain", "has,comma"]]),
        &WritePolicy::default(),
        &OpenPolicy::default(),
    )
    .unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("plain,\"has,comma\""));
}

#[test]
fn test_quote_none_writes_fields_raw() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.csv");
    let policy = WritePolicy {
        delimiter: b'|',
        quoting: QuoteMode::None,
        ..WritePolicy::default()
    };

    write_delimited(
        &path,
        &header(&["a", "b"]),
        rows(&[&["say \"hi\"", "x"]]),
        &policy,
        &OpenPolicy::default(),
    )
    .unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("say \"hi\"|x"));
}

#[test]
fn test_missing_fields_arrive_as_empty_cells() {
    // Missing-field defaulting happens in ResultSet::cells
    use dbtap::source::ResultSet;
    let record: dbtap::source::Record =
        [("id".to_string(), json!(1))].into_iter().collect();
    let set = ResultSet {
        columns: vec!["id".to_string(), "name".to_string()],
        records: vec![record],
    };
    assert_eq!(set.cells(&set.records[0]), vec!["1".to_string(), String::new()]);
}

#[test]
fn test_json_array_uses_four_space_indent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("part-0.json");
    let docs = vec![json!({"_id": "65a1", "name": "a"}), json!({"_id": "65a2", "name": "b"})];

    write_json_array(&path, &docs).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 2);
    assert!(content.starts_with("[\n    {"));
    assert!(content.contains("\n        \"_id\""));
}

#[test]
fn test_json_empty_array() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("part-0.json");
    write_json_array(&path, &[]).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
}

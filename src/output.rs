//! Output formatting and persistence for labeling results.
//!
//! Writes the label table as CSV and renders reports as JSON.

use std::path::Path;

use csv::WriterBuilder;
use serde::Serialize;
use tracing::debug;

use crate::analyzers::types::LabeledRow;
use crate::error::Result;

/// Writes the label table to `path`, replacing any existing file.
///
/// The header `path,label,avg_vehicles` comes from the [`LabeledRow`] field
/// names.
pub fn write_labels(path: &Path, rows: &[LabeledRow]) -> Result<()> {
    debug!(path = %path.display(), rows = rows.len(), "Writing label CSV");

    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;

    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}

/// Renders any report as pretty-printed JSON.
pub fn render_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn row(path: &str, label: u8, avg_vehicles: f64) -> LabeledRow {
        LabeledRow {
            path: path.to_string(),
            label,
            avg_vehicles,
        }
    }

    #[test]
    fn test_write_labels_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");

        write_labels(&path, &[row("a.pt", 0, 2.0), row("b.pt", 2, 8.25)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines, vec!["path,label,avg_vehicles", "a.pt,0,2.0", "b.pt,2,8.25"]);
    }

    #[test]
    fn test_write_labels_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        fs::write(&path, "stale,content\n1,2\n3,4\n5,6\n").unwrap();

        write_labels(&path, &[row("a.pt", 1, 3.5)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("stale"));
    }

    #[test]
    fn test_written_rows_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        let rows = vec![row("data/x.pt", 1, 4.333333333333333)];

        write_labels(&path, &rows).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let back: Vec<LabeledRow> = reader
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_render_json() {
        let json = render_json(&row("a.pt", 0, 1.0)).unwrap();
        assert!(json.contains("\"avg_vehicles\": 1.0"));
    }
}

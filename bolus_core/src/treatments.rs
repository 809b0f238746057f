//! Append-only treatment log.
//!
//! Delivered doses are appended to a JSONL file with file locking so the
//! calculator surface and the dual-wave page can both write safely. A CSV
//! export is provided for review.

use crate::{Result, TreatmentRecord};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Sink trait for persisting treatment records
pub trait TreatmentSink {
    fn append(&mut self, record: &TreatmentRecord) -> Result<()>;
}

/// JSONL-based treatment sink with file locking
pub struct JsonlTreatmentSink {
    path: PathBuf,
}

impl JsonlTreatmentSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl TreatmentSink for JsonlTreatmentSink {
    fn append(&mut self, record: &TreatmentRecord) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;

        tracing::debug!("Appended treatment {} to log", record.id);
        Ok(())
    }
}

/// Read all treatment records from a log file.
///
/// Malformed lines are skipped with a warning rather than failing the read.
pub fn read_treatments(path: &Path) -> Result<Vec<TreatmentRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<TreatmentRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Failed to parse treatment at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} treatments from log", records.len());
    Ok(records)
}

/// Export the treatment log as CSV, returning the number of rows written
pub fn export_csv(log_path: &Path, csv_path: &Path) -> Result<usize> {
    let records = read_treatments(log_path)?;

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(csv_path)?;
    writer.write_record(["id", "at", "units_u", "kind", "carbs_g", "note"])?;
    for record in &records {
        writer.write_record([
            record.id.to_string(),
            record.at.to_rfc3339(),
            format!("{:.2}", record.units_u),
            format!("{:?}", record.kind).to_lowercase(),
            format!("{:.1}", record.carbs_g),
            record.note.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;

    tracing::info!("Exported {} treatments to {:?}", records.len(), csv_path);
    Ok(records.len())
}

//! Persisted result log: one `name;code;info[|ms]` line per update attempt.
//!
//! Appended by verification, install and revert paths, consumed
//! destructively by the "get update result" query. The revert path is the
//! only writer that rewrites existing lines.

use hmp_update_core::error::{ErrorCode, Result, UpdateError};
use hmp_update_core::log::ResultRecord;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Line-oriented result log at a fixed path.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub fn append(&self, record: &ResultRecord) -> Result<()> {
        let _guard = self.lock.lock();
        self.ensure_parent()?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                UpdateError::Other(format!(
                    "failed to open result log {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        file.write_all(record.to_line().as_bytes())?;
        file.flush()?;

        tracing::debug!(
            name = %record.name,
            code = record.code,
            info = %record.info,
            "Recorded update result"
        );
        Ok(())
    }

    /// Append, logging instead of failing.
    pub fn record(&self, record: ResultRecord) {
        if let Err(e) = self.append(&record) {
            tracing::warn!(name = %record.name, error = %e, "Failed to write result log");
        }
    }

    /// Read every record without consuming the log.
    pub fn records(&self) -> Result<Vec<ResultRecord>> {
        let _guard = self.lock.lock();
        self.read_records()
    }

    /// Read every record, then delete the log.
    pub fn take_all(&self) -> Result<Vec<ResultRecord>> {
        let _guard = self.lock.lock();
        let records = self.read_records()?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(records)
    }

    /// Rewrite the code of every record about `hmp` to the revert outcome.
    ///
    /// Records match when their name is the hmp itself or a package inside a
    /// directory named after it. Appends a fresh record when none match.
    /// Returns the number of rewritten records.
    pub fn update_revert_result(&self, hmp: &str, success: bool) -> Result<usize> {
        let code = if success {
            ErrorCode::RevertSuccess
        } else {
            ErrorCode::RevertFailed
        };

        let _guard = self.lock.lock();
        let mut records = self.read_records()?;
        let mut updated = 0;
        for record in records.iter_mut() {
            if record_belongs_to(record, hmp) {
                record.code = code.as_i32();
                updated += 1;
            }
        }
        if updated == 0 {
            records.push(ResultRecord::new(hmp, code, code.label()));
        }

        self.ensure_parent()?;
        let body: String = records.iter().map(ResultRecord::to_line).collect();
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, body).map_err(|e| {
            UpdateError::Other(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            UpdateError::Other(format!(
                "failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::info!(hmp, updated, code = code.as_i32(), "Updated revert result");
        Ok(updated)
    }

    fn read_records(&self) -> Result<Vec<ResultRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            match ResultRecord::parse_line(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line, error = %e, "Skipping malformed result record"),
            }
        }
        Ok(records)
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::Other(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

fn record_belongs_to(record: &ResultRecord, hmp: &str) -> bool {
    if record.name == hmp {
        return true;
    }
    Path::new(&record.name)
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|dir| dir == hmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, ResultLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ResultLog::new(dir.path().join("updater/result"));
        (dir, log)
    }

    #[test]
    fn test_append_and_take_all() {
        let (_dir, log) = temp_log();
        log.append(&ResultRecord::new("demo", ErrorCode::Success, "ok"))
            .unwrap();
        log.append(
            &ResultRecord::new("other", ErrorCode::VersionTooLow, "old").with_duration(12),
        )
        .unwrap();

        assert_eq!(log.records().unwrap().len(), 2);
        let records = log.take_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].duration_ms, Some(12));
        assert!(!log.path().exists());
        assert!(log.take_all().unwrap().is_empty());
    }

    #[test]
    fn test_update_revert_result_rewrites_in_place() {
        let (_dir, log) = temp_log();
        log.append(&ResultRecord::new("demo", ErrorCode::IoFailure, "mount failed"))
            .unwrap();
        log.append(&ResultRecord::new(
            "/data/module_update/active/demo/demo_sa.zip",
            ErrorCode::VerifySignFail,
            "bad tree",
        ))
        .unwrap();
        log.append(&ResultRecord::new("other", ErrorCode::Success, "ok"))
            .unwrap();

        assert_eq!(log.update_revert_result("demo", true).unwrap(), 2);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].error_code(), ErrorCode::RevertSuccess);
        assert_eq!(records[0].info, "mount failed");
        assert_eq!(records[1].error_code(), ErrorCode::RevertSuccess);
        assert_eq!(records[2].error_code(), ErrorCode::Success);
    }

    #[test]
    fn test_update_revert_result_appends_when_unmatched() {
        let (_dir, log) = temp_log();
        assert_eq!(log.update_revert_result("demo", false).unwrap(), 0);

        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "demo");
        assert_eq!(records[0].error_code(), ErrorCode::RevertFailed);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (_dir, log) = temp_log();
        std::fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        std::fs::write(log.path(), "garbage\ndemo;0;ok\n\n").unwrap();
        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "demo");
    }
}

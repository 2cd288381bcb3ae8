// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Durable home of programs, master images, statistics, and cycle results.
// Program records and cycle rows live in SQLite; master images are PNG files
// beside the database, written atomically (temp + fsync + rename) so a crash
// mid-registration leaves the previous master canonical.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use canonical_error::{CanonicalError, already_exists_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error, not_found_error};
use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{info, warn};
use rusqlite::{Connection, params};

use argus_elements::image_utils::{QualityMetrics, decode, encode_lossless,
                                  quality_metrics};
use argus_elements::types::{CycleResult, Program, ProgramSummary, Statistics,
                            ToolResult, TriggerSource, Verdict};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS programs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    config TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS statistics (
    program_id INTEGER PRIMARY KEY REFERENCES programs(id),
    total INTEGER NOT NULL DEFAULT 0,
    ok INTEGER NOT NULL DEFAULT 0,
    ng INTEGER NOT NULL DEFAULT 0,
    last_run_at TEXT
);
CREATE TABLE IF NOT EXISTS cycle_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    program_id INTEGER NOT NULL REFERENCES programs(id),
    cycle_seq INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    trigger_source TEXT NOT NULL,
    overall TEXT NOT NULL,
    processing_time_ms REAL NOT NULL,
    tool_results TEXT NOT NULL,
    per_stage_ms TEXT NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS cycle_results_by_program
    ON cycle_results (program_id, id);
CREATE TABLE IF NOT EXISTS diagnostics_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    report TEXT NOT NULL
);
";

// Size-bounded retention for cycle results; the oldest rows beyond this are
// pruned on append.
const DEFAULT_MAX_RESULTS_PER_PROGRAM: usize = 10000;

fn db_error(e: rusqlite::Error) -> CanonicalError {
    internal_error(&format!("database error: {}", e))
}

fn trigger_source_str(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Internal => "internal",
        TriggerSource::External => "external",
        TriggerSource::Manual => "manual",
    }
}

fn parse_trigger_source(text: &str) -> TriggerSource {
    match text {
        "external" => TriggerSource::External,
        "manual" => TriggerSource::Manual,
        _ => TriggerSource::Internal,
    }
}

fn verdict_str(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Ok => "OK",
        Verdict::Ng => "NG",
    }
}

pub struct ProgramStore {
    conn: Mutex<Connection>,
    data_dir: PathBuf,

    // Program currently referenced by an inspection run. Mutations of that
    // program are rejected until the run releases it.
    running: Mutex<Option<i64>>,

    max_results_per_program: usize,
}

impl ProgramStore {
    pub fn new(data_dir: &Path) -> Result<Self, CanonicalError> {
        fs::create_dir_all(data_dir.join("masters"))
            .map_err(|e| internal_error(&format!(
                "cannot create data directory {:?}: {}", data_dir, e)))?;
        let conn = Connection::open(data_dir.join("argus.sqlite"))
            .map_err(db_error)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_error)?;
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(ProgramStore {
            conn: Mutex::new(conn),
            data_dir: data_dir.to_path_buf(),
            running: Mutex::new(None),
            max_results_per_program: DEFAULT_MAX_RESULTS_PER_PROGRAM,
        })
    }

    pub fn set_max_results_per_program(&mut self, max: usize) {
        self.max_results_per_program = max;
    }

    // Marks `program_id` as referenced by a run; guards all mutation paths.
    pub fn mark_running(&self, program_id: i64) {
        *self.running.lock().unwrap() = Some(program_id);
    }

    pub fn clear_running(&self) {
        *self.running.lock().unwrap() = None;
    }

    pub fn running_program(&self) -> Option<i64> {
        *self.running.lock().unwrap()
    }

    fn guard_not_running(&self, program_id: i64)
                         -> Result<(), CanonicalError> {
        if self.running_program() == Some(program_id) {
            return Err(failed_precondition_error(&format!(
                "program {} is referenced by an active run", program_id)));
        }
        Ok(())
    }

    pub fn create(&self, mut program: Program)
                  -> Result<Program, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO programs (name, config) VALUES (?1, '{}')",
                     params![program.name])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                        already_exists_error(&format!(
                            "program name {:?} already exists", program.name)),
                other => db_error(other),
            })?;
        program.id = conn.last_insert_rowid();
        let config = serde_json::to_string(&program)
            .map_err(|e| internal_error(&format!("encode program: {}", e)))?;
        conn.execute("UPDATE programs SET config = ?1 WHERE id = ?2",
                     params![config, program.id])
            .map_err(db_error)?;
        conn.execute(
            "INSERT INTO statistics (program_id, total, ok, ng) \
             VALUES (?1, 0, 0, 0)",
            params![program.id])
            .map_err(db_error)?;
        info!("Created program {} ({:?})", program.id, program.name);
        Ok(program)
    }

    pub fn get(&self, program_id: i64) -> Result<Program, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        let config: String = conn.query_row(
            "SELECT config FROM programs WHERE id = ?1",
            params![program_id], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows =>
                    not_found_error(&format!("no program {}", program_id)),
                other => db_error(other),
            })?;
        serde_json::from_str(&config)
            .map_err(|e| internal_error(&format!(
                "corrupt program record {}: {}", program_id, e)))
    }

    pub fn list(&self) -> Result<Vec<ProgramSummary>, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT p.config, s.total, s.ok, s.ng, s.last_run_at \
             FROM programs p LEFT JOIN statistics s ON s.program_id = p.id \
             ORDER BY p.id")
            .map_err(db_error)?;
        let rows = statement.query_map([], |row| {
            let config: String = row.get(0)?;
            let total: Option<i64> = row.get(1)?;
            let ok: Option<i64> = row.get(2)?;
            let ng: Option<i64> = row.get(3)?;
            let last_run_at: Option<String> = row.get(4)?;
            Ok((config, total, ok, ng, last_run_at))
        }).map_err(db_error)?;

        let mut summaries = Vec::new();
        for row in rows {
            let (config, total, ok, ng, last_run_at) = row.map_err(db_error)?;
            let program: Program = serde_json::from_str(&config)
                .map_err(|e| internal_error(&format!(
                    "corrupt program record: {}", e)))?;
            summaries.push(ProgramSummary {
                id: program.id,
                name: program.name.clone(),
                trigger: program.trigger,
                tool_count: program.tools.len(),
                has_master: program.master_image_ref.is_some(),
                statistics: Statistics {
                    total: total.unwrap_or(0),
                    ok: ok.unwrap_or(0),
                    ng: ng.unwrap_or(0),
                    last_run_at: last_run_at.as_deref()
                        .and_then(parse_timestamp),
                },
            });
        }
        Ok(summaries)
    }

    pub fn update(&self, program_id: i64, mut program: Program)
                  -> Result<Program, CanonicalError> {
        self.guard_not_running(program_id)?;
        let existing = self.get(program_id)?;
        program.id = program_id;
        // The master reference is owned by write_master(); a config update
        // that omits it keeps the registered master.
        if program.master_image_ref.is_none() {
            program.master_image_ref = existing.master_image_ref;
        }
        let config = serde_json::to_string(&program)
            .map_err(|e| internal_error(&format!("encode program: {}", e)))?;
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE programs SET name = ?1, config = ?2 WHERE id = ?3",
            params![program.name, config, program_id])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                        already_exists_error(&format!(
                            "program name {:?} already exists", program.name)),
                other => db_error(other),
            })?;
        if updated == 0 {
            return Err(not_found_error(&format!("no program {}", program_id)));
        }
        Ok(program)
    }

    pub fn delete(&self, program_id: i64) -> Result<(), CanonicalError> {
        self.guard_not_running(program_id)?;
        let program = self.get(program_id)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM cycle_results WHERE program_id = ?1",
                         params![program_id]).map_err(db_error)?;
            conn.execute("DELETE FROM statistics WHERE program_id = ?1",
                         params![program_id]).map_err(db_error)?;
            conn.execute("DELETE FROM programs WHERE id = ?1",
                         params![program_id]).map_err(db_error)?;
        }
        if let Some(reference) = program.master_image_ref {
            let path = self.data_dir.join(&reference);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove master image {:?}: {}", path, e);
            }
        }
        info!("Deleted program {}", program_id);
        Ok(())
    }

    // Registers a new master image from operator-supplied bytes. The upload
    // is decoded and re-encoded losslessly; the in-memory raster, not the
    // uploaded bytes, is canonical. Returns the stored reference and the
    // computed quality metrics.
    pub fn write_master(&self, program_id: i64, raw: &[u8])
                        -> Result<(String, QualityMetrics), CanonicalError> {
        self.guard_not_running(program_id)?;
        let mut program = self.get(program_id)?;

        let image = decode(raw)?;
        let expected = program.capture_settings.resolution;
        if image.dimensions() != expected {
            return Err(invalid_argument_error(&format!(
                "master image is {}x{}, program resolution is {}x{}",
                image.width(), image.height(), expected.0, expected.1)));
        }
        let metrics = quality_metrics(&image);
        let encoded = encode_lossless(&image)?;

        let reference = format!("masters/program_{}.png", program_id);
        let final_path = self.data_dir.join(&reference);
        let temp_path = self.data_dir.join(format!(
            "masters/program_{}.png.tmp", program_id));
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| internal_error(&format!(
                "cannot create {:?}: {}", temp_path, e)))?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .map_err(|e| internal_error(&format!(
                "cannot write {:?}: {}", temp_path, e)))?;
        drop(file);
        // Until this rename succeeds the previous master stays canonical.
        fs::rename(&temp_path, &final_path)
            .map_err(|e| internal_error(&format!(
                "cannot rename {:?}: {}", temp_path, e)))?;

        program.master_image_ref = Some(reference.clone());
        let config = serde_json::to_string(&program)
            .map_err(|e| internal_error(&format!("encode program: {}", e)))?;
        self.conn.lock().unwrap().execute(
            "UPDATE programs SET config = ?1 WHERE id = ?2",
            params![config, program_id])
            .map_err(db_error)?;
        info!("Registered master image for program {} (score {:.1})",
              program_id, metrics.score);
        Ok((reference, metrics))
    }

    pub fn load_master(&self, program_id: i64)
                       -> Result<RgbImage, CanonicalError> {
        let program = self.get(program_id)?;
        let reference = program.master_image_ref.ok_or_else(
            || not_found_error(&format!(
                "program {} has no master image", program_id)))?;
        let path = self.data_dir.join(&reference);
        let bytes = fs::read(&path)
            .map_err(|e| not_found_error(&format!(
                "cannot read master image {:?}: {}", path, e)))?;
        decode(&bytes)
    }

    // Appends one cycle row and folds it into the statistics row in a single
    // transaction, so ok + ng == total holds at every instant.
    pub fn append_result(&self, result: &CycleResult)
                         -> Result<(), CanonicalError> {
        let tool_results = serde_json::to_string(&result.tool_results)
            .map_err(|e| internal_error(&format!("encode tool results: {}", e)))?;
        let per_stage = serde_json::to_string(&result.per_stage_ms)
            .map_err(|e| internal_error(&format!("encode stage times: {}", e)))?;

        let mut conn = self.conn.lock().unwrap();
        let transaction = conn.transaction().map_err(db_error)?;
        transaction.execute(
            "INSERT INTO cycle_results (program_id, cycle_seq, timestamp, \
             trigger_source, overall, processing_time_ms, tool_results, \
             per_stage_ms, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![result.program_id, result.cycle_seq as i64,
                    result.timestamp.to_rfc3339(),
                    trigger_source_str(result.trigger_source),
                    verdict_str(result.overall),
                    result.processing_time_ms, tool_results, per_stage,
                    result.error])
            .map_err(db_error)?;
        let (ok_delta, ng_delta) = match result.overall {
            Verdict::Ok => (1, 0),
            Verdict::Ng => (0, 1),
        };
        let updated = transaction.execute(
            "UPDATE statistics SET total = total + 1, ok = ok + ?1, \
             ng = ng + ?2, last_run_at = ?3 WHERE program_id = ?4",
            params![ok_delta, ng_delta, result.timestamp.to_rfc3339(),
                    result.program_id])
            .map_err(db_error)?;
        if updated == 0 {
            return Err(not_found_error(&format!(
                "no statistics row for program {}", result.program_id)));
        }
        // Retention: drop rows older than the newest max_results_per_program.
        transaction.execute(
            "DELETE FROM cycle_results WHERE program_id = ?1 AND id <= \
             (SELECT id FROM cycle_results WHERE program_id = ?1 \
              ORDER BY id DESC LIMIT 1 OFFSET ?2)",
            params![result.program_id, self.max_results_per_program as i64])
            .map_err(db_error)?;
        transaction.commit().map_err(db_error)
    }

    pub fn recent(&self, program_id: i64, limit: usize)
                  -> Result<Vec<CycleResult>, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT cycle_seq, timestamp, trigger_source, overall, \
             processing_time_ms, tool_results, per_stage_ms, error \
             FROM cycle_results WHERE program_id = ?1 \
             ORDER BY id DESC LIMIT ?2")
            .map_err(db_error)?;
        let rows = statement.query_map(
            params![program_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?, row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?, row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?, row.get::<_, Option<String>>(7)?))
            })
            .map_err(db_error)?;

        let mut results = Vec::new();
        for row in rows {
            let (cycle_seq, timestamp, trigger_source, overall,
                 processing_time_ms, tool_results, per_stage, error) =
                row.map_err(db_error)?;
            let tool_results: Vec<ToolResult> =
                serde_json::from_str(&tool_results)
                .map_err(|e| internal_error(&format!(
                    "corrupt cycle row: {}", e)))?;
            let per_stage_ms = serde_json::from_str(&per_stage)
                .map_err(|e| internal_error(&format!(
                    "corrupt cycle row: {}", e)))?;
            results.push(CycleResult {
                program_id,
                cycle_seq: cycle_seq as u64,
                timestamp: parse_timestamp(&timestamp).unwrap_or_else(Utc::now),
                trigger_source: parse_trigger_source(&trigger_source),
                overall: if overall == "OK" { Verdict::Ok } else { Verdict::Ng },
                tool_results,
                processing_time_ms,
                per_stage_ms,
                error,
            });
        }
        Ok(results)
    }

    pub fn statistics(&self, program_id: i64)
                      -> Result<Statistics, CanonicalError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT total, ok, ng, last_run_at FROM statistics \
             WHERE program_id = ?1",
            params![program_id], |row| {
                let last_run_at: Option<String> = row.get(3)?;
                Ok(Statistics {
                    total: row.get(0)?,
                    ok: row.get(1)?,
                    ng: row.get(2)?,
                    last_run_at: last_run_at.as_deref()
                        .and_then(parse_timestamp),
                })
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows =>
                    not_found_error(&format!("no program {}", program_id)),
                other => db_error(other),
            })
    }

    // Batched persistence target for the periodic diagnostics flusher. Only
    // a bounded history is kept.
    pub fn save_diagnostics_snapshot(&self, report_json: &str)
                                     -> Result<(), CanonicalError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO diagnostics_snapshots (timestamp, report) \
             VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), report_json])
            .map_err(db_error)?;
        conn.execute(
            "DELETE FROM diagnostics_snapshots WHERE id <= \
             (SELECT id FROM diagnostics_snapshots \
              ORDER BY id DESC LIMIT 1 OFFSET 1000)",
            [])
            .map_err(db_error)?;
        Ok(())
    }

    pub fn reset_statistics(&self, program_id: i64)
                            -> Result<(), CanonicalError> {
        self.guard_not_running(program_id)?;
        let updated = self.conn.lock().unwrap().execute(
            "UPDATE statistics SET total = 0, ok = 0, ng = 0, \
             last_run_at = NULL WHERE program_id = ?1",
            params![program_id])
            .map_err(db_error)?;
        if updated == 0 {
            return Err(not_found_error(&format!("no program {}", program_id)));
        }
        Ok(())
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use argus_elements::types::{BrightnessMode, CaptureSettings,
                                OutputsConfig, Roi, ToolConfig, ToolKind,
                                ToolParams, TriggerMode, DEFAULT_PULSE_MS};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;
    use super::*;

    fn test_program(name: &str) -> Program {
        Program {
            id: 0,
            name: name.to_string(),
            trigger: TriggerMode::Internal { period_ms: 100 },
            capture_settings: CaptureSettings {
                brightness_mode: BrightnessMode::Normal,
                focus: 50,
                resolution: (64, 64),
            },
            tools: vec![ToolConfig {
                id: 1,
                kind: ToolKind::Area,
                roi: Roi::new(24, 24, 16, 16),
                threshold: 90.0,
                upper_limit: Some(110.0),
                params: ToolParams {
                    threshold_override: Some(200),
                    ..Default::default()
                },
            }],
            outputs: OutputsConfig::default(),
            output_pulse_ms: DEFAULT_PULSE_MS,
            master_image_ref: None,
        }
    }

    fn test_image() -> RgbImage {
        let mut image = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
        for y in 24..40 {
            for x in 24..40 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        image
    }

    fn cycle_result(program_id: i64, cycle_seq: u64, overall: Verdict)
                    -> CycleResult {
        CycleResult {
            program_id,
            cycle_seq,
            timestamp: Utc::now(),
            trigger_source: TriggerSource::Internal,
            overall,
            tool_results: vec![],
            processing_time_ms: 42.0,
            per_stage_ms: BTreeMap::from([("capture".to_string(), 42.0)]),
            error: None,
        }
    }

    fn store() -> (TempDir, ProgramStore) {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_get_round_trip() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        assert!(created.id > 0);
        let fetched = store.get(created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(store.statistics(created.id).unwrap().total, 0);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, store) = store();
        store.create(test_program("alpha")).unwrap();
        assert!(store.create(test_program("alpha")).is_err());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let (_dir, store) = store();
        assert!(store.get(42).is_err());
    }

    #[test]
    fn test_update_guarded_while_running() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        store.mark_running(created.id);
        assert!(store.update(created.id, test_program("alpha")).is_err());
        assert!(store.delete(created.id).is_err());
        store.clear_running();
        assert!(store.update(created.id, test_program("alpha")).is_ok());
    }

    #[test]
    fn test_master_image_round_trip() {
        let (dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        let image = test_image();
        let upload = encode_lossless(&image).unwrap();

        let (reference, metrics) =
            store.write_master(created.id, &upload).unwrap();
        assert!(dir.path().join(&reference).exists());
        assert!(metrics.score > 0.0);

        let loaded = store.load_master(created.id).unwrap();
        assert_eq!(loaded.dimensions(), image.dimensions());
        assert_eq!(loaded.as_raw(), image.as_raw());

        // No leftover temp file after the atomic rename.
        assert!(!dir.path().join(format!(
            "masters/program_{}.png.tmp", created.id)).exists());
    }

    #[test]
    fn test_master_resolution_mismatch() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        let wrong = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        let upload = encode_lossless(&wrong).unwrap();
        assert!(store.write_master(created.id, &upload).is_err());
        assert!(store.load_master(created.id).is_err());
    }

    #[test]
    fn test_master_decode_failure() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        assert!(store.write_master(created.id, b"not an image").is_err());
    }

    #[test]
    fn test_update_preserves_master_reference() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        let upload = encode_lossless(&test_image()).unwrap();
        store.write_master(created.id, &upload).unwrap();

        let updated =
            store.update(created.id, test_program("renamed")).unwrap();
        assert!(updated.master_image_ref.is_some());
        assert!(store.load_master(created.id).is_ok());
    }

    #[test]
    fn test_append_updates_statistics_atomically() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        store.append_result(&cycle_result(created.id, 1, Verdict::Ok)).unwrap();
        store.append_result(&cycle_result(created.id, 2, Verdict::Ng)).unwrap();
        store.append_result(&cycle_result(created.id, 3, Verdict::Ok)).unwrap();

        let statistics = store.statistics(created.id).unwrap();
        assert_eq!(statistics.total, 3);
        assert_eq!(statistics.ok, 2);
        assert_eq!(statistics.ng, 1);
        assert_eq!(statistics.ok + statistics.ng, statistics.total);
        assert!(statistics.last_run_at.is_some());

        let recent = store.recent(created.id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].cycle_seq, 3);
        assert_eq!(recent[1].cycle_seq, 2);
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let (_dir, mut store_) = store();
        store_.set_max_results_per_program(5);
        let created = store_.create(test_program("alpha")).unwrap();
        for seq in 1..=8 {
            store_.append_result(
                &cycle_result(created.id, seq, Verdict::Ok)).unwrap();
        }
        let recent = store_.recent(created.id, 100).unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.first().unwrap().cycle_seq, 8);
        assert_eq!(recent.last().unwrap().cycle_seq, 4);
        // Statistics keep the full count; retention only trims history.
        assert_eq!(store_.statistics(created.id).unwrap().total, 8);
    }

    #[test]
    fn test_delete_removes_master_file() {
        let (dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        let upload = encode_lossless(&test_image()).unwrap();
        let (reference, _) = store.write_master(created.id, &upload).unwrap();
        assert!(dir.path().join(&reference).exists());

        store.delete(created.id).unwrap();
        assert!(!dir.path().join(&reference).exists());
        assert!(store.get(created.id).is_err());
    }

    #[test]
    fn test_reset_statistics() {
        let (_dir, store) = store();
        let created = store.create(test_program("alpha")).unwrap();
        store.append_result(&cycle_result(created.id, 1, Verdict::Ng)).unwrap();
        store.reset_statistics(created.id).unwrap();
        let statistics = store.statistics(created.id).unwrap();
        assert_eq!(statistics.total, 0);
        assert!(statistics.last_run_at.is_none());
    }
}  // mod tests.

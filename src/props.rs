//! Property sidecar (`props.json`) and the cell-overwrite store
//! (`overwrites.sqlite3`), per spec.md §4.3/§6.
//!
//! Both sidecars live under `<dirname>/.zsv/data/<filename>/`, keyed by the
//! input file's path, following `original_source/app/prop.c`'s
//! `zsv_cache_path`/`zsv_cache_filepath` layout. The SQLite access pattern
//! (`Connection`, `params!`, a prepared `SELECT ... ORDER BY`) follows
//! `examples/sec-view-DataLens/core/src/storage.rs`, the pack's only other
//! real-world `rusqlite` usage.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `<dirname>/.zsv/data/<filename>/`, created on first write.
pub fn sidecar_dir(input_path: &Path) -> PathBuf {
    let dir = input_path.parent().unwrap_or_else(|| Path::new("."));
    let name = input_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    dir.join(".zsv").join("data").join(name)
}

/// Persisted parsing options for one input file: `props.json`'s two known
/// keys. Unknown keys found on disk are preserved across a save (prop.c's
/// `merge_and_save_properties` merges rather than clobbers).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProperties {
    #[serde(rename = "header-row-span", skip_serializing_if = "Option::is_none")]
    pub header_row_span: Option<u32>,
    #[serde(rename = "skip-head", skip_serializing_if = "Option::is_none")]
    pub skip_head: Option<u32>,
    #[serde(flatten)]
    extra: std::collections::BTreeMap<String, Value>,
}

impl FileProperties {
    /// Build a `FileProperties` with just the two known keys set, no
    /// extra/unknown keys — the common case for a caller constructing one
    /// to save, as opposed to one loaded from disk.
    pub fn new(header_row_span: Option<u32>, skip_head: Option<u32>) -> Self {
        FileProperties { header_row_span, skip_head, extra: Default::default() }
    }

    fn path(input_path: &Path) -> PathBuf {
        sidecar_dir(input_path).join("props.json")
    }

    /// Load the sidecar for `input_path`. Absent file is equivalent to
    /// defaults (`Ok(FileProperties::default())`), not an error.
    pub fn load(input_path: &Path) -> std::io::Result<FileProperties> {
        let path = Self::path(input_path);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileProperties::default()),
            Err(e) => Err(e),
        }
    }

    /// Save, merging onto whatever is already on disk. Refuses to clobber
    /// an existing sidecar unless `overwrite` is set, mirroring
    /// `prop.c`'s `--save`/`--overwrite`/`-f` distinction.
    pub fn save(&self, input_path: &Path, overwrite: bool) -> std::io::Result<()> {
        let dir = sidecar_dir(input_path);
        let path = dir.join("props.json");
        if path.exists() && !overwrite {
            return Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, "props.json already exists"));
        }
        let mut merged = Self::load(input_path)?;
        if self.header_row_span.is_some() {
            merged.header_row_span = self.header_row_span;
        }
        if self.skip_head.is_some() {
            merged.skip_head = self.skip_head;
        }
        for (k, v) in &self.extra {
            merged.extra.insert(k.clone(), v.clone());
        }
        fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec_pretty(&merged).map_err(std::io::Error::other)?;
        fs::write(path, bytes)
    }

    /// Delete the whole sidecar directory (all of a file's cached data),
    /// mirroring `zsv_cache_remove`.
    pub fn remove(input_path: &Path) -> std::io::Result<()> {
        let dir = sidecar_dir(input_path);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `(row, col, value, timestamp?, author?)`, row 0 is the header row,
/// col is 0-based.
#[derive(Debug, Clone)]
pub struct OverwriteRecord {
    pub row: u64,
    pub col: u32,
    pub value: String,
    pub timestamp: Option<i64>,
    pub author: Option<String>,
}

/// `overwrites.sqlite3`'s one table.
pub struct OverwriteStore {
    conn: Connection,
}

impl OverwriteStore {
    pub fn path(input_path: &Path) -> PathBuf {
        sidecar_dir(input_path).join("overwrites.sqlite3")
    }

    /// Open (creating if necessary) the overwrite store for `input_path`.
    pub fn open(input_path: &Path) -> rusqlite::Result<OverwriteStore> {
        let dir = sidecar_dir(input_path);
        fs::create_dir_all(&dir).map_err(|e| rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some(e.to_string())))?;
        let conn = Connection::open(Self::path(input_path))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS overwrites (
                row INTEGER NOT NULL,
                column INTEGER NOT NULL,
                value TEXT NOT NULL,
                timestamp INTEGER,
                author TEXT
            )",
            [],
        )?;
        Ok(OverwriteStore { conn })
    }

    /// Open only if the sidecar file already exists; otherwise `Ok(None)`
    /// (a file with no overwrites applied is the common case).
    pub fn open_if_exists(input_path: &Path) -> rusqlite::Result<Option<OverwriteStore>> {
        if !Self::path(input_path).exists() {
            return Ok(None);
        }
        Self::open(input_path).map(Some)
    }

    pub fn put(&self, record: &OverwriteRecord) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO overwrites (row, column, value, timestamp, author) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![record.row, record.col, record.value, record.timestamp, record.author],
        )?;
        Ok(())
    }

    /// All records, ordered by `(row, column)` — the order the parser
    /// applies them in.
    pub fn all_ordered(&self) -> rusqlite::Result<Vec<OverwriteRecord>> {
        let mut stmt = self.conn.prepare("SELECT row, column, value, timestamp, author FROM overwrites ORDER BY row, column")?;
        let rows = stmt.query_map([], |r| {
            Ok(OverwriteRecord {
                row: r.get(0)?,
                col: r.get(1)?,
                value: r.get(2)?,
                timestamp: r.get(3)?,
                author: r.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// A monotonically-advancing cursor over this store's records, per
    /// spec.md §5: "if overwrite records are out of order, later records
    /// for already-passed `(row, col)` positions are silently dropped."
    pub fn cursor(&self) -> rusqlite::Result<OverwriteCursor> {
        Ok(OverwriteCursor { records: self.all_ordered()?, pos: 0 })
    }
}

/// Monotonic cursor over ordered overwrite records, consumed by
/// `ParserHandle::apply_overwrites`.
pub struct OverwriteCursor {
    records: Vec<OverwriteRecord>,
    pos: usize,
}

impl OverwriteCursor {
    pub fn peek(&self) -> Option<&OverwriteRecord> {
        self.records.get(self.pos)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }
}

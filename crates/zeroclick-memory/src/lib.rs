#![forbid(unsafe_code)]

//! Append-only shared memory for the pipeline: trust-tagged notes with a
//! topic-substring query. Two interchangeable backends expose the same
//! contract; which one backs a run is a configuration detail the rest of
//! the pipeline never observes.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use thiserror::Error;
use zeroclick_domain::{MemoryRecord, TrustLevel};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("memory store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("memory store sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("memory store serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Fields of a note before the store assigns its id.
#[derive(Debug, Clone)]
pub struct NoteInput {
    pub content: String,
    pub tags: Vec<String>,
    pub trust_level: TrustLevel,
    pub provenance: String,
    pub risk_flags: Vec<String>,
    pub created_at: String,
}

pub trait MemoryStore {
    /// Persist a note and return it with its assigned id. Ids are
    /// strictly increasing and 1-based per store.
    ///
    /// # Errors
    /// Returns `StoreError` when the underlying medium fails; such
    /// failures are fatal to a run.
    fn write_note(&mut self, note: NoteInput) -> Result<MemoryRecord, StoreError>;

    /// Case-insensitive substring match against content or any tag when
    /// `topic` is non-empty; all records when empty. Most-recent-first by
    /// id, truncated to `limit`.
    ///
    /// # Errors
    /// Returns `StoreError` when the underlying medium fails.
    fn query_notes(&self, topic: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError>;
}

const MEMORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  content TEXT NOT NULL,
  tags TEXT NOT NULL,
  trust_level TEXT NOT NULL CHECK (trust_level IN ('trusted','untrusted')),
  provenance TEXT NOT NULL,
  risk_flags TEXT NOT NULL,
  created_at TEXT NOT NULL
);
";

pub struct SqliteMemoryStore {
    conn: Connection,
}

impl SqliteMemoryStore {
    /// Open or create the memory database and apply the schema.
    ///
    /// # Errors
    /// Returns `StoreError` if the parent directory cannot be created or
    /// the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(MEMORY_SCHEMA)?;
        Ok(Self { conn })
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn write_note(&mut self, note: NoteInput) -> Result<MemoryRecord, StoreError> {
        self.conn.execute(
            "INSERT INTO memory (content, tags, trust_level, provenance, risk_flags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                note.content,
                serde_json::to_string(&note.tags)?,
                note.trust_level.as_str(),
                note.provenance,
                serde_json::to_string(&note.risk_flags)?,
                note.created_at,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(MemoryRecord {
            id,
            content: note.content,
            tags: note.tags,
            trust_level: note.trust_level,
            provenance: note.provenance,
            risk_flags: note.risk_flags,
            created_at: note.created_at,
        })
    }

    fn query_notes(&self, topic: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut out = Vec::new();

        if topic.is_empty() {
            let mut stmt = self
                .conn
                .prepare("SELECT * FROM memory ORDER BY id DESC LIMIT ?1")?;
            let mut rows = stmt.query(params![limit])?;
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
        } else {
            let like = format!("%{topic}%");
            let mut stmt = self.conn.prepare(
                "SELECT * FROM memory
                 WHERE content LIKE ?1 OR tags LIKE ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![like, limit])?;
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
        }

        Ok(out)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<MemoryRecord, StoreError> {
    let trust_raw: String = row.get("trust_level")?;
    let trust_level = parse_trust_level(&trust_raw)?;
    let tags_raw: String = row.get("tags")?;
    let risk_raw: String = row.get("risk_flags")?;
    Ok(MemoryRecord {
        id: row.get("id")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags_raw)?,
        trust_level,
        provenance: row.get("provenance")?,
        risk_flags: serde_json::from_str(&risk_raw)?,
        created_at: row.get("created_at")?,
    })
}

fn parse_trust_level(raw: &str) -> Result<TrustLevel, StoreError> {
    match raw {
        "trusted" => Ok(TrustLevel::Trusted),
        "untrusted" => Ok(TrustLevel::Untrusted),
        other => Err(StoreError::InvalidRecord(format!(
            "unknown trust_level '{other}'"
        ))),
    }
}

/// Flat append log, one JSON record per line. Ids are derived from the
/// current record count, which is why a store instance must not be shared
/// between concurrent runs.
pub struct JsonlMemoryStore {
    path: PathBuf,
}

impl JsonlMemoryStore {
    /// Open or create the backing log file.
    ///
    /// # Errors
    /// Returns `StoreError` if the file or its parent directory cannot be
    /// created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if !path.exists() {
            File::create(path)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_all(&self) -> Result<Vec<MemoryRecord>, StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

impl MemoryStore for JsonlMemoryStore {
    fn write_note(&mut self, note: NoteInput) -> Result<MemoryRecord, StoreError> {
        let count = self.read_all()?.len();
        let id = i64::try_from(count)
            .map_err(|_| StoreError::InvalidRecord("record count overflow".to_string()))?
            + 1;
        let record = MemoryRecord {
            id,
            content: note.content,
            tags: note.tags,
            trust_level: note.trust_level,
            provenance: note.provenance,
            risk_flags: note.risk_flags,
            created_at: note.created_at,
        };
        let mut handle = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(handle, "{}", serde_json::to_string(&record)?)?;
        Ok(record)
    }

    fn query_notes(&self, topic: &str, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        let mut records = self.read_all()?;
        if !topic.is_empty() {
            let lowered = topic.to_lowercase();
            records.retain(|record| {
                record.content.to_lowercase().contains(&lowered)
                    || record.tags.join(" ").to_lowercase().contains(&lowered)
            });
        }
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonlMemoryStore, MemoryStore, NoteInput, SqliteMemoryStore};
    use zeroclick_domain::TrustLevel;

    fn temp_path(name: &str, ext: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("zeroclick-memory-{name}-{}.{ext}", ulid::Ulid::new()))
    }

    fn note(content: &str, tags: &[&str], trust_level: TrustLevel) -> NoteInput {
        NoteInput {
            content: content.to_string(),
            tags: tags.iter().map(ToString::to_string).collect(),
            trust_level,
            provenance: "web_fixture:test_runbook.md".to_string(),
            risk_flags: Vec::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn assert_store_contract(store: &mut dyn MemoryStore) {
        for index in 1..=5_i64 {
            let written = store.write_note(note(
                &format!("diagnostics note {index}"),
                &["runbook", "diagnostics"],
                TrustLevel::Untrusted,
            ));
            assert!(written.is_ok());
            let written = written.unwrap_or_else(|_| unreachable!());
            assert_eq!(written.id, index);
        }

        let recent = store.query_notes("", 3);
        assert!(recent.is_ok());
        let recent = recent.unwrap_or_else(|_| unreachable!());
        let ids: Vec<i64> = recent.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);

        let matched = store.query_notes("DIAGNOSTICS NOTE 2", 10);
        assert!(matched.is_ok());
        let matched = matched.unwrap_or_else(|_| unreachable!());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, 2);

        // Tag matches participate via OR semantics.
        let by_tag = store.query_notes("runbook", 10);
        assert!(by_tag.is_ok());
        let by_tag = by_tag.unwrap_or_else(|_| unreachable!());
        assert_eq!(by_tag.len(), 5);

        let none = store.query_notes("no such topic", 10);
        assert!(none.is_ok());
        assert!(none.unwrap_or_else(|_| unreachable!()).is_empty());
    }

    #[test]
    fn sqlite_store_satisfies_query_contract() {
        let path = temp_path("sqlite", "db");
        let store = SqliteMemoryStore::open(&path);
        assert!(store.is_ok());
        let mut store = store.unwrap_or_else(|_| unreachable!());
        assert_store_contract(&mut store);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn jsonl_store_satisfies_query_contract() {
        let path = temp_path("jsonl", "jsonl");
        let store = JsonlMemoryStore::open(&path);
        assert!(store.is_ok());
        let mut store = store.unwrap_or_else(|_| unreachable!());
        assert_store_contract(&mut store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sqlite_round_trips_trust_and_flags() {
        let path = temp_path("roundtrip", "db");
        let store = SqliteMemoryStore::open(&path);
        assert!(store.is_ok());
        let mut store = store.unwrap_or_else(|_| unreachable!());

        let mut input = note("poisoned note", &["runbook"], TrustLevel::Trusted);
        input.risk_flags = vec!["TOKEN_WRITE_PWNED_FILE".to_string()];
        let written = store.write_note(input);
        assert!(written.is_ok());

        let fetched = store.query_notes("poisoned", 1);
        assert!(fetched.is_ok());
        let fetched = fetched.unwrap_or_else(|_| unreachable!());
        assert_eq!(fetched[0].trust_level, TrustLevel::Trusted);
        assert_eq!(fetched[0].risk_flags, vec!["TOKEN_WRITE_PWNED_FILE"]);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}

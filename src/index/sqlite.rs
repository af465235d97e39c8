//! `SQLite`-backed index.
//!
//! ```text
//! file      id, path, format, channel_ref, label
//! event     id, file_id -> file.id, begin_time, end_time, label
//! metadata  id -> file.id, frequency, channels (JSON array)
//! ```

use std::{collections::BTreeSet, path::Path};

use rusqlite::{Connection, params, params_from_iter};

use crate::model::{Event, RecordingFormat, SourceRecording};

use super::{ChannelSetFilter, EventFilter, IndexError, IndexStore, RecordingFilter, Result};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file (
        id          TEXT PRIMARY KEY,
        path        TEXT NOT NULL,
        format      TEXT NOT NULL,
        channel_ref TEXT NOT NULL,
        label       TEXT NOT NULL DEFAULT ''
    );
    CREATE TABLE IF NOT EXISTS event (
        id         TEXT NOT NULL,
        file_id    TEXT NOT NULL REFERENCES file(id),
        begin_time REAL NOT NULL,
        end_time   REAL NOT NULL,
        label      TEXT NOT NULL,
        PRIMARY KEY (file_id, id)
    );
    CREATE TABLE IF NOT EXISTS metadata (
        id        TEXT PRIMARY KEY REFERENCES file(id),
        frequency REAL NOT NULL,
        channels  TEXT NOT NULL
    );
";

/// An index stored in a single `SQLite` database.
pub struct SqliteIndex {
    conn: Connection,
}

impl std::fmt::Debug for SqliteIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIndex")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteIndex {
    /// Opens (creating if needed) the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let index = Self {
            conn: Connection::open(path)?,
        };
        index.migrate()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self> {
        let index = Self {
            conn: Connection::open_in_memory()?,
        };
        index.migrate()?;
        Ok(index)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(IndexError::Corrupt(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < 1 {
            self.conn.execute_batch(SCHEMA)?;
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        }
        Ok(())
    }

    // ── Writes ──

    pub fn insert_recording(&self, recording: &SourceRecording) -> Result<()> {
        let path = recording.path.to_str().ok_or_else(|| {
            IndexError::Corrupt(format!(
                "recording {} has a non UTF-8 path: {}",
                recording.id,
                recording.path.display()
            ))
        })?;
        self.conn.execute(
            "INSERT INTO file (id, path, format, channel_ref, label)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &recording.id,
                path,
                recording.format.as_str(),
                &recording.channel_ref,
                &recording.label,
            ],
        )?;
        Ok(())
    }

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO event (id, file_id, begin_time, end_time, label)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id(),
                event.file_id(),
                event.begin(),
                event.end(),
                event.label()
            ],
        )?;
        Ok(())
    }

    /// Records the sampling frequency and channel names of a recording.
    pub fn insert_metadata(&self, file_id: &str, frequency: f64, channels: &[&str]) -> Result<()> {
        let channels = serde_json::to_string(channels)
            .map_err(|e| IndexError::Corrupt(format!("unencodable channels: {e}")))?;
        self.conn.execute(
            "INSERT INTO metadata (id, frequency, channels) VALUES (?1, ?2, ?3)",
            params![file_id, frequency, channels],
        )?;
        Ok(())
    }
}

impl IndexStore for SqliteIndex {
    fn recordings_with_events(
        &self,
        filter: &EventFilter,
    ) -> Result<Vec<(SourceRecording, Event)>> {
        let sql = format!(
            "SELECT f.id, f.path, f.format, f.channel_ref, f.label,
                    e.id, e.begin_time, e.end_time, e.label
             FROM file f JOIN event e ON e.file_id = f.id
             WHERE f.format = ?1{}
             ORDER BY f.id, e.begin_time, e.id",
            exclusion_clause(filter.excluded_channel_refs.len(), 2)
        );
        let bound = std::iter::once(filter.format.as_str().to_string())
            .chain(filter.excluded_channel_refs.iter().cloned());

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(bound), |row| {
            Ok((
                RecordingRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    format: row.get(2)?,
                    channel_ref: row.get(3)?,
                    label: row.get(4)?,
                },
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            let (recording, event_id, begin, end, label) = row?;
            let recording = recording.into_recording()?;
            let event = Event::new(event_id, recording.id.clone(), begin, end, label)
                .map_err(|e| IndexError::Corrupt(e.to_string()))?;
            pairs.push((recording, event));
        }
        Ok(pairs)
    }

    fn recordings(&self, filter: RecordingFilter) -> Result<Vec<SourceRecording>> {
        let mut statement = self.conn.prepare(
            "SELECT id, path, format, channel_ref, label FROM file
             WHERE format = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map([filter.format.as_str()], |row| {
            Ok(RecordingRow {
                id: row.get(0)?,
                path: row.get(1)?,
                format: row.get(2)?,
                channel_ref: row.get(3)?,
                label: row.get(4)?,
            })
        })?;

        let mut recordings = Vec::new();
        for row in rows {
            recordings.push(row?.into_recording()?);
        }
        Ok(recordings)
    }

    fn distinct_channel_sets(&self, filter: &ChannelSetFilter) -> Result<Vec<BTreeSet<String>>> {
        let sql = format!(
            "SELECT DISTINCT m.channels
             FROM metadata m JOIN file f ON f.id = m.id
             WHERE 1 = 1{}
             ORDER BY m.channels",
            exclusion_clause(filter.excluded_channel_refs.len(), 1)
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(
            params_from_iter(filter.excluded_channel_refs.iter()),
            |row| row.get::<_, String>(0),
        )?;

        // The same set may be stored in different orders.
        let mut sets = BTreeSet::new();
        for row in rows {
            let json = row?;
            let channels: BTreeSet<String> = serde_json::from_str(&json)
                .map_err(|e| IndexError::Corrupt(format!("invalid channel list {json}: {e}")))?;
            sets.insert(channels);
        }
        Ok(sets.into_iter().collect())
    }

    fn min_frequency(&self) -> Result<Option<f64>> {
        Ok(self
            .conn
            .query_row("SELECT MIN(frequency) FROM metadata", [], |row| row.get(0))?)
    }
}

/// ` AND f.channel_ref NOT IN (?n, ...)` for `count` parameters starting at
/// `first`, or nothing when no montage is excluded.
fn exclusion_clause(count: usize, first: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let placeholders: Vec<String> = (first..first + count).map(|n| format!("?{n}")).collect();
    format!(" AND f.channel_ref NOT IN ({})", placeholders.join(", "))
}

/// A `file` row before its columns are checked.
struct RecordingRow {
    id: String,
    path: String,
    format: String,
    channel_ref: String,
    label: String,
}

impl RecordingRow {
    fn into_recording(self) -> Result<SourceRecording> {
        let format = self
            .format
            .parse::<RecordingFormat>()
            .map_err(|e| IndexError::Corrupt(format!("file {}: {e}", self.id)))?;
        Ok(SourceRecording {
            id: self.id,
            path: self.path.into(),
            format,
            channel_ref: self.channel_ref,
            label: self.label,
        })
    }
}

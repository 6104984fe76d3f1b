//! Embedded SQLite store for rescan progress.
use anyhow::Context;
use async_trait::async_trait;
use bitcoin::BlockHash;
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::PathBuf, str::FromStr};
use tokio::task;

use crate::store::Store;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS rescan_progress (
        id      INTEGER PRIMARY KEY CHECK (id = 0),
        height  INTEGER NOT NULL,
        hash    TEXT    NOT NULL
    );
"#;

/// Single-row table holding the last block the rescan connected:
///   rescan_progress(id = 0, height INTEGER, hash TEXT hex BlockHash)
///
/// Each call opens its own connection on a blocking thread.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("open sqlite at {}", path.display()))?;
            f(&conn)
        })
        .await
        .context("sqlite task panicked")?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_rescan_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>> {
        let row = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT height, hash FROM rescan_progress WHERE id = 0",
                    [],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .context("read rescan_progress")
            })
            .await?;

        row.map(|(height, hash)| {
            let hash = BlockHash::from_str(&hash).context("parse rescan_progress.hash")?;
            Ok((height, hash))
        })
        .transpose()
    }

    async fn save_rescan_tip(&self, height: u32, hash: BlockHash) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rescan_progress(id, height, hash) VALUES(0, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET height = excluded.height, hash = excluded.hash",
                params![height, hash.to_string()],
            )
            .with_context(|| format!("write rescan_progress @height {height}"))?;
            Ok(())
        })
        .await
    }
}

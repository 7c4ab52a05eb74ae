use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::ConnectOptions;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How long an index run waits for another process's run to finish.
pub const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Open (creating if needed) the index database in WAL mode.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    create_parent(db_path)?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// `<db_path>.lock`, the file that serializes writers across processes.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Take SQLite's exclusive lock on the database at `path`, waiting up to
/// `timeout` for a current holder. The lock lasts until the connection is
/// dropped; the OS releases it if the process dies.
pub async fn lock_exclusive(path: &Path, timeout: Duration) -> Result<SqliteConnection> {
    create_parent(path)?;

    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(timeout)
        .connect()
        .await
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;

    sqlx::query("BEGIN EXCLUSIVE")
        .execute(&mut conn)
        .await
        .with_context(|| format!("Another index run holds {}", path.display()))?;

    Ok(conn)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_is_sibling() {
        assert_eq!(
            lock_path(Path::new("/data/dix.sqlite")),
            PathBuf::from("/data/dix.sqlite.lock")
        );
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_second_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dix.sqlite.lock");

        let first = lock_exclusive(&path, Duration::from_secs(5)).await.unwrap();
        let second = lock_exclusive(&path, Duration::from_millis(100)).await;
        assert!(second.is_err());

        drop(first);
        assert!(lock_exclusive(&path, Duration::from_secs(5)).await.is_ok());
    }
}

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::{AppError, AppResult};

fn parent_of<'a>(path: &'a Path, role: &str) -> AppResult<&'a Path> {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| {
            AppError::new("SWAP/NO_PARENT", format!("{role} path does not have a parent directory"))
                .with_context("path", path.display().to_string())
        })
}

fn ensure_same_parent(live: &Path, other: &Path, role: &str) -> AppResult<()> {
    if parent_of(live, "Database")? != parent_of(other, role)? {
        return Err(AppError::new(
            "SWAP/DIFFERENT_PARENT",
            "Swap paths must share the same parent directory",
        )
        .with_context("live", live.display().to_string())
        .with_context(role.to_lowercase(), other.display().to_string()));
    }
    Ok(())
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

fn sync_path(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn remove_sidecars(live_path: &Path) -> io::Result<()> {
    remove_if_present(&with_suffix(live_path, "-wal"))?;
    remove_if_present(&with_suffix(live_path, "-shm"))
}

/// Sibling paths for an in-place repair of `live`: the file the repair
/// writes into and the name the damaged original is archived under.
pub fn in_place_paths(live: &Path) -> (PathBuf, PathBuf) {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    (
        with_suffix(live, ".repairing"),
        with_suffix(live, &format!(".pre-repair-{stamp}")),
    )
}

/// Replaces the live database file with `new_db`, keeping the original
/// under `archive_path`. All three paths must live in one directory.
///
/// On a failed promotion the original is moved back.
pub fn swap_database(live_path: &Path, new_db: &Path, archive_path: &Path) -> AppResult<()> {
    ensure_same_parent(live_path, new_db, "New")?;
    ensure_same_parent(live_path, archive_path, "Archive")?;
    let parent = parent_of(live_path, "Database")?;

    let io_err = |err: io::Error, op: &str, path: &Path| {
        AppError::from(err)
            .with_context("operation", op.to_string())
            .with_context("path", path.display().to_string())
    };

    sync_path(new_db).map_err(|err| io_err(err, "sync_new_db", new_db))?;
    remove_if_present(archive_path).map_err(|err| io_err(err, "remove_existing_archive", archive_path))?;
    fs::rename(live_path, archive_path).map_err(|err| io_err(err, "archive_live_db", live_path))?;
    remove_sidecars(live_path).map_err(|err| io_err(err, "remove_live_sidecars", live_path))?;

    if let Err(err) = fs::rename(new_db, live_path) {
        let _ = fs::rename(archive_path, live_path);
        return Err(io_err(err, "promote_new_db", new_db).with_context("to", live_path.display().to_string()));
    }
    sync_path(live_path).map_err(|err| io_err(err, "sync_live_db", live_path))?;
    sync_path(parent).map_err(|err| io_err(err, "sync_parent_dir", parent))?;

    tracing::info!(
        target: "repairkit",
        event = "database_swapped",
        live = %live_path.display(),
        archive = %archive_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn swap_promotes_new_db_and_archives_old() {
        let dir = tempdir().expect("tempdir");
        let live = dir.path().join("db.sqlite3");
        let (new, archive) = in_place_paths(&live);

        fs::write(&live, b"old").expect("live");
        fs::write(with_suffix(&live, "-wal"), b"stale").expect("wal");
        fs::write(&new, b"new").expect("new");

        swap_database(&live, &new, &archive).expect("swap succeeds");

        assert_eq!(fs::read(&live).expect("live"), b"new");
        assert_eq!(fs::read(&archive).expect("archive"), b"old");
        assert!(!new.exists());
        assert!(!with_suffix(&live, "-wal").exists());
    }

    #[test]
    fn swap_rejects_different_parents() {
        let dir = tempdir().expect("tempdir");
        let other = tempdir().expect("tempdir");
        let live = dir.path().join("db.sqlite3");
        let new = other.path().join("new.sqlite3");
        let archive = dir.path().join("pre-repair.sqlite3");

        fs::write(&live, b"old").expect("live");
        fs::write(&new, b"new").expect("new");

        let err = swap_database(&live, &new, &archive).expect_err("different parents rejected");
        assert_eq!(err.code(), "SWAP/DIFFERENT_PARENT");
        assert_eq!(fs::read(&live).expect("live"), b"old");
    }
}

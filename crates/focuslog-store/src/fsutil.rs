// ABOUTME: Crash-safe file helpers: write to a temp file, fsync, rename into place, fsync the directory.
// ABOUTME: Also copies and clears artifact files for snapshots and restores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Prefix of in-flight temp files. Readers ignore anything starting with it.
pub(crate) const TEMP_PREFIX: &str = ".pending-";

/// Atomically place `bytes` at `dir/file_name`.
pub(crate) fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    write_atomic_with(dir, file_name, bytes, |_| Ok(()))
}

/// Like [`write_atomic`], running `before_commit` after the temp file is
/// durable and before it is renamed. An error from the hook abandons the
/// write and the temp file is removed.
pub(crate) fn write_atomic_with<F>(
    dir: &Path,
    file_name: &str,
    bytes: &[u8],
    before_commit: F,
) -> io::Result<PathBuf>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    before_commit(tmp.path())?;

    let final_path = dir.join(file_name);
    tmp.persist(&final_path).map_err(|err| err.error)?;
    sync_dir(dir);
    Ok(final_path)
}

/// Fsync a directory so renames inside it survive a crash. Best-effort: the
/// rename already happened and the data is consistent either way.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

pub(crate) fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// Remove temp files left behind by an interrupted write.
pub(crate) fn remove_stale_temp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_str().is_some_and(is_temp_file) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Names of the regular files in `dir` accepted by `keep`, sorted.
pub(crate) fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && keep(name)
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Copy the named files from `src` into `dest`, fsyncing each copy.
pub(crate) fn copy_files(src: &Path, dest: &Path, names: &[String]) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for name in names {
        let target = dest.join(name);
        fs::copy(src.join(name), &target)?;
        fs::File::open(&target)?.sync_all()?;
    }
    sync_dir(dest);
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_places_file() {
        let dir = TempDir::new().unwrap();
        let path = write_atomic(dir.path(), "a.json", b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(list_files(dir.path(), is_temp_file).unwrap().is_empty());
    }

    #[test]
    fn failed_commit_leaves_no_file_under_final_name() {
        let dir = TempDir::new().unwrap();
        let result = write_atomic_with(dir.path(), "a.json", b"{}", |_| {
            Err(io::Error::other("simulated crash"))
        });
        assert!(result.is_err());
        assert!(!dir.path().join("a.json").exists());
        assert!(list_files(dir.path(), |_| true).unwrap().is_empty());
    }

    #[test]
    fn failed_commit_leaves_original_untouched() {
        let dir = TempDir::new().unwrap();
        write_atomic(dir.path(), "a.json", b"{\"version\":1}").unwrap();

        let result = write_atomic_with(dir.path(), "a.json", b"{\"version\":2}", |tmp| {
            assert!(tmp.exists());
            Err(io::Error::other("simulated crash"))
        });
        assert!(result.is_err());
        assert_eq!(
            fs::read(dir.path().join("a.json")).unwrap(),
            b"{\"version\":1}"
        );
        assert_eq!(list_files(dir.path(), |_| true).unwrap(), vec!["a.json"]);
        assert!(list_files(dir.path(), is_temp_file).unwrap().is_empty());
    }

    #[test]
    fn overwrite_replaces_whole_contents() {
        let dir = TempDir::new().unwrap();
        write_atomic(dir.path(), "a.json", b"first version").unwrap();
        write_atomic(dir.path(), "a.json", b"v2").unwrap();
        assert_eq!(fs::read(dir.path().join("a.json")).unwrap(), b"v2");
    }

    #[test]
    fn stale_temp_files_are_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".pending-abc.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("keep.json"), b"{}").unwrap();
        assert_eq!(remove_stale_temp_files(dir.path()).unwrap(), 1);
        assert_eq!(list_files(dir.path(), |_| true).unwrap(), vec!["keep.json"]);
    }

    #[test]
    fn copy_files_copies_named_files() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(src.path().join("one"), b"1").unwrap();
        fs::write(src.path().join("two"), b"2").unwrap();
        copy_files(src.path(), &dest.path().join("out"), &["two".to_string()]).unwrap();
        assert_eq!(
            list_files(&dest.path().join("out"), |_| true).unwrap(),
            vec!["two"]
        );
    }
}

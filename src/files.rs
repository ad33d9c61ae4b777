//! File operations confined to the project root.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{PirunError, Result};
use crate::path_guard::PathGuard;

/// Directory names omitted from listings alongside dotfiles.
const HIDDEN_NAMES: &[&str] = &["__pycache__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

/// One row of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub modtime: i64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    guard: PathGuard,
}

impl FileStore {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// List a directory: directories first, then files, each group by name.
    /// Dotfiles and cache directories are left out.
    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.guard.resolve(path)?;

        if !dir.exists() {
            return Err(PirunError::NotFound(path.to_string()));
        }
        if !dir.is_dir() {
            return Err(PirunError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }

            // Follows symlinks; a dangling link has nothing to show.
            let meta = match fs::metadata(entry.path()) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(name = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            let kind = if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            let modtime = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).timestamp())
                .unwrap_or(0);

            entries.push(FileEntry {
                name,
                size: if kind == EntryKind::File { meta.len() } else { 0 },
                modtime,
                kind,
            });
        }

        entries.sort_by(compare_entries);
        Ok(entries)
    }

    /// Read a regular file as UTF-8 text.
    pub fn read(&self, path: &str) -> Result<String> {
        let file = self.guard.resolve(path)?;

        if !file.exists() {
            return Err(PirunError::NotFound(path.to_string()));
        }
        if !file.is_file() {
            return Err(PirunError::NotAFile(path.to_string()));
        }

        let bytes = fs::read(&file)?;
        String::from_utf8(bytes).map_err(|_| PirunError::Decode(path.to_string()))
    }

    /// Write `content`, creating parent directories as needed. The file ends
    /// up with mode 0644.
    pub fn write(&self, path: &str, content: &str) -> Result<()> {
        let file = self.guard.resolve(path)?;

        if file.is_dir() {
            return Err(PirunError::IsADirectory(path.to_string()));
        }
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&file, content)?;
        set_file_mode(&file)?;

        info!(path = %self.guard.display_relative(&file), bytes = content.len(), "wrote file");
        Ok(())
    }

    /// Delete a regular file. Directories are refused.
    pub fn delete(&self, path: &str) -> Result<()> {
        let file = self.guard.resolve(path)?;

        if !file.exists() {
            return Err(PirunError::NotFound(path.to_string()));
        }
        if file.is_dir() {
            return Err(PirunError::IsADirectory(path.to_string()));
        }

        fs::remove_file(&file)?;
        info!(path = %self.guard.display_relative(&file), "deleted file");
        Ok(())
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || HIDDEN_NAMES.contains(&name)
}

fn compare_entries(a: &FileEntry, b: &FileEntry) -> Ordering {
    let rank = |e: &FileEntry| match e.kind {
        EntryKind::Dir => 0,
        EntryKind::File => 1,
    };
    rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
}

#[cfg(unix)]
fn set_file_mode(file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(file, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_file: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn store() -> (TempDir, FileStore) {
        let dir = tempdir().unwrap();
        let store = FileStore::new(PathGuard::new(dir.path()).unwrap());
        (dir, store)
    }

    #[test]
    fn write_then_read_creates_missing_parents() {
        let (_dir, store) = store();
        let content = "print('héllo')\n# ünïcode ✓\n";

        store.write("deep/nested/dir/script.py", content).unwrap();
        assert_eq!(store.read("deep/nested/dir/script.py").unwrap(), content);
    }

    #[test]
    fn write_replaces_existing_content() {
        let (_dir, store) = store();
        store.write("a.txt", "first version, longer").unwrap();
        store.write("a.txt", "second").unwrap();
        assert_eq!(store.read("a.txt").unwrap(), "second");
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_0644() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = store();
        store.write("perm.txt", "x").unwrap();

        let mode = fs::metadata(dir.path().join("perm.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn write_outside_root_is_rejected_without_side_effects() {
        let parent = tempdir().unwrap();
        let root = parent.path().join("root");
        fs::create_dir(&root).unwrap();
        let store = FileStore::new(PathGuard::new(&root).unwrap());

        let err = store.write("../escaped/file.txt", "nope").unwrap_err();
        assert!(matches!(err, PirunError::PathEscape(_)));
        assert!(!parent.path().join("escaped").exists());
    }

    #[test]
    fn list_orders_dirs_first_and_hides_dotfiles() {
        let (dir, store) = store();
        fs::create_dir(dir.path().join("zeta")).unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::create_dir(dir.path().join("__pycache__")).unwrap();
        fs::create_dir(dir.path().join(".venv")).unwrap();
        fs::write(dir.path().join("b.py"), "12345").unwrap();
        fs::write(dir.path().join("a.py"), "1").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();

        let entries = store.list("").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta", "a.py", "b.py"]);

        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[3].kind, EntryKind::File);
        assert_eq!(entries[3].size, 5);
        assert!(entries[3].modtime > 0);
    }

    #[test]
    fn hidden_files_stay_readable_by_explicit_path() {
        let (dir, store) = store();
        fs::write(dir.path().join(".env"), "KEY=value").unwrap();
        assert_eq!(store.read(".env").unwrap(), "KEY=value");
    }

    #[test]
    fn list_errors_on_missing_or_file() {
        let (dir, store) = store();
        fs::write(dir.path().join("file.txt"), "x").unwrap();

        assert!(matches!(store.list("missing"), Err(PirunError::NotFound(_))));
        assert!(matches!(
            store.list("file.txt"),
            Err(PirunError::NotADirectory(_))
        ));
        assert!(matches!(store.list("../"), Err(PirunError::PathEscape(_))));
    }

    #[test]
    fn read_errors_by_kind() {
        let (dir, store) = store();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00, 0x80]).unwrap();

        assert!(matches!(store.read("nope.txt"), Err(PirunError::NotFound(_))));
        assert!(matches!(store.read("sub"), Err(PirunError::NotAFile(_))));
        assert!(matches!(store.read("blob.bin"), Err(PirunError::Decode(_))));
    }

    #[test]
    fn delete_refuses_directories() {
        let (dir, store) = store();
        fs::create_dir(dir.path().join("keep")).unwrap();
        fs::write(dir.path().join("keep/inner.txt"), "x").unwrap();

        assert!(matches!(
            store.delete("keep"),
            Err(PirunError::IsADirectory(_))
        ));
        assert!(dir.path().join("keep/inner.txt").exists());
    }

    #[test]
    fn delete_removes_file() {
        let (_dir, store) = store();
        store.write("gone.py", "pass").unwrap();
        store.delete("gone.py").unwrap();

        assert!(matches!(store.read("gone.py"), Err(PirunError::NotFound(_))));
        assert!(matches!(store.delete("gone.py"), Err(PirunError::NotFound(_))));
    }
}

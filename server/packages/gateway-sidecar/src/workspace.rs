use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gateway_sidecar_error::SidecarError;

use crate::paths::{is_markdown, resolve_workspace_path};

/// Markdown documents the gateway reads as long-term memory and notes.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every `.md` file under the root as a slash-separated relative path.
    ///
    /// Entries that cannot be read are skipped rather than failing the listing.
    pub fn list(&self) -> Result<Vec<String>, SidecarError> {
        fs::create_dir_all(&self.root)
            .map_err(|err| SidecarError::io("failed to create workspace", &err))?;

        let mut files = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.root.clone());

        while let Some(dir) = queue.pop_front() {
            let Ok(read_dir) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    queue.push_back(path);
                    continue;
                }
                let name = entry.file_name();
                if !is_markdown(&name.to_string_lossy()) {
                    continue;
                }
                if let Some(relative) = relative_slash_path(&self.root, &path) {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, SidecarError> {
        let file = self.resolve(path)?;
        fs::read(&file).map_err(|err| match err.kind() {
            ErrorKind::NotFound => SidecarError::NotFound {
                resource: path.to_string(),
            },
            _ => SidecarError::io("failed to read document", &err),
        })
    }

    pub fn write(&self, path: &str, content: &[u8]) -> Result<(), SidecarError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| SidecarError::io("failed to create directory", &err))?;
        }
        fs::write(&file, content).map_err(|err| SidecarError::io("failed to write document", &err))
    }

    pub fn delete(&self, path: &str) -> Result<(), SidecarError> {
        let file = self.resolve(path)?;
        fs::remove_file(&file).map_err(|err| match err.kind() {
            ErrorKind::NotFound => SidecarError::NotFound {
                resource: path.to_string(),
            },
            _ => SidecarError::io("failed to delete document", &err),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SidecarError> {
        if path.is_empty() {
            return Err(SidecarError::invalid_request("missing path"));
        }
        if !is_markdown(path) {
            return Err(SidecarError::invalid_request("only .md files allowed"));
        }
        resolve_workspace_path(&self.root, path).ok_or_else(|| SidecarError::InvalidPath {
            path: path.to_string(),
        })
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() || parts.iter().any(|part| part == "..") {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, WorkspaceStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path().join("workspace"));
        (dir, store)
    }

    #[test]
    fn list_creates_root_and_starts_empty() {
        let (_dir, store) = store();
        assert!(store.list().expect("list").is_empty());
        assert!(store.root().is_dir());
    }

    #[test]
    fn write_read_delete_cycle() {
        let (_dir, store) = store();
        store
            .write("notes/today.md", b"# Today\n- ship it\n")
            .expect("write");
        assert_eq!(
            store.read("notes/today.md").expect("read"),
            b"# Today\n- ship it\n"
        );

        store.write("notes/today.md", b"replaced").expect("overwrite");
        assert_eq!(store.read("notes/today.md").expect("read"), b"replaced");

        store.delete("notes/today.md").expect("delete");
        assert!(matches!(
            store.read("notes/today.md"),
            Err(SidecarError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("notes/today.md"),
            Err(SidecarError::NotFound { .. })
        ));
    }

    #[test]
    fn list_returns_only_markdown_recursively() {
        let (_dir, store) = store();
        store.write("MEMORY.md", b"m").expect("write");
        store.write("a/b/deep.MD", b"d").expect("write");
        fs::write(store.root().join("a").join("skip.txt"), b"x").expect("write txt");

        assert_eq!(
            store.list().expect("list"),
            vec!["MEMORY.md".to_string(), "a/b/deep.MD".to_string()]
        );
    }

    #[test]
    fn rejects_non_markdown_and_traversal_before_touching_disk() {
        let (dir, store) = store();
        assert!(matches!(
            store.write("notes.txt", b"x"),
            Err(SidecarError::InvalidRequest { .. })
        ));
        assert!(matches!(
            store.write("../escape.md", b"x"),
            Err(SidecarError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.read("/etc/passwd.md"),
            Err(SidecarError::InvalidPath { .. })
        ));
        assert!(matches!(
            store.delete(""),
            Err(SidecarError::InvalidRequest { .. })
        ));
        assert!(!dir.path().join("escape.md").exists());
        assert!(!store.root().exists());
    }
}

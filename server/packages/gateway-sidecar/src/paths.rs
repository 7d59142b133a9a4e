//! Allow-listed resolution of persisted resources and workspace documents.
//!
//! Both resolvers are pure: they never touch the filesystem and reject
//! anything they cannot prove safe.

use std::fmt;
use std::path::{Component, Path, PathBuf};

pub const SESSION_KEY_MAX_LEN: usize = 256;
pub const WORKSPACE_DIR: &str = "workspace";

/// Conversation or channel key, e.g. `telegram:12345`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > SESSION_KEY_MAX_LEN {
            return None;
        }
        let allowed = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'));
        allowed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of logical names the persistence endpoints accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    CronJobs,
    State,
    Auth,
    Config,
    /// Virtual collection listing every stored session.
    Sessions,
    Session(SessionKey),
}

impl Resource {
    pub fn parse(logical: &str) -> Option<Self> {
        match logical {
            "cron/jobs.json" => Some(Self::CronJobs),
            "state/state.json" => Some(Self::State),
            "auth.json" => Some(Self::Auth),
            "config.json" => Some(Self::Config),
            "sessions" => Some(Self::Sessions),
            other => other
                .strip_prefix("sessions/")
                .and_then(SessionKey::parse)
                .map(Self::Session),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Sessions)
    }

    pub fn physical_path(&self, state_dir: &Path) -> PathBuf {
        match self {
            Self::CronJobs => state_dir.join("cron").join("jobs.json"),
            Self::State => state_dir.join("state").join("state.json"),
            Self::Auth => state_dir.join("auth.json"),
            Self::Config => state_dir.join("config.json"),
            Self::Sessions => state_dir.join("sessions"),
            Self::Session(key) => state_dir
                .join("sessions")
                .join(format!("{}.json", key.as_str())),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CronJobs => f.write_str("cron/jobs.json"),
            Self::State => f.write_str("state/state.json"),
            Self::Auth => f.write_str("auth.json"),
            Self::Config => f.write_str("config.json"),
            Self::Sessions => f.write_str("sessions"),
            Self::Session(key) => write!(f, "sessions/{key}"),
        }
    }
}

/// Maps a logical resource name to its file under `state_dir`.
pub fn resolve_resource(state_dir: &Path, logical: &str) -> Option<PathBuf> {
    Resource::parse(logical).map(|resource| resource.physical_path(state_dir))
}

/// Resolves a caller-supplied document path beneath `root`.
pub fn resolve_workspace_path(root: &Path, raw: &str) -> Option<PathBuf> {
    if raw.is_empty() || raw.contains("..") {
        return None;
    }
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return None;
    }

    let mut cleaned = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if cleaned.as_os_str().is_empty() {
        return None;
    }

    let resolved = root.join(&cleaned);
    let relative = resolved.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(resolved)
}

pub fn is_markdown(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_resources_map_to_state_dir() {
        let dir = Path::new("/data/.nanobot");
        assert_eq!(
            resolve_resource(dir, "cron/jobs.json"),
            Some(dir.join("cron/jobs.json"))
        );
        assert_eq!(
            resolve_resource(dir, "state/state.json"),
            Some(dir.join("state/state.json"))
        );
        assert_eq!(resolve_resource(dir, "auth.json"), Some(dir.join("auth.json")));
        assert_eq!(
            resolve_resource(dir, "config.json"),
            Some(dir.join("config.json"))
        );
        assert_eq!(resolve_resource(dir, "sessions"), Some(dir.join("sessions")));
    }

    #[test]
    fn session_keys_are_validated() {
        let dir = Path::new("/data/.nanobot");
        assert_eq!(
            resolve_resource(dir, "sessions/telegram:12345"),
            Some(dir.join("sessions").join("telegram:12345.json"))
        );
        assert!(SessionKey::parse("telegram:12345").is_some());
        assert!(SessionKey::parse("web_chat-01").is_some());
        assert!(SessionKey::parse("a/b").is_none());
        assert!(SessionKey::parse("").is_none());
        assert!(SessionKey::parse("key.json").is_none());
        assert!(SessionKey::parse(&"k".repeat(SESSION_KEY_MAX_LEN)).is_some());
        assert!(SessionKey::parse(&"k".repeat(300)).is_none());
        assert_eq!(resolve_resource(dir, "sessions/a/b"), None);
        assert_eq!(resolve_resource(dir, "sessions/"), None);
        assert_eq!(resolve_resource(dir, "sessions/../auth"), None);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let dir = Path::new("/data/.nanobot");
        for name in ["", "secrets.json", "../auth.json", "/auth.json", "cron", "Auth.json"] {
            assert_eq!(resolve_resource(dir, name), None, "{name} should be rejected");
        }
    }

    #[test]
    fn resource_display_round_trips_logical_name() {
        for name in ["cron/jobs.json", "auth.json", "sessions", "sessions/web:1"] {
            let resource = Resource::parse(name).expect("valid resource");
            assert_eq!(resource.to_string(), name);
        }
    }

    #[test]
    fn workspace_accepts_nested_documents() {
        let root = Path::new("/data/.nanobot/workspace");
        assert_eq!(
            resolve_workspace_path(root, "notes/today.md"),
            Some(root.join("notes/today.md"))
        );
        assert_eq!(
            resolve_workspace_path(root, "./memory/MEMORY.md"),
            Some(root.join("memory/MEMORY.md"))
        );
    }

    #[test]
    fn workspace_rejects_traversal_and_absolute_paths() {
        let root = Path::new("/data/.nanobot/workspace");
        for raw in [
            "",
            "../x.md",
            "notes/../../x.md",
            "notes/..",
            "/etc/passwd.md",
            ".",
            "./",
        ] {
            assert_eq!(resolve_workspace_path(root, raw), None, "{raw} should be rejected");
        }
    }

    #[test]
    fn markdown_suffix_is_case_insensitive() {
        assert!(is_markdown("README.MD"));
        assert!(is_markdown("notes/today.md"));
        assert!(!is_markdown("notes/today.txt"));
        assert!(!is_markdown("md"));
    }
}

//! The sandboxed virtual filesystem (spec §3/§4.C).
//!
//! Every path Ember code touches is mediated by an ordered mount table —
//! `(virtual_prefix, host_path, flags)` — so a script can never address the
//! host filesystem directly. Denials are logged and handed back to the
//! caller as `None`/`false`; the VFS itself never raises (§4.C: "VFS
//! operations never raise; callers observe denial via nil/false return
//! values").

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Read/write permission carried by a mount entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountFlags {
    pub read: bool,
    pub write: bool,
}

impl MountFlags {
    pub const RW: MountFlags = MountFlags { read: true, write: true };
    pub const RO: MountFlags = MountFlags { read: true, write: false };
}

#[derive(Debug, Clone)]
struct Mount {
    virtual_prefix: String,
    host_path: PathBuf,
    flags: MountFlags,
}

/// Why a VFS operation was denied — used only for the security log line,
/// never surfaced to Ember code as an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DenyReason {
    NoMount,
    ReadOnly,
    PathEscape,
    NotUtf8,
}

impl DenyReason {
    fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NoMount => "no mount covers this path",
            DenyReason::ReadOnly => "mount is read-only",
            DenyReason::PathEscape => "path escapes its mount after resolution",
            DenyReason::NotUtf8 => "virtual path is not valid utf-8",
        }
    }
}

fn log_denial(op: &str, virtual_path: &str, reason: DenyReason) {
    #[cfg(feature = "tracing")]
    {
        tracing::warn!(op, virtual_path, reason = reason.as_str(), "ember vfs: denied");
    }
    #[cfg(not(feature = "tracing"))]
    {
        eprintln!("ember vfs: denied {op} {virtual_path:?}: {}", reason.as_str());
    }
}

/// Mediates every filesystem access an Ember program performs.
pub struct Vfs {
    mounts: Vec<Mount>,
}

impl Vfs {
    /// Builds the default mount table: `/app` over the process's current
    /// working directory (RW) and `/tmp` over the host temp directory (RW),
    /// then appends whatever `EMBER_MOUNTS` adds on top, in declaration
    /// order (spec §4.C: "applied at VM init after defaults").
    pub fn new() -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let tmp = env::var_os("TMPDIR").map(PathBuf::from).unwrap_or_else(env::temp_dir);

        let mut vfs = Vfs {
            mounts: vec![
                Mount { virtual_prefix: "/app".to_string(), host_path: cwd, flags: MountFlags::RW },
                Mount { virtual_prefix: "/tmp".to_string(), host_path: tmp, flags: MountFlags::RW },
            ],
        };

        if let Ok(spec) = env::var("EMBER_MOUNTS") {
            vfs.apply_mounts_env(&spec);
        }
        vfs
    }

    /// Parses `EMBER_MOUNTS`, a `,`-separated list of
    /// `/virtual_prefix:/host_path[:ro]` entries, appending each as a new
    /// mount (later entries take priority over earlier ones / the defaults
    /// when prefixes overlap, since lookup is first-match-wins over mounts
    /// stored most-specific/most-recent first).
    fn apply_mounts_env(&mut self, spec: &str) {
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let virt = parts.next().filter(|s| !s.is_empty());
            let host = parts.next().filter(|s| !s.is_empty());
            let (virt, host) = match (virt, host) {
                (Some(v), Some(h)) => (v, h),
                _ => {
                    log_denial("mount", entry, DenyReason::NoMount);
                    continue;
                }
            };
            let flags = match parts.next() {
                Some("ro") => MountFlags::RO,
                _ => MountFlags::RW,
            };
            let prefix = normalize_prefix(virt);
            self.mounts.insert(
                0,
                Mount { virtual_prefix: prefix, host_path: PathBuf::from(host), flags },
            );
        }
    }

    /// The six-step resolution algorithm from spec §4.C:
    /// 1. require a leading `/` and valid utf-8,
    /// 2. reject any component that is empty, `.`, `..`, or holds a NUL,
    ///    newline, or other non-tab control character (no traversal, no
    ///    smuggled separators, ever),
    /// 3. find the longest mount prefix covering the path,
    /// 4. compute the path relative to that prefix,
    /// 5. join it onto the mount's host path,
    /// 6. canonicalize the joined path (or its nearest existing ancestor)
    ///    and re-verify it's still within the mount's canonical host root —
    ///    catches a symlink planted inside the mount that points outside it,
    ///    which a lexical check alone would miss.
    fn resolve(&self, virtual_path: &str, op: &str) -> Result<(PathBuf, MountFlags), ()> {
        if !virtual_path.starts_with('/') {
            log_denial(op, virtual_path, DenyReason::NoMount);
            return Err(());
        }
        let rest = &virtual_path[1..];
        if !rest.is_empty() {
            for component in rest.split('/') {
                let bad = component.is_empty()
                    || component == "."
                    || component == ".."
                    || component.chars().any(|c| c.is_control() && c != '\t');
                if bad {
                    log_denial(op, virtual_path, DenyReason::PathEscape);
                    return Err(());
                }
            }
        }

        let mount = self
            .mounts
            .iter()
            .filter(|m| virtual_path == m.virtual_prefix || virtual_path.starts_with(&format!("{}/", m.virtual_prefix)))
            .max_by_key(|m| m.virtual_prefix.len());

        let mount = match mount {
            Some(m) => m,
            None => {
                log_denial(op, virtual_path, DenyReason::NoMount);
                return Err(());
            }
        };

        let relative = virtual_path.strip_prefix(&mount.virtual_prefix).unwrap_or("").trim_start_matches('/');
        let joined = if relative.is_empty() { mount.host_path.clone() } else { mount.host_path.join(relative) };

        if !path_within(&joined, &mount.host_path) {
            log_denial(op, virtual_path, DenyReason::PathEscape);
            return Err(());
        }

        if !canonical_path_within(&joined, &mount.host_path) {
            log_denial(op, virtual_path, DenyReason::PathEscape);
            return Err(());
        }

        Ok((joined, mount.flags))
    }

    pub fn exists(&self, virtual_path: &str) -> bool {
        match self.resolve(virtual_path, "exists") {
            Ok((host, _)) => host.exists(),
            Err(()) => false,
        }
    }

    pub fn read_file(&self, virtual_path: &str) -> Option<Vec<u8>> {
        let (host, flags) = self.resolve(virtual_path, "read").ok()?;
        if !flags.read {
            log_denial("read", virtual_path, DenyReason::ReadOnly);
            return None;
        }
        fs::read(&host).ok()
    }

    pub fn write_file(&self, virtual_path: &str, contents: &[u8]) -> bool {
        let (host, flags) = match self.resolve(virtual_path, "write") {
            Ok(pair) => pair,
            Err(()) => return false,
        };
        if !flags.write {
            log_denial("write", virtual_path, DenyReason::ReadOnly);
            return false;
        }
        fs::write(&host, contents).is_ok()
    }

    pub fn remove_file(&self, virtual_path: &str) -> bool {
        let (host, flags) = match self.resolve(virtual_path, "remove") {
            Ok(pair) => pair,
            Err(()) => return false,
        };
        if !flags.write {
            log_denial("remove", virtual_path, DenyReason::ReadOnly);
            return false;
        }
        fs::remove_file(&host).is_ok()
    }

    pub fn create_dir(&self, virtual_path: &str) -> bool {
        let (host, flags) = match self.resolve(virtual_path, "mkdir") {
            Ok(pair) => pair,
            Err(()) => return false,
        };
        if !flags.write {
            log_denial("mkdir", virtual_path, DenyReason::ReadOnly);
            return false;
        }
        fs::create_dir_all(&host).is_ok()
    }

    pub fn list_dir(&self, virtual_path: &str) -> Option<Vec<String>> {
        let (host, flags) = self.resolve(virtual_path, "list").ok()?;
        if !flags.read {
            log_denial("list", virtual_path, DenyReason::ReadOnly);
            return None;
        }
        let entries = fs::read_dir(&host).ok()?;
        let mut names = Vec::new();
        for entry in entries.flatten() {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(_) => log_denial("list", virtual_path, DenyReason::NotUtf8),
            }
        }
        Some(names)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn path_within(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

/// Canonicalizes `candidate` (or its nearest existing ancestor, if the path
/// doesn't exist yet — it's about to be created) and checks the result is
/// still within `root`'s canonical form. Lexical containment alone can't
/// detect a symlink planted inside the mount that resolves outside it.
fn canonical_path_within(candidate: &Path, root: &Path) -> bool {
    let canonical_root = match fs::canonicalize(root) {
        Ok(p) => p,
        Err(_) => return true, // mount root doesn't exist on disk; nothing to escape into yet
    };
    let mut probe = candidate.to_path_buf();
    loop {
        match fs::canonicalize(&probe) {
            Ok(canonical) => return canonical == canonical_root || canonical.starts_with(&canonical_root),
            Err(_) => {
                if !probe.pop() {
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vfs_over(dir: &Path) -> Vfs {
        Vfs { mounts: vec![Mount { virtual_prefix: "/app".to_string(), host_path: dir.to_path_buf(), flags: MountFlags::RW }] }
    }

    #[test]
    fn traversal_is_denied() {
        let tmp = std::env::temp_dir();
        let vfs = vfs_over(&tmp);
        assert!(vfs.read_file("/app/../secret").is_none());
    }

    #[test]
    fn unmounted_prefix_is_denied() {
        let tmp = std::env::temp_dir();
        let vfs = vfs_over(&tmp);
        assert!(!vfs.exists("/etc/passwd"));
    }

    #[test]
    fn write_then_read_roundtrips_within_mount() {
        let dir = std::env::temp_dir().join(format!("ember-vfs-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let vfs = vfs_over(&dir);
        assert!(vfs.write_file("/app/hello.txt", b"hi"));
        assert_eq!(vfs.read_file("/app/hello.txt"), Some(b"hi".to_vec()));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn read_only_mount_denies_write() {
        let tmp = std::env::temp_dir();
        let vfs = Vfs { mounts: vec![Mount { virtual_prefix: "/app".to_string(), host_path: tmp, flags: MountFlags::RO }] };
        assert!(!vfs.write_file("/app/x.txt", b"nope"));
    }

    #[test]
    fn dotted_and_control_char_components_are_denied() {
        let tmp = std::env::temp_dir();
        let vfs = vfs_over(&tmp);
        assert!(vfs.read_file("/app/./secret").is_none());
        assert!(vfs.read_file("/app/a//b").is_none());
        assert!(vfs.read_file("/app/evil\0name").is_none());
        assert!(vfs.read_file("/app/evil\nname").is_none());
    }

    #[test]
    fn mounts_env_parses_comma_separated_entries() {
        let a = std::env::temp_dir().join(format!("ember-vfs-mounts-a-{}", std::process::id()));
        let b = std::env::temp_dir().join(format!("ember-vfs-mounts-b-{}", std::process::id()));
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        let mut vfs = Vfs { mounts: Vec::new() };
        vfs.apply_mounts_env(&format!("/data:{}, /ro:{}:ro", a.display(), b.display()));

        assert!(vfs.write_file("/data/x.txt", b"hi"));
        assert_eq!(vfs.read_file("/data/x.txt"), Some(b"hi".to_vec()));
        assert!(!vfs.write_file("/ro/x.txt", b"nope"));

        fs::remove_dir_all(&a).ok();
        fs::remove_dir_all(&b).ok();
    }

    #[test]
    fn mounts_env_ignores_malformed_entries() {
        let mut vfs = Vfs { mounts: Vec::new() };
        vfs.apply_mounts_env("not-a-valid-entry,,:missing-virtual");
        assert!(vfs.mounts.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_the_mount_is_denied() {
        use std::os::unix::fs::symlink;

        let root = std::env::temp_dir().join(format!("ember-vfs-symlink-{}", std::process::id()));
        let outside = std::env::temp_dir().join(format!("ember-vfs-outside-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"top secret").unwrap();
        symlink(&outside, root.join("escape")).unwrap();

        let vfs = vfs_over(&root);
        assert!(vfs.read_file("/app/escape/secret.txt").is_none());

        fs::remove_dir_all(&root).ok();
        fs::remove_dir_all(&outside).ok();
    }
}

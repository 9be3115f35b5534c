use super::patterns::{RiskLevel, SENSITIVE_PATH_SIGNATURES};
use crate::config::{FileSystemSecurityConfig, SecurityLevel};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Kind of filesystem access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Execute,
    List,
}

impl FileOperation {
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Write | Self::Create | Self::Delete)
    }

    fn checks_extension(self) -> bool {
        matches!(self, Self::Write | Self::Create | Self::Execute)
    }
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
            Self::Execute => write!(f, "execute"),
            Self::List => write!(f, "list"),
        }
    }
}

impl std::str::FromStr for FileOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "create" => Ok(Self::Create),
            "delete" => Ok(Self::Delete),
            "execute" => Ok(Self::Execute),
            "list" => Ok(Self::List),
            other => Err(format!("unknown file operation '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheckResult {
    pub allowed: bool,
    pub risk: RiskLevel,
    pub reasons: Vec<String>,
    /// Absolute path after `~` expansion and symlink resolution
    pub resolved_path: Option<PathBuf>,
}

impl FileCheckResult {
    fn deny(&mut self, risk: RiskLevel, reason: impl Into<String>) {
        self.allowed = false;
        self.warn(risk, reason);
    }

    fn warn(&mut self, risk: RiskLevel, reason: impl Into<String>) {
        self.risk = self.risk.max(risk);
        self.reasons.push(reason.into());
    }
}

#[derive(Debug, Clone)]
enum ForbiddenPath {
    Prefix(PathBuf),
    Glob(glob::Pattern),
}

/// Scores filesystem access against sandbox, allow/deny lists and the
/// sensitive path library.
#[derive(Debug, Clone)]
pub struct FileSystemGuard {
    level: SecurityLevel,
    sandbox_root: Option<PathBuf>,
    allowed_roots: Vec<PathBuf>,
    forbidden: Vec<ForbiddenPath>,
    blocked_extensions: Vec<String>,
}

impl Default for FileSystemGuard {
    fn default() -> Self {
        Self::from_config(&FileSystemSecurityConfig::default())
    }
}

impl FileSystemGuard {
    pub fn from_config(config: &FileSystemSecurityConfig) -> Self {
        let forbidden = config
            .forbidden_paths
            .iter()
            .filter_map(|raw| {
                if raw.contains(['*', '?', '[']) {
                    let expanded = shellexpand::tilde(raw);
                    match glob::Pattern::new(&expanded) {
                        Ok(pattern) => Some(ForbiddenPath::Glob(pattern)),
                        Err(e) => {
                            tracing::warn!(pattern = %raw, "Ignoring invalid forbidden path glob: {e}");
                            None
                        }
                    }
                } else {
                    Some(ForbiddenPath::Prefix(expand(raw)))
                }
            })
            .collect();

        Self {
            level: config.level,
            sandbox_root: config.sandbox_root.as_deref().map(expand),
            allowed_roots: config.allowed_roots.iter().map(|r| expand(r)).collect(),
            forbidden,
            blocked_extensions: config
                .blocked_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn sandbox_root(&self) -> Option<&Path> {
        self.sandbox_root.as_deref()
    }

    pub fn check(&self, path: &str, operation: FileOperation) -> FileCheckResult {
        let mut result = FileCheckResult {
            allowed: true,
            risk: RiskLevel::Low,
            reasons: Vec::new(),
            resolved_path: None,
        };

        if path.trim().is_empty() {
            result.deny(RiskLevel::Medium, "Empty path");
            return self.finish(result);
        }
        // Null bytes truncate paths in C-backed syscalls
        if path.contains('\0') {
            result.deny(RiskLevel::Critical, "Path contains a null byte");
            return self.finish(result);
        }
        if Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            result.deny(RiskLevel::High, "Path traversal (`..`) is not allowed");
            return self.finish(result);
        }
        let lower = path.to_lowercase();
        if lower.contains("..%2f") || lower.contains("%2f..") || lower.contains("..%5c") {
            result.deny(RiskLevel::High, "URL-encoded path traversal is not allowed");
            return self.finish(result);
        }

        let expanded = expand(path);
        let absolute = if expanded.is_absolute() {
            expanded.clone()
        } else if let Some(root) = &self.sandbox_root {
            root.join(&expanded)
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&expanded))
                .unwrap_or_else(|_| expanded.clone())
        };
        let resolved = resolve(&absolute);

        if let Some(root) = &self.sandbox_root {
            if !self.is_resolved_path_allowed(&resolved) {
                result.deny(
                    RiskLevel::High,
                    format!("Path resolves outside the sandbox root {}", root.display()),
                );
            }
        }

        if !self.allowed_roots.is_empty()
            && !self
                .allowed_roots
                .iter()
                .any(|root| resolved.starts_with(canonical(root)))
        {
            result.deny(RiskLevel::High, "Path is outside the allowed roots");
        }

        for forbidden in &self.forbidden {
            let hit = match forbidden {
                ForbiddenPath::Prefix(prefix) => {
                    absolute.starts_with(prefix) || resolved.starts_with(prefix)
                }
                ForbiddenPath::Glob(pattern) => {
                    pattern.matches_path(&absolute) || pattern.matches_path(&resolved)
                }
            };
            if hit {
                result.deny(RiskLevel::High, "Path is in a forbidden location");
                break;
            }
        }

        let display = absolute.to_string_lossy();
        let resolved_display = resolved.to_string_lossy();
        for signature in SENSITIVE_PATH_SIGNATURES.iter() {
            if signature.regex.is_match(&display) || signature.regex.is_match(&resolved_display) {
                let block = match self.level {
                    SecurityLevel::Strict => true,
                    SecurityLevel::Standard => operation.is_mutating(),
                    SecurityLevel::Permissive | SecurityLevel::Off => false,
                };
                let reason = format!("Sensitive location: {}", signature.description);
                if block {
                    result.deny(signature.risk, reason);
                } else {
                    result.warn(signature.risk, reason);
                }
            }
        }

        if operation.checks_extension() {
            if let Some(ext) = resolved.extension().and_then(|e| e.to_str()) {
                let ext = ext.to_ascii_lowercase();
                if self.blocked_extensions.contains(&ext) {
                    result.deny(
                        RiskLevel::High,
                        format!("Cannot {operation} files with extension .{ext}"),
                    );
                }
            }
        }

        if matches!(operation, FileOperation::Delete | FileOperation::Execute) {
            result.risk = result.risk.max(RiskLevel::Medium);
        }

        result.resolved_path = Some(resolved);
        self.finish(result)
    }

    pub fn is_allowed(&self, path: &str, operation: FileOperation) -> bool {
        self.check(path, operation).allowed
    }

    /// Whether an already canonicalized path stays inside the sandbox root
    /// (catches symlink escapes). Always true without a sandbox.
    pub fn is_resolved_path_allowed(&self, resolved: &Path) -> bool {
        match &self.sandbox_root {
            Some(root) => resolved.starts_with(canonical(root)),
            None => true,
        }
    }

    fn finish(&self, mut result: FileCheckResult) -> FileCheckResult {
        if self.level == SecurityLevel::Off {
            result.allowed = true;
        }
        result
    }
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Canonicalize the longest existing ancestor and re-append the rest, so
/// paths that do not exist yet still resolve through symlinked parents.
fn resolve(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            return tail
                .iter()
                .rev()
                .fold(real, |acc: PathBuf, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard(config: FileSystemSecurityConfig) -> FileSystemGuard {
        FileSystemGuard::from_config(&config)
    }

    fn sandboxed(root: &Path) -> FileSystemGuard {
        guard(FileSystemSecurityConfig {
            sandbox_root: Some(root.to_string_lossy().into_owned()),
            ..FileSystemSecurityConfig::default()
        })
    }

    #[test]
    fn traversal_and_null_bytes_rejected() {
        let g = FileSystemGuard::default();
        assert!(!g.is_allowed("../etc/passwd", FileOperation::Read));
        assert!(!g.is_allowed("docs/../../secret", FileOperation::Read));
        assert!(!g.is_allowed("..%2fsecret", FileOperation::Read));
        assert!(!g.is_allowed("file\0.txt", FileOperation::Read));
        assert!(!g.is_allowed("", FileOperation::Read));
    }

    #[test]
    fn forbidden_prefixes_blocked() {
        let g = FileSystemGuard::default();
        let result = g.check("/proc/self/environ", FileOperation::Read);
        assert!(!result.allowed);
        assert!(result.reasons[0].contains("forbidden"));
        // Component-aware: /processes is not under /proc
        assert!(g.is_allowed("/processes/x", FileOperation::Read));
    }

    #[test]
    fn forbidden_globs_blocked() {
        let g = guard(FileSystemSecurityConfig {
            forbidden_paths: vec!["/**/*.secret".into()],
            ..FileSystemSecurityConfig::default()
        });
        assert!(!g.is_allowed("/tmp/vault/api.secret", FileOperation::Read));
        assert!(g.is_allowed("/tmp/vault/api.txt", FileOperation::Read));
    }

    #[test]
    fn sensitive_paths_depend_on_level() {
        let g = FileSystemGuard::default();
        let read = g.check("~/.ssh/id_rsa", FileOperation::Read);
        assert!(read.allowed);
        assert_eq!(read.risk, RiskLevel::High);
        assert!(!g.is_allowed("~/.ssh/authorized_keys", FileOperation::Write));

        let strict = guard(FileSystemSecurityConfig {
            level: SecurityLevel::Strict,
            ..FileSystemSecurityConfig::default()
        });
        assert!(!strict.is_allowed("~/.ssh/id_rsa", FileOperation::Read));

        let permissive = guard(FileSystemSecurityConfig {
            level: SecurityLevel::Permissive,
            ..FileSystemSecurityConfig::default()
        });
        assert!(permissive.is_allowed("~/.ssh/authorized_keys", FileOperation::Write));
    }

    #[test]
    fn executable_extensions_blocked_for_writes() {
        let g = FileSystemGuard::default();
        assert!(!g.is_allowed("/tmp/payload.exe", FileOperation::Write));
        assert!(!g.is_allowed("/tmp/run.PS1", FileOperation::Execute));
        assert!(g.is_allowed("/tmp/payload.exe", FileOperation::Read));
    }

    #[test]
    fn sandbox_contains_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let g = sandboxed(tmp.path());
        let result = g.check("notes/today.md", FileOperation::Create);
        assert!(result.allowed, "{:?}", result.reasons);
        let resolved = result.resolved_path.unwrap();
        assert!(resolved.starts_with(tmp.path().canonicalize().unwrap()));
        assert!(resolved.ends_with("notes/today.md"));

        let outside = TempDir::new().unwrap();
        let path = outside.path().join("x.txt");
        assert!(!g.is_allowed(&path.to_string_lossy(), FileOperation::Read));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_detected() {
        let sandbox = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), sandbox.path().join("link")).unwrap();

        let g = sandboxed(sandbox.path());
        let result = g.check("link/secret.txt", FileOperation::Read);
        assert!(!result.allowed);
        assert!(result.reasons.iter().any(|r| r.contains("sandbox")));

        let escaped = outside.path().join("secret.txt").canonicalize().unwrap();
        assert!(!g.is_resolved_path_allowed(&escaped));
        assert!(FileSystemGuard::default().is_resolved_path_allowed(&escaped));
    }

    #[test]
    fn allowed_roots_restrict_paths() {
        let g = guard(FileSystemSecurityConfig {
            allowed_roots: vec!["/workspace".into()],
            ..FileSystemSecurityConfig::default()
        });
        assert!(g.is_allowed("/workspace/src/main.rs", FileOperation::Write));
        assert!(!g.is_allowed("/opt/other/file", FileOperation::Read));
    }

    #[test]
    fn delete_raises_risk() {
        let result = FileSystemGuard::default().check("/tmp/scratch.txt", FileOperation::Delete);
        assert!(result.allowed);
        assert_eq!(result.risk, RiskLevel::Medium);
    }

    #[test]
    fn level_off_allows_all() {
        let g = guard(FileSystemSecurityConfig {
            level: SecurityLevel::Off,
            ..FileSystemSecurityConfig::default()
        });
        let result = g.check("/proc/self/environ", FileOperation::Write);
        assert!(result.allowed);
        assert!(!result.reasons.is_empty());
        assert!(g.is_allowed("../up", FileOperation::Read));
    }

    #[test]
    fn operation_parses() {
        assert_eq!("WRITE".parse::<FileOperation>().unwrap(), FileOperation::Write);
        assert!("chmod".parse::<FileOperation>().is_err());
        assert!(FileOperation::Delete.is_mutating());
        assert!(!FileOperation::List.is_mutating());
    }
}

//! Static risk signature tables shared by the detectors and scorers.
//!
//! Raw tables are plain `&'static` arrays so they can be read and extended in
//! one place; the compiled forms are built once on first use.

use super::injection::InjectionType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Risk score shared by the command and filesystem scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    /// Never allowed, even with approval
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A compiled regex with its classification.
#[derive(Debug, Clone)]
pub struct Signature {
    pub id: &'static str,
    pub regex: Regex,
    pub risk: RiskLevel,
    pub description: &'static str,
}

/// A compiled injection signature.
#[derive(Debug, Clone)]
pub struct InjectionSignature {
    pub id: &'static str,
    pub injection_type: InjectionType,
    pub regex: Regex,
    pub confidence: f64,
    pub description: &'static str,
}

// ── Shell ────────────────────────────────────────────────────────────────────

/// Regex signature bank for shell commands: (id, pattern, risk, description).
pub const DANGEROUS_COMMAND_PATTERNS: &[(&str, &str, RiskLevel, &str)] = &[
    // Destructive filesystem
    ("rm-root", r"(?i)\brm\s+(-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|--recursive\s+--force|--force\s+--recursive)\s+(/|/\*|~|\$HOME)(\s|$)", RiskLevel::Critical, "Recursive delete of root or home"),
    ("mkfs", r"(?i)\bmkfs(\.[a-z0-9]+)?\b", RiskLevel::Critical, "Filesystem format"),
    ("dd-device", r"(?i)\bdd\s+.*\bof=/dev/", RiskLevel::Critical, "Raw write to a block device"),
    ("fork-bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", RiskLevel::Critical, "Fork bomb"),
    ("shred", r"(?i)\b(shred|wipefs)\s+", RiskLevel::High, "Secure erase"),
    ("fdisk", r"(?i)\b(fdisk|parted)\s+/dev/", RiskLevel::Critical, "Partition table edit"),
    ("rm-recursive", r"(?i)\brm\s+(-[a-z]*r[a-z]*|--recursive)\b", RiskLevel::High, "Recursive delete"),
    // Privilege escalation
    ("chmod-777", r"(?i)\bchmod\s+(-R\s+)?0?777\b", RiskLevel::High, "World-writable permissions"),
    ("chmod-setuid", r"(?i)\bchmod\s+[ug]?\+s\b", RiskLevel::High, "Setuid bit"),
    ("chown-root", r"(?i)\bchown\s+(-R\s+)?root\b", RiskLevel::High, "Ownership change to root"),
    // Remote code execution
    ("curl-pipe-shell", r"(?i)\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|k)?sh\b", RiskLevel::Critical, "Download piped into a shell"),
    ("reverse-shell-dev-tcp", r"(?i)/dev/(tcp|udp)/", RiskLevel::Critical, "Reverse shell via /dev/tcp"),
    ("interactive-bash", r"(?i)\bbash\s+-i\b", RiskLevel::High, "Interactive shell (reverse shell idiom)"),
    ("nc-listen", r"(?i)\b(nc|ncat|netcat)\s+(-[a-z]*[elp][a-z]*)", RiskLevel::High, "Netcat listener or exec"),
    ("inline-socket", r"(?i)\b(python[23]?|perl|ruby)\s+-[ce]\s+.*socket", RiskLevel::High, "Inline script opening a socket"),
    // System manipulation
    ("kill-init", r"(?i)\bkill\s+-9\s+1\b", RiskLevel::Critical, "Kill init"),
    ("sysctl-write", r"(?i)\bsysctl\s+-w\b", RiskLevel::High, "Kernel parameter change"),
    ("firewall", r"(?i)\b(iptables|nft|ufw|firewall-cmd)\b", RiskLevel::High, "Firewall change"),
    ("crontab-remove", r"(?i)\bcrontab\s+-r\b", RiskLevel::High, "Crontab removal"),
    // History and credential tampering
    ("history-clear", r"(?i)\b(history\s+-c|unset\s+HISTFILE|export\s+HISTSIZE=0)\b", RiskLevel::High, "Shell history tampering"),
    ("shadow-read", r"(?i)\bcat\s+/etc/(shadow|master\.passwd)\b", RiskLevel::High, "Password database read"),
    ("ssh-key-read", r"(?i)\bcat\s+\S*\.ssh/(id_[a-z0-9]+|authorized_keys)\b", RiskLevel::High, "SSH key read"),
    // Containers
    ("docker-privileged", r"(?i)\bdocker\s+run\b.*--privileged\b", RiskLevel::High, "Privileged container"),
    ("docker-root-mount", r"(?i)\bdocker\s+run\b.*-v\s+/:/", RiskLevel::High, "Host root mounted in container"),
    ("git-force-push", r"(?i)\bgit\s+push\b.*(--force\b|-f\b)", RiskLevel::Medium, "Force push"),
];

/// Base commands that need elevated privileges.
pub const PRIVILEGE_COMMANDS: &[&str] = &["sudo", "su", "doas", "pkexec", "runas"];

/// Base commands that talk to the network.
pub const NETWORK_COMMANDS: &[&str] = &[
    "curl", "wget", "nc", "ncat", "netcat", "ssh", "scp", "sftp", "ftp", "telnet", "rsync",
    "socat", "nmap",
];

/// Base commands that signal or replace running processes.
pub const PROCESS_COMMANDS: &[&str] = &["kill", "pkill", "killall", "xkill", "launchctl", "systemctl"];

/// Base commands that are high risk on their own. Privilege wrappers and
/// network clients are scored through their own flags instead.
pub const HIGH_RISK_COMMANDS: &[&str] = &[
    "rm", "mkfs", "dd", "shutdown", "reboot", "halt", "poweroff", "chown", "chmod", "useradd",
    "userdel", "usermod", "passwd", "mount", "umount", "iptables", "ufw", "firewall-cmd",
];

// ── Filesystem ───────────────────────────────────────────────────────────────

/// Sensitive path signatures: (id, pattern, risk, description).
pub const SENSITIVE_PATH_PATTERNS: &[(&str, &str, RiskLevel, &str)] = &[
    ("ssh-keys", r"(^|/)\.ssh(/|$)", RiskLevel::High, "SSH keys and config"),
    ("gnupg", r"(^|/)\.gnupg(/|$)", RiskLevel::High, "GnuPG keyring"),
    ("aws-credentials", r"(^|/)\.aws/(credentials|config)$", RiskLevel::High, "AWS credentials"),
    ("kube-config", r"(^|/)\.kube/config$", RiskLevel::High, "Kubernetes credentials"),
    ("docker-config", r"(^|/)\.docker/config\.json$", RiskLevel::High, "Docker registry credentials"),
    ("netrc", r"(^|/)\.(netrc|npmrc|pypirc)$", RiskLevel::High, "Package/registry tokens"),
    ("env-file", r"(^|/)\.env(\.[A-Za-z0-9_-]+)?$", RiskLevel::Medium, "Environment secrets file"),
    ("private-key", r"\.(pem|key|p12|pfx|jks)$", RiskLevel::High, "Private key material"),
    ("etc-shadow", r"^/etc/(shadow|gshadow|sudoers)(\.d)?(/|$)", RiskLevel::Critical, "System credential database"),
    ("etc-passwd", r"^/etc/passwd$", RiskLevel::Medium, "Account database"),
    ("browser-profile", r"(?i)(Library/Application Support/(Google/Chrome|Firefox)|\.mozilla/firefox|\.config/google-chrome)(/|$)", RiskLevel::High, "Browser profile (cookies, saved passwords)"),
    ("keychain", r"(?i)Library/Keychains(/|$)", RiskLevel::Critical, "macOS keychain"),
    ("crypto-wallet", r"(^|/)\.(bitcoin|ethereum|solana|monero)(/|$)", RiskLevel::Critical, "Cryptocurrency wallet"),
    ("shell-rc", r"(^|/)\.(bashrc|zshrc|profile|bash_profile)$", RiskLevel::Medium, "Shell startup file"),
    ("system-binaries", r"^/(usr/)?s?bin(/|$)", RiskLevel::High, "System binaries"),
];

/// Extensions that should never be written by the agent unless explicitly allowed.
pub const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "msi", "ps1", "vbs", "dll", "so", "dylib", "app",
];

/// Paths blocked by default regardless of security level.
pub const DEFAULT_FORBIDDEN_PATHS: &[&str] = &["/boot", "/dev", "/proc", "/sys"];

// ── Injection ────────────────────────────────────────────────────────────────

/// Injection signatures: (id, type, pattern, confidence, description).
pub const INJECTION_PATTERNS: &[(&str, InjectionType, &str, f64, &str)] = &[
    // Prompt injection
    ("prompt-ignore-previous", InjectionType::PromptInjection, r"(?i)\bignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules|directions)", 0.95, "Instruction override"),
    ("prompt-disregard", InjectionType::PromptInjection, r"(?i)\b(disregard|forget)\s+((all|any)\s+)?((your|the)\s+)?((previous|prior|earlier)\s+)?(instructions|rules|guidelines|directives)\b|\bforget\s+everything\s+you\s+(were|have\s+been)\s+told", 0.85, "Instruction override"),
    ("prompt-reveal-system", InjectionType::PromptInjection, r"(?i)\b(reveal|show|print|output|repeat|leak)\s+(me\s+)?(the\s+|your\s+)?(system|hidden|initial)\s+(prompt|instructions)", 0.9, "System prompt extraction"),
    ("prompt-role-marker", InjectionType::PromptInjection, r"(?i)(<\|im_start\|>|<\|system\|>|\[/?(system|inst)\]|###\s*system\s*:)", 0.9, "Chat template role marker"),
    ("prompt-new-instructions", InjectionType::PromptInjection, r"(?i)\bnew\s+(system\s+)?instructions\s*:", 0.8, "Injected instruction block"),
    ("prompt-persona-switch", InjectionType::PromptInjection, r"(?i)\byou\s+are\s+now\s+(a|an|in|the)\b", 0.7, "Persona switch"),
    ("prompt-jailbreak", InjectionType::PromptInjection, r"(?i)\b(jailbreak|DAN\s+mode|developer\s+mode\s+enabled)\b", 0.8, "Jailbreak keyword"),
    ("prompt-pretend", InjectionType::PromptInjection, r"(?i)\bpretend\s+(to\s+be|you\s+are)\b", 0.55, "Role play request"),
    // Command injection
    ("cmd-substitution", InjectionType::CommandInjection, r"\$\([^)]*\)", 0.85, "Command substitution"),
    ("cmd-backtick", InjectionType::CommandInjection, r"`[^`]+`", 0.8, "Backtick substitution"),
    ("cmd-chained-destructive", InjectionType::CommandInjection, r"(?i)(;|&&|\|\|)\s*(rm|curl|wget|nc|ncat|bash|sh|zsh|chmod|chown|sudo|mkfs|dd|python[23]?|perl)\b", 0.85, "Chained dangerous command"),
    ("cmd-pipe-shell", InjectionType::CommandInjection, r"(?i)\|\s*(sudo\s+)?(ba|z|k)?sh\b", 0.85, "Output piped into a shell"),
    ("cmd-variable-expansion", InjectionType::CommandInjection, r"\$\{[^}]*\}", 0.6, "Variable expansion"),
    // Path traversal
    ("path-dotdot", InjectionType::PathTraversal, r"(\.\./|\.\.\\)", 0.8, "Parent directory traversal"),
    ("path-encoded", InjectionType::PathTraversal, r"(?i)(%2e%2e(%2f|%5c|/)|\.\.%2f|%252e%252e)", 0.9, "Encoded traversal"),
    ("path-null-byte", InjectionType::PathTraversal, r"(%00|\x00)", 0.85, "Null byte truncation"),
    // SQL injection
    ("sql-tautology", InjectionType::SqlInjection, r"(?i)'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+", 0.8, "Boolean tautology"),
    ("sql-union-select", InjectionType::SqlInjection, r"(?i)\bunion\s+(all\s+)?select\b", 0.85, "UNION SELECT"),
    ("sql-stacked-drop", InjectionType::SqlInjection, r"(?i);\s*(drop|truncate|delete\s+from|alter)\s+(table|database)?", 0.9, "Stacked destructive statement"),
    ("sql-comment-terminator", InjectionType::SqlInjection, r"'\s*(--|#|/\*)", 0.65, "Quote followed by comment"),
    // Script injection
    ("script-tag", InjectionType::ScriptInjection, r"(?i)<\s*script\b", 0.9, "Script tag"),
    ("script-javascript-url", InjectionType::ScriptInjection, r"(?i)\bjavascript\s*:", 0.8, "javascript: URL"),
    ("script-event-handler", InjectionType::ScriptInjection, r#"(?i)<[^>]+\bon(error|load|click|mouseover|focus)\s*=\s*['"]?"#, 0.8, "Inline event handler"),
    ("script-document-cookie", InjectionType::ScriptInjection, r"(?i)\bdocument\.(cookie|domain)\b", 0.75, "Cookie access"),
    // Data exfiltration
    ("exfil-curl-upload", InjectionType::DataExfiltration, r"(?i)\b(curl|wget)\b.*(\s-d\s*@|--data(-binary)?\s*@|-F\s+\S*=@|--upload-file|--post-file)", 0.85, "File upload via HTTP client"),
    ("exfil-encode-send", InjectionType::DataExfiltration, r"(?i)\b(base64|xxd|od)\b.*\|\s*(curl|wget|nc|ncat)\b", 0.9, "Encode then send"),
    ("exfil-credential-send", InjectionType::DataExfiltration, r"(?i)(\.ssh/id_|\.aws/credentials|/etc/shadow).*\|\s*(curl|wget|nc)\b", 0.95, "Credential file piped to network"),
    ("exfil-send-to-url", InjectionType::DataExfiltration, r"(?i)\b(send|upload|post|forward)\b.{0,40}\b(password|credentials|api[_ ]?key|secret|token)s?\b.{0,40}https?://", 0.75, "Secrets sent to a URL"),
];

// ── Tools ────────────────────────────────────────────────────────────────────

/// Keywords that make a tool's action segment dangerous.
pub const DANGEROUS_ACTION_KEYWORDS: &[&str] = &[
    "delete", "remove", "rm", "exec", "execute", "eval", "run", "shell", "sudo", "kill",
    "format", "drop", "truncate", "destroy", "wipe", "install", "uninstall", "spawn", "chmod",
    "chown", "write", "overwrite",
];

/// Names that are never acceptable as a whole tool name.
pub const FORBIDDEN_TOOL_NAMES: &[&str] = &["eval", "exec", "system", "shell", "spawn"];

// ── Compiled tables ──────────────────────────────────────────────────────────

fn compile_signatures(table: &[(&'static str, &'static str, RiskLevel, &'static str)]) -> Vec<Signature> {
    table
        .iter()
        .filter_map(|&(id, pattern, risk, description)| match Regex::new(pattern) {
            Ok(regex) => Some(Signature {
                id,
                regex,
                risk,
                description,
            }),
            Err(e) => {
                tracing::warn!(id, "Skipping invalid signature: {e}");
                None
            }
        })
        .collect()
}

pub static COMMAND_SIGNATURES: LazyLock<Vec<Signature>> =
    LazyLock::new(|| compile_signatures(DANGEROUS_COMMAND_PATTERNS));

pub static SENSITIVE_PATH_SIGNATURES: LazyLock<Vec<Signature>> =
    LazyLock::new(|| compile_signatures(SENSITIVE_PATH_PATTERNS));

pub static INJECTION_SIGNATURES: LazyLock<Vec<InjectionSignature>> = LazyLock::new(|| {
    INJECTION_PATTERNS
        .iter()
        .filter_map(|&(id, injection_type, pattern, confidence, description)| {
            match Regex::new(pattern) {
                Ok(regex) => Some(InjectionSignature {
                    id,
                    injection_type,
                    regex,
                    confidence,
                    description,
                }),
                Err(e) => {
                    tracing::warn!(id, "Skipping invalid injection signature: {e}");
                    None
                }
            }
        })
        .collect()
});

/// Last path component of a command word, lowercased (`/usr/bin/Git` → `git`).
pub fn base_command(word: &str) -> String {
    word.rsplit('/').next().unwrap_or("").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_entry_compiles() {
        assert_eq!(COMMAND_SIGNATURES.len(), DANGEROUS_COMMAND_PATTERNS.len());
        assert_eq!(SENSITIVE_PATH_SIGNATURES.len(), SENSITIVE_PATH_PATTERNS.len());
        assert_eq!(INJECTION_SIGNATURES.len(), INJECTION_PATTERNS.len());
    }

    #[test]
    fn signature_ids_are_unique() {
        let mut ids: Vec<&str> = DANGEROUS_COMMAND_PATTERNS.iter().map(|p| p.0).collect();
        ids.extend(SENSITIVE_PATH_PATTERNS.iter().map(|p| p.0));
        ids.extend(INJECTION_PATTERNS.iter().map(|p| p.0));
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn confidences_are_probabilities() {
        for (id, _, _, confidence, _) in INJECTION_PATTERNS {
            assert!(
                (0.0..=1.0).contains(confidence),
                "confidence out of range for {id}"
            );
        }
    }

    #[test]
    fn base_command_strips_path() {
        assert_eq!(base_command("/usr/bin/Git"), "git");
        assert_eq!(base_command("ls"), "ls");
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }
}

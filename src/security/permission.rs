use super::context::{ExecutionContext, PermissionLevel, ToolCategory};
use super::error::{Result, SecurityError};
use crate::config::PermissionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ── Rules ────────────────────────────────────────────────────────────────────

/// What a rule matches against the context's target string.
///
/// Serialized as `{ literal = "..." }` or `{ regex = '...' }`; regexes are
/// compiled when the config is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RulePatternRepr", into = "RulePatternRepr")]
pub enum RulePattern {
    /// Substring match
    Literal(String),
    Regex(Regex),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RulePatternRepr {
    Literal(String),
    Regex(String),
}

impl TryFrom<RulePatternRepr> for RulePattern {
    type Error = SecurityError;

    fn try_from(repr: RulePatternRepr) -> Result<Self> {
        match repr {
            RulePatternRepr::Literal(s) => Ok(Self::Literal(s)),
            RulePatternRepr::Regex(s) => Self::regex(&s),
        }
    }
}

impl From<RulePattern> for RulePatternRepr {
    fn from(pattern: RulePattern) -> Self {
        match pattern {
            RulePattern::Literal(s) => Self::Literal(s),
            RulePattern::Regex(re) => Self::Regex(re.as_str().to_string()),
        }
    }
}

impl RulePattern {
    pub fn literal(s: impl Into<String>) -> Self {
        Self::Literal(s.into())
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|source| SecurityError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn is_match(&self, target: &str) -> bool {
        match self {
            Self::Literal(s) => target.contains(s.as_str()),
            Self::Regex(re) => re.is_match(target),
        }
    }
}

impl std::fmt::Display for RulePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "\"{s}\""),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub pattern: RulePattern,
    /// Only applies to contexts of this category when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
    /// Only applies to these actions (case-insensitive) when non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    pub permission: PermissionLevel,
    #[serde(default)]
    pub reason: String,
    /// Highest priority among matching rules wins
    #[serde(default)]
    pub priority: i32,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, pattern: RulePattern, permission: PermissionLevel) -> Self {
        Self {
            id: id.into(),
            pattern,
            category: None,
            actions: Vec::new(),
            permission,
            reason: String::new(),
            priority: 0,
        }
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| (*a).to_string()).collect();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn applies_to(&self, context: &ExecutionContext) -> bool {
        if self.category.is_some_and(|c| c != context.category) {
            return false;
        }
        if !self.actions.is_empty()
            && !self
                .actions
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&context.action))
        {
            return false;
        }
        self.pattern.is_match(context.match_target())
    }
}

fn default_true() -> bool {
    true
}

/// Named, ordered group of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Not used for rule selection; only rule priorities are compared.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PermissionPolicy {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            priority: 0,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Baseline rules loaded before any configured policy.
    pub fn builtin() -> Self {
        let rule = |id: &str, pattern: &str, level: PermissionLevel| {
            let pattern = match RulePattern::regex(pattern) {
                Ok(p) => p,
                // Static patterns; an inert rule is left in place if one ever fails to compile.
                Err(e) => {
                    tracing::error!(rule = id, "Invalid builtin rule pattern: {e}");
                    RulePattern::literal("\u{0}never\u{0}")
                }
            };
            PolicyRule::new(id, pattern, level)
        };

        Self::new("builtin", "Built-in safety rules")
            .with_description("Denies catastrophic commands and asks before privileged or destructive ones")
            .with_rule(
                rule("deny-rm-root", r"\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*\s+)+(/|/\*)(\s|$)", PermissionLevel::Deny)
                    .with_category(ToolCategory::Shell)
                    .with_reason("Recursive delete of the root filesystem")
                    .with_priority(100),
            )
            .with_rule(
                rule("deny-fork-bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", PermissionLevel::Deny)
                    .with_category(ToolCategory::Shell)
                    .with_reason("Fork bomb")
                    .with_priority(100),
            )
            .with_rule(
                rule("deny-system-config-write", r"^/(etc|boot)(/|$)", PermissionLevel::Deny)
                    .with_category(ToolCategory::File)
                    .with_actions(&["write", "create", "delete", "move", "rename", "append"])
                    .with_reason("Writes to system configuration")
                    .with_priority(100),
            )
            .with_rule(
                rule("prompt-sudo", r"(^|[;&|]\s*)sudo\s", PermissionLevel::Prompt)
                    .with_category(ToolCategory::Shell)
                    .with_reason("Privileged command")
                    .with_priority(50),
            )
            .with_rule(
                rule("prompt-download-exec", r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b", PermissionLevel::Prompt)
                    .with_category(ToolCategory::Shell)
                    .with_reason("Downloaded script piped into a shell")
                    .with_priority(50),
            )
            .with_rule(
                rule("prompt-file-delete", r".*", PermissionLevel::Prompt)
                    .with_category(ToolCategory::File)
                    .with_actions(&["delete", "remove"])
                    .with_reason("File deletion")
                    .with_priority(50),
            )
            .with_rule(
                rule(
                    "allow-ai-readonly",
                    r"(?i)^(analy[sz]e|summari[sz]e|describe|classify|explain|chat|complete|embed)\b",
                    PermissionLevel::Allow,
                )
                .with_category(ToolCategory::Ai)
                .with_reason("Read-only model call")
                .with_priority(10),
            )
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Cached confirmation for one cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPermission {
    pub tool_id: String,
    pub category: ToolCategory,
    pub level: PermissionLevel,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
}

impl ToolPermission {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Which step of the resolution produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Cache,
    Session,
    Rule,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub allowed: bool,
    /// Final level after any confirmation
    pub level: PermissionLevel,
    /// The verdict was `prompt` (whether or not it was confirmed)
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<String>,
    pub cached: bool,
    pub decided_by: DecisionSource,
}

impl PermissionResult {
    fn new(level: PermissionLevel, decided_by: DecisionSource) -> Self {
        Self {
            allowed: level == PermissionLevel::Allow,
            level,
            requires_confirmation: false,
            reason: None,
            matched_rule: None,
            matched_policy: None,
            cached: decided_by == DecisionSource::Cache,
            decided_by,
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Convert a denial into an error for callers that want `?`.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(SecurityError::PermissionDenied {
                level: self.level,
                reason: self
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            })
        }
    }
}

// ── Confirmation ─────────────────────────────────────────────────────────────

/// Asks a human whether a `prompt` verdict may proceed.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, context: &ExecutionContext) -> bool;
}

/// Always answers the same way. Useful for tests and unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticConfirmation(pub bool);

#[async_trait]
impl ConfirmationHandler for StaticConfirmation {
    async fn confirm(&self, _context: &ExecutionContext) -> bool {
        self.0
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tool_id: String,
    category: ToolCategory,
    action: String,
    target: String,
}

impl CacheKey {
    fn of(context: &ExecutionContext) -> Self {
        Self {
            tool_id: context.tool_id.clone(),
            category: context.category,
            action: context.action.clone(),
            target: context.match_target().to_string(),
        }
    }
}

struct RuleMatch {
    level: PermissionLevel,
    rule_id: String,
    policy_id: String,
    reason: String,
}

/// Evaluates policies, caches confirmations and tracks session grants.
pub struct PermissionManager {
    default_level: PermissionLevel,
    max_cached: usize,
    ttl: Duration,
    policies: RwLock<Vec<PermissionPolicy>>,
    cache: Mutex<HashMap<CacheKey, ToolPermission>>,
    sessions: Mutex<HashMap<String, HashSet<String>>>,
    confirmation: RwLock<Option<Arc<dyn ConfirmationHandler>>>,
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new(&PermissionConfig::default())
    }
}

impl PermissionManager {
    /// Manager with the configured limits and no policies.
    pub fn new(config: &PermissionConfig) -> Self {
        Self {
            default_level: config.default_level,
            max_cached: config.max_cached_permissions,
            ttl: Duration::from_secs(config.permission_ttl_secs),
            policies: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            confirmation: RwLock::new(None),
        }
    }

    /// Manager with the builtin policy (if enabled) followed by configured ones.
    pub fn from_config(config: &PermissionConfig) -> Result<Self> {
        let manager = Self::new(config);
        if config.load_builtin_policies {
            manager.add_policy(PermissionPolicy::builtin());
        }
        let mut seen = HashSet::new();
        for policy in &config.policies {
            if !seen.insert(policy.id.as_str()) {
                return Err(SecurityError::Validation(vec![format!(
                    "duplicate permission policy id '{}'",
                    policy.id
                )]));
            }
            manager.add_policy(policy.clone());
        }
        tracing::debug!(
            policies = manager.policies.read().len(),
            default = %manager.default_level,
            "Permission manager initialized"
        );
        Ok(manager)
    }

    /// Override the confirmation lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn default_level(&self) -> PermissionLevel {
        self.default_level
    }

    pub fn set_confirmation_handler(&self, handler: Arc<dyn ConfirmationHandler>) {
        *self.confirmation.write() = Some(handler);
    }

    pub fn clear_confirmation_handler(&self) {
        *self.confirmation.write() = None;
    }

    /// Resolve the verdict for `context`: cache, session grant, rules, default.
    pub async fn check_permission(&self, context: &ExecutionContext) -> PermissionResult {
        let key = CacheKey::of(context);

        if let Some(level) = self.cached_level(&key) {
            return PermissionResult::new(level, DecisionSource::Cache)
                .with_reason("Previously confirmed");
        }

        if let Some(session) = &context.session_id {
            let granted = self
                .sessions
                .lock()
                .get(session)
                .is_some_and(|tools| tools.contains(&context.tool_id));
            if granted {
                return PermissionResult::new(PermissionLevel::Allow, DecisionSource::Session)
                    .with_reason(format!("Granted for session {session}"));
            }
        }

        let mut result = match self.evaluate(context) {
            Some(m) => {
                let mut result = PermissionResult::new(m.level, DecisionSource::Rule);
                if !m.reason.is_empty() {
                    result.reason = Some(m.reason);
                }
                result.matched_rule = Some(m.rule_id);
                result.matched_policy = Some(m.policy_id);
                result
            }
            None => PermissionResult::new(self.default_level, DecisionSource::Default)
                .with_reason(format!("No rule matched; default is {}", self.default_level)),
        };

        if result.level == PermissionLevel::Prompt {
            result.requires_confirmation = true;
            self.confirm(context, key, &mut result).await;
        }
        result
    }

    async fn confirm(&self, context: &ExecutionContext, key: CacheKey, result: &mut PermissionResult) {
        // Clone out so no lock is held across the await.
        let handler = self.confirmation.read().clone();
        let Some(handler) = handler else {
            result.allowed = false;
            result.reason = Some(format!(
                "{} (confirmation required, no handler installed)",
                result.reason.as_deref().unwrap_or("Confirmation required")
            ));
            return;
        };

        if handler.confirm(context).await {
            result.level = PermissionLevel::Allow;
            result.allowed = true;
            self.insert_cache(key, context);
        } else {
            tracing::info!(tool = %context.tool_id, "Confirmation rejected");
            result.level = PermissionLevel::Deny;
            result.allowed = false;
            result.reason = Some("User rejected the action".into());
        }
    }

    /// Highest rule priority wins; ties keep the first rule encountered.
    fn evaluate(&self, context: &ExecutionContext) -> Option<RuleMatch> {
        let policies = self.policies.read();
        let mut best: Option<(&PermissionPolicy, &PolicyRule)> = None;
        for policy in policies.iter().filter(|p| p.enabled) {
            for rule in policy.rules.iter().filter(|r| r.applies_to(context)) {
                let better = match best {
                    Some((_, current)) => rule.priority > current.priority,
                    None => true,
                };
                if better {
                    best = Some((policy, rule));
                }
            }
        }
        best.map(|(policy, rule)| RuleMatch {
            level: rule.permission,
            rule_id: rule.id.clone(),
            policy_id: policy.id.clone(),
            reason: rule.reason.clone(),
        })
    }

    fn cached_level(&self, key: &CacheKey) -> Option<PermissionLevel> {
        let now = Utc::now();
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        if entry.is_expired(now) {
            cache.remove(key);
            return None;
        }
        entry.usage_count += 1;
        entry.last_used = now;
        Some(entry.level)
    }

    fn insert_cache(&self, key: CacheKey, context: &ExecutionContext) {
        if self.max_cached == 0 {
            return;
        }
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut cache = self.cache.lock();
        if cache.len() >= self.max_cached && !cache.contains_key(&key) {
            cache.retain(|_, entry| !entry.is_expired(now));
            if cache.len() >= self.max_cached {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    cache.remove(&oldest);
                }
            }
        }
        cache.insert(
            key,
            ToolPermission {
                tool_id: context.tool_id.clone(),
                category: context.category,
                level: PermissionLevel::Allow,
                granted_at: now,
                expires_at,
                usage_count: 0,
                last_used: now,
            },
        );
    }

    // ── Policies ──

    /// Register a policy; an existing policy with the same id is replaced in place.
    pub fn add_policy(&self, policy: PermissionPolicy) {
        {
            let mut policies = self.policies.write();
            match policies.iter_mut().find(|p| p.id == policy.id) {
                Some(existing) => *existing = policy,
                None => policies.push(policy),
            }
        }
        self.clear_cache();
    }

    pub fn remove_policy(&self, id: &str) -> bool {
        let removed = {
            let mut policies = self.policies.write();
            let before = policies.len();
            policies.retain(|p| p.id != id);
            policies.len() != before
        };
        if removed {
            self.clear_cache();
        }
        removed
    }

    pub fn get_policy(&self, id: &str) -> Option<PermissionPolicy> {
        self.policies.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn list_policies(&self) -> Vec<PermissionPolicy> {
        self.policies.read().clone()
    }

    pub fn set_policy_enabled(&self, id: &str, enabled: bool) -> bool {
        let found = {
            let mut policies = self.policies.write();
            match policies.iter_mut().find(|p| p.id == id) {
                Some(policy) => {
                    policy.enabled = enabled;
                    true
                }
                None => false,
            }
        };
        if found {
            self.clear_cache();
        }
        found
    }

    // ── Sessions ──

    pub fn grant_session_permission(&self, session_id: &str, tool_id: &str) {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(tool_id.to_string());
    }

    pub fn revoke_session_permission(&self, session_id: &str, tool_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(tools) = sessions.get_mut(session_id) else {
            return false;
        };
        let removed = tools.remove(tool_id);
        if tools.is_empty() {
            sessions.remove(session_id);
        }
        removed
    }

    pub fn clear_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    // ── Cache ──

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Snapshot of the live cache entries.
    pub fn cached_permissions(&self) -> Vec<ToolPermission> {
        let now = Utc::now();
        self.cache
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with a fixed value and counts how often it was asked.
    struct CountingConfirmation {
        answer: bool,
        calls: AtomicUsize,
    }

    impl CountingConfirmation {
        fn new(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfirmationHandler for CountingConfirmation {
        async fn confirm(&self, _context: &ExecutionContext) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn manager() -> PermissionManager {
        PermissionManager::new(&PermissionConfig::default())
    }

    fn sudo_policy() -> PermissionPolicy {
        PermissionPolicy::new("ops", "Ops").with_rule(
            PolicyRule::new(
                "sudo",
                RulePattern::regex(r"^sudo\s+").unwrap(),
                PermissionLevel::Prompt,
            )
            .with_category(ToolCategory::Shell),
        )
    }

    fn shell(command: &str) -> ExecutionContext {
        ExecutionContext::new("hawkeye__shell__run", ToolCategory::Shell, "run")
            .with_parameter("command", command)
    }

    #[tokio::test]
    async fn prompt_without_handler_fails_closed() {
        let m = manager();
        m.add_policy(sudo_policy());
        let result = m.check_permission(&shell("sudo rm")).await;
        assert!(result.requires_confirmation);
        assert!(!result.allowed);
        assert_eq!(result.matched_rule.as_deref(), Some("sudo"));
        assert_eq!(result.matched_policy.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn rejected_prompt_is_never_cached() {
        let m = manager();
        m.add_policy(sudo_policy());
        let handler = CountingConfirmation::new(false);
        m.set_confirmation_handler(handler.clone());

        let first = m.check_permission(&shell("sudo rm")).await;
        assert!(first.requires_confirmation);
        assert!(!first.allowed);
        assert_eq!(first.level, PermissionLevel::Deny);
        assert_eq!(m.cache_len(), 0);

        let second = m.check_permission(&shell("sudo rm")).await;
        assert!(!second.cached);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn confirmed_prompt_is_cached_per_target() {
        let m = manager();
        m.add_policy(sudo_policy());
        let handler = CountingConfirmation::new(true);
        m.set_confirmation_handler(handler.clone());

        let first = m.check_permission(&shell("sudo ls")).await;
        assert!(first.allowed);
        assert!(!first.cached);

        let second = m.check_permission(&shell("sudo ls")).await;
        assert!(second.allowed);
        assert!(second.cached);
        assert_eq!(second.decided_by, DecisionSource::Cache);
        assert_eq!(handler.calls(), 1);

        // A different command is a different cache key
        m.check_permission(&shell("sudo reboot")).await;
        assert_eq!(handler.calls(), 2);
        assert_eq!(m.cache_len(), 2);
        assert_eq!(m.cached_permissions()[0].level, PermissionLevel::Allow);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_not_honored() {
        let m = manager().with_ttl(Duration::from_millis(20));
        m.add_policy(sudo_policy());
        let handler = CountingConfirmation::new(true);
        m.set_confirmation_handler(handler.clone());

        m.check_permission(&shell("sudo ls")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = m.check_permission(&shell("sudo ls")).await;
        assert!(!again.cached);
        assert_eq!(handler.calls(), 2);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let m = PermissionManager::new(&PermissionConfig {
            max_cached_permissions: 2,
            ..PermissionConfig::default()
        });
        m.set_confirmation_handler(Arc::new(StaticConfirmation(true)));
        tokio_test::block_on(async {
            m.check_permission(&shell("a")).await;
            std::thread::sleep(Duration::from_millis(2));
            m.check_permission(&shell("b")).await;
            std::thread::sleep(Duration::from_millis(2));
            // Touch `a` so `b` becomes the eviction candidate
            assert!(m.check_permission(&shell("a")).await.cached);
            std::thread::sleep(Duration::from_millis(2));
            m.check_permission(&shell("c")).await;
            assert_eq!(m.cache_len(), 2);
            assert!(m.check_permission(&shell("a")).await.cached);
            assert!(!m.check_permission(&shell("b")).await.cached);
        });
    }

    #[tokio::test]
    async fn rule_verdicts_are_deterministic_and_uncached() {
        let m = manager();
        m.add_policy(
            PermissionPolicy::new("p1", "First")
                .with_rule(PolicyRule::new("allow-git", RulePattern::literal("git"), PermissionLevel::Allow)),
        );
        m.add_policy(
            PermissionPolicy::new("p2", "Second")
                .with_rule(PolicyRule::new("deny-git", RulePattern::literal("git"), PermissionLevel::Deny)),
        );
        for _ in 0..3 {
            let result = m.check_permission(&shell("git status")).await;
            assert!(result.allowed);
            assert_eq!(result.matched_rule.as_deref(), Some("allow-git"));
            assert!(!result.cached);
        }
        assert_eq!(m.cache_len(), 0);
    }

    #[tokio::test]
    async fn higher_priority_rule_wins() {
        let m = manager();
        m.add_policy(
            PermissionPolicy::new("p", "P")
                .with_rule(PolicyRule::new("allow", RulePattern::literal("git"), PermissionLevel::Allow))
                .with_rule(
                    PolicyRule::new("deny-push", RulePattern::literal("git push"), PermissionLevel::Deny)
                        .with_priority(5)
                        .with_reason("No pushing"),
                ),
        );
        let result = m.check_permission(&shell("git push origin main")).await;
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("No pushing"));
        assert!(m.check_permission(&shell("git status")).await.allowed);
    }

    #[tokio::test]
    async fn category_and_action_filters() {
        let m = manager();
        m.add_policy(
            PermissionPolicy::new("p", "P").with_rule(
                PolicyRule::new("tmp", RulePattern::literal("/tmp"), PermissionLevel::Allow)
                    .with_category(ToolCategory::File)
                    .with_actions(&["read"]),
            ),
        );
        let read = ExecutionContext::new("fs", ToolCategory::File, "read").with_parameter("path", "/tmp/x");
        let write = ExecutionContext::new("fs", ToolCategory::File, "write").with_parameter("path", "/tmp/x");
        assert!(m.check_permission(&read).await.allowed);
        let result = m.check_permission(&write).await;
        assert_eq!(result.decided_by, DecisionSource::Default);
        assert!(!m.check_permission(&shell("ls /tmp")).await.allowed);
    }

    #[tokio::test]
    async fn default_level_applies_when_nothing_matches() {
        let m = PermissionManager::new(&PermissionConfig {
            default_level: PermissionLevel::Allow,
            ..PermissionConfig::default()
        });
        let result = m.check_permission(&shell("ls")).await;
        assert!(result.allowed);
        assert_eq!(result.decided_by, DecisionSource::Default);
    }

    #[tokio::test]
    async fn session_grants() {
        let m = PermissionManager::new(&PermissionConfig {
            default_level: PermissionLevel::Deny,
            ..PermissionConfig::default()
        });
        let ctx = shell("ls").with_session("s1");
        assert!(!m.check_permission(&ctx).await.allowed);

        m.grant_session_permission("s1", "hawkeye__shell__run");
        let result = m.check_permission(&ctx).await;
        assert!(result.allowed);
        assert_eq!(result.decided_by, DecisionSource::Session);
        // Other sessions are unaffected
        assert!(!m.check_permission(&shell("ls").with_session("s2")).await.allowed);

        assert!(m.revoke_session_permission("s1", "hawkeye__shell__run"));
        assert!(!m.revoke_session_permission("s1", "hawkeye__shell__run"));
        assert!(!m.check_permission(&ctx).await.allowed);

        m.grant_session_permission("s1", "hawkeye__shell__run");
        m.clear_session("s1");
        assert!(!m.check_permission(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn policy_changes_clear_cache() {
        let m = manager();
        m.add_policy(sudo_policy());
        m.set_confirmation_handler(Arc::new(StaticConfirmation(true)));
        m.check_permission(&shell("sudo ls")).await;
        assert_eq!(m.cache_len(), 1);

        m.add_policy(PermissionPolicy::new("other", "Other"));
        assert_eq!(m.cache_len(), 0);

        m.check_permission(&shell("sudo ls")).await;
        assert!(m.set_policy_enabled("ops", false));
        assert_eq!(m.cache_len(), 0);
        assert!(!m.get_policy("ops").unwrap().enabled);

        assert!(m.remove_policy("other"));
        assert!(!m.remove_policy("other"));
        assert_eq!(m.list_policies().len(), 1);
    }

    #[test]
    fn re_adding_policy_replaces_in_place() {
        let m = manager();
        m.add_policy(PermissionPolicy::new("a", "A"));
        m.add_policy(PermissionPolicy::new("b", "B"));
        m.add_policy(PermissionPolicy::new("a", "A2"));
        let ids: Vec<String> = m.list_policies().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(m.get_policy("a").unwrap().name, "A2");
    }

    #[tokio::test]
    async fn builtin_policy_guards_catastrophes() {
        let m = PermissionManager::from_config(&PermissionConfig::default()).unwrap();
        let result = m.check_permission(&shell("rm -rf /")).await;
        assert!(!result.allowed);
        assert_eq!(result.level, PermissionLevel::Deny);
        assert_eq!(result.matched_rule.as_deref(), Some("deny-rm-root"));

        let sudo = m.check_permission(&shell("sudo apt update")).await;
        assert!(sudo.requires_confirmation);
        assert_eq!(sudo.matched_rule.as_deref(), Some("prompt-sudo"));

        let etc = ExecutionContext::new("fs", ToolCategory::File, "write")
            .with_parameter("path", "/etc/hosts");
        assert_eq!(
            m.check_permission(&etc).await.matched_rule.as_deref(),
            Some("deny-system-config-write")
        );

        let ai = ExecutionContext::new("llm", ToolCategory::Ai, "summarize page");
        assert!(m.check_permission(&ai).await.allowed);
    }

    #[test]
    fn duplicate_config_policies_rejected() {
        let config = PermissionConfig {
            load_builtin_policies: false,
            policies: vec![PermissionPolicy::new("x", "X"), PermissionPolicy::new("x", "Y")],
            ..PermissionConfig::default()
        };
        assert!(PermissionManager::from_config(&config).is_err());
    }

    #[test]
    fn rule_pattern_serde() {
        let rule: PolicyRule = serde_json::from_value(serde_json::json!({
            "id": "r",
            "pattern": {"regex": "^sudo\\s+"},
            "permission": "prompt"
        }))
        .unwrap();
        assert!(rule.pattern.is_match("sudo ls"));
        assert_eq!(rule.priority, 0);
        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["pattern"]["regex"], "^sudo\\s+");

        let bad = serde_json::from_value::<PolicyRule>(serde_json::json!({
            "id": "r",
            "pattern": {"regex": "("},
            "permission": "deny"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn denial_converts_to_error() {
        let result = PermissionResult::new(PermissionLevel::Deny, DecisionSource::Default)
            .with_reason("nope");
        let err = result.into_result().unwrap_err();
        assert!(matches!(err, SecurityError::PermissionDenied { .. }));
        assert!(err.to_string().contains("nope"));
    }
}

//! Append-only, size-bounded audit trail of security decisions.
//!
//! Entries live in an in-memory ring buffer indexed by id. Each entry is also
//! mirrored to `tracing`, published on a broadcast channel and, when enabled,
//! appended as one JSON line to a buffered file writer. Denials and errors
//! are flushed immediately. Logging never fails the caller.

use super::context::{ActionSource, ExecutionContext, ToolCategory};
use super::error::{Result, SecurityError};
use super::injection::InjectionDetectionResult;
use super::permission::PermissionResult;
use super::rollback::RollbackResult;
use super::tool_validator::ToolValidationResult;
use crate::config::{AuditConfig, AuditConsoleLevel};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;
const RECENT_ENTRIES: usize = 10;

/// Parameter names whose values are always redacted.
const SECRET_KEYS: &[&str] = &[
    "password", "passwd", "secret", "token", "api_key", "apikey", "authorization", "cookie",
    "credential", "private_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PermissionCheck,
    InjectionDetected,
    SensitiveOperation,
    RateLimitExceeded,
    ToolValidation,
    Rollback,
    Error,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionCheck => "permission_check",
            Self::InjectionDetected => "injection_detected",
            Self::SensitiveOperation => "sensitive_operation",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ToolValidation => "tool_validation",
            Self::Rollback => "rollback",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Allowed,
    Denied,
    Prompted,
    Error,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Prompted => "prompted",
            Self::Error => "error",
        }
    }

    fn severity(self) -> AuditConsoleLevel {
        match self {
            Self::Allowed => AuditConsoleLevel::Debug,
            Self::Prompted => AuditConsoleLevel::Info,
            Self::Denied => AuditConsoleLevel::Warn,
            Self::Error => AuditConsoleLevel::Error,
        }
    }
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the audit trail keeps of an [`ExecutionContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditContextSnapshot {
    pub tool_id: String,
    pub category: ToolCategory,
    pub action: String,
    pub source: ActionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub parameter_keys: Vec<String>,
    /// Redacted values, only with `audit.include_parameters`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl AuditContextSnapshot {
    pub fn capture(context: &ExecutionContext, include_parameters: bool) -> Self {
        Self {
            tool_id: context.tool_id.clone(),
            category: context.category,
            action: context.action.clone(),
            source: context.source,
            session_id: context.session_id.clone(),
            parameter_keys: context.parameters.keys().cloned().collect(),
            parameters: include_parameters.then(|| redact_parameters(&context.parameters)),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|s| key.contains(s))
}

fn redact_parameters(parameters: &Map<String, Value>) -> Map<String, Value> {
    parameters
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) if is_secret_key(key) => Value::String(super::redact(s)),
                Value::Object(inner) => Value::Object(redact_parameters(inner)),
                _ if is_secret_key(key) => Value::String(super::redact("")),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// `<unix millis>-<random suffix>`
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub action: String,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<AuditContextSnapshot>,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    /// Newest first
    #[default]
    Descending,
}

/// Filters are ANDed; empty lists and `None` match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_types: Vec<AuditEventType>,
    pub results: Vec<AuditResult>,
    pub tool_id: Option<String>,
    pub category: Option<ToolCategory>,
    pub session_id: Option<String>,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.start.map_or(true, |start| entry.timestamp >= start)
            && self.end.map_or(true, |end| entry.timestamp <= end)
            && (self.event_types.is_empty() || self.event_types.contains(&entry.event_type))
            && (self.results.is_empty() || self.results.contains(&entry.result))
            && self
                .tool_id
                .as_ref()
                .map_or(true, |t| entry.tool_id.as_ref() == Some(t))
            && self.category.map_or(true, |c| entry.category == Some(c))
            && self
                .session_id
                .as_ref()
                .map_or(true, |s| entry.session_id.as_ref() == Some(s))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub by_event_type: BTreeMap<String, usize>,
    pub by_result: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    /// Newest first
    pub recent: Vec<AuditLogEntry>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

type EntryCallback = Arc<dyn Fn(&AuditLogEntry) + Send + Sync>;

#[derive(Default)]
struct AuditBuffer {
    entries: VecDeque<Arc<AuditLogEntry>>,
    index: HashMap<String, Arc<AuditLogEntry>>,
    /// Opened on first persisted entry, reopened after a write error
    writer: Option<BufWriter<File>>,
}

impl AuditBuffer {
    fn append(&mut self, path: &Path, entry: &AuditLogEntry) -> Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => open_json_lines(path)?,
        };
        let writer = self.writer.insert(writer);
        let written = serde_json::to_writer(&mut *writer, entry)
            .map_err(SecurityError::from)
            .and_then(|()| writer.write_all(b"\n").map_err(SecurityError::from))
            .and_then(|()| {
                if entry.result == AuditResult::Allowed {
                    Ok(())
                } else {
                    writer.flush().map_err(SecurityError::from)
                }
            });
        if written.is_err() {
            self.writer = None;
        }
        written
    }
}

pub struct AuditLogger {
    config: AuditConfig,
    storage_path: Option<PathBuf>,
    buffer: Mutex<AuditBuffer>,
    sender: broadcast::Sender<Arc<AuditLogEntry>>,
    on_log_entry: RwLock<Option<EntryCallback>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(AuditConfig::default())
    }
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        let storage_path = config
            .persist
            .then(|| crate::config::expand_path(&config.storage_path));
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config,
            storage_path,
            buffer: Mutex::new(AuditBuffer::default()),
            sender,
            on_log_entry: RwLock::new(None),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Install a callback run synchronously for every stored entry.
    /// A panic inside it is caught and logged.
    pub fn set_on_log_entry(&self, callback: impl Fn(&AuditLogEntry) + Send + Sync + 'static) {
        *self.on_log_entry.write() = Some(Arc::new(callback));
    }

    pub fn clear_on_log_entry(&self) {
        *self.on_log_entry.write() = None;
    }

    /// Live feed of stored entries.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AuditLogEntry>> {
        self.sender.subscribe()
    }

    /// Build and store an entry. A disabled logger returns it without storing.
    pub fn log(
        &self,
        event_type: AuditEventType,
        action: &str,
        result: AuditResult,
        context: Option<&ExecutionContext>,
        details: Map<String, Value>,
    ) -> AuditLogEntry {
        let entry = AuditLogEntry {
            id: new_entry_id(),
            timestamp: Utc::now(),
            event_type,
            action: action.to_string(),
            result,
            context: context
                .map(|ctx| AuditContextSnapshot::capture(ctx, self.config.include_parameters)),
            details,
            tool_id: context.map(|ctx| ctx.tool_id.clone()),
            category: context.map(|ctx| ctx.category),
            session_id: context.and_then(|ctx| ctx.session_id.clone()),
        };
        if !self.config.enabled {
            return entry;
        }

        let shared = Arc::new(entry.clone());
        {
            let mut buffer = self.buffer.lock();
            while buffer.entries.len() >= self.config.max_entries.max(1) {
                if let Some(evicted) = buffer.entries.pop_front() {
                    buffer.index.remove(&evicted.id);
                }
            }
            buffer.entries.push_back(Arc::clone(&shared));
            buffer.index.insert(shared.id.clone(), Arc::clone(&shared));
            // Written under the lock so file order matches buffer order.
            if let Some(path) = &self.storage_path {
                if let Err(e) = buffer.append(path, &entry) {
                    tracing::warn!(path = %path.display(), "Failed to persist audit entry: {e}");
                }
            }
        }

        self.mirror(&entry);

        let callback = self.on_log_entry.read().clone();
        if let Some(callback) = callback {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&entry)));
            if outcome.is_err() {
                tracing::warn!(id = %entry.id, "Audit on_log_entry callback panicked");
            }
        }

        // No subscribers is not an error.
        let _ = self.sender.send(shared);
        entry
    }

    /// Flush buffered entries to the audit file. Also happens on drop.
    pub fn flush(&self) -> Result<()> {
        match self.buffer.lock().writer.as_mut() {
            Some(writer) => Ok(writer.flush()?),
            None => Ok(()),
        }
    }

    fn mirror(&self, entry: &AuditLogEntry) {
        let severity = entry.result.severity();
        let threshold = self.config.console_level;
        if threshold == AuditConsoleLevel::Off || severity < threshold {
            return;
        }
        let tool = entry.tool_id.as_deref().unwrap_or("-");
        match severity {
            AuditConsoleLevel::Error => tracing::error!(
                id = %entry.id, event = %entry.event_type, tool,
                "audit: {} {}", entry.action, entry.result
            ),
            AuditConsoleLevel::Warn => tracing::warn!(
                id = %entry.id, event = %entry.event_type, tool,
                "audit: {} {}", entry.action, entry.result
            ),
            AuditConsoleLevel::Info => tracing::info!(
                id = %entry.id, event = %entry.event_type, tool,
                "audit: {} {}", entry.action, entry.result
            ),
            _ => tracing::debug!(
                id = %entry.id, event = %entry.event_type, tool,
                "audit: {} {}", entry.action, entry.result
            ),
        }
    }

    // ── Wrappers ──

    pub fn log_permission_check(
        &self,
        context: &ExecutionContext,
        permission: &PermissionResult,
    ) -> AuditLogEntry {
        let result = if permission.allowed {
            AuditResult::Allowed
        } else if permission.level == super::context::PermissionLevel::Prompt {
            // Prompt that nobody could answer
            AuditResult::Prompted
        } else {
            AuditResult::Denied
        };
        self.log(
            AuditEventType::PermissionCheck,
            &context.action,
            result,
            Some(context),
            object(json!({
                "level": permission.level,
                "requires_confirmation": permission.requires_confirmation,
                "cached": permission.cached,
                "decided_by": permission.decided_by,
                "reason": permission.reason,
                "matched_rule": permission.matched_rule,
                "matched_policy": permission.matched_policy,
            })),
        )
    }

    pub fn log_injection_detected(
        &self,
        context: &ExecutionContext,
        detection: &InjectionDetectionResult,
    ) -> AuditLogEntry {
        self.log(
            AuditEventType::InjectionDetected,
            &context.action,
            AuditResult::Denied,
            Some(context),
            object(json!({
                "injection_type": detection.injection_type,
                "confidence": detection.confidence,
                "pattern": detection.pattern,
                "pattern_id": detection.pattern_id,
                "location": detection.location,
            })),
        )
    }

    pub fn log_sensitive_operation(
        &self,
        context: &ExecutionContext,
        operation: &str,
        details: Map<String, Value>,
    ) -> AuditLogEntry {
        self.log(
            AuditEventType::SensitiveOperation,
            operation,
            AuditResult::Allowed,
            Some(context),
            details,
        )
    }

    pub fn log_rate_limit_exceeded(
        &self,
        context: &ExecutionContext,
        max_actions_per_hour: u32,
    ) -> AuditLogEntry {
        self.log(
            AuditEventType::RateLimitExceeded,
            &context.action,
            AuditResult::Denied,
            Some(context),
            object(json!({ "max_actions_per_hour": max_actions_per_hour })),
        )
    }

    pub fn log_error(&self, context: Option<&ExecutionContext>, message: &str) -> AuditLogEntry {
        let action = context.map_or("error", |ctx| ctx.action.as_str());
        self.log(
            AuditEventType::Error,
            action,
            AuditResult::Error,
            context,
            object(json!({ "error": message })),
        )
    }

    pub fn log_tool_validation(
        &self,
        context: &ExecutionContext,
        validation: &ToolValidationResult,
    ) -> AuditLogEntry {
        let result = if validation.valid {
            AuditResult::Allowed
        } else {
            AuditResult::Denied
        };
        self.log(
            AuditEventType::ToolValidation,
            &context.action,
            result,
            Some(context),
            object(json!({
                "errors": validation.errors,
                "warnings": validation.warnings,
                "normalized_name": validation.normalized_name,
            })),
        )
    }

    pub fn log_rollback(&self, rollback: &RollbackResult) -> AuditLogEntry {
        let result = if rollback.success {
            AuditResult::Allowed
        } else {
            AuditResult::Error
        };
        self.log(
            AuditEventType::Rollback,
            "rollback",
            result,
            None,
            object(json!({
                "rollback_point_id": rollback.rollback_point_id,
                "operations_rolled_back": rollback.operations_rolled_back,
                "failures": rollback.failures,
                "duration_ms": rollback.duration_ms,
            })),
        )
    }

    // ── Reading ──

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        let buffer = self.buffer.lock();
        let mut matching: Vec<&Arc<AuditLogEntry>> =
            buffer.entries.iter().filter(|e| query.matches(e)).collect();
        if query.order == SortOrder::Descending {
            matching.reverse();
        }
        matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|e| AuditLogEntry::clone(e))
            .collect()
    }

    pub fn get_entry(&self, id: &str) -> Option<AuditLogEntry> {
        self.buffer
            .lock()
            .index
            .get(id)
            .map(|e| AuditLogEntry::clone(e))
    }

    pub fn get_stats(&self) -> AuditStats {
        let buffer = self.buffer.lock();
        let mut stats = AuditStats {
            total: buffer.entries.len(),
            oldest: buffer.entries.front().map(|e| e.timestamp),
            newest: buffer.entries.back().map(|e| e.timestamp),
            ..AuditStats::default()
        };
        for entry in &buffer.entries {
            *stats
                .by_event_type
                .entry(entry.event_type.to_string())
                .or_default() += 1;
            *stats.by_result.entry(entry.result.to_string()).or_default() += 1;
            if let Some(category) = entry.category {
                *stats.by_category.entry(category.to_string()).or_default() += 1;
            }
        }
        stats.recent = buffer
            .entries
            .iter()
            .rev()
            .take(RECENT_ENTRIES)
            .map(|e| AuditLogEntry::clone(e))
            .collect();
        stats
    }

    /// All stored entries, oldest first.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let entries: Vec<AuditLogEntry> = self
            .buffer
            .lock()
            .entries
            .iter()
            .map(|e| AuditLogEntry::clone(e))
            .collect();
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&entries)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "id,timestamp,event_type,action,result,tool_id,category,session_id,details\n",
                );
                for entry in &entries {
                    let row = [
                        entry.id.clone(),
                        entry.timestamp.to_rfc3339(),
                        entry.event_type.to_string(),
                        entry.action.clone(),
                        entry.result.to_string(),
                        entry.tool_id.clone().unwrap_or_default(),
                        entry.category.map(|c| c.to_string()).unwrap_or_default(),
                        entry.session_id.clone().unwrap_or_default(),
                        serde_json::to_string(&entry.details)?,
                    ];
                    let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
                    out.push_str(&fields.join(","));
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut buffer = self.buffer.lock();
        buffer.entries.clear();
        buffer.index.clear();
    }
}

fn new_entry_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "{}-{}",
        Utc::now().timestamp_millis(),
        suffix.to_ascii_lowercase()
    )
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn open_json_lines(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(BufWriter::new(file))
}

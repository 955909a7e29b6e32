//! Core data model: Message, Target, PlatformResult, Receipt, PlatformHealth,
//! and the Handle state lattice.
//!
//! `nh-queue` and `nh-router` build their own types (Handle, QueueItem,
//! Sender) on top of these — this module has no async/I/O dependency.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorCode};
use crate::idgen::default_generator;

/// Body/markup format of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Text,
    Markdown,
    Html,
    Card,
}

impl Default for Format {
    fn default() -> Self {
        Format::Text
    }
}

/// A logical notification unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub title: String,
    pub body: String,
    pub format: Format,
    pub priority: u8,
    pub targets: Vec<Target>,
    pub variables: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub platform_data: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Log-correlation aid only; uniqueness is on `id`, never on this field.
    pub dedup_key: Option<String>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Re-validate invariants (useful after deserializing from the wire).
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::new(ErrorCode::InvalidMessage, "message id is empty"));
        }
        if self.title.is_empty() && self.body.is_empty() {
            return Err(Error::new(
                ErrorCode::EmptyMessage,
                "message has neither title nor body",
            ));
        }
        if !(1..=5).contains(&self.priority) {
            return Err(Error::new(
                ErrorCode::InvalidMessage,
                format!("priority {} out of range 1..5", self.priority),
            ));
        }
        Ok(())
    }
}

/// Chainable builder for [`Message`]. Each setter mutates exactly one field
/// and returns `self`; `build()` is the only fallible, terminal step.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    title: String,
    body: String,
    format: Format,
    priority: u8,
    targets: Vec<Target>,
    variables: HashMap<String, Value>,
    metadata: HashMap<String, Value>,
    platform_data: HashMap<String, Value>,
    dedup_key: Option<String>,
}

impl MessageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn platform_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.platform_data.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Assign an ID if absent, validate invariants, and produce the message.
    pub fn build(self) -> Result<Message, Error> {
        let priority = if self.priority == 0 { 3 } else { self.priority };
        let message = Message {
            id: self
                .id
                .unwrap_or_else(|| default_generator().generate_with_prefix("msg")),
            title: self.title,
            body: self.body,
            format: self.format,
            priority,
            targets: self.targets,
            variables: self.variables,
            metadata: self.metadata,
            platform_data: self.platform_data,
            created_at: Utc::now(),
            dedup_key: self.dedup_key,
        };
        message.validate()?;
        Ok(message)
    }
}

/// Destination type recognized by the router/senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Email,
    Phone,
    User,
    Group,
    Channel,
    Webhook,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Email => "email",
            TargetType::Phone => "phone",
            TargetType::User => "user",
            TargetType::Group => "group",
            TargetType::Channel => "channel",
            TargetType::Webhook => "webhook",
        };
        write!(f, "{s}")
    }
}

/// A single destination specification `(type, value, platform?)`.
///
/// Equality is the triple `(type, value, platform)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub platform: Option<String>,
}

impl Target {
    /// Construct and validate a target. `platform` empty/`None` means
    /// "auto-route by type".
    pub fn new(
        target_type: TargetType,
        value: impl Into<String>,
        platform: Option<String>,
    ) -> Result<Self, Error> {
        let value = value.into();
        if value.is_empty() && target_type != TargetType::Webhook {
            return Err(Error::new(
                ErrorCode::EmptyTarget,
                format!("target value is empty for type {target_type}"),
            ));
        }
        let platform = platform.filter(|p| !p.is_empty());
        Ok(Target {
            target_type,
            value,
            platform,
        })
    }

    pub fn email(value: impl Into<String>) -> Result<Self, Error> {
        Self::new(TargetType::Email, value, None)
    }

    pub fn webhook(value: impl Into<String>) -> Result<Self, Error> {
        Self::new(TargetType::Webhook, value, None)
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Canonical string form used in `PlatformResult::target` and logs.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.target_type, self.value)
    }
}

/// Outcome of one Message -> one Target on one Sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: String,
    pub target: String,
    pub success: bool,
    #[serde(rename = "message_id", skip_serializing_if = "Option::is_none", default)]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub duration: Duration,
}

impl PlatformResult {
    pub fn success(platform: impl Into<String>, target: impl Into<String>, message_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            platform: platform.into(),
            target: target.into(),
            success: true,
            message_id: Some(message_id.into()),
            error: None,
            timestamp: Utc::now(),
            duration,
        }
    }

    pub fn failure(platform: impl Into<String>, target: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            platform: platform.into(),
            target: target.into(),
            success: false,
            message_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration,
        }
    }
}

/// Aggregate outcome of one [`Message`], derived from its [`PlatformResult`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Success,
    Partial,
    Failed,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Processing => "processing",
            ReceiptStatus::Success => "success",
            ReceiptStatus::Partial => "partial",
            ReceiptStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

fn derive_status(results: &[PlatformResult]) -> ReceiptStatus {
    if results.is_empty() {
        return ReceiptStatus::Pending;
    }
    let failed = results.iter().filter(|r| !r.success).count();
    if failed == 0 {
        ReceiptStatus::Success
    } else if failed == results.len() {
        ReceiptStatus::Failed
    } else {
        ReceiptStatus::Partial
    }
}

#[derive(Debug, Clone, Default)]
struct ReceiptState {
    status: Option<ReceiptStatus>,
    results: Vec<PlatformResult>,
}

/// Aggregate outcome of one Message.
///
/// `AddResult` (here: [`Receipt::add_result`]) must be safe under concurrent
/// calls from multiple platform senders, so the mutable parts live behind
/// an internal lock; `message_id`/`created_at` never change after
/// construction and are exposed directly.
pub struct Receipt {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<ReceiptState>,
}

impl Receipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            created_at: Utc::now(),
            state: Mutex::new(ReceiptState::default()),
        }
    }

    /// Atomically append a result and re-derive counters and status.
    pub fn add_result(&self, result: PlatformResult) {
        let mut state = self.state.lock();
        state.results.push(result);
        state.status = Some(derive_status(&state.results));
    }

    /// Explicitly mark processing before any result has arrived (e.g. once
    /// the dispatcher has routed targets but senders haven't replied yet).
    pub fn mark_processing(&self) {
        let mut state = self.state.lock();
        if state.results.is_empty() {
            state.status = Some(ReceiptStatus::Processing);
        }
    }

    pub fn status(&self) -> ReceiptStatus {
        let state = self.state.lock();
        state.status.unwrap_or(ReceiptStatus::Pending)
    }

    pub fn results(&self) -> Vec<PlatformResult> {
        self.state.lock().results.clone()
    }

    pub fn successful(&self) -> usize {
        self.state.lock().results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.state.lock().results.iter().filter(|r| !r.success).count()
    }

    pub fn total(&self) -> usize {
        self.state.lock().results.len()
    }

    /// Snapshot into the JSON wire form described in spec.md §6.
    pub fn to_wire(&self) -> ReceiptWire {
        let state = self.state.lock();
        let successful = state.results.iter().filter(|r| r.success).count();
        let failed = state.results.len() - successful;
        ReceiptWire {
            message_id: self.message_id.clone(),
            status: state.status.unwrap_or(ReceiptStatus::Pending),
            results: state.results.clone(),
            successful,
            failed,
            total: state.results.len(),
            timestamp: self.created_at,
        }
    }
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Receipt")
            .field("message_id", &self.message_id)
            .field("status", &state.status)
            .field("results", &state.results)
            .finish()
    }
}

/// Plain, `Serialize`/`Deserialize`-able snapshot of a [`Receipt`], matching
/// spec.md §6's wire form verbatim (snake_case field names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptWire {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub results: Vec<PlatformResult>,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

impl From<ReceiptWire> for Receipt {
    fn from(wire: ReceiptWire) -> Self {
        let receipt = Receipt {
            message_id: wire.message_id,
            created_at: wire.timestamp,
            state: Mutex::new(ReceiptState {
                status: Some(wire.status),
                results: wire.results,
            }),
        };
        receipt
    }
}

/// Lattice of states an async operation's [`Handle`](../index.html) passes
/// through. `Pending < Processing < {Completed, Failed, Cancelled}`;
/// terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::Completed | HandleState::Failed | HandleState::Cancelled
        )
    }

    /// Is `self -> next` a legal forward transition in the lattice?
    pub fn can_transition_to(self, next: HandleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (HandleState::Pending, HandleState::Processing) => true,
            (HandleState::Pending, HandleState::Cancelled) => true,
            (HandleState::Processing, HandleState::Completed)
            | (HandleState::Processing, HandleState::Failed)
            | (HandleState::Processing, HandleState::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Pending => "pending",
            HandleState::Processing => "processing",
            HandleState::Completed => "completed",
            HandleState::Failed => "failed",
            HandleState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-platform rolling statistics the Router consults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformHealth {
    pub healthy: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_fails: u32,
    pub last_response_time: Duration,
    pub last_check_at: DateTime<Utc>,
    pub weight: u32,
}

impl Default for PlatformHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            success_count: 0,
            failure_count: 0,
            consecutive_fails: 0,
            last_response_time: Duration::from_millis(0),
            last_check_at: Utc::now(),
            weight: 1,
        }
    }
}

impl PlatformHealth {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

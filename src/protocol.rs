//! Control-plane wire messages.
//!
//! Everything exchanged over the bus is one of these JSON documents. Each
//! message is validated once at ingress ([`InferenceRequest::validate`]);
//! the per-token hot path trusts its inputs and never re-validates.

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Liveness classification of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Degraded,
    Offline,
}

/// Model size classes a worker can host, ordered smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelTier {
    #[serde(rename = "<3B")]
    Under3B,
    #[serde(rename = "3-7B")]
    Small,
    #[serde(rename = "7-13B")]
    Medium,
    #[serde(rename = "13-27B")]
    Large,
    #[serde(rename = "30B+")]
    Huge,
}

impl ModelTier {
    /// Rank with `Under3B == 0`; used for smallest-fit preference.
    pub fn rank(&self) -> u8 {
        match self {
            ModelTier::Under3B => 0,
            ModelTier::Small => 1,
            ModelTier::Medium => 2,
            ModelTier::Large => 3,
            ModelTier::Huge => 4,
        }
    }
}

/// Models a worker can serve, as advertised in its registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSkills {
    pub available_models: Vec<String>,
    #[serde(default)]
    pub model_paths: HashMap<String, String>,
    #[serde(default)]
    pub total_model_size: u64,
    #[serde(default)]
    pub last_scanned: u64,
}

/// Resource ceilings reported by the worker's hardware probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCapabilities {
    pub max_concurrent: u32,
    pub tiers: Vec<ModelTier>,
    pub available_memory_gb: f64,
}

/// Rolling utilization snapshot carried in each heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub cpu_usage_percent: f64,
    pub memory_used_gb: f64,
    pub gpu_utilization_percent: f64,
    pub active_requests: u32,
    pub total_requests_handled: u64,
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub models_loaded: Vec<String>,
}

/// `worker.register` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub skills: WorkerSkills,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub timestamp: u64,
}

/// `worker.heartbeat` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub metrics: WorkerMetrics,
    pub timestamp: u64,
}

/// `worker.deregister` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDeregistration {
    pub worker_id: String,
    pub timestamp: u64,
}

/// Request priority, highest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl Priority {
    pub const LEVELS: usize = 5;

    /// Bucket index with `Critical == 0`.
    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    pub fn from_index(index: usize) -> Priority {
        match index {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            _ => Priority::Background,
        }
    }

    /// One level more urgent, saturating at `Critical`.
    pub fn promoted(&self) -> Priority {
        Priority::from_index(self.index().saturating_sub(1))
    }
}

/// A token-generation request. Immutable once admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub request_id: String,
    pub model_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u32>,
    /// Absolute deadline in controller clock milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl InferenceRequest {
    /// Minimal request with defaults for the optional knobs.
    pub fn new(request_id: impl Into<String>, model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model_id: model_id.into(),
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            session_id: None,
            stream: false,
            priority: Priority::Normal,
            tenant_id: None,
            estimated_tokens: None,
            deadline_ms: None,
        }
    }

    /// Range checks applied once at ingress.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.request_id.is_empty() {
            return Err(InferenceError::validation("requestId", "must not be empty"));
        }
        if self.model_id.is_empty() {
            return Err(InferenceError::validation("modelId", "must not be empty"));
        }
        if self.prompt.is_empty() {
            return Err(InferenceError::validation("prompt", "must not be empty"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) || t.is_nan() {
                return Err(InferenceError::validation(
                    "temperature",
                    format!("{t} outside [0, 2]"),
                ));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) || p.is_nan() {
                return Err(InferenceError::validation("topP", format!("{p} outside [0, 1]")));
            }
        }
        if let Some(0) = self.max_tokens {
            return Err(InferenceError::validation("maxTokens", "must be > 0 when set"));
        }
        Ok(())
    }
}

/// One generated token on the stream path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    #[serde(default)]
    pub is_final: bool,
    /// Pre-measured byte size, so chunking never re-measures on the hot path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u32>,
}

impl Token {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        let text = text.into();
        let size = text.len() as u32;
        Self { id, text, logprob: None, is_final: false, size_bytes: Some(size) }
    }

    pub fn final_token(id: u64, text: impl Into<String>) -> Self {
        let mut token = Self::new(id, text);
        token.is_final = true;
        token
    }

    /// Byte size, preferring the pre-measured value.
    pub fn size(&self) -> usize {
        self.size_bytes.map(|s| s as usize).unwrap_or_else(|| self.text.len())
    }
}

/// Chat-style prompt used by batched compatibility checks and TTFT probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Per-request reply events published on `response.{requestId}`.
///
/// The transport preserves arrival order; consumers observe `token* (done|error)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseEvent {
    #[serde(rename_all = "camelCase")]
    Token { request_id: String, token: Token, index: u64 },
    #[serde(rename_all = "camelCase")]
    Done { request_id: String, total_tokens: u64, latency_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Error { request_id: String, error: String, code: String },
}

/// RPC kinds the batch aggregator coalesces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Tokenize,
    CheckDraft,
}

impl BatchKind {
    pub const ALL: [BatchKind; 2] = [BatchKind::Tokenize, BatchKind::CheckDraft];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Tokenize => "tokenize",
            BatchKind::CheckDraft => "check_draft",
        }
    }
}

/// Topic the controller publishes inference requests on, per worker.
pub fn inference_topic(worker_id: &str) -> String {
    format!("worker.{worker_id}.inference")
}

/// Topic a worker publishes reply events on, per request.
pub fn response_topic(request_id: &str) -> String {
    format!("response.{request_id}")
}

/// Topic for batched RPCs of one kind, per worker.
pub fn batch_topic(worker_id: &str, kind: BatchKind) -> String {
    format!("worker.{worker_id}.batch.{}", kind.as_str())
}

pub const TOPIC_REGISTER: &str = "worker.register";
pub const TOPIC_HEARTBEAT: &str = "worker.heartbeat";
pub const TOPIC_DEREGISTER: &str = "worker.deregister";

//! Job model shared by the client, the worker and handlers.

use crate::error::HandlerError;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Key under which list-form arguments are wrapped before enqueue.
pub const LIST_ARGS_KEY: &str = "_args";

/// Lifecycle state of a job as reported by the backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Scheduled,
    #[default]
    Available,
    Pending,
    Active,
    Completed,
    Retryable,
    Cancelled,
    Discarded,
}

impl JobState {
    /// Whether the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Discarded)
    }
}

/// A unit of work persisted by the job-queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub queue: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create an available job with a fresh v7 id.
    pub fn new(job_type: impl Into<String>, queue: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            queue: queue.into(),
            args,
            meta: Map::new(),
            state: JobState::Available,
            attempt: 0,
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    /// The first argument when it is a JSON object, otherwise an empty map.
    pub fn args_map(&self) -> Map<String, Value> {
        match self.args.first() {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Deserialize one key of [`args_map`](Self::args_map).
    ///
    /// A missing key is treated as `null`, so `Option<T>` targets succeed.
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let value = self.args_map().remove(key).unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(HandlerError::from)
    }
}

/// Enqueue request with optional routing and scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_type: String,
    pub args: Map<String, Value>,
    pub queue: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub meta: Map<String, Value>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            job_type: job_type.into(),
            args,
            queue: None,
            scheduled_at: None,
            meta: Map::new(),
        }
    }

    /// Build a request whose arguments are a positional list.
    pub fn from_list(job_type: impl Into<String>, args: Vec<Value>) -> Self {
        let mut wrapped = Map::new();
        wrapped.insert(LIST_ARGS_KEY.to_string(), Value::Array(args));
        Self::new(job_type, wrapped)
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule relative to now.
    pub fn delay(self, delay: Duration) -> Self {
        self.scheduled_at(Utc::now() + delay)
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Map form accepted by batch enqueue.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut wire = Map::new();
        wire.insert("type".into(), Value::String(self.job_type.clone()));
        wire.insert("args".into(), Value::Object(self.args.clone()));
        if let Some(queue) = &self.queue {
            wire.insert("queue".into(), Value::String(queue.clone()));
        }
        if let Some(at) = &self.scheduled_at {
            wire.insert("scheduled_at".into(), Value::String(at.to_rfc3339()));
        }
        if !self.meta.is_empty() {
            wire.insert("meta".into(), Value::Object(self.meta.clone()));
        }
        wire
    }

    /// Parse the map form produced by [`to_wire`](Self::to_wire).
    pub fn from_wire(wire: &Map<String, Value>) -> Option<Self> {
        let job_type = wire.get("type")?.as_str()?.to_string();
        let args = match wire.get("args") {
            Some(Value::Object(args)) => args.clone(),
            _ => Map::new(),
        };
        let queue = wire.get("queue").and_then(Value::as_str).map(str::to_string);
        let scheduled_at = wire
            .get("scheduled_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        let meta = match wire.get("meta") {
            Some(Value::Object(meta)) => meta.clone(),
            _ => Map::new(),
        };

        Some(Self {
            job_type,
            args,
            queue,
            scheduled_at,
            meta,
        })
    }
}

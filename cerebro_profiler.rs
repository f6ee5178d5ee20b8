//! # Cerebro Profiler - Continuous Profiling for AIOps
//!
//! An embeddable profiling agent plus the collector service that ingests and
//! persists what the agent captures. Both halves live in this crate so the
//! agent can also write straight into local storage when no collector runs.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── AGENT ─────────────────────────────┐
//! │  LIFECYCLE CONTROLLER → SESSION REGISTRY                        │
//! │         │                                                       │
//! │         └─→ COLLECTOR TASKS (cpu │ heap │ io │ metrics)         │
//! │                     │                                           │
//! │                     └─→ DISPATCHER (http │ local)               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │  /api/v1/{sessions,profiles,metrics}
//! ┌──────────────────────────── COLLECTOR ──────────────────────────┐
//! │  AXUM ROUTER → ARTIFACT STORE (sessions/ profiles/ metrics/)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Session Lifecycle**: bounded sessions with automatic stop and
//!   periodic auto-triggering
//! - **Independent Collectors**: bracketed CPU capture, heap snapshots,
//!   IO deltas and metrics, all bound to one cancellation token per session
//! - **Durable Storage**: atomic session writes, payload + sidecar artifacts,
//!   append-only metrics streams tolerant of corrupt lines
//! - **Sharded Locking**: per-session exclusion in both the registry and the store
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Borrow;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::Handle as RuntimeHandle;
use tokio::signal;
use tokio::time::{interval_at, sleep, timeout, Instant as TokioInstant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use async_trait::async_trait;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// Hashing & Identity
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHasher};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// HTTP Server
// ----------------------------------------------------------------------------
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// System Information, Configuration & CLI
// ----------------------------------------------------------------------------
use sysinfo::{Pid, System};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use clap::{Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS
// ============================================================================

/// Crate version reported in session metadata and the CLI.
pub const PROFILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every ingestion route.
pub const API_PREFIX: &str = "/api/v1";

/// Cadence of heap snapshots and IO delta readings.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of metrics snapshots.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Length of an auto-triggered session.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(30);

/// Interval between auto-triggered sessions.
pub const DEFAULT_PROFILE_INTERVAL: Duration = Duration::from_secs(300);

/// CPU sampling rate used when a request leaves it at zero.
pub const DEFAULT_CPU_SAMPLE_RATE_HZ: u32 = 10;

/// Upper bound accepted for any sampling rate.
pub const MAX_SAMPLE_RATE_HZ: u32 = 1000;

/// Floor applied to every ticker period.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(10);

/// Timeout for outbound dispatcher requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on graceful shutdown of the agent and the collector server.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Longest metrics line the store will buffer while reading.
pub const MAX_METRICS_LINE_BYTES: usize = 1024 * 1024;

/// Default collector listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default collector data directory.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default collector endpoint the agent reports to.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Default config file consulted by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "cerebro-profiler.toml";

/// Prefix for environment overrides (`CEREBRO_PROFILER_AGENT__SERVER_URL`).
pub const ENV_PREFIX: &str = "CEREBRO_PROFILER_";

/// Shard count of the session registry.
pub const REGISTRY_SHARDS: usize = 64;

/// Lock stripes guarding per-session files in the store.
pub const STORE_LOCK_STRIPES: usize = 64;

/// Format tag of the process sampler's CPU payload.
pub const PROCESS_CPU_FORMAT: &str = "cerebro.process-cpu.v1";

/// Format tag of the process sampler's heap payload.
pub const PROCESS_HEAP_FORMAT: &str = "cerebro.process-heap.v1";

// ============================================================================
// SECTION 3: CORE DATA MODEL
// ============================================================================
// Wire and on-disk entities shared by agent and collector:
// - ProfileSession: one bounded profiling activity
// - ProfileArtifact: one captured payload tied to a session
// - MetricsSnapshot: one point-in-time measurement
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Profile Kinds
// ----------------------------------------------------------------------------

/// The kind of data a profile artifact carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Cpu,
    Memory,
    Heap,
    Io,
    Block,
    Mutex,
}

impl ProfileType {
    pub const ALL: [ProfileType; 6] = [
        ProfileType::Cpu,
        ProfileType::Memory,
        ProfileType::Heap,
        ProfileType::Io,
        ProfileType::Block,
        ProfileType::Mutex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::Memory => "memory",
            ProfileType::Heap => "heap",
            ProfileType::Io => "io",
            ProfileType::Block => "block",
            ProfileType::Mutex => "mutex",
        }
    }
}

impl Display for ProfileType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the agent profiles its own process or observes another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    #[default]
    Embedded,
    Sidecar,
}

impl Display for ProfileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProfileMode::Embedded => write!(f, "embedded"),
            ProfileMode::Sidecar => write!(f, "sidecar"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Serde Helpers
// ----------------------------------------------------------------------------

/// Durations on the wire are integer nanoseconds.
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        if nanos < 0 {
            return Err(serde::de::Error::custom("duration must not be negative"));
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}

/// Binary payloads travel as standard base64 inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Agents in other runtimes send a nil map as `null`.
fn nullable_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JsonMap<String, JsonValue>, D::Error> {
    Ok(Option::<JsonMap<String, JsonValue>>::deserialize(deserializer)?.unwrap_or_default())
}

// ----------------------------------------------------------------------------
// 3.3 Profile Session
// ----------------------------------------------------------------------------

/// A bounded profiling activity.
///
/// `end_time` stays `None` while the session is active and is set exactly
/// once by [`ProfileSession::finish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSession {
    pub id: String,
    pub application_id: String,
    #[serde(default, rename = "name", alias = "application_name")]
    pub application_name: String,
    #[serde(default)]
    pub language: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, with = "duration_nanos")]
    pub duration: Duration,
    pub profile_type: ProfileType,
    #[serde(default)]
    pub mode: ProfileMode,
    #[serde(default, deserialize_with = "nullable_map")]
    pub metadata: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub data_path: String,
}

impl ProfileSession {
    /// Open a session starting now.
    pub fn begin(
        id: String,
        agent: &AgentConfig,
        profile_type: ProfileType,
        metadata: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            id,
            application_id: agent.application_id.clone(),
            application_name: agent.application_name.clone(),
            language: agent.language.clone(),
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            profile_type,
            mode: agent.mode,
            metadata,
            data_path: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Close the session after `elapsed` of monotonic time.
    ///
    /// `end_time` is derived from `start_time` so that
    /// `end_time - start_time == duration` holds exactly. Returns `false`
    /// if the session was already finished.
    pub fn finish(&mut self, elapsed: Duration) -> bool {
        if self.end_time.is_some() {
            return false;
        }
        let (elapsed, span) = match chrono::Duration::from_std(elapsed) {
            Ok(span) => (elapsed, span),
            Err(_) => (Duration::ZERO, chrono::Duration::zero()),
        };
        self.end_time = Some(self.start_time + span);
        self.duration = elapsed;
        true
    }
}

/// Build a collision-free, path-safe session id for an application.
pub fn generate_session_id(application_id: &str) -> String {
    format!("{}-{}", application_id, Uuid::now_v7().simple())
}

/// Ids become path components in the store, so only a safe charset passes.
pub fn validate_entity_id(kind: &'static str, id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::validation(format!("{kind} id must not be empty")));
    }
    if id == "." || id == ".." {
        return Err(StoreError::validation(format!("{kind} id '{id}' is reserved")));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(StoreError::validation(format!(
            "{kind} id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 3.4 Profile Artifact
// ----------------------------------------------------------------------------

/// One captured profiling payload. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileArtifact {
    pub session_id: String,
    #[serde(rename = "type")]
    pub profile_type: ProfileType,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(
        default,
        deserialize_with = "nullable_map",
        skip_serializing_if = "serde_json::Map::is_empty"
    )]
    pub metadata: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub sample_count: u64,
}

// ----------------------------------------------------------------------------
// 3.5 Metrics Snapshot
// ----------------------------------------------------------------------------

/// A point-in-time process/system measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub io_read_bytes: u64,
    #[serde(default)]
    pub io_write_bytes: u64,
    #[serde(default)]
    pub io_read_ops: u64,
    #[serde(default)]
    pub io_write_ops: u64,
    /// Live concurrency units (collector tasks for this agent; goroutines
    /// for agents in other runtimes).
    #[serde(default, alias = "goroutine_count", skip_serializing_if = "Option::is_none")]
    pub concurrency_units: Option<u64>,
    #[serde(default)]
    pub heap_alloc: u64,
    #[serde(default)]
    pub heap_sys: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_pause_total: Option<u64>,
}

/// Body of `POST /api/v1/metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEnvelope {
    pub session_id: String,
    pub metrics: MetricsSnapshot,
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into ProfilerError:
// - NotFound surfaces to callers and is never fatal
// - Validation rejects input before any state mutation
// - Io failures propagate, transport failures are logged by collectors
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

/// The main error type for the profiler.
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProfilerError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProfilerError::Config(_) => false,
            ProfilerError::Store(e) => e.is_recoverable(),
            ProfilerError::Registry(_) => true,
            ProfilerError::Capture(_) => true,
            ProfilerError::Transport(_) => true,
            ProfilerError::Agent(e) => e.is_recoverable(),
            ProfilerError::Io(_) => true,
            ProfilerError::Internal(_) => false,
        }
    }

    /// Category label for logs.
    pub fn category(&self) -> &'static str {
        match self {
            ProfilerError::Config(_) => "config",
            ProfilerError::Store(_) => "store",
            ProfilerError::Registry(_) => "registry",
            ProfilerError::Capture(_) => "capture",
            ProfilerError::Transport(_) => "transport",
            ProfilerError::Agent(_) => "agent",
            ProfilerError::Io(_) => "io",
            ProfilerError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to write configuration to {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Store Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization failed for {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Background store task failed: {message}")]
    Background { message: String },
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { kind, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Serialization {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Validation { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.4 Registry, Capture & Transport Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session '{id}' is not registered")]
    NotFound { id: String },

    #[error("Session '{id}' is already registered")]
    AlreadyRegistered { id: String },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Process {pid} is not available for sampling")]
    ProcessUnavailable { pid: String },

    #[error("Failed to encode capture payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Capture IO failure: {0}")]
    Io(#[from] io::Error),

    #[error("Probe read aborted: {message}")]
    ProbeTask { message: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} answered with status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Local delivery failed: {0}")]
    Store(#[from] StoreError),
}

// ----------------------------------------------------------------------------
// 4.5 Agent Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("Session '{id}' is already registered")]
    DuplicateSession { id: String },

    #[error("Failed to persist session '{id}': {source}")]
    Persist {
        id: String,
        #[source]
        source: TransportError,
    },

    #[error("Invalid profiling request: {0}")]
    InvalidRequest(#[from] ConfigError),

    #[error("Capture target unavailable: {0}")]
    Target(#[from] CaptureError),

    #[error("No tokio runtime available to run collectors")]
    NoRuntime,

    #[error("Profiling agent is shutting down")]
    ShuttingDown,
}

impl AgentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AgentError::SessionNotFound { .. })
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AgentError::NoRuntime | AgentError::ShuttingDown)
    }
}

impl From<RegistryError> for AgentError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { id } => AgentError::SessionNotFound { id },
            RegistryError::AlreadyRegistered { id } => AgentError::DuplicateSession { id },
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Aliases
// ----------------------------------------------------------------------------

pub type ProfilerResult<T> = Result<T, ProfilerError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
pub type CaptureResult<T> = Result<T, CaptureError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type AgentResult<T> = Result<T, AgentError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Defaults from `Default` impls and `default_*` helpers
// - TOML file (missing file is not an error)
// - Environment overrides, `CEREBRO_PROFILER_<SECTION>__<KEY>`
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub agent: AgentConfig,
    pub profiling: ProfilingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl ProfilerConfig {
    /// Load from a TOML file with environment overrides, then validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ProfilerConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ProfilerConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agent.validate()?;
        self.profiling.validate()?;
        self.server.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&ProfilerConfig::default()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 5.2 Agent Configuration
// ----------------------------------------------------------------------------

/// What the auto-trigger loop does when the previous auto session is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AutoOverlapPolicy {
    /// Skip the tick.
    #[default]
    Skip,
    /// Start anyway; sessions overlap.
    Allow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub application_id: String,
    pub application_name: String,
    pub language: String,
    pub mode: ProfileMode,
    /// Process observed in sidecar mode.
    pub target_pid: Option<u32>,
    pub auto_profile: bool,
    #[serde(with = "humantime_serde")]
    pub profile_interval: Duration,
    pub auto_overlap: AutoOverlapPolicy,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            application_id: default_application_id(),
            application_name: default_application_id(),
            language: "rust".to_string(),
            mode: ProfileMode::Embedded,
            target_pid: None,
            auto_profile: false,
            profile_interval: DEFAULT_PROFILE_INTERVAL,
            auto_overlap: AutoOverlapPolicy::Skip,
            request_timeout: DEFAULT_HTTP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

fn default_application_id() -> String {
    "cerebro-app".to_string()
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_entity_id("application", &self.application_id)
            .map_err(|e| ConfigError::invalid("agent.application_id", e.to_string()))?;
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "agent.server_url",
                format!("'{}' is not an http(s) URL", self.server_url),
            ));
        }
        if self.auto_profile && self.profile_interval.is_zero() {
            return Err(ConfigError::invalid(
                "agent.profile_interval",
                "must be positive when auto_profile is enabled",
            ));
        }
        if self.mode == ProfileMode::Sidecar && self.target_pid.is_none() {
            return Err(ConfigError::invalid(
                "agent.target_pid",
                "sidecar mode needs a target process",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("agent.request_timeout", "must be positive"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.3 Profiling Request Configuration
// ----------------------------------------------------------------------------

/// What a single session captures. The default is the auto-trigger profile:
/// CPU and memory for 30s with metrics every 5s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub profile_types: Vec<ProfileType>,
    /// Zero disables the automatic stop.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Zero selects the backend default.
    pub sample_rate: u32,
    pub collect_metrics: bool,
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            profile_types: vec![ProfileType::Cpu, ProfileType::Memory],
            duration: DEFAULT_SESSION_DURATION,
            sample_rate: 0,
            collect_metrics: true,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

impl ProfilingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate > MAX_SAMPLE_RATE_HZ {
            return Err(ConfigError::invalid(
                "profiling.sample_rate",
                format!("{} exceeds the maximum of {MAX_SAMPLE_RATE_HZ}", self.sample_rate),
            ));
        }
        if self.collect_metrics && self.metrics_interval.is_zero() {
            return Err(ConfigError::invalid(
                "profiling.metrics_interval",
                "must be positive when collect_metrics is enabled",
            ));
        }
        let periodic = self.profile_types.iter().any(|t| {
            matches!(t, ProfileType::Memory | ProfileType::Heap | ProfileType::Io)
        });
        if periodic && self.snapshot_interval.is_zero() {
            return Err(ConfigError::invalid(
                "profiling.snapshot_interval",
                "must be positive for heap or io capture",
            ));
        }
        if self.profile_types.is_empty() && !self.collect_metrics {
            return Err(ConfigError::invalid(
                "profiling.profile_types",
                "request captures nothing",
            ));
        }
        Ok(())
    }

    pub fn effective_sample_rate(&self) -> u32 {
        effective_sample_rate(self.sample_rate)
    }
}

pub fn effective_sample_rate(requested: u32) -> u32 {
    match requested {
        0 => DEFAULT_CPU_SAMPLE_RATE_HZ,
        rate => rate.min(MAX_SAMPLE_RATE_HZ),
    }
}

// ----------------------------------------------------------------------------
// 5.4 Collector Server Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            shutdown_timeout: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::invalid("server.listen_addr", format!("{e}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("server.data_dir", "must not be empty"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json", "compact" or "pretty"
    pub format: String,
    /// Daily-rolled log file, in addition to stdout.
    pub file: Option<PathBuf>,
    pub stdout: bool,
    pub colors: bool,
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            file: None,
            stdout: true,
            colors: true,
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "compact" | "pretty" => {}
            other => {
                return Err(ConfigError::invalid(
                    "logging.format",
                    format!("unknown format '{other}'"),
                ))
            }
        }
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" => Ok(()),
            other => Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{other}'"),
            )),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// - EnvFilter seeded from config, RUST_LOG still wins
// - json / compact / pretty stdout layer
// - Optional non-blocking daily file sink whose guard outlives the agent
// ============================================================================

fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file sink when dropped; hand it to
/// [`ProfilingAgent::with_log_guard`] so `close()` releases it.
pub fn init_logging(config: &LoggingConfig) -> ProfilerResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stdout {
        let layer = match config.format.as_str() {
            "json" => tracing_fmt::layer()
                .json()
                .with_target(true)
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .boxed(),
            "pretty" => tracing_fmt::layer()
                .pretty()
                .with_ansi(config.colors)
                .with_target(true)
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .boxed(),
            _ => tracing_fmt::layer()
                .compact()
                .with_ansi(config.colors)
                .with_target(true)
                .boxed(),
        };
        layers.push(layer);
    }

    let guard = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cerebro-profiler.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                tracing_fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ProfilerError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "cerebro::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

/// Collector-task log line carrying the task kind and session id.
#[macro_export]
macro_rules! log_task {
    ($level:ident, $kind:expr, $session:expr, $($arg:tt)+) => {
        tracing::$level!(
            target: "cerebro::collector",
            task = %$kind,
            session_id = %$session,
            $($arg)+
        )
    };
}

// ============================================================================
// SECTION 7: SHARDED MAP & SESSION REGISTRY
// ============================================================================
// Active sessions keyed by id:
// - Entries spread across RwLock shards picked by ahash
// - A mutation locks one shard, unrelated sessions never contend
// - Callers receive clones; collector tasks never hold a registry handle
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Sharded Map
// ----------------------------------------------------------------------------

/// A concurrent hash map split into independently locked shards.
pub struct ShardedMap<K, V, const SHARDS: usize = 64> {
    shards: Box<[RwLock<AHashMap<K, V>>; SHARDS]>,
    len: AtomicUsize,
}

impl<K, V, const SHARDS: usize> ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            shards: Box::new(std::array::from_fn(|_| RwLock::new(AHashMap::new()))),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard<Q>(&self, key: &Q) -> &RwLock<AHashMap<K, V>>
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Insert only if the key is absent. Hands the value back otherwise.
    pub fn insert_new(&self, key: K, value: V) -> Result<(), V> {
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return Err(value);
        }
        shard.insert(key, value);
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Insert or replace, returning the previous value.
    pub fn upsert(&self, key: K, value: V) -> Option<V> {
        let mut shard = self.shard(&key).write();
        let old = shard.insert(key, value);
        if old.is_none() {
            self.len.fetch_add(1, AtomicOrdering::Relaxed);
        }
        old
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().contains_key(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.shard(key).write().remove(key);
        if removed.is_some() {
            self.len.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Remove and return every entry, one shard at a time.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let taken = std::mem::take(&mut *shard.write());
            self.len.fetch_sub(taken.len(), AtomicOrdering::Relaxed);
            drained.extend(taken);
        }
        drained
    }
}

impl<K, V, const SHARDS: usize> Default for ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const SHARDS: usize> Debug for ShardedMap<K, V, SHARDS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &SHARDS)
            .field("len", &self.len.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 7.2 Session Registry
// ----------------------------------------------------------------------------

/// Lookup table of active sessions. Absent ids are reported as
/// [`RegistryError::NotFound`], which callers treat as "already stopped".
#[derive(Debug)]
pub struct SessionRegistry<T> {
    entries: ShardedMap<String, T, REGISTRY_SHARDS>,
}

impl<T: Clone> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: ShardedMap::new(),
        }
    }

    pub fn register(&self, id: &str, state: T) -> RegistryResult<()> {
        self.entries
            .insert_new(id.to_string(), state)
            .map_err(|_| RegistryError::AlreadyRegistered { id: id.to_string() })
    }

    pub fn upsert(&self, id: &str, state: T) -> Option<T> {
        self.entries.upsert(id.to_string(), state)
    }

    pub fn lookup(&self, id: &str) -> RegistryResult<T> {
        self.entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    pub fn deregister(&self, id: &str) -> RegistryResult<T> {
        self.entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys()
    }

    /// Deregister everything. Each entry is handed out exactly once.
    pub fn drain(&self) -> Vec<(String, T)> {
        self.entries.drain()
    }
}

impl<T: Clone> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SECTION 8: ARTIFACT STORE
// ============================================================================
// Durable layout under one base directory:
//   sessions/<id>.json                      whole-record overwrite via rename
//   profiles/<sid>/<type>_<ts>.pprof        raw payload
//   profiles/<sid>/<type>_<ts>.meta.json    sidecar, written after the payload
//   metrics/<sid>/metrics.jsonl             one snapshot per appended line
// Exclusion is striped by session id: writers of one session exclude each
// other and that session's readers only.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Store Contract
// ----------------------------------------------------------------------------

/// Persistence for sessions, profile artifacts and metrics streams.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Overwrite the session record; returns what was stored.
    fn save_session(&self, session: &ProfileSession) -> StoreResult<ProfileSession>;

    fn get_session(&self, id: &str) -> StoreResult<ProfileSession>;

    /// Every readable session, optionally only those of one application.
    /// Unreadable records are skipped.
    fn list_sessions(&self, application_id: Option<&str>) -> StoreResult<Vec<ProfileSession>>;

    /// Remove the session record with its artifacts and metrics. Absent parts are ignored.
    fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Persist an artifact; returns the payload path.
    fn save_profile_data(&self, artifact: &ProfileArtifact) -> StoreResult<PathBuf>;

    fn get_profile_data(&self, session_id: &str) -> StoreResult<Vec<ProfileArtifact>>;

    fn save_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> StoreResult<()>;

    /// Snapshots in append order. Malformed lines are skipped.
    fn get_metrics(&self, session_id: &str) -> StoreResult<Vec<MetricsSnapshot>>;
}

/// Run a store call on the blocking pool.
pub async fn store_call<T, F>(store: &Arc<dyn ArtifactStore>, call: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ArtifactStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || call(store.as_ref())).await {
        Ok(result) => result,
        Err(join) => Err(StoreError::Background {
            message: join.to_string(),
        }),
    }
}

// ----------------------------------------------------------------------------
// 8.2 Lock Stripes
// ----------------------------------------------------------------------------

/// Readers-writer stripes keyed by entity id. One operation holds one stripe.
pub struct EntityLocks<const STRIPES: usize = 64> {
    stripes: Box<[RwLock<()>; STRIPES]>,
}

impl<const STRIPES: usize> EntityLocks<STRIPES> {
    pub fn new() -> Self {
        Self {
            stripes: Box::new(std::array::from_fn(|_| RwLock::new(()))),
        }
    }

    fn stripe(&self, id: &str) -> &RwLock<()> {
        let mut hasher = AHasher::default();
        id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPES]
    }

    pub fn read(&self, id: &str) -> RwLockReadGuard<'_, ()> {
        self.stripe(id).read()
    }

    pub fn write(&self, id: &str) -> RwLockWriteGuard<'_, ()> {
        self.stripe(id).write()
    }
}

impl<const STRIPES: usize> Default for EntityLocks<STRIPES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const STRIPES: usize> Debug for EntityLocks<STRIPES> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLocks").field("stripes", &STRIPES).finish()
    }
}

// ----------------------------------------------------------------------------
// 8.3 File Helpers
// ----------------------------------------------------------------------------

/// Write to `<name>.tmp` then rename over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Outcome of one bounded line read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    Line,
    /// The line exceeded the limit and was consumed without being buffered.
    Oversized,
    Eof,
}

/// Read up to the next `\n` into `buf`, never buffering more than `max` bytes.
fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead> {
    buf.clear();
    let mut oversized = false;
    let mut read_any = false;
    loop {
        let (consumed, found_newline) = {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                return Ok(match (read_any, oversized) {
                    (false, _) => LineRead::Eof,
                    (true, true) => LineRead::Oversized,
                    (true, false) => LineRead::Line,
                });
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let end = newline.unwrap_or(available.len());
            if !oversized {
                if buf.len() + end > max {
                    oversized = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(&available[..end]);
                }
            }
            (newline.map_or(available.len(), |pos| pos + 1), newline.is_some())
        };
        reader.consume(consumed);
        read_any = true;
        if found_newline {
            return Ok(if oversized { LineRead::Oversized } else { LineRead::Line });
        }
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

// ----------------------------------------------------------------------------
// 8.4 Artifact Sidecar
// ----------------------------------------------------------------------------

/// Everything needed to rebuild a [`ProfileArtifact`] besides the payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArtifactMeta {
    session_id: String,
    #[serde(rename = "type")]
    profile_type: ProfileType,
    timestamp: DateTime<Utc>,
    sample_rate: u32,
    sample_count: u64,
    size_bytes: u64,
    #[serde(default)]
    metadata: JsonMap<String, JsonValue>,
    file: String,
}

const PAYLOAD_EXT: &str = "pprof";
const META_SUFFIX: &str = ".meta.json";
const METRICS_FILE: &str = "metrics.jsonl";

// ----------------------------------------------------------------------------
// 8.5 File Store
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    locks: EntityLocks<STORE_LOCK_STRIPES>,
}

impl FileStore {
    /// Open (creating as needed) a store rooted at `base_dir`.
    pub fn open<P: AsRef<Path>>(base_dir: P) -> StoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        for dir in ["sessions", "profiles", "metrics"] {
            let path = base_dir.join(dir);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        info!(target: "cerebro::store", base_dir = %base_dir.display(), "Artifact store opened");
        Ok(Self {
            base_dir,
            locks: EntityLocks::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    fn profile_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join("profiles").join(session_id)
    }

    fn metrics_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join("metrics").join(session_id)
    }

    fn read_session_file(path: &Path, id: &str) -> StoreResult<ProfileSession> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found("session", id))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::serialization(path, e))
    }

    /// `<type>_<YYYYmmdd_HHMMSS>_<nanos>` plus `_<n>` if that name is taken.
    /// Caller holds the session's write stripe.
    fn unique_artifact_stem(dir: &Path, artifact: &ProfileArtifact) -> String {
        let base = format!(
            "{}_{}",
            artifact.profile_type,
            artifact.timestamp.format("%Y%m%d_%H%M%S_%9f")
        );
        let taken = |stem: &str| {
            dir.join(format!("{stem}.{PAYLOAD_EXT}")).exists()
                || dir.join(format!("{stem}{META_SUFFIX}")).exists()
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}_{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn load_artifact(dir: &Path, meta_path: &Path) -> StoreResult<ProfileArtifact> {
        let raw = fs::read(meta_path).map_err(|e| StoreError::io(meta_path, e))?;
        let meta: ArtifactMeta =
            serde_json::from_slice(&raw).map_err(|e| StoreError::serialization(meta_path, e))?;
        if meta.file.is_empty() || meta.file.contains(['/', '\\']) || meta.file.starts_with('.') {
            return Err(StoreError::validation(format!(
                "sidecar {} references invalid payload '{}'",
                meta_path.display(),
                meta.file
            )));
        }
        let payload_path = dir.join(&meta.file);
        let data = fs::read(&payload_path).map_err(|e| StoreError::io(&payload_path, e))?;
        if data.len() as u64 != meta.size_bytes {
            return Err(StoreError::validation(format!(
                "payload {} has {} bytes, sidecar records {}",
                payload_path.display(),
                data.len(),
                meta.size_bytes
            )));
        }
        Ok(ProfileArtifact {
            session_id: meta.session_id,
            profile_type: meta.profile_type,
            timestamp: meta.timestamp,
            data,
            metadata: meta.metadata,
            sample_rate: meta.sample_rate,
            sample_count: meta.sample_count,
        })
    }
}

impl ArtifactStore for FileStore {
    fn save_session(&self, session: &ProfileSession) -> StoreResult<ProfileSession> {
        validate_entity_id("session", &session.id)?;
        let mut stored = session.clone();
        if stored.data_path.is_empty() {
            stored.data_path = self.profile_dir(&stored.id).display().to_string();
        }
        let path = self.session_path(&stored.id);
        let bytes =
            serde_json::to_vec_pretty(&stored).map_err(|e| StoreError::serialization(&path, e))?;

        let _guard = self.locks.write(&stored.id);
        write_atomically(&path, &bytes)?;
        debug!(target: "cerebro::store", session_id = %stored.id, "Session saved");
        Ok(stored)
    }

    fn get_session(&self, id: &str) -> StoreResult<ProfileSession> {
        validate_entity_id("session", id)?;
        let _guard = self.locks.read(id);
        Self::read_session_file(&self.session_path(id), id)
    }

    fn list_sessions(&self, application_id: Option<&str>) -> StoreResult<Vec<ProfileSession>> {
        let dir = self.sessions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "cerebro::store", error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if validate_entity_id("session", id).is_err() {
                continue;
            }

            let session = {
                let _guard = self.locks.read(id);
                Self::read_session_file(&entry.path(), id)
            };
            match session {
                Ok(session) => {
                    if application_id.map_or(true, |app| session.application_id == app) {
                        sessions.push(session);
                    }
                }
                Err(e) => {
                    warn!(target: "cerebro::store", file = %name, error = %e, "Skipping corrupt session record");
                }
            }
        }
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn delete_session(&self, id: &str) -> StoreResult<()> {
        validate_entity_id("session", id)?;
        let session_path = self.session_path(id);
        let profile_dir = self.profile_dir(id);
        let metrics_dir = self.metrics_dir(id);

        let _guard = self.locks.write(id);
        ignore_not_found(fs::remove_file(&session_path))
            .map_err(|e| StoreError::io(&session_path, e))?;
        ignore_not_found(fs::remove_dir_all(&profile_dir))
            .map_err(|e| StoreError::io(&profile_dir, e))?;
        ignore_not_found(fs::remove_dir_all(&metrics_dir))
            .map_err(|e| StoreError::io(&metrics_dir, e))?;
        info!(target: "cerebro::store", session_id = %id, "Session deleted");
        Ok(())
    }

    fn save_profile_data(&self, artifact: &ProfileArtifact) -> StoreResult<PathBuf> {
        validate_entity_id("session", &artifact.session_id)?;
        let dir = self.profile_dir(&artifact.session_id);

        let _guard = self.locks.write(&artifact.session_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let stem = Self::unique_artifact_stem(&dir, artifact);
        let payload_name = format!("{stem}.{PAYLOAD_EXT}");
        let payload_path = dir.join(&payload_name);
        let meta_path = dir.join(format!("{stem}{META_SUFFIX}"));

        let meta = ArtifactMeta {
            session_id: artifact.session_id.clone(),
            profile_type: artifact.profile_type,
            timestamp: artifact.timestamp,
            sample_rate: artifact.sample_rate,
            sample_count: artifact.sample_count,
            size_bytes: artifact.data.len() as u64,
            metadata: artifact.metadata.clone(),
            file: payload_name,
        };
        let meta_bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| StoreError::serialization(&meta_path, e))?;

        write_atomically(&payload_path, &artifact.data)?;
        write_atomically(&meta_path, &meta_bytes)?;
        debug!(
            target: "cerebro::store",
            session_id = %artifact.session_id,
            profile_type = %artifact.profile_type,
            bytes = artifact.data.len(),
            "Profile artifact saved"
        );
        Ok(payload_path)
    }

    fn get_profile_data(&self, session_id: &str) -> StoreResult<Vec<ProfileArtifact>> {
        validate_entity_id("session", session_id)?;
        let dir = self.profile_dir(session_id);

        let _guard = self.locks.read(session_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut found: Vec<(String, ProfileArtifact)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            match Self::load_artifact(&dir, &entry.path()) {
                Ok(artifact) => found.push((name, artifact)),
                Err(e) => {
                    warn!(target: "cerebro::store", session_id, file = %name, error = %e, "Skipping unreadable artifact");
                }
            }
        }
        found.sort_by(|(a_name, a), (b_name, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a_name.cmp(b_name))
        });
        Ok(found.into_iter().map(|(_, artifact)| artifact).collect())
    }

    fn save_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        validate_entity_id("session", session_id)?;
        let dir = self.metrics_dir(session_id);
        let path = dir.join(METRICS_FILE);
        let mut line = serde_json::to_vec(snapshot).map_err(|e| StoreError::serialization(&path, e))?;
        line.push(b'\n');

        let _guard = self.locks.write(session_id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn get_metrics(&self, session_id: &str) -> StoreResult<Vec<MetricsSnapshot>> {
        validate_entity_id("session", session_id)?;
        let path = self.metrics_dir(session_id).join(METRICS_FILE);

        let _guard = self.locks.read(session_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut snapshots = Vec::new();
        let mut line_no = 0usize;
        loop {
            let outcome = read_bounded_line(&mut reader, &mut buf, MAX_METRICS_LINE_BYTES)
                .map_err(|e| StoreError::io(&path, e))?;
            line_no += 1;
            match outcome {
                LineRead::Eof => break,
                LineRead::Oversized => {
                    warn!(target: "cerebro::store", session_id, line = line_no, "Skipping oversized metrics line");
                }
                LineRead::Line => {
                    let trimmed = trim_whitespace(&buf);
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<MetricsSnapshot>(trimmed) {
                        Ok(snapshot) => snapshots.push(snapshot),
                        Err(e) => {
                            warn!(target: "cerebro::store", session_id, line = line_no, error = %e, "Skipping malformed metrics line");
                        }
                    }
                }
            }
        }
        Ok(snapshots)
    }
}

// ============================================================================
// SECTION 9: DISPATCH
// ============================================================================
// The hop between collector tasks and durable storage:
// - HttpDispatcher posts to a collector server
// - LocalDispatcher writes into an ArtifactStore in-process
// ============================================================================

/// Delivers finished sessions, artifacts and metrics.
///
/// `send_session` must only return `Ok` once the record is accepted for
/// persistence. Collectors treat `send_profile`/`send_metrics` failures as
/// dropped samples.
#[async_trait]
pub trait Dispatcher: Send + Sync + Debug {
    async fn send_session(&self, session: &ProfileSession) -> TransportResult<()>;

    async fn send_profile(&self, artifact: &ProfileArtifact) -> TransportResult<()>;

    async fn send_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> TransportResult<()>;
}

// ----------------------------------------------------------------------------
// 9.1 HTTP Dispatcher
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDispatcher {
    pub fn new(server_url: &str, request_timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("cerebro-profiler/{PROFILER_VERSION}"))
            .build()
            .map_err(|source| TransportError::Client { source })?;
        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> TransportResult<Self> {
        Self::new(&config.server_url, config.request_timeout)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn post_json<T>(&self, path: &str, body: &T) -> TransportResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let endpoint = self.endpoint(path);
        let response = self
            .client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            endpoint,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send_session(&self, session: &ProfileSession) -> TransportResult<()> {
        self.post_json("/sessions", session).await
    }

    async fn send_profile(&self, artifact: &ProfileArtifact) -> TransportResult<()> {
        self.post_json("/profiles", artifact).await
    }

    async fn send_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> TransportResult<()> {
        let envelope = MetricsEnvelope {
            session_id: session_id.to_string(),
            metrics: snapshot.clone(),
        };
        self.post_json("/metrics", &envelope).await
    }
}

// ----------------------------------------------------------------------------
// 9.2 Local Dispatcher
// ----------------------------------------------------------------------------

/// Writes straight into a store, for agents running without a collector.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    store: Arc<dyn ArtifactStore>,
}

impl LocalDispatcher {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn send_session(&self, session: &ProfileSession) -> TransportResult<()> {
        let session = session.clone();
        store_call(&self.store, move |store| store.save_session(&session).map(|_| ())).await?;
        Ok(())
    }

    async fn send_profile(&self, artifact: &ProfileArtifact) -> TransportResult<()> {
        let artifact = artifact.clone();
        store_call(&self.store, move |store| store.save_profile_data(&artifact).map(|_| ())).await?;
        Ok(())
    }

    async fn send_metrics(&self, session_id: &str, snapshot: &MetricsSnapshot) -> TransportResult<()> {
        let session_id = session_id.to_string();
        let snapshot = snapshot.clone();
        store_call(&self.store, move |store| store.save_metrics(&session_id, &snapshot)).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION 10: CAPTURE BACKENDS & PROCESS PROBE
// ============================================================================
// Capture backends produce opaque payloads; the store never looks inside.
// The default backend samples the target process through sysinfo, and the
// probe reads /proc/<pid>/io for IO counters.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Capture Backend Contract
// ----------------------------------------------------------------------------

/// A finished capture before it is bound to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedProfile {
    pub data: Vec<u8>,
    pub sample_count: u64,
    pub sample_rate: u32,
    pub metadata: JsonMap<String, JsonValue>,
}

impl CapturedProfile {
    pub fn into_artifact(self, session_id: &str, profile_type: ProfileType) -> ProfileArtifact {
        ProfileArtifact {
            session_id: session_id.to_string(),
            profile_type,
            timestamp: Utc::now(),
            data: self.data,
            metadata: self.metadata,
            sample_rate: self.sample_rate,
            sample_count: self.sample_count,
        }
    }
}

#[async_trait]
pub trait CaptureBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Record CPU samples until `stop` fires, then return the finalized buffer.
    async fn record_cpu(&self, sample_rate: u32, stop: CancellationToken) -> CaptureResult<CapturedProfile>;

    /// Take one full heap snapshot.
    async fn snapshot_heap(&self) -> CaptureResult<CapturedProfile>;
}

/// The process an agent observes: `target_pid` if set, else itself.
pub fn resolve_target_pid(config: &AgentConfig) -> CaptureResult<Pid> {
    match config.target_pid {
        Some(pid) => Ok(Pid::from_u32(pid)),
        None => sysinfo::get_current_pid().map_err(|e| CaptureError::ProcessUnavailable {
            pid: format!("self ({e})"),
        }),
    }
}

fn to_json_map<T: Serialize>(value: &T) -> Result<JsonMap<String, JsonValue>, serde_json::Error> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
    }
}

// ----------------------------------------------------------------------------
// 10.2 Process Probe
// ----------------------------------------------------------------------------

/// Cumulative IO counters of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Parse `/proc/[pid]/io`.
pub fn parse_proc_io(content: &str) -> IoCounters {
    let mut counters = IoCounters::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value: u64 = value.trim().parse().unwrap_or(0);
        match key.trim() {
            "read_bytes" => counters.read_bytes = value,
            "write_bytes" => counters.write_bytes = value,
            "syscr" => counters.read_ops = value,
            "syscw" => counters.write_ops = value,
            _ => {}
        }
    }
    counters
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub disk_read_total: u64,
    pub disk_written_total: u64,
}

/// Reads process and system counters. CPU usage is relative to the previous
/// refresh, so keep one probe per task.
pub struct ProcessProbe {
    pid: Pid,
    system: System,
}

impl ProcessProbe {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            system: System::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Run `read` on the blocking pool and hand the probe back with its
    /// result. Refreshes and `/proc` reads never touch runtime workers.
    pub async fn read_blocking<T, F>(mut self, read: F) -> CaptureResult<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProcessProbe) -> T + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let out = read(&mut self);
            (self, out)
        })
        .await
        .map_err(|join| CaptureError::ProbeTask {
            message: join.to_string(),
        })
    }

    /// `None` once the process is gone.
    pub fn sample(&mut self) -> Option<ProcessSample> {
        if !self.system.refresh_process(self.pid) {
            return None;
        }
        let process = self.system.process(self.pid)?;
        let disk = process.disk_usage();
        Some(ProcessSample {
            cpu_percent: f64::from(process.cpu_usage()),
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            disk_read_total: disk.total_read_bytes,
            disk_written_total: disk.total_written_bytes,
        })
    }

    /// Used and total system memory in bytes.
    pub fn system_memory(&mut self) -> (u64, u64) {
        self.system.refresh_memory();
        (self.system.used_memory(), self.system.total_memory())
    }

    fn proc_io(&self) -> Option<IoCounters> {
        fs::read_to_string(format!("/proc/{}/io", self.pid))
            .ok()
            .map(|content| parse_proc_io(&content))
    }

    /// Prefers `/proc/<pid>/io`; elsewhere falls back to sysinfo disk usage,
    /// which has no operation counts.
    pub fn io_counters(&mut self) -> Option<IoCounters> {
        if let Some(counters) = self.proc_io() {
            return Some(counters);
        }
        self.sample().map(|sample| IoCounters {
            read_bytes: sample.disk_read_total,
            write_bytes: sample.disk_written_total,
            ..IoCounters::default()
        })
    }

    pub fn metrics_snapshot(&mut self, concurrency_units: Option<u64>) -> MetricsSnapshot {
        let (memory_used, memory_total) = self.system_memory();
        let sample = self.sample().unwrap_or_default();
        let io = self.proc_io().unwrap_or(IoCounters {
            read_bytes: sample.disk_read_total,
            write_bytes: sample.disk_written_total,
            ..IoCounters::default()
        });
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };
        MetricsSnapshot {
            timestamp: Utc::now(),
            cpu_percent: sample.cpu_percent,
            memory_used,
            memory_total,
            memory_percent,
            io_read_bytes: io.read_bytes,
            io_write_bytes: io.write_bytes,
            io_read_ops: io.read_ops,
            io_write_ops: io.write_ops,
            concurrency_units,
            heap_alloc: sample.rss_bytes,
            heap_sys: sample.virtual_bytes,
            gc_pause_total: None,
        }
    }
}

impl Debug for ProcessProbe {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessProbe").field("pid", &self.pid).finish()
    }
}

// ----------------------------------------------------------------------------
// 10.3 IO Delta Tracking
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoDelta {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Baseline for IO deltas. With no previous reading the baseline is zero,
/// so the first delta equals the current counters.
#[derive(Debug, Clone, Default)]
pub struct IoDeltaTracker {
    previous: Option<IoCounters>,
}

impl IoDeltaTracker {
    pub fn advance(&mut self, current: IoCounters) -> IoDelta {
        let base = self.previous.unwrap_or_default();
        self.previous = Some(current);
        IoDelta {
            read_bytes: current.read_bytes.saturating_sub(base.read_bytes),
            write_bytes: current.write_bytes.saturating_sub(base.write_bytes),
            read_ops: current.read_ops.saturating_sub(base.read_ops),
            write_ops: current.write_ops.saturating_sub(base.write_ops),
        }
    }
}

/// JSON body of an IO artifact, also used as its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSampleRecord {
    pub timestamp: DateTime<Utc>,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_delta: u64,
    pub write_delta: u64,
}

impl IoSampleRecord {
    fn new(counters: IoCounters, delta: IoDelta) -> Self {
        Self {
            timestamp: Utc::now(),
            read_bytes: counters.read_bytes,
            write_bytes: counters.write_bytes,
            read_count: counters.read_ops,
            write_count: counters.write_ops,
            read_delta: delta.read_bytes,
            write_delta: delta.write_bytes,
        }
    }
}

// ----------------------------------------------------------------------------
// 10.4 Process Sampler (default backend)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct CpuSample {
    offset_ms: u64,
    cpu_percent: f64,
    rss_bytes: u64,
}

#[derive(Debug, Serialize)]
struct CpuSampleDocument<'a> {
    format: &'static str,
    pid: u32,
    sample_rate_hz: u32,
    duration_ms: u64,
    samples: &'a [CpuSample],
}

#[derive(Debug, Serialize)]
struct HeapSnapshotDocument {
    format: &'static str,
    pid: u32,
    timestamp: DateTime<Utc>,
    rss_bytes: u64,
    virtual_bytes: u64,
    system_used_bytes: u64,
    system_total_bytes: u64,
}

/// Samples CPU and resident memory of one process through sysinfo.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSampler {
    pid: Pid,
}

impl ProcessSampler {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn for_agent(config: &AgentConfig) -> CaptureResult<Self> {
        Ok(Self::new(resolve_target_pid(config)?))
    }

    fn unavailable(&self) -> CaptureError {
        CaptureError::ProcessUnavailable {
            pid: self.pid.to_string(),
        }
    }
}

#[async_trait]
impl CaptureBackend for ProcessSampler {
    fn name(&self) -> &'static str {
        "process-sampler"
    }

    async fn record_cpu(&self, sample_rate: u32, stop: CancellationToken) -> CaptureResult<CapturedProfile> {
        let rate = effective_sample_rate(sample_rate);
        let period = Duration::from_secs_f64(1.0 / f64::from(rate)).max(Duration::from_millis(1));
        let (mut probe, first) = ProcessProbe::new(self.pid).read_blocking(|p| p.sample()).await?;
        if first.is_none() {
            return Err(self.unavailable());
        }

        let started = TokioInstant::now();
        let mut ticker = interval_at(started + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut samples = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let (next, sample) = probe.read_blocking(|p| p.sample()).await?;
                    probe = next;
                    if let Some(sample) = sample {
                        samples.push(CpuSample {
                            offset_ms: started.elapsed().as_millis() as u64,
                            cpu_percent: sample.cpu_percent,
                            rss_bytes: sample.rss_bytes,
                        });
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let data = serde_json::to_vec(&CpuSampleDocument {
            format: PROCESS_CPU_FORMAT,
            pid: self.pid.as_u32(),
            sample_rate_hz: rate,
            duration_ms,
            samples: &samples,
        })?;
        let mut metadata = JsonMap::new();
        metadata.insert("backend".to_string(), json!(self.name()));
        metadata.insert("format".to_string(), json!(PROCESS_CPU_FORMAT));
        metadata.insert("duration_ms".to_string(), json!(duration_ms));
        Ok(CapturedProfile {
            data,
            sample_count: samples.len() as u64,
            sample_rate: rate,
            metadata,
        })
    }

    async fn snapshot_heap(&self) -> CaptureResult<CapturedProfile> {
        let (_, (sample, (system_used_bytes, system_total_bytes))) = ProcessProbe::new(self.pid)
            .read_blocking(|p| (p.sample(), p.system_memory()))
            .await?;
        let sample = sample.ok_or_else(|| self.unavailable())?;
        let data = serde_json::to_vec(&HeapSnapshotDocument {
            format: PROCESS_HEAP_FORMAT,
            pid: self.pid.as_u32(),
            timestamp: Utc::now(),
            rss_bytes: sample.rss_bytes,
            virtual_bytes: sample.virtual_bytes,
            system_used_bytes,
            system_total_bytes,
        })?;
        let mut metadata = JsonMap::new();
        metadata.insert("backend".to_string(), json!(self.name()));
        metadata.insert("format".to_string(), json!(PROCESS_HEAP_FORMAT));
        Ok(CapturedProfile {
            data,
            sample_count: 1,
            sample_rate: 0,
            metadata,
        })
    }
}

// ============================================================================
// SECTION 11: COLLECTOR TASKS
// ============================================================================
// One task per requested kind per session, each bound to a child of the
// session's cancellation token:
// - CPU: bracketed, flushes exactly once when the token fires
// - Heap / IO / Metrics: periodic, biased towards cancellation so no tick
//   runs after stop
// Dispatch failures are counted and logged, never fatal to the schedule.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Collector Kinds & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    CpuCapture,
    HeapSnapshot,
    IoDelta,
    Metrics,
}

impl CollectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::CpuCapture => "cpu_capture",
            CollectorKind::HeapSnapshot => "heap_snapshot",
            CollectorKind::IoDelta => "io_delta",
            CollectorKind::Metrics => "metrics",
        }
    }
}

impl Display for CollectorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one collector kind, shared by every session.
#[derive(Debug, Default)]
pub struct CollectorStats {
    captures: AtomicU64,
    capture_failures: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStatsSnapshot {
    pub captures: u64,
    pub capture_failures: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
}

impl CollectorStats {
    pub fn snapshot(&self) -> CollectorStatsSnapshot {
        CollectorStatsSnapshot {
            captures: self.captures.load(AtomicOrdering::Relaxed),
            capture_failures: self.capture_failures.load(AtomicOrdering::Relaxed),
            dispatched: self.dispatched.load(AtomicOrdering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Keeps the live collector count accurate however a task exits.
#[derive(Debug)]
struct LiveTaskGuard(Arc<AtomicUsize>);

impl LiveTaskGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveTaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// 11.2 Collector Context
// ----------------------------------------------------------------------------

/// What a collector task owns: its own token, never a registry handle.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    pub session_id: String,
    pub cancel: CancellationToken,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub backend: Arc<dyn CaptureBackend>,
    pub stats: Arc<CollectorStats>,
    pub live_tasks: Arc<AtomicUsize>,
    pub target_pid: Pid,
}

impl CollectorContext {
    async fn dispatch_profile(&self, kind: CollectorKind, artifact: &ProfileArtifact) {
        match self.dispatcher.send_profile(artifact).await {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
                log_task!(trace, kind, self.session_id, bytes = artifact.data.len(), "Artifact dispatched");
            }
            Err(e) => {
                self.stats.dispatch_failures.fetch_add(1, AtomicOrdering::Relaxed);
                log_task!(warn, kind, self.session_id, error = %e, "Artifact dispatch failed; sample dropped");
            }
        }
    }

    async fn dispatch_metrics(&self, snapshot: &MetricsSnapshot) {
        match self.dispatcher.send_metrics(&self.session_id, snapshot).await {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Err(e) => {
                self.stats.dispatch_failures.fetch_add(1, AtomicOrdering::Relaxed);
                log_task!(warn, CollectorKind::Metrics, self.session_id, error = %e, "Metrics dispatch failed; sample dropped");
            }
        }
    }

    fn record_capture(&self) {
        self.stats.captures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_capture_failure(&self, kind: CollectorKind, err: &CaptureError) {
        self.stats.capture_failures.fetch_add(1, AtomicOrdering::Relaxed);
        log_task!(warn, kind, self.session_id, error = %err, "Capture failed");
    }

    /// Wait for the next tick; `false` once cancelled.
    async fn next_tick(&self, ticker: &mut Interval) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = ticker.tick() => true,
        }
    }
}

/// Ticker whose first fire is one period from now.
fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK_PERIOD);
    let mut ticker = interval_at(TokioInstant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

// ----------------------------------------------------------------------------
// 11.3 Task Bodies
// ----------------------------------------------------------------------------

/// Bracketed CPU capture: record until cancelled, then flush once.
pub async fn run_cpu_capture(ctx: CollectorContext, sample_rate: u32) {
    let kind = CollectorKind::CpuCapture;
    log_task!(debug, kind, ctx.session_id, sample_rate, "CPU capture started");

    let captured = match ctx.backend.record_cpu(sample_rate, ctx.cancel.clone()).await {
        Ok(captured) => captured,
        Err(e) => {
            ctx.record_capture_failure(kind, &e);
            return;
        }
    };
    ctx.record_capture();
    let artifact = captured.into_artifact(&ctx.session_id, ProfileType::Cpu);
    ctx.dispatch_profile(kind, &artifact).await;
    log_task!(debug, kind, ctx.session_id, samples = artifact.sample_count, "CPU capture flushed");
}

pub async fn run_heap_snapshots(ctx: CollectorContext, period: Duration) {
    let kind = CollectorKind::HeapSnapshot;
    let mut ticker = ticker(period);
    while ctx.next_tick(&mut ticker).await {
        match ctx.backend.snapshot_heap().await {
            Ok(captured) => {
                ctx.record_capture();
                let artifact = captured.into_artifact(&ctx.session_id, ProfileType::Heap);
                ctx.dispatch_profile(kind, &artifact).await;
            }
            Err(e) => ctx.record_capture_failure(kind, &e),
        }
    }
    log_task!(debug, kind, ctx.session_id, "Heap snapshots stopped");
}

pub async fn run_io_deltas(ctx: CollectorContext, period: Duration) {
    let kind = CollectorKind::IoDelta;
    let mut probe = ProcessProbe::new(ctx.target_pid);
    let mut tracker = IoDeltaTracker::default();
    let mut ticker = ticker(period);
    while ctx.next_tick(&mut ticker).await {
        let counters = match probe.read_blocking(|p| p.io_counters()).await {
            Ok((next, counters)) => {
                probe = next;
                counters
            }
            Err(e) => {
                ctx.record_capture_failure(kind, &e);
                break;
            }
        };
        let Some(counters) = counters else {
            ctx.record_capture_failure(
                kind,
                &CaptureError::ProcessUnavailable {
                    pid: ctx.target_pid.to_string(),
                },
            );
            continue;
        };
        let record = IoSampleRecord::new(counters, tracker.advance(counters));
        let encoded = serde_json::to_vec(&record).and_then(|data| Ok((data, to_json_map(&record)?)));
        let (data, metadata) = match encoded {
            Ok(parts) => parts,
            Err(e) => {
                ctx.record_capture_failure(kind, &CaptureError::Encode(e));
                continue;
            }
        };
        ctx.record_capture();
        let artifact = CapturedProfile {
            data,
            sample_count: 1,
            sample_rate: 0,
            metadata,
        }
        .into_artifact(&ctx.session_id, ProfileType::Io);
        ctx.dispatch_profile(kind, &artifact).await;
    }
    log_task!(debug, kind, ctx.session_id, "IO deltas stopped");
}

pub async fn run_metrics(ctx: CollectorContext, period: Duration) {
    let kind = CollectorKind::Metrics;
    // Prime CPU accounting so the first snapshot reports a real delta.
    let primed = ProcessProbe::new(ctx.target_pid)
        .read_blocking(|p| {
            let _ = p.sample();
        })
        .await;
    let mut probe = match primed {
        Ok((probe, ())) => probe,
        Err(e) => {
            ctx.record_capture_failure(kind, &e);
            return;
        }
    };
    let mut ticker = ticker(period);
    while ctx.next_tick(&mut ticker).await {
        let units = ctx.live_tasks.load(AtomicOrdering::Relaxed) as u64;
        let snapshot = match probe.read_blocking(move |p| p.metrics_snapshot(Some(units))).await {
            Ok((next, snapshot)) => {
                probe = next;
                snapshot
            }
            Err(e) => {
                ctx.record_capture_failure(kind, &e);
                break;
            }
        };
        ctx.record_capture();
        ctx.dispatch_metrics(&snapshot).await;
    }
    log_task!(debug, kind, ctx.session_id, "Metrics collection stopped");
}

// ============================================================================
// SECTION 12: SESSION LIFECYCLE CONTROLLER
// ============================================================================
// Token tree:
//   root (agent)  ── cancelled by close()
//     └─ session  ── cancelled by stop_profiling()
//          └─ one child per collector task
// Every spawned future is tracked so close() can wait for final flushes.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Active Session
// ----------------------------------------------------------------------------

/// Controller-owned state of a running session.
#[derive(Debug)]
pub struct ActiveSession {
    id: String,
    record: Mutex<ProfileSession>,
    started: TokioInstant,
    cancel: CancellationToken,
    auto_triggered: bool,
}

impl ActiveSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> ProfileSession {
        self.record.lock().clone()
    }

    /// False once the session's token has fired.
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn is_auto_triggered(&self) -> bool {
        self.auto_triggered
    }
}

// ----------------------------------------------------------------------------
// 12.2 Profiling Agent
// ----------------------------------------------------------------------------

/// Starts, stops and auto-triggers profiling sessions.
///
/// Must be created and used inside a tokio runtime. Cloning is cheap and
/// every clone drives the same agent.
#[derive(Debug, Clone)]
pub struct ProfilingAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    target_pid: Pid,
    dispatcher: Arc<dyn Dispatcher>,
    backend: Arc<dyn CaptureBackend>,
    registry: SessionRegistry<Arc<ActiveSession>>,
    root: CancellationToken,
    tasks: TaskTracker,
    runtime: RuntimeHandle,
    live_tasks: Arc<AtomicUsize>,
    stats: DashMap<CollectorKind, Arc<CollectorStats>>,
    last_auto_session: Mutex<Option<String>>,
    log_guard: Mutex<Option<WorkerGuard>>,
    closed: AtomicBool,
    /// Starts hold it shared from the shutdown check through registration;
    /// close holds it exclusively while cancelling and draining.
    lifecycle: RwLock<()>,
}

impl Debug for AgentInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInner")
            .field("application_id", &self.config.application_id)
            .field("target_pid", &self.target_pid)
            .field("backend", &self.backend.name())
            .field("active_sessions", &self.registry.active_count())
            .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl ProfilingAgent {
    /// Build an agent and, if `auto_profile` is set, start its trigger loop.
    pub fn new(
        config: AgentConfig,
        dispatcher: Arc<dyn Dispatcher>,
        backend: Arc<dyn CaptureBackend>,
    ) -> ProfilerResult<Self> {
        config.validate()?;
        let runtime = RuntimeHandle::try_current().map_err(|_| AgentError::NoRuntime)?;
        let target_pid = resolve_target_pid(&config)?;

        let inner = Arc::new(AgentInner {
            config,
            target_pid,
            dispatcher,
            backend,
            registry: SessionRegistry::new(),
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
            runtime,
            live_tasks: Arc::new(AtomicUsize::new(0)),
            stats: DashMap::new(),
            last_auto_session: Mutex::new(None),
            log_guard: Mutex::new(None),
            closed: AtomicBool::new(false),
            lifecycle: RwLock::new(()),
        });

        info!(
            target: "cerebro::agent",
            application_id = %inner.config.application_id,
            mode = %inner.config.mode,
            target_pid = %inner.target_pid,
            backend = inner.backend.name(),
            auto_profile = inner.config.auto_profile,
            "Profiling agent created"
        );

        if inner.config.auto_profile {
            let loop_inner = Arc::clone(&inner);
            inner
                .runtime
                .spawn(inner.tasks.track_future(run_auto_trigger(loop_inner)));
        }

        Ok(Self { inner })
    }

    /// Agent reporting over HTTP and sampling with [`ProcessSampler`].
    pub fn with_http(config: AgentConfig) -> ProfilerResult<Self> {
        let dispatcher = Arc::new(HttpDispatcher::from_config(&config)?);
        let backend = Arc::new(ProcessSampler::for_agent(&config)?);
        Self::new(config, dispatcher, backend)
    }

    /// Keep the log file sink alive until `close()`.
    pub fn with_log_guard(self, guard: Option<WorkerGuard>) -> Self {
        *self.inner.log_guard.lock() = guard;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Start a session and return its id without waiting on any capture.
    pub fn start_profiling(&self, request: ProfilingConfig) -> AgentResult<String> {
        self.inner.start_session(request, false)
    }

    /// Stop a session and persist its record.
    ///
    /// Returns the finished record once the dispatcher accepted it. Stopping
    /// an unknown or already-stopped id yields `SessionNotFound` with no write.
    pub async fn stop_profiling(&self, session_id: &str) -> AgentResult<ProfileSession> {
        self.inner.stop_session(session_id).await
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.registry.active_count()
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    /// Current record of an active session.
    pub fn session(&self, session_id: &str) -> AgentResult<ProfileSession> {
        Ok(self.inner.registry.lookup(session_id)?.snapshot())
    }

    /// Running collector tasks across all sessions.
    pub fn live_collectors(&self) -> usize {
        self.inner.live_tasks.load(AtomicOrdering::Relaxed)
    }

    pub fn collector_stats(&self) -> Vec<(CollectorKind, CollectorStatsSnapshot)> {
        let mut stats: Vec<_> = self
            .inner
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().snapshot()))
            .collect();
        stats.sort_by_key(|(kind, _)| *kind);
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::Acquire)
    }

    /// Stop the trigger loop, stop every active session once, wait (bounded)
    /// for collectors to flush, then release the log sink. Idempotent.
    pub async fn close(&self) -> AgentResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        info!(target: "cerebro::agent", active = inner.registry.active_count(), "Closing profiling agent");
        let drained = {
            let _gate = inner.lifecycle.write();
            inner.root.cancel();
            inner.registry.drain()
        };
        let results = join_all(drained.into_iter().map(|(_, active)| inner.finalize_session(active))).await;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(target: "cerebro::agent", error = %e, "Failed to stop session during close");
                    first_error.get_or_insert(e);
                }
            }
        }

        inner.tasks.close();
        if timeout(inner.config.shutdown_grace, inner.tasks.wait()).await.is_err() {
            warn!(
                target: "cerebro::agent",
                pending = inner.tasks.len(),
                grace = ?inner.config.shutdown_grace,
                "Collector tasks still running after grace period"
            );
        }

        info!(target: "cerebro::agent", "Profiling agent closed");
        drop(inner.log_guard.lock().take());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl AgentInner {
    fn stats_for(&self, kind: CollectorKind) -> Arc<CollectorStats> {
        Arc::clone(self.stats.entry(kind).or_default().value())
    }

    fn start_session(self: &Arc<Self>, request: ProfilingConfig, auto_triggered: bool) -> AgentResult<String> {
        let _gate = self.lifecycle.read();
        if self.root.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }
        request.validate()?;

        let id = generate_session_id(&self.config.application_id);
        let primary = request.profile_types.first().copied().unwrap_or(ProfileType::Cpu);
        let record = ProfileSession::begin(
            id.clone(),
            &self.config,
            primary,
            self.session_metadata(&request, auto_triggered),
        );
        let active = Arc::new(ActiveSession {
            id: id.clone(),
            record: Mutex::new(record),
            started: TokioInstant::now(),
            cancel: self.root.child_token(),
            auto_triggered,
        });
        self.registry.register(&id, Arc::clone(&active))?;

        self.launch_collectors(&active, &request);
        if !request.duration.is_zero() {
            self.schedule_stop(&active, request.duration);
        }

        info!(
            target: "cerebro::agent",
            session_id = %id,
            profile_types = ?request.profile_types,
            duration = ?request.duration,
            collect_metrics = request.collect_metrics,
            auto_triggered,
            "Profiling session started"
        );
        Ok(id)
    }

    fn session_metadata(&self, request: &ProfilingConfig, auto_triggered: bool) -> JsonMap<String, JsonValue> {
        let mut metadata = JsonMap::new();
        metadata.insert("agent_version".to_string(), json!(PROFILER_VERSION));
        metadata.insert("os".to_string(), json!(std::env::consts::OS));
        metadata.insert("arch".to_string(), json!(std::env::consts::ARCH));
        metadata.insert("pid".to_string(), json!(self.target_pid.as_u32()));
        if let Some(host) = System::host_name() {
            metadata.insert("hostname".to_string(), json!(host));
        }
        metadata.insert(
            "profile_types".to_string(),
            JsonValue::Array(request.profile_types.iter().map(|t| json!(t.as_str())).collect()),
        );
        metadata.insert("sample_rate".to_string(), json!(request.effective_sample_rate()));
        metadata.insert("backend".to_string(), json!(self.backend.name()));
        metadata.insert("auto_triggered".to_string(), json!(auto_triggered));
        metadata
    }

    fn collector_context(&self, active: &ActiveSession, kind: CollectorKind) -> CollectorContext {
        CollectorContext {
            session_id: active.id.clone(),
            cancel: active.cancel.child_token(),
            dispatcher: Arc::clone(&self.dispatcher),
            backend: Arc::clone(&self.backend),
            stats: self.stats_for(kind),
            live_tasks: Arc::clone(&self.live_tasks),
            target_pid: self.target_pid,
        }
    }

    fn spawn_collector<F, Fut>(&self, active: &ActiveSession, kind: CollectorKind, body: F)
    where
        F: FnOnce(CollectorContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let guard = LiveTaskGuard::acquire(&self.live_tasks);
        let task = body(self.collector_context(active, kind));
        self.runtime.spawn(self.tasks.track_future(async move {
            let _guard = guard;
            task.await;
        }));
    }

    fn launch_collectors(&self, active: &ActiveSession, request: &ProfilingConfig) {
        let mut heap_launched = false;
        let mut launched: Vec<ProfileType> = Vec::with_capacity(request.profile_types.len());
        for &profile_type in &request.profile_types {
            if launched.contains(&profile_type) {
                continue;
            }
            launched.push(profile_type);
            match profile_type {
                ProfileType::Cpu => {
                    let rate = request.effective_sample_rate();
                    self.spawn_collector(active, CollectorKind::CpuCapture, move |ctx| {
                        run_cpu_capture(ctx, rate)
                    });
                }
                ProfileType::Memory | ProfileType::Heap => {
                    if heap_launched {
                        continue;
                    }
                    heap_launched = true;
                    let period = request.snapshot_interval;
                    self.spawn_collector(active, CollectorKind::HeapSnapshot, move |ctx| {
                        run_heap_snapshots(ctx, period)
                    });
                }
                ProfileType::Io => {
                    let period = request.snapshot_interval;
                    self.spawn_collector(active, CollectorKind::IoDelta, move |ctx| {
                        run_io_deltas(ctx, period)
                    });
                }
                ProfileType::Block | ProfileType::Mutex => {
                    warn!(
                        target: "cerebro::agent",
                        session_id = %active.id,
                        profile_type = %profile_type,
                        backend = self.backend.name(),
                        "Profile type not supported by this agent, skipping"
                    );
                }
            }
        }
        if request.collect_metrics {
            let period = request.metrics_interval;
            self.spawn_collector(active, CollectorKind::Metrics, move |ctx| run_metrics(ctx, period));
        }
    }

    /// One-shot stop after `after`, abandoned if the session ends first.
    fn schedule_stop(self: &Arc<Self>, active: &ActiveSession, after: Duration) {
        let inner = Arc::clone(self);
        let id = active.id.clone();
        let cancel = active.cancel.clone();
        self.runtime.spawn(self.tasks.track_future(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!(target: "cerebro::agent", session_id = %id, "Scheduled stop abandoned");
                }
                _ = sleep(after) => {
                    match inner.stop_session(&id).await {
                        Ok(_) => debug!(target: "cerebro::agent", session_id = %id, "Session stopped on duration limit"),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(target: "cerebro::agent", session_id = %id, error = %e, "Scheduled stop failed"),
                    }
                }
            }
        }));
    }

    async fn stop_session(&self, id: &str) -> AgentResult<ProfileSession> {
        let active = self.registry.deregister(id)?;
        self.finalize_session(active).await
    }

    /// Cancel collectors, close the record and persist it. The caller has
    /// already removed `active` from the registry.
    async fn finalize_session(&self, active: Arc<ActiveSession>) -> AgentResult<ProfileSession> {
        let id = active.id.as_str();
        active.cancel.cancel();
        let record = {
            let mut record = active.record.lock();
            record.finish(active.started.elapsed());
            record.clone()
        };

        self.dispatcher
            .send_session(&record)
            .await
            .map_err(|source| AgentError::Persist {
                id: id.to_string(),
                source,
            })?;

        info!(
            target: "cerebro::agent",
            session_id = %id,
            duration = ?record.duration,
            "Profiling session stopped"
        );
        Ok(record)
    }

    /// Whether the previous auto-triggered session is still registered.
    fn auto_session_running(&self) -> bool {
        self.last_auto_session
            .lock()
            .as_deref()
            .map_or(false, |id| self.registry.contains(id))
    }
}

// ----------------------------------------------------------------------------
// 12.3 Auto-Trigger Loop
// ----------------------------------------------------------------------------

async fn run_auto_trigger(inner: Arc<AgentInner>) {
    let period = inner.config.profile_interval;
    info!(target: "cerebro::agent", interval = ?period, policy = ?inner.config.auto_overlap, "Auto-profiling enabled");
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = inner.root.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if inner.auto_session_running() {
            match inner.config.auto_overlap {
                AutoOverlapPolicy::Skip => {
                    debug!(target: "cerebro::agent", "Previous auto session still running, skipping trigger");
                    continue;
                }
                AutoOverlapPolicy::Allow => {
                    debug!(target: "cerebro::agent", "Starting auto session while previous one is still running");
                }
            }
        }

        match inner.start_session(ProfilingConfig::default(), true) {
            Ok(id) => {
                *inner.last_auto_session.lock() = Some(id);
            }
            Err(AgentError::ShuttingDown) => break,
            Err(e) => {
                error!(target: "cerebro::agent", error = %e, "Auto-triggered session failed to start");
            }
        }
    }
    debug!(target: "cerebro::agent", "Auto-trigger loop stopped");
}

// ============================================================================
// SECTION 13: COLLECTOR SERVER
// ============================================================================
// Ingestion API over an ArtifactStore:
//   POST   /api/v1/sessions              201 + stored record
//   GET    /api/v1/sessions[?application_id=]
//   GET    /api/v1/sessions/:id          404 if absent
//   DELETE /api/v1/sessions/:id          204
//   POST   /api/v1/profiles              201
//   GET    /api/v1/profiles/:session_id
//   POST   /api/v1/metrics               201
//   GET    /api/v1/metrics/:session_id
//   GET    /health
// Errors are `{"error": "..."}`.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 API Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Validation { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(target: "cerebro::server", error = %self, "Request failed");
        } else {
            debug!(target: "cerebro::server", status = status.as_u16(), error = %self, "Request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ----------------------------------------------------------------------------
// 13.2 Server State & Router
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerState {
    store: Arc<dyn ArtifactStore>,
    /// Sessions posted through this instance, for `/health`.
    index: Arc<SessionRegistry<DateTime<Utc>>>,
}

impl ServerState {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            index: Arc::new(SessionRegistry::new()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionQuery {
    pub application_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub active_sessions: usize,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route("/api/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/v1/profiles", axum::routing::post(create_profile))
        .route("/api/v1/profiles/:session_id", get(list_profiles))
        .route("/api/v1/metrics", axum::routing::post(append_metrics))
        .route("/api/v1/metrics/:session_id", get(list_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ----------------------------------------------------------------------------
// 13.3 Handlers
// ----------------------------------------------------------------------------

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        active_sessions: state.index.active_count(),
    })
}

async fn create_session(
    State(state): State<ServerState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ProfileSession>)> {
    let session: ProfileSession = parse_body(&body)?;
    let stored = store_call(&state.store, move |store| store.save_session(&session)).await?;
    state.index.upsert(&stored.id, stored.start_time);
    info!(target: "cerebro::server", session_id = %stored.id, application_id = %stored.application_id, "Session stored");
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn list_sessions(
    State(state): State<ServerState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Vec<ProfileSession>>> {
    let sessions = store_call(&state.store, move |store| {
        store.list_sessions(query.application_id.as_deref())
    })
    .await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<ServerState>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<ProfileSession>> {
    let session = store_call(&state.store, move |store| store.get_session(&id)).await?;
    state.index.upsert(&session.id, session.start_time);
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<ServerState>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<StatusCode> {
    let target = id.clone();
    store_call(&state.store, move |store| store.delete_session(&target)).await?;
    let _ = state.index.deregister(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn create_profile(
    State(state): State<ServerState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let artifact: ProfileArtifact = parse_body(&body)?;
    store_call(&state.store, move |store| store.save_profile_data(&artifact)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "ok" }))))
}

async fn list_profiles(
    State(state): State<ServerState>,
    UrlPath(session_id): UrlPath<String>,
) -> ApiResult<Json<Vec<ProfileArtifact>>> {
    let artifacts = store_call(&state.store, move |store| store.get_profile_data(&session_id)).await?;
    Ok(Json(artifacts))
}

async fn append_metrics(
    State(state): State<ServerState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    let envelope: MetricsEnvelope = parse_body(&body)?;
    store_call(&state.store, move |store| {
        store.save_metrics(&envelope.session_id, &envelope.metrics)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "ok" }))))
}

async fn list_metrics(
    State(state): State<ServerState>,
    UrlPath(session_id): UrlPath<String>,
) -> ApiResult<Json<Vec<MetricsSnapshot>>> {
    let snapshots = store_call(&state.store, move |store| store.get_metrics(&session_id)).await?;
    Ok(Json(snapshots))
}

// ----------------------------------------------------------------------------
// 13.4 Serving
// ----------------------------------------------------------------------------

/// Bind `config.listen_addr` and serve until `shutdown` fires.
pub async fn serve(
    config: &ServerConfig,
    store: Arc<dyn ArtifactStore>,
    shutdown: CancellationToken,
) -> ProfilerResult<()> {
    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, store, shutdown, config.shutdown_timeout).await
}

/// Serve on an already bound listener. In-flight requests get `grace` to
/// finish after `shutdown` fires.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    store: Arc<dyn ArtifactStore>,
    shutdown: CancellationToken,
    grace: Duration,
) -> ProfilerResult<()> {
    let local_addr = listener.local_addr()?;
    let app = router(ServerState::new(store));
    let signal = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });
    info!(target: "cerebro::server", addr = %local_addr, "Collector server listening");

    let finished = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => match timeout(grace, &mut server).await {
            Ok(result) => result,
            Err(_) => {
                warn!(target: "cerebro::server", grace = ?grace, "Graceful shutdown timed out, aborting connections");
                server.abort();
                return Ok(());
            }
        },
    };

    match result {
        Ok(Ok(())) => {
            info!(target: "cerebro::server", "Collector server stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(ProfilerError::Io(e)),
        Err(join) => Err(ProfilerError::Internal(format!("server task failed: {join}"))),
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Cerebro Profiler CLI
#[derive(Parser, Debug)]
#[command(
    name = "cerebro-profiler",
    author = "AIOps Team",
    version,
    about = "Continuous profiling agent and collector for AIOps",
    long_about = "Cerebro Profiler captures CPU, heap and IO profiles plus runtime \
                  metrics from an application, ships them to a collector and \
                  persists them for later retrieval."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CEREBRO_PROFILER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CEREBRO_PROFILER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the collector server (default)
    Serve {
        /// Listen address override
        #[arg(long)]
        listen: Option<String>,

        /// Data directory override
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run the agent until interrupted
    Agent {
        /// Write into the local data directory instead of the collector
        #[arg(long)]
        local: bool,
    },

    /// Capture one session and print its record
    Profile {
        /// Profile types to capture (comma separated)
        #[arg(long = "type", value_enum, value_delimiter = ',')]
        types: Vec<ProfileType>,

        /// Session length, e.g. "30s"
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Metrics cadence, e.g. "5s"
        #[arg(long, value_parser = humantime::parse_duration)]
        metrics_interval: Option<Duration>,

        /// Write into the local data directory instead of the collector
        #[arg(long)]
        local: bool,
    },

    /// Inspect stored sessions in the local data directory
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List sessions
    List {
        #[arg(long)]
        application_id: Option<String>,
    },
    /// Show one session with its artifacts and metrics counts
    Show { id: String },
    /// Delete a session and everything captured for it
    Delete { id: String },
}

// ----------------------------------------------------------------------------
// 14.1 Command Handlers
// ----------------------------------------------------------------------------

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = ProfilerConfig::generate_default_config()?;
    match output {
        Some(path) => {
            fs::write(path, &rendered).map_err(|source| ConfigError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn handle_validate(config: &ProfilerConfig, verbose: bool) -> AnyhowResult<()> {
    println!("Configuration is valid");
    if verbose {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

fn print_version() {
    println!("cerebro-profiler {PROFILER_VERSION}");
    println!("  os:   {}", std::env::consts::OS);
    println!("  arch: {}", std::env::consts::ARCH);
}

fn build_dispatcher(config: &ProfilerConfig, local: bool) -> AnyhowResult<Arc<dyn Dispatcher>> {
    if local {
        let store: Arc<dyn ArtifactStore> = Arc::new(FileStore::open(&config.server.data_dir)?);
        Ok(Arc::new(LocalDispatcher::new(store)))
    } else {
        Ok(Arc::new(HttpDispatcher::from_config(&config.agent)?))
    }
}

async fn handle_serve(config: &ProfilerConfig) -> AnyhowResult<()> {
    let store: Arc<dyn ArtifactStore> = Arc::new(FileStore::open(&config.server.data_dir)?);
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        trigger.cancel();
    });
    serve(&config.server, store, shutdown).await?;
    Ok(())
}

async fn handle_agent(
    config: &ProfilerConfig,
    local: bool,
    log_guard: Option<WorkerGuard>,
) -> AnyhowResult<()> {
    let dispatcher = build_dispatcher(config, local)?;
    let backend = Arc::new(ProcessSampler::for_agent(&config.agent)?);
    let agent = ProfilingAgent::new(config.agent.clone(), dispatcher, backend)?.with_log_guard(log_guard);

    if !config.agent.auto_profile {
        let id = agent.start_profiling(config.profiling.clone())?;
        info!(target: "cerebro::agent", session_id = %id, "Auto-profiling disabled, running one configured session");
    }

    wait_for_shutdown_signal().await;
    agent.close().await?;
    Ok(())
}

async fn handle_profile(
    config: &ProfilerConfig,
    types: Vec<ProfileType>,
    duration: Option<Duration>,
    metrics_interval: Option<Duration>,
    local: bool,
) -> AnyhowResult<()> {
    let mut request = config.profiling.clone();
    if !types.is_empty() {
        request.profile_types = types;
    }
    if let Some(interval) = metrics_interval {
        request.metrics_interval = interval;
    }
    let run_for = duration.unwrap_or(request.duration);
    // Stopped here rather than by the agent so the finished record can be printed.
    request.duration = Duration::ZERO;

    let dispatcher = build_dispatcher(config, local)?;
    let backend = Arc::new(ProcessSampler::for_agent(&config.agent)?);
    let mut agent_config = config.agent.clone();
    agent_config.auto_profile = false;
    let agent = ProfilingAgent::new(agent_config, dispatcher, backend)?;

    let id = agent.start_profiling(request)?;
    tokio::select! {
        _ = sleep(run_for) => {}
        _ = wait_for_shutdown_signal() => {}
    }
    let record = agent.stop_profiling(&id).await?;
    agent.close().await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn handle_sessions(config: &ProfilerConfig, action: SessionCommands) -> AnyhowResult<()> {
    let store = FileStore::open(&config.server.data_dir)?;
    match action {
        SessionCommands::List { application_id } => {
            for session in store.list_sessions(application_id.as_deref())? {
                println!(
                    "{}  {}  {}  {:?}",
                    session.id, session.application_id, session.profile_type, session.duration
                );
            }
        }
        SessionCommands::Show { id } => {
            let session = store.get_session(&id)?;
            let artifacts = store.get_profile_data(&id)?;
            let metrics = store.get_metrics(&id)?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            println!("artifacts: {}", artifacts.len());
            for artifact in &artifacts {
                println!(
                    "  {}  {}  {} bytes  {} samples",
                    artifact.timestamp.to_rfc3339(),
                    artifact.profile_type,
                    artifact.data.len(),
                    artifact.sample_count
                );
            }
            println!("metrics snapshots: {}", metrics.len());
        }
        SessionCommands::Delete { id } => {
            store.delete_session(&id)?;
            println!("Deleted session {id}");
        }
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "cerebro::main", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "cerebro::main", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!(target: "cerebro::main", "Received SIGINT"),
        _ = terminate => info!(target: "cerebro::main", "Received SIGTERM"),
    }
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Version) => {
            print_version();
            return Ok(());
        }
        _ => {}
    }

    let mut config = ProfilerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    let command = cli.command.unwrap_or(Commands::Serve {
        listen: None,
        data_dir: None,
    });
    if let Commands::Validate { verbose } = command {
        return handle_validate(&config, verbose);
    }

    let log_guard = init_logging(&config.logging)?;
    info!(target: "cerebro::main", version = PROFILER_VERSION, "Starting Cerebro Profiler");

    match command {
        Commands::Serve { listen, data_dir } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            if let Some(dir) = data_dir {
                config.server.data_dir = dir;
            }
            config.server.validate()?;
            let result = handle_serve(&config).await;
            drop(log_guard);
            result
        }
        Commands::Agent { local } => handle_agent(&config, local, log_guard).await,
        Commands::Profile {
            types,
            duration,
            metrics_interval,
            local,
        } => {
            let result = handle_profile(&config, types, duration, metrics_interval, local).await;
            drop(log_guard);
            result
        }
        Commands::Sessions { action } => handle_sessions(&config, action),
        Commands::Validate { .. } | Commands::GenerateConfig { .. } | Commands::Version => Ok(()),
    }
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample_session(id: &str, application_id: &str) -> ProfileSession {
        ProfileSession {
            id: id.to_string(),
            application_id: application_id.to_string(),
            application_name: application_id.to_string(),
            language: "rust".to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            profile_type: ProfileType::Cpu,
            mode: ProfileMode::Embedded,
            metadata: JsonMap::new(),
            data_path: String::new(),
        }
    }

    fn sample_artifact(session_id: &str, data: &[u8]) -> ProfileArtifact {
        let mut metadata = JsonMap::new();
        metadata.insert("backend".to_string(), json!("test"));
        ProfileArtifact {
            session_id: session_id.to_string(),
            profile_type: ProfileType::Cpu,
            timestamp: Utc::now(),
            data: data.to_vec(),
            metadata,
            sample_rate: 100,
            sample_count: 42,
        }
    }

    fn sample_metrics(cpu_percent: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_used: 1024,
            memory_total: 4096,
            memory_percent: 25.0,
            concurrency_units: Some(3),
            ..MetricsSnapshot::default()
        }
    }

    // ------------------------------------------------------------------
    // Data model
    // ------------------------------------------------------------------

    #[test]
    fn test_session_finish_derives_end_time() {
        let mut session = ProfileSession::begin(
            "app-1".to_string(),
            &AgentConfig::default(),
            ProfileType::Cpu,
            JsonMap::new(),
        );
        assert!(session.is_active());

        assert!(session.finish(Duration::from_millis(1500)));
        let end = session.end_time.unwrap();
        assert_eq!(end - session.start_time, chrono::Duration::milliseconds(1500));
        assert_eq!(session.duration, Duration::from_millis(1500));
        assert!(!session.is_active());

        assert!(!session.finish(Duration::from_secs(10)));
        assert_eq!(session.end_time, Some(end));
    }

    #[test]
    fn test_session_ids_are_unique_and_path_safe() {
        let a = generate_session_id("checkout");
        let b = generate_session_id("checkout");
        assert_ne!(a, b);
        assert!(a.starts_with("checkout-"));
        assert!(validate_entity_id("session", &a).is_ok());
    }

    #[test]
    fn test_entity_id_validation() {
        assert!(validate_entity_id("session", "app-0189_x.v2").is_ok());
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "a b"] {
            let err = validate_entity_id("session", bad).unwrap_err();
            assert!(matches!(err, StoreError::Validation { .. }), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_wire_shape() {
        let mut session = sample_session("s1", "app");
        session.duration = Duration::from_millis(1500);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["duration"], json!(1_500_000_000u64));
        assert_eq!(value["end_time"], JsonValue::Null);
        assert_eq!(value["profile_type"], json!("cpu"));
        assert_eq!(value["mode"], json!("embedded"));
        assert_eq!(value["name"], json!("app"));
        assert!(value.get("application_name").is_none());

        let artifact = sample_artifact("s1", &[0, 1, 2, 255]);
        let value = serde_json::to_value(&artifact).unwrap();
        assert_eq!(value["data"], json!("AAEC/w=="));
        assert_eq!(value["type"], json!("cpu"));

        let decoded: ProfileArtifact = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.data, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_metrics_accept_goroutine_alias() {
        let raw = r#"{"timestamp":"2024-05-01T10:00:00Z","cpu_percent":12.5,"goroutine_count":17,"gc_pause_total":900}"#;
        let snapshot: MetricsSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.concurrency_units, Some(17));
        assert_eq!(snapshot.gc_pause_total, Some(900));
        assert_eq!(snapshot.memory_used, 0);

        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded["concurrency_units"], json!(17));
    }

    #[test]
    fn test_session_accepts_name_alias_and_missing_fields() {
        let raw = r#"{
            "id": "legacy-1",
            "application_id": "billing",
            "name": "Billing",
            "start_time": "2024-05-01T10:00:00Z",
            "profile_type": "heap"
        }"#;
        let session: ProfileSession = serde_json::from_str(raw).unwrap();
        assert_eq!(session.application_name, "Billing");
        assert_eq!(session.end_time, None);
        assert_eq!(session.duration, Duration::ZERO);
        assert_eq!(session.profile_type, ProfileType::Heap);

        let renamed: ProfileSession = serde_json::from_str(
            r#"{"id":"s2","application_id":"billing","application_name":"Billing","start_time":"2024-05-01T10:00:00Z","profile_type":"cpu"}"#,
        )
        .unwrap();
        assert_eq!(renamed.application_name, "Billing");
    }

    #[test]
    fn test_init_logging_installs_file_sink() {
        let dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            format: "json".to_string(),
            file: Some(dir.path().join("agent.log")),
            ..LoggingConfig::default()
        };
        let guard = init_logging(&config).unwrap();
        assert!(guard.is_some());
        assert!(init_logging(&LoggingConfig::default()).is_err());
    }

    #[test]
    fn test_null_metadata_reads_as_empty() {
        let artifact: ProfileArtifact = serde_json::from_str(
            r#"{"session_id":"go-1","type":"cpu","timestamp":"2024-05-01T10:00:00Z","data":"AAE=","metadata":null,"sample_rate":100,"sample_count":0}"#,
        )
        .unwrap();
        assert!(artifact.metadata.is_empty());
        assert_eq!(artifact.data, vec![0, 1]);

        let session: ProfileSession = serde_json::from_str(
            r#"{
                "id": "go-1",
                "application_id": "billing",
                "name": "Billing",
                "language": "go",
                "start_time": "2024-05-01T10:00:00Z",
                "end_time": "2024-05-01T10:00:30Z",
                "duration": 30000000000,
                "profile_type": "cpu",
                "mode": "embedded",
                "metadata": null,
                "data_path": ""
            }"#,
        )
        .unwrap();
        assert!(session.metadata.is_empty());
        assert_eq!(session.duration, Duration::from_secs(30));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let raw = r#"{"id":"x","application_id":"a","start_time":"2024-05-01T10:00:00Z","profile_type":"cpu","duration":-5}"#;
        assert!(serde_json::from_str::<ProfileSession>(raw).is_err());
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    #[test]
    fn test_error_categories() {
        let err: ProfilerError = StoreError::not_found("session", "x").into();
        assert_eq!(err.category(), "store");
        assert!(err.is_recoverable());

        let err: ProfilerError = ConfigError::invalid("agent.server_url", "bad").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let agent: AgentError = RegistryError::NotFound { id: "x".to_string() }.into();
        assert!(agent.is_not_found());
        assert!(!AgentError::ShuttingDown.is_recoverable());
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("nope".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::not_found("session", "x")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::validation("bad id")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::io("/tmp/x", io::Error::new(io::ErrorKind::Other, "disk"))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[test]
    fn test_config_defaults_validate() {
        let config = ProfilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.profiling.profile_types, vec![ProfileType::Cpu, ProfileType::Memory]);
        assert_eq!(config.profiling.duration, DEFAULT_SESSION_DURATION);
        assert_eq!(config.agent.profile_interval, DEFAULT_PROFILE_INTERVAL);
        assert_eq!(config.agent.auto_overlap, AutoOverlapPolicy::Skip);
        assert_eq!(config.profiling.effective_sample_rate(), DEFAULT_CPU_SAMPLE_RATE_HZ);
    }

    #[test]
    fn test_config_from_toml() {
        let config = ProfilerConfig::from_toml_str(
            r#"
            [agent]
            application_id = "checkout"
            server_url = "http://collector:9000"
            auto_profile = true
            profile_interval = "2m"
            auto_overlap = "allow"

            [profiling]
            profile_types = ["cpu", "io"]
            duration = "45s"
            sample_rate = 250
            metrics_interval = "1s"

            [server]
            listen_addr = "127.0.0.1:9000"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.application_id, "checkout");
        assert_eq!(config.agent.profile_interval, Duration::from_secs(120));
        assert_eq!(config.agent.auto_overlap, AutoOverlapPolicy::Allow);
        assert_eq!(config.profiling.profile_types, vec![ProfileType::Cpu, ProfileType::Io]);
        assert_eq!(config.profiling.duration, Duration::from_secs(45));
        assert_eq!(config.profiling.effective_sample_rate(), 250);
        assert_eq!(config.profiling.metrics_interval, Duration::from_secs(1));
        assert_eq!(config.profiling.snapshot_interval, DEFAULT_SNAPSHOT_INTERVAL);
        assert_eq!(config.server.socket_addr().unwrap().port(), 9000);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let cases = [
            ("[profiling]\nsample_rate = 5000\n", "profiling.sample_rate"),
            ("[agent]\nmode = \"sidecar\"\n", "agent.target_pid"),
            ("[agent]\nserver_url = \"collector:8080\"\n", "agent.server_url"),
            ("[agent]\napplication_id = \"../escape\"\n", "agent.application_id"),
            ("[logging]\nformat = \"xml\"\n", "logging.format"),
            ("[server]\nlisten_addr = \"nowhere\"\n", "server.listen_addr"),
            ("[profiling]\nmetrics_interval = \"0s\"\n", "profiling.metrics_interval"),
        ];
        for (raw, expected_field) in cases {
            match ProfilerConfig::from_toml_str(raw) {
                Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected invalid {expected_field}, got {other:?}"),
            }
        }
        assert!(matches!(
            ProfilerConfig::from_toml_str("[agent\n"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = ProfilerConfig::generate_default_config().unwrap();
        let parsed = ProfilerConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, ProfilerConfig::default());
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiler.toml");
        fs::write(&path, "[agent]\napplication_id = \"from-file\"\n").unwrap();

        let config = ProfilerConfig::load(&path).unwrap();
        assert_eq!(config.agent.application_id, "from-file");
        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);

        let missing = ProfilerConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.agent.application_id, "cerebro-app");
    }

    #[test]
    fn test_effective_sample_rate() {
        assert_eq!(effective_sample_rate(0), DEFAULT_CPU_SAMPLE_RATE_HZ);
        assert_eq!(effective_sample_rate(99), 99);
        assert_eq!(effective_sample_rate(50_000), MAX_SAMPLE_RATE_HZ);
    }

    #[test]
    fn test_level_filter_parsing() {
        use tracing::level_filters::LevelFilter;
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("bogus"), LevelFilter::INFO);
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    #[test]
    fn test_sharded_map_insert_new() {
        let map: ShardedMap<String, u32, 8> = ShardedMap::new();
        assert!(map.insert_new("a".to_string(), 1).is_ok());
        assert_eq!(map.insert_new("a".to_string(), 2), Err(2));
        assert_eq!(map.get("a"), Some(1));
        assert_eq!(map.upsert("a".to_string(), 3), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove("a"), Some(3));
        assert!(map.is_empty());

        for i in 0..20u32 {
            map.insert_new(format!("k{i}"), i).unwrap();
        }
        let mut drained: Vec<u32> = map.drain().into_iter().map(|(_, v)| v).collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..20).collect::<Vec<_>>());
        assert!(map.is_empty());
        assert!(map.drain().is_empty());
    }

    #[test]
    fn test_registry_operations() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        registry.register("s1", 1).unwrap();
        assert_eq!(
            registry.register("s1", 2),
            Err(RegistryError::AlreadyRegistered { id: "s1".to_string() })
        );
        assert_eq!(registry.lookup("s1"), Ok(1));
        assert!(registry.contains("s1"));
        assert_eq!(registry.deregister("s1"), Ok(1));
        assert_eq!(
            registry.deregister("s1"),
            Err(RegistryError::NotFound { id: "s1".to_string() })
        );
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_registry_concurrent_threads() {
        let registry: Arc<SessionRegistry<usize>> = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.register(&format!("t{t}-s{i}"), i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.active_count(), 800);
        assert_eq!(registry.ids().len(), 800);
        assert_eq!(registry.lookup("t3-s42"), Ok(42));

        for id in registry.ids() {
            registry.deregister(&id).unwrap();
        }
        assert_eq!(registry.active_count(), 0);
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    #[test]
    fn test_store_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut session = sample_session("app-1", "app");
        session.finish(Duration::from_secs(2));

        let stored = store.save_session(&session).unwrap();
        assert_eq!(stored.data_path, dir.path().join("profiles").join("app-1").display().to_string());
        assert_eq!(store.get_session("app-1").unwrap(), stored);

        session.application_name = "renamed".to_string();
        store.save_session(&session).unwrap();
        assert_eq!(store.get_session("app-1").unwrap().application_name, "renamed");
        assert!(!dir.path().join("sessions").join("app-1.json.tmp").exists());
    }

    #[test]
    fn test_store_missing_entities() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get_session("ghost").unwrap_err().is_not_found());
        assert!(store.get_profile_data("ghost").unwrap().is_empty());
        assert!(store.get_metrics("ghost").unwrap().is_empty());
        assert!(store.list_sessions(None).unwrap().is_empty());
        assert!(store.delete_session("ghost").is_ok());
    }

    #[test]
    fn test_store_list_skips_corrupt_and_filters() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut older = sample_session("a-1", "alpha");
        older.start_time = Utc::now() - chrono::Duration::seconds(60);
        let newer = sample_session("a-2", "alpha");
        let other = sample_session("b-1", "beta");
        for session in [&newer, &other, &older] {
            store.save_session(session).unwrap();
        }
        fs::write(dir.path().join("sessions").join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("sessions").join("notes.txt"), b"ignored").unwrap();

        let all = store.list_sessions(None).unwrap();
        assert_eq!(all.len(), 3);

        let alpha: Vec<_> = store
            .list_sessions(Some("alpha"))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(alpha, vec!["a-1".to_string(), "a-2".to_string()]);
    }

    #[test]
    fn test_store_delete_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save_session(&sample_session("gone", "app")).unwrap();
        store.save_profile_data(&sample_artifact("gone", b"payload")).unwrap();
        store.save_metrics("gone", &sample_metrics(1.0)).unwrap();

        store.delete_session("gone").unwrap();
        assert!(store.get_session("gone").unwrap_err().is_not_found());
        assert!(!dir.path().join("profiles").join("gone").exists());
        assert!(!dir.path().join("metrics").join("gone").exists());
        assert!(store.get_profile_data("gone").unwrap().is_empty());

        store.delete_session("gone").unwrap();
    }

    #[test]
    fn test_store_profile_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let artifact = sample_artifact("s1", &[0x1f, 0x8b, 0x00, 0xff]);

        let path = store.save_profile_data(&artifact).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some(PAYLOAD_EXT));
        assert_eq!(fs::read(&path).unwrap(), artifact.data);
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("cpu_"));

        let loaded = store.get_profile_data("s1").unwrap();
        assert_eq!(loaded, vec![artifact]);
    }

    #[test]
    fn test_store_same_timestamp_artifacts_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let first = sample_artifact("s1", b"first");
        let mut second = first.clone();
        second.data = b"second".to_vec();

        let p1 = store.save_profile_data(&first).unwrap();
        let p2 = store.save_profile_data(&second).unwrap();
        assert_ne!(p1, p2);

        let mut payloads: Vec<_> = store
            .get_profile_data("s1")
            .unwrap()
            .into_iter()
            .map(|a| a.data)
            .collect();
        payloads.sort();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_store_skips_truncated_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let path = store.save_profile_data(&sample_artifact("s1", b"0123456789")).unwrap();
        store.save_profile_data(&sample_artifact("s1", b"intact")).unwrap();
        fs::write(&path, b"0123").unwrap();

        let loaded = store.get_profile_data("s1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].data, b"intact".to_vec());
    }

    #[test]
    fn test_store_metrics_skip_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for i in 0..10 {
            store.save_metrics("s1", &sample_metrics(f64::from(i))).unwrap();
        }
        let path = dir.path().join("metrics").join("s1").join(METRICS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"timestamp\": broken\n\n").unwrap();
        drop(file);
        store.save_metrics("s1", &sample_metrics(99.0)).unwrap();

        let snapshots = store.get_metrics("s1").unwrap();
        assert_eq!(snapshots.len(), 11);
        assert_eq!(snapshots[0].cpu_percent, 0.0);
        assert_eq!(snapshots[9].cpu_percent, 9.0);
        assert_eq!(snapshots[10].cpu_percent, 99.0);
    }

    #[test]
    fn test_store_metrics_skip_oversized_line() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let metrics_dir = dir.path().join("metrics").join("s1");
        fs::create_dir_all(&metrics_dir).unwrap();

        let mut content = vec![b'x'; MAX_METRICS_LINE_BYTES + 10];
        content.push(b'\n');
        fs::write(metrics_dir.join(METRICS_FILE), &content).unwrap();
        store.save_metrics("s1", &sample_metrics(5.0)).unwrap();

        let snapshots = store.get_metrics("s1").unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].cpu_percent, 5.0);
    }

    #[test]
    fn test_store_rejects_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let err = store.save_session(&sample_session("../evil", "app")).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(matches!(store.get_metrics("a/b"), Err(StoreError::Validation { .. })));
        assert!(matches!(
            store.save_profile_data(&sample_artifact("..", b"x")),
            Err(StoreError::Validation { .. })
        ));
        assert!(matches!(store.delete_session(".."), Err(StoreError::Validation { .. })));
        assert!(!dir.path().join("evil.json").exists());
    }

    #[test]
    fn test_read_bounded_line() {
        let mut reader = BufReader::with_capacity(2, Cursor::new(b"abc\ntoolongline\nxy".to_vec()));
        let mut buf = Vec::new();

        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).unwrap(), LineRead::Line);
        assert_eq!(buf, b"abc".to_vec());
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).unwrap(), LineRead::Oversized);
        assert!(buf.is_empty());
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).unwrap(), LineRead::Line);
        assert_eq!(buf, b"xy".to_vec());
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).unwrap(), LineRead::Eof);
    }

    #[test]
    fn test_trim_whitespace() {
        assert_eq!(trim_whitespace(b"  {}\r"), b"{}");
        assert_eq!(trim_whitespace(b" \t "), b"");
    }

    // ------------------------------------------------------------------
    // Process probe
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_proc_io() {
        let content = "rchar: 323934931\nwchar: 323929600\nsyscr: 632687\nsyscw: 632675\n\
                       read_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
        assert_eq!(
            parse_proc_io(content),
            IoCounters {
                read_bytes: 4096,
                write_bytes: 8192,
                read_ops: 632687,
                write_ops: 632675,
            }
        );
        assert_eq!(parse_proc_io("garbage"), IoCounters::default());
    }

    #[test]
    fn test_io_delta_first_reading_is_absolute() {
        let mut tracker = IoDeltaTracker::default();
        let first = IoCounters {
            read_bytes: 100,
            write_bytes: 50,
            read_ops: 4,
            write_ops: 2,
        };
        assert_eq!(tracker.advance(first).read_bytes, 100);

        let second = IoCounters {
            read_bytes: 160,
            write_bytes: 40,
            ..first
        };
        let delta = tracker.advance(second);
        assert_eq!(delta.read_bytes, 60);
        assert_eq!(delta.write_bytes, 0);
    }

    #[test]
    fn test_probe_reads_own_process() {
        let pid = sysinfo::get_current_pid().unwrap();
        let mut probe = ProcessProbe::new(pid);
        let sample = probe.sample().unwrap();
        assert!(sample.rss_bytes > 0);

        let snapshot = probe.metrics_snapshot(Some(2));
        assert!(snapshot.memory_total >= snapshot.memory_used);
        assert_eq!(snapshot.concurrency_units, Some(2));
    }

    #[tokio::test]
    async fn test_process_sampler_captures_from_blocking_pool() {
        let pid = sysinfo::get_current_pid().unwrap();
        let (probe, sample) = ProcessProbe::new(pid).read_blocking(|p| p.sample()).await.unwrap();
        assert_eq!(probe.pid(), pid);
        assert!(sample.unwrap().rss_bytes > 0);

        let sampler = ProcessSampler::new(pid);
        let heap = sampler.snapshot_heap().await.unwrap();
        assert_eq!(heap.sample_count, 1);
        let doc: JsonValue = serde_json::from_slice(&heap.data).unwrap();
        assert_eq!(doc["format"], json!(PROCESS_HEAP_FORMAT));

        let stop = CancellationToken::new();
        let stopper = stop.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            stopper.cancel();
        });
        let cpu = sampler.record_cpu(100, stop).await.unwrap();
        assert_eq!(cpu.sample_rate, 100);
        assert!(cpu.sample_count >= 1);
        let doc: JsonValue = serde_json::from_slice(&cpu.data).unwrap();
        assert_eq!(doc["format"], json!(PROCESS_CPU_FORMAT));
    }
}

//! Error types for the edge reconciler.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Center error: {0}")]
    Center(#[from] CenterError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Process configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures of the retrying request helper.
///
/// Transport and application failures are retried identically; the variant only
/// tells the caller what the last attempt saw.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport error calling {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("{url} answered with code {code}: {body}")]
    Application {
        url: String,
        code: String,
        body: String,
    },

    #[error("Malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Center (control-plane) errors.
#[derive(Debug, thiserror::Error)]
pub enum CenterError {
    #[error("Center address is not configured: {0}")]
    NotConfigured(String),

    #[error("Heartbeat failed: {0}")]
    Heartbeat(RequestError),

    #[error("Invalid heartbeat response: {0}")]
    InvalidResponse(String),

    #[error("Resource bundle {resource_id} fetch failed: {source}")]
    ResourceFetch {
        resource_id: String,
        #[source]
        source: RequestError,
    },
}

/// Container runtime invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: std::time::Duration,
    },
}

/// Local durable cache errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Bounded pool errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool capacity must be positive")]
    InvalidCapacity,

    #[error("Pool closed")]
    Closed,
}

/// Errors in a task's declared configuration. Never retried until the task changes.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} has malformed export ports {raw:?}: {reason}")]
    InvalidExportPorts {
        task_id: String,
        raw: String,
        reason: String,
    },

    #[error("Task {task_id} declares no image repository")]
    MissingImage { task_id: String },
}

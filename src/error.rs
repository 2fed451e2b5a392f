use thiserror::Error;

/// Berth-specific error types for better error handling
#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Health monitor error: {0}")]
    Health(#[from] HealthError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid container spec for {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid memory limit format: {value}")]
    InvalidMemoryLimit { value: String },

    #[error("Configuration template not found: {name}")]
    TemplateNotFound { name: String },

    #[error("Group manifest not found at path: {path}")]
    ManifestNotFound { path: String },
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container not found: {name}")]
    ContainerNotFound { name: String },

    #[error("Image pull failed for {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Container start failed: {reason}")]
    StartFailed { reason: String },

    #[error("Container stop failed for {id}: {reason}")]
    StopFailed { id: String, reason: String },

    #[error("Container remove failed for {id}: {reason}")]
    RemoveFailed { id: String, reason: String },

    #[error("Container inspect failed for {id}: {reason}")]
    InspectFailed { id: String, reason: String },

    #[error("Docker command failed: {message}")]
    CommandFailed { message: String },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential retrieval failed for account {account_id}: {reason}")]
    RetrievalFailed { account_id: String, reason: String },

    #[error("No valid OAuth credentials retrieved for any requested provider")]
    NoCredentials,

    #[error("No cached credentials found for account {account_id}")]
    NotCached { account_id: String },
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Server not registered for monitoring: {name}")]
    NotRegistered { name: String },

    #[error("Unknown group: {group_id}")]
    UnknownGroup { group_id: String },
}

pub type Result<T> = std::result::Result<T, BerthError>;

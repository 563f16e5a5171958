use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

pub mod family;
pub mod worker;

pub use family::DistFamily;
pub use worker::WorkerConfig;

const WORKER_SCHEMA: &str = include_str!("../schema/worker-config.v1.json");

/// Environment variable naming the worker config file when no path is given.
pub const CONFIG_PATH_ENV: &str = "ENVCTL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("YAML parsing failed: {message}")]
    YamlParsingFailed { message: String },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

/// Loads the worker configuration once per process.
///
/// The result is meant to be wrapped in an `Arc` and handed to every runner;
/// nothing downstream reads the process environment on its own.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: Self::find_config_path(),
        }
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(config_path.into()),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn find_config_path() -> Option<PathBuf> {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    /// Load, validate and apply `EXTERNAL_NETWORK` / `ENVCTL_*` overrides.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<WorkerConfig, ConfigError> {
        let mut config = self.load_without_env()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load and validate the file only; defaults fill anything it omits.
    #[instrument(skip(self))]
    pub fn load_without_env(&self) -> Result<WorkerConfig, ConfigError> {
        let Some(path) = &self.config_path else {
            debug!("No worker config file configured, using defaults");
            return Ok(WorkerConfig::default());
        };

        let config_value = read_config_value(path)?;
        validate_config_value(&config_value)?;

        serde_json::from_value(config_value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }

    #[instrument(skip(self))]
    pub fn validate_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        debug!("Validating worker config file: {:?}", config_path);
        let config_value = read_config_value(config_path)?;
        validate_config_value(&config_value)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_config_value(config_path: &Path) -> Result<Value, ConfigError> {
    if !config_path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: config_path.to_string_lossy().to_string(),
        });
    }

    debug!("Loading worker config from: {:?}", config_path);

    let content = fs::read_to_string(config_path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file: {}", e),
    })?;

    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParsingFailed {
            message: e.to_string(),
        })?;

    // An empty file parses as null and means "all defaults".
    if yaml.is_null() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    serde_json::to_value(yaml).map_err(|e| ConfigError::JsonParsingFailed {
        message: e.to_string(),
    })
}

pub fn validate_config_value(config: &Value) -> Result<(), ConfigError> {
    let schema = compiled_schema()?;
    let validation_result = schema.validate(config);

    if let Err(errors) = validation_result {
        let validation_errors: Vec<ValidationError> = errors
            .map(|error| ValidationError {
                json_pointer: error.instance_path.to_string(),
                message: error.to_string(),
                schema_path: error.schema_path.to_string(),
            })
            .collect();

        return Err(ConfigError::ValidationFailed {
            errors: validation_errors,
        });
    }

    Ok(())
}

fn compiled_schema() -> Result<JSONSchema, ConfigError> {
    let schema_value: Value =
        serde_json::from_str(WORKER_SCHEMA).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })?;

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|e| ConfigError::SchemaCompilationFailed {
            message: e.to_string(),
        })
}

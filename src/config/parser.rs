//! Document parser for loading the desired-state document.
//!
//! This module handles loading the document from YAML or JSON files and
//! applying environment variable overrides, with proper precedence and
//! error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{DesiredDocument, StateBackend};

/// Parser for the desired-state document.
#[derive(Debug, Default)]
pub struct DocumentParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl DocumentParser {
    /// Creates a new document parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to locate `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DesiredDocument> {
        let path = path.as_ref();
        info!("Loading desired state from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DesiredDocument> {
        debug!("Parsing YAML document");

        let document: DesiredDocument = serde_yaml::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed document with {} declarations",
            document.declaration_count()
        );
        Ok(document)
    }

    /// Parses a document from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<DesiredDocument> {
        debug!("Parsing JSON document");

        serde_json::from_str(content).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("JSON parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })
    }

    /// Loads a document and applies `CONVERGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DesiredDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_overrides(&mut document, |key| std::env::var(key).ok())?;
        Ok(document)
    }

    /// Applies overrides looked up through `var`.
    ///
    /// Recognised keys: `CONVERGE_PARALLELISM`, `CONVERGE_FAIL_FAST`,
    /// `CONVERGE_STATE_PATH`, `CONVERGE_STATE_BUCKET`, `CONVERGE_STATE_PREFIX`
    /// and `CONVERGE_STATE_REGION`. Setting a bucket switches the backend to S3.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or boolean override cannot be parsed.
    pub fn apply_overrides<F>(document: &mut DesiredDocument, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("CONVERGE_PARALLELISM") {
            debug!("Overriding settings.parallelism from environment");
            document.settings.parallelism = value.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("CONVERGE_PARALLELISM must be a positive integer, got '{value}'"),
                    "settings.parallelism",
                )
            })?;
        }

        if let Some(value) = var("CONVERGE_FAIL_FAST") {
            debug!("Overriding settings.fail_fast from environment");
            document.settings.fail_fast = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::validation(
                        format!("CONVERGE_FAIL_FAST must be a boolean, got '{value}'"),
                        "settings.fail_fast",
                    )
                    .into());
                }
            };
        }

        if let Some(path) = var("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            document.state.path = Some(path);
        }

        if let Some(bucket) = var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            document.state.backend = StateBackend::S3;
            document.state.bucket = Some(bucket);
        }

        if let Some(prefix) = var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            document.state.prefix = Some(prefix);
        }

        if let Some(region) = var("CONVERGE_STATE_REGION") {
            debug!("Overriding state.region from environment");
            document.state.region = Some(region);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default document file names to search for.
pub const DEFAULT_DOCUMENT_FILES: &[&str] = &["converge.yaml", "converge.yml", "converge.json"];

/// Finds the document in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no document is found.
pub fn find_document_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_DOCUMENT_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found desired-state document: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_DOCUMENT_FILES[0]),
    }))
}

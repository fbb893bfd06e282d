//! Worker configuration.
//!
//! Configuration is assembled from layered sources, such as a YAML or JSON file followed by environment variable
//! overrides, and then queried one section at a time by the components that own each section.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::Path, sync::Arc};

use figment::{error::Kind, Figment};
use serde::Deserialize;
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration source could not be read or parsed.
    #[snafu(display("Failed to load configuration from {}: {}", origin, source))]
    Load {
        /// Where the source was loaded from.
        origin: String,

        /// The underlying error.
        source: figment::Error,
    },

    /// A required field was missing.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Name of the missing field.
        field: String,

        /// How the field can be set.
        help_text: String,
    },

    /// A field did not have the expected type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A value was present but otherwise unusable.
    #[snafu(display("Invalid configuration: {}", source))]
    Invalid {
        /// The underlying error.
        source: figment::Error,
    },
}

/// Builds a merged configuration from layered sources.
///
/// Sources added later override sources added earlier. Nested maps are merged key by key, so an override only replaces
/// the values it sets.
#[derive(Default)]
pub struct ConfigurationLoader {
    sources: Vec<ResolvedProvider>,
    env_prefix: Option<String>,
}

impl ConfigurationLoader {
    /// Adds the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        self.with_source(ResolvedProvider::from_yaml(path), || path.display().to_string())
    }

    /// Adds the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not valid JSON, an error is returned.
    pub fn from_json<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        self.with_source(ResolvedProvider::from_json(path), || path.display().to_string())
    }

    /// Adds a YAML document held in memory.
    ///
    /// # Errors
    ///
    /// If the document is not valid YAML, an error is returned.
    pub fn from_yaml_str(self, contents: &str) -> Result<Self, ConfigurationError> {
        self.with_source(ResolvedProvider::from_yaml_str(contents), || "YAML string".to_string())
    }

    /// Adds every environment variable starting with `prefix`.
    ///
    /// The prefix is matched case-insensitively, and an underscore separator is appended when missing: a prefix of
    /// `respawn` matches `RESPAWN_LOG_LEVEL`, which sets `log_level`. Nested keys are flattened, so
    /// `RESPAWN_KERNEL_REBOOT_MAX_JOBS` sets `kernel_reboot.max_jobs`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment cannot be read, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let mut prefix = prefix.to_uppercase();
        if !prefix.ends_with('_') {
            prefix.push('_');
        }

        let source = ResolvedProvider::from_environment(&prefix);
        self = self.with_source(source, || format!("environment variables prefixed with '{}'", prefix))?;
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    fn with_source<F>(mut self, source: Result<ResolvedProvider, figment::Error>, origin: F) -> Result<Self, ConfigurationError>
    where
        F: FnOnce() -> String,
    {
        match source {
            Ok(source) => {
                self.sources.push(source);
                Ok(self)
            }
            Err(source) => Err(ConfigurationError::Load {
                origin: origin(),
                source,
            }),
        }
    }

    /// Merges every source into a queryable configuration.
    pub fn into_generic(self) -> GenericConfiguration {
        debug!(sources = self.sources.len(), "Merging configuration sources.");
        let figment = self
            .sources
            .into_iter()
            .fold(Figment::new(), |figment, source| figment.admerge(source));

        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                env_prefix: self.env_prefix,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefix: Option<String>,
}

/// A merged configuration, queried by period-separated key.
///
/// Querying `kernel_reboot.max_jobs` against the following YAML returns `500`:
///
/// ```yaml
/// kernel_reboot:
///   max_jobs: 500
/// ```
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration, in which every key is missing.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    /// Gets the value at `key`, if it is set.
    ///
    /// A key that is not set in its nested form is also looked up in its flattened form, which is how values set through
    /// environment variables appear.
    ///
    /// # Errors
    ///
    /// If the value is set but cannot be deserialized as `T`, an error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = &self.inner.figment;
        let result = match figment.extract_inner(key) {
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => {
                figment.extract_inner(&key.replace('.', "_"))
            }
            result => result,
        };

        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => Ok(None),
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Deserializes the whole configuration as `T`.
    ///
    /// Suits sections that live at the top level, where every field of `T` is a top-level key.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner.figment.extract().map_err(|e| self.classify(e))
    }

    fn classify(&self, e: figment::Error) -> ConfigurationError {
        match e.kind {
            Kind::MissingField(ref field) => {
                let field = field.to_string();
                let help_text = match &self.inner.env_prefix {
                    Some(prefix) => format!(
                        "Try setting `{}` or the `{}{}` environment variable.",
                        field,
                        prefix,
                        field.replace('.', "_").to_uppercase()
                    ),
                    None => format!("Try setting `{}`.", field),
                };
                ConfigurationError::MissingField { field, help_text }
            }
            Kind::InvalidType(ref actual_ty, ref expected_ty) => ConfigurationError::InvalidFieldType {
                field: e.path.join("."),
                expected_ty: expected_ty.clone(),
                actual_ty: actual_ty.to_string(),
            },
            _ => ConfigurationError::Invalid { source: e },
        }
    }
}

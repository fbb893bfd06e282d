use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A configuration source whose data has already been read and parsed.
///
/// Reading eagerly means a broken file is reported when it is added to the loader, not when the first value is
/// queried. It also snapshots the environment, which keeps the merged configuration stable for the process lifetime.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    pub fn from_yaml(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::parse::<Yaml>(&contents, Metadata::from("YAML file", path))
    }

    pub fn from_json(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::parse::<Json>(&contents, Metadata::from("JSON file", path))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, Error> {
        Self::parse::<Yaml>(contents, Metadata::named("YAML string"))
    }

    /// Snapshots every environment variable starting with `prefix`, which must already be uppercase.
    pub fn from_environment(prefix: &str) -> Result<Self, Error> {
        let env = Env::prefixed(prefix);
        Ok(Self {
            data: env.data()?,
            metadata: Metadata::named(format!("environment variables ({}*)", prefix)),
        })
    }

    fn parse<F: Format>(contents: &str, metadata: Metadata) -> Result<Self, Error> {
        Ok(Self {
            data: F::string(contents).data()?,
            metadata,
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}

use std::collections::HashMap;

/// Read-only secret lookup.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Resolves `KEY` from the environment variable `<prefix><KEY>` (uppercased).
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("SHIPYARD_SECRET_")
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        let name = format!("{}{}", self.prefix, key.to_uppercase().replace('-', "_"));
        std::env::var(name).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

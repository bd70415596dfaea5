//! Named transport credentials.

use std::collections::BTreeMap;
use std::path::PathBuf;

use poolwatch_client::TransportCredentials;
use serde::Deserialize;

/// A named certificate reference. Without a path the core is reached over
/// plain TCP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Credential {
    pub fn insecure(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    pub fn tls(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
        }
    }

    pub fn transport(&self) -> TransportCredentials {
        TransportCredentials::from_cert_path(self.path.clone())
    }
}

/// Read-only lookup table from credential name to transport settings.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: BTreeMap<String, Credential>,
}

impl CredentialStore {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    /// Build a store from the `[credentials.<name>]` tables of a config file.
    pub fn from_named(credentials: BTreeMap<String, Credential>) -> Self {
        Self::new(credentials.into_iter().map(|(name, mut credential)| {
            credential.name = name;
            credential
        }))
    }

    pub fn get(&self, name: &str) -> Option<&Credential> {
        self.credentials.get(name)
    }

    /// Transport settings for `name`, if such a credential exists.
    pub fn resolve(&self, name: &str) -> Option<TransportCredentials> {
        self.get(name).map(Credential::transport)
    }

    /// Credential names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.credentials.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

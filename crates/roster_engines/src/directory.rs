#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use roster_kernel_contracts::identity::NetworkAddress;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("display-name map {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("display-name map {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
}

/// Operator-maintained address → label lookup. Presentation only.
pub trait DisplayNameDirectory: Send + Sync {
    fn label_for(&self, address: &NetworkAddress) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDisplayNameDirectory {
    labels: BTreeMap<String, String>,
}

impl StaticDisplayNameDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<A, L>(pairs: impl IntoIterator<Item = (A, L)>) -> Self
    where
        A: Into<String>,
        L: Into<String>,
    {
        Self {
            labels: pairs
                .into_iter()
                .map(|(a, l)| (a.into().trim().to_string(), l.into()))
                .collect(),
        }
    }

    /// Reads a JSON object of `"address": "label"` pairs.
    pub fn load_json(path: &Path) -> Result<Self, DirectoryError> {
        let bytes = fs::read(path).map_err(|source| DirectoryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let labels: BTreeMap<String, String> =
            serde_json::from_slice(&bytes).map_err(|source| DirectoryError::Decode {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!(path = %path.display(), entries = labels.len(), "display-name map loaded");
        Ok(Self::from_pairs(labels))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl DisplayNameDirectory for StaticDisplayNameDirectory {
    fn label_for(&self, address: &NetworkAddress) -> Option<String> {
        self.labels.get(address.as_str()).cloned()
    }
}

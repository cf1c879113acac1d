use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use url::Url;

/// A single downloadable unit: one asset type of one catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: String,
    pub item_id: String,
    pub asset_type: String,
}

impl AssetRef {
    pub fn new(item_id: &str, asset_type: &str) -> Self {
        Self {
            id: format!("{item_id}:{asset_type}"),
            item_id: item_id.to_string(),
            asset_type: asset_type.to_string(),
        }
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetState {
    Inactive,
    Activating,
    Active,
    Failed,
}

/// Activation status as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetStatus {
    #[serde(rename = "status")]
    pub state: AssetState,
    /// Only meaningful once the asset is `active`.
    #[serde(default)]
    pub location: Option<Url>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl AssetStatus {
    pub fn new(state: AssetState) -> Self {
        Self {
            state,
            location: None,
            expires_at: None,
        }
    }

    pub fn active(location: Url) -> Self {
        Self {
            state: AssetState::Active,
            location: Some(location),
            expires_at: None,
        }
    }
}

/// One page of a cursor-linked listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Queued,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(self: &Self) -> bool {
        matches!(
            self,
            Self::Success | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the order left any assets behind worth downloading.
    pub fn has_results(self: &Self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub state: OrderState,
    #[serde(default)]
    pub assets: Vec<AssetRef>,
}

/// What to order: every listed asset type of every listed item.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct OrderRequest {
    pub name: String,
    pub item_ids: Vec<String>,
    pub asset_types: Vec<String>,
}

impl OrderRequest {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let request: Self = toml::from_str(&content)?;
        Ok(request)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Item ids with duplicates removed, first occurrence wins.
    pub fn item_ids(self: &Self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.item_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}

//! Pack data model, matching the YAML on disk.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPack {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Parent pack name; items merge with child overriding parent.
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub items: PackItems,
}

impl ConfigPack {
    pub fn is_empty(&self) -> bool {
        self.items.files.is_empty()
            && self.items.packages.is_empty()
            && self.items.settings.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.items.files.len() + self.items.packages.len() + self.items.settings.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackItems {
    #[serde(default)]
    pub files: Vec<FileItem>,
    #[serde(default)]
    pub packages: Vec<PackageItem>,
    #[serde(default)]
    pub settings: Vec<SettingItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileItem {
    /// Target path; `~` expands to the config user's home at check time.
    pub path: String,
    /// Octal mode string, e.g. `"0644"`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Template file under the packs `templates/` directory.
    #[serde(default)]
    pub template: Option<String>,
    /// `sha256:<hex>` or bare hex of the expected content.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageItem {
    pub name: String,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    #[default]
    EnvVar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingItem {
    pub key: String,
    pub expected: String,
    #[serde(default, rename = "type")]
    pub setting_type: SettingType,
    #[serde(default)]
    pub description: Option<String>,
}

//! Pack loading: YAML parse, `extends` resolution, template validation,
//! mtime-keyed caching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::model::{ConfigPack, PackItems};

#[derive(thiserror::Error, Debug)]
pub enum PackError {
    #[error("pack not found: {0}")]
    NotFound(String),

    #[error("pack {name}: {message}")]
    Parse { name: String, message: String },

    #[error("inheritance cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("pack {pack}: template not found: {template}")]
    TemplateMissing { pack: String, template: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

struct CachedPack {
    pack: Arc<ConfigPack>,
    /// mtimes of every file that contributed (the pack and its ancestors).
    sources: Vec<(PathBuf, SystemTime)>,
}

/// Loads packs from a directory of `{name}.yaml` files. Resolved packs are
/// cached and invalidated when any contributing file's mtime changes.
pub struct PackLoader {
    dir: PathBuf,
    cache: Mutex<HashMap<String, CachedPack>>,
}

impl PackLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.dir.join("templates")
    }

    pub fn template_path(&self, template: &str) -> PathBuf {
        self.templates_dir().join(template)
    }

    /// Pack names available on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>, PackError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a pack with inheritance resolved. Cached until any source file
    /// changes on disk.
    pub fn load(&self, name: &str) -> Result<Arc<ConfigPack>, PackError> {
        if let Some(cached) = self.cache_hit(name) {
            return Ok(cached);
        }

        let mut chain = Vec::new();
        let mut sources = Vec::new();
        let pack = Arc::new(self.resolve(name, &mut chain, &mut sources)?);

        self.cache.lock().insert(
            name.to_string(),
            CachedPack {
                pack: pack.clone(),
                sources,
            },
        );
        Ok(pack)
    }

    // ── Private ──────────────────────────────────────────────────────

    fn cache_hit(&self, name: &str) -> Option<Arc<ConfigPack>> {
        let cache = self.cache.lock();
        let cached = cache.get(name)?;
        let fresh = cached.sources.iter().all(|(path, mtime)| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|current| current == *mtime)
                .unwrap_or(false)
        });
        fresh.then(|| cached.pack.clone())
    }

    fn pack_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }

    fn resolve(
        &self,
        name: &str,
        chain: &mut Vec<String>,
        sources: &mut Vec<(PathBuf, SystemTime)>,
    ) -> Result<ConfigPack, PackError> {
        if chain.iter().any(|seen| seen == name) {
            let mut cycle = chain.clone();
            cycle.push(name.to_string());
            return Err(PackError::Cycle(cycle));
        }
        chain.push(name.to_string());

        let path = self.pack_path(name);
        if !path.is_file() {
            return Err(PackError::NotFound(name.to_string()));
        }
        let mtime = std::fs::metadata(&path)?.modified()?;
        sources.push((path.clone(), mtime));

        let text = std::fs::read_to_string(&path)?;
        let mut pack: ConfigPack =
            serde_yaml::from_str(&text).map_err(|e| PackError::Parse {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        self.validate_templates(&pack)?;

        if let Some(parent_name) = pack.extends.clone() {
            let parent = self.resolve(&parent_name, chain, sources)?;
            pack.items = merge_items(parent.items, pack.items);
        }

        chain.pop();
        Ok(pack)
    }

    fn validate_templates(&self, pack: &ConfigPack) -> Result<(), PackError> {
        for file in &pack.items.files {
            if let Some(template) = &file.template {
                if !self.template_path(template).is_file() {
                    return Err(PackError::TemplateMissing {
                        pack: pack.name.clone(),
                        template: template.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Shallow merge per category; child items override parent items that share
/// the same path/name/key, and otherwise append after them.
fn merge_items(parent: PackItems, child: PackItems) -> PackItems {
    fn merge_by_key<T: Clone>(
        parent: Vec<T>,
        child: Vec<T>,
        key: impl Fn(&T) -> &str,
    ) -> Vec<T> {
        let mut merged = parent;
        for item in child {
            match merged.iter_mut().find(|p| key(p) == key(&item)) {
                Some(slot) => *slot = item,
                None => merged.push(item),
            }
        }
        merged
    }

    PackItems {
        files: merge_by_key(parent.files, child.files, |f| f.path.as_str()),
        packages: merge_by_key(parent.packages, child.packages, |p| p.name.as_str()),
        settings: merge_by_key(parent.settings, child.settings, |s| s.key.as_str()),
    }
}

//! Source Registry
//!
//! Maps a logical source name to a factory. Lookups share a read lock; each
//! entry builds its source lazily under its own mutex, at most once, so
//! concurrent first requests for one source never construct it twice and
//! never block lookups of other sources.

use super::{memory, synthetic, DataSource, MemorySource, SourceError, SyntheticSource};
use crate::config::SourceConfig;
use crate::protocol::SourceInfo;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Kinds constructible from configuration.
pub const BUILTIN_KINDS: &[&str] = &[synthetic::KIND, memory::KIND];

pub type SourceFactory = Arc<dyn Fn() -> Result<Arc<dyn DataSource>, SourceError> + Send + Sync>;

struct Entry {
    kind: String,
    description: String,
    factory: SourceFactory,
    instance: Mutex<Option<Arc<dyn DataSource>>>,
}

impl Entry {
    fn instance(&self, name: &str) -> Result<Arc<dyn DataSource>, SourceError> {
        let mut slot = self.instance.lock();
        if let Some(source) = slot.as_ref() {
            return Ok(Arc::clone(source));
        }
        let source = (self.factory)()?;
        info!(source = %name, kind = %self.kind, "Instantiated source");
        *slot = Some(Arc::clone(&source));
        Ok(source)
    }
}

#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<BTreeMap<String, Arc<Entry>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lazily built source.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        factory: SourceFactory,
    ) -> Result<(), SourceError> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(SourceError::DuplicateSource(name));
        }
        let entry = Entry {
            kind: kind.into(),
            description: description.into(),
            factory,
            instance: Mutex::new(None),
        };
        debug!(source = %name, kind = %entry.kind, "Registered source");
        entries.insert(name, Arc::new(entry));
        Ok(())
    }

    /// Register an already built source.
    pub fn register_instance(
        &self,
        name: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> Result<(), SourceError> {
        let kind = source.kind().to_string();
        let description = source.description().to_string();
        let slot = Arc::clone(&source);
        self.register(name, kind, description, Arc::new(move || Ok(Arc::clone(&slot))))
    }

    /// Build a registry from `[[sources]]` config entries. Sources are
    /// constructed on first use, not here.
    pub fn from_config(configs: &[SourceConfig]) -> Result<Self, SourceError> {
        let registry = SourceRegistry::new();
        for config in configs {
            let factory = builtin_factory(config)?;
            registry.register(
                config.name.clone(),
                reported_kind(config)?,
                config.description.clone(),
                factory,
            )?;
        }
        Ok(registry)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DataSource>, SourceError> {
        let entry = self
            .entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::UnknownSource(name.to_string()))?;
        entry.instance(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn is_instantiated(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .is_some_and(|e| e.instance.lock().is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// One entry per registered source, ordered by name.
    pub fn menu(&self) -> Vec<SourceInfo> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| SourceInfo {
                name: name.clone(),
                description: entry.description.clone(),
                kind: entry.kind.clone(),
            })
            .collect()
    }
}

/// The kind a configured source will report once built, so the menu and
/// `getdata` headers agree before the source is instantiated.
fn reported_kind(config: &SourceConfig) -> Result<String, SourceError> {
    match config.kind.as_str() {
        memory::KIND => MemorySource::reported_kind(&config.name, &config.options),
        other => Ok(other.to_string()),
    }
}

fn builtin_factory(config: &SourceConfig) -> Result<SourceFactory, SourceError> {
    let name = config.name.clone();
    let description = config.description.clone();
    let options = config.options.clone();
    let factory: SourceFactory = match config.kind.as_str() {
        synthetic::KIND => Arc::new(move || {
            let source = SyntheticSource::from_options(&name, &description, &options)?;
            Ok(Arc::new(source) as Arc<dyn DataSource>)
        }),
        memory::KIND => Arc::new(move || {
            let source = MemorySource::from_options(&name, &description, &options)?;
            Ok(Arc::new(source) as Arc<dyn DataSource>)
        }),
        other => return Err(SourceError::UnknownKind(other.to_string())),
    };
    Ok(factory)
}

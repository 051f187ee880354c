//! Stage registry: load once, mint many.
//!
//! The registry is an explicit instance (no process-global singleton)
//! constructed at startup and passed by reference to pipelines. It records
//! one source per stage id (either a loaded plugin or an in-process
//! factory) and mints fresh stage instances on demand.

use super::loader::{PluginError, StageLoader};
use crate::stage::{ImageStage, StageFactory, StageIdentity, StageKind};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

enum StageSource {
    /// A dynamically loaded plugin library.
    Plugin(StageLoader),
    /// An in-process factory (built-in or embedder-registered).
    Factory {
        identity: StageIdentity,
        factory: StageFactory,
        instances: AtomicU64,
    },
}

impl StageSource {
    fn identity(&self) -> &StageIdentity {
        match self {
            StageSource::Plugin(loader) => loader.identity(),
            StageSource::Factory { identity, .. } => identity,
        }
    }
}

/// Catalog of loadable stages.
///
/// Reads are lock-free once construction is done; instance minting is
/// serialized by a creation mutex.
pub struct StageRegistry {
    sources: HashMap<u32, StageSource>,
    names: HashMap<String, u32>,
    mint: Mutex<()>,
}

impl StageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            names: HashMap::new(),
            mint: Mutex::new(()),
        }
    }

    /// Create a registry and scan `dir` for plugins.
    ///
    /// # Safety
    ///
    /// See [`load_plugins`](Self::load_plugins).
    pub unsafe fn with_plugin_dir(dir: impl AsRef<Path>) -> Self {
        let mut registry = Self::new();
        // SAFETY: Caller guarantees the plugin directory is trusted.
        unsafe { registry.load_plugins(dir) };
        registry
    }

    /// Scan a directory for files matching the plugin naming convention and
    /// load each exactly once. Returns the number of plugins loaded.
    ///
    /// A plugin whose id is outside the known stage table, or whose id is
    /// already registered, is skipped with a logged warning.
    ///
    /// # Safety
    ///
    /// Loading plugins executes code from shared libraries. Every plugin in
    /// the directory must be trusted.
    pub unsafe fn load_plugins(&mut self, dir: impl AsRef<Path>) -> usize {
        let dir = dir.as_ref();
        let mut count = 0;

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot scan plugin directory");
                return 0;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !super::is_plugin_file(&path) {
                continue;
            }
            // SAFETY: Caller guarantees all plugins in the directory are
            // trusted.
            match unsafe { StageLoader::load(&path) } {
                Ok(loader) => {
                    if self.register(StageSource::Plugin(loader)) {
                        count += 1;
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to load stage plugin");
                }
            }
        }

        debug!(dir = %dir.display(), count, "plugin scan complete");
        count
    }

    /// Register an in-process factory for a known stage kind.
    ///
    /// Returns `false` (and logs) if the id is already registered.
    pub fn register_factory(&mut self, kind: StageKind, factory: StageFactory) -> bool {
        self.register(StageSource::Factory {
            identity: StageIdentity::of(kind),
            factory,
            instances: AtomicU64::new(0),
        })
    }

    fn register(&mut self, source: StageSource) -> bool {
        let identity = source.identity().clone();
        if StageKind::from_id(identity.id).is_none() {
            warn!(id = identity.id, name = %identity.name, "stage id not in the known table, skipped");
            return false;
        }
        if self.sources.contains_key(&identity.id) {
            warn!(id = identity.id, name = %identity.name, "stage id already registered, skipped");
            return false;
        }
        self.names.insert(identity.name.clone(), identity.id);
        self.sources.insert(identity.id, source);
        true
    }

    /// Mint a fresh, opened stage instance by id.
    ///
    /// Unknown ids and minting failures yield `None` with a logged error,
    /// never a panic.
    pub fn create_stage(&self, id: u32) -> Option<Box<dyn ImageStage>> {
        let _mint = self.mint.lock().unwrap();
        let source = match self.sources.get(&id) {
            Some(source) => source,
            None => {
                error!(id, "create_stage: unknown stage id");
                return None;
            }
        };
        match source {
            StageSource::Plugin(loader) => match loader.get_stage_instance() {
                Ok(stage) => Some(stage),
                Err(e) => {
                    error!(id, error = %e, "failed to mint stage instance");
                    None
                }
            },
            StageSource::Factory {
                identity,
                factory,
                instances,
            } => {
                let mut stage = factory();
                if let Err(e) = stage.open() {
                    error!(id, name = %identity.name, error = %e, "stage failed to open");
                    return None;
                }
                instances.fetch_add(1, Ordering::Relaxed);
                Some(stage)
            }
        }
    }

    /// Mint a fresh, opened stage instance by display name.
    pub fn create_stage_by_name(&self, name: &str) -> Option<Box<dyn ImageStage>> {
        match self.names.get(name) {
            Some(&id) => self.create_stage(id),
            None => {
                error!(name, "create_stage_by_name: unknown stage name");
                None
            }
        }
    }

    /// Check whether a stage id is available.
    pub fn is_available(&self, id: u32) -> bool {
        self.sources.contains_key(&id)
    }

    /// Check whether a stage name is available.
    pub fn is_available_by_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Resolve a display name to a stage id.
    pub fn id_for_name(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    /// Number of registered stage sources.
    pub fn loaded_count(&self) -> usize {
        self.sources.len()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::PassThroughStage;

    fn registry_with_passthrough(kind: StageKind) -> StageRegistry {
        let mut registry = StageRegistry::new();
        registry.register_factory(kind, Box::new(|| Box::new(PassThroughStage::new())));
        registry
    }

    #[test]
    fn test_empty_registry() {
        let registry = StageRegistry::new();
        assert_eq!(registry.loaded_count(), 0);
        assert!(!registry.is_available(0));
    }

    #[test]
    fn test_unknown_id_returns_none() {
        let registry = registry_with_passthrough(StageKind::Sobel);
        assert!(registry.create_stage(999).is_none());
        assert!(registry.create_stage_by_name("nonexistent").is_none());
    }

    #[test]
    fn test_factory_minting() {
        let registry = registry_with_passthrough(StageKind::Sobel);
        assert!(registry.is_available(StageKind::Sobel.id()));
        assert!(registry.is_available_by_name("sobel"));

        // Load once, mint many.
        let a = registry.create_stage(StageKind::Sobel.id());
        let b = registry.create_stage_by_name("sobel");
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(registry.loaded_count(), 1);
    }

    #[test]
    fn test_duplicate_registration_skipped() {
        let mut registry = registry_with_passthrough(StageKind::Hdr);
        let added = registry
            .register_factory(StageKind::Hdr, Box::new(|| Box::new(PassThroughStage::new())));
        assert!(!added);
        assert_eq!(registry.loaded_count(), 1);
    }

    #[test]
    fn test_scan_missing_directory() {
        let mut registry = StageRegistry::new();
        let count = unsafe { registry.load_plugins("/nonexistent/plugin/dir") };
        assert_eq!(count, 0);
    }

    #[test]
    fn test_scan_skips_non_matching_and_unloadable_files() {
        let dir = std::env::temp_dir().join(format!("prism-plugin-scan-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.txt"), b"not a plugin").unwrap();
        // Matches the naming convention but is not a loadable library; the
        // scan logs the load failure and moves on.
        let fake = format!(
            "{}prism_stage_fake{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        );
        std::fs::write(dir.join(&fake), b"not a shared library").unwrap();

        let registry = unsafe { StageRegistry::with_plugin_dir(&dir) };
        assert_eq!(registry.loaded_count(), 0);
        assert!(!registry.is_available_by_name("fake"));

        std::fs::remove_dir_all(&dir).ok();
    }
}

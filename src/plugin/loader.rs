//! Dynamic stage loading using libloading.

use super::{CreateStageFn, STAGE_CREATE_SYMBOL, STAGE_ID_SYMBOL, STAGE_NAME_SYMBOL, StageIdFn,
            StageNameFn, stage_from_raw};
use crate::stage::{ImageStage, StageIdentity};
use libloading::{Library, Symbol};
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Errors that can occur when loading stage plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Failed to load the shared library.
    #[error("failed to load library: {0}")]
    LoadFailed(String),

    /// A required entry point is missing.
    #[error("missing plugin entry point: {0}")]
    MissingSymbol(&'static str),

    /// The name function returned a null or non-UTF-8 string.
    #[error("plugin returned an invalid stage name")]
    InvalidName,

    /// The id function returned an id outside the known stage table.
    #[error("plugin reported unknown stage id {0}")]
    UnknownStageId(u32),

    /// The constructor returned null.
    #[error("stage constructor for '{0}' returned null")]
    CreateFailed(String),

    /// The freshly minted stage failed to open.
    #[error("stage '{0}' failed to open: {1}")]
    OpenFailed(String, String),
}

/// A loaded stage plugin.
///
/// The loader keeps the shared library alive for as long as any minted stage
/// instance may exist; when the loader is dropped, the library is unloaded.
/// Multiple independent stage instances may be minted from one loader.
pub struct StageLoader {
    /// The loaded library (kept alive).
    _library: Arc<Library>,
    /// Constructor entry point (valid while the library is loaded).
    create: CreateStageFn,
    identity: StageIdentity,
    instances: AtomicU64,
}

impl StageLoader {
    /// Load a plugin from a shared-library path and resolve its three entry
    /// points.
    ///
    /// Any missing symbol fails construction; the library is unloaded when
    /// the error drops it.
    ///
    /// # Safety
    ///
    /// Loading a plugin executes arbitrary code from the library. The
    /// library must be trusted and must implement the Prism stage ABI: the
    /// three exported functions with their documented signatures.
    pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self, PluginError> {
        let path = path.as_ref();

        // SAFETY: Loading a dynamic library. Caller ensures it is trusted.
        let library =
            unsafe { Library::new(path).map_err(|e| PluginError::LoadFailed(e.to_string()))? };

        // SAFETY: Symbol lookups on the just-loaded library.
        let create: Symbol<CreateStageFn> = unsafe {
            library
                .get(STAGE_CREATE_SYMBOL)
                .map_err(|_| PluginError::MissingSymbol("prism_stage_create"))?
        };
        let create = *create;
        let stage_id: Symbol<StageIdFn> = unsafe {
            library
                .get(STAGE_ID_SYMBOL)
                .map_err(|_| PluginError::MissingSymbol("prism_stage_id"))?
        };
        let stage_name: Symbol<StageNameFn> = unsafe {
            library
                .get(STAGE_NAME_SYMBOL)
                .map_err(|_| PluginError::MissingSymbol("prism_stage_name"))?
        };

        // SAFETY: Calling validated entry points. Caller guarantees the ABI.
        let id = unsafe { stage_id() };
        let name_ptr = unsafe { stage_name() };
        if name_ptr.is_null() {
            return Err(PluginError::InvalidName);
        }
        // SAFETY: The name function returns a null-terminated static string.
        let name = unsafe { CStr::from_ptr(name_ptr) }
            .to_str()
            .map_err(|_| PluginError::InvalidName)?
            .to_string();

        Ok(Self {
            _library: Arc::new(library),
            create,
            identity: StageIdentity { id, name },
            instances: AtomicU64::new(0),
        })
    }

    /// The identity reported by the library.
    pub fn identity(&self) -> &StageIdentity {
        &self.identity
    }

    /// Number of stage instances minted so far.
    pub fn instance_count(&self) -> u64 {
        self.instances.load(Ordering::Relaxed)
    }

    /// Mint a fresh, opened stage instance.
    pub fn get_stage_instance(&self) -> Result<Box<dyn ImageStage>, PluginError> {
        // SAFETY: The constructor was resolved at load time and the library
        // is kept alive by self._library.
        let ptr = unsafe { (self.create)() };
        if ptr.is_null() {
            return Err(PluginError::CreateFailed(self.identity.name.clone()));
        }
        // SAFETY: The constructor returns a pointer created by stage_to_raw.
        let mut stage = unsafe { stage_from_raw(ptr) };
        stage
            .open()
            .map_err(|e| PluginError::OpenFailed(self.identity.name.clone(), e.to_string()))?;
        self.instances.fetch_add(1, Ordering::Relaxed);
        Ok(stage)
    }
}

impl std::fmt::Debug for StageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLoader")
            .field("identity", &self.identity)
            .field("instances", &self.instance_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_library() {
        let result = unsafe { StageLoader::load("/nonexistent/libprism_stage_xyz.so") };
        assert!(matches!(result, Err(PluginError::LoadFailed(_))));
    }

    #[test]
    fn test_load_non_plugin_library() {
        // A real file that is not a shared library.
        let result = unsafe { StageLoader::load("/etc/hostname") };
        assert!(matches!(result, Err(PluginError::LoadFailed(_))));
    }
}

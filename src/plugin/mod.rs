//! Dynamic stage plugins.
//!
//! A stage plugin is a shared library exporting exactly three C-ABI entry
//! points:
//!
//! - [`STAGE_CREATE_SYMBOL`]: construct a new stage instance,
//! - [`STAGE_ID_SYMBOL`]: return the library's stage id,
//! - [`STAGE_NAME_SYMBOL`]: return the stage display name.
//!
//! The [`define_stage_plugin!`](crate::define_stage_plugin) macro generates
//! these exports for a Rust stage crate. Discovery is by filename
//! convention: a plugin file is named `<dll-prefix>prism_stage_<anything>`
//! with the platform shared-library suffix (e.g.
//! `libprism_stage_sobel.so`).

mod loader;
mod registry;

pub use loader::{PluginError, StageLoader};
pub use registry::StageRegistry;

use crate::stage::ImageStage;
use std::ffi::{c_char, c_void};
use std::path::Path;

/// Symbol name of the stage constructor function.
pub const STAGE_CREATE_SYMBOL: &[u8] = b"prism_stage_create\0";
/// Symbol name of the stage id function.
pub const STAGE_ID_SYMBOL: &[u8] = b"prism_stage_id\0";
/// Symbol name of the stage display-name function.
pub const STAGE_NAME_SYMBOL: &[u8] = b"prism_stage_name\0";

/// Filename stem prefix (after the platform DLL prefix) identifying plugin
/// files during directory scans.
pub const PLUGIN_STEM_PREFIX: &str = "prism_stage_";

/// Type of the exported stage constructor.
///
/// # Safety
///
/// The returned pointer must come from [`stage_to_raw`] (or an equivalent
/// double-boxed trait object).
pub type CreateStageFn = unsafe extern "C" fn() -> *mut c_void;

/// Type of the exported stage id function.
pub type StageIdFn = unsafe extern "C" fn() -> u32;

/// Type of the exported stage name function. Returns a null-terminated,
/// 'static display name.
pub type StageNameFn = unsafe extern "C" fn() -> *const c_char;

/// Convert a stage box to a raw pointer for the C ABI boundary.
///
/// The trait object's fat pointer is boxed again so it fits a thin
/// `*mut c_void`.
pub fn stage_to_raw(stage: Box<dyn ImageStage>) -> *mut c_void {
    let boxed: Box<Box<dyn ImageStage>> = Box::new(stage);
    Box::into_raw(boxed) as *mut c_void
}

/// Convert a raw pointer back into a stage box.
///
/// # Safety
///
/// The pointer must have been created by [`stage_to_raw`] and not converted
/// back before.
pub unsafe fn stage_from_raw(ptr: *mut c_void) -> Box<dyn ImageStage> {
    // SAFETY: Caller guarantees ptr was created by stage_to_raw.
    let boxed: Box<Box<dyn ImageStage>> = unsafe { Box::from_raw(ptr as *mut Box<dyn ImageStage>) };
    *boxed
}

/// Check whether a path looks like a stage plugin by the naming convention.
pub fn is_plugin_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let prefix = format!("{}{}", std::env::consts::DLL_PREFIX, PLUGIN_STEM_PREFIX);
    file_name.starts_with(&prefix) && file_name.ends_with(std::env::consts::DLL_SUFFIX)
}

/// Define the three plugin entry points for a stage cdylib.
///
/// # Example
///
/// ```ignore
/// use prism::define_stage_plugin;
///
/// define_stage_plugin! {
///     id: 4, // sobel
///     name: "sobel",
///     create: || Box::new(SobelStage::new()),
/// }
/// ```
#[macro_export]
macro_rules! define_stage_plugin {
    (
        id: $id:expr,
        name: $name:literal,
        create: $create:expr $(,)?
    ) => {
        static PRISM_STAGE_NAME: &[u8] = concat!($name, "\0").as_bytes();

        /// Stage constructor entry point.
        #[unsafe(no_mangle)]
        pub extern "C" fn prism_stage_create() -> *mut std::ffi::c_void {
            let creator: fn() -> Box<dyn $crate::stage::ImageStage> = $create;
            $crate::plugin::stage_to_raw(creator())
        }

        /// Stage id entry point.
        #[unsafe(no_mangle)]
        pub extern "C" fn prism_stage_id() -> u32 {
            $id
        }

        /// Stage display-name entry point.
        #[unsafe(no_mangle)]
        pub extern "C" fn prism_stage_name() -> *const std::ffi::c_char {
            PRISM_STAGE_NAME.as_ptr() as *const std::ffi::c_char
        }
    };
}

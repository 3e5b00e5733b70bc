//! Shared library exporting the corral C API.

pub use corral_c_api::*;

//! Kernel Module Management CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the module controller, plus the
//! label keys shared between the controller and the objects it owns.

pub mod module;
pub mod kernel_mapping;
pub mod build_sign;
pub mod labels;

pub use module::*;
pub use kernel_mapping::*;
pub use build_sign::*;

//! Relative-error comparison of tensors and models produced by separate runs.

pub mod compare;
pub mod error;
pub mod report;

pub use compare::*;
pub use error::*;
pub use report::*;

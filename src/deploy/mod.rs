//! The container deployment descriptor and its verification.

pub mod checks;
pub mod compose;
pub mod interpolate;

pub use checks::{check, expect_services, Finding, Report, Severity};
pub use compose::ComposeFile;

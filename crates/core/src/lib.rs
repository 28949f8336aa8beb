//! `taskforge-core` — shared identifiers and the domain error model.
//!
//! This crate has no runtime or infrastructure concerns; the job subsystem and
//! its collaborators build on these types.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{InvestmentId, ReportId, UserId};

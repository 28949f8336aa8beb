//! Infrastructure layer: the job scheduler, its collaborator contracts and configuration.

pub mod cache;
pub mod config;
pub mod jobs;
pub mod storage;

mod integration_tests;

//! HTTP layer of the LFS caching proxy.
//!
//! Serves the batch API endpoint in front of the [`BatchCoordinator`], plus
//! health and metrics endpoints.
//!
//! [`BatchCoordinator`]: crate::lfs::BatchCoordinator

pub mod handler;

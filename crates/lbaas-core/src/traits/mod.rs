//! Core traits for the convergence layer
//!
//! These are the seams where resource controllers and the outer
//! authentication layer plug into the core.
//!
//! - [`CredentialRefresher`]: Re-authenticate after a 401
//! - [`ResourceApi`]: Fetch and delete one resource type

pub mod credentials;
pub mod resource_api;

pub use credentials::CredentialRefresher;
pub use resource_api::ResourceApi;

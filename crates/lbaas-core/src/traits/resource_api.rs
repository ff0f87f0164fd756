// # Resource API Trait
//
// Fetch/delete access to one resource type, supplied by the resource-specific
// controller layer. The core never looks inside `Resource` except through
// `status_of`.
//
// ## Usage
//
// ```rust,ignore
// use lbaas_core::{ConvergenceEngine, OperationContext, ResourceId};
//
// let listener = engine.wait_active(&ctx, &listeners, &ResourceId::from(id)).await?;
// ```

use crate::error::ApiError;
use crate::status::ResourceId;
use async_trait::async_trait;

/// Remote access to one resource type
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Typed representation returned by a fetch
    type Resource: Send;

    /// Human-readable resource type, used in diagnostics
    fn resource_type(&self) -> &str;

    /// Fetch the current representation of `id`
    ///
    /// A missing resource must be reported as an `ApiError` with status 404.
    async fn fetch(&self, id: &ResourceId) -> Result<Self::Resource, ApiError>;

    /// Request deletion of `id`
    ///
    /// Returns as soon as the API accepts the request; the resource usually
    /// lingers in a pending status afterwards.
    async fn delete(&self, id: &ResourceId) -> Result<(), ApiError>;

    /// Extract the provisioning status from a representation
    fn status_of(&self, resource: &Self::Resource) -> String;
}

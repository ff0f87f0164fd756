// # Credential Refresher Trait
//
// Hook invoked by the auth-retry policy when a call fails with 401.
//
// ## Implementations
//
// - Password re-authentication: `lbaas-provider-http::PasswordAuth`
// - Static token (cannot refresh): `lbaas-provider-http::StaticToken`

use async_trait::async_trait;

/// Refreshes the credentials used by remote calls
///
/// # Thread Safety
///
/// Implementations must be thread-safe: concurrent operations that all see an
/// expired token may each call `refresh`.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Obtain fresh credentials and make them visible to later calls
    ///
    /// # Returns
    ///
    /// - `Ok(())`: New credentials are in place
    /// - `Err(Error)`: Refresh failed; surfaced to the caller as an
    ///   authentication error
    async fn refresh(&self) -> crate::Result<()>;
}

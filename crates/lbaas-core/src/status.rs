//! Resource identity and status taxonomy
//!
//! - [`ResourceId`]: Opaque provider identifier, used as lock key and poll target
//! - [`ResourceRef`]: Resource type plus id, for diagnostics
//! - [`ProvisioningStatus`]: The provisioning statuses the API reports
//! - [`TerminalStatusSet`]: Caller-supplied set of statuses that end a poll

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a cloud resource (UUID-shaped)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A resource type paired with its identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Resource type (e.g., "load balancer", "listener")
    pub resource_type: String,
    /// Resource identifier
    pub id: ResourceId,
}

impl ResourceRef {
    /// Create a resource reference
    pub fn new(resource_type: impl Into<String>, id: impl Into<ResourceId>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.resource_type, self.id)
    }
}

/// Provisioning status reported by the load-balancing API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    /// Settled and usable
    Active,
    /// Removed
    Deleted,
    /// Settled in a failed state
    Error,
    /// Create in progress
    PendingCreate,
    /// Update in progress
    PendingUpdate,
    /// Delete in progress
    PendingDelete,
}

impl ProvisioningStatus {
    /// Wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStatus::Active => "ACTIVE",
            ProvisioningStatus::Deleted => "DELETED",
            ProvisioningStatus::Error => "ERROR",
            ProvisioningStatus::PendingCreate => "PENDING_CREATE",
            ProvisioningStatus::PendingUpdate => "PENDING_UPDATE",
            ProvisioningStatus::PendingDelete => "PENDING_DELETE",
        }
    }

    /// Check if a change is still in progress
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::PendingCreate
                | ProvisioningStatus::PendingUpdate
                | ProvisioningStatus::PendingDelete
        )
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(ProvisioningStatus::Active),
            "DELETED" => Ok(ProvisioningStatus::Deleted),
            "ERROR" => Ok(ProvisioningStatus::Error),
            "PENDING_CREATE" => Ok(ProvisioningStatus::PendingCreate),
            "PENDING_UPDATE" => Ok(ProvisioningStatus::PendingUpdate),
            "PENDING_DELETE" => Ok(ProvisioningStatus::PendingDelete),
            other => Err(Error::Other(format!("Unknown provisioning status: {other}"))),
        }
    }
}

/// Statuses that end a poll
///
/// Never empty. Membership is an exact, case-sensitive comparison against the
/// status string the provider reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStatusSet(BTreeSet<String>);

impl TerminalStatusSet {
    /// Create a terminal set from status strings
    ///
    /// # Returns
    ///
    /// - `Ok(TerminalStatusSet)`: At least one status was supplied
    /// - `Err(Error::Config)`: The iterator was empty
    pub fn new<I, S>(statuses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = statuses.into_iter().map(Into::into).collect();
        if set.is_empty() {
            return Err(Error::config("Terminal status set cannot be empty"));
        }
        Ok(Self(set))
    }

    /// `{ACTIVE, ERROR}`: the set every create and update converges against
    pub fn active_or_error() -> Self {
        Self(
            [ProvisioningStatus::Active, ProvisioningStatus::Error]
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        )
    }

    /// Check if a status ends the poll
    pub fn contains(&self, status: &str) -> bool {
        self.0.contains(status)
    }

    /// Iterate over the statuses in the set
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for TerminalStatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let statuses: Vec<&str> = self.iter().collect();
        f.write_str(&statuses.join(", "))
    }
}

impl From<ProvisioningStatus> for TerminalStatusSet {
    fn from(status: ProvisioningStatus) -> Self {
        Self(BTreeSet::from([status.as_str().to_string()]))
    }
}

/// Check a converged resource's status against the single acceptable value
///
/// Polling to `{ACTIVE, ERROR}` returns on either; callers then require
/// `ACTIVE` with this check and fail the operation otherwise.
pub fn ensure_status(resource: &ResourceRef, status: &str, expected: ProvisioningStatus) -> Result<()> {
    if status == expected.as_str() {
        return Ok(());
    }

    Err(Error::UnexpectedStatus {
        resource: resource.clone(),
        status: status.to_string(),
        expected: expected.to_string(),
    })
}

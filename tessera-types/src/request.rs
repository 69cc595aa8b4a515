use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One resource bundle entry in a check or acquire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireItem {
    pub resource: String,
    pub count: u64,
    /// When the acquisition is (or was, or will be) requested.
    pub requested: DateTime<Utc>,
}

/// One resource bundle entry in a release request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseItem {
    pub resource: String,
    pub count: u64,
    /// Consume the most recent stored acquisitions instead of the oldest.
    #[serde(default)]
    pub latest: bool,
}

/// A resource whose requested count could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcessResource {
    pub resource: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub authorized: bool,
    pub excess_resources: Vec<ExcessResource>,
    /// Resources in the request that no matched restriction tracks.
    pub untracked_resources: Vec<String>,
}

pub type AcquireResponse = CheckResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    /// Always true; a release never fails authorization.
    pub authorized: bool,
    pub excess_resources: Vec<ExcessResource>,
    /// When the remaining record may be destroyed.
    pub expires: DateTime<Utc>,
}

mod limit_over_duration;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_types::{acquisition::AcquisitionItem, request::AcquireItem, restriction::Restriction};

use crate::{error::Error, tokenizer::ResourceTokenizer};

pub use limit_over_duration::LimitOverDuration;

/// Untokenized view of an acquirer's stored acquisitions.
pub type AcquisitionMap = HashMap<String, Vec<AcquisitionItem>>;

/// Everything a restriction method may consult when deciding a request.
pub struct MethodContext<'a> {
    pub acquirer_id: &'a str,
    /// Stored acquisitions for the resources named in the request.
    pub acquired: &'a AcquisitionMap,
    pub request: &'a [AcquireItem],
    pub zones: &'a [String],
    pub restriction: &'a Restriction,
    pub now: DateTime<Utc>,
    /// Supplies untokenized acquisitions for resources the method cares
    /// about that are not named in the request.
    pub tokenizer: &'a ResourceTokenizer,
}

/// Outcome of applying one restriction method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub authorized: bool,
    /// How many of the restricted resource would overflow. Non-zero exactly
    /// when `authorized` is false.
    pub excess: u64,
    /// Retention the method requires for its tracked resources, in
    /// milliseconds. `None` defers to the caller-provided default.
    pub ttl: Option<i64>,
    /// Resources in the request this method wants tracked. `None` defaults
    /// to the restriction's own resource.
    pub tracked_resources: Option<Vec<String>>,
}

#[async_trait]
pub trait RestrictionMethod: Send + Sync + std::fmt::Debug {
    async fn apply(&self, ctx: MethodContext<'_>) -> Result<MethodResult, Error>;
}

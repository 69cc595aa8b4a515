use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One acquire event for a single tokenized resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionItem {
    pub count: u64,
    /// Epoch milliseconds of the acquire event.
    pub requested: i64,
}

/// One tokenizer key generation inside an acquisition record.
///
/// `resources` maps a token (the keyed MAC of the acquirer/resource pair,
/// hex encoded) to the list of acquire events recorded for that resource.
/// Every list is kept sorted by `requested` ascending. The map is ordered
/// so the record always serializes to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedGroup {
    pub tokenizer_id: String,
    pub resources: BTreeMap<String, Vec<AcquisitionItem>>,
}

impl TokenizedGroup {
    #[must_use]
    pub fn empty(tokenizer_id: String) -> Self {
        Self {
            tokenizer_id,
            resources: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// All acquire events in this group, in token order.
    pub fn items(&self) -> impl Iterator<Item = &AcquisitionItem> {
        self.resources.values().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Per-acquirer acquisition state.
///
/// `tokenized` holds one or two key generations. When there are two, the
/// group at position 0 is the older generation awaiting rotation and the
/// group at position 1 carries the key used for new writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRecord {
    pub acquirer_id: String,
    pub tokenized: Vec<TokenizedGroup>,
    /// Maximum per-acquisition retention currently in force, in milliseconds.
    pub ttl: i64,
    /// When the whole record may be destroyed.
    pub expires: DateTime<Utc>,
    /// `None` for a synthesized default that has never been persisted.
    pub meta: Option<Meta>,
}

impl AcquisitionRecord {
    /// Default record for an acquirer with nothing stored yet.
    #[must_use]
    pub fn synthesized(acquirer_id: String, tokenizer_id: String, now: DateTime<Utc>) -> Self {
        Self {
            acquirer_id,
            tokenized: vec![TokenizedGroup::empty(tokenizer_id)],
            ttl: 0,
            expires: now,
            meta: None,
        }
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.meta.is_some()
    }
}

#[must_use]
pub fn to_millis(datetime: DateTime<Utc>) -> i64 {
    datetime.timestamp_millis()
}

#[must_use]
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

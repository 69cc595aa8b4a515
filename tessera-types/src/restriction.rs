use serde::{Deserialize, Serialize};

/// A stored restriction definition.
///
/// The restriction applies to requests naming `resource` when `zone` is
/// among the caller's zones. `method` names a registered restriction
/// method; `method_options` is that method's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub id: String,
    pub zone: String,
    pub resource: String,
    pub method: String,
    pub method_options: serde_json::Value,
}

/// Optional filters for listing restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionFilter {
    pub zone: Option<String>,
    pub resource: Option<String>,
    pub method: Option<String>,
}

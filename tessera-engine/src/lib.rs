#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::pedantic)]
#![deny(clippy::get_unwrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod engine;
mod error;
mod expiration;
mod keyring;
mod matcher;
mod methods;
mod migrations;
mod registry;
mod repos;
mod store;
mod tokenizer;

pub use engine::{AcquireParams, CheckParams, Engine, ReleaseParams};
pub use error::{Error, ErrorType};
pub use expiration::{
    clock::{Clock, SystemClock},
    ExpirationWorker,
};
pub use keyring::{HmacKeyring, TokenizerKeyring};
pub use matcher::{MatchedPolicy, Matcher};
pub use methods::{
    AcquisitionMap, LimitOverDuration, MethodContext, MethodResult, RestrictionMethod,
};
pub use migrations::migrate;
pub use registry::{MethodRegistry, LIMIT_OVER_DURATION};
pub use repos::{AcquisitionRepo, Repos, RestrictionRepo, StoredAcquisition};
pub use store::{open, open_in_memory};
pub use tokenizer::{AcquireMutation, ReleaseMutation, ResourceTokenizer};

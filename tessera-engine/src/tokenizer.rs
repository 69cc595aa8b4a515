use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use tessera_types::{
    acquisition::{to_millis, AcquisitionItem, AcquisitionRecord, TokenizedGroup},
    request::{AcquireItem, ReleaseItem},
};

use crate::{
    error::{Error, ErrorType},
    keyring::TokenizerKeyring,
    methods::AcquisitionMap,
};

/// Injective encoding of the `(acquirer, resource)` pair. Each part is
/// length-prefixed, so distinct pairs never produce the same bytes.
pub(crate) fn token_payload(acquirer_id: &str, resource: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + acquirer_id.len() + resource.len());
    payload.extend_from_slice(&(acquirer_id.len() as u64).to_be_bytes());
    payload.extend_from_slice(acquirer_id.as_bytes());
    payload.extend_from_slice(&(resource.len() as u64).to_be_bytes());
    payload.extend_from_slice(resource.as_bytes());
    payload
}

/// Insert while keeping the list sorted by `requested` ascending. Ties go
/// after existing items.
fn insert_sorted(list: &mut Vec<AcquisitionItem>, item: AcquisitionItem) {
    let at = list.partition_point(|existing| existing.requested <= item.requested);
    list.insert(at, item);
}

/// Merge a sorted list into another, keeping `requested` ascending.
fn merge_sorted(list: &mut Vec<AcquisitionItem>, items: &[AcquisitionItem]) {
    list.extend_from_slice(items);
    list.sort_by_key(|item| item.requested);
}

#[derive(Debug, Default)]
struct KeyMaps {
    /// resource id -> token
    forward: HashMap<String, String>,
    /// token -> resource id
    reverse: HashMap<String, String>,
}

struct Processed {
    pruned: Vec<TokenizedGroup>,
    previous_ttl: i64,
    rotate: bool,
    write_key: String,
    maps: HashMap<String, KeyMaps>,
}

/// Outcome of applying an acquire request to the processed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireMutation {
    pub tokenized: Vec<TokenizedGroup>,
    /// `None` when no acquisition remains; the record must be deleted.
    pub expires: Option<i64>,
    pub ttl: i64,
}

/// Outcome of applying a release request to the processed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseMutation {
    pub tokenized: Vec<TokenizedGroup>,
    /// Counts that were requested beyond what was held, per resource.
    pub excess: BTreeMap<String, u64>,
    /// `None` when no acquisition remains; the record must be deleted.
    pub expires: Option<i64>,
    pub ttl: i64,
}

/// Per-request view of one acquirer's tokenized state.
///
/// `process` prunes the record, decides whether a key rotation is in
/// flight and precomputes token maps for every resource named by the
/// request; the `apply_*` methods then derive the next `tokenized` image
/// without further I/O.
pub struct ResourceTokenizer {
    acquirer_id: String,
    resources: Vec<String>,
    keyring: Arc<dyn TokenizerKeyring>,
    state: Option<Processed>,
}

impl ResourceTokenizer {
    #[must_use]
    pub fn new(
        acquirer_id: String,
        resources: Vec<String>,
        keyring: Arc<dyn TokenizerKeyring>,
    ) -> Self {
        Self {
            acquirer_id,
            resources,
            keyring,
            state: None,
        }
    }

    async fn token(&self, key_id: &str, resource: &str) -> Result<String, Error> {
        let signature = self
            .keyring
            .sign(key_id, &token_payload(&self.acquirer_id, resource))
            .await?;
        Ok(hex::encode(signature))
    }

    async fn build_maps(&self, key_id: &str) -> Result<KeyMaps, Error> {
        let mut maps = KeyMaps::default();
        for resource in &self.resources {
            let token = self.token(key_id, resource).await?;
            maps.forward.insert(resource.clone(), token.clone());
            maps.reverse.insert(token, resource.clone());
        }
        Ok(maps)
    }

    /// Prune the record against its stored ttl, decide the write key and
    /// whether a rotation is in flight, and precompute token maps for
    /// every key generation involved.
    pub async fn process(&mut self, record: &AcquisitionRecord, now: i64) -> Result<(), Error> {
        let current = self.keyring.current_key_id().await?;

        let mut previous_ttl = record.ttl;
        let mut pruned = Vec::with_capacity(record.tokenized.len());
        for group in &record.tokenized {
            let mut resources = BTreeMap::new();
            for (token, items) in &group.resources {
                let kept: Vec<AcquisitionItem> = items
                    .iter()
                    .filter(|item| item.requested + record.ttl >= now)
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    resources.insert(token.clone(), kept);
                }
            }
            if !resources.is_empty() {
                pruned.push(TokenizedGroup {
                    tokenizer_id: group.tokenizer_id.clone(),
                    resources,
                });
            }
        }

        // Everything expired: start over under the current key, and let a
        // subsequent acquire establish a fresh (possibly smaller) ttl.
        if pruned.is_empty() {
            pruned.push(TokenizedGroup::empty(current.clone()));
            previous_ttl = 0;
        }

        let (rotate, write_key) = if pruned.len() == 1 {
            if pruned[0].tokenizer_id == current {
                (false, current)
            } else {
                (true, current)
            }
        } else {
            (true, pruned[1].tokenizer_id.clone())
        };

        let mut key_ids = BTreeSet::new();
        key_ids.insert(pruned[0].tokenizer_id.clone());
        key_ids.insert(write_key.clone());
        let mut maps = HashMap::new();
        for key_id in key_ids {
            let key_maps = self.build_maps(&key_id).await?;
            maps.insert(key_id, key_maps);
        }

        self.state = Some(Processed {
            pruned,
            previous_ttl,
            rotate,
            write_key,
            maps,
        });
        Ok(())
    }

    fn state(&self) -> Result<&Processed, Error> {
        self.state.as_ref().ok_or_else(|| {
            ErrorType::InternalError(anyhow::Error::msg(
                "resource tokenizer used before process",
            ))
            .into()
        })
    }

    /// Stored acquisitions for the resources named by the request, keyed
    /// by resource id. Resources without acquisitions are absent.
    pub fn untokenized_acquisition_map(&self) -> Result<AcquisitionMap, Error> {
        let state = self.state()?;
        let mut map = AcquisitionMap::new();
        for resource in &self.resources {
            let mut list: Vec<AcquisitionItem> = Vec::new();
            for group in &state.pruned {
                if let Some(maps) = state.maps.get(&group.tokenizer_id) {
                    if let Some(token) = maps.forward.get(resource) {
                        if let Some(items) = group.resources.get(token) {
                            merge_sorted(&mut list, items);
                        }
                    }
                }
            }
            if !list.is_empty() {
                map.insert(resource.clone(), list);
            }
        }
        Ok(map)
    }

    /// Stored acquisitions for arbitrary resource ids, computing tokens on
    /// demand for ids outside the request.
    pub async fn acquisition_map_for(
        &self,
        resource_ids: &[String],
    ) -> Result<AcquisitionMap, Error> {
        let state = self.state()?;
        let mut map = AcquisitionMap::new();
        for resource in resource_ids {
            let mut list: Vec<AcquisitionItem> = Vec::new();
            for group in &state.pruned {
                let token = match state
                    .maps
                    .get(&group.tokenizer_id)
                    .and_then(|maps| maps.forward.get(resource))
                {
                    Some(token) => token.clone(),
                    None => self.token(&group.tokenizer_id, resource).await?,
                };
                if let Some(items) = group.resources.get(&token) {
                    merge_sorted(&mut list, items);
                }
            }
            if !list.is_empty() {
                map.insert(resource.clone(), list);
            }
        }
        Ok(map)
    }

    /// Next `tokenized` image before the request is applied, and the index
    /// of the entry new writes go to.
    ///
    /// Without a rotation this is the single pruned group. With one, the
    /// old generation's items are translated to the write key wherever the
    /// reverse map identifies their resource; the rest are retained
    /// verbatim as an unconverted position-0 group.
    fn create_new_tokenized(&self, state: &Processed) -> Result<(Vec<TokenizedGroup>, usize), Error> {
        if !state.rotate {
            return Ok((vec![state.pruned[0].clone()], 0));
        }

        let mut write_entry = if state.pruned.len() == 2 {
            state.pruned[1].clone()
        } else {
            TokenizedGroup::empty(state.write_key.clone())
        };
        let old = &state.pruned[0];
        let old_maps = state.maps.get(&old.tokenizer_id).ok_or_else(|| {
            Error::from(ErrorType::InternalError(anyhow::Error::msg(
                "missing token maps for old key generation",
            )))
        })?;
        let write_maps = state.maps.get(&state.write_key).ok_or_else(|| {
            Error::from(ErrorType::InternalError(anyhow::Error::msg(
                "missing token maps for write key",
            )))
        })?;

        let mut unconverted = TokenizedGroup::empty(old.tokenizer_id.clone());
        for (token, items) in &old.resources {
            if let Some(resource) = old_maps.reverse.get(token) {
                let new_token = write_maps.forward.get(resource).cloned().ok_or_else(|| {
                    Error::from(ErrorType::InternalError(anyhow::Error::msg(
                        "missing forward token for known resource",
                    )))
                })?;
                merge_sorted(write_entry.resources.entry(new_token).or_default(), items);
            } else {
                unconverted.resources.insert(token.clone(), items.clone());
            }
        }

        if unconverted.resources.is_empty() {
            Ok((vec![write_entry], 0))
        } else {
            Ok((vec![unconverted, write_entry], 1))
        }
    }

    fn max_requested(tokenized: &[TokenizedGroup]) -> Option<i64> {
        tokenized
            .iter()
            .flat_map(TokenizedGroup::items)
            .map(|item| item.requested)
            .max()
    }

    /// Apply an acquire request: extend the retention to the strictest
    /// matched restriction, translate any rotating generation, and insert
    /// the surviving tracked items under the write key.
    pub fn apply_acquire(
        &self,
        request: &[AcquireItem],
        tracked: &BTreeSet<String>,
        max_restriction_ttl: i64,
        now: i64,
    ) -> Result<AcquireMutation, Error> {
        let state = self.state()?;
        let ttl = state.previous_ttl.max(max_restriction_ttl);
        let (mut tokenized, write_at) = self.create_new_tokenized(state)?;
        let write_key = tokenized[write_at].tokenizer_id.clone();

        for item in request {
            let requested = to_millis(item.requested);
            // Already outside its own retention window.
            if requested + ttl < now {
                continue;
            }
            if !tracked.contains(&item.resource) {
                continue;
            }
            let token = state
                .maps
                .get(&write_key)
                .and_then(|maps| maps.forward.get(&item.resource))
                .cloned()
                .ok_or_else(|| {
                    Error::from(ErrorType::InternalError(anyhow::Error::msg(
                        "missing write token for requested resource",
                    )))
                })?;
            insert_sorted(
                tokenized[write_at].resources.entry(token).or_default(),
                AcquisitionItem {
                    count: item.count,
                    requested,
                },
            );
        }

        let expires = Self::max_requested(&tokenized).map(|requested| requested + ttl);
        Ok(AcquireMutation {
            tokenized,
            expires,
            ttl,
        })
    }

    /// Apply a release request. Releases never extend retention; counts
    /// are consumed from the head (or tail, with `latest`) of the stored
    /// list and anything unsatisfied is reported as excess.
    pub fn apply_release(&self, request: &[ReleaseItem]) -> Result<ReleaseMutation, Error> {
        let state = self.state()?;
        let ttl = state.previous_ttl;
        let (mut tokenized, write_at) = self.create_new_tokenized(state)?;
        let write_key = tokenized[write_at].tokenizer_id.clone();
        let mut excess: BTreeMap<String, u64> = BTreeMap::new();

        for item in request {
            let mut remaining = item.count;
            if let Some(token) = state
                .maps
                .get(&write_key)
                .and_then(|maps| maps.forward.get(&item.resource))
            {
                let entry = &mut tokenized[write_at];
                let mut consumed_all = false;
                if let Some(list) = entry.resources.get_mut(token) {
                    while remaining > 0 && !list.is_empty() {
                        let at = if item.latest { list.len() - 1 } else { 0 };
                        if list[at].count <= remaining {
                            remaining -= list[at].count;
                            list.remove(at);
                        } else {
                            list[at].count -= remaining;
                            remaining = 0;
                        }
                    }
                    consumed_all = list.is_empty();
                }
                if consumed_all {
                    entry.resources.remove(token);
                }
            }
            if remaining > 0 {
                *excess.entry(item.resource.clone()).or_insert(0) += remaining;
            }
        }

        let expires = Self::max_requested(&tokenized).map(|requested| requested + ttl);
        Ok(ReleaseMutation {
            tokenized,
            excess,
            expires,
            ttl,
        })
    }
}

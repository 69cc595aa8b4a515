use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::debug;

use tessera_types::{
    acquisition::{from_millis, to_millis, AcquisitionRecord},
    request::{AcquireItem, AcquireResponse, CheckResponse, ExcessResource, ReleaseItem, ReleaseResponse},
};

use crate::{
    error::{Error, ErrorType},
    expiration::clock::Clock,
    keyring::TokenizerKeyring,
    matcher::{MatchedPolicy, Matcher},
    methods::MethodContext,
    registry::MethodRegistry,
    repos::{acquisition::canonical_tokenized, Repos, RestrictionRepo},
    tokenizer::ResourceTokenizer,
};

/// Parameters for `check`.
#[derive(Debug, Clone)]
pub struct CheckParams {
    pub acquirer_id: String,
    pub request: Vec<AcquireItem>,
    /// Default retention for tracked resources when no matched restriction
    /// declares its own.
    pub acquisition_ttl: Duration,
    pub zones: Vec<String>,
}

/// Parameters for `acquire`.
#[derive(Debug, Clone)]
pub struct AcquireParams {
    pub acquirer_id: String,
    pub request: Vec<AcquireItem>,
    pub acquisition_ttl: Duration,
    pub zones: Vec<String>,
    /// Record the acquisition even when it is not authorized.
    pub force_acquisition: bool,
}

/// Parameters for `release`.
#[derive(Debug, Clone)]
pub struct ReleaseParams {
    pub acquirer_id: String,
    pub request: Vec<ReleaseItem>,
}

struct CheckAggregate {
    authorized: bool,
    excess: BTreeMap<String, u64>,
    tracked: BTreeSet<String>,
    untracked: Vec<String>,
    max_restriction_ttl: i64,
}

impl CheckAggregate {
    fn into_response(self) -> CheckResponse {
        CheckResponse {
            authorized: self.authorized,
            excess_resources: excess_list(self.excess),
            untracked_resources: self.untracked,
        }
    }
}

fn excess_list(excess: BTreeMap<String, u64>) -> Vec<ExcessResource> {
    excess
        .into_iter()
        .map(|(resource, count)| ExcessResource { resource, count })
        .collect()
}

fn validate_acquirer_id(acquirer_id: &str) -> Result<(), Error> {
    if acquirer_id.is_empty() {
        return Err(ErrorType::InputValidation(
            "acquirer_id (string) is required".to_string(),
        )
        .into());
    }
    Ok(())
}

fn validate_counts<I: IntoIterator<Item = u64>>(counts: I) -> Result<(), Error> {
    if counts.into_iter().any(|count| count == 0) {
        return Err(ErrorType::InputValidation(
            "count must be a positive integer".to_string(),
        )
        .into());
    }
    Ok(())
}

fn distinct_resources<'a, I: IntoIterator<Item = &'a String>>(resources: I) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut distinct = Vec::new();
    for resource in resources {
        if seen.insert(resource.clone()) {
            distinct.push(resource.clone());
        }
    }
    distinct
}

/// The acquisition decision engine.
///
/// `check` evaluates matched restrictions without writing; `acquire` and
/// `release` additionally replace the acquirer's record under an
/// optimistic precondition, re-reading and retrying for as long as
/// concurrent writers interleave. The loops are unbounded; callers impose
/// deadlines externally.
pub struct Engine {
    repos: Repos,
    matcher: Matcher,
    registry: Arc<MethodRegistry>,
    keyring: Arc<dyn TokenizerKeyring>,
    clock: Arc<dyn Clock>,
    /// Signalled after writes that change `expires_at`, so the expiration
    /// worker can re-evaluate its sleep.
    expiry_wake: Arc<Notify>,
}

impl Engine {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        registry: Arc<MethodRegistry>,
        keyring: Arc<dyn TokenizerKeyring>,
        clock: Arc<dyn Clock>,
        expiry_wake: Arc<Notify>,
    ) -> Self {
        let repos = Repos::new(pool);
        let matcher = Matcher::new(repos.restrictions.clone(), Arc::clone(&registry));
        Self {
            repos,
            matcher,
            registry,
            keyring,
            clock,
            expiry_wake,
        }
    }

    /// Restriction definition storage, for management callers.
    #[must_use]
    pub fn restrictions(&self) -> &RestrictionRepo {
        &self.repos.restrictions
    }

    /// The restriction method registry, for registering custom methods
    /// during initialization.
    #[must_use]
    pub fn methods(&self) -> &MethodRegistry {
        &self.registry
    }

    async fn read_record(
        &self,
        acquirer_id: &str,
    ) -> Result<(AcquisitionRecord, Option<String>), Error> {
        if let Some(stored) = self.repos.acquisitions.find(acquirer_id).await? {
            Ok((stored.record, Some(stored.tokenized_json)))
        } else {
            let current = self.keyring.current_key_id().await?;
            Ok((
                AcquisitionRecord::synthesized(
                    acquirer_id.to_string(),
                    current,
                    self.clock.now(),
                ),
                None,
            ))
        }
    }

    async fn run_check(
        &self,
        tokenizer: &ResourceTokenizer,
        acquirer_id: &str,
        request: &[AcquireItem],
        zones: &[String],
        acquisition_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CheckAggregate, Error> {
        let acquired = tokenizer.untokenized_acquisition_map()?;
        let resources = distinct_resources(request.iter().map(|item| &item.resource));
        let policies = self.matcher.match_request(&resources, zones).await?;
        let default_ttl = i64::try_from(acquisition_ttl.as_millis()).unwrap_or(i64::MAX);

        let mut aggregate = CheckAggregate {
            authorized: true,
            excess: BTreeMap::new(),
            tracked: BTreeSet::new(),
            untracked: Vec::new(),
            max_restriction_ttl: 0,
        };
        for MatchedPolicy {
            restriction,
            method,
        } in &policies
        {
            let result = method
                .apply(MethodContext {
                    acquirer_id,
                    acquired: &acquired,
                    request,
                    zones,
                    restriction,
                    now,
                    tokenizer,
                })
                .await?;

            if !result.authorized {
                aggregate.authorized = false;
                let entry = aggregate
                    .excess
                    .entry(restriction.resource.clone())
                    .or_insert(0);
                *entry = (*entry).max(result.excess);
            }
            match result.tracked_resources {
                Some(resources) => aggregate.tracked.extend(resources),
                None => {
                    aggregate.tracked.insert(restriction.resource.clone());
                }
            }
            aggregate.max_restriction_ttl = aggregate
                .max_restriction_ttl
                .max(result.ttl.unwrap_or(default_ttl));
        }
        aggregate.untracked = resources
            .into_iter()
            .filter(|resource| !aggregate.tracked.contains(resource))
            .collect();
        Ok(aggregate)
    }

    /// Evaluate the request against every matched restriction without
    /// recording anything.
    #[tracing::instrument(skip_all, fields(acquirer_id = params.acquirer_id))]
    pub async fn check(&self, params: &CheckParams) -> Result<CheckResponse, Error> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_counts(params.request.iter().map(|item| item.count))?;

        let (record, _) = self.read_record(&params.acquirer_id).await?;
        let now = self.clock.now();
        let resources = distinct_resources(params.request.iter().map(|item| &item.resource));
        let mut tokenizer = ResourceTokenizer::new(
            params.acquirer_id.clone(),
            resources,
            Arc::clone(&self.keyring),
        );
        tokenizer.process(&record, to_millis(now)).await?;

        let aggregate = self
            .run_check(
                &tokenizer,
                &params.acquirer_id,
                &params.request,
                &params.zones,
                params.acquisition_ttl,
                now,
            )
            .await?;
        Ok(aggregate.into_response())
    }

    /// Evaluate the request and, when authorized (or forced), durably
    /// record the tracked acquisitions.
    #[tracing::instrument(skip_all, fields(acquirer_id = params.acquirer_id))]
    pub async fn acquire(&self, params: &AcquireParams) -> Result<AcquireResponse, Error> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_counts(params.request.iter().map(|item| item.count))?;
        let resources = distinct_resources(params.request.iter().map(|item| &item.resource));

        loop {
            let (record, prior) = self.read_record(&params.acquirer_id).await?;
            let now = self.clock.now();
            let now_ms = to_millis(now);
            let mut tokenizer = ResourceTokenizer::new(
                params.acquirer_id.clone(),
                resources.clone(),
                Arc::clone(&self.keyring),
            );
            tokenizer.process(&record, now_ms).await?;

            let aggregate = self
                .run_check(
                    &tokenizer,
                    &params.acquirer_id,
                    &params.request,
                    &params.zones,
                    params.acquisition_ttl,
                    now,
                )
                .await?;
            if !aggregate.authorized && !params.force_acquisition {
                return Ok(aggregate.into_response());
            }
            // Nothing durable to record. Known expired acquisitions are
            // left in place; the next mutating call prunes them.
            if aggregate.tracked.is_empty() {
                return Ok(aggregate.into_response());
            }

            let mutation = tokenizer.apply_acquire(
                &params.request,
                &aggregate.tracked,
                aggregate.max_restriction_ttl,
                now_ms,
            )?;

            match &prior {
                None => {
                    let Some(expires) = mutation.expires else {
                        // Every tracked item was already stale and nothing
                        // is stored.
                        return Ok(aggregate.into_response());
                    };
                    let tokenized_json = canonical_tokenized(&mutation.tokenized)?;
                    match self
                        .repos
                        .acquisitions
                        .insert(
                            &params.acquirer_id,
                            &tokenized_json,
                            mutation.ttl,
                            from_millis(expires),
                            now,
                        )
                        .await
                    {
                        Ok(()) => {
                            self.expiry_wake.notify_one();
                            return Ok(aggregate.into_response());
                        }
                        Err(error) if error.is_unique_violation() => {
                            debug!("Acquisition record insert raced, retrying");
                        }
                        Err(error) => return Err(error),
                    }
                }
                Some(prior_tokenized) => {
                    let matched = match mutation.expires {
                        None => {
                            self.repos
                                .acquisitions
                                .delete(&params.acquirer_id, prior_tokenized)
                                .await?
                        }
                        Some(expires) => {
                            let tokenized_json = canonical_tokenized(&mutation.tokenized)?;
                            self.repos
                                .acquisitions
                                .update(
                                    &params.acquirer_id,
                                    prior_tokenized,
                                    &tokenized_json,
                                    mutation.ttl,
                                    from_millis(expires),
                                    now,
                                )
                                .await?
                        }
                    };
                    if matched {
                        self.expiry_wake.notify_one();
                        return Ok(aggregate.into_response());
                    }
                    debug!("Acquisition record changed concurrently, retrying");
                }
            }
        }
    }

    /// Return previously acquired counts. Anything requested beyond what
    /// is held is reported as excess; a release never fails authorization.
    #[tracing::instrument(skip_all, fields(acquirer_id = params.acquirer_id))]
    pub async fn release(&self, params: &ReleaseParams) -> Result<ReleaseResponse, Error> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_counts(params.request.iter().map(|item| item.count))?;
        let resources = distinct_resources(params.request.iter().map(|item| &item.resource));

        loop {
            let (record, prior) = self.read_record(&params.acquirer_id).await?;
            let now = self.clock.now();

            let Some(prior_tokenized) = &prior else {
                // Nothing stored: every requested count is excess.
                let mut excess: BTreeMap<String, u64> = BTreeMap::new();
                for item in &params.request {
                    *excess.entry(item.resource.clone()).or_insert(0) += item.count;
                }
                return Ok(ReleaseResponse {
                    authorized: true,
                    excess_resources: excess_list(excess),
                    expires: now,
                });
            };

            let mut tokenizer = ResourceTokenizer::new(
                params.acquirer_id.clone(),
                resources.clone(),
                Arc::clone(&self.keyring),
            );
            tokenizer.process(&record, to_millis(now)).await?;
            let mutation = tokenizer.apply_release(&params.request)?;

            let matched = match mutation.expires {
                None => {
                    self.repos
                        .acquisitions
                        .delete(&params.acquirer_id, prior_tokenized)
                        .await?
                }
                Some(expires) => {
                    let tokenized_json = canonical_tokenized(&mutation.tokenized)?;
                    self.repos
                        .acquisitions
                        .update(
                            &params.acquirer_id,
                            prior_tokenized,
                            &tokenized_json,
                            mutation.ttl,
                            from_millis(expires),
                            now,
                        )
                        .await?
                }
            };
            if matched {
                self.expiry_wake.notify_one();
                return Ok(ReleaseResponse {
                    authorized: true,
                    excess_resources: excess_list(mutation.excess),
                    expires: mutation.expires.map_or(now, from_millis),
                });
            }
            debug!("Acquisition record changed concurrently, retrying");
        }
    }
}

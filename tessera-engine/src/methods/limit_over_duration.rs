use async_trait::async_trait;
use serde::Deserialize;
use tessera_types::{acquisition::to_millis, duration};

use crate::error::{Error, ErrorType};

use super::{MethodContext, MethodResult, RestrictionMethod};

#[derive(Debug, Deserialize)]
struct Options {
    limit: u64,
    duration: String,
}

/// Caps the total count acquired for one resource within a sliding
/// ISO-8601 window. The window doubles as the retention the method
/// requires for its tracked resource.
#[derive(Debug)]
pub struct LimitOverDuration;

#[async_trait]
impl RestrictionMethod for LimitOverDuration {
    async fn apply(&self, ctx: MethodContext<'_>) -> Result<MethodResult, Error> {
        let options: Options = serde_json::from_value(ctx.restriction.method_options.clone())
            .map_err(|_| {
                ErrorType::InputValidation(format!(
                    "Invalid options for restriction `{}`",
                    ctx.restriction.id
                ))
            })?;
        if options.limit == 0 {
            return Err(ErrorType::InputValidation(format!(
                "Restriction `{}` must have a positive limit",
                ctx.restriction.id
            ))
            .into());
        }
        let window = duration::parse(&options.duration)
            .map_err(|err| ErrorType::InputValidation(err.to_string()))?;
        let start = to_millis(ctx.now) - window;
        let resource = &ctx.restriction.resource;

        // Items older than the window are left to the pruning machinery;
        // future-dated requests count against the window.
        let mut total: u64 = 0;
        if let Some(items) = ctx.acquired.get(resource) {
            total += items
                .iter()
                .filter(|item| item.requested >= start)
                .map(|item| item.count)
                .sum::<u64>();
        }
        total += ctx
            .request
            .iter()
            .filter(|item| item.resource == *resource && to_millis(item.requested) >= start)
            .map(|item| item.count)
            .sum::<u64>();

        let excess = total.saturating_sub(options.limit);
        Ok(MethodResult {
            authorized: excess == 0,
            excess,
            ttl: Some(window),
            tracked_resources: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tessera_types::{
        acquisition::{from_millis, AcquisitionItem, AcquisitionRecord},
        request::AcquireItem,
        restriction::Restriction,
    };

    use crate::{
        keyring::{HmacKeyring, TokenizerKeyring},
        methods::AcquisitionMap,
        tokenizer::ResourceTokenizer,
    };

    use super::*;

    const DAY: i64 = 86_400_000;

    fn restriction(limit: u64, duration: &str) -> Restriction {
        Restriction {
            id: "r".to_string(),
            zone: "z".to_string(),
            resource: "widget".to_string(),
            method: "limitOverDuration".to_string(),
            method_options: json!({ "limit": limit, "duration": duration }),
        }
    }

    async fn tokenizer(keyring: &Arc<HmacKeyring>) -> ResourceTokenizer {
        let current = keyring.current_key_id().await.unwrap();
        let record = AcquisitionRecord::synthesized("a".to_string(), current, from_millis(0));
        let mut tokenizer = ResourceTokenizer::new(
            "a".to_string(),
            vec!["widget".to_string()],
            Arc::clone(keyring) as Arc<dyn TokenizerKeyring>,
        );
        tokenizer.process(&record, 0).await.unwrap();
        tokenizer
    }

    async fn apply(
        restriction: &Restriction,
        acquired: &AcquisitionMap,
        request: &[AcquireItem],
        now: i64,
    ) -> Result<MethodResult, Error> {
        let keyring = Arc::new(HmacKeyring::new());
        let tokenizer = tokenizer(&keyring).await;
        LimitOverDuration
            .apply(MethodContext {
                acquirer_id: "a",
                acquired,
                request,
                zones: &["z".to_string()],
                restriction,
                now: from_millis(now),
                tokenizer: &tokenizer,
            })
            .await
    }

    fn item(count: u64, requested: i64) -> AcquireItem {
        AcquireItem {
            resource: "widget".to_string(),
            count,
            requested: from_millis(requested),
        }
    }

    #[tokio::test]
    async fn sums_stored_and_requested_counts() {
        let restriction = restriction(5, "P30D");
        let now = 40 * DAY;
        let mut acquired = AcquisitionMap::new();
        acquired.insert(
            "widget".to_string(),
            vec![
                AcquisitionItem {
                    count: 2,
                    requested: now - DAY,
                },
                AcquisitionItem {
                    count: 1,
                    requested: now - 2 * DAY,
                },
            ],
        );

        let result = apply(&restriction, &acquired, &[item(2, now)], now)
            .await
            .unwrap();
        assert_eq!(
            result,
            MethodResult {
                authorized: true,
                excess: 0,
                ttl: Some(30 * DAY),
                tracked_resources: None,
            }
        );

        let result = apply(&restriction, &acquired, &[item(3, now)], now)
            .await
            .unwrap();
        assert!(!result.authorized);
        assert_eq!(result.excess, 1);
    }

    #[tokio::test]
    async fn items_outside_the_window_are_ignored() {
        let restriction = restriction(1, "P30D");
        let now = 40 * DAY;
        let mut acquired = AcquisitionMap::new();
        acquired.insert(
            "widget".to_string(),
            vec![AcquisitionItem {
                count: 1,
                requested: now - 31 * DAY,
            }],
        );

        let result = apply(&restriction, &acquired, &[item(1, now)], now)
            .await
            .unwrap();
        assert!(result.authorized);
        assert_eq!(result.excess, 0);
    }

    #[tokio::test]
    async fn future_dated_requests_count() {
        let restriction = restriction(1, "P30D");
        let now = 40 * DAY;

        let result = apply(
            &restriction,
            &AcquisitionMap::new(),
            &[item(1, now), item(1, now + DAY)],
            now,
        )
        .await
        .unwrap();
        assert!(!result.authorized);
        assert_eq!(result.excess, 1);
    }

    #[tokio::test]
    async fn bad_options_are_input_validation_errors() {
        let now = DAY;
        for options in [
            json!({ "limit": 1 }),
            json!({ "limit": 0, "duration": "P30D" }),
            json!({ "limit": 1, "duration": "30 days" }),
        ] {
            let mut restriction = restriction(1, "P30D");
            restriction.method_options = options;
            let err = apply(&restriction, &AcquisitionMap::new(), &[item(1, now)], now)
                .await
                .unwrap_err();
            assert!(matches!(err.variant, ErrorType::InputValidation(_)));
        }
    }
}

use std::sync::Arc;

use tessera_types::restriction::Restriction;

use crate::{
    error::Error, methods::RestrictionMethod, registry::MethodRegistry, repos::RestrictionRepo,
};

/// A restriction paired with its registered method implementation.
#[derive(Debug)]
pub struct MatchedPolicy {
    pub restriction: Restriction,
    pub method: Arc<dyn RestrictionMethod>,
}

/// Resolves the restrictions applying to a request.
#[derive(Clone)]
pub struct Matcher {
    restrictions: RestrictionRepo,
    registry: Arc<MethodRegistry>,
}

impl Matcher {
    #[must_use]
    pub fn new(restrictions: RestrictionRepo, registry: Arc<MethodRegistry>) -> Self {
        Self {
            restrictions,
            registry,
        }
    }

    /// Every restriction whose zone is among `zones` and whose resource is
    /// named by the request, paired with its method. Order is unspecified
    /// and callers must not depend on it.
    #[tracing::instrument(skip(self))]
    pub async fn match_request(
        &self,
        resources: &[String],
        zones: &[String],
    ) -> Result<Vec<MatchedPolicy>, Error> {
        let restrictions = self.restrictions.match_request(zones, resources).await?;
        let mut policies = Vec::with_capacity(restrictions.len());
        for restriction in restrictions {
            let method = self.registry.get(&restriction.method)?;
            policies.push(MatchedPolicy {
                restriction,
                method,
            });
        }
        Ok(policies)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::ErrorType,
        repos::restriction::tests::{pool, restriction},
    };

    use super::*;

    #[tokio::test]
    async fn resolves_methods_for_matched_restrictions() {
        let repo = RestrictionRepo::new(pool().await);
        repo.create(&restriction("a", "zone-1", "resource-1"))
            .await
            .unwrap();
        let matcher = Matcher::new(repo, Arc::new(MethodRegistry::with_builtins()));

        let matched = matcher
            .match_request(&["resource-1".to_string()], &["zone-1".to_string()])
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].restriction.id, "a");
    }

    #[tokio::test]
    async fn unknown_method_surfaces() {
        let repo = RestrictionRepo::new(pool().await);
        let mut unknown = restriction("a", "zone-1", "resource-1");
        unknown.method = "doesNotExist".to_string();
        repo.create(&unknown).await.unwrap();
        let matcher = Matcher::new(repo, Arc::new(MethodRegistry::with_builtins()));

        let err = matcher
            .match_request(&["resource-1".to_string()], &["zone-1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::MethodNotRegistered { .. }
        ));
    }
}

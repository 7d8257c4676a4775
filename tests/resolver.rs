use std::sync::Arc;
use std::time::Duration;
use storefront_tenancy::directory::CachedDirectory;
use storefront_tenancy::memory::InMemoryDirectory;
use storefront_tenancy::resolver::{AttemptOutcome, ResolutionStrategy, ResolverOptions, TenantResolver};
use storefront_tenancy::{OrganizationDirectory, OrganizationStatus, ResolveError};

fn resolver(dir: Arc<InMemoryDirectory>, default_tenant: Option<&str>) -> TenantResolver {
    let options = ResolverOptions {
        default_tenant: default_tenant.map(String::from),
        ..ResolverOptions::default()
    };
    TenantResolver::new(dir, options)
}

fn aurelio() -> Arc<InMemoryDirectory> {
    let dir = Arc::new(InMemoryDirectory::new());
    dir.insert_ready("A", "Aurelio Living", "aurelioliving");
    dir
}

#[tokio::test]
async fn exact_subdomain_resolves() {
    let r = resolver(aurelio(), None);
    let res = r.resolve("aurelioliving.myaurelio.com", None).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "A");
    assert_eq!(res.matched_by, ResolutionStrategy::ExactSubdomain);
    assert_eq!(res.candidate.as_deref(), Some("aurelioliving"));
}

#[tokio::test]
async fn hyphenated_host_falls_back_to_normalized_match() {
    let r = resolver(aurelio(), None);
    let res = r.resolve("aurelio-living.myaurelio.com", None).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "A");
    assert_eq!(res.matched_by, ResolutionStrategy::NormalizedSubdomain);
    let exact = res
        .trace
        .iter()
        .find(|a| a.strategy == ResolutionStrategy::ExactSubdomain)
        .unwrap();
    assert_eq!(exact.outcome, AttemptOutcome::Miss);
}

#[tokio::test]
async fn exact_match_beats_normalized_match() {
    let dir = Arc::new(InMemoryDirectory::new());
    // Older org would win the normalized comparison.
    dir.insert_ready("OLD", "Aurelio Living", "aurelioliving");
    dir.insert_ready("NEW", "Aurelio Living Two", "aurelio-living");
    let r = resolver(dir, None);
    let res = r.resolve("aurelio-living.myaurelio.com", None).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "NEW");
    assert_eq!(res.matched_by, ResolutionStrategy::ExactSubdomain);
}

#[tokio::test]
async fn preview_host_falls_back_to_default_tenant() {
    let dir = aurelio();
    dir.insert_ready("D", "Demo Store", "demo");
    let r = resolver(dir, Some("demo"));
    let res = r
        .resolve("storefront-k2j3h4g5f-team.vercel.app", None)
        .await
        .unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "D");
    assert_eq!(res.matched_by, ResolutionStrategy::DefaultTenant);
    assert_eq!(res.candidate, None);
}

#[tokio::test]
async fn loopback_uses_route_slug_before_default() {
    let dir = aurelio();
    dir.insert_ready("D", "Demo Store", "demo");
    let r = resolver(dir, Some("demo"));
    let res = r.resolve("localhost:3000", Some("aurelioliving")).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "A");
    assert_eq!(res.matched_by, ResolutionStrategy::RouteSlug);

    let res = r.resolve("localhost", None).await.unwrap();
    assert_eq!(res.matched_by, ResolutionStrategy::DefaultTenant);
}

#[tokio::test]
async fn two_label_host_has_no_candidate() {
    let r = resolver(aurelio(), None);
    let err = r.resolve("aurelioliving.com", None).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));
}

#[tokio::test]
async fn custom_domain_wins_over_subdomain() {
    let dir = aurelio();
    dir.insert_ready("C", "Corner Shop", "shop");
    dir.update("C", |o| o.custom_domain = Some("shop.cornerstore.example".into()));
    let r = resolver(dir, None);
    let res = r.resolve("Shop.CornerStore.example.", None).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "C");
    assert_eq!(res.matched_by, ResolutionStrategy::CustomDomain);
}

#[tokio::test]
async fn missing_default_is_not_found() {
    let r = resolver(aurelio(), Some("does-not-exist"));
    let err = r.resolve("unknown.myaurelio.com", Some("nope")).await.unwrap_err();
    assert_eq!(
        err,
        ResolveError::NotFound {
            hostname: "unknown.myaurelio.com".into(),
            route_slug: Some("nope".into()),
        }
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unprovisioned_organizations_are_not_resolved() {
    let dir = aurelio();
    dir.update("A", |o| o.status = OrganizationStatus::Unprovisioned);
    let r = resolver(dir, None);
    assert!(matches!(
        r.resolve("aurelioliving.myaurelio.com", None).await,
        Err(ResolveError::NotFound { .. })
    ));
}

#[tokio::test]
async fn directory_outage_fails_closed() {
    let dir = aurelio();
    dir.insert_ready("D", "Demo Store", "demo");
    dir.set_unavailable(true);
    let r = resolver(dir, Some("demo"));
    let err = r.resolve("aurelioliving.myaurelio.com", None).await.unwrap_err();
    assert!(matches!(err, ResolveError::LookupFailed(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn cached_directory_sees_new_tenant_after_refresh() {
    let inner = Arc::new(InMemoryDirectory::new());
    let cached = Arc::new(CachedDirectory::new(inner.clone(), Duration::from_secs(600)));
    let r = TenantResolver::new(cached.clone(), ResolverOptions::default());

    assert!(r.resolve("my_shop.myaurelio.com", None).await.is_err());
    inner.insert_ready("S", "My Shop", "my-shop");
    // Stale snapshot still served.
    assert!(r.resolve("my_shop.myaurelio.com", None).await.is_err());

    cached.refresh().await;
    let res = r.resolve("my_shop.myaurelio.com", None).await.unwrap();
    assert_eq!(res.identity.organization_id.as_str(), "S");
}

mod common;

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tokio::sync::watch;

use capi_provider::apis::node_claim::{CONDITION_LAUNCHED, CONDITION_READY, STATUS_TRUE};
use capi_provider::catalog::CatalogError;
use capi_provider::catalog::fake::FetchBehavior;
use capi_provider::catalog::file::InstanceTypeSpec;
use capi_provider::cloudprovider::CloudProviderError;
use capi_provider::cloudprovider::drift::DriftReason;
use capi_provider::cloudprovider::lifecycle::{ClaimState, Observation};
use capi_provider::infrastructure::fake::{CreateBehavior, FakeInfrastructure};
use capi_provider::infrastructure::{MachinePhase, ProviderId};
use capi_provider::labels;
use capi_provider::requirements::Operator;

use common::{catalog, instance_type, node_claim, on_demand, provider, requirement};

fn hetzner() -> Vec<InstanceTypeSpec> {
    vec![
        instance_type(
            "cx22",
            "2",
            "4Gi",
            vec![on_demand("fsn1", 0.0066), on_demand("hel1", 0.0069)],
        ),
        instance_type("cx32", "4", "8Gi", vec![on_demand("fsn1", 0.0106)]),
        instance_type("cx42", "8", "16Gi", vec![on_demand("nbg1", 0.0170)]),
    ]
}

#[tokio::test]
async fn claim_moves_from_launch_to_ready_to_deleted() {
    let (catalog, _) = catalog(hetzner());
    let infra = FakeInfrastructure::new();
    let provider = provider(catalog, infra.clone());
    let claim = node_claim("nc-1", vec![], &[("cpu", "3"), ("memory", "6Gi")]);
    assert_eq!(ClaimState::of(&claim), ClaimState::Unresolved);

    let launched = provider.create(&claim).await.unwrap();
    assert_eq!(ClaimState::of(&launched), ClaimState::Delegated);
    assert_eq!(launched.labels()[labels::INSTANCE_TYPE], "cx32");
    let provider_id = ProviderId(launched.status.as_ref().unwrap().provider_id.clone().unwrap());

    infra.set_phase("nc-1", MachinePhase::Running);
    let observed = provider.get(&provider_id).await.unwrap();
    assert_eq!(ClaimState::of(&observed), ClaimState::Observed(Observation::Ready));
    let status = observed.status.unwrap();
    assert!(status.is_condition_true(CONDITION_LAUNCHED));
    assert_eq!(status.condition(CONDITION_READY).unwrap().status, STATUS_TRUE);

    provider.delete(&launched).await.unwrap();
    let err = provider.get(&provider_id).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_machine_is_observed_as_failed() {
    let (catalog, _) = catalog(hetzner());
    let infra = FakeInfrastructure::new();
    let provider = provider(catalog, infra.clone());
    let launched = provider.create(&node_claim("nc-1", vec![], &[])).await.unwrap();

    infra.set_phase("nc-1", MachinePhase::Failed);
    let provider_id = ProviderId(launched.status.unwrap().provider_id.unwrap());
    let observed = provider.get(&provider_id).await.unwrap();
    assert_eq!(ClaimState::of(&observed), ClaimState::Observed(Observation::Failed));
}

#[tokio::test]
async fn cheapest_offering_wins_across_types() {
    let (catalog, _) = catalog(hetzner());
    let infra = FakeInfrastructure::new();
    let provider = provider(catalog, infra.clone());

    provider
        .create(&node_claim(
            "nc-1",
            vec![requirement(labels::ZONE, Operator::In, &["hel1", "nbg1"])],
            &[],
        ))
        .await
        .unwrap();

    let calls = infra.create_calls();
    assert_eq!(calls[0].instance_type, "cx22");
    assert_eq!(calls[0].zone.0, "hel1");
}

#[tokio::test]
async fn min_values_are_enforced_on_create() {
    let (catalog, _) = catalog(hetzner());
    let provider = provider(catalog, FakeInfrastructure::new());

    let mut enough = requirement(labels::INSTANCE_TYPE, Operator::Exists, &[]);
    enough.min_values = Some(2);
    provider
        .create(&node_claim("nc-1", vec![enough], &[("cpu", "3")]))
        .await
        .unwrap();

    let mut too_many = requirement(labels::INSTANCE_TYPE, Operator::Exists, &[]);
    too_many.min_values = Some(3);
    let err = provider
        .create(&node_claim("nc-2", vec![too_many], &[("cpu", "3")]))
        .await
        .unwrap_err();
    assert!(err.is_insufficient_capacity(), "{err}");
}

#[tokio::test]
async fn catalog_failure_is_not_insufficient_capacity() {
    let (catalog, fake) = catalog(hetzner());
    let _fake = fake.on_next_fetch(FetchBehavior::Fail("rate limited".into()));
    let provider = provider(catalog, FakeInfrastructure::new());

    let err = provider
        .create(&node_claim("nc-1", vec![], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, CloudProviderError::Catalog(CatalogError::Unavailable(_))));
    assert!(!err.is_insufficient_capacity());
}

#[tokio::test]
async fn delete_without_backing_machine_succeeds() {
    let (catalog, _) = catalog(hetzner());
    let infra = FakeInfrastructure::new();
    let provider = provider(catalog, infra.clone());

    provider.delete(&node_claim("never-launched", vec![], &[])).await.unwrap();
    assert_eq!(infra.delete_calls().len(), 1);
}

#[tokio::test]
async fn list_reports_every_owned_machine() {
    let (catalog, _) = catalog(hetzner());
    let provider = provider(catalog, FakeInfrastructure::new());
    for name in ["nc-1", "nc-2", "nc-3"] {
        provider.create(&node_claim(name, vec![], &[])).await.unwrap();
    }

    let mut listed: Vec<_> = provider
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|claim| claim.name_any())
        .collect();
    listed.sort();
    assert_eq!(listed, ["nc-1", "nc-2", "nc-3"]);
}

#[tokio::test]
async fn catalog_refresh_surfaces_instance_type_drift() {
    let (catalog, fake) = catalog(hetzner());
    let provider = provider(catalog.clone(), FakeInfrastructure::new());
    let launched = provider.create(&node_claim("nc-1", vec![], &[])).await.unwrap();
    assert_eq!(provider.is_drifted(&launched).await.unwrap(), None);

    fake.set_instance_types(hetzner().into_iter().filter(|it| it.name != "cx22").collect());
    catalog.refresh().await.unwrap();
    assert_eq!(
        provider.is_drifted(&launched).await.unwrap(),
        Some(DriftReason::InstanceTypeDrift)
    );
}

#[tokio::test]
async fn tightened_requirements_drift() {
    let (catalog, _) = catalog(hetzner());
    let provider = provider(catalog, FakeInfrastructure::new());
    let mut launched = provider.create(&node_claim("nc-1", vec![], &[])).await.unwrap();

    launched
        .spec
        .resources
        .requests
        .insert("cpu".into(), Quantity("4".into()));
    assert_eq!(
        provider.is_drifted(&launched).await.unwrap(),
        Some(DriftReason::RequirementsDrift)
    );
}

#[tokio::test]
async fn shutdown_before_create_cancels() {
    let (catalog, _) = catalog(hetzner());
    let infra = FakeInfrastructure::new().with_default_create(CreateBehavior::SucceedAfterDelay(
        Duration::from_secs(30),
    ));
    let (tx, rx) = watch::channel(false);
    let provider = provider(catalog, infra.clone()).with_shutdown(rx);
    tx.send(true).unwrap();

    let err = provider
        .create(&node_claim("nc-1", vec![], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, CloudProviderError::Cancelled));
    assert!(infra.create_calls().is_empty());
}

#[tokio::test]
async fn concurrent_creates_share_one_snapshot() {
    let (catalog, fake) = catalog(hetzner());
    let provider = std::sync::Arc::new(provider(catalog, FakeInfrastructure::new()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let provider = provider.clone();
            tokio::spawn(async move {
                provider
                    .create(&node_claim(&format!("nc-{i}"), vec![], &[("cpu", "1")]))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let launched = handle.await.unwrap().unwrap();
        assert_eq!(launched.labels()[labels::INSTANCE_TYPE], "cx22");
    }
    assert!(fake.fetch_count() >= 1);
    assert_eq!(provider.list().await.unwrap().len(), 8);
}

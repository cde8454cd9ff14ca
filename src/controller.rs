use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::apis::node_claim::{
    CONDITION_DRIFTED, CONDITION_LAUNCHED, CONDITION_READY, NodeClaim, NodeClaimStatus,
    STATUS_FALSE, STATUS_TRUE,
};
use crate::cloudprovider::lifecycle::ClaimState;
use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::infrastructure::ProviderId;

/// Held on every NodeClaim until its machine is torn down.
pub const FINALIZER: &str = "capi.karpenter.sh/termination";

const FIELD_MANAGER: &str = "capi-provider";

/// Shared context for the controller reconciler.
pub struct ControllerContext {
    pub client: Client,
    pub cloud_provider: CloudProvider,
}

/// Error type for reconciliation failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    CloudProvider(#[from] CloudProviderError),
}

fn has_finalizer(node_claim: &NodeClaim) -> bool {
    node_claim.finalizers().iter().any(|f| f == FINALIZER)
}

async fn set_finalizers(
    api: &Api<NodeClaim>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), kube::Error> {
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn patch_status(
    api: &Api<NodeClaim>,
    name: &str,
    status: &NodeClaimStatus,
) -> Result<(), kube::Error> {
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Reconcile a single NodeClaim event.
async fn reconcile(
    node_claim: Arc<NodeClaim>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let name = node_claim.name_any();
    let api: Api<NodeClaim> = Api::all(ctx.client.clone());

    if node_claim.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&node_claim) {
            ctx.cloud_provider.delete(&node_claim).await?;
            let remaining = node_claim
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER)
                .cloned()
                .collect();
            set_finalizers(&api, &name, remaining).await?;
            info!(node_claim = %name, "machine terminated, finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&node_claim) {
        let mut finalizers = node_claim.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        set_finalizers(&api, &name, finalizers).await?;
    }

    match ClaimState::of(&node_claim) {
        ClaimState::Unresolved | ClaimState::Infeasible => launch(&api, &node_claim, &ctx).await,
        ClaimState::Delegated | ClaimState::Observed(_) => observe(&api, &node_claim, &ctx).await,
        ClaimState::Resolving | ClaimState::Feasible | ClaimState::Deleted => {
            Ok(Action::await_change())
        }
    }
}

async fn launch(
    api: &Api<NodeClaim>,
    node_claim: &NodeClaim,
    ctx: &ControllerContext,
) -> Result<Action, ReconcileError> {
    let name = node_claim.name_any();
    match ctx.cloud_provider.create(node_claim).await {
        Ok(launched) => {
            let patch = json!({
                "metadata": {
                    "labels": launched.labels(),
                    "annotations": launched.annotations(),
                }
            });
            api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
            if let Some(status) = launched.status.as_ref() {
                patch_status(api, &name, status).await?;
            }
            Ok(Action::requeue(Duration::from_secs(10)))
        }
        Err(CloudProviderError::InsufficientCapacity { reason, .. }) => {
            warn!(node_claim = %name, %reason, "insufficient capacity");
            let mut status = node_claim.status.clone().unwrap_or_default();
            status.set_condition(
                CONDITION_LAUNCHED,
                STATUS_FALSE,
                Some("InsufficientCapacity"),
                Some(reason),
            );
            patch_status(api, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(60)))
        }
        Err(e) => Err(e.into()),
    }
}

async fn observe(
    api: &Api<NodeClaim>,
    node_claim: &NodeClaim,
    ctx: &ControllerContext,
) -> Result<Action, ReconcileError> {
    let name = node_claim.name_any();
    let mut status = node_claim.status.clone().unwrap_or_default();

    let observed = match status.provider_id.clone() {
        Some(provider_id) => match ctx.cloud_provider.get(&ProviderId(provider_id)).await {
            Ok(observed) => Some(observed),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        },
        None => ctx.cloud_provider.find(node_claim).await?,
    };

    match observed.and_then(|claim| claim.status) {
        Some(current) => {
            if let Some(ready) = current.condition(CONDITION_READY) {
                status.set_condition(
                    CONDITION_READY,
                    &ready.status,
                    ready.reason.as_deref(),
                    ready.message.clone(),
                );
            }
            status.provider_id = current.provider_id.or(status.provider_id);
            status.node_name = current.node_name.or(status.node_name);
        }
        None => status.set_condition(
            CONDITION_READY,
            STATUS_FALSE,
            Some("MachineNotFound"),
            Some("backing machine no longer exists".into()),
        ),
    }

    match ctx.cloud_provider.is_drifted(node_claim).await? {
        Some(reason) => {
            debug!(node_claim = %name, %reason, "nodeclaim drifted");
            status.set_condition(CONDITION_DRIFTED, STATUS_TRUE, Some(reason.as_str()), None);
        }
        None => status.clear_condition(CONDITION_DRIFTED),
    }

    if node_claim.status.as_ref() != Some(&status) {
        patch_status(api, &name, &status).await?;
    }
    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Back off on reconciliation errors.
fn error_policy(
    node_claim: Arc<NodeClaim>,
    error: &ReconcileError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!(node_claim = %node_claim.name_any(), %error, "reconcile failed, requeuing");
    match error {
        ReconcileError::CloudProvider(CloudProviderError::Cancelled) => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}

/// Run the event-driven controller over all NodeClaims.
pub async fn run(ctx: ControllerContext) {
    let node_claims: Api<NodeClaim> = Api::all(ctx.client.clone());
    let ctx = Arc::new(ctx);

    Controller::new(node_claims, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(node_claim = %obj.name, "reconciled"),
                Err(e) => warn!("controller error: {e:?}"),
            }
        })
        .await;
}

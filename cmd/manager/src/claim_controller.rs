//! Builds the Claim Binder's `Reconciler` closure for one claim kind.
//! Connection-secret propagation itself runs from the composite side
//! ([`crate::composite_controller`]); this reconciler only ensures a bound
//! composite exists, binds, and fills in the default delete policy from the
//! owning XRD.

use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{debug, error};

use xrcore_engine::claim;
use xrcore_engine::client::KindClient;
use xrcore_engine::engine::{events, ReconcileOutcome, Reconciler, WorkKey};
use xrcore_engine::error::{ErrorKind, Result};
use xrcore_engine::metrics::Metrics;
use xrcore_engine::types::{Claim, DeletePolicy, Gvk, ObjectRef};

pub fn build(client: KindClient, metrics: Metrics, controller_name: String, claim_gvk: Gvk, xr_gvk: Gvk, default_delete_policy: Option<DeletePolicy>) -> Arc<dyn Reconciler> {
    Arc::new(move |key: WorkKey| {
        let client = client.clone();
        let metrics = metrics.clone();
        let controller_name = controller_name.clone();
        let claim_gvk = claim_gvk.clone();
        let xr_gvk = xr_gvk.clone();

        Box::pin(async move {
            let measurer = metrics.reconcile.count_and_measure(&controller_name, &xrcore_engine::telemetry::get_trace_id());

            let object = match client.get(&claim_gvk, key.namespace.as_deref(), &key.name).await {
                Ok(obj) => obj,
                Err(e) if e.kind() == ErrorKind::NotFound => return ReconcileOutcome::Done,
                Err(e) => {
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    return ReconcileOutcome::Error(e);
                }
            };

            let mut bound_claim = match claim::from_dynamic(&object) {
                Ok(c) => c,
                Err(e) => {
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    return ReconcileOutcome::Error(e);
                }
            };

            let mut default_policy_applied = false;
            let result: Result<()> = async {
                let proposed = ensure_composite(&client, &xr_gvk, &object, &bound_claim).await?;
                claim::bind(&mut bound_claim, &proposed)?;
                default_policy_applied = claim::apply_default_delete_policy(&mut bound_claim, default_delete_policy);
                Ok(())
            }
            .await;

            let patch_obj = claim::patch(&claim_gvk, &bound_claim);
            if let Err(e) = client.apply(&claim_gvk, key.namespace.as_deref(), &key.name, &patch_obj, false).await {
                error!(claim = %bound_claim.name, error = %e, "failed to patch claim");
            }

            // Conflict and Transient are expected, self-resolving noise: skip
            // the Condition/Event/error! surface and requeue quietly, the
            // same policy the composite reconciler applies.
            let kind = result.as_ref().err().map(|e| e.kind());
            let outcome = match kind {
                None => {
                    if default_policy_applied {
                        let recorder = events::recorder_for(client.raw().clone(), controller_name.clone(), claim_object_reference(&bound_claim));
                        events::record_normal(&recorder, "ClaimBind", "CompositeDeletePolicy", "inherited default compositeDeletePolicy from the XRD").await;
                    }
                    ReconcileOutcome::Done
                }
                Some(ErrorKind::Conflict) => {
                    debug!(claim = %bound_claim.name, error = %result.unwrap_err(), "optimistic concurrency conflict, requeuing silently");
                    ReconcileOutcome::Requeue
                }
                Some(ErrorKind::Transient) => {
                    debug!(claim = %bound_claim.name, error = %result.unwrap_err(), "transient reconcile error, requeuing");
                    ReconcileOutcome::Requeue
                }
                Some(_) => {
                    let e = result.unwrap_err();
                    let recorder = events::recorder_for(client.raw().clone(), controller_name.clone(), claim_object_reference(&bound_claim));
                    events::record_error(&recorder, "ClaimBind", &e).await;
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    ReconcileOutcome::Error(e)
                }
            };
            drop(measurer);
            outcome
        })
    })
}

/// Builds the `ObjectReference` an `Event` is attached to, off the claim's
/// own identity fields.
fn claim_object_reference(claim: &Claim) -> k8s_openapi::api::core::v1::ObjectReference {
    k8s_openapi::api::core::v1::ObjectReference {
        api_version: Some(claim.api_version.clone()),
        kind: Some(claim.kind.clone()),
        name: Some(claim.name.clone()),
        namespace: Some(claim.namespace.clone()),
        uid: Some(claim.uid.clone()),
        ..Default::default()
    }
}

/// Returns the claim's already-bound composite reference, creating one (same
/// name as the claim, spec passed through) if the claim is unbound. The
/// claim never owns the composite ("the XR is NOT owned by the
/// claim"), so no owner reference is set here — only `spec.claimRef` on the
/// new XR, pointing back non-authoritatively.
async fn ensure_composite(client: &KindClient, xr_gvk: &Gvk, claim_obj: &DynamicObject, bound_claim: &xrcore_engine::types::Claim) -> Result<ObjectRef> {
    if let Some(existing) = &bound_claim.resource_ref {
        return Ok(existing.clone());
    }

    let name = bound_claim.name.clone();
    let mut spec = claim_obj.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    if let Some(map) = spec.as_object_mut() {
        map.remove("writeConnectionSecretToRef");
        map.remove("compositeDeletePolicy");
        map.insert(
            "claimRef".to_string(),
            serde_json::json!({
                "apiVersion": bound_claim.api_version,
                "kind": bound_claim.kind,
                "name": bound_claim.name,
                "namespace": bound_claim.namespace,
            }),
        );
    }

    let mut obj = DynamicObject::new(&name, &KindClient::api_resource(xr_gvk));
    obj.data = serde_json::json!({ "spec": spec });

    let namespace = if xr_gvk.namespaced { Some(bound_claim.namespace.as_str()) } else { None };
    let created = match client.create(xr_gvk, namespace, &obj).await {
        Ok(created) => created,
        Err(e) if e.kind() == ErrorKind::Conflict => client.get(xr_gvk, namespace, &name).await?,
        Err(e) => return Err(e),
    };

    Ok(ObjectRef {
        api_version: xr_gvk.api_version(),
        kind: xr_gvk.kind.clone(),
        name: created.metadata.name.clone().unwrap_or(name),
        namespace: created.metadata.namespace.clone(),
        uid: created.metadata.uid.clone(),
    })
}

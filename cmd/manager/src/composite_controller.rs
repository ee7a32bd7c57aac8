//! Builds the Composite Reconciler's `Reconciler` closure for one XR kind.
//! One instance of this closure is started per XRD by
//! [`crate::xrd_controller`], parameterized by that XRD's composite and
//! composition-revision GVKs.

use std::sync::Arc;

use tracing::{debug, error};

use xrcore_engine::client::KindClient;
use xrcore_engine::composite;
use xrcore_engine::engine::{events, Engine, ReconcileOutcome, Reconciler, WorkKey};
use xrcore_engine::error::{ErrorKind, Result};
use xrcore_engine::metrics::Metrics;
use xrcore_engine::types::{Composite, ExtraResourceRequirement, Gvk, ObjectRef};

use crate::unimplemented_interfaces::UnimplementedFunctionRunner;

/// Resolves a pipeline step's `requirements.extraResources` against the
/// cluster: lists the requirement's GVK, filtered by its label selector if
/// non-empty. Namespace-scoped lookups are not supported here since a
/// requirement carries no namespace of its own — matches the cluster-scoped
/// lookup a composition function typically asks for (provider configs,
/// cluster-scoped policies).
struct ClusterExtraResourceFetcher {
    client: KindClient,
}

impl composite::ExtraResourceFetcher for ClusterExtraResourceFetcher {
    fn fetch(&self, requirement: &ExtraResourceRequirement) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<serde_json::Value>>> + Send + '_>> {
        let gvk = Gvk::new(
            requirement.api_version.split_once('/').map(|(g, _)| g).unwrap_or_default(),
            requirement.api_version.rsplit('/').next().unwrap_or(&requirement.api_version),
            requirement.kind.clone(),
            format!("{}s", requirement.kind.to_lowercase()),
            false,
        );
        let selector = if requirement.selector.is_empty() {
            None
        } else {
            Some(requirement.selector.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
        };

        Box::pin(async move {
            let objects = self.client.list(&gvk, None, selector.as_deref(), None).await?;
            Ok(objects.into_iter().map(|o| o.data).collect())
        })
    }
}

/// Builds the reconciler for a single composite kind. `revision_gvk` is the
/// `CompositionRevision` kind candidates are listed from (cluster-scoped,
/// shared across every composite kind); `controller_name` is the engine's
/// registry key, used again by [`composite::update_watches`] to attach
/// per-composed-kind watches onto the same controller entry.
pub fn build(engine: Arc<Engine>, client: KindClient, metrics: Metrics, controller_name: String, xr_gvk: Gvk, revision_gvk: Gvk) -> Arc<dyn Reconciler> {
    let runner: Arc<dyn composite::FunctionRunner> = Arc::new(UnimplementedFunctionRunner);

    Arc::new(move |key: WorkKey| {
        let engine = engine.clone();
        let client = client.clone();
        let metrics = metrics.clone();
        let controller_name = controller_name.clone();
        let xr_gvk = xr_gvk.clone();
        let revision_gvk = revision_gvk.clone();
        let runner = runner.clone();
        let fetcher = ClusterExtraResourceFetcher { client: client.clone() };

        Box::pin(async move {
            let measurer = metrics.reconcile.count_and_measure(&controller_name, &xrcore_engine::telemetry::get_trace_id());

            let object = match client.get(&xr_gvk, key.namespace.as_deref(), &key.name).await {
                Ok(obj) => obj,
                Err(e) if e.kind() == ErrorKind::NotFound => return ReconcileOutcome::Done,
                Err(e) => {
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    return ReconcileOutcome::Error(e);
                }
            };

            let mut xr = match composite::from_dynamic(&object) {
                Ok(xr) => xr,
                Err(e) => {
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    return ReconcileOutcome::Error(e);
                }
            };

            let result: Result<bool> = async {
                let revision_objs = client.list(&revision_gvk, None, None, None).await?;
                let revisions = revision_objs.iter().map(composite::revision_from_dynamic).collect::<Result<Vec<_>>>()?;
                let revision = composite::select_revision(&xr, &revisions)?.clone();

                let observed_composed = composite::fetch_observed(&client, &xr).await?;
                let response = composite::run_pipeline(runner.as_ref(), &fetcher, &revision, &object.data, &observed_composed).await?;

                let current = composite::fetch_current(&client, &xr, &response.desired_composed).await?;
                let apply_outcome = composite::apply_desired_state(&client, &xr, &response.desired_composed, &current).await?;
                xr.resource_refs = apply_outcome.resource_refs.clone();
                composite::update_watches(&engine, &controller_name, &apply_outcome.composed_gvks)?;

                let slot_configs = composite::slot_configs_from_revision(&revision, &apply_outcome.applied)?;
                let ready = composite::compute_readiness(&apply_outcome.applied, &slot_configs);
                let details = composite::extract_connection_details(&apply_outcome.applied, &slot_configs);
                composite::publish_connection_secret(&client, &xr, &details).await?;

                if let Some(claim_ref) = xr.claim_ref.clone() {
                    if let Ok(claim_obj) = client.get(&ref_gvk(&claim_ref), claim_ref.namespace.as_deref(), &claim_ref.name).await {
                        let claim_uid = claim_obj.metadata.uid.clone().unwrap_or_default();
                        let secret_client = client.clone();
                        let load_secret = move |r: &ObjectRef| -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<xrcore_engine::claim::ConnectionSecret>> + Send>> {
                            let client = secret_client.clone();
                            let r = r.clone();
                            Box::pin(async move { load_connection_secret(&client, &r).await })
                        };
                        composite::propagate_to_claim(&client, &xr, Some(&claim_ref), &claim_uid, load_secret).await?;
                    }
                }

                Ok(ready)
            }
            .await;

            // Conflict and Transient are expected, self-resolving noise (a
            // concurrent writer, a dropped connection): surfacing them as a
            // Condition/Event/error! would spam the XR's status and the
            // cluster event stream for something that isn't actionable.
            // Every other kind keeps the full user-visible surface.
            let kind = result.as_ref().err().map(|e| e.kind());
            let outcome = match kind {
                None => {
                    composite::record_outcome(&mut xr, &result);
                    let status_obj = composite::status_patch(&xr_gvk, &xr);
                    if let Err(e) = client.apply_status(&xr_gvk, key.namespace.as_deref(), &key.name, &status_obj).await {
                        error!(xr = %xr.name, error = %e, "failed to patch composite status");
                    }
                    ReconcileOutcome::Done
                }
                Some(ErrorKind::Conflict) => {
                    debug!(xr = %xr.name, error = %result.unwrap_err(), "optimistic concurrency conflict, requeuing silently");
                    ReconcileOutcome::Requeue
                }
                Some(ErrorKind::Transient) => {
                    debug!(xr = %xr.name, error = %result.unwrap_err(), "transient reconcile error, requeuing");
                    ReconcileOutcome::Requeue
                }
                Some(_) => {
                    composite::record_outcome(&mut xr, &result);
                    let status_obj = composite::status_patch(&xr_gvk, &xr);
                    if let Err(e) = client.apply_status(&xr_gvk, key.namespace.as_deref(), &key.name, &status_obj).await {
                        error!(xr = %xr.name, error = %e, "failed to patch composite status");
                    }
                    let e = result.unwrap_err();
                    let recorder = events::recorder_for(client.raw().clone(), controller_name.clone(), object_reference(&xr));
                    events::record_error(&recorder, "CompositeReconcile", &e).await;
                    metrics.reconcile.set_failure(&controller_name, &key.to_string(), &e);
                    ReconcileOutcome::Error(e)
                }
            };
            drop(measurer);
            outcome
        })
    })
}

/// Builds the `ObjectReference` an `Event` is attached to, off the XR's own
/// identity fields.
fn object_reference(xr: &Composite) -> k8s_openapi::api::core::v1::ObjectReference {
    k8s_openapi::api::core::v1::ObjectReference {
        api_version: Some(xr.api_version.clone()),
        kind: Some(xr.kind.clone()),
        name: Some(xr.name.clone()),
        namespace: xr.namespace.clone(),
        uid: Some(xr.uid.clone()),
        ..Default::default()
    }
}

/// Derives a `Gvk` from an `ObjectRef`'s own `apiVersion`/`kind`, the same
/// naive pluralization the rest of the engine uses when a ref does not carry
/// its own plural name.
fn ref_gvk(r: &ObjectRef) -> Gvk {
    let (group, version) = match r.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), r.api_version.clone()),
    };
    Gvk::new(group, version, r.kind.clone(), format!("{}s", r.kind.to_lowercase()), r.namespace.is_some())
}

async fn load_connection_secret(client: &KindClient, r: &ObjectRef) -> Result<xrcore_engine::claim::ConnectionSecret> {
    let gvk = Gvk::new("", "v1", "Secret", "secrets", true);
    let obj = client.get(&gvk, r.namespace.as_deref(), &r.name).await?;
    let owner_uid = obj.metadata.owner_references.iter().flatten().find(|o| o.controller.unwrap_or(false)).map(|o| o.uid.clone());
    let data = obj
        .data
        .pointer("/data")
        .and_then(|v| v.as_object())
        .map(|m| {
            use base64::Engine;
            m.iter()
                .filter_map(|(k, v)| {
                    let s = v.as_str()?;
                    base64::engine::general_purpose::STANDARD.decode(s).ok().map(|bytes| (k.clone(), bytes))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(xrcore_engine::claim::ConnectionSecret { name: r.name.clone(), namespace: r.namespace.clone().unwrap_or_default(), owner_uid, data })
}

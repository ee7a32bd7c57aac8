//! The "xrd" meta-controller: watches `CompositeResourceDefinition` objects
//! and starts/stops a Composite Reconciler (and, when the XRD declares
//! claim names, a Claim Binder) per XRD, at runtime — this is what makes
//! the engine's controller set dynamic rather than a fixed, compiled-in
//! list.

use std::sync::Arc;

use tracing::{error, info};

use xrcore_engine::client::KindClient;
use xrcore_engine::engine::{events, ControllerOpts, Engine, ReconcileOutcome, Reconciler, WorkKey};
use xrcore_engine::error::{Error, ErrorKind};
use xrcore_engine::metrics::Metrics;
use xrcore_engine::types::Gvk;
use xrcore_engine::xrd;

use crate::{claim_controller, composite_controller};

pub const XRD_CONTROLLER: &str = "xrd";

/// Concurrency each dynamically-started composite/claim controller runs
/// with. Not exposed as a per-XRD setting (no such field exists on an XRD);
/// a future revision could source this from an annotation instead.
const DYNAMIC_CONTROLLER_CONCURRENCY: usize = 4;

pub fn xrd_gvk() -> Gvk {
    Gvk::new("apiextensions.crossplane.io", "v1", "CompositeResourceDefinition", "compositeresourcedefinitions", false)
}

pub fn composition_revision_gvk() -> Gvk {
    Gvk::new("apiextensions.crossplane.io", "v1", "CompositionRevision", "compositionrevisions", false)
}

/// Builds the `Reconciler` closure for [`XRD_CONTROLLER`]. Since
/// `CompositeResourceDefinition` is cluster-scoped, `key.name` is always the
/// XRD's own name, which is also the stem `xrd::XrdInfo` derives its
/// composite/claim controller names from — so a deleted XRD's controllers
/// can be stopped by name alone, without re-parsing a now-gone object.
pub fn build(engine: Arc<Engine>, client: KindClient, metrics: Metrics) -> Arc<dyn Reconciler> {
    let revision_gvk = composition_revision_gvk();

    Arc::new(move |key: WorkKey| {
        let engine = engine.clone();
        let client = client.clone();
        let metrics = metrics.clone();
        let revision_gvk = revision_gvk.clone();
        let xrd_gvk = xrd_gvk();

        Box::pin(async move {
            let measurer = metrics.reconcile.count_and_measure(XRD_CONTROLLER, &xrcore_engine::telemetry::get_trace_id());

            let object = match client.get(&xrd_gvk, None, &key.name).await {
                Ok(obj) => obj,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    stop_xrd_controllers(&engine, &key.name).await;
                    return ReconcileOutcome::Done;
                }
                Err(e) => {
                    metrics.reconcile.set_failure(XRD_CONTROLLER, &key.to_string(), &e);
                    record_xrd_event(&client, &key.name, "XrdReconcile", &e).await;
                    return ReconcileOutcome::Error(e);
                }
            };

            let info = match xrd::parse(&object) {
                Ok(info) => info,
                Err(e) => {
                    metrics.reconcile.set_failure(XRD_CONTROLLER, &key.to_string(), &e);
                    record_xrd_event(&client, &key.name, "XrdReconcile", &e).await;
                    return ReconcileOutcome::Error(e);
                }
            };

            if info.deleting || !info.established {
                stop_xrd_controllers(&engine, &info.name).await;
                drop(measurer);
                return ReconcileOutcome::Done;
            }

            let composite_name = info.composite_controller_name();
            let composite_reconciler = composite_controller::build(
                engine.clone(),
                client.clone(),
                metrics.clone(),
                composite_name.clone(),
                info.xr_gvk.clone(),
                revision_gvk.clone(),
            );
            if let Err(e) = engine.start(
                &composite_name,
                ControllerOpts { gvk: info.xr_gvk.clone(), concurrency: DYNAMIC_CONTROLLER_CONCURRENCY },
                composite_reconciler,
            ) {
                error!(xrd = %info.name, error = %e, "failed to start composite controller");
                metrics.reconcile.set_failure(XRD_CONTROLLER, &key.to_string(), &e);
                record_xrd_event(&client, &info.name, "XrdReconcile", &e).await;
                drop(measurer);
                return ReconcileOutcome::Error(e);
            }
            info!(xrd = %info.name, controller = %composite_name, "composite controller running");

            let claim_name = info.claim_controller_name();
            match &info.claim_gvk {
                Some(claim_gvk) => {
                    let claim_reconciler = claim_controller::build(
                        client.clone(),
                        metrics.clone(),
                        claim_name.clone(),
                        claim_gvk.clone(),
                        info.xr_gvk.clone(),
                        info.default_composite_delete_policy,
                    );
                    if let Err(e) = engine.start(
                        &claim_name,
                        ControllerOpts { gvk: claim_gvk.clone(), concurrency: DYNAMIC_CONTROLLER_CONCURRENCY },
                        claim_reconciler,
                    ) {
                        error!(xrd = %info.name, error = %e, "failed to start claim controller");
                        metrics.reconcile.set_failure(XRD_CONTROLLER, &key.to_string(), &e);
                        record_xrd_event(&client, &info.name, "XrdReconcile", &e).await;
                        drop(measurer);
                        return ReconcileOutcome::Error(e);
                    }
                    info!(xrd = %info.name, controller = %claim_name, "claim controller running");
                }
                None => {
                    let _ = engine.stop(&claim_name).await;
                }
            }

            drop(measurer);
            ReconcileOutcome::Done
        })
    })
}

/// Emits a `Warning` event against the XRD itself. Cluster-scoped, so the
/// reference carries no namespace/uid beyond its name.
async fn record_xrd_event(client: &KindClient, xrd_name: &str, reason: &str, err: &Error) {
    let reference = k8s_openapi::api::core::v1::ObjectReference {
        api_version: Some("apiextensions.crossplane.io/v1".to_string()),
        kind: Some("CompositeResourceDefinition".to_string()),
        name: Some(xrd_name.to_string()),
        ..Default::default()
    };
    let recorder = events::recorder_for(client.raw().clone(), XRD_CONTROLLER, reference);
    events::record_error(&recorder, reason, err).await;
}

async fn stop_xrd_controllers(engine: &Engine, xrd_name: &str) {
    let composite_name = format!("composite/{xrd_name}");
    let claim_name = format!("claim/{xrd_name}");
    let _ = engine.stop(&composite_name).await;
    let _ = engine.stop(&claim_name).await;
    info!(xrd = %xrd_name, "stopped controllers for removed/uninstalled xrd");
}

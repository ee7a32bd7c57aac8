//! Watch Garbage Collector: periodically drops watches on kinds no longer
//! referenced by any live XR.
//!
//! Uses the same periodic-tick idiom as `kube_runtime::scheduler`, applied
//! here to a GC sweep instead of a reconcile dequeue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::types::{Gvk, WatchId, WatchKind};

pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(600);

/// Runs forever (until `cancel`), sweeping every registered controller's
/// watch set once per `interval`. Failures at any step are logged and
/// retried on the next tick; a GC failure is never fatal to the engine.
pub async fn run(engine: Arc<Engine>, metrics: Metrics, interval: Duration, cancel: tokio_util::sync::CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for name in engine.controller_names() {
                    if let Err(e) = sweep(&engine, &metrics, &name).await {
                        warn!(controller = %name, error = %e, "watch GC sweep failed, will retry next tick");
                    }
                }
            }
        }
    }
}

/// One GC pass for a single controller: computes `needed` from the
/// `resourceRefs` of every live XR of the controller's primary kind, then
/// stops any watch in `current` that is neither `needed` nor the primary.
async fn sweep(engine: &Arc<Engine>, metrics: &Metrics, controller_name: &str) -> crate::error::Result<()> {
    let current = engine.get_watches(controller_name);
    let Some(primary) = current.iter().find(|w| w.kind == WatchKind::CompositeResource).cloned() else {
        // No primary watch registered yet; nothing meaningful to collect.
        return Ok(());
    };

    // The primary kind is always watched by its controller, so the informer
    // cache has a live copy of every XR; reading from it here avoids a full
    // LIST against the API server on every GC tick. Fall back to a direct
    // list only if the watch hasn't populated the cache yet.
    let xrs: Vec<DynamicObject> = if engine.cache().is_registered(&primary.gvk) {
        engine.cache().list(&primary.gvk).iter().map(|obj| (**obj).clone()).collect()
    } else {
        engine.get_client().list(&primary.gvk, None, None, None).await?
    };

    let needed = needed_composed_gvks(&xrs);

    let stale: Vec<WatchId> = current
        .iter()
        .filter(|w| w.gvk != primary.gvk && !needed.contains(&w.gvk))
        .cloned()
        .collect();

    if stale.is_empty() {
        metrics.reconcile.set_active_watches(controller_name, current.len() as i64);
        return Ok(());
    }

    let stopped = engine.stop_watches(controller_name, &stale)?;
    info!(controller = %controller_name, stopped, "watch gc stopped stale watches");
    metrics.reconcile.set_active_watches(controller_name, (current.len() - stopped) as i64);
    Ok(())
}

/// Extracts the set of composed-resource GVKs referenced by any live XR's
/// `spec.resourceRefs`.
fn needed_composed_gvks(xrs: &[DynamicObject]) -> HashSet<Gvk> {
    let mut needed = HashSet::new();
    for xr in xrs {
        let Some(refs) = xr.data.pointer("/spec/resourceRefs").and_then(|v| v.as_array()) else {
            continue;
        };
        for r in refs {
            let (Some(api_version), Some(kind)) = (
                r.get("apiVersion").and_then(|v| v.as_str()),
                r.get("kind").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let (group, version) = match api_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), api_version.to_string()),
            };
            // resourceRefs do not carry the plural name; naive pluralization
            // is good enough since the GVK is only used as a GC set key here.
            let plural = format!("{}s", kind.to_lowercase());
            needed.insert(Gvk::new(group, version, kind, plural, r.get("namespace").is_some()));
        }
    }
    needed
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn xr_with_refs(refs: serde_json::Value) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "XBucket",
            "metadata": {"name": "x1"},
            "spec": {"resourceRefs": refs}
        }))
        .unwrap();
        obj.data = json!({"spec": {"resourceRefs": refs}});
        obj
    }

    #[test]
    fn needed_gvks_extracted_from_resource_refs() {
        let xrs = vec![xr_with_refs(json!([
            {"apiVersion": "s3.example.org/v1", "kind": "Bucket", "name": "b1"},
            {"apiVersion": "iam.example.org/v1", "kind": "User", "name": "u1"}
        ]))];
        let needed = needed_composed_gvks(&xrs);
        assert_eq!(needed.len(), 2);
        assert!(needed.contains(&Gvk::new("s3.example.org", "v1", "Bucket", "buckets", false)));
    }

    #[test]
    fn no_resource_refs_yields_empty_set() {
        let xrs = vec![xr_with_refs(json!([]))];
        assert!(needed_composed_gvks(&xrs).is_empty());
    }
}

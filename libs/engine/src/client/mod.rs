//! Typed/unstructured access to the API server plus a per-GVK informer
//! cache.
//!
//! Grounded in `libs/k8s-util/src/client.rs`'s metrics-instrumented
//! `kube::Client` constructor; generalized here from a single static CRD to
//! arbitrary GVKs resolved at runtime, since the engine discovers new kinds
//! as package revisions install CRDs.

pub mod cache;

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::{Client, Resource};

use crate::error::{Error, Result};
use crate::types::Gvk;

pub use cache::Cache;

/// Field manager used for every server-side-apply performed by the engine.
pub const FIELD_MANAGER: &str = "xrcore-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePropagation {
    Foreground,
    Background,
}

impl From<DeletePropagation> for PropagationPolicy {
    fn from(p: DeletePropagation) -> Self {
        match p {
            DeletePropagation::Foreground => PropagationPolicy::Foreground,
            DeletePropagation::Background => PropagationPolicy::Background,
        }
    }
}

/// A kind-aware client: wraps a plain `kube::Client` and resolves an
/// `Api<DynamicObject>` for any GVK. Namespacing and plural name come from
/// the `Gvk` itself (known by callers from CRD install or from the
/// resourceRefs already recorded on an XR), so no discovery round trip is
/// needed on the hot path.
#[derive(Clone)]
pub struct KindClient {
    inner: Client,
}

impl KindClient {
    pub fn new(inner: Client) -> Self {
        Self { inner }
    }

    pub fn raw(&self) -> &Client {
        &self.inner
    }

    pub fn api_resource(gvk: &Gvk) -> ApiResource {
        ApiResource {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            plural: gvk.plural.clone(),
        }
    }

    /// Resolves the `Api<DynamicObject>` for `gvk`, scoped to `namespace` when
    /// the kind is namespaced. Exposed at `pub(crate)` so the controller
    /// engine can drive a raw `watcher()` stream against the same typed view
    /// the rest of the client uses, instead of re-deriving an `ApiResource`.
    pub(crate) fn api_for(&self, gvk: &Gvk, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = Self::api_resource(gvk);
        match (gvk.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.inner.clone(), ns, &ar),
            _ => Api::all_with(self.inner.clone(), &ar),
        }
    }

    pub async fn get(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        self.api_for(gvk, namespace).get(name).await.map_err(|e| match e {
            kube::Error::Api(r) if r.code == 404 => Error::NotFound(format!("{}/{name}", gvk.kind)),
            other => Error::Kube(other),
        })
    }

    pub async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut lp = ListParams::default();
        if let Some(ls) = label_selector {
            lp = lp.labels(ls);
        }
        if let Some(fs) = field_selector {
            lp = lp.fields(fs);
        }
        let list = self.api_for(gvk, namespace).list(&lp).await?;
        Ok(list.items)
    }

    pub async fn create(&self, gvk: &Gvk, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self.api_for(gvk, namespace).create(&Default::default(), obj).await?)
    }

    /// Server-side apply. `dry_run=true` obtains the post-merge "would-be"
    /// object without persisting it — used by the composite reconciler's
    /// dry-run-apply step. The client never re-implements the merge itself;
    /// the API server's field-ownership tracking is authoritative.
    pub async fn apply(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        Ok(self.api_for(gvk, namespace).patch(name, &pp, &Patch::Apply(obj)).await?)
    }

    /// Server-side apply to the `status` subresource.
    pub async fn apply_status(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, obj: &DynamicObject) -> Result<DynamicObject> {
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .api_for(gvk, namespace)
            .patch_status(name, &pp, &Patch::Apply(obj))
            .await?)
    }

    pub async fn delete(&self, gvk: &Gvk, namespace: Option<&str>, name: &str, propagation: DeletePropagation) -> Result<()> {
        let dp = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..DeleteParams::default()
        };
        match self.api_for(gvk, namespace).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(r)) if r.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

}

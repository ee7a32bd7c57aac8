//! Package Revision Reconciler.
//!
//! Generalizes a single-object reconcile shape (finalizer add/remove
//! bracketing a create/delete decision) from one hardcoded Deployment to an
//! arbitrary set of embedded objects parsed out of a package image.
//! `ImageFetcher`/`PackageParser` are modeled only as the trait interfaces
//! the core consumes — their implementations (OCI fetch, docker-based
//! linters) are out of scope.

use std::time::Duration;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::info;

use crate::client::{DeletePropagation, KindClient};
use crate::engine::ReconcileOutcome;
use crate::error::{Error, Result};
use crate::types::{
    Condition, ConditionStatus, DesiredState, ObjectRef, PackageRevision, PackageType, ParsedPackage, COND_HEALTHY, COND_INSTALLED,
};

pub const PACKAGE_REVISION_FINALIZER: &str = "packagerevision.xrcore.io";

/// The current running Crossplane-compatible version, checked against a
/// revision's declared constraint unless it opts out.
pub const RUNNING_VERSION: &str = "1.0.0";

const SHORT_REQUEUE: Duration = Duration::from_secs(30);
const LONG_REQUEUE: Duration = Duration::from_secs(60 * 60);

/// Fetches a package image and returns its single concatenated-YAML stream
/// layer. Implementations (OCI registry fetch with the default credentials
/// chain) are out of scope; only this interface is consumed.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, image: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>>> + Send + '_>>;
}

/// Parses a fetched image layer into a `Package{meta, objects}`.
/// Implementations are out of scope; only this interface is consumed.
pub trait PackageParser: Send + Sync {
    fn parse(&self, layer: &[u8]) -> Result<ParsedPackage>;
}

/// Provider/Configuration/Function-specific pre/post install hooks, e.g.
/// configuring the Deployment spec a Provider's controller manager will
/// later install.
pub trait Hooks: Send + Sync {
    fn pre(&self, meta: &serde_json::Value, revision: &PackageRevision, deleting: bool) -> Result<()>;
    fn post(&self, meta: &serde_json::Value, revision: &PackageRevision) -> Result<()>;
}

/// Exactly one meta object of the expected kind per package type, plus the
/// allowed kind set for embedded objects — a per-package-type linter set.
fn lint(package_type: PackageType, parsed: &ParsedPackage) -> Result<()> {
    let expected_meta_kind = match package_type {
        PackageType::Provider => "Provider",
        PackageType::Configuration => "Configuration",
        PackageType::Function => "Function",
    };
    let meta_kind = parsed.meta.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
    if meta_kind != expected_meta_kind {
        return Err(Error::LintFailure(format!(
            "expected exactly one meta object of kind {expected_meta_kind}, got {meta_kind}"
        )));
    }

    let allowed: &[&str] = match package_type {
        PackageType::Provider => &["CustomResourceDefinition", "ControllerConfig"],
        PackageType::Configuration => &["CompositeResourceDefinition", "Composition"],
        PackageType::Function => &["CustomResourceDefinition"],
    };
    for obj in &parsed.objects {
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        if !allowed.contains(&kind) {
            return Err(Error::LintFailure(format!("embedded object of kind {kind} not allowed in a {expected_meta_kind} package")));
        }
    }
    Ok(())
}

/// Second, independent check that exactly one meta object of the package's
/// expected kind exists — counts across the *whole* parsed object set
/// (`meta` plus every embedded object) rather than trusting `lint`'s single
/// `meta.kind` field comparison. Catches a package whose embedded objects
/// smuggle in a second meta-kind object that `lint` never looks at.
fn assert_single_meta_object(package_type: PackageType, parsed: &ParsedPackage) -> Result<()> {
    let expected_meta_kind = match package_type {
        PackageType::Provider => "Provider",
        PackageType::Configuration => "Configuration",
        PackageType::Function => "Function",
    };
    let meta_count = std::iter::once(&parsed.meta)
        .chain(parsed.objects.iter())
        .filter(|obj| obj.get("kind").and_then(|v| v.as_str()) == Some(expected_meta_kind))
        .count();
    if meta_count != 1 {
        return Err(Error::LintFailure(format!(
            "expected exactly one meta object of kind {expected_meta_kind} in the package, found {meta_count}"
        )));
    }
    Ok(())
}

/// Checks `meta.spec.crossplaneVersion` (a semver constraint) against
/// [`RUNNING_VERSION`], unless the revision opts out via
/// `ignoreCrossplaneConstraints`.
fn check_version_constraint(revision: &PackageRevision, meta: &serde_json::Value) -> Result<()> {
    if revision.ignore_crossplane_constraints {
        return Ok(());
    }
    let Some(constraint) = meta.pointer("/spec/crossplaneVersion").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    // A full semver-range evaluator is out of scope; the core only needs to
    // detect the unambiguous "exact pin that doesn't match" case here.
    if constraint.chars().all(|c| c.is_ascii_digit() || c == '.') && constraint != RUNNING_VERSION {
        return Err(Error::VersionConstraint(format!(
            "package requires crossplane {constraint}, running {RUNNING_VERSION}"
        )));
    }
    Ok(())
}

/// One reconcile of a single PackageRevision: fetch, parse, lint, render
/// embedded objects, apply or delete them, then record status.
#[allow(clippy::too_many_arguments)]
pub async fn reconcile_package_revision(
    client: &KindClient,
    fetcher: &dyn ImageFetcher,
    parser: &dyn PackageParser,
    hooks: &dyn Hooks,
    revision_object: &kube::api::DynamicObject,
    revision: &mut PackageRevision,
) -> ReconcileOutcome {
    match try_reconcile(client, fetcher, parser, hooks, revision_object, revision).await {
        Ok(outcome) => outcome,
        Err(e) => {
            revision.set_condition(Condition::new(COND_HEALTHY, ConditionStatus::False, e.metric_label()).with_message(e.to_string()));
            match e.kind() {
                crate::error::ErrorKind::LintFailure | crate::error::ErrorKind::VersionConstraint => ReconcileOutcome::RequeueAfter(LONG_REQUEUE),
                _ => ReconcileOutcome::RequeueAfter(SHORT_REQUEUE),
            }
        }
    }
}

async fn try_reconcile(
    client: &KindClient,
    fetcher: &dyn ImageFetcher,
    parser: &dyn PackageParser,
    hooks: &dyn Hooks,
    revision_object: &kube::api::DynamicObject,
    revision: &mut PackageRevision,
) -> Result<ReconcileOutcome> {
    // 1. Marked for deletion: Pre(deleting=true), remove finalizer, Done.
    if revision.deletion_timestamp.is_some() {
        let meta = serde_json::json!({"kind": match revision.package_type {
            PackageType::Provider => "Provider",
            PackageType::Configuration => "Configuration",
            PackageType::Function => "Function",
        }});
        hooks.pre(&meta, revision, true)?;
        revision.finalizers.retain(|f| f != PACKAGE_REVISION_FINALIZER);
        info!(revision = %revision.name, "package revision finalized, finalizer removed");
        return Ok(ReconcileOutcome::Done);
    }

    // 2. Ensure finalizer present.
    if !revision.finalizers.iter().any(|f| f == PACKAGE_REVISION_FINALIZER) {
        revision.finalizers.push(PACKAGE_REVISION_FINALIZER.to_string());
    }

    // 3. Fetch the install artifact.
    let layer = fetcher.fetch(&revision.image).await?;

    // 4. Parse + lint.
    let parsed = parser.parse(&layer)?;
    lint(revision.package_type, &parsed)?;

    // 5. Version constraint.
    check_version_constraint(revision, &parsed.meta)?;

    // 5b. Re-verify exactly one meta object, independently of step 4's lint.
    assert_single_meta_object(revision.package_type, &parsed)?;

    // 6. Pre hook.
    hooks.pre(&parsed.meta, revision, false)?;

    // 7. Establish control (Active) or ownership (Inactive) of every
    // embedded object.
    let mut object_refs = Vec::with_capacity(parsed.objects.len());
    for obj in &parsed.objects {
        let owned = apply_embedded_object(client, revision, obj).await?;
        object_refs.push(owned);
    }
    revision.object_refs = object_refs;

    // 8. Post hook.
    hooks.post(&parsed.meta, revision)?;

    // 9. Healthy.
    revision.set_condition(Condition::new(COND_INSTALLED, ConditionStatus::True, "InstalledSuccessfully"));
    revision.set_condition(Condition::new(COND_HEALTHY, ConditionStatus::True, "HealthyPackageRevision"));
    let _ = revision_object; // the caller applies `revision`'s status via the client; kept for signature symmetry with other reconcilers
    Ok(ReconcileOutcome::RequeueAfter(LONG_REQUEUE))
}

/// Applies one embedded object with a controller reference to the revision
/// when `desiredState=Active`, or a non-controlling owner reference when
/// `Inactive`, and returns the resulting typed reference for
/// `status.objectRefs`.
async fn apply_embedded_object(client: &KindClient, revision: &PackageRevision, obj: &serde_json::Value) -> Result<ObjectRef> {
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let name = obj
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Fatal(format!("embedded {kind} object missing metadata.name")))?
        .to_string();
    let namespace = obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(str::to_string);

    let (group, version) = api_version.split_once('/').map(|(g, v)| (g.to_string(), v.to_string())).unwrap_or_default();
    let gvk = crate::types::Gvk::new(group, version, kind.clone(), format!("{}s", kind.to_lowercase()), namespace.is_some());

    let is_controller = revision.desired_state == crate::types::DesiredState::Active;
    let mut dynamic_obj: kube::api::DynamicObject = serde_json::from_value(obj.clone())?;
    dynamic_obj
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: "pkg.xrcore.io/v1".to_string(),
            kind: "PackageRevision".to_string(),
            name: revision.name.clone(),
            uid: revision.uid.clone(),
            controller: Some(is_controller),
            block_owner_deletion: Some(true),
        });

    let applied = client.apply(&gvk, namespace.as_deref(), &name, &dynamic_obj, false).await?;

    Ok(ObjectRef {
        api_version,
        kind,
        name: applied.metadata.name.unwrap_or(name),
        namespace,
        uid: applied.metadata.uid,
    })
}

/// Foreground/background delete propagation used when removing objects a
/// deactivated revision no longer owns.
pub async fn delete_owned_object(client: &KindClient, gvk: &crate::types::Gvk, namespace: Option<&str>, name: &str) -> Result<()> {
    client.delete(gvk, namespace, name, DeletePropagation::Background).await
}

/// Builds a [`PackageRevision`] from its `DynamicObject` wire form. The
/// revision's kind (`ProviderRevision`/`ConfigurationRevision`/
/// `FunctionRevision`) tells us its `PackageType`; the owning `Package`'s
/// name/uid come off the controller owner reference set when the revision
/// was created.
pub fn from_dynamic(obj: &DynamicObject) -> Result<PackageRevision> {
    let package_type = match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("ProviderRevision") => PackageType::Provider,
        Some("ConfigurationRevision") => PackageType::Configuration,
        Some("FunctionRevision") => PackageType::Function,
        other => return Err(Error::Fatal(format!("unrecognized package revision kind {other:?}"))),
    };

    let owner = obj.meta().owner_references.iter().flatten().find(|o| o.controller.unwrap_or(false));

    let desired_state = match obj.data.pointer("/spec/desiredState").and_then(|v| v.as_str()) {
        Some("Active") => DesiredState::Active,
        _ => DesiredState::Inactive,
    };

    let conditions = obj
        .data
        .pointer("/status/conditions")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(PackageRevision {
        name: obj.name_any(),
        uid: obj.uid().unwrap_or_default(),
        package_name: owner.map(|o| o.name.clone()).unwrap_or_default(),
        package_uid: owner.map(|o| o.uid.clone()).unwrap_or_default(),
        package_type,
        image: obj.data.pointer("/spec/package").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        desired_state,
        digest: obj.data.pointer("/status/resolvedPackageDigest").and_then(|v| v.as_str()).map(str::to_string),
        ignore_crossplane_constraints: obj.data.pointer("/spec/ignoreCrossplaneConstraints").and_then(|v| v.as_bool()).unwrap_or(false),
        crossplane_constraint: obj.data.pointer("/spec/crossplaneConstraints/version").and_then(|v| v.as_str()).map(str::to_string),
        object_refs: Vec::new(),
        conditions,
        deletion_timestamp: obj.meta().deletion_timestamp.clone().map(|t| t.0),
        finalizers: obj.finalizers().to_vec(),
    })
}

/// Builds the patch body written back after a reconcile: `status.conditions`
/// and `status.objectRefs`, applied via `KindClient::apply_status`, plus the
/// finalizer list, applied separately since finalizers live under
/// `metadata` rather than `status`.
pub fn status_patch(gvk: &crate::types::Gvk, revision: &PackageRevision) -> DynamicObject {
    let mut obj = DynamicObject::new(&revision.name, &KindClient::api_resource(gvk));
    obj.data = serde_json::json!({
        "status": {
            "conditions": revision.conditions,
            "objectRefs": revision.object_refs,
        }
    });
    obj
}

pub fn finalizer_patch(gvk: &crate::types::Gvk, revision: &PackageRevision) -> DynamicObject {
    let mut obj = DynamicObject::new(&revision.name, &KindClient::api_resource(gvk));
    obj.data = serde_json::json!({ "metadata": { "finalizers": revision.finalizers } });
    obj
}

//! Composite Reconciler — the pipeline that turns one composite resource
//! into a set of composed resources.
//!
//! This is the engine's largest single reconciler: composition selection,
//! the composition-function pipeline, desired/current diffing via
//! server-side dry-run apply, real apply in deterministic slot order,
//! deletion of abandoned slots, watch updates, readiness, and connection
//! propagation. Follows the "compute desired, diff, apply, set status" shape
//! of a single-object reconcile loop, generalized from one object to an
//! ordered slot map.

pub mod fieldpath;

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::claim;
use crate::client::{DeletePropagation, KindClient};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::types::{
    Composite, CompositionRevision, ConditionStatus, FunctionRequest, FunctionResponse, Gvk, ObjectRef, PipelineStep, ReadinessCheckSpec,
    ResourceDeletePolicy, ResourceRef, Severity, WatchId, WatchKind, COND_READY, COND_SYNCED,
};
use fieldpath::FieldPath;

/// How a composed slot's readiness is decided.
pub enum ReadinessCheck {
    /// Always ready as soon as the object exists (the "None" check).
    None,
    MatchCondition { type_: String, status: ConditionStatus },
    MatchField { path: FieldPath, value: serde_json::Value },
}

impl ReadinessCheck {
    fn is_ready(&self, observed: &DynamicObject) -> bool {
        match self {
            ReadinessCheck::None => true,
            ReadinessCheck::MatchCondition { type_, status } => observed
                .data
                .pointer("/status/conditions")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .any(|c| {
                    c.get("type").and_then(|v| v.as_str()) == Some(type_.as_str())
                        && c.get("status").and_then(|v| v.as_str()) == Some(condition_status_str(*status))
                }),
            ReadinessCheck::MatchField { path, value } => path.get(&observed.data) == Some(value),
        }
    }
}

fn condition_status_str(status: ConditionStatus) -> &'static str {
    match status {
        ConditionStatus::True => "True",
        ConditionStatus::False => "False",
        ConditionStatus::Unknown => "Unknown",
    }
}

/// `slot -> (GVK, connection-detail key -> field path)`. Carried alongside
/// a `CompositionRevision` since detail extraction is composition-specific,
/// not pipeline-output.
pub struct SlotConfig {
    pub gvk: Gvk,
    pub readiness: ReadinessCheck,
    pub connection_details: BTreeMap<String, FieldPath>,
}

/// Runs one composition-function pipeline step. Implementations (the gRPC
/// client to an out-of-process function) are out of scope; only this
/// interface is consumed.
pub trait FunctionRunner: Send + Sync {
    fn run(&self, step: &PipelineStep, request: FunctionRequest) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FunctionResponse>> + Send + '_>>;
}

/// Fetches the resources a function step asked for via `requirements.extraResources`.
/// Implementations resolve the requirement's GVK/selector against the cluster; out
/// of scope here is anything beyond this interface.
pub trait ExtraResourceFetcher: Send + Sync {
    fn fetch(
        &self,
        requirement: &crate::types::ExtraResourceRequirement,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<serde_json::Value>>> + Send + '_>>;
}

/// A fetcher that never has anything to offer — used where no extra-resources
/// backing is wired, so a step requesting one simply observes an empty match set
/// rather than the pipeline stalling.
pub struct NoExtraResources;

impl ExtraResourceFetcher for NoExtraResources {
    fn fetch(&self, _requirement: &crate::types::ExtraResourceRequirement) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<serde_json::Value>>> + Send + '_>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Upper bound on how many times a single pipeline step is re-invoked to satisfy
/// its own `requirements.extraResources`, so a function that keeps asking for new
/// resources every round can't stall the pipeline forever.
const MAX_EXTRA_RESOURCE_ROUNDS: usize = 5;

/// Resolves a `CompositionRevision` for `xr`: direct ref by name, else
/// selector tie-broken by highest generation then lexicographic name.
pub fn select_revision<'a>(xr: &Composite, revisions: &'a [CompositionRevision]) -> Result<&'a CompositionRevision> {
    if let Some(ref_name) = xr.composition_ref.as_ref().map(|r| &r.name) {
        return revisions
            .iter()
            .find(|r| &r.composition_name == ref_name)
            .ok_or_else(|| Error::NotFound(format!("composition {ref_name}")));
    }

    let mut candidates: Vec<&CompositionRevision> = revisions.iter().collect();
    if candidates.is_empty() {
        return Err(Error::NotFound("no composition revision available".to_string()));
    }
    candidates.sort_by(|a, b| b.generation.cmp(&a.generation).then_with(|| a.name.cmp(&b.name)));
    Ok(candidates[0])
}

/// Builds a [`Composite`] from its `DynamicObject` wire form. `spec` is kept
/// as the raw JSON tree, opaque to the engine; only the fields the pipeline
/// itself needs are lifted out.
pub fn from_dynamic(obj: &DynamicObject) -> Result<Composite> {
    let types = obj.types.as_ref().ok_or_else(|| Error::Fatal("composite object missing apiVersion/kind".to_string()))?;

    let composition_ref = obj
        .data
        .pointer("/spec/compositionRef")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?;
    let composition_selector = obj
        .data
        .pointer("/spec/compositionSelector/matchLabels")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect());
    let resource_refs = obj
        .data
        .pointer("/spec/resourceRefs")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let conditions = obj
        .data
        .pointer("/status/conditions")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let write_connection_secret_to_ref = obj
        .data
        .pointer("/spec/writeConnectionSecretToRef")
        .and_then(|v| v.get("name"))
        .and_then(|v| v.as_str())
        .map(|name| ObjectRef {
            api_version: String::new(),
            kind: "Secret".to_string(),
            name: name.to_string(),
            namespace: obj.namespace(),
            uid: None,
        });
    let claim_ref = obj.data.pointer("/spec/claimRef").cloned().map(serde_json::from_value).transpose()?;
    let resources_delete_policy = match obj.data.pointer("/spec/resourcesDeletePolicy").and_then(|v| v.as_str()) {
        Some("Orphan") => crate::types::ResourceDeletePolicy::Orphan,
        Some("ForegroundDelete") => crate::types::ResourceDeletePolicy::ForegroundDelete,
        _ => crate::types::ResourceDeletePolicy::Delete,
    };

    Ok(Composite {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: obj.name_any(),
        namespace: obj.namespace(),
        uid: obj.uid().unwrap_or_default(),
        generation: obj.meta().generation.unwrap_or_default(),
        composition_ref,
        composition_selector,
        resource_refs,
        conditions,
        write_connection_secret_to_ref,
        claim_ref,
        resources_delete_policy,
        spec: obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null),
    })
}

/// Builds the status patch written back after a reconcile: `status.conditions`
/// and `status.resourceRefs`, applied via `KindClient::apply_status`.
pub fn status_patch(gvk: &Gvk, xr: &Composite) -> DynamicObject {
    let mut obj = DynamicObject::new(&xr.name, &KindClient::api_resource(gvk));
    obj.metadata.namespace = xr.namespace.clone();
    obj.data = serde_json::json!({
        "status": {
            "conditions": xr.conditions,
            "resourceRefs": xr.resource_refs,
        }
    });
    obj
}

/// Parses a `CompositionRevision` off its `DynamicObject` wire form:
/// `spec.pipeline[]` and `spec.resources{}` (per-slot readiness/connection
/// config).
pub fn revision_from_dynamic(obj: &DynamicObject) -> Result<CompositionRevision> {
    let pipeline = obj
        .data
        .pointer("/spec/pipeline")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_else(Vec::<PipelineStep>::new);
    let resources = obj
        .data
        .pointer("/spec/resources")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let composition_name = obj
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.kind == "Composition")
        .map(|o| o.name.clone())
        .or_else(|| obj.labels().get("crossplane.io/composition-name").cloned())
        .unwrap_or_default();

    Ok(CompositionRevision {
        name: obj.name_any(),
        composition_name,
        generation: obj.meta().generation.unwrap_or_default(),
        pipeline,
        resources,
    })
}

/// Converts a [`CompositionRevision`]'s per-slot `ResourceConfig` into the
/// [`SlotConfig`] the readiness/connection-detail steps consume, deriving
/// each slot's `Gvk` from its applied object since the revision's config
/// does not itself carry a GVK.
pub fn slot_configs_from_revision(revision: &CompositionRevision, applied: &BTreeMap<String, DynamicObject>) -> Result<BTreeMap<String, SlotConfig>> {
    let mut out = BTreeMap::new();
    for (slot, obj) in applied {
        let gvk = gvk_of(&obj.data, obj.metadata.namespace.is_some());
        let config = revision.resources.get(slot);
        let readiness = match config.and_then(|c| c.readiness.as_ref()) {
            None | Some(ReadinessCheckSpec::None) => ReadinessCheck::None,
            Some(ReadinessCheckSpec::MatchCondition { condition_type, condition_status }) => {
                ReadinessCheck::MatchCondition { type_: condition_type.clone(), status: *condition_status }
            }
            Some(ReadinessCheckSpec::MatchField { field_path, match_value }) => {
                ReadinessCheck::MatchField { path: FieldPath::parse(field_path)?, value: match_value.clone() }
            }
        };
        let connection_details = config
            .map(|c| {
                c.connection_details
                    .iter()
                    .map(|(k, path)| FieldPath::parse(path).map(|p| (k.clone(), p)))
                    .collect::<Result<BTreeMap<_, _>>>()
            })
            .transpose()?
            .unwrap_or_default();
        out.insert(slot.clone(), SlotConfig { gvk, readiness, connection_details });
    }
    Ok(out)
}

/// Runs the pipeline start to finish. Stops at the first `Fatal` result
/// without rolling back prior steps' outputs — best-effort convergent
/// rather than all-or-nothing.
pub async fn run_pipeline(
    runner: &dyn FunctionRunner,
    fetcher: &dyn ExtraResourceFetcher,
    revision: &CompositionRevision,
    observed_xr: &serde_json::Value,
    observed_composed: &BTreeMap<String, DynamicObject>,
) -> Result<FunctionResponse> {
    let mut desired_composed = BTreeMap::new();
    let mut desired_xr = None;
    let mut all_results = Vec::new();

    for step in &revision.pipeline {
        let mut extra_resources: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        let mut round = 0usize;
        let response = loop {
            let request = FunctionRequest {
                observed_xr: observed_xr.clone(),
                observed_composed: observed_composed.iter().map(|(k, v)| (k.clone(), v.data.clone())).collect(),
                desired_from_prior_step: desired_composed.clone(),
                input: step.input.clone(),
                context: serde_json::Value::Null,
                extra_resources: extra_resources.clone(),
            };

            let response = runner.run(step, request).await?;

            if response.extra_resources.is_empty() || round >= MAX_EXTRA_RESOURCE_ROUNDS {
                break response;
            }
            round += 1;

            for requirement in &response.extra_resources {
                let resources = fetcher.fetch(requirement).await?;
                extra_resources.insert(requirement.name.clone(), resources);
            }
        };

        if let Some(fatal) = response.results.iter().find(|r| r.severity == Severity::Fatal) {
            return Err(Error::FunctionFatal {
                function: step.function_ref.clone(),
                message: fatal.message.clone(),
            });
        }

        for r in &response.results {
            if r.severity == Severity::Warning {
                warn!(step = %step.step, message = %r.message, "composition function warning");
            }
        }

        desired_composed.extend(response.desired_composed.clone());
        if response.desired_xr.is_some() {
            desired_xr = response.desired_xr.clone();
        }
        all_results.extend(response.results);
    }

    Ok(FunctionResponse {
        desired_xr,
        desired_composed,
        results: all_results,
        extra_resources: Vec::new(),
        ttl: None,
    })
}

/// Derives a `Gvk` from a desired object's own `apiVersion`/`kind`. The
/// plural name is not carried by function output, so it is guessed the same
/// naive way the watch GC guesses it for `resourceRefs` entries.
fn gvk_of(obj: &serde_json::Value, namespaced: bool) -> Gvk {
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let plural = format!("{}s", kind.to_lowercase());
    Gvk::new(group, version, kind, plural, namespaced)
}

/// Fetches the existing counterpart of each desired slot. A desired object
/// that already names itself (`metadata.name`) is fetched directly by that
/// name/namespace, since the pipeline is telling us exactly what it means;
/// only when it doesn't do we fall back to the slot annotation recorded on
/// the XR's `resourceRefs` from a previous reconcile.
pub async fn fetch_current(client: &KindClient, xr: &Composite, desired_composed: &BTreeMap<String, serde_json::Value>) -> Result<BTreeMap<String, DynamicObject>> {
    let mut current = BTreeMap::new();
    for (slot, desired) in desired_composed {
        let (gvk, namespace, name) = if let Some(name) = desired.pointer("/metadata/name").and_then(|v| v.as_str()) {
            let namespace = desired.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(str::to_string).or_else(|| xr.namespace.clone());
            let gvk = gvk_of(desired, namespace.is_some());
            (gvk, namespace, name.to_string())
        } else {
            let Some(existing_ref) = xr.resource_refs.iter().find(|r| &r.slot == slot) else {
                continue;
            };
            let gvk = Gvk::new(
                existing_ref.api_version.split_once('/').map(|(g, _)| g).unwrap_or_default(),
                existing_ref.api_version.rsplit('/').next().unwrap_or(&existing_ref.api_version),
                existing_ref.kind.clone(),
                format!("{}s", existing_ref.kind.to_lowercase()),
                existing_ref.namespace.is_some(),
            );
            (gvk, existing_ref.namespace.clone(), existing_ref.name.clone())
        };

        match client.get(&gvk, namespace.as_deref(), &name).await {
            Ok(obj) => {
                current.insert(slot.clone(), obj);
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(current)
}

/// Fetches every composed resource the XR already references, keyed by
/// slot — this is the "observed composed resources" the pipeline's first
/// step is fed, distinct from [`fetch_current`] which looks up counterparts
/// of a set of *desired* slots after the pipeline has run.
pub async fn fetch_observed(client: &KindClient, xr: &Composite) -> Result<BTreeMap<String, DynamicObject>> {
    let mut observed = BTreeMap::new();
    for r in &xr.resource_refs {
        let gvk = Gvk::new(
            r.api_version.split_once('/').map(|(g, _)| g).unwrap_or_default(),
            r.api_version.rsplit('/').next().unwrap_or(&r.api_version),
            r.kind.clone(),
            format!("{}s", r.kind.to_lowercase()),
            r.namespace.is_some(),
        );
        match client.get(&gvk, r.namespace.as_deref(), &r.name).await {
            Ok(obj) => {
                observed.insert(r.slot.clone(), obj);
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(observed)
}

/// Writes the XR's own connection secret (distinct from
/// [`propagate_to_claim`], which copies it onward to a bound claim). A
/// no-op if the XR does not declare `writeConnectionSecretToRef` or the
/// pipeline produced no connection details this reconcile.
pub async fn publish_connection_secret(client: &KindClient, xr: &Composite, details: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let Some(secret_ref) = xr.write_connection_secret_to_ref.as_ref() else {
        return Ok(());
    };
    if details.is_empty() {
        return Ok(());
    }
    let gvk = Gvk::new("", "v1", "Secret", "secrets", true);
    let namespace = secret_ref.namespace.clone().or_else(|| xr.namespace.clone()).unwrap_or_default();
    let mut obj = DynamicObject::new(&secret_ref.name, &KindClient::api_resource(&gvk));
    obj.metadata.namespace = Some(namespace.clone());
    obj.data = serde_json::json!({ "data": encode_secret_data(details) });
    obj.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: xr.api_version.clone(),
            kind: xr.kind.clone(),
            name: xr.name.clone(),
            uid: xr.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
    client.apply(&gvk, Some(&namespace), &secret_ref.name, &obj, false).await?;
    Ok(())
}

fn encode_secret_data(data: &BTreeMap<String, Vec<u8>>) -> serde_json::Value {
    use base64::Engine;
    let map: serde_json::Map<String, serde_json::Value> =
        data.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(v)))).collect();
    serde_json::Value::Object(map)
}

/// Result of applying one reconcile's worth of desired composed state.
pub struct ApplyOutcome {
    pub resource_refs: Vec<ResourceRef>,
    pub applied: BTreeMap<String, DynamicObject>,
    pub composed_gvks: BTreeSet<Gvk>,
}

/// Dry-run-applies every desired slot to obtain `wouldBe`, real-applies only
/// the slots whose diff against `current` is non-trivial, and deletes slots
/// present in `xr.resource_refs` but absent from `desired_composed`. Slots
/// are processed in lexicographic order (deterministic); two slots
/// resolving to the same `(apiVersion, kind, name, namespace)` fail with
/// `DuplicateResource`.
pub async fn apply_desired_state(
    client: &KindClient,
    xr: &Composite,
    desired_composed: &BTreeMap<String, serde_json::Value>,
    current: &BTreeMap<String, DynamicObject>,
) -> Result<ApplyOutcome> {
    let mut resource_refs = Vec::new();
    let mut applied = BTreeMap::new();
    let mut composed_gvks = BTreeSet::new();
    let mut seen_identities: BTreeMap<(String, String, String, Option<String>), String> = BTreeMap::new();

    for (slot, desired) in desired_composed {
        let gvk = gvk_of(desired, xr.namespace.is_some() || desired.pointer("/metadata/namespace").is_some());
        let gvk = &gvk;
        composed_gvks.insert(gvk.clone());

        let name = desired
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| current.get(slot).and_then(|o| o.metadata.name.clone()))
            .unwrap_or_else(|| format!("{}-{}", xr.name, slot));
        let namespace = desired
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| xr.namespace.clone());

        let mut dynamic_obj: DynamicObject = serde_json::from_value(desired.clone())?;
        dynamic_obj.metadata.name = Some(name.clone());
        dynamic_obj.metadata.namespace = namespace.clone();
        dynamic_obj
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("crossplane.io/composition-resource-name".to_string(), slot.clone());
        dynamic_obj
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: xr.api_version.clone(),
                kind: xr.kind.clone(),
                name: xr.name.clone(),
                uid: xr.uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            });

        let identity = (gvk.api_version(), gvk.kind.clone(), name.clone(), namespace.clone());
        if let Some(other_slot) = seen_identities.insert(identity, slot.clone()) {
            return Err(Error::DuplicateResource(format!(
                "slots {other_slot} and {slot} both resolve to {}/{} {name}",
                gvk.api_version(),
                gvk.kind
            )));
        }

        let would_be = client.apply(gvk, namespace.as_deref(), &name, &dynamic_obj, true).await?;

        let needs_write = match current.get(slot) {
            Some(existing) => existing.data != would_be.data,
            None => true,
        };

        let final_obj = if needs_write {
            client.apply(gvk, namespace.as_deref(), &name, &dynamic_obj, false).await?
        } else {
            would_be
        };

        resource_refs.push(ResourceRef {
            slot: slot.clone(),
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            name: name.clone(),
            namespace,
            uid: final_obj.metadata.uid.clone(),
        });
        applied.insert(slot.clone(), final_obj);
    }

    for old_ref in &xr.resource_refs {
        if !desired_composed.contains_key(&old_ref.slot) {
            if xr.resources_delete_policy == ResourceDeletePolicy::Orphan {
                info!(xr = %xr.name, slot = %old_ref.slot, "orphaned removed slot, resourceRefs entry dropped without deleting the object");
                continue;
            }
            let gvk = Gvk::new(
                old_ref.api_version.split_once('/').map(|(g, _)| g).unwrap_or_default(),
                old_ref.api_version.rsplit('/').next().unwrap_or(&old_ref.api_version),
                old_ref.kind.clone(),
                format!("{}s", old_ref.kind.to_lowercase()),
                old_ref.namespace.is_some(),
            );
            let propagation = if xr.resources_delete_policy == ResourceDeletePolicy::ForegroundDelete {
                DeletePropagation::Foreground
            } else {
                DeletePropagation::Background
            };
            client.delete(&gvk, old_ref.namespace.as_deref(), &old_ref.name, propagation).await?;
            info!(xr = %xr.name, slot = %old_ref.slot, "deleted removed slot");
        }
    }

    resource_refs.sort_by(|a, b| a.slot.cmp(&b.slot));
    Ok(ApplyOutcome { resource_refs, applied, composed_gvks })
}

/// Registers watches on every composed GVK seen this reconcile. The Watch
/// GC retires unused ones later.
pub fn update_watches(engine: &Engine, controller_name: &str, composed_gvks: &BTreeSet<Gvk>) -> Result<()> {
    let ids: Vec<WatchId> = composed_gvks
        .iter()
        .map(|gvk| WatchId { kind: WatchKind::ComposedResource, gvk: gvk.clone() })
        .collect();
    engine.start_watches(controller_name, &ids)
}

/// Evaluates readiness for every slot against its `SlotConfig`; the XR is
/// ready iff every configured slot is ready (an unconfigured slot - no entry
/// in `slot_configs` - does not block readiness).
pub fn compute_readiness(applied: &BTreeMap<String, DynamicObject>, slot_configs: &BTreeMap<String, SlotConfig>) -> bool {
    slot_configs.iter().all(|(slot, config)| match applied.get(slot) {
        Some(obj) => config.readiness.is_ready(obj),
        None => false,
    })
}

/// Merges each slot's connection-detail selectors into one map, ready to
/// be propagated to the claim's connection secret if a claim is bound.
pub fn extract_connection_details(applied: &BTreeMap<String, DynamicObject>, slot_configs: &BTreeMap<String, SlotConfig>) -> BTreeMap<String, Vec<u8>> {
    let mut details = BTreeMap::new();
    for (slot, config) in slot_configs {
        let Some(obj) = applied.get(slot) else { continue };
        for (key, path) in &config.connection_details {
            if let Some(value) = path.get(&obj.data) {
                if let Some(s) = value.as_str() {
                    details.insert(key.clone(), s.as_bytes().to_vec());
                }
            }
        }
    }
    details
}

/// Sets `Synced`/`Ready` on `xr` following the status-propagation policy:
/// success sets both True; a failure sets `Synced=False` with a reason
/// identifying the failing phase, leaving `Ready` at its last value.
pub fn record_outcome(xr: &mut Composite, outcome: &Result<bool>) {
    match outcome {
        Ok(ready) => {
            xr.set_condition(crate::types::Condition::new(COND_SYNCED, ConditionStatus::True, "ReconcileSuccess"));
            xr.set_condition(crate::types::Condition::new(
                COND_READY,
                if *ready { ConditionStatus::True } else { ConditionStatus::False },
                if *ready { "Available" } else { "Unavailable" },
            ));
        }
        Err(e) => {
            xr.set_condition(
                crate::types::Condition::new(COND_SYNCED, ConditionStatus::False, e.metric_label()).with_message(e.to_string()),
            );
        }
    }
}

/// Propagates `xr`'s connection secret to a bound claim, if any. A thin
/// wrapper over [`claim::propagate_connection_secret`] kept here since only
/// the composite reconciler knows both the XR and claim context together.
pub async fn propagate_to_claim(
    client: &KindClient,
    xr: &Composite,
    claim_ref: Option<&ObjectRef>,
    claim_uid: &str,
    load_secret: impl Fn(&ObjectRef) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<claim::ConnectionSecret>> + Send>>,
) -> Result<bool> {
    claim::propagate_connection_secret(
        client,
        xr.write_connection_secret_to_ref.as_ref(),
        &xr.uid,
        claim_ref,
        claim_uid,
        load_secret,
    )
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{ObjectRef as OR, PipelineStep};

    fn revision(name: &str, generation: i64) -> CompositionRevision {
        CompositionRevision {
            name: name.into(),
            composition_name: "bucket-composition".into(),
            generation,
            pipeline: vec![PipelineStep { step: "render".into(), function_ref: "function-patch-and-transform".into(), input: None }],
            resources: BTreeMap::new(),
        }
    }

    fn xr() -> Composite {
        Composite {
            api_version: "example.org/v1".into(),
            kind: "XBucket".into(),
            name: "x1".into(),
            namespace: None,
            uid: "xr-uid".into(),
            generation: 1,
            composition_ref: None,
            composition_selector: None,
            resource_refs: Vec::new(),
            conditions: Vec::new(),
            write_connection_secret_to_ref: None,
            claim_ref: None,
            resources_delete_policy: crate::types::ResourceDeletePolicy::Delete,
            spec: serde_json::json!({}),
        }
    }

    #[test]
    fn select_revision_by_direct_ref() {
        let mut x = xr();
        x.composition_ref = Some(OR { api_version: "v1".into(), kind: "Composition".into(), name: "bucket-composition".into(), namespace: None, uid: None });
        let revisions = vec![revision("rev-1", 1), revision("rev-2", 2)];
        let selected = select_revision(&x, &revisions).unwrap();
        assert_eq!(selected.composition_name, "bucket-composition");
    }

    #[test]
    fn select_revision_by_selector_picks_highest_generation() {
        let x = xr();
        let mut revisions = vec![revision("rev-1", 1), revision("rev-2", 3), revision("rev-3", 3)];
        revisions[2].name = "a-rev-3".into();
        let selected = select_revision(&x, &revisions).unwrap();
        assert_eq!(selected.generation, 3);
        assert_eq!(selected.name, "a-rev-3");
    }

    /// A `FunctionRunner` stub that asks for one extra resource on its
    /// first invocation, then renders a desired slot from whatever the
    /// fetcher handed back on the retry.
    struct ExtraResourceStep {
        calls: std::sync::Mutex<u32>,
    }

    impl FunctionRunner for ExtraResourceStep {
        fn run(&self, _step: &PipelineStep, request: FunctionRequest) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FunctionResponse>> + Send + '_>> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                if let Some(matched) = request.extra_resources.get("existing-bucket-policy") {
                    let mut desired_composed = BTreeMap::new();
                    desired_composed.insert("bucket".to_string(), serde_json::json!({"matched": matched.len()}));
                    return Ok(FunctionResponse { desired_xr: None, desired_composed, results: Vec::new(), extra_resources: Vec::new(), ttl: None });
                }
                Ok(FunctionResponse {
                    desired_xr: None,
                    desired_composed: BTreeMap::new(),
                    results: Vec::new(),
                    extra_resources: vec![crate::types::ExtraResourceRequirement {
                        name: "existing-bucket-policy".to_string(),
                        api_version: "iam.example.org/v1".to_string(),
                        kind: "Policy".to_string(),
                        selector: BTreeMap::new(),
                    }],
                    ttl: None,
                })
            })
        }
    }

    struct StubFetcher;

    impl ExtraResourceFetcher for StubFetcher {
        fn fetch(&self, _requirement: &crate::types::ExtraResourceRequirement) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<serde_json::Value>>> + Send + '_>> {
            Box::pin(async { Ok(vec![serde_json::json!({"kind": "Policy", "metadata": {"name": "p1"}})]) })
        }
    }

    #[tokio::test]
    async fn run_pipeline_resolves_extra_resources_before_completing_a_step() {
        let runner = ExtraResourceStep { calls: std::sync::Mutex::new(0) };
        let rev = revision("rev-1", 1);
        let response = run_pipeline(&runner, &StubFetcher, &rev, &serde_json::json!({}), &BTreeMap::new()).await.unwrap();

        assert_eq!(*runner.calls.lock().unwrap(), 2);
        assert_eq!(response.desired_composed.get("bucket").unwrap().get("matched").unwrap(), 1);
    }

    /// A pathological `FunctionRunner` that keeps asking for the same
    /// requirement no matter what the fetcher hands back — exercises the
    /// round cap rather than ever resolving on its own.
    struct AlwaysAsksStep {
        calls: std::sync::Mutex<u32>,
    }

    impl FunctionRunner for AlwaysAsksStep {
        fn run(&self, _step: &PipelineStep, _request: FunctionRequest) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FunctionResponse>> + Send + '_>> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                Ok(FunctionResponse {
                    desired_xr: None,
                    desired_composed: BTreeMap::new(),
                    results: Vec::new(),
                    extra_resources: vec![crate::types::ExtraResourceRequirement {
                        name: "always".to_string(),
                        api_version: "iam.example.org/v1".to_string(),
                        kind: "Policy".to_string(),
                        selector: BTreeMap::new(),
                    }],
                    ttl: None,
                })
            })
        }
    }

    #[tokio::test]
    async fn run_pipeline_caps_extra_resource_rounds_per_step() {
        let runner = AlwaysAsksStep { calls: std::sync::Mutex::new(0) };
        let rev = revision("rev-1", 1);
        run_pipeline(&runner, &StubFetcher, &rev, &serde_json::json!({}), &BTreeMap::new()).await.unwrap();

        // One invocation per round up to the cap, plus the round that observes
        // the cap was hit and stops re-invoking.
        assert_eq!(*runner.calls.lock().unwrap(), MAX_EXTRA_RESOURCE_ROUNDS as u32 + 1);
    }

    #[test]
    fn readiness_requires_every_configured_slot() {
        let mut applied = BTreeMap::new();
        applied.insert(
            "bucket".to_string(),
            serde_json::from_value::<DynamicObject>(serde_json::json!({
                "apiVersion": "s3.example.org/v1", "kind": "Bucket", "metadata": {"name": "b1"}, "status": {"phase": "Ready"}
            }))
            .unwrap(),
        );
        let mut slot_configs = BTreeMap::new();
        slot_configs.insert(
            "bucket".to_string(),
            SlotConfig {
                gvk: Gvk::new("s3.example.org", "v1", "Bucket", "buckets", false),
                readiness: ReadinessCheck::MatchField { path: FieldPath::parse("status.phase").unwrap(), value: serde_json::json!("Ready") },
                connection_details: BTreeMap::new(),
            },
        );
        assert!(compute_readiness(&applied, &slot_configs));

        slot_configs.insert(
            "user".to_string(),
            SlotConfig {
                gvk: Gvk::new("iam.example.org", "v1", "User", "users", false),
                readiness: ReadinessCheck::None,
                connection_details: BTreeMap::new(),
            },
        );
        assert!(!compute_readiness(&applied, &slot_configs));
    }

    // `apply_desired_state` drives the API server through `KindClient`, so
    // these tests stand a mock server up the same way the pack's
    // `tower_test`-backed reconciler tests do: a `tower_test::mock` pair
    // wrapped in a real `kube::Client`, with a task answering requests as
    // they come in. A request `apply_desired_state` makes that nothing
    // answers hangs, which is why every call below runs under a timeout.
    type ApiServerHandle = tower_test::mock::Handle<http::Request<kube::client::Body>, http::Response<kube::client::Body>>;

    fn mock_kind_client() -> (KindClient, ApiServerHandle) {
        let (mock_service, handle) = tower_test::mock::pair::<http::Request<kube::client::Body>, http::Response<kube::client::Body>>();
        (KindClient::new(kube::Client::new(mock_service, "default")), handle)
    }

    fn json_response(body: serde_json::Value) -> http::Response<kube::client::Body> {
        http::Response::builder().body(kube::client::Body::from(serde_json::to_vec(&body).unwrap())).unwrap()
    }

    async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(std::time::Duration::from_secs(1), fut).await.expect("apply_desired_state did not complete: unexpected extra API call?")
    }

    #[tokio::test]
    async fn apply_desired_state_deletes_removed_slot_and_shrinks_resource_refs() {
        let (client, mut handle) = mock_kind_client();
        let mut x = xr();
        x.namespace = Some("default".into());
        x.resource_refs = vec![ResourceRef {
            slot: "orphan".into(),
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "x1-orphan".into(),
            namespace: Some("default".into()),
            uid: Some("cm-uid".into()),
        }];

        let verifier = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("delete not called");
            assert_eq!(request.method(), http::Method::DELETE);
            assert!(request.uri().path().ends_with("/configmaps/x1-orphan"));
            send.send_response(json_response(serde_json::json!({})));
        });

        let outcome = with_timeout(apply_desired_state(&client, &x, &BTreeMap::new(), &BTreeMap::new())).await.unwrap();

        timeout_after_1s(verifier).await;
        assert!(outcome.resource_refs.is_empty(), "resourceRefs should shrink once the slot's resource is deleted");
    }

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.expect("timeout waiting on mock apiserver").expect("verifier task panicked");
    }

    #[tokio::test]
    async fn apply_desired_state_skips_real_apply_when_dry_run_matches_current() {
        let (client, mut handle) = mock_kind_client();
        let x = xr();

        let would_be = serde_json::json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "x1-bucket", "annotations": {"crossplane.io/composition-resource-name": "bucket"}},
            "spec": {"forProvider": {"region": "us-east-1"}},
        });

        let mut current = BTreeMap::new();
        current.insert("bucket".to_string(), serde_json::from_value::<DynamicObject>(would_be.clone()).unwrap());

        let verifier = tokio::spawn({
            let would_be = would_be.clone();
            async move {
                let (request, send) = handle.next_request().await.expect("apply not called");
                assert_eq!(request.method(), http::Method::PATCH);
                assert!(request.uri().query().unwrap_or_default().contains("dryRun"), "first apply must be a dry run");
                send.send_response(json_response(would_be));
            }
        });

        let mut desired_composed = BTreeMap::new();
        desired_composed.insert("bucket".to_string(), serde_json::json!({"apiVersion": "s3.example.org/v1", "kind": "Bucket", "spec": {"forProvider": {"region": "us-east-1"}}}));

        let outcome = with_timeout(apply_desired_state(&client, &x, &desired_composed, &current)).await.unwrap();

        // Only the dry-run request was scripted; a second (real) apply call
        // would hang forever waiting on the mock server, so reaching here
        // proves `needs_write` was false and no write was issued.
        timeout_after_1s(verifier).await;
        assert_eq!(outcome.resource_refs[0].name, "x1-bucket");
        assert_eq!(outcome.applied["bucket"].data, current["bucket"].data);
    }

    #[tokio::test]
    async fn apply_desired_state_rejects_two_slots_resolving_to_the_same_identity() {
        let (client, mut handle) = mock_kind_client();
        let x = xr();

        let would_be = serde_json::json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "shared-bucket", "annotations": {"crossplane.io/composition-resource-name": "bucket-a"}},
            "spec": {},
        });
        let mut current = BTreeMap::new();
        current.insert("bucket-a".to_string(), serde_json::from_value::<DynamicObject>(would_be.clone()).unwrap());

        let verifier = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("apply not called for the first slot");
            assert_eq!(request.method(), http::Method::PATCH);
            send.send_response(json_response(would_be));
        });

        let mut desired_composed = BTreeMap::new();
        desired_composed.insert(
            "bucket-a".to_string(),
            serde_json::json!({"apiVersion": "s3.example.org/v1", "kind": "Bucket", "metadata": {"name": "shared-bucket"}, "spec": {}}),
        );
        desired_composed.insert(
            "bucket-b".to_string(),
            serde_json::json!({"apiVersion": "s3.example.org/v1", "kind": "Bucket", "metadata": {"name": "shared-bucket"}, "spec": {}}),
        );

        let result = with_timeout(apply_desired_state(&client, &x, &desired_composed, &current)).await;

        timeout_after_1s(verifier).await;
        assert!(matches!(result, Err(Error::DuplicateResource(_))), "expected a DuplicateResource error");
    }
}

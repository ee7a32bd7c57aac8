//! Plain Rust views of the entities in the data model.
//!
//! These are deliberately NOT `kube::CustomResource` derives with generated
//! OpenAPI schemas: the wider Crossplane type system, CLI and packaging
//! surface are out of scope, so only the engine's own view of these objects
//! is modeled here. They are constructed from `DynamicObject`/`Unstructured`
//! by the client layer (`crate::client`) and handed to the reconcilers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::GroupVersionKind;
use serde::{Deserialize, Serialize};

/// `(Type, GVK)` — identifies one watch subscription owned by one controller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId {
    pub kind: WatchKind,
    pub gvk: Gvk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchKind {
    CompositeResource,
    ComposedResource,
    CompositionRevision,
    Claim,
}

/// A comparable, hashable stand-in for [`GroupVersionKind`] (which itself
/// does not implement `Hash`/`Ord`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl Gvk {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl From<Gvk> for GroupVersionKind {
    fn from(gvk: Gvk) -> Self {
        GroupVersionKind {
            group: gvk.group,
            version: gvk.version,
            kind: gvk.kind,
        }
    }
}

/// A reference to a composed child, keyed by its slot (the
/// `crossplane.io/composition-resource-name` annotation), not by Kubernetes
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub slot: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

impl ResourceRef {
    /// Equality ignoring slot and UID — used to detect two slots resolving
    /// to the same underlying object (`DuplicateResource`).
    pub fn identity(&self) -> (String, String, String, Option<String>) {
        (
            self.api_version.clone(),
            self.kind.clone(),
            self.name.clone(),
            self.namespace.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub const COND_READY: &str = "Ready";
pub const COND_SYNCED: &str = "Synced";
pub const COND_HEALTHY: &str = "Healthy";
pub const COND_INSTALLED: &str = "Installed";
pub const COND_ACTIVE: &str = "Active";

/// An object reference as used in `ObjectReference`-shaped fields
/// (`compositionRef`, `resourceRef`, `writeConnectionSecretToReference`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePolicy {
    Background,
    Foreground,
}

/// What happens to a composed resource once its slot disappears from the
/// pipeline's desired output, per spec's "a slot that disappears ... causes
/// its resource to be deleted (or abandoned, per the XR's policy)".
/// `Delete`/`ForegroundDelete` pick the deletion's propagation policy;
/// `Orphan` drops the `resourceRefs` entry without issuing a delete call at
/// all, leaving the object behind for an operator to deal with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceDeletePolicy {
    Delete,
    ForegroundDelete,
    Orphan,
}

impl Default for ResourceDeletePolicy {
    fn default() -> Self {
        ResourceDeletePolicy::Delete
    }
}

/// An XR: a cluster- or namespace-scoped object whose spec is opaque to the
/// engine (it only cares about composition selection, resource refs,
/// conditions and the connection secret reference).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Composite {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
    pub generation: i64,
    pub composition_ref: Option<ObjectRef>,
    pub composition_selector: Option<BTreeMap<String, String>>,
    pub resource_refs: Vec<ResourceRef>,
    pub conditions: Vec<Condition>,
    pub write_connection_secret_to_ref: Option<ObjectRef>,
    pub claim_ref: Option<ObjectRef>,
    /// How a removed slot's composed resource is cleaned up; see
    /// [`ResourceDeletePolicy`]. Defaults to `Delete` when the XR's spec
    /// does not set it.
    pub resources_delete_policy: ResourceDeletePolicy,
    /// Opaque spec/status payload, kept as a JSON tree so the pipeline can
    /// round-trip fields it does not itself understand.
    pub spec: serde_json::Value,
}

impl Composite {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status != condition.status || existing.reason != condition.reason {
                *existing = condition;
            }
        } else {
            self.conditions.push(condition);
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.condition(COND_READY),
            Some(Condition { status: ConditionStatus::True, .. })
        )
    }
}

/// A namespaced handle that binds to exactly one Composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_ref: Option<ObjectRef>,
    pub composite_delete_policy: Option<DeletePolicy>,
    pub write_connection_secret_to_ref: Option<ObjectRef>,
    pub conditions: Vec<Condition>,
}

impl Claim {
    /// Whether `proposed` (ignoring UID) already matches `self.resource_ref`.
    pub fn matches_ignoring_uid(&self, proposed: &ObjectRef) -> bool {
        match &self.resource_ref {
            None => false,
            Some(existing) => {
                existing.api_version == proposed.api_version
                    && existing.kind == proposed.kind
                    && existing.name == proposed.name
                    && existing.namespace == proposed.namespace
            }
        }
    }
}

/// Immutable snapshot of a Composition at a given generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionRevision {
    pub name: String,
    pub composition_name: String,
    pub generation: i64,
    pub pipeline: Vec<PipelineStep>,
    /// Per-slot readiness/connection-detail configuration, keyed by slot
    /// name. A slot absent here falls back to [`ReadinessCheckSpec::None`]
    /// and no connection details.
    pub resources: BTreeMap<String, ResourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub step: String,
    pub function_ref: String,
    pub input: Option<serde_json::Value>,
}

/// A slot's readiness check and connection-detail selectors, as carried by
/// a `CompositionRevision`'s `spec.resources[]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub readiness: Option<ReadinessCheckSpec>,
    /// Connection-detail key -> field path string, evaluated against the
    /// slot's applied object.
    pub connection_details: BTreeMap<String, String>,
}

/// The wire form of a readiness check, parsed off a `CompositionRevision`
/// before being turned into `composite::ReadinessCheck` (which holds a
/// parsed `FieldPath` rather than a raw string).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReadinessCheckSpec {
    None,
    MatchCondition { condition_type: String, condition_status: ConditionStatus },
    MatchField { field_path: String, match_value: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationPolicy {
    Manual,
    Automatic,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        ActivationPolicy::Automatic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageType {
    Provider,
    Configuration,
    Function,
}

/// A versioned bundle of declarative objects. Modeled as a tagged variant
/// with three arms plus the shared capability set, to express polymorphism
/// across package kinds without a trait object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub name: String,
    pub uid: String,
    pub package_type: PackageType,
    pub activation_policy: ActivationPolicy,
    pub current_revision: String,
    /// Present for Provider/Function, absent for Configuration.
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevision {
    pub name: String,
    pub uid: String,
    pub package_name: String,
    pub package_uid: String,
    pub package_type: PackageType,
    pub image: String,
    pub desired_state: DesiredState,
    pub digest: Option<String>,
    pub ignore_crossplane_constraints: bool,
    pub crossplane_constraint: Option<String>,
    pub object_refs: Vec<ObjectRef>,
    pub conditions: Vec<Condition>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub finalizers: Vec<String>,
}

impl PackageRevision {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

/// The parsed contents of a package image: exactly one meta object plus zero
/// or more embedded objects.
#[derive(Debug, Clone)]
pub struct ParsedPackage {
    pub meta: serde_json::Value,
    pub objects: Vec<serde_json::Value>,
}

/// `Lock.packages[i]` from the cluster-scoped dependency lockfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub name: String,
    pub package_type: PackageType,
    pub source: String,
    pub version: String,
    pub dependencies: Vec<LockDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDependency {
    pub package: String,
    pub package_type: PackageType,
    pub constraints: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Fatal,
}

/// One result emitted by a composition function.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub severity: Severity,
    pub message: String,
}

/// What a composition-function RPC receives and returns.
#[derive(Debug, Clone)]
pub struct FunctionRequest {
    pub observed_xr: serde_json::Value,
    pub observed_composed: BTreeMap<String, serde_json::Value>,
    pub desired_from_prior_step: BTreeMap<String, serde_json::Value>,
    pub input: Option<serde_json::Value>,
    pub context: serde_json::Value,
    /// Resources fetched in response to a prior round's `requirements.extraResources`,
    /// keyed by requirement name. Empty on a step's first invocation.
    pub extra_resources: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtraResourceRequirement {
    pub name: String,
    pub api_version: String,
    pub kind: String,
    pub selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FunctionResponse {
    pub desired_xr: Option<serde_json::Value>,
    pub desired_composed: BTreeMap<String, serde_json::Value>,
    pub results: Vec<FunctionResult>,
    pub extra_resources: Vec<ExtraResourceRequirement>,
    pub ttl: Option<std::time::Duration>,
}

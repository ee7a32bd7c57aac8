//! Composite Resource Definition parsing: the engine's view of an XRD is
//! reduced to exactly what the dynamic controller lifecycle needs — the
//! composite's `Gvk`, the optional claim's `Gvk`, the default delete policy,
//! and whether the XRD has finished establishing its CRDs.
//!
//! This module is the piece that turns one watched kind (XRD) into
//! `Engine::start`/`Engine::stop` calls for two others (composite, claim),
//! at runtime, as XRDs come and go — a concurrent map from name to running
//! controller rather than a static, compiled-in DAG.

use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::types::{DeletePolicy, Gvk};

/// The engine's reduced view of a `CompositeResourceDefinition`.
pub struct XrdInfo {
    pub name: String,
    pub xr_gvk: Gvk,
    pub claim_gvk: Option<Gvk>,
    pub default_composite_delete_policy: Option<DeletePolicy>,
    pub established: bool,
    pub deleting: bool,
}

impl XrdInfo {
    /// Controller name the engine registers the Composite Reconciler under
    /// for this XRD's kind. Stable across reconciles of the same XRD since
    /// it is derived from the XRD's own name, not its generation.
    pub fn composite_controller_name(&self) -> String {
        format!("composite/{}", self.name)
    }

    /// Controller name for the Claim Binder, only relevant when
    /// `claim_gvk` is `Some`.
    pub fn claim_controller_name(&self) -> String {
        format!("claim/{}", self.name)
    }
}

/// Parses the engine-relevant subset of an XRD's `spec`/`status`.
///
/// `spec.group` + the one `spec.versions[]` entry with `served=true,
/// referenceable=true` + `spec.names.{kind,plural}` give the composite's
/// `Gvk`; `spec.claimNames.{kind,plural}` (if present) gives the claim's.
/// `status.conditions[].type=Established,status=True` gates whether the
/// CRDs are actually installed yet — starting a controller before that
/// would just watch-fail in a retry loop, so callers should check
/// `established` before calling `Engine::start`.
pub fn parse(obj: &DynamicObject) -> Result<XrdInfo> {
    let name = obj.name_any();
    let group = obj
        .data
        .pointer("/spec/group")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Fatal(format!("xrd {name} missing spec.group")))?
        .to_string();

    let version = obj
        .data
        .pointer("/spec/versions")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .find(|v| {
            v.get("served").and_then(|s| s.as_bool()).unwrap_or(false) && v.get("referenceable").and_then(|s| s.as_bool()).unwrap_or(false)
        })
        .or_else(|| obj.data.pointer("/spec/versions/0"))
        .and_then(|v| v.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Fatal(format!("xrd {name} has no servable/referenceable version")))?
        .to_string();

    let kind = obj
        .data
        .pointer("/spec/names/kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Fatal(format!("xrd {name} missing spec.names.kind")))?
        .to_string();
    let plural = obj
        .data
        .pointer("/spec/names/plural")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}s", kind.to_lowercase()));

    let xr_gvk = Gvk::new(group.clone(), version.clone(), kind, plural, false);

    let claim_gvk = match (
        obj.data.pointer("/spec/claimNames/kind").and_then(|v| v.as_str()),
        obj.data.pointer("/spec/claimNames/plural").and_then(|v| v.as_str()),
    ) {
        (Some(claim_kind), plural) => Some(Gvk::new(
            group,
            version,
            claim_kind.to_string(),
            plural.map(str::to_string).unwrap_or_else(|| format!("{}s", claim_kind.to_lowercase())),
            true,
        )),
        _ => None,
    };

    let default_composite_delete_policy = obj
        .data
        .pointer("/spec/defaultCompositeDeletePolicy")
        .and_then(|v| v.as_str())
        .map(|s| match s {
            "Foreground" => DeletePolicy::Foreground,
            _ => DeletePolicy::Background,
        });

    let established = obj
        .data
        .pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .any(|c| c.get("type").and_then(|v| v.as_str()) == Some("Established") && c.get("status").and_then(|v| v.as_str()) == Some("True"));

    Ok(XrdInfo {
        name,
        xr_gvk,
        claim_gvk,
        default_composite_delete_policy,
        established,
        deleting: obj.meta().deletion_timestamp.is_some(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn xrd(spec_extra: serde_json::Value, status: serde_json::Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind {
            group: "apiextensions.crossplane.io".into(),
            version: "v1".into(),
            kind: "CompositeResourceDefinition".into(),
        });
        let mut obj = DynamicObject::new("xbuckets.example.org", &ar);
        let mut spec = json!({
            "group": "example.org",
            "names": {"kind": "XBucket", "plural": "xbuckets"},
            "versions": [{"name": "v1", "served": true, "referenceable": true}],
        });
        if let Some(map) = spec.as_object_mut() {
            if let Some(extra) = spec_extra.as_object() {
                map.extend(extra.clone());
            }
        }
        obj.data = json!({"spec": spec, "status": status});
        obj
    }

    #[test]
    fn parses_composite_gvk_from_servable_version() {
        let info = parse(&xrd(json!({}), json!({}))).unwrap();
        assert_eq!(info.xr_gvk, Gvk::new("example.org", "v1", "XBucket", "xbuckets", false));
        assert!(info.claim_gvk.is_none());
        assert!(!info.established);
    }

    #[test]
    fn parses_claim_gvk_when_claim_names_present() {
        let info = parse(&xrd(json!({"claimNames": {"kind": "Bucket", "plural": "buckets"}}), json!({}))).unwrap();
        assert_eq!(info.claim_gvk, Some(Gvk::new("example.org", "v1", "Bucket", "buckets", true)));
    }

    #[test]
    fn established_condition_gates_readiness() {
        let info = parse(&xrd(json!({}), json!({"conditions": [{"type": "Established", "status": "True"}]}))).unwrap();
        assert!(info.established);
    }

    #[test]
    fn controller_names_are_namespaced_by_xrd_name() {
        let info = parse(&xrd(json!({}), json!({}))).unwrap();
        assert_eq!(info.composite_controller_name(), "composite/xbuckets.example.org");
        assert_eq!(info.claim_controller_name(), "claim/xbuckets.example.org");
    }
}

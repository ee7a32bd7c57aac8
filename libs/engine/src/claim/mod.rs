//! Claim Binder & Connection Propagator.
//!
//! Uses the same owner-UID comparison idiom the package activator and
//! composite reconciler use for their own ownership checks, applied here to
//! the claim-to-composite binding and the connection-secret copy.

use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tracing::info;

use crate::client::KindClient;
use crate::error::{Error, Result};
use crate::types::{Claim, DeletePolicy, ObjectRef};

/// Secrets are plain `core/v1` `Secret` objects; modeled as the subset of
/// fields the propagator reads/writes rather than the full k8s-openapi type,
/// since only `data` and ownership matter here.
#[derive(Debug, Clone)]
pub struct ConnectionSecret {
    pub name: String,
    pub namespace: String,
    pub owner_uid: Option<String>,
    pub data: std::collections::BTreeMap<String, Vec<u8>>,
}

/// Binds `claim` to `proposed` in place. No-ops if already bound to the same
/// composite (ignoring UID); fails with [`Error::BindConflict`] if already
/// bound to a different one.
pub fn bind(claim: &mut Claim, proposed: &ObjectRef) -> Result<bool> {
    if claim.matches_ignoring_uid(proposed) {
        return Ok(false);
    }
    if claim.resource_ref.is_some() {
        return Err(Error::BindConflict(format!(
            "claim {} already bound to {:?}, cannot rebind to {proposed:?}",
            claim.name, claim.resource_ref
        )));
    }
    claim.resource_ref = Some(proposed.clone());
    info!(claim = %claim.name, composite = %proposed.name, "bound claim to composite");
    Ok(true)
}

/// Fills `claim.composite_delete_policy` from the XRD's
/// `spec.defaultCompositeDeletePolicy` when unset. Returns `true` if a
/// default was applied (the caller emits the `CompositeDeletePolicy` Normal
/// event in that case).
pub fn apply_default_delete_policy(claim: &mut Claim, xrd_default: Option<DeletePolicy>) -> bool {
    if claim.composite_delete_policy.is_some() {
        return false;
    }
    claim.composite_delete_policy = xrd_default;
    xrd_default.is_some()
}

/// Copies `from`'s connection secret to `to`'s, if both declare one and the
/// source secret is legitimately owned by `from`.
///
/// Returns `Ok(false)` if either side declines to publish a secret (nothing
/// to do), `Ok(true)` if a write happened, and `Err(SecretConflict)` if
/// `from`'s secret's controlling owner does not match `from_uid`.
pub async fn propagate_connection_secret(
    client: &KindClient,
    from_ref: Option<&ObjectRef>,
    from_uid: &str,
    to_ref: Option<&ObjectRef>,
    to_uid: &str,
    load_secret: impl Fn(&ObjectRef) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ConnectionSecret>> + Send>>,
) -> Result<bool> {
    let (Some(from_ref), Some(to_ref)) = (from_ref, to_ref) else {
        return Ok(false);
    };

    let source = load_secret(from_ref).await?;
    if source.owner_uid.as_deref() != Some(from_uid) {
        return Err(Error::SecretConflict(format!(
            "source secret {}/{} is not controlled by {from_uid}",
            source.namespace, source.name
        )));
    }

    let destination = load_secret(to_ref).await.ok();
    if let Some(existing) = &destination {
        if existing.owner_uid.as_deref() != Some(to_uid) {
            return Err(Error::SecretConflict(format!(
                "destination secret {}/{} is not controlled by {to_uid}",
                existing.namespace, existing.name
            )));
        }
        if existing.data == source.data {
            return Ok(false);
        }
    }

    let gvk = crate::types::Gvk::new("", "v1", "Secret", "secrets", true);
    let mut obj = kube::api::DynamicObject::new(&to_ref.name, &KindClient::api_resource(&gvk));
    obj.data = serde_json::json!({
        "data": encode_secret_data(&source.data),
    });
    obj.metadata.namespace = Some(to_ref.namespace.clone().unwrap_or_default());
    obj.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: to_ref.api_version.clone(),
            kind: to_ref.kind.clone(),
            name: to_ref.name.clone(),
            uid: to_uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });

    client
        .apply(&gvk, Some(&to_ref.namespace.clone().unwrap_or_default()), &to_ref.name, &obj, false)
        .await?;
    Ok(true)
}

/// Builds a [`Claim`] from its `DynamicObject` wire form.
pub fn from_dynamic(obj: &DynamicObject) -> Result<Claim> {
    let types = obj.types.as_ref().ok_or_else(|| Error::Fatal("claim object missing apiVersion/kind".to_string()))?;

    let resource_ref = obj.data.pointer("/spec/resourceRef").cloned().map(serde_json::from_value).transpose()?;
    let composite_delete_policy = obj
        .data
        .pointer("/spec/compositeDeletePolicy")
        .and_then(|v| v.as_str())
        .map(|s| match s {
            "Foreground" => DeletePolicy::Foreground,
            _ => DeletePolicy::Background,
        });
    let write_connection_secret_to_ref = obj
        .data
        .pointer("/spec/writeConnectionSecretToRef/name")
        .and_then(|v| v.as_str())
        .map(|name| ObjectRef {
            api_version: String::new(),
            kind: "Secret".to_string(),
            name: name.to_string(),
            namespace: obj.namespace(),
            uid: None,
        });
    let conditions = obj
        .data
        .pointer("/status/conditions")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(Claim {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: obj.name_any(),
        namespace: obj.namespace().unwrap_or_default(),
        uid: obj.uid().unwrap_or_default(),
        resource_ref,
        composite_delete_policy,
        write_connection_secret_to_ref,
        conditions,
    })
}

/// Builds the status patch written back after binding: `spec.resourceRef`
/// (once set, never a different composite — see [`bind`]),
/// `spec.compositeDeletePolicy`, and `status.conditions`.
pub fn patch(gvk: &crate::types::Gvk, claim: &Claim) -> DynamicObject {
    let mut obj = DynamicObject::new(&claim.name, &KindClient::api_resource(gvk));
    obj.metadata.namespace = Some(claim.namespace.clone());
    obj.data = serde_json::json!({
        "spec": {
            "resourceRef": claim.resource_ref,
            "compositeDeletePolicy": claim.composite_delete_policy,
        },
        "status": {
            "conditions": claim.conditions,
        }
    });
    obj
}

fn encode_secret_data(data: &std::collections::BTreeMap<String, Vec<u8>>) -> serde_json::Value {
    use base64::Engine;
    let map: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(v))))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod test {
    use super::*;

    fn obj_ref(name: &str) -> ObjectRef {
        ObjectRef {
            api_version: "example.org/v1".into(),
            kind: "XBucket".into(),
            name: name.into(),
            namespace: None,
            uid: Some(format!("{name}-uid")),
        }
    }

    fn claim() -> Claim {
        Claim {
            api_version: "example.org/v1".into(),
            kind: "Bucket".into(),
            name: "my-bucket".into(),
            namespace: "default".into(),
            uid: "claim-uid".into(),
            resource_ref: None,
            composite_delete_policy: None,
            write_connection_secret_to_ref: None,
            conditions: Vec::new(),
        }
    }

    #[test]
    fn bind_sets_resource_ref_when_unbound() {
        let mut c = claim();
        let proposed = obj_ref("xbucket-abc");
        assert!(bind(&mut c, &proposed).unwrap());
        assert_eq!(c.resource_ref, Some(proposed));
    }

    #[test]
    fn bind_is_noop_when_already_bound_to_same_composite() {
        let mut c = claim();
        let proposed = obj_ref("xbucket-abc");
        c.resource_ref = Some(ObjectRef { uid: Some("different-uid".into()), ..proposed.clone() });
        assert!(!bind(&mut c, &proposed).unwrap());
    }

    #[test]
    fn bind_conflicts_on_rebind_to_different_composite() {
        let mut c = claim();
        c.resource_ref = Some(obj_ref("xbucket-abc"));
        let err = bind(&mut c, &obj_ref("xbucket-def")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BindConflict);
    }

    #[test]
    fn default_delete_policy_applied_only_when_unset() {
        let mut c = claim();
        assert!(apply_default_delete_policy(&mut c, Some(DeletePolicy::Foreground)));
        assert_eq!(c.composite_delete_policy, Some(DeletePolicy::Foreground));
        assert!(!apply_default_delete_policy(&mut c, Some(DeletePolicy::Background)));
        assert_eq!(c.composite_delete_policy, Some(DeletePolicy::Foreground));
    }
}

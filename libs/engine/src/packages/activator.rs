//! Revision Activator: enforces at most one active revision per package.
//!
//! Implemented once here rather than duplicated per call site, on the
//! assumption that any duplication elsewhere would be an artifact of
//! package layout rather than a semantic requirement — see `DESIGN.md` for
//! the recorded decision.

use tracing::info;

use crate::client::KindClient;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{ActivationPolicy, DesiredState, Package, PackageRevision};

/// Applies `P`'s activation policy against its revisions `R`.
///
/// Under `Manual`, returns `R` unchanged. Under `Automatic` (the default),
/// every revision other than `P.currentRevision` is set `Inactive` and
/// applied FIRST; only once every inactive write has succeeded is the
/// current revision set `Active` and applied. This ordering — inactive
/// before active — is required so that a crash between the two phases never
/// leaves the store with two Active revisions, only zero or one.
pub async fn activate_revisions(
    client: &KindClient,
    apply_revision: impl Fn(&KindClient, &PackageRevision, DesiredState) -> BoxApply<'_>,
    package: &Package,
    revisions: &mut [PackageRevision],
) -> Result<()> {
    if package.activation_policy == ActivationPolicy::Manual {
        return Ok(());
    }

    let current_idx = revisions
        .iter()
        .position(|r| r.name == package.current_revision)
        .ok_or_else(|| Error::NotFound(package.current_revision.clone()))?;

    for (idx, revision) in revisions.iter_mut().enumerate() {
        if idx == current_idx {
            continue;
        }
        if revision.desired_state == DesiredState::Inactive {
            continue;
        }
        KindClient::must_be_controllable_by_uid(&revision.package_uid, &package.uid)?;
        apply_revision(client, revision, DesiredState::Inactive)
            .await
            .map_err(|e| reclassify(e, Phase::Deactivate))?;
        revision.desired_state = DesiredState::Inactive;
        info!(package = %package.name, revision = %revision.name, "deactivated revision");
    }

    let current = &mut revisions[current_idx];
    if current.desired_state != DesiredState::Active {
        apply_revision(client, current, DesiredState::Active)
            .await
            .map_err(|e| reclassify(e, Phase::Activate))?;
        current.desired_state = DesiredState::Active;
        info!(package = %package.name, revision = %current.name, "activated revision");
    }

    Ok(())
}

pub type BoxApply<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

enum Phase {
    Deactivate,
    Activate,
}

/// Surfaces errors from apply with a distinguishable kind per phase, so a
/// failure during deactivation is never confused with one during
/// activation.
fn reclassify(e: Error, phase: Phase) -> Error {
    match (phase, e.kind()) {
        (Phase::Deactivate, ErrorKind::Transient) => Error::Transient(format!("deactivate failed: {e}")),
        (Phase::Activate, ErrorKind::Transient) => Error::Transient(format!("activate failed: {e}")),
        _ => e,
    }
}

impl KindClient {
    /// Thin convenience wrapper so the activator can check ownership
    /// without round-tripping through a `DynamicObject`.
    fn must_be_controllable_by_uid(owner_uid_on_object: &str, expected_owner_uid: &str) -> Result<()> {
        if owner_uid_on_object == expected_owner_uid {
            Ok(())
        } else {
            Err(Error::SecretConflict(format!(
                "revision is controlled by package {owner_uid_on_object} not {expected_owner_uid}"
            )))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_client() -> kube::Client {
        let (mock_service, _handle) = tower_test::mock::pair::<http::Request<kube::client::Body>, http::Response<kube::client::Body>>();
        kube::Client::new(mock_service, "default")
    }

    fn package(current: &str) -> Package {
        Package {
            name: "provider-demo".into(),
            uid: "pkg-uid".into(),
            package_type: crate::types::PackageType::Provider,
            activation_policy: ActivationPolicy::Automatic,
            current_revision: current.into(),
            image: Some("demo/provider:v1".into()),
        }
    }

    fn revision(name: &str, state: DesiredState) -> PackageRevision {
        PackageRevision {
            name: name.into(),
            uid: format!("{name}-uid"),
            package_name: "provider-demo".into(),
            package_uid: "pkg-uid".into(),
            package_type: crate::types::PackageType::Provider,
            image: "demo/provider:v1".into(),
            desired_state: state,
            digest: None,
            ignore_crossplane_constraints: false,
            crossplane_constraint: None,
            object_refs: Vec::new(),
            conditions: Vec::new(),
            deletion_timestamp: None,
            finalizers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn manual_policy_leaves_revisions_unchanged() {
        let package = Package {
            activation_policy: ActivationPolicy::Manual,
            ..package("p-2")
        };
        let mut revisions = vec![revision("p-1", DesiredState::Active), revision("p-2", DesiredState::Inactive)];
        let client = KindClient::new(test_client());
        activate_revisions(&client, |_, _, _| Box::pin(async { Ok(()) }), &package, &mut revisions)
            .await
            .unwrap();
        assert_eq!(revisions[0].desired_state, DesiredState::Active);
        assert_eq!(revisions[1].desired_state, DesiredState::Inactive);
    }

    #[tokio::test]
    async fn automatic_policy_deactivates_before_activating() {
        let package = package("p-2");
        let mut revisions = vec![revision("p-1", DesiredState::Active), revision("p-2", DesiredState::Inactive)];
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let client = KindClient::new(test_client());
        let order_cb = order.clone();
        activate_revisions(
            &client,
            move |_, rev, state| {
                let order = order_cb.clone();
                let name = rev.name.clone();
                Box::pin(async move {
                    order.lock().unwrap().push((name, state));
                    Ok(())
                })
            },
            &package,
            &mut revisions,
        )
        .await
        .unwrap();

        let recorded = order.lock().unwrap();
        assert_eq!(recorded[0], ("p-1".to_string(), DesiredState::Inactive));
        assert_eq!(recorded[1], ("p-2".to_string(), DesiredState::Active));
        assert_eq!(revisions[0].desired_state, DesiredState::Inactive);
        assert_eq!(revisions[1].desired_state, DesiredState::Active);
    }
}

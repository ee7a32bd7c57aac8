//! Leader election gate (SPEC_FULL.md §2), simplified from the pack's
//! `kube-runtime::lease::Elector` (acquire/renew/release over a
//! `coordination.k8s.io/v1` `Lease`) into a polling loop: no watch stream,
//! just a "try to (re)acquire" tick every `retry_period`. Good enough for
//! gating a single engine process; it does not need the pack's
//! watch-driven low-latency handover.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "xrcore-engine-leader";

/// Polls a `Lease` object, trying to become (or stay) its holder. Consumers
/// read current leadership off the `watch::Receiver<bool>` returned by
/// `run`; they do not call into this type directly otherwise.
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    retry_period: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: impl Into<String>, identity: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration,
            retry_period: lease_duration / 3,
        }
    }

    /// Spawns the polling task and returns a channel reporting current
    /// leadership plus the task's `CancellationToken` (cancel to release
    /// promptly instead of waiting for the lease to lapse).
    pub fn run(self) -> (watch::Receiver<bool>, CancellationToken) {
        let (tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        let _ = self.release().await;
                        let _ = tx.send(false);
                        break;
                    }
                    _ = sleep(self.retry_period) => {
                        match self.try_acquire_or_renew().await {
                            Ok(held) => {
                                if held != *tx.borrow() {
                                    info!(lease = %self.lease_name, identity = %self.identity, leader = held, "leadership changed");
                                }
                                let _ = tx.send(held);
                            }
                            Err(e) => {
                                warn!(lease = %self.lease_name, error = %e, "lease acquire/renew failed");
                                let _ = tx.send(false);
                            }
                        }
                    }
                }
            }
        });

        (rx, cancel)
    }

    async fn try_acquire_or_renew(&self) -> kube::Result<bool> {
        let now = Utc::now();
        let current = self.api.get_opt(&self.lease_name).await?;

        let (acquire_time, transitions) = match &current {
            Some(lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let held_by_other = spec.holder_identity.as_deref().is_some_and(|h| h != self.identity);
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|t| now.signed_duration_since(t.0).num_seconds() > spec.lease_duration_seconds.unwrap_or(0) as i64)
                    .unwrap_or(true);
                if held_by_other && !expired {
                    debug!(lease = %self.lease_name, "held by another identity, not expired");
                    return Ok(false);
                }
                let transitions = spec.lease_transitions.unwrap_or(0) + if held_by_other { 1 } else { 0 };
                (spec.acquire_time.unwrap_or(MicroTime(now)), transitions)
            }
            None => (MicroTime(now), 0),
        };

        let desired = Lease {
            metadata: kube::api::ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(acquire_time),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        };

        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api.patch(&self.lease_name, &pp, &Patch::Apply(&desired)).await?;
        Ok(true)
    }

    async fn release(&self) -> kube::Result<()> {
        if let Some(lease) = self.api.get_opt(&self.lease_name).await? {
            let held_by_self = lease
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.as_deref())
                .is_some_and(|h| h == self.identity);
            if held_by_self {
                let cleared = Lease {
                    metadata: kube::api::ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec { holder_identity: None, ..lease.spec.unwrap_or_default() }),
                };
                let pp = PatchParams::apply(FIELD_MANAGER).force();
                self.api.patch(&self.lease_name, &pp, &Patch::Apply(&cleared)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_period_is_a_third_of_lease_duration() {
        let lease_duration = Duration::from_secs(15);
        assert_eq!(lease_duration / 3, Duration::from_secs(5));
    }
}

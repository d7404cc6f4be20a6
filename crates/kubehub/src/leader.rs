//! Leader election over a coordination.k8s.io/v1 Lease.
//!
//! Every write carries the lease's resourceVersion; a 409 means someone
//! else moved it first and we are not the leader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("lease {0} has no resourceVersion")]
    MissingVersion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Renew,
    TakeOver { transitions: i32 },
    Wait,
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Decision {
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return Decision::Renew;
    }
    let renewed = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renewed, duration) {
        (Some(t), Some(secs)) => now > t.0 + chrono::Duration::seconds(secs as i64),
        _ => true,
    };
    if expired {
        Decision::TakeOver { transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) }
    } else {
        Decision::Wait
    }
}

pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Wait for leadership. `None` if cancelled first.
    pub async fn acquire(self: Arc<Self>, cancel: &CancellationToken) -> Option<LeaderGuard> {
        info!(identity = %self.identity, lease = %self.lease_name, "leader: waiting for lease");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leader: acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.guard());
                }
                Ok(false) => debug!(identity = %self.identity, "leader: lease held elsewhere"),
                Err(e) => warn!(identity = %self.identity, error = %e, "leader: acquire failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal = tokio::spawn(async move { elector.renewal_loop(lost_tx).await });
        LeaderGuard { elector: Arc::clone(self), renewal, lost_rx }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leader: lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.write(&api, None, now, 0).await,
            Err(e) => return Err(e.into()),
        };
        let rv = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderError::MissingVersion(self.lease_name.clone()))?;
        match decide(existing.spec.as_ref(), &self.identity, now) {
            Decision::Renew => {
                let mut renewed = existing;
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.replace(&api, &renewed).await
            }
            Decision::TakeOver { transitions } => {
                let taken = self.write(&api, Some(rv), now, transitions + 1).await?;
                if taken {
                    info!(identity = %self.identity, transitions = transitions + 1, "leader: took over expired lease");
                }
                Ok(taken)
            }
            Decision::Wait => Ok(false),
        }
    }

    /// Create (no version) or overwrite (with version) the lease in our name.
    async fn write(
        &self,
        api: &Api<Lease>,
        rv: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: rv.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        };
        match rv {
            None => match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            },
            Some(_) => self.replace(api, &lease).await,
        }
    }

    async fn replace(&self, api: &Api<Lease>, lease: &Lease) -> Result<bool, LeaderError> {
        match api.replace(&self.lease_name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    async fn release(&self) -> Result<(), LeaderError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = lease.spec.as_mut() else { return Ok(()) };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        self.replace(&api, &lease).await?;
        self.is_leader.store(false, Ordering::SeqCst);
        info!(identity = %self.identity, "leader: released");
        Ok(())
    }
}

/// Held while leading. Renewal runs in the background until dropped or released.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost_rx: oneshot::Receiver<()>,
}

impl LeaderGuard {
    /// Resolves when renewal fails.
    pub async fn lost(&mut self) {
        let _ = (&mut self.lost_rx).await;
    }

    pub async fn release(self) -> Result<(), LeaderError> {
        self.renewal.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

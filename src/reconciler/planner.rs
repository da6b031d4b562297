use crate::network::subnet::{self, NetworkClaim, SubnetPlan};
use crate::reconciler::error::{ReconcileError, ReconcileResult};
use crate::store::TenantStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Pending = Arc<Mutex<HashMap<String, NetworkClaim>>>;

/// Serializes subnet decisions across concurrent configures.
///
/// A block stays claimed from the moment it is picked until the returned
/// reservation is dropped, which the reconciler does only after the tenant
/// record is persisted or the attempt has been rolled back.
pub struct SubnetPlanner {
    store: Arc<dyn TenantStore>,
    alloc_lock: tokio::sync::Mutex<()>,
    pending: Pending,
}

/// A planned subnet held against other allocations
pub struct SubnetReservation {
    plan: SubnetPlan,
    tenant_id: String,
    pending: Pending,
}

impl SubnetReservation {
    pub fn plan(&self) -> &SubnetPlan {
        &self.plan
    }
}

impl Drop for SubnetReservation {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.tenant_id);
    }
}

impl SubnetPlanner {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self {
            store,
            alloc_lock: tokio::sync::Mutex::new(()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claims held by stored records plus in-flight reservations
    async fn claims(&self) -> ReconcileResult<Vec<NetworkClaim>> {
        let mut claims = self.store.list_network_claims().await?;
        claims.extend(self.pending.lock().values().cloned());
        Ok(claims)
    }

    /// Lowest free pool block right now, without reserving it
    pub async fn next_free(&self) -> ReconcileResult<String> {
        let _guard = self.alloc_lock.lock().await;
        let subnets: Vec<String> = self.claims().await?.into_iter().map(|c| c.subnet).collect();
        Ok(subnet::allocate(&subnets)?)
    }

    /// Pick (or take the requested) subnet, validate it and hold it for `tenant_id`
    pub async fn reserve(
        &self,
        tenant_id: &str,
        requested: Option<&str>,
    ) -> ReconcileResult<SubnetReservation> {
        let _guard = self.alloc_lock.lock().await;

        if self.pending.lock().contains_key(tenant_id) {
            return Err(ReconcileError::validation(format!(
                "a network for {} is already being configured",
                tenant_id
            )));
        }

        let claims: Vec<NetworkClaim> = self
            .claims()
            .await?
            .into_iter()
            .filter(|c| c.tenant_id != tenant_id)
            .collect();

        let cidr = match requested {
            Some(cidr) => cidr.trim().to_string(),
            None => {
                let taken: Vec<String> = claims.iter().map(|c| c.subnet.clone()).collect();
                subnet::allocate(&taken)?
            }
        };

        let plan = subnet::parse_subnet(&cidr, tenant_id)?;
        subnet::validate(&plan, tenant_id, &claims)?;

        self.pending.lock().insert(
            tenant_id.to_string(),
            NetworkClaim {
                tenant_id: tenant_id.to_string(),
                subnet: plan.subnet.clone(),
                bridge_name: Some(plan.bridge_name.clone()),
            },
        );
        tracing::debug!("Reserved {} ({}) for {}", plan.subnet, plan.bridge_name, tenant_id);

        Ok(SubnetReservation {
            plan,
            tenant_id: tenant_id.to_string(),
            pending: self.pending.clone(),
        })
    }

    /// Reservations handed out whose configure has not finished yet
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

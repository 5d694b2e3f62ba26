//! Instance lifecycle service
//!
//! Create, delete, read-with-refresh, and activity touch for instances, plus
//! the admission checks that gate creation. Admission and creation run under
//! a per-user lock so two concurrent creates by the same user cannot both
//! slip past the per-user quotas; the global count may transiently overshoot
//! across distinct users, with the cluster's own admission as the final
//! authority.

use crate::catalog::{Catalog, InstanceType};
use crate::config::Config;
use crate::error::Error;
use crate::instance::{pod_name_for, Instance, InstanceRegistry, InstanceStatus, User};
use crate::kubernetes::Orchestrator;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Admission limits, copied out of the configuration at startup
#[derive(Debug, Clone, Copy)]
pub struct Quotas {
    pub max_pod_count: usize,
    pub max_instances_per_user: usize,
    pub max_instances_per_user_per_type: usize,
    pub persistence_enabled: bool,
}

impl From<&Config> for Quotas {
    fn from(config: &Config) -> Self {
        Self {
            max_pod_count: config.max_pod_count,
            max_instances_per_user: config.max_instances_per_user,
            max_instances_per_user_per_type: config.max_instances_per_user_per_type,
            persistence_enabled: config.enable_persistence,
        }
    }
}

/// Owns instance creation and retirement on behalf of request handlers
pub struct InstanceService {
    registry: Arc<InstanceRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    catalog: Arc<Catalog>,
    quotas: Quotas,
    /// One create at a time per user
    create_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceService {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        catalog: Arc<Catalog>,
        quotas: Quotas,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            catalog,
            quotas,
            create_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Quota and catalog checks, in order. Counts are advisory snapshots;
    /// the caller holds the per-user create lock.
    fn admit<'a>(
        &'a self,
        user: &User,
        type_id: &str,
        persistent: bool,
    ) -> Result<&'a InstanceType, Error> {
        if persistent && !self.quotas.persistence_enabled {
            return Err(Error::PersistenceDisabled);
        }
        if self.registry.count() >= self.quotas.max_pod_count {
            return Err(Error::GlobalQuotaExceeded);
        }
        if self.registry.count_by_user(&user.id) >= self.quotas.max_instances_per_user {
            return Err(Error::UserQuotaExceeded);
        }
        if self.registry.count_by_user_and_type(&user.id, type_id)
            >= self.quotas.max_instances_per_user_per_type
        {
            return Err(Error::TypeQuotaExceeded);
        }
        self.catalog
            .get(type_id)
            .ok_or_else(|| Error::UnknownType(type_id.to_string()))
    }

    /// Create an instance for the user. On orchestrator failure nothing is
    /// registered; a partially-created pod is adopted or cleaned up by the
    /// next reconcile pass.
    pub async fn create_instance(
        &self,
        user: &User,
        type_id: &str,
        persistent: bool,
    ) -> Result<Instance, Error> {
        let lock = self
            .create_locks
            .entry(user.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let instance_type = self.admit(user, type_id, persistent)?;

        let instance_id = Uuid::new_v4().to_string();
        let instance = Instance {
            pod_name: pod_name_for(&instance_id),
            instance_id,
            user_id: user.id.clone(),
            type_id: type_id.to_string(),
            display_name: instance_type.display_name.clone(),
            pod_ip: None,
            persistent,
            status: InstanceStatus::Pending,
            last_active_at: Instant::now(),
        };

        self.orchestrator
            .create_instance_pod(&instance, &instance_type.template)
            .await?;

        self.registry.save(instance.clone());
        info!(
            instance_id = %instance.instance_id,
            user = %user.id,
            instance_type = %type_id,
            persistent,
            "Created instance"
        );
        Ok(instance)
    }

    /// Delete the user's instance. An absent id and a foreign owner are both
    /// reported as not-found so ownership is never revealed; in the foreign
    /// case the orchestrator is not contacted.
    pub async fn delete_instance(&self, user: &User, instance_id: &str) -> Result<(), Error> {
        let instance = self.registry.find_by_id(instance_id).ok_or(Error::NotFound)?;
        if instance.user_id != user.id {
            return Err(Error::NotFound);
        }

        self.orchestrator.delete_pod(&instance.pod_name).await?;
        self.registry.delete(instance_id);
        info!(instance_id = %instance_id, user = %user.id, "Deleted instance");
        Ok(())
    }

    /// Current record for an instance. Reading through the gateway counts as
    /// activity, so the timestamp is refreshed.
    pub fn get_instance(&self, instance_id: &str) -> Option<Instance> {
        let instance = self.registry.find_by_id(instance_id)?;
        self.registry.touch(instance_id);
        Some(instance)
    }

    /// O(1), non-blocking activity refresh. Unknown ids are a no-op.
    pub fn touch_activity(&self, instance_id: &str) {
        self.registry.touch(instance_id);
    }

    pub fn list_instances(&self, user_id: &str) -> Vec<Instance> {
        self.registry.find_by_user(user_id)
    }
}

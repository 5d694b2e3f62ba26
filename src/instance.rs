//! Instance model and in-memory registry
//!
//! The registry is the only mutable shared state in the gateway. It owns the
//! instance records; callers receive clones and mutate only through registry
//! operations. It is rebuilt from the cluster by the reconciler after a
//! restart, so nothing here is persisted.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Prefix for pod names derived from instance ids
pub const POD_NAME_PREFIX: &str = "hakoniwa-";

/// Derive the backing pod name for an instance id
pub fn pod_name_for(instance_id: &str) -> String {
    format!("{}{}", POD_NAME_PREFIX, instance_id)
}

/// How the user authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKind {
    Anonymous,
    Oidc,
}

impl UserKind {
    /// Wire string used in session claims and API responses
    pub fn as_str(&self) -> &'static str {
        match self {
            UserKind::Anonymous => "anonymous",
            UserKind::Oidc => "openid_connect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anonymous" => Some(UserKind::Anonymous),
            "openid_connect" => Some(UserKind::Oidc),
            _ => None,
        }
    }
}

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Opaque across auth methods: `anon-<uuid>` or `oidc:<subject>`
    pub id: String,
    pub kind: UserKind,
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Created, backend pod not yet ready
    Pending,
    /// Backend pod is ready and has an IP
    Running,
    /// Backend pod is being deleted or has finished
    Terminating,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Terminating => write!(f, "terminating"),
        }
    }
}

/// A logical workspace owned by one user, backed by one pod
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub user_id: String,
    pub type_id: String,
    pub display_name: String,
    pub pod_name: String,
    pub pod_ip: Option<String>,
    pub persistent: bool,
    pub status: InstanceStatus,
    pub last_active_at: Instant,
}

/// Thread-safe registry of live instances, keyed by instance id
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an instance by id
    pub fn save(&self, instance: Instance) {
        self.instances.insert(instance.instance_id.clone(), instance);
    }

    pub fn find_by_id(&self, instance_id: &str) -> Option<Instance> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub fn find_by_user(&self, user_id: &str) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove an instance. Deleting an absent id is a no-op.
    pub fn delete(&self, instance_id: &str) {
        self.instances.remove(instance_id);
    }

    /// Instances whose last activity is older than the threshold
    pub fn list_inactive(&self, threshold: Duration) -> Vec<Instance> {
        let now = Instant::now();
        self.instances
            .iter()
            .filter(|e| now.duration_since(e.value().last_active_at) > threshold)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_all(&self) -> Vec<Instance> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }

    pub fn count_by_user(&self, user_id: &str) -> usize {
        self.instances
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .count()
    }

    pub fn count_by_user_and_type(&self, user_id: &str, type_id: &str) -> usize {
        self.instances
            .iter()
            .filter(|e| e.value().user_id == user_id && e.value().type_id == type_id)
            .count()
    }

    /// Refresh the activity timestamp. Unknown ids are a no-op.
    pub fn touch(&self, instance_id: &str) {
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            entry.last_active_at = Instant::now();
        }
    }

    /// Overwrite the observed status and pod IP, preserving `last_active_at`.
    /// The registry stays the authority for liveness.
    pub fn refresh_status(&self, instance_id: &str, status: InstanceStatus, pod_ip: Option<String>) {
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            entry.status = status;
            entry.pod_ip = pod_ip;
        }
    }
}

#[cfg(test)]
pub(crate) fn test_instance(instance_id: &str, user_id: &str, type_id: &str) -> Instance {
    Instance {
        instance_id: instance_id.to_string(),
        user_id: user_id.to_string(),
        type_id: type_id.to_string(),
        display_name: "Test Workspace".to_string(),
        pod_name: pod_name_for(instance_id),
        pod_ip: None,
        persistent: false,
        status: InstanceStatus::Pending,
        last_active_at: Instant::now(),
    }
}

//! Kubernetes orchestrator adapter
//!
//! Everything the gateway asks of the cluster goes through the
//! [`Orchestrator`] trait so the lifecycle service, reconciler, and cleaner
//! can be exercised against a fake. The real implementation drives pods and
//! persistent volume claims in a single namespace via `kube`.

use crate::catalog::ANNOTATION_PREFIX;
use crate::config::Config;
use crate::instance::{Instance, InstanceStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Pod, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

/// Label marking pods and claims as gateway-managed
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label and annotation value identifying this gateway
pub const MANAGED_BY_VALUE: &str = "hakoniwa";

const VOLUME_NAME: &str = "persistent-storage";
const DEFAULT_VOLUME_SIZE: &str = "10Gi";
const DEFAULT_VOLUME_PATH: &str = "/config";

/// Contract with the cluster. Absent pods are reported as `Terminating` by
/// `get_pod_status` and as success by `delete_pod`.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create the backing pod for an instance (and its claim when persistent).
    async fn create_instance_pod(&self, instance: &Instance, template: &[u8]) -> Result<()>;

    /// Observe a single pod's status and IP.
    async fn get_pod_status(&self, pod_name: &str) -> Result<(InstanceStatus, Option<String>)>;

    /// List all managed pods as reconstructed instances, skipping pods that
    /// are deleting or have reached a terminal phase.
    async fn list_instance_pods(&self) -> Result<Vec<Instance>>;

    /// Delete a pod. Not-found is success.
    async fn delete_pod(&self, pod_name: &str) -> Result<()>;
}

/// Orchestrator backed by a real Kubernetes cluster
pub struct KubernetesOrchestrator {
    client: kube::Client,
    namespace: String,
}

impl KubernetesOrchestrator {
    /// Build a client from KUBECONFIG, falling back to in-cluster config.
    pub async fn new(config: &Config) -> Result<Self> {
        let client = if config.kubeconfig.is_empty() {
            kube::Client::try_default()
                .await
                .context("failed to create Kubernetes client")?
        } else {
            let kubeconfig = kube::config::Kubeconfig::read_from(&config.kubeconfig)
                .with_context(|| format!("failed to read kubeconfig {}", config.kubeconfig))?;
            let client_config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("failed to build config from kubeconfig")?;
            kube::Client::try_from(client_config).context("failed to create Kubernetes client")?
        };

        Ok(Self {
            client,
            namespace: config.kubernetes_namespace.clone(),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create the claim if it does not exist. "Already exists" is success:
    /// a concurrent create or an earlier instance may own the same claim.
    async fn ensure_pvc(&self, instance: &Instance, volume: &VolumeSettings) -> Result<()> {
        let pvcs = self.pvcs();

        match pvcs.get(&volume.claim_name).await {
            Ok(_) => {
                info!(pvc = %volume.claim_name, user = %instance.user_id, "Reusing existing persistent volume claim");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e).context("failed to check claim existence"),
        }

        let pvc = build_pvc(instance, volume);
        match pvcs.create(&PostParams::default(), &pvc).await {
            Ok(_) => {
                info!(pvc = %volume.claim_name, user = %instance.user_id, "Created persistent volume claim");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(pvc = %volume.claim_name, user = %instance.user_id, "Persistent volume claim already exists, reusing");
                Ok(())
            }
            Err(e) => Err(e).context("failed to create persistent volume claim"),
        }
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn create_instance_pod(&self, instance: &Instance, template: &[u8]) -> Result<()> {
        let volume = if instance.persistent {
            Some(volume_settings(instance, template)?)
        } else {
            None
        };

        if let Some(v) = &volume {
            self.ensure_pvc(instance, v).await?;
        }

        let pod = prepare_pod(instance, template, volume.as_ref())?;
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .context("failed to create pod")?;

        info!(
            pod = %instance.pod_name,
            user = %instance.user_id,
            instance_type = %instance.type_id,
            "Created instance pod"
        );
        Ok(())
    }

    async fn get_pod_status(&self, pod_name: &str) -> Result<(InstanceStatus, Option<String>)> {
        let pod = match self.pods().get(pod_name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Ok((InstanceStatus::Terminating, None));
            }
            Err(e) => return Err(e).context("failed to get pod"),
        };

        Ok(observe_pod(&pod))
    }

    async fn list_instance_pods(&self) -> Result<Vec<Instance>> {
        let params =
            ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE));
        let pods = self
            .pods()
            .list(&params)
            .await
            .context("failed to list pods")?;

        let mut instances = Vec::new();
        for pod in pods.items {
            if is_terminal(&pod) {
                continue;
            }
            if let Some(instance) = instance_from_pod(&pod) {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        match self.pods().delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %pod_name, "Deleted instance pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).context("failed to delete pod"),
        }
    }
}

/// Resolved persistent-volume parameters for one instance
struct VolumeSettings {
    claim_name: String,
    size: String,
    path: String,
    storage_class: Option<String>,
}

/// Read the volume annotations from the pod template and derive the claim
/// name for this user and type.
fn volume_settings(instance: &Instance, template: &[u8]) -> Result<VolumeSettings> {
    let pod: Pod = serde_yaml::from_slice(template).context("failed to decode pod template")?;
    let annotations = pod.metadata.annotations.unwrap_or_default();

    let annotation = |key: &str| -> Option<String> {
        annotations
            .get(&format!("{}{}", ANNOTATION_PREFIX, key))
            .cloned()
    };

    Ok(VolumeSettings {
        claim_name: pvc_name_for(&instance.user_id, &instance.type_id),
        size: annotation("volume-size").unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()),
        path: annotation("volume-path").unwrap_or_else(|| DEFAULT_VOLUME_PATH.to_string()),
        storage_class: annotation("volume-storage-class").filter(|v| !v.is_empty()),
    })
}

fn build_pvc(instance: &Instance, volume: &VolumeSettings) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(
        format!("{}user-id", ANNOTATION_PREFIX),
        sanitize_user_id(&instance.user_id),
    );
    labels.insert(
        format!("{}instance-type", ANNOTATION_PREFIX),
        instance.type_id.clone(),
    );

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(volume.size.clone()));

    PersistentVolumeClaim {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(volume.claim_name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            storage_class_name: volume.storage_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Decorate the template into the concrete pod for this instance: name,
/// labels, annotations, injected env vars, and the volume mount when present.
fn prepare_pod(instance: &Instance, template: &[u8], volume: Option<&VolumeSettings>) -> Result<Pod> {
    let mut pod: Pod = serde_yaml::from_slice(template).context("failed to decode pod template")?;

    pod.metadata.name = Some(instance.pod_name.clone());

    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(
        format!("{}user-id", ANNOTATION_PREFIX),
        sanitize_user_id(&instance.user_id),
    );

    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(format!("{}user-id", ANNOTATION_PREFIX), instance.user_id.clone());
    annotations.insert(
        format!("{}instance-id", ANNOTATION_PREFIX),
        instance.instance_id.clone(),
    );
    annotations.insert(
        format!("{}instance-type", ANNOTATION_PREFIX),
        instance.type_id.clone(),
    );
    annotations.insert(
        format!("{}display-name", ANNOTATION_PREFIX),
        instance.display_name.clone(),
    );

    let spec = pod
        .spec
        .as_mut()
        .context("pod template has no spec")?;

    if let Some(volume) = volume {
        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume.claim_name.clone(),
                read_only: None,
            }),
            ..Default::default()
        });
        for container in &mut spec.containers {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: VOLUME_NAME.to_string(),
                    mount_path: volume.path.clone(),
                    ..Default::default()
                });
        }
    }

    let env_vars = [
        ("HAKONIWA_INSTANCE_ID", instance.instance_id.as_str()),
        ("HAKONIWA_BASE_URL", "/"),
    ];
    for container in &mut spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in env_vars {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                value_from: None,
            });
        }
    }

    Ok(pod)
}

/// Map an observed pod to an instance status per the phase table:
/// deleting or finished pods are `Terminating`, running-and-ready pods are
/// `Running` with their IP, everything else is `Pending`.
fn observe_pod(pod: &Pod) -> (InstanceStatus, Option<String>) {
    if is_terminal(pod) {
        return (InstanceStatus::Terminating, None);
    }
    if is_pod_ready(pod) {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty());
        return (InstanceStatus::Running, ip);
    }
    (InstanceStatus::Pending, None)
}

fn is_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Reconstruct an instance from a managed pod's annotations. Pods without an
/// instance-id annotation (legacy or foreign) are skipped. Recovered
/// instances start with a fresh activity timestamp so they are not evicted
/// before anyone has a chance to reach them.
fn instance_from_pod(pod: &Pod) -> Option<Instance> {
    let annotations = pod.metadata.annotations.as_ref()?;
    let annotation = |key: &str| -> Option<String> {
        annotations.get(&format!("{}{}", ANNOTATION_PREFIX, key)).cloned()
    };

    let instance_id = annotation("instance-id")?;
    let (status, pod_ip) = observe_pod(pod);

    Some(Instance {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        user_id: annotation("user-id").unwrap_or_default(),
        type_id: annotation("instance-type").unwrap_or_default(),
        display_name: annotation("display-name").unwrap_or_default(),
        pod_ip,
        persistent: false,
        status,
        last_active_at: Instant::now(),
        instance_id,
    })
}

/// Make a user id safe for Kubernetes labels and names (RFC 1123): lowercase
/// alphanumerics and dashes, trimmed, capped so prefixed names stay under
/// the 63-character limit.
pub fn sanitize_user_id(user_id: &str) -> String {
    let mut safe: String = user_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();

    safe = safe.trim_matches('-').to_string();
    if safe.len() > 54 {
        safe.truncate(54);
        safe = safe.trim_end_matches('-').to_string();
    }
    safe
}

/// Deterministic claim name for a (user, type) pair, unique via an 8-char
/// hash of the raw identifiers and capped at the 63-character name limit.
pub fn pvc_name_for(user_id: &str, type_id: &str) -> String {
    let mut user = sanitize_user_id(user_id);
    let mut ty = sanitize_user_id(type_id);
    user.truncate(25);
    ty.truncate(20);

    let digest = Sha256::digest(format!("{}/{}", user_id, type_id).as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();

    format!("pvc-{}-{}-{}", user, ty, hash)
}

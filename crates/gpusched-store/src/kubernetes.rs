//! kube-client implementations of the store capabilities

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Binding, Event, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::Client;
use tracing::debug;

use gpusched_core::{GpuClaim, GpuClaimSpec, GpuNodeStatus, GpuNodeStatusSpec, SchedError, SchedResult};

use crate::traits::{
    ClaimStore, CreateOutcome, DeleteOutcome, EventSink, LeaseRecord, LeaseStore, NodeStatusStore,
    PodPhase, PodRecord, PodStore,
};

/// Map a k8s Lease onto the record the core works with
fn lease_record(lease: Lease) -> Option<LeaseRecord> {
    Some(LeaseRecord {
        name: lease.metadata.name?,
        namespace: lease.metadata.namespace.unwrap_or_default(),
        holder_uid: lease
            .spec
            .and_then(|s| s.holder_identity)
            .unwrap_or_default(),
        labels: lease.metadata.labels.unwrap_or_default(),
        resource_version: lease.metadata.resource_version,
    })
}

fn lease_object(record: &LeaseRecord) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: Some(record.namespace.clone()),
            labels: Some(record.labels.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(record.holder_uid.clone()),
            acquire_time: Some(MicroTime(chrono::Utc::now())),
            ..Default::default()
        }),
    }
}

/// Map a k8s Pod onto the record the core works with
pub fn pod_record(pod: Pod) -> Option<PodRecord> {
    let phase = match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    let spec = pod.spec.unwrap_or_default();
    Some(PodRecord {
        name: pod.metadata.name?,
        namespace: pod.metadata.namespace.unwrap_or_default(),
        uid: pod.metadata.uid.unwrap_or_default(),
        node: spec.node_name,
        scheduler_name: spec.scheduler_name,
        phase,
        annotations: pod.metadata.annotations.unwrap_or_default(),
    })
}

/// Lease storage backed by coordination.k8s.io/v1
#[derive(Clone)]
pub struct KubeLeaseStore {
    client: Client,
}

impl KubeLeaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn create(&self, lease: &LeaseRecord) -> SchedResult<CreateOutcome> {
        let api = self.api(&lease.namespace);
        match api.create(&PostParams::default(), &lease_object(lease)).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Lost the create; report whoever holds the name now
                let existing = api.get_opt(&lease.name).await?.and_then(lease_record);
                match existing {
                    Some(record) => Ok(CreateOutcome::Exists(record)),
                    // Deleted between our create and get; the caller retries
                    None => Err(SchedError::Store(format!(
                        "lease {} vanished during conflict check",
                        lease.name
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<LeaseRecord>> {
        Ok(self.api(namespace).get_opt(name).await?.and_then(lease_record))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> SchedResult<DeleteOutcome> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::Missing),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(DeleteOutcome::Lost),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, selector: &str) -> SchedResult<Vec<LeaseRecord>> {
        let api: Api<Lease> = Api::all(self.client.clone());
        let leases = api.list(&ListParams::default().labels(selector)).await?;
        Ok(leases.items.into_iter().filter_map(lease_record).collect())
    }
}

/// Pod access backed by core/v1
#[derive(Clone)]
pub struct KubePodStore {
    client: Client,
}

impl KubePodStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodStore for KubePodStore {
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<PodRecord>> {
        Ok(self.api(namespace).get_opt(name).await?.and_then(pod_record))
    }

    async fn annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> SchedResult<()> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(pod = name, key = key, "Annotated pod");
        Ok(())
    }

    async fn bind(&self, namespace: &str, name: &str, node: &str) -> SchedResult<()> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };
        let data = serde_json::to_vec(&binding)
            .map_err(|e| SchedError::Serialization(e.to_string()))?;
        self.api(namespace)
            .create_subresource::<serde_json::Value>(
                "binding",
                name,
                &PostParams::default(),
                data,
            )
            .await?;
        debug!(pod = name, node = node, "Bound pod");
        Ok(())
    }
}

/// GpuClaim reads
#[derive(Clone)]
pub struct KubeClaimStore {
    client: Client,
}

impl KubeClaimStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn get(&self, namespace: &str, name: &str) -> SchedResult<Option<GpuClaimSpec>> {
        let api: Api<GpuClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|claim| claim.spec))
    }
}

/// GpuNodeStatus reads
#[derive(Clone)]
pub struct KubeNodeStatusStore {
    api: Api<GpuNodeStatus>,
}

impl KubeNodeStatusStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStatusStore for KubeNodeStatusStore {
    async fn snapshot(&self, node: &str) -> SchedResult<Option<GpuNodeStatusSpec>> {
        Ok(self.api.get_opt(node).await?.map(|status| status.spec))
    }

    async fn node_names(&self) -> SchedResult<Vec<String>> {
        let statuses = self.api.list(&ListParams::default()).await?;
        let mut names: Vec<String> = statuses
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Event output backed by core/v1 Events
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    component: String,
}

impl KubeEventSink {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn pod_event(
        &self,
        pod: &PodRecord,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> SchedResult<()> {
        let now = Time(chrono::Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", pod.name)),
                namespace: Some(pod.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(pod.name.clone()),
                namespace: Some(pod.namespace.clone()),
                uid: Some(pod.uid.clone()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            reporting_component: Some(self.component.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), &pod.namespace);
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

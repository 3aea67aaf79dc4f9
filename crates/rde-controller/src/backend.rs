//! Kubernetes API implementation of the fleet backend

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::crd::{AgentKey, RDEAgent, RDEAgentStatus};
use crate::error::{api_status, ReconcileError};
use crate::workload::{adopt_template, FleetBackend, WorkloadState};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "kuberde-controller";

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    }
}

#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn agents(&self, namespace: &str) -> Api<RDEAgent> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl FleetBackend for KubeBackend {
    async fn get_agent(&self, key: &AgentKey) -> Result<Option<RDEAgent>, ReconcileError> {
        Ok(self.agents(&key.namespace).get_opt(&key.name).await?)
    }

    async fn get_workload(&self, key: &AgentKey) -> Result<Option<WorkloadState>, ReconcileError> {
        let deployment = self.deployments(&key.namespace).get_opt(&key.name).await?;
        Ok(deployment.as_ref().map(WorkloadState::from_deployment))
    }

    async fn create_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError> {
        match self.deployments(&key.namespace).create(&post_params(), workload).await {
            Ok(_) => Ok(()),
            Err(e) if api_status(&e) == Some(409) => {
                debug!(agent = %key, "Workload already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn scale_workload(&self, key: &AgentKey, replicas: i32) -> Result<(), ReconcileError> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments(&key.namespace)
            .patch(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError> {
        let api = self.deployments(&key.namespace);
        let mut current = api
            .get_opt(&key.name)
            .await?
            .ok_or_else(|| ReconcileError::Backend(format!("no workload {}", key)))?;
        adopt_template(&mut current, workload);
        // The fetched resourceVersion rides along; a concurrent write fails with 409 and is retried
        current.status = None;
        api.replace(&key.name, &post_params(), &current).await?;
        Ok(())
    }

    async fn delete_workload(&self, key: &AgentKey) -> Result<(), ReconcileError> {
        match self
            .deployments(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_status(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(&self, key: &AgentKey, status: &RDEAgentStatus) -> Result<(), ReconcileError> {
        let patch = json!({ "status": status });
        self.agents(&key.namespace)
            .patch_status(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

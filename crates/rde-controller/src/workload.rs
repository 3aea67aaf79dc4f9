//! Agent workloads
//!
//! Every `RDEAgent` maps to exactly one `Deployment` of the same name in
//! the same namespace. The pod runs the agent as a sidecar next to the
//! user's workload container; the agent tunnels to the broker and relays
//! to `local_target`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;
use sha2::{Digest, Sha256};

use crate::crd::{AgentKey, RDEAgent, RDEAgentStatus};
use crate::error::ReconcileError;

pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "kuberde-agent";
pub const AGENT_ID_KEY: &str = "kuberde.io/agent-id";
pub const INSTANCE_LABEL: &str = "instance";
/// Annotation holding the hash of the pod template the controller last wrote
pub const TEMPLATE_HASH_KEY: &str = "kuberde.io/template-hash";

/// Settings shared by every workload the controller creates
#[derive(Debug, Clone)]
pub struct WorkloadSettings {
    pub agent_image: String,
    /// Injected as `AUTH_TOKEN_URL`
    pub token_url: String,
}

/// What the controller needs to know about an existing workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadState {
    /// Desired replicas as recorded in the workload spec
    pub replicas: i32,
    pub ready_replicas: i32,
    /// `None` for workloads written before the annotation existed
    pub template_hash: Option<String>,
}

impl WorkloadState {
    pub fn from_deployment(deployment: &Deployment) -> Self {
        Self {
            replicas: deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
                .unwrap_or(1),
            ready_replicas: deployment
                .status
                .as_ref()
                .and_then(|status| status.ready_replicas)
                .unwrap_or(0),
            template_hash: template_hash(deployment).map(str::to_string),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_replicas >= self.replicas
    }
}

/// Storage the controller reconciles against
#[async_trait]
pub trait FleetBackend: Send + Sync {
    async fn get_agent(&self, key: &AgentKey) -> Result<Option<RDEAgent>, ReconcileError>;

    async fn get_workload(&self, key: &AgentKey) -> Result<Option<WorkloadState>, ReconcileError>;

    /// Create the workload; an existing one is left alone
    async fn create_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError>;

    async fn scale_workload(&self, key: &AgentKey, replicas: i32) -> Result<(), ReconcileError>;

    /// Replace the pod template, labels and annotations of an existing
    /// workload with those of `workload`; the current replica count is kept
    async fn update_workload(&self, key: &AgentKey, workload: &Deployment) -> Result<(), ReconcileError>;

    /// Delete the workload; a missing one is not an error
    async fn delete_workload(&self, key: &AgentKey) -> Result<(), ReconcileError>;

    async fn update_status(&self, key: &AgentKey, status: &RDEAgentStatus) -> Result<(), ReconcileError>;
}

/// Short stable label value for an agent id
fn instance_hash(agent_id: &str) -> String {
    let digest = Sha256::digest(agent_id.as_bytes());
    hex::encode(&digest[..4])
}

/// The template hash annotation of `deployment`
pub fn template_hash(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()?
        .get(TEMPLATE_HASH_KEY)
        .map(String::as_str)
}

/// Carry the pod template, labels and annotations of `desired` over to
/// `current`, leaving its replicas, selector and other annotations alone
pub fn adopt_template(current: &mut Deployment, desired: &Deployment) {
    current.metadata.labels = desired.metadata.labels.clone();
    if let Some(wanted) = &desired.metadata.annotations {
        current
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(wanted.clone());
    }
    match (current.spec.as_mut(), desired.spec.as_ref()) {
        (Some(spec), Some(wanted)) => spec.template = wanted.template.clone(),
        (None, wanted) => current.spec = wanted.cloned(),
        (Some(_), None) => {}
    }
}

fn hash_template(template: &PodTemplateSpec) -> Result<String, ReconcileError> {
    let encoded = serde_json::to_vec(template)
        .map_err(|e| ReconcileError::Backend(format!("cannot encode pod template: {}", e)))?;
    let digest = Sha256::digest(&encoded);
    Ok(hex::encode(&digest[..8]))
}

fn selector_labels(agent_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), instance_hash(agent_id)),
        (AGENT_ID_KEY.to_string(), agent_id.to_string()),
    ])
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

/// Build the workload for `agent` with `replicas` replicas
///
/// The result depends only on its inputs, so repeated reconciles produce
/// identical objects. The pod template's hash is recorded in the
/// [`TEMPLATE_HASH_KEY`] annotation; the server fills in defaults, so
/// comparing hashes is how a changed record is detected.
pub fn build_workload(
    agent: &RDEAgent,
    settings: &WorkloadSettings,
    replicas: i32,
) -> Result<Deployment, ReconcileError> {
    let agent_id = agent
        .meta()
        .name
        .clone()
        .ok_or(ReconcileError::MissingMetadata("metadata.name"))?;
    let owner = agent
        .controller_owner_ref(&())
        .ok_or(ReconcileError::MissingMetadata("metadata.uid"))?;
    let spec = &agent.spec;
    let labels = selector_labels(&agent_id);

    let sidecar = Container {
        name: APP_NAME.to_string(),
        image: Some(settings.agent_image.clone()),
        env: Some(vec![
            env("SERVER_URL", &spec.server_url),
            env("AGENT_ID", &agent_id),
            env("LOCAL_TARGET", &spec.local_target),
            secret_env("AUTH_CLIENT_ID", &spec.auth_secret_ref, "CLIENT_ID"),
            secret_env("AUTH_CLIENT_SECRET", &spec.auth_secret_ref, "CLIENT_SECRET"),
            env("AUTH_TOKEN_URL", &settings.token_url),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities("50m", "64Mi")),
            limits: Some(quantities("200m", "128Mi")),
            ..ResourceRequirements::default()
        }),
        ..Container::default()
    };

    let workload = Container {
        name: "workload".to_string(),
        image: Some(spec.workload_image.clone()),
        ..Container::default()
    };

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![sidecar, workload],
            ..PodSpec::default()
        }),
    };
    let annotations = BTreeMap::from([
        (AGENT_ID_KEY.to_string(), agent_id.clone()),
        (TEMPLATE_HASH_KEY.to_string(), hash_template(&template)?),
    ]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(agent_id.clone()),
            namespace: agent.meta().namespace.clone(),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..LabelSelector::default()
            },
            template,
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RDEAgentSpec;

    fn agent() -> RDEAgent {
        let mut agent = RDEAgent::new(
            "user-alice-dev",
            RDEAgentSpec {
                owner: "alice".into(),
                server_url: "wss://rde.example.com".into(),
                auth_secret_ref: "alice-dev-auth".into(),
                workload_image: "codercom/code-server:4".into(),
                local_target: "localhost:8080".into(),
                ttl: "30m".into(),
            },
        );
        agent.metadata.namespace = Some("kuberde".into());
        agent.metadata.uid = Some("0b6c7c52-9d1e-4f5e-a0b4-62a5d6f0a111".into());
        agent
    }

    fn settings() -> WorkloadSettings {
        WorkloadSettings {
            agent_image: "kuberde/agent:1.0".into(),
            token_url: "https://sso.example.com/realms/kuberde/protocol/openid-connect/token".into(),
        }
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a EnvVar> {
        container.env.as_ref()?.iter().find(|e| e.name == name)
    }

    #[test]
    fn test_workload_mapping() {
        let deployment = build_workload(&agent(), &settings(), 1).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("user-alice-dev"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("kuberde"));

        let annotations = deployment.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[AGENT_ID_KEY], "user-alice-dev");

        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "RDEAgent");
        assert_eq!(owner.controller, Some(true));

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let labels = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(labels[APP_LABEL], APP_NAME);
        assert_eq!(labels[AGENT_ID_KEY], "user-alice-dev");

        let pod = spec.template.spec.as_ref().unwrap();
        let sidecar = &pod.containers[0];
        assert_eq!(sidecar.image.as_deref(), Some("kuberde/agent:1.0"));
        assert_eq!(
            env_value(sidecar, "AGENT_ID").unwrap().value.as_deref(),
            Some("user-alice-dev")
        );
        assert_eq!(
            env_value(sidecar, "LOCAL_TARGET").unwrap().value.as_deref(),
            Some("localhost:8080")
        );
        let secret = env_value(sidecar, "AUTH_CLIENT_SECRET")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|source| source.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(secret.name, "alice-dev-auth");
        assert_eq!(secret.key, "CLIENT_SECRET");
        assert_eq!(pod.containers[1].image.as_deref(), Some("codercom/code-server:4"));
    }

    #[test]
    fn test_workload_is_deterministic() {
        let a = build_workload(&agent(), &settings(), 0).unwrap();
        let b = build_workload(&agent(), &settings(), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(instance_hash("user-alice-dev").len(), 8);
    }

    #[test]
    fn test_workload_requires_uid() {
        let mut agent = agent();
        agent.metadata.uid = None;
        assert!(matches!(
            build_workload(&agent, &settings(), 1),
            Err(ReconcileError::MissingMetadata(_))
        ));
    }

    #[test]
    fn test_workload_state() {
        let deployment = build_workload(&agent(), &settings(), 1).unwrap();
        let state = WorkloadState::from_deployment(&deployment);
        assert_eq!(state.replicas, 1);
        assert_eq!(state.ready_replicas, 0);
        assert_eq!(state.template_hash.as_deref(), template_hash(&deployment));
        assert!(!state.is_ready());

        let scaled_down = WorkloadState {
            replicas: 0,
            ready_replicas: 0,
            template_hash: None,
        };
        assert!(scaled_down.is_ready());
    }

    #[test]
    fn test_adopt_template_keeps_replicas() {
        let mut current = build_workload(&agent(), &settings(), 0).unwrap();
        current
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("deployment.kubernetes.io/revision".into(), "3".into());

        let mut edited = agent();
        edited.spec.workload_image = "codercom/code-server:5".into();
        let desired = build_workload(&edited, &settings(), 1).unwrap();
        adopt_template(&mut current, &desired);

        let spec = current.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(0));
        let containers = &spec.template.spec.as_ref().unwrap().containers;
        assert_eq!(containers[1].image.as_deref(), Some("codercom/code-server:5"));
        assert_eq!(template_hash(&current), template_hash(&desired));
        let annotations = current.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["deployment.kubernetes.io/revision"], "3");
    }

    #[test]
    fn test_template_hash_tracks_pod_template() {
        let base = build_workload(&agent(), &settings(), 1).unwrap();
        let hash = template_hash(&base).unwrap().to_string();
        assert_eq!(hash.len(), 16);

        // Replica count is not part of the template
        let scaled = build_workload(&agent(), &settings(), 0).unwrap();
        assert_eq!(template_hash(&scaled), Some(hash.as_str()));

        let mut edited = agent();
        edited.spec.workload_image = "codercom/code-server:5".into();
        let edited = build_workload(&edited, &settings(), 1).unwrap();
        assert_ne!(template_hash(&edited), Some(hash.as_str()));

        let mut retargeted = agent();
        retargeted.spec.local_target = "localhost:3000".into();
        let retargeted = build_workload(&retargeted, &settings(), 1).unwrap();
        assert_ne!(template_hash(&retargeted), Some(hash.as_str()));
    }
}

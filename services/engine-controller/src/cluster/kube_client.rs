//! Kubernetes-backed [`ClusterClient`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

use super::{ClusterClient, ClusterError, ConfigMapData, EnginePod};

/// Cluster client using the in-cluster or kubeconfig credentials.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the default credential chain.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
        kube::Error::Api(ae) => ClusterError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => ClusterError::Other(other.to_string()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<EnginePod>, ClusterError> {
        let params = ListParams::default().labels(label_selector);
        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(map_kube_error)?;
        debug!(
            namespace = %namespace,
            label_selector = %label_selector,
            count = pods.items.len(),
            "Listed pods"
        );
        Ok(pods.items.iter().map(EnginePod::from_pod).collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<EnginePod, ClusterError> {
        let created = self
            .pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(map_kube_error)?;
        Ok(EnginePod::from_pod(&created))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn read_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMapData, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api.get(name).await.map_err(map_kube_error)?;
        Ok(ConfigMapData {
            resource_version: config_map.metadata.resource_version,
            data: config_map.data.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;
    use rstest::rstest;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[rstest]
    #[case(404, "not found")]
    #[case(409, "conflict")]
    #[case(500, "api")]
    fn test_map_kube_error(#[case] code: u16, #[case] kind: &str) {
        let mapped = map_kube_error(api_error(code));
        let actual = match mapped {
            ClusterError::NotFound(_) => "not found",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::Api { .. } => "api",
            _ => "other",
        };
        assert_eq!(actual, kind);
    }
}

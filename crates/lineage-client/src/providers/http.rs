//! HTTP backend speaking the workspace server's REST routes

use crate::auth::AuthProvider;
use crate::backend::*;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::wire;
use lineage_core::{GraphSnapshot, Node, NodeId, WorkspaceId};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceList {
    #[serde(default)]
    workspaces: Vec<WorkspaceSummary>,
}

#[derive(Debug, Deserialize)]
struct CurrentWorkspace {
    current_workspace_id: Option<WorkspaceId>,
}

#[derive(Debug, Serialize)]
struct DetachBody<'a> {
    node_id: &'a NodeId,
    #[serde(flatten)]
    spec: &'a DetachSpec,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig, auth: Arc<dyn AuthProvider>) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self.client.request(method, url);
        for (name, value) in self.auth.auth_headers() {
            builder = builder.header(name, value);
        }
        builder
    }

    fn node_path(workspace: &WorkspaceId, node: &NodeId, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("workspaces/{}/nodes/{}", workspace, node)
        } else {
            format!("workspaces/{}/nodes/{}/{}", workspace, node, suffix)
        }
    }

    /// Send and decode a JSON body. Non-2xx responses carry the server's `detail`.
    async fn send(&self, builder: RequestBuilder) -> ClientResult<serde_json::Value> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("detail").and_then(|d| d.as_str()).map(str::to_string));
            tracing::debug!("{} responded {}: {:?}", self.base_url, status, detail);
            return Err(ClientError::Http {
                status: status.as_u16(),
                code: detail,
            });
        }
        Ok(response.json().await?)
    }

    async fn mutate(&self, builder: RequestBuilder) -> ClientResult<MutationReceipt> {
        let body = self.send(builder).await?;
        Ok(MutationReceipt::from_json(&body))
    }
}

#[async_trait::async_trait]
impl WorkspaceBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_workspaces(&self) -> ClientResult<Vec<WorkspaceSummary>> {
        let body = self.send(self.request(Method::GET, "workspaces/")).await?;
        let list: WorkspaceList = serde_json::from_value(body)?;
        Ok(list.workspaces)
    }

    async fn current_workspace(&self) -> ClientResult<Option<WorkspaceId>> {
        let body = self.send(self.request(Method::GET, "workspaces/current")).await?;
        let current: CurrentWorkspace = serde_json::from_value(body)?;
        Ok(current.current_workspace_id)
    }

    async fn set_current_workspace(&self, workspace: &WorkspaceId) -> ClientResult<()> {
        let builder = self
            .request(Method::POST, "workspaces/current")
            .query(&[("workspace_id", workspace.as_str())]);
        self.send(builder).await?;
        Ok(())
    }

    async fn graph(&self, workspace: &WorkspaceId) -> ClientResult<GraphSnapshot> {
        let path = format!("workspaces/{}/graph", workspace);
        let body = self.send(self.request(Method::GET, &path)).await?;
        wire::snapshot_from_json(workspace, body)
    }

    async fn node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<Node> {
        let path = Self::node_path(workspace, node, "");
        let body = self.send(self.request(Method::GET, &path)).await?;
        wire::node_from_json(body)
    }

    async fn node_data(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<NodePage> {
        let path = Self::node_path(workspace, node, "data");
        let builder = self
            .request(Method::GET, &path)
            .query(&[("page", page), ("page_size", page_size)]);
        let body = self.send(builder).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn node_shape(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<ShapeReport> {
        let path = Self::node_path(workspace, node, "shape");
        let body = self.send(self.request(Method::GET, &path)).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn create_node_from_file(
        &self,
        workspace: &WorkspaceId,
        filename: &str,
    ) -> ClientResult<MutationReceipt> {
        let path = format!("workspaces/{}/nodes", workspace);
        self.mutate(self.request(Method::POST, &path).query(&[("filename", filename)]))
            .await
    }

    async fn rename_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        new_name: &str,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "rename");
        self.mutate(self.request(Method::POST, &path).query(&[("new_name", new_name)]))
            .await
    }

    async fn delete_node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "");
        self.mutate(self.request(Method::DELETE, &path)).await
    }

    async fn cast_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &CastSpec,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "cast");
        self.mutate(self.request(Method::POST, &path).json(spec)).await
    }

    async fn convert_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        target: &ConvertTarget,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, &format!("convert/{}", target.route()));
        let mut builder = self.request(Method::POST, &path);
        if let Some(column) = target.document_column() {
            builder = builder.query(&[("document_column", column)]);
        }
        self.mutate(builder).await
    }

    async fn filter_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &FilterSpec,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "filter");
        self.mutate(self.request(Method::POST, &path).json(spec)).await
    }

    async fn slice_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &SliceSpec,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "slice");
        self.mutate(self.request(Method::POST, &path).json(spec)).await
    }

    async fn join_nodes(&self, workspace: &WorkspaceId, spec: &JoinSpec) -> ClientResult<MutationReceipt> {
        let path = format!("workspaces/{}/nodes/join", workspace);
        let mut query = vec![
            ("left_node_id", spec.left.as_str()),
            ("right_node_id", spec.right.as_str()),
            ("left_on", spec.left_on.as_str()),
            ("right_on", spec.right_on.as_str()),
            ("how", spec.how.as_str()),
        ];
        if let Some(name) = &spec.new_node_name {
            query.push(("new_node_name", name.as_str()));
        }
        self.mutate(self.request(Method::POST, &path).query(&query)).await
    }

    async fn detach_concordance(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &DetachSpec,
    ) -> ClientResult<MutationReceipt> {
        let path = Self::node_path(workspace, node, "concordance/detach");
        let body = DetachBody { node_id: node, spec };
        self.mutate(self.request(Method::POST, &path).json(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerToken;

    #[test]
    fn test_requests_carry_auth_and_base_path() {
        let config = ClientConfig {
            base_url: "http://localhost:8001/api/".to_string(),
            ..ClientConfig::default()
        };
        let backend = HttpBackend::new(&config, Arc::new(BearerToken::new("t0k"))).unwrap();
        let request = backend
            .request(Method::GET, "workspaces/w1/graph")
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "http://localhost:8001/api/workspaces/w1/graph");
        assert_eq!(request.headers()["Authorization"], "Bearer t0k");
    }

    #[test]
    fn test_detach_body_includes_node() {
        let spec = DetachSpec::new("text", "tax");
        let node = NodeId::from("n1");
        let body = serde_json::to_value(DetachBody { node_id: &node, spec: &spec }).unwrap();
        assert_eq!(body["node_id"], "n1");
        assert_eq!(body["num_left_tokens"], 10);
        assert_eq!(body["search_word"], "tax");
    }
}

//! Backend collaborator: the server that owns workspaces and executes transformations

use crate::error::ClientResult;
use async_trait::async_trait;
use lineage_core::{ColumnType, DataKind, GraphSnapshot, Node, NodeId, Shape, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Workspace API. Implementations decorate requests with auth headers themselves;
/// the caller is responsible for checking that the session is authenticated.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn list_workspaces(&self) -> ClientResult<Vec<WorkspaceSummary>>;

    async fn current_workspace(&self) -> ClientResult<Option<WorkspaceId>>;

    async fn set_current_workspace(&self, workspace: &WorkspaceId) -> ClientResult<()>;

    async fn graph(&self, workspace: &WorkspaceId) -> ClientResult<GraphSnapshot>;

    /// Full descriptor including schema. Resolves the row count of lazy nodes.
    async fn node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<Node>;

    async fn node_data(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<NodePage>;

    async fn node_shape(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<ShapeReport>;

    async fn create_node_from_file(
        &self,
        workspace: &WorkspaceId,
        filename: &str,
    ) -> ClientResult<MutationReceipt>;

    async fn rename_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        new_name: &str,
    ) -> ClientResult<MutationReceipt>;

    async fn delete_node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<MutationReceipt>;

    async fn cast_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &CastSpec,
    ) -> ClientResult<MutationReceipt>;

    async fn convert_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        target: &ConvertTarget,
    ) -> ClientResult<MutationReceipt>;

    async fn filter_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &FilterSpec,
    ) -> ClientResult<MutationReceipt>;

    async fn slice_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &SliceSpec,
    ) -> ClientResult<MutationReceipt>;

    async fn join_nodes(&self, workspace: &WorkspaceId, spec: &JoinSpec) -> ClientResult<MutationReceipt>;

    async fn detach_concordance(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &DetachSpec,
    ) -> ClientResult<MutationReceipt>;
}

/// One entry of the workspace list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSummary {
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub node_count: usize,
}

/// One page of a node's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePage {
    pub data: Vec<serde_json::Value>,
    pub pagination: Pagination,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_rows: u64,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    /// Pagination block for `total_rows` rows, 1-based `page`.
    pub fn new(page: u32, page_size: u32, total_rows: u64) -> Self {
        let page_size = page_size.max(1);
        let total_pages = total_rows.div_ceil(page_size as u64) as u32;
        Pagination {
            page,
            page_size,
            total_rows,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Response of the shape endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeReport {
    pub shape: Shape,
    pub is_lazy: bool,
    #[serde(default)]
    pub calculated: bool,
}

/// What a mutation endpoint reported back. Endpoints disagree on field names,
/// so this is extracted from the raw JSON rather than derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationReceipt {
    /// The created or updated node, when reported.
    pub node_id: Option<NodeId>,
    pub node_name: Option<String>,
    pub message: Option<String>,
}

impl MutationReceipt {
    pub fn for_node(id: NodeId, name: impl Into<String>) -> Self {
        MutationReceipt {
            node_id: Some(id),
            node_name: Some(name.into()),
            message: None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
                .map(str::to_string)
        };
        MutationReceipt {
            node_id: text(&["new_node_id", "node_id", "id"]).map(NodeId::new),
            node_name: text(&["new_node_name", "node_name", "name"]),
            message: text(&["message"]),
        }
    }
}

/// Target type of a column cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastTarget {
    Number,
    Integer,
    Float,
    String,
    Datetime,
    Boolean,
}

impl CastTarget {
    pub fn column_type(&self) -> ColumnType {
        match self {
            CastTarget::Number | CastTarget::Integer | CastTarget::Float => ColumnType::Number,
            CastTarget::String => ColumnType::String,
            CastTarget::Datetime => ColumnType::Datetime,
            CastTarget::Boolean => ColumnType::Boolean,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "number" => Some(CastTarget::Number),
            "integer" | "int" => Some(CastTarget::Integer),
            "float" => Some(CastTarget::Float),
            "string" | "str" => Some(CastTarget::String),
            "datetime" => Some(CastTarget::Datetime),
            "boolean" | "bool" => Some(CastTarget::Boolean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub column: String,
    pub target_type: CastTarget,
    /// strftime-style pattern, only meaningful for datetime targets.
    #[serde(default)]
    pub format: Option<String>,
}

impl CastSpec {
    pub fn new(column: impl Into<String>, target_type: CastTarget) -> Self {
        CastSpec {
            column: column.into(),
            target_type,
            format: None,
        }
    }
}

/// In-place frame conversion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ConvertTarget {
    DocDataFrame { document_column: Option<String> },
    DataFrame,
    DocLazyFrame { document_column: Option<String> },
    LazyFrame,
}

impl ConvertTarget {
    /// Path segment under `convert/`.
    pub fn route(&self) -> &'static str {
        match self {
            ConvertTarget::DocDataFrame { .. } => "to-docdataframe",
            ConvertTarget::DataFrame => "to-dataframe",
            ConvertTarget::DocLazyFrame { .. } => "to-doclazyframe",
            ConvertTarget::LazyFrame => "to-lazyframe",
        }
    }

    pub fn document_column(&self) -> Option<&str> {
        match self {
            ConvertTarget::DocDataFrame { document_column }
            | ConvertTarget::DocLazyFrame { document_column } => document_column.as_deref(),
            _ => None,
        }
    }

    pub fn data_kind(&self) -> DataKind {
        match self {
            ConvertTarget::DocDataFrame { .. } => DataKind::DocDataFrame,
            ConvertTarget::DataFrame => DataKind::DataFrame,
            ConvertTarget::DocLazyFrame { .. } => DataKind::DocLazyFrame,
            ConvertTarget::LazyFrame => DataKind::LazyFrame,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub conditions: Vec<FilterCondition>,
    #[serde(default)]
    pub logic: FilterLogic,
    #[serde(default)]
    pub new_node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SliceSpec {
    #[serde(default)]
    pub start_row: Option<u64>,
    /// Exclusive.
    #[serde(default)]
    pub end_row: Option<u64>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub new_node_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinHow {
    #[default]
    Inner,
    Left,
    Right,
    #[serde(alias = "outer")]
    Full,
    Semi,
    Anti,
    Cross,
}

impl JoinHow {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinHow::Inner => "inner",
            JoinHow::Left => "left",
            JoinHow::Right => "right",
            JoinHow::Full => "full",
            JoinHow::Semi => "semi",
            JoinHow::Anti => "anti",
            JoinHow::Cross => "cross",
        }
    }

    /// Unknown strategies fall back to an inner join.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "left" => JoinHow::Left,
            "right" => JoinHow::Right,
            "outer" | "full" => JoinHow::Full,
            "semi" => JoinHow::Semi,
            "anti" => JoinHow::Anti,
            "cross" => JoinHow::Cross,
            _ => JoinHow::Inner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left: NodeId,
    pub right: NodeId,
    pub left_on: String,
    pub right_on: String,
    #[serde(default)]
    pub how: JoinHow,
    #[serde(default)]
    pub new_node_name: Option<String>,
}

impl JoinSpec {
    /// Join on a column with the same name on both sides.
    pub fn on(left: NodeId, right: NodeId, column: impl Into<String>) -> Self {
        let column = column.into();
        JoinSpec {
            left,
            right,
            left_on: column.clone(),
            right_on: column,
            how: JoinHow::Inner,
            new_node_name: None,
        }
    }
}

/// Concordance search whose matches are joined back onto the source rows as a new node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachSpec {
    pub column: String,
    pub search_word: String,
    #[serde(default = "default_context_tokens")]
    pub num_left_tokens: u32,
    #[serde(default = "default_context_tokens")]
    pub num_right_tokens: u32,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub new_node_name: Option<String>,
}

fn default_context_tokens() -> u32 {
    10
}

impl DetachSpec {
    pub fn new(column: impl Into<String>, search_word: impl Into<String>) -> Self {
        DetachSpec {
            column: column.into(),
            search_word: search_word.into(),
            num_left_tokens: default_context_tokens(),
            num_right_tokens: default_context_tokens(),
            regex: false,
            case_sensitive: false,
            new_node_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_receipt_reads_every_id_field() {
        let cast = MutationReceipt::from_json(&json!({"success": true, "node_id": "n1", "message": "ok"}));
        assert_eq!(cast.node_id, Some(NodeId::from("n1")));
        assert_eq!(cast.message.as_deref(), Some("ok"));

        let detach = MutationReceipt::from_json(&json!({"new_node_id": "n2", "new_node_name": "x_conc_y"}));
        assert_eq!(detach.node_id, Some(NodeId::from("n2")));
        assert_eq!(detach.node_name.as_deref(), Some("x_conc_y"));

        let info = MutationReceipt::from_json(&json!({"id": "n3", "name": "sales", "operation": "load"}));
        assert_eq!(info, MutationReceipt::for_node("n3".into(), "sales"));
    }

    #[test]
    fn test_pagination_bounds() {
        let p = Pagination::new(1, 100, 250);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next && !p.has_prev);

        let last = Pagination::new(3, 100, 250);
        assert!(!last.has_next && last.has_prev);

        assert_eq!(Pagination::new(1, 100, 0).total_pages, 0);
    }

    #[test]
    fn test_outer_join_alias() {
        let how: JoinHow = serde_json::from_value(json!("outer")).unwrap();
        assert_eq!(how, JoinHow::Full);
        assert_eq!(JoinHow::parse("bogus"), JoinHow::Inner);
    }

    #[test]
    fn test_detach_defaults() {
        let spec: DetachSpec =
            serde_json::from_value(json!({"column": "text", "search_word": "tax"})).unwrap();
        assert_eq!(spec, DetachSpec::new("text", "tax"));
    }
}

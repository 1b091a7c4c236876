//! In-memory workspace server for offline use and tests
//!
//! Holds real rows per node so filters, slices and joins produce meaningful
//! shapes. Every endpoint call is counted, can be made to fail, and can be held
//! open behind a gate so callers can observe in-flight state.

use crate::backend::*;
use crate::error::{ClientError, ClientResult};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use lineage_core::{ColumnType, DataKind, GraphSnapshot, LineageGraph, Node, NodeId, Shape, WorkspaceId};
use regex::RegexBuilder;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

pub type Row = Map<String, Value>;

/// Backend endpoints, for request counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    ListWorkspaces,
    CurrentWorkspace,
    SetCurrentWorkspace,
    Graph,
    Node,
    NodeData,
    NodeShape,
    CreateNode,
    Rename,
    Delete,
    Cast,
    Convert,
    Filter,
    Slice,
    Join,
    Detach,
}

/// Rows of one node with their column order and column types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub types: BTreeMap<String, ColumnType>,
    pub rows: Vec<Row>,
}

impl Table {
    /// Build from positional rows. Column types are inferred from the first non-null value.
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let rows: Vec<Row> = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect();
        let types = columns
            .iter()
            .map(|c| {
                let first = rows.iter().filter_map(|r| r.get(c)).find(|v| !v.is_null());
                let tag = match first {
                    Some(Value::Number(_)) => ColumnType::Number,
                    Some(Value::Bool(_)) => ColumnType::Boolean,
                    _ => ColumnType::String,
                };
                (c.clone(), tag)
            })
            .collect();
        Table { columns, types, rows }
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    fn column_type(&self, column: &str) -> ColumnType {
        self.types.get(column).copied().unwrap_or(ColumnType::String)
    }

    fn require(&self, column: &str) -> ClientResult<()> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(bad_request(format!(
                "Column '{}' not found. Available columns: {:?}",
                column, self.columns
            )))
        }
    }

    fn with_rows(&self, rows: Vec<Row>) -> Table {
        Table {
            columns: self.columns.clone(),
            types: self.types.clone(),
            rows,
        }
    }
}

struct LocalWorkspace {
    name: String,
    description: String,
    created_at: String,
    modified_at: String,
    graph: LineageGraph,
    tables: HashMap<NodeId, Table>,
}

impl LocalWorkspace {
    fn touch(&mut self) {
        self.modified_at = Utc::now().to_rfc3339();
    }

    fn table(&self, id: &NodeId) -> ClientResult<&Table> {
        self.tables.get(id).ok_or_else(|| not_found("Node not found"))
    }

    fn node(&self, id: &NodeId) -> ClientResult<&Node> {
        self.graph.node(id).ok_or_else(|| not_found("Node not found"))
    }

    /// Re-derive a node's columns, schema and shape from its table.
    fn refresh(&mut self, id: &NodeId) -> ClientResult<()> {
        let table = self.tables.get(id).ok_or_else(|| not_found("Node not found"))?;
        let node = self.graph.node_mut(id).ok_or_else(|| not_found("Node not found"))?;
        let described = describe(id, &node.name, node.data_kind, table);
        node.columns = described.columns;
        node.schema = described.schema;
        node.shape = described.shape;
        node.is_lazy = node.data_kind.is_lazy();
        Ok(())
    }
}

#[derive(Default)]
struct LocalState {
    workspaces: BTreeMap<WorkspaceId, LocalWorkspace>,
    current: Option<WorkspaceId>,
    files: BTreeMap<String, Table>,
    next_id: u64,
}

impl LocalState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn workspace(&self, id: &WorkspaceId) -> ClientResult<&LocalWorkspace> {
        self.workspaces.get(id).ok_or_else(|| not_found("Workspace not found"))
    }

    fn workspace_mut(&mut self, id: &WorkspaceId) -> ClientResult<&mut LocalWorkspace> {
        self.workspaces
            .get_mut(id)
            .ok_or_else(|| not_found("Workspace not found"))
    }

    fn add_workspace(&mut self, name: &str) -> WorkspaceId {
        let id = WorkspaceId::new(self.allocate("ws"));
        let now = Utc::now().to_rfc3339();
        self.workspaces.insert(
            id.clone(),
            LocalWorkspace {
                name: name.to_string(),
                description: String::new(),
                created_at: now.clone(),
                modified_at: now,
                graph: LineageGraph::new(),
                tables: HashMap::new(),
            },
        );
        if self.current.is_none() {
            self.current = Some(id.clone());
        }
        id
    }

    /// Insert a node with its parent edges in one step.
    #[allow(clippy::too_many_arguments)]
    fn add_node(
        &mut self,
        workspace: &WorkspaceId,
        name: &str,
        kind: DataKind,
        document_column: Option<String>,
        operation: Option<String>,
        table: Table,
        parents: &[&NodeId],
    ) -> ClientResult<MutationReceipt> {
        let id = NodeId::new(self.allocate("node"));
        let ws = self.workspace_mut(workspace)?;

        let mut node = describe(&id, name, kind, &table);
        node.document_column = document_column;
        node.operation = operation;
        ws.graph
            .add_node(node)
            .map_err(|e| bad_request(e.to_string()))?;
        for parent in parents {
            ws.graph
                .add_edge(parent, &id)
                .map_err(|e| bad_request(e.to_string()))?;
        }
        ws.tables.insert(id.clone(), table);
        ws.touch();
        tracing::debug!("Local backend created node {} ({})", id, name);
        Ok(MutationReceipt::for_node(id, name))
    }
}

pub struct LocalBackend {
    state: Mutex<LocalState>,
    calls: DashMap<Endpoint, u64>,
    faults: DashMap<Endpoint, VecDeque<ClientError>>,
    gates: DashMap<Endpoint, Arc<Semaphore>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            calls: DashMap::new(),
            faults: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// A backend with one workspace holding `customers`, `orders` (lazy) and
    /// `reviews` (document frame), and the same tables uploadable as files.
    pub fn with_sample_data() -> Self {
        let mut backend = Self::new();
        let state = backend.state.get_mut();

        let customers = Table::new(
            &["customer_id", "name", "region"],
            vec![
                vec![json!(1), json!("Ada"), json!("north")],
                vec![json!(2), json!("Grace"), json!("south")],
                vec![json!(3), json!("Edsger"), json!("north")],
                vec![json!(4), json!("Barbara"), json!("west")],
            ],
        );
        let orders = Table::new(
            &["order_id", "customer_id", "amount", "placed"],
            (1..=8)
                .map(|i| {
                    vec![
                        json!(100 + i),
                        json!((i % 4) + 1),
                        json!(12.5 * i as f64),
                        json!(format!("2024-03-{:02}", i)),
                    ]
                })
                .collect(),
        );
        let reviews = Table::new(
            &["review_id", "customer_id", "text"],
            vec![
                vec![json!(1), json!(1), json!("Quick delivery and the tax invoice was correct")],
                vec![json!(2), json!(2), json!("Package arrived late")],
                vec![json!(3), json!(3), json!("Tax was charged twice on this order")],
            ],
        );

        state.files.insert("customers.csv".to_string(), customers.clone());
        state.files.insert("orders.csv".to_string(), orders.clone());
        state.files.insert("reviews.csv".to_string(), reviews.clone());

        let ws = state.add_workspace("Sample workspace");
        let load = || Some("load".to_string());
        // Ids are freshly allocated and the workspace exists, so these cannot fail.
        let _ = state.add_node(&ws, "customers", DataKind::DataFrame, None, load(), customers, &[]);
        let _ = state.add_node(&ws, "orders", DataKind::LazyFrame, None, load(), orders, &[]);
        let _ = state.add_node(
            &ws,
            "reviews",
            DataKind::DocDataFrame,
            Some("text".to_string()),
            load(),
            reviews,
            &[],
        );
        backend
    }

    /// Register a file that `create_node_from_file` can load.
    pub fn with_file(mut self, filename: &str, table: Table) -> Self {
        self.state.get_mut().files.insert(filename.to_string(), table);
        self
    }

    pub async fn add_workspace(&self, name: &str) -> WorkspaceId {
        self.state.lock().await.add_workspace(name)
    }

    /// Server-side truth, bypassing counters, gates and faults.
    pub async fn snapshot(&self, workspace: &WorkspaceId) -> Option<GraphSnapshot> {
        let state = self.state.lock().await;
        let ws = state.workspaces.get(workspace)?;
        Some(ws.graph.to_snapshot(workspace.clone()))
    }

    /// How many times an endpoint has been called, including failed and held calls.
    pub fn calls(&self, endpoint: Endpoint) -> u64 {
        self.calls.get(&endpoint).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    /// Make the next `times` calls to `endpoint` fail with `error`.
    pub fn fail_next(&self, endpoint: Endpoint, error: ClientError, times: usize) {
        let mut queue = self.faults.entry(endpoint).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Hold every subsequent call to `endpoint` until released.
    pub fn hold(&self, endpoint: Endpoint) {
        self.gates.insert(endpoint, Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held calls to `endpoint` proceed.
    pub fn release(&self, endpoint: Endpoint, count: usize) {
        if let Some(gate) = self.gates.get(&endpoint) {
            gate.add_permits(count);
        }
    }

    /// Remove the gate and let every held call through.
    pub fn open(&self, endpoint: Endpoint) {
        if let Some((_, gate)) = self.gates.remove(&endpoint) {
            gate.close();
        }
    }

    async fn enter(&self, endpoint: Endpoint) -> ClientResult<()> {
        *self.calls.entry(endpoint).or_insert(0) += 1;

        let gate = self.gates.get(&endpoint).map(|g| Arc::clone(g.value()));
        if let Some(gate) = gate {
            // A closed gate lets everything through.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(mut queue) = self.faults.get_mut(&endpoint) {
            if let Some(err) = queue.pop_front() {
                tracing::debug!("Local backend injecting failure on {:?}: {}", endpoint, err);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(detail: &str) -> ClientError {
    ClientError::Http {
        status: 404,
        code: Some(detail.to_string()),
    }
}

fn bad_request(detail: impl Into<String>) -> ClientError {
    ClientError::Http {
        status: 400,
        code: Some(detail.into()),
    }
}

fn describe(id: &NodeId, name: &str, kind: DataKind, table: &Table) -> Node {
    let mut node = Node::new(id.clone(), name, kind);
    for column in &table.columns {
        node = node.with_column(column, table.column_type(column));
    }
    node.shape.rows = Some(table.rows.len() as u64);
    node
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn matches_condition(row: &Row, condition: &FilterCondition) -> bool {
    let cell = row.get(&condition.column).unwrap_or(&Value::Null);
    match condition.operator {
        FilterOperator::Equals => match (number_of(cell), number_of(&condition.value)) {
            (Some(a), Some(b)) if cell.is_number() || condition.value.is_number() => a == b,
            _ => text_of(cell).is_some() && text_of(cell) == text_of(&condition.value),
        },
        FilterOperator::Contains => match (text_of(cell), text_of(&condition.value)) {
            (Some(hay), Some(needle)) => hay.contains(&needle),
            _ => false,
        },
        FilterOperator::GreaterThan => match (number_of(cell), number_of(&condition.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        FilterOperator::LessThan => match (number_of(cell), number_of(&condition.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

fn parse_datetime(text: &str, format: Option<&str>) -> Option<String> {
    match format {
        Some(format) => NaiveDateTime::parse_from_str(text, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(text, format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => chrono::DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.naive_utc())
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
    }
}

/// Convert one cell; values that cannot be represented become null.
fn cast_value(value: &Value, spec: &CastSpec) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match spec.target_type {
        CastTarget::Number | CastTarget::Float => number_of(value)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CastTarget::Integer => number_of(value)
            .map(|n| json!(n.trunc() as i64))
            .unwrap_or(Value::Null),
        CastTarget::String => text_of(value).map(Value::String).unwrap_or(Value::Null),
        CastTarget::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            other => number_of(other).map(|n| Value::Bool(n != 0.0)).unwrap_or(Value::Null),
        },
        CastTarget::Datetime => text_of(value)
            .and_then(|t| parse_datetime(&t, spec.format.as_deref()))
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn join_key(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(text_of)
}

fn join_tables(left: &Table, right: &Table, spec: &JoinSpec) -> Table {
    let cross = spec.how == JoinHow::Cross;
    let right_columns: Vec<(String, String)> = right
        .columns
        .iter()
        .filter(|c| cross || **c != spec.right_on)
        .map(|c| {
            let out = if left.has_column(c) { format!("{}_right", c) } else { c.clone() };
            (c.clone(), out)
        })
        .collect();

    let mut columns = left.columns.clone();
    let mut types = left.types.clone();
    if !matches!(spec.how, JoinHow::Semi | JoinHow::Anti) {
        for (source, out) in &right_columns {
            columns.push(out.clone());
            types.insert(out.clone(), right.column_type(source));
        }
    }

    let merge = |l: Option<&Row>, r: Option<&Row>| -> Row {
        let mut row = Row::new();
        for c in &left.columns {
            row.insert(c.clone(), l.and_then(|l| l.get(c)).cloned().unwrap_or(Value::Null));
        }
        if l.is_none() {
            // Key columns are coalesced from the right side.
            if let Some(key) = r.and_then(|r| r.get(&spec.right_on)) {
                row.insert(spec.left_on.clone(), key.clone());
            }
        }
        for (source, out) in &right_columns {
            row.insert(out.clone(), r.and_then(|r| r.get(source)).cloned().unwrap_or(Value::Null));
        }
        row
    };

    let matches = |l: &Row, r: &Row| -> bool {
        cross
            || matches!(
                (join_key(l, &spec.left_on), join_key(r, &spec.right_on)),
                (Some(a), Some(b)) if a == b
            )
    };

    let mut rows = Vec::new();
    match spec.how {
        JoinHow::Semi | JoinHow::Anti => {
            let keep_matched = spec.how == JoinHow::Semi;
            for l in &left.rows {
                if right.rows.iter().any(|r| matches(l, r)) == keep_matched {
                    rows.push(l.clone());
                }
            }
        }
        JoinHow::Right => {
            for r in &right.rows {
                let mut matched = false;
                for l in left.rows.iter().filter(|l| matches(l, r)) {
                    rows.push(merge(Some(l), Some(r)));
                    matched = true;
                }
                if !matched {
                    rows.push(merge(None, Some(r)));
                }
            }
        }
        JoinHow::Inner | JoinHow::Left | JoinHow::Full | JoinHow::Cross => {
            let mut right_matched = vec![false; right.rows.len()];
            for l in &left.rows {
                let mut matched = false;
                for (i, r) in right.rows.iter().enumerate() {
                    if matches(l, r) {
                        rows.push(merge(Some(l), Some(r)));
                        right_matched[i] = true;
                        matched = true;
                    }
                }
                if !matched && matches!(spec.how, JoinHow::Left | JoinHow::Full) {
                    rows.push(merge(Some(l), None));
                }
            }
            if spec.how == JoinHow::Full {
                for (r, _) in right.rows.iter().zip(&right_matched).filter(|(_, m)| !**m) {
                    rows.push(merge(None, Some(r)));
                }
            }
        }
    }

    Table { columns, types, rows }
}

const CONCORDANCE_COLUMNS: [&str; 5] = ["left_context", "matched_text", "right_context", "l1", "r1"];

fn concordance(table: &Table, spec: &DetachSpec) -> ClientResult<Table> {
    let pattern = if spec.regex {
        spec.search_word.clone()
    } else {
        regex::escape(&spec.search_word)
    };
    let matcher = RegexBuilder::new(&pattern)
        .case_insensitive(!spec.case_sensitive)
        .build()
        .map_err(|e| bad_request(format!("Invalid search pattern: {}", e)))?;

    let mut out = table.with_rows(Vec::new());
    for column in CONCORDANCE_COLUMNS {
        out.columns.push(column.to_string());
        out.types.insert(column.to_string(), ColumnType::String);
    }

    for row in &table.rows {
        let text = row.get(&spec.column).and_then(text_of).unwrap_or_default();
        let mut found = false;
        for m in matcher.find_iter(&text) {
            let before: Vec<&str> = text[..m.start()].split_whitespace().collect();
            let after: Vec<&str> = text[m.end()..].split_whitespace().collect();
            let left = &before[before.len().saturating_sub(spec.num_left_tokens as usize)..];
            let right = &after[..after.len().min(spec.num_right_tokens as usize)];

            let mut hit = row.clone();
            hit.insert("left_context".into(), json!(left.join(" ")));
            hit.insert("matched_text".into(), json!(m.as_str()));
            hit.insert("right_context".into(), json!(right.join(" ")));
            hit.insert("l1".into(), left.last().map(|t| json!(t)).unwrap_or(Value::Null));
            hit.insert("r1".into(), right.first().map(|t| json!(t)).unwrap_or(Value::Null));
            out.rows.push(hit);
            found = true;
        }
        if !found {
            let mut miss = row.clone();
            for column in CONCORDANCE_COLUMNS {
                miss.insert(column.to_string(), Value::Null);
            }
            out.rows.push(miss);
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl WorkspaceBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_workspaces(&self) -> ClientResult<Vec<WorkspaceSummary>> {
        self.enter(Endpoint::ListWorkspaces).await?;
        let state = self.state.lock().await;
        Ok(state
            .workspaces
            .iter()
            .map(|(id, ws)| WorkspaceSummary {
                workspace_id: id.clone(),
                name: ws.name.clone(),
                description: Some(ws.description.clone()),
                created_at: Some(ws.created_at.clone()),
                modified_at: Some(ws.modified_at.clone()),
                node_count: ws.graph.node_count(),
            })
            .collect())
    }

    async fn current_workspace(&self) -> ClientResult<Option<WorkspaceId>> {
        self.enter(Endpoint::CurrentWorkspace).await?;
        Ok(self.state.lock().await.current.clone())
    }

    async fn set_current_workspace(&self, workspace: &WorkspaceId) -> ClientResult<()> {
        self.enter(Endpoint::SetCurrentWorkspace).await?;
        let mut state = self.state.lock().await;
        state.workspace(workspace)?;
        state.current = Some(workspace.clone());
        Ok(())
    }

    async fn graph(&self, workspace: &WorkspaceId) -> ClientResult<GraphSnapshot> {
        self.enter(Endpoint::Graph).await?;
        let state = self.state.lock().await;
        let mut snapshot = state.workspace(workspace)?.graph.to_snapshot(workspace.clone());
        // Lazy row counts are only computed by the shape endpoint.
        for node in snapshot.nodes.iter_mut().filter(|n| n.is_lazy) {
            node.shape.rows = None;
        }
        Ok(snapshot)
    }

    async fn node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<Node> {
        self.enter(Endpoint::Node).await?;
        let state = self.state.lock().await;
        Ok(state.workspace(workspace)?.node(node)?.clone())
    }

    async fn node_data(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<NodePage> {
        self.enter(Endpoint::NodeData).await?;
        let state = self.state.lock().await;
        let table = state.workspace(workspace)?.table(node)?;

        let page = page.max(1);
        let pagination = Pagination::new(page, page_size, table.rows.len() as u64);
        let start = (page as usize - 1) * pagination.page_size as usize;
        let data = table
            .rows
            .iter()
            .skip(start)
            .take(pagination.page_size as usize)
            .map(|r| Value::Object(r.clone()))
            .collect();
        Ok(NodePage {
            data,
            pagination,
            columns: table.columns.clone(),
            dtypes: table
                .columns
                .iter()
                .map(|c| (c.clone(), table.column_type(c).as_str().to_string()))
                .collect(),
        })
    }

    async fn node_shape(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<ShapeReport> {
        self.enter(Endpoint::NodeShape).await?;
        let state = self.state.lock().await;
        let ws = state.workspace(workspace)?;
        let table = ws.table(node)?;
        Ok(ShapeReport {
            shape: Shape::new(Some(table.rows.len() as u64), table.columns.len() as u64),
            is_lazy: ws.node(node)?.is_lazy,
            calculated: true,
        })
    }

    async fn create_node_from_file(
        &self,
        workspace: &WorkspaceId,
        filename: &str,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::CreateNode).await?;
        let mut state = self.state.lock().await;
        let table = state
            .files
            .get(filename)
            .cloned()
            .ok_or_else(|| not_found("File not found"))?;
        let name = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(filename)
            .to_string();
        state.add_node(workspace, &name, DataKind::DataFrame, None, Some("load".into()), table, &[])
    }

    async fn rename_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        new_name: &str,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Rename).await?;
        if new_name.trim().is_empty() {
            return Err(bad_request("Name must not be empty"));
        }
        let mut state = self.state.lock().await;
        let ws = state.workspace_mut(workspace)?;
        let target = ws.graph.node_mut(node).ok_or_else(|| not_found("Node not found"))?;
        target.name = new_name.to_string();
        ws.touch();
        Ok(MutationReceipt::for_node(node.clone(), new_name))
    }

    async fn delete_node(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Delete).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace_mut(workspace)?;
        let removed = ws.graph.remove_node(node).ok_or_else(|| not_found("Node not found"))?;
        ws.tables.remove(node);
        ws.touch();
        Ok(MutationReceipt {
            node_id: Some(removed.id),
            node_name: Some(removed.name.clone()),
            message: Some(format!("Node '{}' deleted", removed.name)),
        })
    }

    async fn cast_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &CastSpec,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Cast).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace_mut(workspace)?;
        let table = ws.tables.get_mut(node).ok_or_else(|| not_found("Node not found"))?;
        table.require(&spec.column)?;

        for row in &mut table.rows {
            if let Some(cell) = row.get_mut(&spec.column) {
                *cell = cast_value(cell, spec);
            }
        }
        table.types.insert(spec.column.clone(), spec.target_type.column_type());
        ws.refresh(node)?;
        ws.touch();
        Ok(MutationReceipt {
            node_id: Some(node.clone()),
            node_name: None,
            message: Some(format!(
                "Column '{}' cast to {:?}",
                spec.column, spec.target_type
            )),
        })
    }

    async fn convert_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        target: &ConvertTarget,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Convert).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace_mut(workspace)?;
        let table = ws.table(node)?.clone();
        let existing = ws.node(node)?.document_column.clone();

        let kind = target.data_kind();
        let document_column = if kind.is_document() {
            let column = match target.document_column() {
                Some(column) => {
                    table.require(column)?;
                    column.to_string()
                }
                None => existing
                    .filter(|c| table.has_column(c))
                    .or_else(|| {
                        table
                            .columns
                            .iter()
                            .find(|c| table.column_type(c) == ColumnType::String)
                            .cloned()
                    })
                    .ok_or_else(|| bad_request("Could not detect a document column; please specify one"))?,
            };
            Some(column)
        } else {
            None
        };

        let converted = ws.graph.node_mut(node).ok_or_else(|| not_found("Node not found"))?;
        converted.data_kind = kind;
        converted.is_lazy = kind.is_lazy();
        converted.document_column = document_column;
        converted.operation = Some(format!("convert_{}", target.route().replace('-', "_")));
        let name = converted.name.clone();
        ws.touch();
        Ok(MutationReceipt::for_node(node.clone(), name))
    }

    async fn filter_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &FilterSpec,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Filter).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace(workspace)?;
        let source = ws.node(node)?;
        let table = ws.table(node)?;
        for condition in &spec.conditions {
            table.require(&condition.column)?;
        }

        let rows = table
            .rows
            .iter()
            .filter(|row| match spec.logic {
                FilterLogic::And => spec.conditions.iter().all(|c| matches_condition(row, c)),
                FilterLogic::Or => spec.conditions.iter().any(|c| matches_condition(row, c)),
            })
            .cloned()
            .collect();
        let filtered = table.with_rows(rows);
        let name = spec
            .new_node_name
            .clone()
            .unwrap_or_else(|| format!("{}_filtered", source.name));
        let operation = Some(format!("filter({})", source.name));
        let (kind, document_column) = (source.data_kind, source.document_column.clone());
        state.add_node(workspace, &name, kind, document_column, operation, filtered, &[node])
    }

    async fn slice_node(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &SliceSpec,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Slice).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace(workspace)?;
        let source = ws.node(node)?;
        let table = ws.table(node)?;

        let len = table.rows.len();
        let start = (spec.start_row.unwrap_or(0) as usize).min(len);
        let end = spec.end_row.map(|e| e as usize).unwrap_or(len).clamp(start, len);
        let mut sliced = table.with_rows(table.rows[start..end].to_vec());

        if let Some(columns) = spec.columns.as_ref().filter(|c| !c.is_empty()) {
            for column in columns {
                table.require(column)?;
            }
            sliced.columns = columns.clone();
            sliced.types.retain(|c, _| columns.contains(c));
            for row in &mut sliced.rows {
                row.retain(|c, _| columns.contains(c));
            }
        }

        let name = spec
            .new_node_name
            .clone()
            .unwrap_or_else(|| format!("{}_sliced", source.name));
        let operation = Some(format!("slice({})", source.name));
        let document_column = source
            .document_column
            .clone()
            .filter(|c| sliced.has_column(c));
        let kind = match (source.data_kind, document_column.is_some()) {
            (DataKind::DocDataFrame, false) => DataKind::DataFrame,
            (DataKind::DocLazyFrame, false) => DataKind::LazyFrame,
            (kind, _) => kind,
        };
        state.add_node(workspace, &name, kind, document_column, operation, sliced, &[node])
    }

    async fn join_nodes(&self, workspace: &WorkspaceId, spec: &JoinSpec) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Join).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace(workspace)?;
        let (left, right) = match (ws.graph.node(&spec.left), ws.graph.node(&spec.right)) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(bad_request("One or both nodes not found")),
        };
        let (left_table, right_table) = (ws.table(&spec.left)?, ws.table(&spec.right)?);
        if spec.how != JoinHow::Cross {
            left_table.require(&spec.left_on)?;
            right_table.require(&spec.right_on)?;
        }

        let joined = join_tables(left_table, right_table, spec);
        let name = spec
            .new_node_name
            .clone()
            .unwrap_or_else(|| format!("{}_join_{}", left.name, right.name));
        let operation = Some(format!("join({}, {})", left.name, right.name));
        state.add_node(
            workspace,
            &name,
            DataKind::LazyFrame,
            None,
            operation,
            joined,
            &[&spec.left, &spec.right],
        )
    }

    async fn detach_concordance(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        spec: &DetachSpec,
    ) -> ClientResult<MutationReceipt> {
        self.enter(Endpoint::Detach).await?;
        let mut state = self.state.lock().await;
        let ws = state.workspace(workspace)?;
        let source = ws.node(node)?;
        let table = ws.table(node)?;
        table.require(&spec.column)?;
        if !source.data_kind.is_document() {
            return Err(bad_request(
                "This node does not support text analysis (not a document frame)",
            ));
        }

        let detached = concordance(table, spec)?;
        let name = spec
            .new_node_name
            .clone()
            .unwrap_or_else(|| format!("{}_conc_{}", source.name, spec.search_word));
        let (kind, document_column) = (source.data_kind, source.document_column.clone());
        state.add_node(
            workspace,
            &name,
            kind,
            document_column,
            Some("concordance_detach".to_string()),
            detached,
            &[node],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample() -> (LocalBackend, WorkspaceId, GraphSnapshot) {
        let backend = LocalBackend::with_sample_data();
        let ws = backend.current_workspace().await.unwrap().unwrap();
        let snapshot = backend.graph(&ws).await.unwrap();
        (backend, ws, snapshot)
    }

    fn id_of(snapshot: &GraphSnapshot, name: &str) -> NodeId {
        snapshot
            .nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.id.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_lazy_rows_hidden_until_shape_requested() {
        let (backend, ws, snapshot) = sample().await;
        let orders = id_of(&snapshot, "orders");
        assert_eq!(snapshot.node(&orders).unwrap().shape, Shape::new(None, 4));

        let report = backend.node_shape(&ws, &orders).await.unwrap();
        assert_eq!(report.shape, Shape::new(Some(8), 4));
        assert!(report.is_lazy && report.calculated);
    }

    #[tokio::test]
    async fn test_join_semantics() {
        let (backend, ws, snapshot) = sample().await;
        let spec = JoinSpec {
            how: JoinHow::Left,
            ..JoinSpec::on(id_of(&snapshot, "customers"), id_of(&snapshot, "reviews"), "customer_id")
        };
        let receipt = backend.join_nodes(&ws, &spec).await.unwrap();
        assert_eq!(receipt.node_name.as_deref(), Some("customers_join_reviews"));

        let joined = receipt.node_id.unwrap();
        let page = backend.node_data(&ws, &joined, 1, 100).await.unwrap();
        // Four customers, three of them reviewed once.
        assert_eq!(page.pagination.total_rows, 4);
        assert!(page.columns.contains(&"review_id".to_string()));
        assert!(!page.columns.contains(&"customer_id_right".to_string()));

        let after = backend.graph(&ws).await.unwrap();
        assert_eq!(after.parents(&joined).len(), 2);
        assert!(after.node(&joined).unwrap().is_lazy);
    }

    #[tokio::test]
    async fn test_filter_and_slice_defaults() {
        let (backend, ws, snapshot) = sample().await;
        let customers = id_of(&snapshot, "customers");

        let filter = FilterSpec {
            conditions: vec![FilterCondition {
                column: "region".into(),
                operator: FilterOperator::Equals,
                value: json!("north"),
            }],
            logic: FilterLogic::And,
            new_node_name: None,
        };
        let receipt = backend.filter_node(&ws, &customers, &filter).await.unwrap();
        assert_eq!(receipt.node_name.as_deref(), Some("customers_filtered"));
        let north = backend.node(&ws, &receipt.node_id.unwrap()).await.unwrap();
        assert_eq!(north.shape, Shape::new(Some(2), 3));

        let slice = SliceSpec {
            start_row: Some(1),
            end_row: Some(3),
            columns: Some(vec!["name".into()]),
            new_node_name: None,
        };
        let receipt = backend.slice_node(&ws, &customers, &slice).await.unwrap();
        let sliced = backend.node(&ws, &receipt.node_id.unwrap()).await.unwrap();
        assert_eq!(sliced.name, "customers_sliced");
        assert_eq!(sliced.shape, Shape::new(Some(2), 1));
    }

    #[tokio::test]
    async fn test_cast_and_convert_in_place() {
        let (backend, ws, snapshot) = sample().await;
        let orders = id_of(&snapshot, "orders");

        backend
            .cast_node(&ws, &orders, &CastSpec::new("placed", CastTarget::Datetime))
            .await
            .unwrap();
        let node = backend.node(&ws, &orders).await.unwrap();
        assert_eq!(node.schema["placed"], ColumnType::Datetime);

        let err = backend
            .cast_node(&ws, &orders, &CastSpec::new("missing", CastTarget::Number))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 400, .. }));

        backend.convert_node(&ws, &orders, &ConvertTarget::DataFrame).await.unwrap();
        let node = backend.node(&ws, &orders).await.unwrap();
        assert_eq!(node.id, orders);
        assert!(!node.is_lazy);
    }

    #[tokio::test]
    async fn test_concordance_detach() {
        let (backend, ws, snapshot) = sample().await;
        let reviews = id_of(&snapshot, "reviews");

        let receipt = backend
            .detach_concordance(&ws, &reviews, &DetachSpec::new("text", "tax"))
            .await
            .unwrap();
        assert_eq!(receipt.node_name.as_deref(), Some("reviews_conc_tax"));
        let page = backend
            .node_data(&ws, &receipt.node_id.unwrap(), 1, 10)
            .await
            .unwrap();
        assert_eq!(page.pagination.total_rows, 3);
        assert_eq!(page.data[2]["matched_text"], "Tax");
        assert_eq!(page.data[2]["r1"], "was");
        assert!(page.data[1]["matched_text"].is_null());

        let err = backend
            .detach_concordance(&ws, &id_of(&snapshot, "customers"), &DetachSpec::new("name", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_injected_faults_are_counted_and_consumed() {
        let (backend, ws, _) = sample().await;
        backend.fail_next(Endpoint::Graph, ClientError::Network("down".into()), 1);

        assert!(backend.graph(&ws).await.is_err());
        assert!(backend.graph(&ws).await.is_ok());
        // One call from `sample` plus two here.
        assert_eq!(backend.calls(Endpoint::Graph), 3);
    }

    #[tokio::test]
    async fn test_delete_removes_incident_edges() {
        let (backend, ws, snapshot) = sample().await;
        let customers = id_of(&snapshot, "customers");
        let sliced = backend
            .slice_node(&ws, &customers, &SliceSpec::default())
            .await
            .unwrap()
            .node_id
            .unwrap();

        backend.delete_node(&ws, &customers).await.unwrap();
        let after = backend.graph(&ws).await.unwrap();
        assert!(!after.contains(&customers));
        assert!(after.edges.is_empty());
        assert!(after.contains(&sliced));

        let err = backend.delete_node(&ws, &customers).await.unwrap_err();
        assert_eq!(err, not_found("Node not found"));
    }
}

//! Heap snapshot graph engine.
//!
//! [`HeapSnapshot`] owns the flat node and edge arrays parsed by the
//! loader and builds every derived index needed for analysis: per-node
//! edge ranges, the reverse (retainer) index, shortest distances from the
//! GC roots, a dominator tree, retained sizes, the dominated-nodes index,
//! per-class aggregates, snapshot diffs and name search.
//!
//! Nodes and edges are addressed by raw indexes into the flat arrays; the
//! [`crate::cursor`] module wraps those indexes in cheap copyable views.
//! V8-specific behavior (node flags, distance filtering, heap statistics)
//! is factored behind the [`SnapshotRules`] trait so the generic graph
//! machinery stays engine-agnostic.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::allocation::{
    AllocationNodeCallers, AllocationProfile, AllocationStackFrame, LiveObjectStats,
    SerializedAllocationNode,
};
use crate::cursor::{HeapEdge, HeapNode};
use crate::loader::{Profile, Progress};
use crate::providers::{lower_bound, EdgesProvider, NodesProvider};

/// Distance assigned to nodes only reachable through the synthetic root,
/// i.e. not retained by any user object.
pub const BASE_SYSTEM_DISTANCE: i32 = 100_000_000;

/// Distance of nodes the breadth-first traversal never reached.
pub const NO_DISTANCE: i32 = -5;

pub const NODE_FLAG_CAN_BE_QUERIED: u32 = 1;
pub const NODE_FLAG_DETACHED_DOM_TREE_NODE: u32 = 2;
pub const NODE_FLAG_PAGE_OBJECT: u32 = 4;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("incomplete input: {0}")]
    IncompleteInput(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

// ============================================================================
// Problem reporting
// ============================================================================

/// Collects non-fatal inconsistencies found while building indexes.
/// Reports are capped so a degenerate snapshot cannot flood the log.
struct ProblemReport {
    title: String,
    errors: Vec<String>,
}

impl ProblemReport {
    fn new(title: String) -> Self {
        ProblemReport {
            title,
            errors: Vec::new(),
        }
    }

    fn add(&mut self, error: String) {
        if self.errors.len() <= 100 {
            self.errors.push(error);
        }
    }

    fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ProblemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Analysis data model
// ============================================================================

/// Per-class summary of all instances of one class.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub count: u32,
    pub distance: i32,
    #[serde(rename = "self")]
    pub self_size: u64,
    #[serde(rename = "maxRet")]
    pub max_ret: f64,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: Option<String>,
    pub idxs: Vec<u32>,
}

/// Slim per-class form used to diff two snapshots: the instance node
/// indexes with their ids and self sizes, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct AggregateForDiff {
    pub indexes: Vec<u32>,
    pub ids: Vec<u32>,
    pub self_sizes: Vec<u64>,
}

/// Per-class delta between a base snapshot and this one.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub added_count: u32,
    pub removed_count: u32,
    pub added_size: u64,
    pub removed_size: u64,
    pub count_delta: i64,
    pub size_delta: i64,
    #[serde(skip)]
    pub added_indexes: Vec<u32>,
    #[serde(skip)]
    pub deleted_indexes: Vec<u32>,
}

/// High-level memory breakdown of the whole snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub total: f64,
    #[serde(rename = "v8heap")]
    pub v8_heap: f64,
    pub native: u64,
    pub code: u64,
    #[serde(rename = "jsArrays")]
    pub js_arrays: u64,
    pub strings: u64,
    pub system: u64,
}

/// Summary facts a client needs before issuing any query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticData {
    pub node_count: u32,
    pub root_node_index: u32,
    pub total_size: f64,
    #[serde(rename = "maxJSObjectId")]
    pub max_js_object_id: u32,
}

/// Allocation timeline samples, rebucketed by the node id intervals the
/// profiler assigned between sample timestamps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Samples {
    pub timestamps: Vec<f64>,
    pub last_assigned_ids: Vec<u64>,
    pub sizes: Vec<u64>,
}

/// Source position of an object's allocation site.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: u32,
    pub line_number: u32,
    pub column_number: u32,
}

/// Restricts aggregate and search results to a subset of the nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    pub min_node_id: Option<u32>,
    pub max_node_id: Option<u32>,
    pub allocation_node_id: Option<u32>,
}

impl NodeFilter {
    /// Cache key for aggregates computed under this filter.
    pub fn key(&self) -> String {
        if let Some(id) = self.allocation_node_id {
            return format!("AllocationNodeId: {id}");
        }
        if let (Some(min), Some(max)) = (self.min_node_id, self.max_node_id) {
            return format!("NodeIdRange: {min}..{max}");
        }
        "allObjects".to_string()
    }
}

/// A name search request over the snapshot's string table.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub query: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
}

// ============================================================================
// Engine-specific rules
// ============================================================================

/// Heap-engine-specific behavior hooks. The graph algorithms (retainers,
/// distances, dominators, aggregates) are generic; what counts as a user
/// root, which edges to ignore when measuring distances, and how to bucket
/// statistics depends on the producing VM.
pub trait SnapshotRules {
    /// Whether `edge`, leaving `node`, participates in distance
    /// calculation. Weak edges are already excluded by the traversal.
    fn keep_edge_in_distances(&self, _node: HeapNode<'_>, _edge: HeapEdge<'_>) -> bool {
        true
    }

    /// Whether `node` is an entry point for user-reachable objects.
    fn is_user_root(&self, node: HeapNode<'_>) -> bool {
        !node.is_root()
    }

    /// Computes per-node flag bitmaps. An empty vector means the engine
    /// has no flags and flag-based edge skipping is disabled.
    fn calculate_flags(&self, _snapshot: &HeapSnapshot) -> Vec<u32> {
        Vec::new()
    }

    /// The flag bit marking user (page-owned) objects, if any. Used to
    /// keep debugger-retained objects from perturbing dominators.
    fn user_object_flag(&self) -> Option<u32> {
        None
    }

    /// Whole-snapshot memory breakdown.
    fn calculate_statistics(&self, _snapshot: &HeapSnapshot) -> Statistics {
        Statistics::default()
    }
}

/// Rules for snapshots produced by V8.
pub struct V8Rules;

impl SnapshotRules for V8Rules {
    fn keep_edge_in_distances(&self, node: HeapNode<'_>, edge: HeapEdge<'_>) -> bool {
        if node.is_hidden() {
            return edge.name() != "sloppy_function_map" || node.raw_name() != "system / NativeContext";
        }
        if node.is_array() {
            // DescriptorArrays share entries between maps; only the (weakly
            // held) first two header slots and every third payload slot
            // hold strong references worth following.
            if node.raw_name() != "(map descriptors)" {
                return true;
            }
            return match edge.index_name() {
                Some(index) => index < 2 || index % 3 != 1,
                None => true,
            };
        }
        true
    }

    fn is_user_root(&self, node: HeapNode<'_>) -> bool {
        node.is_user_root() || node.is_document_dom_trees_root()
    }

    fn calculate_flags(&self, snapshot: &HeapSnapshot) -> Vec<u32> {
        let mut flags = vec![0u32; snapshot.node_count];
        mark_detached_dom_tree_nodes(snapshot, &mut flags);
        mark_queriable_heap_objects(snapshot, &mut flags);
        mark_page_owned_nodes(snapshot, &mut flags);
        flags
    }

    fn user_object_flag(&self) -> Option<u32> {
        Some(NODE_FLAG_PAGE_OBJECT)
    }

    fn calculate_statistics(&self, snapshot: &HeapSnapshot) -> Statistics {
        let mut native = 0u64;
        let mut code = 0u64;
        let mut strings = 0u64;
        let mut js_arrays = 0u64;
        let mut system = 0u64;
        for ordinal in 0..snapshot.node_count {
            let node = snapshot.node_by_ordinal(ordinal);
            let node_size = node.self_size();
            if snapshot.node_distances[ordinal] >= BASE_SYSTEM_DISTANCE {
                system += node_size;
                continue;
            }
            let node_type = Some(node.raw_type());
            if node.is_native() {
                native += node_size;
            } else if node.is_code() {
                code += node_size;
            } else if node_type == snapshot.node_cons_string_type
                || node_type == snapshot.node_sliced_string_type
                || node_type == snapshot.node_string_type
            {
                strings += node_size;
            } else if node.name() == "Array" {
                js_arrays += snapshot.calculate_array_size(node);
            }
        }
        let total = snapshot.total_size;
        Statistics {
            total,
            v8_heap: total - native as f64,
            native,
            code,
            js_arrays,
            strings,
            system,
        }
    }
}

fn mark_detached_dom_tree_nodes(snapshot: &HeapSnapshot, flags: &mut [u32]) {
    for ordinal in 0..snapshot.node_count {
        let node = snapshot.node_by_ordinal(ordinal);
        if node.is_native() && node.name().starts_with("Detached ") {
            flags[ordinal] |= NODE_FLAG_DETACHED_DOM_TREE_NODE;
        }
    }
}

fn mark_queriable_heap_objects(snapshot: &HeapSnapshot, flags: &mut [u32]) {
    // User objects reachable from window objects without traversing
    // hidden, invisible, internal or weak edges can be inspected live.
    let flag = NODE_FLAG_CAN_BE_QUERIED;
    let mut list: Vec<usize> = Vec::new();
    for edge in snapshot.root().edges() {
        let node = edge.node();
        if node.is_user_root() {
            list.push(node.ordinal());
        }
    }
    while let Some(node_ordinal) = list.pop() {
        if flags[node_ordinal] & flag != 0 {
            continue;
        }
        flags[node_ordinal] |= flag;
        let begin = snapshot.first_edge_indexes[node_ordinal] as usize;
        let end = snapshot.first_edge_indexes[node_ordinal + 1] as usize;
        let mut edge_index = begin;
        while edge_index < end {
            let edge_type = Some(snapshot.containment_edges[edge_index + snapshot.edge_type_offset]);
            let child_index =
                snapshot.containment_edges[edge_index + snapshot.edge_to_node_offset] as usize;
            let child_ordinal = child_index / snapshot.node_field_count;
            edge_index += snapshot.edge_field_count;
            if flags[child_ordinal] & flag != 0 {
                continue;
            }
            if edge_type == snapshot.edge_hidden_type
                || edge_type == snapshot.edge_invisible_type
                || edge_type == snapshot.edge_internal_type
                || edge_type == snapshot.edge_weak_type
            {
                continue;
            }
            list.push(child_ordinal);
        }
    }
}

fn mark_page_owned_nodes(snapshot: &HeapSnapshot, flags: &mut [u32]) {
    // Entry points are the window objects (shortcut edges from the root)
    // and the document DOM tree roots (element edges to that synthetic
    // grouping node).
    let flag = NODE_FLAG_PAGE_OBJECT;
    let root_ordinal = snapshot.root_ordinal();
    let mut stack: Vec<usize> = Vec::new();
    let begin = snapshot.first_edge_indexes[root_ordinal] as usize;
    let end = snapshot.first_edge_indexes[root_ordinal + 1] as usize;
    let mut edge_index = begin;
    while edge_index < end {
        let edge_type = Some(snapshot.containment_edges[edge_index + snapshot.edge_type_offset]);
        let node_index = snapshot.containment_edges[edge_index + snapshot.edge_to_node_offset];
        edge_index += snapshot.edge_field_count;
        let owned = if edge_type == snapshot.edge_element_type {
            snapshot.node(node_index).is_document_dom_trees_root()
        } else {
            edge_type == snapshot.edge_shortcut_type
        };
        if owned {
            let ordinal = node_index as usize / snapshot.node_field_count;
            stack.push(ordinal);
            flags[ordinal] |= flag;
        }
    }
    while let Some(node_ordinal) = stack.pop() {
        let begin = snapshot.first_edge_indexes[node_ordinal] as usize;
        let end = snapshot.first_edge_indexes[node_ordinal + 1] as usize;
        let mut edge_index = begin;
        while edge_index < end {
            let edge_type = Some(snapshot.containment_edges[edge_index + snapshot.edge_type_offset]);
            let child_index =
                snapshot.containment_edges[edge_index + snapshot.edge_to_node_offset] as usize;
            let child_ordinal = child_index / snapshot.node_field_count;
            edge_index += snapshot.edge_field_count;
            if flags[child_ordinal] & flag != 0 {
                continue;
            }
            if edge_type == snapshot.edge_weak_type {
                continue;
            }
            flags[child_ordinal] |= flag;
            stack.push(child_ordinal);
        }
    }
}

// ============================================================================
// The snapshot
// ============================================================================

struct LocationLayout {
    field_count: usize,
    object_index: usize,
    script_id: usize,
    line: usize,
    column: usize,
}

/// A fully indexed heap snapshot, ready to be queried.
pub struct HeapSnapshot {
    pub(crate) nodes: Vec<u32>,
    pub(crate) containment_edges: Vec<u32>,
    pub(crate) strings: Vec<String>,
    pub(crate) node_types: Vec<String>,
    pub(crate) edge_types: Vec<String>,

    pub(crate) node_field_count: usize,
    pub(crate) node_type_offset: usize,
    pub(crate) node_name_offset: usize,
    pub(crate) node_id_offset: usize,
    pub(crate) node_self_size_offset: usize,
    pub(crate) node_edge_count_offset: usize,
    pub(crate) node_trace_node_id_offset: Option<usize>,

    pub(crate) edge_field_count: usize,
    pub(crate) edge_type_offset: usize,
    pub(crate) edge_name_offset: usize,
    pub(crate) edge_to_node_offset: usize,

    pub(crate) node_object_type: Option<u32>,
    pub(crate) node_native_type: Option<u32>,
    pub(crate) node_hidden_type: Option<u32>,
    pub(crate) node_array_type: Option<u32>,
    pub(crate) node_code_type: Option<u32>,
    pub(crate) node_synthetic_type: Option<u32>,
    pub(crate) node_cons_string_type: Option<u32>,
    pub(crate) node_sliced_string_type: Option<u32>,
    pub(crate) node_string_type: Option<u32>,

    pub(crate) edge_element_type: Option<u32>,
    pub(crate) edge_hidden_type: Option<u32>,
    pub(crate) edge_internal_type: Option<u32>,
    pub(crate) edge_shortcut_type: Option<u32>,
    pub(crate) edge_weak_type: Option<u32>,
    pub(crate) edge_invisible_type: Option<u32>,

    pub(crate) node_count: usize,
    pub(crate) root_node_index: u32,
    pub(crate) total_size: f64,
    pub(crate) max_node_id: u32,

    pub(crate) first_edge_indexes: Vec<u32>,
    pub(crate) retaining_nodes: Vec<u32>,
    pub(crate) retaining_edges: Vec<u32>,
    pub(crate) first_retainer_index: Vec<u32>,
    pub(crate) node_distances: Vec<i32>,
    pub(crate) dominators_tree: Vec<u32>,
    pub(crate) retained_sizes: Vec<f64>,
    pub(crate) first_dominated_node_index: Vec<u32>,
    pub(crate) dominated_nodes: Vec<u32>,
    pub(crate) node_flags: Vec<u32>,

    statistics: Statistics,
    samples: Option<Samples>,
    location_map: HashMap<u32, Location>,
    allocation_profile: Option<RefCell<AllocationProfile>>,

    rules: Box<dyn SnapshotRules>,

    aggregates_cache: RefCell<HashMap<String, HashMap<String, Aggregate>>>,
    aggregates_sorted_flags: RefCell<HashMap<String, bool>>,
    aggregates_for_diff_cache: RefCell<Option<HashMap<String, AggregateForDiff>>>,
    snapshot_diffs: RefCell<HashMap<u32, HashMap<String, Diff>>>,
    lazy_string_cache: RefCell<HashMap<u32, String>>,
}

fn field_offset(fields: &[String], name: &str) -> Result<usize> {
    fields.iter().position(|f| f == name).ok_or_else(|| {
        SnapshotError::InvalidSnapshot(format!("snapshot meta is missing the {name} field"))
    })
}

fn type_strings(types: &[serde_json::Value], what: &str) -> Result<Vec<String>> {
    let list: Vec<String> = types
        .first()
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if list.is_empty() {
        return Err(SnapshotError::InvalidSnapshot(format!(
            "snapshot meta has no {what} type names"
        )));
    }
    Ok(list)
}

fn type_index(types: &[String], name: &str) -> Option<u32> {
    types.iter().position(|t| t == name).map(|i| i as u32)
}

fn status(progress: &mut dyn Progress, message: &str) {
    tracing::debug!("{message}");
    progress.update_status(message);
}

impl HeapSnapshot {
    /// Builds a snapshot with the default V8 rules.
    pub fn new(profile: Profile, progress: &mut dyn Progress) -> Result<Self> {
        Self::with_rules(profile, progress, Box::new(V8Rules))
    }

    pub fn with_rules(
        profile: Profile,
        progress: &mut dyn Progress,
        rules: Box<dyn SnapshotRules>,
    ) -> Result<Self> {
        let Profile {
            header,
            nodes,
            edges,
            trace_function_infos,
            trace_tree,
            samples: raw_samples,
            locations: raw_locations,
            strings,
        } = profile;
        let meta = header.meta;

        let node_field_count = meta.node_fields.len();
        let edge_field_count = meta.edge_fields.len();
        if nodes.is_empty() {
            return Err(SnapshotError::InvalidSnapshot("snapshot has no nodes".into()));
        }
        if nodes.len() % node_field_count != 0 {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "nodes array length {} is not a multiple of the {} node fields",
                nodes.len(),
                node_field_count
            )));
        }
        if edges.len() % edge_field_count != 0 {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "edges array length {} is not a multiple of the {} edge fields",
                edges.len(),
                edge_field_count
            )));
        }
        let node_count = nodes.len() / node_field_count;

        let node_types = type_strings(&meta.node_types, "node")?;
        let mut edge_types = type_strings(&meta.edge_types, "edge")?;
        // The invisible type is synthesized by analyzers, never emitted.
        edge_types.push("invisible".to_string());

        let root_node_index = header.root_index;
        if root_node_index as usize >= nodes.len()
            || root_node_index as usize % node_field_count != 0
        {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "root node index {root_node_index} is out of bounds or misaligned"
            )));
        }

        let node_id_offset = field_offset(&meta.node_fields, "id")?;
        // JS objects carry odd ids; even ids belong to native objects and
        // are excluded from the id range clients page over.
        let mut max_node_id = 0u32;
        let mut field_index = node_id_offset;
        while field_index < nodes.len() {
            let id = nodes[field_index];
            if id % 2 == 1 {
                max_node_id = max_node_id.max(id);
            }
            field_index += node_field_count;
        }

        let location_layout = if meta.location_fields.is_empty() {
            None
        } else {
            Some(LocationLayout {
                field_count: meta.location_fields.len(),
                object_index: field_offset(&meta.location_fields, "object_index")?,
                script_id: field_offset(&meta.location_fields, "script_id")?,
                line: field_offset(&meta.location_fields, "line")?,
                column: field_offset(&meta.location_fields, "column")?,
            })
        };

        let mut snapshot = HeapSnapshot {
            node_type_offset: field_offset(&meta.node_fields, "type")?,
            node_name_offset: field_offset(&meta.node_fields, "name")?,
            node_id_offset,
            node_self_size_offset: field_offset(&meta.node_fields, "self_size")?,
            node_edge_count_offset: field_offset(&meta.node_fields, "edge_count")?,
            node_trace_node_id_offset: meta
                .node_fields
                .iter()
                .position(|f| f == "trace_node_id"),
            edge_type_offset: field_offset(&meta.edge_fields, "type")?,
            edge_name_offset: field_offset(&meta.edge_fields, "name_or_index")?,
            edge_to_node_offset: field_offset(&meta.edge_fields, "to_node")?,
            node_object_type: type_index(&node_types, "object"),
            node_native_type: type_index(&node_types, "native"),
            node_hidden_type: type_index(&node_types, "hidden"),
            node_array_type: type_index(&node_types, "array"),
            node_code_type: type_index(&node_types, "code"),
            node_synthetic_type: type_index(&node_types, "synthetic"),
            node_cons_string_type: type_index(&node_types, "concatenated string"),
            node_sliced_string_type: type_index(&node_types, "sliced string"),
            node_string_type: type_index(&node_types, "string"),
            edge_element_type: type_index(&edge_types, "element"),
            edge_hidden_type: type_index(&edge_types, "hidden"),
            edge_internal_type: type_index(&edge_types, "internal"),
            edge_shortcut_type: type_index(&edge_types, "shortcut"),
            edge_weak_type: type_index(&edge_types, "weak"),
            edge_invisible_type: type_index(&edge_types, "invisible"),
            nodes,
            containment_edges: edges,
            strings,
            node_types,
            edge_types,
            node_field_count,
            edge_field_count,
            node_count,
            root_node_index,
            total_size: 0.0,
            max_node_id,
            first_edge_indexes: Vec::new(),
            retaining_nodes: Vec::new(),
            retaining_edges: Vec::new(),
            first_retainer_index: Vec::new(),
            node_distances: Vec::new(),
            dominators_tree: Vec::new(),
            retained_sizes: Vec::new(),
            first_dominated_node_index: Vec::new(),
            dominated_nodes: Vec::new(),
            node_flags: Vec::new(),
            statistics: Statistics::default(),
            samples: None,
            location_map: HashMap::new(),
            allocation_profile: None,
            rules,
            aggregates_cache: RefCell::new(HashMap::new()),
            aggregates_sorted_flags: RefCell::new(HashMap::new()),
            aggregates_for_diff_cache: RefCell::new(None),
            snapshot_diffs: RefCell::new(HashMap::new()),
            lazy_string_cache: RefCell::new(HashMap::new()),
        };

        snapshot.initialize(progress, &raw_samples, &raw_locations, location_layout.as_ref())?;

        if snapshot.node_trace_node_id_offset.is_some() && !trace_function_infos.is_empty() {
            status(progress, "Building allocation profile");
            let live = snapshot.collect_live_object_stats();
            let allocation_profile = AllocationProfile::new(
                &meta.trace_function_info_fields,
                &meta.trace_node_fields,
                &trace_function_infos,
                &trace_tree,
                &snapshot.strings,
                &live,
            )?;
            snapshot.allocation_profile = Some(RefCell::new(allocation_profile));
        }

        status(progress, "Finished processing.");
        Ok(snapshot)
    }

    fn initialize(
        &mut self,
        progress: &mut dyn Progress,
        raw_samples: &[u64],
        raw_locations: &[u32],
        location_layout: Option<&LocationLayout>,
    ) -> Result<()> {
        status(progress, "Building edge indexes");
        self.build_edge_indexes()?;
        status(progress, "Building retainers");
        self.build_retainers()?;
        status(progress, "Calculating node flags");
        let flags = self.rules.calculate_flags(self);
        self.node_flags = flags;
        status(progress, "Calculating distances");
        self.calculate_distances()?;
        status(progress, "Building postorder index");
        let (post_order_to_ordinal, ordinal_to_post_order) = self.build_post_order_index(progress)?;
        status(progress, "Building dominator tree");
        self.dominators_tree =
            self.build_dominator_tree(&post_order_to_ordinal, &ordinal_to_post_order);
        status(progress, "Calculating retained sizes");
        self.calculate_retained_sizes(&post_order_to_ordinal);
        self.total_size = self.retained_sizes[self.root_ordinal()];
        status(progress, "Building dominated nodes");
        self.build_dominated_nodes()?;
        status(progress, "Calculating statistics");
        let statistics = self.rules.calculate_statistics(self);
        self.statistics = statistics;
        status(progress, "Building samples");
        self.build_samples(raw_samples);
        status(progress, "Building locations");
        if let Some(layout) = location_layout {
            self.build_location_map(raw_locations, layout);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Basic accessors
    // ------------------------------------------------------------------

    pub fn root(&self) -> HeapNode<'_> {
        HeapNode::new(self, self.root_node_index)
    }

    /// Cursor over the node starting at `node_index` in the flat array.
    pub fn node(&self, node_index: u32) -> HeapNode<'_> {
        HeapNode::new(self, node_index)
    }

    pub fn node_by_ordinal(&self, ordinal: usize) -> HeapNode<'_> {
        HeapNode::new(self, (ordinal * self.node_field_count) as u32)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn edge_count(&self) -> usize {
        self.containment_edges.len() / self.edge_field_count
    }

    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    pub fn max_node_id(&self) -> u32 {
        self.max_node_id
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn samples(&self) -> Option<&Samples> {
        self.samples.as_ref()
    }

    /// Allocation site of the object at `node_index`, if the profiler
    /// recorded one.
    pub fn location(&self, node_index: u32) -> Option<Location> {
        self.location_map.get(&node_index).copied()
    }

    pub fn static_data(&self) -> StaticData {
        StaticData {
            node_count: self.node_count as u32,
            root_node_index: self.root_node_index,
            total_size: self.total_size,
            max_js_object_id: self.max_node_id,
        }
    }

    pub(crate) fn root_ordinal(&self) -> usize {
        self.root_node_index as usize / self.node_field_count
    }

    // ------------------------------------------------------------------
    // Index building
    // ------------------------------------------------------------------

    fn build_edge_indexes(&mut self) -> Result<()> {
        let mut first_edge_indexes = vec![0u32; self.node_count + 1];
        let mut edge_index = 0usize;
        for ordinal in 0..self.node_count {
            first_edge_indexes[ordinal] = edge_index as u32;
            let edge_count =
                self.nodes[ordinal * self.node_field_count + self.node_edge_count_offset] as usize;
            edge_index += edge_count * self.edge_field_count;
        }
        if edge_index != self.containment_edges.len() {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "node edge counts sum to {} edge fields, but the edges array has {}",
                edge_index,
                self.containment_edges.len()
            )));
        }
        first_edge_indexes[self.node_count] = self.containment_edges.len() as u32;
        self.first_edge_indexes = first_edge_indexes;
        Ok(())
    }

    fn build_retainers(&mut self) -> Result<()> {
        let edge_total = self.containment_edges.len() / self.edge_field_count;
        let mut retaining_nodes = vec![0u32; edge_total];
        let mut retaining_edges = vec![0u32; edge_total];
        let mut first_retainer_index = vec![0u32; self.node_count + 1];

        let mut to_node_field = self.edge_to_node_offset;
        while to_node_field < self.containment_edges.len() {
            let to_node_index = self.containment_edges[to_node_field] as usize;
            if to_node_index % self.node_field_count != 0 || to_node_index >= self.nodes.len() {
                return Err(SnapshotError::InvalidSnapshot(format!(
                    "invalid to_node index {to_node_index}"
                )));
            }
            first_retainer_index[to_node_index / self.node_field_count] += 1;
            to_node_field += self.edge_field_count;
        }

        // First slot of each bucket temporarily holds the entry count and
        // is decremented as the bucket fills.
        let mut first_unused_slot = 0u32;
        for ordinal in 0..self.node_count {
            let retainers_count = first_retainer_index[ordinal];
            first_retainer_index[ordinal] = first_unused_slot;
            if (first_unused_slot as usize) < retaining_nodes.len() {
                retaining_nodes[first_unused_slot as usize] = retainers_count;
            }
            first_unused_slot += retainers_count;
        }
        first_retainer_index[self.node_count] = retaining_nodes.len() as u32;

        for src_ordinal in 0..self.node_count {
            let first_edge = self.first_edge_indexes[src_ordinal] as usize;
            let next_first_edge = self.first_edge_indexes[src_ordinal + 1] as usize;
            let src_node_index = (src_ordinal * self.node_field_count) as u32;
            let mut edge_index = first_edge;
            while edge_index < next_first_edge {
                let to_node_index =
                    self.containment_edges[edge_index + self.edge_to_node_offset] as usize;
                let first_slot = first_retainer_index[to_node_index / self.node_field_count];
                retaining_nodes[first_slot as usize] -= 1;
                let slot = first_slot + retaining_nodes[first_slot as usize];
                retaining_nodes[slot as usize] = src_node_index;
                retaining_edges[slot as usize] = edge_index as u32;
                edge_index += self.edge_field_count;
            }
        }

        self.retaining_nodes = retaining_nodes;
        self.retaining_edges = retaining_edges;
        self.first_retainer_index = first_retainer_index;
        Ok(())
    }

    fn calculate_distances(&mut self) -> Result<()> {
        let mut distances = vec![NO_DISTANCE; self.node_count];
        let mut queue: Vec<u32> = Vec::with_capacity(self.node_count);

        // Pass one: seed every user root at distance 1 so user objects get
        // distances unaffected by the synthetic root plumbing.
        for edge in self.root().edges() {
            let node = edge.node();
            if self.rules.is_user_root(node) && distances[node.ordinal()] == NO_DISTANCE {
                distances[node.ordinal()] = 1;
                queue.push(node.node_index);
            }
        }
        let had_user_roots = !queue.is_empty();
        self.bfs(&mut queue, &mut distances)?;

        // Pass two: everything else hangs off the root at system distances.
        let root_ordinal = self.root_ordinal();
        distances[root_ordinal] = if had_user_roots { BASE_SYSTEM_DISTANCE } else { 0 };
        queue.clear();
        queue.push(self.root_node_index);
        self.bfs(&mut queue, &mut distances)?;

        self.node_distances = distances;
        Ok(())
    }

    fn bfs(&self, queue: &mut Vec<u32>, distances: &mut [i32]) -> Result<()> {
        let mut index = 0;
        while index < queue.len() {
            let node_index = queue[index];
            index += 1;
            let ordinal = node_index as usize / self.node_field_count;
            let distance = distances[ordinal] + 1;
            let node = self.node(node_index);
            let begin = self.first_edge_indexes[ordinal] as usize;
            let end = self.first_edge_indexes[ordinal + 1] as usize;
            let mut edge_index = begin;
            while edge_index < end {
                let current = edge_index;
                edge_index += self.edge_field_count;
                let edge_type = self.containment_edges[current + self.edge_type_offset];
                if Some(edge_type) == self.edge_weak_type {
                    continue;
                }
                let child_node_index = self.containment_edges[current + self.edge_to_node_offset];
                let child_ordinal = child_node_index as usize / self.node_field_count;
                if distances[child_ordinal] != NO_DISTANCE {
                    continue;
                }
                let edge = HeapEdge::new(self, current as u32);
                if !self.rules.keep_edge_in_distances(node, edge) {
                    continue;
                }
                distances[child_ordinal] = distance;
                queue.push(child_node_index);
            }
        }
        if queue.len() > self.node_count {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "BFS visited {} entries for {} nodes",
                queue.len(),
                self.node_count
            )));
        }
        Ok(())
    }

    fn is_essential_edge(&self, source_node_index: u32, edge_type: u32) -> bool {
        // Shortcut edges at the root only mark user global objects; weak
        // edges never keep their target alive.
        Some(edge_type) != self.edge_weak_type
            && (Some(edge_type) != self.edge_shortcut_type
                || source_node_index == self.root_node_index)
    }

    fn has_only_weak_retainers(&self, node_ordinal: usize) -> bool {
        let begin = self.first_retainer_index[node_ordinal] as usize;
        let end = self.first_retainer_index[node_ordinal + 1] as usize;
        for retainer_index in begin..end {
            let retainer_edge_index = self.retaining_edges[retainer_index] as usize;
            let edge_type =
                Some(self.containment_edges[retainer_edge_index + self.edge_type_offset]);
            if edge_type != self.edge_weak_type && edge_type != self.edge_shortcut_type {
                return false;
            }
        }
        true
    }

    fn flagged(&self, flag: Option<u32>, ordinal: usize) -> bool {
        match flag {
            Some(f) => self.node_flags[ordinal] & f != 0,
            None => true,
        }
    }

    fn build_post_order_index(
        &self,
        progress: &mut dyn Progress,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let node_count = self.node_count;
        let root_ordinal = self.root_ordinal();
        let flag = self
            .rules
            .user_object_flag()
            .filter(|_| !self.node_flags.is_empty());

        let mut stack_nodes = vec![0u32; node_count];
        let mut stack_current_edge = vec![0u32; node_count];
        let mut post_order_to_ordinal = vec![0u32; node_count];
        let mut ordinal_to_post_order = vec![0u32; node_count];
        let mut visited = vec![false; node_count];
        let mut post_order_index = 0usize;

        let mut stack_top: isize = 0;
        stack_nodes[0] = root_ordinal as u32;
        stack_current_edge[0] = self.first_edge_indexes[root_ordinal];
        visited[root_ordinal] = true;

        let mut iteration = 0;
        loop {
            iteration += 1;
            while stack_top >= 0 {
                let top = stack_top as usize;
                let node_ordinal = stack_nodes[top] as usize;
                let edge_index = stack_current_edge[top] as usize;
                let edges_end = self.first_edge_indexes[node_ordinal + 1] as usize;

                if edge_index < edges_end {
                    stack_current_edge[top] += self.edge_field_count as u32;
                    let edge_type = self.containment_edges[edge_index + self.edge_type_offset];
                    if !self.is_essential_edge(
                        (node_ordinal * self.node_field_count) as u32,
                        edge_type,
                    ) {
                        continue;
                    }
                    let child_node_index =
                        self.containment_edges[edge_index + self.edge_to_node_offset] as usize;
                    let child_ordinal = child_node_index / self.node_field_count;
                    if visited[child_ordinal] {
                        continue;
                    }
                    // Skip edges from non-page-owned nodes to page-owned
                    // nodes so debugger-retained objects do not change
                    // the dominators of page objects.
                    if node_ordinal != root_ordinal
                        && self.flagged(flag, child_ordinal)
                        && !self.flagged(flag, node_ordinal)
                    {
                        continue;
                    }
                    stack_top += 1;
                    let top = stack_top as usize;
                    stack_nodes[top] = child_ordinal as u32;
                    stack_current_edge[top] = self.first_edge_indexes[child_ordinal];
                    visited[child_ordinal] = true;
                } else {
                    ordinal_to_post_order[node_ordinal] = post_order_index as u32;
                    post_order_to_ordinal[post_order_index] = node_ordinal as u32;
                    post_order_index += 1;
                    stack_top -= 1;
                }
            }

            if post_order_index == node_count || iteration > 1 {
                break;
            }
            let mut errors = ProblemReport::new(format!(
                "Heap snapshot: {} nodes are unreachable from the root. Following nodes have only weak retainers:",
                node_count - post_order_index
            ));
            // Drop the root from the order and put it at the bottom of the
            // stack with its edges exhausted, so after traversing the
            // orphan subgraphs it is re-emitted last.
            post_order_index -= 1;
            stack_top = 0;
            stack_nodes[0] = root_ordinal as u32;
            stack_current_edge[0] = self.first_edge_indexes[root_ordinal + 1];
            for ordinal in 0..node_count {
                if visited[ordinal] || !self.has_only_weak_retainers(ordinal) {
                    continue;
                }
                stack_top += 1;
                let top = stack_top as usize;
                stack_nodes[top] = ordinal as u32;
                stack_current_edge[top] = self.first_edge_indexes[ordinal];
                visited[ordinal] = true;
                let node = self.node_by_ordinal(ordinal);
                let retainers: Vec<String> = node
                    .retainers()
                    .map(|retainer| {
                        let retaining_node = retainer.node();
                        format!(
                            "{}@{}.{}",
                            retaining_node.name(),
                            retaining_node.id(),
                            retainer.name()
                        )
                    })
                    .collect();
                errors.add(format!(
                    "{} @{} weak retainers: {}",
                    node.name(),
                    node.id(),
                    retainers.join(", ")
                ));
            }
            if !errors.is_empty() {
                tracing::warn!("{errors}");
                progress.report_problem(&errors.to_string());
            }
        }

        // Whatever is still unvisited is unreachable even through weak
        // references; give those nodes postorder slots anyway so the
        // dominator fixpoint can treat them as root-dominated orphans.
        if post_order_index != node_count {
            let mut errors = ProblemReport::new(format!(
                "Still found {} unreachable nodes in heap snapshot:",
                node_count - post_order_index
            ));
            post_order_index -= 1;
            for ordinal in 0..node_count {
                if visited[ordinal] {
                    continue;
                }
                let node = self.node_by_ordinal(ordinal);
                errors.add(format!("{} @{}", node.name(), node.id()));
                ordinal_to_post_order[ordinal] = post_order_index as u32;
                post_order_to_ordinal[post_order_index] = ordinal as u32;
                post_order_index += 1;
            }
            ordinal_to_post_order[root_ordinal] = post_order_index as u32;
            post_order_to_ordinal[post_order_index] = root_ordinal as u32;
            tracing::warn!("{errors}");
            progress.report_problem(&errors.to_string());
        }

        Ok((post_order_to_ordinal, ordinal_to_post_order))
    }

    /// Cooper-Harvey-Kennedy iterative dominator fixpoint over the
    /// postorder numbering.
    fn build_dominator_tree(
        &self,
        post_order_to_ordinal: &[u32],
        ordinal_to_post_order: &[u32],
    ) -> Vec<u32> {
        let nodes_count = post_order_to_ordinal.len();
        let root_post_ordered_index = nodes_count - 1;
        let no_entry = nodes_count as u32;
        let mut dominators = vec![no_entry; nodes_count];
        dominators[root_post_ordered_index] = root_post_ordered_index as u32;

        let flag = self
            .rules
            .user_object_flag()
            .filter(|_| !self.node_flags.is_empty());

        // Entries whose dominator needs recomputing; seeded with the
        // root's essential children.
        let mut affected = vec![false; nodes_count];
        let root_ordinal = self.root_ordinal();
        let begin = self.first_edge_indexes[root_ordinal] as usize;
        let end = self.first_edge_indexes[root_ordinal + 1] as usize;
        let mut edge_index = begin;
        while edge_index < end {
            let edge_type = self.containment_edges[edge_index + self.edge_type_offset];
            if self.is_essential_edge(self.root_node_index, edge_type) {
                let child_index =
                    self.containment_edges[edge_index + self.edge_to_node_offset] as usize;
                affected
                    [ordinal_to_post_order[child_index / self.node_field_count] as usize] = true;
            }
            edge_index += self.edge_field_count;
        }

        let mut changed = true;
        while changed {
            changed = false;
            for post_order_index in (0..root_post_ordered_index).rev() {
                if !affected[post_order_index] {
                    continue;
                }
                affected[post_order_index] = false;
                // A node dominated by the root cannot change any further.
                if dominators[post_order_index] == root_post_ordered_index as u32 {
                    continue;
                }
                let node_ordinal = post_order_to_ordinal[post_order_index] as usize;
                let node_flag = self.flagged(flag, node_ordinal);
                let mut new_dominator_index = no_entry;
                let begin_retainer = self.first_retainer_index[node_ordinal] as usize;
                let end_retainer = self.first_retainer_index[node_ordinal + 1] as usize;
                let mut orphan_node = true;
                for retainer_index in begin_retainer..end_retainer {
                    let retainer_edge_index = self.retaining_edges[retainer_index] as usize;
                    let retainer_edge_type =
                        self.containment_edges[retainer_edge_index + self.edge_type_offset];
                    let retainer_node_index = self.retaining_nodes[retainer_index];
                    if !self.is_essential_edge(retainer_node_index, retainer_edge_type) {
                        continue;
                    }
                    orphan_node = false;
                    let retainer_ordinal = retainer_node_index as usize / self.node_field_count;
                    if retainer_node_index != self.root_node_index
                        && node_flag
                        && !self.flagged(flag, retainer_ordinal)
                    {
                        continue;
                    }
                    let mut retainer_post_order_index = ordinal_to_post_order[retainer_ordinal];
                    if dominators[retainer_post_order_index as usize] != no_entry {
                        if new_dominator_index == no_entry {
                            new_dominator_index = retainer_post_order_index;
                        } else {
                            while retainer_post_order_index != new_dominator_index {
                                while retainer_post_order_index < new_dominator_index {
                                    retainer_post_order_index =
                                        dominators[retainer_post_order_index as usize];
                                }
                                while new_dominator_index < retainer_post_order_index {
                                    new_dominator_index =
                                        dominators[new_dominator_index as usize];
                                }
                            }
                        }
                        if new_dominator_index == root_post_ordered_index as u32 {
                            break;
                        }
                    }
                }
                if orphan_node {
                    new_dominator_index = root_post_ordered_index as u32;
                }
                if new_dominator_index != no_entry
                    && dominators[post_order_index] != new_dominator_index
                {
                    dominators[post_order_index] = new_dominator_index;
                    changed = true;
                    let begin = self.first_edge_indexes[node_ordinal] as usize;
                    let end = self.first_edge_indexes[node_ordinal + 1] as usize;
                    let mut to_field = begin + self.edge_to_node_offset;
                    while to_field < end {
                        let child = self.containment_edges[to_field] as usize;
                        affected[ordinal_to_post_order[child / self.node_field_count] as usize] =
                            true;
                        to_field += self.edge_field_count;
                    }
                }
            }
        }

        let mut dominators_tree = vec![0u32; nodes_count];
        for post_order_index in 0..nodes_count {
            let node_ordinal = post_order_to_ordinal[post_order_index] as usize;
            // Nodes the fixpoint never reached (no essential retainer
            // path from the root, or no retainers at all) fall back to
            // the root as their dominator.
            let mut dominator_post_order = dominators[post_order_index];
            if dominator_post_order == no_entry {
                dominator_post_order = root_post_ordered_index as u32;
            }
            dominators_tree[node_ordinal] =
                post_order_to_ordinal[dominator_post_order as usize];
        }
        dominators_tree
    }

    fn calculate_retained_sizes(&mut self, post_order_to_ordinal: &[u32]) {
        let mut retained_sizes: Vec<f64> = (0..self.node_count)
            .map(|ordinal| {
                self.nodes[ordinal * self.node_field_count + self.node_self_size_offset] as f64
            })
            .collect();
        // Postorder guarantees children accumulate before their dominator;
        // the root (last entry) is excluded.
        for post_order_index in 0..self.node_count.saturating_sub(1) {
            let ordinal = post_order_to_ordinal[post_order_index] as usize;
            let dominator_ordinal = self.dominators_tree[ordinal] as usize;
            retained_sizes[dominator_ordinal] += retained_sizes[ordinal];
        }
        self.retained_sizes = retained_sizes;
    }

    fn build_dominated_nodes(&mut self) -> Result<()> {
        let mut index_array = vec![0u32; self.node_count + 1];
        let mut dominated_nodes = vec![0u32; self.node_count.saturating_sub(1)];

        // The root is the only node without a dominator and must sit at
        // one end of the ordinal range so the others form one dense run.
        let root_ordinal = self.root_ordinal();
        let mut from_ordinal = 0usize;
        let mut to_ordinal = self.node_count;
        if root_ordinal == from_ordinal {
            from_ordinal = 1;
        } else if root_ordinal == to_ordinal - 1 {
            to_ordinal -= 1;
        } else {
            return Err(SnapshotError::InvalidSnapshot(
                "root node is expected to be either first or last".into(),
            ));
        }
        for ordinal in from_ordinal..to_ordinal {
            index_array[self.dominators_tree[ordinal] as usize] += 1;
        }
        let mut first_dominated_node_index = 0u32;
        for ordinal in 0..self.node_count {
            let dominated_count = index_array[ordinal];
            if (first_dominated_node_index as usize) < dominated_nodes.len() {
                dominated_nodes[first_dominated_node_index as usize] = dominated_count;
            }
            index_array[ordinal] = first_dominated_node_index;
            first_dominated_node_index += dominated_count;
        }
        index_array[self.node_count] = dominated_nodes.len() as u32;
        for ordinal in from_ordinal..to_ordinal {
            let dominator_ordinal = self.dominators_tree[ordinal] as usize;
            let first_slot = index_array[dominator_ordinal];
            dominated_nodes[first_slot as usize] -= 1;
            let slot = first_slot + dominated_nodes[first_slot as usize];
            dominated_nodes[slot as usize] = (ordinal * self.node_field_count) as u32;
        }

        self.first_dominated_node_index = index_array;
        self.dominated_nodes = dominated_nodes;
        Ok(())
    }

    fn build_samples(&mut self, raw_samples: &[u64]) {
        if raw_samples.is_empty() {
            return;
        }
        let mut timestamps = Vec::with_capacity(raw_samples.len() / 2);
        let mut last_assigned_ids = Vec::with_capacity(raw_samples.len() / 2);
        for pair in raw_samples.chunks_exact(2) {
            timestamps.push(pair[0] as f64 / 1000.0);
            last_assigned_ids.push(pair[1]);
        }
        let mut sizes = vec![0u64; timestamps.len()];
        for ordinal in 0..self.node_count {
            let node_index = ordinal * self.node_field_count;
            let id = u64::from(self.nodes[node_index + self.node_id_offset]);
            // JS objects have odd ids; even ids belong to native objects
            // outside the sampled id ranges.
            if id % 2 == 0 {
                continue;
            }
            let range_index = lower_bound(&last_assigned_ids, &id);
            if range_index == last_assigned_ids.len() {
                continue;
            }
            sizes[range_index] += u64::from(self.nodes[node_index + self.node_self_size_offset]);
        }
        self.samples = Some(Samples {
            timestamps,
            last_assigned_ids,
            sizes,
        });
    }

    fn build_location_map(&mut self, raw_locations: &[u32], layout: &LocationLayout) {
        let mut map = HashMap::new();
        let mut index = 0;
        while index + layout.field_count <= raw_locations.len() {
            map.insert(
                raw_locations[index + layout.object_index],
                Location {
                    script_id: raw_locations[index + layout.script_id],
                    line_number: raw_locations[index + layout.line],
                    column_number: raw_locations[index + layout.column],
                },
            );
            index += layout.field_count;
        }
        self.location_map = map;
    }

    fn collect_live_object_stats(&self) -> HashMap<u32, LiveObjectStats> {
        let mut live: HashMap<u32, LiveObjectStats> = HashMap::new();
        let Some(trace_offset) = self.node_trace_node_id_offset else {
            return live;
        };
        for ordinal in 0..self.node_count {
            let node_index = ordinal * self.node_field_count;
            let trace_node_id = self.nodes[node_index + trace_offset];
            if trace_node_id == 0 {
                continue;
            }
            let stats = live.entry(trace_node_id).or_default();
            stats.count += 1;
            stats.size += u64::from(self.nodes[node_index + self.node_self_size_offset]);
        }
        live
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Per-class aggregates, cached under `key`. With `sorted` set, each
    /// class's instance indexes are ordered by node id (a prerequisite
    /// for diffing).
    pub fn aggregates<'a>(
        &'a self,
        sorted: bool,
        key: &str,
        filter: Option<&dyn Fn(HeapNode<'a>) -> bool>,
    ) -> HashMap<String, Aggregate> {
        let cached = self.aggregates_cache.borrow().contains_key(key);
        if !cached {
            let aggregates = self.calculate_aggregates(filter);
            self.aggregates_cache
                .borrow_mut()
                .insert(key.to_string(), aggregates);
        }
        if sorted
            && !self
                .aggregates_sorted_flags
                .borrow()
                .get(key)
                .copied()
                .unwrap_or(false)
        {
            let mut cache = self.aggregates_cache.borrow_mut();
            if let Some(aggregates) = cache.get_mut(key) {
                for aggregate in aggregates.values_mut() {
                    aggregate
                        .idxs
                        .sort_by_key(|&idx| self.nodes[idx as usize + self.node_id_offset]);
                }
            }
            self.aggregates_sorted_flags
                .borrow_mut()
                .insert(key.to_string(), true);
        }
        self.aggregates_cache
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregates restricted by a node filter; the filter also provides
    /// the cache key.
    pub fn aggregates_with_filter(
        &self,
        node_filter: &NodeFilter,
    ) -> Result<HashMap<String, Aggregate>> {
        let filter = self.create_filter(node_filter)?;
        let key = node_filter.key();
        Ok(self.aggregates(false, &key, filter.as_deref()))
    }

    fn calculate_aggregates<'a>(
        &'a self,
        filter: Option<&dyn Fn(HeapNode<'a>) -> bool>,
    ) -> HashMap<String, Aggregate> {
        let (mut by_class_index, order) = self.build_aggregates(filter);
        self.calculate_classes_retained_size(&mut by_class_index, filter);
        // Later classes with the same display name overwrite earlier
        // ones, matching the insertion-order walk of the node array.
        let mut by_class_name = HashMap::new();
        for class_index in order {
            if let Some(aggregate) = by_class_index.get(&class_index) {
                let class_name = self.node(aggregate.idxs[0]).class_name().into_owned();
                by_class_name.insert(class_name, aggregate.clone());
            }
        }
        by_class_name
    }

    fn build_aggregates<'a>(
        &'a self,
        filter: Option<&dyn Fn(HeapNode<'a>) -> bool>,
    ) -> (HashMap<i64, Aggregate>, Vec<i64>) {
        let mut by_index: HashMap<i64, Aggregate> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for ordinal in 0..self.node_count {
            let node = self.node_by_ordinal(ordinal);
            if let Some(f) = filter {
                if !f(node) {
                    continue;
                }
            }
            let self_size = node.self_size();
            if self_size == 0 && !node.is_native() {
                continue;
            }
            let class_index = node.class_index();
            let distance = self.node_distances[ordinal];
            match by_index.get_mut(&class_index) {
                Some(aggregate) => {
                    aggregate.distance = aggregate.distance.min(distance);
                    aggregate.count += 1;
                    aggregate.self_size += self_size;
                    aggregate.idxs.push(node.node_index);
                }
                None => {
                    let type_name = node.type_name().to_string();
                    let name_matters = type_name == "object" || type_name == "native";
                    by_index.insert(
                        class_index,
                        Aggregate {
                            count: 1,
                            distance,
                            self_size,
                            max_ret: 0.0,
                            type_name,
                            name: name_matters.then(|| node.name().into_owned()),
                            idxs: vec![node.node_index],
                        },
                    );
                    order.push(class_index);
                }
            }
        }
        (by_index, order)
    }

    /// Walks the dominator tree accumulating each class's retained size.
    /// Only the top-most node of a class along any tree path contributes,
    /// so nested instances are not double counted.
    fn calculate_classes_retained_size<'a>(
        &'a self,
        aggregates: &mut HashMap<i64, Aggregate>,
        filter: Option<&dyn Fn(HeapNode<'a>) -> bool>,
    ) {
        let mut list = vec![self.root_node_index];
        let mut sizes: Vec<isize> = vec![-1];
        let mut classes: Vec<i64> = Vec::new();
        let mut seen_class_indexes: HashMap<i64, bool> = HashMap::new();

        while let Some(node_index) = list.pop() {
            let node = self.node(node_index);
            let class_index = node.class_index();
            let seen = seen_class_indexes.get(&class_index).copied().unwrap_or(false);
            let ordinal = node.ordinal();
            let dominated_from = self.first_dominated_node_index[ordinal] as usize;
            let dominated_to = self.first_dominated_node_index[ordinal + 1] as usize;

            let passes_filter = filter.map_or(true, |f| f(node));
            if !seen && passes_filter && (node.self_size() != 0 || node.is_native()) {
                if let Some(aggregate) = aggregates.get_mut(&class_index) {
                    aggregate.max_ret += node.retained_size();
                    if dominated_from != dominated_to {
                        seen_class_indexes.insert(class_index, true);
                        sizes.push(list.len() as isize);
                        classes.push(class_index);
                    }
                }
            }
            for dominated_index in dominated_from..dominated_to {
                list.push(self.dominated_nodes[dominated_index]);
            }

            let list_len = list.len() as isize;
            while sizes.last().copied() == Some(list_len) {
                sizes.pop();
                if let Some(class_index) = classes.pop() {
                    seen_class_indexes.insert(class_index, false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Diff
    // ------------------------------------------------------------------

    /// The slim aggregate form another snapshot diffs against.
    pub fn aggregates_for_diff(&self) -> HashMap<String, AggregateForDiff> {
        if let Some(cached) = self.aggregates_for_diff_cache.borrow().as_ref() {
            return cached.clone();
        }
        let aggregates = self.aggregates(true, "allObjects", None);
        let mut result = HashMap::new();
        for (class_name, aggregate) in &aggregates {
            let mut ids = Vec::with_capacity(aggregate.idxs.len());
            let mut self_sizes = Vec::with_capacity(aggregate.idxs.len());
            for &node_index in &aggregate.idxs {
                let node = self.node(node_index);
                ids.push(node.id());
                self_sizes.push(node.self_size());
            }
            result.insert(
                class_name.clone(),
                AggregateForDiff {
                    indexes: aggregate.idxs.clone(),
                    ids,
                    self_sizes,
                },
            );
        }
        *self.aggregates_for_diff_cache.borrow_mut() = Some(result.clone());
        result
    }

    /// Per-class diff of this snapshot against a base snapshot's
    /// [`aggregates_for_diff`](Self::aggregates_for_diff) output, cached
    /// per base snapshot id. Classes with no change are omitted.
    pub fn calculate_snapshot_diff(
        &self,
        base_snapshot_id: u32,
        base_aggregates: &HashMap<String, AggregateForDiff>,
    ) -> HashMap<String, Diff> {
        if let Some(diff) = self.snapshot_diffs.borrow().get(&base_snapshot_id) {
            return diff.clone();
        }
        let mut snapshot_diff = HashMap::new();
        let aggregates = self.aggregates(true, "allObjects", None);
        for (class_name, base_aggregate) in base_aggregates {
            if let Some(diff) =
                self.calculate_diff_for_class(base_aggregate, aggregates.get(class_name))
            {
                snapshot_diff.insert(class_name.clone(), diff);
            }
        }
        let empty_base = AggregateForDiff::default();
        for (class_name, aggregate) in &aggregates {
            if base_aggregates.contains_key(class_name) {
                continue;
            }
            if let Some(diff) = self.calculate_diff_for_class(&empty_base, Some(aggregate)) {
                snapshot_diff.insert(class_name.clone(), diff);
            }
        }
        self.snapshot_diffs
            .borrow_mut()
            .insert(base_snapshot_id, snapshot_diff.clone());
        snapshot_diff
    }

    fn calculate_diff_for_class(
        &self,
        base: &AggregateForDiff,
        aggregate: Option<&Aggregate>,
    ) -> Option<Diff> {
        let indexes: &[u32] = aggregate.map_or(&[], |a| &a.idxs);
        let mut diff = Diff::default();
        let mut i = 0;
        let mut j = 0;
        // Merge the two id-sorted instance lists.
        while i < base.ids.len() && j < indexes.len() {
            let base_id = base.ids[i];
            let node = self.node(indexes[j]);
            if base_id < node.id() {
                diff.deleted_indexes.push(base.indexes[i]);
                diff.removed_count += 1;
                diff.removed_size += base.self_sizes[i];
                i += 1;
            } else if base_id > node.id() {
                diff.added_indexes.push(indexes[j]);
                diff.added_count += 1;
                diff.added_size += node.self_size();
                j += 1;
            } else {
                i += 1;
                j += 1;
            }
        }
        while i < base.ids.len() {
            diff.deleted_indexes.push(base.indexes[i]);
            diff.removed_count += 1;
            diff.removed_size += base.self_sizes[i];
            i += 1;
        }
        while j < indexes.len() {
            let node = self.node(indexes[j]);
            diff.added_indexes.push(indexes[j]);
            diff.added_count += 1;
            diff.added_size += node.self_size();
            j += 1;
        }
        diff.count_delta = i64::from(diff.added_count) - i64::from(diff.removed_count);
        diff.size_delta = diff.added_size as i64 - diff.removed_size as i64;
        if diff.added_count == 0 && diff.removed_count == 0 {
            return None;
        }
        Some(diff)
    }

    // ------------------------------------------------------------------
    // Search and filtering
    // ------------------------------------------------------------------

    /// Creates a node predicate from a [`NodeFilter`], or `None` if the
    /// filter is unrestricted.
    pub fn create_filter<'a>(
        &'a self,
        node_filter: &NodeFilter,
    ) -> Result<Option<Box<dyn Fn(HeapNode<'a>) -> bool + 'a>>> {
        if let Some(allocation_node_id) = node_filter.allocation_node_id {
            let trace_ids = self.allocation_trace_ids(allocation_node_id)?;
            if trace_ids.is_empty() {
                return Err(SnapshotError::InvalidQuery(format!(
                    "allocation node {allocation_node_id} has no traces"
                )));
            }
            let trace_ids: HashSet<u32> = trace_ids.into_iter().collect();
            return Ok(Some(Box::new(move |node| {
                trace_ids.contains(&node.trace_node_id())
            })));
        }
        if let (Some(min), Some(max)) = (node_filter.min_node_id, node_filter.max_node_id) {
            return Ok(Some(Box::new(move |node| {
                let id = node.id();
                id > min && id <= max
            })));
        }
        Ok(None)
    }

    /// Finds nodes whose name matches the query and returns their ids in
    /// node-array order.
    pub fn search(
        &self,
        search_config: &SearchConfig,
        node_filter: &NodeFilter,
    ) -> Result<Vec<u32>> {
        let query = &search_config.query;
        let mut matched_string_indexes: HashSet<u32> = HashSet::new();
        if search_config.is_regex || !search_config.case_sensitive {
            let pattern = if search_config.is_regex {
                query.clone()
            } else {
                regex::escape(query)
            };
            let regexp = regex::RegexBuilder::new(&pattern)
                .case_insensitive(!search_config.case_sensitive)
                .build()
                .map_err(|error| {
                    SnapshotError::InvalidQuery(format!("bad search pattern: {error}"))
                })?;
            for (index, string) in self.strings.iter().enumerate() {
                if regexp.is_match(string) {
                    matched_string_indexes.insert(index as u32);
                }
            }
        } else {
            for (index, string) in self.strings.iter().enumerate() {
                if string.contains(query.as_str()) {
                    matched_string_indexes.insert(index as u32);
                }
            }
        }
        if matched_string_indexes.is_empty() {
            return Ok(Vec::new());
        }

        let filter = self.create_filter(node_filter)?;
        let mut node_ids = Vec::new();
        for ordinal in 0..self.node_count {
            let node = self.node_by_ordinal(ordinal);
            if let Some(f) = &filter {
                if !f(node) {
                    continue;
                }
            }
            let name_index = self.nodes[node.node_index as usize + self.node_name_offset];
            if matched_string_indexes.contains(&name_index) {
                node_ids.push(node.id());
            }
        }
        Ok(node_ids)
    }

    /// Ids of all nodes whose (cons-aware) name equals `name`.
    pub fn ids_of_objects_with_name(&self, name: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for ordinal in 0..self.node_count {
            let node = self.node_by_ordinal(ordinal);
            if node.name() == name {
                ids.push(node.id());
            }
        }
        ids
    }

    pub fn node_for_id(&self, snapshot_object_id: u32) -> Option<HeapNode<'_>> {
        (0..self.node_count)
            .map(|ordinal| self.node_by_ordinal(ordinal))
            .find(|node| node.id() == snapshot_object_id)
    }

    pub fn node_class_name(&self, snapshot_object_id: u32) -> Option<String> {
        self.node_for_id(snapshot_object_id)
            .map(|node| node.class_name().into_owned())
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    pub fn create_edges_provider(&self, node_index: u32) -> EdgesProvider<'_> {
        EdgesProvider::containment(self, node_index)
    }

    pub fn create_retaining_edges_provider(&self, node_index: u32) -> EdgesProvider<'_> {
        EdgesProvider::retainers(self, node_index)
    }

    pub fn create_nodes_provider_for_class(
        &self,
        class_name: &str,
        node_filter: &NodeFilter,
    ) -> Result<NodesProvider<'_>> {
        let aggregates = self.aggregates_with_filter(node_filter)?;
        let indexes = aggregates
            .get(class_name)
            .map(|aggregate| aggregate.idxs.clone())
            .unwrap_or_default();
        Ok(NodesProvider::new(self, indexes))
    }

    /// Provider over the instances of `class_name` added since the diff
    /// against `base_snapshot_id` was computed. The diff must already be
    /// cached by [`calculate_snapshot_diff`](Self::calculate_snapshot_diff).
    pub fn create_added_nodes_provider(
        &self,
        base_snapshot_id: u32,
        class_name: &str,
    ) -> Result<NodesProvider<'_>> {
        let diffs = self.snapshot_diffs.borrow();
        let diff = diffs
            .get(&base_snapshot_id)
            .and_then(|diff| diff.get(class_name))
            .ok_or_else(|| {
                SnapshotError::InvalidQuery(format!(
                    "no cached diff for class {class_name:?} against base snapshot {base_snapshot_id}"
                ))
            })?;
        Ok(NodesProvider::new(self, diff.added_indexes.clone()))
    }

    /// Provider over explicit node indexes. Used with a diff's deleted
    /// indexes, which address nodes in the base snapshot.
    pub fn create_deleted_nodes_provider(&self, node_indexes: Vec<u32>) -> NodesProvider<'_> {
        NodesProvider::new(self, node_indexes)
    }

    // ------------------------------------------------------------------
    // Allocation profile
    // ------------------------------------------------------------------

    fn allocation(&self) -> Result<&RefCell<AllocationProfile>> {
        self.allocation_profile.as_ref().ok_or_else(|| {
            SnapshotError::InvalidQuery("snapshot has no allocation trace data".into())
        })
    }

    /// Top allocating functions, sorted by allocated size.
    pub fn allocation_trace_tops(&self) -> Result<Vec<SerializedAllocationNode>> {
        Ok(self.allocation()?.borrow_mut().serialize_trace_tops())
    }

    pub fn allocation_node_callers(&self, node_id: u32) -> Result<AllocationNodeCallers> {
        self.allocation()?.borrow_mut().serialize_callers(node_id)
    }

    pub fn allocation_stack(
        &self,
        trace_node_id: u32,
    ) -> Result<Option<Vec<AllocationStackFrame>>> {
        Ok(self
            .allocation()?
            .borrow()
            .serialize_allocation_stack(trace_node_id))
    }

    pub(crate) fn allocation_trace_ids(&self, node_id: u32) -> Result<Vec<u32>> {
        self.allocation()?.borrow_mut().trace_ids(node_id)
    }

    // ------------------------------------------------------------------
    // Node name helpers
    // ------------------------------------------------------------------

    /// Assembles the flattened name of a concatenated string by walking
    /// its `first`/`second` internal edges. Results are memoized; output
    /// is capped at 1 KiB.
    pub(crate) fn cons_string_name(&self, node_index: u32) -> String {
        if let Some(cached) = self.lazy_string_cache.borrow().get(&node_index) {
            return cached.clone();
        }
        let mut name = String::new();
        let mut stack = vec![node_index];
        while let Some(index) = stack.pop() {
            if name.len() >= 1024 {
                break;
            }
            let index = index as usize;
            let node_type = self.nodes[index + self.node_type_offset];
            if Some(node_type) != self.node_cons_string_type {
                let name_index = self.nodes[index + self.node_name_offset] as usize;
                if let Some(part) = self.strings.get(name_index) {
                    name.push_str(part);
                }
                continue;
            }
            let ordinal = index / self.node_field_count;
            let begin = self.first_edge_indexes[ordinal] as usize;
            let end = self.first_edge_indexes[ordinal + 1] as usize;
            let mut first_node_index = 0u32;
            let mut second_node_index = 0u32;
            let mut edge_index = begin;
            while edge_index < end && (first_node_index == 0 || second_node_index == 0) {
                let edge_type = self.containment_edges[edge_index + self.edge_type_offset];
                if Some(edge_type) == self.edge_internal_type {
                    let edge_name_index =
                        self.containment_edges[edge_index + self.edge_name_offset] as usize;
                    match self.strings.get(edge_name_index).map(String::as_str) {
                        Some("first") => {
                            first_node_index =
                                self.containment_edges[edge_index + self.edge_to_node_offset];
                        }
                        Some("second") => {
                            second_node_index =
                                self.containment_edges[edge_index + self.edge_to_node_offset];
                        }
                        _ => {}
                    }
                }
                edge_index += self.edge_field_count;
            }
            if second_node_index != 0 {
                stack.push(second_node_index);
            }
            if first_node_index != 0 {
                stack.push(first_node_index);
            }
        }
        self.lazy_string_cache
            .borrow_mut()
            .insert(node_index, name.clone());
        name
    }

    /// Self size of an `Array` instance plus its backing store, when the
    /// backing store's sole retainer is the array.
    pub(crate) fn calculate_array_size(&self, node: HeapNode<'_>) -> u64 {
        let mut size = node.self_size();
        let ordinal = node.ordinal();
        let begin = self.first_edge_indexes[ordinal] as usize;
        let end = self.first_edge_indexes[ordinal + 1] as usize;
        let mut edge_index = begin;
        while edge_index < end {
            let edge_type = self.containment_edges[edge_index + self.edge_type_offset];
            if Some(edge_type) == self.edge_internal_type {
                let name_index = self.containment_edges[edge_index + self.edge_name_offset] as usize;
                if self.strings.get(name_index).map(String::as_str) == Some("elements") {
                    let elements =
                        self.node(self.containment_edges[edge_index + self.edge_to_node_offset]);
                    if elements.retainers_count() == 1 {
                        size += elements.self_size();
                    }
                    break;
                }
            }
            edge_index += self.edge_field_count;
        }
        size
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SnapshotLoader;

    fn snapshot_json(node_count: usize, edge_count: usize, nodes: &str, edges: &str, strings: &str) -> String {
        format!(
            r#"{{"snapshot":{{"meta":{{
                "node_fields":["type","name","id","self_size","edge_count","trace_node_id"],
                "node_types":[["hidden","array","string","object","code","closure","regexp","number","native","synthetic","concatenated string","sliced string"],"string","number","number","number","number"],
                "edge_fields":["type","name_or_index","to_node"],
                "edge_types":[["context","element","property","internal","hidden","shortcut","weak"],"string_or_number","node"]}},
                "node_count":{node_count},"edge_count":{edge_count}}},
            "nodes":[{nodes}],
            "edges":[{edges}],
            "strings":{strings}}}"#
        )
    }

    // root (synthetic) -a-> A (object, 10 bytes) -b-> B (object, 20 bytes)
    fn basic_json() -> String {
        snapshot_json(
            3,
            2,
            "9,0,1,0,1,0, 3,1,3,10,1,0, 3,2,5,20,0,0",
            "2,3,6, 2,4,12",
            r#"["(root)","A","B","a","b"]"#,
        )
    }

    // Same graph plus D (5 bytes), held only by a weak edge from A.
    fn weak_orphan_json() -> String {
        snapshot_json(
            4,
            3,
            "9,0,1,0,1,0, 3,1,3,10,2,0, 3,2,5,20,0,0, 3,6,7,5,0,0",
            "2,3,6, 2,4,12, 6,5,18",
            r#"["(root)","A","B","a","b","w","D"]"#,
        )
    }

    fn build(json: &str) -> HeapSnapshot {
        let mut loader = SnapshotLoader::new();
        loader.write(json).unwrap();
        loader.close().unwrap();
        loader.build_snapshot().unwrap()
    }

    fn node_by_name<'a>(snapshot: &'a HeapSnapshot, name: &str) -> HeapNode<'a> {
        (0..snapshot.node_count())
            .map(|ordinal| snapshot.node_by_ordinal(ordinal))
            .find(|node| node.name() == name)
            .unwrap()
    }

    #[derive(Default)]
    struct RecordingProgress {
        statuses: Vec<String>,
        problems: Vec<String>,
    }

    impl Progress for RecordingProgress {
        fn update_status(&mut self, status: &str) {
            self.statuses.push(status.to_string());
        }
        fn report_problem(&mut self, error: &str) {
            self.problems.push(error.to_string());
        }
    }

    #[test]
    fn distances_from_user_roots() {
        let snapshot = build(&basic_json());
        assert_eq!(node_by_name(&snapshot, "A").distance(), 1);
        assert_eq!(node_by_name(&snapshot, "B").distance(), 2);
        assert_eq!(snapshot.root().distance(), BASE_SYSTEM_DISTANCE);
    }

    #[test]
    fn weak_edges_do_not_contribute_distances() {
        let snapshot = build(&weak_orphan_json());
        assert_eq!(node_by_name(&snapshot, "D").distance(), NO_DISTANCE);
    }

    #[test]
    fn dominators_follow_the_only_path() {
        let snapshot = build(&basic_json());
        let a = node_by_name(&snapshot, "A");
        let b = node_by_name(&snapshot, "B");
        assert_eq!(b.dominator().node_index, a.node_index);
        assert_eq!(a.dominator().node_index, snapshot.root().node_index);
        assert_eq!(snapshot.root().dominator().node_index, snapshot.root().node_index);
    }

    #[test]
    fn retainerless_nodes_fall_back_to_root_dominator() {
        // X has no retainers at all, so the fixpoint never visits it.
        let json = snapshot_json(
            3,
            1,
            "9,0,1,0,1,0, 3,1,3,10,0,0, 3,2,5,8,0,0",
            "2,3,6",
            r#"["(root)","A","X","a"]"#,
        );
        let snapshot = build(&json);
        let x = node_by_name(&snapshot, "X");
        assert_eq!(x.dominator().node_index, snapshot.root().node_index);
        assert_eq!(x.retained_size(), 8.0);
        assert_eq!(snapshot.root().retained_size(), 18.0);
    }

    #[test]
    fn retained_sizes_accumulate_through_dominators() {
        let snapshot = build(&basic_json());
        assert_eq!(node_by_name(&snapshot, "B").retained_size(), 20.0);
        assert_eq!(node_by_name(&snapshot, "A").retained_size(), 30.0);
        assert_eq!(snapshot.root().retained_size(), 30.0);
        assert_eq!(snapshot.total_size(), 30.0);
    }

    #[test]
    fn weakly_retained_orphans_belong_to_the_root() {
        let snapshot = build(&weak_orphan_json());
        let d = node_by_name(&snapshot, "D");
        assert_eq!(d.dominator().node_index, snapshot.root().node_index);
        assert_eq!(d.retained_size(), 5.0);
        assert_eq!(node_by_name(&snapshot, "A").retained_size(), 30.0);
        assert_eq!(snapshot.total_size(), 35.0);
    }

    #[test]
    fn orphans_are_reported_as_problems() {
        let mut loader = SnapshotLoader::new();
        loader.write(&weak_orphan_json()).unwrap();
        loader.close().unwrap();
        let profile = loader.into_profile().unwrap();
        let mut progress = RecordingProgress::default();
        let _snapshot = HeapSnapshot::new(profile, &mut progress).unwrap();
        assert_eq!(progress.problems.len(), 1);
        assert!(progress.problems[0].contains("1 nodes are unreachable"));
        assert!(progress.problems[0].contains("D @7 weak retainers: A@3.w"));
        assert_eq!(progress.statuses.last().map(String::as_str), Some("Finished processing."));
    }

    #[test]
    fn retainers_mirror_edges() {
        let snapshot = build(&weak_orphan_json());
        for ordinal in 0..snapshot.node_count() {
            let node = snapshot.node_by_ordinal(ordinal);
            for edge in node.edges() {
                let target = edge.node();
                assert!(
                    target
                        .retainers()
                        .any(|retainer| retainer.node().node_index == node.node_index),
                    "missing retainer for edge {} -> {}",
                    node.name(),
                    target.name()
                );
            }
        }
        assert_eq!(node_by_name(&snapshot, "B").retainers_count(), 1);
    }

    #[test]
    fn aggregates_group_instances_by_class() {
        let snapshot = build(&basic_json());
        let aggregates = snapshot.aggregates(false, "allObjects", None);
        assert_eq!(aggregates.len(), 2);
        let a = &aggregates["A"];
        assert_eq!(a.count, 1);
        assert_eq!(a.self_size, 10);
        assert_eq!(a.max_ret, 30.0);
        assert_eq!(a.distance, 1);
        assert_eq!(a.type_name, "object");
        assert_eq!(a.name.as_deref(), Some("A"));
        let b = &aggregates["B"];
        assert_eq!(b.max_ret, 20.0);
        assert_eq!(b.distance, 2);
    }

    #[test]
    fn zero_size_synthetic_nodes_are_not_aggregated() {
        let snapshot = build(&basic_json());
        let aggregates = snapshot.aggregates(false, "allObjects", None);
        assert!(!aggregates.contains_key("(system)"));
    }

    #[test]
    fn diff_against_self_is_empty() {
        let snapshot = build(&basic_json());
        let base = snapshot.aggregates_for_diff();
        assert!(snapshot.calculate_snapshot_diff(1, &base).is_empty());
    }

    #[test]
    fn diff_reports_added_class() {
        let base = build(&basic_json());
        let target = build(&weak_orphan_json());
        let diff = target.calculate_snapshot_diff(1, &base.aggregates_for_diff());
        assert_eq!(diff.len(), 1);
        let d = &diff["D"];
        assert_eq!(d.added_count, 1);
        assert_eq!(d.removed_count, 0);
        assert_eq!(d.added_size, 5);
        assert_eq!(d.count_delta, 1);
        assert_eq!(d.size_delta, 5);
        // Cache hit must return the same result.
        assert_eq!(target.calculate_snapshot_diff(1, &base.aggregates_for_diff()).len(), 1);
    }

    #[test]
    fn added_and_deleted_node_providers() {
        let base = build(&basic_json());
        let target = build(&weak_orphan_json());
        let diff = target.calculate_snapshot_diff(1, &base.aggregates_for_diff());

        let mut added = target.create_added_nodes_provider(1, "D").unwrap();
        let range = added.serialize_items_range(0, 10).unwrap();
        assert_eq!(range.total_length, 1);
        assert_eq!(range.items[0].name, "D");

        let mut deleted = base.create_deleted_nodes_provider(diff["D"].deleted_indexes.clone());
        assert!(deleted.is_empty());
        assert_eq!(deleted.serialize_items_range(0, 10).unwrap().total_length, 0);

        assert!(target.create_added_nodes_provider(7, "D").is_err());
        assert!(target.create_added_nodes_provider(1, "Missing").is_err());
    }

    #[test]
    fn search_is_case_sensitive_by_default() {
        let snapshot = build(&basic_json());
        let config = SearchConfig {
            query: "A".to_string(),
            case_sensitive: true,
            is_regex: false,
        };
        assert_eq!(snapshot.search(&config, &NodeFilter::default()).unwrap(), vec![3]);
    }

    #[test]
    fn search_with_regex() {
        let snapshot = build(&basic_json());
        let config = SearchConfig {
            query: "^B$".to_string(),
            case_sensitive: true,
            is_regex: true,
        };
        assert_eq!(snapshot.search(&config, &NodeFilter::default()).unwrap(), vec![5]);

        let bad = SearchConfig {
            query: "[".to_string(),
            case_sensitive: true,
            is_regex: true,
        };
        assert!(matches!(
            snapshot.search(&bad, &NodeFilter::default()),
            Err(SnapshotError::InvalidQuery(_))
        ));
    }

    #[test]
    fn search_respects_id_range_filter() {
        let snapshot = build(&basic_json());
        let config = SearchConfig {
            query: "".to_string(),
            case_sensitive: true,
            is_regex: false,
        };
        let filter = NodeFilter {
            min_node_id: Some(3),
            max_node_id: Some(5),
            allocation_node_id: None,
        };
        // The empty query matches every string; only B passes the filter.
        assert_eq!(snapshot.search(&config, &filter).unwrap(), vec![5]);
    }

    #[test]
    fn id_range_aggregates_use_the_filter_key() {
        let snapshot = build(&basic_json());
        let filter = NodeFilter {
            min_node_id: Some(3),
            max_node_id: Some(5),
            allocation_node_id: None,
        };
        assert_eq!(filter.key(), "NodeIdRange: 3..5");
        let aggregates = snapshot.aggregates_with_filter(&filter).unwrap();
        assert_eq!(aggregates.len(), 1);
        assert!(aggregates.contains_key("B"));
    }

    #[test]
    fn static_data_summarizes_the_snapshot() {
        let snapshot = build(&basic_json());
        let data = snapshot.static_data();
        assert_eq!(data.node_count, 3);
        assert_eq!(data.root_node_index, 0);
        assert_eq!(data.total_size, 30.0);
        assert_eq!(data.max_js_object_id, 5);
    }

    #[test]
    fn node_lookup_by_id() {
        let snapshot = build(&basic_json());
        assert_eq!(snapshot.node_class_name(5).as_deref(), Some("B"));
        assert_eq!(snapshot.node_class_name(99), None);
        assert_eq!(snapshot.ids_of_objects_with_name("A"), vec![3]);
    }

    #[test]
    fn queriable_flags_propagate_from_user_roots() {
        let snapshot = build(&basic_json());
        assert!(node_by_name(&snapshot, "A").can_be_queried());
        assert!(node_by_name(&snapshot, "B").can_be_queried());
        assert!(!snapshot.root().can_be_queried());
    }

    #[test]
    fn statistics_bucket_by_node_type() {
        // root -> native (7 bytes), code (11 bytes), string (13 bytes).
        let json = snapshot_json(
            4,
            3,
            "9,0,1,0,3,0, 8,1,3,7,0,0, 4,2,5,11,0,0, 2,3,7,13,0,0",
            "2,1,6, 2,2,12, 2,3,18",
            r#"["(root)","nat","code","str"]"#,
        );
        let snapshot = build(&json);
        let statistics = snapshot.statistics();
        assert_eq!(statistics.total, 31.0);
        assert_eq!(statistics.native, 7);
        assert_eq!(statistics.code, 11);
        assert_eq!(statistics.strings, 13);
        assert_eq!(statistics.system, 0);
        assert_eq!(statistics.v8_heap, 24.0);
    }

    #[test]
    fn map_descriptor_edges_are_filtered_from_distances() {
        // root -> H (hidden "system / NativeContext"), whose
        // sloppy_function_map edge must not give X a distance.
        let json = snapshot_json(
            3,
            2,
            "9,0,1,0,1,0, 0,1,3,10,1,0, 3,3,5,20,0,0",
            "2,4,6, 2,2,12",
            r#"["(root)","system / NativeContext","sloppy_function_map","X","n"]"#,
        );
        let snapshot = build(&json);
        assert_eq!(node_by_name(&snapshot, "system / NativeContext").distance(), 1);
        assert_eq!(node_by_name(&snapshot, "X").distance(), NO_DISTANCE);
    }

    #[test]
    fn misaligned_to_node_is_rejected() {
        let json = snapshot_json(
            2,
            1,
            "9,0,1,0,1,0, 3,1,3,10,0,0",
            "2,2,7",
            r#"["(root)","A","a"]"#,
        );
        let mut loader = SnapshotLoader::new();
        loader.write(&json).unwrap();
        loader.close().unwrap();
        assert!(matches!(
            loader.build_snapshot(),
            Err(SnapshotError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn samples_are_bucketed_by_assigned_id_ranges() {
        let json = r#"{"snapshot":{"meta":{
            "node_fields":["type","name","id","self_size","edge_count","trace_node_id"],
            "node_types":[["hidden","array","string","object","code","closure","regexp","number","native","synthetic","concatenated string","sliced string"],"string","number","number","number","number"],
            "edge_fields":["type","name_or_index","to_node"],
            "edge_types":[["context","element","property","internal","hidden","shortcut","weak"],"string_or_number","node"],
            "sample_fields":["timestamp_us","last_assigned_id"],
            "location_fields":["object_index","script_id","line","column"]},
            "node_count":3,"edge_count":2},
        "nodes":[9,0,1,0,1,0, 3,1,3,10,1,0, 3,2,5,20,0,0],
        "edges":[2,3,6, 2,4,12],
        "samples":[1000000,4,2000000,6],
        "locations":[6,2,10,4],
        "strings":["(root)","A","B","a","b"]}"#;
        let snapshot = build(json);
        let samples = snapshot.samples().unwrap();
        assert_eq!(samples.timestamps, vec![1000.0, 2000.0]);
        assert_eq!(samples.last_assigned_ids, vec![4, 6]);
        assert_eq!(samples.sizes, vec![10, 20]);

        let location = snapshot.location(6).unwrap();
        assert_eq!(location.script_id, 2);
        assert_eq!(location.line_number, 10);
        assert_eq!(location.column_number, 4);
        assert!(snapshot.location(0).is_none());
    }

    #[test]
    fn aggregate_serialization_uses_devtools_field_names() {
        let snapshot = build(&basic_json());
        let aggregates = snapshot.aggregates(false, "allObjects", None);
        let json = serde_json::to_value(&aggregates["A"]).unwrap();
        assert_eq!(json["self"], 10);
        assert_eq!(json["maxRet"], 30.0);
        assert_eq!(json["type"], "object");
    }
}

//! Allocation trace profile.
//!
//! Snapshots recorded with allocation tracking carry a top-down tree of
//! allocation sites plus a table of function infos. This module rebuilds
//! that tree, attributes still-live objects to their trace nodes, and
//! serves the two views the UI asks for: the flat list of allocating
//! functions ("trace tops") and, per function, a bottom-up tree of its
//! callers. Bottom-up trees are built lazily per function because most
//! are never expanded.
//!
//! Nodes reference each other by arena index; ids handed out to callers
//! are minted sequentially and mapped back on the next request.

use std::collections::HashMap;

use serde::Serialize;

use crate::snapshot::{Result, SnapshotError};

// ============================================================================
// Serialized shapes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedAllocationNode {
    pub id: u32,
    pub name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
    pub count: u32,
    pub size: u64,
    pub live_count: u32,
    pub live_size: u64,
    pub has_children: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationNodeCallers {
    pub nodes_with_single_caller: Vec<SerializedAllocationNode>,
    pub branching_callers: Vec<SerializedAllocationNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStackFrame {
    pub function_name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

/// Count and size of still-live objects attributed to one trace node.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveObjectStats {
    pub count: u32,
    pub size: u64,
}

// ============================================================================
// Arena nodes
// ============================================================================

#[derive(Debug)]
struct FunctionAllocationInfo {
    function_name: String,
    script_name: String,
    script_id: u32,
    line: u32,
    column: u32,
    total_count: u32,
    total_size: u64,
    total_live_count: u32,
    total_live_size: u64,
    /// Top-down arena indexes of every trace node attributed to this
    /// function.
    trace_tops: Vec<usize>,
    bottom_up_root: Option<usize>,
}

#[derive(Debug)]
struct TopDownAllocationNode {
    id: u32,
    function_info: usize,
    allocation_count: u32,
    allocation_size: u64,
    live_count: u32,
    live_size: u64,
    parent: Option<usize>,
}

#[derive(Debug)]
struct BottomUpAllocationNode {
    function_info: usize,
    allocation_count: u32,
    allocation_size: u64,
    live_count: u32,
    live_size: u64,
    /// Ids of the top-down trace nodes folded into this bottom-up node.
    trace_top_ids: Vec<u32>,
    callers: Vec<usize>,
}

struct TraceNodeLayout {
    field_count: usize,
    id: usize,
    function_info_index: usize,
    count: usize,
    size: usize,
    children: usize,
}

fn field_offset(fields: &[String], name: &str) -> Result<usize> {
    fields.iter().position(|field| field == name).ok_or_else(|| {
        SnapshotError::InvalidSnapshot(format!("missing trace field \"{name}\""))
    })
}

fn uint_field(raw: &[serde_json::Value], index: usize) -> Result<u64> {
    raw.get(index).and_then(|value| value.as_u64()).ok_or_else(|| {
        SnapshotError::InvalidSnapshot("malformed allocation trace node".into())
    })
}

// ============================================================================
// AllocationProfile
// ============================================================================

pub struct AllocationProfile {
    function_infos: Vec<FunctionAllocationInfo>,
    top_down_nodes: Vec<TopDownAllocationNode>,
    bottom_up_nodes: Vec<BottomUpAllocationNode>,
    /// Trace node id to top-down arena index, for allocation stacks.
    id_to_top_down: HashMap<u32, usize>,
    /// Minted serialization id to bottom-up arena index.
    id_to_bottom_up: HashMap<u32, usize>,
    /// Minted trace-top id to function info, resolved to a bottom-up
    /// root on first expansion.
    collapsed_top_to_info: HashMap<u32, usize>,
    trace_tops: Option<Vec<SerializedAllocationNode>>,
    next_node_id: u32,
}

impl AllocationProfile {
    pub(crate) fn new(
        info_fields: &[String],
        trace_node_fields: &[String],
        trace_function_infos: &[u32],
        trace_tree: &serde_json::Value,
        strings: &[String],
        live: &HashMap<u32, LiveObjectStats>,
    ) -> Result<Self> {
        let mut profile = AllocationProfile {
            function_infos: Vec::new(),
            top_down_nodes: Vec::new(),
            bottom_up_nodes: Vec::new(),
            id_to_top_down: HashMap::new(),
            id_to_bottom_up: HashMap::new(),
            collapsed_top_to_info: HashMap::new(),
            trace_tops: None,
            next_node_id: 1,
        };
        profile.build_function_infos(info_fields, trace_function_infos, strings)?;

        let layout = TraceNodeLayout {
            field_count: trace_node_fields.len(),
            id: field_offset(trace_node_fields, "id")?,
            function_info_index: field_offset(trace_node_fields, "function_info_index")?,
            count: field_offset(trace_node_fields, "count")?,
            size: field_offset(trace_node_fields, "size")?,
            children: field_offset(trace_node_fields, "children")?,
        };
        let root = trace_tree.as_array().ok_or_else(|| {
            SnapshotError::InvalidSnapshot("trace_tree is not an array".into())
        })?;
        profile.traverse(root, 0, None, &layout, live)?;
        Ok(profile)
    }

    fn build_function_infos(
        &mut self,
        info_fields: &[String],
        raw_infos: &[u32],
        strings: &[String],
    ) -> Result<()> {
        let name_offset = field_offset(info_fields, "name")?;
        let script_name_offset = field_offset(info_fields, "script_name")?;
        let script_id_offset = field_offset(info_fields, "script_id")?;
        let line_offset = field_offset(info_fields, "line")?;
        let column_offset = field_offset(info_fields, "column")?;
        let field_count = info_fields.len();
        if field_count == 0 || raw_infos.len() % field_count != 0 {
            return Err(SnapshotError::InvalidSnapshot(
                "trace_function_infos length does not match its field count".into(),
            ));
        }
        let string_at = |index: u32| -> Result<String> {
            strings.get(index as usize).cloned().ok_or_else(|| {
                SnapshotError::InvalidSnapshot(format!("string index {index} out of range"))
            })
        };
        for info in raw_infos.chunks_exact(field_count) {
            self.function_infos.push(FunctionAllocationInfo {
                function_name: string_at(info[name_offset])?,
                script_name: string_at(info[script_name_offset])?,
                script_id: info[script_id_offset],
                line: info[line_offset],
                column: info[column_offset],
                total_count: 0,
                total_size: 0,
                total_live_count: 0,
                total_live_size: 0,
                trace_tops: Vec::new(),
                bottom_up_root: None,
            });
        }
        Ok(())
    }

    fn traverse(
        &mut self,
        raw: &[serde_json::Value],
        offset: usize,
        parent: Option<usize>,
        layout: &TraceNodeLayout,
        live: &HashMap<u32, LiveObjectStats>,
    ) -> Result<usize> {
        let id = uint_field(raw, offset + layout.id)? as u32;
        let function_info = uint_field(raw, offset + layout.function_info_index)? as usize;
        if function_info >= self.function_infos.len() {
            return Err(SnapshotError::InvalidSnapshot(format!(
                "trace node {id} references unknown function info {function_info}"
            )));
        }
        let stats = live.get(&id).copied().unwrap_or_default();
        let node_index = self.top_down_nodes.len();
        self.top_down_nodes.push(TopDownAllocationNode {
            id,
            function_info,
            allocation_count: uint_field(raw, offset + layout.count)? as u32,
            allocation_size: uint_field(raw, offset + layout.size)?,
            live_count: stats.count,
            live_size: stats.size,
            parent,
        });
        self.id_to_top_down.insert(id, node_index);
        self.add_trace_top(function_info, node_index);

        let children = raw
            .get(offset + layout.children)
            .and_then(|value| value.as_array())
            .ok_or_else(|| {
                SnapshotError::InvalidSnapshot("malformed allocation trace node".into())
            })?;
        let mut child_offset = 0;
        while child_offset < children.len() {
            self.traverse(children, child_offset, Some(node_index), layout, live)?;
            child_offset += layout.field_count;
        }
        Ok(node_index)
    }

    fn add_trace_top(&mut self, info_index: usize, node_index: usize) {
        let node = &self.top_down_nodes[node_index];
        if node.allocation_count == 0 {
            return;
        }
        let (count, size, live_count, live_size) = (
            node.allocation_count,
            node.allocation_size,
            node.live_count,
            node.live_size,
        );
        let info = &mut self.function_infos[info_index];
        info.trace_tops.push(node_index);
        info.total_count += count;
        info.total_size += size;
        info.total_live_count += live_count;
        info.total_live_size += live_size;
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Allocating functions with their aggregated totals, sorted by
    /// total size descending. The profile root is never expandable.
    pub fn serialize_trace_tops(&mut self) -> Vec<SerializedAllocationNode> {
        if let Some(tops) = &self.trace_tops {
            return tops.clone();
        }
        let mut tops = Vec::new();
        for info_index in 0..self.function_infos.len() {
            let info = &self.function_infos[info_index];
            if info.total_count == 0 {
                continue;
            }
            let node_id = self.next_node_id;
            self.next_node_id += 1;
            let is_root = info_index == 0;
            tops.push(serialize_node(
                node_id,
                info,
                info.total_count,
                info.total_size,
                info.total_live_count,
                info.total_live_size,
                !is_root,
            ));
            self.collapsed_top_to_info.insert(node_id, info_index);
        }
        tops.sort_by(|a, b| b.size.cmp(&a.size));
        self.trace_tops = Some(tops.clone());
        tops
    }

    /// Callers of the bottom-up node `node_id`: the unambiguous
    /// single-caller chain first, then the callers where it branches.
    pub fn serialize_callers(&mut self, node_id: u32) -> Result<AllocationNodeCallers> {
        let mut current = self.ensure_bottom_up_node(node_id)?;
        let mut nodes_with_single_caller = Vec::new();
        while self.bottom_up_nodes[current].callers.len() == 1 {
            current = self.bottom_up_nodes[current].callers[0];
            nodes_with_single_caller.push(self.serialize_caller(current));
        }
        let callers = self.bottom_up_nodes[current].callers.clone();
        let branching_callers = callers
            .into_iter()
            .map(|caller| self.serialize_caller(caller))
            .collect();
        Ok(AllocationNodeCallers {
            nodes_with_single_caller,
            branching_callers,
        })
    }

    /// Stack that allocated trace node `trace_node_id`, innermost frame
    /// first, or `None` for an unknown id.
    pub fn serialize_allocation_stack(
        &self,
        trace_node_id: u32,
    ) -> Option<Vec<AllocationStackFrame>> {
        let mut current = self.id_to_top_down.get(&trace_node_id).copied()?;
        let mut frames = Vec::new();
        loop {
            let node = &self.top_down_nodes[current];
            let info = &self.function_infos[node.function_info];
            frames.push(AllocationStackFrame {
                function_name: info.function_name.clone(),
                script_name: info.script_name.clone(),
                script_id: info.script_id,
                line: info.line,
                column: info.column,
            });
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Some(frames)
    }

    /// Ids of the top-down trace nodes folded into the bottom-up node
    /// `node_id`, for filtering objects by allocation site.
    pub fn trace_ids(&mut self, node_id: u32) -> Result<Vec<u32>> {
        let node = self.ensure_bottom_up_node(node_id)?;
        Ok(self.bottom_up_nodes[node].trace_top_ids.clone())
    }

    fn serialize_caller(&mut self, node_index: usize) -> SerializedAllocationNode {
        let caller_id = self.next_node_id;
        self.next_node_id += 1;
        self.id_to_bottom_up.insert(caller_id, node_index);
        let node = &self.bottom_up_nodes[node_index];
        let info = &self.function_infos[node.function_info];
        serialize_node(
            caller_id,
            info,
            node.allocation_count,
            node.allocation_size,
            node.live_count,
            node.live_size,
            !node.callers.is_empty(),
        )
    }

    // ------------------------------------------------------------------
    // Bottom-up tree
    // ------------------------------------------------------------------

    fn ensure_bottom_up_node(&mut self, node_id: u32) -> Result<usize> {
        if let Some(&node) = self.id_to_bottom_up.get(&node_id) {
            return Ok(node);
        }
        let info_index = self.collapsed_top_to_info.remove(&node_id).ok_or_else(|| {
            SnapshotError::InvalidQuery(format!("unknown allocation node id {node_id}"))
        })?;
        let root = match self.function_infos[info_index].bottom_up_root {
            Some(root) => root,
            None => self.build_bottom_up_tree(info_index),
        };
        self.id_to_bottom_up.insert(node_id, root);
        Ok(root)
    }

    /// Folds every top-down trace node of one function into a bottom-up
    /// tree rooted at that function, merging callers by function info.
    fn build_bottom_up_tree(&mut self, info_index: usize) -> usize {
        let root = self.new_bottom_up_node(info_index);
        let tops = self.function_infos[info_index].trace_tops.clone();
        for top in tops {
            let (count, size, live_count, live_size, trace_id) = {
                let node = &self.top_down_nodes[top];
                (
                    node.allocation_count,
                    node.allocation_size,
                    node.live_count,
                    node.live_size,
                    node.id,
                )
            };
            let mut node_index = top;
            let mut bottom_up = root;
            loop {
                let accumulated = &mut self.bottom_up_nodes[bottom_up];
                accumulated.allocation_count += count;
                accumulated.allocation_size += size;
                accumulated.live_count += live_count;
                accumulated.live_size += live_size;
                accumulated.trace_top_ids.push(trace_id);
                match self.top_down_nodes[node_index].parent {
                    Some(parent) => {
                        let caller_info = self.top_down_nodes[parent].function_info;
                        bottom_up = self.add_caller(bottom_up, caller_info);
                        node_index = parent;
                    }
                    None => break,
                }
            }
        }
        self.function_infos[info_index].bottom_up_root = Some(root);
        root
    }

    fn add_caller(&mut self, node_index: usize, caller_info: usize) -> usize {
        let existing = self.bottom_up_nodes[node_index]
            .callers
            .iter()
            .copied()
            .find(|&caller| self.bottom_up_nodes[caller].function_info == caller_info);
        match existing {
            Some(caller) => caller,
            None => {
                let caller = self.new_bottom_up_node(caller_info);
                self.bottom_up_nodes[node_index].callers.push(caller);
                caller
            }
        }
    }

    fn new_bottom_up_node(&mut self, info_index: usize) -> usize {
        let index = self.bottom_up_nodes.len();
        self.bottom_up_nodes.push(BottomUpAllocationNode {
            function_info: info_index,
            allocation_count: 0,
            allocation_size: 0,
            live_count: 0,
            live_size: 0,
            trace_top_ids: Vec::new(),
            callers: Vec::new(),
        });
        index
    }
}

fn serialize_node(
    id: u32,
    info: &FunctionAllocationInfo,
    count: u32,
    size: u64,
    live_count: u32,
    live_size: u64,
    has_children: bool,
) -> SerializedAllocationNode {
    SerializedAllocationNode {
        id,
        name: info.function_name.clone(),
        script_name: info.script_name.clone(),
        script_id: info.script_id,
        line: info.line,
        column: info.column,
        count,
        size,
        live_count,
        live_size,
        has_children,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strings() -> Vec<String> {
        ["(root)", "", "foo", "bar", "test.js"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // (root) -> foo (5 allocations, 100 bytes) -> bar (2 allocations, 40
    // bytes). One bar object of 16 bytes is still live.
    fn build_profile() -> AllocationProfile {
        let info_fields = fields(&["function_id", "name", "script_name", "script_id", "line", "column"]);
        let node_fields = fields(&["id", "function_info_index", "count", "size", "children"]);
        let infos: Vec<u32> = vec![
            0, 0, 1, 0, 0, 0, // (root)
            1, 2, 4, 7, 10, 4, // foo
            2, 3, 4, 7, 20, 2, // bar
        ];
        let tree: serde_json::Value = serde_json::json!([
            1, 0, 0, 0,
            [2, 1, 5, 100, [3, 2, 2, 40, []]]
        ]);
        let mut live = HashMap::new();
        live.insert(3, LiveObjectStats { count: 1, size: 16 });
        AllocationProfile::new(&info_fields, &node_fields, &infos, &tree, &strings(), &live)
            .unwrap()
    }

    #[test]
    fn trace_tops_skip_empty_functions_and_sort_by_size() {
        let mut profile = build_profile();
        let tops = profile.serialize_trace_tops();
        let names: Vec<&str> = tops.iter().map(|top| top.name.as_str()).collect();
        assert_eq!(names, vec!["foo", "bar"]);
        assert_eq!(tops[0].count, 5);
        assert_eq!(tops[0].size, 100);
        assert_eq!(tops[1].count, 2);
        assert_eq!(tops[1].size, 40);
        assert_eq!(tops[1].live_count, 1);
        assert_eq!(tops[1].live_size, 16);
        assert!(tops.iter().all(|top| top.has_children));
        assert_eq!(tops[1].line, 20);
        assert_eq!(tops[1].script_name, "test.js");

        // Cached on repeat calls, same ids.
        let again = profile.serialize_trace_tops();
        assert_eq!(again[0].id, tops[0].id);
    }

    #[test]
    fn callers_walk_the_single_caller_chain() {
        let mut profile = build_profile();
        let tops = profile.serialize_trace_tops();
        let bar_id = tops.iter().find(|top| top.name == "bar").map(|t| t.id);
        let callers = profile.serialize_callers(bar_id.unwrap()).unwrap();
        let chain: Vec<&str> = callers
            .nodes_with_single_caller
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        assert_eq!(chain, vec!["foo", "(root)"]);
        assert!(callers.branching_callers.is_empty());
        // The chain carries bar's allocations, not foo's own totals.
        assert_eq!(callers.nodes_with_single_caller[0].count, 2);
        assert_eq!(callers.nodes_with_single_caller[0].size, 40);
    }

    #[test]
    fn unknown_caller_id_is_an_error() {
        let mut profile = build_profile();
        profile.serialize_trace_tops();
        assert!(matches!(
            profile.serialize_callers(999),
            Err(SnapshotError::InvalidQuery(_))
        ));
    }

    #[test]
    fn allocation_stack_walks_parents() {
        let profile = build_profile();
        let stack = profile.serialize_allocation_stack(3).unwrap();
        let names: Vec<&str> = stack.iter().map(|frame| frame.function_name.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo", "(root)"]);
        assert_eq!(stack[0].line, 20);
        assert_eq!(stack[0].column, 2);
        assert!(profile.serialize_allocation_stack(42).is_none());
    }

    #[test]
    fn trace_ids_come_from_the_bottom_up_node() {
        let mut profile = build_profile();
        let tops = profile.serialize_trace_tops();
        let bar_id = tops.iter().find(|top| top.name == "bar").map(|t| t.id).unwrap();
        assert_eq!(profile.trace_ids(bar_id).unwrap(), vec![3]);
        let foo_id = tops.iter().find(|top| top.name == "foo").map(|t| t.id).unwrap();
        assert_eq!(profile.trace_ids(foo_id).unwrap(), vec![2]);
    }

    #[test]
    fn malformed_tree_is_rejected() {
        let info_fields = fields(&["function_id", "name", "script_name", "script_id", "line", "column"]);
        let node_fields = fields(&["id", "function_info_index", "count", "size", "children"]);
        let infos: Vec<u32> = vec![0, 0, 1, 0, 0, 0];
        let tree = serde_json::json!([1, 0, 0, 0]); // children missing
        let result = AllocationProfile::new(
            &info_fields,
            &node_fields,
            &infos,
            &tree,
            &strings(),
            &HashMap::new(),
        );
        assert!(matches!(result, Err(SnapshotError::InvalidSnapshot(_))));
    }
}

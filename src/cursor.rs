//! Cheap cursor views over the flat snapshot arrays.
//!
//! [`HeapNode`], [`HeapEdge`] and [`RetainerEdge`] are `Copy` handles
//! pairing a snapshot reference with a raw index. All field reads go
//! straight to the flat arrays, so iterating millions of nodes allocates
//! nothing; strings are borrowed from the snapshot's string table except
//! for assembled concatenated-string names.

use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

use crate::snapshot::{
    HeapSnapshot, NODE_FLAG_CAN_BE_QUERIED, NODE_FLAG_DETACHED_DOM_TREE_NODE,
};

// ============================================================================
// Nodes
// ============================================================================

/// A view of one node. `node_index` is the node's starting offset in the
/// flat nodes array (always a multiple of the node field count).
#[derive(Clone, Copy)]
pub struct HeapNode<'a> {
    pub(crate) snapshot: &'a HeapSnapshot,
    pub node_index: u32,
}

impl<'a> HeapNode<'a> {
    pub(crate) fn new(snapshot: &'a HeapSnapshot, node_index: u32) -> Self {
        HeapNode { snapshot, node_index }
    }

    fn field(&self, offset: usize) -> u32 {
        self.snapshot.nodes[self.node_index as usize + offset]
    }

    pub fn ordinal(&self) -> usize {
        self.node_index as usize / self.snapshot.node_field_count
    }

    pub fn raw_type(&self) -> u32 {
        self.field(self.snapshot.node_type_offset)
    }

    pub fn type_name(&self) -> &'a str {
        self.snapshot
            .node_types
            .get(self.raw_type() as usize)
            .map_or("", String::as_str)
    }

    /// The node's display name. Concatenated strings are flattened by
    /// walking their rope structure.
    pub fn name(&self) -> Cow<'a, str> {
        if Some(self.raw_type()) == self.snapshot.node_cons_string_type {
            Cow::Owned(self.snapshot.cons_string_name(self.node_index))
        } else {
            Cow::Borrowed(self.raw_name())
        }
    }

    /// The name string exactly as stored, without rope flattening.
    pub fn raw_name(&self) -> &'a str {
        self.snapshot
            .strings
            .get(self.field(self.snapshot.node_name_offset) as usize)
            .map_or("", String::as_str)
    }

    pub fn id(&self) -> u32 {
        self.field(self.snapshot.node_id_offset)
    }

    pub fn self_size(&self) -> u64 {
        u64::from(self.field(self.snapshot.node_self_size_offset))
    }

    pub fn retained_size(&self) -> f64 {
        self.snapshot.retained_sizes[self.ordinal()]
    }

    pub fn distance(&self) -> i32 {
        self.snapshot.node_distances[self.ordinal()]
    }

    pub fn trace_node_id(&self) -> u32 {
        match self.snapshot.node_trace_node_id_offset {
            Some(offset) => self.field(offset),
            None => 0,
        }
    }

    /// Key grouping instances into classes: the name index for objects
    /// and natives, a negative type marker for everything else.
    pub fn class_index(&self) -> i64 {
        let node_type = Some(self.raw_type());
        if node_type == self.snapshot.node_object_type
            || node_type == self.snapshot.node_native_type
        {
            i64::from(self.field(self.snapshot.node_name_offset))
        } else {
            -1 - i64::from(self.raw_type())
        }
    }

    pub fn class_name(&self) -> Cow<'a, str> {
        match self.type_name() {
            "hidden" => Cow::Borrowed("(system)"),
            "object" | "native" => self.name(),
            "code" => Cow::Borrowed("(compiled code)"),
            other => Cow::Owned(format!("({other})")),
        }
    }

    pub fn dominator(&self) -> HeapNode<'a> {
        let dominator_ordinal = self.snapshot.dominators_tree[self.ordinal()] as usize;
        HeapNode::new(
            self.snapshot,
            (dominator_ordinal * self.snapshot.node_field_count) as u32,
        )
    }

    pub fn is_root(&self) -> bool {
        self.node_index == self.snapshot.root_node_index
    }

    pub fn is_hidden(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_hidden_type
    }

    pub fn is_array(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_array_type
    }

    pub fn is_synthetic(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_synthetic_type
    }

    pub fn is_native(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_native_type
    }

    pub fn is_code(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_code_type
    }

    pub fn is_object(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.node_object_type
    }

    pub fn is_user_root(&self) -> bool {
        !self.is_synthetic()
    }

    pub fn is_document_dom_trees_root(&self) -> bool {
        self.is_synthetic() && self.raw_name() == "(Document DOM trees)"
    }

    fn flags(&self) -> u32 {
        self.snapshot.node_flags.get(self.ordinal()).copied().unwrap_or(0)
    }

    pub fn can_be_queried(&self) -> bool {
        self.flags() & NODE_FLAG_CAN_BE_QUERIED != 0
    }

    pub fn detached_dom_tree_node(&self) -> bool {
        self.flags() & NODE_FLAG_DETACHED_DOM_TREE_NODE != 0
    }

    pub fn edge_indexes_start(&self) -> u32 {
        self.snapshot.first_edge_indexes[self.ordinal()]
    }

    pub fn edge_indexes_end(&self) -> u32 {
        self.snapshot.first_edge_indexes[self.ordinal() + 1]
    }

    pub fn edges(&self) -> EdgeIter<'a> {
        EdgeIter {
            snapshot: self.snapshot,
            edge_index: self.edge_indexes_start(),
            end: self.edge_indexes_end(),
        }
    }

    pub fn retainers(&self) -> RetainerIter<'a> {
        let ordinal = self.ordinal();
        RetainerIter {
            snapshot: self.snapshot,
            retainer_index: self.snapshot.first_retainer_index[ordinal],
            end: self.snapshot.first_retainer_index[ordinal + 1],
        }
    }

    pub fn retainers_count(&self) -> usize {
        let ordinal = self.ordinal();
        (self.snapshot.first_retainer_index[ordinal + 1]
            - self.snapshot.first_retainer_index[ordinal]) as usize
    }

    pub fn serialize(&self) -> SerializedNode {
        SerializedNode {
            id: self.id(),
            name: self.name().into_owned(),
            distance: self.distance(),
            node_index: self.node_index,
            retained_size: self.retained_size(),
            self_size: self.self_size(),
            type_name: self.type_name().to_string(),
            can_be_queried: self.can_be_queried(),
            detached_dom_tree_node: self.detached_dom_tree_node(),
        }
    }
}

impl fmt::Debug for HeapNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapNode")
            .field("node_index", &self.node_index)
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

// ============================================================================
// Edges
// ============================================================================

/// A view of one containment edge. `edge_index` is the edge's starting
/// offset in the flat edges array.
#[derive(Clone, Copy)]
pub struct HeapEdge<'a> {
    pub(crate) snapshot: &'a HeapSnapshot,
    pub edge_index: u32,
}

impl<'a> HeapEdge<'a> {
    pub(crate) fn new(snapshot: &'a HeapSnapshot, edge_index: u32) -> Self {
        HeapEdge { snapshot, edge_index }
    }

    fn field(&self, offset: usize) -> u32 {
        self.snapshot.containment_edges[self.edge_index as usize + offset]
    }

    pub fn raw_type(&self) -> u32 {
        self.field(self.snapshot.edge_type_offset)
    }

    pub fn type_name(&self) -> &'a str {
        self.snapshot
            .edge_types
            .get(self.raw_type() as usize)
            .map_or("", String::as_str)
    }

    /// The numeric index of an element or hidden edge; `None` for edges
    /// with string names.
    pub fn index_name(&self) -> Option<u32> {
        let edge_type = Some(self.raw_type());
        if edge_type == self.snapshot.edge_element_type
            || edge_type == self.snapshot.edge_hidden_type
        {
            Some(self.field(self.snapshot.edge_name_offset))
        } else {
            None
        }
    }

    pub fn name(&self) -> Cow<'a, str> {
        match self.index_name() {
            Some(index) => Cow::Owned(index.to_string()),
            None => Cow::Borrowed(
                self.snapshot
                    .strings
                    .get(self.field(self.snapshot.edge_name_offset) as usize)
                    .map_or("", String::as_str),
            ),
        }
    }

    /// Element and hidden edges are named by index; shortcut edges count
    /// as numeric when their name parses as an integer.
    pub fn has_string_name(&self) -> bool {
        if self.index_name().is_some() {
            return false;
        }
        if self.is_shortcut() {
            return self.name().parse::<i64>().is_err();
        }
        true
    }

    pub fn is_element(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_element_type
    }

    pub fn is_hidden(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_hidden_type
    }

    pub fn is_internal(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_internal_type
    }

    pub fn is_invisible(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_invisible_type
    }

    pub fn is_shortcut(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_shortcut_type
    }

    pub fn is_weak(&self) -> bool {
        Some(self.raw_type()) == self.snapshot.edge_weak_type
    }

    /// The target node.
    pub fn node(&self) -> HeapNode<'a> {
        HeapNode::new(self.snapshot, self.field(self.snapshot.edge_to_node_offset))
    }

    pub fn serialize(&self) -> SerializedEdge {
        SerializedEdge {
            name: self.name().into_owned(),
            node: self.node().serialize(),
            type_name: self.type_name().to_string(),
            edge_index: self.edge_index,
        }
    }
}

impl fmt::Display for HeapEdge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self.type_name() {
            "context" => write!(f, "->{name}"),
            "element" => write!(f, "[{name}]"),
            "weak" => write!(f, "[[{name}]]"),
            "property" => {
                if name.contains(' ') {
                    write!(f, "[\"{name}\"]")
                } else {
                    write!(f, ".{name}")
                }
            }
            "shortcut" => {
                if name.parse::<i64>().is_ok() {
                    write!(f, "[{name}]")
                } else if name.contains(' ') {
                    write!(f, "[\"{name}\"]")
                } else {
                    write!(f, ".{name}")
                }
            }
            "internal" | "hidden" | "invisible" => write!(f, "{{{name}}}"),
            _ => write!(f, "?{name}?"),
        }
    }
}

impl fmt::Debug for HeapEdge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapEdge")
            .field("edge_index", &self.edge_index)
            .field("type", &self.type_name())
            .field("name", &self.name())
            .finish()
    }
}

// ============================================================================
// Retainers
// ============================================================================

/// A view of one entry in the reverse index: the edge and source node
/// retaining some target node.
#[derive(Clone, Copy)]
pub struct RetainerEdge<'a> {
    pub(crate) snapshot: &'a HeapSnapshot,
    pub retainer_index: u32,
}

impl<'a> RetainerEdge<'a> {
    pub(crate) fn new(snapshot: &'a HeapSnapshot, retainer_index: u32) -> Self {
        RetainerEdge { snapshot, retainer_index }
    }

    /// The containment edge this retainer entry mirrors.
    pub fn edge(&self) -> HeapEdge<'a> {
        HeapEdge::new(
            self.snapshot,
            self.snapshot.retaining_edges[self.retainer_index as usize],
        )
    }

    /// The retaining (source) node.
    pub fn node(&self) -> HeapNode<'a> {
        HeapNode::new(
            self.snapshot,
            self.snapshot.retaining_nodes[self.retainer_index as usize],
        )
    }

    pub fn name(&self) -> Cow<'a, str> {
        self.edge().name()
    }

    pub fn type_name(&self) -> &'a str {
        self.edge().type_name()
    }

    pub fn serialize(&self) -> SerializedEdge {
        SerializedEdge {
            name: self.name().into_owned(),
            node: self.node().serialize(),
            type_name: self.type_name().to_string(),
            edge_index: self.edge().edge_index,
        }
    }
}

// ============================================================================
// Iterators
// ============================================================================

pub struct EdgeIter<'a> {
    snapshot: &'a HeapSnapshot,
    edge_index: u32,
    end: u32,
}

impl<'a> Iterator for EdgeIter<'a> {
    type Item = HeapEdge<'a>;

    fn next(&mut self) -> Option<HeapEdge<'a>> {
        if self.edge_index >= self.end {
            return None;
        }
        let edge = HeapEdge::new(self.snapshot, self.edge_index);
        self.edge_index += self.snapshot.edge_field_count as u32;
        Some(edge)
    }
}

pub struct RetainerIter<'a> {
    snapshot: &'a HeapSnapshot,
    retainer_index: u32,
    end: u32,
}

impl<'a> Iterator for RetainerIter<'a> {
    type Item = RetainerEdge<'a>;

    fn next(&mut self) -> Option<RetainerEdge<'a>> {
        if self.retainer_index >= self.end {
            return None;
        }
        let retainer = RetainerEdge::new(self.snapshot, self.retainer_index);
        self.retainer_index += 1;
        Some(retainer)
    }
}

// ============================================================================
// Serialized forms
// ============================================================================

fn is_false(value: &bool) -> bool {
    !*value
}

/// Wire form of a node row, matching the DevTools frontend field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    pub id: u32,
    pub name: String,
    pub distance: i32,
    pub node_index: u32,
    pub retained_size: f64,
    pub self_size: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    pub can_be_queried: bool,
    #[serde(rename = "detachedDOMTreeNode", skip_serializing_if = "is_false")]
    pub detached_dom_tree_node: bool,
}

/// Wire form of an edge or retainer row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedEdge {
    pub name: String,
    pub node: SerializedNode,
    #[serde(rename = "type")]
    pub type_name: String,
    pub edge_index: u32,
}

/// One page of provider output plus the window it covers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRange<T> {
    pub start_position: usize,
    pub end_position: usize,
    pub total_length: usize,
    pub items: Vec<T>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::loader::SnapshotLoader;
    use crate::snapshot::HeapSnapshot;

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

    fn build(json: &str) -> HeapSnapshot {
        let mut loader = SnapshotLoader::new();
        loader.write(json).unwrap();
        loader.close().unwrap();
        loader.build_snapshot().unwrap()
    }

    // Every edge type fans out from the root to E.
    fn edge_zoo() -> HeapSnapshot {
        build(&snapshot_json(
            2,
            7,
            "9,0,1,0,7,0, 3,1,3,10,0,0",
            "0,2,6, 1,7,6, 2,3,6, 3,4,6, 4,3,6, 5,5,6, 6,6,6",
            r#"["(root)","E","ctx","a b","i","s","wk"]"#,
        ))
    }

    #[test]
    fn node_accessors() {
        let snapshot = edge_zoo();
        let e = snapshot.node(6);
        assert_eq!(e.id(), 3);
        assert_eq!(e.self_size(), 10);
        assert_eq!(e.name(), "E");
        assert_eq!(e.type_name(), "object");
        assert!(e.is_object());
        assert!(!e.is_synthetic());
        assert!(e.is_user_root());
        assert_eq!(e.ordinal(), 1);
        assert_eq!(e.retainers_count(), 7);

        let root = snapshot.root();
        assert!(root.is_root());
        assert!(root.is_synthetic());
        assert_eq!(root.edges().count(), 7);
    }

    #[test]
    fn class_names_follow_node_type() {
        let json = snapshot_json(
            3,
            0,
            "0,1,1,4,0,0, 4,2,3,4,0,0, 3,0,5,4,0,0",
            "",
            r#"["Thing","sys","compiled"]"#,
        );
        // Root must be first; reuse index 0 as an object class check.
        let snapshot = build(&json);
        assert_eq!(snapshot.node(0).class_name(), "(system)");
        assert_eq!(snapshot.node(6).class_name(), "(compiled code)");
        assert_eq!(snapshot.node(12).class_name(), "Thing");
        assert_eq!(snapshot.node(0).class_index(), -1);
        assert_eq!(snapshot.node(12).class_index(), 0);
    }

    #[test]
    fn edge_display_forms() {
        let snapshot = edge_zoo();
        let rendered: Vec<String> = snapshot
            .root()
            .edges()
            .map(|edge| edge.to_string())
            .collect();
        assert_eq!(
            rendered,
            vec!["->ctx", "[7]", "[\"a b\"]", "{i}", "{3}", ".s", "[[wk]]"]
        );
    }

    #[test]
    fn element_and_hidden_edges_have_index_names() {
        let snapshot = edge_zoo();
        let edges: Vec<_> = snapshot.root().edges().collect();
        assert_eq!(edges[1].index_name(), Some(7));
        assert_eq!(edges[1].name(), "7");
        assert!(!edges[1].has_string_name());
        assert_eq!(edges[4].index_name(), Some(3));
        assert!(edges[2].has_string_name());
        assert_eq!(edges[2].name(), "a b");
        assert!(edges[5].has_string_name());
        assert!(edges[6].is_weak());
        assert!(edges[5].is_shortcut());
    }

    #[test]
    fn retainer_edges_delegate_to_their_edge() {
        let snapshot = edge_zoo();
        let e = snapshot.node(6);
        let weak = e
            .retainers()
            .find(|retainer| retainer.type_name() == "weak")
            .unwrap();
        assert_eq!(weak.name(), "wk");
        assert_eq!(weak.node().node_index, 0);
        assert_eq!(weak.edge().node().node_index, 6);
    }

    #[test]
    fn cons_string_names_are_assembled() {
        // C is a rope: first -> "Hello ", second -> "world".
        let json = snapshot_json(
            4,
            3,
            "9,0,1,0,1,0, 10,1,3,16,2,0, 2,5,5,7,0,0, 2,6,7,5,0,0",
            "2,2,6, 3,3,12, 3,4,18",
            r#"["(root)","(concat)","c","first","second","Hello ","world"]"#,
        );
        let snapshot = build(&json);
        let c = snapshot.node(6);
        assert_eq!(c.name(), "Hello world");
        assert_eq!(c.raw_name(), "(concat)");
        // Cached second read.
        assert_eq!(c.name(), "Hello world");
    }

    #[test]
    fn serialized_node_uses_devtools_names() {
        let snapshot = edge_zoo();
        let serialized = snapshot.node(6).serialize();
        let json = serde_json::to_value(&serialized).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["selfSize"], 10);
        assert_eq!(json["retainedSize"], 10.0);
        assert_eq!(json["type"], "object");
        assert_eq!(json["nodeIndex"], 6);
        assert!(json.get("detachedDOMTreeNode").is_none());
    }
}

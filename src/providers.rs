//! Paginated, sortable views used by snapshot UIs.
//!
//! Grids showing millions of rows only ever display a window, so the
//! providers keep an iteration order of raw indexes and sort just enough
//! of it to serve the requested `[begin, end)` window, tracking how much
//! of the head and tail is already ordered. The partial quicksort only
//! recurses into partitions overlapping the window.

use std::cmp::Ordering;

use crate::cursor::{HeapEdge, HeapNode, ItemsRange, RetainerEdge, SerializedEdge, SerializedNode};
use crate::snapshot::{HeapSnapshot, Result, SnapshotError};

// ============================================================================
// Sort configuration
// ============================================================================

/// Sortable columns. [`SortField::EdgeName`] only applies to edge
/// providers; the rest read fields of the row's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    EdgeName,
    Id,
    Name,
    Distance,
    RetainedSize,
    SelfSize,
}

/// Primary and secondary sort keys for a provider.
#[derive(Debug, Clone, Copy)]
pub struct ComparatorConfig {
    pub field1: SortField,
    pub ascending1: bool,
    pub field2: SortField,
    pub ascending2: bool,
}

fn compare_node_field(
    field: SortField,
    ascending: bool,
    a: HeapNode<'_>,
    b: HeapNode<'_>,
) -> Ordering {
    let ordering = match field {
        SortField::Id => a.id().cmp(&b.id()),
        SortField::Name => a.name().cmp(&b.name()),
        SortField::Distance => a.distance().cmp(&b.distance()),
        SortField::RetainedSize => a
            .retained_size()
            .partial_cmp(&b.retained_size())
            .unwrap_or(Ordering::Equal),
        SortField::SelfSize => a.self_size().cmp(&b.self_size()),
        SortField::EdgeName => Ordering::Equal,
    };
    if ascending { ordering } else { ordering.reverse() }
}

// ============================================================================
// Nodes provider
// ============================================================================

/// Pages through a fixed set of nodes, typically one class's instances.
pub struct NodesProvider<'a> {
    snapshot: &'a HeapSnapshot,
    iteration_order: Vec<u32>,
    current_comparator: Option<ComparatorConfig>,
    sorted_prefix_length: usize,
    sorted_suffix_length: usize,
}

impl<'a> NodesProvider<'a> {
    pub fn new(snapshot: &'a HeapSnapshot, node_indexes: Vec<u32>) -> Self {
        NodesProvider {
            snapshot,
            iteration_order: node_indexes,
            current_comparator: None,
            sorted_prefix_length: 0,
            sorted_suffix_length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iteration_order.is_empty()
    }

    pub fn total_length(&self) -> usize {
        self.iteration_order.len()
    }

    /// Sets the sort order and forgets any previously sorted windows.
    pub fn sort_and_rewind(&mut self, comparator: ComparatorConfig) {
        self.current_comparator = Some(comparator);
        self.sorted_prefix_length = 0;
        self.sorted_suffix_length = 0;
    }

    /// Position the node with `snapshot_object_id` would occupy under the
    /// current sort order, without sorting anything.
    pub fn node_position(&self, snapshot_object_id: u32) -> Option<usize> {
        let target = self
            .iteration_order
            .iter()
            .copied()
            .find(|&node_index| self.snapshot.node(node_index).id() == snapshot_object_id)?;
        let smaller = self
            .iteration_order
            .iter()
            .filter(|&&node_index| self.compare(node_index, target) == Ordering::Less)
            .count();
        Some(smaller)
    }

    fn compare(&self, a_index: u32, b_index: u32) -> Ordering {
        let Some(config) = self.current_comparator else {
            return a_index.cmp(&b_index);
        };
        let a = self.snapshot.node(a_index);
        let b = self.snapshot.node(b_index);
        compare_node_field(config.field1, config.ascending1, a, b)
            .then_with(|| compare_node_field(config.field2, config.ascending2, a, b))
            .then_with(|| a_index.cmp(&b_index))
    }

    /// Serializes the nodes in `[begin, end)` under the current sort
    /// order, sorting only as much of the backing array as needed.
    pub fn serialize_items_range(
        &mut self,
        begin: usize,
        end: usize,
    ) -> Result<ItemsRange<SerializedNode>> {
        if begin > end {
            return Err(SnapshotError::InvalidQuery(format!(
                "invalid range [{begin}, {end})"
            )));
        }
        let total = self.iteration_order.len();
        if begin >= total {
            return Ok(ItemsRange {
                start_position: 0,
                end_position: 0,
                total_length: total,
                items: Vec::new(),
            });
        }
        let end = end.min(total);
        if self.current_comparator.is_some() {
            let mut order = std::mem::take(&mut self.iteration_order);
            let mut prefix = self.sorted_prefix_length;
            let mut suffix = self.sorted_suffix_length;
            windowed_sort(&mut order, &mut prefix, &mut suffix, begin, end, |&x, &y| {
                self.compare(x, y)
            });
            self.sorted_prefix_length = prefix;
            self.sorted_suffix_length = suffix;
            self.iteration_order = order;
        }
        let items = self.iteration_order[begin..end]
            .iter()
            .map(|&node_index| self.snapshot.node(node_index).serialize())
            .collect();
        Ok(ItemsRange {
            start_position: begin,
            end_position: end,
            total_length: total,
            items,
        })
    }
}

// ============================================================================
// Edges provider
// ============================================================================

#[derive(Clone, Copy)]
enum EdgeKind {
    /// Items are containment edge indexes of one source node.
    Containment,
    /// Items are retainer indexes of one target node.
    Retainers,
}

/// Pages through one node's outgoing edges or retainers.
pub struct EdgesProvider<'a> {
    snapshot: &'a HeapSnapshot,
    kind: EdgeKind,
    iteration_order: Vec<u32>,
    current_comparator: Option<ComparatorConfig>,
    sorted_prefix_length: usize,
    sorted_suffix_length: usize,
}

impl<'a> EdgesProvider<'a> {
    pub(crate) fn containment(snapshot: &'a HeapSnapshot, node_index: u32) -> Self {
        let iteration_order = snapshot
            .node(node_index)
            .edges()
            .filter(|edge| !edge.is_invisible())
            .map(|edge| edge.edge_index)
            .collect();
        EdgesProvider {
            snapshot,
            kind: EdgeKind::Containment,
            iteration_order,
            current_comparator: None,
            sorted_prefix_length: 0,
            sorted_suffix_length: 0,
        }
    }

    pub(crate) fn retainers(snapshot: &'a HeapSnapshot, node_index: u32) -> Self {
        // Weak retainers and the synthetic root say nothing about why an
        // object is alive, so retainer views hide them.
        let iteration_order = snapshot
            .node(node_index)
            .retainers()
            .filter(|retainer| {
                let edge = retainer.edge();
                !edge.is_invisible() && !edge.is_weak() && !retainer.node().is_root()
            })
            .map(|retainer| retainer.retainer_index)
            .collect();
        EdgesProvider {
            snapshot,
            kind: EdgeKind::Retainers,
            iteration_order,
            current_comparator: None,
            sorted_prefix_length: 0,
            sorted_suffix_length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iteration_order.is_empty()
    }

    pub fn total_length(&self) -> usize {
        self.iteration_order.len()
    }

    pub fn sort_and_rewind(&mut self, comparator: ComparatorConfig) {
        self.current_comparator = Some(comparator);
        self.sorted_prefix_length = 0;
        self.sorted_suffix_length = 0;
    }

    fn item_edge(&self, index: u32) -> HeapEdge<'a> {
        match self.kind {
            EdgeKind::Containment => HeapEdge::new(self.snapshot, index),
            EdgeKind::Retainers => RetainerEdge::new(self.snapshot, index).edge(),
        }
    }

    /// The node shown on the row: the edge target for containment rows,
    /// the retaining node for retainer rows.
    fn item_node(&self, index: u32) -> HeapNode<'a> {
        match self.kind {
            EdgeKind::Containment => HeapEdge::new(self.snapshot, index).node(),
            EdgeKind::Retainers => RetainerEdge::new(self.snapshot, index).node(),
        }
    }

    fn serialize_item(&self, index: u32) -> SerializedEdge {
        match self.kind {
            EdgeKind::Containment => HeapEdge::new(self.snapshot, index).serialize(),
            EdgeKind::Retainers => RetainerEdge::new(self.snapshot, index).serialize(),
        }
    }

    fn compare_by(&self, field: SortField, ascending: bool, a: u32, b: u32) -> Ordering {
        if field != SortField::EdgeName {
            return compare_node_field(field, ascending, self.item_node(a), self.item_node(b));
        }
        let edge_a = self.item_edge(a);
        let edge_b = self.item_edge(b);
        // __proto__ sorts last regardless of direction.
        if edge_b.name() == "__proto__" {
            return Ordering::Less;
        }
        if edge_a.name() == "__proto__" {
            return Ordering::Greater;
        }
        let ordering = if edge_a.has_string_name() == edge_b.has_string_name() {
            match (edge_a.index_name(), edge_b.index_name()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => edge_a.name().cmp(&edge_b.name()),
            }
        } else if edge_a.has_string_name() {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        if ascending { ordering } else { ordering.reverse() }
    }

    fn compare(&self, a: u32, b: u32) -> Ordering {
        let Some(config) = self.current_comparator else {
            return a.cmp(&b);
        };
        self.compare_by(config.field1, config.ascending1, a, b)
            .then_with(|| self.compare_by(config.field2, config.ascending2, a, b))
            .then_with(|| a.cmp(&b))
    }

    pub fn serialize_items_range(
        &mut self,
        begin: usize,
        end: usize,
    ) -> Result<ItemsRange<SerializedEdge>> {
        if begin > end {
            return Err(SnapshotError::InvalidQuery(format!(
                "invalid range [{begin}, {end})"
            )));
        }
        let total = self.iteration_order.len();
        if begin >= total {
            return Ok(ItemsRange {
                start_position: 0,
                end_position: 0,
                total_length: total,
                items: Vec::new(),
            });
        }
        let end = end.min(total);
        if self.current_comparator.is_some() {
            let mut order = std::mem::take(&mut self.iteration_order);
            let mut prefix = self.sorted_prefix_length;
            let mut suffix = self.sorted_suffix_length;
            windowed_sort(&mut order, &mut prefix, &mut suffix, begin, end, |&x, &y| {
                self.compare(x, y)
            });
            self.sorted_prefix_length = prefix;
            self.sorted_suffix_length = suffix;
            self.iteration_order = order;
        }
        let items = self.iteration_order[begin..end]
            .iter()
            .map(|&index| self.serialize_item(index))
            .collect();
        Ok(ItemsRange {
            start_position: begin,
            end_position: end,
            total_length: total,
            items,
        })
    }
}

// ============================================================================
// Windowed sorting primitives
// ============================================================================

/// Sorts just enough of `order` that `[begin, end)` holds its final
/// values, maintaining the already-sorted prefix and suffix lengths.
fn windowed_sort<F: Fn(&u32, &u32) -> Ordering>(
    order: &mut [u32],
    sorted_prefix: &mut usize,
    sorted_suffix: &mut usize,
    begin: usize,
    end: usize,
    compare: F,
) {
    let total = order.len();
    if total == 0 {
        return;
    }
    if *sorted_prefix < end && begin < total - *sorted_suffix {
        sort_range(
            order,
            &compare,
            *sorted_prefix,
            total - 1 - *sorted_suffix,
            begin,
            end,
        );
        if begin <= *sorted_prefix {
            *sorted_prefix = end;
        }
        if end >= total - *sorted_suffix {
            *sorted_suffix = total - begin;
        }
    }
}

/// Sorts `array[left_bound..=right_bound]` far enough that positions
/// `[window_left, window_right)` hold their fully-sorted values. Falls
/// back to a whole-array sort when the window covers everything.
pub fn sort_range<T: Copy, F: Fn(&T, &T) -> Ordering>(
    array: &mut [T],
    compare: &F,
    left_bound: usize,
    right_bound: usize,
    window_left: usize,
    window_right: usize,
) {
    if array.is_empty() {
        return;
    }
    if left_bound == 0
        && right_bound == array.len() - 1
        && window_left == 0
        && window_right >= right_bound
    {
        array.sort_by(|a, b| compare(a, b));
    } else {
        quick_sort_range(array, compare, left_bound, right_bound, window_left, window_right);
    }
}

fn quick_sort_range<T: Copy, F: Fn(&T, &T) -> Ordering>(
    array: &mut [T],
    compare: &F,
    left: usize,
    right: usize,
    window_left: usize,
    window_right: usize,
) {
    if right <= left {
        return;
    }
    let pivot_position = partition(array, compare, left, right, left + (right - left) / 2);
    // Only partitions overlapping the window need further sorting.
    if window_left < pivot_position {
        quick_sort_range(array, compare, left, pivot_position - 1, window_left, window_right);
    }
    if pivot_position < window_right {
        quick_sort_range(array, compare, pivot_position + 1, right, window_left, window_right);
    }
}

/// Lomuto partition of `array[left..=right]` around the value at
/// `pivot_index`; returns the pivot's final position.
pub fn partition<T: Copy, F: Fn(&T, &T) -> Ordering>(
    array: &mut [T],
    compare: &F,
    left: usize,
    right: usize,
    pivot_index: usize,
) -> usize {
    let pivot_value = array[pivot_index];
    array.swap(right, pivot_index);
    let mut store_index = left;
    for i in left..right {
        if compare(&array[i], &pivot_value) == Ordering::Less {
            array.swap(store_index, i);
            store_index += 1;
        }
    }
    array.swap(right, store_index);
    store_index
}

/// First index whose element is not less than `value` (the array must be
/// sorted ascending).
pub fn lower_bound<T: Ord>(array: &[T], value: &T) -> usize {
    array.partition_point(|item| item < value)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SnapshotLoader;
    use crate::snapshot::NodeFilter;

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

    // root holds three Obj instances of differing sizes.
    fn three_objects() -> HeapSnapshot {
        build(&snapshot_json(
            4,
            3,
            "9,0,1,0,3,0, 3,1,3,30,0,0, 3,1,5,10,0,0, 3,1,7,20,0,0",
            "2,2,6, 2,3,12, 2,4,18",
            r#"["(root)","Obj","a","b","c"]"#,
        ))
    }

    #[test]
    fn lower_bound_finds_first_not_less() {
        let values = [2u64, 4, 4, 8];
        assert_eq!(lower_bound(&values, &1), 0);
        assert_eq!(lower_bound(&values, &4), 1);
        assert_eq!(lower_bound(&values, &5), 3);
        assert_eq!(lower_bound(&values, &9), 4);
    }

    #[test]
    fn partition_splits_around_pivot() {
        let mut values = [5, 1, 9, 3, 7];
        let position = partition(&mut values, &|a: &i32, b: &i32| a.cmp(b), 0, 4, 0);
        assert_eq!(values[position], 5);
        assert!(values[..position].iter().all(|&v| v < 5));
        assert!(values[position + 1..].iter().all(|&v| v >= 5));
    }

    #[test]
    fn sort_range_orders_the_requested_window() {
        let compare = |a: &i32, b: &i32| a.cmp(b);
        let mut partial: Vec<i32> = vec![9, 3, 7, 1, 8, 2, 6, 4, 5, 0];
        let mut full = partial.clone();
        full.sort();
        sort_range(&mut partial, &compare, 0, 9, 3, 6);
        assert_eq!(&partial[3..6], &full[3..6]);
    }

    #[test]
    fn nodes_provider_sorts_by_self_size() {
        let snapshot = three_objects();
        let mut provider = snapshot
            .create_nodes_provider_for_class("Obj", &NodeFilter::default())
            .unwrap();
        assert!(!provider.is_empty());
        assert_eq!(provider.total_length(), 3);
        provider.sort_and_rewind(ComparatorConfig {
            field1: SortField::SelfSize,
            ascending1: false,
            field2: SortField::Id,
            ascending2: true,
        });
        let range = provider.serialize_items_range(0, 10).unwrap();
        assert_eq!(range.start_position, 0);
        assert_eq!(range.end_position, 3);
        assert_eq!(range.total_length, 3);
        let sizes: Vec<u64> = range.items.iter().map(|item| item.self_size).collect();
        assert_eq!(sizes, vec![30, 20, 10]);
    }

    #[test]
    fn nodes_provider_pages_consistently() {
        let snapshot = three_objects();
        let mut provider = snapshot
            .create_nodes_provider_for_class("Obj", &NodeFilter::default())
            .unwrap();
        provider.sort_and_rewind(ComparatorConfig {
            field1: SortField::Id,
            ascending1: true,
            field2: SortField::SelfSize,
            ascending2: true,
        });
        let first = provider.serialize_items_range(0, 2).unwrap();
        let second = provider.serialize_items_range(2, 3).unwrap();
        let ids: Vec<u32> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![3, 5, 7]);

        let empty = provider.serialize_items_range(10, 20).unwrap();
        assert_eq!(empty.total_length, 3);
        assert!(empty.items.is_empty());

        assert!(matches!(
            provider.serialize_items_range(2, 1),
            Err(SnapshotError::InvalidQuery(_))
        ));
    }

    #[test]
    fn node_position_counts_smaller_items() {
        let snapshot = three_objects();
        let mut provider = snapshot
            .create_nodes_provider_for_class("Obj", &NodeFilter::default())
            .unwrap();
        provider.sort_and_rewind(ComparatorConfig {
            field1: SortField::SelfSize,
            ascending1: true,
            field2: SortField::Id,
            ascending2: true,
        });
        // Sizes are 30/10/20 for ids 3/5/7.
        assert_eq!(provider.node_position(5), Some(0));
        assert_eq!(provider.node_position(7), Some(1));
        assert_eq!(provider.node_position(3), Some(2));
        assert_eq!(provider.node_position(99), None);
    }

    #[test]
    fn edge_names_sort_with_proto_last() {
        // root edges: .b, .a, .__proto__, [5]
        let snapshot = build(&snapshot_json(
            2,
            4,
            "9,0,1,0,4,0, 3,1,3,10,0,0",
            "2,2,6, 2,3,6, 2,4,6, 1,5,6",
            r#"["(root)","E","b","a","__proto__"]"#,
        ));
        let mut provider = snapshot.create_edges_provider(0);
        provider.sort_and_rewind(ComparatorConfig {
            field1: SortField::EdgeName,
            ascending1: true,
            field2: SortField::Id,
            ascending2: true,
        });
        let names: Vec<String> = provider
            .serialize_items_range(0, 4)
            .unwrap()
            .items
            .into_iter()
            .map(|item| item.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "5", "__proto__"]);

        provider.sort_and_rewind(ComparatorConfig {
            field1: SortField::EdgeName,
            ascending1: false,
            field2: SortField::Id,
            ascending2: true,
        });
        let names: Vec<String> = provider
            .serialize_items_range(0, 4)
            .unwrap()
            .items
            .into_iter()
            .map(|item| item.name)
            .collect();
        assert_eq!(names, vec!["5", "b", "a", "__proto__"]);
    }

    #[test]
    fn retainers_provider_hides_weak_and_root_retainers() {
        // root -> A, root -> C; A -.x-> E, C -[[w]]-> E.
        let snapshot = build(&snapshot_json(
            4,
            4,
            "9,0,1,0,2,0, 3,1,3,10,1,0, 3,2,5,10,1,0, 3,3,7,5,0,0",
            "2,4,6, 2,5,12, 2,6,18, 6,7,18",
            r#"["(root)","A","C","E","a","c","x","w"]"#,
        ));
        let e_index = 18;
        let mut provider = snapshot.create_retaining_edges_provider(e_index);
        assert_eq!(provider.total_length(), 1);
        let range = provider.serialize_items_range(0, 10).unwrap();
        assert_eq!(range.items.len(), 1);
        assert_eq!(range.items[0].name, "x");
        assert_eq!(range.items[0].node.name, "A");

        // E itself has no retainers view entries for the root.
        let mut root_retainers = snapshot.create_retaining_edges_provider(6);
        assert!(root_retainers.serialize_items_range(0, 10).unwrap().items.is_empty());
        assert!(root_retainers.is_empty());
    }

    #[test]
    fn containment_provider_skips_nothing_by_default() {
        let snapshot = three_objects();
        let mut provider = snapshot.create_edges_provider(0);
        let range = provider.serialize_items_range(0, 100).unwrap();
        assert_eq!(range.items.len(), 3);
        // Without a comparator the wire order is preserved.
        let ids: Vec<u32> = range.items.iter().map(|item| item.node.id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }
}

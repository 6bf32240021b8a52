//! The filter tree: a rooted ordered forest of filters, refreshed
//! depth-first with per-node caching, progress plumbing and cooperative
//! cancellation.

use std::collections::HashMap;

use crate::filter::{Filter, PropertyOutcome, PropertyValue};
use crate::plot::RegionWriteBack;
use crate::progress::RefreshContext;
use crate::result::FilterError;
use crate::stream::{FilterId, FilterStream, StreamList, StreamMask};

#[derive(Debug)]
struct TreeNode {
    id: FilterId,
    filter: Filter,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// A non-fatal problem found by static analysis of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeWarning {
    pub filter: FilterId,
    pub message: String,
}

/// The deliveries produced by a refresh: for each leaf, the streams that
/// reached it (its own outputs plus upstream pass-through).
pub type RefreshOutput = Vec<(FilterId, StreamList)>;

/// A rooted ordered forest of filter nodes.
///
/// Nodes are arena-stored and addressed externally by stable [`FilterId`]s;
/// relaying the tree out (add, remove, reparent) rebuilds the id lookup in a
/// single traversal, but never reassigns an id.
#[derive(Debug, Default)]
pub struct FilterTree {
    nodes: Vec<TreeNode>,
    roots: Vec<usize>,
    index_of: HashMap<FilterId, usize>,
    next_id: u64,
    cache_budget: Option<u64>,
}

impl FilterTree {
    pub fn new() -> FilterTree {
        FilterTree::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a filter under `parent`, or as a new root with `None`. Returns
    /// the stable id of the new node, or `None` when the parent is unknown.
    pub fn add_filter(&mut self, filter: Filter, parent: Option<FilterId>) -> Option<FilterId> {
        let parent_index = match parent {
            Some(parent_id) => Some(*self.index_of.get(&parent_id)?),
            None => None,
        };
        let id = FilterId(self.next_id);
        self.next_id += 1;
        let index = self.nodes.len();
        self.nodes.push(TreeNode {
            id,
            filter,
            parent: parent_index,
            children: Vec::new(),
        });
        match parent_index {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
        self.index_of.insert(id, index);
        Some(id)
    }

    /// Removes a node and its whole subtree. Surviving nodes keep their ids.
    pub fn remove_subtree(&mut self, id: FilterId) -> bool {
        let Some(&start) = self.index_of.get(&id) else {
            return false;
        };
        let mut doomed = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            doomed[index] = true;
            stack.extend(&self.nodes[index].children);
        }

        // Compact the arena and remap every stored index
        let mut remap: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut kept = Vec::new();
        for (index, node) in self.nodes.drain(..).enumerate() {
            if !doomed[index] {
                remap[index] = Some(kept.len());
                kept.push(node);
            }
        }
        for node in &mut kept {
            node.parent = node.parent.and_then(|p| remap[p]);
            node.children = node
                .children
                .iter()
                .filter_map(|&c| remap[c])
                .collect();
        }
        self.nodes = kept;
        self.roots = self
            .roots
            .iter()
            .filter_map(|&r| remap[r])
            .collect();
        self.rebuild_index();
        true
    }

    /// Moves a subtree under a new parent. Fails when either id is unknown
    /// or the move would make a node its own ancestor.
    pub fn reparent(&mut self, id: FilterId, new_parent: FilterId) -> bool {
        let (Some(&index), Some(&parent_index)) =
            (self.index_of.get(&id), self.index_of.get(&new_parent))
        else {
            return false;
        };
        if index == parent_index || self.is_descendant(parent_index, index) {
            return false;
        }
        match self.nodes[index].parent {
            Some(old) => self.nodes[old].children.retain(|&c| c != index),
            None => self.roots.retain(|&r| r != index),
        }
        self.nodes[index].parent = Some(parent_index);
        self.nodes[parent_index].children.push(index);
        // The subtree now consumes different inputs
        self.clear_cache_subtree(id);
        true
    }

    fn is_descendant(&self, candidate: usize, ancestor: usize) -> bool {
        let mut stack = self.nodes[ancestor].children.clone();
        while let Some(index) = stack.pop() {
            if index == candidate {
                return true;
            }
            stack.extend(&self.nodes[index].children);
        }
        false
    }

    fn rebuild_index(&mut self) {
        self.index_of.clear();
        for (index, node) in self.nodes.iter().enumerate() {
            self.index_of.insert(node.id, index);
        }
    }

    pub fn filter(&self, id: FilterId) -> Option<&Filter> {
        self.index_of.get(&id).map(|&i| &self.nodes[i].filter)
    }

    pub fn filter_mut(&mut self, id: FilterId) -> Option<&mut Filter> {
        let index = *self.index_of.get(&id)?;
        Some(&mut self.nodes[index].filter)
    }

    /// All node ids, depth-first in tree order.
    pub fn ids(&self) -> Vec<FilterId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            out.push(self.nodes[index].id);
            stack.extend(self.nodes[index].children.iter().rev());
        }
        out
    }

    pub fn children_of(&self, id: FilterId) -> Vec<FilterId> {
        match self.index_of.get(&id) {
            Some(&index) => self.nodes[index]
                .children
                .iter()
                .map(|&c| self.nodes[c].id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn parent_of(&self, id: FilterId) -> Option<FilterId> {
        let index = *self.index_of.get(&id)?;
        self.nodes[index].parent.map(|p| self.nodes[p].id)
    }

    /// Applies a property change to one filter, clearing caches down the
    /// subtree when the node's own cache was invalidated by the change.
    pub fn set_filter_property(
        &mut self,
        id: FilterId,
        key: u32,
        value: &PropertyValue,
    ) -> Option<PropertyOutcome> {
        let index = *self.index_of.get(&id)?;
        let outcome = self.nodes[index].filter.set_property(key, value);
        if outcome.needs_refresh && !self.nodes[index].filter.cache_valid() {
            self.clear_descendant_caches(index);
        }
        Some(outcome)
    }

    pub fn set_filter_label(&mut self, id: FilterId, label: &str) -> bool {
        match self.filter_mut(id) {
            Some(filter) => {
                filter.set_label(label);
                filter.clear_cache();
                true
            }
            None => false,
        }
    }

    /// Routes a plot-region drag back to the owning ranging filter. On an
    /// accepted move, caches below the filter are dropped so the next
    /// refresh propagates the new split.
    pub fn move_filter_region(&mut self, write_back: RegionWriteBack) -> bool {
        let Some(&index) = self.index_of.get(&write_back.owner) else {
            return false;
        };
        let Filter::Ranging(ranging) = &mut self.nodes[index].filter else {
            return false;
        };
        let moved = ranging.set_from_region(
            write_back.method,
            write_back.region_id,
            write_back.new_pos,
        );
        if moved {
            self.clear_descendant_caches(index);
        }
        moved
    }

    /// Drops the cache of a node and everything below it.
    pub fn clear_cache_subtree(&mut self, id: FilterId) {
        if let Some(&index) = self.index_of.get(&id) {
            self.nodes[index].filter.clear_cache();
            self.clear_descendant_caches(index);
        }
    }

    fn clear_descendant_caches(&mut self, index: usize) {
        let mut stack = self.nodes[index].children.clone();
        while let Some(child) = stack.pop() {
            self.nodes[child].filter.clear_cache();
            stack.extend(&self.nodes[child].children);
        }
    }

    /// Drops every cache in the tree.
    pub fn purge_caches(&mut self) {
        for node in &mut self.nodes {
            node.filter.clear_cache();
        }
    }

    /// Caps the total projected bytes the tree may cache; `None` removes the
    /// cap. Nodes whose projected cost exceeds the remaining budget get
    /// their caching disabled during refresh.
    pub fn set_cache_budget(&mut self, bytes: Option<u64>) {
        self.cache_budget = bytes;
    }

    /// Expresses the cache budget as a percentage of the RAM the caller
    /// knows to be available. Zero disables caching entirely.
    pub fn set_cache_percent(&mut self, percent: u8, total_ram_bytes: u64) {
        let percent = percent.min(100) as u64;
        self.cache_budget = Some(total_ram_bytes / 100 * percent);
        if percent == 0 {
            for node in &mut self.nodes {
                node.filter.set_cache_enabled(false);
            }
        }
    }

    /// Switches every data source between timer-seeded and OS-seeded
    /// sampling.
    pub fn set_strong_random(&mut self, strong: bool) {
        for node in &mut self.nodes {
            if let Filter::DataLoad(load) = &mut node.filter {
                load.set_strong_random(strong);
            }
        }
    }

    /// True if any filter in the tree can reach outside the process.
    pub fn has_hazardous_contents(&self) -> bool {
        self.nodes.iter().any(|n| n.filter.is_hazardous())
    }

    /// Static analysis: walks the tree collecting suspicious configurations
    /// without refusing to refresh.
    pub fn analyse(&self) -> Vec<TreeWarning> {
        let mut warnings = Vec::new();
        for &root in &self.roots {
            self.analyse_node(root, StreamMask::empty(), &mut warnings);
        }
        warnings
    }

    fn analyse_node(&self, index: usize, avail: StreamMask, warnings: &mut Vec<TreeWarning>) {
        let node = &self.nodes[index];
        let filter = &node.filter;

        let use_mask = filter.use_mask();
        if !use_mask.is_empty() && (use_mask & avail).is_empty() {
            warnings.push(TreeWarning {
                filter: node.id,
                message: format!(
                    "{} ({}) receives none of the stream kinds it consumes",
                    filter.label(),
                    filter.kind()
                ),
            });
        }
        if filter.is_hazardous() {
            warnings.push(TreeWarning {
                filter: node.id,
                message: format!("{} can execute arbitrary commands", filter.label()),
            });
        }
        if let Filter::Ranging(ranging) = filter {
            if ranging.file_path().is_empty() && !ranging.has_table() {
                warnings.push(TreeWarning {
                    filter: node.id,
                    message: format!("{} has no range file loaded", filter.label()),
                });
            }
            for parse_warning in ranging.parse_warnings() {
                warnings.push(TreeWarning {
                    filter: node.id,
                    message: parse_warning.clone(),
                });
            }
        }

        let child_avail = (avail & !filter.block_mask()) | filter.emit_mask();
        for &child in &node.children {
            self.analyse_node(child, child_avail, warnings);
        }
    }

    /// Refreshes the whole tree.
    ///
    /// Runs the structural `init` pass top-down first (so range streams are
    /// visible below before any heavy work), then the depth-first refresh:
    /// a node with a valid cache re-emits it, anything else recomputes.
    /// Outputs of a node are fully materialised before any child runs. On
    /// cancellation or error the partially-built deliveries are dropped and
    /// the error propagates unchanged.
    pub fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<RefreshOutput, FilterError> {
        for root in self.roots.clone() {
            self.init_node(root, &[]);
        }

        let mut deliveries = Vec::new();
        let mut budget_left = self.cache_budget;
        for root in self.roots.clone() {
            self.refresh_node(root, &[], ctx, &mut deliveries, &mut budget_left)?;
        }
        Ok(deliveries)
    }

    fn init_node(&mut self, index: usize, inputs: &[FilterStream]) {
        let id = self.nodes[index].id;
        let mut outputs = self.nodes[index].filter.init(inputs, id);
        let block = self.nodes[index].filter.block_mask();
        for stream in inputs {
            if !block.contains(stream.kind().into()) {
                outputs.push(stream.clone());
            }
        }
        for child in self.nodes[index].children.clone() {
            self.init_node(child, &outputs);
        }
    }

    fn refresh_node(
        &mut self,
        index: usize,
        inputs: &[FilterStream],
        ctx: &mut RefreshContext<'_>,
        deliveries: &mut RefreshOutput,
        budget_left: &mut Option<u64>,
    ) -> Result<(), FilterError> {
        let id = self.nodes[index].id;

        // Cache policy: a node about to cache output it cannot afford has
        // its caching disabled for this and subsequent refreshes
        if let Some(left) = budget_left {
            let filter = &mut self.nodes[index].filter;
            if filter.cache_enabled() && !filter.cache_valid() {
                let n_objects: usize = inputs.iter().map(|s| s.payload.num_elements()).sum();
                match filter.cache_bytes(n_objects) {
                    Some(bytes) if (bytes as u64) <= *left => *left -= bytes as u64,
                    Some(_) => filter.set_cache_enabled(false),
                    None => {}
                }
            }
        }

        let mut child_inputs = if self.nodes[index].filter.cache_valid() {
            self.nodes[index].filter.emit_cached(id)
        } else {
            ctx.begin_step(1, 1, self.nodes[index].filter.label());
            self.nodes[index].filter.refresh(inputs, id, ctx)?
        };

        // Upstream kinds this node does not block pass through unchanged
        let block = self.nodes[index].filter.block_mask();
        for stream in inputs {
            if !block.contains(stream.kind().into()) {
                child_inputs.push(stream.clone());
            }
        }

        let children = self.nodes[index].children.clone();
        if children.is_empty() {
            deliveries.push((id, child_inputs));
        } else {
            for child in children {
                self.refresh_node(child, &child_inputs, ctx, deliveries, budget_left)?;
            }
        }
        Ok(())
    }

    /// Releases the deliveries of a refresh. Cached streams remain owned by
    /// their producing filters; everything else is freed here. With
    /// reference-counted payloads this is a plain drop, kept as an explicit
    /// call so the ownership contract has a name.
    pub fn safe_delete(deliveries: &mut RefreshOutput) {
        deliveries.clear();
    }
}

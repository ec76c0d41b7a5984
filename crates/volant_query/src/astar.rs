//! The shared A* core every node query runs on.
//!
//! The layout follows Recast/Detour's search internals: a fixed-capacity
//! node pool with a chained hash table for O(1) "already scored?" lookups,
//! and a manually managed binary heap keyed on `f = g + h`. Query-specific
//! behavior (goal, termination, cost shaping) plugs in through
//! [`SearchPolicy`].

use crate::filter::{QueryFilter, QueryResults, QueryStatus};

use volant_core::coords;
use volant_core::neighbor::{self, Neighbor};

use volant_svo::neighbor_iter::NeighborIter;
use volant_svo::node::{NodeState, SvoNode};
use volant_svo::octree::SparseVoxelOctree;
use volant_svo::NodeLink;

use glam::Vec3;

pub(crate) const NODE_FLAG_OPEN: u8 = 1 << 0;
pub(crate) const NODE_FLAG_CLOSED: u8 = 1 << 1;

/// Cycles in the neighbor graph are possible near mixed resolutions, so
/// searches are bounded to a multiple of the pool size.
pub(crate) const NODE_VISITATION_MULTIPLIER: u32 = 4;

#[derive(Clone, Copy)]
pub(crate) struct SearchNode {
    pub link: NodeLink,
    /// 1-based index of the parent in the pool; 0 = none.
    pub parent_idx: u32,
    pub flags: u8,

    pub f_cost: f32,
    pub g_cost: f32,
    pub heuristic: f32,

    /// Where the path crosses into this node.
    pub portal_location: Vec3,
    /// Accumulated portal-to-portal distance from the start.
    pub travel_dist: f32,
}

impl SearchNode {
    fn reset(&mut self, link: NodeLink) {
        *self = Self {
            link,
            parent_idx: 0,
            flags: 0,
            f_cost: 0.0,
            g_cost: 0.0,
            heuristic: f32::MAX,
            portal_location: Vec3::ZERO,
            travel_dist: 0.0,
        };
    }
}

const NO_INDEX: u32 = u32::MAX;

/// Fixed-capacity pool of search nodes with chained-hash lookup by link id.
pub(crate) struct NodePool {
    nodes: Vec<SearchNode>,
    first: Vec<u32>,
    next: Vec<u32>,
    hash_mask: u32,
    count: u32,
}

impl NodePool {
    pub fn new(max_nodes: u32) -> Self {
        let hash_size = (max_nodes / 4).next_power_of_two().max(1);

        Self {
            nodes: Vec::with_capacity(max_nodes as usize),
            first: vec![NO_INDEX; hash_size as usize],
            next: vec![NO_INDEX; max_nodes as usize],
            hash_mask: hash_size - 1,
            count: 0,
        }
    }

    #[inline]
    pub fn max_nodes(&self) -> u32 {
        self.next.len() as u32
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn clear(&mut self) {
        self.first.fill(NO_INDEX);
        self.count = 0;
    }

    fn hash_link(link: NodeLink) -> u32 {
        let mut id = link.id();

        id = id.wrapping_add(!(id << 31));
        id ^= id >> 20;
        id = id.wrapping_add(id << 6);
        id ^= id >> 12;
        id = id.wrapping_add(!(id << 22));
        id ^= id >> 32;

        id as u32
    }

    /// Allocates a fresh search node for the link, or `None` when the pool
    /// is exhausted. Does not check for duplicates; callers `find` first.
    pub fn allocate(&mut self, link: NodeLink) -> Option<u32> {
        if self.count >= self.max_nodes() {
            return None;
        }

        let bucket = (Self::hash_link(link) & self.hash_mask) as usize;
        let node_idx = self.count;
        self.count += 1;

        if (node_idx as usize) < self.nodes.len() {
            self.nodes[node_idx as usize].reset(link);
        } else {
            self.nodes.push(SearchNode {
                link,
                parent_idx: 0,
                flags: 0,
                f_cost: 0.0,
                g_cost: 0.0,
                heuristic: f32::MAX,
                portal_location: Vec3::ZERO,
                travel_dist: 0.0,
            });
        }

        self.next[node_idx as usize] = self.first[bucket];
        self.first[bucket] = node_idx;

        Some(node_idx)
    }

    pub fn find(&self, link: NodeLink) -> Option<u32> {
        let bucket = (Self::hash_link(link) & self.hash_mask) as usize;
        let mut node_idx = self.first[bucket];

        while node_idx != NO_INDEX {
            if self.nodes[node_idx as usize].link == link {
                return Some(node_idx);
            }
            node_idx = self.next[node_idx as usize];
        }

        None
    }

    #[inline]
    pub fn node(&self, idx: u32) -> &SearchNode {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn node_mut(&mut self, idx: u32) -> &mut SearchNode {
        &mut self.nodes[idx as usize]
    }

    /// 1-based handle for parent bookkeeping (0 = none).
    #[inline]
    pub fn handle(&self, idx: u32) -> u32 {
        idx + 1
    }

    #[inline]
    pub fn index_from_handle(&self, handle: u32) -> Option<u32> {
        (handle != 0).then(|| handle - 1)
    }
}

/// Min-heap over pool indices keyed by cached f-cost. The cache makes
/// decrease-key explicit instead of depending on pool mutation order.
pub(crate) struct OpenList {
    heap: Vec<(f32, u32)>,
}

impl OpenList {
    pub fn new(capacity: u32) -> Self {
        Self {
            heap: Vec::with_capacity(capacity as usize + 1),
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, f_cost: f32, node_idx: u32) {
        self.heap.push((f_cost, node_idx));
        self.bubble_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<u32> {
        if self.heap.is_empty() {
            return None;
        }

        let top = self.heap[0].1;
        let last = self.heap.pop().unwrap();
        if !self.heap.is_empty() {
            self.heap[0] = last;
            self.trickle_down(0);
        }

        Some(top)
    }

    /// Updates the key of a node already on the list.
    pub fn modify(&mut self, node_idx: u32, f_cost: f32) {
        for i in 0..self.heap.len() {
            if self.heap[i].1 == node_idx {
                let old = self.heap[i].0;
                self.heap[i].0 = f_cost;
                if f_cost < old {
                    self.bubble_up(i);
                } else {
                    self.trickle_down(i);
                }
                return;
            }
        }
    }

    fn bubble_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].0 <= self.heap[i].0 {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn trickle_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            let left = i * 2 + 1;
            let right = i * 2 + 2;

            if left < self.heap.len() && self.heap[left].0 < self.heap[smallest].0 {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].0 < self.heap[smallest].0 {
                smallest = right;
            }

            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}

/// When two candidate parents produce an equal f-cost.
#[derive(Clone, Copy, Eq, PartialEq)]
pub(crate) enum TieBreaker {
    /// Smaller g wins (prefer shorter travel).
    Nearest,
    /// Larger g wins (prefer fanning out).
    Furthest,
}

pub(crate) enum Visit {
    Continue,
    /// Stop the search, keeping the current best node.
    Stop,
    /// Stop the search and make the visited node the result.
    StopAndAccept,
}

/// The per-query hooks of the shared search.
pub(crate) trait SearchPolicy {
    fn goal(&self) -> NodeLink;

    fn tie_breaker(&self) -> TieBreaker {
        TieBreaker::Nearest
    }

    fn heuristic_scale(&mut self, filter: &QueryFilter) -> f32 {
        filter.heuristic_scale
    }

    /// Cost of stepping between two adjacent nodes. The same base unit is
    /// used for every traversal so large nodes don't cost more than small
    /// ones; only the resolution discount differs.
    fn traversal_cost(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        _from: NodeLink,
        to: NodeLink,
        _portal_location: Vec3,
    ) -> f32 {
        let config = octree.config();
        filter.base_traversal_cost
            * (1.0 - config.resolution_for_link(to) / config.tile_resolution())
    }

    fn can_open_neighbor(
        &mut self,
        _neighbor: Neighbor,
        _link: NodeLink,
        _node: &SvoNode,
        _total_cost: f32,
        _travel_dist: f32,
    ) -> bool {
        true
    }

    fn on_node_visited(&mut self, _link: NodeLink, _node: &SvoNode) -> Visit {
        Visit::Continue
    }
}

/// The search state reused across one query object's runs.
pub(crate) struct AstarSearch {
    pool: NodePool,
    open: OpenList,
    node_visitation_limit: u32,

    /// 1-based handle of the best (lowest heuristic) node seen; 0 = none.
    best_handle: u32,
}

impl AstarSearch {
    pub fn new(max_search_nodes: u32) -> Self {
        Self {
            pool: NodePool::new(max_search_nodes),
            open: OpenList::new(max_search_nodes),
            node_visitation_limit: max_search_nodes.saturating_mul(NODE_VISITATION_MULTIPLIER),
            best_handle: 0,
        }
    }

    #[inline]
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    #[inline]
    pub fn node_visitation_limit(&self) -> u32 {
        self.node_visitation_limit
    }

    #[inline]
    pub fn best_node_idx(&self) -> Option<u32> {
        self.pool.index_from_handle(self.best_handle)
    }

    /// Runs the shared search loop until the open list drains, a hook stops
    /// it, or the visitation limit trips. Returns false only on hard
    /// parameter failures; partial outcomes still return true with flags in
    /// `results.status`.
    pub fn search(
        &mut self,
        octree: &SparseVoxelOctree,
        start_link: NodeLink,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
    ) -> bool {
        self.best_handle = 0;

        if self.pool.max_nodes() == 0 {
            results.status.insert(QueryStatus::FAILURE);
            results.status.insert(QueryStatus::OUT_OF_MEMORY);
            return false;
        }

        if !octree.is_valid() || !start_link.is_valid() {
            results.status.insert(QueryStatus::FAILURE);
            results.status.insert(QueryStatus::INVALID_PARAM);
            return false;
        }

        self.pool.clear();
        self.open.clear();

        let Some(start_idx) = self.pool.allocate(start_link) else {
            results.status.insert(QueryStatus::FAILURE);
            return false;
        };

        {
            let start_node = self.pool.node_mut(start_idx);
            start_node.flags = NODE_FLAG_OPEN;
            start_node.heuristic = f32::MAX;
            start_node.portal_location = octree
                .location_for_link(start_link)
                .unwrap_or(Vec3::ZERO);
        }

        self.best_handle = self.pool.handle(start_idx);
        self.open.push(0.0, start_idx);

        while let Some(cur_idx) = self.open.pop() {
            {
                let node = self.pool.node_mut(cur_idx);
                node.flags &= !NODE_FLAG_OPEN;
                node.flags |= NODE_FLAG_CLOSED;
            }

            let cur_link = self.pool.node(cur_idx).link;
            let Some(cur_node) = octree.node_from_link(cur_link) else {
                continue;
            };

            match policy.on_node_visited(cur_link, cur_node) {
                Visit::Continue => (),
                Visit::Stop => break,
                Visit::StopAndAccept => {
                    self.best_handle = self.pool.handle(cur_idx);
                    break;
                }
            }

            if let Some(callback) = &filter.on_node_visited {
                if !callback(cur_link.id()) {
                    break;
                }
            }

            self.open_neighbors(octree, filter, policy, results, cur_idx);

            results.num_nodes_visited += 1;
            if results.num_nodes_visited == self.node_visitation_limit {
                results.status.insert(QueryStatus::REACHED_NODE_LIMIT);
                break;
            }
        }

        results.status.insert(QueryStatus::SUCCESS);
        true
    }

    fn open_neighbors(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
        from_idx: u32,
    ) -> bool {
        let from_link = self.pool.node(from_idx).link;
        let mut any_opened = false;

        for entry in NeighborIter::new(octree, from_link) {
            any_opened |= self.open_neighbor_node(
                octree,
                filter,
                policy,
                results,
                from_idx,
                entry.neighbor,
                entry.link,
                entry.node,
            );
        }

        any_opened
    }

    /// Dispatches one adjacent entity: open it directly when it's already
    /// the highest resolution open region, recurse into the four face
    /// children when it subdivides, or walk the sixteen face voxels of a
    /// partially blocked leaf.
    #[allow(clippy::too_many_arguments)]
    fn open_neighbor_node(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
        from_idx: u32,
        neighbor: Neighbor,
        neighbor_link: NodeLink,
        neighbor_node: &SvoNode,
    ) -> bool {
        if neighbor_link.is_voxel() {
            if neighbor_node.is_voxel_blocked(neighbor_link.voxel_idx()) {
                return false;
            }
            return self.open_neighbor(
                octree,
                filter,
                policy,
                results,
                from_idx,
                neighbor,
                neighbor_link,
                neighbor_node,
            );
        }

        match neighbor_node.state() {
            NodeState::Blocked => false,
            NodeState::Open => self.open_neighbor(
                octree,
                filter,
                policy,
                results,
                from_idx,
                neighbor,
                neighbor_link,
                neighbor_node,
            ),
            NodeState::PartiallyBlocked => {
                if neighbor_link.is_leaf() {
                    self.open_voxels_on_neighbor(
                        octree,
                        filter,
                        policy,
                        results,
                        from_idx,
                        neighbor,
                        neighbor_link,
                        neighbor_node,
                    )
                } else {
                    self.open_children_on_neighbor(
                        octree,
                        filter,
                        policy,
                        results,
                        from_idx,
                        neighbor,
                        neighbor_node,
                    )
                }
            }
        }
    }

    fn open_children_on_neighbor(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
        from_idx: u32,
        neighbor: Neighbor,
        neighbor_node: &SvoNode,
    ) -> bool {
        let mut any_opened = false;

        // The children of the neighbor that touch *us* lie on its opposite
        // face.
        for &child_idx in neighbor::children_touching_neighbor(neighbor.opposite()) {
            let child_link = neighbor_node.child_link(child_idx);
            let Some(child_node) = octree.node_from_link(child_link) else {
                continue;
            };

            any_opened |= self.open_neighbor_node(
                octree,
                filter,
                policy,
                results,
                from_idx,
                neighbor,
                child_link,
                child_node,
            );
        }

        any_opened
    }

    #[allow(clippy::too_many_arguments)]
    fn open_voxels_on_neighbor(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
        from_idx: u32,
        neighbor: Neighbor,
        neighbor_link: NodeLink,
        neighbor_node: &SvoNode,
    ) -> bool {
        let mut any_opened = false;

        for &face_voxel_idx in neighbor::touching_neighbor_voxels(neighbor) {
            if neighbor_node.is_voxel_blocked(face_voxel_idx) {
                continue;
            }

            let voxel_link = neighbor_link.with_voxel_idx(face_voxel_idx);
            any_opened |= self.open_neighbor(
                octree,
                filter,
                policy,
                results,
                from_idx,
                neighbor,
                voxel_link,
                neighbor_node,
            );
        }

        any_opened
    }

    /// Scores one neighbor and pushes (or re-keys) it on the open list.
    #[allow(clippy::too_many_arguments)]
    fn open_neighbor(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        policy: &mut dyn SearchPolicy,
        results: &mut QueryResults,
        from_idx: u32,
        neighbor: Neighbor,
        neighbor_link: NodeLink,
        neighbor_node: &SvoNode,
    ) -> bool {
        if !neighbor_link.is_valid() {
            return false;
        }

        let from = *self.pool.node(from_idx);

        // No backtracking to ourselves or straight back to where we came
        // from.
        if from.link == neighbor_link {
            return false;
        }
        if let Some(parent_idx) = self.pool.index_from_handle(from.parent_idx) {
            if self.pool.node(parent_idx).link == neighbor_link {
                return false;
            }
        }

        let existing_idx = self.pool.find(neighbor_link);
        let already_open = existing_idx
            .is_some_and(|idx| self.pool.node(idx).flags & NODE_FLAG_OPEN != 0);
        let already_closed = existing_idx
            .is_some_and(|idx| self.pool.node(idx).flags & NODE_FLAG_CLOSED != 0);

        // Closed nodes were already expanded.
        if already_closed {
            return false;
        }

        let Some(portal_location) =
            portal_location(octree, filter, from.link, neighbor_link, neighbor)
        else {
            return false;
        };

        let travel_delta = from.portal_location.distance(portal_location);
        let total_travel_dist = from.travel_dist + travel_delta;

        let goal_link = policy.goal();
        let neighbor_heuristic = heuristic(octree, filter, policy, neighbor_link, goal_link);
        let neighbor_g_cost = from.g_cost
            + policy.traversal_cost(octree, filter, from.link, neighbor_link, portal_location);
        let neighbor_f_cost = neighbor_g_cost + neighbor_heuristic;

        // Decide whether this path beats the one already on the open list.
        let mut is_cheaper = true;
        if already_open {
            let existing = self.pool.node(existing_idx.unwrap());
            if existing.f_cost == neighbor_f_cost {
                is_cheaper = match policy.tie_breaker() {
                    TieBreaker::Nearest => neighbor_g_cost < existing.g_cost,
                    TieBreaker::Furthest => neighbor_g_cost > existing.g_cost,
                };
            } else {
                is_cheaper = neighbor_f_cost < existing.f_cost;
            }
        }

        if !is_cheaper {
            return false;
        }

        if !policy.can_open_neighbor(
            neighbor,
            neighbor_link,
            neighbor_node,
            neighbor_f_cost,
            total_travel_dist,
        ) {
            return false;
        }

        let node_idx = match existing_idx {
            Some(idx) => idx,
            None => match self.pool.allocate(neighbor_link) {
                Some(idx) => idx,
                None => {
                    results.status.insert(QueryStatus::OUT_OF_NODES);
                    return false;
                }
            },
        };

        {
            let from_handle = self.pool.handle(from_idx);
            let node = self.pool.node_mut(node_idx);
            node.parent_idx = from_handle;
            node.f_cost = neighbor_f_cost;
            node.g_cost = neighbor_g_cost;
            node.heuristic = neighbor_heuristic;
            node.portal_location = portal_location;
            node.travel_dist = total_travel_dist;
            node.flags &= !NODE_FLAG_CLOSED;
        }

        if already_open {
            self.open.modify(node_idx, neighbor_f_cost);
            results.num_nodes_reopened += 1;
        } else {
            self.pool.node_mut(node_idx).flags |= NODE_FLAG_OPEN;
            self.open.push(neighbor_f_cost, node_idx);
            results.num_nodes_opened += 1;
        }

        // Track the node closest to the goal; partial results come from
        // here.
        let best_idx = self.pool.index_from_handle(self.best_handle);
        if best_idx.is_none()
            || neighbor_heuristic < self.pool.node(best_idx.unwrap()).heuristic
        {
            self.best_handle = self.pool.handle(node_idx);
        }

        results.num_nodes_queried = self.pool.count();

        true
    }
}

/// The portal between two adjacent nodes: the center of the shared face,
/// computed at the smaller of the two resolutions and clipped by any filter
/// constraints. `None` when the clipped face is empty, which closes the
/// neighbor off entirely.
pub(crate) fn portal_location(
    octree: &SparseVoxelOctree,
    filter: &QueryFilter,
    from_link: NodeLink,
    to_link: NodeLink,
    mut neighbor: Neighbor,
) -> Option<Vec3> {
    let config = octree.config();
    let from_resolution = config.resolution_for_link(from_link);
    let to_resolution = config.resolution_for_link(to_link);

    let (node_location, node_extent) = if from_resolution < to_resolution {
        (octree.location_for_link(from_link)?, from_resolution * 0.5)
    } else {
        // Measuring from the destination side, so the face flips.
        neighbor = neighbor.opposite();
        (octree.location_for_link(to_link)?, to_resolution * 0.5)
    };

    let mut node_bounds =
        volant_core::aabb::Aabb::from_center_and_extent(node_location, Vec3::splat(node_extent));

    if filter.constraints.has_constraints() && !filter.constraints.constrain_bounds(&mut node_bounds)
    {
        return None;
    }

    let face_direction = neighbor.direction().as_vec3();
    Some(node_bounds.center() + face_direction * node_bounds.extent().x)
}

/// Manhattan distance, in voxels, from the closest point of `from` to the
/// center of the goal. Stable across node sizes because it's measured at
/// voxel resolution.
pub(crate) fn heuristic(
    octree: &SparseVoxelOctree,
    filter: &QueryFilter,
    policy: &mut dyn SearchPolicy,
    from_link: NodeLink,
    goal_link: NodeLink,
) -> f32 {
    let config = octree.config();
    let voxel_size = config.voxel_size();

    let (Some(from_bounds), Some(goal_bounds)) = (
        octree.bounds_for_link(from_link),
        octree.bounds_for_link(goal_link),
    ) else {
        return f32::MAX;
    };

    let goal_location = goal_bounds.center();
    let closest_from_location = from_bounds.closest_point(goal_location);

    let from_coord = config.location_to_coord(closest_from_location, voxel_size);
    let goal_coord = config.location_to_coord(goal_location, voxel_size);

    let cost = coords::manhattan_distance(from_coord, goal_coord) as f32;
    cost * policy.heuristic_scale(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_allocates_and_finds() {
        let mut pool = NodePool::new(8);

        let a = NodeLink::new(1, 1, 0);
        let b = NodeLink::new(1, 1, 1);

        let ia = pool.allocate(a).unwrap();
        let ib = pool.allocate(b).unwrap();

        assert_eq!(pool.find(a), Some(ia));
        assert_eq!(pool.find(b), Some(ib));
        assert_eq!(pool.find(NodeLink::new(1, 1, 2)), None);
        assert_eq!(pool.count(), 2);

        pool.clear();
        assert_eq!(pool.find(a), None);
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn pool_exhausts_at_capacity() {
        let mut pool = NodePool::new(2);
        assert!(pool.allocate(NodeLink::new(0, 1, 0)).is_some());
        assert!(pool.allocate(NodeLink::new(0, 1, 1)).is_some());
        assert!(pool.allocate(NodeLink::new(0, 1, 2)).is_none());
    }

    #[test]
    fn open_list_pops_in_cost_order() {
        let mut open = OpenList::new(8);
        open.push(5.0, 0);
        open.push(1.0, 1);
        open.push(3.0, 2);
        open.push(0.5, 3);

        assert_eq!(open.pop(), Some(3));
        assert_eq!(open.pop(), Some(1));

        open.modify(0, 0.1);
        assert_eq!(open.pop(), Some(0));
        assert_eq!(open.pop(), Some(2));
        assert_eq!(open.pop(), None);
    }
}

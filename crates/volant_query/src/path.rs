use crate::astar::{AstarSearch, SearchPolicy, TieBreaker, Visit};
use crate::filter::{PathPoint, PathQueryResults, QueryFilter, QueryStatus};

use volant_svo::node::SvoNode;
use volant_svo::octree::SparseVoxelOctree;
use volant_svo::NodeLink;

/// Finds node corridors between two links with A*.
pub struct PathQuery {
    search: AstarSearch,
}

struct PathPolicy {
    goal_link: NodeLink,
    cost_limit: f32,
    reached_goal: bool,
}

impl SearchPolicy for PathPolicy {
    fn goal(&self) -> NodeLink {
        self.goal_link
    }

    fn tie_breaker(&self) -> TieBreaker {
        TieBreaker::Nearest
    }

    fn can_open_neighbor(
        &mut self,
        _neighbor: volant_core::neighbor::Neighbor,
        _link: NodeLink,
        _node: &SvoNode,
        total_cost: f32,
        _travel_dist: f32,
    ) -> bool {
        // A cost limit of zero means unlimited.
        !(self.cost_limit > 0.0 && total_cost > self.cost_limit)
    }

    fn on_node_visited(&mut self, link: NodeLink, _node: &SvoNode) -> Visit {
        if link == self.goal_link {
            self.reached_goal = true;
            Visit::StopAndAccept
        } else {
            Visit::Continue
        }
    }
}

impl PathQuery {
    pub fn new(max_search_nodes: u32) -> Self {
        Self {
            search: AstarSearch::new(max_search_nodes),
        }
    }

    /// Attempts to find a path from `start_link` to `goal_link`. Returns
    /// false on hard failures; otherwise the results carry the portal
    /// points (and `PARTIAL_PATH` when the goal wasn't reached).
    pub fn find_path(
        &mut self,
        octree: &SparseVoxelOctree,
        start_link: NodeLink,
        goal_link: NodeLink,
        cost_limit: f32,
        filter: &QueryFilter,
        results: &mut PathQueryResults,
    ) -> bool {
        if !start_link.is_valid() || !goal_link.is_valid() {
            results.query.status.insert(QueryStatus::FAILURE);
            results.query.status.insert(QueryStatus::INVALID_PARAM);
            return false;
        }

        // Start and goal in the same node: the trivial one-node path.
        if start_link == goal_link {
            results.path_node_count = 1;
            results.query.status.insert(QueryStatus::SUCCESS);
            return true;
        }

        let mut policy = PathPolicy {
            goal_link,
            cost_limit,
            reached_goal: false,
        };

        if !self
            .search
            .search(octree, start_link, filter, &mut policy, &mut results.query)
        {
            return false;
        }

        let Some(best_idx) = self.search.best_node_idx() else {
            results.query.status.insert(QueryStatus::FAILURE);
            return false;
        };

        if self.search.pool().node(best_idx).link != goal_link {
            results.query.status.insert(QueryStatus::PARTIAL_PATH);
        }

        let best = self.search.pool().node(best_idx);
        results.path_cost = best.f_cost;
        results.path_length = best.travel_dist;

        // Walk back to the start collecting the chain. A cycle in the
        // parent indices would spin forever, so the walk shares the search
        // visitation bound.
        let mut chain = Vec::new();
        let mut cur = Some(best_idx);
        while let Some(idx) = cur {
            chain.push(idx);

            if chain.len() as u32 >= self.search.node_visitation_limit() {
                results.query.status.insert(QueryStatus::CYCLICAL_PATH);
                break;
            }

            cur = self
                .search
                .pool()
                .index_from_handle(self.search.pool().node(idx).parent_idx);
        }

        results.path_node_count = chain.len() as u32;

        // Emit portal points start-to-goal. The start node itself has no
        // portal (the search entered nowhere), so it is skipped.
        results
            .path_portal_points
            .reserve(chain.len().saturating_sub(1));
        for &idx in chain.iter().rev().skip(1) {
            let node = self.search.pool().node(idx);
            results
                .path_portal_points
                .push(PathPoint::new(node.portal_location, node.link.id()));
        }

        true
    }

    /// Like [`Self::find_path`] without extracting the corridor; useful
    /// for reachability checks.
    pub fn test_path(
        &mut self,
        octree: &SparseVoxelOctree,
        start_link: NodeLink,
        goal_link: NodeLink,
        cost_limit: f32,
        filter: &QueryFilter,
        results: &mut PathQueryResults,
    ) -> bool {
        if !start_link.is_valid() || !goal_link.is_valid() {
            results.query.status.insert(QueryStatus::FAILURE);
            results.query.status.insert(QueryStatus::INVALID_PARAM);
            return false;
        }

        if start_link == goal_link {
            results.query.status.insert(QueryStatus::SUCCESS);
            return true;
        }

        let mut policy = PathPolicy {
            goal_link,
            cost_limit,
            reached_goal: false,
        };

        let searched = self
            .search
            .search(octree, start_link, filter, &mut policy, &mut results.query);

        searched && policy.reached_goal
    }
}

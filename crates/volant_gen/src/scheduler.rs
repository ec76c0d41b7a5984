use crate::collider::GeometrySource;
use crate::config::GeneratorConfig;
use crate::tile_builder::TileBuilder;

use volant_core::aabb::Aabb;
use volant_core::coords::{self, CoordIter};

use volant_svo::EditableSvo;

use crossbeam_channel::{bounded, Receiver};
use fnv::FnvHashSet;
use glam::{IVec3, Vec3};
use std::time::{Duration, Instant};

/// Knobs for trading frame time against generation throughput. Tweaks
/// should be profiled on every supported platform; the defaults favor
/// staying invisible in the frame.
#[derive(Clone, Debug)]
pub struct SchedulerTunables {
    /// Maximum generation tasks in flight. At least 2 is ideal so one task
    /// can gather triangles on the scheduler's thread while another works.
    pub max_tasks: usize,
    pub boost_max_tasks: usize,

    /// Soft cap on triangles per task. A task near the cap can still go
    /// over if its last tile is dense.
    pub max_tris_per_task: u32,

    /// Soft cap on scheduler-thread work per tick.
    pub max_tick_time: Duration,
    pub boost_max_tick_time: Duration,

    /// A builder that has gathered this many ticks without filling up is
    /// force launched, so sparse areas don't sit pending forever.
    pub max_pending_ticks: u32,
}

impl Default for SchedulerTunables {
    fn default() -> Self {
        Self {
            max_tasks: 2,
            boost_max_tasks: 4,
            max_tris_per_task: 10_000,
            max_tick_time: Duration::from_micros(500),
            boost_max_tick_time: Duration::from_millis(5),
            max_pending_ticks: 5,
        }
    }
}

/// What one scheduler tick accomplished.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickSummary {
    pub tiles_installed: u32,
    pub tasks_launched: u32,
    /// True on the tick that drained the last outstanding work.
    pub generation_complete: bool,
}

#[derive(Clone, Copy)]
struct PendingTile {
    coord: IVec3,
    seed_distance_sq: f32,
}

struct RunningBuilder {
    coords: Vec<IVec3>,
    receiver: Receiver<TileBuilder>,
}

/// Drives incremental octree generation: dirty regions become pending tile
/// coords, pending coords are batched into [`TileBuilder`] tasks run on the
/// rayon pool, and finished tiles are installed into the octree inside one
/// batch edit per tick, under a per-tick time budget.
///
/// The scheduler is the only mutator of the octree, and only from within
/// [`Self::tick`] / [`Self::cancel_build`]; workers never see it.
pub struct GeneratorScheduler {
    config: GeneratorConfig,
    tunables: SchedulerTunables,

    // Boost raises concurrency and the tick budget (loading screens).
    boost_mode: bool,

    // Navigable volumes; tiles are only generated where these overlap.
    inclusion_bounds: Vec<Aabb>,
    total_bounds: Aabb,

    // Sorted so the nearest tile to any seed is popped first (stored
    // farthest-first so that's a pop from the back).
    pending_tiles: Vec<PendingTile>,
    seed_locations: Vec<Vec3>,

    // The builder currently being filled on the scheduler's thread.
    pending_builder: Option<Box<TileBuilder>>,

    running: Vec<RunningBuilder>,
    completed: Vec<TileBuilder>,

    // When restricted, only coords captured in the whitelist may build.
    restrict_to_active_tiles: bool,
    whitelisted_tiles: FnvHashSet<IVec3>,
}

impl GeneratorScheduler {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            tunables: SchedulerTunables::default(),
            boost_mode: false,
            inclusion_bounds: Vec::new(),
            total_bounds: Aabb::empty(),
            pending_tiles: Vec::new(),
            seed_locations: Vec::new(),
            pending_builder: None,
            running: Vec::new(),
            completed: Vec::new(),
            restrict_to_active_tiles: false,
            whitelisted_tiles: FnvHashSet::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    #[inline]
    pub fn tunables_mut(&mut self) -> &mut SchedulerTunables {
        &mut self.tunables
    }

    /// Boost mode trades frame rate for generation throughput; meant for
    /// loading screens.
    pub fn set_boost_mode(&mut self, enabled: bool) {
        self.boost_mode = enabled;
    }

    /// Replaces the set of navigable volumes. Bounds already contained by
    /// another are dropped.
    pub fn set_inclusion_bounds(&mut self, bounds: &[Aabb]) {
        self.inclusion_bounds.clear();
        self.total_bounds = Aabb::empty();

        for aabb in bounds {
            if !Aabb::any_contains(&self.inclusion_bounds, aabb) {
                self.inclusion_bounds.push(*aabb);
                self.total_bounds.union_point(aabb.min);
                self.total_bounds.union_point(aabb.max);
            }
        }
    }

    #[inline]
    pub fn inclusion_bounds(&self) -> &[Aabb] {
        &self.inclusion_bounds
    }

    #[inline]
    pub fn total_bounds(&self) -> Aabb {
        self.total_bounds
    }

    /// Player (or other focus) locations used to order pending tiles.
    pub fn set_seed_locations(&mut self, locations: &[Vec3]) {
        self.seed_locations = locations.to_vec();
    }

    pub fn num_remaining_tasks(&self) -> usize {
        self.pending_tiles.len()
            + usize::from(self.pending_builder.is_some())
            + self.running.len()
            + self.completed.len()
    }

    pub fn num_running_tasks(&self) -> usize {
        self.running.len()
    }

    pub fn is_build_in_progress(&self) -> bool {
        self.num_remaining_tasks() > 0
    }

    /// True if anything overlapping `bounds` is pending or generating.
    pub fn has_dirty_areas(&self, bounds: &Aabb) -> bool {
        if !self.is_build_in_progress() || !bounds.is_valid() {
            return false;
        }

        let (min_coord, max_coord) = coords::coords_for_bounds(
            self.config.seed_location(),
            bounds,
            self.config.tile_resolution(),
        );

        self.pending_tiles
            .iter()
            .any(|tile| coords::coord_in_bounds(tile.coord, min_coord, max_coord))
            || self.is_coord_generating(min_coord, max_coord)
    }

    /// True if any coord in the box is owned by the pending, running, or
    /// completed-but-not-installed builders.
    fn is_coord_generating(&self, min_coord: IVec3, max_coord: IVec3) -> bool {
        if let Some(builder) = &self.pending_builder {
            if builder.contains_tile_in_bounds(min_coord, max_coord) {
                return true;
            }
        }

        if self
            .running
            .iter()
            .any(|r| r.coords.iter().any(|&c| coords::coord_in_bounds(c, min_coord, max_coord)))
        {
            return true;
        }

        // Completed builders count as generating until their tiles land.
        self.completed
            .iter()
            .any(|b| b.contains_tile_in_bounds(min_coord, max_coord))
    }

    fn is_tile_whitelisted(&self, coord: IVec3) -> bool {
        !self.restrict_to_active_tiles || self.whitelisted_tiles.contains(&coord)
    }

    /// Toggling on captures the octree's current tile set; from then on
    /// only those coords may build.
    pub fn restrict_building_to_active_tiles(&mut self, restrict: bool, octree: &EditableSvo) {
        if self.restrict_to_active_tiles == restrict {
            return;
        }

        self.restrict_to_active_tiles = restrict;
        self.whitelisted_tiles.clear();

        if restrict {
            self.whitelisted_tiles
                .extend(octree.tiles().map(|tile| tile.coord()));
        }
    }

    /// Queues every tile touched by the dirty regions for regeneration.
    /// Regions are expanded by the agent padding (neighboring geometry can
    /// block voxels in a tile) and clipped against the inclusion bounds.
    pub fn mark_dirty_areas(&mut self, dirty_areas: &[Aabb], octree: &EditableSvo) {
        let octree_has_tiles = octree.num_tiles() > 0;

        if self.inclusion_bounds.is_empty() && !octree_has_tiles {
            return;
        }

        let mut dirty_tiles: FnvHashSet<IVec3> = FnvHashSet::default();

        for area in dirty_areas {
            let mut adjusted = area.expanded_by_vec(self.config.bounds_padding());

            if !adjusted.intersects(&self.total_bounds) {
                continue;
            }
            adjusted = adjusted.overlap(&self.total_bounds);

            if !adjusted.intersects_any(&self.inclusion_bounds) {
                continue;
            }

            // Only areas not fully inside some inclusion volume need their
            // tiles tested one by one; fully enclosed areas build
            // everything they touch.
            let needs_tile_test = !Aabb::any_contains(&self.inclusion_bounds, &adjusted);

            if adjusted.volume() <= 0.0 {
                continue;
            }

            let (min_coord, max_coord) = coords::coords_for_bounds(
                self.config.seed_location(),
                &adjusted,
                self.config.tile_resolution(),
            );

            for tile_coord in CoordIter::new(min_coord, max_coord) {
                if dirty_tiles.contains(&tile_coord) {
                    continue;
                }

                if !self.is_tile_whitelisted(tile_coord) {
                    continue;
                }

                if needs_tile_test {
                    let tile_bounds = self.config.tile_bounds(tile_coord);
                    if !tile_bounds.intersects_any(&self.inclusion_bounds) {
                        continue;
                    }
                }

                dirty_tiles.insert(tile_coord);
            }
        }

        if dirty_tiles.is_empty() {
            return;
        }

        // Merge with what was already pending, then re-sort the lot.
        for tile in &self.pending_tiles {
            dirty_tiles.insert(tile.coord);
        }

        self.pending_tiles = dirty_tiles
            .into_iter()
            .map(|coord| PendingTile {
                coord,
                seed_distance_sq: f32::MAX,
            })
            .collect();

        self.sort_pending_tiles();
    }

    /// Orders pending tiles so the one nearest any seed location sits at
    /// the back of the list, where popping is cheapest.
    fn sort_pending_tiles(&mut self) {
        // With no players around, the world origin decides.
        const ORIGIN_SEED: [Vec3; 1] = [Vec3::ZERO];

        let seeds: &[Vec3] = if self.seed_locations.is_empty() {
            &ORIGIN_SEED
        } else {
            &self.seed_locations
        };

        for tile in &mut self.pending_tiles {
            let center = self.config.tile_coord_to_location(tile.coord);
            tile.seed_distance_sq = seeds
                .iter()
                .map(|&seed| center.distance_squared(seed))
                .fold(f32::MAX, f32::min);
        }

        self.pending_tiles
            .sort_by(|a, b| b.seed_distance_sq.total_cmp(&a.seed_distance_sq));
    }

    /// One scheduler tick: reap finished workers, install their tiles
    /// (batched, time budgeted, always at least one tile of the first
    /// finished builder so progress is guaranteed), then gather and launch
    /// new work.
    pub fn tick(&mut self, octree: &mut EditableSvo, source: &dyn GeometrySource) -> TickSummary {
        let mut summary = TickSummary::default();

        let max_tasks = if self.boost_mode {
            self.tunables.boost_max_tasks
        } else {
            self.tunables.max_tasks
        };
        let budget = if self.boost_mode {
            self.tunables.boost_max_tick_time
        } else {
            self.tunables.max_tick_time
        };

        let had_tasks_at_start = self.is_build_in_progress();
        let end_time = Instant::now() + budget;

        debug_assert!(!octree.is_batch_editing());
        octree.begin_batch();

        if let Some(builder) = &mut self.pending_builder {
            builder.pending_ticks += 1;
        }

        // Reap workers whose async work finished.
        let mut idx = 0;
        while idx < self.running.len() {
            match self.running[idx].receiver.try_recv() {
                Ok(builder) => {
                    self.completed.push(builder);
                    self.running.swap_remove(idx);
                }
                Err(crossbeam_channel::TryRecvError::Empty) => idx += 1,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    // Worker died without sending; drop the slot.
                    log::warn!("generator worker disconnected without a result");
                    self.running.swap_remove(idx);
                }
            }
        }

        // Install completed tiles. Only the first builder is exempt from
        // the budget check, so a too-small budget can't stall forever but a
        // backlog also can't flood the tick.
        let mut completed_idx = 0;
        while completed_idx < self.completed.len() {
            let builder = &mut self.completed[completed_idx];
            let all_added = install_generated_tiles(
                builder,
                octree,
                end_time,
                &self.whitelisted_tiles,
                self.restrict_to_active_tiles,
                &mut summary.tiles_installed,
            );

            if all_added {
                self.completed.remove(completed_idx);
            } else {
                completed_idx += 1;
            }

            if Instant::now() >= end_time {
                break;
            }
        }

        // Launch new tasks after installs: both share the budget and
        // finished work should land before new work starts.
        let max_to_submit = max_tasks.saturating_sub(self.running.len());
        summary.tasks_launched = self.process_pending_tiles(source, max_to_submit, end_time);

        octree.end_batch();

        let has_tasks_at_end = self.is_build_in_progress();
        if had_tasks_at_start && !has_tasks_at_end {
            summary.generation_complete = true;
        }

        summary
    }

    /// Gathers pending coords into the pending builder (nearest first) and
    /// launches it when it is full, the tick budget expires, or everything
    /// else is already generating. Returns tasks launched.
    fn process_pending_tiles(
        &mut self,
        source: &dyn GeometrySource,
        max_to_submit: usize,
        end_time: Instant,
    ) -> u32 {
        let mut num_submitted = 0u32;
        let mut num_generating_coords = 0usize;

        let mut idx = self.pending_tiles.len();
        while idx > 0 {
            idx -= 1;
            let pending_coord = self.pending_tiles[idx].coord;

            let pending_builder_full = self
                .pending_builder
                .as_ref()
                .is_some_and(|b| b.tri_count >= self.tunables.max_tris_per_task);

            // A full builder with no launch slots left means nothing more
            // can happen this tick.
            if pending_builder_full && num_submitted as usize >= max_to_submit {
                break;
            }

            // A coord already being generated re-queues after its current
            // build lands, not now.
            if self.is_coord_generating(pending_coord, pending_coord) {
                num_generating_coords += 1;
                continue;
            }

            if self.pending_builder.is_none() {
                self.pending_builder = Some(Box::new(TileBuilder::new(self.config.clone())));
            }

            if !pending_builder_full {
                let builder = self.pending_builder.as_mut().expect("created above");
                builder.add_tile(pending_coord, source);
                self.pending_tiles.remove(idx);
            }

            if Instant::now() >= end_time {
                break;
            }

            if (num_submitted as usize) < max_to_submit && self.try_run_pending_builder(false) {
                num_submitted += 1;
            }

            if num_submitted as usize >= max_to_submit {
                break;
            }
        }

        if (num_submitted as usize) < max_to_submit {
            // Everything pending may be a re-queue of coords already being
            // generated; force the current builder out in that case so the
            // pipeline keeps moving.
            let all_pending_generating = self.pending_tiles.len() == num_generating_coords;
            if self.try_run_pending_builder(all_pending_generating) {
                num_submitted += 1;
            }
        }

        num_submitted
    }

    /// Launches the pending builder if it is ready (or forced). Returns
    /// whether a task was started.
    fn try_run_pending_builder(&mut self, force_start: bool) -> bool {
        let Some(builder) = self.pending_builder.take() else {
            return false;
        };

        if !builder.has_tiles() {
            return false;
        }

        let ready = force_start
            || builder.tri_count >= self.tunables.max_tris_per_task
            || self.pending_tiles.is_empty()
            || builder.pending_ticks > self.tunables.max_pending_ticks;

        if !ready {
            self.pending_builder = Some(builder);
            return false;
        }

        let coords: Vec<IVec3> = builder.tile_coords().collect();
        let (sender, receiver) = bounded(1);

        let mut builder = builder;
        rayon::spawn(move || {
            builder.do_work();
            // A dropped receiver means the build was cancelled.
            let _ = sender.send(*builder);
        });

        self.running.push(RunningBuilder { coords, receiver });
        true
    }

    /// Drops all pending work and blocks until running workers finish,
    /// discarding their results.
    pub fn cancel_build(&mut self) {
        self.pending_tiles.clear();
        self.pending_builder = None;

        for running in self.running.drain(..) {
            // No preemption; wait for the worker, then drop its output.
            let _ = running.receiver.recv();
        }

        self.completed.clear();
    }

    /// Blocks until all outstanding generation has been installed.
    pub fn ensure_build_completion(
        &mut self,
        octree: &mut EditableSvo,
        source: &dyn GeometrySource,
    ) {
        while self.is_build_in_progress() {
            // Run wide-open ticks and block on workers between them.
            let saved = self.tunables.clone();
            self.tunables.max_tick_time = Duration::from_secs(60);
            self.tunables.boost_max_tick_time = Duration::from_secs(60);

            self.tick(octree, source);

            for running in &self.running {
                // Block until the worker hands its builder over, then let
                // the next tick reap it.
                if let Ok(builder) = running.receiver.recv() {
                    self.completed.push(builder);
                }
            }
            self.running.clear();

            self.tunables = saved;
        }
    }
}

fn install_generated_tiles(
    builder: &mut TileBuilder,
    octree: &mut EditableSvo,
    end_time: Instant,
    whitelist: &FnvHashSet<IVec3>,
    restricted: bool,
    tiles_installed: &mut u32,
) -> bool {
    while let Some(tile) = builder.next_generated_tile() {
        let can_add = !restricted || whitelist.contains(&tile.coord());

        if can_add {
            octree.assume_tile(tile, true);
            *tiles_installed += 1;

            if Instant::now() >= end_time {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collider::{StaticGeometry, Triangle};

    use volant_svo::{NodeState, SvoConfig};

    fn test_scheduler() -> (GeneratorScheduler, EditableSvo) {
        let svo_config = SvoConfig::new(Vec3::ZERO, 25.0, 64, 2);
        let config = GeneratorConfig::new(svo_config.clone(), 25.0, 50.0);

        let mut scheduler = GeneratorScheduler::new(config);

        // Navigation covers a 2x1x1 block of tiles.
        let tile_res = svo_config.tile_resolution();
        scheduler.set_inclusion_bounds(&[Aabb::new(
            Vec3::ZERO,
            Vec3::new(tile_res * 2.0, tile_res, tile_res),
        )]);

        (scheduler, EditableSvo::new(svo_config))
    }

    fn drive_to_completion(
        scheduler: &mut GeneratorScheduler,
        octree: &mut EditableSvo,
        source: &dyn GeometrySource,
    ) {
        scheduler.ensure_build_completion(octree, source);
        assert!(!scheduler.is_build_in_progress());
    }

    #[test]
    fn dirty_areas_become_pending_tiles() {
        let (mut scheduler, octree) = test_scheduler();

        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);
        assert_eq!(scheduler.pending_tiles.len(), 2);
        assert!(scheduler.has_dirty_areas(&scheduler.total_bounds()));
    }

    #[test]
    fn pending_tiles_sorted_nearest_last() {
        let (mut scheduler, octree) = test_scheduler();
        let tile_res = scheduler.config().tile_resolution();

        scheduler.set_seed_locations(&[Vec3::new(tile_res * 1.5, 0.0, 0.0)]);
        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);

        // The nearest tile (coord x=1) pops last-first.
        let last = scheduler.pending_tiles.last().unwrap();
        assert_eq!(last.coord, IVec3::new(1, 0, 0));
    }

    #[test]
    fn generates_and_installs_open_tiles() {
        let (mut scheduler, mut octree) = test_scheduler();
        let geometry = StaticGeometry::default();

        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);
        drive_to_completion(&mut scheduler, &mut octree, &geometry);

        assert_eq!(octree.num_tiles(), 2);
        for coord in [IVec3::ZERO, IVec3::new(1, 0, 0)] {
            let tile = octree.tile_at_coord(coord).unwrap();
            assert_eq!(tile.node_info().state(), NodeState::Open);
        }

        octree.verify_node_data(true);
    }

    #[test]
    fn generates_partial_tiles_from_geometry() {
        let (mut scheduler, mut octree) = test_scheduler();
        let tile_res = scheduler.config().tile_resolution();

        // A floor slab across the first tile.
        let z = tile_res * 0.5;
        let geometry = StaticGeometry {
            triangles: vec![
                Triangle::new(
                    Vec3::new(0.0, 0.0, z),
                    Vec3::new(tile_res, 0.0, z),
                    Vec3::new(tile_res, tile_res, z),
                ),
                Triangle::new(
                    Vec3::new(0.0, 0.0, z),
                    Vec3::new(tile_res, tile_res, z),
                    Vec3::new(0.0, tile_res, z),
                ),
            ],
            blockers: Vec::new(),
        };

        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);
        drive_to_completion(&mut scheduler, &mut octree, &geometry);

        let tile = octree.tile_at_coord(IVec3::ZERO).unwrap();
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);

        octree.verify_node_data(true);
    }

    #[test]
    fn completion_signal_fires_once() {
        let (mut scheduler, mut octree) = test_scheduler();
        let geometry = StaticGeometry::default();

        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);

        let mut completions = 0;
        for _ in 0..200 {
            let summary = scheduler.tick(&mut octree, &geometry);
            if summary.generation_complete {
                completions += 1;
            }
            if !scheduler.is_build_in_progress() && completions > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(completions, 1);
        assert_eq!(octree.num_tiles(), 2);
    }

    #[test]
    fn cancel_discards_results() {
        let (mut scheduler, mut octree) = test_scheduler();
        let geometry = StaticGeometry::default();

        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);
        scheduler.tick(&mut octree, &geometry);
        scheduler.cancel_build();

        assert!(!scheduler.is_build_in_progress());
        assert!(scheduler.pending_tiles.is_empty());
    }

    #[test]
    fn whitelist_restricts_building() {
        let (mut scheduler, mut octree) = test_scheduler();
        let geometry = StaticGeometry::default();

        // Build everything once, then restrict to the active set and dirty
        // a larger area; nothing outside the captured set may rebuild.
        scheduler.mark_dirty_areas(&[scheduler.total_bounds()], &octree);
        drive_to_completion(&mut scheduler, &mut octree, &geometry);
        assert_eq!(octree.num_tiles(), 2);

        scheduler.restrict_building_to_active_tiles(true, &octree);

        let tile_res = scheduler.config().tile_resolution();
        let wider = Aabb::new(Vec3::ZERO, Vec3::splat(tile_res * 4.0));
        scheduler.set_inclusion_bounds(&[wider]);
        scheduler.mark_dirty_areas(&[wider], &octree);

        assert!(scheduler
            .pending_tiles
            .iter()
            .all(|tile| scheduler.whitelisted_tiles.contains(&tile.coord)));
    }
}

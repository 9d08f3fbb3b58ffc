//! Structure tiles that share one health pool across many grid cells
//!
//! Multi-cell structures (platforms, buildings) are tracked as tile groups.
//! Every member cell keeps a `TileData` projection of the group's health, and
//! every change to the group's health is written back into all of them.

use crate::field::HealthData;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type GroupId = u32;

pub const FENCE_HEALTH: f32 = 100.0;
pub const BUILDING_HEALTH: f32 = 200.0;
pub const PLATFORM_HEALTH: f32 = 500.0;

/// Buildings occupy this many columns and rows starting at their origin cell
pub const BUILDING_WIDTH: i32 = 10;
pub const BUILDING_HEIGHT: i32 = 3;

/// Integer grid cell coordinate
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl GridPos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y, z: 0 }
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileKind {
    Fence,
    Platform,
    Building,
    /// Decorative, never tracked
    Tree,
}

/// Per-cell projection of a group's health
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileData {
    pub health: HealthData,
    pub kind: TileKind,
}

/// A group of cells sharing one health pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileGroupRecord {
    pub id: GroupId,
    pub kind: TileKind,
    pub members: BTreeSet<GridPos>,
    pub shared_health: HealthData,
}

impl TileGroupRecord {
    pub fn new(id: GroupId, kind: TileKind, initial_health: f32) -> Self {
        Self {
            id,
            kind,
            members: BTreeSet::new(),
            shared_health: HealthData::full(initial_health),
        }
    }

    pub fn add_tile(&mut self, pos: GridPos) -> bool {
        self.members.insert(pos)
    }

    pub fn remove_tile(&mut self, pos: &GridPos) -> bool {
        self.members.remove(pos)
    }

    /// Applies a signed delta clamped to `[0, max]`
    pub fn update_health(&mut self, delta: f32) {
        self.shared_health = self.shared_health.with_delta(delta);
    }

    /// Writes the shared health into every member cell's projection
    pub fn sync_health_across_tiles(&self, tile_data: &mut HashMap<GridPos, TileData>) {
        for pos in &self.members {
            if let Some(data) = tile_data.get_mut(pos) {
                data.health = self.shared_health;
            }
        }
    }
}

/// All tracked structure cells and their groups
#[derive(Debug, Clone, Default)]
pub struct TileMap {
    tile_data: HashMap<GridPos, TileData>,
    groups: BTreeMap<GroupId, TileGroupRecord>,
    cell_groups: HashMap<GridPos, GroupId>,
    next_group_id: GroupId,
}

impl TileMap {
    pub fn new() -> Self {
        Self {
            next_group_id: 1,
            ..Default::default()
        }
    }

    pub fn create_group(&mut self, kind: TileKind, initial_health: f32) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        self.groups
            .insert(id, TileGroupRecord::new(id, kind, initial_health));
        debug!(
            "Created tile group {} ({:?}) with shared health {}",
            id, kind, initial_health
        );
        id
    }

    /// Adds `pos` to `group`, moving it out of any group it was in before
    pub fn add_tile_to_group(&mut self, group: GroupId, pos: GridPos) -> bool {
        if !self.groups.contains_key(&group) {
            warn!("Tile group {} does not exist, cannot add {:?}", group, pos);
            return false;
        }

        if let Some(previous) = self.cell_groups.get(&pos).copied() {
            if previous == group {
                return true;
            }
            if let Some(old) = self.groups.get_mut(&previous) {
                old.remove_tile(&pos);
            }
        }

        let Some(record) = self.groups.get_mut(&group) else {
            return false;
        };
        record.add_tile(pos);
        self.cell_groups.insert(pos, group);
        self.tile_data.insert(
            pos,
            TileData {
                health: record.shared_health,
                kind: record.kind,
            },
        );
        true
    }

    /// Removes a cell from tracking; its group survives even if now empty
    pub fn remove_tile(&mut self, pos: &GridPos) -> bool {
        let removed = self.tile_data.remove(pos).is_some();
        if let Some(group) = self.cell_groups.remove(pos) {
            if let Some(record) = self.groups.get_mut(&group) {
                record.remove_tile(pos);
            }
        }
        removed
    }

    pub fn remove_group(&mut self, group: GroupId) -> Option<TileGroupRecord> {
        let record = self.groups.remove(&group)?;
        for pos in &record.members {
            self.tile_data.remove(pos);
            self.cell_groups.remove(pos);
        }
        Some(record)
    }

    pub fn add_fence(&mut self, pos: GridPos) -> GroupId {
        let group = self.create_group(TileKind::Fence, FENCE_HEALTH);
        self.add_tile_to_group(group, pos);
        group
    }

    /// Platforms are two stacked cells
    pub fn add_platform(&mut self, pos: GridPos) -> GroupId {
        let group = self.create_group(TileKind::Platform, PLATFORM_HEALTH);
        self.add_tile_to_group(group, pos);
        self.add_tile_to_group(group, pos.offset(0, 1));
        group
    }

    pub fn add_building(&mut self, pos: GridPos) -> GroupId {
        let group = self.create_group(TileKind::Building, BUILDING_HEALTH);
        for dx in 0..BUILDING_WIDTH {
            for dy in 0..BUILDING_HEIGHT {
                self.add_tile_to_group(group, pos.offset(dx, dy));
            }
        }
        group
    }

    /// Places a structure of `kind` at `pos`; trees are not tracked
    pub fn add_structure(&mut self, kind: TileKind, pos: GridPos) -> Option<GroupId> {
        match kind {
            TileKind::Fence => Some(self.add_fence(pos)),
            TileKind::Platform => Some(self.add_platform(pos)),
            TileKind::Building => Some(self.add_building(pos)),
            TileKind::Tree => None,
        }
    }

    /// Applies a clamped health delta to a group and propagates it to every
    /// member cell
    pub fn update_group_health(&mut self, group: GroupId, delta: f32) -> Option<HealthData> {
        let record = self.groups.get_mut(&group)?;
        record.update_health(delta);
        record.sync_health_across_tiles(&mut self.tile_data);
        debug!(
            "Updated group {} health to {}",
            group, record.shared_health.current
        );
        Some(record.shared_health)
    }

    /// Replaces a group with an authoritative record, as an observer does on
    /// receiving a replicated group
    pub fn apply_record(&mut self, record: TileGroupRecord) {
        if let Some(existing) = self.groups.get(&record.id) {
            let dropped: Vec<GridPos> = existing
                .members
                .difference(&record.members)
                .copied()
                .collect();
            for pos in dropped {
                self.tile_data.remove(&pos);
                self.cell_groups.remove(&pos);
            }
        }

        for pos in &record.members {
            if let Some(previous) = self.cell_groups.insert(*pos, record.id) {
                if previous != record.id {
                    if let Some(old) = self.groups.get_mut(&previous) {
                        old.remove_tile(pos);
                    }
                }
            }
            self.tile_data.insert(
                *pos,
                TileData {
                    health: record.shared_health,
                    kind: record.kind,
                },
            );
        }

        self.next_group_id = self.next_group_id.max(record.id + 1);
        self.groups.insert(record.id, record);
    }

    pub fn tile(&self, pos: &GridPos) -> Option<&TileData> {
        self.tile_data.get(pos)
    }

    pub fn tile_health(&self, pos: &GridPos) -> Option<f32> {
        match self.tile_data.get(pos) {
            Some(data) => Some(data.health.current),
            None => {
                warn!("Tile at {:?} does not exist", pos);
                None
            }
        }
    }

    pub fn group(&self, group: GroupId) -> Option<&TileGroupRecord> {
        self.groups.get(&group)
    }

    pub fn group_of(&self, pos: &GridPos) -> Option<GroupId> {
        self.cell_groups.get(pos).copied()
    }

    pub fn groups(&self) -> impl Iterator<Item = &TileGroupRecord> {
        self.groups.values()
    }

    pub fn is_occupied(&self, pos: &GridPos) -> bool {
        self.tile_data.contains_key(pos)
    }
}

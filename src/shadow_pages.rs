//! Executable region bookkeeping
//!
//! Every range of monitored-program memory that is currently executable is
//! tracked as one [`ShadowPageRegion`]. Ranges backed by a known module image
//! are tracked but never marked shadow. Anonymous executable memory, which is
//! where dynamically generated code lives, is marked shadow.
//!
//! Regions never overlap. A change covering part of an existing region splits
//! it, and a new region absorbs adjacent regions of the same origin.
//!
//! The engine's own reserved ranges (its code cache areas and interception
//! buffers) are recorded in a separate list and never become shadow regions.

use serde::Serialize;
use std::collections::BTreeMap;

/// Where an executable region came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionOrigin {
    StaticImage,
    Anonymous,
}

/// A half-open address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn with_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// An executable region of the monitored program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowPageRegion {
    pub base: u64,
    pub size: u64,
    pub origin: RegionOrigin,
    pub shadow: bool,
}

impl ShadowPageRegion {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.base, self.end())
    }
}

/// What backs a range that just became executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    ModuleImage,
    /// No module, an anonymous module, or the lookup failed
    Unknown,
}

/// Region changes produced by one event, for record emission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionChange {
    pub added: Vec<ShadowPageRegion>,
    pub removed: Vec<AddressRange>,
}

/// Growth of an engine or application code area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AreaExpansion {
    pub original: AddressRange,
    pub expanded: AddressRange,
}

#[derive(Debug, Default)]
pub struct ShadowPageManager {
    regions: BTreeMap<u64, ShadowPageRegion>,
    code_areas: Vec<AddressRange>,
    engine_areas: Vec<AddressRange>,
    interception: Vec<AddressRange>,
}

impl ShadowPageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protection of `range` changed
    pub fn executable_change(
        &mut self,
        range: AddressRange,
        becomes_executable: bool,
        backing: Backing,
    ) -> RegionChange {
        if range.is_empty() {
            return RegionChange::default();
        }
        if !becomes_executable {
            return RegionChange {
                added: Vec::new(),
                removed: self.carve(range),
            };
        }

        let (origin, shadow) = match backing {
            Backing::ModuleImage => (RegionOrigin::StaticImage, false),
            Backing::Unknown => (RegionOrigin::Anonymous, true),
        };
        let removed = self.carve(range);
        let region = self.insert_merged(range, origin, shadow);
        tracing::debug!(
            base = region.base,
            size = region.size,
            ?origin,
            shadow,
            "executable region"
        );
        RegionChange {
            added: vec![region],
            removed,
        }
    }

    /// Mapping released: drop every region inside `range`
    pub fn release(&mut self, range: AddressRange) -> Vec<AddressRange> {
        self.carve(range)
    }

    /// Code was written into executable memory; that span is now generated code
    ///
    /// Only the bytes that were already executable turn into shadow code. Returns
    /// the shadow regions now covering them, empty when the write missed
    /// tracked memory.
    pub fn mark_modified(&mut self, range: AddressRange) -> Vec<ShadowPageRegion> {
        if range.is_empty() {
            return Vec::new();
        }
        let spans = self.carve(range);
        for span in &spans {
            self.insert_merged(*span, RegionOrigin::Anonymous, true);
        }

        let mut covering: Vec<ShadowPageRegion> = Vec::new();
        for span in spans {
            if let Some(region) = self.region_at(span.start) {
                if covering.last().map(|r| r.base) != Some(region.base) {
                    covering.push(region.clone());
                }
            }
        }
        covering
    }

    /// Remove `range` from all regions, splitting partial overlaps
    fn carve(&mut self, range: AddressRange) -> Vec<AddressRange> {
        let overlapping: Vec<u64> = self
            .regions
            .range(..range.end)
            .filter(|(_, r)| r.end() > range.start)
            .map(|(&base, _)| base)
            .collect();

        let mut removed = Vec::new();
        for base in overlapping {
            let Some(region) = self.regions.remove(&base) else {
                continue;
            };
            let cut_start = region.base.max(range.start);
            let cut_end = region.end().min(range.end);
            removed.push(AddressRange::new(cut_start, cut_end));

            if region.base < range.start {
                self.insert_raw(region.base, range.start, region.origin, region.shadow);
            }
            if region.end() > range.end {
                self.insert_raw(range.end, region.end(), region.origin, region.shadow);
            }
        }
        removed
    }

    fn insert_raw(&mut self, start: u64, end: u64, origin: RegionOrigin, shadow: bool) {
        self.regions.insert(
            start,
            ShadowPageRegion {
                base: start,
                size: end - start,
                origin,
                shadow,
            },
        );
    }

    /// Insert into a hole, absorbing adjacent regions of the same origin
    fn insert_merged(
        &mut self,
        range: AddressRange,
        origin: RegionOrigin,
        shadow: bool,
    ) -> ShadowPageRegion {
        let mut start = range.start;
        let mut end = range.end;

        let left = self
            .regions
            .range(..start)
            .next_back()
            .filter(|(_, r)| r.end() == start && r.origin == origin && r.shadow == shadow)
            .map(|(&base, _)| base);
        if let Some(base) = left {
            self.regions.remove(&base);
            start = base;
        }

        let right = self
            .regions
            .get(&end)
            .filter(|r| r.origin == origin && r.shadow == shadow)
            .map(|r| r.end());
        if let Some(right_end) = right {
            self.regions.remove(&end);
            end = right_end;
        }

        self.insert_raw(start, end, origin, shadow);
        self.regions[&start].clone()
    }

    pub fn region_at(&self, addr: u64) -> Option<&ShadowPageRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.range().contains(addr))
    }

    pub fn is_shadow(&self, addr: u64) -> bool {
        self.region_at(addr).is_some_and(|r| r.shadow)
    }

    pub fn regions(&self) -> impl Iterator<Item = &ShadowPageRegion> {
        self.regions.values()
    }

    pub fn shadow_count(&self) -> usize {
        self.regions.values().filter(|r| r.shadow).count()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// An engine or application code area grew or shrank
    pub fn code_area_expanded(&mut self, expansion: AreaExpansion, is_engine_area: bool) {
        let areas = if is_engine_area {
            &mut self.engine_areas
        } else {
            &mut self.code_areas
        };
        match areas.iter_mut().find(|a| **a == expansion.original) {
            Some(area) => *area = expansion.expanded,
            None => areas.push(expansion.expanded),
        }
    }

    pub fn code_area_created(&mut self, range: AddressRange) {
        if !self.code_areas.contains(&range) {
            self.code_areas.push(range);
        }
    }

    /// A code area went away; its memory is released as well
    pub fn code_area_destroyed(&mut self, range: AddressRange) -> Vec<AddressRange> {
        self.code_areas.retain(|a| !a.overlaps(&range));
        self.release(range)
    }

    pub fn register_interception(&mut self, range: AddressRange) {
        if !self.interception.contains(&range) {
            self.interception.push(range);
        }
    }

    pub fn code_areas(&self) -> &[AddressRange] {
        &self.code_areas
    }

    pub fn engine_areas(&self) -> &[AddressRange] {
        &self.engine_areas
    }

    pub fn interception_areas(&self) -> &[AddressRange] {
        &self.interception
    }

    /// True when no two regions intersect
    pub fn check_non_overlap(&self) -> bool {
        let regions: Vec<_> = self.regions.values().collect();
        regions.windows(2).all(|w| w[0].end() <= w[1].base)
    }
}

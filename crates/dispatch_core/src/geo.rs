//! Geographic primitives: coordinates, haversine distance, search areas and an
//! H3-bucketed index of driver positions.
//!
//! The index uses resolution 7 (~1.4 km edge), coarse enough that a city-scale
//! radius query touches a few dozen cells; the exact haversine check runs on
//! the drivers found in those cells.

use std::collections::HashMap;

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::model::DriverId;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolution used to bucket driver positions.
const INDEX_RESOLUTION: Resolution = Resolution::Seven;

/// Average hexagon edge length at [`INDEX_RESOLUTION`], in kilometres.
const INDEX_EDGE_KM: f64 = 1.406;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    fn cell(self) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lng)
            .ok()
            .map(|ll| ll.to_cell(INDEX_RESOLUTION))
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Axis-aligned lat/lng rectangle, e.g. the admin map viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: GeoPoint) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }
}

/// Spatial restriction applied when listing drivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchArea {
    Radius { center: GeoPoint, radius_km: f64 },
    Bounds(BoundingBox),
}

impl SearchArea {
    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            SearchArea::Radius { center, radius_km } => haversine_km(*center, point) <= *radius_km,
            SearchArea::Bounds(bounds) => bounds.contains(point),
        }
    }
}

/// Driver positions bucketed by H3 cell.
///
/// Maintains both directions so a heartbeat moves a driver between buckets in
/// O(bucket size) instead of rebuilding.
#[derive(Debug, Default)]
pub struct DriverSpatialIndex {
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    driver_to_cell: HashMap<DriverId, CellIndex>,
}

impl DriverSpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move a driver. `None` removes it from the index.
    pub fn upsert(&mut self, driver: DriverId, position: Option<GeoPoint>) {
        let new_cell = position.and_then(GeoPoint::cell);
        let old_cell = self.driver_to_cell.get(&driver).copied();
        if old_cell == new_cell {
            return;
        }
        if let Some(old) = old_cell {
            self.remove_from_cell(driver, old);
            self.driver_to_cell.remove(&driver);
        }
        if let Some(cell) = new_cell {
            self.drivers_by_cell.entry(cell).or_default().push(driver);
            self.driver_to_cell.insert(driver, cell);
        }
    }

    pub fn remove(&mut self, driver: DriverId) {
        if let Some(cell) = self.driver_to_cell.remove(&driver) {
            self.remove_from_cell(driver, cell);
        }
    }

    fn remove_from_cell(&mut self, driver: DriverId, cell: CellIndex) {
        if let Some(ids) = self.drivers_by_cell.get_mut(&cell) {
            ids.retain(|id| *id != driver);
            if ids.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }

    /// Drivers whose cell lies within the grid disk covering `radius_km`.
    /// Superset of the exact answer; callers still check haversine distance.
    pub fn candidates_within(&self, center: GeoPoint, radius_km: f64) -> Vec<DriverId> {
        let Some(origin) = center.cell() else {
            return Vec::new();
        };
        // Neighbouring hexagon centres are sqrt(3) * edge apart.
        let spacing = INDEX_EDGE_KM * 3f64.sqrt();
        let k = (radius_km.max(0.0) / spacing).ceil() as u32 + 1;
        origin
            .grid_disk::<Vec<_>>(k)
            .into_iter()
            .filter_map(|cell| self.drivers_by_cell.get(&cell))
            .flat_map(|ids| ids.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.driver_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.driver_to_cell.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAIPEI_101: GeoPoint = GeoPoint::new(25.033, 121.565);
    const TAIPEI_MAIN: GeoPoint = GeoPoint::new(25.047, 121.517);

    #[test]
    fn haversine_matches_known_distance() {
        let d = haversine_km(TAIPEI_101, TAIPEI_MAIN);
        assert!((d - 5.07).abs() < 0.2, "distance was {d}");
        assert_eq!(haversine_km(TAIPEI_101, TAIPEI_101), 0.0);
    }

    #[test]
    fn radius_query_finds_nearby_and_skips_far_drivers() {
        let mut index = DriverSpatialIndex::new();
        let near = DriverId::new();
        let far = DriverId::new();
        index.upsert(near, Some(GeoPoint::new(25.035, 121.560)));
        index.upsert(far, Some(GeoPoint::new(24.15, 120.67)));

        let found = index.candidates_within(TAIPEI_101, 3.0);
        assert!(found.contains(&near));
        assert!(!found.contains(&far));
    }

    #[test]
    fn moving_driver_updates_bucket() {
        let mut index = DriverSpatialIndex::new();
        let driver = DriverId::new();
        index.upsert(driver, Some(GeoPoint::new(24.15, 120.67)));
        assert!(index.candidates_within(TAIPEI_101, 3.0).is_empty());

        index.upsert(driver, Some(TAIPEI_101));
        assert_eq!(index.candidates_within(TAIPEI_101, 3.0), vec![driver]);

        index.upsert(driver, None);
        assert!(index.is_empty());
    }

    #[test]
    fn bounding_box_contains_inclusive_edges() {
        let bounds = BoundingBox {
            min_lat: 25.0,
            max_lat: 25.1,
            min_lng: 121.5,
            max_lng: 121.6,
        };
        assert!(bounds.contains(TAIPEI_101));
        assert!(bounds.contains(GeoPoint::new(25.0, 121.5)));
        assert!(!bounds.contains(GeoPoint::new(24.99, 121.55)));
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use rstar::primitives::GeomWithData;
use rstar::{AABB, RTree};
use uuid::Uuid;

use crate::error::DispatchResult;
use crate::geo::{BoundingBox, GeoPoint};

/// One driver position in the tree, keyed `[lng, lat]`.
type DriverPoint = GeomWithData<[f64; 2], Uuid>;

struct Points {
    tree: RTree<DriverPoint>,
    position: HashMap<Uuid, [f64; 2]>,
}

impl Default for Points {
    fn default() -> Self {
        Self {
            tree: RTree::new(),
            position: HashMap::new(),
        }
    }
}

/// Driver positions in an R-tree over `(lng, lat)`.
#[derive(Default)]
pub struct GeoIndex {
    points: RwLock<Points>,
}

fn key(point: &GeoPoint) -> [f64; 2] {
    [point.lng, point.lat]
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, driver_id: Uuid, point: &GeoPoint) -> DispatchResult<()> {
        let at = key(point);
        let mut points = self.points.write()?;

        if let Some(prev) = points.position.insert(driver_id, at) {
            if prev == at {
                return Ok(());
            }
            points.tree.remove(&DriverPoint::new(prev, driver_id));
        }
        points.tree.insert(DriverPoint::new(at, driver_id));
        Ok(())
    }

    pub fn remove(&self, driver_id: Uuid) -> DispatchResult<bool> {
        let mut points = self.points.write()?;
        match points.position.remove(&driver_id) {
            Some(prev) => {
                points.tree.remove(&DriverPoint::new(prev, driver_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every indexed driver inside the rectangles covering the circle.
    /// A superset of the drivers inside the circle; callers filter by distance.
    pub fn near(&self, center: &GeoPoint, radius_km: f64) -> DispatchResult<Vec<Uuid>> {
        let points = self.points.read()?;

        let mut ids: Vec<Uuid> = BoundingBox::covering(center, radius_km)
            .iter()
            .flat_map(|bbox| {
                let envelope = AABB::from_corners(
                    [bbox.min_lng, bbox.min_lat],
                    [bbox.max_lng, bbox.max_lat],
                );
                points
                    .tree
                    .locate_in_envelope(&envelope)
                    .map(|p| p.data)
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn all(&self) -> DispatchResult<Vec<Uuid>> {
        Ok(self.points.read()?.position.keys().copied().collect())
    }

    pub fn contains(&self, driver_id: Uuid) -> DispatchResult<bool> {
        Ok(self.points.read()?.position.contains_key(&driver_id))
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.position.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

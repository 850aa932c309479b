//! Tree-sensor join and health prediction.
//!
//! Gathers a tree's assigned sensors and their most recent readings. Sensor
//! fetches run concurrently and are best-effort: a sensor whose fetch fails is
//! logged and left out, and the rest of the tree is still returned.
//! Cancellation is never swallowed.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::models::{
    Health, NewTree, Page, SensorData, SensorPrediction, TimeRange, Tree, TreeSensorData,
    TreeSensorPrediction,
};
use crate::registry::validate_location;
use crate::store::Store;

// ---

/// Upper bound on raw readings returned per sensor.
pub const MAX_RAW_READINGS: u32 = 100;

#[derive(Clone)]
pub struct TreeJoin {
    store: Arc<dyn Store>,
}

impl TreeJoin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        TreeJoin { store }
    }

    pub async fn get_tree(
        &self,
        tree_id: i64,
        include_raw: bool,
        cancel: &Cancel,
    ) -> Result<TreeSensorData> {
        // ---
        let tree = cancel.run(self.store.get_tree(tree_id)).await?;
        self.assemble(tree, include_raw, cancel).await
    }

    pub async fn get_tree_prediction(
        &self,
        tree_id: i64,
        include_raw: bool,
        cancel: &Cancel,
    ) -> Result<TreeSensorPrediction> {
        // ---
        let data = self.get_tree(tree_id, include_raw, cancel).await?;
        Ok(predict(data))
    }

    /// Every tree, ascending by identifier.
    pub async fn get_all_trees(
        &self,
        include_raw: bool,
        cancel: &Cancel,
    ) -> Result<Vec<TreeSensorData>> {
        // ---
        let trees = cancel.run(self.store.list_trees()).await?;
        debug!("Assembling sensor data for {} trees", trees.len());
        try_join_all(
            trees
                .into_iter()
                .map(|tree| self.assemble(tree, include_raw, cancel)),
        )
        .await
    }

    pub async fn create_tree(&self, tree: NewTree, cancel: &Cancel) -> Result<Tree> {
        // ---
        if tree.species.trim().is_empty() || tree.tree_number.trim().is_empty() {
            return Err(Error::BadRequest(
                "species and tree_number must not be empty".into(),
            ));
        }
        if tree.age < 0 {
            return Err(Error::BadRequest(format!("negative age {}", tree.age)));
        }
        validate_location(tree.location.latitude, tree.location.longitude)?;

        let tree = cancel.run(self.store.create_tree(tree)).await?;
        info!("Created tree {} ({})", tree.id, tree.tree_number);
        Ok(tree)
    }

    pub async fn assign_sensor(&self, tree_id: i64, sensor_id: &str, cancel: &Cancel) -> Result<()> {
        // ---
        cancel.run(self.store.assign_sensor(tree_id, sensor_id)).await?;
        info!("Assigned sensor {} to tree {}", sensor_id, tree_id);
        Ok(())
    }

    pub async fn unassign_sensor(
        &self,
        tree_id: i64,
        sensor_id: &str,
        cancel: &Cancel,
    ) -> Result<()> {
        // ---
        cancel.run(self.store.unassign_sensor(tree_id, sensor_id)).await?;
        info!("Unassigned sensor {} from tree {}", sensor_id, tree_id);
        Ok(())
    }

    async fn assemble(
        &self,
        tree: Tree,
        include_raw: bool,
        cancel: &Cancel,
    ) -> Result<TreeSensorData> {
        // ---
        let sensor_ids = cancel.run(self.store.tree_sensor_ids(tree.id)).await?;

        let fetched = join_all(
            sensor_ids
                .iter()
                .map(|sid| self.sensor_data(sid, include_raw, cancel)),
        )
        .await;

        let mut sensors = Vec::with_capacity(fetched.len());
        for (sid, result) in sensor_ids.iter().zip(fetched) {
            match result {
                Ok(data) => sensors.push(data),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("Omitting sensor {} from tree {}: {}", sid, tree.id, e),
            }
        }

        Ok(TreeSensorData { tree, sensors })
    }

    async fn sensor_data(
        &self,
        sensor_id: &str,
        include_raw: bool,
        cancel: &Cancel,
    ) -> Result<SensorData> {
        // ---
        let latest = match cancel.run(self.store.latest_reading(sensor_id)).await {
            Ok(r) => Some(r),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let readings = if include_raw && latest.is_some() {
            let page = Page::new(Some(1), Some(MAX_RAW_READINGS));
            cancel
                .run(
                    self.store
                        .readings_by_sensor(sensor_id, page, TimeRange::default()),
                )
                .await?
                .0
        } else {
            Vec::new()
        };

        Ok(SensorData {
            sensor_id: sensor_id.to_string(),
            latest,
            readings,
        })
    }
}

/// Attach a health label to every sensor of the tree.
pub fn predict(data: TreeSensorData) -> TreeSensorPrediction {
    // ---
    let tree_id = data.tree.id;
    let sensors = data
        .sensors
        .into_iter()
        .map(|s| {
            let humidity = s.latest.as_ref().map(|r| r.humidity);
            SensorPrediction {
                sensor_id: s.sensor_id,
                tree_id,
                health: humidity.map_or(Health::Unknown, Health::from_humidity),
                humidity,
                readings: s.readings,
            }
        })
        .collect();

    TreeSensorPrediction {
        tree: data.tree,
        sensors,
    }
}

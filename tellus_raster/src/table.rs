/*
 * Copyright © 2025, United States Government, as represented by the Administrator of
 * the National Aeronautics and Space Administration. All rights reserved.
 *
 * The “TELLUS” software is licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License. You may obtain a copy
 * of the License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software distributed under
 * the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
 * either express or implied. See the License for the specific language governing permissions
 * and limitations under the License.
 */

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// one station row: identifier, metadata and the reading series over the request window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRecord {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub values: Vec<f64>,
}

impl StationRecord {
    /// the reading reported for the timestep: the last valid value of the window
    pub fn value(&self) -> f64 {
        self.values.iter().rev().find(|v| !v.is_nan()).copied().unwrap_or(f64::NAN)
    }
}

/// a rectangular record set keyed by station identifier with one value column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationTable {
    /// the value column name (typically the sensor class)
    pub variable: String,
    pub rows: Vec<StationRecord>,
}

impl StationTable {
    pub fn new(variable: &str) -> StationTable {
        StationTable { variable: variable.to_string(), rows: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// replace known invalid sentinel readings with NaN
    pub fn drop_sentinels(&mut self, sentinels: &[f64]) {
        for row in &mut self.rows {
            for v in &mut row.values {
                if sentinels.iter().any(|s| *v == *s) {
                    *v = f64::NAN;
                }
            }
        }
    }

    /// remove stations whose whole reading series is NaN
    pub fn drop_all_nan_stations(&mut self) {
        self.rows.retain(|r| r.values.iter().any(|v| !v.is_nan()));
    }

    /// sort by station id so writes are deterministic
    pub fn sort_by_id(&mut self) {
        self.rows.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// write as delimited text with a header row, one line per station
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut w = csv::Writer::from_path(path)?;
        w.write_record(["id", "name", "lat", "lon", self.variable.as_str()])?;
        for row in &self.rows {
            let lat = format!("{}", row.lat);
            let lon = format!("{}", row.lon);
            let value = format!("{}", row.value());
            w.write_record([row.id.as_str(), row.name.as_str(), lat.as_str(), lon.as_str(), value.as_str()])?;
        }
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StationTable {
        let mut t = StationTable::new("PLUVIOMETER");
        t.rows.push(StationRecord {
            id: "st2".into(),
            name: "upper".into(),
            lat: 44.1,
            lon: 8.2,
            values: vec![1.0, -9998.0, 3.0],
        });
        t.rows.push(StationRecord {
            id: "st1".into(),
            name: "lower".into(),
            lat: 44.0,
            lon: 8.0,
            values: vec![-9998.0, -9998.0],
        });
        t
    }

    #[test]
    fn sentinels_and_all_nan_stations() {
        let mut t = table();
        t.drop_sentinels(&[-9998.0]);
        assert!(t.rows[0].values[1].is_nan());
        t.drop_all_nan_stations();
        assert_eq!(t.len(), 1);
        assert_eq!(t.rows[0].id, "st2");
        assert_eq!(t.rows[0].value(), 3.0);
    }

    #[test]
    fn csv_has_header_and_is_keyed_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.csv");
        let mut t = table();
        t.sort_by_id();
        t.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "id,name,lat,lon,PLUVIOMETER");
        assert!(lines.next().unwrap().starts_with("st1,"));
    }
}

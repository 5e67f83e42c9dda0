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

///! the JSON request document: bounds in their several spellings, the time window, and
///! file loading for the CLI

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use tellus_common::datetime::parse_instant;
use tellus_common::geo::{BoundingBox, Crs};
use tellus_common::timestep::TimeRange;
use tellus_download::{config_error, Result};
use tellus_raster::geotiff::read_geotiff;

pub fn load_request(path: impl AsRef<Path>) -> Result<Value> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&text)?)
}

#[derive(Debug, Deserialize)]
struct BoundsDict {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    crs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RasterDict {
    raster: String,
    #[serde(default)]
    buffer: usize,
}

/// bounds come as "W,S,E,N[,crs]", as a 4-element list (optionally followed by a CRS
/// string), as a {west,south,east,north} object, or as a {raster} dataset spec whose grid
/// geometry defines the box
pub fn bounds_from_spec(spec: &Value) -> Result<BoundingBox> {
    match spec {
        Value::String(s) => {
            let parts: Vec<&str> = s.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return Err(config_error(format!("bounds string needs W,S,E,N: {}", s)));
            }
            let mut nums = [0.0f64; 4];
            for (i, p) in parts[..4].iter().enumerate() {
                nums[i] = p
                    .parse::<f64>()
                    .map_err(|_| config_error(format!("bad bounds value {}", p)))?;
            }
            let crs = match parts.get(4) {
                Some(c) => Crs::parse(c)?,
                None => Crs::wgs84(),
            };
            Ok(BoundingBox::from_wsen(&nums, crs))
        }
        Value::Array(items) => {
            if items.len() < 4 {
                return Err(config_error(format!("bounds list needs 4 numbers: {}", spec)));
            }
            let mut nums = [0.0f64; 4];
            for (i, v) in items[..4].iter().enumerate() {
                nums[i] = v
                    .as_f64()
                    .ok_or_else(|| config_error(format!("bad bounds value {}", v)))?;
            }
            let crs = match items.get(4).and_then(|v| v.as_str()) {
                Some(c) => Crs::parse(c)?,
                None => Crs::wgs84(),
            };
            Ok(BoundingBox::from_wsen(&nums, crs))
        }
        Value::Object(map) if map.contains_key("raster") => {
            let d: RasterDict = serde_json::from_value(spec.clone())?;
            let grid = read_geotiff(Path::new(&d.raster))?;
            Ok(BoundingBox::from_grid(
                grid.transform,
                grid.rows(),
                grid.cols(),
                grid.crs,
                d.buffer,
            ))
        }
        Value::Object(_) => {
            let d: BoundsDict = serde_json::from_value(spec.clone())?;
            let crs = match &d.crs {
                Some(c) => Crs::parse(c)?,
                None => Crs::wgs84(),
            };
            Ok(BoundingBox::new(d.west, d.south, d.east, d.north, crs))
        }
        other => Err(config_error(format!("invalid bounds spec {}", other))),
    }
}

/// the request window: one instant, a [start, end] pair, or a longer instant list that
/// collapses to its envelope
pub fn time_range_from_spec(spec: &Value) -> Result<TimeRange> {
    let instant = |v: &Value| -> Result<chrono::DateTime<chrono::Utc>> {
        let s = v
            .as_str()
            .ok_or_else(|| config_error(format!("bad time value {}", v)))?;
        parse_instant(s).ok_or_else(|| config_error(format!("cannot parse instant {}", s)))
    };

    match spec {
        Value::String(_) => {
            let t = instant(spec)?;
            Ok(TimeRange::new(t, t))
        }
        Value::Array(items) if !items.is_empty() => {
            let instants = items.iter().map(instant).collect::<Result<Vec<_>>>()?;
            Ok(TimeRange::from_instants(&instants)?)
        }
        other => Err(config_error(format!("invalid time spec {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bounds_spellings_agree() {
        let a = bounds_from_spec(&json!("6, 36, 19, 48")).unwrap();
        let b = bounds_from_spec(&json!([6.0, 36.0, 19.0, 48.0])).unwrap();
        let c = bounds_from_spec(&json!({"west": 6.0, "south": 36.0, "east": 19.0, "north": 48.0}))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.crs, Crs::wgs84());

        let utm = bounds_from_spec(&json!([3.0e5, 4.9e6, 4.0e5, 5.0e6, "EPSG:32632"])).unwrap();
        assert_eq!(utm.crs, Crs::Epsg(32632));

        assert!(bounds_from_spec(&json!([6.0, 36.0])).is_err());
        assert!(bounds_from_spec(&json!("6;36;19;48")).is_err());
    }

    #[test]
    fn bounds_from_reference_raster() {
        use ndarray::Array2;
        use tellus_common::geo::GeoTransform;
        use tellus_raster::{geotiff::write_geotiff, Grid};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.tif");
        let g = Grid::new(
            Array2::zeros((4, 8)),
            GeoTransform::new(6.0, 48.0, 0.25, -0.25),
            Crs::wgs84(),
        );
        write_geotiff(&g, &path).unwrap();

        let bb = bounds_from_spec(&json!({"raster": path.to_str().unwrap(), "buffer": 2}))
            .unwrap();
        assert!((bb.west - 5.5).abs() < 1e-9);
        assert!((bb.east - 8.5).abs() < 1e-9);
        assert!((bb.north - 48.5).abs() < 1e-9);
        assert!(bb.grid().is_some());
    }

    #[test]
    fn time_spellings() {
        let point = time_range_from_spec(&json!("2023-12-30")).unwrap();
        assert_eq!(point.start(), point.end());

        let pair = time_range_from_spec(&json!(["2024-01-31", "2024-01-01"])).unwrap();
        assert!(pair.start() < pair.end());

        let many =
            time_range_from_spec(&json!(["2024-01-05", "2024-01-01", "2024-01-03"])).unwrap();
        assert_eq!(many.start(), pair.start());

        assert!(time_range_from_spec(&json!([])).is_err());
        assert!(time_range_from_spec(&json!(17)).is_err());
    }
}

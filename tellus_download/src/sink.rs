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

///! the destination sink: template-named artifacts on disk. The path template is resolved
///! against the calendar fields of the effective timestep, then against the payload tags -
///! unresolved tokens survive literally instead of failing the write

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use tellus_common::fs::ensure_writable_dir;
use tellus_common::strings::path_safe;
use tellus_common::timestep::{Freq, TimeStep};
use tellus_raster::{geotiff, netcdf, Payload};

use crate::{config_error, Result, TellusError};

/* #region Tags **************************************************************************************/

/// per-payload context for sink naming. A `timestep` tag overrides the iteration timestep
/// for that write
#[derive(Debug, Clone, Default)]
pub struct Tags {
    pub variable: Option<String>,
    pub agg_method: Option<String>,
    pub layer: Option<String>,
    pub tile: Option<String>,
    pub timestep: Option<TimeStep>,
}

impl Tags {
    pub fn none() -> Tags {
        Tags::default()
    }

    pub fn variable(name: impl ToString) -> Tags {
        Tags { variable: Some(name.to_string()), ..Tags::default() }
    }

    pub fn with_agg(mut self, agg: impl ToString) -> Tags {
        self.agg_method = Some(agg.to_string());
        self
    }

    pub fn with_tile(mut self, tile: impl ToString) -> Tags {
        self.tile = Some(tile.to_string());
        self
    }

    pub fn with_layer(mut self, layer: impl ToString) -> Tags {
        self.layer = Some(layer.to_string());
        self
    }

    pub fn with_timestep(mut self, ts: TimeStep) -> Tags {
        self.timestep = Some(ts);
        self
    }

    /// brace-token substitutions carried by this tag set
    fn substitutions(&self) -> Vec<(&'static str, &String)> {
        let mut subs = Vec::new();
        if let Some(v) = &self.variable { subs.push(("{variable}", v)); }
        if let Some(v) = &self.agg_method { subs.push(("{agg_method}", v)); }
        if let Some(v) = &self.layer { subs.push(("{layer}", v)); }
        if let Some(v) = &self.tile { subs.push(("{tile}", v)); }
        subs
    }
}

/* #endregion Tags */

/* #region DestSink **********************************************************************************/

#[derive(Debug, Clone, Deserialize)]
struct SinkSpec {
    path: String,
    filename: String,
}

/// a logical output dataset: a directory template plus a filename template
#[derive(Debug, Clone)]
pub struct DestSink {
    dir_template: String,
    file_template: String,
}

impl DestSink {
    /// from a full filesystem path - the last component becomes the filename template
    pub fn from_path(path: &str) -> Result<DestSink> {
        let p = Path::new(path);
        let file = p
            .file_name()
            .and_then(|o| o.to_str())
            .ok_or_else(|| config_error(format!("destination {} has no filename", path)))?;
        let dir = p.parent().and_then(|d| d.to_str()).unwrap_or(".");
        Ok(DestSink { dir_template: dir.to_string(), file_template: file.to_string() })
    }

    pub fn from_parts(path: &str, filename: &str) -> DestSink {
        DestSink { dir_template: path.to_string(), file_template: filename.to_string() }
    }

    /// from a request document value: either a path string or {path, filename}
    pub fn from_spec(spec: &serde_json::Value) -> Result<DestSink> {
        match spec {
            serde_json::Value::String(s) => DestSink::from_path(s),
            serde_json::Value::Object(_) => {
                let s: SinkSpec = serde_json::from_value(spec.clone())?;
                Ok(DestSink::from_parts(&s.path, &s.filename))
            }
            other => Err(config_error(format!("invalid destination spec {}", other))),
        }
    }

    /// resolve the template against a timestep and tags. Calendar tokens first, then brace
    /// tokens; anything unrecognized stays literal
    pub fn resolve(&self, ts: &TimeStep, tags: &Tags) -> PathBuf {
        let mut dir = ts.format_tokens(&self.dir_template);
        let mut file = ts.format_tokens(&self.file_template);

        for (token, value) in tags.substitutions() {
            let value = path_safe(value);
            dir = dir.replace(token, &value);
            file = file.replace(token, &value);
        }
        Path::new(&dir).join(file)
    }

    /// materialise one payload under the resolved name. The filename suffix picks the
    /// format; re-writing the same payload leaves identical bytes
    pub fn write_data(&self, payload: &Payload, ts: &TimeStep, tags: &Tags) -> Result<PathBuf> {
        let ts_eff = tags.timestep.as_ref().unwrap_or(ts);
        let path = self.resolve(ts_eff, tags);
        if let Some(parent) = path.parent() {
            ensure_writable_dir(parent)?;
        }

        let suffix = path.extension().and_then(|o| o.to_str()).unwrap_or("");
        match (payload, suffix) {
            (Payload::Grid(grid), "tif" | "tiff") => geotiff::write_geotiff(grid, &path)?,
            (Payload::Stack(stack), "nc") => netcdf::write_netcdf(stack, &path)?,
            (Payload::Table(table), "csv" | "txt") => table.write_csv(&path)?,
            (Payload::Stack(stack), "tif" | "tiff") => {
                // single-slice cubes can go into a 2-D format
                if stack.times.len() == 1 {
                    let var = stack.vars.keys().next().cloned().unwrap_or_default();
                    geotiff::write_geotiff(&stack.layer(&var, 0)?, &path)?;
                } else {
                    return Err(config_error(format!(
                        "cannot write {}-step cube as {:?}", stack.times.len(), path
                    )));
                }
            }
            (p, s) => {
                return Err(config_error(format!("cannot write {} payload as .{}", p.kind(), s)));
            }
        }

        info!("wrote {} payload to {:?}", payload.kind(), path);
        Ok(path)
    }

    /// the most recent timestep strictly before `now` whose resolved artifact already
    /// exists, or None. The search walks back one step at a time, bounded by `max_back`
    pub fn get_last_ts(
        &self,
        now: &DateTime<Utc>,
        freq: &Freq,
        tags: &Tags,
        max_back: usize,
    ) -> Option<TimeStep> {
        let mut ts = TimeStep::of(*now, freq);
        if ts.start() >= *now {
            ts = ts.pred();
        }
        for _ in 0..max_back {
            if self.resolve(&ts, tags).is_file() {
                return Some(ts);
            }
            ts = ts.pred();
        }
        debug!("no persisted step within {} steps before {}", max_back, now);
        None
    }
}

/* #endregion DestSink */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array2;
    use tellus_common::geo::{Crs, GeoTransform};
    use tellus_raster::Grid;

    fn ts(y: i32, m: u32, d: u32) -> TimeStep {
        TimeStep::of(Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap(), &Freq::Daily)
    }

    fn grid() -> Grid {
        Grid::new(
            Array2::from_elem((3, 3), 1.5f32),
            GeoTransform::new(6.0, 48.0, 0.25, -0.25),
            Crs::wgs84(),
        )
    }

    #[test]
    fn resolves_calendar_and_tag_tokens() {
        let sink = DestSink::from_parts("/out/%Y/%m", "rain_%Y%m%d_{variable}_{agg_method}.tif");
        let tags = Tags::variable("tp").with_agg("max");
        let p = sink.resolve(&ts(2023, 12, 30), &tags);
        assert_eq!(p, PathBuf::from("/out/2023/12/rain_20231230_tp_max.tif"));
    }

    #[test]
    fn unresolved_tokens_stay_literal() {
        let sink = DestSink::from_path("/out/rain_%Y_{tile}.tif").unwrap();
        let p = sink.resolve(&ts(2023, 12, 30), &Tags::none());
        assert_eq!(p, PathBuf::from("/out/rain_2023_{tile}.tif"));
    }

    #[test]
    fn timestep_tag_overrides_iteration_step() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DestSink::from_parts(dir.path().to_str().unwrap(), "g_%Y%m%d.tif");

        let inner = ts(2024, 1, 5);
        let tags = Tags::none().with_timestep(inner.clone());
        let written = sink.write_data(&Payload::Grid(grid()), &ts(2024, 1, 1), &tags).unwrap();
        assert!(written.to_str().unwrap().ends_with("g_20240105.tif"));
    }

    #[test]
    fn write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DestSink::from_parts(dir.path().to_str().unwrap(), "g_%Y%m%d.tif");
        let payload = Payload::Grid(grid());

        let p1 = sink.write_data(&payload, &ts(2023, 12, 30), &Tags::none()).unwrap();
        let bytes1 = std::fs::read(&p1).unwrap();
        let p2 = sink.write_data(&payload, &ts(2023, 12, 30), &Tags::none()).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(bytes1, std::fs::read(&p2).unwrap());
    }

    #[test]
    fn payload_format_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DestSink::from_parts(dir.path().to_str().unwrap(), "g_%Y%m%d.nc");
        let res = sink.write_data(&Payload::Grid(grid()), &ts(2023, 12, 30), &Tags::none());
        assert!(matches!(res, Err(TellusError::ConfigError(_))));
    }

    #[test]
    fn last_ts_walks_back_and_respects_tags() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DestSink::from_parts(dir.path().to_str().unwrap(), "g_%Y%m%d_{variable}.tif");

        let tags = Tags::variable("tp");
        sink.write_data(&Payload::Grid(grid()), &ts(2024, 1, 3), &tags).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let last = sink.get_last_ts(&now, &Freq::Daily, &tags, 30).unwrap();
        assert_eq!(last, ts(2024, 1, 3));

        assert!(sink.get_last_ts(&now, &Freq::Daily, &Tags::variable("t2m"), 30).is_none());
    }
}

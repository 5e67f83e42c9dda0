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

///! shared post-processing for forecast cubes: the step axis becomes the time axis labelled
///! with the valid instants of the run, latitude is put north-up, the cube is cropped to the
///! request bounds. Every forecast source goes through this so all outputs look the same

use chrono::{DateTime, Duration, Utc};

use tellus_common::geo::BoundingBox;
use tellus_raster::GridStack;

use crate::{corrupt_payload, Result};

/// coordinate leftovers of NWP container formats that carry no information once the step
/// axis has been relabelled
const REDUNDANT_ATTRS: &[&str] = &["step", "surface", "heightAboveGround", "valid_time", "number"];

/// the valid instants of a forecast run: issue time plus each step offset
pub fn valid_times(issue: DateTime<Utc>, step_hours: &[u32]) -> Vec<DateTime<Utc>> {
    step_hours.iter().map(|h| issue + Duration::hours(*h as i64)).collect()
}

/// turn a step-stacked cube into the canonical forecast shape. The incoming stack must have
/// one slice per step (the issue-time dimension is already gone); its time labels are
/// replaced by the computed valid times, latitude is reordered north-up if it came in
/// ascending, the known redundant coordinates are dropped and the result is cropped to the
/// bounds (transformed to the cube's CRS)
pub fn postprocess(
    mut stack: GridStack,
    issue: DateTime<Utc>,
    step_hours: &[u32],
    bounds: &BoundingBox,
) -> Result<GridStack> {
    if stack.times.len() != step_hours.len() {
        return Err(corrupt_payload(format!(
            "forecast cube has {} slices for {} steps",
            stack.times.len(),
            step_hours.len()
        )));
    }
    stack.times = valid_times(issue, step_hours);

    for key in REDUNDANT_ATTRS {
        stack.attrs.remove(*key);
    }
    stack.attrs.insert("issue_time".to_string(), issue.to_rfc3339());

    stack.flip_lat_north_up();

    let bb = bounds.transform(&stack.crs)?;
    let cropped = stack.crop_to_bb(&bb)?;
    Ok(cropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array3;

    fn issue() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn step_stack() -> GridStack {
        // south-up latitude, as many GRIB stacks come in
        let times = vec![issue(); 3]; // placeholder labels, relabelled by postprocess
        let lats = vec![44.0, 45.0, 46.0];
        let lons = vec![7.0, 8.0, 9.0, 10.0];
        let mut s = GridStack::new(times, lats, lons);
        s.attrs.insert("step".to_string(), "1,2,3".to_string());
        s.add_var("t_2m", Array3::from_shape_fn((3, 3, 4), |(t, r, _)| (t * 10 + r) as f32))
            .unwrap();
        s
    }

    #[test]
    fn relabels_flips_and_crops() {
        let bb = BoundingBox::new(7.5, 44.5, 9.5, 46.5, tellus_common::geo::Crs::wgs84());
        let out = postprocess(step_stack(), issue(), &[1, 2, 3], &bb).unwrap();

        assert_eq!(out.times[0], issue() + Duration::hours(1));
        assert_eq!(out.times[2], issue() + Duration::hours(3));

        // north-up and cropped to lats {46,45}, lons {8,9}
        assert_eq!(out.lats, vec![46.0, 45.0]);
        assert_eq!(out.lons, vec![8.0, 9.0]);
        // row 0 now holds the former lat-46 row (r=2)
        assert_eq!(out.vars["t_2m"][[0, 0, 0]], 2.0);

        assert!(out.attrs.get("step").is_none());
        assert!(out.attrs.get("issue_time").is_some());
    }

    #[test]
    fn step_count_mismatch_is_corrupt() {
        let bb = BoundingBox::new(7.0, 44.0, 10.0, 46.0, tellus_common::geo::Crs::wgs84());
        assert!(postprocess(step_stack(), issue(), &[1, 2], &bb).is_err());
    }
}

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

///! time-labelled 3-D data cubes as produced by reanalysis and forecast sources

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ndarray::{s, Array2, Array3, Axis};

use tellus_common::geo::{BoundingBox, Crs, GeoTransform};
use tellus_common::timestep::TimeStep;

use crate::{Grid, RasterError, Result, PRELIMINARY_ATTR};

/// NaN-propagating temporal aggregation methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggMethod {
    Mean,
    Max,
    Min,
    Sum,
}

impl AggMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AggMethod::Mean => "mean",
            AggMethod::Max => "max",
            AggMethod::Min => "min",
            AggMethod::Sum => "sum",
        }
    }
}

impl FromStr for AggMethod {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<AggMethod> {
        match s.to_lowercase().as_str() {
            "mean" | "avg" => Ok(AggMethod::Mean),
            "max" => Ok(AggMethod::Max),
            "min" => Ok(AggMethod::Min),
            "sum" => Ok(AggMethod::Sum),
            other => Err(RasterError::DecodeError(format!("unknown aggregation {}", other))),
        }
    }
}

/// a set of variables on a shared (time, lat, lon) geometry. Latitude/longitude vectors are
/// cell centers; variables with differing shapes must go into separate stacks
#[derive(Debug, Clone)]
pub struct GridStack {
    pub times: Vec<DateTime<Utc>>,
    pub lats: Vec<f64>,
    pub lons: Vec<f64>,
    pub vars: BTreeMap<String, Array3<f32>>,
    pub var_units: BTreeMap<String, String>,
    pub crs: Crs,
    pub attrs: BTreeMap<String, String>,
}

impl GridStack {
    pub fn new(times: Vec<DateTime<Utc>>, lats: Vec<f64>, lons: Vec<f64>) -> GridStack {
        GridStack {
            times,
            lats,
            lons,
            vars: BTreeMap::new(),
            var_units: BTreeMap::new(),
            crs: Crs::wgs84(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn add_var(&mut self, name: &str, data: Array3<f32>) -> Result<()> {
        let expect = (self.times.len(), self.lats.len(), self.lons.len());
        if data.dim() != expect {
            return Err(RasterError::ShapeError(format!(
                "{}: {:?} does not match cube geometry {:?}",
                name,
                data.dim(),
                expect
            )));
        }
        self.vars.insert(name.to_string(), data);
        Ok(())
    }

    pub fn set_unit(&mut self, var: &str, unit: &str) {
        self.var_units.insert(var.to_string(), unit.to_string());
    }

    pub fn mark_preliminary(&mut self) {
        self.attrs.insert(PRELIMINARY_ATTR.to_string(), "True".to_string());
    }

    /// geotransform of the (regular) lat/lon grid, north-up
    pub fn transform(&self) -> Result<GeoTransform> {
        if self.lats.len() < 2 || self.lons.len() < 2 {
            return Err(RasterError::ShapeError("degenerate cube geometry".into()));
        }
        let dx = self.lons[1] - self.lons[0];
        let dy = self.lats[1] - self.lats[0];
        Ok(GeoTransform::new(self.lons[0] - dx / 2.0, self.lats[0] - dy / 2.0, dx, dy))
    }

    /// one time slice of one variable as a standalone 2-D grid
    pub fn layer(&self, var: &str, t_idx: usize) -> Result<Grid> {
        let cube = self.vars.get(var).ok_or_else(|| {
            RasterError::ShapeError(format!("no variable {} in cube", var))
        })?;
        let data: Array2<f32> = cube.index_axis(Axis(0), t_idx).to_owned();
        let mut g = Grid::new(data, self.transform()?, self.crs.clone());
        g.attrs = self.attrs.clone();
        Ok(g)
    }

    /// indices of the time coordinates falling into the closed step interval
    pub fn time_indices(&self, ts: &TimeStep) -> Vec<usize> {
        self.times
            .iter()
            .enumerate()
            .filter(|(_, t)| **t >= ts.start() && **t <= ts.end())
            .map(|(i, _)| i)
            .collect()
    }

    /// aggregate one variable over the given time indices. Any NaN inside the window makes
    /// the output cell NaN
    pub fn reduce(&self, var: &str, idxs: &[usize], method: AggMethod) -> Result<Array2<f32>> {
        let cube = self.vars.get(var).ok_or_else(|| {
            RasterError::ShapeError(format!("no variable {} in cube", var))
        })?;
        if idxs.is_empty() {
            return Err(RasterError::ShapeError(format!("empty aggregation window for {}", var)));
        }

        let mut out = cube.index_axis(Axis(0), idxs[0]).to_owned();
        let mut n = 1.0f32;
        for &i in &idxs[1..] {
            let slice = cube.index_axis(Axis(0), i);
            ndarray::Zip::from(&mut out).and(&slice).for_each(|a, &b| {
                *a = match method {
                    AggMethod::Sum | AggMethod::Mean => *a + b,
                    AggMethod::Max => if b > *a { b } else if a.is_nan() || b.is_nan() { f32::NAN } else { *a },
                    AggMethod::Min => if b < *a { b } else if a.is_nan() || b.is_nan() { f32::NAN } else { *a },
                }
            });
            n += 1.0;
        }
        if method == AggMethod::Mean {
            out.mapv_inplace(|v| v / n);
        }
        Ok(out)
    }

    /// the first time whose slice of `var` is entirely NaN - a sign of silent server corruption
    pub fn find_all_nan_time(&self, var: &str) -> Option<DateTime<Utc>> {
        let cube = self.vars.get(var)?;
        for (i, t) in self.times.iter().enumerate() {
            if cube.index_axis(Axis(0), i).iter().all(|v| v.is_nan()) {
                return Some(*t);
            }
        }
        None
    }

    /// reorder latitude north-up (descending) if it is ascending. Orientation correctness,
    /// applied uniformly to every forecast source
    pub fn flip_lat_north_up(&mut self) {
        if self.lats.len() >= 2 && self.lats[0] < self.lats[self.lats.len() - 1] {
            self.lats.reverse();
            for cube in self.vars.values_mut() {
                cube.invert_axis(Axis(1));
            }
        }
    }

    /// elementwise fusion preferring `self`, filling NaN cells from `other` - used to merge
    /// final fields with their provisional release
    pub fn fuse_var(&mut self, var: &str, other: &GridStack) -> Result<()> {
        let b = other.vars.get(var).ok_or_else(|| {
            RasterError::ShapeError(format!("no variable {} in fallback cube", var))
        })?;
        let a = self.vars.get_mut(var).ok_or_else(|| {
            RasterError::ShapeError(format!("no variable {} in cube", var))
        })?;
        if a.dim() != b.dim() {
            return Err(RasterError::ShapeError(format!("{:?} vs {:?}", a.dim(), b.dim())));
        }
        ndarray::Zip::from(a).and(b).for_each(|x, &y| {
            if x.is_nan() {
                *x = y;
            }
        });
        Ok(())
    }

    /// crop all variables to the lat/lon window covering the box (grid-aligned, no resampling)
    pub fn crop_to_bb(&self, bb: &BoundingBox) -> Result<GridStack> {
        let (w, s_, e, n) = bb.wsen();

        let lon_idx: Vec<usize> = self
            .lons
            .iter()
            .enumerate()
            .filter(|(_, x)| **x >= w - 1e-9 && **x <= e + 1e-9)
            .map(|(i, _)| i)
            .collect();
        let lat_idx: Vec<usize> = self
            .lats
            .iter()
            .enumerate()
            .filter(|(_, y)| **y >= s_ - 1e-9 && **y <= n + 1e-9)
            .map(|(i, _)| i)
            .collect();

        if lon_idx.is_empty() || lat_idx.is_empty() {
            return Err(RasterError::CropOutside(format!("{}", bb)));
        }
        let (la0, la1) = (lat_idx[0], lat_idx[lat_idx.len() - 1] + 1);
        let (lo0, lo1) = (lon_idx[0], lon_idx[lon_idx.len() - 1] + 1);

        let mut out = GridStack::new(
            self.times.clone(),
            self.lats[la0..la1].to_vec(),
            self.lons[lo0..lo1].to_vec(),
        );
        out.crs = self.crs.clone();
        out.attrs = self.attrs.clone();
        out.var_units = self.var_units.clone();
        for (name, cube) in &self.vars {
            out.vars.insert(name.clone(), cube.slice(s![.., la0..la1, lo0..lo1]).to_owned());
        }
        Ok(out)
    }
}

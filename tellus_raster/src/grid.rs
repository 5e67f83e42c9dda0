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

use std::collections::BTreeMap;

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use tellus_common::geo::{BoundingBox, Crs, GeoTransform};

use crate::{RasterError, Result, PRELIMINARY_ATTR};

/// a 2-D raster with CRS, affine geotransform and per-variable encoding metadata.
/// Rows run north to south for the usual dy < 0 transform
#[derive(Debug, Clone)]
pub struct Grid {
    pub data: Array2<f32>,
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: Option<f32>,
    pub scale: Option<f32>,
    pub valid_range: Option<(f32, f32)>,
    pub attrs: BTreeMap<String, String>,
}

impl Grid {
    pub fn new(data: Array2<f32>, transform: GeoTransform, crs: Crs) -> Grid {
        Grid {
            data,
            transform,
            crs,
            nodata: None,
            scale: None,
            valid_range: None,
            attrs: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn set_attr(&mut self, key: &str, value: impl ToString) {
        self.attrs.insert(key.to_string(), value.to_string());
    }

    pub fn mark_preliminary(&mut self) {
        self.attrs.insert(PRELIMINARY_ATTR.to_string(), "True".to_string());
    }

    /// replace the no-data sentinel with NaN and drop the sentinel
    pub fn nodata_to_nan(&mut self) {
        if let Some(nd) = self.nodata.take() {
            self.data.mapv_inplace(|v| if v == nd { f32::NAN } else { v });
        }
    }

    /// mask values outside the valid range with NaN, then apply the scale factor.
    /// Both metadata fields are consumed - the result holds physical quantities
    pub fn apply_scale_and_range(&mut self) {
        if let Some((lo, hi)) = self.valid_range.take() {
            self.data.mapv_inplace(|v| if v < lo || v > hi { f32::NAN } else { v });
        }
        if let Some(k) = self.scale.take() {
            if k != 1.0 {
                self.data.mapv_inplace(|v| v * k);
            }
        }
    }

    /// clip to the smallest sub-grid of the original grid that still contains the box.
    /// The grid resolution never changes; the window is snapped outward to cell borders.
    /// The box must already be in the grid's CRS
    pub fn crop_to_bb(&self, bb: &BoundingBox) -> Result<Grid> {
        let (w, s_, e, n) = bb.wsen();
        let tr = &self.transform;

        let col0 = tr.col_of_x(w).floor().max(0.0) as usize;
        let col1 = tr.col_of_x(e).ceil().clamp(0.0, self.cols() as f64) as usize;
        // dy < 0: the north edge maps to the smaller row index
        let row0 = tr.row_of_y(n).floor().max(0.0) as usize;
        let row1 = tr.row_of_y(s_).ceil().clamp(0.0, self.rows() as f64) as usize;

        if col0 >= col1 || row0 >= row1 {
            return Err(RasterError::CropOutside(format!("{}", bb)));
        }

        let data = self.data.slice(s![row0..row1, col0..col1]).to_owned();
        Ok(Grid {
            data,
            transform: tr.window(row0, col0),
            crs: self.crs.clone(),
            nodata: self.nodata,
            scale: self.scale,
            valid_range: self.valid_range,
            attrs: self.attrs.clone(),
        })
    }

    /// elementwise sum of grids on the same geometry; any NaN cell makes the result cell NaN
    /// (the all-valid-or-missing composite rule)
    pub fn sum_strict(grids: &[Grid]) -> Result<Grid> {
        let first = grids.first().ok_or_else(|| RasterError::ShapeError("empty grid list".into()))?;
        let mut acc = first.clone();
        for g in &grids[1..] {
            if g.data.dim() != acc.data.dim() {
                return Err(RasterError::ShapeError(format!("{:?} vs {:?}", g.data.dim(), acc.data.dim())));
            }
            ndarray::Zip::from(&mut acc.data).and(&g.data).for_each(|a, &b| *a += b);
        }
        Ok(acc)
    }
}

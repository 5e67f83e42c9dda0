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

///! tile pasting: neighbouring grids on the same projection and resolution become one
///! virtual raster. Cells no tile covers stay NaN

use ndarray::Array2;

use tellus_raster::{Grid, RasterError};

const ALIGN_EPS: f64 = 1e-6;

pub fn mosaic(tiles: &[Grid]) -> Result<Grid, RasterError> {
    let first = tiles
        .first()
        .ok_or_else(|| RasterError::ShapeError("no tiles to mosaic".into()))?;
    let (dx, dy) = (first.transform.dx, first.transform.dy);

    let mut west = f64::INFINITY;
    let mut north = f64::NEG_INFINITY;
    let mut east = f64::NEG_INFINITY;
    let mut south = f64::INFINITY;
    for t in tiles {
        if (t.transform.dx - dx).abs() > ALIGN_EPS || (t.transform.dy - dy).abs() > ALIGN_EPS {
            return Err(RasterError::ShapeError(format!(
                "tile resolution {}x{} does not match {}x{}",
                t.transform.dx, t.transform.dy, dx, dy
            )));
        }
        if t.crs != first.crs {
            return Err(RasterError::ShapeError("tiles in different projections".into()));
        }
        let (w, s, e, n) = t.transform.extent(t.rows(), t.cols());
        west = west.min(w);
        south = south.min(s);
        east = east.max(e);
        north = north.max(n);
    }

    let cols = ((east - west) / dx.abs()).round() as usize;
    let rows = ((north - south) / dy.abs()).round() as usize;
    let mut data = Array2::from_elem((rows, cols), f32::NAN);

    for t in tiles {
        let col0 = ((t.transform.x0 - west) / dx.abs()).round() as usize;
        let row0 = ((north - t.transform.y0) / dy.abs()).round() as usize;
        for r in 0..t.rows() {
            for c in 0..t.cols() {
                let v = t.data[[r, c]];
                if !v.is_nan() {
                    data[[row0 + r, col0 + c]] = v;
                }
            }
        }
    }

    let mut out = Grid::new(
        data,
        tellus_common::geo::GeoTransform::new(west, north, dx.abs(), -dy.abs()),
        first.crs.clone(),
    );
    out.attrs = first.attrs.clone();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tellus_common::geo::{Crs, GeoTransform};

    fn tile(x0: f64, fill: f32) -> Grid {
        Grid::new(
            Array2::from_elem((4, 4), fill),
            GeoTransform::new(x0, 40.0, 1.0, -1.0),
            Crs::sinusoidal(),
        )
    }

    #[test]
    fn adjacent_tiles_paste_side_by_side() {
        let m = mosaic(&[tile(0.0, 1.0), tile(4.0, 2.0)]).unwrap();
        assert_eq!(m.data.dim(), (4, 8));
        assert_eq!(m.data[[0, 0]], 1.0);
        assert_eq!(m.data[[0, 7]], 2.0);
        assert_eq!(m.transform.x0, 0.0);
        assert_eq!(m.transform.y0, 40.0);
    }

    #[test]
    fn gap_between_tiles_stays_nan() {
        let m = mosaic(&[tile(0.0, 1.0), tile(8.0, 2.0)]).unwrap();
        assert_eq!(m.data.dim(), (4, 12));
        assert!(m.data[[0, 5]].is_nan());
    }

    #[test]
    fn mismatched_resolution_is_refused() {
        let mut odd = tile(4.0, 2.0);
        odd.transform.dx = 0.5;
        assert!(mosaic(&[tile(0.0, 1.0), odd]).is_err());
    }
}

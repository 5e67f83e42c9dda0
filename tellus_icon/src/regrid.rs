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

///! nearest-neighbour remapping from the icosahedral model grid to a regular lat/lon grid.
///! The conversion table is published next to the model output and is fetched once per
///! session: a header line describing the target grid, then one source index per target cell

use std::path::Path;

use ndarray::Array2;

use tellus_download::{corrupt_payload, Result};

#[derive(Debug, Clone)]
pub struct RegridTable {
    pub lats: Vec<f64>,
    pub lons: Vec<f64>,
    /// row-major nearest source index per target cell
    indices: Vec<usize>,
}

impl RegridTable {
    /// header: `lat0 dlat nlat lon0 dlon nlon`, then whitespace-separated source indices
    pub fn parse(path: &Path) -> Result<RegridTable> {
        let text = std::fs::read_to_string(path)?;
        let mut tokens = text.split_whitespace().filter(|t| !t.starts_with('#'));

        let mut next_f64 = |what: &str| -> Result<f64> {
            tokens
                .next()
                .and_then(|t| t.parse::<f64>().ok())
                .ok_or_else(|| corrupt_payload(format!("regrid table: bad {}", what)))
        };
        let lat0 = next_f64("lat0")?;
        let dlat = next_f64("dlat")?;
        let nlat = next_f64("nlat")? as usize;
        let lon0 = next_f64("lon0")?;
        let dlon = next_f64("dlon")?;
        let nlon = next_f64("nlon")? as usize;

        let indices: Vec<usize> = tokens
            .map(|t| {
                t.parse::<usize>()
                    .map_err(|_| corrupt_payload(format!("regrid table: bad index {}", t)))
            })
            .collect::<Result<Vec<usize>>>()?;
        if indices.len() != nlat * nlon {
            return Err(corrupt_payload(format!(
                "regrid table: {} indices for a {}x{} grid",
                indices.len(), nlat, nlon
            )));
        }

        let lats = (0..nlat).map(|i| lat0 + dlat * i as f64).collect();
        let lons = (0..nlon).map(|j| lon0 + dlon * j as f64).collect();
        Ok(RegridTable { lats, lons, indices })
    }

    /// map flat icosahedral cell values onto the target grid
    pub fn apply(&self, src: &[f32]) -> Result<Array2<f32>> {
        let (rows, cols) = (self.lats.len(), self.lons.len());
        let mut out = Array2::from_elem((rows, cols), f32::NAN);
        for (cell, &i) in out.iter_mut().zip(&self.indices) {
            *cell = *src.get(i).ok_or_else(|| {
                corrupt_payload(format!("regrid table points past the {} source cells", src.len()))
            })?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_table(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let p = dir.path().join("icon_grid.txt");
        // 2x3 target grid mapping straight through the first six source cells, shuffled
        std::fs::write(&p, "47.0 -1.0 2 8.0 1.0 3\n0 2 4 1 3 5\n").unwrap();
        p
    }

    #[test]
    fn parse_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let table = RegridTable::parse(&write_table(&dir)).unwrap();
        assert_eq!(table.lats, vec![47.0, 46.0]);
        assert_eq!(table.lons, vec![8.0, 9.0, 10.0]);

        let out = table.apply(&[10.0, 11.0, 12.0, 13.0, 14.0, 15.0]).unwrap();
        assert_eq!(out[[0, 0]], 10.0);
        assert_eq!(out[[0, 1]], 12.0);
        assert_eq!(out[[1, 2]], 15.0);
    }

    #[test]
    fn short_source_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let table = RegridTable::parse(&write_table(&dir)).unwrap();
        assert!(table.apply(&[1.0, 2.0]).is_err());

        std::fs::write(dir.path().join("bad.txt"), "47.0 -1.0 2 8.0 1.0 3\n0 1\n").unwrap();
        assert!(RegridTable::parse(&dir.path().join("bad.txt")).is_err());
    }
}

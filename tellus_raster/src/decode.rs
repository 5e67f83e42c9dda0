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

///! the narrow seam towards binary-scientific format decoders. GRIB/HDF5 parsing is a
///! collaborator concern - sources take a decoder and tests inject synthetic ones

use std::path::Path;

use crate::geotiff::read_geotiff;
use crate::{Grid, GridStack, RasterError, Result};

pub trait RasterDecoder: Send + Sync {
    /// read a single 2-D raster
    fn decode_grid(&self, path: &Path) -> Result<Grid> {
        Err(RasterError::Unsupported(format!("{:?}", path)))
    }

    /// read a multi-variable, time-labelled cube (GRIB and friends)
    fn decode_stack(&self, path: &Path) -> Result<GridStack> {
        Err(RasterError::Unsupported(format!("{:?}", path)))
    }

    /// read one layer of a container format, addressed by sub-dataset index
    fn decode_layer(&self, path: &Path, index: usize) -> Result<Grid> {
        if index == 0 {
            self.decode_grid(path)
        } else {
            Err(RasterError::Unsupported(format!("{:?}[{}]", path, index)))
        }
    }
}

/// decoder for the formats we read natively
#[derive(Debug, Default, Clone)]
pub struct GeoTiffDecoder;

impl RasterDecoder for GeoTiffDecoder {
    fn decode_grid(&self, path: &Path) -> Result<Grid> {
        read_geotiff(path)
    }
}

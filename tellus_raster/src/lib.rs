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
#![allow(unused)]

///! the common in-memory representation downloaded payloads are reshaped into, and the
///! pure-Rust codecs that read and write it

use thiserror::Error;

pub mod grid;
pub mod stack;
pub mod table;
pub mod geotiff;
pub mod netcdf;
pub mod decode;

pub use decode::RasterDecoder;
pub use grid::Grid;
pub use stack::{AggMethod, GridStack};
pub use table::StationTable;

pub type Result<T> = std::result::Result<T, RasterError>;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("tiff error: {0}")]
    TiffError(#[from] tiff::TiffError),

    #[error("csv error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("cannot decode {0}")]
    DecodeError(String),

    #[error("format not supported by this decoder: {0}")]
    Unsupported(String),

    #[error("bounding box does not intersect the grid: {0}")]
    CropOutside(String),

    #[error("shape mismatch: {0}")]
    ShapeError(String),

    #[error("cannot encode {0}")]
    EncodeError(String),
}

/// attribute key marking payloads that came from a provisional release
pub const PRELIMINARY_ATTR: &str = "PRELIMINARY";

/// one downloadable data piece in its raw shape - the sink dispatches on the variant,
/// never on the producing source
#[derive(Debug, Clone)]
pub enum Payload {
    Grid(Grid),
    Stack(GridStack),
    Table(StationTable),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Grid(_) => "grid",
            Payload::Stack(_) => "stack",
            Payload::Table(_) => "table",
        }
    }

    pub fn is_preliminary(&self) -> bool {
        match self {
            Payload::Grid(g) => g.attrs.get(PRELIMINARY_ATTR).map(|v| v == "True").unwrap_or(false),
            Payload::Stack(s) => s.attrs.get(PRELIMINARY_ATTR).map(|v| v == "True").unwrap_or(false),
            Payload::Table(_) => false,
        }
    }
}

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

///! GeoTIFF read/write on top of the pure-Rust tiff crate. We only handle single-band
///! rasters with the GeoKey subset our data servers actually emit - this is not a general
///! GeoTIFF library

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use tellus_common::geo::{Crs, GeoTransform};

use crate::{Grid, RasterError, Result};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GEO_ASCII_PARAMS: u16 = 34737;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_CITATION: u16 = 1026;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_TYPE: u16 = 3072;

const MODEL_PROJECTED: u16 = 1;
const MODEL_GEOGRAPHIC: u16 = 2;
const MODEL_USER_DEFINED: u16 = 32767;

/* #region write *************************************************************************************/

pub fn write_geotiff(grid: &Grid, path: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut tiff = TiffEncoder::new(file)?;
    let mut image =
        tiff.new_image::<colortype::Gray32Float>(grid.cols() as u32, grid.rows() as u32)?;

    let tr = &grid.transform;
    let scale = [tr.dx, tr.dy.abs(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, tr.x0, tr.y0, 0.0];

    let enc = image.encoder();
    enc.write_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
    enc.write_tag(Tag::Unknown(TAG_MODEL_TIEPOINT), &tiepoint[..])?;

    let (keys, ascii) = geokeys_for(&grid.crs);
    enc.write_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY), &keys[..])?;
    if let Some(text) = &ascii {
        enc.write_tag(Tag::Unknown(TAG_GEO_ASCII_PARAMS), text.as_str())?;
    }
    if let Some(nd) = grid.nodata {
        enc.write_tag(Tag::Unknown(TAG_GDAL_NODATA), format!("{}", nd).as_str())?;
    }

    let data: Vec<f32> = grid.data.iter().copied().collect();
    image.write_data(&data)?;
    Ok(())
}

fn geokeys_for(crs: &Crs) -> (Vec<u16>, Option<String>) {
    match crs.epsg() {
        Some(code) if crs.is_geographic() => (
            vec![
                1, 1, 0, 3,
                KEY_MODEL_TYPE, 0, 1, MODEL_GEOGRAPHIC,
                KEY_RASTER_TYPE, 0, 1, 1,
                KEY_GEOGRAPHIC_TYPE, 0, 1, code as u16,
            ],
            None,
        ),
        Some(code) => (
            vec![
                1, 1, 0, 3,
                KEY_MODEL_TYPE, 0, 1, MODEL_PROJECTED,
                KEY_RASTER_TYPE, 0, 1, 1,
                KEY_PROJECTED_TYPE, 0, 1, code as u16,
            ],
            None,
        ),
        None => {
            // opaque WKT goes into the citation text
            let wkt = match crs {
                Crs::Wkt(w) => w.clone(),
                Crs::Epsg(_) => unreachable!(),
            };
            let keys = vec![
                1, 1, 0, 3,
                KEY_MODEL_TYPE, 0, 1, MODEL_USER_DEFINED,
                KEY_RASTER_TYPE, 0, 1, 1,
                KEY_CITATION, TAG_GEO_ASCII_PARAMS, wkt.len() as u16 + 1, 0,
            ];
            (keys, Some(wkt))
        }
    }
}

/* #endregion write */

/* #region read **************************************************************************************/

pub fn read_geotiff(path: &Path) -> Result<Grid> {
    let file = BufReader::new(File::open(path)?);
    let mut decoder = Decoder::new(file)?;

    let (cols, rows) = decoder.dimensions()?;
    let data = decode_band(decoder.read_image()?, rows as usize, cols as usize)?;

    let pixel_scale = decoder
        .find_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE))?
        .map(|v| v.into_f64_vec())
        .transpose()?;
    let tiepoint = decoder
        .find_tag(Tag::Unknown(TAG_MODEL_TIEPOINT))?
        .map(|v| v.into_f64_vec())
        .transpose()?;

    let transform = match (pixel_scale, tiepoint) {
        (Some(sc), Some(tp)) if sc.len() >= 2 && tp.len() >= 5 => {
            // tiepoint maps raster (j,i) to model (x,y); dy is negative north-up
            GeoTransform::new(tp[3] - tp[0] * sc[0], tp[4] + tp[1] * sc[1], sc[0], -sc[1])
        }
        _ => return Err(RasterError::DecodeError(format!("{:?} has no geotransform", path))),
    };

    let crs = read_crs(&mut decoder)?;

    let nodata = decoder
        .find_tag(Tag::Unknown(TAG_GDAL_NODATA))?
        .and_then(|v| v.into_string().ok())
        .and_then(|s| s.trim_end_matches('\0').trim().parse::<f32>().ok());

    let mut grid = Grid::new(data, transform, crs);
    grid.nodata = nodata;
    Ok(grid)
}

fn read_crs(decoder: &mut Decoder<BufReader<File>>) -> Result<Crs> {
    let keys = match decoder.find_tag(Tag::Unknown(TAG_GEO_KEY_DIRECTORY))? {
        Some(v) => v.into_u64_vec()?,
        None => return Ok(Crs::wgs84()),
    };

    let mut model_type = 0u64;
    for chunk in keys[4..].chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let (key, value) = (chunk[0], chunk[3]);
        match key as u16 {
            KEY_MODEL_TYPE => model_type = value,
            KEY_GEOGRAPHIC_TYPE if model_type != MODEL_PROJECTED as u64 => {
                return Ok(Crs::Epsg(value as u32));
            }
            KEY_PROJECTED_TYPE => return Ok(Crs::Epsg(value as u32)),
            _ => {}
        }
    }

    if model_type == MODEL_USER_DEFINED as u64 {
        if let Some(v) = decoder.find_tag(Tag::Unknown(TAG_GEO_ASCII_PARAMS))? {
            if let Ok(s) = v.into_string() {
                return Ok(Crs::Wkt(s.trim_end_matches('\0').to_string()));
            }
        }
    }
    Ok(Crs::wgs84())
}

fn decode_band(result: DecodingResult, rows: usize, cols: usize) -> Result<Array2<f32>> {
    let vec: Vec<f32> = match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        other => {
            return Err(RasterError::DecodeError(format!("unsupported sample format {:?}", sample_name(&other))));
        }
    };

    Array2::from_shape_vec((rows, cols), vec)
        .map_err(|e| RasterError::DecodeError(format!("band shape: {}", e)))
}

fn sample_name(r: &DecodingResult) -> &'static str {
    match r {
        DecodingResult::U64(_) => "u64",
        DecodingResult::I64(_) => "i64",
        _ => "?",
    }
}

/* #endregion read */

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn grid() -> Grid {
        let data = Array2::from_shape_fn((5, 6), |(r, c)| (r * 6 + c) as f32 * 0.5);
        let mut g = Grid::new(data, GeoTransform::new(6.0, 48.0, 0.25, -0.25), Crs::wgs84());
        g.nodata = Some(-9999.0);
        g
    }

    #[test]
    fn roundtrip_preserves_geometry_and_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.tif");
        let g = grid();
        write_geotiff(&g, &path).unwrap();

        let r = read_geotiff(&path).unwrap();
        assert_eq!(r.data, g.data);
        assert_eq!(r.transform, g.transform);
        assert_eq!(r.crs, Crs::Epsg(4326));
        assert_eq!(r.nodata, Some(-9999.0));
    }

    #[test]
    fn roundtrip_wkt_crs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sin.tif");
        let mut g = grid();
        g.crs = Crs::sinusoidal();
        write_geotiff(&g, &path).unwrap();

        let r = read_geotiff(&path).unwrap();
        match r.crs {
            Crs::Wkt(w) => assert!(w.contains("Sinusoidal")),
            other => panic!("expected WKT crs, got {other}"),
        }
    }

    #[test]
    fn write_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.tif");
        let p2 = dir.path().join("b.tif");
        let g = grid();
        write_geotiff(&g, &p1).unwrap();
        write_geotiff(&g, &p2).unwrap();
        assert_eq!(std::fs::read(&p1).unwrap(), std::fs::read(&p2).unwrap());
    }
}

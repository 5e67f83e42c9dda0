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

///! minimal NetCDF-3 classic encoder for time-labelled cubes. We only ever write fixed-size
///! (time,lat,lon) float variables plus their coordinate vectors, which keeps the format
///! small enough to emit directly instead of binding a C library

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::{GridStack, RasterError, Result};

const NC_CHAR: u32 = 2;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

const TAG_DIMENSION: u32 = 0x0A;
const TAG_VARIABLE: u32 = 0x0B;
const TAG_ATTRIBUTE: u32 = 0x0C;

struct Attr {
    name: String,
    // NC_CHAR text or NC_FLOAT scalars - all we ever need
    text: Option<String>,
    floats: Option<Vec<f32>>,
}

impl Attr {
    fn text(name: &str, value: &str) -> Attr {
        Attr { name: name.to_string(), text: Some(value.to_string()), floats: None }
    }
    fn float(name: &str, value: f32) -> Attr {
        Attr { name: name.to_string(), text: None, floats: Some(vec![value]) }
    }
}

struct Var {
    name: String,
    dimids: Vec<u32>,
    nc_type: u32,
    attrs: Vec<Attr>,
    /// raw big-endian payload bytes, padded to 4
    data: Vec<u8>,
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    pad4(buf);
}

fn put_attrs(buf: &mut Vec<u8>, attrs: &[Attr]) {
    if attrs.is_empty() {
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        return;
    }
    buf.extend_from_slice(&TAG_ATTRIBUTE.to_be_bytes());
    buf.extend_from_slice(&(attrs.len() as u32).to_be_bytes());
    for a in attrs {
        put_name(buf, &a.name);
        if let Some(text) = &a.text {
            buf.extend_from_slice(&NC_CHAR.to_be_bytes());
            buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
            buf.extend_from_slice(text.as_bytes());
            pad4(buf);
        } else if let Some(vals) = &a.floats {
            buf.extend_from_slice(&NC_FLOAT.to_be_bytes());
            buf.extend_from_slice(&(vals.len() as u32).to_be_bytes());
            for v in vals {
                buf.extend_from_slice(&v.to_be_bytes());
            }
            pad4(buf);
        }
    }
}

fn f64_bytes(vals: &[f64]) -> Vec<u8> {
    let mut b = Vec::with_capacity(vals.len() * 8);
    for v in vals {
        b.extend_from_slice(&v.to_be_bytes());
    }
    b
}

fn f32_bytes<'a>(vals: impl Iterator<Item = &'a f32>, n: usize) -> Vec<u8> {
    let mut b = Vec::with_capacity(n * 4);
    for v in vals {
        b.extend_from_slice(&v.to_be_bytes());
    }
    pad4(&mut b);
    b
}

/// serialize the header given the data begin offset of each variable
fn header(dims: &[(String, u32)], gatts: &[Attr], vars: &[Var], begins: &[u32]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"CDF\x01");
    buf.extend_from_slice(&0u32.to_be_bytes()); // numrecs - we write no record variables

    buf.extend_from_slice(&TAG_DIMENSION.to_be_bytes());
    buf.extend_from_slice(&(dims.len() as u32).to_be_bytes());
    for (name, len) in dims {
        put_name(&mut buf, name);
        buf.extend_from_slice(&len.to_be_bytes());
    }

    put_attrs(&mut buf, gatts);

    buf.extend_from_slice(&TAG_VARIABLE.to_be_bytes());
    buf.extend_from_slice(&(vars.len() as u32).to_be_bytes());
    for (i, v) in vars.iter().enumerate() {
        put_name(&mut buf, &v.name);
        buf.extend_from_slice(&(v.dimids.len() as u32).to_be_bytes());
        for d in &v.dimids {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        put_attrs(&mut buf, &v.attrs);
        buf.extend_from_slice(&v.nc_type.to_be_bytes());
        buf.extend_from_slice(&(v.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&begins[i].to_be_bytes());
    }
    buf
}

/// write a GridStack as a NetCDF-3 classic file with (time, lat, lon) float variables
pub fn write_netcdf(stack: &GridStack, path: &Path) -> Result<()> {
    let nt = stack.times.len();
    let nlat = stack.lats.len();
    let nlon = stack.lons.len();
    if nt == 0 || nlat == 0 || nlon == 0 {
        return Err(RasterError::EncodeError(format!("empty cube for {:?}", path)));
    }

    let dims = vec![
        ("time".to_string(), nt as u32),
        ("lat".to_string(), nlat as u32),
        ("lon".to_string(), nlon as u32),
    ];

    let mut gatts: Vec<Attr> = Vec::new();
    for (k, v) in &stack.attrs {
        gatts.push(Attr::text(k, v));
    }

    let mut vars: Vec<Var> = Vec::new();

    let epoch_secs: Vec<f64> = stack.times.iter().map(|t| t.timestamp() as f64).collect();
    vars.push(Var {
        name: "time".to_string(),
        dimids: vec![0],
        nc_type: NC_DOUBLE,
        attrs: vec![Attr::text("units", "seconds since 1970-01-01 00:00:00")],
        data: f64_bytes(&epoch_secs),
    });
    vars.push(Var {
        name: "lat".to_string(),
        dimids: vec![1],
        nc_type: NC_DOUBLE,
        attrs: vec![Attr::text("units", "degrees_north")],
        data: f64_bytes(&stack.lats),
    });
    vars.push(Var {
        name: "lon".to_string(),
        dimids: vec![2],
        nc_type: NC_DOUBLE,
        attrs: vec![Attr::text("units", "degrees_east")],
        data: f64_bytes(&stack.lons),
    });

    for (name, cube) in &stack.vars {
        let mut attrs = vec![Attr::float("_FillValue", f32::NAN)];
        if let Some(unit) = stack.var_units.get(name) {
            attrs.push(Attr::text("units", unit));
        }
        vars.push(Var {
            name: name.clone(),
            dimids: vec![0, 1, 2],
            nc_type: NC_FLOAT,
            attrs,
            data: f32_bytes(cube.iter(), cube.len()),
        });
    }

    // begin offsets depend on the header length, which is invariant under the offset values
    let probe = header(&dims, &gatts, &vars, &vec![0; vars.len()]);
    let mut begins = Vec::with_capacity(vars.len());
    let mut offset = probe.len() as u32;
    for v in &vars {
        begins.push(offset);
        offset += v.data.len() as u32;
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&header(&dims, &gatts, &vars, &begins))?;
    for v in &vars {
        out.write_all(&v.data)?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array3;

    fn stack() -> GridStack {
        let times = (0..3)
            .map(|h| chrono::Utc.with_ymd_and_hms(2024, 2, 1, h, 0, 0).unwrap())
            .collect();
        let mut s = GridStack::new(times, vec![46.0, 45.0], vec![8.0, 9.0, 10.0]);
        s.add_var("t_2m", Array3::from_shape_fn((3, 2, 3), |(t, r, c)| (t + r + c) as f32)).unwrap();
        s.set_unit("t_2m", "degC");
        s
    }

    #[test]
    fn writes_classic_magic_and_all_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.nc");
        write_netcdf(&stack(), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"CDF\x01");
        // data section: 3 doubles + 2 doubles + 3 doubles + 18 floats
        let data_len = 3 * 8 + 2 * 8 + 3 * 8 + 18 * 4;
        assert!(bytes.len() > data_len);
        // last value of the cube sits at the end of the file
        let tail = &bytes[bytes.len() - 4..];
        assert_eq!(f32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]), 5.0);
    }

    #[test]
    fn empty_cube_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let s = GridStack::new(vec![], vec![], vec![]);
        assert!(write_netcdf(&s, &dir.path().join("x.nc")).is_err());
    }

    #[test]
    fn write_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.nc");
        let p2 = dir.path().join("b.nc");
        write_netcdf(&stack(), &p1).unwrap();
        write_netcdf(&stack(), &p2).unwrap();
        assert_eq!(std::fs::read(&p1).unwrap(), std::fs::read(&p2).unwrap());
    }
}

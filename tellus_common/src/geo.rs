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

///! bounding boxes with coordinate reference systems, and the corner transforms between the
///! CRS families our data servers use (geographic, web mercator, UTM, MODIS/VIIRS sinusoidal)

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{atan, atan2, atanh, cos, cosh, deg, rad, sin, sinh, sqrt, tan};

pub type Result<T> = std::result::Result<T, GeoError>;

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("cannot parse CRS {0}")]
    ParseError(String),

    #[error("unsupported CRS transform {0} -> {1}")]
    UnsupportedTransform(String, String),

    #[error("coordinate outside projection domain: {0}")]
    OutOfDomain(String),
}

/// WKT of the sinusoidal projection of the MODIS/VIIRS tile grid (no EPSG code exists;
/// the conventional ESRI authority code is 53008)
pub const SINUSOIDAL_WKT: &str = "PROJCS[\"Sinusoidal\",GEOGCS[\"GCS_Undefined\",DATUM[\"Undefined\",\
SPHEROID[\"User_Defined_Spheroid\",6371007.181,0.0]],PRIMEM[\"Greenwich\",0.0],\
UNIT[\"Degree\",0.0174532925199433]],PROJECTION[\"Sinusoidal\"],PARAMETER[\"False_Easting\",0.0],\
PARAMETER[\"False_Northing\",0.0],PARAMETER[\"Central_Meridian\",0.0],UNIT[\"Meter\",1.0]]";

const SINUSOIDAL_R: f64 = 6371007.181;
const WEB_MERCATOR_R: f64 = 6378137.0;

/* #region Crs ***************************************************************************************/

/// a coordinate reference system carried either as an EPSG code or as opaque WKT.
/// Only the families listed in `ProjKind` can be transformed in-crate - everything else is
/// carried through writes untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Crs {
    Epsg(u32),
    Wkt(String),
}

/// the projection families we can actually compute
#[derive(Debug, Clone, Copy, PartialEq)]
enum ProjKind {
    Geographic,
    WebMercator,
    Utm { zone: u32, north: bool },
    Sinusoidal,
    Opaque,
}

impl Crs {
    pub fn wgs84() -> Crs {
        Crs::Epsg(4326)
    }

    pub fn sinusoidal() -> Crs {
        Crs::Wkt(SINUSOIDAL_WKT.to_string())
    }

    /// accepts "EPSG:4326", "epsg:4326", a bare code, or WKT text
    pub fn parse(s: &str) -> Result<Crs> {
        let t = s.trim();
        if let Some(code) = t.strip_prefix("EPSG:").or_else(|| t.strip_prefix("epsg:")) {
            return code
                .parse::<u32>()
                .map(Crs::Epsg)
                .map_err(|_| GeoError::ParseError(s.to_string()));
        }
        if let Ok(code) = t.parse::<u32>() {
            return Ok(Crs::Epsg(code));
        }
        if t.contains('[') {
            return Ok(Crs::Wkt(t.to_string()));
        }
        Err(GeoError::ParseError(s.to_string()))
    }

    pub fn epsg(&self) -> Option<u32> {
        match self {
            Crs::Epsg(c) => Some(*c),
            Crs::Wkt(_) => None,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self.kind(), ProjKind::Geographic)
    }

    fn kind(&self) -> ProjKind {
        match self {
            Crs::Epsg(4326) | Crs::Epsg(4258) => ProjKind::Geographic,
            Crs::Epsg(3857) => ProjKind::WebMercator,
            Crs::Epsg(53008) => ProjKind::Sinusoidal,
            Crs::Epsg(c) if (32601..=32660).contains(c) => {
                ProjKind::Utm { zone: c - 32600, north: true }
            }
            Crs::Epsg(c) if (32701..=32760).contains(c) => {
                ProjKind::Utm { zone: c - 32700, north: false }
            }
            Crs::Epsg(_) => ProjKind::Opaque,
            Crs::Wkt(w) => {
                if w.contains("Sinusoidal") {
                    ProjKind::Sinusoidal
                } else if w.contains("GEOGCS") && !w.contains("PROJCS") {
                    ProjKind::Geographic
                } else {
                    ProjKind::Opaque
                }
            }
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(c) => write!(f, "EPSG:{}", c),
            Crs::Wkt(w) => write!(f, "WKT({}..)", &w[..w.len().min(24)]),
        }
    }
}

/* #endregion Crs */

/* #region projection math ***************************************************************************/

/// project a CRS coordinate to geographic lon/lat degrees
fn to_wgs84(kind: ProjKind, x: f64, y: f64) -> Result<(f64, f64)> {
    match kind {
        ProjKind::Geographic => Ok((x, y)),
        ProjKind::WebMercator => {
            let lon = deg(x / WEB_MERCATOR_R);
            let lat = deg(2.0 * atan((y / WEB_MERCATOR_R).exp()) - std::f64::consts::FRAC_PI_2);
            Ok((lon, lat))
        }
        ProjKind::Sinusoidal => {
            let lat = y / SINUSOIDAL_R;
            let c = cos(lat);
            if c.abs() < 1e-12 {
                return Err(GeoError::OutOfDomain(format!("y={}", y)));
            }
            Ok((deg(x / (SINUSOIDAL_R * c)), deg(lat)))
        }
        ProjKind::Utm { zone, north } => Ok(utm_to_geo(x, y, zone, north)),
        ProjKind::Opaque => Err(GeoError::UnsupportedTransform("?".into(), "EPSG:4326".into())),
    }
}

/// project geographic lon/lat degrees into a CRS coordinate
fn from_wgs84(kind: ProjKind, lon: f64, lat: f64) -> Result<(f64, f64)> {
    match kind {
        ProjKind::Geographic => Ok((lon, lat)),
        ProjKind::WebMercator => {
            if lat.abs() >= 89.9999 {
                return Err(GeoError::OutOfDomain(format!("lat={}", lat)));
            }
            let x = WEB_MERCATOR_R * rad(lon);
            let y = WEB_MERCATOR_R * tan(std::f64::consts::FRAC_PI_4 + rad(lat) / 2.0).ln();
            Ok((x, y))
        }
        ProjKind::Sinusoidal => {
            let phi = rad(lat);
            Ok((SINUSOIDAL_R * rad(lon) * cos(phi), SINUSOIDAL_R * phi))
        }
        ProjKind::Utm { zone, north } => geo_to_utm(lon, lat, zone, north),
        ProjKind::Opaque => Err(GeoError::UnsupportedTransform("EPSG:4326".into(), "?".into())),
    }
}

// Krueger series for the transverse mercator - constants precomputed for WGS84 in meters
// n  = f / (2 - f) = 0.0016792203863837047
const UTM_A: f64 = 6367449.145823416; // (a / (1+n)) * (1 + n2/4 + n4/64)
const UTM_D: f64 = 6364902.166165087; // k0 * A
const UTM_C: f64 = 0.08181919084262149; // 2 sqrt(n) / (1+n)
const UTM_E0: f64 = 500000.0;
const A1: f64 = 8.377318188192541e-4; // n/2 - (2/3)n2 + (5/16)n3
const A2: f64 = 7.608496958699166e-7; // (13/48)n2 - (3/5)n3
const A3: f64 = 1.2034877875966646e-9; // (61/240)n3
const B1: f64 = 8.377321640579486e-4; // n/2 - (2/3)n2 + (37/96)n3
const B2: f64 = 5.905870152220365e-8; // (1/48)n2 + (1/15)n3
const B3: f64 = 1.6734826652839486e-10; // (17/480)n3
const D1: f64 = 3.3565514856244890e-3; // 2n - (2/3)n2 - 2n3
const D2: f64 = 6.5718731980200087e-6; // (7/3)n2 - (8/5)n3
const D3: f64 = 1.7646404372866207e-8; // (56/15)n3

fn geo_to_utm(lon: f64, lat: f64, zone: u32, north: bool) -> Result<(f64, f64)> {
    if !(-80.0..=84.0).contains(&lat) {
        return Err(GeoError::OutOfDomain(format!("lat={}", lat)));
    }
    let lam0 = rad(-180.0 + (zone as f64) * 6.0 - 3.0);
    let phi = rad(lat);
    let dlam = rad(lon) - lam0;

    let sin_phi = sin(phi);
    let t = sinh(atanh(sin_phi) - UTM_C * atanh(UTM_C * sin_phi));
    let xi = atan2(t, cos(dlam));
    let eta = atanh(sin(dlam) / sqrt(1.0 + t * t));

    let e = UTM_E0
        + UTM_D
            * (eta
                + A1 * cos(2.0 * xi) * sinh(2.0 * eta)
                + A2 * cos(4.0 * xi) * sinh(4.0 * eta)
                + A3 * cos(6.0 * xi) * sinh(6.0 * eta));
    let n0 = if north { 0.0 } else { 10_000_000.0 };
    let n = n0
        + UTM_D
            * (xi
                + A1 * sin(2.0 * xi) * cosh(2.0 * eta)
                + A2 * sin(4.0 * xi) * cosh(4.0 * eta)
                + A3 * sin(6.0 * xi) * cosh(6.0 * eta));

    Ok((e, n))
}

fn utm_to_geo(easting: f64, northing: f64, zone: u32, north: bool) -> (f64, f64) {
    let n0 = if north { 0.0 } else { 10_000_000.0 };
    let xi = (northing - n0) / UTM_D;
    let eta = (easting - UTM_E0) / UTM_D;

    let xi_p = xi
        - B1 * sin(2.0 * xi) * cosh(2.0 * eta)
        - B2 * sin(4.0 * xi) * cosh(4.0 * eta)
        - B3 * sin(6.0 * xi) * cosh(6.0 * eta);
    let eta_p = eta
        - B1 * cos(2.0 * xi) * sinh(2.0 * eta)
        - B2 * cos(4.0 * xi) * sinh(4.0 * eta)
        - B3 * cos(6.0 * xi) * sinh(6.0 * eta);

    let chi = (sin(xi_p) / cosh(eta_p)).asin();
    let phi = chi + D1 * sin(2.0 * chi) + D2 * sin(4.0 * chi) + D3 * sin(6.0 * chi);

    let lam0 = rad(-180.0 + (zone as f64) * 6.0 - 3.0);
    let lam = lam0 + atan2(sinh(eta_p), cos(xi_p));

    (deg(lam), deg(phi))
}

/* #endregion projection math */

/* #region GeoTransform ******************************************************************************/

/// affine north-up geotransform of a regular grid: x = x0 + col*dx, y = y0 + row*dy
/// with dy < 0 for the usual north-up row order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
}

impl GeoTransform {
    pub fn new(x0: f64, y0: f64, dx: f64, dy: f64) -> Self {
        GeoTransform { x0, y0, dx, dy }
    }

    #[inline]
    pub fn x_of_col(&self, col: usize) -> f64 {
        self.x0 + col as f64 * self.dx
    }

    #[inline]
    pub fn y_of_row(&self, row: usize) -> f64 {
        self.y0 + row as f64 * self.dy
    }

    #[inline]
    pub fn col_of_x(&self, x: f64) -> f64 {
        (x - self.x0) / self.dx
    }

    #[inline]
    pub fn row_of_y(&self, y: f64) -> f64 {
        (y - self.y0) / self.dy
    }

    /// (west, south, east, north) extent of a rows x cols grid
    pub fn extent(&self, rows: usize, cols: usize) -> (f64, f64, f64, f64) {
        let x1 = self.x0 + cols as f64 * self.dx;
        let y1 = self.y0 + rows as f64 * self.dy;
        (self.x0.min(x1), self.y0.min(y1), self.x0.max(x1), self.y0.max(y1))
    }

    /// the transform of the sub-window starting at (row0, col0)
    pub fn window(&self, row0: usize, col0: usize) -> GeoTransform {
        GeoTransform {
            x0: self.x_of_col(col0),
            y0: self.y_of_row(row0),
            dx: self.dx,
            dy: self.dy,
        }
    }
}

/* #endregion GeoTransform */

/* #region BoundingBox *******************************************************************************/

/// geometry cached when a bounding box is built from a reference raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeom {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

/// an axis-aligned (W,S,E,N) box in some CRS, optionally enlarged by a cell buffer when
/// derived from a reference grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub crs: Crs,
    grid: Option<GridGeom>,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64, crs: Crs) -> Self {
        BoundingBox {
            west: west.min(east),
            south: south.min(north),
            east: west.max(east),
            north: south.max(north),
            crs,
            grid: None,
        }
    }

    pub fn from_wsen(wsen: &[f64; 4], crs: Crs) -> Self {
        BoundingBox::new(wsen[0], wsen[1], wsen[2], wsen[3], crs)
    }

    /// box covering a reference grid, enlarged by `buffer` cells on each side. Shape and
    /// transform of the reference are kept for later grid-aligned cropping
    pub fn from_grid(transform: GeoTransform, rows: usize, cols: usize, crs: Crs, buffer: usize) -> Self {
        let (w, s, e, n) = transform.extent(rows, cols);
        let bx = buffer as f64 * transform.dx.abs();
        let by = buffer as f64 * transform.dy.abs();
        let mut bb = BoundingBox::new(w - bx, s - by, e + bx, n + by, crs);
        bb.grid = Some(GridGeom { transform, rows, cols });
        bb
    }

    #[inline]
    pub fn wsen(&self) -> (f64, f64, f64, f64) {
        (self.west, self.south, self.east, self.north)
    }

    pub fn grid(&self) -> Option<&GridGeom> {
        self.grid.as_ref()
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// the four corners in traditional GIS (x,y) axis order
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.west, self.south),
            (self.west, self.north),
            (self.east, self.south),
            (self.east, self.north),
        ]
    }

    /// rotate the four corners through the coordinate transform and take the axis-aligned
    /// envelope in the target CRS. The grid cache does not survive a reprojection
    pub fn transform(&self, target: &Crs) -> Result<BoundingBox> {
        if *target == self.crs {
            return Ok(self.clone());
        }
        let from = self.crs.kind();
        let to = target.kind();
        if from == ProjKind::Opaque || to == ProjKind::Opaque {
            return Err(GeoError::UnsupportedTransform(self.crs.to_string(), target.to_string()));
        }

        let mut xs = [0.0f64; 4];
        let mut ys = [0.0f64; 4];
        for (i, (x, y)) in self.corners().iter().enumerate() {
            let (lon, lat) = to_wgs84(from, *x, *y)?;
            let (tx, ty) = from_wgs84(to, lon, lat)?;
            xs[i] = tx;
            ys[i] = ty;
        }

        let w = xs.iter().cloned().fold(f64::INFINITY, f64::min);
        let e = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let s = ys.iter().cloned().fold(f64::INFINITY, f64::min);
        let n = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        Ok(BoundingBox::new(w, s, e, n, target.clone()))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {} @ {})",
            self.west, self.south, self.east, self.north, self.crs
        )
    }
}

/* #endregion BoundingBox */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_normalizes_inverted_axes() {
        let bb = BoundingBox::new(19.0, 48.0, 6.0, 36.0, Crs::wgs84());
        assert_eq!(bb.wsen(), (6.0, 36.0, 19.0, 48.0));
    }

    #[test]
    fn crs_parsing() {
        assert_eq!(Crs::parse("EPSG:4326").unwrap(), Crs::Epsg(4326));
        assert_eq!(Crs::parse("32632").unwrap(), Crs::Epsg(32632));
        assert!(Crs::parse(SINUSOIDAL_WKT).unwrap().epsg().is_none());
        assert!(Crs::parse("not-a-crs").is_err());
    }

    #[test]
    fn web_mercator_roundtrip() {
        let bb = BoundingBox::new(6.0, 36.0, 19.0, 48.0, Crs::wgs84());
        let merc = bb.transform(&Crs::Epsg(3857)).unwrap();
        let back = merc.transform(&Crs::wgs84()).unwrap();
        assert!((back.west - 6.0).abs() < 1e-6);
        assert!((back.north - 48.0).abs() < 1e-6);
    }

    #[test]
    fn sinusoidal_roundtrip() {
        let bb = BoundingBox::new(10.0, 44.0, 12.0, 46.0, Crs::wgs84());
        let sin = bb.transform(&Crs::sinusoidal()).unwrap();
        assert!(sin.west < sin.east && sin.south < sin.north);
        let back = sin.transform(&Crs::wgs84()).unwrap();
        // envelope grows through the corner rotation but must still contain the original
        assert!(back.west <= 10.0 + 1e-6 && back.east >= 12.0 - 1e-6);
    }

    #[test]
    fn utm_roundtrip_close_to_origin() {
        // zone 32 central meridian is 9E
        let (e, n) = super::geo_to_utm(9.0, 45.0, 32, true).unwrap();
        assert!((e - 500000.0).abs() < 0.01);
        let (lon, lat) = super::utm_to_geo(e, n, 32, true);
        assert!((lon - 9.0).abs() < 1e-7 && (lat - 45.0).abs() < 1e-7);
    }

    #[test]
    fn grid_buffer_enlarges_box() {
        let tr = GeoTransform::new(6.0, 48.0, 0.25, -0.25);
        let bb = BoundingBox::from_grid(tr, 48, 52, Crs::wgs84(), 2);
        assert!((bb.west - 5.5).abs() < 1e-9);
        assert!((bb.north - 48.5).abs() < 1e-9);
        assert!(bb.grid().is_some());
        let t = bb.transform(&Crs::Epsg(3857)).unwrap();
        assert!(t.grid().is_none());
    }
}

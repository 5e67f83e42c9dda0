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

///! end-to-end request tests against a local CHIRPS mirror tree. The retrieval phases run
///! inside one test body - they share the process-wide scratch root

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde_json::json;

use tellus::{bounds_from_spec, from_options, time_range_from_spec, Downloader};
use tellus_common::geo::{Crs, GeoTransform};
use tellus_raster::geotiff::{read_geotiff, write_geotiff};
use tellus_raster::Grid;

fn source_grid(fill: f32) -> Grid {
    let mut g = Grid::new(
        Array2::from_elem((8, 8), fill),
        GeoTransform::new(5.0, 49.0, 0.25, -0.25),
        Crs::wgs84(),
    );
    g.nodata = Some(-9999.0);
    g
}

fn write_final(mirror: &Path, date_path: &str, fill: f32) {
    let path = mirror.join(format!("global_daily/tifs/p25/2023/chirps-v2.0.{}.tif.gz", date_path));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let plain = path.with_extension("plain");
    write_geotiff(&source_grid(fill), &plain).unwrap();
    let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
    enc.write_all(&std::fs::read(&plain).unwrap()).unwrap();
    enc.finish().unwrap();
    std::fs::remove_file(plain).unwrap();
}

fn write_prelim(mirror: &Path, date_path: &str, fill: f32) {
    let path =
        mirror.join(format!("prelim/global_daily/tifs/p25/2023/chirps-v2.0.{}.tif", date_path));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    write_geotiff(&source_grid(fill), &path).unwrap();
}

fn request(mirror: &Path, out: &Path, filename: &str) -> serde_json::Value {
    json!({
        "source": "CHIRPS",
        "product": "CHIRPSp25-daily",
        "bounds": [6.0, 36.0, 19.0, 48.0],
        "destination": {"path": out.to_str().unwrap(), "filename": filename},
        "options": {
            "get_prelim": true,
            "base_url": format!("file://{}", mirror.display()),
            "min_size": 16,
        },
    })
}

#[tokio::test]
async fn request_documents_drive_the_whole_retrieval() {
    let mirror = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let scratch_root = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var("TELLUS_TMP", scratch_root.path().to_str().unwrap()) };

    // Dec 30 has the final release, Dec 31 only the preliminary one
    write_final(mirror.path(), "2023.12.30", 4.0);
    write_prelim(mirror.path(), "2023.12.31", 9.0);

    //--- final hit plus preliminary fallback, configured purely through the document
    let spec = request(mirror.path(), out.path(), "rain_%Y%m%d.tif");
    let mut dl = from_options(&spec).unwrap();
    assert_eq!(dl.core().source, "chirps");
    assert!(dl.core().bounds.is_some());

    let range = time_range_from_spec(&json!(["2023-12-30", "2023-12-31"])).unwrap();
    let report = dl.get_data(range, None, None, None).await.unwrap();
    assert_eq!(report.timesteps, 2);
    assert_eq!(report.writes, 2);

    let final_grid = read_geotiff(&out.path().join("rain_20231230.tif")).unwrap();
    assert_eq!(final_grid.crs, Crs::Epsg(4326));
    assert_eq!(final_grid.data[[0, 0]], 4.0);
    let prelim_grid = read_geotiff(&out.path().join("rain_20231231.tif")).unwrap();
    assert_eq!(prelim_grid.data[[0, 0]], 9.0);

    //--- an unresolved brace token stays literal in the artifact name
    let spec = request(mirror.path(), out.path(), "rain_%Y_{tile}.tif");
    let mut dl = from_options(&spec).unwrap();
    let range = time_range_from_spec(&json!("2023-12-30")).unwrap();
    let report = dl.get_data(range, None, None, None).await.unwrap();
    assert_eq!(report.writes, 1);
    assert!(out.path().join("rain_2023_{tile}.tif").is_file());

    //--- a missing day skips at warn and raises at error
    let empty_mirror = tempfile::tempdir().unwrap();
    let mut spec = request(empty_mirror.path(), out.path(), "rain_%Y%m%d.tif");
    spec["options"]["missing_action"] = json!("warn");
    let mut dl = from_options(&spec).unwrap();
    let range = time_range_from_spec(&json!("2023-12-29")).unwrap();
    let report = dl.get_data(range, None, None, None).await.unwrap();
    assert_eq!((report.writes, report.skips), (0, 1));

    let mut spec = request(empty_mirror.path(), out.path(), "rain_%Y%m%d.tif");
    spec["options"]["missing_action"] = json!("error");
    let mut dl = from_options(&spec).unwrap();
    let range = time_range_from_spec(&json!("2023-12-29")).unwrap();
    assert!(dl.get_data(range, None, None, None).await.is_err());

    //--- every scratch workspace of every request above is gone
    let leftover: Vec<_> = std::fs::read_dir(scratch_root.path()).unwrap().collect();
    assert!(leftover.is_empty(), "scratch dirs left behind: {:?}", leftover);
}

#[test]
fn bounds_reference_raster_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ref_path = dir.path().join("ref.tif");
    write_geotiff(&source_grid(0.0), &ref_path).unwrap();

    let bb = bounds_from_spec(&json!({"raster": ref_path.to_str().unwrap(), "buffer": 1}))
        .unwrap();
    // the 8x8 quarter-degree grid spans (5, 47, 7, 49), the buffer adds one cell
    assert!((bb.west - 4.75).abs() < 1e-9);
    assert!((bb.south - 46.75).abs() < 1e-9);
    assert!((bb.east - 7.25).abs() < 1e-9);
    assert!((bb.north - 49.25).abs() < 1e-9);
}

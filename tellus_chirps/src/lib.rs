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

///! downloader for the CHIRPS precipitation grids. Final releases are probed first; with
///! `get_prelim` set the preliminary release is the fallback, which for dekads is composed
///! from the two covering pentads with an all-valid-or-missing rule

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use tellus_common::fs::{decompress_gz, is_gzipped};
use tellus_common::geo::BoundingBox;
use tellus_common::net::head_status;
use tellus_common::timestep::{Freq, TimeStep};
use tellus_download::{
    config_error, data_missing, Downloader, DownloaderCore, MissingAction, OptionMap,
    PayloadStream, ProbeChain, ProbeStep, Result, Tags, TemplateCtx, UrlTemplate,
};
use tellus_raster::geotiff::read_geotiff;
use tellus_raster::{Grid, Payload};

pub const SOURCE: &str = "chirps";

const DEFAULT_BASE: &str = "https://data.chc.ucsb.edu/products/CHIRPS-2.0";
const NODATA: f32 = -9999.0;

/// one retrievable CHIRPS product: URL layout relative to the server base plus frequency.
/// Dekad products have no direct preliminary file - their fallback is the pentad composite
#[derive(Debug, Clone)]
struct ChirpsProduct {
    name: &'static str,
    freq: Freq,
    final_path: &'static str,
    prelim_path: Option<&'static str>,
    pentad_path: Option<&'static str>,
    min_size: u64,
}

fn lookup_product(name: &str) -> Option<ChirpsProduct> {
    let p = match name.to_lowercase().as_str() {
        "chirpsp25-daily" => ChirpsProduct {
            name: "CHIRPSp25-daily",
            freq: Freq::Daily,
            final_path: "global_daily/tifs/p25/%Y/chirps-v2.0.%Y.%m.%d.tif.gz",
            prelim_path: Some("prelim/global_daily/tifs/p25/%Y/chirps-v2.0.%Y.%m.%d.tif"),
            pentad_path: None,
            min_size: 400,
        },
        "chirpsp05-daily" => ChirpsProduct {
            name: "CHIRPSp05-daily",
            freq: Freq::Daily,
            final_path: "global_daily/tifs/p05/%Y/chirps-v2.0.%Y.%m.%d.tif.gz",
            prelim_path: Some("prelim/global_daily/tifs/p05/%Y/chirps-v2.0.%Y.%m.%d.tif"),
            pentad_path: None,
            min_size: 400,
        },
        "chirpsp25-dekads" => ChirpsProduct {
            name: "CHIRPSp25-dekads",
            freq: Freq::Dekadly,
            final_path: "global_dekad/tifs/chirps-v2.0.%Y.%m.{dekad}.tif.gz",
            prelim_path: None,
            pentad_path: Some("prelim/global_pentad/tifs/chirps-v2.0.%Y.%m.{pentad}.tif"),
            min_size: 400,
        },
        "chirpsp25-monthly" => ChirpsProduct {
            name: "CHIRPSp25-monthly",
            freq: Freq::Monthly,
            final_path: "global_monthly/tifs/chirps-v2.0.%Y.%m.tif.gz",
            prelim_path: Some("prelim/global_monthly/tifs/chirps-v2.0.%Y.%m.tif"),
            pentad_path: None,
            min_size: 400,
        },
        _ => return None,
    };
    Some(p)
}

pub fn available_products() -> &'static [&'static str] {
    &["CHIRPSp25-daily", "CHIRPSp05-daily", "CHIRPSp25-dekads", "CHIRPSp25-monthly"]
}

pub struct ChirpsDownloader {
    core: DownloaderCore,
    product: ChirpsProduct,
    client: Client,
}

impl ChirpsDownloader {
    pub fn new(product: &str) -> Result<ChirpsDownloader> {
        let product = lookup_product(product)
            .ok_or_else(|| config_error(format!("{}: unknown product {}", SOURCE, product)))?;
        Ok(ChirpsDownloader {
            core: DownloaderCore::new(SOURCE),
            product,
            client: Client::new(),
        })
    }

    /// registry constructor: `product` is the only recognized spec argument
    pub fn from_spec(args: &OptionMap) -> Result<Box<dyn Downloader>> {
        let product = args
            .get("product")
            .and_then(|v| v.as_str())
            .unwrap_or("CHIRPSp25-daily");
        Ok(Box::new(ChirpsDownloader::new(product)?))
    }

    fn base_url(&self) -> String {
        self.core
            .opt_str("base_url")
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string()
    }

    fn min_size(&self) -> u64 {
        self.core.opt_u64("min_size").unwrap_or(self.product.min_size)
    }

    fn template(&self, rel_path: &str) -> Result<UrlTemplate> {
        UrlTemplate::parse(&format!("{}/{}", self.base_url(), rel_path))
    }

    /// decompress if needed, decode, map the sentinel to NaN and clip to the request bounds
    fn decode_and_crop(&self, raw: &Path, scratch: &Path, bounds: &BoundingBox) -> Result<Grid> {
        let tif = if is_gzipped(raw) {
            let out = scratch.join("chirps_unpacked.tif");
            decompress_gz(raw, &out)?;
            out
        } else {
            raw.to_path_buf()
        };

        let mut grid = read_geotiff(&tif)?;
        if grid.nodata.is_none() {
            grid.nodata = Some(NODATA);
        }
        grid.nodata_to_nan();

        let bb = bounds.transform(&grid.crs)?;
        Ok(grid.crop_to_bb(&bb)?)
    }

    /// probe final then preliminary; for dekads fall through to the pentad composite
    async fn fetch_step(
        &self,
        ts: &TimeStep,
        bounds: &BoundingBox,
        scratch: &Path,
    ) -> Result<Option<Grid>> {
        let missing = self.core.missing_action;
        let get_prelim = self.core.opt_bool("get_prelim");

        let mut steps =
            vec![ProbeStep::finalized(self.template(self.product.final_path)?, Some(NODATA))];
        if get_prelim {
            if let Some(p) = self.product.prelim_path {
                steps.push(ProbeStep::preliminary(self.template(p)?, Some(NODATA)));
            }
        }
        let composite = get_prelim && self.product.pentad_path.is_some();

        // with a composite fallback behind it the URL chain must not escalate yet
        let chain_action = if composite { MissingAction::Ignore } else { missing };

        let raw = scratch.join("chirps_raw");
        let ctx = TemplateCtx::for_step(ts).with("dekad", ts.dekad_of_month());
        let chain = ProbeChain::new(steps);
        if let Some(hit) = chain
            .run(&self.client, None, &raw, self.min_size(), chain_action, &ctx)
            .await?
        {
            let mut grid = self.decode_and_crop(&raw, scratch, bounds)?;
            if hit.preliminary {
                grid.mark_preliminary();
            }
            return Ok(Some(grid));
        }

        if composite {
            return self.pentad_composite(ts, bounds, scratch).await;
        }
        Ok(None)
    }

    /// dekad preliminary: the two pentads covering the dekad, summed. With
    /// `strict_composite` a NaN in any pentad makes the output cell NaN; otherwise valid
    /// pentads fill in for missing ones
    async fn pentad_composite(
        &self,
        ts: &TimeStep,
        bounds: &BoundingBox,
        scratch: &Path,
    ) -> Result<Option<Grid>> {
        let missing = self.core.missing_action;
        let template = self.template(self.product.pentad_path.unwrap())?;
        let dekad = ts.dekad_of_month();

        let mut grids = Vec::with_capacity(2);
        for pentad in [2 * dekad - 1, 2 * dekad] {
            let ctx = TemplateCtx::for_step(ts).with("pentad", pentad);
            let raw = scratch.join(format!("pentad_{}", pentad));
            let ok = template
                .download(&self.client, None, &raw, self.min_size(), MissingAction::Ignore, &ctx)
                .await?;
            if !ok {
                missing.handle(data_missing(format!(
                    "{}: no pentad {} for {}",
                    SOURCE, pentad, ts
                )))?;
                return Ok(None);
            }
            grids.push(self.decode_and_crop(&raw, scratch, bounds)?);
        }

        let mut sum = if self.core.opt_bool("strict_composite") {
            Grid::sum_strict(&grids)?
        } else {
            nan_filling_sum(&grids)?
        };
        sum.mark_preliminary();
        info!("{}: composed dekad {} from pentads", SOURCE, ts);
        Ok(Some(sum))
    }
}

/// elementwise sum treating NaN cells as absent; a cell is NaN only if no grid has it
fn nan_filling_sum(grids: &[Grid]) -> Result<Grid> {
    let first = grids
        .first()
        .ok_or_else(|| config_error("empty pentad list"))?;
    let mut acc = first.clone();
    acc.data.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    let mut any_valid = first.data.mapv(|v| !v.is_nan());

    for g in &grids[1..] {
        ndarray::Zip::from(&mut acc.data)
            .and(&g.data)
            .and(&mut any_valid)
            .for_each(|a, &b, valid| {
                if !b.is_nan() {
                    *a += b;
                    *valid = true;
                }
            });
    }
    ndarray::Zip::from(&mut acc.data).and(&any_valid).for_each(|a, &valid| {
        if !valid {
            *a = f32::NAN;
        }
    });
    Ok(acc)
}

#[async_trait]
impl Downloader for ChirpsDownloader {
    fn core(&self) -> &DownloaderCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut DownloaderCore {
        &mut self.core
    }

    fn default_options(&self) -> OptionMap {
        let mut m = OptionMap::new();
        m.insert("get_prelim".to_string(), Value::from(true));
        m.insert("strict_composite".to_string(), Value::from(true));
        m.insert("base_url".to_string(), Value::from(DEFAULT_BASE));
        m.insert("min_size".to_string(), Value::Null);
        m
    }

    fn freq(&self) -> Result<Freq> {
        Ok(self.product.freq.clone())
    }

    async fn get_data_ts<'a>(
        &'a self,
        ts: &'a TimeStep,
        bounds: &'a BoundingBox,
        scratch: &'a Path,
        _active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>> {
        let items: Vec<Result<(Payload, Tags)>> = match self.fetch_step(ts, bounds, scratch).await? {
            Some(grid) => vec![Ok((Payload::Grid(grid), Tags::none()))],
            None => Vec::new(),
        };
        Ok(stream::iter(items).boxed())
    }

    /// walk back from today probing the final release with HEAD requests
    async fn last_published_ts(&self) -> Result<Option<TimeStep>> {
        let base = self.base_url();
        if !base.starts_with("http") {
            return Ok(None);
        }
        let template = self.template(self.product.final_path)?;

        let mut ts = TimeStep::of(Utc::now(), &self.product.freq);
        for _ in 0..90 {
            let ctx = TemplateCtx::for_step(&ts).with("dekad", ts.dekad_of_month());
            let url = template.format(&ctx);
            if let Ok(status) = head_status(&self.client, &url, None).await {
                if status.is_success() {
                    return Ok(Some(ts));
                }
            }
            debug!("{}: {} not yet published", SOURCE, ts);
            ts = ts.pred();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use ndarray::Array2;
    use std::io::Write;
    use tellus_common::geo::{Crs, GeoTransform};
    use tellus_common::timestep::TimeRange;
    use tellus_download::DestSink;
    use tellus_raster::geotiff::write_geotiff;

    /// global-ish quarter degree grid with a nodata hole at (1,1)
    fn source_grid(fill: f32) -> Grid {
        let mut data = Array2::from_elem((8, 8), fill);
        data[[1, 1]] = NODATA;
        let mut g = Grid::new(data, GeoTransform::new(5.0, 49.0, 0.25, -0.25), Crs::wgs84());
        g.nodata = Some(NODATA);
        g
    }

    fn write_gz_tif(path: &Path, grid: &Grid) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let tmp = path.with_extension("plain");
        write_geotiff(grid, &tmp).unwrap();
        let bytes = std::fs::read(&tmp).unwrap();
        let mut enc = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
        enc.write_all(&bytes).unwrap();
        enc.finish().unwrap();
        std::fs::remove_file(tmp).unwrap();
    }

    fn write_tif(path: &Path, grid: &Grid) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        write_geotiff(grid, path).unwrap();
    }

    fn mirror_downloader(dir: &tempfile::TempDir, product: &str) -> ChirpsDownloader {
        let mut dl = ChirpsDownloader::new(product).unwrap();
        let mut opts = OptionMap::new();
        opts.insert("base_url".to_string(), Value::from(format!("file://{}", dir.path().display())));
        opts.insert("min_size".to_string(), Value::from(16));
        dl.set_options(opts).unwrap();
        dl
    }

    fn request_parts(out: &tempfile::TempDir) -> (TimeRange, BoundingBox, DestSink) {
        let range = TimeRange::parse("2023-12-30", "2023-12-30").unwrap();
        let bb = BoundingBox::new(6.0, 36.0, 19.0, 48.0, Crs::wgs84());
        let sink = DestSink::from_parts(out.path().to_str().unwrap(), "rain_%Y%m%d.tif");
        (range, bb, sink)
    }

    #[tokio::test]
    async fn final_hit_has_no_preliminary_flag() {
        let mirror = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_gz_tif(
            &mirror.path().join("global_daily/tifs/p25/2023/chirps-v2.0.2023.12.30.tif.gz"),
            &source_grid(4.0),
        );
        // a prelim file exists too but the final release wins
        write_tif(
            &mirror.path().join("prelim/global_daily/tifs/p25/2023/chirps-v2.0.2023.12.30.tif"),
            &source_grid(9.0),
        );

        let mut dl = mirror_downloader(&mirror, "CHIRPSp25-daily");
        let (range, bb, sink) = request_parts(&out);
        let report = dl.get_data(range, Some(bb.clone()), Some(sink), None).await.unwrap();
        assert_eq!(report.writes, 1);
        assert!(out.path().join("rain_20231230.tif").is_file());

        let ts = tellus_common::timestep::expand(&range, &Freq::Daily).remove(0);
        let scratch = tempfile::tempdir().unwrap();
        let grid = dl.fetch_step(&ts, &bb, scratch.path()).await.unwrap().unwrap();
        assert!(!Payload::Grid(grid.clone()).is_preliminary());
        assert_eq!(grid.data[[0, 0]], 4.0);
    }

    #[tokio::test]
    async fn prelim_fallback_stamps_flag_and_maps_nodata() {
        let mirror = tempfile::tempdir().unwrap();
        write_tif(
            &mirror.path().join("prelim/global_daily/tifs/p25/2023/chirps-v2.0.2023.12.30.tif"),
            &source_grid(7.5),
        );

        let dl = mirror_downloader(&mirror, "CHIRPSp25-daily");
        let ts = TimeStep::of(Utc.with_ymd_and_hms(2023, 12, 30, 0, 0, 0).unwrap(), &Freq::Daily);
        let bb = BoundingBox::new(5.0, 47.0, 6.0, 49.0, Crs::wgs84());
        let scratch = tempfile::tempdir().unwrap();

        let grid = dl.fetch_step(&ts, &bb, scratch.path()).await.unwrap().unwrap();
        assert!(Payload::Grid(grid.clone()).is_preliminary());
        // the nodata hole at source (1,1) lies inside the crop window and became NaN
        assert!(grid.data.iter().any(|v| v.is_nan()));
        assert!(grid.data.iter().any(|v| *v == 7.5));
    }

    #[tokio::test]
    async fn dekad_composite_sums_pentads_all_valid_or_missing() {
        let mirror = tempfile::tempdir().unwrap();
        // dekad 1 of 2023-12 -> pentads 1 and 2; no final dekad file on the mirror
        write_tif(
            &mirror.path().join("prelim/global_pentad/tifs/chirps-v2.0.2023.12.1.tif"),
            &source_grid(2.0),
        );
        write_tif(
            &mirror.path().join("prelim/global_pentad/tifs/chirps-v2.0.2023.12.2.tif"),
            &source_grid(3.0),
        );

        let dl = mirror_downloader(&mirror, "CHIRPSp25-dekads");
        let ts = TimeStep::of(Utc.with_ymd_and_hms(2023, 12, 5, 0, 0, 0).unwrap(), &Freq::Dekadly);
        let bb = BoundingBox::new(5.0, 47.0, 6.0, 49.0, Crs::wgs84());
        let scratch = tempfile::tempdir().unwrap();

        let grid = dl.fetch_step(&ts, &bb, scratch.path()).await.unwrap().unwrap();
        assert!(Payload::Grid(grid.clone()).is_preliminary());
        assert_eq!(grid.data[[0, 0]], 5.0);
        // both pentads have the sentinel hole -> strict composite keeps it NaN
        assert!(grid.data[[1, 1]].is_nan());
    }

    #[tokio::test]
    async fn missing_pentad_skips_timestep_at_warn() {
        let mirror = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_tif(
            &mirror.path().join("prelim/global_pentad/tifs/chirps-v2.0.2023.12.1.tif"),
            &source_grid(2.0),
        );
        // pentad 2 absent -> all-valid-or-missing refuses the composite

        let mut dl = mirror_downloader(&mirror, "CHIRPSp25-dekads");
        let range = TimeRange::parse("2023-12-05", "2023-12-05").unwrap();
        let bb = BoundingBox::new(5.0, 47.0, 6.0, 49.0, Crs::wgs84());
        let sink = DestSink::from_parts(out.path().to_str().unwrap(), "rain_%Y%m%d.tif");

        let report = dl.get_data(range, Some(bb), Some(sink), None).await.unwrap();
        assert_eq!(report.writes, 0);
        assert_eq!(report.skips, 1);
    }

    #[test]
    fn unknown_product_is_config_error() {
        assert!(ChirpsDownloader::new("CHIRPSp99-weekly").is_err());
        assert!(lookup_product("chirpsP25-DAILY").is_some());
    }
}

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

///! downloader for VIIRS land products on the sinusoidal tile grid. Granules are located
///! through the CMR catalogue (with version fallback), filtered to the timestep, and either
///! pasted into one virtual mosaic per variable or kept as separate tile payloads

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tellus_common::geo::{BoundingBox, Crs};
use tellus_common::net::{self, Auth};
use tellus_common::timestep::{Freq, TimeStep};
use tellus_download::credentials::{get_credentials, CredentialRequest};
use tellus_download::{
    config_error, data_missing, integrity, Downloader, DownloaderCore, MissingAction, OptionMap,
    PayloadStream, Result, Tags,
};
use tellus_raster::decode::GeoTiffDecoder;
use tellus_raster::{Grid, Payload, RasterDecoder};

pub mod cmr;
pub use cmr::{CmrCatalog, GranuleCatalog, GranuleQuery};

pub mod mosaic;
use mosaic::mosaic;

pub const SOURCE: &str = "viirs";

const DEFAULT_CMR_URL: &str = "https://cmr.earthdata.nasa.gov";

lazy_static! {
    // granule names embed the observation date as .AYYYYDDD. and the tile as hNNvNN
    static ref DATE_CODE_RE: Regex = Regex::new(r"\.A(\d{4})(\d{3})\.").unwrap();
    static ref TILE_CODE_RE: Regex = Regex::new(r"(h\d{2}v\d{2})").unwrap();
}

/// the observation date encoded in a granule URL
pub fn granule_date(url: &str) -> Option<NaiveDate> {
    let cap = DATE_CODE_RE.captures(url)?;
    let year: i32 = cap[1].parse().ok()?;
    let doy: u32 = cap[2].parse().ok()?;
    NaiveDate::from_yo_opt(year, doy)
}

/// the sinusoidal tile code in a granule URL, if any
pub fn tile_code(url: &str) -> Option<String> {
    TILE_CODE_RE.captures(url).map(|c| c[1].to_string())
}

/// a variable inside the product container, addressed by sub-dataset index, with the
/// encoding metadata the embedded structural metadata does not always carry
#[derive(Debug, Clone)]
struct ViirsVariable {
    name: &'static str,
    layer: usize,
    valid_range: (f32, f32),
    fill: f32,
    scale: f32,
}

#[derive(Debug, Clone)]
struct ViirsProduct {
    name: &'static str,
    short_name: &'static str,
    /// probed in order - the catalogue occasionally lags behind a reprocessing
    versions: &'static [&'static str],
    freq: Freq,
    extension: &'static str,
    default_vars: &'static [&'static str],
}

fn lookup_product(name: &str) -> Option<ViirsProduct> {
    let p = match name.to_lowercase().as_str() {
        "fapar" => ViirsProduct {
            name: "fapar",
            short_name: "VNP15A2H",
            versions: &["002", "001"],
            freq: Freq::Viirs8Day,
            extension: ".h5",
            default_vars: &["fapar"],
        },
        "phenology" => ViirsProduct {
            name: "phenology",
            short_name: "VNP22Q2",
            versions: &["001"],
            freq: Freq::Yearly,
            extension: ".h5",
            default_vars: &["onset_greenness"],
        },
        _ => return None,
    };
    Some(p)
}

fn lookup_variable(product: &str, name: &str) -> Option<ViirsVariable> {
    let v = match (product, name.to_lowercase().as_str()) {
        ("fapar", "fapar") => ViirsVariable {
            name: "fapar", layer: 0, valid_range: (0.0, 100.0), fill: 255.0, scale: 0.01,
        },
        ("fapar", "lai") => ViirsVariable {
            name: "lai", layer: 1, valid_range: (0.0, 100.0), fill: 255.0, scale: 0.1,
        },
        ("phenology", "onset_greenness") => ViirsVariable {
            name: "onset_greenness", layer: 0, valid_range: (1.0, 366.0), fill: 32767.0, scale: 1.0,
        },
        ("phenology", "growing_season_length") => ViirsVariable {
            name: "growing_season_length", layer: 1, valid_range: (1.0, 366.0), fill: 32767.0, scale: 1.0,
        },
        _ => return None,
    };
    Some(v)
}

pub fn available_products() -> &'static [&'static str] {
    &["fapar", "phenology"]
}

pub struct ViirsDownloader {
    core: DownloaderCore,
    product: ViirsProduct,
    catalog: OnceLock<Box<dyn GranuleCatalog>>,
    decoder: Box<dyn RasterDecoder>,
    client: Client,
}

impl ViirsDownloader {
    pub fn new(product: &str) -> Result<ViirsDownloader> {
        let product = lookup_product(product)
            .ok_or_else(|| config_error(format!("{}: unknown product {}", SOURCE, product)))?;
        Ok(ViirsDownloader {
            core: DownloaderCore::new(SOURCE),
            product,
            catalog: OnceLock::new(),
            decoder: Box::new(GeoTiffDecoder),
            client: Client::new(),
        })
    }

    pub fn from_spec(args: &OptionMap) -> Result<Box<dyn Downloader>> {
        let product = args.get("product").and_then(|v| v.as_str()).unwrap_or("fapar");
        Ok(Box::new(ViirsDownloader::new(product)?))
    }

    pub fn set_catalog(&mut self, catalog: Box<dyn GranuleCatalog>) {
        let _ = self.catalog.set(catalog);
    }

    pub fn set_decoder(&mut self, decoder: Box<dyn RasterDecoder>) {
        self.decoder = decoder;
    }

    fn catalog(&self) -> &dyn GranuleCatalog {
        self.catalog
            .get_or_init(|| {
                let url = self.core.opt_str("cmr_url").unwrap_or(DEFAULT_CMR_URL).to_string();
                Box::new(CmrCatalog::new(&url))
            })
            .as_ref()
    }

    fn resolved_variables(&self) -> Result<Vec<ViirsVariable>> {
        self.core
            .variables
            .iter()
            .map(|n| {
                lookup_variable(self.product.name, n).ok_or_else(|| {
                    config_error(format!("{}: no variable {} in {}", SOURCE, n, self.product.name))
                })
            })
            .collect()
    }

    /// the catalogue listing for a timestep, walking the version list until one has
    /// granules. The catalogue occasionally returns neighbouring periods - anything whose
    /// embedded date code lies outside the step is discarded
    async fn locate_granules(&self, ts: &TimeStep, bounds: &BoundingBox) -> Result<Vec<String>> {
        let bb = bounds.transform(&Crs::wgs84())?;
        for version in self.product.versions {
            let query = GranuleQuery {
                short_name: self.product.short_name.to_string(),
                version: version.to_string(),
                start: ts.start(),
                end: ts.end(),
                bbox: bb.wsen(),
            };
            let mut urls = self.catalog().granules(&query).await?;
            urls.retain(|u| u.ends_with(self.product.extension));
            urls.retain(|u| match granule_date(u) {
                Some(d) => d >= ts.start().date_naive() && d <= ts.end().date_naive(),
                None => false,
            });
            if !urls.is_empty() {
                return Ok(urls);
            }
            debug!("{}: no {} v{} granules for {}", SOURCE, self.product.short_name, version, ts);
        }
        Ok(Vec::new())
    }

    async fn earthdata_auth(&self, url: &str) -> Result<Option<Auth>> {
        if !url.starts_with("http") {
            return Ok(None);
        }
        let explicit = match (self.core.opt_str("username"), self.core.opt_str("password")) {
            (Some(u), Some(p)) => Some((u.to_string(), p.to_string())),
            _ => None,
        };
        let req = CredentialRequest {
            source: SOURCE,
            env_user: "EARTHDATA_LOGIN",
            env_password: "EARTHDATA_PWD",
            url,
            test_url: None,
            encode: false,
            explicit,
        };
        Ok(Some(get_credentials(&self.client, &req).await?))
    }

    /// fetch one granule into the scratch workspace; failures are routed through the
    /// policy and reported as None so the remaining tiles still get a chance
    async fn fetch_granule(
        &self,
        url: &str,
        index: usize,
        scratch: &Path,
        missing: MissingAction,
    ) -> Result<Option<PathBuf>> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("granule_{}{}", index, self.product.extension));
        let dest = scratch.join(name);
        let min_size = self.core.opt_u64("min_size").unwrap_or(1000);

        let fetched = if url.starts_with("file://") {
            net::download_file_url(url, &dest)
        } else {
            let auth = self.earthdata_auth(url).await?;
            net::download_http(&self.client, url, auth.as_ref(), &dest).await
        };
        if let Err(e) = fetched {
            let err: tellus_download::TellusError = e.into();
            if err.is_fatal() {
                return Err(err);
            }
            missing.handle(err)?;
            return Ok(None);
        }
        if let Err(e) = integrity::gate(&dest, min_size) {
            missing.handle(e)?;
            return Ok(None);
        }
        Ok(Some(dest))
    }

    /// decode one layer and turn the stored integers into physical values, keeping the
    /// encoding metadata as attributes
    fn decode_layer(&self, path: &Path, var: &ViirsVariable) -> Result<Grid> {
        let mut grid = self.decoder.decode_layer(path, var.layer)?;
        grid.nodata = Some(var.fill);
        grid.valid_range = Some(var.valid_range);
        grid.scale = Some(var.scale);
        grid.nodata_to_nan();
        grid.apply_scale_and_range();

        grid.set_attr("valid_range", format!("{},{}", var.valid_range.0, var.valid_range.1));
        grid.set_attr("fill_value", var.fill);
        grid.set_attr("scale_factor", var.scale);
        Ok(grid)
    }
}

#[async_trait]
impl Downloader for ViirsDownloader {
    fn core(&self) -> &DownloaderCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut DownloaderCore {
        &mut self.core
    }

    fn default_options(&self) -> OptionMap {
        let mut m = OptionMap::new();
        m.insert("variables".to_string(), json!(self.product.default_vars));
        m.insert("make_mosaic".to_string(), Value::from(true));
        m.insert("cmr_url".to_string(), Value::from(DEFAULT_CMR_URL));
        m.insert("username".to_string(), Value::Null);
        m.insert("password".to_string(), Value::Null);
        m.insert("min_size".to_string(), Value::from(1000));
        m
    }

    fn freq(&self) -> Result<Freq> {
        Ok(self.product.freq.clone())
    }

    fn set_variables(&mut self, vars: Vec<String>) -> Result<()> {
        for v in &vars {
            if lookup_variable(self.product.name, v).is_none() {
                return Err(config_error(format!(
                    "{}: no variable {} in {}", SOURCE, v, self.product.name
                )));
            }
        }
        self.core.variables = vars;
        Ok(())
    }

    async fn get_data_ts<'a>(
        &'a self,
        ts: &'a TimeStep,
        bounds: &'a BoundingBox,
        scratch: &'a Path,
        _active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>> {
        let vars = self.resolved_variables()?;
        let missing = self.core.missing_action;
        let make_mosaic = self.core.opt_bool("make_mosaic");

        let urls = self.locate_granules(ts, bounds).await?;
        if urls.is_empty() {
            missing.handle(data_missing(format!("{}: no granules for {}", SOURCE, ts)))?;
            return Ok(stream::iter(Vec::new()).boxed());
        }
        info!("{}: {} granules for {}", SOURCE, urls.len(), ts);

        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            if let Some(path) = self.fetch_granule(url, i, scratch, missing).await? {
                let tile = tile_code(url).unwrap_or_else(|| i.to_string());
                files.push((tile, path));
            }
        }
        if files.is_empty() {
            return Ok(stream::iter(Vec::new()).boxed());
        }

        let mut items: Vec<Result<(Payload, Tags)>> = Vec::new();
        for var in &vars {
            let mut tiles: Vec<(String, Grid)> = Vec::new();
            for (tile, path) in &files {
                match self.decode_layer(path, var) {
                    Ok(grid) => tiles.push((tile.clone(), grid)),
                    Err(e) => {
                        items.push(Err(e));
                        continue;
                    }
                }
            }

            if make_mosaic {
                let grids: Vec<Grid> = tiles.into_iter().map(|(_, g)| g).collect();
                let pasted = mosaic(&grids)?;
                let bb = bounds.transform(&pasted.crs)?;
                let clipped = pasted.crop_to_bb(&bb)?;
                items.push(Ok((Payload::Grid(clipped), Tags::variable(var.name))));
            } else {
                for (tile, grid) in tiles {
                    let bb = bounds.transform(&grid.crs)?;
                    match grid.crop_to_bb(&bb) {
                        Ok(clipped) => {
                            let tags = Tags::variable(var.name).with_tile(&tile);
                            items.push(Ok((Payload::Grid(clipped), tags)));
                        }
                        // a spatial-query neighbour that only touches the box edge
                        Err(e) => debug!("{}: tile {} dropped: {}", SOURCE, tile, e),
                    }
                }
            }
        }
        Ok(stream::iter(items).boxed())
    }

    /// the newest granule date the catalogue lists inside the last few periods
    async fn last_published_ts(&self) -> Result<Option<TimeStep>> {
        let bounds = match &self.core.bounds {
            Some(bb) => bb.transform(&Crs::wgs84())?,
            None => BoundingBox::new(-180.0, -90.0, 180.0, 90.0, Crs::wgs84()),
        };
        let now = Utc::now();
        let query = GranuleQuery {
            short_name: self.product.short_name.to_string(),
            version: self.product.versions[0].to_string(),
            start: now - Duration::days(40),
            end: now,
            bbox: bounds.wsen(),
        };
        let urls = self.catalog().granules(&query).await?;
        let last = urls
            .iter()
            .filter_map(|u| granule_date(u))
            .max()
            .map(|d| {
                let dt = Utc.with_ymd_and_hms(d.year(), d.month(), d.day(), 0, 0, 0).unwrap();
                TimeStep::of(dt, &self.product.freq)
            });
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::sync::{Arc, Mutex};
    use tellus_common::geo::GeoTransform;
    use tellus_common::timestep::TimeRange;
    use tellus_download::DestSink;
    use tellus_raster::geotiff::write_geotiff;

    struct StaticCatalog {
        urls: Vec<String>,
        queries: Arc<Mutex<Vec<(String, String)>>>,
        /// versions that return an empty listing
        empty_versions: Vec<String>,
    }

    #[async_trait]
    impl GranuleCatalog for StaticCatalog {
        async fn granules(&self, query: &GranuleQuery) -> Result<Vec<String>> {
            self.queries
                .lock()
                .unwrap()
                .push((query.short_name.clone(), query.version.clone()));
            if self.empty_versions.contains(&query.version) {
                return Ok(Vec::new());
            }
            Ok(self.urls.clone())
        }
    }

    /// 4x4 tiles of 1000 m cells on the sinusoidal grid; value 50 with a 255 fill hole
    fn tile_grid(x0: f64) -> Grid {
        let mut data = Array2::from_elem((4, 4), 50.0f32);
        data[[2, 2]] = 255.0;
        Grid::new(data, GeoTransform::new(x0, 4_000.0, 1000.0, -1000.0), Crs::sinusoidal())
    }

    fn write_granule(dir: &Path, name: &str, x0: f64) -> String {
        let path = dir.join(name);
        write_geotiff(&tile_grid(x0), &path).unwrap();
        format!("file://{}", path.display())
    }

    fn downloader(catalog: StaticCatalog) -> ViirsDownloader {
        let mut dl = ViirsDownloader::new("fapar").unwrap();
        dl.set_catalog(Box::new(catalog));
        // the mirror granules are plain GeoTIFFs, so the native decoder applies
        dl.set_decoder(Box::new(GeoTiffDecoder));
        dl
    }

    fn sinusoidal_bounds() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 8_000.0, 4_000.0, Crs::sinusoidal())
    }

    fn step_2017_033() -> TimeStep {
        TimeStep::of(Utc.with_ymd_and_hms(2017, 2, 2, 0, 0, 0).unwrap(), &Freq::Viirs8Day)
    }

    #[test]
    fn url_code_parsing() {
        let url = "https://e4ftl01.cr.usgs.gov/VIIRS/VNP15A2H.002/VNP15A2H.A2017033.h18v04.002.2018142.h5";
        assert_eq!(granule_date(url), NaiveDate::from_yo_opt(2017, 33));
        assert_eq!(tile_code(url), Some("h18v04".to_string()));
        assert_eq!(granule_date("no_code.h5"), None);
    }

    #[tokio::test]
    async fn tiles_separate_yields_one_payload_per_tile() {
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            write_granule(dir.path(), "VNP15A2H.A2017033.h18v04.002.h5", 0.0),
            write_granule(dir.path(), "VNP15A2H.A2017033.h19v04.002.h5", 4_000.0),
            // catalogue noise from the neighbouring period, filtered by the date code
            write_granule(dir.path(), "VNP15A2H.A2017041.h18v04.002.h5", 0.0),
        ];
        let mut dl = downloader(StaticCatalog {
            urls,
            queries: Arc::new(Mutex::new(Vec::new())),
            empty_versions: vec![],
        });
        let mut opts = OptionMap::new();
        opts.insert("make_mosaic".to_string(), Value::from(false));
        opts.insert("min_size".to_string(), Value::from(16));
        dl.set_options(opts).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let items: Vec<_> = dl
            .get_data_ts(&step_2017_033(), &sinusoidal_bounds(), scratch.path(), None)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        let tags: Vec<String> = items
            .iter()
            .map(|r| r.as_ref().unwrap().1.tile.clone().unwrap())
            .collect();
        assert_eq!(tags, vec!["h18v04", "h19v04"]);

        let (payload, _) = items.into_iter().next().unwrap().unwrap();
        let Payload::Grid(g) = payload else { panic!("expected grid") };
        assert_eq!(g.data[[0, 0]], 0.5); // 50 x 0.01 scale
        assert!(g.data[[2, 2]].is_nan()); // fill value
        assert_eq!(g.attrs.get("scale_factor").map(String::as_str), Some("0.01"));
    }

    #[tokio::test]
    async fn mosaic_mode_pastes_tiles_and_clips() {
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            write_granule(dir.path(), "VNP15A2H.A2017033.h18v04.002.h5", 0.0),
            write_granule(dir.path(), "VNP15A2H.A2017033.h19v04.002.h5", 4_000.0),
        ];
        let mut dl = downloader(StaticCatalog {
            urls,
            queries: Arc::new(Mutex::new(Vec::new())),
            empty_versions: vec![],
        });
        let mut opts = OptionMap::new();
        opts.insert("min_size".to_string(), Value::from(16));
        dl.set_options(opts).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let items: Vec<_> = dl
            .get_data_ts(&step_2017_033(), &sinusoidal_bounds(), scratch.path(), None)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        let (payload, tags) = items.into_iter().next().unwrap().unwrap();
        assert!(tags.tile.is_none());
        let Payload::Grid(g) = payload else { panic!("expected grid") };
        assert_eq!(g.cols(), 8); // both tiles side by side
        assert_eq!(g.data[[0, 0]], 0.5);
        assert_eq!(g.data[[0, 7]], 0.5);
    }

    #[tokio::test]
    async fn version_fallback_walks_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let urls = vec![write_granule(dir.path(), "VNP15A2H.A2017033.h18v04.001.h5", 0.0)];
        let mut dl = downloader(StaticCatalog {
            urls,
            queries: queries.clone(),
            empty_versions: vec!["002".to_string()],
        });
        let mut opts = OptionMap::new();
        opts.insert("min_size".to_string(), Value::from(16));
        dl.set_options(opts).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let items: Vec<_> = dl
            .get_data_ts(&step_2017_033(), &sinusoidal_bounds(), scratch.path(), None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);

        let seen = queries.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("VNP15A2H".to_string(), "002".to_string()), ("VNP15A2H".to_string(), "001".to_string())]
        );
    }

    #[tokio::test]
    async fn no_granules_routes_through_policy() {
        let mut dl = downloader(StaticCatalog {
            urls: vec![],
            queries: Arc::new(Mutex::new(Vec::new())),
            empty_versions: vec!["002".to_string(), "001".to_string()],
        });
        dl.set_options(OptionMap::new()).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let items: Vec<_> = dl
            .get_data_ts(&step_2017_033(), &sinusoidal_bounds(), scratch.path(), None)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(items.is_empty());

        // at error level the empty catalogue raises
        let mut dl = downloader(StaticCatalog {
            urls: vec![],
            queries: Arc::new(Mutex::new(Vec::new())),
            empty_versions: vec!["002".to_string(), "001".to_string()],
        });
        let mut opts = OptionMap::new();
        opts.insert("missing_action".to_string(), Value::from("error"));
        dl.set_options(opts).unwrap();
        let step = step_2017_033();
        let bounds = sinusoidal_bounds();
        let res = dl.get_data_ts(&step, &bounds, scratch.path(), None).await;
        assert!(res.is_err());
    }

    #[test]
    fn variables_validated_per_product() {
        let mut dl = ViirsDownloader::new("fapar").unwrap();
        assert!(dl.set_variables(vec!["lai".to_string()]).is_ok());
        assert!(dl.set_variables(vec!["onset_greenness".to_string()]).is_err());
    }
}

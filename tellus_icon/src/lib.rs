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

///! downloader for ICON model runs from the DWD open-data tree. Per issue time the step set
///! is the regular interval clipped to the per-run horizon and to the requested window;
///! every (variable, step) is one bz2-compressed file, stacked along the step axis and
///! pushed through the shared forecast post-processing

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use ndarray::{Array2, Array3, Axis};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use tellus_common::fs::decompress_bz2;
use tellus_common::geo::BoundingBox;
use tellus_common::net::head_status;
use tellus_common::timestep::{Freq, TimeStep};
use tellus_download::{
    config_error, data_missing, forecast, Downloader, DownloaderCore, MissingAction, OptionMap,
    PayloadStream, Result, Tags, TemplateCtx, UrlTemplate,
};
use tellus_raster::decode::GeoTiffDecoder;
use tellus_raster::{Grid, GridStack, Payload, RasterDecoder};

pub mod regrid;
pub use regrid::RegridTable;

pub const SOURCE: &str = "icon";

const DEFAULT_BASE: &str = "https://opendata.dwd.de/weather/nwp";

#[derive(Debug, Clone)]
struct IconVariable {
    name: &'static str,
    /// lower/upper case spellings used in the open-data directory and file names
    dir_name: &'static str,
    file_code: &'static str,
    unit: &'static str,
    k_to_c: bool,
}

fn lookup_variable(name: &str) -> Option<IconVariable> {
    let v = match name.to_lowercase().as_str() {
        "t_2m" => IconVariable {
            name: "t_2m", dir_name: "t_2m", file_code: "T_2M", unit: "degC", k_to_c: true,
        },
        "tot_prec" => IconVariable {
            name: "tot_prec", dir_name: "tot_prec", file_code: "TOT_PREC", unit: "mm", k_to_c: false,
        },
        "u_10m" => IconVariable {
            name: "u_10m", dir_name: "u_10m", file_code: "U_10M", unit: "m s-1", k_to_c: false,
        },
        "v_10m" => IconVariable {
            name: "v_10m", dir_name: "v_10m", file_code: "V_10M", unit: "m s-1", k_to_c: false,
        },
        "relhum_2m" => IconVariable {
            name: "relhum_2m", dir_name: "relhum_2m", file_code: "RELHUM_2M", unit: "%", k_to_c: false,
        },
        _ => return None,
    };
    Some(v)
}

/// one model configuration of the open-data tree. The main runs (00/12 UTC) reach further
/// out than the intermediate ones (06/18 UTC)
#[derive(Debug, Clone)]
struct IconProduct {
    name: &'static str,
    path_template: &'static str,
    issue_hours: &'static [u32],
    step_interval: u32,
    horizon_main: u32,
    horizon_inter: u32,
}

fn lookup_product(name: &str) -> Option<IconProduct> {
    let p = match name.to_lowercase().as_str() {
        "icon0p125" => IconProduct {
            name: "ICON0p125",
            path_template:
                "icon/grib/%H/{var}/icon_global_icosahedral_single-level_%Y%m%d%H_{step}_{VAR}.grib2.bz2",
            issue_hours: &[0, 6, 12, 18],
            step_interval: 1,
            horizon_main: 144,
            horizon_inter: 90,
        },
        "iconeu0p0625" => IconProduct {
            name: "ICONEU0p0625",
            path_template:
                "icon-eu/grib/%H/{var}/icon-eu_europe_regular-lat-lon_single-level_%Y%m%d%H_{step}_{VAR}.grib2.bz2",
            issue_hours: &[0, 6, 12, 18],
            step_interval: 1,
            horizon_main: 120,
            horizon_inter: 30,
        },
        _ => return None,
    };
    Some(p)
}

pub fn available_products() -> &'static [&'static str] {
    &["ICON0p125", "ICONEU0p0625"]
}

pub struct IconDownloader {
    core: DownloaderCore,
    product: IconProduct,
    client: Client,
    decoder: Box<dyn RasterDecoder>,
    /// the icosahedral conversion table, fetched once per session when configured
    regrid: OnceLock<RegridTable>,
}

impl IconDownloader {
    pub fn new(product: &str) -> Result<IconDownloader> {
        let product = lookup_product(product)
            .ok_or_else(|| config_error(format!("{}: unknown product {}", SOURCE, product)))?;
        Ok(IconDownloader {
            core: DownloaderCore::new(SOURCE),
            product,
            client: Client::new(),
            decoder: Box::new(GeoTiffDecoder),
            regrid: OnceLock::new(),
        })
    }

    pub fn from_spec(args: &OptionMap) -> Result<Box<dyn Downloader>> {
        let product = args.get("product").and_then(|v| v.as_str()).unwrap_or("ICON0p125");
        Ok(Box::new(IconDownloader::new(product)?))
    }

    pub fn set_decoder(&mut self, decoder: Box<dyn RasterDecoder>) {
        self.decoder = decoder;
    }

    fn base_url(&self) -> String {
        self.core
            .opt_str("base_url")
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string()
    }

    fn resolved_variables(&self) -> Result<Vec<IconVariable>> {
        self.core
            .variables
            .iter()
            .map(|n| {
                lookup_variable(n)
                    .ok_or_else(|| config_error(format!("{}: unknown variable {}", SOURCE, n)))
            })
            .collect()
    }

    /// regular steps out to the per-run horizon, clipped to the end of the running request
    /// so a short window does not pull the full forecast
    fn forecast_steps(&self, ts: &TimeStep) -> Vec<u32> {
        let mut horizon = if ts.hour() % 12 == 0 {
            self.product.horizon_main
        } else {
            self.product.horizon_inter
        };
        if let Some(range) = &self.core.request_range {
            let avail = (range.end() - ts.start()).num_hours();
            if avail >= 0 {
                horizon = horizon.min(avail as u32);
            }
        }
        let interval = self
            .core
            .opt_u64("step_interval")
            .map(|v| v as u32)
            .unwrap_or(self.product.step_interval)
            .max(1);
        (1..=horizon / interval).map(|k| k * interval).collect()
    }

    /// fetch the conversion table once per session
    async fn regrid_table(&self, scratch: &Path) -> Result<Option<&RegridTable>> {
        let url = match self.core.opt_str("regrid_url") {
            Some(u) => u.to_string(),
            None => return Ok(None),
        };
        if self.regrid.get().is_none() {
            let dest = scratch.join("icon_regrid.txt");
            let template = UrlTemplate::parse(&url)?;
            let ok = template
                .download(&self.client, None, &dest, 16, MissingAction::Error, &TemplateCtx::new())
                .await?;
            if ok {
                let _ = self.regrid.set(RegridTable::parse(&dest)?);
                info!("{}: loaded regrid table from {}", SOURCE, url);
            }
        }
        Ok(self.regrid.get())
    }

    /// one (variable, step) file: fetch, unpack, decode, optionally remap
    async fn fetch_field(
        &self,
        ts: &TimeStep,
        var: &IconVariable,
        step: u32,
        scratch: &Path,
        table: Option<&RegridTable>,
    ) -> Result<Option<Grid>> {
        let template =
            UrlTemplate::parse(&format!("{}/{}", self.base_url(), self.product.path_template))?;
        let ctx = TemplateCtx::for_step(ts)
            .with("var", var.dir_name)
            .with("VAR", var.file_code)
            .with("step", format!("{:03}", step));

        let packed = scratch.join(format!("{}_{:03}.grib2.bz2", var.name, step));
        let min_size = self.core.opt_u64("min_size").unwrap_or(200);
        let ok = template
            .download(&self.client, None, &packed, min_size, MissingAction::Ignore, &ctx)
            .await?;
        if !ok {
            return Ok(None);
        }

        let unpacked = packed.with_extension("");
        decompress_bz2(&packed, &unpacked)?;
        let grid = self.decoder.decode_grid(&unpacked)?;

        match table {
            Some(t) => {
                let flat: Vec<f32> = grid.data.iter().copied().collect();
                let data = t.apply(&flat)?;
                let transform = tellus_common::geo::GeoTransform::new(
                    t.lons[0] - (t.lons[1] - t.lons[0]) / 2.0,
                    t.lats[0] - (t.lats[1] - t.lats[0]) / 2.0,
                    t.lons[1] - t.lons[0],
                    t.lats[1] - t.lats[0],
                );
                Ok(Some(Grid::new(data, transform, grid.crs)))
            }
            None => Ok(Some(grid)),
        }
    }

    /// stack per-step fields of the given variables into one cube and post-process it
    async fn assemble(
        &self,
        ts: &TimeStep,
        vars: &[IconVariable],
        steps: &[u32],
        bounds: &BoundingBox,
        scratch: &Path,
    ) -> Result<Option<GridStack>> {
        let missing = self.core.missing_action;
        let table = self.regrid_table(scratch).await?;

        let mut stack: Option<GridStack> = None;
        for var in vars {
            let mut fields: Vec<Grid> = Vec::with_capacity(steps.len());
            for &step in steps {
                match self.fetch_field(ts, var, step, scratch, table).await? {
                    Some(grid) => fields.push(grid),
                    None => {
                        missing.handle(data_missing(format!(
                            "{}: no {} step {:03} for run {}",
                            SOURCE, var.file_code, step, ts
                        )))?;
                        return Ok(None);
                    }
                }
            }

            let first = &fields[0];
            let (rows, cols) = (first.rows(), first.cols());
            let tr = &first.transform;
            let stack = stack.get_or_insert_with(|| {
                let lats = (0..rows).map(|r| tr.y0 + tr.dy * (r as f64 + 0.5)).collect();
                let lons = (0..cols).map(|c| tr.x0 + tr.dx * (c as f64 + 0.5)).collect();
                let mut s = GridStack::new(vec![ts.start(); steps.len()], lats, lons);
                s.crs = first.crs.clone();
                s
            });

            let mut cube = Array3::zeros((steps.len(), rows, cols));
            for (i, mut field) in fields.into_iter().enumerate() {
                if var.k_to_c {
                    field.data.mapv_inplace(|v| v - 273.15);
                }
                cube.index_axis_mut(Axis(0), i).assign(&field.data);
            }
            stack.add_var(var.name, cube)?;
            stack.set_unit(var.name, var.unit);
        }

        match stack {
            Some(s) => Ok(Some(forecast::postprocess(s, ts.start(), steps, bounds)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Downloader for IconDownloader {
    fn core(&self) -> &DownloaderCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut DownloaderCore {
        &mut self.core
    }

    fn default_options(&self) -> OptionMap {
        let mut m = OptionMap::new();
        m.insert("variables".to_string(), json!(["t_2m", "tot_prec", "u_10m", "v_10m"]));
        m.insert("base_url".to_string(), Value::from(DEFAULT_BASE));
        m.insert("step_interval".to_string(), Value::Null);
        m.insert("regrid_url".to_string(), Value::Null);
        m.insert("separate_vars".to_string(), Value::from(false));
        m.insert("min_size".to_string(), Value::from(200));
        m
    }

    fn freq(&self) -> Result<Freq> {
        Ok(Freq::issue_hours(self.product.issue_hours))
    }

    fn separate_vars(&self) -> bool {
        self.core.opt_bool("separate_vars")
    }

    fn set_variables(&mut self, vars: Vec<String>) -> Result<()> {
        for v in &vars {
            if lookup_variable(v).is_none() {
                return Err(config_error(format!("{}: unknown variable {}", SOURCE, v)));
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
        active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>> {
        let vars = match active_var {
            Some(name) => vec![lookup_variable(name)
                .ok_or_else(|| config_error(format!("{}: unknown variable {}", SOURCE, name)))?],
            None => self.resolved_variables()?,
        };
        let steps = self.forecast_steps(ts);
        if steps.is_empty() {
            self.core
                .missing_action
                .handle(data_missing(format!("{}: empty step set for run {}", SOURCE, ts)))?;
            return Ok(stream::iter(Vec::new()).boxed());
        }
        debug!("{}: run {} -> steps 1..{}", SOURCE, ts, steps.len());

        let items: Vec<Result<(Payload, Tags)>> =
            match self.assemble(ts, &vars, &steps, bounds, scratch).await? {
                Some(stack) => {
                    let tags = match active_var {
                        Some(name) => Tags::variable(name),
                        None => Tags::none(),
                    };
                    vec![Ok((Payload::Stack(stack), tags))]
                }
                None => Vec::new(),
            };
        Ok(stream::iter(items).boxed())
    }

    /// walk back over recent runs probing the first step file of the first variable
    async fn last_published_ts(&self) -> Result<Option<TimeStep>> {
        let base = self.base_url();
        if !base.starts_with("http") {
            return Ok(None);
        }
        let vars = self.resolved_variables()?;
        let var = match vars.first() {
            Some(v) => v.clone(),
            None => return Ok(None),
        };
        let template = UrlTemplate::parse(&format!("{}/{}", base, self.product.path_template))?;

        let freq = self.freq()?;
        let mut ts = TimeStep::of(Utc::now(), &freq);
        for _ in 0..8 {
            let ctx = TemplateCtx::for_step(&ts)
                .with("var", var.dir_name)
                .with("VAR", var.file_code)
                .with("step", format!("{:03}", self.product.step_interval));
            if let Ok(status) = head_status(&self.client, &template.format(&ctx), None).await {
                if status.is_success() {
                    return Ok(Some(ts));
                }
            }
            ts = ts.pred();
        }
        Ok(None)
    }
}

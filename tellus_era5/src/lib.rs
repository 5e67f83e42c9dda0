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

///! downloader for ERA5 / ERA5-Land reanalysis through the CDS API. One monthly retrieval
///! covers the timestep (plus one day for accumulated fields), final fields are fused with
///! the experimental stream, and the hourly cube is reduced to the configured inner
///! aggregation timesteps

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tellus_common::geo::{BoundingBox, Crs};
use tellus_common::timestep::{expand, Freq, TimeRange, TimeStep};
use tellus_download::{
    config_error, corrupt_payload, silent_corruption, ApiClient, ApiDownloader, Downloader,
    DownloaderCore, MissingAction, OptionMap, PayloadStream, Result, Tags,
};
use tellus_raster::decode::GeoTiffDecoder;
use tellus_raster::{AggMethod, Grid, GridStack, Payload, RasterDecoder};

pub mod cds;
pub use cds::CdsClient;

pub const SOURCE: &str = "era5";

const KELVIN_OFFSET: f32 = 273.15;

/// per-variable retrieval metadata: the CDS request name, the cube key the decoder emits,
/// and the fixups the raw field needs. Accumulated fields are requested one day long and
/// get their end-of-window stamps shifted back to the window start
#[derive(Debug, Clone)]
struct Era5Variable {
    name: &'static str,
    short: &'static str,
    unit: &'static str,
    scale: f32,
    accum: bool,
    k_to_c: bool,
}

fn lookup_variable(name: &str) -> Option<Era5Variable> {
    let v = match name.to_lowercase().as_str() {
        "2m_temperature" => Era5Variable {
            name: "2m_temperature", short: "t2m", unit: "degC",
            scale: 1.0, accum: false, k_to_c: true,
        },
        "2m_dewpoint_temperature" => Era5Variable {
            name: "2m_dewpoint_temperature", short: "d2m", unit: "degC",
            scale: 1.0, accum: false, k_to_c: true,
        },
        "total_precipitation" => Era5Variable {
            name: "total_precipitation", short: "tp", unit: "mm",
            scale: 1000.0, accum: true, k_to_c: false,
        },
        "snowfall" => Era5Variable {
            name: "snowfall", short: "sf", unit: "mm",
            scale: 1000.0, accum: true, k_to_c: false,
        },
        "volumetric_soil_water_layer_1" => Era5Variable {
            name: "volumetric_soil_water_layer_1", short: "swvl1", unit: "m3 m-3",
            scale: 1.0, accum: false, k_to_c: false,
        },
        "10m_u_component_of_wind" => Era5Variable {
            name: "10m_u_component_of_wind", short: "u10", unit: "m s-1",
            scale: 1.0, accum: false, k_to_c: false,
        },
        "10m_v_component_of_wind" => Era5Variable {
            name: "10m_v_component_of_wind", short: "v10", unit: "m s-1",
            scale: 1.0, accum: false, k_to_c: false,
        },
        _ => return None,
    };
    Some(v)
}

pub fn available_products() -> &'static [&'static str] {
    &["reanalysis-era5-land", "reanalysis-era5-single-levels"]
}

pub struct Era5Downloader {
    core: DownloaderCore,
    product: String,
    /// built from CDSAPI_URL / CDSAPI_KEY on first use; tests inject their own
    api: OnceLock<ApiDownloader<Box<dyn ApiClient>>>,
    decoder: Box<dyn RasterDecoder>,
}

impl Era5Downloader {
    pub fn new(product: &str) -> Result<Era5Downloader> {
        if !available_products().contains(&product) {
            return Err(config_error(format!("{}: unknown product {}", SOURCE, product)));
        }
        Ok(Era5Downloader {
            core: DownloaderCore::new(SOURCE),
            product: product.to_string(),
            api: OnceLock::new(),
            decoder: Box::new(GeoTiffDecoder),
        })
    }

    pub fn from_spec(args: &OptionMap) -> Result<Box<dyn Downloader>> {
        let product = args
            .get("product")
            .and_then(|v| v.as_str())
            .unwrap_or("reanalysis-era5-land");
        Ok(Box::new(Era5Downloader::new(product)?))
    }

    /// replace the retrieval client (defaults to the CDS client from the environment)
    pub fn set_client(&mut self, client: Box<dyn ApiClient>) {
        let _ = self.api.set(ApiDownloader::new(client));
    }

    /// inject the binary-format decoder for the retrieved files
    pub fn set_decoder(&mut self, decoder: Box<dyn RasterDecoder>) {
        self.decoder = decoder;
    }

    fn api(&self) -> Result<&ApiDownloader<Box<dyn ApiClient>>> {
        if self.api.get().is_none() {
            let client = CdsClient::from_env()?;
            let _ = self.api.set(ApiDownloader::new(Box::new(client) as Box<dyn ApiClient>));
        }
        Ok(self.api.get().unwrap())
    }

    fn resolved_variables(&self) -> Result<Vec<Era5Variable>> {
        self.core
            .variables
            .iter()
            .map(|n| {
                lookup_variable(n)
                    .ok_or_else(|| config_error(format!("{}: unknown variable {}", SOURCE, n)))
            })
            .collect()
    }

    /// `agg_method` is either one list for all variables or one list per variable
    fn agg_lists(&self, n_vars: usize) -> Result<Vec<Vec<AggMethod>>> {
        let value = self.core.options.get("agg_method").cloned().unwrap_or(Value::Null);
        let parse_one = |v: &Value| -> Result<AggMethod> {
            v.as_str()
                .ok_or_else(|| config_error(format!("{}: bad agg_method {}", SOURCE, v)))?
                .parse::<AggMethod>()
                .map_err(|e| config_error(e))
        };

        let lists: Vec<Vec<AggMethod>> = match &value {
            Value::Null => vec![vec![AggMethod::Mean]],
            Value::String(_) => vec![vec![parse_one(&value)?]],
            Value::Array(items) if items.iter().all(|i| i.is_string()) => {
                vec![items.iter().map(parse_one).collect::<Result<Vec<_>>>()?]
            }
            Value::Array(items) => items
                .iter()
                .map(|inner| match inner {
                    Value::Array(ms) => ms.iter().map(parse_one).collect(),
                    one => Ok(vec![parse_one(one)?]),
                })
                .collect::<Result<Vec<_>>>()?,
            other => return Err(config_error(format!("{}: bad agg_method {}", SOURCE, other))),
        };

        // a single list fans out to every variable
        if lists.len() == 1 && n_vars > 1 {
            return Ok(vec![lists[0].clone(); n_vars]);
        }
        if lists.len() != n_vars {
            return Err(config_error(format!(
                "{}: {} agg_method lists for {} variables",
                SOURCE, lists.len(), n_vars
            )));
        }
        Ok(lists)
    }

    fn inner_freq(&self) -> Result<Option<Freq>> {
        match self.core.options.get("ts_per_year_agg").and_then(|v| v.as_u64()) {
            Some(n) => Ok(Some(Freq::from_ts_per_year(n as u32)?)),
            None => Ok(None),
        }
    }

    fn build_request(&self, ts: &TimeStep, bounds: &BoundingBox, vars: &[Era5Variable], expver: &str) -> Result<Value> {
        let has_accum = vars.iter().any(|v| v.accum);
        let start = ts.start().date_naive();
        let mut end = ts.end().date_naive();
        if has_accum {
            // accumulated fields are stamped at window end - the last day needs the first
            // hours of the next one
            end = end.succ_opt().unwrap_or(end);
        }

        let bb = bounds.transform(&Crs::wgs84())?;
        let names: Vec<&str> = vars.iter().map(|v| v.name).collect();
        let times: Vec<String> = (0..24).map(|h| format!("{:02}:00", h)).collect();

        Ok(json!({
            "product": self.product,
            "variable": names,
            "date": format!("{}/{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d")),
            "time": times,
            "area": [bb.north, bb.west, bb.south, bb.east],
            "format": "grib",
            "expver": expver,
        }))
    }

    /// pull one variable out of the decoded cube as a standalone single-var stack
    fn extract_var(&self, stack: &GridStack, var: &Era5Variable) -> Result<GridStack> {
        let key = if stack.vars.contains_key(var.short) { var.short } else { var.name };
        let cube = stack.vars.get(key).ok_or_else(|| {
            corrupt_payload(format!("{}: retrieved file lacks {}", SOURCE, var.name))
        })?;

        let mut sub = GridStack::new(stack.times.clone(), stack.lats.clone(), stack.lons.clone());
        sub.crs = stack.crs.clone();
        sub.add_var(var.short, cube.clone())?;
        Ok(sub)
    }

    /// unit fixes and the accumulation stamp shift, in place
    fn normalize_var(&self, sub: &mut GridStack, var: &Era5Variable) {
        if let Some(cube) = sub.vars.get_mut(var.short) {
            if var.k_to_c {
                cube.mapv_inplace(|v| v - KELVIN_OFFSET);
            }
            if var.scale != 1.0 {
                cube.mapv_inplace(|v| v * var.scale);
            }
        }
        if var.accum {
            for t in &mut sub.times {
                *t = *t - Duration::hours(1);
            }
        }
        sub.set_unit(var.short, var.unit);
    }
}

/// the first calendar day of the step window whose slices are entirely NaN - a sign the
/// server silently served an empty field
fn find_all_nan_day(sub: &GridStack, key: &str, ts: &TimeStep) -> Option<NaiveDate> {
    let cube = sub.vars.get(key)?;
    let mut day = ts.start().date_naive();
    let last = ts.end().date_naive();
    while day <= last {
        let idxs: Vec<usize> = sub
            .times
            .iter()
            .enumerate()
            .filter(|(_, t)| t.date_naive() == day)
            .map(|(i, _)| i)
            .collect();
        if !idxs.is_empty()
            && idxs.iter().all(|&i| {
                cube.index_axis(ndarray::Axis(0), i).iter().all(|v| v.is_nan())
            })
        {
            return Some(day);
        }
        day = day.succ_opt()?;
    }
    None
}

#[async_trait]
impl Downloader for Era5Downloader {
    fn core(&self) -> &DownloaderCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut DownloaderCore {
        &mut self.core
    }

    fn default_options(&self) -> OptionMap {
        let mut m = OptionMap::new();
        m.insert("variables".to_string(), json!(["2m_temperature"]));
        m.insert("agg_method".to_string(), json!([["mean"]]));
        m.insert("ts_per_year_agg".to_string(), Value::from(365));
        m.insert("fuse_experimental".to_string(), Value::from(true));
        m.insert("min_size".to_string(), Value::from(1000));
        m
    }

    fn freq(&self) -> Result<Freq> {
        Ok(Freq::Monthly)
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
        _active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>> {
        let vars = self.resolved_variables()?;
        let aggs = self.agg_lists(vars.len())?;
        let missing = self.core.missing_action;
        let min_size = self.core.opt_u64("min_size").unwrap_or(1000);
        let api = self.api()?;

        let request = self.build_request(ts, bounds, &vars, "1")?;
        let dest = scratch.join("era5_final.grib");
        if !api.download(&request, &dest, min_size, missing).await? {
            return Ok(stream::iter(Vec::new()).boxed());
        }
        let final_stack = self.decoder.decode_stack(&dest)?;

        // the experimental stream backfills cells the final release does not have yet
        let exp_stack = if self.core.opt_bool("fuse_experimental") {
            let exp_request = self.build_request(ts, bounds, &vars, "5")?;
            let exp_dest = scratch.join("era5_exp.grib");
            if api.download(&exp_request, &exp_dest, min_size, MissingAction::Ignore).await? {
                Some(self.decoder.decode_stack(&exp_dest)?)
            } else {
                None
            }
        } else {
            None
        };

        let bb = bounds.transform(&final_stack.crs)?;
        let inner_freq = self.inner_freq()?;

        let mut items: Vec<Result<(Payload, Tags)>> = Vec::new();
        for (var, methods) in vars.iter().zip(&aggs) {
            let mut sub = self.extract_var(&final_stack, var)?;

            if let Some(exp) = &exp_stack {
                match self.extract_var(exp, var) {
                    Ok(exp_sub) => {
                        if let Err(e) = sub.fuse_var(var.short, &exp_sub) {
                            debug!("{}: cannot fuse {} with experimental: {}", SOURCE, var.name, e);
                        }
                    }
                    Err(e) => debug!("{}: no experimental {}: {}", SOURCE, var.name, e),
                }
            }

            self.normalize_var(&mut sub, var);

            if let Some(day) = find_all_nan_day(&sub, var.short, ts) {
                return Err(silent_corruption(format!(
                    "{}: {} is entirely NaN on {}", SOURCE, var.name, day
                )));
            }

            let sub = sub.crop_to_bb(&bb)?;
            let inner_steps = match &inner_freq {
                Some(f) => expand(&TimeRange::new(ts.start(), ts.end()), f),
                None => vec![ts.clone()],
            };

            for inner in inner_steps {
                let idxs = sub.time_indices(&inner);
                if idxs.is_empty() {
                    continue;
                }
                for method in methods {
                    let data = sub.reduce(var.short, &idxs, *method)?;
                    let grid = Grid::new(data, sub.transform()?, sub.crs.clone());
                    let tags = Tags::variable(var.name)
                        .with_agg(method.name())
                        .with_timestep(inner.clone());
                    items.push(Ok((Payload::Grid(grid), tags)));
                }
            }
            info!("{}: {} reduced to {} inner payloads", SOURCE, var.name, items.len());
        }

        Ok(stream::iter(items).boxed())
    }
}

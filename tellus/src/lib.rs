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

///! the unified retrieval layer: every concrete source registered under its identifier,
///! plus the factory that turns one JSON request document into a configured downloader

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde_json::Value;

use tellus_download::{config_error, DestSink, OptionMap, Result};

pub mod request;
pub use request::{bounds_from_spec, load_request, time_range_from_spec};

pub use tellus_download::{DownloadReport, Downloader, TellusError};

type SpecCtor = fn(&OptionMap) -> Result<Box<dyn Downloader>>;

lazy_static! {
    /// source identifier -> constructor; populated once, read-only afterwards
    static ref REGISTRY: HashMap<&'static str, SpecCtor> = {
        let mut m: HashMap<&'static str, SpecCtor> = HashMap::new();
        m.insert(tellus_chirps::SOURCE, tellus_chirps::ChirpsDownloader::from_spec);
        m.insert(tellus_era5::SOURCE, tellus_era5::Era5Downloader::from_spec);
        m.insert(tellus_viirs::SOURCE, tellus_viirs::ViirsDownloader::from_spec);
        m.insert(tellus_icon::SOURCE, tellus_icon::IconDownloader::from_spec);
        m.insert(tellus_drops::SOURCE, tellus_drops::DropsDownloader::from_spec);
        m
    };
}

pub fn available_sources() -> Vec<&'static str> {
    let mut v: Vec<&'static str> = REGISTRY.keys().copied().collect();
    v.sort();
    v
}

/// instantiate a registered source (case-insensitive) from its remaining spec arguments
pub fn from_source(source: &str, args: &OptionMap) -> Result<Box<dyn Downloader>> {
    let key = source.to_lowercase();
    let ctor = REGISTRY
        .get(key.as_str())
        .ok_or_else(|| config_error(format!("unknown source {}", source)))?;
    ctor(args)
}

/// build a ready-to-run downloader from a request document. A bare string selects the
/// source with defaults; an object carries the reserved keys `bounds`, `destination` and
/// `options`, which are applied after construction - everything else goes to the source
/// constructor
pub fn from_options(spec: &Value) -> Result<Box<dyn Downloader>> {
    match spec {
        Value::String(source) => {
            let mut dl = from_source(source, &OptionMap::new())?;
            dl.set_options(OptionMap::new())?;
            Ok(dl)
        }
        Value::Object(map) => {
            let mut args = map.clone();
            let source = args
                .remove("source")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| config_error("request document without a source"))?;

            let bounds = args.remove("bounds");
            let destination = args.remove("destination");
            let options = args.remove("options");

            let mut dl = from_source(&source, &args)?;

            let options: OptionMap = match options {
                Some(Value::Object(m)) => m,
                Some(other) => {
                    return Err(config_error(format!("invalid options {}", other)));
                }
                None => OptionMap::new(),
            };
            dl.set_options(options)?;

            if let Some(b) = bounds {
                dl.set_bounds(bounds_from_spec(&b)?);
            }
            if let Some(d) = destination {
                dl.set_destination(DestSink::from_spec(&d)?);
            }
            Ok(dl)
        }
        other => Err(config_error(format!("invalid downloader spec {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_source() {
        assert_eq!(available_sources(), vec!["chirps", "drops2", "era5", "icon", "viirs"]);

        // lookup is case-insensitive and the instance reports its own key
        for name in ["CHIRPS", "chirps", "Era5", "VIIRS", "icon", "DROPS2"] {
            let dl = from_options(&Value::String(name.to_string())).unwrap();
            assert_eq!(dl.core().source, name.to_lowercase());
        }
    }

    #[test]
    fn unknown_source_is_config_error() {
        let res = from_options(&serde_json::json!({"source": "gpm-imerg"}));
        assert!(matches!(res, Err(TellusError::ConfigError(_))));
        assert!(from_options(&Value::from(42)).is_err());
    }
}

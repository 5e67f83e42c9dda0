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

///! downloader for DROPS2 in-situ sensor networks. Per hourly timestep the sensor registry
///! is queried inside the bounding box, then a reading window ending at the timestep (with
///! a spin-up extension against late-arriving reports) becomes one wide station table per
///! sensor class

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use tellus_common::geo::{BoundingBox, Crs};
use tellus_common::strings::mk_string;
use tellus_common::timestep::{Freq, TimeStep};
use tellus_download::credentials::{get_credentials, CredentialRequest};
use tellus_download::{
    config_error, data_missing, Downloader, DownloaderCore, OptionMap, PayloadStream, Result,
    Tags, TellusError,
};
use tellus_raster::table::StationRecord;
use tellus_raster::{Payload, StationTable};

pub const SOURCE: &str = "drops2";

const DEFAULT_BASE: &str = "https://drops2.cimafoundation.org/dds/rest";
const DEFAULT_SENTINELS: &[f64] = &[-9998.0, -9999.0];

pub const SENSOR_CLASSES: &[&str] =
    &["PLUVIOMETER", "THERMOMETER", "HYGROMETER", "ANEMOMETER", "RADIOMETER"];

#[derive(Debug, Clone, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// the narrow service contract: list the stations of a sensor class inside a box, then
/// fetch their reading series over a window. Tests plug in synthetic services
#[async_trait]
pub trait DropsService: Send + Sync {
    async fn list_sensors(&self, class: &str, bbox: (f64, f64, f64, f64)) -> Result<Vec<Sensor>>;

    async fn readings(
        &self,
        class: &str,
        ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<f64>>>;
}

/* #region http service ******************************************************************************/

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// the REST service: one login per session, bearer token on every query
pub struct HttpDropsService {
    client: Client,
    base_url: String,
    explicit: Option<(String, String)>,
    token: tokio::sync::OnceCell<String>,
}

impl HttpDropsService {
    pub fn new(base_url: &str, explicit: Option<(String, String)>) -> HttpDropsService {
        HttpDropsService {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            explicit,
            token: tokio::sync::OnceCell::new(),
        }
    }

    async fn token(&self) -> Result<&str> {
        self.token
            .get_or_try_init(|| async {
                let req = CredentialRequest {
                    source: SOURCE,
                    env_user: "DROPS2_LOGIN",
                    env_password: "DROPS2_PWD",
                    url: &self.base_url,
                    test_url: None,
                    encode: false,
                    explicit: self.explicit.clone(),
                };
                let auth = get_credentials(&self.client, &req).await?;
                let (user, password) = auth.user_password().ok_or_else(|| {
                    TellusError::MissingCredentials(format!("{}: need a cleartext pair", SOURCE))
                })?;

                let response = self
                    .client
                    .post(format!("{}/auth/login", self.base_url))
                    .json(&json!({"user": user, "password": password}))
                    .send()
                    .await
                    .map_err(|e| TellusError::TransferError(e.to_string()))?;
                if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                    return Err(TellusError::AuthError(format!("{} refused the login", self.base_url)));
                }
                let login: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| TellusError::TransferError(e.to_string()))?;
                Ok(login.access_token)
            })
            .await
            .map(String::as_str)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TellusError::TransferError(e.to_string()))?;
        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(TellusError::AuthError(format!("{} rejected the session token", url)))
            }
            s if s.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| TellusError::TransferError(e.to_string())),
            other => Err(TellusError::TransferError(format!("{} returned {}", url, other))),
        }
    }
}

#[async_trait]
impl DropsService for HttpDropsService {
    async fn list_sensors(&self, class: &str, bbox: (f64, f64, f64, f64)) -> Result<Vec<Sensor>> {
        let (w, s, e, n) = bbox;
        let url = format!(
            "{}/sensors/{}?lonmin={}&latmin={}&lonmax={}&latmax={}",
            self.base_url, class, w, s, e, n
        );
        self.get_json(&url).await
    }

    async fn readings(
        &self,
        class: &str,
        ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<f64>>> {
        let url = format!(
            "{}/sensors/data/{}?from={}&to={}&ids={}",
            self.base_url,
            class,
            from.format("%Y%m%d%H%M"),
            to.format("%Y%m%d%H%M"),
            mk_string(ids, ",")
        );
        self.get_json(&url).await
    }
}

/* #endregion http service */

pub struct DropsDownloader {
    core: DownloaderCore,
    service: OnceLock<Box<dyn DropsService>>,
}

impl DropsDownloader {
    pub fn new() -> DropsDownloader {
        DropsDownloader { core: DownloaderCore::new(SOURCE), service: OnceLock::new() }
    }

    pub fn from_spec(_args: &OptionMap) -> Result<Box<dyn Downloader>> {
        Ok(Box::new(DropsDownloader::new()))
    }

    pub fn set_service(&mut self, service: Box<dyn DropsService>) {
        let _ = self.service.set(service);
    }

    fn service(&self) -> &dyn DropsService {
        self.service
            .get_or_init(|| {
                let base = self.core.opt_str("base_url").unwrap_or(DEFAULT_BASE).to_string();
                let explicit = match (self.core.opt_str("username"), self.core.opt_str("password")) {
                    (Some(u), Some(p)) => Some((u.to_string(), p.to_string())),
                    _ => None,
                };
                Box::new(HttpDropsService::new(&base, explicit))
            })
            .as_ref()
    }

    fn sentinels(&self) -> Vec<f64> {
        self.core
            .options
            .get("sentinels")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|x| x.as_f64()).collect())
            .unwrap_or_else(|| DEFAULT_SENTINELS.to_vec())
    }
}

impl Default for DropsDownloader {
    fn default() -> Self {
        DropsDownloader::new()
    }
}

#[async_trait]
impl Downloader for DropsDownloader {
    fn core(&self) -> &DownloaderCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut DownloaderCore {
        &mut self.core
    }

    fn default_options(&self) -> OptionMap {
        let mut m = OptionMap::new();
        m.insert("variables".to_string(), json!(["PLUVIOMETER"]));
        m.insert("base_url".to_string(), Value::from(DEFAULT_BASE));
        m.insert("username".to_string(), Value::Null);
        m.insert("password".to_string(), Value::Null);
        m.insert("spinup_minutes".to_string(), Value::from(30));
        m.insert("sentinels".to_string(), json!(DEFAULT_SENTINELS));
        m
    }

    fn freq(&self) -> Result<Freq> {
        Ok(Freq::Hourly)
    }

    /// one outer pass per sensor class
    fn separate_vars(&self) -> bool {
        true
    }

    fn set_variables(&mut self, vars: Vec<String>) -> Result<()> {
        for v in &vars {
            if !SENSOR_CLASSES.contains(&v.as_str()) {
                return Err(config_error(format!("{}: unknown sensor class {}", SOURCE, v)));
            }
        }
        self.core.variables = vars;
        Ok(())
    }

    async fn get_data_ts<'a>(
        &'a self,
        ts: &'a TimeStep,
        bounds: &'a BoundingBox,
        _scratch: &'a Path,
        active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>> {
        let class = active_var
            .ok_or_else(|| config_error(format!("{}: no sensor class selected", SOURCE)))?;
        let missing = self.core.missing_action;

        let bb = bounds.transform(&Crs::wgs84())?;
        let sensors = self.service().list_sensors(class, bb.wsen()).await?;
        if sensors.is_empty() {
            missing.handle(data_missing(format!(
                "{}: no {} stations inside {}", SOURCE, class, bb
            )))?;
            return Ok(stream::iter(Vec::new()).boxed());
        }
        debug!("{}: {} {} stations for {}", SOURCE, sensors.len(), class, ts);

        let spinup = self.core.opt_u64("spinup_minutes").unwrap_or(30) as i64;
        let from = ts.start() - Duration::minutes(spinup);
        let ids: Vec<String> = sensors.iter().map(|s| s.id.clone()).collect();
        let mut series = self.service().readings(class, &ids, from, ts.end()).await?;

        let mut table = StationTable::new(class);
        for sensor in sensors {
            if let Some(values) = series.remove(&sensor.id) {
                table.rows.push(StationRecord {
                    id: sensor.id,
                    name: sensor.name,
                    lat: sensor.lat,
                    lon: sensor.lon,
                    values,
                });
            }
        }
        table.drop_sentinels(&self.sentinels());
        table.drop_all_nan_stations();
        table.sort_by_id();

        if table.is_empty() {
            missing.handle(data_missing(format!(
                "{}: {} stations reported nothing usable for {}", SOURCE, class, ts
            )))?;
            return Ok(stream::iter(Vec::new()).boxed());
        }

        info!("{}: {} rows of {} for {}", SOURCE, table.len(), class, ts);
        let items = vec![Ok((Payload::Table(table), Tags::variable(class)))];
        Ok(stream::iter(items).boxed())
    }
}

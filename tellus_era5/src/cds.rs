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

///! the Climate Data Store retrieval client: submit a request, poll the task until it
///! completes, fetch the result file. One `retrieve` is one blocking CDS round trip

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use tellus_common::datetime::secs;
use tellus_common::net::{download_http, Auth};
use tellus_download::{ApiClient, Result, TellusError};

const DEFAULT_API_URL: &str = "https://cds.climate.copernicus.eu/api/v2";
const POLL_INTERVAL: Duration = secs(2);
const MAX_POLLS: usize = 900;

#[derive(Debug, Deserialize)]
struct TaskState {
    state: String,
    request_id: Option<String>,
    location: Option<String>,
    error: Option<Value>,
}

pub struct CdsClient {
    client: Client,
    api_url: String,
    auth: Auth,
}

impl CdsClient {
    /// configured through CDSAPI_URL / CDSAPI_KEY, the key in the usual "uid:secret" form
    pub fn from_env() -> Result<CdsClient> {
        let api_url =
            std::env::var("CDSAPI_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let key = std::env::var("CDSAPI_KEY").map_err(|_| {
            TellusError::MissingCredentials("set CDSAPI_KEY to uid:secret".to_string())
        })?;
        let (uid, secret) = key.split_once(':').ok_or_else(|| {
            TellusError::MissingCredentials("CDSAPI_KEY must look like uid:secret".to_string())
        })?;
        Ok(CdsClient {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            auth: Auth::basic(uid, secret),
        })
    }

    async fn get_state(&self, url: &str) -> Result<TaskState> {
        let (user, password) = self.auth.user_password().unwrap();
        let response = self
            .client
            .get(url)
            .basic_auth(user, Some(password))
            .send()
            .await
            .map_err(|e| TellusError::TransferError(e.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(TellusError::AuthError(format!("{} refused the CDS key", url)))
            }
            s if s.is_success() => response
                .json::<TaskState>()
                .await
                .map_err(|e| TellusError::TransferError(e.to_string())),
            other => Err(TellusError::TransferError(format!("{} returned {}", url, other))),
        }
    }
}

#[async_trait]
impl ApiClient for CdsClient {
    /// `request` carries a `product` field naming the dataset; the rest is passed through
    /// to the CDS verbatim
    async fn retrieve(&self, request: &Value, dest: &Path) -> Result<()> {
        let mut body = request.clone();
        let product = body
            .as_object_mut()
            .and_then(|m| m.remove("product"))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| TellusError::ConfigError("cds request without product".to_string()))?;

        let submit_url = format!("{}/resources/{}", self.api_url, product);
        let (user, password) = self.auth.user_password().unwrap();
        let response = self
            .client
            .post(&submit_url)
            .basic_auth(user, Some(password))
            .json(&body)
            .send()
            .await
            .map_err(|e| TellusError::TransferError(e.to_string()))?;

        let mut state: TaskState = match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(TellusError::AuthError(format!("{} refused the CDS key", submit_url)));
            }
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| TellusError::TransferError(e.to_string()))?,
            other => {
                return Err(TellusError::TransferError(format!("{} returned {}", submit_url, other)));
            }
        };

        let mut polls = 0;
        while state.state == "queued" || state.state == "running" {
            if polls >= MAX_POLLS {
                return Err(TellusError::TransferError(format!("{} task timed out", product)));
            }
            polls += 1;
            tokio::time::sleep(POLL_INTERVAL).await;

            let id = state.request_id.clone().ok_or_else(|| {
                TellusError::TransferError(format!("{} task without request id", product))
            })?;
            state = self.get_state(&format!("{}/tasks/{}", self.api_url, id)).await?;
            debug!("cds task {} is {}", id, state.state);
        }

        if state.state != "completed" {
            return Err(TellusError::TransferError(format!(
                "{} task ended in state {}: {:?}",
                product, state.state, state.error
            )));
        }
        let location = state.location.ok_or_else(|| {
            TellusError::TransferError(format!("{} completed without a result location", product))
        })?;

        download_http(&self.client, &location, Some(&self.auth), dest)
            .await
            .map_err(TellusError::from)?;
        Ok(())
    }
}

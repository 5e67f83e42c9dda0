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

///! the granule catalogue seam. The real implementation pages through the Common Metadata
///! Repository with scroll ids; tests plug in a static listing

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use tellus_download::{Result, TellusError};

const PAGE_SIZE: usize = 2000;
const SCROLL_ID_HEADER: &str = "CMR-Scroll-Id";

/// one catalogue lookup: a product at a version over a space-time window
#[derive(Debug, Clone)]
pub struct GranuleQuery {
    pub short_name: String,
    pub version: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// (W, S, E, N) in geographic coordinates
    pub bbox: (f64, f64, f64, f64),
}

#[async_trait]
pub trait GranuleCatalog: Send + Sync {
    /// the download URLs of every granule matching the query, in catalogue order
    async fn granules(&self, query: &GranuleQuery) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct CmrResponse {
    feed: CmrFeed,
}

#[derive(Debug, Deserialize)]
struct CmrFeed {
    #[serde(default)]
    entry: Vec<CmrEntry>,
}

#[derive(Debug, Deserialize)]
struct CmrEntry {
    #[serde(default)]
    links: Vec<CmrLink>,
}

#[derive(Debug, Deserialize)]
struct CmrLink {
    #[serde(default)]
    rel: String,
    href: String,
}

pub struct CmrCatalog {
    client: Client,
    base_url: String,
}

impl CmrCatalog {
    pub fn new(base_url: &str) -> CmrCatalog {
        CmrCatalog { client: Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl GranuleCatalog for CmrCatalog {
    async fn granules(&self, query: &GranuleQuery) -> Result<Vec<String>> {
        let (w, s, e, n) = query.bbox;
        let url = format!(
            "{}/search/granules.json?short_name={}&version={}&temporal={},{}&bounding_box={},{},{},{}&page_size={}&scroll=true",
            self.base_url,
            query.short_name,
            query.version,
            query.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            query.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            w, s, e, n,
            PAGE_SIZE,
        );

        let mut urls = Vec::new();
        let mut scroll_id: Option<String> = None;

        loop {
            let mut req = self.client.get(&url);
            if let Some(id) = &scroll_id {
                req = req.header(SCROLL_ID_HEADER, id);
            }
            let response = req
                .send()
                .await
                .map_err(|e| TellusError::TransferError(e.to_string()))?;
            if !response.status().is_success() {
                return Err(TellusError::TransferError(format!(
                    "CMR returned {} for {}",
                    response.status(),
                    query.short_name
                )));
            }
            if scroll_id.is_none() {
                scroll_id = response
                    .headers()
                    .get(SCROLL_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
            }

            let page: CmrResponse = response
                .json()
                .await
                .map_err(|e| TellusError::TransferError(e.to_string()))?;
            if page.feed.entry.is_empty() {
                break;
            }
            for entry in &page.feed.entry {
                for link in &entry.links {
                    if link.rel.ends_with("/data#") {
                        urls.push(link.href.clone());
                    }
                }
            }
            if scroll_id.is_none() {
                break; // server did not hand out a scroll session
            }
        }

        debug!("CMR listed {} granules for {} v{}", urls.len(), query.short_name, query.version);
        Ok(urls)
    }
}

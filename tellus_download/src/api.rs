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

///! retrieval through an opaque API client. The request dict passes through untouched -
///! the same gate/policy envelope as URL retrieval applies to whatever the client stores

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::integrity;
use crate::{MissingAction, Result, TellusError};

/// the narrow contract a domain API library has to fulfil: send one request, store the
/// result under `dest`
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn retrieve(&self, request: &serde_json::Value, dest: &Path) -> Result<()>;
}

#[async_trait]
impl<T: ApiClient + ?Sized> ApiClient for Box<T> {
    async fn retrieve(&self, request: &serde_json::Value, dest: &Path) -> Result<()> {
        (**self).retrieve(request, dest).await
    }
}

/// gate/policy envelope around an ApiClient
pub struct ApiDownloader<C: ApiClient> {
    pub client: C,
}

impl<C: ApiClient> ApiDownloader<C> {
    pub fn new(client: C) -> Self {
        ApiDownloader { client }
    }

    /// send the request; client exceptions and gate failures route through `missing`,
    /// auth refusal stays hard
    pub async fn download(
        &self,
        request: &serde_json::Value,
        dest: &Path,
        min_size: u64,
        missing: MissingAction,
    ) -> Result<bool> {
        // a result file from an earlier attempt that already passes the gate is not re-fetched
        if integrity::gate(dest, min_size).is_ok() {
            debug!("already retrieved {:?}", dest);
            return Ok(true);
        }
        debug!("api retrieve -> {:?}", dest);

        if let Err(e) = self.client.retrieve(request, dest).await {
            if e.is_fatal() {
                return Err(e);
            }
            missing.handle(e)?;
            return Ok(false);
        }

        if let Err(e) = integrity::gate(dest, min_size) {
            missing.handle(e)?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FileClient {
        payload: Option<Vec<u8>>,
    }

    #[async_trait]
    impl ApiClient for FileClient {
        async fn retrieve(&self, _request: &serde_json::Value, dest: &Path) -> Result<()> {
            match &self.payload {
                Some(bytes) => {
                    std::fs::write(dest, bytes)?;
                    Ok(())
                }
                None => Err(TellusError::TransferError("client exception".into())),
            }
        }
    }

    #[tokio::test]
    async fn success_and_failure_paths() {
        let dir = tempfile::tempdir().unwrap();
        let req = serde_json::json!({"product": "reanalysis", "format": "grib"});

        let dest = dir.path().join("res.bin");
        let ok = ApiDownloader::new(FileClient { payload: Some(vec![0u8; 128]) });
        assert!(ok.download(&req, &dest, 64, MissingAction::Error).await.unwrap());

        // the stored result short-circuits a repeated request, even with a broken client
        let failing = ApiDownloader::new(FileClient { payload: None });
        assert!(failing.download(&req, &dest, 64, MissingAction::Error).await.unwrap());

        let dest = dir.path().join("missing.bin");
        assert!(!failing.download(&req, &dest, 64, MissingAction::Warn).await.unwrap());
        assert!(failing.download(&req, &dest, 64, MissingAction::Error).await.is_err());

        let dest = dir.path().join("small.bin");
        let small = ApiDownloader::new(FileClient { payload: Some(vec![0u8; 8]) });
        assert!(!small.download(&req, &dest, 64, MissingAction::Ignore).await.unwrap());
    }
}

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

///! URL-templated retrieval: format a template against timestep and request fields, fetch
///! through the scheme's transfer primitive, gate the artifact, route failures through the
///! missing-data policy. Fallback chains consume an ordered probe list - the first step
///! that passes the gate wins

use std::path::Path;
use std::str::FromStr;

use reqwest::Client;
use tracing::{debug, info};

use tellus_common::net::{self, Auth};
use tellus_common::timestep::TimeStep;

use crate::integrity;
use crate::{config_error, MissingAction, Result, TellusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
    Sftp,
    File,
}

impl FromStr for Scheme {
    type Err = TellusError;

    fn from_str(s: &str) -> Result<Scheme> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ftp" => Ok(Scheme::Ftp),
            "sftp" => Ok(Scheme::Sftp),
            "file" => Ok(Scheme::File),
            other => Err(config_error(format!("unknown scheme {}", other))),
        }
    }
}

/// substitution context for one retrieval: the timestep's calendar tokens plus named
/// request fields (version codes, server-side variable names, hosts)
#[derive(Debug, Clone, Default)]
pub struct TemplateCtx<'a> {
    pub ts: Option<&'a TimeStep>,
    fields: Vec<(String, String)>,
}

impl<'a> TemplateCtx<'a> {
    pub fn new() -> Self {
        TemplateCtx::default()
    }

    pub fn for_step(ts: &'a TimeStep) -> Self {
        TemplateCtx { ts: Some(ts), fields: Vec::new() }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((format!("{{{}}}", key), value.to_string()));
        self
    }

    fn apply(&self, template: &str) -> String {
        let mut s = match self.ts {
            Some(ts) => ts.format_tokens(template),
            None => template.to_string(),
        };
        for (token, value) in &self.fields {
            s = s.replace(token, value);
        }
        s
    }
}

/// a URL template bound to a transfer scheme
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    pub template: String,
    pub scheme: Scheme,
}

impl UrlTemplate {
    pub fn new(template: &str, scheme: Scheme) -> UrlTemplate {
        UrlTemplate { template: template.to_string(), scheme }
    }

    /// infer the scheme from the template prefix
    pub fn parse(template: &str) -> Result<UrlTemplate> {
        let scheme = template
            .split("://")
            .next()
            .ok_or_else(|| config_error(format!("no scheme in {}", template)))?
            .parse::<Scheme>()?;
        Ok(UrlTemplate::new(template, scheme))
    }

    pub fn format(&self, ctx: &TemplateCtx<'_>) -> String {
        ctx.apply(&self.template)
    }

    /// one probe: resolve the URL, transfer, gate. Returns Ok(true) on success; transport
    /// and gate failures are routed through `missing` and yield Ok(false). Authentication
    /// refusal is a hard error and never retried
    pub async fn download(
        &self,
        client: &Client,
        auth: Option<&Auth>,
        dest: &Path,
        min_size: u64,
        missing: MissingAction,
        ctx: &TemplateCtx<'_>,
    ) -> Result<bool> {
        let url = self.format(ctx);

        // an artifact from an earlier attempt that already passes the gate is not re-fetched
        if integrity::gate(dest, min_size).is_ok() {
            debug!("already retrieved {:?}", dest);
            return Ok(true);
        }
        debug!("retrieving {}", url);

        let fetched: std::result::Result<u64, net::NetError> = match self.scheme {
            Scheme::Http | Scheme::Https => net::download_http(client, &url, auth, dest).await,
            Scheme::File => net::download_file_url(&url, dest),
            Scheme::Ftp | Scheme::Sftp => {
                let host = net::url_host(&url)
                    .ok_or_else(|| config_error(format!("no host in {}", url)))?;
                let path = net::url_path(&url)
                    .ok_or_else(|| config_error(format!("no path in {}", url)))?;
                let auth = auth.ok_or_else(|| {
                    TellusError::MissingCredentials(format!("{} transfer needs credentials", url))
                })?;
                if self.scheme == Scheme::Ftp {
                    net::download_ftp(host, path, auth, dest).await
                } else {
                    net::download_sftp(host, path, auth, dest).await
                }
            }
        };

        if let Err(e) = fetched {
            let err: TellusError = e.into();
            if err.is_fatal() {
                return Err(err);
            }
            missing.handle(err)?;
            return Ok(false);
        }

        if let Err(e) = integrity::gate(dest, min_size) {
            missing.handle(e)?;
            return Ok(false);
        }
        Ok(true)
    }
}

/* #region fallback chains ***************************************************************************/

/// one entry of an ordered fallback list
#[derive(Debug, Clone)]
pub struct ProbeStep {
    pub template: UrlTemplate,
    pub nodata: Option<f32>,
    pub preliminary: bool,
}

impl ProbeStep {
    pub fn finalized(template: UrlTemplate, nodata: Option<f32>) -> ProbeStep {
        ProbeStep { template, nodata, preliminary: false }
    }

    pub fn preliminary(template: UrlTemplate, nodata: Option<f32>) -> ProbeStep {
        ProbeStep { template, nodata, preliminary: true }
    }
}

/// the retrieval state machine over an ordered probe list: intermediate attempts fail
/// silently, only the last one escalates through the caller's policy level
#[derive(Debug, Clone)]
pub struct ProbeChain {
    steps: Vec<ProbeStep>,
}

impl ProbeChain {
    pub fn new(steps: Vec<ProbeStep>) -> ProbeChain {
        ProbeChain { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// returns the first step whose artifact passed the gate, or None when the chain is
    /// exhausted (already routed through `missing`)
    pub async fn run(
        &self,
        client: &Client,
        auth: Option<&Auth>,
        dest: &Path,
        min_size: u64,
        missing: MissingAction,
        ctx: &TemplateCtx<'_>,
    ) -> Result<Option<&ProbeStep>> {
        let n = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            let action = if i + 1 == n { missing } else { MissingAction::Ignore };
            if step.template.download(client, auth, dest, min_size, action, ctx).await? {
                if step.preliminary {
                    info!("fell back to preliminary data for {:?}", dest);
                }
                return Ok(Some(step));
            }
        }
        Ok(None)
    }
}

/* #endregion fallback chains */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tellus_common::timestep::Freq;

    fn daily_step() -> TimeStep {
        TimeStep::of(Utc.with_ymd_and_hms(2023, 12, 30, 0, 0, 0).unwrap(), &Freq::Daily)
    }

    #[test]
    fn template_formatting() {
        let t = UrlTemplate::parse(
            "https://data.chc.ucsb.edu/products/CHIRPS-{version}/global_daily/tifs/p25/%Y/chirps-v{version}.%Y.%m.%d.tif.gz",
        )
        .unwrap();
        assert_eq!(t.scheme, Scheme::Https);

        let ts = daily_step();
        let ctx = TemplateCtx::for_step(&ts).with("version", "2.0");
        assert_eq!(
            t.format(&ctx),
            "https://data.chc.ucsb.edu/products/CHIRPS-2.0/global_daily/tifs/p25/2023/chirps-v2.0.2023.12.30.tif.gz"
        );
    }

    #[tokio::test]
    async fn chain_prefers_final_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let prelim_src = dir.path().join("prelim_20231230.bin");
        std::fs::write(&prelim_src, vec![0u8; 64]).unwrap();

        let final_t = UrlTemplate::new(
            &format!("file://{}/final_%Y%m%d.bin", dir.path().display()),
            Scheme::File,
        );
        let prelim_t = UrlTemplate::new(
            &format!("file://{}/prelim_%Y%m%d.bin", dir.path().display()),
            Scheme::File,
        );
        let chain = ProbeChain::new(vec![
            ProbeStep::finalized(final_t.clone(), Some(-9999.0)),
            ProbeStep::preliminary(prelim_t, Some(-9999.0)),
        ]);

        let client = Client::new();
        let ts = daily_step();
        let ctx = TemplateCtx::for_step(&ts);
        let dest = dir.path().join("out.bin");

        // final absent -> the preliminary step wins
        let hit = chain.run(&client, None, &dest, 16, MissingAction::Warn, &ctx).await.unwrap();
        assert!(hit.unwrap().preliminary);

        // final present -> it wins even though prelim also exists
        std::fs::write(dir.path().join("final_20231230.bin"), vec![1u8; 64]).unwrap();
        let hit = chain.run(&client, None, &dest, 16, MissingAction::Warn, &ctx).await.unwrap();
        assert!(!hit.unwrap().preliminary);
    }

    #[tokio::test]
    async fn exhausted_chain_escalates_at_error_level() {
        let dir = tempfile::tempdir().unwrap();
        let t = UrlTemplate::new(
            &format!("file://{}/nothing_%Y%m%d.bin", dir.path().display()),
            Scheme::File,
        );
        let chain = ProbeChain::new(vec![ProbeStep::finalized(t, None)]);

        let client = Client::new();
        let ts = daily_step();
        let ctx = TemplateCtx::for_step(&ts);
        let dest = dir.path().join("out.bin");

        assert!(chain.run(&client, None, &dest, 1, MissingAction::Error, &ctx).await.is_err());
        let hit = chain.run(&client, None, &dest, 1, MissingAction::Ignore, &ctx).await.unwrap();
        assert!(hit.is_none());

        // a too-small artifact is gated out as well
        let small = UrlTemplate::new(
            &format!("file://{}/small.bin", dir.path().display()),
            Scheme::File,
        );
        std::fs::write(dir.path().join("small.bin"), b"xy").unwrap();
        let chain = ProbeChain::new(vec![ProbeStep::finalized(small, None)]);
        let hit = chain.run(&client, None, &dest, 1024, MissingAction::Ignore, &TemplateCtx::new()).await.unwrap();
        assert!(hit.is_none());
    }
}

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

///! the polymorphic downloader base. Concrete sources implement the per-timestep hook
///! `get_data_ts` as a lazy payload stream; the provided `get_data` orchestration expands
///! the time range, owns the scratch workspaces and feeds the destination sink

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use tellus_common::fs::ScratchDir;
use tellus_common::geo::BoundingBox;
use tellus_common::timestep::{expand, Freq, TimeRange, TimeStep};
use tellus_raster::Payload;

use crate::{config_error, DestSink, MissingAction, Result, Tags, TellusError};

pub type OptionMap = serde_json::Map<String, Value>;

/// the lazy per-timestep emission: the sink pulls items in its own thread of control
pub type PayloadStream<'a> = BoxStream<'a, Result<(Payload, Tags)>>;

/// how far the sink probe walks back when looking for the last persisted step
const LAST_TS_SEARCH_DEPTH: usize = 730;

/// options every source recognizes in addition to its own
pub fn base_default_options() -> OptionMap {
    let mut m = OptionMap::new();
    m.insert("missing_action".to_string(), Value::from("warn"));
    m.insert("workers".to_string(), Value::from(1));
    m.insert("ts_per_year".to_string(), Value::Null);
    m
}

/// outcome counters of one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub timesteps: usize,
    pub writes: usize,
    pub skips: usize,
}

/// state shared by all downloaders: bounds, destination and the resolved option map
#[derive(Debug)]
pub struct DownloaderCore {
    pub source: &'static str,
    pub bounds: Option<BoundingBox>,
    pub sink: Option<DestSink>,
    pub options: OptionMap,
    pub variables: Vec<String>,
    pub missing_action: MissingAction,
    pub workers: usize,
    /// the range of the running request - forecast sources clip their step horizon to it
    pub request_range: Option<TimeRange>,
}

impl DownloaderCore {
    pub fn new(source: &'static str) -> DownloaderCore {
        DownloaderCore {
            source,
            bounds: None,
            sink: None,
            options: OptionMap::new(),
            variables: Vec::new(),
            missing_action: MissingAction::Warn,
            workers: 1,
            request_range: None,
        }
    }

    /// string option accessor for resolved options
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn opt_bool(&self, key: &str) -> bool {
        self.options.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(|v| v.as_u64())
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    fn core(&self) -> &DownloaderCore;
    fn core_mut(&mut self) -> &mut DownloaderCore;

    /// per-source option defaults. Keys absent here are unknown and get purged
    fn default_options(&self) -> OptionMap;

    /// retrieval frequency of the configured product
    fn freq(&self) -> Result<Freq>;

    /// one scratch directory for the whole request instead of one per timestep
    fn single_scratch_dir(&self) -> bool {
        false
    }

    /// run the outer loop once per configured variable
    fn separate_vars(&self) -> bool {
        false
    }

    /// per-source validation hook for the `variables` option
    fn set_variables(&mut self, vars: Vec<String>) -> Result<()> {
        self.core_mut().variables = vars;
        Ok(())
    }

    /// hook for sources to digest the resolved option map into typed fields
    fn apply_options(&mut self) -> Result<()> {
        Ok(())
    }

    /// produce the lazy ordered payload sequence of one timestep
    async fn get_data_ts<'a>(
        &'a self,
        ts: &'a TimeStep,
        bounds: &'a BoundingBox,
        scratch: &'a Path,
        active_var: Option<&'a str>,
    ) -> Result<PayloadStream<'a>>;

    /// the most recent timestep available at the source, if the source can tell
    async fn last_published_ts(&self) -> Result<Option<TimeStep>> {
        Ok(None)
    }

    //--- provided machinery below this line

    fn set_bounds(&mut self, bounds: BoundingBox) {
        self.core_mut().bounds = Some(bounds);
    }

    fn set_destination(&mut self, sink: DestSink) {
        self.core_mut().sink = Some(sink);
    }

    /// merge user options over the defaults: unknown keys are dropped with a warning,
    /// missing keys are filled in, `variables` is routed through `set_variables`
    fn set_options(&mut self, user: OptionMap) -> Result<()> {
        let mut defaults = base_default_options();
        defaults.extend(self.default_options());

        let mut resolved = defaults.clone();
        for (k, v) in user {
            if defaults.contains_key(&k) {
                resolved.insert(k, v);
            } else {
                warn!("{}: ignoring unknown option {}", self.core().source, k);
            }
        }

        if let Some(ma) = resolved.get("missing_action").and_then(|v| v.as_str()) {
            self.core_mut().missing_action = ma.parse()?;
        }
        if let Some(w) = resolved.get("workers").and_then(|v| v.as_u64()) {
            self.core_mut().workers = (w as usize).max(1);
        }

        let vars: Option<Vec<String>> = match resolved.get("variables") {
            Some(Value::Null) | None => None,
            Some(v) => Some(serde_json::from_value(v.clone())?),
        };

        self.core_mut().options = resolved;
        if let Some(vars) = vars {
            self.set_variables(vars)?;
        }
        self.apply_options()
    }

    /// `ts_per_year` overrides the product frequency when set
    fn effective_freq(&self) -> Result<Freq> {
        match self.core().options.get("ts_per_year").and_then(|v| v.as_u64()) {
            Some(n) => Ok(Freq::from_ts_per_year(n as u32)?),
            None => self.freq(),
        }
    }

    /// run one request: normalise arguments, expand the range, iterate timesteps in
    /// isolated scratch workspaces and feed every emitted payload to the sink
    async fn get_data(
        &mut self,
        range: TimeRange,
        bounds: Option<BoundingBox>,
        destination: Option<DestSink>,
        options: Option<OptionMap>,
    ) -> Result<DownloadReport> {
        if let Some(opts) = options {
            self.set_options(opts)?;
        }
        if let Some(bb) = bounds {
            self.set_bounds(bb);
        }
        if let Some(sink) = destination {
            self.set_destination(sink);
        }
        self.core_mut().request_range = Some(range);

        let source = self.core().source;
        let bounds = self
            .core()
            .bounds
            .clone()
            .ok_or_else(|| config_error(format!("{}: bounds not set", source)))?;
        let sink = self
            .core()
            .sink
            .clone()
            .ok_or_else(|| config_error(format!("{}: destination not set", source)))?;

        let freq = self.effective_freq()?;
        let steps = expand(&range, &freq);
        info!("{}: expanding {} to {} {} timesteps", source, range, steps.len(), freq);

        let outer_vars: Vec<Option<String>> = if self.separate_vars() {
            if self.core().variables.is_empty() {
                return Err(config_error(format!("{}: separate_vars needs variables", source)));
            }
            self.core().variables.iter().map(|v| Some(v.clone())).collect()
        } else {
            vec![None]
        };

        let this: &Self = self;
        let mut report = DownloadReport { timesteps: steps.len(), ..DownloadReport::default() };

        if this.single_scratch_dir() {
            let scratch = ScratchDir::new(source)?;
            for var in &outer_vars {
                for ts in &steps {
                    let (w, s) =
                        process_timestep(this, ts, &bounds, &sink, scratch.path(), var.as_deref()).await?;
                    report.writes += w;
                    report.skips += s;
                }
            }
        } else {
            let workers = worker_count(this.core().workers);
            for var in &outer_vars {
                let bounds = &bounds;
                let sink = &sink;
                let results: Vec<Result<(usize, usize)>> = stream::iter(steps.iter().cloned())
                    .map(|ts: TimeStep| async move {
                        let scratch = ScratchDir::new(source)?;
                        process_timestep(this, &ts, bounds, sink, scratch.path(), var.as_deref()).await
                    })
                    .buffer_unordered(workers)
                    .collect()
                    .await;
                for r in results {
                    let (w, s) = r?;
                    report.writes += w;
                    report.skips += s;
                }
            }
        }

        info!(
            "{}: request done, {} writes / {} skips over {} timesteps",
            source, report.writes, report.skips, report.timesteps
        );
        Ok(report)
    }

    /// combined probe for schedulers: (last available at the source, last persisted at the
    /// sink). The sink side takes the minimum over all (variable x aggregation) tag
    /// combinations so incomplete runs are re-fetched
    async fn get_last_ts(&self) -> Result<(Option<TimeStep>, Option<TimeStep>)> {
        let at_source = self.last_published_ts().await?;

        let core = self.core();
        let sink = match &core.sink {
            Some(s) => s,
            None => return Ok((at_source, None)),
        };
        let freq = self.effective_freq()?;
        let now = Utc::now();

        let mut persisted: Option<TimeStep> = None;
        for tags in tag_combinations(core) {
            match sink.get_last_ts(&now, &freq, &tags, LAST_TS_SEARCH_DEPTH) {
                Some(ts) => {
                    persisted = Some(match persisted {
                        Some(m) if m < ts => m,
                        _ => ts,
                    });
                }
                None => return Ok((at_source, None)),
            }
        }
        Ok((at_source, persisted))
    }
}

/// per-timestep parallelism is bounded by the host CPU count
fn worker_count(configured: usize) -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    configured.min(cpus.saturating_sub(1)).max(1)
}

/// the (variable x aggregation) tag grid the sink probe has to cover
fn tag_combinations(core: &DownloaderCore) -> Vec<Tags> {
    let aggs: Vec<String> = core
        .options
        .get("agg_method")
        .map(flatten_strings)
        .unwrap_or_default();

    let mut combos = Vec::new();
    let vars: Vec<Option<&String>> = if core.variables.is_empty() {
        vec![None]
    } else {
        core.variables.iter().map(Some).collect()
    };
    for var in vars {
        let mut base = Tags::none();
        if let Some(v) = var {
            base.variable = Some(v.clone());
        }
        if aggs.is_empty() {
            combos.push(base);
        } else {
            for agg in &aggs {
                let mut t = base.clone();
                t.agg_method = Some(agg.clone());
                combos.push(t);
            }
        }
    }
    combos
}

/// collect every string in an arbitrarily nested json list
fn flatten_strings(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(flatten_strings).collect(),
        _ => Vec::new(),
    }
}

/// drive one timestep: pull the lazy payload sequence and write each item, routing
/// failures per the missing-data policy. Returns (writes, skips)
async fn process_timestep<D: Downloader + ?Sized>(
    dl: &D,
    ts: &TimeStep,
    bounds: &BoundingBox,
    sink: &DestSink,
    scratch: &Path,
    active_var: Option<&str>,
) -> Result<(usize, usize)> {
    let source = dl.core().source;
    let missing = dl.core().missing_action;
    info!("{}: processing {}", source, ts);

    let mut payloads = match dl.get_data_ts(ts, bounds, scratch, active_var).await {
        Ok(stream) => stream,
        Err(e) => return Ok((0, route_timestep_error(e, missing, source, ts)?)),
    };

    let mut writes = 0;
    let mut skips = 0;
    while let Some(item) = payloads.next().await {
        match item {
            Ok((payload, tags)) => {
                sink.write_data(&payload, ts, &tags)?;
                info!("{}: success for {}", source, ts);
                writes += 1;
            }
            Err(e) => {
                skips += route_timestep_error(e, missing, source, ts)?;
                break; // abandon the rest of this timestep, never the request
            }
        }
    }

    if writes == 0 && skips == 0 {
        debug!("{}: skip {} (no payloads)", source, ts);
        skips = 1;
    }
    Ok((writes, skips))
}

/// failure semantics: fatal errors abort the request, unparseable payloads abandon the
/// timestep with an error record, everything else goes through the missing-data policy
fn route_timestep_error(
    e: TellusError,
    missing: MissingAction,
    source: &str,
    ts: &TimeStep,
) -> Result<usize> {
    if e.is_fatal() {
        return Err(e);
    }
    match e {
        TellusError::CorruptPayload { what, .. } => {
            error!("{}: corrupt payload for {}: {}", source, ts, what);
            Ok(1)
        }
        recoverable => {
            missing.handle(recoverable)?;
            info!("{}: skip {}", source, ts);
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tellus_common::geo::{Crs, GeoTransform};
    use tellus_raster::Grid;

    /// a minimal in-memory source used to exercise the orchestration
    struct TestSource {
        core: DownloaderCore,
        payloads_per_ts: usize,
        fail_with: Option<fn() -> TellusError>,
        single_scratch: bool,
        scratch_paths: std::sync::Mutex<Vec<std::path::PathBuf>>,
    }

    impl TestSource {
        fn new() -> TestSource {
            TestSource {
                core: DownloaderCore::new("testsource"),
                payloads_per_ts: 1,
                fail_with: None,
                single_scratch: false,
                scratch_paths: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Downloader for TestSource {
        fn core(&self) -> &DownloaderCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut DownloaderCore {
            &mut self.core
        }

        fn default_options(&self) -> OptionMap {
            let mut m = OptionMap::new();
            m.insert("get_prelim".to_string(), Value::from(true));
            m.insert("variables".to_string(), Value::Null);
            m.insert("agg_method".to_string(), Value::Null);
            m.insert("min_size".to_string(), Value::from(100));
            m
        }

        fn freq(&self) -> Result<Freq> {
            Ok(Freq::Daily)
        }

        fn single_scratch_dir(&self) -> bool {
            self.single_scratch
        }

        async fn get_data_ts<'a>(
            &'a self,
            _ts: &'a TimeStep,
            _bounds: &'a BoundingBox,
            scratch: &'a Path,
            _active_var: Option<&'a str>,
        ) -> Result<PayloadStream<'a>> {
            assert!(scratch.is_dir());
            self.scratch_paths.lock().unwrap().push(scratch.to_path_buf());
            if let Some(mk) = self.fail_with {
                return Err(mk());
            }
            let items: Vec<Result<(Payload, Tags)>> = (0..self.payloads_per_ts)
                .map(|_| {
                    let g = Grid::new(
                        Array2::from_elem((2, 2), 0.5f32),
                        GeoTransform::new(6.0, 48.0, 0.25, -0.25),
                        Crs::wgs84(),
                    );
                    Ok((Payload::Grid(g), Tags::none()))
                })
                .collect();
            Ok(stream::iter(items).boxed())
        }
    }

    fn request_parts(dir: &tempfile::TempDir) -> (TimeRange, BoundingBox, DestSink) {
        let range = TimeRange::parse("2024-01-01", "2024-01-03").unwrap();
        let bb = BoundingBox::new(6.0, 36.0, 19.0, 48.0, Crs::wgs84());
        let sink = DestSink::from_parts(dir.path().to_str().unwrap(), "t_%Y%m%d.tif");
        (range, bb, sink)
    }

    #[tokio::test]
    async fn orchestration_writes_each_timestep() {
        let dir = tempfile::tempdir().unwrap();
        let (range, bb, sink) = request_parts(&dir);

        let mut src = TestSource::new();
        let report = src.get_data(range, Some(bb), Some(sink), Some(OptionMap::new())).await.unwrap();
        assert_eq!(report, DownloadReport { timesteps: 3, writes: 3, skips: 0 });
        assert!(dir.path().join("t_20240102.tif").is_file());
    }

    #[tokio::test]
    async fn unset_bounds_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (range, _bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        let res = src.get_data(range, None, Some(sink), None).await;
        assert!(matches!(res, Err(TellusError::ConfigError(_))));
    }

    #[tokio::test]
    async fn option_discipline() {
        let mut src = TestSource::new();
        let mut user = OptionMap::new();
        user.insert("get_prelim".to_string(), Value::from(false));
        user.insert("bogus_key".to_string(), Value::from(1));
        user.insert("missing_action".to_string(), Value::from("ignore"));
        src.set_options(user).unwrap();

        // unknown keys are purged, known ones override, missing ones keep defaults
        assert!(src.core().options.get("bogus_key").is_none());
        assert_eq!(src.core().options.get("get_prelim"), Some(&Value::from(false)));
        assert_eq!(src.core().opt_u64("min_size"), Some(100));
        assert_eq!(src.core().missing_action, MissingAction::Ignore);

        // closure: applying the defaults themselves changes nothing further
        let defaults_applied = src.core().options.clone();
        src.set_options(defaults_applied.clone()).unwrap();
        assert_eq!(src.core().options, defaults_applied);
    }

    #[tokio::test]
    async fn missing_data_policy_routing() {
        let dir = tempfile::tempdir().unwrap();

        // warn level: skips but does not raise
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        src.fail_with = Some(|| crate::data_missing("nothing on server"));
        let report = src.get_data(range, Some(bb), Some(sink), None).await.unwrap();
        assert_eq!(report.writes, 0);
        assert_eq!(report.skips, 3);

        // error level: raises DataMissing
        let (range, bb, sink) = request_parts(&dir);
        let mut user = OptionMap::new();
        user.insert("missing_action".to_string(), Value::from("error"));
        let mut src = TestSource::new();
        src.fail_with = Some(|| crate::data_missing("nothing on server"));
        let res = src.get_data(range, Some(bb), Some(sink), Some(user)).await;
        assert!(matches!(res, Err(TellusError::DataMissing(_))));
    }

    #[tokio::test]
    async fn corrupt_payload_skips_timestep_but_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        src.fail_with = Some(|| crate::corrupt_payload("garbled grib"));
        let report = src.get_data(range, Some(bb), Some(sink), None).await.unwrap();
        assert_eq!(report.skips, 3);

        // the all-NaN variant is fatal
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        src.fail_with = Some(|| crate::silent_corruption("day entirely NaN"));
        assert!(src.get_data(range, Some(bb), Some(sink), None).await.is_err());
    }

    #[tokio::test]
    async fn scratch_modes() {
        // per-timestep mode hands every step its own workspace
        let dir = tempfile::tempdir().unwrap();
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        src.get_data(range, Some(bb), Some(sink), None).await.unwrap();
        let paths = src.scratch_paths.lock().unwrap().clone();
        assert_eq!(paths.len(), 3);
        assert!(paths[0] != paths[1] && paths[1] != paths[2]);

        // single-scratch mode shares one workspace over the whole request
        let dir = tempfile::tempdir().unwrap();
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        src.single_scratch = true;
        src.get_data(range, Some(bb), Some(sink), None).await.unwrap();
        let paths = src.scratch_paths.lock().unwrap().clone();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| *p == paths[0]));
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn parallel_fanout_produces_same_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (range, bb, sink) = request_parts(&dir);
        let mut src = TestSource::new();
        let mut user = OptionMap::new();
        user.insert("workers".to_string(), Value::from(4));
        let report = src.get_data(range, Some(bb), Some(sink), Some(user)).await.unwrap();
        assert_eq!(report.writes, 3);
    }
}

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

///! run one downloader request described by a JSON document. Hard failures map to a
///! non-zero exit status

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use serde_json::json;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use tellus::{from_options, load_request, time_range_from_spec, Downloader};
use tellus_common::timestep::TimeRange;

#[derive(StructOpt)]
#[structopt(about = "environmental data set download tool")]
struct Args {
    /// request document (JSON with source, bounds, destination, options, time)
    #[structopt(short, long)]
    config: PathBuf,

    /// override the start of the request window (ISO date or datetime)
    #[structopt(short, long)]
    begin: Option<String>,

    /// override the end of the request window
    #[structopt(short, long)]
    end: Option<String>,

    /// log at debug level
    #[structopt(short, long)]
    verbose: bool,
}

fn request_range(args: &Args, spec: &serde_json::Value) -> anyhow::Result<TimeRange> {
    if let (Some(begin), Some(end)) = (&args.begin, &args.end) {
        return Ok(TimeRange::parse(begin, end)?);
    }
    let time = spec
        .get("time")
        .ok_or_else(|| anyhow!("request document has no time window and no --begin/--end"))?;
    let mut range = time_range_from_spec(time)?;
    if let Some(begin) = &args.begin {
        range = time_range_from_spec(&json!([begin, range.end().to_rfc3339()]))?;
    }
    if let Some(end) = &args.end {
        range = time_range_from_spec(&json!([range.start().to_rfc3339(), end]))?;
    }
    Ok(range)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    let spec = load_request(&args.config)
        .with_context(|| format!("cannot load request {:?}", args.config))?;
    let range = request_range(&args, &spec)?;

    let mut downloader = from_options(&spec)?;
    let report = downloader.get_data(range, None, None, None).await?;

    println!(
        "{}: {} writes, {} skips over {} timesteps",
        spec.get("source").and_then(|v| v.as_str()).unwrap_or("?"),
        report.writes,
        report.skips,
        report.timesteps
    );
    if report.writes == 0 && report.skips > 0 {
        return Err(anyhow!("request produced no artifacts"));
    }
    Ok(())
}

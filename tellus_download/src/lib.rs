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

///! the downloader framework: request orchestration, URL/API retrieval envelopes,
///! credential lookup, integrity gating, missing-data policy and the destination sink

mod errors;
pub use errors::*;

pub mod policy;
pub use policy::MissingAction;

pub mod integrity;
pub mod credentials;
pub mod sink;
pub use sink::{DestSink, Tags};

pub mod url;
pub use url::{ProbeChain, ProbeStep, Scheme, TemplateCtx, UrlTemplate};

pub mod api;
pub use api::{ApiClient, ApiDownloader};

pub mod downloader;
pub use downloader::{Downloader, DownloaderCore, DownloadReport, OptionMap, PayloadStream};

pub mod forecast;

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

use thiserror::Error;

use tellus_common::geo::GeoError;
use tellus_common::net::NetError;
use tellus_common::timestep::TimeError;
use tellus_raster::RasterError;

pub type Result<T> = std::result::Result<T, TellusError>;

#[derive(Error, Debug)]
pub enum TellusError {
    /// missing/invalid bounds, destination, frequency, product, variable or option combination
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// the server refused the credential - never retried
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// transport exception of a single attempt
    #[error("transfer failed: {0}")]
    TransferError(String),

    /// downloaded artifact absent or below the expected size
    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    /// no data exists for the requested (timestep, tags) at the source
    #[error("no data: {0}")]
    DataMissing(String),

    /// unparseable artifact, missing expected variable, or silent server corruption.
    /// `fatal` marks the all-NaN-day variant that must abort the whole request
    #[error("corrupt payload: {what}")]
    CorruptPayload { what: String, fatal: bool },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl TellusError {
    /// fatal errors propagate out of get_data regardless of the missing-data policy
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TellusError::ConfigError(_)
                | TellusError::MissingCredentials(_)
                | TellusError::AuthError(_)
                | TellusError::CorruptPayload { fatal: true, .. }
                | TellusError::IOError(_)
        )
    }
}

impl From<NetError> for TellusError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::AuthRefused(what) => TellusError::AuthError(what),
            NetError::NotFound(what) => TellusError::DataMissing(what),
            other => TellusError::TransferError(other.to_string()),
        }
    }
}

impl From<RasterError> for TellusError {
    fn from(e: RasterError) -> Self {
        match e {
            RasterError::CropOutside(what) => TellusError::DataMissing(what),
            other => TellusError::CorruptPayload { what: other.to_string(), fatal: false },
        }
    }
}

impl From<GeoError> for TellusError {
    fn from(e: GeoError) -> Self {
        TellusError::ConfigError(e.to_string())
    }
}

impl From<TimeError> for TellusError {
    fn from(e: TimeError) -> Self {
        TellusError::ConfigError(e.to_string())
    }
}

impl From<serde_json::Error> for TellusError {
    fn from(e: serde_json::Error) -> Self {
        TellusError::ConfigError(e.to_string())
    }
}

pub fn config_error(msg: impl ToString) -> TellusError {
    TellusError::ConfigError(msg.to_string())
}

pub fn data_missing(msg: impl ToString) -> TellusError {
    TellusError::DataMissing(msg.to_string())
}

pub fn corrupt_payload(msg: impl ToString) -> TellusError {
    TellusError::CorruptPayload { what: msg.to_string(), fatal: false }
}

pub fn silent_corruption(msg: impl ToString) -> TellusError {
    TellusError::CorruptPayload { what: msg.to_string(), fatal: true }
}

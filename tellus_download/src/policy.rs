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

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{config_error, Result, TellusError};

/// what to do when a timestep has no data: fail the request, log and go on, or stay silent.
/// The policy travels down the call stack as a plain value - fallback chains probe their
/// intermediate attempts at Ignore and only escalate the final one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingAction {
    Error,
    Warn,
    Ignore,
}

impl FromStr for MissingAction {
    type Err = TellusError;

    fn from_str(s: &str) -> Result<MissingAction> {
        match s.to_lowercase().as_str() {
            "error" | "err" | "raise" => Ok(MissingAction::Error),
            "warn" | "warning" => Ok(MissingAction::Warn),
            "ignore" | "silent" | "skip" => Ok(MissingAction::Ignore),
            other => Err(config_error(format!("unknown missing_action {}", other))),
        }
    }
}

impl MissingAction {
    /// route a recoverable failure through the policy. At `error` the failure is re-raised,
    /// at `warn` it produces exactly one warning record, at `ignore` a debug record
    pub fn handle(&self, err: TellusError) -> Result<()> {
        match self {
            MissingAction::Error => Err(err),
            MissingAction::Warn => {
                warn!("{}", err);
                Ok(())
            }
            MissingAction::Ignore => {
                debug!("{}", err);
                Ok(())
            }
        }
    }
}

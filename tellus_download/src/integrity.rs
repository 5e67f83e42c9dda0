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

use std::path::Path;

use tellus_common::fs::file_length;

use crate::{Result, TellusError};

/// outcome of the size-based integrity check. No policy decision is taken here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckFlag {
    Ok = 0,
    Missing = 1,
    TooSmall = 2,
}

/// check that a downloaded artifact exists and has at least `min_size` bytes
pub fn check_download(path: &Path, min_size: u64) -> (CheckFlag, String) {
    match file_length(path) {
        None => (CheckFlag::Missing, format!("{:?} was not downloaded", path)),
        Some(len) if len < min_size => (
            CheckFlag::TooSmall,
            format!("{:?} has {} bytes, expected at least {}", path, len, min_size),
        ),
        Some(len) => (CheckFlag::Ok, format!("{:?} ok ({} bytes)", path, len)),
    }
}

/// check_download as a Result, for callers that route the failure through the policy
pub fn gate(path: &Path, min_size: u64) -> Result<()> {
    match check_download(path, min_size) {
        (CheckFlag::Ok, _) => Ok(()),
        (_, msg) => Err(TellusError::IntegrityError(msg)),
    }
}

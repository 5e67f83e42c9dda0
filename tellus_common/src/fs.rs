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

///! scratch workspaces and file utilities. Every scratch directory is registered for removal
///! both on scope exit (Drop) and on process termination, so an aborted request does not
///! leave partial downloads behind

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::{Duration, SystemTime};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use tar::Archive;
use tracing::warn;

lazy_static! {
    static ref SCRATCH_REGISTRY: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

static EXIT_HOOK: Once = Once::new();

/// the process-wide root for scratch workspaces: $TELLUS_TMP if set, otherwise $HOME/tmp
pub fn scratch_root() -> PathBuf {
    if let Ok(dir) = std::env::var("TELLUS_TMP") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join("tmp"),
        Err(_) => std::env::temp_dir(),
    }
}

fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        let res = ctrlc::set_handler(|| {
            remove_registered_scratch_dirs();
            std::process::exit(130);
        });
        if let Err(e) = res {
            warn!("cannot install scratch cleanup handler: {e}");
        }
    });
}

/// remove every scratch dir still registered - called from the termination handler
pub fn remove_registered_scratch_dirs() {
    if let Ok(mut reg) = SCRATCH_REGISTRY.lock() {
        for p in reg.drain() {
            let _ = fs::remove_dir_all(&p);
        }
    }
}

/// a private temporary directory owned by one request or one timestep. The directory has a
/// random unique name under the scratch root and is deleted when the value is dropped - or
/// by the process termination hook, whichever comes first
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> io::Result<ScratchDir> {
        let root = scratch_root();
        ensure_writable_dir(&root)?;
        install_exit_hook();

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_", prefix))
            .tempdir_in(&root)?
            .keep(); // ownership of removal moves to us and the exit hook

        if let Ok(mut reg) = SCRATCH_REGISTRY.lock() {
            reg.insert(dir.clone());
        }
        Ok(ScratchDir { path: dir })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
        if let Ok(mut reg) = SCRATCH_REGISTRY.lock() {
            reg.remove(&self.path);
        }
    }
}

/// check if dir pathname exists and is writable, try to create dir otherwise
pub fn ensure_writable_dir(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    if path.is_dir() {
        let md = fs::metadata(path)?;
        if md.permissions().readonly() {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("dir {:?} not writable", path)))
        } else {
            Ok(())
        }
    } else {
        fs::create_dir_all(path)
    }
}

pub fn file_length(path: impl AsRef<Path>) -> Option<u64> {
    fs::metadata(path).ok().map(|meta| meta.len())
}

pub fn filename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|o| o.to_str())
}

pub fn remove_old_files(dir: impl AsRef<Path>, max_age: Duration) -> io::Result<usize> {
    let dir = dir.as_ref();
    let now = SystemTime::now();
    let mut n_removed = 0;

    for e in fs::read_dir(dir)? {
        let path = e?.path();
        if path.is_file() {
            if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
                if let Ok(age) = now.duration_since(modified) {
                    if age > max_age && fs::remove_file(&path).is_ok() {
                        n_removed += 1;
                    }
                }
            }
        }
    }
    Ok(n_removed)
}

/* #region decompression *****************************************************************************/

/// true if the file starts with the gzip magic
pub fn is_gzipped(path: impl AsRef<Path>) -> bool {
    let mut magic = [0u8; 2];
    File::open(path).and_then(|mut f| f.read_exact(&mut magic)).is_ok() && magic == [0x1f, 0x8b]
}

pub fn decompress_gz(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut out = File::create(dest)?;
    io::copy(&mut decoder, &mut out)
}

pub fn decompress_bz2(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> io::Result<u64> {
    let mut decoder = BzDecoder::new(File::open(src)?);
    let mut out = File::create(dest)?;
    io::copy(&mut decoder, &mut out)
}

/// unpack a tar archive into `dest_dir`. With `flatten` set all entries land directly in
/// `dest_dir` under their basename, dropping any archive-internal directory structure
pub fn untar(src: impl AsRef<Path>, dest_dir: impl AsRef<Path>, flatten: bool) -> io::Result<Vec<PathBuf>> {
    let dest_dir = dest_dir.as_ref();
    ensure_writable_dir(dest_dir)?;

    let mut archive = Archive::new(File::open(src)?);
    let mut unpacked = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let rel = entry.path()?.into_owned();
        let target = if flatten {
            match rel.file_name() {
                Some(name) => dest_dir.join(name),
                None => continue,
            }
        } else {
            dest_dir.join(&rel)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        unpacked.push(target);
    }
    Ok(unpacked)
}

/* #endregion decompression */

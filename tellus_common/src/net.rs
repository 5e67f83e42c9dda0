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

///! one-shot byte transfer primitives, one per scheme. None of these retry internally -
///! retries and fallback chains happen one level up in the downloader

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("ftp error: {0}")]
    FtpError(#[from] suppaftp::FtpError),

    #[error("ssh error: {0}")]
    SshError(#[from] ssh2::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication refused: {0}")]
    AuthRefused(String),

    #[error("operation failed: {0}")]
    OpFailed(String),
}

lazy_static! {
    // [scheme, user@, host, :port, /path, ?query]
    static ref URL_RE: Regex =
        Regex::new(r"(.+)://(?:(.+)@)?([^:/]+)(?::(\d+))?(?:/([^?]*))?(?:\?(.+))?").unwrap();
}

/// filename part (last path element) of a complete URL
pub fn url_file_name(url: &str) -> Option<&str> {
    URL_RE
        .captures(url)
        .and_then(|cap| cap.get(5))
        .map(|m| m.as_str())
        .and_then(|p| p.rsplit('/').next())
        .filter(|f| !f.is_empty())
}

pub fn url_host(url: &str) -> Option<&str> {
    URL_RE.captures(url).and_then(|cap| cap.get(3)).map(|m| m.as_str())
}

/// path part of a complete URL, without the leading '/'
pub fn url_path(url: &str) -> Option<&str> {
    URL_RE.captures(url).and_then(|cap| cap.get(5)).map(|m| m.as_str())
}

/// transfer credentials: either a cleartext pair or a pre-encoded HTTP Basic token
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Basic { user: String, password: String },
    BasicToken(String),
}

impl Auth {
    pub fn basic(user: impl ToString, password: impl ToString) -> Auth {
        Auth::Basic { user: user.to_string(), password: password.to_string() }
    }

    pub fn user_password(&self) -> Option<(&str, &str)> {
        match self {
            Auth::Basic { user, password } => Some((user.as_str(), password.as_str())),
            Auth::BasicToken(_) => None,
        }
    }
}

fn with_auth(req: reqwest::RequestBuilder, auth: Option<&Auth>) -> reqwest::RequestBuilder {
    match auth {
        Some(Auth::Basic { user, password }) => req.basic_auth(user, Some(password)),
        Some(Auth::BasicToken(tok)) => req.header(header::AUTHORIZATION, format!("Basic {}", tok)),
        None => req,
    }
}

/* #region http **************************************************************************************/

/// GET `url` and stream the body to `dest`. The body goes to a sibling temp file first so a
/// failed transfer never leaves a partial file under the destination name
pub async fn download_http(client: &Client, url: &str, auth: Option<&Auth>, dest: &Path) -> Result<u64> {
    let mut response = with_auth(client.get(url), auth).send().await?;

    match response.status() {
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
            let dir = dest.parent().unwrap_or(Path::new("."));
            let mut file = tempfile::NamedTempFile::new_in(dir)?;
            let mut len: u64 = 0;
            while let Some(chunk) = response.chunk().await? {
                len += chunk.len() as u64;
                file.write_all(&chunk)?;
            }
            file.flush()?;
            file.persist(dest).map_err(|e| NetError::IOError(e.error))?;
            debug!("retrieved {} bytes from {}", len, url);
            Ok(len)
        }
        StatusCode::NOT_FOUND => Err(NetError::NotFound(url.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NetError::AuthRefused(url.to_string())),
        other => Err(NetError::OpFailed(format!("{} returned status {}", url, other))),
    }
}

/// status of a HEAD request, for availability and credential probes
pub async fn head_status(client: &Client, url: &str, auth: Option<&Auth>) -> Result<StatusCode> {
    let response = with_auth(client.head(url), auth).send().await?;
    Ok(response.status())
}

/* #endregion http */

/* #region ftp / sftp ********************************************************************************/

/// retrieve one file over FTP. `host` may carry a port ("host:2121"), `remote_path` is
/// interpreted from the login directory
pub async fn download_ftp(host: &str, remote_path: &str, auth: &Auth, dest: &Path) -> Result<u64> {
    use suppaftp::tokio::AsyncFtpStream;

    let addr = if host.contains(':') { host.to_string() } else { format!("{}:21", host) };
    let (user, password) = auth
        .user_password()
        .ok_or_else(|| NetError::OpFailed("ftp needs a cleartext credential pair".into()))?;

    let mut ftp = AsyncFtpStream::connect(&addr).await?;
    ftp.login(user, password).await?;
    ftp.transfer_type(suppaftp::types::FileType::Binary).await?;

    let mut reader = ftp.retr_as_stream(remote_path).await?;
    let mut file = tokio::fs::File::create(dest).await?;
    let len = tokio::io::copy(&mut reader, &mut file).await?;
    ftp.finalize_retr_stream(reader).await?;
    ftp.quit().await?;

    debug!("retrieved {} bytes from ftp://{}/{}", len, host, remote_path);
    Ok(len)
}

/// retrieve one file over SFTP. The libssh2 session is blocking so the transfer runs on the
/// blocking pool
pub async fn download_sftp(host: &str, remote_path: &str, auth: &Auth, dest: &Path) -> Result<u64> {
    let host = host.to_string();
    let remote_path = remote_path.to_string();
    let dest: PathBuf = dest.to_path_buf();
    let (user, password) = auth
        .user_password()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .ok_or_else(|| NetError::OpFailed("sftp needs a cleartext credential pair".into()))?;

    tokio::task::spawn_blocking(move || -> Result<u64> {
        let addr = if host.contains(':') { host.clone() } else { format!("{}:22", host) };
        let tcp = TcpStream::connect(&addr)?;
        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(&user, &password)?;
        if !session.authenticated() {
            return Err(NetError::AuthRefused(host));
        }

        let sftp = session.sftp()?;
        let mut remote = sftp.open(Path::new(&remote_path))?;
        let mut file = std::fs::File::create(&dest)?;
        let len = std::io::copy(&mut remote, &mut file)?;
        Ok(len)
    })
    .await
    .map_err(|e| NetError::OpFailed(format!("sftp task failed: {}", e)))?
}

/* #endregion ftp / sftp */

/// local copy for `file:` URLs - used for mirror trees and tests
pub fn download_file_url(url: &str, dest: &Path) -> Result<u64> {
    let path = url.strip_prefix("file://").unwrap_or(url);
    if !Path::new(path).is_file() {
        return Err(NetError::NotFound(url.to_string()));
    }
    Ok(std::fs::copy(path, dest)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parts() {
        let url = "https://data.chc.ucsb.edu/products/CHIRPS-2.0/global_daily/tifs/p25/2023/chirps-v2.0.2023.12.30.tif.gz";
        assert_eq!(url_file_name(url), Some("chirps-v2.0.2023.12.30.tif.gz"));
        assert_eq!(url_host(url), Some("data.chc.ucsb.edu"));
        assert_eq!(url_host("ftp://user@ftp.example.org:2121/pub/x"), Some("ftp.example.org"));
        assert_eq!(url_file_name("https://host.org/dir/"), None);
    }

    #[test]
    fn file_scheme_copies_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"1234").unwrap();

        let dest = dir.path().join("dest.bin");
        let url = format!("file://{}", src.display());
        assert_eq!(download_file_url(&url, &dest).unwrap(), 4);

        let missing = format!("file://{}", dir.path().join("nope").display());
        assert!(matches!(download_file_url(&missing, &dest), Err(NetError::NotFound(_))));
    }
}

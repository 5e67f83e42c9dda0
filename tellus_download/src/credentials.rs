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

///! credential lookup: explicit options take precedence, then per-source environment
///! variables, then the user's netrc. Resolution happens once per (source, host) and is
///! cached for the session

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lazy_static::lazy_static;
use reqwest::{Client, StatusCode};
use tracing::debug;

use tellus_common::net::{head_status, url_host, Auth};

use crate::{Result, TellusError};

/// what a source asks for: the env variable names it publishes, the host it talks to, an
/// optional probe URL and whether the result should be pre-encoded to HTTP Basic form
#[derive(Debug, Clone, Default)]
pub struct CredentialRequest<'a> {
    pub source: &'a str,
    pub env_user: &'a str,
    pub env_password: &'a str,
    pub url: &'a str,
    pub test_url: Option<&'a str>,
    pub encode: bool,
    /// caller-supplied pair from the request options - wins over everything
    pub explicit: Option<(String, String)>,
}

lazy_static! {
    static ref CACHE: Mutex<HashMap<(String, String), Auth>> = Mutex::new(HashMap::new());
}

fn netrc_path() -> PathBuf {
    if let Ok(p) = std::env::var("NETRC") {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".netrc")
}

/// minimal netrc lookup: `machine <host> login <user> password <pwd>`, with `default`
/// entries honored. Token order inside an entry does not matter
fn netrc_lookup(host: &str) -> Option<(String, String)> {
    let text = std::fs::read_to_string(netrc_path()).ok()?;
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let mut current: Option<&str> = None;
    let mut login: Option<&str> = None;
    let mut password: Option<&str> = None;
    let mut hit: Option<(String, String)> = None;
    let mut default_hit: Option<(String, String)> = None;

    let mut flush = |machine: Option<&str>, login: &mut Option<&str>, password: &mut Option<&str>,
                     hit: &mut Option<(String, String)>, default_hit: &mut Option<(String, String)>| {
        if let (Some(l), Some(p)) = (login.take(), password.take()) {
            match machine {
                Some(m) if m == host => *hit = Some((l.to_string(), p.to_string())),
                Some("default") if default_hit.is_none() => {
                    *default_hit = Some((l.to_string(), p.to_string()))
                }
                _ => {}
            }
        }
    };

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "machine" if i + 1 < tokens.len() => {
                flush(current, &mut login, &mut password, &mut hit, &mut default_hit);
                current = Some(tokens[i + 1]);
                i += 2;
            }
            "default" => {
                flush(current, &mut login, &mut password, &mut hit, &mut default_hit);
                current = Some("default");
                i += 1;
            }
            "login" if i + 1 < tokens.len() => {
                login = Some(tokens[i + 1]);
                i += 2;
            }
            "password" if i + 1 < tokens.len() => {
                password = Some(tokens[i + 1]);
                i += 2;
            }
            _ => i += 1,
        }
    }
    flush(current, &mut login, &mut password, &mut hit, &mut default_hit);

    hit.or(default_hit)
}

/// resolve credentials for a source. Precedence: explicit options, environment, netrc.
/// Fails with `MissingCredentials` when no mechanism yields a complete pair and with
/// `AuthError` when the test URL refuses the candidate
pub async fn get_credentials(client: &Client, req: &CredentialRequest<'_>) -> Result<Auth> {
    let host = url_host(req.url).unwrap_or(req.url).to_string();
    let key = (req.source.to_string(), host.clone());

    if let Some(auth) = CACHE.lock().unwrap().get(&key) {
        return Ok(auth.clone());
    }

    let pair = resolve_pair(req, &host)?;

    if let Some(test_url) = req.test_url {
        let auth = Auth::basic(&pair.0, &pair.1);
        match head_status(client, test_url, Some(&auth)).await {
            Ok(StatusCode::UNAUTHORIZED) | Ok(StatusCode::FORBIDDEN) => {
                return Err(TellusError::AuthError(format!("{} refused credentials for {}", test_url, req.source)));
            }
            Ok(_) => debug!("credential probe ok for {}", req.source),
            Err(e) => return Err(TellusError::TransferError(format!("credential probe: {}", e))),
        }
    }

    let auth = if req.encode {
        Auth::BasicToken(BASE64.encode(format!("{}:{}", pair.0, pair.1)))
    } else {
        Auth::basic(&pair.0, &pair.1)
    };

    CACHE.lock().unwrap().insert(key, auth.clone());
    Ok(auth)
}

fn resolve_pair(req: &CredentialRequest<'_>, host: &str) -> Result<(String, String)> {
    if let Some((u, p)) = &req.explicit {
        return Ok((u.clone(), p.clone()));
    }
    if let (Ok(u), Ok(p)) = (std::env::var(req.env_user), std::env::var(req.env_password)) {
        return Ok((u, p));
    }
    if let Some(pair) = netrc_lookup(host) {
        return Ok(pair);
    }
    Err(TellusError::MissingCredentials(format!(
        "{}: set {}/{} or a netrc entry for {}",
        req.source, req.env_user, req.env_password, host
    )))
}

/// drop all cached credentials - only used by tests
pub fn clear_cache() {
    CACHE.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_netrc(dir: &tempfile::TempDir, content: &str) {
        let p = dir.path().join("netrc");
        std::fs::write(&p, content).unwrap();
        unsafe { std::env::set_var("NETRC", p.to_str().unwrap()) };
    }

    // netrc cases run in one test body - they share the NETRC env var
    #[tokio::test]
    async fn netrc_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_netrc(
            &dir,
            "machine ftp.hsaf.example login hsafuser password hsafpwd\n\
             default login anon password anon@example.org\n",
        );

        assert_eq!(
            netrc_lookup("ftp.hsaf.example"),
            Some(("hsafuser".to_string(), "hsafpwd".to_string()))
        );
        assert_eq!(
            netrc_lookup("other.host"),
            Some(("anon".to_string(), "anon@example.org".to_string()))
        );

        // nothing in options, env or netrc -> MissingCredentials
        clear_cache();
        write_netrc(&dir, "machine unrelated.host login x password y\n");
        let client = Client::new();
        let req = CredentialRequest {
            source: "nosrc",
            env_user: "NO_SUCH_VAR_U2",
            env_password: "NO_SUCH_VAR_P2",
            url: "https://nocred.example.org/d",
            ..Default::default()
        };
        assert!(matches!(
            get_credentials(&client, &req).await,
            Err(TellusError::MissingCredentials(_))
        ));
    }

    #[tokio::test]
    async fn explicit_wins_over_env() {
        clear_cache();
        unsafe {
            std::env::set_var("TEST_CRED_USER", "envuser");
            std::env::set_var("TEST_CRED_PWD", "envpwd");
        }
        let client = Client::new();
        let req = CredentialRequest {
            source: "testsrc",
            env_user: "TEST_CRED_USER",
            env_password: "TEST_CRED_PWD",
            url: "https://data.example.org/d",
            test_url: None,
            encode: false,
            explicit: Some(("optuser".to_string(), "optpwd".to_string())),
        };
        let auth = get_credentials(&client, &req).await.unwrap();
        assert_eq!(auth, Auth::basic("optuser", "optpwd"));

        // second resolution comes from the session cache
        let auth2 = get_credentials(&client, &req).await.unwrap();
        assert_eq!(auth, auth2);
    }

    #[tokio::test]
    async fn encoded_form_is_basic_token() {
        clear_cache();
        let client = Client::new();
        let req = CredentialRequest {
            source: "encsrc",
            env_user: "NO_SUCH_VAR_U",
            env_password: "NO_SUCH_VAR_P",
            url: "https://enc.example.org/d",
            explicit: Some(("u".to_string(), "p".to_string())),
            encode: true,
            test_url: None,
        };
        match get_credentials(&client, &req).await.unwrap() {
            Auth::BasicToken(tok) => assert_eq!(tok, "dTpw"), // base64("u:p")
            other => panic!("expected encoded token, got {:?}", other),
        }
    }

}

//! Client-side reachability check for a remote library.
//!
//! A probe hits `{base}/api/health` with the stored credentials, retrying a
//! bounded number of times. After each failed attempt the same request is
//! tried once against the protocol-swapped URL (`http` ↔ `https`), so a
//! remote that changed its TLS setup is still found.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Header carrying the caller's user token next to the bearer access token.
pub const USER_TOKEN_HEADER: &str = "X-User-Token";
pub const HEALTH_PATH: &str = "/api/health";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Credentials presented to a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub user_token: String,
    pub access_token: String,
}

/// Token as stored with a remote library connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteToken {
    /// `user:access`, or a bare access token.
    Combined(String),
    #[serde(rename_all = "camelCase")]
    Split {
        user_token: String,
        access_token: String,
    },
}

impl RemoteToken {
    /// Resolve to a pair. A bare access token is paired with `my_user_token`.
    pub fn credentials(&self, my_user_token: &str) -> TokenPair {
        match self {
            Self::Combined(s) => match s.split_once(':') {
                Some((user, access)) => TokenPair {
                    user_token: user.to_owned(),
                    access_token: access.to_owned(),
                },
                None => TokenPair {
                    user_token: my_user_token.to_owned(),
                    access_token: s.clone(),
                },
            },
            Self::Split {
                user_token,
                access_token,
            } => TokenPair {
                user_token: user_token.clone(),
                access_token: access_token.clone(),
            },
        }
    }
}

/// A library on another installation that this one connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLibraryConnection {
    pub url: String,
    pub token: RemoteToken,
    pub name: String,
    #[serde(default)]
    pub last_connected_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// `http://` ↔ `https://`. `None` when the URL has neither scheme.
pub fn swap_protocol(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("https://") {
        Some(format!("http://{rest}"))
    } else {
        url.strip_prefix("http://")
            .map(|rest| format!("https://{rest}"))
    }
}

#[derive(Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HealthProber {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build health probe client")?;
        Ok(Self { client, policy })
    }

    /// Find a working base URL for `base_url`, or `None` once every attempt failed.
    pub async fn probe(&self, base_url: &str, creds: &TokenPair) -> Option<String> {
        let primary = base_url.trim_end_matches('/').to_owned();
        let alternate = swap_protocol(&primary);

        for attempt in 1..=self.policy.max_retries {
            if self.check(&primary, creds).await {
                return Some(primary);
            }

            // Tried once per failed attempt, not once per probe.
            if let Some(alt) = &alternate {
                if self.check(alt, creds).await {
                    debug!(url = %alt, "remote answered on swapped protocol");
                    return Some(alt.clone());
                }
            }

            if attempt < self.policy.max_retries {
                debug!(
                    url = %primary,
                    attempt,
                    max = self.policy.max_retries,
                    "health probe failed; retrying"
                );
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        warn!(url = %primary, attempts = self.policy.max_retries, "remote library unreachable");
        None
    }

    /// One request. Any 2xx is healthy.
    pub async fn check(&self, base_url: &str, creds: &TokenPair) -> bool {
        let result = self
            .client
            .get(format!("{base_url}{HEALTH_PATH}"))
            .bearer_auth(&creds.access_token)
            .header(USER_TOKEN_HEADER, &creds.user_token)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(url = %base_url, status = %resp.status(), "health check rejected");
                false
            }
            Err(e) => {
                debug!(url = %base_url, error = %e, "health check failed");
                false
            }
        }
    }
}

/// Probe `remote` with default policy values where not given.
pub async fn probe_health(
    remote: &RemoteLibraryConnection,
    my_user_token: &str,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
) -> Option<String> {
    let defaults = RetryPolicy::default();
    let policy = RetryPolicy {
        max_retries: max_retries.unwrap_or(defaults.max_retries),
        retry_delay: retry_delay.unwrap_or(defaults.retry_delay),
    };

    let prober = match HealthProber::new(policy) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "cannot start health probe");
            return None;
        }
    };
    prober
        .probe(&remote.url, &remote.token.credentials(my_user_token))
        .await
}

//! SAF session lifecycle: acquire, keep alive, refresh, revoke.
//!
//! At most one acquisition or keepalive is in flight per manager; other
//! callers wait on the inner lock. Keepalives are issued lazily when the
//! session has sat idle, with a jitter draw so a fleet of writers does not
//! thunder at the same instant.

use std::time::{Duration, Instant};

use serde_json::json;
use sync_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CanaryConfig;

/// Observable lifecycle of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Acquiring,
    Active,
    Refreshing,
    Revoked,
}

#[derive(Debug)]
struct SessionInner {
    token: Option<String>,
    state: SessionState,
    last_used: Instant,
}

/// Manages one session token against the historian auth endpoints.
pub struct SessionManager {
    config: CanaryConfig,
    http: reqwest::Client,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(config: CanaryConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::config("egress.base_url is not configured"));
        }
        if config.api_token.is_empty() {
            return Err(Error::config("egress.api_token is not configured"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.session_timeout_ms) + Duration::from_secs(5))
            .build()
            .map_err(|err| Error::internal(format!("session http client: {err}")))?;
        Ok(Self {
            config,
            http,
            inner: Mutex::new(SessionInner {
                token: None,
                state: SessionState::Uninitialized,
                last_used: Instant::now(),
            }),
        })
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Return a session token, acquiring or keeping alive as needed.
    pub async fn ensure_session(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.token.is_none() {
            self.acquire_locked(&mut inner).await?;
        } else {
            self.maybe_keepalive_locked(&mut inner).await?;
        }
        inner
            .token
            .clone()
            .ok_or_else(|| Error::SessionInvalid("failed to acquire session token".into()))
    }

    /// Reset the idle timer after a successful write.
    pub async fn mark_used(&self) {
        self.inner.lock().await.last_used = Instant::now();
    }

    /// Force reacquisition on the next `ensure_session`.
    pub async fn on_bad_session(&self) {
        let mut inner = self.inner.lock().await;
        inner.token = None;
        inner.state = SessionState::Refreshing;
        info!("session token invalidated; will reacquire");
    }

    /// Issue a keepalive when the session has been idle long enough.
    /// Intended to be driven by a timer task.
    pub async fn tick(&self) {
        let mut inner = self.inner.lock().await;
        if inner.token.is_some() {
            if let Err(err) = self.maybe_keepalive_locked(&mut inner).await {
                warn!(error = %err, "session keepalive failed");
            }
        }
    }

    /// Best-effort revoke on shutdown.
    pub async fn shutdown(&self) {
        let token = {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Revoked;
            inner.token.take()
        };
        let Some(token) = token else { return };
        let url = format!("{}/revokeSessionToken", self.config.base_url.trim_end_matches('/'));
        if let Err(err) = self
            .http
            .post(&url)
            .json(&json!({ "sessionToken": token }))
            .send()
            .await
        {
            debug!(error = %err, "session revoke failed");
        }
    }

    async fn acquire_locked(&self, inner: &mut SessionInner) -> Result<()> {
        inner.state = if inner.state == SessionState::Uninitialized {
            SessionState::Acquiring
        } else {
            SessionState::Refreshing
        };

        let url = format!(
            "{}/getSessionToken",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "apiToken": self.config.api_token,
            "clientId": self.config.client_id,
            "historians": self.config.historians,
            "settings": {
                "clientTimeout": self.config.session_timeout_ms,
                "autoCreateDatasets": self.config.auto_create_datasets,
            },
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::transient(format!("getSessionToken request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(format!(
                "getSessionToken returned {status}"
            )));
        }
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::transient(format!("getSessionToken body unreadable: {err}")))?;
        let token = data
            .get("sessionToken")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::SessionInvalid("getSessionToken response missing sessionToken".into())
            })?;

        inner.token = Some(token.to_string());
        inner.state = SessionState::Active;
        inner.last_used = Instant::now();
        info!("historian session acquired");
        Ok(())
    }

    async fn maybe_keepalive_locked(&self, inner: &mut SessionInner) -> Result<()> {
        let Some(token) = inner.token.clone() else {
            return Ok(());
        };
        let idle = inner.last_used.elapsed();
        let threshold = Duration::from_secs(self.config.keepalive_idle_seconds);
        if idle < threshold {
            return Ok(());
        }
        // Recent writes suppress keepalive; the jitter spreads out the rest.
        let jitter = Duration::from_secs_f64(
            rand::random::<f64>() * self.config.keepalive_jitter_seconds as f64,
        );
        if idle < threshold + jitter {
            return Ok(());
        }

        let url = format!("{}/keepAlive", self.config.base_url.trim_end_matches('/'));
        let result = self
            .http
            .post(&url)
            .json(&json!({ "sessionToken": token }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                inner.last_used = Instant::now();
                debug!(idle_s = idle.as_secs(), "session keepalive sent");
                Ok(())
            }
            Ok(response) => {
                // A rejected keepalive means the token is gone; reacquire
                // rather than handing out a dead token.
                warn!(status = %response.status(), "keepalive rejected; reacquiring session");
                inner.token = None;
                self.acquire_locked(inner).await
            }
            Err(err) => {
                inner.token = None;
                Err(Error::transient(format!("keepalive request failed: {err}")))
            }
        }
    }
}

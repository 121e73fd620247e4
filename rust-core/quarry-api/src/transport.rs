// SPDX-License-Identifier: PMPL-1.0-or-later
//! HTTP peer transport.
//!
//! Talks to the routes in [`build_router`](crate::build_router) on other
//! nodes. Membership is the static peer list from [`ApiConfig`]; every call
//! is bounded by the configured peer timeout.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use quarry_planner::{PeerTransport, PreparedConfig, TransportError};

use crate::{ApiConfig, ApiError, EncodedPlanResponse, ListResponse, PutPreparedRequest, ORIGIN_HEADER};

/// [`PeerTransport`] over the Quarry HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    local: String,
    members: Vec<String>,
    timeout: Duration,
}

impl HttpTransport {
    /// `members` lists every cluster node as `host:port`, `local` included.
    pub fn new(local: impl Into<String>, members: Vec<String>, timeout: Duration) -> Result<Self, ApiError> {
        // reqwest is built without a bundled crypto provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::Internal(format!("HTTP client: {e}")))?;

        let local = local.into();
        let mut members = members;
        if !members.contains(&local) {
            members.push(local.clone());
        }

        Ok(Self {
            client,
            local,
            members,
            timeout,
        })
    }

    pub fn from_config(prepared: &PreparedConfig, api: &ApiConfig) -> Result<Self, ApiError> {
        Self::new(
            prepared.node_name.clone(),
            api.peers.clone(),
            Duration::from_millis(api.peer_timeout_ms),
        )
    }

    /// `http://{peer}/prepareds[/{key}]` with the key percent-encoded as one
    /// path segment.
    fn url(&self, peer: &str, key: Option<&str>) -> Result<Url, TransportError> {
        let invalid = |reason: String| TransportError::InvalidResponse {
            peer: peer.to_string(),
            reason,
        };
        let mut url = Url::parse(&format!("http://{peer}/")).map_err(|e| invalid(format!("bad peer address: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| invalid("peer address cannot carry a path".to_string()))?;
            segments.push("prepareds");
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    async fn bounded<T, F>(&self, peer: &str, request: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, reqwest::Error>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransportError::Unreachable {
                peer: peer.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Unreachable {
                peer: peer.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            }),
        }
    }
}

fn check_status(peer: &str, status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            peer: peer.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    fn local_node(&self) -> &str {
        &self.local
    }

    async fn members(&self) -> Option<Vec<String>> {
        Some(self.members.clone())
    }

    async fn put(&self, peer: &str, key: &str, encoded: &str) -> Result<(), TransportError> {
        let url = self.url(peer, Some(key))?;
        let body = PutPreparedRequest {
            encoded: encoded.to_string(),
        };
        let response = self
            .bounded(
                peer,
                self.client
                    .put(url)
                    .header(ORIGIN_HEADER, &self.local)
                    .json(&body)
                    .send(),
            )
            .await?;
        check_status(peer, response.status())?;
        debug!(peer, key, "plan pushed over HTTP");
        Ok(())
    }

    async fn list(&self, peer: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let url = self.url(peer, None)?;
        let response = self
            .bounded(peer, self.client.get(url).query(&[("prefix", prefix)]).send())
            .await?;
        check_status(peer, response.status())?;

        let listing: ListResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;
        Ok(listing.names)
    }

    async fn get(&self, peer: &str, key: &str) -> Result<Option<String>, TransportError> {
        let url = self.url(peer, Some(key))?;
        let response = self.bounded(peer, self.client.get(url).send()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(peer, response.status())?;

        let plan: EncodedPlanResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;
        if plan.name != key {
            return Err(TransportError::InvalidResponse {
                peer: peer.to_string(),
                reason: format!("asked for {key}, got {}", plan.name),
            });
        }
        Ok(Some(plan.encoded))
    }
}

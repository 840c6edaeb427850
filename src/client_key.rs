//! Client key derivation.
//!
//! The key names whose per-client bucket a request is charged to.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

const UNKNOWN_CLIENT: &str = "unknown";

/// Strategy for attributing a request to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// Peer IP address. Connections from one host share a bucket.
    #[default]
    RemoteIp,
    /// Peer IP and port. Every connection gets its own bucket.
    RemoteAddr,
    /// Last `X-Forwarded-For` hop, then `X-Real-IP`, then the peer IP.
    /// The last hop is the one appended by the proxy in front of us; earlier
    /// hops are whatever the client sent. Only meaningful behind such a proxy.
    ForwardedFor,
}

impl KeyStrategy {
    pub fn client_key(&self, request: &Request) -> String {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        self.key_from_parts(request.headers(), peer)
    }

    pub fn key_from_parts(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        match self {
            KeyStrategy::RemoteIp => peer_ip(peer),
            KeyStrategy::RemoteAddr => peer
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
            KeyStrategy::ForwardedFor => forwarded_ip(headers).unwrap_or_else(|| peer_ip(peer)),
        }
    }
}

fn peer_ip(peer: Option<SocketAddr>) -> String {
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            let last_ip = forwarded_str
                .rsplit(',')
                .map(str::trim)
                .find(|ip| !ip.is_empty());
            if let Some(last_ip) = last_ip {
                return Some(last_ip.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

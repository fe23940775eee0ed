// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent context: the explicit, passed-around registry of proxy clients.
//!
//! One context per agent process (or per test). Nothing here is global;
//! tests construct as many contexts as they like and run them in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::ProxyClient;
use crate::config::AgentConfig;
use crate::middleware::Middleware;
use crate::protocol::StatusCode;
use crate::session::SessionInfo;
use crate::types::ClientKey;

/// Holds every proxy client plus the middleware they bridge to.
pub struct AgentContext {
    config: AgentConfig,
    middleware: Arc<dyn Middleware>,
    clients: Mutex<HashMap<ClientKey, Arc<ProxyClient>>>,
}

impl AgentContext {
    #[must_use]
    pub fn new(config: AgentConfig, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            config,
            middleware,
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn middleware(&self) -> &Arc<dyn Middleware> {
        &self.middleware
    }

    /// CREATE_CLIENT: establish (or re-establish) a proxy.
    ///
    /// A second CREATE_CLIENT with the same key tears the old proxy down
    /// and starts fresh; the client rebuilt its state after a reboot and
    /// the stale object graph would only get in the way.
    pub fn create_client(&self, info: SessionInfo) -> StatusCode {
        let mut clients = self.clients.lock();
        if let Some(existing) = clients.remove(&info.client_key) {
            info!(client = %info.client_key, "client re-created; dropping previous proxy");
            existing.release();
        } else if clients.len() >= self.config.max_clients {
            warn!(client = %info.client_key, "error: RESOURCES (client table full)");
            return StatusCode::ErrResources;
        }
        let proxy = Arc::new(ProxyClient::new(info, Arc::clone(&self.middleware)));
        clients.insert(info.client_key, proxy);
        info!(client = %info.client_key, session_id = info.session_id, mtu = info.mtu, "client created");
        StatusCode::Ok
    }

    /// DELETE_CLIENT or connection teardown.
    pub fn delete_client(&self, key: ClientKey) -> StatusCode {
        let removed = self.clients.lock().remove(&key);
        match removed {
            Some(proxy) => {
                proxy.release();
                info!(client = %key, "client deleted");
                StatusCode::Ok
            }
            None => {
                warn!(client = %key, "error: UNKNOWN_REFERENCE (no such client)");
                StatusCode::ErrUnknownReference
            }
        }
    }

    #[must_use]
    pub fn get_client(&self, key: ClientKey) -> Option<Arc<ProxyClient>> {
        self.clients.lock().get(&key).cloned()
    }

    /// A snapshot of every live proxy, for maintenance sweeps.
    #[must_use]
    pub fn clients_snapshot(&self) -> Vec<Arc<ProxyClient>> {
        self.clients.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Drop every proxy that exceeded the liveliness window. Returns the
    /// reaped keys so the server can clean its endpoint mappings.
    pub fn reap_expired(&self) -> Vec<ClientKey> {
        let dead_time = self.config.client_dead_time;
        let mut clients = self.clients.lock();
        let expired: Vec<ClientKey> = clients
            .iter()
            .filter(|(_, c)| c.is_expired(dead_time))
            .map(|(&k, _)| k)
            .collect();
        for key in &expired {
            if let Some(proxy) = clients.remove(key) {
                proxy.release();
                info!(client = %key, "client timed out");
            }
        }
        expired
    }

    /// The per-operation timeout middleware calls run under.
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        self.config.middleware_op_timeout
    }
}

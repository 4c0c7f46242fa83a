//! Connection registry: one session client per configured role+endpoint.
//!
//! Built once from static configuration and owned explicitly by the
//! caller (no process-wide singleton); the orchestration layer receives
//! it by reference. Lookups are role-scoped; judge selection filters for
//! currently connected servers and picks uniformly at random. A periodic
//! sweep re-arms dead connections as a safety net behind the clients'
//! own reconnect scheduling.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::{ConnState, Endpoint, Role, SessionClient, RECONNECT_DELAY, REQUEST_TIMEOUT};
use crate::config::{JudgeServerSettings, Settings};

/// Interval of the background reconnect sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What a judge-server connection is used for. Maps one-to-one onto the
/// judge roles; capability is the vocabulary of callers picking a server,
/// role the vocabulary of the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgeCapability {
    Submit,
    Query,
    Discussion,
}

impl JudgeCapability {
    pub fn role(self) -> Role {
        match self {
            JudgeCapability::Submit => Role::JudgeSubmit,
            JudgeCapability::Query => Role::JudgeQuery,
            JudgeCapability::Discussion => Role::JudgeDiscussion,
        }
    }

    fn port(self, server: &JudgeServerSettings) -> Option<u16> {
        match self {
            JudgeCapability::Submit => server.submit_port,
            JudgeCapability::Query => server.query_port,
            JudgeCapability::Discussion => server.discussion_port,
        }
    }
}

/// Table key: at most one client exists per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub role: Role,
    pub endpoint: Endpoint,
}

/// Process-wide connection table.
pub struct Registry {
    clients: RwLock<HashMap<ClientKey, SessionClient>>,
    settings: Settings,
}

impl Registry {
    /// Build the table from configuration with default client timing.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_timing(settings, RECONNECT_DELAY, REQUEST_TIMEOUT)
    }

    /// Build with explicit per-client reconnect delay and request
    /// timeout.
    pub fn with_timing(
        settings: Settings,
        reconnect_delay: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let mut clients = HashMap::new();
        let mut register = |role: Role, endpoint: Endpoint| {
            let key = ClientKey {
                role,
                endpoint: endpoint.clone(),
            };
            clients.entry(key).or_insert_with(|| {
                SessionClient::with_timing(role, endpoint, reconnect_delay, request_timeout)
            });
        };

        if let Some(port) = settings.middle.account_port {
            register(Role::Account, Endpoint::new(settings.middle.host.as_str(), port));
        }
        if let Some(port) = settings.middle.message_port {
            register(Role::Message, Endpoint::new(settings.middle.host.as_str(), port));
        }
        for server in &settings.judge_servers {
            for cap in [
                JudgeCapability::Submit,
                JudgeCapability::Query,
                JudgeCapability::Discussion,
            ] {
                if let Some(port) = cap.port(server) {
                    register(cap.role(), Endpoint::new(server.host.as_str(), port));
                }
            }
        }

        info!(clients = clients.len(), "Connection registry built");
        Arc::new(Registry {
            clients: RwLock::new(clients),
            settings,
        })
    }

    /// Initial connection attempts for every registered client. Failures
    /// are tolerated; the reconnect machinery owns recovery.
    pub async fn connect_all(&self) {
        for client in self.all_clients() {
            let _ = client.connect().await;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn account_client(&self) -> Option<SessionClient> {
        let port = self.settings.middle.account_port?;
        self.lookup(Role::Account, Endpoint::new(self.settings.middle.host.as_str(), port))
    }

    pub fn message_client(&self) -> Option<SessionClient> {
        let port = self.settings.middle.message_port?;
        self.lookup(Role::Message, Endpoint::new(self.settings.middle.host.as_str(), port))
    }

    /// Client for one capability of one judge server, if configured.
    pub fn judge_client(&self, server_id: u8, cap: JudgeCapability) -> Option<SessionClient> {
        let server = self
            .settings
            .judge_servers
            .iter()
            .find(|s| s.id == server_id)?;
        let port = cap.port(server)?;
        self.lookup(cap.role(), Endpoint::new(server.host.as_str(), port))
    }

    /// Availability-filtered random selection: judge servers whose client
    /// for `cap` is currently connected, one picked uniformly at random.
    /// No weighting by load or latency.
    pub fn select_server(&self, cap: JudgeCapability) -> Option<u8> {
        let available: Vec<u8> = self
            .settings
            .judge_servers
            .iter()
            .filter(|s| {
                self.judge_client(s.id, cap)
                    .is_some_and(|c| c.is_connected())
            })
            .map(|s| s.id)
            .collect();

        if available.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..available.len());
        Some(available[idx])
    }

    /// Version string advertised to judge servers (problem-list refresh).
    pub fn protocol_version(&self) -> &str {
        &self.settings.protocol.version
    }

    /// Background sweep: every `interval`, reconnect any client that is
    /// disconnected with auto-reconnect enabled. Safety net for the case
    /// where a client's own reconnect scheduling was lost.
    pub fn spawn_sweep(registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for client in registry.all_clients() {
                    if client.state() == ConnState::Disconnected && client.auto_reconnect() {
                        debug!(role = %client.role(), endpoint = %client.endpoint(),
                               "Sweep reconnecting");
                        let _ = client.connect().await;
                    }
                }
            }
        })
    }

    /// Permanently disconnect every client (auto-reconnect disabled).
    pub async fn shutdown(&self) {
        info!("Shutting down connection registry");
        for client in self.all_clients() {
            client.disconnect().await;
        }
    }

    fn lookup(&self, role: Role, endpoint: Endpoint) -> Option<SessionClient> {
        let key = ClientKey { role, endpoint };
        self.clients.read().unwrap().get(&key).cloned()
    }

    fn all_clients(&self) -> Vec<SessionClient> {
        self.clients.read().unwrap().values().cloned().collect()
    }
}

//! Connection endpoint resolution.
//!
//! Derives the ordered candidate endpoints for an environment's database,
//! storage API, and management API. Resolution is pure computation over the
//! immutable [`Environment`]: no network calls, no errors, and never an
//! empty list, since the dedicated host is always constructible from the
//! project ref. Ordering is deterministic, highest likelihood of success
//! first, and the fallback loop in the executor walks it in order.

use serde::{Deserialize, Serialize};

use crate::config::Environment;

/// Shared pooler host suffix for region-scoped environments.
const POOLER_HOST_SUFFIX: &str = "pooler.supabase.com";

/// Dedicated database host suffix.
const DB_HOST_SUFFIX: &str = "supabase.co";

/// Management API host.
const MANAGEMENT_HOST: &str = "api.supabase.com";

/// What role an endpoint plays in the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    /// Shared pooler host at the pooled port.
    PooledShared,
    /// Shared pooler host at the direct port (misconfigured poolers).
    PooledAltPort,
    /// Dedicated host at the pooled port.
    DedicatedPooledPort,
    /// Dedicated host at the direct port.
    DedicatedDirect,
    /// Storage HTTP API.
    StorageApi,
    /// Management HTTP API.
    ManagementApi,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::PooledShared => "pooled",
            Self::PooledAltPort => "pooled-alt-port",
            Self::DedicatedPooledPort => "dedicated-pooled-port",
            Self::DedicatedDirect => "dedicated",
            Self::StorageApi => "storage-api",
            Self::ManagementApi => "management-api",
        };
        write!(f, "{label}")
    }
}

/// One concrete (host, port, principal) triple usable to reach an
/// environment, plus its role label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEndpoint {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Principal to authenticate as (database role or API role).
    pub principal: String,
    /// Role of this endpoint in the fallback order.
    pub kind: EndpointKind,
}

impl ConnectionEndpoint {
    /// Returns a short human-readable description used in logs and
    /// attempt records.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} {}:{}", self.kind, self.host, self.port)
    }
}

impl std::fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Resolver deriving candidate endpoints from an environment.
#[derive(Debug, Default)]
pub struct EndpointResolver;

impl EndpointResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Resolves the ordered database endpoint candidates.
    ///
    /// With a region hint the list has four entries: shared pooler at the
    /// pooled port, shared pooler at the direct port, dedicated host at the
    /// pooled port, dedicated host at the direct port. Without one, only
    /// the dedicated pair is derivable.
    #[must_use]
    pub fn resolve_database(&self, env: &Environment) -> Vec<ConnectionEndpoint> {
        let mut endpoints = Vec::with_capacity(4);

        if let Some(region) = &env.region {
            let pooler_host = format!("aws-0-{region}.{POOLER_HOST_SUFFIX}");
            let pooler_principal = format!("postgres.{}", env.project_ref);

            endpoints.push(ConnectionEndpoint {
                host: pooler_host.clone(),
                port: env.pooled_port,
                principal: pooler_principal.clone(),
                kind: EndpointKind::PooledShared,
            });
            endpoints.push(ConnectionEndpoint {
                host: pooler_host,
                port: env.direct_port,
                principal: pooler_principal,
                kind: EndpointKind::PooledAltPort,
            });
        }

        let dedicated_host = format!("db.{}.{DB_HOST_SUFFIX}", env.project_ref);
        endpoints.push(ConnectionEndpoint {
            host: dedicated_host.clone(),
            port: env.pooled_port,
            principal: String::from("postgres"),
            kind: EndpointKind::DedicatedPooledPort,
        });
        endpoints.push(ConnectionEndpoint {
            host: dedicated_host,
            port: env.direct_port,
            principal: String::from("postgres"),
            kind: EndpointKind::DedicatedDirect,
        });

        endpoints
    }

    /// Resolves the storage API endpoint list (single entry).
    #[must_use]
    pub fn resolve_storage(&self, env: &Environment) -> Vec<ConnectionEndpoint> {
        vec![ConnectionEndpoint {
            host: format!("{}.{DB_HOST_SUFFIX}", env.project_ref),
            port: 443,
            principal: String::from("service-role"),
            kind: EndpointKind::StorageApi,
        }]
    }

    /// Resolves the management API endpoint list (single entry).
    ///
    /// The management host is global, so the environment only scopes which
    /// access token is presented later.
    #[must_use]
    pub fn resolve_management(&self, _env: &Environment) -> Vec<ConnectionEndpoint> {
        vec![ConnectionEndpoint {
            host: String::from(MANAGEMENT_HOST),
            port: 443,
            principal: String::from("access-token"),
            kind: EndpointKind::ManagementApi,
        }]
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    /// The organization id cannot name a tenant.
    #[error("invalid organization id: {0}")]
    InvalidName(&'static str),

    #[error("too many tenants")]
    TooMany,

    #[error("tenant storage: {0}")]
    Io(#[from] std::io::Error),
}

/// Organization ids double as WAL file names, so they are restricted to
/// `[A-Za-z0-9_-]` and used verbatim. Anything else is refused rather than
/// rewritten, which would let two organizations share one log.
fn check_name(tenant: &str) -> Result<(), TenantError> {
    if tenant.is_empty() {
        return Err(TenantError::InvalidName("empty"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(TenantError::InvalidName("tenant name too long"));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TenantError::InvalidName(
            "only ASCII letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(())
}

/// Manages per-organization engines. Each organization gets its own Engine + WAL + compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    options: EngineOptions,
    max_tenants: usize,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, options: EngineOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            options,
            max_tenants: MAX_TENANTS,
        }
    }

    /// Lower the tenant cap (never raises it past `MAX_TENANTS`).
    pub fn with_max_tenants(mut self, max_tenants: usize) -> Self {
        self.max_tenants = max_tenants.min(MAX_TENANTS);
        self
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily create the engine for an organization.
    pub fn get_or_create(&self, tenant: &str) -> Result<Arc<Engine>, TenantError> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        check_name(tenant)?;
        if self.engines.len() >= self.max_tenants {
            return Err(TenantError::TooMany);
        }

        // Two first requests for one organization may race here; the loser's
        // engine is dropped and both callers get the winner's.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.options)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        let active = self.engines.len();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(active as f64);
        info!("loaded tenant {tenant} ({active} active)");
        Ok(engine)
    }
}

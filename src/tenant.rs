use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::retry::RetryPolicy;

/// File stem for a tenant's WAL, or why the name can't be a tenant.
///
/// Only alphanumerics, `_` and `-` survive, which keeps the WAL inside the
/// data directory.
pub fn wal_stem(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Kept alongside each engine so in-process consumers can subscribe.
    hubs: DashMap<String, Arc<NotifyHub>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    retry: RetryPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, retry: RetryPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            hubs: DashMap::new(),
            data_dir,
            compact_threshold,
            retry,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let safe_name = wal_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections racing on a new tenant must not open the same WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let hub = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, hub.clone(), self.retry.clone())?);
                self.hubs.insert(tenant.to_string(), hub);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(engine)
    }

    /// Notification hub of a loaded tenant.
    pub fn notify_hub(&self, tenant: &str) -> Option<Arc<NotifyHub>> {
        self.hubs.get(tenant).map(|h| h.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotificationKind;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatline_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, RetryPolicy::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same resource id in both tenants
        let rid = Ulid::new();
        eng_a.create_resource(rid, None, 1, OverflowPolicy::Waitlist).await.unwrap();
        eng_b.create_resource(rid, None, 1, OverflowPolicy::Waitlist).await.unwrap();

        eng_a.request_reservation(rid, "x", None).await.unwrap();
        let in_b = eng_b.request_reservation(rid, "y", None).await.unwrap();

        // Tenant A's confirmed seat is invisible to tenant B
        assert_eq!(in_b.state, ReservationState::Confirmed);
        assert_eq!(eng_a.get_availability(rid).await.unwrap().confirmed_count, 1);
        assert!(eng_b.get_reservation(rid, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[test]
    fn wal_stem_strips_separators() {
        assert_eq!(wal_stem("shop-eu_1").unwrap(), "shop-eu_1");
        assert_eq!(wal_stem("a/b.c").unwrap(), "abc");
        assert!(wal_stem("").is_err());
        assert!(wal_stem("/..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_hub_delivers_engine_notifications() {
        let tm = manager(test_data_dir("hub"));
        let engine = tm.get_or_create("events").unwrap();
        let rid = Ulid::new();
        engine.create_resource(rid, None, 1, OverflowPolicy::Waitlist).await.unwrap();

        let mut rx = tm.notify_hub("events").unwrap().subscribe(rid);
        engine.request_reservation(rid, "x", None).await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.kind, NotificationKind::Confirmed);
        assert_eq!(n.subject_id, "x");
        assert!(tm.notify_hub("unknown").is_none());
    }
}

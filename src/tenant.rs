use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;

/// Manages per-clinic engines. Each clinic gets its own Engine + WAL +
/// compactor. The clinic is the pgwire database name or the HTTP
/// `x-clinic` header.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    appointment_ms: Ms,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, appointment_ms: Ms) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            appointment_ms,
        }
    }

    /// Get or lazily create the engine for the given clinic. Names that
    /// sanitize to the same file name share one engine.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "clinic name too long",
            ));
        }

        // Only these characters reach the file system.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty clinic name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many clinics"));
        }

        // Holding the entry keeps a racing caller from opening a second
        // writer on the same WAL.
        let entry = self.engines.entry(safe_name.clone());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.appointment_ms)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(clinic = %safe_name, "clinic loaded");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Repository, Specialties};
    use crate::model::SpecialtyFields;
    use std::fs;
    use ulid::Ulid;

    const SLOT: Ms = 30 * 60_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("clinic_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn specialty(id: Ulid, name: &str) -> SpecialtyFields {
        SpecialtyFields {
            id: Some(id),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000, SLOT);

        let north = tm.get_or_create("north").unwrap();
        let south = tm.get_or_create("south").unwrap();

        // The same id and name can exist in both clinics.
        let id = Ulid::new();
        Specialties(&north).create(specialty(id, "Cardiology")).await.unwrap();
        Specialties(&south).create(specialty(id, "Cardiology")).await.unwrap();

        Specialties(&north).delete(id).await.unwrap();
        assert!(Specialties(&north).get(id).await.is_none());
        assert!(Specialties(&south).get(id).await.is_some());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000, SLOT);
        assert!(tm.is_empty());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_clinic").unwrap();
        assert!(dir.join("my_clinic.wal").exists());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000, SLOT);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_uses_configured_duration() {
        let dir = test_data_dir("duration");
        let tm = TenantManager::new(dir, 1000, 45 * 60_000);
        assert_eq!(tm.get_or_create("foo").unwrap().slot_ms(), 45 * 60_000);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000, SLOT);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_file_share_an_engine() {
        let dir = test_data_dir("shared_file");
        let tm = TenantManager::new(dir, 1000, SLOT);

        let plain = tm.get_or_create("evil").unwrap();
        let dotted = tm.get_or_create("../evil").unwrap();
        assert!(Arc::ptr_eq(&plain, &dotted));
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000, SLOT);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("clinic name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000, SLOT);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("c{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many clinics"));
    }
}

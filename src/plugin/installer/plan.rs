//! 升级/移除计划
//!
//! 计划以 JSON 数组形式保存在设置存储的 `plugin.plan` 容器中，
//! 宿主重启后由安装器在加载插件之前统一执行

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::types::{InstallError, PlanRemoveRecord, PlanUpgradeRecord};
use crate::plugin::types::PluginId;
use crate::settings::{SettingsError, SettingsStore};

pub const PLAN_CONTAINER: &str = "plugin.plan";
pub const UPGRADE_KEY: &str = "upgrade";
pub const REMOVE_KEY: &str = "remove";

/// 持久化的计划存储
pub struct PlanStore {
    settings: Arc<dyn SettingsStore>,
    // 串行化读-改-写
    write_lock: Mutex<()>,
}

impl PlanStore {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            write_lock: Mutex::new(()),
        }
    }

    pub fn upgrades(&self) -> Result<Vec<PlanUpgradeRecord>, SettingsError> {
        Ok(self
            .settings
            .get_as(PLAN_CONTAINER, UPGRADE_KEY)?
            .unwrap_or_default())
    }

    pub fn removes(&self) -> Result<Vec<PlanRemoveRecord>, SettingsError> {
        Ok(self
            .settings
            .get_as(PLAN_CONTAINER, REMOVE_KEY)?
            .unwrap_or_default())
    }

    pub fn pending_upgrade(&self, id: &PluginId) -> Result<Option<PlanUpgradeRecord>, SettingsError> {
        Ok(self.upgrades()?.into_iter().find(|r| &r.id == id))
    }

    /// 新增升级计划；同一插件已有计划时返回 AlreadyPlanned，不做任何修改
    pub fn add_upgrade(&self, record: PlanUpgradeRecord) -> Result<(), InstallError> {
        let _guard = self.write_lock.lock();
        let mut records = self.upgrades()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(InstallError::AlreadyPlanned(record.id.to_string()));
        }
        info!(
            "[计划] 登记升级: {} -> v{} ({})",
            record.id,
            record.version,
            record.source_path.display()
        );
        records.push(record);
        self.settings
            .set_as(PLAN_CONTAINER, UPGRADE_KEY, &records)?;
        Ok(())
    }

    /// 新增移除计划；重复登记是空操作，返回 false
    pub fn add_remove(&self, record: PlanRemoveRecord) -> Result<bool, InstallError> {
        let _guard = self.write_lock.lock();
        let mut records = self.removes()?;
        if records.iter().any(|r| r.id == record.id) {
            debug!("[计划] 移除计划已存在，忽略: {}", record.id);
            return Ok(false);
        }
        info!(
            "[计划] 登记移除: {} ({})",
            record.id,
            record.target_path.display()
        );
        records.push(record);
        self.settings.set_as(PLAN_CONTAINER, REMOVE_KEY, &records)?;
        Ok(true)
    }

    /// 删除已执行完成的升级计划
    pub fn complete_upgrade(&self, id: &PluginId) -> Result<bool, SettingsError> {
        let _guard = self.write_lock.lock();
        let mut records = self.upgrades()?;
        let before = records.len();
        records.retain(|r| &r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.settings
            .set_as(PLAN_CONTAINER, UPGRADE_KEY, &records)?;
        Ok(true)
    }

    /// 删除已执行完成的移除计划
    pub fn complete_remove(&self, id: &PluginId) -> Result<bool, SettingsError> {
        let _guard = self.write_lock.lock();
        let mut records = self.removes()?;
        let before = records.len();
        records.retain(|r| &r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.settings.set_as(PLAN_CONTAINER, REMOVE_KEY, &records)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::version::PluginVersion;
    use crate::settings::MemorySettingsStore;
    use chrono::Utc;
    use std::path::PathBuf;

    fn upgrade(id: &str) -> PlanUpgradeRecord {
        PlanUpgradeRecord {
            id: PluginId::new(id),
            current_path: PathBuf::from(format!("/plugins/{id}")),
            source_path: PathBuf::from(format!("/plugins/.staging/{id}.zip")),
            version: PluginVersion::new(2, 0, 0),
            planned_at: Utc::now(),
        }
    }

    fn remove(id: &str) -> PlanRemoveRecord {
        PlanRemoveRecord {
            id: PluginId::new(id),
            target_path: PathBuf::from(format!("/plugins/{id}")),
            planned_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_upgrade_rejected_without_mutation() {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        let store = PlanStore::new(settings.clone());

        store.add_upgrade(upgrade("hello")).unwrap();
        let snapshot = settings.get(PLAN_CONTAINER, UPGRADE_KEY).unwrap();

        let err = store.add_upgrade(upgrade("HELLO")).unwrap_err();
        assert!(matches!(err, InstallError::AlreadyPlanned(_)));
        assert_eq!(
            settings.get(PLAN_CONTAINER, UPGRADE_KEY).unwrap(),
            snapshot,
            "重复登记不应修改已持久化的计划"
        );
        assert_eq!(store.upgrades().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = PlanStore::new(Arc::new(MemorySettingsStore::new()));
        assert!(store.add_remove(remove("hello")).unwrap());
        assert!(!store.add_remove(remove("hello")).unwrap());
        assert_eq!(store.removes().unwrap().len(), 1);
    }

    #[test]
    fn test_complete_removes_only_target() {
        let store = PlanStore::new(Arc::new(MemorySettingsStore::new()));
        store.add_upgrade(upgrade("a")).unwrap();
        store.add_upgrade(upgrade("b")).unwrap();
        store.add_remove(remove("c")).unwrap();

        assert!(store.complete_upgrade(&PluginId::new("A")).unwrap());
        assert!(!store.complete_upgrade(&PluginId::new("a")).unwrap());
        assert!(store.complete_remove(&PluginId::new("c")).unwrap());

        let remaining: Vec<PluginId> = store.upgrades().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![PluginId::new("b")]);
        assert!(store.removes().unwrap().is_empty());
        assert!(store.pending_upgrade(&PluginId::new("b")).unwrap().is_some());
    }

    #[test]
    fn test_plans_survive_new_store_instance() {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        PlanStore::new(settings.clone())
            .add_upgrade(upgrade("hello"))
            .unwrap();
        let reopened = PlanStore::new(settings);
        let pending = reopened
            .pending_upgrade(&PluginId::new("hello"))
            .unwrap()
            .expect("计划应在新实例中可见");
        assert_eq!(pending.version, PluginVersion::new(2, 0, 0));
        assert_eq!(pending.source_path, PathBuf::from("/plugins/.staging/hello.zip"));
    }
}

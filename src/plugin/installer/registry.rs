//! 插件注册表
//!
//! 已安装插件台账，基于 installed_plugins 表

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::types::{InstallError, InstallSource, InstalledPlugin};
use crate::database::dao::installed_plugins::{InstalledPluginRow, InstalledPluginsDao};
use crate::database::{self, DbConnection};
use crate::plugin::checker::PluginLedger;
use crate::plugin::types::PluginId;
use crate::plugin::version::PluginVersion;

/// 插件注册表
#[derive(Clone)]
pub struct PluginRegistry {
    conn: DbConnection,
}

impl PluginRegistry {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }

    /// 打开数据库文件并建表
    pub fn from_path(db_path: &Path) -> Result<Self, InstallError> {
        let conn = database::open_database(db_path)
            .map_err(|e| InstallError::DatabaseError(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn register(&self, plugin: &InstalledPlugin) -> Result<(), InstallError> {
        let row = to_row(plugin)?;
        let conn = self.lock()?;
        InstalledPluginsDao::register(&conn, &row).map_err(db_error)
    }

    pub fn unregister(&self, id: &PluginId) -> Result<bool, InstallError> {
        let conn = self.lock()?;
        InstalledPluginsDao::unregister(&conn, id.as_str()).map_err(db_error)
    }

    pub fn get(&self, id: &PluginId) -> Result<Option<InstalledPlugin>, InstallError> {
        let row = {
            let conn = self.lock()?;
            InstalledPluginsDao::get(&conn, id.as_str()).map_err(db_error)?
        };
        row.map(from_row).transpose()
    }

    pub fn list(&self) -> Result<Vec<InstalledPlugin>, InstallError> {
        let rows = {
            let conn = self.lock()?;
            InstalledPluginsDao::list(&conn).map_err(db_error)?
        };
        rows.into_iter().map(from_row).collect()
    }

    pub fn exists(&self, id: &PluginId) -> Result<bool, InstallError> {
        let conn = self.lock()?;
        InstalledPluginsDao::exists(&conn, id.as_str()).map_err(db_error)
    }

    pub fn update_version(&self, id: &PluginId, version: &PluginVersion) -> Result<bool, InstallError> {
        let conn = self.lock()?;
        InstalledPluginsDao::update_version(&conn, id.as_str(), &version.to_string())
            .map_err(db_error)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, InstallError> {
        database::lock(&self.conn).map_err(|e| InstallError::DatabaseError(e.to_string()))
    }
}

impl PluginLedger for PluginRegistry {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion> {
        match self.get(id) {
            Ok(plugin) => plugin.map(|p| p.version),
            Err(e) => {
                warn!("[注册表] 查询插件 {} 失败: {}", id, e);
                None
            }
        }
    }
}

fn db_error(err: rusqlite::Error) -> InstallError {
    InstallError::DatabaseError(err.to_string())
}

fn to_row(plugin: &InstalledPlugin) -> Result<InstalledPluginRow, InstallError> {
    let source_type = match plugin.source {
        InstallSource::Local { .. } => "local",
        InstallSource::Url { .. } => "url",
    };
    Ok(InstalledPluginRow {
        id: plugin.id.to_string(),
        name: plugin.name.clone(),
        version: plugin.version.to_string(),
        description: Some(plugin.description.clone()).filter(|d| !d.is_empty()),
        author: plugin.author.clone(),
        install_path: plugin.install_path.to_string_lossy().to_string(),
        installed_at: plugin.installed_at.to_rfc3339(),
        source_type: source_type.to_string(),
        source_data: Some(serde_json::to_string(&plugin.source)?),
    })
}

fn from_row(row: InstalledPluginRow) -> Result<InstalledPlugin, InstallError> {
    let version = PluginVersion::parse(&row.version)
        .map_err(|e| InstallError::DatabaseError(format!("插件 {} 的{}", row.id, e)))?;
    let installed_at = DateTime::parse_from_rfc3339(&row.installed_at)
        .map_err(|e| InstallError::DatabaseError(format!("无效的时间格式: {}", e)))?
        .with_timezone(&Utc);
    let source = match row.source_data.as_deref() {
        Some(data) => serde_json::from_str(data)?,
        None => match row.source_type.as_str() {
            "url" => InstallSource::url(""),
            _ => InstallSource::local(&row.install_path),
        },
    };

    Ok(InstalledPlugin {
        id: PluginId::new(row.id),
        name: row.name,
        version,
        description: row.description.unwrap_or_default(),
        author: row.author,
        install_path: PathBuf::from(row.install_path),
        installed_at,
        source,
    })
}

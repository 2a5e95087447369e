//! 已安装插件数据访问对象
//!
//! 提供已安装插件台账的 CRUD 操作，id 比较大小写不敏感

use rusqlite::{params, Connection, OptionalExtension, Row};

/// 数据库行
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPluginRow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub install_path: String,
    /// RFC 3339
    pub installed_at: String,
    pub source_type: String,
    /// 来源的 JSON 表示
    pub source_data: Option<String>,
}

impl InstalledPluginRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            description: row.get(3)?,
            author: row.get(4)?,
            install_path: row.get(5)?,
            installed_at: row.get(6)?,
            source_type: row.get(7)?,
            source_data: row.get(8)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, name, version, description, author, install_path, installed_at, source_type, source_data
     FROM installed_plugins";

pub struct InstalledPluginsDao;

impl InstalledPluginsDao {
    /// 登记插件；同 id 记录被替换
    pub fn register(conn: &Connection, plugin: &InstalledPluginRow) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT OR REPLACE INTO installed_plugins
             (id, name, version, description, author, install_path, installed_at, source_type, source_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                plugin.id,
                plugin.name,
                plugin.version,
                plugin.description,
                plugin.author,
                plugin.install_path,
                plugin.installed_at,
                plugin.source_type,
                plugin.source_data,
            ],
        )?;

        Ok(())
    }

    /// 注销插件
    pub fn unregister(conn: &Connection, plugin_id: &str) -> Result<bool, rusqlite::Error> {
        let rows_affected = conn.execute(
            "DELETE FROM installed_plugins WHERE id = ?1",
            params![plugin_id],
        )?;

        Ok(rows_affected > 0)
    }

    pub fn get(
        conn: &Connection,
        plugin_id: &str,
    ) -> Result<Option<InstalledPluginRow>, rusqlite::Error> {
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![plugin_id],
            InstalledPluginRow::from_row,
        )
        .optional()
    }

    /// 列出所有插件，按 id 排序
    pub fn list(conn: &Connection) -> Result<Vec<InstalledPluginRow>, rusqlite::Error> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_COLUMNS))?;
        let rows = stmt
            .query_map([], InstalledPluginRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn exists(conn: &Connection, plugin_id: &str) -> Result<bool, rusqlite::Error> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM installed_plugins WHERE id = ?1",
            params![plugin_id],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    /// 只更新版本号，用于执行升级计划后
    pub fn update_version(
        conn: &Connection,
        plugin_id: &str,
        version: &str,
    ) -> Result<bool, rusqlite::Error> {
        let rows_affected = conn.execute(
            "UPDATE installed_plugins SET version = ?1 WHERE id = ?2",
            params![version, plugin_id],
        )?;

        Ok(rows_affected > 0)
    }
}

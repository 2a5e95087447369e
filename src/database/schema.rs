//! 数据库表结构

use rusqlite::Connection;

/// 创建所有表（幂等）
pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    // 通用键值设置，按容器分组；值为 JSON 文本
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            container TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (container, key)
        )",
        [],
    )?;

    // 已安装插件台账；id 大小写不敏感
    conn.execute(
        "CREATE TABLE IF NOT EXISTS installed_plugins (
            id TEXT PRIMARY KEY COLLATE NOCASE,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            description TEXT,
            author TEXT,
            install_path TEXT NOT NULL,
            installed_at TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_data TEXT
        )",
        [],
    )?;

    Ok(())
}

//! 设置数据访问对象
//!
//! 按 (container, key) 存取 JSON 文本值

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub struct SettingsDao;

impl SettingsDao {
    /// 读取设置值
    pub fn get(
        conn: &Connection,
        container: &str,
        key: &str,
    ) -> Result<Option<String>, rusqlite::Error> {
        conn.query_row(
            "SELECT value FROM settings WHERE container = ?1 AND key = ?2",
            params![container, key],
            |row| row.get(0),
        )
        .optional()
    }

    /// 写入设置值，已存在时覆盖
    pub fn set(
        conn: &Connection,
        container: &str,
        key: &str,
        value: &str,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT INTO settings (container, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(container, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![container, key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn exists(conn: &Connection, container: &str, key: &str) -> Result<bool, rusqlite::Error> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM settings WHERE container = ?1 AND key = ?2",
            params![container, key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 删除设置值，返回是否确实删除了记录
    pub fn delete(conn: &Connection, container: &str, key: &str) -> Result<bool, rusqlite::Error> {
        let rows_affected = conn.execute(
            "DELETE FROM settings WHERE container = ?1 AND key = ?2",
            params![container, key],
        )?;
        Ok(rows_affected > 0)
    }

    /// 列出容器中的所有键
    pub fn keys(conn: &Connection, container: &str) -> Result<Vec<String>, rusqlite::Error> {
        let mut stmt =
            conn.prepare("SELECT key FROM settings WHERE container = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![container], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::schema::create_tables;

    fn create_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_set_and_get() {
        let conn = create_test_connection();
        SettingsDao::set(&conn, "plan", "upgrade", "[]").unwrap();
        assert_eq!(
            SettingsDao::get(&conn, "plan", "upgrade").unwrap().as_deref(),
            Some("[]")
        );
        assert!(SettingsDao::get(&conn, "plan", "remove").unwrap().is_none());
        assert!(SettingsDao::get(&conn, "other", "upgrade").unwrap().is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let conn = create_test_connection();
        SettingsDao::set(&conn, "c", "k", "1").unwrap();
        SettingsDao::set(&conn, "c", "k", "2").unwrap();
        assert_eq!(SettingsDao::get(&conn, "c", "k").unwrap().as_deref(), Some("2"));
        assert_eq!(SettingsDao::keys(&conn, "c").unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_exists_and_delete() {
        let conn = create_test_connection();
        SettingsDao::set(&conn, "c", "k", "true").unwrap();
        assert!(SettingsDao::exists(&conn, "c", "k").unwrap());
        assert!(SettingsDao::delete(&conn, "c", "k").unwrap());
        assert!(!SettingsDao::exists(&conn, "c", "k").unwrap());
        assert!(!SettingsDao::delete(&conn, "c", "k").unwrap());
    }
}

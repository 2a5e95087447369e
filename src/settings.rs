//! 设置存储
//!
//! 以 (container, key) 为键、JSON 值为内容的持久化键值存储。
//! 升级/移除计划、插件启用开关都保存在这里

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::database::dao::settings::SettingsDao;
use crate::database::{self, DatabaseError, DbConnection};

/// 设置存储错误
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("数据库错误: {0}")]
    Database(#[from] DatabaseError),

    #[error("设置值 {container}/{key} 解析失败: {source}")]
    Decode {
        container: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("设置值序列化失败: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for SettingsError {
    fn from(err: rusqlite::Error) -> Self {
        SettingsError::Database(DatabaseError::Sqlite(err))
    }
}

/// 键值设置存储
pub trait SettingsStore: Send + Sync {
    fn get(&self, container: &str, key: &str) -> Result<Option<Value>, SettingsError>;

    fn set(&self, container: &str, key: &str, value: Value) -> Result<(), SettingsError>;

    fn contains(&self, container: &str, key: &str) -> Result<bool, SettingsError> {
        Ok(self.get(container, key)?.is_some())
    }

    /// 删除键，返回是否存在过
    fn remove(&self, container: &str, key: &str) -> Result<bool, SettingsError>;
}

impl dyn SettingsStore {
    /// 读取并反序列化为指定类型
    pub fn get_as<T: DeserializeOwned>(
        &self,
        container: &str,
        key: &str,
    ) -> Result<Option<T>, SettingsError> {
        match self.get(container, key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| SettingsError::Decode {
                    container: container.to_string(),
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// 序列化后写入
    pub fn set_as<T: Serialize>(
        &self,
        container: &str,
        key: &str,
        value: &T,
    ) -> Result<(), SettingsError> {
        self.set(container, key, serde_json::to_value(value)?)
    }
}

/// SQLite 设置存储
pub struct SqliteSettingsStore {
    conn: DbConnection,
}

impl SqliteSettingsStore {
    pub fn new(conn: DbConnection) -> Self {
        Self { conn }
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get(&self, container: &str, key: &str) -> Result<Option<Value>, SettingsError> {
        let conn = database::lock(&self.conn)?;
        let Some(raw) = SettingsDao::get(&conn, container, key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| SettingsError::Decode {
                container: container.to_string(),
                key: key.to_string(),
                source,
            })
    }

    fn set(&self, container: &str, key: &str, value: Value) -> Result<(), SettingsError> {
        let raw = serde_json::to_string(&value)?;
        let conn = database::lock(&self.conn)?;
        SettingsDao::set(&conn, container, key, &raw)?;
        Ok(())
    }

    fn contains(&self, container: &str, key: &str) -> Result<bool, SettingsError> {
        let conn = database::lock(&self.conn)?;
        Ok(SettingsDao::exists(&conn, container, key)?)
    }

    fn remove(&self, container: &str, key: &str) -> Result<bool, SettingsError> {
        let conn = database::lock(&self.conn)?;
        Ok(SettingsDao::delete(&conn, container, key)?)
    }
}

/// 内存设置存储，进程退出即丢失
#[derive(Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<(String, String), Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, container: &str, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self
            .values
            .read()
            .get(&(container.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, container: &str, key: &str, value: Value) -> Result<(), SettingsError> {
        self.values
            .write()
            .insert((container.to_string(), key.to_string()), value);
        Ok(())
    }

    fn remove(&self, container: &str, key: &str) -> Result<bool, SettingsError> {
        Ok(self
            .values
            .write()
            .remove(&(container.to_string(), key.to_string()))
            .is_some())
    }
}

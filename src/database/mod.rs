pub mod dao;
pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub type DbConnection = Arc<Mutex<Connection>>;

/// 数据库错误
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("无法创建数据库目录: {0}")]
    Io(#[from] std::io::Error),

    #[error("数据库连接锁已损坏")]
    Poisoned,
}

/// 默认数据库文件路径
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("plugin-runtime").join("runtime.db"))
}

/// 打开（必要时创建）数据库并建表
pub fn open_database(path: &Path) -> Result<DbConnection, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    schema::create_tables(&conn)?;
    tracing::debug!("[数据库] 已打开数据库: {}", path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// 内存数据库，主要用于测试和临时会话
pub fn open_in_memory() -> Result<DbConnection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    schema::create_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 获取连接锁
pub fn lock(conn: &DbConnection) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
    conn.lock().map_err(|_| DatabaseError::Poisoned)
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// PostgreSQL 唯一约束冲突 SQLSTATE / unique_violation SQLSTATE
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("配置错误: {0}")]
    Config(String),
    #[error("SQLx 错误: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("未找到记录")]
    NotFound,
    #[error("迁移错误: {0}")]
    Migrate(String),
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 是否唯一约束冲突 / Whether the sqlx error is a unique-key violation
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

/// 获取详细错误描述（中英文） / Get detailed error description (CN/EN)
pub fn describe_error(e: &DbError) -> String {
    match e {
        DbError::Config(msg) => format!("配置错误 / Config error: {}", msg),
        DbError::Sqlx(err) => format!("SQLx 错误 / SQLx error: {}", err),
        DbError::NotFound => "未找到记录 / Record not found".to_string(),
        DbError::Migrate(msg) => format!("迁移错误 / Migration error: {}", msg),
        DbError::Serde(msg) => format!("序列化错误 / Serialization error: {}", msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_describe_error_is_bilingual() {
        let text = describe_error(&DbError::Config("missing url".into()));
        assert!(text.contains("Config error"));
        assert!(text.contains("missing url"));
    }
}

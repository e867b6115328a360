use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use config::FileFormat as ConfigFormat;

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 配置错误类型 / Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置项 '{key}' 不存在")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("配置初始化失败: {message}")]
    InitializationError { message: String },
}

/// 配置数据源信息 / Loaded source description
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置管理器 / Layered configuration manager
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 创建配置管理器（仅默认配置源）/ Manager with default sources only
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用指定的配置源创建配置管理器
    /// Build with extra sources layered between the default files and the environment
    ///
    /// 优先级（低 -> 高）/ Priority (low -> high):
    /// development.toml -> default.toml -> production.toml -> 额外源 / extra sources -> 环境变量 `V_*`
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::new();

        let default_files = ["config/development.toml", "config/default.toml", "config/production.toml"]
            .into_iter()
            .map(|path| ConfigSource::File {
                path: path.to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            });
        let env = ConfigSource::Env {
            prefix: "V".to_string(),
            separator: "_",
        };

        for (index, source) in default_files
            .chain(sources)
            .chain(std::iter::once(env))
            .enumerate()
        {
            let mut info = source.describe(index as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && *required {
                    return Err(anyhow!("必需的配置文件不存在: {}", path));
                }
                if !exists {
                    // 可选文件不存在，记录但不添加
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source
                .add_to_builder(builder)
                .map_err(|e| anyhow!("添加配置源失败: {}", e))?;
            info.loaded = true;
            sources_info.push(info);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败: {}", e))?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 以指定文件为必需配置源创建 / Build with a required explicit file
    pub fn with_file(path: &str) -> Result<Self> {
        Self::with_sources(vec![ConfigSource::File {
            path: path.to_string(),
            format: None,
            required: true,
        }])
    }

    /// 获取指定 key 的配置值
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败: {}", key, e))
    }

    /// 获取指定 key 的配置值，如果不存在返回默认值
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 安全获取配置值，返回详细错误信息
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::TypeConversionError {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 检查配置项是否存在
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    pub fn sources_info(&self) -> &[ConfigSourceInfo] {
        &self.sources_info
    }

    /// 输出配置源信息到日志 / Log the source report
    pub fn log_sources_info(&self) {
        let loaded = self.sources_info.iter().filter(|info| info.loaded).count();
        for info in &self.sources_info {
            let status = if info.loaded { "✓" } else { "✗" };
            tracing::info!(
                "{} [{}] {} (priority {})",
                status,
                info.source_type,
                info.description,
                info.priority
            );
        }
        tracing::info!(
            "🔧 config sources: {} total, {} loaded",
            self.sources_info.len(),
            loaded
        );
    }
}

/// 配置源类型 / Configuration source
pub enum ConfigSource {
    /// 文件配置源（format=None 时按扩展名识别）
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源（HashMap）
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    fn describe(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => {
                ("File", format!("{} (required: {})", path, required))
            }
            ConfigSource::Env { prefix, separator } => {
                ("Environment", format!("prefix={}, separator={}", prefix, separator))
            }
            ConfigSource::Memory(map) => ("Memory", format!("{} keys", map.len())),
            ConfigSource::String { format, .. } => ("String", format!("{:?}", format)),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    pub fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file_source = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator(separator)
                    .prefix_separator("_")
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let json_content = serde_json::to_string(&map)
                    .map_err(|e| anyhow!("序列化内存配置失败: {}", e))?;
                Ok(builder.add_source(File::from_str(&json_content, FileFormat::Json)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

/// 获取全局配置管理器实例（单例模式，首次调用时按默认源构建）
/// Global manager; built from default sources on first use
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let manager = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置管理器锁失败: {}", e))?;
        if let Some(config_manager) = manager.as_ref() {
            return Ok(Arc::clone(config_manager));
        }
    }
    let mut manager = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    match manager.as_ref() {
        Some(existing) => Ok(Arc::clone(existing)),
        None => {
            let created = Arc::new(ConfigManager::new()?);
            *manager = Some(Arc::clone(&created));
            Ok(created)
        }
    }
}

/// 使用指定文件初始化全局配置（覆盖已有实例）
/// Install a global manager that includes `path` as a required source
pub fn init_global_config_with_file(path: &str) -> Result<Arc<ConfigManager>> {
    let created = Arc::new(ConfigManager::with_file(path)?);
    let mut manager = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    *manager = Some(Arc::clone(&created));
    Ok(created)
}

/// 全局配置获取函数（使用单例）
pub fn get_config<T: DeserializeOwned>(key: &str) -> Result<T> {
    get_global_config_manager()?.get(key)
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigManager, ConfigSource};
    use config::FileFormat;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_string() {
        let source = ConfigSource::String {
            content: "[presence]\nttl_secs = 90".to_string(),
            format: FileFormat::Toml,
        };
        let manager = ConfigManager::with_sources(vec![source]).unwrap();
        assert_eq!(manager.get::<i64>("presence.ttl_secs").unwrap(), 90);
        assert_eq!(manager.get_or("presence.heartbeat_ms", 30000_i64), 30000);
    }

    #[test]
    fn test_config_from_memory() {
        let mut map = HashMap::new();
        map.insert(
            "server".to_string(),
            serde_json::json!({ "host": "127.0.0.1" }),
        );
        let manager = ConfigManager::with_sources(vec![ConfigSource::Memory(map)]).unwrap();
        assert_eq!(manager.get::<String>("server.host").unwrap(), "127.0.0.1");
        assert!(manager.exists("server.host"));
        assert!(!manager.exists("server.missing"));
    }

    #[test]
    fn test_get_safe_reports_missing_key() {
        let manager = ConfigManager::with_sources(vec![]).unwrap();
        match manager.get_safe::<String>("definitely.not.here") {
            Err(ConfigError::KeyNotFound { key }) => assert_eq!(key, "definitely.not.here"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_required_file_missing_fails() {
        assert!(ConfigManager::with_file("config/__missing__.toml").is_err());
    }
}

//! 应用配置和持久化
//!
//! 提供设备名称、监听地址、下载目录等设置的存储和读取。

use crate::connection::{DEFAULT_PORT, DeviceKind, PeerConfig};
use crate::workflow::SessionOptions;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备名称（连接时发送给对端）
    pub device_name: String,
    /// 设备类型
    pub device_kind: DeviceKind,
    /// 监听地址
    pub listen_addr: String,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 空闲看门狗超时（毫秒）
    pub watchdog_ms: u64,
    /// 空闲看门狗容差（毫秒）
    pub watchdog_leeway_ms: u64,
    /// 分片大小（字节）
    pub fragment_size: usize,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            device_kind: DeviceKind::Host,
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            watchdog_ms: 15_000,
            watchdog_leeway_ms: 1_000,
            fragment_size: crate::codec::DEFAULT_FRAGMENT_SIZE,
            verbose: false,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wiredrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 从指定路径加载设置，读取或解析失败时使用默认值
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 本机身份
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig::new(self.device_name.clone(), self.device_kind)
    }

    /// 会话选项
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            watchdog_duration: Duration::from_millis(self.watchdog_ms),
            watchdog_leeway: Duration::from_millis(self.watchdog_leeway_ms),
            fragment_size: self.fragment_size,
        }
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "WireDrop".to_string())
}

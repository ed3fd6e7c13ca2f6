//! 日志配置

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// 日志级别（trace, debug, info, warn, error）或完整的 filter 指令
    pub level: String,

    /// 是否使用 JSON 格式
    pub json_format: bool,

    /// 模块级别的日志配置
    pub module_levels: BTreeMap<String, String>,

    /// 是否包含目标（target）
    pub include_target: bool,

    /// 是否启用 ANSI 颜色
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            module_levels: BTreeMap::new(),
            include_target: true,
            ansi_colors: true,
        }
    }
}

impl LogSettings {
    /// 设置日志级别
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// 设置是否使用 JSON 格式
    pub fn with_json_format(mut self, json: bool) -> Self {
        self.json_format = json;
        self
    }

    /// 添加模块特定的日志级别
    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.module_levels.insert(module.into(), level.into());
        self
    }
}

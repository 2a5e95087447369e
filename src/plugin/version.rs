//! 插件版本号
//!
//! 基于 semver 的可比较版本号，解析时兼容 `1`、`1.2`、`v1.2.3` 等宽松写法

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 版本号解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("无效的版本号: {input}")]
pub struct VersionParseError {
    pub input: String,
}

/// 插件版本
///
/// 全序可比较；缺省的次版本号/修订号按 0 补齐
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginVersion(semver::Version);

impl PluginVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// 0.0.0，用作"任意版本"约束的下界
    pub fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// 宽松解析版本号
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let error = || VersionParseError {
            input: input.to_string(),
        };

        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        // 拆出预发布/构建后缀，只对数字部分补齐
        let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
        let (core, suffix) = trimmed.split_at(split_at);

        let parts: Vec<&str> = core.split('.').collect();
        if core.is_empty() || parts.len() > 3 {
            return Err(error());
        }
        if !parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(error());
        }

        let mut normalized = parts.join(".");
        for _ in parts.len()..3 {
            normalized.push_str(".0");
        }
        normalized.push_str(suffix);

        semver::Version::parse(&normalized)
            .map(Self)
            .map_err(|_| error())
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }
}

impl Default for PluginVersion {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PluginVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PluginVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PluginVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

//! 插件依赖约束
//!
//! 清单中的依赖既可以写成紧凑字符串 (`"core>=1.0.0"`)，
//! 也可以写成对象 (`{"id": "core", "version": "1.0.0", "comparator": ">="}`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::{PluginError, PluginId};
use super::version::PluginVersion;

/// 版本比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// 版本必须完全一致
    #[serde(alias = "=", alias = "==")]
    Same,
    /// 候选版本 >= 要求版本
    #[default]
    #[serde(alias = ">=")]
    GreaterOrEqual,
    /// 候选版本 <= 要求版本
    #[serde(alias = "<=")]
    LesserOrEqual,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Same => "==",
            Comparator::GreaterOrEqual => ">=",
            Comparator::LesserOrEqual => "<=",
        }
    }

    /// 判断候选版本是否满足要求版本
    pub fn is_satisfied_by(&self, candidate: &PluginVersion, required: &PluginVersion) -> bool {
        match self {
            Comparator::Same => candidate == required,
            Comparator::GreaterOrEqual => candidate >= required,
            Comparator::LesserOrEqual => candidate <= required,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// 一条已解析的依赖约束
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyConstraint {
    pub target_id: PluginId,
    pub comparator: Comparator,
    pub required_version: PluginVersion,
}

impl DependencyConstraint {
    pub fn new(
        target_id: impl Into<PluginId>,
        comparator: Comparator,
        required_version: PluginVersion,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            comparator,
            required_version,
        }
    }

    /// 解析紧凑写法
    ///
    /// 支持 `id`、`id>=1.0`、`id<=1.0`、`id==1.0`、`id=1.0`；
    /// 只写 id 时等价于 `id>=0.0.0`
    pub fn parse(input: &str) -> Result<Self, PluginError> {
        let invalid = |reason: &str| {
            PluginError::InvalidManifest(format!("无效的依赖声明 '{}': {}", input, reason))
        };

        let trimmed = input.trim();
        let Some(op_start) = trimmed.find(['<', '>', '=']) else {
            if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
                return Err(invalid("插件 id 为空或包含空白字符"));
            }
            return Ok(Self::new(
                trimmed,
                Comparator::GreaterOrEqual,
                PluginVersion::zero(),
            ));
        };

        let id = trimmed[..op_start].trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(invalid("插件 id 为空或包含空白字符"));
        }

        let rest = &trimmed[op_start..];
        let (comparator, version) = if let Some(v) = rest.strip_prefix(">=") {
            (Comparator::GreaterOrEqual, v)
        } else if let Some(v) = rest.strip_prefix("<=") {
            (Comparator::LesserOrEqual, v)
        } else if let Some(v) = rest.strip_prefix("==") {
            (Comparator::Same, v)
        } else if let Some(v) = rest.strip_prefix('=') {
            (Comparator::Same, v)
        } else {
            return Err(invalid("不支持的比较符，仅支持 =、==、>=、<="));
        };

        let version = version.trim();
        if version.is_empty() {
            return Err(invalid("缺少版本号"));
        }
        let required_version =
            PluginVersion::parse(version).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self::new(id, comparator, required_version))
    }

    /// 给定依赖的实际版本，判断约束是否满足
    pub fn is_satisfied_by(&self, candidate: &PluginVersion) -> bool {
        self.comparator
            .is_satisfied_by(candidate, &self.required_version)
    }
}

impl fmt::Display for DependencyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.target_id, self.comparator, self.required_version
        )
    }
}

impl FromStr for DependencyConstraint {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 清单中依赖项的原始写法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Compact(String),
    Explicit {
        id: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        comparator: Comparator,
    },
}

impl TryFrom<&DependencySpec> for DependencyConstraint {
    type Error = PluginError;

    fn try_from(spec: &DependencySpec) -> Result<Self, Self::Error> {
        match spec {
            DependencySpec::Compact(raw) => DependencyConstraint::parse(raw),
            DependencySpec::Explicit {
                id,
                version,
                comparator,
            } => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(PluginError::InvalidManifest(
                        "依赖项的插件 id 不能为空".to_string(),
                    ));
                }
                let required_version = match version.as_deref() {
                    Some(v) => PluginVersion::parse(v).map_err(|e| {
                        PluginError::InvalidManifest(format!("依赖 {} 的{}", id, e))
                    })?,
                    None => PluginVersion::zero(),
                };
                Ok(DependencyConstraint::new(id, *comparator, required_version))
            }
        }
    }
}

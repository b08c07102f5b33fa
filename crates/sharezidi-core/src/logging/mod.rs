//! 日志模块
//!
//! 核心库只通过 `log` 门面输出日志，由宿主进程决定如何收集。
//! 这里定义配置文件使用的日志级别。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// `EnvFilter` 指令
    ///
    /// 中继核心至少输出 debug 级别，便于追踪单个传输。
    pub fn filter_directive(&self) -> String {
        let level = self.name().to_lowercase();
        let core = (*self).max(LogLevel::Debug).name().to_lowercase();
        format!("{level},sharezidi_core={core}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" => Ok(LogLevel::Warn),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            _ => Ok(LogLevel::Info), // 未知级别回退到 Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_lenient() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("Trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("loud".parse::<LogLevel>(), Ok(LogLevel::Info));
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(LogLevel::Info.filter_directive(), "info,sharezidi_core=debug");
        assert_eq!(LogLevel::Trace.filter_directive(), "trace,sharezidi_core=trace");
    }
}

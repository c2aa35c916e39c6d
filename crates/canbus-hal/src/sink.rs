//! 诊断消息输出（日志协作者）
//!
//! 驱动层在状态迁移和故障时发出一行诊断消息。接口是即发即弃的：
//! 实现不得阻塞，也不向调用方返回错误。

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SinkLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, level: SinkLevel, message: &str);
}

/// 转发到 `tracing`（target = `canbus::diag`）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, level: SinkLevel, message: &str) {
        match level {
            SinkLevel::Debug => debug!(target: "canbus::diag", "{}", message),
            SinkLevel::Info => info!(target: "canbus::diag", "{}", message),
            SinkLevel::Warn => warn!(target: "canbus::diag", "{}", message),
            SinkLevel::Error => error!(target: "canbus::diag", "{}", message),
        }
    }
}

/// 丢弃所有消息
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _level: SinkLevel, _message: &str) {}
}

/// 在内存中保留消息，用于测试和 CLI 回显
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(SinkLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取走目前为止的全部消息
    pub fn drain(&self) -> Vec<(SinkLevel, String)> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|(_, msg)| msg.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, level: SinkLevel, message: &str) {
        self.entries.lock().push((level, message.to_string()));
    }
}

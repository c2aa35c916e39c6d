//! 验收过滤器（Acceptance Filter）
//!
//! 过滤表在帧进入接收队列之前决定它的去留：
//!
//! - 空表 = 全部接收
//! - 规则按插入顺序求值，第一条命中的规则接收该帧
//! - 非空表且无规则命中 → 丢弃（由驱动层计入 `filtered_out`）
//!
//! 过滤表构造时完成校验，之后不可变；驱动层通过整表替换（原子交换）更新。

use crate::{CanFrame, EXTENDED_ID_MASK, ProtocolError, STANDARD_ID_MASK};

/// 单个过滤表允许的最大规则数
pub const MAX_FILTER_RULES: usize = 32;

/// 规则作用的帧格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum FrameScope {
    /// 仅标准帧（11-bit）
    Standard,
    /// 仅扩展帧（29-bit）
    Extended,
    /// 两种格式都适用
    #[default]
    Both,
}

impl FrameScope {
    pub fn matches(self, is_extended: bool) -> bool {
        match self {
            FrameScope::Standard => !is_extended,
            FrameScope::Extended => is_extended,
            FrameScope::Both => true,
        }
    }

    /// 该作用域下 ID / 掩码允许的位宽
    fn width_mask(self) -> u32 {
        match self {
            FrameScope::Standard => STANDARD_ID_MASK,
            FrameScope::Extended | FrameScope::Both => EXTENDED_ID_MASK,
        }
    }
}

/// 过滤规则
///
/// # 示例
///
/// ```
/// use canbus_protocol::{CanFrame, FilterRule, FrameScope};
///
/// // 接收 0x100..=0x1FF 的标准帧
/// let rule = FilterRule::mask(0x100, 0x700, FrameScope::Standard);
/// assert!(rule.matches(&CanFrame::new_standard(0x1AB, &[]).unwrap()));
/// assert!(!rule.matches(&CanFrame::new_standard(0x2AB, &[]).unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum FilterRule {
    /// ID + 掩码：掩码位为 1 的位必须与 `id` 相同
    Mask {
        id: u32,
        mask: u32,
        #[cfg_attr(feature = "serde", serde(default))]
        scope: FrameScope,
    },
    /// 精确匹配列表
    List {
        ids: Vec<u32>,
        #[cfg_attr(feature = "serde", serde(default))]
        scope: FrameScope,
    },
}

impl FilterRule {
    pub fn mask(id: u32, mask: u32, scope: FrameScope) -> Self {
        FilterRule::Mask { id, mask, scope }
    }

    /// 精确匹配单个 ID（掩码取该作用域的全部位）
    pub fn exact(id: u32, scope: FrameScope) -> Self {
        FilterRule::Mask {
            id,
            mask: scope.width_mask(),
            scope,
        }
    }

    pub fn list(ids: impl Into<Vec<u32>>, scope: FrameScope) -> Self {
        FilterRule::List {
            ids: ids.into(),
            scope,
        }
    }

    pub fn scope(&self) -> FrameScope {
        match self {
            FilterRule::Mask { scope, .. } | FilterRule::List { scope, .. } => *scope,
        }
    }

    /// 校验 ID / 掩码位宽与列表非空
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let width = self.scope().width_mask();
        match self {
            FilterRule::Mask { id, mask, .. } => {
                if id & !width != 0 {
                    return Err(ProtocolError::InvalidFilter(format!(
                        "id 0x{:X} exceeds {:?} identifier width",
                        id,
                        self.scope()
                    )));
                }
                if mask & !width != 0 {
                    return Err(ProtocolError::InvalidFilter(format!(
                        "mask 0x{:X} exceeds {:?} identifier width",
                        mask,
                        self.scope()
                    )));
                }
            },
            FilterRule::List { ids, .. } => {
                if ids.is_empty() {
                    return Err(ProtocolError::InvalidFilter(
                        "accept list must not be empty".to_string(),
                    ));
                }
                if let Some(bad) = ids.iter().find(|id| *id & !width != 0) {
                    return Err(ProtocolError::InvalidFilter(format!(
                        "list id 0x{:X} exceeds {:?} identifier width",
                        bad,
                        self.scope()
                    )));
                }
            },
        }
        Ok(())
    }

    pub fn matches(&self, frame: &CanFrame) -> bool {
        if !self.scope().matches(frame.is_extended()) {
            return false;
        }
        match self {
            FilterRule::Mask { id, mask, .. } => (frame.id() & mask) == (id & mask),
            FilterRule::List { ids, .. } => ids.contains(&frame.id()),
        }
    }
}

/// 验收过滤表（已校验、不可变）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterTable {
    rules: Vec<FilterRule>,
}

impl FilterTable {
    /// 空表：接收所有帧
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// 校验并构造过滤表
    ///
    /// # 错误
    ///
    /// - `InvalidFilter`: 任一规则非法，或规则数超过 [`MAX_FILTER_RULES`]
    pub fn new(rules: Vec<FilterRule>) -> Result<Self, ProtocolError> {
        if rules.len() > MAX_FILTER_RULES {
            return Err(ProtocolError::InvalidFilter(format!(
                "too many rules: {} (max {})",
                rules.len(),
                MAX_FILTER_RULES
            )));
        }
        for (index, rule) in rules.iter().enumerate() {
            rule.validate().map_err(|e| match e {
                ProtocolError::InvalidFilter(msg) => {
                    ProtocolError::InvalidFilter(format!("rule #{}: {}", index, msg))
                },
                other => other,
            })?;
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 帧是否被接收
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        self.rules.is_empty() || self.matching_rule(frame).is_some()
    }

    /// 第一条命中规则的下标（按插入顺序）
    pub fn matching_rule(&self, frame: &CanFrame) -> Option<usize> {
        self.rules.iter().position(|rule| rule.matches(frame))
    }
}

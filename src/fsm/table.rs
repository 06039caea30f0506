//! 状态转移表：纯数据
//!
//! 每条规则 = (源状态, 触发器, 可选守卫, 目标状态)；入口/出口动作只登记「哪个状态有动作」，
//! 动作本体由驱动方实现 `StateActions` 并由引擎按状态 id 查找、显式 await。
//! 表本身不做任何 I/O，可脱离副作用单独测试。

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

/// 守卫谓词：只读访问会话/对话数据
pub type Guard<C> = fn(&C) -> bool;

/// 一条转移规则
pub struct TransitionRule<S, T, C> {
    pub source: S,
    pub trigger: T,
    pub guard: Option<Guard<C>>,
    pub destination: S,
}

impl<S: Copy, T: Copy, C> Clone for TransitionRule<S, T, C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            trigger: self.trigger,
            guard: self.guard,
            destination: self.destination,
        }
    }
}

/// 表校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// 同一 (state, trigger) 上，无守卫规则之后还登记了规则：后者永远不会被选中
    #[error("rule #{index} for ({source_state}, {trigger}) is shadowed by an unguarded rule")]
    ShadowedRule {
        index: usize,
        source_state: String,
        trigger: String,
    },
}

/// 状态转移表
pub struct TransitionTable<S, T, C> {
    rules: Vec<TransitionRule<S, T, C>>,
    entry_actions: HashSet<S>,
    exit_actions: HashSet<S>,
}

impl<S, T, C> Default for TransitionTable<S, T, C>
where
    S: Copy + Eq + Hash + Debug,
    T: Copy + Eq + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T, C> TransitionTable<S, T, C>
where
    S: Copy + Eq + Hash + Debug,
    T: Copy + Eq + Debug,
{
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            entry_actions: HashSet::new(),
            exit_actions: HashSet::new(),
        }
    }

    /// 无条件转移
    pub fn permit(mut self, source: S, trigger: T, destination: S) -> Self {
        self.rules.push(TransitionRule {
            source,
            trigger,
            guard: None,
            destination,
        });
        self
    }

    /// 带守卫的转移；同一 (state, trigger) 按登记顺序求值，第一个为真的生效
    pub fn permit_if(mut self, source: S, trigger: T, guard: Guard<C>, destination: S) -> Self {
        self.rules.push(TransitionRule {
            source,
            trigger,
            guard: Some(guard),
            destination,
        });
        self
    }

    /// 同一触发器从多个源状态转到同一目标（如各状态上的 Cancel）
    pub fn permit_from(mut self, sources: &[S], trigger: T, destination: S) -> Self {
        for source in sources {
            self = self.permit(*source, trigger, destination);
        }
        self
    }

    /// 登记入口动作
    pub fn on_entry(mut self, state: S) -> Self {
        self.entry_actions.insert(state);
        self
    }

    /// 登记出口动作
    pub fn on_exit(mut self, state: S) -> Self {
        self.exit_actions.insert(state);
        self
    }

    /// (state, trigger) 的候选规则，保持登记顺序
    pub fn candidates(&self, source: S, trigger: T) -> impl Iterator<Item = &TransitionRule<S, T, C>> {
        self.rules
            .iter()
            .filter(move |r| r.source == source && r.trigger == trigger)
    }

    pub fn has_entry(&self, state: S) -> bool {
        self.entry_actions.contains(&state)
    }

    pub fn has_exit(&self, state: S) -> bool {
        self.exit_actions.contains(&state)
    }

    /// 某状态上定义了规则的触发器（去重，保持顺序）
    pub fn permitted_triggers(&self, source: S) -> Vec<T> {
        let mut triggers: Vec<T> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.source == source) {
            if !triggers.contains(&rule.trigger) {
                triggers.push(rule.trigger);
            }
        }
        triggers
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 检查是否存在被无守卫规则遮蔽的规则
    pub fn validate(&self) -> Result<(), TableError> {
        for (index, rule) in self.rules.iter().enumerate() {
            let shadowed = self.rules[..index].iter().any(|earlier| {
                earlier.source == rule.source
                    && earlier.trigger == rule.trigger
                    && earlier.guard.is_none()
            });
            if shadowed {
                return Err(TableError::ShadowedRule {
                    index,
                    source_state: format!("{:?}", rule.source),
                    trigger: format!("{:?}", rule.trigger),
                });
            }
        }
        Ok(())
    }
}

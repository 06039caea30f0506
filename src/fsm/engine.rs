//! 状态机引擎：驱动单个状态机实例
//!
//! `fire` 的顺序固定：查表 → 按登记顺序求守卫 → 出口动作 → 提交新状态 → 入口动作。
//! 入口动作可返回一个链式触发器；链式触发在当前转移提交完成后，于同一次 `fire` 调用内
//! 继续执行（循环而非递归），因此始终处在调用方的串行化点上。
//!
//! 入口动作失败时**不回滚**：状态在入口动作运行前已提交，返回 `ActionFailed` 让调用方
//! 决定如何告知用户。

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

use super::table::TransitionTable;
use crate::core::DialogError;

/// 链式触发的最大深度，超过视为表配置错误（环）
pub const MAX_CHAIN_DEPTH: usize = 16;

/// 状态动作：由状态机的宿主（编排器 / 子对话）实现，引擎按状态 id 调用
#[async_trait]
pub trait StateActions<S, T>: Send
where
    S: Send + 'static,
    T: Send + 'static,
{
    /// 离开 `state` 前执行
    async fn on_exit(&mut self, _state: S) -> Result<(), DialogError> {
        Ok(())
    }

    /// 进入 `state` 后执行；返回 `Some(trigger)` 表示链式触发
    async fn on_entry(&mut self, state: S) -> Result<Option<T>, DialogError>;
}

/// 一次 `fire` 的结果
#[derive(Debug)]
pub enum FireOutcome<S> {
    /// (state, trigger) 在表中没有规则；状态不变
    NoTransition,
    /// 有规则但守卫全部为假；状态不变，未执行任何动作
    GuardRejected,
    /// 转移完成（含所有链式触发）后的状态
    Transitioned(S),
    /// 动作失败。出口动作失败时 `state` 为源状态；入口动作失败时为已提交的目标状态
    ActionFailed { state: S, error: DialogError },
}

impl<S> FireOutcome<S> {
    pub fn is_transitioned(&self) -> bool {
        matches!(self, FireOutcome::Transitioned(_))
    }
}

enum Step<S, T> {
    NoTransition,
    GuardRejected,
    Committed { state: S, chained: Option<T> },
    Failed { state: S, error: DialogError },
}

/// 状态机实例：只持有当前状态，规则与动作分别由表和宿主提供
#[derive(Debug, Clone)]
pub struct StateMachine<S> {
    name: &'static str,
    state: S,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            state: initial,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 触发一次转移，链式触发在返回前全部执行完毕
    pub async fn fire<T, C>(
        &mut self,
        table: &TransitionTable<S, T, C>,
        ctx: &mut C,
        trigger: T,
    ) -> FireOutcome<S>
    where
        T: Copy + Eq + Debug + Send + 'static,
        C: StateActions<S, T>,
    {
        let mut trigger = trigger;
        let mut depth = 0usize;

        loop {
            match self.step(table, ctx, trigger).await {
                Step::NoTransition if depth == 0 => return FireOutcome::NoTransition,
                Step::GuardRejected if depth == 0 => return FireOutcome::GuardRejected,
                Step::NoTransition | Step::GuardRejected => {
                    tracing::error!(
                        machine = self.name,
                        state = ?self.state,
                        trigger = ?trigger,
                        "chained trigger has no applicable rule"
                    );
                    return FireOutcome::Transitioned(self.state);
                }
                Step::Failed { state, error } => {
                    tracing::error!(
                        machine = self.name,
                        state = ?state,
                        trigger = ?trigger,
                        "state action failed: {}",
                        error
                    );
                    return FireOutcome::ActionFailed { state, error };
                }
                Step::Committed { state, chained: None } => {
                    return FireOutcome::Transitioned(state);
                }
                Step::Committed {
                    state,
                    chained: Some(next),
                } => {
                    depth += 1;
                    if depth > MAX_CHAIN_DEPTH {
                        return FireOutcome::ActionFailed {
                            state,
                            error: DialogError::InvariantViolation(format!(
                                "{}: chained transitions exceeded depth {}",
                                self.name, MAX_CHAIN_DEPTH
                            )),
                        };
                    }
                    trigger = next;
                }
            }
        }
    }

    async fn step<T, C>(
        &mut self,
        table: &TransitionTable<S, T, C>,
        ctx: &mut C,
        trigger: T,
    ) -> Step<S, T>
    where
        T: Copy + Eq + Debug + Send + 'static,
        C: StateActions<S, T>,
    {
        let source = self.state;
        let mut matched = false;
        let mut destination = None;

        for rule in table.candidates(source, trigger) {
            matched = true;
            let passes = match rule.guard {
                Some(guard) => guard(&*ctx),
                None => true,
            };
            if passes {
                destination = Some(rule.destination);
                break;
            }
        }

        let destination = match (matched, destination) {
            (false, _) => return Step::NoTransition,
            (true, None) => {
                tracing::debug!(machine = self.name, state = ?source, trigger = ?trigger, "guard rejected");
                return Step::GuardRejected;
            }
            (true, Some(d)) => d,
        };

        if table.has_exit(source) {
            if let Err(error) = ctx.on_exit(source).await {
                return Step::Failed {
                    state: source,
                    error,
                };
            }
        }

        self.state = destination;
        tracing::debug!(
            machine = self.name,
            from = ?source,
            to = ?destination,
            trigger = ?trigger,
            "transition committed"
        );

        if !table.has_entry(destination) {
            return Step::Committed {
                state: destination,
                chained: None,
            };
        }

        match ctx.on_entry(destination).await {
            Ok(chained) => Step::Committed {
                state: destination,
                chained,
            },
            Err(error) => Step::Failed {
                state: destination,
                error,
            },
        }
    }
}

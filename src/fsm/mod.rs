//! 状态机层：转移表（纯数据）+ 引擎（按表驱动，显式 await 动作）

pub mod engine;
pub mod table;

pub use engine::{FireOutcome, StateActions, StateMachine, MAX_CHAIN_DEPTH};
pub use table::{Guard, TableError, TransitionRule, TransitionTable};

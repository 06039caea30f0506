//! 会话快照：Orchestrator 内部状态的只读投影
//!
//! 每处理完一个入站事件，worker 把快照发布到 watch 通道；宿主和测试只读快照，不碰内部状态。

use serde::Serialize;

use crate::dialogs::DialogKind;

/// 编排器（顶层状态机）状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OrchestratorState {
    Connected,
    Starting,
    EnteringName,
    Idle,
    HardwareTutorial,
    WorkflowTutorial,
    CollectingObject,
    SearchingModel,
    ModelReceived,
    Slicing,
    Checklist,
    Ended,
}

impl OrchestratorState {
    /// 委托给子对话的状态
    pub fn delegated_dialog(&self) -> Option<DialogKind> {
        match self {
            OrchestratorState::HardwareTutorial => Some(DialogKind::HardwareTutorial),
            OrchestratorState::WorkflowTutorial => Some(DialogKind::WorkflowTutorial),
            OrchestratorState::CollectingObject => Some(DialogKind::ObjectCollection),
            OrchestratorState::SearchingModel => Some(DialogKind::ModelSearch),
            OrchestratorState::Slicing => Some(DialogKind::Slicing),
            OrchestratorState::Checklist => Some(DialogKind::Checklist),
            _ => None,
        }
    }
}

/// 外部可见的会话快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: OrchestratorState,
    pub active_dialog: Option<DialogKind>,
    pub user_name: Option<String>,
    pub pending_print_object: Option<String>,
    pub selected_model_path: Option<String>,
    pub context_scope: Vec<String>,
    /// 已处理的入站事件数
    pub processed: u64,
    /// 最后活跃时间（Unix 毫秒）
    pub last_activity_at: i64,
}

impl SessionSnapshot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: OrchestratorState::Connected,
            active_dialog: None,
            user_name: None,
            pending_print_object: None,
            selected_model_path: None,
            context_scope: Vec::new(),
            processed: 0,
            last_activity_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == OrchestratorState::Ended
    }
}

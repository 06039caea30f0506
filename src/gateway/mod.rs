//! 会话层：会话数据与会话注册表
//!
//! 注册表是跨会话共享的唯一状态；每个会话由自己的 worker 串行处理，
//! 宿主（控制台、聊天平台适配器）只需调用 `dispatch` 投递原始事件。

mod registry;
mod session;

pub use registry::{RegistryError, SessionRegistry};
pub use session::{Session, SessionId};

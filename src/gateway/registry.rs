//! 会话注册表：会话 id → 串行处理 worker
//!
//! 每个会话一个 tokio 任务和一条无界队列；同一会话的所有入站项（消息、回调、定时器、任务完成）
//! 按到达顺序逐个处理，不同会话互不阻塞。注册表本身用 DashMap 按 key 分片加锁。
//!
//! 注意：不在持有 DashMap 引用时 await 或对同一 key 调用 remove。
//!
//! 会话结束（Ended）后才到的用户输入不丢弃：worker 在表项锁内关闭队列，把这些输入按原顺序
//! 交给同一 id 的新会话。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::session::SessionId;
use crate::core::{Disposition, Orchestrator, OrchestratorDeps, SessionSnapshot};
use crate::router::RawEvent;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry is shut down")]
    ShutDown,

    #[error("Session {0} could not accept the event")]
    WorkerUnavailable(String),
}

/// 注册表中一个会话的句柄
struct SessionHandle {
    tx: mpsc::UnboundedSender<RawEvent>,
    cancel: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
    /// 区分同一 id 先后创建的 worker，避免旧 worker 退出时删掉新会话
    epoch: Uuid,
    /// 最后活跃时间（Unix 毫秒），供过期清理读取
    last_activity: Arc<AtomicI64>,
    /// 已入队的用户输入数
    accepted: Arc<AtomicU64>,
    /// 已处理完（快照已发布）的用户输入数
    handled: watch::Receiver<u64>,
}

impl SessionHandle {
    fn send(&self, event: RawEvent) -> Result<(), mpsc::error::SendError<RawEvent>> {
        let user_input = event.instance().is_none();
        if user_input {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
        self.tx.send(event).map_err(|e| {
            if user_input {
                self.accepted.fetch_sub(1, Ordering::SeqCst);
            }
            e
        })
    }
}

/// 会话注册表（可廉价克隆，克隆共享同一张表）
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    deps: OrchestratorDeps,
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            deps,
            root: CancellationToken::new(),
        }
    }

    /// 投递一个入站事件；首次联系时创建会话，已终止的会话会被重新创建
    pub fn dispatch(&self, session_id: &str, event: RawEvent) -> Result<(), RegistryError> {
        if self.root.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }

        let mut event = event;
        for _ in 0..2 {
            let sent = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| self.spawn_session(session_id))
                .send(event);

            match sent {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(back)) => {
                    tracing::debug!(session_id, "session worker gone, recreating");
                    self.sessions.remove_if(session_id, |_, h| h.tx.is_closed());
                    event = back;
                }
            }
        }
        Err(RegistryError::WorkerUnavailable(session_id.to_string()))
    }

    /// 最近一次发布的快照
    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(session_id)
            .map(|h| h.snapshot.borrow().clone())
    }

    /// 订阅快照（每处理完一个入站项更新一次）
    pub fn subscribe(&self, session_id: &str) -> Option<watch::Receiver<SessionSnapshot>> {
        self.sessions.get(session_id).map(|h| h.snapshot.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// 移除会话：取消其令牌，worker 随之退出，子对话的定时器一并停止
    pub fn remove(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                tracing::info!(session_id, "session removed");
                true
            }
            None => false,
        }
    }

    /// 移除超过 `timeout` 未活动的会话，返回移除数量
    pub fn cleanup_expired(&self, timeout: Duration) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let limit = timeout.as_millis() as i64;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| now - entry.last_activity.load(Ordering::Relaxed) > limit)
            .map(|entry| entry.key().clone())
            .collect();

        expired.iter().filter(|id| self.remove(id)).count()
    }

    /// 等到该会话已投递的用户输入全部处理完（会话结束后转交给新会话的也算在内）
    pub async fn drain(&self, session_id: &str) {
        loop {
            let Some((mut handled, target, epoch)) = self.sessions.get(session_id).map(|h| {
                (
                    h.handled.clone(),
                    h.accepted.load(Ordering::SeqCst),
                    h.epoch,
                )
            }) else {
                return;
            };

            let idle = handled.wait_for(|n| *n >= target).await.is_ok();
            if idle {
                return;
            }
            // worker 已退出；表项换成新会话时继续等新会话
            if self.sessions.get(session_id).map(|h| h.epoch) == Some(epoch) {
                return;
            }
        }
    }

    /// 周期清理过期会话，注册表关闭时退出
    pub fn spawn_sweeper(&self, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = registry.root.cancelled() => break,
                    _ = timer.tick() => {
                        let expired = registry.cleanup_expired(timeout);
                        if expired > 0 {
                            tracing::info!("Cleaned up {} expired sessions", expired);
                        }
                    }
                }
            }
        })
    }

    /// 取消所有会话并拒绝新的事件
    pub fn shutdown(&self) {
        self.root.cancel();
        self.sessions.clear();
        tracing::info!("session registry shut down");
    }

    fn spawn_session(&self, session_id: &str) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.root.child_token();
        let orchestrator = Orchestrator::new(session_id, &self.deps, tx.clone(), cancel.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(orchestrator.snapshot());
        let epoch = Uuid::new_v4();
        let last_activity = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));
        let (handled_tx, handled_rx) = watch::channel(0u64);

        let worker = SessionWorker {
            session_id: session_id.to_string(),
            epoch,
            orchestrator,
            rx,
            cancel: cancel.clone(),
            snapshot: snapshot_tx,
            last_activity: last_activity.clone(),
            handled: handled_tx,
            registry: self.clone(),
        };
        tokio::spawn(worker.run());
        tracing::info!(session_id, %epoch, "session created");

        SessionHandle {
            tx,
            cancel,
            snapshot: snapshot_rx,
            epoch,
            last_activity,
            accepted: Arc::new(AtomicU64::new(0)),
            handled: handled_rx,
        }
    }
}

/// 单个会话的串行处理循环
struct SessionWorker {
    session_id: SessionId,
    epoch: Uuid,
    orchestrator: Orchestrator,
    rx: mpsc::UnboundedReceiver<RawEvent>,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    last_activity: Arc<AtomicI64>,
    handled: watch::Sender<u64>,
    registry: SessionRegistry,
}

impl SessionWorker {
    async fn run(mut self) {
        let session_id = self.session_id.clone();
        let mut ended = false;
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(raw) => raw,
                    None => break,
                },
            };
            let user_input = raw.instance().is_none();

            let disposition = match AssertUnwindSafe(self.orchestrator.handle(raw))
                .catch_unwind()
                .await
            {
                Ok(disposition) => disposition,
                Err(_) => {
                    tracing::error!(session_id = %session_id, "event handler panicked, closing session");
                    Disposition::Terminate
                }
            };

            let snapshot = self.orchestrator.snapshot();
            self.last_activity
                .store(snapshot.last_activity_at, Ordering::Relaxed);
            let _ = self.snapshot.send(snapshot);
            if user_input {
                self.handled.send_modify(|n| *n += 1);
            }

            if disposition == Disposition::Terminate {
                tracing::info!(session_id = %session_id, "session ended");
                ended = true;
                break;
            }
        }

        self.orchestrator.shutdown();
        self.finish(ended);
    }

    /// 在表项锁内关闭队列：并发的 dispatch 要么已进队列，要么等锁释放后看到新表项
    fn finish(mut self, ended: bool) {
        let session_id = self.session_id.clone();
        let registry = self.registry.clone();

        match registry.sessions.entry(session_id.clone()) {
            Entry::Occupied(mut slot) if slot.get().epoch == self.epoch => {
                let (replay, stale) = self.close_queue();
                if stale > 0 {
                    tracing::debug!(session_id = %session_id, stale, "background events after session end dropped");
                }

                if ended && !replay.is_empty() && !registry.root.is_cancelled() {
                    let handle = registry.spawn_session(&session_id);
                    let count = replay.len();
                    for raw in replay {
                        if handle.send(raw).is_err() {
                            tracing::error!(session_id = %session_id, "new session refused replayed input");
                            break;
                        }
                    }
                    slot.insert(handle);
                    tracing::info!(session_id = %session_id, count, "input after session end handed to a new session");
                } else {
                    if !replay.is_empty() {
                        tracing::warn!(session_id = %session_id, dropped = replay.len(), "input after session close dropped");
                    }
                    slot.remove();
                }
            }
            _ => {
                // 已被移除或替换（清理、关闭）：不再投递
                let (replay, _) = self.close_queue();
                if !replay.is_empty() {
                    tracing::warn!(session_id = %session_id, dropped = replay.len(), "input for a removed session dropped");
                }
            }
        };
    }

    /// 关闭并取空队列，返回（用户输入, 丢弃的后台事件数）
    fn close_queue(&mut self) -> (Vec<RawEvent>, usize) {
        self.rx.close();
        let mut replay = Vec::new();
        let mut stale = 0usize;
        while let Ok(raw) = self.rx.try_recv() {
            if raw.instance().is_none() {
                replay.push(raw);
            } else {
                stale += 1;
            }
        }
        (replay, stale)
    }
}

//! 会话流程集成测试：编排器 + 子对话 + 注册表，协作者全部为 mock

use std::sync::Arc;
use std::time::Duration;

use printguide::collab::mock::{ManualJobService, RecordingTransport, ScriptedClassifier};
use printguide::collab::{
    AttachmentRef, CatalogSearchService, ClassificationResult, Collaborators,
    DirectoryAttachmentStore, StaticContentStore,
};
use printguide::config::DialogSection;
use printguide::core::{Disposition, Orchestrator, OrchestratorDeps, OrchestratorState};
use printguide::dialogs::DialogKind;
use printguide::gateway::SessionRegistry;
use printguide::router::{IntentTable, RawEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Setup {
    deps: OrchestratorDeps,
    classifier: Arc<ScriptedClassifier>,
    transport: Arc<RecordingTransport>,
    dir: tempfile::TempDir,
}

fn setup(settings: DialogSection) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let classifier = Arc::new(ScriptedClassifier::new());
    let transport = Arc::new(RecordingTransport::new());
    let collab = Collaborators {
        classifier: classifier.clone(),
        transport: transport.clone(),
        attachments: Arc::new(DirectoryAttachmentStore::new(
            dir.path().join("store"),
            settings.max_attachment_bytes,
        )),
        jobs: Arc::new(ManualJobService::new()),
        search: Arc::new(CatalogSearchService::with_demo_catalog()),
        content: Arc::new(StaticContentStore::with_defaults().unwrap()),
    };
    Setup {
        deps: OrchestratorDeps::new(collab, settings, IntentTable::default()),
        classifier,
        transport,
        dir,
    }
}

fn orchestrator(s: &Setup, id: &str) -> (Orchestrator, mpsc::UnboundedReceiver<RawEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Orchestrator::new(id, &s.deps, tx, CancellationToken::new()),
        rx,
    )
}

async fn greet(orch: &mut Orchestrator, name: &str) {
    orch.handle(RawEvent::Text("Hallo".into())).await;
    orch.handle(RawEvent::Text(name.into())).await;
    assert_eq!(orch.state(), OrchestratorState::Idle);
}

/// 在临时目录写一个模型文件，声明大小由调用方给定
fn model_file(s: &Setup, name: &str, declared_size: u64) -> AttachmentRef {
    let path = s.dir.path().join(name);
    std::fs::write(&path, b"solid part\nendsolid part\n").unwrap();
    AttachmentRef {
        name: name.to_string(),
        size_bytes: declared_size,
        file_ref: path.to_string_lossy().to_string(),
    }
}

#[tokio::test]
async fn test_first_contact_asks_for_name() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");

    let disposition = orch.handle(RawEvent::Text("Hallo".into())).await;

    assert_eq!(disposition, Disposition::Continue);
    assert_eq!(orch.state(), OrchestratorState::EnteringName);
    assert_eq!(
        orch.visited(),
        &[OrchestratorState::Starting, OrchestratorState::EnteringName]
    );
    let texts = s.transport.texts();
    assert_eq!(texts.len(), 2);
    assert!(texts[0].starts_with("Welcome"));
    assert!(texts[1].contains("what should I call you"));
}

#[tokio::test]
async fn test_name_leads_to_menu() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");

    greet(&mut orch, "Max").await;

    let greeting = s.transport.last_text().unwrap();
    assert!(greeting.contains("Max"));
    assert_eq!(orch.snapshot().user_name.as_deref(), Some("Max"));
}

#[tokio::test]
async fn test_oversize_attachment_is_rejected_without_classification() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;
    let calls_before = s.classifier.call_count();

    let attachment = model_file(&s, "huge.stl", 21_000_000);
    orch.handle(RawEvent::Attachment(attachment)).await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert_eq!(s.classifier.call_count(), calls_before);
    assert!(orch.session().selected_model_path.is_none());
    let notice = s.transport.last_text().unwrap();
    assert!(notice.contains("too large"));
    assert!(notice.contains("20 MB"));
}

#[tokio::test]
async fn test_uploaded_model_goes_to_slicing() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    let attachment = model_file(&s, "part.stl", 5_000_000);
    orch.handle(RawEvent::Attachment(attachment)).await;

    assert_eq!(orch.state(), OrchestratorState::ModelReceived);
    let stored = orch.session().selected_model_path.clone().unwrap();
    assert!(stored.ends_with("part.stl"));
    assert!(std::path::Path::new(&stored).exists());
    assert!(s.transport.last_text().unwrap().contains("part.stl"));

    orch.handle(RawEvent::Callback("yes".into())).await;

    assert_eq!(orch.state(), OrchestratorState::Slicing);
    assert_eq!(orch.active_dialog(), Some(DialogKind::Slicing));
    assert!(s.transport.last_text().unwrap().contains("print quality"));
}

#[tokio::test]
async fn test_declining_model_returns_to_menu() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    orch.handle(RawEvent::Attachment(model_file(&s, "part.stl", 1_000)))
        .await;
    orch.handle(RawEvent::Callback("no".into())).await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.session().selected_model_path.is_some());
}

#[tokio::test]
async fn test_search_then_slice_then_checklist() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    s.classifier
        .push(ClassificationResult::new("search_model").with_param("term", "benchy"));
    orch.handle(RawEvent::Text("find benchy".into())).await;
    assert_eq!(orch.state(), OrchestratorState::SearchingModel);
    assert!(s.transport.last_text().unwrap().contains("3DBenchy"));

    orch.handle(RawEvent::Callback("select:1".into())).await;
    assert_eq!(orch.state(), OrchestratorState::ModelReceived);
    assert_eq!(
        orch.snapshot().selected_model_path.as_deref(),
        Some("https://models.example.org/3dbenchy.stl")
    );

    orch.handle(RawEvent::Callback("yes".into())).await;
    assert_eq!(orch.active_dialog(), Some(DialogKind::Slicing));
}

#[tokio::test]
async fn test_checklist_from_menu() {
    let s = setup(DialogSection {
        checklist: vec!["bed_clean".into(), "nozzle_clean".into()],
        ..DialogSection::default()
    });
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    orch.handle(RawEvent::Callback("menu:checklist".into())).await;
    assert_eq!(orch.state(), OrchestratorState::Checklist);

    orch.handle(RawEvent::Callback("no".into())).await;
    assert_eq!(orch.state(), OrchestratorState::Checklist);
    orch.handle(RawEvent::Callback("yes".into())).await;
    orch.handle(RawEvent::Callback("yes".into())).await;
    orch.handle(RawEvent::Callback("yes".into())).await;

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.active_dialog().is_none());
    assert!(s.transport.texts().iter().any(|t| t.contains("All checks passed")));
}

#[tokio::test]
async fn test_context_policies_and_reset() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    // 菜单层：多上下文切换
    s.classifier
        .push(ClassificationResult::new("help").with_contexts(&["menu"]));
    orch.handle(RawEvent::Text("help".into())).await;
    s.classifier
        .push(ClassificationResult::new("help").with_contexts(&["menu", "tips"]));
    orch.handle(RawEvent::Text("help again".into())).await;
    assert_eq!(orch.snapshot().context_scope, vec!["tips".to_string()]);

    // 进入子对话：范围清空，下一次分类要求重置
    orch.handle(RawEvent::Callback("menu:search".into())).await;
    assert_eq!(orch.state(), OrchestratorState::SearchingModel);
    assert!(orch.snapshot().context_scope.is_empty());

    s.classifier
        .push(ClassificationResult::new("fallback").with_contexts(&["search", "extra"]));
    orch.handle(RawEvent::Text("spool".into())).await;
    let last_call = s.classifier.calls().pop().unwrap();
    assert!(last_call.reset_contexts);
    assert!(last_call.contexts.is_empty());
    // 模型搜索只跟踪一个上下文
    assert_eq!(orch.snapshot().context_scope, vec!["search".to_string()]);

    s.classifier.push(ClassificationResult::new("fallback"));
    orch.handle(RawEvent::Text("holder".into())).await;
    let last_call = s.classifier.calls().pop().unwrap();
    assert!(!last_call.reset_contexts);
    assert_eq!(last_call.contexts, vec!["search".to_string()]);
    assert_eq!(orch.snapshot().context_scope, vec!["search".to_string()]);
}

#[tokio::test]
async fn test_dialog_that_cannot_start_falls_back_to_menu() {
    let s = setup(DialogSection::default());
    let (mut orch, _rx) = orchestrator(&s, "chat-1");
    greet(&mut orch, "Max").await;

    s.transport.set_failing(true);
    orch.handle(RawEvent::Callback("menu:hardware_tutorial".into()))
        .await;
    s.transport.set_failing(false);

    assert_eq!(orch.state(), OrchestratorState::Idle);
    assert!(orch.active_dialog().is_none());
    assert!(orch.active_instance().is_none());
    assert_eq!(
        orch.visited().last(),
        Some(&OrchestratorState::Idle)
    );

    orch.handle(RawEvent::Callback("menu:hardware_tutorial".into()))
        .await;
    assert_eq!(orch.state(), OrchestratorState::HardwareTutorial);
    assert!(s.transport.last_text().unwrap().contains("tour"));
}

async fn wait_processed(registry: &SessionRegistry, id: &str, count: u64) -> OrchestratorState {
    let mut rx = registry.subscribe(id).unwrap();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.processed >= count),
    )
    .await
    .expect("session did not process in time")
    .unwrap()
    .clone();
    snapshot.state
}

#[tokio::test]
async fn test_registry_serializes_items_per_session() {
    let s = setup(DialogSection::default());
    s.transport.set_send_delay(Some(Duration::from_millis(30)));
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("chat-1", RawEvent::Text("Max".into())).unwrap();

    let state = wait_processed(&registry, "chat-1", 2).await;
    assert_eq!(state, OrchestratorState::Idle);

    let texts = s.transport.texts();
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("Welcome"));
    assert!(texts[1].contains("call you"));
    assert!(texts[2].contains("Max"));
    registry.shutdown();
}

#[tokio::test]
async fn test_registry_keeps_sessions_apart() {
    let s = setup(DialogSection::default());
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("a", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("b", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("a", RawEvent::Text("Ada".into())).unwrap();

    assert_eq!(wait_processed(&registry, "a", 2).await, OrchestratorState::Idle);
    assert_eq!(
        wait_processed(&registry, "b", 1).await,
        OrchestratorState::EnteringName
    );
    assert_eq!(registry.active_count(), 2);
    assert_eq!(
        registry.snapshot("a").unwrap().user_name.as_deref(),
        Some("Ada")
    );
    assert!(registry.snapshot("b").unwrap().user_name.is_none());

    assert!(registry.remove("b"));
    assert!(!registry.contains("b"));
    assert!(registry.snapshot("a").is_some());
    registry.shutdown();
}

#[tokio::test]
async fn test_cleanup_removes_idle_sessions() {
    let s = setup(DialogSection::default());
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("idle", RawEvent::Text("Hallo".into())).unwrap();
    wait_processed(&registry, "idle", 1).await;

    assert_eq!(registry.cleanup_expired(Duration::from_secs(3600)), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.cleanup_expired(Duration::from_millis(5)), 1);
    assert_eq!(registry.active_count(), 0);
    registry.shutdown();
}

#[tokio::test]
async fn test_ended_session_starts_over_on_next_contact() {
    let s = setup(DialogSection::default());
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("chat-1", RawEvent::Text("Max".into())).unwrap();
    wait_processed(&registry, "chat-1", 2).await;

    let mut rx = registry.subscribe("chat-1").unwrap();
    s.classifier.push(ClassificationResult::new("cancel"));
    registry.dispatch("chat-1", RawEvent::Text("bye".into())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_ended()))
        .await
        .unwrap()
        .unwrap();
    assert!(s.transport.last_text().unwrap().starts_with("Bye Max"));

    // worker 退出后会话从表中移除
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.contains("chat-1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();
    assert_eq!(
        wait_processed(&registry, "chat-1", 1).await,
        OrchestratorState::EnteringName
    );
    registry.shutdown();
}

#[tokio::test]
async fn test_input_queued_behind_goodbye_reaches_a_new_session() {
    let s = setup(DialogSection::default());
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("chat-1", RawEvent::Text("Max".into())).unwrap();
    wait_processed(&registry, "chat-1", 2).await;

    // 告别消息发得慢，下一句在旧会话结束前就已入队
    s.transport.set_send_delay(Some(Duration::from_millis(30)));
    s.classifier.push(ClassificationResult::new("cancel"));
    registry.dispatch("chat-1", RawEvent::Text("bye".into())).unwrap();
    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();

    tokio::time::timeout(Duration::from_secs(5), registry.drain("chat-1"))
        .await
        .expect("queued input was not processed");

    let snapshot = registry.snapshot("chat-1").unwrap();
    assert_eq!(snapshot.state, OrchestratorState::EnteringName);
    assert!(snapshot.user_name.is_none());

    let texts = s.transport.texts();
    let goodbye = texts.iter().position(|t| t.starts_with("Bye Max")).unwrap();
    let welcome_again = texts.iter().rposition(|t| t.starts_with("Welcome")).unwrap();
    assert!(goodbye < welcome_again);
    registry.shutdown();
}

#[tokio::test]
async fn test_drain_waits_for_queued_input() {
    let s = setup(DialogSection::default());
    s.transport.set_send_delay(Some(Duration::from_millis(10)));
    let registry = SessionRegistry::new(s.deps.clone());

    registry.dispatch("chat-1", RawEvent::Text("Hallo".into())).unwrap();
    registry.dispatch("chat-1", RawEvent::Text("Max".into())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), registry.drain("chat-1"))
        .await
        .unwrap();

    assert_eq!(registry.snapshot("chat-1").unwrap().processed, 2);
    assert!(s.transport.last_text().unwrap().contains("Max"));

    // 未知会话立即返回
    registry.drain("nobody").await;
    registry.shutdown();
}

#[tokio::test]
async fn test_dispatch_after_shutdown_fails() {
    let s = setup(DialogSection::default());
    let registry = SessionRegistry::new(s.deps.clone());
    registry.shutdown();

    assert!(registry
        .dispatch("chat-1", RawEvent::Text("Hallo".into()))
        .is_err());
}

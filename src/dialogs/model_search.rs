//! 模型搜索：输入搜索词 → 分页浏览结果 → 选中一个模型
//!
//! 查询放在 Searching 的入口动作里，根据结果链式触发 ResultsFound / NothingFound /
//! QueryFailed。翻页时处理器先写入 `requested_page`，守卫判断是否还有下一页。
//! 查到的一页先放在 `fetched`，Browsing 送达后才成为用户可选的 `results`。

use async_trait::async_trait;

use super::{
    event_text, settle, DialogContext, DialogInstanceId, DialogKind, DialogOutcome, DialogResult,
    SubDialog,
};
use crate::collab::{Keyboard, KeyboardButton, ModelHit, ResultSet};
use crate::core::DialogError;
use crate::fsm::{StateActions, StateMachine, TransitionTable};
use crate::router::{ContextPolicy, Event, Intent};

const CONTENT: &str = "model_search";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchState {
    Init,
    AskingTerm,
    Searching,
    Browsing,
    NoResults,
    Done,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTrigger {
    Begin,
    TermGiven,
    ResultsFound,
    NothingFound,
    QueryFailed,
    NextPage,
    Select,
    Cancel,
}

pub struct SearchData {
    ctx: DialogContext,
    term: Option<String>,
    page: usize,
    requested_page: usize,
    /// 用户看到的那一页
    results: ResultSet,
    fetched: ResultSet,
    selected: Option<ModelHit>,
    failure: Option<String>,
}

impl SearchData {
    fn page_size(&self) -> usize {
        self.ctx.settings.search_page_size.max(1)
    }

    fn page_count(&self, total: usize) -> usize {
        let size = self.page_size();
        ((total + size - 1) / size).max(1)
    }
}

fn has_term(d: &SearchData) -> bool {
    d.term.is_some()
}

fn has_page(d: &SearchData) -> bool {
    d.requested_page * d.page_size() < d.results.total
}

fn has_selection(d: &SearchData) -> bool {
    d.selected.is_some()
}

pub fn table() -> TransitionTable<SearchState, SearchTrigger, SearchData> {
    use SearchState::*;
    use SearchTrigger::*;

    TransitionTable::new()
        .permit_if(Init, Begin, has_term, Searching)
        .permit(Init, Begin, AskingTerm)
        .permit_if(AskingTerm, TermGiven, has_term, Searching)
        .permit_if(NoResults, TermGiven, has_term, Searching)
        .permit_if(Browsing, TermGiven, has_term, Searching)
        .permit(Searching, ResultsFound, Browsing)
        .permit(Searching, NothingFound, NoResults)
        .permit(Searching, QueryFailed, Failed)
        .permit_if(Browsing, NextPage, has_page, Searching)
        .permit_if(Browsing, Select, has_selection, Done)
        .permit_from(&[AskingTerm, Browsing, NoResults], Cancel, Canceled)
        .on_entry(AskingTerm)
        .on_entry(Searching)
        .on_entry(Browsing)
        .on_entry(NoResults)
        .on_entry(Done)
        .on_entry(Canceled)
        .on_entry(Failed)
}

#[async_trait]
impl StateActions<SearchState, SearchTrigger> for SearchData {
    async fn on_entry(&mut self, state: SearchState) -> Result<Option<SearchTrigger>, DialogError> {
        match state {
            SearchState::AskingTerm => {
                self.ctx.present(CONTENT, "asking_term", &[]).await?;
            }
            SearchState::Searching => {
                let term = self.term.clone().unwrap_or_default();
                let page = self.requested_page;
                match self
                    .ctx
                    .collab
                    .search
                    .query(&term, page, self.page_size())
                    .await
                {
                    Ok(results) => {
                        tracing::debug!(
                            session_id = %self.ctx.session_id,
                            term = %term,
                            page,
                            total = results.total,
                            "model search"
                        );
                        let found = !results.items.is_empty();
                        self.fetched = results;
                        return Ok(Some(if found {
                            SearchTrigger::ResultsFound
                        } else {
                            SearchTrigger::NothingFound
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %self.ctx.session_id, "search failed: {}", e);
                        self.failure = Some(e.to_string());
                        return Ok(Some(SearchTrigger::QueryFailed));
                    }
                }
            }
            SearchState::Browsing => {
                let shown = std::mem::take(&mut self.fetched);
                let page_index = self.requested_page;
                let term = self.term.clone().unwrap_or_default();
                let list = shown
                    .items
                    .iter()
                    .enumerate()
                    .map(|(i, m)| format!("{}. {}", i + 1, m.name))
                    .collect::<Vec<_>>()
                    .join("\n");
                let page = (page_index + 1).to_string();
                let pages = self.page_count(shown.total).to_string();

                let mut keyboard = Keyboard::default().row(
                    (1..=shown.items.len())
                        .map(|i| KeyboardButton::new(i.to_string(), format!("select:{}", i)))
                        .collect(),
                );
                if (page_index + 1) * self.page_size() < shown.total {
                    keyboard = keyboard.row(vec![KeyboardButton::new("More results", "page:next")]);
                }
                keyboard = keyboard.row(vec![KeyboardButton::new("Cancel", "cancel")]);

                self.ctx
                    .present_with(
                        CONTENT,
                        "results",
                        &[
                            ("term", term.as_str()),
                            ("page", page.as_str()),
                            ("pages", pages.as_str()),
                            ("list", list.as_str()),
                        ],
                        Some(keyboard),
                    )
                    .await?;
                self.results = shown;
                self.page = page_index;
            }
            SearchState::NoResults => {
                let term = self.term.clone().unwrap_or_default();
                self.ctx
                    .present(CONTENT, "no_results", &[("term", term.as_str())])
                    .await?;
            }
            SearchState::Done => {
                let hit = self
                    .selected
                    .clone()
                    .ok_or_else(|| DialogError::invariant("search finished without a selection"))?;
                self.ctx.raise(DialogOutcome::Completed(DialogResult::ModelChosen {
                    name: hit.name,
                    link: hit.link,
                }))?;
            }
            SearchState::Canceled => self.ctx.raise(DialogOutcome::Canceled)?,
            SearchState::Failed => {
                let reason = self
                    .failure
                    .clone()
                    .unwrap_or_else(|| "search failed".to_string());
                self.ctx.raise(DialogOutcome::Failed(reason))?;
            }
            SearchState::Init => {}
        }
        Ok(None)
    }
}

/// 模型搜索对话
pub struct ModelSearchDialog {
    machine: StateMachine<SearchState>,
    table: TransitionTable<SearchState, SearchTrigger, SearchData>,
    data: SearchData,
}

impl ModelSearchDialog {
    pub fn new(ctx: DialogContext, term: Option<String>) -> Self {
        Self {
            machine: StateMachine::new("model_search", SearchState::Init),
            table: table(),
            data: SearchData {
                ctx,
                term: term.filter(|t| !t.trim().is_empty()),
                page: 0,
                requested_page: 0,
                results: ResultSet::default(),
                fetched: ResultSet::default(),
                selected: None,
                failure: None,
            },
        }
    }

    pub fn state(&self) -> SearchState {
        self.machine.state()
    }

    async fn fire(&mut self, trigger: SearchTrigger) -> Result<(), DialogError> {
        let outcome = self.machine.fire(&self.table, &mut self.data, trigger).await;
        settle(outcome, &format!("{:?}", trigger))
    }

    async fn search(&mut self, term: String) -> Result<(), DialogError> {
        self.data.term = Some(term);
        self.data.requested_page = 0;
        self.fire(SearchTrigger::TermGiven).await
    }

    async fn select(&mut self, index: usize) -> Result<(), DialogError> {
        self.data.selected = index
            .checked_sub(1)
            .and_then(|i| self.data.results.items.get(i).cloned());
        self.fire(SearchTrigger::Select).await
    }
}

/// `select:<n>` 回调中的序号
fn parse_select(data: &str) -> Option<usize> {
    data.strip_prefix("select:")?.trim().parse().ok()
}

#[async_trait]
impl SubDialog for ModelSearchDialog {
    fn kind(&self) -> DialogKind {
        DialogKind::ModelSearch
    }

    fn instance(&self) -> DialogInstanceId {
        self.data.ctx.instance
    }

    fn context_policy(&self) -> ContextPolicy {
        ContextPolicy::SingleReplace
    }

    async fn start(&mut self) -> Result<(), DialogError> {
        self.fire(SearchTrigger::Begin).await
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), DialogError> {
        if event.is_cancel() {
            return self.fire(SearchTrigger::Cancel).await;
        }

        match &event {
            Event::Callback(data) if data == "page:next" => {
                self.data.requested_page = self.data.page + 1;
                return self.fire(SearchTrigger::NextPage).await;
            }
            Event::Callback(data) => {
                return match parse_select(data) {
                    Some(index) => self.select(index).await,
                    None => Err(DialogError::user_input(format!("unknown button {}", data))),
                };
            }
            Event::Text { intent, .. } => match intent {
                Intent::NextPage => {
                    self.data.requested_page = self.data.page + 1;
                    return self.fire(SearchTrigger::NextPage).await;
                }
                Intent::SelectOption { index: Some(index) }
                    if self.machine.state() == SearchState::Browsing =>
                {
                    return self.select(*index).await;
                }
                Intent::SearchModel { term: Some(term) } => {
                    return self.search(term.clone()).await;
                }
                _ => {}
            },
            _ => {}
        }

        match (self.machine.state(), event_text(&event)) {
            (SearchState::AskingTerm | SearchState::NoResults, Some(text)) => {
                let term = text.to_string();
                self.search(term).await
            }
            _ => Err(DialogError::user_input("expected a search term or a selection")),
        }
    }
}

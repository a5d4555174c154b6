//! Chat sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use storage::{ConfigStore, LogMessage, ModelCredentials, Role, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rough size of a token in characters, for context budgeting.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message cost on top of its text.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Replayed in place of results a cancelled generation never produced.
pub(crate) const CANCELLED_TOOL_RESULT: &str = "Tool call was cancelled.";

/// Whether earlier turns are replayed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Each message is sent on its own.
    SingleTurn,
    #[default]
    MultiTurn,
}

/// What a session talks to and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub model_id: String,
    pub system_prompt: Option<String>,
    pub mode: ConversationMode,
}

impl SessionSettings {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system_prompt: None,
            mode: ConversationMode::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_mode(mut self, mode: ConversationMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Handle on one generation. Effects are applied only while it is current.
#[derive(Debug, Clone)]
pub(crate) struct Generation {
    serial: u64,
    pub(crate) token: CancellationToken,
}

struct State {
    log: Vec<LogMessage>,
    settings: SessionSettings,
    generation: Option<Generation>,
    serial: u64,
}

/// A conversation: its message log, settings and in-flight generation.
pub struct ChatSession {
    id: SessionId,
    store: Arc<dyn ConfigStore>,
    state: Mutex<State>,
}

impl ChatSession {
    pub(crate) fn new(
        id: SessionId,
        store: Arc<dyn ConfigStore>,
        settings: SessionSettings,
        log: Vec<LogMessage>,
    ) -> Self {
        Self {
            id,
            store,
            state: Mutex::new(State {
                log,
                settings,
                generation: None,
                serial: 0,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn messages(&self) -> Vec<LogMessage> {
        self.state().log.clone()
    }

    pub fn settings(&self) -> SessionSettings {
        self.state().settings.clone()
    }

    pub fn set_mode(&self, mode: ConversationMode) {
        self.state().settings.mode = mode;
    }

    pub fn set_system_prompt(&self, prompt: Option<String>) {
        self.state().settings.system_prompt = prompt;
    }

    /// Whether a generation is running and not cancelled.
    pub fn is_generating(&self) -> bool {
        self.state()
            .generation
            .as_ref()
            .is_some_and(|g| !g.token.is_cancelled())
    }

    /// Cancel the running generation. Returns false if none was running.
    pub fn abort(&self) -> bool {
        let state = self.state();
        match &state.generation {
            Some(generation) if !generation.token.is_cancelled() => {
                generation.token.cancel();
                debug!(session = %self.id, "Generation aborted");
                true
            }
            _ => false,
        }
    }

    /// Cancel any previous generation and start a new one.
    pub(crate) fn begin_generation(&self) -> Generation {
        let mut state = self.state();
        if let Some(previous) = state.generation.take() {
            previous.token.cancel();
        }
        state.serial += 1;
        let generation = Generation {
            serial: state.serial,
            token: CancellationToken::new(),
        };
        state.generation = Some(generation.clone());
        generation
    }

    pub(crate) fn finish_generation(&self, generation: &Generation) {
        let mut state = self.state();
        if state.generation.as_ref().is_some_and(|g| g.serial == generation.serial) {
            state.generation = None;
        }
    }

    /// Append to the log on behalf of `generation`.
    ///
    /// Returns false, changing nothing, if the generation was cancelled or
    /// superseded. Persistence failures are logged and otherwise ignored.
    pub(crate) fn append(&self, generation: &Generation, message: LogMessage) -> bool {
        let mut state = self.state();
        let current = state
            .generation
            .as_ref()
            .is_some_and(|g| g.serial == generation.serial);
        if !current || generation.token.is_cancelled() {
            return false;
        }
        if let Err(e) = self.store.append_message(self.id, &message) {
            warn!(session = %self.id, "Failed to persist message: {e}");
        }
        state.log.push(message);
        true
    }

    /// Messages to send for a new user message.
    ///
    /// The system prompt and `user` are always included. In multi-turn mode
    /// as much recent history as fits the model's context follows the prompt.
    pub(crate) fn compose(&self, user: &LogMessage, credentials: &ModelCredentials) -> Vec<LogMessage> {
        let state = self.state();
        let mut messages = Vec::new();
        if let Some(prompt) = state.settings.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(LogMessage::system(prompt));
        }

        if state.settings.mode == ConversationMode::MultiTurn {
            let reserved = messages.iter().map(estimate_tokens).sum::<usize>()
                + estimate_tokens(user)
                + credentials.max_tokens.unwrap_or(0) as usize;
            let budget = (credentials.context_size as usize).saturating_sub(reserved);
            messages.extend(answer_interrupted_calls(recent_history(&state.log, budget)));
        }

        messages.push(user.clone());
        messages
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession").field("id", &self.id).finish()
    }
}

fn estimate_tokens(message: &LogMessage) -> usize {
    let chars = message.content.chars().count()
        + message
            .tool_calls
            .iter()
            .map(|c| c.name.len() + c.arguments.chars().count())
            .sum::<usize>();
    chars.div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS
}

/// The newest suffix of `log` within `budget` tokens.
///
/// Never starts with a tool result whose request was cut off.
fn recent_history(log: &[LogMessage], budget: usize) -> &[LogMessage] {
    let mut used = 0;
    let mut start = log.len();
    for (i, message) in log.iter().enumerate().rev() {
        used += estimate_tokens(message);
        if used > budget {
            break;
        }
        start = i;
    }
    while start < log.len() && log[start].role == Role::Tool {
        start += 1;
    }
    &log[start..]
}

/// Copy of `history` in which every tool call has a result.
///
/// A generation cancelled while running tools leaves calls unanswered in the
/// log; those get a placeholder result right after the answered ones.
fn answer_interrupted_calls(history: &[LogMessage]) -> Vec<LogMessage> {
    let mut out = Vec::with_capacity(history.len());
    let mut i = 0;
    while i < history.len() {
        let message = &history[i];
        out.push(message.clone());
        i += 1;
        if message.tool_calls.is_empty() {
            continue;
        }

        let mut answered = Vec::new();
        while i < history.len() && history[i].role == Role::Tool {
            answered.extend(history[i].tool_call_id.clone());
            out.push(history[i].clone());
            i += 1;
        }
        for call in &message.tool_calls {
            if !answered.contains(&call.id) {
                debug!(call = %call.id, tool = %call.name, "Replaying interrupted tool call");
                out.push(LogMessage::tool_result(
                    call.id.as_str(),
                    call.name.as_str(),
                    CANCELLED_TOOL_RESULT,
                ));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryStore, ToolCallRecord};

    fn credentials(context_size: u32) -> ModelCredentials {
        ModelCredentials {
            endpoint: "http://localhost".into(),
            api_key: String::new(),
            model: "m".into(),
            context_size,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    fn session(settings: SessionSettings) -> (ChatSession, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ChatSession::new(SessionId::new(), store.clone(), settings, Vec::new()),
            store,
        )
    }

    #[test]
    fn new_generation_cancels_the_previous_one() {
        let (session, _) = session(SessionSettings::new("m"));
        assert!(!session.abort());

        let first = session.begin_generation();
        assert!(session.is_generating());
        let second = session.begin_generation();
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        assert!(!session.append(&first, LogMessage::assistant("stale")));
        assert!(session.append(&second, LogMessage::assistant("fresh")));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn abort_is_level_triggered() {
        let (session, _) = session(SessionSettings::new("m"));
        let generation = session.begin_generation();
        assert!(session.abort());
        assert!(!session.abort());
        assert!(!session.is_generating());
        assert!(!session.append(&generation, LogMessage::assistant("late")));

        session.finish_generation(&generation);
        let next = session.begin_generation();
        assert!(session.append(&next, LogMessage::user("again")));
    }

    #[test]
    fn appends_are_persisted() {
        let (session, store) = session(SessionSettings::new("m"));
        let generation = session.begin_generation();
        session.append(&generation, LogMessage::user("hi"));
        session.append(&generation, LogMessage::assistant("hello"));

        let stored = store.load_messages(session.id()).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "hello");
    }

    #[test]
    fn single_turn_sends_only_prompt_and_message() {
        let settings = SessionSettings::new("m")
            .with_system_prompt("be brief")
            .with_mode(ConversationMode::SingleTurn);
        let (session, _) = session(settings);
        let generation = session.begin_generation();
        session.append(&generation, LogMessage::user("earlier"));
        session.append(&generation, LogMessage::assistant("reply"));

        let messages = session.compose(&LogMessage::user("now"), &credentials(8192));
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::System, Role::User]);
        assert_eq!(messages[1].content, "now");
    }

    #[test]
    fn multi_turn_replays_history() {
        let (session, _) = session(SessionSettings::new("m"));
        let generation = session.begin_generation();
        session.append(&generation, LogMessage::user("earlier"));
        session.append(&generation, LogMessage::assistant("reply"));

        let messages = session.compose(&LogMessage::user("now"), &credentials(8192));
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["earlier", "reply", "now"]);
    }

    #[test]
    fn history_is_trimmed_oldest_first() {
        let log = vec![
            LogMessage::user("a".repeat(400)),
            LogMessage::assistant("b".repeat(40)),
            LogMessage::user("c".repeat(40)),
        ];
        // 14 tokens per short message.
        let kept = recent_history(&log, 30);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].content.starts_with('b'));
        assert!(recent_history(&log, 0).is_empty());
    }

    #[test]
    fn trimmed_history_never_starts_with_an_orphaned_result() {
        let log = vec![
            LogMessage::user("q".repeat(100)),
            LogMessage::assistant_tool_calls(
                "",
                vec![ToolCallRecord {
                    id: "c1".into(),
                    name: "read".into(),
                    arguments: "x".repeat(400),
                }],
            ),
            LogMessage::tool_result("c1", "read", "ok"),
            LogMessage::assistant("done"),
        ];
        let kept = recent_history(&log, 20);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "done");
    }

    #[test]
    fn interrupted_tool_calls_are_answered_when_replayed() {
        let (session, _) = session(SessionSettings::new("m"));
        let generation = session.begin_generation();
        session.append(&generation, LogMessage::user("list both"));
        let calls = ["c1", "c2"]
            .into_iter()
            .map(|id| ToolCallRecord {
                id: id.into(),
                name: "list_dir".into(),
                arguments: "{}".into(),
            })
            .collect();
        session.append(&generation, LogMessage::assistant_tool_calls("", calls));
        session.append(&generation, LogMessage::tool_result("c1", "list_dir", "a.txt"));
        session.abort();
        session.finish_generation(&generation);

        let messages = session.compose(&LogMessage::user("again"), &credentials(8192));
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::User]
        );
        assert_eq!(messages[2].content, "a.txt");
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(messages[3].content, CANCELLED_TOOL_RESULT);
        // The stored log is left as it happened.
        assert_eq!(session.messages().len(), 3);
    }
}

use cbag_core::domain::message::{Message, Role};
use cbag_core::prompt::SystemPrompt;

/// Working copy of one session's history for the duration of a turn.
///
/// Nothing here touches storage: the caller loads the stored history, runs the
/// turn against this copy and persists it only when the turn succeeded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn resume(stored: Option<Vec<Message>>) -> Self {
        Self { messages: stored.unwrap_or_default() }
    }

    pub fn is_new(&self) -> bool {
        self.messages.is_empty()
    }

    /// Seeds the system prompt on the first turn, then appends the user message.
    pub fn begin_turn(&mut self, system_prompt: &SystemPrompt, input: &str) {
        if self.is_new() {
            self.messages.push(system_prompt.to_message());
        }
        self.messages.push(Message::user(input));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant && !message.has_tool_calls())
            .map(|message| message.content.as_str())
    }
}

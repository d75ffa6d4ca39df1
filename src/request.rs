//! Building outbound requests from the transcript

use crate::conversation::{ConversationMessage, MessageRole};
use crate::types::{ContentBlock, InputItem, ResponseCreateRequest, ToolDefinition};
use serde_json::{Map, Value};

/// Which part of the transcript is sent with each request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryStrategy {
    /// Only the newest turn; earlier context is carried server-side through
    /// `previous_response_id`
    #[default]
    LatestMessage,
    /// The whole transcript
    FullConversation,
}

/// Turns `(transcript, previous response id)` into a request body.
///
/// ```rust
/// use responses_stream::{ConversationMessage, ConversationRequestBuilder, HistoryStrategy};
///
/// let builder = ConversationRequestBuilder::new("gpt-4.1")
///     .instructions("Answer briefly.")
///     .temperature(0.2)
///     .history_strategy(HistoryStrategy::FullConversation);
///
/// let request = builder.make_request(&[ConversationMessage::user("Hi")], None);
/// assert_eq!(request.input.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ConversationRequestBuilder {
    model: String,
    instructions: Option<String>,
    parallel_tool_calls: Option<bool>,
    metadata: Option<Map<String, Value>>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    frequency_penalty: Option<f64>,
    presence_penalty: Option<f64>,
    max_output_tokens: Option<u32>,
    tools: Vec<ToolDefinition>,
    history_strategy: HistoryStrategy,
}

impl ConversationRequestBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions: None,
            parallel_tool_calls: None,
            metadata: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_output_tokens: None,
            tools: Vec::new(),
            history_strategy: HistoryStrategy::default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = Some(enabled);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn frequency_penalty(mut self, penalty: f64) -> Self {
        self.frequency_penalty = Some(penalty);
        self
    }

    pub fn presence_penalty(mut self, penalty: f64) -> Self {
        self.presence_penalty = Some(penalty);
        self
    }

    pub fn max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn history_strategy(mut self, strategy: HistoryStrategy) -> Self {
        self.history_strategy = strategy;
        self
    }

    pub fn make_request(
        &self,
        messages: &[ConversationMessage],
        previous_response_id: Option<&str>,
    ) -> ResponseCreateRequest {
        let selected: Vec<&ConversationMessage> = match self.history_strategy {
            HistoryStrategy::LatestMessage => latest_message(messages).into_iter().collect(),
            HistoryStrategy::FullConversation => messages.iter().collect(),
        };

        let mut request =
            ResponseCreateRequest::new(self.model.clone(), selected.into_iter().map(input_item).collect());
        request.instructions = self.instructions.clone();
        request.parallel_tool_calls = self.parallel_tool_calls;
        request.metadata = self.metadata.clone();
        request.temperature = self.temperature;
        request.top_p = self.top_p;
        request.frequency_penalty = self.frequency_penalty;
        request.presence_penalty = self.presence_penalty;
        request.max_output_tokens = self.max_output_tokens;
        request.tools = (!self.tools.is_empty()).then(|| self.tools.clone());
        request.previous_response_id = previous_response_id
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        request
    }
}

/// Last non-empty user message, else the last non-empty message of any role.
fn latest_message(messages: &[ConversationMessage]) -> Option<&ConversationMessage> {
    let non_empty = |m: &&ConversationMessage| !m.text.trim().is_empty();
    messages
        .iter()
        .rev()
        .filter(non_empty)
        .find(|m| m.role == MessageRole::User)
        .or_else(|| messages.iter().rev().find(non_empty))
}

fn input_item(message: &ConversationMessage) -> InputItem {
    let block = match message.role {
        MessageRole::Assistant => ContentBlock::output_text(message.text.clone()),
        _ => ContentBlock::input_text(message.text.clone()),
    };
    InputItem::message(message.role.to_wire(), vec![block])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transcript() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system("Be terse."),
            ConversationMessage::user("First"),
            ConversationMessage::assistant("Reply"),
            ConversationMessage::user("   "),
        ]
    }

    #[test]
    fn test_latest_message_prefers_user() {
        let request = ConversationRequestBuilder::new("m").make_request(&transcript(), None);
        let encoded = serde_json::to_value(&request.input).unwrap();
        assert_eq!(
            encoded,
            json!([{"role": "user", "content": [{"type": "input_text", "text": "First"}]}])
        );
    }

    #[test]
    fn test_latest_message_falls_back_to_any_role() {
        let messages = vec![ConversationMessage::assistant("Only me")];
        let request = ConversationRequestBuilder::new("m").make_request(&messages, None);
        let encoded = serde_json::to_value(&request.input).unwrap();
        assert_eq!(
            encoded,
            json!([{"role": "assistant", "content": [{"type": "output_text", "text": "Only me"}]}])
        );

        let empty = ConversationRequestBuilder::new("m").make_request(&[], None);
        assert!(empty.input.is_empty());
    }

    #[test]
    fn test_full_conversation_encodes_roles() {
        let request = ConversationRequestBuilder::new("m")
            .history_strategy(HistoryStrategy::FullConversation)
            .make_request(&transcript(), None);

        let kinds: Vec<_> = request
            .input
            .iter()
            .map(|item| match item {
                InputItem::Message(m) => m.content[0].kind.clone(),
                InputItem::Raw(_) => String::new(),
            })
            .collect();
        assert_eq!(kinds, vec!["input_text", "input_text", "output_text", "input_text"]);
    }

    #[test]
    fn test_options_are_copied() {
        let request = ConversationRequestBuilder::new("gpt-4.1")
            .instructions("sys")
            .parallel_tool_calls(false)
            .temperature(0.5)
            .top_p(0.9)
            .frequency_penalty(0.1)
            .presence_penalty(0.2)
            .max_output_tokens(256)
            .tool(ToolDefinition::function("lookup", json!({"type": "object"})))
            .make_request(&[ConversationMessage::user("Hi")], Some("resp_1"));

        assert_eq!(request.model, "gpt-4.1");
        assert_eq!(request.instructions.as_deref(), Some("sys"));
        assert_eq!(request.parallel_tool_calls, Some(false));
        assert_eq!(request.temperature, Some(0.5));
        assert_eq!(request.top_p, Some(0.9));
        assert_eq!(request.frequency_penalty, Some(0.1));
        assert_eq!(request.presence_penalty, Some(0.2));
        assert_eq!(request.max_output_tokens, Some(256));
        assert_eq!(request.tools.as_ref().map(Vec::len), Some(1));
        assert_eq!(request.previous_response_id.as_deref(), Some("resp_1"));
        assert_eq!(request.stream, None);
    }

    #[test]
    fn test_empty_previous_response_id_is_dropped() {
        let request =
            ConversationRequestBuilder::new("m").make_request(&[ConversationMessage::user("Hi")], Some(""));
        assert_eq!(request.previous_response_id, None);
    }
}

mod common;

use agentic_rag::config::AgentConfig;
use agentic_rag::conversation::{
    AgentEvent, AgentSettings, ConversationHandler, ConversationStore, EventSink,
};
use agentic_rag::llm::{ChatMessage, Role};
use agentic_rag::models::InputMessage;
use agentic_rag::tools::ToolRegistry;
use async_trait::async_trait;
use common::{rules_store, tool_call_reply, KeywordEmbedder, ScriptedModel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder(Mutex<Vec<AgentEvent>>);

#[async_trait]
impl EventSink for Recorder {
    async fn send(&self, event: &AgentEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|e| e.to_string()).collect()
    }
}

async fn agent(model: Arc<ScriptedModel>, max_tool_rounds: usize) -> ConversationHandler {
    let tools = ToolRegistry::for_agent(
        Arc::new(KeywordEmbedder),
        Arc::new(rules_store().await),
        "rules",
        model.clone(),
        &AgentConfig::default(),
        0.2,
    );
    ConversationHandler::new(
        model,
        Arc::new(tools),
        ConversationStore::new(),
        AgentSettings {
            system_prompt: "Answer from the documents.".to_string(),
            temperature: 0.2,
            max_tool_rounds,
            tool_delay: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn test_retrieval_then_answer() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_reply(&[(
            "call_1",
            "get_context",
            r#"{"search_query": "Ogni squadra schiera un numero di giocatori", "limit": 1}"#,
        )]),
        ChatMessage::assistant("Ogni squadra schiera 5 giocatori (Art. 3)."),
    ]));
    let handler = agent(model.clone(), 4).await;
    let recorder = Recorder::default();

    let input = InputMessage::new("conv-1", "tester", "Quanti giocatori per squadra?");
    let output = handler.handle(&input, &recorder).await.unwrap();

    assert_eq!(output.message, "Ogni squadra schiera 5 giocatori (Art. 3).");
    assert_eq!(output.correlation_id, input.correlation_id);
    assert_eq!(model.call_count(), 2);

    // the second completion sees the tool result
    let (messages, options) = model.call(1);
    assert!(options.tools_enabled);
    let tool_msg = messages.last().unwrap();
    assert_eq!(tool_msg.role, Role::Tool);
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_msg.content_str().contains("Art. 3"));
    assert!(!tool_msg.content_str().contains("Art. 7"));

    let lines = recorder.lines();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "👤: Quanti giocatori per squadra?");
    assert!(lines[1].starts_with("    🛠️ \"get_context\" "));
    assert!(lines[2].starts_with("    🛠️ Tool ended with result: "));
    assert_eq!(lines[3], "🤖: Ogni squadra schiera 5 giocatori (Art. 3).");
}

#[tokio::test]
async fn test_math_reasoning_sub_call_uses_context() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_reply(&[(
            "call_1",
            "math_reasoning",
            r#"{"question": "Quanti minuti dura una partita?", "context": "due tempi da 20 minuti"}"#,
        )]),
        ChatMessage::assistant("2 × 20 = 40"),
        ChatMessage::assistant("Una partita dura 40 minuti."),
    ]));
    let handler = agent(model.clone(), 4).await;

    let input = InputMessage::new("conv-2", "tester", "Quanto dura una partita?");
    let output = handler.handle(&input, &Recorder::default()).await.unwrap();
    assert_eq!(output.message, "Una partita dura 40 minuti.");

    // the sub-call has its own system prompt and no tools
    let (sub_messages, sub_options) = model.call(1);
    assert!(!sub_options.tools_enabled);
    assert_eq!(sub_messages.len(), 2);
    assert_eq!(sub_messages[0].role, Role::System);
    assert!(sub_messages[0].content_str().contains("due tempi da 20 minuti"));
    assert_eq!(sub_messages[1].content_str(), "Quanti minuti dura una partita?");

    let (messages, _) = model.call(2);
    assert_eq!(messages.last().unwrap().content_str(), "2 × 20 = 40");
}

#[tokio::test]
async fn test_unknown_tool_and_missing_arguments_are_reported() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_reply(&[
            ("call_1", "weather", "{}"),
            ("call_2", "get_context", r#"{"limit": 2}"#),
        ]),
        ChatMessage::assistant("Non lo so."),
    ]));
    let handler = agent(model.clone(), 4).await;

    let input = InputMessage::new("conv-3", "tester", "Che tempo fa?");
    handler.handle(&input, &Recorder::default()).await.unwrap();

    let (messages, _) = model.call(1);
    let n = messages.len();
    assert_eq!(messages[n - 2].content_str(), "Tool weather is not registered.");
    assert!(messages[n - 1]
        .content_str()
        .starts_with("Error executing tool get_context: "));
}

#[tokio::test]
async fn test_tool_rounds_are_bounded() {
    let search = r#"{"search_query": "tempo di gioco in minuti"}"#;
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_reply(&[("call_1", "get_context", search)]),
        tool_call_reply(&[("call_2", "get_context", search)]),
        // tools are disabled now; the stray call is dropped
        tool_call_reply(&[("call_3", "get_context", search)]),
    ]));
    let handler = agent(model.clone(), 2).await;

    let input = InputMessage::new("conv-4", "tester", "Quanto dura?");
    let output = handler.handle(&input, &Recorder::default()).await.unwrap();

    assert_eq!(output.message, "");
    assert_eq!(model.call_count(), 3);
    assert!(!model.call(2).1.tools_enabled);
}

#[tokio::test]
async fn test_history_is_kept_per_conversation() {
    let model = Arc::new(ScriptedModel::new(vec![
        ChatMessage::assistant("Ciao!"),
        ChatMessage::assistant("Sempre io."),
        ChatMessage::assistant("Piacere."),
    ]));
    let handler = agent(model.clone(), 4).await;
    let sink = Recorder::default();

    handler
        .handle(&InputMessage::new("a", "u", "ciao"), &sink)
        .await
        .unwrap();
    handler
        .handle(&InputMessage::new("a", "u", "chi sei?"), &sink)
        .await
        .unwrap();
    handler
        .handle(&InputMessage::new("b", "u", "ciao"), &sink)
        .await
        .unwrap();

    // system, user, assistant, user
    assert_eq!(model.call(1).0.len(), 4);
    // fresh conversation: system, user
    assert_eq!(model.call(2).0.len(), 2);
    assert_eq!(handler.store().history("a").len(), 5);
    assert_eq!(handler.store().len(), 2);
}

#[tokio::test]
async fn test_failed_turn_leaves_history_untouched() {
    let model = Arc::new(ScriptedModel::new(vec![ChatMessage::assistant("Ciao!")]));
    let handler = agent(model.clone(), 4).await;
    let sink = Recorder::default();

    handler
        .handle(&InputMessage::new("a", "u", "ciao"), &sink)
        .await
        .unwrap();
    // script exhausted
    let err = handler
        .handle(&InputMessage::new("a", "u", "ancora"), &sink)
        .await;
    assert!(err.is_err());
    assert_eq!(handler.store().history("a").len(), 3);
}

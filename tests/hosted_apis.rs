//! Hosted-API clients against in-process fakes: request paths, auth
//! headers, bodies and response parsing.

use agentic_rag::config::{EmbeddingConfig, LlmConfig};
use agentic_rag::embedding::{Embedder, HttpEmbedder};
use agentic_rag::llm::{ChatClient, ChatMessage, ChatModel, CompletionOptions, ToolDefinition};
use agentic_rag::vector_store::{Distance, Point, QdrantStore, VectorStore};
use axum::http::{HeaderMap, Method, Uri};
use axum::Router;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Value,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type Log = Arc<Mutex<Vec<Recorded>>>;

/// Serve `respond(method, path)` for every request, recording each one.
/// Returns the base URL and the request log.
async fn fake_api(respond: fn(&Method, &str) -> Value) -> (String, Log) {
    let log: Log = Arc::default();
    let recorder = log.clone();
    let app = Router::new().fallback(
        move |method: Method, uri: Uri, headers: HeaderMap, body: String| {
            let recorder = recorder.clone();
            async move {
                let reply = respond(&method, uri.path());
                recorder.lock().unwrap().push(Recorded {
                    method,
                    target: uri.to_string(),
                    headers,
                    body: serde_json::from_str(&body).unwrap_or(Value::Null),
                });
                axum::Json(reply)
            }
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), log)
}

fn embeddings_reply(_: &Method, _: &str) -> Value {
    // out of order on purpose
    json!({
        "data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ],
        "usage": {"total_tokens": 7}
    })
}

#[tokio::test]
async fn test_azure_embeddings_request() {
    let (base, log) = fake_api(embeddings_reply).await;
    let config = EmbeddingConfig {
        provider: "azure-openai".to_string(),
        model: "ada".to_string(),
        dims: Some(2),
        url: Some(base),
        max_retries: 0,
        ..EmbeddingConfig::default()
    };
    let embedder = HttpEmbedder::with_api_key(&config, "az-key".to_string()).unwrap();

    let texts = vec!["giocatori".to_string(), "minuti".to_string()];
    let vectors = embedder.embed(&texts).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    assert_eq!(embedder.tokens_used(), 7);

    let requests = log.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let req = &requests[0];
    assert_eq!(req.method, Method::POST);
    assert_eq!(
        req.target,
        "/openai/deployments/ada/embeddings?api-version=2024-10-21"
    );
    assert_eq!(req.header("api-key"), Some("az-key"));
    assert_eq!(req.header("authorization"), None);
    assert_eq!(req.body, json!({"input": ["giocatori", "minuti"]}));
}

#[tokio::test]
async fn test_jina_embeddings_request() {
    let (base, log) = fake_api(embeddings_reply).await;
    let config = EmbeddingConfig {
        provider: "jina".to_string(),
        model: "jina-embeddings-v3".to_string(),
        url: Some(base),
        max_retries: 0,
        ..EmbeddingConfig::default()
    };
    let embedder = HttpEmbedder::with_api_key(&config, "jina-key".to_string()).unwrap();

    let texts = vec!["a".to_string(), "b".to_string()];
    embedder.embed(&texts).await.unwrap();

    let requests = log.lock().unwrap();
    let req = &requests[0];
    assert_eq!(req.target, "/v1/embeddings");
    assert_eq!(req.header("authorization"), Some("Bearer jina-key"));
    assert_eq!(req.body["model"], "jina-embeddings-v3");
    assert_eq!(req.body["input"][1]["text"], "b");
}

fn completion_reply(_: &Method, _: &str) -> Value {
    json!({
        "choices": [{
            "index": 0,
            "finish_reason": "tool_calls",
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {
                        "name": "get_context",
                        "arguments": "{\"search_query\": \"numero di giocatori\"}"
                    }
                }]
            }
        }],
        "usage": {"prompt_tokens": 20, "completion_tokens": 4, "total_tokens": 24}
    })
}

#[tokio::test]
async fn test_azure_chat_completion_with_tools() {
    let (base, log) = fake_api(completion_reply).await;
    let config = LlmConfig {
        provider: "azure-openai".to_string(),
        model: "gpt-4o".to_string(),
        endpoint: Some(base),
        max_retries: 0,
        ..LlmConfig::default()
    };
    let client = ChatClient::with_api_key(&config, "az-key".to_string()).unwrap();
    let tools = vec![ToolDefinition {
        name: "get_context".to_string(),
        description: "Search the rules".to_string(),
        parameters: json!({"type": "object", "properties": {}}),
    }];
    let messages = vec![
        ChatMessage::system("Sei un assistente."),
        ChatMessage::user("Quanti giocatori?"),
    ];

    let completion = client
        .complete(&messages, &tools, &CompletionOptions::default())
        .await
        .unwrap();
    assert_eq!(completion.finish_reason.as_deref(), Some("tool_calls"));
    let call = &completion.message.tool_calls[0];
    assert_eq!(call.id, "call_1");
    assert_eq!(call.function.name, "get_context");
    assert_eq!(client.usage().total_tokens, 24);

    let requests = log.lock().unwrap();
    let req = &requests[0];
    assert_eq!(
        req.target,
        "/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
    );
    assert_eq!(req.header("api-key"), Some("az-key"));
    assert_eq!(req.body["messages"][1]["role"], "user");
    assert_eq!(req.body["tools"][0]["function"]["name"], "get_context");
    assert_eq!(req.body["tool_choice"], "auto");
}

fn qdrant_reply(_: &Method, path: &str) -> Value {
    if path.ends_with("/exists") {
        json!({"result": {"exists": false}, "status": "ok"})
    } else if path.ends_with("/points/query") {
        json!({
            "result": {"points": [
                {"id": 7, "version": 1, "score": 0.93, "payload": {"text": "Art. 3"}}
            ]},
            "status": "ok"
        })
    } else {
        json!({"result": true, "status": "ok"})
    }
}

#[tokio::test]
async fn test_qdrant_collection_lifecycle() {
    let (base, log) = fake_api(qdrant_reply).await;
    let store = QdrantStore::with_api_key(&base, Some("qd-key".to_string())).unwrap();

    assert!(!store.collection_exists("rules").await.unwrap());
    store
        .create_collection("rules", 2, Distance::Cosine)
        .await
        .unwrap();
    let mut payload = Map::new();
    payload.insert("text".to_string(), json!("Art. 3"));
    store
        .upsert(
            "rules",
            vec![Point {
                id: 7,
                vector: vec![1.0, 0.0],
                payload,
            }],
        )
        .await
        .unwrap();
    let hits = store.query("rules", &[1.0, 0.0], 3).await.unwrap();
    store.delete_collection("rules").await.unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 7);
    assert_eq!(hits[0].payload["text"], "Art. 3");

    let requests = log.lock().unwrap();
    let calls: Vec<(Method, &str)> = requests
        .iter()
        .map(|r| (r.method.clone(), r.target.as_str()))
        .collect();
    assert_eq!(
        calls,
        vec![
            (Method::GET, "/collections/rules/exists"),
            (Method::PUT, "/collections/rules"),
            (Method::PUT, "/collections/rules/points?wait=true"),
            (Method::POST, "/collections/rules/points/query"),
            (Method::DELETE, "/collections/rules"),
        ]
    );
    assert!(requests.iter().all(|r| r.header("api-key") == Some("qd-key")));
    assert_eq!(
        requests[1].body,
        json!({"vectors": {"size": 2, "distance": "Cosine"}})
    );
    assert_eq!(requests[2].body["points"][0]["id"], 7);
    assert_eq!(requests[3].body["limit"], 3);
    assert_eq!(requests[3].body["with_payload"], true);
}

//! Integration tests for `OllamaModel` against a raw TCP test server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_api::OllamaModel;
use relay_types::{ConversationContext, ModelClient, ModelError, ToolDeclaration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn http_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

/// Read one HTTP request and return its body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= header_end + 4 + content_length {
            return String::from_utf8_lossy(&buf[header_end + 4..header_end + 4 + content_length])
                .into_owned();
        }
    }
    String::new()
}

/// Start a server answering each connection with the next response.
/// Returns the base URL and the request bodies received so far.
async fn start_test_server(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let bodies_clone = Arc::clone(&bodies);

    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = read_request(&mut socket).await;
            bodies_clone.lock().unwrap().push(body);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.flush().await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), bodies)
}

fn add_tool() -> Vec<ToolDeclaration> {
    vec![ToolDeclaration {
        name: "add".into(),
        description: "Add two numbers".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {"x": {"type": "number"}, "y": {"type": "number"}}
        }),
    }]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn native_tool_call_reply() {
    let body = r#"{"model":"llama3.2","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"add","arguments":{"x":2,"y":3}}}]},"done":true,"done_reason":"stop"}"#;
    let (base_url, bodies) = start_test_server(vec![http_response("200 OK", body)]).await;

    let model = OllamaModel::new("llama3.2", &base_url, Duration::from_secs(5)).unwrap();
    let context = ConversationContext::new("What is 2+3?");
    let tools = add_tool();
    let reply = model.generate(&context, &tools).await.unwrap();

    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].name, "add");
    assert_eq!(reply.tool_calls[0].arguments["x"], 2);

    let sent: serde_json::Value = serde_json::from_str(&bodies.lock().unwrap()[0]).unwrap();
    assert_eq!(sent["model"], "llama3.2");
    assert_eq!(sent["stream"], false);
    assert_eq!(sent["messages"][0]["content"], "What is 2+3?");
    assert_eq!(sent["tools"][0]["function"]["name"], "add");
}

#[tokio::test]
async fn plain_text_reply_is_terminal() {
    let body = r#"{"message":{"role":"assistant","content":"The answer is 5."},"done":true}"#;
    let (base_url, _) = start_test_server(vec![http_response("200 OK", body)]).await;

    let model = OllamaModel::new("llama3.2", &base_url, Duration::from_secs(5)).unwrap();
    let reply = model
        .generate(&ConversationContext::new("2+3?"), &[])
        .await
        .unwrap();
    assert!(reply.is_terminal());
    assert_eq!(reply.text, "The answer is 5.");
}

#[tokio::test]
async fn missing_model_is_http_error_with_message() {
    let (base_url, _) = start_test_server(vec![http_response(
        "404 Not Found",
        r#"{"error":"model \"ghost\" not found, try pulling it first"}"#,
    )])
    .await;

    let model = OllamaModel::new("ghost", &base_url, Duration::from_secs(5)).unwrap();
    let err = model
        .generate(&ConversationContext::new("hi"), &[])
        .await
        .unwrap_err();
    match err {
        ModelError::Http { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("not found"));
        }
        other => panic!("Expected Http, got: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_bad_response() {
    let (base_url, _) =
        start_test_server(vec![http_response("200 OK", "{\"message\": 42}")]).await;
    let model = OllamaModel::new("m", &base_url, Duration::from_secs(5)).unwrap();
    let err = model
        .generate(&ConversationContext::new("hi"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::BadResponse(_)), "{err:?}");
}

#[tokio::test]
async fn response_without_message_is_bad_response() {
    let (base_url, _) = start_test_server(vec![http_response("200 OK", "{\"done\":true}")]).await;
    let model = OllamaModel::new("m", &base_url, Duration::from_secs(5)).unwrap();
    let err = model
        .generate(&ConversationContext::new("hi"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::BadResponse(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_endpoint_is_network_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let model = OllamaModel::new("m", format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let err = model
        .generate(&ConversationContext::new("hi"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Network(_)), "{err:?}");
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });

    let model =
        OllamaModel::new("m", format!("http://{addr}"), Duration::from_millis(200)).unwrap();
    let err = model
        .generate(&ConversationContext::new("hi"), &[])
        .await
        .unwrap_err();
    assert!(
        matches!(err, ModelError::Timeout { timeout_ms: 200 }),
        "{err:?}"
    );
}

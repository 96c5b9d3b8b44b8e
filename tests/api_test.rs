use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use pitchdesk_backend::clock::SystemClock;
use pitchdesk_backend::config::{AppConfig, StorageBackend, SubmissionConfig};
use pitchdesk_backend::models::{NewOpportunity, Opportunity};
use pitchdesk_backend::repositories::{MemoryStore, Repositories};
use pitchdesk_backend::websocket::WebSocketServer;
use pitchdesk_backend::{api, AppError, AppState, BackgroundTasks};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    state: AppState,
    tasks: BackgroundTasks,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let config = AppConfig {
            storage: StorageBackend::Memory,
            ..AppConfig::default()
        };
        let repos = Repositories::memory(Arc::new(MemoryStore::new()));
        let (state, tasks) = AppState::start(&config, repos, Arc::new(SystemClock)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            tasks,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn opportunity(&self, tier: i32) -> Opportunity {
        let now = Utc::now();
        self.state
            .opportunities
            .create(NewOpportunity {
                title: "Rate cut outlook".into(),
                industry: "finance".into(),
                tags: vec!["economy".into()],
                tier,
                base_price: None,
                slots_total: 3,
                posted_at: now,
                deadline: now + Duration::days(2),
            })
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.engine.shutdown();
        self.tasks.abort();
    }
}

fn decimal(value: &Value) -> Decimal {
    value.as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["price_channels"], 0);
}

#[tokio::test]
async fn test_price_trend_endpoint() {
    let server = TestServer::start().await;
    let opp = server.opportunity(1).await;

    let response = server
        .client
        .get(server.url(&format!("/api/opportunities/{}/price?window=1H", opp.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["window"], "1h");
    assert_eq!(body["status"], "open");
    assert_eq!(decimal(&body["current_price"]), Decimal::new(225, 0));
    assert!(!body["points"].as_array().unwrap().is_empty());

    let response = server
        .client
        .get(server.url(&format!("/api/opportunities/{}/price?window=soon", opp.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn test_unknown_opportunity_is_404() {
    let server = TestServer::start().await;
    let response = server
        .client
        .get(server.url(&format!("/api/opportunities/{}/bid-info", Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_pitch_requires_user() {
    let server = TestServer::start().await;
    let opp = server.opportunity(2).await;

    let response = server
        .client
        .post(server.url(&format!("/api/opportunities/{}/pitch", opp.id)))
        .json(&json!({ "content": "Anonymous pitch" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_draft_and_single_pitch_over_http() {
    let server = TestServer::start().await;
    let opp = server.opportunity(2).await;
    let user = Uuid::new_v4().to_string();
    let base = format!("/api/opportunities/{}", opp.id);

    let response = server
        .client
        .put(server.url(&format!("{}/draft", base)))
        .header("x-user-id", &user)
        .json(&json!({ "content": "Working notes" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status: Value = server
        .client
        .get(server.url(&format!("{}/pitch-status", base)))
        .header("x-user-id", &user)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["has_draft"], true);
    assert_eq!(status["draft_content"], "Working notes");

    let response = server
        .client
        .post(server.url(&format!("{}/pitch", base)))
        .header("x-user-id", &user)
        .json(&json!({ "content": "Final answer", "claimed_price": "175" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let receipt: Value = response.json().await.unwrap();
    assert_eq!(decimal(&receipt["bid_amount"]), Decimal::new(175, 0));
    assert_eq!(receipt["price_frozen"], false);

    let response = server
        .client
        .post(server.url(&format!("{}/pitch", base)))
        .header("x-user-id", &user)
        .json(&json!({ "content": "Second thoughts" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "duplicate_submission");

    let status: Value = server
        .client
        .get(server.url(&format!("{}/pitch-status", base)))
        .header("x-user-id", &user)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["has_submitted"], true);
    assert_eq!(status["has_draft"], false);
    assert_eq!(status["pitch"]["content"], "Final answer");
}

#[tokio::test]
async fn test_autosave_is_accepted() {
    let server = TestServer::start().await;
    let opp = server.opportunity(3).await;
    let user = Uuid::new_v4();

    let response = server
        .client
        .post(server.url(&format!("/api/opportunities/{}/draft/autosave", opp.id)))
        .header("x-user-id", user.to_string())
        .json(&json!({ "content": "typing..." }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Either this flush or the background flusher writes it
    let mut draft_content = None;
    for _ in 0..20 {
        server.state.autosave.flush().await;
        let status = server
            .state
            .pitches
            .get_user_pitch_status(user, opp.id)
            .await
            .unwrap();
        if status.draft_content.is_some() {
            draft_content = status.draft_content;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(draft_content.as_deref(), Some("typing..."));
}

#[tokio::test]
async fn test_bid_info_and_quote() {
    let server = TestServer::start().await;
    let opp = server.opportunity(1).await;
    let base = format!("/api/opportunities/{}", opp.id);

    let info: Value = server
        .client
        .get(server.url(&format!("{}/bid-info", base)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(decimal(&info["min_next_bid"]), Decimal::new(230, 0));
    assert_eq!(info["is_closed"], false);

    let response = server
        .client
        .get(server.url(&format!("{}/quote", base)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.state.opportunities.close(opp.id).await.unwrap();
    let response = server
        .client
        .get(server.url(&format!("{}/quote", base)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_related_requires_industry() {
    let server = TestServer::start().await;
    let opp = server.opportunity(1).await;
    let other = server.opportunity(2).await;

    let related: Value = server
        .client
        .get(server.url(&format!(
            "/api/opportunities/related?industry=economy&exclude={}",
            opp.id
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = related
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![other.id.to_string().as_str()]);

    let response = server
        .client
        .get(server.url("/api/opportunities/related"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_websocket_subscribe_receives_resync() {
    let server = TestServer::start().await;
    let opp = server.opportunity(1).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ws_server = WebSocketServer::new(server.state.broadcaster.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ws = ws_server.clone();
            tokio::spawn(async move {
                let _ = ws.handle_connection(stream).await;
            });
        }
    });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({ "type": "subscribe", "opportunity_id": opp.id }).to_string(),
        ))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let message = tokio::time::timeout(std::time::Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket message")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            received.push(serde_json::from_str::<Value>(&text).unwrap());
        }
    }

    assert_eq!(received[0]["type"], "subscribed");
    assert_eq!(received[0]["watchers"], 1);
    assert_eq!(received[1]["type"], "resync");
    assert_eq!(decimal(&received[1]["current_price"]), Decimal::new(225, 0));

    socket
        .send(Message::Text(
            json!({ "type": "unsubscribe", "opportunity_id": opp.id }).to_string(),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_zero_autosave_interval_is_rejected_at_startup() {
    let config = AppConfig {
        storage: StorageBackend::Memory,
        submission: SubmissionConfig {
            autosave_flush_ms: 0,
            ..SubmissionConfig::default()
        },
        ..AppConfig::default()
    };
    let repos = Repositories::memory(Arc::new(MemoryStore::new()));
    let started = AppState::start(&config, repos, Arc::new(SystemClock));
    assert!(matches!(started, Err(AppError::Config(_))));
}

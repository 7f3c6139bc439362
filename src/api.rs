use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::bus::{ChatKind, InboundMessage, Sender};
use crate::channels::cli::{CONSOLE_GROUP, CONSOLE_USER};
use crate::commands::CommandHandler;
use crate::scheduler::{ReminderScheduler, TickReport};
use crate::store::{Database, GroupId, SubjectId};

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<CommandHandler>,
    pub scheduler: Arc<ReminderScheduler>,
    pub db: Arc<Database>,
    pub name: String,
    pub api_key: Option<String>,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub text: String,
    /// Negative ids are group chats.
    #[serde(default = "default_chat")]
    pub chat_id: GroupId,
    #[serde(default = "default_user")]
    pub user_id: SubjectId,
    #[serde(default = "default_first_name")]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
}

fn default_chat() -> GroupId {
    CONSOLE_GROUP
}
fn default_user() -> SubjectId {
    CONSOLE_USER
}
fn default_first_name() -> String {
    "console".into()
}

impl MessageRequest {
    fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            chat_id: self.chat_id,
            chat_kind: if self.chat_id < 0 {
                ChatKind::Group
            } else {
                ChatKind::Private
            },
            sender: Sender {
                id: self.user_id,
                username: self.username,
                first_name: self.first_name,
                last_name: self.last_name,
            },
            message_id: None,
            text: self.text,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub replies: Vec<String>,
}

#[derive(Serialize)]
pub struct TickResponse {
    /// False when another tick was already running.
    pub ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TickReport>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/message", post(handle_message))
        .route("/tick", post(handle_tick))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .with_state(state)
}

async fn auth_layer(State(state): State<AppState>, req: Request, next: Next) -> impl IntoResponse {
    if let Some(ref expected) = state.api_key {
        let auth_ok = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| t == expected);
        if !auth_ok {
            let body = serde_json::json!({ "error": "Unauthorized" });
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }
    }
    next.run(req).await.into_response()
}

async fn handle_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> impl IntoResponse {
    let msg = req.into_inbound();
    let handler = state.handler.clone();
    let handled = tokio::task::spawn_blocking(move || handler.handle(&msg))
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("command task panicked: {e}")));
    match handled {
        Ok(replies) => (
            StatusCode::OK,
            Json(MessageResponse {
                replies: replies.into_iter().map(|r| r.text).collect(),
            }),
        ),
        Err(e) => {
            tracing::error!("Command error: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageResponse {
                    replies: vec![format!("Error: {e}")],
                }),
            )
        }
    }
}

async fn handle_tick(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.tick().await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!(TickResponse {
                ran: report.is_some(),
                report,
            })),
        ),
        Err(e) => {
            tracing::error!("On-demand tick failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{e:#}") })),
            )
        }
    }
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || db.stats())
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("stats task panicked: {e}")));
    let birthdays = match stats {
        Ok(stats) => serde_json::json!(stats),
        Err(e) => {
            tracing::warn!("Health check could not read stats: {e:#}");
            serde_json::Value::Null
        }
    };
    Json(serde_json::json!({
        "status": "ok",
        "name": state.name,
        "version": env!("CARGO_PKG_VERSION"),
        "birthdays": birthdays,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::channels::testing::RecordingChannel;
    use crate::clock::fixed::FixedClock;
    use crate::config::ReminderConfig;
    use crate::dates::BirthDate;
    use crate::dispatcher::NotificationDispatcher;
    use crate::store::{BirthdayStore, DisplayName};
    use crate::tags::TagDirectory;

    async fn serve(api_key: Option<&str>) -> (String, Arc<Database>, Arc<RecordingChannel>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(FixedClock::at(2024, 5, 14, 12, 0));
        let channel = Arc::new(RecordingChannel::default());
        let handler = CommandHandler::new(db.clone(), TagDirectory::new(BTreeMap::new()), clock.clone());
        let scheduler = ReminderScheduler::new(
            db.clone(),
            db.clone(),
            NotificationDispatcher::new(channel.clone(), Duration::ZERO),
            clock,
            ReminderConfig::default(),
        );
        let state = AppState {
            handler: Arc::new(handler),
            scheduler: Arc::new(scheduler),
            db: db.clone(),
            name: "herald".into(),
            api_key: api_key.map(String::from),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{addr}"), db, channel)
    }

    #[tokio::test]
    async fn test_health_reports_stats() {
        let (url, db, _) = serve(None).await;
        db.upsert(1, -100, BirthDate::new(Some(1990), 5, 15).unwrap(), &DisplayName::default())
            .unwrap();

        let body: Value = reqwest::get(format!("{url}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["name"], "herald");
        assert_eq!(body["birthdays"]["birthdays"], 1);
    }

    #[tokio::test]
    async fn test_message_runs_command() {
        let (url, _, _) = serve(None).await;
        let client = reqwest::Client::new();
        let body: MessageResponse = client
            .post(format!("{url}/message"))
            .json(&json!({ "text": "/set_birthday", "chat_id": -100, "first_name": "Anna" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.replies.len(), 1);
        assert!(body.replies[0].starts_with("📅 Anna"));
    }

    #[tokio::test]
    async fn test_tick_sends_reminders() {
        let (url, db, channel) = serve(None).await;
        db.upsert(1, -100, BirthDate::new(Some(1990), 5, 15).unwrap(), &DisplayName::default())
            .unwrap();
        db.upsert(2, -100, BirthDate::new(Some(1985), 12, 3).unwrap(), &DisplayName::default())
            .unwrap();

        let client = reqwest::Client::new();
        let body: Value = client
            .post(format!("{url}/tick"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ran"], true);
        assert_eq!(body["report"]["reminders"], 1);
        assert_eq!(channel.sent_to(), vec![2]);
    }

    #[tokio::test]
    async fn test_auth_required_when_key_set() {
        let (url, _, _) = serve(Some("secret")).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{url}/health")).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let wrong = client
            .get(format!("{url}/health"))
            .bearer_auth("nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

        let ok = client
            .get(format!("{url}/health"))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert!(ok.status().is_success());
    }
}

//! HTTP surface: a chat endpoint and a health probe.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use log::info;
use serde::{Deserialize, Serialize};

use answerkit_engine::router::HybridRouter;
use answerkit_engine::types::{ConversationTurn, RouterResponse};

/// The routing capability the HTTP layer depends on.
///
/// [`HybridRouter`] is the production implementation; handler tests
/// substitute a stub so they run without providers or an index.
#[async_trait::async_trait]
pub trait QueryService: Send + Sync {
    async fn answer(&self, query: &str, history: Option<&[ConversationTurn]>) -> RouterResponse;
}

#[async_trait::async_trait]
impl QueryService for HybridRouter {
    async fn answer(&self, query: &str, history: Option<&[ConversationTurn]>) -> RouterResponse {
        self.get_response(query, history).await
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    #[serde(default)]
    pub history: Option<Vec<ConversationTurn>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

pub fn app(service: Arc<dyn QueryService>) -> axum::Router {
    axum::Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .with_state(service)
}

/// Bind and serve until the process is interrupted.
pub async fn serve(addr: &str, service: Arc<dyn QueryService>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn chat(
    State(service): State<Arc<dyn QueryService>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<RouterResponse>, (StatusCode, Json<ErrorBody>)> {
    if req.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "text must not be empty".to_string(),
            }),
        ));
    }
    let response = service.answer(&req.text, req.history.as_deref()).await;
    Ok(Json(response))
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerkit_engine::types::AnswerSource;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Echoes the query back, tagging history presence in the reply.
    struct StubService;

    #[async_trait::async_trait]
    impl QueryService for StubService {
        async fn answer(
            &self,
            query: &str,
            history: Option<&[ConversationTurn]>,
        ) -> RouterResponse {
            let turns = history.map(|h| h.len()).unwrap_or(0);
            RouterResponse {
                response: format!("answer to {query} ({turns} turns)"),
                source: AnswerSource::Faq,
                similarity_score: 0.9,
            }
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_returns_the_response_envelope() {
        let app = app(Arc::new(StubService));
        let response = app
            .oneshot(post_json("/chat", r#"{"text":"what are your hours?"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["response"], "answer to what are your hours? (0 turns)");
        assert_eq!(json["source"], "faq");
        assert!(json["similarity_score"].as_f64().unwrap() > 0.8);
    }

    #[tokio::test]
    async fn chat_forwards_history() {
        let app = app(Arc::new(StubService));
        let body = r#"{"text":"and on sundays?","history":[{"role":"user","content":"hours?"},{"role":"assistant","content":"9-5"}]}"#;
        let response = app.oneshot(post_json("/chat", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["response"], "answer to and on sundays? (2 turns)");
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let app = app(Arc::new(StubService));
        let response = app
            .oneshot(post_json("/chat", r#"{"text":"   "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"], "text must not be empty");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(Arc::new(StubService));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = app(Arc::new(StubService));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

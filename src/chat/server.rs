// HTTP surface of the chat server
//
// Every route except the challenge, verification and upload download needs a
// valid session cookie. Handlers return `ChatResult` and `handle` turns errors
// into coarse JSON responses, so the service itself never fails.

use crate::chat::challenge::{ChallengeManager, CHALLENGE_COOKIE};
use crate::chat::config::ChatConfig;
use crate::chat::delivery::DeliveryTracker;
use crate::chat::error::{ChatError, ChatResult};
use crate::chat::events::{EventHub, HubEvent};
use crate::chat::gate::{client_key, AccessGate, SecretCode, VerifyRequest};
use crate::chat::message::NewMessage;
use crate::chat::rate_limit::RateLimiter;
use crate::chat::session::{SessionManager, SESSION_COOKIE};
use crate::chat::storage::{MessageStore, SqliteMessageStore, MAX_PAGE};
use crate::chat::stream::StreamSession;
use crate::chat::upload::{UploadStore, UPLOADS_PREFIX};
use anyhow::Context;
use hyper::body::{Bytes, HttpBody};
use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Limit for JSON request bodies
const MAX_JSON_BODY: usize = 64 * 1024;

/// How often expired rate limit entries are purged
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Header carrying the client-side file name of an upload
pub const FILE_NAME_HEADER: &str = "x-file-name";

/// Shared state behind every request
pub struct ChatState {
    config: ChatConfig,
    gate: AccessGate,
    challenges: ChallengeManager,
    sessions: SessionManager,
    store: Arc<dyn MessageStore>,
    hub: EventHub,
    delivery: DeliveryTracker,
    uploads: UploadStore,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
}

impl ChatState {
    pub fn new(config: ChatConfig, store: Arc<dyn MessageStore>) -> Self {
        let limiter = Arc::new(RateLimiter::new());
        let challenges = ChallengeManager::new(config.challenge_secret.clone());
        let sessions = SessionManager::new(config.session_secret.clone(), config.session_ttl);
        let gate = AccessGate::new(
            limiter.clone(),
            config.rate_limit,
            challenges.clone(),
            sessions.clone(),
            SecretCode::new(config.secret_code_salt.clone(), config.secret_code_hash.clone()),
            config.wrong_code_redirect.clone(),
        );
        let hub = EventHub::new(config.subscriber_capacity);
        let delivery = DeliveryTracker::new(store.clone(), hub.clone());
        let uploads = UploadStore::new(config.uploads_dir.clone(), config.max_upload_bytes);

        Self {
            config,
            gate,
            challenges,
            sessions,
            store,
            hub,
            delivery,
            uploads,
            limiter,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Cancelled when the server shuts down; open streams close on it
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn authorize(&self, req: &Request<Body>) -> ChatResult<()> {
        match cookie(req, SESSION_COOKIE) {
            Some(token) if self.sessions.validate(&token) => Ok(()),
            _ => Err(ChatError::Unauthorized),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest {
    #[serde(default)]
    message_ids: Vec<String>,
    #[serde(default)]
    requester_id: String,
}

#[derive(Serialize)]
struct MessageList<'a, T> {
    messages: &'a [T],
}

/// Route a request; errors become JSON responses
pub async fn handle(state: Arc<ChatState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/api/captcha") => captcha(&state),
        (&Method::POST, "/api/verify") => verify(&state, req).await,
        (&Method::GET, "/api/messages") => list_messages(&state, req),
        (&Method::POST, "/api/messages") => create_message(&state, req).await,
        (&Method::POST, "/api/messages/ack") => acknowledge(&state, req).await,
        (&Method::POST, "/api/messages/upload") => upload(&state, req).await,
        (&Method::GET, "/api/stream") => stream(&state, req),
        (&Method::GET, p) if p.starts_with(UPLOADS_PREFIX) => {
            serve_upload(&state, &p[UPLOADS_PREFIX.len()..]).await
        }
        _ => Err(ChatError::NotFound),
    };

    Ok(result.unwrap_or_else(|e| {
        tracing::debug!("{} {} failed: {}", method, path, e);
        error_response(e)
    }))
}

fn captcha(state: &ChatState) -> ChatResult<Response<Body>> {
    let challenge = state.challenges.generate();
    let mut response = json_response(StatusCode::OK, &json!({ "question": challenge.question }));
    set_cookie(
        &mut response,
        CHALLENGE_COOKIE,
        &challenge.token,
        state.config.challenge_ttl,
    );
    Ok(response)
}

async fn verify(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    let client = client_key(
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
    );
    let challenge_token = cookie(&req, CHALLENGE_COOKIE);

    // An unreadable body still counts as an attempt
    let body = read_body(req.into_body(), MAX_JSON_BODY).await.unwrap_or_default();
    let request: VerifyRequest = serde_json::from_slice(&body).unwrap_or_default();

    let token = state
        .gate
        .verify(&client, &request, challenge_token.as_deref())?;

    let mut response = json_response(StatusCode::OK, &json!({ "ok": true }));
    set_cookie(&mut response, SESSION_COOKIE, &token, state.sessions.ttl());
    Ok(response)
}

fn list_messages(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    state.authorize(&req)?;

    let after = match query_param(&req, "after") {
        Some(raw) if !raw.is_empty() => Some(
            raw.parse::<u64>()
                .map_err(|_| ChatError::InvalidPayload(format!("bad cursor '{raw}'")))?,
        ),
        _ => None,
    };

    let messages = state.store.list_since(after, MAX_PAGE)?;
    Ok(json_response(
        StatusCode::OK,
        &MessageList {
            messages: &messages,
        },
    ))
}

async fn create_message(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    state.authorize(&req)?;

    let body = read_body(req.into_body(), MAX_JSON_BODY).await?;
    let new: NewMessage = serde_json::from_slice(&body)
        .map_err(|e| ChatError::InvalidPayload(e.to_string()))?;

    let message = state.store.create(new)?;
    let notified = state.hub.publish(HubEvent::Message(message.clone()));
    tracing::debug!("Message {} fanned out to {} subscriber(s)", message.id, notified);

    Ok(json_response(StatusCode::OK, &json!({ "message": message })))
}

async fn acknowledge(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    state.authorize(&req)?;

    let body = read_body(req.into_body(), MAX_JSON_BODY).await?;
    let ack: AckRequest = serde_json::from_slice(&body)
        .map_err(|e| ChatError::InvalidPayload(e.to_string()))?;

    if !ack.message_ids.is_empty() {
        if ack.requester_id.trim().is_empty() {
            return Err(ChatError::InvalidPayload("requesterId is required".into()));
        }
        state.delivery.acknowledge(&ack.message_ids, &ack.requester_id)?;
    }

    Ok(json_response(StatusCode::OK, &json!({ "ok": true })))
}

async fn upload(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    state.authorize(&req)?;

    let mime = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let file_name = req
        .headers()
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "upload".to_string());

    // Refuse early when the declared size already says no
    if let Some(length) = content_length(&req) {
        state.uploads.validate(&mime, length)?;
    }

    let limit = usize::try_from(state.uploads.max_bytes()).unwrap_or(usize::MAX);
    let bytes = read_body(req.into_body(), limit).await.map_err(|e| match e {
        ChatError::InvalidPayload(_) => ChatError::FileTooLarge,
        other => other,
    })?;

    let stored = state.uploads.store(&file_name, &mime, &bytes).await?;
    Ok(json_response(StatusCode::OK, &stored))
}

fn stream(state: &ChatState, req: Request<Body>) -> ChatResult<Response<Body>> {
    let token = cookie(&req, SESSION_COOKIE);
    let session = StreamSession::authorize(
        &state.sessions,
        token.as_deref(),
        state.hub.clone(),
        state.config.heartbeat,
        state.shutdown.clone(),
    )?;

    let (sender, body) = Body::channel();
    tokio::spawn(session.run(sender));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

async fn serve_upload(state: &ChatState, name: &str) -> ChatResult<Response<Body>> {
    let (bytes, mime) = state.uploads.open(name).await?;

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// Value of a request cookie
pub fn cookie(req: &Request<Body>, name: &str) -> Option<String> {
    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value with the attributes every credential cookie uses
pub fn cookie_header(name: &str, value: &str, max_age: Duration) -> String {
    format!(
        "{name}={value}; Max-Age={}; Path=/; HttpOnly; SameSite=Strict; Secure",
        max_age.as_secs()
    )
}

fn set_cookie(response: &mut Response<Body>, name: &str, value: &str, max_age: Duration) {
    match HeaderValue::from_str(&cookie_header(name, value, max_age)) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::error!("Failed to build {} cookie: {}", name, e),
    }
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn content_length(req: &Request<Body>) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Collect a request body, refusing anything over `limit` bytes
async fn read_body(mut body: Body, limit: usize) -> ChatResult<Bytes> {
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ChatError::Io(std::io::Error::other(e)))?;
        if collected.len() + chunk.len() > limit {
            return Err(ChatError::InvalidPayload("body too large".into()));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Client-facing response for an error
pub fn error_response(error: ChatError) -> Response<Body> {
    let (status, body) = match &error {
        ChatError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" })),
        ChatError::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "ok": false, "error": "Too many attempts. Try again soon." }),
        ),
        ChatError::ChallengeIncorrect => (
            StatusCode::BAD_REQUEST,
            json!({ "ok": false, "error": "Captcha incorrect." }),
        ),
        ChatError::SecretCodeIncorrect { redirect } => (
            StatusCode::UNAUTHORIZED,
            json!({ "ok": false, "redirectUrl": redirect }),
        ),
        ChatError::InvalidPayload(_) => {
            (StatusCode::BAD_REQUEST, json!({ "error": "Invalid payload." }))
        }
        ChatError::NoFile => (StatusCode::BAD_REQUEST, json!({ "error": "No file provided." })),
        ChatError::FileTooLarge => (StatusCode::BAD_REQUEST, json!({ "error": "File too large." })),
        ChatError::UnsupportedFileType(_) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": "Unsupported file type." }),
        ),
        ChatError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
        ChatError::Storage(_) | ChatError::Io(_) | ChatError::Json(_) => {
            tracing::error!("Request failed: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal error" }),
            )
        }
    };
    json_response(status, &body)
}

/// Run the chat server until Ctrl+C
pub async fn run(config: ChatConfig) -> anyhow::Result<()> {
    config.validate()?;
    config.warn_insecure_defaults();
    let addr = config.listen_addr()?;

    let store = SqliteMessageStore::new(&config.database_path).with_context(|| {
        format!(
            "Failed to open message database {}",
            config.database_path.display()
        )
    })?;
    tracing::info!("Message database: {}", store.path().display());
    tracing::info!("Uploads directory: {}", config.uploads_dir.display());

    let state = Arc::new(ChatState::new(config, Arc::new(store)));
    state
        .limiter()
        .clone()
        .start_cleanup_task(RATE_LIMIT_CLEANUP_INTERVAL);

    let shutdown = state.shutdown_token().clone();
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {addr}"))?
        .serve(make_svc);
    tracing::info!("mochat listening on http://{}", server.local_addr());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            signal_token.cancel();
        }
    });

    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

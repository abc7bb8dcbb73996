use futures_util::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth::manager::validate_credential;
use crate::auth::token::fetch_usage;
use crate::auth::{GithubExchanger, HttpClient, TokenExchanger, TokenManager, UserRegistry, device};
use crate::config::{ACCOUNT_TYPES, Config};
use crate::error::{AuthError, Error, Result};
use crate::format::{
    chat_request, chat_request_from_responses, completion_from_upstream, extract_text,
    message_from_responses, response_from_chat, responses_request_from_messages,
    usage_from_chat, wants_stream,
};
use crate::kv::{self, KvStore};
use crate::models;
use crate::stream::{self, AnthropicReframer, ChatReframer, ResponsesReframer};
use crate::upstream::{CopilotClient, read_body};

/// Maximum request body size (10 MB).
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const ACCOUNT_TYPE_HEADER: &str = "x-copilot-account-type";
const REQUEST_ID_HEADER: &str = "x-request-id";

pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Shared server state passed to all request handlers.
pub struct ServerState {
    pub config: Config,
    pub http: Arc<HttpClient>,
    pub kv: Arc<dyn KvStore>,
    pub tokens: Arc<TokenManager>,
    pub users: UserRegistry,
    pub copilot: CopilotClient,
}

impl ServerState {
    /// Build the state for `config`, with the configured KV backend and the
    /// GitHub token exchange.
    pub fn new(config: Config) -> Result<Self> {
        let http = Arc::new(HttpClient::new());
        let kv = kv::from_config(&config.kv, http.clone())?;
        let exchanger = Arc::new(GithubExchanger::new(
            http.clone(),
            &config.upstream.github_api_base,
            &config.upstream.vscode_version,
        ));
        Ok(Self::with_parts(config, http, kv, exchanger))
    }

    pub fn with_parts(
        config: Config,
        http: Arc<HttpClient>,
        kv: Arc<dyn KvStore>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(kv.clone(), exchanger));
        let users = UserRegistry::new(kv.clone(), tokens.clone());
        let copilot = CopilotClient::new(&config.upstream);
        Self {
            config,
            http,
            kv,
            tokens,
            users,
            copilot,
        }
    }
}

/// Client dialect of a route, which decides the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    ChatCompletions,
    Responses,
    Messages,
    Embeddings,
    Models,
    Usage,
}

impl Endpoint {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "v1/chat/completions" => Some(Endpoint::ChatCompletions),
            "v1/responses" => Some(Endpoint::Responses),
            "v1/messages" => Some(Endpoint::Messages),
            "v1/embeddings" => Some(Endpoint::Embeddings),
            "v1/models" => Some(Endpoint::Models),
            "usage" => Some(Endpoint::Usage),
            _ => None,
        }
    }

    fn method(self) -> Method {
        match self {
            Endpoint::Models | Endpoint::Usage => Method::GET,
            _ => Method::POST,
        }
    }

    fn dialect(self) -> Dialect {
        match self {
            Endpoint::Messages => Dialect::Anthropic,
            _ => Dialect::OpenAi,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Preflight,
    Health,
    RegisterUser,
    ListUsers,
    DeleteUser(&'a str),
    DeviceCode,
    PollDeviceCode,
    Api {
        user: Option<&'a str>,
        endpoint: Endpoint,
    },
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    if *method == Method::OPTIONS {
        return Route::Preflight;
    }

    match (method, path) {
        (&Method::GET, "/health") => return Route::Health,
        (&Method::POST, "/api/users") => return Route::RegisterUser,
        (&Method::GET, "/api/users") => return Route::ListUsers,
        (&Method::GET, "/github/get-device-code") | (&Method::POST, "/github/get-device-code") => {
            return Route::DeviceCode;
        }
        (&Method::POST, "/github/poll-device-code") => return Route::PollDeviceCode,
        _ => {}
    }

    if *method == Method::DELETE
        && let Some(user) = path.strip_prefix("/api/users/")
        && !user.is_empty()
        && !user.contains('/')
    {
        return Route::DeleteUser(user);
    }

    let trimmed = path.trim_start_matches('/');
    if let Some(endpoint) = Endpoint::from_path(trimmed)
        && endpoint != Endpoint::Usage
        && *method == endpoint.method()
    {
        return Route::Api {
            user: None,
            endpoint,
        };
    }
    if let Some((user, rest)) = trimmed.split_once('/')
        && !user.is_empty()
        && let Some(endpoint) = Endpoint::from_path(rest)
        && *method == endpoint.method()
    {
        return Route::Api {
            user: Some(user),
            endpoint,
        };
    }

    Route::NotFound
}

/// Handle an incoming TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        let remote = remote_addr;
        async move { handle_request(req, state, remote).await }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
) -> std::result::Result<Response<ResponseBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = generate_request_id();

    debug!(
        method = %method,
        path = %path,
        remote = %remote_addr,
        request_id = %request_id,
        "Received request"
    );

    let start = std::time::Instant::now();
    let dialect = match route(&method, &path) {
        Route::Api { endpoint, .. } => endpoint.dialect(),
        _ => Dialect::OpenAi,
    };

    // Bounds the wait for response headers; streamed bodies are not limited.
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let result =
        match tokio::time::timeout(request_timeout, dispatch(req, &state, &path, &request_id))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %request_id, "Request timed out");
                Err(Error::Timeout(request_timeout))
            }
        };

    let duration = start.elapsed();

    let mut response = match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status >= 400 {
                warn!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request failed"
                );
            } else {
                info!(
                    method = %method,
                    path = %path,
                    status = status,
                    duration_ms = duration.as_millis(),
                    request_id = %request_id,
                    "Request completed"
                );
            }
            resp
        }
        Err(e) => {
            let resp = error_to_response(&e, dialect);
            warn!(
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                duration_ms = duration.as_millis(),
                request_id = %request_id,
                error = %e,
                "Request error"
            );
            resp
        }
    };

    let headers = response.headers_mut();
    add_cors_headers(headers);
    if let Ok(id) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), id);
    }
    Ok(response)
}

async fn dispatch(
    req: Request<Incoming>,
    state: &Arc<ServerState>,
    path: &str,
    request_id: &str,
) -> Result<Response<ResponseBody>> {
    match route(req.method(), path) {
        Route::Preflight => Ok(empty_response(StatusCode::NO_CONTENT)),
        Route::Health => Ok(json_response(StatusCode::OK, &json!({"status": "ok"}))),
        Route::RegisterUser => handle_register(req, state).await,
        Route::ListUsers => handle_list_users(state).await,
        Route::DeleteUser(user) => handle_delete_user(req, state, user).await,
        Route::DeviceCode => handle_device_code(state).await,
        Route::PollDeviceCode => handle_poll_device_code(req, state).await,
        Route::Api { user, endpoint } => handle_api(req, state, user, endpoint, request_id).await,
        Route::NotFound => Ok(json_response(
            StatusCode::NOT_FOUND,
            &json!({"error": "Not found"}),
        )),
    }
}

fn generate_request_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("req_{:016x}", nanos)
}

// -- Dialect routes --

async fn handle_api(
    req: Request<Incoming>,
    state: &Arc<ServerState>,
    user: Option<&str>,
    endpoint: Endpoint,
    request_id: &str,
) -> Result<Response<ResponseBody>> {
    let headers = req.headers();
    let base = state.copilot.base_url(account_type(headers)?);

    let credential = match (user, endpoint) {
        (None, Endpoint::Models) => match state
            .tokens
            .fallback_credential(state.config.auth.long_term_token.as_deref())
            .await
        {
            Ok(credential) => credential,
            Err(Error::Auth(AuthError::MissingCredential)) => {
                debug!(request_id = %request_id, "No fallback credential, empty model list");
                return Ok(json_response(
                    StatusCode::OK,
                    &json!({"object": "list", "data": []}),
                ));
            }
            Err(e) => return Err(e),
        },
        _ => resolve_credential(state, user, headers, endpoint).await?,
    };

    match endpoint {
        Endpoint::Usage => {
            let usage = fetch_usage(
                &state.http,
                &state.config.upstream.github_api_base,
                &state.config.upstream.vscode_version,
                &credential,
            )
            .await?;
            Ok(json_response(StatusCode::OK, &usage))
        }
        Endpoint::Models => {
            let token = state.tokens.resolve_upstream_token(&credential).await?;
            let data = models::list_models(
                state.kv.as_ref(),
                &state.copilot,
                &base,
                &token.token,
                state.config.upstream.models_cache_ttl_secs,
            )
            .await?;
            Ok(json_response(
                StatusCode::OK,
                &json!({"object": "list", "data": data}),
            ))
        }
        Endpoint::Embeddings => {
            let body = read_body_limited(req.into_body()).await?;
            let token = state.tokens.resolve_upstream_token(&credential).await?;
            handle_embeddings(state, &base, &token.token, body).await
        }
        Endpoint::ChatCompletions => {
            let body = read_json(req.into_body()).await?;
            handle_chat_completions(state, &base, &credential, body, request_id).await
        }
        Endpoint::Responses => {
            let body = read_json(req.into_body()).await?;
            handle_responses(state, &base, &credential, body, request_id).await
        }
        Endpoint::Messages => {
            let body = read_json(req.into_body()).await?;
            handle_messages(state, &base, &credential, body, request_id).await
        }
    }
}

/// Per-request account type, case-insensitive.
fn account_type(headers: &HeaderMap) -> Result<Option<&'static str>> {
    let Some(value) = headers.get(ACCOUNT_TYPE_HEADER) else {
        return Ok(None);
    };
    let value = value.to_str().unwrap_or_default().trim();
    if value.is_empty() {
        return Ok(None);
    }
    ACCOUNT_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(value))
        .copied()
        .map(Some)
        .ok_or_else(|| {
            Error::Validation(format!(
                "Invalid X-Copilot-Account-Type '{}'. Valid values: {}",
                value,
                ACCOUNT_TYPES.join(", ")
            ))
        })
}

/// `Authorization: Bearer <secret>`, or `x-api-key` where Anthropic clients send it.
fn client_secret(headers: &HeaderMap, allow_api_key: bool) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let api_key = || {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    bearer.or_else(|| if allow_api_key { api_key() } else { None })
}

/// Long-lived credential for a request: the user's registration on
/// `/{user}/...` routes, the process-wide fallback otherwise.
async fn resolve_credential(
    state: &ServerState,
    user: Option<&str>,
    headers: &HeaderMap,
    endpoint: Endpoint,
) -> Result<String> {
    match user {
        Some(username) => {
            let password =
                client_secret(headers, endpoint == Endpoint::Messages).unwrap_or_default();
            let record = state
                .users
                .authenticate(&username.to_lowercase(), password)
                .await?;
            Ok(record.long_term_token)
        }
        None => {
            state
                .tokens
                .fallback_credential(state.config.auth.long_term_token.as_deref())
                .await
        }
    }
}

async fn handle_chat_completions(
    state: &ServerState,
    base: &str,
    credential: &str,
    body: Value,
    request_id: &str,
) -> Result<Response<ResponseBody>> {
    let client_stream = wants_stream(&body);
    let request = chat_request(&body)?;
    let model = request.model.clone();
    debug!(request_id = %request_id, model = %model, stream = client_stream, "Chat completion");
    log_if_enabled(state, request_id, "Upstream chat request", &request);

    let token = state.tokens.resolve_upstream_token(credential).await?;
    let upstream_stream = request.stream;
    let payload = Bytes::from(serde_json::to_vec(&request)?);
    let response = state
        .copilot
        .chat_completions(base, &token.token, payload, upstream_stream)
        .await?;

    if upstream_stream {
        let frames = stream::reframe(
            response.into_body().into_data_stream(),
            ChatReframer::new(&model),
        );
        return Ok(sse_response(frames));
    }

    let completion = completion_from_upstream(&parse_upstream(&read_body(response).await?)?, &model);
    if client_stream {
        return Ok(sse_response(stream::replay(ChatReframer::replay(
            &completion,
        ))));
    }
    Ok(json_response(StatusCode::OK, &completion))
}

async fn handle_responses(
    state: &ServerState,
    base: &str,
    credential: &str,
    body: Value,
    request_id: &str,
) -> Result<Response<ResponseBody>> {
    let client_stream = wants_stream(&body);
    let request = chat_request_from_responses(&body)?;
    let model = request.model.clone();
    debug!(request_id = %request_id, model = %model, stream = client_stream, "Responses request");
    log_if_enabled(state, request_id, "Upstream chat request", &request);

    let token = state.tokens.resolve_upstream_token(credential).await?;
    let upstream_stream = request.stream;
    let payload = Bytes::from(serde_json::to_vec(&request)?);
    let response = state
        .copilot
        .chat_completions(base, &token.token, payload, upstream_stream)
        .await?;

    if upstream_stream {
        let frames = stream::reframe(
            response.into_body().into_data_stream(),
            ResponsesReframer::new(&model),
        );
        return Ok(sse_response(frames));
    }

    let value = parse_upstream(&read_body(response).await?)?;
    if client_stream {
        let frames =
            ResponsesReframer::replay(&model, &extract_text(&value), usage_from_chat(&value));
        return Ok(sse_response(stream::replay(frames)));
    }
    Ok(json_response(
        StatusCode::OK,
        &response_from_chat(&value, &model),
    ))
}

async fn handle_messages(
    state: &ServerState,
    base: &str,
    credential: &str,
    body: Value,
    request_id: &str,
) -> Result<Response<ResponseBody>> {
    let client_stream = wants_stream(&body);
    let request = responses_request_from_messages(&body)?;
    let model = request.model.clone();
    debug!(request_id = %request_id, model = %model, stream = client_stream, "Messages request");
    log_if_enabled(state, request_id, "Upstream responses request", &request);

    let token = state.tokens.resolve_upstream_token(credential).await?;
    let upstream_stream = request.stream;
    let payload = Bytes::from(serde_json::to_vec(&request)?);
    let response = state
        .copilot
        .responses(base, &token.token, payload, upstream_stream)
        .await?;

    if upstream_stream {
        let frames = stream::reframe(
            response.into_body().into_data_stream(),
            AnthropicReframer::new(&model),
        );
        return Ok(sse_response(frames));
    }

    let message = message_from_responses(&parse_upstream(&read_body(response).await?)?, &model);
    if client_stream {
        return Ok(sse_response(stream::replay(AnthropicReframer::replay(
            &message,
        ))));
    }
    Ok(json_response(StatusCode::OK, &message))
}

async fn handle_embeddings(
    state: &ServerState,
    base: &str,
    token: &str,
    body: Bytes,
) -> Result<Response<ResponseBody>> {
    match state.copilot.embeddings(base, token, body).await {
        Ok(raw) => Ok(raw_json_response(StatusCode::OK, raw)),
        Err(Error::Upstream { status, body }) => Ok(json_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            &json!({"error": format!("Failed to get embeddings: {} {}", status, body)}),
        )),
        Err(e) => Err(e),
    }
}

fn parse_upstream(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw).map_err(|e| Error::Http(format!("invalid upstream body: {}", e)))
}

// -- Registry and device flow --

#[derive(Debug, Default, Deserialize)]
struct RegistrationForm {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

/// `application/x-www-form-urlencoded` registration fields.
fn parse_form(body: &[u8]) -> RegistrationForm {
    let mut form = RegistrationForm::default();
    for pair in String::from_utf8_lossy(body).split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = value.replace('+', " ");
        let value = urlencoding::decode(&value)
            .map(|v| v.into_owned())
            .unwrap_or(value);
        match key {
            "username" => form.username = Some(value),
            "password" => form.password = Some(value),
            "token" => form.token = Some(value),
            _ => {}
        }
    }
    form
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    field
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Validation(format!("`{}` is required", name)))
}

async fn handle_register(
    req: Request<Incoming>,
    state: &ServerState,
) -> Result<Response<ResponseBody>> {
    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    let body = read_body_limited(req.into_body()).await?;
    let form: RegistrationForm = if is_form {
        parse_form(&body)
    } else {
        serde_json::from_slice(&body)?
    };

    let username = required(form.username, "username")?;
    let token = required(form.token, "token")?;
    validate_credential(&token)?;

    // The exchange proves the caller holds a working GitHub credential.
    state.tokens.resolve_upstream_token(&token).await?;

    let record = state
        .users
        .register(&username, form.password.as_deref(), &token)
        .await?;
    Ok(json_response(
        StatusCode::CREATED,
        &json!({"username": record.username, "password": record.password}),
    ))
}

async fn handle_list_users(state: &ServerState) -> Result<Response<ResponseBody>> {
    let users = state.users.list().await?;
    Ok(json_response(StatusCode::OK, &json!({"users": users})))
}

async fn handle_delete_user(
    req: Request<Incoming>,
    state: &ServerState,
    user: &str,
) -> Result<Response<ResponseBody>> {
    let username = user.to_lowercase();
    let password = client_secret(req.headers(), false).unwrap_or_default();
    state.users.delete(&username, password).await?;
    Ok(json_response(StatusCode::OK, &json!({"deleted": username})))
}

async fn handle_device_code(state: &ServerState) -> Result<Response<ResponseBody>> {
    let code = device::request_device_code(&state.http, &state.config.upstream.github_base).await?;
    Ok(json_response(StatusCode::OK, &code))
}

async fn handle_poll_device_code(
    req: Request<Incoming>,
    state: &ServerState,
) -> Result<Response<ResponseBody>> {
    #[derive(Deserialize)]
    struct PollRequest {
        device_code: Option<String>,
    }

    let body = read_body_limited(req.into_body()).await?;
    let poll: PollRequest = serde_json::from_slice(&body)?;
    let device_code = required(poll.device_code, "device_code")?;

    let token = device::poll_access_token(
        &state.http,
        &state.config.upstream.github_base,
        &device_code,
    )
    .await?;
    Ok(json_response(StatusCode::OK, &token))
}

// -- Bodies and responses --

async fn read_body_limited(body: Incoming) -> Result<Bytes> {
    let bytes = body
        .collect()
        .await
        .map_err(|e| Error::Http(e.to_string()))?
        .to_bytes();

    if bytes.len() > MAX_REQUEST_SIZE {
        return Err(Error::Validation(format!(
            "Request body too large: {} bytes (max: {} bytes)",
            bytes.len(),
            MAX_REQUEST_SIZE
        )));
    }

    Ok(bytes)
}

async fn read_json(body: Incoming) -> Result<Value> {
    let bytes = read_body_limited(body).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Log a serializable value as pretty-printed JSON if request logging is enabled.
fn log_if_enabled<T: Serialize>(state: &ServerState, request_id: &str, label: &str, value: &T) {
    if state.config.logging.log_requests
        && let Ok(json) = serde_json::to_string_pretty(value)
    {
        info!(request_id = %request_id, "{}:\n{}", label, json);
    }
}

fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn raw_json_response(status: StatusCode, body: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    raw_json_response(status, Bytes::from(body))
}

/// SSE response over a frame stream; dropping the body drops the stream.
fn sse_response<S>(frames: S) -> Response<ResponseBody>
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static,
{
    let body = StreamBody::new(frames.map_ok(Frame::data)).boxed_unsync();
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(
            "Content-Type, Authorization, x-api-key, anthropic-version, X-Copilot-Account-Type",
        ),
    );
}

fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::Auth(
            AuthError::InvalidUsername
            | AuthError::InvalidPassword
            | AuthError::InvalidCredentialFormat,
        ) => StatusCode::BAD_REQUEST,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::Upstream { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Error::DeviceFlow { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        Error::AuthExchange(_)
        | Error::Http(_)
        | Error::StreamParse(_)
        | Error::StreamTransport(_) => StatusCode::BAD_GATEWAY,
        Error::Kv(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn anthropic_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn error_to_response(error: &Error, dialect: Dialect) -> Response<ResponseBody> {
    let status = error_status(error);

    if let Error::DeviceFlow {
        error, description, ..
    } = error
    {
        return json_response(
            status,
            &json!({"error": error, "error_description": description}),
        );
    }

    let message = match error {
        Error::Validation(message) => message.clone(),
        Error::Auth(e) => e.to_string(),
        Error::Upstream { body, .. } => body.clone(),
        other => other.to_string(),
    };
    let message = match error.suggestion() {
        Some(suggestion) => format!("{} {}", message, suggestion),
        None => message,
    };

    let body = match dialect {
        Dialect::Anthropic => json!({
            "type": "error",
            "error": {
                "type": anthropic_error_type(status),
                "message": message
            }
        }),
        Dialect::OpenAi => json!({"error": message}),
    };
    json_response(status, &body)
}

//! HTTP surface: request interception plus the `/__tarmac` control endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
  body::{Body, Bytes},
  extract::{Path, Query, State},
  http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
  response::{
    sse::{Event as SseEvent, KeepAlive, Sse},
    IntoResponse, Response,
  },
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::agent::Agent;
use crate::cache::{CachedResponse, Served};
use crate::error::CacheError;
use crate::event::{DispatchHandle, Event, Outcome};
use crate::lifecycle::InstanceState;
use crate::messaging::{ClientInfo, ClientMessage};
use crate::request::InterceptedRequest;

const SOURCE_HEADER: &str = "x-tarmac-source";
const CATEGORY_HEADER: &str = "x-tarmac-category";
const CAPTURED_HEADER: &str = "x-tarmac-captured-at";

#[derive(Clone)]
pub struct AppState {
  pub agent: Arc<Agent>,
  pub dispatch: DispatchHandle,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/__tarmac/message", post(message))
    .route("/__tarmac/push", post(push))
    .route("/__tarmac/notifications", get(notifications))
    .route("/__tarmac/notifications/{tag}/click", post(click))
    .route("/__tarmac/notifications/{tag}/close", post(close))
    .route("/__tarmac/online", post(online))
    .route("/__tarmac/activate", post(activate))
    .route("/__tarmac/clients/events", get(client_events))
    .route("/__tarmac/status", get(status))
    .fallback(intercept)
    .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, listen: &str) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(listen, "listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

// ============================================================================
// Errors
// ============================================================================

/// JSON error body with a status picked from the failure.
#[derive(Debug)]
pub struct HttpError {
  status: StatusCode,
  kind: &'static str,
  message: String,
}

impl HttpError {
  fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
    Self {
      status,
      kind,
      message: message.into(),
    }
  }

  fn unavailable() -> Self {
    Self::new(
      StatusCode::SERVICE_UNAVAILABLE,
      "unavailable",
      "no active agent instance",
    )
  }

  fn unexpected(outcome: &Outcome) -> Self {
    error!(?outcome, "handler returned an unexpected outcome");
    Self::new(
      StatusCode::INTERNAL_SERVER_ERROR,
      "internal",
      "unexpected handler outcome",
    )
  }
}

impl From<CacheError> for HttpError {
  fn from(e: CacheError) -> Self {
    let status = match &e {
      CacheError::NetworkUnavailable { .. } => StatusCode::BAD_GATEWAY,
      CacheError::OriginError { status, .. } => {
        StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
      }
      CacheError::CacheMiss { .. } => StatusCode::GATEWAY_TIMEOUT,
      CacheError::PartitionCorrupt { .. } | CacheError::Storage(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    };
    Self::new(status, e.kind(), e.to_string())
  }
}

impl From<color_eyre::Report> for HttpError {
  fn from(e: color_eyre::Report) -> Self {
    error!(error = %e, "dispatch failed");
    Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
  }
}

impl IntoResponse for HttpError {
  fn into_response(self) -> Response {
    (
      self.status,
      Json(json!({ "error": self.kind, "message": self.message })),
    )
      .into_response()
  }
}

type HttpResult<T> = std::result::Result<T, HttpError>;

// ============================================================================
// Interception
// ============================================================================

/// Origin URL for an intercepted URI. Absolute-form URIs (proxy style) are used as is.
fn target_url(base: &Url, uri: &Uri) -> HttpResult<Url> {
  let parsed = if uri.scheme().is_some() {
    Url::parse(&uri.to_string())
  } else {
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    base.join(path)
  };
  parsed.map_err(|e| HttpError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))
}

fn to_response(cached: CachedResponse) -> Response {
  let mut response = Response::new(Body::from(cached.body));
  *response.status_mut() = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let headers = response.headers_mut();
  for (name, value) in &cached.headers {
    if name.eq_ignore_ascii_case("content-length") {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  response
}

fn served_response(served: Served) -> Response {
  let mut response = to_response(served.response);
  let headers = response.headers_mut();
  headers.insert(SOURCE_HEADER, HeaderValue::from_static(served.source.as_str()));
  headers.insert(
    CATEGORY_HEADER,
    HeaderValue::from_static(served.category.as_str()),
  );
  if let Some(captured_at) = served.captured_at {
    if let Ok(value) = HeaderValue::from_str(&captured_at.to_rfc3339()) {
      headers.insert(CAPTURED_HEADER, value);
    }
  }
  response
}

#[instrument(skip_all, fields(method = %method, uri = %uri))]
async fn intercept(
  State(state): State<AppState>,
  method: Method,
  uri: Uri,
  mut headers: HeaderMap,
  body: Bytes,
) -> HttpResult<Response> {
  let url = target_url(&state.agent.base, &uri)?;
  headers.remove(axum::http::header::HOST);

  let request = InterceptedRequest {
    method,
    url,
    headers,
    body,
  };

  match state.dispatch.dispatch(Event::Fetch(request)).await? {
    Outcome::Served(result) => {
      let served = result?;
      debug!(source = served.source.as_str(), status = served.response.status, "served");
      Ok(served_response(served))
    }
    Outcome::Forwarded(result) => {
      let mut response = to_response(result?);
      response
        .headers_mut()
        .insert(SOURCE_HEADER, HeaderValue::from_static("passthrough"));
      Ok(response)
    }
    Outcome::Unavailable => Err(HttpError::unavailable()),
    other => Err(HttpError::unexpected(&other)),
  }
}

// ============================================================================
// Control endpoints
// ============================================================================

async fn message(
  State(state): State<AppState>,
  Json(message): Json<ClientMessage>,
) -> HttpResult<Response> {
  match state.dispatch.dispatch(Event::Message(message)).await? {
    Outcome::Acked(ack) => Ok(Json(ack).into_response()),
    other => Err(HttpError::unexpected(&other)),
  }
}

async fn push(State(state): State<AppState>, body: Bytes) -> HttpResult<Response> {
  match state.dispatch.dispatch(Event::Push(body)).await? {
    Outcome::Shown(Some(notification)) => {
      Ok((StatusCode::ACCEPTED, Json(notification)).into_response())
    }
    Outcome::Shown(None) => Err(HttpError::new(
      StatusCode::UNPROCESSABLE_ENTITY,
      "malformed_payload",
      "push payload dropped",
    )),
    other => Err(HttpError::unexpected(&other)),
  }
}

async fn notifications(State(state): State<AppState>) -> Response {
  Json(state.agent.notifications.shown()).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct ClickBody {
  action: Option<String>,
}

async fn click(
  State(state): State<AppState>,
  Path(tag): Path<String>,
  body: Bytes,
) -> HttpResult<Response> {
  let ClickBody { action } = if body.is_empty() {
    ClickBody::default()
  } else {
    serde_json::from_slice(&body)
      .map_err(|e| HttpError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?
  };

  match state
    .dispatch
    .dispatch(Event::NotificationClick { tag, action })
    .await?
  {
    Outcome::Clicked(Some(outcome)) => Ok(Json(outcome).into_response()),
    Outcome::Clicked(None) => Err(not_found()),
    other => Err(HttpError::unexpected(&other)),
  }
}

async fn close(State(state): State<AppState>, Path(tag): Path<String>) -> HttpResult<Response> {
  match state
    .dispatch
    .dispatch(Event::NotificationClose { tag })
    .await?
  {
    Outcome::Closed(true) => Ok(StatusCode::NO_CONTENT.into_response()),
    Outcome::Closed(false) => Err(not_found()),
    other => Err(HttpError::unexpected(&other)),
  }
}

fn not_found() -> HttpError {
  HttpError::new(StatusCode::NOT_FOUND, "not_found", "no such notification")
}

async fn online(State(state): State<AppState>) -> HttpResult<Response> {
  match state.dispatch.dispatch(Event::Online).await? {
    Outcome::Synced(result) => Ok(Json(json!({ "purged": result? })).into_response()),
    other => Err(HttpError::unexpected(&other)),
  }
}

/// Activate the waiting version. 409 when nothing is waiting.
async fn activate(State(state): State<AppState>) -> HttpResult<Response> {
  match state.dispatch.dispatch(Event::Activate).await? {
    Outcome::Activated(Some(report)) => Ok(Json(report).into_response()),
    Outcome::Activated(None) => Err(HttpError::new(
      StatusCode::CONFLICT,
      "nothing_waiting",
      "no installed version is waiting",
    )),
    other => Err(HttpError::unexpected(&other)),
  }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
  client_id: Option<Uuid>,
  url: Option<String>,
}

/// Server-sent events carrying every message addressed to one window.
async fn client_events(
  State(state): State<AppState>,
  Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
  let url = query.url.unwrap_or_else(|| "/".to_string());
  let subscription = state.agent.clients.attach(query.client_id, &url);
  let id = subscription.id();

  let hello = stream::once(async move {
    Ok(SseEvent::default().event("attached").data(id.to_string()))
  });
  // the window detaches when the client disconnects and the stream is dropped
  let messages = stream::unfold(subscription, |mut subscription| async move {
    let message = subscription.recv().await?;
    let event = SseEvent::default()
      .event(message.kind())
      .data(serde_json::to_string(&message).unwrap_or_default());
    Some((Ok(event), subscription))
  });

  Sse::new(hello.chain(messages)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
struct PartitionStatus {
  name: String,
  purpose: &'static str,
  entries: usize,
}

#[derive(Debug, Serialize)]
struct StatusReport {
  version: Option<String>,
  state: Option<InstanceState>,
  waiting: Option<String>,
  partitions: Vec<PartitionStatus>,
  clients: Vec<ClientInfo>,
}

async fn status(State(state): State<AppState>) -> HttpResult<Json<StatusReport>> {
  let agent = &state.agent;
  let active = agent.lifecycle.active();
  let partitions = agent
    .manager
    .partitions()?
    .into_iter()
    .map(|p| PartitionStatus {
      entries: agent.manager.entry_count(&p.name).unwrap_or_default(),
      purpose: p.purpose.as_str(),
      name: p.name,
    })
    .collect();

  Ok(Json(StatusReport {
    version: active.as_ref().map(|i| i.version().to_string()),
    state: active.as_ref().map(|i| i.state()),
    waiting: agent.lifecycle.waiting().map(|i| i.version().to_string()),
    partitions,
    clients: agent.clients.list(),
  }))
}

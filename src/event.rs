use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::{CachedResponse, Served};
use crate::error::CacheResult;
use crate::lifecycle::{ActivationReport, InstallReport};
use crate::messaging::{Ack, ClientMessage};
use crate::notification::{ClickOutcome, NotificationEvent};
use crate::request::InterceptedRequest;

/// Agent events
#[derive(Debug)]
pub enum Event {
  /// Install (and possibly activate) the configured version
  Install,
  /// Activate the waiting version out of band
  Activate,
  /// Intercepted client request
  Fetch(InterceptedRequest),
  /// Control message from a window
  Message(ClientMessage),
  /// Raw push body
  Push(Bytes),
  NotificationClick { tag: String, action: Option<String> },
  NotificationClose { tag: String },
  /// Connectivity to the origin came back
  Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Message,
  Push,
  NotificationClick,
  NotificationClose,
  Online,
}

impl Event {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Install => EventKind::Install,
      Self::Activate => EventKind::Activate,
      Self::Fetch(_) => EventKind::Fetch,
      Self::Message(_) => EventKind::Message,
      Self::Push(_) => EventKind::Push,
      Self::NotificationClick { .. } => EventKind::NotificationClick,
      Self::NotificationClose { .. } => EventKind::NotificationClose,
      Self::Online => EventKind::Online,
    }
  }
}

/// What handling an event produced
#[derive(Debug)]
pub enum Outcome {
  Installed(InstallReport),
  Activated(Option<ActivationReport>),
  Served(CacheResult<Served>),
  /// Non-GET request relayed to the origin
  Forwarded(CacheResult<CachedResponse>),
  Acked(Ack),
  Shown(Option<NotificationEvent>),
  Clicked(Option<ClickOutcome>),
  Closed(bool),
  Synced(CacheResult<Vec<String>>),
  /// No instance is active yet
  Unavailable,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// How the loop runs a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// Awaited inside the loop; later events wait for it
  Inline,
  /// Run on its own task
  Spawn,
}

struct Route {
  handler: Handler,
  mode: Mode,
}

struct Envelope {
  event: Event,
  reply: oneshot::Sender<Outcome>,
}

/// Routing table plus the single loop that drains it
pub struct Dispatcher {
  routes: HashMap<EventKind, Route>,
  rx: mpsc::Receiver<Envelope>,
}

/// Cheap sender side of the dispatcher
#[derive(Clone)]
pub struct DispatchHandle {
  tx: mpsc::Sender<Envelope>,
}

impl Dispatcher {
  pub fn new(buffer: usize) -> (Self, DispatchHandle) {
    let (tx, rx) = mpsc::channel(buffer);
    (
      Self {
        routes: HashMap::new(),
        rx,
      },
      DispatchHandle { tx },
    )
  }

  /// Register the handler for one event kind, replacing any previous one
  pub fn route<F, Fut>(&mut self, kind: EventKind, mode: Mode, handler: F) -> &mut Self
  where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
  {
    let handler: Handler = Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });
    self.routes.insert(kind, Route { handler, mode });
    self
  }

  /// Run until every handle is dropped
  pub async fn run(mut self) {
    while let Some(Envelope { event, reply }) = self.rx.recv().await {
      let kind = event.kind();
      let Some(route) = self.routes.get(&kind) else {
        warn!(?kind, "no route for event");
        let _ = reply.send(Outcome::Unavailable);
        continue;
      };

      let future = (route.handler)(event);
      match route.mode {
        Mode::Inline => {
          let outcome = future.await;
          if reply.send(outcome).is_err() {
            debug!(?kind, "caller went away before reply");
          }
        }
        Mode::Spawn => {
          tokio::spawn(async move {
            let _ = reply.send(future.await);
          });
        }
      }
    }
    debug!("dispatcher stopped");
  }
}

impl DispatchHandle {
  /// Send an event and wait for its outcome
  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, reply })
      .await
      .map_err(|_| eyre!("Dispatcher is not running"))?;
    rx.await
      .map_err(|_| eyre!("Event handler dropped without replying"))
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_unrouted_event_is_unavailable() {
    let (dispatcher, handle) = Dispatcher::new(8);
    tokio::spawn(dispatcher.run());
    let outcome = handle.dispatch(Event::Online).await.unwrap();
    assert!(matches!(outcome, Outcome::Unavailable));
  }

  #[tokio::test]
  async fn test_inline_handlers_are_a_barrier() {
    let (mut dispatcher, handle) = Dispatcher::new(8);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let o = order.clone();
    dispatcher.route(EventKind::Install, Mode::Inline, move |_| {
      let o = o.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        o.lock().unwrap().push("install");
        Outcome::Unavailable
      }
    });
    let o = order.clone();
    dispatcher.route(EventKind::Online, Mode::Spawn, move |_| {
      let o = o.clone();
      async move {
        o.lock().unwrap().push("online");
        Outcome::Synced(Ok(vec![]))
      }
    });
    tokio::spawn(dispatcher.run());

    let first = handle.clone();
    let install = tokio::spawn(async move { first.dispatch(Event::Install).await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.dispatch(Event::Online).await.unwrap();
    install.await.unwrap().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["install", "online"]);
  }

  #[tokio::test]
  async fn test_spawned_handlers_run_concurrently() {
    let (mut dispatcher, handle) = Dispatcher::new(8);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    dispatcher.route(EventKind::Online, Mode::Spawn, move |_| {
      let (r, p) = (r.clone(), p.clone());
      async move {
        let now = r.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        r.fetch_sub(1, Ordering::SeqCst);
        Outcome::Synced(Ok(vec![]))
      }
    });
    tokio::spawn(dispatcher.run());

    let (a, b) = tokio::join!(
      handle.dispatch(Event::Online),
      handle.dispatch(Event::Online)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 2);
  }
}

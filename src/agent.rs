//! Wires the components together and registers them on the event dispatcher.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use url::Url;

use crate::cache::{CacheManager, CacheStorage, Clock, FreshnessTracker, TtlPolicy};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::event::{DispatchHandle, Dispatcher, Event, EventKind, Mode, Outcome};
use crate::lifecycle::LifecycleController;
use crate::messaging::{ClientRegistry, MessageChannel};
use crate::notification::NotificationDispatcher;
use crate::origin::Origin;
use crate::strategy::StrategyEngine;
use crate::sync::SyncTrigger;

const DISPATCH_BUFFER: usize = 256;

/// Everything the agent owns, built once from configuration.
pub struct Agent {
  pub config: Config,
  pub base: Url,
  pub manager: CacheManager,
  pub origin: Arc<dyn Origin>,
  pub clients: ClientRegistry,
  pub lifecycle: Arc<LifecycleController>,
  pub notifications: NotificationDispatcher,
  pub channel: MessageChannel,
  pub sync: SyncTrigger,
  classifier: Arc<Classifier>,
  freshness: FreshnessTracker,
  offline_page: Option<Url>,
}

impl Agent {
  pub fn new(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    origin: Arc<dyn Origin>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let base = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin URL '{}': {}", config.origin, e))?;
    let resolve = |path: &str| {
      base
        .join(path)
        .map_err(|e| eyre!("Invalid resource '{}': {}", path, e))
    };

    let precache = config
      .precache
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = config.offline_page.as_deref().map(resolve).transpose()?;

    let classifier = Arc::new(Classifier::new(&config.classifier)?);
    let freshness = FreshnessTracker::new(Arc::clone(&clock), TtlPolicy::from(&config.ttl));
    let manager = CacheManager::new(storage, config.version.clone());

    let app_url = config
      .app_url
      .clone()
      .unwrap_or_else(|| format!("http://{}/", config.listen));

    let clients = ClientRegistry::new();
    let lifecycle = Arc::new(LifecycleController::new(
      clients.clone(),
      precache,
      config.skip_waiting,
    ));
    let notifications = NotificationDispatcher::new(
      clients.clone(),
      config.notifications.clone(),
      app_url,
      clock,
    );
    let channel = MessageChannel::new(Arc::clone(&lifecycle), manager.clone());
    let sync = SyncTrigger::new(manager.clone());

    Ok(Self {
      config,
      base,
      manager,
      origin,
      clients,
      lifecycle,
      notifications,
      channel,
      sync,
      classifier,
      freshness,
      offline_page,
    })
  }

  /// A strategy engine for the configured version.
  pub fn engine(&self) -> StrategyEngine {
    StrategyEngine::new(
      self.manager.clone(),
      self.freshness.clone(),
      Arc::clone(&self.classifier),
      Arc::clone(&self.origin),
      self.config.fetch_timeout(),
      self.offline_page.clone(),
    )
  }

  /// Register every handler. Lifecycle and control messages run inline so
  /// nothing is dispatched mid-cutover; everything else gets its own task.
  pub fn register(self: &Arc<Self>, dispatcher: &mut Dispatcher) {
    let agent = Arc::clone(self);
    dispatcher.route(EventKind::Install, Mode::Inline, move |_| {
      let agent = Arc::clone(&agent);
      async move { Outcome::Installed(agent.lifecycle.install(agent.engine()).await) }
    });

    let lifecycle = Arc::clone(&self.lifecycle);
    dispatcher.route(EventKind::Activate, Mode::Inline, move |_| {
      let lifecycle = Arc::clone(&lifecycle);
      async move { Outcome::Activated(lifecycle.skip_waiting().await) }
    });

    let channel = self.channel.clone();
    dispatcher.route(EventKind::Message, Mode::Inline, move |event| {
      let channel = channel.clone();
      async move {
        match event {
          Event::Message(message) => Outcome::Acked(channel.receive(message).await),
          _ => Outcome::Unavailable,
        }
      }
    });

    let lifecycle = Arc::clone(&self.lifecycle);
    dispatcher.route(EventKind::Fetch, Mode::Spawn, move |event| {
      // snapshot now so a later cutover does not change this request's view
      let instance = lifecycle.active();
      async move {
        let (Event::Fetch(request), Some(instance)) = (event, instance) else {
          return Outcome::Unavailable;
        };
        let engine = instance.engine();
        if request.is_cacheable_method() {
          Outcome::Served(engine.handle(&request).await)
        } else {
          Outcome::Forwarded(engine.pass_through(&request).await)
        }
      }
    });

    let notifications = self.notifications.clone();
    dispatcher.route(EventKind::Push, Mode::Spawn, move |event| {
      let notifications = notifications.clone();
      async move {
        match event {
          Event::Push(raw) => Outcome::Shown(notifications.push(&raw)),
          _ => Outcome::Unavailable,
        }
      }
    });

    let notifications = self.notifications.clone();
    dispatcher.route(EventKind::NotificationClick, Mode::Spawn, move |event| {
      let notifications = notifications.clone();
      async move {
        match event {
          Event::NotificationClick { tag, action } => {
            Outcome::Clicked(notifications.click(&tag, action.as_deref()))
          }
          _ => Outcome::Unavailable,
        }
      }
    });

    let notifications = self.notifications.clone();
    dispatcher.route(EventKind::NotificationClose, Mode::Spawn, move |event| {
      let notifications = notifications.clone();
      async move {
        match event {
          Event::NotificationClose { tag } => Outcome::Closed(notifications.close(&tag)),
          _ => Outcome::Unavailable,
        }
      }
    });

    let sync = self.sync.clone();
    dispatcher.route(EventKind::Online, Mode::Spawn, move |_| {
      let sync = sync.clone();
      async move { Outcome::Synced(sync.connectivity_restored()) }
    });
  }

  /// Build the dispatcher, register handlers and start the loop.
  pub fn start(self: &Arc<Self>) -> DispatchHandle {
    let (mut dispatcher, handle) = Dispatcher::new(DISPATCH_BUFFER);
    self.register(&mut dispatcher);
    tokio::spawn(dispatcher.run());
    info!(version = %self.config.version, origin = %self.base, "agent started");
    handle
  }
}

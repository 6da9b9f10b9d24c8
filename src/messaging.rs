//! Control messages between the agent and foreground windows.
//!
//! Inbound, windows send `SKIP_WAITING` and `CLEAR_CACHE`. Outbound, the agent
//! pushes navigation and notification relays into a per-window queue that an
//! attached event stream drains. Messages for a window that has not attached
//! yet are buffered until it does. A window is forgotten once its stream ends
//! with nothing left to deliver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{mutex_lock, CacheManager};
use crate::lifecycle::LifecycleController;

const SOURCE: &str = "messaging";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  SkipWaiting,
  ClearCache,
  NotificationAction {
    action: String,
    #[serde(rename = "notificationType")]
    notification_type: String,
    #[serde(default)]
    data: Value,
  },
  Navigate {
    url: String,
  },
  CheckTraffic {
    #[serde(default)]
    data: Value,
  },
  NavigateToPickup {
    #[serde(default)]
    data: Value,
  },
  FindAlternativeRoute {
    #[serde(default)]
    data: Value,
  },
}

impl ClientMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::SkipWaiting => "SKIP_WAITING",
      Self::ClearCache => "CLEAR_CACHE",
      Self::NotificationAction { .. } => "NOTIFICATION_ACTION",
      Self::Navigate { .. } => "NAVIGATE",
      Self::CheckTraffic { .. } => "CHECK_TRAFFIC",
      Self::NavigateToPickup { .. } => "NAVIGATE_TO_PICKUP",
      Self::FindAlternativeRoute { .. } => "FIND_ALTERNATIVE_ROUTE",
    }
  }
}

/// Acknowledgement returned for every inbound control message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
  pub ok: bool,
  #[serde(rename = "type")]
  pub kind: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

impl Ack {
  fn ok(kind: &'static str, detail: Option<String>) -> Self {
    Self {
      ok: true,
      kind,
      detail,
    }
  }

  fn failed(kind: &'static str, detail: String) -> Self {
    Self {
      ok: false,
      kind,
      detail: Some(detail),
    }
  }
}

/// Applies inbound control messages.
#[derive(Clone)]
pub struct MessageChannel {
  lifecycle: Arc<LifecycleController>,
  manager: CacheManager,
}

impl MessageChannel {
  pub fn new(lifecycle: Arc<LifecycleController>, manager: CacheManager) -> Self {
    Self { lifecycle, manager }
  }

  pub async fn receive(&self, message: ClientMessage) -> Ack {
    let kind = message.kind();
    match message {
      ClientMessage::SkipWaiting => match self.lifecycle.skip_waiting().await {
        Some(report) => Ack::ok(kind, Some(format!("activated {}", report.version))),
        None => Ack::ok(kind, None),
      },
      ClientMessage::ClearCache => match self.manager.purge_all() {
        Ok(removed) => {
          info!(removed, "cleared all cache partitions");
          Ack::ok(kind, Some(format!("removed {removed} partitions")))
        }
        Err(e) => {
          warn!(error = %e, "failed to clear cache");
          Ack::failed(kind, e.to_string())
        }
      },
      other => {
        debug!(kind = other.kind(), "ignoring client-directed message sent inbound");
        Ack::failed(kind, "not a control message".to_string())
      }
    }
  }
}

// ============================================================================
// Client registry
// ============================================================================

/// A foreground window known to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
  pub id: Uuid,
  pub url: String,
  /// Version of the instance controlling this window, once claimed
  pub controller: Option<String>,
  pub attached: bool,
  pub pending: usize,
}

struct Slot {
  url: String,
  controller: Option<String>,
  sender: Option<mpsc::UnboundedSender<ClientMessage>>,
  pending: Vec<ClientMessage>,
}

impl Slot {
  fn new(url: &str) -> Self {
    Self {
      url: url.to_string(),
      controller: None,
      sender: None,
      pending: Vec::new(),
    }
  }

  fn is_live(&self) -> bool {
    self.sender.as_ref().is_some_and(|tx| !tx.is_closed())
  }

  /// Attached once, stream gone, nothing to deliver.
  fn is_stale(&self) -> bool {
    self.sender.as_ref().is_some_and(|tx| tx.is_closed()) && self.pending.is_empty()
  }
}

/// The receiving end of one window's message stream. Dropping it detaches
/// the window.
pub struct Subscription {
  id: Uuid,
  rx: mpsc::UnboundedReceiver<ClientMessage>,
  registry: ClientRegistry,
}

impl Subscription {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub async fn recv(&mut self) -> Option<ClientMessage> {
    self.rx.recv().await
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.rx.close();
    let mut undelivered = Vec::new();
    while let Ok(message) = self.rx.try_recv() {
      undelivered.push(message);
    }
    self.registry.detach(self.id, undelivered);
  }
}

#[derive(Clone, Default)]
pub struct ClientRegistry {
  slots: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Track a window that has not attached a stream yet.
  pub fn open_window(&self, url: &str) -> Uuid {
    let id = Uuid::new_v4();
    mutex_lock(&self.slots, SOURCE, "open_window").insert(id, Slot::new(url));
    info!(client = %id, url, "opened window");
    id
  }

  /// Attach an event stream to a window and flush its buffer.
  ///
  /// Without a known id, a window opened on this window's behalf (detached,
  /// holding messages, its URL a prefix of `url`) is adopted before a new
  /// one is created.
  pub fn attach(&self, id: Option<Uuid>, url: &str) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut slots = mutex_lock(&self.slots, SOURCE, "attach");
    slots.retain(|_, slot| !slot.is_stale());

    let id = id
      .filter(|id| slots.contains_key(id))
      .or_else(|| {
        slots
          .iter()
          .filter(|(_, slot)| {
            !slot.is_live() && !slot.pending.is_empty() && url.starts_with(&slot.url)
          })
          .max_by_key(|(_, slot)| slot.url.len())
          .map(|(id, _)| *id)
      })
      .unwrap_or_else(Uuid::new_v4);
    let slot = slots.entry(id).or_insert_with(|| Slot::new(url));

    for message in slot.pending.drain(..) {
      // receiver is still in hand, so this cannot fail
      let _ = tx.send(message);
    }
    slot.sender = Some(tx);
    debug!(client = %id, "client attached");
    Subscription {
      id,
      rx,
      registry: self.clone(),
    }
  }

  /// Called when a window's stream ends. Messages it never read go back to
  /// the front of the buffer and keep the window around for its next attach.
  fn detach(&self, id: Uuid, undelivered: Vec<ClientMessage>) {
    let mut slots = mutex_lock(&self.slots, SOURCE, "detach");
    let Some(slot) = slots.get_mut(&id) else {
      return;
    };
    // a newer stream took over and gets whatever the old one left unread
    if let Some(tx) = slot.sender.as_ref().filter(|tx| !tx.is_closed()) {
      for message in undelivered {
        let _ = tx.send(message);
      }
      return;
    }
    slot.pending.splice(0..0, undelivered);
    if slot.pending.is_empty() {
      slots.remove(&id);
      debug!(client = %id, "client detached");
    } else {
      slot.sender = None;
      debug!(client = %id, pending = slot.pending.len(), "client detached with pending messages");
    }
  }

  /// Deliver a message, buffering it while the window has no live stream.
  pub fn send(&self, id: Uuid, message: ClientMessage) -> bool {
    let mut slots = mutex_lock(&self.slots, SOURCE, "send");
    let Some(slot) = slots.get_mut(&id) else {
      warn!(client = %id, kind = message.kind(), "message for unknown client dropped");
      return false;
    };

    let message = match slot.sender.as_ref() {
      Some(sender) => match sender.send(message) {
        Ok(()) => return true,
        Err(mpsc::error::SendError(message)) => {
          slot.sender = None;
          message
        }
      },
      None => message,
    };

    debug!(client = %id, kind = message.kind(), "buffering message for detached client");
    slot.pending.push(message);
    true
  }

  /// An existing window whose URL starts with `prefix`, else a newly opened one.
  pub fn find_or_open(&self, prefix: &str) -> Uuid {
    let existing = {
      let slots = mutex_lock(&self.slots, SOURCE, "find_or_open");
      let mut matches: Vec<_> = slots
        .iter()
        .filter(|(_, slot)| slot.url.starts_with(prefix))
        .map(|(id, slot)| (slot.is_live(), *id))
        .collect();
      // attached windows first
      matches.sort_by(|a, b| b.0.cmp(&a.0));
      matches.first().map(|(_, id)| *id)
    };

    existing.unwrap_or_else(|| self.open_window(prefix))
  }

  /// Take control of every known window for `version`. Returns how many were claimed.
  pub fn claim(&self, version: &str) -> usize {
    let mut slots = mutex_lock(&self.slots, SOURCE, "claim");
    for slot in slots.values_mut() {
      slot.controller = Some(version.to_string());
    }
    slots.len()
  }

  pub fn list(&self) -> Vec<ClientInfo> {
    let mut clients: Vec<_> = mutex_lock(&self.slots, SOURCE, "list")
      .iter()
      .map(|(id, slot)| ClientInfo {
        id: *id,
        url: slot.url.clone(),
        controller: slot.controller.clone(),
        attached: slot.sender.is_some(),
        pending: slot.pending.len(),
      })
      .collect();
    clients.sort_by(|a, b| a.url.cmp(&b.url));
    clients
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    let msg: ClientMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(msg, ClientMessage::SkipWaiting);

    let relay = ClientMessage::NotificationAction {
      action: "view".into(),
      notification_type: "traffic-alert".into(),
      data: json!({"runId": 4}),
    };
    assert_eq!(
      serde_json::to_value(&relay).unwrap(),
      json!({
        "type": "NOTIFICATION_ACTION",
        "action": "view",
        "notificationType": "traffic-alert",
        "data": {"runId": 4}
      })
    );

    let nav = serde_json::to_value(ClientMessage::Navigate {
      url: "/runs".into(),
    })
    .unwrap();
    assert_eq!(nav, json!({"type": "NAVIGATE", "url": "/runs"}));
  }

  #[test]
  fn test_unknown_type_is_rejected() {
    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"REBOOT"}"#).is_err());
  }

  #[tokio::test]
  async fn test_messages_buffer_until_attach() {
    let registry = ClientRegistry::new();
    let id = registry.open_window("http://app/");
    assert!(registry.send(id, ClientMessage::Navigate { url: "/runs".into() }));
    assert_eq!(registry.list()[0].pending, 1);

    let mut window = registry.attach(Some(id), "http://app/");
    assert_eq!(window.id(), id);
    assert_eq!(
      window.recv().await,
      Some(ClientMessage::Navigate { url: "/runs".into() })
    );

    registry.send(id, ClientMessage::ClearCache);
    assert_eq!(window.recv().await, Some(ClientMessage::ClearCache));
  }

  #[test]
  fn test_closed_stream_is_forgotten() {
    let registry = ClientRegistry::new();
    let window = registry.attach(None, "http://app/flights");
    let id = window.id();
    drop(window);

    assert!(registry.list().is_empty());
    assert!(!registry.send(id, ClientMessage::SkipWaiting));
  }

  #[test]
  fn test_reconnects_do_not_accumulate_windows() {
    let registry = ClientRegistry::new();
    for _ in 0..1000 {
      drop(registry.attach(None, "http://app/"));
    }
    assert!(registry.list().is_empty());

    let _live = registry.attach(None, "http://app/");
    assert_eq!(registry.list().len(), 1);
  }

  #[test]
  fn test_detach_keeps_undelivered_messages() {
    let registry = ClientRegistry::new();
    let id = registry.open_window("http://app/");
    registry.send(id, ClientMessage::ClearCache);

    // a stream that ends before draining anything
    let window = registry.attach(Some(id), "http://app/");
    registry.send(id, ClientMessage::SkipWaiting);
    drop(window);

    let info = &registry.list()[0];
    assert!(!info.attached);
    assert_eq!(info.pending, 2);

    let mut again = registry.attach(Some(id), "http://app/");
    assert_eq!(again.rx.try_recv().ok(), Some(ClientMessage::ClearCache));
    assert_eq!(again.rx.try_recv().ok(), Some(ClientMessage::SkipWaiting));
  }

  #[test]
  fn test_attach_adopts_orphaned_window() {
    let registry = ClientRegistry::new();
    let opened = registry.open_window("http://app/");
    registry.send(opened, ClientMessage::Navigate { url: "/runs".into() });
    let other = registry.open_window("http://elsewhere/");
    registry.send(other, ClientMessage::ClearCache);

    let window = registry.attach(None, "http://app/runs");
    assert_eq!(window.id(), opened);
    let windows = registry.list();
    assert_eq!(windows.len(), 2);
    assert!(windows.iter().all(|w| w.id == other || w.pending == 0));
  }

  #[test]
  fn test_find_or_open_prefers_existing_window() {
    let registry = ClientRegistry::new();
    let window = registry.attach(None, "http://app/flights");
    let id = window.id();
    assert_eq!(registry.find_or_open("http://app/"), id);

    let other = registry.find_or_open("http://elsewhere/");
    assert_ne!(other, id);
    assert_eq!(registry.list().len(), 2);
  }

  #[test]
  fn test_claim_sets_controller() {
    let registry = ClientRegistry::new();
    registry.open_window("http://app/");
    registry.open_window("http://app/runs");
    assert_eq!(registry.claim("v2"), 2);
    assert!(registry
      .list()
      .iter()
      .all(|c| c.controller.as_deref() == Some("v2")));
  }

  #[test]
  fn test_unknown_client_send_is_dropped() {
    assert!(!ClientRegistry::new().send(Uuid::new_v4(), ClientMessage::ClearCache));
  }
}

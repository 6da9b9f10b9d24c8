//! Push payloads in, user-facing notifications out, clicks relayed back to a window.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{mutex_lock, Clock};
use crate::config::NotificationConfig;
use crate::messaging::{ClientMessage, ClientRegistry};

const SOURCE: &str = "notification";

/// Inbound push body: `{type, title, body, id, data, icon?, badge?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
  #[serde(rename = "type")]
  pub kind: String,
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub id: Value,
  #[serde(default)]
  pub data: Value,
  pub icon: Option<String>,
  pub badge: Option<String>,
}

impl PushPayload {
  pub fn parse(raw: &[u8]) -> Result<Self, String> {
    let payload: Self = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
    if payload.kind.trim().is_empty() {
      return Err("empty notification type".to_string());
    }
    Ok(payload)
  }

  fn id_string(&self) -> String {
    match &self.id {
      Value::String(s) => s.clone(),
      Value::Null => "0".to_string(),
      other => other.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vibration {
  Urgent,
  Alert,
  Reminder,
  Gentle,
  Default,
}

impl Vibration {
  /// On/off durations in milliseconds.
  pub fn pattern(&self) -> &'static [u32] {
    match self {
      Self::Urgent => &[200, 100, 200, 100, 200],
      Self::Alert => &[300, 100, 300, 100, 300],
      Self::Reminder => &[100, 50, 100],
      Self::Gentle => &[100],
      Self::Default => &[200, 100, 200],
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  View,
  Dismiss,
  Alternative,
  Navigate,
  Traffic,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::View => "view",
      Self::Dismiss => "dismiss",
      Self::Alternative => "alternative",
      Self::Navigate => "navigate",
      Self::Traffic => "traffic",
    }
  }

  pub fn title(&self) -> &'static str {
    match self {
      Self::View => "View",
      Self::Dismiss => "Dismiss",
      Self::Alternative => "Alternative route",
      Self::Navigate => "Navigate",
      Self::Traffic => "Check traffic",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    [
      Self::View,
      Self::Dismiss,
      Self::Alternative,
      Self::Navigate,
      Self::Traffic,
    ]
    .into_iter()
    .find(|a| a.as_str() == s)
  }
}

/// Per-type presentation: vibration, whether it stays until handled, buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
  pub vibration: Vibration,
  pub require_interaction: bool,
  pub actions: &'static [Action],
}

pub fn presentation(kind: &str) -> Presentation {
  use Action::*;

  match kind {
    "flight-status-change" => Presentation {
      vibration: Vibration::Urgent,
      require_interaction: true,
      actions: &[View, Dismiss],
    },
    "traffic-alert" => Presentation {
      vibration: Vibration::Alert,
      require_interaction: true,
      actions: &[View, Alternative, Dismiss],
    },
    "run-reminder" => Presentation {
      vibration: Vibration::Reminder,
      require_interaction: true,
      actions: &[View, Navigate, Dismiss],
    },
    "departure-reminder" | "arrival-reminder" => Presentation {
      vibration: Vibration::Gentle,
      require_interaction: false,
      actions: &[View, Traffic, Dismiss],
    },
    _ => Presentation {
      vibration: Vibration::Default,
      require_interaction: false,
      actions: &[View, Dismiss],
    },
  }
}

/// Route a `view` click navigates to.
pub fn route_for(kind: &str) -> &'static str {
  match kind {
    "flight-status-change" | "departure-reminder" | "arrival-reminder" => "/flights",
    "traffic-alert" | "run-reminder" => "/runs",
    _ => "/",
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionButton {
  pub action: Action,
  pub title: &'static str,
}

/// A notification as shown to the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
  pub tag: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: Value,
  pub actions: Vec<ActionButton>,
  pub vibrate: &'static [u32],
  pub require_interaction: bool,
  pub shown_at: DateTime<Utc>,
}

impl NotificationEvent {
  pub fn build(
    payload: PushPayload,
    defaults: &NotificationConfig,
    shown_at: DateTime<Utc>,
  ) -> Self {
    let table = presentation(&payload.kind);
    Self {
      tag: format!("{}-{}", payload.kind, payload.id_string()),
      icon: payload.icon.unwrap_or_else(|| defaults.icon.clone()),
      badge: payload.badge.unwrap_or_else(|| defaults.badge.clone()),
      kind: payload.kind,
      title: payload.title,
      body: payload.body,
      data: payload.data,
      actions: table
        .actions
        .iter()
        .map(|&action| ActionButton {
          action,
          title: action.title(),
        })
        .collect(),
      vibrate: table.vibration.pattern(),
      require_interaction: table.require_interaction,
      shown_at,
    }
  }
}

/// What a click produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickOutcome {
  pub client: uuid::Uuid,
  pub sent: Vec<ClientMessage>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
  shown: Arc<Mutex<BTreeMap<String, NotificationEvent>>>,
  clients: ClientRegistry,
  defaults: NotificationConfig,
  app_url: String,
  clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
  pub fn new(
    clients: ClientRegistry,
    defaults: NotificationConfig,
    app_url: String,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      shown: Arc::default(),
      clients,
      defaults,
      app_url,
      clock,
    }
  }

  /// Show a notification for a raw push body. Malformed bodies are dropped.
  pub fn push(&self, raw: &[u8]) -> Option<NotificationEvent> {
    let payload = match PushPayload::parse(raw) {
      Ok(payload) => payload,
      Err(reason) => {
        warn!(%reason, bytes = raw.len(), "dropping malformed push payload");
        return None;
      }
    };

    let event = NotificationEvent::build(payload, &self.defaults, self.clock.now());
    info!(tag = %event.tag, kind = %event.kind, "showing notification");
    // same tag replaces the previous notification
    mutex_lock(&self.shown, SOURCE, "push").insert(event.tag.clone(), event.clone());
    Some(event)
  }

  pub fn shown(&self) -> Vec<NotificationEvent> {
    mutex_lock(&self.shown, SOURCE, "shown")
      .values()
      .cloned()
      .collect()
  }

  /// Close the notification, then relay the interaction to a window.
  ///
  /// Returns `None` when no notification carries `tag`.
  pub fn click(&self, tag: &str, action: Option<&str>) -> Option<ClickOutcome> {
    let event = mutex_lock(&self.shown, SOURCE, "click").remove(tag)?;
    let action = action.filter(|a| !a.is_empty()).unwrap_or("view");
    debug!(tag, action, "notification clicked");

    let client = self.clients.find_or_open(&self.app_url);
    let mut sent = vec![ClientMessage::NotificationAction {
      action: action.to_string(),
      notification_type: event.kind.clone(),
      data: event.data.clone(),
    }];

    let data = event.data;
    match Action::parse(action) {
      Some(Action::View) => sent.push(ClientMessage::Navigate {
        url: route_for(&event.kind).to_string(),
      }),
      Some(Action::Traffic) => sent.push(ClientMessage::CheckTraffic { data }),
      Some(Action::Navigate) => sent.push(ClientMessage::NavigateToPickup { data }),
      Some(Action::Alternative) => sent.push(ClientMessage::FindAlternativeRoute { data }),
      Some(Action::Dismiss) => {}
      None => warn!(tag, action, "unknown notification action, relaying only"),
    }

    for message in &sent {
      self.clients.send(client, message.clone());
    }

    Some(ClickOutcome { client, sent })
  }

  /// The user dismissed the notification without clicking it.
  pub fn close(&self, tag: &str) -> bool {
    let closed = mutex_lock(&self.shown, SOURCE, "close").remove(tag);
    match &closed {
      Some(event) => info!(tag, kind = %event.kind, "notification closed"),
      None => debug!(tag, "close for unknown notification"),
    }
    closed.is_some()
  }
}

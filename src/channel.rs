//! Wire protocol and session bookkeeping between host and sandbox.
//!
//! Messages are JSON objects tagged by `type`. The transport (a WebSocket in
//! [`crate::server`], or anything else that can move strings) calls
//! [`MessageChannel::attach`] on connect and receives host messages from the
//! returned receiver. Every attach starts a new session: requests issued in
//! an earlier session are rejected with [`SandboxError::SessionReset`] and
//! messages arriving from a stale session are ignored by the engine.

use crate::error::{SandboxError, SandboxResult};
use crate::telemetry::performance::LiveMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Console method that produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// A fetch/XHR observed inside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Snapshot of one DOM element answered to `inspect-element`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementInfo {
    pub tag_name: String,
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub text_content: String,
    pub rect: ElementRect,
    pub styles: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub child_count: usize,
}

/// Simulated network conditions applied to fetches in the sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConditions {
    pub slow: bool,
    /// Added latency in milliseconds when `slow` is set
    pub delay: u64,
}

/// sandbox → host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxMessage {
    Ready,
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Console {
        level: ConsoleLevel,
        message: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    PerformanceMetrics {
        metrics: LiveMetrics,
    },
    NetworkRequest(NetworkRequest),
    ElementInfo {
        selector: String,
        #[serde(default)]
        info: Option<ElementInfo>,
    },
    DependencyFailed {
        name: String,
        #[serde(default)]
        required: bool,
    },
    RegenerateRequest,
}

impl SandboxMessage {
    pub fn parse(raw: &str) -> SandboxResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SandboxError::Protocol(format!("Malformed sandbox message: {}", e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SandboxMessage::Ready => "ready",
            SandboxMessage::Error { .. } => "error",
            SandboxMessage::Console { .. } => "console",
            SandboxMessage::PerformanceMetrics { .. } => "performance-metrics",
            SandboxMessage::NetworkRequest(_) => "network-request",
            SandboxMessage::ElementInfo { .. } => "element-info",
            SandboxMessage::DependencyFailed { .. } => "dependency-failed",
            SandboxMessage::RegenerateRequest => "regenerate-request",
        }
    }
}

/// host → sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    ComponentUpdate {
        #[serde(rename = "componentId")]
        component_id: String,
        code: String,
    },
    FullReload,
    NetworkSimulation {
        conditions: NetworkConditions,
    },
    InspectElement {
        selector: String,
    },
}

impl HostMessage {
    pub fn to_json(&self) -> SandboxResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of queuing a host message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Sent,
    Queued,
}

type InspectionReply = oneshot::Sender<SandboxResult<ElementInfo>>;

/// Host side of one sandbox's channel
#[derive(Debug)]
pub struct MessageChannel {
    session: u64,
    outbound: Option<mpsc::UnboundedSender<HostMessage>>,
    backlog: VecDeque<HostMessage>,
    backlog_capacity: usize,
    pending: HashMap<String, InspectionReply>,
    closed: bool,
    token: String,
}

impl MessageChannel {
    pub fn new(backlog_capacity: usize) -> Self {
        Self {
            session: 0,
            outbound: None,
            backlog: VecDeque::new(),
            backlog_capacity,
            pending: HashMap::new(),
            closed: false,
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Secret the sandbox presents when it connects
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn authorizes(&self, token: &str) -> bool {
        !self.closed && !token.is_empty() && token == self.token
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_current(&self, session: u64) -> bool {
        !self.closed && self.outbound.is_some() && self.session == session
    }

    pub fn is_attached(&self) -> bool {
        !self.closed && self.outbound.as_ref().map_or(false, |tx| !tx.is_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn pending_inspections(&self) -> usize {
        self.pending.len()
    }

    /// Start a new session. Requests from the previous session are abandoned
    /// and queued messages are flushed into the new receiver.
    pub fn attach(&mut self) -> SandboxResult<(u64, mpsc::UnboundedReceiver<HostMessage>)> {
        if self.closed {
            return Err(SandboxError::ChannelClosed(
                "Cannot attach to a released sandbox".to_string(),
            ));
        }
        self.reject_pending(|selector| {
            SandboxError::SessionReset(format!("Inspection of {} abandoned on reconnect", selector))
        });

        let (tx, rx) = mpsc::unbounded_channel();
        while let Some(message) = self.backlog.pop_front() {
            // Receiver is alive in this scope
            let _ = tx.send(message);
        }
        self.session += 1;
        self.outbound = Some(tx);
        debug!("Channel session {} attached", self.session);
        Ok((self.session, rx))
    }

    /// End `session` if it is still the current one.
    pub fn detach(&mut self, session: u64) {
        if self.session != session || self.outbound.is_none() {
            return;
        }
        self.outbound = None;
        self.reject_pending(|selector| {
            SandboxError::SessionReset(format!("Connection dropped while inspecting {}", selector))
        });
        debug!("Channel session {} detached", session);
    }

    /// Send now if a transport is attached, otherwise queue.
    pub fn send(&mut self, message: HostMessage) -> SandboxResult<Delivery> {
        if self.closed {
            return Err(SandboxError::ChannelClosed(
                "Sandbox has been released".to_string(),
            ));
        }
        let message = match &self.outbound {
            Some(tx) => match tx.send(message) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(mpsc::error::SendError(message)) => {
                    self.outbound = None;
                    message
                }
            },
            None => message,
        };

        if self.backlog.len() >= self.backlog_capacity {
            if let Some(dropped) = self.backlog.pop_front() {
                warn!("Outbound backlog full, dropping {:?}", dropped);
            }
        }
        if self.backlog_capacity > 0 {
            self.backlog.push_back(message);
        }
        Ok(Delivery::Queued)
    }

    /// Ask the sandbox to describe `selector`. The reply arrives through
    /// [`MessageChannel::resolve_inspection`].
    pub fn request_inspection(
        &mut self,
        selector: &str,
    ) -> SandboxResult<oneshot::Receiver<SandboxResult<ElementInfo>>> {
        if self.closed {
            return Err(SandboxError::ChannelClosed(
                "Sandbox has been released".to_string(),
            ));
        }
        if !self.is_attached() {
            return Err(SandboxError::ChannelUnavailable(
                "No sandbox connection is attached".to_string(),
            ));
        }
        if let Some(existing) = self.pending.get(selector) {
            if !existing.is_closed() {
                return Err(SandboxError::InspectionInFlight(selector.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        if let Some(outbound) = &self.outbound {
            outbound
                .send(HostMessage::InspectElement {
                    selector: selector.to_string(),
                })
                .map_err(|_| {
                    SandboxError::ChannelUnavailable("Sandbox connection went away".to_string())
                })?;
        }
        self.pending.insert(selector.to_string(), tx);
        Ok(rx)
    }

    /// Settle the pending inspection for `selector`. Returns false when no
    /// request was waiting.
    pub fn resolve_inspection(&mut self, selector: &str, info: Option<ElementInfo>) -> bool {
        let Some(reply) = self.pending.remove(selector) else {
            return false;
        };
        let result = info.ok_or_else(|| {
            SandboxError::NotFound(format!("No element matches selector {}", selector))
        });
        let _ = reply.send(result);
        true
    }

    /// Forget a request whose caller stopped waiting. A newer request for
    /// the same selector, still being awaited, is left alone.
    pub fn abandon_inspection(&mut self, selector: &str) {
        if self.pending.get(selector).map_or(false, |reply| reply.is_closed()) {
            self.pending.remove(selector);
        }
    }

    /// Release the channel. Pending requests fail; further sends are refused.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound = None;
        self.backlog.clear();
        self.reject_pending(|selector| {
            SandboxError::ChannelClosed(format!("Sandbox released while inspecting {}", selector))
        });
    }

    fn reject_pending<F>(&mut self, error: F)
    where
        F: Fn(&str) -> SandboxError,
    {
        for (selector, reply) in self.pending.drain() {
            let _ = reply.send(Err(error(&selector)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sandbox_messages() {
        let message = SandboxMessage::parse(
            r#"{"type":"console","level":"warn","message":"hi","timestamp":1,"sandboxId":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            SandboxMessage::Console {
                level: ConsoleLevel::Warn,
                message: "hi".to_string(),
                timestamp: Some(1)
            }
        );

        let message = SandboxMessage::parse(
            r#"{"type":"network-request","method":"GET","url":"/api","status":200,"ok":true,"durationMs":12.5}"#,
        )
        .unwrap();
        assert_eq!(message.kind(), "network-request");

        let message = SandboxMessage::parse(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(message, SandboxMessage::Ready);
    }

    #[test]
    fn unknown_message_is_protocol_error() {
        let err = SandboxMessage::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
        assert!(SandboxMessage::parse("not json").is_err());
    }

    #[test]
    fn host_messages_use_wire_names() {
        let json = HostMessage::ComponentUpdate {
            component_id: "Card".to_string(),
            code: "x".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"component-update","componentId":"Card","code":"x"}"#);

        let json = HostMessage::NetworkSimulation {
            conditions: NetworkConditions { slow: true, delay: 300 },
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"network-simulation","conditions":{"slow":true,"delay":300}}"#);
    }

    #[test]
    fn queues_until_attached_then_flushes_in_order() {
        let mut channel = MessageChannel::new(8);
        assert_eq!(channel.send(HostMessage::FullReload).unwrap(), Delivery::Queued);
        channel
            .send(HostMessage::NetworkSimulation {
                conditions: NetworkConditions::default(),
            })
            .unwrap();
        let (_, mut rx) = channel.attach().unwrap();
        assert_eq!(rx.try_recv().unwrap(), HostMessage::FullReload);
        assert!(matches!(rx.try_recv().unwrap(), HostMessage::NetworkSimulation { .. }));
        assert_eq!(channel.send(HostMessage::FullReload).unwrap(), Delivery::Sent);
        assert_eq!(channel.backlog_len(), 0);
    }

    #[test]
    fn backlog_is_bounded() {
        let mut channel = MessageChannel::new(2);
        for _ in 0..5 {
            channel.send(HostMessage::FullReload).unwrap();
        }
        assert_eq!(channel.backlog_len(), 2);
    }

    #[test]
    fn inspection_requires_attached_transport() {
        let mut channel = MessageChannel::new(4);
        let err = channel.request_inspection("#app").unwrap_err();
        assert!(matches!(err, SandboxError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn inspection_resolves_by_selector() {
        let mut channel = MessageChannel::new(4);
        let (_, mut rx) = channel.attach().unwrap();
        let reply = channel.request_inspection("#app").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            HostMessage::InspectElement {
                selector: "#app".to_string()
            }
        );
        let err = channel.request_inspection("#app").unwrap_err();
        assert!(matches!(err, SandboxError::InspectionInFlight(_)));

        let info = ElementInfo {
            tag_name: "div".to_string(),
            ..Default::default()
        };
        assert!(channel.resolve_inspection("#app", Some(info.clone())));
        assert_eq!(reply.await.unwrap().unwrap(), info);
        assert!(!channel.resolve_inspection("#app", None));
    }

    #[tokio::test]
    async fn missing_element_resolves_as_not_found() {
        let mut channel = MessageChannel::new(4);
        let (_, _rx) = channel.attach().unwrap();
        let reply = channel.request_inspection("#missing").unwrap();
        channel.resolve_inspection("#missing", None);
        assert!(matches!(reply.await.unwrap(), Err(SandboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn late_abandon_keeps_newer_request() {
        let mut channel = MessageChannel::new(4);
        let (_, _rx) = channel.attach().unwrap();
        drop(channel.request_inspection("#a").unwrap());
        let second = channel.request_inspection("#a").unwrap();

        channel.abandon_inspection("#a");
        assert_eq!(channel.pending_inspections(), 1);

        assert!(channel.resolve_inspection("#a", Some(ElementInfo::default())));
        assert!(second.await.unwrap().is_ok());
    }

    #[test]
    fn abandon_drops_request_nobody_awaits() {
        let mut channel = MessageChannel::new(4);
        let (_, _rx) = channel.attach().unwrap();
        drop(channel.request_inspection("#a").unwrap());
        channel.abandon_inspection("#a");
        assert_eq!(channel.pending_inspections(), 0);
    }

    #[tokio::test]
    async fn reconnect_abandons_pending_requests() {
        let mut channel = MessageChannel::new(4);
        let (first, _rx) = channel.attach().unwrap();
        let reply = channel.request_inspection("#app").unwrap();
        let (second, _rx2) = channel.attach().unwrap();
        assert!(second > first);
        assert!(!channel.is_current(first));
        assert!(matches!(reply.await.unwrap(), Err(SandboxError::SessionReset(_))));
    }

    #[tokio::test]
    async fn close_rejects_pending_and_refuses_sends() {
        let mut channel = MessageChannel::new(4);
        let (_, _rx) = channel.attach().unwrap();
        let reply = channel.request_inspection("h1").unwrap();
        channel.close();
        assert!(matches!(reply.await.unwrap(), Err(SandboxError::ChannelClosed(_))));
        assert!(matches!(
            channel.send(HostMessage::FullReload),
            Err(SandboxError::ChannelClosed(_))
        ));
        assert!(channel.attach().is_err());
    }

    #[test]
    fn token_is_per_channel_and_dies_with_it() {
        let mut a = MessageChannel::new(4);
        let b = MessageChannel::new(4);
        assert_ne!(a.token(), b.token());
        let token = a.token().to_string();
        assert!(a.authorizes(&token));
        assert!(!a.authorizes(b.token()));
        assert!(!a.authorizes(""));
        a.close();
        assert!(!a.authorizes(&token));
    }

    #[test]
    fn stale_detach_is_ignored() {
        let mut channel = MessageChannel::new(4);
        let (first, _rx) = channel.attach().unwrap();
        let (second, _rx2) = channel.attach().unwrap();
        channel.detach(first);
        assert!(channel.is_current(second));
        channel.detach(second);
        assert!(!channel.is_attached());
    }
}

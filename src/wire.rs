//! Newline-delimited JSON protocol over TCP.
//!
//! One request object per line, tagged by `"op"`. Every request gets exactly
//! one reply line, `{"ok": ...}` or `{"error": {...}}`. After `listen`, events
//! for that channel are pushed as `{"event": {...}}` lines in between replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RequestBooking {
        provider_id: Ulid,
        requester_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default)]
        message: Option<String>,
    },
    Transition {
        booking_id: Ulid,
        status: Status,
        actor_id: Ulid,
    },
    Get {
        booking_id: Ulid,
    },
    ListProvider {
        provider_id: Ulid,
        #[serde(default)]
        statuses: Vec<Status>,
    },
    ListRequester {
        requester_id: Ulid,
        #[serde(default)]
        statuses: Vec<Status>,
    },
    FindConflicts {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    /// `channel` is a party id, or `"*"` for every event.
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
    Ping,
}

impl Request {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Request::RequestBooking { .. } => "request_booking",
            Request::Transition { .. } => "transition",
            Request::Get { .. } => "get",
            Request::ListProvider { .. } => "list_provider",
            Request::ListRequester { .. } => "list_requester",
            Request::FindConflicts { .. } => "find_conflicts",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
            Request::UnlistenAll => "unlisten_all",
            Request::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Error(ErrorBody),
    Event(BookingEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictingBooking>,
}

impl ErrorBody {
    fn new(code: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            conflicts: Vec::new(),
        }
    }
}

impl From<EngineError> for ErrorBody {
    fn from(e: EngineError) -> Self {
        let mut body = ErrorBody::new(e.code(), e.to_string(), e.is_retryable());
        if let EngineError::Conflict(hits) = e {
            body.conflicts = hits;
        }
        body
    }
}

fn ok<T: Serialize>(value: T) -> Reply {
    match serde_json::to_value(value) {
        Ok(v) => Reply::Ok(v),
        Err(e) => Reply::Error(ErrorBody::new("internal", e.to_string(), false)),
    }
}

fn encode(reply: &Reply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"code":"internal","message":"encode failed: {e}","retryable":false}}}}"#)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Party(Ulid),
    All,
}

fn parse_channel(raw: &str) -> Result<Channel, ErrorBody> {
    if raw == "*" {
        return Ok(Channel::All);
    }
    Ulid::from_string(raw)
        .map(Channel::Party)
        .map_err(|e| ErrorBody::new("bad_request", format!("bad channel {raw:?}: {e}"), false))
}

/// Run an engine-backed request. Subscription requests never reach here.
async fn execute(engine: Arc<Engine>, req: Request) -> Result<serde_json::Value, ErrorBody> {
    let value = match req {
        Request::RequestBooking {
            provider_id,
            requester_id,
            start,
            end,
            message,
        } => serde_json::to_value(
            engine
                .request_booking(provider_id, requester_id, start, end, message)
                .await?,
        ),
        Request::Transition {
            booking_id,
            status,
            actor_id,
        } => serde_json::to_value(engine.transition_booking(booking_id, status, actor_id).await?),
        Request::Get { booking_id } => serde_json::to_value(engine.get_booking(booking_id).await?),
        Request::ListProvider {
            provider_id,
            statuses,
        } => serde_json::to_value(engine.bookings_for_provider(provider_id, &statuses).await?),
        Request::ListRequester {
            requester_id,
            statuses,
        } => serde_json::to_value(engine.bookings_for_requester(requester_id, &statuses).await?),
        Request::FindConflicts {
            provider_id,
            start,
            end,
        } => {
            let report = engine.find_conflicts(provider_id, start, end).await?;
            Ok(serde_json::json!({
                "has_conflict": report.has_conflict(),
                "colliding": report.colliding,
            }))
        }
        Request::Listen { .. } | Request::Unlisten { .. } | Request::UnlistenAll | Request::Ping => {
            return Err(ErrorBody::new("internal", "subscription request routed to engine", false));
        }
    };
    value.map_err(|e| ErrorBody::new("internal", e.to_string(), false))
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<BookingEvent>,
    tx: mpsc::Sender<BookingEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("listener lagged, {n} event(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Per-connection state: the engine handle plus active subscriptions.
struct Session {
    engine: Arc<Engine>,
    request_timeout: Duration,
    listeners: HashMap<Channel, JoinHandle<()>>,
    events_tx: mpsc::Sender<BookingEvent>,
}

impl Session {
    async fn handle_line(&mut self, line: &str) -> Reply {
        let req: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                    .increment(1);
                return Reply::Error(ErrorBody::new("bad_request", e.to_string(), false));
            }
        };

        let label = req.label();
        let started = Instant::now();
        let reply = self.handle(req).await;
        let status = if matches!(reply, Reply::Error(_)) { "error" } else { "ok" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
            .record(started.elapsed().as_secs_f64());
        reply
    }

    async fn handle(&mut self, req: Request) -> Reply {
        match req {
            Request::Ping => ok("pong"),
            Request::Listen { channel } => match parse_channel(&channel) {
                Ok(ch) => self.listen(ch),
                Err(e) => Reply::Error(e),
            },
            Request::Unlisten { channel } => match parse_channel(&channel) {
                Ok(ch) => {
                    self.unlisten(ch);
                    ok(serde_json::json!({ "unlistened": channel }))
                }
                Err(e) => Reply::Error(e),
            },
            Request::UnlistenAll => {
                let channels: Vec<Channel> = self.listeners.keys().copied().collect();
                for ch in &channels {
                    self.unlisten(*ch);
                }
                ok(serde_json::json!({ "unlistened": channels.len() }))
            }
            other => {
                // Spawned so a timed-out request still finishes, events included.
                let task = tokio::spawn(execute(self.engine.clone(), other));
                match tokio::time::timeout(self.request_timeout, task).await {
                    Ok(Ok(Ok(value))) => Reply::Ok(value),
                    Ok(Ok(Err(body))) => Reply::Error(body),
                    Ok(Err(e)) => {
                        tracing::error!("request task failed: {e}");
                        Reply::Error(ErrorBody::new("internal", "request task failed", false))
                    }
                    Err(_) => Reply::Error(ErrorBody::new(
                        "timeout",
                        format!("request exceeded {}ms", self.request_timeout.as_millis()),
                        true,
                    )),
                }
            }
        }
    }

    fn listen(&mut self, ch: Channel) -> Reply {
        // Listening twice on the same channel is a no-op.
        if !self.listeners.contains_key(&ch) {
            if self.listeners.len() >= MAX_SUBSCRIPTIONS_PER_CONN {
                return Reply::Error(ErrorBody::new(
                    "limit_exceeded",
                    "too many subscriptions on this connection",
                    false,
                ));
            }
            let rx = match ch {
                Channel::Party(id) => self.engine.notify.subscribe(id),
                Channel::All => self.engine.notify.subscribe_all(),
            };
            self.listeners.insert(ch, spawn_forwarder(rx, self.events_tx.clone()));
        }
        ok(serde_json::json!({ "listening": self.listeners.len() }))
    }

    fn unlisten(&mut self, ch: Channel) {
        if let Some(handle) = self.listeners.remove(&ch) {
            handle.abort();
        }
        if let Channel::Party(id) = ch {
            self.engine.notify.remove_if_idle(&id);
        }
    }

    fn close(&mut self) {
        let channels: Vec<Channel> = self.listeners.keys().copied().collect();
        for ch in channels {
            self.unlisten(ch);
        }
    }
}

pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    request_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (events_tx, mut events_rx) = mpsc::channel(CHANNEL_BACKLOG);
    let mut session = Session {
        engine,
        request_timeout,
        listeners: HashMap::new(),
        events_tx,
    };

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        let body = ErrorBody::new("bad_request", e.to_string(), false);
                        let _ = framed.send(encode(&Reply::Error(body))).await;
                        break Err(e.into());
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = session.handle_line(&line).await;
                if let Err(e) = framed.send(encode(&reply)).await {
                    break Err(e.into());
                }
            }
            Some(event) = events_rx.recv() => {
                if let Err(e) = framed.send(encode(&Reply::Event(event))).await {
                    break Err(e.into());
                }
            }
        }
    };

    session.close();
    result
}

const CHANNEL_BACKLOG: usize = 256;

//! The request/response driver sitting on top of the connection registry.
//!
//! `HttpSimulator` turns the registry's event stream into HTTP exchanges:
//! it defers the rendered request until the handshake completes, feeds
//! delivered payloads into the right endpoint's session, answers framed
//! requests through per-device handlers, and tears the connection down
//! once the response has been consumed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;

use crate::config::SimConfig;
use crate::device::{Device, DeviceId};
use crate::event::EventBus;
use crate::tcp::{ConnectionId, ConnectionState, TcpEvent, TcpManager};
use crate::transport::Transport;

use super::message::{build_request, build_response, HttpMessage, HttpRequest, HttpResponse};
use super::session::{HttpSession, SessionRole};

/// Decides what a device answers. Returning `None` falls back to the
/// built-in 200 page.
pub type RequestHandler = Box<dyn FnMut(&HttpRequest, &HttpSession) -> Option<HttpResponse>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Closed,
    Reset,
}

#[derive(Debug, Clone)]
pub enum HttpEvent {
    RequestStart {
        connection: ConnectionId,
        method: String,
        path: String,
    },
    RequestReceived {
        connection: ConnectionId,
        request: HttpRequest,
    },
    ResponseSent {
        connection: ConnectionId,
        response: HttpResponse,
    },
    ResponseReceived {
        connection: ConnectionId,
        response: HttpResponse,
        duration: Duration,
    },
    SessionClosed {
        connection: ConnectionId,
        reason: CloseReason,
    },
}

/// What to ask for. `..Default::default()` gives `GET / HTTP/1.1` on
/// port 80 with no extra headers.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub server_port: u16,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            server_port: 80,
        }
    }
}

impl RequestOptions {
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }
}

pub struct HttpSimulator {
    manager: TcpManager,
    sessions: HashMap<ConnectionId, HttpSession>,
    handlers: HashMap<DeviceId, RequestHandler>,
    bus: EventBus<HttpEvent>,
}

impl HttpSimulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            manager: TcpManager::new(config),
            sessions: HashMap::new(),
            handlers: HashMap::new(),
            bus: EventBus::new(),
        }
    }

    pub fn with_manager(manager: TcpManager) -> Self {
        Self {
            manager,
            sessions: HashMap::new(),
            handlers: HashMap::new(),
            bus: EventBus::new(),
        }
    }

    pub fn manager(&self) -> &TcpManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut TcpManager {
        &mut self.manager
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&HttpEvent) + 'static,
    {
        self.bus.subscribe(handler);
    }

    /// Install the request handler for a server device.
    pub fn set_handler<F>(&mut self, device: DeviceId, handler: F)
    where
        F: FnMut(&HttpRequest, &HttpSession) -> Option<HttpResponse> + 'static,
    {
        self.handlers.insert(device, Box::new(handler));
    }

    pub fn session(&self, connection: &ConnectionId) -> Option<&HttpSession> {
        self.sessions.get(connection)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a connection toward `server` and queue the rendered request;
    /// it goes on the wire once the handshake reports `Established`.
    pub fn send_request(
        &mut self,
        client: Device,
        server: &Device,
        options: RequestOptions,
    ) -> ConnectionId {
        let id = self
            .manager
            .create_connection(client, server.clone(), None, options.server_port);

        // Events queued for a previous occupant of this id (a reset
        // predecessor on the same 4-tuple) must be settled before the new
        // session exists, or the stale ConnectionReset would remove it.
        for event in self.manager.poll_events() {
            self.handle_tcp_event(event);
        }

        let raw = build_request(
            &options.method,
            &options.path,
            server.name(),
            &options.headers,
            &options.body,
        );
        let mut session = HttpSession::new(id.clone(), SessionRole::Client, self.manager.now());
        session.defer_request(raw);
        self.sessions.insert(id.clone(), session);

        self.bus.emit(&HttpEvent::RequestStart {
            connection: id.clone(),
            method: options.method,
            path: options.path,
        });
        log::info!("{id}: starting request");

        self.manager.connect(&id);
        id
    }

    /// Drive the exchange: shuttle segments through `transport` and react
    /// to registry events until nothing is deliverable right now. Delayed
    /// transports need [`HttpSimulator::advance`] between pumps.
    pub fn pump(&mut self, transport: &mut dyn Transport) {
        loop {
            let mut moved = false;

            for event in self.manager.poll_events() {
                self.handle_tcp_event(event);
                moved = true;
            }

            let now = self.manager.now();
            for flight in self.manager.take_outbound() {
                transport.dispatch(flight, now);
                moved = true;
            }
            for flight in transport.poll(now) {
                self.manager.deliver(flight);
                moved = true;
            }

            if !moved {
                break;
            }
        }
    }

    /// Advance virtual time (firing connection timers), then pump.
    pub fn advance(&mut self, dt: Duration, transport: &mut dyn Transport) {
        self.manager.advance(dt);
        self.pump(transport);
    }

    pub fn clear_all_sessions(&mut self) {
        self.sessions.clear();
        self.manager.clear_all();
        log::debug!("cleared all sessions");
    }

    fn handle_tcp_event(&mut self, event: TcpEvent) {
        match event {
            TcpEvent::Established { connection } => {
                if let Some(session) = self.sessions.get_mut(&connection) {
                    if let Some(raw) = session.take_pending_request() {
                        log::debug!("{connection}: handshake done, transmitting request");
                        self.manager.send(&connection, Bytes::from(raw));
                    }
                }
            }
            TcpEvent::DataReceived {
                connection,
                payload,
            } => {
                self.on_data(connection, &payload);
            }
            TcpEvent::StateChange {
                connection, new, ..
            } => match new {
                // The peer closed; if our exchange is done, close too.
                ConnectionState::CloseWait => {
                    let finished = self
                        .sessions
                        .get(&connection)
                        .map_or(true, |s| s.is_finished());
                    if finished {
                        self.manager.close(&connection);
                    }
                }
                ConnectionState::Closed => {
                    if self.sessions.remove(&connection).is_some() {
                        self.bus.emit(&HttpEvent::SessionClosed {
                            connection,
                            reason: CloseReason::Closed,
                        });
                    }
                }
                _ => {}
            },
            TcpEvent::ConnectionReset { connection } => {
                if self.sessions.remove(&connection).is_some() {
                    self.bus.emit(&HttpEvent::SessionClosed {
                        connection,
                        reason: CloseReason::Reset,
                    });
                }
            }
            TcpEvent::SegmentSent { .. } | TcpEvent::SegmentReceived { .. } => {}
        }
    }

    fn on_data(&mut self, connection: ConnectionId, payload: &[u8]) {
        let now = self.manager.now();
        let text = String::from_utf8_lossy(payload).into_owned();

        // A connection receiving data without a session is the passive
        // side; give it a server session on first contact.
        let session = self
            .sessions
            .entry(connection.clone())
            .or_insert_with(|| HttpSession::new(connection.clone(), SessionRole::Server, now));

        let message = match session.ingest(&text, now) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) => {
                log::warn!("{connection}: discarding unparseable message: {err}");
                return;
            }
        };

        match message {
            HttpMessage::Request(request) => {
                self.bus.emit(&HttpEvent::RequestReceived {
                    connection: connection.clone(),
                    request: request.clone(),
                });
                self.answer(connection, request);
            }
            HttpMessage::Response(response) => {
                let duration = self
                    .sessions
                    .get(&connection)
                    .and_then(|s| s.duration())
                    .unwrap_or_default();
                log::info!(
                    "{connection}: response {} after {}ms",
                    response.status,
                    duration.as_millis()
                );
                self.bus.emit(&HttpEvent::ResponseReceived {
                    connection: connection.clone(),
                    response,
                    duration,
                });
                // Connection: close semantics, the consumer hangs up.
                self.manager.close(&connection);
            }
        }
    }

    fn answer(&mut self, connection: ConnectionId, request: HttpRequest) {
        let now = self.manager.now();
        let response = match (
            self.handlers.get_mut(&connection.local),
            self.sessions.get(&connection),
        ) {
            (Some(handler), Some(session)) => handler(&request, session),
            _ => None,
        }
        .unwrap_or_else(|| default_response(&request));

        let raw = build_response(response.status, &response.headers, &response.body);
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.mark_finished(now);
        }
        log::debug!("{connection}: answering {} for {}", response.status, request.path);
        self.manager.send(&connection, Bytes::from(raw));
        self.bus.emit(&HttpEvent::ResponseSent {
            connection,
            response,
        });
    }
}

/// The built-in page served when a device has no handler of its own.
fn default_response(request: &HttpRequest) -> HttpResponse {
    HttpResponse {
        version: "HTTP/1.1".to_string(),
        status: 200,
        reason: "OK".to_string(),
        headers: BTreeMap::new(),
        body: format!(
            "<html><body><h1>It works!</h1><p>You requested {}</p></body></html>",
            request.path
        ),
    }
}

//! Per-endpoint HTTP exchange state.

use crate::clock::SimTime;
use crate::tcp::ConnectionId;

use super::message::{parse_message, HttpMessage, HttpParseError, HttpRequest, HttpResponse};

/// Which end of the exchange this session models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// One request/response exchange as seen from one endpoint.
///
/// The session buffers raw payload text until a complete message frames,
/// then remembers the parsed request or response. A client session also
/// parks the rendered request until the underlying connection reports
/// itself established.
#[derive(Debug)]
pub struct HttpSession {
    connection: ConnectionId,
    role: SessionRole,
    buffer: String,
    pending_request: Option<String>,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
    started_at: SimTime,
    finished_at: Option<SimTime>,
}

impl HttpSession {
    pub fn new(connection: ConnectionId, role: SessionRole, now: SimTime) -> Self {
        Self {
            connection,
            role,
            buffer: String::new(),
            pending_request: None,
            request: None,
            response: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn started_at(&self) -> SimTime {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SimTime> {
        self.finished_at
    }

    /// Wall-clock (virtual) time from first byte to completion.
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.finished_at.map(|end| end.duration_since(self.started_at))
    }

    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    /// Stash a rendered request to transmit once the handshake completes.
    pub fn defer_request(&mut self, raw: String) {
        self.pending_request = Some(raw);
    }

    pub fn take_pending_request(&mut self) -> Option<String> {
        self.pending_request.take()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Append received payload text and try to frame a message.
    ///
    /// A session carries one exchange: once a request (or response) has
    /// been framed, further framed messages of the same kind are logged
    /// and dropped until [`HttpSession::reset`]. Short reads keep
    /// buffering; a malformed start line is reported but the buffer is
    /// kept in case a later delivery completes it differently.
    pub fn ingest(
        &mut self,
        payload: &str,
        now: SimTime,
    ) -> Result<Option<HttpMessage>, HttpParseError> {
        self.buffer.push_str(payload);
        match parse_message(&self.buffer) {
            Ok(message) => {
                self.buffer.clear();
                match message {
                    HttpMessage::Request(req) => {
                        if self.request.is_some() {
                            log::warn!(
                                "{}: request already handled on this session, dropping {}",
                                self.connection,
                                req
                            );
                            return Ok(None);
                        }
                        self.request = Some(req.clone());
                        Ok(Some(HttpMessage::Request(req)))
                    }
                    HttpMessage::Response(resp) => {
                        if self.response.is_some() {
                            log::warn!(
                                "{}: response already handled on this session, dropping {}",
                                self.connection,
                                resp
                            );
                            return Ok(None);
                        }
                        self.response = Some(resp.clone());
                        // The exchange is over for the client once the
                        // response parses.
                        if self.role == SessionRole::Client {
                            self.finished_at = Some(now);
                        }
                        Ok(Some(HttpMessage::Response(resp)))
                    }
                }
            }
            Err(HttpParseError::Incomplete) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Record the server side completing its exchange.
    pub fn mark_finished(&mut self, now: SimTime) {
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// Drop all exchange state so the connection can carry another
    /// request/response pair.
    pub fn reset(&mut self, now: SimTime) {
        self.buffer.clear();
        self.pending_request = None;
        self.request = None;
        self.response = None;
        self.started_at = now;
        self.finished_at = None;
    }
}

//! Simulated HTTP/1.1 exchanges carried over the simulated TCP layer.

pub mod message;
pub mod session;
pub mod simulator;

pub use message::{
    build_request, build_response, parse_message, status_text, HttpMessage, HttpParseError,
    HttpRequest, HttpResponse,
};
pub use session::{HttpSession, SessionRole};
pub use simulator::{CloseReason, HttpEvent, HttpSimulator, RequestHandler, RequestOptions};

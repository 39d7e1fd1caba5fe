//! quay_http - Pipelined HTTP/1.1 server connection core
//!
//! A connection-oriented HTTP/1.1 server engine: it parses requests off a
//! socket, queues them for pipelined handling, streams request and response
//! payloads in both directions without buffering whole bodies, and manages
//! connection lifecycle through keep-alive, close and CONNECT tunnel
//! upgrades.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked transfer
//!   coding in both directions, `Expect: 100-continue`, CONNECT tunnels
//! - **HTTP/1.0**: keep-alive by request, close-delimited response bodies
//!
//! # What the core guarantees
//!
//! - **Strict response ordering** - pipelined responses leave in
//!   request-arrival order, whatever order handlers finish in.
//! - **Streaming payloads with backpressure** - request bodies reach the
//!   handler chunk by chunk; response bodies are pulled (channel) or pushed
//!   ([`BodyWriter`]) under bounded buffering. A paused handler pauses the
//!   socket.
//! - **Bounded resource use** - configurable caps on target length, header
//!   block, payload size and pipeline depth; see [`limits`].
//! - **TLS or plain** - sockets are optionally wrapped in server-side
//!   `rustls` before HTTP starts.
//!
//! # Quick Start
//!
//! ```no_run
//! use quay_http::{Handler, Request, Response, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn handle(&self, req: Request) {
//!         let mut resp = Response::new(StatusCode::Ok);
//!         resp.header("content-type", "text/plain")
//!             .body_bytes("Hello, World!");
//!         let _ = req.respond(resp);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(Hello)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Routing, content negotiation and session state are deliberately out of
//! scope; this crate is the connection machinery applications build those
//! on.

pub(crate) mod http {
    pub(crate) mod chunked;
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod conn_list;
    pub(crate) mod connection;
    pub(crate) mod payload;
    pub(crate) mod server_impl;
    pub(crate) mod transport;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{DisconnectReason, Error, IoError},
    http::{
        request::{Request, RequestState},
        response::{BodyWriter, Challenge, Response},
        types::{Header, HeaderMap, StatusCode, Version},
    },
    server::{
        conn_list::ConnectionList,
        payload::PayloadReader,
        server_impl::{Handler, Server, ServerBuilder},
        transport::{AsyncStream, Transport, Tunnel},
    },
};

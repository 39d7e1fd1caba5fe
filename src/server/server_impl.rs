use crate::{
    errors::DisconnectReason,
    limits::{ConnLimits, ReqLimits, ServerLimits},
    server::{
        conn_list::ConnectionList,
        connection::{run_connection, ConnShared, ConnectionConfig},
        transport::{apply_socket_options, Transport},
    },
    Request,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Application callbacks bound to a [`Server`].
///
/// `handle` is invoked once per request, on its own task, as soon as the
/// request head is parsed, possibly while earlier pipelined requests are
/// still being answered. The handler settles each [`Request`] by submitting
/// a response through it; responses go on the wire in request-arrival order
/// regardless of handler completion order.
///
/// # Examples
///
/// ```
/// use quay_http::{Handler, Request, Response, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn handle(&self, mut req: Request) {
///         let mut body = Vec::new();
///         if let Some(mut payload) = req.take_payload() {
///             while let Some(Ok(chunk)) = payload.data().await {
///                 body.extend_from_slice(&chunk);
///             }
///         }
///
///         let mut resp = Response::new(StatusCode::Ok);
///         resp.header("content-type", "application/octet-stream")
///             .body_bytes(body);
///         let _ = req.respond(resp);
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Called once per request when its head has been parsed.
    fn handle(&self, request: Request) -> impl Future<Output = ()> + Send;

    /// Called instead of [`handle`](Handler::handle) for CONNECT requests.
    ///
    /// Engage tunnel mode by submitting a 2xx response through
    /// [`Request::respond_tunnel`] and returning `true`. The default leaves
    /// the request unanswered, which yields `501 Not Implemented`.
    fn handle_connect(&self, request: Request) -> impl Future<Output = bool> + Send {
        async move {
            drop(request);
            false
        }
    }

    /// Called exactly once when a connection terminates (never for a
    /// connection that detached as a tunnel).
    fn connection_destroy(&self, reason: &DisconnectReason) {
        let _ = reason;
    }
}

/// The HTTP/1.1 server: a listening endpoint, a callback bundle and the
/// shared configuration every accepted connection runs under.
///
/// # Examples
///
/// ```no_run
/// use quay_http::{Handler, Request, Response, Server, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(&self, req: Request) {
///         let mut resp = Response::new(StatusCode::Ok);
///         resp.body_bytes("Hello, World!");
///         let _ = req.respond(resp);
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(Hello)
///         .build()
///         .launch()
///         .await;
/// }
/// ```
pub struct Server<H: Handler> {
    listener: TcpListener,
    handler: Arc<H>,
    tls: Option<TlsAcceptor>,
    conn_list: Arc<ConnectionList>,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
}

impl<H: Handler> Server<H> {
    /// Creates a builder for configuring a server instance.
    pub fn builder() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            handler: None,
            tls: None,
            server_limits: None,
            conn_limits: None,
            req_limits: None,
        }
    }

    /// The live-connection registry. Grab a handle before
    /// [`launch`](Server::launch) to observe or shut down connections later.
    pub fn connections(&self) -> Arc<ConnectionList> {
        self.conn_list.clone()
    }

    /// Accepts connections until the listener fails permanently.
    pub async fn launch(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, tls = self.tls.is_some(), "server listening");
        }

        loop {
            let Ok((stream, peer)) = self.listener.accept().await else {
                continue;
            };
            self.accept(stream, peer);
        }
    }

    /// Takes one accepted socket into the connection machinery: socket
    /// options, optional TLS handshake, registration, then the connection
    /// task.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = apply_socket_options(&stream, &self.conn_limits) {
            tracing::debug!(%peer, %err, "failed to apply socket options");
        }

        let id = self.conn_list.next_id();
        let tls = self.tls.clone();
        let handler = self.handler.clone();
        let conn_list = self.conn_list.clone();
        let config = ConnectionConfig {
            server: self.server_limits.clone(),
            conn: self.conn_limits.clone(),
            req: self.req_limits.clone(),
        };

        tokio::spawn(async move {
            let transport = match tls {
                None => Transport::Plain(stream),
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => Transport::Tls(Box::new(stream)),
                    Err(err) => {
                        tracing::debug!(%peer, %err, "tls handshake failed");
                        return;
                    }
                },
            };

            let shared = ConnShared::new(id, Some(peer), transport.is_tls());
            conn_list.register(shared.clone());
            run_connection(transport, shared, handler, config).await;
            conn_list.deregister(id);
        });
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder<H: Handler> {
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    tls: Option<TlsAcceptor>,
    server_limits: Option<ServerLimits>,
    conn_limits: Option<ConnLimits>,
    req_limits: Option<ReqLimits>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Sets the TCP listener. **Required.**
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the callback bundle. **Required.**
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Serves TLS: every accepted socket is handshaked through `acceptor`
    /// before HTTP starts.
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Overrides [`ServerLimits`].
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Overrides [`ConnLimits`].
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = Some(limits);
        self
    }

    /// Overrides [`ReqLimits`].
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = Some(limits);
        self
    }

    /// Finalizes the builder.
    ///
    /// # Panics
    ///
    /// Panics when `listener` or `handler` was not set.
    #[track_caller]
    pub fn build(self) -> Server<H> {
        Server {
            listener: self
                .listener
                .expect("the `listener` method must be called before build"),
            handler: self
                .handler
                .expect("the `handler` method must be called before build"),
            tls: self.tls,
            conn_list: Arc::new(ConnectionList::new()),
            server_limits: self.server_limits.unwrap_or_default(),
            conn_limits: self.conn_limits.unwrap_or_default(),
            req_limits: self.req_limits.unwrap_or_default(),
        }
    }
}

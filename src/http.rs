//! HTTP/1.1 over plain TCP
//!
//! [`HttpConnector`] opens TCP connections and performs the hyper client
//! handshake; [`Http1`] runs one request/response exchange on the resulting
//! sender. Together they let an [`crate::Agent`] pool real HTTP connections.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, Request, Response, Version};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::AgentConfig;
use crate::connection::{Connection, Exchange, Protocol, Transport};
use crate::key::DestinationKey;

/// Per-address attempt budget while more addresses remain (RFC 8305)
const ATTEMPT_DELAY: Duration = Duration::from_millis(300);

/// Opens HTTP/1.1 client connections
#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.connect_timeout)
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// A handshaken HTTP/1.1 connection
///
/// The hyper connection driver runs in its own task and finishes when the
/// peer closes the socket. Dropping the connection stops the driver.
pub struct HttpConnection {
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<io::Result<()>>,
    finished: bool,
}

impl HttpConnection {
    pub fn is_closed(&self) -> bool {
        self.finished || self.sender.is_closed()
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Connection for HttpConnection {
    async fn closed(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        let result = (&mut self.driver).await;
        self.finished = true;
        match result {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Transport for HttpConnector {
    type Conn = HttpConnection;

    async fn open(&self, key: &DestinationKey) -> io::Result<HttpConnection> {
        let addrs = resolve_host_all(key.host(), key.port()).await?;

        let stream = tokio::time::timeout(
            self.connect_timeout,
            connect_with_happy_eyeballs(&addrs, key.local_address()),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timeout after {:?}", self.connect_timeout),
            )
        })??;

        stream.set_nodelay(true).ok();

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(hyper_error)?;

        let peer = key.to_string();
        let driver = tokio::spawn(async move {
            conn.await.map_err(|e| {
                trace!("Connection to {} closed: {}", peer, e);
                hyper_error(e)
            })
        });

        Ok(HttpConnection {
            sender,
            driver,
            finished: false,
        })
    }
}

/// One HTTP/1.1 request/response exchange with a fully buffered body
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1;

impl Protocol<HttpConnection> for Http1 {
    type Request = Request<Full<Bytes>>;
    type Response = Response<Bytes>;

    async fn exchange(
        &self,
        conn: &mut HttpConnection,
        request: Request<Full<Bytes>>,
    ) -> io::Result<Exchange<Response<Bytes>>> {
        let close_requested = wants_close(request.headers());

        conn.sender.ready().await.map_err(hyper_error)?;
        let response = conn.sender.send_request(request).await.map_err(hyper_error)?;

        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(hyper_error)?.to_bytes();

        let reusable = !close_requested
            && !wants_close(&parts.headers)
            && parts.version == Version::HTTP_11
            && !conn.is_closed();

        Ok(Exchange {
            response: Response::from_parts(parts, body),
            reusable,
        })
    }
}

/// Build a bodiless GET for `path` on `key`
pub fn get(key: &DestinationKey, path: &str) -> Result<Request<Full<Bytes>>, http::Error> {
    Request::get(path)
        .header(HOST, format!("{}:{}", key.host(), key.port()))
        .body(Full::new(Bytes::new()))
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Render a hyper error as an io error the router can classify
fn hyper_error(err: hyper::Error) -> io::Error {
    let kind = if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
        io::ErrorKind::ConnectionReset
    } else if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else if err.is_parse() {
        io::ErrorKind::InvalidData
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err.to_string())
}

/// Resolve hostname to all socket addresses
async fn resolve_host_all(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        ));
    }

    Ok(addrs)
}

/// Try each address in turn, moving on quickly while others remain
async fn connect_with_happy_eyeballs(
    addrs: &[SocketAddr],
    local: Option<IpAddr>,
) -> io::Result<TcpStream> {
    let candidates: Vec<&SocketAddr> = addrs
        .iter()
        .filter(|addr| local.map_or(true, |ip| ip.is_ipv4() == addr.is_ipv4()))
        .collect();

    if candidates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no resolved address matches the local address family",
        ));
    }

    let mut last_error = None;
    for (i, addr) in candidates.iter().enumerate() {
        let attempt = connect_one(**addr, local);
        let result = if i + 1 < candidates.len() {
            match tokio::time::timeout(ATTEMPT_DELAY, attempt).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection timeout to {}", addr),
                )),
            }
        } else {
            attempt.await
        };

        match result {
            Ok(stream) => {
                trace!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                trace!("Failed to connect to {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "all resolved addresses failed")
    }))
}

async fn connect_one(addr: SocketAddr, local: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = local {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    socket.connect(addr).await
}

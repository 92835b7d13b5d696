use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context as TaskContext;
use std::task::Poll;

use futures::Stream;
use hyper::Body;
use hyper::Client;
use hyper::Request;
use hyper::Response;
use hyper::Server;
use hyper::StatusCode;
use hyper::Uri;
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::header::HeaderName;
use hyper::service::make_service_fn;
use hyper::service::service_fn;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::warn;

use crate::access;
use crate::access::AccessDecision;
use crate::error::CfshareError;
use crate::error::Result;
use crate::origin_host::OriginHost;
use crate::types::AccessMode;
use crate::types::LogComponent;

/// Wraps `http://127.0.0.1:<upstream_port>`, forwarding every request after
/// rate-limit, path-allowlist and authorization checks. A single-upstream
/// reverse proxy built on the same hyper 0.14 server shape as a CONNECT/MITM
/// forwarder, without the interception.
pub struct ReverseProxy {
    shutdown_tx: oneshot::Sender<()>,
}

impl ReverseProxy {
    /// Close the server; in-flight requests are allowed to finish.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub async fn start_reverse_proxy(
    addr: SocketAddr,
    upstream_port: u16,
    host: Arc<dyn OriginHost>,
) -> Result<ReverseProxy> {
    let client = Client::new();
    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let client = client.clone();
        let host = host.clone();
        let client_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, client.clone(), host.clone(), upstream_port, client_addr)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| CfshareError::Internal(format!("failed to bind reverse proxy: {e}")))?
        .serve(make_svc);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        if let Err(err) = graceful.await {
            warn!(error = %err, "reverse proxy server error");
        }
    });

    Ok(ReverseProxy { shutdown_tx })
}

async fn handle_request(
    req: Request<Body>,
    client: Client<hyper::client::HttpConnector>,
    host: Arc<dyn OriginHost>,
    upstream_port: u16,
    client_addr: SocketAddr,
) -> std::result::Result<Response<Body>, Infallible> {
    host.record_request().await;

    if !host.rate_limiter().check(client_addr.ip()) {
        host.log(LogComponent::Origin, format!("{} rate_limited", client_addr)).await;
        return Ok(json_response(StatusCode::TOO_MANY_REQUESTS, json!({"error": "rate_limited"})));
    }

    let access = host.access();
    match access::check_path(&access, req.uri().path()) {
        AccessDecision::PathNotAllowed { path } => {
            return Ok(json_response(
                StatusCode::FORBIDDEN,
                access::path_not_allowed_body(&path),
            ));
        }
        _ => {}
    }

    match access::authorize(&access, req.headers(), req.uri().query()) {
        AccessDecision::Allow => {}
        _ => {
            let (status, headers, body) = access::unauthorized_body(access.mode == AccessMode::Basic);
            return Ok(json_response_with_headers(status, headers, body));
        }
    }

    match forward(req, &client, upstream_port, host.clone()).await {
        Ok(response) => Ok(response),
        Err(err) => {
            host.log(LogComponent::Origin, format!("proxy_error: {err}")).await;
            Ok(json_response(StatusCode::BAD_GATEWAY, json!({"error": "proxy_error"})))
        }
    }
}

async fn forward(
    req: Request<Body>,
    client: &Client<hyper::client::HttpConnector>,
    upstream_port: u16,
    host: Arc<dyn OriginHost>,
) -> anyhow::Result<Response<Body>> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://127.0.0.1:{upstream_port}{path_and_query}").parse()?;

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        if name == HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(HOST, format!("127.0.0.1:{upstream_port}"));
    let forwarded = builder.body(body)?;

    let upstream_resp = client.request(forwarded).await?;
    let status = upstream_resp.status();
    let mut response_builder = Response::builder().status(status);
    for (name, value) in upstream_resp.headers().iter() {
        response_builder = response_builder.header(name, value);
    }
    let counted = CountingBody {
        inner: upstream_resp.into_body(),
        sent: 0,
        host,
        recorded: false,
    };
    let response = response_builder.body(Body::wrap_stream(counted))?;
    Ok(response)
}

/// Wraps the upstream body stream so bytes reach the client as they arrive
/// (headers are committed before a single body byte is known) while still
/// tallying `stats.bytes_sent`/`stats.downloads`; the tally is recorded
/// once, from the stream's own completion, rather than by buffering the
/// whole body up front.
struct CountingBody {
    inner: Body,
    sent: u64,
    host: Arc<dyn OriginHost>,
    recorded: bool,
}

impl Stream for CountingBody {
    type Item = Result<Bytes, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                if !self.recorded {
                    self.recorded = true;
                    let host = self.host.clone();
                    let sent = self.sent;
                    tokio::spawn(async move { host.record_response(sent, false).await });
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    json_response_with_headers(status, Vec::new(), body)
}

fn json_response_with_headers(
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: serde_json::Value,
) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(HeaderName::from_static(name), value);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

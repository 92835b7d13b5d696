use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::Body;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::Server;
use hyper::StatusCode;
use hyper::header::HeaderName;
use hyper::header::HeaderValue;
use hyper::header::CONTENT_DISPOSITION;
use hyper::header::CONTENT_RANGE;
use hyper::header::CONTENT_TYPE;
use hyper::header::RANGE;
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
use crate::types::FilesMode;
use crate::types::LogComponent;
use crate::types::ManifestEntry;
use crate::types::Presentation;

use super::manifest::BUNDLE_ENTRY_NAME;
use super::manifest::BUNDLE_NAME;
use super::render;

const TEXT_LIKE_SUFFIXES: [&str; 2] = ["+json", "+xml"];
const TEXT_LIKE_EXACT: [&str; 4] = [
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-yaml",
];

/// Static file origin: the same hyper 0.14 server shape as the reverse
/// proxy, swapped from forward-to-upstream to serve-from-workspace.
pub struct StaticOrigin {
    shutdown_tx: oneshot::Sender<()>,
}

impl StaticOrigin {
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Clone)]
struct Shared {
    workspace_dir: Arc<Path>,
    manifest: Arc<Vec<ManifestEntry>>,
    files_mode: FilesMode,
    presentation: Presentation,
    title: Arc<str>,
}

pub async fn start_static_origin(
    addr: SocketAddr,
    workspace_dir: std::path::PathBuf,
    manifest: Vec<ManifestEntry>,
    files_mode: FilesMode,
    presentation: Presentation,
    title: String,
    host: Arc<dyn OriginHost>,
) -> Result<StaticOrigin> {
    let shared = Shared {
        workspace_dir: Arc::from(workspace_dir.into_boxed_path()),
        manifest: Arc::new(manifest),
        files_mode,
        presentation,
        title: Arc::from(title.into_boxed_str()),
    };

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let shared = shared.clone();
        let host = host.clone();
        let client_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, shared.clone(), host.clone(), client_addr)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| CfshareError::Internal(format!("failed to bind static origin: {e}")))?
        .serve(make_svc);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        if let Err(err) = graceful.await {
            warn!(error = %err, "static origin server error");
        }
    });

    Ok(StaticOrigin { shutdown_tx })
}

async fn handle_request(
    req: Request<Body>,
    shared: Shared,
    host: Arc<dyn OriginHost>,
    client_addr: SocketAddr,
) -> std::result::Result<Response<Body>, Infallible> {
    host.record_request().await;

    if !host.rate_limiter().check(client_addr.ip()) {
        return Ok(json_response(StatusCode::TOO_MANY_REQUESTS, json!({"error": "rate_limited"})));
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(json_response(StatusCode::METHOD_NOT_ALLOWED, json!({"error": "method_not_allowed"})));
    }
    let is_head = req.method() == Method::HEAD;

    let access = host.access();
    if let AccessDecision::PathNotAllowed { path } = access::check_path(&access, req.uri().path()) {
        return Ok(json_response(StatusCode::FORBIDDEN, access::path_not_allowed_body(&path)));
    }
    if !matches!(
        access::authorize(&access, req.headers(), req.uri().query()),
        AccessDecision::Allow
    ) {
        let (status, headers, body) = access::unauthorized_body(access.mode == AccessMode::Basic);
        return Ok(json_response_with_headers(status, headers, body));
    }

    let decoded_path = percent_encoding::percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .trim_start_matches('/')
        .to_string();

    let non_bundle: Vec<&ManifestEntry> = shared
        .manifest
        .iter()
        .filter(|e| e.name != BUNDLE_ENTRY_NAME)
        .collect();

    let selected: Option<&ManifestEntry> = if decoded_path.is_empty() {
        match shared.files_mode {
            FilesMode::Zip => {
                if non_bundle.len() == 1 {
                    Some(non_bundle[0])
                } else {
                    let body = render::render_zip_index(&shared.title, &shared.manifest);
                    return Ok(html_response(StatusCode::OK, body, is_head));
                }
            }
            FilesMode::Normal => {
                if non_bundle.len() == 1 && shared.presentation == Presentation::Preview {
                    Some(non_bundle[0])
                } else {
                    let body = render::render_explorer(&shared.title, &shared.manifest, shared.files_mode);
                    return Ok(html_response(StatusCode::OK, body, is_head));
                }
            }
        }
    } else {
        let candidate = shared.workspace_dir.join(&decoded_path);
        if !crate::util::path::is_sub_path(&candidate, &shared.workspace_dir) {
            return Ok(json_response(StatusCode::NOT_FOUND, json!({"error": "not_found"})));
        }
        shared.manifest.iter().find(|e| e.name == decoded_path)
    };

    let Some(entry) = selected else {
        return Ok(json_response(StatusCode::NOT_FOUND, json!({"error": "not_found"})));
    };

    let file_path = shared.workspace_dir.join(if entry.name == BUNDLE_ENTRY_NAME {
        BUNDLE_NAME.to_string()
    } else {
        entry.name.clone()
    });

    let is_markdown_preview = shared.presentation == Presentation::Preview
        && matches!(
            Path::new(&entry.name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase()),
            Some(ref ext) if ext == "md" || ext == "rmd" || ext == "qmd"
        );

    if is_markdown_preview {
        let contents = match tokio::fs::read_to_string(&file_path).await {
            Ok(c) => c,
            Err(err) => {
                host.log(LogComponent::Origin, format!("read_error {}: {err}", entry.name)).await;
                return Ok(json_response(StatusCode::NOT_FOUND, json!({"error": "not_found"})));
            }
        };
        let body = render::render_markdown(&contents);
        return Ok(html_response(StatusCode::OK, body, is_head));
    }

    serve_file(&file_path, entry, shared.presentation, req.headers().get(RANGE), is_head, host.as_ref()).await
}

async fn serve_file(
    file_path: &Path,
    entry: &ManifestEntry,
    presentation: Presentation,
    range_header: Option<&HeaderValue>,
    is_head: bool,
    host: &dyn OriginHost,
) -> std::result::Result<Response<Body>, Infallible> {
    let contents = match tokio::fs::read(file_path).await {
        Ok(c) => c,
        Err(err) => {
            host.log(LogComponent::Origin, format!("read_error {}: {err}", entry.name)).await;
            return Ok(json_response(StatusCode::NOT_FOUND, json!({"error": "not_found"})));
        }
    };
    let size = contents.len() as u64;

    let range = match parse_range(range_header, size) {
        RangeOutcome::Absent => None,
        RangeOutcome::Satisfiable(a, b) => Some((a, b)),
        RangeOutcome::NotSatisfiable => {
            return Ok(json_response(StatusCode::RANGE_NOT_SATISFIABLE, json!({"error": "invalid_range"})));
        }
    };

    let mime = mime_guess::from_path(&entry.name).first_or_octet_stream();
    let content_type = if presentation == Presentation::Raw && is_text_like(mime.essence_str()) {
        "text/plain; charset=utf-8".to_string()
    } else {
        mime.essence_str().to_string()
    };

    let (status, body_slice, content_range) = match range {
        Some((a, b)) => (
            StatusCode::PARTIAL_CONTENT,
            &contents[a as usize..=b as usize],
            Some(format!("bytes {a}-{b}/{size}")),
        ),
        None => (StatusCode::OK, &contents[..], None),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header("accept-ranges", "bytes")
        .header("cache-control", "no-store")
        .header("x-content-type-options", "nosniff");

    if let Some(range_value) = content_range {
        builder = builder.header(CONTENT_RANGE, range_value);
    }

    if presentation != Presentation::Raw {
        let kind = if presentation == Presentation::Preview { "inline" } else { "attachment" };
        builder = builder.header(CONTENT_DISPOSITION, content_disposition(kind, &file_name(&entry.name)));
    }

    let bytes_sent = body_slice.len() as u64;
    let body = if is_head { Body::empty() } else { Body::from(body_slice.to_vec()) };
    let response = builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()));

    if !is_head && (status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT) {
        host.record_response(bytes_sent, true).await;
    }

    Ok(response)
}

enum RangeOutcome {
    Absent,
    Satisfiable(u64, u64),
    NotSatisfiable,
}

fn parse_range(header: Option<&HeaderValue>, size: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Absent;
    };
    let Ok(value) = header.to_str() else {
        return RangeOutcome::NotSatisfiable;
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return RangeOutcome::NotSatisfiable;
    };
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::NotSatisfiable;
    };

    let start: u64 = if start_str.is_empty() { 0 } else {
        match start_str.parse() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::NotSatisfiable,
        }
    };
    let end: u64 = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        match end_str.parse() {
            Ok(v) => v,
            Err(_) => return RangeOutcome::NotSatisfiable,
        }
    };

    if size == 0 || start > end || end >= size {
        return RangeOutcome::NotSatisfiable;
    }
    RangeOutcome::Satisfiable(start, end)
}

fn is_text_like(mime: &str) -> bool {
    mime.starts_with("text/")
        || TEXT_LIKE_EXACT.contains(&mime)
        || TEXT_LIKE_SUFFIXES.iter().any(|suffix| mime.ends_with(suffix))
}

fn file_name(relative_path: &str) -> String {
    relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_string()
}

/// RFC 5987 `filename*` parameter; ASCII `filename` fallback is omitted
/// since every consuming client in this system is a modern browser/HTTP
/// client that understands `filename*`.
fn content_disposition(kind: &str, filename: &str) -> String {
    let encoded = percent_encoding::utf8_percent_encode(filename, percent_encoding::NON_ALPHANUMERIC);
    format!("{kind}; filename*=UTF-8''{encoded}")
}

fn html_response(status: StatusCode, body: Vec<u8>, is_head: bool) -> Response<Body> {
    let body = if is_head { Body::empty() } else { Body::from(body) };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_within_bounds_is_satisfiable() {
        match parse_range(Some(&HeaderValue::from_static("bytes=0-3")), 10) {
            RangeOutcome::Satisfiable(0, 3) => {}
            _ => panic!("expected satisfiable range"),
        }
    }

    #[test]
    fn range_open_ended_defaults_to_last_byte() {
        match parse_range(Some(&HeaderValue::from_static("bytes=5-")), 10) {
            RangeOutcome::Satisfiable(5, 9) => {}
            _ => panic!("expected satisfiable range"),
        }
    }

    #[test]
    fn range_out_of_bounds_is_not_satisfiable() {
        match parse_range(Some(&HeaderValue::from_static("bytes=0-20")), 10) {
            RangeOutcome::NotSatisfiable => {}
            _ => panic!("expected not satisfiable"),
        }
    }

    #[test]
    fn no_range_header_is_absent() {
        match parse_range(None, 10) {
            RangeOutcome::Absent => {}
            _ => panic!("expected absent"),
        }
    }

    #[test]
    fn text_like_detects_suffix_and_exact_types() {
        assert!(is_text_like("text/plain"));
        assert!(is_text_like("application/json"));
        assert!(is_text_like("application/ld+json"));
        assert!(!is_text_like("image/png"));
    }

    #[test]
    fn content_disposition_uses_rfc5987_form() {
        let header = content_disposition("attachment", "hello world.txt");
        assert!(header.starts_with("attachment; filename*=UTF-8''"));
        assert!(header.contains("hello%20world.txt"));
    }
}

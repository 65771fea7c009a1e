// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP control surface.
//
// A minimal HTTP/1.1 server on a tokio `TcpListener`, one request per
// connection (`Connection: close`):
//
//   GET    /health
//   GET    /printers
//   GET    /printers/{id}/queue          jobs held by the print subsystem
//   DELETE /printers/{id}/queue          clear it
//   DELETE /printers/{id}/queue/{job}    remove one of them
//   POST   /printers/{id}/enable | disable
//   GET    /jobs
//   GET    /jobs/{id}
//   POST   /jobs?printer=..&name=..&kind=..&copies=..   (body: the document)
//   DELETE /jobs/{id}
//
// Responses are JSON.  Errors are `{error, message, suggestion, ...}` with
// the status chosen by `status_for`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::human_errors::{humanize_error, humanize_message};
use edgeprint_core::types::{DuplexMode, JobId, PayloadKind, PrintJob, PrintOptions};

use crate::backend::PrintBackend;
use crate::dispatcher::{Dispatcher, SubmitRequest};

/// Upper bound on the request line plus headers.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub content_length: Option<usize>,
    pub body: Vec<u8>,
}

/// A JSON response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": code, "message": message.into() }),
        }
    }

    /// Error response for an engine error, with the plain-language hint.
    pub fn from_error(err: &EdgePrintError) -> Self {
        let human = humanize_error(err);
        Self {
            status: status_for(err),
            body: json!({
                "error": error_code(err),
                "message": human.message,
                "detail": err.to_string(),
                "suggestion": human.suggestion,
                "retriable": human.retriable,
            }),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = serde_json::to_vec(&self.body).unwrap_or_default();
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            reason(self.status),
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(&body);
        out
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &EdgePrintError) -> u16 {
    match err {
        EdgePrintError::PrinterNotFound(_)
        | EdgePrintError::JobNotFound(_)
        | EdgePrintError::RemoteJobNotFound { .. } => 404,
        EdgePrintError::AlreadyTerminal(_) | EdgePrintError::InvalidTransition { .. } => 409,
        EdgePrintError::PayloadTooLarge { .. } => 413,
        EdgePrintError::UnsupportedPayloadKind(_)
        | EdgePrintError::UnsupportedOption(_)
        | EdgePrintError::PayloadRejected(_) => 422,
        EdgePrintError::BackendUnavailable(_) | EdgePrintError::ShuttingDown => 503,
        EdgePrintError::DispatchTimeout { .. }
        | EdgePrintError::PayloadStorage(_)
        | EdgePrintError::Database(_)
        | EdgePrintError::Io(_)
        | EdgePrintError::Serialization(_)
        | EdgePrintError::Discovery(_)
        | EdgePrintError::Config(_)
        | EdgePrintError::ControlServer(_) => 500,
    }
}

fn error_code(err: &EdgePrintError) -> &'static str {
    match err {
        EdgePrintError::PrinterNotFound(_) => "printer_not_found",
        EdgePrintError::UnsupportedPayloadKind(_) => "unsupported_payload_kind",
        EdgePrintError::PayloadTooLarge { .. } => "payload_too_large",
        EdgePrintError::JobNotFound(_) => "job_not_found",
        EdgePrintError::RemoteJobNotFound { .. } => "remote_job_not_found",
        EdgePrintError::AlreadyTerminal(_) => "already_terminal",
        EdgePrintError::InvalidTransition { .. } => "invalid_transition",
        EdgePrintError::BackendUnavailable(_) => "backend_unavailable",
        EdgePrintError::UnsupportedOption(_) => "unsupported_option",
        EdgePrintError::PayloadRejected(_) => "payload_rejected",
        EdgePrintError::DispatchTimeout { .. } => "dispatch_timeout",
        EdgePrintError::PayloadStorage(_) => "payload_storage",
        EdgePrintError::Database(_) => "database",
        EdgePrintError::Io(_) => "io",
        EdgePrintError::Serialization(_) => "serialization",
        EdgePrintError::Discovery(_) => "discovery",
        EdgePrintError::Config(_) => "config",
        EdgePrintError::ControlServer(_) => "control_server",
        EdgePrintError::ShuttingDown => "shutting_down",
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// The control server.
pub struct ControlServer<B: PrintBackend> {
    dispatcher: Arc<Dispatcher<B>>,
    max_body: usize,
}

impl<B: PrintBackend> ControlServer<B> {
    pub fn new(dispatcher: Arc<Dispatcher<B>>, max_payload_bytes: u64) -> Self {
        Self {
            dispatcher,
            max_body: usize::try_from(max_payload_bytes).unwrap_or(usize::MAX),
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EdgePrintError::ControlServer(format!("bind {addr}: {e}")))?;
        if let Ok(local) = listener.local_addr() {
            info!(addr = %local, "control server listening");
        }
        Ok(listener)
    }

    /// Serve on `listener` until `shutdown` turns true.
    pub fn spawn(self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).accept_loop(listener, shutdown))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "control connection");
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                warn!(peer = %peer, error = %e, "control connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept control connection"),
                },
            }
        }
        debug!("control server accept loop stopped");
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let response = match read_request(&mut stream, self.max_body).await {
            Ok(request) => {
                let (method, path) = (request.method.clone(), request.path.clone());
                let response = self.handle(request).await;
                info!(
                    peer = %peer,
                    method = %method,
                    path = %path,
                    status = response.status,
                    "control request"
                );
                response
            }
            Err(response) => response,
        };
        send_response(&mut stream, &response).await
    }

    /// Route one request.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();
        let result = match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["health"]) => Ok(self.health()),
            ("GET", ["printers"]) => {
                serde_json::to_value(self.dispatcher.list_printers()).map(HttpResponse::ok).map_err(EdgePrintError::from)
            }
            ("GET", ["printers", printer, "queue"]) => self
                .dispatcher
                .printer_queue(printer)
                .await
                .and_then(|jobs| serde_json::to_value(jobs).map_err(EdgePrintError::from))
                .map(|jobs| HttpResponse::ok(json!({ "printer": printer, "jobs": jobs }))),
            ("DELETE", ["printers", printer, "queue"]) => self
                .dispatcher
                .clear_printer_queue(printer)
                .await
                .map(|()| HttpResponse::ok(json!({ "printer": printer, "cleared": true }))),
            ("DELETE", ["printers", printer, "queue", job]) => self
                .dispatcher
                .remove_printer_job(printer, job)
                .await
                .map(|()| HttpResponse::ok(json!({ "printer": printer, "removed": job }))),
            ("POST", ["printers", printer, action @ ("enable" | "disable")]) => {
                let enabled = *action == "enable";
                self.dispatcher
                    .set_printer_enabled(printer, enabled)
                    .await
                    .map(|()| HttpResponse::ok(json!({ "printer": printer, "enabled": enabled })))
            }
            ("GET", ["jobs"]) => Ok(HttpResponse::ok(Value::Array(
                self.dispatcher.jobs().iter().map(job_view).collect(),
            ))),
            ("GET", ["jobs", id]) => match parse_job_id(id) {
                Ok(id) => self.dispatcher.status(id).await.map(|job| HttpResponse::ok(job_view(&job))),
                Err(response) => return response,
            },
            ("POST", ["jobs"]) => match submit_request(&request) {
                Ok(submit) => self.dispatcher.submit(submit).await.map(|id| HttpResponse {
                    status: 201,
                    body: json!({ "id": id }),
                }),
                Err(response) => return response,
            },
            ("DELETE", ["jobs", id]) => match parse_job_id(id) {
                Ok(id) => self
                    .dispatcher
                    .cancel(id)
                    .await
                    .map(|outcome| HttpResponse::ok(json!({ "id": id, "outcome": outcome }))),
                Err(response) => return response,
            },
            (
                _,
                ["health"]
                | ["printers"]
                | ["printers", _, "queue"]
                | ["printers", _, "queue", _]
                | ["printers", _, "enable" | "disable"]
                | ["jobs"]
                | ["jobs", _],
            ) => {
                return HttpResponse::error(405, "method_not_allowed", format!("{} not allowed here", request.method));
            }
            _ => return HttpResponse::error(404, "not_found", format!("no route for {}", request.path)),
        };
        result.unwrap_or_else(|e| HttpResponse::from_error(&e))
    }

    fn health(&self) -> HttpResponse {
        let d = &self.dispatcher;
        HttpResponse::ok(json!({
            "status": if d.is_accepting() { "ok" } else { "draining" },
            "backend": d.backend().name(),
            "printers": d.registry().len(),
            "queued": d.queued_len(),
            "in_flight": d.in_flight_len(),
        }))
    }
}

/// A job as JSON, with the plain-language reading of its last error.
fn job_view(job: &PrintJob) -> Value {
    let mut value = serde_json::to_value(job).unwrap_or(Value::Null);
    if let (Some(error), Value::Object(map)) = (&job.last_error, &mut value) {
        let human = humanize_message(error);
        map.insert("hint".into(), json!({ "message": human.message, "suggestion": human.suggestion }));
    }
    value
}

fn parse_job_id(raw: &str) -> std::result::Result<JobId, HttpResponse> {
    raw.parse()
        .map(JobId)
        .map_err(|_| HttpResponse::error(400, "bad_request", format!("'{raw}' is not a job id")))
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::error(400, "bad_request", message)
}

/// Build a submission from the query string and body of `POST /jobs`.
pub fn submit_request(request: &HttpRequest) -> std::result::Result<SubmitRequest, HttpResponse> {
    let q = &request.query;
    let printer = q
        .get("printer")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("missing 'printer' parameter"))?
        .clone();

    let kind = match q.get("kind") {
        Some(raw) => Some(PayloadKind::parse(raw).ok_or_else(|| {
            HttpResponse::from_error(&EdgePrintError::UnsupportedPayloadKind(raw.clone()))
        })?),
        None => None,
    };

    let mut options = PrintOptions::default();
    if let Some(raw) = q.get("copies") {
        options.copies = raw
            .parse()
            .map_err(|_| bad_request(format!("copies '{raw}' is not a number")))?;
    }
    if let Some(raw) = q.get("color") {
        options.color = Some(parse_color(raw).ok_or_else(|| bad_request(format!("color '{raw}' not understood")))?);
    }
    if let Some(raw) = q.get("duplex") {
        options.duplex = Some(DuplexMode::parse(raw).ok_or_else(|| bad_request(format!("duplex '{raw}' not understood")))?);
    }
    options.paper_size = q.get("paper").cloned();
    options.media_type = q.get("media").cloned();
    options.resolution = q.get("resolution").cloned();
    if let Some(raw) = q.get("options") {
        for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad_request(format!("option '{pair}' is not key=value")))?;
            options.extra.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(SubmitRequest {
        printer,
        document_name: q.get("name").cloned().unwrap_or_default(),
        kind,
        bytes: request.body.clone(),
        options,
    })
}

fn parse_color(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "color" | "colour" => Some(true),
        "false" | "0" | "no" | "mono" | "monochrome" | "gray" | "grey" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Wire handling
// ---------------------------------------------------------------------------

/// Read one request.  An `Err` is the response to send instead.
async fn read_request(stream: &mut TcpStream, max_body: usize) -> std::result::Result<HttpRequest, HttpResponse> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(bad_request("request head too large"));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| bad_request(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(bad_request("connection closed before the request was complete"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut request = parse_head(&head).map_err(bad_request)?;
    let length = request.content_length.unwrap_or(0);
    if length > max_body {
        return Err(HttpResponse::from_error(&EdgePrintError::PayloadTooLarge {
            size: length as u64,
            limit: max_body as u64,
        }));
    }

    let mut body = buf.split_off(head_end + 4);
    if body.len() < length {
        let start = body.len();
        body.resize(length, 0);
        stream
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| bad_request(format!("body shorter than Content-Length: {e}")))?;
    }
    body.truncate(length);
    request.body = body;
    Ok(request)
}

/// Parse the request line and headers (everything before the blank line).
pub fn parse_head(head: &str) -> std::result::Result<HttpRequest, String> {
    let mut lines = head.lines();
    let request_line = lines.next().ok_or("empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or("missing method")?.to_ascii_uppercase();
    let target = parts.next().ok_or("missing request target")?;
    if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(format!("unsupported request line '{request_line}'"));
    }

    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("bad Content-Length '{}'", value.trim()))?,
            );
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, BTreeMap::new()),
    };

    Ok(HttpRequest {
        method,
        path: percent_decode(path),
        query,
        content_length,
        body: Vec::new(),
    })
}

/// `a=1&b=two%20words` → map; later duplicates win.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

/// Decode `%XX` escapes and `+` as space; malformed escapes stay literal.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn send_response(stream: &mut TcpStream, response: &HttpResponse) -> Result<()> {
    stream
        .write_all(&response.to_bytes())
        .await
        .map_err(|e| EdgePrintError::ControlServer(format!("write response: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| EdgePrintError::ControlServer(format!("flush: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprint_core::ServiceConfig;
    use edgeprint_core::types::PrinterMetadata;

    use crate::backend::RemoteJob;
    use crate::backend::fake::FakeBackend;
    use crate::document::samples::one_page_pdf;
    use crate::payload::PayloadStore;
    use crate::registry::PrinterRegistry;

    fn server_with(backend: Arc<FakeBackend>) -> (tempfile::TempDir, ControlServer<FakeBackend>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(PrinterRegistry::new());
        registry.on_discovered("Office", PrinterMetadata::new());
        registry.on_discovered("Front Desk", PrinterMetadata::new());
        let dispatcher = Dispatcher::new(
            ServiceConfig::default(),
            registry,
            backend,
            PayloadStore::open(dir.path()).expect("spool"),
            None,
        )
        .expect("dispatcher");
        (dir, ControlServer::new(Arc::new(dispatcher), 1024 * 1024))
    }

    fn server() -> (tempfile::TempDir, ControlServer<FakeBackend>) {
        server_with(Arc::new(FakeBackend::new()))
    }

    fn request(method: &str, target: &str, body: Vec<u8>) -> HttpRequest {
        let mut req = parse_head(&format!("{method} {target} HTTP/1.1\r\nHost: x")).expect("head");
        req.content_length = Some(body.len());
        req.body = body;
        req
    }

    #[test]
    fn head_parsed_with_query_and_length() {
        let req = parse_head(
            "POST /jobs?printer=Office%20Laser&copies=2&name=a+b.pdf HTTP/1.1\r\n\
             Host: localhost\r\n\
             content-length: 42",
        )
        .expect("parse");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/jobs");
        assert_eq!(req.query.get("printer").map(String::as_str), Some("Office Laser"));
        assert_eq!(req.query.get("name").map(String::as_str), Some("a b.pdf"));
        assert_eq!(req.content_length, Some(42));
    }

    #[test]
    fn malformed_heads_rejected() {
        assert!(parse_head("").is_err());
        assert!(parse_head("GET /health").is_err());
        assert!(parse_head("GET /health SPDY/3").is_err());
        assert!(parse_head("POST /jobs HTTP/1.1\r\nContent-Length: lots").is_err());
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%2Cb"), "a,b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("x+y"), "x y");
    }

    #[test]
    fn submit_options_from_query() {
        let req = request(
            "POST",
            "/jobs?printer=Office&kind=pdf&copies=3&color=mono&duplex=long-edge&paper=A4&options=fit-to-page=true,quality=high",
            b"%PDF".to_vec(),
        );
        let submit = submit_request(&req).expect("submit request");
        assert_eq!(submit.printer, "Office");
        assert_eq!(submit.kind, Some(PayloadKind::Pdf));
        assert_eq!(submit.options.copies, 3);
        assert_eq!(submit.options.color, Some(false));
        assert_eq!(submit.options.duplex, Some(DuplexMode::LongEdge));
        assert_eq!(submit.options.paper_size.as_deref(), Some("A4"));
        assert_eq!(submit.options.extra.get("quality").map(String::as_str), Some("high"));

        let missing = submit_request(&request("POST", "/jobs?copies=1", Vec::new()));
        assert_eq!(missing.expect_err("no printer").status, 400);
        let bad_kind = submit_request(&request("POST", "/jobs?printer=Office&kind=docx", Vec::new()));
        assert_eq!(bad_kind.expect_err("bad kind").status, 422);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&EdgePrintError::PrinterNotFound("x".into())), 404);
        assert_eq!(status_for(&EdgePrintError::AlreadyTerminal(JobId(1))), 409);
        assert_eq!(status_for(&EdgePrintError::PayloadTooLarge { size: 2, limit: 1 }), 413);
        assert_eq!(status_for(&EdgePrintError::UnsupportedOption("sides".into())), 422);
        assert_eq!(status_for(&EdgePrintError::ShuttingDown), 503);

        let response = HttpResponse::from_error(&EdgePrintError::JobNotFound(JobId(4)));
        assert_eq!(response.body["error"], "job_not_found");
        assert!(response.body["suggestion"].is_string());
        let bytes = String::from_utf8(response.to_bytes()).expect("utf8");
        assert!(bytes.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn routes_submit_status_and_cancel() {
        let (_dir, server) = server();

        let health = server.handle(request("GET", "/health", Vec::new())).await;
        assert_eq!(health.status, 200);
        assert_eq!(health.body["printers"], 2);

        let created = server
            .handle(request("POST", "/jobs?printer=Office&name=r.pdf", one_page_pdf()))
            .await;
        assert_eq!(created.status, 201);
        let id = created.body["id"].as_u64().expect("id");

        let status = server.handle(request("GET", &format!("/jobs/{id}"), Vec::new())).await;
        assert_eq!(status.status, 200);
        assert_eq!(status.body["state"], "queued");

        let cancelled = server.handle(request("DELETE", &format!("/jobs/{id}"), Vec::new())).await;
        assert_eq!(cancelled.body["outcome"], "cancelled");
        let again = server.handle(request("DELETE", &format!("/jobs/{id}"), Vec::new())).await;
        assert_eq!(again.status, 409);

        let listed = server.handle(request("GET", "/jobs", Vec::new())).await;
        assert_eq!(listed.body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn route_errors() {
        let (_dir, server) = server();
        let unknown = server
            .handle(request("POST", "/jobs?printer=Nowhere", one_page_pdf()))
            .await;
        assert_eq!(unknown.status, 404);
        assert_eq!(unknown.body["error"], "printer_not_found");

        assert_eq!(server.handle(request("GET", "/jobs/abc", Vec::new())).await.status, 400);
        assert_eq!(server.handle(request("GET", "/jobs/77", Vec::new())).await.status, 404);
        assert_eq!(server.handle(request("PUT", "/jobs", Vec::new())).await.status, 405);
        assert_eq!(server.handle(request("GET", "/nope", Vec::new())).await.status, 404);
    }

    #[tokio::test]
    async fn printer_queue_routes() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_queue(
            "Front Desk",
            vec![RemoteJob {
                id: "31".into(),
                owner: Some("bob".into()),
                document: Some("memo.pdf".into()),
                size_bytes: Some(4096),
                printing: true,
            }],
        );
        let (_dir, server) = server_with(Arc::clone(&backend));

        let listed = server
            .handle(request("GET", "/printers/Front%20Desk/queue", Vec::new()))
            .await;
        assert_eq!(listed.status, 200);
        assert_eq!(listed.body["printer"], "Front Desk");
        assert_eq!(listed.body["jobs"][0]["id"], "31");
        assert_eq!(listed.body["jobs"][0]["printing"], true);

        let paused = server
            .handle(request("POST", "/printers/Front%20Desk/disable", Vec::new()))
            .await;
        assert_eq!(paused.body["enabled"], false);
        assert_eq!(backend.is_enabled("Front Desk"), Some(false));
        server
            .handle(request("POST", "/printers/Front%20Desk/enable", Vec::new()))
            .await;
        assert_eq!(backend.is_enabled("Front Desk"), Some(true));

        let removed = server
            .handle(request("DELETE", "/printers/Front%20Desk/queue/31", Vec::new()))
            .await;
        assert_eq!(removed.status, 200);
        let gone = server
            .handle(request("DELETE", "/printers/Front%20Desk/queue/31", Vec::new()))
            .await;
        assert_eq!(gone.status, 404);
        assert_eq!(gone.body["error"], "remote_job_not_found");

        let cleared = server
            .handle(request("DELETE", "/printers/Office/queue", Vec::new()))
            .await;
        assert_eq!(cleared.body["cleared"], true);

        let unknown = server.handle(request("GET", "/printers/Nowhere/queue", Vec::new())).await;
        assert_eq!(unknown.status, 404);
        assert_eq!(
            server.handle(request("PUT", "/printers/Office/queue", Vec::new())).await.status,
            405
        );
        assert_eq!(
            server.handle(request("GET", "/printers/Office/enable", Vec::new())).await.status,
            405
        );
        assert_eq!(
            server.handle(request("POST", "/printers/Office/reboot", Vec::new())).await.status,
            404
        );
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let (_dir, server) = server();
        let listener = ControlServer::<FakeBackend>::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let handle = server.spawn(listener, rx);

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .expect("write");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.expect("read");
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("\"status\":\"ok\""));

        tx.send(true).expect("shutdown");
        handle.await.expect("server stops");
    }
}

//! The HTTP service: `readdataset`, `readblock`, `writeblock`, `readbox`
//! over plain HTTP/1.1.
//!
//! The service is a bounded threaded TCP server: one accept thread feeds
//! a bounded FIFO queue drained by a fixed set of workers. When the queue
//! is full the connection is answered `503 busy` immediately — that is
//! the backpressure surface, nothing ever piles up unbounded.
//!
//! Wire contract (all endpoints under `<base>/mod_visus`):
//!
//! | action       | verb | success | notes |
//! |--------------|------|---------|-------|
//! | readdataset  | GET  | 200 text/plain, the textual descriptor | 404 unknown name |
//! | readblock    | GET  | 200 octet-stream + `X-Compression`     | 404 hole, 416 out of range |
//! | writeblock   | POST | 200                                    | 403 writes disabled, 409 codec mismatch |
//! | readbox      | GET  | 200 octet-stream + `X-Dims`/`X-Dtype`, samples in hz order | 416 out of range |
//!
//! `Range: bytes=` is honored on every GET body; `Expect: 100-continue`
//! is answered before the POST body is read. A request carrying
//! `X-Client-Abort` gets a per-request abort token that trips when the
//! response can no longer be delivered.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::access::{DiskAccess, IoContext};
use crate::boxquery::{hz_gather, BoxQuery};
use crate::codec::{get_codec, CodecTag};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::query::{Aborted, BlockQuery, QueryStatus};
use crate::space::{BoxN, PointN};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub addr:        String,
    /// Prefix in front of `/mod_visus`; empty serves at the root.
    pub base_path:   String,
    pub writable:    bool,
    /// Worker threads = bounded concurrent connections.
    pub workers:     usize,
    /// Accepted-but-unserved connections; overflow answers 503.
    pub queue_depth: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            addr:        "127.0.0.1:0".into(),
            base_path:   String::new(),
            writable:    false,
            workers:     8,
            queue_depth: 64,
        }
    }
}

// ── NetService ───────────────────────────────────────────────────────────────

struct Served {
    dataset: Arc<Dataset>,
}

pub struct NetService {
    ctx:     Arc<IoContext>,
    config:  ServeConfig,
    catalog: HashMap<String, Served>,
}

impl NetService {
    pub fn new(ctx: &Arc<IoContext>, config: ServeConfig) -> NetService {
        NetService { ctx: Arc::clone(ctx), config, catalog: HashMap::new() }
    }

    /// Register a dataset under the name clients pass as `dataset=`.
    pub fn add_dataset(&mut self, name: &str, dataset: Arc<Dataset>) {
        self.ctx.registry.register(&dataset);
        self.catalog.insert(name.to_owned(), Served { dataset });
    }

    /// Bind and start serving; returns immediately with a handle.
    pub fn serve(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.addr)?;
        let addr = listener.local_addr()?;
        info!(%addr, datasets = self.catalog.len(), "net service listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let (conn_tx, conn_rx): (Sender<TcpStream>, Receiver<TcpStream>) =
            bounded(self.config.queue_depth);

        let shared = Arc::new(self);
        let mut workers = Vec::with_capacity(shared.config.workers);
        for i in 0..shared.config.workers {
            let rx = conn_rx.clone();
            let service = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("hzidx-net-{i}"))
                    .spawn(move || {
                        for stream in rx.iter() {
                            service.handle_connection(stream);
                        }
                    })
                    .expect("spawning a net worker"),
            );
        }

        let accept_shutdown = Arc::clone(&shutdown);
        let accept = std::thread::Builder::new()
            .name("hzidx-net-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    // Backpressure: a full queue answers busy at once
                    // rather than letting connections pile up.
                    if let Err(err) = conn_tx.try_send(stream) {
                        let crossbeam_channel::TrySendError::Full(mut stream) = err else {
                            break;
                        };
                        warn!("connection queue full, answering busy");
                        let _ = write_simple(&mut stream, 503, "busy");
                    }
                }
                drop(conn_tx);
            })
            .expect("spawning the accept thread");

        Ok(ServerHandle { addr, shutdown, accept: Some(accept), workers })
    }

    // ── Request handling ─────────────────────────────────────────────────────

    fn handle_connection(&self, mut stream: TcpStream) {
        let request = match read_request(&mut stream) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "dropping unreadable request");
                let _ = write_simple(&mut stream, 400, "bad request");
                return;
            }
        };

        let aborted = Aborted::new();
        let response = self.route(&request, &aborted);
        let range = request.byte_range();
        if write_response(&mut stream, response, range).is_err() {
            // The transport is gone; honour the cancellation hint.
            if request.header("x-client-abort").is_some() {
                aborted.set();
            }
        }
    }

    fn route(&self, request: &Request, aborted: &Aborted) -> Response {
        if request.path != format!("{}/mod_visus", self.config.base_path) {
            return Response::text(404, "not found");
        }
        let action = request.param("action").unwrap_or_default();
        let result = match (request.method.as_str(), action) {
            ("GET", "readdataset") => self.read_dataset(request),
            ("GET", "readblock") => self.read_block(request, aborted),
            ("POST", "writeblock") => self.write_block(request, aborted),
            ("GET", "readbox") => self.read_box(request, aborted),
            _ => return Response::text(400, "unknown action"),
        };
        result.unwrap_or_else(error_response)
    }

    fn served(&self, request: &Request) -> Result<&Served> {
        let name = request
            .param("dataset")
            .ok_or_else(|| Error::OutOfRange("missing dataset parameter".into()))?;
        self.catalog
            .get(name)
            .ok_or_else(|| Error::OutOfRange(format!("no dataset named {name:?}")))
    }

    fn read_dataset(&self, request: &Request) -> Result<Response> {
        match self.served(request) {
            Ok(served) => {
                Ok(Response::text(200, &served.dataset.header().to_text()))
            }
            Err(_) => Ok(Response::text(404, "no such dataset")),
        }
    }

    /// Parse the `(field, time, from, to)` block coordinates shared by
    /// readblock and writeblock; range errors surface as 416.
    fn block_coords(
        served: &Served,
        request: &Request,
    ) -> Result<(crate::header::Field, f64, u64, u64)> {
        let header = served.dataset.header();
        let field = match request.param("field") {
            Some(name) => header.field_by_name(name)?.clone(),
            None => header.default_field().clone(),
        };
        let time = match request.param("time") {
            Some(t) => t
                .parse::<f64>()
                .map_err(|_| Error::OutOfRange(format!("bad time {t:?}")))?,
            None => header.default_time(),
        };
        header.check_time(time)?;
        let from: u64 = request
            .param("from")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::OutOfRange("missing from".into()))?;
        let to: u64 = request
            .param("to")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::OutOfRange("missing to".into()))?;
        let bs = header.block_size();
        if from % bs != 0 || to != from + bs || from >= header.total_blocks() * bs {
            return Err(Error::OutOfRange(format!("hz range [{from}, {to}) is not a block")));
        }
        Ok((field, time, from, to))
    }

    fn read_block(&self, request: &Request, aborted: &Aborted) -> Result<Response> {
        let served = self.served(request)?;
        let (field, time, from, to) = Self::block_coords(served, request)?;
        let wire = request
            .param("compression")
            .and_then(CodecTag::from_name)
            .unwrap_or_else(|| field.codec());

        let access = DiskAccess::create(&self.ctx, &served.dataset);
        access.begin_read()?;
        let bq = BlockQuery::new(field, time, from, to, aborted.clone());
        let handle = access.read_block(bq);
        let bq = handle
            .wait()
            .ok_or_else(|| Error::Io(std::io::Error::other("i/o worker died")))?;
        access.end_read()?;

        match bq.status {
            QueryStatus::Ok if bq.was_hole => Ok(Response::text(404, "hole")),
            QueryStatus::Ok => {
                let block = from >> served.dataset.header().bitsperblock;
                let dims = served.dataset.block_samples(block).nsamples;
                let payload = get_codec(wire)
                    .map_err(Error::Codec)?
                    .encode(&bq.buffer, bq.field.dtype, &dims)
                    .map_err(Error::Codec)?;
                let mut response = Response::octets(payload);
                response.headers.push(("X-Compression".into(), wire.name().into()));
                Ok(response)
            }
            _ => Err(bq.error.unwrap_or(Error::NotFound)),
        }
    }

    fn write_block(&self, request: &Request, aborted: &Aborted) -> Result<Response> {
        if !self.config.writable {
            return Ok(Response::text(403, "writes are disabled"));
        }
        let served = self.served(request)?;
        let (field, time, from, to) = Self::block_coords(served, request)?;
        let wire = request
            .param("compression")
            .and_then(CodecTag::from_name)
            .unwrap_or_else(|| field.codec());

        // Decode the wire payload to samples, then store through the
        // access with the same codec the client chose.
        let block = from >> served.dataset.header().bitsperblock;
        let dims = served.dataset.block_samples(block).nsamples;
        let samples = get_codec(wire)
            .map_err(Error::Codec)?
            .decode(&request.body, field.dtype, &dims, aborted)
            .map_err(Error::Codec)?;

        let access = DiskAccess::create(&self.ctx, &served.dataset);
        access.begin_write()?;
        let mut bq = BlockQuery::new(field, time, from, to, aborted.clone());
        bq.codec = Some(wire);
        bq.buffer = samples;
        let handle = access.write_block(bq);
        let bq = handle
            .wait()
            .ok_or_else(|| Error::Io(std::io::Error::other("i/o worker died")))?;
        access.end_write()?;

        match bq.status {
            QueryStatus::Ok => Ok(Response::text(200, "ok")),
            _ => Err(bq.error.unwrap_or(Error::NotFound)),
        }
    }

    fn read_box(&self, request: &Request, aborted: &Aborted) -> Result<Response> {
        let served = self.served(request)?;
        let header = served.dataset.header();
        let field = match request.param("field") {
            Some(name) => header.field_by_name(name)?.clone(),
            None => header.default_field().clone(),
        };
        let time = match request.param("time") {
            Some(t) => t
                .parse::<f64>()
                .map_err(|_| Error::OutOfRange(format!("bad time {t:?}")))?,
            None => header.default_time(),
        };
        let resolution: u32 = request
            .param("res")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| header.max_h());

        let coords: Vec<i64> = request
            .param("box")
            .map(|s| s.split_whitespace().filter_map(|t| t.parse().ok()).collect())
            .unwrap_or_default();
        let pdim = header.bitmask.pdim();
        if coords.len() != 2 * pdim {
            return Err(Error::OutOfRange(format!(
                "box needs {} coordinates, got {}",
                2 * pdim,
                coords.len()
            )));
        }
        let mut p1 = PointN::zero(pdim);
        let mut p2 = PointN::zero(pdim);
        for i in 0..pdim {
            p1[i] = coords[2 * i];
            p2[i] = coords[2 * i + 1];
        }

        let access = DiskAccess::create(&self.ctx, &served.dataset);
        let mut q = BoxQuery::new(field, time, BoxN::new(p1, p2));
        q.aborted = aborted.clone();
        q.set_resolution_range(0, resolution);
        served.dataset.begin_box_query(&mut q)?;
        access.begin_read()?;
        let executed = served.dataset.execute_box_query(&access, &mut q);
        access.end_read()?;
        executed?;
        served.dataset.next_box_query(&mut q);

        let ls = *q
            .logic_samples()
            .ok_or_else(|| Error::OutOfRange("query produced no samples".into()))?;
        let dtype = q.field.dtype;
        let body = hz_gather(&served.dataset, &ls, q.buffer(), dtype.size());
        let dims = ls
            .nsamples
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let mut response = Response::octets(body);
        response.headers.push(("X-Dims".into(), dims));
        response.headers.push(("X-Dtype".into(), dtype.to_string()));
        Ok(response)
    }
}

// ── ServerHandle ─────────────────────────────────────────────────────────────

pub struct ServerHandle {
    addr:     SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept:   Option<JoinHandle<()>>,
    workers:  Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting, drain the workers, join everything.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Poke the accept loop out of its blocking accept.
        let _ = TcpStream::connect(self.addr);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

// ── HTTP plumbing ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Request {
    method:  String,
    path:    String,
    params:  Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body:    Vec<u8>,
}

impl Request {
    fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First range of a `Range: bytes=a-b` header.
    fn byte_range(&self) -> Option<(u64, Option<u64>)> {
        let spec = self.header("range")?.strip_prefix("bytes=")?;
        let first = spec.split(',').next()?.trim();
        let (a, b) = first.split_once('-')?;
        let start: u64 = a.parse().ok()?;
        let end: Option<u64> = if b.is_empty() { None } else { b.parse().ok() };
        Some((start, end))
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Request> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_owned(), q.to_owned()),
        None => (target, String::new()),
    };
    let params = query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            Some((percent_decode(k)?, percent_decode(v)?))
        })
        .collect();

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        reader.read_line(&mut header_line)?;
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.push((k.trim().to_owned(), v.trim().to_owned()));
        }
    }

    let mut request = Request { method, path, params, headers, body: Vec::new() };

    if request
        .header("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    }
    if let Some(n) = request.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        let mut body = vec![0u8; n];
        reader.read_exact(&mut body)?;
        request.body = body;
    }
    Ok(request)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let v = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
                out.push(v);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[derive(Debug)]
struct Response {
    status:       u16,
    content_type: &'static str,
    headers:      Vec<(String, String)>,
    body:         Vec<u8>,
}

impl Response {
    fn text(status: u16, body: &str) -> Response {
        Response {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn octets(body: Vec<u8>) -> Response {
        Response { status: 200, content_type: "application/octet-stream", headers: Vec::new(), body }
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::OutOfRange(_) | Error::UnknownTime(_) => 416,
        Error::UnknownField(_) => 400,
        Error::NotFound => 404,
        Error::Codec(_) => 409,
        Error::Busy => 503,
        _ => 500,
    };
    Response::text(status, &e.to_string())
}

fn write_response(
    stream: &mut TcpStream,
    mut response: Response,
    range: Option<(u64, Option<u64>)>,
) -> std::io::Result<()> {
    // Byte-range view of a successful body.
    if let (200, Some((start, end))) = (response.status, range) {
        let len = response.body.len() as u64;
        let end = end.map_or(len.saturating_sub(1), |e| e.min(len.saturating_sub(1)));
        if start >= len || start > end {
            response = Response::text(416, "range not satisfiable");
        } else {
            response.headers.push((
                "Content-Range".into(),
                format!("bytes {start}-{end}/{len}"),
            ));
            response.body = response.body[start as usize..=end as usize].to_vec();
            response.status = 206;
        }
    }

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\nAccept-Ranges: bytes\r\n",
        response.status,
        status_reason(response.status),
        response.content_type,
        response.body.len()
    );
    for (k, v) in &response.headers {
        head.push_str(k);
        head.push_str(": ");
        head.push_str(v);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn write_simple(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    write_response(stream, Response::text(status, body), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b+c").unwrap(), "a b c");
        assert_eq!(percent_decode("plain").unwrap(), "plain");
        assert!(percent_decode("bad%2").is_none());
    }

    #[test]
    fn range_parsing() {
        let r = Request {
            method: "GET".into(),
            path: "/".into(),
            params: vec![],
            headers: vec![("Range".into(), "bytes=2-5".into())],
            body: vec![],
        };
        assert_eq!(r.byte_range(), Some((2, Some(5))));
        let open = Request {
            headers: vec![("range".into(), "bytes=7-".into())],
            ..r
        };
        assert_eq!(open.byte_range(), Some((7, None)));
    }
}

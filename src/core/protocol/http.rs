//! HTTP document exchange
//!
//! Camera SOAP services and alert feeds are single request/response
//! exchanges over the link's TCP transport. The document bodies are opaque
//! here; they are published as [`DeviceUpdate::Document`].

use crate::core::comm::{
    CommError, DeviceUpdate, RecvStatus, Step, StepContext, StepKind, StepOutcome,
};
use crate::core::protocol::framing;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// SOAP 1.2 content type
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Fetch a document
    Get,
    /// Post a document
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Outbound HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Host header value
    pub host: String,
    /// Request path
    pub path: String,
    /// Content type of the body
    pub content_type: Option<String>,
    /// SOAPAction header
    pub soap_action: Option<String>,
    /// Request body
    pub body: String,
}

impl HttpRequest {
    /// GET request for a feed
    pub fn get(host: &str, path: &str) -> Self {
        Self {
            method: Method::Get,
            host: host.to_string(),
            path: path.to_string(),
            content_type: None,
            soap_action: None,
            body: String::new(),
        }
    }

    /// POST request carrying a SOAP envelope
    pub fn soap(host: &str, path: &str, action: &str, envelope: &str) -> Self {
        Self {
            method: Method::Post,
            host: host.to_string(),
            path: path.to_string(),
            content_type: Some(SOAP_CONTENT_TYPE.to_string()),
            soap_action: Some(action.to_string()),
            body: envelope.to_string(),
        }
    }

    /// Encode the request
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n",
            self.method, self.path, self.host
        );
        if let Some(ct) = &self.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        if let Some(action) = &self.soap_action {
            head.push_str(&format!("SOAPAction: \"{}\"\r\n", action));
        }
        if self.method == Method::Post || !self.body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");
        buf.put_slice(head.as_bytes());
        buf.put_slice(self.body.as_bytes());
    }
}

/// Most headers accepted in one response
const MAX_HEADERS: usize = 32;

/// How the end of a response body is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

/// Parsed HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Headers in received order
    pub headers: Vec<(String, String)>,
    /// Body text
    pub body: String,
}

impl HttpResponse {
    /// Look up a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Try to parse a complete response from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the whole message is buffered. Bodies are
    /// delimited by `Content-Length`, by chunked transfer coding, or when
    /// neither is given by the peer closing the connection, which the
    /// caller signals with `closed`.
    pub fn parse(buf: &mut BytesMut, closed: bool) -> Result<Option<Self>, CommError> {
        let (head_len, status, reason, headers) = {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut head = httparse::Response::new(&mut slots);
            let head_len = match head.parse(&buf[..]) {
                Ok(httparse::Status::Complete(len)) => len,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(e) => return Err(CommError::protocol(format!("bad response head: {}", e))),
            };
            let headers: Vec<(String, String)> = head
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect();
            (
                head_len,
                head.code.unwrap_or_default(),
                head.reason.unwrap_or_default().to_string(),
                headers,
            )
        };

        let rest = &buf[head_len..];
        let (body, consumed) = match body_framing(status, &headers)? {
            BodyFraming::Length(len) if rest.len() < len => return Ok(None),
            BodyFraming::Length(len) => (rest[..len].to_vec(), len),
            BodyFraming::Chunked => match decode_chunked(rest)? {
                Some(decoded) => decoded,
                None => return Ok(None),
            },
            BodyFraming::UntilClose if !closed => return Ok(None),
            BodyFraming::UntilClose => (rest.to_vec(), rest.len()),
        };
        let _ = buf.split_to(head_len + consumed);
        Ok(Some(Self {
            status,
            reason,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        }))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn body_framing(status: u16, headers: &[(String, String)]) -> Result<BodyFraming, CommError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyFraming::Length(0));
    }
    if let Some(coding) = find_header(headers, "Transfer-Encoding") {
        let chunked = coding
            .rsplit(',')
            .next()
            .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"));
        return Ok(if chunked {
            BodyFraming::Chunked
        } else {
            BodyFraming::UntilClose
        });
    }
    match find_header(headers, "Content-Length") {
        Some(value) => value
            .parse()
            .map(BodyFraming::Length)
            .map_err(|_| CommError::protocol(format!("bad Content-Length: {}", value))),
        None => Ok(BodyFraming::UntilClose),
    }
}

/// Decode a chunked body from the front of `data`.
///
/// Returns the body and the number of bytes it occupied, trailers included,
/// or `None` until the last chunk has arrived.
fn decode_chunked(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, CommError> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let (size_len, size) = match httparse::parse_chunk_size(&data[pos..]) {
            Ok(httparse::Status::Complete(found)) => found,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(CommError::protocol("bad chunk size")),
        };
        let start = pos + size_len;
        if size == 0 {
            // the size line's CRLF opens the trailer section
            let trailers = start.saturating_sub(2);
            return Ok(framing::find(&data[trailers..], framing::CRLF_CRLF)
                .map(|end| (body, trailers + end + framing::CRLF_CRLF.len())));
        }
        let end = usize::try_from(size)
            .ok()
            .and_then(|size| start.checked_add(size))
            .ok_or_else(|| CommError::protocol("chunk too large"))?;
        if data.len() < end + 2 {
            return Ok(None);
        }
        if &data[end..end + 2] != b"\r\n" {
            return Err(CommError::protocol("chunk not terminated"));
        }
        body.extend_from_slice(&data[start..end]);
        pos = end + 2;
    }
}

/// Time of the most recent successful feed fetch.
///
/// Written by any link, read by status displays; last writer wins.
#[derive(Debug, Default)]
pub struct LastFetch(AtomicI64);

impl LastFetch {
    /// Create an empty marker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fetch
    pub fn record(&self, time: DateTime<Utc>) {
        self.0.store(time.timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the most recent fetch, if any
    pub fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// Single-step HTTP exchange
#[derive(Debug)]
pub struct HttpStep {
    request: HttpRequest,
    last_fetch: Option<Arc<LastFetch>>,
    response: Option<HttpResponse>,
}

impl HttpStep {
    /// Exchange `request`
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            last_fetch: None,
            response: None,
        }
    }

    /// Record successful exchanges in `last_fetch`
    #[must_use]
    pub fn record_fetch(mut self, last_fetch: Arc<LastFetch>) -> Self {
        self.last_fetch = Some(last_fetch);
        self
    }

    /// Response, once received
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    fn accept(
        &mut self,
        ctx: &mut StepContext<'_>,
        response: Option<HttpResponse>,
    ) -> Result<RecvStatus, CommError> {
        let Some(response) = response else {
            return Ok(RecvStatus::Incomplete);
        };
        match response.status {
            200..=299 => {
                ctx.notify(DeviceUpdate::Document(response.body.clone()));
                if let Some(last) = &self.last_fetch {
                    last.record(Utc::now());
                }
                self.response = Some(response);
                Ok(RecvStatus::Complete)
            }
            500..=599 => Err(CommError::Busy(format!(
                "{} {}",
                response.status, response.reason
            ))),
            _ => Err(CommError::protocol(format!(
                "HTTP {} {}",
                response.status, response.reason
            ))),
        }
    }
}

impl Step for HttpStep {
    fn kind(&self) -> StepKind {
        StepKind::Poll
    }

    fn describe(&self) -> String {
        format!("{} {}", self.request.method, self.request.path)
    }

    fn poll(&mut self, _ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError> {
        self.response = None;
        self.request.encode(tx);
        Ok(())
    }

    fn recv(
        &mut self,
        ctx: &mut StepContext<'_>,
        rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        let response = HttpResponse::parse(rx, false)?;
        self.accept(ctx, response)
    }

    fn recv_closed(
        &mut self,
        ctx: &mut StepContext<'_>,
        rx: &mut BytesMut,
    ) -> Result<RecvStatus, CommError> {
        let response = HttpResponse::parse(rx, true)?;
        self.accept(ctx, response)
    }

    fn next(self) -> StepOutcome<Self> {
        if self.response.is_some() {
            StepOutcome::Done
        } else {
            StepOutcome::Continue(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comm::{Device, DeviceKind, ErrorClass, MessageIdCounter};
    use std::collections::VecDeque;

    #[test]
    fn test_encode_soap() {
        let req = HttpRequest::soap(
            "10.0.0.9",
            "/onvif/ptz_service",
            "http://www.onvif.org/ver20/ptz/wsdl/Stop",
            "<e/>",
        );
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("POST /onvif/ptz_service HTTP/1.1\r\nHost: 10.0.0.9\r\n"));
        assert!(text.contains("SOAPAction: \"http://www.onvif.org/ver20/ptz/wsdl/Stop\"\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n<e/>"));
    }

    #[test]
    fn test_encode_get_has_no_length() {
        let mut buf = BytesMut::new();
        HttpRequest::get("feeds.example", "/alerts").encode(&mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("GET /alerts HTTP/1.1\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_parse_waits_for_body() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n01234"[..]);
        assert!(HttpResponse::parse(&mut buf, false).unwrap().is_none());
        buf.extend_from_slice(b"56789extra");
        let resp = HttpResponse::parse(&mut buf, false).unwrap().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "0123456789");
        assert_eq!(resp.header("content-length"), Some("10"));
        assert_eq!(&buf[..], b"extra");
    }

    #[test]
    fn test_parse_chunked_body() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n<ale\r\n"[..],
        );
        assert!(HttpResponse::parse(&mut buf, false).unwrap().is_none());
        buf.extend_from_slice(b"5;ext=1\r\nrts/>\r\n0\r\n");
        assert!(HttpResponse::parse(&mut buf, false).unwrap().is_none());
        buf.extend_from_slice(b"Expires: never\r\n\r\nHTTP");
        let resp = HttpResponse::parse(&mut buf, false).unwrap().unwrap();
        assert_eq!(resp.body, "<alerts/>");
        assert_eq!(&buf[..], b"HTTP");
    }

    #[test]
    fn test_parse_bad_chunk_is_protocol_error() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabc\r\n"[..],
        );
        let err = HttpResponse::parse(&mut buf, false).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_parse_body_until_close() {
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\nServer: feed\r\n\r\n"[..]);
        assert!(HttpResponse::parse(&mut buf, false).unwrap().is_none());
        buf.extend_from_slice(b"<alerts/>");
        assert!(HttpResponse::parse(&mut buf, false).unwrap().is_none());
        let resp = HttpResponse::parse(&mut buf, true).unwrap().unwrap();
        assert_eq!(resp.body, "<alerts/>");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_no_content_needs_no_body() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\n\r\n"[..]);
        let resp = HttpResponse::parse(&mut buf, false).unwrap().unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_status_classes() {
        let device = Device::new(
            "A1",
            "cap1",
            DeviceKind::AlertFeed {
                host: "h".into(),
                path: "/".into(),
            },
        );
        let mut ids = MessageIdCounter::new();
        let mut stash = VecDeque::new();
        let last = Arc::new(LastFetch::new());
        let mut step = HttpStep::new(HttpRequest::get("h", "/")).record_fetch(last.clone());

        let mut ctx = StepContext::new(&device, &mut ids, &mut stash);
        let mut rx = BytesMut::from(&b"HTTP/1.1 503 Busy\r\nContent-Length: 0\r\n\r\n"[..]);
        let err = step.recv(&mut ctx, &mut rx).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        let mut rx = BytesMut::from(&b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"[..]);
        let err = step.recv(&mut ctx, &mut rx).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(last.get().is_none());

        let mut rx = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n<feed/>"[..]);
        assert_eq!(step.recv(&mut ctx, &mut rx).unwrap(), RecvStatus::Complete);
        assert_eq!(
            ctx.take_updates(),
            vec![DeviceUpdate::Document("<feed/>".into())]
        );
        assert!(last.get().is_some());
        assert!(matches!(step.next(), StepOutcome::Done));
    }
}

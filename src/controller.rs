//! Per-connection HTTP state machine: parse request -> checkout session ->
//! relay body -> forward response -> done.

use crate::{
    channel::{FileBufferedChannel, SinkResult},
    config::GroupOptions,
    error::{HttpErrorKind, PoolError},
    pool::Pool,
    process::SocketProtocol,
    spawner::Spawner,
};
use base64::Engine;
use memchr::memmem;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// HTTP version on the client-facing side. The crate only ever terminates
/// into a worker process, so only the two versions workers actually speak
/// need representing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// A parsed request line plus headers, derived from the incoming byte stream.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub keep_alive: bool,
}

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADER_COUNT: usize = 100;

/// Incrementally reads and parses a request line + headers off `stream`,
/// stopping as soon as the header section is complete (ending `\r\n\r\n`).
pub async fn parse_headers<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<ParsedRequest, HttpErrorKind> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = memmem::find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(HttpErrorKind::TooManyHeaders);
        }
        let n = stream.read(&mut chunk).await.map_err(HttpErrorKind::Io)?;
        if n == 0 {
            return Err(HttpErrorKind::InvalidHeader);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = &buf[..header_end - 2];
    let mut lines = head.split(|&b| b == b'\n').map(strip_cr);

    let request_line = lines.next().ok_or(HttpErrorKind::InvalidMethod)?;
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut connection: Option<String> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(HttpErrorKind::TooManyHeaders);
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(HttpErrorKind::InvalidHeader);
        };
        let name = simdutf8::basic::from_utf8(&line[..colon])
            .map_err(|_| HttpErrorKind::InvalidHeader)?
            .trim()
            .to_string();
        let value = simdutf8::basic::from_utf8(&line[colon + 1..])
            .map_err(|_| HttpErrorKind::InvalidHeader)?
            .trim()
            .to_string();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse().map_err(|_| HttpErrorKind::InvalidContentLength)?);
        } else if name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
        } else if name.eq_ignore_ascii_case("connection") {
            connection = Some(value.clone());
        }

        headers.push((name, value));
    }

    let keep_alive = match (&connection, version) {
        (Some(c), _) => c.eq_ignore_ascii_case("keep-alive"),
        (None, Version::Http11) => true,
        (None, Version::Http10) => false,
    };

    Ok(ParsedRequest {
        method,
        target,
        version,
        headers,
        content_length,
        chunked,
        keep_alive,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, Version), HttpErrorKind> {
    let text = simdutf8::basic::from_utf8(line).map_err(|_| HttpErrorKind::InvalidMethod)?;
    let mut parts = text.split(' ');
    let method = parts.next().ok_or(HttpErrorKind::InvalidMethod)?.to_string();
    let target = parts.next().ok_or(HttpErrorKind::InvalidUrl)?.to_string();
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::Http11,
        Some("HTTP/1.0") => Version::Http10,
        _ => return Err(HttpErrorKind::UnsupportedVersion),
    };
    Ok((method, target, version))
}

/// Splits `target` on the first `?` into `(path, query)`.
pub fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Builds the `session`-protocol wire frame: big-endian u32 length, then
/// NUL-terminated key/value pairs (all keys, then all values).
pub fn encode_session_request(
    req: &ParsedRequest,
    remote_addr: &str,
    remote_port: u16,
    connect_password: &str,
) -> Vec<u8> {
    let (path, query) = split_target(&req.target);

    let mut kv: Vec<(String, String)> = vec![
        ("REQUEST_URI".into(), req.target.clone()),
        ("PATH_INFO".into(), path.to_string()),
        ("SCRIPT_NAME".into(), String::new()),
        ("QUERY_STRING".into(), query.unwrap_or("").to_string()),
        ("REQUEST_METHOD".into(), req.method.clone()),
        ("SERVER_NAME".into(), "localhost".into()),
        ("SERVER_PORT".into(), "80".into()),
        ("SERVER_SOFTWARE".into(), "apppool".into()),
        (
            "SERVER_PROTOCOL".into(),
            match req.version {
                Version::Http11 => "HTTP/1.1".into(),
                Version::Http10 => "HTTP/1.0".into(),
            },
        ),
        ("REMOTE_ADDR".into(), remote_addr.to_string()),
        ("REMOTE_PORT".into(), remote_port.to_string()),
        (
            "PASSENGER_CONNECT_PASSWORD".into(),
            connect_password.to_string(),
        ),
    ];

    if let Some(len) = req.content_length {
        kv.push(("CONTENT_LENGTH".into(), len.to_string()));
    }

    for (name, value) in &req.headers {
        // header names containing anything but ASCII letter/digit/'-' are
        // dropped: mitigates header-name smuggling into the CGI env block.
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            continue;
        }
        let env_name = format!(
            "HTTP_{}",
            name.to_ascii_uppercase().replace('-', "_")
        );
        kv.push((env_name, value.clone()));
    }

    let mut body = Vec::new();
    for (k, _) in &kv {
        body.extend_from_slice(k.as_bytes());
        body.push(0);
    }
    for (_, v) in &kv {
        body.extend_from_slice(v.as_bytes());
        body.push(0);
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Builds the `http`-protocol wire request: plain HTTP/1.1 plus the
/// `!~Passenger-*` headers and a bundled, base64-encoded envvar block.
pub fn encode_http_request(
    req: &ParsedRequest,
    remote_addr: &str,
    envvars: &HashMap<String, String>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, req.target).as_bytes());

    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    out.extend_from_slice(b"X-Forwarded-Proto: http\r\n");
    out.extend_from_slice(format!("!~Passenger-Client-Address: {remote_addr}\r\n").as_bytes());

    let mut env_block = String::new();
    for (k, v) in envvars {
        env_block.push_str(k);
        env_block.push('=');
        env_block.push_str(v);
        env_block.push('\n');
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(env_block);
    out.extend_from_slice(format!("!~Passenger-Envvars: {encoded}\r\n").as_bytes());

    out.extend_from_slice(
        if req.keep_alive {
            b"Connection: upgrade\r\n\r\n"
        } else {
            b"Connection: close\r\n\r\n"
        },
    );
    out
}

/// Which half-close policy applies to the worker connection for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClosePolicy {
    /// Half-close as soon as the request body has been fully written.
    UponRequestBodyEnd,
    /// Keep the worker connection open for reuse; close it only if the next
    /// request on it hits an early read error.
    UponNextRequestEarlyReadError,
}

pub fn half_close_policy(req: &ParsedRequest, protocol: SocketProtocol) -> HalfClosePolicy {
    let has_body = req.content_length.unwrap_or(0) > 0 || req.chunked;
    if has_body || protocol == SocketProtocol::Session {
        HalfClosePolicy::UponRequestBodyEnd
    } else {
        HalfClosePolicy::UponNextRequestEarlyReadError
    }
}

/// Drives one request end to end: checks out a session from `pool`, relays
/// the body to the worker (buffering through a [`FileBufferedChannel`] when
/// `request_body_buffering` is requested), and streams the response back to
/// `client`.
pub async fn serve_one_request<C, W, Sp>(
    client: &mut C,
    group_options: GroupOptions,
    pool: &Pool<Sp>,
    request_body_buffering: bool,
    connect_password: &str,
    mut connect_worker: W,
) -> Result<(), PoolError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    Sp: Spawner + Send + Sync + 'static,
    W: FnMut(&str) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<tokio::net::TcpStream>> + Send>>,
{
    let req = parse_headers(client).await.map_err(|e| PoolError::ClientSocket {
        source: std::io::Error::other(e.to_string()),
    })?;

    let session = pool.async_get(group_options).await?;

    let wire = match session.protocol() {
        SocketProtocol::Session => {
            encode_session_request(&req, "0.0.0.0", 0, connect_password)
        }
        SocketProtocol::Http => encode_http_request(&req, "0.0.0.0", &HashMap::new()),
    };

    let address = session.address().to_string();
    let mut worker = connect_worker(&address)
        .await
        .map_err(|source| PoolError::AppSocketWrite {
            pid: 0,
            source,
        })?;

    worker
        .write_all(&wire)
        .await
        .map_err(|source| PoolError::AppSocketWrite { pid: 0, source })?;

    if request_body_buffering {
        let mut channel = FileBufferedChannel::new();
        relay_body_buffered(client, &req, &mut channel, &worker).await?;
    } else {
        relay_body_direct(client, &req, &mut worker).await?;
    }

    relay_response(&mut worker, client).await?;
    Ok(())
}

async fn relay_body_direct<C, W>(
    client: &mut C,
    req: &ParsedRequest,
    worker: &mut W,
) -> Result<(), PoolError>
where
    C: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(len) = req.content_length else {
        return Ok(());
    };
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let n = client
            .read(&mut buf[..remaining.min(8192)])
            .await
            .map_err(|source| PoolError::ClientSocket { source })?;
        if n == 0 {
            break;
        }
        worker
            .write_all(&buf[..n])
            .await
            .map_err(|source| PoolError::AppSocketWrite { pid: 0, source })?;
        remaining -= n;
    }
    Ok(())
}

async fn relay_body_buffered<C>(
    client: &mut C,
    req: &ParsedRequest,
    channel: &mut FileBufferedChannel,
    worker: &tokio::net::TcpStream,
) -> Result<(), PoolError>
where
    C: AsyncRead + Unpin,
{
    let Some(len) = req.content_length else {
        return Ok(());
    };
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let n = client
            .read(&mut buf[..remaining.min(8192)])
            .await
            .map_err(|source| PoolError::ClientSocket { source })?;
        if n == 0 {
            break;
        }
        channel
            .feed(buf[..n].to_vec())
            .map_err(PoolError::Channel)?;
        remaining -= n;
    }
    channel.feed(Vec::new()).map_err(PoolError::Channel)?;

    loop {
        worker
            .writable()
            .await
            .map_err(|source| PoolError::AppSocketWrite { pid: 0, source })?;
        // Pre-arms the sink's idle notification: `try_write` below can still
        // hit `WouldBlock` despite the readiness check above (a same-instant
        // race), in which case `pump_reader` awaits this permit instead of
        // some unrelated waker.
        channel.sink_idle_handle().notify_one();

        // `try_write` is non-blocking and callable from the sink's sync
        // closure, unlike `write_all`; a partial write reports itself back
        // as `NotAcceptingNow` so `pump_reader` only advances the channel's
        // read cursor past bytes the socket actually accepted. Any hard I/O
        // error is stashed here and propagated once the pump yields control.
        let mut write_err = None;
        let eof = channel
            .pump_reader(|chunk| match worker.try_write(chunk) {
                Ok(n) if n == chunk.len() => SinkResult::Accepted,
                Ok(_) => SinkResult::NotAcceptingNow,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    SinkResult::NotAcceptingNow
                }
                Err(e) => {
                    write_err = Some(e);
                    SinkResult::NotAcceptingNow
                }
            })
            .await
            .map_err(PoolError::Channel)?;

        if let Some(source) = write_err {
            return Err(PoolError::AppSocketWrite { pid: 0, source });
        }

        channel.pump_writer().await.map_err(PoolError::Channel)?;

        if eof {
            break;
        }
    }
    Ok(())
}

async fn relay_response<R, W>(worker: &mut R, client: &mut W) -> Result<(), PoolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = worker
            .read(&mut buf)
            .await
            .map_err(|source| PoolError::AppSocketRead { pid: 0, source })?;
        if n == 0 {
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(|source| PoolError::ClientSocket { source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET /foo?bar=1 HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let req = parse_headers(&mut cursor).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/foo?bar=1");
        assert_eq!(req.version, Version::Http11);
        assert!(req.keep_alive);
    }

    #[test]
    fn splits_target_without_query() {
        assert_eq!(split_target("/a/b"), ("/a/b", None));
    }

    #[test]
    fn half_close_for_session_protocol_is_immediate() {
        let req = ParsedRequest {
            method: "GET".into(),
            target: "/".into(),
            version: Version::Http11,
            headers: vec![],
            content_length: None,
            chunked: false,
            keep_alive: true,
        };
        assert_eq!(
            half_close_policy(&req, SocketProtocol::Session),
            HalfClosePolicy::UponRequestBodyEnd
        );
    }
}

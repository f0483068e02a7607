//! Reverse proxy adapter.
//!
//! Terminates TLS, resolves the HTTP Host header to a device service via
//! the directory, then pipes bytes through the device's tunnel. The
//! device-side stream is plaintext HTTP; concurrent connections to one
//! device ride independent SSH channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgetainer_core::{TunnelError, TunnelResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::directory::DeviceDirectory;
use crate::tls;
use crate::tunnel::{splice, TunnelServer};

const MAX_HEAD_LEN: usize = 16 * 1024;
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the proxy listener until the server shuts down.
pub async fn run_proxy_server(
    server: Arc<TunnelServer>,
    directory: Arc<dyn DeviceDirectory>,
) -> TunnelResult<()> {
    let Some(addr) = server.config.proxy_listen_addr() else {
        return Ok(());
    };
    let acceptor = match (&server.config.proxy_cert_path, &server.config.proxy_key_path) {
        (Some(cert), Some(key)) => Some(TlsAcceptor::from(tls::load_tls_config(cert, key)?)),
        _ => {
            warn!("Proxy TLS material not configured, serving plain HTTP");
            None
        }
    };
    let auth_token = server.config.proxy_auth_token.clone();
    let idle = Duration::from_secs(server.config.idle_timeout);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TunnelError::Config(format!("cannot bind proxy on {addr}: {e}")))?;
    info!(%addr, tls = acceptor.is_some(), "Reverse proxy listening");

    let token = server.cancellation_token();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&server);
                    let directory = Arc::clone(&directory);
                    let acceptor = acceptor.clone();
                    let auth_token = auth_token.clone();
                    tokio::spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    serve_client(tls_stream, peer, server, directory, auth_token, idle)
                                        .await;
                                }
                                Err(e) => {
                                    debug!(%peer, error = %e, "TLS handshake failed");
                                }
                            },
                            None => {
                                serve_client(stream, peer, server, directory, auth_token, idle).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept proxy connection");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    Ok(())
}

async fn serve_client<S>(
    mut stream: S,
    peer: SocketAddr,
    server: Arc<TunnelServer>,
    directory: Arc<dyn DeviceDirectory>,
    auth_token: Option<String>,
    idle: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = match read_request_head(&mut stream).await {
        Ok(Some(head)) => head,
        Ok(None) => return,
        Err(e) => {
            debug!(%peer, error = %e, "Failed to read request head");
            return;
        }
    };

    let Some(parsed) = parse_request_head(&head) else {
        let _ = write_http_response(&mut stream, 400, "malformed HTTP request").await;
        return;
    };
    let Some(host) = parsed.host else {
        let _ = write_http_response(&mut stream, 400, "missing Host header").await;
        return;
    };

    let Some(binding) = directory.resolve_host(&host) else {
        info!(%peer, host, "No device mapping for host");
        let _ = write_http_response(&mut stream, 404, "no device mapped for this host").await;
        return;
    };

    if binding.auth_required {
        let authorized = matches!(
            (&auth_token, &parsed.bearer),
            (Some(expected), Some(offered)) if expected == offered
        );
        if !authorized {
            info!(%peer, host, device_id = %binding.device_id, "Rejecting unauthenticated proxy request");
            let _ = write_http_response(&mut stream, 401, "authorization required").await;
            return;
        }
    }

    match server
        .open_device_stream(&binding.device_id, binding.container_port)
        .await
    {
        Ok(mut device) => {
            if device.write_all(&head).await.is_err() {
                let _ = write_http_response(&mut stream, 502, "device stream failed").await;
                return;
            }
            debug!(
                %peer,
                host,
                device_id = %binding.device_id,
                container_port = binding.container_port,
                "Proxying connection into device"
            );
            let _ = splice(&mut stream, &mut device, idle).await;
        }
        Err(e) => {
            info!(
                %peer,
                host,
                device_id = %binding.device_id,
                error = %e,
                "Cannot reach device"
            );
            let _ = write_http_response(&mut stream, e.http_status(), "device unreachable").await;
        }
    }
}

struct ParsedHead {
    host: Option<String>,
    bearer: Option<String>,
}

/// Read until the end of the HTTP request head, returning every byte read
/// so far (which may include the start of a body).
async fn read_request_head<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(HEAD_READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "request head timeout")
            })??;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_subsequence(&buf, b"\r\n\r\n").is_some() {
            return Ok(Some(buf));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

fn parse_request_head(raw: &[u8]) -> Option<ParsedHead> {
    let end = find_subsequence(raw, b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..end]).ok()?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.contains("HTTP/") {
        return None;
    }

    let mut host = None;
    let mut bearer = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("authorization") {
            bearer = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .map(|t| t.trim().to_string());
        }
    }
    Some(ParsedHead { host, bearer })
}

async fn write_http_response<S>(stream: &mut S, status: u16, body: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head_extracts_host_and_bearer() {
        let raw = b"GET /metrics HTTP/1.1\r\nHost: cam.example.com:443\r\nAuthorization: Bearer s3cret\r\n\r\n";
        let parsed = parse_request_head(raw).unwrap();
        assert_eq!(parsed.host.as_deref(), Some("cam.example.com:443"));
        assert_eq!(parsed.bearer.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_parse_head_without_auth() {
        let raw = b"GET / HTTP/1.1\r\nhost: dash.example.com\r\n\r\n";
        let parsed = parse_request_head(raw).unwrap();
        assert_eq!(parsed.host.as_deref(), Some("dash.example.com"));
        assert!(parsed.bearer.is_none());
    }

    #[test]
    fn test_parse_head_rejects_non_http() {
        assert!(parse_request_head(b"SSH-2.0-client\r\n\r\n").is_none());
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: x").is_none());
    }

    #[tokio::test]
    async fn test_read_request_head_spans_chunks() {
        let (mut client, mut server_side) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            client
                .write_all(b"POST /x HTTP/1.1\r\nHost: a\r\n\r\npartial-body")
                .await
                .unwrap();
            client
        });

        let head = read_request_head(&mut server_side).await.unwrap().unwrap();
        assert!(head.starts_with(b"POST /x HTTP/1.1\r\n"));
        assert!(find_subsequence(&head, b"\r\n\r\n").is_some());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let mut out = Vec::new();
        write_http_response(&mut out, 404, "no device mapped for this host")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 30"));
        assert!(text.ends_with("no device mapped for this host"));
    }
}

//! HTTP/1.0 request-line parsing, host/port/path extraction, and the fixed
//! header rewrite policy.

use crate::error::{ProxyError, ProxyResult};

/// The five headers a client may send that are always replaced by a fixed
/// proxy-supplied value, appended in this exact order after every header
/// that passed through unchanged (or was re-emitted as `Host:`).
const USER_AGENT_HDR: &str =
    "User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:10.0.3) Gecko/20120305 Firefox/10.0.3\r\n";
const ACCEPT_HDR: &str =
    "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n";
const ACCEPT_ENCODING_HDR: &str = "Accept-Encoding: gzip, deflate\r\n";
const CONNECTION_HDR: &str = "Connection: close\r\n";
const PROXY_CONNECTION_HDR: &str = "Proxy-Connection: close\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

/// `sscanf("%s %s %s", method, uri, version)`-equivalent: splits on
/// whitespace, rejecting lines with fewer or more than three fields.
pub fn parse_request_line(line: &str) -> Option<RequestLine> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split_whitespace();
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some(RequestLine {
        method,
        uri,
        version,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub hostname: String,
    pub port: u16,
}

/// Splits `host` at the first `:`. An absent `:` defaults to port 80; a
/// `:` present but parsing to `0` (or out of `u16` range) is rejected.
pub fn split_host_port(host: &str) -> Option<HostPort> {
    match host.split_once(':') {
        None => Some(HostPort {
            hostname: host.to_string(),
            port: 80,
        }),
        Some((hostname, port_str)) => {
            let port: u16 = port_str.parse().ok()?;
            if port == 0 {
                None
            } else {
                Some(HostPort {
                    hostname: hostname.to_string(),
                    port,
                })
            }
        }
    }
}

/// `(host, path)` from a request-line URI. `uri` may be absolute-form
/// (`http://host[:port]/path`) or origin-form (`host[:port]/path`, as sent
/// by a client talking directly to this proxy). `path` is empty when the
/// URI has no `/` after the host.
pub fn extract_host_and_path(uri: &str) -> (String, String) {
    let host_and_path = match uri.find("://") {
        Some(pos) => &uri[pos + 3..],
        None => uri,
    };
    match host_and_path.find('/') {
        Some(pos) => (
            host_and_path[..pos].to_string(),
            host_and_path[pos..].to_string(),
        ),
        None => (host_and_path.to_string(), String::new()),
    }
}

fn header_name_is(line: &str, name: &str) -> bool {
    let prefix_len = name.len();
    line.len() > prefix_len && line[..prefix_len].eq_ignore_ascii_case(name)
}

/// Parsed, rewritten request ready to forward to the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRequest {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub raw: String,
}

/// Reads header lines already split out by the caller, classifies each by
/// header name, and rewrites them per the fixed substitution policy: discard
/// User-Agent/Accept/Accept-Encoding/Connection/Proxy-Connection, keep
/// everything else, and append the five fixed proxy headers.
/// `uri_host`/`uri_path` are the host/path already extracted from the
/// request line; a `Host:` header, if present, overrides the effective
/// host/port.
pub fn rewrite_request(
    uri_path: &str,
    uri_host: &str,
    header_lines: &[String],
) -> ProxyResult<RewrittenRequest> {
    let mut effective_host = uri_host.to_string();
    let mut has_host_header = false;
    let mut kept_headers = String::new();
    let mut host_header_line = String::new();

    for line in header_lines {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if header_name_is(trimmed, "Host:") {
            has_host_header = true;
            host_header_line = format!("{line_no_crlf}\r\n", line_no_crlf = trimmed);
            if let Some(value) = trimmed.split_once(':').map(|x| x.1) {
                effective_host = value.trim().to_string();
            }
        } else if header_name_is(trimmed, "User-Agent:")
            || header_name_is(trimmed, "Accept:")
            || header_name_is(trimmed, "Accept-Encoding:")
            || header_name_is(trimmed, "Connection:")
            || header_name_is(trimmed, "Proxy-Connection:")
        {
            // Discarded: replaced below by the fixed proxy headers.
        } else if !trimmed.is_empty() {
            kept_headers.push_str(trimmed);
            kept_headers.push_str("\r\n");
        }
    }

    if !has_host_header && effective_host.is_empty() {
        return Err(ProxyError::MalformedHost);
    }

    let host_port = split_host_port(&effective_host).ok_or(ProxyError::MalformedHost)?;

    let mut raw = format!("GET {uri_path} HTTP/1.0\r\n");
    if has_host_header {
        raw.push_str(&host_header_line);
    } else {
        raw.push_str(&format!("Host: {effective_host}\r\n"));
    }
    raw.push_str(&kept_headers);
    raw.push_str(USER_AGENT_HDR);
    raw.push_str(ACCEPT_HDR);
    raw.push_str(ACCEPT_ENCODING_HDR);
    raw.push_str(CONNECTION_HDR);
    raw.push_str(PROXY_CONNECTION_HDR);
    raw.push_str("\r\n");

    Ok(RewrittenRequest {
        hostname: host_port.hostname,
        port: host_port.port,
        path: uri_path.to_string(),
        raw,
    })
}

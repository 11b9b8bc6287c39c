use crate::peek::PeekReader;
use spliceproxy_config::Config;
use std::io;
use tokio::io::AsyncRead;
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_HEADER_LEN: usize = 5;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const HOST_HEADER: &str = "host:";

#[derive(Debug)]
pub enum DetectError {
    /// Peer sent nothing, or closed before the detector had enough bytes
    NoContent,
    /// First byte on a TLS listener is not a handshake record
    NotTls,
    /// TLS record present but the ClientHello does not parse
    TlsParse(&'static str),
    /// Header scan reached the end of the headers without a Host line
    NoHttpHost,
    /// Header scan exhausted the configured byte budget
    ExceedBuffer,
    Io(io::Error),
}

impl std::fmt::Display for DetectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectError::NoContent => write!(f, "nothing received"),
            DetectError::NotTls => write!(f, "communication is not TLS"),
            DetectError::TlsParse(what) => write!(f, "invalid ClientHello: {}", what),
            DetectError::NoHttpHost => write!(f, "no Host header found in buffered HTTP header"),
            DetectError::ExceedBuffer => write!(f, "header scan exceeded peek buffer"),
            DetectError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for DetectError {}

impl From<io::Error> for DetectError {
    fn from(err: io::Error) -> Self {
        DetectError::Io(err)
    }
}

/// Detects the destination of a TLS connection from the ClientHello SNI.
///
/// Peeks exactly one TLS record and never consumes it; the record reaches
/// the upstream untouched. A well-formed ClientHello without SNI (ECH,
/// bare-IP clients) routes to the catch-all.
pub async fn https_destination<S>(
    id: &str,
    peek: &mut PeekReader<S>,
    port: &str,
    config: &Config,
) -> Result<(String, bool), DetectError>
where
    S: AsyncRead + Unpin,
{
    let hostname = {
        let header = peek.peek(TLS_HEADER_LEN).await?;
        if header.is_empty() {
            return Err(DetectError::NoContent);
        }
        if header[0] != TLS_HANDSHAKE {
            return Err(DetectError::NotTls);
        }
        if header.len() < TLS_HEADER_LEN {
            return Err(DetectError::NoContent);
        }
        // record length from bytes 3..5, version at 1..3 ignored
        let record_len = ((header[3] as usize) << 8) | (header[4] as usize);
        let record = peek.peek(TLS_HEADER_LEN + record_len).await?;
        if record.len() < TLS_HEADER_LEN + record_len {
            return Err(DetectError::NoContent);
        }
        parse_client_hello(record)?
    };
    debug!(id, hostname, "peeked TLS destination");
    Ok(config.route(id, &hostname, port, true))
}

/// Extracts the SNI host_name from a complete TLS ClientHello record.
///
/// `record` starts at the record header (the 0x16 byte). Returns an empty
/// string for a well-formed ClientHello that carries no server_name
/// extension.
pub fn parse_client_hello(record: &[u8]) -> Result<String, DetectError> {
    if record.len() < TLS_HEADER_LEN + 4 {
        return Err(DetectError::TlsParse("record truncated"));
    }

    let handshake_start = TLS_HEADER_LEN;
    if record[handshake_start] != CLIENT_HELLO {
        return Err(DetectError::TlsParse("not a ClientHello"));
    }

    let handshake_len = ((record[handshake_start + 1] as usize) << 16)
        | ((record[handshake_start + 2] as usize) << 8)
        | (record[handshake_start + 3] as usize);
    if record.len() < handshake_start + 4 + handshake_len {
        return Err(DetectError::TlsParse("handshake truncated"));
    }

    // client_version (2) + random (32)
    let mut pos = handshake_start + 4 + 2 + 32;

    if record.len() < pos + 1 {
        return Err(DetectError::TlsParse("session id truncated"));
    }
    let session_id_len = record[pos] as usize;
    pos += 1 + session_id_len;

    if record.len() < pos + 2 {
        return Err(DetectError::TlsParse("cipher suites truncated"));
    }
    let cipher_suites_len = ((record[pos] as usize) << 8) | (record[pos + 1] as usize);
    pos += 2 + cipher_suites_len;

    if record.len() < pos + 1 {
        return Err(DetectError::TlsParse("compression methods truncated"));
    }
    let compression_len = record[pos] as usize;
    pos += 1 + compression_len;

    if record.len() < pos + 2 {
        // Legacy ClientHello without extensions
        return Ok(String::new());
    }
    let extensions_len = ((record[pos] as usize) << 8) | (record[pos + 1] as usize);
    pos += 2;
    if record.len() < pos + extensions_len {
        return Err(DetectError::TlsParse("extensions truncated"));
    }

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end {
        let ext_type = ((record[pos] as u16) << 8) | (record[pos + 1] as u16);
        let ext_len = ((record[pos + 2] as usize) << 8) | (record[pos + 3] as usize);
        pos += 4;
        if pos + ext_len > extensions_end {
            return Err(DetectError::TlsParse("extension truncated"));
        }

        if ext_type != SNI_EXTENSION {
            pos += ext_len;
            continue;
        }

        if ext_len < 2 {
            return Err(DetectError::TlsParse("server_name list truncated"));
        }
        let list_end = pos + ext_len;
        pos += 2;
        while pos + 3 <= list_end {
            let name_type = record[pos];
            let name_len = ((record[pos + 1] as usize) << 8) | (record[pos + 2] as usize);
            pos += 3;
            if pos + name_len > list_end {
                return Err(DetectError::TlsParse("server_name truncated"));
            }
            if name_type == 0 {
                // host_name
                return match std::str::from_utf8(&record[pos..pos + name_len]) {
                    Ok(s) => Ok(s.to_string()),
                    Err(_) => Err(DetectError::TlsParse("server_name is not UTF-8")),
                };
            }
            pos += name_len;
        }
        return Ok(String::new());
    }

    Ok(String::new())
}

/// Detects the destination of a plaintext connection from the Host header.
///
/// Scans CRLF-delimited header lines through the peek window without ever
/// consuming a byte, bounded by the configured buffer budget.
pub async fn http_destination<S>(
    id: &str,
    peek: &mut PeekReader<S>,
    port: &str,
    config: &Config,
) -> Result<(String, bool), DetectError>
where
    S: AsyncRead + Unpin,
{
    let hostname = peek_host(peek, config.buffer).await?;
    debug!(id, hostname, "peeked HTTP destination");
    Ok(config.route(id, &hostname, port, false))
}

async fn peek_host<S>(peek: &mut PeekReader<S>, budget: usize) -> Result<String, DetectError>
where
    S: AsyncRead + Unpin,
{
    let mut start = 0usize;
    let mut index = 1usize;
    loop {
        let line = peek_line(peek, &mut start, &mut index, budget).await?;
        if line.is_empty() {
            // blank line between headers and body
            return Err(DetectError::NoHttpHost);
        }
        if line.len() > HOST_HEADER.len()
            && line[..HOST_HEADER.len()].eq_ignore_ascii_case(HOST_HEADER)
        {
            return Ok(line[HOST_HEADER.len()..].trim().to_string());
        }
    }
}

/// Returns the next header line from the peek window.
///
/// `start` and `index` are byte offsets into the window; on return they
/// point past the consumed delimiter so the next call continues where this
/// one stopped.
async fn peek_line<S>(
    peek: &mut PeekReader<S>,
    start: &mut usize,
    index: &mut usize,
    budget: usize,
) -> Result<String, DetectError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if *index > budget {
            return Err(DetectError::ExceedBuffer);
        }
        let buff = peek.peek(*index).await?;
        if buff.len() < *index {
            return Err(DetectError::NoContent);
        }
        let last = buff[*index - 1];
        if last == b'\r' || last == b'\n' {
            let line = String::from_utf8_lossy(&buff[*start..*index - 1]).into_owned();
            // a CR is followed by a LF worth skipping
            let skip = if last == b'\r' { 1 } else { 0 };
            *start = *index + skip;
            *index = *start + 1;
            return Ok(line);
        }
        *index += 1;
    }
}

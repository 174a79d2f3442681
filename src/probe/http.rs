use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{PortClassification, ProbeError, ProbeResult};

const MAX_HEAD_BYTES: usize = 16 * 1024;

pub(super) async fn probe(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    path: &str,
    server_token: &str,
) -> ProbeResult<PortClassification> {
    let request = format!(
        "GET {path} HTTP/1.0\r\nHost: {host}:{port}\r\nUser-Agent: bundlectl\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    let head = read_head(stream).await?;
    Ok(classify_head(&head, server_token))
}

async fn read_head(stream: &mut TcpStream) -> ProbeResult<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        // Not an HTTP peer: no point waiting for a header terminator.
        if buffer.contains(&b'\n') && !buffer.starts_with(b"HTTP/") {
            break;
        }
        if buffer.len() >= MAX_HEAD_BYTES {
            break;
        }
    }
    if buffer.is_empty() {
        return Err(ProbeError::Protocol("empty HTTP response".to_string()));
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Classify a response head by its `Server:` header.
pub(super) fn classify_head(head: &str, server_token: &str) -> PortClassification {
    let mut lines = head.lines();
    let status = lines.next().unwrap_or_default().trim();
    if !status.starts_with("HTTP/") {
        return PortClassification::UsedByOther {
            banner: Some(status.to_string()).filter(|line| !line.is_empty()),
        };
    }

    let server = lines
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("server"))
        .map(|(_, value)| value.trim().to_string());

    let Some(server) = server else {
        return PortClassification::UsedByOther { banner: None };
    };

    if !server
        .to_ascii_lowercase()
        .contains(&server_token.to_ascii_lowercase())
    {
        return PortClassification::UsedByOther {
            banner: Some(server),
        };
    }

    PortClassification::UsedBySelf {
        version: product_version(&server, server_token),
    }
}

fn product_version(server: &str, token: &str) -> Option<String> {
    let lower = server.to_ascii_lowercase();
    let start = lower.find(&format!("{}/", token.to_ascii_lowercase()))? + token.len() + 1;
    let version = server[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '.')
        .collect::<String>();
    Some(version).filter(|version| !version.is_empty())
}

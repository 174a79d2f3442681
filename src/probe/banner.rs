use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    net::TcpStream,
};

use super::{BannerMatch, PortClassification, ProbeError, ProbeResult};

const MAX_LINE_BYTES: u64 = 1024;

/// First line the peer sends, without its line terminator.
pub(super) async fn read_first_line(stream: &mut TcpStream) -> ProbeResult<String> {
    let mut reader = BufReader::new((&mut *stream).take(MAX_LINE_BYTES));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    if line.is_empty() {
        return Err(ProbeError::Protocol(
            "peer closed the connection without a banner".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&line)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

pub(super) async fn probe(
    stream: &mut TcpStream,
    matcher: BannerMatch,
) -> ProbeResult<PortClassification> {
    let line = read_first_line(stream).await?;
    Ok(classify_line(&line, matcher))
}

fn classify_line(line: &str, matcher: BannerMatch) -> PortClassification {
    if matcher.matches(line) {
        PortClassification::UsedBySelf { version: None }
    } else {
        PortClassification::UsedByOther {
            banner: Some(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filezilla_requires_exact_greeting() {
        let matcher = BannerMatch::Equals("220 FileZilla Server");
        assert_eq!(
            classify_line("220 FileZilla Server", matcher),
            PortClassification::UsedBySelf { version: None }
        );
        assert!(matches!(
            classify_line("220 FileZilla Server 1.8", matcher),
            PortClassification::UsedByOther { .. }
        ));
    }

    #[test]
    fn svn_greeting_prefix() {
        let matcher = BannerMatch::StartsWith("( success (");
        assert!(matches!(
            classify_line("( success ( 2 2 ( ) ( edit-pipeline svndiff1 ) ) )", matcher),
            PortClassification::UsedBySelf { .. }
        ));
    }
}

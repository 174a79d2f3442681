use tokio::{io::AsyncWriteExt, net::TcpStream};

use super::{PortClassification, ProbeResult, banner::read_first_line};

pub(super) async fn probe(stream: &mut TcpStream) -> ProbeResult<PortClassification> {
    stream.write_all(b"version\r\n").await?;
    let line = read_first_line(stream).await?;
    Ok(match line.strip_prefix("VERSION ") {
        Some(version) => PortClassification::UsedBySelf {
            version: Some(version.trim().to_string()),
        },
        None => PortClassification::UsedByOther { banner: Some(line) },
    })
}

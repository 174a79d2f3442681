//! Just enough of the MySQL client/server protocol to authenticate, read
//! `version` / `version_comment` and change an account password.

use rsa::{Oaep, RsaPublicKey, pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{Credentials, PortClassification, ProbeError, ProbeResult};

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;
const MAX_PACKET_BYTES: usize = 1 << 20;
const UTF8_GENERAL_CI: u8 = 33;
const MAX_AUTH_ROUNDS: usize = 6;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

const VERSION_QUERY: &str = "SHOW VARIABLES LIKE 'version%'";

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;

// caching_sha2_password continuation bytes
const FAST_AUTH_OK: u8 = 0x03;
const FULL_AUTH_NEEDED: u8 = 0x04;
const REQUEST_PUBLIC_KEY: u8 = 0x02;

const DEFAULT_USER: &str = "root";

pub(super) async fn probe(
    stream: &mut TcpStream,
    product: &str,
    credentials: Option<&Credentials>,
) -> ProbeResult<PortClassification> {
    let (user, password) = match credentials {
        Some(credentials) => (credentials.user.as_str(), credentials.password.as_str()),
        None => (DEFAULT_USER, ""),
    };
    if !login(stream, user, password).await? {
        return Ok(PortClassification::UsedByOther { banner: None });
    }

    let variables = query(stream, VERSION_QUERY)
        .await?
        .into_iter()
        .filter_map(|mut row| {
            let value = row.pop()??;
            let name = row.pop()??;
            Some((name, value))
        })
        .collect::<Vec<_>>();
    quit(stream).await;
    Ok(identify(&variables, product))
}

/// Log in as `current`, set the password of every `target.user` account
/// and flush privileges.
pub(super) async fn change_password(
    stream: &mut TcpStream,
    current: &Credentials,
    target: &Credentials,
) -> ProbeResult<()> {
    if !login(stream, &current.user, &current.password).await? {
        return Err(ProbeError::Refused(format!(
            "login as '{}' was rejected",
            current.user
        )));
    }

    let user = quote(&target.user);
    let hosts = query(stream, &format!("SELECT Host FROM mysql.user WHERE User = {user}"))
        .await?
        .into_iter()
        .filter_map(|mut row| row.pop().flatten())
        .collect::<Vec<_>>();
    if hosts.is_empty() {
        return Err(ProbeError::Refused(format!("no account named '{}'", target.user)));
    }
    let password = quote(&target.password);
    for host in &hosts {
        query(
            stream,
            &format!("ALTER USER {user}@{} IDENTIFIED BY {password}", quote(host)),
        )
        .await?;
    }
    query(stream, "FLUSH PRIVILEGES").await?;
    quit(stream).await;
    tracing::debug!(user = %target.user, hosts = hosts.len(), "mysql password changed");
    Ok(())
}

async fn login(stream: &mut TcpStream, user: &str, password: &str) -> ProbeResult<bool> {
    let greeting = read_packet(stream, MAX_HANDSHAKE_BYTES).await?;
    let handshake = parse_handshake(&greeting.payload)?;
    tracing::debug!(server_version = %handshake.server_version, "mysql handshake received");
    authenticate(stream, &handshake, user, password).await
}

async fn quit(stream: &mut TcpStream) {
    let _ = write_packet(stream, 0, &[COM_QUIT]).await;
}

/// String literal for the default `sql_mode`.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

struct Packet {
    seq: u8,
    payload: Vec<u8>,
}

async fn read_packet(stream: &mut TcpStream, limit: usize) -> ProbeResult<Packet> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    if len > limit {
        return Err(ProbeError::Protocol(format!(
            "packet of {len} bytes exceeds {limit}"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Packet {
        seq: header[3],
        payload,
    })
}

async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) -> ProbeResult<()> {
    let len = (payload.len() as u32).to_le_bytes();
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&[len[0], len[1], len[2], seq]);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> ProbeResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProbeError::Protocol("truncated packet".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ProbeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn nul_terminated(&mut self) -> ProbeResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|byte| *byte == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(&rest[..end])
            }
            None => {
                self.pos = self.buf.len();
                Ok(rest)
            }
        }
    }

    fn lenenc_int(&mut self) -> ProbeResult<Option<u64>> {
        let first = self.u8()?;
        let value = match first {
            0xfb => return Ok(None),
            0xfc => u64::from(u16::from_le_bytes([self.u8()?, self.u8()?])),
            0xfd => u64::from_le_bytes([self.u8()?, self.u8()?, self.u8()?, 0, 0, 0, 0, 0]),
            0xfe => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_le_bytes(raw)
            }
            value => u64::from(value),
        };
        Ok(Some(value))
    }

    fn lenenc_string(&mut self) -> ProbeResult<Option<String>> {
        match self.lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let bytes = self.take(len as usize)?;
                Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
            }
        }
    }
}

#[derive(Debug)]
struct Handshake {
    server_version: String,
    nonce: Vec<u8>,
    plugin: String,
}

fn parse_handshake(payload: &[u8]) -> ProbeResult<Handshake> {
    let mut cursor = Cursor::new(payload);
    match cursor.u8()? {
        10 => {}
        0xff => return Err(ProbeError::Protocol(error_message(payload))),
        other => {
            return Err(ProbeError::Protocol(format!(
                "unsupported handshake protocol {other}"
            )));
        }
    }

    let server_version = String::from_utf8_lossy(cursor.nul_terminated()?).into_owned();
    cursor.take(4)?;
    let mut nonce = cursor.take(8)?.to_vec();
    cursor.take(1)?;
    let capabilities_low = u16::from_le_bytes([cursor.u8()?, cursor.u8()?]);
    let mut plugin = String::new();

    if cursor.remaining() > 0 {
        cursor.take(3)?;
        let capabilities_high = u16::from_le_bytes([cursor.u8()?, cursor.u8()?]);
        let capabilities =
            u32::from(capabilities_low) | (u32::from(capabilities_high) << 16);
        let auth_data_len = cursor.u8()? as usize;
        cursor.take(10)?;
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part_len = auth_data_len.saturating_sub(8).max(13).min(cursor.remaining());
            let part = cursor.take(part_len)?;
            nonce.extend_from_slice(part.strip_suffix(&[0]).unwrap_or(part));
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            plugin = String::from_utf8_lossy(cursor.nul_terminated()?).into_owned();
        }
    }

    Ok(Handshake {
        server_version,
        nonce,
        plugin,
    })
}

fn error_message(payload: &[u8]) -> String {
    // 0xff, 2-byte code, optional '#' + 5-byte sql state, message
    let body = payload.get(3..).unwrap_or_default();
    let body = match body.first() {
        Some(b'#') => body.get(6..).unwrap_or_default(),
        _ => body,
    };
    String::from_utf8_lossy(body).into_owned()
}

fn scramble(plugin: &str, password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    match plugin {
        CACHING_SHA2_PASSWORD => scramble_caching_sha2(password.as_bytes(), nonce),
        _ => scramble_native(password.as_bytes(), nonce),
    }
}

/// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
fn scramble_native(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let token = hasher.finalize();
    stage1
        .iter()
        .zip(token.iter())
        .map(|(left, right)| left ^ right)
        .collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
fn scramble_caching_sha2(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    let token = hasher.finalize();
    stage1
        .iter()
        .zip(token.iter())
        .map(|(left, right)| left ^ right)
        .collect()
}

fn handshake_response(user: &str, plugin: &str, auth: &[u8]) -> Vec<u8> {
    let capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
    let mut payload = Vec::with_capacity(64 + user.len() + auth.len());
    payload.extend_from_slice(&capabilities.to_le_bytes());
    payload.extend_from_slice(&(MAX_PACKET_BYTES as u32).to_le_bytes());
    payload.push(UTF8_GENERAL_CI);
    payload.extend_from_slice(&[0u8; 23]);
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.push(auth.len() as u8);
    payload.extend_from_slice(auth);
    payload.extend_from_slice(plugin.as_bytes());
    payload.push(0);
    payload
}

async fn authenticate(
    stream: &mut TcpStream,
    handshake: &Handshake,
    user: &str,
    password: &str,
) -> ProbeResult<bool> {
    let mut plugin = if handshake.plugin.is_empty() {
        NATIVE_PASSWORD.to_string()
    } else {
        handshake.plugin.clone()
    };
    let mut nonce = handshake.nonce.clone();
    let auth = scramble(&plugin, password, &nonce);
    write_packet(stream, 1, &handshake_response(user, &plugin, &auth)).await?;

    let mut awaiting_key = false;
    for _ in 0..MAX_AUTH_ROUNDS {
        let packet = read_packet(stream, MAX_PACKET_BYTES).await?;
        let next = packet.seq.wrapping_add(1);
        match packet.payload.first() {
            Some(0x00) => return Ok(true),
            Some(0xff) => {
                tracing::debug!(reason = %error_message(&packet.payload), "mysql authentication rejected");
                return Ok(false);
            }
            Some(0xfe) => {
                let mut cursor = Cursor::new(&packet.payload[1..]);
                plugin = String::from_utf8_lossy(cursor.nul_terminated()?).into_owned();
                let rest = cursor.take(cursor.remaining())?;
                nonce = rest.strip_suffix(&[0]).unwrap_or(rest).to_vec();
                write_packet(stream, next, &scramble(&plugin, password, &nonce)).await?;
            }
            Some(0x01) if awaiting_key => {
                let encrypted = encrypt_password(&packet.payload[1..], password, &nonce)?;
                write_packet(stream, next, &encrypted).await?;
                awaiting_key = false;
            }
            Some(0x01) => match packet.payload.get(1) {
                Some(&FAST_AUTH_OK) => continue,
                // No TLS here: fetch the server's RSA key and send the
                // password encrypted with it.
                Some(&FULL_AUTH_NEEDED) => {
                    write_packet(stream, next, &[REQUEST_PUBLIC_KEY]).await?;
                    awaiting_key = true;
                }
                _ => {
                    return Err(ProbeError::Protocol(
                        "unexpected auth continuation".to_string(),
                    ));
                }
            },
            _ => return Err(ProbeError::Protocol("unexpected auth reply".to_string())),
        }
    }
    Ok(false)
}

/// RSA-OAEP(SHA-1) of the NUL-terminated password XORed with the nonce.
fn encrypt_password(pem: &[u8], password: &str, nonce: &[u8]) -> ProbeResult<Vec<u8>> {
    let pem = std::str::from_utf8(pem)
        .map_err(|_| ProbeError::Protocol("public key is not PEM text".to_string()))?
        .trim_end_matches('\0');
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|error| ProbeError::Protocol(format!("unreadable server public key: {error}")))?;
    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    if !nonce.is_empty() {
        for (byte, salt) in plain.iter_mut().zip(nonce.iter().cycle()) {
            *byte ^= salt;
        }
    }
    key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), &plain)
        .map_err(|error| ProbeError::Protocol(format!("cannot encrypt password: {error}")))
}

/// Run one text-protocol statement. Result sets come back as rows of
/// nullable columns; statements without one yield no rows.
async fn query(stream: &mut TcpStream, sql: &str) -> ProbeResult<Vec<Vec<Option<String>>>> {
    let mut command = Vec::with_capacity(sql.len() + 1);
    command.push(COM_QUERY);
    command.extend_from_slice(sql.as_bytes());
    write_packet(stream, 0, &command).await?;

    let header = read_packet(stream, MAX_PACKET_BYTES).await?;
    match header.payload.first() {
        Some(0x00) => return Ok(Vec::new()),
        Some(0xff) => return Err(ProbeError::Refused(error_message(&header.payload))),
        _ => {}
    }
    let columns = Cursor::new(&header.payload).lenenc_int()?.unwrap_or(0);
    for _ in 0..columns {
        read_packet(stream, MAX_PACKET_BYTES).await?;
    }
    let eof = read_packet(stream, MAX_PACKET_BYTES).await?;
    if !is_eof(&eof.payload) {
        return Err(ProbeError::Protocol("missing column EOF".to_string()));
    }

    let mut rows = Vec::new();
    loop {
        let row = read_packet(stream, MAX_PACKET_BYTES).await?;
        if is_eof(&row.payload) {
            break;
        }
        if row.payload.first() == Some(&0xff) {
            return Err(ProbeError::Refused(error_message(&row.payload)));
        }
        let mut cursor = Cursor::new(&row.payload);
        let mut values = Vec::with_capacity(columns as usize);
        for _ in 0..columns {
            values.push(cursor.lenenc_string()?);
        }
        rows.push(values);
    }
    Ok(rows)
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

/// Decide whether the answering server is `product` ("mysql" / "mariadb").
fn identify(variables: &[(String, String)], product: &str) -> PortClassification {
    let lookup = |key: &str| {
        variables
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    };
    let full_version = lookup("version").unwrap_or_default();
    let comment = lookup("version_comment").unwrap_or_default().to_ascii_lowercase();

    let detected = if comment.starts_with("mariadb")
        || full_version.to_ascii_lowercase().contains("mariadb")
    {
        "mariadb".to_string()
    } else if comment.starts_with("mysql") {
        "mysql".to_string()
    } else if comment.is_empty() {
        "unknown".to_string()
    } else {
        comment
    };

    if detected == product {
        let version = full_version.split('-').next().unwrap_or(full_version);
        PortClassification::UsedBySelf {
            version: Some(version.to_string()).filter(|version| !version.is_empty()),
        }
    } else {
        PortClassification::UsedByOtherSameCategory { product: detected }
    }
}

//! PostgreSQL startup exchange: trust, cleartext, md5 and SCRAM-SHA-256
//! logins, plus the simple query protocol for password changes.

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{Credentials, PortClassification, ProbeError, ProbeResult};

const PROTOCOL_VERSION_3: u32 = 196_608;
const MAX_MESSAGE_BYTES: usize = 64 * 1024;
const DEFAULT_USER: &str = "postgres";

const AUTH_OK: u32 = 0;
const AUTH_CLEARTEXT: u32 = 3;
const AUTH_MD5: u32 = 5;
const AUTH_SASL: u32 = 10;
const AUTH_SASL_CONTINUE: u32 = 11;
const AUTH_SASL_FINAL: u32 = 12;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const GS2_HEADER: &str = "n,,";
const NONCE_BYTES: usize = 18;

pub(super) async fn probe(
    stream: &mut TcpStream,
    credentials: Option<&Credentials>,
) -> ProbeResult<PortClassification> {
    let (user, password) = match credentials {
        Some(credentials) => (credentials.user.as_str(), credentials.password.as_str()),
        None => (DEFAULT_USER, ""),
    };
    let Some(session) = login(stream, user, password).await? else {
        return Ok(PortClassification::UsedByOther { banner: None });
    };
    terminate(stream).await;
    Ok(PortClassification::UsedBySelf {
        version: session
            .server_version
            .as_deref()
            .and_then(|version| version.split_whitespace().next())
            .map(str::to_string),
    })
}

/// Log in as `current` and set the password of `target.user`.
pub(super) async fn change_password(
    stream: &mut TcpStream,
    current: &Credentials,
    target: &Credentials,
) -> ProbeResult<()> {
    if login(stream, &current.user, &current.password).await?.is_none() {
        return Err(ProbeError::Refused(format!(
            "login as '{}' was rejected",
            current.user
        )));
    }
    let statement = format!(
        "ALTER USER {} WITH PASSWORD {}",
        identifier(&target.user),
        literal(&target.password)
    );
    simple_query(stream, &statement).await?;
    terminate(stream).await;
    tracing::debug!(user = %target.user, "postgres password changed");
    Ok(())
}

struct Session {
    server_version: Option<String>,
}

/// Run the startup exchange up to ReadyForQuery. `None` when the server
/// refused the login or asked for a method we cannot answer.
async fn login(stream: &mut TcpStream, user: &str, password: &str) -> ProbeResult<Option<Session>> {
    stream.write_all(&startup_message(user)).await?;

    let mut authenticated = false;
    let mut server_version = None;
    let mut scram: Option<ScramClient> = None;
    loop {
        let (tag, body) = read_message(stream).await?;
        match tag {
            b'R' => {
                let data = body.get(4..).unwrap_or_default();
                match auth_code(&body)? {
                    AUTH_OK => authenticated = true,
                    AUTH_CLEARTEXT => stream.write_all(&password_message(password.as_bytes())).await?,
                    AUTH_MD5 => {
                        let salt = data.get(..4).ok_or_else(|| {
                            ProbeError::Protocol("truncated md5 salt".to_string())
                        })?;
                        let hashed = md5_password(user, password, salt);
                        stream.write_all(&password_message(hashed.as_bytes())).await?;
                    }
                    AUTH_SASL => {
                        if !sasl_mechanisms(data).any(|mechanism| mechanism == SCRAM_SHA_256) {
                            tracing::debug!("postgres offers no SASL mechanism we speak");
                            return Ok(None);
                        }
                        let client = ScramClient::new("", password);
                        stream
                            .write_all(&sasl_initial_response(SCRAM_SHA_256, client.client_first().as_bytes()))
                            .await?;
                        scram = Some(client);
                    }
                    AUTH_SASL_CONTINUE => {
                        let client = scram.as_mut().ok_or_else(|| {
                            ProbeError::Protocol("SASL challenge without SASL start".to_string())
                        })?;
                        let client_final = client.client_final(utf8(data)?)?;
                        stream.write_all(&sasl_response(client_final.as_bytes())).await?;
                    }
                    AUTH_SASL_FINAL => {
                        let client = scram.as_ref().ok_or_else(|| {
                            ProbeError::Protocol("SASL outcome without SASL start".to_string())
                        })?;
                        client.verify_server(utf8(data)?)?;
                    }
                    code => {
                        tracing::debug!(code, "unsupported postgres authentication method");
                        return Ok(None);
                    }
                }
            }
            b'S' => {
                if let Some(("server_version", value)) = parameter_status(&body) {
                    server_version = Some(value.to_string());
                }
            }
            b'E' => {
                tracing::debug!(reason = %error_text(&body), "postgres refused the login");
                return Ok(None);
            }
            b'Z' => break,
            b'K' | b'N' => {}
            other => {
                return Err(ProbeError::Protocol(format!(
                    "unexpected postgres message {:?}",
                    other as char
                )));
            }
        }
    }

    Ok(authenticated.then_some(Session { server_version }))
}

/// Send one statement and wait for ReadyForQuery; an ErrorResponse on the
/// way fails the call.
async fn simple_query(stream: &mut TcpStream, sql: &str) -> ProbeResult<()> {
    let mut message = vec![b'Q'];
    message.extend_from_slice(&((sql.len() + 5) as u32).to_be_bytes());
    message.extend_from_slice(sql.as_bytes());
    message.push(0);
    stream.write_all(&message).await?;

    let mut failure = None;
    loop {
        let (tag, body) = read_message(stream).await?;
        match tag {
            b'E' => failure = Some(error_text(&body)),
            b'Z' => break,
            _ => {}
        }
    }
    match failure {
        Some(reason) => Err(ProbeError::Refused(reason)),
        None => Ok(()),
    }
}

async fn terminate(stream: &mut TcpStream) {
    let _ = stream.write_all(&[b'X', 0, 0, 0, 4]).await;
}

fn identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// With `standard_conforming_strings` on, only quotes need doubling.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn startup_message(user: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
    for (key, value) in [("user", user), ("database", user)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut message = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    message.extend_from_slice(&body);
    message
}

fn password_message(password: &[u8]) -> Vec<u8> {
    let mut message = vec![b'p'];
    message.extend_from_slice(&((password.len() + 5) as u32).to_be_bytes());
    message.extend_from_slice(password);
    message.push(0);
    message
}

fn sasl_initial_response(mechanism: &str, data: &[u8]) -> Vec<u8> {
    let mut message = vec![b'p'];
    let len = 4 + mechanism.len() + 1 + 4 + data.len();
    message.extend_from_slice(&(len as u32).to_be_bytes());
    message.extend_from_slice(mechanism.as_bytes());
    message.push(0);
    message.extend_from_slice(&(data.len() as u32).to_be_bytes());
    message.extend_from_slice(data);
    message
}

fn sasl_response(data: &[u8]) -> Vec<u8> {
    let mut message = vec![b'p'];
    message.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
    message.extend_from_slice(data);
    message
}

fn sasl_mechanisms(data: &[u8]) -> impl Iterator<Item = &str> {
    data.split(|byte| *byte == 0)
        .filter(|name| !name.is_empty())
        .filter_map(|name| std::str::from_utf8(name).ok())
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let inner = hex::encode(Md5::digest(format!("{password}{user}")));
    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

fn utf8(data: &[u8]) -> ProbeResult<&str> {
    std::str::from_utf8(data).map_err(|_| ProbeError::Protocol("SASL payload is not UTF-8".to_string()))
}

/// Client side of SCRAM-SHA-256 without channel binding.
struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    fn new(user: &str, password: &str) -> Self {
        let nonce = STANDARD.encode(rand::random::<[u8; NONCE_BYTES]>());
        Self::with_nonce(user, password, &nonce)
    }

    fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            server_signature: None,
        }
    }

    fn client_first(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    fn client_final(&mut self, server_first: &str) -> ProbeResult<String> {
        let attribute = |name: char| {
            server_first.split(',').find_map(|part| {
                let (key, value) = part.split_once('=')?;
                (key.len() == 1 && key.starts_with(name)).then_some(value)
            })
        };
        let malformed = || ProbeError::Protocol(format!("malformed SCRAM challenge '{server_first}'"));
        let nonce = attribute('r').ok_or_else(malformed)?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ProbeError::Protocol("SCRAM server nonce does not extend ours".to_string()));
        }
        let salt = attribute('s')
            .and_then(|salt| STANDARD.decode(salt).ok())
            .ok_or_else(malformed)?;
        let iterations = attribute('i')
            .and_then(|count| count.parse::<u32>().ok())
            .filter(|count| *count > 0)
            .ok_or_else(malformed)?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);
        let client_key = hmac_sha256(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let without_proof = format!("c={},r={nonce}", STANDARD.encode(GS2_HEADER));
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof = client_key
            .iter()
            .zip(signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect::<Vec<_>>();

        let server_key = hmac_sha256(&salted, b"Server Key")?;
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes())?);
        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)))
    }

    fn verify_server(&self, server_final: &str) -> ProbeResult<()> {
        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(ProbeError::Refused(format!("SCRAM: {error}")));
        }
        let received = server_final
            .strip_prefix("v=")
            .and_then(|signature| STANDARD.decode(signature).ok());
        match (&self.server_signature, received) {
            (Some(expected), Some(received)) if *expected == received => Ok(()),
            _ => Err(ProbeError::Protocol("SCRAM server signature mismatch".to_string())),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> ProbeResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|error| ProbeError::Protocol(format!("HMAC key: {error}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

async fn read_message(stream: &mut TcpStream) -> ProbeResult<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if !(4..=MAX_MESSAGE_BYTES).contains(&len) {
        return Err(ProbeError::Protocol(format!(
            "postgres message length {len} out of range"
        )));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok((header[0], body))
}

fn auth_code(body: &[u8]) -> ProbeResult<u32> {
    match body.get(..4) {
        Some(raw) => Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
        None => Err(ProbeError::Protocol(
            "truncated authentication request".to_string(),
        )),
    }
}

fn parameter_status(body: &[u8]) -> Option<(&str, &str)> {
    let mut parts = body.split(|byte| *byte == 0);
    let name = std::str::from_utf8(parts.next()?).ok()?;
    let value = std::str::from_utf8(parts.next()?).ok()?;
    Some((name, value))
}

/// `M` field of an ErrorResponse.
fn error_text(body: &[u8]) -> String {
    body.split(|byte| *byte == 0)
        .find_map(|field| field.strip_prefix(b"M"))
        .map(|message| String::from_utf8_lossy(message).into_owned())
        .unwrap_or_default()
}

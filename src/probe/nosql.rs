//! Document and key-value store probes
//!
//! Both protocols are small enough to speak directly: Redis gets RESP
//! `AUTH`/`SELECT`/`PING`, MongoDB gets an OP_MSG `ping`, preceded by a
//! SCRAM-SHA-256 conversation when credentials are configured.

use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;

use super::tls::{self, ProbeStream};
use super::{connect_tcp, hmac_sha256, ProbeError, ProbeStrategy};
use crate::builder::{ConnectionTarget, NoSqlTarget};
use crate::catalog::{Category, ConnectionType};
use crate::error::ErrorCode;

/// Upper bound on a single reply
const MAX_REPLY_BYTES: usize = 1024 * 1024;
const OP_MSG: i32 = 2013;
/// MongoDB AuthenticationFailed / Unauthorized
const MONGO_AUTH_CODES: [i32; 2] = [18, 13];

#[derive(Default)]
pub struct NoSqlProbe {
    tls: Option<TlsConnector>,
}

impl NoSqlProbe {
    pub fn new(tls: Option<TlsConnector>) -> Self {
        Self { tls }
    }

    async fn open(&self, target: &NoSqlTarget) -> Result<BufReader<Box<dyn ProbeStream>>, ProbeError> {
        let tcp = connect_tcp(&target.host, target.port).await?;
        let connector = if target.tls {
            Some(self.tls.as_ref().ok_or_else(|| {
                ProbeError::handshake("TLS requested but no CA bundle is configured")
            })?)
        } else {
            None
        };
        let stream = tls::upgrade(tcp, &target.host, connector).await?;
        Ok(BufReader::new(stream))
    }
}

#[async_trait]
impl ProbeStrategy for NoSqlProbe {
    fn category(&self) -> Category {
        Category::NoSql
    }

    async fn probe(&self, target: &ConnectionTarget, _timeout: Duration) -> Result<String, ProbeError> {
        let ConnectionTarget::NoSql(target) = target else {
            return Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                "nosql probe received a foreign target",
            ));
        };

        let mut stream = self.open(target).await?;
        match target.engine {
            ConnectionType::Redis => probe_redis(&mut stream, target).await,
            ConnectionType::MongoDb => probe_mongo(&mut stream, target).await,
            other => Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                format!("{} has no nosql probe", other),
            )),
        }
    }
}

// --- Redis ---

async fn probe_redis(
    stream: &mut BufReader<Box<dyn ProbeStream>>,
    target: &NoSqlTarget,
) -> Result<String, ProbeError> {
    if let Some(password) = &target.password {
        let mut args = vec!["AUTH"];
        if let Some(user) = target.username.as_deref() {
            args.push(user);
        }
        args.push(password.expose());

        let reply = redis_command(stream, &args).await?;
        if !reply.starts_with("+OK") {
            return Err(ProbeError::auth_rejected(redis_error(&reply)));
        }
    }

    if let Some(db) = target.redis_db() {
        let index = db.to_string();
        let reply = redis_command(stream, &["SELECT", &index]).await?;
        if !reply.starts_with("+OK") {
            return Err(ProbeError::unexpected(format!("SELECT {} failed: {}", db, redis_error(&reply))));
        }
    }

    let reply = redis_command(stream, &["PING"]).await?;
    if reply.starts_with("+PONG") {
        Ok(format!("PING answered by {}:{}", target.host, target.port))
    } else if reply.starts_with("-NOAUTH") {
        Err(ProbeError::auth_rejected("server requires authentication"))
    } else {
        Err(ProbeError::unexpected(format!("unexpected PING reply: {}", redis_error(&reply))))
    }
}

async fn redis_command(
    stream: &mut BufReader<Box<dyn ProbeStream>>,
    args: &[&str],
) -> Result<String, ProbeError> {
    stream
        .write_all(&encode_resp(args))
        .await
        .map_err(|e| ProbeError::from_io("send command", &e))?;
    stream
        .flush()
        .await
        .map_err(|e| ProbeError::from_io("send command", &e))?;

    let mut line = String::new();
    let read = stream
        .read_line(&mut line)
        .await
        .map_err(|e| ProbeError::from_io("read reply", &e))?;
    if read == 0 {
        return Err(ProbeError::handshake("server closed the connection"));
    }
    if !line.starts_with(['+', '-', ':', '$', '*']) {
        return Err(ProbeError::handshake("peer does not speak RESP"));
    }
    Ok(line.trim_end().to_string())
}

fn encode_resp(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn redis_error(reply: &str) -> String {
    reply.trim_start_matches(['-', '+']).to_string()
}

// --- MongoDB ---

async fn probe_mongo(
    stream: &mut BufReader<Box<dyn ProbeStream>>,
    target: &NoSqlTarget,
) -> Result<String, ProbeError> {
    let mut conversation = MongoConversation { stream, request_id: 0 };

    let authenticated = match (target.username.as_deref(), target.password.as_ref()) {
        (Some(user), Some(password)) => {
            let source = target
                .auth_source
                .as_deref()
                .or(target.database.as_deref())
                .unwrap_or("admin");
            scram_sha256(&mut conversation, user, password.expose(), source).await?;
            true
        }
        _ => false,
    };

    let reply = conversation
        .command(vec![
            ("ping", Bson::Int32(1)),
            ("$db", Bson::String("admin".to_string())),
        ])
        .await?;
    check_ok(&reply)?;

    Ok(if authenticated {
        format!("authenticated ping answered by {}:{}", target.host, target.port)
    } else {
        format!("ping answered by {}:{}", target.host, target.port)
    })
}

struct MongoConversation<'a> {
    stream: &'a mut BufReader<Box<dyn ProbeStream>>,
    request_id: i32,
}

impl MongoConversation<'_> {
    async fn command(&mut self, body: Vec<(&str, Bson)>) -> Result<Document, ProbeError> {
        self.request_id += 1;
        let doc = encode_document(&body);

        let length = 16 + 4 + 1 + doc.len();
        let mut message = Vec::with_capacity(length);
        message.extend_from_slice(&(length as i32).to_le_bytes());
        message.extend_from_slice(&self.request_id.to_le_bytes());
        message.extend_from_slice(&0i32.to_le_bytes());
        message.extend_from_slice(&OP_MSG.to_le_bytes());
        message.extend_from_slice(&0u32.to_le_bytes());
        message.push(0);
        message.extend_from_slice(&doc);

        self.stream
            .write_all(&message)
            .await
            .map_err(|e| ProbeError::from_io("send command", &e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ProbeError::from_io("send command", &e))?;

        let mut header = [0u8; 16];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| ProbeError::from_io("read reply", &e))?;
        let total = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let op_code = i32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if op_code != OP_MSG || !(21..=MAX_REPLY_BYTES as i32).contains(&total) {
            return Err(ProbeError::handshake("peer does not speak the MongoDB wire protocol"));
        }

        let mut body = vec![0u8; total as usize - 16];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| ProbeError::from_io("read reply", &e))?;

        // flagBits (4) and section kind (1) precede the body document
        if body.len() < 5 || body[4] != 0 {
            return Err(ProbeError::handshake("malformed OP_MSG reply"));
        }
        decode_document(&body[5..])
    }
}

fn check_ok(reply: &Document) -> Result<(), ProbeError> {
    let ok = match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        _ => false,
    };
    if ok {
        return Ok(());
    }

    let message = match reply.get("errmsg") {
        Some(Bson::String(s)) => s.clone(),
        _ => "command failed".to_string(),
    };
    match reply.get("code") {
        Some(Bson::Int32(code)) if MONGO_AUTH_CODES.contains(code) => Err(ProbeError::auth_rejected(message)),
        _ => Err(ProbeError::unexpected(message)),
    }
}

async fn scram_sha256(
    conversation: &mut MongoConversation<'_>,
    user: &str,
    password: &str,
    source: &str,
) -> Result<(), ProbeError> {
    let b64 = base64::engine::general_purpose::STANDARD;

    let mut nonce_bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let client_nonce = b64.encode(nonce_bytes);
    let client_first_bare = format!("n={},r={}", scram_escape(user), client_nonce);

    let reply = conversation
        .command(vec![
            ("saslStart", Bson::Int32(1)),
            ("mechanism", Bson::String("SCRAM-SHA-256".to_string())),
            ("payload", Bson::Binary(format!("n,,{}", client_first_bare).into_bytes())),
            ("options", Bson::Document(vec![("skipEmptyExchange".to_string(), Bson::Bool(true))])),
            ("$db", Bson::String(source.to_string())),
        ])
        .await?;
    check_ok(&reply)?;

    let conversation_id = reply.get("conversationId").cloned().unwrap_or(Bson::Int32(1));
    let server_first = payload_text(&reply)?;
    let server_nonce = scram_attr(&server_first, 'r')?;
    let salt = b64
        .decode(scram_attr(&server_first, 's')?)
        .map_err(|_| ProbeError::handshake("invalid SCRAM salt"))?;
    let iterations: u32 = scram_attr(&server_first, 'i')?
        .parse()
        .map_err(|_| ProbeError::handshake("invalid SCRAM iteration count"))?;
    if !server_nonce.starts_with(&client_nonce) || iterations == 0 {
        return Err(ProbeError::handshake("server sent an invalid SCRAM challenge"));
    }

    let salted = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(client_key);
    let without_proof = format!("c=biws,r={}", server_nonce);
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    let client_final = format!("{},p={}", without_proof, b64.encode(proof));

    let reply = conversation
        .command(vec![
            ("saslContinue", Bson::Int32(1)),
            ("conversationId", conversation_id),
            ("payload", Bson::Binary(client_final.into_bytes())),
            ("$db", Bson::String(source.to_string())),
        ])
        .await?;
    check_ok(&reply)?;

    let server_final = payload_text(&reply)?;
    let server_key = hmac_sha256(&salted, b"Server Key");
    let expected = b64.encode(hmac_sha256(&server_key, auth_message.as_bytes()));
    if scram_attr(&server_final, 'v')? != expected {
        return Err(ProbeError::handshake("server signature mismatch during SCRAM"));
    }
    Ok(())
}

fn payload_text(reply: &Document) -> Result<String, ProbeError> {
    match reply.get("payload") {
        Some(Bson::Binary(bytes)) => String::from_utf8(bytes.clone())
            .map_err(|_| ProbeError::handshake("SCRAM payload is not UTF-8")),
        _ => Err(ProbeError::handshake("SCRAM reply has no payload")),
    }
}

fn scram_attr(message: &str, name: char) -> Result<String, ProbeError> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
        .map(str::to_string)
        .ok_or_else(|| ProbeError::handshake(format!("SCRAM message has no '{}' attribute", name)))
}

fn scram_escape(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

/// PBKDF2-HMAC-SHA256, single 32-byte block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac_sha256(password, &block);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (r, x) in result.iter_mut().zip(u.iter()) {
            *r ^= x;
        }
    }
    result
}

// --- Minimal BSON ---

#[derive(Debug, Clone, PartialEq)]
enum Bson {
    Double(f64),
    String(String),
    Document(Vec<(String, Bson)>),
    Binary(Vec<u8>),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    /// Value of a type the probe never inspects
    Opaque,
}

#[derive(Debug)]
struct Document(Vec<(String, Bson)>);

impl Document {
    fn get(&self, key: &str) -> Option<&Bson> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

fn encode_document(fields: &[(&str, Bson)]) -> Vec<u8> {
    let owned: Vec<(String, Bson)> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    encode_fields(&owned)
}

fn encode_fields(fields: &[(String, Bson)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in fields {
        let (tag, bytes) = match value {
            Bson::Double(v) => (0x01, v.to_le_bytes().to_vec()),
            Bson::String(s) => {
                let mut b = ((s.len() + 1) as i32).to_le_bytes().to_vec();
                b.extend_from_slice(s.as_bytes());
                b.push(0);
                (0x02, b)
            }
            Bson::Document(doc) => (0x03, encode_fields(doc)),
            Bson::Binary(data) => {
                let mut b = (data.len() as i32).to_le_bytes().to_vec();
                b.push(0x00);
                b.extend_from_slice(data);
                (0x05, b)
            }
            Bson::Bool(v) => (0x08, vec![*v as u8]),
            Bson::Int32(v) => (0x10, v.to_le_bytes().to_vec()),
            Bson::Int64(v) => (0x12, v.to_le_bytes().to_vec()),
            Bson::Opaque => (0x0A, Vec::new()),
        };
        body.push(tag);
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(&bytes);
    }

    let mut doc = ((body.len() + 5) as i32).to_le_bytes().to_vec();
    doc.extend_from_slice(&body);
    doc.push(0);
    doc
}

fn decode_document(bytes: &[u8]) -> Result<Document, ProbeError> {
    decode_fields(bytes).map(Document)
}

fn decode_fields(bytes: &[u8]) -> Result<Vec<(String, Bson)>, ProbeError> {
    let malformed = || ProbeError::handshake("malformed BSON in reply");

    let declared = read_len(bytes, 0).ok_or_else(malformed)?;
    if declared < 5 || declared > bytes.len() {
        return Err(malformed());
    }

    let mut fields = Vec::new();
    let mut pos = 4;
    while pos < declared - 1 {
        let tag = bytes[pos];
        pos += 1;
        let key_end = bytes[pos..declared].iter().position(|b| *b == 0).ok_or_else(malformed)? + pos;
        let key = String::from_utf8_lossy(&bytes[pos..key_end]).into_owned();
        pos = key_end + 1;

        let (value, size) = match tag {
            0x01 => (
                Bson::Double(f64::from_le_bytes(slice8(bytes, pos).ok_or_else(malformed)?)),
                8,
            ),
            0x02 => {
                let len = read_len(bytes, pos).ok_or_else(malformed)?;
                let start = pos + 4;
                let end = start.checked_add(len.saturating_sub(1)).ok_or_else(malformed)?;
                let text = bytes.get(start..end).ok_or_else(malformed)?;
                (Bson::String(String::from_utf8_lossy(text).into_owned()), 4 + len)
            }
            0x03 | 0x04 => {
                let len = read_len(bytes, pos).ok_or_else(malformed)?;
                let end = pos.checked_add(len).ok_or_else(malformed)?;
                let inner = bytes.get(pos..end).ok_or_else(malformed)?;
                (Bson::Document(decode_fields(inner)?), len)
            }
            0x05 => {
                let len = read_len(bytes, pos).ok_or_else(malformed)?;
                let start = pos + 5;
                let end = start.checked_add(len).ok_or_else(malformed)?;
                let data = bytes.get(start..end).ok_or_else(malformed)?;
                (Bson::Binary(data.to_vec()), 5 + len)
            }
            0x07 => (Bson::Opaque, 12),
            0x08 => (Bson::Bool(*bytes.get(pos).ok_or_else(malformed)? != 0), 1),
            0x09 | 0x11 => (Bson::Opaque, 8),
            0x0A => (Bson::Opaque, 0),
            0x10 => (Bson::Int32(read_i32(bytes, pos).ok_or_else(malformed)?), 4),
            0x12 => (
                Bson::Int64(i64::from_le_bytes(slice8(bytes, pos).ok_or_else(malformed)?)),
                8,
            ),
            _ => return Err(ProbeError::handshake(format!("unsupported BSON type 0x{:02x}", tag))),
        };

        fields.push((key, value));
        pos += size;
    }

    Ok(fields)
}

/// Length prefix; negative values are rejected
fn read_len(bytes: &[u8], pos: usize) -> Option<usize> {
    usize::try_from(read_i32(bytes, pos)?).ok()
}

fn read_i32(bytes: &[u8], pos: usize) -> Option<i32> {
    let b = bytes.get(pos..pos + 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn slice8(bytes: &[u8], pos: usize) -> Option<[u8; 8]> {
    bytes.get(pos..pos + 8)?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionDraft;
    use crate::secrets::Secret;
    use tokio::net::TcpListener;

    fn redis_target(port: u16, password: Option<&str>) -> ConnectionTarget {
        let mut draft = ConnectionDraft::new("app-1", ConnectionType::Redis);
        draft.server = Some("127.0.0.1".to_string());
        draft.port = Some(port);
        let secret = password.map(|p| Secret::Password(p.to_string()));
        crate::builder::build(&draft, secret.as_ref()).unwrap()
    }

    /// Fake Redis accepting exactly one password
    async fn fake_redis(expected_password: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut authed = false;
            loop {
                let mut header = String::new();
                if socket.read_line(&mut header).await.unwrap() == 0 {
                    break;
                }
                let count: usize = header.trim()[1..].parse().unwrap();
                let mut args = Vec::new();
                for _ in 0..count {
                    let mut len = String::new();
                    socket.read_line(&mut len).await.unwrap();
                    let mut arg = String::new();
                    socket.read_line(&mut arg).await.unwrap();
                    args.push(arg.trim_end().to_string());
                }
                let reply: &[u8] = match args[0].as_str() {
                    "AUTH" if args.last().map(String::as_str) == Some(expected_password) => {
                        authed = true;
                        b"+OK\r\n"
                    }
                    "AUTH" => b"-WRONGPASS invalid username-password pair\r\n",
                    "PING" if authed => b"+PONG\r\n",
                    "PING" => b"-NOAUTH Authentication required.\r\n",
                    _ => b"-ERR unknown command\r\n",
                };
                socket.get_mut().write_all(reply).await.unwrap();
            }
        });
        port
    }

    #[test]
    fn test_resp_encoding() {
        assert_eq!(
            encode_resp(&["AUTH", "pw"]),
            b"*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_redis_auth_and_ping() {
        let port = fake_redis("letmein").await;
        let message = NoSqlProbe::default()
            .probe(&redis_target(port, Some("letmein")), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(message.contains("PING answered"));
    }

    #[tokio::test]
    async fn test_redis_wrong_password_is_auth_rejected() {
        let port = fake_redis("letmein").await;
        let err = NoSqlProbe::default()
            .probe(&redis_target(port, Some("nope")), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRejected);
        assert!(!err.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_redis_missing_password_is_auth_rejected() {
        let port = fake_redis("letmein").await;
        let err = NoSqlProbe::default()
            .probe(&redis_target(port, None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRejected);
    }

    #[tokio::test]
    async fn test_non_resp_peer_is_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = NoSqlProbe::default()
            .probe(&redis_target(port, None), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_tls_without_roots_fails_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut draft = ConnectionDraft::new("app-1", ConnectionType::MongoDb);
        draft.server = Some("127.0.0.1".to_string());
        draft.port = Some(port);
        draft.additional_settings.insert("tls".into(), "true".into());
        let target = crate::builder::build(&draft, None).unwrap();

        let err = NoSqlProbe::default()
            .probe(&target, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandshakeFailed);
    }

    #[test]
    fn test_bson_document_decodes_nested_reply() {
        let encoded = encode_fields(&[
            ("ok".to_string(), Bson::Double(1.0)),
            (
                "$clusterTime".to_string(),
                Bson::Document(vec![("signature".to_string(), Bson::Binary(vec![1, 2, 3]))]),
            ),
            ("conversationId".to_string(), Bson::Int32(7)),
            ("done".to_string(), Bson::Bool(false)),
            ("errmsg".to_string(), Bson::String("none".to_string())),
        ]);
        let doc = decode_document(&encoded).unwrap();
        assert_eq!(doc.get("ok"), Some(&Bson::Double(1.0)));
        assert_eq!(doc.get("conversationId"), Some(&Bson::Int32(7)));
        assert!(check_ok(&doc).is_ok());
    }

    #[test]
    fn test_mongo_auth_failure_code() {
        let doc = Document(vec![
            ("ok".to_string(), Bson::Double(0.0)),
            ("errmsg".to_string(), Bson::String("Authentication failed.".to_string())),
            ("code".to_string(), Bson::Int32(18)),
        ]);
        assert_eq!(check_ok(&doc).unwrap_err().code, ErrorCode::AuthRejected);
    }

    #[test]
    fn test_truncated_bson_is_rejected() {
        let encoded = encode_document(&[("ping", Bson::Int32(1))]);
        assert!(decode_document(&encoded[..encoded.len() - 3]).is_err());
    }

    /// Document with one field of `tag` whose length prefix is `len`
    fn raw_field(tag: u8, len: i32) -> Vec<u8> {
        let mut body = vec![tag, b'k', 0];
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(&[0; 6]);
        let mut doc = ((body.len() + 5) as i32).to_le_bytes().to_vec();
        doc.extend_from_slice(&body);
        doc.push(0);
        doc
    }

    #[test]
    fn test_bson_bad_lengths_are_rejected() {
        for tag in [0x02, 0x03, 0x05] {
            for len in [-1, i32::MIN, i32::MAX] {
                let err = decode_document(&raw_field(tag, len)).unwrap_err();
                assert_eq!(err.code, ErrorCode::HandshakeFailed, "tag {:#x} len {}", tag, len);
            }
        }

        let mut negative_total = raw_field(0x10, 1);
        negative_total[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(decode_document(&negative_total).is_err());
    }

    #[test]
    fn test_pbkdf2_sha256_vector() {
        // RFC 7914 section 11
        let out = pbkdf2_sha256(b"passwd", b"salt", 1);
        assert_eq!(
            hex::encode(out),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn test_scram_attribute_parsing() {
        let first = "r=abcXYZ,s=c2FsdA==,i=4096";
        assert_eq!(scram_attr(first, 'r').unwrap(), "abcXYZ");
        assert_eq!(scram_attr(first, 's').unwrap(), "c2FsdA==");
        assert_eq!(scram_attr(first, 'i').unwrap(), "4096");
        assert!(scram_attr(first, 'v').is_err());
        assert_eq!(scram_escape("a=b,c"), "a=3Db=2Cc");
    }
}

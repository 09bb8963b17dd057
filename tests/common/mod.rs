#![allow(dead_code)]
/// Common test helpers: an in-process fake PostgreSQL backend
///
/// The fake speaks just enough of protocol 3.0 for the simple query flow:
/// startup, trust/cleartext/MD5/SCRAM-SHA-256 authentication, `Q` messages answered from
/// a script, and `X` to terminate. Every scripted response is followed by
/// ReadyForQuery automatically.
use base64::{
    engine::general_purpose::STANDARD as BASE64,
    Engine as _,
};
use bufsize::ClientOptions;
use bytes::{
    BufMut,
    BytesMut,
};
use hmac::{
    Hmac,
    Mac,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
    },
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
    },
};

const PROTOCOL_VERSION: i32 = 196608;
const TEXT_OID: u32 = 25;
const INT4_OID: u32 = 23;
const SCRAM_SALT: &[u8] = b"bufsize-fake-salt";
const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SERVER_NONCE: &str = "fakeServerNonce";

type HmacSha256 = Hmac<Sha256>;

/// How the fake asks clients to authenticate
#[derive(Debug, Clone)]
pub enum AuthMode {
    Trust,
    Cleartext { password: String },
    Md5 { password: String },
    /// SCRAM-SHA-256; `forge_signature` makes the server-final message
    /// carry a signature computed from the wrong key
    Scram { password: String, forge_signature: bool },
}

/// Maps a query string to the encoded messages sent back for it
pub type Script = Arc<dyn Fn(&str) -> Vec<u8> + Send + Sync>;

/// A fake server bound to an ephemeral localhost port
pub struct FakeServer {
    pub addr: SocketAddr,
    startups: Arc<Mutex<Vec<HashMap<String, String>>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub async fn start(auth: AuthMode, script: Script) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let startups = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));

        let server = FakeServer {
            addr,
            startups: startups.clone(),
            queries: queries.clone(),
        };

        tokio::spawn(async move {
            let mut next_pid = 1000;
            while let Ok((socket, _)) = listener.accept().await {
                next_pid += 1;
                let session = Session {
                    socket,
                    auth: auth.clone(),
                    script: script.clone(),
                    startups: startups.clone(),
                    queries: queries.clone(),
                    process_id: next_pid,
                };
                tokio::spawn(session.run());
            }
        });

        server
    }

    /// Options pointing at this server
    pub fn options(&self) -> ClientOptions {
        ClientOptions::new(self.addr.ip().to_string(), self.addr.port()).user("bench")
    }

    /// Connection URL pointing at this server
    pub fn url(&self) -> String {
        format!("postgres://bench@{}:{}/bench", self.addr.ip(), self.addr.port())
    }

    /// Startup parameters of every session so far
    pub fn startups(&self) -> Vec<HashMap<String, String>> {
        self.startups.lock().unwrap().clone()
    }

    /// Query strings received so far, across sessions
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

struct Session {
    socket: TcpStream,
    auth: AuthMode,
    script: Script,
    startups: Arc<Mutex<Vec<HashMap<String, String>>>>,
    queries: Arc<Mutex<Vec<String>>>,
    process_id: i32,
}

impl Session {
    async fn run(mut self) {
        let _ = self.serve().await;
    }

    async fn serve(&mut self) -> std::io::Result<()> {
        let params = self.read_startup().await?;
        let user = params.get("user").cloned().unwrap_or_default();
        self.startups.lock().unwrap().push(params);

        if !self.authenticate(&user).await? {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&auth_ok());
        buf.extend_from_slice(&parameter_status("server_version", "16.0 (fake)"));
        buf.extend_from_slice(&parameter_status("client_encoding", "UTF8"));
        buf.extend_from_slice(&backend_key_data(self.process_id, 42));
        buf.extend_from_slice(&ready_for_query());
        self.socket.write_all(&buf).await?;

        loop {
            let (code, body) = match self.read_message().await {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };
            match code {
                b'Q' => {
                    let sql = cstr(&body);
                    self.queries.lock().unwrap().push(sql.clone());
                    let mut response = (self.script)(&sql);
                    response.extend_from_slice(&ready_for_query());
                    self.socket.write_all(&response).await?;
                }
                b'X' => return Ok(()),
                _ => {
                    let err = error_response("08P01", "unsupported message");
                    self.socket.write_all(&err).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn read_startup(&mut self) -> std::io::Result<HashMap<String, String>> {
        let len = self.socket.read_i32().await? as usize;
        let mut body = vec![0u8; len - 4];
        self.socket.read_exact(&mut body).await?;

        let version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(version, PROTOCOL_VERSION);

        let mut params = HashMap::new();
        let mut parts = body[4..].split(|b| *b == 0);
        while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if key.is_empty() {
                break;
            }
            params.insert(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
        Ok(params)
    }

    async fn authenticate(&mut self, user: &str) -> std::io::Result<bool> {
        let expected = match &self.auth {
            AuthMode::Trust => return Ok(true),
            AuthMode::Cleartext { password } => {
                self.socket.write_all(&auth_request(3, &[])).await?;
                password.clone()
            }
            AuthMode::Md5 { password } => {
                let salt = [1u8, 2, 3, 4];
                self.socket.write_all(&auth_request(5, &salt)).await?;
                postgres_protocol::authentication::md5_hash(
                    user.as_bytes(),
                    password.as_bytes(),
                    salt,
                )
            }
            AuthMode::Scram { password, forge_signature } => {
                let (password, forge) = (password.clone(), *forge_signature);
                if self.scram_exchange(&password, forge).await? {
                    return Ok(true);
                }
                return self.reject_password(user).await;
            }
        };

        let (code, body) = self.read_message().await?;
        if code == b'p' && cstr(&body) == expected {
            return Ok(true);
        }
        self.reject_password(user).await
    }

    async fn reject_password(&mut self, user: &str) -> std::io::Result<bool> {
        let err = error_response_with_severity(
            "FATAL",
            "28P01",
            &format!("password authentication failed for user \"{}\"", user),
        );
        self.socket.write_all(&err).await?;
        Ok(false)
    }

    /// Server side of SCRAM-SHA-256 without channel binding. Returns false
    /// when the client proof does not match `password`.
    async fn scram_exchange(&mut self, password: &str, forge: bool) -> std::io::Result<bool> {
        self.socket.write_all(&auth_request(10, b"SCRAM-SHA-256\0\0")).await?;

        // SASLInitialResponse: mechanism, length-prefixed client-first message
        let (code, body) = self.read_message().await?;
        assert_eq!(code, b'p');
        let mechanism = cstr(&body);
        assert_eq!(mechanism, "SCRAM-SHA-256");
        let client_first = String::from_utf8(body[mechanism.len() + 5..].to_vec()).unwrap();
        let client_first_bare = client_first.splitn(3, ',').nth(2).unwrap().to_string();
        let client_nonce = client_first_bare.split(",r=").nth(1).unwrap();

        let nonce = format!("{}{}", client_nonce, SCRAM_SERVER_NONCE);
        let server_first =
            format!("r={},s={},i={}", nonce, BASE64.encode(SCRAM_SALT), SCRAM_ITERATIONS);
        self.socket.write_all(&auth_request(11, server_first.as_bytes())).await?;

        // SASLResponse: client-final message
        let (code, body) = self.read_message().await?;
        assert_eq!(code, b'p');
        let client_final = String::from_utf8(body).unwrap();
        let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
        assert!(without_proof.ends_with(&format!("r={}", nonce)));

        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            SCRAM_SALT,
            SCRAM_ITERATIONS,
            &mut salted,
        );

        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let expected_proof: Vec<u8> =
            client_key.iter().zip(client_signature.iter()).map(|(k, s)| k ^ s).collect();
        if BASE64.decode(proof).ok() != Some(expected_proof) {
            return Ok(false);
        }

        let server_key = if forge {
            hmac_sha256(b"not the salted password", b"Server Key")
        } else {
            hmac_sha256(&salted, b"Server Key")
        };
        let signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(signature));
        self.socket.write_all(&auth_request(12, server_final.as_bytes())).await?;
        Ok(true)
    }

    async fn read_message(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let code = self.socket.read_u8().await?;
        let len = self.socket.read_i32().await? as usize;
        let mut body = vec![0u8; len - 4];
        self.socket.read_exact(&mut body).await?;
        Ok((code, body))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn cstr(body: &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn message(code: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(code);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf.to_vec()
}

fn auth_request(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32(code);
    body.put_slice(extra);
    message(b'R', &body)
}

pub fn auth_ok() -> Vec<u8> {
    auth_request(0, &[])
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
    message(b'S', &body)
}

pub fn backend_key_data(process_id: i32, secret_key: i32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32(process_id);
    body.put_i32(secret_key);
    message(b'K', &body)
}

pub fn ready_for_query() -> Vec<u8> {
    message(b'Z', b"I")
}

/// RowDescription; a column named `id` is typed int4, everything else text
pub fn row_description(columns: &[&str]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for (i, name) in columns.iter().enumerate() {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(16384);
        body.put_i16(i as i16 + 1);
        if *name == "id" {
            body.put_u32(INT4_OID);
            body.put_i16(4);
        } else {
            body.put_u32(TEXT_OID);
            body.put_i16(-1);
        }
        body.put_i32(-1);
        body.put_i16(0);
    }
    message(b'T', &body)
}

pub fn data_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(v) => {
                body.put_i32(v.len() as i32);
                body.put_slice(v.as_bytes());
            }
            None => body.put_i32(-1),
        }
    }
    message(b'D', &body)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    message(b'C', &body)
}

pub fn empty_query_response() -> Vec<u8> {
    message(b'I', &[])
}

fn fields_message(code: u8, severity: &str, sqlstate: &str, text: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', sqlstate), (b'M', text)] {
        body.put_u8(field);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    message(code, &body)
}

pub fn error_response(sqlstate: &str, text: &str) -> Vec<u8> {
    error_response_with_severity("ERROR", sqlstate, text)
}

pub fn error_response_with_severity(severity: &str, sqlstate: &str, text: &str) -> Vec<u8> {
    fields_message(b'E', severity, sqlstate, text)
}

pub fn notice_response(sqlstate: &str, text: &str) -> Vec<u8> {
    fields_message(b'N', "NOTICE", sqlstate, text)
}

/// The `id`/`desc` md5 text of row `i` in the generated table
pub fn row_desc(i: usize) -> String {
    format!("{:032x}", i * 7919)
}

/// A full `SELECT * FROM t` answer with `rows` rows
pub fn table_response(rows: usize) -> Vec<u8> {
    let mut buf = row_description(&["id", "desc"]);
    for i in 1..=rows {
        let id = i.to_string();
        let desc = row_desc(i);
        buf.extend_from_slice(&data_row(&[Some(&id), Some(&desc)]));
    }
    buf.extend_from_slice(&command_complete(&format!("SELECT {}", rows)));
    buf
}

/// Script for a database where `t` already holds `rows` rows
pub fn table_script(rows: usize) -> Script {
    database_script(Some(rows), rows)
}

/// Script for a database without `t`; the setup statement creates it with
/// `rows` rows, and only the first time
pub fn missing_table_script(rows: usize) -> Script {
    database_script(None, rows)
}

fn missing_relation() -> Vec<u8> {
    error_response("42P01", "relation \"t\" does not exist")
}

fn database_script(existing: Option<usize>, rows: usize) -> Script {
    let table = Arc::new(Mutex::new(existing));
    Arc::new(move |sql: &str| {
        let mut table = table.lock().unwrap();
        if sql.starts_with("CREATE TABLE IF NOT EXISTS t ") {
            if table.is_some() {
                let mut buf =
                    notice_response("42P07", "relation \"t\" already exists, skipping");
                buf.extend_from_slice(&command_complete("CREATE TABLE AS"));
                buf
            } else {
                *table = Some(rows);
                command_complete(&format!("SELECT {}", rows))
            }
        } else if sql.starts_with("CREATE TABLE t ") {
            if table.is_some() {
                error_response("42P07", "relation \"t\" already exists")
            } else {
                *table = Some(rows);
                command_complete(&format!("SELECT {}", rows))
            }
        } else if sql == "SELECT count(*) FROM t" {
            let Some(count) = *table else {
                return missing_relation();
            };
            let count = count.to_string();
            let mut buf = row_description(&["count"]);
            buf.extend_from_slice(&data_row(&[Some(&count)]));
            buf.extend_from_slice(&command_complete("SELECT 1"));
            buf
        } else if sql == "SELECT * FROM t" {
            match *table {
                Some(count) => table_response(count),
                None => missing_relation(),
            }
        } else {
            error_response("42601", &format!("syntax error at or near \"{}\"", sql))
        }
    })
}

//! Password authentication exchange
//!
//! Runs after the startup message until the server reports
//! AuthenticationOk. Supports trust, cleartext, MD5 and SCRAM-SHA-256;
//! the MD5 digest and the SCRAM state machine come from `postgres-protocol`.

use crate::connection::Connection;
use crate::wire_format::{
    AuthRequest,
    BackendMessage,
};
use crate::{
    Error,
    Result,
};
use bytes::BytesMut;
use postgres_protocol::authentication::{
    self,
    sasl::{
        self,
        ChannelBinding,
        ScramSha256,
    },
};
use postgres_protocol::message::frontend;
use tracing::{
    debug,
    warn,
};

/// Drive the authentication exchange to completion
pub async fn authenticate(
    conn: &mut Connection,
    user: &str,
    password: Option<&str>,
) -> Result<()> {
    let mut scram: Option<ScramSha256> = None;
    let mut buf = BytesMut::new();

    loop {
        let request = match conn.read_message().await? {
            BackendMessage::Authentication(request) => request,
            BackendMessage::ErrorResponse(err) => return Err(Error::Server(err)),
            BackendMessage::NoticeResponse(notice) => {
                warn!(code = %notice.code, "{}", notice.message);
                continue;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected message during authentication: {:?}",
                    other
                )))
            }
        };

        buf.clear();
        match request {
            AuthRequest::Ok => {
                debug!("Authentication successful");
                return Ok(());
            }
            AuthRequest::CleartextPassword => {
                warn!("Server requested a cleartext password");
                let pass = required_password(password)?;
                frontend::password_message(pass.as_bytes(), &mut buf)?;
                conn.send(&buf).await?;
            }
            AuthRequest::Md5Password(salt) => {
                debug!("Using MD5 password authentication");
                let pass = required_password(password)?;
                let hash = authentication::md5_hash(user.as_bytes(), pass.as_bytes(), salt);
                frontend::password_message(hash.as_bytes(), &mut buf)?;
                conn.send(&buf).await?;
            }
            AuthRequest::Sasl(mechanisms) => {
                if !mechanisms.iter().any(|m| m == sasl::SCRAM_SHA_256) {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism, server offered {:?}",
                        mechanisms
                    )));
                }
                debug!("Using SCRAM-SHA-256 authentication");
                let pass = required_password(password)?;
                let client = ScramSha256::new(pass.as_bytes(), ChannelBinding::unsupported());
                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, client.message(), &mut buf)?;
                conn.send(&buf).await?;
                scram = Some(client);
            }
            AuthRequest::SaslContinue(data) => {
                let client = scram.as_mut().ok_or_else(|| {
                    Error::Auth("SASL continue without SASL start".to_string())
                })?;
                client
                    .update(&data)
                    .map_err(|e| Error::Auth(format!("SCRAM error: {}", e)))?;
                frontend::sasl_response(client.message(), &mut buf)?;
                conn.send(&buf).await?;
            }
            AuthRequest::SaslFinal(data) => {
                let client = scram.as_mut().ok_or_else(|| {
                    Error::Auth("SASL final without SASL start".to_string())
                })?;
                client
                    .finish(&data)
                    .map_err(|e| Error::Auth(format!("Server verification failed: {}", e)))?;
            }
        }
    }
}

fn required_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| {
        Error::Auth("Server requested a password but none was configured".to_string())
    })
}

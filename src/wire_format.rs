//! Backend message decoding
//!
//! Bodies arrive from `Connection::read_message` as `Bytes` with the type
//! byte and length word already stripped. Decoding is synchronous and
//! zero-copy where the payload is binary (DataRow values, SASL data).

use crate::{
    error::ServerError,
    protocol::{
        AuthCode,
        BackendCode,
        TransactionStatus,
    },
    query::CommandTag,
    Error,
    Result,
};
use bytes::{
    Buf,
    Bytes,
};

/// A decoded server message
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    BackendKeyData { process_id: i32, secret_key: i32 },
    CommandComplete(CommandTag),
    /// Raw body; see [`decode_data_row`]
    DataRow(Bytes),
    EmptyQueryResponse,
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    NotificationResponse { process_id: i32, channel: String, payload: String },
    ParameterStatus { name: String, value: String },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
}

/// Authentication request from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password([u8; 4]),
    Sasl(Vec<String>),
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

/// Column metadata from RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl BackendMessage {
    /// Decode a message body for the given type byte
    pub fn decode(code: u8, mut body: Bytes) -> Result<Self> {
        let message = match BackendCode::try_from(code)? {
            BackendCode::Authentication => {
                BackendMessage::Authentication(decode_auth(&mut body)?)
            }
            BackendCode::BackendKeyData => BackendMessage::BackendKeyData {
                process_id: get_i32(&mut body, "BackendKeyData")?,
                secret_key: get_i32(&mut body, "BackendKeyData")?,
            },
            BackendCode::CommandComplete => {
                BackendMessage::CommandComplete(CommandTag::new(read_cstr(&mut body)?))
            }
            BackendCode::DataRow => BackendMessage::DataRow(body),
            BackendCode::EmptyQueryResponse => BackendMessage::EmptyQueryResponse,
            BackendCode::ErrorResponse => {
                BackendMessage::ErrorResponse(decode_error_fields(&mut body)?)
            }
            BackendCode::NoticeResponse => {
                BackendMessage::NoticeResponse(decode_error_fields(&mut body)?)
            }
            BackendCode::NotificationResponse => BackendMessage::NotificationResponse {
                process_id: get_i32(&mut body, "NotificationResponse")?,
                channel: read_cstr(&mut body)?,
                payload: read_cstr(&mut body)?,
            },
            BackendCode::ParameterStatus => BackendMessage::ParameterStatus {
                name: read_cstr(&mut body)?,
                value: read_cstr(&mut body)?,
            },
            BackendCode::ReadyForQuery => {
                if body.is_empty() {
                    return Err(Error::Protocol("ReadyForQuery without status".to_string()));
                }
                BackendMessage::ReadyForQuery(TransactionStatus::try_from(body.get_u8())?)
            }
            BackendCode::RowDescription => {
                BackendMessage::RowDescription(decode_row_description(&mut body)?)
            }
        };

        Ok(message)
    }
}

fn decode_auth(body: &mut Bytes) -> Result<AuthRequest> {
    let request = match AuthCode::try_from(get_i32(body, "Authentication")?)? {
        AuthCode::Ok => AuthRequest::Ok,
        AuthCode::CleartextPassword => AuthRequest::CleartextPassword,
        AuthCode::Md5Password => {
            if body.remaining() < 4 {
                return Err(Error::Protocol("MD5 request without salt".to_string()));
            }
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            AuthRequest::Md5Password(salt)
        }
        AuthCode::Sasl => {
            let mut mechanisms = Vec::new();
            // List is terminated by an empty string
            loop {
                let mechanism = read_cstr(body)?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthRequest::Sasl(mechanisms)
        }
        AuthCode::SaslContinue => AuthRequest::SaslContinue(body.split_off(0)),
        AuthCode::SaslFinal => AuthRequest::SaslFinal(body.split_off(0)),
    };

    Ok(request)
}

fn decode_row_description(body: &mut Bytes) -> Result<Vec<FieldDescription>> {
    let count = get_i16(body, "RowDescription")?;
    if count < 0 {
        return Err(Error::Protocol(format!("Negative field count: {}", count)));
    }

    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_cstr(body)?;
        if body.remaining() < 18 {
            return Err(Error::Protocol("RowDescription field truncated".to_string()));
        }
        fields.push(FieldDescription {
            name,
            table_oid: body.get_u32(),
            column_id: body.get_i16(),
            type_oid: body.get_u32(),
            type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: body.get_i16(),
        });
    }

    Ok(fields)
}

/// Decode a DataRow body into `values`, reusing its allocation.
///
/// Each value is a slice of `body`; `None` marks SQL NULL.
pub fn decode_data_row(body: &Bytes, values: &mut Vec<Option<Bytes>>) -> Result<()> {
    values.clear();

    let mut cursor = &body[..];
    if cursor.remaining() < 2 {
        return Err(Error::Protocol("DataRow truncated".to_string()));
    }
    let count = cursor.get_i16();
    if count < 0 {
        return Err(Error::Protocol(format!("Negative column count: {}", count)));
    }

    for _ in 0..count {
        if cursor.remaining() < 4 {
            return Err(Error::Protocol("DataRow column length truncated".to_string()));
        }
        let len = cursor.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }

        let len = len as usize;
        if cursor.remaining() < len {
            return Err(Error::Protocol(format!(
                "DataRow column needs {} bytes, have {}",
                len,
                cursor.remaining()
            )));
        }
        let start = body.len() - cursor.remaining();
        values.push(Some(body.slice(start..start + len)));
        cursor.advance(len);
    }

    Ok(())
}

fn decode_error_fields(body: &mut Bytes) -> Result<ServerError> {
    let mut fields = ServerError::default();

    loop {
        if !body.has_remaining() {
            return Err(Error::Protocol("Error fields not terminated".to_string()));
        }
        let kind = body.get_u8();
        if kind == 0 {
            break;
        }
        let value = read_cstr(body)?;
        match kind {
            // 'V' is the non-localized severity; prefer it when present
            b'S' if fields.severity.is_empty() => fields.severity = value,
            b'V' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            _ => {}
        }
    }

    Ok(fields)
}

/// Read a NUL-terminated string
fn read_cstr(body: &mut Bytes) -> Result<String> {
    let end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("Missing string terminator".to_string()))?;

    let raw = body.split_to(end);
    body.advance(1);

    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn get_i32(body: &mut Bytes, message: &str) -> Result<i32> {
    if body.remaining() < 4 {
        return Err(Error::Protocol(format!("{} truncated", message)));
    }
    Ok(body.get_i32())
}

fn get_i16(body: &mut Bytes, message: &str) -> Result<i16> {
    if body.remaining() < 2 {
        return Err(Error::Protocol(format!("{} truncated", message)));
    }
    Ok(body.get_i16())
}

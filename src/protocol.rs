/// Types of messages received from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendCode {
    Authentication = b'R',       // Authentication request or result
    BackendKeyData = b'K',       // Process id and secret key for cancel
    CommandComplete = b'C',      // Statement finished, carries command tag
    DataRow = b'D',              // One row of a result set
    EmptyQueryResponse = b'I',   // Query string was empty
    ErrorResponse = b'E',        // Statement or session failed
    NoticeResponse = b'N',       // Warning / informational message
    NotificationResponse = b'A', // LISTEN/NOTIFY payload
    ParameterStatus = b'S',      // Run-time parameter report
    ReadyForQuery = b'Z',        // Backend is idle and ready
    RowDescription = b'T',       // Column layout of the upcoming rows
}

impl TryFrom<u8> for BackendCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'R' => Ok(BackendCode::Authentication),
            b'K' => Ok(BackendCode::BackendKeyData),
            b'C' => Ok(BackendCode::CommandComplete),
            b'D' => Ok(BackendCode::DataRow),
            b'I' => Ok(BackendCode::EmptyQueryResponse),
            b'E' => Ok(BackendCode::ErrorResponse),
            b'N' => Ok(BackendCode::NoticeResponse),
            b'A' => Ok(BackendCode::NotificationResponse),
            b'S' => Ok(BackendCode::ParameterStatus),
            b'Z' => Ok(BackendCode::ReadyForQuery),
            b'T' => Ok(BackendCode::RowDescription),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown backend message type: {:?}",
                value as char
            ))),
        }
    }
}

/// Sub-codes of the Authentication message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthCode {
    Ok = 0,
    CleartextPassword = 3,
    Md5Password = 5,
    Sasl = 10,
    SaslContinue = 11,
    SaslFinal = 12,
}

impl TryFrom<i32> for AuthCode {
    type Error = crate::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthCode::Ok),
            3 => Ok(AuthCode::CleartextPassword),
            5 => Ok(AuthCode::Md5Password),
            10 => Ok(AuthCode::Sasl),
            11 => Ok(AuthCode::SaslContinue),
            12 => Ok(AuthCode::SaslFinal),
            // 2 (Kerberos), 7 (GSS), 9 (SSPI) are never offered to this client
            _ => Err(crate::Error::Auth(format!(
                "Unsupported authentication method: {}",
                value
            ))),
        }
    }
}

/// Transaction state reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown transaction status: {:?}",
                value as char
            ))),
        }
    }
}

/// Upper bound on a single backend message body
pub const MAX_MESSAGE_LEN: usize = 0x40000000;

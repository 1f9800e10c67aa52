use thiserror::Error;

/// Startup-level failures. Everything that can go wrong once the poll loop is running is folded into a
/// [`crate::sampler::Reading`] or a skipped publish instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    MQTTConnectionError(#[from] rumqttc::ConnectionError),

    #[error(transparent)]
    SerialError(#[from] tokio_serial::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(std::borrow::Cow<'static, str>),

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

/// Why a single Modbus read transaction did not yield register words.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no complete response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },

    #[error("device answered with exception code {0:#04x}")]
    Exception(u8),

    #[error(transparent)]
    Link(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(std::borrow::Cow<'static, str>),

    #[error("invalid request for {count} registers at {address:#06x}")]
    InvalidRequest { address: u16, count: u16 },
}

impl TransportError {
    /// Whether another attempt at the same transaction could plausibly succeed. Exception responses and
    /// rejected requests are answers, not line noise.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Exception(_) | Self::InvalidRequest { .. })
    }

    /// Short machine-friendly label, used in logs and in [`crate::sampler::Fault`].
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Crc { .. } => "crc",
            Self::Exception(_) => "exception",
            Self::Link(_) => "link",
            Self::UnexpectedResponse(_) => "unexpected_response",
            Self::InvalidRequest { .. } => "invalid_request",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} registers, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("value is not a finite number")]
    NotFinite,

    #[error("value does not fit the decimal range")]
    OutOfRange,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("could not connect to MQTT broker: {0}")]
    ConnectFailed(std::borrow::Cow<'static, str>),

    #[error("MQTT session lost: {0}")]
    SessionLost(std::borrow::Cow<'static, str>),
}

impl From<rumqttc::ClientError> for PublishError {
    fn from(error: rumqttc::ClientError) -> Self {
        Self::SessionLost(error.to_string().into())
    }
}

impl From<rumqttc::ConnectionError> for PublishError {
    fn from(error: rumqttc::ConnectionError) -> Self {
        Self::SessionLost(error.to_string().into())
    }
}

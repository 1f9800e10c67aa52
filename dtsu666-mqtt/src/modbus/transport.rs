use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::SerialStream;
use tracing::{debug, warn};

use super::frame::{self, HEADER_LEN};
use super::{Unit, MAX_READ_REGISTERS};
use crate::config::DeviceConfig;
use crate::error::TransportError;

pub const DEFAULT_RETRIES: u8 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long the link has to stay quiet before we consider stale bytes flushed.
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Anything able to read a run of holding registers from the meter.
#[async_trait]
pub trait RegisterReader: Send {
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError>;
}

/// Modbus RTU client over a byte stream, usually a serial port.
///
/// The transport owns the stream exclusively and `read` takes `&mut self`, so there is never more than one
/// transaction in flight on the half-duplex link.
pub struct RtuTransport<S> {
    link: S,
    unit: Unit,
    timeout: Duration,
    retries: u8,
    retry_delay: Duration,
}

/// Open the configured serial port and wrap it in an RTU transport.
pub fn open(config: &DeviceConfig) -> crate::Result<RtuTransport<SerialStream>> {
    let builder = tokio_serial::new(&config.serial_port, config.baud_rate)
        .data_bits(config.data_bits)
        .stop_bits(config.stop_bits)
        .parity(config.parity)
        .flow_control(tokio_serial::FlowControl::None);
    let port = SerialStream::open(&builder)?;
    debug!(port = %config.serial_port, baud_rate = config.baud_rate, "Opened serial port");

    Ok(RtuTransport::new(port, Unit(config.slave_id), config.timeout)
        .with_retries(config.retries)
        .with_retry_delay(config.retry_delay))
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(link: S, unit: Unit, timeout: Duration) -> Self {
        Self {
            link,
            unit,
            timeout,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Additional attempts after the first one fails.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Exactly one request/response exchange, without timeout or retry.
    async fn transact(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let request = frame::read_request(self.unit, address, count);
        self.link.write_all(&request).await?;
        self.link.flush().await?;

        let mut header = [0u8; HEADER_LEN];
        self.link.read_exact(&mut header).await?;

        let mut response = vec![0u8; frame::response_len(&header)];
        response[..HEADER_LEN].copy_from_slice(&header);
        self.link.read_exact(&mut response[HEADER_LEN..]).await?;

        frame::parse_read_response(&response, self.unit, count)
    }

    /// Wait out the inter-retry delay and throw away whatever the device may still be sending, so the next
    /// response is not read out of phase.
    async fn recover(&mut self) {
        let spread = self.retry_delay.as_millis() as u64 / 2;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        sleep(self.retry_delay + jitter).await;

        let mut scratch = [0u8; 64];
        while let Ok(Ok(read)) = timeout(DRAIN_WINDOW, self.link.read(&mut scratch)).await {
            if read == 0 {
                break;
            }
            debug!(discarded = read, "Discarded stale bytes");
        }
    }
}

#[async_trait]
impl<S> RegisterReader for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[tracing::instrument(level = "debug", skip(self))]
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        if count == 0
            || count > MAX_READ_REGISTERS
            || u32::from(address) + u32::from(count) > 0x1_0000
        {
            return Err(TransportError::InvalidRequest { address, count });
        }

        let mut attempt = 0;
        loop {
            let result = match timeout(self.timeout, self.transact(address, count)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.timeout)),
            };

            match result {
                Ok(words) => {
                    debug!(raw = ?words, "Read registers");
                    return Ok(words);
                }
                Err(error) if error.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(%error, attempt, "Modbus read failed, retrying");
                    self.recover().await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

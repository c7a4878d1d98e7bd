//! Communication context.
//!
//! A [`ModbusContext`] owns one transport link and everything needed to run
//! exchanges over it: the framing variant, the two timeouts, the transaction
//! id counter and the frame-tracing flag. A context is driven by a single
//! caller at a time; every exchange is strictly synchronous (a new query
//! must not be issued before the previous response has been handled).
//!
//! The receive engine lives here. In master mode the expected response size
//! is known up front from the query; in server mode the size is discovered
//! incrementally by a three-state machine that grows the expectation as the
//! function code and byte-count fields become visible. The only suspension
//! points are the timed reads and the writes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, warn};

#[cfg(feature = "rtu")]
use crate::config::SerialConfig;
use crate::config::{ErrorRecovery, TcpConfig};
use crate::constants::{
    DEFAULT_BYTE_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, MAX_PACKET_SIZE, RECV_BUFFER_SIZE,
    SERVER_WAIT_TIMEOUT,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{self, Framing};
use crate::transport::Transport;

/// The configured link variant
enum LinkConfig {
    Tcp(TcpConfig),
    #[cfg(feature = "rtu")]
    Serial(SerialConfig),
    #[cfg(test)]
    Mem,
}

/// Receive-engine state while the query size is still being discovered
enum ReadState {
    /// Waiting for the function code
    Function,
    /// Waiting for the byte-count field (or the fixed body)
    Byte,
    /// The full frame length is known
    Complete,
}

/// Internal receive outcome; a timeout keeps the byte count received so far
/// because an exception response is shorter than any computed success size.
pub(crate) enum RecvError {
    TimedOut { received: usize },
    Failed(ModbusError),
}

/// A Modbus communication endpoint over one serial line or TCP socket.
///
/// Create it with [`ModbusContext::new_tcp`] or [`ModbusContext::new_rtu`],
/// open the link with [`connect`](ModbusContext::connect) (master) or
/// [`accept`](ModbusContext::accept) (TCP server), run exchanges, then
/// [`close`](ModbusContext::close) it.
pub struct ModbusContext {
    framing: Framing,
    config: LinkConfig,
    link: Option<Transport>,
    listener: Option<TcpListener>,
    server_mode: bool,
    t_id: u16,
    response_timeout: Duration,
    byte_timeout: Duration,
    trace_frames: bool,
}

impl ModbusContext {
    fn new(framing: Framing, config: LinkConfig) -> Self {
        Self {
            framing,
            config,
            link: None,
            listener: None,
            server_mode: false,
            t_id: 0,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            byte_timeout: DEFAULT_BYTE_TIMEOUT,
            trace_frames: false,
        }
    }

    /// Context for MBAP framing over TCP.
    pub fn new_tcp(config: TcpConfig) -> Self {
        Self::new(Framing::Tcp, LinkConfig::Tcp(config))
    }

    /// Context for RTU framing over a serial line.
    #[cfg(feature = "rtu")]
    pub fn new_rtu(config: SerialConfig) -> Self {
        Self::new(Framing::Rtu, LinkConfig::Serial(config))
    }

    /// Context over an in-memory stream, for driving the receive engine in
    /// tests; returns the far end of the pipe.
    #[cfg(test)]
    pub(crate) fn from_memory(framing: Framing) -> (Self, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(RECV_BUFFER_SIZE);
        let mut context = Self::new(framing, LinkConfig::Mem);
        context.link = Some(Transport::Mem(near));
        (context, far)
    }

    /// The framing variant this context was created with.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// True once a link is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Set the response timeout (wait for the first byte after a query) and
    /// the inter-byte timeout (wait between bytes inside a frame).
    pub fn set_timeouts(&mut self, response: Duration, byte: Duration) {
        self.response_timeout = response;
        self.byte_timeout = byte;
    }

    /// Log a hex dump of every frame sent and received at debug level.
    pub fn set_frame_tracing(&mut self, enabled: bool) {
        self.trace_frames = enabled;
    }

    /// Open the link: TCP connect or serial line setup.
    pub async fn connect(&mut self) -> ModbusResult<()> {
        let link = match &self.config {
            LinkConfig::Tcp(config) => Transport::connect_tcp(config).await?,
            #[cfg(feature = "rtu")]
            LinkConfig::Serial(config) => Transport::open_serial(config)?,
            #[cfg(test)]
            LinkConfig::Mem => return Err(ModbusError::configuration("memory link is fixed")),
        };
        self.link = Some(link);
        Ok(())
    }

    /// Bind the listening socket of a TCP server context and return the
    /// local address. Useful on its own when binding port 0.
    pub async fn bind(&mut self) -> ModbusResult<SocketAddr> {
        let LinkConfig::Tcp(config) = &self.config else {
            return Err(ModbusError::configuration(
                "listening requires a TCP context",
            ));
        };
        let listener = Transport::bind_tcp(config).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| ModbusError::io("bind", e))?;
        self.listener = Some(listener);
        self.server_mode = true;
        Ok(addr)
    }

    /// Accept exactly one client on a TCP server context, binding first if
    /// [`bind`](ModbusContext::bind) has not been called. The accepted
    /// stream becomes the context link and the listener is released.
    pub async fn accept(&mut self) -> ModbusResult<SocketAddr> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().expect("listener bound above");
        let (link, peer) = Transport::accept_tcp(&listener).await?;
        self.link = Some(link);
        Ok(peer)
    }

    /// Close the link. The serial line settings are restored by the port
    /// teardown; a TCP socket is shut down on both sides.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.listener = None;
    }

    /// Pre-incremented transaction id, wrapping to 0 after 65535. The first
    /// query of a context carries id 1.
    pub(crate) fn next_transaction_id(&mut self) -> u16 {
        self.t_id = self.t_id.wrapping_add(1);
        self.t_id
    }

    /// Seal a frame (append the CRC or patch the MBAP length) and write it.
    pub(crate) async fn send_frame(&mut self, packet: &mut [u8], len: usize) -> ModbusResult<()> {
        let len = frame::seal(self.framing, packet, len);
        if self.trace_frames {
            debug!("send {}", hex_dump(&packet[..len]));
        }

        let link = self.link.as_mut().ok_or(ModbusError::NotConnected)?;
        if let Err(e) = link.write_all(&packet[..len]).await {
            let err = ModbusError::io("write", e);
            self.recover_after_error().await;
            return Err(err);
        }
        Ok(())
    }

    /// Receive one frame.
    ///
    /// With `expected` set (master mode) the engine reads until that many
    /// bytes have arrived, waiting `response_timeout` for the first byte and
    /// `byte_timeout` between bytes. Without it (server mode) the engine
    /// waits up to a minute for a query and discovers its size with the
    /// state machine. No byte is interpreted before it has been read.
    pub(crate) async fn receive_frame(
        &mut self,
        expected: Option<usize>,
        buf: &mut [u8; RECV_BUFFER_SIZE],
    ) -> Result<usize, RecvError> {
        let framing = self.framing;
        let byte_timeout = self.byte_timeout;
        let trace_frames = self.trace_frames;

        let (mut expected_len, mut state, mut wait) = match expected {
            Some(len) => (len, ReadState::Complete, self.response_timeout),
            None => (
                framing.header_len() + 2,
                ReadState::Function,
                SERVER_WAIT_TIMEOUT,
            ),
        };

        let link = self
            .link
            .as_mut()
            .ok_or(RecvError::Failed(ModbusError::NotConnected))?;
        let mut received = 0usize;

        loop {
            let want = (expected_len - received).min(RECV_BUFFER_SIZE - received);
            let n = match timeout(wait, link.read(&mut buf[received..received + want])).await {
                Err(_) => return Err(RecvError::TimedOut { received }),
                Ok(Err(e)) => return Err(RecvError::Failed(ModbusError::io("read", e))),
                Ok(Ok(0)) => return Err(RecvError::Failed(ModbusError::ConnectionClosed)),
                Ok(Ok(n)) => n,
            };

            if trace_frames {
                debug!("recv {}", hex_dump(&buf[received..received + n]));
            }

            received += n;
            if received > MAX_PACKET_SIZE {
                return Err(RecvError::Failed(ModbusError::TooManyData {
                    max: MAX_PACKET_SIZE,
                }));
            }

            // Advance as far as the bytes in hand allow; a stage can add
            // zero bytes (no body, or no checksum under TCP).
            while received >= expected_len {
                match state {
                    ReadState::Function => {
                        let function = buf[framing.header_len() + 1];
                        expected_len += frame::query_header_extra(function);
                        state = ReadState::Byte;
                    }
                    ReadState::Byte => {
                        expected_len += frame::query_data_extra(framing, buf);
                        state = ReadState::Complete;
                    }
                    ReadState::Complete => return Ok(received),
                }
            }

            wait = byte_timeout;
        }
    }

    /// Put the link back in a usable state after a failed exchange: flush
    /// the serial buffers, or close and reconnect a TCP master whose policy
    /// is [`ErrorRecovery::Reconnect`]. Server links are left alone; the
    /// serve loop observes the error and the application decides.
    pub(crate) async fn recover_after_error(&mut self) {
        #[cfg(feature = "rtu")]
        if matches!(self.config, LinkConfig::Serial(_)) {
            if let Some(link) = &self.link {
                link.discard_buffers();
            }
            return;
        }

        let reconnect = !self.server_mode
            && matches!(
                &self.config,
                LinkConfig::Tcp(config) if config.error_recovery == ErrorRecovery::Reconnect
            );
        if reconnect {
            warn!("exchange failed, reconnecting");
            self.close().await;
            if let Err(e) = self.connect().await {
                warn!(error = %e, "reconnect failed");
            }
        }
    }
}

/// Hex dump for frame tracing, two digits per byte.
fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

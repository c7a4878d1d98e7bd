//! Unified transport over a TCP socket or a serial line.
//!
//! The two link kinds (plus an in-memory stream for tests) live behind one
//! enum so the context can read and write without caring which wire is
//! underneath. Connection establishment, the single-client TCP accept path
//! and the serial line setup are here too.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

#[cfg(feature = "rtu")]
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

#[cfg(feature = "rtu")]
use crate::config::SerialConfig;
use crate::config::TcpConfig;
use crate::error::{ModbusError, ModbusResult};

/// IP type-of-service low-delay hint, set on connected sockets
const IPTOS_LOWDELAY: u32 = 0x10;

/// An open link carrying Modbus frames
pub(crate) enum Transport {
    /// Connected or accepted TCP stream
    Tcp(TcpStream),
    /// Open serial line
    #[cfg(feature = "rtu")]
    Serial(SerialStream),
    /// In-memory stream used by the receive-engine tests
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl Transport {
    /// Connect to a TCP peer with Nagle disabled and the low-delay
    /// type-of-service hint set.
    pub(crate) async fn connect_tcp(config: &TcpConfig) -> ModbusResult<Self> {
        debug!(host = %config.host, port = config.port, "connecting");

        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| ModbusError::io("connect", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::io("connect", e))?;
        SockRef::from(&stream)
            .set_tos(IPTOS_LOWDELAY)
            .map_err(|e| ModbusError::io("connect", e))?;

        Ok(Transport::Tcp(stream))
    }

    /// Bind the listening socket for a TCP server context.
    ///
    /// The protocol serves one master at a time, so the socket listens with
    /// a backlog of a single connection.
    pub(crate) async fn bind_tcp(config: &TcpConfig) -> ModbusResult<TcpListener> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|e| ModbusError::io("bind", e))?
            .next()
            .ok_or_else(|| {
                ModbusError::configuration(format!("cannot resolve bind address {}", config.host))
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ModbusError::io("bind", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ModbusError::io("bind", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ModbusError::io("bind", e))?;
        socket.listen(1).map_err(|e| ModbusError::io("bind", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ModbusError::io("bind", e))?;

        TcpListener::from_std(socket.into()).map_err(|e| ModbusError::io("bind", e))
    }

    /// Accept exactly one client on a bound listener.
    pub(crate) async fn accept_tcp(listener: &TcpListener) -> ModbusResult<(Self, SocketAddr)> {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| ModbusError::io("accept", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::io("accept", e))?;

        info!(%peer, "client connected");
        Ok((Transport::Tcp(stream), peer))
    }

    /// Open and configure the serial line.
    ///
    /// The line is raw: no echo, no canonical input, no software flow
    /// control; parity checking on input follows the parity setting. The
    /// previous line settings are restored by the port teardown on drop.
    #[cfg(feature = "rtu")]
    pub(crate) fn open_serial(config: &SerialConfig) -> ModbusResult<Self> {
        let baud_rate = config.effective_baud();
        debug!(device = %config.device, baud_rate, "opening serial line");

        let builder = tokio_serial::new(&config.device, baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(tokio_serial::FlowControl::None);

        let stream = SerialStream::open(&builder)
            .map_err(|e| ModbusError::io("open serial line", e.into()))?;

        Ok(Transport::Serial(stream))
    }

    /// Read whatever is available into `buf`, up to its length.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf).await,
            #[cfg(feature = "rtu")]
            Transport::Serial(port) => port.read(buf).await,
            #[cfg(test)]
            Transport::Mem(stream) => stream.read(buf).await,
        }
    }

    /// Write a whole frame.
    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(buf).await,
            #[cfg(feature = "rtu")]
            Transport::Serial(port) => {
                port.write_all(buf).await?;
                port.flush().await
            }
            #[cfg(test)]
            Transport::Mem(stream) => stream.write_all(buf).await,
        }
    }

    /// Drop unread input and unsent output after a failed exchange.
    ///
    /// Only meaningful on the serial line, where stale bytes would corrupt
    /// the next frame.
    pub(crate) fn discard_buffers(&self) {
        match self {
            #[cfg(feature = "rtu")]
            Transport::Serial(port) => {
                if let Err(e) = port.clear(ClearBuffer::All) {
                    debug!(error = %e, "failed to flush serial buffers");
                }
            }
            _ => {}
        }
    }

    /// Shut the link down.
    pub(crate) async fn close(&mut self) {
        match self {
            Transport::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
            #[cfg(feature = "rtu")]
            Transport::Serial(_) => {
                // Dropping the stream restores the saved line settings and
                // closes the descriptor.
            }
            #[cfg(test)]
            Transport::Mem(_) => {}
        }
    }
}

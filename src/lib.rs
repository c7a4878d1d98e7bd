//! # Ferrobus - Modbus RTU/TCP Master & Slave Library
//!
//! A Modbus protocol implementation in pure Rust covering both sides of the
//! wire: a master (client) issuing read/write function codes to remote
//! servers, and a slave (server) answering queries out of its own
//! register/coil map. Both the RTU framing (serial line, CRC-16 trailer) and
//! the TCP framing (MBAP header) are supported through one
//! [`ModbusContext`] type.
//!
//! ## Features
//!
//! - **Two framings, one API**: RTU and TCP contexts expose the same verbs
//! - **Master and slave**: read/write operations plus a dispatch loop over a
//!   caller-owned [`ModbusMapping`]
//! - **Incremental receive engine**: frame sizes are derived from the
//!   function code as bytes arrive; no flag variables, no guesswork
//! - **Async I/O**: Tokio sockets and serial lines, with the response and
//!   inter-byte timeouts under caller control
//! - **Stack-allocated frames**: a frame never exceeds 260 bytes and never
//!   touches the heap on the encode path
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | yes | yes |
//! | 0x02 | Read Discrete Inputs | yes | yes |
//! | 0x03 | Read Holding Registers | yes | yes |
//! | 0x04 | Read Input Registers | yes | yes |
//! | 0x05 | Write Single Coil | yes | yes |
//! | 0x06 | Write Single Register | yes | yes |
//! | 0x07 | Read Exception Status | yes | yes |
//! | 0x0F | Write Multiple Coils | yes | yes |
//! | 0x10 | Write Multiple Registers | yes | yes |
//! | 0x11 | Report Slave ID | yes | yes |
//!
//! ## Master Quick Start
//!
//! ```rust,no_run
//! use ferrobus::{ModbusContext, ModbusResult, TcpConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut ctx = ModbusContext::new_tcp(TcpConfig::new("192.168.1.10"));
//!     ctx.connect().await?;
//!
//!     let values = ctx.read_holding_registers(1, 0, 10).await?;
//!     println!("registers: {values:?}");
//!
//!     ctx.write_single_register(1, 100, 0x1234).await?;
//!
//!     ctx.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Slave Quick Start
//!
//! ```rust,no_run
//! use ferrobus::{ModbusContext, ModbusMapping, ModbusResult, TcpConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut mapping = ModbusMapping::new(500, 500, 500, 500);
//!     mapping.holding_registers_mut()[0] = 0x1234;
//!
//!     let mut ctx = ModbusContext::new_tcp(TcpConfig::with_port("0.0.0.0", 1502));
//!     ctx.accept().await?;
//!
//!     loop {
//!         ctx.serve_once(&mut mapping).await?;
//!     }
//! }
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on the official specification
pub mod constants;

/// CRC-16 codec for RTU framing
pub mod crc;

/// Frame layout, query/response builders and the size oracle
pub mod frame;

/// Bit packing helpers for coil payloads
pub mod bitpack;

/// Transport configuration types
pub mod config;

/// Server-side data map
pub mod mapping;

/// The communication context and receive engine
pub mod context;

mod client;
mod server;
mod transport;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use ferrobus::tokio) ===
pub use tokio;

// === Core API ===
pub use context::ModbusContext;
pub use error::{ModbusError, ModbusException, ModbusResult};
pub use frame::Framing;
pub use mapping::ModbusMapping;

// === Configuration ===
#[cfg(feature = "rtu")]
pub use config::SerialConfig;
pub use config::{DataBits, ErrorRecovery, Parity, StopBits, TcpConfig};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    DEFAULT_TCP_PORT, MAX_PACKET_SIZE, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

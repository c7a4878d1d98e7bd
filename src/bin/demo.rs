//! Ferrobus demo: a TCP slave serving a small data map, or a master poking
//! at one.
//!
//! Usage:
//!   cargo run --bin demo slave [port]
//!   cargo run --bin demo master [host:port]

use std::env;
use std::time::Duration;

use ferrobus::{ModbusContext, ModbusError, ModbusMapping, TcpConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let role = args.next().unwrap_or_else(|| "master".to_string());

    match role.as_str() {
        "slave" => {
            let port: u16 = args.next().as_deref().unwrap_or("1502").parse()?;
            run_slave(port).await
        }
        "master" => {
            let target = args.next().unwrap_or_else(|| "127.0.0.1:1502".to_string());
            run_master(&target).await
        }
        other => {
            eprintln!("unknown role {other:?}; use \"master\" or \"slave\"");
            std::process::exit(2);
        }
    }
}

async fn run_slave(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let mut mapping = ModbusMapping::new(500, 500, 500, 500);
    mapping.holding_registers_mut()[0] = 0x1234;
    mapping.holding_registers_mut()[1] = 0x5678;
    mapping.input_registers_mut()[0] = 42;
    mapping.discrete_inputs_mut()[3] = true;

    let mut ctx = ModbusContext::new_tcp(TcpConfig::with_port("0.0.0.0", port));
    ctx.set_frame_tracing(true);

    println!("waiting for a master on port {port}...");
    let peer = ctx.accept().await?;
    println!("serving {peer}");

    loop {
        match ctx.serve_once(&mut mapping).await {
            Ok(()) => {}
            Err(ModbusError::Timeout { .. }) => continue,
            Err(ModbusError::ConnectionClosed) => {
                println!("master disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_master(target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or("target must look like host:port")?;

    let mut ctx = ModbusContext::new_tcp(TcpConfig::with_port(host, port.parse()?));
    ctx.set_timeouts(Duration::from_millis(500), Duration::from_millis(50));
    ctx.connect().await?;
    println!("connected to {target}");

    let registers = ctx.read_holding_registers(1, 0, 4).await?;
    println!("holding[0..4]  = {registers:04X?}");

    ctx.write_single_register(1, 2, 0xBEEF).await?;
    let registers = ctx.read_holding_registers(1, 0, 4).await?;
    println!("after write    = {registers:04X?}");

    ctx.write_multiple_coils(1, 0, &[true, false, true, true]).await?;
    let coils = ctx.read_coils(1, 0, 4).await?;
    println!("coils[0..4]    = {coils:?}");

    let inputs = ctx.read_discrete_inputs(1, 0, 8).await?;
    println!("inputs[0..8]   = {inputs:?}");

    let id = ctx.report_slave_id(1).await?;
    println!("slave id bytes = {id:02X?}");

    ctx.close().await;
    Ok(())
}

//! Ferrite Modbus Demo
//!
//! Starts an in-process Modbus TCP server backed by a small memory device,
//! connects a master to it over loopback, and walks through:
//! - register and coil reads/writes (FC01/03/05/06/10)
//! - read/write multiple registers in one exchange (FC23)
//! - an exception response for an out-of-range address
//! - device identification with paging (FC43/0x0E)
//!
//! Usage: cargo run --bin demo

use std::time::Duration;

use ferrite_modbus::{
    DeviceHandler, DeviceIdentity, ExceptionCode, ModbusMaster, ModbusServer, ReadDeviceIdCode,
    TcpFrameTransport,
};

/// Memory-backed device model for the demo server.
struct MemoryDevice {
    coils: [bool; 64],
    holding: [u16; 64],
    identity: DeviceIdentity,
}

impl MemoryDevice {
    fn new() -> Self {
        let mut holding = [0u16; 64];
        holding[0] = 0x1234;
        holding[1] = 0x5678;
        Self {
            coils: [false; 64],
            holding,
            identity: DeviceIdentity::basic("Ferrite Modbus", "FM-DEMO", env!("CARGO_PKG_VERSION"))
                .with_object(0x03, "https://example.invalid/ferrite".as_bytes().to_vec()),
        }
    }

    fn coil_slice(&mut self, start: u16, len: usize) -> Result<&mut [bool], ExceptionCode> {
        let start = start as usize;
        self.coils
            .get_mut(start..start + len)
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    fn holding_slice(&mut self, start: u16, len: usize) -> Result<&mut [u16], ExceptionCode> {
        let start = start as usize;
        self.holding
            .get_mut(start..start + len)
            .ok_or(ExceptionCode::IllegalDataAddress)
    }
}

impl DeviceHandler for MemoryDevice {
    fn read_coils(&mut self, start: u16, coils: &mut [bool]) -> Result<(), ExceptionCode> {
        let slice = self.coil_slice(start, coils.len())?;
        coils.copy_from_slice(slice);
        Ok(())
    }

    fn read_holding_registers(
        &mut self,
        start: u16,
        registers: &mut [u16],
    ) -> Result<(), ExceptionCode> {
        let slice = self.holding_slice(start, registers.len())?;
        registers.copy_from_slice(slice);
        Ok(())
    }

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ExceptionCode> {
        self.coil_slice(address, 1)?[0] = value;
        Ok(())
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        self.holding_slice(address, 1)?[0] = value;
        Ok(())
    }

    fn write_multiple_registers(
        &mut self,
        start: u16,
        values: &[u16],
    ) -> Result<(), ExceptionCode> {
        self.holding_slice(start, values.len())?.copy_from_slice(values);
        Ok(())
    }

    fn device_identity(&self) -> Option<&DeviceIdentity> {
        Some(&self.identity)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("{}", ferrite_modbus::info());
    println!("=====================================\n");

    let timeout = Duration::from_secs(2);

    // =========================================================================
    // Server setup: TCP listener feeding transports into the server
    // =========================================================================
    let mut server = ModbusServer::new(1, MemoryDevice::new())?;
    server.start()?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    println!("📡 Server listening on {address}, device address 1");

    let server_ref = &server;
    let accept = async {
        if let Ok((stream, peer)) = listener.accept().await {
            println!("   accepted connection from {peer}");
            server_ref
                .add_transport(Box::new(TcpFrameTransport::from_stream(stream)))
                .await?;
        }
        Ok::<(), ferrite_modbus::ModbusError>(())
    };

    // =========================================================================
    // Master connection
    // =========================================================================
    let connect = TcpFrameTransport::connect(address, timeout);
    let (accepted, transport) = tokio::join!(accept, connect);
    accepted?;
    let mut master = ModbusMaster::new(transport?);
    println!("🔌 Master connected\n");

    // =========================================================================
    // Read operations
    // =========================================================================
    println!("📖 Read operations");
    let registers = master.read_03(1, 0, 2, timeout).await?;
    println!("   FC03 holding registers 0-1: {registers:04X?}");

    let coils = master.read_01(1, 0, 8, timeout).await?;
    println!("   FC01 coils 0-7: {coils:?}");

    // =========================================================================
    // Write operations
    // =========================================================================
    println!("\n✏️  Write operations");
    master.write_06(1, 5, 0xBEEF, timeout).await?;
    println!("   FC06 wrote register 5 = 0xBEEF");

    master.write_05(1, 3, true, timeout).await?;
    println!("   FC05 wrote coil 3 = ON");

    master.write_10(1, 8, &[0x0001, 0x0002, 0x0003], timeout).await?;
    println!("   FC16 wrote registers 8-10");

    let check = master.read_03(1, 5, 1, timeout).await?;
    println!("   read-back register 5: {:#06X}", check[0]);

    // =========================================================================
    // Combined read/write
    // =========================================================================
    println!("\n🔁 FC23 read/write in one exchange");
    let values = master
        .read_write_17(1, 8, 3, 8, &[0x0A0A, 0x0B0B, 0x0C0C], timeout)
        .await?;
    println!("   wrote registers 8-10, read back: {values:04X?}");

    // =========================================================================
    // Exception handling
    // =========================================================================
    println!("\n⚠️  Exception responses");
    match master.read_03(1, 60, 10, timeout).await {
        Err(e) => println!("   FC03 past the register map -> {e}"),
        Ok(_) => println!("   unexpectedly succeeded"),
    }

    // =========================================================================
    // Device identification
    // =========================================================================
    println!("\n🏷️  Device identification (FC43/0x0E)");
    let ident = master
        .read_device_identification(1, ReadDeviceIdCode::Regular, 0, Duration::from_secs(4))
        .await?;
    println!(
        "   vendor: {:?}, product: {:?}, revision: {:?}",
        ident.vendor_name(),
        ident.product_code(),
        ident.revision()
    );

    // =========================================================================
    // Statistics and shutdown
    // =========================================================================
    let stats = master.get_stats();
    println!("\n📊 Master transport statistics");
    println!("   frames sent: {}, received: {}", stats.frames_sent, stats.frames_received);
    println!("   bytes sent: {}, received: {}", stats.bytes_sent, stats.bytes_received);

    let server_stats = server.stats().await;
    println!("📊 Server statistics");
    println!(
        "   frames: {}, dispatched: {}, responses: {}, exceptions: {}",
        server_stats.frames_received,
        server_stats.requests_dispatched,
        server_stats.responses_sent,
        server_stats.exceptions_sent
    );

    master.close().await?;
    server.stop().await?;

    println!("\n🎉 Demo completed!");
    Ok(())
}

//! Lists attached CH341 adapters and what each one supports.
//!
//! Run with: cargo run --example enumerate_hardware

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("CH341 Device Enumeration Example");
    println!("================================\n");

    let registry = ch341_usb::global()?;
    let devices = registry.list_devices(None)?;
    if devices.is_empty() {
        println!("  No CH341 devices found.");
        return Ok(());
    }

    for (index, identity) in devices.iter().enumerate() {
        println!("  Device [{}]: {}", index, identity.id_string());
        match registry.open(index) {
            Ok(device) => {
                let caps = device.capabilities();
                println!("    Chip: {:?}, strap: {:?}", caps.chip, caps.strap);
                println!("    Stream commands (I2C/SPI): {}", caps.streams);
                println!("    EPP 1.9 / ECP: {} / {}", caps.epp19, caps.ecp);
                println!("    Largest EPP/MEM block: {} bytes", caps.epp_block_max);
                registry.close(index);
            }
            Err(e) => println!("    Could not open: {}", e),
        }
        println!();
    }

    println!("Driver interface version: 0x{:02X}", ch341_usb::driver_version());
    Ok(())
}

use ch341_usb::{self, I2cSpeed, Personality, Result};

fn main() -> Result<()> {
    env_logger::init();
    let registry = ch341_usb::global()?;
    println!("Opening first CH341 device...");
    let device = match registry.open(0) {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("Error opening device: {}", e);
            eprintln!(
                "Ensure device is connected and permissions are set (e.g., udev rules on Linux)."
            );
            return Err(e);
        }
    };
    println!("Device opened ({:?}).", device.chip_version());

    println!("Setting I2C speed to 100kHz...");
    device.set_mode(Personality::I2c(I2cSpeed::Standard))?;

    println!("Scanning I2C bus (7-bit addresses 0x08 to 0x77)...");
    let found_devices = device.i2c_scan(0x08, 0x77)?;

    for &addr in &found_devices {
        println!("Device found at 7-bit 0x{:02X}", addr);
    }

    if found_devices.is_empty() {
        println!("No I2C devices found.");
    } else {
        println!(
            "Scan complete. Found 7-bit addresses: {:?}",
            found_devices
                .iter()
                .map(|a| format!("0x{:02X}", a))
                .collect::<Vec<_>>()
        );
    }

    registry.close(0);
    Ok(())
}

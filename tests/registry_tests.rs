//! Session registry behavior: opening, closing, exclusivity and configuration.

mod common;

use ch341_usb::packet::decode_response;
use ch341_usb::{
    ChipVersion, DeviceRegistry, DriverCommand, Error, I2cSpeed, Parity, Personality, Result,
    CH341_SERIAL_PID,
};
use common::{init_logging, SimBus, SimDevice};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn single() -> (DeviceRegistry, Arc<SimDevice>) {
    init_logging();
    let dev = SimDevice::ch341a(3);
    let registry = DeviceRegistry::new(SimBus::with_devices(&[Arc::clone(&dev)]));
    (registry, dev)
}

#[test]
fn test_open_missing_index_fails() {
    let (registry, _dev) = single();
    assert!(matches!(
        registry.open(5),
        Err(Error::DeviceUnavailable { index: 5, .. })
    ));
    assert!(matches!(
        registry.open(16),
        Err(Error::DeviceUnavailable { index: 16, .. })
    ));
}

#[test]
fn test_close_is_idempotent() -> Result<()> {
    let (registry, dev) = single();
    let device = registry.open(0)?;
    assert_eq!(dev.opens.load(Ordering::SeqCst), 1);

    registry.close(0);
    registry.close(0);
    registry.close(11);
    registry.close(99);
    assert_eq!(dev.releases.load(Ordering::SeqCst), 1);

    assert!(!device.is_open());
    assert!(matches!(
        device.get_input(),
        Err(Error::DeviceUnavailable { index: 0, .. })
    ));
    drop(device);
    assert_eq!(dev.releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_reopen_shares_session() -> Result<()> {
    let (registry, dev) = single();
    let a = registry.open(0)?;
    let b = registry.open(0)?;
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(dev.opens.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_exclusive_rejects_second_open() -> Result<()> {
    let (registry, _dev) = single();
    registry.open(0)?;
    registry.set_exclusive(0, true)?;
    assert!(matches!(
        registry.open(0),
        Err(Error::ExclusivityViolation { index: 0 })
    ));
    registry.set_exclusive(0, false)?;
    registry.open(0)?;

    registry.set_exclusive(0, true)?;
    registry.close(0);
    registry.open(0)?;
    Ok(())
}

#[test]
fn test_exclusive_holds_across_registry_clones() -> Result<()> {
    let (registry, _dev) = single();
    let other = registry.clone();
    registry.open(0)?;
    registry.set_exclusive(0, true)?;
    assert!(matches!(
        other.open(0),
        Err(Error::ExclusivityViolation { .. })
    ));
    Ok(())
}

#[test]
fn test_indices_map_to_enumeration_order() -> Result<()> {
    init_logging();
    let old = SimDevice::ch341(2);
    let new = SimDevice::ch341a(5);
    let registry = DeviceRegistry::new(SimBus::with_devices(&[old, new]));
    assert_eq!(registry.list_devices(None)?.len(), 2);
    registry.open(0)?;
    registry.open(1)?;
    assert_eq!(registry.chip_version(0)?, ChipVersion::Ch341);
    assert_eq!(registry.chip_version(1)?, ChipVersion::Ch341A3);
    assert_eq!(registry.session(0)?.capabilities().epp_block_max, 31);
    assert_eq!(registry.session(1)?.capabilities().epp_block_max, 255);
    Ok(())
}

#[test]
fn test_timeouts_and_sentinel() -> Result<()> {
    let (registry, _dev) = single();
    let device = registry.open(0)?;
    assert_eq!(device.config().read_timeout, None);
    registry.set_timeouts(0, 250, 0xFFFF_FFFF)?;
    let config = device.config();
    assert_eq!(config.write_timeout, Some(Duration::from_millis(250)));
    assert_eq!(config.read_timeout, None);
    Ok(())
}

#[test]
fn test_read_times_out() -> Result<()> {
    let (registry, _dev) = single();
    let device = registry.open(0)?;
    registry.set_timeouts(0, 100, 100)?;
    let mut buf = [0u8; 8];
    assert!(matches!(device.read(&mut buf), Err(Error::Timeout)));
    Ok(())
}

#[test]
fn test_mode_validation() -> Result<()> {
    let (registry, _dev) = single();
    registry.open(0)?;
    assert!(matches!(
        registry.set_mode(
            0,
            Personality::Serial {
                parity: Parity::None,
                baud: 9600
            }
        ),
        Err(Error::UnsupportedMode(_))
    ));
    registry.set_mode(0, Personality::I2c(I2cSpeed::Fast))?;
    assert_eq!(
        registry.session(0)?.personality(),
        Some(Personality::I2c(I2cSpeed::Fast))
    );
    Ok(())
}

#[test]
fn test_serial_strap_rejects_bus_modes() -> Result<()> {
    init_logging();
    let dev = SimDevice::new(6, CH341_SERIAL_PID, 0x30);
    let registry = DeviceRegistry::new(SimBus::with_devices(&[dev]));
    registry.open(0)?;
    assert!(matches!(
        registry.set_mode(0, Personality::Spi { msb_first: true }),
        Err(Error::UnsupportedMode(_))
    ));
    Ok(())
}

#[test]
fn test_driver_command_envelope() -> Result<()> {
    let (registry, dev) = single();
    let device = registry.open(0)?;

    let request = DriverCommand::new(0x01, &[])?.to_bytes();
    let (status, data) = decode_response(&device.execute(&request)?)?;
    assert_eq!(status, 0);
    assert_eq!(data, ch341_usb::driver_version().to_le_bytes().to_vec());

    // Standard GET_DESCRIPTOR through the control pipe
    let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0x00];
    let reply = device.driver_command(&DriverCommand::new(0x04, &setup)?)?;
    assert_eq!(reply.status(), 0);
    assert_eq!(&reply.data[8..12], &[0x86, 0x1A, 0x12, 0x55]);

    // Unknown control requests come back as the transport's own status
    let setup = [0xC0, 0x77, 0, 0, 0, 0, 1, 0];
    let reply = device.driver_command(&DriverCommand::new(0x04, &setup)?)?;
    assert_eq!(reply.status(), 0xFFFF_FFF7);

    let mut timeouts = 300u32.to_le_bytes().to_vec();
    timeouts.extend(400u32.to_le_bytes());
    device.driver_command(&DriverCommand::new(0x09, &timeouts)?)?;
    assert_eq!(device.config().read_timeout, Some(Duration::from_millis(400)));

    assert!(matches!(
        device.execute(&[0x01, 0x00]),
        Err(Error::MalformedPacket(_))
    ));
    assert!(dev.calls() > 0);
    Ok(())
}

#[test]
fn test_reset_clears_chip_side_state() -> Result<()> {
    let (registry, dev) = single();
    let device = registry.open(0)?;
    device.set_para_mode(ch341_usb::ParallelMode::Mem)?;
    device.reset_device()?;
    assert_eq!(dev.resets.load(Ordering::SeqCst), 1);
    assert_eq!(device.para_mode(), None);
    Ok(())
}

#[test]
fn test_descriptors() -> Result<()> {
    let (registry, _dev) = single();
    let device = registry.open(0)?;
    let descriptor = device.device_descriptor()?;
    assert_eq!(descriptor.len(), 18);
    assert_eq!(descriptor[1], 1);
    assert_eq!(device.config_descriptor()?[1], 2);
    assert!(device.device_name().contains("VID_1A86&PID_5512"));
    Ok(())
}

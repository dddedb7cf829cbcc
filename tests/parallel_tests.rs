//! Parallel port modes, block channels, MEM access, printer and PIO output.

mod common;

use ch341_usb::{
    DeviceRegistry, Error, MemIo, ParallelMode, Personality, Result, CH341_PRINTER_PID,
};
use common::{init_logging, SimBus, SimDevice};
use std::sync::Arc;

fn setup(dev: Arc<SimDevice>) -> DeviceRegistry {
    init_logging();
    DeviceRegistry::new(SimBus::with_devices(&[dev]))
}

#[test]
fn test_mode_change_is_idempotent() -> Result<()> {
    let dev = SimDevice::ch341a(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;

    device.set_para_mode(ParallelMode::Epp19)?;
    device.set_para_mode(ParallelMode::Epp19)?;
    assert_eq!(dev.vendor_writes(), vec![(0xB1, 0x0100, 0)]);

    device.init_parallel(ParallelMode::Mem)?;
    assert_eq!(dev.vendor_writes().last(), Some(&(0xB1, 0x0202, 0)));
    assert_eq!(device.para_mode(), Some(ParallelMode::Mem));
    Ok(())
}

#[test]
fn test_block_io_needs_a_mode() -> Result<()> {
    let dev = SimDevice::ch341a(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;
    assert!(matches!(device.read_data0(4), Err(Error::UnsupportedMode(_))));

    device.set_para_mode(ParallelMode::Mem)?;
    assert!(matches!(
        device.epp_write_data(&[1]),
        Err(Error::UnsupportedMode(_))
    ));
    Ok(())
}

#[test]
fn test_epp_channels() -> Result<()> {
    let dev = SimDevice::ch341a(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;
    registry.set_mode(0, Personality::Parallel(ParallelMode::Epp17))?;

    let data: Vec<u8> = (0..255).map(|i| i as u8).collect();
    assert_eq!(device.epp_write_data(&data)?, 255);
    assert_eq!(dev.channel(0), data);
    device.epp_set_addr(0x3C)?;
    assert_eq!(dev.channel(1), vec![0x3C]);

    assert_eq!(device.epp_read_data(255)?, data);
    assert_eq!(device.epp_read_addr(1)?, vec![0x3C]);
    assert!(matches!(
        device.epp_read_data(256),
        Err(Error::TransferTooLarge { max: 255, actual: 256 })
    ));
    Ok(())
}

#[test]
fn test_old_chip_block_limit() -> Result<()> {
    let dev = SimDevice::ch341(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;
    device.set_para_mode(ParallelMode::Epp17)?;
    assert!(matches!(
        device.set_para_mode(ParallelMode::Epp19),
        Err(Error::UnsupportedMode(_))
    ));

    dev.queue_channel(0, &[7; 31]);
    assert_eq!(device.read_data0(31)?, vec![7; 31]);
    let before = dev.calls();
    assert!(matches!(
        device.write_data0(&[0; 32]),
        Err(Error::TransferTooLarge { max: 31, actual: 32 })
    ));
    assert_eq!(dev.calls(), before);
    Ok(())
}

#[test]
fn test_mem_address_sequence() -> Result<()> {
    let dev = SimDevice::ch341a(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;
    device.set_para_mode(ParallelMode::Mem)?;

    let read = device.mem_io_addr(&[
        MemIo::Write { addr: 0x12, data: 0xAB },
        MemIo::Write { addr: 0x7F, data: 0x01 },
        MemIo::Read { addr: 0x12 },
        MemIo::Read { addr: 0x7F },
    ])?;
    assert_eq!(read, vec![0xAB, 0x01]);
    assert_eq!(dev.mem_reg(0x12), 0xAB);

    assert!(matches!(
        device.mem_io_addr(&[MemIo::Read { addr: 0x80 }]),
        Err(Error::ArgumentOutOfRange(_))
    ));

    assert_eq!(device.mem_write_addr1(&[0x10, 0x20])?, 2);
    assert_eq!(device.mem_read_addr1(2)?, vec![0x10, 0x20]);
    Ok(())
}

#[test]
fn test_printer_output() -> Result<()> {
    let dev = SimDevice::new(1, CH341_PRINTER_PID, 0x30);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;

    let text = b"Hello, printer!\n".repeat(8);
    assert_eq!(device.print_out(&text)?, text.len());
    assert_eq!(dev.printed(), text);
    assert!(dev.written().iter().all(|p| p[0] == 0xA3 && p.len() <= 32));

    assert!(matches!(
        device.print_out(&vec![0; 4097]),
        Err(Error::TransferTooLarge { max: 4096, .. })
    ));
    Ok(())
}

#[test]
fn test_pio_stream() -> Result<()> {
    let dev = SimDevice::ch341a(1);
    let registry = setup(Arc::clone(&dev));
    let device = registry.open(0)?;
    let stream: Vec<u8> = (0..40).collect();
    device.pio_stream(&stream)?;
    assert_eq!(dev.pio(), stream);
    Ok(())
}

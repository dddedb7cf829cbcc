//! Prints CH341 arrivals and removals until interrupted.

use ch341_usb::DeviceEvent;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let registry = ch341_usb::global()?;
    let filter = std::env::args().nth(1);
    let notifications = registry.watch_devices(filter.as_deref())?;
    println!("Watching for CH341 devices (Ctrl+C to stop)...");

    for notification in notifications {
        match notification.event {
            DeviceEvent::Arrived => println!("+ {}", notification.id()),
            DeviceEvent::RemovePending => println!("- {} (closing)", notification.id()),
            DeviceEvent::Removed => println!("- {}", notification.id()),
        }
    }
    Ok(())
}

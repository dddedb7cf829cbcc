//! GPIO functionality for CH341 devices.
//!
//! `set_output` drives up to 20 pin bits: D7..D0 (bits 0-7), the parallel
//! control and status pins (bits 8-15) and the extra outputs (bits 16-19).
//! The chip cannot report directions back, so the session keeps a host-side
//! shadow of the last direction and data words it sent.

use crate::consts::{gpio, para, uio};
use crate::device::Ch341;
use crate::error::{Error, Result};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioLevel {
    Low,
    High,
}

/// Represents a valid GPIO pin bit (0-19).
/// Use `GpioPin::new(num)` to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpioPin(u8);

impl GpioPin {
    /// Creates a new GpioPin, returning an error if the number is out of range (0-19).
    pub fn new(pin_num: u8) -> Result<Self> {
        if pin_num < gpio::PIN_COUNT {
            Ok(GpioPin(pin_num))
        } else {
            Err(Error::ArgumentOutOfRange(format!(
                "GPIO pin must be 0-{} (got {})",
                gpio::PIN_COUNT - 1,
                pin_num
            )))
        }
    }

    /// Returns the underlying pin bit number.
    #[inline]
    pub fn number(&self) -> u8 {
        self.0
    }

    /// Returns the bit mask (1 << number) for the 20-bit pin words.
    #[inline]
    pub fn mask(&self) -> u32 {
        1u32 << self.0
    }

    /// `set_output` enable flags that update this pin's data and direction.
    fn enable_flags(&self) -> (u8, u8) {
        match self.0 {
            0..=7 => (gpio::ENABLE_DATA_0_7, gpio::ENABLE_DIR_0_7),
            8..=15 => (gpio::ENABLE_DATA_8_15, gpio::ENABLE_DIR_8_15),
            _ => (gpio::ENABLE_DATA_16_19, 0),
        }
    }
}

/// Builds the 11-byte `set_output` packet.
pub fn encode_set_output(enable: u8, dir: u32, data: u32) -> Vec<u8> {
    let mut packet = vec![0u8; para::SET_OUTPUT_LENGTH];
    packet[0] = para::CMD_SET_OUTPUT;
    packet[1] = para::SET_OUTPUT_MAGIC;
    packet[2] = enable & gpio::ENABLE_MASK;
    packet[3] = ((data >> 8) & 0xEF) as u8;
    packet[4] = (((dir >> 8) & 0xEF) | 0x10) as u8;
    packet[5] = (data & 0xFF) as u8;
    packet[6] = (dir & 0xFF) as u8;
    packet[7] = ((data >> 16) & 0x0F) as u8;
    packet
}

/// Applies `enable` to a shadow (direction, data) pair.
fn merge_shadow(enable: u8, shadow: (u32, u32), dir: u32, data: u32) -> (u32, u32) {
    let (mut cur_dir, mut cur_data) = shadow;
    let take = |flag: u8, mask: u32, target: &mut u32, value: u32| {
        if enable & flag != 0 {
            *target = (*target & !mask) | (value & mask);
        }
    };
    take(gpio::ENABLE_DATA_8_15, 0x0000_FF00, &mut cur_data, data);
    take(gpio::ENABLE_DIR_8_15, 0x0000_FF00, &mut cur_dir, dir);
    take(gpio::ENABLE_DATA_0_7, 0x0000_00FF, &mut cur_data, data);
    take(gpio::ENABLE_DIR_0_7, 0x0000_00FF, &mut cur_dir, dir);
    take(gpio::ENABLE_DATA_16_19, 0x000F_0000, &mut cur_data, data);
    (cur_dir, cur_data)
}

impl Ch341 {
    // --- GPIO Methods ---

    /// Sets pin directions and output levels. `enable` selects which groups
    /// of `dir` and `data` take effect (see [`crate::flags::gpio`]).
    pub fn set_output(&self, enable: u8, dir: u32, data: u32) -> Result<()> {
        if enable & !gpio::ENABLE_MASK != 0 {
            return Err(Error::ArgumentOutOfRange(format!(
                "set_output enable flags 0x{:02X} outside 0x{:02X}",
                enable,
                gpio::ENABLE_MASK
            )));
        }
        let packet = encode_set_output(enable, dir, data);
        trace!(
            "set_output enable=0x{:02X} dir=0x{:05X} data=0x{:05X}",
            enable,
            dir,
            data
        );
        self.send_command(&[packet])?;
        let mut state = self.state.lock();
        let (new_dir, new_data) = merge_shadow(enable, (state.gpio_dir, state.gpio_data), dir, data);
        state.gpio_dir = new_dir;
        state.gpio_data = new_data;
        Ok(())
    }

    /// Drives D5..D0 through the UIO stream.
    pub fn set_d5_d0(&self, dir: u8, data: u8) -> Result<()> {
        self.require_streams("UIO stream")?;
        let packet = vec![
            uio::CMD_UIO_STREAM,
            uio::STM_OUT | (data & uio::VALUE_MASK),
            uio::STM_DIR | (dir & uio::VALUE_MASK),
            uio::STM_END,
        ];
        self.send_command(&[packet])?;
        let mut state = self.state.lock();
        let mask = u32::from(uio::VALUE_MASK);
        state.gpio_dir = (state.gpio_dir & !mask) | (u32::from(dir) & mask);
        state.gpio_data = (state.gpio_data & !mask) | (u32::from(data) & mask);
        Ok(())
    }

    /// Host-side shadow of (direction, data).
    pub fn gpio_shadow(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.gpio_dir, state.gpio_data)
    }

    pub fn gpio_set_direction(&self, pin: GpioPin, direction: GpioDirection) -> Result<()> {
        let (_, dir_flag) = pin.enable_flags();
        if dir_flag == 0 {
            return Err(Error::ArgumentOutOfRange(format!(
                "pin {} is output-only",
                pin.number()
            )));
        }
        let (dir, data) = self.gpio_shadow();
        let new_dir = match direction {
            GpioDirection::Output => dir | pin.mask(),
            GpioDirection::Input => dir & !pin.mask(),
        };
        debug!("GPIO pin {} direction -> {:?}", pin.number(), direction);
        self.set_output(dir_flag, new_dir, data)
    }

    pub fn gpio_get_direction(&self, pin: GpioPin) -> GpioDirection {
        let (dir, _) = self.gpio_shadow();
        if pin.number() >= 16 || dir & pin.mask() != 0 {
            GpioDirection::Output
        } else {
            GpioDirection::Input
        }
    }

    pub fn gpio_write(&self, pin: GpioPin, level: GpioLevel) -> Result<()> {
        let (data_flag, _) = pin.enable_flags();
        let (dir, data) = self.gpio_shadow();
        let new_data = match level {
            GpioLevel::High => data | pin.mask(),
            GpioLevel::Low => data & !pin.mask(),
        };
        trace!("GPIO pin {} -> {:?}", pin.number(), level);
        self.set_output(data_flag, dir, new_data)
    }

    /// Reads a pin level from the status word.
    pub fn gpio_read(&self, pin: GpioPin) -> Result<GpioLevel> {
        let input = self.get_input()?;
        Ok(if input & pin.mask() != 0 {
            GpioLevel::High
        } else {
            GpioLevel::Low
        })
    }

    /// Writes D7..D0 as outputs in one packet.
    pub fn gpio_write_data_byte(&self, value: u8) -> Result<()> {
        let (dir, data) = self.gpio_shadow();
        self.set_output(
            gpio::ENABLE_DATA_0_7 | gpio::ENABLE_DIR_0_7,
            dir | 0xFF,
            (data & !0xFF) | u32::from(value),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_output_packet_layout() {
        let packet = encode_set_output(0x1F, 0x000F_FFFF, 0x000F_FFFF);
        assert_eq!(
            packet,
            vec![0xA1, 0x6A, 0x1F, 0xEF, 0xFF, 0xFF, 0xFF, 0x0F, 0, 0, 0]
        );
        let packet = encode_set_output(0x03, 0x0000_0000, 0x0000_1000);
        assert_eq!(packet[3], 0x00, "bit 12 of data is never driven");
        assert_eq!(packet[4], 0x10, "bit 12 of direction is always set");
    }

    #[test]
    fn test_shadow_merge_respects_enable() {
        let shadow = (0x000F_C000, 0);
        let merged = merge_shadow(gpio::ENABLE_DATA_0_7, shadow, 0xFFFF_FFFF, 0x0000_00A5);
        assert_eq!(merged, (0x000F_C000, 0x0000_00A5));
        let merged = merge_shadow(gpio::ENABLE_DIR_8_15, merged, 0x0000_0100, 0);
        assert_eq!(merged, (0x000F_0100, 0x0000_00A5));
    }

    #[test]
    fn test_pin_range() {
        assert!(GpioPin::new(19).is_ok());
        assert!(GpioPin::new(20).is_err());
        assert_eq!(GpioPin::new(9).unwrap().mask(), 0x200);
    }
}

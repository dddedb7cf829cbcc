//! UART configuration for CH341 devices strapped as a serial bridge.
//!
//! Data moves through [`Ch341::read`] and [`Ch341::write`]; this module only
//! programs the baud generator and the line-control register.

use crate::consts::{serial, vendor};
use crate::device::{Ch341, Strap};
use crate::error::{Error, Result};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    fn lcr_bits(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => serial::LCR_ENABLE_PAR,
            Parity::Even => serial::LCR_ENABLE_PAR | serial::LCR_PAR_EVEN,
            Parity::Mark => serial::LCR_ENABLE_PAR | serial::LCR_MARK_SPACE,
            Parity::Space => {
                serial::LCR_ENABLE_PAR | serial::LCR_MARK_SPACE | serial::LCR_PAR_EVEN
            }
        }
    }
}

/// Line-control register for 8 data bits, 1 stop bit and `parity`.
pub fn line_control(parity: Parity) -> u8 {
    serial::LCR_ENABLE_RX | serial::LCR_ENABLE_TX | serial::LCR_CS8 | parity.lcr_bits()
}

/// Baud generator setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaudDivisor {
    /// Prescaler selection (0-3).
    pub prescaler: u8,
    /// Base clock halving flag (0 halves the clock).
    pub fact: u8,
    pub divisor: u16,
    /// Rate the setting actually produces.
    pub actual_rate: f64,
}

impl BaudDivisor {
    /// Value of the prescaler/divisor register pair.
    pub fn register(&self) -> u16 {
        ((0x100 - self.divisor) << 8) | (u16::from(self.fact) << 2) | u16::from(self.prescaler)
    }
}

#[inline]
fn clk_div(prescaler: u32, fact: u32) -> u32 {
    1 << (12 - 3 * prescaler - fact)
}

#[inline]
fn min_rate(prescaler: u32) -> u32 {
    serial::CLOCK_RATE / (clk_div(prescaler, 1) * 512)
}

/// Finds the prescaler, clock factor and divisor closest to `baud`.
pub fn baud_divisor(baud: u32) -> Result<BaudDivisor> {
    if !(serial::MIN_BAUD..=serial::MAX_BAUD).contains(&baud) {
        return Err(Error::ArgumentOutOfRange(format!(
            "baud rate {} outside {}..={}",
            baud,
            serial::MIN_BAUD,
            serial::MAX_BAUD
        )));
    }
    // Highest base clock whose divisor stays below 512
    let prescaler = (0..=3u32)
        .rev()
        .find(|&ps| baud > min_rate(ps))
        .ok_or_else(|| Error::ArgumentOutOfRange(format!("baud rate {} too low", baud)))?;

    let clock = u64::from(serial::CLOCK_RATE);
    let speed = u64::from(baud);
    let mut fact = 1u32;
    let mut div_clk = u64::from(clk_div(prescaler, fact));
    let mut div = clock / (div_clk * speed);

    if !(9..=255).contains(&div) {
        div /= 2;
        div_clk *= 2;
        fact = 0;
    }
    if div < 2 {
        return Err(Error::ArgumentOutOfRange(format!("baud rate {} too high", baud)));
    }
    // Round to the nearest divisor; scaled to keep precision at low rates
    if 16 * clock / (div_clk * div) - 16 * speed >= 16 * speed - 16 * clock / (div_clk * (div + 1)) {
        div += 1;
    }
    if fact == 1 && div % 2 == 0 {
        div /= 2;
        fact = 0;
        div_clk *= 2;
    }

    Ok(BaudDivisor {
        prescaler: prescaler as u8,
        fact: fact as u8,
        divisor: div as u16,
        actual_rate: serial::CLOCK_RATE as f64 / (div_clk * div) as f64,
    })
}

impl Ch341 {
    // --- UART ---

    /// Configures 8 data bits, 1 stop bit, `parity` and `baud`.
    pub fn setup_serial(&self, parity: Parity, baud: u32) -> Result<()> {
        if self.capabilities.strap != Strap::Serial {
            return Err(Error::UnsupportedMode(format!(
                "UART needs the serial strap (PID 0x5523), found PID 0x{:04X}",
                self.identity.pid
            )));
        }
        let divisor = baud_divisor(baud)?;
        let mut reg = divisor.register();
        if self.capabilities.version >= serial::NO_WAIT_MIN_VERSION {
            reg |= serial::DIVISOR_NO_WAIT;
        }
        let lcr = line_control(parity);
        debug!(
            "Session {}: UART {} baud (actual {:.1}), {:?} parity, divisor reg 0x{:04X}, lcr 0x{:02X}",
            self.index, baud, divisor.actual_rate, parity, reg, lcr
        );
        self.vendor_write(vendor::SERIAL_INIT, 0, 0)?;
        self.vendor_write(vendor::SERIAL_WRITE_REG, vendor::SERIAL_REG_DIVISOR, reg)?;
        self.vendor_write(vendor::SERIAL_WRITE_REG, vendor::SERIAL_REG_LCR, u16::from(lcr))?;
        Ok(())
    }
}

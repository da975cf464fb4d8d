//! Board flash
//!
//! Wraps the RP2040 QSPI flash driver for the record service. Programming
//! NOR cells only clears bits, so a word may be programmed again as long
//! as no bit has to go back to 1; the record map uses that to mark items
//! removed.

use embassy_rp::flash::{Async, Error, Flash};
use embassy_rp::peripherals::FLASH;
use embedded_storage_async::nor_flash::{ErrorType, MultiwriteNorFlash, NorFlash, ReadNorFlash};

/// Flash size on the board
pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Record partition at the end of flash
pub const PARTITION_SIZE: usize = 64 * 1024;

type RpFlash = Flash<'static, FLASH, Async, FLASH_SIZE>;

/// RP2040 flash with multiwrite support
pub struct BoardFlash(RpFlash);

impl BoardFlash {
    pub fn new(flash: RpFlash) -> Self {
        Self(flash)
    }
}

impl ErrorType for BoardFlash {
    type Error = Error;
}

impl ReadNorFlash for BoardFlash {
    const READ_SIZE: usize = <RpFlash as ReadNorFlash>::READ_SIZE;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        ReadNorFlash::read(&mut self.0, offset, bytes).await
    }

    fn capacity(&self) -> usize {
        ReadNorFlash::capacity(&self.0)
    }
}

impl NorFlash for BoardFlash {
    const WRITE_SIZE: usize = <RpFlash as NorFlash>::WRITE_SIZE;
    const ERASE_SIZE: usize = <RpFlash as NorFlash>::ERASE_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        NorFlash::erase(&mut self.0, from, to).await
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        NorFlash::write(&mut self.0, offset, bytes).await
    }
}

impl MultiwriteNorFlash for BoardFlash {}

//! Hardware boundary of the driver
//!
//! Everything the driver does to the chip goes through [`ScriptProcessor`]:
//! port- or memory-mapped register accesses plus the interrupt line level.
//! Status registers unstack on read, so implementations must not cache or
//! replay them; the dispatcher reads each at most once per service pass.

use super::regs::Reg;

/// Register-level access to one script processor
pub trait ScriptProcessor {
    fn read8(&mut self, reg: Reg) -> u8;
    fn read32(&mut self, reg: Reg) -> u32;
    fn write8(&mut self, reg: Reg, val: u8);
    fn write32(&mut self, reg: Reg, val: u32);

    /// Level of the interrupt line
    fn irq(&self) -> bool;
}

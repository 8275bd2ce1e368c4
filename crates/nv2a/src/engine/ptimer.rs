//! Timer (PTIMER).
//!
//! A 56-bit tick counter scaled from the host monotonic clock by a
//! numerator/denominator pair, plus an alarm register.

use bitos::bitos;

use crate::Nv2a;

pub const INTR_0: u32 = 0x100;
pub const INTR_EN_0: u32 = 0x140;
pub const NUMERATOR: u32 = 0x200;
pub const DENOMINATOR: u32 = 0x210;
pub const TIME_0: u32 = 0x400;
pub const TIME_1: u32 = 0x410;
pub const ALARM_0: u32 = 0x420;

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupt {
    #[bits(0)]
    pub alarm: bool,
}

#[derive(Debug)]
pub struct Interface {
    pub pending_interrupts: Interrupt,
    pub enabled_interrupts: Interrupt,
    pub numerator: u32,
    pub denominator: u32,
    pub alarm_time: u32,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            pending_interrupts: Interrupt::default(),
            enabled_interrupts: Interrupt::default(),
            numerator: 1,
            denominator: 1,
            alarm_time: 0,
        }
    }
}

impl Interface {
    /// Level of this engine's line into the PMC aggregator.
    pub fn intr(&self) -> bool {
        self.pending_interrupts.to_bits() & self.enabled_interrupts.to_bits() != 0
    }

    /// Current tick count, scaled from elapsed host nanoseconds.
    pub fn clock(&self, elapsed_ns: u64) -> u64 {
        if self.denominator == 0 {
            return 0;
        }

        (u128::from(elapsed_ns) * u128::from(self.numerator) / u128::from(self.denominator))
            as u64
    }
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    let ptimer = nv.ptimer.lock().unwrap();
    match offset {
        INTR_0 => ptimer.pending_interrupts.to_bits(),
        INTR_EN_0 => ptimer.enabled_interrupts.to_bits(),
        NUMERATOR => ptimer.numerator,
        DENOMINATOR => ptimer.denominator,
        TIME_0 => ((ptimer.clock(nv.elapsed_ns()) & 0x7FF_FFFF) << 5) as u32,
        TIME_1 => ((ptimer.clock(nv.elapsed_ns()) >> 27) & 0x1FFF_FFFF) as u32,
        ALARM_0 => ptimer.alarm_time,
        _ => {
            tracing::warn!("unimplemented read from PTIMER register 0x{offset:03X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    match offset {
        INTR_0 => {
            let mut ptimer = nv.ptimer.lock().unwrap();
            let cleared = ptimer.pending_interrupts.to_bits() & !value;
            ptimer.pending_interrupts = Interrupt::from_bits(cleared);
            drop(ptimer);
            nv.update_irq();
        }
        INTR_EN_0 => {
            nv.ptimer.lock().unwrap().enabled_interrupts = Interrupt::from_bits(value);
            nv.update_irq();
        }
        NUMERATOR => nv.ptimer.lock().unwrap().numerator = value,
        DENOMINATOR => nv.ptimer.lock().unwrap().denominator = value,
        ALARM_0 => nv.ptimer.lock().unwrap().alarm_time = value,
        _ => {
            tracing::warn!(
                "unimplemented write of 0x{value:08X} to PTIMER register 0x{offset:03X}"
            );
        }
    }
}

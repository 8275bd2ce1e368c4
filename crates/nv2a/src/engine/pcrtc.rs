//! CRT controller (PCRTC).

use bitos::bitos;

use crate::Nv2a;

pub const INTR_0: u32 = 0x100;
pub const INTR_EN_0: u32 = 0x140;
pub const START: u32 = 0x800;

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupt {
    #[bits(0)]
    pub vblank: bool,
}

#[derive(Debug, Default)]
pub struct Interface {
    pub pending_interrupts: Interrupt,
    pub enabled_interrupts: Interrupt,
    /// Scanout base address in guest memory.
    pub start: u32,
}

impl Interface {
    /// Level of this engine's line into the PMC aggregator.
    pub fn intr(&self) -> bool {
        self.pending_interrupts.to_bits() & self.enabled_interrupts.to_bits() != 0
    }
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    let pcrtc = nv.pcrtc.lock().unwrap();
    match offset {
        INTR_0 => pcrtc.pending_interrupts.to_bits(),
        INTR_EN_0 => pcrtc.enabled_interrupts.to_bits(),
        START => pcrtc.start,
        _ => {
            tracing::warn!("unimplemented read from PCRTC register 0x{offset:03X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    match offset {
        INTR_0 => {
            // write one to clear
            let mut pcrtc = nv.pcrtc.lock().unwrap();
            let cleared = pcrtc.pending_interrupts.to_bits() & !value;
            pcrtc.pending_interrupts = Interrupt::from_bits(cleared);
            drop(pcrtc);
            nv.update_irq();
        }
        INTR_EN_0 => {
            nv.pcrtc.lock().unwrap().enabled_interrupts = Interrupt::from_bits(value);
            nv.update_irq();
        }
        START => nv.pcrtc.lock().unwrap().start = value,
        _ => {
            tracing::warn!(
                "unimplemented write of 0x{value:08X} to PCRTC register 0x{offset:03X}"
            );
        }
    }
}

/// Latches the vertical blank interrupt. Called by the embedder once per
/// frame, at whatever cadence it presents at.
pub fn vblank(nv: &Nv2a) {
    nv.pcrtc.lock().unwrap().pending_interrupts.set_vblank(true);
    nv.update_irq();
}

//! Master control (PMC).
//!
//! Owns the chip identification registers, the engine enable mask and the
//! top-level interrupt registers that fold every engine's line into the
//! single IRQ the device presents to the host.

use bitos::bitos;

use crate::Nv2a;

pub const BOOT_0: u32 = 0x000;
pub const INTR_0: u32 = 0x100;
pub const INTR_EN_0: u32 = 0x140;
pub const ENABLE: u32 = 0x200;

/// Chip id and stepping of the NV2A as found on retail hardware.
const BOOT_ID: u32 = 0x02A0_00A3;

/// Per-engine interrupt lines as folded into `INTR_0`.
#[bitos(32)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptSources {
    #[bits(8)]
    pub pfifo: bool,
    #[bits(12)]
    pub pgraph: bool,
    #[bits(20)]
    pub ptimer: bool,
    #[bits(24)]
    pub pcrtc: bool,
    #[bits(28)]
    pub pbus: bool,
    /// The only latched bit: raised and cleared by writes alone.
    #[bits(31)]
    pub software: bool,
}

impl std::fmt::Debug for InterruptSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        macro_rules! debug {
            ($($ident:ident),*) => {
                $(
                    if self.$ident() {
                        set.entry(&stringify!($ident));
                    }
                )*
            };
        }

        debug! {
            pfifo,
            pgraph,
            ptimer,
            pcrtc,
            pbus,
            software
        }

        set.finish_non_exhaustive()
    }
}

/// Engine enable mask.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineEnable {
    #[bits(8)]
    pub pfifo: bool,
    #[bits(12)]
    pub pgraph: bool,
}

impl Default for EngineEnable {
    fn default() -> Self {
        Self::from_bits(0).with_pfifo(true).with_pgraph(true)
    }
}

#[derive(Debug, Default)]
pub struct Interface {
    pub enabled_interrupts: InterruptSources,
    pub software_pending: bool,
    pub enable: EngineEnable,
}

/// Returns which interrupt sources are active (i.e. asserted but maybe
/// masked). All lines except `software` are levels derived from the owning
/// engine's own pending/enable pair.
///
/// Takes each engine lock briefly; the caller must hold none of them.
pub fn get_active_interrupts(nv: &Nv2a) -> InterruptSources {
    let mut sources = InterruptSources::default();
    sources.set_pfifo(nv.pfifo.lock().unwrap().intr());
    sources.set_pgraph(nv.pgraph.lock().unwrap().intr());
    sources.set_ptimer(nv.ptimer.lock().unwrap().intr());
    sources.set_pcrtc(nv.pcrtc.lock().unwrap().intr());
    sources.set_software(nv.pmc.lock().unwrap().software_pending);
    sources
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    match offset {
        BOOT_0 => BOOT_ID,
        INTR_0 => get_active_interrupts(nv).to_bits(),
        INTR_EN_0 => nv.pmc.lock().unwrap().enabled_interrupts.to_bits(),
        ENABLE => nv.pmc.lock().unwrap().enable.to_bits(),
        _ => {
            tracing::warn!("unimplemented read from PMC register 0x{offset:03X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    match offset {
        INTR_0 => {
            // only the software line is writable; the rest are levels
            let written = InterruptSources::from_bits(value);
            if written.software() {
                nv.pmc.lock().unwrap().software_pending = false;
            }
            nv.update_irq();
        }
        INTR_EN_0 => {
            nv.pmc.lock().unwrap().enabled_interrupts = InterruptSources::from_bits(value);
            nv.update_irq();
        }
        ENABLE => {
            let written = EngineEnable::from_bits(value);
            let previous = {
                let mut pmc = nv.pmc.lock().unwrap();
                std::mem::replace(&mut pmc.enable, written)
            };

            // disabling an engine resets it and releases anything stuck
            // waiting inside it
            if previous.pfifo() && !written.pfifo() {
                tracing::debug!("PFIFO disabled, resetting");
                nv.pfifo.lock().unwrap().reset();
                nv.cache_cond.notify_all();
            }

            if previous.pgraph() && !written.pgraph() {
                tracing::debug!("PGRAPH disabled, resetting");
                nv.pgraph.lock().unwrap().reset();
                nv.interrupt_cond.notify_all();
                nv.fifo_access_cond.notify_all();
            }

            nv.update_irq();
        }
        _ => {
            tracing::warn!("unimplemented write of 0x{value:08X} to PMC register 0x{offset:03X}");
        }
    }
}

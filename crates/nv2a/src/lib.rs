//! Emulation of the NV2A, the graphics processor of the original Xbox.
//!
//! The device is a set of register blocks behind a single MMIO aperture.
//! Work arrives through PFIFO: the guest writes a pushbuffer into its own
//! memory and bumps a channel's put pointer, the pusher decodes the buffer
//! inline on that register write, and a dedicated puller thread drains the
//! decoded commands into the graphics engine, resolving object handles
//! through the RAMHT hash table in instance memory.
//!
//! Lock order, where locks nest at all: PFIFO before USER, PGRAPH before
//! guest memory. [`Nv2a::update_irq`] takes every engine lock briefly and
//! must be called with none of them held.

pub mod engine;
pub mod mem;
pub mod primitive;

#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::engine::bus::Block;
use crate::engine::{pcrtc, pfifo, pgraph, pmc, ptimer, user};
use crate::mem::{SystemRam, Window};

pub use crate::primitive::Primitive;

/// Length of the instance memory window.
pub const RAMIN_LEN: u32 = 0x10_0000;

/// The host interrupt line the device's aggregated interrupt state drives.
/// Edge-triggered: called only on transitions.
pub trait IrqLine: Send + Sync {
    fn raise(&self);
    fn lower(&self);
}

/// Device configuration.
#[derive(Debug, Default)]
pub struct Config {
    /// Base of the instance memory window inside guest RAM. Defaults to the
    /// last megabyte, where the kernel places it on real hardware.
    pub ramin_base: Option<u32>,
}

/// The NV2A device.
///
/// Shared between the guest I/O context and the puller thread; all state is
/// behind per-engine locks, so MMIO entry points take `&self`.
pub struct Nv2a {
    /// Guest system RAM. Framebuffers, pushbuffers and instance memory all
    /// live here.
    pub mem: Arc<SystemRam>,
    /// The instance memory window inside guest RAM.
    pub ramin: Window,

    pub pmc: Mutex<pmc::Interface>,
    pub pfifo: Mutex<pfifo::Interface>,
    pub pgraph: Mutex<pgraph::Interface>,
    pub pcrtc: Mutex<pcrtc::Interface>,
    pub ptimer: Mutex<ptimer::Interface>,
    pub user: Mutex<user::Interface>,

    /// Wakes the puller when commands arrive or pulling is enabled. Paired
    /// with the PFIFO lock.
    pub(crate) cache_cond: Condvar,
    /// Wakes the puller once a context switch trap is cleared. Paired with
    /// the PGRAPH lock.
    pub(crate) interrupt_cond: Condvar,
    /// Wakes the puller when the fifo access gate opens. Paired with the
    /// PGRAPH lock.
    pub(crate) fifo_access_cond: Condvar,

    irq: Box<dyn IrqLine>,
    irq_level: AtomicBool,
    running: AtomicBool,
    epoch: Instant,
    puller: Mutex<Option<JoinHandle<()>>>,
}

impl Nv2a {
    /// Creates the device and starts its puller thread.
    ///
    /// The thread lives until [`Nv2a::shutdown`]; it keeps the device alive
    /// through its own reference, so shutting down is on the embedder.
    pub fn new(config: Config, mem: Arc<SystemRam>, irq: Box<dyn IrqLine>) -> Arc<Self> {
        let ramin_base = config
            .ramin_base
            .unwrap_or_else(|| mem.len().saturating_sub(RAMIN_LEN));
        let ramin_len = RAMIN_LEN.min(mem.len().saturating_sub(ramin_base));
        let ramin = Window::new(ramin_base, ramin_len);

        let nv = Arc::new(Self {
            mem,
            ramin,
            pmc: Mutex::new(pmc::Interface::default()),
            pfifo: Mutex::new(pfifo::Interface::default()),
            pgraph: Mutex::new(pgraph::Interface::default()),
            pcrtc: Mutex::new(pcrtc::Interface::default()),
            ptimer: Mutex::new(ptimer::Interface::default()),
            user: Mutex::new(user::Interface::default()),
            cache_cond: Condvar::new(),
            interrupt_cond: Condvar::new(),
            fifo_access_cond: Condvar::new(),
            irq,
            irq_level: AtomicBool::new(false),
            running: AtomicBool::new(true),
            epoch: Instant::now(),
            puller: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("nv2a puller".into())
            .spawn({
                let nv = nv.clone();
                move || pfifo::puller_loop(&nv)
            })
            .unwrap();

        *nv.puller.lock().unwrap() = Some(handle);
        nv
    }

    /// Reads a register. `size` is 1, 2 or 4; narrow reads return the
    /// addressed lanes of the containing register.
    pub fn mmio_read(&self, addr: u32, size: u8) -> u32 {
        let word = self.read32(addr & !3);
        let shift = (addr & 3) * 8;

        match size {
            4 => word,
            2 => (word >> shift) & 0xFFFF,
            1 => (word >> shift) & 0xFF,
            _ => {
                tracing::error!(size, "malformed read at 0x{addr:08X}");
                0
            }
        }
    }

    /// Writes a register. Narrow writes merge into the containing register.
    pub fn mmio_write(&self, addr: u32, value: u32, size: u8) {
        let aligned = addr & !3;

        match size {
            4 => self.write32(aligned, value),
            2 | 1 => {
                let shift = (addr & 3) * 8;
                let mask = (if size == 2 { 0xFFFF } else { 0xFF }) << shift;
                let merged = (self.read32(aligned) & !mask) | ((value << shift) & mask);
                self.write32(aligned, merged);
            }
            _ => tracing::error!(size, "malformed write at 0x{addr:08X}"),
        }
    }

    fn read32(&self, addr: u32) -> u32 {
        let Some((block, offset)) = Block::find(addr) else {
            tracing::error!("reading from 0x{addr:08X} (no register block)");
            return 0;
        };

        match block {
            Block::Pmc => pmc::read(self, offset),
            Block::Pfifo => pfifo::read(self, offset),
            Block::Pgraph => pgraph::read(self, offset),
            Block::Pcrtc => pcrtc::read(self, offset),
            Block::Ptimer => ptimer::read(self, offset),
            Block::User => user::read(self, offset),
            Block::Pramin => {
                if self.ramin.contains(offset, 4) {
                    self.ramin.read::<u32>(&self.mem, offset)
                } else {
                    tracing::error!("reading past instance memory (0x{offset:08X})");
                    0
                }
            }
            _ => {
                tracing::warn!(?block, "read from stubbed block (0x{offset:05X})");
                0
            }
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        let Some((block, offset)) = Block::find(addr) else {
            tracing::error!("writing 0x{value:08X} to 0x{addr:08X} (no register block)");
            return;
        };

        match block {
            Block::Pmc => pmc::write(self, offset, value),
            Block::Pfifo => pfifo::write(self, offset, value),
            Block::Pgraph => pgraph::write(self, offset, value),
            Block::Pcrtc => pcrtc::write(self, offset, value),
            Block::Ptimer => ptimer::write(self, offset, value),
            Block::User => user::write(self, offset, value),
            Block::Pramin => {
                if self.ramin.contains(offset, 4) {
                    self.ramin.write::<u32>(&self.mem, offset, value);
                } else {
                    tracing::error!("writing past instance memory (0x{offset:08X})");
                }
            }
            _ => {
                tracing::warn!(
                    ?block,
                    "write of 0x{value:08X} to stubbed block (0x{offset:05X})"
                );
            }
        }
    }

    /// Latches the vertical blank interrupt.
    pub fn vblank(&self) {
        pcrtc::vblank(self);
    }

    /// Recomputes the aggregated interrupt state and drives the host line on
    /// transitions. Must be called with no engine lock held.
    pub(crate) fn update_irq(&self) {
        let active = pmc::get_active_interrupts(self);
        let enabled = self.pmc.lock().unwrap().enabled_interrupts;
        let level = active.to_bits() & enabled.to_bits() != 0;

        if self.irq_level.swap(level, Ordering::SeqCst) != level {
            if level {
                tracing::trace!(?active, "raising irq");
                self.irq.raise();
            } else {
                self.irq.lower();
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Nanoseconds since device creation, for the PTIMER clock.
    pub(crate) fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Stops the puller thread, waking it out of any wait, and joins it.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // take each paired lock once so no wait can slip between the flag
        // and the notification
        drop(self.pfifo.lock().unwrap());
        self.cache_cond.notify_all();
        drop(self.pgraph.lock().unwrap());
        self.interrupt_cond.notify_all();
        self.fifo_access_cond.notify_all();

        let handle = self.puller.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.join() {
                tracing::error!("puller thread panicked: {err:?}");
            }
        }
    }
}

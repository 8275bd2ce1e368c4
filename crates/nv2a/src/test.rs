//! Full-device scenarios driven through the MMIO surface, the way a guest
//! driver would drive real hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::engine::pfifo::{self, DmaError, Engine};
use crate::engine::{pcrtc, pgraph};
use crate::mem::SystemRam;
use crate::{Config, IrqLine, Nv2a};

// block bases
const PMC: u32 = 0x000000;
const PFIFO: u32 = 0x002000;
const PGRAPH: u32 = 0x400000;
const USER: u32 = 0x800000;

// pushbuffer and surface layout in guest memory
const PUSHBUF: u32 = 0x1000;
const PUSHBUF_LEN: u32 = 0x1000;

// instance memory layout (offsets into the RAMIN window; the hash table
// occupies the first 4 KiB)
const SURFACES_OBJ: u32 = 0x2000;
const BLIT_OBJ: u32 = 0x2020;
const KELVIN_OBJ: u32 = 0x2040;
const DMA_SOURCE_OBJ: u32 = 0x2060;
const DMA_DESTIN_OBJ: u32 = 0x2080;
const DMA_SEMAPHORE_OBJ: u32 = 0x20A0;
const DMA_PUSHBUF_OBJ: u32 = 0x20C0;

const SURFACES_HANDLE: u32 = 0x11;
const BLIT_HANDLE: u32 = 0x12;
const KELVIN_HANDLE: u32 = 0x13;
const DMA_SOURCE_HANDLE: u32 = 0x14;
const DMA_DESTIN_HANDLE: u32 = 0x15;
const DMA_SEMAPHORE_HANDLE: u32 = 0x16;

struct TestIrq(Arc<AtomicBool>);

impl IrqLine for TestIrq {
    fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn lower(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn device() -> (Arc<Nv2a>, Arc<AtomicBool>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let ram = Arc::new(SystemRam::new(0x20_0000));
    let line = Arc::new(AtomicBool::new(false));
    let nv = Nv2a::new(Config::default(), ram, Box::new(TestIrq(line.clone())));
    (nv, line)
}

fn wr(nv: &Nv2a, addr: u32, value: u32) {
    nv.mmio_write(addr, value, 4);
}

fn rd(nv: &Nv2a, addr: u32) -> u32 {
    nv.mmio_read(addr, 4)
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

/// A method batch header.
fn header(method: u32, subchannel: u32, count: u32) -> u32 {
    method | subchannel << 13 | count << 18
}

fn header_nonincreasing(method: u32, subchannel: u32, count: u32) -> u32 {
    header(method, subchannel, count) | 0x4000_0000
}

/// Writes a DMA object into instance memory covering `len` bytes of guest
/// memory at the page-aligned `address`.
fn write_dma_object(nv: &Nv2a, instance: u32, address: u32, len: u32) {
    assert_eq!(address & 0xFFF, 0);
    nv.ramin.write::<u32>(&nv.mem, instance, 0x0000_003D);
    nv.ramin.write::<u32>(&nv.mem, instance + 4, len);
    nv.ramin.write::<u32>(&nv.mem, instance + 8, address);
}

/// Registers `handle -> instance` in the hash table, the way the guest
/// driver populates RAMHT before submitting the handle.
fn write_ramht_entry(nv: &Nv2a, handle: u32, instance: u32, channel: u32) {
    let config = nv.pfifo.lock().unwrap().ramht;
    let slot = config.base_address() + pfifo::ramht::hash(config, handle, channel) * 8;
    let context = (instance >> 4) | (Engine::Graphics as u32) << 16 | channel << 24 | 1 << 31;
    nv.ramin.write::<u32>(&nv.mem, slot, handle);
    nv.ramin.write::<u32>(&nv.mem, slot + 4, context);
}

/// Writes a graphics object of the given class into instance memory.
fn write_object(nv: &Nv2a, instance: u32, class: u32) {
    nv.ramin.write::<u32>(&nv.mem, instance, class);
}

/// Points cache 1 at a pushbuffer DMA object and enables pushing for
/// channel 0 in DMA mode.
fn enable_pusher(nv: &Nv2a) {
    write_dma_object(nv, DMA_PUSHBUF_OBJ, PUSHBUF, PUSHBUF_LEN);

    wr(nv, PFIFO + pfifo::MODE, 1);
    wr(nv, PFIFO + pfifo::CACHE1_PUSH1, 1 << 8);
    wr(nv, PFIFO + pfifo::CACHE1_DMA_INSTANCE, DMA_PUSHBUF_OBJ);
    wr(nv, PFIFO + pfifo::CACHE1_PUSH0, 1);
    wr(nv, PFIFO + pfifo::CACHE1_DMA_PUSH, 1);
}

/// Marks channel 0 as the engine's current channel and opens the fifo
/// access gate, as the driver does after a context restore.
fn enable_pgraph(nv: &Nv2a) {
    wr(nv, PGRAPH + pgraph::CTX_USER, 0);
    wr(nv, PGRAPH + pgraph::CTX_CONTROL, 1 << 16);
    wr(nv, PGRAPH + pgraph::FIFO, 1);
}

/// Appends words to the pushbuffer and bumps the put pointer.
fn submit(nv: &Nv2a, words: &[u32]) {
    let put = rd(nv, USER + 0x40);
    for (index, word) in words.iter().enumerate() {
        nv.mem.write::<u32>(PUSHBUF + put + index as u32 * 4, *word);
    }
    wr(nv, USER + 0x40, put + words.len() as u32 * 4);
}

#[test]
fn pusher_decodes_increasing_and_nonincreasing_batches() {
    let (nv, _) = device();
    enable_pusher(&nv);

    submit(&nv, &[header(0x180, 2, 2), 0xAAAA_0000, 0xBBBB_0000]);
    submit(&nv, &[header_nonincreasing(0x200, 5, 2), 1, 2]);

    let fifo = nv.pfifo.lock().unwrap();
    let entries: Vec<_> = fifo.cache1.cache.iter().copied().collect();
    drop(fifo);

    assert_eq!(entries.len(), 4);

    assert_eq!(entries[0].method, 0x180);
    assert_eq!(entries[0].subchannel, 2);
    assert!(!entries[0].nonincreasing);
    assert_eq!(entries[0].parameter, 0xAAAA_0000);

    assert_eq!(entries[1].method, 0x184);
    assert_eq!(entries[1].subchannel, 2);
    assert_eq!(entries[1].parameter, 0xBBBB_0000);

    assert_eq!(entries[2].method, 0x200);
    assert!(entries[2].nonincreasing);
    assert_eq!(entries[3].method, 0x200);
    assert_eq!(entries[3].parameter, 2);

    nv.shutdown();
}

#[test]
fn pusher_follows_jumps_calls_and_returns() {
    let (nv, _) = device();
    enable_pusher(&nv);

    // 0x00: jump to 0x20; 0x20: call 0x40; 0x40: return to 0x24;
    // 0x24: a one-parameter batch, ending at 0x2C
    nv.mem.write::<u32>(PUSHBUF + 0x00, 0x20 | 1);
    nv.mem.write::<u32>(PUSHBUF + 0x20, 0x40 | 2);
    nv.mem.write::<u32>(PUSHBUF + 0x40, 0x0002_0000);
    nv.mem.write::<u32>(PUSHBUF + 0x24, header(0x100, 0, 1));
    nv.mem.write::<u32>(PUSHBUF + 0x28, 0xCAFE_F00D);

    wr(&nv, USER + 0x40, 0x2C);

    assert_eq!(rd(&nv, USER + 0x44), 0x2C);

    let fifo = nv.pfifo.lock().unwrap();
    assert_eq!(fifo.cache1.cache.len(), 1);
    assert_eq!(fifo.cache1.cache[0].parameter, 0xCAFE_F00D);
    assert!(!fifo.cache1.subroutine_active);
    drop(fifo);

    // subroutine state reads back as inactive
    let subroutine = rd(&nv, PFIFO + pfifo::CACHE1_DMA_SUBROUTINE);
    assert_eq!(subroutine & 1, 0);

    nv.shutdown();
}

#[test]
fn nested_calls_suspend_the_pusher_and_raise_the_interrupt() {
    let (nv, line) = device();
    enable_pusher(&nv);

    wr(&nv, PFIFO + pfifo::INTR_EN_0, 1 << 12);
    wr(&nv, PMC + 0x140, 1 << 8);

    nv.mem.write::<u32>(PUSHBUF + 0x00, 0x10 | 2);
    nv.mem.write::<u32>(PUSHBUF + 0x10, 0x20 | 2);
    wr(&nv, USER + 0x40, 0x30);

    // the second call dies without executing further words
    assert_eq!(rd(&nv, USER + 0x44), 0x14);

    let state = rd(&nv, PFIFO + pfifo::CACHE1_DMA_STATE);
    assert_eq!(state >> 29, DmaError::Call as u32);

    let push = rd(&nv, PFIFO + pfifo::CACHE1_DMA_PUSH);
    assert_ne!(push & (1 << 12), 0, "dma push should be suspended");

    assert_ne!(rd(&nv, PFIFO + pfifo::INTR_0) & (1 << 12), 0);
    assert!(line.load(Ordering::SeqCst), "irq line should be up");

    // clearing the interrupt drops the line
    wr(&nv, PFIFO + pfifo::INTR_0, 1 << 12);
    assert!(!line.load(Ordering::SeqCst));

    nv.shutdown();
}

#[test]
fn returns_outside_a_subroutine_are_an_error() {
    let (nv, _) = device();
    enable_pusher(&nv);

    submit(&nv, &[0x0002_0000]);

    let state = rd(&nv, PFIFO + pfifo::CACHE1_DMA_STATE);
    assert_eq!(state >> 29, DmaError::Return as u32);

    nv.shutdown();
}

#[test]
fn reserved_commands_are_an_error() {
    let (nv, _) = device();
    enable_pusher(&nv);

    submit(&nv, &[0x8000_0000]);

    let state = rd(&nv, PFIFO + pfifo::CACHE1_DMA_STATE);
    assert_eq!(state >> 29, DmaError::ReservedCommand as u32);

    nv.shutdown();
}

/// Binds a kelvin object and points its semaphore context at a DMA object,
/// leaving the device ready to execute semaphore releases.
fn bind_kelvin_with_semaphore(nv: &Nv2a, subchannel: u32) {
    write_object(nv, KELVIN_OBJ, 0x97);
    write_dma_object(nv, DMA_SEMAPHORE_OBJ, 0x6000, 0x1000);
    write_ramht_entry(nv, KELVIN_HANDLE, KELVIN_OBJ, 0);
    write_ramht_entry(nv, DMA_SEMAPHORE_HANDLE, DMA_SEMAPHORE_OBJ, 0);

    submit(nv, &[
        header(0, subchannel, 1),
        KELVIN_HANDLE,
        header(0x1A4, subchannel, 1),
        DMA_SEMAPHORE_HANDLE,
    ]);
}

#[test]
fn queue_handoff_loses_nothing_across_pull_toggles() {
    let (nv, _) = device();
    enable_pusher(&nv);
    enable_pgraph(&nv);

    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 1);
    bind_kelvin_with_semaphore(&nv, 2);
    wait_until("kelvin bound", || {
        rd(&nv, PFIFO + pfifo::CACHE1_ENGINE) >> 8 & 0xF == Engine::Graphics as u32
    });

    // park the puller, then stage N observable commands
    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 0);

    let count = 8u32;
    for i in 0..count {
        submit(&nv, &[
            header(0x1D6C, 2, 1),
            i * 4,
            header(0x1D70, 2, 1),
            0xBEEF_0000 | i,
        ]);
    }

    wait_until("commands staged", || {
        nv.pfifo.lock().unwrap().cache1.cache.len() == count as usize * 2
    });
    assert_eq!(nv.mem.read::<u32>(0x6000), 0);

    // re-enabling the puller drains exactly the staged batch, in order
    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 1);
    wait_until("all releases executed", || {
        (0..count).all(|i| nv.mem.read::<u32>(0x6000 + i * 4) == 0xBEEF_0000 | i)
    });
    wait_until("queue drained", || {
        nv.pfifo.lock().unwrap().cache1.cache.is_empty()
    });

    nv.shutdown();
}

#[test]
fn puller_blocks_on_a_context_switch_until_the_driver_resolves_it() {
    let (nv, _) = device();
    enable_pusher(&nv);

    // fifo gate open, but no valid channel latched: the first bind traps
    wr(&nv, PGRAPH + pgraph::FIFO, 1);
    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 1);

    write_object(&nv, KELVIN_OBJ, 0x97);
    write_ramht_entry(&nv, KELVIN_HANDLE, KELVIN_OBJ, 0);
    submit(&nv, &[header(0, 2, 1), KELVIN_HANDLE]);

    wait_until("context switch trap", || {
        rd(&nv, PGRAPH + pgraph::INTR) & (1 << 12) != 0
    });

    // blocked on the very command it trapped on
    assert_eq!(rd(&nv, PFIFO + pfifo::CACHE1_ENGINE), 0);

    // driver restores the channel and clears the trap
    wr(&nv, PGRAPH + pgraph::CTX_USER, 0);
    wr(&nv, PGRAPH + pgraph::CTX_CONTROL, 1 << 16);
    wr(&nv, PGRAPH + pgraph::INTR, 1 << 12);

    wait_until("bind resumed", || {
        rd(&nv, PFIFO + pfifo::CACHE1_ENGINE) >> 8 & 0xF == Engine::Graphics as u32
    });

    nv.shutdown();
}

#[test]
fn image_blit_copies_the_rectangle_between_surfaces() {
    let (nv, _) = device();
    enable_pusher(&nv);
    enable_pgraph(&nv);
    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 1);

    write_object(&nv, SURFACES_OBJ, 0x62);
    write_object(&nv, BLIT_OBJ, 0x9F);
    write_dma_object(&nv, DMA_SOURCE_OBJ, 0x4000, 0x1000);
    write_dma_object(&nv, DMA_DESTIN_OBJ, 0x5000, 0x1000);
    write_ramht_entry(&nv, SURFACES_HANDLE, SURFACES_OBJ, 0);
    write_ramht_entry(&nv, BLIT_HANDLE, BLIT_OBJ, 0);
    write_ramht_entry(&nv, DMA_SOURCE_HANDLE, DMA_SOURCE_OBJ, 0);
    write_ramht_entry(&nv, DMA_DESTIN_HANDLE, DMA_DESTIN_OBJ, 0);

    // an 8x4 Y8 source surface with a pitch of 16
    for y in 0..4u32 {
        for x in 0..8u32 {
            nv.mem.write::<u8>(0x4000 + y * 16 + x, (y * 8 + x) as u8 + 1);
        }
    }

    submit(&nv, &[
        // set up the 2d surfaces context on subchannel 0
        header(0, 0, 1),
        SURFACES_HANDLE,
        header(0x184, 0, 2),
        DMA_SOURCE_HANDLE,
        DMA_DESTIN_HANDLE,
        header(0x300, 0, 4),
        0x01,            // Y8
        8 << 16 | 16,    // destination pitch 8, source pitch 16
        0,               // source offset
        0,               // destination offset
        // blit a 4x2 rectangle from (2, 1) to (1, 0) on subchannel 1
        header(0, 1, 1),
        BLIT_HANDLE,
        header(0x19C, 1, 1),
        SURFACES_HANDLE,
        header(0x2FC, 1, 1),
        3,               // srccopy
        header(0x300, 1, 3),
        1 << 16 | 2,     // point in (2, 1)
        1,               // point out (1, 0)
        2 << 16 | 4,     // size 4x2
    ]);

    wait_until("blit executed", || {
        nv.mem.read::<u8>(0x5000 + 1) == 11
    });

    for y in 0..2u32 {
        for x in 0..4u32 {
            let expected = ((y + 1) * 8 + (x + 2)) as u8 + 1;
            assert_eq!(nv.mem.read::<u8>(0x5000 + y * 8 + (x + 1)), expected);
        }
    }

    // bytes around the rectangle stay untouched
    assert_eq!(nv.mem.read::<u8>(0x5000), 0);
    assert_eq!(nv.mem.read::<u8>(0x5000 + 5), 0);

    nv.shutdown();
}

#[test]
fn shutdown_releases_a_blocked_puller() {
    let (nv, _) = device();
    enable_pusher(&nv);
    wr(&nv, PFIFO + pfifo::CACHE1_PULL0, 1);

    // trap the puller on a context switch nobody will resolve
    write_object(&nv, KELVIN_OBJ, 0x97);
    write_ramht_entry(&nv, KELVIN_HANDLE, KELVIN_OBJ, 0);
    submit(&nv, &[header(0, 0, 1), KELVIN_HANDLE]);

    wait_until("context switch trap", || {
        rd(&nv, PGRAPH + pgraph::INTR) & (1 << 12) != 0
    });

    nv.shutdown();
}

#[test]
fn pramin_window_reaches_instance_memory() {
    let (nv, _) = device();

    wr(&nv, 0x700000 + 0x123C, 0xDEAD_BEEF);
    assert_eq!(nv.ramin.read::<u32>(&nv.mem, 0x123C), 0xDEAD_BEEF);
    assert_eq!(rd(&nv, 0x700000 + 0x123C), 0xDEAD_BEEF);

    // narrow accesses merge into the containing word
    nv.mmio_write(0x700000 + 0x123E, 0x55, 1);
    assert_eq!(rd(&nv, 0x700000 + 0x123C), 0xDE55_BEEF);
    assert_eq!(nv.mmio_read(0x700000 + 0x123C, 2), 0xBEEF);

    nv.shutdown();
}

#[test]
fn pmc_identifies_the_chip() {
    let (nv, _) = device();
    assert_eq!(rd(&nv, PMC), 0x02A0_00A3);
    nv.shutdown();
}

#[test]
fn vblank_reaches_the_host_line_through_the_aggregator() {
    let (nv, line) = device();

    wr(&nv, 0x600000 + pcrtc::INTR_EN_0, 1);
    wr(&nv, PMC + 0x140, 1 << 24);

    nv.vblank();
    assert!(line.load(Ordering::SeqCst));

    wr(&nv, 0x600000 + pcrtc::INTR_0, 1);
    assert!(!line.load(Ordering::SeqCst));

    nv.shutdown();
}

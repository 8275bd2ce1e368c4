//! Command FIFO (PFIFO).
//!
//! PFIFO is how work reaches the engines: the guest fills a pushbuffer in
//! its own memory and bumps a put pointer; the *pusher* walks the buffer,
//! decodes the command stream and queues one [`CacheEntry`] per method; the
//! *puller*, a dedicated thread, drains the queue and hands methods to the
//! engine bound to their subchannel, resolving object handles through
//! [`ramht`] along the way.
//!
//! The pusher runs inline on the guest's register write and never blocks.
//! All pusher state is guest-visible through the `CACHE1` register file.

pub mod ramht;

use std::collections::VecDeque;

use bitos::bitos;
use bitos::integer::{u3, u5, u11, u30};
use strum::FromRepr;

use crate::Nv2a;
use crate::engine::pgraph;
use crate::mem::DmaObject;

pub const INTR_0: u32 = 0x100;
pub const INTR_EN_0: u32 = 0x140;
pub const RAMHT: u32 = 0x210;
pub const RAMFC: u32 = 0x214;
pub const CACHES: u32 = 0x500;
pub const MODE: u32 = 0x504;
pub const DMA: u32 = 0x508;
pub const SIZE: u32 = 0x50C;
pub const CACHE1_PUSH0: u32 = 0x1200;
pub const CACHE1_PUSH1: u32 = 0x1204;
pub const CACHE1_STATUS: u32 = 0x1214;
pub const CACHE1_DMA_PUSH: u32 = 0x1220;
pub const CACHE1_DMA_FETCH: u32 = 0x1224;
pub const CACHE1_DMA_STATE: u32 = 0x1228;
pub const CACHE1_DMA_INSTANCE: u32 = 0x122C;
pub const CACHE1_DMA_PUT: u32 = 0x1240;
pub const CACHE1_DMA_GET: u32 = 0x1244;
pub const CACHE1_REF_CNT: u32 = 0x1248;
pub const CACHE1_DMA_SUBROUTINE: u32 = 0x124C;
pub const CACHE1_PULL0: u32 = 0x1250;
pub const CACHE1_PULL1: u32 = 0x1254;
pub const CACHE1_ENGINE: u32 = 0x1280;
pub const CACHE1_DMA_DCOUNT: u32 = 0x12A0;
pub const CACHE1_DMA_GET_JMP_SHADOW: u32 = 0x12A4;
pub const CACHE1_DMA_RSVD_SHADOW: u32 = 0x12A8;
pub const CACHE1_DMA_DATA_SHADOW: u32 = 0x12AC;

/// Cache 1 fills up at this many queued commands.
const CACHE1_DEPTH: usize = 128;

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptSources {
    #[bits(0)]
    pub cache_error: bool,
    #[bits(4)]
    pub runout: bool,
    #[bits(8)]
    pub runout_overflow: bool,
    #[bits(12)]
    pub dma_pusher: bool,
    #[bits(16)]
    pub dma_pt: bool,
    #[bits(20)]
    pub semaphore: bool,
    #[bits(24)]
    pub acquire_timeout: bool,
}

/// The engine a subchannel binding resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr)]
#[repr(u8)]
pub enum Engine {
    #[default]
    Software = 0,
    Graphics = 1,
    Dvd = 2,
}

/// Submission mode of a channel.
#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FifoMode {
    #[default]
    Pio = 0,
    Dma = 1,
}

/// Error codes of the DMA pusher, latched into [`DmaState`].
#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaError {
    #[default]
    None            = 0,
    Call            = 1,
    NonCache        = 2,
    Return          = 3,
    ReservedCommand = 4,
    Protection      = 5,
    Reserved6       = 6,
    Reserved7       = 7,
}

/// Pusher parameters #0.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Push0 {
    #[bits(0)]
    pub access: bool,
}

/// Pusher parameters #1: the channel scheduled into cache 1.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Push1 {
    #[bits(0..5)]
    pub channel_id: u5,
    #[bits(8)]
    pub mode: FifoMode,
}

/// DMA pusher control and status.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaPush {
    #[bits(0)]
    pub access: bool,
    #[bits(4)]
    pub busy: bool,
    #[bits(8)]
    pub buffer_empty: bool,
    #[bits(12)]
    pub suspended: bool,
    #[bits(16)]
    pub acquire_pending: bool,
}

/// Decoder state of the DMA pusher.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaState {
    #[bits(0)]
    pub method_nonincreasing: bool,
    /// Method address in units of 4 bytes.
    #[bits(2..13)]
    pub method: u11,
    #[bits(13..16)]
    pub subchannel: u3,
    #[bits(18..29)]
    pub method_count: u11,
    #[bits(29..32)]
    pub error: DmaError,
}

/// Subroutine state of the DMA pusher.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaSubroutine {
    #[bits(0)]
    pub active: bool,
    /// Return offset in units of 4 bytes.
    #[bits(2..32)]
    pub return_offset: u30,
}

/// Puller parameters #0.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Pull0 {
    #[bits(0)]
    pub access: bool,
}

/// Cache fill status.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    #[bits(4)]
    pub low_mark: bool,
    #[bits(8)]
    pub high_mark: bool,
}

/// A decoded command, produced by the pusher and consumed by the puller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub method: u16,
    pub subchannel: u8,
    pub nonincreasing: bool,
    pub parameter: u32,
}

/// Pusher and puller state of cache 1, the command queue of the currently
/// scheduled channel.
///
/// The pusher side mutates everything here under the PFIFO lock; the puller
/// only ever takes the pending queue wholesale, so a command it is working on
/// is never visible to the pusher again.
#[derive(Debug, Default)]
pub struct Cache1 {
    pub channel_id: u32,
    pub mode: FifoMode,

    // pusher state
    pub push_enabled: bool,
    pub dma_push_enabled: bool,
    pub dma_push_suspended: bool,
    pub dma_instance: u32,

    pub method: u32,
    pub subchannel: u8,
    pub method_count: u32,
    pub method_nonincreasing: bool,
    pub dcount: u32,

    pub subroutine_active: bool,
    pub subroutine_return: u32,

    pub get_jmp_shadow: u32,
    pub rsvd_shadow: u32,
    pub data_shadow: u32,
    pub error: DmaError,

    // puller state
    pub pull_enabled: bool,
    pub bound_engines: [Engine; pgraph::NUM_SUBCHANNELS],
    pub last_engine: Engine,

    /// Commands decoded but not yet claimed by the puller.
    pub cache: VecDeque<CacheEntry>,
}

#[derive(Debug, Default)]
pub struct Interface {
    pub pending_interrupts: InterruptSources,
    pub enabled_interrupts: InterruptSources,

    pub ramht: ramht::Config,
    pub ramfc: u32,
    pub caches: u32,
    /// Channel mode bitmask: bit N set puts channel N in DMA mode.
    pub mode: u32,
    pub dma: u32,
    pub size: u32,
    pub dma_fetch: u32,
    pub pull1: u32,

    pub cache1: Cache1,
}

impl Interface {
    /// Level of this engine's line into the PMC aggregator.
    pub fn intr(&self) -> bool {
        self.pending_interrupts.to_bits() & self.enabled_interrupts.to_bits() != 0
    }

    /// Back to power-on state. Queued commands are gone; anything the puller
    /// already claimed still executes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn channel_mode(&self, channel: u32) -> FifoMode {
        if self.mode & (1 << channel) != 0 {
            FifoMode::Dma
        } else {
            FifoMode::Pio
        }
    }
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    let fifo = nv.pfifo.lock().unwrap();
    let c1 = &fifo.cache1;

    match offset {
        INTR_0 => fifo.pending_interrupts.to_bits(),
        INTR_EN_0 => fifo.enabled_interrupts.to_bits(),
        RAMHT => fifo.ramht.to_bits(),
        RAMFC => fifo.ramfc,
        CACHES => fifo.caches,
        MODE => fifo.mode,
        DMA => fifo.dma,
        SIZE => fifo.size,
        CACHE1_PUSH0 => Push0::default().with_access(c1.push_enabled).to_bits(),
        CACHE1_PUSH1 => Push1::default()
            .with_channel_id(u5::new(c1.channel_id as u8))
            .with_mode(c1.mode)
            .to_bits(),
        CACHE1_STATUS => Status::default()
            .with_low_mark(c1.cache.is_empty())
            .with_high_mark(c1.cache.len() >= CACHE1_DEPTH)
            .to_bits(),
        CACHE1_DMA_PUSH => {
            let control = nv.user.lock().unwrap().channels[c1.channel_id as usize];
            DmaPush::default()
                .with_access(c1.dma_push_enabled)
                .with_buffer_empty(control.dma_get == control.dma_put)
                .with_suspended(c1.dma_push_suspended)
                .to_bits()
        }
        CACHE1_DMA_FETCH => fifo.dma_fetch,
        CACHE1_DMA_STATE => DmaState::default()
            .with_method_nonincreasing(c1.method_nonincreasing)
            .with_method(u11::new(((c1.method >> 2) & 0x7FF) as u16))
            .with_subchannel(u3::new(c1.subchannel))
            .with_method_count(u11::new((c1.method_count & 0x7FF) as u16))
            .with_error(c1.error)
            .to_bits(),
        CACHE1_DMA_INSTANCE => c1.dma_instance,
        CACHE1_DMA_PUT => {
            nv.user.lock().unwrap().channels[c1.channel_id as usize].dma_put
        }
        CACHE1_DMA_GET => {
            nv.user.lock().unwrap().channels[c1.channel_id as usize].dma_get
        }
        CACHE1_REF_CNT => {
            nv.user.lock().unwrap().channels[c1.channel_id as usize].reference
        }
        CACHE1_DMA_SUBROUTINE => DmaSubroutine::default()
            .with_active(c1.subroutine_active)
            .with_return_offset(u30::new(c1.subroutine_return >> 2))
            .to_bits(),
        CACHE1_PULL0 => Pull0::default().with_access(c1.pull_enabled).to_bits(),
        CACHE1_PULL1 => fifo.pull1,
        CACHE1_ENGINE => c1
            .bound_engines
            .iter()
            .enumerate()
            .fold(0, |engines, (subchannel, engine)| {
                engines | (*engine as u32) << (subchannel * 4)
            }),
        CACHE1_DMA_DCOUNT => c1.dcount,
        CACHE1_DMA_GET_JMP_SHADOW => c1.get_jmp_shadow,
        CACHE1_DMA_RSVD_SHADOW => c1.rsvd_shadow,
        CACHE1_DMA_DATA_SHADOW => c1.data_shadow,
        _ => {
            tracing::warn!("unimplemented read from PFIFO register 0x{offset:04X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    let mut fifo = nv.pfifo.lock().unwrap();

    match offset {
        INTR_0 => {
            let cleared = fifo.pending_interrupts.to_bits() & !value;
            fifo.pending_interrupts = InterruptSources::from_bits(cleared);
            drop(fifo);
            nv.update_irq();
        }
        INTR_EN_0 => {
            fifo.enabled_interrupts = InterruptSources::from_bits(value);
            drop(fifo);
            nv.update_irq();
        }
        RAMHT => fifo.ramht = ramht::Config::from_bits(value),
        RAMFC => fifo.ramfc = value,
        CACHES => fifo.caches = value,
        MODE => fifo.mode = value,
        DMA => fifo.dma = value,
        SIZE => fifo.size = value,
        CACHE1_PUSH0 => {
            fifo.cache1.push_enabled = Push0::from_bits(value).access();
            drop(fifo);
            run_pusher(nv);
        }
        CACHE1_PUSH1 => {
            let push1 = Push1::from_bits(value);
            fifo.cache1.channel_id = u32::from(push1.channel_id().value());
            fifo.cache1.mode = push1.mode();
            tracing::debug!(
                channel = fifo.cache1.channel_id,
                mode = ?fifo.cache1.mode,
                "channel scheduled into cache 1"
            );
        }
        CACHE1_STATUS => tracing::warn!("ignoring write to CACHE1_STATUS"),
        CACHE1_DMA_PUSH => {
            let push = DmaPush::from_bits(value);
            fifo.cache1.dma_push_enabled = push.access();
            fifo.cache1.dma_push_suspended = push.suspended();
            drop(fifo);
            run_pusher(nv);
        }
        CACHE1_DMA_FETCH => fifo.dma_fetch = value,
        CACHE1_DMA_STATE => {
            let state = DmaState::from_bits(value);
            fifo.cache1.method_nonincreasing = state.method_nonincreasing();
            fifo.cache1.method = u32::from(state.method().value()) << 2;
            fifo.cache1.subchannel = state.subchannel().value();
            fifo.cache1.method_count = u32::from(state.method_count().value());
            fifo.cache1.error = state.error();
        }
        CACHE1_DMA_INSTANCE => fifo.cache1.dma_instance = value,
        CACHE1_DMA_PUT => {
            let channel = fifo.cache1.channel_id as usize;
            drop(fifo);
            nv.user.lock().unwrap().channels[channel].dma_put = value;
            run_pusher(nv);
        }
        CACHE1_DMA_GET => {
            let channel = fifo.cache1.channel_id as usize;
            drop(fifo);
            nv.user.lock().unwrap().channels[channel].dma_get = value;
        }
        CACHE1_REF_CNT => {
            let channel = fifo.cache1.channel_id as usize;
            drop(fifo);
            nv.user.lock().unwrap().channels[channel].reference = value;
        }
        CACHE1_DMA_SUBROUTINE => {
            let subroutine = DmaSubroutine::from_bits(value);
            fifo.cache1.subroutine_active = subroutine.active();
            fifo.cache1.subroutine_return = subroutine.return_offset().value() << 2;
        }
        CACHE1_PULL0 => {
            fifo.cache1.pull_enabled = Pull0::from_bits(value).access();
            let wake = fifo.cache1.pull_enabled;
            drop(fifo);
            if wake {
                nv.cache_cond.notify_all();
            }
        }
        CACHE1_PULL1 => fifo.pull1 = value,
        CACHE1_ENGINE => {
            for (subchannel, engine) in fifo.cache1.bound_engines.iter_mut().enumerate() {
                let bits = ((value >> (subchannel * 4)) & 0xF) as u8;
                let Some(decoded) = Engine::from_repr(bits) else {
                    tracing::warn!(subchannel, "ignoring unknown engine {bits}");
                    continue;
                };
                *engine = decoded;
            }
        }
        CACHE1_DMA_DCOUNT => fifo.cache1.dcount = value,
        CACHE1_DMA_GET_JMP_SHADOW => fifo.cache1.get_jmp_shadow = value,
        CACHE1_DMA_RSVD_SHADOW => fifo.cache1.rsvd_shadow = value,
        CACHE1_DMA_DATA_SHADOW => fifo.cache1.data_shadow = value,
        _ => {
            tracing::warn!(
                "unimplemented write of 0x{value:08X} to PFIFO register 0x{offset:04X}"
            );
        }
    }
}

/// Runs the DMA pusher until the pushbuffer drains or an error stops it.
///
/// Called from the guest's I/O context whenever something that could unstall
/// the pusher is written. Decodes the pushbuffer protocol word by word:
/// method headers open a batch, parameter words fill it, jumps/calls/returns
/// redirect the get pointer. Never blocks; a protocol error suspends DMA
/// push and latches the DMA pusher interrupt for the guest to sort out.
pub fn run_pusher(nv: &Nv2a) {
    let mut fifo = nv.pfifo.lock().unwrap();
    if !fifo.cache1.push_enabled || !fifo.cache1.dma_push_enabled || fifo.cache1.dma_push_suspended
    {
        return;
    }

    if fifo.cache1.mode != FifoMode::Dma {
        return;
    }

    let channel = fifo.cache1.channel_id as usize;
    let buffer = DmaObject::load(&nv.mem, nv.ramin, fifo.cache1.dma_instance)
        .and_then(|dma| dma.map(&nv.mem));
    let buffer = match buffer {
        Ok(window) => window,
        Err(err) => {
            tracing::error!("cannot map the pushbuffer: {err}");
            fifo.cache1.error = DmaError::Protection;
            fifo.cache1.dma_push_suspended = true;
            fifo.pending_interrupts.set_dma_pusher(true);
            drop(fifo);
            nv.update_irq();
            return;
        }
    };

    let mut user = nv.user.lock().unwrap();
    let control = &mut user.channels[channel];
    let c1 = &mut fifo.cache1;
    let mut enqueued = false;

    while control.dma_get != control.dma_put {
        if control.dma_get >= buffer.len() {
            c1.error = DmaError::Protection;
            break;
        }

        let word = buffer.read::<u32>(&nv.mem, control.dma_get);
        control.dma_get += 4;

        if c1.method_count > 0 {
            // a batch is open: this word is a parameter
            c1.data_shadow = word;
            c1.cache.push_back(CacheEntry {
                method: c1.method as u16,
                subchannel: c1.subchannel,
                nonincreasing: c1.method_nonincreasing,
                parameter: word,
            });
            enqueued = true;

            if !c1.method_nonincreasing {
                c1.method += 4;
            }
            c1.method_count -= 1;
            c1.dcount += 1;
        } else {
            c1.rsvd_shadow = word;

            if word & 0xE000_0003 == 0x2000_0000 {
                // old style jump
                c1.get_jmp_shadow = control.dma_get;
                control.dma_get = word & 0x1FFF_FFFF;
            } else if word & 3 == 1 {
                // jump
                c1.get_jmp_shadow = control.dma_get;
                control.dma_get = word & 0xFFFF_FFFC;
            } else if word & 3 == 2 {
                // call; no nesting
                if c1.subroutine_active {
                    c1.error = DmaError::Call;
                    break;
                }
                c1.subroutine_return = control.dma_get;
                c1.subroutine_active = true;
                control.dma_get = word & 0xFFFF_FFFC;
            } else if word == 0x0002_0000 {
                // return
                if !c1.subroutine_active {
                    c1.error = DmaError::Return;
                    break;
                }
                control.dma_get = c1.subroutine_return;
                c1.subroutine_active = false;
            } else if word & 0xE003_0003 == 0 {
                // increasing methods header
                c1.method = word & 0x1FFF;
                c1.subchannel = ((word >> 13) & 7) as u8;
                c1.method_count = (word >> 18) & 0x7FF;
                c1.method_nonincreasing = false;
                c1.dcount = 0;
            } else if word & 0xE003_0003 == 0x4000_0000 {
                // non-increasing methods header
                c1.method = word & 0x1FFF;
                c1.subchannel = ((word >> 13) & 7) as u8;
                c1.method_count = (word >> 18) & 0x7FF;
                c1.method_nonincreasing = true;
                c1.dcount = 0;
            } else {
                tracing::error!("reserved pushbuffer command 0x{word:08X}");
                c1.error = DmaError::ReservedCommand;
                break;
            }
        }
    }

    let errored = c1.error != DmaError::None;
    if errored {
        c1.dma_push_suspended = true;
        fifo.pending_interrupts.set_dma_pusher(true);
    }

    drop(user);
    drop(fifo);

    if enqueued {
        nv.cache_cond.notify_all();
    }
    if errored {
        nv.update_irq();
    }
}

/// Body of the puller thread.
///
/// Sleeps until commands are pending and pulling is enabled, then claims the
/// whole pending queue at once so the pusher is never blocked on a drain,
/// and works through it. Disabling the puller mid-drain does not preempt the
/// claimed batch.
pub(crate) fn puller_loop(nv: &Nv2a) {
    tracing::debug!("puller running");

    let mut working = VecDeque::new();
    loop {
        {
            let mut fifo = nv.pfifo.lock().unwrap();
            loop {
                if !nv.is_running() {
                    return;
                }
                if fifo.cache1.pull_enabled && !fifo.cache1.cache.is_empty() {
                    break;
                }
                fifo = nv.cache_cond.wait(fifo).unwrap();
            }

            debug_assert!(working.is_empty());
            std::mem::swap(&mut working, &mut fifo.cache1.cache);
        }

        while let Some(command) = working.pop_front() {
            if !nv.is_running() {
                return;
            }
            pull_command(nv, command);
        }
    }
}

/// Executes one decoded command on the puller thread.
fn pull_command(nv: &Nv2a, command: CacheEntry) {
    let subchannel = command.subchannel as usize;

    if command.method == 0 {
        // bind: the parameter is a handle naming the object to load
        let (config, channel_id) = {
            let fifo = nv.pfifo.lock().unwrap();
            (fifo.ramht, fifo.cache1.channel_id)
        };

        let entry = match ramht::lookup(&nv.mem, nv.ramin, config, command.parameter, channel_id)
        {
            Ok(entry) => entry,
            Err(err) => {
                debug_assert!(false, "{err}");
                tracing::error!("dropping object bind: {err}");
                return;
            }
        };

        if entry.channel_id != channel_id {
            let err = ramht::HandleError::ChannelMismatch {
                handle: command.parameter,
                owner: entry.channel_id,
                channel: channel_id,
            };
            debug_assert!(false, "{err}");
            tracing::error!("dropping object bind: {err}");
            return;
        }

        match entry.engine {
            Engine::Graphics => {
                if !pgraph::context_switch(nv, channel_id) {
                    return;
                }
                if !pgraph::wait_fifo_access(nv) {
                    return;
                }
                pgraph::method(nv, command.subchannel, 0, entry.instance);
            }
            engine => {
                debug_assert!(false, "bind to {engine:?}");
                tracing::error!(?engine, "dropping bind to an unhandled engine");
                return;
            }
        }

        let mut fifo = nv.pfifo.lock().unwrap();
        fifo.cache1.bound_engines[subchannel] = entry.engine;
        fifo.cache1.last_engine = entry.engine;
    } else if command.method >= 0x100 {
        let mut parameter = command.parameter;

        // in this method range the parameter is itself a handle
        if (0x180..0x200).contains(&command.method) {
            let (config, channel_id) = {
                let fifo = nv.pfifo.lock().unwrap();
                (fifo.ramht, fifo.cache1.channel_id)
            };

            match ramht::lookup(&nv.mem, nv.ramin, config, parameter, channel_id) {
                Ok(entry) => parameter = entry.instance,
                Err(err) => {
                    debug_assert!(false, "{err}");
                    tracing::error!(
                        method = command.method,
                        "dropping method with an unresolvable handle: {err}"
                    );
                    return;
                }
            }
        }

        let engine = nv.pfifo.lock().unwrap().cache1.bound_engines[subchannel];
        match engine {
            Engine::Graphics => {
                if !pgraph::wait_fifo_access(nv) {
                    return;
                }
                pgraph::method(nv, command.subchannel, command.method, parameter);
            }
            engine => {
                debug_assert!(false, "method for {engine:?}");
                tracing::error!(
                    ?engine,
                    subchannel,
                    "dropping method for an unhandled engine"
                );
                return;
            }
        }

        nv.pfifo.lock().unwrap().cache1.last_engine = engine;
    } else {
        tracing::warn!(
            method = command.method,
            "ignoring puller-executed method"
        );
    }
}

//! Per-channel control areas (USER).
//!
//! Each of the 32 channels gets a page of MMIO at `(channel << 16) | offset`
//! through which the guest submits work. Only DMA mode is wired up: the
//! pushbuffer cursors and the reference counter.

use crate::Nv2a;
use crate::engine::pfifo::{self, FifoMode};

pub const NUM_CHANNELS: usize = 32;

pub const DMA_PUT: u32 = 0x40;
pub const DMA_GET: u32 = 0x44;
pub const REF: u32 = 0x48;

/// Submission state of a single channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelControl {
    /// Pushbuffer offset up to which the guest has produced commands.
    pub dma_put: u32,
    /// Pushbuffer offset up to which the pusher has consumed them.
    pub dma_get: u32,
    /// Reference counter.
    pub reference: u32,
}

#[derive(Debug)]
pub struct Interface {
    pub channels: [ChannelControl; NUM_CHANNELS],
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            channels: [ChannelControl::default(); NUM_CHANNELS],
        }
    }
}

fn split(offset: u32) -> (usize, u32) {
    ((offset >> 16) as usize, offset & 0xFFFF)
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    let (channel, reg) = split(offset);

    if channel >= NUM_CHANNELS {
        tracing::error!(channel, "reading control area of a nonexistent channel");
        return 0;
    }

    if nv.pfifo.lock().unwrap().channel_mode(channel as u32) != FifoMode::Dma {
        tracing::warn!(channel, "PIO submission is unimplemented");
        return 0;
    }

    let user = nv.user.lock().unwrap();
    let control = &user.channels[channel];

    match reg {
        DMA_PUT => control.dma_put,
        DMA_GET => control.dma_get,
        REF => control.reference,
        _ => {
            tracing::warn!(channel, "unimplemented read from USER register 0x{reg:04X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    let (channel, reg) = split(offset);

    if channel >= NUM_CHANNELS {
        tracing::error!(channel, "writing control area of a nonexistent channel");
        return;
    }

    if nv.pfifo.lock().unwrap().channel_mode(channel as u32) != FifoMode::Dma {
        tracing::warn!(
            channel,
            "dropping 0x{value:08X}: PIO submission is unimplemented"
        );
        return;
    }

    match reg {
        DMA_PUT => {
            {
                let mut user = nv.user.lock().unwrap();
                user.channels[channel].dma_put = value;
            }

            // only the channel currently scheduled into cache 1 can push
            let active = nv.pfifo.lock().unwrap().cache1.channel_id as usize == channel;
            if active {
                pfifo::run_pusher(nv);
            }
        }
        DMA_GET => nv.user.lock().unwrap().channels[channel].dma_get = value,
        REF => nv.user.lock().unwrap().channels[channel].reference = value,
        _ => {
            tracing::warn!(
                channel,
                "unimplemented write of 0x{value:08X} to USER register 0x{reg:04X}"
            );
        }
    }
}

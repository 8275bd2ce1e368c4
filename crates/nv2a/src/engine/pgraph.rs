//! Graphics engine (PGRAPH).
//!
//! One physical engine is multiplexed across all channels: it latches a
//! single channel id and traps to the driver whenever a command arrives for
//! another channel, modelling the context save/restore round trip real
//! drivers perform. Within the latched channel, eight subchannels each hold
//! a bound [`object::GraphicsObject`] that methods dispatch to.

pub mod blit;
pub mod object;

use bitos::bitos;
use bitos::integer::{u3, u5, u11};

use crate::Nv2a;
use crate::engine::user;
use self::object::GraphicsObject;

pub const NUM_SUBCHANNELS: usize = 8;

pub const INTR: u32 = 0x100;
pub const INTR_EN: u32 = 0x140;
pub const CTX_CONTROL: u32 = 0x144;
pub const CTX_USER: u32 = 0x148;
pub const TRAPPED_ADDR: u32 = 0x704;
pub const TRAPPED_DATA_LOW: u32 = 0x708;
pub const FIFO: u32 = 0x720;
pub const CHANNEL_CTX_TABLE: u32 = 0x780;
pub const CHANNEL_CTX_POINTER: u32 = 0x784;
pub const CHANNEL_CTX_TRIGGER: u32 = 0x788;

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interrupt {
    #[bits(0)]
    pub notify: bool,
    #[bits(4)]
    pub missing_hw: bool,
    #[bits(12)]
    pub context_switch: bool,
    #[bits(16)]
    pub buffer_notify: bool,
    #[bits(20)]
    pub error: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CtxControl {
    #[bits(16)]
    pub channel_valid: bool,
}

/// The user context word: which channel (and subchannel) the engine is
/// currently serving.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CtxUser {
    #[bits(0)]
    pub channel_3d: bool,
    #[bits(4)]
    pub channel_3d_valid: bool,
    #[bits(13..16)]
    pub subchannel: u3,
    #[bits(24..29)]
    pub channel_id: u5,
}

/// Where the engine trapped: the offending method, subchannel and channel.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrappedAddr {
    #[bits(2..13)]
    pub method: u11,
    #[bits(13..16)]
    pub subchannel: u3,
    #[bits(20..25)]
    pub channel_id: u5,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoAccess {
    #[bits(0)]
    pub enabled: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CtxTrigger {
    #[bits(0)]
    pub read_in: bool,
    #[bits(1)]
    pub write_out: bool,
}

/// Per-channel context the engine keeps across switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphicsContext {
    pub channel_3d: bool,
    pub subchannel: u8,
}

/// A subchannel slot: the instance the guest bound plus the decoded object.
#[derive(Debug, Clone, Copy, Default)]
pub struct Subchannel {
    pub object_instance: u32,
    pub object: GraphicsObject,
}

#[derive(Debug)]
pub struct Interface {
    pub pending_interrupts: Interrupt,
    pub enabled_interrupts: Interrupt,

    /// The fifo access gate: while closed, the puller sits on method
    /// delivery. Toggled by the driver through the FIFO register.
    pub fifo_access: bool,

    /// Channel currently latched into the engine.
    pub channel_id: u32,
    pub channel_valid: bool,

    pub trapped_channel_id: u32,
    pub trapped_subchannel: u8,
    pub trapped_method: u16,
    pub trapped_data: u32,

    pub context_table: u32,
    pub context_pointer: u32,
    pub context: [GraphicsContext; user::NUM_CHANNELS],

    pub subchannels: [Subchannel; NUM_SUBCHANNELS],
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            pending_interrupts: Interrupt::default(),
            enabled_interrupts: Interrupt::default(),
            fifo_access: false,
            channel_id: 0,
            channel_valid: false,
            trapped_channel_id: 0,
            trapped_subchannel: 0,
            trapped_method: 0,
            trapped_data: 0,
            context_table: 0,
            context_pointer: 0,
            context: [GraphicsContext::default(); user::NUM_CHANNELS],
            subchannels: [Subchannel::default(); NUM_SUBCHANNELS],
        }
    }
}

impl Interface {
    /// Level of this engine's line into the PMC aggregator.
    pub fn intr(&self) -> bool {
        self.pending_interrupts.to_bits() & self.enabled_interrupts.to_bits() != 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn set_context_user(&mut self, value: CtxUser) {
        self.channel_id = u32::from(value.channel_id().value());

        let context = &mut self.context[self.channel_id as usize];
        context.channel_3d = value.channel_3d();
        context.subchannel = value.subchannel().value();

        tracing::debug!(
            channel = self.channel_id,
            channel_3d = context.channel_3d,
            "engine user context updated"
        );
    }
}

pub fn read(nv: &Nv2a, offset: u32) -> u32 {
    let pgraph = nv.pgraph.lock().unwrap();

    match offset {
        INTR => pgraph.pending_interrupts.to_bits(),
        INTR_EN => pgraph.enabled_interrupts.to_bits(),
        CTX_CONTROL => CtxControl::default()
            .with_channel_valid(pgraph.channel_valid)
            .to_bits(),
        CTX_USER => {
            let context = pgraph.context[pgraph.channel_id as usize];
            CtxUser::default()
                .with_channel_3d(context.channel_3d)
                .with_subchannel(u3::new(context.subchannel))
                .with_channel_id(u5::new(pgraph.channel_id as u8))
                .to_bits()
        }
        TRAPPED_ADDR => TrappedAddr::default()
            .with_method(u11::new(pgraph.trapped_method >> 2))
            .with_subchannel(u3::new(pgraph.trapped_subchannel))
            .with_channel_id(u5::new(pgraph.trapped_channel_id as u8))
            .to_bits(),
        TRAPPED_DATA_LOW => pgraph.trapped_data,
        FIFO => FifoAccess::default()
            .with_enabled(pgraph.fifo_access)
            .to_bits(),
        CHANNEL_CTX_TABLE => pgraph.context_table,
        CHANNEL_CTX_POINTER => pgraph.context_pointer,
        _ => {
            tracing::warn!("unimplemented read from PGRAPH register 0x{offset:04X}");
            0
        }
    }
}

pub fn write(nv: &Nv2a, offset: u32, value: u32) {
    let mut pgraph = nv.pgraph.lock().unwrap();

    match offset {
        INTR => {
            let cleared = pgraph.pending_interrupts.to_bits() & !value;
            pgraph.pending_interrupts = Interrupt::from_bits(cleared);
            drop(pgraph);

            // a cleared context switch trap releases the puller
            nv.interrupt_cond.notify_all();
            nv.update_irq();
        }
        INTR_EN => {
            pgraph.enabled_interrupts = Interrupt::from_bits(value);
            drop(pgraph);
            nv.update_irq();
        }
        CTX_CONTROL => {
            pgraph.channel_valid = CtxControl::from_bits(value).channel_valid();
        }
        CTX_USER => pgraph.set_context_user(CtxUser::from_bits(value)),
        TRAPPED_DATA_LOW => pgraph.trapped_data = value,
        FIFO => {
            pgraph.fifo_access = FifoAccess::from_bits(value).enabled();
            drop(pgraph);
            nv.fifo_access_cond.notify_all();
        }
        CHANNEL_CTX_TABLE => pgraph.context_table = value & 0xFFFF,
        CHANNEL_CTX_POINTER => pgraph.context_pointer = value & 0xFFFF,
        CHANNEL_CTX_TRIGGER => {
            let trigger = CtxTrigger::from_bits(value);

            if trigger.read_in() {
                // load the user context word for the channel being restored
                let address = pgraph.context_pointer << 4;
                let user_word = if nv.ramin.contains(address, 4) {
                    nv.ramin.read::<u32>(&nv.mem, address)
                } else {
                    tracing::error!(
                        "channel context at 0x{address:08X} lies outside instance memory"
                    );
                    0
                };

                tracing::debug!("context load from 0x{address:08X}: 0x{user_word:08X}");
                pgraph.set_context_user(CtxUser::from_bits(user_word));
            }

            if trigger.write_out() {
                tracing::warn!("context write out is unimplemented");
            }
        }
        _ => {
            tracing::warn!(
                "unimplemented write of 0x{value:08X} to PGRAPH register 0x{offset:04X}"
            );
        }
    }
}

/// Latches `channel_id` into the engine, trapping to the driver if it is not
/// the channel already there.
///
/// Blocks the puller until the driver clears the context switch interrupt.
/// Returns `false` if the device shut down while waiting.
pub fn context_switch(nv: &Nv2a, channel_id: u32) -> bool {
    let mut pgraph = nv.pgraph.lock().unwrap();
    if pgraph.channel_valid && pgraph.channel_id == channel_id {
        return true;
    }

    tracing::debug!(channel_id, "puller trapping for a channel switch");
    pgraph.trapped_channel_id = channel_id;
    pgraph.pending_interrupts.set_context_switch(true);
    drop(pgraph);
    nv.update_irq();

    let mut pgraph = nv.pgraph.lock().unwrap();
    while pgraph.pending_interrupts.context_switch() {
        if !nv.is_running() {
            return false;
        }
        pgraph = nv.interrupt_cond.wait(pgraph).unwrap();
    }

    nv.is_running()
}

/// Blocks the puller until the fifo access gate is open. Returns `false` if
/// the device shut down while waiting.
pub fn wait_fifo_access(nv: &Nv2a) -> bool {
    let mut pgraph = nv.pgraph.lock().unwrap();
    while !pgraph.fifo_access {
        if !nv.is_running() {
            return false;
        }
        pgraph = nv.fifo_access_cond.wait(pgraph).unwrap();
    }

    nv.is_running()
}

/// Dispatches one method to the object bound to `subchannel`.
///
/// `SET_OBJECT` replaces the binding; everything else goes to the bound
/// class's own decode. Unknown methods and classes are dropped with a log,
/// never an error: guests send speculative methods routinely.
pub fn method(nv: &Nv2a, subchannel: u8, method: u16, parameter: u32) {
    let mut pgraph = nv.pgraph.lock().unwrap();

    if !pgraph.channel_valid {
        debug_assert!(false, "method without a valid channel");
        tracing::error!(subchannel, method, "dropping method: no valid channel");
        return;
    }

    let slot = &mut pgraph.subchannels[subchannel as usize];

    if method == object::SET_OBJECT {
        slot.object_instance = parameter;
        slot.object = object::load(&nv.mem, nv.ramin, parameter);
        tracing::debug!(subchannel, object = ?slot.object, "bound object");
        return;
    }

    // latch the method into the bound object; a blit may fire
    let fired = match &mut slot.object {
        GraphicsObject::Surfaces2d(state) => {
            object::surfaces_2d_method(state, method, parameter);
            None
        }
        GraphicsObject::ImageBlit(state) => {
            object::image_blit_method(state, method, parameter).then_some(*state)
        }
        GraphicsObject::Kelvin(state) => {
            object::kelvin_method(&nv.mem, nv.ramin, state, method, parameter);
            None
        }
        GraphicsObject::Unknown { class } => {
            tracing::warn!(
                class = *class,
                "ignoring method 0x{method:04X} for an unknown class"
            );
            None
        }
        GraphicsObject::Unbound => {
            tracing::error!(subchannel, "dropping method 0x{method:04X}: nothing bound");
            None
        }
    };

    let Some(blit_state) = fired else { return };

    // the blit reads its surfaces from whichever subchannel has the 2d
    // surfaces context bound
    let surfaces = pgraph.subchannels.iter().find_map(|slot| {
        match (slot.object_instance == blit_state.context_surfaces, slot.object) {
            (true, GraphicsObject::Surfaces2d(surfaces)) => Some(surfaces),
            _ => None,
        }
    });

    let Some(surfaces) = surfaces else {
        tracing::error!(
            instance = blit_state.context_surfaces,
            "dropping blit: no 2d surfaces context at that instance"
        );
        return;
    };

    if let Err(err) = blit::execute(&nv.mem, nv.ramin, &surfaces, &blit_state) {
        tracing::error!("image blit failed: {err}");
    }
}

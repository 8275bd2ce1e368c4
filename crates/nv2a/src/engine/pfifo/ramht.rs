//! RAMHT, the hashed object table.
//!
//! Guests bind engine objects to opaque 32-bit handles by building a hash
//! table in instance memory. The table is never cached on the device side:
//! every lookup re-reads guest memory, so table updates take effect on the
//! next handle submission.

use bitos::bitos;
use bitos::integer::u5;
use easyerr::Error;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::Engine;
use crate::mem::{SystemRam, Window};

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Size {
    #[default]
    _4K  = 0,
    _8K  = 1,
    _16K = 2,
    _32K = 3,
}

impl Size {
    /// Table length in bytes.
    pub fn len(self) -> u32 {
        0x1000 << self as u32
    }

    /// Width in bits of the handle folding steps for this table length.
    pub fn bits(self) -> u32 {
        self.len().trailing_zeros() - 1
    }
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Search {
    #[default]
    _16  = 0,
    _32  = 1,
    _64  = 2,
    _128 = 3,
}

/// The RAMHT configuration register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    /// Table base inside instance memory, in units of 4 KiB.
    #[bits(4..9)]
    pub base: u5,
    #[bits(16..18)]
    pub size: Size,
    #[bits(24..26)]
    pub search: Search,
}

impl Config {
    /// Byte offset of the table inside instance memory.
    pub fn base_address(&self) -> u32 {
        u32::from(self.base().value()) << 12
    }
}

/// An entry as stored in the table: the handle it was registered under plus
/// a context word packing instance, engine, channel and validity.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawEntry {
    handle: U32,
    context: U32,
}

const_assert_eq!(size_of::<RawEntry>(), 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub handle: u32,
    /// Byte offset of the bound object inside instance memory.
    pub instance: u32,
    pub engine: Engine,
    pub channel_id: u32,
    pub valid: bool,
}

impl Entry {
    const INSTANCE: u32 = 0x0000_FFFF;
    const ENGINE_SHIFT: u32 = 16;
    const CHANNEL_SHIFT: u32 = 24;
    const STATUS: u32 = 0x8000_0000;

    fn unpack(raw: RawEntry) -> Self {
        let context = raw.context.get();
        let engine_bits = ((context >> Self::ENGINE_SHIFT) & 3) as u8;
        let engine = Engine::from_repr(engine_bits).unwrap_or_else(|| {
            tracing::warn!("entry names unknown engine {engine_bits}, treating as software");
            Engine::Software
        });

        Self {
            handle: raw.handle.get(),
            instance: (context & Self::INSTANCE) << 4,
            engine,
            channel_id: (context >> Self::CHANNEL_SHIFT) & 0x1F,
            valid: context & Self::STATUS != 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("handle 0x{handle:08X} resolves to an invalid entry (channel {channel})")]
    Invalid { handle: u32, channel: u32 },
    #[error("handle 0x{handle:08X} belongs to channel {owner}, referenced from channel {channel}")]
    ChannelMismatch { handle: u32, owner: u32, channel: u32 },
}

/// Hashes a handle for the given channel.
///
/// The handle is folded into `bits`-wide chunks by repeated XOR-and-shift,
/// then the channel id is mixed into the top nibble. Guests rely on the
/// exact collision behavior of this fold when laying out their tables.
pub fn hash(config: Config, handle: u32, channel_id: u32) -> u32 {
    let bits = config.size().bits();
    let mut handle = handle;
    let mut hash = 0;
    while handle != 0 {
        hash ^= handle & ((1 << bits) - 1);
        handle >>= bits;
    }

    hash ^ (channel_id << (bits - 4))
}

/// Resolves a handle to the entry stored at its hash slot.
///
/// The 8-byte entry is read straight out of instance memory. An empty or
/// explicitly invalidated slot fails with [`HandleError::Invalid`]; so does a
/// hash that lands outside the configured table.
pub fn lookup(
    ram: &SystemRam,
    ramin: Window,
    config: Config,
    handle: u32,
    channel_id: u32,
) -> Result<Entry, HandleError> {
    let hash = self::hash(config, handle, channel_id);
    let offset = config.base_address() + hash * 8;

    let in_table = hash * 8 < config.size().len();
    let Some(range) = ramin.range(offset, 8).filter(|_| in_table) else {
        tracing::error!(
            "handle 0x{handle:08X} hashes to 0x{hash:X}, outside the table"
        );
        return Err(HandleError::Invalid {
            handle,
            channel: channel_id,
        });
    };

    let raw = ram.with_bytes(|bytes| {
        RawEntry::read_from_bytes(&bytes[range]).expect("range is exactly one entry wide")
    });

    let entry = Entry::unpack(raw);
    if !entry.valid {
        return Err(HandleError::Invalid {
            handle,
            channel: channel_id,
        });
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        // 4 KiB table at the start of instance memory
        Config::default()
    }

    /// Packs a context word the way a guest driver would.
    fn context(instance: u32, engine: Engine, channel: u32, valid: bool) -> u32 {
        (instance >> 4)
            | (engine as u32) << 16
            | channel << 24
            | (valid as u32) << 31
    }

    #[test]
    fn hash_folds_and_mixes_the_channel() {
        let config = config();

        // 4K table: 11-bit folds
        assert_eq!(hash(config, 0, 0), 0);
        assert_eq!(hash(config, 0x7FF, 0), 0x7FF);
        // 0x0080_0001 folds as 0x001 ^ 0x000 ^ 0x002
        assert_eq!(hash(config, 0x0080_0001, 0), 3);
        assert_eq!(hash(config, 0, 3), 3 << 7);

        let wide = Config::default().with_size(Size::_32K);
        assert_eq!(wide.size().bits(), 14);
        assert_eq!(hash(wide, 0x3FFF, 0), 0x3FFF);
        assert_eq!(hash(wide, 0, 1), 1 << 10);
    }

    #[test]
    fn hash_is_a_pure_function_of_its_inputs() {
        let config = config();
        for handle in [0x1234_5678, 0xDEAD_BEEF, 0x0000_0001] {
            assert_eq!(hash(config, handle, 7), hash(config, handle, 7));
        }
    }

    #[test]
    fn lookup_round_trips_a_written_entry() {
        let ram = SystemRam::new(0x10000);
        let ramin = Window::new(0, 0x10000);
        let config = config();

        let handle = 0x0000_0042;
        let channel = 2;
        let slot = config.base_address() + hash(config, handle, channel) * 8;
        ramin.write::<u32>(&ram, slot, handle);
        ramin.write::<u32>(&ram, slot + 4, context(0x1230, Engine::Graphics, channel, true));

        let entry = lookup(&ram, ramin, config, handle, channel).unwrap();
        assert_eq!(entry.handle, handle);
        assert_eq!(entry.instance, 0x1230);
        assert_eq!(entry.engine, Engine::Graphics);
        assert_eq!(entry.channel_id, channel);
        assert!(entry.valid);
    }

    #[test]
    fn lookup_of_an_unwritten_handle_fails() {
        let ram = SystemRam::new(0x10000);
        let ramin = Window::new(0, 0x10000);

        assert!(matches!(
            lookup(&ram, ramin, config(), 0x0000_0123, 0),
            Err(HandleError::Invalid { .. })
        ));
    }

    #[test]
    fn lookup_is_not_fooled_by_a_cleared_status_bit() {
        let ram = SystemRam::new(0x10000);
        let ramin = Window::new(0, 0x10000);
        let config = config();

        let handle = 0x1000_0002;
        let slot = config.base_address() + hash(config, handle, 0) * 8;
        ramin.write::<u32>(&ram, slot, handle);
        ramin.write::<u32>(&ram, slot + 4, context(0x40, Engine::Graphics, 0, false));

        assert!(lookup(&ram, ramin, config, handle, 0).is_err());
    }
}

//! Views over guest memory.
//!
//! The NV2A has no dedicated VRAM: framebuffers, pushbuffers and instance
//! memory all live in guest system RAM. Everything the device reads from or
//! writes to that memory goes through [`SystemRam`], or through a [`Window`]
//! carved out of it once and bounds-checked on every access.

use std::ops::Range;
use std::sync::RwLock;

use easyerr::Error;

use crate::Primitive;

/// Flat guest system RAM, shared between the I/O side and the puller thread.
///
/// Accesses outside the mapped length never fault the guest: reads return
/// zero, writes are dropped, both with an error log.
pub struct SystemRam {
    bytes: RwLock<Box<[u8]>>,
}

impl SystemRam {
    pub fn new(len: u32) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len as usize].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> u32 {
        self.bytes.read().unwrap().len() as u32
    }

    /// Reads a primitive at the given physical address.
    pub fn read<P: Primitive>(&self, addr: u32) -> P {
        let bytes = self.bytes.read().unwrap();
        let Some(slice) = bytes.get(addr as usize..addr as usize + size_of::<P>()) else {
            tracing::error!(
                "reading {} bytes at 0x{addr:08X} (outside guest memory)",
                size_of::<P>()
            );
            return P::default();
        };

        P::read_le_bytes(slice)
    }

    /// Writes a primitive at the given physical address.
    pub fn write<P: Primitive>(&self, addr: u32, value: P) {
        let mut bytes = self.bytes.write().unwrap();
        let Some(slice) = bytes.get_mut(addr as usize..addr as usize + size_of::<P>()) else {
            tracing::error!(
                "writing 0x{value:08X} at 0x{addr:08X} (outside guest memory)"
            );
            return;
        };

        value.write_le_bytes(slice);
    }

    /// Runs `f` with a shared view of the whole of guest memory.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read().unwrap())
    }

    /// Runs `f` with an exclusive view of the whole of guest memory.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write().unwrap())
    }
}

/// A window of guest memory, built once from a base address and a length.
///
/// Offsets are window-relative. Whether an access fits is decided against the
/// window length, never against raw guest addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    base: u32,
    len: u32,
}

impl Window {
    pub fn new(base: u32, len: u32) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether an access of `len` bytes at `offset` fits in the window.
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    /// Absolute byte range of an access, if it fits in the window.
    pub fn range(&self, offset: u32, len: u32) -> Option<Range<usize>> {
        self.contains(offset, len).then(|| {
            let start = (self.base + offset) as usize;
            start..start + len as usize
        })
    }

    /// Reads a primitive at the given window offset. An access straddling
    /// the end of the window spills into whatever guest memory follows it,
    /// as on hardware; [`SystemRam`] still clamps at the end of RAM.
    pub fn read<P: Primitive>(&self, ram: &SystemRam, offset: u32) -> P {
        ram.read(self.base + offset)
    }

    /// Writes a primitive at the given window offset.
    pub fn write<P: Primitive>(&self, ram: &SystemRam, offset: u32, value: P) {
        ram.write(self.base + offset, value);
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("dma object at 0x{address:08X} lies outside instance memory")]
    ObjectOutOfBounds { address: u32 },
    #[error("dma window 0x{base:08X}+0x{len:X} exceeds guest memory")]
    WindowOutOfBounds { base: u32, len: u32 },
}

/// A DMA object, materialized from its 3-word form in instance memory.
///
/// DMA objects are how the guest names regions of its own memory to the
/// engines: a class/flags word, a limit word and a frame word, packed by the
/// driver into RAMIN and referenced by instance address.
#[derive(Debug, Clone, Copy)]
pub struct DmaObject {
    pub class: u32,
    pub target: u32,
    pub address: u32,
    pub limit: u32,
}

impl DmaObject {
    const CLASS: u32 = 0x0000_0FFF;
    const ADJUST_SHIFT: u32 = 20;
    const TARGET_SHIFT: u32 = 16;
    const FRAME_ADDRESS: u32 = 0xFFFF_F000;

    /// Loads the DMA object stored at `address` inside instance memory.
    pub fn load(ram: &SystemRam, ramin: Window, address: u32) -> Result<Self, MapError> {
        if !ramin.contains(address, 12) {
            return Err(MapError::ObjectOutOfBounds { address });
        }

        let flags = ramin.read::<u32>(ram, address);
        let limit = ramin.read::<u32>(ram, address + 4);
        let frame = ramin.read::<u32>(ram, address + 8);

        Ok(Self {
            class: flags & Self::CLASS,
            target: (flags >> Self::TARGET_SHIFT) & 3,
            address: (frame & Self::FRAME_ADDRESS) | ((flags >> Self::ADJUST_SHIFT) & 0xFFF),
            limit,
        })
    }

    /// Maps the object to its window of guest memory.
    pub fn map(&self, ram: &SystemRam) -> Result<Window, MapError> {
        let end = self
            .address
            .checked_add(self.limit)
            .ok_or(MapError::WindowOutOfBounds {
                base: self.address,
                len: self.limit,
            })?;

        if end > ram.len() {
            return Err(MapError::WindowOutOfBounds {
                base: self.address,
                len: self.limit,
            });
        }

        Ok(Window::new(self.address, self.limit))
    }
}

//! Graphics object classes and their method decode.
//!
//! A subchannel binding selects one of a small set of object classes; each
//! class latches its own slice of state from the methods sent to it. Methods
//! in `0x180..0x200` arrive with their handle parameter already resolved to
//! an instance address by the puller.

use strum::FromRepr;

use crate::mem::{DmaObject, SystemRam, Window};

/// Binds a new object to the subchannel a method was sent on.
pub const SET_OBJECT: u16 = 0x0000;

/// Object classes the graphics engine dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Class {
    ContextSurfaces2d = 0x62,
    KelvinPrimitive   = 0x97,
    ImageBlit         = 0x9F,
}

/// An object bound to a subchannel, tagged by its class.
#[derive(Debug, Clone, Copy, Default)]
pub enum GraphicsObject {
    /// Nothing bound yet.
    #[default]
    Unbound,
    Surfaces2d(ContextSurfaces2d),
    ImageBlit(ImageBlit),
    Kelvin(Kelvin),
    /// A class this implementation knows nothing about; its methods are
    /// accepted and dropped.
    Unknown { class: u8 },
}

/// Loads the object stored at `instance` in instance memory.
pub fn load(ram: &SystemRam, ramin: Window, instance: u32) -> GraphicsObject {
    if !ramin.contains(instance, 4) {
        tracing::error!("object instance 0x{instance:08X} lies outside instance memory");
        return GraphicsObject::Unbound;
    }

    let switch1 = ramin.read::<u32>(ram, instance);
    let class_bits = (switch1 & 0xFF) as u8;

    match Class::from_repr(class_bits) {
        Some(Class::ContextSurfaces2d) => {
            GraphicsObject::Surfaces2d(ContextSurfaces2d::default())
        }
        Some(Class::ImageBlit) => GraphicsObject::ImageBlit(ImageBlit::default()),
        Some(Class::KelvinPrimitive) => GraphicsObject::Kelvin(Kelvin::default()),
        None => {
            tracing::warn!("loaded object of unknown class 0x{class_bits:02X}");
            GraphicsObject::Unknown { class: class_bits }
        }
    }
}

// === 2D context surfaces ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum ColorFormat {
    Y8       = 0x01,
    A8R8G8B8 = 0x0A,
}

impl ColorFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Y8 => 1,
            Self::A8R8G8B8 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Surfaces2dMethod {
    SetContextDmaImageSource = 0x0184,
    SetContextDmaImageDestin = 0x0188,
    SetColorFormat           = 0x0300,
    SetPitch                 = 0x0304,
    SetOffsetSource          = 0x0308,
    SetOffsetDestin          = 0x030C,
}

/// Source and destination surfaces shared by the 2D render classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSurfaces2d {
    /// Instance of the DMA object backing the source surface.
    pub dma_image_source: u32,
    /// Instance of the DMA object backing the destination surface.
    pub dma_image_destin: u32,
    pub color_format: u32,
    pub source_pitch: u32,
    pub destin_pitch: u32,
    pub source_offset: u32,
    pub destin_offset: u32,
}

pub fn surfaces_2d_method(state: &mut ContextSurfaces2d, method: u16, parameter: u32) {
    match Surfaces2dMethod::from_repr(method) {
        Some(Surfaces2dMethod::SetContextDmaImageSource) => state.dma_image_source = parameter,
        Some(Surfaces2dMethod::SetContextDmaImageDestin) => state.dma_image_destin = parameter,
        Some(Surfaces2dMethod::SetColorFormat) => state.color_format = parameter,
        Some(Surfaces2dMethod::SetPitch) => {
            state.source_pitch = parameter & 0xFFFF;
            state.destin_pitch = parameter >> 16;
        }
        Some(Surfaces2dMethod::SetOffsetSource) => state.source_offset = parameter,
        Some(Surfaces2dMethod::SetOffsetDestin) => state.destin_offset = parameter,
        None => {
            tracing::warn!("ignoring unknown 2d surfaces method 0x{method:04X}");
        }
    }
}

// === image blit ===

pub const OPERATION_SRCCOPY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum ImageBlitMethod {
    SetContextSurfaces = 0x019C,
    SetOperation       = 0x02FC,
    SetControlPointIn  = 0x0300,
    SetControlPointOut = 0x0304,
    SetSize            = 0x0308,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageBlit {
    /// Instance of the 2D surfaces object providing source and destination.
    pub context_surfaces: u32,
    pub operation: u32,
    pub in_x: u32,
    pub in_y: u32,
    pub out_x: u32,
    pub out_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Latches an image blit method. Returns whether the blit fires: writing a
/// non-empty size is the trigger.
pub fn image_blit_method(state: &mut ImageBlit, method: u16, parameter: u32) -> bool {
    match ImageBlitMethod::from_repr(method) {
        Some(ImageBlitMethod::SetContextSurfaces) => state.context_surfaces = parameter,
        Some(ImageBlitMethod::SetOperation) => state.operation = parameter,
        Some(ImageBlitMethod::SetControlPointIn) => {
            state.in_x = parameter & 0xFFFF;
            state.in_y = parameter >> 16;
        }
        Some(ImageBlitMethod::SetControlPointOut) => {
            state.out_x = parameter & 0xFFFF;
            state.out_y = parameter >> 16;
        }
        Some(ImageBlitMethod::SetSize) => {
            state.width = parameter & 0xFFFF;
            state.height = parameter >> 16;
            return state.width > 0 && state.height > 0;
        }
        None => {
            tracing::warn!("ignoring unknown image blit method 0x{method:04X}");
        }
    }

    false
}

// === kelvin ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum KelvinMethod {
    NoOperation                  = 0x0100,
    WaitForIdle                  = 0x0110,
    SetContextDmaNotifies        = 0x0180,
    SetContextDmaSemaphore       = 0x01A4,
    SetSemaphoreOffset           = 0x1D6C,
    BackEndWriteSemaphoreRelease = 0x1D70,
}

/// The 3D primitive rendering object. Only the command plumbing is modelled:
/// DMA context binds and the back-end semaphore, which guests use to fence
/// command completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Kelvin {
    pub dma_notifies: u32,
    pub dma_semaphore: u32,
    pub semaphore_offset: u32,
}

pub fn kelvin_method(
    ram: &SystemRam,
    ramin: Window,
    state: &mut Kelvin,
    method: u16,
    parameter: u32,
) {
    match KelvinMethod::from_repr(method) {
        Some(KelvinMethod::NoOperation | KelvinMethod::WaitForIdle) => (),
        Some(KelvinMethod::SetContextDmaNotifies) => state.dma_notifies = parameter,
        Some(KelvinMethod::SetContextDmaSemaphore) => state.dma_semaphore = parameter,
        Some(KelvinMethod::SetSemaphoreOffset) => state.semaphore_offset = parameter,
        Some(KelvinMethod::BackEndWriteSemaphoreRelease) => {
            let semaphore = DmaObject::load(ram, ramin, state.dma_semaphore)
                .and_then(|dma| dma.map(ram));

            match semaphore {
                Ok(window) if window.contains(state.semaphore_offset, 4) => {
                    window.write::<u32>(ram, state.semaphore_offset, parameter);
                }
                Ok(_) => {
                    tracing::error!(
                        offset = state.semaphore_offset,
                        "semaphore release outside its dma window"
                    );
                }
                Err(err) => tracing::error!("cannot map the semaphore: {err}"),
            }
        }
        None => {
            // guests probe optional functionality liberally
            tracing::trace!("ignoring kelvin method 0x{method:04X}");
        }
    }
}

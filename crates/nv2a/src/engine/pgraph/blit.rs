//! The 2D image blit operation.

use easyerr::{Error, ResultExt};

use crate::engine::pgraph::object::{
    ColorFormat, ContextSurfaces2d, ImageBlit, OPERATION_SRCCOPY,
};
use crate::mem::{DmaObject, MapError, SystemRam, Window};

#[derive(Debug, Error)]
pub enum BlitError {
    #[error(transparent)]
    Map { source: MapError },
    #[error("unsupported operation {operation}")]
    UnsupportedOperation { operation: u32 },
    #[error("unsupported color format 0x{format:02X}")]
    UnsupportedFormat { format: u32 },
    #[error("blit rectangle escapes its dma window")]
    OutOfBounds,
}

/// Copies the latched rectangle from the source surface to the destination
/// surface, row by row, honoring the pitches and offsets of the 2D surfaces
/// context. Surfaces live in guest memory behind DMA objects; the copy is
/// byte-exact.
pub fn execute(
    ram: &SystemRam,
    ramin: Window,
    surfaces: &ContextSurfaces2d,
    blit: &ImageBlit,
) -> Result<(), BlitError> {
    if blit.operation != OPERATION_SRCCOPY {
        return Err(BlitError::UnsupportedOperation {
            operation: blit.operation,
        });
    }

    let format = ColorFormat::from_repr(surfaces.color_format).ok_or(
        BlitError::UnsupportedFormat {
            format: surfaces.color_format,
        },
    )?;
    let bytes_per_pixel = format.bytes_per_pixel();

    let source = DmaObject::load(ram, ramin, surfaces.dma_image_source)
        .and_then(|dma| dma.map(ram))
        .context(BlitCtx::Map)?;
    let destin = DmaObject::load(ram, ramin, surfaces.dma_image_destin)
        .and_then(|dma| dma.map(ram))
        .context(BlitCtx::Map)?;

    let row_len = blit.width * bytes_per_pixel;
    let row_range = |window: Window, offset: u32, pitch: u32, x: u32, y: u32| {
        let start = u64::from(offset)
            + u64::from(y) * u64::from(pitch)
            + u64::from(x) * u64::from(bytes_per_pixel);

        u32::try_from(start)
            .ok()
            .and_then(|start| window.range(start, row_len))
            .ok_or(BlitError::OutOfBounds)
    };

    tracing::debug!(
        width = blit.width,
        height = blit.height,
        "blitting ({}, {}) -> ({}, {})",
        blit.in_x,
        blit.in_y,
        blit.out_x,
        blit.out_y,
    );

    ram.with_bytes_mut(|bytes| {
        for y in 0..blit.height {
            let src = row_range(
                source,
                surfaces.source_offset,
                surfaces.source_pitch,
                blit.in_x,
                blit.in_y + y,
            )?;
            let dst = row_range(
                destin,
                surfaces.destin_offset,
                surfaces.destin_pitch,
                blit.out_x,
                blit.out_y + y,
            )?;

            bytes.copy_within(src, dst.start);
        }

        Ok(())
    })
}

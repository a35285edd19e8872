//! Render-thread GPU capability.
//!
//! Creating and freeing textures must happen on the thread that owns the
//! graphics context. [`GpuContext`] is the only way to reach a
//! [`TextureBackend`] from this crate and it is neither `Send` nor `Sync`,
//! so fetch workers cannot hold one.

use std::marker::PhantomData;

use terra_common::{BBox2, GpuError, TextureHandle};

use crate::tile::TextureTile;

/// Texture upload description handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct TextureUpload<'a> {
    /// Source tile
    pub tile: &'a TextureTile,
    /// Part of the tile the fragment uses
    pub region: BBox2,
}

/// GPU texture operations implemented by the host renderer.
pub trait TextureBackend {
    /// Creates a GPU texture from tile pixels.
    fn upload(&mut self, upload: &TextureUpload<'_>) -> Result<TextureHandle, GpuError>;

    /// Destroys a texture previously returned by `upload`.
    fn free(&mut self, handle: TextureHandle);
}

/// Borrowed render-thread access to the texture backend.
pub struct GpuContext<'a> {
    backend: &'a mut dyn TextureBackend,
    _render_thread: PhantomData<*const ()>,
}

impl<'a> GpuContext<'a> {
    /// Wraps the backend for the duration of a frame phase.
    pub fn new(backend: &'a mut dyn TextureBackend) -> Self {
        Self {
            backend,
            _render_thread: PhantomData,
        }
    }

    pub(crate) fn upload(&mut self, upload: &TextureUpload<'_>) -> Result<TextureHandle, GpuError> {
        self.backend.upload(upload)
    }

    pub(crate) fn free(&mut self, handle: TextureHandle) {
        self.backend.free(handle);
    }
}

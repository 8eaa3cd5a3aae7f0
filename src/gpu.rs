//! Zero-copy frame import using EGL dmabuf images and GLES readback
//!
//! The exported dmabuf is wrapped in an `EGLImage`, attached to a texture that
//! is the color attachment of our framebuffer, and the watched region is read
//! back with `glReadPixels`. No surface is ever created: the context is made
//! current without draw/read surfaces.

use anyhow::{Context, Result, anyhow};
use khronos_egl as egl;
use std::ffi::c_void;
use std::os::fd::AsRawFd;
use std::ptr;
use tracing::{debug, info, warn};
use wayland_client::Connection;

use crate::error::FatalError;
use crate::frame::FrameDescriptor;
use crate::region::{PixelBuffer, WatchRegion};

// EGL_KHR_platform_wayland
const EGL_PLATFORM_WAYLAND_KHR: egl::Enum = 0x31D8;

// EGL_EXT_image_dma_buf_import(_modifiers)
const EGL_NONE: egl::Attrib = 0x3038;
const EGL_WIDTH: egl::Attrib = 0x3057;
const EGL_HEIGHT: egl::Attrib = 0x3056;
const EGL_LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: egl::Attrib = 0x3271;

/// Per-plane attribute keys: fd, offset, pitch, modifier low, modifier high
const PLANE_KEYS: [[egl::Attrib; 5]; 4] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
    [0x3440, 0x3441, 0x3442, 0x3449, 0x344A],
];

/// `glEGLImageTargetTexture2DOES` (GL_OES_EGL_image)
type ImageTargetTexture2dFn =
    unsafe extern "system" fn(target: gl::types::GLenum, image: *const c_void);

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

/// Turns a described frame into pixels of the watched region
pub trait FrameImporter {
    /// Import `frame` and copy `region` into `out`
    ///
    /// Every GPU handle created for the frame is released before returning.
    fn read_region(
        &mut self,
        frame: &FrameDescriptor,
        region: &WatchRegion,
        out: &mut PixelBuffer,
    ) -> Result<(), FatalError>;
}

/// Build the `eglCreateImage` attribute list for a dmabuf frame
///
/// Geometry and format come first, then one {fd, offset, pitch, modifier lo,
/// modifier hi} group per plane in index order, then `EGL_NONE`.
pub fn dmabuf_attribs(frame: &FrameDescriptor) -> Vec<egl::Attrib> {
    let mut attribs = vec![
        EGL_WIDTH,
        frame.width as egl::Attrib,
        EGL_HEIGHT,
        frame.height as egl::Attrib,
        EGL_LINUX_DRM_FOURCC_EXT,
        frame.format as egl::Attrib,
    ];

    let modifier_lo = (frame.modifier & 0xFFFF_FFFF) as egl::Attrib;
    let modifier_hi = (frame.modifier >> 32) as egl::Attrib;

    for (plane, keys) in frame.planes().zip(PLANE_KEYS.iter()) {
        let [fd_key, offset_key, pitch_key, lo_key, hi_key] = *keys;
        attribs.extend_from_slice(&[
            fd_key,
            plane.fd.as_raw_fd() as egl::Attrib,
            offset_key,
            plane.offset as egl::Attrib,
            pitch_key,
            plane.stride as egl::Attrib,
            lo_key,
            modifier_lo,
            hi_key,
            modifier_hi,
        ]);
    }

    attribs.push(EGL_NONE);
    attribs
}

/// EGL display + GLES2 context with a framebuffer for readback
pub struct GpuContext {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    framebuffer: gl::types::GLuint,
    texture: gl::types::GLuint,
    image_target_texture: ImageTargetTexture2dFn,
}

impl GpuContext {
    /// Create an EGL context on the Wayland platform of `conn`
    pub fn new(conn: &Connection) -> Result<Self> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|e| anyhow!("Failed to load libEGL: {:?}", e))?;

        let wl_display = conn.backend().display_ptr() as *mut c_void;
        let display = unsafe {
            egl.get_platform_display(EGL_PLATFORM_WAYLAND_KHR, wl_display, &[EGL_NONE])
        }
        .context("Failed to get EGL display")?;

        let (major, minor) = egl.initialize(display).context("Failed to initialize EGL")?;
        info!("EGL version {}.{}", major, minor);

        // No particular constraint on the configuration
        let config = egl
            .choose_first_config(display, &[egl::NONE])
            .context("Failed to choose EGL configuration")?
            .ok_or_else(|| anyhow!("No EGL configuration available"))?;

        egl.bind_api(egl::OPENGL_ES_API).context("Failed to bind GLES API")?;
        let context = egl
            .create_context(display, config, None, &[egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE])
            .context("Failed to create EGL context")?;

        egl.make_current(display, None, None, Some(context))
            .context("Failed to make EGL context current")?;

        gl::load_with(|name| {
            egl.get_proc_address(name)
                .map_or(ptr::null(), |f| f as *const c_void)
        });

        let image_target_texture = egl
            .get_proc_address("glEGLImageTargetTexture2DOES")
            .map(|f| unsafe {
                std::mem::transmute::<extern "system" fn(), ImageTargetTexture2dFn>(f)
            })
            .ok_or_else(|| anyhow!("Missing glEGLImageTargetTexture2DOES"))?;

        // glReadPixels reads from the bound framebuffer, whose color attachment
        // is the texture each captured frame gets attached to
        let mut framebuffer = 0;
        let mut texture = 0;
        unsafe {
            gl::GenFramebuffers(1, &mut framebuffer);
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);

            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                texture,
                0,
            );
        }
        debug!("Readback framebuffer {} with texture {}", framebuffer, texture);

        Ok(Self {
            egl,
            display,
            context,
            framebuffer,
            texture,
            image_target_texture,
        })
    }

    /// Wrap the frame's dmabuf planes in an EGL image
    pub fn import(&self, frame: &FrameDescriptor) -> Result<ImportedImage<'_>, FatalError> {
        let attribs = dmabuf_attribs(frame);
        let no_context = unsafe { egl::Context::from_ptr(egl::NO_CONTEXT) };
        let no_buffer = unsafe { egl::ClientBuffer::from_ptr(ptr::null_mut()) };

        let image = self
            .egl
            .create_image(self.display, no_context, EGL_LINUX_DMA_BUF_EXT, no_buffer, &attribs)
            .map_err(|e| FatalError::ImageImport(e.to_string()))?;

        Ok(ImportedImage { gpu: self, image })
    }

    /// Attach `image` to the readback texture and copy `region` into `out`
    pub fn readback(
        &self,
        image: &ImportedImage<'_>,
        region: &WatchRegion,
        out: &mut PixelBuffer,
    ) -> Result<(), FatalError> {
        clear_gl_errors();

        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, self.texture);
            (self.image_target_texture)(gl::TEXTURE_2D, image.image.as_ptr());
        }
        check_gl("glEGLImageTargetTexture2DOES")?;

        unsafe {
            gl::ReadPixels(
                region.x as i32,
                region.y as i32,
                region.width as i32,
                region.height as i32,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                out.as_bytes_mut().as_mut_ptr().cast(),
            );
        }
        check_gl("glReadPixels")
    }
}

impl FrameImporter for GpuContext {
    fn read_region(
        &mut self,
        frame: &FrameDescriptor,
        region: &WatchRegion,
        out: &mut PixelBuffer,
    ) -> Result<(), FatalError> {
        if !region.fits_within(frame.width, frame.height) {
            return Err(FatalError::RegionOutOfBounds {
                width: frame.width,
                height: frame.height,
            });
        }

        let image = self.import(frame)?;
        self.readback(&image, region, out)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteTextures(1, &self.texture);
            gl::DeleteFramebuffers(1, &self.framebuffer);
        }
        if let Err(e) = self.egl.make_current(self.display, None, None, None) {
            warn!("Failed to release EGL context: {}", e);
        }
        if let Err(e) = self.egl.destroy_context(self.display, self.context) {
            warn!("Failed to destroy EGL context: {}", e);
        }
        if let Err(e) = self.egl.terminate(self.display) {
            warn!("Failed to terminate EGL display: {}", e);
        }
    }
}

/// EGL image of one captured frame; destroyed when dropped
pub struct ImportedImage<'a> {
    gpu: &'a GpuContext,
    image: egl::Image,
}

impl Drop for ImportedImage<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.egl.destroy_image(self.gpu.display, self.image) {
            warn!("Failed to destroy EGL image: {}", e);
        }
    }
}

fn clear_gl_errors() {
    unsafe { while gl::GetError() != gl::NO_ERROR {} }
}

fn check_gl(op: &'static str) -> Result<(), FatalError> {
    match unsafe { gl::GetError() } {
        gl::NO_ERROR => Ok(()),
        code => Err(FatalError::Gl { op, code }),
    }
}

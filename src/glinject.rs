/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! OpenGL capture through the EGL and GLX swap entry points.
 *
 * On each swap the back buffer of the default framebuffer is blitted into
 * a texture whose storage is shared as a DMA-BUF. The storage comes from
 * one of three places:
 *
 * - EGL: the texture is exported with `EGL_MESA_image_dma_buf_export`;
 * - GLX: the texture is bound to an X pixmap whose buffers are fetched
 *   over DRI3;
 * - otherwise, a Vulkan image is exported both as a DMA-BUF and as an
 *   opaque fd, which GL imports as a memory object.
 *
 * The hook functions here are exported under their GL names by the GL
 * capture library. Everything they need from EGL, GLX and X11 is looked up
 * through the real `dlsym`, so that lookups never land on the hooks. */
use crate::capture;
use crate::elfsym::{real_dlsym, real_dlvsym};
use crate::exporter::{export_image, ExportDevice, ExportRequest, ExportedImage};
use crate::formats::{DRM_FORMAT_ABGR8888, DRM_FORMAT_ARGB8888};
use crate::protocol::{AllocHints, TextureData, MAX_PLANES};
use crate::tag;
use crate::util::lock;
use ash::{khr, vk, Entry};
use log::{debug, error, info, warn};
use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void, CStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::{Arc, Mutex, OnceLock};

/* GL */
const GL_NO_ERROR: u32 = 0;
const GL_TEXTURE_2D: u32 = 0x0DE1;
const GL_TEXTURE_BINDING_2D: u32 = 0x8069;
const GL_TEXTURE_MIN_FILTER: u32 = 0x2801;
const GL_TEXTURE_MAG_FILTER: u32 = 0x2800;
const GL_NEAREST: i32 = 0x2600;
const GL_LINEAR: u32 = 0x2601;
const GL_RGBA: u32 = 0x1908;
const GL_RGBA8: u32 = 0x8058;
const GL_UNSIGNED_BYTE: u32 = 0x1401;
const GL_VENDOR: u32 = 0x1F00;
const GL_BACK: u32 = 0x0405;
const GL_READ_BUFFER: u32 = 0x0C02;
const GL_FRAMEBUFFER_SRGB: u32 = 0x8DB9;
const GL_READ_FRAMEBUFFER: u32 = 0x8CA8;
const GL_DRAW_FRAMEBUFFER: u32 = 0x8CA9;
const GL_READ_FRAMEBUFFER_BINDING: u32 = 0x8CAA;
const GL_DRAW_FRAMEBUFFER_BINDING: u32 = 0x8CA6;
const GL_COLOR_ATTACHMENT0: u32 = 0x8CE0;
const GL_COLOR_BUFFER_BIT: u32 = 0x4000;
const GL_DEVICE_UUID_EXT: u32 = 0x9597;
const GL_DEDICATED_MEMORY_OBJECT_EXT: u32 = 0x9581;
const GL_HANDLE_TYPE_OPAQUE_FD_EXT: u32 = 0x9586;
const GL_TEXTURE_TILING_EXT: u32 = 0x9580;
const GL_OPTIMAL_TILING_EXT: i32 = 0x9584;
const GL_LINEAR_TILING_EXT: i32 = 0x9585;

/* EGL */
const EGL_HEIGHT: i32 = 0x3056;
const EGL_WIDTH: i32 = 0x3057;
const EGL_GL_TEXTURE_2D: u32 = 0x30B1;

/* GLX */
const GLX_DOUBLEBUFFER: i32 = 5;
const GLX_RED_SIZE: i32 = 8;
const GLX_GREEN_SIZE: i32 = 9;
const GLX_BLUE_SIZE: i32 = 10;
const GLX_ALPHA_SIZE: i32 = 11;
const GLX_DRAWABLE_TYPE: i32 = 0x8010;
const GLX_PIXMAP_BIT: i32 = 0x2;
const GLX_WIDTH: i32 = 0x801D;
const GLX_HEIGHT: i32 = 0x801E;
const GLX_BIND_TO_TEXTURE_RGBA_EXT: i32 = 0x20D1;
const GLX_BIND_TO_TEXTURE_TARGETS_EXT: i32 = 0x20D3;
const GLX_TEXTURE_FORMAT_EXT: i32 = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: i32 = 0x20D6;
const GLX_MIPMAP_TEXTURE_EXT: i32 = 0x20D7;
const GLX_TEXTURE_FORMAT_RGBA_EXT: i32 = 0x20DA;
const GLX_TEXTURE_2D_EXT: i32 = 0x20DC;
const GLX_FRONT_LEFT_EXT: i32 = 0x20DE;
const GLX_TEXTURE_2D_BIT_EXT: i32 = 0x2;

/** Set while the Vulkan helper instance is created, so the layer skips it */
pub const DISABLE_ENV: &str = "DISABLE_OBS_VKCAPTURE";

const NVIDIA_VENDOR: &[u8] = b"NVIDIA Corporation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Egl,
    Glx,
}

type Display = *mut c_void;
type GetProcAddressFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;

/** Convert a looked-up symbol into a function pointer type */
unsafe fn cast<T: Copy>(p: *mut c_void) -> Option<T> {
    if p.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut c_void, T>(&p))
    }
}

/** Symbols of a shared library, found without going through our `dlsym` */
struct Library {
    handle: *mut c_void,
}

impl Library {
    fn open(name: &CStr) -> Result<Library, String> {
        // SAFETY: plain dlopen of a system library
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
        if handle.is_null() {
            return Err(tag!("Failed to open {}", name.to_string_lossy()));
        }
        Ok(Library { handle })
    }

    /** Look up `name`, preferring the definition the process already uses */
    unsafe fn get<T: Copy>(&self, name: &CStr) -> Option<T> {
        let mut p = real_dlsym(libc::RTLD_NEXT, name.as_ptr());
        if p.is_null() {
            p = real_dlsym(self.handle, name.as_ptr());
        }
        cast(p)
    }
}

/** Entry points found through a `*GetProcAddress` function */
struct ProcTable {
    gpa: GetProcAddressFn,
}

impl ProcTable {
    unsafe fn get<T: Copy>(&self, name: &CStr) -> Option<T> {
        cast((self.gpa)(name.as_ptr()))
    }
}

macro_rules! need {
    ($src:expr, $name:literal) => {{
        let name: &CStr = $name;
        $src.get(name)
            .ok_or_else(|| tag!("Failed to resolve {}", name.to_string_lossy()))?
    }};
}

/* EGL */

struct EglFns {
    get_proc_address: GetProcAddressFn,
    destroy_context: unsafe extern "C" fn(Display, *mut c_void) -> c_uint,
    get_current_context: unsafe extern "C" fn() -> *mut c_void,
    create_window_surface:
        unsafe extern "C" fn(Display, *mut c_void, *mut c_void, *const i32) -> *mut c_void,
    create_image:
        unsafe extern "C" fn(Display, *mut c_void, u32, *mut c_void, *const isize) -> *mut c_void,
    destroy_image: unsafe extern "C" fn(Display, *mut c_void) -> c_uint,
    query_surface: unsafe extern "C" fn(Display, *mut c_void, i32, *mut i32) -> c_uint,
    swap_buffers: unsafe extern "C" fn(Display, *mut c_void) -> c_uint,
    export_query: Option<
        unsafe extern "C" fn(Display, *mut c_void, *mut i32, *mut i32, *mut u64) -> c_uint,
    >,
    export: Option<
        unsafe extern "C" fn(Display, *mut c_void, *mut i32, *mut i32, *mut i32) -> c_uint,
    >,
}

impl EglFns {
    unsafe fn load() -> Result<EglFns, String> {
        let lib = Library::open(c"libEGL.so.1")?;
        let gpa: GetProcAddressFn = need!(lib, c"eglGetProcAddress");
        let procs = ProcTable { gpa };
        Ok(EglFns {
            get_proc_address: gpa,
            destroy_context: need!(procs, c"eglDestroyContext"),
            get_current_context: need!(procs, c"eglGetCurrentContext"),
            create_window_surface: need!(procs, c"eglCreateWindowSurface"),
            create_image: need!(procs, c"eglCreateImage"),
            destroy_image: need!(procs, c"eglDestroyImage"),
            query_surface: need!(procs, c"eglQuerySurface"),
            swap_buffers: need!(procs, c"eglSwapBuffers"),
            export_query: procs.get(c"eglExportDMABUFImageQueryMESA"),
            export: procs.get(c"eglExportDMABUFImageMESA"),
        })
    }
}

/* GLX */

struct GlxFns {
    get_proc_address: GetProcAddressFn,
    get_proc_address_arb: GetProcAddressFn,
    destroy_context: unsafe extern "C" fn(Display, *mut c_void),
    get_current_context: unsafe extern "C" fn() -> *mut c_void,
    swap_buffers: unsafe extern "C" fn(Display, c_ulong),
    swap_buffers_msc_oml: Option<unsafe extern "C" fn(Display, c_ulong, i64, i64, i64) -> i64>,
    create_pixmap: unsafe extern "C" fn(Display, *mut c_void, c_ulong, *const i32) -> c_ulong,
    destroy_pixmap: unsafe extern "C" fn(Display, c_ulong),
    choose_fb_config:
        unsafe extern "C" fn(Display, c_int, *const i32, *mut c_int) -> *mut *mut c_void,
    bind_tex_image: Option<unsafe extern "C" fn(Display, c_ulong, c_int, *const i32)>,
    query_drawable: unsafe extern "C" fn(Display, c_ulong, c_int, *mut c_uint),
}

impl GlxFns {
    unsafe fn load() -> Result<GlxFns, String> {
        let lib = Library::open(c"libGLX.so.0").or_else(|_| Library::open(c"libGL.so.1"))?;
        let gpa: GetProcAddressFn = need!(lib, c"glXGetProcAddress");
        let procs = ProcTable { gpa };
        Ok(GlxFns {
            get_proc_address: gpa,
            get_proc_address_arb: need!(lib, c"glXGetProcAddressARB"),
            destroy_context: need!(procs, c"glXDestroyContext"),
            get_current_context: need!(procs, c"glXGetCurrentContext"),
            swap_buffers: need!(procs, c"glXSwapBuffers"),
            swap_buffers_msc_oml: procs.get(c"glXSwapBuffersMscOML"),
            create_pixmap: need!(procs, c"glXCreatePixmap"),
            destroy_pixmap: need!(procs, c"glXDestroyPixmap"),
            choose_fb_config: need!(procs, c"glXChooseFBConfig"),
            bind_tex_image: procs.get(c"glXBindTexImageEXT"),
            query_drawable: need!(procs, c"glXQueryDrawable"),
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct XcbCookie {
    sequence: c_uint,
}

#[repr(C)]
#[allow(dead_code)]
struct Dri3BuffersReply {
    response_type: u8,
    nfd: u8,
    sequence: u16,
    length: u32,
    width: u16,
    height: u16,
    pad0: [u8; 4],
    modifier: u64,
    depth: u8,
    bpp: u8,
    pad1: [u8; 6],
}

/** X11 and DRI3 functions for the GLX pixmap path */
struct X11Fns {
    create_pixmap: unsafe extern "C" fn(Display, c_ulong, c_uint, c_uint, c_uint) -> c_ulong,
    free_pixmap: unsafe extern "C" fn(Display, c_ulong) -> c_int,
    free: unsafe extern "C" fn(*mut c_void) -> c_int,
    default_root_window: unsafe extern "C" fn(Display) -> c_ulong,
    default_screen: unsafe extern "C" fn(Display) -> c_int,
    get_xcb_connection: unsafe extern "C" fn(Display) -> *mut c_void,
    buffers_from_pixmap: unsafe extern "C" fn(*mut c_void, u32) -> XcbCookie,
    buffers_from_pixmap_reply:
        unsafe extern "C" fn(*mut c_void, XcbCookie, *mut *mut c_void) -> *mut Dri3BuffersReply,
    reply_fds: unsafe extern "C" fn(*mut c_void, *mut Dri3BuffersReply) -> *mut c_int,
    reply_strides: unsafe extern "C" fn(*const Dri3BuffersReply) -> *mut u32,
    reply_offsets: unsafe extern "C" fn(*const Dri3BuffersReply) -> *mut u32,
}

impl X11Fns {
    unsafe fn load() -> Result<X11Fns, String> {
        let x11 = Library::open(c"libX11.so.6")?;
        let x11_xcb = Library::open(c"libX11-xcb.so.1")?;
        let dri3 = Library::open(c"libxcb-dri3.so.0")?;
        Ok(X11Fns {
            create_pixmap: need!(x11, c"XCreatePixmap"),
            free_pixmap: need!(x11, c"XFreePixmap"),
            free: need!(x11, c"XFree"),
            default_root_window: need!(x11, c"XDefaultRootWindow"),
            default_screen: need!(x11, c"XDefaultScreen"),
            get_xcb_connection: need!(x11_xcb, c"XGetXCBConnection"),
            buffers_from_pixmap: need!(dri3, c"xcb_dri3_buffers_from_pixmap"),
            buffers_from_pixmap_reply: need!(dri3, c"xcb_dri3_buffers_from_pixmap_reply"),
            reply_fds: need!(dri3, c"xcb_dri3_buffers_from_pixmap_reply_fds"),
            reply_strides: need!(dri3, c"xcb_dri3_buffers_from_pixmap_strides"),
            reply_offsets: need!(dri3, c"xcb_dri3_buffers_from_pixmap_offsets"),
        })
    }
}

/* GL */

#[derive(Clone, Copy)]
struct GlFns {
    gen_framebuffers: unsafe extern "C" fn(i32, *mut u32),
    delete_framebuffers: unsafe extern "C" fn(i32, *const u32),
    gen_textures: unsafe extern "C" fn(i32, *mut u32),
    delete_textures: unsafe extern "C" fn(i32, *const u32),
    tex_image_2d: unsafe extern "C" fn(u32, i32, i32, i32, i32, i32, u32, u32, *const c_void),
    tex_parameteri: unsafe extern "C" fn(u32, u32, i32),
    get_integerv: unsafe extern "C" fn(u32, *mut i32),
    bind_texture: unsafe extern "C" fn(u32, u32),
    enable: unsafe extern "C" fn(u32),
    disable: unsafe extern "C" fn(u32),
    is_enabled: unsafe extern "C" fn(u32) -> u8,
    bind_framebuffer: unsafe extern "C" fn(u32, u32),
    framebuffer_texture_2d: unsafe extern "C" fn(u32, u32, u32, u32, i32),
    read_buffer: unsafe extern "C" fn(u32),
    draw_buffer: unsafe extern "C" fn(u32),
    blit_framebuffer: unsafe extern "C" fn(i32, i32, i32, i32, i32, i32, i32, i32, u32, u32),
    get_error: unsafe extern "C" fn() -> u32,
    get_string: unsafe extern "C" fn(u32) -> *const u8,
    get_unsigned_bytei_v: Option<unsafe extern "C" fn(u32, u32, *mut u8)>,
    memory: Option<GlMemoryFns>,
}

/** GL_EXT_memory_object(_fd) */
#[derive(Clone, Copy)]
struct GlMemoryFns {
    create_memory_objects: unsafe extern "C" fn(i32, *mut u32),
    delete_memory_objects: unsafe extern "C" fn(i32, *const u32),
    memory_object_parameteriv: unsafe extern "C" fn(u32, u32, *const i32),
    import_memory_fd: unsafe extern "C" fn(u32, u64, u32, i32),
    tex_storage_mem_2d: unsafe extern "C" fn(u32, i32, u32, i32, i32, u32, u64),
    is_memory_object: unsafe extern "C" fn(u32) -> u8,
}

impl GlFns {
    unsafe fn load(gpa: GetProcAddressFn) -> Result<GlFns, String> {
        let procs = ProcTable { gpa };
        let memory = (|| -> Result<GlMemoryFns, String> {
            Ok(GlMemoryFns {
                create_memory_objects: need!(procs, c"glCreateMemoryObjectsEXT"),
                delete_memory_objects: need!(procs, c"glDeleteMemoryObjectsEXT"),
                memory_object_parameteriv: need!(procs, c"glMemoryObjectParameterivEXT"),
                import_memory_fd: need!(procs, c"glImportMemoryFdEXT"),
                tex_storage_mem_2d: need!(procs, c"glTexStorageMem2DEXT"),
                is_memory_object: need!(procs, c"glIsMemoryObjectEXT"),
            })
        })();
        if let Err(ref e) = memory {
            debug!("No GL memory objects: {}", e);
        }
        Ok(GlFns {
            gen_framebuffers: need!(procs, c"glGenFramebuffers"),
            delete_framebuffers: need!(procs, c"glDeleteFramebuffers"),
            gen_textures: need!(procs, c"glGenTextures"),
            delete_textures: need!(procs, c"glDeleteTextures"),
            tex_image_2d: need!(procs, c"glTexImage2D"),
            tex_parameteri: need!(procs, c"glTexParameteri"),
            get_integerv: need!(procs, c"glGetIntegerv"),
            bind_texture: need!(procs, c"glBindTexture"),
            enable: need!(procs, c"glEnable"),
            disable: need!(procs, c"glDisable"),
            is_enabled: need!(procs, c"glIsEnabled"),
            bind_framebuffer: need!(procs, c"glBindFramebuffer"),
            framebuffer_texture_2d: need!(procs, c"glFramebufferTexture2D"),
            read_buffer: need!(procs, c"glReadBuffer"),
            draw_buffer: need!(procs, c"glDrawBuffer"),
            blit_framebuffer: need!(procs, c"glBlitFramebuffer"),
            get_error: need!(procs, c"glGetError"),
            get_string: need!(procs, c"glGetString"),
            get_unsigned_bytei_v: procs.get(c"glGetUnsignedBytei_vEXT"),
            memory: memory.ok(),
        })
    }

    unsafe fn get_int(&self, what: u32) -> i32 {
        let mut v = 0;
        (self.get_integerv)(what, &mut v);
        v
    }

    /** Drain the error queue; bounded, since a lost context may never clear it */
    unsafe fn clear_errors(&self) {
        for _ in 0..64 {
            if (self.get_error)() == GL_NO_ERROR {
                break;
            }
        }
    }

    unsafe fn new_texture(&self) -> u32 {
        let mut tex = 0;
        (self.gen_textures)(1, &mut tex);
        (self.bind_texture)(GL_TEXTURE_2D, tex);
        (self.tex_parameteri)(GL_TEXTURE_2D, GL_TEXTURE_MIN_FILTER, GL_NEAREST);
        (self.tex_parameteri)(GL_TEXTURE_2D, GL_TEXTURE_MAG_FILTER, GL_NEAREST);
        tex
    }
}

static EGL: OnceLock<Option<EglFns>> = OnceLock::new();
static GLX: OnceLock<Option<GlxFns>> = OnceLock::new();

fn log_init(api: &str) {
    capture::init_logging();
    info!(
        "Init {} {} ({})",
        api,
        env!("CARGO_PKG_VERSION"),
        if cfg!(target_pointer_width = "64") {
            "64bit"
        } else {
            "32bit"
        }
    );
}

fn egl() -> Option<&'static EglFns> {
    EGL.get_or_init(|| {
        log_init("EGL");
        // SAFETY: resolves libEGL entry points with their C signatures
        unsafe { EglFns::load() }
            .map_err(|e| error!("EGL setup failed: {}", e))
            .ok()
    })
    .as_ref()
}

fn glx() -> Option<&'static GlxFns> {
    GLX.get_or_init(|| {
        log_init("GLX");
        // SAFETY: resolves libGLX entry points with their C signatures
        unsafe { GlxFns::load() }
            .map_err(|e| error!("GLX setup failed: {}", e))
            .ok()
    })
    .as_ref()
}

/** Run `f` with the Vulkan layer disabled through the environment,
 * restoring the previous value afterwards */
pub fn with_layer_disabled<R>(f: impl FnOnce() -> R) -> R {
    let prev: Option<OsString> = std::env::var_os(DISABLE_ENV);
    std::env::set_var(DISABLE_ENV, "1");
    let ret = f();
    match prev {
        Some(v) => std::env::set_var(DISABLE_ENV, v),
        None => std::env::remove_var(DISABLE_ENV),
    }
    ret
}

/** Can the texture be exported without Vulkan? */
pub fn pure_gl_allowed(api: Api, force_vulkan: bool, vendor: Option<&[u8]>) -> bool {
    if force_vulkan {
        return false;
    }
    /* GLX pixmaps on the NVIDIA driver do not work for this */
    !(api == Api::Glx && vendor == Some(NVIDIA_VENDOR))
}

/** GL tiling matching how the Vulkan image was laid out */
pub fn gl_tiling(tiling: vk::ImageTiling, linear_hint: bool) -> i32 {
    if tiling == vk::ImageTiling::LINEAR || linear_hint {
        GL_LINEAR_TILING_EXT
    } else {
        GL_OPTIMAL_TILING_EXT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeChange {
    Same,
    /** The export no longer fits and must be recreated */
    Resized,
    /** 0-sized, e.g. minimized; keep the export and skip the frame */
    Hidden,
}

pub fn size_change(captured: (i32, i32), now: (i32, i32)) -> SizeChange {
    if captured == now {
        SizeChange::Same
    } else if now.0 == 0 || now.1 == 0 {
        SizeChange::Hidden
    } else {
        SizeChange::Resized
    }
}

/* Vulkan-backed export */

/** A private Vulkan device on the GPU GL renders with */
struct HelperVulkan {
    _entry: Entry,
    instance: ash::Instance,
    device: ash::Device,
    dev: Arc<ExportDevice>,
}

impl Drop for HelperVulkan {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

const HELPER_DEVICE_EXTENSIONS: &[&CStr] = &[
    vk::KHR_BIND_MEMORY2_NAME,
    vk::KHR_EXTERNAL_MEMORY_NAME,
    vk::KHR_EXTERNAL_MEMORY_FD_NAME,
    vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME,
    vk::KHR_DEDICATED_ALLOCATION_NAME,
    vk::KHR_GET_MEMORY_REQUIREMENTS2_NAME,
    vk::KHR_SAMPLER_YCBCR_CONVERSION_NAME,
    vk::KHR_MAINTENANCE1_NAME,
    vk::KHR_IMAGE_FORMAT_LIST_NAME,
    /* must stay last; dropped when device creation fails */
    vk::EXT_IMAGE_DRM_FORMAT_MODIFIER_NAME,
];

impl HelperVulkan {
    unsafe fn new(gl_uuid: Option<[u8; 16]>) -> Result<HelperVulkan, String> {
        let entry = Entry::load().map_err(|x| tag!("Failed to load Vulkan library: {:?}", x))?;
        let app = vk::ApplicationInfo::default()
            .application_name(c"OBS vkcapture")
            .api_version(vk::make_api_version(0, 1, 0, 0));
        let exts = [
            vk::KHR_EXTERNAL_MEMORY_CAPABILITIES_NAME.as_ptr(),
            vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_NAME.as_ptr(),
        ];
        let create = vk::InstanceCreateInfo::default()
            .application_info(&app)
            .enabled_extension_names(&exts);
        let instance = with_layer_disabled(|| entry.create_instance(&create, None))
            .map_err(|x| tag!("Failed to create Vulkan instance: {:?}", x))?;

        match Self::with_instance(&entry, &instance, gl_uuid) {
            Ok((device, dev)) => Ok(HelperVulkan {
                _entry: entry,
                instance,
                device,
                dev,
            }),
            Err(e) => {
                instance.destroy_instance(None);
                Err(e)
            }
        }
    }

    unsafe fn with_instance(
        entry: &Entry,
        instance: &ash::Instance,
        gl_uuid: Option<[u8; 16]>,
    ) -> Result<(ash::Device, Arc<ExportDevice>), String> {
        let props2 = khr::get_physical_device_properties2::Instance::new(entry, instance);
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|x| tag!("Failed to get physical devices: {:?}", x))?;
        let mut physdev = None;
        for p in devices.iter() {
            let mut id = vk::PhysicalDeviceIDProperties::default();
            let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut id);
            props2.get_physical_device_properties2(*p, &mut props);
            if Some(id.device_uuid) == gl_uuid {
                physdev = Some(*p);
                break;
            }
        }
        let physdev = match physdev {
            Some(p) => p,
            None => {
                let p = devices
                    .first()
                    .copied()
                    .ok_or_else(|| tag!("No Vulkan devices"))?;
                warn!("No Vulkan device matches the GL device, using the first one");
                p
            }
        };

        let prio = [1.0];
        let queues = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&prio)];
        let names: Vec<*const c_char> = HELPER_DEVICE_EXTENSIONS
            .iter()
            .map(|x| x.as_ptr())
            .collect();
        let mut has_modifiers = true;
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queues)
            .enabled_extension_names(&names);
        let device = match instance.create_device(physdev, &info, None) {
            Ok(d) => d,
            Err(x) => {
                debug!("Device creation failed ({:?}), retrying without modifiers", x);
                has_modifiers = false;
                let info = info.enabled_extension_names(&names[..names.len() - 1]);
                instance
                    .create_device(physdev, &info, None)
                    .map_err(|x| tag!("Failed to create Vulkan device: {:?}", x))?
            }
        };

        let handle = instance.handle();
        let gipa = entry.static_fn().get_instance_proc_addr;
        let gdpa = instance.fp_v1_0().get_device_proc_addr;
        let dev_handle = device.handle();
        let dev = ExportDevice::new(
            instance.clone(),
            |name| std::mem::transmute(gipa(handle, name.as_ptr())),
            physdev,
            device.clone(),
            |name| std::mem::transmute(gdpa(dev_handle, name.as_ptr())),
            has_modifiers,
            false,
        );
        Ok((device, Arc::new(dev)))
    }
}

/* Capture state */

enum Backing {
    Egl {
        image: *mut c_void,
    },
    Glx {
        xpixmap: c_ulong,
        glxpixmap: c_ulong,
    },
    Vulkan {
        image: ExportedImage,
        memory_object: u32,
    },
}

struct GlCapture {
    api: Api,
    display: Display,
    surface: usize,
    context: *mut c_void,
    width: i32,
    height: i32,
    fbo: u32,
    texture: u32,
    backing: Backing,
    /** Plane fds for the EGL and GLX paths; the Vulkan image owns its own */
    fds: Vec<OwnedFd>,
    texture_data: TextureData,
}

impl GlCapture {
    fn plane_fds(&self) -> Vec<BorrowedFd<'_>> {
        match self.backing {
            Backing::Vulkan { ref image, .. } => image.plane_fds(),
            _ => self.fds.iter().map(|x| x.as_fd()).collect(),
        }
    }
}

struct GlState {
    gl: Option<GlFns>,
    x11: Option<Option<X11Fns>>,
    vulkan: Option<Option<HelperVulkan>>,
    capture: Option<GlCapture>,
    /** Window of the most recent EGL window surface */
    egl_winid: u32,
    failed_hints: Option<AllocHints>,
}

// SAFETY: the raw X11/EGL handles inside are only used by the thread that
// holds the state lock, from within GL calls that are valid on any thread
unsafe impl Send for GlState {}

static STATE: Mutex<GlState> = Mutex::new(GlState {
    gl: None,
    x11: None,
    vulkan: None,
    capture: None,
    egl_winid: 0,
    failed_hints: None,
});

fn api_gpa(api: Api) -> Option<GetProcAddressFn> {
    match api {
        Api::Egl => egl().map(|f| f.get_proc_address),
        Api::Glx => glx().map(|f| f.get_proc_address),
    }
}

unsafe fn current_context(api: Api) -> *mut c_void {
    let f = match api {
        Api::Egl => egl().map(|f| f.get_current_context),
        Api::Glx => glx().map(|f| f.get_current_context),
    };
    f.map(|f| f()).unwrap_or(std::ptr::null_mut())
}

unsafe fn query_size(api: Api, display: Display, surface: usize) -> (i32, i32) {
    match api {
        Api::Egl => {
            let Some(f) = egl() else {
                return (0, 0);
            };
            let (mut w, mut h) = (0, 0);
            (f.query_surface)(display, surface as *mut c_void, EGL_WIDTH, &mut w);
            (f.query_surface)(display, surface as *mut c_void, EGL_HEIGHT, &mut h);
            (w, h)
        }
        Api::Glx => {
            let Some(f) = glx() else {
                return (0, 0);
            };
            let (mut w, mut h) = (0u32, 0u32);
            (f.query_drawable)(display, surface as c_ulong, GLX_WIDTH, &mut w);
            (f.query_drawable)(display, surface as c_ulong, GLX_HEIGHT, &mut h);
            (w as i32, h as i32)
        }
    }
}

/** Take ownership of fds handed out by a C API, ignoring invalid ones */
unsafe fn own_fds(raw: &[c_int]) -> Vec<OwnedFd> {
    raw.iter()
        .filter(|fd| **fd >= 0)
        .map(|fd| OwnedFd::from_raw_fd(*fd))
        .collect()
}

fn plane_layout(strides: &[i32], offsets: &[i32]) -> ([i32; MAX_PLANES], [i32; MAX_PLANES]) {
    let mut s = [0; MAX_PLANES];
    let mut o = [0; MAX_PLANES];
    for i in 0..MAX_PLANES.min(strides.len()).min(offsets.len()) {
        s[i] = strides[i];
        o[i] = offsets[i];
    }
    (s, o)
}

impl GlState {
    fn gl_fns(&mut self, api: Api) -> Option<GlFns> {
        if self.gl.is_none() {
            let gpa = api_gpa(api)?;
            // SAFETY: the GetProcAddress function of the API in use
            match unsafe { GlFns::load(gpa) } {
                Ok(f) => self.gl = Some(f),
                Err(e) => {
                    error!("GL setup failed: {}", e);
                    return None;
                }
            }
        }
        self.gl
    }

    unsafe fn init_egl(
        &mut self,
        gl: &GlFns,
        cap: &mut GlCapture,
    ) -> Result<(), String> {
        let f = egl().ok_or_else(|| tag!("EGL unavailable"))?;
        let (Some(query), Some(export)) = (f.export_query, f.export) else {
            return Err(tag!("EGL_MESA_image_dma_buf_export unavailable"));
        };
        (gl.tex_image_2d)(
            GL_TEXTURE_2D,
            0,
            GL_RGBA as i32,
            cap.width,
            cap.height,
            0,
            GL_RGBA,
            GL_UNSIGNED_BYTE,
            std::ptr::null(),
        );
        let image = (f.create_image)(
            cap.display,
            (f.get_current_context)(),
            EGL_GL_TEXTURE_2D,
            cap.texture as usize as *mut c_void,
            std::ptr::null(),
        );
        if image.is_null() {
            return Err(tag!("Failed to create EGL image"));
        }
        cap.backing = Backing::Egl { image };

        let (mut fourcc, mut nplanes, mut modifier) = (0i32, 0i32, 0u64);
        if query(cap.display, image, &mut fourcc, &mut nplanes, &mut modifier) == 0 {
            return Err(tag!("Failed to query dmabuf export"));
        }
        if nplanes <= 0 || nplanes as usize > MAX_PLANES {
            return Err(tag!("Unexpected plane count {}", nplanes));
        }
        let mut fds = [-1; MAX_PLANES];
        let mut strides = [0; MAX_PLANES];
        let mut offsets = [0; MAX_PLANES];
        let ok = export(
            cap.display,
            image,
            fds.as_mut_ptr(),
            strides.as_mut_ptr(),
            offsets.as_mut_ptr(),
        );
        cap.fds = own_fds(&fds[..nplanes as usize]);
        if ok == 0 || cap.fds.len() != nplanes as usize {
            return Err(tag!("Failed dmabuf export"));
        }
        let (strides, offsets) = plane_layout(&strides, &offsets);
        cap.texture_data = TextureData {
            nfd: nplanes as u8,
            format: fourcc as u32,
            strides,
            offsets,
            modifier,
            winid: self.egl_winid,
            ..cap.texture_data
        };
        Ok(())
    }

    unsafe fn init_glx(&mut self, gl: &GlFns, cap: &mut GlCapture) -> Result<(), String> {
        let f = glx().ok_or_else(|| tag!("GLX unavailable"))?;
        let bind = f
            .bind_tex_image
            .ok_or_else(|| tag!("GLX_EXT_texture_from_pixmap unavailable"))?;
        if self.x11.is_none() {
            self.x11 = Some(X11Fns::load().map_err(|e| warn!("No DRI3 capture: {}", e)).ok());
        }
        let Some(Some(x)) = self.x11.as_ref() else {
            return Err(tag!("X11/DRI3 functions unavailable"));
        };

        (gl.tex_image_2d)(
            GL_TEXTURE_2D,
            0,
            GL_RGBA as i32,
            cap.width,
            cap.height,
            0,
            GL_RGBA,
            GL_UNSIGNED_BYTE,
            std::ptr::null(),
        );
        let root = (x.default_root_window)(cap.display);
        let xpixmap = (x.create_pixmap)(
            cap.display,
            root,
            cap.width as c_uint,
            cap.height as c_uint,
            24,
        );
        cap.backing = Backing::Glx {
            xpixmap,
            glxpixmap: 0,
        };

        let config_attribs = [
            GLX_BIND_TO_TEXTURE_RGBA_EXT,
            1,
            GLX_DRAWABLE_TYPE,
            GLX_PIXMAP_BIT,
            GLX_BIND_TO_TEXTURE_TARGETS_EXT,
            GLX_TEXTURE_2D_BIT_EXT,
            GLX_DOUBLEBUFFER,
            0,
            GLX_RED_SIZE,
            8,
            GLX_GREEN_SIZE,
            8,
            GLX_BLUE_SIZE,
            8,
            GLX_ALPHA_SIZE,
            8,
            0,
        ];
        let mut n = 0;
        let configs = (f.choose_fb_config)(
            cap.display,
            (x.default_screen)(cap.display),
            config_attribs.as_ptr(),
            &mut n,
        );
        if configs.is_null() || n <= 0 {
            return Err(tag!("Failed to choose FBConfig"));
        }
        let pixmap_attribs = [
            GLX_TEXTURE_TARGET_EXT,
            GLX_TEXTURE_2D_EXT,
            GLX_TEXTURE_FORMAT_EXT,
            GLX_TEXTURE_FORMAT_RGBA_EXT,
            GLX_MIPMAP_TEXTURE_EXT,
            0,
            0,
        ];
        let glxpixmap =
            (f.create_pixmap)(cap.display, *configs, xpixmap, pixmap_attribs.as_ptr());
        (x.free)(configs as *mut c_void);
        cap.backing = Backing::Glx { xpixmap, glxpixmap };
        bind(cap.display, glxpixmap, GLX_FRONT_LEFT_EXT, std::ptr::null());

        let conn = (x.get_xcb_connection)(cap.display);
        let cookie = (x.buffers_from_pixmap)(conn, xpixmap as u32);
        let reply = (x.buffers_from_pixmap_reply)(conn, cookie, std::ptr::null_mut());
        if reply.is_null() {
            return Err(tag!("Failed to get buffer from pixmap"));
        }
        let nfd = (*reply).nfd as usize;
        let fds = std::slice::from_raw_parts((x.reply_fds)(conn, reply), nfd);
        /* all fds are owned from here on, even if there are too many */
        cap.fds = own_fds(fds);
        let strides: Vec<i32> = std::slice::from_raw_parts((x.reply_strides)(reply), nfd)
            .iter()
            .map(|x| *x as i32)
            .collect();
        let offsets: Vec<i32> = std::slice::from_raw_parts((x.reply_offsets)(reply), nfd)
            .iter()
            .map(|x| *x as i32)
            .collect();
        let modifier = (*reply).modifier;
        libc::free(reply as *mut c_void);

        if nfd == 0 || nfd > MAX_PLANES || cap.fds.len() != nfd {
            return Err(tag!("Unexpected DRI3 buffer count {}", nfd));
        }
        let (strides, offsets) = plane_layout(&strides, &offsets);
        cap.texture_data = TextureData {
            nfd: nfd as u8,
            format: DRM_FORMAT_ARGB8888,
            strides,
            offsets,
            modifier,
            winid: cap.surface as u32,
            ..cap.texture_data
        };
        Ok(())
    }

    unsafe fn init_vulkan(
        &mut self,
        gl: &GlFns,
        cap: &mut GlCapture,
        hints: AllocHints,
        consumer_uuid: [u8; 16],
    ) -> Result<(), String> {
        let mem = gl
            .memory
            .ok_or_else(|| tag!("GL_EXT_memory_object_fd unavailable"))?;
        if self.vulkan.is_none() {
            let mut uuid = None;
            if let Some(f) = gl.get_unsigned_bytei_v {
                let mut buf = [0u8; 16];
                f(GL_DEVICE_UUID_EXT, 0, buf.as_mut_ptr());
                uuid = Some(buf);
            }
            self.vulkan = Some(
                HelperVulkan::new(uuid)
                    .map_err(|e| error!("Vulkan setup failed: {}", e))
                    .ok(),
            );
        }
        let Some(Some(helper)) = self.vulkan.as_ref() else {
            return Err(tag!("No Vulkan device"));
        };

        let req = ExportRequest {
            width: cap.width as u32,
            height: cap.height as u32,
            format: vk::Format::B8G8R8A8_UNORM,
            fourcc: DRM_FORMAT_ABGR8888,
            hints,
            consumer_uuid,
            opaque_fd: true,
        };
        let mut image = export_image(&helper.dev, &req)?;
        let opaque = image
            .opaque_fd
            .take()
            .ok_or_else(|| tag!("No opaque fd exported"))?;

        gl.clear_errors();
        let mut memory_object = 0;
        (mem.create_memory_objects)(1, &mut memory_object);
        let dedicated = 1;
        (mem.memory_object_parameteriv)(memory_object, GL_DEDICATED_MEMORY_OBJECT_EXT, &dedicated);
        /* GL owns the fd after import */
        (mem.import_memory_fd)(
            memory_object,
            image.allocation_size,
            GL_HANDLE_TYPE_OPAQUE_FD_EXT,
            opaque.into_raw_fd(),
        );
        (gl.tex_parameteri)(
            GL_TEXTURE_2D,
            GL_TEXTURE_TILING_EXT,
            gl_tiling(image.tiling, hints.linear),
        );
        (mem.tex_storage_mem_2d)(
            GL_TEXTURE_2D,
            1,
            GL_RGBA8,
            cap.width,
            cap.height,
            memory_object,
            0,
        );
        let ok = (mem.is_memory_object)(memory_object) != 0 && (gl.get_error)() == GL_NO_ERROR;
        cap.texture_data = image.texture_data(0, true, 0);
        cap.texture_data.winid = match cap.api {
            Api::Egl => self.egl_winid,
            Api::Glx => cap.surface as u32,
        };
        cap.backing = Backing::Vulkan {
            image,
            memory_object,
        };
        if !ok {
            return Err(tag!("OpenGL import of Vulkan memory failed"));
        }
        Ok(())
    }

    /** Create the shared texture for `surface` and describe it */
    unsafe fn init(
        &mut self,
        gl: &GlFns,
        api: Api,
        display: Display,
        surface: usize,
        hints: AllocHints,
        consumer_uuid: [u8; 16],
    ) -> Result<GlCapture, String> {
        let (width, height) = query_size(api, display, surface);
        if width <= 0 || height <= 0 {
            return Err(tag!("Drawable has no size"));
        }

        let mut fbo = 0;
        (gl.gen_framebuffers)(1, &mut fbo);
        if fbo == 0 {
            return Err(tag!("Failed to create FBO"));
        }
        let last_tex = gl.get_int(GL_TEXTURE_BINDING_2D);

        let mut cap = GlCapture {
            api,
            display,
            surface,
            context: current_context(api),
            width,
            height,
            fbo,
            texture: 0,
            backing: Backing::Egl {
                image: std::ptr::null_mut(),
            },
            fds: Vec::new(),
            texture_data: TextureData {
                width,
                height,
                flip: true,
                ..TextureData::default()
            },
        };

        let vendor = (gl.get_string)(GL_VENDOR);
        let vendor = (!vendor.is_null()).then(|| CStr::from_ptr(vendor as *const c_char).to_bytes());
        let mut res = Err(tag!("Pure GL export disabled"));
        if pure_gl_allowed(api, capture::config().glvulkan, vendor) {
            cap.texture = gl.new_texture();
            res = match api {
                Api::Egl => self.init_egl(gl, &mut cap),
                Api::Glx => self.init_glx(gl, &mut cap),
            };
            if let Err(ref e) = res {
                debug!("GL export failed, trying Vulkan: {}", e);
                self.release(gl, &mut cap, true);
                (gl.gen_framebuffers)(1, &mut cap.fbo);
            }
        }
        if res.is_err() {
            cap.texture = gl.new_texture();
            res = self.init_vulkan(gl, &mut cap, hints, consumer_uuid);
        }
        (gl.bind_texture)(GL_TEXTURE_2D, last_tex as u32);

        match res {
            Ok(()) => Ok(cap),
            Err(e) => {
                self.release(gl, &mut cap, true);
                Err(e)
            }
        }
    }

    /** Free what `cap` holds. GL objects are only deleted when `delete_gl`,
     * i.e. when the owning context is current. */
    unsafe fn release(&mut self, gl: &GlFns, cap: &mut GlCapture, delete_gl: bool) {
        cap.fds.clear();
        if delete_gl {
            if cap.fbo != 0 {
                (gl.delete_framebuffers)(1, &cap.fbo);
            }
            if cap.texture != 0 {
                (gl.delete_textures)(1, &cap.texture);
            }
        }
        cap.fbo = 0;
        cap.texture = 0;
        match std::mem::replace(
            &mut cap.backing,
            Backing::Egl {
                image: std::ptr::null_mut(),
            },
        ) {
            Backing::Egl { image } => {
                if let (false, Some(f)) = (image.is_null(), egl()) {
                    (f.destroy_image)(cap.display, image);
                }
            }
            Backing::Glx { xpixmap, glxpixmap } => {
                if let (true, Some(f)) = (glxpixmap != 0, glx()) {
                    (f.destroy_pixmap)(cap.display, glxpixmap);
                }
                if let (true, Some(Some(x))) = (xpixmap != 0, self.x11.as_ref()) {
                    (x.free_pixmap)(cap.display, xpixmap);
                }
            }
            Backing::Vulkan {
                image,
                memory_object,
            } => {
                if delete_gl && memory_object != 0 {
                    if let Some(mem) = gl.memory {
                        (mem.delete_memory_objects)(1, &memory_object);
                    }
                }
                /* the GL texture is gone before the memory behind it */
                drop(image);
            }
        }
    }

    unsafe fn free(&mut self, delete_gl: bool) {
        let Some(mut cap) = self.capture.take() else {
            return;
        };
        if let Some(gl) = self.gl {
            self.release(&gl, &mut cap, delete_gl);
        }
        info!("OpenGL capture freed");
    }

    unsafe fn copy_backbuffer(gl: &GlFns, cap: &GlCapture) {
        let last_srgb = (gl.is_enabled)(GL_FRAMEBUFFER_SRGB) != 0;
        let last_read = gl.get_int(GL_READ_FRAMEBUFFER_BINDING);
        let last_draw = gl.get_int(GL_DRAW_FRAMEBUFFER_BINDING);
        let last_tex = gl.get_int(GL_TEXTURE_BINDING_2D);

        (gl.disable)(GL_FRAMEBUFFER_SRGB);
        (gl.bind_framebuffer)(GL_READ_FRAMEBUFFER, 0);
        let last_read_buffer = gl.get_int(GL_READ_BUFFER);
        (gl.bind_framebuffer)(GL_DRAW_FRAMEBUFFER, cap.fbo);
        (gl.bind_texture)(GL_TEXTURE_2D, cap.texture);
        (gl.framebuffer_texture_2d)(
            GL_DRAW_FRAMEBUFFER,
            GL_COLOR_ATTACHMENT0,
            GL_TEXTURE_2D,
            cap.texture,
            0,
        );
        (gl.read_buffer)(GL_BACK);
        (gl.draw_buffer)(GL_COLOR_ATTACHMENT0);
        (gl.blit_framebuffer)(
            0,
            0,
            cap.width,
            cap.height,
            0,
            0,
            cap.width,
            cap.height,
            GL_COLOR_BUFFER_BIT,
            GL_LINEAR,
        );
        (gl.read_buffer)(last_read_buffer as u32);

        (gl.bind_texture)(GL_TEXTURE_2D, last_tex as u32);
        (gl.bind_framebuffer)(GL_DRAW_FRAMEBUFFER, last_draw as u32);
        (gl.bind_framebuffer)(GL_READ_FRAMEBUFFER, last_read as u32);
        if last_srgb {
            (gl.enable)(GL_FRAMEBUFFER_SRGB);
        }
    }

    /** Capture work for one swap of `surface` */
    unsafe fn on_swap(&mut self, api: Api, display: Display, surface: usize) {
        if let Some(ref cap) = self.capture {
            if cap.api != api {
                return;
            }
        }
        let Some(gl) = self.gl_fns(api) else {
            return;
        };

        let mut client = capture::global();
        client.update_socket();

        if client.should_stop() {
            self.free(true);
            client.stop();
        } else if !client.ready() && self.capture.is_some() {
            self.free(true);
        }

        if client.should_init() && self.capture.is_none() {
            let hints = client.hints();
            if self.failed_hints != Some(hints) {
                match self.init(&gl, api, display, surface, hints, client.device_uuid()) {
                    Ok(mut cap) => {
                        let sent = client.init_texture(&cap.texture_data, &cap.plane_fds());
                        match sent {
                            Ok(()) => {
                                info!(
                                    "OpenGL capture started: {}x{}",
                                    cap.width, cap.height
                                );
                                self.failed_hints = None;
                                self.capture = Some(cap);
                            }
                            Err(e) => {
                                warn!("Failed to announce texture: {}", e);
                                self.release(&gl, &mut cap, true);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("OpenGL capture init failed with {:?}: {}", hints, e);
                        self.failed_hints = Some(hints);
                    }
                }
            }
        }

        if !client.ready() {
            return;
        }
        let Some(cap) = self.capture.as_ref() else {
            return;
        };
        if cap.surface != surface {
            return;
        }
        let size = query_size(api, display, surface);
        match size_change((cap.width, cap.height), size) {
            SizeChange::Same => Self::copy_backbuffer(&gl, cap),
            SizeChange::Hidden => (),
            SizeChange::Resized => {
                debug!("Drawable resized to {}x{}", size.0, size.1);
                self.free(true);
                client.stop();
            }
        }
    }

    /** Drop the capture if it was made with `context` */
    unsafe fn context_destroyed(&mut self, api: Api, context: *mut c_void) {
        let Some(ref cap) = self.capture else {
            return;
        };
        if cap.api != api || (!cap.context.is_null() && cap.context != context) {
            return;
        }
        let current = current_context(api) == context;
        self.free(current);
        capture::global().stop();
    }
}

/* Hooks */

/** The hook for an EGL entry point name */
pub fn egl_hook(name: &[u8]) -> Option<*mut c_void> {
    let f = match name {
        b"eglGetProcAddress" => egl_get_proc_address as *mut c_void,
        b"eglSwapBuffers" => egl_swap_buffers as *mut c_void,
        b"eglDestroyContext" => egl_destroy_context as *mut c_void,
        b"eglCreateWindowSurface" => egl_create_window_surface as *mut c_void,
        _ => return None,
    };
    Some(f)
}

/** The hook for a GLX entry point name */
pub fn glx_hook(name: &[u8]) -> Option<*mut c_void> {
    let f = match name {
        b"glXGetProcAddress" => glx_get_proc_address as *mut c_void,
        b"glXGetProcAddressARB" => glx_get_proc_address_arb as *mut c_void,
        b"glXSwapBuffers" => glx_swap_buffers as *mut c_void,
        b"glXSwapBuffersMscOML" => glx_swap_buffers_msc_oml as *mut c_void,
        b"glXDestroyContext" => glx_destroy_context as *mut c_void,
        _ => return None,
    };
    Some(f)
}

unsafe fn hook_for(name: *const c_char) -> Option<*mut c_void> {
    if name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(name).to_bytes();
    glx_hook(name).or_else(|| egl_hook(name))
}

pub unsafe extern "C" fn egl_get_proc_address(name: *const c_char) -> *mut c_void {
    if let Some(f) = hook_for(name) {
        return f;
    }
    match egl() {
        Some(f) => (f.get_proc_address)(name),
        None => std::ptr::null_mut(),
    }
}

pub unsafe extern "C" fn egl_swap_buffers(display: Display, surface: *mut c_void) -> c_uint {
    let Some(f) = egl() else {
        return 0;
    };
    lock(&STATE).on_swap(Api::Egl, display, surface as usize);
    (f.swap_buffers)(display, surface)
}

pub unsafe extern "C" fn egl_destroy_context(display: Display, context: *mut c_void) -> c_uint {
    let Some(f) = egl() else {
        return 0;
    };
    lock(&STATE).context_destroyed(Api::Egl, context);
    (f.destroy_context)(display, context)
}

pub unsafe extern "C" fn egl_create_window_surface(
    display: Display,
    config: *mut c_void,
    window: *mut c_void,
    attribs: *const i32,
) -> *mut c_void {
    let Some(f) = egl() else {
        return std::ptr::null_mut();
    };
    let surface = (f.create_window_surface)(display, config, window, attribs);
    if !surface.is_null() {
        lock(&STATE).egl_winid = window as usize as u32;
    }
    surface
}

pub unsafe extern "C" fn glx_get_proc_address(name: *const c_char) -> *mut c_void {
    if let Some(f) = hook_for(name) {
        return f;
    }
    match glx() {
        Some(f) => (f.get_proc_address)(name),
        None => std::ptr::null_mut(),
    }
}

pub unsafe extern "C" fn glx_get_proc_address_arb(name: *const c_char) -> *mut c_void {
    if let Some(f) = hook_for(name) {
        return f;
    }
    match glx() {
        Some(f) => (f.get_proc_address_arb)(name),
        None => std::ptr::null_mut(),
    }
}

pub unsafe extern "C" fn glx_destroy_context(display: Display, context: *mut c_void) {
    let Some(f) = glx() else {
        return;
    };
    lock(&STATE).context_destroyed(Api::Glx, context);
    (f.destroy_context)(display, context)
}

pub unsafe extern "C" fn glx_swap_buffers(display: Display, drawable: c_ulong) {
    let Some(f) = glx() else {
        return;
    };
    lock(&STATE).on_swap(Api::Glx, display, drawable as usize);
    (f.swap_buffers)(display, drawable)
}

pub unsafe extern "C" fn glx_swap_buffers_msc_oml(
    display: Display,
    drawable: c_ulong,
    target_msc: i64,
    divisor: i64,
    remainder: i64,
) -> i64 {
    let Some(f) = glx() else {
        return 0;
    };
    let Some(swap) = f.swap_buffers_msc_oml else {
        return 0;
    };
    lock(&STATE).on_swap(Api::Glx, display, drawable as usize);
    swap(display, drawable, target_msc, divisor, remainder)
}

/** `dlsym` replacement: hooks for hooked names, libc's answer otherwise */
pub unsafe extern "C" fn dlsym_hook(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    match hook_for(name) {
        Some(f) => f,
        None => real_dlsym(handle, name),
    }
}

/** `dlvsym` replacement, as for `dlsym_hook` */
pub unsafe extern "C" fn dlvsym_hook(
    handle: *mut c_void,
    name: *const c_char,
    version: *const c_char,
) -> *mut c_void {
    match hook_for(name) {
        Some(f) => f,
        None => real_dlvsym(handle, name, version),
    }
}

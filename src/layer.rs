/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Vulkan layer: loader negotiation and the intercepted entry points.
 *
 * Every hook looks up its state through the dispatch key of the handle it
 * was called with, then forwards to the next layer in the chain. Hooks do
 * capture work only on devices marked valid; everything else is a plain
 * pass-through. */
use crate::capture;
use crate::exporter::ExportDevice;
use crate::objects::{DispatchKey, ObjectTable};
use crate::swapchain::{self, QueueData, SwapchainData};
use crate::tag;
use crate::util::fmt_bool;
use ash::vk::Handle;
use ash::{khr, vk};
use log::{debug, info, warn};
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

/* Structures shared with the loader (vk_layer.h) */

const LAYER_NEGOTIATE_INTERFACE_STRUCT: i32 = 1;
const CURRENT_LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

const LAYER_LINK_INFO: i32 = 0;
const LOADER_DATA_CALLBACK: i32 = 1;

type PfnSetDeviceLoaderData =
    unsafe extern "system" fn(device: vk::Device, object: *mut c_void) -> vk::Result;

#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
}

#[repr(C)]
#[allow(dead_code)]
struct LayerInstanceLink {
    p_next: *mut LayerInstanceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_physical_device_proc_addr: *const c_void,
}

#[repr(C)]
struct LayerDeviceLink {
    p_next: *mut LayerDeviceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union LayerInstanceUnion {
    layer_info: *mut LayerInstanceLink,
    layer_device: [*const c_void; 2],
}

#[repr(C)]
#[allow(dead_code)]
struct LayerInstanceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: i32,
    u: LayerInstanceUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
union LayerDeviceUnion {
    layer_info: *mut LayerDeviceLink,
    set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
#[allow(dead_code)]
struct LayerDeviceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const c_void,
    function: i32,
    u: LayerDeviceUnion,
}

/** Common prefix of all structures in a create-info pNext chain */
#[repr(C)]
struct ChainHeader {
    s_type: vk::StructureType,
    p_next: *const c_void,
}

/** Find the loader's structure with the given type and function in a pNext
 * chain. Both loader create-info structures share their first three fields. */
unsafe fn find_loader_info(
    mut p: *const c_void,
    s_type: vk::StructureType,
    function: i32,
) -> *mut c_void {
    while !p.is_null() {
        let hdr = p as *const ChainHeader;
        if (*hdr).s_type == s_type && (*(p as *const LayerDeviceCreateInfo)).function == function {
            return p as *mut c_void;
        }
        p = (*hdr).p_next;
    }
    std::ptr::null_mut()
}

/* Tracked objects */

pub struct InstanceData {
    pub key: DispatchKey,
    pub handle: vk::Instance,
    pub instance: ash::Instance,
    gipa: vk::PFN_vkGetInstanceProcAddr,
    /** Whether the extensions the exporter needs were enabled */
    capture_capable: bool,
    create_xcb_surface: Option<vk::PFN_vkCreateXcbSurfaceKHR>,
    create_xlib_surface: Option<vk::PFN_vkCreateXlibSurfaceKHR>,
    create_wayland_surface: Option<vk::PFN_vkCreateWaylandSurfaceKHR>,
    destroy_surface: Option<vk::PFN_vkDestroySurfaceKHR>,
}

pub struct SurfaceData {
    pub instance: DispatchKey,
    pub winid: u32,
}

pub struct DeviceData {
    pub key: DispatchKey,
    pub handle: vk::Device,
    pub instance_key: DispatchKey,
    device: ash::Device,
    export: Option<Arc<ExportDevice>>,
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    swapchain_fn: khr::swapchain::DeviceFn,
    set_loader_data: Option<PfnSetDeviceLoaderData>,
    valid: AtomicBool,
    /** The swapchain currently exported from this device */
    pub cur_swap: Mutex<Option<Arc<SwapchainData>>>,
}

impl DeviceData {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /** The exporter, for devices that can capture at all */
    pub fn export(&self) -> Result<&Arc<ExportDevice>, String> {
        self.export
            .as_ref()
            .ok_or_else(|| tag!("Device cannot export images"))
    }

    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /** Stop capturing on this device for good, e.g. after device loss */
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            warn!("Disabling capture on device {:?}", self.handle);
        }
    }

    /** Give a command buffer allocated by the layer the device's dispatch table */
    pub fn set_loader_data(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        let obj = cmd.as_raw() as usize as *mut c_void;
        if obj.is_null() {
            return Err(tag!("Null command buffer"));
        }
        if let Some(f) = self.set_loader_data {
            // SAFETY: the callback was given by the loader for this device
            unsafe { f(self.handle, obj) }
                .result()
                .map_err(|x| tag!("Failed to set loader data: {:?}", x))
        } else {
            // SAFETY: dispatchable objects start with the loader's table pointer
            unsafe { (obj as *mut usize).write(self.key.as_raw()) };
            Ok(())
        }
    }
}

pub(crate) static INSTANCES: ObjectTable<DispatchKey, InstanceData> = ObjectTable::new();
pub(crate) static SURFACES: ObjectTable<(DispatchKey, u64), SurfaceData> = ObjectTable::new();
pub(crate) static DEVICES: ObjectTable<DispatchKey, DeviceData> = ObjectTable::new();
pub(crate) static SWAPCHAINS: ObjectTable<u64, SwapchainData> = ObjectTable::new();
pub(crate) static QUEUES: ObjectTable<u64, QueueData> = ObjectTable::new();

/** Dispatch key of a handle, if it is not null */
unsafe fn key_of<H: Handle + Copy>(h: H) -> Option<DispatchKey> {
    if h.as_raw() == 0 {
        None
    } else {
        Some(DispatchKey::of(h))
    }
}

/* Extensions */

const INSTANCE_EXTENSIONS: &[&CStr] = &[
    vk::KHR_EXTERNAL_MEMORY_CAPABILITIES_NAME,
    vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_NAME,
];

const DEVICE_EXTENSIONS: &[&CStr] = &[
    vk::KHR_BIND_MEMORY2_NAME,
    vk::KHR_GET_MEMORY_REQUIREMENTS2_NAME,
    vk::KHR_EXTERNAL_MEMORY_NAME,
    vk::KHR_EXTERNAL_MEMORY_FD_NAME,
    vk::KHR_MAINTENANCE1_NAME,
    vk::KHR_IMAGE_FORMAT_LIST_NAME,
    vk::KHR_SAMPLER_YCBCR_CONVERSION_NAME,
    vk::KHR_DEDICATED_ALLOCATION_NAME,
    vk::EXT_IMAGE_DRM_FORMAT_MODIFIER_NAME,
    vk::KHR_DRIVER_PROPERTIES_NAME,
    vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME,
];

/** Device extensions without which nothing can be exported */
const DEVICE_EXTENSIONS_REQUIRED: &[&CStr] = &[
    vk::KHR_BIND_MEMORY2_NAME,
    vk::KHR_GET_MEMORY_REQUIREMENTS2_NAME,
    vk::KHR_EXTERNAL_MEMORY_NAME,
    vk::KHR_EXTERNAL_MEMORY_FD_NAME,
    vk::KHR_DEDICATED_ALLOCATION_NAME,
    vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME,
];

unsafe fn ext_names<'a>(count: u32, names: *const *const c_char) -> Vec<&'a CStr> {
    if names.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(names, count as usize)
        .iter()
        .filter(|p| !p.is_null())
        .map(|p| CStr::from_ptr(*p))
        .collect()
}

/** The extensions of `wanted` that are not in `enabled` but are `available` */
fn missing_extensions<'a>(
    enabled: &[&CStr],
    wanted: &[&'a CStr],
    available: impl Fn(&CStr) -> bool,
) -> Vec<&'a CStr> {
    wanted
        .iter()
        .filter(|w| !enabled.contains(w) && available(w))
        .copied()
        .collect()
}

fn all_enabled(enabled: &[&CStr], required: &[&CStr]) -> bool {
    required.iter().all(|r| enabled.contains(r))
}

/** Resolve an entry point through `gipa` as the function pointer type `T` */
unsafe fn load_fn<T: Copy>(
    gipa: vk::PFN_vkGetInstanceProcAddr,
    instance: vk::Instance,
    name: &CStr,
) -> Option<T> {
    let f = gipa(instance, name.as_ptr())?;
    Some(std::mem::transmute_copy::<unsafe extern "system" fn(), T>(&f))
}

macro_rules! hook {
    ($f:expr, $t:ty) => {
        // SAFETY: Vulkan entry points are handed out type-erased
        Some(unsafe { std::mem::transmute::<$t, unsafe extern "system" fn()>($f as $t) })
    };
}

/* Instance hooks */

unsafe extern "system" fn create_instance(
    p_info: *const vk::InstanceCreateInfo<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    let link = find_loader_info(
        (*p_info).p_next,
        vk::StructureType::LOADER_INSTANCE_CREATE_INFO,
        LAYER_LINK_INFO,
    ) as *mut LayerInstanceCreateInfo;
    if link.is_null() || (*link).u.layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let layer_info = (*link).u.layer_info;
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    let next = (*layer_info).p_next;
    (*link).u.layer_info = next;

    let Some(create) =
        load_fn::<vk::PFN_vkCreateInstance>(gipa, vk::Instance::null(), c"vkCreateInstance")
    else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let info = &*p_info;
    let orig = ext_names(info.enabled_extension_count, info.pp_enabled_extension_names);
    /* The helper functions are core or filtered by the loader; just try */
    let added = missing_extensions(&orig, INSTANCE_EXTENSIONS, |_| true);
    let mut names: Vec<*const c_char> = orig.iter().map(|x| x.as_ptr()).collect();
    names.extend(added.iter().map(|x| x.as_ptr()));
    let mut patched = *info;
    patched.enabled_extension_count = names.len() as u32;
    patched.pp_enabled_extension_names = names.as_ptr();

    let mut capable = true;
    let mut res = create(&patched, p_alloc, p_instance);
    if res != vk::Result::SUCCESS && !added.is_empty() {
        warn!("Instance creation with extra extensions failed: {:?}, retrying", res);
        (*link).u.layer_info = next;
        capable = false;
        res = create(p_info, p_alloc, p_instance);
    }
    if res != vk::Result::SUCCESS {
        return res;
    }

    let handle = *p_instance;
    let Some(key) = key_of(handle) else {
        return res;
    };
    let instance = ash::Instance::load_with(
        |name| std::mem::transmute(gipa(handle, name.as_ptr())),
        handle,
    );
    let data = InstanceData {
        key,
        handle,
        instance,
        gipa,
        capture_capable: capable,
        create_xcb_surface: load_fn(gipa, handle, c"vkCreateXcbSurfaceKHR"),
        create_xlib_surface: load_fn(gipa, handle, c"vkCreateXlibSurfaceKHR"),
        create_wayland_surface: load_fn(gipa, handle, c"vkCreateWaylandSurfaceKHR"),
        destroy_surface: load_fn(gipa, handle, c"vkDestroySurfaceKHR"),
    };
    debug!(
        "Instance {:?} created, capture capable: {}",
        handle,
        fmt_bool(capable)
    );
    INSTANCES.insert(key, Arc::new(data));
    res
}

unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_alloc: *const vk::AllocationCallbacks<'_>,
) {
    let Some(key) = key_of(instance) else {
        return;
    };
    let Some(data) = INSTANCES.remove(key) else {
        return;
    };
    SURFACES.remove_where(|s| s.instance == key);
    data.instance.destroy_instance(p_alloc.as_ref());
}

fn remember_surface(inst: &InstanceData, surface: vk::SurfaceKHR, winid: u32) {
    debug!("Surface {:?} for window {:#x}", surface, winid);
    let data = SurfaceData {
        instance: inst.key,
        winid,
    };
    SURFACES.insert((inst.key, surface.as_raw()), Arc::new(data));
}

unsafe extern "system" fn create_xcb_surface(
    instance: vk::Instance,
    p_info: *const vk::XcbSurfaceCreateInfoKHR<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let Some(inst) = key_of(instance).and_then(|k| INSTANCES.get(k)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(f) = inst.create_xcb_surface else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let res = f(instance, p_info, p_alloc, p_surface);
    if res == vk::Result::SUCCESS {
        remember_surface(&inst, *p_surface, (*p_info).window);
    }
    res
}

unsafe extern "system" fn create_xlib_surface(
    instance: vk::Instance,
    p_info: *const vk::XlibSurfaceCreateInfoKHR<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let Some(inst) = key_of(instance).and_then(|k| INSTANCES.get(k)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(f) = inst.create_xlib_surface else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let res = f(instance, p_info, p_alloc, p_surface);
    if res == vk::Result::SUCCESS {
        remember_surface(&inst, *p_surface, (*p_info).window as u32);
    }
    res
}

unsafe extern "system" fn create_wayland_surface(
    instance: vk::Instance,
    p_info: *const vk::WaylandSurfaceCreateInfoKHR<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_surface: *mut vk::SurfaceKHR,
) -> vk::Result {
    let Some(inst) = key_of(instance).and_then(|k| INSTANCES.get(k)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let Some(f) = inst.create_wayland_surface else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let res = f(instance, p_info, p_alloc, p_surface);
    if res == vk::Result::SUCCESS {
        remember_surface(&inst, *p_surface, (*p_info).surface as usize as u32);
    }
    res
}

unsafe extern "system" fn destroy_surface(
    instance: vk::Instance,
    surface: vk::SurfaceKHR,
    p_alloc: *const vk::AllocationCallbacks<'_>,
) {
    let Some(inst) = key_of(instance).and_then(|k| INSTANCES.get(k)) else {
        return;
    };
    SURFACES.remove((inst.key, surface.as_raw()));
    if let Some(f) = inst.destroy_surface {
        f(instance, surface, p_alloc);
    }
}

/* Device hooks */

unsafe extern "system" fn create_device(
    physdev: vk::PhysicalDevice,
    p_info: *const vk::DeviceCreateInfo<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    let Some(inst) = key_of(physdev).and_then(|k| INSTANCES.get(k)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let link = find_loader_info(
        (*p_info).p_next,
        vk::StructureType::LOADER_DEVICE_CREATE_INFO,
        LAYER_LINK_INFO,
    ) as *mut LayerDeviceCreateInfo;
    if link.is_null() || (*link).u.layer_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let layer_info = (*link).u.layer_info;
    let gipa = (*layer_info).pfn_next_get_instance_proc_addr;
    let gdpa = (*layer_info).pfn_next_get_device_proc_addr;
    let next = (*layer_info).p_next;
    (*link).u.layer_info = next;

    let callback = find_loader_info(
        (*p_info).p_next,
        vk::StructureType::LOADER_DEVICE_CREATE_INFO,
        LOADER_DATA_CALLBACK,
    ) as *const LayerDeviceCreateInfo;
    let set_loader_data = if callback.is_null() {
        None
    } else {
        (*callback).u.set_device_loader_data
    };

    let Some(create) = load_fn::<vk::PFN_vkCreateDevice>(gipa, inst.handle, c"vkCreateDevice")
    else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let info = &*p_info;
    let orig = ext_names(info.enabled_extension_count, info.pp_enabled_extension_names);
    let available = inst
        .instance
        .enumerate_device_extension_properties(physdev)
        .unwrap_or_default();
    let added = missing_extensions(&orig, DEVICE_EXTENSIONS, |name| {
        available
            .iter()
            .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
    });
    let mut enabled: Vec<&CStr> = orig.clone();
    enabled.extend(added.iter().copied());
    let names: Vec<*const c_char> = enabled.iter().map(|x| x.as_ptr()).collect();
    let mut patched = *info;
    patched.enabled_extension_count = names.len() as u32;
    patched.pp_enabled_extension_names = names.as_ptr();

    let mut res = create(physdev, &patched, p_alloc, p_device);
    if res != vk::Result::SUCCESS && !added.is_empty() {
        warn!("Device creation with extra extensions failed: {:?}, retrying", res);
        (*link).u.layer_info = next;
        enabled = orig;
        res = create(physdev, p_info, p_alloc, p_device);
    }
    if res != vk::Result::SUCCESS {
        return res;
    }

    let handle = *p_device;
    let Some(key) = key_of(handle) else {
        return res;
    };
    let device = ash::Device::load_with(
        |name| std::mem::transmute(gdpa(handle, name.as_ptr())),
        handle,
    );
    let swapchain_fn =
        khr::swapchain::DeviceFn::load(|name| std::mem::transmute(gdpa(handle, name.as_ptr())));

    let valid = inst.capture_capable && all_enabled(&enabled, DEVICE_EXTENSIONS_REQUIRED);
    let export = if valid {
        let inst_handle = inst.handle;
        Some(Arc::new(ExportDevice::new(
            inst.instance.clone(),
            |name| std::mem::transmute(gipa(inst_handle, name.as_ptr())),
            physdev,
            device.clone(),
            |name| std::mem::transmute(gdpa(handle, name.as_ptr())),
            enabled.contains(&vk::EXT_IMAGE_DRM_FORMAT_MODIFIER_NAME),
            enabled.contains(&vk::KHR_DRIVER_PROPERTIES_NAME),
        )))
    } else {
        None
    };
    match export {
        Some(ref e) => info!("Device '{}' ready for capture", e.device_name),
        None => warn!("Device {:?} lacks export support, not capturing", handle),
    }

    let families = inst
        .instance
        .get_physical_device_queue_family_properties(physdev);
    if !info.p_queue_create_infos.is_null() {
        let qinfos =
            std::slice::from_raw_parts(info.p_queue_create_infos, info.queue_create_info_count as usize);
        for q in qinfos {
            /* protected queues are only reachable through vkGetDeviceQueue2 */
            if !q.flags.is_empty() {
                continue;
            }
            let flags = families
                .get(q.queue_family_index as usize)
                .map(|f| f.queue_flags)
                .unwrap_or(vk::QueueFlags::empty());
            for i in 0..q.queue_count {
                let queue = device.get_device_queue(q.queue_family_index, i);
                QUEUES.insert(
                    queue.as_raw(),
                    Arc::new(QueueData::new(key, queue, q.queue_family_index, flags)),
                );
            }
        }
    }

    let data = DeviceData {
        key,
        handle,
        instance_key: inst.key,
        device,
        export,
        gdpa,
        swapchain_fn,
        set_loader_data,
        valid: AtomicBool::new(valid),
        cur_swap: Mutex::new(None),
    };
    DEVICES.insert(key, Arc::new(data));
    res
}

unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_alloc: *const vk::AllocationCallbacks<'_>,
) {
    let Some(dev) = key_of(device).and_then(|k| DEVICES.remove(k)) else {
        return;
    };
    swapchain::on_destroy_device(&dev);
    dev.device.destroy_device(p_alloc.as_ref());
}

unsafe fn swapchain_images(
    f: &khr::swapchain::DeviceFn,
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
) -> Result<Vec<vk::Image>, vk::Result> {
    let mut n = 0u32;
    (f.get_swapchain_images_khr)(device, swapchain, &mut n, std::ptr::null_mut()).result()?;
    let mut images = vec![vk::Image::null(); n as usize];
    (f.get_swapchain_images_khr)(device, swapchain, &mut n, images.as_mut_ptr()).result()?;
    images.truncate(n as usize);
    Ok(images)
}

unsafe extern "system" fn create_swapchain(
    device: vk::Device,
    p_info: *const vk::SwapchainCreateInfoKHR<'_>,
    p_alloc: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let Some(dev) = key_of(device).and_then(|k| DEVICES.get(k)) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let create = dev.swapchain_fn.create_swapchain_khr;
    if !dev.valid() {
        return create(device, p_info, p_alloc, p_swapchain);
    }

    let info = &*p_info;
    let mut patched = *info;
    patched.image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    let res = create(device, &patched, p_alloc, p_swapchain);
    if res != vk::Result::SUCCESS {
        warn!("Swapchain creation with TRANSFER_SRC failed: {:?}, retrying", res);
        return create(device, p_info, p_alloc, p_swapchain);
    }

    let handle = *p_swapchain;
    let images = match swapchain_images(&dev.swapchain_fn, device, handle) {
        Ok(x) => x,
        Err(e) => {
            warn!("Failed to get swapchain images: {:?}", e);
            return res;
        }
    };
    let winid = SURFACES
        .get((dev.instance_key, info.surface.as_raw()))
        .map(|s| s.winid)
        .unwrap_or(0);
    debug!(
        "Swapchain {:?}: {}x{} {:?}, {} images, window {:#x}",
        handle,
        info.image_extent.width,
        info.image_extent.height,
        info.image_format,
        images.len(),
        winid
    );
    SWAPCHAINS.insert(
        handle.as_raw(),
        Arc::new(SwapchainData::new(dev.key, handle, images, info, winid)),
    );
    res
}

unsafe extern "system" fn destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_alloc: *const vk::AllocationCallbacks<'_>,
) {
    let Some(dev) = key_of(device).and_then(|k| DEVICES.get(k)) else {
        return;
    };
    if let Some(swap) = SWAPCHAINS.remove(swapchain.as_raw()) {
        swapchain::on_destroy_swapchain(&dev, &swap);
    }
    (dev.swapchain_fn.destroy_swapchain_khr)(device, swapchain, p_alloc);
}

unsafe extern "system" fn queue_present(
    queue: vk::Queue,
    p_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let Some(dev) = key_of(queue).and_then(|k| DEVICES.get(k)) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let info = &*p_info;
    let mut forward = *info;
    let mut replaced = [vk::Semaphore::null()];

    if dev.valid() && info.swapchain_count > 0 && !info.p_swapchains.is_null() {
        let first = *info.p_swapchains;
        let index = *info.p_image_indices;
        if let (Some(swap), Some(q)) = (
            SWAPCHAINS.get(first.as_raw()),
            QUEUES.get(queue.as_raw()),
        ) {
            let waits = if info.wait_semaphore_count > 0 && !info.p_wait_semaphores.is_null() {
                std::slice::from_raw_parts(info.p_wait_semaphores, info.wait_semaphore_count as usize)
            } else {
                &[]
            };
            if let Some(sem) = swapchain::on_present(&dev, &q, &swap, index, waits) {
                replaced[0] = sem;
                forward.wait_semaphore_count = 1;
                forward.p_wait_semaphores = replaced.as_ptr();
            }
        }
    }
    (dev.swapchain_fn.queue_present_khr)(queue, &forward)
}

/* Dispatch */

unsafe extern "system" fn get_device_proc_addr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let Some(dev) = key_of(device).and_then(|k| DEVICES.get(k)) else {
        return None;
    };
    let next = (dev.gdpa)(device, p_name);
    match CStr::from_ptr(p_name).to_bytes() {
        b"vkGetDeviceProcAddr" => hook!(get_device_proc_addr, vk::PFN_vkGetDeviceProcAddr),
        b"vkDestroyDevice" => hook!(destroy_device, vk::PFN_vkDestroyDevice),
        b"vkCreateSwapchainKHR" if next.is_some() => {
            hook!(create_swapchain, vk::PFN_vkCreateSwapchainKHR)
        }
        b"vkDestroySwapchainKHR" if next.is_some() => {
            hook!(destroy_swapchain, vk::PFN_vkDestroySwapchainKHR)
        }
        b"vkQueuePresentKHR" if next.is_some() => {
            hook!(queue_present, vk::PFN_vkQueuePresentKHR)
        }
        _ => next,
    }
}

unsafe extern "system" fn get_instance_proc_addr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();
    match name {
        b"vkGetInstanceProcAddr" => {
            return hook!(get_instance_proc_addr, vk::PFN_vkGetInstanceProcAddr)
        }
        b"vkCreateInstance" => return hook!(create_instance, vk::PFN_vkCreateInstance),
        b"vkDestroyInstance" => return hook!(destroy_instance, vk::PFN_vkDestroyInstance),
        b"vkGetDeviceProcAddr" => {
            return hook!(get_device_proc_addr, vk::PFN_vkGetDeviceProcAddr)
        }
        b"vkCreateDevice" => return hook!(create_device, vk::PFN_vkCreateDevice),
        b"vkDestroyDevice" => return hook!(destroy_device, vk::PFN_vkDestroyDevice),
        _ => (),
    }

    let Some(inst) = key_of(instance).and_then(|k| INSTANCES.get(k)) else {
        return None;
    };
    let next = (inst.gipa)(instance, p_name);
    match name {
        b"vkCreateXcbSurfaceKHR" if inst.create_xcb_surface.is_some() => {
            hook!(create_xcb_surface, vk::PFN_vkCreateXcbSurfaceKHR)
        }
        b"vkCreateXlibSurfaceKHR" if inst.create_xlib_surface.is_some() => {
            hook!(create_xlib_surface, vk::PFN_vkCreateXlibSurfaceKHR)
        }
        b"vkCreateWaylandSurfaceKHR" if inst.create_wayland_surface.is_some() => {
            hook!(create_wayland_surface, vk::PFN_vkCreateWaylandSurfaceKHR)
        }
        b"vkDestroySurfaceKHR" if inst.destroy_surface.is_some() => {
            hook!(destroy_surface, vk::PFN_vkDestroySurfaceKHR)
        }
        b"vkCreateSwapchainKHR" if next.is_some() => {
            hook!(create_swapchain, vk::PFN_vkCreateSwapchainKHR)
        }
        b"vkDestroySwapchainKHR" if next.is_some() => {
            hook!(destroy_swapchain, vk::PFN_vkDestroySwapchainKHR)
        }
        b"vkQueuePresentKHR" if next.is_some() => {
            hook!(queue_present, vk::PFN_vkQueuePresentKHR)
        }
        _ => next,
    }
}

/** Implementation of `vkNegotiateLoaderLayerInterfaceVersion`.
 *
 * Safety: `nli` must be null or point to a structure owned by the loader. */
pub unsafe fn negotiate(nli: *mut NegotiateLayerInterface) -> vk::Result {
    static LOG_INIT: Once = Once::new();
    LOG_INIT.call_once(|| {
        capture::init_logging();
        info!(
            "Init Vulkan {} ({})",
            env!("CARGO_PKG_VERSION"),
            if cfg!(target_pointer_width = "64") {
                "64bit"
            } else {
                "32bit"
            }
        );
    });

    let Some(nli) = nli.as_mut() else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if nli.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT || nli.loader_layer_interface_version < 2 {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    nli.loader_layer_interface_version = CURRENT_LOADER_LAYER_INTERFACE_VERSION;
    nli.pfn_get_instance_proc_addr = Some(get_instance_proc_addr);
    nli.pfn_get_device_proc_addr = Some(get_device_proc_addr);
    nli.pfn_get_physical_device_proc_addr = None;
    vk::Result::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_injection() {
        let enabled: Vec<&CStr> = vec![vk::KHR_SWAPCHAIN_NAME, vk::KHR_EXTERNAL_MEMORY_NAME];
        let have = [
            vk::KHR_EXTERNAL_MEMORY_FD_NAME,
            vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME,
            vk::KHR_EXTERNAL_MEMORY_NAME,
        ];
        let added = missing_extensions(&enabled, DEVICE_EXTENSIONS, |x| have.contains(&x));
        assert_eq!(
            added,
            vec![vk::KHR_EXTERNAL_MEMORY_FD_NAME, vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME]
        );

        let all: Vec<&CStr> = enabled.iter().chain(added.iter()).copied().collect();
        /* bind_memory2 and friends are still missing */
        assert!(!all_enabled(&all, DEVICE_EXTENSIONS_REQUIRED));
        let all: Vec<&CStr> = all
            .into_iter()
            .chain(DEVICE_EXTENSIONS_REQUIRED.iter().copied())
            .collect();
        assert!(all_enabled(&all, DEVICE_EXTENSIONS_REQUIRED));

        let none = missing_extensions(INSTANCE_EXTENSIONS, INSTANCE_EXTENSIONS, |_| true);
        assert!(none.is_empty());
    }

    #[test]
    fn extension_names_from_pointers() {
        let names = [vk::KHR_SWAPCHAIN_NAME.as_ptr(), std::ptr::null(), c"VK_x".as_ptr()];
        let list = unsafe { ext_names(names.len() as u32, names.as_ptr()) };
        assert_eq!(list, vec![vk::KHR_SWAPCHAIN_NAME, c"VK_x"]);
        assert!(unsafe { ext_names(3, std::ptr::null()) }.is_empty());
    }

    #[test]
    fn loader_chain_search() {
        let mut dev_link = LayerDeviceCreateInfo {
            s_type: vk::StructureType::LOADER_DEVICE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LOADER_DATA_CALLBACK,
            u: LayerDeviceUnion {
                set_device_loader_data: None,
            },
        };
        let mut other = vk::PhysicalDeviceFeatures2::default();
        other.p_next = &mut dev_link as *mut LayerDeviceCreateInfo as *mut c_void;
        let head = &other as *const vk::PhysicalDeviceFeatures2 as *const c_void;
        unsafe {
            let found = find_loader_info(
                head,
                vk::StructureType::LOADER_DEVICE_CREATE_INFO,
                LOADER_DATA_CALLBACK,
            );
            assert_eq!(found, &mut dev_link as *mut LayerDeviceCreateInfo as *mut c_void);
            let missing = find_loader_info(
                head,
                vk::StructureType::LOADER_DEVICE_CREATE_INFO,
                LAYER_LINK_INFO,
            );
            assert!(missing.is_null());
        }
    }

    #[test]
    fn negotiation() {
        let mut nli = NegotiateLayerInterface {
            s_type: LAYER_NEGOTIATE_INTERFACE_STRUCT,
            p_next: std::ptr::null_mut(),
            loader_layer_interface_version: 5,
            pfn_get_instance_proc_addr: None,
            pfn_get_device_proc_addr: None,
            pfn_get_physical_device_proc_addr: None,
        };
        assert_eq!(unsafe { negotiate(&mut nli) }, vk::Result::SUCCESS);
        assert_eq!(nli.loader_layer_interface_version, 2);
        assert!(nli.pfn_get_instance_proc_addr.is_some());
        assert!(nli.pfn_get_device_proc_addr.is_some());

        nli.loader_layer_interface_version = 1;
        assert_eq!(
            unsafe { negotiate(&mut nli) },
            vk::Result::ERROR_INITIALIZATION_FAILED
        );
        assert_eq!(
            unsafe { negotiate(std::ptr::null_mut()) },
            vk::Result::ERROR_INITIALIZATION_FAILED
        );
    }

    #[test]
    fn global_hooks_without_instance() {
        unsafe {
            let f = get_instance_proc_addr(vk::Instance::null(), c"vkCreateInstance".as_ptr());
            assert!(f.is_some());
            let f = get_instance_proc_addr(vk::Instance::null(), c"vkCreateXcbSurfaceKHR".as_ptr());
            assert!(f.is_none());
        }
    }
}

/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Vulkan consumer backend: imports client DMA-BUFs as images */
use crate::formats::drm_to_vulkan;
use crate::protocol::TextureData;
use crate::server::{DmabufImport, TextureBackend};
use crate::tag;
use ash::{khr, vk, Entry, Instance};
use log::{debug, info};
use std::ffi::{c_char, c_void, CStr};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;

struct ImportDevice {
    _entry: Entry,
    instance: Instance,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    ext_mem_fd: khr::external_memory_fd::Device,
    get_mem_reqs2: khr::get_memory_requirements2::Device,
    bind_mem2: khr::bind_memory2::Device,
    has_modifiers: bool,
}

impl Drop for ImportDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl ImportDevice {
    fn memory_type(&self, bits: u32, flags: vk::MemoryPropertyFlags) -> Result<u32, String> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(i, t)| t.property_flags.contains(flags) && bits & (1u32 << i) != 0)
            .map(|(i, _)| i as u32)
            .ok_or_else(|| tag!("No memory type in {:#x} with {:?}", bits, flags))
    }
}

enum Storage {
    Dmabuf {
        image: vk::Image,
        memory: vk::DeviceMemory,
    },
    Host {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        data: *mut u8,
        size: usize,
    },
}

/** A client texture on the consumer GPU */
pub struct VulkanTexture {
    dev: Arc<ImportDevice>,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    storage: Storage,
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            match self.storage {
                Storage::Dmabuf { image, memory } => {
                    self.dev.device.destroy_image(image, None);
                    self.dev.device.free_memory(memory, None);
                }
                Storage::Host { buffer, memory, .. } => {
                    self.dev.device.destroy_buffer(buffer, None);
                    /* implicitly unmaps */
                    self.dev.device.free_memory(memory, None);
                }
            }
        }
    }
}

impl VulkanTexture {
    /** The image, for textures imported from a DMA-BUF */
    pub fn image(&self) -> Option<vk::Image> {
        match self.storage {
            Storage::Dmabuf { image, .. } => Some(image),
            Storage::Host { .. } => None,
        }
    }

    /** The staging buffer, for host textures */
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.storage {
            Storage::Host { buffer, .. } => Some(buffer),
            Storage::Dmabuf { .. } => None,
        }
    }

    /** Current contents of a host texture */
    pub fn host_data(&self) -> Option<&[u8]> {
        match self.storage {
            // SAFETY: data[..size] is mapped while the memory lives
            Storage::Host { data, size, .. } => {
                Some(unsafe { std::slice::from_raw_parts(data, size) })
            }
            Storage::Dmabuf { .. } => None,
        }
    }
}

pub struct VulkanImporter {
    dev: Arc<ImportDevice>,
    uuid: [u8; 16],
    name: String,
}

fn exts_has(exts: &[vk::ExtensionProperties], name: &CStr) -> bool {
    exts.iter()
        .any(|x| x.extension_name_as_c_str().is_ok_and(|n| n == name))
}

/* Lower values are assumed better */
fn device_rank(typ: vk::PhysicalDeviceType) -> u8 {
    match typ {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 3,
    }
}

const REQUIRED_EXTENSIONS: &[&CStr] = &[
    vk::KHR_EXTERNAL_MEMORY_NAME,
    vk::KHR_EXTERNAL_MEMORY_FD_NAME,
    vk::EXT_EXTERNAL_MEMORY_DMA_BUF_NAME,
    vk::KHR_BIND_MEMORY2_NAME,
    vk::KHR_GET_MEMORY_REQUIREMENTS2_NAME,
    vk::KHR_DEDICATED_ALLOCATION_NAME,
];
const MODIFIER_EXTENSIONS: &[&CStr] = &[
    vk::EXT_IMAGE_DRM_FORMAT_MODIFIER_NAME,
    vk::KHR_IMAGE_FORMAT_LIST_NAME,
    vk::KHR_SAMPLER_YCBCR_CONVERSION_NAME,
    vk::KHR_MAINTENANCE1_NAME,
];

impl VulkanImporter {
    pub fn new() -> Result<VulkanImporter, String> {
        let info = vk::ApplicationInfo::default()
            .application_name(c"vkcapture-server")
            .engine_name(c"obs-vkcapture")
            .api_version(vk::make_api_version(0, 1, 0, 0));
        let exts = [
            vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_NAME.as_ptr(),
            vk::KHR_EXTERNAL_MEMORY_CAPABILITIES_NAME.as_ptr(),
        ];
        let create = vk::InstanceCreateInfo::default()
            .application_info(&info)
            .enabled_extension_names(&exts);

        unsafe {
            let entry =
                Entry::load().map_err(|x| tag!("Failed to load Vulkan library: {:?}", x))?;
            let instance = entry
                .create_instance(&create, None)
                .map_err(|x| tag!("Failed to create Vulkan instance: {:?}", x))?;
            match Self::with_instance(&entry, &instance) {
                Ok((physdev, device, has_modifiers, uuid, name)) => {
                    let dev = ImportDevice {
                        memory_properties: instance.get_physical_device_memory_properties(physdev),
                        ext_mem_fd: khr::external_memory_fd::Device::new(&instance, &device),
                        get_mem_reqs2: khr::get_memory_requirements2::Device::new(
                            &instance, &device,
                        ),
                        bind_mem2: khr::bind_memory2::Device::new(&instance, &device),
                        _entry: entry,
                        instance,
                        device,
                        has_modifiers,
                    };
                    info!("Importing on {} (modifiers: {})", name, has_modifiers);
                    Ok(VulkanImporter {
                        dev: Arc::new(dev),
                        uuid,
                        name,
                    })
                }
                Err(e) => {
                    instance.destroy_instance(None);
                    Err(e)
                }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    unsafe fn with_instance(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(vk::PhysicalDevice, ash::Device, bool, [u8; 16], String), String> {
        let props2 = khr::get_physical_device_properties2::Instance::new(entry, instance);
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|x| tag!("Failed to get physical devices: {:?}", x))?;

        let mut best: Option<(u8, vk::PhysicalDevice, bool, [u8; 16], String)> = None;
        for p in devices {
            let exts = instance
                .enumerate_device_extension_properties(p)
                .map_err(|x| tag!("Failed to enumerate device extensions: {:?}", x))?;
            let mut id = vk::PhysicalDeviceIDProperties::default();
            let mut prop = vk::PhysicalDeviceProperties2::default().push_next(&mut id);
            props2.get_physical_device_properties2(p, &mut prop);
            let name = prop
                .properties
                .device_name_as_c_str()
                .map(|x| x.to_string_lossy().into_owned())
                .unwrap_or_default();
            let typ = prop.properties.device_type;
            debug!("Physical device: {} ({:?})", name, typ);

            if !REQUIRED_EXTENSIONS.iter().all(|x| exts_has(&exts, x)) {
                debug!("{} lacks DMA-BUF import support", name);
                continue;
            }
            let has_modifiers = MODIFIER_EXTENSIONS.iter().all(|x| exts_has(&exts, x));
            let rank = device_rank(typ);
            if best.as_ref().map(|b| rank < b.0).unwrap_or(true) {
                best = Some((rank, p, has_modifiers, id.device_uuid, name));
            }
        }
        let Some((_, physdev, has_modifiers, uuid, name)) = best else {
            return Err(tag!("No Vulkan device can import DMA-BUFs"));
        };

        let mut names: Vec<*const c_char> =
            REQUIRED_EXTENSIONS.iter().map(|x| x.as_ptr()).collect();
        if has_modifiers {
            names.extend(MODIFIER_EXTENSIONS.iter().map(|x| x.as_ptr()));
        }
        let prio = [1.0];
        let queues = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&prio)];
        let info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queues)
            .enabled_extension_names(&names);
        let device = instance
            .create_device(physdev, &info, None)
            .map_err(|x| tag!("Failed to create Vulkan device: {:?}", x))?;
        Ok((physdev, device, has_modifiers, uuid, name))
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }

    fn import_image(&self, req: &DmabufImport<'_>) -> Result<VulkanTexture, String> {
        let dev = &self.dev;
        let format = drm_to_vulkan(req.fourcc)
            .ok_or_else(|| tag!("Unsupported fourcc {:#x}", req.fourcc))?;
        let first = req.planes.first().ok_or_else(|| tag!("No planes"))?;

        let layouts: Vec<vk::SubresourceLayout> = req
            .planes
            .iter()
            .map(|p| vk::SubresourceLayout {
                offset: p.offset as u64,
                row_pitch: p.stride as u64,
                /* must be zero per VK_EXT_image_drm_format_modifier */
                size: 0,
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect();
        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .plane_layouts(&layouts)
            .drm_format_modifier(req.modifier.unwrap_or(0));
        let mut ext_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let tiling = match req.modifier {
            Some(_) if !dev.has_modifiers => {
                return Err(tag!("Device cannot import images with modifiers"));
            }
            Some(_) => vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            None if req.planes.len() > 1 => {
                return Err(tag!("Linear import needs one plane, got {}", req.planes.len()));
            }
            None => vk::ImageTiling::LINEAR,
        };
        let mut image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: req.width,
                height: req.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut ext_info);
        if req.modifier.is_some() {
            image_info = image_info.push_next(&mut modifier_info);
        }

        unsafe {
            let image = dev
                .device
                .create_image(&image_info, None)
                .map_err(|x| tag!("Failed to create image for import: {:?}", x))?;

            if tiling == vk::ImageTiling::LINEAR {
                let sub = vk::ImageSubresource::default().aspect_mask(vk::ImageAspectFlags::COLOR);
                let layout = dev.device.get_image_subresource_layout(image, sub);
                if layout.row_pitch != first.stride as u64 || first.offset != 0 {
                    dev.device.destroy_image(image, None);
                    return Err(tag!(
                        "Linear layout mismatch: stride {} offset {}, device wants {}",
                        first.stride,
                        first.offset,
                        layout.row_pitch
                    ));
                }
            }

            let mut fd_props = vk::MemoryFdPropertiesKHR::default();
            if let Err(x) = dev.ext_mem_fd.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                first.fd.as_raw_fd(),
                &mut fd_props,
            ) {
                dev.device.destroy_image(image, None);
                return Err(tag!("Failed to get memory fd properties: {:?}", x));
            }

            let req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
            let mut req_out = vk::MemoryRequirements2::default();
            dev.get_mem_reqs2
                .get_image_memory_requirements2(&req_info, &mut req_out);
            let candidates = fd_props.memory_type_bits & req_out.memory_requirements.memory_type_bits;
            if candidates == 0 {
                dev.device.destroy_image(image, None);
                return Err(tag!("No memory type can hold the imported buffer"));
            }

            /* a successful import takes ownership of the fd */
            let fd = match first.fd.try_clone_to_owned() {
                Ok(fd) => fd,
                Err(x) => {
                    dev.device.destroy_image(image, None);
                    return Err(tag!("Failed to duplicate fd: {}", x));
                }
            };
            let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                .fd(fd.as_raw_fd())
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
            let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(req_out.memory_requirements.size)
                .memory_type_index(candidates.trailing_zeros())
                .push_next(&mut import_info)
                .push_next(&mut dedicated);
            let memory = match dev.device.allocate_memory(&alloc_info, None) {
                Ok(m) => {
                    let _ = fd.into_raw_fd();
                    m
                }
                Err(x) => {
                    dev.device.destroy_image(image, None);
                    return Err(tag!("Failed to import memory: {:?}", x));
                }
            };

            let bind = [vk::BindImageMemoryInfo::default()
                .image(image)
                .memory(memory)
                .memory_offset(0)];
            if let Err(x) = (dev.bind_mem2.fp().bind_image_memory2_khr)(
                dev.bind_mem2.device(),
                bind.len() as u32,
                bind.as_ptr(),
            )
            .result() {
                dev.device.free_memory(memory, None);
                dev.device.destroy_image(image, None);
                return Err(tag!("Failed to bind memory: {:?}", x));
            }

            Ok(VulkanTexture {
                dev: dev.clone(),
                width: req.width,
                height: req.height,
                format,
                storage: Storage::Dmabuf { image, memory },
            })
        }
    }
}

impl TextureBackend for VulkanImporter {
    type Texture = VulkanTexture;

    fn device_uuid(&self) -> [u8; 16] {
        self.uuid
    }

    fn import_dmabuf(&mut self, import: &DmabufImport<'_>) -> Result<VulkanTexture, String> {
        self.import_image(import)
    }

    fn create_host_texture(&mut self, data: &TextureData) -> Result<VulkanTexture, String> {
        let dev = &self.dev;
        let format = drm_to_vulkan(data.format)
            .ok_or_else(|| tag!("Unsupported fourcc {:#x}", data.format))?;
        if data.width <= 0 || data.height <= 0 || data.strides[0] <= 0 {
            return Err(tag!(
                "Bad host texture layout {}x{} stride {}",
                data.width,
                data.height,
                data.strides[0]
            ));
        }
        let size = data.strides[0] as u64 * data.height as u64;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe {
            let buffer = dev
                .device
                .create_buffer(&info, None)
                .map_err(|x| tag!("Failed to create buffer: {:?}", x))?;
            let reqs = dev.device.get_buffer_memory_requirements(buffer);
            let index = match dev.memory_type(
                reqs.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ) {
                Ok(i) => i,
                Err(e) => {
                    dev.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            let alloc = vk::MemoryAllocateInfo::default()
                .allocation_size(reqs.size)
                .memory_type_index(index);
            let memory = match dev.device.allocate_memory(&alloc, None) {
                Ok(m) => m,
                Err(x) => {
                    dev.device.destroy_buffer(buffer, None);
                    return Err(tag!("Failed to allocate host memory: {:?}", x));
                }
            };
            let mapped = dev
                .device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| {
                    dev.device
                        .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                });
            let data_ptr: *mut c_void = match mapped {
                Ok(p) => p,
                Err(x) => {
                    dev.device.destroy_buffer(buffer, None);
                    dev.device.free_memory(memory, None);
                    return Err(tag!("Failed to map host memory: {:?}", x));
                }
            };
            Ok(VulkanTexture {
                dev: dev.clone(),
                width: data.width as u32,
                height: data.height as u32,
                format,
                storage: Storage::Host {
                    buffer,
                    memory,
                    data: data_ptr as *mut u8,
                    size: size as usize,
                },
            })
        }
    }

    fn upload_host(
        &mut self,
        texture: &mut VulkanTexture,
        _data: &TextureData,
        bytes: &[u8],
    ) -> Result<(), String> {
        let Storage::Host { data, size, .. } = texture.storage else {
            return Err(tag!("Not a host texture"));
        };
        let n = size.min(bytes.len());
        // SAFETY: data[..size] is mapped and only written here
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, n);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{DRM_FORMAT_ARGB8888, DRM_FORMAT_MOD_INVALID};
    use crate::protocol::MAX_PLANES;
    use crate::server::DmabufPlane;
    use crate::test::*;
    use nix::sys::memfd;
    use std::os::fd::AsFd;

    #[test]
    fn rank_prefers_discrete() {
        assert!(
            device_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                < device_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
                < device_rank(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn importer_host_and_bad_fd() {
        setup_test_logger();
        if !has_render_node() {
            return;
        }
        let _guard = VULKAN_LOCK.lock().unwrap();
        let mut imp = match VulkanImporter::new() {
            Ok(x) => x,
            Err(e) => {
                println!("Skipping, no usable Vulkan device: {}", e);
                return;
            }
        };

        let mut strides = [0; MAX_PLANES];
        strides[0] = 64 * 4;
        let t = TextureData {
            nfd: 1,
            width: 64,
            height: 16,
            format: DRM_FORMAT_ARGB8888,
            strides,
            modifier: DRM_FORMAT_MOD_INVALID,
            ..TextureData::default()
        };
        let mut tex = imp.create_host_texture(&t).unwrap();
        assert!(tex.buffer().is_some() && tex.image().is_none());
        let bytes: Vec<u8> = (0..(64 * 4 * 16)).map(|x| (x % 199) as u8).collect();
        imp.upload_host(&mut tex, &t, &bytes).unwrap();
        assert_eq!(tex.host_data().unwrap(), &bytes[..]);

        /* a memfd is no DMA-BUF */
        let fd = memfd::memfd_create(c"/not-dmabuf", memfd::MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        nix::unistd::ftruncate(&fd, 64 * 4 * 16).unwrap();
        let req = DmabufImport {
            width: 64,
            height: 16,
            fourcc: DRM_FORMAT_ARGB8888,
            modifier: None,
            planes: vec![DmabufPlane {
                fd: fd.as_fd(),
                stride: 64 * 4,
                offset: 0,
            }],
        };
        assert!(imp.import_dmabuf(&req).is_err());
        assert!(imp.import_dmabuf(&DmabufImport { planes: Vec::new(), ..req }).is_err());
    }
}

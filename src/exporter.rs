/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Creation of Vulkan images whose memory is exported as DMA-BUFs */
use crate::formats::*;
use crate::protocol::{AllocHints, TextureData, MAX_PLANES};
use crate::tag;
use ash::{ext, khr, vk};
use log::{debug, info};
use std::ffi::{c_void, CStr};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

/** Device state and entry points needed to export images */
pub struct ExportDevice {
    instance: ash::Instance,
    physdev: vk::PhysicalDevice,
    device: ash::Device,
    pub driver_id: vk::DriverId,
    pub device_uuid: [u8; 16],
    pub device_name: String,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    props2: khr::get_physical_device_properties2::InstanceFn,
    mem_reqs2: khr::get_memory_requirements2::DeviceFn,
    bind_mem2: khr::bind_memory2::DeviceFn,
    mem_fd: khr::external_memory_fd::DeviceFn,
    modifier: Option<ext::image_drm_format_modifier::DeviceFn>,
}

/** What to allocate */
#[derive(Debug, Clone, Copy)]
pub struct ExportRequest {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    /** DRM fourcc announced for the image */
    pub fourcc: u32,
    pub hints: AllocHints,
    /** UUID of the GPU that will import the image */
    pub consumer_uuid: [u8; 16],
    /** Also export an opaque fd for the memory (used for GL memory objects) */
    pub opaque_fd: bool,
}

pub struct ExportPlane {
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
}

/** An exported image; the image and memory are released on drop */
pub struct ExportedImage {
    dev: Arc<ExportDevice>,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub allocation_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub fourcc: u32,
    pub tiling: vk::ImageTiling,
    /** DRM_FORMAT_MOD_INVALID unless a modifier was chosen */
    pub modifier: u64,
    pub planes: Vec<ExportPlane>,
    pub opaque_fd: Option<OwnedFd>,
}

impl Drop for ExportedImage {
    fn drop(&mut self) {
        unsafe {
            self.dev.device.destroy_image(self.image, None);
            if self.memory != vk::DeviceMemory::null() {
                self.dev.device.free_memory(self.memory, None);
            }
        }
    }
}

impl ExportedImage {
    pub fn plane_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.planes.iter().map(|p| p.fd.as_fd()).collect()
    }

    /** Describe the image as a TEXTURE record */
    pub fn texture_data(&self, winid: u32, flip: bool, color_space: u32) -> TextureData {
        let mut strides = [0; MAX_PLANES];
        let mut offsets = [0; MAX_PLANES];
        for (i, p) in self.planes.iter().enumerate() {
            strides[i] = p.stride as i32;
            offsets[i] = p.offset as i32;
        }
        TextureData {
            nfd: self.planes.len() as u8,
            width: self.width as i32,
            height: self.height as i32,
            format: self.fourcc,
            strides,
            offsets,
            modifier: self.modifier,
            winid,
            flip,
            color_space,
        }
    }
}

fn memory_plane(x: usize) -> vk::ImageAspectFlags {
    match x {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        2 => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
        _ => vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
    }
}

/** Restrict the driver's modifier list to those usable for export.
 *
 * `admits` checks whether an image of the requested size can be created
 * with the modifier. */
pub fn filter_modifiers(
    props: &[vk::DrmFormatModifierPropertiesEXT],
    hints: AllocHints,
    driver_id: vk::DriverId,
    mut admits: impl FnMut(u64) -> bool,
) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
    if hints.no_modifiers {
        return Vec::new();
    }
    let reject_dcc = driver_rejects_dcc(driver_id);
    props
        .iter()
        .filter(|m| !hints.linear || m.drm_format_modifier == DRM_FORMAT_MOD_LINEAR)
        .filter(|m| !(reject_dcc && is_amd_dcc_modifier(m.drm_format_modifier)))
        .filter(|m| m.drm_format_modifier_plane_count as usize <= MAX_PLANES)
        .filter(|m| admits(m.drm_format_modifier))
        .copied()
        .collect()
}

/** Memory type indices to try, in order.
 *
 * The first group has all of the preferred property flags; unless
 * `map_host` is set, it is followed by the types lacking them. */
pub fn memory_type_candidates(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    same_device: bool,
    map_host: bool,
) -> Vec<u32> {
    let flags = if map_host {
        vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED
    } else if same_device {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    } else {
        vk::MemoryPropertyFlags::HOST_VISIBLE
    };
    let count = (props.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    let allowed = |i: &usize| type_bits & (1u32 << *i) != 0;
    let mut out: Vec<u32> = (0..count)
        .filter(allowed)
        .filter(|i| props.memory_types[*i].property_flags.contains(flags))
        .map(|i| i as u32)
        .collect();
    if !map_host {
        out.extend(
            (0..count)
                .filter(allowed)
                .filter(|i| !props.memory_types[*i].property_flags.contains(flags))
                .map(|i| i as u32),
        );
    }
    out
}

impl ExportDevice {
    /** Collect what is needed to export images from `device`.
     *
     * `load_instance` and `load_device` resolve instance- and device-level
     * entry points. The `_KHR` names are used throughout, since the
     * instance may be Vulkan 1.0 with VK_KHR_get_physical_device_properties2.
     * `has_modifiers` and `has_driver_props` say whether
     * VK_EXT_image_drm_format_modifier and VK_KHR_driver_properties are
     * enabled on the device. */
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        instance: ash::Instance,
        mut load_instance: impl FnMut(&CStr) -> *const c_void,
        physdev: vk::PhysicalDevice,
        device: ash::Device,
        mut load: impl FnMut(&CStr) -> *const c_void,
        has_modifiers: bool,
        has_driver_props: bool,
    ) -> ExportDevice {
        let props2 = khr::get_physical_device_properties2::InstanceFn::load(&mut load_instance);

        let mut id_props = vk::PhysicalDeviceIDProperties::default();
        let mut driver_props = vk::PhysicalDeviceDriverProperties::default();
        let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut id_props);
        if has_driver_props {
            props = props.push_next(&mut driver_props);
        }
        (props2.get_physical_device_properties2_khr)(physdev, &mut props);
        let device_name = props
            .properties
            .device_name_as_c_str()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();

        let memory_properties = instance.get_physical_device_memory_properties(physdev);

        let mem_reqs2 = khr::get_memory_requirements2::DeviceFn::load(&mut load);
        let bind_mem2 = khr::bind_memory2::DeviceFn::load(&mut load);
        let mem_fd = khr::external_memory_fd::DeviceFn::load(&mut load);
        let modifier = if has_modifiers {
            Some(ext::image_drm_format_modifier::DeviceFn::load(&mut load))
        } else {
            None
        };

        debug!(
            "Export device '{}': driver {:?}, modifiers {}",
            device_name,
            driver_props.driver_id,
            crate::util::fmt_bool(has_modifiers)
        );

        ExportDevice {
            instance,
            physdev,
            device,
            driver_id: driver_props.driver_id,
            device_uuid: id_props.device_uuid,
            device_name,
            memory_properties,
            props2,
            mem_reqs2,
            bind_mem2,
            mem_fd,
            modifier,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
    pub fn physdev(&self) -> vk::PhysicalDevice {
        self.physdev
    }
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /** List the modifiers the driver supports for `format` */
    fn query_modifiers(&self, format: vk::Format) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
        unsafe {
            let mut list = vk::DrmFormatModifierPropertiesListEXT::default();
            let mut props = vk::FormatProperties2::default().push_next(&mut list);
            (self.props2.get_physical_device_format_properties2_khr)(
                self.physdev,
                format,
                &mut props,
            );
            let count = list.drm_format_modifier_count as usize;
            if count == 0 {
                return Vec::new();
            }

            let mut dst = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
            let mut list = vk::DrmFormatModifierPropertiesListEXT::default()
                .drm_format_modifier_properties(&mut dst);
            let mut props = vk::FormatProperties2::default().push_next(&mut list);
            (self.props2.get_physical_device_format_properties2_khr)(
                self.physdev,
                format,
                &mut props,
            );
            let n = (list.drm_format_modifier_count as usize).min(count);
            dst.truncate(n);
            dst
        }
    }

    /** Can an image of this size, format and modifier be created for export? */
    fn modifier_admits(
        &self,
        format: vk::Format,
        modifier: u64,
        handle_types: vk::ExternalMemoryHandleTypeFlags,
        width: u32,
        height: u32,
    ) -> bool {
        let mut ext_info =
            vk::PhysicalDeviceExternalImageFormatInfo::default().handle_type(handle_types);
        let mut mod_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::default()
            .drm_format_modifier(modifier)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let format_info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::TRANSFER_DST)
            .flags(vk::ImageCreateFlags::empty())
            .push_next(&mut ext_info)
            .push_next(&mut mod_info);
        let mut props = vk::ImageFormatProperties2::default();
        let r = unsafe {
            (self.props2.get_physical_device_image_format_properties2_khr)(
                self.physdev,
                &format_info,
                &mut props,
            )
        };
        match r {
            vk::Result::SUCCESS => {
                let max = props.image_format_properties.max_extent;
                width <= max.width && height <= max.height
            }
            _ => false,
        }
    }
}

/** Create an exportable image, allocate and bind its memory, and export it */
pub fn export_image(dev: &Arc<ExportDevice>, req: &ExportRequest) -> Result<ExportedImage, String> {
    let same_device = req.consumer_uuid == dev.device_uuid;
    let hints = req.hints;
    let handle_types = if req.opaque_fd {
        vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT
            | vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
    } else {
        vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT
    };

    info!(
        "Texture {:?} {}x{}{}",
        req.format,
        req.width,
        req.height,
        if same_device {
            ""
        } else {
            ", consumer is on a different GPU"
        }
    );

    let mod_props = if dev.modifier.is_some() && !hints.no_modifiers {
        let all = dev.query_modifiers(req.format);
        let usable = filter_modifiers(&all, hints, dev.driver_id, |m| {
            dev.modifier_admits(req.format, m, handle_types, req.width, req.height)
        });
        for m in usable.iter() {
            debug!(
                "Usable modifier {:#x} with {} planes",
                m.drm_format_modifier, m.drm_format_modifier_plane_count
            );
        }
        if usable.is_empty() {
            info!("No suitable DRM modifier found, using linear tiling");
        }
        usable
    } else {
        Vec::new()
    };
    let modifiers: Vec<u64> = mod_props.iter().map(|m| m.drm_format_modifier).collect();
    let tiling = if modifiers.is_empty() {
        vk::ImageTiling::LINEAR
    } else {
        vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT
    };

    let mut modifier_info =
        vk::ImageDrmFormatModifierListCreateInfoEXT::default().drm_format_modifiers(&modifiers);
    let mut ext_create_info =
        vk::ExternalMemoryImageCreateInfo::default().handle_types(handle_types);
    let mut image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(req.format)
        .extent(vk::Extent3D {
            width: req.width,
            height: req.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(tiling)
        .usage(vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .push_next(&mut ext_create_info);
    if !modifiers.is_empty() {
        image_info = image_info.push_next(&mut modifier_info);
    }

    let device = &dev.device;
    unsafe {
        let image = device
            .create_image(&image_info, None)
            .map_err(|x| tag!("Failed to create export image: {:?}", x))?;

        /* From here on, dropping `out` cleans up */
        let mut out = ExportedImage {
            dev: dev.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            allocation_size: 0,
            width: req.width,
            height: req.height,
            format: req.format,
            fourcc: req.fourcc,
            tiling,
            modifier: DRM_FORMAT_MOD_INVALID,
            planes: Vec::new(),
            opaque_fd: None,
        };

        let req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated_req = vk::MemoryDedicatedRequirements::default();
        let mut req_out = vk::MemoryRequirements2::default().push_next(&mut dedicated_req);
        (dev.mem_reqs2.get_image_memory_requirements2_khr)(
            device.handle(),
            &req_info,
            &mut req_out,
        );
        let mem_reqs = req_out.memory_requirements;

        let candidates = memory_type_candidates(
            &dev.memory_properties,
            mem_reqs.memory_type_bits,
            same_device,
            hints.map_host,
        );
        for mem_index in candidates {
            let mut export_info =
                vk::ExportMemoryAllocateInfo::default().handle_types(handle_types);
            let mut dedicate_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(mem_reqs.size)
                .memory_type_index(mem_index)
                .push_next(&mut dedicate_info)
                .push_next(&mut export_info);
            match device.allocate_memory(&alloc_info, None) {
                Ok(mem) => {
                    out.memory = mem;
                    out.allocation_size = mem_reqs.size;
                    break;
                }
                Err(x) => {
                    debug!("Failed to allocate memory of type {}: {:?}", mem_index, x);
                }
            }
        }
        if out.memory == vk::DeviceMemory::null() {
            return Err(tag!("Failed to allocate memory of any type"));
        }

        let bind_info = vk::BindImageMemoryInfo::default()
            .image(image)
            .memory(out.memory)
            .memory_offset(0);
        (dev.bind_mem2.bind_image_memory2_khr)(device.handle(), 1, &bind_info)
            .result()
            .map_err(|x| tag!("Failed to bind export memory: {:?}", x))?;

        let fd = get_memory_fd(
            dev,
            out.memory,
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
        )?;
        if req.opaque_fd {
            out.opaque_fd = Some(get_memory_fd(
                dev,
                out.memory,
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            )?);
        }

        let mut nplanes = 1;
        if let (Some(modfn), vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT) = (&dev.modifier, tiling) {
            let mut props = vk::ImageDrmFormatModifierPropertiesEXT::default();
            (modfn.get_image_drm_format_modifier_properties_ext)(
                device.handle(),
                image,
                &mut props,
            )
            .result()
            .map_err(|x| tag!("Failed to get image format modifier: {:?}", x))?;
            out.modifier = props.drm_format_modifier;
            nplanes = mod_props
                .iter()
                .find(|m| m.drm_format_modifier == props.drm_format_modifier)
                .map(|m| m.drm_format_modifier_plane_count as usize)
                .unwrap_or(1)
                .clamp(1, MAX_PLANES);
        }

        let mut plane_fd = Some(fd);
        for plane in 0..nplanes {
            let aspect = if tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT {
                memory_plane(plane)
            } else {
                vk::ImageAspectFlags::COLOR
            };
            let layout = device.get_image_subresource_layout(
                image,
                vk::ImageSubresource::default()
                    .mip_level(0)
                    .array_layer(0)
                    .aspect_mask(aspect),
            );
            /* each plane gets its own fd for the same memory */
            let fd = if plane + 1 == nplanes {
                plane_fd.take()
            } else {
                plane_fd.as_ref().map(|f| f.try_clone()).transpose().map_err(|x| {
                    tag!("Failed to duplicate dmabuf fd: {}", x)
                })?
            };
            let Some(fd) = fd else {
                return Err(tag!("Missing fd for plane {}", plane));
            };
            out.planes.push(ExportPlane {
                fd,
                stride: layout
                    .row_pitch
                    .try_into()
                    .map_err(|_| tag!("Row pitch {} too large", layout.row_pitch))?,
                offset: layout
                    .offset
                    .try_into()
                    .map_err(|_| tag!("Plane offset {} too large", layout.offset))?,
            });
        }

        debug!(
            "Exported {} planes, modifier {:#x}, stride {}",
            out.planes.len(),
            out.modifier,
            out.planes[0].stride
        );
        Ok(out)
    }
}

unsafe fn get_memory_fd(
    dev: &ExportDevice,
    memory: vk::DeviceMemory,
    handle_type: vk::ExternalMemoryHandleTypeFlags,
) -> Result<OwnedFd, String> {
    let info = vk::MemoryGetFdInfoKHR::default()
        .memory(memory)
        .handle_type(handle_type);
    let mut fd: i32 = -1;
    (dev.mem_fd.get_memory_fd_khr)(dev.device.handle(), &info, &mut fd)
        .result()
        .map_err(|x| tag!("Failed to get memory fd ({:?}): {:?}", handle_type, x))?;
    if fd < 0 {
        return Err(tag!("Driver returned invalid memory fd"));
    }
    // SAFETY: fd only captured here and vkGetMemoryFdKHR transfers ownership
    Ok(OwnedFd::from_raw_fd(fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modifier_props(modifier: u64, planes: u32) -> vk::DrmFormatModifierPropertiesEXT {
        vk::DrmFormatModifierPropertiesEXT {
            drm_format_modifier: modifier,
            drm_format_modifier_plane_count: planes,
            drm_format_modifier_tiling_features: vk::FormatFeatureFlags::TRANSFER_DST,
        }
    }

    #[test]
    fn modifier_filtering() {
        let amd_dcc = (0x02u64 << 56) | (1 << 13) | 0x5;
        let amd_plain = (0x02u64 << 56) | 0x5;
        let list = [
            modifier_props(DRM_FORMAT_MOD_LINEAR, 1),
            modifier_props(amd_dcc, 2),
            modifier_props(amd_plain, 1),
            modifier_props(0x0100_0000_0000_0002, 1),
        ];
        let mods = |v: Vec<vk::DrmFormatModifierPropertiesEXT>| -> Vec<u64> {
            v.iter().map(|m| m.drm_format_modifier).collect()
        };

        let all = filter_modifiers(&list, AllocHints::default(), vk::DriverId::MESA_RADV, |_| true);
        assert_eq!(mods(all).len(), 4);

        let amd = filter_modifiers(
            &list,
            AllocHints::default(),
            vk::DriverId::AMD_OPEN_SOURCE,
            |_| true,
        );
        assert_eq!(
            mods(amd),
            vec![DRM_FORMAT_MOD_LINEAR, amd_plain, 0x0100_0000_0000_0002]
        );

        let linear = AllocHints {
            linear: true,
            ..AllocHints::default()
        };
        let lin = filter_modifiers(&list, linear, vk::DriverId::MESA_RADV, |_| true);
        assert_eq!(mods(lin), vec![DRM_FORMAT_MOD_LINEAR]);

        let none = AllocHints {
            no_modifiers: true,
            ..AllocHints::default()
        };
        assert!(filter_modifiers(&list, none, vk::DriverId::MESA_RADV, |_| true).is_empty());

        let sized = filter_modifiers(&list, AllocHints::default(), vk::DriverId::MESA_RADV, |m| {
            m != amd_plain
        });
        assert_eq!(
            mods(sized),
            vec![DRM_FORMAT_MOD_LINEAR, amd_dcc, 0x0100_0000_0000_0002]
        );
    }

    #[test]
    fn memory_type_order() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 4,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;
        props.memory_types[3].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        assert_eq!(memory_type_candidates(&props, 0xf, true, false), vec![0, 3, 1, 2]);
        assert_eq!(memory_type_candidates(&props, 0xf, false, false), vec![1, 2, 3, 0]);
        assert_eq!(memory_type_candidates(&props, 0xf, true, true), vec![2]);
        assert_eq!(memory_type_candidates(&props, 0xb, false, true), Vec::<u32>::new());
        assert_eq!(memory_type_candidates(&props, 0x6, true, false), vec![1, 2]);
    }
}

/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Vulkan format and DRM fourcc/modifier tables */
use ash::vk;

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = (1 << 56) - 1;

const DRM_FORMAT_MOD_VENDOR_AMD: u64 = 0x02;
/* linux/drm_fourcc.h: AMD_FMT_MOD_DCC_SHIFT, AMD_FMT_MOD_DCC_MASK */
const AMD_FMT_MOD_DCC_SHIFT: u64 = 13;
const AMD_FMT_MOD_DCC_MASK: u64 = 0x1;

pub const fn fourcc(a: char, b: char, c: char, d: char) -> u32 {
    u32::from_le_bytes([(a as u8), (b as u8), (c as u8), (d as u8)])
}

pub const DRM_FORMAT_ARGB8888: u32 = fourcc('A', 'R', '2', '4');
pub const DRM_FORMAT_XRGB8888: u32 = fourcc('X', 'R', '2', '4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc('A', 'B', '2', '4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc('X', 'B', '2', '4');
pub const DRM_FORMAT_ARGB2101010: u32 = fourcc('A', 'R', '3', '0');
pub const DRM_FORMAT_XRGB2101010: u32 = fourcc('X', 'R', '3', '0');
pub const DRM_FORMAT_ABGR2101010: u32 = fourcc('A', 'B', '3', '0');
pub const DRM_FORMAT_XBGR2101010: u32 = fourcc('X', 'B', '3', '0');
pub const DRM_FORMAT_ABGR16161616: u32 = fourcc('A', 'B', '4', '8');
pub const DRM_FORMAT_XBGR16161616: u32 = fourcc('X', 'B', '4', '8');
pub const DRM_FORMAT_ABGR16161616F: u32 = fourcc('A', 'B', '4', 'H');
pub const DRM_FORMAT_XBGR16161616F: u32 = fourcc('X', 'B', '4', 'H');

/** Pairs of (Vulkan format, DRM format with alpha, DRM format without alpha) */
const FORMAT_TABLE: &[(vk::Format, u32, u32)] = &[
    (
        vk::Format::B8G8R8A8_UNORM,
        DRM_FORMAT_ARGB8888,
        DRM_FORMAT_XRGB8888,
    ),
    (
        vk::Format::B8G8R8A8_SRGB,
        DRM_FORMAT_ARGB8888,
        DRM_FORMAT_XRGB8888,
    ),
    (
        vk::Format::R8G8B8A8_UNORM,
        DRM_FORMAT_ABGR8888,
        DRM_FORMAT_XBGR8888,
    ),
    (
        vk::Format::R8G8B8A8_SRGB,
        DRM_FORMAT_ABGR8888,
        DRM_FORMAT_XBGR8888,
    ),
    (
        vk::Format::A2R10G10B10_UNORM_PACK32,
        DRM_FORMAT_ARGB2101010,
        DRM_FORMAT_XRGB2101010,
    ),
    (
        vk::Format::A2B10G10R10_UNORM_PACK32,
        DRM_FORMAT_ABGR2101010,
        DRM_FORMAT_XBGR2101010,
    ),
    (
        vk::Format::R16G16B16A16_UNORM,
        DRM_FORMAT_ABGR16161616,
        DRM_FORMAT_XBGR16161616,
    ),
    (
        vk::Format::R16G16B16A16_SFLOAT,
        DRM_FORMAT_ABGR16161616F,
        DRM_FORMAT_XBGR16161616F,
    ),
];

/** Printable form of a fourcc, e.g. "AR24" */
pub fn drm_format_name(drm_format: u32) -> String {
    drm_format
        .to_le_bytes()
        .iter()
        .map(|c| {
            if c.is_ascii_graphic() || *c == b' ' {
                *c as char
            } else {
                '?'
            }
        })
        .collect()
}

/** DRM fourcc (alpha variant) for a Vulkan format, if it has one */
pub fn vulkan_to_drm(f: vk::Format) -> Option<u32> {
    FORMAT_TABLE.iter().find(|x| x.0 == f).map(|x| x.1)
}

/** Return true iff the DRM format carries a meaningful alpha channel */
pub fn drm_has_alpha(drm_format: u32) -> bool {
    FORMAT_TABLE.iter().any(|x| x.1 == drm_format)
}

/** Vulkan format to use when importing a DRM format on the consumer side */
pub fn drm_to_vulkan(drm_format: u32) -> Option<vk::Format> {
    FORMAT_TABLE
        .iter()
        .find(|x| x.1 == drm_format || x.2 == drm_format)
        .map(|x| x.0)
}

/** The format an exported copy of a swapchain image uses.
 *
 * Returns (format, needs_blit): formats without a DRM equivalent are
 * converted to B8G8R8A8_UNORM with a blit. */
pub fn export_format(swap_format: vk::Format) -> (vk::Format, bool) {
    if vulkan_to_drm(swap_format).is_some() {
        (swap_format, false)
    } else {
        (vk::Format::B8G8R8A8_UNORM, true)
    }
}

/** Return true iff the modifier is an AMD modifier with DCC compression enabled */
pub fn is_amd_dcc_modifier(modifier: u64) -> bool {
    if modifier == DRM_FORMAT_MOD_INVALID || modifier == DRM_FORMAT_MOD_LINEAR {
        return false;
    }
    (modifier >> 56) == DRM_FORMAT_MOD_VENDOR_AMD
        && ((modifier >> AMD_FMT_MOD_DCC_SHIFT) & AMD_FMT_MOD_DCC_MASK) != 0
}

/** Return true iff the driver is one of the AMD drivers whose DCC modifiers
 * fail to import on the consumer side */
pub fn driver_rejects_dcc(driver_id: vk::DriverId) -> bool {
    driver_id == vk::DriverId::AMD_OPEN_SOURCE || driver_id == vk::DriverId::AMD_PROPRIETARY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_table() {
        assert_eq!(DRM_FORMAT_ARGB8888, 0x34325241);
        assert_eq!(
            vulkan_to_drm(vk::Format::B8G8R8A8_UNORM),
            Some(DRM_FORMAT_ARGB8888)
        );
        assert_eq!(
            vulkan_to_drm(vk::Format::R16G16B16A16_SFLOAT),
            Some(DRM_FORMAT_ABGR16161616F)
        );
        assert_eq!(vulkan_to_drm(vk::Format::R5G6B5_UNORM_PACK16), None);
        assert_eq!(
            export_format(vk::Format::R5G6B5_UNORM_PACK16),
            (vk::Format::B8G8R8A8_UNORM, true)
        );
        assert_eq!(
            export_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            (vk::Format::A2B10G10R10_UNORM_PACK32, false)
        );
        assert_eq!(
            drm_to_vulkan(DRM_FORMAT_XRGB2101010),
            Some(vk::Format::A2R10G10B10_UNORM_PACK32)
        );
        assert!(drm_has_alpha(DRM_FORMAT_ARGB8888));
        assert!(!drm_has_alpha(DRM_FORMAT_XRGB8888));
    }

    #[test]
    fn amd_dcc_detection() {
        let amd_base: u64 = DRM_FORMAT_MOD_VENDOR_AMD << 56;
        assert!(is_amd_dcc_modifier(amd_base | (1 << 13)));
        assert!(!is_amd_dcc_modifier(amd_base | (1 << 12)));
        /* bit 13 means something else for other vendors */
        assert!(!is_amd_dcc_modifier((0x01 << 56) | (1 << 13)));
        assert!(!is_amd_dcc_modifier(DRM_FORMAT_MOD_INVALID));
        assert!(!is_amd_dcc_modifier(DRM_FORMAT_MOD_LINEAR));
        assert!(driver_rejects_dcc(vk::DriverId::AMD_OPEN_SOURCE));
        assert!(!driver_rejects_dcc(vk::DriverId::MESA_RADV));
    }

    #[test]
    fn format_names() {
        assert_eq!(drm_format_name(DRM_FORMAT_ARGB8888), "AR24");
        assert_eq!(drm_format_name(DRM_FORMAT_ABGR16161616F), "AB4H");
        assert_eq!(drm_format_name(0), "????");
    }
}

/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Loader entry point of the implicit capture layer.
 *
 * The loader finds this library through `obs_vkcapture.json` and calls the
 * negotiation function; everything else is reached through the function
 * pointers it hands back. */
use ash::vk;
use vkcapture::layer::{self, NegotiateLayerInterface};

/** # Safety
 *
 * Called by the Vulkan loader with a structure it owns. */
#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    nli: *mut NegotiateLayerInterface,
) -> vk::Result {
    layer::negotiate(nli)
}

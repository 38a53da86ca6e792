/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Zero-copy game capture over DMA-BUF.
 *
 * The capture side runs inside the game, either as a Vulkan layer
 * (`layer`) or as a set of GL/EGL/GLX interposers (`glinject`). It exports
 * each swapchain image as a DMA-BUF, sends the descriptor to the capture
 * server over a Unix socket, and copies the presented frame into it.
 *
 * The server side (`server`) accepts those clients and imports their
 * buffers into consumer textures through a `TextureBackend`; `import`
 * provides a Vulkan one. */

#[macro_use]
pub mod util;

pub mod capture;
pub mod elfsym;
pub mod exporter;
pub mod formats;
pub mod glinject;
pub mod import;
pub mod layer;
pub mod logger;
pub mod objects;
pub mod protocol;
pub mod server;
pub mod swapchain;

#[cfg(test)]
mod test;

//! GPU resources.
//!
//! This module contains the memory-backed resource handles created through
//! [`DeviceContext`]:
//! - [`BufferHandle`] - buffer plus its allocation
//! - [`ImageHandle`] - image plus its allocation, optional view and sampler
//!
//! Handles start empty and are populated by exactly one `create_*` call.
//! They borrow the device context, are not reference-counted, and destroy
//! their objects on drop; keep them alive until every submission that
//! references them has completed.
//!
//! Device-local resources are filled through the staged upload in
//! [`transfer`]: copy into a host-visible staging buffer, record a one-shot
//! copy, and block on a fence.
//!
//! [`DeviceContext`]: crate::DeviceContext

mod buffer;
mod image;
pub mod transfer;

pub use buffer::BufferHandle;
pub use image::{aspect_for_format, format_texel_size, ImageHandle, ImageInfo};
pub use transfer::submit_one_shot;

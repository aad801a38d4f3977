//! Domain layer types.
//!
//! Identifiers, mode and tier enums, and the image records that the cache
//! indexes.

mod image;
mod types;

pub use image::ImageRecord;
pub use types::{ImageId, ModeKind, ParseModeError, PerformanceTier};

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod device;
mod hub;
mod image_processor;
mod loader;
mod prompt;
mod sampling;
mod session;
mod traits;

pub mod joycaption;
pub mod llava;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use device::ComputeDevice;
pub use session::CaptionSession;
pub use traits::*;

mod discover;
mod error;
mod process;

pub use discover::{get_image_files, is_supported_image, SUPPORTED_IMAGE_EXTENSIONS};
pub use error::{BatchError, BatchResult};
pub use process::*;

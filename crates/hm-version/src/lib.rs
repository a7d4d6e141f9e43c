//! Semantic message versions and the converter registry.

mod registry;
mod version;

pub use registry::{ConversionError, ConversionPath, ConverterRegistry, MessageConverter};
pub use version::{MessageVersion, VersionParseError};

pub mod config;
pub mod identifier_index;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, AugmentSettings, CurationSettings, DeviceType, LocatorSettings, PathSettings, TrainingSettings};
pub use identifier_index::{IdentifierIndex, ItemIdentifier};
pub use model_metadata::{print_metadata_info, ModelMetadata};
pub use model_storage::{load_metadata, load_model_with_metadata, read_bundle, save_model_with_metadata, write_bundle};

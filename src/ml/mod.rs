pub mod augment;
pub mod dataset;
pub mod graph;
pub mod onnx;
pub mod prediction;

#[cfg(feature = "ml")]
pub mod inference;
#[cfg(feature = "ml")]
pub mod ml_model;
#[cfg(feature = "ml")]
pub mod training;

pub use augment::{crop_item_middle, CROP_SIZE};
pub use dataset::{noise_crops, AssembledBatch, DatasetAssembler, SampleSet, TrainingCrop};
pub use graph::{GraphPredictor, InferenceGraph};
pub use prediction::{CropClassifier, Prediction};

#[cfg(feature = "ml")]
pub use inference::{save_checkpoint, Predictor};
#[cfg(feature = "ml")]
pub use ml_model::{ItemClassifier, ModelConfig, IMAGE_SIZE};
#[cfg(feature = "ml")]
pub use training::{run_training, train, TrainedModel, TrainingArtifacts};

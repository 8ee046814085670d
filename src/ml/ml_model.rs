//! 機械学習モデルの共通定義
//!
//! アイテムアイコン分類用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

/// 画像サイズ
pub const IMAGE_SIZE: usize = 64;

/// 畳み込み後の特徴マップ (16 x 7 x 7)
pub const FEATURE_CHANNELS: usize = 16;
pub const FEATURE_SIZE: usize = 7;
/// Flatten 後の特徴次元 = 16 * 7 * 7
pub const FEATURE_DIM: usize = FEATURE_CHANNELS * FEATURE_SIZE * FEATURE_SIZE;

pub(crate) const CONV1_KERNEL: usize = 3;
pub(crate) const CONV1_PADDING: usize = 1;
pub(crate) const POOL1_SIZE: usize = 2;
pub(crate) const CONV2_KERNEL: usize = 5;
pub(crate) const POOL2_SIZE: usize = 4;
pub(crate) const FC1_UNITS: usize = 400;
pub(crate) const FC2_UNITS: usize = 120;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数（インデックスの長さ）
    pub num_classes: usize,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> ItemClassifier<B> {
        // サイズ計算:
        // Conv1 (3x3, padding 1): 64 -> 64
        // Pool1 (2x2, stride 2): 64 -> 32
        // Conv2 (5x5, no padding): 32 -> 28
        // Pool2 (4x4, stride 4): 28 -> 7
        log::debug!("[Model] FC: {} -> {} -> {} -> {}", FEATURE_DIM, FC1_UNITS, FC2_UNITS, self.num_classes);

        ItemClassifier {
            conv1: Conv2dConfig::new([3, 6], [CONV1_KERNEL, CONV1_KERNEL])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(CONV1_PADDING, CONV1_PADDING))
                .init(device),
            pool1: MaxPool2dConfig::new([POOL1_SIZE, POOL1_SIZE])
                .with_strides([POOL1_SIZE, POOL1_SIZE])
                .init(),

            conv2: Conv2dConfig::new([6, FEATURE_CHANNELS], [CONV2_KERNEL, CONV2_KERNEL])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([POOL2_SIZE, POOL2_SIZE])
                .with_strides([POOL2_SIZE, POOL2_SIZE])
                .init(),

            fc1: LinearConfig::new(FEATURE_DIM, FC1_UNITS).init(device),
            fc2: LinearConfig::new(FC1_UNITS, FC2_UNITS).init(device),
            fc3: LinearConfig::new(FC2_UNITS, self.num_classes).init(device),

            activation: Relu::new(),
        }
    }
}

/// アイテムアイコン分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (3 -> 6, padding 1) + ReLU + MaxPool 2x2
/// - Conv 5x5 (6 -> 16) + ReLU + MaxPool 4x4
/// - Flatten (784)
/// - FC: 784 -> 400 + ReLU
/// - FC: 400 -> 120 + ReLU
/// - FC: 120 -> num_classes（活性化なし）
#[derive(Module, Debug)]
pub struct ItemClassifier<B: Backend> {
    pub(crate) conv1: Conv2d<B>, // 3 -> 6
    pub(crate) pool1: MaxPool2d,
    pub(crate) conv2: Conv2d<B>, // 6 -> 16
    pub(crate) pool2: MaxPool2d,

    pub(crate) fc1: Linear<B>, // 784 -> 400
    pub(crate) fc2: Linear<B>, // 400 -> 120
    pub(crate) fc3: Linear<B>, // 120 -> num_classes

    activation: Relu,
}

impl<B: Backend> ItemClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, 64, 64]（画素値 0..=255）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = x.reshape([batch_size, FEATURE_DIM]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.fc2.forward(x);
        let x = self.activation.forward(x);

        self.fc3.forward(x)
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        let [_, d_output] = self.fc3.weight.val().dims();
        d_output
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ModelConfig::new(5).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, IMAGE_SIZE, IMAGE_SIZE], &device);
        let output = model.forward(images);
        assert_eq!(output.dims(), [2, 5]);
        assert_eq!(model.num_classes(), 5);
    }

    #[test]
    fn test_classification_loss_is_finite() {
        let device = Default::default();
        let model = ModelConfig::new(2).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([3, 3, IMAGE_SIZE, IMAGE_SIZE], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 1], &device);
        let output = model.forward_classification(images, targets);
        let loss: f32 = output.loss.into_scalar();
        assert!(loss.is_finite());
    }
}

//! 推論グラフ（ONNX）
//!
//! 学習済みモデルを ONNX に書き出し、`tract-onnx` で Burn なしに評価します。
//! tar.gz 内部:
//! - metadata.json : [`GraphMetadata`]
//! - model.onnx    : ONNX モデル（入力 `input` `[N, 3, 64, 64]`、出力 `scores` `[N, クラス数]`）

use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::ml::onnx::{AttributeProto, Dimension, GraphProto, ModelProto, NodeProto, TensorProto, ValueInfoProto};
use crate::ml::prediction::{self, CropClassifier, Prediction};
use crate::model::model_storage::{self, GRAPH_ENTRY, METADATA_ENTRY};
use crate::model::{IdentifierIndex, ItemIdentifier};

pub const GRAPH_FORMAT_VERSION: u32 = 2;

const INPUT_NAME: &str = "input";
const OUTPUT_NAME: &str = "scores";

/// ONNX に書き出すレイヤー
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    /// 重みは `[out_channels, in_channels, kernel_h, kernel_w]` の row-major
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
    Relu,
    MaxPool2d {
        kernel: [usize; 2],
        stride: [usize; 2],
    },
    Flatten,
    /// 重みは `[d_input, d_output]` の row-major（`y = x W + b`、Gemm の B そのもの）
    Linear {
        d_input: usize,
        d_output: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
}

/// グラフのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub format_version: u32,
    pub idx2id: Vec<ItemIdentifier>,
    /// エクスポート時に通したバッチの形 `[N, 3, 64, 64]`
    pub trace_shape: [usize; 4],
    pub exported_at: String,
}

/// レイヤー列を ONNX のノードと初期化子に変換する
struct GraphBuilder {
    graph: GraphProto,
    current: String,
    counter: usize,
}

impl GraphBuilder {
    fn new(input_shape: [usize; 3]) -> Self {
        let [c, h, w] = input_shape;
        let graph = GraphProto {
            name: "item_classifier".to_string(),
            input: vec![ValueInfoProto::float_tensor(
                INPUT_NAME,
                vec![
                    Dimension::named("N"),
                    Dimension::fixed(c),
                    Dimension::fixed(h),
                    Dimension::fixed(w),
                ],
            )],
            ..GraphProto::default()
        };
        Self {
            graph,
            current: INPUT_NAME.to_string(),
            counter: 0,
        }
    }

    fn initializer(&mut self, name: String, dims: &[usize], values: &[f32]) -> Result<String> {
        let expected: usize = dims.iter().product();
        if values.len() != expected {
            anyhow::bail!("初期化子 {} の長さ {} が形状 {:?} と一致しません", name, values.len(), dims);
        }
        self.graph.initializer.push(TensorProto::float(name.clone(), dims, values));
        Ok(name)
    }

    /// ノードを追加し、出力を次の入力にする
    fn push(&mut self, op_type: &str, extra_inputs: Vec<String>, attributes: Vec<AttributeProto>) {
        let name = format!("{}_{}", op_type.to_lowercase(), self.counter);
        self.counter += 1;
        let mut inputs = vec![std::mem::take(&mut self.current)];
        inputs.extend(extra_inputs);
        let node = attributes
            .into_iter()
            .fold(NodeProto::new(op_type, name.clone(), inputs, name.clone()), NodeProto::with_attribute);
        self.graph.node.push(node);
        self.current = name;
    }

    fn add(&mut self, op: &GraphOp) -> Result<()> {
        let id = self.counter;
        match op {
            GraphOp::Conv2d {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                weight,
                bias,
            } => {
                let mut inputs = vec![self.initializer(
                    format!("conv_{}.weight", id),
                    &[*out_channels, *in_channels, kernel[0], kernel[1]],
                    weight,
                )?];
                if let Some(bias) = bias {
                    inputs.push(self.initializer(format!("conv_{}.bias", id), &[*out_channels], bias)?);
                }
                let [ph, pw] = *padding;
                self.push(
                    "Conv",
                    inputs,
                    vec![
                        AttributeProto::ints("kernel_shape", kernel),
                        AttributeProto::ints("strides", stride),
                        AttributeProto::ints("pads", &[ph, pw, ph, pw]),
                    ],
                );
            }
            GraphOp::Relu => self.push("Relu", Vec::new(), Vec::new()),
            GraphOp::MaxPool2d { kernel, stride } => self.push(
                "MaxPool",
                Vec::new(),
                vec![
                    AttributeProto::ints("kernel_shape", kernel),
                    AttributeProto::ints("strides", stride),
                ],
            ),
            GraphOp::Flatten => self.push("Flatten", Vec::new(), vec![AttributeProto::int("axis", 1)]),
            GraphOp::Linear {
                d_input,
                d_output,
                weight,
                bias,
            } => {
                let mut inputs =
                    vec![self.initializer(format!("gemm_{}.weight", id), &[*d_input, *d_output], weight)?];
                if let Some(bias) = bias {
                    inputs.push(self.initializer(format!("gemm_{}.bias", id), &[*d_output], bias)?);
                }
                self.push("Gemm", inputs, Vec::new());
            }
        }
        Ok(())
    }

    /// 最後のノードの出力を `scores` にして完成させる
    fn finish(mut self, num_classes: usize) -> Result<ModelProto> {
        let last = self
            .graph
            .node
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("グラフにノードがありません"))?;
        last.output = vec![OUTPUT_NAME.to_string()];
        // バッチ次元は入力から決まるので長さを書かない
        self.graph.output = vec![ValueInfoProto::float_tensor(
            OUTPUT_NAME,
            vec![Dimension::unknown(), Dimension::fixed(num_classes)],
        )];
        Ok(ModelProto::new(self.graph))
    }
}

/// ONNX 形式の推論グラフ
#[derive(Debug, Clone)]
pub struct InferenceGraph {
    onnx: Vec<u8>,
    /// `[C, H, W]`
    input_shape: [usize; 3],
    num_classes: usize,
}

impl InferenceGraph {
    /// レイヤー列から ONNX モデルを組み立てる
    pub fn from_ops(input_shape: [usize; 3], ops: &[GraphOp]) -> Result<Self> {
        let num_classes = ops
            .iter()
            .rev()
            .find_map(|op| match op {
                GraphOp::Linear { d_output, .. } => Some(*d_output),
                _ => None,
            })
            .ok_or_else(|| anyhow::anyhow!("全結合層がありません"))?;

        let mut builder = GraphBuilder::new(input_shape);
        for op in ops {
            builder.add(op)?;
        }
        Self::from_onnx(builder.finish(num_classes)?.to_bytes())
    }

    /// ONNX のバイト列から読み込む（入出力の形はグラフ定義から取る）
    pub fn from_onnx(onnx: Vec<u8>) -> Result<Self> {
        let model = ModelProto::from_bytes(&onnx).context("ONNX モデルを解析できません")?;
        let graph = model
            .graph
            .ok_or_else(|| anyhow::anyhow!("ONNX モデルにグラフがありません"))?;

        let input_dims = graph.input.first().and_then(ValueInfoProto::fixed_dims);
        let input_shape = match input_dims.as_deref() {
            Some([_, Some(c), Some(h), Some(w)]) => [*c, *h, *w],
            _ => anyhow::bail!("入力形状が [N, C, H, W] ではありません: {:?}", input_dims),
        };
        let output_dims = graph.output.first().and_then(ValueInfoProto::fixed_dims);
        let num_classes = match output_dims.as_deref() {
            Some([_, Some(k)]) => *k,
            _ => anyhow::bail!("出力形状が [N, クラス数] ではありません: {:?}", output_dims),
        };

        Ok(Self {
            onnx,
            input_shape,
            num_classes,
        })
    }

    pub fn onnx_bytes(&self) -> &[u8] {
        &self.onnx
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// planar の f32 列（`[N, C, H, W]`）を評価し、スコア `[N, num_classes]` を返す
    pub fn run_flat(&self, data: &[f32]) -> Result<Vec<f32>> {
        let [c, h, w] = self.input_shape;
        let per_item = c * h * w;
        if per_item == 0 || data.is_empty() || data.len() % per_item != 0 {
            anyhow::bail!("入力長 {} は {} の倍数ではありません", data.len(), per_item);
        }
        let shape = [data.len() / per_item, c, h, w];
        let scores = runtime::run(&self.onnx, shape, data).context("推論グラフの評価に失敗しました")?;
        if scores.len() != shape[0] * self.num_classes {
            anyhow::bail!("出力長 {} が {} x {} と一致しません", scores.len(), shape[0], self.num_classes);
        }
        Ok(scores)
    }
}

mod runtime {
    use tract_onnx::prelude::*;

    /// バッチサイズを固定して最適化し、1回評価する
    pub(super) fn run(onnx: &[u8], shape: [usize; 4], data: &[f32]) -> anyhow::Result<Vec<f32>> {
        let plan = tract_onnx::onnx()
            .model_for_read(&mut &onnx[..])?
            .with_input_fact(0, f32::fact(shape).into())?
            .into_optimized()?
            .into_runnable()?;
        let input = Tensor::from_shape(&shape, data)?;
        let outputs = plan.run(tvec!(input.into()))?;
        let scores = outputs[0].to_array_view::<f32>()?;
        Ok(scores.iter().copied().collect())
    }
}

/// グラフをメタデータと共に tar.gz に保存
pub fn save_graph_bundle(output_path: &Path, metadata: &GraphMetadata, graph: &InferenceGraph) -> Result<PathBuf> {
    let metadata_json = serde_json::to_string_pretty(metadata).context("Failed to serialize graph metadata")?;
    model_storage::write_bundle(
        output_path,
        &[(METADATA_ENTRY, metadata_json.as_bytes()), (GRAPH_ENTRY, graph.onnx_bytes())],
    )
}

/// tar.gz からグラフとメタデータを読み込む
pub fn load_graph_bundle(path: &Path) -> Result<(GraphMetadata, InferenceGraph)> {
    let mut entries = model_storage::read_bundle(path, &[METADATA_ENTRY, GRAPH_ENTRY])?;
    let metadata: GraphMetadata = serde_json::from_slice(&entries[METADATA_ENTRY])
        .context("Failed to deserialize graph metadata")?;
    if metadata.format_version != GRAPH_FORMAT_VERSION {
        anyhow::bail!("未対応のグラフ形式です: version {}", metadata.format_version);
    }
    let onnx = entries
        .remove(GRAPH_ENTRY)
        .ok_or_else(|| anyhow::anyhow!("{} が見つかりません", GRAPH_ENTRY))?;
    let graph = InferenceGraph::from_onnx(onnx)?;
    Ok((metadata, graph))
}

/// エクスポート済みグラフによる推論器
pub struct GraphPredictor {
    graph: InferenceGraph,
    index: IdentifierIndex,
}

impl GraphPredictor {
    pub fn new(graph: InferenceGraph, index: IdentifierIndex) -> Result<Self> {
        if graph.num_classes() != index.len() {
            return Err(PipelineError::CheckpointShapeMismatch {
                expected: index.len(),
                found: graph.num_classes(),
            }
            .into());
        }
        Ok(Self { graph, index })
    }

    /// バンドルを読み込む（クラス名はグラフに同梱の idx2id を使う）
    pub fn load(path: &Path) -> Result<Self> {
        let (metadata, graph) = load_graph_bundle(path)?;
        log::info!(
            "推論グラフを読み込みました: {} ({} クラス, トレース形状 {:?}, {})",
            path.display(),
            metadata.idx2id.len(),
            metadata.trace_shape,
            metadata.exported_at
        );
        let index = IdentifierIndex::from_identifiers(metadata.idx2id)?;
        Self::new(graph, index)
    }

    pub fn graph(&self) -> &InferenceGraph {
        &self.graph
    }
}

impl CropClassifier for GraphPredictor {
    fn predict(&self, crops: &[RgbImage]) -> Result<Vec<Prediction>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }
        let data = prediction::stack_crops(crops)?;
        let scores = self.graph.run_flat(&data)?;
        let num_classes = self.index.len();
        let probs = prediction::softmax_rows(&scores, num_classes);
        prediction::top1_predictions(&probs, num_classes, &self.index)
    }

    fn index(&self) -> &IdentifierIndex {
        &self.index
    }
}

#[cfg(feature = "ml")]
pub use export::{export_inference_graph, graph_from_model};

#[cfg(feature = "ml")]
mod export {
    use super::*;
    use burn::nn::conv::Conv2d;
    use burn::nn::Linear;
    use burn::tensor::backend::Backend;
    use burn::tensor::Tensor;

    use crate::ml::ml_model::{ItemClassifier, CONV1_PADDING, IMAGE_SIZE, POOL1_SIZE, POOL2_SIZE};

    /// arg-max が異なっても、スコア差が行の最大絶対値のこの割合以下なら同点とみなす
    const TIE_TOLERANCE: f32 = 1e-4;

    fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
        tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("テンソルの取り出しに失敗しました: {:?}", e))
    }

    fn conv_op<B: Backend>(conv: &Conv2d<B>, padding: usize) -> Result<GraphOp> {
        let weight = conv.weight.val();
        let [out_channels, in_channels, kh, kw] = weight.dims();
        let bias = match &conv.bias {
            Some(bias) => Some(tensor_values(bias.val())?),
            None => None,
        };
        Ok(GraphOp::Conv2d {
            in_channels,
            out_channels,
            kernel: [kh, kw],
            stride: [1, 1],
            padding: [padding, padding],
            weight: tensor_values(weight)?,
            bias,
        })
    }

    fn linear_op<B: Backend>(linear: &Linear<B>) -> Result<GraphOp> {
        let weight = linear.weight.val();
        let [d_input, d_output] = weight.dims();
        let bias = match &linear.bias {
            Some(bias) => Some(tensor_values(bias.val())?),
            None => None,
        };
        Ok(GraphOp::Linear {
            d_input,
            d_output,
            weight: tensor_values(weight)?,
            bias,
        })
    }

    /// モデルの重みを ONNX グラフに書き出す
    pub fn graph_from_model<B: Backend>(model: &ItemClassifier<B>) -> Result<InferenceGraph> {
        let ops = [
            conv_op(&model.conv1, CONV1_PADDING)?,
            GraphOp::Relu,
            GraphOp::MaxPool2d {
                kernel: [POOL1_SIZE, POOL1_SIZE],
                stride: [POOL1_SIZE, POOL1_SIZE],
            },
            conv_op(&model.conv2, 0)?,
            GraphOp::Relu,
            GraphOp::MaxPool2d {
                kernel: [POOL2_SIZE, POOL2_SIZE],
                stride: [POOL2_SIZE, POOL2_SIZE],
            },
            GraphOp::Flatten,
            linear_op(&model.fc1)?,
            GraphOp::Relu,
            linear_op(&model.fc2)?,
            GraphOp::Relu,
            linear_op(&model.fc3)?,
        ];
        InferenceGraph::from_ops([3, IMAGE_SIZE, IMAGE_SIZE], &ops)
    }

    fn argmax_rows(scores: &[f32], num_classes: usize) -> Vec<usize> {
        scores
            .chunks(num_classes)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc })
                    .0
            })
            .collect()
    }

    /// トレース用バッチで検証してから推論グラフを書き出す
    ///
    /// `trace` は `[N, 3, 64, 64]` の planar 配列。モデルとグラフの arg-max が
    /// 一致しない（スコアもほぼ同じでない）場合はエラー。
    pub fn export_inference_graph<B: Backend>(
        model: &ItemClassifier<B>,
        trace: &[f32],
        index: &IdentifierIndex,
        output_path: &Path,
        device: &B::Device,
    ) -> Result<PathBuf> {
        let per_item = 3 * IMAGE_SIZE * IMAGE_SIZE;
        if trace.is_empty() || trace.len() % per_item != 0 {
            anyhow::bail!("トレース用バッチの長さが不正です: {}", trace.len());
        }
        let batch_size = trace.len() / per_item;
        let trace_shape = [batch_size, 3, IMAGE_SIZE, IMAGE_SIZE];

        let graph = graph_from_model(model)?;
        let num_classes = model.num_classes();

        let input = Tensor::<B, 1>::from_floats(trace, device).reshape(trace_shape);
        let model_scores = tensor_values(model.forward(input))?;
        let graph_scores = graph.run_flat(trace)?;

        let model_top = argmax_rows(&model_scores, num_classes);
        let graph_top = argmax_rows(&graph_scores, num_classes);
        for (row, (&a, &b)) in model_top.iter().zip(&graph_top).enumerate() {
            let scores = &graph_scores[row * num_classes..(row + 1) * num_classes];
            let scale = scores.iter().fold(1.0f32, |m, v| m.max(v.abs()));
            let tie = (scores[a] - scores[b]).abs() <= TIE_TOLERANCE * scale;
            if a != b && !tie {
                anyhow::bail!("エクスポートしたグラフの予測がモデルと一致しません (行 {}: {} != {})", row, a, b);
            }
        }

        let metadata = GraphMetadata {
            format_version: GRAPH_FORMAT_VERSION,
            idx2id: index.identifiers().to_vec(),
            trace_shape,
            exported_at: chrono::Local::now().to_rfc3339(),
        };
        let path = save_graph_bundle(output_path, &metadata, &graph)?;
        log::info!("推論グラフを書き出しました: {} (トレース形状 {:?})", path.display(), trace_shape);
        Ok(path)
    }
}

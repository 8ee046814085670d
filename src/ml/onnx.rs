//! ONNX の protobuf メッセージ
//!
//! 書き出しと読み戻しに使うフィールドだけを定義しています。タグ番号は onnx.proto と同じです。

use prost::{Enumeration, Message};

/// IR version 7 (ONNX 1.8)
pub const IR_VERSION: i64 = 7;
pub const OPSET_VERSION: i64 = 13;
/// `TensorProto.DataType.FLOAT`
pub const ELEM_TYPE_FLOAT: i32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum AttributeType {
    Undefined = 0,
    Int = 2,
    Ints = 7,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(enumeration = "AttributeType", tag = "20")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(string, tag = "8")]
    pub name: String,
    /// リトルエンディアンの生データ
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TensorTypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dimension>,
}

/// 固定長（`dim_value`）か名前付きの可変長（`dim_param`）
#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(int64, optional, tag = "1")]
    pub dim_value: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub dim_param: Option<String>,
}

impl Dimension {
    pub fn fixed(value: usize) -> Self {
        Self {
            dim_value: Some(value as i64),
            dim_param: None,
        }
    }

    /// 長さを指定しない次元
    pub fn unknown() -> Self {
        Self {
            dim_value: None,
            dim_param: None,
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            dim_value: None,
            dim_param: Some(name.to_string()),
        }
    }
}

impl AttributeProto {
    pub fn int(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            i: value,
            ints: Vec::new(),
            r#type: AttributeType::Int as i32,
        }
    }

    pub fn ints(name: &str, values: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            i: 0,
            ints: values.iter().map(|&v| v as i64).collect(),
            r#type: AttributeType::Ints as i32,
        }
    }
}

impl NodeProto {
    pub fn new(op_type: &str, name: String, input: Vec<String>, output: String) -> Self {
        Self {
            input,
            output: vec![output],
            name,
            op_type: op_type.to_string(),
            attribute: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeProto) -> Self {
        self.attribute.push(attribute);
        self
    }
}

impl TensorProto {
    /// f32 の初期化子（重み）
    pub fn float(name: String, dims: &[usize], values: &[f32]) -> Self {
        Self {
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: ELEM_TYPE_FLOAT,
            name,
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

impl ValueInfoProto {
    pub fn float_tensor(name: &str, dims: Vec<Dimension>) -> Self {
        Self {
            name: name.to_string(),
            r#type: Some(TypeProto {
                tensor_type: Some(TensorTypeProto {
                    elem_type: ELEM_TYPE_FLOAT,
                    shape: Some(TensorShapeProto { dim: dims }),
                }),
            }),
        }
    }

    /// 各次元の固定長（可変長の次元は `None`）
    pub fn fixed_dims(&self) -> Option<Vec<Option<usize>>> {
        let shape = self.r#type.as_ref()?.tensor_type.as_ref()?.shape.as_ref()?;
        Some(
            shape
                .dim
                .iter()
                .map(|d| d.dim_value.and_then(|v| usize::try_from(v).ok()))
                .collect(),
        )
    }
}

impl ModelProto {
    /// 標準ドメインの opset を1つだけ使うモデル
    pub fn new(graph: GraphProto) -> Self {
        Self {
            ir_version: IR_VERSION,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: OPSET_VERSION,
            }],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(Self::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initializer_is_little_endian() {
        let tensor = TensorProto::float("w".to_string(), &[2], &[1.0, -2.0]);
        assert_eq!(tensor.dims, vec![2]);
        assert_eq!(tensor.raw_data, [1.0f32.to_le_bytes(), (-2.0f32).to_le_bytes()].concat());
    }

    #[test]
    fn test_dynamic_batch_dimension() {
        let info = ValueInfoProto::float_tensor("input", vec![Dimension::named("N"), Dimension::fixed(3)]);
        let model = ModelProto::new(GraphProto {
            input: vec![info],
            ..GraphProto::default()
        });
        let decoded = ModelProto::from_bytes(&model.to_bytes()).unwrap();
        let dims = decoded.graph.unwrap().input[0].fixed_dims().unwrap();
        assert_eq!(dims, vec![None, Some(3)]);
        assert_eq!(decoded.opset_import[0].version, OPSET_VERSION);
    }
}

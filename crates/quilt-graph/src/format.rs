//! JSON graph files.
//!
//! Tensors are listed in handle order and operations refer to them by
//! position, so a round trip preserves every `TensorId`. Constant data is
//! written as plain numbers and re-encoded for the tensor's dtype on load.

use serde::{Deserialize, Serialize};

use crate::{
    DType, Graph, GraphError, GraphResult, Idx, OpKind, Quantization, Shape, TensorAttr,
    TensorId, TensorSpec,
};

/// Serialized form of a [`Graph`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    /// Tensors in handle order.
    pub tensors: Vec<TensorDef>,
    /// Operations in binding order.
    pub ops: Vec<OpDef>,
}

/// Serialized tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorDef {
    /// Optional name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Element type.
    pub dtype: DType,
    /// Shape.
    pub shape: Shape,
    /// Role.
    pub attr: TensorAttr,
    /// Quantization parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quant: Option<Quantization>,
    /// Constant values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f32>>,
}

/// Serialized operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
    /// Kind and parameters.
    pub kind: OpKind,
    /// Input tensor positions.
    pub inputs: Vec<usize>,
    /// Output tensor positions.
    pub outputs: Vec<usize>,
}

impl Graph {
    /// Convert to the serializable form.
    pub fn to_def(&self) -> GraphResult<GraphDef> {
        let tensors = self
            .tensors()
            .map(|(_, t)| {
                let data = match &t.data {
                    Some(bytes) => Some(t.spec.dtype.decode(bytes)?),
                    None => None,
                };
                Ok(TensorDef {
                    name: t.name.clone(),
                    dtype: t.spec.dtype,
                    shape: t.spec.shape.clone(),
                    attr: t.spec.attr,
                    quant: t.spec.quant,
                    data,
                })
            })
            .collect::<GraphResult<Vec<_>>>()?;
        let ops = self
            .ops()
            .map(|(_, op)| OpDef {
                kind: op.kind.clone(),
                inputs: op.inputs.iter().map(|t| t.index()).collect(),
                outputs: op.outputs.iter().map(|t| t.index()).collect(),
            })
            .collect();
        Ok(GraphDef { tensors, ops })
    }

    /// Rebuild a graph, re-running shape checks on every operation.
    pub fn from_def(def: &GraphDef) -> GraphResult<Self> {
        let mut graph = Self::new();
        for t in &def.tensors {
            let spec = TensorSpec {
                dtype: t.dtype,
                shape: t.shape.clone(),
                attr: t.attr,
                quant: t.quant,
            };
            let id = match (&t.data, t.attr) {
                (Some(values), _) => graph.create_constant(spec, t.dtype.encode(values))?,
                (None, TensorAttr::Constant) => {
                    return Err(GraphError::Format(format!(
                        "constant tensor {} has no data",
                        graph.num_tensors()
                    )))
                }
                (None, _) => graph.create_tensor(spec),
            };
            if let Some(name) = &t.name {
                graph.set_name(id, name.clone())?;
            }
        }
        let count = def.tensors.len();
        let resolve = |positions: &[usize]| -> GraphResult<Vec<TensorId>> {
            positions
                .iter()
                .map(|&p| {
                    if p < count {
                        Ok(TensorId::new(p))
                    } else {
                        Err(GraphError::Format(format!("tensor position {p} out of range")))
                    }
                })
                .collect()
        };
        for op in &def.ops {
            let inputs = resolve(&op.inputs)?;
            let outputs = resolve(&op.outputs)?;
            graph.add_op(op.kind.clone(), &inputs, &outputs)?;
        }
        Ok(graph)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> GraphResult<String> {
        serde_json::to_string_pretty(&self.to_def()?).map_err(|e| GraphError::Format(e.to_string()))
    }

    /// Parse and validate a JSON graph.
    pub fn from_json(json: &str) -> GraphResult<Self> {
        let def: GraphDef =
            serde_json::from_str(json).map_err(|e| GraphError::Format(e.to_string()))?;
        Self::from_def(&def)
    }
}

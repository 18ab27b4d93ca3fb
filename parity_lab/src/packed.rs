//! Optimized CPU linear kernel.
//!
//! The weight is repacked into panels of [`PANEL`] output features with the
//! features interleaved per input column, so one pass over an input row feeds a
//! full panel of accumulators. Reductions are split across [`K_STREAMS`]
//! independent accumulators and use fused multiply-add, so results differ from
//! the reference only by summation order. Bias and ReLU are fused into the
//! forward epilogue.

use linear_core::{config::Epilogue, Scalar, Tensor};
use tracing::debug;

use crate::{error::ParityError, kernel::LinearKernel};

pub const PANEL: usize = 8;
pub const K_STREAMS: usize = 4;

/// Weight `(out, in)` laid out as `[panel][k][lane]`, zero padded to whole panels.
#[derive(Debug, Clone)]
pub struct PackedWeight {
    output_features: usize,
    input_features: usize,
    panels: Vec<Scalar>,
}

impl PackedWeight {
    pub fn pack(weight: &Tensor) -> Self {
        let (output_features, input_features) = weight.shape();
        let panel_count = output_features.div_ceil(PANEL);
        let mut panels = vec![0.0; panel_count * input_features * PANEL];
        for o in 0..output_features {
            let (p, lane) = (o / PANEL, o % PANEL);
            let base = p * input_features * PANEL;
            for (k, w) in weight.row(o).iter().enumerate() {
                panels[base + k * PANEL + lane] = *w;
            }
        }
        Self {
            output_features,
            input_features,
            panels,
        }
    }

    pub fn panel_count(&self) -> usize {
        self.output_features.div_ceil(PANEL)
    }

    fn panel(&self, p: usize) -> &[Scalar] {
        let len = self.input_features * PANEL;
        &self.panels[p * len..(p + 1) * len]
    }

    fn matches(&self, weight: &Tensor) -> bool {
        weight.shape() == (self.output_features, self.input_features)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PackedKernel {
    packed: Option<PackedWeight>,
}

impl PackedKernel {
    fn packed_for(&mut self, weight: &Tensor) -> &PackedWeight {
        if self.packed.as_ref().is_some_and(|p| !p.matches(weight)) {
            self.packed = None;
        }
        self.packed.get_or_insert_with(|| PackedWeight::pack(weight))
    }
}

impl LinearKernel for PackedKernel {
    fn prepare(&mut self, weight: &Tensor) -> Result<(), ParityError> {
        self.packed = Some(PackedWeight::pack(weight));
        Ok(())
    }

    fn forward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        epilogue: Epilogue,
    ) -> Result<Tensor, ParityError> {
        let precision = input.precision();
        let (batch, input_features) = input.shape();
        let packed = self.packed_for(weight);
        let output_features = packed.output_features;
        debug!(
            batch,
            input_features,
            output_features,
            panels = packed.panel_count(),
            "packed forward"
        );

        let mut out = vec![0.0; batch * output_features];
        for b in 0..batch {
            let x = input.row(b);
            for p in 0..packed.panel_count() {
                let lanes = panel_dot(x, packed.panel(p));
                for (lane, acc) in lanes.iter().enumerate() {
                    let o = p * PANEL + lane;
                    if o >= output_features {
                        break;
                    }
                    let pre = match bias {
                        Some(bias) => acc + bias.as_slice()[o],
                        None => *acc,
                    };
                    let y = precision.round(pre);
                    out[b * output_features + o] = match epilogue {
                        Epilogue::Identity => y,
                        Epilogue::Relu => y.max(0.0),
                    };
                }
            }
        }
        Ok(Tensor::from_vec(batch, output_features, out, precision))
    }

    fn backward_input(
        &mut self,
        grad_output: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let batch = grad_output.rows();
        let packed = self.packed_for(weight);
        let input_features = packed.input_features;

        let mut out = vec![0.0; batch * input_features];
        let mut grad_lanes = [0.0f32; PANEL];
        for b in 0..batch {
            let g = grad_output.row(b);
            let mut acc = vec![[0.0f32; PANEL]; input_features];
            for p in 0..packed.panel_count() {
                for (lane, slot) in grad_lanes.iter_mut().enumerate() {
                    *slot = g.get(p * PANEL + lane).copied().unwrap_or(0.0);
                }
                let panel = packed.panel(p);
                for (k, lanes) in acc.iter_mut().enumerate() {
                    let w = &panel[k * PANEL..(k + 1) * PANEL];
                    for lane in 0..PANEL {
                        lanes[lane] = grad_lanes[lane].mul_add(w[lane], lanes[lane]);
                    }
                }
            }
            for (k, lanes) in acc.iter().enumerate() {
                out[b * input_features + k] = tree_sum(lanes);
            }
        }
        Ok(Tensor::from_vec(batch, input_features, out, grad_output.precision()))
    }

    fn backward_weight(
        &mut self,
        grad_output: &Tensor,
        input: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let input_features = input.cols();

        let mut out = vec![0.0; output_features * input_features];
        for o in 0..output_features {
            for k in 0..input_features {
                let mut streams = [0.0f32; K_STREAMS];
                for b in 0..batch {
                    let s = b % K_STREAMS;
                    streams[s] = grad_output.get(b, o).mul_add(input.get(b, k), streams[s]);
                }
                out[o * input_features + k] = tree_sum(&streams);
            }
        }
        Ok(Tensor::from_vec(
            output_features,
            input_features,
            out,
            grad_output.precision(),
        ))
    }

    fn backward_bias(&mut self, grad_output: &Tensor) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let mut column = Vec::with_capacity(batch);
        let out = (0..output_features)
            .map(|o| {
                column.clear();
                column.extend((0..batch).map(|b| grad_output.get(b, o)));
                tree_sum(&column)
            })
            .collect();
        Ok(Tensor::from_vec(1, output_features, out, grad_output.precision()))
    }
}

/// Dot products of one input row against every lane of a panel.
fn panel_dot(x: &[Scalar], panel: &[Scalar]) -> [Scalar; PANEL] {
    let mut acc = [[0.0f32; PANEL]; K_STREAMS];
    let whole = x.len() - x.len() % K_STREAMS;
    for k0 in (0..whole).step_by(K_STREAMS) {
        for (s, stream) in acc.iter_mut().enumerate() {
            let xv = x[k0 + s];
            let w = &panel[(k0 + s) * PANEL..(k0 + s + 1) * PANEL];
            for lane in 0..PANEL {
                stream[lane] = xv.mul_add(w[lane], stream[lane]);
            }
        }
    }
    for k in whole..x.len() {
        let w = &panel[k * PANEL..(k + 1) * PANEL];
        for lane in 0..PANEL {
            acc[0][lane] = x[k].mul_add(w[lane], acc[0][lane]);
        }
    }
    let mut lanes = [0.0f32; PANEL];
    for (lane, out) in lanes.iter_mut().enumerate() {
        *out = (acc[0][lane] + acc[1][lane]) + (acc[2][lane] + acc[3][lane]);
    }
    lanes
}

/// Pairwise summation.
fn tree_sum(values: &[Scalar]) -> Scalar {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => {
            let (lo, hi) = values.split_at(n / 2);
            tree_sum(lo) + tree_sum(hi)
        }
    }
}

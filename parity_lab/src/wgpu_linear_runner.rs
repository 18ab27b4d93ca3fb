use std::mem::size_of;

use anyhow::{anyhow, bail, Context, Result};
use linear_core::{config::Epilogue, LinearDimsGpu, Scalar, Tensor};
use linear_shaders::compute;
use pollster::block_on;
use tracing::debug;
use wgpu::util::DeviceExt;

use crate::{
    error::ParityError,
    kernel::{LinearKernel, OperatorKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Forward,
    BackwardInput,
    BackwardWeight,
    BackwardBias,
}

impl Stage {
    fn entry_point(self) -> &'static str {
        match self {
            Stage::Forward => compute::FORWARD_ENTRY,
            Stage::BackwardInput => compute::BACKWARD_INPUT_ENTRY,
            Stage::BackwardWeight => compute::BACKWARD_WEIGHT_ENTRY,
            Stage::BackwardBias => compute::BACKWARD_BIAS_ENTRY,
        }
    }
}

/// Device, queue and the four linear pipelines, created once per operator.
pub struct GpuLinearContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    forward: wgpu::ComputePipeline,
    backward_input: wgpu::ComputePipeline,
    backward_weight: wgpu::ComputePipeline,
    backward_bias: wgpu::ComputePipeline,
}

impl GpuLinearContext {
    pub fn new() -> Result<Self> {
        block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .context("no compatible GPU adapter found for linear parity")?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("parity_lab_linear_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                ..Default::default()
            })
            .await
            .context("failed to request wgpu device")?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("LinearBindGroupLayout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("LinearPipelineLayout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("LinearShader"),
            source: wgpu::ShaderSource::Wgsl(compute::LINEAR.into()),
        });

        let pipeline = |stage: Stage| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(stage.entry_point()),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(stage.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let forward = pipeline(Stage::Forward);
        let backward_input = pipeline(Stage::BackwardInput);
        let backward_weight = pipeline(Stage::BackwardWeight);
        let backward_bias = pipeline(Stage::BackwardBias);
        if let Some(err) = device.pop_error_scope().await {
            bail!("linear shader pipelines failed validation: {err}");
        }

        Ok(Self {
            device,
            queue,
            bind_group_layout,
            forward,
            backward_input,
            backward_weight,
            backward_bias,
        })
    }

    fn pipeline(&self, stage: Stage) -> &wgpu::ComputePipeline {
        match stage {
            Stage::Forward => &self.forward,
            Stage::BackwardInput => &self.backward_input,
            Stage::BackwardWeight => &self.backward_weight,
            Stage::BackwardBias => &self.backward_bias,
        }
    }

    /// Runs one stage over `out_len` output elements and reads the result back.
    pub fn dispatch(
        &self,
        stage: Stage,
        dims: &LinearDimsGpu,
        lhs: &[Scalar],
        rhs: &[Scalar],
        aux: &[Scalar],
        out_len: usize,
    ) -> Result<Vec<Scalar>> {
        if out_len == 0 {
            return Ok(Vec::new());
        }
        let out_elems = u32::try_from(out_len)
            .map_err(|_| anyhow!("{out_len} outputs exceed a single linear dispatch"))?;
        let max_per_dim = self.device.limits().max_compute_workgroups_per_dimension;
        let (groups_x, groups_y) =
            workgroup_grid(out_elems.div_ceil(compute::WORKGROUP_SIZE), max_per_dim)
                .ok_or_else(|| anyhow!("{out_len} outputs exceed the workgroup grid limit"))?;
        debug!(?stage, out_len, groups_x, groups_y, "wgpu linear dispatch");

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let lhs_buffer = self.storage_init("LinearLhs", lhs);
        let rhs_buffer = self.storage_init("LinearRhs", rhs);
        let aux_buffer = self.storage_init("LinearAux", aux);
        let result_buffer_size = (out_len * size_of::<Scalar>()) as wgpu::BufferAddress;
        let result_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("LinearResults"),
            size: result_buffer_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("LinearStaging"),
            size: result_buffer_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let dims_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("LinearDims"),
                contents: bytemuck::bytes_of(dims),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("LinearBindGroup"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: lhs_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: rhs_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: aux_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: result_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: dims_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("LinearEncoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(self.pipeline(stage));
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        encoder.copy_buffer_to_buffer(&result_buffer, 0, &staging_buffer, 0, result_buffer_size);
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            bail!("{stage:?} dispatch failed validation: {err}");
        }

        let buffer_slice = staging_buffer.slice(..);
        buffer_slice.map_async(wgpu::MapMode::Read, |_| {});
        self.device
            .poll(wgpu::PollType::Wait)
            .context("failed waiting for linear dispatch")?;
        let data = buffer_slice.get_mapped_range();
        let gpu_outputs: &[Scalar] = bytemuck::cast_slice(&data);
        let values = gpu_outputs.to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(values)
    }

    // Storage bindings cannot be zero-sized, so empty inputs get a single zero.
    fn storage_init(&self, label: &str, data: &[Scalar]) -> wgpu::Buffer {
        let placeholder = [0.0f32];
        let contents = if data.is_empty() { &placeholder[..] } else { data };
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(contents),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }
}

/// Splits `groups` workgroups into an `(x, y)` grid with `x <= max_per_dim`.
///
/// Returns `None` when even the 2-D grid cannot cover `groups`.
fn workgroup_grid(groups: u32, max_per_dim: u32) -> Option<(u32, u32)> {
    if max_per_dim == 0 {
        return None;
    }
    let x = groups.clamp(1, max_per_dim);
    let y = groups.div_ceil(x).max(1);
    (y <= max_per_dim).then_some((x, y))
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Linear kernel backed by the WGSL compute shaders.
pub struct WgpuKernel {
    context: GpuLinearContext,
}

impl WgpuKernel {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: GpuLinearContext::new()?,
        })
    }

    fn dims(
        batch: usize,
        input_features: usize,
        output_features: usize,
        has_bias: bool,
        epilogue: Epilogue,
        tensor: &Tensor,
    ) -> Result<LinearDimsGpu, ParityError> {
        let precision = tensor.precision();
        if !OperatorKind::Wgpu.supports(precision) {
            return Err(ParityError::UnsupportedPrecision {
                kind: OperatorKind::Wgpu,
                precision,
            });
        }
        Ok(LinearDimsGpu::new(
            batch,
            input_features,
            output_features,
            has_bias,
            epilogue,
            precision,
        )?)
    }
}

impl LinearKernel for WgpuKernel {
    fn forward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        epilogue: Epilogue,
    ) -> Result<Tensor, ParityError> {
        let (batch, input_features) = input.shape();
        let output_features = weight.rows();
        let dims = Self::dims(
            batch,
            input_features,
            output_features,
            bias.is_some(),
            epilogue,
            input,
        )?;
        let out = self.context.dispatch(
            Stage::Forward,
            &dims,
            input.as_slice(),
            weight.as_slice(),
            bias.map(Tensor::as_slice).unwrap_or(&[]),
            batch * output_features,
        )?;
        Ok(Tensor::from_vec(batch, output_features, out, input.precision()))
    }

    fn backward_input(
        &mut self,
        grad_output: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let input_features = weight.cols();
        let dims = Self::dims(
            batch,
            input_features,
            output_features,
            false,
            Epilogue::Identity,
            grad_output,
        )?;
        let out = self.context.dispatch(
            Stage::BackwardInput,
            &dims,
            grad_output.as_slice(),
            weight.as_slice(),
            &[],
            batch * input_features,
        )?;
        Ok(Tensor::from_vec(batch, input_features, out, grad_output.precision()))
    }

    fn backward_weight(
        &mut self,
        grad_output: &Tensor,
        input: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let input_features = input.cols();
        let dims = Self::dims(
            batch,
            input_features,
            output_features,
            false,
            Epilogue::Identity,
            grad_output,
        )?;
        let out = self.context.dispatch(
            Stage::BackwardWeight,
            &dims,
            grad_output.as_slice(),
            input.as_slice(),
            &[],
            output_features * input_features,
        )?;
        Ok(Tensor::from_vec(
            output_features,
            input_features,
            out,
            grad_output.precision(),
        ))
    }

    fn backward_bias(&mut self, grad_output: &Tensor) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let dims = Self::dims(
            batch,
            0,
            output_features,
            false,
            Epilogue::Identity,
            grad_output,
        )?;
        let out = self.context.dispatch(
            Stage::BackwardBias,
            &dims,
            grad_output.as_slice(),
            &[],
            &[],
            output_features,
        )?;
        Ok(Tensor::from_vec(1, output_features, out, grad_output.precision()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u32 = 65_535;

    #[test]
    fn small_dispatches_stay_one_dimensional() {
        assert_eq!(workgroup_grid(1, LIMIT), Some((1, 1)));
        assert_eq!(workgroup_grid(LIMIT, LIMIT), Some((LIMIT, 1)));
    }

    #[test]
    fn wide_dispatches_spill_into_y() {
        // 4096 x 1100 weight gradient at 64 threads per group.
        let groups = (4096u32 * 1100).div_ceil(compute::WORKGROUP_SIZE);
        let (x, y) = workgroup_grid(groups, LIMIT).unwrap();
        assert!(x <= LIMIT && y <= LIMIT);
        assert!(u64::from(x) * u64::from(y) >= u64::from(groups));
        assert_eq!((x, y), (LIMIT, 2));
    }

    #[test]
    fn grid_beyond_both_dimensions_is_rejected() {
        assert_eq!(workgroup_grid(u32::MAX, 4), None);
        assert_eq!(workgroup_grid(10, 0), None);
    }
}

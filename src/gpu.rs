//! wgpu backend: the same Hillis–Steele scan, one compute pass per stage.
//!
//! Stages ping-pong between two storage buffers. Passes recorded on one
//! encoder run in order, which gives the barrier between stages.

use std::{borrow::Cow, io};

use anyhow::Context;
use wgpu::util::DeviceExt;

use crate::{
    error::{Result, ScanError},
    operation::Operation,
    prefix_scan::{stage_count, ScanOutput, Scanner},
};

const WORKGROUP_SIZE: usize = 256;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct StageParams {
    stride: u32,
    len: u32,
    op: u32,
    _pad: u32,
}

pub struct GpuEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Folds a backend failure into the crate's error type.
pub(crate) fn resource_error(err: anyhow::Error) -> ScanError {
    ScanError::resource("gpu backend", io::Error::other(format!("{err:#}")))
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuEngine {
    /// Picks an adapter and compiles the stage kernel once.
    pub async fn new() -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .context("No GPU adapter available")?;

        tracing::info!(adapter = ?adapter.get_info().name, "gpu backend selected");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("prefix-scan"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .context("Device request failed")?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("kernels/scan_stage.wgsl"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("kernels/scan_stage.wgsl"))),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scan stage"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_entry(2, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("scan stage"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("scan stage"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main",
        });

        Ok(Self {
            device,
            queue,
            layout,
            pipeline,
        })
    }

    pub async fn inclusive_scan(&self, op: Operation, input: &[i32]) -> anyhow::Result<ScanOutput> {
        let n = input.len();
        if n <= 1 {
            return Ok(ScanOutput {
                values: input.to_vec(),
                stages: 0,
            });
        }

        let bytes = (n * std::mem::size_of::<i32>()) as u64;
        let storage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        let buffers = [
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("scan ping"),
                    contents: bytemuck::cast_slice(input),
                    usage: storage,
                }),
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("scan pong"),
                size: bytes,
                usage: storage,
                mapped_at_creation: false,
            }),
        ];
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let stages = stage_count(n);
        let groups = n.div_ceil(WORKGROUP_SIZE) as u32;
        let mut encoder = self.device.create_command_encoder(&Default::default());

        for s in 0..stages {
            let (src, dst) = (&buffers[s as usize % 2], &buffers[(s as usize + 1) % 2]);
            let params = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("stage params"),
                    contents: bytemuck::bytes_of(&StageParams {
                        stride: 1 << s,
                        len: n as u32,
                        op: op.code() as u32,
                        _pad: 0,
                    }),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: dst.as_entire_binding(),
                    },
                ],
            });

            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }

        encoder.copy_buffer_to_buffer(&buffers[stages as usize % 2], 0, &readback, 0, bytes);
        self.queue.submit(Some(encoder.finish()));

        let values = self.read_back(&readback).await?;
        Ok(ScanOutput { values, stages })
    }

    /// Maps a `MAP_READ` buffer once the queued work has finished.
    async fn read_back(&self, buffer: &wgpu::Buffer) -> anyhow::Result<Vec<i32>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |mapped| {
            let _ = sender.send(mapped);
        });

        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv_async()
            .await
            .context("Readback callback dropped")?
            .context("Mapping readback buffer failed")?;

        let values = bytemuck::cast_slice(&slice.get_mapped_range()).to_vec();
        buffer.unmap();
        Ok(values)
    }
}

impl Scanner for GpuEngine {
    fn scan(&self, op: Operation, input: &[i32]) -> Result<ScanOutput> {
        futures::executor::block_on(self.inclusive_scan(op, input)).map_err(resource_error)
    }
}

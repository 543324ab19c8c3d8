//! WGSL shader compilation and graphics pipeline creation.

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use ash::vk;

use super::VulkanBackend;
use crate::error::GraphicsError;
use crate::target::Pipeline;

/// Programmable stage a shader entry point runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Translates WGSL to SPIR-V words with naga.
pub struct ShaderCompiler;

impl ShaderCompiler {
    /// Compile one entry point of a WGSL module to SPIR-V.
    pub fn compile_wgsl(
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<Vec<u32>, GraphicsError> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!(
                "WGSL parse error: {}",
                e.emit_to_string(source)
            ))
        })?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let info = validator.validate(&module).map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!("Validation error: {e}"))
        })?;

        let naga_stage = stage.to_naga();
        if !module
            .entry_points
            .iter()
            .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
        {
            return Err(GraphicsError::ShaderCompilationFailed(format!(
                "Entry point '{}' not found for stage {:?}",
                entry_point, stage
            )));
        }

        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            flags: naga::back::spv::WriterFlags::empty(),
            capabilities: None,
            bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
            binding_map: Default::default(),
            debug_info: None,
            zero_initialize_workgroup_memory:
                naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: naga_stage,
            entry_point: entry_point.to_string(),
        };

        naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!("SPIR-V generation error: {e}"))
        })
    }

    /// Read a WGSL file and compile one entry point.
    pub fn load_wgsl_file(
        path: impl AsRef<Path>,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<Vec<u32>, GraphicsError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))
        })?;
        log::debug!("Compiling {} ({:?}, {})", path.display(), stage, entry_point);
        Self::compile_wgsl(&source, stage, entry_point)
    }
}

struct StageSource {
    spirv: Vec<u32>,
    entry_point: CString,
}

impl StageSource {
    fn new(spirv: Vec<u32>, entry_point: &str) -> Result<Self, GraphicsError> {
        let entry_point = CString::new(entry_point).map_err(|e| {
            GraphicsError::InvalidParameter(format!(
                "Invalid entry point name (contains null byte): {}",
                e
            ))
        })?;
        Ok(Self { spirv, entry_point })
    }
}

/// Shader modules destroyed when the builder finishes, success or not.
struct ShaderModules<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
}

impl ShaderModules<'_> {
    fn create(&mut self, spirv: &[u32]) -> Result<vk::ShaderModule, GraphicsError> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let module = unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!(
                "Failed to create shader module: {:?}",
                e
            ))
        })?;
        self.modules.push(module);
        Ok(module)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

/// Builds a graphics pipeline for a classic render pass.
///
/// Viewport and scissor are dynamic, so a pipeline survives swapchain
/// recreation as long as the render pass format is unchanged.
pub struct GraphicsPipelineBuilder {
    backend: Arc<VulkanBackend>,
    vertex: Option<StageSource>,
    fragment: Option<StageSource>,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    push_constant_ranges: Vec<vk::PushConstantRange>,
    render_pass: vk::RenderPass,
    subpass: u32,
}

impl GraphicsPipelineBuilder {
    pub fn new(backend: Arc<VulkanBackend>) -> Self {
        Self {
            backend,
            vertex: None,
            fragment: None,
            bindings: Vec::new(),
            attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            push_constant_ranges: Vec::new(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }

    pub fn vertex_shader(mut self, spirv: Vec<u32>, entry_point: &str) -> Result<Self, GraphicsError> {
        self.vertex = Some(StageSource::new(spirv, entry_point)?);
        Ok(self)
    }

    pub fn fragment_shader(
        mut self,
        spirv: Vec<u32>,
        entry_point: &str,
    ) -> Result<Self, GraphicsError> {
        self.fragment = Some(StageSource::new(spirv, entry_point)?);
        Ok(self)
    }

    /// Per-vertex buffer binding with the given stride.
    pub fn vertex_binding(mut self, binding: u32, stride: u32) -> Self {
        self.bindings.push(
            vk::VertexInputBindingDescription::default()
                .binding(binding)
                .stride(stride)
                .input_rate(vk::VertexInputRate::VERTEX),
        );
        self
    }

    pub fn vertex_attribute(
        mut self,
        location: u32,
        binding: u32,
        format: vk::Format,
        offset: u32,
    ) -> Self {
        self.attributes.push(
            vk::VertexInputAttributeDescription::default()
                .location(location)
                .binding(binding)
                .format(format)
                .offset(offset),
        );
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn push_constant_range(mut self, stages: vk::ShaderStageFlags, offset: u32, size: u32) -> Self {
        self.push_constant_ranges.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn render_pass(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = render_pass;
        self.subpass = subpass;
        self
    }

    pub fn build(self) -> Result<VulkanPipeline, GraphicsError> {
        let (Some(vertex), Some(fragment)) = (&self.vertex, &self.fragment) else {
            return Err(GraphicsError::InvalidParameter(
                "graphics pipeline needs a vertex and a fragment shader".to_string(),
            ));
        };
        if self.render_pass == vk::RenderPass::null() {
            return Err(GraphicsError::InvalidParameter(
                "graphics pipeline needs a render pass".to_string(),
            ));
        }

        let device = self.backend.device();
        let mut modules = ShaderModules {
            device,
            modules: Vec::new(),
        };
        let vertex_module = modules.create(&vertex.spirv)?;
        let fragment_module = modules.create(&fragment.spirv)?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex.entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(&fragment.entry_point),
        ];

        let layout_info =
            vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&self.push_constant_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreatePipelineLayout", e))?;

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.bindings)
            .vertex_attribute_descriptions(&self.attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(self.subpass);

        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(GraphicsError::ResourceCreationFailed(format!(
                    "Failed to create graphics pipeline: {:?}",
                    e
                )));
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            return Err(GraphicsError::Internal(
                "vkCreateGraphicsPipelines returned no pipeline".to_string(),
            ));
        };
        drop(modules);

        log::debug!("Created graphics pipeline {:?}", pipeline);
        Ok(VulkanPipeline {
            backend: self.backend,
            pipeline,
            layout,
        })
    }
}

/// A graphics pipeline and its layout, destroyed together.
pub struct VulkanPipeline {
    backend: Arc<VulkanBackend>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Pipeline for VulkanPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl std::fmt::Debug for VulkanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanPipeline")
            .field("pipeline", &self.pipeline)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        let device = self.backend.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    let y = f32(i32(index & 1u) * 2 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn test_compile_vertex_and_fragment() {
        let vs = ShaderCompiler::compile_wgsl(SHADER, ShaderStage::Vertex, "vs_main").unwrap();
        let fs = ShaderCompiler::compile_wgsl(SHADER, ShaderStage::Fragment, "fs_main").unwrap();
        assert_eq!(vs[0], SPIRV_MAGIC);
        assert_eq!(fs[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_entry_point_stage_must_match() {
        let err = ShaderCompiler::compile_wgsl(SHADER, ShaderStage::Fragment, "vs_main").unwrap_err();
        assert!(matches!(err, GraphicsError::ShaderCompilationFailed(_)));
        assert!(err.to_string().contains("vs_main"));
    }

    #[test]
    fn test_parse_error_reported() {
        let err =
            ShaderCompiler::compile_wgsl("fn broken( {", ShaderStage::Vertex, "main").unwrap_err();
        assert!(matches!(err, GraphicsError::ShaderCompilationFailed(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ShaderCompiler::load_wgsl_file(
            "/nonexistent/shader.wgsl",
            ShaderStage::Vertex,
            "vs_main",
        )
        .unwrap_err();
        assert!(err.to_string().contains("shader.wgsl"));
    }

    #[test]
    fn test_stage_flags() {
        assert_eq!(ShaderStage::Vertex.to_vk(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStage::Fragment.to_vk(), vk::ShaderStageFlags::FRAGMENT);
    }
}

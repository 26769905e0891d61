//! Direct3D 12 backend.

use std::ffi::c_void;
use std::mem::{self, ManuallyDrop};

use windows::core::{Interface, HSTRING, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_FEATURE_LEVEL_12_0};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject};
use windows::Win32::System::WindowsProgramming::INFINITE;
use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONERROR, MB_OK};

use super::{
    BufferId, BufferView, BuildInputs, Capabilities, Command, CommandListId, Device,
    DispatchRaysDesc, FenceValue, GeometryDesc, GpuAddress, ImageId, IndexFormat, PrebuildInfo,
    ResourceState, RootSignatureId, ShaderIdentifier, StateObjectDesc, StateObjectId,
};
use crate::pipeline::{HitGroupKind, RootParameter, RootSignatureLayout};
use crate::{Error, Result};

const BACK_BUFFER_COUNT: u32 = 2;
const OUTPUT_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;
const SHADER_MODEL_6_6: D3D_SHADER_MODEL = D3D_SHADER_MODEL(0x66);

pub fn message_box(title: &str, message: &str) {
    let title: HSTRING = title.into();
    let message: HSTRING = message.into();

    unsafe {
        MessageBoxW(None, &message, &title, MB_OK | MB_ICONERROR);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceOptions {
    pub validation: bool,
    pub warp: bool,
}

struct Image {
    resource: ID3D12Resource,
    width: u32,
    height: u32,
}

struct CommandList {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList4,
    open: bool,
    in_flight: Option<FenceValue>,
}

impl CommandList {
    fn new(device: &ID3D12Device5) -> Result<Self> {
        let (allocator, list) = unsafe {
            let allocator: ID3D12CommandAllocator = device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                .map_err(|e| Error::Submission(e.to_string()))?;
            let list: ID3D12GraphicsCommandList4 = device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
                .map_err(|e| Error::Submission(e.to_string()))?;

            (allocator, list)
        };

        Ok(Self {
            allocator,
            list,
            open: true,
            in_flight: None,
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            unsafe { self.list.Close() }.map_err(|e| Error::Submission(e.to_string()))?;
            self.open = false;
        }

        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.close()?;

        unsafe {
            self.allocator
                .Reset()
                .and_then(|_| self.list.Reset(&self.allocator, None))
        }
        .map_err(|e| Error::Submission(e.to_string()))?;

        self.open = true;
        self.in_flight = None;

        Ok(())
    }
}

pub struct D3d12Device {
    caps: Capabilities,
    device: ID3D12Device5,
    queue: ID3D12CommandQueue,
    swap_chain: IDXGISwapChain3,
    swap_chain_size: (u32, u32),
    fence: ID3D12Fence,
    fence_event: HANDLE,
    last_fence: u64,
    descriptor_heap: ID3D12DescriptorHeap,
    descriptor_increment: u32,
    rtv_heap: ID3D12DescriptorHeap,
    info_queue: Option<ID3D12InfoQueue>,
    buffers: Vec<Option<ID3D12Resource>>,
    images: Vec<Option<Image>>,
    root_signatures: Vec<ID3D12RootSignature>,
    state_objects: Vec<(ID3D12StateObject, ID3D12StateObjectProperties)>,
    lists: Vec<CommandList>,
    free_lists: Vec<CommandListId>,
    present_list: CommandList,
}

impl D3d12Device {
    pub fn new(hwnd: HWND, width: u32, height: u32, options: DeviceOptions) -> Result<Self> {
        let creation = |e: windows::core::Error| Error::DeviceCreation(e.to_string());

        if options.validation {
            enable_debug_layer();
        }

        let factory_flags = if options.validation {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            0
        };
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(factory_flags) }.map_err(creation)?;

        let adapter = select_adapter(&factory, options.warp)?;

        let mut device: Option<ID3D12Device5> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device) }
            .map_err(creation)?;
        let device =
            device.ok_or_else(|| Error::DeviceCreation("D3D12CreateDevice returned null".into()))?;

        check_features(&device)?;

        let info_queue = options
            .validation
            .then(|| device.cast::<ID3D12InfoQueue>().ok())
            .flatten();

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                ..Default::default()
            })
        }
        .map_err(creation)?;

        let swap_chain_desc = DXGI_SWAP_CHAIN_DESC1 {
            BufferCount: BACK_BUFFER_COUNT,
            Width: width,
            Height: height,
            Format: OUTPUT_FORMAT,
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };

        let swap_chain: IDXGISwapChain3 = unsafe {
            factory
                .CreateSwapChainForHwnd(&queue, hwnd, &swap_chain_desc, None, None)
                .and_then(|swap_chain| swap_chain.cast())
        }
        .map_err(creation)?;
        unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }.map_err(creation)?;

        let fence: ID3D12Fence =
            unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }.map_err(creation)?;
        let fence_event = unsafe { CreateEventA(None, false, false, None) }.map_err(creation)?;

        let caps = Capabilities::default();

        let descriptor_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                NumDescriptors: caps.descriptor_capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                NodeMask: 0,
            })
        }
        .map_err(creation)?;
        let descriptor_increment =
            unsafe { device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV) };

        // Only the clear pass needs an RTV; it is rewritten right before use
        let rtv_heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
                NumDescriptors: 1,
                ..Default::default()
            })
        }
        .map_err(creation)?;

        let present_list = CommandList::new(&device)?;

        Ok(Self {
            caps,
            device,
            queue,
            swap_chain,
            swap_chain_size: (width, height),
            fence,
            fence_event,
            last_fence: 0,
            descriptor_heap,
            descriptor_increment,
            rtv_heap,
            info_queue,
            buffers: Vec::new(),
            images: Vec::new(),
            root_signatures: Vec::new(),
            state_objects: Vec::new(),
            lists: Vec::new(),
            free_lists: Vec::new(),
            present_list,
        })
    }

    fn resource(&self, buffer: BufferId) -> Option<&ID3D12Resource> {
        self.buffers.get(buffer.0 as usize)?.as_ref()
    }

    fn image(&self, image: ImageId) -> Option<&Image> {
        self.images.get(image.0 as usize)?.as_ref()
    }

    fn descriptor_handle(&self, index: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        let start = unsafe { self.descriptor_heap.GetCPUDescriptorHandleForHeapStart() };

        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: start.ptr + (index * self.descriptor_increment) as usize,
        }
    }

    fn insert_buffer(&mut self, resource: ID3D12Resource) -> BufferId {
        self.buffers.push(Some(resource));

        BufferId(self.buffers.len() as u32 - 1)
    }

    fn committed_resource(
        &self,
        label: &str,
        heap: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        state: D3D12_RESOURCE_STATES,
    ) -> Result<ID3D12Resource> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: heap,
            ..Default::default()
        };

        let mut resource: Option<ID3D12Resource> = None;

        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                desc,
                state,
                None,
                &mut resource,
            )
        }
        .map_err(|e| Error::allocation(label, desc.Width, e))?;

        let resource =
            resource.ok_or_else(|| Error::allocation(label, desc.Width, "no resource returned"))?;

        unsafe { resource.SetName(&HSTRING::from(label)) }
            .map_err(|e| Error::allocation(label, desc.Width, e))?;

        Ok(resource)
    }

    fn signal(&mut self) -> Result<FenceValue> {
        self.last_fence += 1;

        unsafe { self.queue.Signal(&self.fence, self.last_fence) }
            .map_err(|e| Error::Submission(e.to_string()))?;

        Ok(FenceValue(self.last_fence))
    }

    /// Forwards queued debug-layer messages to the logger.
    fn drain_messages(&self) {
        let Some(info_queue) = &self.info_queue else {
            return;
        };

        unsafe {
            for index in 0..info_queue.GetNumStoredMessages() {
                let mut length = 0;

                if info_queue.GetMessage(index, None, &mut length).is_err() {
                    continue;
                }

                // D3D12_MESSAGE is followed by its description in the same block
                let mut storage = vec![0u64; (length + 7) / 8];
                let message = storage.as_mut_ptr() as *mut D3D12_MESSAGE;

                if info_queue
                    .GetMessage(index, Some(message), &mut length)
                    .is_err()
                {
                    continue;
                }

                let message = &*message;
                let description = std::slice::from_raw_parts(
                    message.pDescription as *const u8,
                    message.DescriptionByteLength.saturating_sub(1),
                );
                let description = String::from_utf8_lossy(description);

                match message.Severity {
                    D3D12_MESSAGE_SEVERITY_CORRUPTION => {
                        log::error!("[D3D12] [CORRUPTION] {description}")
                    }
                    D3D12_MESSAGE_SEVERITY_ERROR => log::error!("[D3D12] [ERROR] {description}"),
                    D3D12_MESSAGE_SEVERITY_WARNING => {
                        log::warn!("[D3D12] [WARNING] {description}")
                    }
                    D3D12_MESSAGE_SEVERITY_INFO => log::info!("[D3D12] [INFO] {description}"),
                    _ => log::debug!("[D3D12] [MESSAGE] {description}"),
                }
            }

            info_queue.ClearStoredMessages();
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.wait_for_fence(FenceValue(self.last_fence))
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        self.wait_idle()?;

        unsafe {
            self.swap_chain
                .ResizeBuffers(BACK_BUFFER_COUNT, width, height, DXGI_FORMAT_UNKNOWN, 0)
        }
        .map_err(|e| Error::Submission(e.to_string()))?;

        log::debug!("Resized swap chain to {width}x{height}");

        self.swap_chain_size = (width, height);

        Ok(())
    }

    fn record_native(&self, list: &ID3D12GraphicsCommandList4, command: Command) {
        unsafe {
            match command {
                Command::BuildAccelerationStructure(build) => {
                    let mut geometry = D3D12_RAYTRACING_GEOMETRY_DESC::default();
                    let inputs = native_inputs(&build.inputs, &mut geometry);

                    list.BuildRaytracingAccelerationStructure(
                        &D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
                            DestAccelerationStructureData: build.dest,
                            Inputs: inputs,
                            SourceAccelerationStructureData: 0,
                            ScratchAccelerationStructureData: build.scratch,
                        },
                        None,
                    );
                }
                Command::UavBarrier(buffer) => {
                    if let Some(resource) = self.resource(buffer) {
                        list.ResourceBarrier(&[uav_barrier(resource)]);
                    }
                }
                Command::BindDescriptorHeap => {
                    list.SetDescriptorHeaps(&[Some(self.descriptor_heap.clone())]);
                }
                Command::SetRootSignature(id) => {
                    if let Some(root_signature) = self.root_signatures.get(id.0 as usize) {
                        list.SetComputeRootSignature(root_signature);
                    }
                }
                Command::SetRootConstants {
                    parameter,
                    offset,
                    values,
                } => list.SetComputeRoot32BitConstants(
                    parameter,
                    values.len() as u32,
                    values.as_ptr() as *const c_void,
                    offset,
                ),
                Command::SetRootShaderResourceView { parameter, address } => {
                    list.SetComputeRootShaderResourceView(parameter, address)
                }
                Command::SetPipelineState(id) => {
                    if let Some((state_object, _)) = self.state_objects.get(id.0 as usize) {
                        list.SetPipelineState1(state_object);
                    }
                }
                Command::DispatchRays(desc) => list.DispatchRays(&native_dispatch(&desc)),
                Command::ClearImage { image, color } => {
                    let Some(image) = self.image(image) else {
                        return;
                    };

                    let rtv = self.rtv_heap.GetCPUDescriptorHandleForHeapStart();
                    self.device.CreateRenderTargetView(&image.resource, None, rtv);

                    list.ResourceBarrier(&[transition(
                        &image.resource,
                        D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                        D3D12_RESOURCE_STATE_RENDER_TARGET,
                    )]);
                    list.ClearRenderTargetView(rtv, color.as_ptr(), None);
                    list.ResourceBarrier(&[transition(
                        &image.resource,
                        D3D12_RESOURCE_STATE_RENDER_TARGET,
                        D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                    )]);
                }
            }
        }
    }
}

impl Drop for D3d12Device {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("Failed to drain the queue on shutdown: {err}");
        }

        unsafe {
            CloseHandle(self.fence_event);
        }
    }
}

impl Device for D3d12Device {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo {
        let mut geometry = D3D12_RAYTRACING_GEOMETRY_DESC::default();
        let inputs = native_inputs(inputs, &mut geometry);
        let mut info = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();

        unsafe {
            self.device
                .GetRaytracingAccelerationStructurePrebuildInfo(&inputs, &mut info);
        }

        PrebuildInfo {
            result_size: info.ResultDataMaxSizeInBytes,
            scratch_size: info.ScratchDataSizeInBytes,
        }
    }

    fn create_upload_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferId> {
        let desc = buffer_desc(data.len() as u64, D3D12_RESOURCE_FLAG_NONE);
        let resource = self.committed_resource(
            label,
            D3D12_HEAP_TYPE_UPLOAD,
            &desc,
            D3D12_RESOURCE_STATE_GENERIC_READ,
        )?;

        unsafe {
            let mut mapped = std::ptr::null_mut();

            resource
                .Map(0, None, Some(&mut mapped))
                .map_err(|e| Error::allocation(label, desc.Width, e))?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped as *mut u8, data.len());
            resource.Unmap(0, None);
        }

        Ok(self.insert_buffer(resource))
    }

    fn create_uav_buffer(
        &mut self,
        label: &str,
        size: u64,
        state: ResourceState,
    ) -> Result<BufferId> {
        let desc = buffer_desc(size, D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS);
        let state = match state {
            ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
            ResourceState::AccelerationStructure => {
                D3D12_RESOURCE_STATE_RAYTRACING_ACCELERATION_STRUCTURE
            }
        };

        let resource = self.committed_resource(label, D3D12_HEAP_TYPE_DEFAULT, &desc, state)?;

        Ok(self.insert_buffer(resource))
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            *slot = None;
        }
    }

    fn buffer_address(&self, buffer: BufferId) -> GpuAddress {
        self.resource(buffer)
            .map_or(0, |resource| unsafe { resource.GetGPUVirtualAddress() })
    }

    fn buffer_size(&self, buffer: BufferId) -> u64 {
        self.resource(buffer)
            .map_or(0, |resource| unsafe { resource.GetDesc() }.Width)
    }

    fn create_buffer_view(&mut self, buffer: BufferId, view: BufferView) -> Result<()> {
        let resource = self
            .resource(buffer)
            .ok_or_else(|| Error::allocation("SRV", 0, format!("unknown buffer {buffer:?}")))?;

        let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT_UNKNOWN,
            ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Buffer: D3D12_BUFFER_SRV {
                    FirstElement: 0,
                    NumElements: view.count,
                    StructureByteStride: view.stride,
                    Flags: D3D12_BUFFER_SRV_FLAG_NONE,
                },
            },
        };

        unsafe {
            self.device.CreateShaderResourceView(
                resource,
                Some(&desc),
                self.descriptor_handle(view.descriptor),
            );
        }

        Ok(())
    }

    fn create_output_image(
        &mut self,
        width: u32,
        height: u32,
        uav_descriptor: u32,
    ) -> Result<ImageId> {
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Width: width as u64,
            Height: height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: OUTPUT_FORMAT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
                | D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET,
            ..Default::default()
        };

        let resource = self.committed_resource(
            "RenderTarget",
            D3D12_HEAP_TYPE_DEFAULT,
            &desc,
            D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        )?;

        let uav = D3D12_UNORDERED_ACCESS_VIEW_DESC {
            Format: OUTPUT_FORMAT,
            ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
            Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_UAV {
                    MipSlice: 0,
                    PlaneSlice: 0,
                },
            },
        };

        unsafe {
            self.device.CreateUnorderedAccessView(
                &resource,
                None,
                Some(&uav),
                self.descriptor_handle(uav_descriptor),
            );
        }

        self.images.push(Some(Image {
            resource,
            width,
            height,
        }));

        Ok(ImageId(self.images.len() as u32 - 1))
    }

    fn release_image(&mut self, image: ImageId) {
        if let Some(slot) = self.images.get_mut(image.0 as usize) {
            *slot = None;
        }
    }

    fn create_root_signature(&mut self, layout: &RootSignatureLayout) -> Result<RootSignatureId> {
        let parameters: Vec<_> = layout
            .parameters
            .iter()
            .map(|parameter| match *parameter {
                RootParameter::Constants {
                    register,
                    space,
                    count,
                } => D3D12_ROOT_PARAMETER1 {
                    ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
                    Anonymous: D3D12_ROOT_PARAMETER1_0 {
                        Constants: D3D12_ROOT_CONSTANTS {
                            ShaderRegister: register,
                            RegisterSpace: space,
                            Num32BitValues: count,
                        },
                    },
                    ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
                },
                RootParameter::ShaderResourceView { register, space } => D3D12_ROOT_PARAMETER1 {
                    ParameterType: D3D12_ROOT_PARAMETER_TYPE_SRV,
                    Anonymous: D3D12_ROOT_PARAMETER1_0 {
                        Descriptor: D3D12_ROOT_DESCRIPTOR1 {
                            ShaderRegister: register,
                            RegisterSpace: space,
                            Flags: D3D12_ROOT_DESCRIPTOR_FLAG_NONE,
                        },
                    },
                    ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
                },
            })
            .collect();

        let samplers: Vec<_> = layout
            .static_samplers
            .iter()
            .map(|sampler| D3D12_STATIC_SAMPLER_DESC {
                Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
                AddressV: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
                AddressW: D3D12_TEXTURE_ADDRESS_MODE_WRAP,
                MipLODBias: 0.0,
                MaxAnisotropy: 0,
                ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
                BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
                MinLOD: 0.0,
                MaxLOD: D3D12_FLOAT32_MAX,
                ShaderRegister: sampler.register,
                RegisterSpace: sampler.space,
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            })
            .collect();

        let flags = if layout.directly_indexed {
            D3D12_ROOT_SIGNATURE_FLAG_CBV_SRV_UAV_HEAP_DIRECTLY_INDEXED
        } else {
            D3D12_ROOT_SIGNATURE_FLAG_NONE
        };

        let desc = D3D12_VERSIONED_ROOT_SIGNATURE_DESC {
            Version: D3D_ROOT_SIGNATURE_VERSION_1_1,
            Anonymous: D3D12_VERSIONED_ROOT_SIGNATURE_DESC_0 {
                Desc_1_1: D3D12_ROOT_SIGNATURE_DESC1 {
                    NumParameters: parameters.len() as u32,
                    pParameters: parameters.as_ptr(),
                    NumStaticSamplers: samplers.len() as u32,
                    pStaticSamplers: samplers.as_ptr(),
                    Flags: flags,
                },
            },
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut error_blob: Option<ID3DBlob> = None;

        let serialized = unsafe {
            D3D12SerializeVersionedRootSignature(&desc, &mut blob, Some(&mut error_blob))
        };

        let blob = match (serialized, blob) {
            (Ok(()), Some(blob)) => blob,
            _ => {
                let text = error_blob.map(|blob| unsafe { blob_text(&blob) });
                return Err(Error::RootSignatureSerialization(text));
            }
        };

        let root_signature: ID3D12RootSignature = unsafe {
            let bytes = std::slice::from_raw_parts(
                blob.GetBufferPointer() as *const u8,
                blob.GetBufferSize(),
            );

            self.device.CreateRootSignature(0, bytes)
        }
        .map_err(|e| Error::RootSignatureCreation(e.to_string()))?;

        self.root_signatures.push(root_signature);

        Ok(RootSignatureId(self.root_signatures.len() as u32 - 1))
    }

    fn create_state_object(&mut self, desc: &StateObjectDesc<'_>) -> Result<StateObjectId> {
        let root_signature = self
            .root_signatures
            .get(desc.root_signature.0 as usize)
            .ok_or_else(|| Error::RootSignatureCreation(format!("{:?}", desc.root_signature)))?;

        let library = D3D12_DXIL_LIBRARY_DESC {
            DXILLibrary: D3D12_SHADER_BYTECODE {
                pShaderBytecode: desc.library.as_ptr() as *const c_void,
                BytecodeLength: desc.library.len(),
            },
            // No explicit exports: everything in the library is exported
            NumExports: 0,
            pExports: std::ptr::null_mut(),
        };

        // Wide strings referenced by the hit-group subobjects
        let names: Vec<[Option<Vec<u16>>; 4]> = desc
            .hit_groups
            .iter()
            .map(|group| {
                [
                    Some(&group.export),
                    group.any_hit.as_ref(),
                    group.closest_hit.as_ref(),
                    group.intersection.as_ref(),
                ]
                .map(|name| name.filter(|name| !name.is_empty()).map(|name| wide(name)))
            })
            .collect();

        let hit_groups: Vec<_> = desc
            .hit_groups
            .iter()
            .zip(&names)
            .map(|(group, [export, any_hit, closest_hit, intersection])| D3D12_HIT_GROUP_DESC {
                HitGroupExport: pcwstr(export),
                Type: match group.kind {
                    HitGroupKind::Triangles => D3D12_HIT_GROUP_TYPE_TRIANGLES,
                    HitGroupKind::Procedural => D3D12_HIT_GROUP_TYPE_PROCEDURAL_PRIMITIVE,
                },
                AnyHitShaderImport: pcwstr(any_hit),
                ClosestHitShaderImport: pcwstr(closest_hit),
                IntersectionShaderImport: pcwstr(intersection),
            })
            .collect();

        let shader_config = D3D12_RAYTRACING_SHADER_CONFIG {
            MaxPayloadSizeInBytes: desc.payload_size,
            MaxAttributeSizeInBytes: desc.attribute_size,
        };

        // Borrowed reference; the subobject must not release it
        let global_root_signature = ManuallyDrop::new(D3D12_GLOBAL_ROOT_SIGNATURE {
            pGlobalRootSignature: unsafe { mem::transmute_copy(root_signature) },
        });

        let pipeline_config = D3D12_RAYTRACING_PIPELINE_CONFIG {
            MaxTraceRecursionDepth: desc.max_recursion_depth,
        };

        let mut subobjects = vec![subobject(
            D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY,
            &library,
        )];
        subobjects.extend(
            hit_groups
                .iter()
                .map(|group| subobject(D3D12_STATE_SUBOBJECT_TYPE_HIT_GROUP, group)),
        );
        subobjects.push(subobject(
            D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_SHADER_CONFIG,
            &shader_config,
        ));
        subobjects.push(subobject(
            D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
            &*global_root_signature,
        ));
        subobjects.push(subobject(
            D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_PIPELINE_CONFIG,
            &pipeline_config,
        ));

        let state_object: ID3D12StateObject = unsafe {
            self.device.CreateStateObject(&D3D12_STATE_OBJECT_DESC {
                Type: D3D12_STATE_OBJECT_TYPE_RAYTRACING_PIPELINE,
                NumSubobjects: subobjects.len() as u32,
                pSubobjects: subobjects.as_ptr(),
            })
        }
        .map_err(|e| Error::StateObjectCreation(e.code().0 as u32))?;

        let properties: ID3D12StateObjectProperties = state_object
            .cast()
            .map_err(|e| Error::StateObjectCreation(e.code().0 as u32))?;

        self.state_objects.push((state_object, properties));

        Ok(StateObjectId(self.state_objects.len() as u32 - 1))
    }

    fn shader_identifier(
        &self,
        state_object: StateObjectId,
        export: &str,
    ) -> Option<ShaderIdentifier> {
        let (_, properties) = self.state_objects.get(state_object.0 as usize)?;

        let identifier = unsafe { properties.GetShaderIdentifier(&HSTRING::from(export)) };

        if identifier.is_null() {
            return None;
        }

        let size = self.caps.shader_identifier_size as usize;
        let bytes = unsafe { std::slice::from_raw_parts(identifier as *const u8, size) };

        Some(ShaderIdentifier(bytes.to_vec()))
    }

    fn create_command_list(&mut self) -> Result<CommandListId> {
        if let Some(list) = self.free_lists.pop() {
            match self.reset_command_list(list) {
                Ok(()) => return Ok(list),
                Err(err) => {
                    self.free_lists.push(list);
                    log::debug!("Pooled command list {list:?} not reusable yet: {err}");
                }
            }
        }

        self.lists.push(CommandList::new(&self.device)?);

        Ok(CommandListId(self.lists.len() as u32 - 1))
    }

    fn reset_command_list(&mut self, list: CommandListId) -> Result<()> {
        let completed = FenceValue(unsafe { self.fence.GetCompletedValue() });
        let entry = self
            .lists
            .get_mut(list.0 as usize)
            .ok_or_else(|| Error::Submission(format!("unknown command list {list:?}")))?;

        if entry.in_flight.map_or(false, |fence| fence > completed) {
            return Err(Error::Submission(format!(
                "command list {list:?} reset while still in flight"
            )));
        }

        entry.reset()
    }

    fn release_command_list(&mut self, list: CommandListId) {
        if (list.0 as usize) < self.lists.len() && !self.free_lists.contains(&list) {
            self.free_lists.push(list);
        }
    }

    fn record(&mut self, list: CommandListId, command: Command) -> Result<()> {
        let entry = self
            .lists
            .get(list.0 as usize)
            .filter(|_| !self.free_lists.contains(&list))
            .ok_or_else(|| Error::Submission(format!("recording into unknown command list {list:?}")))?;

        if !entry.open {
            return Err(Error::Submission(format!(
                "recording into closed command list {list:?}"
            )));
        }

        log::trace!("{list:?}: {command:?}");

        self.record_native(&entry.list, command);

        Ok(())
    }

    fn submit(&mut self, lists: &[CommandListId]) -> Result<FenceValue> {
        let mut native = Vec::with_capacity(lists.len());

        for list in lists {
            let entry = self
                .lists
                .get_mut(list.0 as usize)
                .ok_or_else(|| Error::Submission(format!("unknown command list {list:?}")))?;

            entry.close()?;
            native.push(Some(
                entry
                    .list
                    .cast::<ID3D12CommandList>()
                    .map_err(|e| Error::Submission(e.to_string()))?,
            ));
        }

        unsafe { self.queue.ExecuteCommandLists(&native) };

        let fence = self.signal()?;

        for list in lists {
            if let Some(entry) = self.lists.get_mut(list.0 as usize) {
                entry.in_flight = Some(fence);
            }
        }

        self.drain_messages();

        Ok(fence)
    }

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        if self.is_fence_complete(fence) {
            return Ok(());
        }

        unsafe {
            self.fence
                .SetEventOnCompletion(fence.0, self.fence_event)
                .map_err(|e| Error::Submission(e.to_string()))?;
            WaitForSingleObject(self.fence_event, INFINITE);
        }

        self.drain_messages();

        Ok(())
    }

    fn is_fence_complete(&self, fence: FenceValue) -> bool {
        unsafe { self.fence.GetCompletedValue() } >= fence.0
    }

    fn last_submitted_fence(&self) -> FenceValue {
        FenceValue(self.last_fence)
    }

    /// Copies `image` into the current back buffer and presents it.
    fn present(&mut self, image: ImageId) -> Result<()> {
        let (width, height) = self
            .image(image)
            .map(|image| (image.width, image.height))
            .ok_or_else(|| Error::Submission(format!("presenting released image {image:?}")))?;

        if (width, height) != self.swap_chain_size {
            self.resize_swap_chain(width, height)?;
        }

        if let Some(fence) = self.present_list.in_flight {
            self.wait_for_fence(fence)?;
        }

        self.present_list.reset()?;

        let submission = |e: windows::core::Error| Error::Submission(e.to_string());

        unsafe {
            let index = self.swap_chain.GetCurrentBackBufferIndex();
            let back_buffer: ID3D12Resource = self.swap_chain.GetBuffer(index).map_err(submission)?;

            let Some(image) = self.image(image) else {
                return Ok(());
            };

            let list = &self.present_list.list;

            list.ResourceBarrier(&[
                transition(
                    &image.resource,
                    D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                    D3D12_RESOURCE_STATE_COPY_SOURCE,
                ),
                transition(
                    &back_buffer,
                    D3D12_RESOURCE_STATE_PRESENT,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                ),
            ]);
            list.CopyResource(&back_buffer, &image.resource);
            list.ResourceBarrier(&[
                transition(
                    &image.resource,
                    D3D12_RESOURCE_STATE_COPY_SOURCE,
                    D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                ),
                transition(
                    &back_buffer,
                    D3D12_RESOURCE_STATE_COPY_DEST,
                    D3D12_RESOURCE_STATE_PRESENT,
                ),
            ]);
        }

        self.present_list.close()?;

        let list = self
            .present_list
            .list
            .cast::<ID3D12CommandList>()
            .map_err(submission)?;

        unsafe {
            self.queue.ExecuteCommandLists(&[Some(list)]);
            self.swap_chain.Present(1, 0).ok().map_err(submission)?;
        }

        self.present_list.in_flight = Some(self.signal()?);
        self.drain_messages();

        Ok(())
    }
}

fn enable_debug_layer() {
    let mut debug: Option<ID3D12Debug1> = None;

    match unsafe { D3D12GetDebugInterface(&mut debug) } {
        Ok(()) => {
            if let Some(debug) = debug {
                unsafe {
                    debug.EnableDebugLayer();
                    debug.SetEnableGPUBasedValidation(true);
                }

                log::info!("Enabled the D3D12 debug layer");
            }
        }
        Err(err) => log::warn!("D3D12 debug layer unavailable: {err}"),
    }
}

/// The hardware adapter with the most dedicated memory that can create a
/// 12_0 device, or WARP when asked for.
fn select_adapter(factory: &IDXGIFactory4, warp: bool) -> Result<IDXGIAdapter1> {
    if warp {
        log::info!("Using the WARP adapter");

        return unsafe { factory.EnumWarpAdapter() }
            .map_err(|e| Error::DeviceCreation(e.to_string()));
    }

    let mut best: Option<(IDXGIAdapter1, DXGI_ADAPTER_DESC1)> = None;

    for index in 0.. {
        let Ok(adapter) = (unsafe { factory.EnumAdapters1(index) }) else {
            break;
        };

        let Ok(desc) = (unsafe { adapter.GetDesc1() }) else {
            continue;
        };

        if (DXGI_ADAPTER_FLAG(desc.Flags as i32) & DXGI_ADAPTER_FLAG_SOFTWARE)
            != DXGI_ADAPTER_FLAG_NONE
        {
            continue;
        }

        let supported = unsafe {
            D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL_12_0,
                std::ptr::null_mut::<Option<ID3D12Device>>(),
            )
        }
        .is_ok();

        let better = best.as_ref().map_or(true, |(_, current)| {
            desc.DedicatedVideoMemory > current.DedicatedVideoMemory
        });

        if supported && better {
            best = Some((adapter, desc));
        }
    }

    let (adapter, desc) = best.ok_or_else(|| {
        Error::DeviceCreation("no hardware adapter supports feature level 12_0".into())
    })?;

    let name = String::from_utf16_lossy(&desc.Description);
    log::info!(
        "Using adapter `{}` ({} MiB dedicated memory)",
        name.trim_end_matches('\0'),
        desc.DedicatedVideoMemory / (1024 * 1024)
    );

    Ok(adapter)
}

fn check_features(device: &ID3D12Device5) -> Result<()> {
    let mut shader_model = D3D12_FEATURE_DATA_SHADER_MODEL {
        HighestShaderModel: SHADER_MODEL_6_6,
    };

    let supported = unsafe {
        device.CheckFeatureSupport(
            D3D12_FEATURE_SHADER_MODEL,
            &mut shader_model as *mut _ as *mut c_void,
            mem::size_of::<D3D12_FEATURE_DATA_SHADER_MODEL>() as u32,
        )
    };

    if supported.is_err() || shader_model.HighestShaderModel.0 < SHADER_MODEL_6_6.0 {
        return Err(Error::Unsupported("shader model 6.6".into()));
    }

    let mut options = D3D12_FEATURE_DATA_D3D12_OPTIONS5::default();

    let supported = unsafe {
        device.CheckFeatureSupport(
            D3D12_FEATURE_D3D12_OPTIONS5,
            &mut options as *mut _ as *mut c_void,
            mem::size_of::<D3D12_FEATURE_DATA_D3D12_OPTIONS5>() as u32,
        )
    };

    if supported.is_err() || options.RaytracingTier.0 < D3D12_RAYTRACING_TIER_1_0.0 {
        return Err(Error::Unsupported("raytracing tier 1.0".into()));
    }

    Ok(())
}

fn buffer_desc(size: u64, flags: D3D12_RESOURCE_FLAGS) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0,
        Width: size.max(1),
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: DXGI_FORMAT_UNKNOWN,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: flags,
    }
}

/// `geometry` must outlive every use of the returned inputs.
fn native_inputs(
    inputs: &BuildInputs,
    geometry: &mut D3D12_RAYTRACING_GEOMETRY_DESC,
) -> D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
    match *inputs {
        BuildInputs::TopLevel {
            instance_count,
            instance_descs,
        } => D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
            Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
            Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
            NumDescs: instance_count,
            DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
            Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                InstanceDescs: instance_descs,
            },
        },
        BuildInputs::BottomLevel(desc) => {
            *geometry = native_geometry(&desc);

            D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
                Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
                NumDescs: 1,
                DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                    pGeometryDescs: geometry,
                },
            }
        }
    }
}

fn native_geometry(desc: &GeometryDesc) -> D3D12_RAYTRACING_GEOMETRY_DESC {
    match *desc {
        GeometryDesc::Triangles {
            vertex_buffer,
            vertex_count,
            vertex_stride,
            index_buffer,
            index_count,
            index_format,
            flags,
        } => D3D12_RAYTRACING_GEOMETRY_DESC {
            Type: D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES,
            Flags: D3D12_RAYTRACING_GEOMETRY_FLAGS(flags.0 as _),
            Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
                Triangles: D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC {
                    Transform3x4: 0,
                    IndexFormat: match index_format {
                        IndexFormat::U16 => DXGI_FORMAT_R16_UINT,
                        IndexFormat::U32 => DXGI_FORMAT_R32_UINT,
                    },
                    VertexFormat: DXGI_FORMAT_R32G32B32_FLOAT,
                    IndexCount: index_count,
                    VertexCount: vertex_count,
                    IndexBuffer: index_buffer,
                    VertexBuffer: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                        StartAddress: vertex_buffer,
                        StrideInBytes: vertex_stride,
                    },
                },
            },
        },
        GeometryDesc::Aabbs {
            buffer,
            count,
            stride,
            flags,
        } => D3D12_RAYTRACING_GEOMETRY_DESC {
            Type: D3D12_RAYTRACING_GEOMETRY_TYPE_PROCEDURAL_PRIMITIVE_AABBS,
            Flags: D3D12_RAYTRACING_GEOMETRY_FLAGS(flags.0 as _),
            Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
                AABBs: D3D12_RAYTRACING_GEOMETRY_AABBS_DESC {
                    AABBCount: count,
                    AABBs: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                        StartAddress: buffer,
                        StrideInBytes: stride,
                    },
                },
            },
        },
    }
}

fn native_dispatch(desc: &DispatchRaysDesc) -> D3D12_DISPATCH_RAYS_DESC {
    let strided = |range: &super::GpuStridedRange| D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
        StartAddress: range.start,
        SizeInBytes: range.size,
        StrideInBytes: range.stride,
    };

    D3D12_DISPATCH_RAYS_DESC {
        RayGenerationShaderRecord: D3D12_GPU_VIRTUAL_ADDRESS_RANGE {
            StartAddress: desc.ray_generation.start,
            SizeInBytes: desc.ray_generation.size,
        },
        MissShaderTable: strided(&desc.miss),
        HitGroupTable: strided(&desc.hit_group),
        CallableShaderTable: Default::default(),
        Width: desc.width,
        Height: desc.height,
        Depth: desc.depth,
    }
}

fn transition(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn uav_barrier(resource: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                pResource: unsafe { mem::transmute_copy(resource) },
            }),
        },
    }
}

fn subobject<T>(kind: D3D12_STATE_SUBOBJECT_TYPE, desc: &T) -> D3D12_STATE_SUBOBJECT {
    D3D12_STATE_SUBOBJECT {
        Type: kind,
        pDesc: desc as *const T as *const c_void,
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(Some(0)).collect()
}

fn pcwstr(text: &Option<Vec<u16>>) -> PCWSTR {
    text.as_ref()
        .map_or(PCWSTR::null(), |text| PCWSTR(text.as_ptr()))
}

unsafe fn blob_text(blob: &ID3DBlob) -> String {
    let bytes =
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());

    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_owned()
}

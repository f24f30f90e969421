//! End-to-end compute tests against a real Vulkan device
//!
//! These tests require a Vulkan-capable GPU and are marked #[ignore] by
//! default. Run with: cargo test -- --ignored

use std::sync::Arc;

use vkcompute::{
    ComputeError, ConstantBlock, ImageDataType, ImageTiling, Manager, MemoryClass, Operation,
    SharedMemory, TensorDataType,
};

fn manager() -> Manager {
    env_logger::try_init().ok();
    Manager::new().expect("Vulkan manager should initialize")
}

fn tensor_bindings(tensors: &[&Arc<vkcompute::Tensor>]) -> Vec<SharedMemory> {
    tensors.iter().map(|t| SharedMemory::from((*t).clone())).collect()
}

#[test]
#[ignore]
fn test_element_wise_multiply() {
    let mut manager = manager();

    let a = manager.tensor(&[0.0f32, 1.0, 2.0], MemoryClass::Device).unwrap();
    let b = manager.tensor(&[1.0f32, 2.0, 3.0], MemoryClass::Device).unwrap();
    let out = manager.tensor(&[0.0f32; 3], MemoryClass::Device).unwrap();
    let bindings = tensor_bindings(&[&a, &b, &out]);

    let algorithm = manager
        .algorithm(
            bindings.clone(),
            vkcompute::shaders::OP_MULT_SPIRV,
            [3, 1, 1],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )
        .unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(bindings.clone()).unwrap())
        .unwrap();
    sequence
        .record(Operation::mult(bindings.clone(), algorithm).unwrap())
        .unwrap();
    sequence
        .record(Operation::sync_to_host(vec![out.clone().into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    assert_eq!(out.typed_vector::<f32>().unwrap(), vec![0.0, 2.0, 6.0]);
}

#[test]
#[ignore]
fn test_host_round_trip_through_device_tensor() {
    let mut manager = manager();

    let tensor = manager
        .tensor_raw(4, TensorDataType::F32, MemoryClass::Device)
        .unwrap();
    let payload = [9.0f32, 8.0, 7.0, 6.0];
    tensor.set_data(&payload).unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(vec![tensor.clone().into()]).unwrap())
        .unwrap();
    sequence
        .record(Operation::sync_to_host(vec![tensor.clone().into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    assert_eq!(tensor.typed_vector::<f32>().unwrap(), payload);
    assert_eq!(tensor.typed_data::<f32>().unwrap().as_ref(), payload.as_slice());
}

#[test]
#[ignore]
fn test_image_copy_three_by_three() {
    let mut manager = manager();

    let source_data: Vec<f32> = (0..9).map(|v| v as f32).collect();
    let source = manager
        .image(&source_data, 3, 3, 1, MemoryClass::Device, ImageTiling::Optimal)
        .unwrap();
    let dest = manager
        .image(&[0.0f32; 9], 3, 3, 1, MemoryClass::Device, ImageTiling::Optimal)
        .unwrap();

    let both: Vec<SharedMemory> = vec![source.clone().into(), dest.clone().into()];

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(both.clone()).unwrap())
        .unwrap();
    sequence
        .record(Operation::image_copy(both.clone()).unwrap())
        .unwrap();
    sequence
        .record(Operation::sync_to_host(both).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    assert_eq!(dest.typed_vector::<f32>().unwrap(), source_data);
    assert_eq!(dest.typed_data::<f32>().unwrap().as_ref(), source_data.as_slice());
    assert_eq!(source.typed_vector::<f32>().unwrap(), source_data);
}

#[test]
#[ignore]
fn test_image_to_tensor_to_image_round_trip() {
    let mut manager = manager();

    let source_data: Vec<f32> = (0..6).map(|v| v as f32 * 1.5).collect();
    let source = manager
        .image(&source_data, 3, 2, 1, MemoryClass::Device, ImageTiling::Optimal)
        .unwrap();
    let bridge = manager
        .tensor_raw(6, TensorDataType::F32, MemoryClass::Device)
        .unwrap();
    let dest = manager
        .image(&[0.0f32; 6], 3, 2, 1, MemoryClass::Device, ImageTiling::Optimal)
        .unwrap();

    let everything: Vec<SharedMemory> = vec![
        source.clone().into(),
        bridge.clone().into(),
        dest.clone().into(),
    ];

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(everything.clone()).unwrap())
        .unwrap();
    sequence
        .record(
            Operation::image_copy_to_tensor(vec![source.clone().into(), bridge.clone().into()])
                .unwrap(),
        )
        .unwrap();
    sequence
        .record(
            Operation::tensor_copy_to_image(vec![bridge.clone().into(), dest.clone().into()])
                .unwrap(),
        )
        .unwrap();
    sequence
        .record(Operation::sync_to_host(everything).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    assert_eq!(bridge.typed_vector::<f32>().unwrap(), source_data);
    assert_eq!(dest.typed_vector::<f32>().unwrap(), source_data);
}

#[test]
#[ignore]
fn test_through_storage_round_trip() {
    let mut manager = manager();

    let input = manager.tensor(&[9.0f32, 1.0, 3.0], MemoryClass::Device).unwrap();
    let storage = manager
        .tensor_raw(3, TensorDataType::F32, MemoryClass::Storage)
        .unwrap();
    let output = manager.tensor(&[0.0f32; 3], MemoryClass::Device).unwrap();

    let into_storage = manager
        .algorithm(
            tensor_bindings(&[&input, &storage]),
            vkcompute::shaders::OP_IDENTITY_SPIRV,
            [3, 1, 1],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )
        .unwrap();
    let out_of_storage = manager
        .algorithm(
            tensor_bindings(&[&storage, &output]),
            vkcompute::shaders::OP_IDENTITY_SPIRV,
            [3, 1, 1],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )
        .unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(tensor_bindings(&[&input, &output])).unwrap())
        .unwrap();
    sequence
        .record(Operation::algorithm_dispatch(into_storage, None))
        .unwrap();
    sequence
        .record(
            Operation::memory_barrier(
                vec![storage.clone().into()],
                ash::vk::AccessFlags::SHADER_WRITE,
                ash::vk::AccessFlags::SHADER_READ,
                ash::vk::PipelineStageFlags::COMPUTE_SHADER,
                ash::vk::PipelineStageFlags::COMPUTE_SHADER,
                vkcompute::BarrierTarget::Primary,
            )
            .unwrap(),
        )
        .unwrap();
    sequence
        .record(Operation::algorithm_dispatch(out_of_storage, None))
        .unwrap();
    sequence
        .record(Operation::sync_to_host(vec![output.clone().into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    assert_eq!(output.typed_vector::<f32>().unwrap(), vec![9.0, 1.0, 3.0]);
}

#[test]
#[ignore]
fn test_storage_memory_rejects_host_access() {
    let mut manager = manager();

    let storage = manager
        .tensor_raw(8, TensorDataType::F32, MemoryClass::Storage)
        .unwrap();

    assert!(matches!(
        storage.raw_data(),
        Err(ComputeError::HostAccessOnStorage)
    ));
    assert!(matches!(
        storage.typed_data::<f32>(),
        Err(ComputeError::HostAccessOnStorage)
    ));
    assert!(matches!(
        storage.set_raw_data(&[0u8; 32]),
        Err(ComputeError::HostAccessOnStorage)
    ));
}

#[test]
#[ignore]
fn test_device_tensor_geometry() {
    let mut manager = manager();

    let tensor = manager
        .tensor_raw(7, TensorDataType::F64, MemoryClass::Device)
        .unwrap();
    assert_eq!(tensor.size(), 7);
    assert_eq!(tensor.element_byte_size(), 8);
    assert_eq!(tensor.byte_size(), 56);
    assert!(tensor.is_initialized());

    // Rebuilding preserves geometry for the same element count.
    tensor.rebuild(None, 7).unwrap();
    assert_eq!(tensor.size(), 7);
    assert_eq!(tensor.element_byte_size(), 8);
}

#[test]
#[ignore]
fn test_invalid_tiling_for_host_image() {
    let mut manager = manager();

    let result = manager.image_raw(
        4,
        4,
        1,
        ImageDataType::F32,
        MemoryClass::Host,
        ImageTiling::Linear,
    );
    assert!(matches!(
        result,
        Err(ComputeError::InvalidTilingForMemoryClass { .. })
    ));
}

#[test]
#[ignore]
fn test_image_copy_requires_two_images() {
    let mut manager = manager();

    let only = manager
        .image_raw(
            2,
            2,
            1,
            ImageDataType::F32,
            MemoryClass::Device,
            ImageTiling::Optimal,
        )
        .unwrap();

    let result = Operation::image_copy(vec![only.into()]);
    assert!(matches!(
        result,
        Err(ComputeError::TooFewObjects {
            required: 2,
            actual: 1
        })
    ));
}

#[test]
#[ignore]
fn test_tensor_copy_propagates_host_mirrors() {
    let mut manager = manager();

    let source = manager.tensor(&[5.0f32, 6.0, 7.0], MemoryClass::Host).unwrap();
    let dest = manager.tensor(&[0.0f32; 3], MemoryClass::Host).unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence
        .eval_op(Operation::tensor_copy(tensor_bindings(&[&source, &dest])).unwrap())
        .unwrap();

    // post_eval mirrors the source into the destination host-side too.
    assert_eq!(dest.typed_vector::<f32>().unwrap(), vec![5.0, 6.0, 7.0]);
}

#[test]
#[ignore]
fn test_manager_clear_prunes_dropped_resources() {
    let mut manager = manager();

    let kept = manager.tensor(&[1.0f32, 2.0], MemoryClass::Host).unwrap();
    let dropped = manager.tensor(&[3.0f32, 4.0], MemoryClass::Host).unwrap();
    drop(dropped);

    manager.clear();

    // The surviving tensor is untouched by the prune.
    assert_eq!(kept.typed_vector::<f32>().unwrap(), vec![1.0, 2.0]);
}

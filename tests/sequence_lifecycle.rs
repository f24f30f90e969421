//! Sequence state machine and async lifecycle tests
//!
//! These tests require a Vulkan-capable GPU and are marked #[ignore] by
//! default. Run with: cargo test -- --ignored

use vkcompute::{
    ComputeError, ConstantBlock, Manager, MemoryClass, Operation, SharedMemory,
};

fn manager() -> Manager {
    env_logger::try_init().ok();
    Manager::new().expect("Vulkan manager should initialize")
}

#[test]
#[ignore]
fn test_record_outside_recording_fails() {
    let mut manager = manager();
    let tensor = manager.tensor(&[1.0f32], MemoryClass::Device).unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    let op = Operation::sync_to_device(vec![tensor.into()]).unwrap();

    assert!(matches!(
        sequence.record(op),
        Err(ComputeError::NotRecording)
    ));
    assert!(!sequence.is_recording());
}

#[test]
#[ignore]
fn test_eval_without_recording_fails() {
    let manager = manager();
    let mut sequence = manager.sequence(0, 0).unwrap();

    assert!(matches!(sequence.eval(), Err(ComputeError::NotRecorded)));
}

#[test]
#[ignore]
fn test_eval_after_clear_fails() {
    let mut manager = manager();
    let tensor = manager.tensor(&[1.0f32, 2.0], MemoryClass::Device).unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(vec![tensor.into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    sequence.clear().unwrap();

    // The command buffer is gone from the sequence's point of view until
    // a new batch is recorded.
    assert!(matches!(sequence.eval(), Err(ComputeError::NotRecorded)));
}

#[test]
#[ignore]
fn test_clear_requires_recorded_state() {
    let manager = manager();
    let mut sequence = manager.sequence(0, 0).unwrap();

    // Nothing recorded yet.
    assert!(matches!(sequence.clear(), Err(ComputeError::NotRecorded)));

    // Mid-recording the command buffer is still open; clear is refused so
    // the next begin never re-begins an un-ended buffer.
    sequence.begin().unwrap();
    assert!(matches!(sequence.clear(), Err(ComputeError::NotRecorded)));

    sequence.end().unwrap();
    sequence.clear().unwrap();
    assert!(matches!(sequence.eval(), Err(ComputeError::NotRecorded)));
}

#[test]
#[ignore]
fn test_repeated_eval_without_rerecording() {
    let mut manager = manager();
    let tensor = manager.tensor(&[2.0f32, 4.0], MemoryClass::Device).unwrap();

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
    sequence.eval().unwrap();

    assert_eq!(tensor.typed_vector::<f32>().unwrap(), vec![2.0, 4.0]);
}

#[test]
#[ignore]
fn test_fence_timeout_keeps_sequence_running() {
    let mut manager = manager();

    // A dispatch large enough that a zero-timeout await races it reliably.
    const N: usize = 65_535;
    let big = manager
        .tensor(&vec![1.0f32; N], MemoryClass::Device)
        .unwrap();
    let out = manager
        .tensor(&vec![0.0f32; N], MemoryClass::Device)
        .unwrap();
    let bindings: Vec<SharedMemory> = vec![big.clone().into(), out.clone().into()];

    let algorithm = manager
        .algorithm(
            bindings.clone(),
            vkcompute::shaders::OP_IDENTITY_SPIRV,
            [N as u32, 1, 1],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )
        .unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(bindings).unwrap())
        .unwrap();
    sequence
        .record(Operation::algorithm_dispatch(algorithm, None))
        .unwrap();
    sequence.end().unwrap();

    sequence.eval_async().unwrap();
    assert!(sequence.is_running());

    match sequence.eval_await(0) {
        Err(ComputeError::FenceTimeout) => {
            // Still running; a second unbounded await must succeed.
            assert!(sequence.is_running());
            sequence.eval_await(u64::MAX).unwrap();
        }
        Ok(()) => {
            // The device can legitimately win the race.
        }
        Err(other) => panic!("unexpected await failure: {}", other),
    }
    assert!(!sequence.is_running());
}

#[test]
#[ignore]
fn test_await_on_idle_sequence_is_immediate() {
    let manager = manager();
    let mut sequence = manager.sequence(0, 0).unwrap();

    // Nothing running: await returns success straight away.
    sequence.eval_await(0).unwrap();
}

#[test]
#[ignore]
fn test_double_submit_fails() {
    let mut manager = manager();
    let tensor = manager.tensor(&[1.0f32], MemoryClass::Device).unwrap();

    let mut sequence = manager.sequence(0, 0).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(vec![tensor.into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();

    sequence.eval_async().unwrap();
    let second = sequence.eval_async();
    assert!(matches!(
        second,
        Err(ComputeError::AlreadyRunning) | Ok(())
    ));

    sequence.eval_await(u64::MAX).unwrap();
}

#[test]
#[ignore]
fn test_rerecord_and_reeval() {
    let mut manager = manager();
    let tensor = manager.tensor(&[3.0f32, 5.0], MemoryClass::Device).unwrap();

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

    // Rebuild the tensor's GPU resources, then replay the stored batch
    // against the new handles.
    tensor.rebuild(None, 2).unwrap();
    tensor.set_data(&[7.0f32, 9.0]).unwrap();

    sequence.rerecord().unwrap();
    sequence.eval().unwrap();

    assert_eq!(tensor.typed_vector::<f32>().unwrap(), vec![7.0, 9.0]);
}

#[test]
#[ignore]
fn test_timestamps_captured_per_operation() {
    let mut manager = manager();
    let tensor = manager.tensor(&[1.0f32, 2.0], MemoryClass::Device).unwrap();

    let mut sequence = manager.sequence(0, 8).unwrap();
    sequence.begin().unwrap();
    sequence
        .record(Operation::sync_to_device(vec![tensor.clone().into()]).unwrap())
        .unwrap();
    sequence
        .record(Operation::sync_to_host(vec![tensor.clone().into()]).unwrap())
        .unwrap();
    sequence.end().unwrap();
    sequence.eval().unwrap();

    // One timestamp at batch start plus one per recorded operation.
    let timestamps = sequence.timestamps();
    assert_eq!(timestamps.len(), 3);
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
#[ignore]
fn test_sequences_on_every_queue() {
    let mut manager = manager();

    for queue_index in 0..manager.queue_count() {
        let tensor = manager.tensor(&[1.0f32], MemoryClass::Device).unwrap();
        let mut sequence = manager.sequence(queue_index, 0).unwrap();
        sequence
            .eval_op(Operation::sync_to_device(vec![tensor.into()]).unwrap())
            .unwrap();
    }

    assert!(manager.sequence(manager.queue_count(), 0).is_err());
}

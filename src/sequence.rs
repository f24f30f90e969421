//! Recordable, submittable operation batches
//!
//! A [`Sequence`] owns a command pool, one primary command buffer, a fence,
//! and (optionally) a timestamp query pool. Operations are recorded in
//! order and executed on the device in that order with no implicit
//! barriers between them; submission is synchronous (`eval`) or
//! asynchronous (`eval_async` + `eval_await`), with completion signalled
//! through the fence.
//!
//! The state machine is Created -> Recording <-> Recorded -> Running ->
//! Recorded. Mutating methods take `&mut self`: a sequence has exactly one
//! driver at a time, which is the crate's concurrency contract. Distinct
//! sequences on distinct queues can run from distinct threads.

use std::sync::Arc;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceState {
    Created,
    Recording,
    Recorded,
    Running,
}

pub struct Sequence {
    ctx: Arc<DeviceContext>,
    queue: vk::Queue,
    queue_index: usize,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    query_pool: vk::QueryPool,
    max_timestamps: u32,
    timestamps_written: u32,
    timestamps: Vec<u64>,
    operations: Vec<Operation>,
    state: SequenceState,
}

impl Sequence {
    pub(crate) fn new(
        ctx: Arc<DeviceContext>,
        queue_index: usize,
        max_timestamps: u32,
    ) -> Result<Self> {
        ctx.ensure_alive()?;

        let (queue, queue_family) = ctx.queue(queue_index)?;
        let device = ctx.device();

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| ctx.guard(e))?;

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(ctx.guard(e));
            }
        };

        let query_pool = if max_timestamps > 0 {
            let query_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(max_timestamps);
            match unsafe { device.create_query_pool(&query_info, None) } {
                Ok(pool) => pool,
                Err(e) => {
                    unsafe {
                        device.destroy_fence(fence, None);
                        device.destroy_command_pool(command_pool, None);
                    }
                    return Err(ctx.guard(e));
                }
            }
        } else {
            vk::QueryPool::null()
        };

        log::debug!(
            "Created sequence on queue {} ({} timestamps)",
            queue_index,
            max_timestamps
        );

        Ok(Self {
            ctx,
            queue,
            queue_index,
            command_pool,
            command_buffer: vk::CommandBuffer::null(),
            fence,
            query_pool,
            max_timestamps,
            timestamps_written: 0,
            timestamps: Vec::new(),
            operations: Vec::new(),
            state: SequenceState::Created,
        })
    }

    /// The compute queue index this sequence submits to.
    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    pub fn is_recording(&self) -> bool {
        self.state == SequenceState::Recording
    }

    pub fn is_running(&self) -> bool {
        self.state == SequenceState::Running
    }

    /// Starts a fresh recording batch. Valid from Created or Recorded; a
    /// begin from Recorded discards the previously recorded operations.
    pub fn begin(&mut self) -> Result<()> {
        self.ctx.ensure_alive()?;

        match self.state {
            SequenceState::Running => return Err(ComputeError::AlreadyRunning),
            SequenceState::Recording => {
                log::warn!("Sequence begin() called while already recording");
                return Ok(());
            }
            SequenceState::Created | SequenceState::Recorded => {}
        }

        if self.command_buffer == vk::CommandBuffer::null() {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { self.ctx.device().allocate_command_buffers(&alloc_info) }
                .map_err(|e| self.ctx.guard(e))?;
            self.command_buffer = buffers[0];
        }

        self.operations.clear();
        self.begin_command_buffer()?;
        self.state = SequenceState::Recording;
        Ok(())
    }

    /// Begins the command buffer (implicitly resetting it) and primes the
    /// timestamp query pool.
    fn begin_command_buffer(&mut self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default();

        unsafe {
            self.ctx
                .device()
                .begin_command_buffer(self.command_buffer, &begin_info)
        }
        .map_err(|e| self.ctx.guard(e))?;

        self.timestamps_written = 0;
        if self.query_pool != vk::QueryPool::null() {
            unsafe {
                self.ctx.device().cmd_reset_query_pool(
                    self.command_buffer,
                    self.query_pool,
                    0,
                    self.max_timestamps,
                );
                self.ctx.device().cmd_write_timestamp(
                    self.command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    self.query_pool,
                    0,
                );
            }
            self.timestamps_written = 1;
        }

        log::debug!("Sequence recording started");
        Ok(())
    }

    /// Records one operation: runs its host-side `pre_eval`, emits its
    /// commands, and appends it to the batch.
    pub fn record(&mut self, operation: Operation) -> Result<()> {
        if self.state != SequenceState::Recording {
            return Err(ComputeError::NotRecording);
        }

        operation.pre_eval(self.command_buffer)?;
        operation.record(self.command_buffer)?;
        self.write_operation_timestamp();
        self.operations.push(operation);
        Ok(())
    }

    fn write_operation_timestamp(&mut self) {
        if self.query_pool != vk::QueryPool::null() && self.timestamps_written < self.max_timestamps
        {
            unsafe {
                self.ctx.device().cmd_write_timestamp(
                    self.command_buffer,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    self.query_pool,
                    self.timestamps_written,
                );
            }
            self.timestamps_written += 1;
        }
    }

    /// Closes the recording batch.
    pub fn end(&mut self) -> Result<()> {
        if self.state != SequenceState::Recording {
            return Err(ComputeError::NotRecording);
        }

        unsafe { self.ctx.device().end_command_buffer(self.command_buffer) }
            .map_err(|e| self.ctx.guard(e))?;
        self.state = SequenceState::Recorded;
        log::debug!(
            "Sequence recording ended ({} operations)",
            self.operations.len()
        );
        Ok(())
    }

    /// Submits the recorded batch and blocks until the fence signals, then
    /// runs every operation's `post_eval` in recording order.
    pub fn eval(&mut self) -> Result<()> {
        self.eval_async()?;
        self.eval_await(u64::MAX)
    }

    /// Records a single operation as a fresh batch and evaluates it
    /// synchronously.
    pub fn eval_op(&mut self, operation: Operation) -> Result<()> {
        self.begin()?;
        self.record(operation)?;
        self.end()?;
        self.eval()
    }

    /// Submits the recorded batch and returns immediately; completion is
    /// claimed through [`Sequence::eval_await`].
    pub fn eval_async(&mut self) -> Result<()> {
        self.ctx.ensure_alive()?;

        match self.state {
            SequenceState::Running => return Err(ComputeError::AlreadyRunning),
            SequenceState::Recorded => {}
            _ => return Err(ComputeError::NotRecorded),
        }

        let device = self.ctx.device();
        unsafe { device.reset_fences(&[self.fence]) }.map_err(|e| self.ctx.guard(e))?;

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe { device.queue_submit(self.queue, &[submit_info], self.fence) }
            .map_err(|e| self.ctx.guard(e))?;

        self.state = SequenceState::Running;
        log::debug!(
            "Sequence submitted to queue {} ({} operations)",
            self.queue_index,
            self.operations.len()
        );
        Ok(())
    }

    /// Records a single operation as a fresh batch and submits it
    /// asynchronously.
    pub fn eval_async_op(&mut self, operation: Operation) -> Result<()> {
        self.begin()?;
        self.record(operation)?;
        self.end()?;
        self.eval_async()
    }

    /// Waits up to `timeout_ns` for the running batch. On success captures
    /// timestamps and runs `post_eval` hooks; on timeout the sequence stays
    /// Running and can be awaited again. Returns immediately when nothing
    /// is running.
    pub fn eval_await(&mut self, timeout_ns: u64) -> Result<()> {
        if self.state != SequenceState::Running {
            return Ok(());
        }

        let device = self.ctx.device();
        match unsafe { device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => return Err(ComputeError::FenceTimeout),
            Err(e) => return Err(self.ctx.guard(e)),
        }

        self.capture_timestamps()?;

        for operation in &self.operations {
            operation.post_eval(self.command_buffer)?;
        }

        self.state = SequenceState::Recorded;
        log::debug!("Sequence completed on queue {}", self.queue_index);
        Ok(())
    }

    fn capture_timestamps(&mut self) -> Result<()> {
        if self.query_pool == vk::QueryPool::null() || self.timestamps_written == 0 {
            return Ok(());
        }

        let mut values = vec![0u64; self.timestamps_written as usize];
        unsafe {
            self.ctx.device().get_query_pool_results::<u64>(
                self.query_pool,
                0,
                &mut values,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(|e| self.ctx.guard(e))?;

        self.timestamps = values;
        Ok(())
    }

    /// Raw timestamp counter values captured by the last successful eval:
    /// one at batch start plus one per recorded operation, up to the pool
    /// capacity.
    pub fn timestamps(&self) -> Vec<u64> {
        self.timestamps.clone()
    }

    /// Discards the recorded operations; the sequence must be re-recorded
    /// before the next eval. Valid only from the Recorded state: clearing
    /// mid-recording would leave the command buffer open with no matching
    /// end.
    pub fn clear(&mut self) -> Result<()> {
        if self.state == SequenceState::Running {
            return Err(ComputeError::AlreadyRunning);
        }
        if self.state != SequenceState::Recorded {
            return Err(ComputeError::NotRecorded);
        }
        self.operations.clear();
        self.state = SequenceState::Created;
        Ok(())
    }

    /// Resets the command buffer and re-records the stored operations in
    /// order. Useful after bindings were rebuilt underneath the batch.
    pub fn rerecord(&mut self) -> Result<()> {
        if self.state == SequenceState::Running {
            return Err(ComputeError::AlreadyRunning);
        }
        if self.command_buffer == vk::CommandBuffer::null() {
            return Err(ComputeError::NotRecorded);
        }

        log::debug!("Re-recording {} operations", self.operations.len());

        let operations = std::mem::take(&mut self.operations);
        self.begin_command_buffer()?;
        self.state = SequenceState::Recording;

        for operation in &operations {
            operation.pre_eval(self.command_buffer)?;
            operation.record(self.command_buffer)?;
            self.write_operation_timestamp();
        }

        self.operations = operations;
        self.end()
    }

    /// Consumes the sequence, releasing its GPU objects.
    pub fn destroy(self) {}
}

impl Drop for Sequence {
    fn drop(&mut self) {
        let device = self.ctx.device();

        // Let an in-flight submission drain before tearing down.
        if self.state == SequenceState::Running {
            log::warn!("Sequence dropped while running; waiting for fence");
            unsafe {
                device.wait_for_fences(&[self.fence], true, u64::MAX).ok();
            }
        }

        log::debug!("Destroying sequence on queue {}", self.queue_index);
        unsafe {
            if self.query_pool != vk::QueryPool::null() {
                device.destroy_query_pool(self.query_pool, None);
            }
            device.destroy_fence(self.fence, None);
            // Frees the command buffer with it.
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

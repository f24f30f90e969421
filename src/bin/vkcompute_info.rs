//! Device listing and smoke-test demo
//!
//! Prints the Vulkan devices visible to the runtime and, on request, runs
//! the embedded element-wise multiply shader end to end.

use std::ffi::CStr;

use clap::Parser;

use vkcompute::{ConstantBlock, Manager, ManagerConfig, MemoryClass, Operation, SharedMemory};

#[derive(Parser)]
#[command(name = "vkcompute-info", about = "Inspect Vulkan compute devices")]
struct Args {
    /// Physical device index to initialize on
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// List every visible physical device
    #[arg(long)]
    list: bool,

    /// Run the embedded multiply shader as a smoke test
    #[arg(long)]
    run_smoke: bool,
}

fn device_name(properties: &ash::vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut manager = Manager::with_config(ManagerConfig {
        physical_device_index: args.device,
        ..ManagerConfig::default()
    })?;

    let properties = manager.device_properties();
    println!(
        "Selected device {}: {} (Vulkan {}.{}.{})",
        args.device,
        device_name(&properties),
        ash::vk::api_version_major(properties.api_version),
        ash::vk::api_version_minor(properties.api_version),
        ash::vk::api_version_patch(properties.api_version),
    );
    println!("Compute queues: {}", manager.queue_count());

    if args.list {
        println!("\nAll visible devices:");
        for (index, props) in manager.list_devices()?.iter().enumerate() {
            println!("  [{}] {} ({:?})", index, device_name(props), props.device_type);
        }
    }

    if args.run_smoke {
        println!("\nRunning multiply smoke test...");

        let a = manager.tensor(&[0.0f32, 1.0, 2.0], MemoryClass::Device)?;
        let b = manager.tensor(&[1.0f32, 2.0, 3.0], MemoryClass::Device)?;
        let out = manager.tensor(&[0.0f32; 3], MemoryClass::Device)?;
        let bindings: Vec<SharedMemory> =
            vec![a.clone().into(), b.clone().into(), out.clone().into()];

        let algorithm = manager.algorithm(
            bindings.clone(),
            vkcompute::shaders::OP_MULT_SPIRV,
            [3, 1, 1],
            ConstantBlock::default(),
            ConstantBlock::default(),
        )?;

        let mut sequence = manager.sequence(0, 0)?;
        sequence.begin()?;
        sequence.record(Operation::sync_to_device(bindings.clone())?)?;
        sequence.record(Operation::algorithm_dispatch(algorithm, None))?;
        sequence.record(Operation::sync_to_host(vec![out.clone().into()])?)?;
        sequence.end()?;
        sequence.eval()?;

        let result = out.typed_vector::<f32>()?;
        println!("  [0, 1, 2] * [1, 2, 3] = {:?}", result);
        if result == [0.0, 2.0, 6.0] {
            println!("  OK");
        } else {
            println!("  MISMATCH (expected [0.0, 2.0, 6.0])");
        }
    }

    Ok(())
}

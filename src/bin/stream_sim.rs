//! Streaming simulator: drives the streaming cache headlessly over an asset directory.
//!
//! Usage: cargo run --release --bin stream_sim -- [OPTIONS]
//!
//! Options:
//!   --assets <DIR>      Asset directory (default: "assets/streamed")
//!   --generate <N>      Write N random textures into the asset directory first
//!   --config <FILE>     Streaming config JSON (default: built-in defaults)
//!   --frames <N>        Frames to simulate (default: 600)
//!   --visible <N>       Resources used per frame (default: 64)
//!   --seed <SEED>       Random seed for the camera walk (default: 12345)
//!   --wgpu              Upload to a real GPU device instead of the headless transfer
//!
//! Asset layout:
//!   <DIR>/<id:016x>/
//!     meta.json           # Resource metadata
//!     level_<mip>.lz4     # One compressed blob per mip, finest first

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rkstream::core::{logging, Error, ResourceId, Result};
use rkstream::streaming::{
    Binding, BindingPublisher, FileAssetResolver, GpuTransfer, HeadlessTransfer,
    RecordingPublisher, ResourceMeta, SamplerHandle, StreamingBackend, StreamingCache,
    StreamingConfig, ViewHandle, WgpuBindingPublisher, WgpuTransfer, write_resource,
};

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let assets = parse_str_arg(&args, "--assets").unwrap_or_else(|| "assets/streamed".to_string());
    let generate = parse_u64_arg(&args, "--generate");
    let config_path = parse_str_arg(&args, "--config").map(PathBuf::from);
    let frames = parse_u64_arg(&args, "--frames").unwrap_or(600);
    let visible = parse_u64_arg(&args, "--visible").unwrap_or(64);
    let seed = parse_u64_arg(&args, "--seed").unwrap_or(12345);
    let use_wgpu = args.iter().any(|a| a == "--wgpu");

    if let Err(e) = run(Path::new(&assets), generate, config_path, frames, visible, seed, use_wgpu) {
        log::error!("stream_sim failed: {}", e);
        std::process::exit(1);
    }
}

fn run(
    assets: &Path,
    generate: Option<u64>,
    config_path: Option<PathBuf>,
    frames: u64,
    visible: u64,
    seed: u64,
    use_wgpu: bool,
) -> Result<()> {
    if let Some(count) = generate {
        generate_assets(assets, count, seed)?;
    }
    let resource_count = count_resources(assets)?;
    if resource_count == 0 {
        log::warn!("No resources in {:?}; pass --generate <N> to create some", assets);
        return Ok(());
    }

    let config = match &config_path {
        Some(path) => StreamingConfig::load_sync(path)?,
        None => StreamingConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let mut device = None;
    let (gpu, publisher, fallback): (Arc<dyn GpuTransfer>, Arc<dyn BindingPublisher>, Binding) =
        if use_wgpu {
            let (wgpu_device, queue) = runtime.block_on(request_device())?;
            let transfer = Arc::new(WgpuTransfer::new(wgpu_device.clone(), queue.clone()));
            let fallback = transfer.create_fallback([255, 0, 255, 255])?;
            device = Some(Arc::clone(&transfer));
            let publisher = Arc::new(WgpuBindingPublisher::new(wgpu_device, queue));
            (transfer as Arc<dyn GpuTransfer>, publisher as Arc<dyn BindingPublisher>, fallback)
        } else {
            let fallback = Binding {
                view: ViewHandle(0),
                sampler: SamplerHandle(0),
            };
            let transfer = Arc::new(HeadlessTransfer::new());
            let publisher = Arc::new(RecordingPublisher::new());
            (transfer as Arc<dyn GpuTransfer>, publisher as Arc<dyn BindingPublisher>, fallback)
        };

    let backend = StreamingBackend {
        resolver: Arc::new(FileAssetResolver::new(assets)),
        gpu,
        publisher,
        fallback,
    };
    let cache = StreamingCache::new(config, backend, runtime.handle().clone())?;

    log::info!(
        "Simulating {} frames over {} resources ({} visible per frame)",
        frames, resource_count, visible
    );

    let start = Instant::now();
    let mut rng = seed.max(1);
    let mut window_start = 0u64;

    for frame in 0..frames {
        // Slide the visible window now and then, like a camera moving through a scene
        if frame % 30 == 0 {
            window_start = xorshift(&mut rng) % resource_count;
        }

        for i in 0..visible.min(resource_count) {
            let id = ResourceId::new((window_start + i) % resource_count);
            let slot = cache.request_slot(id);
            if slot.is_valid() {
                // Nearer resources want more detail
                let detail = (8u64.saturating_sub(i / 8)) as u8;
                cache.indicate_usage(slot, detail);
            }
        }

        if let Some(path) = &config_path {
            if frame > 0 && frame % 300 == 0 {
                if let Err(e) = cache.reload_config(path) {
                    log::warn!("Config reload failed: {}", e);
                }
            }
        }

        cache.process_start_of_frame();
        runtime.block_on(tokio::time::sleep(Duration::from_millis(2)));
        // Stands in for the render loop's per-frame device poll
        if let Some(transfer) = &device {
            transfer.poll_wait()?;
        }

        if frame % 100 == 0 {
            log_stats(&cache);
        }
    }

    if let Some(transfer) = &device {
        // Queued uploads only finish while the device is polled
        while cache.in_flight() > 0 {
            transfer.poll_wait()?;
            runtime.block_on(tokio::time::sleep(Duration::from_millis(1)));
        }
    }
    runtime.block_on(cache.flush());
    cache.enforce_budget(false);
    log_stats(&cache);
    log::info!(
        "Done in {:.2}s, {} binding publishes",
        start.elapsed().as_secs_f64(),
        cache.stats().publishes
    );
    Ok(())
}

async fn request_device() -> Result<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        })
        .await
        .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;
    log::info!("Using adapter: {}", adapter.get_info().name);

    adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("stream_sim_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::default(),
            experimental_features: Default::default(),
            trace: Default::default(),
        })
        .await
        .map_err(|e| Error::Gpu(format!("Failed to create device: {:?}", e)))
}

fn log_stats(cache: &StreamingCache) {
    let stats = cache.stats();
    log::info!(
        "frame {}: {} slots ({} in use, {} unused, {} free), {:.1}/{:.1} MB, {} loads, {} abandoned, {} starved",
        stats.frame,
        stats.slots.len,
        stats.slots.in_use,
        stats.slots.unused,
        stats.slots.free,
        stats.gpu_bytes_used as f64 / (1024.0 * 1024.0),
        stats.gpu_bytes_budget as f64 / (1024.0 * 1024.0),
        stats.loads_completed,
        stats.loads_abandoned,
        stats.starvations,
    );
}

/// Write `count` textures with ids `0..count`
fn generate_assets(root: &Path, count: u64, seed: u64) -> Result<()> {
    let mut rng = seed.max(1);
    for id in 0..count {
        let size = 1u32 << (4 + xorshift(&mut rng) % 6);
        let level_count = (32 - size.leading_zeros()) as u8;
        let meta = ResourceMeta::texture(size, size, level_count, 4);
        let levels = (0..level_count)
            .map(|mip| {
                let fill = xorshift(&mut rng) as u8;
                vec![fill; meta.level_size(mip) as usize]
            })
            .collect::<Vec<_>>();
        write_resource(root, ResourceId::new(id), &meta, &levels)?;
    }
    log::info!("Generated {} resources in {:?}", count, root);
    Ok(())
}

fn count_resources(root: &Path) -> Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in std::fs::read_dir(root)? {
        if entry?.path().join("meta.json").exists() {
            count += 1;
        }
    }
    Ok(count)
}

fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

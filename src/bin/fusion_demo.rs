//! Fuses a synthetic sphere capture for a few ticks and logs what comes out.
//!
//! Usage: `fusion_demo [--config path.toml] [--ticks N] [--cpu | --gpu]`

use anyhow::{bail, Context, Result};
use depth_fusion_engine::perspective::synthetic::SyntheticCapture;
use depth_fusion_engine::{BackendPreference, FusionConfig, GeneratorTree, SharedFrame, VolumetricMeshSource};
use std::path::PathBuf;

struct Args {
    config: Option<PathBuf>,
    ticks: u32,
    backend: Option<BackendPreference>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        ticks: 5,
        backend: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--ticks" => {
                args.ticks = iter
                    .next()
                    .context("--ticks needs a count")?
                    .parse()
                    .context("--ticks must be a number")?
            }
            "--cpu" => args.backend = Some(BackendPreference::Cpu),
            "--gpu" => args.backend = Some(BackendPreference::Gpu),
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,depth_fusion_engine=debug"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => FusionConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FusionConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    let capture = SyntheticCapture::sphere_ring(4, 64, 0.35)?;
    let frames = SharedFrame::new();

    let mut source = VolumetricMeshSource::new("sphere", config, frames.clone());
    source.set_table(capture.table);

    let mut tree = GeneratorTree::new();
    let events = tree.subscribe();
    let handle = tree.insert(source, None)?;

    for tick in 0..args.ticks {
        // A slowly shrinking sphere stands in for new video frames
        let radius = 0.35 - 0.01 * tick as f32;
        let mut frame = SyntheticCapture::sphere_ring(4, 64, radius)?;
        frame.add_depth_noise(0.002, tick as u64);
        frames.present(frame.frame);

        tree.tick()?;
        for event in events.try_iter() {
            log::debug!("[fusion_demo] {:?}", event);
        }

        let source = tree
            .node::<VolumetricMeshSource>(handle)
            .context("mesh source missing from tree")?;
        let count = source.triangle_count()?;
        let (draw, dispatch) = source.draw_args()?;
        log::info!(
            "[fusion_demo] tick {}: {} triangles, draw {:?}, dispatch {:?}, LOD {}/{}",
            tick,
            count,
            draw,
            dispatch,
            source.lod_level(),
            source.num_levels()
        );
    }

    let source = tree
        .node_mut::<VolumetricMeshSource>(handle)
        .context("mesh source missing from tree")?;
    let capacity = source.request_recalibration()?;
    log::info!("[fusion_demo] recalibrated triangle capacity: {}", capacity);
    Ok(())
}

//! Depth camera demo: synthetic acquisition, extrinsic calibration and a
//! freshness-logging consumer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use depthcam::calibration::{ExtrinsicsSource, TerminalPrompt};
use depthcam::capture::SyntheticSource;
use depthcam::{CameraSession, Config, StartupMode, StreamKind};

const LIVE_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("depthcam=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(path = ?config_path, mode = ?config.calibration.mode, "Depthcam launching");

    let extrinsics_source = match config.calibration.mode {
        StartupMode::Live => ExtrinsicsSource::Live(Arc::new(TerminalPrompt)),
        StartupMode::Load => ExtrinsicsSource::Load {
            translation: config.calibration.translation_path.clone(),
            rotation: config.calibration.rotation_path.clone(),
        },
        StartupMode::Image => ExtrinsicsSource::Image(config.calibration.image_path.clone()),
    };
    let attempts = if matches!(extrinsics_source, ExtrinsicsSource::Live(_)) {
        LIVE_ATTEMPTS
    } else {
        1
    };

    let mut session = CameraSession::new(Box::new(SyntheticSource::default()), config)?;
    session.start()?;

    let mut calibrated = None;
    for attempt in 1..=attempts {
        match tokio::task::block_in_place(|| session.calibrate(&extrinsics_source)) {
            Ok(extrinsics) => {
                calibrated = Some(extrinsics);
                break;
            }
            Err(failure) if failure.is_retryable() && attempt < attempts => {
                warn!(attempt, "{failure}; try again");
            }
            Err(failure) => {
                session.stop()?;
                return Err(failure.into());
            }
        }
    }
    if let Some(extrinsics) = &calibrated {
        info!(
            r = ?extrinsics.r.as_slice(),
            t = ?extrinsics.t.as_slice(),
            "Calibration complete"
        );
    }
    let color = session.config().capture.color;
    if let Some(p) = session.world_point_at(color.width / 2, color.height / 2) {
        info!(x = p.x, y = p.y, z = p.z, "World point at image center");
    }

    let buffer = session.buffer();
    let consumer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            for stream in StreamKind::ALL {
                match buffer.peek(stream, |f| (f.sequence(), f.timestamp.elapsed())) {
                    Some((sequence, age)) => info!(
                        %stream,
                        sequence,
                        age_ms = age.as_millis() as u64,
                        "Latest frame"
                    ),
                    None => info!(%stream, "No frame yet"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    consumer.abort();
    tokio::task::block_in_place(|| session.stop())?;
    Ok(())
}

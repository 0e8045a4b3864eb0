//! Script commands: run, play, packets, text.
//!
//! `packets` and `text` go through the real [`ImagiClient`] connected to the
//! in-memory loopback accessory, so the bytes printed are exactly what a
//! device would receive.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use super::read_source;
use crate::codec::{decode_packet, DecodedPacket, ScrollingTextOptions};
use crate::config::Config;
use crate::constants::SCROLL_STEP_DURATION_MS;
use crate::matrix::{colors, Pixel};
use crate::playback;
use crate::preview::{hex, render_matrix, LivePreview, PreviewStyle};
use crate::sandbox::{RunOutcome, Sandbox, SandboxConfig, ScriptError};
use crate::transport::loopback::{LoopbackCentral, LoopbackDevice};
use crate::transport::{Central, DeviceFilter, ImagiClient};

async fn run_script(config: &Config, path: &str) -> Result<RunOutcome> {
    let (_, code) = read_source(path)?;
    let sandbox = Arc::new(Sandbox::new(SandboxConfig::from(config)).await?);
    let result: Result<RunOutcome, ScriptError> =
        tokio::task::spawn_blocking(move || sandbox.run(&code))
            .await
            .map_err(|e| anyhow!("Script task failed: {e}"))?;

    let outcome = result.map_err(|e| anyhow!("{e}"))?;
    for line in &outcome.output {
        println!("{line}");
    }
    Ok(outcome)
}

/// Run a script and print its final frame.
pub async fn run(path: &str, style: PreviewStyle) -> Result<()> {
    let config = Config::load()?;
    let outcome = run_script(&config, path).await?;
    let Some(render) = outcome.last_render() else {
        bail!("No frames generated.");
    };
    if let Some(frame) = render.frames.last() {
        println!("{}", render_matrix(frame.snapshot(), style));
    }
    println!(
        "{} frame(s), loop {}, {} render call(s), {:.1}ms",
        render.frames.len(),
        render.loop_count,
        outcome.render_count,
        outcome.elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Run a script and animate it in the terminal until it ends or Ctrl-C.
pub async fn play(path: &str, style: PreviewStyle) -> Result<()> {
    let config = Config::load()?;
    let outcome = run_script(&config, path).await?;
    let render = outcome
        .into_last_render()
        .ok_or_else(|| anyhow!("No frames generated."))?;

    let total = render.frames.len();
    let mut preview = LivePreview::new(style);
    let handle = playback::start(&render, move |index, frame| {
        let status = format!("frame {}/{} ({}ms)", index + 1, total, frame.duration_ms());
        if let Err(e) = preview.draw(frame.snapshot(), &status) {
            log::warn!("Preview draw failed: {e}");
        }
    });

    let stop = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    handle.wait().await;
    Ok(())
}

fn loopback_client(config: &Config) -> (ImagiClient, Arc<LoopbackDevice>) {
    let device = LoopbackDevice::new(format!("{}-loopback", config.device_name_prefix));
    let central: Arc<dyn Central> = LoopbackCentral::new(Arc::clone(&device));
    let client = ImagiClient::with_filter(
        Some(central),
        DeviceFilter::with_prefix(config.device_name_prefix.clone()),
    );
    (client, device)
}

fn print_packets(device: &LoopbackDevice) {
    for packet in device.writes() {
        let label = match decode_packet(&packet) {
            Some(DecodedPacket::Frame { index, .. }) => format!("frame {index}"),
            Some(DecodedPacket::Footer {
                frame_count,
                loop_count,
            }) => format!("footer {frame_count} frame(s), loop {loop_count}"),
            Some(DecodedPacket::ScrollingText { .. }) => "text".to_string(),
            None => "unknown".to_string(),
        };
        println!("# {label} ({} bytes)", packet.len());
        println!("{}", hex(&packet));
    }
}

/// Run a script and print the packets sending it would write.
pub async fn packets(path: &str, indoor: bool) -> Result<()> {
    let config = Config::load()?;
    let outcome = run_script(&config, path).await?;
    let mut render = outcome
        .into_last_render()
        .ok_or_else(|| anyhow!("No frames generated."))?;
    if indoor {
        render.outdoor_mode = false;
    }

    let (client, device) = loopback_client(&config);
    client.connect().await?;
    client.send_render(&render).await?;
    client.disconnect().await;

    print_packets(&device);
    Ok(())
}

fn color_named(name: &str) -> Result<Pixel> {
    colors::NAMED
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, pixel)| *pixel)
        .ok_or_else(|| anyhow!("Unknown colour '{name}'"))
}

/// Options for [`text`], straight from the command line.
#[derive(Debug, Clone)]
pub struct TextArgs {
    /// Message to scroll.
    pub text: String,
    /// Text colour name.
    pub color: String,
    /// Background colour name.
    pub back: String,
    /// Per-step duration; defaults to the scroll step.
    pub duration_ms: Option<u32>,
    /// Times to scroll; 0 means forever.
    pub loop_count: u32,
    /// Use the indoor brightness profile.
    pub indoor: bool,
}

/// Print the scrolling-text packet for `args`.
pub async fn text(args: TextArgs) -> Result<()> {
    let config = Config::load()?;
    let opts = ScrollingTextOptions {
        text: args.text,
        text_color: color_named(&args.color)?,
        back_color: color_named(&args.back)?,
        duration_ms: args.duration_ms.unwrap_or(SCROLL_STEP_DURATION_MS),
        loop_count: args.loop_count,
        outdoor_mode: !args.indoor && config.outdoor_mode,
    };

    let (client, device) = loopback_client(&config);
    client.connect().await?;
    client.send_scrolling_text(&opts).await?;
    client.disconnect().await;

    print_packets(&device);
    Ok(())
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use canvas::{Canvas, CanvasListener, Color, ListenerError, Point, Rect, RgbaImage};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use recording::{Record, RecordingReader, RecordingWriter};
use session::{SessionClient, SessionConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod relay;

use relay::RelayCanvas;

#[derive(Parser, Debug)]
#[command(name = "pixrec", about = "Pixel-canvas live client and recorder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Follow the live canvas and log every pixel change
    Watch {
        #[arg(long, default_value = "https://pixelcanvas.io")]
        endpoint: String,
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Record live canvas events into recordings/<label>/
    Record {
        /// Label the recording directory is named after
        label: String,
        #[arg(long, default_value = "https://pixelcanvas.io")]
        endpoint: String,
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Print the header and records of a recording file
    Dump {
        file: PathBuf,
        /// Only count records per kind
        #[arg(long)]
        summary: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Watch {
            endpoint,
            fingerprint,
        } => watch(endpoint, fingerprint).await,
        Commands::Record {
            label,
            endpoint,
            fingerprint,
        } => record(label, endpoint, fingerprint).await,
        Commands::Dump { file, summary } => dump(&file, summary),
    }
}

fn session_config(endpoint: String, fingerprint: Option<String>) -> SessionConfig {
    let mut config = SessionConfig {
        base_url: endpoint,
        ..SessionConfig::default()
    };
    if let Some(fingerprint) = fingerprint {
        config.fingerprint = fingerprint;
    }
    config
}

async fn watch(endpoint: String, fingerprint: Option<String>) -> anyhow::Result<()> {
    let canvas = Arc::new(RelayCanvas::new());
    canvas.subscribe_listener(Arc::new(LogListener), false);

    let client = SessionClient::connect(session_config(endpoint, fingerprint), canvas);
    tokio::signal::ctrl_c()
        .await
        .context("can't listen for ctrl-c")?;
    client.shutdown().await;
    Ok(())
}

async fn record(
    label: String,
    endpoint: String,
    fingerprint: Option<String>,
) -> anyhow::Result<()> {
    let canvas = Arc::new(RelayCanvas::new());
    let writer = RecordingWriter::create(canvas.clone(), &label).context("can't start recording")?;
    info!(path = %writer.path().display(), "recording, stop with ctrl-c");

    let client = SessionClient::connect(session_config(endpoint, fingerprint), canvas);
    tokio::signal::ctrl_c()
        .await
        .context("can't listen for ctrl-c")?;
    client.shutdown().await;
    writer.close();
    Ok(())
}

fn dump(file: &Path, summary: bool) -> anyhow::Result<()> {
    let reader =
        RecordingReader::open(file).with_context(|| format!("can't open {}", file.display()))?;
    let header = reader.header.clone();

    println!(
        "recording of {} ({}x{} chunks, origin {},{})",
        format_nanos(header.created_at_nanos),
        header.chunk_width,
        header.chunk_height,
        header.origin_x,
        header.origin_y,
    );
    if let Some(label) = reader.label() {
        println!("label: {label}");
    }

    let mut counts: HashMap<&'static str, u64> = HashMap::new();
    for record in reader {
        let record = record.context("recording cut short")?;
        if summary {
            *counts.entry(record_kind(&record.record)).or_default() += 1;
            continue;
        }
        match record.record {
            Record::SetPixel { pos, r, g, b } => println!(
                "{} set pixel {},{} to #{r:02x}{g:02x}{b:02x}",
                format_nanos(record.time_nanos),
                pos.x,
                pos.y,
            ),
            Record::InvalidateRect { rect } => println!(
                "{} invalidate rect {},{} .. {},{}",
                format_nanos(record.time_nanos),
                rect.min.x,
                rect.min.y,
                rect.max.x,
                rect.max.y,
            ),
            Record::InvalidateAll => {
                println!("{} invalidate all", format_nanos(record.time_nanos))
            }
            Record::RevalidateRect { rect } => println!(
                "{} revalidate rect {},{} .. {},{}",
                format_nanos(record.time_nanos),
                rect.min.x,
                rect.min.y,
                rect.max.x,
                rect.max.y,
            ),
            Record::SetImage { origin, data } => println!(
                "{} set image at {},{} ({} bytes)",
                format_nanos(record.time_nanos),
                origin.x,
                origin.y,
                data.len(),
            ),
        }
    }

    if summary {
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort();
        for (kind, count) in counts {
            println!("{count:>10} {kind}");
        }
    }
    Ok(())
}

fn record_kind(record: &Record) -> &'static str {
    match record {
        Record::SetPixel { .. } => "set-pixel",
        Record::InvalidateRect { .. } => "invalidate-rect",
        Record::InvalidateAll => "invalidate-all",
        Record::RevalidateRect { .. } => "revalidate-rect",
        Record::SetImage { .. } => "set-image",
    }
}

fn format_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Logs pixel traffic instead of storing it; the listener behind `watch`.
struct LogListener;

impl CanvasListener for LogListener {
    fn handle_set_pixel(&self, pos: Point, color: Color, _vc_id: i32) -> Result<(), ListenerError> {
        let (r, g, b) = color.to_rgb8();
        info!(x = pos.x, y = pos.y, color = %format!("#{r:02x}{g:02x}{b:02x}"), "pixel");
        Ok(())
    }

    fn handle_invalidate_rect(&self, _rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        Ok(())
    }

    fn handle_invalidate_all(&self) -> Result<(), ListenerError> {
        info!("canvas invalidated");
        Ok(())
    }

    fn handle_revalidate_rect(&self, _rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        Ok(())
    }

    fn handle_signal_download(&self, _rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        Ok(())
    }

    fn handle_set_image(
        &self,
        _origin: Point,
        _image: &RgbaImage,
        _valid: bool,
        _vc_ids: &[i32],
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn handle_chunks_change(
        &self,
        _created: &HashMap<Rect, i32>,
        _removed: &HashMap<Rect, i32>,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    fn handle_set_time(&self, _time: DateTime<Utc>) -> Result<(), ListenerError> {
        Ok(())
    }
}

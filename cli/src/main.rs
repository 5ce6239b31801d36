use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use focus_core::{
    appearance::AppearanceMatcher,
    config::SessionConfig,
    detection::{detect_records, replay::ReplayDetector},
    pipeline::Session,
    rendering::Overlay,
    runtime::locate_embedding_model,
    video::{FrameSource, ImageSequence, ImageSequenceWriter, DEFAULT_FPS},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "focus-lock",
    version,
    about = "Keep one subject sharp while the rest of the frame is blurred",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Draw detection boxes and labels over every frame.
    Annotate {
        #[command(flatten)]
        input: InputArgs,

        /// Output directory for annotated frames
        #[arg(short, long, default_value = "annotated")]
        output: PathBuf,

        /// TrueType/OpenType font for "ID n 0.87" labels
        #[arg(long)]
        font: Option<PathBuf>,
    },

    /// Lock onto a subject and write focus-composited frames.
    Focus {
        #[command(flatten)]
        input: InputArgs,

        /// Output directory for composited frames
        #[arg(short, long, default_value = "focused")]
        output: PathBuf,

        /// Click position that selects the subject, as X,Y
        #[arg(long, value_parser = parse_point, conflicts_with = "reference")]
        click: Option<(i32, i32)>,

        /// Frame index the click applies to
        #[arg(long, default_value_t = 0, requires = "click")]
        at_frame: u64,

        /// Reference photo of the subject; locks automatically on first match
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Session configuration (JSON); flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Appearance embedding model (ONNX)
        #[arg(long)]
        embedder: Option<PathBuf>,

        /// Font for overlay labels
        #[arg(long)]
        font: Option<PathBuf>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Print sequence metadata and the appearance matcher that would be used.
    Inspect {
        /// Directory of frames
        #[arg(short, long)]
        frames: PathBuf,

        /// Detection track file (JSON)
        #[arg(short, long)]
        tracks: Option<PathBuf>,

        /// Appearance embedding model (ONNX)
        #[arg(long)]
        embedder: Option<PathBuf>,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Directory of frames, processed in file-name order
    #[arg(short, long)]
    frames: PathBuf,

    /// Detection track file (JSON) from an external detector/tracker
    #[arg(short, long)]
    tracks: PathBuf,

    /// Frame rate reported for the sequence
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: f64,
}

#[derive(Args, Default)]
struct ConfigOverrides {
    /// Enhance low-light footage before detection
    #[arg(long)]
    low_light: bool,

    /// Recover the subject by position when its identity is lost
    #[arg(long)]
    fast_motion: bool,

    /// Proximity budget multiplier (1.0–3.0)
    #[arg(long)]
    tolerance: Option<f32>,

    /// Disable appearance confirmation and re-identification
    #[arg(long)]
    no_appearance: bool,

    /// Appearance switch threshold (0–1)
    #[arg(long)]
    threshold: Option<f32>,

    /// Soft (segmentation) focus instead of a hard box
    #[arg(long)]
    soft: bool,

    /// Do not draw detection boxes
    #[arg(long)]
    hide_boxes: bool,
}

impl ConfigOverrides {
    fn apply(&self, mut config: SessionConfig) -> SessionConfig {
        config.low_light |= self.low_light;
        config.fast_motion |= self.fast_motion;
        config.appearance_match &= !self.no_appearance;
        config.soft_focus |= self.soft;
        config.show_boxes &= !self.hide_boxes;
        if let Some(t) = self.tolerance {
            config.motion_tolerance = t;
        }
        if let Some(t) = self.threshold {
            config.switch_threshold = t;
        }
        config.sanitized()
    }
}

fn parse_point(s: &str) -> Result<(i32, i32), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got {s:?}"))?;
    let x = x.trim().parse().map_err(|e| format!("bad X in {s:?}: {e}"))?;
    let y = y.trim().parse().map_err(|e| format!("bad Y in {s:?}: {e}"))?;
    Ok((x, y))
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Annotate {
            input,
            output,
            font,
        } => cmd_annotate(input, output, font),
        Commands::Focus {
            input,
            output,
            click,
            at_frame,
            reference,
            config,
            embedder,
            font,
            overrides,
        } => {
            let base = match config {
                Some(path) => SessionConfig::load(&path)?,
                None => SessionConfig::default(),
            };
            let start = match (click, reference) {
                (Some((x, y)), _) => Start::Click { x, y, at_frame },
                (None, Some(path)) => Start::Reference(path),
                (None, None) => bail!("nothing to focus on: pass --click X,Y or --reference IMAGE"),
            };
            cmd_focus(input, output, start, overrides.apply(base), embedder, font)
        }
        Commands::Inspect {
            frames,
            tracks,
            embedder,
        } => cmd_inspect(frames, tracks, embedder),
    }
}

// ── annotate ──────────────────────────────────────────────────────────────────

fn cmd_annotate(input: InputArgs, output: PathBuf, font: Option<PathBuf>) -> Result<()> {
    info!("Annotating detections");
    info!("  frames : {}", input.frames.display());
    info!("  tracks : {}", input.tracks.display());
    info!("  output : {}", output.display());

    let mut source = ImageSequence::open(&input.frames, input.fps)?;
    let mut detector = ReplayDetector::load(&input.tracks)?;
    let overlay = load_overlay(font.as_deref())?;
    let mut writer = ImageSequenceWriter::create(&output)?;

    let pb = progress(source.meta().frame_count, "Annotating…");
    for item in source.frames_from(0) {
        let (_, mut frame) = item?;
        let records = detect_records(&mut detector, &frame);
        overlay.draw(&mut frame, &records);
        writer.write(&frame)?;
        pb.inc(1);
    }

    pb.finish_with_message(format!("{} frames annotated.", writer.written()));
    Ok(())
}

// ── focus ─────────────────────────────────────────────────────────────────────

enum Start {
    Click { x: i32, y: i32, at_frame: u64 },
    Reference(PathBuf),
}

fn cmd_focus(
    input: InputArgs,
    output: PathBuf,
    start: Start,
    config: SessionConfig,
    embedder: Option<PathBuf>,
    font: Option<PathBuf>,
) -> Result<()> {
    info!("Focus pipeline");
    info!("  frames : {}", input.frames.display());
    info!("  tracks : {}", input.tracks.display());
    info!("  output : {}", output.display());

    let mut source = ImageSequence::open(&input.frames, input.fps)?;
    let detector = ReplayDetector::load(&input.tracks)?;
    let matcher = AppearanceMatcher::probe(locate_embedding_model(embedder.as_deref()).as_deref());
    let overlay = load_overlay(font.as_deref())?;
    let mut session = Session::with_overlay(config, Box::new(detector), matcher, overlay);

    if let Start::Reference(path) = &start {
        let img = image::open(path)
            .with_context(|| format!("failed to read reference image: {}", path.display()))?
            .to_rgb8();
        let Some(descriptor) = session.matcher().describe_image(&img) else {
            bail!("reference image {} produced no descriptor", path.display());
        };
        session.arm_reference(descriptor);
    }

    let mut writer = ImageSequenceWriter::create(&output)?;
    let mut focused = 0u64;
    let mut last_identity = None;
    let pb = progress(source.meta().frame_count, "Compositing…");

    for item in source.frames_from(0) {
        let (index, frame) = item?;
        let mut analysis = session.analyze_frame(&frame);
        if let Start::Click { x, y, at_frame } = start {
            if index == at_frame {
                let selection = session
                    .select_at(x, y)
                    .with_context(|| format!("selection at ({x}, {y}) on frame {index} failed"))?;
                info!(track_id = %selection.track_id, frame = index, "subject selected");
                if let Some(selected) = session.last_analysis() {
                    analysis = selected.clone();
                }
            }
        }
        let out = session.render(analysis);
        writer.write(&out.frame)?;
        pb.inc(1);

        if out.analysis.resolved.is_some() {
            focused += 1;
        }
        if out.identity != last_identity {
            if let Some(id) = out.identity {
                pb.set_message(format!("Compositing… tracking ID {id}"));
            }
            last_identity = out.identity;
        }
    }

    if !session.is_locked() {
        warn!("no subject was ever locked; output frames are unblurred");
    }
    pb.finish_with_message(format!(
        "{} frames written, subject resolved in {focused}.",
        writer.written()
    ));
    Ok(())
}

// ── inspect ───────────────────────────────────────────────────────────────────

fn cmd_inspect(frames: PathBuf, tracks: Option<PathBuf>, embedder: Option<PathBuf>) -> Result<()> {
    let pb = spinner("Inspecting…");
    let source = ImageSequence::open(&frames, DEFAULT_FPS)?;
    let meta = source.meta();
    let tracked_frames = tracks
        .as_deref()
        .map(ReplayDetector::load)
        .transpose()?
        .map(|d| d.frame_count());
    let model = locate_embedding_model(embedder.as_deref());
    let matcher = AppearanceMatcher::probe(model.as_deref());
    pb.finish_and_clear();

    let report = serde_json::json!({
        "frames": frames.display().to_string(),
        "width": meta.width,
        "height": meta.height,
        "fps": meta.fps,
        "frame_count": meta.frame_count,
        "tracked_frames": tracked_frames,
        "embedding_model": model.map(|p| p.display().to_string()),
        "matcher_mode": matcher.mode(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn load_overlay(font: Option<&Path>) -> Result<Overlay> {
    match font {
        Some(path) => Overlay::with_font_file(path),
        None => Ok(Overlay::new()),
    }
}

fn progress(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} {bar:30.cyan/blue} {pos}/{len} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_parse_with_optional_spaces() {
        assert_eq!(parse_point("12,34"), Ok((12, 34)));
        assert_eq!(parse_point(" -3 , 7 "), Ok((-3, 7)));
        assert!(parse_point("12").is_err());
        assert!(parse_point("a,b").is_err());
    }

    #[test]
    fn overrides_only_touch_given_fields() {
        let base = SessionConfig::default();
        assert_eq!(ConfigOverrides::default().apply(base.clone()), base);

        let o = ConfigOverrides {
            fast_motion: true,
            tolerance: Some(9.0),
            soft: true,
            ..ConfigOverrides::default()
        };
        let c = o.apply(base);
        assert!(c.fast_motion);
        assert!(c.soft_focus);
        assert_eq!(c.motion_tolerance, 3.0);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

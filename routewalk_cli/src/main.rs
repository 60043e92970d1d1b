use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use routewalk::{
    estimate_calories, spawn_reporter, steps_per_minute, EventLoop, FixFilter, GeoFix,
    HttpReportSink, LocationPermission, LogReportSink, ManualClock, MotionSample, ReportPayload,
    RuntimeError, SessionConfig, SessionController, SessionSummary, StepTrigger,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Step and route session CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a recorded JSONL event trace through a live session loop
    Replay(ReplayArgs),
    /// Derive step rate and effort from raw totals
    Summarize(SummarizeArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON config file; unspecified keys keep their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Acceleration magnitude (g) that counts as a step
    #[arg(long)]
    threshold: Option<f64>,

    /// Step trigger mode
    #[arg(long, value_enum)]
    trigger: Option<TriggerOpt>,

    /// Body weight for the calorie estimate (kg)
    #[arg(long)]
    weight: Option<f64>,

    /// Endpoint receiving session reports
    #[arg(long)]
    report_url: Option<String>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Trace file, one JSON event per line
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    trace: PathBuf,

    /// Output path for the report payloads (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// POST each summary to the report URL instead of logging it
    #[arg(long, action = ArgAction::SetTrue)]
    post: bool,

    /// Wall-clock start of the replay (RFC 3339); defaults to now
    #[arg(long)]
    start_time: Option<String>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Parser, Debug)]
struct SummarizeArgs {
    /// Total steps counted
    #[arg(long)]
    steps: u64,

    /// Elapsed session time in seconds
    #[arg(long)]
    elapsed: f64,

    /// Route length in meters
    #[arg(long, default_value_t = 0.0)]
    distance: f64,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TriggerOpt {
    Sample,
    Edge,
}

impl From<TriggerOpt> for StepTrigger {
    fn from(value: TriggerOpt) -> Self {
        match value {
            TriggerOpt::Sample => StepTrigger::PerSample,
            TriggerOpt::Edge => StepTrigger::RisingEdge,
        }
    }
}

/// One line of a replay trace.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TraceEvent {
    Motion {
        x: f64,
        y: f64,
        z: f64,
    },
    Fix {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        altitude: Option<f64>,
        #[serde(default)]
        accuracy: Option<f64>,
    },
    Permission {
        granted: bool,
    },
    Start,
    End,
    Wait {
        seconds: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Replay(args) => args.config.verbose,
        Command::Summarize(args) => args.config.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Replay(args) => handle_replay(args),
        Command::Summarize(args) => handle_summarize(args),
    }
}

fn load_config(args: &ConfigArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.step_threshold = threshold;
    }
    if let Some(trigger) = args.trigger {
        config.step_trigger = trigger.into();
    }
    if let Some(weight) = args.weight {
        config.weight_kg = weight;
    }
    if let Some(url) = &args.report_url {
        config.report_url = url.clone();
    }
    config.validate()?;
    debug!(?config, "effective config");
    Ok(config)
}

fn parse_trace(text: &str) -> Result<Vec<(usize, TraceEvent)>> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event: TraceEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("line {}: invalid trace event", line_no))?;
        if let TraceEvent::Wait { seconds } = &event {
            if !seconds.is_finite() || *seconds < 0.0 {
                return Err(anyhow!(
                    "line {}: wait must be a non-negative number of seconds",
                    line_no
                ));
            }
        }
        events.push((line_no, event));
    }
    Ok(events)
}

fn handle_replay(args: ReplayArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let text = fs::read_to_string(&args.trace)
        .with_context(|| format!("failed to read {}", args.trace.display()))?;
    let events = parse_trace(&text)?;
    if events.is_empty() {
        return Err(anyhow!("trace {} has no events", args.trace.display()));
    }
    let start_time = match &args.start_time {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid --start-time '{}'", raw))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let summaries = runtime.block_on(replay(events, config, start_time, args.post))?;
    info!(sessions = summaries.len(), "replay finished");

    let payloads: Vec<ReportPayload> = summaries.iter().map(ReportPayload::from).collect();
    write_payloads(&payloads, &args.output)
}

async fn replay(
    events: Vec<(usize, TraceEvent)>,
    config: SessionConfig,
    start_time: DateTime<Utc>,
    post: bool,
) -> Result<Vec<SessionSummary>> {
    let clock = ManualClock::new(start_time);
    let (reports, reporter) = if post {
        let sink = HttpReportSink::new(config.report_url.clone())?;
        info!(url = sink.url(), "posting reports");
        spawn_reporter(sink)
    } else {
        spawn_reporter(LogReportSink)
    };

    // trace fixes stand in for the location subscription, so they get its spacing
    let mut fixes = FixFilter::new(config.min_fix_distance_m);
    let controller = SessionController::new(config, Arc::new(clock.clone()), Box::new(reports));
    let (event_loop, handle) = EventLoop::new(controller);
    let loop_task = tokio::spawn(event_loop.run());

    let mut summaries = Vec::new();
    for (line_no, event) in events {
        match event {
            TraceEvent::Motion { x, y, z } => handle.motion(MotionSample::new(x, y, z)).await?,
            TraceEvent::Fix {
                latitude,
                longitude,
                altitude,
                accuracy,
            } => {
                let fix = GeoFix {
                    latitude,
                    longitude,
                    altitude,
                    accuracy,
                };
                if fixes.accept(&fix) {
                    handle.fix(fix).await?
                } else {
                    debug!(line = line_no, "fix closer than the minimum spacing dropped");
                }
            }
            TraceEvent::Permission { granted } => {
                let permission = if granted {
                    LocationPermission::Granted
                } else {
                    LocationPermission::Denied
                };
                handle.permission(permission).await?
            }
            TraceEvent::Start => match handle.start().await {
                Ok(()) => debug!(line = line_no, "session started"),
                Err(RuntimeError::Session(err)) => {
                    warn!(line = line_no, error = %err, "start rejected")
                }
                Err(err) => return Err(err.into()),
            },
            TraceEvent::End => match handle.end().await {
                Ok(summary) => summaries.push(summary),
                Err(RuntimeError::Session(err)) => {
                    warn!(line = line_no, error = %err, "end rejected")
                }
                Err(err) => return Err(err.into()),
            },
            TraceEvent::Wait { seconds } => {
                let by = chrono::Duration::milliseconds((seconds * 1000.0).round() as i64);
                clock
                    .advance(by)
                    .with_context(|| format!("line {}: wait of {} seconds", line_no, seconds))?;
                handle.tick().await?;
            }
        }
    }

    let snapshot = handle.snapshot().await?;
    info!(
        status = %snapshot.status,
        steps = snapshot.step_count,
        elapsed = %snapshot.elapsed,
        path_len = snapshot.path.len(),
        rejected_samples = snapshot.rejected_samples,
        "final session state"
    );

    handle.shutdown().await?;
    let controller = loop_task.await.context("session loop task failed")?;
    // releasing the controller closes the report queue so the reporter drains
    drop(controller);
    reporter.await.context("report task failed")?;
    Ok(summaries)
}

fn write_payloads(payloads: &[ReportPayload], path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(payloads)?;
    if path.as_os_str() == "-" {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", text)?;
        return Ok(());
    }
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote report payloads");
    Ok(())
}

fn handle_summarize(args: SummarizeArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    if !args.elapsed.is_finite() || args.elapsed < 0.0 {
        return Err(anyhow!("--elapsed must be a non-negative number of seconds"));
    }
    if !args.distance.is_finite() || args.distance < 0.0 {
        return Err(anyhow!("--distance must be a non-negative number of meters"));
    }
    let rate = steps_per_minute(args.steps, args.elapsed);
    if rate.value().is_none() {
        warn!("elapsed time is zero; step rate is undefined");
    }
    let out = json!({
        "steps": args.steps,
        "timeElapsed": args.elapsed,
        "stepRate": rate.to_fixed(),
        "distanceMeters": args.distance,
        "calories": estimate_calories(args.distance, config.weight_kg, config.met_value),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

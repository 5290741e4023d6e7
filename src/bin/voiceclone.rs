//! Clone a voice from a reference clip and read arbitrary text with it.
//!
//! Usage:
//!     voiceclone --ref-audio me.m4a --ref-text "Hello there" --text-file book.txt
//!     voiceclone --ref-audio me.wav --ref-text-file me.txt --text-file script.txt --per-line --out script.wav
//!     voiceclone --preflight --worker "python3 worker.py"
//!
//! The model runs in a worker process given by `--worker` or `VOICECLONE_WORKER`.
//! `--dry-run` swaps in a built-in tone generator to exercise everything else.
//!
//! Exit codes: 0 success, 1 error, 2 some chunks failed (unless `--allow-partial`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use qwen3_voiceclone::preflight::{self, PreflightTargets, Severity, WorkerTarget};
use qwen3_voiceclone::text::load_text;
use qwen3_voiceclone::{
    Accelerator, AssemblyConfig, BackendError, DevicePolicy, GapPolicy, Language, MockBackend,
    ModelPreset, OutputTarget, PipelineConfig, ProcessBackend, ProgressEvent, ReferenceLoader,
    SynthesisBackend, SynthesisRequest, VoiceClonePipeline, WorkerCommand,
};

/// Silence between lines in --per-line mode unless --silence says otherwise
const PER_LINE_SILENCE_SECS: f32 = 0.25;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reference audio (wav, mp3, m4a, ... anything ffmpeg reads)
    #[arg(long)]
    ref_audio: Option<PathBuf>,

    /// Transcript of the reference audio
    #[arg(long, conflicts_with = "ref_text_file")]
    ref_text: Option<String>,

    /// File holding the transcript of the reference audio
    #[arg(long)]
    ref_text_file: Option<PathBuf>,

    /// Text to synthesize
    #[arg(short, long, conflicts_with = "text_file")]
    text: Option<String>,

    /// File holding the text to synthesize
    #[arg(long)]
    text_file: Option<PathBuf>,

    /// Exact output WAV path
    #[arg(short, long, conflicts_with = "output_dir")]
    out: Option<PathBuf>,

    /// Directory for timestamped output files (default: outputs)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Target language (auto, japanese, english, chinese, ...)
    #[arg(short, long, default_value = "japanese")]
    language: String,

    /// Model preset (quality, speed, custom-voice) or a model ID / directory
    #[arg(short, long, default_value = "quality")]
    model: String,

    /// Accelerator: cuda, cuda:N, metal or mps
    #[arg(long)]
    device: Option<String>,

    /// Worker command line, e.g. "python3 worker.py" (default: $VOICECLONE_WORKER)
    #[arg(long)]
    worker: Option<String>,

    /// Extra argument for the worker (repeatable)
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    /// Use the built-in test backend instead of a model worker
    #[arg(long)]
    dry_run: bool,

    /// Maximum characters per chunk
    #[arg(long)]
    max_chunk_chars: Option<usize>,

    /// Synthesize each non-empty line separately
    #[arg(long)]
    per_line: bool,

    /// Seconds of silence between chunks (default 0, or 0.25 with --per-line)
    #[arg(long)]
    silence: Option<f32>,

    /// Fill failed chunks with this many seconds of silence instead of skipping them
    #[arg(long)]
    gap_silence: Option<f32>,

    /// Attempts per chunk before splitting or giving up
    #[arg(long)]
    max_attempts: Option<usize>,

    /// Random seed for reproducible generation
    #[arg(short, long)]
    seed: Option<u64>,

    /// Sampling temperature for the first attempt
    #[arg(long)]
    temperature: Option<f64>,

    /// Pipeline config JSON; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit 0 even when some chunks failed
    #[arg(long)]
    allow_partial: bool,

    /// Check ffmpeg, the worker, the accelerator and the output directory, then exit
    #[arg(long)]
    preflight: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

/// Validate CLI arg combinations and bail early on contradictory flags.
fn validate_args(args: &Args) -> Result<()> {
    if args.preflight {
        return Ok(());
    }

    let mut problems = Vec::new();
    if args.ref_audio.is_none() {
        problems.push("--ref-audio is required");
    }
    if args.ref_text.is_none() && args.ref_text_file.is_none() {
        problems.push("--ref-text or --ref-text-file is required (the transcript of the reference audio)");
    }
    if args.text.is_none() && args.text_file.is_none() {
        problems.push("--text or --text-file is required");
    }
    if args.dry_run && args.worker.is_some() {
        problems.push("--dry-run and --worker are mutually exclusive");
    }
    if !problems.is_empty() {
        anyhow::bail!("{}", problems.join("\n  "));
    }
    Ok(())
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(max) = args.max_chunk_chars {
        config.segmenter.max_chunk_chars = max;
    }
    if args.per_line {
        config.segmenter.split_lines = true;
        if config.assembly.inter_segment_silence_secs
            == AssemblyConfig::default().inter_segment_silence_secs
        {
            config.assembly.inter_segment_silence_secs = PER_LINE_SILENCE_SECS;
        }
    }
    if let Some(secs) = args.silence {
        config.assembly.inter_segment_silence_secs = secs;
    }
    if let Some(secs) = args.gap_silence {
        config.assembly.gap_policy = GapPolicy::Silence { secs };
    }
    if let Some(n) = args.max_attempts {
        config.stability.max_attempts = n;
    }
    if let Some(seed) = args.seed {
        config.sampling.seed = Some(seed);
    }
    if let Some(t) = args.temperature {
        config.sampling.temperature = t;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Worker from `--worker`, else `env_worker`; `--dry-run` needs none.
fn worker_target(args: &Args, env_worker: Option<String>) -> WorkerTarget {
    if args.dry_run {
        return WorkerTarget::InProcess;
    }
    args.worker
        .clone()
        .or(env_worker)
        .and_then(|line| WorkerCommand::parse(&line))
        .map(|command| WorkerTarget::Command(command.args(args.worker_args.iter().cloned())))
        .unwrap_or(WorkerTarget::Unconfigured)
}

fn accelerator(args: &Args) -> Result<Accelerator> {
    match &args.device {
        Some(d) => Ok(Accelerator::parse(d)?),
        None => Ok(DevicePolicy::default().accelerator),
    }
}

fn run_preflight(
    config: &PipelineConfig,
    worker: WorkerTarget,
    accelerator: Accelerator,
    accelerator_check: impl FnOnce() -> std::result::Result<(), BackendError>,
) -> ExitCode {
    let targets = PreflightTargets {
        ffmpeg_path: config.reference.ffmpeg_path.clone(),
        worker,
        output_dir: config.output_dir.clone(),
    };
    let issues = preflight::run(&targets, accelerator_check);

    if issues.is_empty() {
        println!("Preflight OK: {} ready", accelerator);
        return ExitCode::SUCCESS;
    }
    for issue in &issues {
        let tag = match issue.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN ",
        };
        println!("{tag} [{}] {}", issue.component, issue.message);
    }
    if targets.worker == WorkerTarget::Unconfigured {
        println!("      pass --worker \"python3 worker.py\" or set VOICECLONE_WORKER");
    }
    if preflight::has_errors(&issues) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}",
            )?
            .progress_chars("#>-"),
    );
    Ok(bar)
}

fn run<B: SynthesisBackend>(
    args: &Args,
    config: PipelineConfig,
    backend: B,
    worker: WorkerTarget,
) -> Result<ExitCode> {
    let accelerator = accelerator(args)?;
    let pipeline = VoiceClonePipeline::new(backend, config)?;

    if args.preflight {
        let invoker = pipeline.invoker();
        return Ok(run_preflight(pipeline.config(), worker, accelerator, || {
            invoker.lock(accelerator).ensure_accelerator()
        }));
    }

    let (Some(ref_audio), Some(text)) = (&args.ref_audio, text_input(args)?) else {
        anyhow::bail!("--ref-audio and --text/--text-file are required");
    };
    let ref_text = match (&args.ref_text, &args.ref_text_file) {
        (Some(t), _) => t.clone(),
        (None, Some(path)) => load_text(path)?,
        (None, None) => anyhow::bail!("--ref-text or --ref-text-file is required"),
    };

    let language: Language = args.language.parse().map_err(anyhow::Error::msg)?;
    let model: ModelPreset = ModelPreset::from(args.model.clone());

    println!("=== Voice Clone ===");
    println!("Reference: {}", ref_audio.display());
    println!("Model: {} on {}", model.model_id(), accelerator);
    println!("Language: {}", language);

    let loader = ReferenceLoader::new(pipeline.config().reference.clone());
    let reference = loader
        .load(ref_audio, &ref_text)
        .with_context(|| format!("failed to load reference {}", ref_audio.display()))?;
    println!(
        "Loaded reference audio: {:.2}s, {} samples",
        reference.duration(),
        reference.audio.len()
    );

    let output = match &args.out {
        Some(path) => OutputTarget::File(path.clone()),
        None => OutputTarget::Directory(pipeline.config().output_dir.clone()),
    };
    let request = SynthesisRequest {
        reference,
        full_text: text,
        output,
        model,
        language,
        device_policy: DevicePolicy::new(accelerator),
    };

    let bar = progress_bar()?;
    let result = pipeline.run(
        &request,
        &mut |event| match event {
            ProgressEvent::Started { chunk_count } => bar.set_length(chunk_count as u64),
            ProgressEvent::ChunkStarted { index, chars, .. } => {
                bar.set_message(format!("chunk {index} ({chars} chars)"))
            }
            ProgressEvent::AttemptFailed {
                index,
                attempt_number,
                reason,
                ..
            } => bar.set_message(format!("chunk {index} retry after attempt {attempt_number}: {reason}")),
            ProgressEvent::ChunkFinished { .. } => bar.inc(1),
            ProgressEvent::Assembled { .. } | ProgressEvent::Written { .. } => {}
        },
        None,
    );
    bar.finish_and_clear();
    let result = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Generated: {:.2}s @ {} Hz from {} chunk(s), {} model call(s)",
            result.duration_secs, result.sample_rate, result.chunk_count, result.attempts
        );
        println!("Saved WAV to: {}", result.output_path.display());
    }

    if result.is_partial() {
        eprintln!(
            "Warning: {} chunk(s) failed and are missing from the output: {:?}",
            result.failed_chunk_indices.len(),
            result.failed_chunk_indices
        );
        if !args.allow_partial {
            return Ok(ExitCode::from(2));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn text_input(args: &Args) -> Result<Option<String>> {
    match (&args.text, &args.text_file) {
        (Some(t), _) => Ok(Some(t.clone())),
        (None, Some(path)) => Ok(Some(load_text(path)?)),
        (None, None) => Ok(None),
    }
}

fn main() -> Result<ExitCode> {
    // Chrome tracing layer is added when the `profiling` feature is active.
    let _profiling_guard = qwen3_voiceclone::profiling::init();

    let args = Args::parse();
    validate_args(&args)?;
    let config = build_config(&args)?;

    match worker_target(&args, std::env::var("VOICECLONE_WORKER").ok()) {
        WorkerTarget::InProcess => run(&args, config, MockBackend::new(), WorkerTarget::InProcess),
        WorkerTarget::Command(worker) => run(
            &args,
            config,
            ProcessBackend::new(worker.clone()),
            WorkerTarget::Command(worker),
        ),
        WorkerTarget::Unconfigured if args.preflight => Ok(run_preflight(
            &config,
            WorkerTarget::Unconfigured,
            accelerator(&args)?,
            || Ok(()),
        )),
        WorkerTarget::Unconfigured => anyhow::bail!(
            "no model worker: pass --worker \"python3 worker.py\" or set VOICECLONE_WORKER"
        ),
    }
}

//! Backend that drives an external model worker over line-delimited JSON-RPC.
//!
//! The worker is spawned lazily and kept alive across requests. Each request
//! is one JSON object per line on its stdin; each reply is one JSON object
//! per line on its stdout. Anything else the worker prints to stdout is
//! ignored, and its stderr is forwarded to `tracing`.
//!
//! Methods:
//! - `probe {device}` → `{available, detail}`
//! - `load {model_id, device, dtype, attn_implementation}` → `{}`
//! - `synthesize {ref_audio, ref_text, text, language, temperature, top_k,
//!   top_p, repetition_penalty, max_new_tokens, seed, output_path}` →
//!   `{sample_rate, non_finite_logits, frames}`; the audio is written to
//!   `output_path` as WAV
//!
//! Failures come back as `{"error": {"kind", "message"}}` where `kind` is
//! `numeric_instability`, `device_unavailable` or anything else.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::Deserialize;
use serde_json::{json, Value};

use super::{BackendError, GenerationDiagnostics, RawWaveform, SynthesisBackend};
use crate::audio::load_wav;
use crate::config::ModelPreset;
use crate::device::{Accelerator, AttentionImpl, RuntimeParams};
use crate::generation::SamplingParams;
use crate::reference::ReferenceVoice;
use crate::text::Language;

/// How to start the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Split a shell-like command line on whitespace (`"python3 worker.py"`).
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    kind: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProbeResult {
    available: bool,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResult {
    #[serde(default)]
    non_finite_logits: bool,
    #[serde(default)]
    frames: Option<usize>,
}

impl RpcError {
    fn into_backend_error(self) -> BackendError {
        match self.kind.as_deref() {
            Some("numeric_instability") => BackendError::NumericInstability(self.message),
            Some("device_unavailable") => BackendError::DeviceUnavailable(self.message),
            _ => BackendError::classify(self.message),
        }
    }
}

/// A running worker.
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> Result<Self, BackendError> {
        tracing::info!(
            "Spawning model worker: {} {}",
            command.program.display(),
            command.args.join(" ")
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &command.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Failed(format!(
                "failed to spawn worker '{}': {e}",
                command.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Failed("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Failed("failed to capture worker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Failed("failed to capture worker stderr".into()))?;

        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => {
                        tracing::info!(target: "voiceclone::worker", "{}", line)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("worker stderr read error: {e}");
                        break;
                    }
                }
            }
            tracing::debug!("worker stderr reader exiting");
        });

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        })
    }

    /// Send one request and wait for the reply with the same id.
    fn call(&mut self, method: &str, params: Value) -> Result<Value, BackendError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({ "id": id, "method": method, "params": params });
        let line = serde_json::to_string(&request)
            .map_err(|e| BackendError::Failed(format!("failed to encode request: {e}")))?;

        writeln!(self.stdin, "{line}")
            .and_then(|_| self.stdin.flush())
            .map_err(|e| BackendError::Failed(format!("failed to write to worker: {e}")))?;

        loop {
            let mut reply = String::new();
            let read = self
                .stdout
                .read_line(&mut reply)
                .map_err(|e| BackendError::Failed(format!("failed to read from worker: {e}")))?;
            if read == 0 {
                let status = self
                    .child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "still running".to_string());
                return Err(BackendError::Failed(format!(
                    "worker closed stdout during '{method}' ({status})"
                )));
            }

            let response: RpcResponse = match serde_json::from_str(reply.trim()) {
                Ok(r) => r,
                Err(_) => {
                    tracing::debug!("worker stdout: {}", reply.trim_end());
                    continue;
                }
            };
            if response.id != Some(id) {
                tracing::warn!("Ignoring worker reply with id {:?} (expected {id})", response.id);
                continue;
            }
            if let Some(error) = response.error {
                return Err(error.into_backend_error());
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LoadedModel {
    model_id: String,
    accelerator: Accelerator,
    runtime: RuntimeParams,
}

/// Reference audio materialized as a WAV the worker can read.
struct CachedReference {
    fingerprint: u64,
    file: tempfile::NamedTempFile,
}

/// [`SynthesisBackend`] backed by an external worker process.
pub struct ProcessBackend {
    command: WorkerCommand,
    worker: Option<WorkerProcess>,
    loaded: Option<LoadedModel>,
    /// Accelerators the current worker has reported available at least once
    confirmed: HashSet<Accelerator>,
    reference: Option<CachedReference>,
    scratch: Option<tempfile::TempDir>,
    output_counter: u64,
}

impl ProcessBackend {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            worker: None,
            loaded: None,
            confirmed: HashSet::new(),
            reference: None,
            scratch: None,
            output_counter: 0,
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Attention kernel of the currently loaded model, if any.
    pub fn loaded_attention(&self) -> Option<AttentionImpl> {
        self.loaded.as_ref().map(|m| m.runtime.attention)
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value, BackendError> {
        if self.worker.is_none() {
            self.worker = Some(WorkerProcess::spawn(&self.command)?);
        }
        let Some(worker) = self.worker.as_mut() else {
            return Err(BackendError::Failed("worker not running".into()));
        };
        let result = worker.call(method, params);
        if let Err(BackendError::Failed(_)) = &result {
            // The worker may be wedged; restart on the next call.
            if worker.child.try_wait().ok().flatten().is_some() {
                tracing::warn!("Model worker exited; it will be restarted on the next call");
                self.worker = None;
                self.loaded = None;
                self.confirmed.clear();
            }
        }
        result
    }

    fn scratch_dir(&mut self) -> Result<PathBuf, BackendError> {
        if self.scratch.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("voiceclone-worker-")
                .tempdir()
                .map_err(|e| BackendError::Failed(format!("failed to create scratch dir: {e}")))?;
            self.scratch = Some(dir);
        }
        self.scratch
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| BackendError::Failed("scratch dir missing".into()))
    }

    fn load(&mut self, model_id: &str, accelerator: Accelerator, runtime: RuntimeParams) -> Result<(), BackendError> {
        tracing::info!(
            "Loading {} on {} ({}, {})",
            model_id,
            accelerator,
            runtime.dtype_name(),
            runtime.attention.as_str()
        );
        self.call(
            "load",
            json!({
                "model_id": model_id,
                "device": accelerator.torch_name(),
                "dtype": runtime.dtype_name(),
                "attn_implementation": runtime.attention.as_str(),
            }),
        )
        .map(|_| ())
    }

    /// Path of a WAV holding `reference`, rewritten only when the reference changes.
    fn reference_path(&mut self, reference: &ReferenceVoice) -> Result<PathBuf, BackendError> {
        let fingerprint = fingerprint(reference);
        if let Some(cached) = &self.reference {
            if cached.fingerprint == fingerprint {
                return Ok(cached.file.path().to_path_buf());
            }
        }

        let dir = self.scratch_dir()?;
        let file = tempfile::Builder::new()
            .prefix("reference-")
            .suffix(".wav")
            .tempfile_in(&dir)
            .map_err(|e| BackendError::Failed(format!("failed to create reference file: {e}")))?;
        reference
            .audio
            .save(file.path())
            .map_err(|e| BackendError::Failed(format!("failed to write reference audio: {e}")))?;

        let path = file.path().to_path_buf();
        self.reference = Some(CachedReference { fingerprint, file });
        Ok(path)
    }

    fn read_output(path: &Path, result: Value) -> Result<RawWaveform, BackendError> {
        let meta: SynthesizeResult = serde_json::from_value(result)
            .map_err(|e| BackendError::Failed(format!("malformed synthesize result: {e}")))?;
        let audio = load_wav(path)
            .map_err(|e| BackendError::Failed(format!("failed to read worker output: {e}")))?;
        let _ = std::fs::remove_file(path);

        Ok(RawWaveform {
            audio,
            diagnostics: GenerationDiagnostics {
                non_finite_logits: meta.non_finite_logits,
                frames: meta.frames,
            },
        })
    }
}

fn fingerprint(reference: &ReferenceVoice) -> u64 {
    let mut hasher = DefaultHasher::new();
    reference.transcript.hash(&mut hasher);
    reference.audio.sample_rate.hash(&mut hasher);
    reference.audio.channels.hash(&mut hasher);
    for s in &reference.audio.samples {
        s.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

impl SynthesisBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    /// Asks the worker on every call; a device can disappear between chunks.
    fn ensure_accelerator(&mut self, accelerator: Accelerator) -> Result<(), BackendError> {
        let result = self.call("probe", json!({ "device": accelerator.torch_name() }))?;
        let probe: ProbeResult = serde_json::from_value(result)
            .map_err(|e| BackendError::Failed(format!("malformed probe result: {e}")))?;

        if !probe.available {
            self.confirmed.remove(&accelerator);
            return Err(BackendError::DeviceUnavailable(format!(
                "{accelerator}: {}",
                probe.detail
            )));
        }
        if self.confirmed.insert(accelerator) {
            tracing::info!("Worker reports {} available {}", accelerator, probe.detail);
        }
        Ok(())
    }

    fn prepare(&mut self, model: &ModelPreset, accelerator: Accelerator) -> Result<(), BackendError> {
        let model_id = model.model_id().to_string();
        if let Some(loaded) = &self.loaded {
            if loaded.model_id == model_id && loaded.accelerator == accelerator {
                return Ok(());
            }
        }

        let runtime = RuntimeParams::for_accelerator(accelerator);
        let runtime = match self.load(&model_id, accelerator, runtime) {
            Ok(()) => runtime,
            Err(BackendError::Failed(msg)) if runtime.attention == AttentionImpl::FlashAttention2 => {
                tracing::warn!("flash_attention_2 load failed ({msg}); retrying with eager attention");
                let eager = runtime.with_eager_attention();
                self.load(&model_id, accelerator, eager)?;
                eager
            }
            Err(e) => return Err(e),
        };

        self.loaded = Some(LoadedModel {
            model_id,
            accelerator,
            runtime,
        });
        Ok(())
    }

    fn synthesize(
        &mut self,
        reference: &ReferenceVoice,
        text: &str,
        language: Language,
        params: &SamplingParams,
        accelerator: Accelerator,
    ) -> Result<RawWaveform, BackendError> {
        match &self.loaded {
            Some(m) if m.accelerator == accelerator => {}
            _ => {
                return Err(BackendError::Failed(format!(
                    "no model loaded on {accelerator}; call prepare first"
                )))
            }
        }

        let ref_audio = self.reference_path(reference)?;
        self.output_counter += 1;
        let output_path = self
            .scratch_dir()?
            .join(format!("chunk-{:05}.wav", self.output_counter));

        let result = self.call(
            "synthesize",
            json!({
                "ref_audio": ref_audio,
                "ref_text": reference.transcript,
                "text": text,
                "language": language.model_name(),
                "temperature": params.temperature,
                "top_k": params.top_k,
                "top_p": params.top_p,
                "repetition_penalty": params.repetition_penalty,
                "max_new_tokens": params.max_new_tokens,
                "seed": params.seed,
                "output_path": output_path,
            }),
        )?;

        Self::read_output(&output_path, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioBuffer;

    #[test]
    fn test_worker_command_parse() {
        let cmd = WorkerCommand::parse("python3 -u worker.py").unwrap();
        assert_eq!(cmd.program, PathBuf::from("python3"));
        assert_eq!(cmd.args, vec!["-u", "worker.py"]);
        assert!(WorkerCommand::parse("   ").is_none());
    }

    #[test]
    fn test_rpc_error_kinds() {
        let err = RpcError {
            kind: Some("numeric_instability".into()),
            message: "bad".into(),
        };
        assert!(err.into_backend_error().is_retryable());

        let err = RpcError {
            kind: None,
            message: "probability tensor contains either `inf`, `nan` or element < 0".into(),
        };
        assert!(err.into_backend_error().is_retryable());

        let err = RpcError {
            kind: Some("device_unavailable".into()),
            message: "no mps".into(),
        };
        assert!(matches!(
            err.into_backend_error(),
            BackendError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = ReferenceVoice::new(AudioBuffer::new(vec![0.1; 100], 24000), "hello").unwrap();
        let b = ReferenceVoice::new(AudioBuffer::new(vec![0.1; 100], 24000), "hello").unwrap();
        let c = ReferenceVoice::new(AudioBuffer::new(vec![0.2; 100], 24000), "hello").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_missing_worker_is_fatal() {
        let mut backend = ProcessBackend::new(WorkerCommand::new("/nonexistent/worker"));
        let err = backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[test]
    fn test_synthesize_requires_prepare() {
        let mut backend = ProcessBackend::new(WorkerCommand::new("/nonexistent/worker"));
        let reference = ReferenceVoice::for_tests();
        let err = backend
            .synthesize(
                &reference,
                "hi",
                Language::English,
                &SamplingParams::default(),
                Accelerator::Metal,
            )
            .unwrap_err();
        assert!(err.to_string().contains("prepare"));
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_worker_round_trip() {
        // A tiny worker that answers every probe as available and ignores noise lines.
        let script = r#"
echo "loading libraries..."
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "{\"id\":$id,\"result\":{\"available\":true,\"detail\":\"ok\"}}"
done
"#;
        let mut backend =
            ProcessBackend::new(WorkerCommand::new("sh").arg("-c").arg(script));
        backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap();
        backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap();
        backend
            .prepare(&ModelPreset::Speed, Accelerator::Cuda(0))
            .unwrap();
        assert_eq!(
            backend.loaded_attention(),
            Some(AttentionImpl::FlashAttention2)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_follows_device_state() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("gpu-present");
        // Reports the device available only while the flag file exists.
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -f 'FLAG_PATH' ]; then avail=true; else avail=false; fi
  echo "{\"id\":$id,\"result\":{\"available\":$avail,\"detail\":\"flag\"}}"
done
"#
        .replace("FLAG_PATH", &flag.display().to_string());
        let mut backend = ProcessBackend::new(WorkerCommand::new("sh").arg("-c").arg(script));

        let err = backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap_err();
        assert!(matches!(err, BackendError::DeviceUnavailable(_)));

        std::fs::write(&flag, b"").unwrap();
        backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap();

        std::fs::remove_file(&flag).unwrap();
        let err = backend.ensure_accelerator(Accelerator::Cuda(0)).unwrap_err();
        assert_eq!(err, BackendError::DeviceUnavailable("cuda:0: flag".into()));
    }
}

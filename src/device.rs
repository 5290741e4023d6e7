//! Accelerator selection.
//!
//! Voice cloning only runs on a GPU: CUDA or Apple Metal. There is no CPU
//! path, and an unavailable accelerator is reported, never swapped for another.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceCloneError};

/// A concrete accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Accelerator {
    Cuda(usize),
    Metal,
}

impl Accelerator {
    /// Parse a device string.
    ///
    /// Supported formats:
    /// - `"cuda"` or `"cuda:0"`: CUDA device 0
    /// - `"cuda:N"`: CUDA device N
    /// - `"metal"` or `"mps"`: Apple Silicon GPU
    ///
    /// `"cpu"` and `"auto"` are rejected with guidance.
    pub fn parse(device_str: &str) -> Result<Self> {
        let s = device_str.trim().to_lowercase();
        match s.as_str() {
            "metal" | "mps" => Ok(Accelerator::Metal),
            "cuda" => Ok(Accelerator::Cuda(0)),
            s if s.starts_with("cuda:") => {
                let idx = &s["cuda:".len()..];
                idx.parse().map(Accelerator::Cuda).map_err(|e| {
                    VoiceCloneError::InvalidInput(format!("invalid CUDA device index '{idx}': {e}"))
                })
            }
            "cpu" | "auto" => Err(VoiceCloneError::InvalidInput(format!(
                "device '{device_str}' is not supported: voice cloning requires an accelerator. \
                 Use --device cuda[:N] on NVIDIA GPUs or --device metal on Apple Silicon"
            ))),
            _ => Err(VoiceCloneError::InvalidInput(format!(
                "unknown device '{device_str}'. Expected cuda, cuda:N, metal or mps"
            ))),
        }
    }

    /// Open the device through candle. Fails when the accelerator is absent or
    /// support was not compiled in.
    pub fn open(&self) -> Result<Device> {
        let opened = match self {
            Accelerator::Cuda(ordinal) => Device::new_cuda(*ordinal),
            Accelerator::Metal => Device::new_metal(0),
        };
        opened.map_err(|e| VoiceCloneError::DeviceUnavailable {
            device: self.to_string(),
            guidance: format!("{e}. {}", self.guidance()),
        })
    }

    /// Name understood by PyTorch-based workers (`cuda:0`, `mps`).
    pub fn torch_name(&self) -> String {
        match self {
            Accelerator::Cuda(ordinal) => format!("cuda:{ordinal}"),
            Accelerator::Metal => "mps".to_string(),
        }
    }

    pub fn guidance(&self) -> &'static str {
        match self {
            Accelerator::Cuda(_) => {
                "Check the NVIDIA driver (nvidia-smi) and that CUDA is visible to the worker"
            }
            Accelerator::Metal => {
                "Metal needs macOS on Apple Silicon with an MPS-enabled PyTorch in the worker"
            }
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accelerator::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Accelerator::Metal => f.write_str("metal"),
        }
    }
}

impl FromStr for Accelerator {
    type Err = VoiceCloneError;

    fn from_str(s: &str) -> Result<Self> {
        Accelerator::parse(s)
    }
}

impl TryFrom<String> for Accelerator {
    type Error = VoiceCloneError;

    fn try_from(s: String) -> Result<Self> {
        Accelerator::parse(&s)
    }
}

impl From<Accelerator> for String {
    fn from(acc: Accelerator) -> Self {
        acc.to_string()
    }
}

/// Execution policy for a request. Accelerator-only; there is no fallback field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePolicy {
    pub accelerator: Accelerator,
}

impl DevicePolicy {
    pub fn new(accelerator: Accelerator) -> Self {
        Self { accelerator }
    }
}

impl Default for DevicePolicy {
    /// Metal on macOS, CUDA device 0 elsewhere.
    fn default() -> Self {
        let accelerator = if cfg!(target_os = "macos") {
            Accelerator::Metal
        } else {
            Accelerator::Cuda(0)
        };
        Self { accelerator }
    }
}

/// Attention kernel requested from the model runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionImpl {
    #[serde(rename = "flash_attention_2")]
    FlashAttention2,
    Eager,
}

impl AttentionImpl {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionImpl::FlashAttention2 => "flash_attention_2",
            AttentionImpl::Eager => "eager",
        }
    }
}

/// Precision and attention kernel for a model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeParams {
    pub dtype: DType,
    pub attention: AttentionImpl,
}

impl RuntimeParams {
    /// CUDA loads in BF16 with flash attention; MPS has no flash kernels and
    /// runs F16 with eager attention.
    pub fn for_accelerator(accelerator: Accelerator) -> Self {
        match accelerator {
            Accelerator::Cuda(_) => Self {
                dtype: DType::BF16,
                attention: AttentionImpl::FlashAttention2,
            },
            Accelerator::Metal => Self {
                dtype: DType::F16,
                attention: AttentionImpl::Eager,
            },
        }
    }

    /// Same precision with eager attention, used when a flash-attention load fails.
    pub fn with_eager_attention(self) -> Self {
        Self {
            attention: AttentionImpl::Eager,
            ..self
        }
    }

    /// Dtype name as PyTorch spells it.
    pub fn dtype_name(&self) -> &'static str {
        match self.dtype {
            DType::BF16 => "bfloat16",
            DType::F16 => "float16",
            _ => "float32",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(Accelerator::parse("cuda").unwrap(), Accelerator::Cuda(0));
        assert_eq!(Accelerator::parse("CUDA:2").unwrap(), Accelerator::Cuda(2));
        assert_eq!(Accelerator::parse("mps").unwrap(), Accelerator::Metal);
        assert_eq!(Accelerator::parse("metal").unwrap(), Accelerator::Metal);
        assert!(Accelerator::parse("cuda:x").is_err());
        assert!(Accelerator::parse("tpu").is_err());
    }

    #[test]
    fn test_cpu_is_rejected_with_guidance() {
        for s in ["cpu", "auto"] {
            let err = Accelerator::parse(s).unwrap_err();
            assert!(matches!(err, VoiceCloneError::InvalidInput(_)));
            assert!(err.to_string().contains("--device"));
        }
    }

    #[test]
    fn test_display_round_trips() {
        for acc in [Accelerator::Cuda(0), Accelerator::Cuda(3), Accelerator::Metal] {
            assert_eq!(acc.to_string().parse::<Accelerator>().unwrap(), acc);
        }
        assert_eq!(Accelerator::Metal.torch_name(), "mps");
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Accelerator::Cuda(1)).unwrap();
        assert_eq!(json, "\"cuda:1\"");
        let back: Accelerator = serde_json::from_str("\"mps\"").unwrap();
        assert_eq!(back, Accelerator::Metal);
        assert!(serde_json::from_str::<Accelerator>("\"cpu\"").is_err());
    }

    #[test]
    fn test_runtime_params() {
        let cuda = RuntimeParams::for_accelerator(Accelerator::Cuda(0));
        assert_eq!(cuda.dtype, DType::BF16);
        assert_eq!(cuda.attention, AttentionImpl::FlashAttention2);
        assert_eq!(cuda.with_eager_attention().attention, AttentionImpl::Eager);
        assert_eq!(cuda.dtype_name(), "bfloat16");

        let metal = RuntimeParams::for_accelerator(Accelerator::Metal);
        assert_eq!(metal.dtype, DType::F16);
        assert_eq!(metal.attention, AttentionImpl::Eager);
    }
}

//! Logging setup for the binaries, plus feature-gated profiling via `tracing-chrome`.
//!
//! With the `profiling` feature, [`init`] installs a Chrome trace layer next
//! to the usual formatter. The pipeline's `voice_clone` and `chunk` spans then
//! show up as a timeline in `chrome://tracing` or
//! [Perfetto](https://ui.perfetto.dev). The trace path comes from
//! `VOICECLONE_TRACE` and defaults to `trace.json`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that flushes the trace file on drop.
///
/// Hold this in `main()`; the trace is written when the guard is dropped.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

/// Zero-size guard when profiling is disabled.
#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: `fmt` output filtered by `RUST_LOG`
/// (default `info`), plus the Chrome layer when profiling is compiled in.
///
/// Returns `Some(guard)` only when the Chrome layer is active.
///
/// ```rust,ignore
/// let _guard = qwen3_voiceclone::profiling::init();
/// ```
pub fn init() -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;

        let path = std::env::var("VOICECLONE_TRACE").unwrap_or_else(|_| "trace.json".to_string());
        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(&path)
            .include_args(true)
            .build();

        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .with(chrome_layer)
            .init();

        tracing::info!("Profiling enabled, trace will be written to {path}");
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    }
}

//! Execution provider catalog and the accelerator registry built on top of it.

use std::fmt;

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, MIGraphXExecutionProvider,
    OpenVINOExecutionProvider, ROCmExecutionProvider,
};
use ort::session::{builder::SessionBuilder, Session};
use tracing::debug;

/// Hardware backend a session can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Provider {
    #[default]
    Auto,
    Cpu,
    CoreMl,
    Cuda,
    MiGraphX,
    OpenVino,
    DirectMl,
}

/// One row of the provider table.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDesc {
    pub value: Provider,
    /// Persisted form, matches the runtime's provider naming.
    pub config_string: &'static str,
    pub display_name: &'static str,
    /// Build-time platform guard. Unavailable rows are hidden from pickers.
    pub available: bool,
}

pub const PROVIDERS: [ProviderDesc; 7] = [
    ProviderDesc {
        value: Provider::Auto,
        config_string: "auto",
        display_name: "auto",
        available: true,
    },
    ProviderDesc {
        value: Provider::Cpu,
        config_string: "CPU",
        display_name: "CPU",
        available: true,
    },
    ProviderDesc {
        value: Provider::CoreMl,
        config_string: "CoreML",
        display_name: "Apple CoreML",
        available: cfg!(target_os = "macos"),
    },
    ProviderDesc {
        value: Provider::Cuda,
        config_string: "CUDA",
        display_name: "NVIDIA CUDA",
        available: cfg!(target_os = "linux"),
    },
    ProviderDesc {
        value: Provider::MiGraphX,
        config_string: "MIGraphX",
        display_name: "AMD MIGraphX",
        available: cfg!(target_os = "linux"),
    },
    ProviderDesc {
        value: Provider::OpenVino,
        config_string: "OpenVINO",
        display_name: "Intel OpenVINO",
        available: cfg!(any(
            target_os = "linux",
            all(target_os = "macos", target_arch = "x86_64")
        )),
    },
    ProviderDesc {
        value: Provider::DirectMl,
        config_string: "DirectML",
        display_name: "Windows DirectML",
        available: cfg!(target_os = "windows"),
    },
];

/// Older config files spelled the AMD provider this way.
const LEGACY_ALIASES: [(&str, Provider); 1] = [("ROCm", Provider::MiGraphX)];

impl Provider {
    pub fn desc(self) -> &'static ProviderDesc {
        // the table covers every variant
        PROVIDERS
            .iter()
            .find(|d| d.value == self)
            .unwrap_or(&PROVIDERS[0])
    }

    pub fn config_string(self) -> &'static str {
        self.desc().config_string
    }

    pub fn display_name(self) -> &'static str {
        self.desc().display_name
    }

    pub fn is_available(self) -> bool {
        self.desc().available
    }

    /// Parse a persisted provider string.
    ///
    /// Matching is case-insensitive against both the config string and the display
    /// name, legacy aliases are accepted, and anything unrecognised means `Auto`.
    pub fn from_config(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Self::Auto;
        }
        if let Some(d) = PROVIDERS.iter().find(|d| {
            d.config_string.eq_ignore_ascii_case(s) || d.display_name.eq_ignore_ascii_case(s)
        }) {
            return d.value;
        }
        LEGACY_ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(s))
            .map(|(_, p)| *p)
            .unwrap_or(Self::Auto)
    }

    /// Providers the platform can actually offer, in table order.
    pub fn available() -> impl Iterator<Item = Provider> {
        PROVIDERS.iter().filter(|d| d.available).map(|d| d.value)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for Provider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_config(s))
    }
}

/// A concrete accelerator the registry knows how to enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    CoreMl,
    Cuda,
    MiGraphX,
    /// Legacy AMD provider, tried when MIGraphX is missing.
    Rocm,
    OpenVino,
    DirectMl,
}

impl Accelerator {
    pub fn name(self) -> &'static str {
        match self {
            Self::CoreMl => "CoreML",
            Self::Cuda => "CUDA",
            Self::MiGraphX => "MIGraphX",
            Self::Rocm => "ROCm",
            Self::OpenVino => "OpenVINO",
            Self::DirectMl => "DirectML",
        }
    }

    /// Catalog entry this accelerator serves.
    pub fn provider(self) -> Provider {
        match self {
            Self::CoreMl => Provider::CoreMl,
            Self::Cuda => Provider::Cuda,
            Self::MiGraphX | Self::Rocm => Provider::MiGraphX,
            Self::OpenVino => Provider::OpenVino,
            Self::DirectMl => Provider::DirectMl,
        }
    }

    /// Typed enable call for this accelerator. Registration errors are surfaced so
    /// the caller can move to the next candidate.
    pub fn dispatch(self) -> ExecutionProviderDispatch {
        let ep = match self {
            Self::CoreMl => CoreMLExecutionProvider::default().build(),
            Self::Cuda => CUDAExecutionProvider::default().build(),
            Self::MiGraphX => MIGraphXExecutionProvider::default().build(),
            Self::Rocm => ROCmExecutionProvider::default().build(),
            Self::OpenVino => OpenVINOExecutionProvider::default().build(),
            Self::DirectMl => DirectMLExecutionProvider::default().build(),
        };
        ep.error_on_failure()
    }
}

/// Candidate accelerators for a provider preference, most preferred first.
///
/// Each entry is tried in turn and the first one that registers wins. An empty
/// chain means plain CPU.
pub fn accelerator_chain(provider: Provider) -> Vec<Accelerator> {
    match provider {
        Provider::Auto => auto_chain(),
        Provider::Cpu => Vec::new(),
        Provider::CoreMl => vec![Accelerator::CoreMl],
        Provider::Cuda => vec![Accelerator::Cuda],
        Provider::MiGraphX => vec![Accelerator::MiGraphX, Accelerator::Rocm],
        Provider::OpenVino => vec![Accelerator::OpenVino],
        Provider::DirectMl => vec![Accelerator::DirectMl],
    }
}

fn auto_chain() -> Vec<Accelerator> {
    if cfg!(target_vendor = "apple") {
        vec![Accelerator::CoreMl]
    } else if cfg!(target_os = "windows") {
        vec![Accelerator::DirectMl]
    } else if cfg!(target_os = "linux") {
        vec![Accelerator::Cuda, Accelerator::MiGraphX, Accelerator::Rocm]
    } else {
        Vec::new()
    }
}

/// Try to enable `provider` on `builder`.
///
/// Returns the builder carrying the first accelerator that registered, or `None`
/// when every candidate failed. Builders are consumed by the runtime on failure,
/// so `fresh` produces a new one for each attempt.
pub(crate) fn enable_accelerator<F>(
    provider: Provider,
    mut fresh: F,
) -> ort::Result<Option<(SessionBuilder, Option<Accelerator>)>>
where
    F: FnMut() -> ort::Result<SessionBuilder>,
{
    let chain = accelerator_chain(provider);
    if chain.is_empty() {
        let builder = fresh()?
            .with_execution_providers([CPUExecutionProvider::default().build()])?;
        return Ok(Some((builder, None)));
    }

    for acc in chain {
        match fresh()?.with_execution_providers([acc.dispatch()]) {
            Ok(builder) => {
                debug!(accelerator = acc.name(), "execution provider enabled");
                return Ok(Some((builder, Some(acc))));
            }
            Err(e) => {
                debug!(accelerator = acc.name(), error = %e, "execution provider unavailable");
            }
        }
    }
    Ok(None)
}

/// Preflight whether `provider` can be enabled, without creating a session.
///
/// `Auto` and `Cpu` are always usable. Never panics.
pub fn probe(provider: Provider) -> bool {
    match provider {
        Provider::Auto | Provider::Cpu => true,
        _ => {
            if crate::environment::runtime().is_err() {
                return false;
            }
            match enable_accelerator(provider, Session::builder) {
                Ok(Some((_, Some(_)))) => true,
                Ok(_) => false,
                Err(e) => {
                    debug!(provider = %provider, error = %e, "probe failed");
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_config_and_display_names() {
        assert_eq!(Provider::from_config("CUDA"), Provider::Cuda);
        assert_eq!(Provider::from_config("cuda"), Provider::Cuda);
        assert_eq!(Provider::from_config("NVIDIA CUDA"), Provider::Cuda);
        assert_eq!(Provider::from_config("apple coreml"), Provider::CoreMl);
        assert_eq!(Provider::from_config("cpu"), Provider::Cpu);
    }

    #[test]
    fn parse_tolerates_legacy_and_unknown() {
        assert_eq!(Provider::from_config("ROCm"), Provider::MiGraphX);
        assert_eq!(Provider::from_config("rocm"), Provider::MiGraphX);
        assert_eq!(Provider::from_config("tpu"), Provider::Auto);
        assert_eq!(Provider::from_config(""), Provider::Auto);
    }

    #[test]
    fn config_strings_round_trip() {
        for d in PROVIDERS.iter() {
            assert_eq!(Provider::from_config(d.config_string), d.value);
            assert_eq!(d.value.desc().value, d.value);
        }
    }

    #[test]
    fn auto_and_cpu_always_available() {
        assert!(Provider::Auto.is_available());
        assert!(Provider::Cpu.is_available());
        let avail: Vec<_> = Provider::available().collect();
        assert!(avail.contains(&Provider::Auto));
        assert!(avail.contains(&Provider::Cpu));
    }

    #[test]
    fn migraphx_falls_back_to_rocm() {
        assert_eq!(
            accelerator_chain(Provider::MiGraphX),
            vec![Accelerator::MiGraphX, Accelerator::Rocm]
        );
        assert!(accelerator_chain(Provider::Cpu).is_empty());
    }

    #[test]
    fn probe_trivial_providers() {
        assert!(probe(Provider::Auto));
        assert!(probe(Provider::Cpu));
    }

    #[test]
    fn probe_never_panics() {
        for d in PROVIDERS.iter() {
            let _ = probe(d.value);
        }
    }

    #[test]
    fn display_uses_display_name() {
        assert_eq!(Provider::DirectMl.to_string(), "Windows DirectML");
        assert_eq!(Provider::Auto.config_string(), "auto");
    }
}

//! Environment capability resolution.
//!
//! Some hosts measure more accurately with a particular number of streams,
//! cannot observe outbound progress, or cannot post large bodies. A
//! [`CapabilityResolver`] describes the environment once per run, and
//! [`apply_capabilities`] folds that description into the settings before
//! the first phase starts.

use crate::config::{Overrides, Settings};
use log::debug;
use std::fmt;
use std::str::FromStr;

/// What the environment can and cannot do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentCapabilities {
    /// Download stream count known to measure best here.
    pub preferred_download_streams: Option<u32>,
    /// Upload stream count known to measure best here.
    pub preferred_upload_streams: Option<u32>,
    /// Outbound progress events cannot be trusted.
    pub upload_progress_unreliable: bool,
    /// Largest upload body, in MiB, the environment accepts.
    pub max_upload_megabytes: Option<u32>,
}

/// Describes the environment a run executes in.
pub trait CapabilityResolver: Send + Sync {
    fn resolve(&self) -> EnvironmentCapabilities;
}

impl CapabilityResolver for EnvironmentCapabilities {
    fn resolve(&self) -> EnvironmentCapabilities {
        self.clone()
    }
}

/// Built-in environment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvironmentProfile {
    /// No adjustments.
    #[default]
    Standard,
    /// Upload measures best over a single stream.
    SingleUpload,
    /// Memory constrained: small upload bodies, fewer download streams.
    Constrained,
    /// Outbound progress is not reported; upload falls back to small
    /// requests.
    NoUploadProgress,
}

impl CapabilityResolver for EnvironmentProfile {
    fn resolve(&self) -> EnvironmentCapabilities {
        match self {
            EnvironmentProfile::Standard => EnvironmentCapabilities::default(),
            EnvironmentProfile::SingleUpload => EnvironmentCapabilities {
                preferred_upload_streams: Some(1),
                ..Default::default()
            },
            EnvironmentProfile::Constrained => EnvironmentCapabilities {
                preferred_download_streams: Some(5),
                max_upload_megabytes: Some(4),
                ..Default::default()
            },
            EnvironmentProfile::NoUploadProgress => EnvironmentCapabilities {
                preferred_download_streams: Some(3),
                upload_progress_unreliable: true,
                ..Default::default()
            },
        }
    }
}

impl FromStr for EnvironmentProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(EnvironmentProfile::Standard),
            "single-upload" => Ok(EnvironmentProfile::SingleUpload),
            "constrained" => Ok(EnvironmentProfile::Constrained),
            "no-upload-progress" => Ok(EnvironmentProfile::NoUploadProgress),
            other => Err(format!(
                "unknown profile '{}' (expected standard, single-upload, \
                 constrained or no-upload-progress)",
                other
            )),
        }
    }
}

impl fmt::Display for EnvironmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentProfile::Standard => "standard",
            EnvironmentProfile::SingleUpload => "single-upload",
            EnvironmentProfile::Constrained => "constrained",
            EnvironmentProfile::NoUploadProgress => "no-upload-progress",
        };
        f.write_str(name)
    }
}

/// Fold capabilities into settings.
///
/// Stream preferences only apply with `enable_quirks` and never replace a
/// count the host set explicitly. Hard limits always apply.
pub fn apply_capabilities(
    settings: &mut Settings,
    overrides: &Overrides,
    capabilities: &EnvironmentCapabilities,
) {
    if settings.enable_quirks {
        if let Some(streams) = capabilities.preferred_download_streams {
            if !overrides.contains("xhr_dlMultistream") {
                debug!("Using {} download streams for this host", streams);
                settings.download_streams = streams;
            }
        }
        if let Some(streams) = capabilities.preferred_upload_streams {
            if !overrides.contains("xhr_ulMultistream") {
                debug!("Using {} upload streams for this host", streams);
                settings.upload_streams = streams;
            }
        }
    }

    if capabilities.upload_progress_unreliable {
        debug!("Outbound progress unavailable, uploading in small requests");
        settings.upload_fallback = true;
    }

    if let Some(max) = capabilities.max_upload_megabytes {
        settings.upload_megabytes = settings.upload_megabytes.min(max);
    }
}

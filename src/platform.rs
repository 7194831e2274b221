use serde::{Deserialize, Serialize};

/// Description of the host sent with every batch as `session.client`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInfo {
    pub os: String,
    pub browser: Option<String>,
    pub device: Option<String>,
    pub screen_size: ScreenSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub height: u32,
    pub width: u32,
}

/// Supplies platform details on demand. Detection cannot fail.
pub trait PlatformDetector: Send + Sync {
    fn detect(&self) -> PlatformInfo;
}

/// Reports the operating system and architecture the agent was built for.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl PlatformDetector for HostPlatform {
    fn detect(&self) -> PlatformInfo {
        PlatformInfo {
            os: std::env::consts::OS.to_string(),
            browser: None,
            device: Some(std::env::consts::ARCH.to_string()),
            screen_size: ScreenSize::default(),
        }
    }
}

/// Fixed platform details supplied by the host.
#[derive(Debug, Clone)]
pub struct StaticPlatform(pub PlatformInfo);

impl PlatformDetector for StaticPlatform {
    fn detect(&self) -> PlatformInfo {
        self.0.clone()
    }
}

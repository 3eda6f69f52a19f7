//! Host platform detection and the artifact published for it.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, TunnelError};

/// Platforms the tunnel vendor publishes a binary for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux32,
    Linux64,
    /// 64-bit Linux on musl (Alpine).
    LinuxMusl64,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
            Self::MacOs => write!(f, "darwin-x64"),
            Self::Linux32 => write!(f, "linux-ia32"),
            Self::Linux64 => write!(f, "linux-x64"),
            Self::LinuxMusl64 => write!(f, "alpine"),
        }
    }
}

impl Platform {
    /// Detect the platform this process runs on.
    pub fn detect() -> Result<Self> {
        let os = std::env::consts::OS;
        let musl = os == "linux" && is_musl_host();
        Self::from_parts(os, std::env::consts::ARCH, musl)
    }

    /// Map an OS/arch pair (as in `std::env::consts`) to a platform.
    pub fn from_parts(os: &str, arch: &str, musl: bool) -> Result<Self> {
        match (os, arch) {
            ("windows", _) => Ok(Self::Windows),
            ("macos", "x86_64" | "aarch64") => Ok(Self::MacOs),
            ("linux", "x86_64") if musl => Ok(Self::LinuxMusl64),
            ("linux", "x86_64") => Ok(Self::Linux64),
            ("linux", "x86") => Ok(Self::Linux32),
            _ => Err(TunnelError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    pub const fn is_windows(self) -> bool {
        matches!(self, Self::Windows)
    }

    /// Name of the downloadable artifact for `binary_name`.
    pub fn artifact_name(self, binary_name: &str) -> String {
        match self {
            Self::Windows => format!("{binary_name}.exe"),
            other => format!("{binary_name}-{other}"),
        }
    }

    /// File name the binary is cached under.
    pub fn binary_file_name(self, binary_name: &str) -> String {
        if self.is_windows() {
            format!("{binary_name}.exe")
        } else {
            binary_name.to_string()
        }
    }
}

/// Parse `/etc/os-release` content into key-value pairs.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim_matches('"');
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Whether the release metadata describes a musl-based distribution.
pub fn is_musl_release(release: &HashMap<String, String>) -> bool {
    let mentions_alpine = |key: &str| {
        release
            .get(key)
            .is_some_and(|v| v.to_ascii_lowercase().contains("alpine"))
    };
    mentions_alpine("ID") || mentions_alpine("ID_LIKE")
}

fn is_musl_host() -> bool {
    if cfg!(target_env = "musl") {
        return true;
    }
    match std::fs::read_to_string("/etc/os-release") {
        Ok(content) => is_musl_release(&parse_os_release(&content)),
        Err(e) => {
            tracing::debug!(error = %e, "could not read /etc/os-release, assuming glibc");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn windows_any_arch() {
        assert_eq!(
            Platform::from_parts("windows", "x86", false).unwrap(),
            Platform::Windows
        );
    }

    #[test]
    fn macos_intel_and_apple_silicon() {
        assert_eq!(
            Platform::from_parts("macos", "x86_64", false).unwrap(),
            Platform::MacOs
        );
        assert_eq!(
            Platform::from_parts("macos", "aarch64", false).unwrap(),
            Platform::MacOs
        );
    }

    #[test]
    fn linux_variants() {
        assert_eq!(
            Platform::from_parts("linux", "x86_64", false).unwrap(),
            Platform::Linux64
        );
        assert_eq!(
            Platform::from_parts("linux", "x86_64", true).unwrap(),
            Platform::LinuxMusl64
        );
        assert_eq!(
            Platform::from_parts("linux", "x86", false).unwrap(),
            Platform::Linux32
        );
    }

    #[test]
    fn unsupported() {
        let err = Platform::from_parts("linux", "riscv64", false).unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedPlatform { .. }));
        assert!(Platform::from_parts("freebsd", "x86_64", false).is_err());
    }

    #[test]
    fn artifact_names() {
        let name = "BrowserStackLocal";
        assert_eq!(
            Platform::Windows.artifact_name(name),
            "BrowserStackLocal.exe"
        );
        assert_eq!(
            Platform::MacOs.artifact_name(name),
            "BrowserStackLocal-darwin-x64"
        );
        assert_eq!(
            Platform::Linux64.artifact_name(name),
            "BrowserStackLocal-linux-x64"
        );
        assert_eq!(
            Platform::Linux32.artifact_name(name),
            "BrowserStackLocal-linux-ia32"
        );
        assert_eq!(
            Platform::LinuxMusl64.artifact_name(name),
            "BrowserStackLocal-alpine"
        );
    }

    #[test]
    fn binary_file_names() {
        assert_eq!(Platform::Windows.binary_file_name("T"), "T.exe");
        assert_eq!(Platform::Linux64.binary_file_name("T"), "T");
    }

    #[test]
    fn os_release_alpine() {
        let release = parse_os_release(
            "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.19.1\n# comment\n",
        );
        assert_eq!(release.get("ID").map(String::as_str), Some("alpine"));
        assert_eq!(
            release.get("NAME").map(String::as_str),
            Some("Alpine Linux")
        );
        assert!(is_musl_release(&release));
    }

    #[test]
    fn os_release_ubuntu() {
        let release = parse_os_release("ID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\n");
        assert!(!is_musl_release(&release));
    }
}

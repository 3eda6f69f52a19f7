//! Binary provisioning: locate, download, cache and validate the tunnel
//! executable.
//!
//! Concurrent first-time downloads into a shared cache are not coordinated
//! across processes. Each download is written to a temp file and renamed into
//! place, so the last writer wins and validation catches anything broken.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use tracing::{debug, info, warn};

use crate::config::VendorProfile;
use crate::error::{Result, TunnelError};
use crate::platform::Platform;

const VERSION_FLAG: &str = "--version";
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// `<major>.<minor>` reported by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BinaryVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for BinaryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A validated tunnel executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub path: PathBuf,
    pub version: BinaryVersion,
}

/// Outcome of running the version query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(BinaryVersion),
    /// The binary ran but did not identify itself; carries what it printed.
    Mismatch(String),
}

/// Finds or fetches the tunnel binary for this host.
#[derive(Debug)]
pub struct BinaryProvisioner {
    vendor: VendorProfile,
    platform: Option<Platform>,
    search_dirs: Vec<PathBuf>,
    http: reqwest::Client,
}

impl BinaryProvisioner {
    /// Provisioner for the host platform, detected when first needed.
    pub fn new(vendor: VendorProfile) -> Result<Self> {
        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .user_agent(concat!("tunnelward/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TunnelError::Download {
                url: vendor.download_base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            search_dirs: default_search_dirs(&vendor),
            vendor,
            platform: None,
            http,
        })
    }

    /// Provisioner for an explicit platform instead of the host's.
    pub fn for_platform(vendor: VendorProfile, platform: Platform) -> Result<Self> {
        let mut provisioner = Self::new(vendor)?;
        provisioner.platform = Some(platform);
        Ok(provisioner)
    }

    /// Replace the ordered list of candidate cache directories.
    #[must_use]
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// Replace the HTTP client, e.g. to bypass the system proxy.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    fn platform(&self) -> Result<Platform> {
        self.platform.map_or_else(Platform::detect, Ok)
    }

    pub fn download_url(&self) -> Result<String> {
        let artifact = self.platform()?.artifact_name(&self.vendor.binary_name);
        Ok(format!(
            "{}/{artifact}",
            self.vendor.download_base_url.trim_end_matches('/')
        ))
    }

    /// Return a validated binary, downloading it if needed.
    ///
    /// With `explicit` the binary lives exactly there; otherwise in the first
    /// usable search directory. A binary that fails validation is deleted and
    /// fetched again once; a second failure is [`TunnelError::CorruptBinary`].
    pub async fn ensure_binary(&self, explicit: Option<&Path>) -> Result<BinaryInfo> {
        let target = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let file_name = self.platform()?.binary_file_name(&self.vendor.binary_name);
                self.resolve_directory()?.join(file_name)
            }
        };

        let mut refetched = false;
        loop {
            if target.exists() {
                debug!(path = %target.display(), "Using cached tunnel binary");
            } else {
                self.download(&target).await?;
            }

            match query_version(&target, &self.vendor.product_name).await {
                Validation::Valid(version) => {
                    info!(path = %target.display(), %version, "Tunnel binary validated");
                    return Ok(BinaryInfo {
                        path: target,
                        version,
                    });
                }
                Validation::Mismatch(output) if !refetched => {
                    warn!(
                        path = %target.display(),
                        output = %output,
                        "Tunnel binary failed validation, downloading again"
                    );
                    std::fs::remove_file(&target)?;
                    refetched = true;
                }
                Validation::Mismatch(output) => {
                    return Err(TunnelError::CorruptBinary {
                        path: target,
                        output,
                    });
                }
            }
        }
    }

    /// First search directory that exists or can be created.
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        for dir in &self.search_dirs {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
            match std::fs::create_dir_all(dir) {
                Ok(()) => return Ok(dir.clone()),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unusable directory");
                }
            }
        }
        Err(TunnelError::NoWritableLocation {
            tried: self.search_dirs.clone(),
        })
    }

    async fn download(&self, target: &Path) -> Result<()> {
        let url = self.download_url()?;
        info!(url = %url, path = %target.display(), "Downloading tunnel binary");

        let fail = |reason: String| TunnelError::Download {
            url: url.clone(),
            reason,
        };

        let response = self
            .http
            .get(&url)
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| fail(e.to_string()))?;

        let gzip_encoded = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
        let body = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        debug!(bytes = body.len(), gzip_encoded, "Download complete");

        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let contents = decode_body(&body, gzip_encoded);
            write_executable(&target, &contents)
        })
        .await
        .map_err(|e| fail(e.to_string()))?
    }
}

/// Home cache dir, working dir, temp dir, in that order.
pub fn default_search_dirs(vendor: &VendorProfile) -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(3);
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(&vendor.cache_dir_name));
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    dirs.push(std::env::temp_dir());
    dirs
}

/// Decompress a gzip body, or return it unchanged if it is not gzip or
/// cannot be decompressed.
pub fn decode_body(body: &[u8], gzip_encoded: bool) -> Vec<u8> {
    if gzip_encoded || body.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        match GzDecoder::new(body).read_to_end(&mut decoded) {
            Ok(_) => return decoded,
            Err(e) => warn!(error = %e, "gzip decoding failed, keeping body as-is"),
        }
    }
    body.to_vec()
}

/// Atomically write `contents` to `target` with owner-only rwx permissions.
fn write_executable(target: &Path, contents: &[u8]) -> Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(contents)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))?;
    }

    tmp.persist(target).map_err(|e| TunnelError::Io(e.error))?;
    Ok(())
}

/// Run `<binary> --version` and check it against the product pattern.
///
/// A binary that cannot be executed at all counts as a mismatch, since a
/// truncated download usually fails that way.
pub async fn query_version(binary: &Path, product_name: &str) -> Validation {
    let run = tokio::process::Command::new(binary)
        .arg(VERSION_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(VERSION_QUERY_TIMEOUT, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Validation::Mismatch(format!("failed to execute: {e}")),
        Err(_) => return Validation::Mismatch("version query timed out".to_string()),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_version(&stdout, product_name) {
        Some(version) => Validation::Valid(version),
        None => Validation::Mismatch(stdout.trim().to_string()),
    }
}

/// Extract `<major>.<minor>` from `"<product> version <major>.<minor>"`.
pub fn parse_version(output: &str, product_name: &str) -> Option<BinaryVersion> {
    let pattern = format!(r"{} version (\d+)\.(\d+)", regex::escape(product_name));
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(output)?;
    Some(BinaryVersion {
        major: caps.get(1)?.as_str().parse().ok()?,
        minor: caps.get(2)?.as_str().parse().ok()?,
    })
}

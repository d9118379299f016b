//! Self-update from the release feed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use serde::Deserialize;

pub const DEFAULT_FEED: &str = "https://api.github.com/repos/ehang-io/nps/releases/latest";
/// Overrides [`DEFAULT_FEED`].
pub const ENV_UPDATE_FEED: &str = "NPC_UPDATE_FEED";

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// Release asset built for this host, e.g. `npc-linux-x86_64`.
pub fn asset_name() -> String {
    let suffix = if cfg!(windows) { ".exe" } else { "" };
    format!(
        "npc-{}-{}{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        suffix
    )
}

fn version_parts(tag: &str) -> Vec<u64> {
    tag.trim_start_matches('v')
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

/// Whether `tag` names a later version than `current`.
pub fn is_newer(tag: &str, current: &str) -> bool {
    let mut latest = version_parts(tag);
    let mut running = version_parts(current);
    let len = latest.len().max(running.len());
    latest.resize(len, 0);
    running.resize(len, 0);
    latest > running
}

impl Release {
    pub fn asset_for_host(&self) -> Option<&Asset> {
        let wanted = asset_name();
        self.assets.iter().find(|asset| asset.name == wanted)
    }
}

/// Swap `exe` for `contents`, keeping the previous binary on Windows
/// where a running executable cannot be replaced.
pub fn replace_executable(exe: &Path, contents: &[u8]) -> Result<()> {
    let staged = sibling(exe, "new");
    fs::write(&staged, contents).with_context(|| format!("writing {}", staged.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
    }
    if cfg!(windows) {
        let previous = sibling(exe, "old");
        let _ = fs::remove_file(&previous);
        fs::rename(exe, &previous)
            .with_context(|| format!("moving aside {}", exe.display()))?;
    }
    fs::rename(&staged, exe).with_context(|| format!("replacing {}", exe.display()))?;
    Ok(())
}

fn sibling(exe: &Path, extension: &str) -> PathBuf {
    let mut name = exe.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    exe.with_file_name(name)
}

/// Download and install the latest release if it is newer than this build.
pub fn run_update(feed: &str) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("npc/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(120))
        .build()?;

    info!("checking {} for updates", feed);
    let release: Release = client
        .get(feed)
        .send()
        .and_then(|resp| resp.error_for_status())
        .context("fetching release feed")?
        .json()
        .context("decoding release feed")?;

    let current = env!("CARGO_PKG_VERSION");
    if !is_newer(&release.tag_name, current) {
        info!("already up to date ({} >= {})", current, release.tag_name);
        return Ok(());
    }

    let asset = release
        .asset_for_host()
        .ok_or_else(|| anyhow!("release {} has no asset {}", release.tag_name, asset_name()))?;
    info!("downloading {}", asset.browser_download_url);
    let bytes = client
        .get(&asset.browser_download_url)
        .send()
        .and_then(|resp| resp.error_for_status())
        .context("downloading release asset")?
        .bytes()?;

    let exe = std::env::current_exe().context("locating the running executable")?;
    replace_executable(&exe, &bytes)?;
    warn!(
        "updated {} to {}, restart the service to use it",
        exe.display(),
        release.tag_name
    );
    Ok(())
}

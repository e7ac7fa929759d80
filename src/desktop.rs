//! # Desktop Backends
//!
//! Platform implementations of [`DesktopBackend`].
//!
//! ## COSMIC (Linux)
//! COSMIC reads its background configuration from RON files under
//! `~/.config/cosmic/com.system76.CosmicBackground/v1/`. The `all` key covers
//! every output; `output.<name>` keys override single outputs when
//! `same-on-all` is false. After writing, `cosmic-bg` is restarted because it
//! has no reload API.
//!
//! Outputs are enumerated with `wlr-randr`. When it is missing, a single
//! pseudo-display named `all` is reported and the `all` key is written.
//!
//! ## macOS
//! Desktops are counted and set through `osascript` / System Events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::wallpaper::{DesktopBackend, Display};

/// Backend for the current platform.
pub fn default_backend() -> Arc<dyn DesktopBackend> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacBackend)
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(CosmicBackend::new())
    }
}

/// Checks if the application is running inside a Flatpak sandbox.
pub fn is_flatpak() -> bool {
    Path::new("/.flatpak-info").exists()
}

/// Runs a command on the host, going through `flatpak-spawn --host` when sandboxed.
fn run_host_command(cmd: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    if is_flatpak() {
        let mut spawn_args = vec!["--host", cmd];
        spawn_args.extend(args);
        std::process::Command::new("flatpak-spawn")
            .args(&spawn_args)
            .output()
    } else {
        std::process::Command::new(cmd).args(args).output()
    }
}

/// Spawns a command on the host without waiting for it.
fn spawn_host_command(cmd: &str) -> std::io::Result<std::process::Child> {
    if is_flatpak() {
        std::process::Command::new("flatpak-spawn")
            .args(["--host", cmd])
            .spawn()
    } else {
        std::process::Command::new(cmd).spawn()
    }
}

/// Escapes a string for use inside a double-quoted RON or AppleScript literal.
fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Name of the pseudo-display used when outputs cannot be enumerated.
pub const ALL_OUTPUTS: &str = "all";

#[derive(Debug, Clone)]
#[cfg_attr(target_os = "macos", allow(dead_code))]
pub struct CosmicBackend {
    config_dir: PathBuf,
    restart_renderer: bool,
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
impl CosmicBackend {
    pub fn new() -> Self {
        // home_dir() rather than config_dir(): inside Flatpak config_dir() points
        // into the sandbox, but COSMIC reads the host's ~/.config.
        let config_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".config/cosmic/com.system76.CosmicBackground/v1");
        Self::with_config_dir(config_dir)
    }

    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            restart_renderer: true,
        }
    }

    /// Skips restarting `cosmic-bg` after a commit.
    #[cfg(test)]
    pub fn without_restart(mut self) -> Self {
        self.restart_renderer = false;
        self
    }

    fn write_key(&self, key: &str, value: &str) -> Result<(), String> {
        std::fs::create_dir_all(&self.config_dir)
            .map_err(|e| format!("failed to create config dir: {e}"))?;
        std::fs::write(self.config_dir.join(key), value)
            .map_err(|e| format!("failed to write {key}: {e}"))
    }

    /// Restarts `cosmic-bg` so it picks up the new configuration.
    fn restart_cosmic_bg(&self) -> Result<(), String> {
        let _ = run_host_command("pkill", &["-TERM", "-x", "cosmic-bg"]);

        // Give COSMIC a moment to auto-restart cosmic-bg
        std::thread::sleep(std::time::Duration::from_millis(1000));

        match run_host_command("pgrep", &["-x", "cosmic-bg"]) {
            Ok(output) if output.status.success() => Ok(()),
            _ => {
                spawn_host_command("cosmic-bg")
                    .map_err(|e| format!("failed to start cosmic-bg: {e}"))?;
                std::thread::sleep(std::time::Duration::from_millis(500));
                Ok(())
            }
        }
    }
}

impl Default for CosmicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DesktopBackend for CosmicBackend {
    fn displays(&self) -> Result<Vec<Display>, String> {
        match run_host_command("wlr-randr", &[]) {
            Ok(output) if output.status.success() => {
                let displays = parse_wlr_randr(&String::from_utf8_lossy(&output.stdout));
                if displays.is_empty() {
                    Err("wlr-randr reported no enabled outputs".to_string())
                } else {
                    Ok(displays)
                }
            }
            _ => {
                tracing::debug!("wlr-randr unavailable, treating outputs as one display");
                Ok(vec![Display::new(ALL_OUTPUTS, true)])
            }
        }
    }

    fn set_wallpaper(&self, display: &Display, path: &Path) -> Result<(), String> {
        let key = if display.name == ALL_OUTPUTS {
            ALL_OUTPUTS.to_string()
        } else {
            format!("output.{}", display.name)
        };
        self.write_key(&key, &background_entry(&display.name, path))
    }

    /// Adds the applied outputs to `backgrounds`, keeping outputs from earlier
    /// runs so a main-display sync leaves the other displays' entries active.
    fn commit(&self, applied: &[Display]) -> Result<(), String> {
        let new_outputs: Vec<&str> = applied
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| *name != ALL_OUTPUTS)
            .collect();

        if !new_outputs.is_empty() {
            let mut outputs = std::fs::read_to_string(self.config_dir.join("backgrounds"))
                .map(|content| parse_backgrounds(&content))
                .unwrap_or_default();
            for name in new_outputs {
                if !outputs.iter().any(|o| o == name) {
                    outputs.push(name.to_string());
                }
            }

            let list = outputs
                .iter()
                .map(|name| format!("\"{}\"", quote(name)))
                .collect::<Vec<_>>()
                .join(", ");
            self.write_key("same-on-all", "false")?;
            self.write_key("backgrounds", &format!("[{list}]"))?;
        }

        if self.restart_renderer {
            self.restart_cosmic_bg()?;
        }
        Ok(())
    }
}

/// RON background entry for one output.
fn background_entry(output: &str, image: &Path) -> String {
    format!(
        r#"(
    output: "{}",
    source: Path("{}"),
    filter_by_theme: false,
    rotation_frequency: 300,
    filter_method: Lanczos,
    scaling_mode: Zoom,
    sampling_method: Alphanumeric,
)"#,
        quote(output),
        quote(&image.to_string_lossy())
    )
}

/// Output names from a RON string list such as `["DP-1", "eDP-1"]`.
fn parse_backgrounds(content: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut name = String::new();
    let mut in_string = false;
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if !in_string {
            in_string = c == '"';
            continue;
        }
        match c {
            '\\' => name.extend(chars.next()),
            '"' => {
                names.push(std::mem::take(&mut name));
                in_string = false;
            }
            _ => name.push(c),
        }
    }
    names
}

/// Parses `wlr-randr` output into enabled displays; the first is primary.
///
/// Each output starts on an unindented line (`DP-1 "Dell Inc. ..."`), followed
/// by indented properties including `Enabled: yes|no`.
fn parse_wlr_randr(output: &str) -> Vec<Display> {
    let mut names: Vec<(String, bool)> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some(name) = line.split_whitespace().next() {
                names.push((name.to_string(), true));
            }
        } else if let Some(value) = line.trim().strip_prefix("Enabled:") {
            if let Some(last) = names.last_mut() {
                last.1 = value.trim() == "yes";
            }
        }
    }

    names
        .into_iter()
        .filter(|(_, enabled)| *enabled)
        .enumerate()
        .map(|(i, (name, _))| Display::new(name, i == 0))
        .collect()
}

/// macOS backend driven by AppleScript.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub struct MacBackend;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
impl MacBackend {
    fn osascript(script: &str) -> Result<String, String> {
        let output = std::process::Command::new("osascript")
            .arg("-e")
            .arg(script)
            .output()
            .map_err(|e| format!("failed to run osascript: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl DesktopBackend for MacBackend {
    fn displays(&self) -> Result<Vec<Display>, String> {
        let count = Self::osascript("tell application \"System Events\" to count desktops")?;
        let count: usize = count
            .parse()
            .map_err(|_| format!("unexpected desktop count: {count:?}"))?;
        Ok((1..=count)
            .map(|i| Display::new(format!("desktop {i}"), i == 1))
            .collect())
    }

    fn set_wallpaper(&self, display: &Display, path: &Path) -> Result<(), String> {
        let script = format!(
            "tell application \"System Events\" to set picture of {} to POSIX file \"{}\"",
            display.name,
            quote(&path.to_string_lossy())
        );
        Self::osascript(&script).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WLR_RANDR: &str = r#"DP-1 "Dell Inc. DELL U2720Q ABC (DP-1)"
  Make: Dell Inc.
  Model: DELL U2720Q
  Enabled: yes
  Modes:
    3840x2160 px, 59.997002 Hz (preferred, current)
HDMI-A-1 "Unknown (HDMI-A-1)"
  Enabled: no
eDP-1 "BOE 0x0BCA (eDP-1)"
  Enabled: yes
"#;

    #[test]
    fn test_parse_wlr_randr_skips_disabled() {
        let displays = parse_wlr_randr(WLR_RANDR);
        assert_eq!(
            displays,
            vec![Display::new("DP-1", true), Display::new("eDP-1", false)]
        );
    }

    #[test]
    fn test_parse_wlr_randr_empty() {
        assert!(parse_wlr_randr("").is_empty());
    }

    #[test]
    fn test_cosmic_writes_per_output_entries() {
        let tmp = TempDir::new().unwrap();
        let backend = CosmicBackend::with_config_dir(tmp.path()).without_restart();
        let image = Path::new("/data/cache/2024-05-01-UHD.jpg");
        let displays = [Display::new("DP-1", true), Display::new("eDP-1", false)];

        for d in &displays {
            backend.set_wallpaper(d, image).unwrap();
        }
        backend.commit(&displays).unwrap();

        let entry = std::fs::read_to_string(tmp.path().join("output.DP-1")).unwrap();
        assert!(entry.contains(r#"output: "DP-1""#));
        assert!(entry.contains(r#"source: Path("/data/cache/2024-05-01-UHD.jpg")"#));
        assert!(tmp.path().join("output.eDP-1").exists());
        assert_eq!(std::fs::read_to_string(tmp.path().join("same-on-all")).unwrap(), "false");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("backgrounds")).unwrap(),
            r#"["DP-1", "eDP-1"]"#
        );
    }

    #[test]
    fn test_main_only_commit_keeps_other_outputs() {
        let tmp = TempDir::new().unwrap();
        let backend = CosmicBackend::with_config_dir(tmp.path()).without_restart();
        let first = Path::new("/data/cache/2024-05-01-UHD.jpg");
        let second = Path::new("/data/cache/2024-05-02-UHD.jpg");
        let main = Display::new("DP-1", true);
        let laptop = Display::new("eDP-1", false);

        for d in [&main, &laptop] {
            backend.set_wallpaper(d, first).unwrap();
        }
        backend.commit(&[main.clone(), laptop.clone()]).unwrap();

        backend.set_wallpaper(&main, second).unwrap();
        backend.commit(&[main.clone()]).unwrap();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("backgrounds")).unwrap(),
            r#"["DP-1", "eDP-1"]"#
        );
        let laptop_entry = std::fs::read_to_string(tmp.path().join("output.eDP-1")).unwrap();
        assert!(laptop_entry.contains("2024-05-01-UHD.jpg"));
        let main_entry = std::fs::read_to_string(tmp.path().join("output.DP-1")).unwrap();
        assert!(main_entry.contains("2024-05-02-UHD.jpg"));
    }

    #[test]
    fn test_parse_backgrounds() {
        assert_eq!(parse_backgrounds(r#"["DP-1", "eDP-1"]"#), vec!["DP-1", "eDP-1"]);
        assert_eq!(parse_backgrounds(r#"["a\"b"]"#), vec![r#"a"b"#]);
        assert!(parse_backgrounds("[]").is_empty());
    }

    #[test]
    fn test_cosmic_all_pseudo_display() {
        let tmp = TempDir::new().unwrap();
        let backend = CosmicBackend::with_config_dir(tmp.path()).without_restart();
        let all = Display::new(ALL_OUTPUTS, true);

        backend.set_wallpaper(&all, Path::new("/img.jpg")).unwrap();
        backend.commit(&[all]).unwrap();

        let entry = std::fs::read_to_string(tmp.path().join("all")).unwrap();
        assert!(entry.contains(r#"output: "all""#));
        assert!(!tmp.path().join("backgrounds").exists());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#"a\"b\\c"#);
    }
}

use std::path::{Path, PathBuf};

/// Engine-wide tunables, persisted as a plain `key=value` file.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Maximum undo entries kept per document.
    pub max_undo_steps: usize,
    /// History memory cap in megabytes; 0 disables the cap.
    pub max_history_memory_mb: usize,
    pub default_canvas_width: u32,
    pub default_canvas_height: u32,
    /// Blend rows on the rayon pool when compositing.
    pub parallel_compositing: bool,
    /// Write the session log to disk.
    pub log_to_file: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            max_history_memory_mb: 100,
            default_canvas_width: 800,
            default_canvas_height: 600,
            parallel_compositing: true,
            log_to_file: true,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/paintcore/paintcore_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PaintCore\paintcore_settings.cfg
    /// On macOS:   ~/Library/Application Support/PaintCore/paintcore_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("paintcore");
            return Some(config_dir.join("paintcore_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("PaintCore").join("paintcore_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("PaintCore")
                    .join("paintcore_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("paintcore_settings.cfg")))
        }
    }

    /// Parse `key=value` lines. Unknown keys are ignored; bad values keep the default.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        let d = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "max_undo_steps" => {
                    s.max_undo_steps = val.parse().ok().filter(|v| *v > 0).unwrap_or(d.max_undo_steps);
                }
                "max_history_memory_mb" => {
                    s.max_history_memory_mb = val.parse().unwrap_or(d.max_history_memory_mb);
                }
                "default_canvas_width" => {
                    s.default_canvas_width = val.parse().ok().filter(|v| *v > 0).unwrap_or(d.default_canvas_width);
                }
                "default_canvas_height" => {
                    s.default_canvas_height = val.parse().ok().filter(|v| *v > 0).unwrap_or(d.default_canvas_height);
                }
                "parallel_compositing" => {
                    s.parallel_compositing = val == "true";
                }
                "log_to_file" => {
                    s.log_to_file = val == "true";
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_history_memory_mb={}\n\
             default_canvas_width={}\n\
             default_canvas_height={}\n\
             parallel_compositing={}\n\
             log_to_file={}\n",
            self.max_undo_steps,
            self.max_history_memory_mb,
            self.default_canvas_width,
            self.default_canvas_height,
            self.parallel_compositing,
            self.log_to_file,
        )
    }

    /// Load from an explicit file (returns default if missing or unreadable).
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        Self::load_from(&path)
    }

    /// Save settings to disk
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = self.save_to(&path) {
            crate::log_warn!("Settings: could not write {}: {}", path.display(), e);
        }
    }
}

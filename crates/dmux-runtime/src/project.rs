//! Project identity, the `.dmux/` directory layout, and settings I/O.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use dmux_core::settings::Settings;
use dmux_core::types::ProjectConfig;

/// Everything path- and name-shaped about the current project.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub root: PathBuf,
    pub name: String,
    /// `dmux-<name>-<hash8>`, dots replaced with dashes.
    pub session_name: String,
    pub home: PathBuf,
}

impl ProjectContext {
    pub fn discover(root: PathBuf, home: PathBuf) -> Self {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let session_name = session_name(&name, &root);
        ProjectContext {
            root,
            name,
            session_name,
            home,
        }
    }

    pub fn dmux_dir(&self) -> PathBuf {
        self.root.join(".dmux")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dmux_dir().join("dmux.config.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dmux_dir().join("settings.json")
    }

    pub fn global_settings_path(&self) -> PathBuf {
        self.home.join(".dmux.global.json")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.dmux_dir().join("worktrees")
    }

    pub fn worktree_path(&self, slug: &str) -> PathBuf {
        self.worktrees_dir().join(slug)
    }

    pub fn event_pipe_path(&self) -> PathBuf {
        self.dmux_dir().join("events.pipe")
    }

    pub fn hooks_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.root.join(".dmux-hooks"),
            self.dmux_dir().join("hooks"),
            self.home.join(".dmux").join("hooks"),
        ]
    }

    pub fn onboarding_path(&self) -> PathBuf {
        self.home.join(".dmux").join("onboarding.json")
    }

    /// Control pane title shown in the tmux border.
    pub fn control_title(&self) -> String {
        format!("dmux-{}", self.name)
    }
}

/// First 8 hex chars of the sha256 of the project root path.
pub fn hash8(root: &Path) -> String {
    let digest = Sha256::digest(root.display().to_string().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

/// `dmux-<projectName>-<hash8>`, with dots dashed so tmux accepts it.
pub fn session_name(name: &str, root: &Path) -> String {
    let safe = name.replace('.', "-");
    format!("dmux-{}-{}", safe, hash8(root))
}

// ---------------------------------------------------------------------------
// Settings and config file I/O
// ---------------------------------------------------------------------------

fn read_json_value(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "unparseable settings file ignored");
            Value::Null
        }),
        Err(_) => Value::Null,
    }
}

/// Global settings with project settings layered on top.
pub fn load_settings(ctx: &ProjectContext) -> Settings {
    let global = read_json_value(&ctx.global_settings_path());
    let project = read_json_value(&ctx.settings_path());
    Settings::merged(global, project).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid settings, using defaults");
        Settings::default()
    })
}

pub fn save_project_settings(ctx: &ProjectContext, settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(ctx.dmux_dir())?;
    let body = serde_json::to_string_pretty(settings)?;
    write_atomic(&ctx.settings_path(), format!("{body}\n").as_bytes())
}

/// Load the pane config; a missing file is an empty project, an
/// unreadable one is logged and treated as empty rather than crashing.
pub fn load_config(ctx: &ProjectContext) -> ProjectConfig {
    match std::fs::read_to_string(ctx.config_path()) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::error!(error = %e, "config file unparseable, starting with empty pane list");
            ProjectConfig::default()
        }),
        Err(_) => ProjectConfig::default(),
    }
}

/// Whole-file rewrite via tmp + rename so the watcher never reads a
/// half-written config.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("config path has no parent directory")?;
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// One-time onboarding flag in `~/.dmux/onboarding.json`. Returns true
/// on the very first run and records that it happened.
pub fn onboarding_first_run(ctx: &ProjectContext) -> bool {
    let path = ctx.onboarding_path();
    let seen = std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|v| v.get("firstRunShown").and_then(Value::as_bool))
        .unwrap_or(false);
    if seen {
        return false;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(&path, "{\"firstRunShown\":true}\n");
    true
}

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::session::{Session, StartKind};
use crate::{DapError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneLaunchMode {
    /// The project's configured main scene.
    Main,
    /// Whatever scene is open in the editor.
    Current,
    /// A specific scene, e.g. `res://scenes/level_1.tscn`.
    Custom(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Platform {
    #[default]
    Host,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Android => "android",
            Self::Web => "web",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub project: PathBuf,
    pub scene: SceneLaunchMode,
    pub platform: Platform,
    pub no_debug: bool,
    pub profiling: bool,
    pub debug_collisions: bool,
    pub debug_paths: bool,
    pub debug_navigation: bool,
    pub additional_options: Option<String>,
}

impl LaunchConfig {
    pub fn new(project: impl Into<PathBuf>, scene: SceneLaunchMode) -> Self {
        Self {
            project: project.into(),
            scene,
            platform: Platform::Host,
            no_debug: false,
            profiling: false,
            debug_collisions: false,
            debug_paths: false,
            debug_navigation: false,
            additional_options: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.as_os_str().is_empty() {
            return Err(DapError::invalid_argument("project", "project path is required"));
        }
        let project_file = self.project.join("project.godot");
        if !project_file.is_file() {
            return Err(DapError::invalid_argument(
                "project",
                format!("project.godot not found in {}", self.project.display()),
            ));
        }
        if let SceneLaunchMode::Custom(path) = &self.scene {
            if path.is_empty() {
                return Err(DapError::invalid_argument(
                    "scene",
                    "a scene path is required for a custom scene launch",
                ));
            }
        }
        Ok(())
    }

    /// Launch arguments using the key names Godot's adapter reads.
    pub fn to_launch_args(&self) -> Value {
        let scene = match &self.scene {
            SceneLaunchMode::Main => "main".to_string(),
            SceneLaunchMode::Current => "current".to_string(),
            SceneLaunchMode::Custom(path) => path.clone(),
        };

        let mut args = Map::new();
        args.insert("project".into(), json!(self.project.to_string_lossy()));
        args.insert("scene".into(), json!(scene));
        args.insert("platform".into(), json!(self.platform.as_str()));
        args.insert("noDebug".into(), json!(self.no_debug));
        args.insert("profiling".into(), json!(self.profiling));
        args.insert("debug_collisions".into(), json!(self.debug_collisions));
        args.insert("debug_paths".into(), json!(self.debug_paths));
        args.insert("debug_navigation".into(), json!(self.debug_navigation));
        if let Some(options) = self.additional_options.as_deref().filter(|o| !o.is_empty()) {
            args.insert("additional_options".into(), json!(options));
        }
        Value::Object(args)
    }
}

/// Validates `config` and runs the full two-phase launch.
pub async fn launch(session: &Session, config: &LaunchConfig) -> Result<()> {
    config.validate()?;
    if session.project_root().is_none() {
        session.set_project_root(&config.project);
    }
    session
        .start_with_configuration_done(StartKind::Launch, config.to_launch_args())
        .await
}

/// Attaches to a game that is already running. `project` falls back to the
/// session's project root.
pub async fn attach(session: &Session, project: Option<&Path>) -> Result<()> {
    let mut args = Map::new();
    let project = project.map(Path::to_path_buf).or_else(|| session.project_root());
    if let Some(project) = project {
        args.insert("project".into(), json!(project.to_string_lossy()));
    }
    session
        .start_with_configuration_done(StartKind::Attach, Value::Object(args))
        .await
}

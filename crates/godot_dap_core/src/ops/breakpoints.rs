use std::path::{Path, PathBuf};

use crate::session::{Session, SessionState};
use crate::types::{
    to_arguments, Breakpoint, SetBreakpointsArguments, SetBreakpointsBody, Source,
    SourceBreakpoint,
};
use crate::{DapError, Result};

const BREAKPOINT_STATES: &[SessionState] = &[
    SessionState::Initialized,
    SessionState::Configured,
    SessionState::Launched,
];

/// Turns a user-supplied script path into the absolute path Godot expects.
/// `res://` paths need a project root; absolute paths pass through.
pub fn resolve_godot_path(path: &str, project_root: Option<&Path>) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(DapError::invalid_argument("path", "path cannot be empty"));
    }

    if let Some(relative) = path.strip_prefix("res://") {
        let root = project_root.ok_or_else(|| {
            DapError::invalid_argument(
                "path",
                format!(
                    "cannot resolve '{path}': project root not set (pass 'project' to godot_connect or use an absolute path)"
                ),
            )
        })?;
        return Ok(root.join(relative));
    }

    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    Err(DapError::invalid_argument(
        "path",
        format!("must be absolute or start with res:// (got: {path})"),
    ))
}

/// Replaces every breakpoint in `file` with `lines`. DAP has no
/// per-line add, so the session remembers what each file already has.
pub async fn set_breakpoints(
    session: &Session,
    file: &str,
    lines: &[u32],
) -> Result<Vec<Breakpoint>> {
    let path = resolve_godot_path(file, session.project_root().as_deref())?;
    let path = path.to_string_lossy().into_owned();

    let arguments = to_arguments(&SetBreakpointsArguments {
        source: Source {
            name: Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            path: Some(path.clone()),
        },
        breakpoints: lines
            .iter()
            .map(|&line| SourceBreakpoint {
                line,
                condition: None,
            })
            .collect(),
    })?;

    let body: SetBreakpointsBody = session
        .send_command("setBreakpoints", arguments, BREAKPOINT_STATES)
        .await?
        .body_as()?;

    session.record_breakpoints(&path, lines.to_vec());
    Ok(body.breakpoints)
}

/// Adds one line to whatever `file` already has.
pub async fn add_breakpoint(session: &Session, file: &str, line: u32) -> Result<Vec<Breakpoint>> {
    let path = resolve_godot_path(file, session.project_root().as_deref())?;
    let mut lines = session
        .breakpoints()
        .get(path.to_string_lossy().as_ref())
        .cloned()
        .unwrap_or_default();
    if !lines.contains(&line) {
        lines.push(line);
    }
    set_breakpoints(session, file, &lines).await
}

pub async fn clear_breakpoints(session: &Session, file: &str) -> Result<()> {
    set_breakpoints(session, file, &[]).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_res_path_resolves_against_project_root() {
        let resolved = resolve_godot_path("res://scripts/player.gd", Some(Path::new("/games/demo")))
            .expect("should resolve");
        assert_eq!(resolved, PathBuf::from("/games/demo/scripts/player.gd"));
    }

    #[test]
    fn test_res_path_without_root_is_rejected() {
        let err = resolve_godot_path("res://player.gd", None).expect_err("no project root");
        assert!(err.to_string().contains("project root not set"), "unexpected error: {err}");
    }

    #[test]
    fn test_absolute_passes_relative_rejected() {
        assert_eq!(
            resolve_godot_path("/tmp/game/main.gd", None).expect("absolute"),
            PathBuf::from("/tmp/game/main.gd")
        );
        let err = resolve_godot_path("scripts/main.gd", None).expect_err("relative");
        assert!(matches!(err, DapError::InvalidArgument { .. }), "unexpected error: {err}");
        assert!(resolve_godot_path("", None).is_err());
    }
}

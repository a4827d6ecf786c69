use crate::session::Session;
use crate::types::{
    to_arguments, EvaluateArguments, EvaluateBody, Scope, ScopesArguments, ScopesBody,
    SetVariableArguments, SetVariableBody, StackTraceArguments, StackTraceBody, Thread,
    ThreadsBody, Variable, VariablesArguments, VariablesBody,
};
use crate::Result;

pub async fn threads(session: &Session) -> Result<Vec<Thread>> {
    let body: ThreadsBody = session
        .request_launched("threads", serde_json::json!({}))
        .await?
        .body_as()?;
    Ok(body.threads)
}

pub async fn stack_trace(
    session: &Session,
    thread_id: i64,
    start_frame: u32,
    levels: u32,
) -> Result<StackTraceBody> {
    if let Some(cached) = session.cached_stack_trace(thread_id, start_frame, levels) {
        return Ok(cached);
    }
    let epoch = session.pause_epoch();

    let arguments = to_arguments(&StackTraceArguments {
        thread_id,
        start_frame,
        levels,
    })?;
    let body: StackTraceBody = session
        .request_launched("stackTrace", arguments)
        .await?
        .body_as()?;
    session.cache_stack_trace(epoch, thread_id, start_frame, levels, body.clone());
    Ok(body)
}

pub async fn scopes(session: &Session, frame_id: i64) -> Result<Vec<Scope>> {
    let arguments = to_arguments(&ScopesArguments { frame_id })?;
    let body: ScopesBody = session
        .request_launched("scopes", arguments)
        .await?
        .body_as()?;
    Ok(body.scopes)
}

/// Served from the paused snapshot when the same reference was already
/// fetched since the last stop.
pub async fn variables(session: &Session, variables_reference: i64) -> Result<Vec<Variable>> {
    if let Some(cached) = session.cached_variables(variables_reference) {
        return Ok(cached);
    }
    let epoch = session.pause_epoch();

    let arguments = to_arguments(&VariablesArguments {
        variables_reference,
    })?;
    let body: VariablesBody = session
        .request_launched("variables", arguments)
        .await?
        .body_as()?;
    session.cache_variables(epoch, variables_reference, body.variables.clone());
    Ok(body.variables)
}

pub async fn evaluate(
    session: &Session,
    expression: &str,
    frame_id: i64,
    context: &str,
) -> Result<EvaluateBody> {
    let arguments = to_arguments(&EvaluateArguments {
        expression: expression.to_string(),
        frame_id,
        context: context.to_string(),
    })?;
    session
        .request_launched("evaluate", arguments)
        .await?
        .body_as()
}

/// Forwarded as-is. Godot advertises `supportsSetVariable` without
/// implementing it, which comes back as an ordinary remote error.
pub async fn set_variable(
    session: &Session,
    variables_reference: i64,
    name: &str,
    value: &str,
) -> Result<SetVariableBody> {
    let arguments = to_arguments(&SetVariableArguments {
        variables_reference,
        name: name.to_string(),
        value: value.to_string(),
    })?;
    let body: SetVariableBody = session
        .request_launched("setVariable", arguments)
        .await?
        .body_as()?;
    session.invalidate_snapshots();
    Ok(body)
}

//! QuickJS engine errors.

use rquickjs::Ctx;
use rquickjs::convert::Coerced;

/// Errors that can occur while building or driving a QuickJS context
#[derive(Debug, thiserror::Error)]
pub enum QuickJsError {
    #[error("Failed to create runtime: {0}")]
    RuntimeCreation(String),

    #[error("Failed to read script {path}: {source}")]
    ScriptRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown inline script: {0}")]
    UnknownScript(String),

    #[error("{0}")]
    Exception(String),

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] rquickjs::Error),
}

pub type QuickJsResult<T> = Result<T, QuickJsError>;

/// Render a failed call as text, taking the pending exception if there is one.
pub(crate) fn exception_message(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !error.is_exception() {
        return error.to_string();
    }
    describe_exception(ctx.catch())
}

pub(crate) fn describe_exception(value: rquickjs::Value<'_>) -> String {
    if let Some(exception) = value.as_exception() {
        let message = exception.message().unwrap_or_default();
        return match exception.stack() {
            Some(stack) if !stack.trim().is_empty() => {
                format!("{}\n{}", message, stack.trim_end())
            }
            _ => message,
        };
    }

    value
        .get::<Coerced<String>>()
        .map(|text| text.0)
        .unwrap_or_else(|_| "<unprintable exception>".to_string())
}

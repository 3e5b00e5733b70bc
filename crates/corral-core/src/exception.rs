use core::fmt;

use rquickjs::{Ctx, FromJs, Value, convert::Coerced};
use serde::{Deserialize, Serialize};

/// Structured form of an uncaught guest exception.
///
/// This is what the isolate stores in its last-exception slot (as JSON) and
/// what `corral.errorToJSON` produces inside guest code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub script_resource_name: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub start_column: Option<u32>,
    #[serde(default)]
    pub frames: Vec<StackFrame>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub function_name: Option<String>,
    pub script_name: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ExceptionInfo {
    #[must_use]
    pub fn new(message: impl Into<String>, name: Option<String>, stack: Option<String>) -> Self {
        let frames: Vec<StackFrame> = stack
            .as_deref()
            .map(|stack| stack.lines().filter_map(parse_frame).collect())
            .unwrap_or_default();
        let origin = frames.iter().find(|frame| frame.script_name.is_some());
        Self {
            message: message.into(),
            name,
            script_resource_name: origin.and_then(|frame| frame.script_name.clone()),
            line_number: origin.and_then(|frame| frame.line),
            start_column: origin.and_then(|frame| frame.column),
            stack,
            frames,
        }
    }

    /// Serialize into the JSON representation handed across the boundary.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            serde_json::json!({ "message": self.message }).to_string()
        })
    }

    /// # Errors
    /// Returns an error if `json` is not a serialized exception.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub(crate) fn from_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Self {
        if let Some(exc) = value.as_exception() {
            let name = exc
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten();
            return Self::new(exc.message().unwrap_or_default(), name, exc.stack());
        }
        // Non-Error values can be thrown too (`throw "boom"`).
        let message = Coerced::<String>::from_js(ctx, value.clone())
            .map_or_else(|_| format!("{value:?}"), |coerced| coerced.0);
        Self::new(message, None, None)
    }

    /// Take the pending exception out of `ctx`.
    pub(crate) fn catch(ctx: &Ctx<'_>) -> Self {
        let caught = ctx.catch();
        Self::from_value(ctx, &caught)
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message)?,
            None => f.write_str(&self.message)?,
        }
        if let (Some(script), Some(line)) = (&self.script_resource_name, self.line_number) {
            write!(f, " ({script}:{line})")?;
        }
        Ok(())
    }
}

/// Parse one line of an engine stack trace, e.g. `    at f (main.js:3:11)`.
fn parse_frame(line: &str) -> Option<StackFrame> {
    let rest = line.trim().strip_prefix("at ")?;
    let (function_name, location) = match rest.strip_suffix(')').and_then(|r| r.rsplit_once(" (")) {
        Some((function, location)) => (Some(function.to_owned()), location),
        None => (None, rest),
    };

    let mut script = location;
    let mut numbers = Vec::with_capacity(2);
    while numbers.len() < 2 {
        if let Some((head, tail)) = script.rsplit_once(':')
            && let Ok(n) = tail.parse::<u32>()
        {
            numbers.push(n);
            script = head;
        } else {
            break;
        }
    }
    let (line, column) = match numbers.as_slice() {
        [column, line] => (Some(*line), Some(*column)),
        [line] => (Some(*line), None),
        _ => (None, None),
    };

    Some(StackFrame {
        function_name,
        script_name: (!script.is_empty() && script != "native").then(|| script.to_owned()),
        line,
        column,
    })
}

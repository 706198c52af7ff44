//! Line-oriented control protocol.
//!
//! Requests are `command SP arg1 SP arg2 ...` terminated by `\n`. Arguments
//! are split on single spaces, so `start  foo` carries an empty first
//! argument. Replies are a single line, `OK[ <result>]` or
//! `ERROR <errno> <message>`.

use crate::core::ident::AppId;
use crate::error::{SupervisorError, SupervisorResult};

/// A management command parsed from one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { name: String, path: String },
    Unregister(AppId),
    Start(AppId),
    Stop(AppId),
    Restart(AppId),
    Enable(AppId),
    Disable(AppId),
    List,
    Quit,
}

impl Command {
    /// Parse an already stripped request line.
    pub fn parse(line: &str) -> SupervisorResult<Self> {
        let mut words = line.split(' ');
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let parsed = match command {
            "register" => {
                let [name, path] = required::<2>(command, &args, "<name> <path>")?;
                Self::Register {
                    name: name.to_string(),
                    path: path.to_string(),
                }
            }
            "unregister" => Self::Unregister(app_id(command, &args)?),
            "start" => Self::Start(app_id(command, &args)?),
            "stop" => Self::Stop(app_id(command, &args)?),
            "restart" => Self::Restart(app_id(command, &args)?),
            "enable" => Self::Enable(app_id(command, &args)?),
            "disable" => Self::Disable(app_id(command, &args)?),
            "list" => Self::List,
            "quit" => Self::Quit,
            other => return Err(SupervisorError::Unsupported(other.to_string())),
        };
        Ok(parsed)
    }
}

fn app_id(command: &str, args: &[&str]) -> SupervisorResult<AppId> {
    let [raw] = required::<1>(command, args, "<id>")?;
    Ok(AppId::parse(raw))
}

fn required<'a, const N: usize>(
    command: &str,
    args: &[&'a str],
    usage: &str,
) -> SupervisorResult<[&'a str; N]> {
    args.get(..N)
        .and_then(|head| <[&str; N]>::try_from(head).ok())
        .ok_or_else(|| SupervisorError::InvalidArgument(format!("usage: {command} {usage}")))
}

/// Reply line sent back on the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `None` renders as bare `OK`; `Some("")` renders as `OK ` (trailing space).
    Ok(Option<String>),
    Error { code: i32, message: String },
}

impl Reply {
    pub fn from_result(result: SupervisorResult<Option<String>>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Error {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }

    /// Serialize including the terminating newline.
    pub fn to_line(&self) -> String {
        match self {
            Self::Ok(None) => "OK\n".to_string(),
            Self::Ok(Some(result)) => format!("OK {result}\n"),
            Self::Error { code, message } => format!("ERROR {code} {message}\n"),
        }
    }
}

/// Remove every complete `\n`-terminated line from `buffer`, returning them stripped.
///
/// A trailing partial line stays buffered until its newline arrives. Invalid
/// UTF-8 is replaced rather than rejected.
pub fn take_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|byte| *byte == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);

    complete[..last_newline]
        .split(|byte| *byte == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .collect()
}

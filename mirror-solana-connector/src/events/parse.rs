//! Log-line classification and the call-stack parser.
//!
//! The parser tracks which program is executing from the `invoke`/`success`/
//! `failed` lines and keeps only the log and data lines emitted while the program
//! of interest is on top of the stack. Lines from nested invocations are skipped
//! without disturbing the stack.

use solana_sdk::pubkey::Pubkey;

const PROGRAM_LOG: &str = "Program log: ";
const PROGRAM_DATA: &str = "Program data: ";
const LOG_TRUNCATED: &str = "Log truncated";

/// The classes of log line the parser distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLine<'a> {
    Invoke { program: &'a str, depth: u32 },
    Success { program: &'a str },
    Failed { program: &'a str, reason: &'a str },
    Message(&'a str),
    Data(&'a str),
    /// The node cut the log short; nothing after this line is trustworthy.
    Truncated,
    Other,
}

pub fn classify(line: &str) -> LogLine<'_> {
    if let Some(message) = line.strip_prefix(PROGRAM_LOG) {
        return LogLine::Message(message);
    }
    if let Some(data) = line.strip_prefix(PROGRAM_DATA) {
        return LogLine::Data(data.trim());
    }
    if line.starts_with(LOG_TRUNCATED) {
        return LogLine::Truncated;
    }
    let Some(rest) = line.strip_prefix("Program ") else {
        return LogLine::Other;
    };
    let Some((program, tail)) = rest.split_once(' ') else {
        return LogLine::Other;
    };

    if let Some(depth) = tail
        .strip_prefix("invoke [")
        .and_then(|d| d.strip_suffix(']'))
    {
        return match depth.parse() {
            Ok(depth) => LogLine::Invoke { program, depth },
            Err(_) => LogLine::Other,
        };
    }
    if tail == "success" {
        return LogLine::Success { program };
    }
    if let Some(reason) = tail.strip_prefix("failed: ") {
        return LogLine::Failed { program, reason };
    }
    if tail == "failed" {
        return LogLine::Failed { program, reason: "" };
    }
    LogLine::Other
}

/// A log or data line emitted by the program of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramLog {
    Message(String),
    /// Base64 payload of a `Program data:` line.
    Data(String),
}

#[derive(Debug, Clone)]
pub struct LogParser {
    program: String,
}

impl LogParser {
    pub fn new(program_id: &Pubkey) -> Self {
        Self {
            program: program_id.to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Extracts, in order, the lines emitted directly by the program of interest.
    pub fn parse<S: AsRef<str>>(&self, lines: &[S]) -> Vec<ProgramLog> {
        let mut stack: Vec<&str> = Vec::new();
        let mut out = Vec::new();

        for line in lines {
            match classify(line.as_ref()) {
                LogLine::Invoke { program, .. } => stack.push(program),
                LogLine::Success { .. } | LogLine::Failed { .. } => {
                    stack.pop();
                }
                LogLine::Message(message) if self.on_top(&stack) => {
                    out.push(ProgramLog::Message(message.to_string()));
                }
                LogLine::Data(data) if self.on_top(&stack) => {
                    out.push(ProgramLog::Data(data.to_string()));
                }
                LogLine::Truncated => {
                    tracing::debug!(program = %self.program, "Transaction log truncated");
                    break;
                }
                _ => {}
            }
        }
        out
    }

    fn on_top(&self, stack: &[&str]) -> bool {
        stack.last().is_some_and(|top| *top == self.program)
    }
}

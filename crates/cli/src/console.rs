//! Terminal rendering of streamed answers and tool progress.

use std::io::{self, Write};

use policy::AuthorizationRequest;
use runtime::{AnswerFragment, Presenter, ToolPhase, ToolStatus};

/// Writes answer text to stdout as it streams and tool progress to stderr.
#[derive(Debug, Default)]
pub struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn on_answer_fragment(&self, fragment: AnswerFragment) {
        let mut stdout = io::stdout().lock();
        if fragment.starts_message {
            let _ = writeln!(stdout);
        }
        let _ = write!(stdout, "{}", fragment.text);
        let _ = stdout.flush();
    }

    fn on_tool_status(&self, status: ToolStatus) {
        // Awaiting authorization is shown by the prompt itself.
        if let Some(line) = status_line(&status) {
            eprintln!("{line}");
        }
    }
}

fn status_line(status: &ToolStatus) -> Option<String> {
    let name = &status.tool_name;
    match &status.phase {
        ToolPhase::AwaitingAuthorization => None,
        ToolPhase::Running => Some(format!("  [{name}] running...")),
        ToolPhase::Succeeded => Some(format!("  [{name}] done")),
        ToolPhase::Failed(reason) => Some(format!("  [{name}] failed: {reason}")),
        ToolPhase::Refused => Some(format!("  [{name}] refused")),
    }
}

/// The question asked before a tool runs.
pub fn authorization_prompt(request: &AuthorizationRequest) -> String {
    format!(
        "\nAllow {}/{} {}? [y]es / [a]lways / [n]o: ",
        request.server_id,
        request.tool_name,
        request.arguments_summary()
    )
}

/// Parse an answer to [`authorization_prompt`] into `(authorized, permanent)`.
///
/// Anything unrecognized denies.
pub fn parse_answer(answer: &str) -> (bool, bool) {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => (true, false),
        "a" | "always" => (true, true),
        _ => (false, false),
    }
}

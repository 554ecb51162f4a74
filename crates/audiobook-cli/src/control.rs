//! Interactive commands read from stdin during `play`.

/// Seconds moved by the forward/back commands.
pub const SKIP_SECS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    TogglePause,
    Resume,
    Stop,
    Skip(i64),
    Seek(u64),
    /// 0-based chapter index.
    Chapter(usize),
    ListChapters,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  p            pause/resume
  r            resume
  s            stop
  f / b        skip forward / back 30s
  seek <t>     jump to time (SS, MM:SS or HH:MM:SS)
  c <n>        play chapter n
  l            list chapters
  i            status as JSON
  h            this help
  q            quit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ControlCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }

    let cmd = match (head.to_ascii_lowercase().as_str(), arg) {
        ("p" | "pause", None) => ControlCommand::TogglePause,
        ("r" | "resume", None) => ControlCommand::Resume,
        ("s" | "stop", None) => ControlCommand::Stop,
        ("f" | "fwd", None) => ControlCommand::Skip(SKIP_SECS),
        ("b" | "back", None) => ControlCommand::Skip(-SKIP_SECS),
        ("seek", Some(t)) => ControlCommand::Seek(
            audiobook_types::parse_hms(t).ok_or_else(|| format!("invalid time: {t}"))?,
        ),
        ("c" | "chapter", Some(n)) => match n.parse::<usize>() {
            Ok(n) if n >= 1 => ControlCommand::Chapter(n - 1),
            _ => return Err(format!("invalid chapter number: {n}")),
        },
        ("l" | "list", None) => ControlCommand::ListChapters,
        ("i" | "info", None) => ControlCommand::Status,
        ("h" | "help" | "?", None) => ControlCommand::Help,
        ("q" | "quit" | "exit", None) => ControlCommand::Quit,
        ("seek" | "c" | "chapter", None) => return Err(format!("{head} needs an argument")),
        _ => return Err(format!("unknown command: {}", line.trim())),
    };
    Ok(Some(cmd))
}

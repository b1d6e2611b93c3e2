//! Parsing of the lines typed at the chat prompt.
//!
//! Plain text is a broadcast message. Lines starting with `/` are
//! commands:
//!
//! - `/dm <name> <text>`: direct message
//! - `/file <path>` or `/file @<name> <path>`: send a file
//! - `/who`: refresh and list participants
//! - `/help`, `/quit`

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Direct { to: String, text: String },
    File { to: Option<String>, path: PathBuf },
    Who,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <text>                  send to everyone
  /dm <name> <text>       direct message
  /file [@name] <path>    send a file (to everyone or one participant)
  /who                    list active participants
  /quit                   leave and exit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "dm" | "msg" => {
            let Some((to, text)) = args.split_once(char::is_whitespace) else {
                return Err("usage: /dm <name> <text>".into());
            };
            Command::Direct {
                to: to.to_string(),
                text: text.trim().to_string(),
            }
        }
        "file" => {
            let (to, path) = match args.strip_prefix('@') {
                Some(addressed) => match addressed.split_once(char::is_whitespace) {
                    Some((to, path)) => (Some(to.to_string()), path.trim()),
                    None => return Err("usage: /file @<name> <path>".into()),
                },
                None => (None, args),
            };
            if path.is_empty() {
                return Err("usage: /file [@name] <path>".into());
            }
            Command::File {
                to,
                path: PathBuf::from(path),
            }
        }
        "who" => Command::Who,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

/// Best-effort MIME type from a file extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

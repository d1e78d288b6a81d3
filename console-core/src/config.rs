//! Configuration file parsing (§6 external interface).
//!
//! The grammar is a small, line-oriented, keyword-driven directive
//! language — not TOML or YAML, and not brace-delimited: each logical
//! line begins with a directive keyword (`SERVER` or `CONSOLE`) followed
//! by zero or more `KEY=VALUE` pairs. `#` starts a comment that runs to
//! end of line (outside quotes); a trailing `\` continues a line onto the
//! next; double-quoted values may contain whitespace and `\"`/`\\`
//! escapes.
//!
//! ```text
//! # comments run to end of line
//! SERVER PORT=7890 KEEPALIVE=ON
//! CONSOLE NAME="c1" DEV="/dev/ttyS0" BPS=9600 LOG="/var/log/consoles/c1.log"
//! CONSOLE NAME=c2 DEV=/dev/ttyUSB0 BPS=115200 \
//!         RESET="/etc/consoled/reset-c2.sh"
//! ```
//!
//! A malformed directive is reported and the parser resynchronizes at the
//! next line (§7); parsing only fails outright if no console directive
//! survives at all.

use std::path::PathBuf;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDirectives {
    pub port: u16,
    pub keepalive: bool,
    pub loopback: bool,
    pub logfile: Option<String>,
    pub pidfile: PathBuf,
    pub timestamp: Option<String>,
}

impl Default for ServerDirectives {
    fn default() -> Self {
        Self {
            port: 7890,
            keepalive: true,
            loopback: false,
            logfile: None,
            pidfile: PathBuf::from("/var/run/consoled.pid"),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSpec {
    pub name: String,
    pub device: String,
    pub baud: u32,
    pub reset: Option<String>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub server: ServerDirectives,
    pub consoles: Vec<ConsoleSpec>,
}

impl Config {
    /// Parse config text with no file name context (used by tests and
    /// callers that don't need formatted diagnostics). Diagnostics are
    /// still collected internally and emitted via `tracing::warn!`; only
    /// a structural failure (no console survives) is returned as `Err`.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_named(text, "<config>").map(|(config, _)| config)
    }

    /// Parse config text, attributing diagnostics to `file_name` in the
    /// `ERROR: <file>:<line>: <reason>.` format from §7. Returns the
    /// config plus the list of non-fatal diagnostics collected along the
    /// way; callers print them on the error channel.
    pub fn parse_named(text: &str, file_name: &str) -> Result<(Self, Vec<String>)> {
        let mut config = Config::default();
        let mut diagnostics = Vec::new();
        let mut attempted_consoles = 0usize;

        for (line_no, line) in logical_lines(text) {
            let tokens = match tokenize_line(&line) {
                Ok(t) => t,
                Err(reason) => {
                    diagnostics.push(format!("ERROR: {file_name}:{line_no}: {reason}."));
                    continue;
                }
            };
            if tokens.is_empty() {
                continue;
            }

            match tokens[0].to_ascii_uppercase().as_str() {
                "SERVER" => {
                    if let Err(reason) = apply_server_directive(&mut config.server, &tokens[1..]) {
                        diagnostics.push(format!("ERROR: {file_name}:{line_no}: {reason}."));
                    }
                }
                "CONSOLE" => {
                    attempted_consoles += 1;
                    match parse_console_directive(&tokens[1..]) {
                        Ok(spec) => {
                            if config.consoles.iter().any(|c| c.name == spec.name) {
                                diagnostics.push(format!(
                                    "ERROR: {file_name}:{line_no}: duplicate console name '{}'.",
                                    spec.name
                                ));
                            } else {
                                config.consoles.push(spec);
                            }
                        }
                        Err(reason) => {
                            diagnostics.push(format!("ERROR: {file_name}:{line_no}: {reason}."));
                        }
                    }
                }
                other => {
                    diagnostics.push(format!(
                        "ERROR: {file_name}:{line_no}: unknown directive '{other}'."
                    ));
                }
            }
        }

        for diagnostic in &diagnostics {
            tracing::warn!("{diagnostic}");
        }

        if attempted_consoles > 0 && config.consoles.is_empty() {
            return Err(CoreError::config(format!(
                "no valid console objects remain after {} error(s) in {file_name}",
                diagnostics.len()
            )));
        }

        Ok((config, diagnostics))
    }
}

fn apply_server_directive(
    server: &mut ServerDirectives,
    tokens: &[String],
) -> std::result::Result<(), String> {
    for token in tokens {
        let (key, value) = split_kv(token)?;
        match key.to_ascii_uppercase().as_str() {
            "PORT" => {
                server.port = value
                    .parse()
                    .map_err(|_| format!("invalid port '{value}'"))?;
            }
            "KEEPALIVE" => server.keepalive = parse_on_off(&value)?,
            "LOOPBACK" => server.loopback = parse_on_off(&value)?,
            "LOGFILE" => {
                server.logfile = Some(value);
                tracing::warn!("SERVER LOGFILE is not yet implemented");
            }
            "PIDFILE" => server.pidfile = PathBuf::from(value),
            "TIMESTAMP" => {
                server.timestamp = Some(value);
                tracing::warn!("SERVER TIMESTAMP is not yet implemented");
            }
            other => return Err(format!("unknown SERVER field '{other}'")),
        }
    }
    Ok(())
}

fn parse_console_directive(tokens: &[String]) -> std::result::Result<ConsoleSpec, String> {
    let mut name = None;
    let mut device = None;
    let mut log = None;
    let mut reset = None;
    let mut baud = 9600u32;

    for token in tokens {
        let (key, value) = split_kv(token)?;
        match key.to_ascii_uppercase().as_str() {
            "NAME" => name = Some(value),
            "DEV" => device = Some(value),
            "LOG" => log = Some(value),
            // Not named in the CONSOLE grammar's distilled form, but the
            // data model (§3) carries an optional reset-program path per
            // console and the config file is its only source; supplement
            // the grammar with the field the object needs.
            "RESET" => reset = Some(value),
            "BPS" => {
                baud = value
                    .parse()
                    .map_err(|_| format!("invalid BPS '{value}'"))?;
            }
            other => return Err(format!("unknown CONSOLE field '{other}'")),
        }
    }

    let name = name.ok_or_else(|| "CONSOLE directive missing NAME".to_string())?;
    if name.is_empty() {
        return Err("CONSOLE NAME must not be empty".to_string());
    }
    let device = device.ok_or_else(|| "CONSOLE directive missing DEV".to_string())?;
    if baud == 0 {
        return Err(format!("console '{name}' has an invalid baud rate of 0"));
    }

    Ok(ConsoleSpec { name, device, baud, reset, log })
}

fn parse_on_off(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_uppercase().as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Err(format!("expected ON or OFF, found '{other}'")),
    }
}

fn split_kv(token: &str) -> std::result::Result<(String, String), String> {
    token
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, found '{token}'"))
}

/// Join trailing-backslash continuations into logical lines, each tagged
/// with the physical line number it started on (for error messages).
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut raw_lines = text.lines().enumerate();

    while let Some((idx, first)) = raw_lines.next() {
        let start_line = idx + 1;
        let mut joined = String::from(first);
        while joined.trim_end().ends_with('\\') {
            let cut = joined.trim_end();
            joined.truncate(cut.len() - 1);
            match raw_lines.next() {
                Some((_, next)) => {
                    joined.push(' ');
                    joined.push_str(next);
                }
                None => break,
            }
        }
        out.push((start_line, joined));
    }
    out
}

/// Tokenize one logical line into `KEYWORD` plus `KEY=VALUE` words.
/// Whitespace separates tokens; `"..."` may embed whitespace and escaped
/// `\"`/`\\`; `#` outside a quoted region starts a comment that consumes
/// the remainder of the line.
fn tokenize_line(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None | Some('#') => break,
            _ => {}
        }

        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '#' {
                break;
            }
            if c == '"' {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => token.push('"'),
                            Some('\\') => token.push('\\'),
                            Some(other) => {
                                token.push('\\');
                                token.push(other);
                            }
                            None => return Err("unterminated escape in quoted string".to_string()),
                        },
                        Some(other) => token.push(other),
                        None => return Err("unterminated quoted string".to_string()),
                    }
                }
            } else {
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_and_console_directives() {
        let text = r#"
            # comment line
            SERVER PORT=4201 KEEPALIVE=OFF
            CONSOLE NAME="c1" DEV="/dev/ttyS0" BPS=9600 LOG="/tmp/logs/c1.log"
            CONSOLE NAME=c2 DEV=/dev/ttyUSB0 BPS=115200 RESET="/etc/reset-c2.sh"
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.server.port, 4201);
        assert!(!config.server.keepalive);
        assert_eq!(config.consoles.len(), 2);
        assert_eq!(config.consoles[0].name, "c1");
        assert_eq!(config.consoles[0].baud, 9600);
        assert_eq!(config.consoles[0].log.as_deref(), Some("/tmp/logs/c1.log"));
        assert_eq!(config.consoles[1].reset.as_deref(), Some("/etc/reset-c2.sh"));
    }

    #[test]
    fn defaults_apply_without_a_server_directive() {
        let config = Config::parse(r#"CONSOLE NAME=c1 DEV="/dev/ttyS0""#).unwrap();
        assert_eq!(config.server, ServerDirectives::default());
        assert_eq!(config.consoles[0].baud, 9600);
    }

    #[test]
    fn line_continuation_joins_a_split_directive() {
        let text = "CONSOLE NAME=c1 DEV=/dev/ttyS0 \\\n    BPS=19200";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.consoles[0].baud, 19200);
    }

    #[test]
    fn duplicate_console_name_is_reported_but_first_wins() {
        let text = "CONSOLE NAME=c1 DEV=/dev/ttyS0\nCONSOLE NAME=c1 DEV=/dev/ttyS1\n";
        let (config, diagnostics) = Config::parse_named(text, "test.cf").unwrap();
        assert_eq!(config.consoles.len(), 1);
        assert_eq!(config.consoles[0].device, "/dev/ttyS0");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].starts_with("ERROR: test.cf:2:"));
    }

    #[test]
    fn unknown_directive_is_reported_and_resynchronizes() {
        let text = "BOGUS FOO=bar\nCONSOLE NAME=c1 DEV=/dev/ttyS0\n";
        let (config, diagnostics) = Config::parse_named(text, "test.cf").unwrap();
        assert_eq!(config.consoles.len(), 1);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("unknown directive 'BOGUS'"));
    }

    #[test]
    fn no_surviving_console_is_fatal() {
        let text = "CONSOLE NAME=c1\n"; // missing DEV
        assert!(matches!(Config::parse(text), Err(CoreError::Config(_))));
    }

    #[test]
    fn console_missing_name_is_a_per_line_error() {
        let text = "CONSOLE DEV=/dev/ttyS0\nCONSOLE NAME=c1 DEV=/dev/ttyS0\n";
        let (config, diagnostics) = Config::parse_named(text, "test.cf").unwrap();
        assert_eq!(config.consoles.len(), 1);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn hash_inside_quotes_is_not_a_comment() {
        let text = r#"CONSOLE NAME=c1 DEV="/dev/tty#0""#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.consoles[0].device, "/dev/tty#0");
    }
}

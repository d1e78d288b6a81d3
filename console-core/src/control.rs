//! Control-byte parser (C6).
//!
//! A client's input stream is plain console bytes except for a single
//! escape introducer. Conserver-style concentrators use `&` as that
//! introducer; this module implements the minimal two-command subset
//! named in the spec: `&.` detaches, `&!<name>` requests attach to a
//! different console. Everything else the escape introduces is passed
//! through literally (an operator typing a bare `&` followed by a byte
//! this parser doesn't recognize gets both bytes echoed to the console).
//!
//! The parser is a pure state machine: no I/O, no knowledge of the
//! object graph. The engine feeds it client input a byte at a time and
//! acts on the [`ControlCommand`]s it yields.

const ESCAPE: u8 = b'&';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `&.` — detach from the current console.
    Detach,
    /// `&!<name>` — attach to a different console, terminated by
    /// whitespace or end of input.
    AttachTo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Plain,
    SawEscape,
    ReadingName,
}

/// Byte-at-a-time control parser. Plain bytes that aren't part of a
/// recognized escape are returned immediately via [`Parser::feed`] so the
/// engine can forward them to the console as it goes, rather than
/// buffering a whole line.
pub struct Parser {
    state: State,
    name: String,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Plain,
            name: String::new(),
        }
    }

    /// Feed one input byte. Returns the bytes (if any) that should be
    /// passed through to the console verbatim, plus a command if one was
    /// just completed.
    pub fn feed(&mut self, byte: u8) -> (Option<Vec<u8>>, Option<ControlCommand>) {
        match self.state {
            State::Plain => {
                if byte == ESCAPE {
                    self.state = State::SawEscape;
                    (None, None)
                } else {
                    (Some(vec![byte]), None)
                }
            }
            State::SawEscape => match byte {
                b'.' => {
                    self.state = State::Plain;
                    (None, Some(ControlCommand::Detach))
                }
                b'!' => {
                    self.state = State::ReadingName;
                    self.name.clear();
                    (None, None)
                }
                ESCAPE => {
                    // `&&` escapes a literal ampersand.
                    self.state = State::Plain;
                    (Some(vec![ESCAPE]), None)
                }
                other => {
                    // Unrecognized escape: pass both bytes through
                    // literally rather than silently eating the `&`.
                    self.state = State::Plain;
                    (Some(vec![ESCAPE, other]), None)
                }
            },
            State::ReadingName => {
                if byte.is_ascii_whitespace() {
                    self.state = State::Plain;
                    let name = std::mem::take(&mut self.name);
                    if name.is_empty() {
                        (None, None)
                    } else {
                        (None, Some(ControlCommand::AttachTo(name)))
                    }
                } else {
                    self.name.push(byte as char);
                    (None, None)
                }
            }
        }
    }

    /// Feed a whole chunk, collecting passthrough bytes and commands in
    /// order. The engine calls this once per readable chunk rather than
    /// looping itself.
    pub fn feed_chunk(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<ControlCommand>) {
        let mut passthrough = Vec::with_capacity(chunk.len());
        let mut commands = Vec::new();
        for &byte in chunk {
            let (bytes, cmd) = self.feed(byte);
            if let Some(bytes) = bytes {
                passthrough.extend(bytes);
            }
            if let Some(cmd) = cmd {
                commands.push(cmd);
            }
        }
        (passthrough, commands)
    }

    /// True while mid-escape; the engine can use this to decide whether a
    /// half-read chunk boundary split an escape sequence (it never needs
    /// to special-case that — state just carries over to the next feed).
    #[must_use]
    pub fn mid_escape(&self) -> bool {
        self.state != State::Plain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, Vec<ControlCommand>) {
        Parser::new().feed_chunk(input)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let (out, cmds) = run(b"hello\n");
        assert_eq!(out, b"hello\n");
        assert!(cmds.is_empty());
    }

    #[test]
    fn detach_command() {
        let (out, cmds) = run(b"&.");
        assert!(out.is_empty());
        assert_eq!(cmds, vec![ControlCommand::Detach]);
    }

    #[test]
    fn attach_to_command_terminated_by_whitespace() {
        let (out, cmds) = run(b"&!c2\n");
        assert!(out.is_empty());
        assert_eq!(cmds, vec![ControlCommand::AttachTo("c2".to_string())]);
    }

    #[test]
    fn doubled_escape_is_literal() {
        let (out, cmds) = run(b"a&&b");
        assert_eq!(out, b"a&b");
        assert!(cmds.is_empty());
    }

    #[test]
    fn unrecognized_escape_passes_through_both_bytes() {
        let (out, cmds) = run(b"&x");
        assert_eq!(out, b"&x");
        assert!(cmds.is_empty());
    }

    #[test]
    fn escape_split_across_feed_calls_still_resolves() {
        let mut parser = Parser::new();
        let (out1, cmd1) = parser.feed(b'&');
        assert_eq!(out1, None);
        assert_eq!(cmd1, None);
        assert!(parser.mid_escape());
        let (out2, cmd2) = parser.feed(b'.');
        assert_eq!(out2, None);
        assert_eq!(cmd2, Some(ControlCommand::Detach));
    }
}

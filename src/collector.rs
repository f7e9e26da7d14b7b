//! Turns control connection bytes into commands
//!
//! The collector keeps partial lines between calls, so a command split over
//! several reads comes out once its line terminator arrives. Telnet control
//! sequences (RFC 854) are removed from the stream before line assembly.

use encoding_rs::Encoding;
use tracing::warn;

use crate::command::Command;
use crate::protocol::MAX_COMMAND_LINE;

mod telnet {
    pub const IAC: u8 = 255;
    pub const WILL: u8 = 251;
    pub const DONT: u8 = 254;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TelnetState {
    Data,
    Iac,
    Negotiate,
}

/// Stateful line collector.
///
/// `encoding` is queried once per [`CommandCollector::collect`] call, because
/// a previous command (`OPTS UTF8`, `LANG`) may have changed it.
pub struct CommandCollector<F> {
    encoding: F,
    line: Vec<u8>,
    telnet: TelnetState,
    overflow: bool,
}

impl<F> CommandCollector<F>
where
    F: Fn() -> &'static Encoding,
{
    pub fn new(encoding: F) -> Self {
        Self { encoding, line: Vec::new(), telnet: TelnetState::Data, overflow: false }
    }

    /// Returns a lazy iterator over the commands completed by `data`.
    ///
    /// Bytes that are not consumed when the iterator is dropped early are
    /// lost, so callers should drain it.
    pub fn collect<'a>(&'a mut self, data: &'a [u8]) -> Commands<'a, F> {
        let encoding = (self.encoding)();
        Commands { collector: self, data, pos: 0, encoding }
    }

    pub fn has_partial_line(&self) -> bool {
        !self.line.is_empty()
    }

    fn filter_telnet(&mut self, b: u8) -> Option<u8> {
        match self.telnet {
            TelnetState::Data if b == telnet::IAC => {
                self.telnet = TelnetState::Iac;
                None
            }
            TelnetState::Data => Some(b),
            TelnetState::Iac => match b {
                telnet::IAC => {
                    self.telnet = TelnetState::Data;
                    Some(telnet::IAC)
                }
                telnet::WILL..=telnet::DONT => {
                    self.telnet = TelnetState::Negotiate;
                    None
                }
                // IP, DM, AYT, ... carry no command text
                _ => {
                    self.telnet = TelnetState::Data;
                    None
                }
            },
            TelnetState::Negotiate => {
                self.telnet = TelnetState::Data;
                None
            }
        }
    }

    fn take_line(&mut self, encoding: &'static Encoding) -> Option<Command> {
        let mut raw = std::mem::take(&mut self.line);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if self.overflow {
            warn!(limit = MAX_COMMAND_LINE, "command line truncated");
            self.overflow = false;
        }
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        let (text, _) = encoding.decode_without_bom_handling(&raw);
        Some(Command::parse(&text))
    }
}

/// Commands completed by one chunk of input.
pub struct Commands<'a, F> {
    collector: &'a mut CommandCollector<F>,
    data: &'a [u8],
    pos: usize,
    encoding: &'static Encoding,
}

impl<F> Iterator for Commands<'_, F>
where
    F: Fn() -> &'static Encoding,
{
    type Item = Command;

    fn next(&mut self) -> Option<Command> {
        while self.pos < self.data.len() {
            let b = self.data[self.pos];
            self.pos += 1;
            let Some(b) = self.collector.filter_telnet(b) else {
                continue;
            };
            if b == b'\n' {
                if let Some(command) = self.collector.take_line(self.encoding) {
                    return Some(command);
                }
                continue;
            }
            if self.collector.line.len() < MAX_COMMAND_LINE {
                self.collector.line.push(b);
            } else {
                self.collector.overflow = true;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn utf8() -> &'static Encoding {
        encoding_rs::UTF_8
    }

    fn verbs<F: Fn() -> &'static Encoding>(c: &mut CommandCollector<F>, data: &[u8]) -> Vec<String> {
        c.collect(data).map(|c| c.to_string()).collect()
    }

    #[test]
    fn crlf_and_bare_lf() {
        let mut c = CommandCollector::new(utf8);
        assert_eq!(verbs(&mut c, b"USER bob\r\nNOOP\nPWD\r\n"), vec!["USER bob", "NOOP", "PWD"]);
    }

    #[test]
    fn command_split_across_reads() {
        let mut c = CommandCollector::new(utf8);
        assert!(verbs(&mut c, b"RE").is_empty());
        assert!(verbs(&mut c, b"TR a.t").is_empty());
        assert!(c.has_partial_line());
        assert_eq!(verbs(&mut c, b"xt\r\n"), vec!["RETR a.txt"]);
        assert!(!c.has_partial_line());
    }

    #[test]
    fn zero_length_read_yields_nothing() {
        let mut c = CommandCollector::new(utf8);
        assert!(verbs(&mut c, b"").is_empty());
        assert!(verbs(&mut c, b"\r\n\r\n").is_empty());
    }

    #[test]
    fn telnet_sequences_are_skipped() {
        let mut c = CommandCollector::new(utf8);
        // IAC IP, IAC DM, then ABOR; IAC WILL <opt> in the middle of a line
        let data = [255, 244, 255, 242, b'A', b'B', 255, 251, 1, b'O', b'R', b'\r', b'\n'];
        assert_eq!(verbs(&mut c, &data), vec!["ABOR"]);
    }

    #[test]
    fn escaped_iac_is_kept() {
        let latin1 = || encoding_rs::WINDOWS_1252;
        let mut c = CommandCollector::new(latin1);
        let data = [b'C', b'W', b'D', b' ', b'x', 255, 255, b'\n'];
        let cmds: Vec<Command> = c.collect(&data).collect();
        assert_eq!(cmds[0].argument(), "x\u{ff}");
    }

    #[test]
    fn encoding_is_resolved_per_call() {
        let use_utf8 = Arc::new(AtomicBool::new(false));
        let flag = use_utf8.clone();
        let mut c = CommandCollector::new(move || {
            if flag.load(Ordering::SeqCst) {
                encoding_rs::UTF_8
            } else {
                encoding_rs::WINDOWS_1252
            }
        });
        let bytes = "CWD é\r\n".as_bytes();
        let first: Vec<Command> = c.collect(bytes).collect();
        assert_eq!(first[0].argument(), "Ã©");
        use_utf8.store(true, Ordering::SeqCst);
        let second: Vec<Command> = c.collect(bytes).collect();
        assert_eq!(second[0].argument(), "é");
    }

    #[test]
    fn overlong_line_is_truncated() {
        let mut c = CommandCollector::new(utf8);
        let mut data = b"STOR ".to_vec();
        data.extend(std::iter::repeat(b'a').take(MAX_COMMAND_LINE + 10));
        data.extend_from_slice(b"\r\n");
        let cmds: Vec<Command> = c.collect(&data).collect();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].argument().len(), MAX_COMMAND_LINE - 5);
    }
}

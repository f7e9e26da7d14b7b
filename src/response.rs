//! FTP replies and their wire form

use std::fmt;

/// A reply to send over the control connection.
///
/// A single text line is sent as `"code text"`. Multi-line replies use the
/// `"code-first"` ... `" middle"` ... `"code last"` continuation form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    lines: Vec<String>,
}

impl Response {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, lines: vec![message.into()] }
    }

    /// Multi-line reply. The first and last line carry the code.
    pub fn multiline<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { code, lines: lines.into_iter().map(Into::into).collect() }
    }

    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// Lines as they go on the wire, without the trailing CRLF.
    pub fn wire_lines(&self) -> Vec<String> {
        match self.lines.len() {
            0 => Vec::new(),
            1 => vec![format!("{} {}", self.code, self.lines[0])],
            n => {
                let mut out = Vec::with_capacity(n);
                out.push(format!("{}-{}", self.code, self.lines[0]));
                for line in &self.lines[1..n - 1] {
                    out.push(format!(" {}", line));
                }
                out.push(format!("{} {}", self.code, self.lines[n - 1]));
                out
            }
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let r = Response::new(200, "Command okay.");
        assert_eq!(r.wire_lines(), vec!["200 Command okay.".to_string()]);
    }

    #[test]
    fn multi_line_uses_continuation_form() {
        let r = Response::multiline(211, ["Features:", "UTF8", "PASV", "END"]);
        assert_eq!(
            r.wire_lines(),
            vec!["211-Features:", " UTF8", " PASV", "211 END"]
        );
    }
}

//! Turns a compiler's raw log into a short, actionable summary.
//!
//! This is a line scan, not a grammar for TeX logs. It recognizes the error
//! markers TeX engines (`! ...` followed by `l.<N>`) and tectonic
//! (`error: <file>:<N>: ...`) print, a few terminal conditions that come
//! without such a marker, and otherwise falls back to pointing at the raw log.

use std::fmt;

/// Errors surfaced in a summary; later ones are usually cascades of the first
pub const MAX_REPORTED_ERRORS: usize = 3;

/// Lines after a `!` marker searched for the `l.<N>` location
pub const LOCATION_LOOKAHEAD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogError {
    pub message: String,
    pub line: Option<u32>,
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {line})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Conditions that end a run without a matchable error marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    EmergencyStop,
    FatalError,
    NoOutput,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmergencyStop => {
                "Emergency stop: check that the document structure is complete (e.g. \\end{document})."
            }
            Self::FatalError => "The compiler stopped on a fatal error.",
            Self::NoOutput => "No PDF generated: the compilation failed before producing any page.",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub errors: Vec<LogError>,
    /// Markers found beyond `MAX_REPORTED_ERRORS`
    pub omitted: usize,
    pub halt: Option<Halt>,
}

impl Diagnostic {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.halt.is_none()
    }

    /// Source lines of the surfaced errors, for highlighting in the editor
    pub fn error_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self.errors.iter().filter_map(|e| e.line).collect();
        lines.dedup();
        lines
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("No recognizable error found; see the raw log for details.");
        }

        let mut lines = Vec::with_capacity(self.errors.len() + 2);
        lines.extend(self.errors.iter().map(|e| format!("- {e}")));
        if self.omitted > 0 {
            lines.push(format!(
                "({} more error{} in the raw log)",
                self.omitted,
                if self.omitted == 1 { "" } else { "s" }
            ));
        }
        if let Some(halt) = self.halt {
            lines.push(halt.to_string());
        }
        f.write_str(&lines.join("\n"))
    }
}

pub fn summarize(raw_log: &str) -> Diagnostic {
    let lines: Vec<&str> = raw_log.lines().collect();
    let mut diagnostic = Diagnostic::default();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(halt) = detect_halt(line) {
            diagnostic.halt.get_or_insert(halt);
            continue;
        }

        let Some(mut error) = parse_error_marker(line) else {
            continue;
        };
        if diagnostic.errors.len() == MAX_REPORTED_ERRORS {
            diagnostic.omitted += 1;
            continue;
        }
        if error.line.is_none() {
            error.line = lines[idx + 1..]
                .iter()
                .take(LOCATION_LOOKAHEAD)
                .find_map(|l| parse_location(l));
        }
        diagnostic.errors.push(error);
    }

    diagnostic
}

fn detect_halt(line: &str) -> Option<Halt> {
    if line.contains("Emergency stop") {
        Some(Halt::EmergencyStop)
    } else if line.contains("Fatal error occurred") {
        Some(Halt::FatalError)
    } else if line.contains("No pages of output")
        || line.contains("no output PDF file produced")
        || line.contains("No PDF output generated")
    {
        Some(Halt::NoOutput)
    } else {
        None
    }
}

fn parse_error_marker(line: &str) -> Option<LogError> {
    if let Some(message) = line.strip_prefix("! ") {
        let message = message.trim();
        return (!message.is_empty()).then(|| LogError {
            message: message.to_string(),
            line: None,
        });
    }

    let rest = line.strip_prefix("error: ")?.trim();
    // tectonic's closing remark, not an error of its own
    if rest.is_empty() || rest.starts_with("halted on") {
        return None;
    }

    let mut parts = rest.splitn(3, ':');
    if let (Some(_file), Some(number), Some(message)) = (parts.next(), parts.next(), parts.next())
        && let Ok(number) = number.trim().parse::<u32>()
    {
        return Some(LogError {
            message: message.trim().to_string(),
            line: Some(number),
        });
    }

    Some(LogError {
        message: rest.to_string(),
        line: None,
    })
}

fn parse_location(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("l.")?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PDFLATEX_LOG: &str = r"This is pdfTeX, Version 3.141592653
(./main.tex
LaTeX2e <2023-11-01>
! Undefined control sequence.
l.7 \foo
        bar
! Missing $ inserted.
<inserted text>
                $
l.12 x^2

! LaTeX Error: Environment itemise undefined.

See the LaTeX manual or LaTeX Companion for explanation.
Type  H <return>  for immediate help.
 ...
l.20 \begin{itemise}
! Extra }, or forgotten $.
l.31 }
! Emergency stop.
No pages of output.
";

    #[test]
    fn test_summarize_pdflatex_log() {
        let diagnostic = summarize(PDFLATEX_LOG);
        assert_eq!(
            diagnostic.errors,
            vec![
                LogError {
                    message: "Undefined control sequence.".to_string(),
                    line: Some(7)
                },
                LogError {
                    message: "Missing $ inserted.".to_string(),
                    line: Some(12)
                },
                // `l.20` is beyond the lookahead window
                LogError {
                    message: "LaTeX Error: Environment itemise undefined.".to_string(),
                    line: None
                },
            ]
        );
        assert_eq!(diagnostic.omitted, 1);
        assert_eq!(diagnostic.halt, Some(Halt::EmergencyStop));
        assert_eq!(diagnostic.error_lines(), vec![7, 12]);

        let text = diagnostic.to_string();
        assert!(text.contains("- Undefined control sequence. (line 7)"));
        assert!(text.contains("(1 more error in the raw log)"));
        assert!(text.contains("Emergency stop"));
    }

    #[test]
    fn test_summarize_tectonic_log() {
        let log = "note: Running TeX ...\n\
                   error: main.tex:5: Undefined control sequence\n\
                   error: halted on potentially-recoverable error as specified\n";
        let diagnostic = summarize(log);
        assert_eq!(
            diagnostic.errors,
            vec![LogError {
                message: "Undefined control sequence".to_string(),
                line: Some(5)
            }]
        );
        assert_eq!(diagnostic.halt, None);
    }

    #[test]
    fn test_summarize_error_without_location() {
        let diagnostic = summarize("error: something bad happened: really\n");
        assert_eq!(diagnostic.errors[0].line, None);
        assert_eq!(diagnostic.errors[0].message, "something bad happened: really");
    }

    #[test]
    fn test_special_conditions() {
        let diagnostic = summarize("error: no output PDF file produced\n");
        assert_eq!(diagnostic.halt, Some(Halt::NoOutput));
        assert!(diagnostic.errors.is_empty());

        let diagnostic = summarize("!  ==> Fatal error occurred, no output PDF file produced!\n");
        assert_eq!(diagnostic.halt, Some(Halt::FatalError));
    }

    #[test]
    fn test_unrecognized_log_still_yields_a_message() {
        for log in ["", "\n\n", "Segmentation fault (core dumped)\n", "!\n! \n"] {
            let diagnostic = summarize(log);
            assert!(diagnostic.is_empty());
            assert!(diagnostic.to_string().contains("see the raw log"));
        }
    }

    #[test]
    fn test_location_marker_parsing() {
        assert_eq!(parse_location("l.42 \\foo"), Some(42));
        assert_eq!(parse_location("l.7"), Some(7));
        assert_eq!(parse_location("l.x"), None);
        assert_eq!(parse_location(" l.3"), None);
    }

    #[test]
    fn test_crlf_logs() {
        let diagnostic = summarize("! Undefined control sequence.\r\nl.3 \\oops\r\n");
        assert_eq!(diagnostic.error_lines(), vec![3]);
        assert_eq!(diagnostic.errors[0].message, "Undefined control sequence.");
    }
}

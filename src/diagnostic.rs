// released under MIT License

use codespan_reporting::diagnostic::{
    Diagnostic as CodespanDiagnostic, Label as CodespanLabel, LabelStyle, Severity,
};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{Buffer, Color, ColorSpec, WriteColor};
use rustc_hash::FxHashMap;
use std::io::Write;

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

/// Stable code identifying the kind of semantic problem a finding reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingCode {
    IncompatibleComposition,
    RefinementMissingInput,
    RefinementExtraOutput,
}

impl FindingCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCode::IncompatibleComposition => "incompatible-composition",
            FindingCode::RefinementMissingInput => "refinement-missing-input",
            FindingCode::RefinementExtraOutput => "refinement-extra-output",
        }
    }
}

/// One structured result of a semantic check. States and actions are referred
/// to by the model's own identifiers; mapping them to editor positions is the
/// caller's job via a `SourceMap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub code: FindingCode,
    pub level: Level,
    pub message: String,
    /// state identifier the finding points at, if any
    pub state: Option<String>,
    /// action name involved, if any
    pub action: Option<String>,
}

impl Finding {
    pub fn new(code: FindingCode, message: impl ToString) -> Self {
        Self {
            code,
            level: Level::Error,
            message: message.to_string(),
            state: None,
            action: None,
        }
    }

    pub fn with_state(mut self, state: impl ToString) -> Self {
        self.state = Some(state.to_string());
        self
    }

    pub fn with_action(mut self, action: impl ToString) -> Self {
        self.action = Some(action.to_string());
        self
    }
}

/// Source-location table supplied by the external parser: maps the model's
/// own state identifiers to a file id and byte range.
#[derive(Debug, Default)]
pub struct SourceMap {
    entries: FxHashMap<String, (usize, (usize, usize))>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl ToString, fileid: usize, range: (usize, usize)) {
        self.entries.insert(key.to_string(), (fileid, range));
    }

    pub fn get(&self, key: &str) -> Option<(usize, (usize, usize))> {
        self.entries.get(key).copied()
    }
}

/// Renders findings against the registered source files.
pub struct DiagnosticHandler {
    files: SimpleFiles<String, String>,
    buffer: Buffer,
}

impl DiagnosticHandler {
    pub fn new() -> Self {
        Self {
            files: SimpleFiles::new(),
            buffer: Buffer::ansi(),
        }
    }

    pub fn add_file(&mut self, name: String, content: String) -> usize {
        self.files.add(name, content)
    }

    /// Emit one finding. With a mapped location the full codespan rendering is
    /// used; otherwise a single colored line is written.
    pub fn emit(&mut self, finding: &Finding, map: &SourceMap) {
        let severity = match finding.level {
            Level::Error => Severity::Error,
            Level::Warning => Severity::Warning,
        };

        let location = finding.state.as_deref().and_then(|st| map.get(st));
        if let Some((fileid, (start, end))) = location {
            let label = CodespanLabel::new(LabelStyle::Primary, fileid, start..end)
                .with_message(finding.message.clone());
            let diagnostic = CodespanDiagnostic::new(severity)
                .with_code(finding.code.as_str())
                .with_message(&finding.message)
                .with_labels(vec![label]);

            let config = term::Config::default();
            term::emit(&mut self.buffer, &config, &self.files, &diagnostic)
                .expect("Failed to write diagnostic");
        } else {
            let (prefix, color) = match finding.level {
                Level::Error => ("error", Color::Red),
                Level::Warning => ("warning", Color::Yellow),
            };

            self.buffer
                .set_color(ColorSpec::new().set_bold(true).set_fg(Some(color)))
                .expect("Failed to set color");
            writeln!(
                self.buffer,
                "{}[{}]: {}",
                prefix,
                finding.code.as_str(),
                finding.message
            )
            .expect("Failed to write finding");

            self.buffer
                .set_color(&ColorSpec::new())
                .expect("Failed to reset color");
        }
    }

    pub fn emit_all(&mut self, findings: &[Finding], map: &SourceMap) {
        for finding in findings {
            self.emit(finding, map);
        }
    }

    /// everything emitted so far, for tests and console output
    pub fn error_string(&self) -> String {
        String::from_utf8_lossy(self.buffer.as_slice()).to_string()
    }
}

impl Default for DiagnosticHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strip_ansi_escapes::strip_str;

    #[test]
    fn emit_without_location() {
        let mut handler = DiagnosticHandler::new();
        let finding = Finding::new(
            FindingCode::RefinementMissingInput,
            "missing input: req",
        )
        .with_action("req");
        handler.emit(&finding, &SourceMap::new());

        let content = strip_str(handler.error_string());
        insta::assert_snapshot!(content, @r###"
        error[refinement-missing-input]: missing input: req
        "###);
    }

    #[test]
    fn emit_with_location() {
        let mut handler = DiagnosticHandler::new();
        let fileid = handler.add_file(
            "vending.ia".to_string(),
            "state idle\nstate busy\n".to_string(),
        );
        let mut map = SourceMap::new();
        map.insert("idle", fileid, (6, 10));

        let finding = Finding::new(
            FindingCode::IncompatibleComposition,
            "unreceived output 'alert!'",
        )
        .with_state("idle")
        .with_action("alert");
        handler.emit(&finding, &map);

        let content = strip_str(handler.error_string());
        assert!(content.contains("incompatible-composition"));
        assert!(content.contains("vending.ia"));
        assert!(content.contains("unreceived output 'alert!'"));
    }

    #[test]
    fn finding_codes_are_stable() {
        assert_eq!(
            FindingCode::IncompatibleComposition.as_str(),
            "incompatible-composition"
        );
        assert_eq!(
            FindingCode::RefinementMissingInput.as_str(),
            "refinement-missing-input"
        );
        assert_eq!(
            FindingCode::RefinementExtraOutput.as_str(),
            "refinement-extra-output"
        );
    }
}

//! MI Response Classifier
//!
//! Folds the records returned for one command (or one poll) into a
//! `SessionEvent`: the text shown to the caller, the execution-state outcome
//! that drives the session state machine, and the command's result/error.

use crate::gdb::parser::MiParser;
use crate::gdb::types::*;
use regex::Regex;
use tracing::debug;

/// Classified batch of MI records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionEvent {
    /// Display lines in the order GDB emitted them
    pub lines: Vec<String>,
    /// Last `*running` / `*stopped` seen in the batch
    pub outcome: Option<ExecOutcome>,
    /// Result class of the command, if its result record was part of the batch
    pub result: Option<ResultClass>,
    /// Message carried by an `^error` result
    pub error: Option<String>,
}

impl SessionEvent {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Stateless record classifier
pub struct Classifier {
    ansi_pattern: Regex,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            // CSI sequences, OSC sequences and two-byte escapes
            ansi_pattern: Regex::new(
                r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]",
            )
            .expect("ansi pattern"),
        }
    }

    pub fn strip_ansi(&self, text: &str) -> String {
        self.ansi_pattern.replace_all(text, "").into_owned()
    }

    /// Classify a batch of records.
    ///
    /// Only the result record carrying `token` sets the batch result; result
    /// records of earlier, timed-out commands are skipped. A poll passes `None`.
    ///
    /// Console fragments without a trailing newline are held back and joined
    /// with the following console records until a newline closes the line.
    pub fn classify(&self, records: &[MiOutputRecord], token: Option<u64>) -> SessionEvent {
        let mut event = SessionEvent::default();
        let mut pending = String::new();

        for record in records {
            debug!("Classifying {:?} record", record.kind());
            match record {
                MiOutputRecord::Console(text) => {
                    pending.push_str(text);
                    if pending.ends_with('\n') {
                        event.lines.push(self.console_line(&pending));
                        pending.clear();
                    }
                }
                MiOutputRecord::Log(text) => {
                    let text = self.strip_ansi(text);
                    let text = text.trim();
                    if !text.is_empty() {
                        event.lines.push(text.to_string());
                    }
                }
                MiOutputRecord::Target(text) => {
                    event.lines.push(self.console_line(text));
                }
                MiOutputRecord::Result { class, results, .. } => {
                    if token.is_none() || record.token() != token {
                        debug!("Skipping stale {:?} result (token {:?})", class, record.token());
                        continue;
                    }
                    if *class == ResultClass::Error {
                        event.error = Some(
                            MiParser::find_string(results, "msg")
                                .unwrap_or_else(|| "Unknown GDB error".to_string()),
                        );
                    }
                    event.result = Some(class.clone());
                }
                MiOutputRecord::Async { class, results, .. } => {
                    match class {
                        AsyncClass::Running => event.outcome = Some(ExecOutcome::Running),
                        AsyncClass::Stopped => event.outcome = Some(ExecOutcome::Stopped),
                        AsyncClass::Other(_) => {}
                    }
                    event.lines.push(render_out_of_band('*', class.name(), results));
                }
                MiOutputRecord::Notification { class, results } => {
                    if !class.is_param_change() {
                        event.lines.push(render_out_of_band('=', class.name(), results));
                    }
                }
            }
        }

        if !pending.is_empty() {
            event.lines.push(self.console_line(&pending));
        }

        event
    }

    fn console_line(&self, text: &str) -> String {
        let text = self.strip_ansi(text);
        text.strip_suffix('\n').unwrap_or(&text).to_string()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn render_out_of_band(sigil: char, name: &str, results: &[MiResult]) -> String {
    if results.is_empty() {
        format!("{}{}", sigil, name)
    } else {
        format!("{}{},{}", sigil, name, format_results(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> Vec<MiOutputRecord> {
        let parser = MiParser::new();
        lines.iter().filter_map(|l| parser.parse_line(l)).collect()
    }

    #[test]
    fn test_console_fragments_merge_into_one_line() {
        let records = parse(&[r#"~"ab""#, r#"~"cd\n""#, "5^done"]);
        let event = Classifier::new().classify(&records, Some(5));
        assert_eq!(event.lines, vec!["abcd"]);
        assert_eq!(event.result, Some(ResultClass::Done));
        assert_eq!(event.error, None);
    }

    #[test]
    fn test_param_change_is_hidden() {
        let records = parse(&[
            r#"=cmd-param-changed,param="pagination",value="off""#,
            r#"~"ok\n""#,
            "1^done",
        ]);
        let event = Classifier::new().classify(&records, Some(1));
        assert_eq!(event.text(), "ok");
    }

    #[test]
    fn test_order_is_preserved() {
        let records = parse(&[
            r#"&"run\n""#,
            r#"=thread-group-started,id="i1",pid="4242""#,
            "7^running",
            r#"*running,thread-id="all""#,
            r#"~"Starting program\n""#,
        ]);
        let event = Classifier::new().classify(&records, Some(7));
        assert_eq!(
            event.lines,
            vec![
                "run".to_string(),
                r#"=thread-group-started,id="i1",pid="4242""#.to_string(),
                r#"*running,thread-id="all""#.to_string(),
                "Starting program".to_string(),
            ]
        );
        assert_eq!(event.outcome, Some(ExecOutcome::Running));
        assert_eq!(event.result, Some(ResultClass::Running));
    }

    #[test]
    fn test_last_outcome_wins() {
        let records = parse(&[
            "3^running",
            r#"*running,thread-id="all""#,
            r#"*stopped,reason="breakpoint-hit",bkptno="1""#,
        ]);
        let event = Classifier::new().classify(&records, Some(3));
        assert_eq!(event.outcome, Some(ExecOutcome::Stopped));
    }

    #[test]
    fn test_error_result_surfaces_message() {
        let records = parse(&[r#"9^error,msg="No symbol table is loaded.""#]);
        let event = Classifier::new().classify(&records, Some(9));
        assert_eq!(event.error.as_deref(), Some("No symbol table is loaded."));
        assert_eq!(event.result, Some(ResultClass::Error));
        assert!(event.lines.is_empty());
    }

    #[test]
    fn test_stale_result_is_not_attributed() {
        let records = parse(&[
            r#"4^error,msg="late failure""#,
            r#"~"ab""#,
            r#"~"cd\n""#,
            "5^done",
        ]);
        let event = Classifier::new().classify(&records, Some(5));
        assert_eq!(event.error, None);
        assert_eq!(event.result, Some(ResultClass::Done));
        assert_eq!(event.lines, vec!["abcd"]);
    }

    #[test]
    fn test_poll_ignores_result_records() {
        let records = parse(&[r#"4^error,msg="late failure""#, r#"*stopped,reason="signal-received""#]);
        let event = Classifier::new().classify(&records, None);
        assert_eq!(event.error, None);
        assert_eq!(event.result, None);
        assert_eq!(event.outcome, Some(ExecOutcome::Stopped));
    }

    #[test]
    fn test_ansi_colours_are_stripped() {
        let records = parse(&[r#"~"\033[31mRAX\033[0m  0x0\n""#]);
        let event = Classifier::new().classify(&records, None);
        assert_eq!(event.lines, vec!["RAX  0x0"]);
    }

    #[test]
    fn test_log_records_are_trimmed() {
        let records = parse(&[r#"&"  warning: something odd  \n""#, r#"&"\n""#]);
        let event = Classifier::new().classify(&records, None);
        assert_eq!(event.lines, vec!["warning: something odd"]);
    }

    #[test]
    fn test_unterminated_console_is_flushed() {
        let records = parse(&[r#"~"pwndbg> ""#]);
        let event = Classifier::new().classify(&records, None);
        assert_eq!(event.lines, vec!["pwndbg> "]);
    }

    #[test]
    fn test_multiline_console_keeps_inner_newlines() {
        let records = parse(&[r#"~"line one\nline two\n""#]);
        let event = Classifier::new().classify(&records, None);
        assert_eq!(event.text(), "line one\nline two");
    }
}

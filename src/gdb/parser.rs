//! GDB Machine Interface (MI) Parser
//!
//! Parses GDB/MI output lines into `MiOutputRecord`s.

use crate::gdb::types::*;
use anyhow::{anyhow, Result};
use regex::Regex;
use tracing::debug;

/// GDB/MI Parser
pub struct MiParser {
    // Regex patterns for parsing
    result_pattern: Regex,
    async_pattern: Regex,
    notification_pattern: Regex,
    stream_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            // Result record: ^done, ^error, ^running, etc.
            result_pattern: Regex::new(r"^(\d*)\^([\w-]+)(?:,(.*))?$").expect("result pattern"),
            // Async record: *stopped, *running, +download
            async_pattern: Regex::new(r"^(\d*)[*+]([\w-]+)(?:,(.*))?$").expect("async pattern"),
            // Notification: =breakpoint-created, etc.
            notification_pattern: Regex::new(r"^=(\S+?)(?:,(.*))?$").expect("notify pattern"),
            // Stream output: ~"console", @"target", &"log"
            stream_pattern: Regex::new(r#"^([~@&])"(.*)"$"#).expect("stream pattern"),
        }
    }

    /// Parse a single line of GDB/MI output.
    ///
    /// Returns `None` for blank lines and the `(gdb)` prompt.
    pub fn parse_line(&self, line: &str) -> Option<MiOutputRecord> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.trim() == "(gdb)" {
            return None;
        }

        if let Some(caps) = self.result_pattern.captures(line) {
            let token = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            let class = self.parse_result_class(&caps[2]);
            let results = caps
                .get(3)
                .map(|m| self.parse_results(m.as_str()))
                .unwrap_or_default();
            return Some(MiOutputRecord::Result { token, class, results });
        }

        if let Some(caps) = self.async_pattern.captures(line) {
            let token = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            let class = self.parse_async_class(&caps[2]);
            let results = caps
                .get(3)
                .map(|m| self.parse_results(m.as_str()))
                .unwrap_or_default();
            return Some(MiOutputRecord::Async { token, class, results });
        }

        if let Some(caps) = self.notification_pattern.captures(line) {
            let class = self.parse_notification_class(&caps[1]);
            let results = caps
                .get(2)
                .map(|m| self.parse_results(m.as_str()))
                .unwrap_or_default();
            return Some(MiOutputRecord::Notification { class, results });
        }

        if let Some(caps) = self.stream_pattern.captures(line) {
            let content = self.unescape_string(&caps[2]);
            return Some(match &caps[1] {
                "~" => MiOutputRecord::Console(content),
                "@" => MiOutputRecord::Target(content),
                _ => MiOutputRecord::Log(content),
            });
        }

        // Unknown format (e.g. raw inferior output) - treat as console output
        Some(MiOutputRecord::Console(format!("{}\n", line)))
    }

    fn parse_result_class(&self, s: &str) -> ResultClass {
        match s {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => ResultClass::Other(other.to_string()),
        }
    }

    fn parse_async_class(&self, s: &str) -> AsyncClass {
        match s {
            "stopped" => AsyncClass::Stopped,
            "running" => AsyncClass::Running,
            other => AsyncClass::Other(other.to_string()),
        }
    }

    fn parse_notification_class(&self, s: &str) -> NotificationClass {
        match s {
            "breakpoint-created" => NotificationClass::BreakpointCreated,
            "breakpoint-modified" => NotificationClass::BreakpointModified,
            "breakpoint-deleted" => NotificationClass::BreakpointDeleted,
            "thread-group-added" => NotificationClass::ThreadGroupAdded,
            "thread-group-started" => NotificationClass::ThreadGroupStarted,
            "thread-group-exited" => NotificationClass::ThreadGroupExited,
            "thread-created" => NotificationClass::ThreadCreated,
            "thread-selected" => NotificationClass::ThreadSelected,
            "thread-exited" => NotificationClass::ThreadExited,
            "library-loaded" => NotificationClass::LibraryLoaded,
            "library-unloaded" => NotificationClass::LibraryUnloaded,
            "cmd-param-changed" => NotificationClass::CmdParamChanged,
            "param-changed" => NotificationClass::ParamChanged,
            "memory-changed" => NotificationClass::MemoryChanged,
            other => NotificationClass::Other(other.to_string()),
        }
    }

    /// Parse results (variable=value pairs)
    pub fn parse_results(&self, input: &str) -> Vec<MiResult> {
        split_top_level(input)
            .into_iter()
            .filter_map(|entry| match self.parse_result(entry) {
                Ok(result) => Some(result),
                Err(e) => {
                    debug!("Skipping malformed MI result {:?}: {}", entry, e);
                    None
                }
            })
            .collect()
    }

    /// Parse a single result (variable=value)
    fn parse_result(&self, input: &str) -> Result<MiResult> {
        let eq_pos = input.find('=').ok_or_else(|| anyhow!("No '=' found"))?;
        let variable = input[..eq_pos].trim().to_string();
        let value = self.parse_value(&input[eq_pos + 1..])?;
        Ok(MiResult { variable, value })
    }

    /// Parse a value (string, list, or tuple)
    fn parse_value(&self, input: &str) -> Result<MiValue> {
        let input = input.trim();

        match input.chars().next() {
            None => Ok(MiValue::None),
            Some('"') => {
                let end = closing_quote(input)?;
                Ok(MiValue::String(self.unescape_string(&input[1..end])))
            }
            Some('[') => {
                let end = closing_bracket(input)?;
                let items = split_top_level(&input[1..end])
                    .into_iter()
                    .map(|item| self.parse_list_item(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(MiValue::List(items))
            }
            Some('{') => {
                let end = closing_bracket(input)?;
                let mut tuple = MiTuple::new();
                for entry in split_top_level(&input[1..end]) {
                    let result = self.parse_result(entry)?;
                    tuple.insert(result.variable, result.value);
                }
                Ok(MiValue::Tuple(tuple))
            }
            Some(_) => Ok(MiValue::String(input.to_string())),
        }
    }

    /// Lists may hold bare values or `key=value` results (e.g. `[frame={..},frame={..}]`)
    fn parse_list_item(&self, item: &str) -> Result<MiValue> {
        let item = item.trim();
        if let Some(eq_pos) = item.find('=') {
            let key = &item[..eq_pos];
            if !key.is_empty()
                && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            {
                let mut tuple = MiTuple::new();
                tuple.insert("__key__".to_string(), MiValue::String(key.to_string()));
                tuple.insert("__value__".to_string(), self.parse_value(&item[eq_pos + 1..])?);
                return Ok(MiValue::Tuple(tuple));
            }
        }
        self.parse_value(item)
    }

    /// Unescape a GDB/MI C-string body.
    ///
    /// GDB emits non-ASCII and control bytes as octal escapes (`\033` for ESC),
    /// so decoding happens on bytes before converting back to UTF-8.
    fn unescape_string(&self, s: &str) -> String {
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            if b != b'\\' || i + 1 == bytes.len() {
                out.push(b);
                i += 1;
                continue;
            }

            let next = bytes[i + 1];
            i += 2;
            match next {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'e' => out.push(0x1b),
                b'a' => out.push(0x07),
                b'b' => out.push(0x08),
                b'f' => out.push(0x0c),
                b'v' => out.push(0x0b),
                b'\\' | b'"' | b'\'' => out.push(next),
                b'0'..=b'7' => {
                    let mut value = u32::from(next - b'0');
                    let mut digits = 1;
                    while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                        value = value * 8 + u32::from(bytes[i] - b'0');
                        i += 1;
                        digits += 1;
                    }
                    out.push((value & 0xff) as u8);
                }
                _ => {
                    out.push(b'\\');
                    out.push(next);
                }
            }
        }

        String::from_utf8_lossy(&out).into_owned()
    }

    /// Extract a string value from MiValue
    pub fn extract_string(value: &MiValue) -> Option<String> {
        match value {
            MiValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Find a string-valued result by name
    pub fn find_string(results: &[MiResult], name: &str) -> Option<String> {
        results
            .iter()
            .find(|r| r.variable == name)
            .and_then(|r| Self::extract_string(&r.value))
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offset of the quote closing the string that starts at `input[0]`
fn closing_quote(input: &str) -> Result<usize> {
    let mut escape = false;
    for (i, c) in input.char_indices().skip(1) {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' => escape = true,
            '"' => return Ok(i),
            _ => {}
        }
    }
    Err(anyhow!("Unterminated string"))
}

/// Byte offset of the bracket closing the list/tuple that starts at `input[0]`
fn closing_bracket(input: &str) -> Result<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in input.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(anyhow!("Unterminated list or tuple"))
}

/// Split on commas that are outside strings and nested brackets
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth -= 1,
            ',' if depth == 0 && !in_string => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_done() {
        let parser = MiParser::new();
        match parser.parse_line("12^done").unwrap() {
            MiOutputRecord::Result { token, class, .. } => {
                assert_eq!(token, Some(12));
                assert_eq!(class, ResultClass::Done);
            }
            other => panic!("Expected result record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_result_message() {
        let parser = MiParser::new();
        let record = parser
            .parse_line(r#"3^error,msg="No symbol \"foo\" in current context.""#)
            .unwrap();
        match record {
            MiOutputRecord::Result { class, results, .. } => {
                assert_eq!(class, ResultClass::Error);
                assert_eq!(
                    MiParser::find_string(&results, "msg").as_deref(),
                    Some(r#"No symbol "foo" in current context."#)
                );
            }
            other => panic!("Expected result record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_stopped_with_frame() {
        let parser = MiParser::new();
        let line = r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={addr="0x0000000000401136",func="main",args=[]},thread-id="1""#;
        match parser.parse_line(line).unwrap() {
            MiOutputRecord::Async { class, results, .. } => {
                assert_eq!(class, AsyncClass::Stopped);
                assert_eq!(MiParser::find_string(&results, "reason").as_deref(), Some("breakpoint-hit"));
                let frame = results.iter().find(|r| r.variable == "frame").unwrap();
                match &frame.value {
                    MiValue::Tuple(t) => {
                        assert_eq!(t.get("func"), Some(&MiValue::String("main".into())));
                        assert_eq!(t.get("args"), Some(&MiValue::List(vec![])));
                    }
                    other => panic!("Expected tuple, got {:?}", other),
                }
                assert_eq!(MiParser::find_string(&results, "thread-id").as_deref(), Some("1"));
            }
            other => panic!("Expected async record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification() {
        let parser = MiParser::new();
        match parser.parse_line(r#"=breakpoint-created,bkpt={number="1"}"#).unwrap() {
            MiOutputRecord::Notification { class, results } => {
                assert_eq!(class, NotificationClass::BreakpointCreated);
                assert_eq!(results.len(), 1);
            }
            other => panic!("Expected notification record, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_notification_is_kept() {
        let parser = MiParser::new();
        match parser.parse_line(r#"=tsv-created,name="trace""#).unwrap() {
            MiOutputRecord::Notification { class, .. } => {
                assert_eq!(class, NotificationClass::Other("tsv-created".into()));
                assert_eq!(class.name(), "tsv-created");
            }
            other => panic!("Expected notification record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_streams() {
        let parser = MiParser::new();
        assert_eq!(
            parser.parse_line(r#"~"Hello\n""#),
            Some(MiOutputRecord::Console("Hello\n".into()))
        );
        assert_eq!(
            parser.parse_line(r#"@"out""#),
            Some(MiOutputRecord::Target("out".into()))
        );
        assert_eq!(
            parser.parse_line(r#"&"warning: x\n""#),
            Some(MiOutputRecord::Log("warning: x\n".into()))
        );
    }

    #[test]
    fn test_octal_escapes_decode_to_bytes() {
        let parser = MiParser::new();
        // pwndbg colours its output; GDB escapes ESC as \033
        let record = parser.parse_line(r#"~"\033[31mRED\033[0m \342\234\223""#).unwrap();
        assert_eq!(
            record,
            MiOutputRecord::Console("\x1b[31mRED\x1b[0m \u{2713}".into())
        );
    }

    #[test]
    fn test_prompt_and_blank_lines_are_skipped() {
        let parser = MiParser::new();
        assert_eq!(parser.parse_line("(gdb) "), None);
        assert_eq!(parser.parse_line("\r\n"), None);
    }

    #[test]
    fn test_unknown_line_becomes_console() {
        let parser = MiParser::new();
        assert_eq!(
            parser.parse_line("plain inferior text"),
            Some(MiOutputRecord::Console("plain inferior text\n".into()))
        );
    }

    #[test]
    fn test_list_of_results() {
        let parser = MiParser::new();
        let line = r#"^done,stack=[frame={level="0",func="main"},frame={level="1",func="_start"}]"#;
        match parser.parse_line(line).unwrap() {
            MiOutputRecord::Result { results, .. } => match &results[0].value {
                MiValue::List(frames) => {
                    assert_eq!(frames.len(), 2);
                    match &frames[1] {
                        MiValue::Tuple(t) => {
                            assert_eq!(t.get("__key__"), Some(&MiValue::String("frame".into())));
                        }
                        other => panic!("Expected tuple, got {:?}", other),
                    }
                }
                other => panic!("Expected list, got {:?}", other),
            },
            other => panic!("Expected result record, got {:?}", other),
        }
    }
}

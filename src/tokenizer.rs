//! Balanced-brace JSON tokenizer for chunked input.
//!
//! Network and file readers hand over JSON in arbitrary chunks. This
//! tokenizer accumulates chunks and watches `{`/`}` depth, skipping over
//! string literals so braces inside strings are ignored, and hands each
//! balanced top-level object to a callback as soon as it is complete. It
//! never parses the JSON itself; callers feed the balanced text to
//! `serde_json` (or anything else) once it arrives.

/// Incremental tokenizer that extracts balanced top-level JSON objects
/// from a chunked character stream.
pub struct BalancedJsonTokenizer<F: FnMut(&str)> {
    callback: F,
    /// Scan resume position within `buffer`, in bytes.
    index: usize,
    balance: i32,
    buffer: String,
    find_multiple: bool,
    last_balanced_index: usize,
}

impl<F: FnMut(&str)> BalancedJsonTokenizer<F> {
    /// `callback` receives each balanced object's full text. With
    /// `find_multiple` set, scanning continues past the first balanced
    /// object and the callback may fire several times per `write`.
    pub fn new(callback: F, find_multiple: bool) -> Self {
        BalancedJsonTokenizer {
            callback,
            index: 0,
            balance: 0,
            buffer: String::new(),
            find_multiple,
            last_balanced_index: 0,
        }
    }

    /// Appends a chunk and scans as far as the buffered input allows.
    ///
    /// Returns `true` while more input is expected, `false` once a
    /// terminating condition is seen: a `]` at depth zero (end of an
    /// enclosing array) or a closing brace below depth zero.
    pub fn write(&mut self, chunk: &str) -> bool {
        self.buffer.push_str(chunk);
        let mut index = self.index;
        while index < self.buffer.len() {
            let bytes = self.buffer.as_bytes();
            match bytes[index] {
                b'"' => {
                    // Find the closing quote: the next '"' not preceded by
                    // an odd number of backslashes. If the string literal is
                    // still incomplete, stall at the opening quote until the
                    // next chunk arrives.
                    match find_string_end(bytes, index) {
                        Some(end) => index = end,
                        None => break,
                    }
                }
                b'{' => self.balance += 1,
                b'}' => {
                    self.balance -= 1;
                    if self.balance < 0 {
                        self.index = index;
                        self.report_balanced();
                        return false;
                    }
                    if self.balance == 0 {
                        self.last_balanced_index = index + 1;
                        if !self.find_multiple {
                            break;
                        }
                        // Deliver each object the moment it closes; the
                        // drain rebases the scan to the new buffer start.
                        self.index = index + 1;
                        self.report_balanced();
                        index = self.index;
                        continue;
                    }
                }
                b']' if self.balance == 0 => {
                    self.index = index;
                    self.report_balanced();
                    return false;
                }
                _ => {}
            }
            index += 1;
        }
        self.index = index;
        self.report_balanced();
        true
    }

    fn report_balanced(&mut self) {
        if self.last_balanced_index == 0 {
            return;
        }
        (self.callback)(&self.buffer[..self.last_balanced_index]);
        self.buffer.drain(..self.last_balanced_index);
        self.index = self.index.saturating_sub(self.last_balanced_index);
        self.last_balanced_index = 0;
    }

    /// Unconsumed text after the last balanced object.
    pub fn remainder(&self) -> &str {
        &self.buffer
    }
}

/// Returns the byte position of the closing quote of the string literal
/// opening at `start`, or `None` if the buffer ends mid-literal.
fn find_string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn collect_objects(chunks: &[&str], find_multiple: bool) -> (Vec<String>, String, bool) {
        let objects = RefCell::new(Vec::new());
        let mut keep_going = true;
        let remainder;
        {
            let mut tokenizer =
                BalancedJsonTokenizer::new(|s: &str| objects.borrow_mut().push(s.to_string()), find_multiple);
            for chunk in chunks {
                keep_going = tokenizer.write(chunk);
                if !keep_going {
                    break;
                }
            }
            remainder = tokenizer.remainder().to_string();
        }
        (objects.into_inner(), remainder, keep_going)
    }

    #[test]
    fn single_object_in_one_chunk() {
        let (objects, remainder, more) = collect_objects(&[r#"{"a":1}"#], false);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(remainder, "");
        assert!(more);
    }

    #[test]
    fn object_split_across_chunks() {
        let (objects, _, _) = collect_objects(&[r#"{"a":"#, "1", "}"], false);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn multiple_objects_need_find_multiple() {
        let (objects, remainder, _) = collect_objects(&[r#"{"a":1}{"b":2}"#], true);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);
        assert_eq!(remainder, "");

        // Without find_multiple only the first object is reported per write;
        // the second stays buffered until the next call.
        let (objects, remainder, _) = collect_objects(&[r#"{"a":1}{"b":2}"#], false);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(remainder, r#"{"b":2}"#);
    }

    #[test]
    fn objects_are_delivered_one_callback_each() {
        // Each object fires its own callback as soon as it closes, even
        // when one object straddles a chunk boundary mid-string.
        let (objects, remainder, _) = collect_objects(&[r#"{"a":1}{"b"#, r#"":2}{"c":3}"#], true);
        assert_eq!(
            objects,
            vec![
                r#"{"a":1}"#.to_string(),
                r#"{"b":2}"#.to_string(),
                r#"{"c":3}"#.to_string(),
            ]
        );
        assert_eq!(remainder, "");
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let (objects, _, _) = collect_objects(&[r#"{"a":"}{}{"}"#], false);
        assert_eq!(objects, vec![r#"{"a":"}{}{"}"#.to_string()]);
    }

    #[test]
    fn escaped_quotes_do_not_close_strings() {
        let input = r#"{"a":"x\"}\\"}"#;
        let (objects, _, _) = collect_objects(&[input], false);
        assert_eq!(objects, vec![input.to_string()]);
    }

    #[test]
    fn string_split_mid_escape() {
        // The buffer ends on a lone backslash; the scan must stall rather
        // than treat the next chunk's quote as unescaped incorrectly.
        let (objects, _, _) = collect_objects(&[r#"{"a":"x\"#, r#""y"}"#], false);
        assert_eq!(objects, vec![r#"{"a":"x\"y"}"#.to_string()]);
    }

    #[test]
    fn nested_objects_balance() {
        let input = r#"{"a":{"b":{"c":1}},"d":2}"#;
        let (objects, _, _) = collect_objects(&[input], false);
        assert_eq!(objects, vec![input.to_string()]);
    }

    #[test]
    fn closing_bracket_terminates() {
        let (objects, remainder, more) = collect_objects(&[r#"{"a":1}]"#], true);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(remainder, "]");
        assert!(!more);
    }

    #[test]
    fn remainder_keeps_unbalanced_tail() {
        let (objects, remainder, _) = collect_objects(&[r#"{"a":1}{"b":"#], true);
        assert_eq!(objects, vec![r#"{"a":1}"#.to_string()]);
        assert_eq!(remainder, r#"{"b":"#);
    }
}

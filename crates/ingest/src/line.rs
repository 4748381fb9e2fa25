//! Byte-chunk → line reassembly
//!
//! Input chunks have no guaranteed line alignment: a JSON event may be
//! split at any byte offset, including mid-UTF-8-sequence. The assembler
//! keeps the trailing partial line in a carry-over buffer and only ever
//! splits at newlines, so multi-byte characters survive arbitrary splits.

/// Stateful line reassembler with a carry-over buffer.
#[derive(Debug, Default)]
pub struct LineAssembler {
    carry: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line completed by it.
    /// Trailing `\r` is stripped; the final partial line stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.carry.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drain the trailing partial line, if any. Called once at stream end
    /// for output that did not terminate with a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_yields_complete_lines() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
        assert!(asm.finish().is_none());
    }

    #[test]
    fn partial_line_is_carried_over() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"hel").is_empty());
        assert!(asm.push(b"lo wor").is_empty());
        let lines = asm.push(b"ld\nnext");
        assert_eq!(lines, vec!["hello world"]);
        assert_eq!(asm.finish().as_deref(), Some("next"));
    }

    #[test]
    fn crlf_is_normalized() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"a\r\nb\r\n");
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn reassembly_is_split_invariant() {
        let event = serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "héllo — multibyte ✓"}]}
        });
        let mut payload = serde_json::to_vec(&event).expect("serialize");
        payload.push(b'\n');

        let whole = {
            let mut asm = LineAssembler::new();
            asm.push(&payload)
        };
        assert_eq!(whole.len(), 1);

        // Split the serialized bytes at every possible chunk size, including
        // splits inside multi-byte characters.
        for chunk_size in 1..payload.len() {
            let mut asm = LineAssembler::new();
            let mut lines = Vec::new();
            for chunk in payload.chunks(chunk_size) {
                lines.extend(asm.push(chunk));
            }
            assert_eq!(lines, whole, "chunk_size {} diverged", chunk_size);
            assert!(asm.finish().is_none());
        }
    }

    #[test]
    fn empty_lines_are_emitted_not_swallowed() {
        // Blank lines are the parser's problem (it discards them); the
        // assembler must not silently merge around them.
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"a\n\nb\n");
        assert_eq!(lines, vec!["a", "", "b"]);
    }
}

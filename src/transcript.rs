use std::sync::Mutex;

/// Per-item console output sink.
///
/// Sequential runs write through to stdout as work happens. Parallel runs give
/// each worker a buffered transcript instead, and the orchestrator flushes the
/// buffers in original input order once every worker has finished — the
/// transcript stays deterministic no matter how workers interleave.
pub enum Transcript {
    Live,
    Buffered(Mutex<String>),
}

impl Transcript {
    pub fn live() -> Self {
        Transcript::Live
    }

    pub fn buffered() -> Self {
        Transcript::Buffered(Mutex::new(String::new()))
    }

    pub fn line(&self, text: &str) {
        match self {
            Transcript::Live => println!("{text}"),
            Transcript::Buffered(buf) => {
                let mut buf = buf.lock().expect("transcript lock poisoned");
                buf.push_str(text);
                buf.push('\n');
            }
        }
    }

    /// Drain the buffered output. Empty for live transcripts, which already
    /// wrote everything through.
    pub fn take(&self) -> String {
        match self {
            Transcript::Live => String::new(),
            Transcript::Buffered(buf) => {
                std::mem::take(&mut *buf.lock().expect("transcript lock poisoned"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_transcript_accumulates_in_order() {
        let t = Transcript::buffered();
        t.line("first");
        t.line("second");
        assert_eq!(t.take(), "first\nsecond\n");
        assert_eq!(t.take(), "");
    }

    #[test]
    fn live_transcript_has_nothing_to_drain() {
        let t = Transcript::live();
        t.line("goes straight to stdout");
        assert_eq!(t.take(), "");
    }
}

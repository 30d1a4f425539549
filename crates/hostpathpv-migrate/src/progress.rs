//! Operator-facing progress output.
//!
//! Orchestrators only emit [`ProgressEvent`]s. A single renderer task owns
//! the terminal and turns them into step lines.

use std::io::Write;
use tokio::sync::mpsc;

/// Width a finished step line is padded to with dashes
const LINE_WIDTH: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StepStarted { step: usize, description: String },
    /// Live detail for the running step, replacing the previous one
    StepDetail { step: usize, text: String },
    StepFinished {
        step: usize,
        ok: bool,
        note: Option<String>,
    },
    /// A cleanup action ran after the steps
    Cleanup { label: String, ok: bool },
    Summary { text: String },
}

/// Sending half of the progress stream.
///
/// Sends never fail; events are dropped once the renderer is gone.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl Progress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink that discards everything
    pub fn silent() -> Self {
        Self::channel().0
    }

    pub fn send(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn started(&self, step: usize, description: impl Into<String>) {
        self.send(ProgressEvent::StepStarted {
            step,
            description: description.into(),
        });
    }

    pub fn detail(&self, step: usize, text: impl Into<String>) {
        self.send(ProgressEvent::StepDetail {
            step,
            text: text.into(),
        });
    }

    pub fn finished(&self, step: usize, ok: bool, note: Option<String>) {
        self.send(ProgressEvent::StepFinished { step, ok, note });
    }

    pub fn summary(&self, text: impl Into<String>) {
        self.send(ProgressEvent::Summary { text: text.into() });
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "Fail"
    }
}

/// `head` padded with dashes, then the bracketed status
pub fn finished_line(head: &str, ok: bool) -> String {
    let pad = LINE_WIDTH.saturating_sub(head.chars().count());
    format!("{}{}[ {} ]", head, "-".repeat(pad), status(ok))
}

/// Terminal renderer state
pub struct Renderer<W: Write> {
    out: W,
    head: String,
    live: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            head: String::new(),
            live: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn clear_live(&mut self) -> std::io::Result<()> {
        if self.live {
            write!(self.out, "\r\x1b[2K")?;
            self.live = false;
        }
        Ok(())
    }

    pub fn handle(&mut self, event: &ProgressEvent) -> std::io::Result<()> {
        match event {
            ProgressEvent::StepStarted { step, description } => {
                self.clear_live()?;
                self.head = format!("(Step {}) {}", step, description);
                write!(self.out, "{}", self.head)?;
                self.live = true;
            }
            ProgressEvent::StepDetail { text, .. } => {
                self.clear_live()?;
                write!(self.out, "{} {}", self.head, text)?;
                self.live = true;
            }
            ProgressEvent::StepFinished { ok, note, .. } => {
                self.clear_live()?;
                writeln!(self.out, "{}", finished_line(&self.head, *ok))?;
                if let Some(note) = note {
                    writeln!(self.out, "    {}", note)?;
                }
                self.head.clear();
            }
            ProgressEvent::Cleanup { label, ok } => {
                self.clear_live()?;
                if !ok {
                    writeln!(self.out, "clean : {} [ {} ]", label, status(*ok))?;
                }
            }
            ProgressEvent::Summary { text } => {
                self.clear_live()?;
                writeln!(self.out)?;
                writeln!(self.out, "{}", text)?;
            }
        }
        self.out.flush()
    }

    /// Render until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> W {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(&event) {
                tracing::warn!(error = %e, "Progress output failed");
            }
        }
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_line_padding() {
        let line = finished_line("(Step 1) Start check", true);
        assert!(line.ends_with("-[ OK ]"));
        assert_eq!(line.chars().count(), LINE_WIDTH + "[ OK ]".len());

        let long = "x".repeat(200);
        assert_eq!(finished_line(&long, false), format!("{}[ Fail ]", long));
    }

    #[tokio::test]
    async fn test_renderer_output() {
        let (progress, rx) = Progress::channel();
        progress.started(1, "Start check quota path is moveable:");
        progress.detail(1, "(1/3)");
        progress.finished(1, true, None);
        progress.started(2, "Start create tmp pv:");
        progress.finished(2, false, Some("create failed".to_string()));
        progress.summary("Move hostpaths from n1 to n2 success");
        drop(progress);

        let out = Renderer::new(Vec::new()).run(rx).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("(Step 1) Start check quota path is moveable: (1/3)"));
        assert!(text.contains("[ OK ]\n"));
        assert!(text.contains("[ Fail ]\n    create failed\n"));
        assert!(text.ends_with("\nMove hostpaths from n1 to n2 success\n"));
    }

    #[test]
    fn test_silent_sink_never_fails() {
        let progress = Progress::silent();
        progress.started(1, "anything");
        progress.summary("done");
    }
}

//! Body consumers.

use crate::http::BodyFrame;

/// Whether a sink wants more of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    /// Stop the transfer. The connection is closed and the fetch returns
    /// `TransferError::Aborted`.
    Abort,
}

/// Receives body frames in order. A transfer calls `on_frame` with zero or
/// more `Chunk` frames followed by exactly one `End` or `Error`. The return
/// value is ignored for the terminal frame.
pub trait ByteSink {
    fn on_frame(&mut self, frame: &BodyFrame) -> SinkFlow;
}

impl<F> ByteSink for F
where
    F: FnMut(&BodyFrame) -> SinkFlow,
{
    fn on_frame(&mut self, frame: &BodyFrame) -> SinkFlow {
        self(frame)
    }
}

impl ByteSink for Vec<u8> {
    fn on_frame(&mut self, frame: &BodyFrame) -> SinkFlow {
        if let BodyFrame::Chunk(bytes) = frame {
            self.extend_from_slice(bytes);
        }
        SinkFlow::Continue
    }
}

/// Sink that keeps the body, the chunk count and the terminal frame.
#[derive(Debug, Default)]
pub struct BodyCollector {
    pub body: Vec<u8>,
    pub chunks: usize,
    pub terminal: Option<BodyFrame>,
    /// Terminal frames seen. Anything but 1 after a transfer is a bug.
    pub terminal_count: usize,
}

impl BodyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ended_cleanly(&self) -> bool {
        matches!(self.terminal, Some(BodyFrame::End))
    }
}

impl ByteSink for BodyCollector {
    fn on_frame(&mut self, frame: &BodyFrame) -> SinkFlow {
        match frame {
            BodyFrame::Chunk(bytes) => {
                self.chunks += 1;
                self.body.extend_from_slice(bytes);
            }
            terminal => {
                self.terminal_count += 1;
                self.terminal = Some(terminal.clone());
            }
        }
        SinkFlow::Continue
    }
}

//! Routes multiplexed attach frames into the per-stream capped buffers.

use crate::base::OutputCapture;
use crate::output::StreamKind;
use bollard::container::LogOutput;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// Drain `frames` to the end, splitting stdout and stderr. Each stream is
/// capped independently; frames past the cap are read and discarded.
pub(crate) async fn drain<S, E>(mut frames: S, capture: Arc<OutputCapture>)
where
    S: Stream<Item = Result<LogOutput, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                capture.push(StreamKind::Stdout, &message);
            }
            Ok(LogOutput::StdErr { message }) => capture.push(StreamKind::Stderr, &message),
            Ok(LogOutput::StdIn { .. }) => {}
            Err(error) => {
                debug!(error = %error, "attach stream ended with an error");
                break;
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::ExecutorBase;
    use skillguard_core::{RuntimeUsed, SandboxConfig};

    fn out(text: &str) -> Result<LogOutput, String> {
        Ok(LogOutput::StdOut {
            message: text.as_bytes().to_vec().into(),
        })
    }

    fn err(text: &str) -> Result<LogOutput, String> {
        Ok(LogOutput::StdErr {
            message: text.as_bytes().to_vec().into(),
        })
    }

    fn capture(max_output_bytes: usize) -> (ExecutorBase, Arc<OutputCapture>) {
        let mut config = SandboxConfig::hardened();
        config.resources.max_output_bytes = max_output_bytes;
        let base = ExecutorBase::new(config, RuntimeUsed::Container);
        let capture = base.output_capture("echo");
        (base, capture)
    }

    #[tokio::test]
    async fn interleaved_frames_are_split_by_stream() {
        let (_base, cap) = capture(1024);
        let frames = futures::stream::iter(vec![out("a"), err("x"), out("b"), err("y")]);
        drain(frames, Arc::clone(&cap)).await;
        let output = cap.snapshot();
        assert_eq!(output.stdout, "ab");
        assert_eq!(output.stderr, "xy");
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn one_noisy_stream_does_not_starve_the_other() {
        let (base, cap) = capture(8);
        let noisy = "z".repeat(100);
        let frames = futures::stream::iter(vec![out(&noisy), err("ok"), out(&noisy)]);
        drain(frames, Arc::clone(&cap)).await;
        let output = cap.snapshot();
        assert_eq!(output.stdout.len(), 4);
        assert_eq!(output.stderr, "ok");
        assert!(output.truncated);
        assert_eq!(base.violations().len(), 1);
    }

    #[tokio::test]
    async fn stream_error_stops_the_drain() {
        let (_base, cap) = capture(1024);
        let frames = futures::stream::iter(vec![out("kept"), Err("reset".to_owned()), out("lost")]);
        drain(frames, Arc::clone(&cap)).await;
        assert_eq!(cap.snapshot().stdout, "kept");
    }
}

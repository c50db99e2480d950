//! Result extractor: turns a raw harness run into an `ExecutionResult`.
//!
//! The marker is authoritative. Without one, the exit status decides between a
//! runtime fault (the interpreter never got going) and a harness error.

use crate::errors::FailureKind;
use crate::executors::RunOutcome;
use crate::script::{Marker, MarkerStatus, OutputStatus};
use crate::types::{Artifact, ExecutionResult, ImageFormat, ImageParams, OutputKind};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Cut `text` to at most `max_len` bytes on a char boundary.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &text[..end])
}

/// Width and height from a PNG IHDR chunk.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((width, height))
}

#[derive(Debug, Clone)]
pub struct ResultExtractor {
    max_message_len: usize,
}

impl ResultExtractor {
    pub fn new(max_message_len: usize) -> Self {
        Self { max_message_len }
    }

    pub fn extract(&self, outcome: &RunOutcome, requested: &OutputKind) -> ExecutionResult {
        let marker = match outcome.marker.as_deref().map(Marker::parse) {
            Some(Ok(marker)) => marker,
            Some(Err(e)) => {
                log::warn!(
                    "Unreadable marker from environment {}: {}",
                    outcome.environment_id,
                    e
                );
                return self.failure(
                    FailureKind::HarnessError,
                    format!("harness wrote an unreadable marker: {}", e),
                    outcome,
                    None,
                );
            }
            None => {
                let (kind, what) = if outcome.exit_code != 0 {
                    (FailureKind::RuntimeFault, "R process failed")
                } else {
                    (FailureKind::HarnessError, "harness finished without a marker")
                };
                let detail = outcome.stderr.trim();
                let message = if detail.is_empty() {
                    format!("{} (exit status {})", what, outcome.exit_code)
                } else {
                    format!("{} (exit status {}): {}", what, outcome.exit_code, detail)
                };
                return self.failure(kind, message, outcome, None);
            }
        };

        match marker.status {
            MarkerStatus::CallerError => {
                let partial = match requested {
                    OutputKind::Text => self.primary_text(outcome),
                    OutputKind::Image(_) => None,
                };
                self.failure(FailureKind::CallerError, marker.message, outcome, partial)
            }
            MarkerStatus::HarnessError => {
                self.failure(FailureKind::HarnessError, marker.message, outcome, None)
            }
            MarkerStatus::Ok => match requested {
                OutputKind::Image(params) => self.image(outcome, params),
                OutputKind::Text => self.text(outcome, marker.output),
            },
        }
    }

    fn image(&self, outcome: &RunOutcome, params: &ImageParams) -> ExecutionResult {
        let bytes = match outcome.primary_output.as_ref() {
            Some(bytes) if !bytes.is_empty() => bytes.clone(),
            _ => {
                return self.failure(
                    FailureKind::EmptyArtifact,
                    "script finished without drawing anything".to_string(),
                    outcome,
                    None,
                )
            }
        };

        if params.format == ImageFormat::Png {
            match png_dimensions(&bytes) {
                Some((w, h)) if (w, h) != (params.width, params.height) => log::warn!(
                    "Rendered PNG is {}x{}, requested {}x{}",
                    w,
                    h,
                    params.width,
                    params.height
                ),
                Some(_) => {}
                None => log::warn!("PNG output lacks a readable IHDR chunk"),
            }
        }

        ExecutionResult::Success(Artifact::Image {
            format: params.format,
            mime_type: params.format.mime_type().to_string(),
            width: params.width,
            height: params.height,
            resolution: params.resolution,
            bytes,
        })
    }

    fn text(&self, outcome: &RunOutcome, output: OutputStatus) -> ExecutionResult {
        let text = outcome
            .primary_output
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();

        if text.is_empty() && output != OutputStatus::Absent {
            return self.failure(
                FailureKind::EmptyArtifact,
                "harness reported output but none was captured".to_string(),
                outcome,
                None,
            );
        }
        ExecutionResult::Success(Artifact::Text { output: text })
    }

    fn primary_text(&self, outcome: &RunOutcome) -> Option<String> {
        outcome
            .primary_output
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .filter(|t| !t.is_empty())
    }

    fn failure(
        &self,
        kind: FailureKind,
        message: String,
        outcome: &RunOutcome,
        primary: Option<String>,
    ) -> ExecutionResult {
        let mut partial = String::new();
        for part in [primary.as_deref(), Some(outcome.stdout.as_str()), Some(outcome.stderr.as_str())]
            .into_iter()
            .flatten()
        {
            let part = part.trim_end();
            if part.is_empty() {
                continue;
            }
            if !partial.is_empty() {
                partial.push('\n');
            }
            partial.push_str(part);
        }
        ExecutionResult::failure_with_output(
            kind,
            truncate_text(message.trim(), self.max_message_len),
            Some(truncate_text(&partial, self.max_message_len)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::EnvironmentState;
    use uuid::Uuid;

    fn outcome(marker: Option<&str>, primary: Option<&[u8]>, exit_code: i64) -> RunOutcome {
        RunOutcome {
            environment_id: Uuid::new_v4(),
            final_state: EnvironmentState::Ready,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            marker: marker.map(|m| m.as_bytes().to_vec()),
            primary_output: primary.map(|p| p.to_vec()),
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    fn png_params() -> OutputKind {
        OutputKind::Image(ImageParams::new(ImageFormat::Png, 800, 600, 96).unwrap())
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(png_dimensions(&png(800, 600)), Some((800, 600)));
        assert_eq!(png_dimensions(b"not a png at all, really not"), None);
    }

    #[test]
    fn test_text_success() {
        let run = outcome(
            Some(r#"{"status": "ok", "message": "", "output": "produced"}"#),
            Some(b"[1] 2\n"),
            0,
        );
        let result = ResultExtractor::new(100).extract(&run, &OutputKind::Text);
        assert_eq!(
            result,
            ExecutionResult::Success(Artifact::Text {
                output: "[1] 2\n".to_string()
            })
        );
    }

    #[test]
    fn test_empty_text_depends_on_marker() {
        let extractor = ResultExtractor::new(100);
        let silent = outcome(Some(r#"{"status": "ok", "output": "none"}"#), None, 0);
        assert!(extractor.extract(&silent, &OutputKind::Text).is_success());

        let lost = outcome(Some(r#"{"status": "ok", "output": "produced"}"#), Some(b""), 0);
        assert_eq!(
            extractor.extract(&lost, &OutputKind::Text).failure_kind(),
            Some(FailureKind::EmptyArtifact)
        );
    }

    #[test]
    fn test_caller_error_carries_partial_output() {
        let mut run = outcome(
            Some(r#"{"status": "caller_error", "message": "boom", "output": "produced"}"#),
            Some(b"[1] 1\n"),
            1,
        );
        run.stderr = "Warning: something\n".to_string();
        match ResultExtractor::new(100).extract(&run, &OutputKind::Text) {
            ExecutionResult::Failure(f) => {
                assert_eq!(f.kind, FailureKind::CallerError);
                assert_eq!(f.message, "boom");
                assert_eq!(f.partial_output.as_deref(), Some("[1] 1\nWarning: something"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_marker_classification() {
        let extractor = ResultExtractor::new(100);
        let mut crashed = outcome(None, None, 127);
        crashed.stderr = "Rscript: not found".to_string();
        assert_eq!(
            extractor.extract(&crashed, &OutputKind::Text).failure_kind(),
            Some(FailureKind::RuntimeFault)
        );
        assert_eq!(
            extractor
                .extract(&outcome(None, None, 0), &OutputKind::Text)
                .failure_kind(),
            Some(FailureKind::HarnessError)
        );
    }

    #[test]
    fn test_image_success_and_empty_artifact() {
        let extractor = ResultExtractor::new(100);
        let ok = r#"{"status": "ok", "output": "produced"}"#;
        let bytes = png(800, 600);
        match extractor.extract(&outcome(Some(ok), Some(&bytes), 0), &png_params()) {
            ExecutionResult::Success(Artifact::Image {
                mime_type, bytes: b, ..
            }) => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(b, bytes);
            }
            other => panic!("unexpected {:?}", other),
        }

        let none = r#"{"status": "ok", "output": "none"}"#;
        assert_eq!(
            extractor
                .extract(&outcome(Some(none), None, 0), &png_params())
                .failure_kind(),
            Some(FailureKind::EmptyArtifact)
        );
    }

    #[test]
    fn test_messages_are_bounded() {
        let long = "x".repeat(500);
        let marker = format!(r#"{{"status": "harness_error", "message": "{}"}}"#, long);
        match ResultExtractor::new(50).extract(&outcome(Some(&marker), None, 2), &OutputKind::Text)
        {
            ExecutionResult::Failure(f) => {
                assert_eq!(f.kind, FailureKind::HarnessError);
                assert!(f.message.len() <= 50 + "... [truncated]".len());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(truncate_text("h\u{e9}llo", 2), "h... [truncated]");
    }
}

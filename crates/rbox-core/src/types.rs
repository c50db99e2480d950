//! Request and result values exchanged with the protocol layer.

use crate::errors::{FailureKind, RequestError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const MIN_IMAGE_DIMENSION: u32 = 100;
pub const MAX_IMAGE_DIMENSION: u32 = 5000;
pub const MIN_RESOLUTION: u32 = 72;
pub const MAX_RESOLUTION: u32 = 600;

/// Session-scoped workspace reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Pdf,
    Svg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Pdf => "pdf",
            ImageFormat::Svg => "svg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Pdf => "application/pdf",
            ImageFormat::Svg => "image/svg+xml",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "pdf" => Ok(ImageFormat::Pdf),
            "svg" => Ok(ImageFormat::Svg),
            other => Err(RequestError::UnknownFormat(other.to_string())),
        }
    }
}

/// Device parameters for an image render. Width and height are pixels,
/// resolution is DPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageParams {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub resolution: u32,
}

impl ImageParams {
    pub fn new(
        format: ImageFormat,
        width: u32,
        height: u32,
        resolution: u32,
    ) -> Result<Self, RequestError> {
        check_range("width", width as u64, MIN_IMAGE_DIMENSION as u64, MAX_IMAGE_DIMENSION as u64)?;
        check_range("height", height as u64, MIN_IMAGE_DIMENSION as u64, MAX_IMAGE_DIMENSION as u64)?;
        check_range("resolution", resolution as u64, MIN_RESOLUTION as u64, MAX_RESOLUTION as u64)?;
        Ok(Self {
            format,
            width,
            height,
            resolution,
        })
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), RequestError> {
    if value < min || value > max {
        return Err(RequestError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputKind {
    Image(ImageParams),
    Text,
}

/// One script invocation. Built through the validating constructors and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    code: String,
    output: OutputKind,
    session: SessionId,
    time_budget: Duration,
}

impl ExecutionRequest {
    pub fn new(
        session: SessionId,
        code: impl Into<String>,
        output: OutputKind,
        time_budget: Duration,
        max_time_budget: Duration,
    ) -> Result<Self, RequestError> {
        let code = code.into();
        if code.trim().is_empty() {
            return Err(RequestError::EmptyCode);
        }
        check_range(
            "time budget (seconds)",
            time_budget.as_secs(),
            1,
            max_time_budget.as_secs().max(1),
        )?;
        Ok(Self {
            code,
            output,
            session,
            time_budget,
        })
    }

    pub fn text(
        session: SessionId,
        code: impl Into<String>,
        time_budget: Duration,
        max_time_budget: Duration,
    ) -> Result<Self, RequestError> {
        Self::new(session, code, OutputKind::Text, time_budget, max_time_budget)
    }

    pub fn image(
        session: SessionId,
        code: impl Into<String>,
        params: ImageParams,
        time_budget: Duration,
        max_time_budget: Duration,
    ) -> Result<Self, RequestError> {
        Self::new(
            session,
            code,
            OutputKind::Image(params),
            time_budget,
            max_time_budget,
        )
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn output(&self) -> &OutputKind {
        &self.output
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn time_budget(&self) -> Duration {
        self.time_budget
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Artifact {
    Image {
        format: ImageFormat,
        mime_type: String,
        width: u32,
        height: u32,
        resolution: u32,
        bytes: Vec<u8>,
    },
    Text {
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub partial_output: Option<String>,
}

/// Outcome of one `ExecutionRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionResult {
    Success(Artifact),
    Failure(ExecutionFailure),
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ExecutionResult::Failure(ExecutionFailure {
            kind,
            message: message.into(),
            partial_output: None,
        })
    }

    pub fn failure_with_output(
        kind: FailureKind,
        message: impl Into<String>,
        partial_output: Option<String>,
    ) -> Self {
        ExecutionResult::Failure(ExecutionFailure {
            kind,
            message: message.into(),
            partial_output: partial_output.filter(|s| !s.is_empty()),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExecutionResult::Failure(failure) => Some(failure.kind),
            ExecutionResult::Success(_) => None,
        }
    }
}

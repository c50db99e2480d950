use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Ok,
    CallerError,
    HarnessError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Produced,
    #[default]
    #[serde(rename = "none")]
    Absent,
}

/// Contents of `marker.json`, written by the harness as its last act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub status: MarkerStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub output: OutputStatus,
}

impl Marker {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

use serde::{Deserialize, Serialize};

/// Response of the prerecorded `/v1/listen` endpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrerecordedResponse {
    pub metadata: Metadata,
    pub results: Results,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Metadata {
    pub request_id: String,
    #[serde(default)]
    pub duration: f32,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Results {
    pub channels: Vec<Channel>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
}

impl PrerecordedResponse {
    /// Best alternative of each channel, one line per channel.
    pub fn transcript(&self) -> String {
        self.results
            .channels
            .iter()
            .filter_map(|c| c.alternatives.first())
            .map(|a| a.transcript.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<&str>>()
            .join("\n")
    }

    /// Lowest first-alternative confidence across channels.
    pub fn confidence(&self) -> Option<f32> {
        self.results
            .channels
            .iter()
            .filter_map(|c| c.alternatives.first())
            .map(|a| a.confidence)
            .reduce(f32::min)
    }
}

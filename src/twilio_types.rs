pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Pause")]
        Pause(PauseAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PauseAction {
        #[xmlserde(name = b"length", ty = "attr")]
        pub length: Option<u16>,
    }
}
pub use twiml::*;

/// Call and recording statuses as Twilio spells them.
mod status {
    use crate::db_types::CallStatus;
    use serde::Deserialize;

    #[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
    #[serde(rename_all = "kebab-case")]
    pub enum ProviderCallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl From<ProviderCallStatus> for CallStatus {
        fn from(status: ProviderCallStatus) -> Self {
            match status {
                ProviderCallStatus::Queued | ProviderCallStatus::Initiated => CallStatus::Initiated,
                ProviderCallStatus::Ringing => CallStatus::Ringing,
                ProviderCallStatus::InProgress => CallStatus::InProgress,
                ProviderCallStatus::Completed => CallStatus::Completed,
                ProviderCallStatus::Busy => CallStatus::Busy,
                ProviderCallStatus::Failed | ProviderCallStatus::Canceled => CallStatus::Failed,
                ProviderCallStatus::NoAnswer => CallStatus::NoAnswer,
            }
        }
    }

    #[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
    #[serde(rename_all = "kebab-case")]
    pub enum RecordingStatus {
        InProgress,
        Paused,
        Stopped,
        Processing,
        Completed,
        Absent,
        Failed,
        Deleted,
    }
}
pub use status::*;

/// Twilio REST API (2010-04-01) resources, JSON representation.
mod rest {
    use super::{ProviderCallStatus, RecordingStatus};
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct CallResource {
        pub sid: String,
        pub status: ProviderCallStatus,
        /// Twilio reports durations as strings; absent until the call ends.
        #[serde(default)]
        pub duration: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct RecordingResource {
        pub sid: String,
        #[serde(default)]
        pub duration: Option<String>,
        pub status: RecordingStatus,
        pub date_created: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct RecordingList {
        pub recordings: Vec<RecordingResource>,
    }

    #[derive(Deserialize, Debug)]
    pub struct TwilioErrorBody {
        #[serde(default)]
        pub code: Option<u32>,
        pub message: String,
    }
}
pub use rest::*;

/// Form-encoded webhooks Twilio posts back to us.
mod callbacks {
    use super::{ProviderCallStatus, RecordingStatus};
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct StatusCallbackPayload {
        pub account_sid: String,
        pub call_sid: String,
        pub call_status: ProviderCallStatus,
        #[serde(default)]
        pub call_duration: Option<String>,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub to: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct RecordingCallbackPayload {
        pub account_sid: String,
        pub call_sid: String,
        pub recording_sid: String,
        pub recording_status: RecordingStatus,
        #[serde(default)]
        pub recording_duration: Option<String>,
    }
}
pub use callbacks::*;

/// Twilio sends durations as decimal strings.
pub fn parse_duration(duration: Option<&str>) -> Option<i32> {
    duration.and_then(|d| d.trim().parse::<i32>().ok())
}

//! Relay wire messages (videoroom plugin).
//!
//! Requests are POSTed to the control channel at `/janus` (create session),
//! `/janus/{session}` (attach) or `/janus/{session}/{handle}` (plugin
//! messages and trickle). Events come back one JSON object per long-poll.

use crate::errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Plugin every handle attaches to.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Relay error code for an unknown session id.
pub const NO_SUCH_SESSION: u64 = 458;

/// Session description payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepKind {
    Offer,
    Answer,
}

impl Jsep {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Audio/video flags for publisher join and media toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Body of a plugin `message`, discriminated by `request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum MessageBody {
    Exists {
        room: u64,
    },
    Create {
        room: u64,
        permanent: bool,
        is_private: bool,
        videocodec: &'static str,
        transport_wide_cc_ext: bool,
        fir_freq: u32,
        video_svc: bool,
    },
    #[serde(rename = "joinandconfigure")]
    JoinAndConfigure {
        room: u64,
        ptype: &'static str,
        keyframe: bool,
        video: bool,
        audio: bool,
        data: bool,
    },
    Join {
        room: u64,
        ptype: &'static str,
        video: bool,
        audio: bool,
        data: bool,
        offer_video: bool,
        offer_audio: bool,
        offer_data: bool,
        feed: u64,
    },
    Configure {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<bool>,
    },
    Start,
    Leave,
    #[serde(rename = "listparticipants")]
    ListParticipants {
        room: u64,
    },
    Destroy {
        room: u64,
    },
}

impl MessageBody {
    /// Room with the fixed media parameters used for every stream.
    #[must_use]
    pub fn create_room(room: u64) -> Self {
        MessageBody::Create {
            room,
            permanent: false,
            is_private: false,
            videocodec: "vp9",
            transport_wide_cc_ext: true,
            fir_freq: 1,
            video_svc: true,
        }
    }

    #[must_use]
    pub fn join_publisher(room: u64, media: MediaFlags) -> Self {
        MessageBody::JoinAndConfigure {
            room,
            ptype: "publisher",
            keyframe: true,
            video: media.video,
            audio: media.audio,
            data: false,
        }
    }

    /// Receive-only subscription to `feed`, video only.
    #[must_use]
    pub fn join_subscriber(room: u64, feed: u64) -> Self {
        MessageBody::Join {
            room,
            ptype: "subscriber",
            video: true,
            audio: false,
            data: false,
            offer_video: true,
            offer_audio: false,
            offer_data: false,
            feed,
        }
    }

    /// Bare configure, sent with the buffered offer after join.
    #[must_use]
    pub fn configure() -> Self {
        MessageBody::Configure {
            audio: None,
            video: None,
        }
    }

    #[must_use]
    pub fn configure_media(media: MediaFlags) -> Self {
        MessageBody::Configure {
            audio: Some(media.audio),
            video: Some(media.video),
        }
    }

    #[must_use]
    pub fn request_name(&self) -> &'static str {
        match self {
            MessageBody::Exists { .. } => "exists",
            MessageBody::Create { .. } => "create_room",
            MessageBody::JoinAndConfigure { .. } => "joinandconfigure",
            MessageBody::Join { .. } => "join",
            MessageBody::Configure { .. } => "configure",
            MessageBody::Start => "start",
            MessageBody::Leave => "leave",
            MessageBody::ListParticipants { .. } => "listparticipants",
            MessageBody::Destroy { .. } => "destroy",
        }
    }
}

/// A control-channel request.
///
/// The API secret is not part of the message; the client adds it on send.
#[derive(Debug, Clone, Serialize)]
pub struct RelayRequest {
    janus: &'static str,
    transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<MessageBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jsep: Option<Jsep>,
    /// `Some(None)` serializes as `"candidate": null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<Option<Value>>,
    #[serde(skip)]
    operation: &'static str,
}

impl RelayRequest {
    fn new(janus: &'static str, operation: &'static str) -> Self {
        Self {
            janus,
            transaction: Uuid::new_v4().to_string(),
            plugin: None,
            body: None,
            jsep: None,
            candidate: None,
            operation,
        }
    }

    #[must_use]
    pub fn create_session() -> Self {
        Self::new("create", "create_session")
    }

    #[must_use]
    pub fn attach() -> Self {
        Self {
            plugin: Some(VIDEOROOM_PLUGIN),
            ..Self::new("attach", "attach")
        }
    }

    #[must_use]
    pub fn message(body: MessageBody) -> Self {
        let operation = body.request_name();
        Self {
            body: Some(body),
            ..Self::new("message", operation)
        }
    }

    #[must_use]
    pub fn message_with_jsep(body: MessageBody, jsep: Jsep) -> Self {
        Self {
            jsep: Some(jsep),
            ..Self::message(body)
        }
    }

    /// Trickle a client ICE candidate; `None` ends the trickle.
    #[must_use]
    pub fn trickle(candidate: Option<Value>) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::new("trickle", "trickle")
        }
    }

    /// Bounded label for metrics and logs.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    #[must_use]
    pub fn body(&self) -> Option<&MessageBody> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn jsep(&self) -> Option<&Jsep> {
        self.jsep.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseData {
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RelayErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Synchronous control-channel response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RelayResponse {
    pub janus: String,
    #[serde(default)]
    pub data: Option<ResponseData>,
    #[serde(default)]
    pub plugindata: Option<PluginData>,
    #[serde(default)]
    pub error: Option<RelayErrorBody>,
}

impl RelayResponse {
    /// `success` (synchronous) or `ack` (asynchronous, result arrives as an event).
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.janus.as_str(), "success" | "ack")
    }

    /// Id assigned by `create` or `attach`.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` if the relay refused or returned no id.
    pub fn created_id(&self) -> Result<u64, OrchestratorError> {
        if self.janus != "success" {
            return Err(OrchestratorError::RelayUnavailable(format!(
                "relay answered {}: {}",
                self.janus,
                self.error
                    .as_ref()
                    .and_then(|e| e.reason.as_deref())
                    .unwrap_or("no reason")
            )));
        }
        self.data
            .as_ref()
            .and_then(|d| d.id)
            .ok_or_else(|| OrchestratorError::RelayUnavailable("relay returned no id".to_string()))
    }

    #[must_use]
    pub fn plugin_data(&self) -> Option<&Value> {
        self.plugindata.as_ref().map(|p| &p.data)
    }

    /// Answer to `exists`.
    #[must_use]
    pub fn room_exists(&self) -> bool {
        self.plugin_data()
            .and_then(|d| d.get("exists"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Answer to `listparticipants`. Empty when the room is gone.
    #[must_use]
    pub fn participants(&self) -> Vec<RoomParticipant> {
        self.plugin_data()
            .and_then(|d| d.get("participants"))
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default()
    }
}

/// One entry of a `listparticipants` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomParticipant {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default)]
    pub publisher: bool,
}

/// An event from a session's long-poll channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    KeepAlive,
    /// `receiving` is absent on some media events.
    Media { receiving: Option<bool> },
    WebRtcUp,
    /// SDP answer to an offer the client sent.
    Answer { sdp: String },
    Candidate(Value),
    CandidatesComplete,
    /// Publisher attach ack with the relay-assigned publisher id.
    Joined { publisher_id: u64 },
    /// Subscriber attach ack, carrying the relay's SDP for the subscriber.
    Attached { sdp: Option<String> },
    Configured,
    Hangup,
    Left,
    /// Error reported on the event channel instead of an event.
    Error { code: Option<u64>, reason: String },
    Other(String),
}

impl RelayEvent {
    /// Parse one long-poll body.
    ///
    /// # Errors
    ///
    /// `RelayProtocol` if the body is not a JSON object.
    pub fn parse(raw: &str) -> Result<Self, OrchestratorError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::RelayProtocol(format!("event is not JSON: {e}")))?;
        if !value.is_object() {
            return Err(OrchestratorError::RelayProtocol(
                "event is not an object".to_string(),
            ));
        }
        Ok(Self::from_value(&value))
    }

    /// Classify an event. Checks run in a fixed order: a `jsep` answer wins
    /// over any plugin payload in the same event.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let janus = value.get("janus").and_then(Value::as_str).unwrap_or("");
        let plugin = value.get("plugindata").and_then(|p| p.get("data"));
        let videoroom = plugin
            .and_then(|d| d.get("videoroom"))
            .and_then(Value::as_str);
        let jsep = value.get("jsep");
        let jsep_sdp = jsep
            .and_then(|j| j.get("sdp"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let candidate = value.get("candidate");

        if janus == "keepalive" {
            return RelayEvent::KeepAlive;
        }
        if janus == "error" {
            let error = value.get("error");
            return RelayEvent::Error {
                code: error.and_then(|e| e.get("code")).and_then(Value::as_u64),
                reason: error
                    .and_then(|e| e.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("no reason")
                    .to_string(),
            };
        }
        if janus == "media" {
            let receiving = value.get("receiving").and_then(Value::as_bool);
            return RelayEvent::Media { receiving };
        }
        if janus == "webrtcup" {
            return RelayEvent::WebRtcUp;
        }
        let is_answer = jsep
            .and_then(|j| j.get("type"))
            .and_then(Value::as_str)
            == Some("answer");
        if let (true, Some(sdp)) = (is_answer, jsep_sdp.clone()) {
            return RelayEvent::Answer { sdp };
        }
        if janus == "trickle" {
            if let Some(candidate) = candidate {
                if candidate.get("candidate").is_some_and(|c| !c.is_null()) {
                    return RelayEvent::Candidate(candidate.clone());
                }
                if candidate
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    return RelayEvent::CandidatesComplete;
                }
            }
        }
        match videoroom {
            Some("joined") => {
                let publisher_id = plugin
                    .and_then(|d| d.get("id"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                return RelayEvent::Joined { publisher_id };
            }
            Some("attached") => return RelayEvent::Attached { sdp: jsep_sdp },
            _ => {}
        }
        if plugin
            .and_then(|d| d.get("configured"))
            .is_some_and(|c| !c.is_null())
        {
            return RelayEvent::Configured;
        }
        if janus == "hangup" {
            return RelayEvent::Hangup;
        }
        if videoroom == Some("left") {
            return RelayEvent::Left;
        }
        RelayEvent::Other(janus.to_string())
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::KeepAlive => "keepalive",
            RelayEvent::Media { .. } => "media",
            RelayEvent::WebRtcUp => "webrtcup",
            RelayEvent::Answer { .. } => "answer",
            RelayEvent::Candidate(_) => "candidate",
            RelayEvent::CandidatesComplete => "candidates_complete",
            RelayEvent::Joined { .. } => "joined",
            RelayEvent::Attached { .. } => "attached",
            RelayEvent::Configured => "configured",
            RelayEvent::Hangup => "hangup",
            RelayEvent::Left => "left",
            RelayEvent::Error { .. } => "error",
            RelayEvent::Other(_) => "other",
        }
    }
}

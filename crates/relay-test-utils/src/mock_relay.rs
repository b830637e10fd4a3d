//! Scripted relay endpoint.
//!
//! Answers the control channel like a videoroom relay: `create` and `attach`
//! hand out increasing ids, `exists` / `create` / `destroy` track rooms per
//! host, `listparticipants` returns what the test configured. Hosts can be
//! made to fail. Every request is recorded.
//!
//! Events are queued per relay session with [`MockRelay::push_event`]; a
//! poll with nothing queued waits up to `poll_wait` and comes back empty.

use async_trait::async_trait;
use relay_orchestrator::errors::OrchestratorError;
use relay_orchestrator::registry::RelayInstance;
use relay_orchestrator::relay::{RelayClient, RelayRequest, RelayResponse};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One control-channel request as the relay saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub host: String,
    pub path: String,
    pub payload: Value,
}

impl RecordedRequest {
    /// `janus` verb, e.g. `create`, `attach`, `message`, `trickle`.
    pub fn verb(&self) -> &str {
        self.payload["janus"].as_str().unwrap_or("")
    }

    /// Plugin request name for `message`s, e.g. `joinandconfigure`.
    pub fn request(&self) -> Option<&str> {
        self.payload["body"]["request"].as_str()
    }
}

#[derive(Clone)]
pub struct MockRelay {
    inner: Arc<Mutex<MockRelayInner>>,
    event_ready: Arc<Notify>,
    poll_wait: Duration,
}

#[derive(Default)]
struct MockRelayInner {
    next_id: u64,
    failing_hosts: HashSet<String>,
    /// (host, room id)
    rooms: HashSet<(String, u64)>,
    participants: HashMap<u64, Vec<Value>>,
    failing_participant_lists: bool,
    requests: Vec<RecordedRequest>,
    sessions: Vec<u64>,
    events: HashMap<u64, VecDeque<String>>,
    /// Body returned by every poll of a session, ahead of queued events.
    standing_answers: HashMap<u64, String>,
    polls: HashMap<u64, usize>,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockRelayInner {
                next_id: 1000,
                ..MockRelayInner::default()
            })),
            event_ready: Arc::new(Notify::new()),
            poll_wait: Duration::from_millis(20),
        }
    }

    #[must_use]
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }

    /// Treat `room` as already existing on `host`.
    #[must_use]
    pub fn with_room(self, host: &str, room: u64) -> Self {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .insert((host.to_string(), room));
        self
    }

    pub fn client(&self) -> Arc<dyn RelayClient> {
        Arc::new(self.clone())
    }

    /// Every request to `host` fails with `RelayUnavailable`.
    pub fn fail_host(&self, host: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_hosts
            .insert(host.to_string());
    }

    pub fn heal_host(&self, host: &str) {
        self.inner.lock().unwrap().failing_hosts.remove(host);
    }

    /// Participants returned by `listparticipants` for `room`.
    pub fn set_participants(&self, room: u64, ids: &[u64]) {
        let list = ids
            .iter()
            .map(|id| json!({"id": id, "publisher": true}))
            .collect();
        self.inner.lock().unwrap().participants.insert(room, list);
    }

    /// `listparticipants` answers with a relay error.
    pub fn fail_participant_lists(&self, failing: bool) {
        self.inner.lock().unwrap().failing_participant_lists = failing;
    }

    /// Queue a raw event body on `session`'s event channel.
    pub fn push_event(&self, session: u64, raw: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .events
            .entry(session)
            .or_default()
            .push_back(raw.into());
        self.event_ready.notify_waiters();
    }

    /// Answer every poll of `session` with `raw` until the test ends.
    pub fn answer_polls_with(&self, session: u64, raw: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .standing_answers
            .insert(session, raw.into());
        self.event_ready.notify_waiters();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Recorded `message`s whose body has the given `request` name.
    pub fn messages(&self, request: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.request() == Some(request))
            .collect()
    }

    /// Relay session ids handed out so far, in order.
    pub fn sessions(&self) -> Vec<u64> {
        self.inner.lock().unwrap().sessions.clone()
    }

    pub fn poll_count(&self, session: u64) -> usize {
        self.inner
            .lock()
            .unwrap()
            .polls
            .get(&session)
            .copied()
            .unwrap_or(0)
    }

    pub fn has_room(&self, host: &str, room: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .rooms
            .contains(&(host.to_string(), room))
    }

    fn answer(host: &str, inner: &mut MockRelayInner, payload: &Value) -> Value {
        match payload["janus"].as_str().unwrap_or("") {
            "create" | "attach" => {
                inner.next_id += 1;
                let id = inner.next_id;
                if payload["janus"] == "create" {
                    inner.sessions.push(id);
                }
                json!({"janus": "success", "data": {"id": id}})
            }
            "message" => {
                let body = &payload["body"];
                let room = body["room"].as_u64().unwrap_or(0);
                let key = (host.to_string(), room);
                let data = match body["request"].as_str().unwrap_or("") {
                    "exists" => json!({"videoroom": "success", "exists": inner.rooms.contains(&key)}),
                    "create" => {
                        inner.rooms.insert(key);
                        json!({"videoroom": "created", "room": room})
                    }
                    "destroy" => {
                        inner.rooms.remove(&key);
                        json!({"videoroom": "destroyed", "room": room})
                    }
                    "listparticipants" if inner.failing_participant_lists => {
                        return json!({"janus": "error", "error": {"code": 500, "reason": "scripted failure"}});
                    }
                    "listparticipants" => json!({
                        "videoroom": "participants",
                        "room": room,
                        "participants": inner.participants.get(&room).cloned().unwrap_or_default(),
                    }),
                    _ => return json!({"janus": "ack"}),
                };
                json!({
                    "janus": "success",
                    "plugindata": {"plugin": "janus.plugin.videoroom", "data": data},
                })
            }
            _ => json!({"janus": "ack"}),
        }
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn send(
        &self,
        instance: &RelayInstance,
        path: &str,
        request: &RelayRequest,
    ) -> Result<RelayResponse, OrchestratorError> {
        let payload = serde_json::to_value(request).unwrap();
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(RecordedRequest {
            host: instance.host.clone(),
            path: path.to_string(),
            payload: payload.clone(),
        });

        if inner.failing_hosts.contains(&instance.host) {
            return Err(OrchestratorError::RelayUnavailable(format!(
                "{} is down",
                instance.host
            )));
        }

        let answer = Self::answer(&instance.host, &mut inner, &payload);
        if answer["janus"] == "error" {
            return Err(OrchestratorError::RelayUnavailable(
                "relay answered error".to_string(),
            ));
        }
        Ok(serde_json::from_value(answer).unwrap())
    }

    async fn poll_event(
        &self,
        instance: &RelayInstance,
        session: u64,
    ) -> Result<Option<String>, OrchestratorError> {
        let ready = self.event_ready.notified();
        {
            let mut inner = self.inner.lock().unwrap();
            *inner.polls.entry(session).or_default() += 1;
            if inner.failing_hosts.contains(&instance.host) {
                return Err(OrchestratorError::RelayUnavailable(format!(
                    "{} is down",
                    instance.host
                )));
            }
            if let Some(answer) = inner.standing_answers.get(&session) {
                return Ok(Some(answer.clone()));
            }
            if let Some(event) = inner.events.get_mut(&session).and_then(VecDeque::pop_front) {
                return Ok(Some(event));
            }
        }

        let _ = tokio::time::timeout(self.poll_wait, ready).await;
        let event = self
            .inner
            .lock()
            .unwrap()
            .events
            .get_mut(&session)
            .and_then(VecDeque::pop_front);
        Ok(event)
    }
}

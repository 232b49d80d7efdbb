//! Request/response plumbing to the native host.
//!
//! Every host call returns a [`poll_promise::Promise`] that the coordinator polls on its
//! own schedule. Failures are carried as `Arc<eyre::Report>` so a result can be cloned
//! out of the promise.

use eyre::eyre;
use log::{debug, warn};
use poll_promise::{Promise, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};

use crate::MapError;
use crate::geometry::LngLat;

/// The outcome of a host call.
pub type BridgeResult<T> = Result<T, Arc<eyre::Report>>;

/// A host call in flight.
pub type BridgeReply<T> = Promise<BridgeResult<T>>;

/// The native host as seen from the map.
pub trait HostBridge {
    /// Asks for the persisted shape list, a JSON array, or `None` if nothing was saved.
    fn load_shapes(&mut self) -> BridgeReply<Option<String>>;

    /// Persists the full shape list.
    fn save_shapes(&mut self, json: String) -> BridgeReply<()>;

    /// Asks the host to collect a label for a marker placed at `position`.
    ///
    /// The label comes back later through
    /// [`crate::coordinator::MapCoordinator::add_final_marker_with_label`].
    fn marker_position_selected(&mut self, position: LngLat) -> BridgeReply<()>;

    /// Offers the attribute keys found in an imported GeoJSON file for selection.
    fn report_geojson_keys(&mut self, keys: Vec<String>) -> BridgeReply<()>;

    /// Delivers whatever answers have arrived. Called before promises are checked.
    fn poll(&mut self) {}
}

/// A call to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum BridgeCall {
    /// Load the persisted shapes.
    LoadShapes,
    /// Save the shape list.
    SaveShapes {
        /// JSON array of shape records.
        json: String,
    },
    /// Collect a marker label.
    OnMarkerPositionSelected {
        /// Longitude.
        lng: f64,
        /// Latitude.
        lat: f64,
    },
    /// Offer GeoJSON attribute keys.
    ReportGeoJsonKeys {
        /// Distinct keys, sorted.
        keys: Vec<String>,
    },
}

/// A call tagged with its correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Correlation id, echoed by the response.
    pub id: u64,
    /// The call.
    #[serde(flatten)]
    pub call: BridgeCall,
}

/// The host's answer to a [`BridgeRequest`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    /// Id of the answered request.
    pub id: u64,
    /// Returned value, `null` for acknowledgements.
    #[serde(default)]
    pub result: JsonValue,
    /// Set when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Pending {
    Text(Sender<BridgeResult<Option<String>>>),
    Ack(Sender<BridgeResult<()>>),
}

impl Pending {
    fn resolve(self, response: BridgeResponse) {
        let failure = response
            .error
            .map(|message| Arc::new(eyre!("host returned an error: {message}")));
        match self {
            Pending::Text(sender) => sender.send(match failure {
                Some(e) => Err(e),
                None => Ok(match response.result {
                    JsonValue::Null => None,
                    JsonValue::String(text) => Some(text),
                    other => Some(other.to_string()),
                }),
            }),
            Pending::Ack(sender) => sender.send(failure.map_or(Ok(()), Err)),
        }
    }

    fn fail(self, report: Arc<eyre::Report>) {
        match self {
            Pending::Text(sender) => sender.send(Err(report)),
            Pending::Ack(sender) => sender.send(Err(report)),
        }
    }
}

/// A [`HostBridge`] over a pair of channels.
///
/// Requests go out as [`BridgeRequest`]s; the host answers through its
/// [`HostEndpoint`] with the same id. Dropping the bridge, or the host hanging up,
/// fails every request still waiting.
pub struct ChannelBridge {
    requests: mpsc::Sender<BridgeRequest>,
    responses: Receiver<BridgeResponse>,
    pending: HashMap<u64, Pending>,
    next_id: u64,
}

impl ChannelBridge {
    /// Creates a bridge and the endpoint the host serves it from.
    pub fn new() -> (Self, HostEndpoint) {
        let (request_tx, request_rx) = mpsc::channel();
        let (response_tx, response_rx) = mpsc::channel();
        let bridge = Self {
            requests: request_tx,
            responses: response_rx,
            pending: HashMap::new(),
            next_id: 0,
        };
        let endpoint = HostEndpoint {
            requests: request_rx,
            responses: response_tx,
        };
        (bridge, endpoint)
    }

    /// Number of requests waiting for an answer.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn send<T: Send + 'static>(
        &mut self,
        call: BridgeCall,
        pending: impl FnOnce(Sender<BridgeResult<T>>) -> Pending,
    ) -> BridgeReply<T> {
        self.next_id += 1;
        let id = self.next_id;
        let request = BridgeRequest { id, call };
        debug!("Host request {id}: {:?}", request.call);

        if self.requests.send(request).is_err() {
            return Promise::from_ready(Err(Arc::new(eyre!(MapError::Bridge(
                "host is not connected".to_string()
            )))));
        }
        let (sender, promise) = Promise::new();
        self.pending.insert(id, pending(sender));
        promise
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            pending.fail(Arc::new(eyre!(MapError::Bridge(reason.to_string()))));
        }
    }
}

impl HostBridge for ChannelBridge {
    fn load_shapes(&mut self) -> BridgeReply<Option<String>> {
        self.send(BridgeCall::LoadShapes, Pending::Text)
    }

    fn save_shapes(&mut self, json: String) -> BridgeReply<()> {
        self.send(BridgeCall::SaveShapes { json }, Pending::Ack)
    }

    fn marker_position_selected(&mut self, position: LngLat) -> BridgeReply<()> {
        let call = BridgeCall::OnMarkerPositionSelected {
            lng: position.lng(),
            lat: position.lat(),
        };
        self.send(call, Pending::Ack)
    }

    fn report_geojson_keys(&mut self, keys: Vec<String>) -> BridgeReply<()> {
        self.send(BridgeCall::ReportGeoJsonKeys { keys }, Pending::Ack)
    }

    fn poll(&mut self) {
        loop {
            match self.responses.try_recv() {
                Ok(response) => match self.pending.remove(&response.id) {
                    Some(pending) => pending.resolve(response),
                    None => warn!("Dropping host response for unknown request {}", response.id),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fail_all("host disconnected");
                    break;
                }
            }
        }
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        // An unresolved promise whose sender is dropped panics when polled.
        self.fail_all("bridge closed");
    }
}

/// The host side of a [`ChannelBridge`].
pub struct HostEndpoint {
    requests: Receiver<BridgeRequest>,
    responses: mpsc::Sender<BridgeResponse>,
}

impl HostEndpoint {
    /// The next unanswered request, if any.
    pub fn next_request(&self) -> Option<BridgeRequest> {
        self.requests.try_recv().ok()
    }

    /// Answers request `id` with `result`.
    pub fn reply(&self, id: u64, result: JsonValue) -> Result<(), MapError> {
        self.respond(BridgeResponse {
            id,
            result,
            error: None,
        })
    }

    /// Fails request `id`.
    pub fn fail(&self, id: u64, message: &str) -> Result<(), MapError> {
        self.respond(BridgeResponse {
            id,
            result: JsonValue::Null,
            error: Some(message.to_string()),
        })
    }

    /// Sends a response that arrived as JSON text.
    pub fn respond_json(&self, text: &str) -> Result<(), MapError> {
        self.respond(serde_json::from_str(text)?)
    }

    /// Sends a response.
    pub fn respond(&self, response: BridgeResponse) -> Result<(), MapError> {
        self.responses
            .send(response)
            .map_err(|_| MapError::Bridge("map side of the bridge is closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_shapes_round_trip() {
        let (mut bridge, host) = ChannelBridge::new();
        let promise = bridge.load_shapes();
        assert!(promise.ready().is_none());

        let request = host.next_request().unwrap();
        assert_eq!(request.call, BridgeCall::LoadShapes);
        host.reply(request.id, json!("[]")).unwrap();

        bridge.poll();
        assert_eq!(bridge.pending(), 0);
        match promise.ready() {
            Some(Ok(Some(text))) => assert_eq!(text, "[]"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn null_result_means_nothing_saved() {
        let (mut bridge, host) = ChannelBridge::new();
        let promise = bridge.load_shapes();
        host.respond_json(r#"{"id": 1, "result": null}"#).unwrap();
        bridge.poll();
        assert!(matches!(promise.ready(), Some(Ok(None))));
    }

    #[test]
    fn error_reply_fails_the_promise() {
        let (mut bridge, host) = ChannelBridge::new();
        let promise = bridge.save_shapes("[]".to_string());
        let request = host.next_request().unwrap();
        host.fail(request.id, "disk full").unwrap();
        bridge.poll();

        let Some(Err(e)) = promise.ready() else {
            panic!("expected a failure");
        };
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn responses_are_matched_by_id() {
        let (mut bridge, host) = ChannelBridge::new();
        let first = bridge.save_shapes("[1]".to_string());
        let second = bridge.save_shapes("[2]".to_string());
        let a = host.next_request().unwrap();
        let b = host.next_request().unwrap();
        assert_ne!(a.id, b.id);

        host.reply(b.id, JsonValue::Null).unwrap();
        host.reply(999, JsonValue::Null).unwrap();
        bridge.poll();
        assert!(first.ready().is_none());
        assert!(matches!(second.ready(), Some(Ok(()))));
        assert_eq!(bridge.pending(), 1);
    }

    #[test]
    fn dropping_the_bridge_fails_pending_requests() {
        let (mut bridge, _host) = ChannelBridge::new();
        let promise = bridge.report_geojson_keys(vec!["name".to_string()]);
        drop(bridge);
        assert!(matches!(promise.ready(), Some(Err(_))));
    }

    #[test]
    fn host_hanging_up_fails_requests() {
        let (mut bridge, host) = ChannelBridge::new();
        let waiting = bridge.marker_position_selected(LngLat(127.0, 37.5));
        drop(host);
        bridge.poll();
        assert!(matches!(waiting.ready(), Some(Err(_))));

        let late = bridge.load_shapes();
        assert!(matches!(late.ready(), Some(Err(_))));
    }

    #[test]
    fn requests_serialize_with_method_and_params() {
        let request = BridgeRequest {
            id: 7,
            call: BridgeCall::OnMarkerPositionSelected {
                lng: 127.0,
                lat: 37.5,
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": 7, "method": "onMarkerPositionSelected", "params": {"lng": 127.0, "lat": 37.5}})
        );

        let load = BridgeRequest {
            id: 1,
            call: BridgeCall::LoadShapes,
        };
        assert_eq!(
            serde_json::to_value(&load).unwrap(),
            json!({"id": 1, "method": "loadShapes"})
        );
    }
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to set up peer connection: {0}")]
    Setup(String),
    #[error("failed to apply session description: {0}")]
    Sdp(String),
    #[error("failed to apply remote candidate: {0}")]
    Candidate(String),
    #[error("failed to close peer connection: {0}")]
    Close(String),
}

/// A STUN or TURN server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// An ICE candidate in its wire form, field names matching the browser's
/// RTCIceCandidateInit dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Connection progress reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Terminal states mean the connection is gone and will not recover
    /// on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Event streams attached to one negotiation. Local candidates arrive as
/// `Some(candidate)` and a final `None` marks the end of gathering.
pub struct NegotiationEvents {
    pub candidates: mpsc::UnboundedReceiver<Option<CandidateInit>>,
    pub states: mpsc::UnboundedReceiver<ConnectionState>,
}

/// One negotiation in progress. Methods mirror the answerer side of the
/// offer/answer exchange and are safe to call from any task.
#[async_trait]
pub trait Negotiation: Send + Sync {
    async fn set_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError>;
    async fn create_answer(&self) -> Result<String, NegotiationError>;
    async fn set_local_answer(&self, sdp: &str) -> Result<(), NegotiationError>;
    /// Resolves once local candidate gathering has finished. Used when the
    /// caller wants a single answer carrying every candidate inline.
    async fn wait_gathering_complete(&self);
    async fn local_description(&self) -> Option<String>;
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Factory for negotiations. The relay only ever talks to this trait, so
/// tests can substitute scripted implementations.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn Negotiation>, NegotiationEvents), NegotiationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiatorOptions {
    /// Install an echo handler on every data channel the remote opens.
    pub echo_data_channels: bool,
}

/// Production [`Negotiator`] backed by a shared webrtc API object.
pub struct WebRtcNegotiator {
    api: API,
    echo_data_channels: bool,
}

impl WebRtcNegotiator {
    pub fn new() -> Result<Self, NegotiationError> {
        Self::with_options(NegotiatorOptions::default())
    }

    pub fn with_options(options: NegotiatorOptions) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            echo_data_channels: options.echo_data_channels,
        })
    }
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn Negotiation>, NegotiationEvents), NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| NegotiationError::Setup(err.to_string()))?,
        );

        let (candidate_tx, candidates) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(Some(CandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to serialize local candidate");
                        }
                    },
                    None => {
                        let _ = tx.send(None);
                    }
                }
            })
        }));

        let (state_tx, states) = mpsc::unbounded_channel();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ConnectionState::from(state));
            })
        }));

        if self.echo_data_channels {
            pc.on_data_channel(Box::new(|channel| {
                Box::pin(async move {
                    install_echo(channel);
                })
            }));
        }

        debug!(ice_servers = ice_servers.len(), "peer connection created");

        let handle: Arc<dyn Negotiation> = Arc::new(WebRtcNegotiation { pc });
        Ok((handle, NegotiationEvents { candidates, states }))
    }
}

struct WebRtcNegotiation {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Negotiation for WebRtcNegotiation {
    async fn set_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))
    }

    async fn wait_gathering_complete(&self) {
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|err| NegotiationError::Close(err.to_string()))
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn install_echo(channel: Arc<RTCDataChannel>) {
    let outbound = channel.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let outbound = outbound.clone();
        Box::pin(async move {
            let sent = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => outbound.send_text(text).await,
                    Err(_) => return,
                }
            } else {
                outbound.send(&msg.data).await
            };
            if let Err(err) = sent {
                debug!(error = %err, "echo send failed");
            }
        })
    }));
}

// libwebrtc-backed peer transport (via the LiveKit Rust SDK).
//
// Outbound audio is a track built from the capture's NativeAudioSource.
// Inbound audio is pulled from a NativeAudioStream and written into the
// speaker output, if one was provided.

use std::sync::{Arc, Mutex};

use futures::{future::BoxFuture, StreamExt};
use livekit::webrtc::{
    audio_stream::native::NativeAudioStream,
    ice_candidate::IceCandidate as RtcIceCandidate,
    media_stream_track::MediaStreamTrack,
    peer_connection::{AnswerOptions, OfferOptions, PeerConnection, PeerConnectionState, TrackEvent},
    peer_connection_factory::{
        ContinualGatheringPolicy, IceServer, IceTransportsType, PeerConnectionFactory, RtcConfiguration,
    },
    rtp_sender::RtpSender,
    session_description::{SdpType, SessionDescription as RtcSessionDescription},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::{
    PeerTransport, RemoteStream, TrackSwap, TransportError, TransportEvents, TransportFactory,
    TransportState,
};
use crate::{
    audio::{AudioOutput, CaptureHandle},
    signaling::{IceCandidate, SdpKind, SessionDescription},
};

/// Playback format requested from libwebrtc's jitter buffer.
const PLAYBACK_SAMPLE_RATE: i32 = 48_000;
const PLAYBACK_CHANNELS: i32 = 1;

pub struct RtcTransportFactory {
    factory: Arc<PeerConnectionFactory>,
    /// Media stream id announced for our outbound audio.
    stream_id: String,
    playback: Option<Arc<AudioOutput>>,
}

impl RtcTransportFactory {
    pub fn new(playback: Option<Arc<AudioOutput>>) -> Self {
        Self {
            factory: Arc::new(PeerConnectionFactory::default()),
            stream_id: format!("spaces-{}", uuid::Uuid::new_v4()),
            playback,
        }
    }
}

impl TransportFactory for RtcTransportFactory {
    fn create(
        &self,
        user_id: &str,
        ice_servers: &[String],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let config = RtcConfiguration {
            ice_servers: vec![IceServer {
                urls: ice_servers.to_vec(),
                username: String::new(),
                password: String::new(),
            }],
            continual_gathering_policy: ContinualGatheringPolicy::GatherContinually,
            ice_transport_type: IceTransportsType::All,
        };
        let pc = self
            .factory
            .create_peer_connection(config)
            .map_err(|e| TransportError(format!("create peer connection: {e:?}")))?;

        // libwebrtc invokes these on its own threads.
        let ev = events.clone();
        pc.on_ice_candidate(Some(Box::new(move |candidate: RtcIceCandidate| {
            ev.local_candidate(IceCandidate {
                candidate: candidate.candidate(),
                sdp_mid: Some(candidate.sdp_mid()),
                sdp_mline_index: u16::try_from(candidate.sdp_mline_index()).ok(),
            });
        })));

        let ev = events.clone();
        pc.on_connection_state_change(Some(Box::new(move |state| {
            ev.state_changed(map_state(state));
        })));

        let readers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let ev = events;
        let rt = tokio::runtime::Handle::current();
        let playback = self.playback.clone();
        let track_readers = readers.clone();
        pc.on_track(Some(Box::new(move |event: TrackEvent| {
            let MediaStreamTrack::Audio(track) = event.track else {
                return;
            };
            let stream_id = event.streams.first().map(|s| s.id()).unwrap_or_default();
            ev.remote_stream(RemoteStream { stream_id, track_id: track.id() });

            let Some(output) = playback.clone() else { return };
            let reader = rt.spawn(async move {
                let mut stream = NativeAudioStream::new(track, PLAYBACK_SAMPLE_RATE, PLAYBACK_CHANNELS);
                while let Some(frame) = stream.next().await {
                    output.push_samples(&frame.data);
                }
            });
            if let Ok(mut readers) = track_readers.lock() {
                readers.push(reader);
            }
        })));

        debug!("peer connection created for {user_id}");
        Ok(Box::new(RtcTransport {
            pc,
            factory: self.factory.clone(),
            stream_id: self.stream_id.clone(),
            sender: Mutex::new(None),
            readers,
        }))
    }
}

struct RtcTransport {
    pc: PeerConnection,
    factory: Arc<PeerConnectionFactory>,
    stream_id: String,
    sender: Mutex<Option<RtpSender>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RtcTransport {
    fn audio_track(&self, capture: &CaptureHandle) -> Result<MediaStreamTrack, TransportError> {
        let source = capture
            .native_source()
            .ok_or_else(|| TransportError("capture is not backed by a webrtc source".into()))?;
        let track = self
            .factory
            .create_audio_track(&format!("microphone-{}", capture.id()), source);
        Ok(MediaStreamTrack::Audio(track))
    }
}

impl PeerTransport for RtcTransport {
    fn attach_local_audio(&self, capture: &CaptureHandle) -> Result<(), TransportError> {
        let track = self.audio_track(capture)?;
        let sender = self
            .pc
            .add_track(track, &[self.stream_id.as_str()])
            .map_err(|e| TransportError(format!("add track: {e:?}")))?;
        let mut slot = self
            .sender
            .lock()
            .map_err(|_| TransportError("sender lock poisoned".into()))?;
        *slot = Some(sender);
        Ok(())
    }

    fn replace_local_audio(&self, capture: &CaptureHandle) -> Result<TrackSwap, TransportError> {
        let slot = self
            .sender
            .lock()
            .map_err(|_| TransportError("sender lock poisoned".into()))?;
        let Some(sender) = slot.as_ref() else {
            return Ok(TrackSwap::NeedsRenegotiation);
        };
        sender
            .set_track(Some(self.audio_track(capture)?))
            .map_err(|e| TransportError(format!("replace track: {e:?}")))?;
        Ok(TrackSwap::Replaced)
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let options = OfferOptions {
                offer_to_receive_audio: true,
                ..Default::default()
            };
            let offer = self
                .pc
                .create_offer(options)
                .await
                .map_err(|e| TransportError(format!("create offer: {e:?}")))?;
            let sdp = offer.to_string();
            self.pc
                .set_local_description(offer)
                .await
                .map_err(|e| TransportError(format!("set local offer: {e:?}")))?;
            Ok(SessionDescription::offer(sdp))
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            let answer = self
                .pc
                .create_answer(AnswerOptions::default())
                .await
                .map_err(|e| TransportError(format!("create answer: {e:?}")))?;
            let sdp = answer.to_string();
            self.pc
                .set_local_description(answer)
                .await
                .map_err(|e| TransportError(format!("set local answer: {e:?}")))?;
            Ok(SessionDescription::answer(sdp))
        })
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let sdp_type = match description.kind {
                SdpKind::Offer => SdpType::Offer,
                SdpKind::Answer => SdpType::Answer,
            };
            let desc = RtcSessionDescription::parse(&description.sdp, sdp_type)
                .map_err(|e| TransportError(format!("invalid sdp: {e:?}")))?;
            self.pc
                .set_remote_description(desc)
                .await
                .map_err(|e| TransportError(format!("set remote description: {e:?}")))
        })
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let parsed = RtcIceCandidate::parse(
                candidate.sdp_mid.as_deref().unwrap_or_default(),
                i32::from(candidate.sdp_mline_index.unwrap_or(0)),
                &candidate.candidate,
            )
            .map_err(|e| TransportError(format!("invalid candidate: {e:?}")))?;
            self.pc
                .add_ice_candidate(parsed)
                .await
                .map_err(|e| TransportError(format!("add candidate: {e:?}")))
        })
    }

    fn close(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for reader in readers.drain(..) {
                reader.abort();
            }
        }
        self.pc.on_ice_candidate(None);
        self.pc.on_connection_state_change(None);
        self.pc.on_track(None);
        self.pc.close();
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        if self.pc.connection_state() != PeerConnectionState::Closed {
            warn!("peer connection dropped without close");
            self.pc.close();
        }
    }
}

fn map_state(state: PeerConnectionState) -> TransportState {
    match state {
        PeerConnectionState::New => TransportState::New,
        PeerConnectionState::Connecting => TransportState::Connecting,
        PeerConnectionState::Connected => TransportState::Connected,
        PeerConnectionState::Disconnected => TransportState::Disconnected,
        PeerConnectionState::Failed => TransportState::Failed,
        PeerConnectionState::Closed => TransportState::Closed,
    }
}

//! Hooks into the media and SDP collaborators.
//!
//! The signaling core never inspects SDP; it only carries bodies between
//! these traits and the wire.

use bytes::Bytes;

/// Starts and stops the media session of a call.
pub trait MediaSession: Send + Sync {
    fn start(&self, call_id: &str, remote_sdp: &Bytes);
    fn stop(&self, call_id: &str);
}

/// Produces SDP bodies for offers, answers and OPTIONS.
pub trait SdpProvider: Send + Sync {
    fn offer(&self, call_id: &str) -> Bytes;
    fn answer(&self, call_id: &str, offer: &Bytes) -> Bytes;
    fn capabilities(&self) -> Bytes;
}

/// Media stand-in: no session, and an audio-only PCMU description on port 0.
#[derive(Debug, Clone)]
pub struct NullMedia {
    sdp: Bytes,
}

impl NullMedia {
    pub fn new(address: &str) -> Self {
        let sdp = format!(
            "v=0\r\no=- 0 0 IN IP4 {address}\r\ns=-\r\nc=IN IP4 {address}\r\nt=0 0\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n"
        );
        Self {
            sdp: Bytes::from(sdp),
        }
    }
}

impl MediaSession for NullMedia {
    fn start(&self, call_id: &str, _remote_sdp: &Bytes) {
        tracing::debug!(call_id, "media start (no media)");
    }

    fn stop(&self, call_id: &str) {
        tracing::debug!(call_id, "media stop (no media)");
    }
}

impl SdpProvider for NullMedia {
    fn offer(&self, _call_id: &str) -> Bytes {
        self.sdp.clone()
    }

    fn answer(&self, _call_id: &str, _offer: &Bytes) -> Bytes {
        self.sdp.clone()
    }

    fn capabilities(&self) -> Bytes {
        self.sdp.clone()
    }
}

//! Platform seams for media capture and the peer connection.
//!
//! The engine orchestrates the session, but device access and the actual
//! peer/ICE machinery belong to the embedding platform. Implementations
//! deliver remote audio as mono f32 frames on a broadcast channel and carry
//! the JSON data channel as plain strings over mpsc pairs.

use crate::audio::AudioFrame;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};

/// A live microphone capture feeding the peer's local track.
pub struct LocalAudio {
    pub frames: mpsc::Receiver<AudioFrame>,
    pub sample_rate: u32,
}

/// Opens the learner's microphone.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Errors here mean permission denial or a missing capture device and are
    /// fatal to session start.
    async fn open(&self) -> Result<LocalAudio>;
}

/// Builds a peer connection with the local track attached.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, local: LocalAudio) -> Result<Box<dyn PeerHandle>>;
}

/// A live peer connection: SDP negotiation surface, the JSON data channel,
/// and the remote audio tap.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn accept_answer(&self, answer_sdp: &str) -> Result<()>;

    /// Sender half of the outbound data channel.
    fn data_channel(&self) -> mpsc::Sender<String>;

    /// Receiver half of the inbound data channel. Yields `Some` exactly once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<String>>;

    /// Tap handle for decoded remote audio. Consumers subscribe; the
    /// implementation publishes each decoded frame.
    fn remote_audio(&self) -> broadcast::Sender<AudioFrame>;

    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// A silent [`MicrophoneSource`] for headless use; the channel stays open but
/// never yields frames.
pub struct NullMicrophone {
    senders: Mutex<Vec<mpsc::Sender<AudioFrame>>>,
}

impl NullMicrophone {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl Default for NullMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MicrophoneSource for NullMicrophone {
    async fn open(&self) -> Result<LocalAudio> {
        let (tx, rx) = mpsc::channel(8);
        self.senders.lock().await.push(tx);
        Ok(LocalAudio {
            frames: rx,
            sample_rate: crate::audio::TAP_SAMPLE_RATE,
        })
    }
}

/// In-process [`PeerHandle`] for development and integration testing.
///
/// Tests push agent events through [`FakePeer::inbound_tx`], publish remote
/// audio through the broadcast tap, and inspect what the engine sent with
/// [`FakePeer::drain_sent`].
pub struct FakePeer {
    open: AtomicBool,
    outbound_tx: mpsc::Sender<String>,
    sent_rx: Mutex<mpsc::Receiver<String>>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    pub inbound_tx: mpsc::Sender<String>,
    audio: broadcast::Sender<AudioFrame>,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        let (outbound_tx, sent_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (audio, _) = broadcast::channel(64);
        Arc::new(Self {
            open: AtomicBool::new(true),
            outbound_tx,
            sent_rx: Mutex::new(sent_rx),
            inbound: Mutex::new(Some(inbound_rx)),
            inbound_tx,
            audio,
        })
    }

    /// Everything the engine has sent over the data channel so far.
    pub async fn drain_sent(&self) -> Vec<String> {
        let mut rx = self.sent_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n".to_string())
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<()> {
        anyhow::ensure!(!answer_sdp.is_empty(), "empty answer SDP");
        Ok(())
    }

    fn data_channel(&self) -> mpsc::Sender<String> {
        self.outbound_tx.clone()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.inbound.try_lock().ok()?.take()
    }

    fn remote_audio(&self) -> broadcast::Sender<AudioFrame> {
        self.audio.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// [`PeerConnector`] handing out a pre-built [`FakePeer`].
pub struct FakeConnector {
    peer: Arc<FakePeer>,
}

impl FakeConnector {
    pub fn new(peer: Arc<FakePeer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, _local: LocalAudio) -> Result<Box<dyn PeerHandle>> {
        Ok(Box::new(SharedPeer(self.peer.clone())))
    }
}

/// Wrapper so a single [`FakePeer`] can be both handed to the engine and
/// kept by the test for inspection.
struct SharedPeer(Arc<FakePeer>);

#[async_trait]
impl PeerHandle for SharedPeer {
    async fn create_offer(&self) -> Result<String> {
        self.0.create_offer().await
    }
    async fn accept_answer(&self, answer_sdp: &str) -> Result<()> {
        self.0.accept_answer(answer_sdp).await
    }
    fn data_channel(&self) -> mpsc::Sender<String> {
        self.0.data_channel()
    }
    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.0.take_inbound()
    }
    fn remote_audio(&self) -> broadcast::Sender<AudioFrame> {
        self.0.remote_audio()
    }
    fn is_open(&self) -> bool {
        self.0.is_open()
    }
    async fn close(&self) {
        self.0.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_microphone_opens() {
        let mic = NullMicrophone::new();
        let local = mic.open().await.unwrap();
        assert_eq!(local.sample_rate, crate::audio::TAP_SAMPLE_RATE);
    }

    #[tokio::test]
    async fn fake_peer_carries_data_both_ways() {
        let peer = FakePeer::new();
        peer.data_channel().send("out".to_string()).await.unwrap();
        assert_eq!(peer.drain_sent().await, vec!["out".to_string()]);

        let mut inbound = peer.take_inbound().unwrap();
        peer.inbound_tx.send("in".to_string()).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "in");
        // A second take yields nothing.
        assert!(peer.take_inbound().is_none());
    }

    #[tokio::test]
    async fn fake_peer_close_flips_open() {
        let peer = FakePeer::new();
        assert!(peer.is_open());
        peer.close().await;
        assert!(!peer.is_open());
    }
}

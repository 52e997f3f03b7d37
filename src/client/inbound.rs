//! Receive path: relayed datagrams and stream records become events and audio

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::client::presence::PresenceTracker;
use crate::client::session::MediaState;
use crate::client::ClientEvent;
use crate::config::RelayFraming;
use crate::error::Result;
use crate::media::{AudioBlock, FrameReassembler, SharedJitterBuffer};
use crate::protocol::{classify, ControlMessage, Datagram, RelayPrefix};

/// Shared receive-side state, cloned into each reader task
#[derive(Clone)]
pub struct Inbound {
    state: Arc<MediaState>,
    jitter: SharedJitterBuffer,
    presence: Arc<PresenceTracker>,
    events: Sender<ClientEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl Inbound {
    pub fn new(
        state: Arc<MediaState>,
        jitter: SharedJitterBuffer,
        presence: Arc<PresenceTracker>,
        events: Sender<ClientEvent>,
    ) -> Self {
        Self {
            state,
            jitter,
            presence,
            events,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Events discarded because the consumer fell behind
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Event queue full, dropping event from {}", event.user());
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn observe(&self, user: &str, now: Instant) {
        if self.presence.observe(user, now) {
            self.emit(ClientEvent::Joined { user: user.to_string() });
        }
    }

    /// Handle one relayed datagram
    pub fn handle_datagram(&self, data: Bytes, reassembler: &mut FrameReassembler, now: Instant) {
        match classify(data) {
            Ok(Datagram::Fragment(fragment)) => {
                self.observe(&fragment.sender_id, now);
                if let Some(frame) = reassembler.push_at(fragment, now) {
                    self.emit(ClientEvent::Video {
                        user: frame.sender_id,
                        frame: frame.payload,
                        mute: frame.flags.is_mute(),
                        deaf: frame.flags.is_deaf(),
                    });
                }
            }
            Ok(Datagram::Control(message)) => self.handle_message(message, now),
            Err(e) => tracing::debug!("Dropping malformed datagram: {}", e),
        }
    }

    /// Handle one record read from a reliable stream
    pub fn handle_record(&self, record: Bytes, framing: RelayFraming, now: Instant) -> Result<()> {
        let inner = match framing {
            RelayFraming::Prefixed => RelayPrefix::split(record)?.1,
            RelayFraming::Verbatim => record,
        };
        let message = ControlMessage::decode(&inner)?;
        self.handle_message(message, now);
        Ok(())
    }

    pub fn handle_message(&self, message: ControlMessage, now: Instant) {
        self.observe(message.user(), now);

        match message {
            // Presence is all a hello carries
            ControlMessage::Hello { .. } => {}
            ControlMessage::Offcam { user, mute, deaf } => {
                self.emit(ClientEvent::CameraOff { user, mute, deaf });
            }
            ControlMessage::Audio { user, samples } => {
                if self.state.is_deaf() {
                    return;
                }
                if !self.jitter.push(AudioBlock::new(user, samples)) {
                    tracing::trace!("Jitter buffer full, evicted oldest block");
                }
            }
            ControlMessage::Chat { user, text } => {
                self.emit(ClientEvent::Chat { user, text });
            }
            ControlMessage::Video {
                user,
                mute,
                deaf,
                frame,
            } => {
                self.emit(ClientEvent::Video {
                    user,
                    frame: Bytes::from(frame),
                    mute,
                    deaf,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::create_shared_jitter;
    use crate::protocol::{FrameFragmenter, MediaFlags};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    fn inbound(capacity: usize) -> (Inbound, Receiver<ClientEvent>, Arc<MediaState>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let state = Arc::new(MediaState::default());
        let inbound = Inbound::new(
            state.clone(),
            create_shared_jitter(5),
            Arc::new(PresenceTracker::new(Duration::from_secs(5))),
            tx,
        );
        (inbound, rx, state)
    }

    #[test]
    fn test_hello_announces_join_once() {
        let (inbound, rx, _) = inbound(8);
        let now = Instant::now();
        inbound.handle_message(ControlMessage::Hello { user: "ana".into() }, now);
        inbound.handle_message(ControlMessage::Hello { user: "ana".into() }, now);

        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Joined { user: "ana".into() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fragments_become_video_event() {
        let (inbound, rx, _) = inbound(8);
        let mut reassembler = FrameReassembler::new();
        let fragmenter = FrameFragmenter::new("ana", 1000).unwrap();
        let frame = Bytes::from(vec![9u8; 2500]);
        let now = Instant::now();

        for datagram in fragmenter.fragment_datagrams(&frame, MediaFlags::new(true, false)).unwrap() {
            inbound.handle_datagram(datagram, &mut reassembler, now);
        }

        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Joined { user: "ana".into() });
        match rx.try_recv().unwrap() {
            ClientEvent::Video { user, frame: got, mute, deaf } => {
                assert_eq!(user, "ana");
                assert_eq!(got, frame);
                assert!(mute);
                assert!(!deaf);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_audio_skipped_while_deaf() {
        let (inbound, _rx, state) = inbound(8);
        let now = Instant::now();
        let audio = || ControlMessage::Audio {
            user: "ben".into(),
            samples: vec![0, 1, 2, 3],
        };

        inbound.handle_message(audio(), now);
        assert_eq!(inbound.jitter.len(), 1);

        state.set_deaf(true);
        inbound.handle_message(audio(), now);
        assert_eq!(inbound.jitter.len(), 1);
    }

    #[test]
    fn test_prefixed_chat_record() {
        let (inbound, rx, _) = inbound(8);
        let inner = ControlMessage::Chat {
            user: "ana".into(),
            text: "hi".into(),
        }
        .encode()
        .unwrap();
        let record = RelayPrefix::wrap("3f2a", &inner).unwrap();

        inbound
            .handle_record(record, RelayFraming::Prefixed, Instant::now())
            .unwrap();
        rx.try_recv().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Chat {
                user: "ana".into(),
                text: "hi".into()
            }
        );
    }

    #[test]
    fn test_full_event_queue_drops() {
        let (inbound, _rx, _) = inbound(1);
        let now = Instant::now();
        inbound.handle_message(
            ControlMessage::Offcam {
                user: "ana".into(),
                mute: false,
                deaf: false,
            },
            now,
        );
        assert_eq!(inbound.dropped_events(), 1);
    }

    #[test]
    fn test_malformed_datagram_ignored() {
        let (inbound, rx, _) = inbound(8);
        let mut reassembler = FrameReassembler::new();
        inbound.handle_datagram(Bytes::from_static(&[0xFF, 0, 0]), &mut reassembler, Instant::now());
        assert!(rx.try_recv().is_err());
    }
}

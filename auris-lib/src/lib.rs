//! # Auris engine core
//!
//! The playback core of the auris audio player: a gapless pipeline of
//! decoder streams feeding an output sink, driven by a dedicated thread
//! with its own event loop. Embedders provide a [`sink::Sink`] and
//! [`decoder::DecoderStream`] implementations and receive position, track,
//! and sink-state callbacks through [`player::PlayerEvents`].

pub mod audio;
pub mod channel;
pub mod decoder;
pub mod delegate;
pub mod event_loop;
pub mod player;
pub mod sink;
pub mod worker;

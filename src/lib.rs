//! Render worker for layered meditation audio tracks.
//!
//! A worker claims jobs from a shared [`job::JobStore`], renders voice
//! narration, binaural beats, solfeggio tones and background ambience into
//! one loudness-normalized stereo file, uploads it and reports the outcome.

pub mod audio;
pub mod cache;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod server;
pub mod storage;
pub mod tts;
pub mod ui;
pub mod workspace;

//! # Call engine library for the voxbridge project
//!
//! `call-engine` sits on top of the other voxbridge crates and owns whole
//! calls:
//!
//! - **Call controller**: per-call wiring of RTP transport, audio pipeline,
//!   VAD, speech session and TTS pacer, plus lifecycle and teardown
//! - **Engine**: the process-wide call registry driven by switch events and
//!   SIP requests, with graceful shutdown
//! - **Configuration**: the grouped knobs of the connector, loaded from a
//!   JSON file with environment overrides
//! - **DTMF**: timed tone sequences injected into a call's outbound audio
//! - **Scenarios**: the step interpreter for scripted IVR test runs

pub mod adapters;
pub mod call;
pub mod config;
pub mod dtmf;
pub mod engine;
pub mod error;
pub mod scenario;

pub use call::CallHandle;
pub use config::EngineConfig;
pub use dtmf::{DtmfSequence, DtmfTiming};
pub use engine::CallEngine;
pub use error::{Error, Result};
pub use scenario::{
    ExecutionResult, ExecutionStatus, InMemoryScenarioStore, Scenario, ScenarioExecutor,
    ScenarioPort, ScenarioStore, Step, StepAction, StepResult, StepStatus,
};

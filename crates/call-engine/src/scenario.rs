//! IVR test scenarios
//!
//! A scenario is an ordered list of steps driving an external IVR through a
//! live call: speak a prompt, listen for a transcript, send DTMF, validate
//! an intent. The executor interprets steps against a [`ScenarioPort`]
//! (implemented by [`crate::CallHandle`] for real calls and by doubles in
//! tests), collects a [`StepResult`] per step and an aggregate
//! [`ExecutionResult`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use voxbridge_audio_core::dtmf::validate_digits;

use crate::dtmf::DtmfTiming;
use crate::error::{Error, Result};

/// Default per-step timeout when a step does not carry one
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// What a step does
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepAction {
    /// Speak a prompt to the IVR
    TtsPrompt {
        /// Text to synthesize
        text: String,
        /// Block until playback finishes before the next step
        #[serde(default)]
        wait_for_response: bool,
    },
    /// Listen for a transcribed reply
    AsrListen {
        /// How long to wait for a final transcript
        max_duration_ms: u64,
        /// Expected intent of the reply, when the deployment classifies
        #[serde(default)]
        expected_intent: Option<String>,
    },
    /// Send a DTMF dial string
    DtmfSend {
        /// Digits to send (0-9 * # A-D)
        sequence: String,
    },
    /// Validate the intent of the most recent transcript
    IntentValidate {
        /// Intent the reply must classify as
        expected_intent: String,
    },
}

impl StepAction {
    /// Stable name used in results
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::TtsPrompt { .. } => "tts_prompt",
            StepAction::AsrListen { .. } => "asr_listen",
            StepAction::DtmfSend { .. } => "dtmf_send",
            StepAction::IntentValidate { .. } => "intent_validate",
        }
    }
}

/// Where a conditional step routes execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Branch {
    /// Jump to a step number
    Goto(u32),
    /// Keyword branch: `"continue"` or `"abort"`
    Keyword(BranchKeyword),
}

/// The keyword branches
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchKeyword {
    /// Proceed with the next step
    Continue,
    /// Stop the scenario
    Abort,
}

/// Conditional routing attached to a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conditional {
    /// Human-readable description of the branch condition
    pub condition: String,
    /// Branch taken when the step succeeds
    pub if_true: Branch,
    /// Branch taken when the step fails or times out
    pub if_false: Branch,
}

/// One scenario step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Position in the scenario, 1-based and contiguous
    pub step_number: u32,
    /// The action to perform
    #[serde(flatten)]
    pub action: StepAction,
    /// Per-step timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Optional conditional routing
    #[serde(default)]
    pub conditional: Option<Conditional>,
}

/// A complete test scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Ordered steps
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Validate the scenario before execution: contiguous numbering, legal
    /// dial strings, resolvable branch targets.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::ScenarioValidation("scenario has no steps".into()));
        }
        let numbers: HashSet<u32> = self.steps.iter().map(|s| s.step_number).collect();
        for (i, step) in self.steps.iter().enumerate() {
            let expected = i as u32 + 1;
            if step.step_number != expected {
                return Err(Error::ScenarioValidation(format!(
                    "step numbers must be contiguous: position {} holds step {}",
                    expected, step.step_number
                )));
            }
            match &step.action {
                StepAction::DtmfSend { sequence } => {
                    validate_digits(sequence).map_err(|e| {
                        Error::ScenarioValidation(format!("step {}: {e}", step.step_number))
                    })?;
                }
                StepAction::AsrListen { max_duration_ms, .. } => {
                    if *max_duration_ms == 0 {
                        return Err(Error::ScenarioValidation(format!(
                            "step {}: asr_listen needs a non-zero max_duration_ms",
                            step.step_number
                        )));
                    }
                }
                StepAction::TtsPrompt { text, .. } => {
                    if text.trim().is_empty() {
                        return Err(Error::ScenarioValidation(format!(
                            "step {}: tts_prompt text is empty",
                            step.step_number
                        )));
                    }
                }
                StepAction::IntentValidate { expected_intent } => {
                    if expected_intent.trim().is_empty() {
                        return Err(Error::ScenarioValidation(format!(
                            "step {}: intent_validate needs an expected_intent",
                            step.step_number
                        )));
                    }
                }
            }
            if let Some(conditional) = &step.conditional {
                for branch in [conditional.if_true, conditional.if_false] {
                    if let Branch::Goto(target) = branch {
                        if !numbers.contains(&target) {
                            return Err(Error::ScenarioValidation(format!(
                                "step {}: branch targets unknown step {}",
                                step.step_number, target
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The step did what it should
    Success,
    /// The step ran but its check failed
    Failed,
    /// The step's window elapsed
    Timeout,
    /// The step errored before completing
    Error,
    /// The step never ran (scenario aborted or branched past it)
    Skipped,
}

/// The record emitted for every executed step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// Step position
    pub step_number: u32,
    /// Step kind (`tts_prompt`, `asr_listen`, ...)
    pub step_type: String,
    /// Outcome
    pub status: StepStatus,
    /// Wall-clock duration of the step
    pub duration_ms: u64,
    /// Error or mismatch detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transcript captured by `asr_listen`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Intent classified for validation steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl StepResult {
    fn new(step: &Step, status: StepStatus, started: Instant) -> Self {
        Self {
            step_number: step.step_number,
            step_type: step.action.kind().to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            transcript: None,
            intent: None,
        }
    }
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Every executed step succeeded
    Pass,
    /// At least one step failed or timed out
    Fail,
    /// The run aborted on an internal error
    Error,
    /// The run was cancelled mid-flight
    Cancelled,
}

/// The record of one scenario run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Unique id of this run
    pub execution_id: String,
    /// Scenario that ran
    pub scenario_id: String,
    /// Aggregate status
    pub status: ExecutionStatus,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Total wall-clock duration
    pub duration_ms: u64,
    /// Per-step records, in execution order
    pub steps: Vec<StepResult>,
}

/// Where scenarios come from.
///
/// Persistence itself is outside the connector; the executor only loads by
/// id and emits results.
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    /// Fetch a scenario by id
    async fn load(&self, id: &str) -> Result<Option<Scenario>>;
}

/// An in-process store, used by tests and one-shot runs
#[derive(Debug, Default)]
pub struct InMemoryScenarioStore {
    scenarios: parking_lot::RwLock<std::collections::HashMap<String, Scenario>>,
}

impl InMemoryScenarioStore {
    /// Insert or replace a scenario (validated first)
    pub fn put(&self, scenario: Scenario) -> Result<()> {
        scenario.validate()?;
        self.scenarios.write().insert(scenario.id.clone(), scenario);
        Ok(())
    }
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn load(&self, id: &str) -> Result<Option<Scenario>> {
        Ok(self.scenarios.read().get(id).cloned())
    }
}

/// The surface a scenario drives on a live call
#[async_trait]
pub trait ScenarioPort: Send + Sync {
    /// Speak a prompt, optionally waiting for playback to finish
    async fn play_prompt(&self, text: &str, wait_for_playback: bool) -> Result<()>;

    /// Wait for the next final transcript within `max_wait`
    async fn listen_for_final(&self, max_wait: Duration) -> Result<Option<String>>;

    /// Send a DTMF dial string and wait for it to play out
    async fn send_dtmf(&self, sequence: &str, timing: &DtmfTiming) -> Result<()>;

    /// Classify the intent of a transcript, when supported
    async fn classify_intent(&self, text: &str) -> Result<Option<String>>;
}

/// Runs scenarios against a [`ScenarioPort`]
pub struct ScenarioExecutor {
    dtmf_timing: DtmfTiming,
}

impl Default for ScenarioExecutor {
    fn default() -> Self {
        Self { dtmf_timing: DtmfTiming::STANDARD }
    }
}

impl ScenarioExecutor {
    /// Executor with a specific DTMF timing preset
    pub fn with_timing(dtmf_timing: DtmfTiming) -> Self {
        Self { dtmf_timing }
    }

    /// Run a scenario to completion (or cancellation).
    ///
    /// After `cancel` flips to true no further [`StepResult`] is produced.
    pub async fn execute(
        &self,
        scenario: &Scenario,
        port: &dyn ScenarioPort,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionResult> {
        scenario.validate()?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let run_started = Instant::now();
        let mut steps = Vec::new();
        let mut status = ExecutionStatus::Pass;
        let mut last_transcript: Option<String> = None;

        info!(scenario_id = %scenario.id, execution_id = %execution_id, "scenario starting");

        let mut index = 0usize;
        while index < scenario.steps.len() {
            if *cancel.borrow() {
                status = ExecutionStatus::Cancelled;
                break;
            }

            let step = &scenario.steps[index];
            let step_started = Instant::now();
            let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS));

            let outcome = tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        status = ExecutionStatus::Cancelled;
                        break;
                    }
                    continue;
                }
                outcome = tokio::time::timeout(
                    timeout,
                    self.run_step(step, port, &mut last_transcript),
                ) => outcome,
            };

            let mut result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    let mut r = StepResult::new(step, StepStatus::Timeout, step_started);
                    r.error = Some("step execution timed out".into());
                    r
                }
            };
            result.duration_ms = step_started.elapsed().as_millis() as u64;

            let succeeded = result.status == StepStatus::Success;
            info!(
                step = step.step_number,
                step_type = %result.step_type,
                status = ?result.status,
                duration_ms = result.duration_ms,
                "step finished"
            );
            steps.push(result);

            let timed_out_listen = matches!(step.action, StepAction::AsrListen { .. })
                && steps.last().map(|r| r.status) == Some(StepStatus::Timeout);

            match (&step.conditional, succeeded) {
                (Some(conditional), _) => {
                    let branch = if succeeded { conditional.if_true } else { conditional.if_false };
                    match branch {
                        Branch::Keyword(BranchKeyword::Continue) => index += 1,
                        Branch::Keyword(BranchKeyword::Abort) => {
                            if !succeeded {
                                status = ExecutionStatus::Fail;
                            }
                            break;
                        }
                        Branch::Goto(target) => index = (target - 1) as usize,
                    }
                }
                (None, true) => index += 1,
                // A listen that simply heard nothing records its TIMEOUT and
                // moves on; every other unconditional failure aborts.
                (None, false) if timed_out_listen => index += 1,
                (None, false) => {
                    status = ExecutionStatus::Fail;
                    break;
                }
            }
        }

        if status == ExecutionStatus::Pass
            && steps.iter().any(|s| s.status != StepStatus::Success)
        {
            status = ExecutionStatus::Fail;
        }

        let result = ExecutionResult {
            execution_id,
            scenario_id: scenario.id.clone(),
            status,
            started_at,
            duration_ms: run_started.elapsed().as_millis() as u64,
            steps,
        };
        info!(scenario_id = %scenario.id, status = ?result.status, steps = result.steps.len(), "scenario finished");
        Ok(result)
    }

    async fn run_step(
        &self,
        step: &Step,
        port: &dyn ScenarioPort,
        last_transcript: &mut Option<String>,
    ) -> StepResult {
        let started = Instant::now();
        match &step.action {
            StepAction::TtsPrompt { text, wait_for_response } => {
                match port.play_prompt(text, *wait_for_response).await {
                    Ok(()) => StepResult::new(step, StepStatus::Success, started),
                    Err(e) => {
                        let mut r = StepResult::new(step, StepStatus::Error, started);
                        r.error = Some(e.to_string());
                        r
                    }
                }
            }
            StepAction::AsrListen { max_duration_ms, expected_intent } => {
                match port.listen_for_final(Duration::from_millis(*max_duration_ms)).await {
                    Ok(Some(text)) => {
                        *last_transcript = Some(text.clone());
                        let mut r = StepResult::new(step, StepStatus::Success, started);
                        if let Some(expected) = expected_intent {
                            match port.classify_intent(&text).await {
                                Ok(Some(intent)) if intent == *expected => {
                                    r.intent = Some(intent);
                                }
                                Ok(intent) => {
                                    r.status = StepStatus::Failed;
                                    r.intent = intent.clone();
                                    r.error = Some(format!(
                                        "expected intent {expected:?}, classified {intent:?}"
                                    ));
                                }
                                Err(e) => {
                                    r.status = StepStatus::Error;
                                    r.error = Some(e.to_string());
                                }
                            }
                        }
                        r.transcript = Some(text);
                        r
                    }
                    Ok(None) => {
                        let mut r = StepResult::new(step, StepStatus::Timeout, started);
                        r.error = Some("no final transcript within the listen window".into());
                        r
                    }
                    Err(e) => {
                        let mut r = StepResult::new(step, StepStatus::Error, started);
                        r.error = Some(e.to_string());
                        r
                    }
                }
            }
            StepAction::DtmfSend { sequence } => {
                match port.send_dtmf(sequence, &self.dtmf_timing).await {
                    Ok(()) => StepResult::new(step, StepStatus::Success, started),
                    Err(e) => {
                        let mut r = StepResult::new(step, StepStatus::Error, started);
                        r.error = Some(e.to_string());
                        r
                    }
                }
            }
            StepAction::IntentValidate { expected_intent } => {
                let Some(text) = last_transcript.clone() else {
                    let mut r = StepResult::new(step, StepStatus::Failed, started);
                    r.error = Some("no transcript captured before intent_validate".into());
                    return r;
                };
                match port.classify_intent(&text).await {
                    Ok(Some(intent)) if intent == *expected_intent => {
                        let mut r = StepResult::new(step, StepStatus::Success, started);
                        r.intent = Some(intent);
                        r.transcript = Some(text);
                        r
                    }
                    Ok(intent) => {
                        warn!(expected = %expected_intent, classified = ?intent, "intent mismatch");
                        let mut r = StepResult::new(step, StepStatus::Failed, started);
                        r.intent = intent;
                        r.transcript = Some(text);
                        r.error = Some(format!("expected intent {expected_intent:?}"));
                        r
                    }
                    Err(e) => {
                        let mut r = StepResult::new(step, StepStatus::Error, started);
                        r.error = Some(e.to_string());
                        r
                    }
                }
            }
        }
    }
}

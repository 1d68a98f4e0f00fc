//! Sequential instruction runner for one execution context.
//!
//! The [`Executor`] owns an ordered instruction list and its results. A run
//! stops early on three occasions: the [`RunControl`] was paused or stopped
//! (checked between instructions only), or a `navigate` instruction
//! succeeded, since the document it ran against is gone.

use crate::catalog;
use crate::context::ExecutionContext;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::Instruction;
use tabrelay_common::result::{ExecutionResult, ExecutionStats};
use tokio::time::Instant;
use tracing::{error, info};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const PAUSED: u8 = 2;
const STOPPED: u8 = 3;

/// Shared run flag; clones observe and steer the same executor.
#[derive(Debug, Clone)]
pub struct RunControl {
    state: Arc<AtomicU8>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(IDLE)),
        }
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Halt at the next instruction boundary, keeping the position.
    pub fn pause(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, PAUSED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Halt at the next instruction boundary and rewind to the start.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    fn start(&self) {
        self.state.store(RUNNING, Ordering::SeqCst);
    }

    fn finish(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn take_stop(&self) -> bool {
        self.state
            .compare_exchange(STOPPED, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

pub struct Executor {
    context: ExecutionContext,
    instructions: Vec<Instruction>,
    results: Vec<ExecutionResult>,
    control: RunControl,
    current_index: usize,
    halted_on_navigation: bool,
}

impl Executor {
    pub fn new(context: ExecutionContext) -> Self {
        Self::with_instructions(context, Vec::new())
    }

    pub fn with_instructions(context: ExecutionContext, instructions: Vec<Instruction>) -> Self {
        Self {
            context,
            instructions,
            results: Vec::new(),
            control: RunControl::new(),
            current_index: 0,
            halted_on_navigation: false,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// A handle other tasks can use to pause or stop a running batch.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ExecutionResult> {
        self.results
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// True when the last run ended because a navigation succeeded.
    pub fn halted_on_navigation(&self) -> bool {
        self.halted_on_navigation
    }

    /// Replace the instruction list and forget previous results.
    pub fn load(&mut self, instructions: Vec<Instruction>) {
        self.instructions = instructions;
        self.results.clear();
        self.current_index = 0;
        self.halted_on_navigation = false;
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Run every instruction from the top.
    pub async fn execute_all(&mut self) -> &[ExecutionResult] {
        self.results.clear();
        self.current_index = 0;
        self.control.start();
        self.run().await;
        &self.results
    }

    /// Continue a paused run from where it halted.
    pub async fn resume(&mut self) -> &[ExecutionResult] {
        self.control.start();
        self.run().await;
        &self.results
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn stop(&mut self) {
        self.control.stop();
        self.control.take_stop();
        self.current_index = 0;
    }

    async fn run(&mut self) {
        self.halted_on_navigation = false;
        info!(
            "Executing {} instructions from index {}",
            self.instructions.len().saturating_sub(self.current_index),
            self.current_index
        );

        while self.current_index < self.instructions.len() {
            if self.control.take_stop() {
                info!("Run stopped at index {}", self.current_index);
                self.current_index = 0;
                return;
            }
            if !self.control.is_running() {
                info!("Run paused at index {}", self.current_index);
                return;
            }

            let instruction = &self.instructions[self.current_index];
            let result = run_guarded(instruction, &self.context).await;
            let navigated = result.success && instruction.kind.is_navigate();
            self.results.push(result);
            self.current_index += 1;

            if navigated {
                info!("Navigation succeeded, ending run");
                self.halted_on_navigation = true;
                break;
            }
        }

        self.control.finish();
    }

    /// Run the instruction at `index` out of band, overwriting its result
    /// slot (or appending when the slot does not exist yet).
    pub async fn execute_instruction(&mut self, index: usize) -> Option<&ExecutionResult> {
        let instruction = self.instructions.get(index)?;
        let result = run_guarded(instruction, &self.context).await;

        if index < self.results.len() {
            self.results[index] = result;
            self.results.get(index)
        } else {
            self.results.push(result);
            self.results.last()
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats::from_results(&self.results)
    }
}

/// Execute one instruction, turning a panic inside it into a failure.
pub async fn run_guarded(instruction: &Instruction, ctx: &ExecutionContext) -> ExecutionResult {
    let started = Instant::now();
    match AssertUnwindSafe(catalog::execute(instruction, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Instruction '{}' panicked: {}", instruction.id, message);
            ExecutionResult::failure(
                instruction.id.as_str(),
                started.elapsed(),
                InstructionError::Panicked(message).to_string(),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

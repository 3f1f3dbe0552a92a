//! Trial scheduler run loop
//!
//! Drives the sequencer through pretrial, block, intertrial and posttrial,
//! issuing arena commands and plugin actions for each phase. Every path out
//! of a started run goes through cleanup and leaves `run.log`,
//! `trial_order.toml` and `summary.txt` behind.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use arena_core::config::{
    ActionSpec, BlockConfig, DisplaySpec, FrameSpec, ParamMap, ProtocolDescription, ProtocolError,
};
use arena_core::scheduler::{
    build_trial_order, RunSummary, Sequencer, TrialOrder, TrialRecord, TrialStatus,
};
use arena_core::state::{FailureKind, State};
use arena_core::traits::{
    ActionInvoker, ActionOutcome, ArenaControl, ArenaError, CancelToken, Clock,
};
use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::artifacts::RunDirectory;
use crate::error::RunError;
use crate::runlog::RunLog;

/// Per-run scheduler settings
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Seed overriding the protocol's
    pub seed: Option<u64>,
    /// Recorded trial order to present verbatim
    pub replay: Option<TrialOrder>,
    /// Drain stale responses when the link opens
    pub flush_responses: bool,
}

/// What a finished run produced
#[derive(Debug)]
pub struct RunReport {
    pub directory: RunDirectory,
    pub order: TrialOrder,
    pub summary: RunSummary,
}

/// State owned by one run
struct RunContext {
    sequencer: Sequencer,
    summary: RunSummary,
    log: RunLog,
    default_gs: u8,
    current_trial: Option<usize>,
}

/// Validation bounds every duration; anything past `Duration` saturates
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn format_params(params: &ParamMap) -> String {
    let mut out = String::new();
    for (key, value) in params {
        let _ = write!(out, " {}={}", key, value);
    }
    out
}

fn status_text(status: &TrialStatus) -> String {
    match status {
        TrialStatus::Completed => "completed".to_string(),
        TrialStatus::Dispatched => "dispatched".to_string(),
        TrialStatus::Rejected => "rejected".to_string(),
        TrialStatus::Failed(reason) => format!("failed: {}", reason),
    }
}

/// Executes protocols against one arena
pub struct TrialScheduler<A, P, C> {
    arena: A,
    plugins: P,
    clock: C,
    cancel: CancelToken,
    options: SchedulerOptions,
}

impl<A, P, C> TrialScheduler<A, P, C>
where
    A: ArenaControl,
    P: ActionInvoker,
    C: Clock,
{
    pub fn new(arena: A, plugins: P, clock: C, options: SchedulerOptions) -> Self {
        Self {
            arena,
            plugins,
            clock,
            cancel: CancelToken::new(),
            options,
        }
    }

    /// Token that aborts the run from another thread
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn arena(&self) -> &A {
        &self.arena
    }

    pub fn plugins(&self) -> &P {
        &self.plugins
    }

    pub fn into_parts(self) -> (A, P, C) {
        (self.arena, self.plugins, self.clock)
    }

    /// Validate a protocol and resolve its trial order, without any I/O
    pub fn prepare(&self, protocol: &ProtocolDescription) -> Result<TrialOrder, RunError> {
        protocol.validate()?;
        for name in protocol.plugin_actions() {
            if !self.plugins.supports(name) {
                return Err(ProtocolError::UnknownAction(name.to_string()).into());
            }
        }
        let block = protocol.block()?;
        if let Some(seed) = self.options.seed {
            if seed > i64::MAX as u64 {
                return Err(ProtocolError::SeedOutOfRange(seed).into());
            }
        }

        match &self.options.replay {
            Some(order) => {
                order.check_against(block)?;
                info!("Replaying recorded trial order ({} trials)", order.len());
                Ok(order.clone())
            }
            None => Ok(build_trial_order(block, self.options.seed)),
        }
    }

    /// Run a protocol to completion or failure
    ///
    /// Artifacts are written under a fresh directory in `output_dir` even
    /// when the run fails; the error is returned after cleanup.
    pub fn run(
        &mut self,
        protocol: &ProtocolDescription,
        output_dir: &Path,
    ) -> Result<RunReport, RunError> {
        let order = self.prepare(protocol)?;

        let started_at = Local::now();
        let directory = RunDirectory::create(output_dir, &protocol.name, started_at)?;
        let log_path = directory.log_path();
        let log = RunLog::create(&log_path).map_err(|e| RunError::artifact(&log_path, e))?;
        info!(
            "Starting `{}`: {} trials, run directory {}",
            protocol.name,
            order.len(),
            directory.path().display()
        );

        let mut ctx = RunContext {
            sequencer: Sequencer::new(order.clone(), protocol.intertrial.after_last),
            summary: RunSummary::new(&protocol.name, &order),
            log,
            default_gs: protocol.default_gs_level(),
            current_trial: None,
        };
        ctx.log.start(format_args!(
            "name={} trials={} randomize={:?} seed={}",
            protocol.name,
            order.len(),
            order.randomize,
            order.seed.map_or_else(|| "none".to_string(), |s| s.to_string())
        ));
        if self.options.replay.is_some() {
            ctx.log.note("trial order replayed from an earlier run");
        }

        let origin = self.clock.elapsed();
        let result = self.execute(protocol, &mut ctx);
        let failure = match &result {
            Ok(()) => {
                self.arena.close();
                None
            }
            Err(err) => {
                self.cleanup(&mut ctx, err);
                Some(err.to_string())
            }
        };
        let elapsed = self.clock.elapsed().saturating_sub(origin);
        ctx.summary.finish(ctx.sequencer.state(), elapsed, failure);

        let written = directory
            .write_trial_order(&order)
            .and_then(|_| directory.write_summary(&ctx.summary, started_at, Local::now()));

        match (result, written) {
            (Ok(()), Ok(_)) => {
                ctx.log.complete();
                info!(
                    "Run complete: {}/{} trials presented",
                    ctx.summary.completed + ctx.summary.dispatched,
                    ctx.summary.planned
                );
                Ok(RunReport {
                    directory,
                    order,
                    summary: ctx.summary,
                })
            }
            (Ok(()), Err(err)) => {
                error!("Run artifacts incomplete: {}", err);
                ctx.log.failed(&err);
                Err(err)
            }
            (Err(err), written) => {
                if let Err(artifact_err) = written {
                    error!("Run artifacts incomplete: {}", artifact_err);
                    ctx.log.error(&artifact_err);
                }
                ctx.log.failed(&err);
                Err(err)
            }
        }
    }

    fn execute(
        &mut self,
        protocol: &ProtocolDescription,
        ctx: &mut RunContext,
    ) -> Result<(), RunError> {
        ctx.sequencer.start();
        ctx.log.command("open");
        self.arena
            .open(self.options.flush_responses)
            .map_err(|source| RunError::Arena {
                trial: None,
                command: "open",
                source,
            })?;
        ctx.log.response("open ok");

        if let Some(bits) = protocol.arena.color_depth {
            self.run_action(ctx, "arena", &ActionSpec::SetColorDepth { bits })?;
        }

        self.run_phase(
            ctx,
            "pretrial",
            &protocol.pretrial.actions,
            protocol.pretrial.duration_s,
        )?;
        ctx.sequencer.finish_pretrial();

        let block = protocol.block()?;
        loop {
            match ctx.sequencer.state() {
                State::Block => {
                    let Some(trial) = ctx.sequencer.next_trial().cloned() else {
                        break;
                    };
                    let status = self.run_trial(ctx, block, &trial)?;
                    ctx.sequencer.record_trial(status);
                    if let Some(outcome) = ctx.sequencer.outcomes().last() {
                        ctx.summary.record_trial(outcome);
                    }
                }
                State::Intertrial => {
                    self.run_phase(
                        ctx,
                        "intertrial",
                        &protocol.intertrial.actions,
                        protocol.intertrial.duration_s,
                    )?;
                    ctx.sequencer.finish_intertrial();
                }
                _ => break,
            }
        }
        ctx.current_trial = None;

        self.run_phase(
            ctx,
            "posttrial",
            &protocol.posttrial.actions,
            protocol.posttrial.duration_s,
        )?;
        ctx.sequencer.finish_posttrial();
        Ok(())
    }

    fn wait(&self, duration: Duration, phase: &'static str) -> Result<(), RunError> {
        if duration.is_zero() {
            return self.cancel.check().map_err(|_| RunError::Cancelled { phase });
        }
        self.clock
            .wait(duration, &self.cancel)
            .map_err(|_| RunError::Cancelled { phase })
    }

    fn run_phase(
        &mut self,
        ctx: &mut RunContext,
        phase: &'static str,
        actions: &[ActionSpec],
        duration_s: f64,
    ) -> Result<(), RunError> {
        self.cancel
            .check()
            .map_err(|_| RunError::Cancelled { phase })?;
        debug!("Phase {}: {} actions, {} s", phase, actions.len(), duration_s);
        ctx.log.phase(format_args!(
            "{} actions={} duration={:.3}s",
            phase,
            actions.len(),
            duration_s
        ));
        for action in actions {
            self.run_action(ctx, phase, action)?;
        }
        self.wait(seconds(duration_s), phase)
    }

    fn run_trial(
        &mut self,
        ctx: &mut RunContext,
        block: &BlockConfig,
        trial: &TrialRecord,
    ) -> Result<TrialStatus, RunError> {
        self.cancel
            .check()
            .map_err(|_| RunError::Cancelled { phase: "block" })?;
        let condition = block.condition(trial.condition_id).ok_or_else(|| {
            ProtocolError::ReplayMismatch(format!("condition {} not in block", trial.condition_id))
        })?;

        ctx.current_trial = Some(trial.index);
        let total = ctx.sequencer.order().len();
        info!(
            "Trial {}/{}: condition {} pattern {}{}",
            trial.index + 1,
            total,
            trial.condition_id,
            trial.pattern_id,
            if trial.repeat { " (repeat)" } else { "" }
        );
        ctx.log.phase(format_args!(
            "trial {}/{} condition={} pattern={} repetition={} repeat={}",
            trial.index + 1,
            total,
            trial.condition_id,
            trial.pattern_id,
            trial.repetition,
            trial.repeat
        ));

        let (status, blocked) = match (&condition.action, &condition.frame) {
            (Some(name), _) => (self.invoke_plugin(ctx, name, &condition.params), false),
            (None, Some(frame)) => (self.stream_frame(ctx, frame)?, false),
            (None, None) => self.dispatch_pattern(ctx, &condition.display)?,
        };
        ctx.log.response(format_args!(
            "trial {} {}",
            trial.index + 1,
            status_text(&status)
        ));
        if !status.is_success() {
            warn!("Trial {} {}", trial.index + 1, status_text(&status));
        }

        // Keep trial timing when the arena did not hold us for the display
        if !blocked {
            self.wait(seconds(condition.display.duration_s), "block")?;
        }
        Ok(status)
    }

    /// Send trial parameters; the flag is true if the call blocked until
    /// the sequence completed
    fn dispatch_pattern(
        &mut self,
        ctx: &mut RunContext,
        display: &DisplaySpec,
    ) -> Result<(TrialStatus, bool), RunError> {
        let params = display.to_trial_params(ctx.default_gs);
        ctx.log.command(format_args!(
            "trial_params pattern={} gs={} fps={} repeat={} start={} duration={}x100ms wait={}",
            params.pattern_id,
            params.gs_level,
            params.frame_rate,
            params.repeat_count,
            params.start_frame,
            params.duration_units,
            display.wait_for_completion
        ));

        match self.arena.trial_params(&params, display.wait_for_completion) {
            Ok(true) if display.wait_for_completion => Ok((TrialStatus::Completed, true)),
            Ok(true) => Ok((TrialStatus::Dispatched, false)),
            Ok(false) => Ok((TrialStatus::Rejected, false)),
            Err(source) if source.is_transport() => Err(RunError::Arena {
                trial: ctx.current_trial,
                command: "trial_params",
                source,
            }),
            Err(e) => Ok((TrialStatus::Failed(e.to_string()), false)),
        }
    }

    /// Encode a frame and stream it to its panel
    fn stream_frame(
        &mut self,
        ctx: &mut RunContext,
        frame: &FrameSpec,
    ) -> Result<TrialStatus, RunError> {
        let block = match frame.encode() {
            Ok(block) => block,
            Err(e) => return Ok(TrialStatus::Failed(e.to_string())),
        };
        ctx.log.command(format_args!(
            "stream_frame panel={} depth={} bytes={}",
            frame.panel,
            frame.depth,
            block.len()
        ));

        match self.arena.stream_frame(&block) {
            Ok(()) => Ok(TrialStatus::Dispatched),
            Err(source) if source.is_transport() => Err(RunError::Arena {
                trial: ctx.current_trial,
                command: "stream_frame",
                source,
            }),
            Err(e) => Ok(TrialStatus::Failed(e.to_string())),
        }
    }

    fn invoke_plugin(&mut self, ctx: &mut RunContext, name: &str, params: &ParamMap) -> TrialStatus {
        ctx.log
            .command(format_args!("plugin {}{}", name, format_params(params)));
        match self.plugins.invoke(name, params) {
            Ok(ActionOutcome::Success) => TrialStatus::Completed,
            Ok(ActionOutcome::Failure(reason)) => TrialStatus::Failed(reason),
            Err(e) => TrialStatus::Failed(e.to_string()),
        }
    }

    /// Run one phase action; only transport failures end the run
    fn run_action(
        &mut self,
        ctx: &mut RunContext,
        phase: &'static str,
        action: &ActionSpec,
    ) -> Result<(), RunError> {
        let (command, result): (&'static str, Result<(), ArenaError>) = match action {
            ActionSpec::AllOn => {
                ctx.log.command("all_on");
                ("all_on", self.arena.all_on())
            }
            ActionSpec::AllOff => {
                ctx.log.command("all_off");
                ("all_off", self.arena.all_off())
            }
            ActionSpec::StopDisplay => {
                ctx.log.command("stop_display");
                ("stop_display", self.arena.stop_display())
            }
            ActionSpec::SetColorDepth { bits } => {
                ctx.log.command(format_args!("set_color_depth bits={}", bits));
                ("set_color_depth", self.arena.set_color_depth(*bits))
            }
            ActionSpec::Pattern(display) => {
                let (status, _) = self.dispatch_pattern(ctx, display)?;
                ctx.log
                    .response(format_args!("trial_params {}", status_text(&status)));
                if !status.is_success() {
                    self.action_failed(ctx, phase, "pattern", &status_text(&status));
                }
                return Ok(());
            }
            ActionSpec::Frame(frame) => {
                let status = self.stream_frame(ctx, frame)?;
                ctx.log
                    .response(format_args!("stream_frame {}", status_text(&status)));
                if !status.is_success() {
                    self.action_failed(ctx, phase, "frame", &status_text(&status));
                }
                return Ok(());
            }
            ActionSpec::Plugin { name, params } => {
                let status = self.invoke_plugin(ctx, name, params);
                ctx.log
                    .response(format_args!("plugin {} {}", name, status_text(&status)));
                if !status.is_success() {
                    self.action_failed(ctx, phase, name, &status_text(&status));
                }
                return Ok(());
            }
        };

        match result {
            Ok(()) => {
                ctx.log.response(format_args!("{} ok", command));
                Ok(())
            }
            Err(source) if source.is_transport() => Err(RunError::Arena {
                trial: ctx.current_trial,
                command,
                source,
            }),
            Err(e) => {
                ctx.log.response(format_args!("{} {}", command, e));
                self.action_failed(ctx, phase, command, &e.to_string());
                Ok(())
            }
        }
    }

    fn action_failed(&self, ctx: &mut RunContext, phase: &str, action: &str, reason: &str) {
        warn!("{} action `{}` failed: {}", phase, action, reason);
        ctx.summary.record_action_failure();
    }

    /// Best-effort shutdown after a fatal error
    fn cleanup(&mut self, ctx: &mut RunContext, err: &RunError) {
        let kind = err.failure_kind();
        if kind == FailureKind::Cancelled {
            ctx.sequencer.abort();
        } else {
            ctx.sequencer.fault(kind);
        }
        error!("Run failed: {}", err);
        ctx.log.error(err);
        ctx.log.phase("cleanup");

        if self.arena.is_open() {
            ctx.log.command("stop_display");
            match self.arena.stop_display() {
                Ok(()) => ctx.log.response("stop_display ok"),
                Err(e) => ctx.log.response(format_args!("stop_display {}", e)),
            }
        }
        if self.arena.is_open() {
            ctx.log.command("all_off");
            match self.arena.all_off() {
                Ok(()) => ctx.log.response("all_off ok"),
                Err(e) => ctx.log.response(format_args!("all_off {}", e)),
            }
        }
        self.arena.close();
        ctx.sequencer.finish_cleanup();
    }
}

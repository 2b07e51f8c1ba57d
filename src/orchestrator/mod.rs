//! Safety orchestrator: the one place the pipeline stages are composed.
//!
//! ```text
//! RECEIVED → SANITIZED → ADMITTED | REJECTED
//!          → CACHE_HIT | GUARDED → PROVIDER_CALLED → VALIDATED → SCORED
//!          → ALLOWED | BLOCKED
//! ```
//!
//! `FAILED` and `CANCELLED` are reachable from any non-terminal state.
//! Every terminal state writes exactly one audit record. [`SafetyOrchestrator::process`]
//! runs the pipeline on its own task, so a caller that goes away mid-call
//! still leaves a `CANCELLED` record behind. Shared state
//! (rate windows, cache versions, session counters) lives in the
//! [`CounterStore`]; the orchestrator itself holds no request state
//! between calls.

pub mod session;
pub mod stream;

pub use session::{SessionState, SessionTracker};
pub use stream::StreamEvent;

use crate::audit::{AiRequestRecord, AuditStore, Outcome};
use crate::cache::{CachePayload, ResponseCache, StaleHit};
use crate::clinical::{
    Contradiction, ContradictionDetector, DetectionInput, DetectionReport, ExplainabilityRecord,
    ParsedExplainability, RiskScore, RiskScorer, ScoreInput,
};
use crate::config::Config;
use crate::errors::{
    backoff_delay, ErrorCategory, ErrorContext, ErrorHandler, GatewayError, HandledError, Recovery,
};
use crate::guardrails::{
    GuardedPrompt, GuardrailContext, OutputValidator, PromptGuardrailBuilder, RuleSet,
    ValidationResult,
};
use crate::providers::{AiProvider, Completion, CompletionRequest};
use crate::security::{InputSanitizer, RateLimitDecision, RateLimiter};
use crate::store::CounterStore;
use crate::telemetry::{GatewayMetrics, Monitor, RequestSample};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Delivered in place of a blocked response.
pub const FALLBACK_MESSAGE: &str = "The AI explanation for this request was withheld by the \
safety checks. Follow the triage system's priority and recommended actions, and consult \
qualified staff if anything is unclear.";

// ── Request / response ───────────────────────────────────────────

/// One AI request with caller identity from the upstream auth layer.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub task: String,
    pub context: Value,
    pub user_id: String,
    pub role: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Sanitized,
    Admitted,
    Rejected,
    CacheHit,
    Guarded,
    ProviderCalled,
    Validated,
    Scored,
    Allowed,
    Blocked,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub outcome: Outcome,
    pub latency_ms: u64,
    pub model: String,
    pub warnings: Vec<String>,
    pub blocked: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<RiskScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradictions: Option<Vec<Contradiction>>,
    pub hallucination_flags: Vec<String>,
    pub was_modified: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    pub session_escalated: bool,
    pub states: Vec<PipelineState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    pub success: bool,
    pub response: Option<String>,
    pub request_id: String,
    pub metadata: ResponseMetadata,
}

/// A request that ended without a deliverable response.
#[derive(Debug, Clone)]
pub struct RequestFailure {
    pub request_id: String,
    pub error: HandledError,
    /// Set when the request was rejected by admission control.
    pub rate_limit: Option<RateLimitDecision>,
    pub states: Vec<PipelineState>,
}

impl RequestFailure {
    pub fn status_code(&self) -> u16 {
        self.error.error.status_code
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.error.category
    }
}

// ── Per-request state ────────────────────────────────────────────

pub(crate) struct RequestRun {
    request: AiRequest,
    request_id: String,
    started: Instant,
    created_at: DateTime<Utc>,
    states: Vec<PipelineState>,
    /// Sanitized context.
    context: Value,
    sanitizer_warnings: Vec<String>,
    injection_detected: bool,
    input_hash: String,
    explainability: ParsedExplainability,
    prompt: Option<GuardedPrompt>,
    /// Window at which a rate slot is held; handed back unless dispatched.
    reserved_at: Option<DateTime<Utc>>,
    /// Sent to the provider; the rate slot is spent and outcome stats
    /// must be recorded.
    dispatched: bool,
}

impl RequestRun {
    fn new(request: AiRequest) -> Self {
        Self {
            context: request.context.clone(),
            request,
            request_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            created_at: Utc::now(),
            states: vec![PipelineState::Received],
            sanitizer_warnings: Vec::new(),
            injection_detected: false,
            input_hash: String::new(),
            explainability: ParsedExplainability::default(),
            prompt: None,
            reserved_at: None,
            dispatched: false,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        tracing::debug!(request_id = %self.request_id, state = ?state, "Pipeline state");
        self.states.push(state);
    }

    fn task(&self) -> &str {
        &self.request.task
    }

    fn latency_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

pub(crate) enum Admission {
    Proceed(Box<RequestRun>),
    Finished(AiResponse),
    Rejected(Box<RequestFailure>),
}

fn is_transient(category: ErrorCategory) -> bool {
    matches!(category, ErrorCategory::Timeout | ErrorCategory::Provider)
}

/// Everything decided about one model output.
pub(crate) struct Evaluation {
    validation: ValidationResult,
    report: DetectionReport,
    score: RiskScore,
    block_reasons: Vec<&'static str>,
}

impl Evaluation {
    fn is_blocked(&self) -> bool {
        !self.block_reasons.is_empty()
    }
}

// ── Orchestrator ─────────────────────────────────────────────────

pub struct SafetyOrchestrator {
    config: Arc<Config>,
    store: Arc<dyn CounterStore>,
    provider: Arc<dyn AiProvider>,
    audit: Arc<dyn AuditStore>,
    sanitizer: InputSanitizer,
    limiter: RateLimiter,
    cache: ResponseCache,
    prompts: PromptGuardrailBuilder,
    validator: OutputValidator,
    detector: ContradictionDetector,
    scorer: RiskScorer,
    errors: ErrorHandler,
    monitor: Monitor,
    sessions: SessionTracker,
    metrics: GatewayMetrics,
}

impl SafetyOrchestrator {
    pub fn new(
        config: Config,
        store: Arc<dyn CounterStore>,
        provider: Arc<dyn AiProvider>,
        audit: Arc<dyn AuditStore>,
    ) -> Result<Self> {
        let rules = Arc::new(RuleSet::from_config(&config.rules)?);
        let clinical_tasks: Vec<String> = config
            .tasks
            .0
            .iter()
            .filter(|(_, policy)| policy.clinical)
            .map(|(name, _)| name.clone())
            .collect();

        Ok(Self {
            sanitizer: InputSanitizer::new(&config.sanitizer),
            limiter: RateLimiter::new(Arc::clone(&store), config.rate_limits.clone()),
            cache: ResponseCache::new(Arc::clone(&store), config.cache.clone()),
            prompts: PromptGuardrailBuilder::with_defaults(),
            validator: OutputValidator::new(Arc::clone(&rules)),
            detector: ContradictionDetector::new(Arc::clone(&rules)),
            scorer: RiskScorer::new(rules, config.risk.clone()),
            errors: ErrorHandler::new(clinical_tasks),
            monitor: Monitor::new(Arc::clone(&store), config.monitor.clone()),
            sessions: SessionTracker::new(Arc::clone(&store), &config.session),
            metrics: GatewayMetrics::new()?,
            config: Arc::new(config),
            store,
            provider,
            audit,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn AiProvider> {
        &self.provider
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub async fn session_state(&self, session_id: &str) -> Result<SessionState> {
        self.sessions.state(session_id).await
    }

    pub async fn reset_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.reset(session_id).await
    }

    /// Run one request through the full pipeline.
    ///
    /// Dropping the returned future cancels the provider call; the run is
    /// then audited as `CANCELLED` from its own task.
    pub async fn process(self: &Arc<Self>, request: AiRequest) -> Result<AiResponse, RequestFailure> {
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let task = request.task.clone();
        let this = Arc::clone(self);
        let pipeline = tokio::spawn(async move { this.process_until(request, cancel).await });
        match pipeline.await {
            Ok(result) => result,
            Err(join_err) => Err(self.pipeline_aborted(&task, join_err.into())),
        }
    }

    async fn process_until(
        &self,
        request: AiRequest,
        cancel: CancellationToken,
    ) -> Result<AiResponse, RequestFailure> {
        let mut run = match self.admit(request).await {
            Admission::Proceed(run) => *run,
            Admission::Finished(response) => return Ok(response),
            Admission::Rejected(failure) => return Err(*failure),
        };

        let completion_request = self.completion_request(&run);
        let called = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.call_with_retry(&run, &completion_request) => Some(result),
        };
        match called {
            None => Err(self.cancel_run(run).await),
            Some(Ok(Completion { text, model })) => {
                run.enter(PipelineState::ProviderCalled);
                Ok(self.complete_run(run, text, model).await)
            }
            Some(Err(err)) => self.fail_run(run, err).await,
        }
    }

    /// The pipeline task itself died; there is no run left to audit.
    fn pipeline_aborted(&self, task: &str, err: anyhow::Error) -> RequestFailure {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(request_id = %request_id, task, "AI pipeline task aborted: {err}");
        let err: anyhow::Error = GatewayError::Provider(format!("pipeline aborted: {err}")).into();
        let handled = self.errors.handle(
            &err,
            &ErrorContext {
                task: Some(task),
                request_id: Some(&request_id),
            },
        );
        RequestFailure {
            request_id,
            error: handled,
            rate_limit: None,
            states: vec![PipelineState::Received, PipelineState::Failed],
        }
    }

    // ── Stages before the provider ───────────────────────────────

    /// RECEIVED through GUARDED. Holds a rate slot from ADMITTED on and
    /// gives it back when the request ends before the provider.
    pub(crate) async fn admit(&self, request: AiRequest) -> Admission {
        let mut run = RequestRun::new(request);
        tracing::info!(
            request_id = %run.request_id,
            task = %run.request.task,
            session_id = run.request.session_id.as_deref().unwrap_or("-"),
            "AI request received"
        );

        let Some(policy) = self.config.tasks.get(run.task()).cloned() else {
            let err = GatewayError::Validation(format!("unknown task '{}'", run.task()));
            return self.reject_run(run, err.into()).await;
        };

        let sanitized = self.sanitizer.sanitize_context(&mut run.context);
        run.sanitizer_warnings = sanitized.warnings;
        run.injection_detected = sanitized.injection_detected;
        run.input_hash = hex::encode(Sha256::digest(run.context.to_string().as_bytes()));
        run.explainability = ExplainabilityRecord::parse(&run.context);
        if run.explainability.is_malformed() {
            tracing::warn!(
                request_id = %run.request_id,
                task = run.task(),
                issues = ?run.explainability.issues,
                "Explainability record is malformed"
            );
        }
        run.enter(PipelineState::Sanitized);

        let admitted_at = Utc::now();
        let decision = match self
            .limiter
            .check_at(run.task(), &run.request.user_id, &run.request.role, admitted_at)
            .await
        {
            Ok(decision) => decision,
            Err(err) => return self.reject_run(run, err).await,
        };
        if let Some(reason) = decision.reason {
            return self.rate_limited(run, decision, reason.as_str()).await;
        }
        run.reserved_at = Some(admitted_at);
        run.enter(PipelineState::Admitted);

        if self.cache.is_cacheable(run.task()) {
            match self.cache.get(run.task(), &run.context).await {
                Ok(Some(payload)) => {
                    self.metrics.cache_event("hit");
                    self.release_slot(&mut run).await;
                    return Admission::Finished(self.serve_cached(run, payload, None).await);
                }
                Ok(None) => self.metrics.cache_event("miss"),
                Err(e) => tracing::warn!(request_id = %run.request_id, "Cache lookup failed: {e}"),
            }
        }

        let guarded = self.prompts.build(&GuardrailContext {
            task: run.task(),
            policy: &policy,
            context: &run.context,
            default_temperature: self.config.provider.temperature,
        });
        match guarded {
            Ok(prompt) => run.prompt = Some(prompt),
            Err(err) => {
                self.release_slot(&mut run).await;
                return self.reject_run(run, err).await;
            }
        }
        run.enter(PipelineState::Guarded);
        run.dispatched = true;
        Admission::Proceed(Box::new(run))
    }

    async fn release_slot(&self, run: &mut RequestRun) {
        let Some(reserved_at) = run.reserved_at.take() else {
            return;
        };
        if let Err(e) = self
            .limiter
            .release_at(run.task(), &run.request.user_id, reserved_at)
            .await
        {
            tracing::warn!(request_id = %run.request_id, "Rate slot release failed: {e}");
        }
    }

    fn completion_request(&self, run: &RequestRun) -> CompletionRequest {
        let (prompt, temperature, max_tokens) = match &run.prompt {
            Some(p) => (p.text.clone(), p.temperature, p.max_tokens),
            None => (String::new(), self.config.provider.temperature, 0),
        };
        CompletionRequest {
            prompt,
            model: self.config.provider.model.clone(),
            temperature,
            max_tokens,
        }
    }

    pub(crate) fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.config.provider.timeout_secs.max(1))
    }

    /// Longest a provider call can take with every retry and backoff.
    pub fn retry_budget(&self) -> Duration {
        let retries = [ErrorCategory::Timeout, ErrorCategory::Provider]
            .into_iter()
            .map(|category| Recovery::for_category(category).max_retries)
            .max()
            .unwrap_or(0);
        let backoff: Duration = (0..retries)
            .map(|attempt| {
                backoff_delay(
                    attempt,
                    self.config.provider.backoff_base_ms,
                    self.config.provider.backoff_max_ms,
                )
            })
            .sum();
        self.provider_timeout() * (retries + 1) + backoff
    }

    /// Bounded call with retry for transient categories.
    async fn call_with_retry(
        &self,
        run: &RequestRun,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let timeout = self.provider_timeout();
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(timeout, self.provider.complete(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    after_secs: timeout.as_secs(),
                }
                .into()),
            };
            let err = match result {
                Ok(completion) => return Ok(completion),
                Err(err) => err,
            };

            let category = self.errors.categorize(&err);
            let max_retries = if is_transient(category) {
                Recovery::for_category(category).max_retries
            } else {
                0
            };
            if attempt >= max_retries {
                return Err(err);
            }
            let delay = backoff_delay(
                attempt,
                self.config.provider.backoff_base_ms,
                self.config.provider.backoff_max_ms,
            );
            attempt += 1;
            tracing::warn!(
                request_id = %run.request_id,
                task = run.task(),
                attempt,
                category = category.as_str(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Provider call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // ── Stages after the provider ────────────────────────────────

    /// VALIDATED → SCORED → ALLOWED | BLOCKED for a complete model output.
    pub(crate) async fn complete_run(
        &self,
        mut run: RequestRun,
        raw: String,
        model: String,
    ) -> AiResponse {
        let Evaluation {
            validation,
            report,
            score,
            block_reasons,
        } = self.evaluate(&run, &raw, run.prompt.as_ref().map_or(0, |p| p.max_words));
        run.enter(PipelineState::Validated);
        run.enter(PipelineState::Scored);
        let is_blocked = !block_reasons.is_empty();

        let (outcome, response, was_modified) = if is_blocked {
            run.enter(PipelineState::Blocked);
            for reason in &block_reasons {
                self.metrics.blocked(reason);
            }
            tracing::warn!(
                request_id = %run.request_id,
                task = run.task(),
                risk_total = score.total,
                contradictions = %report.summary,
                reasons = ?block_reasons,
                "Response blocked"
            );
            (
                Outcome::Blocked,
                crate::guardrails::output::frame(FALLBACK_MESSAGE),
                true,
            )
        } else {
            run.enter(PipelineState::Allowed);
            let payload = CachePayload {
                response: validation.output.clone(),
                model: model.clone(),
                warnings: validation.warnings.clone(),
                error: false,
                was_modified: validation.was_modified(),
            };
            match self.cache.put(run.task(), &run.context, &payload).await {
                Ok(true) => self.metrics.cache_event("write"),
                Ok(false) => {}
                Err(e) => tracing::warn!(request_id = %run.request_id, "Cache write failed: {e}"),
            }
            (Outcome::Allowed, validation.output.clone(), validation.was_modified())
        };

        let warned = !validation.warnings.is_empty() || score.should_warn;
        let session_escalated = self
            .session_after_delivery(run.request.session_id.as_deref(), warned)
            .await;
        self.record_outcome_stats(&run, true).await;

        let mut risk_flags: Vec<String> = score.breakdown.keys().cloned().collect();
        for contradiction in &report.contradictions {
            let flag = format!("contradiction:{}", contradiction.kind.as_str());
            if !risk_flags.contains(&flag) {
                risk_flags.push(flag);
            }
        }
        risk_flags.extend(block_reasons.iter().map(|r| format!("blocked:{r}")));

        let mut record = self.audit_record(&run, outcome);
        record.raw_response = Some(raw);
        record.sanitized_response = Some(response.clone());
        record.model = model.clone();
        record.was_overridden = was_modified;
        record.risk_flags = risk_flags;
        record.risk_score = Some(score.clone());
        self.write_audit(&record).await;
        self.observe(&run, outcome, true, was_modified).await;

        let mut warnings = validation.warnings;
        warnings.extend(run.sanitizer_warnings.iter().cloned());
        warnings.extend(
            run.explainability
                .issues
                .iter()
                .map(|issue| format!("Triage explainability record unreadable: {issue}")),
        );
        AiResponse {
            success: true,
            response: Some(response),
            request_id: run.request_id.clone(),
            metadata: ResponseMetadata {
                outcome,
                latency_ms: run.latency_ms(),
                model,
                warnings,
                blocked: validation.blocked,
                risk_score: Some(score),
                contradictions: Some(report.contradictions),
                hallucination_flags: validation.hallucination_flags,
                was_modified,
                cached: false,
                stale: false,
                session_escalated,
                states: run.states,
            },
        }
    }

    /// Validation, contradiction detection and risk scoring for `raw`,
    /// with the reasons it would be blocked. `max_words` of zero skips the
    /// word limit.
    pub(crate) fn evaluate(&self, run: &RequestRun, raw: &str, max_words: u32) -> Evaluation {
        let validation = self.validator.validate_limited(raw, run.task(), max_words);
        let report = self.detector.detect(&DetectionInput {
            ai_output: raw,
            explainability: run.explainability.record.as_ref(),
            context: &run.context,
        });
        let score = self.scorer.score(&ScoreInput {
            output: raw,
            contradictions: &report.contradictions,
            injection_detected: run.injection_detected,
            explainability_malformed: run.explainability.is_malformed(),
        });

        let mut block_reasons = Vec::new();
        if !validation.valid {
            block_reasons.push("deny_phrase");
        }
        if score.should_block {
            block_reasons.push("risk_threshold");
        }
        if report.has_critical {
            block_reasons.push("critical_contradiction");
        }
        Evaluation {
            validation,
            report,
            score,
            block_reasons,
        }
    }

    async fn serve_cached(
        &self,
        mut run: RequestRun,
        payload: CachePayload,
        stale: Option<u64>,
    ) -> AiResponse {
        run.enter(PipelineState::CacheHit);
        let session_escalated = self
            .session_after_delivery(
                run.request.session_id.as_deref(),
                !payload.warnings.is_empty(),
            )
            .await;

        let mut record = self.audit_record(&run, Outcome::CacheHit);
        record.sanitized_response = Some(payload.response.clone());
        record.model = payload.model.clone();
        if let Some(age) = stale {
            record.risk_flags = vec![format!("stale:{age}s")];
        }
        self.write_audit(&record).await;
        self.observe(&run, Outcome::CacheHit, true, false).await;

        AiResponse {
            success: true,
            response: Some(payload.response),
            request_id: run.request_id.clone(),
            metadata: ResponseMetadata {
                outcome: Outcome::CacheHit,
                latency_ms: run.latency_ms(),
                model: payload.model,
                warnings: payload.warnings,
                blocked: Vec::new(),
                risk_score: None,
                contradictions: None,
                hallucination_flags: Vec::new(),
                was_modified: false,
                cached: true,
                stale: stale.is_some(),
                session_escalated,
                states: run.states,
            },
        }
    }

    // ── Terminal failures ────────────────────────────────────────

    /// Provider-path failure: serve a stale entry for transient
    /// categories when one exists, otherwise FAILED.
    pub(crate) async fn fail_run(
        &self,
        run: RequestRun,
        err: anyhow::Error,
    ) -> Result<AiResponse, RequestFailure> {
        let category = self.errors.categorize(&err);
        if is_transient(category) && self.cache.is_cacheable(run.task()) {
            match self.cache.get_stale(run.task(), &run.context).await {
                Ok(Some(StaleHit { payload, age_secs })) => {
                    tracing::warn!(
                        request_id = %run.request_id,
                        task = run.task(),
                        age_secs,
                        category = category.as_str(),
                        "Provider unavailable, serving stale cache entry"
                    );
                    self.metrics.cache_event("stale");
                    self.record_outcome_stats(&run, false).await;
                    return Ok(self.serve_cached(run, payload, Some(age_secs)).await);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(request_id = %run.request_id, "Stale lookup failed: {e}"),
            }
        }
        Err(self.terminate_failed(run, err, category).await)
    }

    async fn reject_run(&self, run: RequestRun, err: anyhow::Error) -> Admission {
        let category = self.errors.categorize(&err);
        Admission::Rejected(Box::new(self.terminate_failed(run, err, category).await))
    }

    async fn terminate_failed(
        &self,
        mut run: RequestRun,
        err: anyhow::Error,
        category: ErrorCategory,
    ) -> RequestFailure {
        run.enter(PipelineState::Failed);
        let handled = self.errors.handle(
            &err,
            &ErrorContext {
                task: Some(run.task()),
                request_id: Some(&run.request_id),
            },
        );
        if run.dispatched {
            self.record_outcome_stats(&run, false).await;
        }

        let mut record = self.audit_record(&run, Outcome::Failed);
        record.risk_flags = vec![format!("error:{}", category.as_str())];
        self.write_audit(&record).await;
        self.observe(&run, Outcome::Failed, false, false).await;

        RequestFailure {
            request_id: run.request_id,
            error: handled,
            rate_limit: None,
            states: run.states,
        }
    }

    async fn rate_limited(
        &self,
        mut run: RequestRun,
        decision: RateLimitDecision,
        reason: &str,
    ) -> Admission {
        run.enter(PipelineState::Rejected);
        let err: anyhow::Error = GatewayError::RateLimited {
            reason: reason.to_string(),
            retry_after_secs: decision.retry_after_secs,
        }
        .into();
        let handled = self.errors.handle(
            &err,
            &ErrorContext {
                task: Some(run.task()),
                request_id: Some(&run.request_id),
            },
        );

        let mut record = self.audit_record(&run, Outcome::Rejected);
        record.risk_flags = vec![format!("rate_limit:{reason}")];
        self.write_audit(&record).await;
        self.observe(&run, Outcome::Rejected, false, false).await;

        Admission::Rejected(Box::new(RequestFailure {
            request_id: run.request_id,
            error: handled,
            rate_limit: Some(decision),
            states: run.states,
        }))
    }

    /// Audit a run whose caller went away. A rate slot already spent on
    /// the provider stays spent.
    pub(crate) async fn cancel_run(&self, mut run: RequestRun) -> RequestFailure {
        run.enter(PipelineState::Cancelled);
        tracing::info!(request_id = %run.request_id, task = run.task(), "AI request cancelled");
        let record = self.audit_record(&run, Outcome::Cancelled);
        self.write_audit(&record).await;
        self.metrics.request_finished(
            run.task(),
            Outcome::Cancelled.as_str(),
            run.started.elapsed().as_secs_f64(),
        );

        let err: anyhow::Error = GatewayError::Cancelled.into();
        RequestFailure {
            error: self.errors.handle(
                &err,
                &ErrorContext {
                    task: Some(run.task()),
                    request_id: Some(&run.request_id),
                },
            ),
            request_id: run.request_id,
            rate_limit: None,
            states: run.states,
        }
    }

    // ── Side effects ─────────────────────────────────────────────

    async fn session_after_delivery(&self, session_id: Option<&str>, warned: bool) -> bool {
        let Some(session_id) = session_id else {
            return false;
        };
        let state = if warned {
            self.sessions.record_warning(session_id).await
        } else {
            self.sessions.state(session_id).await
        };
        match state {
            Ok(state) => state.escalated,
            Err(e) => {
                tracing::warn!(session_id, "Session escalation update failed: {e}");
                false
            }
        }
    }

    async fn record_outcome_stats(&self, run: &RequestRun, success: bool) {
        if let Err(e) = self.limiter.record(run.task(), &run.request.user_id, success).await {
            tracing::warn!(request_id = %run.request_id, "Outcome stats update failed: {e}");
        }
    }

    fn audit_record(&self, run: &RequestRun, outcome: Outcome) -> AiRequestRecord {
        AiRequestRecord {
            request_id: run.request_id.clone(),
            session_id: run.request.session_id.clone(),
            user_id: run.request.user_id.clone(),
            role: run.request.role.clone(),
            task: run.request.task.clone(),
            input_hash: run.input_hash.clone(),
            prompt: run.prompt.as_ref().map(|p| p.text.clone()).unwrap_or_default(),
            raw_response: None,
            sanitized_response: None,
            model: String::new(),
            latency_ms: run.latency_ms(),
            was_overridden: false,
            risk_flags: Vec::new(),
            risk_score: None,
            outcome,
            created_at: run.created_at,
            completed_at: Utc::now(),
        }
    }

    async fn write_audit(&self, record: &AiRequestRecord) {
        if let Err(e) = self.audit.append(record).await {
            tracing::error!(
                request_id = %record.request_id,
                outcome = record.outcome.as_str(),
                "Audit write failed: {e:#}"
            );
        }
    }

    async fn observe(&self, run: &RequestRun, outcome: Outcome, success: bool, overridden: bool) {
        let latency_ms = run.latency_ms();
        let sample = RequestSample {
            task: run.request.task.clone(),
            success,
            latency_ms: Some(latency_ms),
            was_overridden: overridden,
        };
        if let Err(e) = self.monitor.record_request(&sample).await {
            tracing::warn!(request_id = %run.request_id, "Monitor update failed: {e}");
        }
        self.metrics.request_finished(
            run.task(),
            outcome.as_str(),
            run.started.elapsed().as_secs_f64(),
        );
        tracing::info!(
            request_id = %run.request_id,
            task = run.task(),
            outcome = outcome.as_str(),
            latency_ms,
            "AI request finished"
        );
    }
}

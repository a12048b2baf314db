//! Iteration controller: retrieval, then analysis and critique rounds.
//!
//! ```text
//! Planned -> PlanExecuted -> Critiqued -> Done
//!                  ^             |
//!                  +-- feedback -+--> MaxIterationsReached
//! ```
//!
//! Retrieval runs once. A rejected narrative loops back to analysis with the
//! critique attached. The wall-clock budget in the request context is checked
//! before every phase; running out yields `BudgetExhausted`.

use crate::config::EngineConfig;
use crate::context::{ProgressEvent, RequestContext};
use crate::metrics::ITERATIONS;
use crate::orchestrator::{PlanExecution, PlanOrchestrator, StepStatus};
use hopgraph_core::{Document, Result, RetrievalPlan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Critique {
    pub is_valid: bool,
    pub confidence: f32,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub question: String,
    pub documents: Vec<Document>,
    /// The previous round's critique, when it rejected the narrative.
    pub feedback: Option<Critique>,
    pub iteration: u32,
}

/// Turns retrieved documents into a narrative answer.
#[async_trait::async_trait]
pub trait Analyst: Send + Sync + 'static {
    async fn analyze(&self, ctx: &RequestContext, req: &AnalysisRequest) -> Result<String>;
}

/// Validates a narrative against the data it was built from.
#[async_trait::async_trait]
pub trait Critic: Send + Sync + 'static {
    async fn critique(
        &self,
        ctx: &RequestContext,
        narrative: &str,
        documents: &[Document],
    ) -> Result<Critique>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IterationState {
    Planned,
    PlanExecuted,
    Critiqued,
    Done,
    MaxIterationsReached,
    BudgetExhausted,
}

impl IterationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IterationState::Done
                | IterationState::MaxIterationsReached
                | IterationState::BudgetExhausted
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub narrative: String,
    pub confidence: f32,
    pub state: IterationState,
    /// Analysis rounds performed.
    pub iterations: u32,
    pub issues: Vec<String>,
    /// Every state visited, in order.
    pub trace: Vec<IterationState>,
    pub execution: PlanExecution,
}

// Best narrative seen so far, ranked by critique confidence.
struct Candidate {
    narrative: String,
    confidence: f32,
    issues: Vec<String>,
}

#[derive(Clone)]
pub struct IterationController {
    orchestrator: PlanOrchestrator,
    analyst: Arc<dyn Analyst>,
    critic: Arc<dyn Critic>,
    config: EngineConfig,
}

impl IterationController {
    pub fn new(
        orchestrator: PlanOrchestrator,
        analyst: Arc<dyn Analyst>,
        critic: Arc<dyn Critic>,
        config: EngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            analyst,
            critic,
            config,
        }
    }

    /// Only a malformed plan or a failing analyst is an error; running out of
    /// rounds or time returns the best narrative with reduced confidence.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        question: &str,
        plan: &RetrievalPlan,
    ) -> Result<Answer> {
        // a context without its own deadline gets the configured one
        let budgeted;
        let ctx = if ctx.remaining().is_none() {
            budgeted = ctx.clone().with_budget(self.config.time_budget);
            &budgeted
        } else {
            ctx
        };
        let mut trace = vec![IterationState::Planned];
        if ctx.budget_exceeded() {
            return Ok(self.finish(
                ctx,
                IterationState::BudgetExhausted,
                None,
                0,
                trace,
                PlanExecution::default(),
            ));
        }

        ctx.emit(ProgressEvent::Phase {
            phase: "retrieval".into(),
            iteration: 0,
        });
        let execution = self.orchestrator.execute(ctx, plan).await?;
        trace.push(IterationState::PlanExecuted);
        let retrieval_confidence = retrieval_confidence(&execution);

        let max = self.config.max_iterations.max(1);
        let mut best: Option<Candidate> = None;
        let mut feedback: Option<Critique> = None;
        let mut iteration = 0;

        loop {
            if ctx.budget_exceeded() {
                return Ok(self.finish(ctx, IterationState::BudgetExhausted, best, iteration, trace, execution));
            }
            iteration += 1;
            ctx.emit(ProgressEvent::Phase {
                phase: "analysis".into(),
                iteration,
            });
            let req = AnalysisRequest {
                question: question.to_string(),
                documents: execution.documents.clone(),
                feedback: feedback.take(),
                iteration,
            };
            let narrative = self.analyst.analyze(ctx, &req).await?;

            if !plan.requires_critique {
                let done = Candidate {
                    narrative,
                    confidence: retrieval_confidence,
                    issues: Vec::new(),
                };
                trace.push(IterationState::Done);
                return Ok(self.finish(ctx, IterationState::Done, Some(done), iteration, trace, execution));
            }

            if ctx.budget_exceeded() {
                let unchecked = Candidate {
                    narrative,
                    confidence: retrieval_confidence,
                    issues: vec!["narrative was not critiqued".into()],
                };
                let best = Some(better(best, unchecked));
                return Ok(self.finish(ctx, IterationState::BudgetExhausted, best, iteration, trace, execution));
            }
            ctx.emit(ProgressEvent::Phase {
                phase: "critique".into(),
                iteration,
            });
            let critique = match self
                .critic
                .critique(ctx, &narrative, &execution.documents)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "critique failed, accepting narrative");
                    Critique {
                        is_valid: true,
                        confidence: self.config.degraded_confidence_factor,
                        issues: vec![format!("critique unavailable: {e}")],
                    }
                }
            };
            trace.push(IterationState::Critiqued);

            let candidate = Candidate {
                narrative,
                confidence: critique.confidence.clamp(0.0, 1.0),
                issues: critique.issues.clone(),
            };
            if critique.is_valid {
                trace.push(IterationState::Done);
                return Ok(self.finish(ctx, IterationState::Done, Some(candidate), iteration, trace, execution));
            }
            best = Some(better(best, candidate));
            if iteration >= max {
                trace.push(IterationState::MaxIterationsReached);
                return Ok(self.finish(
                    ctx,
                    IterationState::MaxIterationsReached,
                    best,
                    iteration,
                    trace,
                    execution,
                ));
            }
            info!(request_id = %ctx.request_id, iteration, issues = critique.issues.len(), "narrative rejected, re-analyzing");
            feedback = Some(critique);
        }
    }

    fn finish(
        &self,
        ctx: &RequestContext,
        state: IterationState,
        best: Option<Candidate>,
        iterations: u32,
        mut trace: Vec<IterationState>,
        execution: PlanExecution,
    ) -> Answer {
        if state == IterationState::BudgetExhausted {
            trace.push(state);
        }
        let factor = match state {
            IterationState::Done => 1.0,
            _ => self.config.degraded_confidence_factor,
        };
        let Candidate {
            narrative,
            confidence,
            issues,
        } = best.unwrap_or(Candidate {
            narrative: String::new(),
            confidence: 0.0,
            issues: Vec::new(),
        });
        ITERATIONS.observe(iterations as f64);
        info!(
            request_id = %ctx.request_id,
            state = ?state,
            iterations,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "answer ready"
        );
        Answer {
            narrative,
            confidence: (confidence * factor).clamp(0.0, 1.0),
            state,
            iterations,
            issues,
            trace,
            execution,
        }
    }
}

fn better(best: Option<Candidate>, candidate: Candidate) -> Candidate {
    match best {
        Some(b) if b.confidence >= candidate.confidence => b,
        _ => candidate,
    }
}

/// Mean confidence of the completed steps, 0 when none completed.
pub fn retrieval_confidence(execution: &PlanExecution) -> f32 {
    let completed: Vec<f32> = execution
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.result.confidence)
        .collect();
    if completed.is_empty() {
        0.0
    } else {
        completed.iter().sum::<f32>() / completed.len() as f32
    }
}

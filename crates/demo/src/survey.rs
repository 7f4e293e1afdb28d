// crates/demo/src/survey.rs
//! Sample job kinds: a survey that fans out one question per worker.

use jobtree_core::{
    fail_on_child_error, ChildCompletion, ExecutionResult, ExternalResponse, JobBehavior, JobError, JobKind,
    JobNode, JobSpec, JobState, ParamValue, Parameters,
};

pub const SURVEY: JobKind = JobKind::new("survey");
pub const QUESTION: JobKind = JobKind::new("question");

const DEFAULT_QUESTIONS: i64 = 3;

/// Root job: asks `questions` questions in parallel.
#[derive(Debug, Clone, Default)]
pub struct Survey {
    /// Index of a question that fails on start.
    pub failing_question: Option<usize>,
    /// Keep going when a question fails instead of failing the survey.
    pub absorb_failures: bool,
}

impl JobBehavior for Survey {
    fn kind(&self) -> JobKind {
        SURVEY
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::from([("questions".to_string(), ParamValue::Int(DEFAULT_QUESTIONS))])
    }

    fn validate_parameters(&self, job: &JobNode) -> Result<(), JobError> {
        match job.parameter("questions").and_then(ParamValue::as_i64) {
            Some(n) if n > 0 => Ok(()),
            _ => Err(JobError::validation(job.id(), "questions must be a positive integer")),
        }
    }

    fn start(&self, job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        let count = job
            .parameter("questions")
            .and_then(ParamValue::as_i64)
            .unwrap_or(DEFAULT_QUESTIONS);
        job.set_iteration_counters(u32::try_from(count).unwrap_or(u32::MAX));

        let questions = (0..count)
            .map(|i| {
                JobSpec::new(QUESTION)
                    .with_parameter("question", format!("question #{}", i + 1))
                    .with_parameter("fail", self.failing_question == usize::try_from(i).ok())
            })
            .collect();
        Ok(ExecutionResult::spawn(questions))
    }

    fn on_child_complete(
        &self,
        job: &mut JobNode,
        child: &JobNode,
        event: &ChildCompletion,
    ) -> Result<ExecutionResult, JobError> {
        job.decrement_iteration_count();
        if !self.absorb_failures {
            fail_on_child_error(event)?;
        }
        if let Some(answer) = child.parameter("answer") {
            tracing::info!(survey_id = %job.id(), question_id = %child.id(), answer = ?answer, "Collected answer");
        }
        Ok(ExecutionResult::done())
    }
}

/// Leaf job: waits for an external answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Question;

impl JobBehavior for Question {
    fn kind(&self) -> JobKind {
        QUESTION
    }

    fn validate_parameters(&self, job: &JobNode) -> Result<(), JobError> {
        match job.parameter("question").and_then(ParamValue::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(JobError::validation(job.id(), "question text is empty")),
        }
    }

    fn start(&self, job: &mut JobNode) -> Result<ExecutionResult, JobError> {
        if job.parameter("fail").and_then(ParamValue::as_bool) == Some(true) {
            return Err(JobError::failed(job.id(), "question could not be delivered"));
        }
        Ok(ExecutionResult::awaiting_response())
    }

    fn on_external_response(
        &self,
        job: &mut JobNode,
        response: &ExternalResponse,
    ) -> Result<ExecutionResult, JobError> {
        job.set_parameter("answer", response.payload.clone());
        Ok(ExecutionResult::done())
    }

    // Answers that race a cancellation are expected.
    fn accepts_unexpected_response(&self, _response: &ExternalResponse, state: JobState) -> bool {
        state == JobState::Cancelled
    }
}

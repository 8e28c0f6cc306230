pub mod azure;
pub mod json_schema;
pub mod length;
pub mod pii;
pub mod regex_rule;
pub mod sentence_count;
pub mod url;
pub mod word_count;

use serde_json::Value;

use crate::http::StatusCode;
use crate::jsonpath::{JsonPath, PathError};
use crate::policy::{
	ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction,
	ResponseAction,
};
use crate::*;

/// Which stream a guardrail inspected; rendered into the error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
	#[serde(rename = "REQUEST")]
	Request,
	#[serde(rename = "RESPONSE")]
	Response,
}

/// The uniform error body every guardrail emits on a violation.
#[derive(Debug, Serialize)]
pub struct InterventionBody {
	#[serde(rename = "type")]
	pub kind: Strng,
	pub message: InterventionMessage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionMessage {
	pub action: &'static str,
	pub intervening_guardrail: Strng,
	pub action_reason: String,
	pub direction: Direction,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub assessments: Option<Value>,
}

#[derive(Debug)]
pub struct Intervention {
	pub kind: Strng,
	pub reason: String,
	pub direction: Direction,
	pub assessments: Option<Value>,
	pub status: StatusCode,
}

impl Intervention {
	pub fn new(kind: Strng, direction: Direction, reason: impl Into<String>) -> Self {
		Intervention {
			kind,
			reason: reason.into(),
			direction,
			assessments: None,
			status: StatusCode::UNPROCESSABLE_ENTITY,
		}
	}

	pub fn with_assessments(mut self, assessments: Option<Value>) -> Self {
		self.assessments = assessments;
		self
	}

	pub fn with_status(mut self, status: StatusCode) -> Self {
		self.status = status;
		self
	}

	pub fn slug(&self) -> Strng {
		strng::new(self.kind.to_lowercase().replace('_', "-"))
	}

	pub fn response(self) -> ImmediateResponse {
		let body = InterventionBody {
			kind: self.kind.clone(),
			message: InterventionMessage {
				action: "GUARDRAIL_INTERVENED",
				intervening_guardrail: self.slug(),
				action_reason: self.reason,
				direction: self.direction,
				assessments: self.assessments,
			},
		};
		ImmediateResponse::json(self.status, &body)
	}
}

/// Verdict of one content check over the extracted payload slice.
#[derive(Debug, Clone)]
pub struct Verdict {
	pub passed: bool,
	pub reason: String,
	pub assessment: Option<Value>,
}

impl Verdict {
	pub fn pass() -> Self {
		Verdict {
			passed: true,
			reason: String::new(),
			assessment: None,
		}
	}

	pub fn fail(reason: impl Into<String>) -> Self {
		Verdict {
			passed: false,
			reason: reason.into(),
			assessment: None,
		}
	}

	pub fn with_assessment(mut self, assessment: Value) -> Self {
		self.assessment = Some(assessment);
		self
	}
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
	/// The checker's external dependency failed (moderation API, resolver).
	#[error("check dependency failed: {0}")]
	Dependency(#[source] anyhow::Error),
}

/// A content predicate. Checks are pure with respect to the transaction: they
/// read the extracted text and produce a verdict.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
	/// Uppercase label rendered as the error body `type`, e.g. `URL_GUARDRAIL`.
	fn kind(&self) -> Strng;
	async fn validate(&self, text: &str) -> Result<Verdict, CheckError>;
}

/// Options shared by every guardrail, configured per direction.
#[apply(schema_de!)]
#[derive(Default)]
pub struct GuardrailCommon {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	/// Pass iff the check failed.
	#[serde(default)]
	pub invert: bool,
	/// Include per-check details in the error body.
	#[serde(default)]
	pub show_assessment: bool,
	/// Let traffic through when extraction or the check's dependency fails.
	#[serde(default)]
	pub passthrough_on_error: bool,
}

/// One direction of a guardrail: extract, check, invert, decide.
pub struct DirectionalGuard {
	pub common: GuardrailCommon,
	pub check: Arc<dyn Check>,
}

impl DirectionalGuard {
	pub fn new(common: GuardrailCommon, check: Arc<dyn Check>) -> Self {
		DirectionalGuard { common, check }
	}

	/// Returns the intervention to emit, if any.
	pub async fn evaluate(&self, direction: Direction, body: &[u8]) -> Option<Intervention> {
		let kind = self.check.kind();
		let text = match crate::jsonpath::extract_or_body(self.common.json_path.as_ref(), body) {
			Ok(t) => t,
			Err(err) => {
				if self.common.passthrough_on_error {
					debug!(guardrail = %kind, %err, "extraction failed, passing through");
					return None;
				}
				let status = match err {
					PathError::NotFound(_) | PathError::InvalidJson(_) | PathError::InvalidUtf8 => {
						StatusCode::UNPROCESSABLE_ENTITY
					},
					PathError::InvalidSegment(_) => StatusCode::INTERNAL_SERVER_ERROR,
				};
				return Some(
					Intervention::new(kind, direction, format!("payload extraction failed: {err}"))
						.with_status(status),
				);
			},
		};
		let verdict = match self.check.validate(&text).await {
			Ok(v) => v,
			Err(err) => {
				if self.common.passthrough_on_error {
					warn!(guardrail = %kind, %err, "check failed, passing through");
					return None;
				}
				return Some(
					Intervention::new(kind, direction, format!("guardrail evaluation failed: {err}"))
						.with_status(StatusCode::INTERNAL_SERVER_ERROR),
				);
			},
		};
		let blocked = if self.common.invert {
			verdict.passed
		} else {
			!verdict.passed
		};
		if !blocked {
			return None;
		}
		let reason = if self.common.invert && verdict.passed {
			"content matched when it must not".to_string()
		} else {
			verdict.reason
		};
		let assessments = if self.common.show_assessment {
			verdict.assessment
		} else {
			None
		};
		Some(Intervention::new(kind, direction, reason).with_assessments(assessments))
	}
}

/// A guardrail attached to a route: independent request and response
/// directions over the same check type.
pub struct Guardrail {
	name: Strng,
	request: Option<DirectionalGuard>,
	response: Option<DirectionalGuard>,
}

impl Guardrail {
	pub fn new(name: Strng, request: Option<DirectionalGuard>, response: Option<DirectionalGuard>) -> Self {
		Guardrail {
			name,
			request,
			response,
		}
	}
}

#[async_trait::async_trait]
impl Policy for Guardrail {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn mode(&self) -> ProcessingMode {
		let mut mode = ProcessingMode::passthrough();
		if self.request.is_some() {
			mode = mode.union(ProcessingMode::buffered_request());
		}
		if self.response.is_some() {
			mode = mode.union(ProcessingMode::buffered_response());
		}
		mode
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let Some(guard) = &self.request else {
			return Ok(RequestAction::pass());
		};
		match guard.evaluate(Direction::Request, ctx.body_bytes()).await {
			Some(intervention) => Ok(RequestAction::Direct(intervention.response())),
			None => Ok(RequestAction::pass()),
		}
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		let Some(guard) = &self.response else {
			return Ok(ResponseAction::pass());
		};
		match guard.evaluate(Direction::Response, ctx.body_bytes()).await {
			Some(intervention) => Ok(ResponseAction::Direct(intervention.response())),
			None => Ok(ResponseAction::pass()),
		}
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use super::*;

	pub struct StaticCheck {
		pub kind: Strng,
		pub verdict: Verdict,
	}

	#[async_trait::async_trait]
	impl Check for StaticCheck {
		fn kind(&self) -> Strng {
			self.kind.clone()
		}
		async fn validate(&self, _text: &str) -> Result<Verdict, CheckError> {
			Ok(self.verdict.clone())
		}
	}
}

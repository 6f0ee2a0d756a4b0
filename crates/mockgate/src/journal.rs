//! Append-only ring of recorded interactions, powering retrieval and
//! verification.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use serde::Serialize;

use crate::matching;
use crate::types::{
	Action, BodyMatcher, ExpectationDefinition, Interaction, RecordedBody, RecordedResponse,
	RequestFingerprint, RequestMatcher, ResponseDefinition, UseLimit, VerifyTimes,
};

pub struct Journal {
	inner: Mutex<Inner>,
	capacity: usize,
}

struct Inner {
	entries: VecDeque<Interaction>,
	messages: VecDeque<String>,
	next_sequence: u64,
}

/// What `retrieve` should return.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetrieveType {
	Requests,
	Responses,
	RequestResponses,
	RecordedExpectations,
	ActiveExpectations,
	LogMessages,
}

impl FromStr for RetrieveType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"REQUESTS" => Ok(RetrieveType::Requests),
			"RESPONSES" => Ok(RetrieveType::Responses),
			"REQUEST_RESPONSES" => Ok(RetrieveType::RequestResponses),
			"RECORDED_EXPECTATIONS" => Ok(RetrieveType::RecordedExpectations),
			"ACTIVE_EXPECTATIONS" => Ok(RetrieveType::ActiveExpectations),
			"LOG_MESSAGES" => Ok(RetrieveType::LogMessages),
			other => Err(format!("unknown retrieve type {other:?}")),
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Retrieved {
	Requests(Vec<RequestFingerprint>),
	Responses(Vec<RecordedResponse>),
	Interactions(Vec<Interaction>),
	Expectations(Vec<ExpectationDefinition>),
	Messages(Vec<String>),
}

/// A failed verification, rendered for the 406 response body.
#[derive(Debug, thiserror::Error)]
#[error("{report}")]
pub struct VerifyMismatch {
	pub expected: String,
	pub actual: u64,
	pub report: String,
}

impl Journal {
	pub fn new(capacity: usize) -> Journal {
		Journal {
			inner: Mutex::new(Inner {
				entries: VecDeque::new(),
				messages: VecDeque::new(),
				next_sequence: 0,
			}),
			capacity,
		}
	}

	/// Appends a completed interaction. The sequence is assigned here, under
	/// the lock, so sequences are strictly increasing and contiguous in
	/// enqueue order. The oldest entry is evicted once the ring is full.
	pub fn append(&self, mut interaction: Interaction) -> u64 {
		let mut inner = self.inner.lock().expect("mutex acquired");
		let seq = inner.next_sequence;
		inner.next_sequence += 1;
		interaction.sequence = seq;
		inner.entries.push_back(interaction);
		if inner.entries.len() > self.capacity {
			inner.entries.pop_front();
		}
		seq
	}

	/// Records a human-readable event line, retrievable as LOG_MESSAGES.
	pub fn message(&self, msg: impl Into<String>) {
		let mut inner = self.inner.lock().expect("mutex acquired");
		inner.messages.push_back(msg.into());
		if inner.messages.len() > self.capacity {
			inner.messages.pop_front();
		}
	}

	pub fn retrieve(&self, matcher: Option<&RequestMatcher>, what: RetrieveType) -> Retrieved {
		let inner = self.inner.lock().expect("mutex acquired");
		let selected = || {
			inner
				.entries
				.iter()
				.filter(|e| entry_matches(matcher, e))
				.cloned()
				.collect::<Vec<_>>()
		};
		match what {
			RetrieveType::Requests => {
				Retrieved::Requests(selected().into_iter().map(|e| e.request).collect())
			},
			RetrieveType::Responses => {
				Retrieved::Responses(selected().into_iter().filter_map(|e| e.response).collect())
			},
			RetrieveType::RequestResponses => Retrieved::Interactions(selected()),
			RetrieveType::RecordedExpectations => Retrieved::Expectations(
				selected()
					.iter()
					.filter_map(as_recorded_expectation)
					.collect(),
			),
			// The store owns live expectations; the management layer routes
			// ACTIVE_EXPECTATIONS there. Answering it here returns nothing.
			RetrieveType::ActiveExpectations => Retrieved::Expectations(vec![]),
			RetrieveType::LogMessages => {
				Retrieved::Messages(inner.messages.iter().cloned().collect())
			},
		}
	}

	/// Asserts the matcher was seen a bounded number of times. Re-entrant
	/// proxy legs (`via_proxy`) never count.
	pub fn verify(&self, matcher: &RequestMatcher, times: VerifyTimes) -> Result<(), VerifyMismatch> {
		let inner = self.inner.lock().expect("mutex acquired");
		let matched: Vec<&Interaction> = inner
			.entries
			.iter()
			.filter(|e| !e.via_proxy && matching::matches(matcher, &e.request).is_some())
			.collect();
		let count = matched.len() as u64;
		if times.satisfied_by(count) {
			return Ok(());
		}
		let all: Vec<&RequestFingerprint> = inner
			.entries
			.iter()
			.filter(|e| !e.via_proxy)
			.map(|e| &e.request)
			.collect();
		Err(VerifyMismatch {
			expected: times.to_string(),
			actual: count,
			report: format!(
				"Request not found {times} times, expected:\n{}\nbut was:\n{}",
				pretty(matcher),
				pretty(&all),
			),
		})
	}

	/// Asserts the matchers appear in the journal in the given order, not
	/// necessarily contiguously.
	pub fn verify_sequence(&self, matchers: &[RequestMatcher]) -> Result<(), VerifyMismatch> {
		let inner = self.inner.lock().expect("mutex acquired");
		let mut pending = matchers.iter().peekable();
		for entry in inner.entries.iter().filter(|e| !e.via_proxy) {
			let Some(next) = pending.peek() else { break };
			if matching::matches(next, &entry.request).is_some() {
				pending.next();
			}
		}
		let missing = pending.count();
		if missing == 0 {
			return Ok(());
		}
		let all: Vec<&RequestFingerprint> = inner
			.entries
			.iter()
			.filter(|e| !e.via_proxy)
			.map(|e| &e.request)
			.collect();
		Err(VerifyMismatch {
			expected: format!("sequence of {} requests", matchers.len()),
			actual: (matchers.len() - missing) as u64,
			report: format!(
				"Request sequence not found, expected:\n{}\nbut was:\n{}",
				pretty(&matchers),
				pretty(&all),
			),
		})
	}

	/// Removes recorded interactions; a matcher restricts what is dropped.
	pub fn clear(&self, matcher: Option<&RequestMatcher>) {
		let mut inner = self.inner.lock().expect("mutex acquired");
		match matcher {
			None => {
				inner.entries.clear();
				inner.messages.clear();
			},
			Some(m) => inner.entries.retain(|e| matching::matches(m, &e.request).is_none()),
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("mutex acquired").entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

fn entry_matches(matcher: Option<&RequestMatcher>, entry: &Interaction) -> bool {
	matcher.is_none_or(|m| matching::matches(m, &entry.request).is_some())
}

fn pretty<T: Serialize>(value: &T) -> String {
	serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

/// Reconstructs an expectation from a completed exchange: the request pinned
/// down exactly, the recorded response replayed literally.
fn as_recorded_expectation(entry: &Interaction) -> Option<ExpectationDefinition> {
	let response = entry.response.as_ref()?;
	let request = &entry.request;
	let matcher = RequestMatcher {
		method: Some(crate::types::StringMatcher::Exact(request.method.as_str().into())),
		path: Some(crate::types::PathMatcher::try_from(regex::escape(&request.path)).ok()?),
		body: request.body.as_ref().map(|b| match b {
			RecordedBody::Json(v) => BodyMatcher::Json {
				value: v.clone(),
				match_type: Default::default(),
			},
			RecordedBody::Text(t) => BodyMatcher::Text(t.clone()),
			RecordedBody::Binary(b) => BodyMatcher::Bytes(b.clone()),
		}),
		..Default::default()
	};
	Some(ExpectationDefinition {
		id: None,
		request: matcher,
		action: Action::Respond(ResponseDefinition {
			status: response.status,
			reason: response.reason.clone(),
			headers: response
				.headers
				.iter()
				.map(|(name, values)| crate::types::NamedValues {
					name: name.as_str().into(),
					values: values.clone(),
				})
				.collect(),
			body: response.body.clone(),
			delay: None,
		}),
		times: UseLimit::Unlimited,
		time_to_live: None,
	})
}

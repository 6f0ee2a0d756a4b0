use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use mockgate_core::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serdes::{is_default, serde_b64, serde_b64_option, serde_dur, serde_dur_option};

/// Everything matching looks at, captured from a live request. Also the shape
/// persisted in the journal and shipped over the callback channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestFingerprint {
	pub method: String,
	pub path: String,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub query: HashMap<String, Vec<String>>,
	/// Header names are lowercased at capture time.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub headers: HashMap<String, Vec<String>>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub cookies: HashMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<RecordedBody>,
	/// Populated from the matched expectation's path template, if any.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub path_parameters: HashMap<String, String>,
}

impl RequestFingerprint {
	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.get(&name.to_ascii_lowercase())
			.and_then(|v| v.first())
			.map(|s| s.as_str())
	}
}

/// A body at rest. Captured bodies pick the most specific representation:
/// JSON if the content type says so and it parses, UTF-8 text otherwise,
/// base64 bytes as the fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RecordedBody {
	Text(String),
	Json(serde_json::Value),
	Binary(#[serde(with = "serde_b64")] Vec<u8>),
}

impl RecordedBody {
	pub fn capture(content_type: Option<&str>, bytes: &[u8]) -> Option<RecordedBody> {
		if bytes.is_empty() {
			return None;
		}
		if content_type.is_some_and(|ct| ct.contains("json"))
			&& let Ok(v) = serde_json::from_slice::<serde_json::Value>(bytes)
		{
			return Some(RecordedBody::Json(v));
		}
		match std::str::from_utf8(bytes) {
			Ok(s) => Some(RecordedBody::Text(s.to_string())),
			Err(_) => Some(RecordedBody::Binary(bytes.to_vec())),
		}
	}

	pub fn to_bytes(&self) -> Bytes {
		match self {
			RecordedBody::Text(s) => Bytes::from(s.clone()),
			RecordedBody::Json(v) => Bytes::from(serde_json::to_vec(v).unwrap_or_default()),
			RecordedBody::Binary(b) => Bytes::from(b.clone()),
		}
	}

	pub fn content_type(&self) -> Option<&'static str> {
		match self {
			RecordedBody::Json(_) => Some("application/json"),
			RecordedBody::Text(_) => Some("text/plain"),
			RecordedBody::Binary(_) => Some("application/octet-stream"),
		}
	}
}

/// Constraint on a single string value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringMatcher {
	Exact(Strng),
	Prefix(Strng),
	Substring(Strng),
	Regex(#[serde(with = "serde_regex")] regex::Regex),
}

impl StringMatcher {
	pub fn matches(&self, value: &str) -> bool {
		match self {
			StringMatcher::Exact(e) => e.as_str() == value,
			StringMatcher::Prefix(p) => value.starts_with(p.as_str()),
			StringMatcher::Substring(s) => value.contains(s.as_str()),
			StringMatcher::Regex(r) => full_match(r, value),
		}
	}

	/// Method semantics: equality is case-insensitive.
	pub fn matches_method(&self, value: &str) -> bool {
		match self {
			StringMatcher::Exact(e) => e.as_str().eq_ignore_ascii_case(value),
			_ => self.matches(value),
		}
	}
}

/// Regexes match the entire value, not a substring of it.
pub fn full_match(re: &regex::Regex, value: &str) -> bool {
	re.find(value)
		.is_some_and(|m| m.start() == 0 && m.end() == value.len())
}

/// Path constraint. The pattern is either a regex, or a template containing
/// `{name}` parameters where each parameter matches one non-slash segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathMatcher {
	pattern: Strng,
	regex: regex::Regex,
}

impl TryFrom<String> for PathMatcher {
	type Error = anyhow::Error;

	fn try_from(pattern: String) -> anyhow::Result<PathMatcher> {
		let expanded = if pattern.contains('{') {
			expand_path_template(&pattern)?
		} else {
			pattern.clone()
		};
		let regex = regex::Regex::new(&format!("^(?:{expanded})$"))
			.with_context(|| format!("invalid path pattern {pattern:?}"))?;
		Ok(PathMatcher {
			pattern: pattern.into(),
			regex,
		})
	}
}

impl From<PathMatcher> for String {
	fn from(m: PathMatcher) -> String {
		m.pattern.to_string()
	}
}

impl PathMatcher {
	pub fn pattern(&self) -> &str {
		&self.pattern
	}

	/// Returns the captured path parameters on a match, `None` otherwise.
	pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
		let caps = self.regex.captures(path)?;
		let mut params = HashMap::new();
		for name in self.regex.capture_names().flatten() {
			if let Some(m) = caps.name(name) {
				params.insert(name.to_string(), m.as_str().to_string());
			}
		}
		Some(params)
	}
}

fn expand_path_template(pattern: &str) -> anyhow::Result<String> {
	let mut out = String::with_capacity(pattern.len() + 16);
	let mut rest = pattern;
	while let Some(start) = rest.find('{') {
		out.push_str(&regex::escape(&rest[..start]));
		let Some(end) = rest[start..].find('}') else {
			anyhow::bail!("unclosed path parameter in {pattern:?}");
		};
		let name = &rest[start + 1..start + end];
		if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
			anyhow::bail!("invalid path parameter name {name:?}");
		}
		out.push_str(&format!("(?P<{name}>[^/]+)"));
		rest = &rest[start + end + 1..];
	}
	out.push_str(&regex::escape(rest));
	Ok(out)
}

/// Constraint on one named query parameter, header, or cookie. For multi
/// valued keys, at least one of the request's values must satisfy the
/// predicate; keys the matcher does not mention are unconstrained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedMatch {
	pub name: Strng,
	pub value: StringMatcher,
}

/// How a JSON body matcher treats fields absent from the matcher value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JsonMatchType {
	#[default]
	Strict,
	OnlyMatchingFields,
}

/// Constraint on the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BodyMatcher {
	/// Byte-for-byte equality.
	Bytes(#[serde(with = "serde_b64")] Vec<u8>),
	/// UTF-8 string equality.
	Text(String),
	/// Parsed JSON comparison under the given match type.
	Json {
		value: serde_json::Value,
		#[serde(default, skip_serializing_if = "is_default")]
		match_type: JsonMatchType,
	},
	/// Whitespace-normalized string equality.
	Xml(String),
	/// The whole body, decoded as UTF-8, must match.
	Regex(#[serde(with = "serde_regex")] regex::Regex),
	/// Structural JSON schema subset: type, properties, required, items, enum.
	Schema(serde_json::Value),
	/// Form-urlencoded parameters, same multimap semantics as query strings.
	Parameters(HashMap<String, Vec<String>>),
}

/// Constraint set an expectation applies to incoming requests. Every field is
/// optional; an empty matcher matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestMatcher {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method: Option<StringMatcher>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathMatcher>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub query: Vec<NamedMatch>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<NamedMatch>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub cookies: Vec<NamedMatch>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<BodyMatcher>,
	/// Inverts the whole matcher after all fields evaluate.
	#[serde(default, skip_serializing_if = "is_default")]
	pub not: bool,
}

impl RequestMatcher {
	/// Structural equality, used by `remove(matcher)`. Compiled regexes do not
	/// compare directly, so we compare the serialized forms.
	pub fn same_as(&self, other: &RequestMatcher) -> bool {
		serde_json::to_value(self).ok() == serde_json::to_value(other).ok()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedValues {
	pub name: Strng,
	#[serde(default)]
	pub values: Vec<String>,
}

/// Fixed delay with optional jitter, applied before the first body byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Delay {
	#[serde(with = "serde_dur")]
	pub duration: Duration,
	#[serde(default, with = "serde_dur_option", skip_serializing_if = "Option::is_none")]
	pub jitter: Option<Duration>,
}

impl Delay {
	pub fn effective(&self) -> Duration {
		match self.jitter {
			None => self.duration,
			Some(j) if j.is_zero() => self.duration,
			Some(j) => self.duration + j.mul_f64(rand::rng().random::<f64>()),
		}
	}
}

/// Literal response an expectation serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResponseDefinition {
	#[serde(default = "default_status")]
	pub status: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<NamedValues>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<RecordedBody>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub delay: Option<Delay>,
}

fn default_status() -> u16 {
	200
}

impl Default for ResponseDefinition {
	fn default() -> Self {
		ResponseDefinition {
			status: 200,
			reason: None,
			headers: vec![],
			body: None,
			delay: None,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForwardScheme {
	#[default]
	Http,
	Https,
}

/// Upstream a forward action targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForwardTarget {
	pub host: Strng,
	pub port: u16,
	#[serde(default, skip_serializing_if = "is_default")]
	pub scheme: ForwardScheme,
}

impl ForwardTarget {
	pub fn authority(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl Display for ForwardTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// Fields overlaid onto the original request before an override-forward.
/// Empty fields leave the original untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestOverride {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub method: Option<Strng>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<Strng>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub headers: Vec<NamedValues>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<RecordedBody>,
}

/// Transport-level fault injection. With `drop_connection` the socket closes
/// without a response; `response_bytes` writes the given prefix first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorAction {
	#[serde(default, with = "serde_dur_option", skip_serializing_if = "Option::is_none")]
	pub delay: Option<Duration>,
	#[serde(default = "default_true")]
	pub drop_connection: bool,
	#[serde(default, with = "serde_b64_option", skip_serializing_if = "Option::is_none")]
	pub response_bytes: Option<Vec<u8>>,
}

fn default_true() -> bool {
	true
}

/// What the server does when the expectation matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
	Respond(ResponseDefinition),
	/// Evaluated through a registered template engine.
	RespondTemplate { engine: Strng, template: String },
	Forward(ForwardTarget),
	OverrideForward {
		target: ForwardTarget,
		#[serde(default)]
		overrides: RequestOverride,
	},
	/// Resolved through the in-process callback registry.
	LocalCallback { name: Strng },
	/// Dispatched over the persistent callback channel for `client_id`.
	RemoteCallback { client_id: Strng },
	/// Same as `RemoteCallback` but the client returns a rewritten request,
	/// which is then forwarded to the authority named in its `host` header.
	RemoteForwardCallback { client_id: Strng },
	Error(ErrorAction),
}

/// How many times an expectation may be dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UseLimit {
	#[default]
	Unlimited,
	Limited(u32),
}

/// Wire form of an expectation, as registered over the management API.
/// `deny_unknown_fields` does not compose with the flattened action, so
/// unknown keys are tolerated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectationDefinition {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<Strng>,
	#[serde(default)]
	pub request: RequestMatcher,
	#[serde(flatten)]
	pub action: Action,
	#[serde(default, skip_serializing_if = "is_default")]
	pub times: UseLimit,
	#[serde(default, with = "serde_dur_option", skip_serializing_if = "Option::is_none")]
	pub time_to_live: Option<Duration>,
}

/// A live expectation in the store. The remaining-use counter is shared
/// between the store and every snapshot holding this entry, so concurrent
/// requests race on one atomic and a bounded expectation dispatches at most
/// its configured number of times.
#[derive(Debug)]
pub struct Expectation {
	pub id: Strng,
	pub priority_index: u64,
	pub matcher: RequestMatcher,
	pub action: Action,
	remaining: Option<AtomicI64>,
	pub expires_at: Option<Instant>,
}

impl Expectation {
	pub fn new(def: ExpectationDefinition, id: Strng, priority_index: u64) -> Expectation {
		let remaining = match def.times {
			UseLimit::Unlimited => None,
			UseLimit::Limited(n) => Some(AtomicI64::new(n as i64)),
		};
		Expectation {
			id,
			priority_index,
			matcher: def.request,
			action: def.action,
			remaining,
			expires_at: def.time_to_live.map(|ttl| Instant::now() + ttl),
		}
	}

	/// Consumes one use. Returns false once the budget is exhausted; exactly
	/// `n` callers observe true for a limit of `n`, across threads.
	pub fn try_consume(&self) -> bool {
		let Some(remaining) = &self.remaining else {
			return true;
		};
		remaining
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
				if n > 0 { Some(n - 1) } else { None }
			})
			.is_ok()
	}

	/// True once a bounded expectation has handed out its last use.
	pub fn exhausted(&self) -> bool {
		self
			.remaining
			.as_ref()
			.is_some_and(|r| r.load(Ordering::Acquire) <= 0)
	}

	pub fn is_expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|at| at <= now)
	}

	pub fn definition(&self) -> ExpectationDefinition {
		let times = match &self.remaining {
			None => UseLimit::Unlimited,
			Some(r) => UseLimit::Limited(r.load(Ordering::Acquire).max(0) as u32),
		};
		ExpectationDefinition {
			id: Some(self.id.clone()),
			request: self.matcher.clone(),
			action: self.action.clone(),
			times,
			time_to_live: None,
		}
	}
}

/// Response captured into the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordedResponse {
	pub status: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub headers: HashMap<String, Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<RecordedBody>,
}

/// One completed exchange. `sequence` is assigned when the request is
/// accepted, so journal order reflects arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
	pub sequence: u64,
	pub received_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expectation_id: Option<Strng>,
	pub request: RequestFingerprint,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response: Option<RecordedResponse>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub forwarded_request: Option<RequestFingerprint>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub forwarded_response: Option<RecordedResponse>,
	/// Set on the re-entrant leg of a forward that targeted this same server.
	/// Such entries are journaled but not counted by verifications.
	#[serde(default, skip_serializing_if = "is_default")]
	pub via_proxy: bool,
}

/// Occurrence bounds for a verification. `exactly(n)` is `{n, n}`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyTimes {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub at_least: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub at_most: Option<u64>,
}

impl VerifyTimes {
	pub fn exactly(n: u64) -> VerifyTimes {
		VerifyTimes {
			at_least: Some(n),
			at_most: Some(n),
		}
	}

	pub fn at_least(n: u64) -> VerifyTimes {
		VerifyTimes {
			at_least: Some(n),
			at_most: None,
		}
	}

	pub fn satisfied_by(&self, count: u64) -> bool {
		self.at_least.is_none_or(|n| count >= n) && self.at_most.is_none_or(|n| count <= n)
	}
}

impl Display for VerifyTimes {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match (self.at_least, self.at_most) {
			(Some(a), Some(b)) if a == b => write!(f, "exactly {a}"),
			(Some(a), Some(b)) => write!(f, "between {a} and {b}"),
			(Some(a), None) => write!(f, "at least {a}"),
			(None, Some(b)) => write!(f, "at most {b}"),
			(None, None) => write!(f, "any number of"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_template_compiles_and_captures() {
		let m = PathMatcher::try_from("/users/{id}/posts/{post_id}".to_string()).unwrap();
		let params = m.matches("/users/42/posts/seven").unwrap();
		assert_eq!(params["id"], "42");
		assert_eq!(params["post_id"], "seven");
		assert!(m.matches("/users/42").is_none());
		assert!(m.matches("/users/a/b/posts/c").is_none());
	}

	#[test]
	fn path_regex_is_anchored() {
		let m = PathMatcher::try_from("/hello".to_string()).unwrap();
		assert!(m.matches("/hello").is_some());
		assert!(m.matches("/hello/world").is_none());
		assert!(m.matches("/prefix/hello").is_none());
	}

	#[test]
	fn invalid_path_template_is_rejected() {
		assert!(PathMatcher::try_from("/users/{".to_string()).is_err());
		assert!(PathMatcher::try_from("/users/{bad-name}".to_string()).is_err());
	}

	#[test]
	fn bounded_uses_hand_out_exactly_n() {
		let def = ExpectationDefinition {
			id: None,
			request: RequestMatcher::default(),
			action: Action::Respond(ResponseDefinition::default()),
			times: UseLimit::Limited(3),
			time_to_live: None,
		};
		let e = Expectation::new(def, "e1".into(), 0);
		assert!(e.try_consume());
		assert!(e.try_consume());
		assert!(e.try_consume());
		assert!(!e.try_consume());
		assert!(e.exhausted());
	}

	#[test]
	fn expectation_wire_shape() {
		let raw = r#"{
			"request": { "method": { "exact": "GET" }, "path": "/hello" },
			"respond": { "status": 200, "body": { "text": "hi" } },
			"times": { "limited": 1 }
		}"#;
		let def: ExpectationDefinition = serde_json::from_str(raw).unwrap();
		assert!(matches!(def.action, Action::Respond(_)));
		assert_eq!(def.times, UseLimit::Limited(1));
		let back = serde_json::to_value(&def).unwrap();
		assert_eq!(back["respond"]["status"], 200);
	}

	#[test]
	fn verify_times_bounds() {
		assert!(VerifyTimes::exactly(2).satisfied_by(2));
		assert!(!VerifyTimes::exactly(2).satisfied_by(1));
		assert!(VerifyTimes::at_least(1).satisfied_by(5));
		assert!(VerifyTimes::default().satisfied_by(0));
	}
}

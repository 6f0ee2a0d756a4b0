//! Request-to-matcher evaluation. Matching is a pure function of a request
//! fingerprint and a matcher; use accounting lives in the store.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{BodyMatcher, JsonMatchType, RecordedBody, RequestFingerprint, RequestMatcher, full_match};

/// Evaluates `matcher` against `req`. On success returns the captured path
/// parameters (empty unless the path matcher carried `{name}` segments).
/// A negated matcher that "matches" naturally carries no parameters.
pub fn matches(matcher: &RequestMatcher, req: &RequestFingerprint) -> Option<HashMap<String, String>> {
	let mut params = HashMap::new();
	let mut hit = true;

	if let Some(m) = &matcher.method {
		hit &= m.matches_method(&req.method);
	}
	if hit && let Some(p) = &matcher.path {
		match p.matches(&req.path) {
			Some(captured) => params = captured,
			None => hit = false,
		}
	}
	if hit {
		hit = matcher.query.iter().all(|q| {
			req
				.query
				.get(q.name.as_str())
				.is_some_and(|values| values.iter().any(|v| q.value.matches(v)))
		});
	}
	if hit {
		// Header names are case-insensitive; the fingerprint stores them lowercased.
		hit = matcher.headers.iter().all(|h| {
			req
				.headers
				.get(&h.name.to_ascii_lowercase())
				.is_some_and(|values| values.iter().any(|v| h.value.matches(v)))
		});
	}
	if hit {
		hit = matcher.cookies.iter().all(|c| {
			req
				.cookies
				.get(c.name.as_str())
				.is_some_and(|v| c.value.matches(v))
		});
	}
	if hit && let Some(b) = &matcher.body {
		hit = body_matches(b, req.body.as_ref());
	}

	if matcher.not {
		hit = !hit;
		params = HashMap::new();
	}
	hit.then_some(params)
}

fn body_matches(matcher: &BodyMatcher, body: Option<&RecordedBody>) -> bool {
	let Some(body) = body else {
		return false;
	};
	match matcher {
		BodyMatcher::Bytes(expected) => body.to_bytes().as_ref() == expected.as_slice(),
		BodyMatcher::Text(expected) => body_as_text(body).is_some_and(|t| t == *expected),
		BodyMatcher::Json { value, match_type } => {
			let Some(actual) = body_as_json(body) else {
				return false;
			};
			match match_type {
				JsonMatchType::Strict => actual == *value,
				JsonMatchType::OnlyMatchingFields => json_subset(value, &actual),
			}
		},
		BodyMatcher::Xml(expected) => {
			body_as_text(body).is_some_and(|t| normalize_ws(&t) == normalize_ws(expected))
		},
		BodyMatcher::Regex(re) => body_as_text(body).is_some_and(|t| full_match(re, &t)),
		BodyMatcher::Schema(schema) => {
			body_as_json(body).is_some_and(|actual| schema_matches(schema, &actual))
		},
		BodyMatcher::Parameters(expected) => {
			let Some(text) = body_as_text(body) else {
				return false;
			};
			let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&text) else {
				return false;
			};
			let mut actual: HashMap<String, Vec<String>> = HashMap::new();
			for (k, v) in pairs {
				actual.entry(k).or_default().push(v);
			}
			expected.iter().all(|(name, values)| {
				actual
					.get(name)
					.is_some_and(|got| values.iter().all(|v| got.contains(v)))
			})
		},
	}
}

fn body_as_text(body: &RecordedBody) -> Option<String> {
	match body {
		RecordedBody::Text(s) => Some(s.clone()),
		RecordedBody::Json(v) => Some(serde_json::to_string(v).ok()?),
		RecordedBody::Binary(b) => String::from_utf8(b.clone()).ok(),
	}
}

fn body_as_json(body: &RecordedBody) -> Option<Value> {
	match body {
		RecordedBody::Json(v) => Some(v.clone()),
		RecordedBody::Text(s) => serde_json::from_str(s).ok(),
		RecordedBody::Binary(b) => serde_json::from_slice(b).ok(),
	}
}

fn normalize_ws(s: &str) -> String {
	s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Every field present in `expected` must equal the corresponding field in
/// `actual`; extra fields in `actual` objects are permitted. Arrays compare
/// element-wise.
fn json_subset(expected: &Value, actual: &Value) -> bool {
	match (expected, actual) {
		(Value::Object(e), Value::Object(a)) => e
			.iter()
			.all(|(k, ev)| a.get(k).is_some_and(|av| json_subset(ev, av))),
		(Value::Array(e), Value::Array(a)) => {
			e.len() == a.len() && e.iter().zip(a.iter()).all(|(ev, av)| json_subset(ev, av))
		},
		(e, a) => e == a,
	}
}

/// Structural JSON-schema subset: type, enum, const, required, properties,
/// items. Unknown keywords are ignored.
fn schema_matches(schema: &Value, instance: &Value) -> bool {
	let Value::Object(schema) = schema else {
		return false;
	};
	if let Some(t) = schema.get("type") {
		let ok = match t {
			Value::String(name) => type_matches(name, instance),
			Value::Array(names) => names
				.iter()
				.filter_map(|n| n.as_str())
				.any(|n| type_matches(n, instance)),
			_ => false,
		};
		if !ok {
			return false;
		}
	}
	if let Some(Value::Array(options)) = schema.get("enum")
		&& !options.contains(instance)
	{
		return false;
	}
	if let Some(expected) = schema.get("const")
		&& expected != instance
	{
		return false;
	}
	if let Some(Value::Array(required)) = schema.get("required") {
		let Value::Object(obj) = instance else {
			return false;
		};
		if !required
			.iter()
			.filter_map(|r| r.as_str())
			.all(|r| obj.contains_key(r))
		{
			return false;
		}
	}
	if let Some(Value::Object(props)) = schema.get("properties")
		&& let Value::Object(obj) = instance
	{
		for (name, sub) in props {
			if let Some(v) = obj.get(name)
				&& !schema_matches(sub, v)
			{
				return false;
			}
		}
	}
	if let Some(items) = schema.get("items")
		&& let Value::Array(arr) = instance
		&& !arr.iter().all(|v| schema_matches(items, v))
	{
		return false;
	}
	true
}

fn type_matches(name: &str, instance: &Value) -> bool {
	match name {
		"object" => instance.is_object(),
		"array" => instance.is_array(),
		"string" => instance.is_string(),
		"number" => instance.is_number(),
		"integer" => instance.is_i64() || instance.is_u64(),
		"boolean" => instance.is_boolean(),
		"null" => instance.is_null(),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::types::{NamedMatch, PathMatcher, StringMatcher};

	fn request(method: &str, path: &str) -> RequestFingerprint {
		RequestFingerprint {
			method: method.to_string(),
			path: path.to_string(),
			..Default::default()
		}
	}

	fn matcher_json(v: serde_json::Value) -> RequestMatcher {
		serde_json::from_value(v).unwrap()
	}

	#[test]
	fn empty_matcher_matches_anything() {
		let m = RequestMatcher::default();
		assert!(matches(&m, &request("GET", "/x")).is_some());
	}

	#[test]
	fn method_is_case_insensitive() {
		let m = RequestMatcher {
			method: Some(StringMatcher::Exact("get".into())),
			..Default::default()
		};
		assert!(matches(&m, &request("GET", "/")).is_some());
		assert!(matches(&m, &request("POST", "/")).is_none());
	}

	#[test]
	fn path_parameters_are_exposed() {
		let m = RequestMatcher {
			path: Some(PathMatcher::try_from("/pets/{pet}".to_string()).unwrap()),
			..Default::default()
		};
		let params = matches(&m, &request("GET", "/pets/rex")).unwrap();
		assert_eq!(params["pet"], "rex");
	}

	#[test]
	fn query_needs_only_one_matching_value() {
		let mut req = request("GET", "/search");
		req
			.query
			.insert("tag".to_string(), vec!["a".to_string(), "b".to_string()]);
		let m = RequestMatcher {
			query: vec![NamedMatch {
				name: "tag".into(),
				value: StringMatcher::Exact("b".into()),
			}],
			..Default::default()
		};
		assert!(matches(&m, &req).is_some());
	}

	#[test]
	fn unmentioned_keys_are_unconstrained() {
		let mut req = request("GET", "/");
		req
			.headers
			.insert("x-extra".to_string(), vec!["anything".to_string()]);
		assert!(matches(&RequestMatcher::default(), &req).is_some());
	}

	#[test]
	fn header_names_match_case_insensitively() {
		let mut req = request("GET", "/");
		req
			.headers
			.insert("content-type".to_string(), vec!["application/json".to_string()]);
		let m = RequestMatcher {
			headers: vec![NamedMatch {
				name: "Content-Type".into(),
				value: StringMatcher::Substring("json".into()),
			}],
			..Default::default()
		};
		assert!(matches(&m, &req).is_some());
	}

	#[test]
	fn cookie_names_are_case_sensitive() {
		let mut req = request("GET", "/");
		req.cookies.insert("Session".to_string(), "abc".to_string());
		let m = matcher_json(json!({
			"cookies": [{"name": "session", "value": {"exact": "abc"}}]
		}));
		assert!(matches(&m, &req).is_none());
		let m = matcher_json(json!({
			"cookies": [{"name": "Session", "value": {"exact": "abc"}}]
		}));
		assert!(matches(&m, &req).is_some());
	}

	#[test]
	fn strict_json_requires_full_equality() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Json(json!({"a": 1, "b": 2})));
		let m = matcher_json(json!({"body": {"json": {"value": {"a": 1}}}}));
		assert!(matches(&m, &req).is_none());
		let m = matcher_json(json!({"body": {"json": {"value": {"a": 1, "b": 2}}}}));
		assert!(matches(&m, &req).is_some());
	}

	#[test]
	fn only_matching_fields_permits_extras() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Json(json!({"a": 1, "b": {"c": 2, "d": 3}})));
		let m = matcher_json(json!({
			"body": {"json": {"value": {"b": {"c": 2}}, "matchType": "ONLY_MATCHING_FIELDS"}}
		}));
		assert!(matches(&m, &req).is_some());
		let m = matcher_json(json!({
			"body": {"json": {"value": {"b": {"c": 9}}, "matchType": "ONLY_MATCHING_FIELDS"}}
		}));
		assert!(matches(&m, &req).is_none());
	}

	#[test]
	fn regex_body_must_cover_whole_body() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Text("hello world".to_string()));
		let m = matcher_json(json!({"body": {"regex": "hello.*"}}));
		assert!(matches(&m, &req).is_some());
		let m = matcher_json(json!({"body": {"regex": "hello"}}));
		assert!(matches(&m, &req).is_none());
	}

	#[test]
	fn xml_body_ignores_whitespace() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Text("<a>\n  <b>1</b>\n</a>".to_string()));
		let m = matcher_json(json!({"body": {"xml": "<a> <b>1</b> </a>"}}));
		assert!(matches(&m, &req).is_some());
	}

	#[test]
	fn parameter_body_is_a_subset_check() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Text("a=1&a=2&b=3".to_string()));
		let m = matcher_json(json!({"body": {"parameters": {"a": ["2"]}}}));
		assert!(matches(&m, &req).is_some());
		let m = matcher_json(json!({"body": {"parameters": {"a": ["4"]}}}));
		assert!(matches(&m, &req).is_none());
	}

	#[test]
	fn schema_body_checks_structure() {
		let mut req = request("POST", "/");
		req.body = Some(RecordedBody::Json(json!({"name": "x", "age": 3})));
		let m = matcher_json(json!({
			"body": {"schema": {
				"type": "object",
				"required": ["name"],
				"properties": {"age": {"type": "integer"}}
			}}
		}));
		assert!(matches(&m, &req).is_some());
		let m = matcher_json(json!({
			"body": {"schema": {"type": "object", "required": ["missing"]}}
		}));
		assert!(matches(&m, &req).is_none());
	}

	#[test]
	fn not_inverts_the_whole_matcher() {
		let m = matcher_json(json!({"path": "/hello", "not": true}));
		assert!(matches(&m, &request("GET", "/hello")).is_none());
		assert!(matches(&m, &request("GET", "/other")).is_some());
	}

	#[test]
	fn matching_is_deterministic() {
		let m = matcher_json(json!({"method": {"regex": "G.T"}, "path": "/d/.*"}));
		let req = request("GET", "/d/x");
		for _ in 0..100 {
			assert!(matches(&m, &req).is_some());
		}
	}
}

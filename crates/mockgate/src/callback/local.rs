//! In-process callbacks and template evaluators.
//!
//! Actions reference these by opaque name; the registry maps each name to a
//! factory installed at startup. Resolution failures never crash the server,
//! they surface as a load failure on the mock path.

use std::collections::HashMap;
use std::sync::RwLock;

use mockgate_core::prelude::*;

use crate::types::{RequestFingerprint, ResponseDefinition};

/// Answers a matched request in-process.
pub trait ResponseCallback: Send + Sync {
	fn handle(&self, request: &RequestFingerprint) -> anyhow::Result<ResponseDefinition>;
}

/// Plain closures are response callbacks.
impl<F> ResponseCallback for F
where
	F: Fn(&RequestFingerprint) -> ResponseDefinition + Send + Sync,
{
	fn handle(&self, request: &RequestFingerprint) -> anyhow::Result<ResponseDefinition> {
		Ok(self(request))
	}
}

/// Rewrites a matched request before it is forwarded. The rewritten request's
/// `host` header names the forward authority.
pub trait ForwardCallback: Send + Sync {
	fn rewrite(&self, request: RequestFingerprint) -> anyhow::Result<RequestFingerprint>;
}

/// Pure `(template, request) -> response` evaluator. The template language
/// itself is an external collaborator; the literal engine is the only one
/// built in.
pub trait TemplateEngine: Send + Sync {
	fn render(&self, template: &str, request: &RequestFingerprint) -> anyhow::Result<ResponseDefinition>;
}

type ResponseFactory = dyn Fn() -> anyhow::Result<Box<dyn ResponseCallback>> + Send + Sync;
type ForwardFactory = dyn Fn() -> anyhow::Result<Box<dyn ForwardCallback>> + Send + Sync;

#[derive(thiserror::Error, Debug)]
#[error("callback {0:?} could not be loaded: {1}")]
pub struct CallbackLoadFailure(pub Strng, pub String);

/// What a name resolved to.
pub enum LocalHandler {
	Response(Box<dyn ResponseCallback>),
	Forward(Box<dyn ForwardCallback>),
}

impl std::fmt::Debug for LocalHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			LocalHandler::Response(_) => f.write_str("LocalHandler::Response(..)"),
			LocalHandler::Forward(_) => f.write_str("LocalHandler::Forward(..)"),
		}
	}
}

#[derive(Clone, Default)]
pub struct LocalCallbacks {
	inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
	response: HashMap<Strng, Arc<ResponseFactory>>,
	forward: HashMap<Strng, Arc<ForwardFactory>>,
	templates: HashMap<Strng, Arc<dyn TemplateEngine>>,
}

impl LocalCallbacks {
	pub fn new() -> LocalCallbacks {
		let callbacks = LocalCallbacks::default();
		callbacks.register_template("literal", Arc::new(LiteralTemplate));
		callbacks
	}

	pub fn register_response<F>(&self, name: impl Into<Strng>, factory: F)
	where
		F: Fn() -> anyhow::Result<Box<dyn ResponseCallback>> + Send + Sync + 'static,
	{
		self
			.inner
			.write()
			.expect("mutex acquired")
			.response
			.insert(name.into(), Arc::new(factory));
	}

	pub fn register_forward<F>(&self, name: impl Into<Strng>, factory: F)
	where
		F: Fn() -> anyhow::Result<Box<dyn ForwardCallback>> + Send + Sync + 'static,
	{
		self
			.inner
			.write()
			.expect("mutex acquired")
			.forward
			.insert(name.into(), Arc::new(factory));
	}

	pub fn register_template(&self, name: impl Into<Strng>, engine: Arc<dyn TemplateEngine>) {
		self
			.inner
			.write()
			.expect("mutex acquired")
			.templates
			.insert(name.into(), engine);
	}

	/// Instantiates the callback registered under `name`. Response callbacks
	/// take precedence when a name is registered as both.
	pub fn resolve(&self, name: &Strng) -> Result<LocalHandler, CallbackLoadFailure> {
		let inner = self.inner.read().expect("mutex acquired");
		if let Some(factory) = inner.response.get(name) {
			return factory()
				.map(LocalHandler::Response)
				.map_err(|e| CallbackLoadFailure(name.clone(), e.to_string()));
		}
		if let Some(factory) = inner.forward.get(name) {
			return factory()
				.map(LocalHandler::Forward)
				.map_err(|e| CallbackLoadFailure(name.clone(), e.to_string()));
		}
		Err(CallbackLoadFailure(name.clone(), "not registered".to_string()))
	}

	pub fn template_engine(&self, name: &Strng) -> Result<Arc<dyn TemplateEngine>, CallbackLoadFailure> {
		self
			.inner
			.read()
			.expect("mutex acquired")
			.templates
			.get(name)
			.cloned()
			.ok_or_else(|| CallbackLoadFailure(name.clone(), "no such template engine".to_string()))
	}
}

/// Treats the template text as the literal response body.
struct LiteralTemplate;

impl TemplateEngine for LiteralTemplate {
	fn render(&self, template: &str, _request: &RequestFingerprint) -> anyhow::Result<ResponseDefinition> {
		Ok(ResponseDefinition {
			body: Some(crate::types::RecordedBody::Text(template.to_string())),
			..Default::default()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Canned;

	impl ResponseCallback for Canned {
		fn handle(&self, _request: &RequestFingerprint) -> anyhow::Result<ResponseDefinition> {
			Ok(ResponseDefinition {
				status: 207,
				..Default::default()
			})
		}
	}

	#[test]
	fn resolves_registered_response_callbacks() {
		let callbacks = LocalCallbacks::new();
		callbacks.register_response("canned", || Ok(Box::new(Canned)));
		let LocalHandler::Response(cb) = callbacks.resolve(&"canned".into()).unwrap() else {
			panic!("expected a response callback")
		};
		assert_eq!(cb.handle(&Default::default()).unwrap().status, 207);
	}

	#[test]
	fn unknown_names_fail_to_load() {
		let callbacks = LocalCallbacks::new();
		assert!(callbacks.resolve(&"ghost".into()).is_err());
	}

	#[test]
	fn factory_errors_surface_as_load_failures() {
		let callbacks = LocalCallbacks::new();
		callbacks.register_response("broken", || anyhow::bail!("constructor exploded"));
		let err = callbacks.resolve(&"broken".into()).unwrap_err();
		assert!(err.to_string().contains("constructor exploded"));
	}
}

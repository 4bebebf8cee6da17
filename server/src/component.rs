//! Component registry
//!
//! Applications describe their services as [`Component`]s: a service name
//! plus named methods. Routes take the form `Service.Method` and are
//! case-sensitive. Names are validated when a component is registered, so a
//! malformed route can only ever fail at lookup time as "not found".

use crate::error::{Error, Result};
use crate::serializer::Serializer;
use crate::session::Session;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Failure reported by application handler code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError(message)
    }
}

impl From<Error> for HandlerError {
    fn from(error: Error) -> Self {
        HandlerError(error.to_string())
    }
}

/// `Ok(Some(bytes))` is sent back as the response; `Ok(None)` means the
/// handler answered on its own (or the call was a notify).
pub type HandlerResult = std::result::Result<Option<Vec<u8>>, HandlerError>;

pub type Handler = Arc<dyn Fn(Arc<Session>, Vec<u8>) -> BoxFuture<HandlerResult> + Send + Sync>;

pub struct Component {
    name: String,
    methods: HashMap<String, Handler>,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a method working on raw payload bytes. A later method with the
    /// same name replaces the earlier one.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |session, payload| Box::pin(handler(session, payload)));
        self.methods.insert(name.into(), handler);
        self
    }

    /// Adds a method whose request and response are decoded and encoded with
    /// `serializer`. A request that fails to decode becomes a handler error.
    pub fn typed<S, Req, Resp, F, Fut>(self, name: impl Into<String>, serializer: S, handler: F) -> Self
    where
        S: Serializer,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Arc<Session>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Resp>, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.method(name, move |session, payload| {
            let serializer = serializer.clone();
            let handler = Arc::clone(&handler);
            async move {
                let request: Req = serializer.unmarshal(&payload)?;
                match handler(session, request).await? {
                    Some(response) => Ok(Some(serializer.marshal(&response)?)),
                    None => Ok(None),
                }
            }
        })
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Splits `Service.Method` into its two halves.
pub fn split_route(route: &str) -> Result<(&str, &str)> {
    match route.split_once('.') {
        Some((service, method))
            if is_valid_name(service) && is_valid_name(method) =>
        {
            Ok((service, method))
        }
        _ => Err(Error::InvalidRoute(route.to_string())),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Process-local map of services to their handlers. Built before the node
/// starts and read-only afterwards.
#[derive(Default)]
pub struct Components {
    services: HashMap<String, Component>,
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("routes", &self.routes())
            .finish()
    }
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Component) -> Result<()> {
        if !is_valid_name(&component.name) {
            return Err(Error::InvalidRoute(component.name.clone()));
        }
        if let Some(bad) = component.methods.keys().find(|m| !is_valid_name(m)) {
            return Err(Error::InvalidRoute(format!("{}.{}", component.name, bad)));
        }
        if component.methods.is_empty() {
            return Err(Error::Config(format!(
                "component `{}` has no methods",
                component.name
            )));
        }
        if self.services.contains_key(&component.name) {
            return Err(Error::Config(format!(
                "component `{}` is already registered",
                component.name
            )));
        }
        self.services.insert(component.name.clone(), component);
        Ok(())
    }

    pub fn resolve_local(&self, route: &str) -> Option<Handler> {
        let (service, method) = split_route(route).ok()?;
        self.services
            .get(service)
            .and_then(|c| c.methods.get(method))
            .cloned()
    }

    pub fn hosts(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Service names advertised to the rest of the cluster, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .services
            .values()
            .flat_map(|c| {
                c.methods
                    .keys()
                    .map(move |m| format!("{}.{}", c.name, m))
            })
            .collect();
        routes.sort();
        routes
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

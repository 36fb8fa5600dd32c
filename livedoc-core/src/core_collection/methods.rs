/*
    methods.rs - Named method registry (the untrusted call boundary)

    Handlers receive positional JSON arguments, the way an RPC transport
    delivers them. Collections register `/<name>/insertOne`, `updateOne` and
    `deleteOne` here; those handlers always mark the mutation as insecure, no
    matter what the client sent.
*/

use crate::core_collection::collection::Collection;
use crate::core_collection::errors::{CollectionError, CollectionResult};
use crate::core_collection::options::MutationOptions;
use crate::core_doc::{Document, Selector};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Who is calling a method
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodInvocation {
    pub actor_id: Option<String>,
}

impl MethodInvocation {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn as_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
        }
    }
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, invocation: &MethodInvocation, args: Vec<Value>) -> CollectionResult<Value>;
}

/// All methods callable from outside the process
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one handler; a name can only be defined once
    pub fn define(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) -> CollectionResult<()> {
        self.define_all(vec![(name.into(), handler)])
    }

    /// Register several handlers, all or none
    pub fn define_all(&self, handlers: Vec<(String, Arc<dyn MethodHandler>)>) -> CollectionResult<()> {
        let mut methods = match self.methods.write() {
            Ok(methods) => methods,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((name, _)) = handlers.iter().find(|(name, _)| methods.contains_key(name)) {
            return Err(CollectionError::Configuration(format!(
                "A method named '{}' is already defined",
                name
            )));
        }
        for (name, handler) in handlers {
            debug!(method = %name, "method defined");
            methods.insert(name, handler);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self.methods.read() {
            Ok(methods) => methods.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.methods.read() {
            Ok(methods) => methods.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    /// Invoke a method. `args` is a JSON array of positional arguments; any
    /// other value is treated as a single argument.
    pub async fn call(&self, name: &str, invocation: MethodInvocation, args: Value) -> CollectionResult<Value> {
        let handler = match self.methods.read() {
            Ok(methods) => methods.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
        .ok_or_else(|| CollectionError::MethodNotFound(name.to_string()))?;

        let args = match args {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        debug!(method = name, actor = ?invocation.actor_id, "method call");
        handler.call(&invocation, args).await
    }
}

/// Options a client may send with a mutation. Anything else, including a
/// trust flag, is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientMutationOptions {
    upsert: bool,
}

fn arg<T: serde::de::DeserializeOwned>(args: &[Value], index: usize, what: &str) -> CollectionResult<T> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| CollectionError::InvalidArguments(format!("missing {}", what)))?;
    serde_json::from_value(value).map_err(|e| CollectionError::InvalidArguments(format!("{}: {}", what, e)))
}

fn optional_arg<T: serde::de::DeserializeOwned + Default>(args: &[Value], index: usize, what: &str) -> CollectionResult<T> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(_) => arg(args, index, what),
    }
}

fn to_value<T: serde::Serialize>(result: &T) -> CollectionResult<Value> {
    serde_json::to_value(result).map_err(|e| CollectionError::InvalidArguments(e.to_string()))
}

#[derive(Debug, Clone, Copy)]
enum MutationMethod {
    InsertOne,
    UpdateOne,
    DeleteOne,
}

impl MutationMethod {
    fn suffix(self) -> &'static str {
        match self {
            MutationMethod::InsertOne => "insertOne",
            MutationMethod::UpdateOne => "updateOne",
            MutationMethod::DeleteOne => "deleteOne",
        }
    }
}

/// Handler behind `/<collection>/insertOne` and friends
pub(crate) struct CollectionMethod {
    collection: Arc<Collection>,
    method: MutationMethod,
}

impl CollectionMethod {
    /// The three mutation methods for `collection`
    pub(crate) fn all_for(collection: &Arc<Collection>) -> Vec<(String, Arc<dyn MethodHandler>)> {
        [MutationMethod::InsertOne, MutationMethod::UpdateOne, MutationMethod::DeleteOne]
            .into_iter()
            .map(|method| {
                let handler: Arc<dyn MethodHandler> = Arc::new(CollectionMethod {
                    collection: collection.clone(),
                    method,
                });
                (format!("/{}/{}", collection.name(), method.suffix()), handler)
            })
            .collect()
    }
}

#[async_trait]
impl MethodHandler for CollectionMethod {
    async fn call(&self, invocation: &MethodInvocation, args: Vec<Value>) -> CollectionResult<Value> {
        let options = MutationOptions::new().insecure(invocation.actor_id.clone());
        match self.method {
            MutationMethod::InsertOne => {
                let doc: Document = arg(&args, 0, "document")?;
                to_value(&self.collection.insert_one(doc, options).await?)
            }
            MutationMethod::UpdateOne => {
                let selector = Selector::new(arg(&args, 0, "selector")?);
                let mutator: Value = arg(&args, 1, "mutator")?;
                let client: ClientMutationOptions = optional_arg(&args, 2, "options")?;
                let options = MutationOptions { upsert: client.upsert, ..options };
                to_value(&self.collection.update_one(&selector, &mutator, options).await?)
            }
            MutationMethod::DeleteOne => {
                let selector = Selector::new(arg(&args, 0, "selector")?);
                let _client: ClientMutationOptions = optional_arg(&args, 1, "options")?;
                to_value(&self.collection.delete_one(&selector, options).await?)
            }
        }
    }
}

//! Scripted live-query sessions
//!
//! A script is JSON lines, one mutation per line. Every change event the
//! observer delivers is written to the output as one JSON line.

use anyhow::{Context, Result};
use livedoc_core::core_collection::{FindOptions, LiveDb, MethodInvocation, MutationOptions};
use livedoc_core::core_doc::{DocId, Document, Selector};
use livedoc_core::core_observe::{ChangeCallbacks, ChangeEvent, DriverKind, ObserveOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One line of a script
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ScriptOp {
    Insert {
        doc: Document,
        #[serde(flatten)]
        caller: Caller,
    },
    Update {
        selector: Value,
        mutator: Value,
        #[serde(default)]
        upsert: bool,
        #[serde(flatten)]
        caller: Caller,
    },
    Remove {
        selector: Value,
        #[serde(flatten)]
        caller: Caller,
    },
}

/// Who runs a line: trusted code by default, or a client through the
/// method boundary
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Caller {
    #[serde(default)]
    pub untrusted: bool,
    pub actor: Option<String>,
}

/// Parse a whole script, skipping blank lines and `#` comments
pub fn parse_script(source: &str) -> Result<Vec<ScriptOp>> {
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| serde_json::from_str(line).with_context(|| format!("script line {}", n + 1)))
        .collect()
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct Session {
    pub collection: String,
    pub selector: Selector,
    pub driver: Option<DriverKind>,
    /// Quiet period that ends the session once the script has run
    pub settle: Duration,
}

fn event_sink(tx: mpsc::UnboundedSender<ChangeEvent>) -> ChangeCallbacks {
    let added = tx.clone();
    let changed = tx.clone();
    ChangeCallbacks::new()
        .added(move |id: &DocId, fields| {
            let _ = added.send(ChangeEvent::Added { id: id.clone(), fields: fields.clone() });
        })
        .changed(move |id: &DocId, fields| {
            let _ = changed.send(ChangeEvent::Changed { id: id.clone(), fields: fields.clone() });
        })
        .removed(move |id: &DocId| {
            let _ = tx.send(ChangeEvent::Removed { id: id.clone() });
        })
}

async fn call(db: &LiveDb, collection: &str, method: &str, caller: Caller, args: Value) -> Result<Value> {
    let invocation = MethodInvocation { actor_id: caller.actor };
    Ok(db.call(&format!("/{}/{}", collection, method), invocation, args).await?)
}

/// Run one op, trusted or through the method boundary
async fn apply(db: &LiveDb, collection: &str, op: ScriptOp) -> Result<Value> {
    let items = db
        .get(collection)
        .with_context(|| format!("no collection named {}", collection))?;
    let result = match op {
        ScriptOp::Insert { doc, caller } if caller.untrusted => {
            call(db, collection, "insertOne", caller, json!([doc])).await?
        }
        ScriptOp::Insert { doc, .. } => serde_json::to_value(items.insert_one(doc, MutationOptions::new()).await?)?,
        ScriptOp::Update { selector, mutator, upsert, caller } if caller.untrusted => {
            call(db, collection, "updateOne", caller, json!([selector, mutator, {"upsert": upsert}])).await?
        }
        ScriptOp::Update { selector, mutator, upsert, .. } => {
            let options = MutationOptions { upsert, ..MutationOptions::new() };
            serde_json::to_value(items.update_one(&Selector::new(selector), &mutator, options).await?)?
        }
        ScriptOp::Remove { selector, caller } if caller.untrusted => {
            call(db, collection, "deleteOne", caller, json!([selector])).await?
        }
        ScriptOp::Remove { selector, .. } => {
            serde_json::to_value(items.delete_one(&Selector::new(selector), MutationOptions::new()).await?)?
        }
    };
    debug!(%result, "op applied");
    Ok(result)
}

/// Observe the session's query, run every op and write events to `out`.
/// Returns the number of events written.
pub async fn run<W: Write>(db: &LiveDb, session: &Session, ops: Vec<ScriptOp>, out: &mut W) -> Result<usize> {
    let items = match db.get(&session.collection) {
        Some(items) => items,
        None => db.collection(&session.collection)?,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ObserveOptions::new();
    options.driver = session.driver;
    let handle = items
        .find(session.selector.clone(), FindOptions::new())
        .observe_changes(event_sink(tx), options)
        .await?;
    debug!(driver = %handle.driver(), "observing");

    let mut written = 0;
    while let Ok(event) = rx.try_recv() {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
        written += 1;
    }

    for (n, op) in ops.into_iter().enumerate() {
        if let Err(e) = apply(db, &session.collection, op).await {
            warn!(line = n + 1, error = %e, "script op failed");
            writeln!(out, "{}", json!({"error": e.to_string(), "op": n + 1}))?;
        }
    }

    while let Ok(Some(event)) = tokio::time::timeout(session.settle, rx.recv()).await {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
        written += 1;
    }
    handle.stop().await;
    Ok(written)
}

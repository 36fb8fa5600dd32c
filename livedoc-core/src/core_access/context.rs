/*
    context.rs - Per-collection validation state

    Holds the allow/deny validators for each operation kind and the fetch
    projection they need. Written while rules are registered, read on every
    untrusted mutation.

    Policy for every operation:
    - any deny validator returning true rejects the mutation
    - otherwise a restricted collection needs at least one allow validator
      returning true (zero allow validators always rejects)
    - an unrestricted collection accepts, unless `insecure` is set to false
*/

use crate::core_access::errors::{AccessError, AccessResult};
use crate::core_access::projection::ProjectionAccumulator;
use crate::core_access::rules::{
    DocTransform, InsertValidator, OperationKind, Polarity, RemoveValidator, TransformOption, UpdateValidator,
    ValidatorRules,
};
use crate::core_doc::{mutator, top_level, DocId, Document, IdGeneration, Projection, Selector, ID_FIELD};
use crate::metrics::{self, Timer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

const ALLOWED_UPDATE_OPERATIONS: &[&str] = &[
    "$inc", "$set", "$unset", "$addToSet", "$pop", "$pullAll", "$pull", "$pushAll", "$push", "$bit",
];

const NO_REPLACE_ERROR: &str = "Access denied. In a restricted collection you can only update documents, \
     not replace them. Use a Mongo update operator, such as '$set'.";

fn handle_poison<T>(_err: PoisonError<T>) -> AccessError {
    AccessError::Configuration("validation state lock poisoned".to_string())
}

struct Registered<F> {
    check: F,
    transform: Option<DocTransform>,
}

impl<F: Clone> Clone for Registered<F> {
    fn clone(&self) -> Self {
        Registered {
            check: self.check.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<F> Registered<F> {
    fn view(&self, doc: &Document) -> Document {
        match &self.transform {
            Some(t) => t(doc.clone()),
            None => doc.clone(),
        }
    }
}

struct ValidatorSet<F> {
    allow: Vec<Registered<F>>,
    deny: Vec<Registered<F>>,
}

impl<F> Default for ValidatorSet<F> {
    fn default() -> Self {
        ValidatorSet {
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

impl<F: Clone> ValidatorSet<F> {
    fn push(&mut self, polarity: Polarity, entry: Registered<F>) {
        match polarity {
            Polarity::Allow => self.allow.push(entry),
            Polarity::Deny => self.deny.push(entry),
        }
    }

    fn snapshot(&self) -> (Vec<Registered<F>>, Vec<Registered<F>>) {
        (self.deny.clone(), self.allow.clone())
    }
}

#[derive(Default)]
struct ValidationState {
    restricted: bool,
    insecure: Option<bool>,
    insert: ValidatorSet<InsertValidator>,
    update: ValidatorSet<UpdateValidator>,
    remove: ValidatorSet<RemoveValidator>,
    fetch: ProjectionAccumulator,
}

/// Allow/deny state owned by one collection
pub struct ValidationContext {
    collection: String,
    default_transform: Option<DocTransform>,
    state: RwLock<ValidationState>,
}

impl ValidationContext {
    pub fn new(collection: impl Into<String>, default_transform: Option<DocTransform>) -> Self {
        ValidationContext {
            collection: collection.into(),
            default_transform,
            state: RwLock::new(ValidationState::default()),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Register one `allow` or `deny` rule set
    pub fn register(&self, polarity: Polarity, rules: ValidatorRules) -> AccessResult<()> {
        if let Some(fetch) = &rules.fetch {
            if fetch.iter().any(|f| f.is_empty()) {
                return Err(AccessError::Configuration(format!(
                    "{}: fetch field names must not be empty",
                    polarity.as_str()
                )));
            }
        }

        let transform = match &rules.transform {
            TransformOption::Inherit => self.default_transform.clone(),
            TransformOption::Disabled => None,
            TransformOption::Custom(t) => Some(t.clone()),
        };

        let mut state = self.state.write().map_err(handle_poison)?;
        state.restricted = true;

        if let Some(check) = rules.insert.clone() {
            state.insert.push(polarity, Registered { check, transform: transform.clone() });
        }
        if let Some(check) = rules.update.clone() {
            state.update.push(polarity, Registered { check, transform: transform.clone() });
        }
        if let Some(check) = rules.remove.clone() {
            state.remove.push(polarity, Registered { check, transform });
        }
        if rules.affects_fetch() {
            match &rules.fetch {
                Some(fields) => state.fetch.add_fields(fields.iter().map(|f| top_level(f).to_string())),
                None => state.fetch.add_all_fields(),
            }
        }

        debug!(
            collection = %self.collection,
            polarity = polarity.as_str(),
            rules = ?rules,
            "registered validators"
        );
        Ok(())
    }

    /// Override the unrestricted-collection default
    pub fn set_insecure(&self, insecure: Option<bool>) -> AccessResult<()> {
        self.state.write().map_err(handle_poison)?.insecure = insecure;
        Ok(())
    }

    pub fn is_restricted(&self) -> AccessResult<bool> {
        Ok(self.state.read().map_err(handle_poison)?.restricted)
    }

    /// Projection used to fetch the pre-image handed to update/remove validators
    pub fn fetch_projection(&self) -> AccessResult<Option<Projection>> {
        Ok(self.state.read().map_err(handle_poison)?.fetch.current_projection())
    }

    fn unrestricted_outcome(&self, kind: OperationKind) -> AccessResult<Option<bool>> {
        let state = self.state.read().map_err(handle_poison)?;
        if state.restricted {
            return Ok(None);
        }
        let allowed = state.insecure.unwrap_or(true);
        self.record(kind, allowed);
        Ok(Some(allowed))
    }

    fn record(&self, kind: OperationKind, allowed: bool) {
        if allowed {
            metrics::access_allowed(kind.as_str());
        } else {
            metrics::access_denied(kind.as_str());
            debug!(collection = %self.collection, operation = kind.as_str(), "access denied");
        }
    }

    fn decide(&self, kind: OperationKind, deny_hit: bool, allow_hit: bool) -> AccessResult<()> {
        let allowed = !deny_hit && allow_hit;
        self.record(kind, allowed);
        if allowed {
            Ok(())
        } else {
            Err(AccessError::denied())
        }
    }

    /// Authorize an untrusted insert.
    ///
    /// Validators see the document with a generated `_id` when it had none;
    /// the id is only written into the returned document once every check
    /// passed.
    pub fn authorize_insert(
        &self,
        doc: Document,
        actor: Option<&str>,
        id_generation: &IdGeneration,
    ) -> AccessResult<Document> {
        let timer = Timer::new("access.authorize.duration_ms");
        let generated = match DocId::of(&doc) {
            Some(_) => None,
            None => Some(id_generation.generate()),
        };

        let with_generated = |mut d: Document| {
            if let Some(id) = &generated {
                d.insert(ID_FIELD.to_string(), id.to_value());
            }
            d
        };

        match self.unrestricted_outcome(OperationKind::Insert)? {
            Some(true) => {
                timer.stop();
                return Ok(with_generated(doc));
            }
            Some(false) => {
                timer.stop();
                return Err(AccessError::denied());
            }
            None => {}
        }

        let (deny, allow) = self.state.read().map_err(handle_poison)?.insert.snapshot();
        let candidate = with_generated(doc.clone());

        let deny_hit = deny.iter().any(|v| (v.check)(actor, &v.view(&candidate)));
        let allow_hit = !deny_hit && allow.iter().any(|v| (v.check)(actor, &v.view(&candidate)));
        let outcome = self.decide(OperationKind::Insert, deny_hit, allow_hit);
        timer.stop();
        outcome?;

        Ok(with_generated(doc))
    }

    /// Authorize an untrusted update of the document `fetched`
    pub fn authorize_update(
        &self,
        selector: &Selector,
        mutator: &Value,
        upsert: bool,
        actor: Option<&str>,
        fetched: Option<&Document>,
    ) -> AccessResult<()> {
        let timer = Timer::new("access.authorize.duration_ms");
        let fields = check_update_shape(selector, mutator, upsert).inspect_err(|_| {
            metrics::access_denied(OperationKind::Update.as_str());
        })?;

        match self.unrestricted_outcome(OperationKind::Update)? {
            Some(true) => {
                timer.stop();
                return Ok(());
            }
            Some(false) => {
                timer.stop();
                return Err(AccessError::denied());
            }
            None => {}
        }

        let Some(doc) = fetched else {
            self.record(OperationKind::Update, false);
            timer.stop();
            return Err(AccessError::denied_because("document not found"));
        };

        let (deny, allow) = self.state.read().map_err(handle_poison)?.update.snapshot();
        let deny_hit = deny.iter().any(|v| (v.check)(actor, &v.view(doc), &fields, mutator));
        let allow_hit = !deny_hit && allow.iter().any(|v| (v.check)(actor, &v.view(doc), &fields, mutator));
        let outcome = self.decide(OperationKind::Update, deny_hit, allow_hit);
        timer.stop();
        outcome
    }

    /// Authorize an untrusted removal of the document `fetched`
    pub fn authorize_remove(
        &self,
        selector: &Selector,
        actor: Option<&str>,
        fetched: Option<&Document>,
    ) -> AccessResult<()> {
        let timer = Timer::new("access.authorize.duration_ms");
        if selector.single_id().is_none() {
            metrics::access_denied(OperationKind::Remove.as_str());
            return Err(AccessError::unsupported(
                "Access denied. Removals in a restricted collection must target a single id.",
            ));
        }

        match self.unrestricted_outcome(OperationKind::Remove)? {
            Some(true) => {
                timer.stop();
                return Ok(());
            }
            Some(false) => {
                timer.stop();
                return Err(AccessError::denied());
            }
            None => {}
        }

        let Some(doc) = fetched else {
            self.record(OperationKind::Remove, false);
            timer.stop();
            return Err(AccessError::denied_because("document not found"));
        };

        let (deny, allow) = self.state.read().map_err(handle_poison)?.remove.snapshot();
        let deny_hit = deny.iter().any(|v| (v.check)(actor, &v.view(doc)));
        let allow_hit = !deny_hit && allow.iter().any(|v| (v.check)(actor, &v.view(doc)));
        let outcome = self.decide(OperationKind::Remove, deny_hit, allow_hit);
        timer.stop();
        outcome
    }
}

impl std::fmt::Debug for ValidationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationContext")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

/// Structural checks every untrusted update goes through before validators.
///
/// Returns the changed top-level field names.
fn check_update_shape(selector: &Selector, mutator: &Value, upsert: bool) -> AccessResult<Vec<String>> {
    if selector.single_id().is_none() {
        return Err(AccessError::unsupported(
            "Access denied. Updates in a restricted collection must target a single id.",
        ));
    }
    if upsert {
        return Err(AccessError::unsupported(
            "Access denied. Upserts not allowed in a restricted collection.",
        ));
    }
    let ops = mutator
        .as_object()
        .ok_or_else(|| AccessError::unsupported(NO_REPLACE_ERROR))?;
    if mutator::is_replacement(mutator) {
        return Err(AccessError::unsupported(NO_REPLACE_ERROR));
    }

    let mut fields = BTreeSet::new();
    for (op, params) in ops {
        if !ALLOWED_UPDATE_OPERATIONS.contains(&op.as_str()) {
            return Err(AccessError::unsupported(format!(
                "Access denied. Operator {} not allowed in a restricted collection.",
                op
            )));
        }
        if let Some(params) = params.as_object() {
            fields.extend(params.keys().map(|f| top_level(f).to_string()));
        }
    }
    Ok(fields.into_iter().collect())
}
